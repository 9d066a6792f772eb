//! History aggregation: summary metrics from per-epoch series, and
//! flattening of nested result documents into single-level rows.

use serde_json::{Map, Value};

use hs_types::{History, HsError, HsResult, Metrics};

/// Summary metrics of a history.
///
/// For a single run this is the last value of every tracked series. For a
/// k-fold history it is the arithmetic mean of each series' last value
/// across folds; every fold must track the same series as the first one.
pub fn summarize(history: &History) -> HsResult<Metrics> {
    match history {
        History::Single(hist) => hist.loss.last_values(),
        History::KFold(folds) => {
            let per_fold = folds
                .iter()
                .map(|hist| hist.loss.last_values())
                .collect::<HsResult<Vec<_>>>()?;
            mean_metrics(&per_fold)
        }
    }
}

/// Element-wise mean of a list of metric maps, keyed by the first map.
pub fn mean_metrics(list: &[Metrics]) -> HsResult<Metrics> {
    let first = list
        .first()
        .ok_or_else(|| HsError::corrupted("cannot average an empty list of metrics"))?;

    first
        .keys()
        .map(|name| {
            let mut sum = 0.0;
            for (i, metrics) in list.iter().enumerate() {
                sum += metrics.get(name).ok_or_else(|| {
                    HsError::corrupted(format!("metric `{name}` missing from fold {i}"))
                })?;
            }
            Ok((name.clone(), sum / list.len() as f64))
        })
        .collect()
}

/// Flatten nested objects into one level, joining keys with `separator`.
///
/// Leaf values, arrays included, are copied as they are. An empty nested
/// object contributes no keys.
pub fn flatten(map: &Map<String, Value>, separator: &str) -> Map<String, Value> {
    let mut out = Map::new();
    flatten_into(&mut out, None, map, separator);
    out
}

fn flatten_into(
    out: &mut Map<String, Value>,
    prefix: Option<&str>,
    map: &Map<String, Value>,
    separator: &str,
) {
    for (key, value) in map {
        let full_key = match prefix {
            Some(prefix) => format!("{prefix}{separator}{key}"),
            None => key.clone(),
        };
        match value {
            Value::Object(inner) => flatten_into(out, Some(&full_key), inner, separator),
            leaf => {
                out.insert(full_key, leaf.clone());
            }
        }
    }
}

/// Copy of `map` without `keys`. Keys that are not present are ignored.
pub fn delete_keys(map: &Map<String, Value>, keys: &[&str]) -> Map<String, Value> {
    map.iter()
        .filter(|(key, _)| !keys.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}
