//! Flat tabular views of an experiment, exportable through Arrow.

use arrow::array::{ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use parquet::arrow::ArrowWriter;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;

use hs_types::{HsError, HsResult};

/// Rows of JSON scalars under an ordered set of columns.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Map<String, Value>>,
}

impl Table {
    /// Build a table whose columns are `first` followed by every other key
    /// in order of first appearance across `rows`.
    pub fn from_rows(rows: Vec<Map<String, Value>>, first: &[&str]) -> Self {
        let mut columns: Vec<String> = first.iter().map(|c| c.to_string()).collect();
        for row in &rows {
            for key in row.keys() {
                if !columns.iter().any(|c| c == key) {
                    columns.push(key.clone());
                }
            }
        }
        Self { columns, rows }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Map<String, Value>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Cell value; `None` for missing cells and unknown columns.
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        self.rows.get(row)?.get(column).filter(|v| !v.is_null())
    }

    /// All values of one column, `None` where the cell is missing.
    pub fn column(&self, column: &str) -> Vec<Option<&Value>> {
        (0..self.rows.len()).map(|i| self.get(i, column)).collect()
    }

    /// Convert to an Arrow record batch.
    ///
    /// Column types are inferred from the non-null cells: booleans, integers,
    /// floats, and UTF-8 for anything else (non-string values are written as
    /// JSON text).
    pub fn to_record_batch(&self) -> HsResult<RecordBatch> {
        let mut fields = Vec::with_capacity(self.columns.len());
        let mut arrays: Vec<ArrayRef> = Vec::with_capacity(self.columns.len());

        for name in &self.columns {
            let cells = self.column(name);
            let (data_type, array) = build_column(&cells);
            fields.push(Field::new(name, data_type, true));
            arrays.push(array);
        }

        let options = RecordBatchOptions::new().with_row_count(Some(self.rows.len()));
        RecordBatch::try_new_with_options(Arc::new(Schema::new(fields)), arrays, &options)
            .map_err(|e| HsError::Arrow(e.to_string()))
    }

    /// Write the table as a single-row-group Parquet file.
    pub fn write_parquet(&self, path: &Path) -> HsResult<()> {
        let batch = self.to_record_batch()?;
        let file = std::fs::File::create(path)?;
        let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
            .map_err(|e| HsError::Parquet(e.to_string()))?;
        writer
            .write(&batch)
            .map_err(|e| HsError::Parquet(e.to_string()))?;
        writer
            .close()
            .map_err(|e| HsError::Parquet(e.to_string()))?;
        tracing::info!("Wrote {} rows to {}", batch.num_rows(), path.display());
        Ok(())
    }

    /// Write the table as CSV with a header line.
    pub fn write_csv(&self, path: &Path) -> HsResult<()> {
        let batch = self.to_record_batch()?;
        let file = std::fs::File::create(path)?;
        let mut writer = arrow::csv::Writer::new(file);
        writer
            .write(&batch)
            .map_err(|e| HsError::Arrow(e.to_string()))?;
        tracing::info!("Wrote {} rows to {}", batch.num_rows(), path.display());
        Ok(())
    }
}

fn build_column(cells: &[Option<&Value>]) -> (DataType, ArrayRef) {
    let present = || cells.iter().flatten();

    if present().all(|v| v.is_boolean()) && present().next().is_some() {
        let values: Vec<Option<bool>> = cells.iter().map(|c| c.and_then(Value::as_bool)).collect();
        return (DataType::Boolean, Arc::new(BooleanArray::from(values)));
    }
    if present().all(|v| v.is_i64()) && present().next().is_some() {
        let values: Vec<Option<i64>> = cells.iter().map(|c| c.and_then(Value::as_i64)).collect();
        return (DataType::Int64, Arc::new(Int64Array::from(values)));
    }
    if present().all(|v| v.is_number()) && present().next().is_some() {
        let values: Vec<Option<f64>> = cells.iter().map(|c| c.and_then(Value::as_f64)).collect();
        return (DataType::Float64, Arc::new(Float64Array::from(values)));
    }

    let values: Vec<Option<String>> = cells
        .iter()
        .map(|c| {
            c.map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
        .collect();
    (DataType::Utf8, Arc::new(StringArray::from(values)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
    use serde_json::json;

    fn row(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    fn sample() -> Table {
        Table::from_rows(
            vec![
                row(json!({"status": "ok", "loss": 0.5, "tid": 0, "eval.acc": 0.9})),
                row(json!({"tid": 1, "status": "ok", "loss": 1, "extra": [1, 2]})),
            ],
            &["tid", "loss", "status"],
        )
    }

    #[test]
    fn first_columns_lead() {
        let table = sample();
        assert_eq!(table.columns()[..3], ["tid", "loss", "status"]);
        assert!(table.columns().contains(&"extra".to_string()));
        assert_eq!(table.get(1, "eval.acc"), None);
        assert_eq!(table.get(0, "eval.acc"), Some(&json!(0.9)));
    }

    #[test]
    fn record_batch_infers_types() {
        let batch = sample().to_record_batch().unwrap();
        let schema = batch.schema();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(schema.field_with_name("tid").unwrap().data_type(), &DataType::Int64);
        assert_eq!(schema.field_with_name("loss").unwrap().data_type(), &DataType::Float64);
        assert_eq!(schema.field_with_name("status").unwrap().data_type(), &DataType::Utf8);
        assert_eq!(schema.field_with_name("extra").unwrap().data_type(), &DataType::Utf8);

        let idx = schema.index_of("eval.acc").unwrap();
        assert!(batch.column(idx).is_null(1));
    }

    #[test]
    fn empty_table_has_a_valid_batch() {
        let table = Table::from_rows(vec![], &["tid", "epoch"]);
        let batch = table.to_record_batch().unwrap();
        assert_eq!(batch.num_rows(), 0);
        assert_eq!(batch.num_columns(), 2);
    }

    #[test]
    fn parquet_and_csv_export() {
        let dir = tempfile::tempdir().unwrap();
        let table = sample();

        let parquet_path = dir.path().join("trials.parquet");
        table.write_parquet(&parquet_path).unwrap();
        let reader = ParquetRecordBatchReaderBuilder::try_new(
            std::fs::File::open(&parquet_path).unwrap(),
        )
        .unwrap()
        .build()
        .unwrap();
        let rows: usize = reader.map(|b| b.unwrap().num_rows()).sum();
        assert_eq!(rows, 2);

        let csv_path = dir.path().join("trials.csv");
        table.write_csv(&csv_path).unwrap();
        let text = std::fs::read_to_string(&csv_path).unwrap();
        assert!(text.starts_with("tid,loss,status"));
        assert_eq!(text.lines().count(), 3);
    }
}
