//! # hs-types
//!
//! Core types shared by the hyperstore crates: the error taxonomy, the nested
//! parameter tree sampled for each trial, and the result record one training
//! run produces.

pub mod errors;
pub mod params;
pub mod record;
pub mod telemetry;

pub use errors::*;
pub use params::*;
pub use record::*;
