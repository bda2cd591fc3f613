//! PostgreSQL implementations for production storage
//!
//! Provides the analysis store (traces, endpoints, data fields, alerts) used
//! by the pipeline and the admin tool.

mod analysis_store;

pub use analysis_store::*;
