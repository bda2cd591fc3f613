//! Infrastructure layer for the trace analyzer
//!
//! Contains trait definitions and implementations for:
//! - Trace queue (Redis list, in-memory)
//! - Analysis store and units of work (PostgreSQL, in-memory)
//! - Failure log (traces whose analysis failed)
//! - Retry with backoff (transient commit failures, idle polling)
//! - Graceful shutdown (in-flight draining)

mod dead_letter;
mod error;
mod graceful_shutdown;
mod memory;
pub mod postgres;
mod redis_queue;
pub mod retry;
mod traits;

pub use dead_letter::{
    AnalysisFailure, FailureReason, FailureStats, InMemoryFailureLog, PgFailureLog,
};
pub use error::*;
pub use graceful_shutdown::{
    shutdown_signal, InFlightGuard, InFlightTracker, ShutdownCoordinator, ShutdownSignal,
};
pub use memory::{InMemoryAnalysisStore, InMemoryTraceQueue};
pub use postgres::{PgAnalysisStore, PgUnitOfWork};
pub use redis_queue::{RedisTraceQueue, DEFAULT_QUEUE_KEY};
pub use retry::{is_retryable_db_error, Retry, RetryConfig, RetryResult};
pub use traits::*;
