//! Core types and traits for retriable Spanner transactions.
//!
//! `spanner-core` is the **foundation layer** of the workspace. It defines the data
//! model shared by database clients and the retry machinery, and the capability
//! traits a client implements.
//!
//! # Role In The Architecture
//!
//! - **Contract layer**: `Backend` and `RowStream` are implemented by database
//!   clients (or test doubles) and consumed by `spanner-retry`.
//! - **Data model**: `Statement`, `Row`, `Value`, `Timestamp` and `TimestampBound`
//!   describe statement inputs and outputs.
//! - **Error taxonomy**: `Error` separates retryable aborts from terminal statement
//!   errors and from the fatal outcomes of a failed retry.
//! - **Structured concurrency**: re-exports `Cx` and `Outcome` from asupersync so
//!   every backend call is cancel-correct and budget-aware.

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome};

pub mod backend;
pub mod error;
pub mod row;
pub mod statement;
pub mod timestamp;
pub mod value;

pub use backend::{Backend, RowStream};
pub use error::{
    AbortedError, BackendError, ConcurrentModificationError, Divergence, Error, ErrorCode,
    Result, RetryBudgetError, RetryLimit,
};
pub use row::{ColumnInfo, Row};
pub use statement::Statement;
pub use timestamp::{Timestamp, TimestampBound};
pub use value::Value;
