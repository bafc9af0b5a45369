//! Transparent abort retry for Spanner read/write transactions.
//!
//! `spanner-retry` sits between an application and a [`Backend`]. It records
//! every statement executed in a read/write transaction together with what the
//! caller observed: update counts, terminal errors and, for queries, a running
//! checksum of the rows returned so far. When the backend aborts the
//! transaction, the recorded statements are replayed on a fresh transaction.
//! The retry is invisible to the caller when the replay reproduces every
//! observation exactly; otherwise the transaction fails with a concurrent
//! modification error.
//!
//! # Role In The Architecture
//!
//! - **Orchestrator**: [`RetriableTransaction`] owns the statement log, the
//!   retry loop, the retry budget and the transaction state machine.
//! - **Result streams**: [`ChecksumResultStream`] checksums rows as they are
//!   consumed and resumes on the new transaction after a retry.
//! - **Policy**: [`RetryOptions`] configures budgets and backoff; a [`Clock`]
//!   makes time injectable for tests.
//!
//! [`Backend`]: spanner_core::Backend

pub mod checksum;
pub mod clock;
pub mod options;
mod statement;
pub mod stream;
pub mod transaction;

pub use checksum::{Checksum, RowChecksum};
pub use clock::{Clock, Sleep, SystemClock, VirtualClock};
pub use options::{DEFAULT_MAX_RETRIES, DEFAULT_MAX_RETRY_TIME, RetryOptions};
pub use stream::ChecksumResultStream;
pub use transaction::{RetriableTransaction, TransactionDebugInfo, TransactionState};

pub use spanner_core::{
    AbortedError, Backend, BackendError, ConcurrentModificationError, Cx, Divergence, Error,
    ErrorCode, Outcome, RetryBudgetError, RetryLimit, Row, RowStream, Statement, Timestamp,
    TimestampBound, Value,
};
