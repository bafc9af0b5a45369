//! Error taxonomy for retriable transactions.
//!
//! Every failure a caller can see maps to exactly one [`Error`] variant:
//!
//! - [`Error::Aborted`]: the backend invalidated the transaction because of a
//!   conflicting concurrent transaction. Retryable.
//! - [`Error::Backend`]: any other backend failure of a single statement.
//! - [`Error::ConcurrentModification`]: a replay produced a different outcome
//!   than the original attempt. Fatal.
//! - [`Error::RetryBudgetExceeded`]: aborts kept coming after the retry count or
//!   time budget ran out. Fatal.
//! - [`Error::Cancelled`]: the caller's context requested cancellation.

use std::fmt;
use std::time::Duration;

/// Result type alias for synchronous spanner operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The primary error type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Transaction aborted by the backend; may be retried
    Aborted(AbortedError),
    /// Terminal (non-abort) backend error for one statement
    Backend(BackendError),
    /// Replay diverged from the original attempt
    ConcurrentModification(ConcurrentModificationError),
    /// Retry count or time budget exhausted
    RetryBudgetExceeded(RetryBudgetError),
    /// Cancellation requested by the caller
    Cancelled(String),
    /// Operation not valid in the transaction's current state
    InvalidState(String),
    /// Malformed input, such as an unparseable timestamp bound
    InvalidArgument(String),
    /// Internal failure (lock acquisition, broken invariant)
    Internal(String),
}

impl Error {
    /// Create an abort error without a retry delay hint.
    pub fn aborted(message: impl Into<String>) -> Self {
        Error::Aborted(AbortedError::new(message))
    }

    /// Create a terminal backend error.
    pub fn backend(code: ErrorCode, message: impl Into<String>) -> Self {
        Error::Backend(BackendError::new(code, message))
    }

    /// Whether a retry of the whole transaction may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Error::Aborted(_))
    }

    /// Whether the transaction can no longer proceed after this error.
    pub const fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ConcurrentModification(_) | Error::RetryBudgetExceeded(_) | Error::Cancelled(_)
        )
    }

    /// The backend error code, if this error came from the backend.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Aborted(_) => Some(ErrorCode::Aborted),
            Error::Backend(e) => Some(e.code),
            Error::Cancelled(_) => Some(ErrorCode::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Aborted(e) => write!(f, "{e}"),
            Error::Backend(e) => write!(f, "{e}"),
            Error::ConcurrentModification(e) => write!(f, "{e}"),
            Error::RetryBudgetExceeded(e) => write!(f, "{e}"),
            Error::Cancelled(msg) => write!(f, "Cancelled: {msg}"),
            Error::InvalidState(msg) => write!(f, "Invalid transaction state: {msg}"),
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            Error::Internal(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::RetryBudgetExceeded(e) => Some(&e.last_abort),
            _ => None,
        }
    }
}

impl From<AbortedError> for Error {
    fn from(e: AbortedError) -> Self {
        Error::Aborted(e)
    }
}

impl From<BackendError> for Error {
    fn from(e: BackendError) -> Self {
        Error::Backend(e)
    }
}

impl From<ConcurrentModificationError> for Error {
    fn from(e: ConcurrentModificationError) -> Self {
        Error::ConcurrentModification(e)
    }
}

impl From<RetryBudgetError> for Error {
    fn from(e: RetryBudgetError) -> Self {
        Error::RetryBudgetExceeded(e)
    }
}

/// Canonical backend status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    NotFound,
    AlreadyExists,
    PermissionDenied,
    ResourceExhausted,
    FailedPrecondition,
    Aborted,
    OutOfRange,
    Unimplemented,
    Internal,
    Unavailable,
    DataLoss,
    Unauthenticated,
}

impl ErrorCode {
    pub const fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::Unknown => "UNKNOWN",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::DeadlineExceeded => "DEADLINE_EXCEEDED",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::AlreadyExists => "ALREADY_EXISTS",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::FailedPrecondition => "FAILED_PRECONDITION",
            ErrorCode::Aborted => "ABORTED",
            ErrorCode::OutOfRange => "OUT_OF_RANGE",
            ErrorCode::Unimplemented => "UNIMPLEMENTED",
            ErrorCode::Internal => "INTERNAL",
            ErrorCode::Unavailable => "UNAVAILABLE",
            ErrorCode::DataLoss => "DATA_LOSS",
            ErrorCode::Unauthenticated => "UNAUTHENTICATED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The backend aborted the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortedError {
    pub message: String,
    /// Delay the backend asked the client to wait before retrying
    pub retry_delay: Option<Duration>,
}

impl AbortedError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retry_delay: None,
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

impl fmt::Display for AbortedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Transaction aborted: {}", self.message)?;
        if let Some(delay) = self.retry_delay {
            write!(f, " (retry after {delay:?})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AbortedError {}

/// A terminal error for one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendError {
    pub code: ErrorCode,
    pub message: String,
    /// SQL of the failing statement, when known
    pub sql: Option<String>,
}

impl BackendError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            sql: None,
        }
    }

    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Whether `other` describes the same failure. Used to validate replays of
    /// statements that failed in an earlier attempt.
    pub fn same_failure(&self, other: &BackendError) -> bool {
        self.code == other.code && self.message == other.message
    }
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(sql) = &self.sql {
            write!(f, " (SQL: {sql})")?;
        }
        Ok(())
    }
}

impl std::error::Error for BackendError {}

/// How a replayed statement differed from its original execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Divergence {
    /// DML returned a different update count
    UpdateCount { expected: i64, actual: i64 },
    /// Batch DML returned different update counts
    BatchUpdateCounts { expected: Vec<i64>, actual: Vec<i64> },
    /// The rows delivered so far hash differently
    Checksum { rows: u64 },
    /// The replayed query ended before reaching the rows already delivered
    MissingRows { expected: u64, actual: u64 },
    /// The original query was exhausted but the replay returned more rows
    ExtraRows { rows: u64 },
    /// A statement that failed originally succeeded on replay
    UnexpectedSuccess { expected: BackendError },
    /// A statement that succeeded originally failed on replay
    UnexpectedFailure { actual: BackendError },
    /// A statement failed both times, but differently
    DifferentFailure {
        expected: BackendError,
        actual: BackendError,
    },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Divergence::UpdateCount { expected, actual } => {
                write!(f, "update count changed from {expected} to {actual}")
            }
            Divergence::BatchUpdateCounts { expected, actual } => {
                write!(f, "batch update counts changed from {expected:?} to {actual:?}")
            }
            Divergence::Checksum { rows } => {
                write!(f, "checksum of the first {rows} row(s) changed")
            }
            Divergence::MissingRows { expected, actual } => {
                write!(f, "query returned {actual} row(s), {expected} were already consumed")
            }
            Divergence::ExtraRows { rows } => {
                write!(f, "query returned more than the {rows} row(s) of the original result")
            }
            Divergence::UnexpectedSuccess { expected } => {
                write!(f, "statement succeeded but originally failed with {expected}")
            }
            Divergence::UnexpectedFailure { actual } => {
                write!(f, "statement failed with {actual} but originally succeeded")
            }
            Divergence::DifferentFailure { expected, actual } => {
                write!(f, "statement failed with {actual}, originally with {expected}")
            }
        }
    }
}

/// A replay did not reproduce the original results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConcurrentModificationError {
    /// Position of the statement in the transaction's statement log
    pub statement_index: usize,
    pub sql: String,
    pub divergence: Divergence,
    /// Retry attempt during which the divergence was found
    pub retry_attempt: u32,
}

impl fmt::Display for ConcurrentModificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Transaction was aborted and could not be retried due to a concurrent modification \
             (retry {}, statement #{} '{}'): {}",
            self.retry_attempt, self.statement_index, self.sql, self.divergence
        )
    }
}

impl std::error::Error for ConcurrentModificationError {}

/// Which retry limit was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryLimit {
    Count(u32),
    Time(Duration),
}

impl fmt::Display for RetryLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryLimit::Count(n) => write!(f, "max retries ({n})"),
            RetryLimit::Time(d) => write!(f, "max retry time ({d:?})"),
        }
    }
}

/// The transaction kept aborting after the retry budget was spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryBudgetError {
    pub retries: u32,
    /// Total time spent retrying, backoff included
    pub elapsed: Duration,
    pub limit: RetryLimit,
    pub last_abort: AbortedError,
}

impl fmt::Display for RetryBudgetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Retry budget exceeded after {} retries in {:?}: {} reached; last abort: {}",
            self.retries, self.elapsed, self.limit, self.last_abort.message
        )
    }
}

impl std::error::Error for RetryBudgetError {}
