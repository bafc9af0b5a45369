//! The statement log of a retriable transaction.
//!
//! Every statement executed through a [`RetriableTransaction`](crate::RetriableTransaction)
//! is appended here together with its observable outcome. After an abort the
//! log is replayed, in order, against a fresh backend transaction, and each
//! entry checks that the replay reproduced what the caller already saw.

use std::sync::Arc;

use asupersync::sync::Mutex;
use asupersync::{Cx, Outcome};
use spanner_core::{
    AbortedError, Backend, BackendError, Divergence, Error, RowStream, Statement, TimestampBound,
};

use crate::stream::QueryState;

/// Query state shared between the log and the caller's result stream.
pub(crate) type SharedQuery<R> = Arc<Mutex<QueryState<R>>>;

/// One logged statement.
pub(crate) enum RetriableStatement<R> {
    /// DML that returned an update count
    Dml {
        statement: Statement,
        update_count: i64,
    },
    /// DML that failed with a terminal error
    FailedDml {
        statement: Statement,
        error: BackendError,
    },
    /// Batch DML that returned one update count per statement
    BatchDml {
        statements: Vec<Statement>,
        update_counts: Vec<i64>,
    },
    /// Batch DML that failed with a terminal error
    FailedBatchDml {
        statements: Vec<Statement>,
        error: BackendError,
    },
    /// Query whose rows are (being) consumed through a checksum stream
    Query { sql: String, state: SharedQuery<R> },
    /// Query that failed to start with a terminal error
    FailedQuery {
        statement: Statement,
        bound: Option<TimestampBound>,
        error: BackendError,
    },
}

/// Why replaying an entry stopped.
#[derive(Debug)]
pub(crate) enum ReplayError {
    /// The fresh transaction aborted too; start over
    Aborted(AbortedError),
    /// The replay produced a different outcome
    Diverged(Divergence),
    /// Replay could not be carried out
    Failed(Error),
}

impl<R: RowStream> RetriableStatement<R> {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            RetriableStatement::Dml { .. } => "dml",
            RetriableStatement::FailedDml { .. } => "failed_dml",
            RetriableStatement::BatchDml { .. } => "batch_dml",
            RetriableStatement::FailedBatchDml { .. } => "failed_batch_dml",
            RetriableStatement::Query { .. } => "query",
            RetriableStatement::FailedQuery { .. } => "failed_query",
        }
    }

    /// SQL text for diagnostics. Batches are joined with `"; "`.
    pub(crate) fn sql(&self) -> String {
        match self {
            RetriableStatement::Dml { statement, .. }
            | RetriableStatement::FailedDml { statement, .. }
            | RetriableStatement::FailedQuery { statement, .. } => statement.sql().to_string(),
            RetriableStatement::BatchDml { statements, .. }
            | RetriableStatement::FailedBatchDml { statements, .. } => statements
                .iter()
                .map(Statement::sql)
                .collect::<Vec<_>>()
                .join("; "),
            RetriableStatement::Query { sql, .. } => sql.clone(),
        }
    }

    /// Re-execute this entry on `tx` and validate the outcome.
    pub(crate) async fn replay<B>(&self, cx: &Cx, backend: &B, tx: &B::Tx) -> Outcome<(), ReplayError>
    where
        B: Backend<Rows = R>,
    {
        match self {
            RetriableStatement::Dml {
                statement,
                update_count,
            } => match backend.execute(cx, tx, statement).await {
                Outcome::Ok(actual) if actual == *update_count => Outcome::Ok(()),
                Outcome::Ok(actual) => Outcome::Err(ReplayError::Diverged(Divergence::UpdateCount {
                    expected: *update_count,
                    actual,
                })),
                Outcome::Err(e) => Outcome::Err(unexpected_failure(e)),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            RetriableStatement::FailedDml { statement, error } => {
                match backend.execute(cx, tx, statement).await {
                    Outcome::Ok(_) => Outcome::Err(unexpected_success(error)),
                    Outcome::Err(e) => expect_same_failure(error, e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            RetriableStatement::BatchDml {
                statements,
                update_counts,
            } => match backend.execute_batch(cx, tx, statements).await {
                Outcome::Ok(actual) if actual == *update_counts => Outcome::Ok(()),
                Outcome::Ok(actual) => {
                    Outcome::Err(ReplayError::Diverged(Divergence::BatchUpdateCounts {
                        expected: update_counts.clone(),
                        actual,
                    }))
                }
                Outcome::Err(e) => Outcome::Err(unexpected_failure(e)),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
            RetriableStatement::FailedBatchDml { statements, error } => {
                match backend.execute_batch(cx, tx, statements).await {
                    Outcome::Ok(_) => Outcome::Err(unexpected_success(error)),
                    Outcome::Err(e) => expect_same_failure(error, e),
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    Outcome::Panicked(p) => Outcome::Panicked(p),
                }
            }
            RetriableStatement::Query { state, .. } => {
                let Ok(mut state) = state.lock(cx).await else {
                    return match cx.cancel_reason() {
                        Some(reason) => Outcome::Cancelled(reason),
                        None => Outcome::Err(ReplayError::Failed(Error::Internal(
                            "failed to acquire query stream lock".to_string(),
                        ))),
                    };
                };
                state.replay(cx, backend, tx).await
            }
            RetriableStatement::FailedQuery {
                statement,
                bound,
                error,
            } => match backend.execute_query(cx, tx, statement, bound.as_ref()).await {
                Outcome::Ok(_) => Outcome::Err(unexpected_success(error)),
                Outcome::Err(e) => expect_same_failure(error, e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            },
        }
    }
}

/// Classify an error returned while replaying a statement that originally
/// succeeded.
pub(crate) fn unexpected_failure(error: Error) -> ReplayError {
    match error {
        Error::Aborted(abort) => ReplayError::Aborted(abort),
        Error::Backend(actual) => ReplayError::Diverged(Divergence::UnexpectedFailure { actual }),
        other => ReplayError::Failed(other),
    }
}

pub(crate) fn unexpected_success(expected: &BackendError) -> ReplayError {
    ReplayError::Diverged(Divergence::UnexpectedSuccess {
        expected: expected.clone(),
    })
}

pub(crate) fn expect_same_failure(
    expected: &BackendError,
    error: Error,
) -> Outcome<(), ReplayError> {
    match error {
        Error::Backend(actual) if expected.same_failure(&actual) => Outcome::Ok(()),
        Error::Backend(actual) => Outcome::Err(ReplayError::Diverged(Divergence::DifferentFailure {
            expected: expected.clone(),
            actual,
        })),
        Error::Aborted(abort) => Outcome::Err(ReplayError::Aborted(abort)),
        other => Outcome::Err(ReplayError::Failed(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanner_core::ErrorCode;

    #[test]
    fn test_unexpected_failure_classification() {
        assert!(matches!(
            unexpected_failure(Error::aborted("again")),
            ReplayError::Aborted(_)
        ));
        assert!(matches!(
            unexpected_failure(Error::backend(ErrorCode::NotFound, "gone")),
            ReplayError::Diverged(Divergence::UnexpectedFailure { .. })
        ));
        assert!(matches!(
            unexpected_failure(Error::Internal("x".into())),
            ReplayError::Failed(Error::Internal(_))
        ));
    }

    #[test]
    fn test_expect_same_failure() {
        let expected = BackendError::new(ErrorCode::AlreadyExists, "duplicate key");
        assert!(matches!(
            expect_same_failure(&expected, Error::Backend(expected.clone())),
            Outcome::Ok(())
        ));
        assert!(matches!(
            expect_same_failure(
                &expected,
                Error::backend(ErrorCode::AlreadyExists, "another message")
            ),
            Outcome::Err(ReplayError::Diverged(Divergence::DifferentFailure { .. }))
        ));
        assert!(matches!(
            expect_same_failure(&expected, Error::aborted("conflict")),
            Outcome::Err(ReplayError::Aborted(_))
        ));
    }
}
