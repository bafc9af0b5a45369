//! Result streams that checksum every row handed to the caller.

use std::sync::Arc;

use asupersync::sync::Mutex;
use asupersync::{Cx, Outcome};
use spanner_core::{
    AbortedError, Backend, BackendError, Divergence, Error, Row, RowStream, Statement,
    TimestampBound,
};

use crate::checksum::{Checksum, RowChecksum};
use crate::statement::{
    ReplayError, SharedQuery, expect_same_failure, unexpected_failure, unexpected_success,
};
use crate::transaction::{RetriableTransaction, cancelled};

/// Everything needed to re-run a query and prove the replay saw the same rows.
pub(crate) struct QueryState<R> {
    statement: Statement,
    bound: Option<TimestampBound>,
    rows: R,
    checksum: RowChecksum,
    exhausted: bool,
    /// Error the caller saw while fetching rows; the stream ends there.
    failed: Option<BackendError>,
}

impl<R: RowStream> QueryState<R> {
    pub(crate) fn new(statement: Statement, bound: Option<TimestampBound>, rows: R) -> Self {
        Self {
            statement,
            bound,
            rows,
            checksum: RowChecksum::new(),
            exhausted: false,
            failed: None,
        }
    }

    pub(crate) fn shared(self) -> SharedQuery<R> {
        Arc::new(Mutex::new(self))
    }

    /// Re-execute the query on `tx`, consume as many rows as the caller has
    /// seen and compare checksums. A stream that ended in an error must end
    /// in the same error again. On success the fresh stream replaces the old
    /// one so iteration resumes where it stopped.
    pub(crate) async fn replay<B>(
        &mut self,
        cx: &Cx,
        backend: &B,
        tx: &B::Tx,
    ) -> Outcome<(), ReplayError>
    where
        B: Backend<Rows = R>,
    {
        let mut rows = match backend
            .execute_query(cx, tx, &self.statement, self.bound.as_ref())
            .await
        {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(unexpected_failure(e)),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };

        let expected = self.checksum.rows();
        let mut replayed = RowChecksum::new();
        while replayed.rows() < expected {
            match rows.next_row(cx).await {
                Outcome::Ok(Some(row)) => replayed.update(&row),
                Outcome::Ok(None) => {
                    return Outcome::Err(ReplayError::Diverged(Divergence::MissingRows {
                        expected,
                        actual: replayed.rows(),
                    }));
                }
                Outcome::Err(e) => return Outcome::Err(unexpected_failure(e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        if replayed.digest() != self.checksum.digest() {
            return Outcome::Err(ReplayError::Diverged(Divergence::Checksum { rows: expected }));
        }

        if let Some(expected_error) = &self.failed {
            match rows.next_row(cx).await {
                Outcome::Ok(_) => return Outcome::Err(unexpected_success(expected_error)),
                Outcome::Err(e) => {
                    if let Outcome::Err(stop) = expect_same_failure(expected_error, e) {
                        return Outcome::Err(stop);
                    }
                }
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        } else if self.exhausted {
            match rows.next_row(cx).await {
                Outcome::Ok(None) => {}
                Outcome::Ok(Some(_)) => {
                    return Outcome::Err(ReplayError::Diverged(Divergence::ExtraRows {
                        rows: expected,
                    }));
                }
                Outcome::Err(e) => return Outcome::Err(unexpected_failure(e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        tracing::debug!(
            sql = %self.statement.sql(),
            rows = expected,
            exhausted = self.exhausted,
            failed = self.failed.is_some(),
            "Query replay matched"
        );
        self.rows = rows;
        Outcome::Ok(())
    }
}

/// What one fetch from the underlying stream produced.
enum Fetch {
    Row(Row),
    Done,
    Aborted(AbortedError),
}

/// Rows of a query executed inside a [`RetriableTransaction`].
///
/// Each row is folded into a running checksum before it is returned. If the
/// transaction aborts while the stream is being read, the transaction is
/// retried transparently and iteration continues on the new transaction's
/// results, provided the rows already returned are reproduced exactly.
///
/// The stream borrows the transaction, so it cannot outlive it.
pub struct ChecksumResultStream<'t, B: Backend> {
    transaction: &'t RetriableTransaction<B>,
    statement: Statement,
    state: SharedQuery<B::Rows>,
}

impl<'t, B: Backend> ChecksumResultStream<'t, B> {
    pub(crate) fn new(
        transaction: &'t RetriableTransaction<B>,
        statement: Statement,
        state: SharedQuery<B::Rows>,
    ) -> Self {
        Self {
            transaction,
            statement,
            state,
        }
    }

    /// The query that produced this stream.
    pub fn statement(&self) -> &Statement {
        &self.statement
    }

    /// Fetch the next row, or `None` once the result set is exhausted.
    ///
    /// Once `None` has been returned the stream stays exhausted and the
    /// backend is not polled again. Likewise, after a fetch fails every later
    /// call returns the same error.
    #[tracing::instrument(level = "trace", skip(self, cx), fields(sql = %self.statement.sql()))]
    pub async fn next(&mut self, cx: &Cx) -> Outcome<Option<Row>, Error> {
        loop {
            if let Some(outcome) = cancelled(cx) {
                self.transaction.mark_interrupted();
                return outcome;
            }
            if let Some(outcome) = self.transaction.check_readable(cx).await {
                return outcome;
            }

            let fetch = {
                let Ok(mut state) = self.state.lock(cx).await else {
                    return self.transaction.interrupted_lock(cx);
                };
                if state.exhausted {
                    return Outcome::Ok(None);
                }
                if let Some(error) = &state.failed {
                    return Outcome::Err(Error::Backend(error.clone()));
                }
                match state.rows.next_row(cx).await {
                    Outcome::Ok(Some(row)) => {
                        state.checksum.update(&row);
                        Fetch::Row(row)
                    }
                    Outcome::Ok(None) => {
                        state.exhausted = true;
                        Fetch::Done
                    }
                    Outcome::Err(Error::Aborted(abort)) => Fetch::Aborted(abort),
                    Outcome::Err(Error::Backend(error)) => {
                        tracing::debug!(
                            error = %error,
                            rows = state.checksum.rows(),
                            "Query stream failed"
                        );
                        state.failed = Some(error.clone());
                        return Outcome::Err(Error::Backend(error));
                    }
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => {
                        self.transaction.mark_interrupted();
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                }
            };

            match fetch {
                Fetch::Row(row) => return Outcome::Ok(Some(row)),
                Fetch::Done => return Outcome::Ok(None),
                Fetch::Aborted(abort) => {
                    tracing::debug!(reason = %abort.message, "Query stream aborted");
                    match self.transaction.retry_from_stream(cx, abort).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
            }
        }
    }

    /// Number of rows returned to the caller so far.
    pub async fn rows_consumed(&self, cx: &Cx) -> Outcome<u64, Error> {
        let Ok(state) = self.state.lock(cx).await else {
            return crate::transaction::lock_failed(cx);
        };
        Outcome::Ok(state.checksum.rows())
    }

    /// Checksum of the rows returned to the caller so far.
    pub async fn checksum(&self, cx: &Cx) -> Outcome<Checksum, Error> {
        let Ok(state) = self.state.lock(cx).await else {
            return crate::transaction::lock_failed(cx);
        };
        Outcome::Ok(state.checksum.digest())
    }
}

impl<B: Backend> std::fmt::Debug for ChecksumResultStream<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChecksumResultStream")
            .field("sql", &self.statement.sql())
            .finish_non_exhaustive()
    }
}
