//! Read/write transactions that survive aborts.
//!
//! A [`RetriableTransaction`] wraps one backend transaction. Every statement
//! and its observable outcome is recorded. When the backend aborts the
//! transaction, a fresh one is started after a backoff and the recorded
//! statements are replayed in order. If every replayed statement reproduces
//! its original outcome, the interrupted operation is re-attempted and the
//! caller never sees the abort. If anything differs, the transaction fails
//! with [`Error::ConcurrentModification`].
//!
//! # Example
//!
//! ```ignore
//! let tx = RetriableTransaction::begin(&cx, backend, RetryOptions::default()).await?;
//! let updated = tx.execute_update(&cx, Statement::new("UPDATE T SET V = 1 WHERE ID = 1")).await?;
//! let mut rows = tx.execute_query(&cx, Statement::new("SELECT * FROM T"), None).await?;
//! while let Some(row) = rows.next(&cx).await? {
//!     // ...
//! }
//! drop(rows);
//! let commit_ts = tx.commit(&cx).await?;
//! ```

use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use asupersync::sync::Mutex;
use asupersync::util::DetRng;
use asupersync::{Cx, Outcome};
use spanner_core::{
    AbortedError, Backend, ConcurrentModificationError, Error, RetryBudgetError, RetryLimit,
    Statement, Timestamp, TimestampBound,
};

use crate::options::RetryOptions;
use crate::statement::{ReplayError, RetriableStatement};
use crate::stream::{ChecksumResultStream, QueryState};

/// Lifecycle of a retriable transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionState {
    /// Statements may be executed.
    Active,
    /// Commit succeeded. Terminal.
    Committed,
    /// Rolled back by the caller. Terminal.
    RolledBack,
    /// A fatal error occurred. Only rollback is allowed.
    Failed(Error),
}

impl TransactionState {
    pub fn is_active(&self) -> bool {
        matches!(self, TransactionState::Active)
    }

    pub fn name(&self) -> &'static str {
        match self {
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled_back",
            TransactionState::Failed(_) => "failed",
        }
    }
}

/// Debug information about transaction state.
#[derive(Debug, Clone)]
pub struct TransactionDebugInfo {
    /// Current lifecycle state.
    pub state: TransactionState,
    /// Internal retries performed so far.
    pub retry_count: u32,
    /// Statements currently held in the replay log.
    pub logged_statements: usize,
    /// Kind of each logged statement, in order.
    pub statement_kinds: Vec<&'static str>,
    /// Cumulative time spent retrying, backoff included.
    pub retry_time: Duration,
    /// Whether aborts are retried internally.
    pub internal_retries: bool,
}

/// Mutable transaction state, guarded by the transaction lock.
struct TxInner<B: Backend> {
    /// Current backend transaction; `None` once committed or rolled back.
    handle: Option<B::Tx>,
    state: TransactionState,
    log: Vec<RetriableStatement<B::Rows>>,
    retry_time: Duration,
}

impl<B: Backend> TxInner<B> {
    fn ensure_active(&self) -> Result<(), Error> {
        match &self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(Error::InvalidState(
                "transaction has already been committed".to_string(),
            )),
            TransactionState::RolledBack => Err(Error::InvalidState(
                "transaction has been rolled back".to_string(),
            )),
            TransactionState::Failed(e) => Err(e.clone()),
        }
    }

    fn handle(&self) -> Result<&B::Tx, Error> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::Internal("transaction has no backend handle".to_string()))
    }

    fn fail(&mut self, error: Error) {
        tracing::warn!(error = %error, "Transaction failed");
        self.state = TransactionState::Failed(error);
    }

    fn fail_cancelled(&mut self, during: &str) {
        self.fail(Error::Cancelled(format!(
            "cancelled during {during}; transaction must be rolled back"
        )));
    }

    fn fail_panicked(&mut self, during: &str) {
        self.fail(Error::Internal(format!(
            "backend panicked during {during}; transaction must be rolled back"
        )));
    }
}

/// Why one replay pass over the statement log stopped.
enum ReplayStop {
    Aborted(AbortedError),
    Diverged(ConcurrentModificationError),
    Failed(Error),
}

/// A read/write transaction that transparently retries aborts.
///
/// All operations take `&self`; the transaction serializes them internally.
/// Query streams borrow the transaction, so they must be dropped before the
/// transaction is.
pub struct RetriableTransaction<B: Backend> {
    backend: B,
    options: RetryOptions,
    inner: Mutex<TxInner<B>>,
    internal_retries: AtomicBool,
    retry_count: AtomicU32,
    commit_timestamp: OnceLock<Timestamp>,
    /// Set when a backend call was cancelled outside the transaction lock.
    interrupted: AtomicBool,
}

impl<B: Backend> std::fmt::Debug for RetriableTransaction<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetriableTransaction")
            .field("retry_count", &self.retry_count())
            .field("internal_retries", &self.internal_retries_enabled())
            .field("commit_timestamp", &self.commit_timestamp.get())
            .finish_non_exhaustive()
    }
}

/// Cancellation requested on `cx`, as the outcome an operation should return.
pub(crate) fn cancelled<T>(cx: &Cx) -> Option<Outcome<T, Error>> {
    if let Some(reason) = cx.cancel_reason() {
        return Some(Outcome::Cancelled(reason));
    }
    if cx.is_cancel_requested() {
        return Some(Outcome::Err(Error::Cancelled(
            "cancellation requested".to_string(),
        )));
    }
    None
}

/// Outcome for a lock that could not be acquired.
pub(crate) fn lock_failed<T>(cx: &Cx) -> Outcome<T, Error> {
    cancelled(cx).unwrap_or_else(|| {
        Outcome::Err(Error::Internal(
            "failed to acquire transaction lock".to_string(),
        ))
    })
}

impl<B: Backend> RetriableTransaction<B> {
    /// Begin a new read/write transaction on `backend`.
    #[tracing::instrument(level = "debug", skip(cx, backend, options))]
    pub async fn begin(cx: &Cx, backend: B, options: RetryOptions) -> Outcome<Self, Error> {
        if let Err(e) = options.validate() {
            return Outcome::Err(e);
        }
        if let Some(outcome) = cancelled(cx) {
            return outcome;
        }
        tracing::info!("Beginning transaction");
        match backend.begin(cx).await {
            Outcome::Ok(handle) => Outcome::Ok(Self::from_handle(backend, handle, options)),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Wrap a backend transaction that has already been started.
    pub fn from_handle(backend: B, handle: B::Tx, options: RetryOptions) -> Self {
        let internal_retries = AtomicBool::new(options.enable_internal_retries);
        Self {
            backend,
            options,
            inner: Mutex::new(TxInner {
                handle: Some(handle),
                state: TransactionState::Active,
                log: Vec::new(),
                retry_time: Duration::ZERO,
            }),
            internal_retries,
            retry_count: AtomicU32::new(0),
            commit_timestamp: OnceLock::new(),
            interrupted: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    /// Number of internal retries performed so far.
    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    /// Whether aborts are retried internally.
    pub fn internal_retries_enabled(&self) -> bool {
        self.internal_retries.load(Ordering::Acquire)
    }

    /// Turn internal retries on or off.
    ///
    /// Statements are recorded either way, so retries can be re-enabled later
    /// in the same transaction.
    pub fn set_internal_retries(&self, enabled: bool) {
        self.internal_retries.store(enabled, Ordering::Release);
    }

    /// Timestamp at which the transaction committed.
    pub fn commit_timestamp(&self) -> spanner_core::Result<Timestamp> {
        self.commit_timestamp.get().copied().ok_or_else(|| {
            Error::InvalidState("transaction has not been committed".to_string())
        })
    }

    /// Current lifecycle state.
    pub async fn state(&self, cx: &Cx) -> Outcome<TransactionState, Error> {
        let Ok(inner) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        Outcome::Ok(self.effective_state(&inner))
    }

    /// Snapshot of the transaction's internals.
    pub async fn debug_info(&self, cx: &Cx) -> Outcome<TransactionDebugInfo, Error> {
        let Ok(inner) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        Outcome::Ok(TransactionDebugInfo {
            state: self.effective_state(&inner),
            retry_count: self.retry_count(),
            logged_statements: inner.log.len(),
            statement_kinds: inner.log.iter().map(RetriableStatement::kind).collect(),
            retry_time: inner.retry_time,
            internal_retries: self.internal_retries_enabled(),
        })
    }

    /// Execute a DML statement and return its update count.
    #[tracing::instrument(level = "debug", skip(self, cx, statement), fields(sql = %statement.sql()))]
    pub async fn execute_update(&self, cx: &Cx, statement: Statement) -> Outcome<i64, Error> {
        let Ok(mut inner) = self.inner.lock(cx).await else {
            return self.interrupted_lock(cx);
        };
        loop {
            if let Err(e) = self.check_active(&mut inner) {
                return Outcome::Err(e);
            }
            if let Some(outcome) = cancelled(cx) {
                inner.fail_cancelled("update");
                return outcome;
            }
            let result = match inner.handle() {
                Ok(handle) => self.backend.execute(cx, handle, &statement).await,
                Err(e) => return Outcome::Err(e),
            };
            match result {
                Outcome::Ok(update_count) => {
                    tracing::debug!(update_count, "DML executed");
                    inner.log.push(RetriableStatement::Dml {
                        statement,
                        update_count,
                    });
                    return Outcome::Ok(update_count);
                }
                Outcome::Err(Error::Aborted(abort)) => {
                    match self.handle_abort(cx, &mut inner, abort).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                Outcome::Err(Error::Backend(error)) => {
                    tracing::debug!(error = %error, "DML failed");
                    inner.log.push(RetriableStatement::FailedDml {
                        statement,
                        error: error.clone(),
                    });
                    return Outcome::Err(Error::Backend(error));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => {
                    inner.fail_cancelled("update");
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    inner.fail_panicked("update");
                    return Outcome::Panicked(p);
                }
            }
        }
    }

    /// Execute DML statements as one batch and return one update count per
    /// statement.
    #[tracing::instrument(level = "debug", skip(self, cx, statements), fields(count = statements.len()))]
    pub async fn execute_batch_update(
        &self,
        cx: &Cx,
        statements: Vec<Statement>,
    ) -> Outcome<Vec<i64>, Error> {
        if statements.is_empty() {
            return Outcome::Err(Error::InvalidArgument(
                "batch update requires at least one statement".to_string(),
            ));
        }
        let Ok(mut inner) = self.inner.lock(cx).await else {
            return self.interrupted_lock(cx);
        };
        loop {
            if let Err(e) = self.check_active(&mut inner) {
                return Outcome::Err(e);
            }
            if let Some(outcome) = cancelled(cx) {
                inner.fail_cancelled("batch update");
                return outcome;
            }
            let result = match inner.handle() {
                Ok(handle) => self.backend.execute_batch(cx, handle, &statements).await,
                Err(e) => return Outcome::Err(e),
            };
            match result {
                Outcome::Ok(update_counts) => {
                    tracing::debug!(?update_counts, "Batch DML executed");
                    inner.log.push(RetriableStatement::BatchDml {
                        statements,
                        update_counts: update_counts.clone(),
                    });
                    return Outcome::Ok(update_counts);
                }
                Outcome::Err(Error::Aborted(abort)) => {
                    match self.handle_abort(cx, &mut inner, abort).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                Outcome::Err(Error::Backend(error)) => {
                    tracing::debug!(error = %error, "Batch DML failed");
                    inner.log.push(RetriableStatement::FailedBatchDml {
                        statements,
                        error: error.clone(),
                    });
                    return Outcome::Err(Error::Backend(error));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => {
                    inner.fail_cancelled("batch update");
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    inner.fail_panicked("batch update");
                    return Outcome::Panicked(p);
                }
            }
        }
    }

    /// Execute a query and return a stream over its rows.
    ///
    /// `bound` is forwarded to the backend as a staleness hint and reused
    /// verbatim when the query is replayed.
    #[tracing::instrument(level = "debug", skip(self, cx, statement), fields(sql = %statement.sql()))]
    pub async fn execute_query(
        &self,
        cx: &Cx,
        statement: Statement,
        bound: Option<TimestampBound>,
    ) -> Outcome<ChecksumResultStream<'_, B>, Error> {
        let Ok(mut inner) = self.inner.lock(cx).await else {
            return self.interrupted_lock(cx);
        };
        loop {
            if let Err(e) = self.check_active(&mut inner) {
                return Outcome::Err(e);
            }
            if let Some(outcome) = cancelled(cx) {
                inner.fail_cancelled("query");
                return outcome;
            }
            let result = match inner.handle() {
                Ok(handle) => {
                    self.backend
                        .execute_query(cx, handle, &statement, bound.as_ref())
                        .await
                }
                Err(e) => return Outcome::Err(e),
            };
            match result {
                Outcome::Ok(rows) => {
                    let state = QueryState::new(statement.clone(), bound, rows).shared();
                    inner.log.push(RetriableStatement::Query {
                        sql: statement.sql().to_string(),
                        state: std::sync::Arc::clone(&state),
                    });
                    return Outcome::Ok(ChecksumResultStream::new(self, statement, state));
                }
                Outcome::Err(Error::Aborted(abort)) => {
                    match self.handle_abort(cx, &mut inner, abort).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                Outcome::Err(Error::Backend(error)) => {
                    tracing::debug!(error = %error, "Query failed");
                    inner.log.push(RetriableStatement::FailedQuery {
                        statement,
                        bound,
                        error: error.clone(),
                    });
                    return Outcome::Err(Error::Backend(error));
                }
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => {
                    inner.fail_cancelled("query");
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    inner.fail_panicked("query");
                    return Outcome::Panicked(p);
                }
            }
        }
    }

    /// Commit the transaction and return the commit timestamp.
    ///
    /// An abort during commit is retried like any other abort. Any other
    /// commit failure leaves the transaction failed.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn commit(&self, cx: &Cx) -> Outcome<Timestamp, Error> {
        let Ok(mut inner) = self.inner.lock(cx).await else {
            return self.interrupted_lock(cx);
        };
        loop {
            if let Err(e) = self.check_active(&mut inner) {
                return Outcome::Err(e);
            }
            if let Some(outcome) = cancelled(cx) {
                inner.fail_cancelled("commit");
                return outcome;
            }
            tracing::info!(
                statements = inner.log.len(),
                retries = self.retry_count(),
                "Committing transaction"
            );
            let result = match inner.handle() {
                Ok(handle) => self.backend.commit(cx, handle).await,
                Err(e) => return Outcome::Err(e),
            };
            match result {
                Outcome::Ok(commit_ts) => {
                    inner.state = TransactionState::Committed;
                    inner.handle = None;
                    inner.log.clear();
                    let _ = self.commit_timestamp.set(commit_ts);
                    tracing::info!(%commit_ts, retries = self.retry_count(), "Transaction committed");
                    return Outcome::Ok(commit_ts);
                }
                Outcome::Err(Error::Aborted(abort)) => {
                    match self.handle_abort(cx, &mut inner, abort).await {
                        Outcome::Ok(()) => {}
                        Outcome::Err(e) => return Outcome::Err(e),
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    }
                }
                Outcome::Err(e) => {
                    inner.fail(e.clone());
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    inner.fail_cancelled("commit; commit outcome unknown");
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    inner.fail_panicked("commit; commit outcome unknown");
                    return Outcome::Panicked(p);
                }
            }
        }
    }

    /// Roll back the transaction and discard the statement log.
    ///
    /// Allowed from the active and failed states; rolling back twice is a
    /// no-op. The backend rollback is best-effort: its failures are logged,
    /// not returned.
    #[tracing::instrument(level = "debug", skip(self, cx))]
    pub async fn rollback(&self, cx: &Cx) -> Outcome<(), Error> {
        let Ok(mut inner) = self.inner.lock(cx).await else {
            return lock_failed(cx);
        };
        match inner.state {
            TransactionState::Committed => {
                return Outcome::Err(Error::InvalidState(
                    "cannot roll back a committed transaction".to_string(),
                ));
            }
            TransactionState::RolledBack => return Outcome::Ok(()),
            TransactionState::Active | TransactionState::Failed(_) => {}
        }

        tracing::info!(statements = inner.log.len(), "Rolling back transaction");
        let handle = inner.handle.take();
        inner.log.clear();
        inner.state = TransactionState::RolledBack;

        let Some(handle) = handle else {
            return Outcome::Ok(());
        };
        match self.backend.rollback(cx, &handle).await {
            Outcome::Ok(()) => Outcome::Ok(()),
            Outcome::Err(e) => {
                tracing::warn!(error = %e, "Backend rollback failed");
                Outcome::Ok(())
            }
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Fail the transaction if an operation was cancelled outside the
    /// transaction lock, then check that it is active.
    fn check_active(&self, inner: &mut TxInner<B>) -> Result<(), Error> {
        if inner.state.is_active() && self.interrupted.swap(false, Ordering::AcqRel) {
            inner.fail_cancelled("an earlier operation");
        }
        inner.ensure_active()
    }

    fn effective_state(&self, inner: &TxInner<B>) -> TransactionState {
        if inner.state.is_active() && self.interrupted.load(Ordering::Acquire) {
            return TransactionState::Failed(Error::Cancelled(
                "cancelled during an earlier operation; transaction must be rolled back"
                    .to_string(),
            ));
        }
        inner.state.clone()
    }

    pub(crate) fn mark_interrupted(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Like [`lock_failed`], but a cancelled lock wait also leaves the
    /// transaction failed.
    pub(crate) fn interrupted_lock<T>(&self, cx: &Cx) -> Outcome<T, Error> {
        let outcome = lock_failed(cx);
        if !matches!(outcome, Outcome::Err(Error::Internal(_))) {
            self.mark_interrupted();
        }
        outcome
    }

    /// Check, on behalf of a query stream, that rows may still be read.
    pub(crate) async fn check_readable<T>(&self, cx: &Cx) -> Option<Outcome<T, Error>> {
        let Ok(mut inner) = self.inner.lock(cx).await else {
            return Some(self.interrupted_lock(cx));
        };
        self.check_active(&mut inner).err().map(Outcome::Err)
    }

    /// Handle an abort raised while a query stream was being read.
    pub(crate) async fn retry_from_stream(
        &self,
        cx: &Cx,
        abort: AbortedError,
    ) -> Outcome<(), Error> {
        let Ok(mut inner) = self.inner.lock(cx).await else {
            return self.interrupted_lock(cx);
        };
        if let Err(e) = self.check_active(&mut inner) {
            return Outcome::Err(e);
        }
        self.handle_abort(cx, &mut inner, abort).await
    }

    async fn handle_abort(
        &self,
        cx: &Cx,
        inner: &mut TxInner<B>,
        abort: AbortedError,
    ) -> Outcome<(), Error> {
        if !self.internal_retries_enabled() {
            tracing::debug!(reason = %abort.message, "Internal retries disabled; surfacing abort");
            return Outcome::Err(Error::Aborted(abort));
        }
        self.retry(cx, inner, abort).await
    }

    /// Start a fresh backend transaction and replay the statement log until
    /// a replay completes, diverges, or the retry budget runs out.
    async fn retry(
        &self,
        cx: &Cx,
        inner: &mut TxInner<B>,
        mut abort: AbortedError,
    ) -> Outcome<(), Error> {
        let clock = &self.options.clock;
        let started = clock.now();
        let spent = inner.retry_time;
        let mut rng = DetRng::new(cx.random_u64());

        loop {
            let elapsed = spent + clock.now().saturating_duration_since(started);
            inner.retry_time = elapsed;
            let retries = self.retry_count();

            let limit = if retries >= self.options.max_retries {
                Some(RetryLimit::Count(self.options.max_retries))
            } else if elapsed >= self.options.max_retry_time {
                Some(RetryLimit::Time(self.options.max_retry_time))
            } else {
                None
            };
            if let Some(limit) = limit {
                let error = Error::RetryBudgetExceeded(RetryBudgetError {
                    retries,
                    elapsed,
                    limit,
                    last_abort: abort,
                });
                inner.fail(error.clone());
                return Outcome::Err(error);
            }

            if let Some(outcome) = cancelled(cx) {
                inner.fail_cancelled("retry");
                return outcome;
            }

            let attempt = self.retry_count.fetch_add(1, Ordering::AcqRel) + 1;
            let remaining = self.options.max_retry_time.saturating_sub(elapsed);
            let delay = abort
                .retry_delay
                .unwrap_or_else(|| self.options.backoff(attempt, Some(&mut rng)))
                .min(remaining);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                statements = inner.log.len(),
                reason = %abort.message,
                "Retrying aborted transaction"
            );
            clock.sleep(cx, delay).await;
            inner.retry_time = spent + clock.now().saturating_duration_since(started);

            if let Some(outcome) = cancelled(cx) {
                inner.fail_cancelled("retry backoff");
                return outcome;
            }

            // The backend has already discarded an aborted transaction, so
            // its handle is released without a rollback.
            inner.handle = None;

            let handle = match self.backend.begin(cx).await {
                Outcome::Ok(handle) => handle,
                Outcome::Err(Error::Aborted(again)) => {
                    tracing::debug!(attempt, reason = %again.message, "Retry begin aborted");
                    abort = again;
                    continue;
                }
                Outcome::Err(e) => {
                    inner.retry_time = spent + clock.now().saturating_duration_since(started);
                    inner.fail(e.clone());
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    inner.fail_cancelled("retry");
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    inner.fail_panicked("retry");
                    return Outcome::Panicked(p);
                }
            };
            inner.handle = Some(handle);

            let stop = self.replay_log(cx, inner, attempt).await;
            inner.retry_time = spent + clock.now().saturating_duration_since(started);
            match stop {
                Outcome::Ok(()) => {
                    tracing::info!(
                        attempt,
                        statements = inner.log.len(),
                        "Transaction retry succeeded"
                    );
                    return Outcome::Ok(());
                }
                Outcome::Err(ReplayStop::Aborted(again)) => {
                    tracing::debug!(attempt, reason = %again.message, "Replay aborted");
                    abort = again;
                }
                Outcome::Err(ReplayStop::Diverged(modification)) => {
                    let error = Error::ConcurrentModification(modification);
                    inner.fail(error.clone());
                    return Outcome::Err(error);
                }
                Outcome::Err(ReplayStop::Failed(e)) => {
                    inner.fail(e.clone());
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    inner.fail_cancelled("retry");
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    inner.fail_panicked("retry");
                    return Outcome::Panicked(p);
                }
            }
        }
    }

    /// Replay every logged statement, in order, on the current handle.
    async fn replay_log(
        &self,
        cx: &Cx,
        inner: &TxInner<B>,
        attempt: u32,
    ) -> Outcome<(), ReplayStop> {
        let handle = match inner.handle() {
            Ok(handle) => handle,
            Err(e) => return Outcome::Err(ReplayStop::Failed(e)),
        };
        for (index, entry) in inner.log.iter().enumerate() {
            if let Some(outcome) = cancelled::<()>(cx) {
                return match outcome {
                    Outcome::Cancelled(r) => Outcome::Cancelled(r),
                    _ => Outcome::Err(ReplayStop::Failed(Error::Cancelled(
                        "cancellation requested during replay".to_string(),
                    ))),
                };
            }
            match entry.replay(cx, &self.backend, handle).await {
                Outcome::Ok(()) => {}
                Outcome::Err(ReplayError::Aborted(abort)) => {
                    return Outcome::Err(ReplayStop::Aborted(abort));
                }
                Outcome::Err(ReplayError::Diverged(divergence)) => {
                    let modification = ConcurrentModificationError {
                        statement_index: index,
                        sql: entry.sql(),
                        divergence,
                        retry_attempt: attempt,
                    };
                    tracing::warn!(
                        attempt,
                        statement = index,
                        kind = entry.kind(),
                        divergence = %modification.divergence,
                        "Replay diverged from original results"
                    );
                    return Outcome::Err(ReplayStop::Diverged(modification));
                }
                Outcome::Err(ReplayError::Failed(e)) => return Outcome::Err(ReplayStop::Failed(e)),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }
        Outcome::Ok(())
    }
}
