//! Scripted in-memory backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use asupersync::PanicPayload;
use asupersync::runtime::RuntimeBuilder;
use spanner_retry::{
    AbortedError, Backend, BackendError, Cx, Error, Outcome, RetryOptions, Row, RowStream,
    Statement, Timestamp, TimestampBound, Value, VirtualClock,
};

pub fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> std::result::Result<T, String> {
    match outcome {
        Outcome::Ok(v) => Ok(v),
        Outcome::Err(e) => Err(format!("unexpected error: {e}")),
        Outcome::Cancelled(r) => Err(format!("cancelled: {r:?}")),
        Outcome::Panicked(p) => Err(format!("panicked: {p:?}")),
    }
}

pub fn expect_err<T: std::fmt::Debug>(outcome: Outcome<T, Error>) -> Error {
    match outcome {
        Outcome::Err(e) => e,
        other => panic!("expected an error, got {other:?}"),
    }
}

pub fn block_on<F: Future>(future: F) -> F::Output {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    rt.block_on(future)
}

/// Options whose backoff runs on `clock`.
pub fn virtual_options(clock: &Arc<VirtualClock>) -> RetryOptions {
    RetryOptions::new().clock(Arc::clone(clock) as Arc<dyn spanner_retry::Clock>)
}

pub fn row(values: Vec<Value>) -> Row {
    let names = (0..values.len()).map(|i| format!("c{i}")).collect();
    Row::new(names, values)
}

pub fn int_rows(values: &[i64]) -> Vec<Row> {
    values.iter().map(|v| row(vec![Value::Int64(*v)])).collect()
}

/// Backend operation, used for abort injection and the call log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    Begin,
    Execute,
    Batch,
    Query,
    NextRow,
    Commit,
    Rollback,
}

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub op: Op,
    pub tx: u64,
    pub sql: Option<String>,
}

#[derive(Debug)]
pub struct MockTx {
    pub id: u64,
}

type Script<T> = VecDeque<Result<T, BackendError>>;

#[derive(Default)]
struct MockState {
    next_tx: u64,
    updates: HashMap<String, Script<i64>>,
    /// DML whose update count is 1 only if another statement already ran in
    /// the same transaction, 0 otherwise.
    dependencies: HashMap<String, String>,
    queries: HashMap<String, Script<Vec<Row>>>,
    /// Per execution of a query: fail the fetch after this many rows.
    row_failures: HashMap<String, VecDeque<Option<(usize, BackendError)>>>,
    pending_aborts: HashMap<Op, u32>,
    always_abort: HashSet<Op>,
    panic_next: HashSet<Op>,
    abort_delay: Option<Duration>,
    begin_error: Option<BackendError>,
    commit_error: Option<BackendError>,
    bounds: Vec<Option<TimestampBound>>,
    calls: Vec<Call>,
}

/// Pop the next scripted result. The last entry repeats forever.
fn next_scripted<T: Clone>(script: &mut Script<T>) -> Option<Result<T, BackendError>> {
    if script.len() > 1 {
        script.pop_front()
    } else {
        script.front().cloned()
    }
}

impl MockState {
    fn record(&mut self, op: Op, tx: u64, sql: Option<&str>) {
        self.calls.push(Call {
            op,
            tx,
            sql: sql.map(str::to_string),
        });
    }

    fn take_abort(&mut self, op: Op) -> Option<Error> {
        let abort = if self.always_abort.contains(&op) {
            true
        } else if let Some(pending) = self.pending_aborts.get_mut(&op).filter(|n| **n > 0) {
            *pending -= 1;
            true
        } else {
            false
        };
        abort.then(|| {
            let mut error = AbortedError::new(format!("{op:?} aborted by concurrent transaction"));
            if let Some(delay) = self.abort_delay {
                error = error.with_retry_delay(delay);
            }
            Error::Aborted(error)
        })
    }

    fn take_panic(&mut self, op: Op) -> Option<PanicPayload> {
        self.panic_next
            .remove(&op)
            .then(|| PanicPayload::new(format!("{op:?} panicked in the backend")))
    }

    /// Unscripted DML updates one row.
    fn update(&mut self, tx: u64, statement: &Statement) -> Result<i64, Error> {
        if let Some(prerequisite) = self.dependencies.get(statement.sql()) {
            let ran = self.calls.iter().any(|c| {
                c.tx == tx && c.op == Op::Execute && c.sql.as_deref() == Some(prerequisite)
            });
            return Ok(i64::from(ran));
        }
        match self.updates.get_mut(statement.sql()).and_then(next_scripted) {
            Some(Ok(count)) => Ok(count),
            Some(Err(e)) => Err(Error::Backend(e)),
            None => Ok(1),
        }
    }
}

/// In-memory backend whose results and aborts are scripted per test.
///
/// Clones share state, so a test can keep a handle for scripting and
/// inspection while the transaction owns another.
#[derive(Clone, Default)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Results of successive executions of `sql`; the last one repeats.
    pub fn script_update(&self, sql: &str, results: Vec<Result<i64, BackendError>>) {
        self.state()
            .updates
            .insert(sql.to_string(), results.into_iter().collect());
    }

    /// Result sets of successive executions of `sql`; the last one repeats.
    pub fn script_query(&self, sql: &str, results: Vec<Result<Vec<Row>, BackendError>>) {
        self.state()
            .queries
            .insert(sql.to_string(), results.into_iter().collect());
    }

    /// Row-level failures of successive executions of `sql`: `Some((n, e))`
    /// fails every fetch after the first `n` rows with `e`. The last entry
    /// repeats.
    pub fn script_row_failure(&self, sql: &str, failures: Vec<Option<(usize, BackendError)>>) {
        self.state()
            .row_failures
            .insert(sql.to_string(), failures.into_iter().collect());
    }

    /// Make `sql` report one updated row only after `prerequisite` has run
    /// in the same transaction.
    pub fn script_dependent_update(&self, sql: &str, prerequisite: &str) {
        self.state()
            .dependencies
            .insert(sql.to_string(), prerequisite.to_string());
    }

    /// Abort the next `count` calls of `op`.
    pub fn abort_next(&self, op: Op, count: u32) {
        *self.state().pending_aborts.entry(op).or_insert(0) += count;
    }

    /// Abort every call of `op`.
    pub fn always_abort(&self, op: Op) {
        self.state().always_abort.insert(op);
    }

    /// Report a panic from the next call of `op`.
    pub fn panic_next(&self, op: Op) {
        self.state().panic_next.insert(op);
    }

    /// Attach a suggested retry delay to every injected abort.
    pub fn set_abort_delay(&self, delay: Duration) {
        self.state().abort_delay = Some(delay);
    }

    pub fn fail_begin(&self, error: BackendError) {
        self.state().begin_error = Some(error);
    }

    pub fn fail_commit(&self, error: BackendError) {
        self.state().commit_error = Some(error);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, op: Op) -> usize {
        self.state().calls.iter().filter(|c| c.op == op).count()
    }

    /// SQL of every DML and query call, in order, with the transaction id.
    pub fn statement_calls(&self) -> Vec<(u64, String)> {
        self.state()
            .calls
            .iter()
            .filter(|c| matches!(c.op, Op::Execute | Op::Query))
            .filter_map(|c| c.sql.clone().map(|sql| (c.tx, sql)))
            .collect()
    }

    /// Timestamp bounds passed to every query call, in order.
    pub fn bounds(&self) -> Vec<Option<TimestampBound>> {
        self.state().bounds.clone()
    }
}

/// Rows produced by [`MockBackend`]; fetches go through the shared state so
/// row-level aborts can be injected.
pub struct MockRows {
    tx: u64,
    sql: String,
    rows: VecDeque<Row>,
    served: usize,
    failure: Option<(usize, BackendError)>,
    state: Arc<Mutex<MockState>>,
}

impl RowStream for MockRows {
    fn next_row(&mut self, _cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send {
        let outcome = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.record(Op::NextRow, self.tx, Some(&self.sql));
            match (state.take_abort(Op::NextRow), &self.failure) {
                (Some(e), _) => Outcome::Err(e),
                (None, Some((after, error))) if self.served >= *after => {
                    Outcome::Err(Error::Backend(error.clone()))
                }
                (None, _) => {
                    let row = self.rows.pop_front();
                    self.served += usize::from(row.is_some());
                    Outcome::Ok(row)
                }
            }
        };
        std::future::ready(outcome)
    }
}

impl Backend for MockBackend {
    type Tx = MockTx;
    type Rows = MockRows;

    fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<MockTx, Error>> + Send {
        let outcome = {
            let mut state = self.state();
            state.next_tx += 1;
            let id = state.next_tx;
            state.record(Op::Begin, id, None);
            if let Some(e) = state.take_abort(Op::Begin) {
                Outcome::Err(e)
            } else if let Some(e) = state.begin_error.clone() {
                Outcome::Err(Error::Backend(e))
            } else {
                Outcome::Ok(MockTx { id })
            }
        };
        std::future::ready(outcome)
    }

    fn execute(
        &self,
        _cx: &Cx,
        tx: &MockTx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<i64, Error>> + Send {
        let outcome = {
            let mut state = self.state();
            state.record(Op::Execute, tx.id, Some(statement.sql()));
            if let Some(payload) = state.take_panic(Op::Execute) {
                Outcome::Panicked(payload)
            } else if let Some(e) = state.take_abort(Op::Execute) {
                Outcome::Err(e)
            } else {
                match state.update(tx.id, statement) {
                    Ok(count) => Outcome::Ok(count),
                    Err(e) => Outcome::Err(e),
                }
            }
        };
        std::future::ready(outcome)
    }

    fn execute_batch(
        &self,
        _cx: &Cx,
        tx: &MockTx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Vec<i64>, Error>> + Send {
        let outcome = {
            let mut state = self.state();
            let sql = statements
                .iter()
                .map(Statement::sql)
                .collect::<Vec<_>>()
                .join("; ");
            state.record(Op::Batch, tx.id, Some(&sql));
            match state.take_abort(Op::Batch) {
                Some(e) => Outcome::Err(e),
                None => {
                    let counts: Result<Vec<i64>, Error> = statements
                        .iter()
                        .map(|statement| state.update(tx.id, statement))
                        .collect();
                    match counts {
                        Ok(counts) => Outcome::Ok(counts),
                        Err(e) => Outcome::Err(e),
                    }
                }
            }
        };
        std::future::ready(outcome)
    }

    fn execute_query(
        &self,
        _cx: &Cx,
        tx: &MockTx,
        statement: &Statement,
        bound: Option<&TimestampBound>,
    ) -> impl Future<Output = Outcome<MockRows, Error>> + Send {
        let outcome = {
            let mut state = self.state();
            state.record(Op::Query, tx.id, Some(statement.sql()));
            state.bounds.push(bound.copied());
            match state.take_abort(Op::Query) {
                Some(e) => Outcome::Err(e),
                None => match state
                    .queries
                    .get_mut(statement.sql())
                    .and_then(next_scripted)
                {
                    Some(Err(e)) => Outcome::Err(Error::Backend(e)),
                    result => {
                        let failure = state.row_failures.get_mut(statement.sql()).and_then(
                            |failures| {
                                if failures.len() > 1 {
                                    failures.pop_front().flatten()
                                } else {
                                    failures.front().cloned().flatten()
                                }
                            },
                        );
                        Outcome::Ok(MockRows {
                            tx: tx.id,
                            sql: statement.sql().to_string(),
                            rows: result
                                .and_then(Result::ok)
                                .unwrap_or_default()
                                .into_iter()
                                .collect(),
                            served: 0,
                            failure,
                            state: Arc::clone(&self.state),
                        })
                    }
                },
            }
        };
        std::future::ready(outcome)
    }

    fn commit(&self, _cx: &Cx, tx: &MockTx) -> impl Future<Output = Outcome<Timestamp, Error>> + Send {
        let outcome = {
            let mut state = self.state();
            state.record(Op::Commit, tx.id, None);
            if let Some(payload) = state.take_panic(Op::Commit) {
                Outcome::Panicked(payload)
            } else if let Some(e) = state.take_abort(Op::Commit) {
                Outcome::Err(e)
            } else if let Some(e) = state.commit_error.clone() {
                Outcome::Err(Error::Backend(e))
            } else {
                Outcome::Ok(Timestamp::new(1_700_000_000 + tx.id as i64, 0))
            }
        };
        std::future::ready(outcome)
    }

    fn rollback(&self, _cx: &Cx, tx: &MockTx) -> impl Future<Output = Outcome<(), Error>> + Send {
        self.state().record(Op::Rollback, tx.id, None);
        std::future::ready(Outcome::Ok(()))
    }
}
