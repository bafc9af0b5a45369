//! Capability traits implemented by database clients.
//!
//! A [`Backend`] is the black-box RPC client that actually talks to the
//! database: it can begin, commit and roll back transactions and run
//! statements inside them. Implementations classify failures into
//! [`Error::Aborted`](crate::Error::Aborted) (the backend detected a conflict
//! and the whole transaction may be retried) and
//! [`Error::Backend`](crate::Error::Backend) (the statement itself failed).
//!
//! All operations take a [`Cx`] and return an [`Outcome`] so that they are
//! cancel-correct in the same way as every other asupersync operation.

// Allow `impl Future` return types in trait methods - intentional for async trait compat
#![allow(clippy::manual_async_fn)]

use std::future::Future;

use asupersync::{Cx, Outcome};

use crate::error::Error;
use crate::row::Row;
use crate::statement::Statement;
use crate::timestamp::{Timestamp, TimestampBound};

/// A forward-only stream of rows produced by a query.
pub trait RowStream: Send {
    /// Fetch the next row, or `None` once the result set is exhausted.
    fn next_row(&mut self, cx: &Cx) -> impl Future<Output = Outcome<Option<Row>, Error>> + Send;
}

/// Database client capable of running read/write transactions.
pub trait Backend: Send + Sync {
    /// Handle to one underlying backend transaction.
    type Tx: Send + Sync;

    /// Rows returned by [`Backend::execute_query`].
    type Rows: RowStream;

    /// Begin a new read/write transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Tx, Error>> + Send;

    /// Execute a DML statement and return its update count.
    fn execute(
        &self,
        cx: &Cx,
        tx: &Self::Tx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<i64, Error>> + Send;

    /// Execute DML statements as one batch and return one update count each.
    fn execute_batch(
        &self,
        cx: &Cx,
        tx: &Self::Tx,
        statements: &[Statement],
    ) -> impl Future<Output = Outcome<Vec<i64>, Error>> + Send;

    /// Start a query. Rows are fetched lazily through the returned stream.
    fn execute_query(
        &self,
        cx: &Cx,
        tx: &Self::Tx,
        statement: &Statement,
        bound: Option<&TimestampBound>,
    ) -> impl Future<Output = Outcome<Self::Rows, Error>> + Send;

    /// Commit the transaction and return its commit timestamp.
    fn commit(&self, cx: &Cx, tx: &Self::Tx) -> impl Future<Output = Outcome<Timestamp, Error>> + Send;

    /// Roll back the transaction.
    fn rollback(&self, cx: &Cx, tx: &Self::Tx) -> impl Future<Output = Outcome<(), Error>> + Send;
}
