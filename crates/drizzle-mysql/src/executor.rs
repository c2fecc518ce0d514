//! Callback-driven query executor.
//!
//! A [`Database`] lives on one caller thread. Connect and query work runs on
//! an `asupersync` blocking pool; each finished unit of work comes back as a
//! [`Completion`] over a channel, and the caller thread turns completions
//! into callback invocations when it calls [`Database::poll`] or
//! [`Database::wait`]. Callbacks are stored in a table keyed by request id and
//! never leave the caller thread.
//!
//! Per request the order is fixed:
//! `on_start` → (worker) → `on_success` or `on_error` → `on_each`* → `on_finish`.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use asupersync::runtime::{BlockingPool, BlockingPoolOptions};
use serde::{Deserialize, Serialize};

use drizzle_core::{ColumnInfo, Error, Result, Row, Value};

use crate::column::ColumnDescriptor;
use crate::config::ConnectionConfig;
use crate::connection::{self, Connection};
use crate::placeholder;
use crate::result::ResultCursor;
use crate::types;

/// Worker threads used by [`Database::new`].
pub const DEFAULT_WORKERS: usize = 4;

type ConnectSuccessFn = Box<dyn FnOnce(ServerInfo)>;
type StartFn = Box<dyn FnOnce(&str) -> StartAction>;
type SuccessFn = Box<dyn FnOnce(&[ColumnDescriptor], Option<&[Row]>)>;
type EachFn = Box<dyn FnMut(&Row, u64, bool)>;
type ErrorFn = Box<dyn FnOnce(Error)>;
type FinishFn = Box<dyn FnOnce()>;

/// Identity of the server a connect call reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub version: String,
    pub hostname: String,
    pub user: String,
    pub database: String,
}

impl ServerInfo {
    fn of(connection: &Connection) -> Self {
        Self {
            version: connection.version(),
            hostname: connection.hostname().to_string(),
            user: connection.user().to_string(),
            database: connection.database().to_string(),
        }
    }
}

/// Decision returned by `on_start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartAction {
    /// Run the SQL as resolved
    Continue,
    /// Run this SQL instead
    Rewrite(String),
    /// Skip execution; only `on_finish` fires
    Cancel,
}

/// Options for [`Database::connect`].
pub struct ConnectOptions {
    run_async: bool,
    on_success: Option<ConnectSuccessFn>,
    on_error: Option<ErrorFn>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            run_async: true,
            on_success: None,
            on_error: None,
        }
    }
}

impl ConnectOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// `false` opens inline and fires the callback before `connect` returns.
    pub fn async_(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
        self
    }

    pub fn on_success(mut self, f: impl FnOnce(ServerInfo) + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(Error) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    fn deliver(self, result: Result<ServerInfo>) {
        match result {
            Ok(info) => {
                if let Some(f) = self.on_success {
                    f(info);
                }
            }
            Err(err) => match self.on_error {
                Some(f) => f(err),
                None => tracing::warn!(error = %err, "connect failed with no error callback"),
            },
        }
    }
}

/// Options for [`Database::query`].
pub struct QueryOptions {
    buffer: bool,
    cast: bool,
    on_start: Option<StartFn>,
    on_success: Option<SuccessFn>,
    on_each: Option<EachFn>,
    on_error: Option<ErrorFn>,
    on_finish: Option<FinishFn>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            buffer: true,
            cast: true,
            on_start: None,
            on_success: None,
            on_each: None,
            on_error: None,
            on_finish: None,
        }
    }
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect every row before `on_success` (default) or stream them.
    pub fn buffer(mut self, buffer: bool) -> Self {
        self.buffer = buffer;
        self
    }

    /// Coerce cells to typed values (default) or hand back raw text.
    pub fn cast(mut self, cast: bool) -> Self {
        self.cast = cast;
        self
    }

    pub fn on_start(mut self, f: impl FnOnce(&str) -> StartAction + 'static) -> Self {
        self.on_start = Some(Box::new(f));
        self
    }

    /// Receives the columns, plus every row when buffering.
    pub fn on_success(
        mut self,
        f: impl FnOnce(&[ColumnDescriptor], Option<&[Row]>) + 'static,
    ) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Receives each row with its zero-based index and an is-last flag.
    pub fn on_each(mut self, f: impl FnMut(&Row, u64, bool) + 'static) -> Self {
        self.on_each = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(Error) + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_finish(mut self, f: impl FnOnce() + 'static) -> Self {
        self.on_finish = Some(Box::new(f));
        self
    }

    fn succeed(&mut self, columns: &[ColumnDescriptor], rows: Option<&[Row]>) {
        if let Some(f) = self.on_success.take() {
            f(columns, rows);
        }
    }

    fn each(&mut self, row: &Row, index: u64, is_last: bool) {
        if let Some(f) = self.on_each.as_mut() {
            f(row, index, is_last);
        }
    }

    fn fail(&mut self, err: Error) {
        match self.on_error.take() {
            Some(f) => f(err),
            None => tracing::warn!(error = %err, "query failed with no error callback"),
        }
    }

    fn finish(mut self) {
        if let Some(f) = self.on_finish.take() {
            f();
        }
    }
}

struct QueryRequest {
    sql: String,
    options: QueryOptions,
    columns: Arc<ColumnInfo>,
}

enum Request {
    Connect(ConnectOptions),
    Query(QueryRequest),
}

type FetchedRow = Option<(Row, u64, bool)>;

/// Finished unit of worker work, delivered to the caller thread.
enum Completion {
    Connected {
        id: u64,
        result: Result<ServerInfo>,
    },
    Buffered {
        id: u64,
        result: Result<(Vec<ColumnDescriptor>, Vec<Row>)>,
    },
    Opened {
        id: u64,
        result: Result<(ResultCursor, Arc<ColumnInfo>)>,
    },
    Fetched {
        id: u64,
        cursor: ResultCursor,
        result: Result<FetchedRow>,
    },
    Panicked {
        id: u64,
    },
}

fn run_buffered(
    connection: &Connection,
    sql: &str,
    cast: bool,
) -> Result<(Vec<ColumnDescriptor>, Vec<Row>)> {
    let mut cursor = connection.query(sql)?;
    let columns = cursor.columns().to_vec();
    let info = types::column_info(&columns);
    let mut rows = Vec::new();
    while let Some(raw) = cursor.next()? {
        rows.push(types::cast_row(&columns, &info, raw, cast));
    }
    tracing::trace!(rows = rows.len(), "buffered result");
    Ok((columns, rows))
}

fn fetch_row(cursor: &mut ResultCursor, info: &Arc<ColumnInfo>, cast: bool) -> Result<FetchedRow> {
    let Some(raw) = cursor.next()?.cloned() else {
        return Ok(None);
    };
    let row = types::cast_row(cursor.columns(), info, &raw, cast);
    Ok(Some((row, cursor.index()?, !cursor.has_next())))
}

/// Per-thread front end for one connection.
pub struct Database {
    connection: Arc<Connection>,
    pool: BlockingPool,
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    requests: HashMap<u64, Request>,
    next_id: u64,
    active_query: Option<u64>,
    pending_connect: Option<u64>,
    close_requested: bool,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("connection", &self.connection)
            .field("pending", &self.requests.len())
            .field("active_query", &self.active_query)
            .field("pending_connect", &self.pending_connect)
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Create a database handle with [`DEFAULT_WORKERS`] worker threads.
    pub fn new(config: ConnectionConfig) -> Self {
        Self::with_workers(config, DEFAULT_WORKERS)
    }

    /// Create a database handle with up to `workers` worker threads.
    pub fn with_workers(config: ConnectionConfig, workers: usize) -> Self {
        let options = BlockingPoolOptions {
            thread_name_prefix: "drizzle".to_string(),
            ..BlockingPoolOptions::default()
        };
        let (sender, receiver) = mpsc::channel();
        Self {
            connection: Arc::new(Connection::new(config)),
            pool: BlockingPool::with_config(1, workers.max(1), options),
            sender,
            receiver,
            requests: HashMap::new(),
            next_id: 0,
            active_query: None,
            pending_connect: None,
            close_requested: false,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    fn in_flight(&self) -> bool {
        self.active_query.is_some() || self.pending_connect.is_some()
    }

    /// Number of requests whose terminal callback has not fired yet.
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    fn next_request_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Run `job` on a worker and post its completion back to this thread.
    fn spawn(&self, id: u64, job: impl FnOnce() -> Completion + Send + 'static) {
        let sender = self.sender.clone();
        self.pool.spawn(move || {
            let completion = catch_unwind(AssertUnwindSafe(job)).unwrap_or_else(|_| {
                tracing::warn!(id, "worker task panicked");
                Completion::Panicked { id }
            });
            // the receiver only disappears with the Database itself
            let _ = sender.send(completion);
        });
    }

    /// Open the connection.
    ///
    /// Configuration problems, and a connect or query still in flight, are
    /// returned immediately. Otherwise exactly one
    /// of the callbacks fires: inline when `async_(false)`, else during a
    /// later [`poll`](Self::poll) or [`wait`](Self::wait).
    #[tracing::instrument(level = "debug", skip(self, options))]
    pub fn connect(&mut self, options: ConnectOptions) -> Result<()> {
        self.connection.config().validate()?;
        if self.in_flight() {
            return Err(connection::busy());
        }

        if !options.run_async {
            let result = self
                .connection
                .open()
                .map(|()| ServerInfo::of(&self.connection));
            options.deliver(result);
            return Ok(());
        }

        let id = self.next_request_id();
        self.requests.insert(id, Request::Connect(options));
        self.pending_connect = Some(id);
        let connection = Arc::clone(&self.connection);
        tracing::debug!(id, "scheduling connect");
        self.spawn(id, move || Completion::Connected {
            id,
            result: connection.open().map(|()| ServerInfo::of(&connection)),
        });
        Ok(())
    }

    /// Close the connection. Safe when already closed.
    ///
    /// A worker may hold the session while it waits on the server, so with a
    /// connect or query in flight the close is deferred until that request
    /// settles, just before its final callback fires.
    pub fn disconnect(&mut self) {
        if self.in_flight() {
            tracing::debug!("deferring disconnect until the in-flight request settles");
            self.close_requested = true;
            return;
        }
        self.connection.close();
    }

    /// Release the in-flight marker for `id` and run a deferred disconnect.
    fn settle(&mut self, id: u64) {
        if self.active_query == Some(id) {
            self.active_query = None;
        }
        if self.pending_connect == Some(id) {
            self.pending_connect = None;
        }
        if self.close_requested && !self.in_flight() {
            self.close_requested = false;
            self.connection.close();
        }
    }

    pub fn escape(&self, text: &str) -> String {
        self.connection.escape(text)
    }

    /// Resolve placeholders and schedule `sql`.
    ///
    /// Placeholder errors, a closed connection, and a query already in flight
    /// are returned immediately without firing any callback.
    #[tracing::instrument(level = "debug", skip(self, values, options))]
    pub fn query(&mut self, sql: &str, values: &[Value], mut options: QueryOptions) -> Result<()> {
        let connection = Arc::clone(&self.connection);
        let escape = |text: &str| connection.escape(text);
        let mut sql = placeholder::parse_query(sql, values, &escape)?;

        if self.active_query.is_some() {
            return Err(connection::busy().with_sql(&sql));
        }
        if !self.connection.is_open() {
            return Err(connection::not_connected().with_sql(&sql));
        }

        if let Some(on_start) = options.on_start.take() {
            match on_start(&sql) {
                StartAction::Continue => {}
                StartAction::Rewrite(rewritten) => sql = rewritten,
                StartAction::Cancel => {
                    tracing::debug!(sql, "query cancelled by on_start");
                    options.finish();
                    return Ok(());
                }
            }
        }

        let id = self.next_request_id();
        let buffer = options.buffer;
        let cast = options.cast;
        self.requests.insert(
            id,
            Request::Query(QueryRequest {
                sql: sql.clone(),
                options,
                columns: Arc::new(ColumnInfo::default()),
            }),
        );
        self.active_query = Some(id);
        tracing::debug!(id, buffer, "scheduling query");

        let connection = Arc::clone(&self.connection);
        if buffer {
            self.spawn(id, move || Completion::Buffered {
                id,
                result: run_buffered(&connection, &sql, cast),
            });
        } else {
            self.spawn(id, move || Completion::Opened {
                id,
                result: connection.query(&sql).map(|cursor| {
                    let info = types::column_info(cursor.columns());
                    (cursor, info)
                }),
            });
        }
        Ok(())
    }

    fn schedule_fetch(&self, id: u64, mut cursor: ResultCursor, info: Arc<ColumnInfo>, cast: bool) {
        self.spawn(id, move || {
            let result = fetch_row(&mut cursor, &info, cast);
            Completion::Fetched { id, cursor, result }
        });
    }

    /// Dispatch every completion that is already available.
    ///
    /// Never blocks. Returns the number of completions handled.
    pub fn poll(&mut self) -> usize {
        let mut handled = 0;
        while let Ok(completion) = self.receiver.try_recv() {
            self.dispatch(completion);
            handled += 1;
        }
        handled
    }

    /// Block until no request is pending, dispatching as completions arrive.
    pub fn wait(&mut self) {
        while !self.requests.is_empty() {
            match self.receiver.recv() {
                Ok(completion) => self.dispatch(completion),
                Err(_) => break,
            }
        }
    }

    fn take_query(&mut self, id: u64) -> Option<QueryRequest> {
        self.settle(id);
        match self.requests.remove(&id) {
            Some(Request::Query(request)) => Some(request),
            Some(other) => {
                self.requests.insert(id, other);
                None
            }
            None => None,
        }
    }

    fn dispatch(&mut self, completion: Completion) {
        match completion {
            Completion::Connected { id, result } => {
                if let Some(Request::Connect(options)) = self.requests.remove(&id) {
                    tracing::debug!(id, ok = result.is_ok(), "connect completed");
                    self.settle(id);
                    options.deliver(result);
                }
            }
            Completion::Buffered { id, result } => {
                let Some(mut request) = self.take_query(id) else {
                    return;
                };
                match result {
                    Ok((columns, rows)) => {
                        request.options.succeed(&columns, Some(&rows));
                        let last = rows.len().saturating_sub(1);
                        for (index, row) in rows.iter().enumerate() {
                            request.options.each(row, index as u64, index == last);
                        }
                    }
                    Err(err) => request.options.fail(err.with_sql(&request.sql)),
                }
                request.options.finish();
            }
            Completion::Opened { id, result } => match result {
                Ok((cursor, info)) => {
                    let Some(Request::Query(request)) = self.requests.get_mut(&id) else {
                        return;
                    };
                    request.options.succeed(cursor.columns(), None);
                    request.columns = Arc::clone(&info);
                    let cast = request.options.cast;
                    if cursor.has_next() {
                        self.schedule_fetch(id, cursor, info, cast);
                    } else {
                        drop(cursor);
                        if let Some(request) = self.take_query(id) {
                            request.options.finish();
                        }
                    }
                }
                Err(err) => {
                    if let Some(mut request) = self.take_query(id) {
                        request.options.fail(err.with_sql(&request.sql));
                        request.options.finish();
                    }
                }
            },
            Completion::Fetched { id, cursor, result } => {
                let Some(Request::Query(request)) = self.requests.get_mut(&id) else {
                    return;
                };
                let more = match result {
                    Ok(Some((row, index, is_last))) => {
                        request.options.each(&row, index, is_last);
                        !is_last
                    }
                    Ok(None) => false,
                    Err(err) => {
                        let err = err.with_sql(&request.sql);
                        request.options.fail(err);
                        false
                    }
                };
                if more {
                    let info = Arc::clone(&request.columns);
                    let cast = request.options.cast;
                    self.schedule_fetch(id, cursor, info, cast);
                } else {
                    drop(cursor);
                    if let Some(request) = self.take_query(id) {
                        request.options.finish();
                    }
                }
            }
            Completion::Panicked { id } => {
                let err = Error::Custom("Worker task panicked".to_string());
                let request = self.requests.remove(&id);
                self.settle(id);
                match request {
                    Some(Request::Connect(options)) => options.deliver(Err(err)),
                    Some(Request::Query(mut request)) => {
                        request.options.fail(err);
                        request.options.finish();
                    }
                    None => {}
                }
            }
        }
    }
}
