//! Error types for drizzle client operations.

use std::fmt;

/// The primary error type for all client operations.
#[derive(Debug)]
pub enum Error {
    /// Invalid or missing connection parameters
    Config(ConfigError),
    /// Connection-related errors (handshake, readiness wait, disconnect)
    Connection(ConnectionError),
    /// Query execution errors
    Query(QueryError),
    /// Placeholder resolution errors
    Placeholder(PlaceholderError),
    /// Cursor misuse (programmer errors raised at the call site)
    Cursor(CursorError),
    /// Protocol errors (wire-level)
    Protocol(ProtocolError),
    /// I/O errors
    Io(std::io::Error),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Authentication failed
    Authentication,
    /// Connection lost during operation
    Disconnected,
    /// Connection refused
    Refused,
    /// Waiting for network readiness failed
    Wait,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub sqlstate: Option<String>,
    pub code: Option<u16>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Syntax error in SQL
    Syntax,
    /// Constraint violation (unique, foreign key)
    Constraint,
    /// The server connection dropped mid-query
    LostConnection,
    /// No open connection to run the query on
    NotConnected,
    /// Another query is already in flight on this connection
    Busy,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct PlaceholderError {
    pub kind: PlaceholderErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderErrorKind {
    /// Number of `?` placeholders differs from number of values
    CountMismatch,
    /// A bind value has no SQL literal form
    UnsupportedValue,
}

#[derive(Debug)]
pub struct CursorError {
    pub kind: CursorErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorErrorKind {
    /// `index()` called before the first advance
    NotOnRow,
    /// Column index outside `[0, column_count)`
    ColumnOutOfRange,
}

#[derive(Debug)]
pub struct ProtocolError {
    pub message: String,
    pub raw_data: Option<Vec<u8>>,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Is this a connection error that likely requires reconnection?
    pub fn is_connection_error(&self) -> bool {
        match self {
            Error::Connection(_) | Error::Protocol(_) | Error::Io(_) => true,
            Error::Query(q) => q.kind == QueryErrorKind::LostConnection,
            _ => false,
        }
    }

    /// Was this error raised before any I/O took place?
    pub fn is_synchronous(&self) -> bool {
        match self {
            Error::Config(_) | Error::Placeholder(_) | Error::Cursor(_) => true,
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::NotConnected | QueryErrorKind::Busy
            ),
            _ => false,
        }
    }

    /// Get SQLSTATE if available (e.g., "42000" for a syntax error)
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sqlstate.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Bare message without the category prefix, as handed to error callbacks.
    pub fn message(&self) -> String {
        match self {
            Error::Config(e) => e.message.clone(),
            Error::Connection(e) => e.message.clone(),
            Error::Query(e) => e.message.clone(),
            Error::Placeholder(e) => e.message.clone(),
            Error::Cursor(e) => e.message.clone(),
            Error::Protocol(e) => e.message.clone(),
            Error::Io(e) => e.to_string(),
            Error::Custom(msg) => msg.clone(),
        }
    }

    /// Attach the offending SQL to a query error.
    #[must_use]
    pub fn with_sql(mut self, sql: &str) -> Self {
        if let Error::Query(q) = &mut self {
            if q.sql.is_none() {
                q.sql = Some(sql.to_string());
            }
        }
        self
    }
}

impl QueryError {
    /// Create a query error of the given kind with no server details.
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            sqlstate: None,
            code: None,
            message: message.into(),
            source: None,
        }
    }

    /// Is this a duplicate-key violation?
    pub fn is_unique_violation(&self) -> bool {
        self.code == Some(1062)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => {
                if let Some(sqlstate) = &e.sqlstate {
                    write!(f, "Query error (SQLSTATE {}): {}", sqlstate, e.message)
                } else {
                    write!(f, "Query error: {}", e.message)
                }
            }
            Error::Placeholder(e) => write!(f, "Placeholder error: {}", e.message),
            Error::Cursor(e) => write!(f, "Cursor error: {}", e.message),
            Error::Protocol(e) => write!(f, "Protocol error: {}", e.message),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Config(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Protocol(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sqlstate) = &self.sqlstate {
            write!(f, "{} (SQLSTATE {})", self.message, sqlstate)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for PlaceholderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for CursorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<PlaceholderError> for Error {
    fn from(err: PlaceholderError) -> Self {
        Error::Placeholder(err)
    }
}

impl From<CursorError> for Error {
    fn from(err: CursorError) -> Self {
        Error::Cursor(err)
    }
}

impl From<ProtocolError> for Error {
    fn from(err: ProtocolError) -> Self {
        Error::Protocol(err)
    }
}

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;
