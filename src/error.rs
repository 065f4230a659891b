//! Error types for stratadb
//!
//! Defines a unified error type that can represent errors from every layer of
//! the file format: the log framer, the schema codec, the transaction
//! serializer and the datum engine.

use std::fmt;
use std::io;

/// Unified error type for stratadb operations.
#[derive(Debug)]
pub enum DbError {
    /// Underlying file I/O or lock acquisition failed.
    Io(io::Error),
    /// Bad magic, length mismatch, or bad checksum on a non-tail record.
    Framing(String),
    /// JSON did not match the expected shape.
    Syntax(String),
    /// A datum failed column type validation.
    Constraint(String),
    /// A transaction deleted a missing row or inserted over an existing one.
    Conflict(String),
    /// The referenced file does not exist.
    NotFound(String),
    /// Operation invalid for the component's current state.
    State(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Io(e) => write!(f, "{}", e),
            DbError::Framing(msg) => write!(f, "{}", msg),
            DbError::Syntax(msg) => write!(f, "{}", msg),
            DbError::Constraint(msg) => write!(f, "{}", msg),
            DbError::Conflict(msg) => write!(f, "{}", msg),
            DbError::NotFound(msg) => write!(f, "{}", msg),
            DbError::State(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DbError {}

impl From<io::Error> for DbError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            DbError::NotFound(e.to_string())
        } else {
            DbError::Io(e)
        }
    }
}

impl From<serde_json::Error> for DbError {
    fn from(e: serde_json::Error) -> Self {
        DbError::Syntax(e.to_string())
    }
}

impl From<std::string::FromUtf8Error> for DbError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        DbError::Framing(e.to_string())
    }
}

impl From<uuid::Error> for DbError {
    fn from(e: uuid::Error) -> Self {
        DbError::Syntax(format!("invalid uuid: {}", e))
    }
}

impl DbError {
    pub fn framing<S: Into<String>>(msg: S) -> Self {
        DbError::Framing(msg.into())
    }

    pub fn syntax<S: Into<String>>(msg: S) -> Self {
        DbError::Syntax(msg.into())
    }

    pub fn constraint<S: Into<String>>(msg: S) -> Self {
        DbError::Constraint(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        DbError::Conflict(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        DbError::NotFound(msg.into())
    }

    pub fn state<S: Into<String>>(msg: S) -> Self {
        DbError::State(msg.into())
    }

    /// Process exit code for this error, per the administrative command table.
    pub fn exit_code(&self) -> i32 {
        1
    }
}

/// Result type alias for stratadb operations.
pub type Result<T> = std::result::Result<T, DbError>;
