//! Domain-level error types for bagoup.
//!
//! All errors are typed with `thiserror`. Expected conditions such as missing
//! attachments or failed image conversions never reach this type; they are
//! logged and counted where they happen.

use std::fmt::Display;
use std::path::PathBuf;

use thiserror::Error;

/// Where to report violated assumptions about the Messages database.
pub const ISSUE_HINT: &str = "open an issue at https://github.com/tagatac/bagoup/issues";

/// How to grant the terminal access to protected Messages files.
pub const FILE_ACCESS_HELP: &str =
    "https://github.com/tagatac/bagoup/blob/master/README.md#protected-file-access";

/// Application-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    /// Failed to open or query the database.
    #[error("{message}")]
    Database {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A row that must be unique per ID was found more than once.
    #[error(
        "multiple {kind}s with the same ID: {id} - {kind} ID uniqueness assumption violated - {hint}",
        hint = ISSUE_HINT
    )]
    IntegrityViolation { kind: &'static str, id: i64 },

    /// Configuration or environment error.
    #[error("{message}")]
    Config { message: String },

    /// IO operation failed.
    #[error("{message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// The rich-text fallback body of a message could not be decoded.
    #[error("decode attributedBody: {message}")]
    Decode { message: String },

    /// An attachment could not be converted to an embeddable image format.
    #[error("convert {path} to JPEG: {message}")]
    Conversion { path: PathBuf, message: String },

    /// The external document renderer failed.
    #[error("render {path}: {message}")]
    Render { path: PathBuf, message: String },

    /// The open file descriptor limit could not be raised far enough.
    #[error("{message}")]
    ResourceLimit { message: String },

    /// A concurrent export task died before reporting a result.
    #[error("export task failed: {message}")]
    Task { message: String },

    /// Another error, annotated with what was being attempted.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<AppError>,
    },
}

impl AppError {
    /// Create a database error from a rusqlite error.
    pub fn database(context: impl Display, err: rusqlite::Error) -> Self {
        Self::Database {
            message: format!("{context}: {err}"),
            source: Some(Box::new(err)),
        }
    }

    /// Create an IO error with context.
    pub fn io(context: impl Display, err: std::io::Error) -> Self {
        Self::Io {
            message: format!("{context}: {err}"),
            source: Some(err),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Wrap this error with a description of the failed operation.
    #[must_use]
    pub fn context(self, context: impl Display) -> Self {
        Self::Context {
            context: context.to_string(),
            source: Box::new(self),
        }
    }
}

/// Result type alias using `AppError`.
pub type Result<T> = std::result::Result<T, AppError>;
