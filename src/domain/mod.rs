//! Domain layer - core types, counters, and configuration.
//!
//! This layer contains pure domain models and error types
//! without any external dependencies (DB, IO, etc.).

pub mod config;
pub mod contacts;
pub mod counts;
pub mod error;
pub mod models;

pub use config::{ExportConfig, OutputFormat};
pub use contacts::{Contact, ContactDirectory};
pub use counts::Counts;
pub use error::{AppError, Result};
pub use models::{
    Attachment, AttachmentMap, Chat, DatedMessageId, EntityChats, HandleMap, MacOsVersion, Message,
};
