//! Application layer - use cases and orchestration.
//!
//! This layer contains the export logic: grouping chats into files, writing
//! them, and running the whole export.

pub mod context;
pub mod exporter;
pub mod report;
pub mod runner;
pub mod writer;

pub use context::ExportContext;
pub use runner::run;
