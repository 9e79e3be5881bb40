//! Infrastructure layer - external adapters (database, filesystem, tools).
//!
//! This layer handles all I/O operations and external dependencies.

pub mod chat_db;
pub mod config;
pub mod opsys;
pub mod outfile;
pub mod process;
pub mod typedstream;
pub mod vcard;

pub use chat_db::{ChatDb, DataSource};
pub use config::load_config_from_file;
pub use opsys::{FileLimits, ImageConverter, ProcessFileLimits, SipsConverter};
pub use outfile::{DocumentRenderer, OutFile, PdfOutFile, TxtOutFile, WeasyPrint};
pub use typedstream::BodyDecoder;
pub use vcard::load_contacts;
