//! CLI interface using clap.
//!
//! Flags override values from the optional `--config` file, which in turn
//! override the built-in defaults.

use std::path::PathBuf;

use clap::Parser;

use crate::domain::{ExportConfig, OutputFormat, Result};
use crate::infrastructure::load_config_from_file;

/// bagoup - Export Mac OS Messages chats to text or PDF files.
#[derive(Parser, Debug)]
#[command(name = "bagoup")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose logging (use multiple times for more verbosity).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// TOML file with export settings. Flags override its values.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the Messages chat database file.
    #[arg(short = 'i', long, value_name = "DB")]
    pub db_path: Option<PathBuf>,

    /// Path to which the Messages will be exported.
    #[arg(short = 'o', long, value_name = "EXPORT")]
    pub export_path: Option<PathBuf>,

    /// Version of Mac OS, e.g. '10.15', from which the database was copied.
    #[arg(short, long, value_name = "VERSION")]
    pub mac_os_version: Option<String>,

    /// Path to the contacts vCard file.
    #[arg(short, long, value_name = "CONTACTS")]
    pub contacts_path: Option<PathBuf>,

    /// Handle to use for messages sent by you.
    #[arg(short, long = "self-handle", value_name = "SELF")]
    pub self_handle: Option<String>,

    /// Export chats separately, even if they share an entity.
    #[arg(long)]
    pub separate_chats: bool,

    /// Export text and images to PDF files (requires weasyprint).
    #[arg(short, long)]
    pub pdf: bool,

    /// Include plugin payload attachments (e.g. link previews) in PDFs.
    #[arg(long)]
    pub include_ppa: bool,

    /// Copy attachments to the same folder as the chat.
    #[arg(short = 'a', long)]
    pub copy_attachments: bool,

    /// Copy attachments into a mirrored directory structure under the
    /// export folder.
    #[arg(short = 'r', long)]
    pub preserve_paths: bool,

    /// Root directory of the attachments, e.g. a preserved-paths copy from
    /// an earlier export.
    #[arg(short = 't', long, value_name = "ATTACHMENTS_ROOT")]
    pub attachments_path: Option<PathBuf>,

    /// Export only chats with this entity (repeatable).
    #[arg(short, long = "entity", value_name = "ENTITY")]
    pub entities: Vec<String>,

    /// Maximum number of entities exported at once (0 = no limit).
    #[arg(short = 'j', long = "max-concurrent", value_name = "MAX_CONCURRENT")]
    pub max_concurrent: Option<usize>,
}

impl Cli {
    /// Build the export configuration: the config file (or defaults) with
    /// every given flag applied on top.
    ///
    /// # Errors
    /// Returns error if the config file cannot be read or parsed.
    pub fn export_config(&self) -> Result<ExportConfig> {
        let base = match &self.config {
            Some(path) => load_config_from_file(path)?,
            None => ExportConfig::default(),
        };
        Ok(self.apply_to(base))
    }

    fn apply_to(&self, mut config: ExportConfig) -> ExportConfig {
        if let Some(path) = &self.db_path {
            config.db_path.clone_from(path);
        }
        if let Some(path) = &self.export_path {
            config.export_path.clone_from(path);
        }
        if self.mac_os_version.is_some() {
            config.mac_os_version.clone_from(&self.mac_os_version);
        }
        if self.contacts_path.is_some() {
            config.contacts_path.clone_from(&self.contacts_path);
        }
        if let Some(handle) = &self.self_handle {
            config.self_handle.clone_from(handle);
        }
        if let Some(path) = &self.attachments_path {
            config.attachments_path.clone_from(path);
        }
        if !self.entities.is_empty() {
            config.entities.clone_from(&self.entities);
        }
        if let Some(n) = self.max_concurrent {
            config.max_concurrent_entities = n;
        }
        if self.pdf {
            config.output = OutputFormat::Pdf;
        }
        config.separate_chats |= self.separate_chats;
        config.include_ppa |= self.include_ppa;
        config.copy_attachments |= self.copy_attachments;
        config.preserve_paths |= self.preserve_paths;
        config
    }
}
