//! Export configuration.
//!
//! Everything the export engine needs to know about how the user wants the
//! export laid out. Values come from an optional TOML file and are then
//! overridden by command-line flags.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::{AppError, Result};

/// Attachments root that means "use attachment paths as recorded".
pub const DEFAULT_ATTACHMENTS_PATH: &str = "/";

/// Directory, under the export root, holding attachments copied with
/// preserved paths.
pub const PRESERVED_PATH_DIR: &str = "bagoup-attachments";

/// File recording the home directory used to expand `~` in attachment paths.
pub const TILDE_EXPANSION_FILE: &str = ".tildeexpansion";

/// Chat file format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Plain text, one line per message.
    #[default]
    Text,
    /// PDF with embedded images, rendered from HTML.
    Pdf,
}

impl OutputFormat {
    /// File extension for chat files of this format.
    #[must_use]
    pub const fn extension(self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Pdf => "pdf",
        }
    }
}

/// Complete export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Path to the Messages chat database.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Folder to export into. Must not exist yet.
    #[serde(default = "default_export_path")]
    pub export_path: PathBuf,

    /// Mac OS version the database was copied from, e.g. "10.15".
    #[serde(default)]
    pub mac_os_version: Option<String>,

    /// vCard file used to resolve handles to contact names.
    #[serde(default)]
    pub contacts_path: Option<PathBuf>,

    /// Label for messages sent by the database owner.
    #[serde(default = "default_self_handle")]
    pub self_handle: String,

    /// Write one file per chat instead of merging chats with the same entity.
    #[serde(default)]
    pub separate_chats: bool,

    /// Chat file format.
    #[serde(default)]
    pub output: OutputFormat,

    /// Embed plugin payload attachments (link previews) in PDFs.
    #[serde(default)]
    pub include_ppa: bool,

    /// Copy attachments into the export folder.
    #[serde(default)]
    pub copy_attachments: bool,

    /// Keep the original directory layout of copied attachments.
    #[serde(default)]
    pub preserve_paths: bool,

    /// Root under which attachment paths are resolved.
    #[serde(default = "default_attachments_path")]
    pub attachments_path: PathBuf,

    /// Only export these entities (export folder names). Empty means all.
    #[serde(default)]
    pub entities: Vec<String>,

    /// Maximum number of entities exported at once. Zero means no limit.
    #[serde(default = "default_max_concurrent_entities")]
    pub max_concurrent_entities: usize,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            export_path: default_export_path(),
            mac_os_version: None,
            contacts_path: None,
            self_handle: default_self_handle(),
            separate_chats: false,
            output: OutputFormat::default(),
            include_ppa: false,
            copy_attachments: false,
            preserve_paths: false,
            attachments_path: default_attachments_path(),
            entities: Vec::new(),
            max_concurrent_entities: default_max_concurrent_entities(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("~/Library/Messages/chat.db")
}

fn default_export_path() -> PathBuf {
    PathBuf::from("messages-export")
}

fn default_self_handle() -> String {
    "Me".to_string()
}

fn default_attachments_path() -> PathBuf {
    PathBuf::from(DEFAULT_ATTACHMENTS_PATH)
}

fn default_max_concurrent_entities() -> usize {
    std::thread::available_parallelism().map_or(4, std::num::NonZeroUsize::get)
}

impl ExportConfig {
    /// Check that the option combination makes sense.
    ///
    /// # Errors
    /// Returns a configuration error naming the offending flag.
    pub fn validate(&self) -> Result<()> {
        if self.include_ppa && !self.is_pdf() {
            return Err(AppError::config("the --include-ppa flag requires the --pdf flag"));
        }
        if self.preserve_paths && !self.copy_attachments {
            return Err(AppError::config(
                "the --preserve-paths flag requires the --copy-attachments flag",
            ));
        }
        if !self.uses_default_attachments_path() && !self.uses_attachments() {
            return Err(AppError::config(
                "the --attachments-path flag requires a flag that uses those attachments: --copy-attachments or --pdf",
            ));
        }
        Ok(())
    }

    /// Whether chat files are PDFs.
    #[must_use]
    pub fn is_pdf(&self) -> bool {
        self.output == OutputFormat::Pdf
    }

    /// Whether the export reads attachment contents from disk.
    #[must_use]
    pub fn uses_attachments(&self) -> bool {
        self.copy_attachments || self.is_pdf()
    }

    /// Whether attachment paths are used as recorded in the database.
    #[must_use]
    pub fn uses_default_attachments_path(&self) -> bool {
        self.attachments_path.as_os_str() == DEFAULT_ATTACHMENTS_PATH
    }

    /// Root of the preserved-paths attachment copy.
    #[must_use]
    pub fn preserved_path_dir(&self) -> PathBuf {
        self.export_path.join(PRESERVED_PATH_DIR)
    }

    /// Folder for the run's log artifacts.
    #[must_use]
    pub fn log_dir(&self) -> PathBuf {
        self.export_path.join(".bagoup")
    }
}
