//! One complete export run: checks, setup, export, results.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use crate::domain::config::TILDE_EXPANSION_FILE;
use crate::domain::error::FILE_ACCESS_HELP;
use crate::domain::{AppError, Counts, ExportConfig, MacOsVersion, Result};
use crate::infrastructure::opsys::{detect_macos_version, file_access, file_exists, replace_tilde};
use crate::infrastructure::{load_contacts, ChatDb, DataSource};

use super::context::ExportContext;
use super::exporter::export_chats_into;
use super::report::{format_results, write_results, RunSummary};

/// Run an export with the system tools, printing the results report once
/// the export has run, whether or not it succeeded.
///
/// # Errors
/// Returns error if the configuration or environment is unusable, or the
/// export fails.
pub async fn run(config: ExportConfig) -> Result<RunSummary> {
    run_with(config, ExportContext::new).await
}

/// Run an export, building the export context with `make_context`.
///
/// # Errors
/// Returns error if the configuration or environment is unusable, or the
/// export fails.
pub async fn run_with<F>(mut config: ExportConfig, make_context: F) -> Result<RunSummary>
where
    F: FnOnce(ExportConfig, Arc<dyn DataSource>) -> ExportContext,
{
    let start = Instant::now();
    config.validate()?;
    validate_paths(&mut config)?;
    let home_dir = attachments_home_dir(&config)?;

    let version = match &config.mac_os_version {
        Some(v) => v.parse::<MacOsVersion>().map_err(AppError::config)?,
        None => detect_macos_version().map_err(|e| {
            e.context("get Mac OS version - FIX: specify the Mac OS version from which chat.db was copied with the --mac-os-version option")
        })?,
    };
    tracing::info!(%version, db = %config.db_path.display(), "Starting export");

    let contacts = match &config.contacts_path {
        Some(path) => Some(Arc::new(load_contacts(path).map_err(|e| {
            e.context(format!("get contacts from vcard file {:?}", path.display().to_string()))
        })?)),
        None => None,
    };

    let mut db = ChatDb::open(&config.db_path, config.self_handle.clone())?
        .with_home_dir(home_dir.clone());
    db.init(Some(version)).map_err(|e| {
        e.context(format!(
            "initialize the database for reading on Mac OS version {version}"
        ))
    })?;

    let ctx = Arc::new(make_context(config.clone(), Arc::new(db)));
    let mut counts = Counts::default();
    let exported = export_chats_into(Arc::clone(&ctx), contacts, &mut counts)
        .await
        .map_err(|e| e.context("export chats"));
    // Drops any converted images along with the converter.
    drop(ctx);

    let exported = exported.and_then(|()| {
        write_tilde_expansion_file(&config, &home_dir)
            .map_err(|e| e.context("write out tilde expansion file"))
    });

    let summary = RunSummary::new(&config.export_path, counts, start.elapsed());
    println!("{}", format_results(&summary));
    exported?;
    write_results(&config.log_dir(), &summary)?;
    Ok(summary)
}

/// Expand and absolutize paths, and refuse to overwrite an earlier export.
fn validate_paths(config: &mut ExportConfig) -> Result<()> {
    let home = dirs::home_dir().unwrap_or_default();
    config.db_path = PathBuf::from(replace_tilde(&config.db_path.to_string_lossy(), &home));
    file_access(&config.db_path).map_err(|e| {
        e.context(format!(
            "test DB file {:?} - FIX: {FILE_ACCESS_HELP}",
            config.db_path.display().to_string()
        ))
    })?;

    config.export_path = absolute(&config.export_path)?;
    if file_exists(&config.export_path)? {
        return Err(AppError::config(format!(
            "export folder {:?} already exists - FIX: move it or specify a different export path with the --export-path option",
            config.export_path.display().to_string()
        )));
    }

    config.attachments_path = absolute(&config.attachments_path)?;
    if let Some(contacts) = &config.contacts_path {
        let expanded = replace_tilde(&contacts.to_string_lossy(), &home);
        config.contacts_path = Some(PathBuf::from(expanded));
    }
    Ok(())
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).map_err(|e| {
        AppError::io(
            format!("convert {} to an absolute path", path.display()),
            e,
        )
    })
}

/// Home directory that `~` in attachment paths refers to. Attachments read
/// from an earlier preserved-paths copy use the home directory recorded
/// with that copy.
fn attachments_home_dir(config: &ExportConfig) -> Result<PathBuf> {
    if config.uses_default_attachments_path() {
        return Ok(dirs::home_dir().unwrap_or_default());
    }
    let path = config.attachments_path.join(TILDE_EXPANSION_FILE);
    let home = fs::read_to_string(&path).map_err(|e| {
        AppError::io(
            format!(
                "read tilde expansion file {:?} - POSSIBLE FIX: create a file {TILDE_EXPANSION_FILE} with the expanded home directory from the previous run and place it at the root of the preserved-paths copied attachments directory (usually {:?})",
                path.display().to_string(),
                crate::domain::config::PRESERVED_PATH_DIR
            ),
            e,
        )
    })?;
    Ok(PathBuf::from(home.trim_end()))
}

/// Record the home directory next to attachments copied with preserved
/// paths, so they can be used as an attachments root later.
fn write_tilde_expansion_file(config: &ExportConfig, home_dir: &Path) -> Result<()> {
    if !config.preserve_paths {
        return Ok(());
    }
    let dir = config.preserved_path_dir();
    fs::create_dir_all(&dir)
        .map_err(|e| AppError::io(format!("create directory {}", dir.display()), e))?;
    let path = dir.join(TILDE_EXPANSION_FILE);
    fs::write(&path, home_dir.to_string_lossy().as_bytes())
        .map_err(|e| AppError::io(format!("write {}", path.display()), e))
}
