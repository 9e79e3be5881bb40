//! Filesystem and operating system adapters.
//!
//! File access checks, attachment copying, Mac OS version detection, the
//! open file descriptor limit, and HEIC conversion.

use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use rlimit::Resource;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::domain::{AppError, MacOsVersion, Result};

use super::process::failure_message;

/// Check that the process can open the given file for reading.
///
/// # Errors
/// Returns an IO error if the file cannot be opened.
pub fn file_access(path: &Path) -> Result<()> {
    fs::File::open(path)
        .map(drop)
        .map_err(|e| AppError::io(format!("open {}", path.display()), e))
}

/// Check whether a path exists. Only a definite "not found" counts as
/// nonexistent; anything else (e.g. permission denied) is an error.
///
/// # Errors
/// Returns an IO error if existence cannot be determined.
pub fn file_exists(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AppError::io(
            format!("check existence of file {}", path.display()),
            e,
        )),
    }
}

/// Join `path` under `root` even when `path` is absolute.
#[must_use]
pub fn join_under(root: &Path, path: &Path) -> PathBuf {
    let relative: PathBuf = path
        .components()
        .filter(|c| !matches!(c, Component::RootDir | Component::Prefix(_)))
        .collect();
    root.join(relative)
}

/// Expand a leading `~` with the given home directory.
#[must_use]
pub fn replace_tilde(path: &str, home_dir: &Path) -> String {
    match path.strip_prefix('~') {
        Some(rest) => join_under(home_dir, Path::new(rest))
            .to_string_lossy()
            .into_owned(),
        None => path.to_string(),
    }
}

/// Copy `src` (a file or a directory) into `dst_dir`, returning the path of
/// the copy.
///
/// With `unique`, an existing destination gets a numbered sibling
/// (`photo-1.jpg`, `photo-2.jpg`, ...). Without it, an existing destination
/// is assumed to be the same attachment and is not copied again.
/// Destinations are claimed with an exclusive create, so concurrent callers
/// never share one.
///
/// # Errors
/// Returns an IO error if the source cannot be read or the copy fails.
pub fn copy_file(src: &Path, dst_dir: &Path, unique: bool) -> Result<PathBuf> {
    let stem = src
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = src
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let metadata = fs::metadata(src)
        .map_err(|e| AppError::io(format!("stat {}", src.display()), e))?;

    let mut suffix = 0;
    loop {
        let dst = if suffix == 0 {
            dst_dir.join(format!("{stem}{ext}"))
        } else {
            dst_dir.join(format!("{stem}-{suffix}{ext}"))
        };
        match claim(&dst, metadata.is_dir()) {
            Ok(claimed) => {
                if suffix > 0 {
                    tracing::warn!(
                        "copy {} to {} - {}{} already exists; using {} instead",
                        src.display(),
                        dst_dir.display(),
                        stem,
                        ext,
                        dst.display()
                    );
                }
                fill(src, &dst, claimed, &metadata)?;
                return Ok(dst);
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !unique {
                    return Ok(dst);
                }
                suffix += 1;
            }
            Err(e) => {
                return Err(AppError::io(format!("create {}", dst.display()), e));
            }
        }
    }
}

/// A destination reserved for one copy.
enum Claimed {
    File(fs::File),
    Dir,
}

fn claim(dst: &Path, is_dir: bool) -> io::Result<Claimed> {
    if is_dir {
        fs::create_dir(dst).map(|()| Claimed::Dir)
    } else {
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(dst)
            .map(Claimed::File)
    }
}

fn fill(src: &Path, dst: &Path, claimed: Claimed, metadata: &fs::Metadata) -> Result<()> {
    match claimed {
        Claimed::Dir => copy_dir(src, dst),
        Claimed::File(mut out) => {
            let copied = fs::File::open(src)
                .and_then(|mut input| io::copy(&mut input, &mut out))
                .and_then(|_| out.set_permissions(metadata.permissions()));
            copied.map_err(|e| {
                // Leave the name free rather than holding a partial copy.
                let _ = fs::remove_file(dst);
                AppError::io(format!("copy {} to {}", src.display(), dst.display()), e)
            })
        }
    }
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src) {
        let entry = entry.map_err(|e| {
            let message = format!("walk {}", src.display());
            AppError::io(message, e.into())
        })?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|e| AppError::io(format!("create directory {}", target.display()), e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| {
                AppError::io(
                    format!("copy {} to {}", entry.path().display(), target.display()),
                    e,
                )
            })?;
        }
    }
    Ok(())
}

/// Ask the running system for its Mac OS version.
///
/// # Errors
/// Returns a configuration error if `sw_vers` is unavailable or its output
/// cannot be parsed.
pub fn detect_macos_version() -> Result<MacOsVersion> {
    let output = Command::new("sw_vers")
        .arg("-productVersion")
        .output()
        .map_err(|e| AppError::io("call sw_vers", e))?;
    if !output.status.success() {
        return Err(AppError::config(format!(
            "call sw_vers: {}",
            failure_message(&output)
        )));
    }
    let version = String::from_utf8_lossy(&output.stdout);
    version.trim().parse().map_err(AppError::config)
}

/// The process-wide limit on open file descriptors.
pub trait FileLimits: Send + Sync {
    /// Current soft limit.
    ///
    /// # Errors
    /// Returns error if the limit cannot be read.
    fn soft_limit(&self) -> Result<u64>;

    /// Raise the soft limit to at least `n`.
    ///
    /// # Errors
    /// Returns a resource limit error if `n` exceeds the hard limit or the
    /// system refuses the change.
    fn raise_soft_limit(&self, n: u64) -> Result<()>;
}

/// `RLIMIT_NOFILE` of this process. Limits are read once and cached.
#[derive(Debug, Default)]
pub struct ProcessFileLimits {
    cached: Mutex<Option<(u64, u64)>>,
}

impl ProcessFileLimits {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<(u64, u64)>>> {
        self.cached.lock().map_err(|_| AppError::ResourceLimit {
            message: "open files limit cache poisoned".into(),
        })
    }
}

/// Cached limits, reading them from the system on first use.
fn cached_limits(cached: &mut Option<(u64, u64)>) -> Result<(u64, u64)> {
    if let Some(limits) = *cached {
        return Ok(limits);
    }
    let limits = Resource::NOFILE
        .get()
        .map_err(|e| AppError::io("get open files limit", e))?;
    *cached = Some(limits);
    Ok(limits)
}

impl FileLimits for ProcessFileLimits {
    fn soft_limit(&self) -> Result<u64> {
        let mut cached = self.lock()?;
        cached_limits(&mut cached).map(|(soft, _)| soft)
    }

    fn raise_soft_limit(&self, n: u64) -> Result<()> {
        // Held until the new limit is recorded, so the limit only grows.
        let mut cached = self.lock()?;
        let (soft, hard) = cached_limits(&mut cached)?;
        if n <= soft {
            return Ok(());
        }
        if n > hard {
            return Err(AppError::ResourceLimit {
                message: format!(
                    "{n} exceeds the open files hard limit of {hard} - this can be increased with `sudo ulimit -Hn {n}`"
                ),
            });
        }
        Resource::NOFILE
            .set(n, hard)
            .map_err(|e| AppError::ResourceLimit {
                message: format!("set open files limit to {n}: {e}"),
            })?;
        *cached = Some((n, hard));
        tracing::debug!(from = soft, to = n, "Raised open files limit");
        Ok(())
    }
}

/// Converts attachments to a format the document renderer can embed.
pub trait ImageConverter: Send + Sync {
    /// Convert `src` if it needs converting, returning the path to use. A
    /// path that needs no conversion is returned unchanged.
    ///
    /// # Errors
    /// Returns a conversion error if conversion was needed but failed.
    fn convert(&self, src: &Path) -> Result<PathBuf>;
}

/// HEIC to JPEG conversion with the Mac OS `sips` tool, staging converted
/// images in a temporary directory that lives as long as the converter.
#[derive(Debug, Default)]
pub struct SipsConverter {
    temp_dir: Mutex<Option<TempDir>>,
}

impl SipsConverter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn staging_path(&self, filename: &str) -> Result<PathBuf> {
        let mut temp_dir = self.temp_dir.lock().map_err(|_| AppError::Conversion {
            path: PathBuf::from(filename),
            message: "temporary directory lock poisoned".into(),
        })?;
        if temp_dir.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("bagoup")
                .tempdir()
                .map_err(|e| AppError::io("create temporary directory", e))?;
            *temp_dir = Some(dir);
        }
        Ok(temp_dir
            .as_ref()
            .map_or_else(|| PathBuf::from(filename), |d| d.path().join(filename)))
    }
}

impl ImageConverter for SipsConverter {
    fn convert(&self, src: &Path) -> Result<PathBuf> {
        if !is_heic(src) {
            return Ok(src.to_path_buf());
        }
        let stem = src
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dst = self.staging_path(&format!("{stem}.jpeg"))?;
        let output = Command::new("sips")
            .args(["--setProperty", "format", "jpeg"])
            .args(["--setProperty", "formatOptions", "best"])
            .arg("--out")
            .arg(&dst)
            .arg(src)
            .output()
            .map_err(|e| AppError::Conversion {
                path: src.to_path_buf(),
                message: format!("run sips: {e}"),
            })?;
        if !output.status.success() {
            return Err(AppError::Conversion {
                path: src.to_path_buf(),
                message: failure_message(&output),
            });
        }
        Ok(dst)
    }
}

/// Whether the path has a `.heic` extension, in any case.
#[must_use]
pub fn is_heic(path: &Path) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("heic"))
}
