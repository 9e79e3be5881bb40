//! Chat output files: plain text, or HTML rendered to PDF.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use crate::domain::{AppError, Result};

use super::process::{failure_message, run_with_stdin};

/// Image types the PDF renderer can embed inline, by lowercase extension.
const EMBEDDABLE_IMAGE_TYPES: &[&str] = &[
    "avif", "bmp", "gif", "ico", "jpeg", "jpg", "png", "svg", "tif", "tiff", "webp",
];

/// Link preview bundles, embeddable on request.
const PLUGIN_PAYLOAD_TYPE: &str = "pluginpayloadattachment";

/// Placeholder for U+FFFC, which Messages puts where an attachment sat.
const OBJECT_REPLACEMENT: char = '\u{FFFC}';

/// One chat output file.
pub trait OutFile: Send {
    /// Path of the file on disk.
    fn name(&self) -> &Path;

    /// Append a formatted message line.
    ///
    /// # Errors
    /// Returns error if the line cannot be written.
    fn write_message(&mut self, msg: &str) -> Result<()>;

    /// Append an attachment, embedded if the format allows it. Returns
    /// whether it was embedded.
    ///
    /// # Errors
    /// Returns error if the attachment cannot be written.
    fn write_attachment(&mut self, path: &Path) -> Result<bool>;

    /// Append a placeholder naming an attachment that is not included.
    ///
    /// # Errors
    /// Returns error if the placeholder cannot be written.
    fn reference_attachment(&mut self, name: &str) -> Result<()>;

    /// Finish the in-memory representation. Returns the number of images
    /// the final render will open.
    ///
    /// # Errors
    /// Returns error if staging fails.
    fn stage(&mut self) -> Result<usize>;

    /// Write everything out to disk.
    ///
    /// # Errors
    /// Returns error if the file cannot be written or rendered.
    fn flush(&mut self) -> Result<()>;
}

/// Plain text chat file.
pub struct TxtOutFile {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TxtOutFile {
    /// Creates (or truncates) the file.
    ///
    /// # Errors
    /// Returns error if the file cannot be created.
    pub fn create(path: &Path) -> Result<Self> {
        let file = File::create(path)
            .map_err(|e| AppError::io(format!("create file {}", path.display()), e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn write(&mut self, s: &str) -> Result<()> {
        self.writer
            .write_all(s.as_bytes())
            .map_err(|e| AppError::io(format!("write to {}", self.path.display()), e))
    }
}

impl OutFile for TxtOutFile {
    fn name(&self) -> &Path {
        &self.path
    }

    fn write_message(&mut self, msg: &str) -> Result<()> {
        self.write(msg)
    }

    fn write_attachment(&mut self, path: &Path) -> Result<bool> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.reference_attachment(&name)?;
        Ok(false)
    }

    fn reference_attachment(&mut self, name: &str) -> Result<()> {
        self.write(&format!("<attached: {name}>\n"))
    }

    fn stage(&mut self) -> Result<usize> {
        Ok(0)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| AppError::io(format!("flush {}", self.path.display()), e))
    }
}

/// Turns an HTML document into a PDF file.
pub trait DocumentRenderer: Send + Sync {
    /// Render `html` into `output`.
    ///
    /// # Errors
    /// Returns a render error if the renderer fails.
    fn render(&self, html: &[u8], output: &Path) -> Result<()>;
}

/// Renders with the `weasyprint` command, HTML on stdin, PDF on stdout.
#[derive(Debug, Clone, Default)]
pub struct WeasyPrint;

impl DocumentRenderer for WeasyPrint {
    fn render(&self, html: &[u8], output: &Path) -> Result<()> {
        let result = run_with_stdin(
            Command::new("weasyprint").args(["--base-url", "/", "-", "-"]),
            html,
        )
        .map_err(|e| AppError::Render {
            path: output.to_path_buf(),
            message: format!("run weasyprint: {e}"),
        })?;
        if !result.status.success() {
            return Err(AppError::Render {
                path: output.to_path_buf(),
                message: failure_message(&result),
            });
        }
        std::fs::write(output, &result.stdout)
            .map_err(|e| AppError::io(format!("write {}", output.display()), e))
    }
}

/// PDF chat file, built up as HTML and rendered on flush.
pub struct PdfOutFile {
    path: PathBuf,
    title: String,
    lines: Vec<String>,
    include_ppa: bool,
    staged: Option<String>,
    renderer: Arc<dyn DocumentRenderer>,
}

impl PdfOutFile {
    /// Creates the (still empty) PDF file.
    ///
    /// # Errors
    /// Returns error if the file cannot be created.
    pub fn create(
        path: &Path,
        include_ppa: bool,
        renderer: Arc<dyn DocumentRenderer>,
    ) -> Result<Self> {
        File::create(path)
            .map_err(|e| AppError::io(format!("create file {}", path.display()), e))?;
        let title = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self {
            path: path.to_path_buf(),
            title,
            lines: Vec::new(),
            include_ppa,
            staged: None,
            renderer,
        })
    }

    fn is_embeddable(&self, path: &Path) -> bool {
        let Some(ext) = path.extension() else {
            return false;
        };
        let ext = ext.to_string_lossy().to_lowercase();
        EMBEDDABLE_IMAGE_TYPES.contains(&ext.as_str())
            || (self.include_ppa && ext == PLUGIN_PAYLOAD_TYPE)
    }

    fn html(&self) -> String {
        let mut html = String::from(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n",
        );
        html.push_str(&format!(
            "<title>{}</title>\n",
            html_escape::encode_text(&self.title)
        ));
        html.push_str(
            "<style>img { max-width: 100%; max-height: 25cm; } body { font-family: sans-serif; }</style>\n</head>\n<body>\n",
        );
        for line in &self.lines {
            html.push_str(line);
            html.push('\n');
        }
        html.push_str("</body>\n</html>\n");
        html
    }
}

impl OutFile for PdfOutFile {
    fn name(&self) -> &Path {
        &self.path
    }

    fn write_message(&mut self, msg: &str) -> Result<()> {
        let escaped = html_escape::encode_text(msg)
            .replace('\n', "<br/>")
            .replace(OBJECT_REPLACEMENT, "");
        self.lines.push(escaped);
        Ok(())
    }

    fn write_attachment(&mut self, path: &Path) -> Result<bool> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !self.is_embeddable(path) {
            self.reference_attachment(&name)?;
            return Ok(false);
        }
        self.lines.push(format!(
            "<img src=\"{}\" alt=\"{}\"/><br/>",
            url_escape_path(path),
            html_escape::encode_double_quoted_attribute(&name)
        ));
        Ok(true)
    }

    fn reference_attachment(&mut self, name: &str) -> Result<()> {
        self.lines.push(format!(
            "<em>&lt;attached: {}&gt;</em><br/>",
            html_escape::encode_text(name)
        ));
        Ok(())
    }

    fn stage(&mut self) -> Result<usize> {
        let html = self.html();
        let images = html.matches("<img").count();
        self.staged = Some(html);
        Ok(images)
    }

    fn flush(&mut self) -> Result<()> {
        let html = match self.staged.take() {
            Some(html) => html,
            None => self.html(),
        };
        self.renderer.render(html.as_bytes(), &self.path)
    }
}

/// Percent-encode each component of a path, keeping the separators.
fn url_escape_path(path: &Path) -> String {
    path.to_string_lossy()
        .split('/')
        .map(|part| urlencoding::encode(part).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
