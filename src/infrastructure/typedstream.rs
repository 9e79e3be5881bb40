//! Decoding of `attributedBody`, the typedstream-encoded rich text that newer
//! Messages versions store instead of plain `text`.
//!
//! The binary format is decoded by the external `typedstream-decode` tool.
//! Its output still carries `NSAttributedString` attribute dictionaries
//! (data detectors, one-time codes, message parts) around the text runs,
//! which are stripped here.

use std::process::Command;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::domain::{AppError, Result};

use super::process::{failure_message, run_with_stdin};

/// Decoder program expected on the `PATH`.
pub const TYPEDSTREAM_DECODER: &str = "typedstream-decode";

/// Single-line attribute entries, with the dictionary braces that may open
/// or close around them.
static ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(\{\n)? {4}"__kIM[[:alpha:]]+" = ([^\n]+);\n\}?"#)
        .unwrap_or_else(|e| unreachable!("invalid attribute pattern: {e}"))
});

/// Attribute entries whose value is a nested dictionary, e.g. one-time codes.
static MULTILINE_ATTRIBUTE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(\{\n)? {4}"__kIM[[:alpha:]]+" = {5}\{\n( {8}[[:alpha:]]+ = [^\n]+;\n)+ {4}\};\n\}?"#,
    )
    .unwrap_or_else(|e| unreachable!("invalid multiline attribute pattern: {e}"))
});

/// Turns an `attributedBody` blob into readable text.
pub trait BodyDecoder: Send + Sync {
    /// Decode the blob into the decoder's textual dump, attributes included.
    ///
    /// # Errors
    /// Returns a decode error if the blob cannot be decoded.
    fn decode(&self, body: &[u8]) -> Result<String>;
}

/// Runs the `typedstream-decode` program.
#[derive(Debug, Clone)]
pub struct TypedStreamCommand {
    program: String,
}

impl TypedStreamCommand {
    /// Use a specific decoder program.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for TypedStreamCommand {
    fn default() -> Self {
        Self::new(TYPEDSTREAM_DECODER)
    }
}

impl BodyDecoder for TypedStreamCommand {
    fn decode(&self, body: &[u8]) -> Result<String> {
        let output = run_with_stdin(&mut Command::new(&self.program), body).map_err(|e| {
            AppError::Decode {
                message: format!(
                    "run {}: {e} - POSSIBLE FIX: add {} to your PATH",
                    self.program, self.program
                ),
            }
        })?;
        if !output.status.success() {
            return Err(AppError::Decode {
                message: format!("{} failed: {}", self.program, failure_message(&output)),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Remove the attribute dictionaries from a decoded body, keeping only the
/// text runs.
#[must_use]
pub fn strip_attributes(decoded: &str) -> String {
    let stripped = ATTRIBUTE_RE.replace_all(decoded, "");
    let stripped = MULTILINE_ATTRIBUTE_RE.replace_all(&stripped, "");
    stripped
        .strip_suffix('\n')
        .unwrap_or(&stripped)
        .to_string()
}
