//! Writing one entity's messages to chat files.
//!
//! A chat file goes through: directory created, file opened, each message
//! written followed by its attachments, staged, open files limit checked,
//! flushed. Any error stops the file where it is.

use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use crate::domain::error::FILE_ACCESS_HELP;
use crate::domain::{
    AppError, Attachment, AttachmentMap, Counts, DatedMessageId, HandleMap, Result,
};
use crate::infrastructure::opsys::{copy_file, file_exists, join_under};
use crate::infrastructure::{OutFile, PdfOutFile, TxtOutFile};

use super::context::ExportContext;

/// Longest chat file name (without extension) before it is truncated.
const FILENAME_MAX_LENGTH: usize = 251;

/// Messages per PDF when a chat is split into several files.
const PDF_PREFERRED_MESSAGES: usize = 2048;

/// Most messages rendered into a single PDF.
const PDF_MAX_MESSAGES: usize = 3072;

/// Joins the GUIDs of merged chats in a file name.
const GUID_SEPARATOR: &str = ";;;";

/// Subdirectory of a chat directory holding its copied attachments.
const ATTACHMENTS_DIR: &str = "attachments";

/// Writes chat files for one entity, counting what it writes.
pub struct FileWriter<'a> {
    ctx: &'a ExportContext,
    handles: &'a HandleMap,
    attachments: &'a AttachmentMap,
    counts: &'a mut Counts,
}

/// Outcome of looking for an attachment on disk.
enum Located {
    Present(PathBuf),
    Missing(&'static str),
}

impl<'a> FileWriter<'a> {
    #[must_use]
    pub fn new(
        ctx: &'a ExportContext,
        handles: &'a HandleMap,
        attachments: &'a AttachmentMap,
        counts: &'a mut Counts,
    ) -> Self {
        Self {
            ctx,
            handles,
            attachments,
            counts,
        }
    }

    /// Count one chat of the entity as exported.
    pub fn count_chat(&mut self) {
        self.counts.chats += 1;
    }

    /// Write the given messages of an entity's chats to the export folder.
    ///
    /// # Errors
    /// Returns error if a directory or file cannot be created, a message
    /// cannot be read, or the file cannot be rendered.
    pub fn write_file(
        &mut self,
        entity: &str,
        guids: &[String],
        mut message_ids: Vec<DatedMessageId>,
    ) -> Result<()> {
        let ctx = self.ctx;
        let config = &ctx.config;
        let chat_dir = chat_dir_path(&config.export_path, entity);
        fs::create_dir_all(&chat_dir)
            .map_err(|e| AppError::io(format!("create directory {}", chat_dir.display()), e))?;

        let stem = chat_file_stem(guids);
        let att_dir = chat_dir.join(ATTACHMENTS_DIR);
        if config.copy_attachments && !config.preserve_paths {
            fs::create_dir_all(&att_dir)
                .map_err(|e| AppError::io(format!("create directory {}", att_dir.display()), e))?;
        }

        message_ids.sort_by_key(|m| m.date);

        let ext = config.output.extension();
        if config.is_pdf() {
            for (range, part) in pdf_parts(message_ids.len()) {
                let name = match part {
                    Some(n) => format!("{stem}.{n}.{ext}"),
                    None => format!("{stem}.{ext}"),
                };
                let mut out = PdfOutFile::create(
                    &chat_dir.join(name),
                    config.include_ppa,
                    ctx.renderer.clone(),
                )?;
                self.handle_file_contents(&mut out, &message_ids[range], &att_dir)?;
            }
            Ok(())
        } else {
            let mut out = TxtOutFile::create(&chat_dir.join(format!("{stem}.{ext}")))?;
            self.handle_file_contents(&mut out, &message_ids, &att_dir)
        }
    }

    fn handle_file_contents(
        &mut self,
        out: &mut dyn OutFile,
        message_ids: &[DatedMessageId],
        att_dir: &Path,
    ) -> Result<()> {
        let file_name = out.name().display().to_string();
        let (mut valid, mut invalid) = (0, 0);

        for &DatedMessageId { id, .. } in message_ids {
            let msg = self
                .ctx
                .source
                .message(id, self.handles)
                .map_err(|e| e.context(format!("get message with ID {id}")))?;
            if let Some(reason) = &msg.invalid_reason {
                tracing::warn!("chat file {file_name:?} - {reason}");
            }
            out.write_message(&msg.line)
                .map_err(|e| e.context(format!("write message {:?} to file {file_name:?}", msg.line)))?;
            self.handle_attachments(out, id, att_dir)
                .map_err(|e| e.context(format!("chat file {file_name:?} - message {id}")))?;
            if msg.is_valid() {
                valid += 1;
            } else {
                invalid += 1;
            }
        }

        let images = out
            .stage()
            .map_err(|e| e.context(format!("stage chat file {file_name:?} for writing")))?;
        let limit = self.ctx.limits.soft_limit()?;
        // Rendering holds a read and a write handle per image.
        let needed = u64::try_from(images).unwrap_or(u64::MAX).saturating_mul(2);
        if needed > limit {
            self.ctx.limits.raise_soft_limit(needed).map_err(|e| {
                e.context(format!(
                    "chat file {file_name:?} - increase the open file limit from {limit} to {needed} to support {images} embedded images"
                ))
            })?;
        }
        out.flush()
            .map_err(|e| e.context(format!("flush chat file {file_name:?} to disk")))?;

        self.counts.files += 1;
        self.counts.messages += valid;
        self.counts.messages_invalid += invalid;
        Ok(())
    }

    fn handle_attachments(&mut self, out: &mut dyn OutFile, msg_id: i64, att_dir: &Path) -> Result<()> {
        let attachments = self.attachments;
        let Some(attachments) = attachments.get(&msg_id) else {
            return Ok(());
        };
        for att in attachments {
            match self.locate(att)? {
                Located::Missing(reason) => {
                    self.counts.attachments_missing += 1;
                    tracing::warn!(
                        "chat file {:?} - message {} - {} attachment {:?} (ID {}) - {}",
                        out.name().display().to_string(),
                        msg_id,
                        att.mime_type,
                        att.transfer_name,
                        att.id,
                        reason
                    );
                    out.reference_attachment(&att.transfer_name).map_err(|e| {
                        e.context(format!("reference attachment {:?}", att.transfer_name))
                    })?;
                    self.counts.add_attachment(&att.mime_type, false);
                }
                Located::Present(path) => {
                    let path = self.copy_attachment(att, path, att_dir)?;
                    self.write_attachment(out, att, path)?;
                }
            }
        }
        Ok(())
    }

    fn locate(&self, att: &Attachment) -> Result<Located> {
        if att.filename.is_empty() {
            return Ok(Located::Missing("attachment has no local filename"));
        }
        let path = join_under(&self.ctx.config.attachments_path, Path::new(&att.filename));
        let exists = file_exists(&path)
            .map_err(|e| e.context(format!("access attachment (POSSIBLE FIX: {FILE_ACCESS_HELP})")))?;
        if exists {
            Ok(Located::Present(path))
        } else {
            Ok(Located::Missing("attachment does not exist locally"))
        }
    }

    /// Copy the attachment into the export folder if asked to, returning the
    /// path to include in the chat file.
    fn copy_attachment(&mut self, att: &Attachment, src: PathBuf, att_dir: &Path) -> Result<PathBuf> {
        let config = &self.ctx.config;
        if !config.copy_attachments {
            return Ok(src);
        }
        let dst_dir = if config.preserve_paths {
            let original_dir = Path::new(&att.filename)
                .parent()
                .unwrap_or_else(|| Path::new(""));
            let dir = join_under(&config.preserved_path_dir(), original_dir);
            fs::create_dir_all(&dir)
                .map_err(|e| AppError::io(format!("create directory {}", dir.display()), e))?;
            dir
        } else {
            att_dir.to_path_buf()
        };

        let dst = copy_file(&src, &dst_dir, !config.preserve_paths).map_err(|e| {
            e.context(format!(
                "copy attachment {:?} to {:?}",
                src.display().to_string(),
                dst_dir.display().to_string()
            ))
        })?;
        self.counts.add_copied(&att.mime_type);
        Ok(dst)
    }

    fn write_attachment(&mut self, out: &mut dyn OutFile, att: &Attachment, path: PathBuf) -> Result<()> {
        let mut path = path;
        let mut mime_type = att.mime_type.as_str();
        if self.ctx.config.is_pdf() {
            match self.ctx.converter.convert(&path) {
                Err(e) => {
                    self.counts.conversions_failed += 1;
                    tracing::warn!("chat file {:?} - {}", out.name().display().to_string(), e);
                }
                Ok(converted) if converted != path => {
                    self.counts.conversions += 1;
                    path = converted;
                    mime_type = "image/jpeg";
                }
                Ok(_) => {}
            }
        }
        let embedded = out
            .write_attachment(&path)
            .map_err(|e| e.context(format!("include attachment {:?}", path.display().to_string())))?;
        self.counts.add_attachment(mime_type, embedded);
        Ok(())
    }
}

/// Directory for an entity's chat files, without trailing dots or spaces.
fn chat_dir_path(export_path: &Path, entity: &str) -> PathBuf {
    let path = export_path.join(entity);
    let path = path.to_string_lossy();
    PathBuf::from(path.trim_end_matches(['.', ' ']))
}

/// Chat file name (without extension) from the GUIDs of its chats.
fn chat_file_stem(guids: &[String]) -> String {
    let mut stem = guids.join(GUID_SEPARATOR);
    if stem.len() > FILENAME_MAX_LENGTH {
        let mut end = FILENAME_MAX_LENGTH - 1;
        while !stem.is_char_boundary(end) {
            end -= 1;
        }
        stem.truncate(end);
    }
    stem
}

/// Message ranges of the PDFs for a chat, with their part numbers. A chat
/// that fits in one PDF has no part number.
fn pdf_parts(len: usize) -> Vec<(Range<usize>, Option<usize>)> {
    let mut parts = Vec::new();
    let mut start = 0;
    while len > start + PDF_MAX_MESSAGES {
        parts.push((start..start + PDF_PREFERRED_MESSAGES, Some(parts.len() + 1)));
        start += PDF_PREFERRED_MESSAGES;
    }
    let last = (!parts.is_empty()).then_some(parts.len() + 1);
    parts.push((start..len, last));
    parts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ExportConfig, OutputFormat};
    use crate::infrastructure::{DataSource, FileLimits};
    use crate::test_support::{
        export_context, unreachable_path, FakeConverter, FixedLimits, StoreFixture,
    };
    use std::sync::Arc;
    use tempfile::tempdir;

    fn ids(pairs: &[(i64, i64)]) -> Vec<DatedMessageId> {
        pairs
            .iter()
            .map(|&(id, date)| DatedMessageId { id, date })
            .collect()
    }

    #[test]
    fn test_merged_chats_written_in_date_order() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("export");
        let store = StoreFixture::modern()
            .handle(1, "+15551234567")
            .text_message_at(1, false, 1, "third", 300)
            .text_message_at(2, true, 1, "first", 100)
            .text_message_at(3, false, 1, "second", 200);
        let ctx = export_context(store, ExportConfig {
            export_path: export.clone(),
            ..Default::default()
        });
        let handles = ctx.source.handle_map(None).unwrap();
        let attachments = AttachmentMap::new();
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &handles, &attachments, &mut counts)
            .write_file(
                "Ann",
                &["g1".to_string(), "g2".to_string()],
                ids(&[(1, 300), (2, 100), (3, 200)]),
            )
            .unwrap();

        let text = fs::read_to_string(export.join("Ann").join("g1;;;g2.txt")).unwrap();
        let bodies: Vec<&str> = text
            .lines()
            .map(|l| l.split_once("] ").unwrap().1)
            .collect();
        assert_eq!(
            bodies,
            ["Me: first", "+15551234567: second", "+15551234567: third"]
        );
        assert_eq!(counts.files, 1);
        assert_eq!(counts.messages, 3);
        assert!(!export.join("Ann").join(ATTACHMENTS_DIR).exists());
    }

    #[test]
    fn test_missing_attachment_is_referenced_and_counted() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("export");
        let store = StoreFixture::modern()
            .text_message_at(1, true, 0, "look", 100)
            .attachment(5, Some(""), Some("image/png"), Some("x.png"))
            .attachment(6, Some("/nonexistent/bagoup/y.gif"), Some("image/gif"), Some("y.gif"))
            .attach(1, 5)
            .attach(1, 6);
        let ctx = export_context(store, ExportConfig {
            export_path: export.clone(),
            ..Default::default()
        });
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap();

        let text = fs::read_to_string(export.join("Ann/g1.txt")).unwrap();
        assert!(text.ends_with("Me: look\n<attached: x.png>\n<attached: y.gif>\n"));
        assert_eq!(counts.attachments_missing, 2);
        assert_eq!(counts.attachments["image/png"], 1);
        assert_eq!(counts.attachments["image/gif"], 1);
        assert!(counts.attachments_embedded.is_empty());
    }

    #[test]
    fn test_pdf_embeds_copied_images() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("export");
        let photo = dir.path().join("photo.png");
        let doc = dir.path().join("notes.txt");
        fs::write(&photo, "png").unwrap();
        fs::write(&doc, "notes").unwrap();
        let store = StoreFixture::modern()
            .text_message_at(1, true, 0, "pics", 100)
            .attachment(5, Some(photo.to_str().unwrap()), Some("image/png"), Some("photo.png"))
            .attachment(6, Some(doc.to_str().unwrap()), Some("text/plain"), Some("notes.txt"))
            .attach(1, 5)
            .attach(1, 6);
        let ctx = export_context(store, ExportConfig {
            export_path: export.clone(),
            output: OutputFormat::Pdf,
            copy_attachments: true,
            ..Default::default()
        });
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap();

        let copied = export.join("Ann").join(ATTACHMENTS_DIR).join("photo.png");
        assert!(copied.exists());
        let html = fs::read_to_string(export.join("Ann/g1.pdf")).unwrap();
        assert!(html.contains(&format!("<img src=\"{}\"", copied.display())));
        assert!(html.contains("&lt;attached: notes.txt&gt;"));
        assert_eq!(counts.attachments_copied["image/png"], 1);
        assert_eq!(counts.attachments_copied["text/plain"], 1);
        assert_eq!(counts.attachments_embedded["image/png"], 1);
        assert_eq!(counts.attachments["text/plain"], 1);
        assert!(!counts.attachments_embedded.contains_key("text/plain"));
    }

    fn heic_store(photo: &Path) -> StoreFixture {
        StoreFixture::modern()
            .text_message_at(1, true, 0, "pic", 100)
            .attachment(5, Some(photo.to_str().unwrap()), Some("image/heic"), Some("IMG_1.heic"))
            .attach(1, 5)
    }

    #[test]
    fn test_pdf_embeds_converted_heic_as_jpeg() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("export");
        let photo = dir.path().join("IMG_1.heic");
        fs::write(&photo, "heic").unwrap();
        let ctx = export_context(heic_store(&photo), ExportConfig {
            export_path: export.clone(),
            output: OutputFormat::Pdf,
            ..Default::default()
        })
        .with_converter(Arc::new(FakeConverter::converting()));
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap();

        let html = fs::read_to_string(export.join("Ann/g1.pdf")).unwrap();
        assert!(html.contains("IMG_1.jpeg\""));
        assert_eq!(counts.conversions, 1);
        assert_eq!(counts.conversions_failed, 0);
        assert_eq!(counts.attachments["image/jpeg"], 1);
        assert_eq!(counts.attachments_embedded["image/jpeg"], 1);
        assert!(!counts.attachments.contains_key("image/heic"));
    }

    #[test]
    fn test_failed_conversion_references_original() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("export");
        let photo = dir.path().join("IMG_1.heic");
        fs::write(&photo, "heic").unwrap();
        let ctx = export_context(heic_store(&photo), ExportConfig {
            export_path: export.clone(),
            output: OutputFormat::Pdf,
            ..Default::default()
        })
        .with_converter(Arc::new(FakeConverter::failing()));
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap();

        let html = fs::read_to_string(export.join("Ann/g1.pdf")).unwrap();
        assert!(html.contains("&lt;attached: IMG_1.heic&gt;"));
        assert_eq!(counts.files, 1);
        assert_eq!(counts.conversions, 0);
        assert_eq!(counts.conversions_failed, 1);
        assert_eq!(counts.attachments["image/heic"], 1);
        assert!(counts.attachments_embedded.is_empty());
    }

    #[test]
    fn test_unreadable_attachment_location_fails_the_file() {
        let dir = tempdir().unwrap();
        let path = unreachable_path(dir.path());
        let store = StoreFixture::modern()
            .text_message_at(1, true, 0, "pic", 100)
            .attachment(5, Some(path.to_str().unwrap()), Some("image/png"), Some("photo.png"))
            .attach(1, 5);
        let ctx = export_context(store, ExportConfig {
            export_path: dir.path().join("export"),
            ..Default::default()
        });
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        let err = FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap_err();
        assert!(err.to_string().contains("access attachment"));
        assert_eq!(counts.files, 0);
        assert_eq!(counts.attachments_missing, 0);
    }

    #[test]
    fn test_preserve_paths_mirrors_original_layout() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("export");
        let src_dir = dir.path().join("Library/Attachments/ab");
        fs::create_dir_all(&src_dir).unwrap();
        let src = src_dir.join("a.jpg");
        fs::write(&src, "jpg").unwrap();
        let store = StoreFixture::modern()
            .text_message_at(1, true, 0, "x", 100)
            .attachment(5, Some(src.to_str().unwrap()), Some("image/jpeg"), Some("a.jpg"))
            .attach(1, 5);
        let ctx = export_context(store, ExportConfig {
            export_path: export.clone(),
            copy_attachments: true,
            preserve_paths: true,
            ..Default::default()
        });
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap();

        let preserved = join_under(&export.join("bagoup-attachments"), &src);
        assert_eq!(fs::read_to_string(preserved).unwrap(), "jpg");
        assert!(!export.join("Ann").join(ATTACHMENTS_DIR).exists());
    }

    #[test]
    fn test_open_files_limit_that_cannot_be_raised_fails_the_file() {
        let dir = tempdir().unwrap();
        let photo = dir.path().join("photo.jpg");
        fs::write(&photo, "jpg").unwrap();
        let store = StoreFixture::modern()
            .text_message_at(1, true, 0, "pic", 100)
            .attachment(5, Some(photo.to_str().unwrap()), Some("image/jpeg"), Some("photo.jpg"))
            .attach(1, 5);
        let ctx = export_context(store, ExportConfig {
            export_path: dir.path().join("export"),
            output: OutputFormat::Pdf,
            ..Default::default()
        })
        .with_limits(Arc::new(FixedLimits::new(1, 1)));
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        let err = FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap_err();
        assert!(err.to_string().contains("increase the open file limit from 1 to 2"));
        assert_eq!(counts.files, 0);
    }

    #[test]
    fn test_open_files_limit_raised_when_allowed() {
        let dir = tempdir().unwrap();
        let photo = dir.path().join("photo.jpg");
        fs::write(&photo, "jpg").unwrap();
        let store = StoreFixture::modern()
            .text_message_at(1, true, 0, "pic", 100)
            .attachment(5, Some(photo.to_str().unwrap()), Some("image/jpeg"), Some("photo.jpg"))
            .attach(1, 5);
        let limits = Arc::new(FixedLimits::new(1, 100));
        let ctx = export_context(store, ExportConfig {
            export_path: dir.path().join("export"),
            output: OutputFormat::Pdf,
            ..Default::default()
        })
        .with_limits(limits.clone());
        let attachments = ctx.source.attachment_paths().unwrap();
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &HandleMap::new(), &attachments, &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100)]))
            .unwrap();
        assert_eq!(limits.soft_limit().unwrap(), 2);
        assert_eq!(counts.files, 1);
    }

    #[test]
    fn test_invalid_messages_counted_separately() {
        let dir = tempdir().unwrap();
        let export = dir.path().join("export");
        let store = StoreFixture::modern()
            .text_message_at(1, true, 0, "ok", 100)
            .message(2, 200);
        let ctx = export_context(store, ExportConfig {
            export_path: export.clone(),
            ..Default::default()
        });
        let mut counts = Counts::default();

        FileWriter::new(&ctx, &HandleMap::new(), &AttachmentMap::new(), &mut counts)
            .write_file("Ann", &["g1".to_string()], ids(&[(1, 100), (2, 200)]))
            .unwrap();
        assert_eq!(counts.messages, 1);
        assert_eq!(counts.messages_invalid, 1);
    }

    #[test]
    fn test_chat_dir_path_trims_unsafe_suffix() {
        assert_eq!(
            chat_dir_path(Path::new("/export"), "Dr. Who. "),
            PathBuf::from("/export/Dr. Who")
        );
    }

    #[test]
    fn test_chat_file_stem_truncates_long_names() {
        let guids: Vec<String> = (0..40).map(|i| format!("iMessage;-;+1555000{i:04}")).collect();
        let stem = chat_file_stem(&guids);
        assert_eq!(stem.len(), FILENAME_MAX_LENGTH - 1);

        let short = chat_file_stem(&["g1".to_string(), "g2".to_string()]);
        assert_eq!(short, "g1;;;g2");

        let multibyte = vec!["é".repeat(200)];
        assert!(chat_file_stem(&multibyte).len() < FILENAME_MAX_LENGTH);
    }

    #[test]
    fn test_pdf_parts() {
        assert_eq!(pdf_parts(10), vec![(0..10, None)]);
        assert_eq!(pdf_parts(PDF_MAX_MESSAGES), vec![(0..PDF_MAX_MESSAGES, None)]);
        assert_eq!(
            pdf_parts(PDF_MAX_MESSAGES + 1),
            vec![
                (0..PDF_PREFERRED_MESSAGES, Some(1)),
                (PDF_PREFERRED_MESSAGES..PDF_MAX_MESSAGES + 1, Some(2)),
            ]
        );
        let parts = pdf_parts(10_000);
        assert_eq!(parts.len(), 5);
        assert_eq!(parts[4], (8192..10_000, Some(5)));
    }
}
