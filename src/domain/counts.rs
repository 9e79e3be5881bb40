//! Export counters.
//!
//! Every entity export owns one `Counts` value and hands it back when it
//! finishes; the orchestrator sums them once all entities are done.

use std::collections::BTreeMap;

use serde::Serialize;

/// Per-export tallies of what was written.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Counts {
    /// Chat files written (text or PDF).
    pub files: usize,
    /// Chats exported.
    pub chats: usize,
    /// Messages written with a recovered body.
    pub messages: usize,
    /// Messages written without a recoverable body.
    pub messages_invalid: usize,
    /// Attachments referenced or embedded, by MIME type.
    pub attachments: BTreeMap<String, usize>,
    /// Attachments copied into the export folder, by MIME type.
    pub attachments_copied: BTreeMap<String, usize>,
    /// Attachments embedded inline, by MIME type.
    pub attachments_embedded: BTreeMap<String, usize>,
    /// Attachments that could not be found locally.
    pub attachments_missing: usize,
    /// Successful HEIC to JPEG conversions.
    pub conversions: usize,
    /// Failed HEIC to JPEG conversions.
    pub conversions_failed: usize,
}

impl Counts {
    /// Add another set of counts into this one.
    pub fn merge(&mut self, other: Self) {
        self.files += other.files;
        self.chats += other.chats;
        self.messages += other.messages;
        self.messages_invalid += other.messages_invalid;
        merge_by_mime(&mut self.attachments, other.attachments);
        merge_by_mime(&mut self.attachments_copied, other.attachments_copied);
        merge_by_mime(&mut self.attachments_embedded, other.attachments_embedded);
        self.attachments_missing += other.attachments_missing;
        self.conversions += other.conversions;
        self.conversions_failed += other.conversions_failed;
    }

    /// Count one attachment written to a chat file.
    pub fn add_attachment(&mut self, mime_type: &str, embedded: bool) {
        *self.attachments.entry(mime_type.to_string()).or_default() += 1;
        if embedded {
            *self
                .attachments_embedded
                .entry(mime_type.to_string())
                .or_default() += 1;
        }
    }

    /// Count one attachment copied into the export folder.
    pub fn add_copied(&mut self, mime_type: &str) {
        *self
            .attachments_copied
            .entry(mime_type.to_string())
            .or_default() += 1;
    }
}

fn merge_by_mime(into: &mut BTreeMap<String, usize>, from: BTreeMap<String, usize>) {
    for (mime_type, count) in from {
        *into.entry(mime_type).or_default() += count;
    }
}

/// Sum of all per-MIME-type counts.
#[must_use]
pub fn total(by_mime: &BTreeMap<String, usize>) -> usize {
    by_mime.values().sum()
}
