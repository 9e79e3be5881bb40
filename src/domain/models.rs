//! Domain models for Messages chat data.
//!
//! These models represent the rows extracted from the Messages `chat.db`
//! database, already normalized for export.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// A row from the `chat` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Chat {
    pub id: i64,
    pub guid: String,
}

/// All chats attributed to one correspondent (a contact card or a raw
/// address). Group chats always form an entity of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityChats {
    /// Resolved display name, also used as the export folder name.
    pub name: String,
    /// Chats in the order they were found in the chat table. Never empty.
    pub chats: Vec<Chat>,
}

/// A message ID paired with its database timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DatedMessageId {
    pub id: i64,
    pub date: i64,
}

/// A row from the `attachment` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    pub id: i64,
    /// Local path of the attachment. Empty when the content was never
    /// downloaded to this machine.
    pub filename: String,
    pub mime_type: String,
    pub transfer_name: String,
}

/// A message rendered for writing to a chat file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// `[<date>] <sender>: <text>` followed by a newline.
    pub line: String,
    /// Why the body could not be recovered, if it could not.
    pub invalid_reason: Option<String>,
}

impl Message {
    /// Whether the message body was recovered.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }
}

/// Handle ID to phone number, email address, or contact given name.
pub type HandleMap = HashMap<i64, String>;

/// Message ID to the attachments of that message, ordered by message ID.
pub type AttachmentMap = BTreeMap<i64, Vec<Attachment>>;

/// Version of the Mac OS release that wrote the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MacOsVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl MacOsVersion {
    /// First release storing dates in nanoseconds (High Sierra).
    pub const MODERN: Self = Self {
        major: 10,
        minor: 13,
        patch: 0,
    };

    /// Whether this release stores message dates in nanoseconds.
    #[must_use]
    pub fn is_modern(&self) -> bool {
        *self >= Self::MODERN
    }
}

impl FromStr for MacOsVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let mut next = |required: bool| -> Result<u32, String> {
            match parts.next() {
                Some(p) => p
                    .parse()
                    .map_err(|_| format!("Invalid Mac OS version: {s}")),
                None if required => Err(format!("Invalid Mac OS version: {s}")),
                None => Ok(0),
            }
        };
        let version = Self {
            major: next(true)?,
            minor: next(false)?,
            patch: next(false)?,
        };
        if parts.next().is_some() {
            return Err(format!("Invalid Mac OS version: {s}"));
        }
        Ok(version)
    }
}

impl fmt::Display for MacOsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
