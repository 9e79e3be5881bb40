//! `SQLite` reader for the Messages `chat.db` database.
//!
//! Reads handles, chats, message IDs, message bodies, and attachment paths.
//! The connection is opened read-only and shared by every export task.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Params, Row};

use crate::domain::contacts::{resolve_entity, resolve_handle, EntityKey};
use crate::domain::{
    AppError, Attachment, AttachmentMap, Chat, ContactDirectory, DatedMessageId, EntityChats,
    HandleMap, MacOsVersion, Message, Result,
};

use super::opsys::replace_tilde;
use super::typedstream::{strip_attributes, BodyDecoder, TypedStreamCommand};

/// Message dates are in nanoseconds since 2001-01-01 from High Sierra on.
pub const MODERN_DATE_DIVISOR: i64 = 1_000_000_000;

/// Message dates are in seconds since 2001-01-01 before High Sierra.
pub const LEGACY_DATE_DIVISOR: i64 = 1;

/// Join-table dates below this are still in seconds even on a modern
/// database (about 31.7 years after 2001 when read as seconds).
const RESCALE_THRESHOLD: i64 = 1_000 * MODERN_DATE_DIVISOR;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
const UNKNOWN_TRANSFER_NAME: &str = "(unknown attachment)";

/// Attachments under this prefix live in a per-boot temporary mount.
const VOLATILE_PREFIX: &str = "/var";

/// Read access to the chat data the exporter needs.
pub trait DataSource: Send + Sync {
    /// Handle ID to display string, with contact given names substituted.
    ///
    /// # Errors
    /// Returns an integrity violation on a duplicate handle ID.
    fn handle_map(&self, contacts: Option<&ContactDirectory>) -> Result<HandleMap>;

    /// All chats, grouped into entities and sorted by entity name.
    ///
    /// # Errors
    /// Returns error if the chat table cannot be read.
    fn chats(&self, contacts: Option<&ContactDirectory>) -> Result<Vec<EntityChats>>;

    /// IDs and dates of every message in a chat, in database order.
    ///
    /// # Errors
    /// Returns error if a query fails or a message date is ambiguous.
    fn message_ids(&self, chat_id: i64) -> Result<Vec<DatedMessageId>>;

    /// A message formatted as a chat file line.
    ///
    /// # Errors
    /// Returns error if the message cannot be read or is not unique.
    fn message(&self, id: i64, handles: &HandleMap) -> Result<Message>;

    /// Attachments of every message that has any.
    ///
    /// # Errors
    /// Returns an integrity violation on a duplicate attachment ID.
    fn attachment_paths(&self) -> Result<AttachmentMap>;
}

/// The Messages database.
pub struct ChatDb {
    conn: Mutex<Connection>,
    self_handle: String,
    home_dir: PathBuf,
    decoder: Box<dyn BodyDecoder>,
    date_divisor: i64,
    join_has_dates: bool,
}

impl ChatDb {
    /// Opens a Messages database in read-only mode.
    ///
    /// # Errors
    /// Returns error if database cannot be opened.
    pub fn open(path: &Path, self_handle: impl Into<String>) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(path, flags)
            .map_err(|e| AppError::database(format!("open DB file {}", path.display()), e))?;

        conn.execute_batch(
            "PRAGMA query_only = ON;
             PRAGMA temp_store = MEMORY;",
        )
        .map_err(|e| AppError::database("configure DB connection", e))?;

        Ok(Self::from_connection(conn, self_handle))
    }

    /// Wraps an already open connection.
    #[must_use]
    pub fn from_connection(conn: Connection, self_handle: impl Into<String>) -> Self {
        Self {
            conn: Mutex::new(conn),
            self_handle: self_handle.into(),
            home_dir: dirs::home_dir().unwrap_or_default(),
            decoder: Box::new(TypedStreamCommand::default()),
            date_divisor: MODERN_DATE_DIVISOR,
            join_has_dates: true,
        }
    }

    /// Use a different decoder for `attributedBody`.
    #[must_use]
    pub fn with_decoder(mut self, decoder: Box<dyn BodyDecoder>) -> Self {
        self.decoder = decoder;
        self
    }

    /// Expand `~` in attachment paths with this directory.
    #[must_use]
    pub fn with_home_dir(mut self, home_dir: impl Into<PathBuf>) -> Self {
        self.home_dir = home_dir.into();
        self
    }

    /// Detect schema capabilities and pick the date unit for the Mac OS
    /// release that wrote the database. No version means a modern release.
    ///
    /// # Errors
    /// Returns error if the schema cannot be inspected.
    pub fn init(&mut self, version: Option<MacOsVersion>) -> Result<()> {
        let join_has_dates = {
            let conn = self.lock()?;
            let mut stmt = conn
                .prepare("PRAGMA table_info(chat_message_join)")
                .map_err(|e| AppError::database("get chat_message_join table info", e))?;
            let columns = stmt
                .query_map([], |row| row.get::<_, String>(1))
                .map_err(|e| AppError::database("get chat_message_join table info", e))?;
            let mut found = false;
            for column in columns {
                let column = column
                    .map_err(|e| AppError::database("read chat_message_join table info", e))?;
                found |= column == "message_date";
            }
            found
        };

        self.join_has_dates = join_has_dates;
        self.date_divisor = match version {
            Some(v) if !v.is_modern() => LEGACY_DATE_DIVISOR,
            _ => MODERN_DATE_DIVISOR,
        };

        tracing::debug!(
            join_has_dates = self.join_has_dates,
            date_divisor = self.date_divisor,
            "Initialized chat database"
        );
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| AppError::Database {
            message: "chat database connection poisoned by a panicked export task".into(),
            source: None,
        })
    }

    fn dated_message_ids(conn: &Connection, chat_id: i64) -> Result<Vec<DatedMessageId>> {
        let mut stmt = conn
            .prepare("SELECT message_id, message_date FROM chat_message_join WHERE chat_id = ?1")
            .map_err(|e| AppError::database("query chat_message_join table", e))?;
        let rows = stmt
            .query_map([chat_id], |row| {
                Ok(DatedMessageId {
                    id: row.get(0)?,
                    date: row.get(1)?,
                })
            })
            .map_err(|e| AppError::database("query chat_message_join table", e))?;

        let mut ids = Vec::new();
        for row in rows {
            let mut msg = row.map_err(|e| AppError::database("read message ID", e))?;
            // Partially migrated databases keep some dates in seconds.
            if msg.date < RESCALE_THRESHOLD {
                msg.date = msg.date.saturating_mul(MODERN_DATE_DIVISOR);
            }
            ids.push(msg);
        }
        Ok(ids)
    }

    fn legacy_message_ids(conn: &Connection, chat_id: i64) -> Result<Vec<DatedMessageId>> {
        let mut stmt = conn
            .prepare("SELECT message_id FROM chat_message_join WHERE chat_id = ?1")
            .map_err(|e| AppError::database("query chat_message_join table", e))?;
        let ids = stmt
            .query_map([chat_id], |row| row.get::<_, i64>(0))
            .map_err(|e| AppError::database("query chat_message_join table", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| AppError::database("read message ID", e))?;

        ids.into_iter()
            .map(|id| -> Result<DatedMessageId> {
                let date = query_unique(
                    conn,
                    "SELECT date FROM message WHERE ROWID = ?1",
                    [id],
                    "message",
                    id,
                    |row| row.get::<_, i64>(0),
                )?
                .ok_or_else(|| missing_row("date for message", id))?;
                Ok(DatedMessageId { id, date })
            })
            .collect()
    }

    fn message_body(
        &self,
        id: i64,
        text: Option<String>,
        body: Option<Vec<u8>>,
    ) -> (String, Option<String>) {
        match (text, body) {
            (Some(text), _) => (text, None),
            (None, Some(body)) => match self.decoder.decode(&body) {
                Ok(decoded) => (strip_attributes(&decoded), None),
                Err(e) => (
                    String::new(),
                    Some(format!("get plain text for message {id}: {e}")),
                ),
            },
            (None, None) => (
                String::new(),
                Some(format!("no valid text or attributedBody for message {id}")),
            ),
        }
    }

    fn attachment(&self, conn: &Connection, id: i64) -> Result<Attachment> {
        let (filename, mime_type, transfer_name) = query_unique(
            conn,
            "SELECT filename, mime_type, transfer_name FROM attachment WHERE ROWID = ?1",
            [id],
            "attachment",
            id,
            |row| {
                Ok((
                    row.get::<_, Option<String>>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                ))
            },
        )?
        .ok_or_else(|| missing_row("data for attachment", id))?;

        let mut filename = replace_tilde(&filename.unwrap_or_default(), &self.home_dir);
        if filename.starts_with(VOLATILE_PREFIX) {
            filename = numbered_mount_path(&filename);
        }

        Ok(Attachment {
            id,
            filename,
            mime_type: mime_type.unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string()),
            transfer_name: transfer_name.unwrap_or_else(|| UNKNOWN_TRANSFER_NAME.to_string()),
        })
    }
}

impl DataSource for ChatDb {
    fn handle_map(&self, contacts: Option<&ContactDirectory>) -> Result<HandleMap> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT ROWID, id FROM handle")
            .map_err(|e| AppError::database("query handle table", e))?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))
            .map_err(|e| AppError::database("query handle table", e))?;

        let mut handles = HandleMap::new();
        for row in rows {
            let (id, address) = row.map_err(|e| AppError::database("read handle", e))?;
            match handles.entry(id) {
                Entry::Occupied(_) => {
                    return Err(AppError::IntegrityViolation { kind: "handle", id });
                }
                Entry::Vacant(slot) => {
                    slot.insert(resolve_handle(&address, contacts));
                }
            }
        }

        tracing::debug!("Read {} handles", handles.len());
        Ok(handles)
    }

    fn chats(&self, contacts: Option<&ContactDirectory>) -> Result<Vec<EntityChats>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT ROWID, guid, chat_identifier, COALESCE(display_name, '') FROM chat ORDER BY ROWID",
            )
            .map_err(|e| AppError::database("query chats table", e))?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    Chat {
                        id: row.get(0)?,
                        guid: row.get(1)?,
                    },
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })
            .map_err(|e| AppError::database("query chats table", e))?;

        let mut entities: Vec<EntityChats> = Vec::new();
        let mut index: HashMap<EntityKey, usize> = HashMap::new();
        for row in rows {
            let (chat, identifier, display_name) =
                row.map_err(|e| AppError::database("read data from chat table", e))?;
            let (key, name) = resolve_entity(&identifier, &display_name, contacts);
            match index.entry(key) {
                Entry::Occupied(slot) => entities[*slot.get()].chats.push(chat),
                Entry::Vacant(slot) => {
                    slot.insert(entities.len());
                    entities.push(EntityChats {
                        name,
                        chats: vec![chat],
                    });
                }
            }
        }

        entities.sort_by(|a, b| a.name.cmp(&b.name));
        tracing::debug!("Grouped chats into {} entities", entities.len());
        Ok(entities)
    }

    fn message_ids(&self, chat_id: i64) -> Result<Vec<DatedMessageId>> {
        let conn = self.lock()?;
        if self.join_has_dates {
            Self::dated_message_ids(&conn, chat_id)
        } else {
            Self::legacy_message_ids(&conn, chat_id)
        }
    }

    fn message(&self, id: i64, handles: &HandleMap) -> Result<Message> {
        let row = {
            let conn = self.lock()?;
            query_unique(
                &conn,
                "SELECT is_from_me, handle_id, text, attributedBody,
                        DATETIME((date / ?1) + STRFTIME('%s', '2001-01-01 00:00:00'), 'unixepoch', 'localtime')
                 FROM message WHERE ROWID = ?2",
                (self.date_divisor, id),
                "message",
                id,
                |row| {
                    let body = match row.get_ref(3)? {
                        ValueRef::Blob(b) | ValueRef::Text(b) => Some(b.to_vec()),
                        _ => None,
                    };
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        body,
                        row.get::<_, String>(4)?,
                    ))
                },
            )?
            .ok_or_else(|| missing_row("data for message", id))?
        };
        // The connection is released before running the external decoder.
        let (from_me, handle_id, text, body, date) = row;

        let handle = if from_me {
            self.self_handle.as_str()
        } else {
            handles.get(&handle_id).map_or("", String::as_str)
        };
        let (text, invalid_reason) = self.message_body(id, text, body);

        Ok(Message {
            line: format!("[{date}] {handle}: {text}\n"),
            invalid_reason,
        })
    }

    fn attachment_paths(&self) -> Result<AttachmentMap> {
        let conn = self.lock()?;
        let joins = {
            let mut stmt = conn
                .prepare("SELECT message_id, attachment_id FROM message_attachment_join")
                .map_err(|e| AppError::database("scan message_attachment_join table", e))?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)))
                .map_err(|e| AppError::database("scan message_attachment_join table", e))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
                .map_err(|e| AppError::database("read data from message_attachment_join table", e))?
        };

        let mut attachments = AttachmentMap::new();
        for (message_id, attachment_id) in joins {
            let attachment = self.attachment(&conn, attachment_id).map_err(|e| {
                e.context(format!(
                    "get path for attachment {attachment_id} to message {message_id}"
                ))
            })?;
            attachments.entry(message_id).or_default().push(attachment);
        }

        tracing::debug!("Read attachments for {} messages", attachments.len());
        Ok(attachments)
    }
}

/// Run a query that must match at most one row.
fn query_unique<T, P: Params>(
    conn: &Connection,
    sql: &str,
    params: P,
    kind: &'static str,
    id: i64,
    read: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
) -> Result<Option<T>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| AppError::database(format!("query {kind} table for ID {id}"), e))?;
    let mut rows = stmt
        .query(params)
        .map_err(|e| AppError::database(format!("query {kind} table for ID {id}"), e))?;

    let Some(row) = rows
        .next()
        .map_err(|e| AppError::database(format!("read data for {kind} ID {id}"), e))?
    else {
        return Ok(None);
    };
    let value = read(row).map_err(|e| AppError::database(format!("read data for {kind} ID {id}"), e))?;

    if rows
        .next()
        .map_err(|e| AppError::database(format!("read data for {kind} ID {id}"), e))?
        .is_some()
    {
        return Err(AppError::IntegrityViolation { kind, id });
    }
    Ok(Some(value))
}

fn missing_row(what: &str, id: i64) -> AppError {
    AppError::Database {
        message: format!("read {what} ID {id}: no such row"),
        source: None,
    }
}

/// `/var/folders/x/y/photo.jpg` becomes `/var/folders/x/y/0/photo.jpg`.
fn numbered_mount_path(filename: &str) -> String {
    let path = Path::new(filename);
    match (path.parent(), path.file_name()) {
        (Some(dir), Some(base)) => dir.join("0").join(base).to_string_lossy().into_owned(),
        _ => filename.to_string(),
    }
}
