//! Shared fixtures: a Messages database built row by row, and in-process
//! stand-ins for the external tools.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{params, Connection};

use crate::application::ExportContext;
use crate::domain::{AppError, ExportConfig, Result};
use crate::infrastructure::opsys::is_heic;
use crate::infrastructure::{
    BodyDecoder, ChatDb, DataSource, DocumentRenderer, FileLimits, ImageConverter,
};

const SCHEMA: &str = "
    CREATE TABLE handle (ROWID INTEGER, id TEXT);
    CREATE TABLE chat (ROWID INTEGER, guid TEXT, chat_identifier TEXT, display_name TEXT);
    CREATE TABLE message (
        ROWID INTEGER, is_from_me INTEGER, handle_id INTEGER,
        text TEXT, attributedBody BLOB, date INTEGER
    );
    CREATE TABLE attachment (ROWID INTEGER, filename TEXT, mime_type TEXT, transfer_name TEXT);
    CREATE TABLE message_attachment_join (message_id INTEGER, attachment_id INTEGER);
";

/// A Messages database with just the tables and columns bagoup reads. The
/// ROWID columns are plain columns, so duplicate IDs can be inserted.
pub struct StoreFixture {
    conn: Connection,
    join_has_dates: bool,
}

impl StoreFixture {
    /// In-memory database whose `chat_message_join` carries message dates.
    pub fn modern() -> Self {
        Self::create(Connection::open_in_memory().unwrap(), true)
    }

    /// In-memory database from before `chat_message_join.message_date`.
    pub fn legacy() -> Self {
        Self::create(Connection::open_in_memory().unwrap(), false)
    }

    /// Modern database written to `path`.
    pub fn modern_file(path: &Path) -> Self {
        Self::create(Connection::open(path).unwrap(), true)
    }

    fn create(conn: Connection, join_has_dates: bool) -> Self {
        conn.execute_batch(SCHEMA).unwrap();
        let join = if join_has_dates {
            "CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER, message_date INTEGER)"
        } else {
            "CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER)"
        };
        conn.execute_batch(join).unwrap();
        Self {
            conn,
            join_has_dates,
        }
    }

    pub fn handle(self, id: i64, address: &str) -> Self {
        self.conn
            .execute("INSERT INTO handle VALUES (?1, ?2)", params![id, address])
            .unwrap();
        self
    }

    pub fn chat(self, id: i64, guid: &str, identifier: &str, display_name: Option<&str>) -> Self {
        self.conn
            .execute(
                "INSERT INTO chat VALUES (?1, ?2, ?3, ?4)",
                params![id, guid, identifier, display_name],
            )
            .unwrap();
        self
    }

    /// Message with neither text nor body.
    pub fn message(self, id: i64, date: i64) -> Self {
        self.insert_message(id, false, 0, None, None, date)
    }

    pub fn text_message(self, id: i64, from_me: bool, handle_id: i64, text: &str) -> Self {
        self.insert_message(id, from_me, handle_id, Some(text), None, 0)
    }

    pub fn text_message_at(
        self,
        id: i64,
        from_me: bool,
        handle_id: i64,
        text: &str,
        date: i64,
    ) -> Self {
        self.insert_message(id, from_me, handle_id, Some(text), None, date)
    }

    /// Message carrying only an `attributedBody`.
    pub fn body_message(self, id: i64, body: &[u8]) -> Self {
        self.insert_message(id, false, 0, None, Some(body), 0)
    }

    fn insert_message(
        self,
        id: i64,
        from_me: bool,
        handle_id: i64,
        text: Option<&str>,
        body: Option<&[u8]>,
        date: i64,
    ) -> Self {
        self.conn
            .execute(
                "INSERT INTO message VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![id, i64::from(from_me), handle_id, text, body, date],
            )
            .unwrap();
        self
    }

    /// Puts a message in a chat. The date is dropped on a legacy database.
    pub fn join(self, chat_id: i64, message_id: i64, date: Option<i64>) -> Self {
        if self.join_has_dates {
            self.conn
                .execute(
                    "INSERT INTO chat_message_join VALUES (?1, ?2, ?3)",
                    params![chat_id, message_id, date],
                )
                .unwrap();
        } else {
            self.conn
                .execute(
                    "INSERT INTO chat_message_join VALUES (?1, ?2)",
                    params![chat_id, message_id],
                )
                .unwrap();
        }
        self
    }

    pub fn attachment(
        self,
        id: i64,
        filename: Option<&str>,
        mime_type: Option<&str>,
        transfer_name: Option<&str>,
    ) -> Self {
        self.conn
            .execute(
                "INSERT INTO attachment VALUES (?1, ?2, ?3, ?4)",
                params![id, filename, mime_type, transfer_name],
            )
            .unwrap();
        self
    }

    pub fn attach(self, message_id: i64, attachment_id: i64) -> Self {
        self.conn
            .execute(
                "INSERT INTO message_attachment_join VALUES (?1, ?2)",
                params![message_id, attachment_id],
            )
            .unwrap();
        self
    }

    /// Not yet initialized. Bodies fail to decode unless a decoder is given.
    pub fn into_chat_db(self) -> ChatDb {
        ChatDb::from_connection(self.conn, "Me").with_decoder(Box::new(FakeDecoder::failing()))
    }
}

/// Decoder returning a fixed dump, or always failing.
pub struct FakeDecoder {
    output: Option<String>,
}

impl FakeDecoder {
    pub fn ok(output: &str) -> Self {
        Self {
            output: Some(output.to_string()),
        }
    }

    pub fn failing() -> Self {
        Self { output: None }
    }
}

impl BodyDecoder for FakeDecoder {
    fn decode(&self, _body: &[u8]) -> Result<String> {
        self.output.clone().ok_or_else(|| AppError::Decode {
            message: "typedstream-decode failed: not a typedstream".into(),
        })
    }
}

/// Writes the HTML it is given instead of a PDF.
pub struct HtmlRenderer;

impl DocumentRenderer for HtmlRenderer {
    fn render(&self, html: &[u8], output: &Path) -> Result<()> {
        std::fs::write(output, html).map_err(|e| AppError::io("write rendered HTML", e))
    }
}

/// Leaves every image as it is.
pub struct PassthroughConverter;

impl ImageConverter for PassthroughConverter {
    fn convert(&self, src: &Path) -> Result<PathBuf> {
        Ok(src.to_path_buf())
    }
}

/// Converts `.heic` files to a `.jpeg` copy next to them, or fails to.
pub struct FakeConverter {
    fail: bool,
}

impl FakeConverter {
    pub fn converting() -> Self {
        Self { fail: false }
    }

    pub fn failing() -> Self {
        Self { fail: true }
    }
}

impl ImageConverter for FakeConverter {
    fn convert(&self, src: &Path) -> Result<PathBuf> {
        if !is_heic(src) {
            return Ok(src.to_path_buf());
        }
        if self.fail {
            return Err(AppError::Conversion {
                path: src.to_path_buf(),
                message: "sips: unsupported image".into(),
            });
        }
        let dst = src.with_extension("jpeg");
        std::fs::copy(src, &dst).map_err(|e| AppError::io("copy converted image", e))?;
        Ok(dst)
    }
}

/// A path under a regular file, so checking whether it exists fails with
/// something other than "not found".
pub fn unreachable_path(dir: &Path) -> PathBuf {
    let file = dir.join("not-a-directory");
    std::fs::write(&file, "x").unwrap();
    file.join("photo.png")
}

/// Open files limit held in memory.
pub struct FixedLimits {
    soft: Mutex<u64>,
    hard: u64,
}

impl FixedLimits {
    pub fn new(soft: u64, hard: u64) -> Self {
        Self {
            soft: Mutex::new(soft),
            hard,
        }
    }
}

impl FileLimits for FixedLimits {
    fn soft_limit(&self) -> Result<u64> {
        Ok(*self.soft.lock().unwrap())
    }

    fn raise_soft_limit(&self, n: u64) -> Result<()> {
        if n > self.hard {
            return Err(AppError::ResourceLimit {
                message: format!("{n} exceeds the open files hard limit of {}", self.hard),
            });
        }
        let mut soft = self.soft.lock().unwrap();
        *soft = (*soft).max(n);
        Ok(())
    }
}

/// Context over an initialized fixture database, with in-process tools.
pub fn export_context(store: StoreFixture, config: ExportConfig) -> ExportContext {
    let mut db = store.into_chat_db();
    db.init(None).unwrap();
    with_fake_tools(config, Arc::new(db))
}

/// Context over `source` with in-process tools and a generous files limit.
pub fn with_fake_tools(config: ExportConfig, source: Arc<dyn DataSource>) -> ExportContext {
    ExportContext::new(config, source)
        .with_converter(Arc::new(PassthroughConverter))
        .with_renderer(Arc::new(HtmlRenderer))
        .with_limits(Arc::new(FixedLimits::new(1024, 4096)))
}
