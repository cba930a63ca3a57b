//! Embedded relational store.
//!
//! A dedicated thread owns the `rusqlite::Connection`; async callers talk to
//! it through an unbounded request channel and get answers on oneshot
//! channels. Requests are served strictly in the order they were sent.

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, Row};
use tokio::sync::{mpsc, oneshot};

use super::{EntryStore, EntryWrite, TagWrite};
use crate::model::{EntriesByDate, Entry, Tag, TagCategory, UserProfile, DATE_FORMAT};

pub const DB_FILE_NAME: &str = "dreams.db";

enum DbRequest {
    LoadEntries {
        reply: oneshot::Sender<Result<Vec<Entry>>>,
    },
    UpsertEntry {
        entry: Entry,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteEntry {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ReplaceEntries {
        entries: Vec<Entry>,
        reply: oneshot::Sender<Result<()>>,
    },
    LoadTags {
        reply: oneshot::Sender<Result<Vec<Tag>>>,
    },
    InsertTag {
        tag: Tag,
        reply: oneshot::Sender<Result<()>>,
    },
    DeleteTag {
        name: String,
        reply: oneshot::Sender<Result<()>>,
    },
    ReplaceTags {
        tags: Vec<Tag>,
        reply: oneshot::Sender<Result<()>>,
    },
    LoadProfile {
        reply: oneshot::Sender<Result<Option<UserProfile>>>,
    },
    SaveProfile {
        profile: UserProfile,
        reply: oneshot::Sender<Result<()>>,
    },
    ClearAll {
        reply: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct SqliteStore {
    tx: mpsc::UnboundedSender<DbRequest>,
}

impl SqliteStore {
    pub fn open_at(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        tracing::info!(path = %path.display(), "opening journal database");
        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;
        Self::spawn(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::spawn(conn)
    }

    fn spawn(conn: Connection) -> Result<Self> {
        // Create tables before returning so a broken database fails early.
        let mut actor = StoreActor::new(conn).context("Failed to initialize database actor")?;
        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("dreamlog-sqlite".into())
            .spawn(move || actor.run(rx))
            .context("Failed to spawn database thread")?;
        Ok(Self { tx })
    }

    async fn call<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T>>) -> DbRequest,
    ) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| anyhow!("DB actor shutdown"))?;
        rx.await.context("DB actor dropped reply")?
    }
}

#[async_trait]
impl EntryStore for SqliteStore {
    async fn load_entries(&self) -> Result<Vec<Entry>> {
        self.call(|reply| DbRequest::LoadEntries { reply }).await
    }

    async fn write_entry(&self, change: EntryWrite, _after: &EntriesByDate) -> Result<()> {
        match change {
            EntryWrite::Insert(entry) | EntryWrite::Update(entry) => {
                self.call(|reply| DbRequest::UpsertEntry { entry, reply })
                    .await
            }
            EntryWrite::Delete(id) => self.call(|reply| DbRequest::DeleteEntry { id, reply }).await,
        }
    }

    async fn replace_entries(&self, entries: &[Entry]) -> Result<()> {
        let entries = entries.to_vec();
        self.call(|reply| DbRequest::ReplaceEntries { entries, reply })
            .await
    }

    async fn load_tags(&self) -> Result<Vec<Tag>> {
        self.call(|reply| DbRequest::LoadTags { reply }).await
    }

    async fn write_tag(&self, change: TagWrite, _after: &[Tag]) -> Result<()> {
        match change {
            TagWrite::Insert(tag) => self.call(|reply| DbRequest::InsertTag { tag, reply }).await,
            TagWrite::Delete(name) => self.call(|reply| DbRequest::DeleteTag { name, reply }).await,
        }
    }

    async fn replace_tags(&self, tags: &[Tag]) -> Result<()> {
        let tags = tags.to_vec();
        self.call(|reply| DbRequest::ReplaceTags { tags, reply }).await
    }

    async fn load_profile(&self) -> Result<Option<UserProfile>> {
        self.call(|reply| DbRequest::LoadProfile { reply }).await
    }

    async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        let profile = profile.clone();
        self.call(|reply| DbRequest::SaveProfile { profile, reply })
            .await
    }

    async fn clear_all(&self) -> Result<()> {
        self.call(|reply| DbRequest::ClearAll { reply }).await
    }
}

const ENTRY_COLUMNS: &str =
    "id, title, description, date, created_at, updated_at, tags, is_lucid, is_nightmare, audio_path";

const UPSERT_ENTRY: &str =
    "INSERT INTO dreams (id, title, description, date, created_at, updated_at, tags, is_lucid, is_nightmare, audio_path)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
     ON CONFLICT(id) DO UPDATE SET
        title = excluded.title,
        description = excluded.description,
        date = excluded.date,
        updated_at = excluded.updated_at,
        tags = excluded.tags,
        is_lucid = excluded.is_lucid,
        is_nightmare = excluded.is_nightmare,
        audio_path = excluded.audio_path";

// Synchronous internal implementation
struct StoreActor {
    conn: Connection,
}

impl StoreActor {
    fn new(conn: Connection) -> Result<Self> {
        let actor = Self { conn };
        actor.create_tables().context("Failed to create tables")?;
        Ok(actor)
    }

    fn create_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS dreams (
                id TEXT PRIMARY KEY NOT NULL,
                title TEXT NOT NULL,
                description TEXT,
                date TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT,
                tags TEXT,
                is_lucid INTEGER DEFAULT 0,
                is_nightmare INTEGER DEFAULT 0,
                audio_path TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_dreams_date ON dreams(date);
            CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY NOT NULL,
                name TEXT UNIQUE NOT NULL,
                category TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS user_profile (
                key TEXT PRIMARY KEY NOT NULL,
                value TEXT
            );",
        )?;
        Ok(())
    }

    fn run(&mut self, mut rx: mpsc::UnboundedReceiver<DbRequest>) {
        while let Some(req) = rx.blocking_recv() {
            match req {
                DbRequest::LoadEntries { reply } => {
                    let _ = reply.send(self.load_entries());
                }
                DbRequest::UpsertEntry { entry, reply } => {
                    let _ = reply.send(self.upsert_entry(&entry));
                }
                DbRequest::DeleteEntry { id, reply } => {
                    let _ = reply.send(self.delete_entry(&id));
                }
                DbRequest::ReplaceEntries { entries, reply } => {
                    let _ = reply.send(self.replace_entries(&entries));
                }
                DbRequest::LoadTags { reply } => {
                    let _ = reply.send(self.load_tags());
                }
                DbRequest::InsertTag { tag, reply } => {
                    let _ = reply.send(self.insert_tag(&tag));
                }
                DbRequest::DeleteTag { name, reply } => {
                    let _ = reply.send(self.delete_tag(&name));
                }
                DbRequest::ReplaceTags { tags, reply } => {
                    let _ = reply.send(self.replace_tags(&tags));
                }
                DbRequest::LoadProfile { reply } => {
                    let _ = reply.send(self.load_profile());
                }
                DbRequest::SaveProfile { profile, reply } => {
                    let _ = reply.send(self.save_profile(&profile));
                }
                DbRequest::ClearAll { reply } => {
                    let _ = reply.send(self.clear_all());
                }
            }
        }
        tracing::debug!("database actor stopped");
    }

    fn load_entries(&self) -> Result<Vec<Entry>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM dreams ORDER BY date, created_at"
        ))?;
        let rows = stmt.query_map([], RawEntry::from_row)?;

        // A row that does not decode is skipped, not fatal: failing the
        // whole load would leave the journal empty and a later replace
        // would erase the readable rows too.
        let mut entries = Vec::new();
        for raw in rows {
            match raw.map_err(anyhow::Error::from).and_then(RawEntry::into_entry) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!(error = %format!("{e:#}"), "skipping undecodable entry row"),
            }
        }
        Ok(entries)
    }

    fn upsert_entry(&self, entry: &Entry) -> Result<()> {
        let tags = serde_json::to_string(&entry.tags)?;
        self.conn.execute(
            UPSERT_ENTRY,
            params![
                entry.id,
                entry.title,
                entry.description,
                entry.date.format(DATE_FORMAT).to_string(),
                entry.created_at.to_rfc3339(),
                entry.updated_at.map(|t| t.to_rfc3339()),
                tags,
                entry.is_lucid,
                entry.is_nightmare,
                entry.audio_path,
            ],
        )?;
        Ok(())
    }

    fn delete_entry(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM dreams WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn replace_entries(&mut self, entries: &[Entry]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM dreams", [])?;
        {
            let mut stmt = tx.prepare(UPSERT_ENTRY)?;
            for entry in entries {
                stmt.execute(params![
                    entry.id,
                    entry.title,
                    entry.description,
                    entry.date.format(DATE_FORMAT).to_string(),
                    entry.created_at.to_rfc3339(),
                    entry.updated_at.map(|t| t.to_rfc3339()),
                    serde_json::to_string(&entry.tags)?,
                    entry.is_lucid,
                    entry.is_nightmare,
                    entry.audio_path,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn load_tags(&self) -> Result<Vec<Tag>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, category FROM tags ORDER BY rowid")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut tags = Vec::new();
        for row in rows {
            let (id, name, category) = row?;
            let category = TagCategory::parse(&category).unwrap_or_else(|| {
                tracing::warn!(tag = %name, category = %category, "unknown tag category, using regular");
                TagCategory::Regular
            });
            tags.push(Tag { id, name, category });
        }
        Ok(tags)
    }

    fn insert_tag(&self, tag: &Tag) -> Result<()> {
        self.conn.execute(
            "INSERT INTO tags (id, name, category) VALUES (?1, ?2, ?3)",
            params![tag.id, tag.name, tag.category.as_str()],
        )?;
        Ok(())
    }

    fn delete_tag(&self, name: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM tags WHERE name = ?1", params![name])?;
        Ok(())
    }

    fn replace_tags(&mut self, tags: &[Tag]) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM tags", [])?;
        for tag in tags {
            tx.execute(
                "INSERT OR REPLACE INTO tags (id, name, category) VALUES (?1, ?2, ?3)",
                params![tag.id, tag.name, tag.category.as_str()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// The profile is stored one JSON-encoded field per row.
    fn load_profile(&self) -> Result<Option<UserProfile>> {
        let mut stmt = self.conn.prepare("SELECT key, value FROM user_profile")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut fields = serde_json::Map::new();
        for row in rows {
            let (key, value) = row?;
            let value = match value {
                Some(v) => serde_json::from_str(&v)?,
                None => serde_json::Value::Null,
            };
            fields.insert(key, value);
        }

        if fields.is_empty() {
            return Ok(None);
        }
        let profile = serde_json::from_value(serde_json::Value::Object(fields))
            .context("Stored profile is incomplete")?;
        Ok(Some(profile))
    }

    fn save_profile(&mut self, profile: &UserProfile) -> Result<()> {
        let serde_json::Value::Object(fields) = serde_json::to_value(profile)? else {
            return Err(anyhow!("Profile did not serialize to an object"));
        };

        let tx = self.conn.transaction()?;
        for (key, value) in fields {
            tx.execute(
                "INSERT OR REPLACE INTO user_profile (key, value) VALUES (?1, ?2)",
                params![key, value.to_string()],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn clear_all(&mut self) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM dreams", [])?;
        tx.execute("DELETE FROM tags", [])?;
        tx.execute("DELETE FROM user_profile", [])?;
        tx.commit()?;
        Ok(())
    }
}

/// Column values as stored, before parsing dates and JSON.
struct RawEntry {
    id: String,
    title: String,
    description: Option<String>,
    date: String,
    created_at: String,
    updated_at: Option<String>,
    tags: Option<String>,
    is_lucid: bool,
    is_nightmare: bool,
    audio_path: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            description: row.get(2)?,
            date: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            tags: row.get(6)?,
            is_lucid: row.get::<_, Option<bool>>(7)?.unwrap_or(false),
            is_nightmare: row.get::<_, Option<bool>>(8)?.unwrap_or(false),
            audio_path: row.get(9)?,
        })
    }

    fn into_entry(self) -> Result<Entry> {
        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .with_context(|| format!("Bad date {:?} on entry {}", self.date, self.id))?;
        let created_at = parse_instant(&self.created_at)
            .with_context(|| format!("Bad created_at on entry {}", self.id))?;
        let updated_at = self
            .updated_at
            .as_deref()
            .map(parse_instant)
            .transpose()
            .with_context(|| format!("Bad updated_at on entry {}", self.id))?;
        let tags = match self.tags.as_deref() {
            Some(json) if !json.is_empty() => serde_json::from_str(json)
                .with_context(|| format!("Bad tags column on entry {}", self.id))?,
            _ => Vec::new(),
        };

        Ok(Entry {
            id: self.id,
            date,
            title: self.title,
            description: self.description,
            tags,
            created_at,
            updated_at,
            is_lucid: self.is_lucid,
            is_nightmare: self.is_nightmare,
            audio_path: self.audio_path,
        })
    }
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
