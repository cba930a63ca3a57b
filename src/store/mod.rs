//! Durable substrates behind the journal repository.
//!
//! Two implementations share the [`EntryStore`] contract:
//! - [`sqlite::SqliteStore`]: one row per entry and tag, written row by row.
//! - [`prefs::PreferenceStore`]: one JSON value per collection, rewritten
//!   whole on every change.
//!
//! Every write call receives both the change and the collection as it will
//! look afterwards, so each substrate can pick its own write granularity.

pub mod prefs;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

use crate::model::{EntriesByDate, Entry, Tag, UserProfile};

pub use prefs::PreferenceStore;
pub use sqlite::SqliteStore;

#[derive(Debug, Clone)]
pub enum EntryWrite {
    Insert(Entry),
    Update(Entry),
    Delete(String),
}

#[derive(Debug, Clone)]
pub enum TagWrite {
    Insert(Tag),
    Delete(String),
}

#[async_trait]
pub trait EntryStore: Send + Sync + 'static {
    async fn load_entries(&self) -> Result<Vec<Entry>>;

    async fn write_entry(&self, change: EntryWrite, after: &EntriesByDate) -> Result<()>;

    /// Clear every entry, then insert `entries` as given (ids and timestamps kept).
    async fn replace_entries(&self, entries: &[Entry]) -> Result<()>;

    async fn load_tags(&self) -> Result<Vec<Tag>>;

    async fn write_tag(&self, change: TagWrite, after: &[Tag]) -> Result<()>;

    async fn replace_tags(&self, tags: &[Tag]) -> Result<()>;

    async fn load_profile(&self) -> Result<Option<UserProfile>>;

    async fn save_profile(&self, profile: &UserProfile) -> Result<()>;

    /// Wipe entries, tags and profile.
    async fn clear_all(&self) -> Result<()>;
}
