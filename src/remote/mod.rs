//! Remote backup of the journal.
//!
//! The whole journal of one user lives in a single remote document keyed by
//! the authenticated user id, with two fields: `entries` and `tags`. Writes
//! merge one field at a time and never touch sibling fields. Entry titles and
//! descriptions are obfuscated with [`crate::crypto`] before upload.

pub mod http;
pub mod memory;

use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::config;
use crate::crypto::{self, FieldKey};
use crate::model::{Entry, Tag};

pub use http::HttpDocumentClient;
pub use memory::MemoryDocumentClient;

/// Collection holding one journal document per user.
pub const COLLECTION: &str = "dreams";

const ENTRIES_FIELD: &str = "entries";
const TAGS_FIELD: &str = "tags";

/// Generic document-store client: read a document by key, merge fields into it.
#[async_trait]
pub trait DocumentClient: Send + Sync {
    /// `Ok(None)` when the document does not exist.
    async fn get_document(&self, collection: &str, key: &str) -> Result<Option<Map<String, Value>>>;

    /// Set the given top-level fields, leaving every other field as it was.
    /// Creates the document if needed.
    async fn merge_document(&self, collection: &str, key: &str, fields: Map<String, Value>) -> Result<()>;
}

/// Who is signed in, if anyone.
pub trait IdentityProvider: Send + Sync {
    fn current_user_id(&self) -> Option<String>;
}

/// Reads the user id from the `sub` claim of the stored token.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokenIdentity;

impl IdentityProvider for TokenIdentity {
    fn current_user_id(&self) -> Option<String> {
        let token = config::get_token();
        if token.is_empty() {
            return None;
        }
        match config::get_user_id_from_token(&token) {
            Ok(uid) => Some(uid),
            Err(e) => {
                tracing::warn!(error = %e, "stored token has no usable user id");
                None
            }
        }
    }
}

/// A fixed identity.
#[derive(Debug, Default, Clone)]
pub struct StaticIdentity(pub Option<String>);

impl StaticIdentity {
    pub fn user(uid: impl Into<String>) -> Self {
        Self(Some(uid.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl IdentityProvider for StaticIdentity {
    fn current_user_id(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Both collections as read in one fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSnapshot {
    pub entries: Vec<Entry>,
    pub tags: Vec<Tag>,
}

pub struct RemoteBackup {
    client: Arc<dyn DocumentClient>,
    identity: Arc<dyn IdentityProvider>,
    key_cache: Mutex<Option<(String, FieldKey)>>,
}

impl RemoteBackup {
    pub fn new(client: Arc<dyn DocumentClient>, identity: Arc<dyn IdentityProvider>) -> Self {
        Self {
            client,
            identity,
            key_cache: Mutex::new(None),
        }
    }

    pub fn current_user(&self) -> Option<String> {
        self.identity.current_user_id().filter(|uid| !uid.is_empty())
    }

    pub fn is_authenticated(&self) -> bool {
        self.current_user().is_some()
    }

    async fn key_for(&self, uid: &str) -> Result<FieldKey> {
        if let Ok(guard) = self.key_cache.lock() {
            if let Some((cached_uid, key)) = guard.as_ref() {
                if cached_uid == uid {
                    return Ok(key.clone());
                }
            }
        }

        let key = crypto::derive_user_key_async(uid.to_string()).await?;
        if let Ok(mut guard) = self.key_cache.lock() {
            *guard = Some((uid.to_string(), key.clone()));
        }
        Ok(key)
    }

    async fn merge(&self, uid: &str, field: &str, value: Value) -> Result<()> {
        let mut fields = Map::new();
        fields.insert(field.to_string(), value);
        self.client.merge_document(COLLECTION, uid, fields).await
    }

    /// Upload every entry, replacing the remote `entries` field. A no-op when
    /// nobody is signed in.
    pub async fn save_all_entries(&self, entries: &[Entry]) -> Result<()> {
        let Some(uid) = self.current_user() else {
            tracing::debug!("save_all_entries: no authenticated user, skipping");
            return Ok(());
        };
        let key = self.key_for(&uid).await?;

        let mut protected = Vec::with_capacity(entries.len());
        for entry in entries {
            let mut entry = entry.clone();
            entry.title = crypto::encrypt(&entry.title, &key)?;
            entry.description = match entry.description.as_deref() {
                Some(text) if !text.is_empty() => Some(crypto::encrypt(text, &key)?),
                _ => None,
            };
            protected.push(entry);
        }

        self.merge(&uid, ENTRIES_FIELD, serde_json::to_value(&protected)?)
            .await?;
        tracing::info!(count = entries.len(), "entries backed up");
        Ok(())
    }

    /// Download and decrypt every entry. Fields that do not decrypt are
    /// returned as stored; items that do not parse as entries are skipped.
    pub async fn get_all_entries(&self) -> Result<Vec<Entry>> {
        Ok(self.fetch_snapshot().await?.entries)
    }

    pub async fn save_all_tags(&self, tags: &[Tag]) -> Result<()> {
        let Some(uid) = self.current_user() else {
            tracing::debug!("save_all_tags: no authenticated user, skipping");
            return Ok(());
        };
        self.merge(&uid, TAGS_FIELD, serde_json::to_value(tags)?).await?;
        tracing::info!(count = tags.len(), "tags backed up");
        Ok(())
    }

    pub async fn get_all_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.fetch_snapshot().await?.tags)
    }

    /// Empty the remote `entries` field. The document and its tags stay.
    pub async fn delete_all_entries(&self) -> Result<()> {
        let uid = self
            .current_user()
            .ok_or_else(|| anyhow!("No user is currently logged in"))?;
        self.merge(&uid, ENTRIES_FIELD, Value::Array(Vec::new()))
            .await?;
        tracing::info!(user = %uid, "remote entries deleted");
        Ok(())
    }

    /// Empty the remote `tags` field. The document and its entries stay.
    pub async fn delete_all_tags(&self) -> Result<()> {
        let uid = self
            .current_user()
            .ok_or_else(|| anyhow!("No user is currently logged in"))?;
        self.merge(&uid, TAGS_FIELD, Value::Array(Vec::new())).await?;
        tracing::info!(user = %uid, "remote tags deleted");
        Ok(())
    }

    /// Read entries and tags with a single document fetch. Empty when nobody
    /// is signed in or the document does not exist yet.
    pub async fn fetch_snapshot(&self) -> Result<RemoteSnapshot> {
        let Some(uid) = self.current_user() else {
            return Ok(RemoteSnapshot::default());
        };
        let Some(mut doc) = self.client.get_document(COLLECTION, &uid).await? else {
            tracing::debug!(user = %uid, "no remote document yet");
            return Ok(RemoteSnapshot::default());
        };

        let raw_entries = take_array(&mut doc, ENTRIES_FIELD);
        let entries = if raw_entries.is_empty() {
            Vec::new()
        } else {
            let key = self.key_for(&uid).await?;
            decode_items::<Entry>(raw_entries, "entry")
                .into_iter()
                .map(|mut entry| {
                    entry.title = crypto::decrypt_or_raw(&entry.title, &key);
                    entry.description = entry
                        .description
                        .as_deref()
                        .map(|d| crypto::decrypt_or_raw(d, &key))
                        .filter(|d| !d.is_empty());
                    entry
                })
                .collect()
        };
        let tags = decode_items::<Tag>(take_array(&mut doc, TAGS_FIELD), "tag");

        Ok(RemoteSnapshot { entries, tags })
    }
}

fn take_array(doc: &mut Map<String, Value>, field: &str) -> Vec<Value> {
    match doc.remove(field) {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => {
            tracing::warn!(field, kind = ?other, "remote field is not an array, ignoring");
            Vec::new()
        }
    }
}

fn decode_items<T: serde::de::DeserializeOwned>(items: Vec<Value>, what: &str) -> Vec<T> {
    items
        .into_iter()
        .filter_map(|item| match serde_json::from_value(item) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, kind = what, "skipping malformed remote item");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{parse_date, TagCategory};
    use chrono::Utc;

    fn entry(id: &str, title: &str, description: Option<&str>) -> Entry {
        Entry {
            id: id.into(),
            date: parse_date("2024-03-10").unwrap(),
            title: title.into(),
            description: description.map(Into::into),
            tags: vec![],
            created_at: Utc::now(),
            updated_at: None,
            is_lucid: false,
            is_nightmare: false,
            audio_path: None,
        }
    }

    fn backup_for(client: Arc<MemoryDocumentClient>, uid: &str) -> RemoteBackup {
        RemoteBackup::new(client, Arc::new(StaticIdentity::user(uid)))
    }

    #[tokio::test]
    async fn entries_are_obfuscated_at_rest_and_restored_on_read() {
        let client = Arc::new(MemoryDocumentClient::new());
        let backup = backup_for(client.clone(), "uid-1");
        let original = vec![entry("a", "Flying", Some("over the sea"))];

        backup.save_all_entries(&original).await.unwrap();

        let raw = client.raw_document(COLLECTION, "uid-1").unwrap();
        let stored_title = raw["entries"][0]["title"].as_str().unwrap();
        assert_ne!(stored_title, "Flying");
        assert!(stored_title.contains(':'));

        assert_eq!(backup.get_all_entries().await.unwrap(), original);
    }

    #[tokio::test]
    async fn legacy_plaintext_entries_read_back_unchanged() {
        let client = Arc::new(MemoryDocumentClient::new());
        let legacy = serde_json::to_value(vec![entry("a", "Plain title", Some("plain"))]).unwrap();
        let mut fields = Map::new();
        fields.insert("entries".into(), legacy);
        client.merge_document(COLLECTION, "uid-1", fields).await.unwrap();

        let entries = backup_for(client, "uid-1").get_all_entries().await.unwrap();
        assert_eq!(entries[0].title, "Plain title");
        assert_eq!(entries[0].description.as_deref(), Some("plain"));
    }

    #[tokio::test]
    async fn saving_tags_keeps_entries_and_vice_versa() {
        let client = Arc::new(MemoryDocumentClient::new());
        let backup = backup_for(client.clone(), "uid-1");
        backup.save_all_entries(&[entry("a", "Flying", None)]).await.unwrap();
        let tags = vec![Tag {
            id: "t".into(),
            name: "Lucid".into(),
            category: TagCategory::Lucid,
        }];
        backup.save_all_tags(&tags).await.unwrap();

        let snapshot = backup.fetch_snapshot().await.unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert_eq!(snapshot.tags, tags);

        backup.delete_all_entries().await.unwrap();
        let snapshot = backup.fetch_snapshot().await.unwrap();
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.tags, tags);
        assert!(client.raw_document(COLLECTION, "uid-1").is_some());
    }

    #[tokio::test]
    async fn anonymous_saves_are_no_ops_and_never_touch_other_users() {
        let client = Arc::new(MemoryDocumentClient::new());
        let anon = RemoteBackup::new(client.clone(), Arc::new(StaticIdentity::anonymous()));
        anon.save_all_entries(&[entry("a", "x", None)]).await.unwrap();
        assert!(client.is_empty());
        assert!(anon.delete_all_tags().await.is_err());

        backup_for(client.clone(), "alice")
            .save_all_entries(&[entry("a", "x", None)])
            .await
            .unwrap();
        assert!(backup_for(client, "bob").get_all_entries().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn malformed_items_are_skipped() {
        let client = Arc::new(MemoryDocumentClient::new());
        let mut fields = Map::new();
        fields.insert(
            "entries".into(),
            serde_json::json!([{"id": "broken"}, serde_json::to_value(entry("ok", "Fine", None)).unwrap()]),
        );
        client.merge_document(COLLECTION, "uid-1", fields).await.unwrap();

        let entries = backup_for(client, "uid-1").get_all_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "ok");
    }
}
