//! The journal repository: single source of truth for entries, tags and the
//! user profile during a session.
//!
//! Every mutation is persisted first and only then applied to the in-memory
//! snapshot, so a failed write leaves memory untouched. Mutations are
//! serialized behind one async lock and observed in the order they were
//! issued. Subscribers get the current snapshot on subscribe and every later
//! one in emission order.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Local, NaiveDate, Utc};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::error::{JournalError, Result, ValidationError};
use crate::model::{
    flatten_newest_first, group_by_date, parse_date, DreamStatistics, EntriesByDate, Entry,
    EntryPatch, NewEntry, Tag, TagCategory, UserProfile, MAX_TAGS,
};
use crate::notify::{NoticeLevel, Notifier};
use crate::stats;
use crate::store::{EntryStore, EntryWrite, PreferenceStore, SqliteStore, TagWrite};
use crate::sync::{merge_entries, merge_tags, ConflictPolicy, EntryMerge, TagMerge};

/// Behavioral contract shared by every storage backend.
#[async_trait]
pub trait EntryRepository: Send + Sync {
    async fn add_entry(&self, data: NewEntry) -> Result<Entry>;

    /// `Ok(None)` when no entry has this id.
    async fn update_entry(&self, id: &str, patch: EntryPatch) -> Result<Option<Entry>>;

    /// `Ok(false)` when no entry has this id.
    async fn delete_entry(&self, id: &str) -> Result<bool>;

    fn get_entry_by_id(&self, id: &str) -> Option<Entry>;

    fn get_entries_by_date(&self, date: NaiveDate) -> Vec<Entry>;

    /// Every entry, newest `createdAt` first.
    fn get_all_entries(&self) -> Vec<Entry>;

    fn has_entries(&self, date: NaiveDate) -> bool;

    fn snapshot(&self) -> EntriesByDate;

    async fn add_tag(&self, name: &str, category: TagCategory) -> Result<Tag>;

    async fn delete_tag(&self, name: &str) -> Result<bool>;

    fn get_all_tags(&self) -> Vec<Tag>;

    fn user_profile(&self) -> UserProfile;

    async fn update_user_profile(&self, profile: UserProfile) -> Result<()>;

    fn get_dream_statistics(&self) -> DreamStatistics;

    async fn clear_all_data(&self) -> Result<()>;

    /// Replace every entry with `entries`. Empty input is a no-op and
    /// returns `Ok(false)`, so a degenerate sync payload never wipes the journal.
    async fn set_all_entries_overwrite(&self, entries: Vec<Entry>) -> Result<bool>;

    /// Replace every tag with `tags`. Empty input is a no-op.
    async fn set_all_tags_overwrite(&self, tags: Vec<Tag>) -> Result<bool>;

    /// Merge a remote entry list into the journal as it stands when the
    /// write lock is taken. Only the local side is written; the returned
    /// merge tells the caller what the remote still lacks.
    async fn merge_remote_entries(&self, remote: &[Entry], policy: ConflictPolicy) -> Result<EntryMerge>;

    /// Union remote tags into the registry under the write lock.
    async fn merge_remote_tags(&self, remote: &[Tag]) -> Result<TagMerge>;

    fn subscribe_entries(&self) -> watch::Receiver<EntriesByDate>;

    fn subscribe_tags(&self) -> watch::Receiver<Vec<Tag>>;

    fn subscribe_profile(&self) -> watch::Receiver<UserProfile>;

    /// Pretty JSON of all entries grouped by date.
    fn export_entries(&self) -> Result<String>;
}

/// Repository backed by the embedded relational store.
pub type NativeRepository = JournalRepository<SqliteStore>;

/// Repository backed by the preference/blob store.
pub type BrowserRepository = JournalRepository<PreferenceStore>;

pub struct JournalRepository<S: EntryStore> {
    store: S,
    notifier: Arc<dyn Notifier>,
    write_lock: Mutex<()>,
    entries: watch::Sender<EntriesByDate>,
    tags: watch::Sender<Vec<Tag>>,
    profile: watch::Sender<UserProfile>,
}

impl<S: EntryStore> JournalRepository<S> {
    /// Load the persisted state. A collection that fails to load starts
    /// empty; the failure is logged, not returned.
    pub async fn open(store: S, notifier: Arc<dyn Notifier>) -> Self {
        let entries = match store.load_entries().await {
            Ok(entries) => group_by_date(entries),
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "failed to load entries");
                EntriesByDate::new()
            }
        };
        let tags = store.load_tags().await.unwrap_or_else(|e| {
            tracing::error!(error = %format!("{e:#}"), "failed to load tags");
            Vec::new()
        });
        let profile = match store.load_profile().await {
            Ok(profile) => profile.unwrap_or_default(),
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "failed to load user profile");
                UserProfile::default()
            }
        };

        tracing::info!(
            dates = entries.len(),
            tags = tags.len(),
            "journal repository loaded"
        );

        Self {
            store,
            notifier,
            write_lock: Mutex::new(()),
            entries: watch::Sender::new(entries),
            tags: watch::Sender::new(tags),
            profile: watch::Sender::new(profile),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn reject<T>(&self, error: ValidationError) -> Result<T> {
        self.notifier.notify(NoticeLevel::Error, &error.to_string());
        Err(error.into())
    }

    fn storage_failure(&self, action: &str, error: anyhow::Error) -> JournalError {
        tracing::error!(action, error = %format!("{error:#}"), "store write failed");
        JournalError::Storage(error)
    }

    fn validate_date(&self, raw: &str) -> std::result::Result<NaiveDate, ValidationError> {
        parse_date(raw).ok_or_else(|| ValidationError::InvalidDate(raw.to_string()))
    }
}

#[async_trait]
impl<S: EntryStore> EntryRepository for JournalRepository<S> {
    async fn add_entry(&self, data: NewEntry) -> Result<Entry> {
        let title = data.title.trim();
        if title.is_empty() {
            return self.reject(ValidationError::EmptyTitle);
        }
        let date = match self.validate_date(&data.date) {
            Ok(date) => date,
            Err(e) => return self.reject(e),
        };

        let entry = Entry {
            id: Uuid::new_v4().to_string(),
            date,
            title: title.to_string(),
            description: data.description,
            tags: data.tags,
            created_at: Utc::now(),
            updated_at: None,
            is_lucid: data.is_lucid,
            is_nightmare: data.is_nightmare,
            audio_path: data.audio_path,
        };

        let _guard = self.write_lock.lock().await;
        let mut next = self.entries.borrow().clone();
        next.entry(date).or_default().push(entry.clone());

        self.store
            .write_entry(EntryWrite::Insert(entry.clone()), &next)
            .await
            .map_err(|e| self.storage_failure("add_entry", e))?;
        self.entries.send_replace(next);

        tracing::debug!(id = %entry.id, date = %entry.date, "entry added");
        Ok(entry)
    }

    async fn update_entry(&self, id: &str, patch: EntryPatch) -> Result<Option<Entry>> {
        if let Some(title) = &patch.title {
            if title.trim().is_empty() {
                return self.reject(ValidationError::EmptyTitle);
            }
        }
        let new_date = match patch.date.as_deref().map(|d| self.validate_date(d)).transpose() {
            Ok(date) => date,
            Err(e) => return self.reject(e),
        };

        let _guard = self.write_lock.lock().await;
        let mut next = self.entries.borrow().clone();

        let Some((old_date, index)) = locate(&next, id) else {
            tracing::debug!(id, "update_entry: no such entry");
            return Ok(None);
        };

        let mut updated = next
            .get_mut(&old_date)
            .map(|bucket| bucket.remove(index))
            .ok_or_else(|| JournalError::Storage(anyhow::anyhow!("bucket vanished for {id}")))?;
        updated.apply(patch, new_date, Utc::now());

        if next.get(&old_date).is_some_and(|b| b.is_empty()) {
            next.remove(&old_date);
        }
        next.entry(updated.date).or_default().push(updated.clone());

        self.store
            .write_entry(EntryWrite::Update(updated.clone()), &next)
            .await
            .map_err(|e| self.storage_failure("update_entry", e))?;
        self.entries.send_replace(next);

        tracing::debug!(id, "entry updated");
        Ok(Some(updated))
    }

    async fn delete_entry(&self, id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.entries.borrow().clone();

        let Some((date, index)) = locate(&next, id) else {
            return Ok(false);
        };
        if let Some(bucket) = next.get_mut(&date) {
            bucket.remove(index);
            if bucket.is_empty() {
                next.remove(&date);
            }
        }

        self.store
            .write_entry(EntryWrite::Delete(id.to_string()), &next)
            .await
            .map_err(|e| self.storage_failure("delete_entry", e))?;
        self.entries.send_replace(next);

        tracing::debug!(id, "entry deleted");
        Ok(true)
    }

    fn get_entry_by_id(&self, id: &str) -> Option<Entry> {
        self.entries
            .borrow()
            .values()
            .flatten()
            .find(|e| e.id == id)
            .cloned()
    }

    fn get_entries_by_date(&self, date: NaiveDate) -> Vec<Entry> {
        self.entries.borrow().get(&date).cloned().unwrap_or_default()
    }

    fn get_all_entries(&self) -> Vec<Entry> {
        flatten_newest_first(&self.entries.borrow())
    }

    fn has_entries(&self, date: NaiveDate) -> bool {
        self.entries
            .borrow()
            .get(&date)
            .is_some_and(|bucket| !bucket.is_empty())
    }

    fn snapshot(&self) -> EntriesByDate {
        self.entries.borrow().clone()
    }

    async fn add_tag(&self, name: &str, category: TagCategory) -> Result<Tag> {
        let name = name.trim();
        if name.is_empty() {
            return self.reject(ValidationError::EmptyTagName);
        }

        let _guard = self.write_lock.lock().await;
        let mut next = self.tags.borrow().clone();
        if next.len() >= MAX_TAGS {
            return self.reject(ValidationError::TagLimitReached);
        }
        if next.iter().any(|t| t.name == name) {
            return self.reject(ValidationError::DuplicateTag(name.to_string()));
        }

        let tag = Tag {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            category,
        };
        next.push(tag.clone());

        self.store
            .write_tag(TagWrite::Insert(tag.clone()), &next)
            .await
            .map_err(|e| self.storage_failure("add_tag", e))?;
        self.tags.send_replace(next);
        Ok(tag)
    }

    async fn delete_tag(&self, name: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        let current = self.tags.borrow().clone();
        if !current.iter().any(|t| t.name == name) {
            return Ok(false);
        }
        let next: Vec<Tag> = current.into_iter().filter(|t| t.name != name).collect();

        self.store
            .write_tag(TagWrite::Delete(name.to_string()), &next)
            .await
            .map_err(|e| self.storage_failure("delete_tag", e))?;
        self.tags.send_replace(next);
        Ok(true)
    }

    fn get_all_tags(&self) -> Vec<Tag> {
        self.tags.borrow().clone()
    }

    fn user_profile(&self) -> UserProfile {
        self.profile.borrow().clone()
    }

    async fn update_user_profile(&self, profile: UserProfile) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        self.store
            .save_profile(&profile)
            .await
            .map_err(|e| self.storage_failure("update_user_profile", e))?;
        self.profile.send_replace(profile);
        Ok(())
    }

    fn get_dream_statistics(&self) -> DreamStatistics {
        stats::compute(
            &self.entries.borrow(),
            &self.tags.borrow(),
            Local::now().date_naive(),
        )
    }

    async fn clear_all_data(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self.store.clear_all().await {
            self.notifier
                .notify(NoticeLevel::Error, "Failed to clear data.");
            return Err(self.storage_failure("clear_all_data", e));
        }

        self.entries.send_replace(EntriesByDate::new());
        self.tags.send_replace(Vec::new());
        self.profile.send_replace(UserProfile::default());
        self.notifier
            .notify(NoticeLevel::Info, "All data cleared successfully.");
        tracing::info!("all local data cleared");
        Ok(())
    }

    async fn set_all_entries_overwrite(&self, entries: Vec<Entry>) -> Result<bool> {
        if entries.is_empty() {
            tracing::debug!("set_all_entries_overwrite: empty input ignored");
            return Ok(false);
        }

        let mut seen = HashSet::new();
        let entries: Vec<Entry> = entries
            .into_iter()
            .filter(|e| seen.insert(e.id.clone()))
            .collect();

        let _guard = self.write_lock.lock().await;
        self.store
            .replace_entries(&entries)
            .await
            .map_err(|e| self.storage_failure("set_all_entries_overwrite", e))?;

        let count = entries.len();
        self.entries.send_replace(group_by_date(entries));
        tracing::info!(count, "entries overwritten");
        Ok(true)
    }

    async fn set_all_tags_overwrite(&self, tags: Vec<Tag>) -> Result<bool> {
        if tags.is_empty() {
            tracing::debug!("set_all_tags_overwrite: empty input ignored");
            return Ok(false);
        }

        let mut seen = HashSet::new();
        let mut tags: Vec<Tag> = tags
            .into_iter()
            .filter(|t| seen.insert(t.name.clone()))
            .collect();
        if tags.len() > MAX_TAGS {
            tracing::warn!(count = tags.len(), "tag overwrite exceeds registry cap, truncating");
            tags.truncate(MAX_TAGS);
        }

        let _guard = self.write_lock.lock().await;
        self.store
            .replace_tags(&tags)
            .await
            .map_err(|e| self.storage_failure("set_all_tags_overwrite", e))?;
        self.tags.send_replace(tags);
        Ok(true)
    }

    async fn merge_remote_entries(&self, remote: &[Entry], policy: ConflictPolicy) -> Result<EntryMerge> {
        let _guard = self.write_lock.lock().await;
        let local: Vec<Entry> = self.entries.borrow().values().flatten().cloned().collect();

        let mut merge = merge_entries(&local, remote, policy);
        if !merge.local_changed {
            return Ok(merge);
        }

        let mut seen = HashSet::new();
        merge.merged.retain(|e| seen.insert(e.id.clone()));
        self.store
            .replace_entries(&merge.merged)
            .await
            .map_err(|e| self.storage_failure("merge_remote_entries", e))?;
        self.entries.send_replace(group_by_date(merge.merged.clone()));

        tracing::info!(
            pulled = merge.pulled,
            conflicts = merge.conflicts,
            "remote entries merged"
        );
        Ok(merge)
    }

    async fn merge_remote_tags(&self, remote: &[Tag]) -> Result<TagMerge> {
        let _guard = self.write_lock.lock().await;
        let local = self.tags.borrow().clone();

        let merge = merge_tags(&local, remote);
        if merge.pulled > 0 {
            self.store
                .replace_tags(&merge.merged)
                .await
                .map_err(|e| self.storage_failure("merge_remote_tags", e))?;
            self.tags.send_replace(merge.merged.clone());
        }
        Ok(merge)
    }

    fn subscribe_entries(&self) -> watch::Receiver<EntriesByDate> {
        self.entries.subscribe()
    }

    fn subscribe_tags(&self) -> watch::Receiver<Vec<Tag>> {
        self.tags.subscribe()
    }

    fn subscribe_profile(&self) -> watch::Receiver<UserProfile> {
        self.profile.subscribe()
    }

    fn export_entries(&self) -> Result<String> {
        let sorted = group_by_date(self.get_all_entries());
        serde_json::to_string_pretty(&sorted).map_err(|e| JournalError::Storage(e.into()))
    }
}

/// Find the bucket and position of an entry. Linear in the entry count.
fn locate(map: &EntriesByDate, id: &str) -> Option<(NaiveDate, usize)> {
    map.iter().find_map(|(date, bucket)| {
        bucket
            .iter()
            .position(|e| e.id == id)
            .map(|index| (*date, index))
    })
}
