//! Preference/blob store: one JSON document per collection.
//!
//! Each key lives in its own `<key>.json` file under the store directory and
//! is replaced atomically (write to a temp file, then rename). Every change
//! rewrites the whole collection.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::fs;

use super::{EntryStore, EntryWrite, TagWrite};
use crate::model::{group_by_date, EntriesByDate, Entry, Tag, UserProfile};

const DREAMS_KEY: &str = "dreams";
const TAGS_KEY: &str = "tags";
const USER_PROFILE_KEY: &str = "user_profile";

#[derive(Debug, Clone)]
pub struct PreferenceStore {
    dir: PathBuf,
}

impl PreferenceStore {
    pub fn open_at(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create preference dir {}", dir.display()))?;
        tracing::info!(dir = %dir.display(), "opening preference store");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        match fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("Failed to read preference {key}")),
        }
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<()> {
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{key}.json.tmp"));
        fs::write(&tmp, value)
            .await
            .with_context(|| format!("Failed to write preference {key}"))?;
        fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to commit preference {key}"))?;
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove preference {key}")),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key).await? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .with_context(|| format!("Preference {key} is not valid JSON"))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + ?Sized + Sync>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set(key, &raw).await
    }
}

#[async_trait]
impl EntryStore for PreferenceStore {
    async fn load_entries(&self) -> Result<Vec<Entry>> {
        let map: EntriesByDate = self.get_json(DREAMS_KEY).await?.unwrap_or_default();
        Ok(map.into_values().flatten().collect())
    }

    async fn write_entry(&self, _change: EntryWrite, after: &EntriesByDate) -> Result<()> {
        self.set_json(DREAMS_KEY, after).await
    }

    async fn replace_entries(&self, entries: &[Entry]) -> Result<()> {
        let map = group_by_date(entries.iter().cloned());
        self.set_json(DREAMS_KEY, &map).await
    }

    async fn load_tags(&self) -> Result<Vec<Tag>> {
        Ok(self.get_json(TAGS_KEY).await?.unwrap_or_default())
    }

    async fn write_tag(&self, _change: TagWrite, after: &[Tag]) -> Result<()> {
        self.set_json(TAGS_KEY, after).await
    }

    async fn replace_tags(&self, tags: &[Tag]) -> Result<()> {
        self.set_json(TAGS_KEY, tags).await
    }

    async fn load_profile(&self) -> Result<Option<UserProfile>> {
        self.get_json(USER_PROFILE_KEY).await
    }

    async fn save_profile(&self, profile: &UserProfile) -> Result<()> {
        self.set_json(USER_PROFILE_KEY, profile).await
    }

    async fn clear_all(&self) -> Result<()> {
        self.remove(DREAMS_KEY).await?;
        self.remove(TAGS_KEY).await?;
        self.remove(USER_PROFILE_KEY).await
    }
}
