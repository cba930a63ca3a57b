//! Chooses the storage backend once per application context.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::OnceCell;

use crate::config::{AppConfig, PlatformSetting};
use crate::notify::Notifier;
use crate::repository::{EntryRepository, JournalRepository};
use crate::store::sqlite::DB_FILE_NAME;
use crate::store::{PreferenceStore, SqliteStore};

const PREFERENCES_DIR: &str = "preferences";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Embedded relational store, one row per record.
    Native,
    /// Key/value preference store, one document per collection.
    Browser,
}

impl Platform {
    pub fn detect() -> Self {
        if cfg!(target_arch = "wasm32") {
            Platform::Browser
        } else {
            Platform::Native
        }
    }

    pub fn from_setting(setting: PlatformSetting) -> Self {
        match setting {
            PlatformSetting::Auto => Self::detect(),
            PlatformSetting::Native => Platform::Native,
            PlatformSetting::Browser => Platform::Browser,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Platform::Native => "native",
            Platform::Browser => "browser",
        }
    }
}

/// Holds the one repository instance of a running application.
///
/// The first call to [`AppContext::repository`] opens the backend chosen at
/// construction; every later call returns that same instance. Tests build a
/// fresh context each to get a fresh repository.
pub struct AppContext {
    platform: Platform,
    data_dir: PathBuf,
    notifier: Arc<dyn Notifier>,
    repository: OnceCell<Arc<dyn EntryRepository>>,
}

impl AppContext {
    pub fn new(platform: Platform, data_dir: impl Into<PathBuf>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            platform,
            data_dir: data_dir.into(),
            notifier,
            repository: OnceCell::new(),
        }
    }

    pub fn from_config(config: &AppConfig, data_dir: impl Into<PathBuf>, notifier: Arc<dyn Notifier>) -> Self {
        Self::new(Platform::from_setting(config.general.platform), data_dir, notifier)
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn notifier(&self) -> Arc<dyn Notifier> {
        self.notifier.clone()
    }

    pub async fn repository(&self) -> Result<Arc<dyn EntryRepository>> {
        let repo = self
            .repository
            .get_or_try_init(|| self.open_repository())
            .await?;
        Ok(repo.clone())
    }

    async fn open_repository(&self) -> Result<Arc<dyn EntryRepository>> {
        tracing::info!(platform = self.platform.as_str(), dir = %self.data_dir.display(), "opening journal");
        let repo: Arc<dyn EntryRepository> = match self.platform {
            Platform::Native => {
                std::fs::create_dir_all(&self.data_dir)
                    .with_context(|| format!("Failed to create {}", self.data_dir.display()))?;
                let store = SqliteStore::open_at(self.data_dir.join(DB_FILE_NAME))
                    .context("Failed to open the journal database")?;
                Arc::new(JournalRepository::open(store, self.notifier.clone()).await)
            }
            Platform::Browser => {
                let store = PreferenceStore::open_at(self.data_dir.join(PREFERENCES_DIR))
                    .context("Failed to open the preference store")?;
                Arc::new(JournalRepository::open(store, self.notifier.clone()).await)
            }
        };
        Ok(repo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NewEntry;
    use crate::notify::RecordingNotifier;

    #[test]
    fn explicit_settings_override_detection() {
        assert_eq!(Platform::from_setting(PlatformSetting::Browser), Platform::Browser);
        assert_eq!(Platform::from_setting(PlatformSetting::Native), Platform::Native);
        assert_eq!(Platform::from_setting(PlatformSetting::Auto), Platform::Native);
    }

    #[tokio::test]
    async fn repository_is_memoized_per_context() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = AppContext::new(Platform::Browser, dir.path(), Arc::new(RecordingNotifier::new()));

        let first = ctx.repository().await.unwrap();
        let second = ctx.repository().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        first.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();
        assert_eq!(second.get_all_entries().len(), 1);
    }

    #[tokio::test]
    async fn fresh_context_gets_fresh_instance() {
        let a = tempfile::tempdir().unwrap();
        let b = tempfile::tempdir().unwrap();
        let notifier: Arc<dyn Notifier> = Arc::new(RecordingNotifier::new());

        let one = AppContext::new(Platform::Native, a.path(), notifier.clone());
        let two = AppContext::new(Platform::Native, b.path(), notifier);
        let repo_one = one.repository().await.unwrap();
        let repo_two = two.repository().await.unwrap();

        repo_one.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();
        assert!(!Arc::ptr_eq(&repo_one, &repo_two));
        assert!(repo_two.get_all_entries().is_empty());
        assert!(a.path().join("dreams.db").exists());
    }
}
