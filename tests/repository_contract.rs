//! Behavior every storage backend must share, run against each one.

use std::path::Path;
use std::sync::Arc;

use dreamlog::model::{parse_date, MAX_TAGS};
use dreamlog::notify::{NoticeLevel, RecordingNotifier};
use dreamlog::store::{PreferenceStore, SqliteStore};
use dreamlog::{
    Entry, EntryPatch, EntryRepository, JournalError, JournalRepository, NewEntry, TagCategory,
    UserProfile, ValidationError,
};
use tempfile::TempDir;

#[derive(Clone, Copy)]
enum Backend {
    Sqlite,
    Prefs,
}

async fn open(backend: Backend, dir: &Path, notifier: Arc<RecordingNotifier>) -> Arc<dyn EntryRepository> {
    match backend {
        Backend::Sqlite => {
            let store = SqliteStore::open_at(dir.join("dreams.db")).unwrap();
            Arc::new(JournalRepository::open(store, notifier).await)
        }
        Backend::Prefs => {
            let store = PreferenceStore::open_at(dir.join("preferences")).unwrap();
            Arc::new(JournalRepository::open(store, notifier).await)
        }
    }
}

struct Harness {
    backend: Backend,
    dir: TempDir,
    notifier: Arc<RecordingNotifier>,
    repo: Arc<dyn EntryRepository>,
}

impl Harness {
    async fn new(backend: Backend) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let notifier = Arc::new(RecordingNotifier::new());
        let repo = open(backend, dir.path(), notifier.clone()).await;
        Self {
            backend,
            dir,
            notifier,
            repo,
        }
    }

    /// A second repository over the same durable state, as after a restart.
    async fn reopen(&self) -> Arc<dyn EntryRepository> {
        open(self.backend, self.dir.path(), Arc::new(RecordingNotifier::new())).await
    }
}

fn ids(entries: &[Entry]) -> Vec<String> {
    let mut ids: Vec<String> = entries.iter().map(|e| e.id.clone()).collect();
    ids.sort();
    ids
}

async fn add_entry_lands_in_its_date_bucket(backend: Backend) {
    let h = Harness::new(backend).await;
    let date = parse_date("2024-03-10").unwrap();

    let entry = h
        .repo
        .add_entry(NewEntry::new("2024-03-10", "Flying"))
        .await
        .unwrap();

    assert!(!entry.id.is_empty());
    assert_eq!(entry.title, "Flying");
    assert!(entry.updated_at.is_none());
    assert!(h.repo.has_entries(date));
    assert_eq!(h.repo.get_entries_by_date(date), vec![entry.clone()]);
    assert_eq!(h.repo.get_entry_by_id(&entry.id), Some(entry));
}

async fn same_date_keeps_insertion_order(backend: Backend) {
    let h = Harness::new(backend).await;
    let first = h.repo.add_entry(NewEntry::new("2024-03-10", "First")).await.unwrap();
    let second = h.repo.add_entry(NewEntry::new("2024-03-10", "Second")).await.unwrap();

    let bucket = h.repo.get_entries_by_date(parse_date("2024-03-10").unwrap());
    assert_eq!(bucket.len(), 2);
    assert_eq!(bucket[0].id, first.id);
    assert_eq!(bucket[1].id, second.id);

    let all = h.repo.get_all_entries();
    assert_eq!(all[0].id, second.id, "newest first");
}

async fn ids_are_unique_across_dates(backend: Backend) {
    let h = Harness::new(backend).await;
    for day in 1..=5 {
        h.repo
            .add_entry(NewEntry::new(format!("2024-03-{day:02}"), "Dream"))
            .await
            .unwrap();
    }
    let all = h.repo.get_all_entries();
    let mut unique = ids(&all);
    unique.dedup();
    assert_eq!(unique.len(), 5);
}

async fn invalid_input_changes_nothing(backend: Backend) {
    let h = Harness::new(backend).await;
    let before = h.repo.snapshot();

    let err = h.repo.add_entry(NewEntry::new("2024-03-10", "  ")).await.unwrap_err();
    assert!(matches!(err, JournalError::Validation(ValidationError::EmptyTitle)));
    let err = h.repo.add_entry(NewEntry::new("2024-13-40", "Flying")).await.unwrap_err();
    assert!(err.is_validation());

    assert_eq!(h.repo.snapshot(), before);
    assert_eq!(h.notifier.take().len(), 2);
}

async fn update_edits_fields_and_stamps_time(backend: Backend) {
    let h = Harness::new(backend).await;
    let entry = h.repo.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();

    let updated = h
        .repo
        .update_entry(
            &entry.id,
            EntryPatch {
                title: Some("Flying high".into()),
                is_lucid: Some(true),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .unwrap();

    assert_eq!(updated.id, entry.id);
    assert_eq!(updated.title, "Flying high");
    assert!(updated.is_lucid);
    assert_eq!(updated.created_at, entry.created_at);
    assert!(updated.updated_at.unwrap() >= updated.created_at);
    assert_eq!(h.repo.get_entry_by_id(&entry.id), Some(updated));
}

async fn update_of_unknown_id_is_a_no_op(backend: Backend) {
    let h = Harness::new(backend).await;
    h.repo.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();
    let before = h.repo.snapshot();

    let result = h
        .repo
        .update_entry(
            "no-such-id",
            EntryPatch {
                title: Some("Ghost".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert!(result.is_none());
    assert_eq!(h.repo.snapshot(), before);
}

async fn deleting_the_last_entry_removes_the_date(backend: Backend) {
    let h = Harness::new(backend).await;
    let date = parse_date("2024-03-10").unwrap();
    let entry = h.repo.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();

    assert!(h.repo.delete_entry(&entry.id).await.unwrap());
    assert!(!h.repo.has_entries(date));
    assert!(!h.repo.snapshot().contains_key(&date));
    assert!(!h.repo.delete_entry(&entry.id).await.unwrap());

    let reopened = h.reopen().await;
    assert!(reopened.get_all_entries().is_empty());
}

async fn tag_registry_caps_and_rejects_duplicates(backend: Backend) {
    let h = Harness::new(backend).await;
    for i in 0..MAX_TAGS {
        h.repo.add_tag(&format!("tag{i}"), TagCategory::Regular).await.unwrap();
    }

    let err = h.repo.add_tag("one too many", TagCategory::Lucid).await.unwrap_err();
    assert!(matches!(err, JournalError::Validation(ValidationError::TagLimitReached)));
    assert_eq!(h.repo.get_all_tags().len(), MAX_TAGS);

    assert!(h.repo.delete_tag("tag0").await.unwrap());
    let err = h.repo.add_tag("tag1", TagCategory::Nightmare).await.unwrap_err();
    assert!(matches!(err, JournalError::Validation(ValidationError::DuplicateTag(_))));
    assert_eq!(h.repo.get_all_tags().len(), MAX_TAGS - 1);

    let notices = h.notifier.take();
    assert_eq!(notices.len(), 2);
    assert!(notices.iter().all(|(level, _)| *level == NoticeLevel::Error));
}

async fn state_survives_a_restart(backend: Backend) {
    let h = Harness::new(backend).await;
    h.repo.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();
    h.repo.add_entry(NewEntry::new("2024-03-11", "Falling")).await.unwrap();
    h.repo.add_tag("Flying", TagCategory::Lucid).await.unwrap();
    let profile = UserProfile {
        name: "Ada".into(),
        email: "ada@example.com".into(),
        dark_mode: false,
    };
    h.repo.update_user_profile(profile.clone()).await.unwrap();

    let reopened = h.reopen().await;
    assert_eq!(ids(&reopened.get_all_entries()), ids(&h.repo.get_all_entries()));
    assert_eq!(reopened.get_all_tags(), h.repo.get_all_tags());
    assert_eq!(reopened.user_profile(), profile);
}

async fn overwrite_keeps_ids_and_ignores_empty_input(backend: Backend) {
    let h = Harness::new(backend).await;
    let kept = h.repo.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();
    h.repo.add_tag("Flying", TagCategory::Regular).await.unwrap();

    assert!(!h.repo.set_all_entries_overwrite(Vec::new()).await.unwrap());
    assert!(!h.repo.set_all_tags_overwrite(Vec::new()).await.unwrap());
    assert_eq!(h.repo.get_all_entries(), vec![kept.clone()]);
    assert_eq!(h.repo.get_all_tags().len(), 1);

    let mut incoming = kept.clone();
    incoming.id = "remote-id".into();
    incoming.title = "From elsewhere".into();
    incoming.date = parse_date("2024-02-01").unwrap();
    assert!(h
        .repo
        .set_all_entries_overwrite(vec![incoming.clone(), incoming.clone()])
        .await
        .unwrap());

    assert_eq!(h.repo.get_all_entries(), vec![incoming.clone()]);
    let reopened = h.reopen().await;
    assert_eq!(reopened.get_entry_by_id("remote-id"), Some(incoming));
}

async fn clear_all_resets_everything(backend: Backend) {
    let h = Harness::new(backend).await;
    h.repo.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();
    h.repo.add_tag("Flying", TagCategory::Regular).await.unwrap();
    h.repo
        .update_user_profile(UserProfile {
            name: "Ada".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut entries_rx = h.repo.subscribe_entries();
    entries_rx.borrow_and_update();

    h.repo.clear_all_data().await.unwrap();

    assert!(h.repo.snapshot().is_empty());
    assert!(h.repo.get_all_tags().is_empty());
    assert_eq!(h.repo.user_profile(), UserProfile::default());
    assert!(entries_rx.has_changed().unwrap());
    assert!(entries_rx.borrow_and_update().is_empty());
    assert_eq!(
        h.notifier.take(),
        vec![(NoticeLevel::Info, "All data cleared successfully.".to_string())]
    );

    let reopened = h.reopen().await;
    assert!(reopened.get_all_entries().is_empty());
    assert!(reopened.get_all_tags().is_empty());
    assert_eq!(reopened.user_profile(), UserProfile::default());
}

async fn statistics_reflect_entries(backend: Backend) {
    let h = Harness::new(backend).await;
    h.repo.add_tag("Calm", TagCategory::Regular).await.unwrap();
    h.repo
        .add_entry(NewEntry {
            is_nightmare: true,
            ..NewEntry::new("2020-01-01", "Chased")
        })
        .await
        .unwrap();
    h.repo
        .add_entry(NewEntry {
            is_lucid: true,
            tags: vec!["Calm".into()],
            ..NewEntry::new("2020-01-02", "Flying")
        })
        .await
        .unwrap();

    let stats = h.repo.get_dream_statistics();
    assert_eq!(stats.total_dreams, 2);
    assert_eq!(stats.bad_dreams, 1);
    assert_eq!(stats.good_dreams, 1);
    assert_eq!(stats.lucid_dreams, 1);
    assert_eq!(stats.streak_days, 0, "last dream is years old");
}

async fn export_groups_by_date(backend: Backend) {
    let h = Harness::new(backend).await;
    h.repo.add_entry(NewEntry::new("2024-03-10", "Flying")).await.unwrap();

    let exported: serde_json::Value = serde_json::from_str(&h.repo.export_entries().unwrap()).unwrap();
    assert_eq!(exported["2024-03-10"][0]["title"], "Flying");
}

macro_rules! contract_suite {
    ($module:ident, $backend:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn add_entry_lands_in_its_date_bucket() {
                super::add_entry_lands_in_its_date_bucket($backend).await;
            }

            #[tokio::test]
            async fn same_date_keeps_insertion_order() {
                super::same_date_keeps_insertion_order($backend).await;
            }

            #[tokio::test]
            async fn ids_are_unique_across_dates() {
                super::ids_are_unique_across_dates($backend).await;
            }

            #[tokio::test]
            async fn invalid_input_changes_nothing() {
                super::invalid_input_changes_nothing($backend).await;
            }

            #[tokio::test]
            async fn update_edits_fields_and_stamps_time() {
                super::update_edits_fields_and_stamps_time($backend).await;
            }

            #[tokio::test]
            async fn update_of_unknown_id_is_a_no_op() {
                super::update_of_unknown_id_is_a_no_op($backend).await;
            }

            #[tokio::test]
            async fn deleting_the_last_entry_removes_the_date() {
                super::deleting_the_last_entry_removes_the_date($backend).await;
            }

            #[tokio::test]
            async fn tag_registry_caps_and_rejects_duplicates() {
                super::tag_registry_caps_and_rejects_duplicates($backend).await;
            }

            #[tokio::test]
            async fn state_survives_a_restart() {
                super::state_survives_a_restart($backend).await;
            }

            #[tokio::test]
            async fn overwrite_keeps_ids_and_ignores_empty_input() {
                super::overwrite_keeps_ids_and_ignores_empty_input($backend).await;
            }

            #[tokio::test]
            async fn clear_all_resets_everything() {
                super::clear_all_resets_everything($backend).await;
            }

            #[tokio::test]
            async fn statistics_reflect_entries() {
                super::statistics_reflect_entries($backend).await;
            }

            #[tokio::test]
            async fn export_groups_by_date() {
                super::export_groups_by_date($backend).await;
            }
        }
    };
}

contract_suite!(sqlite, Backend::Sqlite);
contract_suite!(preferences, Backend::Prefs);
