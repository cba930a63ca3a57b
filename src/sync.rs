//! Periodic reconciliation between the local journal and the remote backup.
//!
//! One pass: read both snapshots, resolve entries that changed on both sides
//! according to [`ConflictPolicy`], pull remote-only entries, push local-only
//! ones. Tags are unioned by name. Nothing about a pass is persisted, so a
//! failed pass is simply redone from scratch on the next tick.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::model::{Entry, Tag, MAX_TAGS};
use crate::remote::RemoteBackup;
use crate::repository::EntryRepository;

/// What happens to an entry edited both locally and remotely since the last pass.
#[derive(Debug, Serialize, Deserialize, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// The remote copy replaces the local one.
    #[default]
    RemoteWins,
    /// The copy with the later modification time wins.
    LastWriterWins,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Idle,
    Syncing,
    Synced,
    Offline,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &str {
        match self {
            SyncStatus::Idle => "Idle",
            SyncStatus::Syncing => "Syncing...",
            SyncStatus::Synced => "Synced",
            SyncStatus::Offline => "Offline",
            SyncStatus::Error => "Error",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Remote-only entries copied to the local journal.
    pub pulled: usize,
    /// Local-only entries copied to the remote backup.
    pub pushed: usize,
    /// Entries that differed on both sides.
    pub conflicts: usize,
    pub tags_pulled: usize,
    pub tags_pushed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Completed(SyncReport),
    /// Another pass was already running.
    AlreadySyncing,
    /// No signed-in user, or offline mode is on.
    Offline,
    Failed(String),
}

/// Result of merging two entry lists. `merged` keeps local order, with
/// remote-only entries appended.
#[derive(Debug, Clone, Default)]
pub struct EntryMerge {
    pub merged: Vec<Entry>,
    pub pulled: usize,
    pub pushed: usize,
    pub conflicts: usize,
    pub local_changed: bool,
    pub remote_changed: bool,
}

pub fn merge_entries(local: &[Entry], remote: &[Entry], policy: ConflictPolicy) -> EntryMerge {
    let remote_by_id: HashMap<&str, &Entry> = remote.iter().map(|e| (e.id.as_str(), e)).collect();
    let local_ids: HashSet<&str> = local.iter().map(|e| e.id.as_str()).collect();
    let mut out = EntryMerge::default();

    for entry in local {
        let Some(theirs) = remote_by_id.get(entry.id.as_str()) else {
            out.pushed += 1;
            out.remote_changed = true;
            out.merged.push(entry.clone());
            continue;
        };

        if entry.last_modified() == theirs.last_modified() {
            out.merged.push(entry.clone());
            continue;
        }

        out.conflicts += 1;
        let remote_wins = match policy {
            ConflictPolicy::RemoteWins => true,
            ConflictPolicy::LastWriterWins => theirs.last_modified() > entry.last_modified(),
        };
        if remote_wins {
            if entry.last_modified() > theirs.last_modified() {
                tracing::warn!(
                    id = %entry.id,
                    local_modified = %entry.last_modified(),
                    remote_modified = %theirs.last_modified(),
                    discarded_title = %entry.title,
                    "newer local edit overwritten by remote copy"
                );
            } else {
                tracing::info!(id = %entry.id, "local entry replaced by newer remote copy");
            }
            out.local_changed = true;
            out.merged.push((*theirs).clone());
        } else {
            tracing::warn!(
                id = %entry.id,
                local_modified = %entry.last_modified(),
                remote_modified = %theirs.last_modified(),
                "remote copy overwritten by newer local edit"
            );
            out.remote_changed = true;
            out.merged.push(entry.clone());
        }
    }

    for entry in remote {
        if !local_ids.contains(entry.id.as_str()) {
            out.pulled += 1;
            out.local_changed = true;
            out.merged.push(entry.clone());
        }
    }

    out
}

/// Result of a tag union.
#[derive(Debug, Clone, Default)]
pub struct TagMerge {
    pub merged: Vec<Tag>,
    /// Remote-only tags added locally.
    pub pulled: usize,
    /// Local tags the remote does not have.
    pub pushed: usize,
}

/// Union by name, local first. Remote-only tags are appended while the
/// registry has room.
pub fn merge_tags(local: &[Tag], remote: &[Tag]) -> TagMerge {
    let mut merged: Vec<Tag> = local.to_vec();
    let mut names: HashSet<String> = local.iter().map(|t| t.name.clone()).collect();
    let mut pulled = 0;

    for tag in remote {
        if merged.len() >= MAX_TAGS {
            break;
        }
        if names.insert(tag.name.clone()) {
            merged.push(tag.clone());
            pulled += 1;
        }
    }

    let remote_names: HashSet<&str> = remote.iter().map(|t| t.name.as_str()).collect();
    let pushed = local
        .iter()
        .filter(|t| !remote_names.contains(t.name.as_str()))
        .count();

    TagMerge {
        merged,
        pulled,
        pushed,
    }
}

pub struct SyncCoordinator {
    repo: Arc<dyn EntryRepository>,
    remote: Arc<RemoteBackup>,
    policy: ConflictPolicy,
    offline: bool,
    in_flight: AtomicBool,
    status: watch::Sender<SyncStatus>,
    last_sync: watch::Sender<Option<DateTime<Utc>>>,
}

impl SyncCoordinator {
    pub fn new(repo: Arc<dyn EntryRepository>, remote: Arc<RemoteBackup>) -> Self {
        Self {
            repo,
            remote,
            policy: ConflictPolicy::default(),
            offline: false,
            in_flight: AtomicBool::new(false),
            status: watch::Sender::new(SyncStatus::Idle),
            last_sync: watch::Sender::new(None),
        }
    }

    pub fn with_policy(mut self, policy: ConflictPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    pub fn status(&self) -> SyncStatus {
        *self.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.subscribe()
    }

    pub fn last_sync(&self) -> Option<DateTime<Utc>> {
        *self.last_sync.borrow()
    }

    pub fn is_syncing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Run one pass now unless one is already running.
    pub async fn force_sync(&self) -> SyncOutcome {
        if self.offline || !self.remote.is_authenticated() {
            tracing::debug!(offline_mode = self.offline, "sync skipped: offline");
            self.status.send_replace(SyncStatus::Offline);
            return SyncOutcome::Offline;
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("sync already in flight, skipping");
            return SyncOutcome::AlreadySyncing;
        }

        self.status.send_replace(SyncStatus::Syncing);
        let outcome = match self.sync_once().await {
            Ok(report) => {
                tracing::info!(
                    pulled = report.pulled,
                    pushed = report.pushed,
                    conflicts = report.conflicts,
                    tags_pulled = report.tags_pulled,
                    tags_pushed = report.tags_pushed,
                    "sync finished"
                );
                self.last_sync.send_replace(Some(Utc::now()));
                self.status.send_replace(SyncStatus::Synced);
                SyncOutcome::Completed(report)
            }
            Err(e) => {
                tracing::error!(error = %format!("{e:#}"), "sync failed");
                self.status.send_replace(SyncStatus::Error);
                SyncOutcome::Failed(format!("{e:#}"))
            }
        };
        self.in_flight.store(false, Ordering::SeqCst);
        outcome
    }

    async fn sync_once(&self) -> Result<SyncReport> {
        let remote = self
            .remote
            .fetch_snapshot()
            .await
            .context("Fetching remote snapshot failed")?;
        // The local half runs inside the repository's write lock so that a
        // concurrent add or edit is merged, never overwritten.
        let entries = self
            .repo
            .merge_remote_entries(&remote.entries, self.policy)
            .await
            .context("Applying remote entries locally failed")?;
        if entries.remote_changed {
            self.remote
                .save_all_entries(&entries.merged)
                .await
                .context("Pushing entries failed")?;
        }

        let tags = self
            .repo
            .merge_remote_tags(&remote.tags)
            .await
            .context("Applying remote tags locally failed")?;
        if tags.pushed > 0 {
            self.remote
                .save_all_tags(&tags.merged)
                .await
                .context("Pushing tags failed")?;
        }

        Ok(SyncReport {
            pulled: entries.pulled,
            pushed: entries.pushed,
            conflicts: entries.conflicts,
            tags_pulled: tags.pulled,
            tags_pushed: tags.pushed,
        })
    }

    /// Start the periodic loop. The first pass runs immediately.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> SyncHandle {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(interval, trigger_rx, shutdown_rx));
        SyncHandle {
            trigger: trigger_tx,
            shutdown: shutdown_tx,
            join,
        }
    }

    async fn run(
        self: Arc<Self>,
        interval: Duration,
        mut trigger_rx: mpsc::Receiver<()>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!(interval_secs = interval.as_secs(), "sync loop started");
        let mut ticker = time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.force_sync().await;
                }
                msg = trigger_rx.recv() => {
                    if msg.is_none() {
                        break;
                    }
                    tracing::debug!("manual sync trigger received");
                    self.force_sync().await;
                }
                _ = shutdown_rx.changed() => break,
            }
        }

        self.status.send_replace(SyncStatus::Idle);
        tracing::info!("sync loop stopped");
    }
}

/// Control handle for a spawned sync loop.
pub struct SyncHandle {
    trigger: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl SyncHandle {
    /// Ask for a pass as soon as the loop is free. Coalesces with a pending request.
    pub fn trigger(&self) {
        let _ = self.trigger.try_send(());
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.join.await {
            tracing::error!(error = %e, "sync loop panicked");
        }
    }
}
