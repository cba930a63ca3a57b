//! Journal data model.
//!
//! Field names serialize in camelCase so that the remote document and the
//! preference-store blob share one layout.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of tags the registry holds.
pub const MAX_TAGS: usize = 10;

/// Calendar-date format used for bucket keys.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// A journaled dream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: String,
    pub date: NaiveDate,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub is_lucid: bool,
    #[serde(default)]
    pub is_nightmare: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_path: Option<String>,
}

impl Entry {
    /// The instant this entry last changed: `updatedAt`, or `createdAt` when
    /// it was never edited.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.updated_at.unwrap_or(self.created_at)
    }

    /// Apply a partial update and refresh `updatedAt`.
    ///
    /// `updatedAt` never moves before `createdAt`, even if the local clock
    /// runs behind the clock that created the entry.
    pub(crate) fn apply(&mut self, patch: EntryPatch, date: Option<NaiveDate>, now: DateTime<Utc>) {
        if let Some(date) = date {
            self.date = date;
        }
        if let Some(title) = patch.title {
            self.title = title.trim().to_string();
        }
        if let Some(description) = patch.description {
            self.description = Some(description);
        }
        if let Some(tags) = patch.tags {
            self.tags = tags;
        }
        if let Some(is_lucid) = patch.is_lucid {
            self.is_lucid = is_lucid;
        }
        if let Some(is_nightmare) = patch.is_nightmare {
            self.is_nightmare = is_nightmare;
        }
        if let Some(audio_path) = patch.audio_path {
            self.audio_path = Some(audio_path);
        }
        self.updated_at = Some(now.max(self.created_at));
    }
}

/// Caller-supplied fields for a new entry. `id` and `createdAt` are generated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntry {
    /// Calendar date as `YYYY-MM-DD`.
    pub date: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub is_lucid: bool,
    #[serde(default)]
    pub is_nightmare: bool,
    #[serde(default)]
    pub audio_path: Option<String>,
}

impl NewEntry {
    pub fn new(date: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            date: date.into(),
            title: title.into(),
            ..Default::default()
        }
    }
}

/// Partial update. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPatch {
    /// New calendar date as `YYYY-MM-DD`; moves the entry to another bucket.
    pub date: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
    pub is_lucid: Option<bool>,
    pub is_nightmare: Option<bool>,
    pub audio_path: Option<String>,
}

impl EntryPatch {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Entries grouped by calendar date. A key is never present with an empty list.
pub type EntriesByDate = BTreeMap<NaiveDate, Vec<Entry>>;

/// Group a flat list of entries into date buckets, keeping input order
/// within each bucket.
pub fn group_by_date<I>(entries: I) -> EntriesByDate
where
    I: IntoIterator<Item = Entry>,
{
    let mut map = EntriesByDate::new();
    for entry in entries {
        map.entry(entry.date).or_default().push(entry);
    }
    map
}

/// Flatten buckets into one list, newest `createdAt` first.
pub fn flatten_newest_first(map: &EntriesByDate) -> Vec<Entry> {
    let mut all: Vec<Entry> = map.values().flatten().cloned().collect();
    all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    all
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), DATE_FORMAT).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TagCategory {
    #[default]
    Regular,
    Lucid,
    Nightmare,
}

impl TagCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagCategory::Regular => "regular",
            TagCategory::Lucid => "lucid",
            TagCategory::Nightmare => "nightmare",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "regular" => Some(TagCategory::Regular),
            "lucid" => Some(TagCategory::Lucid),
            "nightmare" => Some(TagCategory::Nightmare),
            _ => None,
        }
    }
}

impl std::fmt::Display for TagCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub category: TagCategory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub name: String,
    pub email: String,
    pub dark_mode: bool,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            name: String::new(),
            email: String::new(),
            dark_mode: true,
        }
    }
}

/// Derived counters, computed on demand and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DreamStatistics {
    pub total_dreams: usize,
    pub good_dreams: usize,
    pub bad_dreams: usize,
    pub lucid_dreams: usize,
    pub streak_days: usize,
}
