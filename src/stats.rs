use std::collections::HashMap;

use chrono::{Duration, NaiveDate};

use crate::model::{DreamStatistics, EntriesByDate, Entry, Tag, TagCategory};

/// Counters over the current entries. Good and bad dreams are those carrying
/// a tag whose registry category is regular or nightmare; the nightmare flag
/// also counts as bad. Tags missing from the registry are ignored.
pub fn compute(entries: &EntriesByDate, registry: &[Tag], today: NaiveDate) -> DreamStatistics {
    let categories: HashMap<&str, TagCategory> = registry
        .iter()
        .map(|t| (t.name.as_str(), t.category))
        .collect();
    let has_category = |entry: &Entry, wanted: TagCategory| {
        entry
            .tags
            .iter()
            .any(|name| categories.get(name.as_str()) == Some(&wanted))
    };

    let mut stats = DreamStatistics::default();
    for entry in entries.values().flatten() {
        stats.total_dreams += 1;
        if has_category(entry, TagCategory::Regular) {
            stats.good_dreams += 1;
        }
        if entry.is_nightmare || has_category(entry, TagCategory::Nightmare) {
            stats.bad_dreams += 1;
        }
        if entry.is_lucid {
            stats.lucid_dreams += 1;
        }
    }
    stats.streak_days = streak_days(entries, today);
    stats
}

/// Consecutive days with at least one entry, counted back from `today`.
///
/// Dates are walked newest first and each must equal `today` minus the count
/// so far, so a run that ends yesterday counts 0, as does a future-dated
/// newest entry. A newest entry two or more days old is 0 as well.
pub fn streak_days(entries: &EntriesByDate, today: NaiveDate) -> usize {
    // BTreeMap keys are ascending; walk them newest first.
    let dates: Vec<NaiveDate> = entries
        .iter()
        .filter(|(_, bucket)| !bucket.is_empty())
        .map(|(date, _)| *date)
        .rev()
        .collect();

    let Some(latest) = dates.first() else {
        return 0;
    };
    if (today - *latest).num_days() > 1 {
        return 0;
    }

    let mut streak = 0;
    for date in dates {
        if date == today - Duration::days(streak as i64) {
            streak += 1;
        } else {
            break;
        }
    }
    streak
}
