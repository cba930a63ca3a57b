//! Local-first dream journal core: entry repository over two storage
//! backends, an obfuscated remote backup, and a periodic sync coordinator.

pub mod config;
pub mod crypto;
pub mod error;
pub mod logger;
pub mod model;
pub mod notify;
pub mod remote;
pub mod repository;
pub mod selector;
pub mod stats;
pub mod store;
pub mod sync;

pub use error::{JournalError, Result, ValidationError};
pub use model::{DreamStatistics, EntriesByDate, Entry, EntryPatch, NewEntry, Tag, TagCategory, UserProfile};
pub use repository::{EntryRepository, JournalRepository};
pub use selector::{AppContext, Platform};
pub use sync::{ConflictPolicy, SyncCoordinator, SyncOutcome, SyncReport, SyncStatus};
