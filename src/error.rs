use thiserror::Error;

use crate::model::MAX_TAGS;

/// Input rejected before any state changed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Title must not be empty")]
    EmptyTitle,

    #[error("Invalid date: {0:?} (expected YYYY-MM-DD)")]
    InvalidDate(String),

    #[error("Max number of tags reached ({MAX_TAGS})")]
    TagLimitReached,

    #[error("Tag already exists: {0}")]
    DuplicateTag(String),

    #[error("Tag name must not be empty")]
    EmptyTagName,
}

/// Errors returned by the journal repository.
///
/// None of these are fatal to the process; callers log them and carry on
/// with state unchanged.
#[derive(Error, Debug)]
pub enum JournalError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The local durable store failed.
    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),
}

impl JournalError {
    pub fn is_validation(&self) -> bool {
        matches!(self, JournalError::Validation(_))
    }
}

pub type Result<T> = std::result::Result<T, JournalError>;
