//! Non-fatal, user-facing notifications (toasts in a UI, stderr in the CLI).

use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

pub trait Notifier: Send + Sync {
    fn notify(&self, level: NoticeLevel, message: &str);
}

/// Routes notices into the log only.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        match level {
            NoticeLevel::Info => tracing::info!(notice = message),
            NoticeLevel::Warning => tracing::warn!(notice = message),
            NoticeLevel::Error => tracing::error!(notice = message),
        }
    }
}

/// Keeps every notice in memory. Useful for tests and for UIs that drain
/// notices on their own schedule.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<(NoticeLevel, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(NoticeLevel, String)> {
        match self.notices.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(_) => Vec::new(),
        }
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, level: NoticeLevel, message: &str) {
        if let Ok(mut guard) = self.notices.lock() {
            guard.push((level, message.to_string()));
        }
    }
}
