//! User-facing failure notifications.
//!
//! The sync layer never raises subscription or mutation failures to the
//! caller that caused them. It formats them as a [`Failure`] and hands them
//! to an [`ErrorSurface`], which decides how to present them (a toast, a
//! log line, a test recorder).

use crate::types::{ErrorInfo, MutationOperation, QueryRef};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Severity of a notice.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Error,
    Info,
}

/// A notification as delivered to an [`ErrorSurface`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub title: String,
    pub message: String,
}

/// Presents failures to the user.
pub trait ErrorSurface: Send + Sync {
    fn notify(&self, level: NoticeLevel, title: &str, message: &str);
}

impl<F> ErrorSurface for F
where
    F: Fn(NoticeLevel, &str, &str) + Send + Sync,
{
    fn notify(&self, level: NoticeLevel, title: &str, message: &str) {
        self(level, title, message)
    }
}

/// A failure observed by the sync layer.
#[derive(Clone, Debug, PartialEq)]
pub enum Failure {
    /// An operation was attempted before a store handle was installed.
    StoreUnavailable { operation: String },

    /// A live channel reported an error.
    Subscription { query: QueryRef, cause: ErrorInfo },

    /// A submitted write failed.
    Mutation {
        operation: MutationOperation,
        target: String,
        cause: ErrorInfo,
    },
}

impl Failure {
    pub fn title(&self) -> String {
        match self {
            Failure::StoreUnavailable { .. } => "Store unavailable".to_string(),
            Failure::Subscription { .. } => "Live data unavailable".to_string(),
            Failure::Mutation { operation, .. } => {
                let op = operation.to_string();
                let mut chars = op.chars();
                match chars.next() {
                    Some(first) => format!("{}{} failed", first.to_uppercase(), chars.as_str()),
                    None => "Write failed".to_string(),
                }
            }
        }
    }

    pub fn message(&self) -> String {
        match self {
            Failure::StoreUnavailable { operation } => format!(
                "Could not {}: the store is not available yet. Please try again later.",
                operation
            ),
            Failure::Subscription { query, cause } => {
                format!("Could not load {}: {}", query, cause)
            }
            Failure::Mutation {
                operation,
                target,
                cause,
            } => format!("Could not {} {}: {}", operation, target, cause),
        }
    }

    /// Hand the failure to `surface` as an error notice.
    pub fn report(&self, surface: &dyn ErrorSurface) {
        surface.notify(NoticeLevel::Error, &self.title(), &self.message());
    }
}

/// Surface that writes notices to the `tracing` log.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSurface;

impl ErrorSurface for TracingSurface {
    fn notify(&self, level: NoticeLevel, title: &str, message: &str) {
        match level {
            NoticeLevel::Error => tracing::error!(title, message, "sync failure"),
            NoticeLevel::Info => tracing::info!(title, message, "sync notice"),
        }
    }
}

/// Surface that keeps every notice in memory.
#[derive(Default)]
pub struct RecordingSurface {
    notices: Mutex<Vec<Notice>>,
    arrived: Condvar,
}

impl RecordingSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.notices.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.notices.lock().clear();
    }

    /// Block until at least `count` notices were recorded or `timeout`
    /// elapses. Returns whether the count was reached.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut notices = self.notices.lock();
        while notices.len() < count {
            if self.arrived.wait_until(&mut notices, deadline).timed_out() {
                return notices.len() >= count;
            }
        }
        true
    }
}

impl ErrorSurface for RecordingSurface {
    fn notify(&self, level: NoticeLevel, title: &str, message: &str) {
        self.notices.lock().push(Notice {
            level,
            title: title.to_string(),
            message: message.to_string(),
        });
        self.arrived.notify_all();
    }
}
