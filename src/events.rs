// ABOUTME: Notifications published on job state transitions
// ABOUTME: Consumers subscribe to a broadcast channel instead of polling job state

use std::fmt;
use tokio::sync::broadcast;

use crate::backfill::BackfillKind;

const NOTIFICATION_CHANNEL_CAPACITY: usize = 128;

/// Which job a notification belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSource {
    Backfill(BackfillKind),
    Reindex,
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            JobSource::Backfill(kind) => write!(f, "{}", kind),
            JobSource::Reindex => write!(f, "full reindex"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub source: JobSource,
    pub level: Level,
    pub title: String,
    pub message: String,
}

/// Fan-out of notifications to any number of subscribers.
#[derive(Debug, Clone)]
pub struct Notifier {
    tx: broadcast::Sender<Notification>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(NOTIFICATION_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }

    pub fn notify(
        &self,
        source: JobSource,
        level: Level,
        title: impl Into<String>,
        message: impl Into<String>,
    ) {
        // No subscribers is fine; notifications are advisory.
        let _ = self.tx.send(Notification {
            source,
            level,
            title: title.into(),
            message: message.into(),
        });
    }

    pub fn info(&self, source: JobSource, title: impl Into<String>, message: impl Into<String>) {
        self.notify(source, Level::Info, title, message);
    }

    pub fn success(&self, source: JobSource, title: impl Into<String>, message: impl Into<String>) {
        self.notify(source, Level::Success, title, message);
    }

    pub fn warning(&self, source: JobSource, title: impl Into<String>, message: impl Into<String>) {
        self.notify(source, Level::Warning, title, message);
    }

    pub fn error(&self, source: JobSource, title: impl Into<String>, message: impl Into<String>) {
        self.notify(source, Level::Error, title, message);
    }
}
