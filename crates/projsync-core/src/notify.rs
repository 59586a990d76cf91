//! Observer hook for user-facing notices. Nothing in the engine depends on a
//! sink being present.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use projsync_events::Bus;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    pub level: NoticeLevel,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub time: DateTime<Utc>,
}

impl Notice {
    pub fn new(level: NoticeLevel, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            level,
            code: code.into(),
            message: message.into(),
            parent_id: None,
            time: Utc::now(),
        }
    }

    pub fn info(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Info, code, message)
    }

    pub fn warning(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Warning, code, message)
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(NoticeLevel::Error, code, message)
    }

    pub fn scoped(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

pub trait NotificationSink: Send + Sync {
    fn notify(&self, notice: Notice);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopSink;

impl NotificationSink for NoopSink {
    fn notify(&self, _notice: Notice) {}
}

/// Writes notices to the log under the `projsync::notice` target.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn notify(&self, notice: Notice) {
        let parent_id = notice.parent_id.as_deref().unwrap_or("-");
        match notice.level {
            NoticeLevel::Info => info!(
                target: "projsync::notice",
                code = %notice.code,
                parent_id,
                "{}",
                notice.message
            ),
            NoticeLevel::Warning => warn!(
                target: "projsync::notice",
                code = %notice.code,
                parent_id,
                "{}",
                notice.message
            ),
            NoticeLevel::Error => error!(
                target: "projsync::notice",
                code = %notice.code,
                parent_id,
                "{}",
                notice.message
            ),
        }
    }
}

/// Publishes notices on the bus as `sync.notice`.
#[derive(Clone)]
pub struct BusSink {
    bus: Bus,
}

impl BusSink {
    pub fn new(bus: Bus) -> Self {
        Self { bus }
    }
}

impl NotificationSink for BusSink {
    fn notify(&self, notice: Notice) {
        match notice.parent_id.as_deref() {
            Some(parent_id) => {
                self.bus
                    .publish_scoped(projsync_topics::TOPIC_SYNC_NOTICE, parent_id, &notice)
            }
            None => self.bus.publish(projsync_topics::TOPIC_SYNC_NOTICE, &notice),
        }
    }
}

/// Keeps every notice in memory; handy for UI shells that poll.
#[derive(Debug, Default)]
pub struct MemorySink {
    notices: Mutex<Vec<Notice>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notices(&self) -> Vec<Notice> {
        self.notices.lock().clone()
    }

    pub fn drain(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock())
    }
}

impl NotificationSink for MemorySink {
    fn notify(&self, notice: Notice) {
        self.notices.lock().push(notice);
    }
}
