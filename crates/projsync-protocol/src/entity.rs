use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::event::EventKind;

/// Display cap for the likers preview carried on a comment.
pub const LIKERS_PREVIEW_CAP: usize = 5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Comment,
    Task,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Comment => "comment",
            EntityKind::Task => "task",
        }
    }

    /// Name of the collection this kind lives in; used for cache keys and topics.
    pub fn entity_set(&self) -> &'static str {
        match self {
            EntityKind::Comment => "comments",
            EntityKind::Task => "tasks",
        }
    }

    /// Change events the server publishes for this kind. Tasks carry no like
    /// state, so they have no like channels.
    pub fn event_kinds(&self) -> &'static [EventKind] {
        match self {
            EntityKind::Comment => &EventKind::ALL,
            EntityKind::Task => &[EventKind::Added, EventKind::Updated, EventKind::Deleted],
        }
    }
}

/// A member of a parent-scoped collection.
///
/// `id` and `created_at` never change for a given entity. Like state is
/// optional: kinds without it keep the default no-op implementations, so like
/// events against them fall through untouched.
pub trait Entity:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    const KIND: EntityKind;

    fn id(&self) -> &str;

    fn parent_id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    /// Revision marker carried by the payload, if the server sent one.
    fn version(&self) -> Option<DateTime<Utc>> {
        None
    }

    fn liked_by_current_user(&self) -> Option<bool> {
        None
    }

    /// Sets the client-relative like flag; returns false when the kind has no like state.
    fn set_liked_by_current_user(&mut self, _liked: bool) -> bool {
        false
    }

    /// Replaces shared like counters. Returns false when the kind has no like state.
    fn set_like_counts(&mut self, _likes_count: u32, _likers: Vec<Liker>) -> bool {
        false
    }

    fn likes_count(&self) -> Option<u32> {
        None
    }

    fn set_likes_count(&mut self, _likes_count: u32) -> bool {
        false
    }

    /// Puts every like field back to its neutral value.
    fn reset_like_state(&mut self) {}
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Liker {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Liker {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: String,
    pub project_id: String,
    pub author_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub likes_count: u32,
    #[serde(default)]
    pub liked_by_current_user: bool,
    #[serde(default)]
    pub likers: Vec<Liker>,
}

impl Comment {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        author_id: impl Into<String>,
        content: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            author_id: author_id.into(),
            content: content.into(),
            created_at,
            updated_at: None,
            likes_count: 0,
            liked_by_current_user: false,
            likers: Vec::new(),
        }
    }
}

impl Entity for Comment {
    const KIND: EntityKind = EntityKind::Comment;

    fn id(&self) -> &str {
        &self.id
    }

    fn parent_id(&self) -> &str {
        &self.project_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn version(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    fn liked_by_current_user(&self) -> Option<bool> {
        Some(self.liked_by_current_user)
    }

    fn set_liked_by_current_user(&mut self, liked: bool) -> bool {
        self.liked_by_current_user = liked;
        true
    }

    fn set_like_counts(&mut self, likes_count: u32, mut likers: Vec<Liker>) -> bool {
        likers.truncate(LIKERS_PREVIEW_CAP);
        self.likes_count = likes_count;
        self.likers = likers;
        true
    }

    fn likes_count(&self) -> Option<u32> {
        Some(self.likes_count)
    }

    fn set_likes_count(&mut self, likes_count: u32) -> bool {
        self.likes_count = likes_count;
        true
    }

    fn reset_like_state(&mut self) {
        self.likes_count = 0;
        self.liked_by_current_user = false;
        self.likers.clear();
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Todo => "todo",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
        }
    }

    pub fn from_slug(value: &str) -> Self {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "in_progress" | "in-progress" | "doing" => TaskStatus::InProgress,
            "done" | "complete" | "completed" => TaskStatus::Done,
            _ => TaskStatus::Todo,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub project_id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        project_id: impl Into<String>,
        title: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            title: title.into(),
            description: None,
            status: TaskStatus::Todo,
            assignee_id: None,
            created_at,
            updated_at: None,
        }
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = status;
        self
    }
}

impl Entity for Task {
    const KIND: EntityKind = EntityKind::Task;

    fn id(&self) -> &str {
        &self.id
    }

    fn parent_id(&self) -> &str {
        &self.project_id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn version(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }
}
