//! Canonical event topic constants shared across the projsync crates.
//!
//! Publishers and the bus feed both resolve topics through this crate so the
//! two sides never drift. Keep the list grouped by entity set and favor
//! dot.case names.

// Comments
pub const TOPIC_COMMENTS_ADDED: &str = "comments.added";
pub const TOPIC_COMMENTS_UPDATED: &str = "comments.updated";
pub const TOPIC_COMMENTS_DELETED: &str = "comments.deleted";
pub const TOPIC_COMMENTS_LIKED: &str = "comments.liked";
pub const TOPIC_COMMENTS_UNLIKED: &str = "comments.unliked";

// Tasks
pub const TOPIC_TASKS_ADDED: &str = "tasks.added";
pub const TOPIC_TASKS_UPDATED: &str = "tasks.updated";
pub const TOPIC_TASKS_DELETED: &str = "tasks.deleted";

// Client-side notices (toasts, telemetry)
pub const TOPIC_SYNC_NOTICE: &str = "sync.notice";

/// Resolves the topic for an entity set (`comments`, `tasks`) and an event
/// kind slug (`added`, `updated`, `deleted`, `liked`, `unliked`). Tasks have
/// no like topics.
pub fn change_topic(entity_set: &str, kind: &str) -> Option<&'static str> {
    let topic = match (entity_set, kind) {
        ("comments", "added") => TOPIC_COMMENTS_ADDED,
        ("comments", "updated") => TOPIC_COMMENTS_UPDATED,
        ("comments", "deleted") => TOPIC_COMMENTS_DELETED,
        ("comments", "liked") => TOPIC_COMMENTS_LIKED,
        ("comments", "unliked") => TOPIC_COMMENTS_UNLIKED,
        ("tasks", "added") => TOPIC_TASKS_ADDED,
        ("tasks", "updated") => TOPIC_TASKS_UPDATED,
        ("tasks", "deleted") => TOPIC_TASKS_DELETED,
        _ => return None,
    };
    Some(topic)
}
