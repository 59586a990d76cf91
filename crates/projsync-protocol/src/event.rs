use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, Liker};

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Updated,
    Deleted,
    Liked,
    Unliked,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Added,
        EventKind::Updated,
        EventKind::Deleted,
        EventKind::Liked,
        EventKind::Unliked,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Added => "added",
            EventKind::Updated => "updated",
            EventKind::Deleted => "deleted",
            EventKind::Liked => "liked",
            EventKind::Unliked => "unliked",
        }
    }

    pub fn from_slug(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "added" | "created" => Some(EventKind::Added),
            "updated" => Some(EventKind::Updated),
            "deleted" | "removed" => Some(EventKind::Deleted),
            "liked" => Some(EventKind::Liked),
            "unliked" => Some(EventKind::Unliked),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DeletedPayload {
    pub id: String,
    pub parent_id: String,
    pub deleted_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LikeAction {
    Like,
    Unlike,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LikePayload {
    pub id: String,
    pub parent_id: String,
    pub likes_count: u32,
    #[serde(default)]
    pub likers: Vec<Liker>,
    pub actor_id: String,
    pub action: LikeAction,
}

/// One change to one entity, scoped to a parent.
#[derive(Clone, Debug, PartialEq)]
pub enum ChangeEvent<E> {
    Added(E),
    Updated(E),
    Deleted(DeletedPayload),
    Liked(LikePayload),
    Unliked(LikePayload),
}

/// Identity of a single event instance, stable across redeliveries.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventKey {
    pub kind: EventKind,
    pub entity_id: String,
    pub marker: String,
}

impl<E: Entity> ChangeEvent<E> {
    /// Routes a like payload to the variant its `action` names.
    pub fn from_like(payload: LikePayload) -> Self {
        match payload.action {
            LikeAction::Like => ChangeEvent::Liked(payload),
            LikeAction::Unlike => ChangeEvent::Unliked(payload),
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            ChangeEvent::Added(_) => EventKind::Added,
            ChangeEvent::Updated(_) => EventKind::Updated,
            ChangeEvent::Deleted(_) => EventKind::Deleted,
            ChangeEvent::Liked(_) => EventKind::Liked,
            ChangeEvent::Unliked(_) => EventKind::Unliked,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            ChangeEvent::Added(entity) | ChangeEvent::Updated(entity) => entity.id(),
            ChangeEvent::Deleted(payload) => &payload.id,
            ChangeEvent::Liked(payload) | ChangeEvent::Unliked(payload) => &payload.id,
        }
    }

    pub fn parent_id(&self) -> &str {
        match self {
            ChangeEvent::Added(entity) | ChangeEvent::Updated(entity) => entity.parent_id(),
            ChangeEvent::Deleted(payload) => &payload.parent_id,
            ChangeEvent::Liked(payload) | ChangeEvent::Unliked(payload) => &payload.parent_id,
        }
    }

    /// Identity used to drop redeliveries.
    ///
    /// `None` for events that carry absolute state and no revision marker
    /// (like counts, updates without `updated_at`). Those are applied every
    /// time they arrive.
    pub fn key(&self) -> Option<EventKey> {
        let marker = match self {
            ChangeEvent::Added(entity) => entity.version().unwrap_or_else(|| entity.created_at()),
            ChangeEvent::Updated(entity) => entity.version()?,
            ChangeEvent::Deleted(payload) => payload.deleted_at,
            ChangeEvent::Liked(_) | ChangeEvent::Unliked(_) => return None,
        };
        Some(EventKey {
            kind: self.kind(),
            entity_id: self.entity_id().to_string(),
            marker: marker.to_rfc3339_opts(SecondsFormat::Micros, true),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Comment;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn like(action: LikeAction, count: u32) -> LikePayload {
        LikePayload {
            id: "c1".into(),
            parent_id: "p1".into(),
            likes_count: count,
            likers: vec![Liker::new("u2")],
            actor_id: "u2".into(),
            action,
        }
    }

    #[test]
    fn like_payload_routes_by_action() {
        let liked = ChangeEvent::<Comment>::from_like(like(LikeAction::Like, 1));
        assert_eq!(liked.kind(), EventKind::Liked);
        let unliked = ChangeEvent::<Comment>::from_like(like(LikeAction::Unlike, 0));
        assert_eq!(unliked.kind(), EventKind::Unliked);
        assert_eq!(unliked.parent_id(), "p1");
    }

    #[test]
    fn keys_change_with_entity_version() {
        let mut comment = Comment::new("c1", "p1", "u1", "hi", ts(10));
        comment.updated_at = Some(ts(15));
        let first = ChangeEvent::Updated(comment.clone()).key();
        let again = ChangeEvent::Updated(comment.clone()).key();
        assert!(first.is_some());
        assert_eq!(first, again);

        comment.updated_at = Some(ts(20));
        let later = ChangeEvent::Updated(comment).key().expect("versioned update is keyed");
        assert_ne!(first, Some(later.clone()));
        assert_eq!(later.kind, EventKind::Updated);
        assert_eq!(later.entity_id, "c1");
    }

    #[test]
    fn unversioned_updates_have_no_key() {
        let comment = Comment::new("c1", "p1", "u1", "hi", ts(10));
        assert_eq!(ChangeEvent::Updated(comment.clone()).key(), None);
        let added = ChangeEvent::Added(comment).key().expect("added is keyed");
        assert_eq!(added.kind, EventKind::Added);
    }

    #[test]
    fn like_events_have_no_key() {
        let liked = ChangeEvent::<Comment>::from_like(like(LikeAction::Like, 1));
        let unliked = ChangeEvent::<Comment>::from_like(like(LikeAction::Unlike, 0));
        assert_eq!(liked.key(), None);
        assert_eq!(unliked.key(), None);
    }

    #[test]
    fn deleted_payload_uses_camel_case() {
        let payload: DeletedPayload = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "parentId": "p1",
            "deletedAt": "2024-05-20T12:00:00Z",
        }))
        .expect("deleted payload parses");
        assert_eq!(payload.parent_id, "p1");
    }

    #[test]
    fn event_kind_from_slug_accepts_synonyms() {
        assert_eq!(EventKind::from_slug("CREATED"), Some(EventKind::Added));
        assert_eq!(EventKind::from_slug(" removed "), Some(EventKind::Deleted));
        assert_eq!(EventKind::from_slug("liked"), Some(EventKind::Liked));
        assert_eq!(EventKind::from_slug("nope"), None);
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_slug(kind.as_str()), Some(kind));
        }
    }
}
