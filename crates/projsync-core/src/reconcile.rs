//! Folds snapshots, change events and optimistic local operations into one
//! ordered, duplicate-free collection per parent id.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::time::{Duration, Instant};

use projsync_protocol::{ChangeEvent, Entity, EventKey, LikePayload};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::dedupe::SeenWindow;

const METRIC_DUPLICATES_DROPPED: &str = "projsync_reconciler_duplicates_dropped";

pub const DEFAULT_SEEN_TTL: Duration = Duration::from_secs(300);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum SortDirection {
    #[default]
    NewestFirst,
    OldestFirst,
}

/// Ordering of a collection: `created_at` in the configured direction, then
/// `id` ascending so equal timestamps always land in the same order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OrderingPolicy {
    pub direction: SortDirection,
}

impl OrderingPolicy {
    pub fn newest_first() -> Self {
        Self {
            direction: SortDirection::NewestFirst,
        }
    }

    pub fn oldest_first() -> Self {
        Self {
            direction: SortDirection::OldestFirst,
        }
    }

    pub fn compare<E: Entity>(&self, a: &E, b: &E) -> Ordering {
        let by_time = match self.direction {
            SortDirection::NewestFirst => b.created_at().cmp(&a.created_at()),
            SortDirection::OldestFirst => a.created_at().cmp(&b.created_at()),
        };
        by_time.then_with(|| a.id().cmp(b.id()))
    }

    pub fn is_sorted<E: Entity>(&self, items: &[E]) -> bool {
        items
            .windows(2)
            .all(|pair| self.compare(&pair[0], &pair[1]) != Ordering::Greater)
    }
}

/// A change issued by this client before the server confirms it.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalOp<E> {
    Upsert(E),
    Remove(String),
    SetLiked { id: String, liked: bool },
    /// The server's answer to a like toggle: own flag and total count.
    ConfirmLike {
        id: String,
        liked: bool,
        likes_count: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    Duplicate,
    AlreadyPresent,
    UnknownId,
    NotApplicable,
    NoChange,
    ForeignParent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Replaced,
    Confirmed,
    Removed,
    LikesUpdated,
    Ignored(IgnoreReason),
}

impl ApplyOutcome {
    pub fn mutated(&self) -> bool {
        !matches!(self, ApplyOutcome::Ignored(_))
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyOutcome::Inserted => "inserted",
            ApplyOutcome::Replaced => "replaced",
            ApplyOutcome::Confirmed => "confirmed",
            ApplyOutcome::Removed => "removed",
            ApplyOutcome::LikesUpdated => "likes_updated",
            ApplyOutcome::Ignored(_) => "ignored",
        }
    }
}

/// Counts from folding one snapshot into the collection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMerge {
    pub inserted: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

impl SnapshotMerge {
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.replaced > 0
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ReconciliationResult<E> {
    pub collection: Vec<E>,
    pub mutated_since_persist: bool,
}

pub struct Reconciler<E: Entity> {
    parent_id: String,
    policy: OrderingPolicy,
    items: Vec<E>,
    pending: HashSet<String>,
    seen: SeenWindow<EventKey>,
    tombstones: SeenWindow<String>,
    dirty: bool,
    baseline: bool,
}

impl<E: Entity> Reconciler<E> {
    pub fn new(parent_id: impl Into<String>, policy: OrderingPolicy) -> Self {
        Self::with_seen_ttl(parent_id, policy, DEFAULT_SEEN_TTL)
    }

    pub fn with_seen_ttl(parent_id: impl Into<String>, policy: OrderingPolicy, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            parent_id: parent_id.into(),
            policy,
            items: Vec::new(),
            pending: HashSet::new(),
            seen: SeenWindow::new(ttl, now),
            tombstones: SeenWindow::new(ttl, now),
            dirty: false,
            baseline: false,
        }
    }

    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    pub fn policy(&self) -> OrderingPolicy {
        self.policy
    }

    pub fn items(&self) -> &[E] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&E> {
        self.position(id).map(|idx| &self.items[idx])
    }

    pub fn has_baseline(&self) -> bool {
        self.baseline
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.contains(id)
    }

    pub fn result(&self) -> ReconciliationResult<E> {
        ReconciliationResult {
            collection: self.items.clone(),
            mutated_since_persist: self.dirty,
        }
    }

    pub fn mutated_since_persist(&self) -> bool {
        self.dirty
    }

    pub fn mark_persisted(&mut self) {
        self.dirty = false;
    }

    pub fn apply(&mut self, event: ChangeEvent<E>) -> ApplyOutcome {
        self.apply_at(event, Instant::now())
    }

    pub fn apply_at(&mut self, event: ChangeEvent<E>, now: Instant) -> ApplyOutcome {
        if event.parent_id() != self.parent_id {
            debug!(
                parent_id = %self.parent_id,
                foreign = %event.parent_id(),
                "event for another parent ignored"
            );
            return ApplyOutcome::Ignored(IgnoreReason::ForeignParent);
        }
        let kind = event.kind();
        if let Some(key) = event.key() {
            if !self.seen.insert(key, now) {
                metrics::counter!(METRIC_DUPLICATES_DROPPED).increment(1);
                trace!(parent_id = %self.parent_id, kind = kind.as_str(), "duplicate event dropped");
                return ApplyOutcome::Ignored(IgnoreReason::Duplicate);
            }
        }
        self.tombstones.roll(now);

        let outcome = match event {
            ChangeEvent::Added(entity) => self.on_added(entity),
            ChangeEvent::Updated(entity) => self.on_updated(entity),
            ChangeEvent::Deleted(payload) => self.remove(&payload.id, now),
            ChangeEvent::Liked(payload) | ChangeEvent::Unliked(payload) => self.on_likes(payload),
        };
        self.dirty |= outcome.mutated();
        debug!(
            parent_id = %self.parent_id,
            kind = kind.as_str(),
            outcome = outcome.as_str(),
            size = self.items.len(),
            "change event applied"
        );
        outcome
    }

    pub fn apply_local(&mut self, op: LocalOp<E>) -> ApplyOutcome {
        let now = Instant::now();
        self.tombstones.roll(now);
        let outcome = match op {
            LocalOp::Upsert(entity) => {
                let id = entity.id().to_string();
                self.tombstones.remove(&id);
                let outcome = match self.position(&id) {
                    Some(idx) => {
                        self.replace_at(idx, entity);
                        ApplyOutcome::Replaced
                    }
                    None => {
                        self.insert_sorted(entity);
                        ApplyOutcome::Inserted
                    }
                };
                self.pending.insert(id);
                outcome
            }
            LocalOp::Remove(id) => self.remove(&id, now),
            LocalOp::SetLiked { id, liked } => self.set_liked(&id, liked),
            LocalOp::ConfirmLike {
                id,
                liked,
                likes_count,
            } => self.confirm_like(&id, liked, likes_count),
        };
        self.dirty |= outcome.mutated();
        debug!(
            parent_id = %self.parent_id,
            outcome = outcome.as_str(),
            "local op applied"
        );
        outcome
    }

    /// Folds an authoritative snapshot in.
    ///
    /// On an empty collection this is the baseline. Otherwise entities from the
    /// snapshot replace their local copies, pending ones keep their own like
    /// flag, ids deleted inside the seen window stay deleted, and anything the
    /// snapshot does not mention is kept.
    pub fn load_snapshot(&mut self, entities: Vec<E>) -> SnapshotMerge {
        self.load_snapshot_at(entities, Instant::now())
    }

    pub fn load_snapshot_at(&mut self, entities: Vec<E>, now: Instant) -> SnapshotMerge {
        self.tombstones.roll(now);
        let mut merge = SnapshotMerge::default();
        let mut visited: HashSet<String> = HashSet::new();
        for entity in entities {
            if entity.parent_id() != self.parent_id || !visited.insert(entity.id().to_string()) {
                merge.skipped += 1;
                continue;
            }
            if self.tombstones.contains(&entity.id().to_string()) {
                merge.skipped += 1;
                continue;
            }
            match self.position(entity.id()) {
                Some(idx) if self.items[idx] == entity => merge.unchanged += 1,
                Some(idx) => {
                    let id = entity.id().to_string();
                    if self.pending.remove(&id) {
                        self.replace_at(idx, entity);
                    } else {
                        self.items[idx] = entity;
                    }
                    merge.replaced += 1;
                }
                None => {
                    self.items.push(entity);
                    merge.inserted += 1;
                }
            }
        }
        let policy = self.policy;
        self.items.sort_by(|a, b| policy.compare(a, b));
        self.baseline = true;
        self.dirty |= merge.changed();
        debug!(
            parent_id = %self.parent_id,
            inserted = merge.inserted,
            replaced = merge.replaced,
            unchanged = merge.unchanged,
            skipped = merge.skipped,
            "snapshot merged"
        );
        merge
    }

    fn on_added(&mut self, mut entity: E) -> ApplyOutcome {
        match self.position(entity.id()) {
            Some(idx) => {
                if self.pending.remove(entity.id()) {
                    self.replace_at(idx, entity);
                    ApplyOutcome::Confirmed
                } else {
                    ApplyOutcome::Ignored(IgnoreReason::AlreadyPresent)
                }
            }
            None => {
                // Nobody can have liked an entity before it existed in view.
                entity.reset_like_state();
                self.tombstones.remove(&entity.id().to_string());
                self.insert_sorted(entity);
                ApplyOutcome::Inserted
            }
        }
    }

    fn on_updated(&mut self, mut entity: E) -> ApplyOutcome {
        match self.position(entity.id()) {
            Some(idx) => {
                self.replace_at(idx, entity.clone());
                if self.pending.remove(entity.id()) {
                    ApplyOutcome::Confirmed
                } else {
                    ApplyOutcome::Replaced
                }
            }
            None => {
                // Missed the Added (or saw a Deleted first): recover as an insert.
                entity.reset_like_state();
                self.tombstones.remove(&entity.id().to_string());
                self.insert_sorted(entity);
                ApplyOutcome::Inserted
            }
        }
    }

    fn on_likes(&mut self, payload: LikePayload) -> ApplyOutcome {
        let Some(idx) = self.position(&payload.id) else {
            return ApplyOutcome::Ignored(IgnoreReason::UnknownId);
        };
        // Broadcast likes never say whether this client was the actor, so the
        // own-like flag is left alone.
        if self.items[idx].set_like_counts(payload.likes_count, payload.likers) {
            ApplyOutcome::LikesUpdated
        } else {
            ApplyOutcome::Ignored(IgnoreReason::NotApplicable)
        }
    }

    fn set_liked(&mut self, id: &str, liked: bool) -> ApplyOutcome {
        let Some(idx) = self.position(id) else {
            return ApplyOutcome::Ignored(IgnoreReason::UnknownId);
        };
        let entity = &mut self.items[idx];
        match entity.liked_by_current_user() {
            None => ApplyOutcome::Ignored(IgnoreReason::NotApplicable),
            Some(current) if current == liked => ApplyOutcome::Ignored(IgnoreReason::NoChange),
            Some(_) => {
                let count = entity.likes_count().unwrap_or(0);
                let next = if liked {
                    count.saturating_add(1)
                } else {
                    count.saturating_sub(1)
                };
                entity.set_liked_by_current_user(liked);
                entity.set_likes_count(next);
                ApplyOutcome::LikesUpdated
            }
        }
    }

    fn confirm_like(&mut self, id: &str, liked: bool, likes_count: u32) -> ApplyOutcome {
        let Some(idx) = self.position(id) else {
            return ApplyOutcome::Ignored(IgnoreReason::UnknownId);
        };
        let entity = &mut self.items[idx];
        match (entity.liked_by_current_user(), entity.likes_count()) {
            (None, _) => ApplyOutcome::Ignored(IgnoreReason::NotApplicable),
            (Some(current), Some(count)) if current == liked && count == likes_count => {
                ApplyOutcome::Ignored(IgnoreReason::NoChange)
            }
            _ => {
                entity.set_liked_by_current_user(liked);
                entity.set_likes_count(likes_count);
                ApplyOutcome::LikesUpdated
            }
        }
    }

    fn remove(&mut self, id: &str, now: Instant) -> ApplyOutcome {
        self.pending.remove(id);
        self.tombstones.insert(id.to_string(), now);
        match self.position(id) {
            Some(idx) => {
                self.items.remove(idx);
                ApplyOutcome::Removed
            }
            None => ApplyOutcome::Ignored(IgnoreReason::UnknownId),
        }
    }

    /// Replaces the payload at `idx`, keeping the client-relative like flag and
    /// moving the entity only if its ordering key changed.
    fn replace_at(&mut self, idx: usize, mut entity: E) {
        if let Some(liked) = self.items[idx].liked_by_current_user() {
            entity.set_liked_by_current_user(liked);
        }
        if self.items[idx].created_at() == entity.created_at() {
            self.items[idx] = entity;
        } else {
            self.items.remove(idx);
            self.insert_sorted(entity);
        }
    }

    fn insert_sorted(&mut self, entity: E) {
        let policy = self.policy;
        let idx = self
            .items
            .partition_point(|existing| policy.compare(existing, &entity) == Ordering::Less);
        self.items.insert(idx, entity);
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.items.iter().position(|entity| entity.id() == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use projsync_protocol::{Comment, DeletedPayload, LikeAction, Liker, Task, TaskStatus};
    use proptest::prelude::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("valid timestamp")
    }

    fn comment(id: &str, secs: i64) -> Comment {
        Comment::new(id, "p1", "author", format!("body of {id}"), ts(secs))
    }

    fn deleted(id: &str, secs: i64) -> ChangeEvent<Comment> {
        ChangeEvent::Deleted(DeletedPayload {
            id: id.into(),
            parent_id: "p1".into(),
            deleted_at: ts(secs),
        })
    }

    fn liked(id: &str, count: u32, actor: &str) -> ChangeEvent<Comment> {
        ChangeEvent::from_like(LikePayload {
            id: id.into(),
            parent_id: "p1".into(),
            likes_count: count,
            likers: vec![Liker::new(actor)],
            actor_id: actor.into(),
            action: LikeAction::Like,
        })
    }

    fn unliked(id: &str, count: u32, actor: &str) -> ChangeEvent<Comment> {
        ChangeEvent::from_like(LikePayload {
            id: id.into(),
            parent_id: "p1".into(),
            likes_count: count,
            likers: Vec::new(),
            actor_id: actor.into(),
            action: LikeAction::Unlike,
        })
    }

    fn ids(rec: &Reconciler<Comment>) -> Vec<&str> {
        rec.items().iter().map(|c| c.id.as_str()).collect()
    }

    fn comments() -> Reconciler<Comment> {
        Reconciler::new("p1", OrderingPolicy::newest_first())
    }

    #[test]
    fn new_comment_becomes_visible() {
        let mut rec = comments();
        let outcome = rec.apply(ChangeEvent::Added(comment("c1", 1)));
        assert_eq!(outcome, ApplyOutcome::Inserted);
        assert_eq!(ids(&rec), vec!["c1"]);
        assert!(rec.mutated_since_persist());
    }

    #[test]
    fn duplicate_add_leaves_collection_unchanged() {
        let mut rec = comments();
        rec.apply(ChangeEvent::Added(comment("c1", 1)));
        let before = rec.items().to_vec();
        let outcome = rec.apply(ChangeEvent::Added(comment("c1", 1)));
        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::Duplicate));
        assert_eq!(rec.items(), before.as_slice());
        assert_eq!(rec.len(), 1);
    }

    #[test]
    fn add_for_present_id_with_new_marker_is_a_noop() {
        let mut rec = comments();
        rec.apply(ChangeEvent::Added(comment("c1", 1)));
        let mut newer = comment("c1", 1);
        newer.updated_at = Some(ts(5));
        newer.content = "changed".into();
        let outcome = rec.apply(ChangeEvent::Added(newer));
        assert_eq!(outcome, ApplyOutcome::Ignored(IgnoreReason::AlreadyPresent));
        assert_eq!(rec.get("c1").map(|c| c.content.as_str()), Some("body of c1"));
    }

    #[test]
    fn added_payload_never_arrives_pre_liked() {
        let mut rec = comments();
        let mut stale = comment("c1", 1);
        stale.liked_by_current_user = true;
        stale.likes_count = 3;
        stale.likers.push(Liker::new("u9"));
        rec.apply(ChangeEvent::Added(stale));
        let stored = rec.get("c1").expect("inserted");
        assert!(!stored.liked_by_current_user);
        assert_eq!(stored.likes_count, 0);
        assert!(stored.likers.is_empty());
    }

    #[test]
    fn like_event_preserves_own_like_flag() {
        let mut rec = comments();
        rec.apply(ChangeEvent::Added(comment("c1", 1)));
        assert_eq!(
            rec.apply_local(LocalOp::SetLiked {
                id: "c1".into(),
                liked: true
            }),
            ApplyOutcome::LikesUpdated
        );
        let outcome = rec.apply(liked("c1", 5, "someone-else"));
        assert_eq!(outcome, ApplyOutcome::LikesUpdated);
        let stored = rec.get("c1").expect("present");
        assert!(stored.liked_by_current_user);
        assert_eq!(stored.likes_count, 5);
        assert_eq!(stored.likers, vec![Liker::new("someone-else")]);

        rec.apply(unliked("c1", 4, "someone-else"));
        let stored = rec.get("c1").expect("present");
        assert!(stored.liked_by_current_user);
        assert_eq!(stored.likes_count, 4);
    }

    #[test]
    fn local_like_toggle_adjusts_count_once() {
        let mut rec = comments();
        rec.load_snapshot(vec![Comment {
            likes_count: 2,
            ..comment("c1", 1)
        }]);
        let like = LocalOp::SetLiked {
            id: "c1".into(),
            liked: true,
        };
        assert_eq!(rec.apply_local(like.clone()), ApplyOutcome::LikesUpdated);
        assert_eq!(
            rec.apply_local(like),
            ApplyOutcome::Ignored(IgnoreReason::NoChange)
        );
        assert_eq!(rec.get("c1").map(|c| c.likes_count), Some(3));
        rec.apply_local(LocalOp::SetLiked {
            id: "c1".into(),
            liked: false,
        });
        assert_eq!(rec.get("c1").map(|c| c.likes_count), Some(2));
    }

    #[test]
    fn same_actor_liking_again_is_applied() {
        let mut rec = comments();
        rec.load_snapshot(vec![Comment {
            likes_count: 4,
            ..comment("c1", 1)
        }]);
        assert_eq!(rec.apply(liked("c1", 5, "u2")), ApplyOutcome::LikesUpdated);
        assert_eq!(rec.apply(unliked("c1", 4, "u2")), ApplyOutcome::LikesUpdated);
        assert_eq!(rec.apply(liked("c1", 5, "u2")), ApplyOutcome::LikesUpdated);
        assert_eq!(rec.get("c1").map(|c| c.likes_count), Some(5));
    }

    #[test]
    fn updates_without_version_are_all_applied() {
        let mut tasks: Reconciler<Task> = Reconciler::new("p1", OrderingPolicy::oldest_first());
        tasks.load_snapshot(vec![Task::new("t1", "p1", "ship it", ts(1))]);

        let mut done = Task::new("t1", "p1", "ship it", ts(1));
        done.status = TaskStatus::Done;
        assert_eq!(tasks.apply(ChangeEvent::Updated(done)), ApplyOutcome::Replaced);

        let mut reopened = Task::new("t1", "p1", "ship it", ts(1));
        reopened.status = TaskStatus::InProgress;
        assert_eq!(tasks.apply(ChangeEvent::Updated(reopened)), ApplyOutcome::Replaced);
        assert_eq!(tasks.get("t1").map(|t| t.status), Some(TaskStatus::InProgress));
    }

    #[test]
    fn redelivered_versioned_update_is_dropped() {
        let mut rec = comments();
        rec.apply(ChangeEvent::Added(comment("c1", 1)));
        let mut edit = comment("c1", 1);
        edit.updated_at = Some(ts(7));
        assert_eq!(rec.apply(ChangeEvent::Updated(edit.clone())), ApplyOutcome::Replaced);
        assert_eq!(
            rec.apply(ChangeEvent::Updated(edit)),
            ApplyOutcome::Ignored(IgnoreReason::Duplicate)
        );
    }

    #[test]
    fn confirmed_like_takes_the_server_count() {
        let mut rec = comments();
        rec.load_snapshot(vec![Comment {
            likes_count: 2,
            ..comment("c1", 1)
        }]);
        rec.apply_local(LocalOp::SetLiked {
            id: "c1".into(),
            liked: true,
        });
        let confirm = LocalOp::ConfirmLike {
            id: "c1".into(),
            liked: true,
            likes_count: 7,
        };
        assert_eq!(rec.apply_local(confirm.clone()), ApplyOutcome::LikesUpdated);
        assert_eq!(rec.apply_local(confirm), ApplyOutcome::Ignored(IgnoreReason::NoChange));
        let stored = rec.get("c1").expect("present");
        assert!(stored.liked_by_current_user);
        assert_eq!(stored.likes_count, 7);
    }

    #[test]
    fn delete_then_late_update_reinserts() {
        let mut rec = comments();
        rec.apply(ChangeEvent::Added(comment("c1", 1)));
        assert_eq!(rec.apply(deleted("c1", 10)), ApplyOutcome::Removed);
        assert!(rec.is_empty());

        let mut stale = comment("c1", 1);
        stale.updated_at = Some(ts(5));
        stale.liked_by_current_user = true;
        stale.likes_count = 2;
        assert_eq!(rec.apply(ChangeEvent::Updated(stale)), ApplyOutcome::Inserted);
        assert_eq!(ids(&rec), vec!["c1"]);
        let stored = rec.get("c1").expect("present");
        assert!(!stored.liked_by_current_user);
        assert_eq!(stored.likes_count, 0);
    }

    #[test]
    fn delete_of_unknown_id_is_a_noop() {
        let mut rec = comments();
        rec.apply(ChangeEvent::Added(comment("c1", 1)));
        rec.apply(ChangeEvent::Added(comment("c2", 2)));
        rec.mark_persisted();
        let before = rec.items().to_vec();
        assert_eq!(
            rec.apply(deleted("ghost", 3)),
            ApplyOutcome::Ignored(IgnoreReason::UnknownId)
        );
        assert_eq!(rec.items(), before.as_slice());
        assert!(!rec.mutated_since_persist());
    }

    #[test]
    fn update_replaces_in_place_and_keeps_like_flag() {
        let mut rec = comments();
        rec.load_snapshot(vec![
            comment("c1", 1),
            Comment {
                liked_by_current_user: true,
                likes_count: 1,
                ..comment("c2", 2)
            },
            comment("c3", 3),
        ]);
        let mut edit = comment("c2", 2);
        edit.content = "edited".into();
        edit.updated_at = Some(ts(9));
        edit.likes_count = 1;
        assert_eq!(rec.apply(ChangeEvent::Updated(edit)), ApplyOutcome::Replaced);
        assert_eq!(ids(&rec), vec!["c3", "c2", "c1"]);
        let stored = rec.get("c2").expect("present");
        assert_eq!(stored.content, "edited");
        assert!(stored.liked_by_current_user);
    }

    #[test]
    fn update_with_new_ordering_key_resorts() {
        let mut rec = comments();
        rec.load_snapshot(vec![comment("c1", 1), comment("c2", 2), comment("c3", 3)]);
        let mut moved = comment("c1", 10);
        moved.updated_at = Some(ts(11));
        rec.apply(ChangeEvent::Updated(moved));
        assert_eq!(ids(&rec), vec!["c1", "c3", "c2"]);
    }

    #[test]
    fn optimistic_upsert_is_confirmed_not_duplicated() {
        let mut rec = comments();
        let mine = comment("c1", 1);
        assert_eq!(rec.apply_local(LocalOp::Upsert(mine.clone())), ApplyOutcome::Inserted);
        assert!(rec.is_pending("c1"));

        let mut confirmed = mine;
        confirmed.content = "server copy".into();
        assert_eq!(rec.apply(ChangeEvent::Added(confirmed)), ApplyOutcome::Confirmed);
        assert_eq!(rec.len(), 1);
        assert!(!rec.is_pending("c1"));
        assert_eq!(rec.get("c1").map(|c| c.content.as_str()), Some("server copy"));
    }

    #[test]
    fn local_remove_clears_pending() {
        let mut rec = comments();
        rec.apply_local(LocalOp::Upsert(comment("c1", 1)));
        assert_eq!(rec.apply_local(LocalOp::Remove("c1".into())), ApplyOutcome::Removed);
        assert!(!rec.is_pending("c1"));
        assert_eq!(
            rec.apply_local(LocalOp::Remove("c1".into())),
            ApplyOutcome::Ignored(IgnoreReason::UnknownId)
        );
    }

    #[test]
    fn ties_break_by_id_ascending() {
        let mut rec = comments();
        for id in ["c3", "c1", "c2"] {
            rec.apply(ChangeEvent::Added(comment(id, 7)));
        }
        rec.apply(ChangeEvent::Added(comment("c0", 8)));
        assert_eq!(ids(&rec), vec!["c0", "c1", "c2", "c3"]);

        let mut tasks: Reconciler<Task> = Reconciler::new("p1", OrderingPolicy::oldest_first());
        tasks.apply(ChangeEvent::Added(Task::new("t2", "p1", "b", ts(5))));
        tasks.apply(ChangeEvent::Added(Task::new("t1", "p1", "a", ts(5))));
        tasks.apply(ChangeEvent::Added(Task::new("t0", "p1", "c", ts(1))));
        let order: Vec<&str> = tasks.items().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(order, vec!["t0", "t1", "t2"]);
    }

    #[test]
    fn like_events_do_not_apply_to_tasks() {
        let mut tasks: Reconciler<Task> = Reconciler::new("p1", OrderingPolicy::oldest_first());
        tasks.apply(ChangeEvent::Added(
            Task::new("t1", "p1", "a", ts(1)).with_status(TaskStatus::InProgress),
        ));
        let like = ChangeEvent::from_like(LikePayload {
            id: "t1".into(),
            parent_id: "p1".into(),
            likes_count: 3,
            likers: Vec::new(),
            actor_id: "u2".into(),
            action: LikeAction::Like,
        });
        assert_eq!(tasks.apply(like), ApplyOutcome::Ignored(IgnoreReason::NotApplicable));
    }

    #[test]
    fn foreign_parent_events_are_ignored() {
        let mut rec = comments();
        let other = Comment::new("c1", "p2", "a", "x", ts(1));
        assert_eq!(
            rec.apply(ChangeEvent::Added(other)),
            ApplyOutcome::Ignored(IgnoreReason::ForeignParent)
        );
        assert!(rec.is_empty());
    }

    #[test]
    fn seen_window_expires() {
        let start = Instant::now();
        let mut rec: Reconciler<Comment> =
            Reconciler::with_seen_ttl("p1", OrderingPolicy::newest_first(), Duration::from_secs(60));
        rec.apply_at(ChangeEvent::Added(comment("c1", 1)), start);
        rec.apply_at(deleted("c1", 2), start);
        assert_eq!(
            rec.apply_at(ChangeEvent::Added(comment("c1", 1)), start + Duration::from_secs(30)),
            ApplyOutcome::Ignored(IgnoreReason::Duplicate)
        );
        // once the window rolls a redelivery is indistinguishable from a new add
        assert_eq!(
            rec.apply_at(ChangeEvent::Added(comment("c1", 1)), start + Duration::from_secs(61)),
            ApplyOutcome::Inserted
        );
    }

    #[test]
    fn snapshot_becomes_baseline_then_merges() {
        let mut rec = comments();
        assert!(!rec.has_baseline());
        let merge = rec.load_snapshot(vec![comment("c1", 1), comment("c2", 2), comment("c1", 1)]);
        assert_eq!(merge.inserted, 2);
        assert_eq!(merge.skipped, 1);
        assert!(rec.has_baseline());
        assert_eq!(ids(&rec), vec!["c2", "c1"]);

        rec.apply(ChangeEvent::Added(comment("c3", 3)));
        let merge = rec.load_snapshot(vec![comment("c1", 1)]);
        assert_eq!(merge.unchanged, 1);
        assert_eq!(ids(&rec), vec!["c3", "c2", "c1"]);
    }

    #[test]
    fn snapshot_is_authoritative_for_like_flag() {
        let mut rec = comments();
        rec.load_snapshot(vec![comment("c1", 1)]);
        let merge = rec.load_snapshot(vec![Comment {
            liked_by_current_user: true,
            likes_count: 1,
            ..comment("c1", 1)
        }]);
        assert_eq!(merge.replaced, 1);
        assert!(rec.get("c1").expect("present").liked_by_current_user);
    }

    #[test]
    fn stale_snapshot_does_not_resurrect_deleted() {
        let mut rec = comments();
        rec.load_snapshot(vec![comment("c1", 1), comment("c2", 2)]);
        rec.apply(deleted("c1", 5));
        let merge = rec.load_snapshot(vec![comment("c1", 1), comment("c2", 2)]);
        assert_eq!(merge.skipped, 1);
        assert_eq!(ids(&rec), vec!["c2"]);
    }

    #[test]
    fn snapshot_confirms_pending_keeping_local_like() {
        let mut rec = comments();
        rec.apply_local(LocalOp::Upsert(Comment {
            liked_by_current_user: true,
            ..comment("c1", 1)
        }));
        rec.load_snapshot(vec![comment("c1", 1)]);
        assert!(!rec.is_pending("c1"));
        assert!(rec.get("c1").expect("present").liked_by_current_user);
    }

    #[test]
    fn result_reports_and_clears_dirty_flag() {
        let mut rec = comments();
        assert!(!rec.result().mutated_since_persist);
        rec.apply(ChangeEvent::Added(comment("c1", 1)));
        let result = rec.result();
        assert!(result.mutated_since_persist);
        assert_eq!(result.collection.len(), 1);
        rec.mark_persisted();
        assert!(!rec.result().mutated_since_persist);
    }

    #[derive(Clone, Debug)]
    enum Step {
        Add(u8, i64),
        Update(u8, i64, i64),
        Delete(u8, i64),
        Like(u8, u32, u8),
        Unlike(u8, u32, u8),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..6, 0i64..4).prop_map(|(i, t)| Step::Add(i, t)),
            (0u8..6, 0i64..4, 0i64..50).prop_map(|(i, t, v)| Step::Update(i, t, v)),
            (0u8..6, 0i64..50).prop_map(|(i, t)| Step::Delete(i, t)),
            (0u8..6, 0u32..20, 0u8..4).prop_map(|(i, n, a)| Step::Like(i, n, a)),
            (0u8..6, 0u32..20, 0u8..4).prop_map(|(i, n, a)| Step::Unlike(i, n, a)),
        ]
    }

    fn to_event(step: &Step) -> ChangeEvent<Comment> {
        match step {
            Step::Add(i, t) => ChangeEvent::Added(comment(&format!("c{i}"), *t)),
            Step::Update(i, t, v) => {
                let mut c = comment(&format!("c{i}"), *t);
                c.updated_at = Some(ts(100 + v));
                c.content = format!("rev {v}");
                ChangeEvent::Updated(c)
            }
            Step::Delete(i, t) => deleted(&format!("c{i}"), *t),
            Step::Like(i, n, a) => liked(&format!("c{i}"), *n, &format!("u{a}")),
            Step::Unlike(i, n, a) => unliked(&format!("c{i}"), *n, &format!("u{a}")),
        }
    }

    proptest! {
        #[test]
        fn any_sequence_stays_sorted_and_unique(
            steps in prop::collection::vec(step(), 0..40),
            newest_first in any::<bool>(),
        ) {
            let policy = if newest_first {
                OrderingPolicy::newest_first()
            } else {
                OrderingPolicy::oldest_first()
            };
            let mut rec: Reconciler<Comment> = Reconciler::new("p1", policy);
            for step in &steps {
                rec.apply(to_event(step));
            }
            prop_assert!(policy.is_sorted(rec.items()));
            let unique: HashSet<&str> = rec.items().iter().map(|c| c.id.as_str()).collect();
            prop_assert_eq!(unique.len(), rec.len());
        }

        #[test]
        fn added_twice_equals_added_once(
            steps in prop::collection::vec(step(), 0..20),
            id in 0u8..6,
            t in 0i64..4,
        ) {
            let mut once: Reconciler<Comment> = comments();
            let mut twice: Reconciler<Comment> = comments();
            for step in &steps {
                once.apply(to_event(step));
                twice.apply(to_event(step));
            }
            let add = ChangeEvent::Added(comment(&format!("c{id}"), t));
            once.apply(add.clone());
            twice.apply(add.clone());
            twice.apply(add);
            prop_assert_eq!(once.items(), twice.items());
        }

        #[test]
        fn like_traffic_never_flips_own_flag(
            counts in prop::collection::vec((0u32..50, any::<bool>(), 0u8..5), 0..30),
            mine in any::<bool>(),
        ) {
            let mut rec = comments();
            rec.load_snapshot(vec![Comment { liked_by_current_user: mine, ..comment("c1", 1) }]);
            for (n, like, actor) in counts {
                let actor = format!("u{actor}");
                let event = if like { liked("c1", n, &actor) } else { unliked("c1", n, &actor) };
                rec.apply(event);
                prop_assert_eq!(rec.get("c1").map(|c| c.liked_by_current_user), Some(mine));
            }
        }

        #[test]
        fn unknown_delete_keeps_size_and_order(
            steps in prop::collection::vec(step(), 0..20),
        ) {
            let mut rec = comments();
            for step in &steps {
                rec.apply(to_event(step));
            }
            let before = rec.items().to_vec();
            rec.apply(deleted("never-seen", 1));
            prop_assert_eq!(rec.items(), before.as_slice());
        }
    }
}
