//! Push-channel seam and its in-process implementation over [`Bus`].

use std::marker::PhantomData;
use std::pin::Pin;

use futures_util::{Stream, StreamExt};
use projsync_protocol::{ChangeEvent, DeletedPayload, Entity, EventKind, LikePayload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, warn};

use crate::{Bus, Envelope};

pub type EventStream<E> = Pin<Box<dyn Stream<Item = FeedItem<E>> + Send + 'static>>;

/// One item off a change stream.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedItem<E> {
    Change(ChangeEvent<E>),
    /// The channel dropped `skipped` messages; state built from it is stale.
    Gap { skipped: u64 },
}

impl<E> From<ChangeEvent<E>> for FeedItem<E> {
    fn from(event: ChangeEvent<E>) -> Self {
        FeedItem::Change(event)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FeedError {
    #[error("no topic for {entity_set}.{kind}")]
    UnknownTopic {
        entity_set: &'static str,
        kind: &'static str,
    },
    #[error("feed unavailable: {0}")]
    Unavailable(String),
}

/// Source of per-kind change streams for one parent id.
///
/// Streams may redeliver the same payload; deduplication happens downstream.
/// A stream that loses messages yields [`FeedItem::Gap`] and keeps going.
#[async_trait::async_trait]
pub trait ChangeFeed<E: Entity>: Send + Sync {
    async fn open(&self, parent_id: &str, kind: EventKind) -> Result<EventStream<E>, FeedError>;
}

/// Wire wrapper for Added/Updated payloads.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EntityPayload<E> {
    pub entity: E,
}

/// [`ChangeFeed`] backed by the in-process broadcast bus.
pub struct BusFeed<E> {
    bus: Bus,
    _entity: PhantomData<fn() -> E>,
}

impl<E> BusFeed<E> {
    pub fn new(bus: Bus) -> Self {
        Self {
            bus,
            _entity: PhantomData,
        }
    }
}

impl<E> Clone for BusFeed<E> {
    fn clone(&self) -> Self {
        Self::new(self.bus.clone())
    }
}

fn topic_for<E: Entity>(kind: EventKind) -> Result<&'static str, FeedError> {
    let entity_set = E::KIND.entity_set();
    projsync_topics::change_topic(entity_set, kind.as_str()).ok_or(FeedError::UnknownTopic {
        entity_set,
        kind: kind.as_str(),
    })
}

fn decode<E: Entity>(kind: EventKind, payload: Value) -> Result<ChangeEvent<E>, serde_json::Error> {
    let event = match kind {
        EventKind::Added => {
            ChangeEvent::Added(serde_json::from_value::<EntityPayload<E>>(payload)?.entity)
        }
        EventKind::Updated => {
            ChangeEvent::Updated(serde_json::from_value::<EntityPayload<E>>(payload)?.entity)
        }
        EventKind::Deleted => ChangeEvent::Deleted(serde_json::from_value::<DeletedPayload>(payload)?),
        EventKind::Liked | EventKind::Unliked => {
            ChangeEvent::from_like(serde_json::from_value::<LikePayload>(payload)?)
        }
    };
    Ok(event)
}

fn accept<E: Entity>(
    item: Result<Envelope, BroadcastStreamRecvError>,
    topic: &str,
    parent_id: &str,
    kind: EventKind,
) -> Option<FeedItem<E>> {
    let env = match item {
        Ok(env) => env,
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            warn!(
                target: "projsync::feed",
                topic,
                parent_id,
                skipped,
                "bus receiver lagged; events dropped"
            );
            return Some(FeedItem::Gap { skipped });
        }
    };
    if env.kind != topic || env.parent_id.as_deref() != Some(parent_id) {
        return None;
    }
    match decode::<E>(kind, env.payload) {
        Ok(event) if event.kind() == kind && event.parent_id() == parent_id => {
            Some(FeedItem::Change(event))
        }
        Ok(event) => {
            debug!(
                topic,
                parent_id,
                got = event.kind().as_str(),
                "event does not match its channel; skipped"
            );
            None
        }
        Err(err) => {
            warn!(
                target: "projsync::feed",
                topic,
                parent_id,
                error = %err,
                "undecodable change payload skipped"
            );
            None
        }
    }
}

#[async_trait::async_trait]
impl<E: Entity> ChangeFeed<E> for BusFeed<E> {
    async fn open(&self, parent_id: &str, kind: EventKind) -> Result<EventStream<E>, FeedError> {
        let topic = topic_for::<E>(kind)?;
        let parent = parent_id.to_string();
        let stream = BroadcastStream::new(self.bus.subscribe())
            .filter_map(move |item| std::future::ready(accept::<E>(item, topic, &parent, kind)));
        Ok(Box::pin(stream))
    }
}

/// Publishes a change event on the bus under its canonical topic.
pub fn publish_change<E: Entity>(bus: &Bus, event: &ChangeEvent<E>) -> Result<(), FeedError> {
    let topic = topic_for::<E>(event.kind())?;
    let parent_id = event.parent_id();
    match event {
        ChangeEvent::Added(entity) | ChangeEvent::Updated(entity) => {
            bus.publish_scoped(topic, parent_id, &EntityPayload { entity });
        }
        ChangeEvent::Deleted(payload) => bus.publish_scoped(topic, parent_id, payload),
        ChangeEvent::Liked(payload) | ChangeEvent::Unliked(payload) => {
            bus.publish_scoped(topic, parent_id, payload)
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use projsync_protocol::{Comment, LikeAction, Liker};
    use serde_json::json;
    use tokio::time::{timeout, Duration};

    fn comment(id: &str, parent: &str) -> Comment {
        let at = Utc.timestamp_opt(100, 0).single().expect("valid timestamp");
        Comment::new(id, parent, "u1", "hello", at)
    }

    #[tokio::test]
    async fn bus_feed_filters_by_topic_and_parent() {
        let bus = Bus::new(32);
        let feed = BusFeed::<Comment>::new(bus.clone());
        let mut added = feed.open("p1", EventKind::Added).await.expect("open");

        publish_change(&bus, &ChangeEvent::Added(comment("c0", "p2"))).expect("publish");
        publish_change(&bus, &ChangeEvent::Updated(comment("c1", "p1"))).expect("publish");
        publish_change(&bus, &ChangeEvent::Added(comment("c2", "p1"))).expect("publish");

        let event = timeout(Duration::from_secs(1), added.next())
            .await
            .expect("event in time")
            .expect("stream open");
        assert_eq!(event, FeedItem::Change(ChangeEvent::Added(comment("c2", "p1"))));
    }

    #[tokio::test]
    async fn bus_feed_skips_undecodable_payloads() {
        let bus = Bus::new(32);
        let feed = BusFeed::<Comment>::new(bus.clone());
        let mut deleted = feed.open("p1", EventKind::Deleted).await.expect("open");

        bus.publish_scoped(projsync_topics::TOPIC_COMMENTS_DELETED, "p1", &json!({"bogus": 1}));
        bus.publish_scoped(
            projsync_topics::TOPIC_COMMENTS_DELETED,
            "p1",
            &json!({"id": "c1", "parentId": "p1", "deletedAt": "2024-05-20T12:00:00Z"}),
        );

        let event = timeout(Duration::from_secs(1), deleted.next())
            .await
            .expect("event in time")
            .expect("stream open");
        match event {
            FeedItem::Change(event) => {
                assert_eq!(event.entity_id(), "c1");
                assert_eq!(event.kind(), EventKind::Deleted);
            }
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[tokio::test]
    async fn like_channel_rejects_mismatched_action() {
        let bus = Bus::new(32);
        let feed = BusFeed::<Comment>::new(bus.clone());
        let mut liked = feed.open("p1", EventKind::Liked).await.expect("open");

        let mut payload = LikePayload {
            id: "c1".into(),
            parent_id: "p1".into(),
            likes_count: 1,
            likers: vec![Liker::new("u2")],
            actor_id: "u2".into(),
            action: LikeAction::Unlike,
        };
        bus.publish_scoped(projsync_topics::TOPIC_COMMENTS_LIKED, "p1", &payload);
        payload.action = LikeAction::Like;
        payload.likes_count = 2;
        bus.publish_scoped(projsync_topics::TOPIC_COMMENTS_LIKED, "p1", &payload);

        let event = timeout(Duration::from_secs(1), liked.next())
            .await
            .expect("event in time")
            .expect("stream open");
        match event {
            FeedItem::Change(ChangeEvent::Liked(p)) => assert_eq!(p.likes_count, 2),
            other => panic!("unexpected item {other:?}"),
        }
    }

    #[tokio::test]
    async fn lagging_receiver_reports_a_gap() {
        let bus = Bus::new(1);
        let feed = BusFeed::<Comment>::new(bus.clone());
        let mut added = feed.open("p1", EventKind::Added).await.expect("open");

        for id in ["c1", "c2", "c3"] {
            publish_change(&bus, &ChangeEvent::Added(comment(id, "p1"))).expect("publish");
        }

        let first = timeout(Duration::from_secs(1), added.next())
            .await
            .expect("item in time")
            .expect("stream open");
        assert_eq!(first, FeedItem::Gap { skipped: 2 });
        let next = timeout(Duration::from_secs(1), added.next())
            .await
            .expect("item in time")
            .expect("stream open");
        assert_eq!(next, FeedItem::Change(ChangeEvent::Added(comment("c3", "p1"))));
    }
}
