//! Fans the per-kind change streams of one parent id into a single ordered
//! callback.

use std::sync::Arc;

use futures_util::StreamExt;
use projsync_events::{ChangeFeed, FeedItem};
use projsync_protocol::Entity;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::dedupe::RecentKeys;
use crate::error::SyncError;

const METRIC_REDELIVERIES_DROPPED: &str = "projsync_demux_redeliveries_dropped";

pub const DEFAULT_DEDUPE_CAPACITY: usize = 1024;
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

pub struct Demultiplexer<E: Entity> {
    feed: Arc<dyn ChangeFeed<E>>,
    dedupe_capacity: usize,
    channel_capacity: usize,
}

impl<E: Entity> Clone for Demultiplexer<E> {
    fn clone(&self) -> Self {
        Self {
            feed: Arc::clone(&self.feed),
            dedupe_capacity: self.dedupe_capacity,
            channel_capacity: self.channel_capacity,
        }
    }
}

impl<E: Entity> Demultiplexer<E> {
    pub fn new(feed: Arc<dyn ChangeFeed<E>>) -> Self {
        Self {
            feed,
            dedupe_capacity: DEFAULT_DEDUPE_CAPACITY,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_dedupe_capacity(mut self, capacity: usize) -> Self {
        self.dedupe_capacity = capacity.max(1);
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Opens one stream per event kind of `E` for `parent_id` and delivers every
    /// distinct event to `on_event`, one at a time, in arrival order. Gaps
    /// reported by a stream are delivered as they come.
    ///
    /// Fails only if a stream cannot be opened; nothing is spawned in that case.
    pub async fn subscribe<F>(&self, parent_id: &str, mut on_event: F) -> Result<Subscription, SyncError>
    where
        F: FnMut(FeedItem<E>) + Send + 'static,
    {
        let kinds = E::KIND.event_kinds();
        let mut streams = Vec::with_capacity(kinds.len());
        for &kind in kinds {
            let stream = self.feed.open(parent_id, kind).await.map_err(|err| {
                warn!(
                    target: "projsync::demux",
                    parent_id,
                    kind = kind.as_str(),
                    error = %err,
                    "failed to open change stream"
                );
                SyncError::from(err)
            })?;
            streams.push((kind, stream));
        }

        let token = CancellationToken::new();
        let (tx, mut rx) = mpsc::channel::<FeedItem<E>>(self.channel_capacity);
        let mut tasks = Vec::with_capacity(streams.len() + 1);

        for (kind, mut stream) in streams {
            let tx = tx.clone();
            let cancel = token.clone();
            let parent = parent_id.to_string();
            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        next = stream.next() => match next {
                            Some(item) => {
                                if tx.send(item).await.is_err() {
                                    break;
                                }
                            }
                            None => {
                                info!(
                                    parent_id = %parent,
                                    kind = kind.as_str(),
                                    "change stream ended"
                                );
                                break;
                            }
                        },
                    }
                }
            }));
        }
        drop(tx);

        let cancel = token.clone();
        let parent = parent_id.to_string();
        let mut recent = RecentKeys::with_capacity(self.dedupe_capacity);
        tasks.push(tokio::spawn(async move {
            loop {
                let item = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => match next {
                        Some(item) => item,
                        None => break,
                    },
                };
                if cancel.is_cancelled() {
                    break;
                }
                if let FeedItem::Change(event) = &item {
                    if let Some(key) = event.key() {
                        if !recent.insert(key) {
                            metrics::counter!(METRIC_REDELIVERIES_DROPPED).increment(1);
                            debug!(
                                parent_id = %parent,
                                kind = event.kind().as_str(),
                                id = event.entity_id(),
                                "redelivered event dropped"
                            );
                            continue;
                        }
                    }
                }
                on_event(item);
            }
            debug!(parent_id = %parent, "demultiplexer stopped");
        }));

        debug!(parent_id, "change streams subscribed");
        Ok(Subscription {
            parent_id: parent_id.to_string(),
            token,
            tasks,
        })
    }
}

/// Handle for a live subscription. Dropping it unsubscribes.
pub struct Subscription {
    parent_id: String,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Subscription {
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Stops delivery; no callback starts after this returns.
    pub fn unsubscribe(&self) {
        if !self.token.is_cancelled() {
            debug!(parent_id = %self.parent_id, "unsubscribing");
        }
        self.token.cancel();
    }

    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Unsubscribes and waits for every forwarding task to exit.
    pub async fn shutdown(mut self) {
        self.unsubscribe();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
