//! Per-parent sync sessions: snapshot, change stream, reconciliation and
//! cache persistence wired together.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use projsync_events::{ChangeFeed, FeedItem};
use projsync_protocol::{
    ChangeEvent, Comment, CreateCommentInput, DeleteEntityInput, Entity, EntityKind, LikeResult,
    ToggleLikeInput,
};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use crate::cache::{CacheKey, CacheStore, CacheWriter, PersistOutcome};
use crate::capability::Capabilities;
use crate::config::Settings;
use crate::demux::{Demultiplexer, Subscription};
use crate::error::SyncError;
use crate::gateway::MutationGateway;
use crate::notify::{NoopSink, Notice, NotificationSink};
use crate::reconcile::{
    ApplyOutcome, LocalOp, OrderingPolicy, ReconciliationResult, Reconciler, SnapshotMerge,
    SortDirection, DEFAULT_SEEN_TTL,
};
use crate::snapshot::{LoadState, SnapshotLoader, SnapshotSource};

/// Opens [`SyncSession`]s for one entity kind. Sessions opened from the same
/// engine share the snapshot loader (and its coalescing) and the cache writer.
pub struct SyncEngine<E: Entity> {
    loader: Arc<SnapshotLoader<E>>,
    demux: Demultiplexer<E>,
    cache: Arc<CacheWriter>,
    sink: Arc<dyn NotificationSink>,
    policy: OrderingPolicy,
    seen_ttl: Duration,
}

impl<E: Entity> SyncEngine<E> {
    pub fn new(
        source: Arc<dyn SnapshotSource<E>>,
        feed: Arc<dyn ChangeFeed<E>>,
        store: Arc<dyn CacheStore>,
        capabilities: Arc<dyn Capabilities>,
    ) -> Self {
        let policy = match E::KIND {
            EntityKind::Comment => OrderingPolicy::newest_first(),
            EntityKind::Task => OrderingPolicy::oldest_first(),
        };
        Self {
            loader: Arc::new(SnapshotLoader::new(source, capabilities)),
            demux: Demultiplexer::new(feed),
            cache: Arc::new(CacheWriter::new(store)),
            sink: Arc::new(NoopSink),
            policy,
            seen_ttl: DEFAULT_SEEN_TTL,
        }
    }

    pub fn with_settings(mut self, settings: &Settings) -> Self {
        let direction = match E::KIND {
            EntityKind::Comment => settings.comment_order,
            EntityKind::Task => settings.task_order,
        };
        self.policy = OrderingPolicy { direction };
        self.seen_ttl = settings.seen_ttl;
        self.demux = self
            .demux
            .with_dedupe_capacity(settings.dedupe_capacity)
            .with_channel_capacity(settings.channel_capacity);
        self
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_direction(mut self, direction: SortDirection) -> Self {
        self.policy = OrderingPolicy { direction };
        self
    }

    pub fn loader(&self) -> &Arc<SnapshotLoader<E>> {
        &self.loader
    }

    /// Subscribes to `parent_id` and loads its snapshot.
    ///
    /// The subscription is opened first so nothing published while the
    /// snapshot is in flight is missed. A denied view fails the open; any
    /// other snapshot failure is reported through the sink and the load state,
    /// and the session stays usable for [`SyncSession::reload`].
    ///
    /// When the change stream reports a gap the session reloads its snapshot
    /// in the background.
    pub async fn open(&self, parent_id: &str) -> Result<SyncSession<E>, SyncError> {
        let inner = Arc::new(SessionInner {
            parent_id: parent_id.to_string(),
            key: CacheKey::for_entity::<E>(parent_id),
            reconciler: Mutex::new(Reconciler::with_seen_ttl(parent_id, self.policy, self.seen_ttl)),
            closed: AtomicBool::new(false),
            cache: Arc::clone(&self.cache),
            version: AtomicU64::new(0),
            changes: watch::channel(0).0,
            resync: Notify::new(),
        });

        let sink_inner = Arc::clone(&inner);
        let subscription = self
            .demux
            .subscribe(parent_id, move |item| match item {
                FeedItem::Change(event) => sink_inner.apply_event(event),
                FeedItem::Gap { skipped } => {
                    debug!(parent_id = %sink_inner.parent_id, skipped, "change stream gap; resync queued");
                    sink_inner.resync.notify_one();
                }
            })
            .await?;
        self.loader.retain(parent_id);
        tokio::spawn(resync_worker(
            Arc::clone(&inner),
            Arc::clone(&self.loader),
            Arc::clone(&self.sink),
        ));

        let session = SyncSession {
            inner,
            subscription,
            loader: Arc::clone(&self.loader),
            sink: Arc::clone(&self.sink),
        };
        match session.reload().await {
            Ok(_) => {}
            Err(err @ SyncError::Forbidden(_)) => {
                session.close();
                return Err(err);
            }
            Err(err) => {
                session.sink.notify(
                    Notice::warning("snapshot_failed", err.to_string()).scoped(parent_id),
                );
            }
        }
        info!(parent_id, kind = E::KIND.as_str(), "sync session opened");
        Ok(session)
    }
}

struct SessionInner<E: Entity> {
    parent_id: String,
    key: CacheKey,
    reconciler: Mutex<Reconciler<E>>,
    closed: AtomicBool,
    cache: Arc<CacheWriter>,
    version: AtomicU64,
    changes: watch::Sender<u64>,
    resync: Notify,
}

impl<E: Entity> SessionInner<E> {
    async fn reload(&self, loader: &SnapshotLoader<E>) -> Result<SnapshotMerge, SyncError> {
        self.ensure_open()?;
        let entities = loader.load(&self.parent_id).await?;
        let mut rec = self.reconciler.lock();
        self.ensure_open()?;
        let merge = rec.load_snapshot(entities);
        self.persist(&mut rec);
        Ok(merge)
    }

    fn apply_event(&self, event: ChangeEvent<E>) {
        let mut rec = self.reconciler.lock();
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let outcome = rec.apply(event);
        if outcome.mutated() {
            self.persist(&mut rec);
        }
    }

    fn apply_local(&self, op: LocalOp<E>) -> Result<ApplyOutcome, SyncError> {
        let mut rec = self.reconciler.lock();
        self.ensure_open()?;
        let outcome = rec.apply_local(op);
        if outcome.mutated() {
            self.persist(&mut rec);
        }
        Ok(outcome)
    }

    fn persist(&self, rec: &mut Reconciler<E>) {
        if !rec.mutated_since_persist() {
            return;
        }
        let outcome = self.cache.persist(&self.key, rec.items());
        if let PersistOutcome::Skipped(reason) = &outcome {
            warn!(
                target: "projsync::session",
                parent_id = %self.parent_id,
                reason = %reason,
                "collection not persisted"
            );
        }
        rec.mark_persisted();
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.changes.send_replace(version);
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.closed.load(Ordering::Acquire) {
            Err(SyncError::Closed(self.parent_id.clone()))
        } else {
            Ok(())
        }
    }
}

/// Reloads the snapshot each time the change stream reports a gap. Gaps that
/// arrive during a reload queue one more.
async fn resync_worker<E: Entity>(
    inner: Arc<SessionInner<E>>,
    loader: Arc<SnapshotLoader<E>>,
    sink: Arc<dyn NotificationSink>,
) {
    loop {
        inner.resync.notified().await;
        if inner.closed.load(Ordering::Acquire) {
            break;
        }
        match inner.reload(&loader).await {
            Ok(merge) => info!(
                parent_id = %inner.parent_id,
                inserted = merge.inserted,
                replaced = merge.replaced,
                "resynced after change stream gap"
            ),
            Err(SyncError::Closed(_)) => break,
            Err(err) => {
                warn!(
                    target: "projsync::session",
                    parent_id = %inner.parent_id,
                    error = %err,
                    "resync failed"
                );
                sink.notify(Notice::warning("resync_failed", err.to_string()).scoped(&inner.parent_id));
            }
        }
    }
    debug!(parent_id = %inner.parent_id, "resync worker stopped");
}

/// Live view of one parent's collection. Dropping it closes it.
pub struct SyncSession<E: Entity> {
    inner: Arc<SessionInner<E>>,
    subscription: Subscription,
    loader: Arc<SnapshotLoader<E>>,
    sink: Arc<dyn NotificationSink>,
}

impl<E: Entity> SyncSession<E> {
    pub fn parent_id(&self) -> &str {
        &self.inner.parent_id
    }

    pub fn cache_key(&self) -> &CacheKey {
        &self.inner.key
    }

    pub fn items(&self) -> Vec<E> {
        self.inner.reconciler.lock().items().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<E> {
        self.inner.reconciler.lock().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.reconciler.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.inner.reconciler.lock().is_pending(id)
    }

    pub fn result(&self) -> ReconciliationResult<E> {
        self.inner.reconciler.lock().result()
    }

    pub fn has_baseline(&self) -> bool {
        self.inner.reconciler.lock().has_baseline()
    }

    pub fn load_state(&self) -> watch::Receiver<LoadState> {
        self.loader.state(&self.inner.parent_id)
    }

    /// Ticks once per persisted change.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Folds in a fresh snapshot. A failed fetch leaves the collection as it was.
    pub async fn reload(&self) -> Result<SnapshotMerge, SyncError> {
        self.inner.reload(&self.loader).await
    }

    /// Applies a change this client made before the server confirmed it.
    pub fn apply_local(&self, op: LocalOp<E>) -> Result<ApplyOutcome, SyncError> {
        self.inner.apply_local(op)
    }

    /// Applies an entity the server just returned as if its own change event
    /// had arrived. The broadcast copy is then dropped as a duplicate.
    pub fn apply_confirmed(&self, event: ChangeEvent<E>) -> Result<ApplyOutcome, SyncError> {
        self.inner.ensure_open()?;
        let mut rec = self.inner.reconciler.lock();
        self.inner.ensure_open()?;
        let outcome = rec.apply(event);
        if outcome.mutated() {
            self.inner.persist(&mut rec);
        }
        Ok(outcome)
    }

    /// Removes `id` right away and deletes it on the server. On failure the
    /// entity is put back and a notice is emitted.
    pub async fn delete(&self, gateway: &MutationGateway, id: &str) -> Result<(), SyncError> {
        let removed = self.get(id);
        self.apply_local(LocalOp::Remove(id.to_string()))?;
        let input = DeleteEntityInput {
            parent_id: self.inner.parent_id.clone(),
            id: id.to_string(),
        };
        match gateway.delete_entity(E::KIND, input).await {
            Ok(()) => Ok(()),
            Err(err) => {
                if let Some(entity) = removed {
                    if let Err(closed) = self.apply_local(LocalOp::Upsert(entity)) {
                        debug!(error = %closed, "session closed before delete was reverted");
                    }
                }
                self.sink.notify(
                    Notice::error("delete_failed", err.to_string()).scoped(self.parent_id()),
                );
                Err(err)
            }
        }
    }

    /// Stops applying events. The collection stays readable; in-flight
    /// mutations finish but no longer touch it.
    pub fn close(&self) {
        {
            let _rec = self.inner.reconciler.lock();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return;
            }
        }
        self.subscription.unsubscribe();
        self.inner.resync.notify_one();
        self.loader.release(&self.inner.parent_id);
        self.inner.cache.forget(&self.inner.key);
        debug!(parent_id = %self.inner.parent_id, "sync session closed");
    }
}

impl SyncSession<Comment> {
    /// Creates a comment and shows it without waiting for the broadcast.
    pub async fn create_comment(
        &self,
        gateway: &MutationGateway,
        content: impl Into<String>,
    ) -> Result<Comment, SyncError> {
        self.inner.ensure_open()?;
        let comment = gateway
            .create_comment(CreateCommentInput {
                project_id: self.inner.parent_id.clone(),
                content: content.into(),
            })
            .await?;
        if let Err(err) = self.apply_confirmed(ChangeEvent::Added(comment.clone())) {
            debug!(error = %err, "created comment not applied to closed session");
        }
        Ok(comment)
    }

    /// Flips this user's like right away, then asks the server. The server's
    /// flag and count win; a failure reverts the flip and emits a notice.
    pub async fn toggle_like(
        &self,
        gateway: &MutationGateway,
        comment_id: &str,
    ) -> Result<LikeResult, SyncError> {
        let previous = self
            .get(comment_id)
            .map(|c| c.liked_by_current_user)
            .ok_or_else(|| SyncError::NotFound(comment_id.to_string()))?;
        self.apply_local(LocalOp::SetLiked {
            id: comment_id.to_string(),
            liked: !previous,
        })?;

        let input = ToggleLikeInput {
            project_id: self.inner.parent_id.clone(),
            comment_id: comment_id.to_string(),
        };
        match gateway.toggle_like(input).await {
            Ok(result) => {
                let confirm = LocalOp::ConfirmLike {
                    id: comment_id.to_string(),
                    liked: result.liked,
                    likes_count: result.likes_count,
                };
                if let Err(closed) = self.apply_local(confirm) {
                    debug!(error = %closed, "session closed before like was confirmed");
                }
                Ok(result)
            }
            Err(err) => {
                warn!(
                    target: "projsync::session",
                    parent_id = %self.inner.parent_id,
                    comment_id,
                    error = %err,
                    "like toggle failed; reverting"
                );
                let revert = LocalOp::SetLiked {
                    id: comment_id.to_string(),
                    liked: previous,
                };
                if let Err(closed) = self.apply_local(revert) {
                    debug!(error = %closed, "session closed before like was reverted");
                }
                self.sink.notify(
                    Notice::error("like_failed", err.to_string()).scoped(self.parent_id()),
                );
                Err(err)
            }
        }
    }
}

impl<E: Entity> Drop for SyncSession<E> {
    fn drop(&mut self) {
        self.close();
    }
}
