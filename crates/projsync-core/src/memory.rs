//! In-process backend: answers snapshots and mutations from memory and
//! announces every accepted write on the bus, the way a real server would
//! push it to subscribed clients.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use projsync_events::{publish_change, Bus};
use projsync_protocol::{
    ChangeEvent, Comment, CreateCommentInput, CreateTaskInput, Credential, DeleteEntityInput,
    DeletedPayload, Entity, ErrorCode, LikeAction, LikePayload, LikeResult, Liker,
    MutationRequest, MutationResponse, Operation, SnapshotRequest, SnapshotResponse, Task,
    ToggleLikeInput, UpdateCommentInput, UpdateTaskInput, LIKERS_PREVIEW_CAP,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::SyncError;
use crate::gateway::{CredentialProvider, MutationService};
use crate::snapshot::SnapshotSource;

#[derive(Default)]
struct BackendState {
    comments: BTreeMap<String, Comment>,
    tasks: BTreeMap<String, Task>,
    likes: BTreeMap<String, BTreeSet<String>>,
    tokens: HashSet<String>,
    next_id: u64,
    next_token: u64,
    offline: bool,
}

impl BackendState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{}", self.next_id)
    }

    /// Comment as seen by `viewer`, with the likers preview filled in.
    fn comment_for(&self, comment: &Comment, viewer: &str) -> Comment {
        let mut out = comment.clone();
        let likers = self.likes.get(&comment.id);
        out.likes_count = likers.map(|set| set.len() as u32).unwrap_or(0);
        out.liked_by_current_user = likers.is_some_and(|set| set.contains(viewer));
        out.likers = likers
            .map(|set| set.iter().take(LIKERS_PREVIEW_CAP).map(Liker::new).collect())
            .unwrap_or_default();
        out
    }
}

pub struct MemoryBackend {
    bus: Bus,
    user_id: String,
    state: Mutex<BackendState>,
}

impl MemoryBackend {
    /// `user_id` is the viewer every snapshot and like result is computed for.
    pub fn new(bus: Bus, user_id: impl Into<String>) -> Self {
        Self {
            bus,
            user_id: user_id.into(),
            state: Mutex::new(BackendState::default()),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Inserts without announcing, as if it existed before anyone subscribed.
    pub fn seed_comment(&self, comment: Comment) {
        self.state.lock().comments.insert(comment.id.clone(), comment);
    }

    pub fn seed_task(&self, task: Task) {
        self.state.lock().tasks.insert(task.id.clone(), task);
    }

    pub fn issue_token(&self, ttl: Duration) -> Credential {
        let mut state = self.state.lock();
        state.next_token += 1;
        let token = format!("tok-{}", state.next_token);
        state.tokens.insert(token.clone());
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::hours(1));
        Credential::new(token, Utc::now() + ttl)
    }

    pub fn revoke(&self, token: &str) {
        self.state.lock().tokens.remove(token);
    }

    /// While offline every snapshot and mutation fails as a transport error.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Another user toggles a like; only the shared counters are announced.
    pub fn like_as(&self, comment_id: &str, actor_id: &str, like: bool) -> Result<u32, SyncError> {
        let payload = {
            let mut state = self.state.lock();
            let comment = state
                .comments
                .get(comment_id)
                .cloned()
                .ok_or_else(|| SyncError::NotFound(comment_id.to_string()))?;
            let set = state.likes.entry(comment_id.to_string()).or_default();
            if like {
                set.insert(actor_id.to_string());
            } else {
                set.remove(actor_id);
            }
            like_payload(&state, &comment, actor_id, like)
        };
        let count = payload.likes_count;
        self.announce(&ChangeEvent::<Comment>::from_like(payload));
        Ok(count)
    }

    pub fn comment(&self, id: &str) -> Option<Comment> {
        let state = self.state.lock();
        state
            .comments
            .get(id)
            .map(|comment| state.comment_for(comment, &self.user_id))
    }

    pub fn task(&self, id: &str) -> Option<Task> {
        self.state.lock().tasks.get(id).cloned()
    }

    fn announce<E: Entity>(&self, event: &ChangeEvent<E>) {
        if let Err(err) = publish_change(&self.bus, event) {
            warn!(target: "projsync::memory", error = %err, "change not announced");
        }
    }

    fn handle(&self, operation: Operation, payload: Value) -> Result<Value, (ErrorCode, String)> {
        match operation {
            Operation::CreateComment => {
                let input: CreateCommentInput = decode(payload)?;
                if input.content.trim().is_empty() {
                    return Err((ErrorCode::Validation, "content is empty".into()));
                }
                let comment = {
                    let mut state = self.state.lock();
                    let id = state.next_id("c");
                    let comment =
                        Comment::new(id, input.project_id, self.user_id.clone(), input.content, Utc::now());
                    state.comments.insert(comment.id.clone(), comment.clone());
                    comment
                };
                self.announce(&ChangeEvent::Added(comment.clone()));
                encode(&comment)
            }
            Operation::UpdateComment => {
                let input: UpdateCommentInput = decode(payload)?;
                let comment = {
                    let mut state = self.state.lock();
                    let stored = state
                        .comments
                        .get_mut(&input.comment_id)
                        .filter(|c| c.project_id == input.project_id)
                        .ok_or_else(|| not_found(&input.comment_id))?;
                    stored.content = input.content;
                    stored.updated_at = Some(Utc::now());
                    let stored = stored.clone();
                    state.comment_for(&stored, &self.user_id)
                };
                let mut broadcast = comment.clone();
                broadcast.liked_by_current_user = false;
                self.announce(&ChangeEvent::Updated(broadcast));
                encode(&comment)
            }
            Operation::ToggleLike => {
                let input: ToggleLikeInput = decode(payload)?;
                let (result, payload) = {
                    let mut state = self.state.lock();
                    let comment = state
                        .comments
                        .get(&input.comment_id)
                        .filter(|c| c.project_id == input.project_id)
                        .cloned()
                        .ok_or_else(|| not_found(&input.comment_id))?;
                    let set = state.likes.entry(comment.id.clone()).or_default();
                    let liked = if set.contains(&self.user_id) {
                        set.remove(&self.user_id);
                        false
                    } else {
                        set.insert(self.user_id.clone());
                        true
                    };
                    let payload = like_payload(&state, &comment, &self.user_id, liked);
                    let result = LikeResult {
                        comment_id: comment.id,
                        liked,
                        likes_count: payload.likes_count,
                    };
                    (result, payload)
                };
                self.announce(&ChangeEvent::<Comment>::from_like(payload));
                encode(&result)
            }
            Operation::CreateTask => {
                let input: CreateTaskInput = decode(payload)?;
                if input.title.trim().is_empty() {
                    return Err((ErrorCode::Validation, "title is empty".into()));
                }
                let task = {
                    let mut state = self.state.lock();
                    let id = state.next_id("t");
                    let mut task = Task::new(id, input.project_id, input.title, Utc::now());
                    task.description = input.description;
                    task.assignee_id = input.assignee_id;
                    state.tasks.insert(task.id.clone(), task.clone());
                    task
                };
                self.announce(&ChangeEvent::Added(task.clone()));
                encode(&task)
            }
            Operation::UpdateTask => {
                let input: UpdateTaskInput = decode(payload)?;
                let task = {
                    let mut state = self.state.lock();
                    let stored = state
                        .tasks
                        .get_mut(&input.task_id)
                        .filter(|t| t.project_id == input.project_id)
                        .ok_or_else(|| not_found(&input.task_id))?;
                    if let Some(title) = input.title {
                        stored.title = title;
                    }
                    if let Some(description) = input.description {
                        stored.description = Some(description);
                    }
                    if let Some(status) = input.status {
                        stored.status = status;
                    }
                    if let Some(assignee) = input.assignee_id {
                        stored.assignee_id = Some(assignee);
                    }
                    stored.updated_at = Some(Utc::now());
                    stored.clone()
                };
                self.announce(&ChangeEvent::Updated(task.clone()));
                encode(&task)
            }
            Operation::DeleteComment => {
                let input: DeleteEntityInput = decode(payload)?;
                {
                    let mut state = self.state.lock();
                    state
                        .comments
                        .remove(&input.id)
                        .ok_or_else(|| not_found(&input.id))?;
                    state.likes.remove(&input.id);
                }
                self.announce(&ChangeEvent::<Comment>::Deleted(deleted(&input)));
                Ok(Value::Null)
            }
            Operation::DeleteTask => {
                let input: DeleteEntityInput = decode(payload)?;
                self.state
                    .lock()
                    .tasks
                    .remove(&input.id)
                    .ok_or_else(|| not_found(&input.id))?;
                self.announce(&ChangeEvent::<Task>::Deleted(deleted(&input)));
                Ok(Value::Null)
            }
        }
    }
}

fn like_payload(state: &BackendState, comment: &Comment, actor_id: &str, liked: bool) -> LikePayload {
    let view = state.comment_for(comment, actor_id);
    LikePayload {
        id: comment.id.clone(),
        parent_id: comment.project_id.clone(),
        likes_count: view.likes_count,
        likers: view.likers,
        actor_id: actor_id.to_string(),
        action: if liked { LikeAction::Like } else { LikeAction::Unlike },
    }
}

fn deleted(input: &DeleteEntityInput) -> DeletedPayload {
    DeletedPayload {
        id: input.id.clone(),
        parent_id: input.parent_id.clone(),
        deleted_at: Utc::now(),
    }
}

fn not_found(id: &str) -> (ErrorCode, String) {
    (ErrorCode::NotFound, format!("{id} not found"))
}

fn decode<T: DeserializeOwned>(payload: Value) -> Result<T, (ErrorCode, String)> {
    serde_json::from_value(payload).map_err(|err| (ErrorCode::Validation, err.to_string()))
}

fn encode<T: Serialize>(value: &T) -> Result<Value, (ErrorCode, String)> {
    serde_json::to_value(value).map_err(|err| (ErrorCode::Unavailable, err.to_string()))
}

#[async_trait::async_trait]
impl SnapshotSource<Comment> for MemoryBackend {
    async fn fetch(&self, request: SnapshotRequest) -> Result<SnapshotResponse<Comment>, SyncError> {
        let state = self.state.lock();
        if state.offline {
            return Err(SyncError::TransientNetwork("backend offline".into()));
        }
        let entities = state
            .comments
            .values()
            .filter(|c| c.project_id == request.parent_id)
            .map(|c| state.comment_for(c, &self.user_id))
            .collect();
        Ok(SnapshotResponse::new(entities))
    }
}

#[async_trait::async_trait]
impl SnapshotSource<Task> for MemoryBackend {
    async fn fetch(&self, request: SnapshotRequest) -> Result<SnapshotResponse<Task>, SyncError> {
        let state = self.state.lock();
        if state.offline {
            return Err(SyncError::TransientNetwork("backend offline".into()));
        }
        let entities = state
            .tasks
            .values()
            .filter(|t| t.project_id == request.parent_id)
            .cloned()
            .collect();
        Ok(SnapshotResponse::new(entities))
    }
}

#[async_trait::async_trait]
impl MutationService for MemoryBackend {
    async fn execute(&self, request: MutationRequest) -> Result<MutationResponse, SyncError> {
        {
            let state = self.state.lock();
            if state.offline {
                return Err(SyncError::TransientNetwork("backend offline".into()));
            }
            if !state.tokens.contains(&request.credential.token)
                || request.credential.expires_at <= Utc::now()
            {
                debug!(operation = request.operation.as_str(), "credential rejected");
                return Ok(MutationResponse::err(ErrorCode::Unauthenticated));
            }
        }
        let response = match self.handle(request.operation, request.payload) {
            Ok(result) => MutationResponse::ok(result),
            Err((error_code, message)) => MutationResponse::Err {
                error_code,
                message: Some(message),
            },
        };
        Ok(response)
    }
}

/// Credential holder that obtains tokens from a [`MemoryBackend`].
pub struct MemoryCredentials {
    backend: Arc<MemoryBackend>,
    current: Mutex<Option<Credential>>,
    ttl: Duration,
    refreshes: AtomicUsize,
}

impl MemoryCredentials {
    pub fn new(backend: Arc<MemoryBackend>, ttl: Duration) -> Self {
        Self {
            backend,
            current: Mutex::new(None),
            ttl,
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn set_current(&self, credential: Option<Credential>) {
        *self.current.lock() = credential;
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl CredentialProvider for MemoryCredentials {
    fn current(&self) -> Option<Credential> {
        self.current.lock().clone()
    }

    async fn refresh(&self) -> Result<Credential, SyncError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let credential = self.backend.issue_token(self.ttl);
        *self.current.lock() = Some(credential.clone());
        Ok(credential)
    }
}
