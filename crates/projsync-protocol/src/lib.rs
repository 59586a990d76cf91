//! Shared data model for the projsync engine.
//!
//! Everything that crosses a seam between the snapshot source, the push
//! channel, the mutation service and the local cache is defined here as a
//! plain serde type. The wire encoding itself is owned by the services; these
//! types describe payloads that are already decoded.

pub mod entity;
pub mod event;
pub mod mutation;

pub use entity::{
    Comment, Entity, EntityKind, Liker, Task, TaskStatus, LIKERS_PREVIEW_CAP,
};
pub use event::{ChangeEvent, DeletedPayload, EventKey, EventKind, LikeAction, LikePayload};
pub use mutation::{
    CreateCommentInput, CreateTaskInput, Credential, DeleteEntityInput, ErrorCode, LikeResult,
    MutationRequest, MutationResponse, Operation, ToggleLikeInput, UpdateCommentInput,
    UpdateTaskInput,
};

use serde::{Deserialize, Serialize};

pub type EntityId = String;
pub type ParentId = String;

/// Request for the authoritative collection under one parent.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub parent_id: ParentId,
}

impl SnapshotRequest {
    pub fn new(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: parent_id.into(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse<E> {
    #[serde(default)]
    pub entities: Vec<E>,
}

impl<E> SnapshotResponse<E> {
    pub fn new(entities: Vec<E>) -> Self {
        Self { entities }
    }
}
