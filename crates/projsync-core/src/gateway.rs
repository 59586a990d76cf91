//! Authenticated mutations with a single shared credential refresh.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use projsync_protocol::{
    Comment, CreateCommentInput, CreateTaskInput, Credential, DeleteEntityInput, EntityKind,
    ErrorCode, LikeResult, MutationRequest, MutationResponse, Operation, Task, ToggleLikeInput,
    UpdateCommentInput, UpdateTaskInput,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::Capabilities;
use crate::config::Settings;
use crate::error::SyncError;
use crate::singleflight::{FlightRole, Singleflight};

const REFRESH_FLIGHT: &str = "credential.refresh";
const METRIC_REFRESHES: &str = "projsync_credential_refreshes";

pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_CREDENTIAL_SKEW: Duration = Duration::from_secs(30);

/// Remote write endpoint. Transport failures come back as
/// [`SyncError::TransientNetwork`]; service-level failures as
/// [`MutationResponse::Err`].
#[async_trait::async_trait]
pub trait MutationService: Send + Sync {
    async fn execute(&self, request: MutationRequest) -> Result<MutationResponse, SyncError>;
}

/// Holder of the bearer credential. `refresh` must store what it returns so
/// that `current` sees it afterwards.
#[async_trait::async_trait]
pub trait CredentialProvider: Send + Sync {
    fn current(&self) -> Option<Credential>;
    async fn refresh(&self) -> Result<Credential, SyncError>;
}

type RefreshResult = Result<Credential, SyncError>;

pub struct MutationGateway {
    service: Arc<dyn MutationService>,
    credentials: Arc<dyn CredentialProvider>,
    capabilities: Arc<dyn Capabilities>,
    refreshes: Singleflight<RefreshResult>,
    refresh_timeout: Duration,
    skew: Duration,
}

impl MutationGateway {
    pub fn new(
        service: Arc<dyn MutationService>,
        credentials: Arc<dyn CredentialProvider>,
        capabilities: Arc<dyn Capabilities>,
    ) -> Self {
        Self {
            service,
            credentials,
            capabilities,
            refreshes: Singleflight::new(REFRESH_FLIGHT),
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            skew: DEFAULT_CREDENTIAL_SKEW,
        }
    }

    pub fn with_refresh_timeout(mut self, timeout: Duration) -> Self {
        self.refresh_timeout = timeout;
        self
    }

    pub fn with_credential_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    pub fn with_settings(self, settings: &Settings) -> Self {
        self.with_refresh_timeout(settings.refresh_timeout)
            .with_credential_skew(settings.credential_skew)
    }

    pub fn refresh_pending(&self) -> bool {
        self.refreshes.is_pending(REFRESH_FLIGHT)
    }

    /// Runs one mutation.
    ///
    /// A stale or missing credential is refreshed first. An `UNAUTHENTICATED`
    /// answer triggers one refresh and one retry; a second one is final.
    pub async fn mutate(&self, operation: Operation, payload: Value) -> Result<Value, SyncError> {
        if !self.capabilities.can_mutate(operation) {
            return Err(SyncError::Forbidden(format!(
                "{} not permitted",
                operation.as_str()
            )));
        }

        let credential = self.fresh_credential().await?;
        let first = self
            .send(operation, payload.clone(), credential.clone())
            .await;
        match first {
            Err(SyncError::AuthStale) => {
                debug!(operation = operation.as_str(), "credential rejected; refreshing");
                let renewed = match self.credentials.current() {
                    Some(current) if current.token != credential.token && self.is_fresh(&current) => {
                        current
                    }
                    _ => self.refresh().await?,
                };
                match self.send(operation, payload, renewed).await {
                    Err(SyncError::AuthStale) => {
                        warn!(
                            target: "projsync::gateway",
                            operation = operation.as_str(),
                            "credential rejected after refresh"
                        );
                        Err(SyncError::AuthFailure(
                            "credential rejected after refresh".into(),
                        ))
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    pub async fn create_comment(&self, input: CreateCommentInput) -> Result<Comment, SyncError> {
        self.call(Operation::CreateComment, &input).await
    }

    pub async fn update_comment(&self, input: UpdateCommentInput) -> Result<Comment, SyncError> {
        self.call(Operation::UpdateComment, &input).await
    }

    pub async fn toggle_like(&self, input: ToggleLikeInput) -> Result<LikeResult, SyncError> {
        self.call(Operation::ToggleLike, &input).await
    }

    pub async fn create_task(&self, input: CreateTaskInput) -> Result<Task, SyncError> {
        self.call(Operation::CreateTask, &input).await
    }

    pub async fn update_task(&self, input: UpdateTaskInput) -> Result<Task, SyncError> {
        self.call(Operation::UpdateTask, &input).await
    }

    pub async fn delete_entity(
        &self,
        kind: EntityKind,
        input: DeleteEntityInput,
    ) -> Result<(), SyncError> {
        let operation = match kind {
            EntityKind::Comment => Operation::DeleteComment,
            EntityKind::Task => Operation::DeleteTask,
        };
        let payload = encode(operation, &input)?;
        self.mutate(operation, payload).await.map(|_| ())
    }

    async fn call<I, O>(&self, operation: Operation, input: &I) -> Result<O, SyncError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let payload = encode(operation, input)?;
        let result = self.mutate(operation, payload).await?;
        serde_json::from_value(result).map_err(|err| {
            SyncError::InvalidResponse(format!("{}: {err}", operation.as_str()))
        })
    }

    async fn send(
        &self,
        operation: Operation,
        payload: Value,
        credential: Credential,
    ) -> Result<Value, SyncError> {
        let request = MutationRequest {
            operation,
            payload,
            credential,
        };
        match self.service.execute(request).await? {
            MutationResponse::Ok { result } => Ok(result),
            MutationResponse::Err {
                error_code,
                message,
            } => {
                if error_code != ErrorCode::Unauthenticated {
                    debug!(
                        operation = operation.as_str(),
                        code = error_code.as_str(),
                        "mutation rejected"
                    );
                }
                Err(SyncError::from_code(error_code, message))
            }
        }
    }

    async fn fresh_credential(&self) -> Result<Credential, SyncError> {
        match self.credentials.current() {
            Some(credential) if self.is_fresh(&credential) => Ok(credential),
            _ => self.refresh().await,
        }
    }

    fn is_fresh(&self, credential: &Credential) -> bool {
        let skew = chrono::Duration::from_std(self.skew).unwrap_or_else(|_| chrono::Duration::zero());
        credential.is_fresh_at(Utc::now(), skew)
    }

    /// Joins the pending refresh or starts one. Every failure, including the
    /// timeout, surfaces as [`SyncError::AuthFailure`].
    async fn refresh(&self) -> Result<Credential, SyncError> {
        let (role, flight) = self.refreshes.begin(REFRESH_FLIGHT, || {
            metrics::counter!(METRIC_REFRESHES).increment(1);
            let credentials = Arc::clone(&self.credentials);
            let limit = self.refresh_timeout;
            async move {
                match tokio::time::timeout(limit, credentials.refresh()).await {
                    Ok(Ok(credential)) => {
                        info!(expires_at = %credential.expires_at, "credential refreshed");
                        Ok(credential)
                    }
                    Ok(Err(err)) => {
                        warn!(target: "projsync::gateway", error = %err, "credential refresh failed");
                        Err(match err {
                            SyncError::AuthFailure(reason) => SyncError::AuthFailure(reason),
                            other => SyncError::AuthFailure(other.to_string()),
                        })
                    }
                    Err(_) => {
                        warn!(
                            target: "projsync::gateway",
                            timeout_ms = limit.as_millis() as u64,
                            "credential refresh timed out"
                        );
                        Err(SyncError::AuthFailure("credential refresh timed out".into()))
                    }
                }
            }
        });
        if role == FlightRole::Follower {
            debug!("waiting on pending credential refresh");
        }
        flight.await
    }
}

fn encode<I: Serialize>(operation: Operation, input: &I) -> Result<Value, SyncError> {
    serde_json::to_value(input)
        .map_err(|err| SyncError::Validation(format!("{}: {err}", operation.as_str())))
}
