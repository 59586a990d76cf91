//! Keeps a client's copy of shared project collections (comments, tasks) in
//! step with the server.
//!
//! A [`SyncEngine`] opens one [`SyncSession`] per parent id. The session loads
//! a snapshot through the [`snapshot::SnapshotLoader`], receives change events
//! through the [`demux::Demultiplexer`], folds both into a [`Reconciler`] and
//! writes the result to the local cache through a [`cache::CacheWriter`].
//! Writes go through the [`gateway::MutationGateway`]; the server's broadcast
//! of each accepted write is what updates every other client.

pub mod cache;
pub mod capability;
mod config;
mod dedupe;
pub mod demux;
mod error;
pub mod gateway;
pub mod memory;
pub mod notify;
pub mod reconcile;
pub mod session;
mod singleflight;
pub mod snapshot;
mod test_support;

pub use cache::{CacheKey, CacheStore, CacheWriter, MemoryCacheStore, PersistOutcome};
pub use capability::{AllowAll, Capabilities};
pub use config::{
    config_schema_json, load_config, parse_config, CacheConfig, Config, GatewayConfig, Settings,
    SyncConfig,
};
pub use demux::{Demultiplexer, Subscription};
pub use error::SyncError;
pub use gateway::{CredentialProvider, MutationGateway, MutationService};
pub use notify::{
    BusSink, MemorySink, NoopSink, Notice, NoticeLevel, NotificationSink, TracingSink,
};
pub use reconcile::{
    ApplyOutcome, IgnoreReason, LocalOp, OrderingPolicy, ReconciliationResult, Reconciler,
    SnapshotMerge, SortDirection,
};
pub use session::{SyncEngine, SyncSession};
pub use singleflight::{Flight, FlightRole, Singleflight};
pub use snapshot::{LoadState, SnapshotLoader, SnapshotSource};
