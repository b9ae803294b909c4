//! ScenePub Core - Scene Publish Orchestration
//!
//! # Ground Rules
//! 1. The open session is the root of every publish
//! 2. Templates are contracts: a path that parses renders back unchanged
//! 3. Validation sees the tracker read-only
//! 4. One failed task never stops its siblings
//! 5. Every registered file knows what it depends on

pub mod templates;
pub mod item;
pub mod host;
pub mod memory;
pub mod tracker;
pub mod config;
pub mod collector;
pub mod dependencies;
pub mod versioning;
pub mod references;
pub mod session;
pub mod plugins;
pub mod pipeline;
pub mod secondary;
pub mod jobs;
pub mod hashing;

pub use templates::{FieldValue, Fields, Template, TemplateError, TemplateRegistry};
pub use item::{props, ItemId, ItemKind, ItemTree, PublishItem};
pub use host::{HostContext, HostError, HostFeature, HostRef, SceneHost};
pub use memory::MemoryScene;
pub use tracker::{EntityContext, EntityRef, LocalTracker, PublishRecord, TrackerRead, TrackingBackend};
pub use config::{ConfigError, PublishConfig};
pub use collector::{collect_current_session, CollectError};
pub use dependencies::{get_publish_dependencies, DependencySet};
pub use versioning::{next_version, VersionBump};
pub use references::{resolve_local_storage_root, StorageRootUpdate};
pub use plugins::{AcceptResult, PublishError, PublishPlugin, RecoveryAction, RunContext};
pub use pipeline::{PipelineError, PublishPipeline, PublishReport, TaskState};
pub use secondary::{publish_secondary_geometry, BatchOutcome, SecondaryTask};
pub use hashing::{canonical_json, compute_report_hash};

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
