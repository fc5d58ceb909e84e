//! Filesystem store for the weather tile pipeline.
//!
//! The store has no database: manifests, pointers and staging state are
//! plain files, and every visible change is a single rename.
//!
//! - [`retention`]: cycle inventory ordering and keep-N eviction.
//! - [`staging`]: frames that are built but not yet visible.
//! - [`publish`]: gate/delta checks, promotion and the `LATEST.json` pointer.
//! - [`discovery`]: TTL-cached listings of published state for readers.

pub mod atomic;
pub mod discovery;
pub mod error;
pub mod layout;
pub mod locks;
pub mod manifest;
pub mod publish;
pub mod retention;
pub mod staging;

pub use atomic::{write_atomic, write_json_atomic, PreparedWrite};
pub use discovery::{DiscoveryCache, DiscoveryStats};
pub use error::{StoreError, StoreResult};
pub use layout::StoreLayout;
pub use locks::KeyedLocks;
pub use manifest::{
    FrameEntry, FrameSidecar, LatestPointer, PublishedManifest, RunManifest, StagingManifest,
    CONTRACT_VERSION,
};
pub use publish::{PublishOutcome, PublishPolicy, PublishState, Publisher};
pub use retention::{enforce_retention, list_cycles, CacheConfig, Cycle, RetentionSummary};
pub use staging::StagingArea;
