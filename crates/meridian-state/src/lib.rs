//! meridian-state — placement store adapter.
//!
//! Each cluster gets a [`ClusterStore`] backed by [redb](https://docs.rs/redb),
//! on disk or in memory. Records are JSON-serialized into `&[u8]` value
//! columns, one table per [`Kind`](meridian_core::Kind), keyed by
//! `{namespace}/{name}`.
//!
//! # Semantics
//!
//! The store behaves like a cluster API server seen through a synced cache:
//!
//! - writes are guarded by `resource_version` (stale writes fail with
//!   [`StateError::Conflict`])
//! - status is a subresource written only through `update_status`
//! - deleting a record with finalizers only marks it terminating
//! - every successful write is published as a [`StoreEvent`]
//!
//! [`Clusters`] maps cluster names to stores so reconcilers can read
//! observations of, and write decisions into, other clusters.

pub mod clusters;
pub mod error;
pub mod events;
pub mod store;
pub mod tables;

pub use clusters::Clusters;
pub use error::{StateError, StateResult};
pub use events::{EventAction, StoreEvent};
pub use store::ClusterStore;
