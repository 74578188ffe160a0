//! Watch events published by a cluster store.

use meridian_core::{Kind, ObjectMeta};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Added,
    Modified,
    Deleted,
}

/// One successful write, as seen by watchers.
#[derive(Debug, Clone)]
pub struct StoreEvent {
    pub cluster: String,
    pub kind: Kind,
    pub action: EventAction,
    /// Metadata after the write (before removal, for deletions).
    pub meta: ObjectMeta,
}
