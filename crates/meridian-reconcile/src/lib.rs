//! meridian-reconcile — the engine every Meridian controller runs on.
//!
//! A [`Controller`] owns a [`WorkQueue`] of keys and a pool of workers. Store
//! watch events are mapped to keys and enqueued; workers call
//! [`Reconciler::handle`] for one key at a time:
//!
//! ```text
//! StoreEvent ──map──▶ WorkQueue ──get──▶ worker ──handle(key)──┐
//!                        ▲                                     │
//!                        ├── add_rate_limited  ◀── Err(e) ─────┤
//!                        ├── add_after(d)      ◀── Ok(Some(d)) ┤
//!                        └── forget            ◀── Ok(None) ───┘
//! ```
//!
//! A key is never processed by two workers at once; a key added while it is
//! being processed is handled again once the current pass finishes.

pub mod controller;
pub mod queue;

pub use controller::{Controller, ReconcileError, Reconciler};
pub use queue::{Backoff, WorkQueue};
