//! verda-state — the authoritative in-process record of which Verda
//! instances belong to which node group.
//!
//! # Architecture
//!
//! Records live in a single `HashMap` keyed by instance id, guarded by one
//! mutex that is only ever held for in-memory work. `reconcile()` computes
//! the next mapping from a copy, outside the lock, and installs it in one
//! short critical section; records created or deleted while the pass was
//! computing survive the swap.
//!
//! Group size is never stored: it is the number of records whose
//! `node_group` matches.
//!
//! An optional JSON snapshot (keyed by instance id) is rewritten after
//! every mutation so a restart can start from the last known view.

pub mod error;
mod snapshot;
pub mod store;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{match_group, ReconcileSummary, StateStore};
pub use types::*;
