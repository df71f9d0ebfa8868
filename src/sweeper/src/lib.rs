//! Reconciliation sweep: whitelist-validate every file in a storage tier and
//! delete the orphans.
//!
//! The same validation pattern is applied to two very different tiers:
//! - `local`: filesystem walk of a durable tier root, serialized across
//!   processes by an advisory lock
//! - `remote`: object listing of the remote tier, no lock (the worker loop
//!   is the only caller)

pub mod local;
pub mod remote;

pub use local::{CleanupReport, ReconciliationSweeper, SweepOptions};
pub use remote::RemoteSweeper;
