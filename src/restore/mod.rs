//! Background restores that callers poll by operation id.

pub mod tracker;

pub use tracker::RestoreOperationTracker;
