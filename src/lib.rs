//! Batch-coalescing data loader.
//!
//! Many near-simultaneous single-item lookups are aggregated into size- and
//! time-bounded batches, each batch is resolved through one bulk
//! [`Loader::fetch_batch`] call, and every caller's future settles from the
//! shared batch result. Batches are dispatched strictly sequentially, so a
//! stateful source (a rate-limited API, a single connection) never sees two
//! fetches in flight at once.
//!
//! Reference: <https://github.com/facebook/dataloader>

mod batch_loader;
mod loader;

pub use batch_loader::BatchLoader;
pub use loader::Loader;
