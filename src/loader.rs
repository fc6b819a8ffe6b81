use std::collections::HashMap;
use std::hash::Hash;

/// Trait for batch loading.
///
/// A [`BatchLoader`](crate::BatchLoader) drives an implementation of this
/// trait: it accumulates identifiers from concurrent `load` calls and hands
/// them to [`fetch_batch`](Loader::fetch_batch) in bounded groups.
#[async_trait::async_trait]
pub trait Loader<I: Send + Sync + Clone + 'static>: Send + Sync + 'static {
    /// Canonical key identifiers are matched under in the batch response.
    type Key: Send + Sync + Eq + Hash + 'static;

    /// Type of value.
    type Value: Send + Sync + Clone + 'static;

    /// Type of error. `Clone` because one batch error fans out to every
    /// waiter in the batch (an `Arc<anyhow::Error>` works well here).
    type Error: Send + Clone + 'static;

    /// Load the data set specified by `identifiers`.
    ///
    /// The slice is the accumulated batch in arrival order, duplicates
    /// preserved; deduplicating before the underlying request is the
    /// implementor's choice. Returns a map from canonical key to value for
    /// every key the source could resolve. An error fails the whole batch.
    async fn fetch_batch(
        &self,
        identifiers: &[I],
    ) -> Result<HashMap<Self::Key, Self::Value>, Self::Error>;

    /// Canonicalize an identifier into the key space of the batch response,
    /// e.g. case normalization. Must be deterministic and side-effect free.
    fn key(&self, identifier: &I) -> Self::Key;

    /// Fallback value for an identifier whose key is absent from a
    /// successful batch response. Not an error condition.
    fn default_value(&self, identifier: &I) -> Self::Value;
}
