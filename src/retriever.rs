use async_trait::async_trait;

/// Produces the value for a key.
///
/// Used by [`PromiseRegistry::get_or_retrieve`](crate::PromiseRegistry::get_or_retrieve), which
/// calls `retrieve` once per key however many callers ask for it concurrently. A retriever which
/// panics leaves its key pending until the entry expires.
#[async_trait]
pub trait Retriever: Send + Sync + 'static {
    /// The produced value.
    type Value: Send;

    /// Compute the value for `key`.
    async fn retrieve(&self, key: &str) -> Self::Value;
}
