//! Provides keyed, single-resolution promises with request coalescing (tokio based).
//!
//! If many callers need the value for the same key at about the same time, there is no point in
//! computing it once per caller. [`PromiseRegistry`] collapses all of them onto a single
//! [`PromiseGroup`] per key: each caller gets its own [`Promise`], whoever produces the value
//! resolves the key once, and every promise in the group observes that value. Callers arriving
//! after resolution get the value immediately, until the entry expires.
//!
//! Entries live for a fixed time from creation (an hour by default) and are swept in the
//! background (every ten minutes by default). See [`RegistryConfig`].
//!
//! Example 1
//! ```
//! use std::future::pending;
//! use std::time::Duration;
//!
//! use coalescer::PromiseRegistry;
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = PromiseRegistry::new();
//!
//!     // Two callers miss at the same time...
//!     let first = registry.register_waiter("answer");
//!     let second = registry.register_waiter("answer");
//!
//!     // ...and one value satisfies both.
//!     registry.resolve("answer", 42).unwrap();
//!     assert_eq!(first.wait(pending()).await, Ok(42));
//!     assert_eq!(second.wait_timeout(Duration::from_secs(1)).await, Ok(42));
//!     assert_eq!(registry.peek("answer"), Some(42));
//! }
//! ```
//!
//! If the value comes from an async computation, implement [`Retriever`] and let
//! [`PromiseRegistry::get_or_retrieve`] decide which caller runs it.
//!
//! Example 2
//! ```
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use coalescer::PromiseRegistry;
//! use coalescer::Retriever;
//!
//! struct Lookup;
//!
//! #[async_trait::async_trait]
//! impl Retriever for Lookup {
//!     type Value = String;
//!
//!     async fn retrieve(&self, key: &str) -> Self::Value {
//!         tokio::time::sleep(Duration::from_millis(50)).await;
//!         key.to_uppercase()
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = PromiseRegistry::new();
//!     let lookup = Arc::new(Lookup);
//!     let deadline = Duration::from_secs(1);
//!
//!     let (a, b) = tokio::join!(
//!         registry.get_or_retrieve("key", lookup.clone(), tokio::time::sleep(deadline)),
//!         registry.get_or_retrieve("key", lookup.clone(), tokio::time::sleep(deadline)),
//!     );
//!     assert_eq!(a.unwrap(), "KEY");
//!     assert_eq!(b.unwrap(), "KEY");
//!     assert_eq!(registry.coalesced_count(), 1);
//! }
//! ```
//!
mod cache;
mod error;
mod group;
mod promise;
mod registry;
mod retriever;

pub use crate::error::PromiseError;
pub use crate::group::GroupSnapshot;
pub use crate::group::PromiseGroup;
pub use crate::promise::Promise;
pub use crate::registry::PromiseRegistry;
pub use crate::registry::Registration;
pub use crate::registry::RegistryConfig;
pub use crate::registry::Role;
pub use crate::retriever::Retriever;
