use crate::cache::Added;
use crate::cache::Cache;
use crate::error::PromiseError;
use crate::group::GroupSnapshot;
use crate::group::PromiseGroup;
use crate::promise::Promise;
use crate::retriever::Retriever;
use std::fmt;
use std::future::Future;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

const DEFAULT_ENTRY_TTL: Duration = Duration::from_secs(60 * 60);
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// Registry construction parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistryConfig {
    /// How long an entry lives, measured from its creation. Access does not extend it.
    pub entry_ttl: Duration,
    /// How often the background sweeper purges expired entries. Zero disables the sweeper.
    pub cleanup_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            entry_ttl: DEFAULT_ENTRY_TTL,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

impl RegistryConfig {
    /// Set the entry time-to-live.
    pub fn with_entry_ttl(mut self, entry_ttl: Duration) -> Self {
        self.entry_ttl = entry_ttl;
        self
    }

    /// Set the sweep interval.
    pub fn with_cleanup_interval(mut self, cleanup_interval: Duration) -> Self {
        self.cleanup_interval = cleanup_interval;
        self
    }
}

/// How a [`Registration`] came about.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// This registration created the key's group and is expected to produce its value.
    Creator,
    /// Joined a group which is still pending.
    Waiter,
    /// The key was already settled; the promise is too.
    Resolved,
}

/// A promise obtained from [`PromiseRegistry::register`].
#[derive(Debug)]
pub struct Registration<T> {
    promise: Promise<T>,
    role: Role,
}

impl<T> Registration<T> {
    /// Return how this registration came about.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Return true if this caller created the key's group.
    pub fn is_creator(&self) -> bool {
        self.role == Role::Creator
    }

    /// Return the promise to wait on.
    pub fn promise(&self) -> &Promise<T> {
        &self.promise
    }

    /// Consume the registration, returning its promise.
    pub fn into_promise(self) -> Promise<T> {
        self.promise
    }
}

struct Inner<T> {
    storage: Cache<Arc<PromiseGroup<T>>>,
    request_coalesced_counter: AtomicU64,
    request_total_counter: AtomicU64,
    sweeper: Option<JoinHandle<()>>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(sweeper) = &self.sweeper {
            sweeper.abort();
        }
    }
}

/// Keyed promises with request coalescing.
///
/// Every caller asking for a key before it is resolved waits on the same group, and the value
/// resolved for the key is handed to all of them. Once resolved, later callers get the value
/// straight away until the entry expires. Entries expire a fixed time after creation, resolved or
/// not; a caller arriving after that starts a fresh group.
///
/// Expiry does not cancel waiters. A waiter whose entry expires before it is resolved is only
/// released by its own cancellation.
pub struct PromiseRegistry<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PromiseRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> PromiseRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a registry with the default configuration: entries live for an hour and are swept
    /// every ten minutes.
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a registry with the supplied configuration.
    ///
    /// The sweeper is spawned on the current tokio runtime. Outside a runtime there is no
    /// sweeper: expired entries are still ignored, and [`PromiseRegistry::purge_expired`] frees
    /// them.
    pub fn with_config(config: RegistryConfig) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            storage: Cache::new(config.entry_ttl),
            request_coalesced_counter: AtomicU64::new(0),
            request_total_counter: AtomicU64::new(0),
            sweeper: spawn_sweeper(weak.clone(), config.cleanup_interval),
        });
        Self { inner }
    }

    /// Register interest in `key`.
    ///
    /// Exactly one of any number of concurrent callers for an unknown key creates its group and
    /// gets [`Role::Creator`]; the others join that group. If the group is resolved already, the
    /// returned promise is too.
    pub fn register(&self, key: &str) -> Registration<T> {
        self.join_group(key).0
    }

    fn join_group(&self, key: &str) -> (Registration<T>, Arc<PromiseGroup<T>>) {
        self.inner
            .request_total_counter
            .fetch_add(1, Ordering::SeqCst);
        let promise = Promise::new();
        match self
            .inner
            .storage
            .add_with(key, || Arc::new(PromiseGroup::with_waiter(promise.clone())))
        {
            Added::Inserted(group) => {
                tracing::trace!(key, "created promise group");
                let registration = Registration {
                    promise,
                    role: Role::Creator,
                };
                (registration, group)
            }
            Added::Existing(group) => {
                self.inner
                    .request_coalesced_counter
                    .fetch_add(1, Ordering::SeqCst);
                // The map lock is released by now; only the group's lock is taken here.
                let (promise, settled) = group.join();
                let role = if settled {
                    Role::Resolved
                } else {
                    Role::Waiter
                };
                tracing::trace!(key, ?role, "joined promise group");
                (Registration { promise, role }, group)
            }
        }
    }

    /// Register interest in `key` and return the promise to wait on.
    pub fn register_waiter(&self, key: &str) -> Promise<T> {
        self.register(key).into_promise()
    }

    /// Wait for the value of `key`, or until `cancel` completes.
    pub async fn wait_for_value<C>(&self, key: &str, cancel: C) -> Result<T, PromiseError>
    where
        C: Future<Output = ()>,
    {
        self.register_waiter(key).wait(cancel).await
    }

    /// Resolve `key` with `value`, waking everything waiting on it.
    ///
    /// If nobody has asked for the key yet, a resolved entry is stored so later callers get the
    /// value immediately. Resolving a key which is already resolved fails with
    /// [`PromiseError::DoubleResolution`]; the first value stays in place.
    pub fn resolve(&self, key: &str, value: T) -> Result<(), PromiseError> {
        match self
            .inner
            .storage
            .add_with(key, || Arc::new(PromiseGroup::resolved(value.clone())))
        {
            Added::Inserted(_) => {
                tracing::trace!(key, "resolved key without waiters");
                Ok(())
            }
            Added::Existing(group) => group.resolve(value).map_err(|error| match error {
                PromiseError::AlreadyResolved => {
                    tracing::warn!(key, "key resolved twice, keeping the first value");
                    PromiseError::DoubleResolution(key.to_string())
                }
                error => error,
            }),
        }
    }

    /// Return the value of `key` if it is resolved.
    pub fn peek(&self, key: &str) -> Option<T> {
        self.inner
            .storage
            .get(key)
            .and_then(|group| group.try_value())
    }

    /// Return a snapshot of the group for `key`, resolved or not.
    pub fn inspect(&self, key: &str) -> Option<GroupSnapshot<T>> {
        self.inner.storage.get(key).map(|group| group.snapshot())
    }

    /// Use the retriever to get the value of `key`, at most once per live entry.
    ///
    /// The first caller for a key spawns `retriever` on the tokio runtime and resolves the key with
    /// its output. Everybody, the first caller included, then waits for the value or for their own
    /// `cancel`. The retrieval runs to completion even if every caller gives up.
    ///
    /// If the retriever panics, everybody waiting gets [`PromiseError::Abandoned`] and the key is
    /// forgotten, so the next caller retrieves it again.
    pub async fn get_or_retrieve<R, C>(
        &self,
        key: &str,
        retriever: Arc<R>,
        cancel: C,
    ) -> Result<T, PromiseError>
    where
        R: Retriever<Value = T>,
        C: Future<Output = ()>,
    {
        let (registration, group) = self.join_group(key);
        if registration.is_creator() {
            let registry = self.clone();
            let key = key.to_string();
            let retrieval = {
                let key = key.clone();
                tokio::spawn(async move {
                    tracing::debug!(key = %key, "retrieving value");
                    retriever.retrieve(&key).await
                })
            };
            // Supervise the retrieval, so a panic can't leave the group pending.
            tokio::spawn(async move {
                match retrieval.await {
                    Ok(value) => {
                        if let Err(error) = group.resolve(value) {
                            tracing::warn!(key = %key, %error, "retrieved value discarded");
                        }
                    }
                    Err(error) => {
                        tracing::warn!(key = %key, %error, "retrieval failed");
                        registry.abandon(&key, &group);
                    }
                }
            });
        }
        registration.into_promise().wait(cancel).await
    }

    // Forget `group` if it is still the entry for `key`, then release its waiters.
    fn abandon(&self, key: &str, group: &Arc<PromiseGroup<T>>) {
        if group.is_resolved() {
            return;
        }
        self.inner
            .storage
            .remove_if(key, |current| Arc::ptr_eq(current, group));
        group.abandon();
    }

    /// Remove every entry and reset the request counters.
    ///
    /// Pending groups are abandoned, so their waiters get [`PromiseError::Abandoned`] instead of
    /// waiting for a value nobody can deliver any more.
    pub fn clear(&self) {
        for group in self.inner.storage.clear() {
            group.abandon();
        }
        self.inner
            .request_coalesced_counter
            .store(0, Ordering::SeqCst);
        self.inner.request_total_counter.store(0, Ordering::SeqCst);
    }

    /// Drop every expired entry now, returning how many went.
    pub fn purge_expired(&self) -> usize {
        self.inner.storage.purge_expired()
    }

    /// Number of entries held, including expired entries not yet purged.
    pub fn len(&self) -> usize {
        self.inner.storage.count()
    }

    /// Return true if no entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Return the number of registrations which joined an existing group.
    pub fn coalesced_count(&self) -> u64 {
        self.inner.request_coalesced_counter.load(Ordering::SeqCst)
    }

    /// Return the total registration count.
    pub fn request_count(&self) -> u64 {
        self.inner.request_total_counter.load(Ordering::SeqCst)
    }
}

impl<T> Default for PromiseRegistry<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PromiseRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseRegistry")
            .field("entries", &self.inner.storage.count())
            .field("sweeper", &self.inner.sweeper.is_some())
            .finish()
    }
}

fn spawn_sweeper<T>(inner: Weak<Inner<T>>, period: Duration) -> Option<JoinHandle<()>>
where
    T: Send + Sync + 'static,
{
    if period.is_zero() {
        return None;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::debug!("no tokio runtime, expired entries will not be swept");
        return None;
    };
    Some(runtime.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let purged = inner.storage.purge_expired();
            if purged > 0 {
                tracing::debug!(purged, "purged expired promise groups");
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::future::pending;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    fn no_sweep(entry_ttl: Duration) -> RegistryConfig {
        RegistryConfig::default()
            .with_entry_ttl(entry_ttl)
            .with_cleanup_interval(Duration::ZERO)
    }

    #[tokio::test]
    async fn it_coalesces_waiters_registered_before_resolution() {
        let registry = PromiseRegistry::new();
        let promises: Vec<Promise<i64>> = (0..10).map(|_| registry.register_waiter("k")).collect();
        assert!(promises.iter().all(|p| !p.is_resolved()));

        registry.resolve("k", 12).unwrap();

        for promise in &promises {
            assert_eq!(promise.wait(pending()).await, Ok(12));
        }
        assert_eq!(
            registry.inspect("k"),
            Some(GroupSnapshot {
                waiters: 10,
                value: Some(12)
            })
        );
    }

    #[tokio::test]
    async fn it_delivers_to_two_waiters() {
        let registry = PromiseRegistry::new();
        let first = registry.register_waiter("y");
        let second = registry.register_waiter("y");

        registry.resolve("y", 12).unwrap();

        assert_eq!(first.wait(pending()).await, Ok(12));
        assert_eq!(second.wait(pending()).await, Ok(12));
        assert_eq!(registry.peek("y"), Some(12));
    }

    #[tokio::test]
    async fn it_hands_late_joiners_the_resolved_value() {
        let registry = PromiseRegistry::new();
        registry.register_waiter("k");
        registry.resolve("k", "v".to_string()).unwrap();

        for _ in 0..5 {
            let registration = registry.register("k");
            assert_eq!(registration.role(), Role::Resolved);
            assert_eq!(registration.promise().try_value().as_deref(), Some("v"));
        }
        // Late joiners are not recorded as waiters.
        assert_eq!(registry.inspect("k").map(|s| s.waiters), Some(1));
    }

    #[tokio::test]
    async fn it_resolves_a_key_nobody_waits_for() {
        let registry = PromiseRegistry::new();
        registry.resolve("k", 5u32).unwrap();
        assert_eq!(registry.peek("k"), Some(5));
        assert_eq!(
            registry.inspect("k"),
            Some(GroupSnapshot {
                waiters: 0,
                value: Some(5)
            })
        );
        assert_eq!(registry.wait_for_value("k", pending()).await, Ok(5));
    }

    #[tokio::test]
    async fn it_times_out_and_keeps_the_waiter() {
        let registry = PromiseRegistry::<i64>::new();
        let started = std::time::Instant::now();

        let result = registry
            .wait_for_value("x", tokio::time::sleep(Duration::from_millis(5)))
            .await;

        assert_eq!(result, Err(PromiseError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(1));
        let snapshot = registry.inspect("x").unwrap();
        assert!(!snapshot.is_resolved());
        assert_eq!(snapshot.waiters, 1);
        assert_eq!(registry.peek("x"), None);
    }

    #[tokio::test]
    async fn it_isolates_cancellation() {
        let registry = PromiseRegistry::new();
        let patient = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_for_value("k", pending()).await })
        };
        let impatient = registry
            .wait_for_value("k", tokio::time::sleep(Duration::from_millis(5)))
            .await;
        assert_eq!(impatient, Err(PromiseError::Cancelled));

        registry.resolve("k", 3u8).unwrap();
        assert_eq!(patient.await.unwrap(), Ok(3));
    }

    #[tokio::test]
    async fn it_reports_double_resolution() {
        let registry = PromiseRegistry::new();
        let promise = registry.register_waiter("k");
        registry.resolve("k", 1u8).unwrap();

        assert_eq!(
            registry.resolve("k", 2),
            Err(PromiseError::DoubleResolution("k".to_string()))
        );
        assert_eq!(registry.peek("k"), Some(1));
        assert_eq!(promise.try_value(), Some(1));

        // The same applies when the first resolution found no waiters.
        registry.resolve("other", 1).unwrap();
        assert!(registry.resolve("other", 1).is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_elects_exactly_one_creator() {
        let registry = PromiseRegistry::<u64>::new();
        let barrier = Arc::new(Barrier::new(64));
        let mut hdls = vec![];
        for _ in 0..64 {
            let registry = registry.clone();
            let barrier = barrier.clone();
            hdls.push(tokio::spawn(async move {
                barrier.wait().await;
                let registration = registry.register("k");
                let role = registration.role();
                (role, registration.into_promise().wait(pending()).await)
            }));
        }
        while registry.inspect("k").map(|s| s.waiters) != Some(64) {
            tokio::task::yield_now().await;
        }
        registry.resolve("k", 7).unwrap();

        let results: Vec<(Role, Result<u64, PromiseError>)> = futures::future::join_all(hdls)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        let creators = results.iter().filter(|r| r.0 == Role::Creator).count();
        assert_eq!(creators, 1);
        assert!(results.iter().all(|r| r.1 == Ok(7)));
        assert_eq!(registry.request_count(), 64);
        assert_eq!(registry.coalesced_count(), 63);
    }

    #[tokio::test(start_paused = true)]
    async fn it_forgets_expired_entries() {
        let registry = PromiseRegistry::with_config(no_sweep(Duration::from_secs(1)));
        registry.resolve("k", 1u8).unwrap();
        assert_eq!(registry.peek("k"), Some(1));

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(registry.peek("k"), None);
        assert_eq!(registry.inspect("k"), None);
        let registration = registry.register("k");
        assert_eq!(registration.role(), Role::Creator);
        assert!(!registration.promise().is_resolved());
    }

    #[tokio::test(start_paused = true)]
    async fn it_does_not_renew_on_access() {
        let registry = PromiseRegistry::with_config(no_sweep(Duration::from_secs(10)));
        registry.resolve("k", 1u8).unwrap();
        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(4)).await;
            assert_eq!(registry.register("k").role(), Role::Resolved);
        }
        // Created at 0s, read at 4s and 8s, gone at 12s.
        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(registry.peek("k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn it_does_not_cancel_waiters_on_expiry() {
        let registry = PromiseRegistry::with_config(no_sweep(Duration::from_secs(1)));
        let stranded = registry.register_waiter("k");

        tokio::time::advance(Duration::from_secs(2)).await;
        registry.resolve("k", 1u8).unwrap();

        assert_eq!(registry.peek("k"), Some(1));
        assert_eq!(
            stranded.wait_timeout(Duration::from_millis(10)).await,
            Err(PromiseError::Cancelled)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn it_sweeps_expired_entries() {
        let registry = PromiseRegistry::new();
        registry.register_waiter("pending");
        registry.resolve("resolved", 1u8).unwrap();
        assert_eq!(registry.len(), 2);

        tokio::time::advance(Duration::from_secs(65 * 60)).await;
        for _ in 0..10 {
            if registry.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn it_purges_on_demand() {
        let registry = PromiseRegistry::with_config(no_sweep(Duration::from_secs(1)));
        registry.resolve("a", 1u8).unwrap();
        registry.resolve("b", 2).unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        registry.resolve("c", 3).unwrap();

        assert_eq!(registry.purge_expired(), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn it_works_without_a_runtime() {
        let registry = PromiseRegistry::new();
        let promise = registry.register_waiter("k");
        registry.resolve("k", 4u8).unwrap();
        assert_eq!(promise.try_value(), Some(4));
        assert!(format!("{registry:?}").contains("sweeper: false"));
    }

    struct SlowRetriever {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Retriever for SlowRetriever {
        type Value = String;

        async fn retrieve(&self, key: &str) -> Self::Value {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let num = rand::rng().random_range(20..60);
            tokio::time::sleep(Duration::from_millis(num)).await;
            format!("value for {key}")
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn it_retrieves_once_for_concurrent_callers() {
        let registry = PromiseRegistry::new();
        let retriever = Arc::new(SlowRetriever {
            calls: AtomicUsize::new(0),
        });

        let mut hdls = vec![];
        for _ in 0..100 {
            let registry = registry.clone();
            let retriever = retriever.clone();
            hdls.push(async move {
                registry
                    .get_or_retrieve("k", retriever, tokio::time::sleep(Duration::from_secs(5)))
                    .await
            });
        }
        let results = futures::future::join_all(hdls).await;

        assert!(results.iter().all(|r| r.as_deref() == Ok("value for k")));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.peek("k").as_deref(), Some("value for k"));
    }

    #[tokio::test]
    async fn it_finishes_retrieval_for_a_cancelled_creator() {
        let registry = PromiseRegistry::new();
        let retriever = Arc::new(SlowRetriever {
            calls: AtomicUsize::new(0),
        });

        let creator = registry
            .get_or_retrieve("k", retriever.clone(), std::future::ready(()))
            .await;
        assert_eq!(creator, Err(PromiseError::Cancelled));

        let follower = registry
            .get_or_retrieve("k", retriever.clone(), pending())
            .await;
        assert_eq!(follower.as_deref(), Ok("value for k"));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 1);
    }

    struct FlakyRetriever {
        calls: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Retriever for FlakyRetriever {
        type Value = String;

        async fn retrieve(&self, _key: &str) -> Self::Value {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if call == 0 {
                panic!("BAD FIRST CALL");
            }
            "ok".to_string()
        }
    }

    #[tokio::test]
    async fn it_retries_after_a_panicking_retriever() {
        let registry = PromiseRegistry::new();
        let retriever = Arc::new(FlakyRetriever {
            calls: AtomicUsize::new(0),
        });

        let deadline = || tokio::time::sleep(Duration::from_secs(5));
        let (first, joined) = tokio::join!(
            registry.get_or_retrieve("k", retriever.clone(), deadline()),
            registry.get_or_retrieve("k", retriever.clone(), deadline()),
        );
        // Both callers are released straight away rather than at their deadline.
        assert_eq!(first, Err(PromiseError::Abandoned));
        assert_eq!(joined, Err(PromiseError::Abandoned));
        assert_eq!(registry.inspect("k"), None);

        let second = registry
            .get_or_retrieve("k", retriever.clone(), deadline())
            .await;
        assert_eq!(second.as_deref(), Ok("ok"));
        assert_eq!(retriever.calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.peek("k").as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn it_releases_pending_waiters_on_clear() {
        let registry = PromiseRegistry::new();
        let waiter = registry.register_waiter("pending");
        registry.resolve("resolved", 1u8).unwrap();

        registry.clear();

        assert_eq!(waiter.wait(pending()).await, Err(PromiseError::Abandoned));
        assert!(registry.is_empty());
        assert_eq!(registry.request_count(), 0);
        assert_eq!(registry.coalesced_count(), 0);
        assert_eq!(registry.register("pending").role(), Role::Creator);
    }
}
