use parking_lot::Mutex;

use crate::error::PromiseError;
use crate::promise::Promise;

/// Point in time copy of a [`PromiseGroup`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupSnapshot<T> {
    /// Number of waiters recorded by the group, including those resolved with it.
    pub waiters: usize,
    /// The value, once the group is resolved.
    pub value: Option<T>,
}

impl<T> GroupSnapshot<T> {
    /// Return true if the group had been resolved when the snapshot was taken.
    pub fn is_resolved(&self) -> bool {
        self.value.is_some()
    }
}

struct GroupState<T> {
    waiters: Vec<Promise<T>>,
    // Waiters drained at resolution are still counted here.
    resolved_waiters: usize,
    value: Option<T>,
    abandoned: bool,
}

/// All the promises waiting on a single key, plus the resolution state of that key.
///
/// A group moves from pending to resolved exactly once, or to abandoned if its producer fails.
/// Every mutation happens under the group's own lock, so resolving is atomic with respect to new
/// waiters: a waiter is either resolved along with the group or observes the stored value, never
/// neither.
pub struct PromiseGroup<T> {
    state: Mutex<GroupState<T>>,
}

impl<T> PromiseGroup<T> {
    /// Create a pending group with no waiters.
    pub fn pending() -> Self {
        Self {
            state: Mutex::new(GroupState {
                waiters: Vec::new(),
                resolved_waiters: 0,
                value: None,
                abandoned: false,
            }),
        }
    }

    /// Create a pending group with `promise` as its first waiter.
    pub fn with_waiter(promise: Promise<T>) -> Self {
        Self {
            state: Mutex::new(GroupState {
                waiters: vec![promise],
                resolved_waiters: 0,
                value: None,
                abandoned: false,
            }),
        }
    }

    /// Create a group which is resolved with `value` and has never had waiters.
    pub fn resolved(value: T) -> Self {
        Self {
            state: Mutex::new(GroupState {
                waiters: Vec::new(),
                resolved_waiters: 0,
                value: Some(value),
                abandoned: false,
            }),
        }
    }

    /// Append `promise` to the waiters of a pending group.
    ///
    /// A resolved group takes no more waiters and returns [`PromiseError::AlreadyResolved`];
    /// an abandoned one returns [`PromiseError::Abandoned`]. Use [`PromiseGroup::join`] to get a
    /// promise regardless of state.
    pub fn add_waiter(&self, promise: Promise<T>) -> Result<(), PromiseError> {
        let mut state = self.state.lock();
        state.check_pending()?;
        state.waiters.push(promise);
        Ok(())
    }

    /// Return true once the group is resolved.
    pub fn is_resolved(&self) -> bool {
        self.state.lock().value.is_some()
    }

    /// Return true if the group was given up on without a value.
    pub fn is_abandoned(&self) -> bool {
        self.state.lock().abandoned
    }

    /// Release every waiter with [`PromiseError::Abandoned`] and refuse any later value.
    ///
    /// Returns false, changing nothing, unless the group is pending.
    pub(crate) fn abandon(&self) -> bool {
        let mut state = self.state.lock();
        if state.check_pending().is_err() {
            return false;
        }
        let waiters = std::mem::take(&mut state.waiters);
        state.resolved_waiters += waiters.len();
        for waiter in waiters {
            let _ = waiter.abandon();
        }
        state.abandoned = true;
        true
    }

    /// Number of waiters the group has recorded.
    pub fn waiter_count(&self) -> usize {
        let state = self.state.lock();
        state.waiters.len() + state.resolved_waiters
    }
}

impl<T> GroupState<T> {
    fn check_pending(&self) -> Result<(), PromiseError> {
        if self.value.is_some() {
            Err(PromiseError::AlreadyResolved)
        } else if self.abandoned {
            Err(PromiseError::Abandoned)
        } else {
            Ok(())
        }
    }
}

impl<T: Clone> PromiseGroup<T> {
    /// Get a promise for this group's value.
    ///
    /// If the group is pending, a fresh promise is added to its waiters and `false` is returned
    /// alongside it. Otherwise the promise is already settled, carrying the stored value or the
    /// abandonment, and `true` is returned. The check and the append happen under one lock.
    pub fn join(&self) -> (Promise<T>, bool) {
        let mut state = self.state.lock();
        if let Some(value) = &state.value {
            return (Promise::resolved(value.clone()), true);
        }
        if state.abandoned {
            return (Promise::abandoned(), true);
        }
        let promise = Promise::new();
        state.waiters.push(promise.clone());
        (promise, false)
    }

    /// Resolve every waiter with `value` and store it.
    ///
    /// Waiters are resolved in no particular order. Resolving a group twice is a protocol error:
    /// [`PromiseError::AlreadyResolved`] is returned and the first value is kept. An abandoned
    /// group returns [`PromiseError::Abandoned`].
    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        let mut state = self.state.lock();
        state.check_pending()?;
        let waiters = std::mem::take(&mut state.waiters);
        state.resolved_waiters += waiters.len();
        for waiter in waiters {
            // The holder of a waiter may have resolved it directly. Its value stands.
            if waiter.resolve(value.clone()).is_err() {
                tracing::trace!("waiter already resolved by its holder");
            }
        }
        state.value = Some(value);
        Ok(())
    }

    /// Return the value without blocking, if the group is resolved.
    pub fn try_value(&self) -> Option<T> {
        self.state.lock().value.clone()
    }

    /// Take a consistent copy of the group's state.
    pub fn snapshot(&self) -> GroupSnapshot<T> {
        let state = self.state.lock();
        GroupSnapshot {
            waiters: state.waiters.len() + state.resolved_waiters,
            value: state.value.clone(),
        }
    }
}

impl<T> Default for PromiseGroup<T> {
    fn default() -> Self {
        Self::pending()
    }
}
