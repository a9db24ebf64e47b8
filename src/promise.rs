use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::error::PromiseError;

enum Slot<T> {
    Pending,
    Resolved(T),
    // The producer went away without a value.
    Abandoned,
}

impl<T> Slot<T> {
    fn is_pending(&self) -> bool {
        matches!(self, Slot::Pending)
    }
}

/// A single-assignment value which any number of tasks may wait on.
///
/// The slot holds exactly one value, so resolving never blocks, whether or not anybody is
/// waiting. Waiting reads the value and leaves it in place for every other observer. Clones share
/// the same slot.
pub struct Promise<T> {
    slot: Arc<watch::Sender<Slot<T>>>,
}

impl<T> Promise<T> {
    /// Create a pending promise.
    pub fn new() -> Self {
        let (sender, _) = watch::channel(Slot::Pending);
        Self {
            slot: Arc::new(sender),
        }
    }

    /// Create a promise which is already resolved with `value`.
    pub fn resolved(value: T) -> Self {
        let (sender, _) = watch::channel(Slot::Resolved(value));
        Self {
            slot: Arc::new(sender),
        }
    }

    pub(crate) fn abandoned() -> Self {
        let (sender, _) = watch::channel(Slot::Abandoned);
        Self {
            slot: Arc::new(sender),
        }
    }

    /// Resolve the promise, waking every task waiting on it.
    ///
    /// A promise resolves exactly once. Further attempts fail with
    /// [`PromiseError::AlreadyResolved`] and the first value is kept.
    pub fn resolve(&self, value: T) -> Result<(), PromiseError> {
        self.settle(Slot::Resolved(value))
    }

    /// Release every waiter with [`PromiseError::Abandoned`]. Fails if the promise is settled.
    pub(crate) fn abandon(&self) -> Result<(), PromiseError> {
        self.settle(Slot::Abandoned)
    }

    fn settle(&self, settled: Slot<T>) -> Result<(), PromiseError> {
        let stored = self.slot.send_if_modified(move |slot| {
            if !slot.is_pending() {
                return false;
            }
            *slot = settled;
            true
        });
        if stored {
            Ok(())
        } else {
            Err(PromiseError::AlreadyResolved)
        }
    }

    /// Return true if a value has been stored.
    pub fn is_resolved(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Resolved(_))
    }

    /// Return true if the promise was given up on without a value.
    pub fn is_abandoned(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Abandoned)
    }
}

impl<T: Clone> Promise<T> {
    /// Return the value without waiting, if there is one.
    pub fn try_value(&self) -> Option<T> {
        match &*self.slot.borrow() {
            Slot::Resolved(value) => Some(value.clone()),
            _ => None,
        }
    }

    /// Wait until the promise resolves or `cancel` completes, whichever comes first.
    ///
    /// If both are ready, the value wins. Cancelling only releases this caller: the promise stays
    /// pending and may still be resolved later. A promise whose producer failed returns
    /// [`PromiseError::Abandoned`].
    pub async fn wait<C>(&self, cancel: C) -> Result<T, PromiseError>
    where
        C: Future<Output = ()>,
    {
        let mut receiver = self.slot.subscribe();
        let settled = async move {
            // We hold the sender, so the channel can't close while we wait.
            let result = match receiver.wait_for(|slot| !slot.is_pending()).await {
                Ok(slot) => match &*slot {
                    Slot::Resolved(value) => Ok(value.clone()),
                    _ => Err(PromiseError::Abandoned),
                },
                Err(_) => Err(PromiseError::Abandoned),
            };
            result
        };
        tokio::select! {
            biased;
            result = settled => result,
            _ = cancel => Err(PromiseError::Cancelled),
        }
    }

    /// Wait for at most `timeout`.
    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, PromiseError> {
        self.wait(tokio::time::sleep(timeout)).await
    }
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.is_resolved())
            .field("abandoned", &self.is_abandoned())
            .finish()
    }
}
