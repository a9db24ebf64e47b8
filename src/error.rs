use thiserror::Error;

/// Promise and registry errors.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PromiseError {
    /// The cancellation signal fired before the promise resolved.
    #[error("Wait cancelled before resolution")]
    Cancelled,
    /// The promise, or group of promises, was resolved already.
    #[error("Already resolved")]
    AlreadyResolved,
    /// Whatever was producing the value failed without one.
    #[error("Value producer failed")]
    Abandoned,
    /// A second value was produced for a key which is already resolved.
    #[error("Key {0:?} resolved twice")]
    DoubleResolution(String),
}
