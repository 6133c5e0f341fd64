use std::io;

use tessera_clock::UnixTime;
use thiserror::Error;

/// An error reported by a [`TokenStore`](crate::TokenStore)
#[derive(Debug, Error)]
pub enum StoreError {
    /// No token has ever been stored, or the stored token is empty
    #[error("no token has been stored")]
    Empty,
    /// The stored token is past its expiry
    #[error("stored token expired at {expired_at:?}")]
    Expired {
        /// The time at which the stored token stopped being valid
        expired_at: UnixTime,
    },
    /// The refresh lock is currently held elsewhere
    #[error("refresh lock is held by another holder")]
    Locked,
    /// The backing store could not be read or written
    #[error("token store I/O failed")]
    Io(#[from] io::Error),
    /// The backing store holds data that could not be decoded, or a token
    /// could not be encoded for storage
    #[cfg(feature = "file")]
    #[cfg_attr(docsrs, doc(cfg(feature = "file")))]
    #[error("token store data could not be (de)serialized")]
    Serialization(#[from] serde_json::Error),
}

/// An error obtaining a token from a [`TokenServer`](crate::TokenServer)
///
/// `E` is the error type of the configured fetcher. Fetch failures are passed
/// through untouched so callers can inspect the original cause.
#[derive(Debug, Error)]
pub enum TokenError<E> {
    /// The fetcher failed to produce a fresh token
    #[error(transparent)]
    Fetch(E),
    /// The token store could not produce a usable token
    #[error("no usable token in store")]
    Store(#[from] StoreError),
    /// The refresh daemon has been shut down, so fetched tokens would never be persisted
    #[error("refresh daemon is no longer running")]
    DaemonStopped,
}
