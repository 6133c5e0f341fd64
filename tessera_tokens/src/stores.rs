//! Token stores
//!
//! A store keeps the single cached token and offers an advisory lock used to
//! coordinate who refreshes it. Stores are chosen when the
//! [`TokenServer`](crate::TokenServer) is constructed.

use std::fmt;

use async_trait::async_trait;
use tessera_clock::DurationSecs;

use crate::{AccessToken, AccessTokenRef, StoreError};

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileTokenStore;
pub use in_memory::InMemoryTokenStore;

/// Proof of one successful acquisition of a store's refresh lock
///
/// Each call to [`TokenStore::lock`] that succeeds yields a distinct token.
/// Releasing requires handing the same token back, so a release can only ever
/// free the acquisition it belongs to.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockToken(u64);

impl LockToken {
    /// Mints a token for a new acquisition
    pub fn new() -> Self {
        Self(rand::random())
    }

    /// The value identifying this acquisition, as recorded by the store
    #[inline]
    pub fn nonce(&self) -> u64 {
        self.0
    }
}

impl Default for LockToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "LockToken({:016x})", self.0)
    }
}

/// Storage for the cached token plus an advisory refresh lock
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Reads the cached token
    ///
    /// Fails with [`StoreError::Empty`] if no (non-empty) token was ever stored
    /// and with [`StoreError::Expired`] once the stored token's lifetime has
    /// passed. Reading has no side effects.
    async fn get(&self) -> Result<AccessToken, StoreError>;

    /// Replaces the cached token, which stays valid for `ttl` from now
    async fn set(&self, token: &AccessTokenRef, ttl: DurationSecs) -> Result<(), StoreError>;

    /// Attempts to take the refresh lock without waiting
    ///
    /// Returns [`StoreError::Locked`] when the lock is held, whether by another
    /// process or by another caller sharing this store. Stores shared between
    /// processes must provide real mutual exclusion with some form of expiry,
    /// so that a crashed holder cannot keep it forever.
    async fn lock(&self) -> Result<LockToken, StoreError>;

    /// Releases the refresh lock taken with `lock`
    ///
    /// Must be safe to call with `None`, as after a failed [`lock`][Self::lock],
    /// and with a token whose acquisition has already been released or has
    /// expired. In those cases it does nothing, and in particular never
    /// releases an acquisition made by anyone else.
    async fn unlock(&self, lock: Option<LockToken>);
}
