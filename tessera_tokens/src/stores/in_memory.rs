//! An in-process token store

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use std::{fmt, sync::Arc};
use tessera_clock::{Clock, DurationSecs, System, UnixTime};

use super::{LockToken, TokenStore};
use crate::{AccessToken, AccessTokenRef, StoreError};

#[derive(Debug)]
struct Entry {
    token: AccessToken,
    expires_at: UnixTime,
}

/// A token store that keeps the token in process memory
///
/// Its lock always succeeds and unlocking does nothing, so it offers no
/// exclusion at all. Use it when a single instance owns the token.
pub struct InMemoryTokenStore<C = System> {
    entry: ArcSwapOption<Entry>,
    clock: C,
}

impl InMemoryTokenStore<System> {
    /// Constructs an empty store using the system clock
    pub fn new() -> Self {
        Self::with_clock(System)
    }
}

impl Default for InMemoryTokenStore<System> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> InMemoryTokenStore<C> {
    /// Constructs an empty store that judges expiry by `clock`
    pub fn with_clock(clock: C) -> Self {
        Self {
            entry: ArcSwapOption::empty(),
            clock,
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for InMemoryTokenStore<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("InMemoryTokenStore")
            .field("entry", &self.entry.load_full())
            .field("clock", &self.clock)
            .finish()
    }
}

#[async_trait]
impl<C: Clock + Send + Sync> TokenStore for InMemoryTokenStore<C> {
    async fn get(&self) -> Result<AccessToken, StoreError> {
        let entry = self.entry.load_full().ok_or(StoreError::Empty)?;

        if self.clock.now() >= entry.expires_at {
            return Err(StoreError::Expired {
                expired_at: entry.expires_at,
            });
        }

        if entry.token.as_str().is_empty() {
            return Err(StoreError::Empty);
        }

        Ok(entry.token.clone())
    }

    async fn set(&self, token: &AccessTokenRef, ttl: DurationSecs) -> Result<(), StoreError> {
        let expires_at = self.clock.now() + ttl;
        self.entry.store(Some(Arc::new(Entry {
            token: token.to_owned(),
            expires_at,
        })));
        tracing::trace!(expires_at = expires_at.0, "stored token in memory");
        Ok(())
    }

    async fn lock(&self) -> Result<LockToken, StoreError> {
        Ok(LockToken::new())
    }

    async fn unlock(&self, _lock: Option<LockToken>) {}
}
