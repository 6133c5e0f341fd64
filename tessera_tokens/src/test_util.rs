use std::{
    io,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tessera_clock::DurationSecs;

use crate::{
    stores::{InMemoryTokenStore, LockToken},
    AccessToken, AccessTokenRef, Credential, StoreError,
    TokenFetcher, TokenStore,
};

/// An in-memory store that records how it is used
#[derive(Debug, Default)]
pub(crate) struct RecordingStore {
    inner: InMemoryTokenStore,
    contended: bool,
    history: Mutex<Vec<String>>,
    pub(crate) gets: AtomicUsize,
    pub(crate) sets: AtomicUsize,
    pub(crate) locks: AtomicUsize,
    pub(crate) unlocks: AtomicUsize,
    pub(crate) releases: AtomicUsize,
}

impl RecordingStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// A store whose lock is always held by someone else
    pub(crate) fn contended() -> Self {
        Self {
            contended: true,
            ..Self::default()
        }
    }

    pub(crate) fn history(&self) -> Vec<String> {
        self.history.lock().unwrap().clone()
    }

    pub(crate) fn current(&self) -> Option<String> {
        self.history.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl TokenStore for RecordingStore {
    async fn get(&self) -> Result<AccessToken, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get().await
    }

    async fn set(&self, token: &AccessTokenRef, ttl: DurationSecs) -> Result<(), StoreError> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.history.lock().unwrap().push(token.as_str().to_owned());
        self.inner.set(token, ttl).await
    }

    async fn lock(&self) -> Result<LockToken, StoreError> {
        self.locks.fetch_add(1, Ordering::SeqCst);
        if self.contended {
            Err(StoreError::Locked)
        } else {
            Ok(LockToken::new())
        }
    }

    /// Counts every call in `unlocks` and those carrying a token in `releases`
    async fn unlock(&self, lock: Option<LockToken>) {
        self.unlocks.fetch_add(1, Ordering::SeqCst);
        if lock.is_some() {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// A fetcher issuing `value` valid for `valid_for` seconds, counting its calls
pub(crate) fn counting_fetcher(
    value: &'static str,
    valid_for: u64,
) -> (impl TokenFetcher<Error = io::Error>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetcher = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Ok::<_, io::Error>(Credential::new(value, DurationSecs(valid_for))) }
    };
    (fetcher, calls)
}

/// A fetcher that always fails with `message`, counting its calls
pub(crate) fn failing_fetcher(
    message: &'static str,
) -> (impl TokenFetcher<Error = io::Error>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let fetcher = move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async move { Err::<Credential, _>(io::Error::new(io::ErrorKind::TimedOut, message)) }
    };
    (fetcher, calls)
}
