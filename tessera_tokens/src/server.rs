use std::{error, fmt, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot, watch, Mutex},
    task::JoinHandle,
};

use crate::{
    daemon::{self, DaemonConfig, Handoff},
    retry::{retry, RetryConfig},
    stores::LockToken,
    AccessToken, TokenError, TokenFetcher, TokenStore,
};

/// Serves a cached access token and keeps it fresh
///
/// Constructing a server spawns its refresh daemon onto the current Tokio
/// runtime. Clones share the same daemon. The daemon stops on
/// [`shutdown`][Self::shutdown] or once every clone has been dropped.
pub struct TokenServer<S: ?Sized, F> {
    store: Arc<S>,
    fetcher: Arc<F>,
    retry: RetryConfig,
    handoffs: mpsc::Sender<Handoff>,
    control: Arc<DaemonControl>,
}

struct DaemonControl {
    stop: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: ?Sized, F> Clone for TokenServer<S, F> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            retry: self.retry,
            handoffs: self.handoffs.clone(),
            control: Arc::clone(&self.control),
        }
    }
}

impl<S: ?Sized, F> fmt::Debug for TokenServer<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TokenServer")
            .field("retry", &self.retry)
            .field("daemon_running", &!self.handoffs.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S, F> TokenServer<S, F>
where
    S: TokenStore + ?Sized + 'static,
    F: TokenFetcher + 'static,
{
    /// Spawns a new token server with the default daemon and retry configuration
    ///
    /// The store is shared: other servers, possibly in other processes, may use
    /// the same backing storage.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn(store: Arc<S>, fetcher: F) -> Self {
        Self::spawn_with_config(store, fetcher, DaemonConfig::default(), RetryConfig::default())
    }

    /// Spawns a new token server with explicit configuration
    ///
    /// `retry` governs how a caller that finds the refresh lock taken re-reads
    /// the store while it waits for the holder to publish.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn spawn_with_config(
        store: Arc<S>,
        fetcher: F,
        daemon_config: DaemonConfig,
        retry: RetryConfig,
    ) -> Self {
        let fetcher = Arc::new(fetcher);
        let (handoffs, handoff_rx) = mpsc::channel(1);
        let (stop, stop_rx) = watch::channel(false);

        let task = tokio::spawn(daemon::run(
            Arc::clone(&store),
            Arc::clone(&fetcher),
            handoff_rx,
            stop_rx,
            daemon_config,
        ));

        Self {
            store,
            fetcher,
            retry,
            handoffs,
            control: Arc::new(DaemonControl {
                stop,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Gets a usable token, refreshing it if the store has none
    pub async fn token(&self) -> Result<AccessToken, TokenError<F::Error>> {
        match self.store.get().await {
            Ok(token) if !token.as_str().is_empty() => Ok(token),
            Ok(_) => {
                tracing::debug!("store returned an empty token, refreshing");
                self.refresh_token().await
            }
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "no usable token in store, refreshing"
                );
                self.refresh_token().await
            }
        }
    }

    /// Forces a refresh of the token
    ///
    /// If the refresh lock is free, a new token is fetched and returned as soon
    /// as the daemon has taken it for persistence. If the lock is taken, no
    /// fetch happens: the store is re-read with backoff in the hope that the
    /// holder publishes a fresh token, and the last read's outcome is returned.
    pub async fn refresh_token(&self) -> Result<AccessToken, TokenError<F::Error>> {
        if self.handoffs.is_closed() {
            return Err(TokenError::DaemonStopped);
        }

        let token = match self.store.lock().await {
            Ok(token) => token,
            Err(error) => {
                tracing::debug!(
                    error = (&error as &dyn error::Error),
                    "refresh lock unavailable, reading the token published by its holder"
                );
                let store = &self.store;
                return retry(&self.retry, || store.get())
                    .await
                    .map_err(TokenError::Store);
            }
        };

        let lock = HeldLock::new(Arc::clone(&self.store), token);
        let result = self.fetch_and_hand_off().await;
        lock.release().await;
        result
    }

    /// Stops the refresh daemon and waits for it to finish
    ///
    /// Cached tokens can still be read afterwards, but refreshes fail with
    /// [`TokenError::DaemonStopped`] before contacting the issuer, since
    /// nothing would persist the result.
    pub async fn shutdown(&self) {
        let _ = self.control.stop.send(true);

        let task = self.control.task.lock().await.take();
        if let Some(task) = task {
            match task.await {
                Ok(()) => tracing::info!("refresh daemon shut down"),
                Err(err) if err.is_panic() => tracing::error!("refresh daemon panicked"),
                Err(_) => tracing::info!("refresh daemon was cancelled"),
            }
        }
    }

    async fn fetch_and_hand_off(&self) -> Result<AccessToken, TokenError<F::Error>> {
        let credential = match self.fetcher.fetch().await {
            Ok(credential) => credential,
            Err(error) => {
                tracing::warn!(
                    error = (&error as &dyn error::Error),
                    "error requesting token"
                );
                return Err(TokenError::Fetch(error));
            }
        };

        tracing::info!(lifetime = credential.valid_for().0, "fetched new token");

        let access_token = credential.access_token().to_owned();
        let (received, ack) = oneshot::channel();
        self.handoffs
            .send(Handoff {
                credential,
                received,
            })
            .await
            .map_err(|_| TokenError::DaemonStopped)?;
        ack.await.map_err(|_| TokenError::DaemonStopped)?;

        Ok(access_token)
    }
}

/// The refresh lock, held by a caller of [`TokenServer::refresh_token`]
///
/// Released explicitly on every normal exit path. If the holding future is
/// dropped mid-refresh, the release is spawned instead.
struct HeldLock<S: TokenStore + ?Sized + 'static> {
    held: Option<(Arc<S>, LockToken)>,
}

impl<S: TokenStore + ?Sized + 'static> HeldLock<S> {
    fn new(store: Arc<S>, token: LockToken) -> Self {
        Self {
            held: Some((store, token)),
        }
    }

    async fn release(mut self) {
        if let Some((store, token)) = self.held.take() {
            store.unlock(Some(token)).await;
        }
    }
}

impl<S: TokenStore + ?Sized + 'static> Drop for HeldLock<S> {
    fn drop(&mut self) {
        if let Some((store, token)) = self.held.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    tracing::debug!("refresh abandoned while holding the lock, releasing it");
                    handle.spawn(async move { store.unlock(Some(token)).await });
                }
                Err(_) => {
                    tracing::warn!("refresh abandoned outside of a runtime, lock left to expire")
                }
            }
        }
    }
}
