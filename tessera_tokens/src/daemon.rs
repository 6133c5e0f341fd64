use std::{error, sync::Arc, time::Duration};

use tessera_clock::DurationSecs;
use tokio::{
    sync::{mpsc, oneshot, watch},
    time::{self, Instant, Interval, MissedTickBehavior},
};

use crate::{
    jitter::{JitterSource, RandomHoursJitter},
    Credential, TokenFetcher, TokenStore,
};

const DEFAULT_HYSTERESIS: DurationSecs = DurationSecs(5);

// Tokens valid for less than a second still need a ticking timer.
const MIN_INTERVAL: DurationSecs = DurationSecs(1);

/// Configuration for the background refresh daemon
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DaemonConfig {
    initial_interval: DurationSecs,
    hysteresis: DurationSecs,
}

impl Default for DaemonConfig {
    /// Default daemon configuration
    ///
    /// Draws the first interval from a [`RandomHoursJitter`] and only
    /// reschedules after a background refresh when the token lifetime changed
    /// by more than 5 seconds.
    fn default() -> Self {
        Self::from_jitter(&mut RandomHoursJitter::new())
    }
}

impl DaemonConfig {
    /// Constructs a configuration whose first interval is drawn from `jitter`
    pub fn from_jitter<J: JitterSource + ?Sized>(jitter: &mut J) -> Self {
        Self {
            initial_interval: jitter.initial_interval(),
            hysteresis: DEFAULT_HYSTERESIS,
        }
    }

    /// Sets the interval before the first background refresh
    pub fn with_initial_interval(mut self, initial_interval: DurationSecs) -> Self {
        self.initial_interval = initial_interval;
        self
    }

    /// Sets how much a token lifetime must change before a background refresh
    /// reschedules the timer
    pub fn with_hysteresis(mut self, hysteresis: DurationSecs) -> Self {
        self.hysteresis = hysteresis;
        self
    }

    /// The interval before the first background refresh
    pub fn initial_interval(&self) -> DurationSecs {
        self.initial_interval
    }

    /// The reschedule threshold
    pub fn hysteresis(&self) -> DurationSecs {
        self.hysteresis
    }
}

/// A freshly fetched credential on its way to the daemon
///
/// `received` is completed as soon as the daemon takes the credential, before
/// it is persisted.
#[derive(Debug)]
pub(crate) struct Handoff {
    pub(crate) credential: Credential,
    pub(crate) received: oneshot::Sender<()>,
}

fn start_ticker(interval: DurationSecs) -> Interval {
    let period = Duration::from(interval.max(MIN_INTERVAL));
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn persist<S>(store: &S, credential: &Credential)
where
    S: TokenStore + ?Sized,
{
    if let Err(error) = store
        .set(credential.access_token(), credential.valid_for())
        .await
    {
        tracing::warn!(
            error = (&error as &dyn error::Error),
            "unable to persist token to store"
        );
    }
}

/// Runs the refresh daemon until stopped
///
/// Every store write made on behalf of the server happens here, so writes are
/// applied in the order the credentials arrived.
pub(crate) async fn run<S, F>(
    store: Arc<S>,
    fetcher: Arc<F>,
    mut handoffs: mpsc::Receiver<Handoff>,
    mut stop: watch::Receiver<bool>,
    config: DaemonConfig,
) where
    S: TokenStore + ?Sized,
    F: TokenFetcher + ?Sized,
{
    let mut interval = config.initial_interval;
    let mut ticker = start_ticker(interval);

    tracing::info!(interval = interval.0, "refresh daemon started");

    loop {
        tokio::select! {
            _ = stop.changed() => {
                tracing::info!("refresh daemon stopping");
                return;
            }
            handoff = handoffs.recv() => {
                let Handoff { credential, received } = match handoff {
                    Some(handoff) => handoff,
                    None => {
                        tracing::info!("all token servers dropped, refresh daemon stopping");
                        return;
                    }
                };

                // The sender may have been cancelled; the token is still good.
                let _ = received.send(());

                persist(&*store, &credential).await;

                interval = credential.valid_for();
                ticker = start_ticker(interval);
                tracing::debug!(interval = interval.0, "persisted pushed token, timer restarted");
            }
            _ = ticker.tick() => {
                if let Some(next) = refresh_on_tick(&*store, &*fetcher).await {
                    if interval.abs_diff(next) > config.hysteresis {
                        tracing::debug!(
                            previous = interval.0,
                            interval = next.0,
                            "token lifetime changed, timer restarted"
                        );
                        interval = next;
                        ticker = start_ticker(interval);
                    } else {
                        tracing::trace!(interval = interval.0, "token lifetime stable, keeping timer");
                    }
                }
            }
        }
    }
}

/// Attempts a locked refresh, returning the new token lifetime on success
///
/// The lock is released afterwards whether or not it was taken.
async fn refresh_on_tick<S, F>(store: &S, fetcher: &F) -> Option<DurationSecs>
where
    S: TokenStore + ?Sized,
    F: TokenFetcher + ?Sized,
{
    let (lock, next) = match store.lock().await {
        Ok(lock) => {
            tracing::debug!("requesting new token");
            let next = match fetcher.fetch().await {
                Ok(credential) => {
                    persist(store, &credential).await;
                    tracing::info!(lifetime = credential.valid_for().0, "refreshed token in background");
                    Some(credential.valid_for())
                }
                Err(error) => {
                    tracing::warn!(
                        error = (&error as &dyn error::Error),
                        "error requesting token, will retry at next tick"
                    );
                    None
                }
            };
            (Some(lock), next)
        }
        Err(error) => {
            tracing::debug!(
                error = (&error as &dyn error::Error),
                "refresh lock unavailable, skipping background refresh"
            );
            (None, None)
        }
    };

    store.unlock(lock).await;
    next
}
