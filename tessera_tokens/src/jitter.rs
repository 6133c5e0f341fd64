//! Utilities for spreading out the first background refresh
//!
//! Many instances started together against one authority would otherwise all
//! refresh at the same moment. The refresh daemon draws its first interval from
//! a [`JitterSource`] so their schedules drift apart.

use rand::{rngs::StdRng, Rng, SeedableRng};
use tessera_clock::DurationSecs;

const SECS_PER_HOUR: u64 = 60 * 60;
const BASE_HOURS: u64 = 100;
const SPREAD_HOURS: u64 = 200;
const MULTIPLIER: u64 = 2;

/// A type that picks the refresh daemon's first interval
pub trait JitterSource {
    /// Picks an interval to wait before the first background refresh
    fn initial_interval(&mut self) -> DurationSecs;
}

/// A jitter source that always picks the same interval
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedInterval(pub DurationSecs);

impl JitterSource for FixedInterval {
    #[inline]
    fn initial_interval(&mut self) -> DurationSecs {
        self.0
    }
}

/// Picks the first interval uniformly from a wide band of hours
///
/// The interval is `(100 + U[0, 200)) * 2` hours, so it always lies in
/// `[200, 600)` hours. The first token pushed to the daemon retunes the
/// interval to that token's lifetime.
#[derive(Debug)]
pub struct RandomHoursJitter<R> {
    rand_source: R,
}

impl RandomHoursJitter<StdRng> {
    /// Constructs a new instance seeded from the operating system
    pub fn new() -> Self {
        Self {
            rand_source: StdRng::from_entropy(),
        }
    }

    /// Constructs a new instance with a fixed seed, for reproducible schedules
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }
}

impl Default for RandomHoursJitter<StdRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> RandomHoursJitter<R> {
    /// Constructs a new instance drawing from `rand_source`
    pub fn with_rng(rand_source: R) -> Self {
        Self { rand_source }
    }
}

impl<R: Rng> JitterSource for RandomHoursJitter<R> {
    fn initial_interval(&mut self) -> DurationSecs {
        let spread = self.rand_source.gen_range(0..SPREAD_HOURS);
        let hours = (BASE_HOURS + spread) * MULTIPLIER;
        DurationSecs(hours * SECS_PER_HOUR)
    }
}
