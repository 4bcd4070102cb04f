//! Round clock
//!
//! Tracks the current round index and its start timestamp relative to a
//! genesis time and a fixed round duration:
//! - `index = floor((now - genesis) / duration) + start_round`
//! - `timestamp = genesis + (index - start_round) * duration`
//!
//! An index below zero means the chain has not reached genesis yet.

use crate::errors::{SposError, SposResult};
use chrono::{DateTime, TimeDelta, Utc};
use core::fmt::Debug;
use parking_lot::RwLock;
use std::sync::Arc;

/// Synchronised time source
pub trait SyncTimer: Send + Sync + Debug {
    /// Current time according to this source
    fn current_time(&self) -> DateTime<Utc>;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemSyncTimer;

impl SyncTimer for SystemSyncTimer {
    fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock driven by tokio's instant, so paused test runtimes control it
#[derive(Debug, Clone)]
pub struct TokioSyncTimer {
    base_time: DateTime<Utc>,
    base_instant: tokio::time::Instant,
}

impl TokioSyncTimer {
    /// Start the clock at `base_time`
    pub fn new(base_time: DateTime<Utc>) -> Self {
        Self { base_time, base_instant: tokio::time::Instant::now() }
    }
}

impl SyncTimer for TokioSyncTimer {
    fn current_time(&self) -> DateTime<Utc> {
        let elapsed = self.base_instant.elapsed();
        self.base_time + TimeDelta::from_std(elapsed).unwrap_or(TimeDelta::MAX)
    }
}

#[derive(Debug, Clone, Copy)]
struct RoundState {
    index: i64,
    timestamp: DateTime<Utc>,
}

/// Round clock shared by all consensus components of a node
#[derive(Debug)]
pub struct Round {
    duration: TimeDelta,
    start_round: i64,
    sync_timer: Arc<dyn SyncTimer>,
    state: RwLock<RoundState>,
}

impl Round {
    /// Create a round clock positioned at `current_time`
    ///
    /// Fails with [`SposError::NilSyncTimer`] when no time source is given.
    pub fn new(
        genesis_time: DateTime<Utc>,
        current_time: DateTime<Utc>,
        duration: TimeDelta,
        sync_timer: Option<Arc<dyn SyncTimer>>,
        start_round: i64,
    ) -> SposResult<Self> {
        let sync_timer = sync_timer.ok_or(SposError::NilSyncTimer)?;
        if duration <= TimeDelta::zero() {
            return Err(SposError::InvalidRoundDuration);
        }

        let round = Self {
            duration,
            start_round,
            sync_timer,
            state: RwLock::new(RoundState { index: start_round, timestamp: genesis_time }),
        };
        round.update_round(genesis_time, current_time);
        Ok(round)
    }

    /// Current round index
    pub fn index(&self) -> i64 {
        self.state.read().index
    }

    /// Start time of the current round
    pub fn time_stamp(&self) -> DateTime<Utc> {
        self.state.read().timestamp
    }

    /// Round duration
    pub const fn time_duration(&self) -> TimeDelta {
        self.duration
    }

    /// Index of the first round
    pub const fn start_round(&self) -> i64 {
        self.start_round
    }

    /// Current time from the sync timer
    pub fn now(&self) -> DateTime<Utc> {
        self.sync_timer.current_time()
    }

    /// Recompute index and timestamp for `current_time`
    ///
    /// Calls within the same round leave the state untouched.
    pub fn update_round(&self, genesis_time: DateTime<Utc>, current_time: DateTime<Utc>) {
        let elapsed = (current_time - genesis_time).num_nanoseconds().unwrap_or(i64::MAX);
        let duration = self.duration.num_nanoseconds().unwrap_or(i64::MAX);
        let index = elapsed.div_euclid(duration) + self.start_round;

        let timestamp = genesis_time
            + TimeDelta::nanoseconds(duration.saturating_mul(index - self.start_round));

        let mut state = self.state.write();
        if state.index != index {
            state.index = index;
            state.timestamp = timestamp;
        }
    }

    /// Time left until `max_time` has passed since `start_time`
    ///
    /// Negative once overrun; callers treat that as expired.
    pub fn remaining_time(&self, start_time: DateTime<Utc>, max_time: TimeDelta) -> TimeDelta {
        let elapsed = self.now() - start_time;
        max_time - elapsed
    }

    /// Step back exactly one round
    pub fn revert_one_round(&self) {
        let mut state = self.state.write();
        state.index -= 1;
        state.timestamp -= self.duration;
    }

    /// Whether the clock is still before genesis
    pub fn before_genesis(&self) -> bool {
        self.index() < 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    const ROUND_MS: i64 = 10;

    fn duration() -> TimeDelta {
        TimeDelta::milliseconds(ROUND_MS)
    }

    fn timer() -> Option<Arc<dyn SyncTimer>> {
        Some(Arc::new(SystemSyncTimer))
    }

    #[test]
    fn test_new_round_without_sync_timer_fails() {
        let now = Utc::now();
        assert_matches!(Round::new(now, now, duration(), None, 0), Err(SposError::NilSyncTimer));
    }

    #[test]
    fn test_new_round_with_zero_duration_fails() {
        let now = Utc::now();
        assert_matches!(
            Round::new(now, now, TimeDelta::zero(), timer(), 0),
            Err(SposError::InvalidRoundDuration)
        );
    }

    #[test]
    fn test_update_round_within_same_round_keeps_index() {
        let genesis = Utc::now();
        let round = Round::new(genesis, genesis, duration(), timer(), 0).unwrap();
        round.update_round(genesis, genesis + duration() / 2);
        assert_eq!(round.index(), 0);
        assert_eq!(round.time_stamp(), genesis);
    }

    #[test]
    fn test_update_round_moves_to_next_round() {
        let genesis = Utc::now();
        let round = Round::new(genesis, genesis, duration(), timer(), 0).unwrap();
        round.update_round(genesis, genesis + duration() + duration() / 2);
        assert_eq!(round.index(), 1);
        assert_eq!(round.time_stamp(), genesis + duration());
    }

    #[test]
    fn test_revert_one_round() {
        let genesis = Utc::now();
        let round = Round::new(genesis, genesis, duration(), timer(), 10).unwrap();
        assert_eq!(round.index(), 10);
        round.revert_one_round();
        assert_eq!(round.index(), 9);
        assert_eq!(round.time_stamp(), genesis - duration());
    }

    #[test]
    fn test_before_genesis() {
        let genesis = Utc::now();
        let round = Round::new(genesis, genesis, duration(), timer(), -1).unwrap();
        assert!(round.before_genesis());
        round.update_round(genesis, genesis + duration());
        assert!(!round.before_genesis());
        assert_eq!(round.index(), 0);
    }

    #[test]
    fn test_negative_index_before_genesis_time() {
        let genesis = Utc::now();
        let round =
            Round::new(genesis, genesis - duration() * 3 / 2, duration(), timer(), 0).unwrap();
        assert_eq!(round.index(), -2);
        assert_eq!(round.time_stamp(), genesis - duration() * 2);
        assert!(round.before_genesis());
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_time_goes_negative() {
        let genesis = Utc::now();
        let clock: Arc<dyn SyncTimer> = Arc::new(TokioSyncTimer::new(genesis));
        let round = Round::new(genesis, genesis, duration(), Some(clock), 0).unwrap();

        let remaining = round.remaining_time(round.time_stamp(), duration());
        assert_eq!(remaining, duration());

        tokio::time::advance(std::time::Duration::from_millis(15)).await;
        let remaining = round.remaining_time(round.time_stamp(), duration());
        assert_eq!(remaining, TimeDelta::milliseconds(-5));
    }
}
