//! Feedback-driven choice between single-message and two-phase delivery.
//!
//! When several requesters receive the same subscription from different
//! upstreams, each tracks how many of its products were actually stored
//! (accepted) versus already present (rejected). A primary requester that
//! mostly loses the race should become alternate, and an alternate that
//! keeps winning should become primary.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AutoshiftError {
    /// A subscription is always fed by at least one requester.
    #[error("peer count must be positive")]
    ZeroPeerCount,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    accepted: bool,
}

/// Accept/reject statistics for one requester.
#[derive(Debug, Clone)]
pub struct AutoshiftController {
    interval: Duration,
    samples: VecDeque<Sample>,
    last_decision: Instant,
    peer_count: u32,
    is_primary: bool,
    switch: bool,
}

impl AutoshiftController {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            samples: VecDeque::new(),
            last_decision: Instant::now(),
            peer_count: 0,
            is_primary: true,
            switch: false,
        }
    }

    fn reset_at(&mut self, now: Instant) {
        self.last_decision = now;
        self.switch = false;
        self.samples.clear();
    }

    /// Declares how many requesters feed the same subscription. A change
    /// discards the gathered statistics.
    pub fn set_peer_count(&mut self, count: u32) -> Result<(), AutoshiftError> {
        if count == 0 {
            return Err(AutoshiftError::ZeroPeerCount);
        }
        if count != self.peer_count {
            self.reset_at(Instant::now());
            self.peer_count = count;
        }
        Ok(())
    }

    pub fn peer_count(&self) -> u32 {
        self.peer_count
    }

    /// Restarts measurement for a new connection in the given mode.
    pub fn init(&mut self, is_primary: bool) {
        self.init_at(is_primary, Instant::now());
    }

    pub fn init_at(&mut self, is_primary: bool, now: Instant) {
        self.reset_at(now);
        self.is_primary = is_primary;
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary
    }

    pub fn record_outcome(&mut self, accepted: bool) {
        self.record_outcome_at(accepted, Instant::now());
    }

    /// Records whether a received product was stored. Only meaningful with
    /// more than one requester.
    pub fn record_outcome_at(&mut self, accepted: bool, now: Instant) {
        if self.peer_count <= 1 {
            return;
        }
        self.samples.push_back(Sample { at: now, accepted });
        while self
            .samples
            .front()
            .is_some_and(|sample| sample.at <= self.last_decision)
        {
            self.samples.pop_front();
        }

        let period = now.saturating_duration_since(self.last_decision);
        if period < self.interval * 2 {
            self.switch = false;
            debug!("autoshift: period={:?}", period);
            return;
        }

        let accepted_count = self.samples.iter().filter(|s| s.accepted).count();
        let rejected_count = self.samples.len() - accepted_count;
        if self.samples.is_empty() {
            self.switch = false;
        } else {
            let rejected_mean = rejected_count as f64 / f64::from(self.peer_count - 1);
            let accepted_count = accepted_count as f64;
            self.switch = if self.is_primary {
                accepted_count <= rejected_mean
            } else {
                accepted_count >= rejected_mean
            };
            debug!(
                "autoshift: period={:?}, accepted={}, rejected={}, peers={}, primary={}, switch={}",
                period, accepted_count, rejected_count, self.peer_count, self.is_primary, self.switch
            );
        }
        self.last_decision = now;
    }

    /// Whether the transfer mode should flip.
    pub fn should_switch(&self) -> bool {
        match self.peer_count {
            0 => false,
            1 => !self.is_primary,
            _ => self.switch,
        }
    }
}
