//! REMB-driven bitrate controller.
//!
//! Collects the REMB estimates a listening peer reports and, once per
//! second, derives the target bitrate for the encoder feeding it.
//!
//! * [`RembAlgorithm::Simple`] follows the latest estimate.
//! * [`RembAlgorithm::Matrix`] keeps 30 one-second averages, sums the sign
//!   of every consecutive pair into a trend and moves the bitrate by a
//!   fraction of the gap, one step, or straight down to the average
//!   depending on that trend.
//!
//! Every target goes through [`Bitrate::align`], so it is a multiple of
//! `step` inside `[min, max]`.

use sfu_common::{Bitrate, RembAlgorithm, Ring};
use std::time::{Duration, Instant};
use tracing::debug;

/// Cadence of controller decisions.
pub const REMB_TICK: Duration = Duration::from_secs(1);

/// Samples newer than this feed the Matrix average.
const AVERAGE_WINDOW: Duration = Duration::from_secs(3);

/// One-second averages kept for the trend.
const AVERAGE_HISTORY: usize = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RembSample {
    bitrate: u64,
    at: Instant,
}

#[derive(Debug)]
pub struct RembController {
    // ---
    algorithm: RembAlgorithm,
    bounds: Bitrate,
    bitrate: u64,
    samples: Ring<RembSample>,
    averages: Ring<f64>,
}

impl RembController {
    // ---
    /// Creates a controller starting at `bounds.start`.
    ///
    /// # Arguments
    ///
    /// * `algorithm` - Smoothing algorithm
    /// * `bounds` - Video bitrate bounds and step
    /// * `history` - Raw REMB samples kept
    pub fn new(algorithm: RembAlgorithm, bounds: Bitrate, history: usize) -> Self {
        // ---
        Self {
            algorithm,
            bounds,
            bitrate: bounds.align(bounds.start),
            samples: Ring::new(history),
            averages: Ring::new(AVERAGE_HISTORY),
        }
    }

    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    pub fn algorithm(&self) -> RembAlgorithm {
        self.algorithm
    }

    /// Records one REMB estimate received at `at`.
    pub fn push(&mut self, bitrate: u64, at: Instant) {
        // ---
        self.samples.push_back(RembSample { bitrate, at });
    }

    /// Runs one decision. Returns the new target when it changed.
    pub fn on_tick(&mut self, now: Instant) -> Option<u64> {
        // ---
        let last = self.samples.last()?.bitrate;

        match self.algorithm {
            RembAlgorithm::Simple => self.change_bitrate(last as f64),
            RembAlgorithm::Matrix => {
                let avg = self.recent_average(now);
                self.averages.push_back(avg);
                let trend = self.trend();
                debug!("REMB average {:.0}, trend {}", avg, trend);
                self.matrix_step(avg, trend)
            }
        }
    }

    fn matrix_step(&mut self, avg: f64, trend: i32) -> Option<u64> {
        // ---
        let bitrate = self.bitrate as f64;
        let step = self.bounds.step as f64;

        let target = if trend > 0 && avg > bitrate + 3.0 * step {
            bitrate + (avg - bitrate) / 3.0
        } else if trend > 0 && avg > bitrate + step {
            bitrate + step
        } else if trend > 0 && avg < bitrate {
            avg
        } else if trend < 0 && avg >= bitrate - step {
            bitrate - step
        } else if trend < 0 && avg < bitrate - step {
            avg
        } else {
            return None;
        };
        self.change_bitrate(target)
    }

    /// Mean of the samples newer than [`AVERAGE_WINDOW`]; the minimum
    /// bitrate when there are none.
    fn recent_average(&self, now: Instant) -> f64 {
        // ---
        let recent: Vec<u64> = self
            .samples
            .iter()
            .filter(|s| now.saturating_duration_since(s.at) < AVERAGE_WINDOW)
            .map(|s| s.bitrate)
            .collect();

        if recent.is_empty() {
            return self.bounds.min as f64;
        }
        recent.iter().map(|b| *b as f64).sum::<f64>() / recent.len() as f64
    }

    /// Sum over consecutive averages of +1 (rising), -1 (falling) or 0.
    fn trend(&self) -> i32 {
        // ---
        let averages: Vec<f64> = self.averages.iter().copied().collect();
        averages
            .windows(2)
            .map(|pair| {
                if pair[1] > pair[0] {
                    1
                } else if pair[1] < pair[0] {
                    -1
                } else {
                    0
                }
            })
            .sum()
    }

    fn change_bitrate(&mut self, target: f64) -> Option<u64> {
        // ---
        let aligned = self.bounds.align(target.max(0.0) as u64);
        if aligned == self.bitrate {
            return None;
        }
        debug!("REMB controller: {} -> {} bits/s", self.bitrate, aligned);
        self.bitrate = aligned;
        Some(aligned)
    }
}
