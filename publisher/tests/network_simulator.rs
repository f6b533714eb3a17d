//! Network simulator for testing resilience.
//!
//! Applies packet loss, jitter and reordering to RTP packets in process.
//! Time is injected by the caller so tests stay deterministic: a packet
//! sent at `now` becomes deliverable at `now + delay`, and is stamped with
//! its delivery time as receive time.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfu_common::RtpPacket;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Network simulator configuration.
#[derive(Debug, Clone)]
pub struct NetworkSimulatorConfig {
    // ---
    /// Packet loss rate (0.0 to 1.0)
    pub loss_rate: f64,

    /// Maximum extra delay in milliseconds
    pub jitter_ms: u32,

    /// Packet reordering rate (0.0 to 1.0)
    pub reorder_rate: f64,

    /// Random seed for deterministic testing
    pub seed: u64,
}

impl Default for NetworkSimulatorConfig {
    fn default() -> Self {
        // ---
        Self {
            loss_rate: 0.0,
            jitter_ms: 0,
            reorder_rate: 0.0,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone)]
struct DelayedPacket {
    packet: RtpPacket,
    delivery_time: Instant,
}

/// Simulates network conditions for testing.
pub struct NetworkSimulator {
    // ---
    config: NetworkSimulatorConfig,
    rng: StdRng,
    delayed_queue: VecDeque<DelayedPacket>,
    packets_sent: u64,
    packets_lost: u64,
    packets_reordered: u64,
}

impl NetworkSimulator {
    // ---
    pub fn new(config: NetworkSimulatorConfig) -> Self {
        // ---
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            rng,
            delayed_queue: VecDeque::new(),
            packets_sent: 0,
            packets_lost: 0,
            packets_reordered: 0,
        }
    }

    /// Sends a packet through the simulator at `now`.
    pub fn send(&mut self, packet: RtpPacket, now: Instant) {
        // ---
        self.packets_sent += 1;

        if self.rng.gen_bool(self.config.loss_rate) {
            self.packets_lost += 1;
            return;
        }

        let delay = self.calculate_delay();
        let delayed = DelayedPacket {
            packet,
            delivery_time: now + delay,
        };

        // Reordering: queue the packet ahead of earlier ones
        if self.rng.gen_bool(self.config.reorder_rate) && !self.delayed_queue.is_empty() {
            self.packets_reordered += 1;
            let pos = self.rng.gen_range(0..self.delayed_queue.len());
            self.delayed_queue.insert(pos, delayed);
        } else {
            self.delayed_queue.push_back(delayed);
        }
    }

    /// Returns the first queued packet due at `now`, stamped as received
    /// at `now`.
    pub fn receive(&mut self, now: Instant) -> Option<RtpPacket> {
        // ---
        let pos = self
            .delayed_queue
            .iter()
            .position(|d| d.delivery_time <= now)?;
        let delayed = self.delayed_queue.remove(pos)?;
        Some(delayed.packet.with_created_at(now))
    }

    pub fn in_flight(&self) -> usize {
        self.delayed_queue.len()
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }

    pub fn packets_reordered(&self) -> u64 {
        self.packets_reordered
    }

    fn calculate_delay(&mut self) -> Duration {
        // ---
        if self.config.jitter_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(self.rng.gen_range(0..=self.config.jitter_ms) as u64)
    }
}
