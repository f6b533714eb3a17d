//! Lossy link between the listener and its peer.
//!
//! Drops packets at a fixed rate and delivers the rest, in order, after a
//! constant one-way latency. Time is injected by the caller; delivered
//! packets are stamped with their delivery time.

#![allow(dead_code)]

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sfu_common::RtpPacket;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct NetworkSimulatorConfig {
    // ---
    /// Packet loss rate (0.0 to 1.0)
    pub loss_rate: f64,

    /// One-way latency in milliseconds
    pub latency_ms: u64,

    /// Random seed for deterministic testing
    pub seed: u64,
}

impl Default for NetworkSimulatorConfig {
    fn default() -> Self {
        // ---
        Self {
            loss_rate: 0.0,
            latency_ms: 10,
            seed: 42,
        }
    }
}

pub struct NetworkSimulator {
    // ---
    loss_rate: f64,
    latency: Duration,
    rng: StdRng,
    queue: VecDeque<(Instant, RtpPacket)>,
    packets_lost: u64,
}

impl NetworkSimulator {
    // ---
    pub fn new(config: NetworkSimulatorConfig) -> Self {
        // ---
        Self {
            loss_rate: config.loss_rate,
            latency: Duration::from_millis(config.latency_ms),
            rng: StdRng::seed_from_u64(config.seed),
            queue: VecDeque::new(),
            packets_lost: 0,
        }
    }

    pub fn send(&mut self, packet: RtpPacket, now: Instant) {
        // ---
        if self.rng.gen_bool(self.loss_rate) {
            self.packets_lost += 1;
            return;
        }
        self.queue.push_back((now + self.latency, packet));
    }

    /// Next packet due at `now`, stamped as received at `now`.
    pub fn receive(&mut self, now: Instant) -> Option<RtpPacket> {
        // ---
        if self.queue.front().map_or(true, |(due, _)| *due > now) {
            return None;
        }
        self.queue.pop_front().map(|(_, p)| p.with_created_at(now))
    }

    pub fn in_flight(&self) -> usize {
        self.queue.len()
    }

    pub fn packets_lost(&self) -> u64 {
        self.packets_lost
    }
}
