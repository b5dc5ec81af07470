//! Request window bookkeeping for one window-worker.
//!
//! `TransferWindow` owns the in-flight chunks of a transfer and decides what
//! to request next, when a chunk counts as lost and how long to wait. It does
//! no I/O: the session feeds it packet ids and timer expiries.
//!
//! ```text
//! outstanding ──dispatch──> in-flight chunk ──on_packet──> (empty) ──reap──> retired
//!      ^                         │
//!      └──────reap (idle > threshold)
//! ```

use std::time::Duration;

use reach_protocol::{Interval, IntervalSet, MAX_ENCODED_INTERVALS};

use crate::error::ConfigError;

/// Tunables of the request window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowConfig {
    /// Packets asked for per RequestFilePackets.
    pub request_window: u64,
    /// Upper bound on packets in flight across all chunks.
    pub throttle_ceiling: u64,
    /// Idle rounds after which a chunk is declared lost.
    pub timeout_threshold: u32,
    /// Length of one wait round.
    pub round_interval: Duration,
    /// Consecutive chunk timeouts without any packet before giving up.
    pub max_stalled_timeouts: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            request_window: 64,
            throttle_ceiling: 256,
            timeout_threshold: 100,
            round_interval: Duration::from_millis(5),
            max_stalled_timeouts: 1024,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.request_window == 0 {
            return Err(ConfigError::Constraint("request window must be at least 1".into()));
        }
        if self.throttle_ceiling < self.request_window {
            return Err(ConfigError::Constraint(format!(
                "throttle ceiling {} is below the request window {}",
                self.throttle_ceiling, self.request_window
            )));
        }
        if self.timeout_threshold == 0 {
            return Err(ConfigError::Constraint("timeout threshold must be at least 1".into()));
        }
        if self.round_interval.is_zero() {
            return Err(ConfigError::Constraint("round interval must be non-zero".into()));
        }
        Ok(())
    }
}

/// One outstanding RequestFilePackets: ids not yet received and rounds spent
/// waiting without progress.
#[derive(Debug, Clone)]
pub struct InFlightChunk {
    pub packets: IntervalSet,
    pub idle_rounds: u32,
}

/// What a received packet did to the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketOutcome {
    /// Removed from a chunk that still has packets left.
    Progress,
    /// Removed the last packet of a chunk.
    ChunkComplete,
    /// Not part of any live chunk (duplicate, late or bogus).
    Unexpected,
}

/// Result of one reap pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Reaped {
    pub completed: usize,
    /// Lost chunks, each as (remaining packets, idle rounds).
    pub lost: Vec<(u64, u32)>,
}

/// Counters over the lifetime of a window.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct WindowStats {
    pub requests: u64,
    pub received: u64,
    pub unexpected: u64,
    pub lost_chunks: u64,
    pub lost_packets: u64,
}

#[derive(Debug)]
pub struct TransferWindow {
    config: WindowConfig,
    in_flight: Vec<InFlightChunk>,
    stalled_timeouts: u32,
    stats: WindowStats,
}

impl TransferWindow {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            in_flight: Vec::new(),
            stalled_timeouts: 0,
            stats: WindowStats::default(),
        }
    }

    pub fn config(&self) -> &WindowConfig {
        &self.config
    }

    pub fn stats(&self) -> WindowStats {
        self.stats
    }

    pub fn chunks(&self) -> &[InFlightChunk] {
        &self.in_flight
    }

    /// Packets requested but not yet received, across all chunks.
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.iter().map(|c| c.packets.element_count()).sum()
    }

    /// True once every chunk has been retired.
    pub fn is_drained(&self) -> bool {
        self.in_flight.is_empty()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled_timeouts > self.config.max_stalled_timeouts
    }

    pub fn stalled_timeouts(&self) -> u32 {
        self.stalled_timeouts
    }

    /// Retire completed chunks and hand the ids of timed-out chunks back to
    /// `outstanding`.
    pub fn reap(&mut self, outstanding: &mut IntervalSet) -> Reaped {
        let threshold = self.config.timeout_threshold;
        let mut reaped = Reaped::default();

        self.in_flight.retain(|chunk| {
            if chunk.packets.is_empty() {
                reaped.completed += 1;
                return false;
            }
            if chunk.idle_rounds > threshold {
                outstanding.add_set(&chunk.packets);
                reaped.lost.push((chunk.packets.element_count(), chunk.idle_rounds));
                return false;
            }
            true
        });

        for &(packets, _) in &reaped.lost {
            self.stats.lost_chunks += 1;
            self.stats.lost_packets += packets;
        }
        self.stalled_timeouts = self.stalled_timeouts.saturating_add(reaped.lost.len() as u32);
        reaped
    }

    /// Pop the next request off `outstanding`, or `None` when the ceiling is
    /// reached or nothing is left. The returned set becomes a new chunk.
    pub fn next_request(&mut self, outstanding: &mut IntervalSet) -> Option<IntervalSet> {
        if outstanding.is_empty() || self.in_flight_count() >= self.config.throttle_ceiling {
            return None;
        }

        // A request carries at most MAX_ENCODED_INTERVALS runs.
        let fits: u64 = outstanding
            .intervals()
            .iter()
            .take(MAX_ENCODED_INTERVALS)
            .map(Interval::len)
            .sum();
        let packets = outstanding.remove_first_n(self.config.request_window.min(fits));

        self.in_flight.push(InFlightChunk {
            packets: packets.clone(),
            idle_rounds: 0,
        });
        self.stats.requests += 1;
        Some(packets)
    }

    /// Whether the session should block for a round before dispatching again.
    pub fn should_wait(&self, outstanding: &IntervalSet) -> bool {
        self.in_flight_count() > self.config.request_window
            || outstanding.element_count() < self.config.request_window
    }

    /// A wait round expired with no chunk completing.
    pub fn age(&mut self) {
        if self.in_flight.is_empty() {
            return;
        }
        let chunks = u32::try_from(self.in_flight.len()).unwrap_or(u32::MAX);
        let step = (self.config.timeout_threshold / chunks).max(1);
        for chunk in &mut self.in_flight {
            chunk.idle_rounds = chunk.idle_rounds.saturating_add(step);
        }
    }

    /// Only packets that belong to a live chunk reset the stall counter;
    /// duplicates do not.
    pub fn on_packet(&mut self, packet_id: u64) -> PacketOutcome {
        let Some(chunk) = self.in_flight.iter_mut().find(|c| c.packets.contains(packet_id)) else {
            self.stats.unexpected += 1;
            return PacketOutcome::Unexpected;
        };

        chunk.packets.subtract(packet_id);
        self.stats.received += 1;
        self.stalled_timeouts = 0;
        if chunk.packets.is_empty() {
            PacketOutcome::ChunkComplete
        } else {
            chunk.idle_rounds = 0;
            PacketOutcome::Progress
        }
    }

    /// Count a packet rejected before it reached the window.
    pub fn note_unexpected(&mut self) {
        self.stats.unexpected += 1;
    }

    /// A packet from an already reaped chunk carried data that was still
    /// missing.
    pub fn note_recovered(&mut self) {
        self.stalled_timeouts = 0;
    }
}
