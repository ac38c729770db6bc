//! Seed-Pair Desync Detection
//!
//! At a fixed cadence the server and every client sample two 32-bit
//! accumulators straight from their simulation PRNG state and compare
//! them for the same frame number. Two accumulators instead of one keeps
//! the false-negative probability of a colliding checksum negligible.
//!
//! A mismatch proves the simulations diverged. There is no recovery: the
//! affected client disconnects and may re-join through a fresh handshake.
//!
//! The single-seed and every-frame variants are negotiated during
//! authorization, so both ends always agree on cadence and payload shape.
//! The historical failure mode where mismatched local toggles silently
//! disabled all comparisons cannot occur here.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::frame::Frame;

/// Samples retained while waiting for the matching value from the peer.
const SAMPLE_RING_CAPACITY: usize = 16;

/// Two checksum accumulators sampled from simulation PRNG state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPair {
    /// First PRNG state word.
    pub seed_1: u32,
    /// Second PRNG state word.
    pub seed_2: u32,
}

/// Negotiated seed-exchange variant.
///
/// Part of the authorization payload: the client requests a mode, the
/// server answers with the effective one, and a client that cannot accept
/// it fails authorization instead of silently skipping comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMode {
    /// Send and compare both accumulators. Disabling trades detection
    /// confidence for bandwidth.
    pub double_seed: bool,
    /// Sample every frame instead of every `sync_frequency` frames.
    /// Diagnostic mode for hunting frequent desyncs.
    pub every_frame: bool,
}

impl Default for SyncMode {
    fn default() -> Self {
        Self {
            double_seed: true,
            every_frame: false,
        }
    }
}

impl SyncMode {
    /// Effective sampling interval for a configured base frequency.
    pub fn frequency(&self, base: u32) -> u32 {
        if self.every_frame {
            1
        } else {
            base.max(1)
        }
    }
}

/// Server and client sampled different seeds for the same frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error(
    "desync at frame {frame}: local seeds {:08x}/{:08x}, server {remote_seed_1:08x}",
    local.seed_1, local.seed_2
)]
pub struct DesyncDetected {
    /// The frame both sides sampled.
    pub frame: Frame,
    /// The local seed pair.
    pub local: SeedPair,
    /// The server's first seed.
    pub remote_seed_1: u32,
    /// The server's second seed, when the negotiated mode carries it.
    pub remote_seed_2: Option<u32>,
}

/// Outcome of feeding a server seed value into the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedCheckOutcome {
    /// Both sides agree at this frame.
    Match(Frame),
    /// The local simulation has not reached this frame yet; the value is
    /// held and compared when it does.
    Deferred(Frame),
    /// Duplicate, out-of-order, or evicted frame; discarded.
    Stale,
}

// =============================================================================
// SERVER SIDE
// =============================================================================

/// Decides at which frames the server broadcasts its seed pair.
#[derive(Debug, Clone)]
pub struct SeedSampler {
    frequency: u32,
    double_seed: bool,
}

impl SeedSampler {
    /// Create a sampler for the negotiated mode.
    pub fn new(base_frequency: u32, mode: SyncMode) -> Self {
        Self {
            frequency: mode.frequency(base_frequency),
            double_seed: mode.double_seed,
        }
    }

    /// Effective sampling interval in frames.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Seed values to broadcast at this frame, if it is a sample frame.
    ///
    /// The second seed is omitted in single-seed mode.
    pub fn sample(&self, frame: Frame, pair: SeedPair) -> Option<(Frame, u32, Option<u32>)> {
        if frame == 0 || frame % self.frequency != 0 {
            return None;
        }
        let seed_2 = self.double_seed.then_some(pair.seed_2);
        Some((frame, pair.seed_1, seed_2))
    }
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Client-side seed comparison state.
///
/// Local samples are buffered per sampled frame in a bounded ring (oldest
/// discarded) and compared when the server's value for the same frame
/// arrives. Because the ceiling lets a client run slightly ahead of the
/// last confirmed server frame, a server value may also arrive for a
/// frame the client has not sampled yet; those are held and compared on
/// arrival of the local sample.
#[derive(Debug, Clone)]
pub struct DesyncDetector {
    frequency: u32,
    double_seed: bool,
    local: VecDeque<(Frame, SeedPair)>,
    pending: VecDeque<(Frame, u32, Option<u32>)>,
    last_compared: Option<Frame>,
}

impl DesyncDetector {
    /// Create a detector for the negotiated mode.
    pub fn new(base_frequency: u32, mode: SyncMode) -> Self {
        Self {
            frequency: mode.frequency(base_frequency),
            double_seed: mode.double_seed,
            local: VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
            pending: VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
            last_compared: None,
        }
    }

    /// Effective sampling interval in frames.
    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Whether the local simulation must sample its seeds at this frame.
    pub fn is_sample_frame(&self, frame: Frame) -> bool {
        frame != 0 && frame % self.frequency == 0
    }

    /// Frame of the most recent successful comparison.
    pub fn last_compared(&self) -> Option<Frame> {
        self.last_compared
    }

    /// Drop all buffered state. Called on disconnect and join abort.
    pub fn clear(&mut self) {
        self.local.clear();
        self.pending.clear();
        self.last_compared = None;
    }

    /// Record the local seed pair sampled at `frame`.
    ///
    /// If the server's value for this frame already arrived, the
    /// comparison happens immediately.
    pub fn record_local(
        &mut self,
        frame: Frame,
        pair: SeedPair,
    ) -> Result<Option<SeedCheckOutcome>, DesyncDetected> {
        if !self.is_sample_frame(frame) {
            return Ok(None);
        }

        if let Some(pos) = self.pending.iter().position(|(f, _, _)| *f == frame) {
            if let Some((_, seed_1, seed_2)) = self.pending.remove(pos) {
                self.finish_comparison(frame);
                return self.compare(frame, pair, seed_1, seed_2).map(Some);
            }
        }

        if self.local.len() == SAMPLE_RING_CAPACITY {
            self.local.pop_front();
        }
        self.local.push_back((frame, pair));
        Ok(None)
    }

    /// Feed a seed broadcast from the server.
    pub fn receive_server(
        &mut self,
        frame: Frame,
        seed_1: u32,
        seed_2: Option<u32>,
    ) -> Result<SeedCheckOutcome, DesyncDetected> {
        if self.last_compared.is_some_and(|last| frame <= last) {
            return Ok(SeedCheckOutcome::Stale);
        }

        if let Some(pos) = self.local.iter().position(|(f, _)| *f == frame) {
            let (_, pair) = self.local[pos];
            // Drop this sample and everything older.
            self.local.drain(..=pos);
            self.finish_comparison(frame);
            return self.compare(frame, pair, seed_1, seed_2);
        }

        let newest_local = self.local.back().map(|(f, _)| *f).unwrap_or(0);
        if frame > newest_local {
            if self.pending.len() == SAMPLE_RING_CAPACITY {
                self.pending.pop_front();
            }
            self.pending.push_back((frame, seed_1, seed_2));
            return Ok(SeedCheckOutcome::Deferred(frame));
        }

        // Older than anything we still hold; the sample was evicted.
        Ok(SeedCheckOutcome::Stale)
    }

    fn finish_comparison(&mut self, frame: Frame) {
        self.last_compared = Some(frame);
        // Pending server values for frames at or before the one just
        // compared are unreachable now.
        self.pending.retain(|(f, _, _)| *f > frame);
    }

    fn compare(
        &self,
        frame: Frame,
        local: SeedPair,
        seed_1: u32,
        seed_2: Option<u32>,
    ) -> Result<SeedCheckOutcome, DesyncDetected> {
        let desync = DesyncDetected {
            frame,
            local,
            remote_seed_1: seed_1,
            remote_seed_2: seed_2,
        };

        if local.seed_1 != seed_1 {
            return Err(desync);
        }
        if self.double_seed {
            // Fail closed: the negotiated mode promised a second seed, so
            // its absence is treated as a failed comparison.
            match seed_2 {
                Some(s2) if s2 == local.seed_2 => {}
                _ => return Err(desync),
            }
        }
        Ok(SeedCheckOutcome::Match(frame))
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(a: u32, b: u32) -> SeedPair {
        SeedPair { seed_1: a, seed_2: b }
    }

    #[test]
    fn test_sampler_cadence() {
        let sampler = SeedSampler::new(100, SyncMode::default());
        assert!(sampler.sample(0, pair(1, 2)).is_none());
        assert!(sampler.sample(99, pair(1, 2)).is_none());
        assert_eq!(sampler.sample(100, pair(1, 2)), Some((100, 1, Some(2))));
        assert_eq!(sampler.sample(200, pair(3, 4)), Some((200, 3, Some(4))));
    }

    #[test]
    fn test_sampler_single_seed_mode() {
        let mode = SyncMode { double_seed: false, every_frame: false };
        let sampler = SeedSampler::new(100, mode);
        assert_eq!(sampler.sample(100, pair(1, 2)), Some((100, 1, None)));
    }

    #[test]
    fn test_every_frame_mode() {
        let mode = SyncMode { double_seed: true, every_frame: true };
        let sampler = SeedSampler::new(100, mode);
        assert_eq!(sampler.frequency(), 1);
        assert!(sampler.sample(1, pair(1, 2)).is_some());
        assert!(sampler.sample(2, pair(1, 2)).is_some());
    }

    #[test]
    fn test_identical_state_matches() {
        // Spec scenario: both sides sample at frame 500 with equal state.
        let mut det = DesyncDetector::new(100, SyncMode::default());
        det.record_local(500, pair(0xDEAD, 0xBEEF)).unwrap();

        let outcome = det.receive_server(500, 0xDEAD, Some(0xBEEF)).unwrap();
        assert_eq!(outcome, SeedCheckOutcome::Match(500));
        assert_eq!(det.last_compared(), Some(500));
    }

    #[test]
    fn test_single_bit_difference_is_desync() {
        let mut det = DesyncDetector::new(100, SyncMode::default());
        det.record_local(500, pair(0xDEAD, 0xBEEF)).unwrap();

        let err = det
            .receive_server(500, 0xDEAD, Some(0xBEEF ^ 1))
            .unwrap_err();
        assert_eq!(err.frame, 500);
        assert_eq!(err.local, pair(0xDEAD, 0xBEEF));
    }

    #[test]
    fn test_first_seed_difference_is_desync() {
        let mut det = DesyncDetector::new(100, SyncMode::default());
        det.record_local(100, pair(7, 8)).unwrap();
        assert!(det.receive_server(100, 6, Some(8)).is_err());
    }

    #[test]
    fn test_server_value_before_local_sample() {
        // Client runs ahead of the last confirmed server frame, so the
        // broadcast can land first in either direction.
        let mut det = DesyncDetector::new(100, SyncMode::default());
        let outcome = det.receive_server(100, 11, Some(22)).unwrap();
        assert_eq!(outcome, SeedCheckOutcome::Deferred(100));

        let outcome = det.record_local(100, pair(11, 22)).unwrap();
        assert_eq!(outcome, Some(SeedCheckOutcome::Match(100)));
    }

    #[test]
    fn test_deferred_mismatch_is_desync() {
        let mut det = DesyncDetector::new(100, SyncMode::default());
        det.receive_server(100, 11, Some(22)).unwrap();
        assert!(det.record_local(100, pair(11, 23)).is_err());
    }

    #[test]
    fn test_duplicate_and_out_of_order_discarded() {
        let mut det = DesyncDetector::new(100, SyncMode::default());
        det.record_local(100, pair(1, 2)).unwrap();
        det.record_local(200, pair(3, 4)).unwrap();

        assert_eq!(
            det.receive_server(200, 3, Some(4)).unwrap(),
            SeedCheckOutcome::Match(200)
        );
        // A late value for an already-compared frame must not re-run the
        // comparison, even with different (would-be mismatching) seeds.
        assert_eq!(
            det.receive_server(100, 9, Some(9)).unwrap(),
            SeedCheckOutcome::Stale
        );
        assert_eq!(
            det.receive_server(200, 3, Some(4)).unwrap(),
            SeedCheckOutcome::Stale
        );
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let mut det = DesyncDetector::new(1, SyncMode { double_seed: true, every_frame: true });
        for f in 1..=40u32 {
            det.record_local(f, pair(f, f)).unwrap();
        }
        // Frame 1 was evicted long ago; its late arrival is stale, not a
        // desync.
        assert_eq!(
            det.receive_server(1, 1, Some(1)).unwrap(),
            SeedCheckOutcome::Stale
        );
        assert_eq!(
            det.receive_server(40, 40, Some(40)).unwrap(),
            SeedCheckOutcome::Match(40)
        );
    }

    #[test]
    fn test_single_seed_mode_reduced_confidence() {
        // With a single negotiated seed, a divergence visible only in the
        // second accumulator goes undetected. Documented trade-off.
        let mode = SyncMode { double_seed: false, every_frame: false };
        let mut det = DesyncDetector::new(100, mode);
        det.record_local(100, pair(5, 999)).unwrap();
        assert_eq!(
            det.receive_server(100, 5, None).unwrap(),
            SeedCheckOutcome::Match(100)
        );
    }

    #[test]
    fn test_double_mode_missing_second_seed_fails_closed() {
        let mut det = DesyncDetector::new(100, SyncMode::default());
        det.record_local(100, pair(5, 6)).unwrap();
        assert!(det.receive_server(100, 5, None).is_err());
    }

    #[test]
    fn test_clear_drops_buffers() {
        let mut det = DesyncDetector::new(100, SyncMode::default());
        det.record_local(100, pair(1, 2)).unwrap();
        det.receive_server(200, 3, Some(4)).unwrap();
        det.clear();
        assert_eq!(
            det.receive_server(100, 9, Some(9)).unwrap(),
            SeedCheckOutcome::Deferred(100)
        );
    }
}
