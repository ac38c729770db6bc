//! Frame Clock
//!
//! The server owns the only authoritative frame counter. Clients simulate
//! the same frames independently but may never advance past the ceiling
//! most recently granted by the server; when they reach it they stall
//! until the next grant arrives. Stalling is observable (lag indicator)
//! but never drops ticks: catching up replays exactly the missed frames.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A simulation frame number.
pub type Frame = u32;

/// A ceiling grant broadcast by the server.
///
/// `ceiling = frame + frame_frequency`, so clients may run slightly ahead
/// of the last confirmation but never past the grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CeilingGrant {
    /// The server's frame counter when the grant was issued.
    pub frame: Frame,
    /// Highest frame a client may simulate to.
    pub ceiling: Frame,
}

/// A client's local frame ran past the granted ceiling.
///
/// This cannot happen to a well-behaved client; it means the client
/// simulated frames it was never granted, and the connection must be
/// terminated like any other desync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("local frame {local_frame} exceeds granted ceiling {ceiling}")]
pub struct FrameOrderViolation {
    /// The client's local frame at the time of the violation.
    pub local_frame: Frame,
    /// The ceiling that was violated.
    pub ceiling: Frame,
}

// =============================================================================
// SERVER SIDE
// =============================================================================

/// The server's authoritative frame counter.
#[derive(Debug, Clone)]
pub struct ServerFrameClock {
    frame: Frame,
    frame_frequency: u32,
}

impl ServerFrameClock {
    /// Create a clock starting at frame 0.
    ///
    /// A frequency of 0 is clamped to 1; a grant must be issued at least
    /// every frame or clients could never advance.
    pub fn new(frame_frequency: u32) -> Self {
        Self {
            frame: 0,
            frame_frequency: frame_frequency.max(1),
        }
    }

    /// Current authoritative frame.
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// The ceiling implied by the current frame.
    pub fn ceiling(&self) -> Frame {
        self.frame + self.frame_frequency
    }

    /// The grant a freshly activated client starts from.
    pub fn initial_grant(&self) -> CeilingGrant {
        CeilingGrant {
            frame: self.frame,
            ceiling: self.ceiling(),
        }
    }

    /// Advance the server by one tick.
    ///
    /// Returns a grant to broadcast every `frame_frequency` frames.
    pub fn advance(&mut self) -> Option<CeilingGrant> {
        self.frame += 1;
        if self.frame % self.frame_frequency == 0 {
            Some(CeilingGrant {
                frame: self.frame,
                ceiling: self.ceiling(),
            })
        } else {
            None
        }
    }
}

// =============================================================================
// CLIENT SIDE
// =============================================================================

/// Outcome of a client tick attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The local frame advanced to this value.
    Advanced(Frame),
    /// The local frame sits at the ceiling; wait for the next grant.
    Stalled,
}

/// A client's view of how far it may simulate.
#[derive(Debug, Clone)]
pub struct ClientFrameClock {
    frame: Frame,
    ceiling: Frame,
    server_frame: Frame,
    stalled_ticks: u64,
}

impl ClientFrameClock {
    /// Create a clock from the server's initial grant.
    ///
    /// The joining client has just applied a snapshot taken at
    /// `grant.frame`, so it resumes simulating from there.
    pub fn new(grant: CeilingGrant) -> Self {
        Self {
            frame: grant.frame,
            ceiling: grant.ceiling,
            server_frame: grant.frame,
            stalled_ticks: 0,
        }
    }

    /// Current local frame.
    pub fn frame(&self) -> Frame {
        self.frame
    }

    /// Highest frame the server has authorized.
    pub fn ceiling(&self) -> Frame {
        self.ceiling
    }

    /// Last known server frame, for lag reporting.
    pub fn server_frame(&self) -> Frame {
        self.server_frame
    }

    /// Ticks spent stalled at a ceiling since creation.
    pub fn stalled_ticks(&self) -> u64 {
        self.stalled_ticks
    }

    /// How many frames the local simulation trails the server.
    pub fn frames_behind(&self) -> u32 {
        self.server_frame.saturating_sub(self.frame)
    }

    /// Apply a ceiling grant from the server.
    ///
    /// Grants must be applied in non-decreasing frame order; a duplicate
    /// or out-of-order grant for an already-passed frame is discarded
    /// (returns `Ok(false)`), never reapplied. A grant whose ceiling lies
    /// below the local frame is a protocol violation and fatal.
    pub fn receive_grant(&mut self, grant: CeilingGrant) -> Result<bool, FrameOrderViolation> {
        if grant.frame <= self.server_frame {
            // Stale or duplicate; the network may reorder, we may not.
            return Ok(false);
        }

        if grant.ceiling < self.frame {
            return Err(FrameOrderViolation {
                local_frame: self.frame,
                ceiling: grant.ceiling,
            });
        }

        self.server_frame = grant.frame;
        // The window only ever widens.
        self.ceiling = self.ceiling.max(grant.ceiling);
        Ok(true)
    }

    /// Attempt to advance the local simulation by one frame.
    ///
    /// Advances while `frame < ceiling`; at the ceiling the caller must
    /// wait for the next grant. No frame is ever skipped: after a stall
    /// the clock resumes at exactly the next frame.
    pub fn try_tick(&mut self) -> TickOutcome {
        if self.frame < self.ceiling {
            self.frame += 1;
            TickOutcome::Advanced(self.frame)
        } else {
            self.stalled_ticks += 1;
            TickOutcome::Stalled
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_grant_cadence() {
        let mut clock = ServerFrameClock::new(10);

        let mut grants = Vec::new();
        for _ in 0..25 {
            if let Some(grant) = clock.advance() {
                grants.push(grant);
            }
        }

        assert_eq!(grants.len(), 2);
        assert_eq!(grants[0], CeilingGrant { frame: 10, ceiling: 20 });
        assert_eq!(grants[1], CeilingGrant { frame: 20, ceiling: 30 });
        assert_eq!(clock.frame(), 25);
    }

    #[test]
    fn test_server_zero_frequency_clamped() {
        let mut clock = ServerFrameClock::new(0);
        assert!(clock.advance().is_some());
    }

    #[test]
    fn test_client_stalls_at_ceiling_without_skipping() {
        // Spec scenario: server at 1000 grants ceiling 1010, client at 1005.
        let mut clock = ClientFrameClock::new(CeilingGrant { frame: 995, ceiling: 1005 });
        for _ in 0..10 {
            clock.try_tick();
        }
        assert_eq!(clock.frame(), 1005);

        clock
            .receive_grant(CeilingGrant { frame: 1000, ceiling: 1010 })
            .unwrap();

        let mut advanced = Vec::new();
        for _ in 0..8 {
            match clock.try_tick() {
                TickOutcome::Advanced(f) => advanced.push(f),
                TickOutcome::Stalled => {}
            }
        }

        // Exactly frames 1006..=1010, in order, none skipped, none past.
        assert_eq!(advanced, vec![1006, 1007, 1008, 1009, 1010]);
        assert_eq!(clock.frame(), 1010);
        assert_eq!(clock.stalled_ticks(), 3);
    }

    #[test]
    fn test_stale_grant_discarded() {
        let mut clock = ClientFrameClock::new(CeilingGrant { frame: 100, ceiling: 110 });
        assert!(clock
            .receive_grant(CeilingGrant { frame: 110, ceiling: 120 })
            .unwrap());

        // Older grant arrives late: discarded, ceiling unchanged.
        assert!(!clock
            .receive_grant(CeilingGrant { frame: 105, ceiling: 115 })
            .unwrap());
        assert_eq!(clock.ceiling(), 120);

        // Exact duplicate: discarded too.
        assert!(!clock
            .receive_grant(CeilingGrant { frame: 110, ceiling: 120 })
            .unwrap());
    }

    #[test]
    fn test_grant_below_local_frame_is_fatal() {
        let mut clock = ClientFrameClock::new(CeilingGrant { frame: 0, ceiling: 20 });
        for _ in 0..15 {
            clock.try_tick();
        }
        assert_eq!(clock.frame(), 15);

        let err = clock
            .receive_grant(CeilingGrant { frame: 10, ceiling: 12 })
            .unwrap_err();
        assert_eq!(err.local_frame, 15);
        assert_eq!(err.ceiling, 12);
    }

    #[test]
    fn test_frames_behind() {
        let mut clock = ClientFrameClock::new(CeilingGrant { frame: 50, ceiling: 60 });
        assert_eq!(clock.frames_behind(), 0);
        clock
            .receive_grant(CeilingGrant { frame: 60, ceiling: 70 })
            .unwrap();
        assert_eq!(clock.frames_behind(), 10);
        clock.try_tick();
        assert_eq!(clock.frames_behind(), 9);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// The local frame never exceeds the most recently applied ceiling,
        /// under any interleaving and reordering of grants and ticks.
        #[test]
        fn client_never_passes_ceiling(
            grants in proptest::collection::vec((0u32..500, 1u32..50), 1..40),
            ops in proptest::collection::vec(any::<bool>(), 0..400),
        ) {
            let mut clock = ClientFrameClock::new(CeilingGrant { frame: 0, ceiling: 10 });
            let grants = grants
                .into_iter()
                .map(|(frame, freq)| CeilingGrant { frame, ceiling: frame + freq })
                .collect::<Vec<_>>();
            let mut next = 0usize;

            for tick in ops {
                if tick || next >= grants.len() {
                    clock.try_tick();
                } else {
                    // Grants may arrive in any order; stale ones are dropped
                    // and a too-low ceiling is rejected before being applied.
                    let _ = clock.receive_grant(grants[next]);
                    next += 1;
                }
                prop_assert!(clock.frame() <= clock.ceiling());
            }
        }
    }
}
