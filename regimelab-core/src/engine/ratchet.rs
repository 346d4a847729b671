//! Stop ratchet
//!
//! **Core Rule:** a stop may tighten, never loosen (even if the trailing
//! distance widens because volatility expanded).
//!
//! Candidates that would loosen are rejected rather than clamped, and every
//! accepted level is re-checked against the previous one; a loosened stop
//! after that is an [`InvariantViolation`], never silently corrected.

use crate::domain::{Side, TradeId};
use crate::error::InvariantViolation;

/// Outcome of proposing a new stop level.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopProposal {
    /// The candidate is strictly tighter (or the first stop) and becomes authoritative.
    Accepted(f64),
    /// Equal to the current stop; nothing to do.
    Unchanged,
    /// The candidate would loosen the position.
    Rejected,
}

/// Ratchet for one position's stop.
///
/// - Long positions: stop can only rise
/// - Short positions: stop can only fall
#[derive(Debug, Clone, PartialEq)]
pub struct StopRatchet {
    side: Side,
    level: Option<f64>,
}

impl StopRatchet {
    pub fn new(side: Side) -> Self {
        Self { side, level: None }
    }

    pub fn with_level(side: Side, level: Option<f64>) -> Self {
        Self { side, level }
    }

    /// Propose a stop level.
    ///
    /// # Example
    /// ```
    /// use regimelab_core::domain::Side;
    /// use regimelab_core::engine::{StopProposal, StopRatchet};
    ///
    /// let mut ratchet = StopRatchet::with_level(Side::Long, Some(95.0));
    ///
    /// // Tightening: 95 → 100 (accepted)
    /// assert_eq!(ratchet.propose(100.0), StopProposal::Accepted(100.0));
    ///
    /// // Loosening: 100 → 90 (rejected, stays at 100)
    /// assert_eq!(ratchet.propose(90.0), StopProposal::Rejected);
    /// assert_eq!(ratchet.level(), Some(100.0));
    /// ```
    pub fn propose(&mut self, candidate: f64) -> StopProposal {
        if !candidate.is_finite() {
            return StopProposal::Rejected;
        }
        match self.level {
            None => {
                self.level = Some(candidate);
                StopProposal::Accepted(candidate)
            }
            Some(current) if candidate == current => StopProposal::Unchanged,
            Some(current) if self.side.is_tighter_or_equal(candidate, current) => {
                self.level = Some(candidate);
                StopProposal::Accepted(candidate)
            }
            Some(_) => StopProposal::Rejected,
        }
    }

    pub fn level(&self) -> Option<f64> {
        self.level
    }
}

/// Post-check of an authoritative stop change.
pub fn enforce_ratchet(
    trade: TradeId,
    side: Side,
    previous: Option<f64>,
    next: f64,
) -> Result<(), InvariantViolation> {
    match previous {
        Some(prev) if !side.is_tighter_or_equal(next, prev) => Err(InvariantViolation::StopLoosened {
            trade,
            previous: prev,
            proposed: next,
        }),
        _ => Ok(()),
    }
}
