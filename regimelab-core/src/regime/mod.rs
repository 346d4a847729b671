//! Market-regime classification and its hysteresis tracker.

pub mod classifier;
pub mod stability;

pub use classifier::{classify, classify_scopes, ActiveRegimeSet};
pub use stability::{RegimeTransition, StableRegimeState};
