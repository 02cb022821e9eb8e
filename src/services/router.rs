//! Confidence-based routing between the fast path and a verification pass.
//!
//! The decision is a pure function of the primary result's confidence, the
//! card's value tier and the configured thresholds. It performs no I/O and is
//! total over its inputs.

use serde::Serialize;
use strum::{AsRefStr, Display};

use crate::models::inference::{clamp_confidence, InferenceResult};
use crate::models::work_item::ValueTier;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceThresholds {
    pub low: f64,
    pub high: f64,
}

impl Default for ConfidenceThresholds {
    fn default() -> Self {
        Self { low: 0.70, high: 0.92 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Display, AsRefStr, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RouteReason {
    HighValueTier,
    LowConfidence,
    HighConfidence,
    AmbiguousBand,
}

/// Whether a second opinion is needed for this card.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "route", content = "reason", rename_all = "snake_case")]
pub enum RouteDecision {
    Skip(RouteReason),
    Verify(RouteReason),
}

impl RouteDecision {
    pub fn needs_verification(&self) -> bool {
        matches!(self, RouteDecision::Verify(_))
    }

    pub fn reason(&self) -> RouteReason {
        match self {
            RouteDecision::Skip(r) | RouteDecision::Verify(r) => *r,
        }
    }
}

pub fn decide(primary: &InferenceResult, tier: ValueTier, thresholds: &ConfidenceThresholds) -> RouteDecision {
    decide_confidence(primary.confidence, tier, thresholds)
}

pub fn decide_confidence(confidence: f64, tier: ValueTier, thresholds: &ConfidenceThresholds) -> RouteDecision {
    if tier.is_high_value() {
        return RouteDecision::Verify(RouteReason::HighValueTier);
    }

    let confidence = clamp_confidence(confidence);
    if confidence < thresholds.low {
        RouteDecision::Verify(RouteReason::LowConfidence)
    } else if confidence >= thresholds.high {
        RouteDecision::Skip(RouteReason::HighConfidence)
    } else {
        RouteDecision::Verify(RouteReason::AmbiguousBand)
    }
}

/// Router bound to a fixed set of thresholds.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceRouter {
    thresholds: ConfidenceThresholds,
}

impl ConfidenceRouter {
    pub fn new(thresholds: ConfidenceThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &ConfidenceThresholds {
        &self.thresholds
    }

    pub fn decide(&self, primary: &InferenceResult, tier: ValueTier) -> RouteDecision {
        decide(primary, tier, &self.thresholds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIERS: [ValueTier; 4] = [ValueTier::Common, ValueTier::Rare, ValueTier::Holo, ValueTier::Vintage];

    fn sweep() -> impl Iterator<Item = f64> {
        (0..=100).map(|i| i as f64 / 100.0)
    }

    #[test]
    fn test_deterministic() {
        let t = ConfidenceThresholds::default();
        for tier in TIERS {
            for c in sweep() {
                assert_eq!(decide_confidence(c, tier, &t), decide_confidence(c, tier, &t));
            }
        }
    }

    #[test]
    fn test_high_value_always_verified() {
        let t = ConfidenceThresholds::default();
        for tier in [ValueTier::Holo, ValueTier::Vintage] {
            for c in sweep() {
                assert_eq!(
                    decide_confidence(c, tier, &t),
                    RouteDecision::Verify(RouteReason::HighValueTier)
                );
            }
        }
    }

    #[test]
    fn test_confident_common_and_rare_skip() {
        let t = ConfidenceThresholds::default();
        for tier in [ValueTier::Common, ValueTier::Rare] {
            for c in sweep().filter(|c| *c >= t.high) {
                assert!(!decide_confidence(c, tier, &t).needs_verification(), "tier={tier} c={c}");
            }
        }
    }

    #[test]
    fn test_low_confidence_always_verified() {
        let t = ConfidenceThresholds::default();
        for tier in TIERS {
            for c in sweep().filter(|c| *c < t.low) {
                assert!(decide_confidence(c, tier, &t).needs_verification(), "tier={tier} c={c}");
            }
        }
    }

    #[test]
    fn test_ambiguous_band_verified() {
        let t = ConfidenceThresholds::default();
        assert_eq!(
            decide_confidence(0.80, ValueTier::Common, &t),
            RouteDecision::Verify(RouteReason::AmbiguousBand)
        );
        assert_eq!(
            decide_confidence(0.70, ValueTier::Rare, &t),
            RouteDecision::Verify(RouteReason::AmbiguousBand)
        );
    }

    #[test]
    fn test_threshold_boundary_skips() {
        let t = ConfidenceThresholds::default();
        assert_eq!(
            decide_confidence(0.92, ValueTier::Common, &t),
            RouteDecision::Skip(RouteReason::HighConfidence)
        );
    }

    #[test]
    fn test_nan_confidence_verified() {
        let t = ConfidenceThresholds::default();
        assert_eq!(
            decide_confidence(f64::NAN, ValueTier::Common, &t),
            RouteDecision::Verify(RouteReason::LowConfidence)
        );
    }

    #[test]
    fn test_custom_thresholds() {
        let t = ConfidenceThresholds { low: 0.5, high: 0.6 };
        assert!(!decide_confidence(0.65, ValueTier::Rare, &t).needs_verification());
        assert!(decide_confidence(0.55, ValueTier::Rare, &t).needs_verification());
    }
}
