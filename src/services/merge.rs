//! Merging primary and verification results into a terminal verdict.

use strsim::jaro_winkler;

use crate::models::inference::{CardIdentity, InferenceResult};
use crate::models::result::{FinalStatus, ReasonCode};
use crate::services::router::ConfidenceThresholds;

/// Minimum name similarity for two identifications to be considered the same card.
const NAME_MATCH_THRESHOLD: f64 = 0.90;

/// What happened on the verification leg.
#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    NotRequested,
    Completed(InferenceResult),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergedVerdict {
    pub identity: Option<CardIdentity>,
    pub confidence: f64,
    pub verification_ran: bool,
    pub status: FinalStatus,
    pub reason: Option<ReasonCode>,
}

pub fn merge(
    primary: &InferenceResult,
    verification: &VerificationOutcome,
    thresholds: &ConfidenceThresholds,
) -> MergedVerdict {
    match verification {
        VerificationOutcome::NotRequested => MergedVerdict {
            identity: primary.identity.clone(),
            confidence: primary.confidence,
            verification_ran: false,
            status: FinalStatus::Accepted,
            reason: None,
        },
        VerificationOutcome::Unavailable => MergedVerdict {
            identity: primary.identity.clone(),
            confidence: primary.confidence,
            verification_ran: false,
            status: FinalStatus::NeedsReview,
            reason: Some(ReasonCode::VerificationUnavailable),
        },
        VerificationOutcome::Completed(second) => {
            let agree = match (&primary.identity, &second.identity) {
                (Some(a), Some(b)) => identities_agree(a, b),
                _ => false,
            };

            if agree {
                let confidence = primary.confidence.max(second.confidence);
                let (status, reason) = if confidence >= thresholds.low {
                    (FinalStatus::Accepted, None)
                } else {
                    (FinalStatus::NeedsReview, Some(ReasonCode::LowConfidence))
                };
                MergedVerdict {
                    identity: primary.identity.clone(),
                    confidence,
                    verification_ran: true,
                    status,
                    reason,
                }
            } else {
                let keep = if second.identity.is_some() && second.confidence > primary.confidence {
                    second
                } else {
                    primary
                };
                MergedVerdict {
                    identity: keep.identity.clone(),
                    confidence: keep.confidence,
                    verification_ran: true,
                    status: FinalStatus::NeedsReview,
                    reason: Some(ReasonCode::VerificationDisagreed),
                }
            }
        }
    }
}

/// Names are fuzzy matched; set and number must be equal when both sides
/// report them.
pub fn identities_agree(a: &CardIdentity, b: &CardIdentity) -> bool {
    let names_match = match (&a.name, &b.name) {
        (Some(x), Some(y)) => jaro_winkler(&normalize(x), &normalize(y)) >= NAME_MATCH_THRESHOLD,
        (None, None) => true,
        _ => false,
    };
    names_match && optional_eq(&a.set, &b.set) && optional_eq(&a.number, &b.number)
}

fn optional_eq(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => normalize(x) == normalize(y),
        _ => true,
    }
}

fn normalize(value: &str) -> String {
    value.trim().to_lowercase()
}
