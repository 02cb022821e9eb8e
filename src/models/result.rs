use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString};
use uuid::Uuid;

use super::inference::CardIdentity;

/// Terminal outcome of a work item.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, EnumString, Display, AsRefStr, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FinalStatus {
    Accepted,
    NeedsReview,
    Failed,
}

/// Machine readable reason attached to `needs_review` and `failed` outcomes.
#[derive(
    Debug,
    Clone,
    Copy,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    AsRefStr,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReasonCode {
    PrimaryUnavailable,
    PrimaryRejected,
    PersistFailed,
    Shutdown,
    VerificationUnavailable,
    VerificationDisagreed,
    LowConfidence,
}

/// Stage whose latency target was exceeded.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Display, AsRefStr, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BudgetStage {
    Primary,
    Verification,
    Total,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StageLatencies {
    pub primary_ms: Option<u64>,
    pub verification_ms: Option<u64>,
    /// Time spent handing the result to the sink, retries included.
    pub persist_ms: Option<u64>,
}

/// The single artifact handed to the persistence collaborator for a work item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalResult {
    pub work_id: Uuid,
    pub identity: Option<CardIdentity>,
    pub confidence: f64,
    pub verification_ran: bool,
    pub latencies: StageLatencies,
    pub total_latency_ms: u64,
    pub status: FinalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub budget_overruns: Vec<BudgetStage>,
    pub completed_at: DateTime<Utc>,
}

impl FinalResult {
    /// A failure with no usable identification.
    pub fn failed(work_id: Uuid, reason: ReasonCode) -> Self {
        Self {
            work_id,
            identity: None,
            confidence: 0.0,
            verification_ran: false,
            latencies: StageLatencies::default(),
            total_latency_ms: 0,
            status: FinalStatus::Failed,
            reason: Some(reason),
            budget_overruns: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn is_terminal_failure(&self) -> bool {
        self.status == FinalStatus::Failed
    }
}
