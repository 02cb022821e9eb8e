use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::services::circuit_breaker::CircuitState;

/// Health of a single remote endpoint as seen through its circuit breaker.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealth {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub healthy: bool,
    pub last_state_change: DateTime<Utc>,
}

/// Point-in-time snapshot of pipeline counters.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub running: bool,
    pub total_submitted: u64,
    pub total_processed: u64,
    pub total_accepted: u64,
    pub total_needs_review: u64,
    pub total_verified: u64,
    pub total_failed: u64,
    pub failure_rate: f64,
    pub failures_by_reason: BTreeMap<String, u64>,
    pub budget_overruns: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
    pub endpoints: Vec<EndpointHealth>,
}

impl PipelineStats {
    pub fn all_endpoints_healthy(&self) -> bool {
        self.endpoints.iter().all(|e| e.healthy)
    }
}
