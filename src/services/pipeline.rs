//! Per-card orchestration: primary call, routing, optional verification,
//! merge and persistence hand-off, driven by the batch dispatcher.

use async_trait::async_trait;
use chrono::Utc;
use garde::Validate;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::models::inference::{InferenceRequest, InferenceStage};
use crate::models::result::{BudgetStage, FinalResult, FinalStatus, ReasonCode, StageLatencies};
use crate::models::stats::{EndpointHealth, PipelineStats};
use crate::models::work_item::{CardSubmission, ImageRef, Stage, SubmitOptions, WorkItem};
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::dispatcher::{BatchDispatcher, DispatchError, ItemHandler};
use crate::services::merge::{merge, VerificationOutcome};
use crate::services::persistence::ResultSink;
use crate::services::remote::{InferenceTransport, RemoteCallClient};
use crate::services::router::ConfidenceRouter;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SubmitError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Queue full: {depth} items pending (limit {limit}), retry later")]
    QueueFull { depth: usize, limit: usize },

    #[error("Pipeline is not accepting submissions")]
    NotAccepting,
}

impl From<DispatchError> for SubmitError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::QueueFull { depth, limit } => SubmitError::QueueFull { depth, limit },
            DispatchError::Closed => SubmitError::NotAccepting,
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LifecycleError {
    #[error("Pipeline has been stopped and cannot be restarted")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopping,
    Stopped,
}

/// Where a work item is, or how it ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkStatus {
    InProgress(Stage),
    Finished(FinalResult),
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    processed: AtomicU64,
    accepted: AtomicU64,
    needs_review: AtomicU64,
    verified: AtomicU64,
    failed: AtomicU64,
    budget_overruns: AtomicU64,
    by_reason: [AtomicU64; REASON_COUNT],
}

const REASON_COUNT: usize = 7;

#[derive(Default)]
struct Retained {
    order: VecDeque<Uuid>,
    results: HashMap<Uuid, FinalResult>,
}

/// The orchestrator. Shared as `Arc<DistributedPipeline>`.
pub struct DistributedPipeline {
    config: PipelineConfig,
    primary: RemoteCallClient,
    verification: RemoteCallClient,
    breakers: Vec<Arc<CircuitBreaker>>,
    router: ConfidenceRouter,
    dispatcher: Arc<BatchDispatcher>,
    sink: Arc<dyn ResultSink>,
    lifecycle: Mutex<Lifecycle>,
    cancel: CancellationToken,
    stages: Mutex<HashMap<Uuid, Stage>>,
    retained: Mutex<Retained>,
    events: broadcast::Sender<FinalResult>,
    counters: Counters,
}

impl DistributedPipeline {
    pub fn new(config: PipelineConfig, transport: Arc<dyn InferenceTransport>, sink: Arc<dyn ResultSink>) -> Self {
        // One breaker per physical endpoint: both stages share it when they
        // target the same node.
        let primary_breaker = Arc::new(CircuitBreaker::new(
            config.primary_endpoint.name.clone(),
            config.breaker.clone(),
        ));
        let verification_breaker = if config.verification_endpoint.url == config.primary_endpoint.url {
            Arc::clone(&primary_breaker)
        } else {
            Arc::new(CircuitBreaker::new(
                config.verification_endpoint.name.clone(),
                config.breaker.clone(),
            ))
        };
        let mut breakers = vec![Arc::clone(&primary_breaker)];
        if !Arc::ptr_eq(&primary_breaker, &verification_breaker) {
            breakers.push(Arc::clone(&verification_breaker));
        }

        let primary = RemoteCallClient::new(
            config.primary_endpoint.clone(),
            Arc::clone(&transport),
            primary_breaker,
            config.retry.clone(),
            config.call_timeout,
        );
        let verification = RemoteCallClient::new(
            config.verification_endpoint.clone(),
            transport,
            verification_breaker,
            config.retry.clone(),
            config.call_timeout,
        );

        let (events, _) = broadcast::channel(config.result_retention.max(16));

        Self {
            router: ConfidenceRouter::new(config.thresholds),
            dispatcher: Arc::new(BatchDispatcher::new(config.dispatcher.clone())),
            primary,
            verification,
            breakers,
            sink,
            lifecycle: Mutex::new(Lifecycle::Idle),
            cancel: CancellationToken::new(),
            stages: Mutex::new(HashMap::new()),
            retained: Mutex::new(Retained::default()),
            events,
            counters: Counters::default(),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Begin draining the queue. Calling it again while running is a no-op.
    pub async fn start(self: &Arc<Self>) -> Result<(), LifecycleError> {
        {
            let mut lifecycle = lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Idle => *lifecycle = Lifecycle::Running,
                Lifecycle::Running => return Ok(()),
                Lifecycle::Stopping | Lifecycle::Stopped => return Err(LifecycleError::Stopped),
            }
        }

        self.dispatcher
            .drain(
                Arc::clone(self),
                self.config.dispatcher.max_concurrency,
                self.cancel.clone(),
            )
            .await;

        tracing::info!(
            primary = %self.config.primary_endpoint.url,
            verification = %self.config.verification_endpoint.url,
            max_concurrency = self.config.dispatcher.max_concurrency,
            "Pipeline started"
        );
        Ok(())
    }

    /// Stop accepting work, drain for up to the grace period, then cancel
    /// whatever is still running and fail everything left with `shutdown`.
    pub async fn stop(&self) {
        let was_running = {
            let mut lifecycle = lock(&self.lifecycle);
            match *lifecycle {
                Lifecycle::Stopping | Lifecycle::Stopped => return,
                Lifecycle::Running => {
                    *lifecycle = Lifecycle::Stopping;
                    true
                }
                Lifecycle::Idle => {
                    *lifecycle = Lifecycle::Stopping;
                    false
                }
            }
        };

        tracing::info!(
            queue_depth = self.dispatcher.queue_depth(),
            in_flight = self.dispatcher.in_flight(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Pipeline stopping"
        );
        self.dispatcher.close();

        if was_running
            && tokio::time::timeout(self.config.shutdown_grace, self.dispatcher.join_workers())
                .await
                .is_err()
        {
            tracing::warn!(
                in_flight = self.dispatcher.in_flight(),
                "Grace period elapsed, cancelling in-flight calls"
            );
        }
        self.cancel.cancel();
        self.dispatcher.join_workers().await;

        let leftovers = self.dispatcher.take_pending();
        if !leftovers.is_empty() {
            tracing::warn!(count = leftovers.len(), "Failing queued items on shutdown");
        }
        for mut item in leftovers {
            let mut result = FinalResult::failed(item.id, ReasonCode::Shutdown);
            result.total_latency_ms = elapsed_since_submission(&item);
            self.finish(&mut item, result).await;
        }

        *lock(&self.lifecycle) = Lifecycle::Stopped;
        tracing::info!("Pipeline stopped");
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.lifecycle) == Lifecycle::Running
    }

    /// Validate and enqueue one card. Returns immediately with the work id.
    pub fn process_single_card(
        &self,
        image_ref: impl Into<String>,
        options: SubmitOptions,
    ) -> Result<Uuid, SubmitError> {
        self.submit(CardSubmission {
            image_ref: image_ref.into(),
            options,
        })
    }

    pub fn submit(&self, submission: CardSubmission) -> Result<Uuid, SubmitError> {
        submission
            .validate()
            .map_err(|report| SubmitError::Validation(report.to_string()))?;

        if matches!(*lock(&self.lifecycle), Lifecycle::Stopping | Lifecycle::Stopped) {
            return Err(SubmitError::NotAccepting);
        }

        let item = WorkItem::new(ImageRef::new(submission.image_ref), submission.options);
        let work_id = item.id;
        let (priority, value_tier) = (item.priority, item.value_tier);

        lock(&self.stages).insert(work_id, Stage::Submitted);
        if let Err(err) = self.dispatcher.submit(item) {
            lock(&self.stages).remove(&work_id);
            metrics::counter!("cards_rejected_total").increment(1);
            tracing::warn!(work_id = %work_id, error = %err, "Submission rejected");
            return Err(err.into());
        }

        self.counters.submitted.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cards_submitted_total").increment(1);
        tracing::debug!(
            work_id = %work_id,
            priority = %priority,
            value_tier = %value_tier,
            "Card submitted"
        );
        Ok(work_id)
    }

    /// Read-only snapshot of counters and endpoint health.
    pub fn stats(&self) -> PipelineStats {
        let c = &self.counters;
        let processed = c.processed.load(Ordering::Relaxed);
        let failed = c.failed.load(Ordering::Relaxed);

        let failures_by_reason = ReasonCode::iter()
            .filter_map(|reason| {
                let count = c.by_reason[reason as usize].load(Ordering::Relaxed);
                (count > 0).then(|| (reason.to_string(), count))
            })
            .collect();

        let endpoints = self
            .breakers
            .iter()
            .map(|breaker| {
                let snapshot = breaker.snapshot();
                EndpointHealth {
                    name: breaker.endpoint().to_string(),
                    state: snapshot.state,
                    consecutive_failures: snapshot.consecutive_failures,
                    healthy: breaker.is_healthy(),
                    last_state_change: snapshot.last_state_change,
                }
            })
            .collect();

        PipelineStats {
            running: self.is_running(),
            total_submitted: c.submitted.load(Ordering::Relaxed),
            total_processed: processed,
            total_accepted: c.accepted.load(Ordering::Relaxed),
            total_needs_review: c.needs_review.load(Ordering::Relaxed),
            total_verified: c.verified.load(Ordering::Relaxed),
            total_failed: failed,
            failure_rate: if processed == 0 {
                0.0
            } else {
                failed as f64 / processed as f64
            },
            failures_by_reason,
            budget_overruns: c.budget_overruns.load(Ordering::Relaxed),
            queue_depth: self.dispatcher.queue_depth(),
            in_flight: self.dispatcher.in_flight(),
            endpoints,
        }
    }

    /// Current stage of an in-progress item, or its retained final result.
    pub fn status(&self, work_id: Uuid) -> Option<WorkStatus> {
        if let Some(stage) = lock(&self.stages).get(&work_id) {
            return Some(WorkStatus::InProgress(*stage));
        }
        self.result(work_id).map(WorkStatus::Finished)
    }

    pub fn result(&self, work_id: Uuid) -> Option<FinalResult> {
        lock(&self.retained).results.get(&work_id).cloned()
    }

    /// Every final result is broadcast once, in completion order.
    pub fn subscribe(&self) -> broadcast::Receiver<FinalResult> {
        self.events.subscribe()
    }

    async fn process(&self, mut item: WorkItem, cancel: CancellationToken) {
        let work_id = item.id;
        let budgets = &self.config.budgets;
        let mut latencies = StageLatencies::default();
        let mut overruns = Vec::new();

        self.advance(&mut item, Stage::PrimaryInflight);
        let request = InferenceRequest {
            image: item.image_ref.clone(),
            hint: item.hint.clone(),
            mode: InferenceStage::Primary.mode(),
        };

        let primary = match self.primary.call(InferenceStage::Primary, &request, &cancel).await {
            Ok(result) => result,
            Err(err) => {
                let reason = if err.is_cancelled() {
                    ReasonCode::Shutdown
                } else {
                    ReasonCode::PrimaryUnavailable
                };
                tracing::error!(work_id = %work_id, error = %err, reason = %reason, "Primary call failed");
                let mut result = FinalResult::failed(work_id, reason);
                result.total_latency_ms = elapsed_since_submission(&item);
                self.finish(&mut item, result).await;
                return;
            }
        };

        latencies.primary_ms = Some(millis(primary.latency));
        if primary.latency > budgets.primary {
            overruns.push(BudgetStage::Primary);
        }

        if let Some(rejection) = &primary.error {
            tracing::error!(
                work_id = %work_id,
                error_code = %rejection.error_code,
                message = %rejection.message,
                "Primary call rejected"
            );
            let mut result = FinalResult::failed(work_id, ReasonCode::PrimaryRejected);
            result.latencies = latencies;
            result.budget_overruns = overruns;
            result.total_latency_ms = elapsed_since_submission(&item);
            self.finish(&mut item, result).await;
            return;
        }

        self.advance(&mut item, Stage::Routed);
        let decision = self.router.decide(&primary, item.value_tier);
        tracing::debug!(
            work_id = %work_id,
            confidence = primary.confidence,
            value_tier = %item.value_tier,
            verify = decision.needs_verification(),
            reason = %decision.reason(),
            "Routed primary result"
        );

        let verification = if decision.needs_verification() {
            self.advance(&mut item, Stage::VerifyInflight);
            let request = InferenceRequest {
                image: item.image_ref.clone(),
                hint: primary
                    .identity
                    .as_ref()
                    .and_then(|identity| identity.as_hint())
                    .or_else(|| item.hint.clone()),
                mode: InferenceStage::Verification.mode(),
            };
            match self
                .verification
                .call(InferenceStage::Verification, &request, &cancel)
                .await
            {
                Ok(result) if !result.is_rejected() => {
                    latencies.verification_ms = Some(millis(result.latency));
                    if result.latency > budgets.verification {
                        overruns.push(BudgetStage::Verification);
                    }
                    VerificationOutcome::Completed(result)
                }
                Ok(result) => {
                    latencies.verification_ms = Some(millis(result.latency));
                    tracing::warn!(work_id = %work_id, "Verification rejected, degrading to review");
                    VerificationOutcome::Unavailable
                }
                Err(err) => {
                    tracing::warn!(work_id = %work_id, error = %err, "Verification unavailable, degrading to review");
                    VerificationOutcome::Unavailable
                }
            }
        } else {
            VerificationOutcome::NotRequested
        };

        let verdict = merge(&primary, &verification, self.router.thresholds());
        self.advance(&mut item, Stage::Merged);

        let total_latency_ms = elapsed_since_submission(&item);
        if Duration::from_millis(total_latency_ms) > budgets.total {
            overruns.push(BudgetStage::Total);
        }

        let result = FinalResult {
            work_id,
            identity: verdict.identity,
            confidence: verdict.confidence,
            verification_ran: verdict.verification_ran,
            latencies,
            total_latency_ms,
            status: verdict.status,
            reason: verdict.reason,
            budget_overruns: overruns,
            completed_at: Utc::now(),
        };
        self.finish(&mut item, result).await;
    }

    /// Hand the result to the sink with bounded retries, then record it.
    ///
    /// Each delivery carries the hand-off time spent so far; the recorded
    /// result carries the full hand-off including the final attempt.
    async fn finish(&self, item: &mut WorkItem, mut result: FinalResult) {
        let max_attempts = self.config.persist_max_attempts.max(1);
        if result.is_terminal_failure() {
            self.advance(item, Stage::Failed);
        }
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            attempt += 1;
            result.latencies.persist_ms = Some(millis(started.elapsed()));
            match self.sink.persist(&result).await {
                Ok(()) => {
                    if !result.is_terminal_failure() {
                        self.advance(item, Stage::Persisted);
                    }
                    break;
                }
                Err(err) if attempt < max_attempts => {
                    tracing::warn!(work_id = %result.work_id, attempt, error = %err, "Persist failed, retrying");
                    tokio::time::sleep(self.config.persist_retry_delay).await;
                }
                Err(err) => {
                    tracing::error!(
                        work_id = %result.work_id,
                        attempts = attempt,
                        error = %err,
                        "Persist failed, giving up"
                    );
                    result.status = FinalStatus::Failed;
                    result.reason = Some(ReasonCode::PersistFailed);
                    self.advance(item, Stage::Failed);
                    break;
                }
            }
        }
        result.latencies.persist_ms = Some(millis(started.elapsed()));
        self.record(result);
    }

    fn record(&self, result: FinalResult) {
        let work_id = result.work_id;
        {
            // Stages before retained, so a lookup always finds one or the other.
            let mut stages = lock(&self.stages);
            if !stages.contains_key(&work_id) {
                tracing::error!(work_id = %work_id, "Duplicate final result suppressed");
                return;
            }
            self.retain(result.clone());
            stages.remove(&work_id);
        }

        let c = &self.counters;
        c.processed.fetch_add(1, Ordering::Relaxed);
        if result.verification_ran {
            c.verified.fetch_add(1, Ordering::Relaxed);
        }
        match result.status {
            FinalStatus::Accepted => c.accepted.fetch_add(1, Ordering::Relaxed),
            FinalStatus::NeedsReview => c.needs_review.fetch_add(1, Ordering::Relaxed),
            FinalStatus::Failed => c.failed.fetch_add(1, Ordering::Relaxed),
        };
        if result.is_terminal_failure() {
            if let Some(reason) = result.reason {
                c.by_reason[reason as usize].fetch_add(1, Ordering::Relaxed);
                metrics::counter!("cards_failed_total", "reason" => reason.to_string()).increment(1);
            }
        }
        for stage in &result.budget_overruns {
            c.budget_overruns.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("latency_budget_overruns_total", "stage" => stage.to_string()).increment(1);
        }
        if !result.budget_overruns.is_empty() {
            tracing::warn!(
                work_id = %work_id,
                overruns = ?result.budget_overruns,
                total_latency_ms = result.total_latency_ms,
                "Latency budget exceeded"
            );
        }

        metrics::counter!("cards_completed_total", "status" => result.status.to_string()).increment(1);
        metrics::histogram!("card_pipeline_seconds").record(result.total_latency_ms as f64 / 1000.0);

        tracing::info!(
            work_id = %work_id,
            status = %result.status,
            reason = ?result.reason,
            confidence = result.confidence,
            verification_ran = result.verification_ran,
            total_latency_ms = result.total_latency_ms,
            "Card finished"
        );

        // No subscribers is fine.
        let _ = self.events.send(result);
    }

    fn retain(&self, result: FinalResult) {
        let mut retained = lock(&self.retained);
        retained.order.push_back(result.work_id);
        retained.results.insert(result.work_id, result);
        while retained.order.len() > self.config.result_retention.max(1) {
            if let Some(evicted) = retained.order.pop_front() {
                retained.results.remove(&evicted);
            }
        }
    }

    /// Move an item forward, mirroring the stage into the lookup map.
    fn advance(&self, item: &mut WorkItem, stage: Stage) {
        item.stage = stage;
        if let Some(current) = lock(&self.stages).get_mut(&item.id) {
            *current = stage;
        }
    }
}

#[async_trait]
impl ItemHandler for DistributedPipeline {
    async fn handle(&self, item: WorkItem, cancel: CancellationToken) {
        self.process(item, cancel).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

fn elapsed_since_submission(item: &WorkItem) -> u64 {
    (Utc::now() - item.submitted_at).num_milliseconds().max(0) as u64
}
