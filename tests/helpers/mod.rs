//! Test doubles for the inference node and the result sink.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

use cardmint_orchestrator::config::PipelineConfig;
use cardmint_orchestrator::models::inference::{
    IdentifyResponse, InferenceMode, InferenceRequest, InferenceResponse, RemoteRejection,
};
use cardmint_orchestrator::models::result::FinalResult;
use cardmint_orchestrator::services::circuit_breaker::CircuitBreakerConfig;
use cardmint_orchestrator::services::dispatcher::DispatcherConfig;
use cardmint_orchestrator::services::persistence::{InMemoryResultStore, PersistError, ResultSink};
use cardmint_orchestrator::services::pipeline::{DistributedPipeline, WorkStatus};
use cardmint_orchestrator::services::remote::{AttemptError, Endpoint, InferenceTransport, RetryPolicy};

/// What the fake node answers with.
#[derive(Debug, Clone)]
pub enum Reply {
    Identify {
        name: &'static str,
        set: &'static str,
        number: &'static str,
        confidence: f64,
    },
    Reject(&'static str),
    Fail,
    Hang,
}

pub fn pikachu(confidence: f64) -> Reply {
    Reply::Identify {
        name: "Pikachu",
        set: "Base Set",
        number: "58/102",
        confidence,
    }
}

pub fn raichu(confidence: f64) -> Reply {
    Reply::Identify {
        name: "Raichu",
        set: "Base Set",
        number: "14/102",
        confidence,
    }
}

/// Scripted inference node. Answers per mode, tracks calls and the peak
/// number of concurrent requests.
pub struct FakeInference {
    primary: Mutex<Reply>,
    verification: Mutex<Reply>,
    delay: Mutex<Duration>,
    requests: Mutex<Vec<InferenceRequest>>,
    primary_calls: AtomicUsize,
    verification_calls: AtomicUsize,
    in_flight: Arc<AtomicUsize>,
    peak_in_flight: AtomicUsize,
}

impl FakeInference {
    pub fn new(primary: Reply, verification: Reply) -> Arc<Self> {
        Arc::new(Self {
            primary: Mutex::new(primary),
            verification: Mutex::new(verification),
            delay: Mutex::new(Duration::ZERO),
            requests: Mutex::new(Vec::new()),
            primary_calls: AtomicUsize::new(0),
            verification_calls: AtomicUsize::new(0),
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak_in_flight: AtomicUsize::new(0),
        })
    }

    pub fn with_delay(self: Arc<Self>, delay: Duration) -> Arc<Self> {
        *self.delay.lock().unwrap() = delay;
        self
    }

    pub fn set_primary(&self, reply: Reply) {
        *self.primary.lock().unwrap() = reply;
    }

    pub fn primary_calls(&self) -> usize {
        self.primary_calls.load(Ordering::SeqCst)
    }

    pub fn verification_calls(&self) -> usize {
        self.verification_calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<InferenceRequest> {
        self.requests.lock().unwrap().clone()
    }
}

struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl InferenceTransport for FakeInference {
    async fn send(
        &self,
        _endpoint: &Endpoint,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, AttemptError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = match request.mode {
            InferenceMode::Identify => {
                self.primary_calls.fetch_add(1, Ordering::SeqCst);
                self.primary.lock().unwrap().clone()
            }
            InferenceMode::Verify => {
                self.verification_calls.fetch_add(1, Ordering::SeqCst);
                self.verification.lock().unwrap().clone()
            }
        };

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(Arc::clone(&self.in_flight));
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        match reply {
            Reply::Identify {
                name,
                set,
                number,
                confidence,
            } => Ok(InferenceResponse::Identified(IdentifyResponse {
                name: Some(name.to_string()),
                set: Some(set.to_string()),
                number: Some(number.to_string()),
                confidence,
                latency_ms: None,
            })),
            Reply::Reject(code) => Ok(InferenceResponse::Rejected(RemoteRejection {
                error_code: code.to_string(),
                message: "rejected by fake node".to_string(),
            })),
            Reply::Fail => Err(AttemptError::Connect("connection refused".to_string())),
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Err(AttemptError::Connect("unreachable".to_string()))
            }
        }
    }
}

/// Sink that fails its first `failures` deliveries.
pub struct FlakySink {
    failures_left: AtomicU32,
    pub store: InMemoryResultStore,
    attempts: AtomicUsize,
}

impl FlakySink {
    pub fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicU32::new(failures),
            store: InMemoryResultStore::new(),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ResultSink for FlakySink {
    async fn persist(&self, result: &FinalResult) -> Result<(), PersistError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(PersistError::Unavailable("store offline".to_string()));
        }
        self.store.persist(result).await
    }
}

/// Small timeouts and delays so failure paths finish quickly.
pub fn test_config() -> PipelineConfig {
    let mut config = PipelineConfig::new("http://127.0.0.1:9/infer");
    config.dispatcher = DispatcherConfig {
        max_concurrency: 4,
        batch_size: 8,
        queue_depth: 64,
    };
    config.call_timeout = Duration::from_millis(50);
    config.retry = RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_elapsed: Duration::from_secs(2),
    };
    config.breaker = CircuitBreakerConfig {
        failure_threshold: 50,
        cooldown: Duration::from_secs(30),
    };
    config.persist_max_attempts = 3;
    config.persist_retry_delay = Duration::from_millis(1);
    config.shutdown_grace = Duration::from_secs(2);
    config
}

pub async fn started(
    config: PipelineConfig,
    transport: Arc<FakeInference>,
    sink: Arc<dyn ResultSink>,
) -> Arc<DistributedPipeline> {
    let pipeline = Arc::new(DistributedPipeline::new(config, transport, sink));
    pipeline.start().await.expect("pipeline starts");
    pipeline
}

/// Poll until the pipeline has a final result for `work_id`.
pub async fn wait_for_result(pipeline: &DistributedPipeline, work_id: Uuid) -> FinalResult {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Some(result) = pipeline.result(work_id) {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("final result within 5s")
}

pub fn ids(results: &[FinalResult]) -> HashMap<Uuid, usize> {
    let mut seen = HashMap::new();
    for result in results {
        *seen.entry(result.work_id).or_insert(0) += 1;
    }
    seen
}

/// Sink that captures the pipeline's view of each item while it is being
/// persisted.
pub struct StageRecordingSink {
    pipeline: std::sync::OnceLock<std::sync::Weak<DistributedPipeline>>,
    seen: Mutex<HashMap<Uuid, Option<WorkStatus>>>,
}

impl StageRecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pipeline: std::sync::OnceLock::new(),
            seen: Mutex::new(HashMap::new()),
        })
    }

    pub fn attach(&self, pipeline: &Arc<DistributedPipeline>) {
        let _ = self.pipeline.set(Arc::downgrade(pipeline));
    }

    pub fn seen(&self, work_id: Uuid) -> Option<WorkStatus> {
        self.seen.lock().unwrap().get(&work_id).cloned().flatten()
    }
}

#[async_trait]
impl ResultSink for StageRecordingSink {
    async fn persist(&self, result: &FinalResult) -> Result<(), PersistError> {
        let status = self
            .pipeline
            .get()
            .and_then(|weak| weak.upgrade())
            .and_then(|pipeline| pipeline.status(result.work_id));
        self.seen.lock().unwrap().insert(result.work_id, status);
        Ok(())
    }
}
