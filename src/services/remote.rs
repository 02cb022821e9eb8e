use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::models::inference::{
    InferenceRequest, InferenceResponse, InferenceResult, InferenceStage, RemoteRejection,
};
use crate::services::circuit_breaker::{CircuitBreaker, CircuitOpenError};

/// Failure of a single attempt. Every variant is transport-class and
/// eligible for retry except `Cancelled`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AttemptError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("remote returned HTTP {0}")]
    Server(u16),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("attempt cancelled")]
    Cancelled,
}

/// Returned once the retry budget for an endpoint is spent.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint '{endpoint}' unavailable after {attempts} attempts: {last}")]
    Exhausted {
        endpoint: String,
        attempts: u32,
        last: AttemptError,
    },

    #[error("call to endpoint '{endpoint}' cancelled")]
    Cancelled { endpoint: String },
}

impl TransportError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransportError::Cancelled { .. })
    }
}

/// Everything a caller of [`RemoteCallClient::call`] may see.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),
}

impl CallError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CallError::Transport(e) if e.is_cancelled())
    }
}

/// One physical inference node.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub name: String,
    pub url: String,
}

/// Capability to make one attempt against an inference endpoint.
///
/// Application-level rejections are returned as
/// `Ok(InferenceResponse::Rejected(..))`; only transport-class problems are
/// errors.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, AttemptError>;
}

/// JSON-over-HTTP transport to the inference node.
pub struct HttpTransport {
    http: Client,
}

impl HttpTransport {
    pub fn new(connect_timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl InferenceTransport for HttpTransport {
    async fn send(
        &self,
        endpoint: &Endpoint,
        request: &InferenceRequest,
    ) -> Result<InferenceResponse, AttemptError> {
        let response = self
            .http
            .post(&endpoint.url)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Timeout(Duration::ZERO)
                } else {
                    AttemptError::Connect(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AttemptError::Server(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Connect(e.to_string()))?;

        Ok(decode_body(status, &body))
    }
}

fn decode_body(status: StatusCode, body: &[u8]) -> InferenceResponse {
    match serde_json::from_slice::<InferenceResponse>(body) {
        Ok(InferenceResponse::Identified(_)) if !status.is_success() => {
            InferenceResponse::Rejected(RemoteRejection {
                error_code: format!("http_{}", status.as_u16()),
                message: "unexpected identification payload on error status".to_string(),
            })
        }
        Ok(parsed) => parsed,
        Err(e) if status.is_success() => InferenceResponse::Rejected(RemoteRejection {
            error_code: "invalid_response".to_string(),
            message: e.to_string(),
        }),
        Err(_) => InferenceResponse::Rejected(RemoteRejection {
            error_code: format!("http_{}", status.as_u16()),
            message: String::from_utf8_lossy(body).chars().take(200).collect(),
        }),
    }
}

/// Exponential backoff parameters.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_elapsed: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            multiplier: 2.0,
            max_elapsed: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay after attempt `n` (0-indexed) failed. Saturates at `max_elapsed`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let factor = self.multiplier.max(1.0).powi(exponent);
        Duration::try_from_secs_f64(self.base_delay.as_secs_f64() * factor)
            .map_or(self.max_elapsed, |delay| delay.min(self.max_elapsed))
    }
}

/// Retrying, timeout-enforcing client for one endpoint.
///
/// Each attempt is admitted by, and reported to, the endpoint's circuit
/// breaker, so an open circuit short-circuits before the transport is touched.
pub struct RemoteCallClient {
    endpoint: Endpoint,
    transport: Arc<dyn InferenceTransport>,
    breaker: Arc<CircuitBreaker>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl RemoteCallClient {
    pub fn new(
        endpoint: Endpoint,
        transport: Arc<dyn InferenceTransport>,
        breaker: Arc<CircuitBreaker>,
        retry: RetryPolicy,
        timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            transport,
            breaker,
            retry,
            timeout,
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn call(
        &self,
        stage: InferenceStage,
        request: &InferenceRequest,
        cancel: &CancellationToken,
    ) -> Result<InferenceResult, CallError> {
        let started = Instant::now();
        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            let permit = self.breaker.admit()?;
            let attempt_started = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(AttemptError::Cancelled),
                sent = tokio::time::timeout(self.timeout, self.transport.send(&self.endpoint, request)) => {
                    sent.unwrap_or(Err(AttemptError::Timeout(self.timeout)))
                }
            };

            metrics::histogram!(
                "remote_call_seconds",
                "endpoint" => self.endpoint.name.clone(),
                "stage" => stage.as_ref().to_string()
            )
            .record(attempt_started.elapsed().as_secs_f64());

            let err = match outcome {
                Ok(response) => {
                    // The node answered, even if it rejected the request.
                    permit.success();
                    let latency = started.elapsed();
                    return Ok(match response {
                        InferenceResponse::Identified(r) => InferenceResult::identified(stage, r, latency),
                        InferenceResponse::Rejected(r) => {
                            tracing::warn!(
                                endpoint = %self.endpoint.name,
                                stage = %stage,
                                error_code = %r.error_code,
                                "remote rejected request"
                            );
                            InferenceResult::rejected(stage, r, latency)
                        }
                    });
                }
                Err(err) => {
                    permit.failure();
                    err
                }
            };

            attempt += 1;
            if matches!(err, AttemptError::Cancelled) {
                return Err(TransportError::Cancelled {
                    endpoint: self.endpoint.name.clone(),
                }
                .into());
            }

            let exhausted = attempt >= max_attempts || {
                let delay = self.retry.delay_after(attempt - 1);
                started.elapsed().saturating_add(delay) > self.retry.max_elapsed
            };
            if exhausted {
                tracing::warn!(
                    endpoint = %self.endpoint.name,
                    stage = %stage,
                    attempts = attempt,
                    error = %err,
                    "retries exhausted"
                );
                return Err(TransportError::Exhausted {
                    endpoint: self.endpoint.name.clone(),
                    attempts: attempt,
                    last: err,
                }
                .into());
            }

            let delay = self.retry.delay_after(attempt - 1);
            tracing::debug!(
                endpoint = %self.endpoint.name,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transport failure"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(TransportError::Cancelled { endpoint: self.endpoint.name.clone() }.into());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
