//! Runs backend calls with retry, timeout and cancellation, alone or as a
//! bounded fan-out batch whose results come back in variation order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atelier_contracts::errors::{BackendError, EngineError, EngineResult};
use atelier_contracts::events::EventWriter;
use atelier_contracts::generation::MAX_VARIATIONS;
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::backend::{BackendRequest, ImageResult, ModelBackend};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_secs(2),
            request_timeout: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based): doubling from the
    /// initial backoff, never shorter than a provider `Retry-After`.
    pub fn delay_for(&self, retry: u32, retry_after_s: Option<u64>) -> Duration {
        let factor = 2u32.saturating_pow(retry.saturating_sub(1));
        let computed = self.initial_backoff.saturating_mul(factor);
        match retry_after_s {
            Some(seconds) => computed.max(Duration::from_secs(seconds)),
            None => computed,
        }
    }
}

/// A successful unit: what the backend returned and how many calls it took.
#[derive(Debug, Clone)]
pub struct UnitOutput {
    pub image: ImageResult,
    pub attempts: u32,
}

pub type UnitOutcome = Result<UnitOutput, BackendError>;

#[derive(Debug)]
pub struct BatchRun {
    /// One entry per unit, in the order the units were submitted.
    pub outcomes: Vec<UnitOutcome>,
    pub cancelled: bool,
}

pub struct GenerationOrchestrator {
    backend: Arc<dyn ModelBackend>,
    events: EventWriter,
    policy: RetryPolicy,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl GenerationOrchestrator {
    pub fn new(backend: Arc<dyn ModelBackend>, events: EventWriter, policy: RetryPolicy) -> Self {
        Self {
            backend,
            events,
            policy,
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// One generation unit under `request.request_id`.
    pub async fn run_single(&self, request: BackendRequest) -> EngineResult<UnitOutput> {
        let registration = self.register(&request.request_id)?;
        let outcome = run_tracked(
            Arc::clone(&self.backend),
            self.events.clone(),
            self.policy,
            request,
            registration.token.clone(),
        )
        .await;
        drop(registration);
        outcome.map_err(EngineError::from)
    }

    /// Fans `units` out under one cancellation scope keyed by `request_id`.
    /// At most [`MAX_VARIATIONS`] backend calls are in flight at once.
    pub async fn run_batch(
        &self,
        request_id: &str,
        units: Vec<BackendRequest>,
    ) -> EngineResult<BatchRun> {
        let registration = self.register(request_id)?;
        let token = registration.token.clone();
        let total = units.len();
        let permits = Arc::new(Semaphore::new(MAX_VARIATIONS));
        let (tx, mut rx) = mpsc::channel::<(usize, UnitOutcome)>(total.max(1));
        let mut tasks = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let tx = tx.clone();
            let permits = Arc::clone(&permits);
            let cancel = token.clone();
            let backend = Arc::clone(&self.backend);
            let events = self.events.clone();
            let policy = self.policy;
            tasks.spawn(async move {
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(BackendError::Cancelled),
                    permit = permits.acquire_owned() => match permit {
                        Ok(_permit) => run_tracked(backend, events, policy, unit, cancel.clone()).await,
                        Err(_) => Err(BackendError::server("batch permits closed")),
                    },
                };
                let _ = tx.send((index, outcome)).await;
            });
        }
        drop(tx);

        let mut slots: Vec<Option<UnitOutcome>> = (0..total).map(|_| None).collect();
        while let Some((index, outcome)) = rx.recv().await {
            if let Some(slot) = slots.get_mut(index) {
                *slot = Some(outcome);
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(request_id, error = %err, "batch unit task ended abnormally");
            }
        }

        let cancelled = token.is_cancelled();
        drop(registration);
        let outcomes = slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| {
                    Err(if cancelled {
                        BackendError::Cancelled
                    } else {
                        BackendError::server("variation ended without a result")
                    })
                })
            })
            .collect();
        Ok(BatchRun {
            outcomes,
            cancelled,
        })
    }

    /// Trips the cancellation token of a running request. False when
    /// nothing is running under `request_id`.
    pub fn cancel(&self, request_id: &str) -> bool {
        let token = match self.active.lock() {
            Ok(active) => active.get(request_id).cloned(),
            Err(_) => {
                warn!(request_id, "cancellation registry lock poisoned");
                None
            }
        };
        match token {
            Some(token) => {
                token.cancel();
                info!(request_id, "generation cancel requested");
                true
            }
            None => false,
        }
    }

    fn register(&self, request_id: &str) -> EngineResult<Registration<'_>> {
        let mut active = self
            .active
            .lock()
            .map_err(|_| EngineError::invalid_state("cancellation registry lock poisoned"))?;
        if active.contains_key(request_id) {
            return Err(EngineError::InvalidRequest(format!(
                "request {request_id} is already running"
            )));
        }
        let token = CancellationToken::new();
        active.insert(request_id.to_string(), token.clone());
        Ok(Registration {
            active: &self.active,
            request_id: request_id.to_string(),
            token,
        })
    }
}

/// Keeps a request cancellable for as long as it is alive.
struct Registration<'a> {
    active: &'a Mutex<HashMap<String, CancellationToken>>,
    request_id: String,
    token: CancellationToken,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.request_id);
        }
    }
}

async fn run_tracked(
    backend: Arc<dyn ModelBackend>,
    events: EventWriter,
    policy: RetryPolicy,
    request: BackendRequest,
    cancel: CancellationToken,
) -> UnitOutcome {
    emit(
        &events,
        "generation_started",
        json!({
            "request_id": request.request_id,
            "model_id": request.model_id,
            "backend": backend.name(),
            "references": request.reference_ids(),
        }),
    );
    let outcome = run_unit(&*backend, &events, policy, &request, &cancel).await;
    match &outcome {
        Ok(output) => emit(
            &events,
            "generation_completed",
            json!({
                "request_id": request.request_id,
                "model_id": request.model_id,
                "attempts": output.attempts,
                "mime_type": output.image.mime_type,
                "usage": output.image.usage,
            }),
        ),
        Err(BackendError::Cancelled) => emit(
            &events,
            "generation_cancelled",
            json!({"request_id": request.request_id, "model_id": request.model_id}),
        ),
        Err(err) => {
            warn!(
                request_id = %request.request_id,
                model_id = %request.model_id,
                error = %err,
                "generation failed"
            );
            emit(
                &events,
                "generation_failed",
                json!({
                    "request_id": request.request_id,
                    "model_id": request.model_id,
                    "error": err,
                }),
            );
        }
    }
    outcome
}

async fn run_unit(
    backend: &dyn ModelBackend,
    events: &EventWriter,
    policy: RetryPolicy,
    request: &BackendRequest,
    cancel: &CancellationToken,
) -> UnitOutcome {
    let mut attempts = 0u32;
    loop {
        attempts += 1;
        let call = tokio::time::timeout(policy.request_timeout, backend.generate(request));
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            result = call => match result {
                Ok(result) => result,
                Err(_) => Err(BackendError::Timeout {
                    message: format!(
                        "{} did not answer within {}s",
                        request.model_id,
                        policy.request_timeout.as_secs()
                    ),
                }),
            },
        };

        let err = match result {
            Ok(image) => return Ok(UnitOutput { image, attempts }),
            Err(err) => err,
        };
        if !err.is_retryable() || attempts > policy.max_retries {
            return Err(err);
        }

        let delay = policy.delay_for(attempts, err.retry_after_s());
        warn!(
            request_id = %request.request_id,
            attempt = attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying generation"
        );
        emit(
            events,
            "generation_retry",
            json!({
                "request_id": request.request_id,
                "model_id": request.model_id,
                "attempt": attempts,
                "delay_ms": delay.as_millis() as u64,
                "error": err,
            }),
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(BackendError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Event log writes never fail the operation that produced them.
pub(crate) fn emit(events: &EventWriter, event_type: &str, payload: Value) {
    if let Err(err) = events.emit(event_type, map_object(payload)) {
        warn!(event_type, error = %format!("{err:#}"), "event log write failed");
    }
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
