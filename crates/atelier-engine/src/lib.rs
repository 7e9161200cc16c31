//! Conversational image sessions with branching history, plus one-shot and
//! batch generation, on top of a pluggable [`ModelBackend`].
//!
//! [`Studio`] is the entry point. It owns the session registry, the image
//! store and the generation orchestrator, and writes every committed
//! mutation and generation step to `events.jsonl`.

pub mod artifacts;
pub mod backend;
pub mod branch;
pub mod config;
pub mod mask;
pub mod openrouter;
pub mod orchestrator;
pub mod prompt;
pub mod storage;
pub mod store;
pub mod subject_lock;
pub mod token_usage;

#[cfg(test)]
mod testing;

use std::path::Path;
use std::sync::Arc;

use atelier_contracts::errors::{BackendError, EngineError, EngineResult};
use atelier_contracts::events::EventWriter;
use atelier_contracts::generation::{
    new_request_id, BatchResult, ComposeRequest, GenerationParams, GenerationRequest,
    GenerationResult, MaskEditRequest, TokenUsage, TurnRequest, VariationOutcome,
    VariationReport,
};
use atelier_contracts::models::{
    ModelSelection, ModelSelector, ModelSpec, RecommendationContext, DEFAULT_MODEL_ID,
};
use atelier_contracts::sessions::{AssistantPayload, Session, SessionSummary, Turn};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::artifacts::{FsImageStore, ImageStore, StoredImage};
use crate::backend::{build_history, BackendRequest, ModelBackend, ReferenceImage};
use crate::config::StudioConfig;
use crate::orchestrator::{emit, GenerationOrchestrator, UnitOutput};
use crate::storage::{JsonFileStorage, SessionStorage};
use crate::store::{EditLease, SessionStore};
use crate::token_usage::TokenUsageEstimator;

/// What a new session starts from: typically the prompt and image of an
/// earlier one-shot generation.
#[derive(Debug, Clone, Default)]
pub struct SessionSeed {
    pub prompt: Option<String>,
    pub image_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub session: Session,
    pub assistant_turn: Turn,
    pub token_usage: TokenUsage,
    pub attempts: u32,
}

/// A conversational edit the backend is about to answer.
struct PendingEdit<'a> {
    lease: &'a EditLease,
    user_text: String,
    model: ModelSpec,
    request: BackendRequest,
}

pub struct Studio {
    config: StudioConfig,
    selector: ModelSelector,
    sessions: SessionStore,
    images: Arc<dyn ImageStore>,
    orchestrator: GenerationOrchestrator,
    estimator: TokenUsageEstimator,
    events: EventWriter,
}

impl Studio {
    /// Studio persisting sessions and images under `config.data_dir`.
    pub fn new(config: StudioConfig, backend: Arc<dyn ModelBackend>) -> Self {
        let storage = Arc::new(JsonFileStorage::new(config.data_dir.clone()));
        let images = Arc::new(FsImageStore::new(config.data_dir.clone()));
        Self::with_collaborators(config, backend, storage, images)
    }

    pub fn with_collaborators(
        config: StudioConfig,
        backend: Arc<dyn ModelBackend>,
        storage: Arc<dyn SessionStorage>,
        images: Arc<dyn ImageStore>,
    ) -> Self {
        let events = EventWriter::new(config.events_path(), "studio");
        let orchestrator =
            GenerationOrchestrator::new(backend, events.clone(), config.retry_policy());
        Self {
            selector: ModelSelector::default(),
            sessions: SessionStore::new(storage),
            images,
            orchestrator,
            estimator: TokenUsageEstimator::new(config.near_limit_ratio),
            events,
            config,
        }
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &str {
        self.orchestrator.backend_name()
    }

    pub fn models(&self) -> Vec<ModelSpec> {
        self.selector.registry.list().cloned().collect()
    }

    /// Best catalog model for a generation with these settings.
    pub fn recommend_model(
        &self,
        params: &GenerationParams,
        text_in_image: bool,
    ) -> EngineResult<ModelSelection> {
        self.selector.recommend(&RecommendationContext {
            text_in_image,
            style_preset: params.style_preset.clone(),
            resolution: params.resolution.clone(),
            character_references: !params.character_reference_ids.is_empty(),
        })
    }

    /// Substitute to offer when `model_id` reports itself unavailable.
    pub fn fallback_model(&self, model_id: &str) -> Option<ModelSelection> {
        self.selector.fallback_for(model_id)
    }

    pub fn create_session(
        &self,
        model_id: Option<&str>,
        seed: SessionSeed,
    ) -> EngineResult<Session> {
        let model = self
            .selector
            .require(model_id.unwrap_or(DEFAULT_MODEL_ID))?
            .clone();
        let project_id = self.config.project_id.as_str();
        let seed_image = match seed.image_id.as_deref() {
            Some(image_id) => {
                let stored = self
                    .images
                    .locate(project_id, image_id)?
                    .ok_or_else(|| EngineError::not_found(format!("image {image_id}")))?;
                Some(AssistantPayload {
                    image_id: Some(stored.image_id),
                    image_url: Some(stored.image_url),
                    thumbnail_url: stored.thumbnail_url,
                    ..AssistantPayload::default()
                })
            }
            None => None,
        };

        let session = branch::create_session(project_id, &model.id);
        let session = branch::append_seed_turns(&session, seed.prompt.as_deref(), seed_image)?;
        let session = self.sessions.insert(session)?;
        info!(session_id = %session.session_id, model_id = %model.id, "session created");
        emit(
            &self.events,
            "session_created",
            json!({
                "session_id": session.session_id,
                "project_id": session.project_id,
                "model_id": session.model_id,
                "seed_turns": session.active_branch()?.turns.len(),
            }),
        );
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> EngineResult<Session> {
        self.sessions.snapshot(session_id)
    }

    pub fn list_sessions(&self) -> EngineResult<Vec<SessionSummary>> {
        self.sessions.list(Some(&self.config.project_id))
    }

    pub fn delete_session(&self, session_id: &str) -> EngineResult<()> {
        self.sessions.delete(session_id)?;
        info!(session_id, "session deleted");
        Ok(())
    }

    pub fn undo_turn(&self, session_id: &str) -> EngineResult<Session> {
        let before = self.sessions.snapshot(session_id)?;
        let session = self.sessions.mutate(session_id, branch::undo)?;
        let removed = turn_count(&before).saturating_sub(turn_count(&session));
        emit(
            &self.events,
            "turns_undone",
            json!({
                "session_id": session_id,
                "branch_id": session.active_branch_id,
                "removed": removed,
            }),
        );
        Ok(session)
    }

    pub fn revert_to_turn(&self, session_id: &str, turn_index: i64) -> EngineResult<Session> {
        let session = self
            .sessions
            .mutate(session_id, |s| branch::revert_to_turn(s, turn_index))?;
        emit(
            &self.events,
            "branch_reverted",
            json!({
                "session_id": session_id,
                "branch_id": session.active_branch_id,
                "turn_index": turn_index,
                "turn_count": turn_count(&session),
            }),
        );
        Ok(session)
    }

    pub fn branch_from_turn(
        &self,
        session_id: &str,
        turn_index: i64,
        name: Option<&str>,
    ) -> EngineResult<Session> {
        let session = self
            .sessions
            .mutate(session_id, |s| branch::branch_from_turn(s, turn_index, name))?;
        let created = session.active_branch()?;
        info!(session_id, branch = %created.name, "branch created");
        emit(
            &self.events,
            "branch_created",
            json!({
                "session_id": session_id,
                "branch_id": created.branch_id,
                "name": created.name,
                "parent_branch_id": created.parent_branch_id,
                "fork_turn_index": created.fork_turn_index,
            }),
        );
        Ok(session)
    }

    pub fn switch_branch(&self, session_id: &str, branch_id: &str) -> EngineResult<Session> {
        let session = self
            .sessions
            .mutate(session_id, |s| branch::switch_branch(s, branch_id))?;
        emit(
            &self.events,
            "branch_switched",
            json!({"session_id": session_id, "branch_id": branch_id}),
        );
        Ok(session)
    }

    pub fn toggle_subject_lock(
        &self,
        session_id: &str,
        locked: bool,
        image_id: Option<&str>,
    ) -> EngineResult<Session> {
        let session = self.sessions.mutate(session_id, |s| {
            subject_lock::set_subject_lock(s, locked, image_id)
        })?;
        emit(
            &self.events,
            "subject_lock_changed",
            json!({
                "session_id": session_id,
                "locked": session.subject_locked,
                "image_id": session.subject_lock_image_id,
            }),
        );
        Ok(session)
    }

    pub fn get_token_usage(&self, session_id: &str) -> EngineResult<TokenUsage> {
        let session = self.sessions.snapshot(session_id)?;
        self.token_usage_for(&session)
    }

    /// Appends a user turn and the model's answer to the active branch. On
    /// any failure the user turn is rolled back and the branch is unchanged.
    pub async fn send_turn(&self, request: TurnRequest) -> EngineResult<TurnOutcome> {
        require_prompt(&request.prompt)?;
        validate_weight(&request.params)?;
        let lease = self.sessions.begin_edit(&request.session_id)?;
        let current = lease.snapshot()?;
        let model = self
            .selector
            .require(request.model_id.as_deref().unwrap_or(&current.model_id))?
            .clone();

        let plan = subject_lock::plan_references(&current, model.category, &request.params)?;
        let history = if plan.include_history {
            build_history(current.active_branch()?)
        } else {
            Vec::new()
        };
        let references = self.resolve_references(&current.project_id, &plan.all_ids())?;
        let prompt = prompt::build_prompt(
            &request.prompt,
            &request.params,
            model.category,
            !references.is_empty(),
        );
        let backend_request = BackendRequest {
            request_id: request.request_id.clone(),
            model_id: model.id.clone(),
            category: model.category,
            prompt,
            history,
            aspect_ratio: request.params.aspect_ratio.clone(),
            resolution: request.params.resolution.clone(),
            references,
        };

        let (session, _, attempts) = self
            .run_session_edit(PendingEdit {
                lease: &lease,
                user_text: request.prompt.trim().to_string(),
                model,
                request: backend_request,
            })
            .await?;
        let assistant_turn = session
            .active_branch()?
            .turns
            .last()
            .cloned()
            .ok_or_else(|| EngineError::invalid_state("committed turn missing from branch"))?;
        let token_usage = self.token_usage_for(&session)?;
        Ok(TurnOutcome {
            session,
            assistant_turn,
            token_usage,
            attempts,
        })
    }

    /// One image, never committed to a branch.
    pub async fn generate(&self, request: GenerationRequest) -> EngineResult<GenerationResult> {
        request.validate()?;
        if request.variations != 1 {
            return Err(EngineError::InvalidRequest(format!(
                "generate produces one image; use a batch for {} variations",
                request.variations
            )));
        }
        let model = self.selector.require(&request.model_id)?.clone();
        let plan = subject_lock::plan_standalone(&request.params);
        let references = self.resolve_references(&self.config.project_id, &plan.all_ids())?;
        let backend_request = BackendRequest {
            request_id: request.request_id.clone(),
            model_id: model.id.clone(),
            category: model.category,
            prompt: prompt::build_prompt(
                &request.prompt,
                &request.params,
                model.category,
                !references.is_empty(),
            ),
            history: Vec::new(),
            aspect_ratio: request.params.aspect_ratio.clone(),
            resolution: request.params.resolution.clone(),
            references,
        };
        let output = self
            .orchestrator
            .run_single(backend_request)
            .await
            .inspect_err(|err| self.suggest_fallback(&model.id, err))?;
        let stored = self.save_output(&self.config.project_id, &output)?;
        Ok(generation_result(
            &request.request_id,
            0,
            &model.id,
            &request.prompt,
            stored,
            output,
        ))
    }

    /// Up to four variations in parallel. Succeeds when at least one
    /// variation does, or when the batch was cancelled.
    pub async fn generate_batch(&self, request: GenerationRequest) -> EngineResult<BatchResult> {
        request.validate()?;
        let model_ids = self.selector.resolve_batch_models(
            &request.model_id,
            &request.model_ids,
            request.variations,
            request.multi_model,
        )?;
        let plan = subject_lock::plan_standalone(&request.params);
        let references = self.resolve_references(&self.config.project_id, &plan.all_ids())?;
        let batch_id = request.batch_id.clone().unwrap_or_else(new_request_id);

        let mut units = Vec::with_capacity(model_ids.len());
        for (index, model_id) in model_ids.iter().enumerate() {
            let model = self.selector.require(model_id)?;
            units.push(BackendRequest {
                request_id: format!("{}-{index}", request.request_id),
                model_id: model.id.clone(),
                category: model.category,
                prompt: prompt::build_prompt(
                    &request.prompt,
                    &request.params,
                    model.category,
                    !references.is_empty(),
                ),
                history: Vec::new(),
                aspect_ratio: request.params.aspect_ratio.clone(),
                resolution: request.params.resolution.clone(),
                references: references.clone(),
            });
        }
        emit(
            &self.events,
            "batch_started",
            json!({
                "batch_id": batch_id,
                "request_id": request.request_id,
                "variations": request.variations,
                "models": model_ids,
            }),
        );

        let run = self
            .orchestrator
            .run_batch(&request.request_id, units)
            .await?;
        let mut variations = Vec::with_capacity(run.outcomes.len());
        for (index, (outcome, model_id)) in run.outcomes.into_iter().zip(model_ids).enumerate() {
            let outcome = match outcome {
                Ok(output) => match self.save_output(&self.config.project_id, &output) {
                    Ok(stored) => VariationOutcome::Completed {
                        result: generation_result(
                            &format!("{}-{index}", request.request_id),
                            index,
                            &model_id,
                            &request.prompt,
                            stored,
                            output,
                        ),
                    },
                    Err(err) => {
                        warn!(index, error = %err, "variation image could not be stored");
                        VariationOutcome::Failed {
                            error: BackendError::server(format!("failed to store image: {err}")),
                        }
                    }
                },
                Err(error) => VariationOutcome::Failed { error },
            };
            variations.push(VariationReport {
                index,
                model_id,
                outcome,
            });
        }

        let result = BatchResult {
            batch_id: batch_id.clone(),
            request_id: request.request_id.clone(),
            total_requested: request.variations,
            total_completed: variations.iter().filter(|v| v.outcome.is_completed()).count(),
            variations,
            cancelled: run.cancelled,
        };
        info!(
            batch_id = %batch_id,
            completed = result.total_completed,
            requested = result.total_requested,
            cancelled = result.cancelled,
            "batch finished"
        );
        emit(
            &self.events,
            "batch_finished",
            json!({
                "batch_id": batch_id,
                "request_id": result.request_id,
                "total_requested": result.total_requested,
                "total_completed": result.total_completed,
                "cancelled": result.cancelled,
            }),
        );

        if result.total_completed == 0 && !result.cancelled {
            return Err(EngineError::BatchFailed {
                batch_id,
                failures: result
                    .failures()
                    .map(|(index, error)| (index, error.clone()))
                    .collect(),
            });
        }
        Ok(result)
    }

    /// Cancels a running single generation, conversational edit or batch.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.orchestrator.cancel(request_id)
    }

    /// Regional edit of `request.image_id`. Inside a session the edit is
    /// committed as a turn pair with the usual rollback on failure.
    pub async fn mask_edit(&self, request: MaskEditRequest) -> EngineResult<GenerationResult> {
        require_prompt(&request.prompt)?;
        validate_weight(&request.params)?;
        let mask = mask::decode_mask(&request.mask_b64)
            .map_err(|err| EngineError::InvalidRequest(format!("{err:#}")))?;
        let region = request
            .region_description
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| mask::describe_mask_region(&mask));

        let lease = match request.session_id.as_deref() {
            Some(session_id) => Some(self.sessions.begin_edit(session_id)?),
            None => None,
        };
        let session = match &lease {
            Some(lease) => Some(lease.snapshot()?),
            None => None,
        };
        let project_id = session
            .as_ref()
            .map(|s| s.project_id.clone())
            .unwrap_or_else(|| self.config.project_id.clone());
        let model_id = request
            .model_id
            .as_deref()
            .or(session.as_ref().map(|s| s.model_id.as_str()))
            .unwrap_or(DEFAULT_MODEL_ID);
        let model = self.selector.require(model_id)?.clone();

        let source = self
            .images
            .read(&project_id, &request.image_id)?
            .ok_or_else(|| EngineError::not_found(format!("image {}", request.image_id)))?;
        let reference = if model.category.is_conversational() {
            self.resolve_references(&project_id, &[request.image_id.clone()])?
        } else {
            let composited = mask::composite_mask(&source, &mask)
                .map_err(|err| EngineError::InvalidRequest(format!("{err:#}")))?;
            vec![ReferenceImage {
                image_id: request.image_id.clone(),
                data_url: format!("data:image/png;base64,{}", BASE64.encode(composited)),
            }]
        };
        let history = match &session {
            Some(session) if model.category.is_conversational() => {
                build_history(session.active_branch()?)
            }
            _ => Vec::new(),
        };
        let mask_prompt = mask::build_mask_prompt(&request.prompt, &region, model.category);
        let backend_request = BackendRequest {
            request_id: request.request_id.clone(),
            model_id: model.id.clone(),
            category: model.category,
            prompt: prompt::build_prompt(&mask_prompt, &request.params, model.category, true),
            history,
            aspect_ratio: request.params.aspect_ratio.clone(),
            resolution: request.params.resolution.clone(),
            references: reference,
        };

        match &lease {
            Some(lease) => {
                let model_id = model.id.clone();
                let (_, payload, attempts) = self
                    .run_session_edit(PendingEdit {
                        lease,
                        user_text: format!("[Mask edit] {}", request.prompt.trim()),
                        model,
                        request: backend_request,
                    })
                    .await?;
                Ok(GenerationResult {
                    request_id: request.request_id,
                    variation_index: 0,
                    model_id,
                    prompt: request.prompt,
                    image_id: payload.image_id.unwrap_or_default(),
                    image_url: payload.image_url,
                    thumbnail_url: payload.thumbnail_url,
                    text_response: payload.text_response,
                    usage: payload.usage,
                    attempts,
                    created_at: Utc::now(),
                })
            }
            None => {
                let output = self
                    .orchestrator
                    .run_single(backend_request)
                    .await
                    .inspect_err(|err| self.suggest_fallback(&model.id, err))?;
                let stored = self.save_output(&project_id, &output)?;
                Ok(generation_result(
                    &request.request_id,
                    0,
                    &model.id,
                    &request.prompt,
                    stored,
                    output,
                ))
            }
        }
    }

    /// Combines 2 to 5 source images into one.
    pub async fn compose(&self, request: ComposeRequest) -> EngineResult<GenerationResult> {
        request.validate()?;
        require_prompt(&request.prompt)?;
        validate_weight(&request.params)?;
        let model = self.selector.require(&request.model_id)?.clone();
        let ids: Vec<String> = request
            .sources
            .iter()
            .map(|source| source.image_id.clone())
            .collect();
        let references = self.resolve_references(&self.config.project_id, &ids)?;
        let labels: Vec<String> = request
            .sources
            .iter()
            .map(|source| source.label.clone().unwrap_or_default())
            .collect();
        let backend_request = BackendRequest {
            request_id: request.request_id.clone(),
            model_id: model.id.clone(),
            category: model.category,
            prompt: prompt::compose_prompt(
                &labels,
                &request.prompt,
                request.params.image_weight,
                model.category,
            ),
            history: Vec::new(),
            aspect_ratio: request.params.aspect_ratio.clone(),
            resolution: request.params.resolution.clone(),
            references,
        };
        let output = self
            .orchestrator
            .run_single(backend_request)
            .await
            .inspect_err(|err| self.suggest_fallback(&model.id, err))?;
        let stored = self.save_output(&self.config.project_id, &output)?;
        Ok(generation_result(
            &request.request_id,
            0,
            &model.id,
            &request.prompt,
            stored,
            output,
        ))
    }

    /// Copies a local file into the image store so it can be referenced by id.
    pub fn import_image(&self, path: &Path) -> EngineResult<StoredImage> {
        Ok(self.images.import_file(&self.config.project_id, path)?)
    }

    async fn run_session_edit(
        &self,
        edit: PendingEdit<'_>,
    ) -> EngineResult<(Session, AssistantPayload, u32)> {
        let PendingEdit {
            lease,
            user_text,
            model,
            request,
        } = edit;
        let session_id = lease.session_id().to_string();
        let request_id = request.request_id.clone();
        let before = lease.snapshot()?;
        let previous_model = before.model_id.clone();
        let project_id = before.project_id.clone();

        lease.commit(|s| {
            let mut next = branch::append_user_turn(s, &user_text)?;
            next.model_id = model.id.clone();
            Ok(next)
        })?;
        let pending = PendingTurn {
            lease,
            previous_model,
            request_id: request_id.clone(),
            events: &self.events,
            resolved: false,
        };

        let answered = async {
            let output = self.orchestrator.run_single(request).await?;
            let stored = self.save_output(&project_id, &output)?;
            let attempts = output.attempts;
            let payload = AssistantPayload {
                image_id: Some(stored.image_id),
                image_url: Some(stored.image_url),
                thumbnail_url: stored.thumbnail_url,
                text_response: output.image.text_response,
                usage: output.image.usage,
            };
            let session = lease.commit(|s| branch::append_assistant_turn(s, payload.clone()))?;
            Ok::<_, EngineError>((session, payload, attempts))
        }
        .await;

        match answered {
            Ok((session, payload, attempts)) => {
                pending.resolve();
                let usage = self.token_usage_for(&session)?;
                info!(
                    session_id = %session_id,
                    model_id = %model.id,
                    attempts,
                    "turn committed"
                );
                emit(
                    &self.events,
                    "turn_committed",
                    json!({
                        "session_id": session_id,
                        "request_id": request_id,
                        "branch_id": session.active_branch_id,
                        "model_id": model.id,
                        "image_id": payload.image_id,
                        "attempts": attempts,
                    }),
                );
                emit(
                    &self.events,
                    "context_window_update",
                    json!({
                        "session_id": session_id,
                        "estimated_tokens": usage.estimated_tokens,
                        "context_limit": usage.context_limit,
                        "usage_ratio": usage.usage_ratio,
                        "near_limit": usage.near_limit,
                    }),
                );
                Ok((session, payload, attempts))
            }
            Err(err) => {
                let rolled_back = pending.roll_back();
                if let Err(rollback_err) = &rolled_back {
                    warn!(
                        session_id = %session_id,
                        error = %rollback_err,
                        "rollback of orphaned user turn failed"
                    );
                }
                warn!(session_id = %session_id, error = %err, "turn rolled back");
                self.suggest_fallback(&model.id, &err);
                emit(
                    &self.events,
                    "turn_rolled_back",
                    json!({
                        "session_id": session_id,
                        "request_id": request_id,
                        "error_type": err.kind(),
                        "error": err.to_string(),
                        "rolled_back": rolled_back.is_ok(),
                    }),
                );
                Err(err)
            }
        }
    }

    fn suggest_fallback(&self, model_id: &str, err: &EngineError) {
        if !matches!(err, EngineError::Backend(BackendError::Unavailable { .. })) {
            return;
        }
        let Some(suggestion) = self.selector.fallback_for(model_id) else {
            return;
        };
        info!(model_id, suggested = %suggestion.model.id, "fallback model suggested");
        emit(
            &self.events,
            "model_fallback_suggested",
            json!({
                "unavailable_model_id": model_id,
                "suggested_model_id": suggestion.model.id,
                "reason": suggestion.reason,
            }),
        );
    }

    fn token_usage_for(&self, session: &Session) -> EngineResult<TokenUsage> {
        let limit = self
            .selector
            .registry
            .get(&session.model_id)
            .and_then(|model| model.context_window)
            .unwrap_or(self.config.context_limit);
        Ok(self.estimator.estimate(session.active_branch()?, limit))
    }

    fn resolve_references(
        &self,
        project_id: &str,
        image_ids: &[String],
    ) -> EngineResult<Vec<ReferenceImage>> {
        image_ids
            .iter()
            .map(|image_id| {
                let data_url = self
                    .images
                    .data_url(project_id, image_id)?
                    .ok_or_else(|| EngineError::not_found(format!("image {image_id}")))?;
                Ok(ReferenceImage {
                    image_id: image_id.clone(),
                    data_url,
                })
            })
            .collect()
    }

    fn save_output(&self, project_id: &str, output: &UnitOutput) -> EngineResult<StoredImage> {
        Ok(self
            .images
            .save(project_id, &output.image.bytes, &output.image.mime_type)?)
    }
}

/// A user turn committed ahead of the model's answer. Unless resolved it is
/// undone on drop, which covers callers that drop the edit future.
struct PendingTurn<'a> {
    lease: &'a EditLease,
    previous_model: String,
    request_id: String,
    events: &'a EventWriter,
    resolved: bool,
}

impl PendingTurn<'_> {
    fn resolve(mut self) {
        self.resolved = true;
    }

    fn roll_back(mut self) -> EngineResult<Session> {
        self.resolved = true;
        self.undo()
    }

    fn undo(&self) -> EngineResult<Session> {
        self.lease.commit(|s| {
            let mut next = branch::undo(s)?;
            next.model_id = self.previous_model.clone();
            Ok(next)
        })
    }
}

impl Drop for PendingTurn<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let session_id = self.lease.session_id();
        let rolled_back = self.undo();
        match &rolled_back {
            Ok(_) => warn!(session_id, request_id = %self.request_id, "abandoned turn rolled back"),
            Err(err) => warn!(
                session_id,
                error = %err,
                "rollback of abandoned user turn failed"
            ),
        }
        emit(
            self.events,
            "turn_rolled_back",
            json!({
                "session_id": session_id,
                "request_id": self.request_id,
                "error_type": "abandoned",
                "error": "edit dropped before the model answered",
                "rolled_back": rolled_back.is_ok(),
            }),
        );
    }
}

fn generation_result(
    request_id: &str,
    variation_index: usize,
    model_id: &str,
    prompt: &str,
    stored: StoredImage,
    output: UnitOutput,
) -> GenerationResult {
    GenerationResult {
        request_id: request_id.to_string(),
        variation_index,
        model_id: model_id.to_string(),
        prompt: prompt.to_string(),
        image_id: stored.image_id,
        image_url: Some(stored.image_url),
        thumbnail_url: stored.thumbnail_url,
        text_response: output.image.text_response,
        usage: output.image.usage,
        attempts: output.attempts,
        created_at: Utc::now(),
    }
}

fn turn_count(session: &Session) -> usize {
    session
        .active_branch()
        .map(|branch| branch.turns.len())
        .unwrap_or(0)
}

fn require_prompt(prompt: &str) -> EngineResult<()> {
    if prompt.trim().is_empty() {
        return Err(EngineError::InvalidRequest("prompt is empty".to_string()));
    }
    Ok(())
}

fn validate_weight(params: &GenerationParams) -> EngineResult<()> {
    match params.image_weight {
        Some(weight) if weight > 100 => Err(EngineError::InvalidRequest(format!(
            "image weight must be between 0 and 100, got {weight}"
        ))),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    use atelier_contracts::errors::{BackendError, EngineError};
    use atelier_contracts::generation::{
        new_request_id, ComposeRequest, ComposeSource, GenerationParams, GenerationRequest,
        MaskEditRequest, TurnRequest, VariationOutcome,
    };
    use atelier_contracts::sessions::TurnRole;
    use base64::Engine as _;
    use image::{DynamicImage, GrayImage, ImageFormat, Luma};
    use serde_json::Value;

    use super::{SessionSeed, Studio, BASE64};
    use crate::artifacts::{FsImageStore, ImageStore};
    use crate::backend::render_solid_png;
    use crate::config::StudioConfig;
    use crate::testing::{MemoryStorage, ScriptedBackend, Step};

    const CHAT_MODEL: &str = "google/gemini-2.5-flash-image";
    const IMAGE_MODEL: &str = "black-forest-labs/flux.2-max";

    struct Fixture {
        dir: tempfile::TempDir,
        backend: Arc<ScriptedBackend>,
        images: Arc<FsImageStore>,
        studio: Studio,
    }

    fn fixture() -> anyhow::Result<Fixture> {
        fixture_with(|_| {})
    }

    fn fixture_with(adjust: impl FnOnce(&mut StudioConfig)) -> anyhow::Result<Fixture> {
        let dir = tempfile::tempdir()?;
        let mut config = StudioConfig::with_data_dir(dir.path());
        adjust(&mut config);
        let backend = Arc::new(ScriptedBackend::default());
        let images = Arc::new(FsImageStore::new(dir.path()));
        let studio = Studio::with_collaborators(
            config,
            backend.clone(),
            Arc::new(MemoryStorage::default()),
            images.clone(),
        );
        Ok(Fixture {
            dir,
            backend,
            images,
            studio,
        })
    }

    fn turn(session_id: &str, request_id: &str, prompt: &str) -> TurnRequest {
        let mut request = TurnRequest::new(session_id, prompt);
        request.request_id = request_id.to_string();
        request
    }

    fn event_types(dir: &tempfile::TempDir) -> anyhow::Result<Vec<String>> {
        let raw = fs::read_to_string(dir.path().join("events.jsonl"))?;
        raw.lines()
            .map(|line| {
                let value: Value = serde_json::from_str(line)?;
                Ok(value["type"].as_str().unwrap_or_default().to_string())
            })
            .collect()
    }

    fn left_half_mask() -> anyhow::Result<String> {
        let mask = GrayImage::from_fn(4, 4, |x, _| if x < 2 { Luma([255]) } else { Luma([0]) });
        let mut bytes = Vec::new();
        DynamicImage::ImageLuma8(mask).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
        Ok(BASE64.encode(bytes))
    }

    fn content_policy() -> BackendError {
        BackendError::ContentPolicy {
            message: "flagged".to_string(),
        }
    }

    #[tokio::test]
    async fn conversational_turns_commit_pairs_and_carry_history() -> anyhow::Result<()> {
        let fx = fixture()?;
        let session = fx.studio.create_session(Some(CHAT_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();

        let first = fx.studio.send_turn(turn(id, "t1", "a red fox")).await?;
        assert_eq!(first.assistant_turn.role, TurnRole::Assistant);
        assert_eq!(
            first.assistant_turn.text_response.as_deref(),
            Some("reply to a red fox")
        );
        assert!(first.assistant_turn.image_id.is_some());

        let second = fx.studio.send_turn(turn(id, "t2", "make it blue")).await?;
        assert_eq!(second.session.active_branch()?.turns.len(), 4);

        let calls = fx.backend.calls();
        assert!(calls[0].history.is_empty());
        let history: Vec<(TurnRole, String)> = calls[1]
            .history
            .iter()
            .map(|message| (message.role, message.text.clone()))
            .collect();
        assert_eq!(
            history,
            vec![
                (TurnRole::User, "a red fox".to_string()),
                (TurnRole::Assistant, "reply to a red fox".to_string()),
            ]
        );
        assert!(calls[1].references.is_empty());

        // 9 + 18 + 12 + 21 characters.
        let usage = fx.studio.get_token_usage(id)?;
        assert_eq!(usage.estimated_tokens, 15);
        assert_eq!(usage.context_limit, 128_000);
        assert!(!usage.near_limit);
        assert_eq!(second.token_usage, usage);

        let types = event_types(&fx.dir)?;
        assert!(types.iter().any(|t| t == "turn_committed"));
        assert!(types.iter().any(|t| t == "context_window_update"));
        Ok(())
    }

    #[tokio::test]
    async fn failed_turn_leaves_branch_unchanged() -> anyhow::Result<()> {
        let fx = fixture()?;
        let session = fx.studio.create_session(Some(CHAT_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();
        fx.studio.send_turn(turn(id, "ok", "a red fox")).await?;
        let before = fx.studio.get_session(id)?;

        fx.backend.script("bad", vec![Step::Err(content_policy())]);
        let mut request = turn(id, "bad", "something forbidden");
        request.model_id = Some(IMAGE_MODEL.to_string());
        let result = fx.studio.send_turn(request).await;
        assert!(matches!(
            result,
            Err(EngineError::Backend(BackendError::ContentPolicy { .. }))
        ));

        let after = fx.studio.get_session(id)?;
        assert_eq!(after.active_branch()?.turns, before.active_branch()?.turns);
        assert_eq!(after.model_id, CHAT_MODEL);
        assert!(event_types(&fx.dir)?.iter().any(|t| t == "turn_rolled_back"));

        fx.studio.send_turn(turn(id, "again", "a grey fox")).await?;
        assert_eq!(fx.studio.get_session(id)?.active_branch()?.turns.len(), 4);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_turn_rolls_back_user_turn() -> anyhow::Result<()> {
        let Fixture {
            dir: _dir,
            backend,
            studio,
            ..
        } = fixture()?;
        let session = studio.create_session(Some(CHAT_MODEL), SessionSeed::default())?;
        let id = session.session_id.clone();
        backend.script("stuck", vec![Step::Hang]);
        let studio = Arc::new(studio);

        let running = {
            let studio = Arc::clone(&studio);
            let request = turn(&id, "stuck", "a slow fox");
            tokio::spawn(async move { studio.send_turn(request).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(studio.cancel("stuck"));
        let result = running.await?;

        assert!(matches!(
            result,
            Err(EngineError::Backend(BackendError::Cancelled))
        ));
        let after = studio.get_session(&id)?;
        assert!(after.active_branch()?.turns.is_empty());
        studio.send_turn(turn(&id, "next", "a quick fox")).await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_turn_future_leaves_no_pending_user_turn() -> anyhow::Result<()> {
        let fx = fixture()?;
        let session = fx.studio.create_session(Some(CHAT_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();
        fx.studio.send_turn(turn(id, "ok", "a red fox")).await?;
        let before = fx.studio.get_session(id)?;
        fx.backend.script("hung", vec![Step::Hang]);

        let mut request = turn(id, "hung", "never answered");
        request.model_id = Some(IMAGE_MODEL.to_string());
        let timed_out =
            tokio::time::timeout(Duration::from_secs(5), fx.studio.send_turn(request)).await;
        assert!(timed_out.is_err());

        let after = fx.studio.get_session(id)?;
        assert_eq!(after.active_branch()?.turns, before.active_branch()?.turns);
        assert!(!after.active_branch()?.has_pending_user_turn());
        assert_eq!(after.model_id, CHAT_MODEL);
        assert!(event_types(&fx.dir)?.iter().any(|t| t == "turn_rolled_back"));

        fx.studio.send_turn(turn(id, "again", "a grey fox")).await?;
        assert_eq!(fx.studio.get_session(id)?.active_branch()?.turns.len(), 4);
        Ok(())
    }

    #[tokio::test]
    async fn unavailable_model_gets_a_fallback_suggestion() -> anyhow::Result<()> {
        let fx = fixture_with(|config| config.max_retries = 0)?;
        let session = fx.studio.create_session(Some(IMAGE_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();
        fx.backend.script(
            "down",
            vec![Step::Err(BackendError::Unavailable {
                message: "maintenance".to_string(),
            })],
        );

        let result = fx.studio.send_turn(turn(id, "down", "a lighthouse")).await;
        assert!(matches!(
            result,
            Err(EngineError::Backend(BackendError::Unavailable { .. }))
        ));
        assert!(fx.studio.get_session(id)?.active_branch()?.turns.is_empty());

        let raw = fs::read_to_string(fx.dir.path().join("events.jsonl"))?;
        let suggestion = raw
            .lines()
            .map(serde_json::from_str::<Value>)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .find(|event| event["type"] == "model_fallback_suggested");
        assert_eq!(
            suggestion.map(|event| event["suggested_model_id"].clone()),
            Some(Value::from("bytedance-seed/seedream-4.5"))
        );
        assert_eq!(
            fx.studio
                .fallback_model(IMAGE_MODEL)
                .map(|selection| selection.model.id),
            Some("bytedance-seed/seedream-4.5".to_string())
        );
        Ok(())
    }

    #[test]
    fn recommendation_reads_generation_settings() -> anyhow::Result<()> {
        let fx = fixture()?;
        let plain = fx.studio.recommend_model(&GenerationParams::default(), false)?;
        assert_eq!(plain.model.id, CHAT_MODEL);

        let params = GenerationParams {
            character_reference_ids: vec!["img-1".to_string()],
            ..GenerationParams::default()
        };
        let picked = fx.studio.recommend_model(&params, false)?;
        assert_eq!(picked.model.id, "google/gemini-3-pro-image-preview");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_edits_on_one_session_conflict() -> anyhow::Result<()> {
        let fx = fixture()?;
        let session = fx.studio.create_session(Some(CHAT_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();
        fx.backend.script("slow-a", vec![Step::after(1_000)]);
        fx.backend.script("slow-b", vec![Step::after(1_000)]);

        let (a, b) = tokio::join!(
            fx.studio.send_turn(turn(id, "slow-a", "first")),
            fx.studio.send_turn(turn(id, "slow-b", "second")),
        );
        let conflicts = [&a, &b]
            .iter()
            .filter(|result| {
                matches!(
                    result,
                    Err(EngineError::ConcurrentModificationConflict { .. })
                )
            })
            .count();
        assert_eq!(conflicts, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(fx.studio.get_session(id)?.active_branch()?.turns.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn subject_lock_pins_reference_for_image_only_model() -> anyhow::Result<()> {
        let fx = fixture()?;
        let session = fx.studio.create_session(Some(IMAGE_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();

        let knight = fx.studio.send_turn(turn(id, "t1", "a knight")).await?;
        let pinned = knight.assistant_turn.image_id.clone().unwrap_or_default();
        let locked = fx.studio.toggle_subject_lock(id, true, None)?;
        assert_eq!(locked.subject_lock_image_id.as_deref(), Some(pinned.as_str()));

        fx.studio.send_turn(turn(id, "t2", "in a forest")).await?;
        let night = fx.studio.send_turn(turn(id, "t3", "at night")).await?;
        let calls = fx.backend.calls();
        assert!(calls[0].references.is_empty());
        assert_eq!(calls[1].reference_ids(), vec![pinned.as_str()]);
        assert_eq!(calls[2].reference_ids(), vec![pinned.as_str()]);
        assert!(calls.iter().all(|call| call.history.is_empty()));

        fx.studio.toggle_subject_lock(id, false, None)?;
        fx.studio.send_turn(turn(id, "t4", "at dawn")).await?;
        let latest = night.assistant_turn.image_id.unwrap_or_default();
        assert_eq!(fx.backend.calls()[3].reference_ids(), vec![latest.as_str()]);
        Ok(())
    }

    #[tokio::test]
    async fn batch_partial_success_keeps_variation_positions() -> anyhow::Result<()> {
        let fx = fixture()?;
        fx.backend.script("batch-1", vec![Step::Err(content_policy())]);
        fx.backend.script(
            "batch-3",
            vec![Step::Err(BackendError::Auth {
                message: "bad key".to_string(),
            })],
        );
        let mut request = GenerationRequest::new("a castle", IMAGE_MODEL).with_variations(4);
        request.request_id = "batch".to_string();

        let result = fx.studio.generate_batch(request).await?;
        assert_eq!(result.total_requested, 4);
        assert_eq!(result.total_completed, 2);
        assert!(!result.cancelled);
        let indices: Vec<usize> = result.variations.iter().map(|v| v.index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        let completed: Vec<bool> = result
            .variations
            .iter()
            .map(|v| v.outcome.is_completed())
            .collect();
        assert_eq!(completed, vec![true, false, true, false]);
        for success in result.successes() {
            assert!(fx.images.locate("default", &success.image_id)?.is_some());
        }
        assert!(fx.studio.list_sessions()?.is_empty());

        let types = event_types(&fx.dir)?;
        assert!(types.iter().any(|t| t == "batch_started"));
        assert!(types.iter().any(|t| t == "batch_finished"));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn batch_with_no_successes_fails_with_every_error() -> anyhow::Result<()> {
        let fx = fixture()?;
        fx.backend.script("all-0", vec![Step::Err(content_policy())]);
        fx.backend.script(
            "all-1",
            vec![Step::Err(BackendError::Network {
                message: "offline".to_string(),
            })],
        );
        let mut request = GenerationRequest::new("a castle", IMAGE_MODEL).with_variations(2);
        request.request_id = "all".to_string();

        match fx.studio.generate_batch(request).await {
            Err(EngineError::BatchFailed { failures, .. }) => {
                let indices: Vec<usize> = failures.iter().map(|(index, _)| *index).collect();
                assert_eq!(indices, vec![0, 1]);
                assert_eq!(failures[0].1, content_policy());
            }
            other => panic!("expected batch failure, got {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn multi_model_batch_spreads_across_the_catalog() -> anyhow::Result<()> {
        let fx = fixture()?;
        let mut request = GenerationRequest::new("a castle", IMAGE_MODEL).with_variations(3);
        request.multi_model = true;

        let result = fx.studio.generate_batch(request).await?;
        let models: Vec<&str> = result
            .variations
            .iter()
            .map(|v| v.model_id.as_str())
            .collect();
        assert_eq!(
            models,
            vec![
                IMAGE_MODEL,
                "google/gemini-2.5-flash-image",
                "google/gemini-3-pro-image-preview"
            ]
        );
        assert_eq!(result.total_completed, 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_batch_keeps_finished_variations() -> anyhow::Result<()> {
        let Fixture {
            dir: _dir,
            backend,
            studio,
            ..
        } = fixture()?;
        backend.script("cb-0", vec![Step::ok()]);
        backend.script("cb-1", vec![Step::Hang]);
        let studio = Arc::new(studio);
        let mut request = GenerationRequest::new("a castle", IMAGE_MODEL).with_variations(2);
        request.request_id = "cb".to_string();

        let running = {
            let studio = Arc::clone(&studio);
            tokio::spawn(async move { studio.generate_batch(request).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(studio.cancel("cb"));
        let result = running.await??;

        assert!(result.cancelled);
        assert_eq!(result.total_completed, 1);
        assert!(result.variations[0].outcome.is_completed());
        assert!(matches!(
            result.variations[1].outcome,
            VariationOutcome::Failed {
                error: BackendError::Cancelled
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn token_usage_flags_sessions_near_the_limit() -> anyhow::Result<()> {
        let fx = fixture_with(|config| config.context_limit = 8)?;
        let session = fx.studio.create_session(Some(IMAGE_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();

        let empty = fx.studio.get_token_usage(id)?;
        assert_eq!(empty.estimated_tokens, 0);
        assert!(!empty.near_limit);

        let outcome = fx
            .studio
            .send_turn(turn(id, "t1", "a very long prompt about castles"))
            .await?;
        assert_eq!(outcome.token_usage.estimated_tokens, 8);
        assert_eq!(outcome.token_usage.context_limit, 8);
        assert!(outcome.token_usage.near_limit);
        Ok(())
    }

    #[tokio::test]
    async fn branches_fork_switch_revert_and_undo() -> anyhow::Result<()> {
        let fx = fixture()?;
        let session = fx.studio.create_session(Some(CHAT_MODEL), SessionSeed::default())?;
        let id = session.session_id.as_str();
        let root_id = session.active_branch_id.clone();
        fx.studio.send_turn(turn(id, "t1", "first")).await?;
        fx.studio.send_turn(turn(id, "t2", "second")).await?;

        let forked = fx.studio.branch_from_turn(id, 1, None)?;
        let branch = forked.active_branch()?;
        assert_ne!(branch.branch_id, root_id);
        assert_eq!(branch.parent_branch_id.as_deref(), Some(root_id.as_str()));
        assert_eq!(branch.turns.len(), 2);

        fx.studio.send_turn(turn(id, "t3", "alternative")).await?;
        let session = fx.studio.get_session(id)?;
        let root = &session.branches[&root_id];
        assert_eq!(root.turns.len(), 4);
        assert_eq!(root.turns[2].prompt.as_deref(), Some("second"));
        assert_eq!(session.active_branch()?.turns[2].prompt.as_deref(), Some("alternative"));

        fx.studio.switch_branch(id, &root_id)?;
        let reverted = fx.studio.revert_to_turn(id, 1)?;
        assert_eq!(reverted.active_branch()?.turns.len(), 2);
        let undone = fx.studio.undo_turn(id)?;
        assert!(undone.active_branch()?.turns.is_empty());
        assert!(matches!(
            fx.studio.undo_turn(id),
            Err(EngineError::InvalidState(_))
        ));
        assert!(matches!(
            fx.studio.switch_branch(id, "missing"),
            Err(EngineError::NotFound(_))
        ));

        let types = event_types(&fx.dir)?;
        for expected in ["branch_created", "branch_switched", "branch_reverted", "turns_undone"] {
            assert!(types.iter().any(|t| t == expected), "missing {expected}");
        }
        Ok(())
    }

    #[tokio::test]
    async fn session_can_start_from_a_generation() -> anyhow::Result<()> {
        let fx = fixture()?;
        let generated = fx
            .studio
            .generate(GenerationRequest::new("a lighthouse", CHAT_MODEL))
            .await?;
        let session = fx.studio.create_session(
            Some(CHAT_MODEL),
            SessionSeed {
                prompt: Some("a lighthouse".to_string()),
                image_id: Some(generated.image_id.clone()),
            },
        )?;
        let branch = session.active_branch()?;
        assert_eq!(branch.turns.len(), 2);
        assert_eq!(branch.latest_image_id(), Some(generated.image_id.as_str()));

        let missing = fx.studio.create_session(
            None,
            SessionSeed {
                prompt: None,
                image_id: Some("nope".to_string()),
            },
        );
        assert!(matches!(missing, Err(EngineError::NotFound(_))));
        Ok(())
    }

    #[tokio::test]
    async fn mask_edit_in_session_commits_a_marked_turn() -> anyhow::Result<()> {
        let fx = fixture()?;
        let session = fx.studio.create_session(Some(IMAGE_MODEL), SessionSeed::default())?;
        let id = session.session_id.clone();
        let first = fx.studio.send_turn(turn(&id, "t1", "a portrait")).await?;
        let source_id = first.assistant_turn.image_id.unwrap_or_default();

        let result = fx
            .studio
            .mask_edit(MaskEditRequest {
                request_id: "mask-1".to_string(),
                session_id: Some(id.clone()),
                model_id: None,
                image_id: source_id.clone(),
                mask_b64: left_half_mask()?,
                prompt: "add a hat".to_string(),
                region_description: None,
                params: GenerationParams::default(),
            })
            .await?;

        let session = fx.studio.get_session(&id)?;
        let turns = &session.active_branch()?.turns;
        assert_eq!(turns.len(), 4);
        assert_eq!(turns[2].prompt.as_deref(), Some("[Mask edit] add a hat"));
        assert_eq!(turns[3].image_id.as_deref(), Some(result.image_id.as_str()));

        let call = fx.backend.calls().pop().ok_or_else(|| anyhow::anyhow!("no call"))?;
        assert!(call.prompt.contains("Fill the blank area with: add a hat"));
        assert_eq!(call.reference_ids(), vec![source_id.as_str()]);
        let original = fx.images.data_url("default", &source_id)?;
        assert_ne!(Some(call.references[0].data_url.clone()), original);
        Ok(())
    }

    #[tokio::test]
    async fn standalone_mask_edit_sends_source_to_conversational_models() -> anyhow::Result<()> {
        let fx = fixture()?;
        let source = fx.images.save("default", &render_solid_png(4, 4, "src", "m")?, "image/png")?;
        fx.studio
            .mask_edit(MaskEditRequest {
                request_id: new_request_id(),
                session_id: None,
                model_id: Some(CHAT_MODEL.to_string()),
                image_id: source.image_id.clone(),
                mask_b64: left_half_mask()?,
                prompt: "add a hat".to_string(),
                region_description: Some("the upper half".to_string()),
                params: GenerationParams::default(),
            })
            .await?;
        let call = fx.backend.calls().pop().ok_or_else(|| anyhow::anyhow!("no call"))?;
        assert!(call
            .prompt
            .starts_with("Edit only the upper half of the image. In that region: add a hat."));
        assert_eq!(
            Some(call.references[0].data_url.clone()),
            fx.images.data_url("default", &source.image_id)?
        );

        let bad = fx
            .studio
            .mask_edit(MaskEditRequest {
                request_id: new_request_id(),
                session_id: None,
                model_id: None,
                image_id: source.image_id,
                mask_b64: "%%%".to_string(),
                prompt: "add a hat".to_string(),
                region_description: None,
                params: GenerationParams::default(),
            })
            .await;
        assert!(matches!(bad, Err(EngineError::InvalidRequest(_))));
        Ok(())
    }

    #[tokio::test]
    async fn compose_labels_sources_and_checks_count() -> anyhow::Result<()> {
        let fx = fixture()?;
        let cat_path = fx.dir.path().join("cat.png");
        let hat_path = fx.dir.path().join("hat.png");
        fs::write(&cat_path, render_solid_png(4, 4, "cat", "m")?)?;
        fs::write(&hat_path, render_solid_png(4, 4, "hat", "m")?)?;
        let cat = fx.studio.import_image(&cat_path)?;
        let hat = fx.studio.import_image(&hat_path)?;

        let mut request = ComposeRequest {
            request_id: new_request_id(),
            prompt: "the cat wears the hat".to_string(),
            model_id: CHAT_MODEL.to_string(),
            sources: vec![ComposeSource {
                image_id: cat.image_id.clone(),
                label: Some("cat".to_string()),
            }],
            params: GenerationParams::default(),
        };
        assert!(matches!(
            fx.studio.compose(request.clone()).await,
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(fx.backend.calls().is_empty());

        request.sources.push(ComposeSource {
            image_id: hat.image_id.clone(),
            label: Some("hat".to_string()),
        });
        fx.studio.compose(request).await?;
        let call = fx.backend.calls().pop().ok_or_else(|| anyhow::anyhow!("no call"))?;
        assert_eq!(
            call.reference_ids(),
            vec![cat.image_id.as_str(), hat.image_id.as_str()]
        );
        assert!(call.prompt.contains("Image labeled 'cat', Image labeled 'hat'"));
        assert!(call.prompt.ends_with("the cat wears the hat"));
        Ok(())
    }

    #[tokio::test]
    async fn generate_rejects_unknown_models_and_missing_references() -> anyhow::Result<()> {
        let fx = fixture()?;
        let unknown = fx
            .studio
            .generate(GenerationRequest::new("a castle", "nope/model"))
            .await;
        assert!(matches!(unknown, Err(EngineError::NotFound(_))));

        let mut request = GenerationRequest::new("a castle", IMAGE_MODEL);
        request.params.reference_image_id = Some("missing".to_string());
        assert!(matches!(
            fx.studio.generate(request).await,
            Err(EngineError::NotFound(_))
        ));

        let too_many = GenerationRequest::new("a castle", IMAGE_MODEL).with_variations(2);
        assert!(matches!(
            fx.studio.generate(too_many).await,
            Err(EngineError::InvalidRequest(_))
        ));
        assert!(fx.backend.calls().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn sessions_survive_a_restart_on_disk() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let backend = Arc::new(ScriptedBackend::default());
        let config = StudioConfig::with_data_dir(dir.path());

        let first = Studio::new(config.clone(), backend.clone());
        let session = first.create_session(None, SessionSeed::default())?;
        first
            .send_turn(turn(&session.session_id, "t1", "a harbour"))
            .await?;
        let saved = first.get_session(&session.session_id)?;

        let second = Studio::new(config, backend);
        assert_eq!(second.get_session(&session.session_id)?, saved);
        let listed = second.list_sessions()?;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].turn_count, 2);
        assert!(listed[0].last_image_url.is_some());

        second.delete_session(&session.session_id)?;
        assert!(second.list_sessions()?.is_empty());
        Ok(())
    }
}
