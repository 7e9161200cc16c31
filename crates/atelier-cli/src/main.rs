use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use atelier_contracts::chat::{parse_intent, Intent, CHAT_HELP_COMMANDS};
use atelier_contracts::errors::{BackendError, EngineError};
use atelier_contracts::generation::{
    new_request_id, ComposeRequest, ComposeSource, GenerationParams, GenerationRequest,
    MaskEditRequest, TurnRequest, VariationOutcome,
};
use atelier_contracts::models::DEFAULT_MODEL_ID;
use atelier_contracts::sessions::Session;
use atelier_engine::backend::{DryrunBackend, ModelBackend};
use atelier_engine::config::StudioConfig;
use atelier_engine::openrouter::OpenRouterBackend;
use atelier_engine::prompt::is_known_style;
use atelier_engine::{SessionSeed, Studio, TurnOutcome};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "atelier", version, about = "Conversational image studio")]
struct Cli {
    /// Overrides ATELIER_DATA_DIR.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    /// Use the offline backend even when an API key is configured.
    #[arg(long, global = true)]
    dryrun: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Chat(ChatArgs),
    Generate(GenerateArgs),
    Sessions,
}

#[derive(Debug, Parser)]
struct ChatArgs {
    #[arg(long)]
    model: Option<String>,
    /// Resume an existing session instead of starting a new one.
    #[arg(long)]
    session: Option<String>,
}

#[derive(Debug, Parser)]
struct GenerateArgs {
    prompt: String,
    #[arg(long, default_value = DEFAULT_MODEL_ID)]
    model: String,
    #[arg(long, default_value_t = 1)]
    variations: usize,
    #[arg(long)]
    multi_model: bool,
    /// Explicit per-variation models for a multi-model batch.
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,
    #[arg(long)]
    aspect: Option<String>,
    #[arg(long)]
    resolution: Option<String>,
    #[arg(long)]
    style: Option<String>,
    #[arg(long)]
    negative: Option<String>,
    /// Reference image: a file path or a stored image id.
    #[arg(long)]
    reference: Option<String>,
    #[arg(long)]
    weight: Option<u8>,
}

#[tokio::main]
async fn main() {
    init_tracing();
    match run().await {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("atelier error: {err:#}");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ATELIER_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run() -> Result<i32> {
    let cli = Cli::parse();
    let studio = build_studio(cli.data_dir.clone(), cli.dryrun)?;
    match cli.command {
        Command::Chat(args) => {
            run_chat(&studio, args).await?;
            Ok(0)
        }
        Command::Generate(args) => run_generate(&studio, args).await,
        Command::Sessions => {
            print_sessions(&studio)?;
            Ok(0)
        }
    }
}

fn build_studio(data_dir: Option<PathBuf>, dryrun: bool) -> Result<Studio> {
    let mut config = StudioConfig::from_env();
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }
    fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed creating {}", config.data_dir.display()))?;

    let backend: Arc<dyn ModelBackend> = match config.openrouter_api_key.as_deref() {
        Some(key) if !dryrun => Arc::new(OpenRouterBackend::new(
            key,
            config.openrouter_api_base.as_deref(),
            config.request_timeout(),
        )?),
        _ => {
            if !dryrun {
                eprintln!("OPENROUTER_API_KEY not set; using the offline dryrun backend.");
            }
            Arc::new(DryrunBackend::default())
        }
    };
    debug!(data_dir = %config.data_dir.display(), backend = backend.name(), "studio ready");
    Ok(Studio::new(config, backend))
}

/// Runs `work` to completion; ctrl-c cancels `request_id` and keeps waiting
/// so the engine can roll back cleanly.
async fn with_interrupt<T>(studio: &Studio, request_id: &str, work: impl Future<Output = T>) -> T {
    tokio::pin!(work);
    tokio::select! {
        result = &mut work => return result,
        _ = tokio::signal::ctrl_c() => {
            if studio.cancel(request_id) {
                eprintln!("Cancelling…");
            }
        }
    }
    work.await
}

struct ChatState {
    session_id: String,
    model_id: String,
    params: GenerationParams,
}

impl ChatState {
    fn for_session(session: &Session) -> Self {
        Self {
            session_id: session.session_id.clone(),
            model_id: session.model_id.clone(),
            params: GenerationParams::default(),
        }
    }
}

async fn run_chat(studio: &Studio, args: ChatArgs) -> Result<()> {
    let session = match args.session.as_deref() {
        Some(session_id) => studio.get_session(session_id)?,
        None => studio.create_session(args.model.as_deref(), SessionSeed::default())?,
    };
    let mut state = ChatState::for_session(&session);
    if let Some(model) = args.model {
        state.model_id = model;
    }
    println!(
        "Atelier chat ({} backend). Session {} on {}. Type /help for commands.",
        studio.backend_name(),
        state.session_id,
        state.model_id
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let intent = parse_intent(&line);
        if intent.action == "noop" {
            continue;
        }
        if let Err(err) = handle_intent(studio, &mut state, &intent).await {
            println!("Error: {err:#}");
        }
    }
    Ok(())
}

async fn handle_intent(studio: &Studio, state: &mut ChatState, intent: &Intent) -> Result<()> {
    match intent.action.as_str() {
        "help" => println!("Commands: {}", CHAT_HELP_COMMANDS.join(" ")),
        "set_model" => match setting_str(intent, "model") {
            Some(model) => {
                if !studio.models().iter().any(|spec| spec.id == model) {
                    bail!("unknown model {model}; see /models");
                }
                state.model_id = model;
                println!("Model set to {} (applies from the next turn)", state.model_id);
            }
            None => println!("Model: {}", state.model_id),
        },
        "list_models" => {
            for model in studio.models() {
                let marker = if model.id == state.model_id { "*" } else { " " };
                println!(
                    "{marker} {:<40} {:<15} {}",
                    model.id,
                    model.category.as_str(),
                    model.name
                );
            }
        }
        "recommend_model" => {
            let recommended = studio.recommend_model(&state.params, false)?;
            println!("Recommended: {} ({})", recommended.model.id, recommended.reason);
        }
        "set_style" => {
            let style = setting_str(intent, "style_preset");
            if let Some(style) = style.as_deref() {
                if !is_known_style(style) {
                    bail!("unknown style preset {style}");
                }
            }
            state.params.style_preset = style;
            println!("Style: {}", state.params.style_preset.as_deref().unwrap_or("none"));
        }
        "set_aspect" => {
            state.params.aspect_ratio = setting_str(intent, "aspect_ratio");
            println!("Aspect ratio: {}", state.params.aspect_ratio.as_deref().unwrap_or("model default"));
        }
        "set_resolution" => {
            state.params.resolution = setting_str(intent, "resolution");
            println!("Resolution: {}", state.params.resolution.as_deref().unwrap_or("model default"));
        }
        "set_negative" => {
            state.params.negative_prompt = setting_str(intent, "negative_prompt");
            println!("Negative prompt: {}", state.params.negative_prompt.as_deref().unwrap_or("none"));
        }
        "set_weight" => {
            state.params.image_weight = intent
                .settings_update
                .get("image_weight")
                .and_then(Value::as_u64)
                .and_then(|weight| u8::try_from(weight).ok());
            println!("Image weight: {:?}", state.params.image_weight);
        }
        "set_reference" => {
            let arg = intent.arg_str("arg").unwrap_or_default();
            let image_id = resolve_image(studio, arg)?;
            println!("Next turn will reference image {image_id}");
            state.params.reference_image_id = Some(image_id);
        }
        "undo" => {
            let session = studio.undo_turn(&state.session_id)?;
            println!("Undone. {} turns on this branch.", active_turns(&session));
        }
        "revert" => {
            let index = intent.arg_i64("index").unwrap_or(-1);
            let session = studio.revert_to_turn(&state.session_id, index)?;
            println!("Reverted. {} turns on this branch.", active_turns(&session));
        }
        "branch" => {
            let index = intent.arg_i64("index").unwrap_or(0);
            let session = studio.branch_from_turn(&state.session_id, index, intent.arg_str("name"))?;
            let branch = session.active_branch()?;
            println!("Now on branch {} ({})", branch.name, branch.branch_id);
        }
        "list_branches" => {
            let session = studio.get_session(&state.session_id)?;
            for branch in session.branches.values() {
                let marker = if branch.branch_id == session.active_branch_id { "*" } else { " " };
                println!(
                    "{marker} {:<12} {} turns  {}",
                    branch.name,
                    branch.turns.len(),
                    branch.branch_id
                );
            }
        }
        "switch_branch" => {
            let target = intent.arg_str("arg").unwrap_or_default();
            let session = studio.get_session(&state.session_id)?;
            let branch_id = session
                .branches
                .values()
                .find(|branch| branch.branch_id == target || branch.name.eq_ignore_ascii_case(target))
                .map(|branch| branch.branch_id.clone())
                .unwrap_or_else(|| target.to_string());
            let session = studio.switch_branch(&state.session_id, &branch_id)?;
            println!("Switched to {}", session.active_branch()?.name);
        }
        "lock" => {
            let session = studio.toggle_subject_lock(&state.session_id, true, intent.arg_str("arg"))?;
            println!(
                "Subject locked to {}",
                session.subject_lock_image_id.as_deref().unwrap_or_default()
            );
        }
        "unlock" => {
            studio.toggle_subject_lock(&state.session_id, false, None)?;
            println!("Subject unlocked");
        }
        "usage" => {
            let usage = studio.get_token_usage(&state.session_id)?;
            println!(
                "~{} of {} tokens ({:.1}%){}",
                usage.estimated_tokens,
                usage.context_limit,
                usage.usage_ratio * 100.0,
                if usage.near_limit { " - near the context limit" } else { "" }
            );
        }
        "list_sessions" => print_sessions(studio)?,
        "open_session" => {
            let session = studio.get_session(intent.arg_str("arg").unwrap_or_default())?;
            *state = ChatState::for_session(&session);
            println!("Opened session {} ({} turns)", state.session_id, active_turns(&session));
        }
        "new_session" => {
            let session = studio.create_session(Some(&state.model_id), SessionSeed::default())?;
            *state = ChatState::for_session(&session);
            println!("New session {}", state.session_id);
        }
        "batch" => {
            let prompt = intent.prompt.clone().unwrap_or_default();
            let variations = intent.arg_i64("variations").unwrap_or(1).max(0) as usize;
            let mut request = GenerationRequest::new(prompt, state.model_id.clone()).with_variations(variations);
            request.multi_model = intent
                .command_args
                .get("multi_model")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            request.params = state.params.clone();
            let request_id = request.request_id.clone();
            let result = with_interrupt(studio, &request_id, studio.generate_batch(request)).await?;
            for report in &result.variations {
                match &report.outcome {
                    VariationOutcome::Completed { result } => println!(
                        "[{}] {} {}",
                        report.index,
                        report.model_id,
                        result.image_url.as_deref().unwrap_or_default()
                    ),
                    VariationOutcome::Failed { error } => {
                        println!("[{}] {} failed: {error}", report.index, report.model_id)
                    }
                }
            }
            println!(
                "{}/{} variations completed{}",
                result.total_completed,
                result.total_requested,
                if result.cancelled { " (cancelled)" } else { "" }
            );
        }
        "compose" => {
            let mut sources = Vec::new();
            for arg in intent.arg_list("paths") {
                sources.push(ComposeSource {
                    image_id: resolve_image(studio, &arg)?,
                    label: Path::new(&arg)
                        .file_stem()
                        .and_then(|stem| stem.to_str())
                        .map(str::to_string),
                });
            }
            let request = ComposeRequest {
                request_id: new_request_id(),
                prompt: intent.prompt.clone().unwrap_or_default(),
                model_id: state.model_id.clone(),
                sources,
                params: state.params.clone(),
            };
            let request_id = request.request_id.clone();
            let result = with_interrupt(studio, &request_id, studio.compose(request)).await?;
            println!("Composed: {}", result.image_url.as_deref().unwrap_or_default());
        }
        "mask_edit" => {
            let image_id = resolve_image(studio, intent.arg_str("image").unwrap_or_default())?;
            let mask_path = intent.arg_str("mask").unwrap_or_default();
            let mask = fs::read(mask_path).with_context(|| format!("failed reading mask {mask_path}"))?;
            let request = MaskEditRequest {
                request_id: new_request_id(),
                session_id: Some(state.session_id.clone()),
                model_id: Some(state.model_id.clone()),
                image_id,
                mask_b64: BASE64.encode(mask),
                prompt: intent.prompt.clone().unwrap_or_default(),
                region_description: None,
                params: state.params.clone(),
            };
            let request_id = request.request_id.clone();
            let result = with_interrupt(studio, &request_id, studio.mask_edit(request)).await?;
            println!("Edited: {}", result.image_url.as_deref().unwrap_or_default());
        }
        "send_turn" => {
            let mut request = TurnRequest::new(
                state.session_id.clone(),
                intent.prompt.clone().unwrap_or_default(),
            );
            request.model_id = Some(state.model_id.clone());
            request.params = state.params.clone();
            let request_id = request.request_id.clone();
            let outcome = with_interrupt(studio, &request_id, studio.send_turn(request)).await;
            state.params.reference_image_id = None;
            if let Err(EngineError::Backend(BackendError::Unavailable { .. })) = &outcome {
                if let Some(fallback) = studio.fallback_model(&state.model_id) {
                    println!("{} Try /model {}", fallback.reason, fallback.model.id);
                }
            }
            print_turn(&outcome?);
        }
        "invalid" => println!(
            "{}",
            intent.arg_str("error").unwrap_or("invalid command")
        ),
        "unknown" => println!(
            "Unknown command /{}. Type /help for commands.",
            intent.arg_str("command").unwrap_or_default()
        ),
        other => println!("Unhandled action {other}"),
    }
    Ok(())
}

fn print_turn(outcome: &TurnOutcome) {
    let turn = &outcome.assistant_turn;
    if let Some(url) = turn.image_url.as_deref() {
        println!("Image: {url}");
    }
    if let Some(text) = turn.text_response.as_deref().filter(|text| !text.is_empty()) {
        println!("{text}");
    }
    if outcome.attempts > 1 {
        println!("(took {} attempts)", outcome.attempts);
    }
    if outcome.token_usage.near_limit {
        println!(
            "Context is {:.0}% full; consider /branch or /new.",
            outcome.token_usage.usage_ratio * 100.0
        );
    }
}

fn print_sessions(studio: &Studio) -> Result<()> {
    let sessions = studio.list_sessions()?;
    if sessions.is_empty() {
        println!("No sessions yet.");
    }
    for summary in sessions {
        println!(
            "{}  {}  {:<36}  {} turns on {}{}",
            summary.session_id,
            summary.updated_at.format("%Y-%m-%d %H:%M"),
            summary.model_id,
            summary.turn_count,
            summary.active_branch_name,
            if summary.subject_locked { "  [locked]" } else { "" }
        );
    }
    Ok(())
}

async fn run_generate(studio: &Studio, args: GenerateArgs) -> Result<i32> {
    let reference_image_id = match args.reference.as_deref() {
        Some(reference) => Some(resolve_image(studio, reference)?),
        None => None,
    };
    let mut request = GenerationRequest::new(args.prompt, args.model).with_variations(args.variations);
    request.multi_model = args.multi_model;
    request.model_ids = args.models;
    request.params = GenerationParams {
        aspect_ratio: args.aspect,
        resolution: args.resolution,
        style_preset: args.style,
        negative_prompt: args.negative,
        image_weight: args.weight,
        reference_image_id,
        ..GenerationParams::default()
    };
    let request_id = request.request_id.clone();

    let output = if request.variations == 1 && !request.multi_model {
        let result = with_interrupt(studio, &request_id, studio.generate(request)).await?;
        serde_json::to_string_pretty(&result)?
    } else {
        let result = with_interrupt(studio, &request_id, studio.generate_batch(request)).await?;
        serde_json::to_string_pretty(&result)?
    };
    println!("{output}");
    Ok(0)
}

/// A readable file is imported into the image store; anything else is
/// taken to be an existing image id.
fn resolve_image(studio: &Studio, arg: &str) -> Result<String> {
    let arg = arg.trim();
    if arg.is_empty() {
        bail!("an image path or id is required");
    }
    let path = Path::new(arg);
    if path.is_file() {
        let stored = studio.import_image(path)?;
        return Ok(stored.image_id);
    }
    Ok(arg.to_string())
}

fn setting_str(intent: &Intent, key: &str) -> Option<String> {
    intent
        .settings_update
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn active_turns(session: &Session) -> usize {
    session
        .active_branch()
        .map(|branch| branch.turns.len())
        .unwrap_or(0)
}
