//! The Aura AI job: configure, start, connect, greet.

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::job::JobContext;
use crate::llm::OpenAiLlm;
use crate::session::{Agent, AgentSession, RoomInputOptions};
use crate::stt::DeepgramStt;
use crate::tts::CartesiaTts;
use crate::turn::{load_turn_detector, MultilingualTurnDetector, TurnBackend};
use crate::vad::{load_vad, SileroModel, VadBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Builds the session from configured providers. Any provider or model
/// that fails to initialize fails the whole job.
pub async fn build_session(config: &AgentConfig) -> Result<AgentSession, AgentError> {
    config.vad.validate()?;
    config.turn_detection.validate()?;

    let stt = DeepgramStt::new(config.stt.clone())?;
    let llm = OpenAiLlm::new(config.llm.clone())?;
    let tts = CartesiaTts::new(config.tts.clone())?;
    let vad = load_vad(&config.vad).await?;
    let turn_detection = load_turn_detector(&config.turn_detection).await?;
    info!(
        vad = ?config.vad.backend,
        turn_detection = ?config.turn_detection.backend,
        "session components ready"
    );

    AgentSession::builder()
        .stt(stt)
        .llm(llm)
        .tts(tts)
        .vad(vad)
        .turn_detection(turn_detection)
        .turn_threshold(config.turn_detection.threshold)
        .max_endpointing_delay(config.turn_detection.max_endpointing_delay())
        .build()
}

/// Runs the bootstrap sequence and returns the live session.
pub async fn run_job(ctx: &JobContext, config: &AgentConfig) -> Result<AgentSession, AgentError> {
    let session = build_session(config).await?;

    session
        .start(
            ctx.room(),
            Agent::new(config.session.instructions.clone()),
            RoomInputOptions {
                noise_cancellation: config.session.noise_cancellation,
            },
        )
        .await?;

    ctx.connect().await?;

    let greeting = session
        .generate_reply(Some(&config.session.greeting))
        .await?;
    info!(job_id = %ctx.job_id(), greeting = %greeting, "greeted room");

    Ok(session)
}

/// Worker entrypoint. Returns once the room closes and the session has
/// stopped answering.
pub async fn entrypoint(ctx: JobContext, config: Arc<AgentConfig>) -> Result<(), AgentError> {
    let session = run_job(&ctx, &config).await?;
    session.wait_closed().await;
    info!(job_id = %ctx.job_id(), "session ended");
    Ok(())
}

/// Downloads the model files the configured backends need, so the first job
/// does not wait on them.
pub async fn download_files(config: &AgentConfig) -> Result<Vec<PathBuf>, AgentError> {
    let mut files = Vec::new();
    if config.vad.backend == VadBackend::Silero {
        files.push(SileroModel::fetch(&config.vad).await?);
    }
    if config.turn_detection.backend == TurnBackend::Model {
        let (model, tokenizer) = MultilingualTurnDetector::fetch(&config.turn_detection).await?;
        files.push(model);
        files.push(tokenizer);
    }
    Ok(files)
}
