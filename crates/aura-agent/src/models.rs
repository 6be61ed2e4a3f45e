//! Local ONNX models: locating, downloading, and opening them.

use crate::error::AgentError;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};
use ort::session::Session;
use std::fmt;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

pub(crate) fn model_error(context: &str, e: impl fmt::Display) -> AgentError {
    AgentError::Model(format!("{}: {}", context, e))
}

/// Resolves a model file, downloading it into `cache_dir` on first use.
///
/// An explicitly configured path must exist; it is never downloaded over.
pub async fn ensure_file(
    configured: Option<&Path>,
    cache_dir: &Path,
    file_name: &str,
    url: &str,
) -> Result<PathBuf, AgentError> {
    if let Some(path) = configured {
        if fs::try_exists(path).await.unwrap_or(false) {
            debug!(path = %path.display(), "using configured model file");
            return Ok(path.to_path_buf());
        }
        return Err(AgentError::Model(format!(
            "configured model file {} does not exist",
            path.display()
        )));
    }

    let path = cache_dir.join(file_name);
    if fs::try_exists(&path).await.unwrap_or(false) {
        debug!(path = %path.display(), "using cached model file");
        return Ok(path);
    }

    fs::create_dir_all(cache_dir)
        .await
        .map_err(|e| model_error("failed to create model cache", e))?;

    info!(url, path = %path.display(), "downloading model file");
    let response = reqwest::get(url)
        .await
        .map_err(|e| model_error("model download failed", e))?;
    if !response.status().is_success() {
        return Err(AgentError::Model(format!(
            "model download failed: HTTP {} from {}",
            response.status(),
            url
        )));
    }
    let bytes = response
        .bytes()
        .await
        .map_err(|e| model_error("model download failed", e))?;

    // Write next to the target and rename so a partial file is never cached.
    let partial = cache_dir.join(format!("{}.part", file_name));
    fs::write(&partial, &bytes)
        .await
        .map_err(|e| model_error("failed to write model file", e))?;
    fs::rename(&partial, &path)
        .await
        .map_err(|e| model_error("failed to write model file", e))?;

    info!(path = %path.display(), bytes = bytes.len(), "model file cached");
    Ok(path)
}

/// Opens an inference session on a blocking thread.
pub async fn load_session(path: PathBuf, num_threads: Option<usize>) -> Result<Session, AgentError> {
    tokio::task::spawn_blocking(move || {
        let mut builder = SessionBuilder::new()
            .map_err(|e| model_error("failed to create session builder", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| model_error("failed to set optimization level", e))?;
        if let Some(threads) = num_threads {
            builder = builder
                .with_intra_threads(threads)
                .map_err(|e| model_error("failed to set intra threads", e))?
                .with_inter_threads(1)
                .map_err(|e| model_error("failed to set inter threads", e))?;
        }
        let session = builder
            .commit_from_file(&path)
            .map_err(|e| model_error(&format!("failed to load {}", path.display()), e))?;

        for input in &session.inputs {
            debug!(model = %path.display(), input = %input.name, "model input");
        }
        Ok(session)
    })
    .await
    .map_err(|e| model_error("model loading task failed", e))?
}
