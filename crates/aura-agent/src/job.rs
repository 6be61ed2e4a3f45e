use crate::error::AgentError;
use aura_voice::RoomHandle;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// A request to attach the agent to a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub job_id: String,
    pub room_name: String,
}

impl JobRequest {
    /// Creates a request with a fresh job ID.
    pub fn new(room_name: impl Into<String>) -> Self {
        Self {
            job_id: format!("AJ_{}", Uuid::new_v4().simple()),
            room_name: room_name.into(),
        }
    }
}

/// What an entrypoint receives for one job.
///
/// The room handle starts disconnected; the entrypoint decides when to call
/// [`JobContext::connect`].
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: String,
    room: Arc<RoomHandle>,
}

impl JobContext {
    pub fn new(job_id: impl Into<String>, room: Arc<RoomHandle>) -> Self {
        Self {
            job_id: job_id.into(),
            room,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn room(&self) -> Arc<RoomHandle> {
        Arc::clone(&self.room)
    }

    /// Connects the worker to the job's room.
    pub async fn connect(&self) -> Result<(), AgentError> {
        info!(job_id = %self.job_id, room = %self.room.name(), "connecting job to room");
        self.room.connect().await?;
        Ok(())
    }

    /// Leaves the room. Sessions attached to it stop listening.
    pub fn shutdown(&self) {
        self.room.disconnect();
    }
}
