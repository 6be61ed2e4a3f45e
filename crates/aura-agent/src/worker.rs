//! Job dispatch.
//!
//! The worker receives [`JobRequest`]s, builds a [`JobContext`] for each, and
//! runs the registered entrypoint on its own task. When a job ends its room
//! is closed and dropped from the registry; a failing job is logged and
//! other jobs are unaffected.

use crate::error::AgentError;
use crate::job::{JobContext, JobRequest};
use aura_voice::{
    LiveKitConfig, LiveKitSignaling, LiveKitTransport, MediaTransport, RoomHandle, RoomSignaling,
    TokenService,
};
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// The function run once per job.
pub type Entrypoint = Arc<dyn Fn(JobContext) -> BoxFuture<'static, Result<(), AgentError>> + Send + Sync>;

pub struct WorkerOptions {
    pub entrypoint: Entrypoint,
    pub livekit: LiveKitConfig,
    /// Overrides the LiveKit room service, mainly for tests.
    pub signaling: Option<Arc<dyn RoomSignaling>>,
    /// Overrides the LiveKit media connection, mainly for tests.
    pub transport: Option<Arc<dyn MediaTransport>>,
}

impl WorkerOptions {
    pub fn new<F, Fut>(livekit: LiveKitConfig, entrypoint: F) -> Self
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), AgentError>> + Send + 'static,
    {
        Self {
            entrypoint: Arc::new(move |ctx| entrypoint(ctx).boxed()),
            livekit,
            signaling: None,
            transport: None,
        }
    }

    pub fn with_signaling(mut self, signaling: Arc<dyn RoomSignaling>) -> Self {
        self.signaling = Some(signaling);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn MediaTransport>) -> Self {
        self.transport = Some(transport);
        self
    }
}

/// Rooms of the jobs currently running, by job ID.
type RoomRegistry = Arc<Mutex<HashMap<String, Arc<RoomHandle>>>>;

/// How one job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job_id: String,
    pub room_name: String,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

pub struct Worker {
    entrypoint: Entrypoint,
    tokens: Arc<TokenService>,
    signaling: Arc<dyn RoomSignaling>,
    transport: Arc<dyn MediaTransport>,
    rooms: RoomRegistry,
}

impl Worker {
    pub fn new(options: WorkerOptions) -> Self {
        let signaling = options
            .signaling
            .unwrap_or_else(|| Arc::new(LiveKitSignaling::new(&options.livekit)));
        let transport = options
            .transport
            .unwrap_or_else(|| Arc::new(LiveKitTransport::new()));
        Self {
            entrypoint: options.entrypoint,
            tokens: Arc::new(TokenService::new(options.livekit)),
            signaling,
            transport,
            rooms: Arc::default(),
        }
    }

    /// Builds the context handed to the entrypoint for `request`.
    pub fn job_context(&self, request: &JobRequest) -> JobContext {
        let room = Arc::new(RoomHandle::new(
            request.room_name.clone(),
            Arc::clone(&self.tokens),
            Arc::clone(&self.signaling),
            Arc::clone(&self.transport),
        ));
        if let Ok(mut rooms) = self.rooms.lock() {
            rooms.insert(request.job_id.clone(), Arc::clone(&room));
        }
        JobContext::new(request.job_id.clone(), room)
    }

    /// Number of jobs whose rooms are still registered.
    pub fn active_jobs(&self) -> usize {
        self.rooms.lock().map(|rooms| rooms.len()).unwrap_or(0)
    }

    /// Runs jobs until `jobs` closes and every entrypoint has returned, or
    /// until `shutdown` resolves. Every room is disconnected on return.
    pub async fn run<S>(&self, mut jobs: mpsc::Receiver<JobRequest>, shutdown: S) -> Vec<JobOutcome>
    where
        S: Future<Output = ()>,
    {
        let mut running = JoinSet::new();
        let mut outcomes = Vec::new();
        let mut accepting = true;
        tokio::pin!(shutdown);

        loop {
            if !accepting && running.is_empty() {
                break;
            }

            tokio::select! {
                request = jobs.recv(), if accepting => match request {
                    Some(request) => self.dispatch(&mut running, request),
                    None => accepting = false,
                },
                Some(joined) = running.join_next(), if !running.is_empty() => match joined {
                    Ok(outcome) => outcomes.push(outcome),
                    Err(e) => error!(error = %e, "job task panicked"),
                },
                () = &mut shutdown => {
                    info!(jobs = running.len(), "worker shutting down");
                    break;
                }
            }
        }

        self.disconnect_all();
        running.abort_all();
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "job task panicked"),
            }
        }

        outcomes
    }

    fn dispatch(&self, running: &mut JoinSet<JobOutcome>, request: JobRequest) {
        info!(job_id = %request.job_id, room = %request.room_name, "received job");
        let ctx = self.job_context(&request);
        let entrypoint = Arc::clone(&self.entrypoint);
        let rooms = Arc::clone(&self.rooms);

        running.spawn(async move {
            let result = entrypoint(ctx.clone()).await;
            let error = match result {
                Ok(()) => {
                    info!(job_id = %request.job_id, "job entrypoint finished");
                    None
                }
                Err(e) => {
                    error!(job_id = %request.job_id, room = %request.room_name, error = %e, "job failed");
                    Some(e.to_string())
                }
            };
            ctx.shutdown();
            release_room(&rooms, &request.job_id);
            JobOutcome {
                job_id: request.job_id,
                room_name: request.room_name,
                error,
            }
        });
    }

    fn disconnect_all(&self) {
        match self.rooms.lock() {
            Ok(mut rooms) => {
                for (_, room) in rooms.drain() {
                    room.disconnect();
                }
            }
            Err(_) => warn!("room registry poisoned; rooms left open"),
        }
    }
}

fn release_room(rooms: &RoomRegistry, job_id: &str) {
    match rooms.lock() {
        Ok(mut rooms) => {
            rooms.remove(job_id);
        }
        Err(_) => warn!(job_id, "room registry poisoned; room not released"),
    }
}
