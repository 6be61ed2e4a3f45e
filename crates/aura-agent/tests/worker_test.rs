mod common;

use aura_agent::{
    download_files, entrypoint, run_job, AgentConfig, AgentError, JobContext, JobRequest,
    TurnBackend, VadBackend, Worker, WorkerOptions,
};
use aura_types::ChatRole;
use aura_voice::{ConnectionState, RoomHandle};
use common::{livekit, room_with, FakeTransport, RecordingSignaling};
use serde_json::json;
use std::future::pending;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Points every provider at one mock server.
async fn providers() -> (MockServer, AgentConfig) {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [
                { "index": 0, "message": { "role": "assistant", "content": "Hi, I'm Aura. How can I help?" } }
            ]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/tts/bytes"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 960]))
        .mount(&server)
        .await;

    let mut config = AgentConfig {
        livekit: livekit(),
        ..AgentConfig::default()
    };
    config.stt.api_key = "dg-test".into();
    config.stt.base_url = server.uri();
    config.llm.api_key = "sk-test".into();
    config.llm.base_url = server.uri();
    config.tts.api_key = "ct-test".into();
    config.tts.base_url = server.uri();
    // Keep jobs off the network-fetched models.
    config.vad.backend = VadBackend::Energy;
    config.turn_detection.backend = TurnBackend::Heuristic;

    (server, config)
}

fn room(signaling: Arc<RecordingSignaling>, name: &str) -> Arc<RoomHandle> {
    room_with(name, signaling, Arc::new(FakeTransport::default()))
}

/// Disconnects `room` once the greeting has been published, as if the
/// caller hung up.
fn hang_up_after_greeting(room: Arc<RoomHandle>) {
    tokio::spawn(async move {
        while room.published_samples() < 480 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        room.disconnect();
    });
}

#[tokio::test]
async fn job_connects_and_greets() {
    let (_server, config) = providers().await;
    let signaling = Arc::new(RecordingSignaling::default());
    let transport = FakeTransport::default();
    let ctx = JobContext::new(
        "AJ_test",
        room_with("aura-ai-room", signaling.clone(), Arc::new(transport.clone())),
    );

    let session = run_job(&ctx, &config).await.unwrap();

    assert!(ctx.room().is_connected());
    assert!(ctx.room().token().is_some());
    assert_eq!(*signaling.rooms.lock().unwrap(), vec!["aura-ai-room"]);
    assert_eq!(ctx.room().published_samples(), 480);
    assert_eq!(transport.published(), vec![480]);

    let history = session.history().await;
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, ChatRole::System);
    assert!(history[0].content.starts_with("You are Aura AI"));
    assert_eq!(history[1].role, ChatRole::Assistant);
    assert_eq!(history[1].content, "Hi, I'm Aura. How can I help?");

    ctx.shutdown();
    tokio::time::timeout(Duration::from_secs(2), session.wait_closed())
        .await
        .expect("session closes with its room");
    assert_eq!(transport.closed(), 1);
}

#[tokio::test]
async fn entrypoint_keeps_the_session_until_the_room_closes() {
    let (_server, config) = providers().await;
    let room = room(Arc::new(RecordingSignaling::default()), "aura-ai-room");
    let ctx = JobContext::new("AJ_live", Arc::clone(&room));

    let job = tokio::spawn(entrypoint(ctx, Arc::new(config)));
    while room.published_samples() < 480 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!job.is_finished(), "entrypoint returned while the room was live");
    assert!(room.is_connected());

    room.disconnect();
    let result = tokio::time::timeout(Duration::from_secs(2), job)
        .await
        .expect("entrypoint returns after the room closes")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn job_without_provider_keys_fails_before_connecting() {
    let signaling = Arc::new(RecordingSignaling::default());
    let ctx = JobContext::new("AJ_test", room(Arc::clone(&signaling), "aura-ai-room"));
    let config = AgentConfig {
        livekit: livekit(),
        ..AgentConfig::default()
    };

    let result = run_job(&ctx, &config).await;
    assert!(matches!(result, Err(AgentError::Config(_))));
    assert!(!ctx.room().is_connected());
    assert!(signaling.rooms.lock().unwrap().is_empty());
}

#[tokio::test]
async fn worker_runs_jobs_until_channel_closes() {
    let (_server, config) = providers().await;
    let config = Arc::new(config);
    let signaling = Arc::new(RecordingSignaling::default());
    let seen: Arc<Mutex<Vec<Arc<RoomHandle>>>> = Arc::default();

    let worker = {
        let seen = Arc::clone(&seen);
        Worker::new(
            WorkerOptions::new(livekit(), move |ctx: JobContext| {
                seen.lock().unwrap().push(ctx.room());
                hang_up_after_greeting(ctx.room());
                entrypoint(ctx, Arc::clone(&config))
            })
            .with_signaling(signaling.clone())
            .with_transport(Arc::new(FakeTransport::default())),
        )
    };

    let (jobs_tx, jobs_rx) = mpsc::channel(4);
    jobs_tx.send(JobRequest::new("room-a")).await.unwrap();
    jobs_tx.send(JobRequest::new("room-b")).await.unwrap();
    drop(jobs_tx);

    let outcomes = tokio::time::timeout(Duration::from_secs(10), worker.run(jobs_rx, pending()))
        .await
        .expect("worker returns once every job finished");

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.succeeded()));
    assert!(outcomes.iter().all(|o| o.job_id.starts_with("AJ_")));

    let rooms = seen.lock().unwrap().clone();
    assert_eq!(rooms.len(), 2);
    for room in rooms {
        assert_eq!(room.published_samples(), 480);
        assert_eq!(room.state(), ConnectionState::Closed);
    }

    let mut created = signaling.rooms.lock().unwrap().clone();
    created.sort();
    assert_eq!(created, vec!["room-a", "room-b"]);
}

#[tokio::test]
async fn failing_job_does_not_affect_others() {
    let signaling = Arc::new(RecordingSignaling::default());
    let seen: Arc<Mutex<Vec<Arc<RoomHandle>>>> = Arc::default();

    let worker = {
        let seen = Arc::clone(&seen);
        Worker::new(
            WorkerOptions::new(livekit(), move |ctx: JobContext| {
                seen.lock().unwrap().push(ctx.room());
                async move {
                    ctx.connect().await?;
                    if ctx.room().name() == "broken-room" {
                        return Err(AgentError::Session("provider unavailable".into()));
                    }
                    Ok::<(), AgentError>(())
                }
            })
            .with_signaling(signaling)
            .with_transport(Arc::new(FakeTransport::default())),
        )
    };

    let (jobs_tx, jobs_rx) = mpsc::channel(4);
    jobs_tx.send(JobRequest::new("broken-room")).await.unwrap();
    jobs_tx.send(JobRequest::new("healthy-room")).await.unwrap();
    drop(jobs_tx);

    let outcomes = worker.run(jobs_rx, pending()).await;
    assert_eq!(outcomes.len(), 2);

    let broken = outcomes
        .iter()
        .find(|o| o.room_name == "broken-room")
        .unwrap();
    assert!(broken
        .error
        .as_deref()
        .is_some_and(|e| e.contains("provider unavailable")));

    let healthy = outcomes
        .iter()
        .find(|o| o.room_name == "healthy-room")
        .unwrap();
    assert!(healthy.succeeded());

    let rooms = seen.lock().unwrap().clone();
    assert!(rooms.iter().all(|r| r.state() == ConnectionState::Closed));
}

#[tokio::test]
async fn shutdown_stops_long_running_jobs() {
    let worker = Worker::new(
        WorkerOptions::new(livekit(), |ctx: JobContext| async move {
            ctx.connect().await?;
            pending::<()>().await;
            Ok::<(), AgentError>(())
        })
        .with_signaling(Arc::new(RecordingSignaling::default()))
        .with_transport(Arc::new(FakeTransport::default())),
    );

    let (jobs_tx, jobs_rx) = mpsc::channel(4);
    jobs_tx.send(JobRequest::new("forever-room")).await.unwrap();

    let outcomes = tokio::time::timeout(
        Duration::from_secs(2),
        worker.run(jobs_rx, tokio::time::sleep(Duration::from_millis(100))),
    )
    .await
    .expect("shutdown ends the worker");

    // The aborted job never reports an outcome.
    assert!(outcomes.is_empty());
    drop(jobs_tx);
}

#[tokio::test]
async fn finished_jobs_release_their_rooms() {
    let seen: Arc<Mutex<Vec<Weak<RoomHandle>>>> = Arc::default();
    let worker = {
        let seen = Arc::clone(&seen);
        Worker::new(
            WorkerOptions::new(livekit(), move |ctx: JobContext| {
                seen.lock().unwrap().push(Arc::downgrade(&ctx.room()));
                async move {
                    ctx.connect().await?;
                    Ok::<(), AgentError>(())
                }
            })
            .with_signaling(Arc::new(RecordingSignaling::default()))
            .with_transport(Arc::new(FakeTransport::default())),
        )
    };

    let (jobs_tx, jobs_rx) = mpsc::channel(4);
    let (stop_tx, stop_rx) = oneshot::channel::<()>();

    // The job channel stays open: the worker is still serving.
    let check = async {
        jobs_tx.send(JobRequest::new("short-room")).await.unwrap();
        let mut released = false;
        for _ in 0..200 {
            let gone = seen
                .lock()
                .unwrap()
                .iter()
                .all(|room| room.upgrade().is_none());
            if !seen.lock().unwrap().is_empty() && gone && worker.active_jobs() == 0 {
                released = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let _ = stop_tx.send(());
        released
    };

    let (outcomes, released) = tokio::join!(
        worker.run(jobs_rx, async {
            let _ = stop_rx.await;
        }),
        check
    );

    assert!(released, "finished job's room is still held by the worker");
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].succeeded());
    drop(jobs_tx);
}

#[tokio::test]
async fn heuristic_backends_need_no_downloads() {
    let mut config = AgentConfig::default();
    config.vad.backend = VadBackend::Energy;
    config.turn_detection.backend = TurnBackend::Heuristic;

    let files = download_files(&config).await.unwrap();
    assert!(files.is_empty());
}

#[tokio::test]
async fn download_files_fetches_the_vad_model() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/silero_vad.onnx"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"onnx".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let mut config = AgentConfig::default();
    config.vad.model_url = format!("{}/silero_vad.onnx", server.uri());
    config.vad.cache_dir = dir.path().to_path_buf();
    config.turn_detection.backend = TurnBackend::Heuristic;

    let files = download_files(&config).await.unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(std::fs::read(&files[0]).unwrap(), b"onnx");
}
