//! End-to-end tests over a real WebSocket connection.
//!
//! These wire the gateway, speech pipeline, persistence worker, post-call
//! worker, and audit consumer onto one in-process bus, then drive them from
//! a real client socket. Unit tests passing != the system works; this is
//! where the seams are exercised together.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use callsight::audit::{self, AuditConsumer, AuditEvent, GENESIS_HASH};
use callsight::bus::{InProcessBus, MessageBus};
use callsight::config::{GatewayConfig, PersistenceConfig, PostCallConfig, SpeechConfig};
use callsight::db::{self, CallRepo, CallStatus, DbPool, SegmentRepo};
use callsight::error::AppResult;
use callsight::events::{subjects, ControlMessage};
use callsight::gateway::{create_router, GatewayState};
use callsight::hints::{default_playbook, HintRouter};
use callsight::persistence::{AudioSpool, PersistenceWorker, SpoolConfig};
use callsight::postcall::{MockCrm, MockSummarizer, PostCallWorker};
use callsight::security::PiiScrubber;
use callsight::speech::{
    EnergyVad, InMemoryTranscriptStore, SpeechPipeline, Transcriber, TranscriptStore,
};

/// STT double that replays a fixed script, one entry per snapshot.
struct ScriptedStt {
    script: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedStt {
    fn new(script: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().rev().map(String::from).collect()),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait::async_trait]
impl Transcriber for ScriptedStt {
    async fn transcribe(&self, _samples: &[f32], _initial_prompt: &str) -> AppResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.script.lock().unwrap().pop().unwrap_or_default())
    }
}

struct TestCluster {
    bus: Arc<InProcessBus>,
    pool: DbPool,
    crm: Arc<MockCrm>,
    gateway_addr: std::net::SocketAddr,
    audit_path: std::path::PathBuf,
    shutdown_tx: watch::Sender<bool>,
    _dir: tempfile::TempDir,
}

/// Boot every service on one in-process bus with mocked externals.
async fn start_cluster(stt_script: Vec<&str>) -> TestCluster {
    let dir = tempfile::tempdir().unwrap();
    let bus = Arc::new(InProcessBus::new());
    let pool = db::setup_test_db().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Gateway on an ephemeral port
    let gateway_state = GatewayState {
        bus: Arc::clone(&bus) as Arc<dyn MessageBus>,
        cfg: GatewayConfig::default(),
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let gateway_addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, create_router(gateway_state)).await;
    });

    // Speech pipeline with scripted STT
    let cfg = SpeechConfig::default();
    let pipeline = SpeechPipeline::new(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        ScriptedStt::new(stt_script),
        Arc::new(HintRouter::new(
            default_playbook(),
            None,
            Duration::from_secs(10),
        )),
        Arc::new(InMemoryTranscriptStore::new()) as Arc<dyn TranscriptStore>,
        Arc::new(PiiScrubber::default()),
        Arc::new(EnergyVad::from_confidence(cfg.vad_threshold)),
        cfg,
    );
    tokio::spawn(pipeline.run(shutdown_rx.clone()));

    // Persistence worker with filesystem object store and dev fixtures
    let store = Arc::new(callsight::storage::FsObjectStore::with_base(
        dir.path(),
        "bucket",
    ));
    let spool = AudioSpool::new(
        SpoolConfig {
            dir: dir.path().join("spool"),
            sample_rate: 16000,
            upload_timeout: Duration::from_secs(5),
            max_upload_retries: 1,
            backoff_base: Duration::from_millis(10),
        },
        store,
    )
    .await
    .unwrap();
    let persistence = PersistenceWorker::new(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        pool.clone(),
        spool,
        PersistenceConfig {
            flush_interval_secs: 1,
            seed_fixtures: true,
            ..PersistenceConfig::default()
        },
    );
    tokio::spawn(persistence.run(shutdown_rx.clone()));

    // Post-call worker with mock summariser and CRM
    let crm = Arc::new(MockCrm::new());
    let postcall = PostCallWorker::new(
        Arc::clone(&bus) as Arc<dyn MessageBus>,
        pool.clone(),
        Arc::new(MockSummarizer),
        Arc::clone(&crm) as Arc<dyn callsight::postcall::CrmConnector>,
        PostCallConfig::default(),
    );
    tokio::spawn(postcall.run(shutdown_rx.clone()));

    // Audit consumer
    let audit_path = dir.path().join("audit_trail.jsonl");
    let consumer = AuditConsumer::new(Arc::clone(&bus) as Arc<dyn MessageBus>, &audit_path)
        .await
        .unwrap();
    tokio::spawn(consumer.run(shutdown_rx.clone()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    TestCluster {
        bus,
        pool,
        crm,
        gateway_addr,
        audit_path,
        shutdown_tx,
        _dir: dir,
    }
}

fn handshake_json() -> String {
    serde_json::json!({
        "type": "handshake",
        "token": "t",
        "client_version": "1.0.0",
        "audio_config": {
            "sample_rate": 16000,
            "channels": 1,
            "encoding": "pcm_s16le",
            "chunk_size": 4096
        }
    })
    .to_string()
}

/// One second of tone at 16kHz, loud enough to pass VAD.
fn speech_frame() -> Vec<u8> {
    (0..16000)
        .flat_map(|i| {
            let value = ((i as f32 * 0.05).sin() * 9000.0) as i16;
            value.to_le_bytes()
        })
        .collect()
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect_and_handshake(addr: std::net::SocketAddr) -> WsStream {
    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/stream"))
        .await
        .expect("gateway connect");
    ws.send(Message::Text(handshake_json())).await.unwrap();

    let ack = recv_json(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(ack["type"], "handshake_ack");
    assert_eq!(ack["session_id"], "session_1.0.0");
    ws
}

async fn recv_json(ws: &mut WsStream, timeout: Duration) -> Option<serde_json::Value> {
    loop {
        let frame = tokio::time::timeout(timeout, ws.next()).await.ok()??;
        match frame.ok()? {
            Message::Text(text) => return serde_json::from_str(&text).ok(),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
}

#[tokio::test]
async fn test_handshake_round_trip() {
    let cluster = start_cluster(vec![]).await;
    let mut ws = connect_and_handshake(cluster.gateway_addr).await;
    ws.close(None).await.ok();
    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_handshake_timeout_or_bad_token_closes() {
    let cluster = start_cluster(vec![]).await;

    // Empty token is a policy violation
    let (mut ws, _) = connect_async(format!("ws://{}/ws/stream", cluster.gateway_addr))
        .await
        .unwrap();
    let bad = serde_json::json!({
        "type": "handshake",
        "token": "",
        "client_version": "1.0.0",
        "audio_config": {}
    });
    ws.send(Message::Text(bad.to_string())).await.unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("server should answer")
        .expect("stream open")
        .expect("frame");
    assert!(matches!(frame, Message::Close(_)));

    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_pricing_trigger_with_cooldown_fires_once() {
    // Two snapshots transcribe to pricing objections within the cooldown
    let cluster = start_cluster(vec![
        "the price is too high for our budget",
        "yes the price is really too high",
    ])
    .await;
    let mut ws = connect_and_handshake(cluster.gateway_addr).await;

    ws.send(Message::Binary(speech_frame())).await.unwrap();
    ws.send(Message::Binary(speech_frame())).await.unwrap();

    let first = recv_json(&mut ws, Duration::from_secs(3)).await.unwrap();
    assert_eq!(first["type"], "overlay_trigger");
    assert_eq!(first["content"]["title"], "Pricing Objection");

    // No second overlay inside the cooldown window; the only other frames
    // expected are data_persisted confirmations.
    let mut extra_overlays = 0;
    while let Some(frame) = recv_json(&mut ws, Duration::from_millis(1500)).await {
        if frame["type"] == "overlay_trigger" {
            extra_overlays += 1;
        }
    }
    assert_eq!(extra_overlays, 0, "cooldown must suppress the second trigger");

    ws.close(None).await.ok();
    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_full_call_lifecycle_reaches_processed() {
    let cluster = start_cluster(vec!["the price is too high for our budget"]).await;
    let mut ws = connect_and_handshake(cluster.gateway_addr).await;

    // Stream audio until the hint comes back
    ws.send(Message::Binary(speech_frame())).await.unwrap();
    let overlay = recv_json(&mut ws, Duration::from_secs(3)).await.unwrap();
    assert_eq!(overlay["type"], "overlay_trigger");

    // Wait for the optimistic persistence confirmation so segments are
    // durable before the call ends.
    let mut persisted = false;
    for _ in 0..5 {
        if let Some(frame) = recv_json(&mut ws, Duration::from_secs(2)).await {
            if frame["type"] == "data_persisted" {
                persisted = true;
                break;
            }
        }
    }
    assert!(persisted, "expected a data_persisted confirmation");

    // Explicit end control frame
    ws.send(Message::Text(
        serde_json::json!({"type": "end", "reason": "user_end"}).to_string(),
    ))
    .await
    .unwrap();

    // Post-call drives the fixture-seeded call to processed while the
    // archiver records the object key; wait for both.
    let mut call = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if let Some(found) = CallRepo::get_by_session_id(&cluster.pool, "session_1.0.0")
            .await
            .unwrap()
        {
            if found.status() == CallStatus::Processed && found.audio_object_key.is_some() {
                call = Some(found);
                break;
            }
        }
    }
    let call = call.expect("call should reach processed");
    assert!([0.0, 0.5, 1.0].contains(&call.sentiment_score.unwrap()));
    assert!(call
        .audio_object_key
        .as_deref()
        .unwrap()
        .starts_with("recordings/session_1.0.0."));

    // Exactly one CRM activity, segments durable and ordered
    assert_eq!(cluster.crm.activities().len(), 1);
    let segments = SegmentRepo::list_by_call(&cluster.pool, &call.id).await.unwrap();
    assert!(!segments.is_empty());
    assert!(segments.windows(2).all(|w| w[0].start_offset <= w[1].start_offset));

    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_audit_chain_builds_from_genesis() {
    let cluster = start_cluster(vec![]).await;
    let bus = Arc::clone(&cluster.bus) as Arc<dyn MessageBus>;

    for i in 0..3 {
        audit::emit(&bus, AuditEvent::new(format!("user-{i}"), "LOGIN")).await;
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    let content = std::fs::read_to_string(&cluster.audit_path).unwrap();
    let records: Vec<AuditEvent> = content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();

    // The gateway never connected in this test, so only our three records
    assert_eq!(records.len(), 3);
    assert_eq!(records[0].prev_hash.as_deref(), Some(GENESIS_HASH));
    assert_eq!(records[1].prev_hash, records[0].hash);
    assert_eq!(records[2].prev_hash, records[1].hash);

    let tip = audit::verify_chain(&cluster.audit_path).await.unwrap();
    assert_eq!(Some(tip), records[2].hash);

    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_disconnect_publishes_call_ended() {
    let cluster = start_cluster(vec![]).await;
    let mut ended_sub = cluster
        .bus
        .subscribe(subjects::CALL_ENDED, None, 16)
        .await
        .unwrap();

    let mut ws = connect_and_handshake(cluster.gateway_addr).await;
    ws.close(None).await.unwrap();
    drop(ws);

    let msg = tokio::time::timeout(Duration::from_secs(2), ended_sub.recv())
        .await
        .expect("call.ended should be published")
        .unwrap();
    let payload: serde_json::Value = serde_json::from_slice(&msg.payload).unwrap();
    assert_eq!(payload["session_id"], "session_1.0.0");
    assert_eq!(payload["reason"], "client_disconnect");

    cluster.shutdown_tx.send(true).unwrap();
}

#[tokio::test]
async fn test_ui_commands_forwarded_verbatim() {
    let cluster = start_cluster(vec![]).await;
    let mut ws = connect_and_handshake(cluster.gateway_addr).await;

    // Anything published on the session's UI subject reaches the client
    let control = ControlMessage::DataPersisted {
        id: "seg-1".to_string(),
    };
    cluster
        .bus
        .publish(
            &subjects::ui_commands("session_1.0.0"),
            Bytes::from(serde_json::to_vec(&control).unwrap()),
        )
        .await
        .unwrap();

    let frame = recv_json(&mut ws, Duration::from_secs(2)).await.unwrap();
    assert_eq!(frame["type"], "data_persisted");
    assert_eq!(frame["id"], "seg-1");

    ws.close(None).await.ok();
    cluster.shutdown_tx.send(true).unwrap();
}
