use callsight::{
    audit::AuditConsumer,
    bus,
    config::AppConfig,
    db,
    gateway::{self, GatewayState},
    hints::{
        default_playbook, Embedder, HintRouter, HttpEmbedder, InMemoryVectorIndex,
        SemanticMatcher, VectorIndex,
    },
    persistence::{AudioSpool, PersistenceWorker, SpoolConfig},
    postcall::{crm, summarizer, PostCallWorker},
    security::{PiiScrubber, TenantKeyManager},
    speech::{
        EnergyVad, HttpTranscriber, InMemoryTranscriptStore, RedisTranscriptStore, SpeechPipeline,
        TranscriptStore,
    },
    storage::FsObjectStore,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging first
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "callsight=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    info!("Starting CallSight v{}", env!("CARGO_PKG_VERSION"));

    // Startup-fatal configuration checks: unknown keys, bad KEK, unreachable
    // bus all refuse to start (exit code 1).
    let config = AppConfig::init()?;
    info!("Configuration loaded");

    if config.security.master_kek.is_empty() {
        error!("Master KEK not configured!");
        error!("Set security.master_kek in config/default.toml or CALLSIGHT_SECURITY__MASTER_KEK");
        return Err(anyhow::anyhow!("master KEK not configured"));
    }
    let _key_manager = TenantKeyManager::from_base64(&config.security.master_kek)
        .map_err(|e| anyhow::anyhow!("invalid master KEK: {e}"))?;
    info!("Tenant key manager initialized");

    let bus = bus::connect(&config.bus).await?;
    info!(mode = %config.bus.mode, "Message bus ready");

    let pool = db::connect(&config.database.url, config.database.max_connections).await?;
    info!(url = %config.database.url, "Database connected");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut services = Vec::new();

    // --- Gateway ---
    let gateway_state = GatewayState {
        bus: Arc::clone(&bus),
        cfg: config.gateway.clone(),
    };
    services.push(tokio::spawn(gateway::serve(
        gateway_state,
        shutdown_rx.clone(),
    )));

    // --- Speech pipeline ---
    let scrubber = Arc::new(PiiScrubber::new(&config.security));
    let semantic = if config.hints.semantic_enabled {
        let embedder: Arc<dyn Embedder> = Arc::new(HttpEmbedder::new(
            config.hints.embedder_url.clone(),
            Duration::from_secs(5),
        ));
        let index: Arc<dyn VectorIndex> = Arc::new(InMemoryVectorIndex::new());
        seed_semantic_index(&embedder, &index).await;
        Some(SemanticMatcher::new(
            embedder,
            index,
            config.hints.embedding_cache,
            config.hints.semantic_threshold,
        ))
    } else {
        None
    };
    let router = Arc::new(HintRouter::new(
        default_playbook(),
        semantic,
        Duration::from_secs(config.hints.cooldown_secs),
    ));
    let transcripts: Arc<dyn TranscriptStore> = if config.redis.url.is_empty() {
        warn!("No Redis URL configured, using in-memory transcript store");
        Arc::new(InMemoryTranscriptStore::new())
    } else {
        Arc::new(RedisTranscriptStore::connect(&config.redis.url).await?)
    };
    let pipeline = SpeechPipeline::new(
        Arc::clone(&bus),
        Arc::new(HttpTranscriber::new(
            config.stt.clone(),
            config.speech.sample_rate,
        )),
        router,
        transcripts,
        scrubber,
        Arc::new(EnergyVad::from_confidence(config.speech.vad_threshold)),
        config.speech.clone(),
    );
    services.push(tokio::spawn(pipeline.run(shutdown_rx.clone())));

    // --- Persistence worker ---
    let store = Arc::new(FsObjectStore::new(&config.object_store));
    let spool = AudioSpool::new(
        SpoolConfig {
            dir: PathBuf::from(&config.persistence.spool_dir),
            sample_rate: config.speech.sample_rate,
            upload_timeout: Duration::from_secs(config.persistence.upload_timeout_secs),
            max_upload_retries: config.persistence.max_upload_retries,
            backoff_base: Duration::from_secs(1),
        },
        store,
    )
    .await?;
    let persistence = PersistenceWorker::new(
        Arc::clone(&bus),
        pool.clone(),
        spool,
        config.persistence.clone(),
    );
    services.push(tokio::spawn(persistence.run(shutdown_rx.clone())));

    // --- Post-call worker ---
    let postcall = PostCallWorker::new(
        Arc::clone(&bus),
        pool.clone(),
        summarizer::build(&config.postcall)?,
        crm::build(&config.postcall)?,
        config.postcall.clone(),
    );
    services.push(tokio::spawn(postcall.run(shutdown_rx.clone())));

    // --- Audit consumer ---
    let audit = AuditConsumer::new(Arc::clone(&bus), &config.security.audit_log).await?;
    services.push(tokio::spawn(audit.run(shutdown_rx.clone())));

    info!("All services running");
    wait_for_signal().await;

    // Graceful shutdown: stop accepting work, drain queues and spools,
    // then give the workers a bounded window to finish.
    info!("Shutdown signal received, draining");
    let _ = shutdown_tx.send(true);
    let drain = futures::future::join_all(services);
    match tokio::time::timeout(Duration::from_secs(30), drain).await {
        Ok(results) => {
            for result in results {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(error = %e, "Service exited with error"),
                    Err(e) => error!(error = %e, "Service task panicked"),
                }
            }
        }
        Err(_) => warn!("Drain window elapsed, exiting anyway"),
    }

    let _ = bus.close().await;
    info!("Shutdown complete");
    Ok(())
}

/// Embed the playbook's example phrases and load them into the vector index.
/// A failed seeding degrades the semantic path to no matches; the keyword
/// fast path is unaffected.
async fn seed_semantic_index(embedder: &Arc<dyn Embedder>, index: &Arc<dyn VectorIndex>) {
    let mut points = Vec::new();
    for rule in default_playbook() {
        match embedder.embed(&rule.phrases).await {
            Ok(vector) => points.push((vector, rule.trigger.clone())),
            Err(e) => {
                warn!(title = %rule.trigger.title, error = %e, "Playbook embedding failed");
            }
        }
    }
    let count = points.len();
    if let Err(e) = index.upsert(points).await {
        warn!(error = %e, "Vector index seeding failed");
    } else {
        info!(rules = count, "Seeded semantic hint index");
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            error!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
