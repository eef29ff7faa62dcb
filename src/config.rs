use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::sync::OnceLock;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Message bus configuration.
///
/// `memory` runs every service over an in-process bus (single binary, tests);
/// `nats` connects the services to an external NATS cluster.
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct BusConfig {
    #[serde(default = "default_bus_mode")]
    pub mode: String,
    #[serde(default = "default_bus_url")]
    pub url: String,
}

fn default_bus_mode() -> String {
    "memory".to_string()
}

fn default_bus_url() -> String {
    "nats://localhost:4222".to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            mode: default_bus_mode(),
            url: default_bus_url(),
        }
    }
}

/// Database configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_url")]
    pub url: String,
    #[serde(default = "default_db_connections")]
    pub max_connections: u32,
}

fn default_db_url() -> String {
    "sqlite::memory:".to_string()
}

fn default_db_connections() -> u32 {
    5
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_db_url(),
            max_connections: default_db_connections(),
        }
    }
}

/// Gateway (client ingress) configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_host")]
    pub host: String,
    #[serde(default = "default_gateway_port")]
    pub port: u16,
    /// Seconds the client has to send its handshake frame
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Outbound UI-command buffer per connection; overflow drops oldest
    #[serde(default = "default_ui_buffer")]
    pub ui_buffer: usize,
}

fn default_gateway_host() -> String {
    "0.0.0.0".to_string()
}

fn default_gateway_port() -> u16 {
    8000
}

fn default_handshake_timeout() -> u64 {
    5
}

fn default_ui_buffer() -> usize {
    64
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_gateway_host(),
            port: default_gateway_port(),
            handshake_timeout_secs: default_handshake_timeout(),
            ui_buffer: default_ui_buffer(),
        }
    }
}

/// Speech pipeline configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SpeechConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Seconds of buffered speech before a transcription is scheduled
    #[serde(default = "default_min_audio_secs")]
    pub min_audio_secs: f32,
    /// Ring-buffer capacity in seconds
    #[serde(default = "default_max_audio_secs")]
    pub max_audio_secs: f32,
    /// VAD energy threshold (0.0-1.0)
    #[serde(default = "default_vad_threshold")]
    pub vad_threshold: f32,
    /// Trailing silence that ends an utterance (ms)
    #[serde(default = "default_silence_flush_ms")]
    pub silence_flush_ms: u64,
    /// Sessions with no frames for this long are evicted (seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Parallel STT slots shared across sessions
    #[serde(default = "default_stt_workers")]
    pub stt_workers: usize,
    /// Pending snapshots kept per session before the oldest is dropped
    #[serde(default = "default_snapshot_queue")]
    pub snapshot_queue: usize,
    /// Characters of prior transcript used as STT priming context
    #[serde(default = "default_prompt_suffix_chars")]
    pub prompt_suffix_chars: usize,
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_min_audio_secs() -> f32 {
    1.0
}

fn default_max_audio_secs() -> f32 {
    30.0
}

fn default_vad_threshold() -> f32 {
    0.5
}

fn default_silence_flush_ms() -> u64 {
    700
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_stt_workers() -> usize {
    4
}

fn default_snapshot_queue() -> usize {
    4
}

fn default_prompt_suffix_chars() -> usize {
    200
}

impl Default for SpeechConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            min_audio_secs: default_min_audio_secs(),
            max_audio_secs: default_max_audio_secs(),
            vad_threshold: default_vad_threshold(),
            silence_flush_ms: default_silence_flush_ms(),
            idle_timeout_secs: default_idle_timeout(),
            stt_workers: default_stt_workers(),
            snapshot_queue: default_snapshot_queue(),
            prompt_suffix_chars: default_prompt_suffix_chars(),
        }
    }
}

/// STT inference service configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SttConfig {
    #[serde(default = "default_stt_url")]
    pub url: String,
    #[serde(default = "default_stt_timeout")]
    pub timeout_secs: u64,
    /// tiny, base, small, medium, large-v3
    #[serde(default = "default_stt_model")]
    pub model_size: String,
    #[serde(default = "default_stt_device")]
    pub device: String,
    #[serde(default = "default_stt_compute")]
    pub compute_type: String,
}

fn default_stt_url() -> String {
    "http://localhost:8001/transcribe".to_string()
}

fn default_stt_timeout() -> u64 {
    8
}

fn default_stt_model() -> String {
    "base".to_string()
}

fn default_stt_device() -> String {
    "cpu".to_string()
}

fn default_stt_compute() -> String {
    "int8".to_string()
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            timeout_secs: default_stt_timeout(),
            model_size: default_stt_model(),
            device: default_stt_device(),
            compute_type: default_stt_compute(),
        }
    }
}

/// Hint routing configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct HintsConfig {
    /// Minimum interval between two deliveries of the same hint title
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Enable the semantic (embedding) slow path
    #[serde(default)]
    pub semantic_enabled: bool,
    /// Maximum cosine distance for a semantic match
    #[serde(default = "default_semantic_threshold")]
    pub semantic_threshold: f32,
    #[serde(default = "default_embedder_url")]
    pub embedder_url: String,
    #[serde(default = "default_embedding_cache")]
    pub embedding_cache: usize,
}

fn default_cooldown_secs() -> u64 {
    10
}

fn default_semantic_threshold() -> f32 {
    0.35
}

fn default_embedder_url() -> String {
    "http://localhost:8002/embed".to_string()
}

fn default_embedding_cache() -> usize {
    1000
}

impl Default for HintsConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_cooldown_secs(),
            semantic_enabled: false,
            semantic_threshold: default_semantic_threshold(),
            embedder_url: default_embedder_url(),
            embedding_cache: default_embedding_cache(),
        }
    }
}

/// Persistence worker configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PersistenceConfig {
    #[serde(default = "default_spool_dir")]
    pub spool_dir: String,
    /// Spools with no frames for this long are finalised (seconds)
    #[serde(default = "default_finalization_idle")]
    pub finalization_idle_secs: u64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_flush_retries")]
    pub max_flush_retries: u32,
    #[serde(default = "default_upload_timeout")]
    pub upload_timeout_secs: u64,
    #[serde(default = "default_max_upload_retries")]
    pub max_upload_retries: u32,
    /// Create synthetic org/user/call rows for unknown sessions (dev only)
    #[serde(default)]
    pub seed_fixtures: bool,
}

fn default_spool_dir() -> String {
    "/tmp/callsight_audio".to_string()
}

fn default_finalization_idle() -> u64 {
    60
}

fn default_flush_interval() -> u64 {
    5
}

fn default_batch_size() -> usize {
    50
}

fn default_max_flush_retries() -> u32 {
    3
}

fn default_upload_timeout() -> u64 {
    30
}

fn default_max_upload_retries() -> u32 {
    5
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            spool_dir: default_spool_dir(),
            finalization_idle_secs: default_finalization_idle(),
            flush_interval_secs: default_flush_interval(),
            batch_size: default_batch_size(),
            max_flush_retries: default_max_flush_retries(),
            upload_timeout_secs: default_upload_timeout(),
            max_upload_retries: default_max_upload_retries(),
            seed_fixtures: false,
        }
    }
}

/// Object store configuration (filesystem-backed unless an endpoint is set)
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ObjectStoreConfig {
    #[serde(default = "default_store_root")]
    pub root: String,
    #[serde(default = "default_bucket")]
    pub bucket: String,
}

fn default_store_root() -> String {
    "/tmp/callsight_store".to_string()
}

fn default_bucket() -> String {
    "callsight-audio".to_string()
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
            bucket: default_bucket(),
        }
    }
}

/// Redis (running-transcript cache) configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Empty means the in-memory transcript store is used instead
    #[serde(default)]
    pub url: String,
}

/// Post-call worker configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct PostCallConfig {
    /// "mock" or "http"
    #[serde(default = "default_summarizer_mode")]
    pub summarizer: String,
    #[serde(default = "default_summarizer_url")]
    pub summarizer_url: String,
    #[serde(default = "default_summarizer_timeout")]
    pub summarizer_timeout_secs: u64,
    /// "mock" is the only built-in provider; vendor adapters plug in here
    #[serde(default = "default_crm_provider")]
    pub crm_provider: String,
    #[serde(default = "default_crm_timeout")]
    pub crm_timeout_secs: u64,
}

fn default_summarizer_mode() -> String {
    "mock".to_string()
}

fn default_summarizer_url() -> String {
    "http://localhost:8003/summarize".to_string()
}

fn default_summarizer_timeout() -> u64 {
    30
}

fn default_crm_provider() -> String {
    "mock".to_string()
}

fn default_crm_timeout() -> u64 {
    15
}

impl Default for PostCallConfig {
    fn default() -> Self {
        Self {
            summarizer: default_summarizer_mode(),
            summarizer_url: default_summarizer_url(),
            summarizer_timeout_secs: default_summarizer_timeout(),
            crm_provider: default_crm_provider(),
            crm_timeout_secs: default_crm_timeout(),
        }
    }
}

/// Security configuration: master KEK and PII scrubbing toggles
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct SecurityConfig {
    /// Base64-encoded 256-bit key-encryption key. Required at startup.
    #[serde(default)]
    pub master_kek: String,
    #[serde(default = "default_true")]
    pub scrub_email: bool,
    #[serde(default = "default_true")]
    pub scrub_ssn: bool,
    #[serde(default = "default_true")]
    pub scrub_phone: bool,
    #[serde(default = "default_true")]
    pub scrub_credit_cards: bool,
    /// `{type}` is replaced by the pattern name, e.g. `[REDACTED_EMAIL]`
    #[serde(default = "default_redaction_mask")]
    pub redaction_mask: String,
    #[serde(default = "default_audit_log")]
    pub audit_log: String,
}

fn default_true() -> bool {
    true
}

fn default_redaction_mask() -> String {
    "[REDACTED_{type}]".to_string()
}

fn default_audit_log() -> String {
    "audit_trail.jsonl".to_string()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            master_kek: String::new(),
            scrub_email: true,
            scrub_ssn: true,
            scrub_phone: true,
            scrub_credit_cards: true,
            redaction_mask: default_redaction_mask(),
            audit_log: default_audit_log(),
        }
    }
}

/// Root application configuration
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub speech: SpeechConfig,
    #[serde(default)]
    pub stt: SttConfig,
    #[serde(default)]
    pub hints: HintsConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub postcall: PostCallConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl AppConfig {
    /// Load configuration from files and environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default config file
            .add_source(File::with_name("config/default").required(false))
            // Override with local config if present
            .add_source(File::with_name("config/local").required(false))
            // Override with environment variables (prefix: CALLSIGHT_)
            // e.g., CALLSIGHT_BUS__URL, CALLSIGHT_SECURITY__MASTER_KEK
            .add_source(
                Environment::with_prefix("CALLSIGHT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Initialize the global config singleton
    pub fn init() -> Result<&'static Self, ConfigError> {
        let config = Self::load()?;
        Ok(CONFIG.get_or_init(|| config))
    }

    /// Get reference to the global config
    pub fn get() -> &'static Self {
        CONFIG
            .get()
            .expect("Config not initialized. Call AppConfig::init() first.")
    }
}

impl SpeechConfig {
    /// Ring-buffer capacity in samples
    pub fn capacity_samples(&self) -> usize {
        (self.max_audio_secs * self.sample_rate as f32) as usize
    }

    /// Minimum occupancy in samples before a transcription is scheduled
    pub fn min_samples(&self) -> usize {
        (self.min_audio_secs * self.sample_rate as f32) as usize
    }
}
