//! Per-session audio spooling and archival.
//!
//! Raw PCM frames append to a linear spool file per session; file handles
//! are cached until finalisation. Finalising transcodes the spool to
//! Ogg/Opus via ffmpeg (falling back to raw PCM when the transcode fails)
//! and uploads it to the object store with bounded exponential backoff.

use crate::error::{AppError, AppResult};
use crate::storage::ObjectStore;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const OPUS_BITRATE: &str = "16k";
const MAX_BACKOFF: Duration = Duration::from_secs(60);

struct SpoolFile {
    file: tokio::fs::File,
    last_write: Instant,
}

pub struct SpoolConfig {
    pub dir: PathBuf,
    pub sample_rate: u32,
    pub upload_timeout: Duration,
    pub max_upload_retries: u32,
    pub backoff_base: Duration,
}

pub struct AudioSpool {
    cfg: SpoolConfig,
    store: Arc<dyn ObjectStore>,
    files: Mutex<HashMap<String, SpoolFile>>,
}

/// Outcome of a successful finalisation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedAudio {
    pub object_key: String,
    pub uri: String,
}

impl AudioSpool {
    pub async fn new(cfg: SpoolConfig, store: Arc<dyn ObjectStore>) -> AppResult<Self> {
        tokio::fs::create_dir_all(&cfg.dir).await?;
        Ok(Self {
            cfg,
            store,
            files: Mutex::new(HashMap::new()),
        })
    }

    fn raw_path(&self, session_id: &str) -> PathBuf {
        self.cfg.dir.join(format!("{session_id}.pcm"))
    }

    /// Append a frame to the session's spool, opening it on first write.
    pub async fn append(&self, session_id: &str, data: &[u8]) -> AppResult<()> {
        let mut files = self.files.lock().await;
        if !files.contains_key(session_id) {
            let file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.raw_path(session_id))
                .await?;
            debug!(session_id, "Opened audio spool");
            files.insert(
                session_id.to_string(),
                SpoolFile {
                    file,
                    last_write: Instant::now(),
                },
            );
        }
        let entry = files.get_mut(session_id).expect("inserted above");
        entry.file.write_all(data).await?;
        entry.last_write = Instant::now();
        Ok(())
    }

    /// Sessions whose spool has seen no frames for at least `idle`.
    pub async fn idle_sessions(&self, idle: Duration) -> Vec<String> {
        let files = self.files.lock().await;
        files
            .iter()
            .filter(|(_, entry)| entry.last_write.elapsed() >= idle)
            .map(|(session_id, _)| session_id.clone())
            .collect()
    }

    /// Sessions with an open spool handle.
    pub async fn open_sessions(&self) -> Vec<String> {
        self.files.lock().await.keys().cloned().collect()
    }

    /// Close, transcode, upload, clean up. Returns `None` when there is no
    /// spool for the session (already finalised, or audio never arrived).
    pub async fn finalize(&self, session_id: &str) -> AppResult<Option<ArchivedAudio>> {
        // Closing the handle is just dropping it.
        self.files.lock().await.remove(session_id);

        let raw_path = self.raw_path(session_id);
        if tokio::fs::metadata(&raw_path).await.is_err() {
            return Ok(None);
        }

        let ogg_path = self.cfg.dir.join(format!("{session_id}.ogg"));
        let transcoded = self.transcode(&raw_path, &ogg_path).await;

        let (upload_path, object_key, content_type) = if transcoded {
            (
                ogg_path.clone(),
                format!("recordings/{session_id}.ogg"),
                "audio/ogg",
            )
        } else {
            warn!(session_id, "Transcode failed, archiving raw PCM");
            (
                raw_path.clone(),
                format!("recordings/{session_id}.pcm"),
                "audio/pcm",
            )
        };

        let uri = self
            .upload_with_retry(&object_key, &upload_path, content_type)
            .await?;

        // Spool files only go away once the object is durable.
        let _ = tokio::fs::remove_file(&raw_path).await;
        let _ = tokio::fs::remove_file(&ogg_path).await;

        info!(session_id, object_key, "Archived call audio");
        Ok(Some(ArchivedAudio { object_key, uri }))
    }

    /// PCM s16le -> Ogg/Opus at a speech-tuned bitrate.
    async fn transcode(&self, raw: &PathBuf, ogg: &PathBuf) -> bool {
        let result = tokio::process::Command::new("ffmpeg")
            .arg("-y")
            .args(["-f", "s16le"])
            .args(["-ar", &self.cfg.sample_rate.to_string()])
            .args(["-ac", "1"])
            .arg("-i")
            .arg(raw)
            .args(["-c:a", "libopus"])
            .args(["-b:a", OPUS_BITRATE])
            .arg(ogg)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match result {
            Ok(status) if status.success() => tokio::fs::metadata(ogg).await.is_ok(),
            Ok(status) => {
                warn!(code = ?status.code(), "ffmpeg exited with failure");
                false
            }
            Err(e) => {
                warn!(error = %e, "ffmpeg not runnable");
                false
            }
        }
    }

    async fn upload_with_retry(
        &self,
        key: &str,
        path: &PathBuf,
        content_type: &str,
    ) -> AppResult<String> {
        let mut backoff = self.cfg.backoff_base;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let upload = tokio::time::timeout(
                self.cfg.upload_timeout,
                self.store.put_file(key, path, content_type),
            )
            .await;

            match upload {
                Ok(Ok(uri)) => return Ok(uri),
                Ok(Err(e)) if attempt <= self.cfg.max_upload_retries => {
                    warn!(key, attempt, error = %e, "Upload failed, backing off");
                }
                Err(_) if attempt <= self.cfg.max_upload_retries => {
                    warn!(key, attempt, "Upload timed out, backing off");
                }
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(AppError::Storage(format!(
                        "upload of {key} timed out after {attempt} attempts"
                    )))
                }
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}
