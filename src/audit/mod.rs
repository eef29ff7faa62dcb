//! Tamper-evident audit trail.
//!
//! Every event published on `audit.>` is chained into an append-only JSONL
//! file: each record's `prev_hash` is the previous record's `hash`, and
//! `hash` is the SHA-256 of the record's canonical JSON (sorted keys, no
//! whitespace) with the `hash` field removed. Genesis links to 64 zero
//! nibbles. Any mutation breaks recomputation from that point forward.

use crate::bus::MessageBus;
use crate::error::{AppError, AppResult};
use crate::events::subjects;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const GENESIS_HASH: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    /// User UUID or system service name
    pub actor_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    /// e.g. "LOGIN", "SESSION_START", "CRM_SYNC"
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    /// SUCCESS, FAILURE, DENIED
    pub status: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

impl AuditEvent {
    pub fn new(actor_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            actor_id: actor_id.into(),
            tenant_id: None,
            action: action.into(),
            resource_id: None,
            status: "SUCCESS".to_string(),
            metadata: serde_json::Value::Object(Default::default()),
            prev_hash: None,
            hash: None,
        }
    }

    pub fn with_resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }
}

/// Publish an audit event on `audit.{action}`. Failures are logged and
/// dropped: auditing must never take down the emitting service.
pub async fn emit(bus: &Arc<dyn MessageBus>, event: AuditEvent) {
    let subject = subjects::audit(&event.action);
    match serde_json::to_vec(&event) {
        Ok(payload) => {
            if let Err(e) = bus.publish(&subject, Bytes::from(payload)).await {
                warn!(subject, error = %e, "Audit publish failed");
            }
        }
        Err(e) => warn!(subject, error = %e, "Audit event serialization failed"),
    }
}

/// Canonical JSON of an event with the `hash` field removed: sorted keys at
/// every nesting level, no whitespace, so hashing is deterministic across
/// processes.
fn canonical_without_hash(event: &AuditEvent) -> AppResult<String> {
    let mut value = serde_json::to_value(event)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("hash");
    }
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Ok(out)
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
        serde_json::Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

fn compute_hash(event: &AuditEvent) -> AppResult<String> {
    let canonical = canonical_without_hash(event)?;
    Ok(hex::encode(Sha256::digest(canonical.as_bytes())))
}

/// Consumes `audit.>` and appends the hash chain to a JSONL file.
pub struct AuditConsumer {
    bus: Arc<dyn MessageBus>,
    log_path: PathBuf,
    last_hash: String,
}

impl std::fmt::Debug for AuditConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditConsumer")
            .field("log_path", &self.log_path)
            .field("last_hash", &self.last_hash)
            .finish()
    }
}

impl AuditConsumer {
    /// Recovers the chain tip from the final line of the existing log.
    /// A tip whose stored hash does not recompute is tampering and refuses
    /// to start.
    pub async fn new(bus: Arc<dyn MessageBus>, log_path: impl Into<PathBuf>) -> AppResult<Self> {
        let log_path = log_path.into();
        let last_hash = recover_last_hash(&log_path).await?;
        Ok(Self {
            bus,
            log_path,
            last_hash,
        })
    }

    pub fn last_hash(&self) -> &str {
        &self.last_hash
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        let mut sub = self
            .bus
            .subscribe(subjects::AUDIT_WILDCARD, None, 1024)
            .await?;
        info!(log = %self.log_path.display(), tip = %self.last_hash, "Audit consumer started");

        loop {
            tokio::select! {
                msg = sub.recv() => match msg {
                    Some(msg) => {
                        if let Err(e) = self.handle(&msg.payload).await {
                            match e {
                                AppError::Schema(_) => warn!(error = %e, "Dropping malformed audit event"),
                                // Chain integrity failures halt the worker.
                                other => {
                                    error!(error = %other, "Audit consumer halting");
                                    return Err(other);
                                }
                            }
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Audit consumer stopped");
        Ok(())
    }

    async fn handle(&mut self, payload: &[u8]) -> AppResult<()> {
        let mut event: AuditEvent = serde_json::from_slice(payload)
            .map_err(|e| AppError::schema(format!("audit event: {e}")))?;

        event.prev_hash = Some(self.last_hash.clone());
        let hash = compute_hash(&event)?;
        event.hash = Some(hash.clone());

        let mut line = String::new();
        write_canonical(&serde_json::to_value(&event)?, &mut line);
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;

        self.last_hash = hash;
        info!(action = %event.action, actor = %event.actor_id, "Audited");
        Ok(())
    }
}

async fn recover_last_hash(path: &Path) -> AppResult<String> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(GENESIS_HASH.to_string())
        }
        Err(e) => return Err(e.into()),
    };

    let Some(last_line) = content.lines().filter(|l| !l.trim().is_empty()).last() else {
        return Ok(GENESIS_HASH.to_string());
    };

    let event: AuditEvent = serde_json::from_str(last_line)
        .map_err(|_| AppError::Integrity("audit log tail is not a valid record".to_string()))?;
    let recomputed = compute_hash(&event)?;
    match &event.hash {
        Some(stored) if *stored == recomputed => Ok(recomputed),
        Some(_) => Err(AppError::Integrity(
            "audit log tail hash does not recompute; possible tampering".to_string(),
        )),
        None => Err(AppError::Integrity(
            "audit log tail record has no hash".to_string(),
        )),
    }
}

/// Offline chain verification: recompute every link from genesis.
///
/// Returns the tip hash. A mismatch at position k means tampering at or
/// before k.
pub async fn verify_chain(path: &Path) -> AppResult<String> {
    let content = tokio::fs::read_to_string(path).await?;
    let mut expected_prev = GENESIS_HASH.to_string();

    for (index, line) in content.lines().filter(|l| !l.trim().is_empty()).enumerate() {
        let event: AuditEvent = serde_json::from_str(line).map_err(|e| {
            AppError::Integrity(format!("record {index} is not valid JSON: {e}"))
        })?;

        if event.prev_hash.as_deref() != Some(expected_prev.as_str()) {
            return Err(AppError::Integrity(format!(
                "record {index}: prev_hash does not match prior record's hash"
            )));
        }
        let recomputed = compute_hash(&event)?;
        if event.hash.as_deref() != Some(recomputed.as_str()) {
            return Err(AppError::Integrity(format!(
                "record {index}: stored hash does not recompute"
            )));
        }
        expected_prev = recomputed;
    }
    Ok(expected_prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use std::time::Duration;

    async fn consume_events(events: Vec<AuditEvent>, path: &Path) {
        let bus = Arc::new(InProcessBus::new()) as Arc<dyn MessageBus>;
        let consumer = AuditConsumer::new(Arc::clone(&bus), path).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        for event in events {
            emit(&bus, event).await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();
    }

    fn read_records(path: &Path) -> Vec<AuditEvent> {
        std::fs::read_to_string(path)
            .unwrap()
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_chain_links_from_genesis() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_trail.jsonl");

        let events = (0..3)
            .map(|i| AuditEvent::new(format!("user-{i}"), "LOGIN"))
            .collect();
        consume_events(events, &path).await;

        let records = read_records(&path);
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].prev_hash.as_deref(), Some(GENESIS_HASH));
        assert_eq!(records[1].prev_hash, records[0].hash);
        assert_eq!(records[2].prev_hash, records[1].hash);
    }

    #[tokio::test]
    async fn test_verify_chain_accepts_untampered_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_trail.jsonl");

        consume_events(
            vec![
                AuditEvent::new("svc", "SESSION_START"),
                AuditEvent::new("svc", "SESSION_END").with_status("SUCCESS"),
            ],
            &path,
        )
        .await;

        let tip = verify_chain(&path).await.unwrap();
        let records = read_records(&path);
        assert_eq!(Some(tip), records.last().unwrap().hash.clone());
    }

    #[tokio::test]
    async fn test_verify_chain_detects_tampering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_trail.jsonl");

        consume_events(
            vec![
                AuditEvent::new("a", "LOGIN"),
                AuditEvent::new("b", "LOGIN"),
            ],
            &path,
        )
        .await;

        // Flip the actor of the first record without re-hashing
        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replacen("\"a\"", "\"mallory\"", 1);
        std::fs::write(&path, tampered).unwrap();

        let err = verify_chain(&path).await.unwrap_err();
        assert!(matches!(err, AppError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_consumer_resumes_from_existing_tip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_trail.jsonl");

        consume_events(vec![AuditEvent::new("a", "LOGIN")], &path).await;
        consume_events(vec![AuditEvent::new("b", "LOGIN")], &path).await;

        let records = read_records(&path);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].prev_hash, records[0].hash);
        verify_chain(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_recovery_rejects_tampered_tip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_trail.jsonl");

        consume_events(vec![AuditEvent::new("a", "LOGIN")], &path).await;

        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, content.replacen("\"a\"", "\"x\"", 1)).unwrap();

        let bus = Arc::new(InProcessBus::new()) as Arc<dyn MessageBus>;
        let err = AuditConsumer::new(bus, &path).await.unwrap_err();
        assert!(matches!(err, AppError::Integrity(_)));
    }

    #[tokio::test]
    async fn test_malformed_event_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit_trail.jsonl");

        let bus = Arc::new(InProcessBus::new()) as Arc<dyn MessageBus>;
        let consumer = AuditConsumer::new(Arc::clone(&bus), &path).await.unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(consumer.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        bus.publish("audit.BROKEN", Bytes::from_static(b"not json"))
            .await
            .unwrap();
        emit(&bus, AuditEvent::new("a", "LOGIN")).await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown_tx.send(true).unwrap();
        task.await.unwrap().unwrap();

        assert_eq!(read_records(&path).len(), 1);
    }

    #[test]
    fn test_canonical_json_sorted_and_compact() {
        let event = AuditEvent::new("actor", "LOGIN");
        let canonical = canonical_without_hash(&event).unwrap();
        assert!(!canonical.contains(": "));
        assert!(!canonical.contains("\"hash\""));
        // Keys appear in sorted order
        let action_pos = canonical.find("\"action\"").unwrap();
        let actor_pos = canonical.find("\"actor_id\"").unwrap();
        let ts_pos = canonical.find("\"timestamp\"").unwrap();
        assert!(action_pos < actor_pos && actor_pos < ts_pos);
    }
}
