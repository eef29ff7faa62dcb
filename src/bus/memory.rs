//! In-process bus implementation.
//!
//! Subscriptions are broadcast channels keyed by subject pattern; queue-group
//! members share a round-robin cursor so each message lands on exactly one of
//! them. Lossy delivery: a slow subscriber's oldest messages are dropped.

use super::{subject_matches, BusMessage, MessageBus, Subscription};
use crate::error::AppResult;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

struct PlainSub {
    id: u64,
    pattern: String,
    tx: broadcast::Sender<BusMessage>,
}

struct GroupMember {
    id: u64,
    tx: broadcast::Sender<BusMessage>,
}

struct Group {
    members: Vec<GroupMember>,
    cursor: AtomicUsize,
}

#[derive(Default)]
struct Registry {
    plain: Vec<PlainSub>,
    // Keyed by (pattern, queue-group name)
    groups: HashMap<(String, String), Group>,
}

/// Single-process message bus.
pub struct InProcessBus {
    registry: Arc<Mutex<Registry>>,
    next_id: AtomicU64,
}

impl InProcessBus {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            next_id: AtomicU64::new(0),
        }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Removes the subscription from the registry when dropped.
struct Unsubscribe {
    registry: Arc<Mutex<Registry>>,
    id: u64,
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        let mut reg = match self.registry.lock() {
            Ok(reg) => reg,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.plain.retain(|s| s.id != self.id);
        reg.groups.retain(|_, group| {
            group.members.retain(|m| m.id != self.id);
            !group.members.is_empty()
        });
    }
}

#[async_trait]
impl MessageBus for InProcessBus {
    async fn publish(&self, subject: &str, payload: Bytes) -> AppResult<()> {
        let msg = BusMessage {
            subject: subject.to_string(),
            payload,
        };
        let reg = match self.registry.lock() {
            Ok(reg) => reg,
            Err(poisoned) => poisoned.into_inner(),
        };
        for sub in &reg.plain {
            if subject_matches(&sub.pattern, subject) {
                // Send errors mean no live receiver; the bus is lossy.
                let _ = sub.tx.send(msg.clone());
            }
        }
        for ((pattern, _), group) in &reg.groups {
            if subject_matches(pattern, subject) && !group.members.is_empty() {
                let idx = group.cursor.fetch_add(1, Ordering::Relaxed) % group.members.len();
                let _ = group.members[idx].tx.send(msg.clone());
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        subject: &str,
        queue_group: Option<&str>,
        capacity: usize,
    ) -> AppResult<Subscription> {
        let (tx, rx) = broadcast::channel(capacity.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut reg = match self.registry.lock() {
            Ok(reg) => reg,
            Err(poisoned) => poisoned.into_inner(),
        };
        match queue_group {
            Some(group_name) => {
                let group = reg
                    .groups
                    .entry((subject.to_string(), group_name.to_string()))
                    .or_insert_with(|| Group {
                        members: Vec::new(),
                        cursor: AtomicUsize::new(0),
                    });
                group.members.push(GroupMember { id, tx });
            }
            None => {
                reg.plain.push(PlainSub {
                    id,
                    pattern: subject.to_string(),
                    tx,
                });
            }
        }
        let guard = Unsubscribe {
            registry: Arc::clone(&self.registry),
            id,
        };
        Ok(Subscription::new(
            rx,
            subject.to_string(),
            Some(Box::new(guard)),
        ))
    }

    async fn close(&self) -> AppResult<()> {
        let mut reg = match self.registry.lock() {
            Ok(reg) => reg,
            Err(poisoned) => poisoned.into_inner(),
        };
        reg.plain.clear();
        reg.groups.clear();
        Ok(())
    }
}
