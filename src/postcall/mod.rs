//! Post-call pipeline: on `call.ended`, reconstruct the transcript,
//! summarise it, sync the summary to the CRM, and finalise call state.
//!
//! The queue-group guarantees exactly one worker across replicas processes
//! each call. A call already `processed` is dropped idempotently; a
//! `crm_failed` call runs the pipeline again, which is how a reconciliation
//! process retries the CRM sync (by re-publishing `call.ended`).

pub mod crm;
pub mod summarizer;

pub use crm::{CrmConnector, MockCrm};
pub use summarizer::{CallAnalysis, HttpSummarizer, MockSummarizer, Summarizer};

use crate::audit::{self, AuditEvent};
use crate::bus::MessageBus;
use crate::config::PostCallConfig;
use crate::db::{CallRepo, CallStatus, DbPool, SegmentRepo, UserRepo};
use crate::error::AppResult;
use crate::events::{subjects, CallEnded};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub const QUEUE_GROUP: &str = "integrations_pipeline";

const FALLBACK_CUSTOMER_EMAIL: &str = "unknown@client.com";

pub struct PostCallWorker {
    bus: Arc<dyn MessageBus>,
    pool: DbPool,
    summarizer: Arc<dyn Summarizer>,
    crm: Arc<dyn CrmConnector>,
    cfg: PostCallConfig,
}

impl PostCallWorker {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        pool: DbPool,
        summarizer: Arc<dyn Summarizer>,
        crm: Arc<dyn CrmConnector>,
        cfg: PostCallConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            pool,
            summarizer,
            crm,
            cfg,
        })
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> AppResult<()> {
        self.crm.connect().await?;
        let mut sub = self
            .bus
            .subscribe(subjects::CALL_ENDED, Some(QUEUE_GROUP), 64)
            .await?;
        info!(queue_group = QUEUE_GROUP, "Post-call worker subscribed");

        loop {
            tokio::select! {
                msg = sub.recv() => match msg {
                    Some(msg) => {
                        let payload: CallEnded = match serde_json::from_slice(&msg.payload) {
                            Ok(payload) => payload,
                            Err(e) => {
                                warn!(error = %e, "Malformed call.ended dropped");
                                continue;
                            }
                        };
                        if let Err(e) = self.process(&payload.session_id).await {
                            warn!(session_id = %payload.session_id, error = %e, "Post-call pipeline failed");
                        }
                    }
                    None => break,
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("Post-call worker stopped");
        Ok(())
    }

    pub async fn process(&self, session_id: &str) -> AppResult<()> {
        // 1. Load the call; an absent record means an audio-only session.
        let Some(call) = CallRepo::get_by_session_id(&self.pool, session_id).await? else {
            warn!(session_id, "Call record not found, skipping post-call pipeline");
            return Ok(());
        };
        // Only processed is final. A crm_failed call deliberately re-enters
        // the pipeline so reconciliation can retry the CRM sync.
        if call.status() == CallStatus::Processed {
            info!(session_id, "Already processed, skipping");
            return Ok(());
        }

        // 2. Reconstruct the transcript in utterance order.
        let segments = SegmentRepo::list_by_call(&self.pool, &call.id).await?;
        if segments.is_empty() {
            warn!(session_id, "No transcript segments, skipping");
            return Ok(());
        }
        let transcript = segments
            .iter()
            .map(|s| format!("{}: {}", s.speaker, s.text))
            .collect::<Vec<_>>()
            .join("\n");
        info!(session_id, chars = transcript.len(), "Reconstructed transcript");

        // 3. Summarise. Failure (including timeout) is non-fatal: the call
        // keeps its current status and an external orchestrator may retry.
        let deadline = Duration::from_secs(self.cfg.summarizer_timeout_secs);
        let analysis = match tokio::time::timeout(deadline, self.summarizer.summarize(&transcript))
            .await
        {
            Ok(Ok(analysis)) => analysis,
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "Summariser failed, status unchanged");
                return Ok(());
            }
            Err(_) => {
                warn!(session_id, "Summariser timed out, status unchanged");
                return Ok(());
            }
        };

        // The call may still be in_progress if it ended before any audio was
        // finalised; it is completed by the time we judge CRM outcome.
        let _ = CallRepo::advance_status(&self.pool, &call.id, CallStatus::Completed).await?;

        // 4. CRM sync.
        let user_email = match UserRepo::get_by_id(&self.pool, &call.user_id).await? {
            Some(user) => user.email,
            None => "agent@demo.com".to_string(),
        };
        let customer_email = call
            .customer_email
            .clone()
            .unwrap_or_else(|| FALLBACK_CUSTOMER_EMAIL.to_string());
        let summary = summarizer::render_summary(&analysis);

        let crm_deadline = Duration::from_secs(self.cfg.crm_timeout_secs);
        let synced = match tokio::time::timeout(
            crm_deadline,
            self.crm
                .log_call_activity(&user_email, &customer_email, &summary),
        )
        .await
        {
            Ok(Ok(synced)) => synced,
            Ok(Err(e)) => {
                warn!(session_id, error = %e, "CRM sync errored");
                false
            }
            Err(_) => {
                warn!(session_id, "CRM sync timed out");
                false
            }
        };

        // 5. Finalise state.
        if synced {
            CallRepo::advance_status(&self.pool, &call.id, CallStatus::Processed).await?;
            CallRepo::set_sentiment(&self.pool, &call.id, analysis.sentiment_score()).await?;
            info!(session_id, "Post-call pipeline complete, status processed");
            audit::emit(
                &self.bus,
                AuditEvent::new("postcall", "CRM_SYNC").with_resource(&call.id),
            )
            .await;
        } else {
            CallRepo::advance_status(&self.pool, &call.id, CallStatus::CrmFailed).await?;
            warn!(session_id, "CRM sync failed, status crm_failed");
            audit::emit(
                &self.bus,
                AuditEvent::new("postcall", "CRM_SYNC")
                    .with_resource(&call.id)
                    .with_status("FAILURE"),
            )
            .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InProcessBus;
    use crate::db::{self, setup_test_db, NewCall, NewSegment};
    use crate::error::AppError;
    use async_trait::async_trait;

    async fn seed_call_with_segments(
        pool: &DbPool,
        session_id: &str,
        customer_email: Option<&str>,
    ) -> String {
        let org = db::OrgRepo::create(pool, "Acme").await.unwrap();
        let user = db::UserRepo::create(pool, &org.id, "agent@acme.com").await.unwrap();
        let call = CallRepo::create(
            pool,
            NewCall {
                org_id: org.id,
                user_id: user.id,
                session_id: session_id.to_string(),
                customer_email: customer_email.map(String::from),
            },
        )
        .await
        .unwrap();

        let segments: Vec<NewSegment> = (0..3)
            .map(|i| NewSegment {
                call_id: call.id.clone(),
                text: format!("utterance number {i} about the product and pricing"),
                start_offset: i as f64 * 2.0,
                end_offset: i as f64 * 2.0 + 1.5,
                speaker: "agent".to_string(),
            })
            .collect();
        SegmentRepo::insert_batch(pool, &segments).await.unwrap();
        call.id
    }

    fn worker(pool: DbPool, crm: Arc<MockCrm>) -> Arc<PostCallWorker> {
        PostCallWorker::new(
            Arc::new(InProcessBus::new()),
            pool,
            Arc::new(MockSummarizer),
            crm,
            PostCallConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_happy_path_processes_call() {
        let pool = setup_test_db().await;
        let call_id = seed_call_with_segments(&pool, "s1", Some("buyer@client.com")).await;
        let crm = Arc::new(MockCrm::new());
        let worker = worker(pool.clone(), Arc::clone(&crm));

        worker.process("s1").await.unwrap();

        let call = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(call.status(), CallStatus::Processed);
        assert!([0.0, 0.5, 1.0].contains(&call.sentiment_score.unwrap()));

        let activities = crm.activities();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].customer_email, "buyer@client.com");
        assert!(activities[0].summary.contains("SUMMARY:"));
        drop(call_id);
    }

    #[tokio::test]
    async fn test_second_invocation_is_noop() {
        let pool = setup_test_db().await;
        seed_call_with_segments(&pool, "s1", Some("buyer@client.com")).await;
        let crm = Arc::new(MockCrm::new());
        let worker = worker(pool.clone(), Arc::clone(&crm));

        worker.process("s1").await.unwrap();
        worker.process("s1").await.unwrap();

        // CRM invoked exactly once despite the duplicate call.ended
        assert_eq!(crm.activities().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_contact_marks_crm_failed() {
        let pool = setup_test_db().await;
        seed_call_with_segments(&pool, "s1", Some("stranger@client.com")).await;
        let crm = Arc::new(MockCrm::new());
        crm.mark_contact_missing("stranger@client.com");
        let worker = worker(pool.clone(), Arc::clone(&crm));

        worker.process("s1").await.unwrap();

        let call = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(call.status(), CallStatus::CrmFailed);
        assert!(call.sentiment_score.is_none());
    }

    #[tokio::test]
    async fn test_short_transcript_still_processes() {
        let pool = setup_test_db().await;
        let org = db::OrgRepo::create(&pool, "Acme").await.unwrap();
        let user = db::UserRepo::create(&pool, &org.id, "agent@acme.com").await.unwrap();
        let call = CallRepo::create(
            &pool,
            NewCall {
                org_id: org.id,
                user_id: user.id,
                session_id: "brief".to_string(),
                customer_email: Some("buyer@client.com".to_string()),
            },
        )
        .await
        .unwrap();
        SegmentRepo::insert_batch(
            &pool,
            &[NewSegment {
                call_id: call.id.clone(),
                text: "yes".to_string(),
                start_offset: 0.0,
                end_offset: 0.5,
                speaker: "customer".to_string(),
            }],
        )
        .await
        .unwrap();

        let crm = Arc::new(MockCrm::new());
        let worker = worker(pool.clone(), Arc::clone(&crm));
        worker.process("brief").await.unwrap();

        // A one-word call still goes through the whole pipeline
        let found = CallRepo::get_by_session_id(&pool, "brief").await.unwrap().unwrap();
        assert_eq!(found.status(), CallStatus::Processed);
        assert_eq!(crm.activities().len(), 1);
    }

    #[tokio::test]
    async fn test_crm_failed_call_retries_to_processed() {
        let pool = setup_test_db().await;
        seed_call_with_segments(&pool, "s1", Some("stranger@client.com")).await;

        // First pass: contact missing, call parks at crm_failed
        let failing_crm = Arc::new(MockCrm::new());
        failing_crm.mark_contact_missing("stranger@client.com");
        let worker_a = worker(pool.clone(), Arc::clone(&failing_crm));
        worker_a.process("s1").await.unwrap();
        let parked = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(parked.status(), CallStatus::CrmFailed);

        // Reconciliation retry: the contact now resolves, the pipeline reruns
        let healthy_crm = Arc::new(MockCrm::new());
        let worker_b = worker(pool.clone(), Arc::clone(&healthy_crm));
        worker_b.process("s1").await.unwrap();

        let retried = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(retried.status(), CallStatus::Processed);
        assert!(retried.sentiment_score.is_some());
        assert_eq!(healthy_crm.activities().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_dropped() {
        let pool = setup_test_db().await;
        let crm = Arc::new(MockCrm::new());
        let worker = worker(pool.clone(), Arc::clone(&crm));

        worker.process("nope").await.unwrap();
        assert!(crm.activities().is_empty());
    }

    #[tokio::test]
    async fn test_call_without_segments_is_skipped() {
        let pool = setup_test_db().await;
        let org = db::OrgRepo::create(&pool, "Acme").await.unwrap();
        let user = db::UserRepo::create(&pool, &org.id, "agent@acme.com").await.unwrap();
        CallRepo::create(
            &pool,
            NewCall {
                org_id: org.id,
                user_id: user.id,
                session_id: "empty".to_string(),
                customer_email: None,
            },
        )
        .await
        .unwrap();

        let crm = Arc::new(MockCrm::new());
        let worker = worker(pool.clone(), Arc::clone(&crm));
        worker.process("empty").await.unwrap();

        let call = CallRepo::get_by_session_id(&pool, "empty").await.unwrap().unwrap();
        assert_eq!(call.status(), CallStatus::InProgress);
        assert!(crm.activities().is_empty());
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _transcript: &str) -> AppResult<CallAnalysis> {
            Err(AppError::Summarizer("model unavailable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_summarizer_failure_leaves_status() {
        let pool = setup_test_db().await;
        seed_call_with_segments(&pool, "s1", None).await;
        let crm = Arc::new(MockCrm::new());
        let worker = PostCallWorker::new(
            Arc::new(InProcessBus::new()),
            pool.clone(),
            Arc::new(FailingSummarizer),
            Arc::clone(&crm) as Arc<dyn CrmConnector>,
            PostCallConfig::default(),
        );

        worker.process("s1").await.unwrap();

        let call = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        // No status advance, no CRM call: an external orchestrator retries
        assert_eq!(call.status(), CallStatus::InProgress);
        assert!(crm.activities().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_customer_email() {
        let pool = setup_test_db().await;
        seed_call_with_segments(&pool, "s1", None).await;
        let crm = Arc::new(MockCrm::new());
        let worker = worker(pool.clone(), Arc::clone(&crm));

        worker.process("s1").await.unwrap();
        assert_eq!(crm.activities()[0].customer_email, FALLBACK_CUSTOMER_EMAIL);
    }

    #[tokio::test]
    async fn test_end_to_end_over_bus() {
        let pool = setup_test_db().await;
        seed_call_with_segments(&pool, "s1", Some("buyer@client.com")).await;
        let bus = Arc::new(InProcessBus::new());
        let crm = Arc::new(MockCrm::new());
        let worker = PostCallWorker::new(
            Arc::clone(&bus) as Arc<dyn MessageBus>,
            pool.clone(),
            Arc::new(MockSummarizer),
            Arc::clone(&crm) as Arc<dyn CrmConnector>,
            PostCallConfig::default(),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(&worker).run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let ended = CallEnded::now("s1", "user_end");
        bus.publish(
            subjects::CALL_ENDED,
            bytes::Bytes::from(serde_json::to_vec(&ended).unwrap()),
        )
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        let call = CallRepo::get_by_session_id(&pool, "s1").await.unwrap().unwrap();
        assert_eq!(call.status(), CallStatus::Processed);
        assert_eq!(crm.activities().len(), 1);

        shutdown_tx.send(true).unwrap();
    }
}
