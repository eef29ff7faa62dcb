//! CRM adapter capability.
//!
//! Vendor integrations are external collaborators; the contract is
//! connect-once plus `log_call_activity`, which returns `false` as a soft
//! failure when the customer contact cannot be matched. The mock adapter
//! records activities in memory and backs development and tests.

use crate::config::PostCallConfig;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::info;

#[async_trait]
pub trait CrmConnector: Send + Sync {
    /// Authenticate with the CRM.
    async fn connect(&self) -> AppResult<()>;

    /// Log a call-summary activity against the customer's contact record.
    /// `Ok(false)` is the soft failure: no matching contact.
    async fn log_call_activity(
        &self,
        user_email: &str,
        customer_email: &str,
        summary: &str,
    ) -> AppResult<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedActivity {
    pub user_email: String,
    pub customer_email: String,
    pub summary: String,
}

/// In-memory CRM. Every contact matches unless it was registered as missing.
#[derive(Default)]
pub struct MockCrm {
    activities: Mutex<Vec<LoggedActivity>>,
    missing_contacts: Mutex<HashSet<String>>,
}

impl MockCrm {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a customer email as unknown to the CRM.
    pub fn mark_contact_missing(&self, email: &str) {
        self.missing_contacts
            .lock()
            .expect("missing_contacts lock")
            .insert(email.to_string());
    }

    pub fn activities(&self) -> Vec<LoggedActivity> {
        self.activities.lock().expect("activities lock").clone()
    }
}

#[async_trait]
impl CrmConnector for MockCrm {
    async fn connect(&self) -> AppResult<()> {
        info!("CRM: mock mode enabled");
        Ok(())
    }

    async fn log_call_activity(
        &self,
        user_email: &str,
        customer_email: &str,
        summary: &str,
    ) -> AppResult<bool> {
        if self
            .missing_contacts
            .lock()
            .expect("missing_contacts lock")
            .contains(customer_email)
        {
            return Ok(false);
        }
        info!(customer_email, "Mock CRM logged call activity");
        self.activities
            .lock()
            .expect("activities lock")
            .push(LoggedActivity {
                user_email: user_email.to_string(),
                customer_email: customer_email.to_string(),
                summary: summary.to_string(),
            });
        Ok(true)
    }
}

/// Build the CRM adapter selected by configuration. Vendor adapters
/// (Salesforce, HubSpot) register here.
pub fn build(cfg: &PostCallConfig) -> AppResult<Arc<dyn CrmConnector>> {
    match cfg.crm_provider.as_str() {
        "mock" => Ok(Arc::new(MockCrm::new())),
        other => Err(AppError::InvalidConfig(format!(
            "unknown CRM provider: {other}"
        ))),
    }
}
