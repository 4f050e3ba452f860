//! Signup-time creation of role-specific records in the patient and nurse
//! subgraphs.
//!
//! The call is synchronous and happens after the `User` is stored. There is
//! no rollback: when it fails the user exists without a role record. Both
//! initialize mutations are idempotent, so running the hook again for the
//! same user repairs the gap.

use async_trait::async_trait;
use serde_json::{Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ProvisioningSettings;
use crate::identity::{IdentityError, Role, TokenAuthority};

#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("failed to mint provisioning token: {0}")]
    Token(#[from] IdentityError),

    #[error("request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("{url} answered HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("{url} rejected the mutation: {message}")]
    Rejected { url: String, message: String },

    #[error("{url} returned no record")]
    EmptyResult { url: String },
}

/// The account a role record is created for.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAccount {
    pub id: String,
    pub user_name: String,
    pub role: Role,
}

impl NewAccount {
    /// Roles with a record to provision, and the error shown to the
    /// signing-up client when that fails.
    pub fn failure_message(&self) -> Option<&'static str> {
        match self.role {
            Role::Patient => Some("Failed to create patient record"),
            Role::Nurse => Some("Failed to create nurse record"),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Creates the role record for `account`. Roles without one succeed
    /// without any call.
    async fn provision(&self, account: &NewAccount) -> Result<(), ProvisioningError>;
}

pub struct HttpProvisioner {
    client: reqwest::Client,
    authority: TokenAuthority,
    settings: ProvisioningSettings,
    token_ttl: Duration,
}

impl HttpProvisioner {
    pub fn new(authority: TokenAuthority, settings: ProvisioningSettings, token_ttl: Duration) -> Self {
        HttpProvisioner {
            client: reqwest::Client::new(),
            authority,
            settings,
            token_ttl,
        }
    }

    fn target(&self, role: Role) -> Option<(&str, &'static str)> {
        match role {
            Role::Patient => Some((self.settings.patient_url.as_str(), "initializePatientData")),
            Role::Nurse => Some((self.settings.nurse_url.as_str(), "initializeNurseData")),
            _ => None,
        }
    }
}

#[async_trait]
impl Provisioner for HttpProvisioner {
    async fn provision(&self, account: &NewAccount) -> Result<(), ProvisioningError> {
        let Some((url, mutation)) = self.target(account.role) else {
            return Ok(());
        };

        let token = self
            .authority
            .mint_with_ttl(&account.id, &account.user_name, account.role, self.token_ttl)?;
        let document = format!("mutation {{ {mutation} {{ id }} }}");

        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .timeout(self.settings.timeout())
            .json(&json!({ "query": document }))
            .send()
            .await
            .map_err(|e| ProvisioningError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProvisioningError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body: Value = response.json().await.map_err(|e| ProvisioningError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        if let Some(errors) = body.get("errors").and_then(Value::as_array).filter(|e| !e.is_empty()) {
            let message = errors
                .iter()
                .filter_map(|e| e.get("message").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("; ");
            warn!(user = %account.id, %url, %message, "provisioning mutation returned errors");
            return Err(ProvisioningError::Rejected {
                url: url.to_string(),
                message,
            });
        }

        let record = body
            .pointer(&format!("/data/{mutation}/id"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProvisioningError::EmptyResult { url: url.to_string() })?;

        info!(user = %account.id, role = %account.role, record, "role record provisioned");
        Ok(())
    }
}
