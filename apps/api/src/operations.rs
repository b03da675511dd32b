//! What every AI operation shares: the collaborator bundle, caller
//! authorization, fresh config resolution, and the billing tail (deduct,
//! log, broadcast).
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Caller;
use crate::errors::AppError;
use crate::llm_client::{LlmError, LlmProvider, ProviderSource};
use crate::models::operation::OperationConfig;
use crate::models::usage::UsageRecord;
use crate::store::{BalanceNotifier, Ledger, OperationConfigs, ScopedData};

#[derive(Debug, Error)]
pub enum OperationError {
    #[error("no active configuration for operation '{0}'")]
    Missing(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("configuration lookup failed: {0}")]
    Lookup(String),

    #[error(transparent)]
    Provider(#[from] LlmError),
}

impl From<OperationError> for AppError {
    fn from(e: OperationError) -> Self {
        AppError::Configuration(e.to_string())
    }
}

/// The request names an organization, specialist or conversation the caller
/// may not act for.
#[derive(Debug, Error)]
pub enum AccessError {
    #[error("token is bound to a different {0}")]
    ClaimMismatch(&'static str),

    #[error("caller is not specialist {hr_specialist_id} of organization {organization_id}")]
    NotMember {
        organization_id: Uuid,
        hr_specialist_id: Uuid,
    },

    #[error("conversation {0} is not owned by the caller")]
    ForeignConversation(Uuid),

    #[error("membership lookup failed: {0}")]
    Lookup(String),
}

impl From<AccessError> for AppError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::Lookup(msg) => AppError::Internal(anyhow::anyhow!(msg)),
            denied => {
                warn!("Access denied: {denied}");
                AppError::Forbidden
            }
        }
    }
}

/// Config plus the adapter it selects. One provider per invocation, never mixed.
#[derive(Clone)]
pub struct ResolvedOperation {
    pub config: OperationConfig,
    pub provider: Arc<dyn LlmProvider>,
}

/// Collaborators for one caller's AI invocation. Cheap to clone.
#[derive(Clone)]
pub struct AiServices {
    pub providers: Arc<dyn ProviderSource>,
    pub configs: Arc<dyn OperationConfigs>,
    pub data: Arc<dyn ScopedData>,
    pub ledger: Arc<dyn Ledger>,
    pub notifier: Arc<dyn BalanceNotifier>,
}

impl AiServices {
    /// Binds the ids in a request body to the verified caller. Runs before
    /// anything is read, generated or billed. Organization and specialist
    /// claims carried by the token are compared first; whatever the token does
    /// not pin down is checked with the caller's own credentials.
    pub async fn authorize(
        &self,
        caller: &Caller,
        organization_id: Uuid,
        hr_specialist_id: Uuid,
        conversation_id: Option<Uuid>,
    ) -> Result<(), AccessError> {
        let org_pinned = claim_matches(caller, "organization_id", organization_id)?;
        let specialist_pinned = claim_matches(caller, "hr_specialist_id", hr_specialist_id)?;

        if !(org_pinned && specialist_pinned) {
            let member = self
                .data
                .is_specialist(organization_id, hr_specialist_id)
                .await
                .map_err(|e| AccessError::Lookup(format!("{e:#}")))?;
            if !member {
                return Err(AccessError::NotMember {
                    organization_id,
                    hr_specialist_id,
                });
            }
        }

        if let Some(conversation_id) = conversation_id {
            let owned = self
                .data
                .owns_conversation(organization_id, hr_specialist_id, conversation_id)
                .await
                .map_err(|e| AccessError::Lookup(format!("{e:#}")))?;
            if !owned {
                return Err(AccessError::ForeignConversation(conversation_id));
            }
        }

        debug!(user_id = %caller.user_id, %organization_id, "Caller authorized");
        Ok(())
    }

    /// Reads the active config for `operation_type` (never cached) and picks its adapter.
    pub async fn resolve(&self, operation_type: &str) -> Result<ResolvedOperation, OperationError> {
        let row = self
            .configs
            .active_config(operation_type)
            .await
            .map_err(|e| OperationError::Lookup(format!("{e:#}")))?
            .ok_or_else(|| OperationError::Missing(operation_type.to_string()))?;
        let config = OperationConfig::try_from(row).map_err(OperationError::Invalid)?;
        let provider = self.providers.provider(config.provider)?;
        debug!(
            operation_type,
            provider = %config.provider,
            model = %config.model,
            "Resolved operation config"
        );
        Ok(ResolvedOperation { config, provider })
    }

    /// Billing tail of an invocation. Successful runs deduct their total and
    /// notify; every run writes its usage record. Failures here are logged,
    /// never returned: the generation already happened.
    pub async fn settle(&self, record: UsageRecord) {
        let organization_id: Uuid = record.organization_id;
        let total = record.total_tokens();

        let deducted = if record.success && total > 0 {
            match self.ledger.decrement_tokens(organization_id, total).await {
                Ok(()) => true,
                Err(e) => {
                    warn!(%organization_id, total, "Token decrement failed: {e:#}");
                    false
                }
            }
        } else {
            false
        };

        if let Err(e) = self.ledger.record_usage(&record).await {
            warn!(
                %organization_id,
                operation_type = %record.operation_type,
                "Usage record write failed: {e:#}"
            );
        }

        if deducted {
            self.notifier.balance_changed(organization_id, total).await;
        }
    }
}

/// `Ok(true)` when the token carries `key` and it equals `expected`,
/// `Ok(false)` when the token is silent about it.
fn claim_matches(caller: &Caller, key: &'static str, expected: Uuid) -> Result<bool, AccessError> {
    match caller.claimed_uuid(key) {
        Ok(None) => Ok(false),
        Ok(Some(claimed)) if claimed == expected => Ok(true),
        _ => Err(AccessError::ClaimMismatch(key)),
    }
}
