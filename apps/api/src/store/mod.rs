//! Side-effect seams for AI operations.
//!
//! Reads that must respect the caller's organization boundary go through
//! `ScopedData`; writes that happen after a generation (messages, balance,
//! usage log, documents) go through `Ledger`; the realtime balance broadcast
//! goes through `BalanceNotifier`. Production implementations live in
//! `postgres` and `notifier`; the orchestrator only sees the traits.
use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::models::conversation::{ContextType, MessagePair};
use crate::models::document::GeneratedDocument;
use crate::models::operation::OperationConfigRow;
use crate::models::usage::UsageRecord;

pub mod notifier;
pub mod postgres;

pub use notifier::RedisBalanceNotifier;
pub use postgres::{PgConfigs, PgLedger, PgScopedData};

/// Read-only, organization-scoped queries. Every method runs with the
/// caller's credentials so row-level security applies.
#[async_trait]
pub trait ScopedData: Send + Sync {
    /// Whether the caller is the specialist `hr_specialist_id` of `organization_id`.
    async fn is_specialist(&self, organization_id: Uuid, hr_specialist_id: Uuid)
        -> anyhow::Result<bool>;

    /// Whether the conversation belongs to that specialist's organization.
    async fn owns_conversation(
        &self,
        organization_id: Uuid,
        hr_specialist_id: Uuid,
        conversation_id: Uuid,
    ) -> anyhow::Result<bool>;

    async fn context_snapshot(
        &self,
        organization_id: Uuid,
        context_type: ContextType,
        entity_id: Option<Uuid>,
    ) -> anyhow::Result<Value>;

    async fn search_candidates(
        &self,
        organization_id: Uuid,
        query: &str,
        status: Option<&str>,
    ) -> anyhow::Result<Value>;

    async fn candidate_details(&self, organization_id: Uuid, candidate_id: Uuid)
        -> anyhow::Result<Value>;

    async fn vacancy_details(&self, organization_id: Uuid, vacancy_id: Uuid)
        -> anyhow::Result<Value>;

    async fn list_vacancies(&self, organization_id: Uuid, status: &str) -> anyhow::Result<Value>;

    /// Funnel statistics plus the current token balance.
    async fn organization_stats(&self, organization_id: Uuid) -> anyhow::Result<Value>;
}

/// Post-generation writes.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Appends the user and assistant messages in one statement.
    async fn append_message_pair(&self, pair: &MessagePair) -> anyhow::Result<()>;

    /// Atomic decrement at the data layer. Never read-modify-write here.
    async fn decrement_tokens(&self, organization_id: Uuid, amount: i64) -> anyhow::Result<()>;

    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()>;

    /// Inserts or replaces the document for its subject; returns its id.
    async fn upsert_document(&self, document: &GeneratedDocument) -> anyhow::Result<Uuid>;
}

/// Operator-editable model/prompt rows, read fresh on every invocation.
#[async_trait]
pub trait OperationConfigs: Send + Sync {
    async fn active_config(&self, operation_type: &str)
        -> anyhow::Result<Option<OperationConfigRow>>;
}

/// Best-effort notification that an organization's balance changed.
/// Implementations bound their own latency and never fail the caller.
#[async_trait]
pub trait BalanceNotifier: Send + Sync {
    async fn balance_changed(&self, organization_id: Uuid, spent: i64);
}
