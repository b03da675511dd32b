use async_trait::async_trait;
use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::models::conversation::{ContextType, MessagePair};
use crate::models::document::GeneratedDocument;
use crate::models::operation::OperationConfigRow;
use crate::models::usage::UsageRecord;

use super::{Ledger, OperationConfigs, ScopedData};

/// Caller-scoped RPC access. Each call runs in its own short transaction that
/// first installs the caller's JWT claims and switches to the `authenticated`
/// role, so the database enforces the organization boundary.
#[derive(Clone)]
pub struct PgScopedData {
    pool: PgPool,
    claims: Value,
}

impl PgScopedData {
    pub fn new(pool: PgPool, claims: Value) -> Self {
        Self { pool, claims }
    }

    async fn begin(&self) -> anyhow::Result<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT set_config('request.jwt.claims', $1, true)")
            .bind(self.claims.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("SET LOCAL ROLE authenticated")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    /// The `sub` claim; the verifier guarantees it is present.
    fn subject(&self) -> &str {
        self.claims["sub"].as_str().unwrap_or_default()
    }
}

/// RPCs return jsonb; SQL NULL is surfaced as JSON null.
fn or_null(value: Option<Value>) -> Value {
    value.unwrap_or(Value::Null)
}

#[async_trait]
impl ScopedData for PgScopedData {
    async fn is_specialist(
        &self,
        organization_id: Uuid,
        hr_specialist_id: Uuid,
    ) -> anyhow::Result<bool> {
        let mut tx = self.begin().await?;
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM hr_specialists
                WHERE id = $1 AND organization_id = $2 AND user_id::text = $3
            )
            "#,
        )
        .bind(hr_specialist_id)
        .bind(organization_id)
        .bind(self.subject())
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(found)
    }

    async fn owns_conversation(
        &self,
        organization_id: Uuid,
        hr_specialist_id: Uuid,
        conversation_id: Uuid,
    ) -> anyhow::Result<bool> {
        let mut tx = self.begin().await?;
        let found: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ai_conversations
                WHERE id = $1 AND organization_id = $2 AND hr_specialist_id = $3
            )
            "#,
        )
        .bind(conversation_id)
        .bind(organization_id)
        .bind(hr_specialist_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(found)
    }

    async fn context_snapshot(
        &self,
        organization_id: Uuid,
        context_type: ContextType,
        entity_id: Option<Uuid>,
    ) -> anyhow::Result<Value> {
        let mut tx = self.begin().await?;
        let snapshot: Option<Value> = sqlx::query_scalar(
            "SELECT get_ai_assistant_context(p_organization_id => $1, p_context_type => $2, p_entity_id => $3)",
        )
        .bind(organization_id)
        .bind(context_type.as_str())
        .bind(entity_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(or_null(snapshot))
    }

    async fn search_candidates(
        &self,
        organization_id: Uuid,
        query: &str,
        status: Option<&str>,
    ) -> anyhow::Result<Value> {
        let mut tx = self.begin().await?;
        let rows: Option<Value> = sqlx::query_scalar(
            "SELECT ai_search_candidates(p_organization_id => $1, p_query => $2, p_status => $3)",
        )
        .bind(organization_id)
        .bind(query)
        .bind(status)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(or_null(rows))
    }

    async fn candidate_details(
        &self,
        organization_id: Uuid,
        candidate_id: Uuid,
    ) -> anyhow::Result<Value> {
        let mut tx = self.begin().await?;
        let details: Option<Value> = sqlx::query_scalar(
            "SELECT ai_get_candidate_details(p_organization_id => $1, p_candidate_id => $2)",
        )
        .bind(organization_id)
        .bind(candidate_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(or_null(details))
    }

    async fn vacancy_details(
        &self,
        organization_id: Uuid,
        vacancy_id: Uuid,
    ) -> anyhow::Result<Value> {
        let mut tx = self.begin().await?;
        let details: Option<Value> = sqlx::query_scalar(
            "SELECT ai_get_vacancy_details(p_organization_id => $1, p_vacancy_id => $2)",
        )
        .bind(organization_id)
        .bind(vacancy_id)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(or_null(details))
    }

    async fn list_vacancies(&self, organization_id: Uuid, status: &str) -> anyhow::Result<Value> {
        let mut tx = self.begin().await?;
        let rows: Option<Value> = sqlx::query_scalar(
            "SELECT ai_list_vacancies(p_organization_id => $1, p_status => $2)",
        )
        .bind(organization_id)
        .bind(status)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(or_null(rows))
    }

    async fn organization_stats(&self, organization_id: Uuid) -> anyhow::Result<Value> {
        let mut tx = self.begin().await?;
        let stats: Option<Value> =
            sqlx::query_scalar("SELECT ai_get_org_stats(p_organization_id => $1)")
                .bind(organization_id)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(or_null(stats))
    }
}

/// Service-pool writes.
#[derive(Clone)]
pub struct PgLedger {
    pool: PgPool,
}

impl PgLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Ledger for PgLedger {
    async fn append_message_pair(&self, pair: &MessagePair) -> anyhow::Result<()> {
        let attachment = pair.attachment.as_ref();
        // Single multi-row INSERT: both messages land or neither does. The
        // join only matches a conversation of the paying organization.
        let inserted = sqlx::query(
            r#"
            INSERT INTO ai_messages
                (conversation_id, role, content, attachment_url, attachment_name, attachment_type, tokens_used)
            SELECT c.id, m.role, m.content, m.attachment_url, m.attachment_name, m.attachment_type, m.tokens_used
            FROM ai_conversations c
            CROSS JOIN (VALUES
                ('user', $2, $3, $4, $5, 0::bigint),
                ('assistant', $6, NULL, NULL, NULL, $7::bigint)
            ) AS m (role, content, attachment_url, attachment_name, attachment_type, tokens_used)
            WHERE c.id = $1 AND c.organization_id = $8
            "#,
        )
        .bind(pair.conversation_id)
        .bind(&pair.user_content)
        .bind(attachment.map(|a| a.url.as_str()))
        .bind(attachment.and_then(|a| a.name.as_deref()))
        .bind(attachment.and_then(|a| a.mime_type.as_deref()))
        .bind(&pair.assistant_content)
        .bind(pair.tokens_used)
        .bind(pair.organization_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        if inserted != 2 {
            anyhow::bail!(
                "conversation {} not found in organization {}",
                pair.conversation_id,
                pair.organization_id
            );
        }

        sqlx::query("UPDATE ai_conversations SET updated_at = now() WHERE id = $1")
            .bind(pair.conversation_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn decrement_tokens(&self, organization_id: Uuid, amount: i64) -> anyhow::Result<()> {
        sqlx::query("SELECT decrement_tokens(p_organization_id => $1, p_amount => $2)")
            .bind(organization_id)
            .bind(amount)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_operation_logs
                (organization_id, hr_specialist_id, operation_type, provider, model,
                 input_tokens, output_tokens, total_tokens, tokens_estimated,
                 success, error_message, metadata)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.organization_id)
        .bind(record.hr_specialist_id)
        .bind(&record.operation_type)
        .bind(&record.provider)
        .bind(&record.model)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.total_tokens())
        .bind(record.tokens_estimated)
        .bind(record.success)
        .bind(&record.error_message)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_document(&self, document: &GeneratedDocument) -> anyhow::Result<Uuid> {
        let id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO ai_documents
                (id, organization_id, hr_specialist_id, operation_type, subject_key,
                 candidate_id, vacancy_id, content, structured, model, tokens_used, language)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (organization_id, operation_type, subject_key) DO UPDATE SET
                hr_specialist_id = EXCLUDED.hr_specialist_id,
                content = EXCLUDED.content,
                structured = EXCLUDED.structured,
                model = EXCLUDED.model,
                tokens_used = EXCLUDED.tokens_used,
                language = EXCLUDED.language,
                updated_at = now()
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(document.organization_id)
        .bind(document.hr_specialist_id)
        .bind(&document.operation_type)
        .bind(&document.subject_key)
        .bind(document.candidate_id)
        .bind(document.vacancy_id)
        .bind(&document.content)
        .bind(&document.structured)
        .bind(&document.model)
        .bind(document.tokens_used)
        .bind(&document.language)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

#[derive(Clone)]
pub struct PgConfigs {
    pool: PgPool,
}

impl PgConfigs {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OperationConfigs for PgConfigs {
    async fn active_config(
        &self,
        operation_type: &str,
    ) -> anyhow::Result<Option<OperationConfigRow>> {
        Ok(sqlx::query_as::<_, OperationConfigRow>(
            r#"
            SELECT operation_type, provider, model, system_prompt, max_tokens, temperature
            FROM ai_operation_configs
            WHERE operation_type = $1 AND is_active
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
        )
        .bind(operation_type)
        .fetch_optional(&self.pool)
        .await?)
    }
}
