//! In-memory collaborators for orchestrator and generation tests.
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::assistant::attachment::{AttachmentError, AttachmentSource, FetchedAttachment};
use crate::llm_client::{
    LlmError, LlmProvider, ProviderEvent, ProviderKind, ProviderSource, ProviderStream,
    RoundTripRequest, TokenSource, TokenUsage, ToolCall, Turn,
};
use crate::models::conversation::{ContextType, MessagePair};
use crate::models::document::GeneratedDocument;
use crate::models::operation::OperationConfigRow;
use crate::models::usage::UsageRecord;
use crate::operations::AiServices;
use crate::store::{BalanceNotifier, Ledger, OperationConfigs, ScopedData};

// ── Provider ────────────────────────────────────────────────────────────────

/// One scripted provider round-trip.
pub enum RoundTrip {
    Events(Vec<Result<ProviderEvent, LlmError>>),
    Fail(LlmError),
    /// Never yields an event; for deadline tests.
    Hang,
}

/// A text-only final turn with the given usage.
pub fn text_reply(chunks: &[&str], input_tokens: u32, output_tokens: u32) -> RoundTrip {
    let mut events: Vec<_> = chunks
        .iter()
        .map(|c| Ok(ProviderEvent::TextDelta(c.to_string())))
        .collect();
    events.push(Ok(ProviderEvent::Usage(TokenUsage {
        input_tokens,
        output_tokens,
        source: TokenSource::Provider,
    })));
    events.push(Ok(ProviderEvent::Done));
    RoundTrip::Events(events)
}

/// A round-trip that only requests tools.
pub fn tool_request(calls: &[(&str, Value)], input_tokens: u32, output_tokens: u32) -> RoundTrip {
    let mut events: Vec<_> = calls
        .iter()
        .enumerate()
        .map(|(i, (name, args))| {
            Ok(ProviderEvent::ToolCall(ToolCall {
                id: format!("toolu_{i}"),
                name: name.to_string(),
                args: args.clone(),
            }))
        })
        .collect();
    events.push(Ok(ProviderEvent::Usage(TokenUsage {
        input_tokens,
        output_tokens,
        source: TokenSource::Provider,
    })));
    events.push(Ok(ProviderEvent::Done));
    RoundTrip::Events(events)
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub model: String,
    pub system: String,
    pub turns: Vec<Turn>,
    pub tool_names: Vec<&'static str>,
}

pub struct ScriptedProvider {
    kind: ProviderKind,
    script: Mutex<VecDeque<RoundTrip>>,
    requests: Mutex<Vec<RecordedRequest>>,
    held: Mutex<Vec<mpsc::Sender<Result<ProviderEvent, LlmError>>>>,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind, script: Vec<RoundTrip>) -> Self {
        Self {
            kind,
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
            held: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn stream_round_trip(
        &self,
        request: &RoundTripRequest<'_>,
    ) -> Result<ProviderStream, LlmError> {
        self.requests.lock().unwrap().push(RecordedRequest {
            model: request.model.to_string(),
            system: request.system.to_string(),
            turns: request.turns.to_vec(),
            tool_names: request.tools.iter().map(|t| t.name).collect(),
        });
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(RoundTrip::Events(events)) => {
                let (tx, rx) = mpsc::channel(events.len().max(1));
                for event in events {
                    let _ = tx.try_send(event);
                }
                Ok(rx)
            }
            Some(RoundTrip::Fail(e)) => Err(e),
            Some(RoundTrip::Hang) => {
                let (tx, rx) = mpsc::channel(1);
                self.held.lock().unwrap().push(tx);
                Ok(rx)
            }
            None => Err(LlmError::Stream("script exhausted".into())),
        }
    }
}

pub struct FakeProviders {
    provider: Option<Arc<ScriptedProvider>>,
}

impl ProviderSource for FakeProviders {
    fn provider(&self, kind: ProviderKind) -> Result<Arc<dyn LlmProvider>, LlmError> {
        match &self.provider {
            Some(p) if p.kind == kind => Ok(p.clone() as Arc<dyn LlmProvider>),
            _ => Err(LlmError::NotConfigured(kind)),
        }
    }
}

// ── Configs ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeConfigs {
    rows: HashMap<String, OperationConfigRow>,
}

impl FakeConfigs {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn single(operation_type: &str, provider: &str) -> Self {
        Self::empty().with(operation_type, provider)
    }

    pub fn with(mut self, operation_type: &str, provider: &str) -> Self {
        self.rows.insert(
            operation_type.to_string(),
            OperationConfigRow {
                operation_type: operation_type.to_string(),
                provider: provider.to_string(),
                model: "test-model".to_string(),
                system_prompt: "You assist recruiters at {{organization_name}}.".to_string(),
                max_tokens: 2048,
                temperature: Some(0.2),
            },
        );
        self
    }
}

#[async_trait]
impl OperationConfigs for FakeConfigs {
    async fn active_config(&self, operation_type: &str) -> anyhow::Result<Option<OperationConfigRow>> {
        Ok(self.rows.get(operation_type).cloned())
    }
}

// ── Scoped data ─────────────────────────────────────────────────────────────

/// Records every call as `name:args` and answers with canned JSON.
#[derive(Default)]
pub struct FakeData {
    calls: Mutex<Vec<String>>,
    fail_on: Mutex<Option<String>>,
    /// Membership answers `false` once set.
    outsider: AtomicBool,
    /// Conversations the caller's organization owns.
    conversations: Mutex<Vec<Uuid>>,
}

impl FakeData {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn deny_membership(&self) {
        self.outsider.store(true, Ordering::SeqCst);
    }

    pub fn own_conversation(&self, conversation_id: Uuid) {
        self.conversations.lock().unwrap().push(conversation_id);
    }

    pub fn fail_on(&self, name: &str) {
        *self.fail_on.lock().unwrap() = Some(name.to_string());
    }

    fn record(&self, name: &str, call: String) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(call);
        if self.fail_on.lock().unwrap().as_deref() == Some(name) {
            anyhow::bail!("{name} rpc failed");
        }
        Ok(())
    }
}

#[async_trait]
impl ScopedData for FakeData {
    async fn is_specialist(&self, _organization_id: Uuid, _hr_specialist_id: Uuid) -> anyhow::Result<bool> {
        if self.fail_on.lock().unwrap().as_deref() == Some("is_specialist") {
            anyhow::bail!("is_specialist lookup failed");
        }
        Ok(!self.outsider.load(Ordering::SeqCst))
    }

    async fn owns_conversation(
        &self,
        _organization_id: Uuid,
        _hr_specialist_id: Uuid,
        conversation_id: Uuid,
    ) -> anyhow::Result<bool> {
        Ok(self.conversations.lock().unwrap().contains(&conversation_id))
    }

    async fn context_snapshot(
        &self,
        organization_id: Uuid,
        context_type: ContextType,
        _entity_id: Option<Uuid>,
    ) -> anyhow::Result<Value> {
        self.record(
            "context_snapshot",
            format!("context_snapshot:{organization_id}:{}", context_type.as_str()),
        )?;
        Ok(json!({
            "organization": {"name": "Acme Hiring"},
            "funnel_stats": {"candidates": 42, "active_vacancies": 3}
        }))
    }

    async fn search_candidates(
        &self,
        organization_id: Uuid,
        query: &str,
        status: Option<&str>,
    ) -> anyhow::Result<Value> {
        self.record(
            "search_candidates",
            format!(
                "search_candidates:{organization_id}:{query}:{}",
                status.unwrap_or("-")
            ),
        )?;
        Ok(json!([{"id": Uuid::nil(), "name": "Anna Kowalska"}]))
    }

    async fn candidate_details(
        &self,
        organization_id: Uuid,
        candidate_id: Uuid,
    ) -> anyhow::Result<Value> {
        self.record(
            "candidate_details",
            format!("candidate_details:{organization_id}:{candidate_id}"),
        )?;
        Ok(json!({"id": candidate_id, "name": "Anna Kowalska", "tests": []}))
    }

    async fn vacancy_details(
        &self,
        organization_id: Uuid,
        vacancy_id: Uuid,
    ) -> anyhow::Result<Value> {
        self.record(
            "vacancy_details",
            format!("vacancy_details:{organization_id}:{vacancy_id}"),
        )?;
        Ok(json!({"id": vacancy_id, "title": "Backend Engineer"}))
    }

    async fn list_vacancies(&self, organization_id: Uuid, status: &str) -> anyhow::Result<Value> {
        self.record(
            "list_vacancies",
            format!("list_vacancies:{organization_id}:{status}"),
        )?;
        Ok(json!([
            {"title": "Backend Engineer"},
            {"title": "Data Analyst"},
            {"title": "HR Generalist"}
        ]))
    }

    async fn organization_stats(&self, organization_id: Uuid) -> anyhow::Result<Value> {
        self.record(
            "organization_stats",
            format!("organization_stats:{organization_id}"),
        )?;
        Ok(json!({"candidates": 42, "token_balance": 10000}))
    }
}

// ── Ledger ──────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeLedger {
    pairs: Mutex<Vec<MessagePair>>,
    decrements: Mutex<Vec<(Uuid, i64)>>,
    usage: Mutex<Vec<UsageRecord>>,
    documents: Mutex<HashMap<(Uuid, String, String), (Uuid, GeneratedDocument)>>,
    failing: AtomicBool,
}

impl FakeLedger {
    pub fn fail_writes(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    pub fn message_pairs(&self) -> Vec<MessagePair> {
        self.pairs.lock().unwrap().clone()
    }

    pub fn decrements(&self) -> Vec<(Uuid, i64)> {
        self.decrements.lock().unwrap().clone()
    }

    pub fn usage_records(&self) -> Vec<UsageRecord> {
        self.usage.lock().unwrap().clone()
    }

    pub fn documents(&self) -> Vec<(Uuid, GeneratedDocument)> {
        self.documents.lock().unwrap().values().cloned().collect()
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("ledger unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for FakeLedger {
    async fn append_message_pair(&self, pair: &MessagePair) -> anyhow::Result<()> {
        self.check()?;
        self.pairs.lock().unwrap().push(pair.clone());
        Ok(())
    }

    async fn decrement_tokens(&self, organization_id: Uuid, amount: i64) -> anyhow::Result<()> {
        self.check()?;
        self.decrements.lock().unwrap().push((organization_id, amount));
        Ok(())
    }

    async fn record_usage(&self, record: &UsageRecord) -> anyhow::Result<()> {
        self.check()?;
        self.usage.lock().unwrap().push(record.clone());
        Ok(())
    }

    async fn upsert_document(&self, document: &GeneratedDocument) -> anyhow::Result<Uuid> {
        self.check()?;
        let key = (
            document.organization_id,
            document.operation_type.clone(),
            document.subject_key.clone(),
        );
        let mut documents = self.documents.lock().unwrap();
        let id = documents.get(&key).map(|(id, _)| *id).unwrap_or_else(Uuid::new_v4);
        documents.insert(key, (id, document.clone()));
        Ok(id)
    }
}

// ── Notifier ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeNotifier {
    sent: Mutex<Vec<(Uuid, i64)>>,
}

impl FakeNotifier {
    pub fn notifications(&self) -> Vec<(Uuid, i64)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BalanceNotifier for FakeNotifier {
    async fn balance_changed(&self, organization_id: Uuid, spent: i64) {
        self.sent.lock().unwrap().push((organization_id, spent));
    }
}

// ── Attachments ─────────────────────────────────────────────────────────────

/// Serves fixed bodies by URL; unknown URLs answer 404.
#[derive(Default)]
pub struct FakeAttachments {
    files: HashMap<String, (Bytes, String)>,
}

impl FakeAttachments {
    pub fn with(mut self, url: &str, body: &[u8], content_type: &str) -> Self {
        self.files.insert(
            url.to_string(),
            (Bytes::copy_from_slice(body), content_type.to_string()),
        );
        self
    }
}

#[async_trait]
impl AttachmentSource for FakeAttachments {
    async fn fetch(&self, url: &str) -> Result<FetchedAttachment, AttachmentError> {
        self.files
            .get(url)
            .map(|(bytes, content_type)| FetchedAttachment {
                bytes: bytes.clone(),
                content_type: Some(content_type.clone()),
            })
            .ok_or(AttachmentError::Status(404))
    }
}

// ── Wiring ──────────────────────────────────────────────────────────────────

pub struct Handles {
    pub data: Arc<FakeData>,
    pub ledger: Arc<FakeLedger>,
    pub notifier: Arc<FakeNotifier>,
    pub provider: Option<Arc<ScriptedProvider>>,
}

/// Services over fakes. A non-empty script installs an Anthropic provider.
pub fn services(configs: FakeConfigs, script: Vec<RoundTrip>) -> (AiServices, Handles) {
    let provider = (!script.is_empty())
        .then(|| Arc::new(ScriptedProvider::new(ProviderKind::Anthropic, script)));
    let data = Arc::new(FakeData::default());
    let ledger = Arc::new(FakeLedger::default());
    let notifier = Arc::new(FakeNotifier::default());

    let services = AiServices {
        providers: Arc::new(FakeProviders {
            provider: provider.clone(),
        }),
        configs: Arc::new(configs),
        data: data.clone(),
        ledger: ledger.clone(),
        notifier: notifier.clone(),
    };
    let handles = Handles {
        data,
        ledger,
        notifier,
        provider,
    };
    (services, handles)
}
