//! System prompt assembly and the user turn handed to the provider.
//!
//! Templates use plain `{{name}}` substitution. A placeholder that cannot be
//! resolved is replaced with text telling the model where to look instead,
//! never left dangling.
use std::collections::HashMap;

use chrono::NaiveDate;
use serde_json::Value;

use super::attachment::AttachmentContent;
use super::request::AssistantTurn;
use crate::llm_client::prompts::{self, GROUNDING_INSTRUCTION, LANGUAGE_INSTRUCTION};
use crate::llm_client::Turn;
use crate::models::conversation::{AttachmentDescriptor, HistoryMessage, MessageRole};

pub const IMAGE_DEFAULT_PROMPT: &str = "Analyze this image.";
pub const DOCUMENT_DEFAULT_PROMPT: &str = "Analyze this document.";
pub const UNREADABLE_ATTACHMENT_PROMPT: &str = "I sent a file, but it could not be opened. \
    Tell me so and ask me to try again or paste its content.";

/// `{{name}}` substitution with this module's fallbacks.
pub fn interpolate(template: &str, values: &HashMap<&str, String>) -> String {
    prompts::interpolate(template, values, fallback)
}

fn fallback(name: &str) -> &'static str {
    match name {
        "organization_name" | "organization" => "the organization",
        "funnel_stats" => {
            "Funnel statistics are not loaded. Call get_organization_stats when you need them."
        }
        "focused_entity" => {
            "No specific candidate or vacancy is in focus. Use search_candidates, \
             get_candidate_details or get_vacancy_details when the user refers to one."
        }
        "attachment" => "No file is attached.",
        _ => "Not available. Use the available tools to look this up.",
    }
}

/// Builds the system prompt from the operation's template and the context snapshot.
pub fn system_prompt(
    template: &str,
    snapshot: &Value,
    turn: &AssistantTurn,
    attachment: Option<&AttachmentContent>,
    today: NaiveDate,
) -> String {
    let mut values: HashMap<&str, String> = HashMap::new();

    if let Some(name) = snapshot.pointer("/organization/name").and_then(Value::as_str) {
        values.insert("organization_name", name.to_string());
    }
    if let Some(org) = present(snapshot, &["organization"]) {
        values.insert("organization", prompts::render_value(org));
    }
    if let Some(stats) = present(snapshot, &["funnel_stats", "stats"]) {
        values.insert("funnel_stats", prompts::render_value(stats));
    }
    if let Some(entity) = present(snapshot, &["focused_entity", "entity"]) {
        values.insert("focused_entity", prompts::render_value(entity));
    }
    values.insert("context_type", turn.context_type.as_str().to_string());
    values.insert("language", turn.language.clone());
    values.insert("current_date", today.format("%Y-%m-%d").to_string());
    if let (Some(content), Some(descriptor)) = (attachment, turn.attachment.as_ref()) {
        values.insert("attachment", describe_attachment(content, descriptor));
    }

    let full = format!("{template}\n\n{GROUNDING_INSTRUCTION}\n{LANGUAGE_INSTRUCTION}");
    interpolate(&full, &values)
}

/// First non-empty value under any of `keys`.
fn present<'a>(snapshot: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().filter_map(|k| snapshot.get(*k)).find(|v| match v {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::String(s) => !s.trim().is_empty(),
        _ => true,
    })
}

fn display_name(descriptor: &AttachmentDescriptor) -> &str {
    descriptor.name.as_deref().unwrap_or("unnamed file")
}

fn describe_attachment(content: &AttachmentContent, descriptor: &AttachmentDescriptor) -> String {
    match content {
        AttachmentContent::Image(_) => format!(
            "The user attached an image ('{}'). It is included with their message.",
            display_name(descriptor)
        ),
        AttachmentContent::Document { truncated, .. } => format!(
            "The user attached a document ('{}'). Its extracted text{} follows their message.",
            display_name(descriptor),
            if *truncated { ", truncated," } else { "" }
        ),
    }
}

/// The final user turn. Images ride along as a multimodal part; document
/// text is merged into the message. Returns the turn and the text to persist
/// as the user's message.
pub fn user_turn(turn: &AssistantTurn, attachment: Option<&AttachmentContent>) -> (Turn, String) {
    let typed = (!turn.message.is_empty()).then(|| turn.message.clone());
    match (attachment, turn.attachment.as_ref()) {
        (Some(AttachmentContent::Image(image)), _) => {
            let text = typed.unwrap_or_else(|| IMAGE_DEFAULT_PROMPT.to_string());
            (
                Turn::User {
                    text: text.clone(),
                    image: Some(image.clone()),
                },
                text,
            )
        }
        (Some(AttachmentContent::Document { text, truncated }), Some(descriptor)) => {
            let prompt = typed.unwrap_or_else(|| DOCUMENT_DEFAULT_PROMPT.to_string());
            let merged = format!(
                "{prompt}\n\n--- Attached document: {} ---\n{text}{}\n--- End of document ---",
                display_name(descriptor),
                if *truncated { "\n[document truncated]" } else { "" }
            );
            (Turn::user(merged), prompt)
        }
        _ => {
            let text = typed.unwrap_or_else(|| UNREADABLE_ATTACHMENT_PROMPT.to_string());
            (Turn::user(text.clone()), text)
        }
    }
}

/// Prior turns, alternating and starting at the first user message. Runs of
/// one role are joined. A trailing user message never got an answer and the
/// new user turn follows it, so it is dropped.
pub fn history_turns(history: &[HistoryMessage]) -> Vec<Turn> {
    let mut runs: Vec<(MessageRole, String)> = Vec::new();
    for message in history.iter().skip_while(|m| m.role == MessageRole::Assistant) {
        match runs.last_mut() {
            Some((role, text)) if *role == message.role => {
                text.push_str("\n\n");
                text.push_str(&message.content);
            }
            _ => runs.push((message.role, message.content.clone())),
        }
    }
    if matches!(runs.last(), Some((MessageRole::User, _))) {
        runs.pop();
    }

    runs.into_iter()
        .map(|(role, text)| match role {
            MessageRole::User => Turn::user(text),
            MessageRole::Assistant => Turn::assistant(text),
        })
        .collect()
}
