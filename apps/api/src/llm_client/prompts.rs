// Shared prompt fragments used by more than one AI feature.
// Feature-specific prompt text lives next to the feature (assistant/prompt.rs,
// generation/prompts.rs); operator-editable templates live in the database.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde_json::Value;

/// Appended to the system prompt of operations whose output must be machine-readable.
pub const JSON_ONLY_INSTRUCTION: &str = "You MUST respond with valid JSON only. \
    Do NOT include any text outside the JSON object. \
    Do NOT use markdown code fences. \
    Do NOT include explanations or apologies.";

/// Appended to every system prompt so answers follow the caller's locale.
pub const LANGUAGE_INSTRUCTION: &str =
    "Always answer in the language identified by this locale tag: {{language}}.";

/// Keeps the model from inventing people or numbers it was not given.
pub const GROUNDING_INSTRUCTION: &str = "\
    Base every statement about candidates, vacancies or metrics on the data provided \
    in this prompt or returned by a tool. If the data is not available, say so instead \
    of guessing.";

static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();

fn placeholder() -> &'static Regex {
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("Invalid placeholder pattern")
    })
}

/// Replaces every `{{name}}` in `template` with its value, or with
/// `fallback(name)` when no value is known. Plain substitution: values are
/// inserted verbatim and never re-scanned.
pub fn interpolate(
    template: &str,
    values: &HashMap<&str, String>,
    fallback: fn(&str) -> &'static str,
) -> String {
    placeholder()
        .replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            values
                .get(name)
                .cloned()
                .unwrap_or_else(|| fallback(name).to_string())
        })
        .into_owned()
}

/// Strings as-is, everything else as pretty JSON.
pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => serde_json::to_string_pretty(other).unwrap_or_else(|_| other.to_string()),
    }
}
