// AI assistant: streaming, tool-calling conversation turns.
// Flow: request validation → config resolution → orchestrator (prompt, provider
// round-trips, tool dispatch) → SSE frames → settle (messages, tokens, usage).
pub mod attachment;
pub mod handlers;
pub mod orchestrator;
pub mod prompt;
pub mod request;
pub mod stream;
pub mod tools;
