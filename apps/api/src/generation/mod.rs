// Single-shot AI operations: document generation, full analysis, candidate
// comparison and ideal-profile generation.
// All LLM calls go through llm_client; no direct vendor calls here.

pub mod generator;
pub mod handlers;
pub mod prompts;
