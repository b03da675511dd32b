// Prompt text for single-shot generation operations.
// The operator-editable system prompt comes from the operation's config row;
// these are the task instructions appended to the user turn.

/// Candidate report. Placeholders are filled by `generator::build_prompts`.
pub const DOCUMENT_GENERATION_TASK: &str = "\
Write a recruiter-facing candidate report in Markdown with these sections:
## Summary
## Strengths
## Risks and open questions
## Psychometric profile
## Recommendation
Use only the candidate data below.";

pub const FULL_ANALYSIS_TASK: &str = "\
Write a full analysis of the candidate in Markdown. Cover professional background, \
skills against the vacancy requirements (if a vacancy is given), every psychometric test \
result with its interpretation, interview observations, culture fit and a final hiring \
recommendation with a confidence level.";

pub const CANDIDATE_COMPARISON_TASK: &str = "\
Compare the candidates below in Markdown. Start with a comparison table (one column per \
candidate), then discuss the meaningful differences and finish with a ranked recommendation. \
If a vacancy is given, rank against its requirements.";

pub const IDEAL_PROFILE_TASK: &str = r#"Describe the ideal candidate for the vacancy below.

Return a JSON object with this EXACT schema:
{
  "summary": "two or three sentences",
  "psychometric_traits": [
    {"trait": "conscientiousness", "target": 75, "weight": 0.3, "rationale": "why it matters"}
  ],
  "required_skills": ["..."],
  "preferred_skills": ["..."],
  "red_flags": ["..."],
  "interview_focus": ["..."]
}
"target" is 0-100 and the weights sum to 1.0."#;

/// User turn template. `{{subject}}` is the JSON context of the candidates/vacancy.
pub const GENERATION_USER_TEMPLATE: &str = "\
{{task}}

Data:
{{subject}}

Additional instructions from the recruiter: {{instructions}}";

pub fn fallback(name: &str) -> &'static str {
    match name {
        "instructions" => "none.",
        "vacancy" => "No vacancy was specified.",
        "candidate" | "candidates" => "No candidate data was provided.",
        _ => "Not provided.",
    }
}
