//! Research plan generation
//! One structured-output request, parsed as a strict three-entry array;
//! any failure falls back to a fixed plan instead of surfacing an error.

use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::warn;

use crate::providers::GenerationBackend;

pub const PLAN_PROMPT: &str = r#"You are planning a deep research session. Produce a JSON array of exactly three strings, in this order:

1. A survey entry: a short header line, then 5-8 numbered investigation goals, one per line, each line starting with "(<number>)". Goals must be specific, technical and cover distinct angles of the query.
2. An analyze entry: one line describing how the collected findings will be cross-checked and analyzed.
3. A report entry: one line describing the structured report that will be produced.

Return ONLY the JSON array of three strings. No markdown fences, no commentary."#;

/// A sub-task line begins with "(", one or more digits, ")"; the goal text
/// is whatever follows.
static GOAL_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\(\d+\)\s*(.+)$").expect("goal line pattern is valid")
});

/// Generates the three-phase research plan shown to the user for
/// confirmation. Never fails and never returns an empty survey.
pub struct ResearchPlanner {
    backend: Arc<dyn GenerationBackend>,
}

impl ResearchPlanner {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    pub async fn create_plan(&self, query: &str) -> Vec<String> {
        let prompt = format!("{}\n\nResearch query: {}", PLAN_PROMPT, query);
        match self.backend.create_plan(&prompt).await {
            Ok(text) => parse_plan_text(&text).unwrap_or_else(|| {
                warn!("plan response did not parse as three entries, using fallback");
                fallback_plan()
            }),
            Err(err) => {
                warn!("plan request failed, using fallback: {err}");
                fallback_plan()
            }
        }
    }
}

/// The fixed plan used when generation fails or yields unparseable output.
pub fn fallback_plan() -> Vec<String> {
    vec![
        "Survey the topic from multiple angles\n\
         (1) Gather background, definitions and essential context\n\
         (2) Collect recent developments and notable announcements\n\
         (3) Find concrete data, figures and real-world examples"
            .to_string(),
        "Analyze and cross-check the collected findings".to_string(),
        "Compose a structured, cited report".to_string(),
    ]
}

/// Extract the numbered goal lines of a survey entry. Lines are trimmed
/// before matching; non-matching lines (headers, prose) are skipped.
pub fn extract_numbered_goals(survey: &str) -> Vec<String> {
    survey
        .lines()
        .filter_map(|line| {
            GOAL_LINE
                .captures(line.trim())
                .map(|caps| caps[1].trim().to_string())
        })
        .collect()
}

fn parse_plan_text(text: &str) -> Option<Vec<String>> {
    let entries: Vec<String> = serde_json::from_str(strip_code_fences(text)).ok()?;
    (entries.len() == 3).then_some(entries)
}

/// Models often wrap JSON in a code fence despite instructions; strip it
/// before parsing.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim()
}
