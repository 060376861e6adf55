//! Deep research orchestration
//! Sequential grounded survey over the plan's sub-tasks, then one streamed
//! synthesis report. Cancellation is checked before every request and
//! between stream chunks; a failed sub-task never aborts the run.

use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::modules::research_plan::extract_numbered_goals;
use crate::providers::{
    GenerateOptions, GenerationBackend, GenerationError, GroundingUrl, DEFAULT_PRO_MODEL,
};

/// Progress index reported while sub-task searches run
pub const SURVEY_PHASE: usize = 0;
/// Progress index reported while the report streams
pub const REPORT_PHASE: usize = 1;

const UNAVAILABLE_NOTE: &str = "Search was unavailable for this sub-task.";

const REPORT_SYSTEM_INSTRUCTION: &str = "You are an expert research writer. Produce a \
structured, cited, narrative report in markdown. Keep claims tied to the findings you were \
given and stay specific and quantitative where the findings allow.";

#[derive(Debug, thiserror::Error)]
pub enum ResearchError {
    /// User-initiated stop. Callers must treat this as a non-error and never
    /// surface it as a failure message.
    #[error("research was cancelled")]
    Cancelled,
    #[error(transparent)]
    Generation(#[from] GenerationError),
}

#[derive(Debug, Default)]
pub struct ResearchOutcome {
    /// Deduplicated union of grounding references across successful sub-tasks
    pub grounding_urls: Vec<GroundingUrl>,
}

pub struct DeepResearchService {
    backend: Arc<dyn GenerationBackend>,
}

impl DeepResearchService {
    pub fn new(backend: Arc<dyn GenerationBackend>) -> Self {
        Self { backend }
    }

    /// Run the survey and report phases for a confirmed plan.
    ///
    /// `steps` is the (possibly user-edited) plan; sub-tasks come from the
    /// numbered lines of its first entry, degrading to the original query
    /// when none match. `on_progress` receives the active phase index and
    /// `on_chunk` each non-empty report delta.
    pub async fn execute(
        &self,
        query: &str,
        steps: &[String],
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(usize) + Send,
        mut on_chunk: impl FnMut(&str) + Send,
    ) -> Result<ResearchOutcome, ResearchError> {
        let sub_tasks = derive_sub_tasks(query, steps);
        info!("starting deep research with {} sub-tasks", sub_tasks.len());

        let mut findings = Vec::with_capacity(sub_tasks.len());
        let mut urls = Vec::new();

        for task in &sub_tasks {
            if cancel.is_cancelled() {
                return Err(ResearchError::Cancelled);
            }
            on_progress(SURVEY_PHASE);

            match self.backend.search(&search_prompt(task)).await {
                Ok(found) => {
                    findings.push(format!("## {}\n\n{}", task, found.text));
                    urls.extend(found.grounding_urls);
                }
                Err(err) => {
                    warn!("sub-task search failed, continuing: {err}");
                    findings.push(format!("## {}\n\n{}", task, UNAVAILABLE_NOTE));
                }
            }
        }

        if cancel.is_cancelled() {
            return Err(ResearchError::Cancelled);
        }
        on_progress(REPORT_PHASE);

        let options = GenerateOptions {
            model: DEFAULT_PRO_MODEL.to_string(),
            system_instruction: Some(REPORT_SYSTEM_INSTRUCTION.to_string()),
            ..Default::default()
        };
        let mut stream = self
            .backend
            .stream_generate(&report_prompt(query, &findings), &options)
            .await?;

        while let Some(delta) = stream.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let delta = delta.map_err(ResearchError::Generation)?;
            if !delta.text.is_empty() {
                on_chunk(&delta.text);
            }
        }

        Ok(ResearchOutcome {
            grounding_urls: dedup_grounding_urls(urls),
        })
    }
}

/// Sub-tasks are the numbered lines of the survey entry; a plan without any
/// degrades to the original query so there is always at least one unit of
/// work.
fn derive_sub_tasks(query: &str, steps: &[String]) -> Vec<String> {
    let goals = steps
        .first()
        .map(|survey| extract_numbered_goals(survey))
        .unwrap_or_default();
    if goals.is_empty() {
        vec![query.to_string()]
    } else {
        goals
    }
}

fn search_prompt(task: &str) -> String {
    format!(
        "Investigate the following research goal. Report concrete, technical, quantitative \
         findings rather than generic summary, and name your sources.\n\nGoal: {}",
        task
    )
}

fn report_prompt(query: &str, findings: &[String]) -> String {
    format!(
        "Write the final deep-research report.\n\nOriginal query: {}\n\nFindings gathered \
         during the survey phase:\n\n{}",
        query,
        findings.join("\n\n")
    )
}

/// Drop exact (title, uri) duplicates, keeping first appearance order.
fn dedup_grounding_urls(urls: Vec<GroundingUrl>) -> Vec<GroundingUrl> {
    let mut seen = HashSet::new();
    urls.into_iter()
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::test_support::{delta, outcome, url, MockBackend};
    use std::sync::Mutex;

    const STEPS: &[&str] = &[
        "Survey the topic\n(1) goal one\n(2) goal two\n(3) goal three",
        "Analyze the findings",
        "Write the report",
    ];

    fn steps() -> Vec<String> {
        STEPS.iter().map(|s| s.to_string()).collect()
    }

    fn service(backend: Arc<MockBackend>) -> DeepResearchService {
        DeepResearchService::new(backend)
    }

    #[tokio::test]
    async fn executes_sub_tasks_in_order_then_streams_report() {
        let backend = Arc::new(MockBackend::new());
        backend.push_search(Ok(outcome("first", vec![url("A", "https://a")])));
        backend.push_search(Ok(outcome("second", vec![url("B", "https://b")])));
        backend.push_search(Ok(outcome("third", vec![url("A", "https://a")])));
        backend.set_report_chunks(vec![delta("part one, "), delta(""), delta("part two")]);

        let progress = Mutex::new(Vec::new());
        let content = Mutex::new(String::new());
        let outcome = service(backend.clone())
            .execute(
                "the query",
                &steps(),
                &CancellationToken::new(),
                |phase| progress.lock().unwrap().push(phase),
                |chunk| content.lock().unwrap().push_str(chunk),
            )
            .await
            .unwrap();

        let prompts = backend.search_prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 3);
        assert!(prompts[0].contains("goal one"));
        assert!(prompts[1].contains("goal two"));
        assert!(prompts[2].contains("goal three"));
        assert_eq!(backend.report_count(), 1);

        assert_eq!(
            *progress.lock().unwrap(),
            vec![SURVEY_PHASE, SURVEY_PHASE, SURVEY_PHASE, REPORT_PHASE]
        );
        assert_eq!(*content.lock().unwrap(), "part one, part two");
        // duplicates collapse, first-appearance order kept
        assert_eq!(
            outcome.grounding_urls,
            vec![url("A", "https://a"), url("B", "https://b")]
        );
    }

    #[tokio::test]
    async fn failed_sub_task_is_isolated_and_run_continues() {
        let backend = Arc::new(MockBackend::new());
        backend.push_search(Ok(outcome("fine", vec![url("A", "https://a")])));
        backend.push_search(Err(GenerationError::Other("search down".to_string())));
        backend.push_search(Ok(outcome("also fine", Vec::new())));

        let outcome = service(backend.clone())
            .execute(
                "the query",
                &steps(),
                &CancellationToken::new(),
                |_| {},
                |_| {},
            )
            .await
            .unwrap();

        // all three sub-tasks produce a finding block, the failed one a placeholder
        let report_prompt = backend.report_prompts.lock().unwrap()[0].clone();
        assert_eq!(report_prompt.matches("## goal").count(), 3);
        assert!(report_prompt.contains(UNAVAILABLE_NOTE));
        assert_eq!(outcome.grounding_urls, vec![url("A", "https://a")]);
    }

    #[tokio::test]
    async fn cancellation_before_start_issues_no_requests() {
        let backend = Arc::new(MockBackend::new());
        let token = CancellationToken::new();
        token.cancel();

        let result = service(backend.clone())
            .execute("the query", &steps(), &token, |_| {}, |_| {})
            .await;

        assert!(matches!(result, Err(ResearchError::Cancelled)));
        assert_eq!(backend.search_count(), 0);
        assert_eq!(backend.report_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_survey_skips_remaining_work_and_report() {
        let backend = Arc::new(MockBackend::new());
        let token = CancellationToken::new();
        backend.cancel_after_searches(1, token.clone());

        let result = service(backend.clone())
            .execute("the query", &steps(), &token, |_| {}, |_| {})
            .await;

        assert!(matches!(result, Err(ResearchError::Cancelled)));
        assert_eq!(backend.search_count(), 1);
        assert_eq!(backend.report_count(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_stream_stops_without_error() {
        let backend = Arc::new(MockBackend::new());
        backend.set_report_chunks(vec![delta("kept"), delta(" dropped")]);
        let token = CancellationToken::new();

        let content = Mutex::new(String::new());
        let result = service(backend.clone())
            .execute(
                "the query",
                &steps(),
                &token,
                |_| {},
                |chunk| {
                    content.lock().unwrap().push_str(chunk);
                    token.cancel();
                },
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(*content.lock().unwrap(), "kept");
    }

    #[tokio::test]
    async fn report_phase_failure_propagates() {
        let backend = Arc::new(MockBackend::new());
        backend.set_report_error(GenerationError::Other("synthesis down".to_string()));

        let result = service(backend.clone())
            .execute(
                "the query",
                &steps(),
                &CancellationToken::new(),
                |_| {},
                |_| {},
            )
            .await;

        assert!(matches!(result, Err(ResearchError::Generation(_))));
    }

    #[tokio::test]
    async fn plan_without_numbered_lines_degrades_to_the_query() {
        let backend = Arc::new(MockBackend::new());
        let free_text_steps = vec![
            "Just look into it".to_string(),
            "Analyze".to_string(),
            "Report".to_string(),
        ];

        service(backend.clone())
            .execute(
                "量子コンピュータの最新動向",
                &free_text_steps,
                &CancellationToken::new(),
                |_| {},
                |_| {},
            )
            .await
            .unwrap();

        let prompts = backend.search_prompts.lock().unwrap().clone();
        assert_eq!(prompts.len(), 1);
        assert!(prompts[0].contains("量子コンピュータの最新動向"));
    }

    #[tokio::test]
    async fn edited_sub_task_text_is_what_gets_searched() {
        let backend = Arc::new(MockBackend::new());
        let edited = vec![
            "Survey the topic\n(1) goal one\n(2) goal two, narrowed to 2024 hardware\n(3) goal three"
                .to_string(),
            "Analyze".to_string(),
            "Report".to_string(),
        ];

        service(backend.clone())
            .execute(
                "the query",
                &edited,
                &CancellationToken::new(),
                |_| {},
                |_| {},
            )
            .await
            .unwrap();

        let prompts = backend.search_prompts.lock().unwrap().clone();
        assert!(prompts[1].contains("goal two, narrowed to 2024 hardware"));
    }

    #[test]
    fn dedup_keeps_first_appearance_order() {
        let urls = vec![
            url("A", "https://a"),
            url("B", "https://b"),
            url("A", "https://a"),
            url("A", "https://a2"),
        ];
        assert_eq!(
            dedup_grounding_urls(urls),
            vec![
                url("A", "https://a"),
                url("B", "https://b"),
                url("A", "https://a2"),
            ]
        );
    }
}
