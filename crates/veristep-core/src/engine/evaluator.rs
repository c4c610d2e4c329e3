//! Sequential, short-circuiting case evaluation.
//!
//! Steps are judged strictly in order; step N+1 is never dispatched before
//! step N's verdict is known, because both the carried history and the stop
//! decision depend on it.

use crate::config::RunnerSettings;
use crate::judge;
use crate::model::{CaseOutcome, FinalResult, HistoryStep, StepRecord, Verdict};
use crate::plan::Plan;
use crate::providers::llm::LlmClient;
use crate::storage::{ExampleStore, RuleStore};
use crate::verdict;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Cooperative cancellation flag, checked between steps and between retries,
/// never mid-call.
pub type CancelFlag = Arc<AtomicBool>;

#[derive(Debug, Clone)]
pub struct EvalOptions {
    /// Total judge attempts per step before giving up with NeedDiscussion.
    pub max_judge_attempts: u32,
    pub retry_delay: Duration,
    /// Pacing delay before the first judge call of a case.
    pub pre_call_delay: Duration,
}

impl Default for EvalOptions {
    fn default() -> Self {
        Self::from(&RunnerSettings::default())
    }
}

impl From<&RunnerSettings> for EvalOptions {
    fn from(s: &RunnerSettings) -> Self {
        Self {
            max_judge_attempts: s.max_judge_retries.max(1),
            retry_delay: Duration::from_millis(s.retry_delay_ms),
            pre_call_delay: Duration::from_millis(s.pre_call_delay_ms),
        }
    }
}

pub struct Evaluator {
    client: Arc<dyn LlmClient>,
    rules: Arc<dyn RuleStore>,
    examples: Arc<dyn ExampleStore>,
    opts: EvalOptions,
}

impl Evaluator {
    pub fn new(
        client: Arc<dyn LlmClient>,
        rules: Arc<dyn RuleStore>,
        examples: Arc<dyn ExampleStore>,
        opts: EvalOptions,
    ) -> Self {
        Self {
            client,
            rules,
            examples,
            opts,
        }
    }

    pub fn options(&self) -> &EvalOptions {
        &self.opts
    }

    /// Walk the plan step by step. Stops at the first non-Correct verdict;
    /// a case whose every step is Correct terminates with no stopping step.
    pub async fn evaluate(&self, plan: &Plan, cancel: &CancelFlag) -> anyhow::Result<CaseOutcome> {
        let total = plan.steps.len();
        info!(steps = total, "starting sequential evaluation");

        if !self.opts.pre_call_delay.is_zero() {
            tokio::time::sleep(self.opts.pre_call_delay).await;
        }

        let mut history: Vec<HistoryStep> = Vec::new();
        for step in &plan.steps {
            if cancel.load(Ordering::Relaxed) {
                anyhow::bail!("case evaluation cancelled at step {}", step.step_number);
            }

            let verdict = match self.judge_step(step, &history, plan, cancel).await? {
                Some(v) => v,
                None => {
                    return Ok(CaseOutcome::need_discussion(
                        Some(step.step_number),
                        format!(
                            "{}: judge returned no usable verdict for step {} after {} attempts",
                            verdict::MANUAL_REVIEW_REASON,
                            step.step_number,
                            self.opts.max_judge_attempts
                        ),
                    ));
                }
            };

            if verdict.result == FinalResult::Correct {
                debug!(step = step.step_number, total, "step judged Correct");
                history.push(HistoryStep {
                    step_number: step.step_number,
                    final_result: FinalResult::Correct,
                    reason: String::new(),
                });
                continue;
            }

            let reason = if verdict.reason.trim().is_empty() {
                "No reason provided".to_string()
            } else {
                verdict.reason
            };
            info!(
                step = step.step_number,
                result = %verdict.result,
                "stopping evaluation at first non-Correct step"
            );
            return Ok(CaseOutcome::stopped(step.step_number, verdict.result, reason));
        }

        Ok(CaseOutcome::correct())
    }

    /// Judge one step with bounded retries on judge failure or unparsable
    /// output. `Ok(None)` means every allowed attempt was exhausted.
    async fn judge_step(
        &self,
        step: &StepRecord,
        history: &[HistoryStep],
        plan: &Plan,
        cancel: &CancelFlag,
    ) -> anyhow::Result<Option<Verdict>> {
        let rule = match step.step_type {
            Some(t) => self.rules.load(t).await?.unwrap_or_default(),
            None => String::new(),
        };

        let example_reason = match step.step_type {
            Some(t) => match self.examples.success_reason(t, &step.actual_text).await {
                Ok(r) => r,
                Err(e) => {
                    // Example attachment is best-effort context, not evidence.
                    warn!(error = %e, "example-case lookup failed; judging without it");
                    None
                }
            },
            None => None,
        };

        let duplicates = judge::duplicates_up_to(&plan.duplicate_groups, step.step_number);
        let content = judge::step_user_content(step, &duplicates, example_reason.as_deref());
        let system = judge::comparison_system_prompt(&rule, history);

        for attempt in 1..=self.opts.max_judge_attempts {
            if cancel.load(Ordering::Relaxed) {
                anyhow::bail!("case evaluation cancelled at step {}", step.step_number);
            }
            match self.client.complete(&system, &content).await {
                Ok(resp) => match verdict::parse_verdict(&resp.text) {
                    Some(v) => return Ok(Some(v)),
                    None => warn!(
                        step = step.step_number,
                        attempt, "judge output unparsable, retrying"
                    ),
                },
                Err(e) => warn!(
                    step = step.step_number,
                    attempt,
                    error = %e,
                    "judge call failed, retrying"
                ),
            }
            if attempt < self.opts.max_judge_attempts {
                tokio::time::sleep(self.opts.retry_delay).await;
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CaseOutcome, ContentPart, StepType};
    use crate::providers::llm::FakeClient;
    use crate::storage::{FsRuleStore, JsonExampleStore};
    use tempfile::TempDir;

    fn correct() -> String {
        r#"{"final_summary": {"final_result": "Correct", "reason": "ok"}}"#.to_string()
    }

    fn incorrect(reason: &str) -> String {
        format!(
            r#"{{"final_summary": {{"final_result": "Incorrect", "reason": "{}"}}}}"#,
            reason
        )
    }

    fn step(n: u32, evidence: Option<&str>) -> StepRecord {
        StepRecord {
            step_number: n,
            step_type: Some(StepType::Navigation),
            standard_text: format!("standard {}", n),
            ai_text: format!("restated {}", n),
            actual_text: format!("actual {}", n),
            standard_image: None,
            actual_image: evidence.map(str::to_string),
            multi_action: false,
        }
    }

    fn plan(steps: Vec<StepRecord>, groups: Vec<Vec<u32>>) -> Plan {
        Plan {
            steps,
            duplicate_groups: groups,
        }
    }

    struct Harness {
        _tmp: TempDir,
        client: Arc<FakeClient>,
        evaluator: Evaluator,
    }

    fn harness(responses: Vec<String>) -> Harness {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::scripted(responses));
        let rules = Arc::new(FsRuleStore::new(tmp.path().join("rules")));
        let examples = Arc::new(JsonExampleStore::new(tmp.path().join("cases.json")));
        let opts = EvalOptions {
            max_judge_attempts: 2,
            retry_delay: Duration::from_millis(1),
            pre_call_delay: Duration::ZERO,
        };
        let evaluator = Evaluator::new(client.clone(), rules, examples, opts);
        Harness {
            _tmp: tmp,
            client,
            evaluator,
        }
    }

    fn no_cancel() -> CancelFlag {
        Arc::new(AtomicBool::new(false))
    }

    #[tokio::test]
    async fn all_correct_yields_correct_case_outcome() {
        let h = harness(vec![correct(), correct(), correct()]);
        let p = plan(vec![step(1, None), step(2, None), step(3, None)], vec![]);
        let outcome = h.evaluator.evaluate(&p, &no_cancel()).await.unwrap();
        assert_eq!(
            outcome,
            CaseOutcome {
                final_result: FinalResult::Correct,
                stopping_step: None,
                reason: String::new(),
            }
        );
        assert_eq!(h.client.call_count(), 3);
    }

    #[tokio::test]
    async fn stops_at_first_non_correct_step() {
        // Only two responses scripted: a third call would error, and the
        // assertion on call_count would catch any short-circuit violation.
        let h = harness(vec![correct(), incorrect("wrong page")]);
        let p = plan(vec![step(1, None), step(2, None), step(3, None)], vec![]);
        let outcome = h.evaluator.evaluate(&p, &no_cancel()).await.unwrap();
        assert_eq!(outcome.final_result, FinalResult::Incorrect);
        assert_eq!(outcome.stopping_step, Some(2));
        assert_eq!(outcome.reason, "wrong page");
        assert_eq!(h.client.call_count(), 2, "step 3 must never reach the judge");
    }

    #[tokio::test]
    async fn history_carries_only_correct_steps() {
        let h = harness(vec![correct(), incorrect("mismatch")]);
        let p = plan(vec![step(1, None), step(2, None)], vec![]);
        h.evaluator.evaluate(&p, &no_cancel()).await.unwrap();

        let calls = h.client.calls();
        assert!(!calls[0].system_prompt.contains("\"step_number\":1"));
        assert!(calls[1].system_prompt.contains("\"step_number\":1"));
        assert!(calls[1].system_prompt.contains("\"final_result\":\"Correct\""));
    }

    #[tokio::test]
    async fn unparsable_output_is_retried_then_succeeds() {
        let h = harness(vec!["garbage".to_string(), correct()]);
        let p = plan(vec![step(1, None)], vec![]);
        let outcome = h.evaluator.evaluate(&p, &no_cancel()).await.unwrap();
        assert_eq!(outcome.final_result, FinalResult::Correct);
        assert_eq!(h.client.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_attempts_surface_as_need_discussion() {
        let h = harness(vec!["garbage".to_string(), "more garbage".to_string()]);
        let p = plan(vec![step(1, None), step(2, None)], vec![]);
        let outcome = h.evaluator.evaluate(&p, &no_cancel()).await.unwrap();
        assert_eq!(outcome.final_result, FinalResult::NeedDiscussion);
        assert_eq!(outcome.stopping_step, Some(1));
        assert!(outcome.reason.starts_with(verdict::MANUAL_REVIEW_REASON));
        assert!(outcome.reason.contains("after 2 attempts"));
        // Step 2 was never dispatched.
        assert_eq!(h.client.call_count(), 2);
    }

    #[tokio::test]
    async fn duplicate_context_is_limited_to_past_steps() {
        let h = harness(vec![correct(), correct(), correct(), correct()]);
        let steps = vec![
            step(1, Some("https://h/a.png")),
            step(2, Some("https://h/b.png")),
            step(3, Some("https://h/a.png")),
            step(4, Some("https://h/c.png")),
        ];
        let p = plan(steps, vec![vec![1, 3]]);
        h.evaluator.evaluate(&p, &no_cancel()).await.unwrap();

        let calls = h.client.calls();
        let dup_text = |i: usize| -> Option<String> {
            calls[i].user_content.iter().find_map(|c| match c {
                ContentPart::Text { text } if text.starts_with("Duplicate image") => {
                    Some(text.clone())
                }
                _ => None,
            })
        };
        // Step 1 sees only itself, never a forward reference to step 3.
        assert_eq!(
            dup_text(0).unwrap(),
            "Duplicate image step numbers:[1], please consider this information when making judgments."
        );
        // Ungrouped steps still receive the line, with an empty list.
        assert!(dup_text(1).unwrap().contains("numbers:[]"));
        assert!(dup_text(2).unwrap().contains("[1, 3]"));
        assert!(dup_text(3).unwrap().contains("numbers:[]"));
    }

    #[tokio::test]
    async fn cancellation_aborts_between_steps() {
        let h = harness(vec![correct(), correct()]);
        let p = plan(vec![step(1, None), step(2, None)], vec![]);
        let cancel = no_cancel();
        cancel.store(true, Ordering::Relaxed);
        let err = h.evaluator.evaluate(&p, &cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert_eq!(h.client.call_count(), 0);
    }

    #[tokio::test]
    async fn empty_plan_is_trivially_correct() {
        let h = harness(vec![]);
        let p = plan(vec![], vec![]);
        let outcome = h.evaluator.evaluate(&p, &no_cancel()).await.unwrap();
        assert_eq!(outcome.final_result, FinalResult::Correct);
    }
}
