//! Rule-rewriting correction loop driven by a human-corrected outcome.
//!
//! Given a plan and the result a human says the case should have produced,
//! the optimizer locates the divergence step, re-judges each step up to it,
//! and asks the model to rewrite the step-type rule whenever the verdict
//! disagrees with the desired one. Rewritten rules are persisted and the
//! whole case is re-evaluated as a verification pass.

use crate::engine::{CancelFlag, Evaluator};
use crate::judge;
use crate::model::{
    CaseOutcome, ContentPart, ExampleCase, FinalResult, HistoryStep, StepRecord, StepType,
};
use crate::plan::Plan;
use crate::providers::llm::LlmClient;
use crate::storage::{ExampleStore, RuleStore};
use crate::verdict;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, OnceLock};
use tracing::{info, warn};

/// Locates the smallest offending step number inside a free-text correction
/// reason when no explicit `Step Number:` marker is present.
const IDENTIFY_SYSTEM_PROMPT: &str = r#"## ROLE
You are a top-tier prompt engineer expert.

## INPUT VARIABLES
human_judge: {human_judge}
result_reason: {result_reason}

## Output JSON Format
Output actions for EACH Section in the following JSON format:
{
    "result_number": "If result_reason is not empty, return the smallest step number in the result where the problem exists"
}"#;

/// Asks the model to rewrite a step-type rule so AI and human judgments agree.
const OPTIMIZATION_SYSTEM_PROMPT: &str = r#"## ROLE
You are a top-tier functional testing expert, proficient in functional testing and prompt development.

## GOAL
Optimize the rule based on results to ensure consistency between AI and human results.

## INPUT VARIABLES
Correct_Result: {human_judge_result}
Correct_Reason: {human_judge_reason}
AI_Judgment_Result: {ai_judge_result}
AI_Judgment_Reason: {ai_judge_reason}
History_Rule: {history_rule}

## Output JSON Format
Output actions for EACH Section in the following JSON format:
{
    "step_type_rule": "<the full updated step type rule>"
}"#;

pub struct Optimizer {
    client: Arc<dyn LlmClient>,
    rules: Arc<dyn RuleStore>,
    examples: Arc<dyn ExampleStore>,
    /// Hard cap on correction rounds per step.
    max_rounds: u32,
}

impl Optimizer {
    pub fn new(
        client: Arc<dyn LlmClient>,
        rules: Arc<dyn RuleStore>,
        examples: Arc<dyn ExampleStore>,
        max_rounds: u32,
    ) -> Self {
        Self {
            client,
            rules,
            examples,
            max_rounds: max_rounds.max(1),
        }
    }

    /// Run the correction loop for one case, then re-evaluate the plan with
    /// the persisted rules and return the verification outcome.
    ///
    /// `human_label` is the corrected final result; `human_reason` the
    /// human's explanation, which may carry an explicit `Step Number: N`.
    pub async fn optimize(
        &self,
        plan: &Plan,
        human_label: &str,
        human_reason: &str,
        evaluator: &Evaluator,
        cancel: &CancelFlag,
    ) -> anyhow::Result<CaseOutcome> {
        if plan.steps.is_empty() {
            return Ok(CaseOutcome::need_discussion(
                None,
                "empty plan; nothing to optimize",
            ));
        }

        // Human labels arrive in looser forms than judge output (yes/no,
        // pass/fail, 0/1). Anything outside that vocabulary is rejected up
        // front rather than silently treated as NeedDiscussion.
        let human_result = match verdict::normalize_human_label(human_label) {
            Some(r) => r,
            None => {
                return Ok(CaseOutcome::need_discussion(
                    None,
                    format!("unrecognized human label {:?}; cannot optimize", human_label),
                ));
            }
        };
        let divergence = self.divergence_step(plan, human_label, human_reason).await;
        let human_reason = human_reason.trim();
        info!(divergence, %human_result, "starting rule optimization");

        let mut rule_cache: HashMap<StepType, String> = HashMap::new();
        let mut touched: HashSet<StepType> = HashSet::new();
        let mut history: Vec<HistoryStep> = Vec::new();

        for step in &plan.steps {
            if step.step_number > divergence {
                break;
            }
            if cancel.load(Ordering::Relaxed) {
                anyhow::bail!("optimization cancelled at step {}", step.step_number);
            }

            let step_type = match step.step_type {
                Some(t) => t,
                None => {
                    return Ok(CaseOutcome::need_discussion(
                        Some(step.step_number),
                        format!(
                            "step {} has no recognized step type; cannot optimize its rule",
                            step.step_number
                        ),
                    ));
                }
            };

            let mut rule = match rule_cache.get(&step_type) {
                Some(r) => r.clone(),
                None => match self.rules.load(step_type).await {
                    Ok(body) => {
                        let body = body.unwrap_or_default();
                        rule_cache.insert(step_type, body.clone());
                        body
                    }
                    Err(e) => {
                        return Ok(CaseOutcome::need_discussion(
                            Some(step.step_number),
                            format!("rule for {} is unreadable: {}", step_type.rule_key(), e),
                        ));
                    }
                },
            };

            let (desired_result, desired_reason) = if step.step_number < divergence {
                (FinalResult::Correct, "")
            } else {
                (human_result, human_reason)
            };

            let content = correction_user_content(step);
            let mut ai_result = FinalResult::NeedDiscussion;

            for round in 1..=self.max_rounds {
                if cancel.load(Ordering::Relaxed) {
                    anyhow::bail!("optimization cancelled at step {}", step.step_number);
                }

                let (result, reason) = self.judge_once(&rule, &history, &content).await;
                ai_result = result;

                if ai_result == desired_result && ai_result == FinalResult::Correct {
                    info!(
                        step = step.step_number,
                        round, "step converged to Correct; persisting example case"
                    );
                    let case = ExampleCase {
                        step_type,
                        raw_desc: step.actual_text.clone(),
                        ai_desc: step.ai_text.clone(),
                        success_reason: reason,
                    };
                    match self.examples.append_if_new(&case).await {
                        Ok(true) => info!("stored new example case"),
                        Ok(false) => info!("example case already present; not duplicated"),
                        Err(e) => warn!(error = %e, "failed to persist example case"),
                    }
                    break;
                }
                if ai_result == desired_result && step.step_number == divergence {
                    // Converged on the human's non-Correct result.
                    break;
                }

                match self
                    .rewrite_rule(desired_result, desired_reason, ai_result, &reason, &rule, &content)
                    .await
                {
                    Some(new_rule) => {
                        rule = new_rule;
                        rule_cache.insert(step_type, rule.clone());
                        touched.insert(step_type);
                    }
                    // An unusable rewrite gives up for this step; the prior
                    // rule text stays untouched for later steps.
                    None => break,
                }
            }

            if desired_result == FinalResult::Correct && ai_result == FinalResult::Correct {
                history.push(HistoryStep {
                    step_number: step.step_number,
                    final_result: FinalResult::Correct,
                    reason: String::new(),
                });
            } else if step.step_number == divergence {
                break;
            }
        }

        for step_type in &touched {
            if let Some(body) = rule_cache.get(step_type) {
                if let Err(e) = self.rules.save(*step_type, body).await {
                    return Ok(CaseOutcome::need_discussion(
                        None,
                        format!(
                            "failed to persist rewritten rule for {}: {}",
                            step_type.rule_key(),
                            e
                        ),
                    ));
                }
            }
        }

        evaluator.evaluate(plan, cancel).await
    }

    /// Resolve the 1-based step number the human correction concerns.
    ///
    /// Precedence: an explicit `Step Number: N` marker in the reason, then a
    /// single classification call over the full reason text, then the last
    /// step of the plan.
    async fn divergence_step(&self, plan: &Plan, human_label: &str, human_reason: &str) -> u32 {
        let last = plan.last_step_number();
        let reason = human_reason.trim();
        if reason.is_empty() {
            return last;
        }
        if let Some(n) = parse_step_number(reason) {
            return n.clamp(1, last);
        }

        let system = IDENTIFY_SYSTEM_PROMPT
            .replacen("{human_judge}", human_label, 1)
            .replacen("{result_reason}", reason, 1);
        match self.client.complete(&system, &[]).await {
            Ok(resp) => extract_result_number(&resp.text)
                .map(|n| n.clamp(1, last))
                .unwrap_or(last),
            Err(e) => {
                warn!(error = %e, "divergence identification call failed; using last step");
                last
            }
        }
    }

    /// One compare invocation inside the correction loop. Unparsable output
    /// is a non-matching verdict that consumes a round, never an abort.
    async fn judge_once(
        &self,
        rule: &str,
        history: &[HistoryStep],
        content: &[ContentPart],
    ) -> (FinalResult, String) {
        let system = judge::comparison_system_prompt(rule, history);
        match self.client.complete(&system, content).await {
            Ok(resp) => match verdict::parse_verdict(&resp.text) {
                Some(v) => (v.result, v.reason),
                None => (
                    FinalResult::NeedDiscussion,
                    "model compare output invalid".to_string(),
                ),
            },
            Err(e) => {
                warn!(error = %e, "compare call failed inside correction loop");
                (
                    FinalResult::NeedDiscussion,
                    "model compare output invalid".to_string(),
                )
            }
        }
    }

    /// Ask the model for a replacement rule body. `None` when the call fails
    /// or the answer carries no usable `step_type_rule`.
    async fn rewrite_rule(
        &self,
        desired_result: FinalResult,
        desired_reason: &str,
        ai_result: FinalResult,
        ai_reason: &str,
        current_rule: &str,
        content: &[ContentPart],
    ) -> Option<String> {
        let system = OPTIMIZATION_SYSTEM_PROMPT
            .replacen("{human_judge_result}", desired_result.as_str(), 1)
            .replacen("{human_judge_reason}", desired_reason, 1)
            .replacen("{ai_judge_result}", ai_result.as_str(), 1)
            .replacen("{ai_judge_reason}", ai_reason, 1)
            .replacen("{history_rule}", current_rule, 1);

        match self.client.complete(&system, content).await {
            Ok(resp) => verdict::extract_json_object(&resp.text)
                .and_then(|v| {
                    v.get("step_type_rule")
                        .and_then(|r| r.as_str())
                        .map(str::to_string)
                })
                .filter(|r| !r.trim().is_empty()),
            Err(e) => {
                warn!(error = %e, "rule rewrite call failed");
                None
            }
        }
    }
}

/// User content for correction-loop judging: the AI restatement and the raw
/// actual description, plus the evidence image in a forwardable form.
fn correction_user_content(step: &StepRecord) -> Vec<ContentPart> {
    let mut parts = vec![
        ContentPart::text(format!(
            "Step AI optimization and supplementation description: {}",
            step.ai_text
        )),
        ContentPart::text(format!("Step actual description: {}", step.actual_text)),
    ];
    if let Some(url) = step.evidence_image() {
        if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:") {
            parts.push(ContentPart::image(url));
        }
    }
    parts
}

/// `Step Number: 3` (any case, flexible spacing) inside a correction reason.
fn parse_step_number(reason: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)step\s*number\s*:\s*(\d+)").expect("static regex")
    });
    re.captures(reason)?.get(1)?.as_str().parse().ok()
}

/// `result_number` from the identification answer; the model returns it as a
/// number or a numeric string.
fn extract_result_number(raw: &str) -> Option<u32> {
    let value = verdict::extract_json_object(raw)?;
    let field = value.get("result_number")?;
    if let Some(n) = field.as_u64() {
        return u32::try_from(n).ok();
    }
    field.as_str()?.trim().parse().ok()
}
