//! Judging-request assembly: system prompts and structured user content.

use crate::model::{ContentPart, HistoryStep, StepRecord};

/// Per-step comparison prompt. The step-type rule and the accumulated
/// Correct-history are inlined so each call is self-contained.
const COMPARISON_SYSTEM_PROMPT: &str = r#"## ROLE
You are a top-notch functional testing expert: extremely proficient in functional testing.

## INPUT VARIABLES

step_type_rule:{step_type_rule}
history_step_results: {history_steps}

## GOAL
Use the step descriptions, the screenshot evidence and the historical steps to determine the current step's test result.

## Output JSON Format
Output actions for EACH Section in the following JSON format:
{
    "final_summary": {
        "final_result": "Correct" | "Incorrect" | "Spam" | "NeedDiscussion",
        "reason": "Explanation for the final result."
    }
}"#;

/// Build the per-step system prompt from the rule body and prior history.
pub fn comparison_system_prompt(step_type_rule: &str, history: &[HistoryStep]) -> String {
    let history_json = serde_json::to_string(history).unwrap_or_else(|_| "[]".to_string());
    COMPARISON_SYSTEM_PROMPT
        .replacen("{step_type_rule}", step_type_rule, 1)
        .replacen("{history_steps}", &history_json, 1)
}

/// Assemble the ordered user content for judging one step.
///
/// `duplicates_before` lists the 1-based step numbers sharing this step's
/// evidence image, restricted to indices at or below the current step so no
/// forward information leaks. The duplicates line is sent on every step,
/// `[]` included, so the judge always sees the same message shape. Only
/// http(s) and `data:` image forms are forwarded; anything else was dropped
/// during plan assembly.
pub fn step_user_content(
    step: &StepRecord,
    duplicates_before: &[u32],
    example_reason: Option<&str>,
) -> Vec<ContentPart> {
    let mut parts = vec![ContentPart::text(format!(
        "Step standard description: {}",
        step.ai_text
    ))];

    parts.push(ContentPart::text(format!(
        "Duplicate image step numbers:{:?}, please consider this information when making judgments.",
        duplicates_before
    )));

    parts.push(ContentPart::text(format!(
        "Step actual description: {}",
        step.actual_text
    )));

    if step.multi_action {
        parts.push(ContentPart::text(
            "This step requires multiple sub-actions; all of them must be evidenced for a Correct result.",
        ));
    }

    if let Some(reason) = example_reason {
        parts.push(ContentPart::text(format!(
            "Matched example-case step_success_reason (same step_raw_desc): {}",
            reason
        )));
    }

    if let Some(url) = step.evidence_image() {
        if url.starts_with("http://") || url.starts_with("https://") || url.starts_with("data:") {
            parts.push(ContentPart::image(url));
        }
    }

    parts
}

/// Duplicate-group membership visible at `step_number`: the members of the
/// step's group with index <= the current step, or empty when the step is
/// in no group.
pub fn duplicates_up_to(groups: &[Vec<u32>], step_number: u32) -> Vec<u32> {
    groups
        .iter()
        .find(|g| g.contains(&step_number))
        .map(|g| g.iter().copied().filter(|&i| i <= step_number).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FinalResult, StepType};

    fn step(evidence: Option<&str>) -> StepRecord {
        StepRecord {
            step_number: 3,
            step_type: Some(StepType::Navigation),
            standard_text: "open the settings page".into(),
            ai_text: "Navigate to the settings page".into(),
            actual_text: "opened settings".into(),
            standard_image: None,
            actual_image: evidence.map(str::to_string),
            multi_action: false,
        }
    }

    #[test]
    fn system_prompt_inlines_rule_and_history() {
        let history = vec![HistoryStep {
            step_number: 1,
            final_result: FinalResult::Correct,
            reason: String::new(),
        }];
        let prompt = comparison_system_prompt("check the URL bar", &history);
        assert!(prompt.contains("step_type_rule:check the URL bar"));
        assert!(prompt.contains("\"step_number\":1"));
        // The output-format braces must survive the placeholder substitution.
        assert!(prompt.contains("\"final_summary\""));
    }

    #[test]
    fn user_content_orders_texts_then_image() {
        let parts = step_user_content(&step(Some("https://host/a.png")), &[1, 3], None);
        assert!(matches!(&parts[0], ContentPart::Text { text } if text.starts_with("Step standard")));
        assert!(matches!(&parts[1], ContentPart::Text { text } if text.contains("[1, 3]")));
        assert!(matches!(&parts[2], ContentPart::Text { text } if text.starts_with("Step actual")));
        assert!(matches!(&parts[3], ContentPart::ImageRef { url } if url == "https://host/a.png"));
    }

    #[test]
    fn duplicates_line_is_sent_even_when_empty() {
        let parts = step_user_content(&step(None), &[], None);
        assert!(matches!(
            &parts[1],
            ContentPart::Text { text }
                if text == "Duplicate image step numbers:[], please consider this information when making judgments."
        ));
    }

    #[test]
    fn malformed_image_forms_are_dropped_not_sent() {
        let parts = step_user_content(&step(Some("ftp://host/a.png")), &[], None);
        assert!(parts
            .iter()
            .all(|p| !matches!(p, ContentPart::ImageRef { .. })));
    }

    #[test]
    fn example_reason_is_attached_when_present() {
        let parts = step_user_content(&step(None), &[], Some("matched earlier success"));
        assert!(parts.iter().any(
            |p| matches!(p, ContentPart::Text { text } if text.contains("matched earlier success"))
        ));
    }

    #[test]
    fn duplicates_never_reference_future_steps() {
        let groups = vec![vec![1, 3], vec![2, 5]];
        assert_eq!(duplicates_up_to(&groups, 1), vec![1]);
        assert_eq!(duplicates_up_to(&groups, 3), vec![1, 3]);
        assert_eq!(duplicates_up_to(&groups, 2), vec![2]);
        assert!(duplicates_up_to(&groups, 4).is_empty());
    }
}
