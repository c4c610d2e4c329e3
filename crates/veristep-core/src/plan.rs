//! Plan assembly: merging scraped standard/actual panes into an ordered,
//! typed step plan plus duplicate-evidence groups.

use crate::dedupe;
use crate::fingerprint::{Fingerprinter, ImageRef};
use crate::model::{CaseStep, ContentPart, StepRecord, StepType};
use crate::providers::llm::LlmClient;
use crate::verdict;
use base64::Engine as _;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

/// Ordered step plan with 1-based duplicate groups over actual evidence.
#[derive(Debug, Clone)]
pub struct Plan {
    pub steps: Vec<StepRecord>,
    pub duplicate_groups: Vec<Vec<u32>>,
}

impl Plan {
    pub fn last_step_number(&self) -> u32 {
        self.steps.last().map(|s| s.step_number).unwrap_or(0)
    }
}

const PLANNER_SYSTEM_PROMPT: &str = r#"You are a top-tier AI planning functional test expert.
Your task is to analyze user-provided test case text and screenshots to develop an action plan for each step (Step Number).
Please ensure that each step in the plan is an independent, executable task, arranged strictly in logical order.
Restate each step in English based on the standard text and image, and classify it.

Your output must be a JSON list wrapped in ```json fences, one element per step:
```json
[{
    "step_number": 1,
    "step_type": "Navigation & URL Redirection" | "Functional Layout Setting" | "UI Visibility, Layout & Rendering Verification" | "Appearance & Theme Settings" | "Browser Settings & Configuration" | "Environment & Precondition Setup" | "Advertising Verification & Reporting" | "Localization & Internationalization" | "Accessibility & Keyboard Navigation" | "Carousel & Slider Controls" | "Media Playback & Audio Control" | "Authentication & User Profile Management" | "Tab & Window Management" | "Modals, Popups & Notifications Handling" | "Search Functionality & SERP Module Validation" | "Widgets, Taskbar & OS-Level Integrations",
    "text": "English step description, based on the standard text and image."
}]
```"#;

/// Pair the standard and actual panes positionally, 1-based, padding the
/// shorter side with empty text.
pub fn pair_steps(standard: &[CaseStep], actual: &[CaseStep]) -> Vec<PairedStep> {
    let total = standard.len().max(actual.len());
    (0..total)
        .map(|i| PairedStep {
            step_number: (i + 1) as u32,
            standard_text: standard.get(i).map(|s| s.text.clone()).unwrap_or_default(),
            actual_text: actual.get(i).map(|s| s.text.clone()).unwrap_or_default(),
            standard_image: standard.get(i).and_then(|s| s.image.clone()),
            actual_image: actual.get(i).and_then(|s| s.image.clone()),
        })
        .collect()
}

/// One positionally merged step before classification.
#[derive(Debug, Clone)]
pub struct PairedStep {
    pub step_number: u32,
    pub standard_text: String,
    pub actual_text: String,
    pub standard_image: Option<String>,
    pub actual_image: Option<String>,
}

impl PairedStep {
    /// A step with neither meaningful text nor any image carries no
    /// discrepancy worth judging.
    fn is_empty(&self) -> bool {
        self.standard_text.trim().is_empty()
            && self.actual_text.trim().is_empty()
            && self.standard_image.is_none()
            && self.actual_image.is_none()
    }
}

/// Normalize an image reference into a judge-forwardable URL form.
///
/// http(s) and `data:` pass through; a readable local file is inlined as a
/// `data:` URI; anything else is dropped rather than sent malformed.
pub fn normalize_image_ref(input: &str) -> Option<String> {
    let s = input.trim();
    if s.is_empty() {
        return None;
    }
    if s.starts_with("http://") || s.starts_with("https://") || s.starts_with("data:") {
        return Some(s.to_string());
    }
    let path = Path::new(s);
    if path.is_file() {
        let data = std::fs::read(path).ok()?;
        let mime = match path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .as_deref()
        {
            Some("jpg") | Some("jpeg") => "image/jpeg",
            Some("gif") => "image/gif",
            Some("webp") => "image/webp",
            Some("bmp") => "image/bmp",
            _ => "image/png",
        };
        let b64 = base64::engine::general_purpose::STANDARD.encode(&data);
        return Some(format!("data:{};base64,{}", mime, b64));
    }
    None
}

/// Multi-action heuristic: several enumerated sub-actions, or chained
/// action clauses in one description.
pub fn detect_multi_action(text: &str) -> bool {
    static ENUMERATED: OnceLock<Regex> = OnceLock::new();
    let enumerated = ENUMERATED.get_or_init(|| Regex::new(r"(?m)^\s*\d+[.)]\s+\S").expect("static regex"));
    if enumerated.find_iter(text).count() >= 2 {
        return true;
    }
    let low = text.to_lowercase();
    low.contains(" and then ") || low.contains(", then ")
}

/// Merges standard/actual pairs into a typed plan, invoking the planner
/// classification once per case.
pub struct Assembler {
    fingerprinter: Fingerprinter,
}

impl Default for Assembler {
    fn default() -> Self {
        Self {
            fingerprinter: Fingerprinter::default(),
        }
    }
}

impl Assembler {
    pub fn new(fingerprinter: Fingerprinter) -> Self {
        Self { fingerprinter }
    }

    /// `assemble(case_steps) -> (ordered plan, duplicate_groups)`.
    ///
    /// The classification call is best-effort: on failure or unparsable
    /// output the plan falls back to the literal step content. Duplicate
    /// grouping is not best-effort: a fingerprinting failure aborts the case.
    pub async fn assemble(
        &self,
        client: &dyn LlmClient,
        standard: &[CaseStep],
        actual: &[CaseStep],
    ) -> anyhow::Result<Plan> {
        let paired: Vec<PairedStep> = pair_steps(standard, actual)
            .into_iter()
            .filter(|p| !p.is_empty())
            .map(|mut p| {
                p.standard_image = p.standard_image.as_deref().and_then(normalize_image_ref);
                p.actual_image = p.actual_image.as_deref().and_then(normalize_image_ref);
                p
            })
            .collect();

        let duplicate_groups = self.group_actual_evidence(&paired).await?;

        let sketches = self.classify(client, &paired).await;

        let steps = paired
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let sketch = sketches.as_ref().and_then(|s| s.get(i));
                let ai_text = sketch
                    .map(|s| s.text.clone())
                    .filter(|t| !t.trim().is_empty())
                    .unwrap_or_else(|| literal_description(p));
                StepRecord {
                    step_number: p.step_number,
                    step_type: sketch.and_then(|s| s.step_type),
                    standard_text: p.standard_text.clone(),
                    ai_text: ai_text.clone(),
                    actual_text: p.actual_text.clone(),
                    standard_image: p.standard_image.clone(),
                    actual_image: p.actual_image.clone(),
                    multi_action: detect_multi_action(&ai_text)
                        || detect_multi_action(&p.standard_text),
                }
            })
            .collect();

        Ok(Plan {
            steps,
            duplicate_groups,
        })
    }

    /// Group perceptually identical actual-evidence images, reported in the
    /// external 1-based step space.
    async fn group_actual_evidence(&self, paired: &[PairedStep]) -> anyhow::Result<Vec<Vec<u32>>> {
        let mut step_numbers = Vec::new();
        let mut refs = Vec::new();
        for p in paired {
            if let Some(url) = &p.actual_image {
                refs.push(ImageRef::parse(url)?);
                step_numbers.push(p.step_number);
            }
        }
        let groups = dedupe::group(&self.fingerprinter, &refs).await?;
        Ok(groups
            .into_iter()
            .map(|g| g.into_iter().map(|i| step_numbers[i]).collect())
            .collect())
    }

    /// One classification invocation per case. Returns `None` on any failure
    /// so assembly can fall back to literal content.
    async fn classify(
        &self,
        client: &dyn LlmClient,
        paired: &[PairedStep],
    ) -> Option<Vec<StepSketch>> {
        if paired.is_empty() {
            return None;
        }
        let content = classification_content(paired);
        let response = match client.complete(PLANNER_SYSTEM_PROMPT, &content).await {
            Ok(resp) => resp.text,
            Err(e) => {
                warn!(error = %e, "planner call failed; falling back to literal step content");
                return None;
            }
        };
        match parse_sketches(&response) {
            Some(sketches) => Some(sketches),
            None => {
                warn!("planner output unparsable; falling back to literal step content");
                None
            }
        }
    }
}

fn literal_description(p: &PairedStep) -> String {
    if p.standard_text.trim().is_empty() {
        p.actual_text.clone()
    } else {
        p.standard_text.clone()
    }
}

fn classification_content(paired: &[PairedStep]) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    for p in paired {
        match &p.standard_image {
            Some(url) => {
                parts.push(ContentPart::text(format!(
                    "=== Step Number {} ===\nStandard Text: {}\nStandard Image:",
                    p.step_number, p.standard_text
                )));
                parts.push(ContentPart::image(url));
            }
            None => parts.push(ContentPart::text(format!(
                "=== Step Number {} ===\nStandard Text: {}\nStandard Image: No Standard Image Provided.",
                p.step_number, p.standard_text
            ))),
        }
    }
    parts
}

#[derive(Debug, Clone)]
struct StepSketch {
    step_type: Option<StepType>,
    text: String,
}

fn parse_sketches(raw: &str) -> Option<Vec<StepSketch>> {
    let value = verdict::extract_json_array(raw)?;
    let entries = value.as_array()?;
    if entries.is_empty() {
        return None;
    }
    let sketches = entries
        .iter()
        .map(|e| {
            let step_type = e
                .get("step_type")
                .and_then(|v| v.as_str())
                .and_then(StepType::from_label);
            let text = e
                .get("text")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            StepSketch { step_type, text }
        })
        .collect();
    Some(sketches)
}
