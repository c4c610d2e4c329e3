//! Structured-verdict recovery from free-form judge output.
//!
//! Model output is unreliable: verdict JSON arrives raw, wrapped in code
//! fences, or buried in prose with trailing commas. Extraction never fails
//! hard; callers get `None` and apply the uniform manual-review fallback.

use crate::model::{FinalResult, Verdict};
use regex::Regex;
use std::sync::OnceLock;

/// Reason prefix for the fallback outcome when a step exhausts its judge
/// attempts without a usable verdict.
pub const MANUAL_REVIEW_REASON: &str = "manual review required";

/// Recover the first JSON object from raw model text.
///
/// Stages, each tried only if the previous failed:
/// 1. parse the trimmed text directly;
/// 2. strip one pair of leading/trailing fence markers and retry;
/// 3. scan for the first brace-balanced object (quote/escape aware), strip
///    trailing commas before closing delimiters, and retry.
pub fn extract_json_object(raw: &str) -> Option<serde_json::Value> {
    extract_json_value(raw, '{', '}')
}

/// Same recovery ladder for a top-level JSON array (used by the plan parser).
pub fn extract_json_array(raw: &str) -> Option<serde_json::Value> {
    extract_json_value(raw, '[', ']')
}

fn extract_json_value(raw: &str, open: char, close: char) -> Option<serde_json::Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(v) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if matches_delimiter(&v, open) {
            return Some(v);
        }
    }

    let unfenced = strip_code_fences(trimmed);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(unfenced) {
        if matches_delimiter(&v, open) {
            return Some(v);
        }
    }

    let candidate = first_balanced(unfenced, open, close)?;
    let repaired = strip_trailing_commas(candidate);
    match serde_json::from_str::<serde_json::Value>(&repaired) {
        Ok(v) if matches_delimiter(&v, open) => Some(v),
        _ => None,
    }
}

fn matches_delimiter(v: &serde_json::Value, open: char) -> bool {
    match open {
        '{' => v.is_object(),
        '[' => v.is_array(),
        _ => false,
    }
}

/// Strip a single pair of leading/trailing fenced-code markers.
/// Language tags after the opening fence (```json, ```python) are discarded.
pub fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let mut lines = trimmed.lines();
    let first = match lines.next() {
        Some(l) => l,
        None => return trimmed,
    };
    if !first.trim_start().starts_with("```") {
        return trimmed;
    }
    let last = match trimmed.lines().next_back() {
        Some(l) if l.trim_start().starts_with("```") && trimmed.lines().count() >= 2 => l,
        _ => return trimmed,
    };
    let start = first.len() + trimmed[first.len()..].find('\n').map(|i| i + 1).unwrap_or(0);
    let end = trimmed.len() - last.len();
    if start >= end {
        return "";
    }
    trimmed[start..end].trim()
}

/// Find the first syntactically balanced run delimited by `open`/`close`.
///
/// Explicit lexer-level scan: string literals and escapes are tracked so that
/// delimiters inside strings are never counted.
fn first_balanced(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in text[start..].char_indices() {
        if in_string {
            if escape {
                escape = false;
            } else if ch == '\\' {
                escape = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        if ch == '"' {
            in_string = true;
        } else if ch == open {
            depth += 1;
        } else if ch == close {
            depth = depth.saturating_sub(1);
            if depth == 0 {
                return Some(&text[start..start + i + ch.len_utf8()]);
            }
        }
    }
    None
}

fn strip_trailing_commas(s: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r",\s*([}\]])").expect("static regex"));
    re.replace_all(s, "$1").into_owned()
}

/// Normalize a model-produced result string onto the canonical enum.
/// Anything unrecognized maps to `NeedDiscussion` (fail-safe, never dropped).
pub fn normalize_final_result(value: &str) -> FinalResult {
    let key: String = value
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect();
    match key.as_str() {
        "correct" => FinalResult::Correct,
        "incorrect" => FinalResult::Incorrect,
        "spam" => FinalResult::Spam,
        // "needdicussion" is a model typo seen often enough to map explicitly.
        "needdiscussion" | "need_discussion" | "need-discussion" | "needdicussion" => {
            FinalResult::NeedDiscussion
        }
        _ => FinalResult::NeedDiscussion,
    }
}

/// Best-effort normalization of a human-supplied label onto the canonical
/// enum. Unlike [`normalize_final_result`], unrecognized values return `None`
/// so callers can reject a correction instead of silently judging against
/// the wrong target.
pub fn normalize_human_label(value: &str) -> Option<FinalResult> {
    let low = value.trim().to_lowercase();
    let low = low.split_whitespace().collect::<Vec<_>>().join(" ");
    match low.as_str() {
        "" => None,
        "correct" | "y" | "yes" | "true" | "t" | "pass" | "passed" | "1" => {
            Some(FinalResult::Correct)
        }
        "incorrect" | "n" | "no" | "false" | "f" | "fail" | "failed" | "0" => {
            Some(FinalResult::Incorrect)
        }
        "spam" => Some(FinalResult::Spam),
        "needdiscussion" | "need discussion" | "need_discussion" | "need review"
        | "manual review" => Some(FinalResult::NeedDiscussion),
        _ => {
            if low.contains("spam") {
                Some(FinalResult::Spam)
            } else if low.contains("need") && low.contains("discussion") {
                Some(FinalResult::NeedDiscussion)
            } else {
                None
            }
        }
    }
}

/// Recover a per-step or final-summary verdict from raw judge text.
/// Returns `None` (never panics, never errors) when no `final_summary`
/// object can be recovered; callers apply the manual-review fallback.
pub fn parse_verdict(raw: &str) -> Option<Verdict> {
    let parsed = extract_json_object(raw)?;
    let summary = parsed.get("final_summary")?.as_object()?;
    let result = normalize_final_result(
        summary
            .get("final_result")
            .and_then(|v| v.as_str())
            .unwrap_or(""),
    );
    let reason = summary
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();
    Some(Verdict { result, reason })
}

/// Whether the AI and a human label agree. `None` when either side is in the
/// ignore set (defaults to Spam and NeedDiscussion) and no comparison is
/// meaningful.
pub fn judge_match(ai: FinalResult, human: FinalResult) -> Option<bool> {
    let ignored = |r: FinalResult| matches!(r, FinalResult::Spam | FinalResult::NeedDiscussion);
    if ignored(ai) || ignored(human) {
        return None;
    }
    Some(ai == human)
}
