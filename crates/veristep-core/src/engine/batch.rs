//! Case-level parallelism over independent cases.
//!
//! Cases run concurrently under a counting semaphore; within each case the
//! evaluator stays strictly sequential. One case's failure never takes down
//! the batch: every error is caught at the case boundary and converted into
//! an `Error` row.

use crate::engine::evaluator::{CancelFlag, Evaluator};
use crate::model::{CaseStep, FinalResult};
use crate::plan::Assembler;
use crate::providers::llm::LlmClient;
use crate::verdict;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Batch status surface: the four verdicts plus a per-case error bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CaseStatus {
    Correct,
    Incorrect,
    Spam,
    NeedDiscussion,
    Error,
}

impl From<FinalResult> for CaseStatus {
    fn from(r: FinalResult) -> Self {
        match r {
            FinalResult::Correct => CaseStatus::Correct,
            FinalResult::Incorrect => CaseStatus::Incorrect,
            FinalResult::Spam => CaseStatus::Spam,
            FinalResult::NeedDiscussion => CaseStatus::NeedDiscussion,
        }
    }
}

/// One batch input: an identifier (row or URL) plus the two panes and an
/// optional vendor/human label for agreement reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCase {
    pub id: String,
    pub standard: Vec<CaseStep>,
    pub actual: Vec<CaseStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub human_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResultRow {
    pub case_id: String,
    pub status: CaseStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopping_step: Option<u32>,
    pub reason: String,
    /// AI/human agreement; `None` when no label was given or either side is
    /// inconclusive (Spam / NeedDiscussion).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agreement: Option<bool>,
    pub duration_ms: u64,
}

pub struct BatchRunner {
    client: Arc<dyn LlmClient>,
    assembler: Arc<Assembler>,
    evaluator: Arc<Evaluator>,
    parallel: usize,
}

impl BatchRunner {
    pub fn new(
        client: Arc<dyn LlmClient>,
        assembler: Arc<Assembler>,
        evaluator: Arc<Evaluator>,
        parallel: usize,
    ) -> Self {
        Self {
            client,
            assembler,
            evaluator,
            parallel: parallel.max(1),
        }
    }

    /// Run all cases; rows are collected in completion order internally but
    /// returned sorted by case id for deterministic output.
    pub async fn run(
        &self,
        cases: Vec<BatchCase>,
        cancel: &CancelFlag,
    ) -> anyhow::Result<Vec<CaseResultRow>> {
        let sem = Arc::new(Semaphore::new(self.parallel));
        let mut join_set = JoinSet::new();

        for case in cases {
            let permit = sem.clone().acquire_owned().await?;
            let client = self.client.clone();
            let assembler = self.assembler.clone();
            let evaluator = self.evaluator.clone();
            let cancel = cancel.clone();
            join_set.spawn(async move {
                // Permit held for the task's whole lifetime; released on
                // success, failure and panic alike.
                let _permit = permit;
                run_one(&*client, &assembler, &evaluator, case, &cancel).await
            });
        }

        let mut rows = Vec::new();
        while let Some(res) = join_set.join_next().await {
            rows.push(res.unwrap_or_else(|e| CaseResultRow {
                case_id: "unknown".into(),
                status: CaseStatus::Error,
                stopping_step: None,
                reason: format!("join error: {}", e),
                agreement: None,
                duration_ms: 0,
            }));
        }

        rows.sort_by(|a, b| a.case_id.cmp(&b.case_id));
        Ok(rows)
    }
}

async fn run_one(
    client: &dyn LlmClient,
    assembler: &Assembler,
    evaluator: &Evaluator,
    case: BatchCase,
    cancel: &CancelFlag,
) -> CaseResultRow {
    let started = Instant::now();
    let outcome = async {
        let plan = assembler
            .assemble(client, &case.standard, &case.actual)
            .await?;
        evaluator.evaluate(&plan, cancel).await
    }
    .await;

    match outcome {
        Ok(outcome) => {
            let agreement = case
                .human_label
                .as_deref()
                .and_then(verdict::normalize_human_label)
                .and_then(|human| verdict::judge_match(outcome.final_result, human));
            CaseResultRow {
                case_id: case.id,
                status: outcome.final_result.into(),
                stopping_step: outcome.stopping_step,
                reason: outcome.reason,
                agreement,
                duration_ms: started.elapsed().as_millis() as u64,
            }
        }
        Err(e) => CaseResultRow {
            case_id: case.id,
            status: CaseStatus::Error,
            stopping_step: None,
            reason: format!("{:#}", e),
            agreement: None,
            duration_ms: started.elapsed().as_millis() as u64,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::evaluator::EvalOptions;
    use crate::providers::llm::FakeClient;
    use crate::storage::{FsRuleStore, JsonExampleStore};
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    fn correct() -> String {
        r#"{"final_summary": {"final_result": "Correct", "reason": "ok"}}"#.to_string()
    }

    fn case(id: &str, text: &str) -> BatchCase {
        BatchCase {
            id: id.into(),
            standard: vec![CaseStep {
                text: text.into(),
                image: None,
            }],
            actual: vec![CaseStep {
                text: format!("did: {}", text),
                image: None,
            }],
            human_label: Some("correct".into()),
        }
    }

    fn runner(
        responses: Vec<String>,
        parallel: usize,
    ) -> (BatchRunner, Arc<FakeClient>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let client = Arc::new(FakeClient::scripted(responses));
        let rules = Arc::new(FsRuleStore::new(tmp.path().join("rules")));
        let examples = Arc::new(JsonExampleStore::new(tmp.path().join("cases.json")));
        let opts = EvalOptions {
            max_judge_attempts: 1,
            retry_delay: Duration::from_millis(1),
            pre_call_delay: Duration::ZERO,
        };
        let evaluator = Arc::new(Evaluator::new(client.clone(), rules, examples, opts));
        let runner =
            BatchRunner::new(client.clone(), Arc::new(Assembler::default()), evaluator, parallel);
        (runner, client, tmp)
    }

    #[tokio::test]
    async fn one_failing_case_does_not_poison_the_batch() {
        // Scripted responses: case planner calls get garbage (fallback),
        // then each case's single step needs one verdict. Only enough
        // responses exist for some calls; the starved case becomes
        // NeedDiscussion via attempt exhaustion, never an aborted batch.
        let (runner, _client, _tmp) = runner(
            vec![
                "planner garbage".to_string(),
                correct(),
                "planner garbage".to_string(),
                // second case's verdict call errors (script exhausted)
            ],
            1,
        );
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let rows = runner
            .run(vec![case("a", "step one"), case("b", "step one")], &cancel)
            .await
            .unwrap();

        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].case_id, "a");
        assert_eq!(rows[0].status, CaseStatus::Correct);
        assert_eq!(rows[0].agreement, Some(true));
        assert_eq!(rows[1].case_id, "b");
        assert_eq!(rows[1].status, CaseStatus::NeedDiscussion);
    }

    #[tokio::test]
    async fn rows_are_sorted_by_case_id() {
        let (runner, _client, _tmp) = runner(
            vec![
                "x".to_string(),
                correct(),
                "x".to_string(),
                correct(),
                "x".to_string(),
                correct(),
            ],
            1,
        );
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));
        let rows = runner
            .run(
                vec![case("c", "s"), case("a", "s"), case("b", "s")],
                &cancel,
            )
            .await
            .unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.case_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn cancellation_marks_pending_cases_as_errors() {
        let (runner, client, _tmp) = runner(vec![], 2);
        let cancel: CancelFlag = Arc::new(AtomicBool::new(true));
        let rows = runner.run(vec![case("a", "s")], &cancel).await.unwrap();
        assert_eq!(rows[0].status, CaseStatus::Error);
        assert!(rows[0].reason.contains("cancelled"));
        // The planner call may run, but no judging call ever does.
        assert!(client.call_count() <= 1);
    }
}
