use crate::args::{BatchArgs, CheckArgs, Cli, Command, OptimizeArgs};
use crate::exit_codes;
use anyhow::Context;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use veristep_core::config::{load_config, VeristepConfig};
use veristep_core::engine::{
    BatchCase, BatchRunner, CancelFlag, CaseStatus, EvalOptions, Evaluator,
};
use veristep_core::fingerprint::Fingerprinter;
use veristep_core::model::FinalResult;
use veristep_core::optimizer::Optimizer;
use veristep_core::plan::Assembler;
use veristep_core::providers::llm::{build_client, LlmClient};
use veristep_core::storage::{FsRuleStore, JsonExampleStore};

/// On-disk shape of a single case file.
#[derive(Debug, Deserialize)]
struct CaseFile {
    #[serde(default)]
    standard: Vec<veristep_core::model::CaseStep>,
    #[serde(default)]
    actual: Vec<veristep_core::model::CaseStep>,
}

/// Everything a command needs, wired once from config.
struct App {
    config: VeristepConfig,
    client: Arc<dyn LlmClient>,
    assembler: Arc<Assembler>,
    rules: Arc<FsRuleStore>,
    examples: Arc<JsonExampleStore>,
}

impl App {
    fn build(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match config_path {
            Some(p) => load_config(p)?,
            None => VeristepConfig::default(),
        };
        let client = build_client(&config.judge)?;
        let assembler = Arc::new(Assembler::new(Fingerprinter::new(Duration::from_secs(
            config.judge.timeout_secs,
        ))));
        let rules = Arc::new(FsRuleStore::new(config.storage.rules_dir.clone()));
        let examples = Arc::new(JsonExampleStore::new(config.storage.examples_path.clone()));
        Ok(Self {
            config,
            client,
            assembler,
            rules,
            examples,
        })
    }

    fn evaluator(&self) -> Evaluator {
        Evaluator::new(
            self.client.clone(),
            self.rules.clone(),
            self.examples.clone(),
            EvalOptions::from(&self.config.runner),
        )
    }
}

/// Flip the flag on Ctrl-C so in-flight cases stop between steps.
fn cancel_on_ctrl_c() -> CancelFlag {
    let flag: CancelFlag = Arc::new(AtomicBool::new(false));
    let watched = flag.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current step then stopping");
            watched.store(true, Ordering::Relaxed);
        }
    });
    flag
}

fn read_case_file(path: &Path) -> anyhow::Result<CaseFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read case file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse case file {}", path.display()))
}

pub async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    let app = App::build(cli.config.as_deref())?;
    match cli.cmd {
        Command::Check(args) => check(&app, args).await,
        Command::Optimize(args) => optimize(&app, args).await,
        Command::Batch(args) => batch(&app, args).await,
    }
}

async fn check(app: &App, args: CheckArgs) -> anyhow::Result<i32> {
    let case = read_case_file(&args.case)?;
    let cancel = cancel_on_ctrl_c();

    let plan = app
        .assembler
        .assemble(&*app.client, &case.standard, &case.actual)
        .await?;
    info!(steps = plan.steps.len(), "plan assembled");

    let outcome = app.evaluator().evaluate(&plan, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(if outcome.final_result == FinalResult::Correct {
        exit_codes::SUCCESS
    } else {
        exit_codes::CASE_NOT_CORRECT
    })
}

async fn optimize(app: &App, args: OptimizeArgs) -> anyhow::Result<i32> {
    let case = read_case_file(&args.case)?;
    let cancel = cancel_on_ctrl_c();

    let plan = app
        .assembler
        .assemble(&*app.client, &case.standard, &case.actual)
        .await?;

    let optimizer = Optimizer::new(
        app.client.clone(),
        app.rules.clone(),
        app.examples.clone(),
        app.config.runner.optimizer_rounds,
    );
    let evaluator = app.evaluator();
    let outcome = optimizer
        .optimize(&plan, &args.label, &args.reason, &evaluator, &cancel)
        .await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(if outcome.final_result == FinalResult::Correct {
        exit_codes::SUCCESS
    } else {
        exit_codes::CASE_NOT_CORRECT
    })
}

async fn batch(app: &App, args: BatchArgs) -> anyhow::Result<i32> {
    let raw = std::fs::read_to_string(&args.cases)
        .with_context(|| format!("failed to read batch file {}", args.cases.display()))?;
    let cases: Vec<BatchCase> = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse batch file {}", args.cases.display()))?;
    info!(cases = cases.len(), "starting batch run");

    let cancel = cancel_on_ctrl_c();
    let parallel = args.parallel.unwrap_or(app.config.runner.parallel);
    let runner = BatchRunner::new(
        app.client.clone(),
        app.assembler.clone(),
        Arc::new(app.evaluator()),
        parallel,
    );

    let rows = runner.run(cases, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&rows)?);

    let all_correct = rows.iter().all(|r| r.status == CaseStatus::Correct);
    Ok(if all_correct {
        exit_codes::SUCCESS
    } else {
        exit_codes::CASE_NOT_CORRECT
    })
}
