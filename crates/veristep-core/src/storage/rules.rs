//! Keyed read/write of plain-text judging rules, one body per step type.

use crate::errors::StorageError;
use crate::model::StepType;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Maximum `@@INCLUDE@@` nesting before resolution gives up.
pub const MAX_INCLUDE_DEPTH: usize = 10;

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Load the rule body for a step type, with includes resolved.
    /// `Ok(None)` when no rule exists for that type.
    async fn load(&self, step_type: StepType) -> Result<Option<String>, StorageError>;

    /// Overwrite the rule body for a step type. Versioning is implicit:
    /// last write wins.
    async fn save(&self, step_type: StepType, body: &str) -> Result<(), StorageError>;
}

/// Filesystem rule store: `<root>/<rule_key>.txt`, with an
/// `@@INCLUDE: path @@` mechanism resolved recursively relative to the root.
///
/// Writes within this process are serialized through one async mutex;
/// cross-process writers are last-writer-wins.
pub struct FsRuleStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FsRuleStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn rule_path(&self, step_type: StepType) -> PathBuf {
        self.root.join(format!("{}.txt", step_type.rule_key()))
    }

    fn read_resolved(
        &self,
        path: &Path,
        depth: usize,
        visiting: &mut HashSet<PathBuf>,
    ) -> Result<String, StorageError> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(StorageError::IncludeDepth {
                path: path.to_path_buf(),
                max: MAX_INCLUDE_DEPTH,
            });
        }
        let canonical = path.to_path_buf();
        if !visiting.insert(canonical.clone()) {
            return Err(StorageError::IncludeCycle { path: canonical });
        }

        let raw = std::fs::read_to_string(path).map_err(|e| StorageError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        let mut out = String::with_capacity(raw.len());
        let mut cursor = 0;
        for m in include_re().captures_iter(&raw) {
            let whole = m.get(0).expect("capture 0 always present");
            out.push_str(&raw[cursor..whole.start()]);
            let target = self.root.join(m[1].trim());
            out.push_str(&self.read_resolved(&target, depth + 1, visiting)?);
            cursor = whole.end();
        }
        out.push_str(&raw[cursor..]);

        visiting.remove(&canonical);
        Ok(out)
    }
}

fn include_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"@@INCLUDE:\s*([^@]+?)\s*@@").expect("static regex"))
}

#[async_trait]
impl RuleStore for FsRuleStore {
    async fn load(&self, step_type: StepType) -> Result<Option<String>, StorageError> {
        let path = self.rule_path(step_type);
        if !path.is_file() {
            return Ok(None);
        }
        let mut visiting = HashSet::new();
        self.read_resolved(&path, 0, &mut visiting).map(Some)
    }

    async fn save(&self, step_type: StepType, body: &str) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        std::fs::create_dir_all(&self.root).map_err(|e| StorageError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let path = self.rule_path(step_type);
        std::fs::write(&path, body).map_err(|e| StorageError::Io { path, source: e })
    }
}
