//! Append-only store of grounding examples produced by optimization runs.

use crate::errors::StorageError;
use crate::model::{ExampleCase, StepType};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::sync::Mutex;

#[async_trait]
pub trait ExampleStore: Send + Sync {
    /// Append the case unless `(step_type, raw_desc)` is already present.
    /// Returns true when a new record was written. Existing records are
    /// never overwritten.
    async fn append_if_new(&self, case: &ExampleCase) -> Result<bool, StorageError>;

    /// Success reason of the stored example matching `(step_type, raw_desc)`,
    /// if any.
    async fn success_reason(
        &self,
        step_type: StepType,
        raw_desc: &str,
    ) -> Result<Option<String>, StorageError>;
}

/// JSON-file example store. The check-then-append sequence runs under one
/// async mutex, so concurrent optimizer runs in this process cannot race a
/// duplicate key into the file.
pub struct JsonExampleStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonExampleStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load_all(&self) -> Result<Vec<ExampleCase>, StorageError> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| StorageError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|e| StorageError::Parse {
            path: self.path.clone(),
            detail: e.to_string(),
        })
    }

    fn key_matches(case: &ExampleCase, step_type: StepType, raw_desc: &str) -> bool {
        case.step_type == step_type && case.raw_desc.trim() == raw_desc.trim()
    }
}

#[async_trait]
impl ExampleStore for JsonExampleStore {
    async fn append_if_new(&self, case: &ExampleCase) -> Result<bool, StorageError> {
        let _guard = self.lock.lock().await;
        let mut cases = self.load_all()?;
        if cases
            .iter()
            .any(|c| Self::key_matches(c, case.step_type, &case.raw_desc))
        {
            return Ok(false);
        }
        cases.push(case.clone());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let body = serde_json::to_string_pretty(&cases).map_err(|e| StorageError::Parse {
            path: self.path.clone(),
            detail: e.to_string(),
        })?;
        std::fs::write(&self.path, body).map_err(|e| StorageError::Io {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(true)
    }

    async fn success_reason(
        &self,
        step_type: StepType,
        raw_desc: &str,
    ) -> Result<Option<String>, StorageError> {
        if raw_desc.trim().is_empty() {
            return Ok(None);
        }
        let _guard = self.lock.lock().await;
        let cases = self.load_all()?;
        Ok(cases
            .iter()
            .find(|c| Self::key_matches(c, step_type, raw_desc))
            .map(|c| c.success_reason.clone()))
    }
}
