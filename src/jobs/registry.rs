use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::errors::RunError;

use super::models::{RunRecord, RunSummary, RunUpdate};

/// Process-wide table of research runs keyed by run id.
///
/// Cheap to clone; all clones share one map behind a single lock. The lock
/// is held only for the map operation itself, never across I/O.
#[derive(Debug, Clone, Default)]
pub struct RunRegistry {
    runs: Arc<Mutex<HashMap<String, RunRecord>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, RunRecord>>, RunError> {
        self.runs.lock().map_err(|_| RunError::LockPoisoned)
    }

    /// Register a new queued run. Fails if the id is already tracked.
    pub fn create(
        &self,
        run_id: impl Into<String>,
        log_path: impl Into<PathBuf>,
    ) -> Result<RunRecord, RunError> {
        let run_id = run_id.into();
        let mut runs = self.lock()?;
        if runs.contains_key(&run_id) {
            return Err(RunError::DuplicateRun { run_id });
        }
        let record = RunRecord::new(run_id.clone(), log_path);
        runs.insert(run_id, record.clone());
        Ok(record)
    }

    pub fn get(&self, run_id: &str) -> Result<Option<RunRecord>, RunError> {
        Ok(self.lock()?.get(run_id).cloned())
    }

    /// Like [`get`](Self::get) but signals `RunNotFound` for unknown ids.
    pub fn require(&self, run_id: &str) -> Result<RunRecord, RunError> {
        self.get(run_id)?.ok_or_else(|| RunError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    /// Apply a partial update. Status changes are validated against the run
    /// lifecycle; on rejection the record is left untouched.
    pub fn update(&self, run_id: &str, update: RunUpdate) -> Result<RunRecord, RunError> {
        let mut runs = self.lock()?;
        let record = runs.get_mut(run_id).ok_or_else(|| RunError::RunNotFound {
            run_id: run_id.to_string(),
        })?;

        if let Some(next) = update.status
            && next != record.status
            && !record.status.can_transition_to(next)
        {
            return Err(RunError::InvalidTransition {
                run_id: run_id.to_string(),
                from: record.status,
                to: next,
            });
        }

        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(start_time) = update.start_time {
            record.start_time = Some(start_time);
        }
        if let Some(end_time) = update.end_time {
            record.end_time = end_time;
        }
        if let Some(exit_code) = update.exit_code {
            record.exit_code = exit_code;
        }
        if let Some(preview) = update.content_preview {
            record.content_preview = Some(preview);
        }
        if let Some(process) = update.process {
            record.process = Some(process);
        }
        Ok(record.clone())
    }

    pub fn list_summary(&self) -> Result<Vec<RunSummary>, RunError> {
        let runs = self.lock()?;
        let mut summary: Vec<RunSummary> = runs.values().map(RunRecord::summary).collect();
        summary.sort_by(|a, b| {
            a.start_time
                .cmp(&b.start_time)
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(summary)
    }

    /// Point-in-time copy of every record.
    pub fn snapshot(&self) -> Result<Vec<RunRecord>, RunError> {
        Ok(self.lock()?.values().cloned().collect())
    }

    /// Remove a run. The caller is responsible for deleting its log file.
    pub fn evict(&self, run_id: &str) -> Result<Option<RunRecord>, RunError> {
        Ok(self.lock()?.remove(run_id))
    }

    pub fn running_count(&self) -> Result<usize, RunError> {
        Ok(self.lock()?.values().filter(|r| r.is_running()).count())
    }

    pub fn any_running(&self) -> Result<bool, RunError> {
        Ok(self.running_count()? > 0)
    }

    pub fn len(&self) -> Result<usize, RunError> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, RunError> {
        Ok(self.len()? == 0)
    }
}
