use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a run may move from `self` to `next`.
    ///
    /// Allowed: queued→running, running→completed|failed, and queued→failed
    /// (a job that could not even be started). Terminal states are final.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, Self::Running)
                | (Self::Queued, Self::Failed)
                | (Self::Running, Self::Completed)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Observer side of a supervised child process.
///
/// The supervisor owns the child and the matching [`ExitNotifier`]; the
/// registry only keeps this handle to ask whether the process is still alive.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    exit_rx: watch::Receiver<Option<i32>>,
}

/// Owner side of a supervised child process; publishes the exit code.
#[derive(Debug)]
pub struct ExitNotifier {
    exit_tx: watch::Sender<Option<i32>>,
}

impl ProcessHandle {
    pub fn channel(pid: Option<u32>) -> (ExitNotifier, ProcessHandle) {
        let (exit_tx, exit_rx) = watch::channel(None);
        (ExitNotifier { exit_tx }, ProcessHandle { pid, exit_rx })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Alive until the owner publishes an exit code or drops its notifier.
    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none() && self.exit_rx.has_changed().is_ok()
    }
}

impl ExitNotifier {
    pub fn notify(self, exit_code: i32) {
        // No receivers left is fine: the run may already have been evicted.
        let _ = self.exit_tx.send(Some(exit_code));
    }
}

/// One research job tracked by the run registry.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    /// First 100 characters of the submitted research content.
    pub content_preview: Option<String>,
    #[serde(skip)]
    pub process: Option<ProcessHandle>,
}

impl RunRecord {
    pub fn new(run_id: impl Into<String>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            run_id: run_id.into(),
            status: RunStatus::Queued,
            start_time: None,
            end_time: None,
            exit_code: None,
            log_path: log_path.into(),
            content_preview: None,
            process: None,
        }
    }

    /// Derived liveness: status says running and the owning process is alive.
    ///
    /// A submitted run is marked `running` before its child is spawned and
    /// its handle attached, so while the log is prepared and the process
    /// starts this reports `false` even though `status` is `Running`.
    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
            && self.process.as_ref().is_some_and(ProcessHandle::is_alive)
    }

    /// Most recent lifecycle timestamp (end, falling back to start).
    pub fn last_activity(&self) -> Option<DateTime<Utc>> {
        self.end_time.or(self.start_time)
    }

    pub fn view(&self) -> RunView {
        RunView {
            record: self.clone(),
            running: self.is_running(),
            pid: self.process.as_ref().and_then(ProcessHandle::pid),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id.clone(),
            status: self.status,
            start_time: self.start_time,
            log_path: self.log_path.clone(),
        }
    }
}

/// Partial update applied by [`RunRegistry::update`](super::registry::RunRegistry::update).
///
/// `None` leaves a field untouched. The nested options on `end_time` and
/// `exit_code` allow clearing them.
#[derive(Debug, Default)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<Option<DateTime<Utc>>>,
    pub exit_code: Option<Option<i32>>,
    pub content_preview: Option<String>,
    pub process: Option<ProcessHandle>,
}

impl RunUpdate {
    /// Transition to running: stamps the start and clears any end/exit data.
    pub fn started(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Running),
            start_time: Some(at),
            end_time: Some(None),
            exit_code: Some(None),
            ..Self::default()
        }
    }

    /// Terminal transition derived from the child's exit code.
    pub fn finished(exit_code: i32, at: DateTime<Utc>) -> Self {
        let status = if exit_code == 0 {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        Self {
            status: Some(status),
            end_time: Some(Some(at)),
            exit_code: Some(Some(exit_code)),
            ..Self::default()
        }
    }

    /// Forced failure used when the job could not be launched or awaited.
    pub fn aborted(at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            end_time: Some(Some(at)),
            exit_code: Some(Some(-1)),
            ..Self::default()
        }
    }

    pub fn attach(process: ProcessHandle) -> Self {
        Self {
            process: Some(process),
            ..Self::default()
        }
    }

    pub fn preview(preview: String) -> Self {
        Self {
            content_preview: Some(preview),
            ..Self::default()
        }
    }
}

/// JSON-safe view of a run returned by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RunView {
    #[serde(flatten)]
    pub record: RunRecord,
    pub running: bool,
    pub pid: Option<u32>,
}

/// Row of the run listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    pub run_id: String,
    pub status: RunStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub log_path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            RunStatus::Queued,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        }
        assert!("cancelled".parse::<RunStatus>().is_err());
    }

    #[test]
    fn test_status_transitions() {
        use RunStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Queued.can_transition_to(Failed));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(!Queued.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Queued));
        assert!(!Completed.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Completed));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Completed).unwrap(),
            "\"completed\""
        );
    }

    #[test]
    fn test_process_handle_alive_until_notified() {
        let (notifier, handle) = ProcessHandle::channel(Some(42));
        assert!(handle.is_alive());
        assert_eq!(handle.pid(), Some(42));
        notifier.notify(3);
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_process_handle_dead_when_notifier_dropped() {
        let (notifier, handle) = ProcessHandle::channel(None);
        drop(notifier);
        assert!(!handle.is_alive());
    }

    #[test]
    fn test_is_running_requires_live_process() {
        let mut record = RunRecord::new("r1", "/tmp/r1.log");
        record.status = RunStatus::Running;
        assert!(!record.is_running());

        let (notifier, handle) = ProcessHandle::channel(Some(1));
        record.process = Some(handle);
        assert!(record.is_running());

        notifier.notify(0);
        assert!(!record.is_running());
    }

    #[test]
    fn test_finished_update_maps_exit_code() {
        let now = Utc::now();
        assert_eq!(
            RunUpdate::finished(0, now).status,
            Some(RunStatus::Completed)
        );
        assert_eq!(RunUpdate::finished(2, now).status, Some(RunStatus::Failed));
        let aborted = RunUpdate::aborted(now);
        assert_eq!(aborted.status, Some(RunStatus::Failed));
        assert_eq!(aborted.exit_code, Some(Some(-1)));
    }

    #[test]
    fn test_view_flattens_record() {
        let record = RunRecord::new("r9", "/tmp/r9.log");
        let json = serde_json::to_value(record.view()).unwrap();
        assert_eq!(json["run_id"], "r9");
        assert_eq!(json["status"], "queued");
        assert_eq!(json["running"], false);
        assert!(json.get("process").is_none());
    }

    #[test]
    fn test_last_activity_prefers_end_time() {
        let mut record = RunRecord::new("r1", "/tmp/r1.log");
        assert!(record.last_activity().is_none());
        let start = Utc::now() - chrono::Duration::hours(2);
        let end = Utc::now();
        record.start_time = Some(start);
        assert_eq!(record.last_activity(), Some(start));
        record.end_time = Some(end);
        assert_eq!(record.last_activity(), Some(end));
    }
}
