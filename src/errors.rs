//! Typed error hierarchy for delve.
//!
//! Four top-level enums cover the four collaborator boundaries:
//! - `RunError`: run registry lookups and status transitions
//! - `LaunchError`: job supervisor child process failures
//! - `SessionError`: any failure from the agent session capability
//! - `UploadError`: blob sink failures

use std::path::PathBuf;

use thiserror::Error;

use crate::jobs::models::RunStatus;

/// Errors from the run registry.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("Run {run_id} already exists")]
    DuplicateRun { run_id: String },

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Run {run_id} cannot move from {from} to {to}")]
    InvalidTransition {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("Run registry lock poisoned")]
    LockPoisoned,
}

/// Errors while launching or waiting on a research job child process.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Failed to spawn {executable}: {source}")]
    Spawn {
        executable: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare log file at {path}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for child process: {0}")]
    Wait(#[source] std::io::Error),
}

/// Errors from the agent session capability.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Agent session is not configured: {0}")]
    NotConfigured(String),

    #[error("Agent request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Agent API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Unexpected agent response: {0}")]
    Decode(String),
}

/// Errors from the blob sink, for writes and reads alike.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("Upload request for {path} failed: {source}")]
    Request {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Storage rejected {path} with {status}: {message}")]
    Rejected {
        path: String,
        status: u16,
        message: String,
    },

    #[error("Storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Document not found: {path}")]
    NotFound { path: String },

    #[error("Unreadable storage listing for {path}: {message}")]
    Decode { path: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_error_duplicate_carries_id() {
        let err = RunError::DuplicateRun {
            run_id: "abc".into(),
        };
        match &err {
            RunError::DuplicateRun { run_id } => assert_eq!(run_id, "abc"),
            _ => panic!("Expected DuplicateRun"),
        }
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn run_error_invalid_transition_names_both_states() {
        let err = RunError::InvalidTransition {
            run_id: "r1".into(),
            from: RunStatus::Completed,
            to: RunStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn upload_error_not_found_names_path() {
        let err = UploadError::NotFound {
            path: "summaries/run/a.md".into(),
        };
        assert_eq!(err.to_string(), "Document not found: summaries/run/a.md");
    }

    #[test]
    fn launch_error_spawn_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = LaunchError::Spawn {
            executable: PathBuf::from("/nope/delve"),
            source: io_err,
        };
        match &err {
            LaunchError::Spawn { executable, source } => {
                assert_eq!(executable, &PathBuf::from("/nope/delve"));
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected Spawn"),
        }
    }

    #[test]
    fn session_error_api_carries_status() {
        let err = SessionError::Api {
            status: 429,
            message: "slow down".into(),
        };
        assert!(err.to_string().contains("429"));
        assert!(err.to_string().contains("slow down"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&RunError::LockPoisoned);
        assert_std_error(&LaunchError::Wait(std::io::Error::other("x")));
        assert_std_error(&SessionError::Decode("x".into()));
        assert_std_error(&UploadError::Rejected {
            path: "a.md".into(),
            status: 403,
            message: "denied".into(),
        });
    }
}
