//! Research job supervision.
//!
//! ## Module Map
//!
//! ```text
//!  POST /start ──> registry.rs   (RunRegistry: run_id → RunRecord)
//!                       │  ^
//!                       │  │ status transitions, process handle
//!                       v  │
//!                  supervisor.rs (JobSupervisor, CommandSpec)
//!                       │
//!                       │ spawns `<executable> research <payload>`
//!                       │ stdout + stderr ──> <log_dir>/<run_id>_<ts>.log
//!                       v
//!                  child process
//!
//!  sweeper.rs  (CleanupSweeper) evicts old terminal runs + their logs
//!  log_tail.rs (read_tail)      serves the end of a run log
//! ```
//!
//! A run is "running" only while its record says so *and* the process
//! handle attached by the supervisor reports the child alive. See
//! [`models::RunRecord::is_running`].

pub mod log_tail;
pub mod models;
pub mod registry;
pub mod supervisor;
pub mod sweeper;

pub use models::{RunRecord, RunStatus, RunSummary, RunUpdate};
pub use registry::RunRegistry;
pub use supervisor::{CommandSpec, JobSupervisor};
pub use sweeper::CleanupSweeper;
