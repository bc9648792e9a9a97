//! Deep research orchestration.
//!
//! ## Module Map
//!
//! ```text
//!  `delve research <content>`
//!         │
//!         v
//!  orchestrator.rs  (ResearchOrchestrator, IncrementalFetch)
//!         │                         │
//!         │ AgentSession            │ BlobSink
//!         v                         v
//!  session.rs                  sink.rs
//!   HttpAgentSession            AzureBlobSink / LocalDirSink / DiscardSink
//!
//!  assembler.rs  render() / consolidate(): agent message → markdown
//! ```
//!
//! Documents land under one folder per run:
//!
//! | Document      | Path                                                      |
//! |---------------|-----------------------------------------------------------|
//! | placeholder   | `research_run_<ts>/<placeholder_name>`                    |
//! | step          | `research_run_<ts>/research_step_<NN>_<ts>.md`            |
//! | final         | `research_run_<ts>/final_research_summary_<ts>.md`        |
//! | consolidated  | `research_run_<ts>/consolidated_research_summary_<ts>.md` |
//!
//! In overwrite mode the final summary replaces the placeholder instead.

pub mod assembler;
pub mod orchestrator;
pub mod session;
pub mod sink;

#[cfg(test)]
pub(crate) mod testing;

pub use assembler::Document;
pub use orchestrator::{OrchestratorState, ResearchOrchestrator, ResearchOutcome};
pub use session::{AgentSession, HttpAgentSession};
pub use sink::{BlobEntry, BlobSink};
