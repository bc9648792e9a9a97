use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::config::Settings;
use crate::errors::SessionError;
use crate::util::compact_timestamp;

use super::assembler::{self, Document};
use super::session::{
    AgentMessage, AgentRunStatus, AgentSession, AgentSpec, HttpAgentSession, MessageRole,
};
use super::sink::{self, BlobSink, MARKDOWN_CONTENT_TYPE};

pub const FINAL_TITLE: &str = "Final Deep Research Summary";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    Init,
    SessionCreated,
    TaskSubmitted,
    Polling,
    Finalizing,
    Done,
    Failed,
}

impl fmt::Display for OrchestratorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::SessionCreated => "SESSION_CREATED",
            Self::TaskSubmitted => "TASK_SUBMITTED",
            Self::Polling => "POLLING",
            Self::Finalizing => "FINALIZING",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// Storage and polling knobs for one orchestration.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub container: String,
    pub placeholder_name: String,
    pub placeholder_add_timestamp: bool,
    pub overwrite_placeholder: bool,
    pub poll_interval: Duration,
    pub max_run_duration: Option<Duration>,
}

impl OrchestratorConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            container: settings.storage.container.clone(),
            placeholder_name: settings.storage.placeholder_name.clone(),
            placeholder_add_timestamp: settings.storage.placeholder_add_timestamp,
            overwrite_placeholder: settings.storage.overwrite_placeholder,
            poll_interval: settings.agent.poll_interval(),
            max_run_duration: settings.agent.max_run_duration(),
        }
    }
}

/// What one orchestration produced.
#[derive(Debug, Clone)]
pub struct ResearchOutcome {
    pub state: OrchestratorState,
    pub run_folder: String,
    pub run_status: Option<AgentRunStatus>,
    pub last_error: Option<String>,
    pub intermediates: Vec<Document>,
    pub final_document: Option<Document>,
    pub consolidated: Option<Document>,
}

impl ResearchOutcome {
    fn new(run_folder: String) -> Self {
        Self {
            state: OrchestratorState::Init,
            run_folder,
            run_status: None,
            last_error: None,
            intermediates: Vec::new(),
            final_document: None,
            consolidated: None,
        }
    }

    pub fn is_failed(&self) -> bool {
        self.state == OrchestratorState::Failed
    }
}

/// Tracks agent messages already captured during one run so each new
/// message becomes exactly one intermediate document.
#[derive(Debug, Default)]
pub struct IncrementalFetch {
    counter: u32,
    last_seen: Option<String>,
    documents: Vec<Document>,
}

impl IncrementalFetch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn documents(&self) -> &[Document] {
        &self.documents
    }

    pub fn into_documents(self) -> Vec<Document> {
        self.documents
    }

    /// Fetch the newest agent message and, if it has not been seen yet,
    /// turn it into the next research step document and persist it.
    pub async fn poll(
        &mut self,
        session: &dyn AgentSession,
        sink: &dyn BlobSink,
        thread_id: &str,
        container: &str,
        run_folder: &str,
    ) -> Result<Option<String>, SessionError> {
        let Some(message) = session
            .get_last_message_by_role(thread_id, MessageRole::Agent)
            .await?
        else {
            return Ok(self.last_seen.clone());
        };
        if self.last_seen.as_deref() == Some(message.id.as_str()) {
            return Ok(self.last_seen.clone());
        }

        echo_response(&message);

        if !message.text_segments.is_empty() {
            let now = Utc::now();
            let next = self.counter + 1;
            let filename = format!("research_step_{:02}_{}.md", next, compact_timestamp(now));
            let title = format!("Research Step {}", next);
            if let Some(doc) = assembler::render(Some(&message), &filename, &title, true, now) {
                self.counter = next;
                persist(sink, container, &format!("{}/{}", run_folder, doc.filename), &doc).await;
                self.documents.push(doc);
            }
        }

        self.last_seen = Some(message.id);
        Ok(self.last_seen.clone())
    }
}

/// Agent output goes to stdout so it ends up in the run log.
fn echo_response(message: &AgentMessage) {
    println!("\nAgent response:");
    println!("{}", message.text_segments.join("\n"));
    for citation in &message.url_citations {
        println!(
            "URL Citation: [{}]({})",
            citation.title.as_deref().unwrap_or(""),
            citation.url
        );
    }
}

async fn persist(sink: &dyn BlobSink, container: &str, path: &str, doc: &Document) {
    if let Err(e) = sink
        .put(
            container,
            path,
            doc.content.clone().into_bytes(),
            MARKDOWN_CONTENT_TYPE,
        )
        .await
    {
        warn!(path = %path, error = %e, "Failed to upload document");
    }
}

/// Drives one deep research session end to end.
pub struct ResearchOrchestrator {
    session: Arc<dyn AgentSession>,
    sink: Arc<dyn BlobSink>,
    agent: AgentSpec,
    config: OrchestratorConfig,
}

impl ResearchOrchestrator {
    pub fn new(
        session: Arc<dyn AgentSession>,
        sink: Arc<dyn BlobSink>,
        agent: AgentSpec,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            session,
            sink,
            agent,
            config,
        }
    }

    /// Wire up the HTTP agent session and the configured sink.
    pub fn from_settings(settings: &Settings) -> Result<Self, SessionError> {
        let session = HttpAgentSession::from_settings(&settings.agent)?;
        let agent = AgentSpec::from_settings(&settings.agent)?;
        Ok(Self::new(
            Arc::new(session),
            sink::from_settings(&settings.storage),
            agent,
            OrchestratorConfig::from_settings(settings),
        ))
    }

    fn transition(&self, outcome: &mut ResearchOutcome, next: OrchestratorState) {
        info!(from = %outcome.state, to = %next, "Research state change");
        outcome.state = next;
    }

    /// Run the whole session. Never returns an error: failures end in the
    /// `Failed` state with the reason in `last_error`.
    pub async fn run(&self, content: &str) -> ResearchOutcome {
        let started = Utc::now();
        let run_folder = format!("research_run_{}", compact_timestamp(started));
        let mut outcome = ResearchOutcome::new(run_folder);

        let placeholder_name = self.placeholder_name(started);
        self.write_placeholder(&outcome.run_folder, &placeholder_name, started)
            .await;

        let mut fetch = IncrementalFetch::new();
        let result = self
            .drive(&mut outcome, &mut fetch, content, &placeholder_name)
            .await;
        outcome.intermediates = fetch.into_documents();

        match result {
            Ok(()) => self.transition(&mut outcome, OrchestratorState::Done),
            Err(e) => {
                error!(error = %e, "Research session failed");
                outcome.last_error = Some(e.to_string());
                self.transition(&mut outcome, OrchestratorState::Failed);
            }
        }
        outcome
    }

    fn placeholder_name(&self, at: DateTime<Utc>) -> String {
        if !self.config.placeholder_add_timestamp {
            return self.config.placeholder_name.clone();
        }
        let stem = Path::new(&self.config.placeholder_name)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.placeholder_name.clone());
        format!("{}_{}.md", stem, compact_timestamp(at))
    }

    async fn write_placeholder(&self, run_folder: &str, name: &str, at: DateTime<Utc>) {
        let doc = Document {
            filename: name.to_string(),
            content: format!(
                "# Research Summary (In progress)\n\n\
                 This placeholder was created on {} to reserve a document for the research run.\n\n\
                 Run folder: {}\n\n\
                 It can be overwritten when the run completes.\n",
                at.to_rfc3339(),
                run_folder
            ),
        };
        let path = format!("{}/{}", run_folder, name);
        persist(self.sink.as_ref(), &self.config.container, &path, &doc).await;
        info!(path = %path, "Placeholder written");
    }

    async fn drive(
        &self,
        outcome: &mut ResearchOutcome,
        fetch: &mut IncrementalFetch,
        content: &str,
        placeholder_name: &str,
    ) -> Result<(), SessionError> {
        let agent_id = self.session.create_agent(&self.agent).await?;
        info!(agent_id = %agent_id, "Created agent");

        let result = self
            .drive_with_agent(outcome, fetch, &agent_id, content, placeholder_name)
            .await;

        match self.session.delete_agent(&agent_id).await {
            Ok(()) => info!(agent_id = %agent_id, "Deleted agent"),
            Err(e) => warn!(agent_id = %agent_id, error = %e, "Failed to delete agent"),
        }
        result
    }

    async fn drive_with_agent(
        &self,
        outcome: &mut ResearchOutcome,
        fetch: &mut IncrementalFetch,
        agent_id: &str,
        content: &str,
        placeholder_name: &str,
    ) -> Result<(), SessionError> {
        let session = self.session.as_ref();
        let sink = self.sink.as_ref();
        let container = self.config.container.as_str();

        let thread_id = session.create_thread().await?;
        let message_id = session
            .post_message(&thread_id, MessageRole::User, content)
            .await?;
        info!(thread_id = %thread_id, message_id = %message_id, "Posted research task");
        self.transition(outcome, OrchestratorState::SessionCreated);

        let run_id = session.start_run(&thread_id, agent_id).await?;
        info!(run_id = %run_id, "Started agent run, this may take a few minutes");
        self.transition(outcome, OrchestratorState::TaskSubmitted);

        self.transition(outcome, OrchestratorState::Polling);
        let deadline = self.config.max_run_duration.map(|d| Instant::now() + d);
        let mut status = AgentRunStatus::Queued;
        while status.is_active() {
            if let Some(deadline) = deadline
                && Instant::now() >= deadline
            {
                let limit = self.config.max_run_duration.unwrap_or_default();
                warn!(run_id = %run_id, "Agent run exceeded maximum duration");
                outcome.last_error = Some(format!(
                    "Run exceeded maximum duration of {}s",
                    limit.as_secs()
                ));
                break;
            }

            tokio::time::sleep(self.config.poll_interval).await;
            let state = session.get_run_status(&thread_id, &run_id).await?;
            status = state.status;
            if state.last_error.is_some() {
                outcome.last_error = state.last_error;
            }

            fetch
                .poll(session, sink, &thread_id, container, &outcome.run_folder)
                .await?;
            info!(run_id = %run_id, status = %status, "Run status");
        }
        outcome.run_status = Some(status);
        info!(run_id = %run_id, status = %status, "Run finished");
        if status == AgentRunStatus::Failed {
            error!(
                run_id = %run_id,
                last_error = outcome.last_error.as_deref().unwrap_or("unknown"),
                "Agent run failed"
            );
        }

        self.transition(outcome, OrchestratorState::Finalizing);
        let final_message = session
            .get_last_message_by_role(&thread_id, MessageRole::Agent)
            .await?;
        let now = Utc::now();
        let final_filename = format!("final_research_summary_{}.md", compact_timestamp(now));
        if let Some(doc) =
            assembler::render(final_message.as_ref(), &final_filename, FINAL_TITLE, false, now)
        {
            let name = if self.config.overwrite_placeholder {
                placeholder_name
            } else {
                doc.filename.as_str()
            };
            persist(
                sink,
                container,
                &format!("{}/{}", outcome.run_folder, name),
                &doc,
            )
            .await;
            outcome.final_document = Some(doc);
        } else {
            warn!("No agent response to summarize");
        }

        if let Some(doc) = assembler::consolidate(fetch.documents(), Utc::now()) {
            persist(
                sink,
                container,
                &format!("{}/{}", outcome.run_folder, doc.filename),
                &doc,
            )
            .await;
            outcome.consolidated = Some(doc);
        }
        Ok(())
    }
}
