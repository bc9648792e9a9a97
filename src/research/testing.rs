//! In-memory doubles for the research collaborators.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::errors::{SessionError, UploadError};

use super::session::{AgentMessage, AgentRunStatus, AgentSession, AgentSpec, MessageRole, RunState};
use super::sink::{BlobEntry, BlobSink};

/// Replays canned run statuses and agent messages. When a script has one
/// entry left it keeps returning it.
#[derive(Default)]
pub struct ScriptedSession {
    statuses: Mutex<VecDeque<RunState>>,
    messages: Mutex<VecDeque<Option<AgentMessage>>>,
    fail_thread: bool,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedSession {
    pub fn new(statuses: Vec<AgentRunStatus>, messages: Vec<Option<AgentMessage>>) -> Self {
        Self {
            statuses: Mutex::new(
                statuses
                    .into_iter()
                    .map(|status| RunState {
                        status,
                        last_error: None,
                    })
                    .collect(),
            ),
            messages: Mutex::new(messages.into()),
            ..Self::default()
        }
    }

    pub fn with_states(states: Vec<RunState>, messages: Vec<Option<AgentMessage>>) -> Self {
        Self {
            statuses: Mutex::new(states.into()),
            messages: Mutex::new(messages.into()),
            ..Self::default()
        }
    }

    pub fn failing_thread_creation() -> Self {
        Self {
            fail_thread: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

fn next_or_last<T: Clone>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    let mut queue = queue.lock().unwrap();
    if queue.len() > 1 {
        queue.pop_front()
    } else {
        queue.front().cloned()
    }
}

pub fn agent_message(id: &str, text: &str) -> AgentMessage {
    AgentMessage {
        id: id.to_string(),
        text_segments: vec![text.to_string()],
        url_citations: Vec::new(),
    }
}

#[async_trait]
impl AgentSession for ScriptedSession {
    async fn create_agent(&self, spec: &AgentSpec) -> Result<String, SessionError> {
        self.record(format!("create_agent:{}", spec.name));
        Ok("agent-1".into())
    }

    async fn create_thread(&self) -> Result<String, SessionError> {
        self.record("create_thread");
        if self.fail_thread {
            return Err(SessionError::Api {
                status: 500,
                message: "thread service unavailable".into(),
            });
        }
        Ok("thread-1".into())
    }

    async fn post_message(
        &self,
        _thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<String, SessionError> {
        self.record(format!("post_message:{:?}:{}", role, content));
        Ok("msg-user".into())
    }

    async fn start_run(&self, _thread_id: &str, _agent_id: &str) -> Result<String, SessionError> {
        self.record("start_run");
        Ok("run-1".into())
    }

    async fn get_run_status(
        &self,
        _thread_id: &str,
        _run_id: &str,
    ) -> Result<RunState, SessionError> {
        self.record("get_run_status");
        Ok(next_or_last(&self.statuses).unwrap_or(RunState {
            status: AgentRunStatus::Completed,
            last_error: None,
        }))
    }

    async fn get_last_message_by_role(
        &self,
        _thread_id: &str,
        _role: MessageRole,
    ) -> Result<Option<AgentMessage>, SessionError> {
        self.record("get_last_message");
        Ok(next_or_last(&self.messages).flatten())
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), SessionError> {
        self.record(format!("delete_agent:{}", agent_id));
        Ok(())
    }
}

/// Collects every `put` in memory. Paths containing `fail_on` are rejected.
#[derive(Default)]
pub struct MemorySink {
    pub puts: Mutex<Vec<(String, String, String)>>,
    fail_on: Option<String>,
}

impl MemorySink {
    pub fn failing_on(fragment: &str) -> Self {
        Self {
            fail_on: Some(fragment.to_string()),
            ..Self::default()
        }
    }

    pub fn paths(&self) -> Vec<String> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, path, _)| path.clone())
            .collect()
    }

    pub fn content_of(&self, path: &str) -> Option<String> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(_, p, _)| p == path)
            .map(|(_, _, content)| content.clone())
    }
}

#[async_trait]
impl BlobSink for MemorySink {
    async fn put(
        &self,
        container: &str,
        path: &str,
        bytes: Vec<u8>,
        _content_type: &str,
    ) -> Result<(), UploadError> {
        if let Some(fragment) = &self.fail_on
            && path.contains(fragment.as_str())
        {
            return Err(UploadError::Rejected {
                path: path.to_string(),
                status: 503,
                message: "unavailable".into(),
            });
        }
        self.puts.lock().unwrap().push((
            container.to_string(),
            path.to_string(),
            String::from_utf8_lossy(&bytes).into_owned(),
        ));
        Ok(())
    }

    async fn list(&self, container: &str, prefix: &str) -> Result<Vec<BlobEntry>, UploadError> {
        let puts = self.puts.lock().unwrap();
        let mut entries: Vec<BlobEntry> = Vec::new();
        for (c, path, content) in puts.iter() {
            if c != container || !path.starts_with(prefix) {
                continue;
            }
            entries.retain(|e| &e.name != path);
            entries.push(BlobEntry {
                name: path.clone(),
                size: Some(content.len() as u64),
                last_modified: None,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn get(&self, container: &str, path: &str) -> Result<Vec<u8>, UploadError> {
        self.puts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(c, p, _)| c == container && p == path)
            .map(|(_, _, content)| content.clone().into_bytes())
            .ok_or_else(|| UploadError::NotFound {
                path: format!("{}/{}", container, path),
            })
    }
}
