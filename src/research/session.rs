use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::AgentSection;
use crate::errors::SessionError;

/// Abstraction over the managed agent service.
/// Real implementation: `HttpAgentSession`. Test double: `ScriptedSession`.
#[async_trait]
pub trait AgentSession: Send + Sync {
    async fn create_agent(&self, spec: &AgentSpec) -> Result<String, SessionError>;

    async fn create_thread(&self) -> Result<String, SessionError>;

    async fn post_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<String, SessionError>;

    async fn start_run(&self, thread_id: &str, agent_id: &str) -> Result<String, SessionError>;

    async fn get_run_status(&self, thread_id: &str, run_id: &str)
    -> Result<RunState, SessionError>;

    async fn get_last_message_by_role(
        &self,
        thread_id: &str,
        role: MessageRole,
    ) -> Result<Option<AgentMessage>, SessionError>;

    async fn delete_agent(&self, agent_id: &str) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MessageRole {
    #[serde(rename = "user")]
    User,
    #[serde(rename = "assistant")]
    Agent,
}

/// Agent run lifecycle as reported by the service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AgentRunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Expired,
    #[serde(other)]
    Unknown,
}

impl AgentRunStatus {
    /// Still worth polling.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::InProgress)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::RequiresAction => "requires_action",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Completed => "completed",
            Self::Expired => "expired",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for AgentRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub status: AgentRunStatus,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlCitation {
    pub url: String,
    pub title: Option<String>,
}

/// One agent-authored message, flattened to what the summaries need.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentMessage {
    pub id: String,
    pub text_segments: Vec<String>,
    pub url_citations: Vec<UrlCitation>,
}

/// Everything needed to create the research agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentSpec {
    pub model: String,
    pub name: String,
    pub instructions: String,
    pub tools: Vec<serde_json::Value>,
}

impl AgentSpec {
    /// Build the deep-research agent definition from settings.
    pub fn from_settings(agent: &AgentSection) -> Result<Self, SessionError> {
        let model = required(&agent.model, "MODEL_DEPLOYMENT_NAME")?;
        let deep_research_model =
            required(&agent.deep_research_model, "DEEP_RESEARCH_MODEL_DEPLOYMENT_NAME")?;
        let connection_id = required(&agent.bing_connection_id, "BING_CONNECTION_ID")?;
        Ok(Self {
            model: model.to_string(),
            name: agent.agent_name.clone(),
            instructions: agent.instructions.clone(),
            tools: vec![deep_research_tool(deep_research_model, connection_id)],
        })
    }
}

fn required<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, SessionError> {
    value
        .as_deref()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| SessionError::NotConfigured(format!("{} is not set", name)))
}

/// Tool definition enabling deep research grounded on a Bing connection.
pub fn deep_research_tool(deep_research_model: &str, bing_connection_id: &str) -> serde_json::Value {
    json!({
        "type": "deep_research",
        "deep_research": {
            "deep_research_model": deep_research_model,
            "deep_research_bing_grounding_connections": [
                { "connection_id": bing_connection_id }
            ]
        }
    })
}

// ── Wire types ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    status: AgentRunStatus,
    #[serde(default)]
    last_error: Option<RunErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RunErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RunErrorBody {
    fn describe(self) -> Option<String> {
        match (self.code, self.message) {
            (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
            (None, Some(message)) => Some(message),
            (Some(code), None) => Some(code),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    id: String,
    role: String,
    #[serde(default)]
    content: Vec<WireContent>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<WireText>,
}

#[derive(Debug, Deserialize)]
struct WireText {
    value: String,
    #[serde(default)]
    annotations: Vec<WireAnnotation>,
}

#[derive(Debug, Deserialize)]
struct WireAnnotation {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    url_citation: Option<WireUrlCitation>,
}

#[derive(Debug, Deserialize)]
struct WireUrlCitation {
    url: String,
    #[serde(default)]
    title: Option<String>,
}

impl From<WireMessage> for AgentMessage {
    fn from(message: WireMessage) -> Self {
        let mut text_segments = Vec::new();
        let mut url_citations = Vec::new();
        for part in message.content {
            let Some(text) = part.text.filter(|_| part.kind == "text") else {
                continue;
            };
            for annotation in text.annotations {
                if annotation.kind != "url_citation" {
                    continue;
                }
                if let Some(citation) = annotation.url_citation {
                    url_citations.push(UrlCitation {
                        url: citation.url,
                        title: citation.title.filter(|t| !t.is_empty()),
                    });
                }
            }
            text_segments.push(text.value);
        }
        AgentMessage {
            id: message.id,
            text_segments,
            url_citations,
        }
    }
}

// ── HTTP implementation ───────────────────────────────────────────────

/// Agent session over the service's REST API.
pub struct HttpAgentSession {
    client: reqwest::Client,
    endpoint: String,
    api_version: String,
    token: Option<String>,
}

impl HttpAgentSession {
    pub fn new(endpoint: &str, api_version: &str, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_version: api_version.to_string(),
            token,
        }
    }

    pub fn from_settings(agent: &AgentSection) -> Result<Self, SessionError> {
        let endpoint = required(&agent.endpoint, "PROJECT_ENDPOINT")?;
        Ok(Self::new(
            endpoint,
            &agent.api_version,
            agent.api_token.clone(),
        ))
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.endpoint, path))
            .query(&[("api-version", self.api_version.as_str())]);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send<T: DeserializeOwned>(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<T, SessionError> {
        let resp = check(builder.send().await?).await?;
        resp.json::<T>()
            .await
            .map_err(|e| SessionError::Decode(e.to_string()))
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response, SessionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let message = resp.text().await.unwrap_or_default();
    Err(SessionError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl AgentSession for HttpAgentSession {
    async fn create_agent(&self, spec: &AgentSpec) -> Result<String, SessionError> {
        let created: IdResponse = self
            .send(self.request(reqwest::Method::POST, "/assistants").json(spec))
            .await?;
        Ok(created.id)
    }

    async fn create_thread(&self) -> Result<String, SessionError> {
        let created: IdResponse = self
            .send(self.request(reqwest::Method::POST, "/threads").json(&json!({})))
            .await?;
        Ok(created.id)
    }

    async fn post_message(
        &self,
        thread_id: &str,
        role: MessageRole,
        content: &str,
    ) -> Result<String, SessionError> {
        let created: IdResponse = self
            .send(
                self.request(
                    reqwest::Method::POST,
                    &format!("/threads/{}/messages", thread_id),
                )
                .json(&json!({ "role": role, "content": content })),
            )
            .await?;
        Ok(created.id)
    }

    async fn start_run(&self, thread_id: &str, agent_id: &str) -> Result<String, SessionError> {
        let created: IdResponse = self
            .send(
                self.request(reqwest::Method::POST, &format!("/threads/{}/runs", thread_id))
                    .json(&json!({ "assistant_id": agent_id })),
            )
            .await?;
        Ok(created.id)
    }

    async fn get_run_status(
        &self,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunState, SessionError> {
        let run: RunResponse = self
            .send(self.request(
                reqwest::Method::GET,
                &format!("/threads/{}/runs/{}", thread_id, run_id),
            ))
            .await?;
        Ok(RunState {
            status: run.status,
            last_error: run.last_error.and_then(RunErrorBody::describe),
        })
    }

    async fn get_last_message_by_role(
        &self,
        thread_id: &str,
        role: MessageRole,
    ) -> Result<Option<AgentMessage>, SessionError> {
        let wanted = match role {
            MessageRole::User => "user",
            MessageRole::Agent => "assistant",
        };
        let list: MessageList = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("/threads/{}/messages", thread_id),
                )
                .query(&[("order", "desc"), ("limit", "20")]),
            )
            .await?;
        Ok(list
            .data
            .into_iter()
            .find(|m| m.role == wanted)
            .map(AgentMessage::from))
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), SessionError> {
        let resp = self
            .request(
                reqwest::Method::DELETE,
                &format!("/assistants/{}", agent_id),
            )
            .send()
            .await?;
        check(resp).await?;
        Ok(())
    }
}
