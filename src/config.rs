//! Unified configuration for delve.
//!
//! Settings are layered: built-in defaults, then an optional `delve.toml`,
//! then environment variables (a `.env` file is loaded first by the binary),
//! then CLI flags applied by the command that needs them.
//!
//! # Configuration File Format
//!
//! ```toml
//! [server]
//! port = 8000
//! host = "0.0.0.0"
//!
//! [jobs]
//! log_dir = "/tmp/research_logs"
//! cleanup_hours = 24
//! cleanup_interval_seconds = 3600
//!
//! [agent]
//! endpoint = "https://example.services.ai.azure.com/api/projects/demo"
//! model = "gpt-4o"
//! deep_research_model = "o3-deep-research"
//! bing_connection_id = "/subscriptions/.../connections/bing"
//! poll_interval_ms = 1000
//!
//! [storage]
//! container = "research-summaries"
//! account_name = "mystorage"
//! placeholder_name = "research_summary_inprogress.md"
//! overwrite_placeholder = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::util::parse_flag;

/// Default config file name looked up in the working directory.
pub const CONFIG_FILE_NAME: &str = "delve.toml";

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Permissive CORS for a locally served front-end.
    #[serde(default)]
    pub dev_mode: bool,
}

fn default_port() -> u16 {
    8000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            dev_mode: false,
        }
    }
}

/// Job supervision and cleanup settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsSection {
    /// Executable launched for each research job. Defaults to the running binary.
    #[serde(default)]
    pub executable: Option<PathBuf>,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_cleanup_hours")]
    pub cleanup_hours: u64,
    #[serde(default = "default_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

fn default_log_dir() -> PathBuf {
    let temp = std::env::var_os("TEMP")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    temp.join("research_logs")
}

fn default_cleanup_hours() -> u64 {
    24
}

fn default_cleanup_interval_seconds() -> u64 {
    3600
}

impl Default for JobsSection {
    fn default() -> Self {
        Self {
            executable: None,
            log_dir: default_log_dir(),
            cleanup_hours: default_cleanup_hours(),
            cleanup_interval_seconds: default_cleanup_interval_seconds(),
        }
    }
}

impl JobsSection {
    /// Resolve the executable the supervisor should launch.
    pub fn resolve_executable(&self) -> Result<PathBuf> {
        match &self.executable {
            Some(path) => Ok(path.clone()),
            None => std::env::current_exe().context("Failed to resolve current executable"),
        }
    }

    pub fn cleanup_threshold(&self) -> Duration {
        Duration::from_secs(self.cleanup_hours.saturating_mul(3600))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }
}

/// Agent service settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub deep_research_model: Option<String>,
    #[serde(default)]
    pub bing_connection_id: Option<String>,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default = "default_instructions")]
    pub instructions: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on the polling phase. Unset means poll until the run ends.
    #[serde(default)]
    pub max_run_seconds: Option<u64>,
    /// Task used by `delve research` when no content is passed.
    #[serde(default)]
    pub default_content: Option<String>,
}

fn default_api_version() -> String {
    "v1".to_string()
}

fn default_agent_name() -> String {
    "deep-research-agent".to_string()
}

fn default_instructions() -> String {
    "You are a helpful Agent that assists in researching topics as requested by the user."
        .to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_token: None,
            api_version: default_api_version(),
            model: None,
            deep_research_model: None,
            bing_connection_id: None,
            agent_name: default_agent_name(),
            instructions: default_instructions(),
            poll_interval_ms: default_poll_interval_ms(),
            max_run_seconds: None,
            default_content: None,
        }
    }
}

impl AgentSection {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_run_duration(&self) -> Option<Duration> {
        self.max_run_seconds.map(Duration::from_secs)
    }
}

/// Blob storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default)]
    pub account_name: Option<String>,
    #[serde(default)]
    pub sas_token: Option<String>,
    /// Overrides `https://<account>.blob.core.windows.net`.
    #[serde(default)]
    pub blob_endpoint: Option<String>,
    /// Write documents to this directory instead of remote storage.
    #[serde(default)]
    pub local_dir: Option<PathBuf>,
    #[serde(default = "default_placeholder_name")]
    pub placeholder_name: String,
    #[serde(default)]
    pub placeholder_add_timestamp: bool,
    #[serde(default)]
    pub overwrite_placeholder: bool,
}

fn default_container() -> String {
    "research-summaries".to_string()
}

fn default_placeholder_name() -> String {
    "research_summary_inprogress.md".to_string()
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            container: default_container(),
            account_name: None,
            sas_token: None,
            blob_endpoint: None,
            local_dir: None,
            placeholder_name: default_placeholder_name(),
            placeholder_add_timestamp: false,
            overwrite_placeholder: false,
        }
    }
}

impl StorageSection {
    /// Base URL of the blob service, if remote storage is configured.
    pub fn blob_endpoint(&self) -> Option<String> {
        self.blob_endpoint
            .clone()
            .or_else(|| {
                self.account_name
                    .as_ref()
                    .map(|account| format!("https://{}.blob.core.windows.net", account))
            })
            .map(|url| url.trim_end_matches('/').to_string())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub jobs: JobsSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub storage: StorageSection,
}

impl Settings {
    /// Parse settings from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse delve.toml")
    }

    /// Load settings from a TOML file.
    pub fn load_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Load the full layered configuration: file (explicit path, else
    /// `delve.toml` in the working directory if present), then the process
    /// environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load_file(path)?,
            None if Path::new(CONFIG_FILE_NAME).exists() => {
                Self::load_file(Path::new(CONFIG_FILE_NAME))?
            }
            None => Self::default(),
        };
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Apply environment overrides using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("PORT") {
            self.server.port = v.trim().parse().with_context(|| format!("Invalid PORT '{}'", v))?;
        }

        if let Some(v) = get("RESEARCH_JOB_EXECUTABLE") {
            let path = PathBuf::from(v);
            // An override pointing nowhere falls back to the running binary.
            if path.exists() {
                self.jobs.executable = Some(path);
            } else {
                tracing::warn!(path = %path.display(), "RESEARCH_JOB_EXECUTABLE does not exist, ignoring");
            }
        }
        if let Some(v) = get("RESEARCH_LOG_DIR") {
            self.jobs.log_dir = PathBuf::from(v);
        }
        if let Some(v) = get("RUN_CLEANUP_HOURS") {
            self.jobs.cleanup_hours = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid RUN_CLEANUP_HOURS '{}'", v))?;
        }
        if let Some(v) = get("RUN_CLEANUP_INTERVAL_SECONDS") {
            self.jobs.cleanup_interval_seconds = v
                .trim()
                .parse()
                .with_context(|| format!("Invalid RUN_CLEANUP_INTERVAL_SECONDS '{}'", v))?;
        }

        if let Some(v) = get("PROJECT_ENDPOINT") {
            self.agent.endpoint = Some(v);
        }
        if let Some(v) = get("AGENT_API_TOKEN") {
            self.agent.api_token = Some(v);
        }
        if let Some(v) = get("AGENT_API_VERSION") {
            self.agent.api_version = v;
        }
        if let Some(v) = get("MODEL_DEPLOYMENT_NAME") {
            self.agent.model = Some(v);
        }
        if let Some(v) = get("DEEP_RESEARCH_MODEL_DEPLOYMENT_NAME") {
            self.agent.deep_research_model = Some(v);
        }
        if let Some(v) = get("BING_CONNECTION_ID") {
            self.agent.bing_connection_id = Some(v);
        }
        if let Some(v) = get("RESEARCH_MAX_RUN_SECONDS") {
            self.agent.max_run_seconds = Some(
                v.trim()
                    .parse()
                    .with_context(|| format!("Invalid RESEARCH_MAX_RUN_SECONDS '{}'", v))?,
            );
        }
        if let Some(v) = get("RESEARCH_DEFAULT_CONTENT") {
            self.agent.default_content = Some(v);
        }

        if let Some(v) = get("AZURE_STORAGE_CONTAINER_NAME") {
            self.storage.container = v;
        }
        if let Some(v) = get("AZURE_STORAGE_ACCOUNT_NAME") {
            self.storage.account_name = Some(v);
        }
        if let Some(v) = get("AZURE_STORAGE_SAS_TOKEN") {
            self.storage.sas_token = Some(v);
        }
        if let Some(v) = get("AZURE_STORAGE_BLOB_ENDPOINT") {
            self.storage.blob_endpoint = Some(v);
        }
        if let Some(v) = get("RESEARCH_OUTPUT_DIR") {
            self.storage.local_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = get("AZURE_INIT_BLOB_NAME") {
            self.storage.placeholder_name = v;
        }
        if let Some(v) = get("AZURE_INIT_BLOB_ADD_TIMESTAMP") {
            self.storage.placeholder_add_timestamp = parse_flag(&v);
        }
        if let Some(v) = get("AZURE_OVERWRITE_PLACEHOLDER") {
            self.storage.overwrite_placeholder = parse_flag(&v);
        }

        Ok(())
    }
}
