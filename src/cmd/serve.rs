//! HTTP server command (`delve serve`).

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use delve::config::Settings;
use delve::jobs::{CleanupSweeper, CommandSpec, RunRegistry};
use delve::web::{AppState, ServerConfig, start_server};

pub async fn cmd_serve(
    mut settings: Settings,
    config_path: Option<&Path>,
    port: Option<u16>,
    dev: bool,
) -> Result<()> {
    if let Some(port) = port {
        settings.server.port = port;
    }
    if dev {
        settings.server.dev_mode = true;
    }

    let command = research_command(&settings, config_path)?;
    info!(
        executable = %command.executable.display(),
        log_dir = %settings.jobs.log_dir.display(),
        "Research jobs configured"
    );

    let registry = RunRegistry::new();
    let sweeper = CleanupSweeper::new(
        registry.clone(),
        settings.jobs.cleanup_threshold(),
        settings.jobs.cleanup_interval(),
    )
    .spawn();
    info!(
        threshold_hours = settings.jobs.cleanup_hours,
        interval_seconds = settings.jobs.cleanup_interval_seconds,
        "Run cleanup scheduled"
    );

    let config = ServerConfig::from_settings(&settings.server);
    let state = Arc::new(AppState::new(registry, command, settings));
    let result = start_server(config, state).await;

    sweeper.abort();
    result
}

/// `<executable> [--config <path>] research -- <payload>`; the payload is
/// appended by the supervisor.
fn research_command(settings: &Settings, config_path: Option<&Path>) -> Result<CommandSpec> {
    let mut command = CommandSpec::new(settings.jobs.resolve_executable()?);
    if let Some(path) = config_path {
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        command = command
            .arg("--config")
            .arg(path.to_string_lossy().into_owned());
    }
    command = command.arg("research").arg("--");
    if let Ok(cwd) = std::env::current_dir() {
        command = command.cwd(cwd);
    }
    Ok(command)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_research_command_uses_configured_executable() {
        let mut settings = Settings::default();
        settings.jobs.executable = Some(PathBuf::from("/opt/delve/bin/delve"));
        let command = research_command(&settings, None).unwrap();
        assert_eq!(command.executable, PathBuf::from("/opt/delve/bin/delve"));
        assert_eq!(command.args, vec!["research".to_string(), "--".to_string()]);
    }

    #[test]
    fn test_research_command_forwards_config_path() {
        let settings = Settings::default();
        let command = research_command(&settings, Some(Path::new("/etc/delve.toml"))).unwrap();
        assert_eq!(
            command.args,
            vec!["--config", "/etc/delve.toml", "research", "--"]
        );
    }
}
