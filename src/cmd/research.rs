//! Foreground research session (`delve research`).
//!
//! This is also what the server launches for each submitted run, so
//! everything printed here ends up in the run log.

use anyhow::{Context, Result};

use delve::config::Settings;
use delve::research::{ResearchOrchestrator, ResearchOutcome};
use delve::util::preview;

pub async fn cmd_research(settings: &Settings, content: &[String]) -> Result<ResearchOutcome> {
    let content = resolve_content(content, settings.agent.default_content.as_deref())?;
    println!("Using research content: {}", preview(&content, 100));

    let orchestrator = ResearchOrchestrator::from_settings(settings)
        .context("Failed to set up the research session")?;
    let outcome = orchestrator.run(&content).await;

    println!();
    println!("Research finished: {}", outcome.state);
    if let Some(status) = &outcome.run_status {
        println!("  Agent run status: {}", status);
    }
    if let Some(error) = &outcome.last_error {
        println!("  Last error: {}", error);
    }
    println!("  Run folder: {}", outcome.run_folder);
    println!("  Research steps captured: {}", outcome.intermediates.len());
    if let Some(doc) = &outcome.final_document {
        println!("  Final summary: {}", doc.filename);
    }
    if let Some(doc) = &outcome.consolidated {
        println!("  Consolidated summary: {}", doc.filename);
    }

    Ok(outcome)
}

/// Arguments joined with spaces, falling back to the configured default task.
fn resolve_content(args: &[String], default: Option<&str>) -> Result<String> {
    let joined = args.join(" ");
    let joined = joined.trim();
    if !joined.is_empty() {
        return Ok(joined.to_string());
    }
    match default.map(str::trim).filter(|d| !d.is_empty()) {
        Some(default) => Ok(default.to_string()),
        None => anyhow::bail!(
            "No research content given. Pass it as arguments or set RESEARCH_DEFAULT_CONTENT."
        ),
    }
}
