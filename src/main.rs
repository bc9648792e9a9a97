use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use delve::config::Settings;
use delve::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "delve")]
#[command(version, about = "Deep research job runner")]
pub struct Cli {
    /// Path to a delve.toml config file. Defaults to ./delve.toml when present.
    #[arg(long, global = true, env = "DELVE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "DELVE_LOG_FORMAT")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server and the run cleanup sweeper
    Serve {
        /// Port to listen on (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
        /// Enable permissive CORS for a locally served front-end
        #[arg(long)]
        dev: bool,
    },
    /// Run one deep research session in the foreground
    Research {
        /// Research task; words are joined with spaces
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        content: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    logging::init(cli.log_format);

    let settings = Settings::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Serve { port, dev } => {
            cmd::cmd_serve(settings, cli.config.as_deref(), port, dev).await?;
        }
        Commands::Research { content } => {
            let outcome = cmd::cmd_research(&settings, &content).await?;
            if outcome.is_failed() {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
