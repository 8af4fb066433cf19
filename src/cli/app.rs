use super::script::{Script, ScriptRunner};
use clap::{Parser, Subcommand};
use optisync::{EngineConfig, InMemorySyncClient};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "optisync")]
#[command(about = "Replays scripted editing sessions against an in-memory server")]
pub struct App {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Runs a JSON script and prints results and sync events as JSON lines.
    Replay {
        script: PathBuf,
        /// Overrides the debounce window of the script's config.
        #[arg(long)]
        window_ms: Option<u64>,
        /// Simulated round trip of every server call.
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
    },
    /// Validates an engine config file.
    CheckConfig { file: PathBuf },
}

impl App {
    pub fn from_args() -> Self {
        Self::parse()
    }

    pub async fn run(self) -> Result<(), Box<dyn Error>> {
        init_tracing();

        match self.command {
            Command::Replay {
                script,
                window_ms,
                latency_ms,
            } => {
                let script = Script::load(&script)?;
                let mut config = script.config.clone().unwrap_or_default();
                if let Some(window_ms) = window_ms {
                    config = config.debounce_window_ms(window_ms);
                }
                let client =
                    InMemorySyncClient::new().with_latency(Duration::from_millis(latency_ms));
                ScriptRunner::new(config, client)?.run(script).await?;
                Ok(())
            }
            Command::CheckConfig { file } => {
                let config = EngineConfig::load(&file)?;
                config.validate()?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
        }
    }
}

/// Logs go to stderr so stdout stays machine readable.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
