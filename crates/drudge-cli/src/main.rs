//! drudge binary: configuration loading and runtime wiring for the Discord
//! shell-job bot.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use drudge_discord_runtime::{run_discord_runtime, DiscordNotifier, DiscordRuntimeConfig};
use drudge_jobs::{JobNotification, JobNotifier, JobScheduler, JobSchedulerConfig};

#[derive(Debug, Parser)]
#[command(
    name = "drudge",
    about = "Discord bot that runs shell commands as queued jobs",
    version
)]
struct Cli {
    #[arg(
        long,
        default_value = "drudge.json",
        help = "Path to the JSON config file"
    )]
    config: PathBuf,

    #[arg(
        long,
        env = "DRUDGE_BOT_TOKEN",
        help = "Discord bot token; overrides the config file"
    )]
    token: Option<String>,

    #[arg(long, help = "Worker thread count override")]
    workers: Option<usize>,

    #[arg(long, help = "Job table capacity override; must be a power of two")]
    table_capacity: Option<usize>,

    #[arg(long, help = "Output capture window override, in bytes")]
    output_buffer_bytes: Option<usize>,

    #[arg(long, help = "Validate the configuration and exit")]
    check: bool,
}

/// On-disk configuration; every field is optional and defaulted.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct ConfigFile {
    #[serde(default)]
    bot_token: Option<String>,
    #[serde(default)]
    api_base: Option<String>,
    #[serde(default)]
    worker_count: Option<usize>,
    #[serde(default)]
    table_capacity: Option<usize>,
    #[serde(default)]
    output_buffer_bytes: Option<usize>,
}

struct Settings {
    scheduler: JobSchedulerConfig,
    runtime: DiscordRuntimeConfig,
}

struct NullNotifier;

impl JobNotifier for NullNotifier {
    fn notify(&self, _notification: JobNotification) {}
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

fn load_config_file(path: &Path) -> Result<ConfigFile> {
    match fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse {}", path.display())),
        Err(error) if error.kind() == ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(error) => {
            Err(error).with_context(|| format!("failed to read {}", path.display()))
        }
    }
}

fn resolve_settings(cli: &Cli, file: ConfigFile) -> Result<Settings> {
    let token = cli
        .token
        .clone()
        .or(file.bot_token)
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty());
    let Some(token) = token else {
        bail!("bot token missing: set bot_token in the config file or DRUDGE_BOT_TOKEN");
    };

    let mut scheduler = JobSchedulerConfig::default();
    if let Some(workers) = cli.workers.or(file.worker_count) {
        scheduler.worker_count = workers;
    }
    if let Some(table_capacity) = cli.table_capacity.or(file.table_capacity) {
        scheduler.table_capacity = table_capacity;
    }
    if let Some(output_buffer_bytes) = cli.output_buffer_bytes.or(file.output_buffer_bytes) {
        scheduler.output_buffer_bytes = output_buffer_bytes;
    }

    let mut runtime = DiscordRuntimeConfig::new(token);
    if let Some(api_base) = file.api_base {
        runtime.api_base = api_base.trim_end_matches('/').to_string();
    }

    Ok(Settings { scheduler, runtime })
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let file = load_config_file(&cli.config)?;
    let settings = resolve_settings(&cli, file)?;

    if cli.check {
        // Exercises the same validation a real boot performs.
        JobScheduler::start(settings.scheduler, Arc::new(NullNotifier))
            .context("invalid scheduler configuration")?
            .shutdown();
        println!("configuration ok");
        return Ok(());
    }

    let (notifier, notifications) = DiscordNotifier::channel();
    let scheduler = Arc::new(
        JobScheduler::start(settings.scheduler, Arc::new(notifier))
            .context("failed to start job scheduler")?,
    );

    let result =
        run_discord_runtime(settings.runtime, Arc::clone(&scheduler), notifications).await;

    match Arc::try_unwrap(scheduler) {
        Ok(scheduler) => scheduler.shutdown(),
        Err(_) => warn!("scheduler still referenced at exit; skipping drain"),
    }
    result
}
