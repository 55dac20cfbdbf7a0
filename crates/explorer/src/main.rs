//! rspec-explorer - test explorer backend
//!
//! Main entry point. State events go to stdout as JSON lines; logs go to
//! stderr.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::{Parser, Subcommand};
use explorer::{Engine, JsonLinesSink, ProcessRunner, SharedSink};
use explorer_core::{Config, ROOT_ID};
use eyre::WrapErr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "rspec-explorer")]
#[command(about = "Discover and run RSpec examples, streaming test state events")]
#[command(version)]
struct Cli {
    /// Config file path (overrides .rspec-explorer/config)
    #[arg(long, global = true, env = "RSPEC_EXPLORER_CONFIG")]
    config: Option<PathBuf>,

    /// Project root (default: current directory)
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Command used to invoke RSpec
    #[arg(long, global = true)]
    test_command: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the discovered test tree as JSON
    Tree,

    /// Run tests by id, streaming state events
    Run {
        /// Node ids to run (default: the whole suite)
        ids: Vec<String>,
    },
}

fn load_config(cli: &Cli) -> eyre::Result<Config> {
    let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
    let project_root = cli.project_root.clone().unwrap_or_else(|| cwd.clone());

    let mut config = Config::load_project(&project_root)
        .wrap_err_with(|| format!("failed to load config in {}", project_root.display()))?;
    if let Some(path) = &cli.config {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config file {}", path.display()))?;
    }
    if let Some(project_root) = &cli.project_root {
        config.project_root = project_root.clone();
    }
    if let Some(test_command) = &cli.test_command {
        config.test_command = test_command.clone();
    }
    config.resolve_paths(&cwd);
    Ok(config)
}

fn main() -> eyre::Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&cli)?;
    info!(
        project_root = %config.project_root.display(),
        test_command = %config.test_command,
        "loaded config"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .wrap_err("failed to create tokio runtime")?;

    runtime.block_on(async {
        let events: SharedSink = Arc::new(JsonLinesSink);
        let runner = ProcessRunner::new(Arc::clone(&events));
        let engine = Engine::new(config, runner, events);

        match cli.command {
            Command::Tree => {
                let tree = engine.load_tests().await.wrap_err("test discovery failed")?;
                println!("{}", serde_json::to_string_pretty(&*tree)?);
            }
            Command::Run { ids } => {
                let ids = if ids.is_empty() {
                    vec![ROOT_ID.to_string()]
                } else {
                    ids
                };

                let run = engine.run_selected(&ids);
                tokio::pin!(run);
                let finished = tokio::select! {
                    result = &mut run => Some(result),
                    _ = tokio::signal::ctrl_c() => None,
                };
                let result = match finished {
                    Some(result) => result,
                    None => {
                        info!("received SIGINT, cancelling run");
                        engine.cancel().await;
                        run.await
                    }
                };
                result.wrap_err("test run failed")?;
            }
        }
        Ok::<(), eyre::Report>(())
    })
}
