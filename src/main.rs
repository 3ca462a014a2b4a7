use anyhow::Result;
use clap::Parser;

mod cli;
mod config;
mod gatekeeper;
mod git;
mod locks;
mod logs;
mod orchestrator;
mod ports;
mod runtime;
mod store;
mod supervisor;
mod telemetry;
mod worktree;

use cli::commands::{start, status, stop, verify, EXIT_ERROR};
use cli::{Cli, Commands};
use config::AutocoderConfig;
use runtime::Runtime;

#[tokio::main]
async fn main() {
    std::process::exit(run().await.unwrap_or_else(|err| {
        eprintln!("error: {err:#}");
        EXIT_ERROR
    }));
}

async fn run() -> Result<i32> {
    AutocoderConfig::load_env_file();
    let config = AutocoderConfig::load()?;

    telemetry::init_telemetry(&config.observability)?;

    let cli = Cli::parse();
    let project_dir = cli
        .project_dir
        .unwrap_or_else(|| std::env::current_dir().expect("current directory is accessible"));

    let runtime = Runtime::bootstrap(&project_dir, config).await?;

    let exit_code = match cli.command {
        Commands::Start { agents } => start::run(runtime.clone(), agents).await,
        Commands::Stop => stop::run(&runtime),
        Commands::Status => status::run(&runtime).await,
        Commands::Verify {
            branch,
            allow_no_tests,
        } => verify::run(&runtime, &branch, allow_no_tests),
    };

    runtime.shutdown().await;
    telemetry::shutdown_telemetry();

    exit_code
}
