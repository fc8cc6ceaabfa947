use clap::Parser;
use pixelift::cli::{Cli, Commands, JobsCommand};
use pixelift::{api, config::Config, ops};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    // Missing required secrets or invalid settings terminate here with the
    // validator's message.
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("pixelift: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Api(args) => api::run(config, args.address, !args.no_workers).await?,
        Commands::Worker => api::run_worker(config).await?,
        Commands::Jobs { command } => match command {
            JobsCommand::Status { id } => ops::job_status(&config, &id).await?,
            JobsCommand::QueueStats => ops::queue_stats(&config).await?,
            JobsCommand::Replay { command } => ops::replay(&config, command).await?,
        },
    }

    Ok(())
}
