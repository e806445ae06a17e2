//! `anssl` command-line surface. The interesting work lives in the agent
//! and updater crates; this crate parses arguments and routes.

pub mod args;
pub mod commands;

use clap::Parser;

pub use args::{Cli, Commands};

pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon => commands::daemon::handle_daemon(&cli.config).await,
        Commands::Start => {
            anssl_agent::telemetry::init_tracing();
            anssl_agent::runner::run(&cli.config).await
        }
        Commands::Stop => commands::handle_stop().await,
        Commands::Restart => commands::daemon::handle_restart(&cli.config).await,
        Commands::Status => commands::handle_status(),
        Commands::Log { follow } => commands::log::handle_log(&cli.config, follow).await,
        Commands::CheckUpdate => commands::update::handle_check_update(&cli.config).await,
        Commands::Update => commands::update::handle_update(&cli.config).await,
        Commands::Version => {
            println!("anssl {}", anssl_agent::version::VERSION);
            Ok(())
        }
        Commands::Supervisor => {
            anssl_agent::telemetry::init_tracing();
            anssl_agent::supervisor::run(&cli.config).await
        }
    }
}
