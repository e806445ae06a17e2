use clap::{Parser, Subcommand};

use anssl_agent::version;

#[derive(Debug, Parser)]
#[command(
    name = "anssl",
    version = version::VERSION,
    about = "Automatic certificate deployment agent"
)]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short = 'c', long = "config", global = true, default_value = "config.yaml")]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the agent in the background under the supervisor.
    Daemon,
    /// Run the worker in the foreground (debugging).
    Start,
    /// Stop the background agent.
    Stop,
    /// Stop and start the background agent.
    Restart,
    /// Show whether the background agent is running.
    Status,
    /// Print the agent log.
    Log {
        /// Keep printing as new lines are appended.
        #[arg(short = 'f', long = "follow")]
        follow: bool,
    },
    /// Check whether a newer release is available.
    CheckUpdate,
    /// Download and install the latest release.
    Update,
    /// Print the agent version.
    Version,
    /// Internal: supervisor loop (spawned by `daemon`).
    #[command(name = "_supervisor", hide = true)]
    Supervisor,
}
