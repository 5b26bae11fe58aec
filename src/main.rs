use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;

mod commands;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Cadence - heartbeat scheduling for conversational agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the heartbeat runner until Ctrl-C
    Run {
        /// Agent configuration file (.toml, .yaml or .json)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
        /// Seconds between config file change checks
        #[arg(long, default_value_t = 2)]
        poll_secs: u64,
        /// Wake the default agent once right after startup
        #[arg(long)]
        wake_now: bool,
    },
    /// Print the resolved heartbeat schedule for a config file
    Status {
        /// Agent configuration file (.toml, .yaml or .json)
        #[arg(short, long, value_name = "FILE")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            config,
            poll_secs,
            wake_now,
        } => commands::run::run(&config, poll_secs, wake_now).await,
        Commands::Status { config } => commands::status::run(&config),
    };

    if let Err(e) = result {
        eprintln!("✗ {:#}", e);
        process::exit(1);
    }
}
