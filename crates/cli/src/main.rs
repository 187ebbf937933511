//! toolchat CLI: the main entry point.
//!
//! Commands:
//! - `chat`: Interactive chat, or a single message with `-m`
//! - `tools`: List the built-in tools
//! - `config`: Write or show the configuration file

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "toolchat",
    about = "toolchat: local LLM chat with approved tool calls",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Chat with a local model
    Chat {
        /// Model to load (overrides the config file)
        #[arg(long)]
        model: Option<String>,

        /// OpenAI-compatible base URL (overrides the config file)
        #[arg(long)]
        engine_url: Option<String>,

        /// Send a single message instead of entering interactive mode
        #[arg(short, long)]
        message: Option<String>,

        /// Approve every tool call without asking
        #[arg(short, long)]
        yes: bool,
    },

    /// List the built-in tools and their argument schemas
    Tools,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file if none exists
    Init,
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Logs go to stderr so they never interleave with streamed replies
    let filter = if cli.verbose { "debug" } else { "warn" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }

    match cli.command {
        Commands::Chat {
            model,
            engine_url,
            message,
            yes,
        } => {
            let options = commands::chat::ChatOptions {
                model,
                engine_url,
                message,
                auto_approve: yes,
            };
            commands::chat::run(options).await?
        }
        Commands::Tools => commands::tools::run()?,
        Commands::Config { action } => match action {
            ConfigAction::Init => commands::config_cmd::init()?,
            ConfigAction::Show => commands::config_cmd::show()?,
        },
    }

    Ok(())
}
