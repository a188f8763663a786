use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tokio::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;
use xferd_protocol::{Command, CommandRequest};

mod cli;
mod client;

use client::XferClient;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
#[command(name = "xferctl")]
struct Cli {
    /// Socket path to connect to xferd daemon
    #[arg(short, long, default_value = "/run/xferd/xferd.sock")]
    socket: PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args, Debug, Clone)]
struct SubmitArgs {
    /// Key the result is reported under (default: a fresh UUID)
    #[arg(long)]
    key: Option<String>,
    /// Request id (default: a fresh UUID)
    #[arg(long)]
    uid: Option<String>,
    /// Wait for the result notification
    #[arg(short, long)]
    wait: bool,
    /// Seconds to wait with --wait
    #[arg(long, default_value = "300")]
    timeout: u64,
}

impl SubmitArgs {
    fn request(&self, command: Command) -> CommandRequest {
        CommandRequest {
            uid: self.uid.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            async_key: self.key.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            command,
        }
    }

    fn wait(&self) -> Option<Duration> {
        self.wait.then(|| Duration::from_secs(self.timeout))
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Download a file to the device
    Download {
        /// Delivery URL
        #[arg(long)]
        url: String,
        /// Destination path on the device
        #[arg(long)]
        dest: PathBuf,
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Upload a device file
    Upload {
        /// Upload URL
        #[arg(long)]
        url: String,
        /// Source path on the device
        #[arg(long)]
        source: PathBuf,
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Download a configuration file, apply it and reboot
    ApplyConfig {
        #[arg(long)]
        url: String,
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Upload the device configuration file
    UploadConfig {
        #[arg(long)]
        url: String,
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Upload system log lines written since the last upload
    SyslogUpload {
        #[arg(long)]
        url: String,
        /// Number of log generations to search
        #[arg(long)]
        max_logs: Option<i32>,
        #[command(flatten)]
        submit: SubmitArgs,
    },
    /// Show recently reported results
    Results {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
    /// Show daemon statistics
    Stats,
    /// Health check
    Health,
}

impl Commands {
    /// The daemon command and submit options for the transfer subcommands.
    fn into_submission(self) -> Option<(Command, SubmitArgs)> {
        let submission = match self {
            Commands::Download { url, dest, submit } => (
                Command::Download {
                    delivery_url: Some(url),
                    destination_path: Some(dest.to_string_lossy().into_owned()),
                },
                submit,
            ),
            Commands::Upload { url, source, submit } => (
                Command::Upload {
                    upload_url: Some(url),
                    source_path: Some(source.to_string_lossy().into_owned()),
                },
                submit,
            ),
            Commands::ApplyConfig { url, submit } => {
                (Command::DownloadAndApply { delivery_url: Some(url) }, submit)
            }
            Commands::UploadConfig { url, submit } => {
                (Command::UploadConfig { upload_url: Some(url) }, submit)
            }
            Commands::SyslogUpload { url, max_logs, submit } => (
                Command::SyslogUpload { upload_url: Some(url), max_logs },
                submit,
            ),
            Commands::Results { .. } | Commands::Stats | Commands::Health => return None,
        };
        Some(submission)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose {
        "xferctl=debug"
    } else {
        "xferctl=info"
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(filter))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Create client
    let client = XferClient::new(&cli.socket).await?;

    match cli.command {
        Commands::Results { limit } => {
            cli::handle_results(client, limit, &cli.format).await?;
        }
        Commands::Stats => {
            cli::handle_stats(client, &cli.format).await?;
        }
        Commands::Health => {
            cli::handle_health(client, &cli.format).await?;
        }
        transfer => {
            if let Some((command, submit)) = transfer.into_submission() {
                let request = submit.request(command);
                cli::handle_submit(client, request, submit.wait(), &cli.format).await?;
            }
        }
    }

    Ok(())
}
