mod config;

use std::{path::PathBuf, time::Duration};

use anyhow::bail;
use clap::{Parser, Subcommand};
use fake_user_agent::get_chrome_rua;
use hozon::{HttpClient, OfflineDownloader};

use crate::config::Config;

#[derive(Parser, Debug)]
#[clap(version, about = "Offline video downloader")]
struct HozonArgs {
    /// Configuration file in TOML format
    #[clap(short, long, env = "HOZON_CONFIG")]
    config: Option<PathBuf>,

    /// Root directory of downloaded videos and the task store
    #[clap(long, env = "HOZON_DOWNLOAD_DIR")]
    download_dir: Option<PathBuf>,

    /// Enable offline downloading
    #[clap(long, env = "HOZON_ENABLED")]
    enabled: Option<bool>,

    /// Total attempts of every request
    #[clap(long)]
    retries: Option<u32>,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add a download task and wait for it
    Add {
        url: String,
        #[clap(long)]
        source: String,
        #[clap(long)]
        video_id: String,
        #[clap(long, default_value = "")]
        title: String,
        #[clap(long, default_value = "0")]
        episode: u32,
    },
    /// List all tasks
    List,
    /// Show a single task
    Show { id: String },
    /// Retry a failed or finished task and wait for it
    Retry { id: String },
    /// Cancel a running task
    Cancel { id: String },
    /// Delete a task and its downloaded file
    Delete { id: String },
    /// Print the path of a downloaded video, if it exists
    Probe {
        #[clap(long)]
        source: String,
        #[clap(long)]
        video_id: String,
        #[clap(long, default_value = "0")]
        episode: u32,
    },
}

impl Command {
    fn is_mutating(&self) -> bool {
        matches!(
            self,
            Command::Add { .. }
                | Command::Retry { .. }
                | Command::Cancel { .. }
                | Command::Delete { .. }
        )
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .try_from_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = HozonArgs::parse();
    let config = match &args.config {
        Some(file) => Config::load(file)?,
        None => Config::default(),
    };

    let enabled = args.enabled.or(config.enabled).unwrap_or(true);
    if !enabled && args.command.is_mutating() {
        bail!("Offline download is disabled.");
    }

    let Some(download_dir) = args.download_dir.or(config.download_dir) else {
        bail!("Download directory is not set. Use --download-dir or HOZON_DOWNLOAD_DIR.");
    };

    // read-only commands exit right away, restarting downloads would only abort them
    let mutating = args.command.is_mutating();
    let user_agent = config
        .user_agent
        .unwrap_or_else(|| get_chrome_rua().to_string());
    let mut builder = OfflineDownloader::builder(download_dir)
        .client(HttpClient::with_user_agent(&user_agent)?)
        .retries(args.retries.or(config.retries).unwrap_or(3))
        .resume(enabled && mutating);
    if let Some(backoff) = config.backoff_ms {
        builder = builder.backoff(Duration::from_millis(backoff));
    }
    let downloader = builder.build().await?;

    match args.command {
        Command::Add {
            url,
            source,
            video_id,
            title,
            episode,
        } => {
            let id = downloader.add_task(url, source, video_id, title, episode);
            println!("{id}");
        }
        Command::List => {
            println!("{}", serde_json::to_string_pretty(&downloader.tasks())?);
        }
        Command::Show { id } => match downloader.task(&id) {
            Some(task) => println!("{}", serde_json::to_string_pretty(&task)?),
            None => bail!("Task {id} not found."),
        },
        Command::Retry { id } => downloader.retry_task(&id)?,
        Command::Cancel { id } => {
            if !downloader.cancel_task(&id)? {
                tracing::warn!("Task {id} is not running.");
            }
        }
        Command::Delete { id } => downloader.delete_task(&id).await?,
        Command::Probe {
            source,
            video_id,
            episode,
        } => match downloader.offline_video(&source, &video_id, episode).await {
            Some(path) => println!("{}", path.display()),
            None => bail!("Video not downloaded."),
        },
    }

    if mutating {
        // interrupted tasks are resumed on start, wait for them as well
        tokio::select! {
            _ = downloader.wait() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received, stopping downloader.");
            }
        }
    }

    Ok(())
}
