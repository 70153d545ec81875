use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use modella::catalog::Source;
use modella::config::{EVENT_CHANNEL_CAPACITY, Settings};
use modella::downloader::{DownloadRequest, Executor, Outcome};
use modella::progress::{BroadcastPublisher, ProgressEvent, Status};
use modella::server::startup;

#[derive(Parser)]
#[command(name = "modella")]
#[command(about = "Resumable, hash-verified model downloads from Civitai and Hugging Face")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the download service
    Serve {
        #[arg(long, env = "ADDRESS", default_value = "0.0.0.0", help = "Address to bind to")]
        address: String,
        #[arg(long, env = "PORT", default_value_t = 5000)]
        port: u16,
        #[arg(short, long, env = "WORKERS", default_value_t = 4, help = "Downloads running at once")]
        workers: usize,
        #[command(flatten)]
        settings: Settings,
    },
    /// Download one file in the foreground
    Fetch {
        #[arg(long, help = "Remote file URL")]
        url: String,
        #[arg(long, help = "Destination relative to the storage root")]
        path: String,
        #[arg(long, help = "Catalog model id")]
        model_id: String,
        #[arg(long, value_enum)]
        source: Source,
        #[command(flatten)]
        settings: Settings,
    },
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Where the progress bar stands, in whole percent.
#[derive(Default)]
struct BarPosition {
    shown: usize,
}

impl BarPosition {
    /// Steps the bar has to move to reflect `event`.
    fn advance(&mut self, event: &ProgressEvent) -> usize {
        if event.status == Status::Failed {
            if let Some(reason) = &event.reason {
                warn!("attempt failed: {}", reason);
            }
        }
        let percent = event.progress.floor() as usize;
        if percent <= self.shown {
            return 0;
        }
        let delta = percent - self.shown;
        self.shown = percent;
        delta
    }

    /// Take every event already waiting on `rx` without blocking.
    fn catch_up(&mut self, rx: &mut broadcast::Receiver<ProgressEvent>) -> usize {
        let mut delta = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => delta += self.advance(&event),
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!("progress display skipped {} events", skipped)
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => return delta,
            }
        }
    }
}

async fn fetch(
    request: DownloadRequest,
    settings: Settings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let events = BroadcastPublisher::new(EVENT_CHANNEL_CAPACITY);
    let mut rx = events.subscribe();
    let executor = Executor::with_catalogs(&settings.engine_config(), Arc::new(events))?;

    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    let run = executor.execute(&request, &cancel);
    tokio::pin!(run);

    let mut bar = tqdm::pbar(Some(100));
    let mut position = BarPosition::default();
    let result = loop {
        tokio::select! {
            result = &mut run => break result,
            Ok(event) = rx.recv() => {
                let delta = position.advance(&event);
                if delta > 0 {
                    let _ = bar.update(delta);
                }
            }
        }
    };
    // The terminal event is published before `run` resolves and may still
    // be waiting on the channel.
    let delta = position.catch_up(&mut rx);
    if delta > 0 {
        let _ = bar.update(delta);
    }

    match result? {
        Outcome::Verified { digest } => {
            info!("{} verified, digest {}", request.relative_path, digest)
        }
        Outcome::Unverified { digest } => warn!(
            "{} completed without a published hash, local digest {}",
            request.relative_path, digest
        ),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Serve {
            address,
            port,
            workers,
            settings,
        }) => {
            startup(settings, address, port, workers).await?;
        }

        Some(Commands::Fetch {
            url,
            path,
            model_id,
            source,
            settings,
        }) => {
            let request = DownloadRequest {
                remote_url: url,
                relative_path: path,
                model_id,
                source,
                storage_root: settings.storage_path.clone(),
            };
            fetch(request, settings).await?;
        }

        None => {
            println!("Use --help for available commands");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use modella::progress::Reporter;

    #[test]
    fn test_catch_up_reaches_completion() {
        let events = BroadcastPublisher::new(16);
        let mut rx = events.subscribe();
        let mut position = BarPosition::default();

        let mut reporter = Reporter::new(&events, "m1", "file.bin");
        reporter.downloading(12.5);
        assert_eq!(position.catch_up(&mut rx), 12);

        reporter.downloading(40.0);
        reporter.completed(None);
        assert_eq!(position.catch_up(&mut rx), 88);
        assert_eq!(position.shown, 100);
        assert_eq!(position.catch_up(&mut rx), 0);
    }

    #[test]
    fn test_bar_never_moves_back() {
        let events = BroadcastPublisher::new(16);
        let mut rx = events.subscribe();
        let mut position = BarPosition::default();

        let mut reporter = Reporter::new(&events, "m1", "file.bin");
        reporter.downloading(60.0);
        reporter.attempt_failed("timeout".to_string());
        reporter.downloading(30.0);
        assert_eq!(position.catch_up(&mut rx), 60);
        assert_eq!(position.shown, 60);
    }
}
