mod app;
mod cache;
mod config;
mod error;
mod feed;
mod fetch;
mod records;
mod upstream;

#[cfg(test)]
mod testsrv;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "feedcache")]
#[command(about = "Offline-first cache layer for a live feed")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/feedcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Upstream feed URL, overriding the config file
  #[arg(short, long)]
  upstream: Option<String>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Run the sync daemon: live-feed ingest, cache upkeep, photo reconciliation
  Run,
  /// Print stored feed records, newest first
  Posts,
  /// Resolve a single request through the cache policy
  Resolve {
    /// Request URL or upstream-relative path
    url: String,
  },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("feedcache=info"));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_target(false)
    .with_writer(std::io::stderr)
    .init();

  let args = Args::parse();

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override upstream if specified on command line
  let config = if let Some(url) = args.upstream {
    config::Config {
      upstream: config::UpstreamConfig { url },
      ..config
    }
  } else {
    config
  };

  let app = app::App::new(config)?;

  match args.command.unwrap_or(Command::Run) {
    Command::Run => app.run().await,
    Command::Posts => {
      for record in app.posts()? {
        let when = chrono::DateTime::from_timestamp_millis(record.time)
          .map(|t| t.to_rfc3339())
          .unwrap_or_else(|| record.time.to_string());
        println!("{when} {}", serde_json::to_string(&record)?);
      }
      Ok(())
    }
    Command::Resolve { url } => {
      let response = app.resolve(&url).await?;
      eprintln!(
        "{} {:?} {} bytes",
        response.status,
        response.source,
        response.body.len()
      );
      std::io::stdout().write_all(&response.body)?;
      Ok(())
    }
  }
}
