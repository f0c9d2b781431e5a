use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use egress_limiter::config::LimiterConfig;
use egress_limiter::{Limiter, LimiterError};

/// Inspect and exercise outgoing request budgets.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Limiter configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "EGRESS_CONFIG")]
    config: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run an admission check for a URL, charging its resource
    Check {
        url: String,
        /// Wait for the bucket to reset when a queued resource is over budget
        #[arg(long)]
        wait: bool,
    },
    /// Show the current count for a resource
    Usage { name: String },
    /// Show the current count for every resource
    Snapshot {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Clear the counter for a resource
    Reset { name: String },
    /// Simulate traffic against every configured resource
    Seed {
        /// Requests to send per resource
        #[arg(short = 'n', long, default_value_t = 10)]
        requests: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let config = match &cli.config {
        Some(path) => LimiterConfig::from_file(path)?,
        None => LimiterConfig::default(),
    };
    let limiter = config.build().await?;

    // Ctrl+C cancels whatever the command is waiting on.
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling");
            on_signal.cancel();
        }
    });

    let outcome = run(&limiter, &cancel, cli.command).await;
    limiter.close().await?;
    outcome
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(
    limiter: &Limiter,
    cancel: &CancellationToken,
    command: Command,
) -> anyhow::Result<()> {
    match command {
        Command::Check { url, wait } => loop {
            match limiter.check(cancel, &url).await {
                Ok(()) => {
                    println!("allowed: {url}");
                    return Ok(());
                }
                Err(LimiterError::LimitExceeded(exceeded)) => {
                    println!("blocked: {exceeded} (resets at {})", exceeded.reset_at());
                    match exceeded.waiter() {
                        Some(waiter) if wait => {
                            info!(reset_at = %waiter.reset_at(), "Waiting for bucket reset");
                            waiter.wait(cancel).await?;
                        }
                        _ => return Ok(()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        },
        Command::Usage { name } => {
            let count = limiter.get_usage(cancel, &name).await?;
            println!("{name}: {count}");
            Ok(())
        }
        Command::Snapshot { json } => {
            let status = limiter.snapshot(cancel).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                for s in status {
                    println!(
                        "{:<24} {:>8}/{:<8} per {:<6} {}",
                        s.resource.name,
                        s.current,
                        s.resource.limit,
                        s.resource.window,
                        s.resource.strategy
                    );
                }
            }
            Ok(())
        }
        Command::Reset { name } => {
            limiter.reset_usage(cancel, &name).await?;
            println!("reset: {name}");
            Ok(())
        }
        Command::Seed { requests } => {
            for resource in limiter.resources() {
                let url = format!("https://{}", resource.pattern.replace('*', "seed"));
                let mut blocked = 0u64;
                for _ in 0..requests {
                    match limiter.check(cancel, &url).await {
                        Ok(()) => {}
                        Err(LimiterError::LimitExceeded(_)) => blocked += 1,
                        Err(e) => return Err(e.into()),
                    }
                }
                if blocked > 0 {
                    warn!(resource = %resource.name, blocked, "Some seeded requests were blocked");
                }
                info!(resource = %resource.name, url = %url, requests, "Seeded resource");
            }
            Ok(())
        }
    }
}
