use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use windowgate::config::{AppConfig, LoggingConfig};
use windowgate::ratelimit::{Decision, RouteGuard, Subject};

#[derive(Debug, Parser)]
#[command(name = "windowgate", version, about = "Sliding-window admission control")]
struct Cli {
    /// Configuration file (YAML); WINDOWGATE__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate a route's limits for one subject
    Check {
        #[arg(long)]
        route: String,
        /// Caller identity; IP addresses are recognised as such
        #[arg(long, default_value = "")]
        subject: String,
        /// Number of consecutive attempts to make
        #[arg(long, default_value_t = 1)]
        times: u32,
    },
    /// Read one subject per line from stdin and answer each with a decision
    Stream {
        #[arg(long)]
        route: String,
    },
    /// Load configuration and rules, then print the route table
    Validate,
}

#[derive(Serialize)]
struct Output<'a> {
    route: &'a str,
    subject: &'a str,
    #[serde(flatten)]
    decision: &'a Decision,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_tracing(&config.logging);

    info!("Starting windowgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let runtime = config.build().context("Failed to build rate limiter")?;

    match cli.command {
        Command::Check {
            route,
            subject,
            times,
        } => {
            let guard = RouteGuard::from_table(&runtime.routes, &route, runtime.limiter)?;
            let parsed = parse_subject(&subject);
            for _ in 0..times {
                let decision = guard.admit(&parsed).await;
                print_decision(&route, &subject, &decision)?;
            }
        }
        Command::Stream { route } => {
            let guard = RouteGuard::from_table(&runtime.routes, &route, runtime.limiter)?;
            stream(&guard).await?;
        }
        Command::Validate => {
            for route in runtime.routes.routes() {
                let policies = runtime.routes.policies(route).unwrap_or_default();
                for policy in policies {
                    println!(
                        "{}\t{} per {}s\t{:?}\t{:?}",
                        route,
                        policy.max_requests(),
                        policy.period_secs(),
                        policy.kind(),
                        policy.counting()
                    );
                }
            }
            info!(routes = runtime.routes.len(), "Configuration is valid");
        }
    }

    info!("windowgate stopped");
    Ok(())
}

/// Answer subjects from stdin until EOF or a shutdown signal.
async fn stream(guard: &RouteGuard) -> anyhow::Result<()> {
    let mut lines = LinesStream::new(BufReader::new(tokio::io::stdin()).lines());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else {
                    break;
                };
                let line = line.context("Failed to read stdin")?;
                let subject = line.trim();
                let decision = guard.admit(&parse_subject(subject)).await;
                print_decision(guard.route(), subject, &decision)?;
            }
            _ = &mut shutdown => break,
        }
    }
    Ok(())
}

fn print_decision(route: &str, subject: &str, decision: &Decision) -> anyhow::Result<()> {
    let output = Output {
        route,
        subject,
        decision,
    };
    println!("{}", serde_json::to_string(&output)?);
    Ok(())
}

fn parse_subject(raw: &str) -> Subject {
    match raw.parse::<IpAddr>() {
        Ok(ip) => Subject::Address(ip),
        Err(_) => Subject::Raw(raw.to_string()),
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    // stdout carries decisions, so logs go to stderr
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_writer(std::io::stderr)
            .init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}
