//! The MCTP transport daemon.

use anyhow::Context;
use clap::Parser;
use mctpd::config::DEFAULT_CONFIG_PATH;
use mctpd::ActiveBinding;
use mctpd::BindingKind;
use mctpd::Config;
use mctpd::MctpService;
use slog::Drain;
use slog::Level;
use std::path::PathBuf;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;

fn parse_log_level(s: &str) -> Result<Level, String> {
    s.parse().map_err(|_| String::from("invalid log level"))
}

/// Run an MCTP endpoint over one physical bus.
///
/// The daemon assigns endpoint IDs to devices it discovers on the bus,
/// routes and reassembles their messages, and answers control requests
/// addressed to its own endpoint.
#[derive(Parser)]
#[command(version, about, long_about)]
struct Args {
    /// The path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// The binding the configuration must name.
    ///
    /// Startup fails if this disagrees with the configuration file, as a
    /// guard against booting a bus daemon with the wrong bus's config.
    #[arg(short, long)]
    binding: BindingKind,

    /// The log-level.
    #[arg(
        short,
        long,
        default_value_t = Level::Info,
        value_parser = parse_log_level
    )]
    log_level: Level,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, args.log_level).fuse();
    let log = slog::Logger::root(drain, slog::o!());

    let config = Config::from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config.display()))?;
    let actual = config.binding.kind();
    if actual != args.binding {
        anyhow::bail!(
            "configuration names the {actual} binding, but {} was requested",
            args.binding
        );
    }

    let binding = ActiveBinding::open(&config.binding, &log)
        .await
        .context("failed to open the bus device")?;
    let (service, mut delivery_rx) = MctpService::new(&config, binding, log.clone());

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                slog::info!(log, "caught SIGINT, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                slog::info!(log, "caught SIGTERM, shutting down");
                break;
            }
            message = delivery_rx.recv() => match message {
                // No upper-layer consumers are wired up yet, so completed
                // messages are only logged.
                Some(message) => slog::info!(
                    log,
                    "received message";
                    "source" => %message.source,
                    "msg_type" => message.msg_type,
                    "n_bytes" => message.payload.len(),
                ),
                None => {
                    slog::error!(log, "i/o loop exited unexpectedly");
                    anyhow::bail!("i/o loop exited unexpectedly");
                }
            }
        }
    }

    // Tear down the binding before exiting so the bus devices are closed
    // in an orderly way.
    if let Err(e) = service.shutdown().await {
        slog::warn!(log, "shutdown failed"; "reason" => %e);
    }
    Ok(())
}
