#![cfg_attr(
    test,
    allow(clippy::unwrap_used, clippy::too_many_lines)
)]

mod cacher;
mod config;
mod control;
mod error;
mod fileinfo;
mod humanfmt;
mod meta;
mod mirror;
mod mirror_store;
mod server;
mod storage;
#[cfg(test)]
mod testutil;
mod urlmap;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use clap::Subcommand;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use log::{LevelFilter, debug, error, info};
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};
use tokio::net::TcpListener;
use tokio::runtime::Builder;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;

use crate::cacher::Cacher;
use crate::config::{CacherConfig, MirrorConfig};
use crate::humanfmt::HumanFmt;
use crate::server::handle_request;

const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Logging level
    #[arg(short, long, value_name = "SEVERITY")]
    log_level: Option<LevelFilter>,
    /// Skip timestamp in log messages
    #[arg(long, default_value = "false")]
    skip_log_timestamp: bool,
    /// Permit running as the root user (potentially dangerous)
    #[arg(long, default_value = "false")]
    permit_running_as_root: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the caching proxy
    Serve {
        /// Configuration file path
        #[arg(short = 'c', long, value_name = "PATH")]
        config: PathBuf,
    },
    /// Update mirrored repositories
    Mirror {
        /// Configuration file path
        #[arg(short = 'c', long, value_name = "PATH")]
        config: PathBuf,
        /// Mirror ids to update; all configured mirrors if empty
        ids: Vec<String>,
    },
}

fn init_logging(level: LevelFilter, skip_timestamp: bool) -> anyhow::Result<()> {
    let log_config = if skip_timestamp {
        ConfigBuilder::new()
            .set_time_level(LevelFilter::Off)
            .build()
    } else {
        simplelog::Config::default()
    };

    TermLogger::init(level, log_config, TerminalMode::Mixed, ColorChoice::Auto)?;

    debug!("Logger initialized");
    Ok(())
}

fn refuse_root(permitted: bool) {
    if nix::unistd::getuid().is_root() {
        if permitted {
            log::warn!("!! Running as root is not recommended !!");
        } else {
            error!("Running as root is not recommended and not permitted by default");
            std::process::exit(1);
        }
    }
}

/// Cancels the returned token on SIGINT or SIGTERM.
fn watch_signals() -> anyhow::Result<CancellationToken> {
    let cancel = CancellationToken::new();

    let mut term_signal = tokio::signal::unix::signal(SignalKind::terminate())?;
    let watched = cancel.clone();
    tokio::task::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, stopping..."),
            _ = term_signal.recv() => info!("SIGTERM received, stopping..."),
        }
        watched.cancel();
    });

    Ok(cancel)
}

async fn serve_loop(config: CacherConfig) -> anyhow::Result<()> {
    let mut addr = SocketAddr::from((config.bind_addr, config.bind_port.get()));

    let listener = match TcpListener::bind(addr).await {
        Ok(x) => x,
        Err(err) => {
            if config.bind_addr != Ipv6Addr::UNSPECIFIED {
                error!("Error binding on {addr}:  {err}");
                return Err(err.into());
            }

            // fall back to IPv4 when IPv6 is not available and the
            // default configuration is used
            addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.bind_port.get()));
            TcpListener::bind(addr).await.inspect_err(|err| {
                error!("Error binding fallback on {addr}:  {err}");
            })?
        }
    };
    info!("Listening on http://{addr}");

    let cancel = watch_signals()?;
    let cacher = Cacher::new(&config, cancel.clone()).await?;

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return Ok(()),
            n = listener.accept() => n,
        };

        let (stream, client) = match next {
            Ok(x) => x,
            Err(err) => {
                error!("Error accepting connection:  {err}");
                continue;
            }
        };

        debug!("New client connection from {}", client.ip());
        let client_start = Instant::now();

        let cacher = cacher.clone();
        tokio::task::spawn(async move {
            if let Err(err) = http1::Builder::new()
                .serve_connection(
                    TokioIo::new(stream),
                    service_fn(move |req| handle_request(cacher.clone(), req)),
                )
                .await
            {
                info!("Error serving connection for client {}:  {err}", client.ip());
            }

            debug!(
                "Closed connection to {} after {}",
                client.ip(),
                HumanFmt::Time(client_start.elapsed())
            );
        });
    }
}

async fn mirror_run(config: MirrorConfig, ids: Vec<String>) -> anyhow::Result<()> {
    let cancel = watch_signals()?;
    mirror::run(config, ids, cancel).await
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Cli::parse();

    scopeguard::defer! {
        info!("Stopped.");
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .thread_name(concat!(env!("CARGO_PKG_NAME"), "-w"))
        .build()
        .expect("runtime builds");

    match args.command {
        Command::Serve { config } => {
            let config = CacherConfig::load(&config)?;
            init_logging(args.log_level.unwrap_or(config.log_level), args.skip_log_timestamp)?;
            refuse_root(args.permit_running_as_root);

            info!("{APP_NAME} starting in proxy mode");
            debug!("Configuration: {config:?}");

            std::panic::set_hook(Box::new(move |panic_info| {
                error!("{panic_info}");
                eprintln!("{panic_info}");
            }));

            runtime.block_on(serve_loop(config))?;
        }
        Command::Mirror { config, ids } => {
            let config = MirrorConfig::load(&config)?;
            init_logging(args.log_level.unwrap_or(config.log_level), args.skip_log_timestamp)?;
            refuse_root(args.permit_running_as_root);

            info!("{APP_NAME} starting in mirror mode");
            debug!("Configuration: {config:?}");

            runtime.block_on(mirror_run(config, ids))?;
        }
    }

    Ok(())
}
