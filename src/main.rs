//! logind-poker - exercise systemd-logind device delegation
//!
//! # Flow
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │  cli: --device PATH... SESSION           │
//! │                ↓                         │
//! │  session::resolve (ListSessions if ttyN) │
//! │                ↓                         │
//! │  control::run_session:                   │
//! │  TakeControl → TakeDevice per path       │
//! │                ↓                         │
//! │  events::run (PauseDevice/ResumeDevice)  │
//! │                ↓                         │
//! │  ReleaseDevice... → ReleaseControl       │
//! └──────────────────────────────────────────┘
//! ```

mod cli;
mod config;
mod constants;
mod device;
mod error;
mod events;
mod logind;
mod session;

use std::future::Future;
use std::time::Duration;

use clap::error::ErrorKind;
use clap::Parser;
use log::{debug, info};

use crate::cli::{Cli, Configuration};
use crate::config::Config;
use crate::constants::exit_codes;
use crate::error::{PokerError, Result};
use crate::events::ShutdownSignals;
use crate::logind::{BusDirectory, LogindSessionProxy};
use crate::session::control;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let code = match run() {
        Ok(()) => exit_codes::SUCCESS,
        Err(PokerError::Usage(msg)) => {
            eprint!("{}", msg);
            exit_codes::USAGE
        }
        Err(e) => {
            eprintln!("logind-poker: {}", e);
            e.exit_code()
        }
    };
    std::process::exit(code);
}

fn run() -> Result<()> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
            print!("{}", e);
            return Ok(());
        }
        Err(e) => return Err(PokerError::Usage(e.render().to_string())),
    };
    debug!("{:?}", cli);

    let file = Config::load(cli.config.as_deref()).map_err(PokerError::Config)?;
    let cfg = Configuration::new(cli, &file)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(poke(cfg))
}

/// Resolve, take control, take devices, then wait for events
async fn poke(cfg: Configuration) -> Result<()> {
    let settings = &cfg.settings;
    let call_timeout = settings.call_timeout;

    // Installed first so a signal during setup still ends the run
    let mut signals = ShutdownSignals::new()?;

    let setup = async {
        let connection = bounded(
            "connecting to the system bus",
            call_timeout,
            zbus::Connection::system(),
        )
        .await?;
        info!("Connected to the system bus");

        let directory = BusDirectory::new(&connection);
        let handle = session::resolve(cfg.session, &directory, call_timeout).await?;
        info!("Using session {} at {}", handle.id, handle.path.as_str());

        let proxy = bounded(
            "building the session proxy",
            call_timeout,
            LogindSessionProxy::builder(&connection)
                .path(handle.path.clone())?
                .cache_properties(zbus::proxy::CacheProperties::No)
                .build(),
        )
        .await?;

        // Subscribe before TakeControl so no early pause is missed
        let event_stream = bounded(
            "subscribing to session signals",
            call_timeout,
            events::session_events(&connection, &proxy),
        )
        .await?;

        Ok::<_, PokerError>((handle, proxy, event_stream))
    };

    let (handle, proxy, event_stream) = tokio::select! {
        name = signals.recv() => {
            info!("Received {} during setup, nothing to release", name);
            return Ok(());
        }
        res = setup => res?,
    };

    let shutdown = async {
        let name = signals.recv().await;
        info!("Received {}, shutting down", name);
    };
    let mut stdout = std::io::stdout();
    control::run_session(
        &proxy,
        &handle,
        &cfg.devices,
        settings,
        event_stream,
        shutdown,
        &mut stdout,
    )
    .await
}

/// Bound one bus setup step by the call timeout
async fn bounded<T, E, F>(operation: &str, after: Duration, step: F) -> Result<T>
where
    F: Future<Output = std::result::Result<T, E>>,
    PokerError: From<E>,
{
    tokio::time::timeout(after, step)
        .await
        .map_err(|_| PokerError::Timeout {
            operation: operation.to_string(),
            after,
        })?
        .map_err(PokerError::from)
}
