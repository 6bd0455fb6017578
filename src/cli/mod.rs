//! Command line parsing
//!
//! `logind-poker [--device PATH]... <SESSION>` where SESSION is a numeric
//! logind session id or `ttyN`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use clap::Parser;

use crate::config::Config;
use crate::constants::call_timeout;
use crate::error::{PokerError, Result};

/// Take control of a logind session and request its devices
#[derive(Parser, Debug)]
#[command(name = "logind-poker", version)]
#[command(
    about = "Exercise logind device delegation: TakeControl, TakeDevice, then print pause/resume events",
    long_about = None
)]
pub struct Cli {
    /// Device node to take from the session (repeatable, order is kept)
    #[arg(short = 'd', long = "device", value_name = "PATH")]
    pub devices: Vec<PathBuf>,

    /// Steal control from an existing session controller
    #[arg(long)]
    pub force: bool,

    /// Timeout for each setup call, in milliseconds
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Configuration file (default: ~/.config/logind-poker/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Log bytes read from active device fds (needs RUST_LOG=debug)
    #[arg(long)]
    pub trace_input: bool,

    /// Session id (e.g. "3") or "ttyN" for the session on that VT
    #[arg(value_name = "SESSION", value_parser = SessionSpec::parse)]
    pub session: SessionSpec,
}

/// Session identifier as given on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSpec {
    /// Bare logind session id
    Numeric(u32),
    /// `ttyN`: the session running on VT N
    Tty(u32),
}

impl SessionSpec {
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        // Digits only: u32::from_str would also take "+3"
        let digits = |t: &str| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit());

        // "03" is not logind's id "3"
        if digits(s) && (s == "0" || !s.starts_with('0')) {
            if let Ok(id) = s.parse::<u32>() {
                return Ok(SessionSpec::Numeric(id));
            }
        }
        if let Some(num_str) = s.strip_prefix("tty") {
            if digits(num_str) {
                if let Ok(vt) = num_str.parse::<u32>() {
                    return Ok(SessionSpec::Tty(vt));
                }
            }
        }
        Err(format!(
            "invalid session '{}': expected a session id or ttyN",
            s
        ))
    }
}

impl fmt::Display for SessionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionSpec::Numeric(id) => write!(f, "{}", id),
            SessionSpec::Tty(vt) => write!(f, "tty{}", vt),
        }
    }
}

/// Effective settings after merging the config file and the command line
#[derive(Debug, Clone)]
pub struct Settings {
    pub call_timeout: Duration,
    pub force: bool,
    pub timestamp_format: String,
    pub trace_input: bool,
}

/// Validated run configuration
#[derive(Debug, Clone)]
pub struct Configuration {
    /// Devices in command line order, duplicates kept
    pub devices: Vec<PathBuf>,
    pub session: SessionSpec,
    pub settings: Settings,
}

impl Configuration {
    /// Merge parsed arguments over file settings (command line wins)
    pub fn new(cli: Cli, file: &Config) -> Result<Self> {
        let timestamp_format = file.output.timestamp_format.clone();
        if StrftimeItems::new(&timestamp_format).any(|item| matches!(item, Item::Error)) {
            return Err(PokerError::Config(anyhow::anyhow!(
                "invalid timestamp_format '{}'",
                timestamp_format
            )));
        }

        let settings = Settings {
            call_timeout: call_timeout(cli.timeout_ms.unwrap_or(file.bus.call_timeout_ms)),
            force: cli.force || file.control.force,
            timestamp_format,
            trace_input: cli.trace_input || file.devices.trace_input,
        };

        Ok(Self {
            devices: cli.devices,
            session: cli.session,
            settings,
        })
    }
}
