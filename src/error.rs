//! Error taxonomy
//!
//! Every failure the tool can report, with the exit code it maps to.
//! DeviceResolution and DeviceGrant never end the run: they are printed as
//! device outcomes and the remaining devices are still attempted.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::constants::exit_codes;

#[derive(Error, Debug)]
pub enum PokerError {
    #[error("{0}")]
    Usage(String),

    #[error("no session matching '{spec}': {reason}")]
    SessionNotFound { spec: String, reason: String },

    #[error("cannot take control of session {session}: {reason}")]
    ControlAcquisition { session: String, reason: String },

    #[error("cannot resolve device {}: {source}", path.display())]
    DeviceResolution {
        path: PathBuf,
        #[source]
        source: nix::Error,
    },

    #[error("device {} ({major}:{minor}) denied: {reason}", path.display())]
    DeviceGrant {
        path: PathBuf,
        major: u32,
        minor: u32,
        reason: String,
    },

    #[error("{operation} timed out after {}ms", after.as_millis())]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("connection to logind lost: {0}")]
    ConnectionLost(String),

    #[error("D-Bus error: {0}")]
    Bus(#[from] zbus::Error),

    #[error("configuration error: {0:#}")]
    Config(anyhow::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl PokerError {
    /// Exit code for this error when it terminates the process
    pub fn exit_code(&self) -> i32 {
        match self {
            PokerError::Usage(_) => exit_codes::USAGE,
            PokerError::SessionNotFound { .. } => exit_codes::SESSION_NOT_FOUND,
            PokerError::ControlAcquisition { .. } => exit_codes::NO_CONTROL,
            PokerError::Timeout { .. } => exit_codes::TIMEOUT,
            PokerError::ConnectionLost(_) => exit_codes::CONNECTION_LOST,
            PokerError::Config(_) => exit_codes::CONFIG,
            PokerError::DeviceResolution { .. }
            | PokerError::DeviceGrant { .. }
            | PokerError::Bus(_)
            | PokerError::Io(_) => exit_codes::GENERAL_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, PokerError>;
