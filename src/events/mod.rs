//! Session event loop
//!
//! Prints PauseDevice/ResumeDevice signals and session property changes
//! as they arrive, until a shutdown signal or the bus goes away.

use std::future::Future;
use std::io::Write;
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::pin::Pin;
use std::time::Duration;

use futures_util::stream::{self, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::signal::unix::{signal, Signal, SignalKind};
use zbus::zvariant::Value;

use crate::constants::LOGIND_SESSION_INTERFACE;
use crate::device::DeviceTable;
use crate::error::{PokerError, Result};
use crate::logind::LogindSessionProxy;
use crate::session::control::SessionControl;

/// PauseDevice type argument
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PauseKind {
    /// Controller must acknowledge with PauseDeviceComplete
    Pause,
    /// Already revoked, no acknowledgement expected
    Force,
    /// Device disappeared
    Gone,
    Other(String),
}

impl PauseKind {
    pub fn parse(s: &str) -> Self {
        match s {
            "pause" => PauseKind::Pause,
            "force" => PauseKind::Force,
            "gone" => PauseKind::Gone,
            other => PauseKind::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            PauseKind::Pause => "pause",
            PauseKind::Force => "force",
            PauseKind::Gone => "gone",
            PauseKind::Other(s) => s,
        }
    }
}

/// Notification pushed by logind for the controlled session
#[derive(Debug)]
pub enum SessionEvent {
    Paused {
        major: u32,
        minor: u32,
        kind: PauseKind,
    },
    Resumed {
        major: u32,
        minor: u32,
        fd: OwnedFd,
    },
    PropertyChanged {
        name: String,
        value: String,
    },
}

type EventStream = Pin<Box<dyn Stream<Item = SessionEvent> + Send>>;

/// All session notifications as one stream, independent of the proxies
pub type SessionEventStream = stream::SelectAll<EventStream>;

/// Merge the session's signal streams into one event stream
///
/// The stream ends when the bus connection closes.
pub async fn session_events(
    connection: &zbus::Connection,
    session: &LogindSessionProxy<'static>,
) -> zbus::Result<SessionEventStream> {
    let pauses = session.receive_pause_device().await?.filter_map(|signal| async move {
        match signal.args() {
            Ok(args) => Some(SessionEvent::Paused {
                major: *args.major(),
                minor: *args.minor(),
                kind: PauseKind::parse(args.kind()),
            }),
            Err(e) => {
                warn!("PauseDevice parse error: {}", e);
                None
            }
        }
    });

    let resumes = session.receive_resume_device().await?.filter_map(|signal| async move {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                warn!("ResumeDevice parse error: {}", e);
                return None;
            }
        };
        match args.fd().as_fd().try_clone_to_owned() {
            Ok(fd) => Some(SessionEvent::Resumed {
                major: *args.major(),
                minor: *args.minor(),
                fd,
            }),
            Err(e) => {
                warn!("ResumeDevice fd dup failed: {}", e);
                None
            }
        }
    });

    let properties = zbus::fdo::PropertiesProxy::builder(connection)
        .destination(session.inner().destination().to_owned())?
        .path(session.inner().path().to_owned())?
        .build()
        .await?;
    let changes = properties
        .receive_properties_changed()
        .await?
        .flat_map(|signal| {
            let events: Vec<SessionEvent> = match signal.args() {
                Ok(args) if args.interface_name().as_str() == LOGIND_SESSION_INTERFACE => {
                    let mut changed: Vec<SessionEvent> = args
                        .changed_properties()
                        .iter()
                        .map(|(name, value)| SessionEvent::PropertyChanged {
                            name: name.to_string(),
                            value: display_value(value),
                        })
                        .collect();
                    changed.extend(args.invalidated_properties().iter().map(|name| {
                        SessionEvent::PropertyChanged {
                            name: name.to_string(),
                            value: "(invalidated)".to_string(),
                        }
                    }));
                    changed
                }
                Ok(_) => Vec::new(),
                Err(e) => {
                    warn!("PropertiesChanged parse error: {}", e);
                    Vec::new()
                }
            };
            stream::iter(events)
        });

    let streams: Vec<EventStream> = vec![Box::pin(pauses), Box::pin(resumes), Box::pin(changes)];
    Ok(stream::select_all(streams))
}

/// Short text form of a property value
fn display_value(value: &Value<'_>) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::U8(n) => n.to_string(),
        Value::U32(n) => n.to_string(),
        Value::U64(n) => n.to_string(),
        Value::I32(n) => n.to_string(),
        Value::I64(n) => n.to_string(),
        Value::Str(s) => format!("{:?}", s.as_str()),
        Value::ObjectPath(p) => p.to_string(),
        other => format!("{:?}", other),
    }
}

/// SIGINT, SIGTERM and SIGHUP
pub struct ShutdownSignals {
    term: Signal,
    int: Signal,
    hup: Signal,
}

impl ShutdownSignals {
    /// Install handlers (call before setup so an early Ctrl+C still cleans up)
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            term: signal(SignalKind::terminate())?,
            int: signal(SignalKind::interrupt())?,
            hup: signal(SignalKind::hangup())?,
        })
    }

    /// Wait for the next shutdown signal, returning its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.term.recv() => "SIGTERM",
            _ = self.int.recv() => "SIGINT",
            _ = self.hup.recv() => "SIGHUP",
        }
    }
}

/// Event loop settings
pub struct LoopSettings {
    pub timestamp_format: String,
    /// Timeout for PauseDeviceComplete
    pub call_timeout: Duration,
}

/// Print events until `shutdown` resolves (Ok) or the stream ends (Err)
pub async fn run<C, S, F, W>(
    control: &C,
    mut events: S,
    table: &mut DeviceTable,
    shutdown: F,
    settings: &LoopSettings,
    out: &mut W,
) -> Result<()>
where
    C: SessionControl,
    S: Stream<Item = SessionEvent> + Unpin,
    F: Future<Output = ()>,
    W: Write,
{
    tokio::pin!(shutdown);
    info!("All done, waiting for session events");

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown requested, leaving event loop");
                return Ok(());
            }
            event = events.next() => match event {
                Some(event) => handle_event(control, event, table, settings, out).await?,
                None => {
                    return Err(PokerError::ConnectionLost(
                        "session signal stream closed".to_string(),
                    ))
                }
            },
        }
    }
}

async fn handle_event<C: SessionControl, W: Write>(
    control: &C,
    event: SessionEvent,
    table: &mut DeviceTable,
    settings: &LoopSettings,
    out: &mut W,
) -> Result<()> {
    let stamp = chrono::Local::now().format(&settings.timestamp_format);

    let mut ack = None;
    let line = match event {
        SessionEvent::Paused { major, minor, kind } => {
            let line = format!(
                "[{}] paused  {}:{} {} ({})",
                stamp,
                major,
                minor,
                device_label(table, major, minor),
                kind.as_str()
            );
            if table.mark_paused(major, minor) == 0 {
                debug!("Pause for untracked device {}:{}", major, minor);
            }
            // fd stays open on purpose: nothing should arrive on it while paused
            if kind == PauseKind::Pause {
                ack = Some((major, minor));
            }
            line
        }
        SessionEvent::Resumed { major, minor, fd } => {
            let raw = fd.as_raw_fd();
            let line = format!(
                "[{}] resumed {}:{} {} fd {}",
                stamp,
                major,
                minor,
                device_label(table, major, minor),
                raw
            );
            if table.resume(major, minor, fd) == 0 {
                debug!("Resume for untracked device {}:{}", major, minor);
            }
            line
        }
        SessionEvent::PropertyChanged { name, value } => {
            format!("[{}] property {} = {}", stamp, name, value)
        }
    };

    // Printed before the acknowledgement round-trip
    if let Err(e) = writeln!(out, "{}", line).and_then(|_| out.flush()) {
        warn!("Failed to write event: {}", e);
    }

    match ack {
        Some((major, minor)) => ack_pause(control, major, minor, settings.call_timeout).await,
        None => Ok(()),
    }
}

async fn ack_pause<C: SessionControl>(
    control: &C,
    major: u32,
    minor: u32,
    call_timeout: Duration,
) -> Result<()> {
    match tokio::time::timeout(call_timeout, control.pause_device_complete(major, minor)).await {
        Ok(Ok(())) => {
            debug!("PauseDeviceComplete {}:{}", major, minor);
            Ok(())
        }
        Ok(Err(e)) => {
            warn!("PauseDeviceComplete {}:{} failed: {}", major, minor, e);
            Ok(())
        }
        Err(_) => Err(PokerError::ConnectionLost(format!(
            "PauseDeviceComplete {}:{} timed out after {}ms",
            major,
            minor,
            call_timeout.as_millis()
        ))),
    }
}

fn device_label(table: &DeviceTable, major: u32, minor: u32) -> String {
    table
        .path_for(major, minor)
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(untracked)".to_string())
}
