//! Session resolution
//!
//! Turns the command line session identifier into a logind session id and
//! object path. `ttyN` goes through ListSessions; a numeric id is used as
//! is and only checked by the following TakeControl.

pub mod control;

use std::time::Duration;

use log::{debug, info};
use zbus::zvariant::OwnedObjectPath;

use crate::cli::SessionSpec;
use crate::constants::LOGIND_SESSION_PATH_PREFIX;
use crate::error::{PokerError, Result};

/// One entry of the enumerated session list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// logind session id (a string, e.g. "3" or "c1")
    pub id: String,
    pub uid: u32,
    pub user: String,
    pub seat: String,
    pub path: OwnedObjectPath,
    /// TTY property, e.g. "tty3" (empty for graphical/remote sessions)
    pub tty: String,
    /// VTNr property, 0 when the session has no VT
    pub vt: u32,
}

impl SessionDescriptor {
    /// Does this session run on VT `vt`?
    pub fn on_vt(&self, vt: u32) -> bool {
        (vt != 0 && self.vt == vt) || self.tty == format!("tty{}", vt)
    }
}

/// Source of the active session list
#[allow(async_fn_in_trait)]
pub trait SessionDirectory {
    async fn list_sessions(&self) -> zbus::Result<Vec<SessionDescriptor>>;
}

/// Resolved session, valid for the lifetime of the process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub id: String,
    pub path: OwnedObjectPath,
}

/// Resolve a session identifier
///
/// Numeric ids never touch the bus.
pub async fn resolve<D: SessionDirectory>(
    spec: SessionSpec,
    directory: &D,
    call_timeout: Duration,
) -> Result<SessionHandle> {
    match spec {
        SessionSpec::Numeric(id) => {
            let id = id.to_string();
            let path = session_object_path(&id).map_err(|e| PokerError::SessionNotFound {
                spec: spec.to_string(),
                reason: e.to_string(),
            })?;
            debug!("Session {} -> {}", id, path.as_str());
            Ok(SessionHandle { id, path })
        }
        SessionSpec::Tty(vt) => {
            let sessions = tokio::time::timeout(call_timeout, directory.list_sessions())
                .await
                .map_err(|_| PokerError::Timeout {
                    operation: "ListSessions".to_string(),
                    after: call_timeout,
                })?
                .map_err(|e| PokerError::SessionNotFound {
                    spec: spec.to_string(),
                    reason: format!("ListSessions failed: {}", e),
                })?;

            let session = select_on_vt(&sessions, vt).ok_or_else(|| PokerError::SessionNotFound {
                spec: spec.to_string(),
                reason: format!("none of {} sessions is on tty{}", sessions.len(), vt),
            })?;

            info!(
                "tty{} is session {} (user {} uid {}, seat {})",
                vt, session.id, session.user, session.uid, session.seat
            );
            Ok(SessionHandle {
                id: session.id.clone(),
                path: session.path.clone(),
            })
        }
    }
}

/// First session in list order that runs on `vt`
pub fn select_on_vt(sessions: &[SessionDescriptor], vt: u32) -> Option<&SessionDescriptor> {
    sessions.iter().find(|s| s.on_vt(vt))
}

/// Object path logind publishes for a session id
///
/// logind escapes path labels like sd_bus_path_encode: every byte that is
/// not alphanumeric, and a leading digit, becomes `_xx` (lowercase hex).
pub fn session_object_path(id: &str) -> zbus::zvariant::Result<OwnedObjectPath> {
    OwnedObjectPath::try_from(format!(
        "{}{}",
        LOGIND_SESSION_PATH_PREFIX,
        escape_path_label(id)
    ))
}

fn escape_path_label(label: &str) -> String {
    if label.is_empty() {
        return "_".to_string();
    }
    let mut out = String::with_capacity(label.len() * 3);
    for (i, b) in label.bytes().enumerate() {
        if b.is_ascii_alphanumeric() && !(i == 0 && b.is_ascii_digit()) {
            out.push(b as char);
        } else {
            out.push_str(&format!("_{:02x}", b));
        }
    }
    out
}
