//! systemd-logind D-Bus bindings
//!
//! zbus proxies for `org.freedesktop.login1` plus the system-bus
//! implementations of [`SessionDirectory`] and [`SessionControl`].

use std::os::fd::OwnedFd;

use log::{debug, warn};
use zbus::zvariant::{self, OwnedObjectPath};

use crate::session::control::SessionControl;
use crate::session::{SessionDescriptor, SessionDirectory};

// === zbus proxy definitions ===

#[zbus::proxy(
    interface = "org.freedesktop.login1.Manager",
    default_service = "org.freedesktop.login1",
    default_path = "/org/freedesktop/login1"
)]
pub trait LogindManager {
    /// (id, uid, user name, seat id, object path)
    fn list_sessions(&self) -> zbus::Result<Vec<(String, u32, String, String, OwnedObjectPath)>>;
}

#[zbus::proxy(
    interface = "org.freedesktop.login1.Session",
    default_service = "org.freedesktop.login1"
)]
pub trait LogindSession {
    fn take_control(&self, force: bool) -> zbus::Result<()>;
    fn release_control(&self) -> zbus::Result<()>;

    /// Returns the device fd and whether the device is currently inactive
    fn take_device(&self, major: u32, minor: u32) -> zbus::Result<(zvariant::OwnedFd, bool)>;
    fn release_device(&self, major: u32, minor: u32) -> zbus::Result<()>;
    fn pause_device_complete(&self, major: u32, minor: u32) -> zbus::Result<()>;

    #[zbus(signal)]
    fn pause_device(&self, major: u32, minor: u32, kind: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    fn resume_device(&self, major: u32, minor: u32, fd: zvariant::OwnedFd) -> zbus::Result<()>;

    #[zbus(property, name = "TTY")]
    fn tty(&self) -> zbus::Result<String>;

    #[zbus(property, name = "VTNr")]
    fn vtnr(&self) -> zbus::Result<u32>;
}

// === Bus-backed implementations ===

/// Session enumeration over the system bus
pub struct BusDirectory<'a> {
    connection: &'a zbus::Connection,
}

impl<'a> BusDirectory<'a> {
    pub fn new(connection: &'a zbus::Connection) -> Self {
        Self { connection }
    }

    async fn describe(
        &self,
        entry: (String, u32, String, String, OwnedObjectPath),
    ) -> zbus::Result<SessionDescriptor> {
        let (id, uid, user, seat, path) = entry;
        let session = LogindSessionProxy::builder(self.connection)
            .path(path.clone())?
            .build()
            .await?;
        let tty = session.tty().await?;
        let vt = session.vtnr().await?;
        Ok(SessionDescriptor {
            id,
            uid,
            user,
            seat,
            path,
            tty,
            vt,
        })
    }
}

impl SessionDirectory for BusDirectory<'_> {
    async fn list_sessions(&self) -> zbus::Result<Vec<SessionDescriptor>> {
        let manager = LogindManagerProxy::new(self.connection).await?;
        let entries = manager.list_sessions().await?;
        debug!("ListSessions returned {} sessions", entries.len());

        let mut sessions = Vec::with_capacity(entries.len());
        for entry in entries {
            let id = entry.0.clone();
            match self.describe(entry).await {
                Ok(desc) => {
                    debug!("{:?}", desc);
                    sessions.push(desc);
                }
                // Sessions can vanish between ListSessions and the property reads
                Err(e) => warn!("Skipping session {}: {}", id, e),
            }
        }
        Ok(sessions)
    }
}

impl SessionControl for LogindSessionProxy<'_> {
    async fn take_control(&self, force: bool) -> zbus::Result<()> {
        LogindSessionProxy::take_control(self, force).await
    }

    async fn release_control(&self) -> zbus::Result<()> {
        LogindSessionProxy::release_control(self).await
    }

    async fn take_device(&self, major: u32, minor: u32) -> zbus::Result<(OwnedFd, bool)> {
        let (fd, inactive) = LogindSessionProxy::take_device(self, major, minor).await?;
        Ok((fd.into(), inactive))
    }

    async fn release_device(&self, major: u32, minor: u32) -> zbus::Result<()> {
        LogindSessionProxy::release_device(self, major, minor).await
    }

    async fn pause_device_complete(&self, major: u32, minor: u32) -> zbus::Result<()> {
        LogindSessionProxy::pause_device_complete(self, major, minor).await
    }
}
