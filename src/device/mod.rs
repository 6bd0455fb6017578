//! Device nodes granted by logind
//!
//! Resolves device paths to major/minor numbers and owns the file
//! descriptors handed out by TakeDevice/ResumeDevice.

use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::task::JoinHandle;

use crate::error::{PokerError, Result};

/// Read buffer size for input tracing
const TRACE_BUF_SIZE: usize = 1024;

/// Resolve a device node to its (major, minor) pair via stat(2)
pub fn device_numbers(path: &Path) -> Result<(u32, u32)> {
    let st = nix::sys::stat::stat(path).map_err(|source| PokerError::DeviceResolution {
        path: path.to_path_buf(),
        source,
    })?;
    let rdev = st.st_rdev;
    Ok((libc::major(rdev) as u32, libc::minor(rdev) as u32))
}

/// Background reader that logs whatever arrives on a device fd
///
/// Runs on the current runtime; aborted on drop.
pub struct InputTrace {
    task: JoinHandle<()>,
}

impl InputTrace {
    /// Start tracing a duplicate of `fd`
    pub fn spawn(label: String, fd: &OwnedFd) -> std::io::Result<Self> {
        let dup = fd.try_clone()?;
        let async_fd = AsyncFd::with_interest(dup, Interest::READABLE)?;

        let task = tokio::spawn(async move {
            let mut buf = [0u8; TRACE_BUF_SIZE];
            loop {
                let mut guard = match async_fd.readable().await {
                    Ok(guard) => guard,
                    Err(e) => {
                        warn!("{}: poll failed: {}", label, e);
                        break;
                    }
                };
                let res = guard.try_io(|inner| {
                    nix::unistd::read(inner.get_ref().as_raw_fd(), &mut buf)
                        .map_err(std::io::Error::from)
                });
                match res {
                    Ok(Ok(0)) => {
                        debug!("{}: end of file", label);
                        break;
                    }
                    Ok(Ok(n)) => debug!("{}: {:02x?}", label, &buf[..n]),
                    Ok(Err(e)) => {
                        // Revoked evdev nodes report ENODEV here
                        warn!("{}: read failed: {}", label, e);
                        break;
                    }
                    Err(_would_block) => continue,
                }
            }
        });

        Ok(Self { task })
    }
}

impl Drop for InputTrace {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// One successful TakeDevice
pub struct DeviceGrant {
    pub path: PathBuf,
    pub major: u32,
    pub minor: u32,
    /// Current fd (replaced on every resume)
    fd: Option<OwnedFd>,
    /// logind reported the device as inactive
    pub paused: bool,
    trace: Option<InputTrace>,
}

impl DeviceGrant {
    pub fn new(path: PathBuf, major: u32, minor: u32, fd: OwnedFd, paused: bool) -> Self {
        Self {
            path,
            major,
            minor,
            fd: Some(fd),
            paused,
            trace: None,
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(|fd| fd.as_fd().as_raw_fd())
    }

    pub fn matches(&self, major: u32, minor: u32) -> bool {
        self.major == major && self.minor == minor
    }

    fn label(&self) -> String {
        format!("{} ({}:{})", self.path.display(), self.major, self.minor)
    }

    /// Swap in a new fd; the previous one is closed only now so a paused
    /// device keeps its old fd until logind hands out a fresh one
    fn replace_fd(&mut self, fd: OwnedFd, trace_input: bool) {
        self.trace = None;
        if let Some(old) = self.fd.replace(fd) {
            debug!("{}: closing fd {}", self.label(), old.as_raw_fd());
        }
        self.paused = false;
        if trace_input {
            self.start_trace();
        }
    }

    fn start_trace(&mut self) {
        let Some(fd) = self.fd.as_ref() else {
            return;
        };
        match InputTrace::spawn(self.label(), fd) {
            Ok(trace) => self.trace = Some(trace),
            Err(e) => warn!("{}: cannot trace input: {}", self.label(), e),
        }
    }
}

/// Granted devices in command line order
pub struct DeviceTable {
    grants: Vec<DeviceGrant>,
    trace_input: bool,
}

impl DeviceTable {
    pub fn new(trace_input: bool) -> Self {
        Self {
            grants: Vec::new(),
            trace_input,
        }
    }

    /// Add a grant; active devices start tracing right away when enabled
    pub fn push(&mut self, mut grant: DeviceGrant) {
        if self.trace_input && !grant.paused {
            grant.start_trace();
        }
        self.grants.push(grant);
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeviceGrant> {
        self.grants.iter()
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }

    /// Path of the first grant for a device, for event output
    pub fn path_for(&self, major: u32, minor: u32) -> Option<&Path> {
        self.grants
            .iter()
            .find(|g| g.matches(major, minor))
            .map(|g| g.path.as_path())
    }

    /// Mark every grant of a device paused; fds stay open. Returns count.
    pub fn mark_paused(&mut self, major: u32, minor: u32) -> usize {
        let mut count = 0;
        for grant in self.grants.iter_mut().filter(|g| g.matches(major, minor)) {
            grant.paused = true;
            count += 1;
        }
        count
    }

    /// Hand a resumed fd to every grant of a device. Returns count.
    pub fn resume(&mut self, major: u32, minor: u32, fd: OwnedFd) -> usize {
        let trace_input = self.trace_input;
        let mut matching: Vec<&mut DeviceGrant> = self
            .grants
            .iter_mut()
            .filter(|g| g.matches(major, minor))
            .collect();
        let count = matching.len();

        // All but the last get a duplicate
        let mut fd = Some(fd);
        for (i, grant) in matching.iter_mut().enumerate() {
            let this_fd = if i + 1 == count {
                fd.take()
            } else {
                fd.as_ref().and_then(|f| match f.try_clone() {
                    Ok(dup) => Some(dup),
                    Err(e) => {
                        warn!("{}: cannot duplicate fd: {}", grant.label(), e);
                        None
                    }
                })
            };
            if let Some(this_fd) = this_fd {
                grant.replace_fd(this_fd, trace_input);
            }
        }
        count
    }

    /// Remove all grants, closing their fds
    pub fn drain(&mut self) -> std::vec::Drain<'_, DeviceGrant> {
        self.grants.drain(..)
    }
}
