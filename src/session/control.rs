//! Session controller pipeline
//!
//! TakeControl first; then TakeDevice for every configured path in order.
//! A failed TakeControl stops everything, a failed device only itself.

use std::future::Future;
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use futures_util::Stream;
use log::{debug, info, warn};

use super::SessionHandle;
use crate::cli::Settings;
use crate::device::{self, DeviceGrant, DeviceTable};
use crate::error::{PokerError, Result};
use crate::events::{self, LoopSettings, SessionEvent};

/// Controller side of a logind session
#[allow(async_fn_in_trait)]
pub trait SessionControl {
    async fn take_control(&self, force: bool) -> zbus::Result<()>;
    async fn release_control(&self) -> zbus::Result<()>;
    /// Returns the device fd and whether the device is inactive (paused)
    async fn take_device(&self, major: u32, minor: u32) -> zbus::Result<(OwnedFd, bool)>;
    async fn release_device(&self, major: u32, minor: u32) -> zbus::Result<()>;
    async fn pause_device_complete(&self, major: u32, minor: u32) -> zbus::Result<()>;
}

/// Result of one TakeDevice attempt
#[derive(Debug)]
pub enum DeviceOutcome {
    Granted {
        path: PathBuf,
        major: u32,
        minor: u32,
        fd: RawFd,
        paused: bool,
    },
    Failed(PokerError),
}

impl DeviceOutcome {
    pub fn is_granted(&self) -> bool {
        matches!(self, DeviceOutcome::Granted { .. })
    }

    /// One line of report output
    pub fn report_line(&self) -> String {
        match self {
            DeviceOutcome::Granted {
                path,
                major,
                minor,
                fd,
                paused,
            } => format!(
                "granted {} ({}:{}) fd {} {}",
                path.display(),
                major,
                minor,
                fd,
                if *paused { "paused" } else { "active" }
            ),
            DeviceOutcome::Failed(err) => format!("failed  {}", err),
        }
    }
}

/// Drive a resolved session: TakeControl, TakeDevice per path, events, cleanup
///
/// `shutdown` is honoured in every phase. Once control is held, devices
/// and control are released on every way out.
pub async fn run_session<C, S, F, W>(
    control: &C,
    session: &SessionHandle,
    devices: &[PathBuf],
    settings: &Settings,
    event_stream: S,
    shutdown: F,
    out: &mut W,
) -> Result<()>
where
    C: SessionControl,
    S: Stream<Item = SessionEvent> + Unpin,
    F: Future<Output = ()>,
    W: Write,
{
    let call_timeout = settings.call_timeout;
    tokio::pin!(shutdown);

    tokio::select! {
        _ = &mut shutdown => {
            info!("Shutdown before session control was acquired");
            return Ok(());
        }
        res = take_control(control, session, settings.force, call_timeout) => res?,
    }

    let mut table = DeviceTable::new(settings.trace_input);
    let loop_settings = LoopSettings {
        timestamp_format: settings.timestamp_format.clone(),
        call_timeout,
    };

    let result = async {
        let outcomes = tokio::select! {
            _ = &mut shutdown => {
                info!("Shutdown while taking devices");
                return Ok(());
            }
            res = take_devices(control, devices, call_timeout, &mut table, &mut *out) => res?,
        };
        let failed = outcomes.iter().filter(|o| !o.is_granted()).count();
        let paused = table.iter().filter(|g| g.paused).count();
        info!(
            "{} devices granted ({} paused), {} failed",
            table.len(),
            paused,
            failed
        );
        if table.is_empty() {
            warn!("No device granted, only session events will show up");
        }

        events::run(control, event_stream, &mut table, shutdown.as_mut(), &loop_settings, &mut *out)
            .await
    }
    .await;

    release_all(control, &mut table, call_timeout).await;
    result
}

/// Become the session controller
pub async fn take_control<C: SessionControl>(
    control: &C,
    session: &SessionHandle,
    force: bool,
    call_timeout: Duration,
) -> Result<()> {
    info!("Taking control of session {} (force={})", session.id, force);
    tokio::time::timeout(call_timeout, control.take_control(force))
        .await
        .map_err(|_| PokerError::Timeout {
            operation: format!("TakeControl on session {}", session.id),
            after: call_timeout,
        })?
        .map_err(|e| PokerError::ControlAcquisition {
            session: session.id.clone(),
            reason: e.to_string(),
        })
}

/// Take every device in order, reporting each outcome to `out`
///
/// Per-device failures are reported and skipped. Only a timeout aborts
/// the pass; grants made before it stay in `table` for cleanup.
pub async fn take_devices<C: SessionControl, W: Write>(
    control: &C,
    paths: &[PathBuf],
    call_timeout: Duration,
    table: &mut DeviceTable,
    out: &mut W,
) -> Result<Vec<DeviceOutcome>> {
    let mut outcomes = Vec::with_capacity(paths.len());
    for path in paths {
        let outcome = take_one(control, path, call_timeout, table).await?;
        if let Err(e) = writeln!(out, "{}", outcome.report_line()) {
            warn!("Failed to write report: {}", e);
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

async fn take_one<C: SessionControl>(
    control: &C,
    path: &Path,
    call_timeout: Duration,
    table: &mut DeviceTable,
) -> Result<DeviceOutcome> {
    let (major, minor) = match device::device_numbers(path) {
        Ok(numbers) => numbers,
        Err(e) => return Ok(DeviceOutcome::Failed(e)),
    };

    debug!("Taking device {} ({}:{})", path.display(), major, minor);
    let res = tokio::time::timeout(call_timeout, control.take_device(major, minor))
        .await
        .map_err(|_| PokerError::Timeout {
            operation: format!("TakeDevice {}", path.display()),
            after: call_timeout,
        })?;

    match res {
        Ok((fd, inactive)) => {
            let raw = fd.as_raw_fd();
            debug!("Device is fd {} active: {}", raw, !inactive);
            table.push(DeviceGrant::new(path.to_path_buf(), major, minor, fd, inactive));
            Ok(DeviceOutcome::Granted {
                path: path.to_path_buf(),
                major,
                minor,
                fd: raw,
                paused: inactive,
            })
        }
        Err(e) => Ok(DeviceOutcome::Failed(PokerError::DeviceGrant {
            path: path.to_path_buf(),
            major,
            minor,
            reason: e.to_string(),
        })),
    }
}

/// Release every granted device, then control; closes all fds
///
/// Errors are logged only: this runs on the way out, often after the bus
/// is already gone.
pub async fn release_all<C: SessionControl>(
    control: &C,
    table: &mut DeviceTable,
    call_timeout: Duration,
) {
    for grant in table.drain() {
        match tokio::time::timeout(call_timeout, control.release_device(grant.major, grant.minor))
            .await
        {
            Ok(Ok(())) => debug!(
                "Released {} ({}:{}) fd {:?}",
                grant.path.display(),
                grant.major,
                grant.minor,
                grant.raw_fd()
            ),
            Ok(Err(e)) => warn!("ReleaseDevice {} failed: {}", grant.path.display(), e),
            Err(_) => warn!("ReleaseDevice {} timed out", grant.path.display()),
        }
    }

    match tokio::time::timeout(call_timeout, control.release_control()).await {
        Ok(Ok(())) => info!("Released session control"),
        Ok(Err(e)) => warn!("ReleaseControl failed: {}", e),
        Err(_) => warn!("ReleaseControl timed out"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::session::session_object_path;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::os::unix::net::UnixStream;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Call {
        TakeControl(bool),
        ReleaseControl,
        TakeDevice(u32, u32),
        ReleaseDevice(u32, u32),
        PauseDeviceComplete(u32, u32),
    }

    /// Scripted controller: records calls, denies listed devices
    #[derive(Default)]
    pub(crate) struct FakeControl {
        pub calls: RefCell<Vec<Call>>,
        pub deny_control: bool,
        pub denied: HashSet<(u32, u32)>,
        /// Every n-th TakeDevice (1-based) that is denied
        pub deny_nth: HashSet<usize>,
        pub start_paused: bool,
        /// TakeControl never answers
        pub hang_control: bool,
        /// The n-th TakeDevice (1-based) never answers
        pub hang_nth: HashSet<usize>,
        /// PauseDeviceComplete never answers
        pub hang_ack: bool,
    }

    impl FakeControl {
        pub(crate) fn calls(&self) -> Vec<Call> {
            self.calls.borrow().clone()
        }

        fn take_device_count(&self) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|c| matches!(c, Call::TakeDevice(..)))
                .count()
        }
    }

    impl SessionControl for FakeControl {
        async fn take_control(&self, force: bool) -> zbus::Result<()> {
            self.calls.borrow_mut().push(Call::TakeControl(force));
            if self.hang_control {
                std::future::pending::<()>().await;
            }
            if self.deny_control {
                return Err(zbus::Error::Failure(
                    "Device or resource busy".to_string(),
                ));
            }
            Ok(())
        }

        async fn release_control(&self) -> zbus::Result<()> {
            self.calls.borrow_mut().push(Call::ReleaseControl);
            Ok(())
        }

        async fn take_device(&self, major: u32, minor: u32) -> zbus::Result<(OwnedFd, bool)> {
            self.calls.borrow_mut().push(Call::TakeDevice(major, minor));
            let nth = self.take_device_count();
            if self.hang_nth.contains(&nth) {
                std::future::pending::<()>().await;
            }
            if self.denied.contains(&(major, minor)) || self.deny_nth.contains(&nth) {
                return Err(zbus::Error::Failure("Operation not permitted".to_string()));
            }
            let (a, _b) = UnixStream::pair().map_err(|e| zbus::Error::Failure(e.to_string()))?;
            Ok((OwnedFd::from(a), self.start_paused))
        }

        async fn release_device(&self, major: u32, minor: u32) -> zbus::Result<()> {
            self.calls.borrow_mut().push(Call::ReleaseDevice(major, minor));
            Ok(())
        }

        async fn pause_device_complete(&self, major: u32, minor: u32) -> zbus::Result<()> {
            self.calls
                .borrow_mut()
                .push(Call::PauseDeviceComplete(major, minor));
            if self.hang_ack {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn handle() -> SessionHandle {
        SessionHandle {
            id: "3".to_string(),
            path: session_object_path("3").unwrap(),
        }
    }

    fn settings() -> Settings {
        Settings {
            call_timeout: TIMEOUT,
            force: false,
            timestamp_format: "%H:%M:%S".to_string(),
            trace_input: false,
        }
    }

    fn null_and_zero() -> Vec<PathBuf> {
        vec![PathBuf::from("/dev/null"), PathBuf::from("/dev/zero")]
    }

    #[tokio::test]
    async fn test_session_denied_control_takes_no_device() {
        let control = FakeControl {
            deny_control: true,
            ..Default::default()
        };
        let mut out = Vec::new();

        let err = run_session(
            &control,
            &handle(),
            &null_and_zero(),
            &settings(),
            futures_util::stream::pending::<SessionEvent>(),
            std::future::pending(),
            &mut out,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PokerError::ControlAcquisition { .. }));
        assert_eq!(control.calls(), vec![Call::TakeControl(false)]);
        assert!(out.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_shutdown_releases_devices_then_control() {
        let control = FakeControl::default();
        let mut out = Vec::new();

        run_session(
            &control,
            &handle(),
            &null_and_zero(),
            &settings(),
            futures_util::stream::pending::<SessionEvent>(),
            tokio::time::sleep(Duration::from_secs(30)),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(
            control.calls(),
            vec![
                Call::TakeControl(false),
                Call::TakeDevice(1, 3),
                Call::TakeDevice(1, 5),
                Call::ReleaseDevice(1, 3),
                Call::ReleaseDevice(1, 5),
                Call::ReleaseControl,
            ]
        );
        assert_eq!(String::from_utf8(out).unwrap().lines().count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_stream_end_still_releases() {
        let control = FakeControl::default();
        let mut out = Vec::new();

        let err = run_session(
            &control,
            &handle(),
            &[PathBuf::from("/dev/null")],
            &settings(),
            futures_util::stream::empty::<SessionEvent>(),
            std::future::pending(),
            &mut out,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, PokerError::ConnectionLost(_)));
        assert_eq!(
            control.calls()[2..],
            [Call::ReleaseDevice(1, 3), Call::ReleaseControl]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_shutdown_during_take_control() {
        let control = FakeControl {
            hang_control: true,
            ..Default::default()
        };
        let mut out = Vec::new();
        let settings = Settings {
            call_timeout: Duration::from_secs(3600),
            ..settings()
        };

        run_session(
            &control,
            &handle(),
            &null_and_zero(),
            &settings,
            futures_util::stream::pending::<SessionEvent>(),
            tokio::time::sleep(Duration::from_millis(100)),
            &mut out,
        )
        .await
        .unwrap();

        // Control never held, so nothing to release
        assert_eq!(control.calls(), vec![Call::TakeControl(false)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_shutdown_during_take_device_releases_grants() {
        let control = FakeControl {
            hang_nth: [2].into_iter().collect(),
            ..Default::default()
        };
        let mut out = Vec::new();
        let settings = Settings {
            call_timeout: Duration::from_secs(3600),
            ..settings()
        };

        run_session(
            &control,
            &handle(),
            &null_and_zero(),
            &settings,
            futures_util::stream::pending::<SessionEvent>(),
            tokio::time::sleep(Duration::from_millis(100)),
            &mut out,
        )
        .await
        .unwrap();

        assert_eq!(
            control.calls(),
            vec![
                Call::TakeControl(false),
                Call::TakeDevice(1, 3),
                Call::TakeDevice(1, 5),
                Call::ReleaseDevice(1, 3),
                Call::ReleaseControl,
            ]
        );
    }

    #[tokio::test]
    async fn test_take_control_passes_force() {
        let control = FakeControl::default();
        take_control(&control, &handle(), true, TIMEOUT).await.unwrap();
        assert_eq!(control.calls(), vec![Call::TakeControl(true)]);
    }

    #[tokio::test]
    async fn test_take_control_failure() {
        let control = FakeControl {
            deny_control: true,
            ..Default::default()
        };
        let err = take_control(&control, &handle(), false, TIMEOUT)
            .await
            .unwrap_err();
        match err {
            PokerError::ControlAcquisition { session, reason } => {
                assert_eq!(session, "3");
                assert!(reason.contains("busy"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_mixed_outcomes_in_input_order() {
        // /dev/null (1:3), /dev/zero (1:5), /dev/full (1:7); deny the second
        let control = FakeControl {
            denied: [(1, 5)].into_iter().collect(),
            ..Default::default()
        };
        let paths: Vec<PathBuf> = ["/dev/null", "/dev/zero", "/dev/full"]
            .iter()
            .map(PathBuf::from)
            .collect();
        let mut table = DeviceTable::new(false);
        let mut out = Vec::new();

        let outcomes = take_devices(&control, &paths, TIMEOUT, &mut table, &mut out)
            .await
            .unwrap();

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes[0].is_granted());
        assert!(matches!(
            outcomes[1],
            DeviceOutcome::Failed(PokerError::DeviceGrant { major: 1, minor: 5, .. })
        ));
        assert!(outcomes[2].is_granted());
        assert_eq!(
            control.calls(),
            vec![
                Call::TakeDevice(1, 3),
                Call::TakeDevice(1, 5),
                Call::TakeDevice(1, 7)
            ]
        );
        assert_eq!(table.len(), 2);

        let report = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = report.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("granted /dev/null (1:3)"));
        assert!(lines[1].starts_with("failed ") && lines[1].contains("/dev/zero"));
        assert!(lines[2].starts_with("granted /dev/full (1:7)"));
    }

    #[tokio::test]
    async fn test_unresolvable_device_is_skipped() {
        let control = FakeControl::default();
        let paths = vec![
            PathBuf::from("/dev/does-not-exist-poker"),
            PathBuf::from("/dev/null"),
        ];
        let mut table = DeviceTable::new(false);
        let mut out = Vec::new();

        let outcomes = take_devices(&control, &paths, TIMEOUT, &mut table, &mut out)
            .await
            .unwrap();

        assert!(matches!(
            outcomes[0],
            DeviceOutcome::Failed(PokerError::DeviceResolution { .. })
        ));
        assert!(outcomes[1].is_granted());
        // stat failure never reaches the bus
        assert_eq!(control.calls(), vec![Call::TakeDevice(1, 3)]);
    }

    #[tokio::test]
    async fn test_paused_flag_is_reported() {
        let control = FakeControl {
            start_paused: true,
            ..Default::default()
        };
        let mut table = DeviceTable::new(false);
        let mut out = Vec::new();
        take_devices(&control, &[PathBuf::from("/dev/null")], TIMEOUT, &mut table, &mut out)
            .await
            .unwrap();
        assert!(String::from_utf8(out).unwrap().trim_end().ends_with("paused"));
        assert!(table.iter().all(|g| g.paused));
    }

    // Assumption: duplicate paths are independent attempts, no dedup
    #[tokio::test]
    async fn test_duplicate_devices_are_attempted_independently_assumption() {
        let control = FakeControl {
            deny_nth: [2].into_iter().collect(),
            ..Default::default()
        };
        let paths = vec![PathBuf::from("/dev/null"), PathBuf::from("/dev/null")];
        let mut table = DeviceTable::new(false);
        let mut out = Vec::new();

        let outcomes = take_devices(&control, &paths, TIMEOUT, &mut table, &mut out)
            .await
            .unwrap();

        assert_eq!(
            control.calls(),
            vec![Call::TakeDevice(1, 3), Call::TakeDevice(1, 3)]
        );
        assert!(outcomes[0].is_granted());
        assert!(!outcomes[1].is_granted());
    }

    #[tokio::test]
    async fn test_release_all_releases_devices_then_control() {
        let control = FakeControl::default();
        let paths = vec![PathBuf::from("/dev/null"), PathBuf::from("/dev/zero")];
        let mut table = DeviceTable::new(false);
        let mut out = Vec::new();
        take_devices(&control, &paths, TIMEOUT, &mut table, &mut out)
            .await
            .unwrap();
        control.calls.borrow_mut().clear();

        release_all(&control, &mut table, TIMEOUT).await;

        assert!(table.is_empty());
        assert_eq!(
            control.calls(),
            vec![
                Call::ReleaseDevice(1, 3),
                Call::ReleaseDevice(1, 5),
                Call::ReleaseControl
            ]
        );
    }

    struct StuckControl;

    impl SessionControl for StuckControl {
        async fn take_control(&self, _force: bool) -> zbus::Result<()> {
            std::future::pending().await
        }
        async fn release_control(&self) -> zbus::Result<()> {
            Ok(())
        }
        async fn take_device(&self, _major: u32, _minor: u32) -> zbus::Result<(OwnedFd, bool)> {
            std::future::pending().await
        }
        async fn release_device(&self, _major: u32, _minor: u32) -> zbus::Result<()> {
            Ok(())
        }
        async fn pause_device_complete(&self, _major: u32, _minor: u32) -> zbus::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_timeouts_are_fatal() {
        let err = take_control(&StuckControl, &handle(), false, TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, PokerError::Timeout { .. }));

        let mut table = DeviceTable::new(false);
        let mut out = Vec::new();
        let err = take_devices(
            &StuckControl,
            &[PathBuf::from("/dev/null")],
            TIMEOUT,
            &mut table,
            &mut out,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, PokerError::Timeout { .. }));
    }
}
