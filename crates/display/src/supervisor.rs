//! Child-process supervision for the display pair.
//!
//! Owns two children: the virtual display server and the remote-framebuffer
//! server bound to it. Unexpected exits schedule a debounced restart per
//! process kind; a display restart drags the framebuffer server along two
//! seconds later. `stop` cancels every pending restart before signaling the
//! children, so nothing respawns behind it.

use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use {
    nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    },
    serde::Serialize,
    tokio::{
        process::{Child, Command},
        sync::Mutex,
        task::JoinHandle,
        time::sleep,
    },
    tracing::{debug, error, info, warn},
    which::which,
};

use portico_config::DisplayConfig;

use crate::{
    error::{Error, Result},
    lockfile,
};

const LOCK_WAIT_DEADLINE: Duration = Duration::from_secs(5);
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOCK_GRACE: Duration = Duration::from_millis(200);
const RESTART_DELAY: Duration = Duration::from_secs(5);
const FRAME_FOLLOW_DELAY: Duration = Duration::from_secs(2);

const DISPLAY_BIN: &str = "Xvfb";
const FRAME_BIN: &str = "x11vnc";

/// Which supervised process a child handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcKind {
    Display,
    FrameServer,
}

/// Read-only snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DisplayStatus {
    pub running: bool,
    pub display: Option<u32>,
    pub display_pid: Option<u32>,
    pub frame_server_pid: Option<u32>,
}

struct Inner {
    running: bool,
    stopping: bool,
    display: Option<u32>,
    /// Whether we spawned the display server (a reused display is left alone
    /// on stop).
    owns_display: bool,
    pids: HashMap<ProcKind, u32>,
    restarts: HashMap<ProcKind, JoinHandle<()>>,
}

impl Inner {
    fn snapshot(&self) -> DisplayStatus {
        DisplayStatus {
            running: self.running,
            display: self.display,
            display_pid: self.pids.get(&ProcKind::Display).copied(),
            frame_server_pid: self.pids.get(&ProcKind::FrameServer).copied(),
        }
    }
}

pub struct DisplaySupervisor {
    config: DisplayConfig,
    display_bin: PathBuf,
    frame_bin: PathBuf,
    inner: Mutex<Inner>,
}

impl DisplaySupervisor {
    /// Verify the required binaries are discoverable and build the
    /// supervisor. A missing binary means the display service is disabled.
    pub fn new(config: DisplayConfig) -> Result<Arc<Self>> {
        let display_bin =
            which(DISPLAY_BIN).map_err(|_| Error::BinaryMissing(DISPLAY_BIN.into()))?;
        let frame_bin = which(FRAME_BIN).map_err(|_| Error::BinaryMissing(FRAME_BIN.into()))?;
        Ok(Self::with_binaries(config, display_bin, frame_bin))
    }

    /// Build with explicit binary paths (tests substitute stand-ins).
    pub fn with_binaries(config: DisplayConfig, display_bin: PathBuf, frame_bin: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            config,
            display_bin,
            frame_bin,
            inner: Mutex::new(Inner {
                running: false,
                stopping: false,
                display: None,
                owns_display: false,
                pids: HashMap::new(),
                restarts: HashMap::new(),
            }),
        })
    }

    /// Start the display pair. Starting an already-running supervisor
    /// returns the current status unchanged.
    pub async fn start(self: &Arc<Self>) -> Result<DisplayStatus> {
        let mut inner = self.inner.lock().await;
        if inner.running {
            return Ok(inner.snapshot());
        }
        inner.stopping = false;

        let (display, reused) = self.resolve_display()?;
        let display_field = display;
        if reused {
            info!(display = display_field, "reusing live display");
        } else {
            let child = self.spawn_display(display)?;
            let pid = child.id();
            if let Some(pid) = pid {
                inner.pids.insert(ProcKind::Display, pid);
            }
            Self::monitor(Arc::clone(self), ProcKind::Display, child);

            // The display is up once its lock file appears.
            let lock = lockfile::lock_path(display);
            let deadline = tokio::time::Instant::now() + LOCK_WAIT_DEADLINE;
            while !lock.exists() {
                if tokio::time::Instant::now() >= deadline {
                    if let Some(pid) = inner.pids.remove(&ProcKind::Display) {
                        term_pid(pid);
                    }
                    return Err(Error::DisplayTimeout(display));
                }
                sleep(LOCK_POLL_INTERVAL).await;
            }
            sleep(LOCK_GRACE).await;
        }

        inner.display = Some(display);
        inner.owns_display = !reused;

        let child = self.spawn_frame_server(display)?;
        if let Some(pid) = child.id() {
            inner.pids.insert(ProcKind::FrameServer, pid);
        }
        Self::monitor(Arc::clone(self), ProcKind::FrameServer, child);

        inner.running = true;
        info!(display = display_field, "display supervisor started");
        Ok(inner.snapshot())
    }

    /// Tear everything down: cancel pending restarts, SIGTERM both children,
    /// clear state. Stopping an already-stopped supervisor is a no-op.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if !inner.running && inner.pids.is_empty() && inner.restarts.is_empty() {
            return;
        }
        inner.stopping = true;
        inner.running = false;

        for (kind, handle) in inner.restarts.drain() {
            debug!(?kind, "cancelling pending restart");
            handle.abort();
        }
        for (kind, pid) in inner.pids.drain() {
            debug!(?kind, pid, "terminating child");
            term_pid(pid);
        }
        inner.display = None;
        inner.owns_display = false;
        info!("display supervisor stopped");
    }

    /// Read-only snapshot.
    pub async fn status(&self) -> DisplayStatus {
        self.inner.lock().await.snapshot()
    }

    #[cfg(test)]
    async fn pending_restart_kinds(&self) -> Vec<ProcKind> {
        self.inner.lock().await.restarts.keys().copied().collect()
    }

    // ── Display selection ────────────────────────────────────────────────

    /// Pick the display number: reuse a live lock, remove a stale one, or
    /// scan for a free number. Returns `(display, reused)`.
    fn resolve_display(&self) -> Result<(u32, bool)> {
        if let Some(n) = self.config.display {
            let lock = lockfile::lock_path(n);
            if lockfile::lock_is_live(&lock) {
                return Ok((n, true));
            }
            lockfile::remove_stale_lock(&lock)?;
            return Ok((n, false));
        }

        for n in 99..=119 {
            let lock = lockfile::lock_path(n);
            if lockfile::lock_is_live(&lock) {
                return Ok((n, true));
            }
            lockfile::remove_stale_lock(&lock)?;
            if !lock.exists() {
                return Ok((n, false));
            }
        }
        Err(Error::NoFreeDisplay)
    }

    // ── Spawning ─────────────────────────────────────────────────────────

    fn spawn_display(&self, display: u32) -> Result<Child> {
        let screen = format!(
            "{}x{}x{}",
            self.config.width, self.config.height, self.config.depth
        );
        let child = Command::new(&self.display_bin)
            .arg(format!(":{display}"))
            .args(["-screen", "0"])
            .arg(screen)
            .args(["-nolisten", "tcp"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child)
    }

    fn spawn_frame_server(&self, display: u32) -> Result<Child> {
        let child = Command::new(&self.frame_bin)
            .arg("-display")
            .arg(format!(":{display}"))
            .arg("-rfbport")
            .arg(self.config.rfb_port.to_string())
            .args(["-localhost", "-shared", "-forever", "-nopw", "-quiet"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(child)
    }

    // ── Exit handling ────────────────────────────────────────────────────

    /// Watch one child until it exits. A stale monitor (its pid was already
    /// replaced by a respawn) takes no action.
    fn monitor(sup: Arc<Self>, kind: ProcKind, mut child: Child) {
        let my_pid = child.id();
        tokio::spawn(async move {
            let status = child.wait().await;
            let mut inner = sup.inner.lock().await;
            if inner.pids.get(&kind) != my_pid.as_ref() {
                return;
            }
            inner.pids.remove(&kind);
            match status {
                Ok(s) if s.success() => debug!(?kind, "child exited cleanly"),
                Ok(s) => warn!(?kind, status = %s, "child exited unexpectedly"),
                Err(e) => warn!(?kind, error = %e, "child wait failed"),
            }
            if inner.running && !inner.stopping {
                Self::schedule_restart(&sup, &mut inner, kind, RESTART_DELAY);
            }
        });
    }

    /// Arm the restart timer for `kind` unless one is already pending.
    fn schedule_restart(sup: &Arc<Self>, inner: &mut Inner, kind: ProcKind, delay: Duration) {
        if inner.restarts.contains_key(&kind) {
            return;
        }
        info!(?kind, delay_ms = delay.as_millis() as u64, "scheduling restart");
        let sup = Arc::clone(sup);
        let handle = tokio::spawn(async move {
            sleep(delay).await;
            Self::respawn(sup, kind).await;
        });
        inner.restarts.insert(kind, handle);
    }

    async fn respawn(sup: Arc<Self>, kind: ProcKind) {
        let mut inner = sup.inner.lock().await;
        inner.restarts.remove(&kind);
        if !inner.running || inner.stopping {
            return;
        }
        let Some(display) = inner.display else {
            return;
        };
        let display_field = display;

        match kind {
            ProcKind::Display => {
                let _ = lockfile::remove_stale_lock(&lockfile::lock_path(display));
                match sup.spawn_display(display) {
                    Ok(child) => {
                        if let Some(pid) = child.id() {
                            inner.pids.insert(kind, pid);
                        }
                        Self::monitor(Arc::clone(&sup), kind, child);
                        inner.owns_display = true;
                        info!(display = display_field, "display respawned");
                        // The framebuffer server follows once the display is up.
                        Self::schedule_restart(
                            &sup,
                            &mut inner,
                            ProcKind::FrameServer,
                            FRAME_FOLLOW_DELAY,
                        );
                    },
                    Err(e) => {
                        error!(error = %e, "display respawn failed");
                        Self::schedule_restart(&sup, &mut inner, kind, RESTART_DELAY);
                    },
                }
            },
            ProcKind::FrameServer => {
                if let Some(old) = inner.pids.remove(&kind) {
                    term_pid(old);
                }
                match sup.spawn_frame_server(display) {
                    Ok(child) => {
                        if let Some(pid) = child.id() {
                            inner.pids.insert(kind, pid);
                        }
                        Self::monitor(Arc::clone(&sup), kind, child);
                        info!(display = display_field, "framebuffer server respawned");
                    },
                    Err(e) => {
                        error!(error = %e, "framebuffer server respawn failed");
                        Self::schedule_restart(&sup, &mut inner, kind, RESTART_DELAY);
                    },
                }
            },
        }
    }
}

fn term_pid(pid: u32) {
    let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(all(test, unix))]
mod tests {
    use super::*;

    /// Write an executable shell script and return its path.
    fn script(dir: &std::path::Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn config(display: u32) -> DisplayConfig {
        DisplayConfig {
            display: Some(display),
            ..DisplayConfig::default()
        }
    }

    #[tokio::test]
    async fn stop_when_never_started_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let fake = script(dir.path(), "fake", "sleep 30");
        let sup = DisplaySupervisor::with_binaries(config(4240), fake.clone(), fake);
        sup.stop().await;
        let status = sup.status().await;
        assert!(!status.running);
        assert!(status.display.is_none());
    }

    #[tokio::test]
    async fn start_spawns_both_children_and_stop_clears_state() {
        let display = 4241;
        let lock = lockfile::lock_path(display);
        let _ = std::fs::remove_file(&lock);

        let dir = tempfile::tempdir().unwrap();
        // Stand-in display server: writes its lock then parks.
        let display_bin = script(
            dir.path(),
            "fake-display",
            &format!("echo $$ > {}\nsleep 30", lock.display()),
        );
        let frame_bin = script(dir.path(), "fake-frame", "sleep 30");

        let sup = DisplaySupervisor::with_binaries(config(display), display_bin, frame_bin);
        let status = sup.start().await.unwrap();
        assert!(status.running);
        assert_eq!(status.display, Some(display));
        assert!(status.display_pid.is_some());
        assert!(status.frame_server_pid.is_some());

        // Idempotent: a second start returns the same pids.
        let again = sup.start().await.unwrap();
        assert_eq!(again.display_pid, status.display_pid);
        assert_eq!(again.frame_server_pid, status.frame_server_pid);

        sup.stop().await;
        let status = sup.status().await;
        assert!(!status.running);
        assert!(status.display_pid.is_none());
        assert!(status.frame_server_pid.is_none());
        let _ = std::fs::remove_file(&lock);
    }

    #[tokio::test]
    async fn reuses_display_with_live_lock() {
        let display = 4242;
        let lock = lockfile::lock_path(display);
        // Our own pid is definitely alive.
        std::fs::write(&lock, format!("{}", std::process::id())).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let display_bin = script(dir.path(), "fake-display", "exit 7");
        let frame_bin = script(dir.path(), "fake-frame", "sleep 30");

        let sup = DisplaySupervisor::with_binaries(config(display), display_bin, frame_bin);
        let status = sup.start().await.unwrap();
        assert!(status.running);
        // The display server was never spawned; only the frame server runs.
        assert!(status.display_pid.is_none());
        assert!(status.frame_server_pid.is_some());

        sup.stop().await;
        let _ = std::fs::remove_file(&lock);
    }

    #[tokio::test]
    async fn frame_server_crash_schedules_exactly_one_restart() {
        let display = 4243;
        let lock = lockfile::lock_path(display);
        std::fs::write(&lock, format!("{}", std::process::id())).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let display_bin = script(dir.path(), "fake-display", "sleep 30");
        // The frame server dies immediately with a non-zero status.
        let frame_bin = script(dir.path(), "fake-frame", "exit 1");

        let sup = DisplaySupervisor::with_binaries(config(display), display_bin, frame_bin);
        sup.start().await.unwrap();

        // Give the monitor a moment to observe the exit.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            sup.pending_restart_kinds().await,
            vec![ProcKind::FrameServer]
        );

        // Clean stop before the 5 s debounce fires: the timer is cancelled
        // and no further child is spawned.
        sup.stop().await;
        assert!(sup.pending_restart_kinds().await.is_empty());
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = sup.status().await;
        assert!(!status.running);
        assert!(status.frame_server_pid.is_none());
        let _ = std::fs::remove_file(&lock);
    }

    #[tokio::test]
    async fn frame_server_respawns_after_debounce() {
        let display = 4245;
        let lock = lockfile::lock_path(display);
        std::fs::write(&lock, format!("{}", std::process::id())).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let display_bin = script(dir.path(), "fake-display", "sleep 30");
        // Dies once, marked by a flag file, then parks on the second run.
        let marker = dir.path().join("crashed-once");
        let frame_bin = script(
            dir.path(),
            "fake-frame",
            &format!(
                "if [ -e {m} ]; then sleep 30; else touch {m}; exit 1; fi",
                m = marker.display()
            ),
        );

        let sup = DisplaySupervisor::with_binaries(config(display), display_bin, frame_bin);
        sup.start().await.unwrap();

        // The debounced restart fires after 5 s and spawns a fresh child.
        tokio::time::sleep(Duration::from_millis(5600)).await;
        let status = sup.status().await;
        assert!(status.running);
        assert!(status.frame_server_pid.is_some());
        assert!(sup.pending_restart_kinds().await.is_empty());

        sup.stop().await;
        let _ = std::fs::remove_file(&lock);
    }

    #[tokio::test]
    async fn missing_display_lock_times_out() {
        let display = 4244;
        let lock = lockfile::lock_path(display);
        let _ = std::fs::remove_file(&lock);

        let dir = tempfile::tempdir().unwrap();
        // Display server that never writes a lock file.
        let display_bin = script(dir.path(), "fake-display", "sleep 30");
        let frame_bin = script(dir.path(), "fake-frame", "sleep 30");

        let sup = DisplaySupervisor::with_binaries(config(display), display_bin, frame_bin);
        let err = sup.start().await.unwrap_err();
        assert!(matches!(err, Error::DisplayTimeout(n) if n == display));
        assert!(!sup.status().await.running);
    }
}
