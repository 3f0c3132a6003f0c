//! Browser process lifecycle: spawn, readiness, early-crash recovery, stop.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
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
        time::sleep,
    },
    tracing::{debug, info, warn},
};

use portico_config::BrowserConfig;

use crate::{
    detect::detect_browser,
    error::{Error, Result},
    profile,
};

const READY_DEADLINE: Duration = Duration::from_secs(30);
const READY_POLL: Duration = Duration::from_millis(200);
const EARLY_CRASH_WINDOW: Duration = Duration::from_secs(5);
const STOP_DEADLINE: Duration = Duration::from_millis(2500);
const STOP_POLL: Duration = Duration::from_millis(200);

/// Signals that, inside the early-crash window, mean the profile is corrupt
/// rather than the launch being misconfigured.
const FATAL_SIGNALS: &[Signal] = &[
    Signal::SIGTRAP,
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGFPE,
    Signal::SIGSEGV,
];

fn is_fatal_signal(raw: i32) -> bool {
    FATAL_SIGNALS.iter().any(|s| *s as i32 == raw)
}

/// Handle to a launched browser.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserHandle {
    pub pid: u32,
    pub cdp_port: u16,
    /// The debugging WebSocket URL advertised by the browser.
    pub ws_url: String,
}

/// Snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BrowserStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub cdp_port: u16,
    pub tabs: u64,
    pub stealth: bool,
}

struct Running {
    child: Child,
    handle: BrowserHandle,
}

/// Outcome of one spawn attempt.
enum Attempt {
    /// Early crash with a corruption signal; worth one profile-nuke retry.
    Corrupt(i32),
    /// Anything else; propagated as-is.
    Other(Error),
}

pub struct BrowserLauncher {
    config: BrowserConfig,
    state: Mutex<Option<Running>>,
}

impl BrowserLauncher {
    pub fn new(config: BrowserConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// Launch the browser against a cleaned profile and wait for its
    /// debugging endpoint. Launching while already running returns the same
    /// handle.
    pub async fn launch(&self, display: Option<&str>) -> Result<BrowserHandle> {
        let mut state = self.state.lock().await;
        if let Some(running) = state.as_mut() {
            if running.child.try_wait()?.is_none() {
                return Ok(running.handle.clone());
            }
            // The previous process died behind our back; relaunch.
            *state = None;
        }

        let executable = self.resolve_executable()?;
        let user_data_dir = self.user_data_dir();
        std::fs::create_dir_all(&user_data_dir)?;

        let running = match self.attempt(&executable, &user_data_dir, display).await {
            Ok(running) => running,
            Err(Attempt::Corrupt(signal)) => {
                warn!(signal, "browser crashed early, treating profile as corrupt");
                profile::nuke_corrupt_state(&user_data_dir);
                profile::clean_crash_reports(&user_data_dir);
                match self.attempt(&executable, &user_data_dir, display).await {
                    Ok(running) => running,
                    Err(Attempt::Corrupt(signal)) => {
                        warn!(signal, "browser crashed early again, giving up");
                        return Err(Error::ProfileCorrupt);
                    },
                    Err(Attempt::Other(e)) => return Err(e),
                }
            },
            Err(Attempt::Other(e)) => return Err(e),
        };

        info!(
            pid = running.handle.pid,
            cdp_port = running.handle.cdp_port,
            "browser ready"
        );
        let handle = running.handle.clone();
        *state = Some(running);
        Ok(handle)
    }

    /// SIGTERM, bounded wait, then SIGKILL. Stopping a stopped launcher is a
    /// no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(mut running) = state.take() else {
            return Ok(());
        };
        let pid = running.handle.pid;
        info!(pid, "stopping browser");
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);

        let deadline = Instant::now() + STOP_DEADLINE;
        loop {
            if running.child.try_wait()?.is_some() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                break;
            }
            sleep(STOP_POLL).await;
        }

        warn!(pid, "browser ignored SIGTERM, killing");
        let _ = running.child.start_kill();
        let _ = running.child.wait().await;
        Ok(())
    }

    /// Read-only snapshot, including the live tab count when reachable.
    pub async fn status(&self) -> BrowserStatus {
        let mut state = self.state.lock().await;
        let running = state
            .as_mut()
            .is_some_and(|r| matches!(r.child.try_wait(), Ok(None)));
        let pid = running
            .then(|| state.as_ref().map(|r| r.handle.pid))
            .flatten();
        drop(state);

        let tabs = if running {
            count_tabs(self.config.cdp_port).await
        } else {
            0
        };
        BrowserStatus {
            running,
            pid,
            cdp_port: self.config.cdp_port,
            tabs,
            stealth: self.config.stealth,
        }
    }

    fn resolve_executable(&self) -> Result<PathBuf> {
        let detection = detect_browser(self.config.executable.as_deref());
        match detection.path {
            Some(path) => Ok(path),
            None => {
                warn!("{}", detection.install_hint);
                Err(Error::BrowserNotAvailable)
            },
        }
    }

    fn user_data_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.config.user_data_dir {
            return dir.clone();
        }
        directories::ProjectDirs::from("", "", "portico")
            .map(|d| d.data_dir().join("browser-profile"))
            .unwrap_or_else(|| std::env::temp_dir().join("portico-browser-profile"))
    }

    fn prepare_profile(&self, user_data_dir: &Path) -> Result<()> {
        profile::ensure_profile(user_data_dir)?;
        if let Some(ref name) = self.config.profile_name
            && !profile::is_decorated(user_data_dir, name)
        {
            profile::decorate(user_data_dir, name, self.config.profile_color.as_deref())?;
        }
        Ok(())
    }

    /// One spawn attempt: clean, spawn, and poll the debugging endpoint
    /// until ready, the deadline passes, or the child dies.
    async fn attempt(
        &self,
        executable: &Path,
        user_data_dir: &Path,
        display: Option<&str>,
    ) -> std::result::Result<Running, Attempt> {
        profile::clean_singleton_files(user_data_dir);
        profile::clean_crash_reports(user_data_dir);
        self.prepare_profile(user_data_dir)
            .map_err(Attempt::Other)?;

        let args = compose_args(&self.config, user_data_dir);
        debug!(executable = %executable.display(), ?args, "spawning browser");

        let mut command = Command::new(executable);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(display) = display
            && std::env::var_os("DISPLAY").is_none()
        {
            command.env("DISPLAY", display);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Attempt::Other(Error::Io(e)))?;
        let spawned_at = Instant::now();
        let deadline = spawned_at + READY_DEADLINE;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let signal = unix_signal(&status);
                    if spawned_at.elapsed() <= EARLY_CRASH_WINDOW
                        && signal.is_some_and(is_fatal_signal)
                    {
                        return Err(Attempt::Corrupt(signal.unwrap_or_default()));
                    }
                    return Err(Attempt::Other(Error::LaunchFailed(format!(
                        "browser exited during startup: {status}"
                    ))));
                },
                Ok(None) => {},
                Err(e) => return Err(Attempt::Other(Error::Io(e))),
            }

            if let Some(ws_url) = probe_cdp(self.config.cdp_port).await {
                let handle = BrowserHandle {
                    pid: child.id().unwrap_or_default(),
                    cdp_port: self.config.cdp_port,
                    ws_url,
                };
                return Ok(Running { child, handle });
            }

            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Err(Attempt::Other(Error::ReadinessTimeout(
                    READY_DEADLINE.as_millis() as u64,
                )));
            }
            sleep(READY_POLL).await;
        }
    }
}

fn unix_signal(status: &std::process::ExitStatus) -> Option<i32> {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status.signal()
    }
    #[cfg(not(unix))]
    {
        let _ = status;
        None
    }
}

/// "Ready" means `/json/version` answers and the advertised WebSocket URL
/// accepts a handshake.
async fn probe_cdp(port: u16) -> Option<String> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
        .ok()?;
    let url = format!("http://127.0.0.1:{port}/json/version");
    let response = client.get(&url).send().await.ok()?;
    let value: serde_json::Value = response.json().await.ok()?;
    let ws_url = value.get("webSocketDebuggerUrl")?.as_str()?.to_string();

    let (stream, _) = tokio_tungstenite::connect_async(ws_url.as_str()).await.ok()?;
    drop(stream);
    Some(ws_url)
}

async fn count_tabs(port: u16) -> u64 {
    let Ok(client) = reqwest::Client::builder()
        .timeout(Duration::from_secs(1))
        .build()
    else {
        return 0;
    };
    let url = format!("http://127.0.0.1:{port}/json/list");
    let Ok(response) = client.get(&url).send().await else {
        return 0;
    };
    response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.as_array().map(|a| a.len() as u64))
        .unwrap_or(0)
}

// ── Argv composition ─────────────────────────────────────────────────────────

/// Compose the browser argv from config. Pure so the flag set is testable.
pub fn compose_args(config: &BrowserConfig, user_data_dir: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--remote-debugging-port={}", config.cdp_port),
        format!("--user-data-dir={}", user_data_dir.display()),
        "--no-first-run".into(),
        "--no-default-browser-check".into(),
        "--disable-background-networking".into(),
        "--disable-session-crashed-bubble".into(),
        "--hide-crash-restore-bubble".into(),
    ];

    if config.stealth {
        args.push("--disable-blink-features=AutomationControlled".into());
        args.push("--disable-infobars".into());
        args.push("--no-pings".into());
    }
    if let Some(ref proxy) = config.proxy {
        args.push(format!("--proxy-server={proxy}"));
    }
    if !config.extensions.is_empty() {
        args.push(format!("--load-extension={}", config.extensions.join(",")));
    }
    if config.headless {
        args.push("--headless=new".into());
    }
    if config.no_sandbox {
        args.push("--no-sandbox".into());
        args.push("--disable-setuid-sandbox".into());
    }
    if cfg!(target_os = "linux") {
        args.push("--disable-dev-shm-usage".into());
    }
    if cfg!(target_os = "macos") {
        args.push("--use-mock-keychain".into());
    }

    args.push("about:blank".into());
    args
}
