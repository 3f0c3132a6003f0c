//! X11-style display lock files (`/tmp/.X<n>-lock`).
//!
//! A lock file naming a live process means the display is in use and may be
//! reused; a lock naming a dead process is stale and must be removed before
//! a new display server can bind the number.

use std::path::{Path, PathBuf};

use {
    nix::{sys::signal::kill, unistd::Pid},
    tracing::debug,
};

/// Path of the lock file for display `:n`.
pub fn lock_path(display: u32) -> PathBuf {
    PathBuf::from(format!("/tmp/.X{display}-lock"))
}

/// Parse the pid out of a lock file (decimal, whitespace-padded).
pub fn read_lock_pid(path: &Path) -> Option<i32> {
    let contents = std::fs::read_to_string(path).ok()?;
    contents.trim().parse().ok()
}

/// Whether `pid` names a live process (signal 0 probe).
pub fn pid_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    kill(Pid::from_raw(pid), None).is_ok()
}

/// Whether the lock at `path` names a live process.
pub fn lock_is_live(path: &Path) -> bool {
    read_lock_pid(path).is_some_and(pid_alive)
}

/// Remove a lock file that names a dead process. No-op when the lock is
/// live or absent.
pub fn remove_stale_lock(path: &Path) -> std::io::Result<()> {
    if !path.exists() || lock_is_live(path) {
        return Ok(());
    }
    debug!(path = %path.display(), "removing stale display lock");
    std::fs::remove_file(path)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_format() {
        assert_eq!(lock_path(99), PathBuf::from("/tmp/.X99-lock"));
    }

    #[test]
    fn parses_padded_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".X99-lock");
        // The X server writes the pid right-aligned in a 10-char field.
        std::fs::write(&path, "     12345\n").unwrap();
        assert_eq!(read_lock_pid(&path), Some(12345));
    }

    #[test]
    fn garbage_lock_parses_to_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".X99-lock");
        std::fs::write(&path, "not a pid").unwrap();
        assert_eq!(read_lock_pid(&path), None);
        assert!(!lock_is_live(&path));
    }

    #[test]
    fn own_pid_is_alive() {
        assert!(pid_alive(std::process::id() as i32));
    }

    #[test]
    fn nonsense_pids_are_dead() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(-1));
        // PID_MAX on Linux defaults to well below this.
        assert!(!pid_alive(i32::MAX));
    }

    #[test]
    fn stale_lock_is_removed_live_lock_kept() {
        let dir = tempfile::tempdir().unwrap();

        let stale = dir.path().join(".X50-lock");
        std::fs::write(&stale, format!("{}", i32::MAX - 1)).unwrap();
        remove_stale_lock(&stale).unwrap();
        assert!(!stale.exists());

        let live = dir.path().join(".X51-lock");
        std::fs::write(&live, format!("{}", std::process::id())).unwrap();
        remove_stale_lock(&live).unwrap();
        assert!(live.exists());

        // Absent lock: no-op.
        remove_stale_lock(&dir.path().join(".X52-lock")).unwrap();
    }
}
