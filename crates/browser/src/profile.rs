//! Profile hygiene: singleton locks, crash reports, decoration, and the
//! corruption-cleanup list used by early-crash recovery.

use std::path::Path;

use {serde_json::json, tracing::debug};

/// Singleton files a dead browser leaves behind. Any of them present at
/// launch would make the new process exit claiming another instance owns the
/// profile.
const SINGLETON_FILES: &[&str] = &["SingletonLock", "SingletonSocket", "SingletonCookie"];

/// Crash-report directories that accumulate under the profile.
const CRASH_REPORT_DIRS: &[&str] = &["Crash Reports", "Crashpad"];

/// Profile subpaths deleted when an early crash signals corruption. Caches
/// and indexes regenerate; everything else in the profile survives.
pub const CORRUPTION_CLEANUP_SUBPATHS: &[&str] = &[
    "Default/Preferences",
    "Default/Cache",
    "Default/Code Cache",
    "Default/GPUCache",
    "Default/File System",
    "Default/IndexedDB",
    "GrShaderCache",
    "ShaderCache",
];

/// Remove stale singleton files so a fresh process can claim the profile.
pub fn clean_singleton_files(user_data_dir: &Path) {
    for name in SINGLETON_FILES {
        let path = user_data_dir.join(name);
        if path.symlink_metadata().is_ok() {
            debug!(path = %path.display(), "removing stale singleton file");
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Purge accumulated crash reports.
pub fn clean_crash_reports(user_data_dir: &Path) {
    for name in CRASH_REPORT_DIRS {
        let path = user_data_dir.join(name);
        if path.is_dir() {
            debug!(path = %path.display(), "purging crash reports");
            let _ = std::fs::remove_dir_all(&path);
        }
    }
}

/// Delete the fixed corruption-cleanup set after an early crash.
pub fn nuke_corrupt_state(user_data_dir: &Path) {
    for sub in CORRUPTION_CLEANUP_SUBPATHS {
        let path = user_data_dir.join(sub);
        if path.is_dir() {
            let _ = std::fs::remove_dir_all(&path);
        } else if path.is_file() {
            let _ = std::fs::remove_file(&path);
        }
    }
}

/// Make sure the profile skeleton exists so decoration has a Preferences
/// file to edit.
pub fn ensure_profile(user_data_dir: &Path) -> std::io::Result<()> {
    let default_dir = user_data_dir.join("Default");
    std::fs::create_dir_all(&default_dir)?;
    let prefs = default_dir.join("Preferences");
    if !prefs.exists() {
        std::fs::write(&prefs, "{}")?;
    }
    Ok(())
}

/// Whether the profile already carries our cosmetic decoration.
pub fn is_decorated(user_data_dir: &Path, name: &str) -> bool {
    let prefs = user_data_dir.join("Default/Preferences");
    let Ok(raw) = std::fs::read_to_string(&prefs) else {
        return false;
    };
    let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
        return false;
    };
    value
        .pointer("/profile/name")
        .and_then(|v| v.as_str())
        .is_some_and(|n| n == name)
}

/// Write name/color cosmetics into the profile's Preferences.
pub fn decorate(user_data_dir: &Path, name: &str, color: Option<&str>) -> std::io::Result<()> {
    ensure_profile(user_data_dir)?;
    let prefs_path = user_data_dir.join("Default/Preferences");
    let raw = std::fs::read_to_string(&prefs_path)?;
    let mut value: serde_json::Value =
        serde_json::from_str(&raw).unwrap_or_else(|_| json!({}));

    let profile = value
        .as_object_mut()
        .map(|o| o.entry("profile").or_insert_with(|| json!({})))
        .and_then(|v| v.as_object_mut());
    if let Some(profile) = profile {
        profile.insert("name".into(), json!(name));
        if let Some(color) = color {
            profile.insert("theme_color".into(), json!(color));
        }
    }

    std::fs::write(&prefs_path, value.to_string())?;
    debug!(path = %prefs_path.display(), name, "profile decorated");
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_cleanup_removes_only_singletons() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("SingletonLock"), "").unwrap();
        std::fs::write(dir.path().join("SingletonSocket"), "").unwrap();
        std::fs::write(dir.path().join("Local State"), "keep").unwrap();

        clean_singleton_files(dir.path());

        assert!(!dir.path().join("SingletonLock").exists());
        assert!(!dir.path().join("SingletonSocket").exists());
        assert!(dir.path().join("Local State").exists());
    }

    #[test]
    fn crash_reports_purged() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Crash Reports/pending")).unwrap();
        std::fs::create_dir_all(dir.path().join("Crashpad")).unwrap();

        clean_crash_reports(dir.path());

        assert!(!dir.path().join("Crash Reports").exists());
        assert!(!dir.path().join("Crashpad").exists());
    }

    #[test]
    fn corruption_nuke_spares_the_rest_of_the_profile() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("Default/Cache")).unwrap();
        std::fs::create_dir_all(dir.path().join("Default/IndexedDB")).unwrap();
        std::fs::create_dir_all(dir.path().join("GrShaderCache")).unwrap();
        std::fs::create_dir_all(dir.path().join("Default/Bookmarks.d")).unwrap();
        std::fs::write(dir.path().join("Default/Preferences"), "{}").unwrap();
        std::fs::write(dir.path().join("Default/History"), "h").unwrap();

        nuke_corrupt_state(dir.path());

        assert!(!dir.path().join("Default/Cache").exists());
        assert!(!dir.path().join("Default/IndexedDB").exists());
        assert!(!dir.path().join("GrShaderCache").exists());
        assert!(!dir.path().join("Default/Preferences").exists());
        // Untouched: user data outside the cleanup list.
        assert!(dir.path().join("Default/Bookmarks.d").exists());
        assert!(dir.path().join("Default/History").exists());
    }

    #[test]
    fn decoration_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!is_decorated(dir.path(), "portico"));

        decorate(dir.path(), "portico", Some("#1a73e8")).unwrap();
        assert!(is_decorated(dir.path(), "portico"));
        assert!(!is_decorated(dir.path(), "other-name"));

        let raw = std::fs::read_to_string(dir.path().join("Default/Preferences")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value.pointer("/profile/theme_color").unwrap(), "#1a73e8");
    }

    #[test]
    fn decoration_preserves_existing_preferences() {
        let dir = tempfile::tempdir().unwrap();
        ensure_profile(dir.path()).unwrap();
        std::fs::write(
            dir.path().join("Default/Preferences"),
            r#"{"download":{"directory_upgrade":true}}"#,
        )
        .unwrap();

        decorate(dir.path(), "portico", None).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("Default/Preferences")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(
            value.pointer("/download/directory_upgrade").unwrap(),
            &json!(true)
        );
        assert_eq!(value.pointer("/profile/name").unwrap(), "portico");
    }
}
