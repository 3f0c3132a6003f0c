//! Browser executable discovery and install guidance.

use std::path::PathBuf;

/// Known Chromium-based executable names to search for, most specific first.
/// Every one of these exposes the debugging endpoint the launcher needs.
const CHROMIUM_EXECUTABLES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome",
    "google-chrome-stable",
    "chrome",
    "brave-browser",
    "brave",
    "microsoft-edge",
    "microsoft-edge-stable",
    "msedge",
];

/// macOS app bundle paths, checked before `$PATH` (which can carry broken
/// wrapper scripts).
#[cfg(target_os = "macos")]
const MACOS_APP_PATHS: &[&str] = &[
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Brave Browser.app/Contents/MacOS/Brave Browser",
    "/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge",
];

/// Result of browser detection.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    pub found: bool,
    pub path: Option<PathBuf>,
    /// Platform-specific install instructions when nothing was found.
    pub install_hint: String,
}

/// Detect a usable browser executable.
///
/// Checks, in order: the configured path, the `CHROME` env var, platform
/// install paths, then known names on `$PATH`.
pub fn detect_browser(custom_path: Option<&str>) -> DetectionResult {
    if let Some(path) = custom_path {
        let p = PathBuf::from(path);
        if p.exists() {
            return found(p);
        }
    }

    if let Ok(path) = std::env::var("CHROME") {
        let p = PathBuf::from(&path);
        if p.exists() {
            return found(p);
        }
    }

    #[cfg(target_os = "macos")]
    for path in MACOS_APP_PATHS {
        let p = PathBuf::from(path);
        if p.exists() {
            return found(p);
        }
    }

    for name in CHROMIUM_EXECUTABLES {
        if let Ok(path) = which::which(name) {
            return found(path);
        }
    }

    DetectionResult {
        found: false,
        path: None,
        install_hint: install_instructions(),
    }
}

fn found(path: PathBuf) -> DetectionResult {
    DetectionResult {
        found: true,
        path: Some(path),
        install_hint: String::new(),
    }
}

/// Platform-specific install instructions.
pub fn install_instructions() -> String {
    let instructions = if cfg!(target_os = "macos") {
        "  brew install --cask chromium\n  # Alternatives: google-chrome, brave-browser"
    } else if cfg!(target_os = "linux") {
        "  Debian/Ubuntu: sudo apt install chromium-browser\n  \
         Fedora:         sudo dnf install chromium\n  \
         Arch:           sudo pacman -S chromium"
    } else {
        "  Download from https://www.chromium.org/getting-involved/download-chromium/"
    };

    format!(
        "No Chromium-based browser found. Install one:\n\n\
         {instructions}\n\n\
         Or set the path in config:\n  \
         [browser]\n  \
         executable = \"/path/to/browser\"\n\n\
         Or set the CHROME environment variable."
    )
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_instructions_not_empty() {
        let hint = install_instructions();
        assert!(!hint.is_empty());
        assert!(hint.contains("CHROME"));
    }

    #[test]
    fn custom_path_takes_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake-browser");
        std::fs::write(&fake, "fake").unwrap();

        let result = detect_browser(fake.to_str());
        assert!(result.found);
        assert_eq!(result.path.as_ref().unwrap(), &fake);
    }

    #[test]
    fn invalid_custom_path_falls_through() {
        let result = detect_browser(Some("/nonexistent/path/to/browser"));
        // Whether something is found depends on the host; either way the
        // bogus path must not be returned.
        if let Some(path) = result.path {
            assert_ne!(path, PathBuf::from("/nonexistent/path/to/browser"));
        } else {
            assert!(!result.install_hint.is_empty());
        }
    }
}
