//! Browser executable discovery: env override, PATH lookup, OS defaults.

use std::env;
use std::path::PathBuf;

use which::which;

/// Locate a browser executable for the requested channel.
///
/// Order: `WHEELHOUSE_BROWSER` env override, PATH lookup of the channel's
/// well-known binary names, then OS-specific install locations.
pub fn detect_browser_executable(channel: Option<&str>) -> Option<PathBuf> {
    if let Ok(raw) = env::var("WHEELHOUSE_BROWSER") {
        let trimmed = raw.trim();
        if !trimmed.is_empty() {
            let candidate = PathBuf::from(trimmed);
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    for name in channel_executable_names(channel) {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    os_install_paths(channel).into_iter().find(|p| p.exists())
}

/// Whether any driveable browser is present; reported by `/health`.
pub fn browser_available() -> bool {
    detect_browser_executable(None).is_some()
}

fn channel_executable_names(channel: Option<&str>) -> &'static [&'static str] {
    match channel {
        Some("msedge") | Some("edge") => {
            #[cfg(target_os = "windows")]
            {
                &["msedge.exe"]
            }
            #[cfg(not(target_os = "windows"))]
            {
                &["microsoft-edge", "microsoft-edge-stable"]
            }
        }
        Some("chromium") => {
            #[cfg(target_os = "windows")]
            {
                &["chromium.exe"]
            }
            #[cfg(not(target_os = "windows"))]
            {
                &["chromium", "chromium-browser"]
            }
        }
        // chrome and unspecified fall through to the widest net
        _ => {
            #[cfg(target_os = "windows")]
            {
                &["chrome.exe", "chromium.exe", "msedge.exe"]
            }
            #[cfg(not(target_os = "windows"))]
            {
                &[
                    "google-chrome-stable",
                    "google-chrome",
                    "chromium",
                    "chromium-browser",
                ]
            }
        }
    }
}

fn os_install_paths(channel: Option<&str>) -> Vec<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        let _ = channel;
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
            PathBuf::from("/Applications/Microsoft Edge.app/Contents/MacOS/Microsoft Edge"),
        ]
    }

    #[cfg(target_os = "windows")]
    {
        let _ = channel;
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(root) = env::var(key) {
                let root = PathBuf::from(root.trim());
                paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                paths.push(root.join("Chromium/Application/chrome.exe"));
                paths.push(root.join("Microsoft/Edge/Application/msedge.exe"));
            }
        }
        paths
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        let _ = channel;
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
            PathBuf::from("/usr/bin/microsoft-edge"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn env_override_wins_when_it_exists() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join("my-browser");
        fs::write(&exe, b"").unwrap();

        let original = env::var("WHEELHOUSE_BROWSER").ok();
        env::set_var("WHEELHOUSE_BROWSER", &exe);
        let detected = detect_browser_executable(None);
        match original {
            Some(value) => env::set_var("WHEELHOUSE_BROWSER", value),
            None => env::remove_var("WHEELHOUSE_BROWSER"),
        }
        assert_eq!(detected, Some(exe));
    }
}
