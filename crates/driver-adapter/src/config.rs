use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Browser window size; driver-permitted range is clamped at launch.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

impl Viewport {
    const MIN: u32 = 320;
    const MAX_WIDTH: u32 = 7680;
    const MAX_HEIGHT: u32 = 4320;

    pub fn clamped(self) -> Self {
        Self {
            width: self.width.clamp(Self::MIN, Self::MAX_WIDTH),
            height: self.height.clamp(Self::MIN, Self::MAX_HEIGHT),
        }
    }
}

/// Everything needed to launch (or attach to) a browser.
#[derive(Clone, Debug)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Persistent user-data directory. The session layer decides whether this
    /// is a profile's live directory, a throwaway clone, or a temp dir.
    pub user_data_dir: PathBuf,
    pub browser_channel: Option<String>,
    pub executable: Option<PathBuf>,
    /// Attach to an already-running browser instead of launching one.
    pub cdp_url: Option<String>,
    pub user_agent: Option<String>,
    pub viewport: Viewport,
    pub ignore_https_errors: bool,
    /// Only honored in containerized / rootless environments.
    pub no_sandbox: bool,
    pub extra_args: Vec<String>,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            user_data_dir: PathBuf::from("./.wheelhouse-profile"),
            browser_channel: None,
            executable: None,
            cdp_url: None,
            user_agent: None,
            viewport: Viewport::default(),
            ignore_https_errors: true,
            no_sandbox: in_container(),
            extra_args: Vec::new(),
        }
    }
}

impl LaunchOptions {
    pub fn persistent(user_data_dir: impl Into<PathBuf>) -> Self {
        Self {
            user_data_dir: user_data_dir.into(),
            ..Default::default()
        }
    }

    pub fn headful(mut self) -> Self {
        self.headless = false;
        self
    }

    /// Command-line arguments honoring the authenticity contract: the
    /// automation banner stays off, component extensions (password-manager
    /// UI) stay on, and the sandbox is only dropped where it cannot run.
    pub fn launch_args(&self) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "--disable-background-networking".into(),
            "--disable-background-timer-throttling".into(),
            "--disable-breakpad".into(),
            "--disable-client-side-phishing-detection".into(),
            "--disable-default-apps".into(),
            "--disable-dev-shm-usage".into(),
            "--disable-hang-monitor".into(),
            "--disable-prompt-on-repost".into(),
            "--disable-sync".into(),
            "--metrics-recording-only".into(),
            "--no-first-run".into(),
            "--no-default-browser-check".into(),
            "--password-store=basic".into(),
            "--remote-allow-origins=*".into(),
        ];
        args.push(format!(
            "--window-size={},{}",
            self.viewport.clamped().width,
            self.viewport.clamped().height
        ));
        if let Some(ua) = &self.user_agent {
            args.push(format!("--user-agent={ua}"));
        }
        if self.ignore_https_errors {
            args.push("--ignore-certificate-errors".into());
        }
        if self.no_sandbox && in_container() {
            args.push("--no-sandbox".into());
        }
        if self.headless {
            args.push("--headless=new".into());
            args.push("--hide-scrollbars".into());
            args.push("--mute-audio".into());
        }
        args.extend(self.extra_args.iter().cloned());

        debug_assert!(args.iter().all(|a| a != "--enable-automation"));
        debug_assert!(!args
            .iter()
            .any(|a| a.starts_with("--disable-component-extensions")));
        args
    }
}

/// Heuristic container detection: cgroup markers or the docker env file.
pub(crate) fn in_container() -> bool {
    if std::path::Path::new("/.dockerenv").exists() {
        return true;
    }
    std::fs::read_to_string("/proc/1/cgroup")
        .map(|c| c.contains("docker") || c.contains("kubepods") || c.contains("containerd"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn automation_banner_flag_is_never_emitted() {
        let options = LaunchOptions::default();
        let args = options.launch_args();
        assert!(!args.iter().any(|a| a.contains("enable-automation")));
        assert!(!args
            .iter()
            .any(|a| a.contains("disable-component-extensions")));
    }

    #[test]
    fn viewport_defaults_and_clamps() {
        assert_eq!(Viewport::default().width, 1920);
        let tiny = Viewport {
            width: 10,
            height: 9000,
        }
        .clamped();
        assert_eq!(tiny.width, 320);
        assert_eq!(tiny.height, 4320);
    }

    #[test]
    fn user_agent_and_https_flags_follow_options() {
        let mut options = LaunchOptions::default();
        options.user_agent = Some("wheelhouse-test/1.0".into());
        options.ignore_https_errors = true;
        let args = options.launch_args();
        assert!(args.iter().any(|a| a.contains("wheelhouse-test/1.0")));
        assert!(args.iter().any(|a| a == "--ignore-certificate-errors"));
    }
}
