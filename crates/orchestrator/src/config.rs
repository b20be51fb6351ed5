//! Environment-level configuration surface.
//!
//! Deployment owns the installation; the process only reads. Every knob has
//! a default that matches the production container, and every override comes
//! in through `SCRAPER_*` environment variables.

use std::path::PathBuf;
use std::time::Duration;

use crate::cascade::RetryPolicy;
use crate::supervisor::SupervisorConfig;
use crate::version::CompatPair;

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Browser binary locations, probed in order.
    pub browser_paths: Vec<PathBuf>,
    /// Driver locations; a directory is scanned for `chromedriver*` builds.
    pub driver_paths: Vec<PathBuf>,
    /// Driver major the caller wants tried first, ahead of the resolved
    /// default order.
    pub preferred_driver_major: Option<u32>,
    /// Known-good cross-major pairs blessed by deployment.
    pub compat_pairs: Vec<CompatPair>,
    /// Accept the newest installed driver when nothing else matches.
    pub allow_latest_fallback: bool,
    /// Concurrency ceiling; admission beyond it blocks the caller.
    pub max_sessions: usize,
    /// Wall-clock deadline over a task's whole `InUse` period.
    pub session_deadline: Duration,
    /// How long one launch attempt may take to reach a responsive session.
    pub launch_timeout: Duration,
    /// Total tries per candidate on transient launch failures.
    pub launch_attempts: u32,
    pub initial_backoff: Duration,
    /// Also keep the transcript/log audit trail for successful sessions.
    pub capture_on_success: bool,
    /// Parent of `debug_screenshots/`, `debug_logs/`, `conversations/`.
    pub artifact_root: PathBuf,
    pub probe_interval: Duration,
    pub probe_grace: Duration,
    /// First DevTools port; concurrent sessions fan out above it.
    pub port_base: u16,
    pub headless: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            browser_paths: vec![
                PathBuf::from("/usr/bin/google-chrome"),
                PathBuf::from("/usr/bin/google-chrome-stable"),
                PathBuf::from("/usr/bin/chromium"),
                PathBuf::from("/usr/bin/chromium-browser"),
            ],
            driver_paths: vec![
                PathBuf::from("/usr/local/bin/chromedriver"),
                PathBuf::from("/usr/local/bin"),
                PathBuf::from("/usr/bin/chromedriver"),
            ],
            preferred_driver_major: None,
            compat_pairs: Vec::new(),
            allow_latest_fallback: false,
            max_sessions: 2,
            session_deadline: Duration::from_secs(300),
            launch_timeout: Duration::from_secs(30),
            launch_attempts: 2,
            initial_backoff: Duration::from_millis(500),
            capture_on_success: false,
            artifact_root: PathBuf::from("."),
            probe_interval: Duration::from_secs(5),
            probe_grace: Duration::from_secs(10),
            port_base: 9222,
            headless: true,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults overridden by whatever `SCRAPER_*` variables are set.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(paths) = env_paths("SCRAPER_BROWSER_PATHS") {
            config.browser_paths = paths;
        }
        if let Some(paths) = env_paths("SCRAPER_DRIVER_PATHS") {
            config.driver_paths = paths;
        }
        if let Some(major) = env_parse::<u32>("SCRAPER_DRIVER_VERSION") {
            config.preferred_driver_major = Some(major);
        }
        if let Some(pairs) = env_var("SCRAPER_COMPAT_PAIRS") {
            config.compat_pairs = parse_compat_pairs(&pairs);
        }
        if let Some(v) = env_bool("SCRAPER_ALLOW_LATEST_DRIVER") {
            config.allow_latest_fallback = v;
        }
        if let Some(n) = env_parse::<usize>("SCRAPER_MAX_SESSIONS") {
            config.max_sessions = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("SCRAPER_SESSION_TIMEOUT_SECS") {
            config.session_deadline = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse::<u64>("SCRAPER_LAUNCH_TIMEOUT_SECS") {
            config.launch_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = env_parse::<u32>("SCRAPER_LAUNCH_ATTEMPTS") {
            config.launch_attempts = n.max(1);
        }
        if let Some(v) = env_bool("SCRAPER_CAPTURE_ON_SUCCESS") {
            config.capture_on_success = v;
        }
        if let Some(dir) = env_var("SCRAPER_ARTIFACT_DIR") {
            config.artifact_root = PathBuf::from(dir);
        }
        if let Some(port) = env_parse::<u16>("SCRAPER_DEBUG_PORT") {
            config.port_base = port;
        }
        if let Some(v) = env_bool("SCRAPER_HEADLESS") {
            config.headless = v;
        }

        config
    }

    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts_per_candidate: self.launch_attempts,
            initial_backoff: self.initial_backoff,
            ..RetryPolicy::default()
        }
    }

    pub(crate) fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            deadline: self.session_deadline,
            probe_interval: self.probe_interval,
            probe_grace: self.probe_grace,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = env_var(name)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "unparseable value ignored");
            None
        }
    }
}

fn env_bool(name: &str) -> Option<bool> {
    env_var(name).map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "t" | "yes"))
}

fn env_paths(name: &str) -> Option<Vec<PathBuf>> {
    let raw = env_var(name)?;
    let paths: Vec<PathBuf> = raw
        .split(':')
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .collect();
    (!paths.is_empty()).then_some(paths)
}

/// `"130=114,129=114"` - binary major paired with blessed driver major.
fn parse_compat_pairs(raw: &str) -> Vec<CompatPair> {
    raw.split(',')
        .filter_map(|pair| {
            let (binary, driver) = pair.trim().split_once('=')?;
            Some(CompatPair {
                binary_major: binary.trim().parse().ok()?,
                driver_major: driver.trim().parse().ok()?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.max_sessions, 2);
        assert_eq!(config.launch_attempts, 2);
        assert!(!config.allow_latest_fallback);
        assert!(!config.capture_on_success);
        assert!(config.headless);
    }

    #[test]
    fn compat_pairs_parse_and_skip_garbage() {
        let pairs = parse_compat_pairs("130=114, 129=114, bogus, 5=");
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].binary_major, 130);
        assert_eq!(pairs[0].driver_major, 114);
        assert_eq!(pairs[1].binary_major, 129);
    }

    #[test]
    fn retry_policy_mirrors_config() {
        let config = OrchestratorConfig {
            launch_attempts: 4,
            initial_backoff: Duration::from_millis(100),
            ..OrchestratorConfig::default()
        };
        let policy = config.retry_policy();
        assert_eq!(policy.attempts_per_candidate, 4);
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
    }
}
