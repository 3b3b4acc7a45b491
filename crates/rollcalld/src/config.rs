use rollcall_core::client::DEFAULT_API_URL;
use rollcall_core::{CredentialProvider, ScanTiming, StaticCredential, TokenFile};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// V4L2 device path (default: /dev/video0).
    pub camera_device: String,
    /// Requested capture width; the driver may pick a nearby size.
    pub frame_width: u32,
    /// Requested capture height.
    pub frame_height: u32,
    /// Number of warmup frames to discard at startup (auto-exposure settling).
    pub warmup_frames: usize,
    /// Base URL of the attendance service.
    pub api_url: String,
    /// Bearer token given directly; takes precedence over `token_file`.
    pub token: Option<String>,
    /// File holding the bearer token, re-read on every attempt.
    pub token_file: PathBuf,
    /// Milliseconds between scan attempts.
    pub scan_interval_ms: u64,
    /// Window in which a repeat match of the same person counts as a duplicate.
    pub cooldown_ms: u64,
    /// Pause after a confirmation so the message stays on screen.
    pub settle_delay_ms: u64,
    /// Number of recent confirmations kept for display.
    pub activity_capacity: usize,
    /// Timeout in seconds for one verification request.
    pub verify_timeout_secs: u64,
    /// Register on the system bus instead of the session bus.
    pub system_bus: bool,
    /// Start scanning as soon as the daemon is up.
    pub autostart: bool,
}

impl Config {
    /// Load configuration from `ROLLCALL_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let config_dir = lookup("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(home).join(".config")
            })
            .join("rollcall");

        let token_file = lookup("ROLLCALL_TOKEN_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| config_dir.join("token"));

        Self {
            camera_device: lookup("ROLLCALL_CAMERA_DEVICE")
                .unwrap_or_else(|| "/dev/video0".to_string()),
            frame_width: parse_or(&lookup, "ROLLCALL_FRAME_WIDTH", 640),
            frame_height: parse_or(&lookup, "ROLLCALL_FRAME_HEIGHT", 480),
            warmup_frames: parse_or(&lookup, "ROLLCALL_WARMUP_FRAMES", 4),
            api_url: lookup("ROLLCALL_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            token: lookup("ROLLCALL_TOKEN").filter(|t| !t.trim().is_empty()),
            token_file,
            scan_interval_ms: parse_or(&lookup, "ROLLCALL_SCAN_INTERVAL_MS", 1000),
            cooldown_ms: parse_or(&lookup, "ROLLCALL_COOLDOWN_MS", 15_000),
            settle_delay_ms: parse_or(&lookup, "ROLLCALL_SETTLE_DELAY_MS", 2000),
            activity_capacity: parse_or(&lookup, "ROLLCALL_ACTIVITY_CAPACITY", 5),
            verify_timeout_secs: parse_or(&lookup, "ROLLCALL_VERIFY_TIMEOUT_SECS", 10),
            system_bus: flag(&lookup, "ROLLCALL_SYSTEM_BUS", false),
            autostart: flag(&lookup, "ROLLCALL_AUTOSTART", true),
        }
    }

    pub fn timing(&self) -> ScanTiming {
        ScanTiming {
            interval: Duration::from_millis(self.scan_interval_ms),
            cooldown: Duration::from_millis(self.cooldown_ms),
        }
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    /// Inline token if configured, otherwise the token file.
    pub fn credentials(&self) -> Arc<dyn CredentialProvider> {
        match &self.token {
            Some(token) => Arc::new(StaticCredential::new(token.clone())),
            None => Arc::new(TokenFile::new(&self.token_file)),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    match lookup(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(key, value = %raw, "ignoring unparsable setting");
                default
            }
        },
        None => default,
    }
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: bool) -> bool {
    lookup(key).map(|v| v.trim() != "0").unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("HOME", "/home/kiosk")]);
        assert_eq!(config.camera_device, "/dev/video0");
        assert_eq!((config.frame_width, config.frame_height), (640, 480));
        assert_eq!(config.api_url, "http://127.0.0.1:8000");
        assert_eq!(config.token, None);
        assert_eq!(config.token_file, PathBuf::from("/home/kiosk/.config/rollcall/token"));
        assert_eq!(config.timing().interval, Duration::from_millis(1000));
        assert_eq!(config.timing().cooldown, Duration::from_millis(15_000));
        assert_eq!(config.settle_delay(), Duration::from_millis(2000));
        assert_eq!(config.activity_capacity, 5);
        assert!(!config.system_bus);
        assert!(config.autostart);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("XDG_CONFIG_HOME", "/etc/xdg"),
            ("ROLLCALL_SCAN_INTERVAL_MS", "2500"),
            ("ROLLCALL_COOLDOWN_MS", "0"),
            ("ROLLCALL_SYSTEM_BUS", "1"),
            ("ROLLCALL_AUTOSTART", "0"),
            ("ROLLCALL_TOKEN", "abc"),
        ]);
        assert_eq!(config.token_file, PathBuf::from("/etc/xdg/rollcall/token"));
        assert_eq!(config.scan_interval_ms, 2500);
        assert_eq!(config.cooldown_ms, 0);
        assert!(config.system_bus);
        assert!(!config.autostart);
        assert_eq!(config.credentials().bearer_token().as_deref(), Some("abc"));
    }

    #[test]
    fn test_unparsable_value_falls_back() {
        let config = config_from(&[("ROLLCALL_SCAN_INTERVAL_MS", "fast")]);
        assert_eq!(config.scan_interval_ms, 1000);
    }

    #[test]
    fn test_blank_token_uses_token_file() {
        let config = config_from(&[
            ("ROLLCALL_TOKEN", "  "),
            ("ROLLCALL_TOKEN_FILE", "/nonexistent/rollcall-token"),
        ]);
        assert_eq!(config.token, None);
        assert_eq!(config.credentials().bearer_token(), None);
    }
}
