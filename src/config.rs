// ABOUTME: Configuration surface for the proxy with tolerant loading
// ABOUTME: Unknown keys are ignored, invalid values fall back to defaults with a logged warning

use crate::frame::FrameClass;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Operator override for the mode engine's starting behaviour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ModeOverride {
    /// Start ONLINE and let transitions run their course.
    #[default]
    Auto,
    Online,
    Offline,
    Hybrid,
}

impl ModeOverride {
    fn parse(text: &str) -> Option<ModeOverride> {
        match text {
            "auto" => Some(ModeOverride::Auto),
            "online" => Some(ModeOverride::Online),
            "offline" => Some(ModeOverride::Offline),
            "hybrid" => Some(ModeOverride::Hybrid),
            _ => None,
        }
    }
}

/// Every knob the proxy exposes, with the defaults from the protocol
/// captures. A missing config file means pure defaults.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address the BOX-facing listener binds.
    pub listen_host: String,
    pub listen_port: u16,

    /// Vendor cloud endpoint, same cleartext wire protocol.
    pub cloud_host: String,
    pub cloud_port: u16,
    pub cloud_connect_timeout: Duration,
    /// Generous default; some table payloads are slow to acknowledge.
    pub cloud_ack_timeout: Duration,
    /// Optional per-class ACK deadline overrides.
    pub ack_timeout_poll: Option<Duration>,
    pub ack_timeout_table: Option<Duration>,

    /// Fast fallback deadlines in ONLINE mode. The BOX never waits longer
    /// than this for the cloud before the synthesiser answers.
    pub online_fallback_poll: Duration,
    pub online_fallback_table: Duration,
    /// Consecutive fast fallbacks before ONLINE trips to OFFLINE.
    pub fallback_trip: u32,

    pub queue_max: usize,
    pub queue_retry_ceiling: u32,
    pub queue_path: PathBuf,

    /// Out-of-band reachability probe. Off by default: stealth setups must
    /// not emit any non-BOX traffic towards the cloud.
    pub health_probe_enabled: bool,
    pub health_probe_interval: Duration,
    pub health_probe_timeout: Duration,
    pub health_probe_up_threshold: u32,
    pub health_probe_down_threshold: u32,

    pub hybrid_retry_interval: Duration,
    pub mode_override: ModeOverride,

    pub control_deadline: Duration,
    pub control_retry_max: u32,
    /// Whether a busy pending slot queues new requests (true) or rejects
    /// them (false).
    pub control_backlog: bool,

    /// Observation channel depth before events drop.
    pub publish_depth: usize,

    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            listen_host: "0.0.0.0".to_string(),
            listen_port: 5710,
            cloud_host: "127.0.0.1".to_string(),
            cloud_port: 5710,
            cloud_connect_timeout: Duration::from_secs(5),
            cloud_ack_timeout: Duration::from_secs(1800),
            ack_timeout_poll: None,
            ack_timeout_table: None,
            online_fallback_poll: Duration::from_millis(300),
            online_fallback_table: Duration::from_millis(800),
            fallback_trip: 3,
            queue_max: 10_000,
            queue_retry_ceiling: 10,
            queue_path: PathBuf::from("boxgate-queue.jsonl"),
            health_probe_enabled: false,
            health_probe_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(2),
            health_probe_up_threshold: 2,
            health_probe_down_threshold: 3,
            hybrid_retry_interval: Duration::from_secs(60),
            mode_override: ModeOverride::Auto,
            control_deadline: Duration::from_secs(30),
            control_retry_max: 3,
            control_backlog: false,
            publish_depth: 256,
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl Config {
    /// Load a JSON config file. A missing file yields defaults; a file
    /// that is not JSON at all is an error (programmer/operator mistake);
    /// individual bad values fall back per key with a warning.
    pub fn load(path: &Path) -> crate::Result<Config> {
        if !path.exists() {
            warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)?;
        let value: Value = serde_json::from_str(&text)?;
        Ok(Config::from_value(&value))
    }

    /// Build a config from a parsed JSON object, key by key. Unknown keys
    /// are ignored; values of the wrong type or out of range fall back to
    /// the default with a logged warning.
    pub fn from_value(value: &Value) -> Config {
        let mut cfg = Config::default();
        let Some(obj) = value.as_object() else {
            warn!("config root is not an object, using defaults");
            return cfg;
        };

        get_string(obj, "listen_host", &mut cfg.listen_host);
        get_port(obj, "listen_port", &mut cfg.listen_port);
        get_string(obj, "cloud_host", &mut cfg.cloud_host);
        get_port(obj, "cloud_port", &mut cfg.cloud_port);
        get_secs(obj, "cloud_connect_timeout", &mut cfg.cloud_connect_timeout);
        get_secs(obj, "cloud_ack_timeout", &mut cfg.cloud_ack_timeout);
        get_opt_secs(obj, "cloud_ack_timeout_poll", &mut cfg.ack_timeout_poll);
        get_opt_secs(obj, "cloud_ack_timeout_table", &mut cfg.ack_timeout_table);
        get_millis(obj, "online_fallback_poll_ms", &mut cfg.online_fallback_poll);
        get_millis(obj, "online_fallback_table_ms", &mut cfg.online_fallback_table);
        get_u32(obj, "fallback_trip", &mut cfg.fallback_trip);
        get_usize(obj, "queue_max", &mut cfg.queue_max);
        get_u32(obj, "queue_retry_ceiling", &mut cfg.queue_retry_ceiling);
        get_path(obj, "queue_path", &mut cfg.queue_path);
        get_bool(obj, "health_probe_enabled", &mut cfg.health_probe_enabled);
        get_secs(obj, "health_probe_interval", &mut cfg.health_probe_interval);
        get_secs(obj, "health_probe_timeout", &mut cfg.health_probe_timeout);
        get_u32(obj, "health_probe_up_threshold", &mut cfg.health_probe_up_threshold);
        get_u32(obj, "health_probe_down_threshold", &mut cfg.health_probe_down_threshold);
        get_secs(obj, "hybrid_retry_interval", &mut cfg.hybrid_retry_interval);
        get_secs(obj, "control_deadline", &mut cfg.control_deadline);
        get_u32(obj, "control_retry_max", &mut cfg.control_retry_max);
        get_bool(obj, "control_backlog", &mut cfg.control_backlog);
        get_usize(obj, "publish_depth", &mut cfg.publish_depth);
        get_secs(obj, "shutdown_grace", &mut cfg.shutdown_grace);

        if let Some(v) = obj.get("mode_override") {
            match v.as_str().and_then(ModeOverride::parse) {
                Some(mode) => cfg.mode_override = mode,
                None => warn!(value = %v, "invalid mode_override, using auto"),
            }
        }

        cfg
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen_host, self.listen_port)
    }

    pub fn cloud_addr(&self) -> String {
        format!("{}:{}", self.cloud_host, self.cloud_port)
    }

    /// Replay/forward ACK deadline for a frame class, honouring per-class
    /// overrides and falling back to the generous default.
    pub fn ack_deadline(&self, class: &FrameClass) -> Duration {
        match class {
            FrameClass::Poll(_) => self.ack_timeout_poll.unwrap_or(self.cloud_ack_timeout),
            _ => self.ack_timeout_table.unwrap_or(self.cloud_ack_timeout),
        }
    }

    /// Fast fallback deadline in ONLINE mode for a frame class.
    pub fn fallback_deadline(&self, class: &FrameClass) -> Duration {
        match class {
            FrameClass::Poll(_) => self.online_fallback_poll,
            _ => self.online_fallback_table,
        }
    }
}

fn get_string(obj: &serde_json::Map<String, Value>, key: &str, out: &mut String) {
    if let Some(v) = obj.get(key) {
        match v.as_str() {
            Some(s) if !s.is_empty() => *out = s.to_string(),
            _ => warn!(key, value = %v, "invalid string value, using default"),
        }
    }
}

fn get_path(obj: &serde_json::Map<String, Value>, key: &str, out: &mut PathBuf) {
    if let Some(v) = obj.get(key) {
        match v.as_str() {
            Some(s) if !s.is_empty() => *out = PathBuf::from(s),
            _ => warn!(key, value = %v, "invalid path value, using default"),
        }
    }
}

fn get_port(obj: &serde_json::Map<String, Value>, key: &str, out: &mut u16) {
    if let Some(v) = obj.get(key) {
        match v.as_u64().and_then(|n| u16::try_from(n).ok()) {
            Some(port) if port != 0 => *out = port,
            _ => warn!(key, value = %v, "invalid port value, using default"),
        }
    }
}

fn get_u32(obj: &serde_json::Map<String, Value>, key: &str, out: &mut u32) {
    if let Some(v) = obj.get(key) {
        match v.as_u64().and_then(|n| u32::try_from(n).ok()) {
            Some(n) => *out = n,
            None => warn!(key, value = %v, "invalid integer value, using default"),
        }
    }
}

fn get_usize(obj: &serde_json::Map<String, Value>, key: &str, out: &mut usize) {
    if let Some(v) = obj.get(key) {
        match v.as_u64().and_then(|n| usize::try_from(n).ok()) {
            Some(n) if n > 0 => *out = n,
            _ => warn!(key, value = %v, "invalid size value, using default"),
        }
    }
}

fn get_bool(obj: &serde_json::Map<String, Value>, key: &str, out: &mut bool) {
    if let Some(v) = obj.get(key) {
        match v.as_bool() {
            Some(b) => *out = b,
            None => warn!(key, value = %v, "invalid boolean value, using default"),
        }
    }
}

fn get_secs(obj: &serde_json::Map<String, Value>, key: &str, out: &mut Duration) {
    if let Some(v) = obj.get(key) {
        match v.as_u64() {
            Some(n) => *out = Duration::from_secs(n),
            None => warn!(key, value = %v, "invalid seconds value, using default"),
        }
    }
}

fn get_opt_secs(obj: &serde_json::Map<String, Value>, key: &str, out: &mut Option<Duration>) {
    if let Some(v) = obj.get(key) {
        match v.as_u64() {
            Some(n) => *out = Some(Duration::from_secs(n)),
            None => warn!(key, value = %v, "invalid seconds value, ignoring override"),
        }
    }
}

fn get_millis(obj: &serde_json::Map<String, Value>, key: &str, out: &mut Duration) {
    if let Some(v) = obj.get(key) {
        match v.as_u64() {
            Some(n) => *out = Duration::from_millis(n),
            None => warn!(key, value = %v, "invalid milliseconds value, using default"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PollKind;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_port, 5710);
        assert_eq!(cfg.cloud_port, 5710);
        assert_eq!(cfg.cloud_connect_timeout, Duration::from_secs(5));
        assert_eq!(cfg.cloud_ack_timeout, Duration::from_secs(1800));
        assert_eq!(cfg.queue_max, 10_000);
        assert_eq!(cfg.queue_retry_ceiling, 10);
        assert!(!cfg.health_probe_enabled);
        assert_eq!(cfg.health_probe_interval, Duration::from_secs(30));
        assert_eq!(cfg.hybrid_retry_interval, Duration::from_secs(60));
        assert_eq!(cfg.mode_override, ModeOverride::Auto);
    }

    #[test]
    fn test_from_value_overrides() {
        let cfg = Config::from_value(&json!({
            "listen_port": 6710,
            "cloud_host": "cloud.vendor.example",
            "queue_max": 3,
            "mode_override": "hybrid",
            "health_probe_enabled": true,
        }));
        assert_eq!(cfg.listen_port, 6710);
        assert_eq!(cfg.cloud_host, "cloud.vendor.example");
        assert_eq!(cfg.queue_max, 3);
        assert_eq!(cfg.mode_override, ModeOverride::Hybrid);
        assert!(cfg.health_probe_enabled);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let cfg = Config::from_value(&json!({
            "listen_port": "not a number",
            "queue_max": 0,
            "mode_override": "sideways",
            "health_probe_enabled": "yes",
        }));
        assert_eq!(cfg.listen_port, 5710);
        assert_eq!(cfg.queue_max, 10_000);
        assert_eq!(cfg.mode_override, ModeOverride::Auto);
        assert!(!cfg.health_probe_enabled);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let cfg = Config::from_value(&json!({
            "some_future_knob": 42,
            "listen_port": 6711,
        }));
        assert_eq!(cfg.listen_port, 6711);
    }

    #[test]
    fn test_ack_deadline_per_class() {
        let mut cfg = Config::default();
        assert_eq!(
            cfg.ack_deadline(&FrameClass::Poll(PollKind::NewSet)),
            Duration::from_secs(1800)
        );
        cfg.ack_timeout_poll = Some(Duration::from_secs(10));
        assert_eq!(
            cfg.ack_deadline(&FrameClass::Poll(PollKind::NewSet)),
            Duration::from_secs(10)
        );
        assert_eq!(cfg.ack_deadline(&FrameClass::TableData), Duration::from_secs(1800));
    }
}
