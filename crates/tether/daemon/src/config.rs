//! Configuration for tetherd

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tether_channel::{ChannelConfig, ClientConfig, HeartbeatMode};
use tether_deployment::ApplyPolicy;
use tether_health::MonitorConfig;

/// Main agent configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Control-plane endpoint and credentials
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Channel heartbeat and queueing
    #[serde(default)]
    pub channel: ChannelSettings,

    /// Reconnect backoff
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Informer polling
    #[serde(default)]
    pub monitor: MonitorSettings,

    /// Apply engine
    #[serde(default)]
    pub apply: ApplySettings,

    /// Task status tracking
    #[serde(default)]
    pub task: TaskSettings,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Control-plane endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base HTTP(S) endpoint; the socket URL is derived from it
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Shared secret used for both the socket and REST calls
    #[serde(default)]
    pub token: String,

    /// REST request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Fetch the full desired state over REST after every connect
    #[serde(default = "default_true")]
    pub resync_on_connect: bool,

    /// Select pre-release versions when resolving desired releases
    #[serde(default)]
    pub include_prerelease: bool,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            token: String::new(),
            request_timeout_secs: default_request_timeout(),
            resync_on_connect: true,
            include_prerelease: false,
        }
    }
}

/// Channel settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Engine protocol revision
    #[serde(default = "default_engine_version")]
    pub engine_version: u8,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_pong_timeout")]
    pub pong_timeout_ms: u64,

    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Outbound queue capacity
    #[serde(default = "default_send_queue")]
    pub send_queue: usize,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            engine_version: default_engine_version(),
            ping_interval_ms: default_ping_interval(),
            pong_timeout_ms: default_pong_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
            drain_timeout_ms: default_drain_timeout(),
            send_queue: default_send_queue(),
        }
    }
}

impl ChannelSettings {
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            channel: ChannelConfig {
                send_queue: self.send_queue,
                ping_interval: Duration::from_millis(self.ping_interval_ms),
                pong_timeout: Duration::from_millis(self.pong_timeout_ms),
                drain_timeout: Duration::from_millis(self.drain_timeout_ms),
                heartbeat: HeartbeatMode::for_engine(self.engine_version),
            },
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            engine_version: self.engine_version,
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_first_delay")]
    pub first_delay_ms: u64,

    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    /// Apply equal jitter
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            first_delay_ms: default_first_delay(),
            max_delay_ms: default_max_delay(),
            factor: default_factor(),
            jitter: true,
        }
    }
}

/// Informer polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Status push debounce window
    #[serde(default = "default_debounce_window")]
    pub debounce_window_ms: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            debounce_window_ms: default_debounce_window(),
        }
    }
}

impl MonitorSettings {
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            debounce_window: Duration::from_millis(self.debounce_window_ms),
        }
    }
}

/// Apply engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplySettings {
    /// Stop a generation at its first non-tolerated failure
    #[serde(default = "default_true")]
    pub abort_on_failure: bool,

    /// Cluster tool binary
    #[serde(default = "default_kubectl")]
    pub kubectl: String,

    /// Timeout of one tool invocation in seconds
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_secs: u64,
}

impl Default for ApplySettings {
    fn default() -> Self {
        Self {
            abort_on_failure: true,
            kubectl: default_kubectl(),
            tool_timeout_secs: default_tool_timeout(),
        }
    }
}

impl ApplySettings {
    pub fn policy(&self) -> ApplyPolicy {
        ApplyPolicy {
            abort_on_failure: self.abort_on_failure,
        }
    }
}

/// Task status tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSettings {
    /// Liveness touch interval
    #[serde(default = "default_task_tick")]
    pub tick_ms: u64,
}

impl Default for TaskSettings {
    fn default() -> Self {
        Self {
            tick_ms: default_task_tick(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_endpoint() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_engine_version() -> u8 {
    tether_channel::DEFAULT_ENGINE_VERSION
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_pong_timeout() -> u64 {
    20_000
}

fn default_handshake_timeout() -> u64 {
    10_000
}

fn default_drain_timeout() -> u64 {
    2_000
}

fn default_send_queue() -> usize {
    64
}

fn default_first_delay() -> u64 {
    1_000
}

fn default_max_delay() -> u64 {
    60_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_poll_interval() -> u64 {
    5_000
}

fn default_debounce_window() -> u64 {
    2_000
}

fn default_kubectl() -> String {
    "kubectl".to_string()
}

fn default_tool_timeout() -> u64 {
    300
}

fn default_task_tick() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Load configuration from defaults, an optional file and the environment.
    ///
    /// Environment keys take the form `TETHER_<SECTION>__<FIELD>`, for
    /// example `TETHER_UPSTREAM__TOKEN`.
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&AgentConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("TETHER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Validate settings that have no usable default.
    pub fn validate(&self) -> Result<(), String> {
        if self.upstream.token.is_empty() {
            return Err("upstream.token is required".to_string());
        }
        if self.reconnect.factor < 1.0 {
            return Err(format!(
                "reconnect.factor must be >= 1.0, got {}",
                self.reconnect.factor
            ));
        }
        if self.monitor.poll_interval_ms == 0 {
            return Err("monitor.poll_interval_ms must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = AgentConfig::default();
        assert_eq!(config.upstream.endpoint, "http://localhost:8080");
        assert!(config.upstream.resync_on_connect);
        assert_eq!(config.channel.engine_version, 3);
        assert!(config.apply.abort_on_failure);
        assert_eq!(config.task.tick_ms, 1_000);
    }

    #[test]
    fn test_client_config_translation() {
        let settings = ChannelSettings {
            ping_interval_ms: 1_500,
            ..ChannelSettings::default()
        };
        let client = settings.client_config();
        assert_eq!(client.channel.ping_interval, Duration::from_millis(1_500));
        assert_eq!(client.handshake_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[upstream]
endpoint = "https://control.example.com"
token = "s3cret"

[monitor]
poll_interval_ms = 750
"#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AgentConfig::load(Some(&path)).unwrap();

        assert_eq!(config.upstream.endpoint, "https://control.example.com");
        assert_eq!(config.upstream.token, "s3cret");
        assert_eq!(config.monitor.poll_interval_ms, 750);
        assert_eq!(config.monitor.debounce_window_ms, 2_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_token() {
        let config = AgentConfig::default();
        assert!(config.validate().unwrap_err().contains("token"));
    }
}
