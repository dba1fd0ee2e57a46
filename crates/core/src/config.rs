use serde::Deserialize;
use tracing::debug;

/// Root application configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `OUTREACH__`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between due-step scans.
    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,
    /// Upper bound on steps handed to the delivery provider per cycle.
    #[serde(default = "default_max_dispatch_per_cycle")]
    pub max_dispatch_per_cycle: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Probability that the simulated provider reports a failed send.
    #[serde(default = "default_simulated_failure_rate")]
    pub simulated_failure_rate: f64,
    /// Channels the simulated provider always fails (e.g. `["sms"]`).
    #[serde(default)]
    pub failing_channels: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_log_json")]
    pub json: bool,
}

// Default functions
fn default_node_id() -> String {
    "outreach-01".to_string()
}
fn default_scan_interval_ms() -> u64 {
    1000
}
fn default_max_dispatch_per_cycle() -> usize {
    500
}
fn default_send_timeout_ms() -> u64 {
    5000
}
fn default_simulated_failure_rate() -> f64 {
    0.05
}
fn default_log_filter() -> String {
    "outreach_engine=info,outreach_sequences=info,outreach_client=info".to_string()
}
fn default_log_json() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval_ms(),
            max_dispatch_per_cycle: default_max_dispatch_per_cycle(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            send_timeout_ms: default_send_timeout_ms(),
            simulated_failure_rate: default_simulated_failure_rate(),
            failing_channels: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: default_log_json(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scheduler: SchedulerConfig::default(),
            delivery: DeliveryConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from an optional config file, then environment
    /// variables (which take precedence).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        debug!(path = ?path, "Loading configuration");
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("OUTREACH")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("delivery.failing_channels"),
            )
            .build()?;
        config.try_deserialize()
    }
}
