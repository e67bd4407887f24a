//! Configuration for the broker.

use std::collections::HashMap;
use std::time::Duration;

use config::{Config as ConfigLoader, ConfigError, Environment, File};
use serde::Deserialize;

/// Main configuration structure for the broker.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub nodes: NodesConfig,
    #[serde(default)]
    pub ping_pong: PingPongConfig,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub benchmark: BenchmarkConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub analytics: AnalyticsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identifier of this replica, recorded against every node it accepts.
    #[serde(default = "default_backend_host")]
    pub backend_host: String,
    #[serde(default = "default_registration_timeout")]
    pub registration_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backend_host: default_backend_host(),
            registration_timeout_secs: default_registration_timeout(),
        }
    }
}

/// Admission limits and node trust settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NodesConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel_requests_per_node: usize,
    #[serde(default = "default_max_parallel_datacenter")]
    pub max_parallel_requests_per_datacenter_node: usize,
    /// Operator-run node ids that skip the health-status filter.
    #[serde(default)]
    pub self_hosted: Vec<String>,
    /// Capacity of each node's outbound frame channel.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            max_parallel_requests_per_node: default_max_parallel(),
            max_parallel_requests_per_datacenter_node: default_max_parallel_datacenter(),
            self_hosted: vec![],
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl NodesConfig {
    pub fn is_self_hosted(&self, node_id: &str) -> bool {
        self.self_hosted.iter().any(|id| id == node_id)
    }
}

/// Liveness heartbeat settings.
#[derive(Debug, Clone, Deserialize)]
pub struct PingPongConfig {
    #[serde(default = "default_ping_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_ping_timeout")]
    pub timeout_secs: u64,
    /// A node is evicted once its miss streak exceeds this value.
    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

impl Default for PingPongConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_ping_interval(),
            timeout_secs: default_ping_timeout(),
            miss_threshold: default_miss_threshold(),
            tick_millis: default_tick_millis(),
        }
    }
}

impl PingPongConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }
}

/// Synthetic inference probe settings.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthCheckConfig {
    #[serde(default = "default_health_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
    /// Prompts shorter than this (in tokens) use the small TTFT threshold.
    #[serde(default = "default_small_prompt_size")]
    pub small_prompt_size: u32,
    #[serde(default = "default_ttft_small")]
    pub min_time_to_first_token_small_sec: f64,
    #[serde(default = "default_ttft_big")]
    pub min_time_to_first_token_big_sec: f64,
    #[serde(default = "default_min_tps")]
    pub min_tokens_per_second: f64,
    #[serde(default)]
    pub model_min_tokens_per_second: HashMap<String, f64>,
    #[serde(default = "default_probe_prompt")]
    pub probe_prompt: String,
    #[serde(default = "default_probe_max_tokens")]
    pub probe_max_tokens: u32,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_health_interval(),
            timeout_secs: default_health_timeout(),
            tick_millis: default_tick_millis(),
            small_prompt_size: default_small_prompt_size(),
            min_time_to_first_token_small_sec: default_ttft_small(),
            min_time_to_first_token_big_sec: default_ttft_big(),
            min_tokens_per_second: default_min_tps(),
            model_min_tokens_per_second: HashMap::new(),
            probe_prompt: default_probe_prompt(),
            probe_max_tokens: default_probe_max_tokens(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    /// Throughput floor for a model, falling back to the global default.
    pub fn min_tokens_per_second_for(&self, model: &str) -> f64 {
        self.model_min_tokens_per_second
            .get(model)
            .copied()
            .unwrap_or(self.min_tokens_per_second)
    }
}

/// Connection precondition on recorded benchmarks.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_min_tps")]
    pub minimum_completions_tokens_per_second: f64,
    #[serde(default)]
    pub model_overrides: HashMap<String, f64>,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            minimum_completions_tokens_per_second: default_min_tps(),
            model_overrides: HashMap::new(),
        }
    }
}

impl BenchmarkConfig {
    pub fn minimum_for(&self, model: &str) -> f64 {
        self.model_overrides
            .get(model)
            .copied()
            .unwrap_or(self.minimum_completions_tokens_per_second)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConsistencyConfig {
    #[serde(default = "default_consistency_interval")]
    pub interval_secs: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_consistency_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AnalyticsConfig {
    /// Event collector endpoint; analytics are disabled when unset.
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_backend_host() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| format!("replica-{}", uuid::Uuid::new_v4()))
}
fn default_registration_timeout() -> u64 {
    10
}
fn default_max_parallel() -> usize {
    4
}
fn default_max_parallel_datacenter() -> usize {
    20
}
fn default_outbound_buffer() -> usize {
    64
}
fn default_ping_interval() -> u64 {
    5
}
fn default_ping_timeout() -> u64 {
    10
}
fn default_miss_threshold() -> u32 {
    3
}
fn default_tick_millis() -> u64 {
    1000
}
fn default_health_interval() -> u64 {
    60
}
fn default_health_timeout() -> u64 {
    30
}
fn default_small_prompt_size() -> u32 {
    1000
}
fn default_ttft_small() -> f64 {
    2.0
}
fn default_ttft_big() -> f64 {
    5.0
}
fn default_min_tps() -> f64 {
    10.0
}
fn default_probe_prompt() -> String {
    "Write a short paragraph about the history of the printing press.".to_string()
}
fn default_probe_max_tokens() -> u32 {
    64
}
fn default_batch_size() -> usize {
    100
}
fn default_queue_capacity() -> usize {
    10_000
}
fn default_consistency_interval() -> u64 {
    30
}
fn default_database_url() -> String {
    "sqlite:./data/broker.db".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration sources (in order of precedence):
    /// 1. Environment variables (BROKER__SECTION__KEY format)
    /// 2. broker.toml file (if present)
    /// 3. Built-in defaults
    pub fn load() -> Result<Self, ConfigError> {
        let config = ConfigLoader::builder()
            .add_source(File::with_name("broker").required(false))
            .add_source(
                Environment::with_prefix("BROKER")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("nodes.self_hosted")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }
}
