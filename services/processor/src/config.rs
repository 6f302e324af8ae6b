use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the geotag processor
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Kafka configuration for bucket notifications
    #[serde(default)]
    pub kafka: KafkaConfig,
    /// S3 configuration
    #[serde(default)]
    pub s3: S3Config,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Ingestion pipeline configuration
    #[serde(default)]
    pub processor: ProcessorConfig,
    /// Read API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Kafka consumer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    #[serde(default = "default_bootstrap_servers")]
    pub bootstrap_servers: String,
    /// Consumer group ID
    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,
    /// Topic the object store publishes bucket notifications to
    #[serde(default = "default_notification_topic")]
    pub notification_topic: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Auto offset reset policy
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    /// Session timeout in milliseconds
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    /// Max poll interval in milliseconds
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

/// S3 configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket that browser uploads are presigned against
    #[serde(default)]
    pub upload_bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Upload URL expiration in seconds
    #[serde(default = "default_upload_url_expiry_secs")]
    pub upload_url_expiry_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Ingestion pipeline configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessorConfig {
    /// Notifications processed at once within a batch (1 = sequential)
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Deadline for a whole batch; unfinished items are left for redelivery
    pub batch_deadline_secs: Option<u64>,
    /// Upper bound for containers that have to be buffered before parsing
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
}

/// Read API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// Serve the read API alongside the consumer
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins (empty = any)
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "geotag-processor".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_bootstrap_servers() -> String {
    "localhost:9092".to_string()
}

fn default_consumer_group() -> String {
    "geotag-processor".to_string()
}

fn default_notification_topic() -> String {
    "geotag.bucket.notifications".to_string()
}

fn default_auto_offset_reset() -> String {
    "earliest".to_string()
}

fn default_session_timeout_ms() -> u32 {
    30000
}

fn default_max_poll_interval_ms() -> u32 {
    300000
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_upload_url_expiry_secs() -> u64 {
    15 * 60
}

fn default_database_url() -> String {
    "postgres://localhost/geotag".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_concurrency() -> usize {
    1
}

fn default_max_buffered_bytes() -> usize {
    64 * 1024 * 1024 // 64MB
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/geotag").required(false))
            .add_source(config::File::with_name("/etc/geotag/processor").required(false))
            // Override with environment variables
            // GEOTAG__DATABASE__URL -> database.url
            .add_source(
                config::Environment::with_prefix("GEOTAG")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Reject settings the service cannot run with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.processor.concurrency == 0 {
            anyhow::bail!("processor.concurrency must be at least 1");
        }
        if self.api.enabled && self.s3.upload_bucket.trim().is_empty() {
            anyhow::bail!("s3.upload_bucket is required when the API is enabled");
        }
        Ok(())
    }

    /// Get upload URL expiry as Duration
    pub fn upload_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.upload_url_expiry_secs)
    }

    /// Get the batch deadline as Duration, if one is configured
    pub fn batch_deadline(&self) -> Option<Duration> {
        self.processor.batch_deadline_secs.map(Duration::from_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: default_bootstrap_servers(),
            consumer_group: default_consumer_group(),
            notification_topic: default_notification_topic(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            auto_offset_reset: default_auto_offset_reset(),
            session_timeout_ms: default_session_timeout_ms(),
            max_poll_interval_ms: default_max_poll_interval_ms(),
        }
    }
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            upload_bucket: String::new(),
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
            upload_url_expiry_secs: default_upload_url_expiry_secs(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            run_migrations: true,
        }
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            batch_deadline_secs: None,
            max_buffered_bytes: default_max_buffered_bytes(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
