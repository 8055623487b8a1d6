use clap::{Args, Parser, ValueEnum};

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Database connection URL
    #[arg(long, env = "ALUMNET_DATABASE_URL")]
    pub database_url: String,

    #[command(flatten)]
    pub pubsub: PubSubConfig,

    #[command(flatten)]
    pub coordinator: CoordinatorConfig,

    #[command(flatten)]
    pub telemetry: TelemetryConfig,
}

#[derive(Clone, Debug, Args)]
pub struct PubSubConfig {
    /// Redis URL for the pub/sub transport
    #[arg(long, env = "ALUMNET_REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    pub url: String,

    /// Prefix for all pub/sub channel names
    #[arg(long, env = "ALUMNET_CHANNEL_PREFIX", default_value = "alumnet")]
    pub channel_prefix: String,

    /// Capacity of each local fan-out channel
    #[arg(long, env = "ALUMNET_CHANNEL_CAPACITY", default_value_t = 256)]
    pub channel_capacity: usize,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            channel_prefix: "alumnet".to_string(),
            channel_capacity: 256,
        }
    }
}

#[derive(Clone, Debug, Args)]
pub struct CoordinatorConfig {
    /// Presence scope shared by all messaging participants
    #[arg(long, env = "ALUMNET_PRESENCE_SCOPE", default_value = "messaging")]
    pub presence_scope: String,

    /// Sender-side typing idle timeout: how long after the last keystroke a
    /// stop-typing signal is emitted automatically
    #[arg(long, env = "ALUMNET_TYPING_IDLE_MS", default_value_t = 2000)]
    pub typing_idle_ms: u64,

    /// Receiver-side typing expiry: how long a typing indicator survives
    /// without a refreshing signal
    #[arg(long, env = "ALUMNET_TYPING_EXPIRY_MS", default_value_t = 3000)]
    pub typing_expiry_ms: u64,

    /// Capacity of the coordinator command channel
    #[arg(long, env = "ALUMNET_COMMAND_BUFFER", default_value_t = 32)]
    pub command_buffer: usize,

    /// Capacity of the internal completion-event channel
    #[arg(long, env = "ALUMNET_EVENT_BUFFER", default_value_t = 32)]
    pub event_buffer: usize,

    /// Capacity of the observer update channel
    #[arg(long, env = "ALUMNET_UPDATE_CHANNEL_CAPACITY", default_value_t = 64)]
    pub update_channel_capacity: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            presence_scope: "messaging".to_string(),
            typing_idle_ms: 2000,
            typing_expiry_ms: 3000,
            command_buffer: 32,
            event_buffer: 32,
            update_channel_capacity: 64,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Debug, Args)]
pub struct TelemetryConfig {
    /// OTLP endpoint for traces and metrics; telemetry export is disabled
    /// when unset
    #[arg(long, env = "ALUMNET_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    /// Log output format
    #[arg(long, env = "ALUMNET_LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { otlp_endpoint: None, log_format: LogFormat::Text }
    }
}

impl Config {
    #[must_use]
    pub fn load() -> Self {
        Self::parse()
    }
}
