use std::{fmt, net::SocketAddr, time::Duration};

use clap::Parser;

use crate::{history::SamplingInterval, stations::DecodePolicy};

/// Read-only bike station API over a Redis snapshot cache and an InfluxDB
/// availability history.
#[derive(Parser, Clone)]
#[command(version, about)]
pub struct Config {
    /// Address the HTTP server binds to.
    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    #[arg(long, env = "REDIS_HOST", default_value = "localhost")]
    pub redis_host: String,

    #[arg(long, env = "REDIS_PORT", default_value_t = 6379)]
    pub redis_port: u16,

    /// Scheme used to reach InfluxDB (http or https).
    #[arg(long, env = "DB_PROTOCOL", default_value = "http")]
    pub db_protocol: String,

    #[arg(long, env = "DB_HOST", default_value = "localhost")]
    pub db_host: String,

    #[arg(long, env = "DB_PORT", default_value_t = 8086)]
    pub db_port: u16,

    #[arg(long, env = "DB_USER", default_value = "commute")]
    pub db_user: String,

    #[arg(long, env = "DB_PASSWORD", default_value = "commute", hide_env_values = true)]
    pub db_password: String,

    #[arg(long, env = "DB_DATABASE", default_value = "commute")]
    pub db_database: String,

    #[arg(long, env = "DB_TIMEOUT_SECS", default_value_t = 30)]
    pub db_timeout_secs: u64,

    /// Contract used when a request does not name one.
    #[arg(long, env = "DEFAULT_CONTRACT", default_value = "Paris")]
    pub default_contract: String,

    /// Search distance in meters used when a request does not give one.
    #[arg(long, env = "DEFAULT_DISTANCE", default_value_t = 5000.0)]
    pub default_distance: f64,

    /// Keep every Nth history sample.
    #[arg(long, env = "SAMPLING_INTERVAL", default_value_t = SamplingInterval::HOURLY)]
    pub sampling_interval: SamplingInterval,

    /// Handling of cached stations that fail to decode.
    #[arg(long, env = "DECODE_POLICY", value_enum, default_value_t = DecodePolicy::Lenient)]
    pub decode_policy: DecodePolicy,

    /// Emit logs as JSON lines.
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Config {
    pub fn redis_url(&self) -> String {
        format!("redis://{}:{}/", self.redis_host, self.redis_port)
    }

    pub fn influx_url(&self) -> String {
        format!("{}://{}:{}", self.db_protocol, self.db_host, self.db_port)
    }

    pub fn db_timeout(&self) -> Duration {
        Duration::from_secs(self.db_timeout_secs)
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("listen", &self.listen)
            .field("redis", &self.redis_url())
            .field("influx", &self.influx_url())
            .field("db_user", &self.db_user)
            .field("db_password", &"***")
            .field("db_database", &self.db_database)
            .field("db_timeout_secs", &self.db_timeout_secs)
            .field("default_contract", &self.default_contract)
            .field("default_distance", &self.default_distance)
            .field("sampling_interval", &self.sampling_interval)
            .field("decode_policy", &self.decode_policy)
            .field("log_json", &self.log_json)
            .finish()
    }
}
