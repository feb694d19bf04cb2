use anyhow::{Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// A fixed-window admission ceiling: at most `max` hits per `window`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max: u32,
    pub window: Duration,
}

impl RateLimit {
    pub const fn new(max: u32, window: Duration) -> Self {
        Self { max, window }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

/// DevRoom Service Configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP + WebSocket bind address
    pub http_bind: SocketAddr,

    /// Origin allowed to call the admission endpoints and open sockets
    pub allowed_origin: String,

    /// Take the caller key from the last `X-Forwarded-For` hop, the one
    /// appended by the reverse proxy in front of the server
    pub trust_proxy: bool,

    /// Global ceiling on live rooms
    pub max_total_rooms: usize,

    /// Roster capacity of a single room
    pub max_users_per_room: usize,

    /// Document size ceiling (characters)
    pub max_document_len: usize,

    /// Snapshots retained per room
    pub max_history: usize,

    /// Display name ceiling (characters)
    pub max_username_len: usize,

    /// Chat message ceiling (characters)
    pub max_chat_len: usize,

    /// Execution output is truncated to this many characters
    pub max_output_len: usize,

    /// Join attempts allowed per connection before it is dropped
    pub max_join_attempts: u32,

    /// REST request body ceiling (bytes)
    pub max_body_bytes: usize,

    /// WebSocket frame ceiling (bytes)
    pub max_frame_bytes: usize,

    /// Outbound event queue per connection
    pub outbound_queue: usize,

    /// Room creations per caller key
    pub room_creation_limit: RateLimit,

    /// Socket connections per caller key
    pub connection_limit: RateLimit,

    /// Document edits per connection
    pub edit_limit: RateLimit,

    /// Execution requests per connection
    pub run_limit: RateLimit,

    /// Delay before an emptied room is deleted
    pub room_grace_period: Duration,

    /// Age after which a never-joined room is swept
    pub ghost_room_max_age: Duration,

    /// Ghost room sweep period
    pub ghost_sweep_interval: Duration,

    /// Expired rate-limit window sweep period
    pub rate_limit_sweep_interval: Duration,

    /// Log level
    pub log_level: String,

    /// Log output format
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_bind: SocketAddr::from(([0, 0, 0, 0], 5000)),
            allowed_origin: "http://localhost:3000".to_string(),
            trust_proxy: false,
            max_total_rooms: 500,
            max_users_per_room: 20,
            max_document_len: 100_000,
            max_history: 20,
            max_username_len: 30,
            max_chat_len: 500,
            max_output_len: 10_000,
            max_join_attempts: 5,
            max_body_bytes: 10 * 1024,
            max_frame_bytes: 1_000_000,
            outbound_queue: 256,
            room_creation_limit: RateLimit::new(10, Duration::from_secs(60 * 60)),
            connection_limit: RateLimit::new(30, Duration::from_secs(60)),
            edit_limit: RateLimit::new(300, Duration::from_secs(60)),
            run_limit: RateLimit::new(10, Duration::from_secs(60)),
            room_grace_period: Duration::from_secs(2 * 60 * 60),
            ghost_room_max_age: Duration::from_secs(5 * 60),
            ghost_sweep_interval: Duration::from_secs(60),
            rate_limit_sweep_interval: Duration::from_secs(10 * 60),
            log_level: "info".to_string(),
            log_format: LogFormat::Json,
        }
    }
}

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "devroom-server")]
#[command(about = "DevRoom: real-time collaborative room server")]
pub struct Cli {
    /// Configuration file path (JSON or TOML)
    #[arg(short, long, env = "DEVROOM_CONFIG")]
    pub config: Option<PathBuf>,

    /// HTTP bind address
    #[arg(long, env = "DEVROOM_HTTP_BIND")]
    pub http_bind: Option<SocketAddr>,

    /// Listening port (overrides the port of the bind address)
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Allowed CORS origin
    #[arg(long, env = "ALLOWED_ORIGIN")]
    pub allowed_origin: Option<String>,

    /// Use the proxy-appended X-Forwarded-For hop as the caller address
    #[arg(long, env = "DEVROOM_TRUST_PROXY")]
    pub trust_proxy: Option<bool>,

    /// Global room ceiling
    #[arg(long, env = "DEVROOM_MAX_ROOMS")]
    pub max_total_rooms: Option<usize>,

    /// Users per room
    #[arg(long, env = "DEVROOM_MAX_USERS_PER_ROOM")]
    pub max_users_per_room: Option<usize>,

    /// Document size ceiling (characters)
    #[arg(long, env = "DEVROOM_MAX_DOCUMENT_LEN")]
    pub max_document_len: Option<usize>,

    /// Snapshots retained per room
    #[arg(long, env = "DEVROOM_MAX_HISTORY")]
    pub max_history: Option<usize>,

    /// Room creations per caller per hour
    #[arg(long, env = "DEVROOM_ROOMS_PER_HOUR")]
    pub rooms_per_hour: Option<u32>,

    /// Connections per caller per minute
    #[arg(long, env = "DEVROOM_CONNECTIONS_PER_MINUTE")]
    pub connections_per_minute: Option<u32>,

    /// Edits per connection per minute
    #[arg(long, env = "DEVROOM_EDITS_PER_MINUTE")]
    pub edits_per_minute: Option<u32>,

    /// Runs per connection per minute
    #[arg(long, env = "DEVROOM_RUNS_PER_MINUTE")]
    pub runs_per_minute: Option<u32>,

    /// Grace period before an emptied room is deleted (seconds)
    #[arg(long, env = "DEVROOM_ROOM_GRACE_SECS")]
    pub room_grace_secs: Option<u64>,

    /// Age after which a never-joined room is swept (seconds)
    #[arg(long, env = "DEVROOM_GHOST_ROOM_MAX_AGE_SECS")]
    pub ghost_room_max_age_secs: Option<u64>,

    /// Log level
    #[arg(long, env = "DEVROOM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log format
    #[arg(long, env = "DEVROOM_LOG_FORMAT", value_enum)]
    pub log_format: Option<LogFormat>,
}

impl Config {
    /// Load configuration from environment, CLI args, and optional config file
    pub fn from_env() -> Result<Self> {
        Self::from_cli(Cli::parse())
    }

    /// Build a configuration from already-parsed CLI arguments
    pub fn from_cli(cli: Cli) -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = &cli.config {
            let config_str = std::fs::read_to_string(config_path)
                .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
            config = serde_json::from_str(&config_str)
                .or_else(|_| toml::from_str(&config_str))
                .context("Failed to parse config file")?;
        }

        if let Some(http_bind) = cli.http_bind {
            config.http_bind = http_bind;
        }
        if let Some(port) = cli.port {
            config.http_bind.set_port(port);
        }
        if let Some(origin) = cli.allowed_origin {
            config.allowed_origin = origin;
        }
        if let Some(trust_proxy) = cli.trust_proxy {
            config.trust_proxy = trust_proxy;
        }
        if let Some(max) = cli.max_total_rooms {
            config.max_total_rooms = max;
        }
        if let Some(max) = cli.max_users_per_room {
            config.max_users_per_room = max;
        }
        if let Some(max) = cli.max_document_len {
            config.max_document_len = max;
        }
        if let Some(max) = cli.max_history {
            config.max_history = max;
        }
        if let Some(max) = cli.rooms_per_hour {
            config.room_creation_limit.max = max;
        }
        if let Some(max) = cli.connections_per_minute {
            config.connection_limit.max = max;
        }
        if let Some(max) = cli.edits_per_minute {
            config.edit_limit.max = max;
        }
        if let Some(max) = cli.runs_per_minute {
            config.run_limit.max = max;
        }
        if let Some(secs) = cli.room_grace_secs {
            config.room_grace_period = Duration::from_secs(secs);
        }
        if let Some(secs) = cli.ghost_room_max_age_secs {
            config.ghost_room_max_age = Duration::from_secs(secs);
        }
        if let Some(format) = cli.log_format {
            config.log_format = format;
        }

        config.log_level = cli.log_level;

        config.validate()?;

        Ok(config)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_total_rooms == 0 {
            anyhow::bail!("max_total_rooms must be greater than 0");
        }
        if self.max_users_per_room == 0 {
            anyhow::bail!("max_users_per_room must be greater than 0");
        }
        if self.max_history == 0 {
            anyhow::bail!("max_history must be greater than 0");
        }
        if self.outbound_queue == 0 {
            anyhow::bail!("outbound_queue must be greater than 0");
        }

        for (name, limit) in [
            ("room_creation_limit", self.room_creation_limit),
            ("connection_limit", self.connection_limit),
            ("edit_limit", self.edit_limit),
            ("run_limit", self.run_limit),
        ] {
            if limit.max == 0 || limit.window.is_zero() {
                anyhow::bail!("{name} needs a non-zero max and window");
            }
        }

        if self.allowed_origin == "*" {
            tracing::warn!("CORS is open to any origin - set ALLOWED_ORIGIN in production");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["devroom-server"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_total_rooms, 500);
        assert_eq!(config.max_users_per_room, 20);
        assert_eq!(config.max_history, 20);
        assert_eq!(config.edit_limit, RateLimit::new(300, Duration::from_secs(60)));
        assert_eq!(config.http_bind.port(), 5000);
        assert!(!config.trust_proxy);
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.max_total_rooms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.run_limit.window = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let config = Config::from_cli(parse(&[
            "--port",
            "7001",
            "--allowed-origin",
            "https://devroom.example",
            "--max-users-per-room",
            "4",
            "--runs-per-minute",
            "2",
            "--room-grace-secs",
            "30",
        ]))
        .unwrap();

        assert_eq!(config.http_bind.port(), 7001);
        assert_eq!(config.allowed_origin, "https://devroom.example");
        assert_eq!(config.max_users_per_room, 4);
        assert_eq!(config.run_limit.max, 2);
        assert_eq!(config.run_limit.window, Duration::from_secs(60));
        assert_eq!(config.room_grace_period, Duration::from_secs(30));
    }

    #[test]
    fn test_partial_toml_file_keeps_defaults() {
        let dir = std::env::temp_dir().join(format!("devroom-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("devroom.toml");
        std::fs::write(&path, "max_total_rooms = 12\nallowed_origin = \"https://a.example\"\n").unwrap();

        let config = Config::from_cli(parse(&["--config", path.to_str().unwrap()])).unwrap();
        assert_eq!(config.max_total_rooms, 12);
        assert_eq!(config.allowed_origin, "https://a.example");
        assert_eq!(config.max_history, 20);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
