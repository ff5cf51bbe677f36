use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::call::CallError;
use crate::config::{CallConfig, DEFAULT_ORIGIN};
use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "courtside",
    about = "Join a group video call from the command line",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[arg(
        long,
        global = true,
        env = "COURTSIDE_ORIGIN",
        default_value = DEFAULT_ORIGIN,
        help = "Application origin serving the REST API and the signaling socket"
    )]
    pub origin: String,

    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Join an active video session and stay in the call until Ctrl-C
    Join(JoinArgs),
}

#[derive(Args, Debug, Clone)]
pub struct JoinArgs {
    #[arg(long, short = 's', value_name = "ID", help = "Video session to join")]
    pub session: String,

    #[arg(
        long,
        env = "COURTSIDE_TOKEN",
        value_name = "TOKEN",
        hide_env_values = true,
        help = "Bearer token for the session join request"
    )]
    pub token: Option<String>,

    #[arg(long, help = "Join without sending video")]
    pub no_video: bool,

    #[arg(long, help = "Join without sending audio")]
    pub no_audio: bool,

    #[arg(
        long,
        env = "COURTSIDE_SIGNALING_PATH",
        value_name = "PATH",
        help = "Signaling socket path on the origin"
    )]
    pub signaling_path: Option<String>,

    #[arg(
        long,
        env = "COURTSIDE_RECONNECT_DELAY_MS",
        value_name = "MS",
        help = "Delay before reconnecting a dropped signaling socket"
    )]
    pub reconnect_delay_ms: Option<u64>,

    #[arg(
        long,
        env = "COURTSIDE_KEEPALIVE_SECS",
        value_name = "SECS",
        help = "Interval between keepalive pings on the signaling socket"
    )]
    pub keepalive_secs: Option<u64>,

    #[arg(
        long = "ice-server",
        env = "COURTSIDE_ICE_SERVERS",
        value_delimiter = ',',
        value_name = "URL",
        help = "STUN/TURN server URL (repeatable)"
    )]
    pub ice_servers: Vec<String>,
}

impl JoinArgs {
    pub fn call_config(&self, origin: &str) -> Result<CallConfig, CallError> {
        let mut config = CallConfig::new(origin)?;
        if let Some(path) = &self.signaling_path {
            config = config.with_signaling_path(path.clone());
        }
        if let Some(ms) = self.reconnect_delay_ms {
            config = config.with_reconnect_delay(Duration::from_millis(ms));
        }
        if let Some(secs) = self.keepalive_secs {
            config = config.with_keepalive_interval(Duration::from_secs(secs));
        }
        if !self.ice_servers.is_empty() {
            config = config.with_ice_servers(self.ice_servers.clone());
        }
        Ok(config)
    }
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "COURTSIDE_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "COURTSIDE_LOG_FILE",
        help = "Write structured logs to the specified file"
    )]
    pub file: Option<PathBuf>,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_flags_parse_into_call_config() {
        let cli = Cli::try_parse_from([
            "courtside",
            "--origin",
            "https://app.example.com",
            "join",
            "--session",
            "42",
            "--no-video",
            "--reconnect-delay-ms",
            "750",
            "--ice-server",
            "stun:a.example.com,stun:b.example.com",
            "--log-level",
            "debug",
        ])
        .unwrap();

        assert_eq!(cli.logging.level, LogLevel::Debug);
        let Command::Join(join) = cli.command;
        assert_eq!(join.session, "42");
        assert!(join.no_video);
        assert!(!join.no_audio);

        let config = join.call_config(&cli.origin).unwrap();
        assert_eq!(config.origin().as_str(), "https://app.example.com/");
        assert_eq!(config.reconnect_delay(), Duration::from_millis(750));
        assert_eq!(config.ice_servers().len(), 2);
    }

    #[test]
    fn session_is_required() {
        assert!(Cli::try_parse_from(["courtside", "join"]).is_err());
    }
}
