use clap::{Args, Parser, Subcommand, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "undertow",
    about = "Server-driven UI sessions over a compact binary protocol",
    author,
    version = concat!(env!("CARGO_PKG_VERSION"), "-", env!("UNDERTOW_BUILD_TIMESTAMP"))
)]
pub struct Cli {
    #[command(flatten)]
    pub logging: LoggingArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        global = true,
        env = "UNDERTOW_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        global = true,
        env = "UNDERTOW_LOG_FILE",
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

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host the demo counter view over WebSocket
    Serve(ServeArgs),
    /// Run a headless renderer session against a server
    Connect(ConnectArgs),
    /// Decode a hex-encoded frame and print it
    Decode(DecodeArgs),
    /// Issue an anti-forgery token for the configured secret
    Token(TokenArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    #[arg(
        long,
        value_name = "ADDR",
        env = "UNDERTOW_LISTEN",
        default_value = "127.0.0.1:4040",
        help = "Address to accept WebSocket connections on"
    )]
    pub listen: SocketAddr,

    #[arg(
        long = "metrics",
        action = clap::ArgAction::SetTrue,
        help = "Print Prometheus metrics to stdout on shutdown"
    )]
    pub print_metrics: bool,
}

#[derive(Args, Debug)]
pub struct ConnectArgs {
    #[arg(
        long,
        value_name = "URL",
        env = "UNDERTOW_URL",
        default_value = "ws://127.0.0.1:4040",
        help = "WebSocket URL of the server"
    )]
    pub url: String,

    #[arg(
        long,
        value_name = "TOKEN",
        env = "UNDERTOW_TOKEN",
        hide_env_values = true,
        help = "Anti-forgery token; issued locally from UNDERTOW_SECRET when omitted"
    )]
    pub token: Option<String>,

    #[arg(
        long = "click",
        value_name = "NODE",
        help = "Click the given node once connected (repeatable)"
    )]
    pub clicks: Vec<String>,

    #[arg(
        long = "linger-ms",
        value_name = "MS",
        default_value_t = 500,
        help = "How long to keep processing effects after the last click"
    )]
    pub linger_ms: u64,

    #[arg(
        long,
        action = clap::ArgAction::SetTrue,
        help = "Keep running until interrupted instead of exiting after the clicks"
    )]
    pub follow: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Client,
    Server,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    #[arg(value_name = "HEX", help = "Frame bytes as hex (whitespace ignored)")]
    pub hex: String,

    #[arg(
        long,
        value_enum,
        default_value_t = Direction::Server,
        help = "Which side sent the frame"
    )]
    pub from: Direction,
}

#[derive(Args, Debug)]
pub struct TokenArgs {
    #[arg(
        long,
        value_name = "SECRET",
        env = "UNDERTOW_SECRET",
        hide_env_values = true,
        help = "HMAC secret shared with the server"
    )]
    pub secret: Option<String>,
}
