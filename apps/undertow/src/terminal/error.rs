use std::io;

use thiserror::Error;

use crate::config::ConfigError;
use crate::protocol::WireError;
use crate::server::{ServerError, TokenError};
use crate::telemetry::logging::InitError;
use crate::transport::TransportError;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("logging initialization failed: {0}")]
    Logging(#[from] InitError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("server error: {0}")]
    Server(#[from] ServerError),
    #[error("token error: {0}")]
    Token(#[from] TokenError),
    #[error("invalid hex input: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("undecodable frame: {0}")]
    Decode(#[from] WireError),
    #[error("metrics unavailable: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("session ended: {0}")]
    Session(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}
