use std::{fmt::Debug, io};

/// Errors surfaced by the Electrum client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Could not reach the server through the proxy: \n\t{0}")]
    Socks(#[from] tokio_socks::Error),
    #[error("TLS setup failed: \n\t{0}")]
    Tls(#[from] rustls::Error),
    #[error("Server hostname is not a valid TLS server name: {0}")]
    InvalidServerName(String),
    #[error("Unknown server protocol tag: {0}")]
    UnknownProtocol(String),
    #[error("IO error on the server stream: \n\t{0}")]
    Io(#[from] io::Error),
    #[error("Timed out connecting to the server")]
    ConnectTimeout,
    #[error("Request {method} timed out")]
    Timeout { method: String },
    #[error("Connection to the server was lost")]
    Disconnected,
    #[error("Call cancelled by connection shutdown")]
    Cancelled,
    #[error("Server returned RPC error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("Could not decode server response: \n\t{0}")]
    Json(#[from] serde_json::Error),
}
