//! Client for the Electrum (Stratum) JSON-RPC protocol, carried over a
//! persistent TCP or TLS stream that is dialed through a SOCKS5 proxy.
//!
//! Messages are newline-framed JSON objects. Replies to distinct requests
//! may arrive in any order and are correlated by integer id; server-pushed
//! subscription updates are fanned into one process-wide notification
//! queue. See [`client::Connection`].

pub mod api;
pub mod client;
pub mod error;
mod transport;

pub use api::{
    HeaderInfo, HistoryEntry, Notification, PeerInfo, ScriptBalance, StratumApi, UnspentEntry,
};
pub use client::{Connection, ConnectOptions};
pub use transport::{Protocol, ServerAddr};

// Type alias for common result type
type Result<T> = std::result::Result<T, error::Error>;
