//! Wire types and the typed method surface of the Electrum protocol
//! (v1.1/v1.2, scripthash family).

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Error;

pub const METHOD_TRANSACTION_GET: &str = "blockchain.transaction.get";
pub const METHOD_GET_BALANCE: &str = "blockchain.scripthash.get_balance";
pub const METHOD_LISTUNSPENT: &str = "blockchain.scripthash.listunspent";
pub const METHOD_GET_HISTORY: &str = "blockchain.scripthash.get_history";
pub const METHOD_GET_HEADER: &str = "blockchain.block.get_header";
pub const METHOD_SUBSCRIBE: &str = "blockchain.scripthash.subscribe";
pub const METHOD_ESTIMATEFEE: &str = "blockchain.estimatefee";
pub const METHOD_BROADCAST: &str = "blockchain.transaction.broadcast";
pub const METHOD_SERVER_VERSION: &str = "server.version";
pub const METHOD_SERVER_PEERS: &str = "server.peers.subscribe";

/// One confirmed or mempool transaction touching a scripthash. A height of
/// zero (or -1 for mempool txs with unconfirmed parents) means unconfirmed.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub tx_hash: String,
    pub height: i64,
    pub fee: Option<u64>,
}

impl HistoryEntry {
    pub fn confirmed_height(&self) -> u32 {
        if self.height > 0 {
            self.height as u32
        } else {
            0
        }
    }
}

/// One unspent output locked to a scripthash.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct UnspentEntry {
    pub tx_hash: String,
    pub tx_pos: u32,
    pub height: i64,
    pub value: u64,
}

/// Confirmed and mempool balance of a scripthash, in satoshis. The mempool
/// part goes negative while an unconfirmed spend is in flight.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq)]
pub struct ScriptBalance {
    pub confirmed: i64,
    pub unconfirmed: i64,
}

/// The fields of `blockchain.block.get_header` the wallet consumes.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
pub struct HeaderInfo {
    pub timestamp: u64,
}

/// A server push on a subscribed scripthash: its status hash changed.
#[derive(Clone, Debug, PartialEq)]
pub struct Notification {
    pub scripthash: String,
    pub status: Option<String>,
}

/// One peer from `server.peers.subscribe`. The wire row is
/// `[ip, hostname, [version, features...]]`, where transport features look
/// like "t50001" or "s50002".
#[derive(Clone, Debug, PartialEq)]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
    pub proto: String,
    pub version: String,
}

impl PeerInfo {
    pub fn from_row(row: &serde_json::Value) -> Option<Self> {
        let row = row.as_array()?;
        let host = row.get(1)?.as_str()?.to_string();
        let features = row.get(2)?.as_array()?;

        let mut version = String::new();
        let mut transport = None;
        for feature in features {
            let Some(feature) = feature.as_str() else {
                continue;
            };
            match feature.as_bytes().first() {
                Some(b'v') => version = feature[1..].to_string(),
                Some(b't') | Some(b's') => {
                    if transport.is_none() {
                        if let Ok(port) = feature[1..].parse::<u16>() {
                            transport = Some((feature[..1].to_string(), port));
                        }
                    }
                }
                _ => {}
            }
        }

        let (proto, port) = transport?;
        Some(PeerInfo {
            host,
            port,
            proto,
            version,
        })
    }
}

/// The typed Stratum surface the wallet engine is written against.
/// [`crate::Connection`] is the production implementation; tests substitute
/// scripted mocks.
#[async_trait]
pub trait StratumApi: Send + Sync {
    /// `blockchain.transaction.get` — raw transaction hex.
    async fn transaction_get(&self, txid: &str) -> Result<String, Error>;

    /// `blockchain.scripthash.get_history`.
    async fn scripthash_get_history(&self, scripthash: &str)
        -> Result<Vec<HistoryEntry>, Error>;

    /// `blockchain.scripthash.get_balance`.
    async fn scripthash_get_balance(&self, scripthash: &str) -> Result<ScriptBalance, Error>;

    /// `blockchain.scripthash.listunspent`.
    async fn scripthash_listunspent(&self, scripthash: &str)
        -> Result<Vec<UnspentEntry>, Error>;

    /// `blockchain.scripthash.subscribe` — returns the current status hash
    /// and registers the scripthash on the notification queue.
    async fn scripthash_subscribe(&self, scripthash: &str) -> Result<Option<String>, Error>;

    /// `blockchain.block.get_header` for a confirmed height.
    async fn block_get_header(&self, height: u32) -> Result<HeaderInfo, Error>;

    /// `blockchain.estimatefee` — whole coins per kilobyte for confirmation
    /// within `target` blocks; -1 when the server has no estimate.
    async fn estimate_fee(&self, target: u32) -> Result<f64, Error>;

    /// `blockchain.transaction.broadcast` — returns the txid on acceptance.
    async fn transaction_broadcast(&self, raw_tx_hex: &str) -> Result<String, Error>;

    /// Pulls the next subscription update off the shared queue. Returns
    /// [`Error::Disconnected`] once the server stream is gone.
    async fn next_notification(&self) -> Result<Notification, Error>;
}
