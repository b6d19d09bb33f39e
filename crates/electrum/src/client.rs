//! The persistent Stratum connection: newline-framed JSON-RPC with id
//! correlation, a single writer, and one shared notification queue.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};

use crate::api::{
    HeaderInfo, HistoryEntry, Notification, PeerInfo, ScriptBalance, StratumApi, UnspentEntry,
    METHOD_BROADCAST, METHOD_ESTIMATEFEE, METHOD_GET_BALANCE, METHOD_GET_HEADER,
    METHOD_GET_HISTORY, METHOD_LISTUNSPENT, METHOD_SERVER_PEERS, METHOD_SERVER_VERSION,
    METHOD_SUBSCRIBE, METHOD_TRANSACTION_GET,
};
use crate::transport::{self, BoxedReader, BoxedWriter, ServerAddr};
use crate::{error::Error, Result};

const CLIENT_NAME: &str = concat!("umbra ", env!("CARGO_PKG_VERSION"));
const PROTOCOL_VERSION: &str = "1.2";

#[derive(Clone, Copy, Debug)]
pub struct ConnectOptions {
    /// SOCKS5 proxy to dial through; `None` connects directly (tests,
    /// clearnet debugging).
    pub proxy: Option<SocketAddr>,
    pub connect_timeout: Duration,
    pub rpc_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            proxy: Some(SocketAddr::from(([127, 0, 0, 1], 9050))),
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct RpcFailure {
    code: i64,
    message: String,
}

type ReplySender = oneshot::Sender<std::result::Result<Value, RpcFailure>>;
type PendingMap = Arc<Mutex<HashMap<u64, ReplySender>>>;

pub struct Connection {
    writer: AsyncMutex<BoxedWriter>,
    pending: PendingMap,
    notifications: AsyncMutex<mpsc::UnboundedReceiver<Notification>>,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    closing: AtomicBool,
    reader_task: tokio::task::JoinHandle<()>,
    rpc_timeout: Duration,
}

impl Connection {
    /// Dials the server, spawns the read loop and performs the
    /// `server.version` handshake.
    pub async fn connect(server: &ServerAddr, options: ConnectOptions) -> Result<Arc<Self>> {
        log::info!(
            "Connecting to {}:{} ({:?})...",
            server.host,
            server.port,
            server.proto
        );
        let (reader, writer) =
            transport::dial(server, options.proxy, options.connect_timeout).await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let reader_task =
            tokio::spawn(read_loop(reader, pending.clone(), notify_tx, closed.clone()));

        let connection = Arc::new(Connection {
            writer: AsyncMutex::new(writer),
            pending,
            notifications: AsyncMutex::new(notify_rx),
            next_id: AtomicU64::new(0),
            closed,
            closing: AtomicBool::new(false),
            reader_task,
            rpc_timeout: options.rpc_timeout,
        });

        connection
            .request(
                METHOD_SERVER_VERSION,
                vec![json!(CLIENT_NAME), json!(PROTOCOL_VERSION)],
            )
            .await?;
        log::info!("Connected to server");
        Ok(connection)
    }

    /// Sends one RPC and awaits the reply carrying the same id. Replies may
    /// arrive in any order relative to other in-flight requests.
    pub async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.shutdown_error());
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, sender);

        let mut line = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        })
        .to_string();
        line.push('\n');
        log::debug!("-> {} (id {})", method, id);

        let write_result = {
            let mut writer = self.writer.lock().await;
            async {
                writer.write_all(line.as_bytes()).await?;
                writer.flush().await
            }
            .await
        };
        if let Err(err) = write_result {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(Error::Io(err));
        }

        match tokio::time::timeout(self.rpc_timeout, receiver).await {
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&id);
                Err(Error::Timeout {
                    method: method.to_string(),
                })
            }
            Ok(Err(_)) => Err(self.shutdown_error()),
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(failure))) => Err(Error::Rpc {
                code: failure.code,
                message: failure.message,
            }),
        }
    }

    /// Like [`Connection::request`]; all later pushes for the subscription
    /// land on the shared notification queue.
    pub async fn subscribe(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.request(method, params).await
    }

    /// `server.peers.subscribe` — the peers this server gossips about,
    /// filtered down to rows with a usable transport feature.
    pub async fn server_peers(&self) -> Result<Vec<PeerInfo>> {
        let result = self.request(METHOD_SERVER_PEERS, vec![]).await?;
        let rows = result.as_array().cloned().unwrap_or_default();
        Ok(rows.iter().filter_map(PeerInfo::from_row).collect())
    }

    /// Graceful shutdown: stops the read loop, wakes every in-flight caller
    /// with [`Error::Cancelled`] and ends the notification queue once its
    /// remaining items are drained.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        self.reader_task.abort();
        self.pending.lock().expect("pending lock").clear();
        log::info!("Connection closed");
    }

    fn shutdown_error(&self) -> Error {
        if self.closing.load(Ordering::SeqCst) {
            Error::Cancelled
        } else {
            Error::Disconnected
        }
    }
}

async fn read_loop(
    reader: BoxedReader,
    pending: PendingMap,
    notify_tx: mpsc::UnboundedSender<Notification>,
    closed: Arc<AtomicBool>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                dispatch_frame(&line, &pending, &notify_tx);
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!("Server stream failed: {}", err);
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Dropping the reply senders wakes every in-flight caller with
    // Disconnected; dropping notify_tx ends the notification queue.
    pending.lock().expect("pending lock").clear();
    log::info!("Server connection closed");
}

fn dispatch_frame(
    line: &str,
    pending: &Mutex<HashMap<u64, ReplySender>>,
    notify_tx: &mpsc::UnboundedSender<Notification>,
) {
    let frame: Value = match serde_json::from_str(line) {
        Ok(frame) => frame,
        Err(err) => {
            log::warn!("Discarding undecodable frame: {}", err);
            return;
        }
    };

    if let Some(id) = frame.get("id").and_then(Value::as_u64) {
        let outcome = match frame.get("error") {
            Some(error) if !error.is_null() => Err(parse_rpc_failure(error)),
            _ => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
        };
        match pending.lock().expect("pending lock").remove(&id) {
            Some(sender) => {
                let _ = sender.send(outcome);
            }
            None => log::debug!("Reply for unknown request id {}", id),
        }
        return;
    }

    if frame.get("method").and_then(Value::as_str) == Some(METHOD_SUBSCRIBE) {
        let params = frame.get("params").and_then(Value::as_array);
        let scripthash = params
            .and_then(|params| params.first())
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if scripthash.is_empty() {
            log::warn!("Subscription push without a scripthash");
            return;
        }
        let status = params
            .and_then(|params| params.get(1))
            .and_then(Value::as_str)
            .map(str::to_string);
        let _ = notify_tx.send(Notification { scripthash, status });
        return;
    }

    log::debug!("Ignoring unsolicited frame: {}", line);
}

fn parse_rpc_failure(error: &Value) -> RpcFailure {
    // Most servers use {code, message}; a few reply with a bare string.
    match error {
        Value::String(message) => RpcFailure {
            code: 0,
            message: message.clone(),
        },
        _ => RpcFailure {
            code: error.get("code").and_then(Value::as_i64).unwrap_or_default(),
            message: error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown server error")
                .to_string(),
        },
    }
}

#[async_trait]
impl StratumApi for Connection {
    async fn transaction_get(&self, txid: &str) -> Result<String> {
        let result = self.request(METHOD_TRANSACTION_GET, vec![json!(txid)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn scripthash_get_history(&self, scripthash: &str) -> Result<Vec<HistoryEntry>> {
        let result = self.request(METHOD_GET_HISTORY, vec![json!(scripthash)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn scripthash_get_balance(&self, scripthash: &str) -> Result<ScriptBalance> {
        let result = self.request(METHOD_GET_BALANCE, vec![json!(scripthash)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn scripthash_listunspent(&self, scripthash: &str) -> Result<Vec<UnspentEntry>> {
        let result = self.request(METHOD_LISTUNSPENT, vec![json!(scripthash)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn scripthash_subscribe(&self, scripthash: &str) -> Result<Option<String>> {
        let result = self.subscribe(METHOD_SUBSCRIBE, vec![json!(scripthash)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn block_get_header(&self, height: u32) -> Result<HeaderInfo> {
        let result = self.request(METHOD_GET_HEADER, vec![json!(height)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn estimate_fee(&self, target: u32) -> Result<f64> {
        let result = self.request(METHOD_ESTIMATEFEE, vec![json!(target)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn transaction_broadcast(&self, raw_tx_hex: &str) -> Result<String> {
        let result = self.request(METHOD_BROADCAST, vec![json!(raw_tx_hex)]).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn next_notification(&self) -> Result<Notification> {
        let mut queue = self.notifications.lock().await;
        queue.recv().await.ok_or_else(|| self.shutdown_error())
    }
}
