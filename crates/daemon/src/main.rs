//! Headless wallet session: one process per wallet, JSON lines on stdin and
//! stdout, log lines on stderr.
//!
//! On start the daemon connects to a random server from the cached list,
//! derives keys, discovers history and prints the full wallet state. It then
//! serves commands line by line while the subscription dispatcher keeps the
//! state live; every new history entry is pushed as a `wallet_info` line.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};

use bitcoin::{Amount, Denomination};
use umbra_common::{config::WalletConfig, utils, Chain, KeychainKind, Network, ScriptType};
use umbra_electrum::{ConnectOptions, Connection, StratumApi};
use umbra_keys::kdf;
use umbra_wallet::error::Error as WalletError;
use umbra_wallet::{PaymentUri, ServerRegistry, Wallet};

#[derive(Debug, Parser)]
#[command(name = "umbra-daemon", about = "Headless deterministic wallet session")]
struct Args {
    /// Salt string for key derivation, typically an email address.
    salt: String,
    /// Secret passphrase.
    passphrase: String,
    /// Create a Bech32 (native SegWit) wallet.
    #[arg(long)]
    bech32: bool,
    /// Mark transactions as replaceable.
    #[arg(long)]
    rbf: bool,
    /// Network to operate on.
    #[arg(long, default_value = "testnet")]
    network: Network,
    /// Cached server list file.
    #[arg(long, default_value = "servers.json")]
    servers: PathBuf,
    /// SOCKS5 proxy to reach servers through.
    #[arg(long, default_value = "127.0.0.1:9050")]
    proxy: SocketAddr,
    /// Connect directly instead of through the proxy.
    #[arg(long)]
    no_proxy: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Command {
    GetAddress,
    GetFeerate,
    GetBalance,
    GetYpub,
    Mktx {
        address: String,
        #[serde(default)]
        amount: Option<Value>,
        feerate: f64,
    },
    Broadcast {
        tx_hex: String,
        vout: u32,
    },
}

fn emit(output: Value) {
    println!("{}", output);
}

fn emit_error(message: impl ToString) {
    emit(json!({ "error": message.to_string() }));
}

fn wallet_info(wallet: &Wallet) -> Value {
    json!({
        "wallet_info": {
            "tx_history": wallet
                .tx_history()
                .iter()
                .map(|item| item.view())
                .collect::<Vec<_>>(),
            "utxos": wallet.utxo_views(),
        }
    })
}

fn parse_amount(value: &Value) -> anyhow::Result<Amount> {
    match value {
        Value::String(text) => Ok(Amount::from_str_in(text, Denomination::Bitcoin)?),
        Value::Number(number) => {
            let btc = number.as_f64().context("amount is not representable")?;
            Ok(Amount::from_btc(btc)?)
        }
        _ => anyhow::bail!("amount must be a string or a number"),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            emit_error(format!("{:#}", err));
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let chain = Chain::from_network(args.network);
    let registry = ServerRegistry::new(&args.servers);
    let server = registry
        .pick_random()
        .context("No server available; seed the server list file first")?;

    let options = ConnectOptions {
        proxy: if args.no_proxy { None } else { Some(args.proxy) },
        ..ConnectOptions::default()
    };
    let connection = Connection::connect(&server, options)
        .await
        .context("Make sure Tor is installed and running before using the daemon")?;

    // Refresh the cached server list from the peers this server gossips
    // about; a failure here never blocks the session.
    match connection.server_peers().await {
        Ok(peers) => {
            if let Err(err) = registry.refresh_from_peers(&peers) {
                log::warn!("Could not persist the refreshed server list: {}", err);
            }
        }
        Err(err) => log::warn!("Could not fetch server peers: {}", err),
    }

    let seed = {
        let salt = args.salt.clone();
        let passphrase = args.passphrase.clone();
        tokio::task::spawn_blocking(move || kdf::derive_seed(&salt, &passphrase)).await??
    };

    let script_type = if args.bech32 {
        ScriptType::NativeSegwit
    } else {
        ScriptType::NestedSegwit
    };
    let config = WalletConfig::default()
        .with_script_type(script_type)
        .with_rbf(args.rbf);
    let client: Arc<dyn StratumApi> = connection.clone();
    let wallet = Arc::new(Wallet::new(&seed, chain, config, client)?);

    wallet.discover_all().await?;
    emit(wallet_info(&wallet));
    let _ = wallet.take_new_history();

    let listener = {
        let wallet = wallet.clone();
        async move { wallet.listen_for_updates().await }
    };
    let watcher = {
        let wallet = wallet.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Some(latest) = wallet.take_new_history() {
                    emit(json!({
                        "wallet_info": {
                            "tx_history": latest.view(),
                            "utxos": wallet.utxo_views(),
                        }
                    }));
                }
            }
        }
    };

    let outcome = tokio::select! {
        result = listener => match result {
            Ok(()) | Err(WalletError::Cancelled) => Ok(ExitCode::SUCCESS),
            Err(err) => Err(err).context("Lost the server connection"),
        },
        _ = watcher => Ok(ExitCode::FAILURE),
        code = input_loop(wallet.clone(), args.rbf) => code,
    };

    // Graceful shutdown: cancel in-flight RPCs, close the socket and put
    // any selected-but-unbroadcast coins back. A cancellation surfacing
    // from the dispatcher is swallowed above, not reported as an error.
    connection.close();
    wallet.abandon_pending_drafts();
    outcome
}

async fn input_loop(wallet: Arc<Wallet>, rbf: bool) -> anyhow::Result<ExitCode> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "@end" {
            return Ok(ExitCode::SUCCESS);
        }
        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(err) => {
                emit_error(err);
                continue;
            }
        };
        if let Err(err) = dispatch(&wallet, rbf, command).await {
            emit_error(format!("{:#}", err));
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn dispatch(wallet: &Wallet, rbf: bool, command: Command) -> anyhow::Result<()> {
    match command {
        Command::GetAddress => {
            let (_, address) = wallet.next_unused_address(KeychainKind::External, false)?;
            emit(json!({ "address": address.to_string() }));
        }
        Command::GetFeerate => {
            let feerate = wallet.fee_estimate().await?;
            emit(json!({ "feerate": feerate }));
        }
        Command::GetBalance => {
            let (confirmed, zeroconf) = wallet.balances();
            let unit = wallet.config().unit;
            emit(json!({
                "balance": {
                    "confirmed": utils::format_amount(confirmed.to_sat(), unit),
                    "zeroconf": utils::format_amount(zeroconf.to_sat(), unit),
                }
            }));
        }
        Command::GetYpub => {
            emit(json!({ "ypub": wallet.display_extended_pub() }));
        }
        Command::Mktx {
            address,
            amount,
            feerate,
        } => {
            // The address field accepts either a bare address or a BIP21 URI
            // carrying its own amount.
            let (address, uri_amount) = if address.contains(':') {
                let uri = PaymentUri::parse(&address, "bitcoin")?;
                (uri.address, uri.amount)
            } else {
                (address, None)
            };
            let amount = match amount {
                Some(value) => parse_amount(&value)?,
                None => uri_amount.context("Command parameters are not correct")?,
            };
            let draft = wallet.prepare_spend(&address, amount, feerate, rbf)?;
            emit(json!({
                "tx_info": {
                    "tx_hex": draft.raw_hex(),
                    "vout": draft.change_vout,
                    "fee": format!("{:.8}", draft.fee.display_in(Denomination::Bitcoin)),
                    "vsize": draft.vsize,
                }
            }));
        }
        Command::Broadcast { tx_hex, vout } => {
            let txid = wallet.broadcast_raw(&tx_hex, vout).await?;
            emit(json!({ "txid": txid.to_string() }));
        }
    }
    Ok(())
}
