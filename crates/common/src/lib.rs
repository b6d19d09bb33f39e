//! Shared vocabulary for the umbra wallet crates: networks, chains,
//! keychains, script types, units and the session configuration.

pub mod config;
pub mod error;
pub mod utils;

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const SATOSHI: u64 = 1;
pub const BITCOIN: u64 = 100_000_000 * SATOSHI;
pub const MILLI_BITCOIN: u64 = BITCOIN / 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum BitcoinUnit {
    /// 100,000,000 sats
    BTC,
    /// 100,000 sats
    MBTC,
    /// 100 sats
    UBTC,
}

/// Reimpl of the bitcoin crate's Network enum to have an exhaustive enum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Network {
    /// Mainnet Bitcoin.
    Bitcoin,
    /// Bitcoin's testnet network.
    Testnet,
    /// Bitcoin's signet network.
    Signet,
    /// Bitcoin's regtest network.
    Regtest,
}

impl From<Network> for bitcoin::Network {
    fn from(network: Network) -> Self {
        match network {
            Network::Bitcoin => bitcoin::Network::Bitcoin,
            Network::Testnet => bitcoin::Network::Testnet,
            Network::Signet => bitcoin::Network::Signet,
            Network::Regtest => bitcoin::Network::Regtest,
        }
    }
}

impl From<Network> for bitcoin::NetworkKind {
    fn from(network: Network) -> Self {
        match network {
            Network::Bitcoin => bitcoin::NetworkKind::Main,
            _ => bitcoin::NetworkKind::Test,
        }
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let str = match self {
            Network::Bitcoin => "bitcoin",
            Network::Testnet => "testnet",
            Network::Signet => "signet",
            Network::Regtest => "regtest",
        };
        write!(f, "{}", str)
    }
}

impl FromStr for Network {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "bitcoin" => Ok(Network::Bitcoin),
            "testnet" => Ok(Network::Testnet),
            "signet" => Ok(Network::Signet),
            "regtest" => Ok(Network::Regtest),
            _ => Err(Error::InvalidNetwork(value.to_string())),
        }
    }
}

/// Immutable per-network descriptor: the network itself, the short tag used
/// on the server-list wire, and the BIP44 coin type for account derivation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Chain {
    pub network: Network,
    pub tag: &'static str,
    pub coin_type: u32,
}

pub const BITCOIN_CHAIN: Chain = Chain {
    network: Network::Bitcoin,
    tag: "btc",
    coin_type: 0,
};

pub const TESTNET_CHAIN: Chain = Chain {
    network: Network::Testnet,
    tag: "tbtc",
    coin_type: 1,
};

pub const SIGNET_CHAIN: Chain = Chain {
    network: Network::Signet,
    tag: "sbtc",
    coin_type: 1,
};

pub const REGTEST_CHAIN: Chain = Chain {
    network: Network::Regtest,
    tag: "rbtc",
    coin_type: 1,
};

impl Chain {
    pub fn from_network(network: Network) -> Self {
        match network {
            Network::Bitcoin => BITCOIN_CHAIN,
            Network::Testnet => TESTNET_CHAIN,
            Network::Signet => SIGNET_CHAIN,
            Network::Regtest => REGTEST_CHAIN,
        }
    }
}

/// The two derivation branches of an account. External receives payments,
/// Internal collects change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub enum KeychainKind {
    External,
    Internal,
}

impl KeychainKind {
    pub fn child_index(self) -> u32 {
        match self {
            KeychainKind::External => 0,
            KeychainKind::Internal => 1,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum ScriptType {
    /// P2SH-P2WPKH, BIP49 accounts.
    NestedSegwit,
    /// P2WPKH, BIP84 accounts.
    NativeSegwit,
}

impl ScriptType {
    /// The hardened purpose level of the account derivation path.
    pub fn purpose(self) -> u32 {
        match self {
            ScriptType::NestedSegwit => 49,
            ScriptType::NativeSegwit => 84,
        }
    }
}

impl TryFrom<&str> for ScriptType {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "nested_segwit" => Ok(ScriptType::NestedSegwit),
            "native_segwit" => Ok(ScriptType::NativeSegwit),
            _ => Err(Error::InvalidScriptType(value.to_string())),
        }
    }
}
