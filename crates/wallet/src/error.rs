use std::fmt::Debug;

/// Errors of the wallet engine, grouped by what the caller should do:
/// configuration mistakes are reported and not retried, network/RPC failures
/// are surfaced so the outer layer can pick another server, and the
/// user-facing conditions (insufficient funds, not replaceable) go straight
/// to the user.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Malformed payment URI: {0}")]
    InvalidUri(String),
    #[error("Fee rate of {rate} sat/vB is extraordinarily high")]
    FeeRateTooHigh { rate: u64 },
    #[error("Fee estimate unavailable from server")]
    FeeEstimateUnavailable,
    #[error("Insufficient funds: need {needed} sat, have {available} sat")]
    InsufficientFunds { needed: u64, available: u64 },
    #[error("This transaction is not replaceable")]
    NotReplaceable,
    #[error("No usable servers in the registry")]
    NoServers,
    #[error("Notification for an unknown script hash: {0}")]
    UnknownScriptHash(String),
    #[error("Could not sign transaction: {0}")]
    Signing(String),
    #[error("Server returned inconsistent data: {0}")]
    InvalidServerData(String),
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Key derivation failed: \n\t{0}")]
    Keys(#[from] umbra_keys::error::Error),
    #[error("Server RPC failed: \n\t{0}")]
    Rpc(umbra_electrum::error::Error),
    #[error("Invalid Bitcoin address: \n\t{0}")]
    BitcoinAddressParse(#[from] bitcoin::address::ParseError),
    #[error("Invalid amount: \n\t{0}")]
    AmountParse(#[from] bitcoin::amount::ParseAmountError),
    #[error("Invalid transaction encoding: \n\t{0}")]
    TxEncoding(#[from] bitcoin::consensus::encode::Error),
    #[error("Invalid hex data returned: \n\t{0}")]
    Hex(#[from] hex::FromHexError),
    #[error("IO error: \n\t{0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization failed: \n\t{0}")]
    Json(#[from] serde_json::Error),
}

// Client cancellation is a semantic kind of its own; everything else the
// client reports stays an RPC failure.
impl From<umbra_electrum::error::Error> for Error {
    fn from(err: umbra_electrum::error::Error) -> Self {
        match err {
            umbra_electrum::error::Error::Cancelled => Error::Cancelled,
            other => Error::Rpc(other),
        }
    }
}
