use serde::{Deserialize, Serialize};

use crate::{BitcoinUnit, ScriptType};

/// Fiat currency used by the display layer. The core never converts; this is
/// carried so the enclosing shell can render fiat amounts consistently.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum FiatCurrency {
    USD,
    EUR,
    GBP,
    AUD,
    CAD,
    JPY,
    CNY,
}

/// Exchange-rate provider used by the display layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum PriceApi {
    BitcoinAverage,
    CryptoCompare,
}

/// Per-session wallet options, fixed at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Mark new transactions as replaceable (opt-in RBF).
    pub rbf: bool,
    /// Address encoding for the whole session: nested (BIP49) or native
    /// (BIP84) SegWit. All derived addresses are homogeneous.
    pub script_type: ScriptType,
    pub unit: BitcoinUnit,
    pub currency: FiatCurrency,
    pub price_api: PriceApi,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            rbf: false,
            script_type: ScriptType::NestedSegwit,
            unit: BitcoinUnit::BTC,
            currency: FiatCurrency::USD,
            price_api: PriceApi::BitcoinAverage,
        }
    }
}

impl WalletConfig {
    pub fn with_script_type(self, script_type: ScriptType) -> Self {
        WalletConfig { script_type, ..self }
    }

    pub fn with_rbf(self, rbf: bool) -> Self {
        WalletConfig { rbf, ..self }
    }
}
