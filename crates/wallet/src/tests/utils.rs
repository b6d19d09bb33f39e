//! Shared fixtures for the wallet tests: a scripted Stratum mock and a
//! deterministic test account.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use mockall::mock;

use umbra_common::{config::WalletConfig, KeychainKind, ScriptType, TESTNET_CHAIN};
use umbra_electrum::error::Error as ElectrumError;
use umbra_electrum::{
    HeaderInfo, HistoryEntry, Notification, ScriptBalance, StratumApi, UnspentEntry,
};
use umbra_keys::{AccountKeys, MasterSeed};

use crate::wallet::Wallet;

mock! {
    pub Stratum {}

    #[async_trait]
    impl StratumApi for Stratum {
        async fn transaction_get(&self, txid: &str) -> Result<String, ElectrumError>;
        async fn scripthash_get_history(
            &self,
            scripthash: &str,
        ) -> Result<Vec<HistoryEntry>, ElectrumError>;
        async fn scripthash_get_balance(
            &self,
            scripthash: &str,
        ) -> Result<ScriptBalance, ElectrumError>;
        async fn scripthash_listunspent(
            &self,
            scripthash: &str,
        ) -> Result<Vec<UnspentEntry>, ElectrumError>;
        async fn scripthash_subscribe(
            &self,
            scripthash: &str,
        ) -> Result<Option<String>, ElectrumError>;
        async fn block_get_header(&self, height: u32) -> Result<HeaderInfo, ElectrumError>;
        async fn estimate_fee(&self, target: u32) -> Result<f64, ElectrumError>;
        async fn transaction_broadcast(&self, raw_tx_hex: &str) -> Result<String, ElectrumError>;
        async fn next_notification(&self) -> Result<Notification, ElectrumError>;
    }
}

pub fn test_seed() -> MasterSeed {
    MasterSeed {
        secret_exponent: [7u8; 32],
        chain_code: [9u8; 32],
    }
}

pub fn account_keys() -> AccountKeys {
    AccountKeys::from_seed(&test_seed(), TESTNET_CHAIN, ScriptType::NativeSegwit, 0).unwrap()
}

/// A testnet native-SegWit wallet over the scripted mock.
pub fn native_wallet(api: MockStratum) -> Wallet {
    let config = WalletConfig::default().with_script_type(ScriptType::NativeSegwit);
    Wallet::new(&test_seed(), TESTNET_CHAIN, config, Arc::new(api)).unwrap()
}

pub fn scripthash_for(keys: &AccountKeys, keychain: KeychainKind, index: u32) -> String {
    keys.leaf(keychain, index).unwrap().electrum_scripthash()
}

/// A one-input transaction paying `value` sats to `script`, plus an
/// unrelated second output so spend classification has something to skip.
pub fn tx_paying(script: &ScriptBuf, value: u64) -> Transaction {
    Transaction {
        version: Version::ONE,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(
                Txid::from_str(&hex::encode([0x11u8; 32])).unwrap(),
                0,
            ),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![
            TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script.clone(),
            },
            TxOut {
                value: Amount::from_sat(600),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
            },
        ],
    }
}

pub fn tx_hex(tx: &Transaction) -> String {
    encode::serialize_hex(tx)
}
