//! The wallet object: keys, configuration, the Electrum client handle and
//! the guarded in-memory store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use bitcoin::{Address, Amount, ScriptBuf, SignedAmount, Transaction, Txid};

use umbra_common::{config::WalletConfig, Chain, KeychainKind};
use umbra_electrum::StratumApi;
use umbra_keys::{AccountKeys, LeafKey, MasterSeed};

use crate::storage::{HistoryItem, SpendableView, WalletStore};
use crate::transaction_builder::SpendDraft;
use crate::{error::Error, Result};

pub struct Wallet {
    pub(crate) chain: Chain,
    pub(crate) config: WalletConfig,
    pub(crate) keys: AccountKeys,
    pub(crate) client: Arc<dyn StratumApi>,
    pub(crate) store: Mutex<WalletStore>,
    pub(crate) pending_drafts: Mutex<HashMap<Txid, SpendDraft>>,
}

impl Wallet {
    /// Builds an empty wallet over an already-derived master seed. Use
    /// [`crate::syncer`]'s discovery to populate it and the dispatcher loop
    /// to keep it live.
    pub fn new(
        seed: &MasterSeed,
        chain: Chain,
        config: WalletConfig,
        client: Arc<dyn StratumApi>,
    ) -> Result<Self> {
        let keys = AccountKeys::from_seed(seed, chain, config.script_type, 0)?;
        Ok(Wallet {
            chain,
            config,
            keys,
            client,
            store: Mutex::new(WalletStore::new()),
            pending_drafts: Mutex::new(HashMap::new()),
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn config(&self) -> WalletConfig {
        self.config
    }

    pub(crate) fn lock_store(&self) -> MutexGuard<'_, WalletStore> {
        self.store.lock().expect("wallet store lock")
    }

    pub fn leaf(&self, keychain: KeychainKind, index: u32) -> Result<LeafKey> {
        Ok(self.keys.leaf(keychain, index)?)
    }

    pub fn scripthash(&self, keychain: KeychainKind, index: u32) -> Result<String> {
        Ok(self.leaf(keychain, index)?.electrum_scripthash())
    }

    /// The next address never seen with history on the given branch,
    /// optionally marking its index used right away (change selection).
    pub fn next_unused_address(
        &self,
        keychain: KeychainKind,
        mark_used: bool,
    ) -> Result<(u32, Address)> {
        let index = {
            let mut store = self.lock_store();
            let index = store.next_unused_index(keychain);
            if mark_used {
                store.mark_used(keychain, index);
            }
            index
        };
        Ok((index, self.leaf(keychain, index)?.address()))
    }

    /// Standard BIP32 serialization of the account public key.
    pub fn extended_pub(&self) -> String {
        self.keys.extended_pub()
    }

    /// Display form of the account public key (y/z/u/v first character).
    pub fn display_extended_pub(&self) -> String {
        self.keys.display_extended_pub()
    }

    /// (confirmed, zeroconf) totals in satoshis.
    pub fn balances(&self) -> (SignedAmount, SignedAmount) {
        let store = self.lock_store();
        (store.balance, store.zeroconf_balance)
    }

    pub fn tx_history(&self) -> Vec<HistoryItem> {
        self.lock_store().tx_history()
    }

    pub fn utxo_views(&self) -> Vec<SpendableView> {
        self.lock_store().utxos.iter().map(|utxo| utxo.view()).collect()
    }

    /// Clears the new-history flag, handing back the most recent entry if
    /// anything changed since the last call.
    pub fn take_new_history(&self) -> Option<HistoryItem> {
        let mut store = self.lock_store();
        if !store.new_history {
            return None;
        }
        store.new_history = false;
        store.tx_history().into_iter().next()
    }

    /// Maps a scripthash back to its (keychain, index). Recomputed from the
    /// keys and the used bitmap; the mapping is never cached separately.
    pub(crate) fn resolve_scripthash(
        &self,
        scripthash: &str,
    ) -> Result<Option<(KeychainKind, u32)>> {
        for keychain in [KeychainKind::External, KeychainKind::Internal] {
            let known = self.lock_store().used(keychain).len() as u32;
            for index in 0..known {
                if self.scripthash(keychain, index)? == scripthash {
                    return Ok(Some((keychain, index)));
                }
            }
        }
        Ok(None)
    }

    /// Output scripts of every change index the wallet has derived so far.
    pub(crate) fn known_change_scripts(&self) -> Result<Vec<ScriptBuf>> {
        let known = self.lock_store().used(KeychainKind::Internal).len() as u32;
        (0..known)
            .map(|index| Ok(self.leaf(KeychainKind::Internal, index)?.script_pubkey()))
            .collect()
    }

    /// Classifies a history transaction for the address at (keychain,
    /// index): a deposit carries the value paid to that address, a spend
    /// (no output pays the address) carries the value of the non-change
    /// destination output.
    pub(crate) fn classify_tx(
        &self,
        tx: &Transaction,
        keychain: KeychainKind,
        index: u32,
    ) -> Result<(bool, Amount)> {
        let own_script = self.leaf(keychain, index)?.script_pubkey();
        let mut received = None;
        for output in &tx.output {
            if output.script_pubkey == own_script {
                received = Some(output.value);
            }
        }
        if let Some(value) = received {
            return Ok((false, value));
        }

        let change_scripts = self.known_change_scripts()?;
        let value = tx
            .output
            .iter()
            .find(|output| !change_scripts.contains(&output.script_pubkey))
            .map(|output| output.value)
            .unwrap_or(Amount::ZERO);
        Ok((true, value))
    }

    /// Maps an output script back to the (keychain, index) that owns it,
    /// over every index the wallet has seen.
    pub(crate) fn owning_index(
        &self,
        script: &ScriptBuf,
    ) -> Result<Option<(KeychainKind, u32)>> {
        for keychain in [KeychainKind::External, KeychainKind::Internal] {
            let known = self.lock_store().used(keychain).len() as u32;
            for index in 0..known {
                if &self.leaf(keychain, index)?.script_pubkey() == script {
                    return Ok(Some((keychain, index)));
                }
            }
        }
        Ok(None)
    }

    /// Looks up the internal index owning a change script. The index was
    /// marked used when the spend was prepared, so it is always within the
    /// bitmap.
    pub(crate) fn change_index_for(&self, script: &ScriptBuf) -> Result<u32> {
        let known = self.lock_store().used(KeychainKind::Internal).len() as u32;
        for index in 0..known {
            if &self.leaf(KeychainKind::Internal, index)?.script_pubkey() == script {
                return Ok(index);
            }
        }
        Err(Error::Signing(format!(
            "No change index owns script {}",
            script
        )))
    }
}
