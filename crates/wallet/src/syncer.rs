//! Keeping the store consistent with chain state: the initial gap-limit
//! discovery scan and the long-lived subscription dispatcher.
//!
//! Both producers fetch everything they need from the server first and then
//! apply the result to the store in one critical section, so the
//! sum-over-buckets invariant holds whenever the lock is free.

use bitcoin::consensus::encode;
use bitcoin::{OutPoint, SignedAmount, Transaction};
use futures::future;

use umbra_common::{utils, KeychainKind};
use umbra_electrum::StratumApi as _;
use umbra_electrum::{HistoryEntry, Notification, ScriptBalance};

use crate::storage::{HistoryItem, Spendable};
use crate::wallet::Wallet;
use crate::{error::Error, Result};

/// Per-branch lookahead window of consecutive unused indices that signals
/// the end of discovery (BIP44).
pub const GAP_LIMIT: u32 = 20;

/// Everything the server reports about one address index, fetched before
/// the store is touched.
struct IndexSnapshot {
    items: Vec<HistoryItem>,
    balance: ScriptBalance,
    unspents: Vec<Spendable>,
}

enum UsedUpdate {
    /// Initial discovery appends to the bitmap in index order.
    Append,
    /// The dispatcher flips an existing index in place.
    Mark,
}

impl Wallet {
    /// Walks both branches with the gap-limit window and leaves every probed
    /// scripthash subscribed, so the dispatcher hears about later changes.
    pub async fn discover_all(&self) -> Result<()> {
        log::info!("Begin discovering tx history...");
        for keychain in [KeychainKind::External, KeychainKind::Internal] {
            self.discover_keychain(keychain).await?;
        }
        self.lock_store().new_history = true;
        Ok(())
    }

    async fn discover_keychain(&self, keychain: KeychainKind) -> Result<()> {
        log::info!("Discovering transaction history. keychain={:?}", keychain);
        let mut index = 0u32;
        loop {
            let window = (index..index + GAP_LIMIT)
                .map(|i| Ok((i, self.scripthash(keychain, i)?)))
                .collect::<Result<Vec<(u32, String)>>>()?;

            let statuses = future::try_join_all(
                window
                    .iter()
                    .map(|(_, scripthash)| self.client.scripthash_subscribe(scripthash)),
            )
            .await?;

            let mut window_empty = true;
            for ((i, scripthash), status) in window.iter().zip(statuses) {
                if status.is_none() {
                    self.lock_store().used_mut(keychain).push(false);
                    continue;
                }
                window_empty = false;
                let snapshot = self.fetch_index(keychain, *i, scripthash).await?;
                self.apply_snapshot(keychain, *i, snapshot, UsedUpdate::Append);
            }

            if window_empty {
                break;
            }
            index += GAP_LIMIT;
        }
        Ok(())
    }

    /// Long-lived dispatcher: consumes the shared notification queue and
    /// reconciles each changed scripthash into the store. Returns when the
    /// connection is gone.
    pub async fn listen_for_updates(&self) -> Result<()> {
        log::debug!("Listening for updates involving any known address...");
        loop {
            let notification = self.client.next_notification().await?;
            log::debug!(
                "Dispatched a new history for scripthash {}",
                notification.scripthash
            );
            match self.handle_notification(&notification).await {
                Ok(()) => {}
                Err(Error::UnknownScriptHash(scripthash)) => {
                    // Receiving to an address we never derived would mean the
                    // subscription map and the key tree disagree.
                    log::error!("Notification for unknown script hash {}", scripthash);
                }
                Err(err) => log::warn!("Failed to process a notification: {}", err),
            }
        }
    }

    pub(crate) async fn handle_notification(&self, notification: &Notification) -> Result<()> {
        let Some((keychain, index)) = self.resolve_scripthash(&notification.scripthash)? else {
            return Err(Error::UnknownScriptHash(notification.scripthash.clone()));
        };

        let snapshot = self
            .fetch_index(keychain, index, &notification.scripthash)
            .await?;
        self.apply_snapshot(keychain, index, snapshot, UsedUpdate::Mark);
        self.lock_store().new_history = true;
        Ok(())
    }

    async fn fetch_index(
        &self,
        keychain: KeychainKind,
        index: u32,
        scripthash: &str,
    ) -> Result<IndexSnapshot> {
        let entries = self.client.scripthash_get_history(scripthash).await?;
        let mut items = Vec::with_capacity(entries.len());
        for entry in &entries {
            items.push(self.fetch_history_item(keychain, index, entry).await?);
        }
        let balance = self.client.scripthash_get_balance(scripthash).await?;
        let unspents = self.fetch_spendables(scripthash).await?;
        Ok(IndexSnapshot {
            items,
            balance,
            unspents,
        })
    }

    /// Fetches and classifies one history transaction. Confirmed items take
    /// their timestamp from the block header, unconfirmed ones from the
    /// local clock.
    pub(crate) async fn fetch_history_item(
        &self,
        keychain: KeychainKind,
        index: u32,
        entry: &HistoryEntry,
    ) -> Result<HistoryItem> {
        let raw = self.client.transaction_get(&entry.tx_hash).await?;
        let tx: Transaction = encode::deserialize(&hex::decode(raw)?)?;
        let txid = tx.compute_txid();
        let (is_spend, value) = self.classify_tx(&tx, keychain, index)?;

        let height = entry.confirmed_height();
        let timestamp = if height > 0 {
            self.client.block_get_header(height).await?.timestamp
        } else {
            utils::now().as_secs()
        };

        log::debug!(
            "Processed history item {} (spend={}, height={})",
            txid,
            is_spend,
            height
        );
        Ok(HistoryItem {
            txid,
            tx,
            is_spend,
            value,
            height,
            timestamp,
            spendables: Vec::new(),
        })
    }

    /// Materializes the unspent outputs of a scripthash by fetching the
    /// parent transactions the server references.
    pub(crate) async fn fetch_spendables(&self, scripthash: &str) -> Result<Vec<Spendable>> {
        let unspents = self.client.scripthash_listunspent(scripthash).await?;
        let mut spendables = Vec::with_capacity(unspents.len());
        for unspent in unspents {
            let raw = self.client.transaction_get(&unspent.tx_hash).await?;
            let parent: Transaction = encode::deserialize(&hex::decode(raw)?)?;
            let output = parent
                .output
                .get(unspent.tx_pos as usize)
                .ok_or_else(|| {
                    Error::InvalidServerData(format!(
                        "unspent {}:{} is out of range",
                        unspent.tx_hash, unspent.tx_pos
                    ))
                })?;
            spendables.push(Spendable {
                outpoint: OutPoint::new(parent.compute_txid(), unspent.tx_pos),
                value: output.value,
                script_pubkey: output.script_pubkey.clone(),
            });
        }
        Ok(spendables)
    }

    fn apply_snapshot(
        &self,
        keychain: KeychainKind,
        index: u32,
        snapshot: IndexSnapshot,
        used: UsedUpdate,
    ) {
        let mut store = self.lock_store();
        for item in snapshot.items {
            store.upsert_history(keychain, index, item);
        }
        store.set_bucket_balance(
            keychain,
            index,
            SignedAmount::from_sat(snapshot.balance.confirmed),
            SignedAmount::from_sat(snapshot.balance.unconfirmed),
        );
        for spendable in snapshot.unspents {
            store.add_utxo(spendable);
        }
        match used {
            UsedUpdate::Append => store.used_mut(keychain).push(true),
            UsedUpdate::Mark => store.mark_used(keychain, index),
        }
        store.recompute_totals();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bitcoin::Amount;
    use umbra_electrum::error::Error as ElectrumError;
    use umbra_electrum::HeaderInfo;

    use crate::tests::utils::{
        account_keys, native_wallet, scripthash_for, tx_hex, tx_paying, MockStratum,
    };

    use super::*;

    #[tokio::test]
    async fn gap_limit_discovery_stops_after_an_empty_window() {
        let keys = account_keys();
        let active: HashSet<String> = [0u32, 3, 19]
            .into_iter()
            .map(|i| scripthash_for(&keys, KeychainKind::External, i))
            .collect();

        let mut api = MockStratum::new();
        let matcher = active.clone();
        api.expect_scripthash_subscribe().returning(move |scripthash| {
            if matcher.contains(scripthash) {
                Ok(Some("aa".repeat(32)))
            } else {
                Ok(None)
            }
        });
        api.expect_scripthash_get_history().returning(|_| Ok(vec![]));
        api.expect_scripthash_get_balance().returning(|_| {
            Ok(ScriptBalance {
                confirmed: 1_000,
                unconfirmed: 0,
            })
        });
        api.expect_scripthash_listunspent().returning(|_| Ok(vec![]));

        let wallet = native_wallet(api);
        wallet.discover_all().await.unwrap();

        let store = wallet.lock_store();
        let external = store.used(KeychainKind::External);
        assert_eq!(external.len(), 40);
        let used_indices: Vec<usize> = external
            .iter()
            .enumerate()
            .filter_map(|(i, used)| used.then_some(i))
            .collect();
        assert_eq!(used_indices, vec![0, 3, 19]);

        // The change branch was cold: exactly one empty window probed.
        assert_eq!(store.used(KeychainKind::Internal).len(), 20);
        assert!(store.used(KeychainKind::Internal).iter().all(|used| !used));

        assert_eq!(store.balance, SignedAmount::from_sat(3_000));
        assert!(store.new_history);
    }

    #[tokio::test]
    async fn dispatcher_reconciles_a_deposit() {
        let keys = account_keys();
        let scripthash = scripthash_for(&keys, KeychainKind::External, 1);
        let leaf_script = keys
            .leaf(KeychainKind::External, 1)
            .unwrap()
            .script_pubkey();
        let deposit = tx_paying(&leaf_script, 30_000);
        let txid = deposit.compute_txid();
        let raw = tx_hex(&deposit);

        let mut api = MockStratum::new();
        let pushed = scripthash.clone();
        let calls = AtomicUsize::new(0);
        api.expect_next_notification().returning(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Notification {
                    scripthash: pushed.clone(),
                    status: Some("f00d".into()),
                })
            } else {
                Err(ElectrumError::Disconnected)
            }
        });
        let entry_txid = txid.to_string();
        api.expect_scripthash_get_history().returning(move |_| {
            Ok(vec![HistoryEntry {
                tx_hash: entry_txid.clone(),
                height: 0,
                fee: None,
            }])
        });
        api.expect_transaction_get()
            .returning(move |_| Ok(raw.clone()));
        api.expect_scripthash_get_balance().returning(|_| {
            Ok(ScriptBalance {
                confirmed: 0,
                unconfirmed: 30_000,
            })
        });
        let unspent_txid = txid.to_string();
        api.expect_scripthash_listunspent().returning(move |_| {
            Ok(vec![umbra_electrum::UnspentEntry {
                tx_hash: unspent_txid.clone(),
                tx_pos: 0,
                height: 0,
                value: 30_000,
            }])
        });

        let wallet = native_wallet(api);
        {
            let mut store = wallet.lock_store();
            store.mark_used(KeychainKind::External, 0);
            store.used_mut(KeychainKind::External).push(false);
        }

        let err = wallet.listen_for_updates().await.unwrap_err();
        assert!(matches!(err, Error::Rpc(ElectrumError::Disconnected)));

        let store = wallet.lock_store();
        let bucket = &store.buckets[&(KeychainKind::External, 1)];
        assert_eq!(bucket.txns.len(), 1);
        assert!(!bucket.txns[0].is_spend);
        assert_eq!(bucket.txns[0].value, Amount::from_sat(30_000));
        assert_eq!(bucket.txns[0].height, 0);

        assert!(store.used(KeychainKind::External)[1]);
        assert_eq!(store.utxos.len(), 1);
        assert_eq!(store.utxos[0].outpoint, OutPoint::new(txid, 0));
        assert_eq!(store.zeroconf_balance, SignedAmount::from_sat(30_000));
        assert!(store.new_history);
    }

    #[tokio::test]
    async fn dispatcher_applies_the_confirmation_transition() {
        let keys = account_keys();
        let scripthash = scripthash_for(&keys, KeychainKind::External, 0);
        let leaf_script = keys
            .leaf(KeychainKind::External, 0)
            .unwrap()
            .script_pubkey();
        let deposit = tx_paying(&leaf_script, 42_000);
        let txid = deposit.compute_txid();
        let raw = tx_hex(&deposit);

        let mut api = MockStratum::new();
        let entry_txid = txid.to_string();
        api.expect_scripthash_get_history().returning(move |_| {
            Ok(vec![HistoryEntry {
                tx_hash: entry_txid.clone(),
                height: 150,
                fee: None,
            }])
        });
        api.expect_transaction_get()
            .returning(move |_| Ok(raw.clone()));
        api.expect_block_get_header()
            .returning(|_| Ok(HeaderInfo { timestamp: 1_234 }));
        api.expect_scripthash_get_balance().returning(|_| {
            Ok(ScriptBalance {
                confirmed: 42_000,
                unconfirmed: 0,
            })
        });
        api.expect_scripthash_listunspent().returning(|_| Ok(vec![]));

        let wallet = native_wallet(api);
        {
            let mut store = wallet.lock_store();
            store.mark_used(KeychainKind::External, 0);
            store.upsert_history(
                KeychainKind::External,
                0,
                HistoryItem {
                    txid,
                    tx: deposit.clone(),
                    is_spend: false,
                    value: Amount::from_sat(42_000),
                    height: 0,
                    timestamp: 1,
                    spendables: Vec::new(),
                },
            );
            store.set_bucket_balance(
                KeychainKind::External,
                0,
                SignedAmount::ZERO,
                SignedAmount::from_sat(42_000),
            );
            store.recompute_totals();
        }

        wallet
            .handle_notification(&Notification {
                scripthash,
                status: Some("beef".into()),
            })
            .await
            .unwrap();

        let store = wallet.lock_store();
        let bucket = &store.buckets[&(KeychainKind::External, 0)];
        assert_eq!(bucket.txns.len(), 1);
        assert_eq!(bucket.txns[0].height, 150);
        assert_eq!(bucket.txns[0].timestamp, 1_234);
        assert_eq!(store.balance, SignedAmount::from_sat(42_000));
        assert_eq!(store.zeroconf_balance, SignedAmount::ZERO);
    }

    #[tokio::test]
    async fn unknown_scripthash_is_an_invariant_violation() {
        let api = MockStratum::new();
        let wallet = native_wallet(api);

        let err = wallet
            .handle_notification(&Notification {
                scripthash: "00".repeat(32),
                status: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnknownScriptHash(_)));

        let store = wallet.lock_store();
        assert!(store.buckets.is_empty());
        assert!(!store.new_history);
    }
}
