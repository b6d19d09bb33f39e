//! In-memory wallet state: used-index bitmaps, per-index history buckets,
//! the UTXO set and the running balance totals.
//!
//! Two invariants hold at every quiescent moment: the wallet totals equal
//! the sum over all buckets, and no outpoint is in both `utxos` and
//! `spent_utxos`. All monetary arithmetic is integer satoshis; decimal
//! strings exist only in the serialized views.

use std::collections::BTreeMap;

use bitcoin::{Amount, Denomination, OutPoint, ScriptBuf, SignedAmount, Transaction, Txid};
use serde::Serialize;

use umbra_common::KeychainKind;

/// An unspent output the wallet controls.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Spendable {
    pub outpoint: OutPoint,
    pub value: Amount,
    pub script_pubkey: ScriptBuf,
}

impl Spendable {
    pub fn view(&self) -> SpendableView {
        SpendableView {
            txid: self.outpoint.txid.to_string(),
            vout: self.outpoint.vout,
            value: self.value.to_sat(),
        }
    }
}

/// Serialized form of a [`Spendable`] for the daemon's JSON surface.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SpendableView {
    pub txid: String,
    pub vout: u32,
    pub value: u64,
}

/// One entry of the wallet's transaction history. Confirmed entries carry
/// the block height and the block's timestamp; unconfirmed entries have
/// height 0 and the local observation time.
#[derive(Clone, Debug)]
pub struct HistoryItem {
    pub txid: Txid,
    pub tx: Transaction,
    pub is_spend: bool,
    /// Received value for deposits, destination value for spends.
    pub value: Amount,
    pub height: u32,
    pub timestamp: u64,
    /// The inputs this spend consumed. Only populated for spends built in
    /// this session; feeds replace-by-fee.
    pub spendables: Vec<Spendable>,
}

impl HistoryItem {
    pub fn view(&self) -> HistoryView {
        HistoryView {
            txid: self.txid.to_string(),
            is_spend: self.is_spend,
            value: format!("{:.8}", self.value.display_in(Denomination::Bitcoin)),
            height: self.height,
            timestamp: self.timestamp,
        }
    }
}

/// Serialized form of a [`HistoryItem`] for the daemon's JSON surface.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HistoryView {
    pub txid: String,
    pub is_spend: bool,
    pub value: String,
    pub height: u32,
    pub timestamp: u64,
}

/// Per-index state: server-reported balances plus the transactions touching
/// the index.
#[derive(Clone, Debug)]
pub struct Bucket {
    pub confirmed: SignedAmount,
    pub zeroconf: SignedAmount,
    pub txns: Vec<HistoryItem>,
}

impl Default for Bucket {
    fn default() -> Self {
        Bucket {
            confirmed: SignedAmount::ZERO,
            zeroconf: SignedAmount::ZERO,
            txns: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HistoryUpsert {
    Appended,
    Replaced,
    Unchanged,
}

#[derive(Debug)]
pub struct WalletStore {
    external_used: Vec<bool>,
    internal_used: Vec<bool>,
    pub buckets: BTreeMap<(KeychainKind, u32), Bucket>,
    pub utxos: Vec<Spendable>,
    pub spent_utxos: Vec<Spendable>,
    pub balance: SignedAmount,
    pub zeroconf_balance: SignedAmount,
    pub new_history: bool,
}

impl WalletStore {
    pub fn new() -> Self {
        WalletStore {
            external_used: Vec::new(),
            internal_used: Vec::new(),
            buckets: BTreeMap::new(),
            utxos: Vec::new(),
            spent_utxos: Vec::new(),
            balance: SignedAmount::ZERO,
            zeroconf_balance: SignedAmount::ZERO,
            new_history: false,
        }
    }

    pub fn used(&self, keychain: KeychainKind) -> &[bool] {
        match keychain {
            KeychainKind::External => &self.external_used,
            KeychainKind::Internal => &self.internal_used,
        }
    }

    pub fn used_mut(&mut self, keychain: KeychainKind) -> &mut Vec<bool> {
        match keychain {
            KeychainKind::External => &mut self.external_used,
            KeychainKind::Internal => &mut self.internal_used,
        }
    }

    /// The first index never seen with history. Past the end of the bitmap
    /// when every known index is used.
    pub fn next_unused_index(&self, keychain: KeychainKind) -> u32 {
        let used = self.used(keychain);
        used.iter()
            .position(|used| !used)
            .unwrap_or(used.len()) as u32
    }

    pub fn mark_used(&mut self, keychain: KeychainKind, index: u32) {
        let used = self.used_mut(keychain);
        if used.len() <= index as usize {
            used.resize(index as usize + 1, false);
        }
        used[index as usize] = true;
    }

    /// Inserts a history item, deduplicating by txid. A later sighting with
    /// a different height replaces the stored entry (the zero-conf to
    /// confirmed transition), keeping locally recorded spendables.
    pub fn upsert_history(
        &mut self,
        keychain: KeychainKind,
        index: u32,
        item: HistoryItem,
    ) -> HistoryUpsert {
        let bucket = self.buckets.entry((keychain, index)).or_default();
        match bucket.txns.iter_mut().find(|known| known.txid == item.txid) {
            Some(existing) => {
                if existing.height == item.height {
                    return HistoryUpsert::Unchanged;
                }
                let spendables = std::mem::take(&mut existing.spendables);
                *existing = item;
                if existing.spendables.is_empty() {
                    existing.spendables = spendables;
                }
                HistoryUpsert::Replaced
            }
            None => {
                bucket.txns.push(item);
                HistoryUpsert::Appended
            }
        }
    }

    /// Swaps the entry for `old_txid` with a replacement transaction.
    pub fn replace_history(
        &mut self,
        keychain: KeychainKind,
        index: u32,
        old_txid: Txid,
        replacement: HistoryItem,
    ) -> bool {
        match self
            .buckets
            .get_mut(&(keychain, index))
            .and_then(|bucket| bucket.txns.iter_mut().find(|item| item.txid == old_txid))
        {
            Some(entry) => {
                *entry = replacement;
                true
            }
            None => false,
        }
    }

    pub fn find_history(&self, txid: Txid) -> Option<(KeychainKind, u32, &HistoryItem)> {
        self.buckets.iter().find_map(|(&(keychain, index), bucket)| {
            bucket
                .txns
                .iter()
                .find(|item| item.txid == txid)
                .map(|item| (keychain, index, item))
        })
    }

    pub fn set_bucket_balance(
        &mut self,
        keychain: KeychainKind,
        index: u32,
        confirmed: SignedAmount,
        zeroconf: SignedAmount,
    ) {
        let bucket = self.buckets.entry((keychain, index)).or_default();
        bucket.confirmed = confirmed;
        bucket.zeroconf = zeroconf;
    }

    /// Applies local deltas to a bucket's balances. Wallet totals stay the
    /// bucket sum, so every local adjustment goes through a bucket and is
    /// followed by [`WalletStore::recompute_totals`].
    pub fn adjust_bucket_balance(
        &mut self,
        keychain: KeychainKind,
        index: u32,
        confirmed_delta: SignedAmount,
        zeroconf_delta: SignedAmount,
    ) {
        let bucket = self.buckets.entry((keychain, index)).or_default();
        bucket.confirmed += confirmed_delta;
        bucket.zeroconf += zeroconf_delta;
    }

    /// Recomputes the wallet totals as the sum over all buckets.
    pub fn recompute_totals(&mut self) {
        self.balance = self
            .buckets
            .values()
            .map(|bucket| bucket.confirmed)
            .sum::<SignedAmount>();
        self.zeroconf_balance = self
            .buckets
            .values()
            .map(|bucket| bucket.zeroconf)
            .sum::<SignedAmount>();
    }

    /// Adds an unspent output unless its outpoint is already tracked or has
    /// been consumed by a spend of this session.
    pub fn add_utxo(&mut self, spendable: Spendable) -> bool {
        let outpoint = spendable.outpoint;
        if self.spent_utxos.iter().any(|spent| spent.outpoint == outpoint)
            || self.utxos.iter().any(|known| known.outpoint == outpoint)
        {
            return false;
        }
        self.utxos.push(spendable);
        true
    }

    /// Moves coins into `spent_utxos` until the accumulated value reaches
    /// `target`, visiting candidates by value in the requested direction.
    /// Returns the selection; the caller restores it if the spend is
    /// abandoned.
    pub fn select_spendables(&mut self, target: Amount, descending: bool) -> Vec<Spendable> {
        let mut order: Vec<usize> = (0..self.utxos.len()).collect();
        order.sort_by_key(|&i| self.utxos[i].value);
        if descending {
            order.reverse();
        }

        let mut picked = Vec::new();
        let mut total = Amount::ZERO;
        for i in order {
            if total >= target {
                break;
            }
            total += self.utxos[i].value;
            picked.push(i);
        }

        picked.sort_unstable_by(|a, b| b.cmp(a));
        let mut selected = Vec::with_capacity(picked.len());
        for i in picked {
            let spendable = self.utxos.remove(i);
            self.spent_utxos.push(spendable.clone());
            selected.push(spendable);
        }
        selected
    }

    /// Returns a failed selection to the spendable set.
    pub fn restore_spendables(&mut self, spendables: Vec<Spendable>) {
        for spendable in spendables {
            self.spent_utxos
                .retain(|spent| spent.outpoint != spendable.outpoint);
            if !self.utxos.iter().any(|known| known.outpoint == spendable.outpoint) {
                self.utxos.push(spendable);
            }
        }
    }

    /// Flattened history: deduplicated by txid (preferring the confirmed
    /// sighting), unconfirmed entries first, then height descending.
    pub fn tx_history(&self) -> Vec<HistoryItem> {
        let mut by_txid: BTreeMap<Txid, HistoryItem> = BTreeMap::new();
        for bucket in self.buckets.values() {
            for item in &bucket.txns {
                match by_txid.get(&item.txid) {
                    Some(known) if known.height > 0 => {}
                    _ => {
                        by_txid.insert(item.txid, item.clone());
                    }
                }
            }
        }
        let mut items: Vec<HistoryItem> = by_txid.into_values().collect();
        items.sort_by(|a, b| {
            let a_height = if a.height == 0 { u32::MAX } else { a.height };
            let b_height = if b.height == 0 { u32::MAX } else { b.height };
            b_height
                .cmp(&a_height)
                .then(b.timestamp.cmp(&a.timestamp))
        });
        items
    }
}

impl Default for WalletStore {
    fn default() -> Self {
        WalletStore::new()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;

    use super::*;

    fn dummy_tx() -> Transaction {
        Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![],
        }
    }

    fn outpoint(byte: u8, vout: u32) -> OutPoint {
        OutPoint::new(Txid::from_str(&hex::encode([byte; 32])).unwrap(), vout)
    }

    fn spendable(byte: u8, vout: u32, value: u64) -> Spendable {
        Spendable {
            outpoint: outpoint(byte, vout),
            value: Amount::from_sat(value),
            script_pubkey: ScriptBuf::new(),
        }
    }

    fn item(byte: u8, height: u32, timestamp: u64) -> HistoryItem {
        HistoryItem {
            txid: Txid::from_str(&hex::encode([byte; 32])).unwrap(),
            tx: dummy_tx(),
            is_spend: false,
            value: Amount::from_sat(1_000),
            height,
            timestamp,
            spendables: Vec::new(),
        }
    }

    #[test]
    fn totals_are_the_sum_over_buckets() {
        let mut store = WalletStore::new();
        store.set_bucket_balance(
            KeychainKind::External,
            0,
            SignedAmount::from_sat(5_000),
            SignedAmount::from_sat(100),
        );
        store.set_bucket_balance(
            KeychainKind::Internal,
            2,
            SignedAmount::from_sat(2_500),
            SignedAmount::from_sat(-300),
        );
        store.recompute_totals();
        assert_eq!(store.balance, SignedAmount::from_sat(7_500));
        assert_eq!(store.zeroconf_balance, SignedAmount::from_sat(-200));
    }

    #[test]
    fn bucket_adjustments_feed_the_totals() {
        let mut store = WalletStore::new();
        store.set_bucket_balance(
            KeychainKind::External,
            0,
            SignedAmount::from_sat(10_000),
            SignedAmount::ZERO,
        );
        store.adjust_bucket_balance(
            KeychainKind::External,
            0,
            SignedAmount::from_sat(-4_000),
            SignedAmount::from_sat(1_500),
        );
        store.recompute_totals();

        let bucket = &store.buckets[&(KeychainKind::External, 0)];
        assert_eq!(bucket.confirmed, SignedAmount::from_sat(6_000));
        assert_eq!(bucket.zeroconf, SignedAmount::from_sat(1_500));
        assert_eq!(store.balance, SignedAmount::from_sat(6_000));
        assert_eq!(store.zeroconf_balance, SignedAmount::from_sat(1_500));
    }

    #[test]
    fn confirmation_replaces_and_keeps_spendables() {
        let mut store = WalletStore::new();
        let mut unconfirmed = item(0xaa, 0, 10);
        unconfirmed.is_spend = true;
        unconfirmed.spendables = vec![spendable(0x01, 0, 40_000)];
        assert_eq!(
            store.upsert_history(KeychainKind::Internal, 0, unconfirmed),
            HistoryUpsert::Appended
        );

        let mut confirmed = item(0xaa, 120, 20);
        confirmed.is_spend = true;
        assert_eq!(
            store.upsert_history(KeychainKind::Internal, 0, confirmed),
            HistoryUpsert::Replaced
        );

        let bucket = &store.buckets[&(KeychainKind::Internal, 0)];
        assert_eq!(bucket.txns.len(), 1);
        assert_eq!(bucket.txns[0].height, 120);
        assert_eq!(bucket.txns[0].spendables.len(), 1);

        // A re-sighting at the same height is a no-op.
        assert_eq!(
            store.upsert_history(KeychainKind::Internal, 0, item(0xaa, 120, 30)),
            HistoryUpsert::Unchanged
        );
    }

    #[test]
    fn no_outpoint_lives_in_both_sets() {
        let mut store = WalletStore::new();
        assert!(store.add_utxo(spendable(0x01, 0, 10_000)));
        assert!(!store.add_utxo(spendable(0x01, 0, 10_000)));

        let selected = store.select_spendables(Amount::from_sat(1), true);
        assert_eq!(selected.len(), 1);
        assert!(store.utxos.is_empty());
        assert_eq!(store.spent_utxos.len(), 1);

        // While spent, the same outpoint cannot re-enter the utxo set.
        assert!(!store.add_utxo(spendable(0x01, 0, 10_000)));

        store.restore_spendables(selected);
        assert_eq!(store.utxos.len(), 1);
        assert!(store.spent_utxos.is_empty());
    }

    #[test]
    fn selection_direction_follows_fee_regime() {
        let mut store = WalletStore::new();
        store.add_utxo(spendable(0x01, 0, 1_000));
        store.add_utxo(spendable(0x02, 0, 50_000));
        store.add_utxo(spendable(0x03, 0, 9_000));

        let cheap_fees = store.select_spendables(Amount::from_sat(10_000), true);
        assert_eq!(cheap_fees[0].value, Amount::from_sat(50_000));
        store.restore_spendables(cheap_fees);

        let expensive_fees = store.select_spendables(Amount::from_sat(9_500), false);
        assert_eq!(expensive_fees[0].value, Amount::from_sat(1_000));
        assert_eq!(expensive_fees[1].value, Amount::from_sat(9_000));
    }

    #[test]
    fn history_orders_unconfirmed_first_then_height_descending() {
        let mut store = WalletStore::new();
        store.upsert_history(KeychainKind::External, 0, item(0x01, 100, 1_000));
        store.upsert_history(KeychainKind::External, 1, item(0x02, 0, 4_000));
        store.upsert_history(KeychainKind::External, 2, item(0x03, 250, 2_000));
        store.upsert_history(KeychainKind::External, 3, item(0x04, 0, 5_000));

        let history = store.tx_history();
        let heights: Vec<u32> = history.iter().map(|item| item.height).collect();
        assert_eq!(heights, vec![0, 0, 250, 100]);
        assert!(history[0].timestamp > history[1].timestamp);
    }

    #[test]
    fn flattened_history_dedupes_by_txid() {
        let mut store = WalletStore::new();
        // The same tx seen from two indices, one sighting confirmed.
        store.upsert_history(KeychainKind::External, 0, item(0x01, 0, 1_000));
        store.upsert_history(KeychainKind::Internal, 0, item(0x01, 90, 900));

        let history = store.tx_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].height, 90);
    }

    #[test]
    fn next_unused_index_walks_the_bitmap() {
        let mut store = WalletStore::new();
        assert_eq!(store.next_unused_index(KeychainKind::Internal), 0);
        store.mark_used(KeychainKind::Internal, 0);
        store.mark_used(KeychainKind::Internal, 2);
        assert_eq!(store.next_unused_index(KeychainKind::Internal), 1);
        assert_eq!(store.used(KeychainKind::Internal), &[true, false, true]);
    }

    #[test]
    fn views_render_exact_decimals() {
        let entry = HistoryItem {
            value: Amount::from_sat(150_000),
            ..item(0x05, 10, 99)
        };
        assert_eq!(entry.view().value, "0.00150000");
        assert_eq!(spendable(0x06, 1, 42).view().value, 42);
    }
}
