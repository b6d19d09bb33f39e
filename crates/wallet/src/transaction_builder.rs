//! Transaction construction: coin selection, BIP69 canonical ordering, fee
//! estimation over the virtual size, BIP143 signing, broadcast bookkeeping
//! and opt-in replace-by-fee.

use std::str::FromStr;

use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode;
use bitcoin::script::PushBytesBuf;
use bitcoin::secp256k1::{Message, Secp256k1};
use bitcoin::sighash::SighashCache;
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, EcdsaSighashType, ScriptBuf, Sequence, SignedAmount, Transaction, TxIn,
    TxOut, Txid, Witness,
};

use umbra_common::{utils, KeychainKind, BITCOIN};
use umbra_electrum::StratumApi as _;
use umbra_keys::{electrum_scripthash, LeafKey};

use crate::storage::{HistoryItem, Spendable};
use crate::wallet::Wallet;
use crate::{error::Error, Result};

/// Conservative fee reserve added to the requested amount during coin
/// selection, settled by the real fee split afterwards.
pub const FEE_HIGHBALL: Amount = Amount::from_sat(100_000);
/// Default minimum relay fee of the network.
pub const MIN_RELAY_FEE: Amount = Amount::from_sat(1_000);
/// Safety stop: rates above this are rejected outright.
pub const MAX_FEE_RATE_SAT_PER_VB: u64 = 2_000;
/// At or below this rate, selection consolidates large coins first; above
/// it, small coins stay out of expensive transactions.
pub const CONSOLIDATION_RATE_SAT_PER_VB: u64 = 100;

/// A fully signed transaction that has not been broadcast yet.
#[derive(Clone, Debug)]
pub struct SpendDraft {
    pub tx: Transaction,
    pub fee: Amount,
    pub vsize: u64,
    pub change_vout: u32,
    pub spendables: Vec<Spendable>,
}

impl SpendDraft {
    pub fn raw_hex(&self) -> String {
        encode::serialize_hex(&self.tx)
    }
}

fn display_order_txid(txid: &Txid) -> [u8; 32] {
    use bitcoin::hashes::Hash;
    let mut bytes = txid.to_byte_array();
    bytes.reverse();
    bytes
}

/// BIP69 input order: (txid ascending in display order, vout ascending).
pub(crate) fn sort_spendables(spendables: &mut [Spendable]) {
    spendables.sort_by(|a, b| {
        display_order_txid(&a.outpoint.txid)
            .cmp(&display_order_txid(&b.outpoint.txid))
            .then(a.outpoint.vout.cmp(&b.outpoint.vout))
    });
}

/// BIP69 output order: (value ascending, script bytes ascending).
pub(crate) fn sort_outputs(outputs: &mut [TxOut]) {
    outputs.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });
}

/// Virtual size of a draft whose witnesses are not known yet: the base size
/// is exact, the total size uses per-input/output placeholders.
pub(crate) fn estimate_vsize(tx: &Transaction) -> u64 {
    let base_size = tx.base_size() as u64;
    let input_count = tx.input.len() as u64;
    let output_count = tx.output.len() as u64;
    let total_size = input_count * 180 + output_count * 34 + 10 + input_count;
    (3 * base_size + total_size) / 4
}

pub fn satb_to_coinkb(sat_per_byte: u64) -> f64 {
    (sat_per_byte * 1000) as f64 / BITCOIN as f64
}

pub fn coinkb_to_satb(coin_per_kb: f64) -> u64 {
    Amount::from_btc(coin_per_kb)
        .map(|amount| amount.to_sat() / 1000)
        .unwrap_or(0)
}

/// Applies the fee policy to a draft: reject extraordinary rates, charge by
/// vsize, clamp to the minimum relay fee.
fn fee_for(tx: &Transaction, sat_per_kb: u64) -> Result<(Amount, u64)> {
    let rate_sat_per_vb = sat_per_kb / 1000;
    if rate_sat_per_vb > MAX_FEE_RATE_SAT_PER_VB {
        return Err(Error::FeeRateTooHigh {
            rate: rate_sat_per_vb,
        });
    }
    let vsize = estimate_vsize(tx);
    let fee = Amount::from_sat((vsize * sat_per_kb + 500) / 1000);
    Ok((fee.max(MIN_RELAY_FEE), vsize))
}

impl Wallet {
    /// Asks the server for a six-block fee estimate, in whole coins per KB.
    pub async fn fee_estimate(&self) -> Result<f64> {
        let coin_per_kb = self.client.estimate_fee(6).await?;
        if coin_per_kb < 0.0 {
            return Err(Error::FeeEstimateUnavailable);
        }
        log::info!(
            "Fee estimate from server is {} {}/KB",
            coin_per_kb,
            self.chain.tag.to_uppercase()
        );
        Ok(coin_per_kb)
    }

    /// Builds and signs a spend of `amount` to `address` without
    /// broadcasting it. Selected coins move to the spent set; they are
    /// restored if the build fails.
    pub fn prepare_spend(
        &self,
        address: &str,
        amount: Amount,
        coin_per_kb: f64,
        rbf: bool,
    ) -> Result<SpendDraft> {
        let destination = Address::from_str(address)?
            .require_network(self.chain.network.into())?;
        let sat_per_kb = Amount::from_btc(coin_per_kb)?.to_sat();
        let rate_sat_per_vb = sat_per_kb / 1000;

        let descending = rate_sat_per_vb <= CONSOLIDATION_RATE_SAT_PER_VB;
        let spendables = self
            .lock_store()
            .select_spendables(amount + FEE_HIGHBALL, descending);

        match self.build_and_sign(spendables.clone(), destination, amount, sat_per_kb, rbf) {
            Ok(draft) => {
                self.pending_drafts
                    .lock()
                    .expect("drafts lock")
                    .insert(draft.tx.compute_txid(), draft.clone());
                Ok(draft)
            }
            Err(err) => {
                self.lock_store().restore_spendables(spendables);
                Err(err)
            }
        }
    }

    fn build_and_sign(
        &self,
        mut spendables: Vec<Spendable>,
        destination: Address,
        amount: Amount,
        sat_per_kb: u64,
        rbf: bool,
    ) -> Result<SpendDraft> {
        let total_in: Amount = spendables.iter().map(|spendable| spendable.value).sum();
        sort_spendables(&mut spendables);

        if rbf {
            log::info!("Spending with opt-in Replace by Fee! (RBF)");
        }
        let sequence = if rbf { Sequence::ZERO } else { Sequence::MAX };
        let input: Vec<TxIn> = spendables
            .iter()
            .map(|spendable| TxIn {
                previous_output: spendable.outpoint,
                script_sig: ScriptBuf::new(),
                sequence,
                witness: Witness::new(),
            })
            .collect();

        let (change_index, change_address) =
            self.next_unused_address(KeychainKind::Internal, true)?;
        log::debug!("Allocating change to internal index {}", change_index);
        let change_script = change_address.script_pubkey();

        let mut output = vec![
            TxOut {
                value: amount,
                script_pubkey: destination.script_pubkey(),
            },
            TxOut {
                value: Amount::ZERO,
                script_pubkey: change_script.clone(),
            },
        ];
        sort_outputs(&mut output);

        let mut tx = Transaction {
            version: Version::ONE,
            lock_time: LockTime::ZERO,
            input,
            output,
        };

        let (fee, vsize) = fee_for(&tx, sat_per_kb)?;
        let required = amount + fee;

        let available = self.lock_store().balance;
        if available < required.to_signed().unwrap_or(SignedAmount::MAX) {
            return Err(Error::InsufficientFunds {
                needed: required.to_sat(),
                available: available.to_sat().max(0) as u64,
            });
        }
        let change_value = total_in.checked_sub(required).ok_or(Error::InsufficientFunds {
            needed: required.to_sat(),
            available: total_in.to_sat(),
        })?;

        let change_vout = tx
            .output
            .iter()
            .position(|output| output.script_pubkey == change_script)
            .expect("change output was just added") as u32;
        tx.output[change_vout as usize].value = change_value;

        self.sign_inputs(&mut tx, &spendables)?;
        Ok(SpendDraft {
            tx,
            fee,
            vsize,
            change_vout,
            spendables,
        })
    }

    /// BIP143 signatures for every input, native or nested.
    fn sign_inputs(&self, tx: &mut Transaction, spendables: &[Spendable]) -> Result<()> {
        let owners = self.owning_leaves(spendables)?;
        let secp = Secp256k1::new();
        let sighash_type = EcdsaSighashType::All;

        let mut witnesses = Vec::with_capacity(spendables.len());
        let mut script_sigs = Vec::with_capacity(spendables.len());
        {
            let mut cache = SighashCache::new(tx.clone());
            for (index, (spendable, leaf)) in spendables.iter().zip(&owners).enumerate() {
                let sighash = cache
                    .p2wpkh_signature_hash(
                        index,
                        &leaf.witness_program(),
                        spendable.value,
                        sighash_type,
                    )
                    .map_err(|err| Error::Signing(err.to_string()))?;
                use bitcoin::hashes::Hash;
                let message = Message::from_digest(sighash.to_byte_array());
                let signature = bitcoin::ecdsa::Signature {
                    signature: secp.sign_ecdsa(&message, &leaf.secret_key()),
                    sighash_type,
                };
                witnesses.push(Witness::p2wpkh(&signature, &leaf.public_key().0));
                script_sigs.push(leaf.redeem_script().map(|redeem| {
                    let push = PushBytesBuf::try_from(redeem.into_bytes())
                        .expect("redeem script fits a push");
                    ScriptBuf::builder().push_slice(push).into_script()
                }));
            }
        }

        for (index, (witness, script_sig)) in
            witnesses.into_iter().zip(script_sigs).enumerate()
        {
            tx.input[index].witness = witness;
            if let Some(script_sig) = script_sig {
                tx.input[index].script_sig = script_sig;
            }
        }
        Ok(())
    }

    /// Finds the leaf key owning each selected output by matching output
    /// scripts over every index the wallet has seen.
    fn owning_leaves(&self, spendables: &[Spendable]) -> Result<Vec<LeafKey>> {
        let mut by_script: Vec<(ScriptBuf, LeafKey)> = Vec::new();
        for keychain in [KeychainKind::External, KeychainKind::Internal] {
            let known = self.lock_store().used(keychain).len() as u32;
            for index in 0..known {
                let leaf = self.leaf(keychain, index)?;
                by_script.push((leaf.script_pubkey(), leaf));
            }
        }

        spendables
            .iter()
            .map(|spendable| {
                by_script
                    .iter()
                    .find(|(script, _)| script == &spendable.script_pubkey)
                    .map(|(_, leaf)| leaf.clone())
                    .ok_or_else(|| {
                        Error::Signing(format!(
                            "No key owns output script {}",
                            spendable.script_pubkey
                        ))
                    })
            })
            .collect()
    }

    /// Builds, signs and broadcasts in one step.
    pub async fn spend(
        &self,
        address: &str,
        amount: Amount,
        coin_per_kb: f64,
        rbf: bool,
    ) -> Result<(Txid, Amount, u64)> {
        let draft = self.prepare_spend(address, amount, coin_per_kb, rbf)?;
        let txid = self.broadcast_draft(&draft).await?;
        Ok((txid, draft.fee, draft.vsize))
    }

    /// Broadcasts a transaction previously built by [`Wallet::prepare_spend`]
    /// in this session.
    pub async fn broadcast_raw(&self, tx_hex: &str, change_vout: u32) -> Result<Txid> {
        let tx: Transaction = encode::deserialize(&hex::decode(tx_hex)?)?;
        let txid = tx.compute_txid();
        let draft = self
            .pending_drafts
            .lock()
            .expect("drafts lock")
            .get(&txid)
            .cloned()
            .ok_or_else(|| Error::Config("Transaction was not built by this session".into()))?;
        if draft.change_vout != change_vout {
            return Err(Error::Config(
                "Change output index does not match the draft".into(),
            ));
        }
        self.broadcast_draft(&draft).await
    }

    /// Submits the draft and applies its side effects to the store before
    /// subscribing the change address, so a racing notification for that
    /// address cannot double-count. Balance bookkeeping goes through the
    /// owning buckets: the wallet totals stay the bucket sum at every
    /// quiescent moment, not just after the next dispatcher pass.
    pub(crate) async fn broadcast_draft(&self, draft: &SpendDraft) -> Result<Txid> {
        let txid = draft.tx.compute_txid();
        let change_output = &draft.tx.output[draft.change_vout as usize];
        let change_script = change_output.script_pubkey.clone();
        let change_index = self.change_index_for(&change_script)?;

        // Which bucket each consumed coin is counted under.
        let mut debits = Vec::with_capacity(draft.spendables.len());
        for spendable in &draft.spendables {
            let owner = self.owning_index(&spendable.script_pubkey)?.ok_or_else(|| {
                Error::Signing(format!(
                    "No key owns output script {}",
                    spendable.script_pubkey
                ))
            })?;
            debits.push((owner, spendable.value));
        }
        let destination_value = draft
            .tx
            .output
            .iter()
            .enumerate()
            .find(|(vout, _)| *vout as u32 != draft.change_vout)
            .map(|(_, output)| output.value)
            .unwrap_or(Amount::ZERO);

        let raw = draft.raw_hex();
        let reported = match self.client.transaction_broadcast(&raw).await {
            Ok(reported) => reported,
            Err(err) => {
                self.lock_store().restore_spendables(draft.spendables.clone());
                return Err(err.into());
            }
        };
        if reported != txid.to_string() {
            log::warn!("Server acknowledged an unexpected txid: {}", reported);
        }
        log::info!("Broadcast transaction {}", txid);

        {
            let mut store = self.lock_store();
            for ((keychain, index), value) in &debits {
                store.adjust_bucket_balance(
                    *keychain,
                    *index,
                    -value.to_signed().unwrap_or(SignedAmount::MAX),
                    SignedAmount::ZERO,
                );
            }
            store.adjust_bucket_balance(
                KeychainKind::Internal,
                change_index,
                SignedAmount::ZERO,
                change_output.value.to_signed().unwrap_or(SignedAmount::MAX),
            );
            store.add_utxo(Spendable {
                outpoint: bitcoin::OutPoint::new(txid, draft.change_vout),
                value: change_output.value,
                script_pubkey: change_script.clone(),
            });
            store.upsert_history(
                KeychainKind::Internal,
                change_index,
                HistoryItem {
                    txid,
                    tx: draft.tx.clone(),
                    is_spend: true,
                    value: destination_value,
                    height: 0,
                    timestamp: utils::now().as_secs(),
                    spendables: draft.spendables.clone(),
                },
            );
            store.recompute_totals();
            store.new_history = true;
        }

        // The spend is committed; the draft must not be re-playable.
        self.pending_drafts
            .lock()
            .expect("drafts lock")
            .remove(&txid);

        // A lost subscription only delays the confirmation event; the next
        // discovery pass repairs it.
        if let Err(err) = self
            .client
            .scripthash_subscribe(&electrum_scripthash(&change_script))
            .await
        {
            log::warn!("Could not subscribe the change address: {}", err);
        }
        Ok(txid)
    }

    /// Returns every selected-but-unbroadcast coin to the spendable set and
    /// forgets the drafts. Part of graceful shutdown: a cancelled session
    /// must not leave coins stranded in the spent set.
    pub fn abandon_pending_drafts(&self) {
        let drafts: Vec<SpendDraft> = {
            let mut pending = self.pending_drafts.lock().expect("drafts lock");
            pending.drain().map(|(_, draft)| draft).collect()
        };
        if drafts.is_empty() {
            return;
        }
        log::info!("Abandoning {} unbroadcast draft(s)", drafts.len());
        let mut store = self.lock_store();
        for draft in drafts {
            store.restore_spendables(draft.spendables);
        }
    }

    /// Rebuilds an unconfirmed spend with the same inputs and destination
    /// outputs at a higher fee rate, broadcasts it, and replaces the stored
    /// history entry.
    pub async fn replace_by_fee(&self, txid: Txid, coin_per_kb: f64) -> Result<Txid> {
        let sat_per_kb = Amount::from_btc(coin_per_kb)?.to_sat();

        let (keychain, index, old_item) = {
            let store = self.lock_store();
            let (keychain, index, item) =
                store.find_history(txid).ok_or(Error::NotReplaceable)?;
            (keychain, index, item.clone())
        };
        if old_item.height != 0 || !old_item.is_spend || old_item.spendables.is_empty() {
            return Err(Error::NotReplaceable);
        }

        let total_in: Amount = old_item.spendables.iter().map(|s| s.value).sum();
        let old_outputs: Amount = old_item.tx.output.iter().map(|o| o.value).sum();
        let old_fee = total_in.checked_sub(old_outputs).ok_or(Error::NotReplaceable)?;

        // Preserve destinations, zero the change output for refill.
        let change_scripts = self.known_change_scripts()?;
        let mut change_vout = None;
        let output: Vec<TxOut> = old_item
            .tx
            .output
            .iter()
            .enumerate()
            .map(|(vout, txout)| {
                if change_scripts.contains(&txout.script_pubkey) {
                    change_vout = Some(vout as u32);
                    TxOut {
                        value: Amount::ZERO,
                        script_pubkey: txout.script_pubkey.clone(),
                    }
                } else {
                    txout.clone()
                }
            })
            .collect();
        let change_vout = change_vout.ok_or(Error::NotReplaceable)?;

        let mut tx = Transaction {
            version: old_item.tx.version,
            lock_time: old_item.tx.lock_time,
            input: old_item
                .tx
                .input
                .iter()
                .map(|input| TxIn {
                    previous_output: input.previous_output,
                    script_sig: ScriptBuf::new(),
                    sequence: input.sequence,
                    witness: Witness::new(),
                })
                .collect(),
            output,
        };

        let (new_fee, _) = fee_for(&tx, sat_per_kb)?;
        if new_fee <= old_fee {
            return Err(Error::Config(
                "Replacement fee must exceed the original fee".into(),
            ));
        }
        let explicit: Amount = tx.output.iter().map(|o| o.value).sum();
        let change_value =
            total_in
                .checked_sub(explicit + new_fee)
                .ok_or(Error::InsufficientFunds {
                    needed: (explicit + new_fee).to_sat(),
                    available: total_in.to_sat(),
                })?;
        tx.output[change_vout as usize].value = change_value;

        self.sign_inputs(&mut tx, &old_item.spendables)?;
        self.client
            .transaction_broadcast(&encode::serialize_hex(&tx))
            .await?;
        let new_txid = tx.compute_txid();

        let fee_delta = (new_fee - old_fee).to_signed().unwrap_or(SignedAmount::MAX);
        {
            let mut store = self.lock_store();
            // The extra fee comes out of the bucket holding the spend, so
            // the totals stay the bucket sum.
            store.adjust_bucket_balance(keychain, index, -fee_delta, SignedAmount::ZERO);
            store.replace_history(
                keychain,
                index,
                txid,
                HistoryItem {
                    txid: new_txid,
                    tx,
                    is_spend: true,
                    value: old_item.value,
                    height: 0,
                    timestamp: utils::now().as_secs(),
                    spendables: old_item.spendables.clone(),
                },
            );
            store.recompute_totals();
            store.new_history = true;
        }
        log::info!(
            "Replaced {} with {} (fee {} -> {})",
            txid,
            new_txid,
            old_fee,
            new_fee
        );
        Ok(new_txid)
    }
}
