//! BIP32 account hierarchy over the stretched master seed.
//!
//! The master node is built directly from the KDF output: left 32 bytes as
//! the secret exponent, right 32 as the chain code. Accounts live at
//! `purpose'/coin'/account'` with purpose 49 (nested SegWit) or 84 (native
//! SegWit); each account has an external (receive) and an internal (change)
//! branch with non-hardened leaves.

use bitcoin::bip32::{ChainCode, ChildNumber, Fingerprint, Xpriv, Xpub};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};

use umbra_common::{Chain, KeychainKind, Network, ScriptType};

use crate::{address::LeafKey, error::Error, kdf::MasterSeed, Result};

pub struct AccountKeys {
    secp: Secp256k1<All>,
    chain: Chain,
    script_type: ScriptType,
    account_xpriv: Xpriv,
    receive_xpriv: Xpriv,
    change_xpriv: Xpriv,
}

impl AccountKeys {
    pub fn from_seed(
        seed: &MasterSeed,
        chain: Chain,
        script_type: ScriptType,
        account: u32,
    ) -> Result<Self> {
        let secp = Secp256k1::new();

        let private_key = SecretKey::from_slice(&seed.secret_exponent)
            .map_err(|_| Error::InvalidSecretExponent)?;
        let master = Xpriv {
            network: chain.network.into(),
            depth: 0,
            parent_fingerprint: Fingerprint::default(),
            child_number: ChildNumber::from_normal_idx(0)?,
            private_key,
            chain_code: ChainCode::from(seed.chain_code),
        };

        let account_path = [
            ChildNumber::from_hardened_idx(script_type.purpose())?,
            ChildNumber::from_hardened_idx(chain.coin_type)?,
            ChildNumber::from_hardened_idx(account)?,
        ];
        let account_xpriv = master.derive_priv(&secp, &account_path)?;
        let receive_xpriv = account_xpriv.derive_priv(
            &secp,
            &[ChildNumber::from_normal_idx(KeychainKind::External.child_index())?],
        )?;
        let change_xpriv = account_xpriv.derive_priv(
            &secp,
            &[ChildNumber::from_normal_idx(KeychainKind::Internal.child_index())?],
        )?;

        Ok(AccountKeys {
            secp,
            chain,
            script_type,
            account_xpriv,
            receive_xpriv,
            change_xpriv,
        })
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    pub fn script_type(&self) -> ScriptType {
        self.script_type
    }

    /// The key at a leaf index of the given branch.
    pub fn leaf(&self, keychain: KeychainKind, index: u32) -> Result<LeafKey> {
        let root = match keychain {
            KeychainKind::External => &self.receive_xpriv,
            KeychainKind::Internal => &self.change_xpriv,
        };
        let child = root.derive_priv(&self.secp, &[ChildNumber::from_normal_idx(index)?])?;
        Ok(LeafKey::from_secret_key(
            &self.secp,
            child.private_key,
            self.chain.network,
            self.script_type,
        ))
    }

    pub fn xpub(&self) -> Xpub {
        Xpub::from_priv(&self.secp, &self.account_xpriv)
    }

    /// Standard BIP32 serialization of the account public key.
    pub fn extended_pub(&self) -> String {
        self.xpub().to_string()
    }

    /// Display form with the first character mapped by (network, encoding):
    /// mainnet y/z, testnet u/v.
    pub fn display_extended_pub(&self) -> String {
        let serialized = self.extended_pub();
        let first = match (self.chain.network, self.script_type) {
            (Network::Bitcoin, ScriptType::NestedSegwit) => 'y',
            (Network::Bitcoin, ScriptType::NativeSegwit) => 'z',
            (_, ScriptType::NestedSegwit) => 'u',
            (_, ScriptType::NativeSegwit) => 'v',
        };
        format!("{}{}", first, &serialized[1..])
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use umbra_common::{BITCOIN_CHAIN, TESTNET_CHAIN};

    use super::*;

    fn test_seed() -> MasterSeed {
        MasterSeed {
            secret_exponent: hex::decode(
                "4ecea260f05d78edaab017d4a188149532f72895827cc57c2e520b4b4fe1c70f",
            )
            .unwrap()
            .try_into()
            .unwrap(),
            chain_code: hex::decode(
                "5e49a36bf36a4fd325d38198f91fb4013ad45414dc0de616506e399f166b5257",
            )
            .unwrap()
            .try_into()
            .unwrap(),
        }
    }

    #[test]
    fn account_sits_three_levels_deep() {
        let keys =
            AccountKeys::from_seed(&test_seed(), TESTNET_CHAIN, ScriptType::NativeSegwit, 0)
                .unwrap();
        assert_eq!(keys.account_xpriv.depth, 3);
        assert_eq!(keys.receive_xpriv.depth, 4);
        assert_eq!(keys.change_xpriv.depth, 4);
    }

    #[test]
    fn leaves_are_deterministic_and_branch_distinct() {
        let keys =
            AccountKeys::from_seed(&test_seed(), TESTNET_CHAIN, ScriptType::NativeSegwit, 0)
                .unwrap();
        let a = keys.leaf(KeychainKind::External, 0).unwrap();
        let b = keys.leaf(KeychainKind::External, 0).unwrap();
        let c = keys.leaf(KeychainKind::Internal, 0).unwrap();
        assert_eq!(a.script_pubkey(), b.script_pubkey());
        assert_ne!(a.script_pubkey(), c.script_pubkey());
        assert!(a.address().to_string().starts_with("tb1q"));
    }

    #[test]
    fn exported_xpub_round_trips() {
        let keys =
            AccountKeys::from_seed(&test_seed(), BITCOIN_CHAIN, ScriptType::NestedSegwit, 0)
                .unwrap();
        let xpub = keys.xpub();
        let reparsed = Xpub::from_str(&keys.extended_pub()).unwrap();
        assert_eq!(reparsed.public_key, xpub.public_key);
        assert_eq!(reparsed.chain_code, xpub.chain_code);
    }

    #[test]
    fn display_prefix_follows_network_and_encoding() {
        let cases = [
            (BITCOIN_CHAIN, ScriptType::NestedSegwit, 'y'),
            (BITCOIN_CHAIN, ScriptType::NativeSegwit, 'z'),
            (TESTNET_CHAIN, ScriptType::NestedSegwit, 'u'),
            (TESTNET_CHAIN, ScriptType::NativeSegwit, 'v'),
        ];
        for (chain, script_type, expected) in cases {
            let keys = AccountKeys::from_seed(&test_seed(), chain, script_type, 0).unwrap();
            assert_eq!(keys.display_extended_pub().chars().next(), Some(expected));
        }
    }

    #[test]
    fn rejects_out_of_range_secret_exponent() {
        let seed = MasterSeed {
            secret_exponent: [0xff; 32],
            chain_code: [0u8; 32],
        };
        assert!(matches!(
            AccountKeys::from_seed(&seed, TESTNET_CHAIN, ScriptType::NativeSegwit, 0),
            Err(Error::InvalidSecretExponent)
        ));
    }
}
