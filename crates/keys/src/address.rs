//! Per-leaf SegWit addressing: output scripts, addresses, Electrum
//! scripthashes and WIF export for one derived key.

use bitcoin::hashes::{sha256, Hash};
use bitcoin::secp256k1::{All, Secp256k1, SecretKey};
use bitcoin::{Address, CompressedPublicKey, PrivateKey, Script, ScriptBuf};

use umbra_common::{Network, ScriptType};

/// SHA256 of an output script, reversed hex. This is the Electrum protocol's
/// subscription key for an address (scripthash family, v1.2).
pub fn electrum_scripthash(script: &Script) -> String {
    let mut digest = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    digest.reverse();
    hex::encode(digest)
}

/// One derived key of the wallet, able to produce every representation the
/// engine needs: output script, address string, scripthash and WIF.
#[derive(Clone, Debug)]
pub struct LeafKey {
    network: Network,
    script_type: ScriptType,
    private_key: PrivateKey,
    public_key: CompressedPublicKey,
}

impl LeafKey {
    pub fn from_secret_key(
        secp: &Secp256k1<All>,
        secret_key: SecretKey,
        network: Network,
        script_type: ScriptType,
    ) -> Self {
        let public_key = CompressedPublicKey(secret_key.public_key(secp));
        LeafKey {
            network,
            script_type,
            private_key: PrivateKey::new(secret_key, network),
            public_key,
        }
    }

    pub fn public_key(&self) -> &CompressedPublicKey {
        &self.public_key
    }

    pub fn secret_key(&self) -> SecretKey {
        self.private_key.inner
    }

    /// The P2WPKH program `OP_0 <HASH160(pubkey)>`. For nested SegWit this
    /// doubles as the redeem script behind the P2SH output.
    pub fn witness_program(&self) -> ScriptBuf {
        ScriptBuf::new_p2wpkh(&self.public_key.wpubkey_hash())
    }

    /// The redeem script revealed in the script_sig of nested-SegWit spends.
    pub fn redeem_script(&self) -> Option<ScriptBuf> {
        match self.script_type {
            ScriptType::NestedSegwit => Some(self.witness_program()),
            ScriptType::NativeSegwit => None,
        }
    }

    /// The script this leaf's payments are locked to on chain.
    pub fn script_pubkey(&self) -> ScriptBuf {
        match self.script_type {
            ScriptType::NativeSegwit => self.witness_program(),
            ScriptType::NestedSegwit => {
                ScriptBuf::new_p2sh(&self.witness_program().script_hash())
            }
        }
    }

    pub fn address(&self) -> Address {
        match self.script_type {
            ScriptType::NativeSegwit => {
                Address::p2wpkh(&self.public_key, bitcoin::Network::from(self.network))
            }
            ScriptType::NestedSegwit => Address::p2shwpkh(&self.public_key, self.network),
        }
    }

    pub fn electrum_scripthash(&self) -> String {
        electrum_scripthash(&self.script_pubkey())
    }

    pub fn wif(&self) -> String {
        self.private_key.to_wif()
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::bip32::Xpriv;

    use super::*;

    // The BIP32 master node for the seed bytes b"CORRECT HORSE BATTERY STAPLE".
    fn chbs_leaf(script_type: ScriptType) -> LeafKey {
        let secp = Secp256k1::new();
        let master =
            Xpriv::new_master(bitcoin::Network::Bitcoin, b"CORRECT HORSE BATTERY STAPLE").unwrap();
        LeafKey::from_secret_key(&secp, master.private_key, Network::Bitcoin, script_type)
    }

    #[test]
    fn witness_program_bytes() {
        let leaf = chbs_leaf(ScriptType::NestedSegwit);
        assert_eq!(
            leaf.witness_program().as_bytes(),
            hex::decode("0014e5bac166bd5b9f6204b1b43fb3c621997164c7fe").unwrap()
        );
    }

    #[test]
    fn nested_segwit_address() {
        let leaf = chbs_leaf(ScriptType::NestedSegwit);
        assert_eq!(leaf.address().to_string(), "38G7CQfoej3fZQbHHey7Z1XPUGpVpJv4em");
    }

    #[test]
    fn native_segwit_address() {
        let leaf = chbs_leaf(ScriptType::NativeSegwit);
        assert_eq!(
            leaf.address().to_string(),
            "bc1qukavze4atw0kyp93kslm833pn9ckf3l7unlwjg"
        );
    }

    #[test]
    fn electrum_scripthash_is_reversed_sha256_of_output_script() {
        let nested = chbs_leaf(ScriptType::NestedSegwit);
        assert_eq!(
            nested.electrum_scripthash(),
            "41d8dc340e750287f1ef920956e1f9ae8a724efa9bb3772352118fe26372be97"
        );

        let native = chbs_leaf(ScriptType::NativeSegwit);
        assert_eq!(
            native.electrum_scripthash(),
            "50d9be99411f704638f65892106f322a1b040ec3c70a9652fd3d3fe26f314d51"
        );
    }

    #[test]
    fn addresses_parse_back_to_the_same_script() {
        for script_type in [ScriptType::NestedSegwit, ScriptType::NativeSegwit] {
            let leaf = chbs_leaf(script_type);
            let parsed = Address::from_str(&leaf.address().to_string())
                .unwrap()
                .require_network(bitcoin::Network::Bitcoin)
                .unwrap();
            assert_eq!(parsed.script_pubkey(), leaf.script_pubkey());
        }
    }

    #[test]
    fn wif_round_trips() {
        let leaf = chbs_leaf(ScriptType::NestedSegwit);
        let recovered = PrivateKey::from_wif(&leaf.wif()).unwrap();
        assert_eq!(recovered.inner, leaf.secret_key());
        assert!(recovered.compressed);
    }
}
