//! Split-XOR warpwallet key stretching.
//!
//! Both halves of each input feed both KDFs, but with complementary nibble
//! masks, so leaking one KDF's inputs does not reveal the other's. The XOR
//! binds them: compromising either algorithm alone yields no material.
//! scrypt at N = 2^18 takes multiple seconds on purpose; callers must run
//! this off the async executor.

use std::time::Instant;

use scrypt::Params as ScryptParams;
use sha2::Sha256;

use crate::{error::Error, Result};

pub const SCRYPT_LOG_N: u8 = 18;
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;
pub const PBKDF2_ROUNDS: u32 = 1 << 16;

/// The 64-byte master seed: left half is the secret exponent of the BIP32
/// master node, right half its chain code.
#[derive(Clone, PartialEq, Eq)]
pub struct MasterSeed {
    pub secret_exponent: [u8; 32],
    pub chain_code: [u8; 32],
}

impl std::fmt::Debug for MasterSeed {
    // Never print key material, not even in debug logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("MasterSeed(..)")
    }
}

/// Splits each byte into its high and low nibble streams.
pub fn and_split(bytes: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut hi = Vec::with_capacity(bytes.len());
    let mut lo = Vec::with_capacity(bytes.len());
    for byte in bytes {
        hi.push(byte & 0xF0);
        lo.push(byte & 0x0F);
    }
    (hi, lo)
}

/// Byte-wise XOR of two equal-length strings. A length mismatch is a
/// programmer error surfaced as [`Error::LengthMismatch`].
pub fn xor_merge(left: &[u8], right: &[u8]) -> Result<Vec<u8>> {
    if left.len() != right.len() {
        return Err(Error::LengthMismatch {
            left: left.len(),
            right: right.len(),
        });
    }
    Ok(left.iter().zip(right.iter()).map(|(a, b)| a ^ b).collect())
}

fn stretch(salt: &str, passphrase: &str, key_length: usize) -> Result<Vec<u8>> {
    let (salt_hi, salt_lo) = and_split(salt.as_bytes());
    let (pass_hi, pass_lo) = and_split(passphrase.as_bytes());

    let params =
        ScryptParams::new(SCRYPT_LOG_N, SCRYPT_R, SCRYPT_P, key_length).map_err(|_| Error::KdfParams)?;
    let mut scrypt_key = vec![0u8; key_length];
    scrypt::scrypt(&pass_hi, &salt_hi, &params, &mut scrypt_key).map_err(|_| Error::KdfParams)?;

    let mut pbkdf2_key = vec![0u8; key_length];
    pbkdf2::pbkdf2_hmac::<Sha256>(&pass_lo, &salt_lo, PBKDF2_ROUNDS, &mut pbkdf2_key);

    xor_merge(&scrypt_key, &pbkdf2_key)
}

/// Derives the 64-byte hierarchical master seed from (salt, passphrase).
pub fn derive_seed(salt: &str, passphrase: &str) -> Result<MasterSeed> {
    let started = Instant::now();
    let merged = stretch(salt, passphrase, 64)?;

    let mut secret_exponent = [0u8; 32];
    let mut chain_code = [0u8; 32];
    secret_exponent.copy_from_slice(&merged[..32]);
    chain_code.copy_from_slice(&merged[32..]);

    log::info!(
        "Key derivation completed in {:.3} seconds",
        started.elapsed().as_secs_f64()
    );
    Ok(MasterSeed {
        secret_exponent,
        chain_code,
    })
}

/// Derives a single 256-bit secret from (salt, passphrase), for non-HD use.
pub fn derive_secret(salt: &str, passphrase: &str) -> Result<[u8; 32]> {
    let merged = stretch(salt, passphrase, 32)?;
    let mut secret = [0u8; 32];
    secret.copy_from_slice(&merged);
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn and_split_separates_nibbles() {
        let (hi, lo) = and_split(b"\xff\xff\xff\xff");
        assert_eq!(hi, b"\xf0\xf0\xf0\xf0");
        assert_eq!(lo, b"\x0f\x0f\x0f\x0f");
    }

    #[test]
    fn xor_merge_recombines() {
        let merged = xor_merge(b"\xf0\xf0\xf0\xf0", b"\x0f\x0f\x0f\x0f").unwrap();
        assert_eq!(merged, b"\xff\xff\xff\xff");
    }

    #[test]
    fn xor_merge_rejects_length_mismatch() {
        assert!(matches!(
            xor_merge(b"\x00", b"\x00\x00"),
            Err(Error::LengthMismatch { left: 1, right: 2 })
        ));
    }

    #[test]
    fn derive_seed_golden_vector() {
        let seed = derive_seed("test", "CORRECT HORSE BATTERY STAPLE").unwrap();
        assert_eq!(
            hex::encode(seed.secret_exponent),
            "4ecea260f05d78edaab017d4a188149532f72895827cc57c2e520b4b4fe1c70f"
        );
        assert_eq!(
            hex::encode(seed.chain_code),
            "5e49a36bf36a4fd325d38198f91fb4013ad45414dc0de616506e399f166b5257"
        );

        // The non-HD form is the prefix of the same stretched material.
        let secret = derive_secret("test", "CORRECT HORSE BATTERY STAPLE").unwrap();
        assert_eq!(secret, seed.secret_exponent);
    }
}
