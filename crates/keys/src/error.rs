use std::fmt::Debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Cannot merge byte strings of lengths {left} and {right}")]
    LengthMismatch { left: usize, right: usize },
    #[error("Key stretching parameters were rejected")]
    KdfParams,
    #[error("Derived secret exponent is not a valid secp256k1 scalar")]
    InvalidSecretExponent,
    #[error("An error related to BIP32 occured: \n\t{0}")]
    Bip32(#[from] bitcoin::bip32::Error),
}
