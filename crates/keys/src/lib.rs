//! Key material for the umbra wallet.
//!
//! This crate turns the two user-supplied strings into a BIP32 hierarchy:
//! the split-XOR warpwallet KDF produces a 512-bit master seed, from which
//! per-account extended keys and per-index SegWit leaf keys are derived.
//! Nothing in here is ever persisted.

pub mod address;
pub mod error;
pub mod hierarchy;
pub mod kdf;

pub use address::{electrum_scripthash, LeafKey};
pub use hierarchy::AccountKeys;
pub use kdf::{derive_secret, derive_seed, MasterSeed};

// Type alias for common result type
type Result<T> = std::result::Result<T, error::Error>;
