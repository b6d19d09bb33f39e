//! The wallet engine: live balance/UTXO/history state over an Electrum
//! subscription stream, gap-limit discovery, and transaction construction
//! with opt-in replace-by-fee.
//!
//! Nothing in this crate is persisted except, optionally, the cached server
//! list of [`registry::ServerRegistry`]. Keys come from `umbra-keys`, the
//! wire protocol from `umbra-electrum`.

pub mod error;
pub mod payment_link;
pub mod registry;
pub mod storage;
pub mod syncer;
pub mod transaction_builder;
pub mod wallet;

#[cfg(test)]
pub mod tests {
    pub mod utils;
}

pub use payment_link::PaymentUri;
pub use registry::{ServerEntry, ServerRegistry};
pub use storage::{HistoryItem, HistoryView, Spendable, SpendableView};
pub use syncer::GAP_LIMIT;
pub use transaction_builder::SpendDraft;
pub use wallet::Wallet;

// Type alias for common result type
type Result<T> = std::result::Result<T, error::Error>;
