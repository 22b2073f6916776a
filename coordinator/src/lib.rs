//! Cross-chain atomic swap coordination for UTXO networks
//!
//! The coordinator core: an order book with OHLCV history, a UTXO
//! reservation ledger, the coordinator exchange state, and the swap driver
//! that sequences hash-time-locked contracts across two chains. Chain
//! adapters and the peer transport are consumed through narrow interfaces
//! ([`wallet::WalletConnector`] and a broadcast channel of
//! [`protocol::SwapMessage`]); everything else lives here.

pub mod amount;
pub mod config;
pub mod driver;
pub mod error;
pub mod exchange;
pub mod metrics;
pub mod order;
pub mod protocol;
pub mod rpc;
pub mod trading;
pub mod utxo;
pub mod wallet;

pub use error::{CoordinatorError, CoordinatorResult};
