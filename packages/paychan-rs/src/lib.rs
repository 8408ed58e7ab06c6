//! PayChan-RS: Shared Payment-Channel Library for the Settlement Connector
//!
//! This crate provides the pieces shared between the connector daemon and its
//! test harnesses:
//!
//! - **Types** - Chain tags, channel identifiers, on-chain state snapshots
//! - **Balance Proof Codec** - Typed-data hashing, signing and recovery of
//!   off-chain balance and withdraw proofs, peer wire encoding
//! - **EVM Module** - Channel contract bindings, transaction client, event watcher
//! - **XRP Module** - PayChannel client over rippled JSON-RPC, claim signing
//! - **Signer Service** - Deterministic per-(agent, chain) signers from a master seed
//! - **Telemetry** - Typed lifecycle events and a non-blocking bus
//! - **Testing Module** - Mock ledger adapter for integration tests
//!
//! ## Feature Flags
//!
//! - `evm` - Enable EVM chain support (default)
//! - `xrp` - Enable XRP Ledger support (default)
//! - `testing` - Enable the mock ledger and test assertions
//! - `full` - Enable all features

// Core modules (always available)
pub mod adapter;
pub mod error;
pub mod proof;
pub mod signer;
pub mod telemetry;
pub mod types;

// Chain-specific modules (feature-gated)
#[cfg(feature = "evm")]
pub mod evm;

#[cfg(feature = "xrp")]
pub mod xrp;

// Testing utilities (feature-gated)
#[cfg(feature = "testing")]
pub mod testing;

// Re-export commonly used items at the crate root
pub use adapter::{ChannelEvent, ConfirmedTx, Ledger, LedgerAdapter};
pub use error::{normalize_ledger_error, ChannelError};
pub use proof::{
    decode_proof_message, encode_proof_message, proof_digest, recover_balance_proof,
    recover_withdraw_proof, sign_balance_proof, sign_withdraw_proof, verify_proof_signature,
    BalanceProof, ProofDomain, SignedBalanceProof, WithdrawProof,
};
pub use signer::{SignerHandle, SignerService};
pub use telemetry::{TelemetryBus, TelemetryEvent};
pub use types::{
    ChainTag, ChannelId, ChannelState, OnChainChannelState, ParticipantState, SettlementPhase,
    TokenId, MAX_SETTLEMENT_TIMEOUT_SECS, MIN_SETTLEMENT_TIMEOUT_SECS,
};
