//! Error kinds for the payment-channel subsystem
//!
//! Every fallible operation in the library and the connector returns one of
//! these structured kinds; no unwinding for expected flow.

use thiserror::Error;

use crate::types::ChainTag;

/// Structured errors surfaced by channel operations.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The agent's wallet is not in the ACTIVE lifecycle state
    #[error("wallet for agent {agent_id} is not active (state: {state})")]
    WalletNotActive { agent_id: String, state: String },

    /// No on-chain address known for the peer on the requested chain
    #[error("no {chain} address known for peer {peer_id}")]
    PeerUnknown { peer_id: String, chain: ChainTag },

    /// Channel absent from cache and store
    #[error("channel {0} not found")]
    ChannelNotFound(String),

    /// Signature did not recover to a channel participant
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// A proof arrived with a nonce at or below the highest accepted one
    #[error("nonce not monotonic: expected > {expected}, got {got}")]
    NonceNotMonotonic { expected: u64, got: u64 },

    /// transferred + locked would exceed the signer's deposit
    #[error("transferred amount {transferred} + locked {locked} exceeds deposit {deposit}")]
    TransferredExceedsDeposit {
        transferred: String,
        locked: String,
        deposit: String,
    },

    /// Account-manager credit limit would be breached
    #[error("credit limit exceeded for peer {peer_id}: balance {balance} + delta {delta} > limit {limit}")]
    CreditLimitExceeded {
        peer_id: String,
        balance: String,
        delta: String,
        limit: String,
    },

    /// On-chain execution reverted with a normalized reason
    #[error("ledger call reverted: {reason}")]
    Reverted { reason: String },

    /// An operation exceeded its per-call deadline; channel state unchanged
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The peer transport refused or failed to carry the message
    #[error("transport rejected: {reason}")]
    TransportRejected { reason: String },

    /// The peer acknowledged receipt but rejected the proof
    #[error("peer rejected balance proof: {reason}")]
    PeerRejected { reason: String },

    /// The ledger endpoint is unreachable or persistently erroring
    #[error("ledger unavailable: {0}")]
    LedgerUnavailable(String),

    /// Channel store or proof persistence failed
    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    /// Too many requests against a rate-limited resource
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// No ledger adapter configured for the chain
    #[error("unsupported chain: {0}")]
    Unsupported(ChainTag),

    /// An amount failed to fit the chain-native width (fatal, never silent)
    #[error("amount overflow: {0}")]
    AmountOverflow(String),

    /// Channel locked down after a reconciliation fault; no further sends
    /// until on-chain reconciliation resolves it
    #[error("channel {0} is quarantined pending reconciliation")]
    Quarantined(String),
}

impl ChannelError {
    /// Whether a higher layer may retry this operation as-is.
    ///
    /// Transient ledger conditions are retriable; everything else either
    /// requires new inputs or indicates a fault that must surface.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChannelError::Timeout(_)
                | ChannelError::LedgerUnavailable(_)
                | ChannelError::RateLimitExceeded(_)
        )
    }

    /// Whether this error quarantines the channel (reconciliation fault).
    pub fn is_reconciliation_fault(&self) -> bool {
        matches!(
            self,
            ChannelError::NonceNotMonotonic { .. } | ChannelError::TransferredExceedsDeposit { .. }
        )
    }
}

/// Normalize a raw ledger error string into a structured kind.
///
/// Revert reasons, RPC transport failures and node rate limits all arrive as
/// strings; this is the single mapping point for both chain families.
pub fn normalize_ledger_error(error: &str) -> ChannelError {
    let lower = error.to_lowercase();

    if lower.contains("timeout") || lower.contains("timed out") {
        return ChannelError::Timeout(error.to_string());
    }

    if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429")
    {
        return ChannelError::RateLimitExceeded(error.to_string());
    }

    if lower.contains("connection")
        || lower.contains("network")
        || lower.contains("503")
        || lower.contains("502")
        || lower.contains("temporarily unavailable")
        || lower.contains("nojsonrpc")
    {
        return ChannelError::LedgerUnavailable(error.to_string());
    }

    if lower.contains("invalid signature") || lower.contains("signature mismatch") {
        return ChannelError::InvalidSignature(error.to_string());
    }

    if lower.contains("reverted") || lower.contains("execution reverted") {
        let reason = extract_revert_reason(error);
        return ChannelError::Reverted { reason };
    }

    if lower.contains("insufficient funds") || lower.contains("insufficient balance") {
        return ChannelError::Reverted {
            reason: "InsufficientBalance".to_string(),
        };
    }

    ChannelError::LedgerUnavailable(error.to_string())
}

/// Pull the revert reason out of an RPC error string, normalized to the
/// contract's error identifiers where they are recognizable.
fn extract_revert_reason(error: &str) -> String {
    let lower = error.to_lowercase();
    for known in [
        "InvalidTimeout",
        "ChannelNotFound",
        "InvalidState",
        "SignatureMismatch",
        "TimeoutNotElapsed",
        "InsufficientBalance",
        "NonceMismatch",
        "DepositNotMonotonic",
    ] {
        if lower.contains(&known.to_lowercase()) {
            return known.to_string();
        }
    }
    // Fall back to whatever trails the "reverted" marker
    match error.split("reverted").nth(1) {
        Some(tail) => {
            let tail = tail.trim_start_matches([':', ' ']).trim();
            if tail.is_empty() {
                "Unknown".to_string()
            } else {
                tail.to_string()
            }
        }
        None => "Unknown".to_string(),
    }
}
