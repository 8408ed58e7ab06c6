//! Common types for the payment-channel subsystem
//!
//! Shared between the connector daemon, the ledger adapters and the test
//! harnesses.

#![allow(dead_code)]

use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use alloy::primitives::U256;

/// Lower bound the channel contract accepts for `settlement_timeout` (6 hours).
pub const MIN_SETTLEMENT_TIMEOUT_SECS: u64 = 6 * 60 * 60;

/// Upper bound the channel contract accepts for `settlement_timeout` (30 days).
pub const MAX_SETTLEMENT_TIMEOUT_SECS: u64 = 30 * 24 * 60 * 60;

// ============================================================================
// Chain tag
// ============================================================================

/// The chain families a channel can live on.
///
/// This is a closed sum: the connector routes every channel operation through
/// exactly one of these two ledger adapters. New chains are a code change,
/// not a plug-in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainTag {
    Evm,
    Xrp,
}

impl ChainTag {
    /// Get the tag as a lowercase string (DB and telemetry representation)
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainTag::Evm => "evm",
            ChainTag::Xrp => "xrp",
        }
    }

    /// Parse from the lowercase string representation
    pub fn from_str_tag(s: &str) -> Result<Self> {
        match s {
            "evm" => Ok(ChainTag::Evm),
            "xrp" => Ok(ChainTag::Xrp),
            other => Err(eyre!("Unknown chain tag: {}", other)),
        }
    }
}

impl fmt::Display for ChainTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Channel identifier
// ============================================================================

/// Chain-native channel identifier (32 bytes on both supported families).
///
/// EVM channels derive it from the participant pair; XRP channels get it
/// assigned by the ledger (SHA-512Half of the create transaction's account
/// and sequence).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub [u8; 32]);

impl ChannelId {
    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        ChannelId(bytes)
    }

    /// Convert to hex string with 0x prefix
    pub fn to_hex(&self) -> String {
        format!("0x{}", hex::encode(self.0))
    }

    /// Create from hex string (with or without 0x prefix)
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(eyre!("ChannelId must be 32 bytes, got {}", bytes.len()));
        }
        let mut result = [0u8; 32];
        result.copy_from_slice(&bytes);
        Ok(ChannelId(result))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 32]> for ChannelId {
    fn from(bytes: [u8; 32]) -> Self {
        ChannelId(bytes)
    }
}

// ============================================================================
// Token identifier
// ============================================================================

/// Token a channel is denominated in.
///
/// `Native` is the chain's own asset (ETH, XRP). `Erc20` carries the 20-byte
/// token contract address and only occurs on EVM channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenId {
    Native,
    Erc20([u8; 20]),
}

impl TokenId {
    /// DB and telemetry representation: "native" or the 0x-prefixed address
    pub fn encode(&self) -> String {
        match self {
            TokenId::Native => "native".to_string(),
            TokenId::Erc20(addr) => format!("0x{}", hex::encode(addr)),
        }
    }

    /// Parse the DB representation back
    pub fn decode(s: &str) -> Result<Self> {
        if s == "native" {
            return Ok(TokenId::Native);
        }
        let raw = s.strip_prefix("0x").unwrap_or(s);
        let bytes = hex::decode(raw)?;
        if bytes.len() != 20 {
            return Err(eyre!("Token address must be 20 bytes, got {}", bytes.len()));
        }
        let mut addr = [0u8; 20];
        addr.copy_from_slice(&bytes);
        Ok(TokenId::Erc20(addr))
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.encode())
    }
}

// ============================================================================
// On-chain channel state
// ============================================================================

/// Settlement phase the ledger believes a channel is in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SettlementPhase {
    /// Channel open, payments flowing
    Open,
    /// Unilateral close submitted, challenge period running
    ClosedChallenge,
    /// Final payout done
    Settled,
}

impl SettlementPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementPhase::Open => "open",
            SettlementPhase::ClosedChallenge => "closed_challenge",
            SettlementPhase::Settled => "settled",
        }
    }
}

impl fmt::Display for SettlementPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-participant slice of the on-chain channel state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParticipantState {
    /// Cumulative deposit the ledger has pulled from this participant
    pub total_deposit: U256,
    /// Cumulative amount withdrawn without closing
    pub total_withdrawn: U256,
    /// Cumulative transferred amount the ledger has seen (from close/update)
    pub transferred: U256,
    /// Highest nonce the ledger has seen for this participant
    pub nonce: u64,
}

/// Materialized view of what the ledger believes about a channel.
///
/// Used for rebalance decisions, dispute detection and startup
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnChainChannelState {
    pub channel_id: ChannelId,
    pub phase: SettlementPhase,
    /// Our side of the channel
    pub own: ParticipantState,
    /// The counterparty's side
    pub partner: ParticipantState,
    /// Challenge deadline (unix seconds) when phase is ClosedChallenge
    pub challenge_deadline: Option<u64>,
}

impl OnChainChannelState {
    /// Remaining spendable balance on our side: deposit − withdrawn − transferred,
    /// clamped at zero.
    pub fn own_remaining(&self) -> U256 {
        self.own
            .total_deposit
            .saturating_sub(self.own.total_withdrawn)
            .saturating_sub(self.own.transferred)
    }
}

/// Lifecycle state of a channel from the manager's perspective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// On-chain open confirmed, payments allowed
    Active,
    /// Unilateral close in flight, waiting out the challenge period
    Challenge,
    /// Terminal: settled on-chain
    Settled,
}

impl ChannelState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelState::Active => "active",
            ChannelState::Challenge => "challenge",
            ChannelState::Settled => "settled",
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Amount helpers
// ============================================================================

/// Parse a decimal-string amount into U256.
///
/// Decimal strings are the only amount representation allowed across process
/// boundaries (telemetry, wire, DB); this is the single parse point.
pub fn parse_amount(s: &str) -> Result<U256> {
    U256::from_str_radix(s.trim(), 10).map_err(|e| eyre!("Invalid decimal amount {:?}: {}", s, e))
}

/// Convert a U256 amount into the XRP drops representation.
///
/// Fails loudly on truncation; silent narrowing of an amount is never
/// acceptable.
pub fn amount_to_drops(amount: U256) -> Result<u64> {
    u64::try_from(amount).map_err(|_| eyre!("Amount {} does not fit in XRP drops (u64)", amount))
}
