#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// Note: amounts are stored as TEXT decimal strings. The database never does
// arithmetic on them; parsing back to U256 happens at the single parse point
// in paychan_rs::types.

/// A channel row from the store
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ChannelRow {
    pub agent_id: String,
    pub channel_id: String,
    pub chain: String,
    pub token: String,
    pub peer_id: String,
    pub opened_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl ChannelRow {
    /// A channel is active iff it has not been closed
    pub fn is_active(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// For inserting new channels
#[derive(Debug, Clone)]
pub struct NewChannel {
    pub agent_id: String,
    pub channel_id: String,
    pub chain: String,
    pub token: String,
    pub peer_id: String,
    pub opened_at: DateTime<Utc>,
}

/// Latest signed balance proof for a channel, per direction
#[derive(Debug, Clone, FromRow)]
pub struct ProofRow {
    pub channel_id: String,
    /// 'sent' (our signature) or 'received' (counterparty's signature)
    pub direction: String,
    pub nonce: i64,
    pub transferred_amount: String,
    pub locked_amount: String,
    pub locks_root: String,
    pub signature: String,
    pub updated_at: DateTime<Utc>,
}

/// For upserting proofs
#[derive(Debug, Clone)]
pub struct NewProof {
    pub channel_id: String,
    pub direction: String,
    pub nonce: i64,
    pub transferred_amount: String,
    pub locked_amount: String,
    pub locks_root: String,
    pub signature: String,
}

/// Archived wallet record
#[derive(Debug, Clone, FromRow)]
pub struct WalletArchiveRow {
    pub agent_id: String,
    pub archived_at: DateTime<Utc>,
    pub total_transactions: i64,
    pub suspension_reason: Option<String>,
}
