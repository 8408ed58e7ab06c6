//! Wallet lifecycle authority: the single gate every mutating channel
//! operation passes through.
//!
//! State machine per agent: PENDING → ACTIVE ⇄ SUSPENDED, with ARCHIVED
//! terminal. Archived records leave the active set but stay retrievable
//! through the archive table.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use alloy::primitives::U256;
use chrono::{DateTime, Utc};
use eyre::{eyre, Result};
use sqlx::SqlitePool;
use tracing::info;

use paychan_rs::telemetry::{TelemetryBus, TelemetryEvent};

/// Lifecycle state of an agent wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletState {
    Pending,
    Active,
    Suspended,
    Archived,
}

impl WalletState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WalletState::Pending => "PENDING",
            WalletState::Active => "ACTIVE",
            WalletState::Suspended => "SUSPENDED",
            WalletState::Archived => "ARCHIVED",
        }
    }
}

impl std::fmt::Display for WalletState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-agent lifecycle record
#[derive(Debug, Clone)]
pub struct WalletRecord {
    pub agent_id: String,
    pub state: WalletState,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub total_transactions: u64,
    /// Cumulative transacted volume per token
    pub volume_by_token: HashMap<String, U256>,
    pub suspension_reason: Option<String>,
}

impl WalletRecord {
    fn new(agent_id: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            state: WalletState::Pending,
            created_at: Utc::now(),
            activated_at: None,
            last_activity: None,
            total_transactions: 0,
            volume_by_token: HashMap::new(),
            suspension_reason: None,
        }
    }
}

/// The lifecycle authority. `get_state` is the synchronous predicate the
/// channel manager queries before every mutating operation.
pub struct WalletLifecycle {
    wallets: RwLock<HashMap<String, WalletRecord>>,
    pool: SqlitePool,
    telemetry: TelemetryBus,
}

impl WalletLifecycle {
    pub fn new(pool: SqlitePool, telemetry: TelemetryBus) -> Self {
        Self {
            wallets: RwLock::new(HashMap::new()),
            pool,
            telemetry,
        }
    }

    /// Current state; `None` for unknown agents
    pub fn get_state(&self, agent_id: &str) -> Option<WalletState> {
        self.wallets
            .read()
            .unwrap()
            .get(agent_id)
            .map(|w| w.state)
    }

    /// Full record snapshot
    pub fn get_record(&self, agent_id: &str) -> Option<WalletRecord> {
        self.wallets.read().unwrap().get(agent_id).cloned()
    }

    /// Create a wallet in PENDING
    pub fn create_wallet(&self, agent_id: &str) -> Result<()> {
        let mut wallets = self.wallets.write().unwrap();
        if wallets.contains_key(agent_id) {
            return Err(eyre!("Wallet for agent {} already exists", agent_id));
        }
        wallets.insert(agent_id.to_string(), WalletRecord::new(agent_id));
        drop(wallets);

        info!(agent_id, "Wallet created");
        self.emit_transition(agent_id, None, WalletState::Pending, None);
        Ok(())
    }

    /// PENDING → ACTIVE, once initial funding is confirmed
    pub fn confirm_funding(&self, agent_id: &str) -> Result<()> {
        self.transition(agent_id, &[WalletState::Pending], WalletState::Active, None)?;
        let mut wallets = self.wallets.write().unwrap();
        if let Some(wallet) = wallets.get_mut(agent_id) {
            wallet.activated_at = Some(Utc::now());
        }
        Ok(())
    }

    /// ACTIVE → SUSPENDED
    pub fn suspend(&self, agent_id: &str, reason: &str) -> Result<()> {
        self.transition(
            agent_id,
            &[WalletState::Active],
            WalletState::Suspended,
            Some(reason.to_string()),
        )
    }

    /// SUSPENDED → ACTIVE
    pub fn reactivate(&self, agent_id: &str) -> Result<()> {
        self.transition(agent_id, &[WalletState::Suspended], WalletState::Active, None)?;
        let mut wallets = self.wallets.write().unwrap();
        if let Some(wallet) = wallets.get_mut(agent_id) {
            wallet.suspension_reason = None;
        }
        Ok(())
    }

    /// ACTIVE|SUSPENDED → ARCHIVED (terminal). Removes the agent from the
    /// active set and persists an archive record retrievable later.
    pub async fn archive(&self, agent_id: &str) -> Result<()> {
        let record = {
            let mut wallets = self.wallets.write().unwrap();
            let wallet = wallets
                .get_mut(agent_id)
                .ok_or_else(|| eyre!("Unknown agent {}", agent_id))?;
            if !matches!(wallet.state, WalletState::Active | WalletState::Suspended) {
                return Err(eyre!(
                    "Cannot archive agent {} from state {}",
                    agent_id,
                    wallet.state
                ));
            }
            let previous = wallet.state;
            wallet.state = WalletState::Archived;
            let record = wallet.clone();
            wallets.remove(agent_id);
            (previous, record)
        };
        let (previous, record) = record;

        // Store write precedes any external observation of the archive
        crate::db::insert_wallet_archive(
            &self.pool,
            agent_id,
            record.total_transactions as i64,
            record.suspension_reason.as_deref(),
        )
        .await?;

        info!(agent_id, "Wallet archived");
        self.emit_transition(agent_id, Some(previous), WalletState::Archived, None);
        Ok(())
    }

    /// Retrieve an archived wallet record
    pub async fn get_archived(&self, agent_id: &str) -> Result<Option<crate::db::WalletArchiveRow>> {
        crate::db::get_wallet_archive(&self.pool, agent_id).await
    }

    /// Record one wallet-activity unit: bumps counters, last-activity and
    /// the per-token cumulative volume.
    pub fn record_transaction(&self, agent_id: &str, token: &str, amount: U256) {
        let mut wallets = self.wallets.write().unwrap();
        if let Some(wallet) = wallets.get_mut(agent_id) {
            wallet.total_transactions += 1;
            wallet.last_activity = Some(Utc::now());
            let volume = wallet
                .volume_by_token
                .entry(token.to_string())
                .or_insert(U256::ZERO);
            *volume = volume.saturating_add(amount);
        }
    }

    fn transition(
        &self,
        agent_id: &str,
        from: &[WalletState],
        to: WalletState,
        reason: Option<String>,
    ) -> Result<()> {
        let previous = {
            let mut wallets = self.wallets.write().unwrap();
            let wallet = wallets
                .get_mut(agent_id)
                .ok_or_else(|| eyre!("Unknown agent {}", agent_id))?;
            if !from.contains(&wallet.state) {
                return Err(eyre!(
                    "Invalid transition for agent {}: {} -> {}",
                    agent_id,
                    wallet.state,
                    to
                ));
            }
            let previous = wallet.state;
            wallet.state = to;
            wallet.suspension_reason = reason.clone();
            previous
        };

        info!(agent_id, from = %previous, to = %to, "Wallet state changed");
        self.emit_transition(agent_id, Some(previous), to, reason);
        Ok(())
    }

    fn emit_transition(
        &self,
        agent_id: &str,
        previous: Option<WalletState>,
        new_state: WalletState,
        reason: Option<String>,
    ) {
        self.telemetry.publish(TelemetryEvent::AgentWalletStateChanged {
            agent_id: agent_id.to_string(),
            previous_state: previous.map(|s| s.as_str().to_string()).unwrap_or_default(),
            new_state: new_state.as_str().to_string(),
            reason,
        });
    }
}
