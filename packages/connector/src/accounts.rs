//! Account manager: bilateral double-entry balances per (peer, token).
//!
//! Packet effects and settlement effects apply atomically under the account
//! map lock; credit limits are enforced before any mutation. Every mutation
//! emits an `ACCOUNT_BALANCE` telemetry event carrying the account's current
//! settlement state.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Mutex;

use alloy::primitives::U256;
use tracing::{debug, info};

use paychan_rs::error::ChannelError;
use paychan_rs::telemetry::{TelemetryBus, TelemetryEvent};

use crate::settlement::SettlementTracker;

/// Key of a bilateral account
pub type AccountKey = (String, String);

/// Per-(peer, token) double-entry record
#[derive(Debug, Clone, Default)]
pub struct Account {
    /// What the peer owes us (they consumed our liquidity)
    pub debit_balance: U256,
    /// What we owe the peer
    pub credit_balance: U256,
    /// Hard cap on credit_balance, when set
    pub credit_limit: Option<U256>,
}

/// Bilateral account balances across all peers
pub struct AccountManager {
    accounts: Mutex<HashMap<AccountKey, Account>>,
    telemetry: TelemetryBus,
    tracker: SettlementTracker,
}

impl AccountManager {
    pub fn new(telemetry: TelemetryBus, tracker: SettlementTracker) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            telemetry,
            tracker,
        }
    }

    /// Set (or clear) the credit limit for an account
    pub fn set_credit_limit(&self, peer_id: &str, token: &str, limit: Option<U256>) {
        let mut accounts = self.accounts.lock().unwrap();
        let account = accounts
            .entry((peer_id.to_string(), token.to_string()))
            .or_default();
        account.credit_limit = limit;
    }

    /// Snapshot of (debit, credit) for an account
    pub fn balances(&self, peer_id: &str, token: &str) -> (U256, U256) {
        let accounts = self.accounts.lock().unwrap();
        match accounts.get(&(peer_id.to_string(), token.to_string())) {
            Some(account) => (account.debit_balance, account.credit_balance),
            None => (U256::ZERO, U256::ZERO),
        }
    }

    /// Apply the balance effects of a forwarded packet atomically.
    ///
    /// Fails with `CreditLimitExceeded` (leaving balances untouched) when
    /// the credit delta would push the account past its limit.
    pub fn record_packet_transfers(
        &self,
        peer_id: &str,
        token: &str,
        debit_delta: U256,
        credit_delta: U256,
    ) -> Result<(), ChannelError> {
        let snapshot = {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts
                .entry((peer_id.to_string(), token.to_string()))
                .or_default();

            if let Some(limit) = account.credit_limit {
                let next_credit = account.credit_balance.saturating_add(credit_delta);
                if next_credit > limit {
                    return Err(ChannelError::CreditLimitExceeded {
                        peer_id: peer_id.to_string(),
                        balance: account.credit_balance.to_string(),
                        delta: credit_delta.to_string(),
                        limit: limit.to_string(),
                    });
                }
            }

            account.debit_balance = account.debit_balance.saturating_add(debit_delta);
            account.credit_balance = account.credit_balance.saturating_add(credit_delta);
            account.clone()
        };

        debug!(
            peer_id,
            token,
            debit = %snapshot.debit_balance,
            credit = %snapshot.credit_balance,
            "Packet transfers recorded"
        );
        self.emit_balance(peer_id, token, &snapshot);
        Ok(())
    }

    /// Apply a completed settlement: reduces what we owe the peer, clamped
    /// at zero. Returns (prior, new) credit balance.
    pub fn record_settlement(
        &self,
        peer_id: &str,
        token: &str,
        settled_amount: U256,
    ) -> (U256, U256) {
        let (prior, snapshot) = {
            let mut accounts = self.accounts.lock().unwrap();
            let account = accounts
                .entry((peer_id.to_string(), token.to_string()))
                .or_default();
            let prior = account.credit_balance;
            account.credit_balance = account.credit_balance.saturating_sub(settled_amount);
            (prior, account.clone())
        };

        info!(
            peer_id,
            token,
            settled = %settled_amount,
            prior = %prior,
            new = %snapshot.credit_balance,
            "Settlement recorded"
        );
        self.emit_balance(peer_id, token, &snapshot);
        (prior, snapshot.credit_balance)
    }

    fn emit_balance(&self, peer_id: &str, token: &str, account: &Account) {
        let net = if account.debit_balance >= account.credit_balance {
            (account.debit_balance - account.credit_balance).to_string()
        } else {
            format!("-{}", account.credit_balance - account.debit_balance)
        };

        self.telemetry.publish(TelemetryEvent::AccountBalance {
            peer_id: peer_id.to_string(),
            token: token.to_string(),
            debit_balance: account.debit_balance.to_string(),
            credit_balance: account.credit_balance.to_string(),
            net_balance: net,
            settlement_state: self.tracker.state(peer_id, token).as_str().to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> (AccountManager, TelemetryBus) {
        let bus = TelemetryBus::new();
        let tracker = SettlementTracker::new();
        (AccountManager::new(bus.clone(), tracker), bus)
    }

    #[test]
    fn test_packet_transfers_accumulate() {
        let (manager, _bus) = manager();

        manager
            .record_packet_transfers("agent-002", "native", U256::from(100u64), U256::ZERO)
            .unwrap();
        manager
            .record_packet_transfers("agent-002", "native", U256::from(50u64), U256::from(20u64))
            .unwrap();

        let (debit, credit) = manager.balances("agent-002", "native");
        assert_eq!(debit, U256::from(150u64));
        assert_eq!(credit, U256::from(20u64));
    }

    #[test]
    fn test_accounts_are_isolated_per_token() {
        let (manager, _bus) = manager();

        manager
            .record_packet_transfers("agent-002", "native", U256::from(100u64), U256::ZERO)
            .unwrap();
        let (debit, _) = manager.balances("agent-002", "0xtoken");
        assert_eq!(debit, U256::ZERO);
    }

    #[test]
    fn test_credit_limit_breach_leaves_balances_unchanged() {
        let (manager, bus) = manager();
        let mut rx = bus.subscribe();

        manager.set_credit_limit("agent-002", "native", Some(U256::from(10_000u64)));
        manager
            .record_packet_transfers("agent-002", "native", U256::ZERO, U256::from(9_500u64))
            .unwrap();
        // Drain the successful mutation's event
        let _ = rx.try_recv().unwrap();

        let err = manager
            .record_packet_transfers("agent-002", "native", U256::ZERO, U256::from(600u64))
            .unwrap_err();
        assert!(matches!(err, ChannelError::CreditLimitExceeded { .. }));

        let (_, credit) = manager.balances("agent-002", "native");
        assert_eq!(credit, U256::from(9_500u64));

        // No event was emitted for the failed mutation
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_credit_exactly_at_limit_is_allowed() {
        let (manager, _bus) = manager();

        manager.set_credit_limit("agent-002", "native", Some(U256::from(10_000u64)));
        manager
            .record_packet_transfers("agent-002", "native", U256::ZERO, U256::from(10_000u64))
            .unwrap();

        let (_, credit) = manager.balances("agent-002", "native");
        assert_eq!(credit, U256::from(10_000u64));
    }

    #[test]
    fn test_settlement_clamps_at_zero() {
        let (manager, _bus) = manager();

        manager
            .record_packet_transfers("agent-002", "native", U256::ZERO, U256::from(500u64))
            .unwrap();
        let (prior, new) = manager.record_settlement("agent-002", "native", U256::from(800u64));
        assert_eq!(prior, U256::from(500u64));
        assert_eq!(new, U256::ZERO);
    }

    #[test]
    fn test_balance_event_carries_negative_net() {
        let (manager, bus) = manager();
        let mut rx = bus.subscribe();

        manager
            .record_packet_transfers("agent-002", "native", U256::from(100u64), U256::from(300u64))
            .unwrap();

        match rx.try_recv().unwrap() {
            TelemetryEvent::AccountBalance { net_balance, settlement_state, .. } => {
                assert_eq!(net_balance, "-200");
                assert_eq!(settlement_state, "IDLE");
            }
            other => panic!("expected AccountBalance, got {:?}", other),
        }
    }
}
