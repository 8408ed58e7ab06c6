//! Settlement monitor: turns account-balance telemetry into settlement
//! triggers for the channel manager.
//!
//! Per-account state machine: IDLE → SETTLEMENT_PENDING (threshold crossed,
//! trigger emitted) → SETTLEMENT_IN_PROGRESS (manager picked it up) → IDLE
//! (completed, success or not — retries are the rebalance loop's business).
//! At most one outstanding trigger per account; duplicates coalesce.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::U256;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use paychan_rs::telemetry::{TelemetryBus, TelemetryEvent};
use paychan_rs::types::parse_amount;

use crate::accounts::AccountKey;

/// Settlement state of one account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SettlementState {
    #[default]
    Idle,
    SettlementPending,
    SettlementInProgress,
}

impl SettlementState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementState::Idle => "IDLE",
            SettlementState::SettlementPending => "SETTLEMENT_PENDING",
            SettlementState::SettlementInProgress => "SETTLEMENT_IN_PROGRESS",
        }
    }
}

/// Shared settlement-state table. The monitor transitions it on triggers;
/// the channel manager transitions it around settlement work; the account
/// manager reads it into ACCOUNT_BALANCE events.
#[derive(Clone, Default)]
pub struct SettlementTracker {
    states: Arc<Mutex<HashMap<AccountKey, SettlementState>>>,
}

impl SettlementTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, peer_id: &str, token: &str) -> SettlementState {
        self.states
            .lock()
            .unwrap()
            .get(&(peer_id.to_string(), token.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// IDLE → SETTLEMENT_PENDING. Returns false (coalescing the trigger)
    /// when a settlement is already pending or running.
    pub fn try_trigger(&self, peer_id: &str, token: &str) -> bool {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry((peer_id.to_string(), token.to_string()))
            .or_default();
        if *state == SettlementState::Idle {
            *state = SettlementState::SettlementPending;
            true
        } else {
            false
        }
    }

    /// SETTLEMENT_PENDING → SETTLEMENT_IN_PROGRESS
    pub fn begin(&self, peer_id: &str, token: &str) -> bool {
        let mut states = self.states.lock().unwrap();
        let state = states
            .entry((peer_id.to_string(), token.to_string()))
            .or_default();
        if *state == SettlementState::SettlementPending {
            *state = SettlementState::SettlementInProgress;
            true
        } else {
            false
        }
    }

    /// Any state → IDLE (settlement finished, successfully or not)
    pub fn complete(&self, peer_id: &str, token: &str) {
        let mut states = self.states.lock().unwrap();
        states.insert(
            (peer_id.to_string(), token.to_string()),
            SettlementState::Idle,
        );
    }

    /// Startup recovery: every pending state resets to IDLE; the next
    /// balance event re-triggers if still above threshold.
    pub fn reset_all(&self) {
        self.states.lock().unwrap().clear();
    }
}

/// A threshold crossing handed to the channel manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementTrigger {
    pub peer_id: String,
    pub token: String,
    pub credit_balance: U256,
    pub threshold: U256,
    pub exceeds_by: U256,
}

/// Watches ACCOUNT_BALANCE events and emits settlement triggers
pub struct SettlementMonitor {
    telemetry: TelemetryBus,
    tracker: SettlementTracker,
    default_threshold: U256,
    /// Per-account threshold overrides
    thresholds: Mutex<HashMap<AccountKey, U256>>,
    trigger_tx: mpsc::Sender<SettlementTrigger>,
    /// Subscribed at construction so no balance event published between
    /// construction and `run` is lost
    events: Option<broadcast::Receiver<TelemetryEvent>>,
}

impl SettlementMonitor {
    pub fn new(
        telemetry: TelemetryBus,
        tracker: SettlementTracker,
        default_threshold: U256,
        trigger_tx: mpsc::Sender<SettlementTrigger>,
    ) -> Self {
        let events = Some(telemetry.subscribe());
        Self {
            telemetry,
            tracker,
            default_threshold,
            thresholds: Mutex::new(HashMap::new()),
            trigger_tx,
            events,
        }
    }

    /// Override the threshold for one account
    pub fn set_threshold(&self, peer_id: &str, token: &str, threshold: U256) {
        self.thresholds
            .lock()
            .unwrap()
            .insert((peer_id.to_string(), token.to_string()), threshold);
    }

    fn threshold_for(&self, peer_id: &str, token: &str) -> U256 {
        self.thresholds
            .lock()
            .unwrap()
            .get(&(peer_id.to_string(), token.to_string()))
            .copied()
            .unwrap_or(self.default_threshold)
    }

    /// Run until shutdown, inspecting every account-balance event.
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) {
        let mut events = self.events.take().expect("monitor runs once");
        info!(threshold = %self.default_threshold, "Settlement monitor starting");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping settlement monitor");
                    return;
                }
                event = events.recv() => match event {
                    Ok(TelemetryEvent::AccountBalance { peer_id, token, credit_balance, .. }) => {
                        self.inspect(&peer_id, &token, &credit_balance).await;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Settlement monitor lagged behind telemetry");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        warn!("Telemetry bus closed, stopping settlement monitor");
                        return;
                    }
                }
            }
        }
    }

    /// Inspect one balance reading; emits at most one trigger per account
    /// until the settlement completes.
    pub async fn inspect(&self, peer_id: &str, token: &str, credit_balance: &str) {
        let credit = match parse_amount(credit_balance) {
            Ok(value) => value,
            Err(e) => {
                warn!(peer_id, token, credit_balance, error = %e, "Unparseable balance in event");
                return;
            }
        };

        let threshold = self.threshold_for(peer_id, token);
        if credit < threshold {
            return;
        }

        if !self.tracker.try_trigger(peer_id, token) {
            debug!(peer_id, token, "Settlement already outstanding, trigger coalesced");
            return;
        }

        let exceeds_by = credit - threshold;
        info!(
            peer_id,
            token,
            credit = %credit,
            threshold = %threshold,
            exceeds_by = %exceeds_by,
            "Settlement triggered"
        );

        self.telemetry.publish(TelemetryEvent::SettlementTriggered {
            peer_id: peer_id.to_string(),
            token: token.to_string(),
            credit_balance: credit.to_string(),
            threshold: threshold.to_string(),
            exceeds_by: exceeds_by.to_string(),
        });

        let trigger = SettlementTrigger {
            peer_id: peer_id.to_string(),
            token: token.to_string(),
            credit_balance: credit,
            threshold,
            exceeds_by,
        };
        if self.trigger_tx.send(trigger).await.is_err() {
            warn!(peer_id, token, "Settlement trigger receiver dropped");
            self.tracker.complete(peer_id, token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor_with(
        threshold: u64,
    ) -> (SettlementMonitor, SettlementTracker, mpsc::Receiver<SettlementTrigger>, TelemetryBus)
    {
        let bus = TelemetryBus::new();
        let tracker = SettlementTracker::new();
        let (tx, rx) = mpsc::channel(8);
        let monitor =
            SettlementMonitor::new(bus.clone(), tracker.clone(), U256::from(threshold), tx);
        (monitor, tracker, rx, bus)
    }

    #[tokio::test]
    async fn test_below_threshold_is_quiet() {
        let (monitor, tracker, mut rx, _bus) = monitor_with(10_000);

        monitor.inspect("agent-002", "native", "9999").await;
        assert_eq!(tracker.state("agent-002", "native"), SettlementState::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_threshold_crossing_triggers_once() {
        let (monitor, tracker, mut rx, bus) = monitor_with(10_000);
        let mut events = bus.subscribe();

        monitor.inspect("agent-002", "native", "12000").await;

        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.exceeds_by, U256::from(2_000u64));
        assert_eq!(
            tracker.state("agent-002", "native"),
            SettlementState::SettlementPending
        );
        match events.try_recv().unwrap() {
            TelemetryEvent::SettlementTriggered { exceeds_by, .. } => {
                assert_eq!(exceeds_by, "2000");
            }
            other => panic!("expected SettlementTriggered, got {:?}", other),
        }

        // Duplicate crossings coalesce while the first is outstanding
        monitor.inspect("agent-002", "native", "15000").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_exact_threshold_triggers() {
        let (monitor, _tracker, mut rx, _bus) = monitor_with(10_000);

        monitor.inspect("agent-002", "native", "10000").await;
        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.exceeds_by, U256::ZERO);
    }

    #[tokio::test]
    async fn test_full_state_cycle() {
        let (monitor, tracker, mut rx, _bus) = monitor_with(10_000);

        monitor.inspect("agent-002", "native", "11000").await;
        rx.try_recv().unwrap();

        assert!(tracker.begin("agent-002", "native"));
        assert_eq!(
            tracker.state("agent-002", "native"),
            SettlementState::SettlementInProgress
        );
        // begin() is not re-entrant
        assert!(!tracker.begin("agent-002", "native"));

        tracker.complete("agent-002", "native");
        assert_eq!(tracker.state("agent-002", "native"), SettlementState::Idle);

        // After completion the next crossing re-triggers
        monitor.inspect("agent-002", "native", "11000").await;
        assert!(rx.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_per_account_threshold_override() {
        let (monitor, _tracker, mut rx, _bus) = monitor_with(10_000);
        monitor.set_threshold("agent-003", "native", U256::from(500u64));

        monitor.inspect("agent-003", "native", "600").await;
        let trigger = rx.try_recv().unwrap();
        assert_eq!(trigger.threshold, U256::from(500u64));

        // The default still applies to other accounts
        monitor.inspect("agent-002", "native", "600").await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_reset_all_returns_to_idle() {
        let (monitor, tracker, mut rx, _bus) = monitor_with(10_000);

        monitor.inspect("agent-002", "native", "11000").await;
        rx.try_recv().unwrap();
        tracker.reset_all();
        assert_eq!(tracker.state("agent-002", "native"), SettlementState::Idle);
    }
}
