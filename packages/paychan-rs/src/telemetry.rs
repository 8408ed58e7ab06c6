//! Telemetry: typed lifecycle events and a non-blocking bus.
//!
//! Publishers never block and never fail the operation that produced the
//! event; a bus with no subscribers (or with lagging subscribers) simply
//! drops events. Integer amounts serialize as decimal strings on every
//! external surface to preserve precision.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Default bus capacity; laggards past this lose the oldest events.
const DEFAULT_CAPACITY: usize = 256;

/// The fixed event schemas of the payment-channel core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TelemetryEvent {
    #[serde(rename = "AGENT_CHANNEL_OPENED")]
    AgentChannelOpened {
        agent_id: String,
        peer_id: String,
        channel_id: String,
        chain: String,
        token: String,
        amount: String,
    },

    #[serde(rename = "AGENT_CHANNEL_PAYMENT_SENT")]
    AgentChannelPaymentSent {
        agent_id: String,
        channel_id: String,
        nonce: u64,
        amount: String,
        transferred: String,
    },

    #[serde(rename = "AGENT_CHANNEL_CLOSED")]
    AgentChannelClosed {
        agent_id: String,
        channel_id: String,
        cooperative: bool,
    },

    #[serde(rename = "PAYMENT_CHANNEL_OPENED")]
    PaymentChannelOpened {
        channel_id: String,
        chain: String,
        settlement_timeout_secs: u64,
    },

    #[serde(rename = "PAYMENT_CHANNEL_BALANCE_UPDATE")]
    PaymentChannelBalanceUpdate {
        channel_id: String,
        nonce: u64,
        transferred: String,
    },

    #[serde(rename = "PAYMENT_CHANNEL_SETTLED")]
    PaymentChannelSettled {
        channel_id: String,
        participant1_amount: String,
        participant2_amount: String,
        cooperative: bool,
    },

    #[serde(rename = "ACCOUNT_BALANCE")]
    AccountBalance {
        peer_id: String,
        token: String,
        debit_balance: String,
        credit_balance: String,
        /// debit − credit; may be negative, still a decimal string
        net_balance: String,
        settlement_state: String,
    },

    #[serde(rename = "SETTLEMENT_TRIGGERED")]
    SettlementTriggered {
        peer_id: String,
        token: String,
        credit_balance: String,
        threshold: String,
        exceeds_by: String,
    },

    #[serde(rename = "SETTLEMENT_COMPLETED")]
    SettlementCompleted {
        peer_id: String,
        token: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    #[serde(rename = "AGENT_WALLET_STATE_CHANGED")]
    AgentWalletStateChanged {
        agent_id: String,
        previous_state: String,
        new_state: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl TelemetryEvent {
    /// The wire tag of this event
    pub fn kind(&self) -> &'static str {
        match self {
            TelemetryEvent::AgentChannelOpened { .. } => "AGENT_CHANNEL_OPENED",
            TelemetryEvent::AgentChannelPaymentSent { .. } => "AGENT_CHANNEL_PAYMENT_SENT",
            TelemetryEvent::AgentChannelClosed { .. } => "AGENT_CHANNEL_CLOSED",
            TelemetryEvent::PaymentChannelOpened { .. } => "PAYMENT_CHANNEL_OPENED",
            TelemetryEvent::PaymentChannelBalanceUpdate { .. } => "PAYMENT_CHANNEL_BALANCE_UPDATE",
            TelemetryEvent::PaymentChannelSettled { .. } => "PAYMENT_CHANNEL_SETTLED",
            TelemetryEvent::AccountBalance { .. } => "ACCOUNT_BALANCE",
            TelemetryEvent::SettlementTriggered { .. } => "SETTLEMENT_TRIGGERED",
            TelemetryEvent::SettlementCompleted { .. } => "SETTLEMENT_COMPLETED",
            TelemetryEvent::AgentWalletStateChanged { .. } => "AGENT_WALLET_STATE_CHANGED",
        }
    }
}

/// Non-blocking publish/subscribe bus for [`TelemetryEvent`]s.
#[derive(Debug, Clone)]
pub struct TelemetryBus {
    sender: broadcast::Sender<TelemetryEvent>,
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event. Never blocks; emission failure is logged and
    /// swallowed.
    pub fn publish(&self, event: TelemetryEvent) {
        let kind = event.kind();
        if self.sender.send(event).is_err() {
            debug!(event = kind, "Telemetry event dropped (no subscribers)");
        }
    }

    /// Subscribe to all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}
