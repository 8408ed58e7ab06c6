//! Ledger adapter contract shared by the EVM and XRP channel clients.
//!
//! The connector routes every on-chain operation through [`LedgerAdapter`].
//! Chains form a closed sum: [`Ledger`] dispatches to the two concrete
//! clients (plus the mock under the `testing` feature) and nothing else.

use async_trait::async_trait;

use alloy::primitives::U256;

use crate::error::ChannelError;
use crate::proof::{BalanceProof, SignedBalanceProof, WithdrawProof};
use crate::types::{ChannelId, OnChainChannelState, TokenId};

/// A confirmed ledger submission: transaction identifier plus the block (or
/// ledger index) it landed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmedTx {
    pub tx_hash: String,
    pub block_number: u64,
}

/// Channel lifecycle events delivered by the ledger watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Opened {
        channel_id: ChannelId,
        block_number: u64,
    },
    Closed {
        channel_id: ChannelId,
        closing_participant: String,
        nonce: u64,
        balance_hash: [u8; 32],
        block_number: u64,
    },
    Settled {
        channel_id: ChannelId,
        participant1_amount: U256,
        participant2_amount: U256,
        block_number: u64,
    },
    CooperativeSettled {
        channel_id: ChannelId,
        participant1_amount: U256,
        participant2_amount: U256,
        block_number: u64,
    },
}

impl ChannelEvent {
    pub fn channel_id(&self) -> &ChannelId {
        match self {
            ChannelEvent::Opened { channel_id, .. }
            | ChannelEvent::Closed { channel_id, .. }
            | ChannelEvent::Settled { channel_id, .. }
            | ChannelEvent::CooperativeSettled { channel_id, .. } => channel_id,
        }
    }
}

/// The operations a chain family must provide to the channel manager.
///
/// Every method is a suspension point and returns either a confirmed receipt
/// or a structured [`ChannelError`]. Methods a family cannot express (the
/// XRP PayChannel model has no counterpart for dispute updates or partial
/// withdrawals) return `ChannelError::Unsupported`.
#[async_trait]
pub trait LedgerAdapter: Send + Sync {
    /// Open a channel to `peer_address` with an initial deposit.
    /// Returns the chain-native channel id together with the receipt.
    async fn open_channel(
        &self,
        peer_address: &str,
        token: TokenId,
        settlement_timeout_secs: u64,
        initial_deposit: U256,
    ) -> Result<(ChannelId, ConfirmedTx), ChannelError>;

    /// Raise our total deposit in the channel. Monotonic: the new total must
    /// exceed the current one; the ledger pulls the delta.
    async fn set_total_deposit(
        &self,
        channel_id: &ChannelId,
        new_total: U256,
    ) -> Result<ConfirmedTx, ChannelError>;

    /// Close unilaterally with the counterparty's latest signed proof,
    /// starting the challenge period.
    async fn close_channel(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError>;

    /// During the challenge period, replace a stale closing proof with a
    /// later one signed by the closing side.
    async fn update_non_closing_balance_proof(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError>;

    /// Finalize payout after the challenge period has elapsed.
    async fn settle_channel(
        &self,
        channel_id: &ChannelId,
        own_proof: &BalanceProof,
        partner_proof: &BalanceProof,
    ) -> Result<ConfirmedTx, ChannelError>;

    /// Immediate payout with both sides' signatures, bypassing the
    /// challenge period.
    async fn cooperative_settle(
        &self,
        channel_id: &ChannelId,
        own_proof: &SignedBalanceProof,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError>;

    /// Partial withdrawal authorized by the counterparty, without closing.
    async fn withdraw(
        &self,
        channel_id: &ChannelId,
        proof: &WithdrawProof,
        counterparty_signature: &[u8],
    ) -> Result<ConfirmedTx, ChannelError>;

    /// Permissionless cleanup once the channel's maximum lifetime passed.
    async fn force_close_expired(
        &self,
        channel_id: &ChannelId,
    ) -> Result<ConfirmedTx, ChannelError>;

    /// Read the ledger's current view of the channel.
    async fn channel_state(
        &self,
        channel_id: &ChannelId,
    ) -> Result<OnChainChannelState, ChannelError>;
}

/// Closed dispatch over the configured chain clients.
pub enum Ledger {
    #[cfg(feature = "evm")]
    Evm(crate::evm::EvmChannelClient),
    #[cfg(feature = "xrp")]
    Xrp(crate::xrp::XrpChannelClient),
    #[cfg(feature = "testing")]
    Mock(crate::testing::MockLedger),
}

impl Ledger {
    fn inner(&self) -> &dyn LedgerAdapter {
        match self {
            #[cfg(feature = "evm")]
            Ledger::Evm(client) => client,
            #[cfg(feature = "xrp")]
            Ledger::Xrp(client) => client,
            #[cfg(feature = "testing")]
            Ledger::Mock(mock) => mock,
        }
    }
}

#[async_trait]
impl LedgerAdapter for Ledger {
    async fn open_channel(
        &self,
        peer_address: &str,
        token: TokenId,
        settlement_timeout_secs: u64,
        initial_deposit: U256,
    ) -> Result<(ChannelId, ConfirmedTx), ChannelError> {
        self.inner()
            .open_channel(peer_address, token, settlement_timeout_secs, initial_deposit)
            .await
    }

    async fn set_total_deposit(
        &self,
        channel_id: &ChannelId,
        new_total: U256,
    ) -> Result<ConfirmedTx, ChannelError> {
        self.inner().set_total_deposit(channel_id, new_total).await
    }

    async fn close_channel(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        self.inner().close_channel(channel_id, partner_proof).await
    }

    async fn update_non_closing_balance_proof(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        self.inner()
            .update_non_closing_balance_proof(channel_id, partner_proof)
            .await
    }

    async fn settle_channel(
        &self,
        channel_id: &ChannelId,
        own_proof: &BalanceProof,
        partner_proof: &BalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        self.inner()
            .settle_channel(channel_id, own_proof, partner_proof)
            .await
    }

    async fn cooperative_settle(
        &self,
        channel_id: &ChannelId,
        own_proof: &SignedBalanceProof,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        self.inner()
            .cooperative_settle(channel_id, own_proof, partner_proof)
            .await
    }

    async fn withdraw(
        &self,
        channel_id: &ChannelId,
        proof: &WithdrawProof,
        counterparty_signature: &[u8],
    ) -> Result<ConfirmedTx, ChannelError> {
        self.inner()
            .withdraw(channel_id, proof, counterparty_signature)
            .await
    }

    async fn force_close_expired(
        &self,
        channel_id: &ChannelId,
    ) -> Result<ConfirmedTx, ChannelError> {
        self.inner().force_close_expired(channel_id).await
    }

    async fn channel_state(
        &self,
        channel_id: &ChannelId,
    ) -> Result<OnChainChannelState, ChannelError> {
        self.inner().channel_state(channel_id).await
    }
}
