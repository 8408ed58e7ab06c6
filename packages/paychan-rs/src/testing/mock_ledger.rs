//! In-memory mock ledger
//!
//! Behaves like the channel contract's state machine: deterministic channel
//! ids, monotonic deposits, challenge bookkeeping, net settlement math and
//! signature verification on the cooperative path. Several agent-bound
//! handles can share one underlying state, so multi-agent tests see a
//! single consistent "chain".

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use alloy::primitives::U256;
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::adapter::{ChannelEvent, ConfirmedTx, LedgerAdapter};
use crate::error::ChannelError;
use crate::proof::{keccak256, recover_balance_proof, BalanceProof, ProofDomain, SignedBalanceProof, WithdrawProof};
use crate::types::{
    ChannelId, OnChainChannelState, ParticipantState, SettlementPhase, TokenId,
};

#[derive(Debug, Clone)]
struct MockChannel {
    participant1: String,
    participant2: String,
    token: TokenId,
    settlement_timeout: u64,
    phase: SettlementPhase,
    deposits: HashMap<String, U256>,
    withdrawn: HashMap<String, U256>,
    transferred: HashMap<String, U256>,
    nonces: HashMap<String, u64>,
    closing_participant: Option<String>,
}

impl MockChannel {
    fn participant_state(&self, address: &str) -> ParticipantState {
        ParticipantState {
            total_deposit: self.deposits.get(address).copied().unwrap_or_default(),
            total_withdrawn: self.withdrawn.get(address).copied().unwrap_or_default(),
            transferred: self.transferred.get(address).copied().unwrap_or_default(),
            nonce: self.nonces.get(address).copied().unwrap_or_default(),
        }
    }

    fn other(&self, address: &str) -> String {
        if self.participant1 == address {
            self.participant2.clone()
        } else {
            self.participant1.clone()
        }
    }

    fn is_participant(&self, address: &str) -> bool {
        self.participant1 == address || self.participant2 == address
    }
}

/// Shared chain state behind every agent-bound [`MockLedger`] handle
#[derive(Default)]
pub struct MockLedgerState {
    channels: HashMap<ChannelId, MockChannel>,
    height: u64,
    open_counter: u64,
    fail_next: Option<ChannelError>,
    events_tx: Option<mpsc::Sender<ChannelEvent>>,
}

impl MockLedgerState {
    pub fn shared() -> Arc<Mutex<Self>> {
        Arc::new(Mutex::new(Self::default()))
    }
}

/// Agent-bound handle onto the shared mock chain
#[derive(Clone)]
pub struct MockLedger {
    state: Arc<Mutex<MockLedgerState>>,
    own_address: String,
    domain: ProofDomain,
}

impl MockLedger {
    pub fn new(state: Arc<Mutex<MockLedgerState>>, own_address: String, domain: ProofDomain) -> Self {
        Self {
            state,
            own_address,
            domain,
        }
    }

    pub fn own_address(&self) -> &str {
        &self.own_address
    }

    /// Route channel events into the given sink (the manager's watcher inlet)
    pub fn set_event_sink(&self, tx: mpsc::Sender<ChannelEvent>) {
        self.state.lock().unwrap().events_tx = Some(tx);
    }

    /// Make the next adapter call fail with `error`
    pub fn inject_failure(&self, error: ChannelError) {
        self.state.lock().unwrap().fail_next = Some(error);
    }

    /// Number of channels ever opened
    pub fn open_count(&self) -> u64 {
        self.state.lock().unwrap().open_counter
    }

    /// Simulate the counterparty unilaterally closing with a (possibly
    /// stale) proof of our spending. Emits the Closed event.
    pub fn simulate_partner_close(
        &self,
        channel_id: &ChannelId,
        closing_participant: &str,
        our_nonce: u64,
        our_transferred: U256,
    ) -> Result<(), ChannelError> {
        let event = {
            let mut state = self.state.lock().unwrap();
            state.height += 1;
            let height = state.height;
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            if channel.phase != SettlementPhase::Open {
                return Err(ChannelError::Reverted {
                    reason: "InvalidState".to_string(),
                });
            }
            let non_closing = channel.other(closing_participant);
            channel.phase = SettlementPhase::ClosedChallenge;
            channel.closing_participant = Some(closing_participant.to_string());
            channel.nonces.insert(non_closing.clone(), our_nonce);
            channel.transferred.insert(non_closing, our_transferred);

            ChannelEvent::Closed {
                channel_id: *channel_id,
                closing_participant: closing_participant.to_string(),
                nonce: our_nonce,
                balance_hash: [0u8; 32],
                block_number: height,
            }
        };
        self.emit(event);
        Ok(())
    }

    fn emit(&self, event: ChannelEvent) {
        let tx = self.state.lock().unwrap().events_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.try_send(event);
        }
    }

    fn take_injected_failure(&self) -> Option<ChannelError> {
        self.state.lock().unwrap().fail_next.take()
    }

    fn confirmed(&self) -> ConfirmedTx {
        let mut state = self.state.lock().unwrap();
        state.height += 1;
        ConfirmedTx {
            tx_hash: format!("0xmock{:08x}", state.height),
            block_number: state.height,
        }
    }
}

#[async_trait]
impl LedgerAdapter for MockLedger {
    async fn open_channel(
        &self,
        peer_address: &str,
        token: TokenId,
        settlement_timeout_secs: u64,
        initial_deposit: U256,
    ) -> Result<(ChannelId, ConfirmedTx), ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        if !(crate::types::MIN_SETTLEMENT_TIMEOUT_SECS..=crate::types::MAX_SETTLEMENT_TIMEOUT_SECS)
            .contains(&settlement_timeout_secs)
        {
            return Err(ChannelError::Reverted {
                reason: "InvalidTimeout".to_string(),
            });
        }

        let (channel_id, event) = {
            let mut state = self.state.lock().unwrap();

            // One open channel per (pair, token); a closing channel's
            // successor starts a fresh deposit epoch.
            let duplicate = state.channels.values().any(|c| {
                c.phase == SettlementPhase::Open
                    && c.token == token
                    && c.is_participant(&self.own_address)
                    && c.is_participant(peer_address)
            });
            if duplicate {
                return Err(ChannelError::Reverted {
                    reason: "ChannelExists".to_string(),
                });
            }

            state.open_counter += 1;
            state.height += 1;
            let mut seed = [0u8; 8];
            seed.copy_from_slice(&state.open_counter.to_be_bytes());
            let channel_id = ChannelId::from_bytes(keccak256(&seed));

            let (participant1, participant2) = if self.own_address <= peer_address.to_string() {
                (self.own_address.clone(), peer_address.to_string())
            } else {
                (peer_address.to_string(), self.own_address.clone())
            };

            let mut deposits = HashMap::new();
            deposits.insert(self.own_address.clone(), initial_deposit);
            state.channels.insert(
                channel_id,
                MockChannel {
                    participant1,
                    participant2,
                    token,
                    settlement_timeout: settlement_timeout_secs,
                    phase: SettlementPhase::Open,
                    deposits,
                    withdrawn: HashMap::new(),
                    transferred: HashMap::new(),
                    nonces: HashMap::new(),
                    closing_participant: None,
                },
            );

            (
                channel_id,
                ChannelEvent::Opened {
                    channel_id,
                    block_number: state.height,
                },
            )
        };

        self.emit(event);
        Ok((channel_id, self.confirmed()))
    }

    async fn set_total_deposit(
        &self,
        channel_id: &ChannelId,
        new_total: U256,
    ) -> Result<ConfirmedTx, ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        {
            let mut state = self.state.lock().unwrap();
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            let current = channel
                .deposits
                .get(&self.own_address)
                .copied()
                .unwrap_or_default();
            if new_total <= current {
                return Err(ChannelError::Reverted {
                    reason: "DepositNotMonotonic".to_string(),
                });
            }
            channel.deposits.insert(self.own_address.clone(), new_total);
        }
        Ok(self.confirmed())
    }

    async fn close_channel(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        let event = {
            let mut state = self.state.lock().unwrap();
            state.height += 1;
            let height = state.height;
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            if channel.phase != SettlementPhase::Open {
                return Err(ChannelError::Reverted {
                    reason: "InvalidState".to_string(),
                });
            }
            if !channel.is_participant(&self.own_address) {
                return Err(ChannelError::Reverted {
                    reason: "NotParticipant".to_string(),
                });
            }

            let partner = channel.other(&self.own_address);
            channel.phase = SettlementPhase::ClosedChallenge;
            channel.closing_participant = Some(self.own_address.clone());
            channel
                .nonces
                .insert(partner.clone(), partner_proof.proof.nonce);
            channel
                .transferred
                .insert(partner, partner_proof.proof.transferred_amount);

            ChannelEvent::Closed {
                channel_id: *channel_id,
                closing_participant: self.own_address.clone(),
                nonce: partner_proof.proof.nonce,
                balance_hash: partner_proof.proof.balance_hash(),
                block_number: height,
            }
        };
        self.emit(event);
        Ok(self.confirmed())
    }

    async fn update_non_closing_balance_proof(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        {
            let mut state = self.state.lock().unwrap();
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            if channel.phase != SettlementPhase::ClosedChallenge {
                return Err(ChannelError::Reverted {
                    reason: "InvalidState".to_string(),
                });
            }
            let closing = channel.closing_participant.clone().unwrap_or_default();
            let current = channel.nonces.get(&closing).copied().unwrap_or_default();
            if partner_proof.proof.nonce <= current {
                return Err(ChannelError::Reverted {
                    reason: "NonceMismatch".to_string(),
                });
            }
            channel
                .nonces
                .insert(closing.clone(), partner_proof.proof.nonce);
            channel
                .transferred
                .insert(closing, partner_proof.proof.transferred_amount);
        }
        Ok(self.confirmed())
    }

    async fn settle_channel(
        &self,
        channel_id: &ChannelId,
        _own_proof: &BalanceProof,
        _partner_proof: &BalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        let event = {
            let mut state = self.state.lock().unwrap();
            state.height += 1;
            let height = state.height;
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            if channel.phase != SettlementPhase::ClosedChallenge {
                return Err(ChannelError::Reverted {
                    reason: "InvalidState".to_string(),
                });
            }
            channel.phase = SettlementPhase::Settled;

            let p1 = channel.participant_state(&channel.participant1.clone());
            let p2 = channel.participant_state(&channel.participant2.clone());
            // deposit_i − transferred_i + transferred_other, clamped at zero
            let p1_amount = p1
                .total_deposit
                .saturating_sub(p1.transferred)
                .saturating_add(p2.transferred);
            let p2_amount = p2
                .total_deposit
                .saturating_sub(p2.transferred)
                .saturating_add(p1.transferred);

            ChannelEvent::Settled {
                channel_id: *channel_id,
                participant1_amount: p1_amount,
                participant2_amount: p2_amount,
                block_number: height,
            }
        };
        self.emit(event);
        Ok(self.confirmed())
    }

    async fn cooperative_settle(
        &self,
        channel_id: &ChannelId,
        own_proof: &SignedBalanceProof,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        if own_proof.proof.nonce != partner_proof.proof.nonce {
            return Err(ChannelError::Reverted {
                reason: "NonceMismatch".to_string(),
            });
        }

        let event = {
            let mut state = self.state.lock().unwrap();
            state.height += 1;
            let height = state.height;
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            if channel.phase != SettlementPhase::Open {
                return Err(ChannelError::Reverted {
                    reason: "InvalidState".to_string(),
                });
            }

            // Both signatures must recover to (distinct) channel participants
            for signed in [own_proof, partner_proof] {
                let recovered =
                    recover_balance_proof(&signed.proof, &self.domain, &signed.signature)?;
                let address = format!("{}", recovered);
                if !channel.is_participant(&address) {
                    return Err(ChannelError::Reverted {
                        reason: "SignatureMismatch".to_string(),
                    });
                }
            }

            channel.phase = SettlementPhase::Settled;
            let own = channel.participant_state(&self.own_address);
            let partner_address = channel.other(&self.own_address);
            let partner = channel.participant_state(&partner_address);

            let own_amount = own
                .total_deposit
                .saturating_sub(own_proof.proof.transferred_amount)
                .saturating_add(partner_proof.proof.transferred_amount);
            let partner_amount = partner
                .total_deposit
                .saturating_sub(partner_proof.proof.transferred_amount)
                .saturating_add(own_proof.proof.transferred_amount);

            let own_is_first = channel.participant1 == self.own_address;
            let (participant1_amount, participant2_amount) = if own_is_first {
                (own_amount, partner_amount)
            } else {
                (partner_amount, own_amount)
            };

            ChannelEvent::CooperativeSettled {
                channel_id: *channel_id,
                participant1_amount,
                participant2_amount,
                block_number: height,
            }
        };
        self.emit(event);
        Ok(self.confirmed())
    }

    async fn withdraw(
        &self,
        channel_id: &ChannelId,
        proof: &WithdrawProof,
        _counterparty_signature: &[u8],
    ) -> Result<ConfirmedTx, ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        {
            let mut state = self.state.lock().unwrap();
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            let address = format!("{}", proof.participant);
            let prior = channel.withdrawn.get(&address).copied().unwrap_or_default();
            channel.withdrawn.insert(address, prior + proof.amount);
        }
        Ok(self.confirmed())
    }

    async fn force_close_expired(
        &self,
        channel_id: &ChannelId,
    ) -> Result<ConfirmedTx, ChannelError> {
        if let Some(err) = self.take_injected_failure() {
            return Err(err);
        }
        {
            let mut state = self.state.lock().unwrap();
            let channel = state
                .channels
                .get_mut(channel_id)
                .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
            channel.phase = SettlementPhase::ClosedChallenge;
            channel.closing_participant = Some(self.own_address.clone());
        }
        Ok(self.confirmed())
    }

    async fn channel_state(
        &self,
        channel_id: &ChannelId,
    ) -> Result<OnChainChannelState, ChannelError> {
        let state = self.state.lock().unwrap();
        let channel = state
            .channels
            .get(channel_id)
            .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
        let partner_address = channel.other(&self.own_address);
        Ok(OnChainChannelState {
            channel_id: *channel_id,
            phase: channel.phase,
            own: channel.participant_state(&self.own_address),
            partner: channel.participant_state(&partner_address),
            challenge_deadline: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::Address;

    fn domain() -> ProofDomain {
        ProofDomain::new(31337, Address::ZERO)
    }

    fn ledger_pair() -> (MockLedger, MockLedger) {
        let state = MockLedgerState::shared();
        let a = MockLedger::new(state.clone(), "0xaaaa".to_string(), domain());
        let b = MockLedger::new(state, "0xbbbb".to_string(), domain());
        (a, b)
    }

    #[tokio::test]
    async fn test_open_assigns_distinct_ids() {
        let (a, b) = ledger_pair();
        let (id1, _) = a
            .open_channel("0xbbbb", TokenId::Native, 21_600, U256::from(100u64))
            .await
            .unwrap();
        let (id2, _) = b
            .open_channel("0xcccc", TokenId::Native, 21_600, U256::from(100u64))
            .await
            .unwrap();
        assert_ne!(id1, id2);
        assert_eq!(a.open_count(), 2);
    }

    #[tokio::test]
    async fn test_duplicate_active_pair_reverts() {
        let (a, _) = ledger_pair();
        a.open_channel("0xbbbb", TokenId::Native, 21_600, U256::from(100u64))
            .await
            .unwrap();
        let err = a
            .open_channel("0xbbbb", TokenId::Native, 21_600, U256::from(100u64))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Reverted { reason } if reason == "ChannelExists"));
    }

    #[tokio::test]
    async fn test_timeout_bounds() {
        let (a, _) = ledger_pair();
        let err = a
            .open_channel("0xbbbb", TokenId::Native, 60, U256::from(100u64))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Reverted { reason } if reason == "InvalidTimeout"));

        // MIN and MAX are both accepted
        a.open_channel(
            "0xbbbb",
            TokenId::Native,
            crate::types::MIN_SETTLEMENT_TIMEOUT_SECS,
            U256::from(1u64),
        )
        .await
        .unwrap();
        a.open_channel(
            "0xcccc",
            TokenId::Native,
            crate::types::MAX_SETTLEMENT_TIMEOUT_SECS,
            U256::from(1u64),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_deposit_monotonic() {
        let (a, _) = ledger_pair();
        let (id, _) = a
            .open_channel("0xbbbb", TokenId::Native, 21_600, U256::from(100u64))
            .await
            .unwrap();

        a.set_total_deposit(&id, U256::from(150u64)).await.unwrap();
        let err = a.set_total_deposit(&id, U256::from(150u64)).await.unwrap_err();
        assert!(matches!(err, ChannelError::Reverted { reason } if reason == "DepositNotMonotonic"));
    }

    #[tokio::test]
    async fn test_unilateral_close_then_settle_pays_net() {
        let (a, _) = ledger_pair();
        let (id, _) = a
            .open_channel("0xbbbb", TokenId::Native, 21_600, U256::from(100u64))
            .await
            .unwrap();

        // Partner proof: they transferred 30 to us
        let partner_proof = SignedBalanceProof {
            proof: BalanceProof {
                channel_id: id,
                nonce: 4,
                transferred_amount: U256::from(30u64),
                locked_amount: U256::ZERO,
                locks_root: [0u8; 32],
            },
            signature: [0u8; 65],
        };
        a.close_channel(&id, &partner_proof).await.unwrap();

        let err = a.close_channel(&id, &partner_proof).await.unwrap_err();
        assert!(matches!(err, ChannelError::Reverted { reason } if reason == "InvalidState"));

        let own = BalanceProof {
            channel_id: id,
            nonce: 0,
            transferred_amount: U256::ZERO,
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        };
        a.settle_channel(&id, &own, &partner_proof.proof).await.unwrap();
        let state = a.channel_state(&id).await.unwrap();
        assert_eq!(state.phase, SettlementPhase::Settled);
    }

    #[tokio::test]
    async fn test_failure_injection_applies_once() {
        let (a, _) = ledger_pair();
        a.inject_failure(ChannelError::Timeout("boom".to_string()));
        let err = a
            .open_channel("0xbbbb", TokenId::Native, 21_600, U256::from(1u64))
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout(_)));

        a.open_channel("0xbbbb", TokenId::Native, 21_600, U256::from(1u64))
            .await
            .unwrap();
    }
}
