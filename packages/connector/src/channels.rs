//! Channel manager: the full lifecycle of payment channels from an agent's
//! perspective.
//!
//! Ordering guarantees live here:
//! - Per-channel payment serialization: an exclusive async lock is held
//!   across "compute next nonce → sign → persist → send", so nonces are
//!   strictly increasing with no gaps or duplicates. Distinct channels
//!   proceed in parallel.
//! - Store-before-cache: every durable write lands before the in-memory
//!   cache publishes it.
//! - Identical concurrent opens collapse onto a single on-chain submission.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::{mpsc, OnceCell};
use tracing::{debug, error, info, warn};

use paychan_rs::adapter::{ChannelEvent, Ledger, LedgerAdapter};
use paychan_rs::error::ChannelError;
use paychan_rs::proof::{
    encode_proof_message, decode_proof_message, verify_proof_signature, BalanceProof, ProofDomain,
    SignedBalanceProof, SIGNATURE_LEN,
};
use paychan_rs::signer::SignerService;
use paychan_rs::telemetry::{TelemetryBus, TelemetryEvent};
use paychan_rs::types::{ChainTag, ChannelId, ChannelState, SettlementPhase, TokenId};

use crate::accounts::AccountManager;
use crate::config::ChannelsConfig;
use crate::db;
use crate::lifecycle::{WalletLifecycle, WalletState};
use crate::peer::{PeerDirectory, PeerTransport};
use crate::settlement::{SettlementTracker, SettlementTrigger};

/// Cached view of one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub channel_id: ChannelId,
    pub agent_id: String,
    pub peer_id: String,
    pub chain: ChainTag,
    pub token: TokenId,
    /// Lifecycle from the manager's view: Active while payments may flow,
    /// Challenge once a unilateral close is pending. Settled channels
    /// leave the cache.
    pub state: ChannelState,
    pub opened_at: DateTime<Utc>,
    pub last_activity: Option<DateTime<Utc>>,
}

impl Channel {
    fn from_row(row: &db::ChannelRow) -> Result<Self, ChannelError> {
        Ok(Self {
            channel_id: ChannelId::from_hex(&row.channel_id)
                .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?,
            agent_id: row.agent_id.clone(),
            peer_id: row.peer_id.clone(),
            chain: ChainTag::from_str_tag(&row.chain)
                .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?,
            token: TokenId::decode(&row.token)
                .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?,
            state: ChannelState::Active,
            opened_at: row.opened_at,
            last_activity: row.last_activity,
        })
    }
}

/// Produces the ledger adapter and typed-data domain for (agent, chain).
/// The production implementation is [`ChainRouter`]; tests plug in mocks.
#[async_trait]
pub trait LedgerFactory: Send + Sync {
    async fn ledger_for(
        &self,
        agent_id: &str,
        chain: ChainTag,
    ) -> Result<Arc<Ledger>, ChannelError>;

    fn proof_domain(&self, chain: ChainTag) -> ProofDomain;
}

/// Per-channel serialized state: the advisory lock all payments on one
/// channel contend on.
struct ChannelSequencer {
    /// Highest nonce we have signed; the next payment uses last_nonce + 1
    last_nonce: u64,
    /// Our cumulative transferred amount
    transferred: U256,
    /// Our on-chain deposit
    deposit: U256,
    /// Counterparty's on-chain deposit (bounds inbound proofs)
    partner_deposit: U256,
    /// Latest proof we signed and sent
    own_proof: Option<SignedBalanceProof>,
    /// Latest counterparty-signed proof we hold
    partner_proof: Option<SignedBalanceProof>,
    /// Set on reconciliation faults; blocks further sends
    quarantined: bool,
}

type OpenKey = (String, String, ChainTag, String);

/// The orchestration core
pub struct ChannelManager {
    pool: SqlitePool,
    cache: RwLock<HashMap<ChannelId, Channel>>,
    sequencers: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<ChannelSequencer>>>>,
    pending_opens: Mutex<HashMap<OpenKey, Arc<OnceCell<ChannelId>>>>,
    lifecycle: Arc<WalletLifecycle>,
    signers: Arc<SignerService>,
    ledgers: Arc<dyn LedgerFactory>,
    transport: Arc<dyn PeerTransport>,
    directory: Arc<PeerDirectory>,
    telemetry: TelemetryBus,
    tracker: SettlementTracker,
    config: ChannelsConfig,
    /// Handle onto our own Arc, for the detached tasks we spawn
    weak_self: std::sync::Weak<ChannelManager>,
}

impl ChannelManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        lifecycle: Arc<WalletLifecycle>,
        signers: Arc<SignerService>,
        ledgers: Arc<dyn LedgerFactory>,
        transport: Arc<dyn PeerTransport>,
        directory: Arc<PeerDirectory>,
        telemetry: TelemetryBus,
        tracker: SettlementTracker,
        config: ChannelsConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pool,
            cache: RwLock::new(HashMap::new()),
            sequencers: Mutex::new(HashMap::new()),
            pending_opens: Mutex::new(HashMap::new()),
            lifecycle,
            signers,
            ledgers,
            transport,
            directory,
            telemetry,
            tracker,
            config,
            weak_self: weak.clone(),
        })
    }

    fn arc(&self) -> Arc<Self> {
        self.weak_self
            .upgrade()
            .expect("manager outlives its spawned tasks")
    }

    // ========================================================================
    // Startup recovery
    // ========================================================================

    /// Reload active channels from the store and reconcile each against the
    /// ledger. Channels the ledger reports settled are closed in the store;
    /// everything else lands in the cache. Pending settlement states reset
    /// to IDLE.
    pub async fn recover(&self) -> eyre::Result<()> {
        let rows = db::load_all_active(&self.pool).await?;
        info!(channels = rows.len(), "Recovering active channels from store");

        for row in rows {
            let channel = match Channel::from_row(&row) {
                Ok(channel) => channel,
                Err(e) => {
                    error!(channel_id = %row.channel_id, error = %e, "Unreadable channel row, skipping");
                    continue;
                }
            };

            let ledger = match self.ledgers.ledger_for(&channel.agent_id, channel.chain).await {
                Ok(ledger) => ledger,
                Err(e) => {
                    warn!(channel_id = %channel.channel_id, error = %e, "No ledger adapter during recovery, caching as-is");
                    self.cache
                        .write()
                        .unwrap()
                        .insert(channel.channel_id, channel);
                    continue;
                }
            };

            match ledger.channel_state(&channel.channel_id).await {
                Ok(state) if state.phase == SettlementPhase::Settled => {
                    info!(channel_id = %channel.channel_id, "Channel settled during downtime, closing in store");
                    db::mark_channel_closed(&self.pool, &row.channel_id, Utc::now()).await?;
                }
                Ok(state) => {
                    self.init_sequencer_from_store(&channel, state.own.nonce, state.own.transferred, state.own.total_deposit, state.partner.total_deposit)
                        .await?;
                    let mut channel = channel;
                    if state.phase == SettlementPhase::ClosedChallenge {
                        channel.state = ChannelState::Challenge;
                    }
                    self.cache
                        .write()
                        .unwrap()
                        .insert(channel.channel_id, channel);
                }
                Err(e) => {
                    // Transient ledger trouble never closes a channel
                    warn!(channel_id = %channel.channel_id, error = %e, "Ledger unavailable during recovery, caching as-is");
                    self.cache
                        .write()
                        .unwrap()
                        .insert(channel.channel_id, channel);
                }
            }
        }

        self.tracker.reset_all();
        Ok(())
    }

    /// Build a sequencer from stored proofs, adopting the on-chain view
    /// where it is ahead (e.g. a submission confirmed during downtime).
    async fn init_sequencer_from_store(
        &self,
        channel: &Channel,
        chain_nonce: u64,
        chain_transferred: U256,
        deposit: U256,
        partner_deposit: U256,
    ) -> eyre::Result<()> {
        let channel_hex = channel.channel_id.to_hex();
        let sent = db::get_proof(&self.pool, &channel_hex, "sent").await?;
        let received = db::get_proof(&self.pool, &channel_hex, "received").await?;

        let own_proof = sent.as_ref().and_then(|row| proof_from_row(row).ok());
        let partner_proof = received.as_ref().and_then(|row| proof_from_row(row).ok());

        let stored_nonce = own_proof.as_ref().map(|p| p.proof.nonce).unwrap_or(0);
        let stored_transferred = own_proof
            .as_ref()
            .map(|p| p.proof.transferred_amount)
            .unwrap_or(U256::ZERO);

        let (last_nonce, transferred) = if chain_nonce > stored_nonce {
            info!(
                channel_id = %channel.channel_id,
                chain_nonce,
                stored_nonce,
                "On-chain nonce ahead of local state, adopting ledger view"
            );
            (chain_nonce, chain_transferred.max(stored_transferred))
        } else {
            (stored_nonce, stored_transferred)
        };

        let sequencer = ChannelSequencer {
            last_nonce,
            transferred,
            deposit,
            partner_deposit,
            own_proof,
            partner_proof,
            quarantined: false,
        };
        self.sequencers
            .lock()
            .unwrap()
            .insert(channel.channel_id, Arc::new(tokio::sync::Mutex::new(sequencer)));
        Ok(())
    }

    // ========================================================================
    // Open
    // ========================================================================

    /// Open a channel for `agent_id` to `peer_id`. Identical concurrent
    /// calls collapse onto exactly one on-chain open.
    pub async fn open_channel(
        &self,
        agent_id: &str,
        peer_id: &str,
        chain: ChainTag,
        token: TokenId,
        amount: U256,
    ) -> Result<ChannelId, ChannelError> {
        self.require_active(agent_id)?;
        let peer_address = self.directory.resolve(peer_id, chain)?;

        let key: OpenKey = (
            agent_id.to_string(),
            peer_id.to_string(),
            chain,
            token.encode(),
        );
        let cell = {
            let mut pending = self.pending_opens.lock().unwrap();
            pending
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_try_init(|| {
                self.do_open(agent_id, peer_id, &peer_address, chain, token, amount)
            })
            .await
            .copied();

        // The cell only dedups in-flight opens; once resolved it leaves the
        // table so a later rebalance can open a fresh channel for the pair.
        let mut pending = self.pending_opens.lock().unwrap();
        if let Some(existing) = pending.get(&key) {
            if Arc::ptr_eq(existing, &cell) {
                pending.remove(&key);
            }
        }

        result
    }

    async fn do_open(
        &self,
        agent_id: &str,
        peer_id: &str,
        peer_address: &str,
        chain: ChainTag,
        token: TokenId,
        amount: U256,
    ) -> Result<ChannelId, ChannelError> {
        let ledger = self.ledgers.ledger_for(agent_id, chain).await?;
        let (channel_id, receipt) = ledger
            .open_channel(
                peer_address,
                token,
                self.config.settlement_timeout_secs,
                amount,
            )
            .await?;

        let now = Utc::now();
        let new_channel = db::NewChannel {
            agent_id: agent_id.to_string(),
            channel_id: channel_id.to_hex(),
            chain: chain.as_str().to_string(),
            token: token.encode(),
            peer_id: peer_id.to_string(),
            opened_at: now,
        };
        // Store write precedes cache publish
        db::insert_channel(&self.pool, &new_channel)
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;

        let channel = Channel {
            channel_id,
            agent_id: agent_id.to_string(),
            peer_id: peer_id.to_string(),
            chain,
            token,
            state: ChannelState::Active,
            opened_at: now,
            last_activity: None,
        };
        self.cache.write().unwrap().insert(channel_id, channel);
        self.sequencers.lock().unwrap().insert(
            channel_id,
            Arc::new(tokio::sync::Mutex::new(ChannelSequencer {
                last_nonce: 0,
                transferred: U256::ZERO,
                deposit: amount,
                partner_deposit: U256::ZERO,
                own_proof: None,
                partner_proof: None,
                quarantined: false,
            })),
        );

        self.lifecycle
            .record_transaction(agent_id, &token.encode(), amount);

        info!(
            agent_id,
            peer_id,
            channel_id = %channel_id,
            chain = %chain,
            amount = %amount,
            tx_hash = %receipt.tx_hash,
            "Channel opened"
        );
        self.telemetry.publish(TelemetryEvent::AgentChannelOpened {
            agent_id: agent_id.to_string(),
            peer_id: peer_id.to_string(),
            channel_id: channel_id.to_hex(),
            chain: chain.as_str().to_string(),
            token: token.encode(),
            amount: amount.to_string(),
        });
        self.telemetry.publish(TelemetryEvent::PaymentChannelOpened {
            channel_id: channel_id.to_hex(),
            chain: chain.as_str().to_string(),
            settlement_timeout_secs: self.config.settlement_timeout_secs,
        });

        Ok(channel_id)
    }

    // ========================================================================
    // Payments
    // ========================================================================

    /// Send an off-chain payment of `amount` over a channel. Returns the
    /// nonce of the emitted proof.
    ///
    /// The issued nonce is retained even when delivery fails: the next
    /// proof continues from it, and the on-chain contract honors the
    /// highest-nonce valid proof regardless of what the peer acknowledged.
    pub async fn send_payment(
        &self,
        agent_id: &str,
        channel_id: &ChannelId,
        amount: U256,
    ) -> Result<u64, ChannelError> {
        let channel = self.get_channel_entry(agent_id, channel_id).await?;
        self.require_active(agent_id)?;

        if channel.state != ChannelState::Active {
            return Err(ChannelError::Reverted {
                reason: "InvalidState".to_string(),
            });
        }

        let sequencer = self.ensure_sequencer(&channel).await?;
        let mut guard = sequencer.lock().await;

        if guard.quarantined {
            return Err(ChannelError::Quarantined(channel_id.to_hex()));
        }

        let transferred = guard.transferred.saturating_add(amount);
        if transferred > guard.deposit {
            return Err(ChannelError::TransferredExceedsDeposit {
                transferred: transferred.to_string(),
                locked: "0".to_string(),
                deposit: guard.deposit.to_string(),
            });
        }

        let nonce = guard.last_nonce + 1;
        let proof = BalanceProof {
            channel_id: *channel_id,
            nonce,
            transferred_amount: transferred,
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        };

        let domain = self.ledgers.proof_domain(channel.chain);
        let signer = self
            .signers
            .agent_signer(agent_id, channel.chain)
            .map_err(|e| ChannelError::InvalidSignature(e.to_string()))?;
        let signature = signer.sign_proof(&proof, &domain)?;
        let signed = SignedBalanceProof { proof, signature };

        // Persist intent before anything becomes observable
        db::upsert_proof(&self.pool, &proof_to_row(&signed, "sent"))
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;
        let now = Utc::now();
        db::mark_channel_activity(&self.pool, &channel_id.to_hex(), now)
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;

        // The nonce is committed from here on, whatever the transport does
        guard.last_nonce = nonce;
        guard.transferred = transferred;
        guard.own_proof = Some(signed.clone());

        if let Some(cached) = self.cache.write().unwrap().get_mut(channel_id) {
            cached.last_activity = Some(now);
        }

        self.lifecycle
            .record_transaction(agent_id, &channel.token.encode(), amount);
        self.telemetry.publish(TelemetryEvent::AgentChannelPaymentSent {
            agent_id: agent_id.to_string(),
            channel_id: channel_id.to_hex(),
            nonce,
            amount: amount.to_string(),
            transferred: transferred.to_string(),
        });
        self.telemetry
            .publish(TelemetryEvent::PaymentChannelBalanceUpdate {
                channel_id: channel_id.to_hex(),
                nonce,
                transferred: transferred.to_string(),
            });

        // Still under the channel lock: outgoing proofs stay serialized
        let delivery = self
            .transport
            .send_balance_proof(&channel.peer_id, encode_proof_message(&signed))
            .await;
        drop(guard);

        // Rebalance check runs detached; its failures never reach the caller
        let manager = self.arc();
        let agent = agent_id.to_string();
        tokio::spawn(async move {
            if let Err(e) = manager.check_channel_rebalancing(&agent).await {
                warn!(agent_id = %agent, error = %e, "Rebalance check failed");
            }
        });

        match delivery {
            Ok(()) => Ok(nonce),
            Err(e) => {
                warn!(
                    channel_id = %channel_id,
                    nonce,
                    error = %e,
                    "Proof delivery failed; nonce retained for retransmission"
                );
                Err(e)
            }
        }
    }

    /// Inbound path: a balance proof arrived from `from_peer`. Verifies the
    /// chain-native signature, enforces monotonicity and deposit bounds,
    /// persists, and updates the cached counterparty state.
    pub async fn receive_balance_proof(
        &self,
        agent_id: &str,
        from_peer: &str,
        payload: &[u8],
    ) -> Result<(), ChannelError> {
        let signed = decode_proof_message(payload)?;
        let channel_id = signed.proof.channel_id;
        let channel = self.get_channel_entry(agent_id, &channel_id).await?;

        if channel.peer_id != from_peer {
            return Err(ChannelError::InvalidSignature(format!(
                "proof for channel {} arrived from {} instead of {}",
                channel_id, from_peer, channel.peer_id
            )));
        }

        let expected_signer = match channel.chain {
            ChainTag::Evm => self.directory.resolve(&channel.peer_id, ChainTag::Evm)?,
            ChainTag::Xrp => self
                .directory
                .claim_key(&channel.peer_id)
                .ok_or_else(|| ChannelError::PeerUnknown {
                    peer_id: channel.peer_id.clone(),
                    chain: ChainTag::Xrp,
                })?,
        };
        let domain = self.ledgers.proof_domain(channel.chain);
        verify_proof_signature(
            channel.chain,
            &signed.proof,
            &domain,
            &signed.signature,
            &expected_signer,
        )?;

        let sequencer = self.ensure_sequencer(&channel).await?;
        let mut guard = sequencer.lock().await;

        let current_nonce = guard
            .partner_proof
            .as_ref()
            .map(|p| p.proof.nonce)
            .unwrap_or(0);
        if signed.proof.nonce <= current_nonce {
            guard.quarantined = true;
            error!(
                channel_id = %channel_id,
                got = signed.proof.nonce,
                expected_above = current_nonce,
                "Nonce regression on inbound proof; channel quarantined pending reconciliation"
            );
            return Err(ChannelError::NonceNotMonotonic {
                expected: current_nonce,
                got: signed.proof.nonce,
            });
        }

        let committed = signed
            .proof
            .transferred_amount
            .saturating_add(signed.proof.locked_amount);
        if committed > guard.partner_deposit {
            // The cached deposit may trail a set_total_deposit the
            // counterparty made after we opened; reconcile against the
            // ledger before condemning the proof.
            let ledger = self.ledgers.ledger_for(agent_id, channel.chain).await?;
            let state = ledger.channel_state(&channel_id).await?;
            guard.deposit = guard.deposit.max(state.own.total_deposit);
            guard.partner_deposit = guard.partner_deposit.max(state.partner.total_deposit);
        }
        if committed > guard.partner_deposit {
            guard.quarantined = true;
            error!(
                channel_id = %channel_id,
                committed = %committed,
                deposit = %guard.partner_deposit,
                "Inbound proof exceeds counterparty deposit; channel quarantined"
            );
            return Err(ChannelError::TransferredExceedsDeposit {
                transferred: signed.proof.transferred_amount.to_string(),
                locked: signed.proof.locked_amount.to_string(),
                deposit: guard.partner_deposit.to_string(),
            });
        }

        db::upsert_proof(&self.pool, &proof_to_row(&signed, "received"))
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;
        let now = Utc::now();
        db::mark_channel_activity(&self.pool, &channel_id.to_hex(), now)
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;

        let nonce = signed.proof.nonce;
        let transferred = signed.proof.transferred_amount;
        guard.partner_proof = Some(signed);
        drop(guard);

        if let Some(cached) = self.cache.write().unwrap().get_mut(&channel_id) {
            cached.last_activity = Some(now);
        }

        debug!(channel_id = %channel_id, nonce, "Counterparty balance proof accepted");
        self.telemetry
            .publish(TelemetryEvent::PaymentChannelBalanceUpdate {
                channel_id: channel_id.to_hex(),
                nonce,
                transferred: transferred.to_string(),
            });
        Ok(())
    }

    // ========================================================================
    // Close
    // ========================================================================

    /// Close a channel. Prefers the cooperative path when matching-nonce
    /// proofs from both sides are on hand; otherwise closes unilaterally
    /// and schedules settlement for after the challenge period.
    pub async fn close_channel(
        &self,
        agent_id: &str,
        channel_id: &ChannelId,
    ) -> Result<(), ChannelError> {
        let channel = self.get_channel_entry(agent_id, channel_id).await?;
        let sequencer = self.ensure_sequencer(&channel).await?;
        let (own_proof, partner_proof) = {
            let guard = sequencer.lock().await;
            (guard.own_proof.clone(), guard.partner_proof.clone())
        };

        let ledger = self.ledgers.ledger_for(agent_id, channel.chain).await?;

        if let (Some(own), Some(partner)) = (&own_proof, &partner_proof) {
            if own.proof.nonce == partner.proof.nonce {
                match ledger.cooperative_settle(channel_id, own, partner).await {
                    Ok(receipt) => {
                        info!(
                            channel_id = %channel_id,
                            nonce = own.proof.nonce,
                            tx_hash = %receipt.tx_hash,
                            "Channel settled cooperatively"
                        );
                        self.finalize_close(&channel, true).await?;
                        return Ok(());
                    }
                    Err(ChannelError::Unsupported(_)) => {
                        debug!(channel_id = %channel_id, "Chain has no cooperative path, closing unilaterally");
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let partner_signed = partner_proof.unwrap_or_else(|| zero_proof(channel_id));
        ledger.close_channel(channel_id, &partner_signed).await?;
        self.mark_challenge(channel_id);
        info!(
            channel_id = %channel_id,
            "Unilateral close submitted, settlement scheduled after challenge period"
        );

        let manager = self.arc();
        let agent = agent_id.to_string();
        let id = *channel_id;
        let challenge = Duration::from_secs(self.config.settlement_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(challenge).await;
            if let Err(e) = manager.settle_after_challenge(&agent, &id).await {
                error!(channel_id = %id, error = %e, "Scheduled settlement failed");
            }
        });

        Ok(())
    }

    /// Finalize a unilateral close once the challenge period has elapsed.
    pub async fn settle_after_challenge(
        &self,
        agent_id: &str,
        channel_id: &ChannelId,
    ) -> Result<(), ChannelError> {
        let channel = self.get_channel_entry(agent_id, channel_id).await?;
        let sequencer = self.ensure_sequencer(&channel).await?;
        let (own_proof, partner_proof) = {
            let guard = sequencer.lock().await;
            (guard.own_proof.clone(), guard.partner_proof.clone())
        };

        let own = own_proof
            .map(|p| p.proof)
            .unwrap_or_else(|| zero_proof(channel_id).proof);
        let partner = partner_proof
            .map(|p| p.proof)
            .unwrap_or_else(|| zero_proof(channel_id).proof);

        let ledger = self.ledgers.ledger_for(agent_id, channel.chain).await?;
        match ledger.settle_channel(channel_id, &own, &partner).await {
            Ok(_) => self.finalize_close(&channel, false).await,
            Err(ChannelError::Unsupported(_)) => {
                // Chains without an explicit settle step (XRP) finish on
                // their own once the delay elapses
                let state = ledger.channel_state(channel_id).await?;
                if state.phase == SettlementPhase::Settled {
                    self.finalize_close(&channel, false).await
                } else {
                    Ok(())
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Record a pending unilateral close on the cached channel
    fn mark_challenge(&self, channel_id: &ChannelId) {
        if let Some(cached) = self.cache.write().unwrap().get_mut(channel_id) {
            cached.state = ChannelState::Challenge;
        }
    }

    /// Mark a channel closed in store and cache and emit telemetry.
    /// Idempotent: the second caller (ledger event vs close path) is a no-op.
    async fn finalize_close(&self, channel: &Channel, cooperative: bool) -> Result<(), ChannelError> {
        // Store write precedes cache removal
        db::mark_channel_closed(&self.pool, &channel.channel_id.to_hex(), Utc::now())
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;

        let was_cached = self
            .cache
            .write()
            .unwrap()
            .remove(&channel.channel_id)
            .is_some();
        self.sequencers.lock().unwrap().remove(&channel.channel_id);

        if was_cached {
            self.telemetry.publish(TelemetryEvent::AgentChannelClosed {
                agent_id: channel.agent_id.clone(),
                channel_id: channel.channel_id.to_hex(),
                cooperative,
            });
        }
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Channels for an agent, cache-first with store fallback
    pub async fn get_agent_channels(&self, agent_id: &str) -> Result<Vec<Channel>, ChannelError> {
        let cached: Vec<Channel> = {
            let cache = self.cache.read().unwrap();
            cache
                .values()
                .filter(|c| c.agent_id == agent_id)
                .cloned()
                .collect()
        };
        if !cached.is_empty() {
            return Ok(cached);
        }

        let rows = db::list_active_channels(&self.pool, agent_id)
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;
        let mut channels = Vec::with_capacity(rows.len());
        for row in &rows {
            let channel = Channel::from_row(row)?;
            self.cache
                .write()
                .unwrap()
                .insert(channel.channel_id, channel.clone());
            channels.push(channel);
        }
        Ok(channels)
    }

    /// Whether a channel is quarantined (reconciliation fault observed)
    pub async fn is_quarantined(&self, channel_id: &ChannelId) -> bool {
        let sequencer = {
            let sequencers = self.sequencers.lock().unwrap();
            sequencers.get(channel_id).cloned()
        };
        match sequencer {
            Some(sequencer) => sequencer.lock().await.quarantined,
            None => false,
        }
    }

    // ========================================================================
    // Rebalancing
    // ========================================================================

    /// Close and reopen any of the agent's channels whose remaining
    /// on-chain balance dropped below the configured floor. Per-channel
    /// failures are isolated.
    pub async fn check_channel_rebalancing(
        &self,
        agent_id: &str,
    ) -> Result<(), ChannelError> {
        if !self.config.rebalance_enabled {
            return Ok(());
        }

        let channels = self.get_agent_channels(agent_id).await?;
        for channel in channels {
            if let Err(e) = self.rebalance_one(agent_id, &channel).await {
                warn!(
                    channel_id = %channel.channel_id,
                    error = %e,
                    "Rebalance failed for channel; other channels unaffected"
                );
            }
        }
        Ok(())
    }

    async fn rebalance_one(
        &self,
        agent_id: &str,
        channel: &Channel,
    ) -> Result<(), ChannelError> {
        let ledger = self.ledgers.ledger_for(agent_id, channel.chain).await?;
        let state = ledger.channel_state(&channel.channel_id).await?;
        if state.phase != SettlementPhase::Open {
            return Ok(());
        }

        // Off-chain spending depletes the channel long before the ledger
        // sees it; remaining capacity counts the sequencer's cumulative
        // transferred amount, which is at or ahead of the on-chain view.
        let sequencer = self.ensure_sequencer(channel).await?;
        let (local_transferred, local_deposit) = {
            let guard = sequencer.lock().await;
            (guard.transferred, guard.deposit)
        };
        let deposit = state.own.total_deposit.max(local_deposit);
        let remaining = deposit
            .saturating_sub(state.own.total_withdrawn)
            .saturating_sub(local_transferred.max(state.own.transferred));
        if remaining >= self.config.min_channel_balance {
            return Ok(());
        }

        info!(
            channel_id = %channel.channel_id,
            remaining = %remaining,
            floor = %self.config.min_channel_balance,
            "Channel depleted, rebalancing"
        );

        self.close_channel(agent_id, &channel.channel_id).await?;
        let new_id = self
            .open_channel(
                agent_id,
                &channel.peer_id,
                channel.chain,
                channel.token,
                self.config.max_channel_balance,
            )
            .await?;

        info!(
            old_channel = %channel.channel_id,
            new_channel = %new_id,
            deposit = %self.config.max_channel_balance,
            "Rebalance complete"
        );
        Ok(())
    }

    /// Force-close any of the agent's channels idle past the configured
    /// maximum lifetime. The on-chain call is permissionless cleanup; here
    /// it is housekeeping for abandoned channels. Per-channel failures are
    /// isolated.
    pub async fn force_close_expired_channels(&self, agent_id: &str) -> Result<(), ChannelError> {
        let channels = self.get_agent_channels(agent_id).await?;
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.config.max_channel_lifetime_secs.min(i64::MAX as u64) as i64);

        for channel in channels {
            if channel.state != ChannelState::Active {
                continue;
            }
            let idle_since = channel.last_activity.unwrap_or(channel.opened_at);
            if idle_since > cutoff {
                continue;
            }

            let ledger = match self.ledgers.ledger_for(agent_id, channel.chain).await {
                Ok(ledger) => ledger,
                Err(e) => {
                    warn!(channel_id = %channel.channel_id, error = %e, "No adapter for expired channel");
                    continue;
                }
            };
            match ledger.force_close_expired(&channel.channel_id).await {
                Ok(receipt) => {
                    info!(
                        channel_id = %channel.channel_id,
                        tx_hash = %receipt.tx_hash,
                        "Expired channel force-closed"
                    );
                }
                Err(e) => {
                    warn!(channel_id = %channel.channel_id, error = %e, "Force-close failed; other channels unaffected");
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Long-running loops
    // ========================================================================

    /// Consume settlement triggers: settle the owed balance over an open
    /// channel to the peer, then report completion.
    pub async fn run_settlement_loop(
        self: Arc<Self>,
        accounts: Arc<AccountManager>,
        mut triggers: mpsc::Receiver<SettlementTrigger>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        info!("Settlement loop starting");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping settlement loop");
                    return;
                }
                trigger = triggers.recv() => match trigger {
                    Some(trigger) => self.handle_trigger(&accounts, trigger).await,
                    None => {
                        warn!("Settlement trigger channel closed");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_trigger(&self, accounts: &AccountManager, trigger: SettlementTrigger) {
        if !self.tracker.begin(&trigger.peer_id, &trigger.token) {
            debug!(peer_id = %trigger.peer_id, "Trigger no longer pending, skipping");
            return;
        }

        let result = self.settle_with_peer(&trigger).await;
        match result {
            Ok(settled) => {
                accounts.record_settlement(&trigger.peer_id, &trigger.token, settled);
                self.telemetry.publish(TelemetryEvent::SettlementCompleted {
                    peer_id: trigger.peer_id.clone(),
                    token: trigger.token.clone(),
                    success: true,
                    error_message: None,
                });
            }
            Err(e) => {
                warn!(peer_id = %trigger.peer_id, error = %e, "Settlement failed; rebalance loop will retry");
                self.telemetry.publish(TelemetryEvent::SettlementCompleted {
                    peer_id: trigger.peer_id.clone(),
                    token: trigger.token.clone(),
                    success: false,
                    error_message: Some(e.to_string()),
                });
            }
        }
        self.tracker.complete(&trigger.peer_id, &trigger.token);
    }

    async fn settle_with_peer(
        &self,
        trigger: &SettlementTrigger,
    ) -> Result<U256, ChannelError> {
        let channel = {
            let cache = self.cache.read().unwrap();
            cache
                .values()
                .find(|c| {
                    c.peer_id == trigger.peer_id
                        && c.token.encode() == trigger.token
                        && c.state == ChannelState::Active
                })
                .cloned()
        }
        .ok_or_else(|| {
            ChannelError::ChannelNotFound(format!(
                "no open channel to {} for {}",
                trigger.peer_id, trigger.token
            ))
        })?;

        self.send_payment(&channel.agent_id, &channel.channel_id, trigger.credit_balance)
            .await?;
        Ok(trigger.credit_balance)
    }

    /// Consume ledger events: dispute protection on adverse closes,
    /// store/cache reconciliation on settlements.
    pub async fn run_event_loop(
        self: Arc<Self>,
        mut events: mpsc::Receiver<ChannelEvent>,
        mut shutdown: mpsc::Receiver<()>,
    ) {
        info!("Ledger event loop starting");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Shutdown signal received, stopping event loop");
                    return;
                }
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle_ledger_event(event).await {
                            error!(error = %e, "Ledger event handling failed");
                        }
                    }
                    None => {
                        warn!("Ledger event channel closed");
                        return;
                    }
                }
            }
        }
    }

    async fn handle_ledger_event(&self, event: ChannelEvent) -> Result<(), ChannelError> {
        let channel = {
            let cache = self.cache.read().unwrap();
            cache.get(event.channel_id()).cloned()
        };
        let Some(channel) = channel else {
            debug!(channel_id = %event.channel_id(), "Event for unknown channel, ignoring");
            return Ok(());
        };

        match event {
            ChannelEvent::Opened { .. } => Ok(()),
            ChannelEvent::Closed {
                closing_participant,
                nonce,
                ..
            } => {
                let own_address = self
                    .signers
                    .handle(&channel.agent_id, channel.chain)
                    .map_err(|e| ChannelError::InvalidSignature(e.to_string()))?
                    .address;
                if closing_participant == own_address {
                    // Our own close; the scheduled settle handles the rest
                    return Ok(());
                }
                self.defend_close(&channel, nonce).await
            }
            ChannelEvent::Settled {
                channel_id,
                participant1_amount,
                participant2_amount,
                ..
            } => {
                self.telemetry.publish(TelemetryEvent::PaymentChannelSettled {
                    channel_id: channel_id.to_hex(),
                    participant1_amount: participant1_amount.to_string(),
                    participant2_amount: participant2_amount.to_string(),
                    cooperative: false,
                });
                self.finalize_close(&channel, false).await
            }
            ChannelEvent::CooperativeSettled {
                channel_id,
                participant1_amount,
                participant2_amount,
                ..
            } => {
                self.telemetry.publish(TelemetryEvent::PaymentChannelSettled {
                    channel_id: channel_id.to_hex(),
                    participant1_amount: participant1_amount.to_string(),
                    participant2_amount: participant2_amount.to_string(),
                    cooperative: true,
                });
                self.finalize_close(&channel, true).await
            }
        }
    }

    /// The counterparty closed. If their closing proof is staler than the
    /// one we hold, submit ours before the challenge period runs out; then
    /// schedule settlement. Missing the window means accepting the on-chain
    /// outcome — that is the trust-minimization boundary.
    async fn defend_close(&self, channel: &Channel, closing_nonce: u64) -> Result<(), ChannelError> {
        self.mark_challenge(&channel.channel_id);
        let sequencer = self.ensure_sequencer(channel).await?;
        let partner_proof = { sequencer.lock().await.partner_proof.clone() };

        let ledger = self.ledgers.ledger_for(&channel.agent_id, channel.chain).await?;
        if let Some(partner_proof) = partner_proof {
            if partner_proof.proof.nonce > closing_nonce {
                info!(
                    channel_id = %channel.channel_id,
                    closing_nonce,
                    held_nonce = partner_proof.proof.nonce,
                    "Counterparty closed with a stale proof, submitting newer one"
                );
                ledger
                    .update_non_closing_balance_proof(&channel.channel_id, &partner_proof)
                    .await?;
            }
        }

        let manager = self.arc();
        let agent = channel.agent_id.clone();
        let id = channel.channel_id;
        let challenge = Duration::from_secs(
            self.config
                .settlement_timeout_secs
                .saturating_add(self.config.challenge_period_slack_secs),
        );
        tokio::spawn(async move {
            tokio::time::sleep(challenge).await;
            if let Err(e) = manager.settle_after_challenge(&agent, &id).await {
                error!(channel_id = %id, error = %e, "Post-challenge settlement failed");
            }
        });
        Ok(())
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn require_active(&self, agent_id: &str) -> Result<(), ChannelError> {
        match self.lifecycle.get_state(agent_id) {
            Some(WalletState::Active) => Ok(()),
            Some(state) => Err(ChannelError::WalletNotActive {
                agent_id: agent_id.to_string(),
                state: state.as_str().to_string(),
            }),
            None => Err(ChannelError::WalletNotActive {
                agent_id: agent_id.to_string(),
                state: "UNKNOWN".to_string(),
            }),
        }
    }

    async fn get_channel_entry(
        &self,
        agent_id: &str,
        channel_id: &ChannelId,
    ) -> Result<Channel, ChannelError> {
        if let Some(channel) = self.cache.read().unwrap().get(channel_id) {
            if channel.agent_id == agent_id {
                return Ok(channel.clone());
            }
        }

        let row = db::get_channel(&self.pool, agent_id, &channel_id.to_hex())
            .await
            .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?
            .ok_or_else(|| ChannelError::ChannelNotFound(channel_id.to_hex()))?;
        if !row.is_active() {
            return Err(ChannelError::ChannelNotFound(channel_id.to_hex()));
        }

        let channel = Channel::from_row(&row)?;
        self.cache
            .write()
            .unwrap()
            .insert(channel.channel_id, channel.clone());
        Ok(channel)
    }

    async fn ensure_sequencer(
        &self,
        channel: &Channel,
    ) -> Result<Arc<tokio::sync::Mutex<ChannelSequencer>>, ChannelError> {
        if let Some(sequencer) = self.sequencers.lock().unwrap().get(&channel.channel_id) {
            return Ok(sequencer.clone());
        }

        // First touch since startup: rebuild from the ledger view plus
        // whatever proofs the store holds
        let ledger = self.ledgers.ledger_for(&channel.agent_id, channel.chain).await?;
        let state = ledger.channel_state(&channel.channel_id).await?;
        self.init_sequencer_from_store(
            channel,
            state.own.nonce,
            state.own.transferred,
            state.own.total_deposit,
            state.partner.total_deposit,
        )
        .await
        .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;

        Ok(self
            .sequencers
            .lock()
            .unwrap()
            .get(&channel.channel_id)
            .cloned()
            .expect("sequencer just inserted"))
    }
}

fn zero_proof(channel_id: &ChannelId) -> SignedBalanceProof {
    SignedBalanceProof {
        proof: BalanceProof {
            channel_id: *channel_id,
            nonce: 0,
            transferred_amount: U256::ZERO,
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        },
        signature: [0u8; SIGNATURE_LEN],
    }
}

fn proof_to_row(signed: &SignedBalanceProof, direction: &str) -> db::NewProof {
    db::NewProof {
        channel_id: signed.proof.channel_id.to_hex(),
        direction: direction.to_string(),
        nonce: signed.proof.nonce as i64,
        transferred_amount: signed.proof.transferred_amount.to_string(),
        locked_amount: signed.proof.locked_amount.to_string(),
        locks_root: hex::encode(signed.proof.locks_root),
        signature: hex::encode(signed.signature),
    }
}

fn proof_from_row(row: &db::ProofRow) -> Result<SignedBalanceProof, ChannelError> {
    let channel_id = ChannelId::from_hex(&row.channel_id)
        .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;
    let locks_root_bytes = hex::decode(&row.locks_root)
        .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;
    let signature_bytes = hex::decode(&row.signature)
        .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?;
    if locks_root_bytes.len() != 32 || signature_bytes.len() != SIGNATURE_LEN {
        return Err(ChannelError::PersistenceFailure(format!(
            "malformed proof row for channel {}",
            row.channel_id
        )));
    }
    let mut locks_root = [0u8; 32];
    locks_root.copy_from_slice(&locks_root_bytes);
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&signature_bytes);

    Ok(SignedBalanceProof {
        proof: BalanceProof {
            channel_id,
            nonce: row.nonce as u64,
            transferred_amount: paychan_rs::types::parse_amount(&row.transferred_amount)
                .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?,
            locked_amount: paychan_rs::types::parse_amount(&row.locked_amount)
                .map_err(|e| ChannelError::PersistenceFailure(e.to_string()))?,
            locks_root,
        },
        signature,
    })
}

// ============================================================================
// Production ledger factory
// ============================================================================

/// Builds and caches chain clients per (agent, chain) from the connector
/// configuration and the signer service.
pub struct ChainRouter {
    signers: Arc<SignerService>,
    evm: crate::config::EvmConfig,
    xrp: crate::config::XrpConfig,
    evm_address: Address,
    clients: tokio::sync::Mutex<HashMap<(String, ChainTag), Arc<Ledger>>>,
}

impl ChainRouter {
    pub fn new(
        signers: Arc<SignerService>,
        evm: crate::config::EvmConfig,
        xrp: crate::config::XrpConfig,
    ) -> eyre::Result<Self> {
        let evm_address: Address = evm.channels_address.parse().map_err(|e| {
            eyre::eyre!("Invalid channels contract address {}: {}", evm.channels_address, e)
        })?;
        Ok(Self {
            signers,
            evm,
            xrp,
            evm_address,
            clients: tokio::sync::Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl LedgerFactory for ChainRouter {
    async fn ledger_for(
        &self,
        agent_id: &str,
        chain: ChainTag,
    ) -> Result<Arc<Ledger>, ChannelError> {
        let key = (agent_id.to_string(), chain);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let ledger = match chain {
            ChainTag::Evm => {
                let signer = self
                    .signers
                    .evm_signer(agent_id)
                    .map_err(|e| ChannelError::InvalidSignature(e.to_string()))?;
                let client = paychan_rs::evm::EvmChannelClient::with_signer(
                    &self.evm.rpc_url,
                    self.evm.chain_id,
                    self.evm_address,
                    signer,
                    Duration::from_secs(self.evm.confirmation_timeout_secs),
                )
                .map_err(|e| ChannelError::LedgerUnavailable(e.to_string()))?;
                Ledger::Evm(client)
            }
            ChainTag::Xrp => {
                if !self.xrp.enabled {
                    return Err(ChannelError::Unsupported(ChainTag::Xrp));
                }
                let signer = self
                    .signers
                    .xrp_signer(agent_id)
                    .map_err(|e| ChannelError::InvalidSignature(e.to_string()))?;
                let client = paychan_rs::xrp::XrpChannelClient::connect(
                    paychan_rs::xrp::client::XrpChannelConfig {
                        rpc_url: self.xrp.rpc_url.clone(),
                        confirmation_timeout: Duration::from_secs(60),
                    },
                    signer,
                )
                .await
                .map_err(|e| ChannelError::LedgerUnavailable(e.to_string()))?;
                Ledger::Xrp(client)
            }
        };

        let ledger = Arc::new(ledger);
        clients.insert(key, ledger.clone());
        Ok(ledger)
    }

    fn proof_domain(&self, chain: ChainTag) -> ProofDomain {
        match chain {
            ChainTag::Evm => ProofDomain::new(self.evm.chain_id, self.evm_address),
            // XRP claims carry their own channel-scoped format; the domain
            // is unused there
            ChainTag::Xrp => ProofDomain::new(0, Address::ZERO),
        }
    }
}
