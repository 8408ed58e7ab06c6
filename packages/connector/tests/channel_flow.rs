//! End-to-end channel flows against the mock ledger: open/pay/close
//! lifecycles, restart reconstruction, concurrent opens, rebalancing,
//! disputed closes and the settlement trigger path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use alloy::primitives::U256;
use async_trait::async_trait;
use tokio::sync::mpsc;

use paychan_connector::accounts::AccountManager;
use paychan_connector::channels::{ChannelManager, LedgerFactory};
use paychan_connector::config::ChannelsConfig;
use paychan_connector::db;
use paychan_connector::lifecycle::WalletLifecycle;
use paychan_connector::peer::{LocalTransport, PeerDirectory, PeerRequest, PeerResponse};
use paychan_connector::settlement::{SettlementMonitor, SettlementTracker};

use paychan_rs::adapter::{ChannelEvent, Ledger, LedgerAdapter};
use paychan_rs::error::ChannelError;
use paychan_rs::proof::{
    encode_proof_message, sign_balance_proof, BalanceProof, ProofDomain, SignedBalanceProof,
};
use paychan_rs::signer::SignerService;
use paychan_rs::telemetry::{TelemetryBus, TelemetryEvent};
use paychan_rs::testing::{MockLedger, MockLedgerState};
use paychan_rs::types::{ChainTag, ChannelId, ChannelState, SettlementPhase, TokenId};

const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

fn test_domain() -> ProofDomain {
    ProofDomain::new(31337, alloy::primitives::Address::ZERO)
}

fn test_channels_config(rebalance_enabled: bool) -> ChannelsConfig {
    ChannelsConfig {
        settlement_timeout_secs: 21_600,
        min_channel_balance: U256::from(100u64),
        max_channel_balance: U256::from(10_000u64),
        rebalance_enabled,
        challenge_period_slack_secs: 300,
        max_channel_lifetime_secs: 90 * 24 * 60 * 60,
        settlement_threshold: U256::from(10_000u64),
    }
}

/// Ledger factory handing out agent-bound handles onto one shared mock chain
struct MockFactory {
    state: Arc<Mutex<MockLedgerState>>,
    signers: Arc<SignerService>,
    domain: ProofDomain,
}

#[async_trait]
impl LedgerFactory for MockFactory {
    async fn ledger_for(
        &self,
        agent_id: &str,
        _chain: ChainTag,
    ) -> Result<Arc<Ledger>, ChannelError> {
        let address = self
            .signers
            .evm_signer(agent_id)
            .map_err(|e| ChannelError::InvalidSignature(e.to_string()))?
            .address();
        Ok(Arc::new(Ledger::Mock(MockLedger::new(
            self.state.clone(),
            format!("{}", address),
            self.domain,
        ))))
    }

    fn proof_domain(&self, _chain: ChainTag) -> ProofDomain {
        self.domain
    }
}

struct Harness {
    pool: sqlx::SqlitePool,
    bus: TelemetryBus,
    tracker: SettlementTracker,
    signers: Arc<SignerService>,
    lifecycle: Arc<WalletLifecycle>,
    directory: Arc<PeerDirectory>,
    state: Arc<Mutex<MockLedgerState>>,
    manager: Arc<ChannelManager>,
    registry: Arc<Mutex<HashMap<String, mpsc::Sender<PeerRequest>>>>,
}

impl Harness {
    async fn new(
        db_url: &str,
        state: Arc<Mutex<MockLedgerState>>,
        config: ChannelsConfig,
    ) -> Self {
        let pool = db::create_pool(db_url).await.unwrap();
        db::run_migrations(&pool).await.unwrap();

        let bus = TelemetryBus::new();
        let tracker = SettlementTracker::new();
        let signers = Arc::new(SignerService::from_mnemonic(TEST_MNEMONIC).unwrap());
        let lifecycle = Arc::new(WalletLifecycle::new(pool.clone(), bus.clone()));
        let directory = Arc::new(PeerDirectory::new());
        let registry = LocalTransport::registry();
        let transport = Arc::new(LocalTransport::new(
            "connector",
            registry.clone(),
            Duration::from_millis(500),
            2,
            Duration::from_millis(20),
        ));
        let factory = Arc::new(MockFactory {
            state: state.clone(),
            signers: signers.clone(),
            domain: test_domain(),
        });

        let manager = ChannelManager::new(
            pool.clone(),
            lifecycle.clone(),
            signers.clone(),
            factory,
            transport,
            directory.clone(),
            bus.clone(),
            tracker.clone(),
            config,
        );

        Self {
            pool,
            bus,
            tracker,
            signers,
            lifecycle,
            directory,
            state,
            manager,
            registry,
        }
    }

    /// Create + fund a wallet and publish the agent's chain address
    fn activate(&self, agent_id: &str) {
        self.lifecycle.create_wallet(agent_id).unwrap();
        self.lifecycle.confirm_funding(agent_id).unwrap();
        self.register_peer(agent_id);
    }

    /// Publish an agent's EVM address so others can open channels to it
    fn register_peer(&self, agent_id: &str) {
        self.directory
            .register_address(agent_id, ChainTag::Evm, &self.evm_address(agent_id));
    }

    fn evm_address(&self, agent_id: &str) -> String {
        format!("{}", self.signers.evm_signer(agent_id).unwrap().address())
    }

    /// Run an endpoint that acknowledges every proof sent to `peer_id`
    fn spawn_auto_ack(&self, peer_id: &str) {
        let transport = LocalTransport::new(
            peer_id,
            self.registry.clone(),
            Duration::from_millis(500),
            1,
            Duration::from_millis(10),
        );
        let mut inbox = transport.open_inbox(64);
        tokio::spawn(async move {
            while let Some(request) = inbox.recv().await {
                let _ = request.respond.send(PeerResponse::Ack);
            }
        });
    }

    /// A balance proof signed by `peer_agent`, wire-encoded
    fn peer_proof(
        &self,
        peer_agent: &str,
        channel_id: &ChannelId,
        nonce: u64,
        transferred: u64,
    ) -> Vec<u8> {
        let proof = BalanceProof {
            channel_id: *channel_id,
            nonce,
            transferred_amount: U256::from(transferred),
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        };
        let signer = self.signers.evm_signer(peer_agent).unwrap();
        let signature = sign_balance_proof(&proof, &test_domain(), &signer).unwrap();
        encode_proof_message(&SignedBalanceProof { proof, signature })
    }

    fn mock_for(&self, agent_id: &str) -> MockLedger {
        MockLedger::new(
            self.state.clone(),
            self.evm_address(agent_id),
            test_domain(),
        )
    }
}

fn temp_db_url(tag: &str) -> String {
    let path = std::env::temp_dir().join(format!(
        "paychan-{}-{}-{}.db",
        tag,
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .subsec_nanos()
    ));
    format!("sqlite://{}", path.display())
}

// ============================================================================
// Scenario A: open, pay five times, close cooperatively
// ============================================================================

#[tokio::test]
async fn scenario_a_evm_happy_path() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");
    harness.spawn_auto_ack("agent-002");
    let mut events = harness.bus.subscribe();

    let channel_id = harness
        .manager
        .open_channel(
            "agent-001",
            "agent-002",
            ChainTag::Evm,
            TokenId::Native,
            U256::from(1_000_000u64),
        )
        .await
        .unwrap();

    // Channel id is 32-byte hex
    let hex = channel_id.to_hex();
    assert!(hex.starts_with("0x"));
    assert_eq!(hex.len(), 66);

    let channels = harness.manager.get_agent_channels("agent-001").await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].channel_id, channel_id);
    assert_eq!(channels[0].state, ChannelState::Active);

    // Five payments: contiguous nonces, cumulative transfers, advancing
    // activity timestamps
    let mut last_activity = None;
    for i in 1..=5u64 {
        let nonce = harness
            .manager
            .send_payment("agent-001", &channel_id, U256::from(10_000u64))
            .await
            .unwrap();
        assert_eq!(nonce, i);

        let sent = db::get_proof(&harness.pool, &channel_id.to_hex(), "sent")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sent.nonce, i as i64);
        assert_eq!(sent.transferred_amount, (10_000 * i).to_string());

        let row = db::get_channel(&harness.pool, "agent-001", &channel_id.to_hex())
            .await
            .unwrap()
            .unwrap();
        let activity = row.last_activity.expect("activity recorded");
        if let Some(previous) = last_activity {
            assert!(activity >= previous);
        }
        last_activity = Some(activity);
    }

    // Counterparty counter-signs the final state; close takes the
    // cooperative path
    let payload = harness.peer_proof("agent-002", &channel_id, 5, 0);
    harness
        .manager
        .receive_balance_proof("agent-001", "agent-002", &payload)
        .await
        .unwrap();

    harness
        .manager
        .close_channel("agent-001", &channel_id)
        .await
        .unwrap();

    assert!(harness
        .manager
        .get_agent_channels("agent-001")
        .await
        .unwrap()
        .is_empty());

    let mock = harness.mock_for("agent-001");
    let state = mock.channel_state(&channel_id).await.unwrap();
    assert_eq!(state.phase, SettlementPhase::Settled);

    let mut saw_closed = false;
    while let Ok(event) = events.try_recv() {
        if let TelemetryEvent::AgentChannelClosed { cooperative, channel_id: id, .. } = event {
            assert!(cooperative);
            assert_eq!(id, channel_id.to_hex());
            saw_closed = true;
        }
    }
    assert!(saw_closed, "AGENT_CHANNEL_CLOSED not emitted");
}

// ============================================================================
// Scenario B: restart reconstruction from the store
// ============================================================================

#[tokio::test]
async fn scenario_b_restart_reconstruction() {
    let db_url = temp_db_url("restart");
    let chain = MockLedgerState::shared();

    let (id_a, id_b) = {
        let harness = Harness::new(&db_url, chain.clone(), test_channels_config(false)).await;
        harness.activate("agent-001");
        harness.register_peer("agent-002");
        harness.register_peer("agent-003");

        let id_a = harness
            .manager
            .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(500u64))
            .await
            .unwrap();
        let id_b = harness
            .manager
            .open_channel("agent-001", "agent-003", ChainTag::Evm, TokenId::Native, U256::from(500u64))
            .await
            .unwrap();
        (id_a, id_b)
        // Harness dropped here: the "process" dies with both channels persisted
    };

    let harness = Harness::new(&db_url, chain, test_channels_config(false)).await;
    harness.manager.recover().await.unwrap();

    let mut ids: Vec<String> = harness
        .manager
        .get_agent_channels("agent-001")
        .await
        .unwrap()
        .iter()
        .map(|c| c.channel_id.to_hex())
        .collect();
    ids.sort();
    let mut expected = vec![id_a.to_hex(), id_b.to_hex()];
    expected.sort();
    assert_eq!(ids, expected);
}

// ============================================================================
// Scenario C: concurrent multi-agent opens in a ring
// ============================================================================

#[tokio::test]
async fn scenario_c_concurrent_ring_opens() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    for agent in ["agent-001", "agent-002", "agent-003"] {
        harness.activate(agent);
    }

    let (a, b, c) = tokio::join!(
        harness.manager.open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(100u64)),
        harness.manager.open_channel("agent-002", "agent-003", ChainTag::Evm, TokenId::Native, U256::from(100u64)),
        harness.manager.open_channel("agent-003", "agent-001", ChainTag::Evm, TokenId::Native, U256::from(100u64)),
    );
    let ids = [a.unwrap(), b.unwrap(), c.unwrap()];

    for id in &ids {
        assert_eq!(id.to_hex().len(), 66);
    }
    assert_ne!(ids[0], ids[1]);
    assert_ne!(ids[1], ids[2]);
    assert_ne!(ids[0], ids[2]);

    for agent in ["agent-001", "agent-002", "agent-003"] {
        assert_eq!(
            harness.manager.get_agent_channels(agent).await.unwrap().len(),
            1
        );
    }
}

#[tokio::test]
async fn concurrent_identical_opens_collapse_to_one() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");

    let (first, second) = tokio::join!(
        harness.manager.open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(100u64)),
        harness.manager.open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(100u64)),
    );

    assert_eq!(first.unwrap(), second.unwrap());
    let mock = harness.mock_for("agent-001");
    assert_eq!(mock.open_count(), 1);
}

// ============================================================================
// Scenario D: rebalance on depletion
// ============================================================================

#[tokio::test]
async fn scenario_d_rebalance_closes_and_reopens() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(true),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");
    harness.spawn_auto_ack("agent-002");

    let old_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(200u64))
        .await
        .unwrap();

    // Counter-signed state at the upcoming nonce lets the rebalance close
    // cooperatively (and therefore immediately)
    let payload = harness.peer_proof("agent-002", &old_id, 1, 0);
    harness
        .manager
        .receive_balance_proof("agent-001", "agent-002", &payload)
        .await
        .unwrap();

    harness
        .manager
        .send_payment("agent-001", &old_id, U256::from(150u64))
        .await
        .unwrap();

    // Remaining 50 < floor 100: the detached rebalance task (and this
    // explicit sweep) must close the old channel and open a fresh one
    harness
        .manager
        .check_channel_rebalancing("agent-001")
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let new_id = loop {
        let channels = harness.manager.get_agent_channels("agent-001").await.unwrap();
        if channels.len() == 1 && channels[0].channel_id != old_id {
            break channels[0].channel_id;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "rebalance did not converge: {:?}",
            channels
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    };

    assert_ne!(new_id, old_id);
    let old_row = db::get_channel(&harness.pool, "agent-001", &old_id.to_hex())
        .await
        .unwrap()
        .unwrap();
    assert!(old_row.closed_at.is_some());

    // The fresh channel carries the configured rebalance deposit
    let mock = harness.mock_for("agent-001");
    let state = mock.channel_state(&new_id).await.unwrap();
    assert_eq!(state.own.total_deposit, U256::from(10_000u64));
}

// ============================================================================
// Scenario E: disputed close with a stale proof
// ============================================================================

#[tokio::test]
async fn scenario_e_disputed_close_submits_newer_proof() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");

    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1_000u64))
        .await
        .unwrap();

    // The peer funds their side, then pays us over several proofs; we hold
    // up to nonce 5
    let peer_mock = harness.mock_for("agent-002");
    peer_mock
        .set_total_deposit(&channel_id, U256::from(500u64))
        .await
        .unwrap();
    for (nonce, transferred) in [(2u64, 10u64), (5, 40)] {
        let payload = harness.peer_proof("agent-002", &channel_id, nonce, transferred);
        harness
            .manager
            .receive_balance_proof("agent-001", "agent-002", &payload)
            .await
            .unwrap();
    }

    // Wire ledger events into the manager and start the dispute handler
    let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(16);
    let (_shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let mock = harness.mock_for("agent-001");
    mock.set_event_sink(event_tx);
    tokio::spawn(harness.manager.clone().run_event_loop(event_rx, shutdown_rx));

    // Peer closes with the stale nonce-2 proof
    mock.simulate_partner_close(
        &channel_id,
        &harness.evm_address("agent-002"),
        2,
        U256::from(10u64),
    )
    .unwrap();

    // The manager must override it with the nonce-5 proof within the window
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let state = mock.channel_state(&channel_id).await.unwrap();
        if state.partner.nonce == 5 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stale closing proof was never overridden: {:?}",
            state
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // While the challenge runs, the channel is no longer payable
    let channels = harness.manager.get_agent_channels("agent-001").await.unwrap();
    assert_eq!(channels[0].state, ChannelState::Challenge);
    let err = harness
        .manager
        .send_payment("agent-001", &channel_id, U256::from(1u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Reverted { reason } if reason == "InvalidState"));

    // Challenge elapses; the payout reflects the nonce-5 cumulative amount
    harness
        .manager
        .settle_after_challenge("agent-001", &channel_id)
        .await
        .unwrap();

    let state = mock.channel_state(&channel_id).await.unwrap();
    assert_eq!(state.phase, SettlementPhase::Settled);
    assert_eq!(state.partner.transferred, U256::from(40u64));

    assert!(harness
        .manager
        .get_agent_channels("agent-001")
        .await
        .unwrap()
        .is_empty());
}

// ============================================================================
// Scenario F: credit limit breach
// ============================================================================

#[tokio::test]
async fn scenario_f_credit_limit_breach_emits_no_trigger() {
    let bus = TelemetryBus::new();
    let tracker = SettlementTracker::new();
    let accounts = AccountManager::new(bus.clone(), tracker.clone());
    let (trigger_tx, mut trigger_rx) = mpsc::channel(8);
    let monitor = SettlementMonitor::new(bus.clone(), tracker, U256::from(10_000u64), trigger_tx);
    let (_shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    tokio::spawn(monitor.run(shutdown_rx));

    accounts.set_credit_limit("agent-002", "native", Some(U256::from(10_000u64)));
    accounts
        .record_packet_transfers("agent-002", "native", U256::ZERO, U256::from(9_500u64))
        .unwrap();

    let err = accounts
        .record_packet_transfers("agent-002", "native", U256::ZERO, U256::from(600u64))
        .unwrap_err();
    assert!(matches!(err, ChannelError::CreditLimitExceeded { .. }));

    let (_, credit) = accounts.balances("agent-002", "native");
    assert_eq!(credit, U256::from(9_500u64));

    // Below threshold and failed mutations produce no settlement trigger
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(trigger_rx.try_recv().is_err());
}

// ============================================================================
// Settlement trigger end to end
// ============================================================================

#[tokio::test]
async fn settlement_trigger_flows_through_channel() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");
    harness.spawn_auto_ack("agent-002");

    let accounts = Arc::new(AccountManager::new(
        harness.bus.clone(),
        harness.tracker.clone(),
    ));
    let (trigger_tx, trigger_rx) = mpsc::channel(8);
    let monitor = SettlementMonitor::new(
        harness.bus.clone(),
        harness.tracker.clone(),
        U256::from(10_000u64),
        trigger_tx,
    );
    let (_shutdown_tx1, shutdown_rx1) = mpsc::channel::<()>(1);
    let (_shutdown_tx2, shutdown_rx2) = mpsc::channel::<()>(1);
    tokio::spawn(monitor.run(shutdown_rx1));
    tokio::spawn(harness.manager.clone().run_settlement_loop(
        accounts.clone(),
        trigger_rx,
        shutdown_rx2,
    ));

    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(50_000u64))
        .await
        .unwrap();

    let mut events = harness.bus.subscribe();

    // Crossing the threshold triggers a settlement over the channel
    accounts
        .record_packet_transfers("agent-002", "native", U256::ZERO, U256::from(12_000u64))
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let (_, credit) = accounts.balances("agent-002", "native");
        if credit == U256::ZERO {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "settlement never completed; credit still {}",
            credit
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // Completion telemetry publishes just after the balance update lands
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The settlement rode the channel as a signed payment
    let sent = db::get_proof(&harness.pool, &channel_id.to_hex(), "sent")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.transferred_amount, "12000");

    let mut saw_triggered = false;
    let mut saw_completed = false;
    while let Ok(event) = events.try_recv() {
        match event {
            TelemetryEvent::SettlementTriggered { exceeds_by, .. } => {
                assert_eq!(exceeds_by, "2000");
                saw_triggered = true;
            }
            TelemetryEvent::SettlementCompleted { success, .. } => {
                assert!(success);
                saw_completed = true;
            }
            _ => {}
        }
    }
    assert!(saw_triggered, "SETTLEMENT_TRIGGERED not observed");
    assert!(saw_completed, "SETTLEMENT_COMPLETED not observed");
}

// ============================================================================
// Ordering and gating laws
// ============================================================================

#[tokio::test]
async fn concurrent_payments_yield_contiguous_nonces() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");
    harness.spawn_auto_ack("agent-002");

    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1_000_000u64))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let manager = harness.manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .send_payment("agent-001", &channel_id, U256::from(100u64))
                .await
                .unwrap()
        }));
    }

    let mut nonces = Vec::new();
    for handle in handles {
        nonces.push(handle.await.unwrap());
    }
    nonces.sort_unstable();
    assert_eq!(nonces, (1..=10).collect::<Vec<u64>>());
}

#[tokio::test]
async fn wallet_gate_blocks_inactive_agents() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.register_peer("agent-002");

    // Unknown agent
    let err = harness
        .manager
        .open_channel("agent-404", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::WalletNotActive { .. }));

    // PENDING agent (created, never funded)
    harness.lifecycle.create_wallet("agent-001").unwrap();
    harness.register_peer("agent-001");
    let err = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1u64))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::WalletNotActive { ref state, .. } if state == "PENDING"
    ));

    // Suspension gates new payments
    harness.lifecycle.confirm_funding("agent-001").unwrap();
    harness.spawn_auto_ack("agent-002");
    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1_000u64))
        .await
        .unwrap();
    harness.lifecycle.suspend("agent-001", "hold").unwrap();
    let err = harness
        .manager
        .send_payment("agent-001", &channel_id, U256::from(10u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::WalletNotActive { .. }));
}

#[tokio::test]
async fn unknown_peer_fails_open() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");

    let err = harness
        .manager
        .open_channel("agent-001", "agent-999", ChainTag::Evm, TokenId::Native, U256::from(1u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::PeerUnknown { .. }));
}

#[tokio::test]
async fn zero_deposit_channel_rejects_payments() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");

    // Deposit 0 on open is permitted by the contract
    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::ZERO)
        .await
        .unwrap();

    // But a payment over it must fail the deposit bound
    let err = harness
        .manager
        .send_payment("agent-001", &channel_id, U256::from(1u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::TransferredExceedsDeposit { .. }));
}

#[tokio::test]
async fn failed_delivery_retains_nonce_for_retransmission() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");
    // No inbox for agent-002: every delivery fails at the transport

    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1_000u64))
        .await
        .unwrap();

    let err = harness
        .manager
        .send_payment("agent-001", &channel_id, U256::from(10u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::TransportRejected { .. }));

    // The nonce was issued and persisted despite the failure
    let sent = db::get_proof(&harness.pool, &channel_id.to_hex(), "sent")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sent.nonce, 1);

    // Once the peer comes up, the next payment continues the sequence
    harness.spawn_auto_ack("agent-002");
    let nonce = harness
        .manager
        .send_payment("agent-001", &channel_id, U256::from(10u64))
        .await
        .unwrap();
    assert_eq!(nonce, 2);
}

#[tokio::test]
async fn stale_inbound_proof_quarantines_channel() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");
    harness.spawn_auto_ack("agent-002");

    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1_000u64))
        .await
        .unwrap();
    harness
        .mock_for("agent-002")
        .set_total_deposit(&channel_id, U256::from(100u64))
        .await
        .unwrap();

    let newer = harness.peer_proof("agent-002", &channel_id, 3, 30);
    harness
        .manager
        .receive_balance_proof("agent-001", "agent-002", &newer)
        .await
        .unwrap();

    // A nonce at or below the accepted one is a reconciliation fault
    let stale = harness.peer_proof("agent-002", &channel_id, 3, 30);
    let err = harness
        .manager
        .receive_balance_proof("agent-001", "agent-002", &stale)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::NonceNotMonotonic { expected: 3, got: 3 }));

    // Quarantined channels refuse further sends
    assert!(harness.manager.is_quarantined(&channel_id).await);
    let err = harness
        .manager
        .send_payment("agent-001", &channel_id, U256::from(1u64))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Quarantined(_)));
}

#[tokio::test]
async fn unfunded_peer_proof_is_rejected() {
    let harness = Harness::new(
        "sqlite::memory:",
        MockLedgerState::shared(),
        test_channels_config(false),
    )
    .await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");

    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(1_000u64))
        .await
        .unwrap();

    // The peer never deposited: any claimed spending exceeds their zero
    // capacity, even after reconciling against the ledger
    let payload = harness.peer_proof("agent-002", &channel_id, 1, 10);
    let err = harness
        .manager
        .receive_balance_proof("agent-001", "agent-002", &payload)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::TransferredExceedsDeposit { .. }));
    assert!(harness.manager.is_quarantined(&channel_id).await);
}

#[tokio::test]
async fn expired_idle_channels_are_force_closed() {
    let mut config = test_channels_config(false);
    config.max_channel_lifetime_secs = 0;

    let harness = Harness::new("sqlite::memory:", MockLedgerState::shared(), config).await;
    harness.activate("agent-001");
    harness.register_peer("agent-002");

    let channel_id = harness
        .manager
        .open_channel("agent-001", "agent-002", ChainTag::Evm, TokenId::Native, U256::from(100u64))
        .await
        .unwrap();

    harness
        .manager
        .force_close_expired_channels("agent-001")
        .await
        .unwrap();

    let mock = harness.mock_for("agent-001");
    let state = mock.channel_state(&channel_id).await.unwrap();
    assert_eq!(state.phase, SettlementPhase::ClosedChallenge);
}

#[tokio::test]
async fn cooperative_settle_rejects_mismatched_nonces() {
    let state = MockLedgerState::shared();
    let signers = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
    let address = format!("{}", signers.evm_signer("agent-001").unwrap().address());
    let mock = MockLedger::new(state, address, test_domain());

    let (channel_id, _) = mock
        .open_channel("0x00000000000000000000000000000000000000bb", TokenId::Native, 21_600, U256::from(100u64))
        .await
        .unwrap();

    let proof_at = |nonce: u64| SignedBalanceProof {
        proof: BalanceProof {
            channel_id,
            nonce,
            transferred_amount: U256::ZERO,
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        },
        signature: [0u8; 65],
    };

    let err = mock
        .cooperative_settle(&channel_id, &proof_at(4), &proof_at(3))
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::Reverted { reason } if reason == "NonceMismatch"));
}
