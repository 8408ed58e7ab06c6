//! XRP PayChannel client
//!
//! Maps the ledger-adapter contract onto the XRP Ledger's native payment
//! channel primitives (PaymentChannelCreate / PaymentChannelFund /
//! PaymentChannelClaim) over JSON-RPC to a trusted rippled node.
//!
//! Transaction submission uses the node's sign-and-submit mode with the
//! account seed; this mirrors the trust model of a co-located validator
//! node. Claims — the hot path — are always signed locally.

use alloy::primitives::U256;
use async_trait::async_trait;
use eyre::{eyre, Result, WrapErr};
use serde_json::{json, Value};
use sha2::{Digest, Sha512};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::adapter::{ConfirmedTx, LedgerAdapter};
use crate::error::{normalize_ledger_error, ChannelError};
use crate::proof::{BalanceProof, SignedBalanceProof, WithdrawProof};
use crate::signer::XrpSigner;
use crate::types::{
    amount_to_drops, ChainTag, ChannelId, OnChainChannelState, ParticipantState, SettlementPhase,
    TokenId,
};

/// Seconds between the ripple epoch (2000-01-01) and the unix epoch
const RIPPLE_EPOCH_OFFSET: u64 = 946_684_800;

/// PaymentChannelClaim flag requesting channel closure
const TF_CLOSE: u64 = 0x0002_0000;

/// Ledger-entry keyspace prefix for payment channels ('x')
const PAYCHAN_SPACE: [u8; 2] = [0x00, 0x78];

/// Configuration for the XRP channel client
#[derive(Clone)]
pub struct XrpChannelConfig {
    /// JSON-RPC URL of the trusted rippled node
    pub rpc_url: String,
    /// Per-operation confirmation timeout
    pub confirmation_timeout: Duration,
}

impl std::fmt::Debug for XrpChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XrpChannelConfig")
            .field("rpc_url", &self.rpc_url)
            .field("confirmation_timeout", &self.confirmation_timeout)
            .finish()
    }
}

/// XRP PayChannel client bound to one agent account
pub struct XrpChannelClient {
    client: reqwest::Client,
    rpc_url: String,
    signer: XrpSigner,
    /// Classic address of the agent's account on the ledger
    account: String,
    confirmation_timeout: Duration,
}

impl XrpChannelClient {
    /// Connect to the node and resolve the account address for the signer's
    /// seed (wallet_propose against the trusted node).
    pub async fn connect(config: XrpChannelConfig, signer: XrpSigner) -> Result<Self> {
        let client = reqwest::Client::new();
        let response = rpc_call(
            &client,
            &config.rpc_url,
            "wallet_propose",
            json!({
                "seed_hex": signer.seed_hex(),
                "key_type": "secp256k1",
            }),
        )
        .await
        .wrap_err("wallet_propose failed")?;

        let account = response["account_id"]
            .as_str()
            .ok_or_else(|| eyre!("wallet_propose returned no account_id"))?
            .to_string();

        info!(rpc_url = %config.rpc_url, account = %account, "XRP channel client initialized");

        Ok(Self {
            client,
            rpc_url: config.rpc_url,
            signer,
            account,
            confirmation_timeout: config.confirmation_timeout,
        })
    }

    /// The agent's classic account address
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Sign an off-chain claim authorizing the destination to redeem up to
    /// `cumulative_amount`.
    pub fn sign_claim(&self, channel_id: &ChannelId, cumulative_amount: U256) -> Result<[u8; 64], ChannelError> {
        let drops = amount_to_drops(cumulative_amount)
            .map_err(|e| ChannelError::AmountOverflow(e.to_string()))?;
        Ok(self.signer.sign_claim(channel_id, drops))
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, ChannelError> {
        rpc_call(&self.client, &self.rpc_url, method, params)
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))
    }

    /// Current account sequence (the ledger's transaction nonce)
    async fn account_sequence(&self) -> Result<u32, ChannelError> {
        let result = self
            .rpc(
                "account_info",
                json!({ "account": self.account, "ledger_index": "current" }),
            )
            .await?;
        result["account_data"]["Sequence"]
            .as_u64()
            .and_then(|s| u32::try_from(s).ok())
            .ok_or_else(|| ChannelError::LedgerUnavailable("account_info missing Sequence".into()))
    }

    /// Sign-and-submit a transaction, then wait for validation
    async fn submit_and_confirm(&self, tx_json: Value) -> Result<ConfirmedTx, ChannelError> {
        let result = self
            .rpc(
                "submit",
                json!({
                    "tx_json": tx_json,
                    "seed_hex": self.signer.seed_hex(),
                    "key_type": "secp256k1",
                    "fail_hard": true,
                }),
            )
            .await?;

        let engine_result = result["engine_result"].as_str().unwrap_or("unknown");
        if engine_result != "tesSUCCESS" && !engine_result.starts_with("ter") {
            let message = result["engine_result_message"]
                .as_str()
                .unwrap_or(engine_result);
            warn!(engine_result, message, "XRP submission rejected");
            return Err(normalize_engine_result(engine_result, message));
        }

        let tx_hash = result["tx_json"]["hash"]
            .as_str()
            .ok_or_else(|| ChannelError::LedgerUnavailable("submit returned no hash".into()))?
            .to_string();

        self.wait_for_validation(&tx_hash).await
    }

    /// Poll until the transaction appears in a validated ledger
    async fn wait_for_validation(&self, tx_hash: &str) -> Result<ConfirmedTx, ChannelError> {
        let deadline = tokio::time::Instant::now() + self.confirmation_timeout;
        let poll_interval = Duration::from_millis(500);

        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(ChannelError::Timeout(format!(
                    "transaction {} not validated after {:?}",
                    tx_hash, self.confirmation_timeout
                )));
            }

            match self.rpc("tx", json!({ "transaction": tx_hash })).await {
                Ok(result) if result["validated"].as_bool() == Some(true) => {
                    let ledger_index = result["ledger_index"].as_u64().unwrap_or_default();
                    debug!(tx_hash, ledger_index, "XRP transaction validated");
                    return Ok(ConfirmedTx {
                        tx_hash: tx_hash.to_string(),
                        block_number: ledger_index,
                    });
                }
                Ok(_) => {}
                // txnNotFound while the ledger catches up is expected
                Err(ChannelError::LedgerUnavailable(_)) => {}
                Err(e) => return Err(e),
            }

            tokio::time::sleep(poll_interval).await;
        }
    }
}

#[async_trait]
impl LedgerAdapter for XrpChannelClient {
    async fn open_channel(
        &self,
        peer_address: &str,
        token: TokenId,
        settlement_timeout_secs: u64,
        initial_deposit: U256,
    ) -> Result<(ChannelId, ConfirmedTx), ChannelError> {
        if token != TokenId::Native {
            // XRP PayChannels carry the native asset only
            return Err(ChannelError::Unsupported(ChainTag::Xrp));
        }
        let drops = amount_to_drops(initial_deposit)
            .map_err(|e| ChannelError::AmountOverflow(e.to_string()))?;

        let sequence = self.account_sequence().await?;
        let tx_json = json!({
            "TransactionType": "PaymentChannelCreate",
            "Account": self.account,
            "Destination": peer_address,
            "Amount": drops.to_string(),
            "SettleDelay": settlement_timeout_secs,
            "PublicKey": self.signer.public_key_hex(),
            "Sequence": sequence,
        });

        let confirmed = self.submit_and_confirm(tx_json).await?;
        let channel_id = compute_channel_id(&self.account, sequence)
            .map_err(|e| ChannelError::LedgerUnavailable(e.to_string()))?;

        info!(
            channel_id = %channel_id,
            destination = peer_address,
            drops,
            "XRP payment channel created"
        );
        Ok((channel_id, confirmed))
    }

    async fn set_total_deposit(
        &self,
        channel_id: &ChannelId,
        new_total: U256,
    ) -> Result<ConfirmedTx, ChannelError> {
        let state = self.channel_state(channel_id).await?;
        if new_total <= state.own.total_deposit {
            return Err(ChannelError::Reverted {
                reason: "DepositNotMonotonic".to_string(),
            });
        }
        let delta = amount_to_drops(new_total - state.own.total_deposit)
            .map_err(|e| ChannelError::AmountOverflow(e.to_string()))?;

        let tx_json = json!({
            "TransactionType": "PaymentChannelFund",
            "Account": self.account,
            "Channel": hex::encode_upper(channel_id.as_bytes()),
            "Amount": delta.to_string(),
        });
        self.submit_and_confirm(tx_json).await
    }

    async fn close_channel(
        &self,
        channel_id: &ChannelId,
        _partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        // Owner-side close: starts the settle delay; funds return once it
        // elapses. Claims already redeemed by the destination stay theirs.
        let tx_json = json!({
            "TransactionType": "PaymentChannelClaim",
            "Account": self.account,
            "Channel": hex::encode_upper(channel_id.as_bytes()),
            "Flags": TF_CLOSE,
        });
        let confirmed = self.submit_and_confirm(tx_json).await?;
        info!(channel_id = %channel_id, "XRP channel close requested");
        Ok(confirmed)
    }

    async fn update_non_closing_balance_proof(
        &self,
        _channel_id: &ChannelId,
        _partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        // The PayChannel model has no challenge updates; the destination
        // redeems its best claim directly.
        Err(ChannelError::Unsupported(ChainTag::Xrp))
    }

    async fn settle_channel(
        &self,
        _channel_id: &ChannelId,
        _own_proof: &BalanceProof,
        _partner_proof: &BalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        Err(ChannelError::Unsupported(ChainTag::Xrp))
    }

    async fn cooperative_settle(
        &self,
        _channel_id: &ChannelId,
        _own_proof: &SignedBalanceProof,
        _partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        Err(ChannelError::Unsupported(ChainTag::Xrp))
    }

    async fn withdraw(
        &self,
        _channel_id: &ChannelId,
        _proof: &WithdrawProof,
        _counterparty_signature: &[u8],
    ) -> Result<ConfirmedTx, ChannelError> {
        Err(ChannelError::Unsupported(ChainTag::Xrp))
    }

    async fn force_close_expired(
        &self,
        channel_id: &ChannelId,
    ) -> Result<ConfirmedTx, ChannelError> {
        // Past expiration anyone may close; the same claim-with-close-flag
        // transaction performs the cleanup.
        let tx_json = json!({
            "TransactionType": "PaymentChannelClaim",
            "Account": self.account,
            "Channel": hex::encode_upper(channel_id.as_bytes()),
            "Flags": TF_CLOSE,
        });
        self.submit_and_confirm(tx_json).await
    }

    async fn channel_state(
        &self,
        channel_id: &ChannelId,
    ) -> Result<OnChainChannelState, ChannelError> {
        let result = self
            .rpc(
                "ledger_entry",
                json!({
                    "payment_channel": hex::encode_upper(channel_id.as_bytes()),
                    "ledger_index": "validated",
                }),
            )
            .await;

        let node = match result {
            Ok(value) => value["node"].clone(),
            Err(ChannelError::LedgerUnavailable(msg)) if msg.contains("entryNotFound") => {
                // A fully closed channel's ledger entry is deleted
                return Ok(OnChainChannelState {
                    channel_id: *channel_id,
                    phase: SettlementPhase::Settled,
                    own: ParticipantState::default(),
                    partner: ParticipantState::default(),
                    challenge_deadline: None,
                });
            }
            Err(e) => return Err(e),
        };

        let amount = parse_drops(&node["Amount"])?;
        let balance = parse_drops(&node["Balance"])?;
        let expiration = node["Expiration"].as_u64().map(ripple_to_unix);

        let phase = if expiration.is_some() {
            SettlementPhase::ClosedChallenge
        } else {
            SettlementPhase::Open
        };

        Ok(OnChainChannelState {
            channel_id: *channel_id,
            phase,
            own: ParticipantState {
                total_deposit: U256::from(amount),
                total_withdrawn: U256::ZERO,
                transferred: U256::from(balance),
                nonce: 0,
            },
            partner: ParticipantState::default(),
            challenge_deadline: expiration,
        })
    }
}

async fn rpc_call(
    client: &reqwest::Client,
    rpc_url: &str,
    method: &str,
    params: Value,
) -> Result<Value> {
    let body = json!({ "method": method, "params": [params] });
    let response = client
        .post(rpc_url)
        .json(&body)
        .send()
        .await
        .wrap_err_with(|| format!("rippled request {} failed", method))?;

    let envelope: Value = response
        .json()
        .await
        .wrap_err_with(|| format!("rippled response for {} not JSON", method))?;
    let result = envelope["result"].clone();

    if result["status"].as_str() == Some("error") {
        let error = result["error"].as_str().unwrap_or("unknown");
        return Err(eyre!("rippled {} error: {}", method, error));
    }
    Ok(result)
}

/// Map rippled engine results onto the structured error kinds
fn normalize_engine_result(engine_result: &str, message: &str) -> ChannelError {
    match engine_result {
        "tecUNFUNDED" | "tecUNFUNDED_PAYMENT" | "tecINSUFFICIENT_RESERVE" => {
            ChannelError::Reverted {
                reason: "InsufficientBalance".to_string(),
            }
        }
        "tecNO_ENTRY" | "tecNO_DST" => ChannelError::Reverted {
            reason: "ChannelNotFound".to_string(),
        },
        "temBAD_SIGNATURE" | "temBAD_SRC_ACCOUNT" => {
            ChannelError::InvalidSignature(message.to_string())
        }
        other => ChannelError::Reverted {
            reason: format!("{}: {}", other, message),
        },
    }
}

/// Drops fields arrive as decimal strings
fn parse_drops(value: &Value) -> Result<u64, ChannelError> {
    value
        .as_str()
        .and_then(|s| s.parse::<u64>().ok())
        .or_else(|| value.as_u64())
        .ok_or_else(|| ChannelError::LedgerUnavailable(format!("bad drops field: {}", value)))
}

/// Convert a ripple-epoch timestamp to unix seconds
pub fn ripple_to_unix(ripple_secs: u64) -> u64 {
    ripple_secs + RIPPLE_EPOCH_OFFSET
}

/// Decode a classic address into the raw 20-byte account id
pub fn decode_classic_address(address: &str) -> Result<[u8; 20]> {
    let payload = bs58::decode(address)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check(None)
        .into_vec()
        .wrap_err("Invalid classic address")?;
    if payload.len() != 21 || payload[0] != 0x00 {
        return Err(eyre!("Classic address has unexpected payload"));
    }
    let mut account_id = [0u8; 20];
    account_id.copy_from_slice(&payload[1..]);
    Ok(account_id)
}

/// The ledger-assigned channel id: SHA-512Half over the payment-channel
/// keyspace prefix, the owner account and the create transaction's sequence.
pub fn compute_channel_id(account: &str, sequence: u32) -> Result<ChannelId> {
    let account_id = decode_classic_address(account)?;
    let mut data = [0u8; 26];
    data[0..2].copy_from_slice(&PAYCHAN_SPACE);
    data[2..22].copy_from_slice(&account_id);
    data[22..26].copy_from_slice(&sequence.to_be_bytes());
    let full = Sha512::digest(data);
    let mut half = [0u8; 32];
    half.copy_from_slice(&full[..32]);
    Ok(ChannelId::from_bytes(half))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::{xrp_classic_address, SignerService};

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_ripple_epoch_conversion() {
        // Ripple epoch zero is 2000-01-01T00:00:00Z
        assert_eq!(ripple_to_unix(0), 946_684_800);
        assert_eq!(ripple_to_unix(86_400), 946_771_200);
    }

    #[test]
    fn test_classic_address_roundtrip() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let signer = service.xrp_signer("agent-001").unwrap();
        let address = xrp_classic_address(signer.public_key());

        let account_id = decode_classic_address(&address).unwrap();
        assert_eq!(account_id.len(), 20);
    }

    #[test]
    fn test_classic_address_rejects_garbage() {
        assert!(decode_classic_address("not-an-address").is_err());
        assert!(decode_classic_address("").is_err());
    }

    #[test]
    fn test_compute_channel_id_deterministic() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let signer = service.xrp_signer("agent-001").unwrap();
        let address = xrp_classic_address(signer.public_key());

        let a = compute_channel_id(&address, 7).unwrap();
        let b = compute_channel_id(&address, 7).unwrap();
        let c = compute_channel_id(&address, 8).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_parse_drops() {
        assert_eq!(parse_drops(&json!("1000000")).unwrap(), 1_000_000);
        assert_eq!(parse_drops(&json!(42)).unwrap(), 42);
        assert!(parse_drops(&json!("xrp")).is_err());
        assert!(parse_drops(&json!(null)).is_err());
    }

    #[test]
    fn test_normalize_engine_results() {
        assert!(matches!(
            normalize_engine_result("tecUNFUNDED", "unfunded"),
            ChannelError::Reverted { reason } if reason == "InsufficientBalance"
        ));
        assert!(matches!(
            normalize_engine_result("tecNO_ENTRY", "missing"),
            ChannelError::Reverted { reason } if reason == "ChannelNotFound"
        ));
        assert!(matches!(
            normalize_engine_result("temBAD_SIGNATURE", "bad sig"),
            ChannelError::InvalidSignature(_)
        ));
    }
}
