//! EVM channel transaction client
//!
//! Submits channel lifecycle transactions and reads on-chain channel state.
//! Every call returns either a confirmed receipt or a structured
//! [`ChannelError`]; raw RPC/revert strings never escape unnormalized.

use alloy::{
    network::{Ethereum, EthereumWallet},
    primitives::{Address, U256},
    providers::{Provider, ProviderBuilder, RootProvider},
    rpc::types::TransactionReceipt,
    signers::local::PrivateKeySigner,
    sol_types::SolEvent,
    transports::http::{Client, Http},
};
use eyre::{eyre, Result};
use std::time::Duration;
use tiny_keccak::{Hasher, Keccak};
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::adapter::{ConfirmedTx, LedgerAdapter};
use crate::error::{normalize_ledger_error, ChannelError};
use crate::evm::contracts::{PaymentChannels, ERC20};
use crate::proof::{BalanceProof, SignedBalanceProof, WithdrawProof};
use crate::types::{
    ChannelId, OnChainChannelState, ParticipantState, SettlementPhase, TokenId,
    MAX_SETTLEMENT_TIMEOUT_SECS, MIN_SETTLEMENT_TIMEOUT_SECS,
};

/// Provider with wallet attached, as assembled by `ProviderBuilder`
type WalletProvider = alloy::providers::fillers::FillProvider<
    alloy::providers::fillers::JoinFill<
        alloy::providers::Identity,
        alloy::providers::fillers::WalletFiller<EthereumWallet>,
    >,
    RootProvider<Http<Client>>,
    Http<Client>,
    Ethereum,
>;

/// Configuration for the EVM channel client
#[derive(Clone)]
pub struct EvmChannelConfig {
    /// RPC URL for the EVM chain
    pub rpc_url: String,
    /// Chain ID
    pub chain_id: u64,
    /// Address of the payment-channel contract
    pub channels_address: Address,
    /// Private key (hex string, with or without 0x prefix)
    pub private_key: String,
    /// Per-operation confirmation timeout
    pub confirmation_timeout: Duration,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl std::fmt::Debug for EvmChannelConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvmChannelConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("channels_address", &self.channels_address)
            .field("private_key", &"<redacted>")
            .field("confirmation_timeout", &self.confirmation_timeout)
            .finish()
    }
}

/// EVM channel client with signing capabilities
pub struct EvmChannelClient {
    provider: WalletProvider,
    channels_address: Address,
    chain_id: u64,
    signer_address: Address,
    confirmation_timeout: Duration,
}

impl EvmChannelClient {
    /// Create a new channel client from configuration
    pub fn new(config: EvmChannelConfig) -> Result<Self> {
        let signer: PrivateKeySigner = config
            .private_key
            .parse()
            .map_err(|e| eyre!("Invalid private key: {}", e))?;
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);

        let provider = ProviderBuilder::new().wallet(wallet).on_http(
            config
                .rpc_url
                .parse()
                .map_err(|e| eyre!("Invalid RPC URL: {}", e))?,
        );

        info!(
            chain_id = config.chain_id,
            channels = %config.channels_address,
            address = %signer_address,
            "EVM channel client initialized"
        );

        Ok(Self {
            provider,
            channels_address: config.channels_address,
            chain_id: config.chain_id,
            signer_address,
            confirmation_timeout: config.confirmation_timeout,
        })
    }

    /// Build directly from an already-derived signer (the signer service
    /// hands these out without ever exposing raw key bytes).
    pub fn with_signer(
        rpc_url: &str,
        chain_id: u64,
        channels_address: Address,
        signer: PrivateKeySigner,
        confirmation_timeout: Duration,
    ) -> Result<Self> {
        let signer_address = signer.address();
        let wallet = EthereumWallet::from(signer);
        let provider = ProviderBuilder::new()
            .wallet(wallet)
            .on_http(rpc_url.parse().map_err(|e| eyre!("Invalid RPC URL: {}", e))?);

        info!(
            chain_id,
            channels = %channels_address,
            address = %signer_address,
            "EVM channel client initialized"
        );

        Ok(Self {
            provider,
            channels_address,
            chain_id,
            signer_address,
            confirmation_timeout,
        })
    }

    /// The signer's address (our side of every channel this client touches)
    pub fn signer_address(&self) -> Address {
        self.signer_address
    }

    /// Chain ID this client submits to
    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Contract address (the typed-data verifying contract)
    pub fn channels_address(&self) -> Address {
        self.channels_address
    }

    /// Current block number
    pub async fn get_block_number(&self) -> Result<u64, ChannelError> {
        self.provider
            .get_block_number()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))
    }

    /// Run a submission future under the per-operation confirmation timeout
    async fn confirm<F>(&self, op: &'static str, fut: F) -> Result<TransactionReceipt, ChannelError>
    where
        F: std::future::Future<Output = Result<TransactionReceipt, alloy::contract::Error>>,
    {
        let receipt = tokio::time::timeout(self.confirmation_timeout, fut)
            .await
            .map_err(|_| {
                ChannelError::Timeout(format!(
                    "{} not confirmed after {:?}",
                    op, self.confirmation_timeout
                ))
            })?
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;

        if !receipt.status() {
            warn!(op, tx_hash = ?receipt.transaction_hash, "Transaction reverted");
            return Err(ChannelError::Reverted {
                reason: "Unknown".to_string(),
            });
        }
        Ok(receipt)
    }

    fn confirmed(receipt: &TransactionReceipt) -> ConfirmedTx {
        ConfirmedTx {
            tx_hash: format!("{:?}", receipt.transaction_hash),
            block_number: receipt.block_number.unwrap_or_default(),
        }
    }

    /// Approve the channel contract to pull an ERC20 deposit
    async fn approve_token(&self, token: Address, amount: U256) -> Result<(), ChannelError> {
        let erc20 = ERC20::new(token, &self.provider);
        let receipt = self
            .confirm("approve", async {
                erc20
                    .approve(self.channels_address, amount)
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        debug!(token = %token, amount = %amount, tx_hash = %receipt.transaction_hash, "Deposit approval confirmed");
        Ok(())
    }

    fn token_address(token: TokenId) -> Address {
        match token {
            TokenId::Native => Address::ZERO,
            TokenId::Erc20(bytes) => Address::from(bytes),
        }
    }

    /// Pull the channel id out of a receipt's ChannelOpened event
    fn channel_id_from_receipt(receipt: &TransactionReceipt) -> Result<ChannelId, ChannelError> {
        for log in receipt.inner.logs() {
            let topics = log.topics();
            if topics.is_empty() {
                continue;
            }
            if topics[0] == PaymentChannels::ChannelOpened::SIGNATURE_HASH {
                return Ok(ChannelId::from_bytes(topics[1].0));
            }
        }
        Err(ChannelError::Reverted {
            reason: "ChannelOpened event missing from receipt".to_string(),
        })
    }
}

/// Deterministic channel id: keccak over the canonically ordered participant
/// pair and the token, mirroring the contract's derivation. Used for
/// pre-validation; the receipt's event is authoritative.
pub fn derive_channel_id(a: Address, b: Address, token: Address) -> ChannelId {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    let mut data = [0u8; 60];
    data[0..20].copy_from_slice(low.as_slice());
    data[20..40].copy_from_slice(high.as_slice());
    data[40..60].copy_from_slice(token.as_slice());
    let mut hasher = Keccak::v256();
    hasher.update(&data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    ChannelId::from_bytes(output)
}

#[async_trait]
impl LedgerAdapter for EvmChannelClient {
    async fn open_channel(
        &self,
        peer_address: &str,
        token: TokenId,
        settlement_timeout_secs: u64,
        initial_deposit: U256,
    ) -> Result<(ChannelId, ConfirmedTx), ChannelError> {
        if !(MIN_SETTLEMENT_TIMEOUT_SECS..=MAX_SETTLEMENT_TIMEOUT_SECS)
            .contains(&settlement_timeout_secs)
        {
            return Err(ChannelError::Reverted {
                reason: "InvalidTimeout".to_string(),
            });
        }

        let partner: Address = peer_address
            .parse()
            .map_err(|_| ChannelError::PeerUnknown {
                peer_id: peer_address.to_string(),
                chain: crate::types::ChainTag::Evm,
            })?;
        let token_address = Self::token_address(token);

        if token != TokenId::Native && initial_deposit > U256::ZERO {
            self.approve_token(token_address, initial_deposit).await?;
        }

        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let value = if token == TokenId::Native {
            initial_deposit
        } else {
            U256::ZERO
        };

        let receipt = self
            .confirm("open_channel", async {
                contract
                    .openChannel(
                        partner,
                        token_address,
                        U256::from(settlement_timeout_secs),
                        initial_deposit,
                    )
                    .value(value)
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;

        let channel_id = Self::channel_id_from_receipt(&receipt)?;
        info!(
            channel_id = %channel_id,
            partner = %partner,
            deposit = %initial_deposit,
            tx_hash = %receipt.transaction_hash,
            "Channel opened on-chain"
        );
        Ok((channel_id, Self::confirmed(&receipt)))
    }

    async fn set_total_deposit(
        &self,
        channel_id: &ChannelId,
        new_total: U256,
    ) -> Result<ConfirmedTx, ChannelError> {
        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());

        // Pull the current total to compute the delta carried as value for
        // native channels; ERC20 channels pull via allowance.
        let current = contract
            .getParticipantInfo(id, self.signer_address)
            .call()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;
        if new_total <= current.totalDeposit {
            return Err(ChannelError::Reverted {
                reason: "DepositNotMonotonic".to_string(),
            });
        }
        let delta = new_total - current.totalDeposit;

        let receipt = self
            .confirm("set_total_deposit", async {
                contract
                    .setTotalDeposit(id, self.signer_address, new_total)
                    .value(delta)
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        Ok(Self::confirmed(&receipt))
    }

    async fn close_channel(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());
        let proof = &partner_proof.proof;

        let receipt = self
            .confirm("close_channel", async {
                contract
                    .closeChannel(
                        id,
                        U256::from(proof.nonce),
                        proof.transferred_amount,
                        proof.locked_amount,
                        alloy::primitives::B256::from(proof.locks_root),
                        partner_proof.signature.to_vec().into(),
                    )
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        info!(channel_id = %channel_id, nonce = proof.nonce, "Unilateral close submitted");
        Ok(Self::confirmed(&receipt))
    }

    async fn update_non_closing_balance_proof(
        &self,
        channel_id: &ChannelId,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());
        let proof = &partner_proof.proof;

        let receipt = self
            .confirm("update_non_closing_balance_proof", async {
                contract
                    .updateNonClosingBalanceProof(
                        id,
                        U256::from(proof.nonce),
                        proof.transferred_amount,
                        proof.locked_amount,
                        alloy::primitives::B256::from(proof.locks_root),
                        partner_proof.signature.to_vec().into(),
                    )
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        info!(channel_id = %channel_id, nonce = proof.nonce, "Non-closing balance proof updated");
        Ok(Self::confirmed(&receipt))
    }

    async fn settle_channel(
        &self,
        channel_id: &ChannelId,
        own_proof: &BalanceProof,
        partner_proof: &BalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());

        // The contract expects participant1's values first (canonical order)
        let participants = contract
            .getChannelParticipants(id)
            .call()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;
        let own_is_first = participants.participant1 == self.signer_address;
        let (first, second) = if own_is_first {
            (own_proof, partner_proof)
        } else {
            (partner_proof, own_proof)
        };

        let receipt = self
            .confirm("settle_channel", async {
                contract
                    .settleChannel(
                        id,
                        first.transferred_amount,
                        first.locked_amount,
                        alloy::primitives::B256::from(first.locks_root),
                        second.transferred_amount,
                        second.locked_amount,
                        alloy::primitives::B256::from(second.locks_root),
                    )
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        info!(channel_id = %channel_id, "Channel settled");
        Ok(Self::confirmed(&receipt))
    }

    async fn cooperative_settle(
        &self,
        channel_id: &ChannelId,
        own_proof: &SignedBalanceProof,
        partner_proof: &SignedBalanceProof,
    ) -> Result<ConfirmedTx, ChannelError> {
        if own_proof.proof.nonce != partner_proof.proof.nonce {
            return Err(ChannelError::Reverted {
                reason: "NonceMismatch".to_string(),
            });
        }

        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());
        let participants = contract
            .getChannelParticipants(id)
            .call()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;
        let own_is_first = participants.participant1 == self.signer_address;
        let (first, second) = if own_is_first {
            (own_proof, partner_proof)
        } else {
            (partner_proof, own_proof)
        };

        let receipt = self
            .confirm("cooperative_settle", async {
                contract
                    .cooperativeSettle(
                        id,
                        U256::from(first.proof.nonce),
                        first.proof.transferred_amount,
                        second.proof.transferred_amount,
                        first.signature.to_vec().into(),
                        second.signature.to_vec().into(),
                    )
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        info!(channel_id = %channel_id, nonce = own_proof.proof.nonce, "Cooperative settlement confirmed");
        Ok(Self::confirmed(&receipt))
    }

    async fn withdraw(
        &self,
        channel_id: &ChannelId,
        proof: &WithdrawProof,
        counterparty_signature: &[u8],
    ) -> Result<ConfirmedTx, ChannelError> {
        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());

        let receipt = self
            .confirm("withdraw", async {
                contract
                    .withdraw(
                        id,
                        proof.participant,
                        proof.amount,
                        U256::from(proof.nonce),
                        U256::from(proof.expiry),
                        counterparty_signature.to_vec().into(),
                    )
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        Ok(Self::confirmed(&receipt))
    }

    async fn force_close_expired(
        &self,
        channel_id: &ChannelId,
    ) -> Result<ConfirmedTx, ChannelError> {
        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());

        let receipt = self
            .confirm("force_close_expired", async {
                contract
                    .forceCloseExpired(id)
                    .send()
                    .await?
                    .get_receipt()
                    .await
                    .map_err(alloy::contract::Error::from)
            })
            .await?;
        Ok(Self::confirmed(&receipt))
    }

    async fn channel_state(
        &self,
        channel_id: &ChannelId,
    ) -> Result<OnChainChannelState, ChannelError> {
        let contract = PaymentChannels::new(self.channels_address, &self.provider);
        let id = alloy::primitives::B256::from(*channel_id.as_bytes());

        let info = contract
            .getChannelInfo(id)
            .call()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;
        let participants = contract
            .getChannelParticipants(id)
            .call()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;

        let partner = if participants.participant1 == self.signer_address {
            participants.participant2
        } else {
            participants.participant1
        };

        let own = contract
            .getParticipantInfo(id, self.signer_address)
            .call()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;
        let other = contract
            .getParticipantInfo(id, partner)
            .call()
            .await
            .map_err(|e| normalize_ledger_error(&e.to_string()))?;

        let phase = match info.phase {
            0 => SettlementPhase::Open,
            1 => SettlementPhase::ClosedChallenge,
            _ => SettlementPhase::Settled,
        };
        let challenge_deadline = if phase == SettlementPhase::ClosedChallenge {
            Some(u64::try_from(info.challengeDeadline).unwrap_or(u64::MAX))
        } else {
            None
        };

        Ok(OnChainChannelState {
            channel_id: *channel_id,
            phase,
            own: ParticipantState {
                total_deposit: own.totalDeposit,
                total_withdrawn: own.totalWithdrawn,
                transferred: own.transferredAmount,
                nonce: u64::try_from(own.nonce).unwrap_or(u64::MAX),
            },
            partner: ParticipantState {
                total_deposit: other.totalDeposit,
                total_withdrawn: other.totalWithdrawn,
                transferred: other.transferredAmount,
                nonce: u64::try_from(other.nonce).unwrap_or(u64::MAX),
            },
            challenge_deadline,
        })
    }
}
