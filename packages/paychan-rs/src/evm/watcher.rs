//! EVM channel event watcher
//!
//! Polls the channel contract's logs from a cursor block (with a finality
//! lag) and delivers parsed [`ChannelEvent`]s to the channel manager over an
//! mpsc channel.

use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use eyre::{eyre, Result, WrapErr};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::adapter::ChannelEvent;
use crate::evm::contracts::PaymentChannels;
use crate::types::ChannelId;

/// EVM event watcher for channel lifecycle events
pub struct EvmChannelWatcher {
    provider: RootProvider<Http<Client>>,
    channels_address: Address,
    chain_id: u64,
    finality_blocks: u64,
    poll_interval: Duration,
    last_processed_block: u64,
    events_tx: mpsc::Sender<ChannelEvent>,
}

impl EvmChannelWatcher {
    /// Create a new watcher starting at the chain head
    pub async fn new(
        rpc_url: &str,
        chain_id: u64,
        channels_address: Address,
        finality_blocks: u64,
        poll_interval: Duration,
        events_tx: mpsc::Sender<ChannelEvent>,
    ) -> Result<Self> {
        let provider =
            ProviderBuilder::new().on_http(rpc_url.parse().wrap_err("Failed to parse RPC URL")?);

        let head = provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")?;

        Ok(Self {
            provider,
            channels_address,
            chain_id,
            finality_blocks,
            poll_interval,
            last_processed_block: head.saturating_sub(finality_blocks),
            events_tx,
        })
    }

    /// Run the watcher loop until the event channel closes or shutdown fires
    pub async fn run(mut self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        tracing::info!(
            chain_id = self.chain_id,
            channels = %self.channels_address,
            from_block = self.last_processed_block,
            "EVM channel watcher starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Shutdown signal received, stopping EVM watcher");
                    return Ok(());
                }
                result = self.poll_once() => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "EVM watcher poll failed, will retry");
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Process one block range; advances the cursor on success
    pub async fn poll_once(&mut self) -> Result<()> {
        let head = self
            .provider
            .get_block_number()
            .await
            .wrap_err("Failed to get block number")?;
        let safe_block = head.saturating_sub(self.finality_blocks);

        if safe_block <= self.last_processed_block {
            return Ok(());
        }

        let from_block = self.last_processed_block + 1;
        let filter = Filter::new()
            .address(self.channels_address)
            .from_block(from_block)
            .to_block(safe_block);

        let logs = self
            .provider
            .get_logs(&filter)
            .await
            .wrap_err("Failed to get logs")?;

        for log in logs {
            match parse_channel_log(&log) {
                Ok(Some(event)) => {
                    tracing::info!(
                        chain_id = self.chain_id,
                        channel_id = %event.channel_id(),
                        "Channel event detected"
                    );
                    if self.events_tx.send(event).await.is_err() {
                        return Err(eyre!("Channel event receiver dropped"));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        tx_hash = ?log.transaction_hash,
                        log_index = ?log.log_index,
                        error = %e,
                        "Failed to parse channel log"
                    );
                }
            }
        }

        self.last_processed_block = safe_block;
        Ok(())
    }
}

/// Parse a contract log into a channel event; `None` for unrelated topics
pub fn parse_channel_log(log: &Log) -> Result<Option<ChannelEvent>> {
    let topics = log.topics();
    if topics.is_empty() {
        return Ok(None);
    }
    let block_number = log.block_number.unwrap_or_default();
    let data = log.data().data.as_ref();

    if topics[0] == PaymentChannels::ChannelOpened::SIGNATURE_HASH {
        let channel_id = ChannelId::from_bytes(topics[1].0);
        return Ok(Some(ChannelEvent::Opened {
            channel_id,
            block_number,
        }));
    }

    if topics[0] == PaymentChannels::ChannelClosed::SIGNATURE_HASH {
        if topics.len() < 3 || data.len() < 64 {
            return Err(eyre!("Malformed ChannelClosed log"));
        }
        let channel_id = ChannelId::from_bytes(topics[1].0);
        let closing_participant = Address::from_slice(&topics[2].as_slice()[12..]);
        let nonce = U256::from_be_slice(&data[0..32]);
        let mut balance_hash = [0u8; 32];
        balance_hash.copy_from_slice(&data[32..64]);
        return Ok(Some(ChannelEvent::Closed {
            channel_id,
            closing_participant: format!("{:?}", closing_participant),
            nonce: nonce.try_into().unwrap_or(u64::MAX),
            balance_hash,
            block_number,
        }));
    }

    if topics[0] == PaymentChannels::ChannelSettled::SIGNATURE_HASH {
        if data.len() < 64 {
            return Err(eyre!("Malformed ChannelSettled log"));
        }
        let channel_id = ChannelId::from_bytes(topics[1].0);
        return Ok(Some(ChannelEvent::Settled {
            channel_id,
            participant1_amount: U256::from_be_slice(&data[0..32]),
            participant2_amount: U256::from_be_slice(&data[32..64]),
            block_number,
        }));
    }

    if topics[0] == PaymentChannels::ChannelCooperativeSettled::SIGNATURE_HASH {
        if data.len() < 64 {
            return Err(eyre!("Malformed ChannelCooperativeSettled log"));
        }
        let channel_id = ChannelId::from_bytes(topics[1].0);
        return Ok(Some(ChannelEvent::CooperativeSettled {
            channel_id,
            participant1_amount: U256::from_be_slice(&data[0..32]),
            participant2_amount: U256::from_be_slice(&data[32..64]),
            block_number,
        }));
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_signatures_are_distinct() {
        let sigs = [
            PaymentChannels::ChannelOpened::SIGNATURE_HASH,
            PaymentChannels::ChannelClosed::SIGNATURE_HASH,
            PaymentChannels::ChannelSettled::SIGNATURE_HASH,
            PaymentChannels::ChannelCooperativeSettled::SIGNATURE_HASH,
        ];
        for (i, a) in sigs.iter().enumerate() {
            for b in sigs.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_event_signature_matches_abi() {
        assert_eq!(
            PaymentChannels::ChannelOpened::SIGNATURE,
            "ChannelOpened(bytes32,address,address,uint256)"
        );
        assert_eq!(
            PaymentChannels::ChannelClosed::SIGNATURE,
            "ChannelClosed(bytes32,address,uint256,bytes32)"
        );
    }
}
