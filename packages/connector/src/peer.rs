//! Peer transport: the off-chain message channel carrying balance proofs
//! between connectors.
//!
//! The framing protocol underneath is opaque to the core; what matters here
//! is request/response with correlation ids, per-call timeouts, and the
//! retry policy (3 attempts with exponential backoff, then the failure
//! surfaces). `LocalTransport` is the in-process implementation used by
//! loopback deployments and the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use paychan_rs::error::ChannelError;
use paychan_rs::types::ChainTag;

/// Directory of peer on-chain addresses: (peer, chain) → address.
///
/// EVM entries hold 0x addresses; XRP entries hold the peer's classic
/// address for channel destinations, with the claim public key registered
/// separately.
#[derive(Default)]
pub struct PeerDirectory {
    addresses: RwLock<HashMap<(String, ChainTag), String>>,
    /// XRP claim public keys (compressed, hex) per peer
    claim_keys: RwLock<HashMap<String, String>>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_address(&self, peer_id: &str, chain: ChainTag, address: &str) {
        self.addresses
            .write()
            .unwrap()
            .insert((peer_id.to_string(), chain), address.to_string());
    }

    pub fn resolve(&self, peer_id: &str, chain: ChainTag) -> Result<String, ChannelError> {
        self.addresses
            .read()
            .unwrap()
            .get(&(peer_id.to_string(), chain))
            .cloned()
            .ok_or_else(|| ChannelError::PeerUnknown {
                peer_id: peer_id.to_string(),
                chain,
            })
    }

    pub fn register_claim_key(&self, peer_id: &str, public_key_hex: &str) {
        self.claim_keys
            .write()
            .unwrap()
            .insert(peer_id.to_string(), public_key_hex.to_string());
    }

    pub fn claim_key(&self, peer_id: &str) -> Option<String> {
        self.claim_keys.read().unwrap().get(peer_id).cloned()
    }
}

/// Response to a balance-proof delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerResponse {
    Ack,
    Reject { reason: String },
}

/// One correlated request travelling to a peer's inbox
#[derive(Debug)]
pub struct PeerRequest {
    pub request_id: u64,
    pub from: String,
    pub payload: Vec<u8>,
    pub respond: oneshot::Sender<PeerResponse>,
}

/// The transport contract the channel manager depends on. One call carries
/// one encoded signed balance proof; the result distinguishes transport
/// failure (retriable) from peer rejection (not).
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send_balance_proof(
        &self,
        peer_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), ChannelError>;
}

/// In-process transport: paired mailboxes with correlation ids.
pub struct LocalTransport {
    own_id: String,
    inboxes: Arc<Mutex<HashMap<String, mpsc::Sender<PeerRequest>>>>,
    next_request_id: Arc<AtomicU64>,
    timeout: Duration,
    retry_attempts: u32,
    retry_delay: Duration,
}

impl LocalTransport {
    /// A registry shared by every transport endpoint in this process
    pub fn registry() -> Arc<Mutex<HashMap<String, mpsc::Sender<PeerRequest>>>> {
        Arc::new(Mutex::new(HashMap::new()))
    }

    pub fn new(
        own_id: &str,
        inboxes: Arc<Mutex<HashMap<String, mpsc::Sender<PeerRequest>>>>,
        timeout: Duration,
        retry_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            own_id: own_id.to_string(),
            inboxes,
            next_request_id: Arc::new(AtomicU64::new(1)),
            timeout,
            retry_attempts,
            retry_delay,
        }
    }

    /// Open this endpoint's inbox; messages addressed to `own_id` arrive on
    /// the returned receiver.
    pub fn open_inbox(&self, capacity: usize) -> mpsc::Receiver<PeerRequest> {
        let (tx, rx) = mpsc::channel(capacity);
        self.inboxes
            .lock()
            .unwrap()
            .insert(self.own_id.clone(), tx);
        rx
    }

    async fn send_once(&self, peer_id: &str, payload: Vec<u8>) -> Result<(), ChannelError> {
        let sender = {
            let inboxes = self.inboxes.lock().unwrap();
            inboxes.get(peer_id).cloned()
        }
        .ok_or_else(|| ChannelError::TransportRejected {
            reason: format!("peer {} not connected", peer_id),
        })?;

        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (respond, response) = oneshot::channel();
        let request = PeerRequest {
            request_id,
            from: self.own_id.clone(),
            payload,
            respond,
        };

        sender
            .send(request)
            .await
            .map_err(|_| ChannelError::TransportRejected {
                reason: format!("peer {} inbox closed", peer_id),
            })?;

        debug!(peer_id, request_id, "Balance proof dispatched, awaiting ack");

        let response = tokio::time::timeout(self.timeout, response)
            .await
            .map_err(|_| {
                ChannelError::Timeout(format!(
                    "no response from {} within {:?} (request {})",
                    peer_id, self.timeout, request_id
                ))
            })?
            .map_err(|_| ChannelError::TransportRejected {
                reason: format!("peer {} dropped request {}", peer_id, request_id),
            })?;

        match response {
            PeerResponse::Ack => Ok(()),
            PeerResponse::Reject { reason } => Err(ChannelError::PeerRejected { reason }),
        }
    }
}

#[async_trait]
impl PeerTransport for LocalTransport {
    async fn send_balance_proof(
        &self,
        peer_id: &str,
        payload: Vec<u8>,
    ) -> Result<(), ChannelError> {
        let mut last_error = None;

        for attempt in 0..self.retry_attempts {
            if attempt > 0 {
                let backoff = self.retry_delay * 2u32.pow(attempt - 1);
                debug!(peer_id, attempt, backoff_ms = backoff.as_millis() as u64, "Retrying proof delivery");
                tokio::time::sleep(backoff).await;
            }

            match self.send_once(peer_id, payload.clone()).await {
                Ok(()) => return Ok(()),
                // A peer that answered with a rejection will keep rejecting;
                // surface immediately.
                Err(err @ ChannelError::PeerRejected { .. }) => return Err(err),
                Err(err) => {
                    warn!(peer_id, attempt, error = %err, "Proof delivery attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ChannelError::TransportRejected {
            reason: format!("delivery to {} failed with no attempts", peer_id),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_pair() -> (LocalTransport, LocalTransport) {
        let registry = LocalTransport::registry();
        let a = LocalTransport::new(
            "agent-001",
            registry.clone(),
            Duration::from_millis(200),
            3,
            Duration::from_millis(10),
        );
        let b = LocalTransport::new(
            "agent-002",
            registry,
            Duration::from_millis(200),
            3,
            Duration::from_millis(10),
        );
        (a, b)
    }

    #[tokio::test]
    async fn test_roundtrip_ack() {
        let (a, b) = transport_pair();
        let mut inbox = b.open_inbox(8);

        let responder = tokio::spawn(async move {
            let request = inbox.recv().await.unwrap();
            assert_eq!(request.from, "agent-001");
            assert_eq!(request.payload, vec![1, 2, 3]);
            request.respond.send(PeerResponse::Ack).unwrap();
        });

        a.send_balance_proof("agent-002", vec![1, 2, 3]).await.unwrap();
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let (a, b) = transport_pair();
        let mut inbox = b.open_inbox(8);

        tokio::spawn(async move {
            // A retried send would deliver a second request; answer only one
            let request = inbox.recv().await.unwrap();
            request
                .respond
                .send(PeerResponse::Reject {
                    reason: "stale nonce".to_string(),
                })
                .unwrap();
            assert!(inbox.recv().await.is_none());
        });

        let err = a.send_balance_proof("agent-002", vec![9]).await.unwrap_err();
        assert!(matches!(err, ChannelError::PeerRejected { reason } if reason == "stale nonce"));
    }

    #[tokio::test]
    async fn test_unknown_peer_rejected_by_transport() {
        let (a, _b) = transport_pair();
        let err = a.send_balance_proof("agent-404", vec![0]).await.unwrap_err();
        assert!(matches!(err, ChannelError::TransportRejected { .. }));
    }

    #[tokio::test]
    async fn test_dropped_response_times_out_then_surfaces() {
        let (a, b) = transport_pair();
        let mut inbox = b.open_inbox(8);

        tokio::spawn(async move {
            // Swallow every attempt without answering
            while let Some(request) = inbox.recv().await {
                drop(request.respond);
            }
        });

        let err = a.send_balance_proof("agent-002", vec![0]).await.unwrap_err();
        assert!(matches!(err, ChannelError::TransportRejected { .. }));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let (a, b) = transport_pair();
        let mut inbox = b.open_inbox(8);

        tokio::spawn(async move {
            // First attempt dropped, second acknowledged
            let first = inbox.recv().await.unwrap();
            drop(first.respond);
            let second = inbox.recv().await.unwrap();
            second.respond.send(PeerResponse::Ack).unwrap();
        });

        a.send_balance_proof("agent-002", vec![7]).await.unwrap();
    }

    #[tokio::test]
    async fn test_correlation_ids_are_unique() {
        let (a, b) = transport_pair();
        let mut inbox = b.open_inbox(8);

        let collector = tokio::spawn(async move {
            let mut seen = Vec::new();
            for _ in 0..3 {
                let request = inbox.recv().await.unwrap();
                seen.push(request.request_id);
                request.respond.send(PeerResponse::Ack).unwrap();
            }
            seen
        });

        for i in 0..3u8 {
            a.send_balance_proof("agent-002", vec![i]).await.unwrap();
        }
        let seen = collector.await.unwrap();
        assert_eq!(seen.len(), 3);
        assert!(seen.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn test_directory_resolution() {
        let directory = PeerDirectory::new();
        directory.register_address("agent-002", ChainTag::Evm, "0xabc");

        assert_eq!(
            directory.resolve("agent-002", ChainTag::Evm).unwrap(),
            "0xabc"
        );
        assert!(matches!(
            directory.resolve("agent-002", ChainTag::Xrp),
            Err(ChannelError::PeerUnknown { .. })
        ));
        assert!(matches!(
            directory.resolve("agent-404", ChainTag::Evm),
            Err(ChannelError::PeerUnknown { .. })
        ));
    }
}
