//! Balance-proof codec: canonical encoding, typed-data hashing, signing and
//! recovery for off-chain channel state.
//!
//! The codec is pure: no I/O, no locks, no suspension points. Amount
//! truncation anywhere in here is a fatal error, never a silent narrowing.
//!
//! Two signature families are covered:
//! - EVM: EIP-712 typed data under a chain-scoped domain, secp256k1 ECDSA
//!   with recovery id, 65-byte `r || s || v` signatures.
//! - XRP: PayChannel claim blobs (`"CLM\0" || channel_id || amount`) signed
//!   with the channel keypair over the SHA-512Half digest.

use alloy::primitives::{Address, Signature, B256, U256};
use alloy::signers::{local::PrivateKeySigner, SignerSync};
use alloy::sol;
use alloy::sol_types::{eip712_domain, Eip712Domain, SolStruct};
use sha2::{Digest, Sha512};
use tiny_keccak::{Hasher, Keccak};

use crate::error::ChannelError;
use crate::types::ChannelId;

/// Typed-data protocol name baked into every domain separator
pub const PROTOCOL_NAME: &str = "PayChan";

/// Typed-data protocol version
pub const PROTOCOL_VERSION: &str = "1";

/// Packed balance-proof length: channel_id + nonce + transferred + locked + locks_root
pub const PACKED_PROOF_LEN: usize = 160;

/// Signature length: r || s || v
pub const SIGNATURE_LEN: usize = 65;

/// Peer wire message length: packed proof followed by the signature
pub const WIRE_MESSAGE_LEN: usize = PACKED_PROOF_LEN + SIGNATURE_LEN;

/// XRP claim prefix, matching the ledger's PayChannel claim format
const CLAIM_PREFIX: &[u8; 4] = b"CLM\0";

// Typed-data struct layouts. Field order is part of the wire contract and
// must match the verifying contract's hashes.
sol! {
    struct BalanceProofData {
        bytes32 channel_id;
        uint256 nonce;
        uint256 transferred_amount;
        uint256 locked_amount;
        bytes32 locks_root;
    }

    struct WithdrawProofData {
        bytes32 channel_id;
        address participant;
        uint256 amount;
        uint256 nonce;
        uint256 expiry;
    }
}

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

// ============================================================================
// Domain
// ============================================================================

/// Chain-scoped typed-data domain: digests signed under one domain never
/// verify under another chain or contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofDomain {
    pub chain_id: u64,
    pub verifying_contract: Address,
}

impl ProofDomain {
    pub fn new(chain_id: u64, verifying_contract: Address) -> Self {
        Self {
            chain_id,
            verifying_contract,
        }
    }

    fn eip712(&self) -> Eip712Domain {
        eip712_domain! {
            name: PROTOCOL_NAME,
            version: PROTOCOL_VERSION,
            chain_id: self.chain_id,
            verifying_contract: self.verifying_contract,
        }
    }
}

// ============================================================================
// Balance proof
// ============================================================================

/// The signed off-chain state of a channel.
///
/// `nonce` is strictly increasing per channel; `transferred_amount` is
/// cumulative and non-decreasing in nonce; `locked_amount` and `locks_root`
/// are zero when no conditional transfers are pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceProof {
    pub channel_id: ChannelId,
    pub nonce: u64,
    pub transferred_amount: U256,
    pub locked_amount: U256,
    pub locks_root: [u8; 32],
}

impl BalanceProof {
    /// Canonical fixed-layout encoding:
    /// `channel_id(32) || nonce(32 BE) || transferred(32 BE) || locked(32 BE) || locks_root(32)`
    pub fn encode_packed(&self) -> [u8; PACKED_PROOF_LEN] {
        let mut data = [0u8; PACKED_PROOF_LEN];
        data[0..32].copy_from_slice(self.channel_id.as_bytes());
        data[32..64].copy_from_slice(&U256::from(self.nonce).to_be_bytes::<32>());
        data[64..96].copy_from_slice(&self.transferred_amount.to_be_bytes::<32>());
        data[96..128].copy_from_slice(&self.locked_amount.to_be_bytes::<32>());
        data[128..160].copy_from_slice(&self.locks_root);
        data
    }

    /// Decode the canonical fixed layout
    pub fn decode_packed(data: &[u8]) -> Result<Self, ChannelError> {
        if data.len() != PACKED_PROOF_LEN {
            return Err(ChannelError::InvalidSignature(format!(
                "packed balance proof must be {} bytes, got {}",
                PACKED_PROOF_LEN,
                data.len()
            )));
        }
        let mut channel_id = [0u8; 32];
        channel_id.copy_from_slice(&data[0..32]);
        let nonce_word = U256::from_be_slice(&data[32..64]);
        let nonce = u64::try_from(nonce_word).map_err(|_| {
            ChannelError::AmountOverflow(format!("nonce {} does not fit in u64", nonce_word))
        })?;
        let mut locks_root = [0u8; 32];
        locks_root.copy_from_slice(&data[128..160]);
        Ok(Self {
            channel_id: ChannelId::from_bytes(channel_id),
            nonce,
            transferred_amount: U256::from_be_slice(&data[64..96]),
            locked_amount: U256::from_be_slice(&data[96..128]),
            locks_root,
        })
    }

    /// Commitment over the balance fields, as stored on-chain at close time
    pub fn balance_hash(&self) -> [u8; 32] {
        let mut data = [0u8; 96];
        data[0..32].copy_from_slice(&self.transferred_amount.to_be_bytes::<32>());
        data[32..64].copy_from_slice(&self.locked_amount.to_be_bytes::<32>());
        data[64..96].copy_from_slice(&self.locks_root);
        keccak256(&data)
    }

    fn typed(&self) -> BalanceProofData {
        BalanceProofData {
            channel_id: B256::from(*self.channel_id.as_bytes()),
            nonce: U256::from(self.nonce),
            transferred_amount: self.transferred_amount,
            locked_amount: self.locked_amount,
            locks_root: B256::from(self.locks_root),
        }
    }
}

/// A balance proof together with its 65-byte signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedBalanceProof {
    pub proof: BalanceProof,
    pub signature: [u8; SIGNATURE_LEN],
}

/// Typed-data digest of a balance proof under a domain
pub fn proof_digest(proof: &BalanceProof, domain: &ProofDomain) -> [u8; 32] {
    proof.typed().eip712_signing_hash(&domain.eip712()).0
}

/// Sign a balance proof; returns the 65-byte `r || s || v` signature
pub fn sign_balance_proof(
    proof: &BalanceProof,
    domain: &ProofDomain,
    signer: &PrivateKeySigner,
) -> Result<[u8; SIGNATURE_LEN], ChannelError> {
    let digest = B256::from(proof_digest(proof, domain));
    let signature = signer
        .sign_hash_sync(&digest)
        .map_err(|e| ChannelError::InvalidSignature(format!("signing failed: {}", e)))?;
    Ok(signature.as_bytes())
}

/// Recover the signer address of a balance proof.
///
/// The caller must still check membership against the channel's two
/// participants; this only establishes who signed.
pub fn recover_balance_proof(
    proof: &BalanceProof,
    domain: &ProofDomain,
    signature: &[u8],
) -> Result<Address, ChannelError> {
    let digest = B256::from(proof_digest(proof, domain));
    recover_prehash(&digest, signature)
}

// ============================================================================
// Withdraw proof
// ============================================================================

/// Counterparty-authorized partial withdrawal.
///
/// Carries its own nonce sequence, independent from the balance-proof
/// nonces, and an absolute expiry after which the ledger refuses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WithdrawProof {
    pub channel_id: ChannelId,
    pub participant: Address,
    pub amount: U256,
    pub nonce: u64,
    pub expiry: u64,
}

impl WithdrawProof {
    fn typed(&self) -> WithdrawProofData {
        WithdrawProofData {
            channel_id: B256::from(*self.channel_id.as_bytes()),
            participant: self.participant,
            amount: self.amount,
            nonce: U256::from(self.nonce),
            expiry: U256::from(self.expiry),
        }
    }
}

/// Typed-data digest of a withdraw proof under a domain
pub fn withdraw_digest(proof: &WithdrawProof, domain: &ProofDomain) -> [u8; 32] {
    proof.typed().eip712_signing_hash(&domain.eip712()).0
}

/// Sign a withdraw proof. Must be invoked with the key of the participant
/// who is *not* withdrawing.
pub fn sign_withdraw_proof(
    proof: &WithdrawProof,
    domain: &ProofDomain,
    signer: &PrivateKeySigner,
) -> Result<[u8; SIGNATURE_LEN], ChannelError> {
    let digest = B256::from(withdraw_digest(proof, domain));
    let signature = signer
        .sign_hash_sync(&digest)
        .map_err(|e| ChannelError::InvalidSignature(format!("signing failed: {}", e)))?;
    Ok(signature.as_bytes())
}

/// Recover the signer address of a withdraw proof
pub fn recover_withdraw_proof(
    proof: &WithdrawProof,
    domain: &ProofDomain,
    signature: &[u8],
) -> Result<Address, ChannelError> {
    let digest = B256::from(withdraw_digest(proof, domain));
    recover_prehash(&digest, signature)
}

fn recover_prehash(digest: &B256, signature: &[u8]) -> Result<Address, ChannelError> {
    let signature = Signature::try_from(signature)
        .map_err(|e| ChannelError::InvalidSignature(format!("malformed signature: {}", e)))?;
    signature
        .recover_address_from_prehash(digest)
        .map_err(|e| ChannelError::InvalidSignature(format!("recovery failed: {}", e)))
}

// ============================================================================
// Peer wire codec
// ============================================================================

/// Encode a signed balance proof into the stable peer wire form:
/// the 160-byte packed proof followed by the 65-byte signature.
pub fn encode_proof_message(signed: &SignedBalanceProof) -> Vec<u8> {
    let mut out = Vec::with_capacity(WIRE_MESSAGE_LEN);
    out.extend_from_slice(&signed.proof.encode_packed());
    out.extend_from_slice(&signed.signature);
    out
}

/// Decode the peer wire form back into a signed balance proof
pub fn decode_proof_message(data: &[u8]) -> Result<SignedBalanceProof, ChannelError> {
    if data.len() != WIRE_MESSAGE_LEN {
        return Err(ChannelError::TransportRejected {
            reason: format!(
                "balance proof message must be {} bytes, got {}",
                WIRE_MESSAGE_LEN,
                data.len()
            ),
        });
    }
    let proof = BalanceProof::decode_packed(&data[..PACKED_PROOF_LEN])?;
    let mut signature = [0u8; SIGNATURE_LEN];
    signature.copy_from_slice(&data[PACKED_PROOF_LEN..]);
    Ok(SignedBalanceProof { proof, signature })
}

// ============================================================================
// XRP PayChannel claims
// ============================================================================

/// Encode an XRP PayChannel claim blob: `"CLM\0" || channel_id || amount_be_u64`
pub fn encode_claim(channel_id: &ChannelId, amount_drops: u64) -> [u8; 44] {
    let mut data = [0u8; 44];
    data[0..4].copy_from_slice(CLAIM_PREFIX);
    data[4..36].copy_from_slice(channel_id.as_bytes());
    data[36..44].copy_from_slice(&amount_drops.to_be_bytes());
    data
}

/// SHA-512Half digest of a claim blob (the ledger's signing digest)
pub fn claim_digest(channel_id: &ChannelId, amount_drops: u64) -> [u8; 32] {
    let blob = encode_claim(channel_id, amount_drops);
    let full = Sha512::digest(blob);
    let mut half = [0u8; 32];
    half.copy_from_slice(&full[..32]);
    half
}

/// Sign a PayChannel claim with the channel's secp256k1 key.
/// Returns the 64-byte compact signature.
pub fn sign_claim(
    secret_key: &secp256k1::SecretKey,
    channel_id: &ChannelId,
    amount_drops: u64,
) -> [u8; 64] {
    let secp = secp256k1::Secp256k1::new();
    let message = secp256k1::Message::from_digest(claim_digest(channel_id, amount_drops));
    secp.sign_ecdsa(&message, secret_key).serialize_compact()
}

/// Verify a signed balance proof against the expected signer identity in
/// the chain-native scheme.
///
/// EVM: `expected_signer` is the 0x address the EIP-712 signature must
/// recover to. XRP: `expected_signer` is the compressed claim public key in
/// hex, and the first 64 signature bytes must verify as a PayChannel claim
/// over the cumulative transferred amount.
pub fn verify_proof_signature(
    chain: crate::types::ChainTag,
    proof: &BalanceProof,
    domain: &ProofDomain,
    signature: &[u8; SIGNATURE_LEN],
    expected_signer: &str,
) -> Result<(), ChannelError> {
    match chain {
        crate::types::ChainTag::Evm => {
            let recovered = recover_balance_proof(proof, domain, signature)?;
            if format!("{}", recovered) != expected_signer {
                return Err(ChannelError::InvalidSignature(format!(
                    "proof signed by {}, expected {}",
                    recovered, expected_signer
                )));
            }
            Ok(())
        }
        crate::types::ChainTag::Xrp => {
            let key_bytes = hex::decode(expected_signer).map_err(|e| {
                ChannelError::InvalidSignature(format!("bad claim public key: {}", e))
            })?;
            let public_key = secp256k1::PublicKey::from_slice(&key_bytes).map_err(|e| {
                ChannelError::InvalidSignature(format!("bad claim public key: {}", e))
            })?;
            let drops = crate::types::amount_to_drops(proof.transferred_amount)
                .map_err(|e| ChannelError::AmountOverflow(e.to_string()))?;
            let mut compact = [0u8; 64];
            compact.copy_from_slice(&signature[..64]);
            verify_claim(&public_key, &proof.channel_id, drops, &compact)
        }
    }
}

/// Verify a PayChannel claim signature against the channel's public key
pub fn verify_claim(
    public_key: &secp256k1::PublicKey,
    channel_id: &ChannelId,
    amount_drops: u64,
    signature: &[u8; 64],
) -> Result<(), ChannelError> {
    let secp = secp256k1::Secp256k1::new();
    let message = secp256k1::Message::from_digest(claim_digest(channel_id, amount_drops));
    let signature = secp256k1::ecdsa::Signature::from_compact(signature)
        .map_err(|e| ChannelError::InvalidSignature(format!("malformed claim signature: {}", e)))?;
    secp.verify_ecdsa(&message, &signature, public_key)
        .map_err(|e| ChannelError::InvalidSignature(format!("claim verification failed: {}", e)))
}
