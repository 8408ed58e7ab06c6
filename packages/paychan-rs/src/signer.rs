//! Signer service: deterministic per-(agent, chain) signers from a master
//! seed.
//!
//! Keys are derived on demand, handed out as short-lived signer values, and
//! the intermediate key material is wiped as soon as the signer is built.
//! The public-facing [`SignerHandle`] records never contain private keys.

use alloy::primitives::B256;
use alloy::signers::local::PrivateKeySigner;
use bip39::Mnemonic;
use eyre::{eyre, Result, WrapErr};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};
use tiny_keccak::{Hasher, Keccak};
use zeroize::{Zeroize, Zeroizing};

use crate::error::ChannelError;
use crate::proof::{sign_balance_proof, sign_claim, BalanceProof, ProofDomain, SIGNATURE_LEN};
use crate::types::{amount_to_drops, ChainTag};

/// Domain separator for key derivation; versioned so a derivation change
/// never silently collides with existing keys.
const DERIVATION_TAG: &[u8] = b"paychan/key/v1";

/// Produces deterministic signers for (agent, chain) pairs from a master
/// seed. The seed itself is wiped on drop.
pub struct SignerService {
    seed: Zeroizing<[u8; 64]>,
}

impl std::fmt::Debug for SignerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignerService")
            .field("seed", &"<redacted>")
            .finish()
    }
}

impl SignerService {
    /// Build from a BIP-39 mnemonic phrase (12+ words).
    pub fn from_mnemonic(mnemonic: &str) -> Result<Self> {
        let parsed = Mnemonic::parse_normalized(mnemonic)
            .wrap_err("Invalid master mnemonic")?;
        Ok(Self {
            seed: Zeroizing::new(parsed.to_seed("")),
        })
    }

    /// Build directly from a 64-byte seed (tests, key import).
    pub fn from_seed(seed: [u8; 64]) -> Self {
        Self {
            seed: Zeroizing::new(seed),
        }
    }

    /// Derive the 32-byte private key for (agent, chain).
    fn derive_key(&self, agent_id: &str, chain: ChainTag) -> Zeroizing<[u8; 32]> {
        let mut hasher = Keccak::v256();
        hasher.update(DERIVATION_TAG);
        hasher.update(self.seed.as_ref());
        hasher.update(&[0x00]);
        hasher.update(agent_id.as_bytes());
        hasher.update(&[0x00]);
        hasher.update(chain.as_str().as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        hasher.finalize(key.as_mut());
        key
    }

    /// EVM signer for an agent. The derived key bytes are wiped once the
    /// signer owns them.
    pub fn evm_signer(&self, agent_id: &str) -> Result<PrivateKeySigner> {
        let key = self.derive_key(agent_id, ChainTag::Evm);
        let signer = PrivateKeySigner::from_bytes(&B256::from_slice(key.as_ref()))
            .map_err(|e| eyre!("Derived EVM key rejected: {}", e))?;
        Ok(signer)
    }

    /// XRP signer for an agent: claim keypair plus the account seed handed
    /// to the trusted rippled node for transaction submission.
    pub fn xrp_signer(&self, agent_id: &str) -> Result<XrpSigner> {
        let key = self.derive_key(agent_id, ChainTag::Xrp);
        let secret_key = secp256k1::SecretKey::from_slice(key.as_ref())
            .map_err(|e| eyre!("Derived XRP key rejected: {}", e))?;
        let secp = secp256k1::Secp256k1::new();
        let public_key = secp256k1::PublicKey::from_secret_key(&secp, &secret_key);

        // Account seed: first 16 bytes of an independent derivation, so the
        // account key and the claim key never coincide.
        let mut hasher = Keccak::v256();
        hasher.update(DERIVATION_TAG);
        hasher.update(self.seed.as_ref());
        hasher.update(&[0x01]);
        hasher.update(agent_id.as_bytes());
        let mut account_material = Zeroizing::new([0u8; 32]);
        hasher.finalize(account_material.as_mut());
        let seed_hex = Zeroizing::new(hex::encode_upper(&account_material[..16]));

        Ok(XrpSigner {
            secret_key,
            public_key,
            seed_hex,
        })
    }

    /// Chain-dispatched signer for an agent.
    pub fn agent_signer(&self, agent_id: &str, chain: ChainTag) -> Result<AgentSigner> {
        match chain {
            ChainTag::Evm => Ok(AgentSigner::Evm(self.evm_signer(agent_id)?)),
            ChainTag::Xrp => Ok(AgentSigner::Xrp(self.xrp_signer(agent_id)?)),
        }
    }

    /// Public record for an (agent, chain) pair: identifier material only.
    pub fn handle(&self, agent_id: &str, chain: ChainTag) -> Result<SignerHandle> {
        let address = match chain {
            ChainTag::Evm => format!("{}", self.evm_signer(agent_id)?.address()),
            ChainTag::Xrp => self.xrp_signer(agent_id)?.public_key_hex(),
        };
        Ok(SignerHandle {
            agent_id: agent_id.to_string(),
            chain,
            address,
        })
    }
}

/// Public-facing signer record: never carries key material.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignerHandle {
    pub agent_id: String,
    pub chain: ChainTag,
    /// EVM: checksummed 0x address. XRP: compressed claim public key, hex.
    pub address: String,
}

/// XRP signing material: the secp256k1 claim keypair and the account seed
/// used for sign-and-submit against a trusted rippled node.
pub struct XrpSigner {
    secret_key: secp256k1::SecretKey,
    public_key: secp256k1::PublicKey,
    seed_hex: Zeroizing<String>,
}

impl std::fmt::Debug for XrpSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XrpSigner")
            .field("public_key", &self.public_key_hex())
            .field("secret_key", &"<redacted>")
            .field("seed_hex", &"<redacted>")
            .finish()
    }
}

impl XrpSigner {
    /// Compressed claim public key, uppercase hex (the PayChannel
    /// `PublicKey` field representation).
    pub fn public_key_hex(&self) -> String {
        hex::encode_upper(self.public_key.serialize())
    }

    pub fn public_key(&self) -> &secp256k1::PublicKey {
        &self.public_key
    }

    /// The account seed for the trusted node, hex-encoded.
    pub fn seed_hex(&self) -> &str {
        &self.seed_hex
    }

    /// Sign a PayChannel claim for a cumulative amount in drops.
    pub fn sign_claim(&self, channel_id: &crate::types::ChannelId, drops: u64) -> [u8; 64] {
        sign_claim(&self.secret_key, channel_id, drops)
    }
}

/// Chain-dispatched signer for balance proofs.
pub enum AgentSigner {
    Evm(PrivateKeySigner),
    Xrp(XrpSigner),
}

impl AgentSigner {
    /// Identifier of this signer on its chain (see [`SignerHandle::address`]).
    pub fn address(&self) -> String {
        match self {
            AgentSigner::Evm(signer) => format!("{}", signer.address()),
            AgentSigner::Xrp(signer) => signer.public_key_hex(),
        }
    }

    /// Sign a balance proof in the chain-native scheme.
    ///
    /// EVM proofs sign the EIP-712 digest under `domain`; XRP proofs sign
    /// the PayChannel claim over the cumulative transferred amount (the
    /// 64-byte compact signature is carried in the first 64 bytes of the
    /// 65-byte wire slot, trailing byte zero).
    pub fn sign_proof(
        &self,
        proof: &BalanceProof,
        domain: &ProofDomain,
    ) -> Result<[u8; SIGNATURE_LEN], ChannelError> {
        match self {
            AgentSigner::Evm(signer) => sign_balance_proof(proof, domain, signer),
            AgentSigner::Xrp(signer) => {
                let drops = amount_to_drops(proof.transferred_amount)
                    .map_err(|e| ChannelError::AmountOverflow(e.to_string()))?;
                let compact = signer.sign_claim(&proof.channel_id, drops);
                let mut out = [0u8; SIGNATURE_LEN];
                out[..64].copy_from_slice(&compact);
                Ok(out)
            }
        }
    }
}

/// Classic-address encoding of an XRP account id (ripemd160(sha256(pubkey)),
/// base58-check with the ripple alphabet, version byte 0x00).
pub fn xrp_classic_address(public_key: &secp256k1::PublicKey) -> String {
    let sha = Sha256::digest(public_key.serialize());
    let account_id = Ripemd160::digest(sha);
    let mut payload = [0u8; 21];
    payload[1..].copy_from_slice(&account_id);
    bs58::encode(payload)
        .with_alphabet(bs58::Alphabet::RIPPLE)
        .with_check()
        .into_string()
}

/// Wipe a caller-held key buffer. Helper for call sites that copy derived
/// key material out of the service.
pub fn wipe(bytes: &mut [u8]) {
    bytes.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::U256;
    use crate::proof::{recover_balance_proof, verify_claim};
    use crate::types::ChannelId;

    const TEST_MNEMONIC: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    #[test]
    fn test_derivation_is_deterministic() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let a1 = service.evm_signer("agent-001").unwrap().address();
        let a2 = service.evm_signer("agent-001").unwrap().address();
        assert_eq!(a1, a2);
    }

    #[test]
    fn test_agents_and_chains_get_distinct_keys() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let evm_1 = service.evm_signer("agent-001").unwrap().address();
        let evm_2 = service.evm_signer("agent-002").unwrap().address();
        assert_ne!(evm_1, evm_2);

        let xrp = service.xrp_signer("agent-001").unwrap();
        // The XRP claim key must not be the EVM key in another costume
        let evm_key = service.derive_key("agent-001", ChainTag::Evm);
        let xrp_key = service.derive_key("agent-001", ChainTag::Xrp);
        assert_ne!(evm_key.as_ref(), xrp_key.as_ref());
        assert_eq!(xrp.public_key_hex().len(), 66);
    }

    #[test]
    fn test_invalid_mnemonic_rejected() {
        assert!(SignerService::from_mnemonic("not a mnemonic").is_err());
    }

    #[test]
    fn test_handle_never_leaks_keys() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let handle = service.handle("agent-001", ChainTag::Evm).unwrap();
        assert!(handle.address.starts_with("0x"));
        let debug = format!("{:?}", service);
        assert!(debug.contains("<redacted>"));

        let xrp = service.xrp_signer("agent-001").unwrap();
        let debug = format!("{:?}", xrp);
        assert!(debug.contains("<redacted>"));
        assert!(!debug.contains(xrp.seed_hex()));
    }

    #[test]
    fn test_evm_proof_signing_roundtrip() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let signer = service.agent_signer("agent-001", ChainTag::Evm).unwrap();
        let domain = ProofDomain::new(
            31337,
            "0x0000000000000000000000000000000000000042".parse().unwrap(),
        );
        let proof = BalanceProof {
            channel_id: ChannelId::from_bytes([1u8; 32]),
            nonce: 1,
            transferred_amount: U256::from(10u64),
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        };

        let signature = signer.sign_proof(&proof, &domain).unwrap();
        let recovered = recover_balance_proof(&proof, &domain, &signature).unwrap();
        assert_eq!(format!("{}", recovered), signer.address());
    }

    #[test]
    fn test_xrp_proof_signing_verifies_as_claim() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let xrp = service.xrp_signer("agent-001").unwrap();
        let domain = ProofDomain::new(0, alloy::primitives::Address::ZERO);
        let proof = BalanceProof {
            channel_id: ChannelId::from_bytes([2u8; 32]),
            nonce: 3,
            transferred_amount: U256::from(1_000_000u64),
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        };

        let signer = AgentSigner::Xrp(service.xrp_signer("agent-001").unwrap());
        let signature = signer.sign_proof(&proof, &domain).unwrap();
        let mut compact = [0u8; 64];
        compact.copy_from_slice(&signature[..64]);
        verify_claim(xrp.public_key(), &proof.channel_id, 1_000_000, &compact).unwrap();
    }

    #[test]
    fn test_xrp_amount_overflow_is_fatal() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let signer = service.agent_signer("agent-001", ChainTag::Xrp).unwrap();
        let domain = ProofDomain::new(0, alloy::primitives::Address::ZERO);
        let proof = BalanceProof {
            channel_id: ChannelId::from_bytes([2u8; 32]),
            nonce: 1,
            transferred_amount: U256::from(u64::MAX) + U256::from(1u64),
            locked_amount: U256::ZERO,
            locks_root: [0u8; 32],
        };
        let err = signer.sign_proof(&proof, &domain).unwrap_err();
        assert!(matches!(err, ChannelError::AmountOverflow(_)));
    }

    #[test]
    fn test_xrp_classic_address_shape() {
        let service = SignerService::from_mnemonic(TEST_MNEMONIC).unwrap();
        let xrp = service.xrp_signer("agent-001").unwrap();
        let address = xrp_classic_address(xrp.public_key());
        assert!(address.starts_with('r'));
        assert!(address.len() >= 25 && address.len() <= 35);
    }
}
