#![allow(dead_code)]

use eyre::{eyre, Result, WrapErr};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;

use alloy::primitives::U256;
use paychan_rs::types::{parse_amount, MAX_SETTLEMENT_TIMEOUT_SECS, MIN_SETTLEMENT_TIMEOUT_SECS};

/// Main configuration for the connector
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub signer: SignerConfig,
    pub evm: EvmConfig,
    pub xrp: XrpConfig,
    pub channels: ChannelsConfig,
    pub peer: PeerConfig,
    pub connector: ConnectorConfig,
}

/// Database configuration
#[derive(Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

/// Custom Debug that redacts the database URL (may contain credentials).
impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .finish()
    }
}

/// Master key material
#[derive(Clone, Deserialize)]
pub struct SignerConfig {
    pub mnemonic: String,
}

/// Custom Debug that redacts the mnemonic to prevent accidental log leakage.
impl fmt::Debug for SignerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignerConfig")
            .field("mnemonic", &"<redacted>")
            .finish()
    }
}

/// EVM chain configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EvmConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    /// Payment-channel contract address (the typed-data verifying contract)
    pub channels_address: String,
    #[serde(default = "default_finality_blocks")]
    pub finality_blocks: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

/// XRP Ledger configuration
#[derive(Debug, Clone, Deserialize)]
pub struct XrpConfig {
    pub rpc_url: String,
    #[serde(default = "default_xrp_enabled")]
    pub enabled: bool,
}

/// Channel lifecycle configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Challenge period requested at open, seconds
    pub settlement_timeout_secs: u64,
    /// Rebalance trigger: close + reopen below this remaining balance
    pub min_channel_balance: U256,
    /// Deposit used when a rebalance opens a fresh channel
    pub max_channel_balance: U256,
    pub rebalance_enabled: bool,
    /// How long before challenge expiry a dispute update must be in
    pub challenge_period_slack_secs: u64,
    /// After this lifetime a channel may be force-closed by anyone
    pub max_channel_lifetime_secs: u64,
    /// Default per-account settlement threshold
    pub settlement_threshold: U256,
}

/// Peer transport configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PeerConfig {
    #[serde(default = "default_peer_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

/// Connector loop configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

/// Default functions
fn default_finality_blocks() -> u64 {
    1
}

fn default_confirmation_timeout_secs() -> u64 {
    60
}

fn default_xrp_enabled() -> bool {
    true
}

fn default_peer_timeout_ms() -> u64 {
    5000
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_poll_interval() -> u64 {
    1000
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        Self::load_from_file(".env").or_else(|_| Self::load_from_env())
    }

    /// Load from a specific .env file path
    pub fn load_from_file(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            dotenvy::from_filename(path)
                .wrap_err_with(|| format!("Failed to load .env file from {}", path))?;
        }
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    fn load_from_env() -> Result<Self> {
        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .map_err(|_| eyre!("DATABASE_URL environment variable is required"))?,
        };

        let signer = SignerConfig {
            mnemonic: env::var("MASTER_MNEMONIC")
                .map_err(|_| eyre!("MASTER_MNEMONIC environment variable is required"))?,
        };

        let evm = EvmConfig {
            rpc_url: env::var("EVM_RPC_URL")
                .map_err(|_| eyre!("EVM_RPC_URL environment variable is required"))?,
            chain_id: env::var("EVM_CHAIN_ID")
                .map_err(|_| eyre!("EVM_CHAIN_ID environment variable is required"))?
                .parse()
                .wrap_err("EVM_CHAIN_ID must be a valid u64")?,
            channels_address: env::var("EVM_CHANNELS_ADDRESS")
                .map_err(|_| eyre!("EVM_CHANNELS_ADDRESS environment variable is required"))?,
            finality_blocks: env::var("EVM_FINALITY_BLOCKS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_finality_blocks()),
            confirmation_timeout_secs: env::var("EVM_CONFIRMATION_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_confirmation_timeout_secs()),
        };

        let xrp = XrpConfig {
            rpc_url: env::var("XRP_RPC_URL")
                .map_err(|_| eyre!("XRP_RPC_URL environment variable is required"))?,
            enabled: env::var("XRP_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_xrp_enabled()),
        };

        let channels = ChannelsConfig {
            settlement_timeout_secs: env::var("SETTLEMENT_TIMEOUT_SECONDS")
                .map_err(|_| eyre!("SETTLEMENT_TIMEOUT_SECONDS environment variable is required"))?
                .parse()
                .wrap_err("SETTLEMENT_TIMEOUT_SECONDS must be a valid u64")?,
            min_channel_balance: parse_amount(
                &env::var("MIN_CHANNEL_BALANCE")
                    .map_err(|_| eyre!("MIN_CHANNEL_BALANCE environment variable is required"))?,
            )?,
            max_channel_balance: parse_amount(
                &env::var("MAX_CHANNEL_BALANCE")
                    .map_err(|_| eyre!("MAX_CHANNEL_BALANCE environment variable is required"))?,
            )?,
            rebalance_enabled: env::var("REBALANCE_ENABLED")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            challenge_period_slack_secs: env::var("CHALLENGE_PERIOD_SLACK_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(300),
            max_channel_lifetime_secs: env::var("MAX_CHANNEL_LIFETIME_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(90 * 24 * 60 * 60),
            settlement_threshold: parse_amount(
                &env::var("SETTLEMENT_THRESHOLD")
                    .map_err(|_| eyre!("SETTLEMENT_THRESHOLD environment variable is required"))?,
            )?,
        };

        let peer = PeerConfig {
            timeout_ms: env::var("PEER_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_peer_timeout_ms()),
            retry_attempts: env::var("RETRY_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_retry_attempts()),
            retry_delay_ms: env::var("RETRY_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_retry_delay_ms()),
        };

        let connector = ConnectorConfig {
            poll_interval_ms: env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default_poll_interval()),
        };

        let config = Config {
            database,
            signer,
            evm,
            xrp,
            channels,
            peer,
            connector,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.database.url.is_empty() {
            return Err(eyre!("database.url cannot be empty"));
        }

        let mnemonic_words: Vec<&str> = self.signer.mnemonic.split_whitespace().collect();
        if mnemonic_words.len() < 12 {
            return Err(eyre!("signer.mnemonic must have at least 12 words"));
        }

        if self.evm.rpc_url.is_empty() {
            return Err(eyre!("evm.rpc_url cannot be empty"));
        }

        if self.evm.channels_address.len() != 42 || !self.evm.channels_address.starts_with("0x") {
            return Err(eyre!(
                "evm.channels_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.xrp.enabled && self.xrp.rpc_url.is_empty() {
            return Err(eyre!("xrp.rpc_url cannot be empty when XRP is enabled"));
        }

        if !(MIN_SETTLEMENT_TIMEOUT_SECS..=MAX_SETTLEMENT_TIMEOUT_SECS)
            .contains(&self.channels.settlement_timeout_secs)
        {
            return Err(eyre!(
                "channels.settlement_timeout_secs must be within [{}, {}]",
                MIN_SETTLEMENT_TIMEOUT_SECS,
                MAX_SETTLEMENT_TIMEOUT_SECS
            ));
        }

        if self.channels.min_channel_balance >= self.channels.max_channel_balance {
            return Err(eyre!(
                "channels.min_channel_balance must be below channels.max_channel_balance"
            ));
        }

        if self.channels.settlement_threshold.is_zero() {
            return Err(eyre!("channels.settlement_threshold cannot be zero"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> Config {
        Config {
            database: DatabaseConfig {
                url: "sqlite://connector.db".to_string(),
            },
            signer: SignerConfig {
                mnemonic: "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about".to_string(),
            },
            evm: EvmConfig {
                rpc_url: "http://localhost:8545".to_string(),
                chain_id: 31337,
                channels_address: "0x0000000000000000000000000000000000000042".to_string(),
                finality_blocks: 1,
                confirmation_timeout_secs: 60,
            },
            xrp: XrpConfig {
                rpc_url: "http://localhost:5005".to_string(),
                enabled: true,
            },
            channels: ChannelsConfig {
                settlement_timeout_secs: 86_400,
                min_channel_balance: U256::from(100_000u64),
                max_channel_balance: U256::from(10_000_000u64),
                rebalance_enabled: true,
                challenge_period_slack_secs: 300,
                max_channel_lifetime_secs: 90 * 24 * 60 * 60,
                settlement_threshold: U256::from(1_000_000u64),
            },
            peer: PeerConfig {
                timeout_ms: 5000,
                retry_attempts: 3,
                retry_delay_ms: 500,
            },
            connector: ConnectorConfig {
                poll_interval_ms: 1000,
            },
        }
    }

    #[test]
    fn test_defaults() {
        assert_eq!(default_finality_blocks(), 1);
        assert_eq!(default_confirmation_timeout_secs(), 60);
        assert_eq!(default_peer_timeout_ms(), 5000);
        assert_eq!(default_retry_attempts(), 3);
        assert_eq!(default_retry_delay_ms(), 500);
        assert_eq!(default_poll_interval(), 1000);
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn test_channels_address_validation() {
        let mut config = valid_config();
        config.evm.channels_address = "invalid".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mnemonic_word_count() {
        let mut config = valid_config();
        config.signer.mnemonic = "too few words".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settlement_timeout_bounds() {
        let mut config = valid_config();

        config.channels.settlement_timeout_secs = MIN_SETTLEMENT_TIMEOUT_SECS;
        assert!(config.validate().is_ok());

        config.channels.settlement_timeout_secs = MAX_SETTLEMENT_TIMEOUT_SECS;
        assert!(config.validate().is_ok());

        config.channels.settlement_timeout_secs = MIN_SETTLEMENT_TIMEOUT_SECS - 1;
        assert!(config.validate().is_err());

        config.channels.settlement_timeout_secs = MAX_SETTLEMENT_TIMEOUT_SECS + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rebalance_bounds_ordering() {
        let mut config = valid_config();
        config.channels.min_channel_balance = config.channels.max_channel_balance;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = valid_config();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("abandon"));
        assert!(!debug.contains("connector.db"));
        assert!(debug.contains("<redacted>"));
    }
}
