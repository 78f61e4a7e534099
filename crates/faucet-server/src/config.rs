//! Configuration management for the faucet server.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Configuration for the faucet server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaucetConfig {
    /// HTTP server configuration
    pub http: HttpConfig,

    /// Payout presentation and amounts
    pub faucet: PayoutConfig,

    /// Ethereum blockchain configuration
    pub ethereum: EthereumConfig,

    /// hCaptcha verification configuration
    pub captcha: CaptchaConfig,

    /// Per-client rate limiting configuration
    pub rate_limit: RateLimitConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Port to bind to
    pub port: u16,

    /// Address to bind to
    pub bind_address: String,
}

/// Network naming and payout amounts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayoutConfig {
    /// Human-readable network name shown in /api/info
    pub network: String,

    /// Asset symbol shown in /api/info
    pub symbol: String,

    /// Native payout per claim, in ETH
    pub native_payout_eth: f64,

    /// Token payout per claim, in whole tokens (18 decimals assumed)
    pub token_payout_eth: f64,
}

/// Ethereum blockchain configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthereumConfig {
    /// RPC endpoint URL
    pub rpc_url: String,

    /// Private key for the faucet wallet (hex string, 0x prefix optional)
    pub private_key: String,

    /// Chain id for signature binding; queried from the node when unset
    pub chain_id: Option<u64>,

    /// ERC-20 token contract address; token claims fail when unset
    pub token_address: Option<String>,

    /// Gas limit for token transfer transactions
    pub token_gas_limit: u64,

    /// Deadline in seconds for each outbound gateway call
    pub request_timeout_secs: u64,
}

/// hCaptcha configuration; an empty secret disables verification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptchaConfig {
    /// Site key served to the frontend via /api/info
    pub site_key: String,

    /// Verification secret
    pub secret: String,

    /// Verification endpoint
    pub verify_url: String,
}

/// Rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Claim window per client in minutes; 0 disables limiting
    pub window_minutes: u64,

    /// How often expired entries are purged, in minutes
    pub purge_interval_minutes: u64,
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            http: HttpConfig {
                port: 8080,
                bind_address: "127.0.0.1".to_string(),
            },
            faucet: PayoutConfig {
                network: "sepolia".to_string(),
                symbol: "ETH".to_string(),
                native_payout_eth: 0.001,
                token_payout_eth: 1.0,
            },
            ethereum: EthereumConfig {
                rpc_url: "https://rpc.sepolia.org".to_string(),
                private_key: "your_private_key_here".to_string(),
                chain_id: None,
                token_address: None,
                token_gas_limit: 100_000,
                request_timeout_secs: 5,
            },
            captcha: CaptchaConfig {
                site_key: String::new(),
                secret: String::new(),
                verify_url: crate::captcha::HCAPTCHA_VERIFY_URL.to_string(),
            },
            rate_limit: RateLimitConfig {
                window_minutes: 1440,
                purge_interval_minutes: 30,
            },
        }
    }
}

impl FaucetConfig {
    /// Load configuration from a TOML file with `FAUCET_*` env overrides
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, config::ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path.as_ref().to_str().unwrap()))
            .add_source(config::Environment::with_prefix("FAUCET"))
            .build()?;

        settings.try_deserialize()
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let toml_string = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_string)?;
        Ok(())
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.ethereum.private_key == "your_private_key_here" {
            return Err(anyhow::anyhow!("Private key must be configured"));
        }

        let key = self
            .ethereum
            .private_key
            .strip_prefix("0x")
            .unwrap_or(&self.ethereum.private_key);
        if key.len() != 64 {
            return Err(anyhow::anyhow!("Private key must be 64 hex characters"));
        }

        if self.faucet.native_payout_eth < 0.0 || self.faucet.token_payout_eth < 0.0 {
            return Err(anyhow::anyhow!("Payout amounts must not be negative"));
        }

        if self.faucet.token_payout_eth > 0.0 && self.ethereum.token_address.is_none() {
            return Err(anyhow::anyhow!(
                "Token payout is configured but ethereum.token_address is not set"
            ));
        }

        if self.ethereum.request_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Gateway request timeout must be greater than 0"));
        }

        Ok(())
    }
}
