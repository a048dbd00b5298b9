use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::from_str;

use crate::{
    error::{Error, Result},
    model::{SettlementMode, SplitRatio},
    utils::parse_wallet,
};

pub const DEFAULT_RPC_URL: &str = "https://api.mainnet-beta.solana.com";
pub const PUMP_LIGHTNING_URL: &str = "https://pumpportal.fun/api/trade";
pub const PUMP_LOCAL_URL: &str = "https://pumpportal.fun/api/trade-local";

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub chain: Chain,
    pub pumpportal: PumpPortal,
    pub raffle: RaffleOpts,
    pub redis: String,
    #[serde(rename = "httpListen")]
    pub http_listen: String,
    #[serde(rename = "recaptchaSecret")]
    pub recaptcha_secret: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Chain {
    pub endpoint: String,
    #[serde(rename = "settlementMode")]
    pub settlement_mode: SettlementMode,
    #[serde(rename = "creatorSecret")]
    pub creator_secret: String,
    #[serde(rename = "ownerWallet")]
    pub owner_wallet: String,
    /// seconds, applies to every rpc and http call
    #[serde(rename = "requestTimeout")]
    pub request_timeout: u64,
    /// seconds, submit + confirm of one transfer
    #[serde(rename = "transferTimeout")]
    pub transfer_timeout: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct PumpPortal {
    #[serde(rename = "apiKey")]
    pub api_key: Option<String>,
    pub pool: String,
    #[serde(rename = "tokenMint")]
    pub token_mint: Option<String>,
    #[serde(rename = "priorityFee")]
    pub priority_fee: f64,
    #[serde(rename = "lightningUrl")]
    pub lightning_url: String,
    #[serde(rename = "localUrl")]
    pub local_url: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RaffleOpts {
    #[serde(rename = "activeRaffleId")]
    pub active_raffle_id: u64,
    #[serde(rename = "reserveLamports")]
    pub reserve_lamports: u64,
    pub split: SplitRatio,
    /// seconds between two rounds
    pub interval: u64,
    /// seconds to wait after fee collection before reading its effect
    #[serde(rename = "settlementDelay")]
    pub settlement_delay: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            chain: Chain::default(),
            pumpportal: PumpPortal::default(),
            raffle: RaffleOpts::default(),
            redis: "redis://127.0.0.1:6379/0".to_string(),
            http_listen: "0.0.0.0:8000".to_string(),
            recaptcha_secret: None,
        }
    }
}

impl Default for Chain {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_RPC_URL.to_string(),
            settlement_mode: SettlementMode::default(),
            creator_secret: String::new(),
            owner_wallet: String::new(),
            request_timeout: 30,
            transfer_timeout: 60,
        }
    }
}

impl Default for PumpPortal {
    fn default() -> Self {
        Self {
            api_key: None,
            pool: "pump".to_string(),
            token_mint: None,
            priority_fee: 0.000001,
            lightning_url: PUMP_LIGHTNING_URL.to_string(),
            local_url: PUMP_LOCAL_URL.to_string(),
        }
    }
}

impl Default for RaffleOpts {
    fn default() -> Self {
        Self {
            active_raffle_id: 1,
            reserve_lamports: 2_000_000,
            split: SplitRatio::default(),
            interval: 5 * 60,
            settlement_delay: 10,
        }
    }
}

impl Config {
    /// Reads the config file when it exists, applies environment overrides
    /// and validates the result. Called once at startup.
    pub fn load(file: &Path) -> Result<Self> {
        let mut config = if file.exists() {
            Self::parse_from_file(file)?
        } else {
            log::warn!("config file {:?} not found, using defaults and environment", file);
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn parse_from_file(file: &Path) -> Result<Self> {
        let confstr = std::fs::read_to_string(file)?;
        Ok(from_str(&confstr)?)
    }

    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = var("SOLANA_RPC_URL") {
            self.chain.endpoint = v;
        }
        if let Some(v) = var("SETTLEMENT_MODE") {
            self.chain.settlement_mode = v.parse().map_err(Error::Config)?;
        }
        if let Some(v) = var("CREATOR_PRIVATE_KEY_BASE58") {
            self.chain.creator_secret = v;
        }
        if let Some(v) = var("OWNER_WALLET") {
            self.chain.owner_wallet = v;
        }
        if let Some(v) = var("PUMPPORTAL_API_KEY") {
            self.pumpportal.api_key = Some(v);
        }
        if let Some(v) = var("PUMP_POOL") {
            self.pumpportal.pool = v;
        }
        if let Some(v) = var("TOKEN_MINT") {
            self.pumpportal.token_mint = Some(v);
        }
        if let Some(v) = var("RECAPTCHA_SECRET") {
            self.recaptcha_secret = Some(v);
        }
        if let Some(v) = var("REDIS_URL") {
            self.redis = v;
        }
        if let Some(v) = var("HTTP_LISTEN") {
            self.http_listen = v;
        }
        if let Some(v) = var("ACTIVE_RAFFLE_ID") {
            self.raffle.active_raffle_id = parse_num("ACTIVE_RAFFLE_ID", &v)?;
        }
        if let Some(v) = var("RESERVE_LAMPORTS") {
            self.raffle.reserve_lamports = parse_num("RESERVE_LAMPORTS", &v)?;
        }
        if let Some(v) = var("SPLIT_NUMERATOR") {
            self.raffle.split.numerator = parse_num("SPLIT_NUMERATOR", &v)?;
        }
        if let Some(v) = var("SPLIT_DENOMINATOR") {
            self.raffle.split.denominator = parse_num("SPLIT_DENOMINATOR", &v)?;
        }
        if let Some(v) = var("RAFFLE_INTERVAL_SECONDS") {
            self.raffle.interval = parse_num("RAFFLE_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = var("SETTLEMENT_DELAY_SECONDS") {
            self.raffle.settlement_delay = parse_num("SETTLEMENT_DELAY_SECONDS", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.raffle.split.validate()?;
        if self.raffle.interval == 0 {
            return Err(Error::Config("raffle interval must be positive".to_string()));
        }
        if self.chain.request_timeout == 0 || self.chain.transfer_timeout == 0 {
            return Err(Error::Config("timeouts must be positive".to_string()));
        }
        if self.chain.endpoint.is_empty() {
            return Err(Error::Config("chain endpoint is empty".to_string()));
        }
        Ok(())
    }

    /// Keys the worker cannot run without. The http service only needs redis.
    pub fn require_worker_keys(&self) -> Result<()> {
        if self.chain.creator_secret.is_empty() {
            return Err(Error::Config("CREATOR_PRIVATE_KEY_BASE58 is not set".to_string()));
        }
        if self.chain.owner_wallet.is_empty() {
            return Err(Error::Config("OWNER_WALLET is not set".to_string()));
        }
        parse_wallet(&self.chain.owner_wallet).map_err(|e| Error::Config(format!("OWNER_WALLET: {}", e)))?;
        Ok(())
    }

    /// The settlement mode never follows the endpoint, but an endpoint that
    /// names the other network is most likely a mistake worth reporting.
    pub fn mode_mismatch(&self) -> Option<String> {
        let endpoint = self.chain.endpoint.to_lowercase();
        let suspicious = match self.chain.settlement_mode {
            SettlementMode::ProductionSettlement => endpoint.contains("devnet") || endpoint.contains("testnet"),
            SettlementMode::TestSettlement => endpoint.contains("mainnet"),
        };
        suspicious.then(|| {
            format!(
                "settlement mode is {} but the rpc endpoint is {}, set SETTLEMENT_MODE if this is not intended",
                self.chain.settlement_mode, self.chain.endpoint
            )
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.request_timeout)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.transfer_timeout)
    }

    pub fn show() -> Result<String> {
        let de: Self = Default::default();
        Ok(serde_json::to_string_pretty(&de)?)
    }
}

fn parse_num(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|e| Error::Config(format!("{}={} is not a number: {}", key, value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_match_worker_constants() {
        let config = Config::default();
        assert_eq!(config.raffle.reserve_lamports, 2_000_000);
        assert_eq!(config.raffle.split, SplitRatio { numerator: 7, denominator: 10 });
        assert_eq!(config.raffle.interval, 300);
        assert_eq!(config.raffle.settlement_delay, 10);
        assert_eq!(config.raffle.active_raffle_id, 1);
        assert_eq!(config.chain.settlement_mode, SettlementMode::ProductionSettlement);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn env_overrides_file_values() {
        let mut config = Config::default();
        config
            .apply_env(env(&[
                ("SOLANA_RPC_URL", "https://api.devnet.solana.com"),
                ("SETTLEMENT_MODE", "test"),
                ("ACTIVE_RAFFLE_ID", "4"),
                ("SPLIT_NUMERATOR", "1"),
                ("SPLIT_DENOMINATOR", "2"),
                ("TOKEN_MINT", "  "),
            ]))
            .unwrap();
        assert_eq!(config.chain.endpoint, "https://api.devnet.solana.com");
        assert_eq!(config.chain.settlement_mode, SettlementMode::TestSettlement);
        assert_eq!(config.raffle.active_raffle_id, 4);
        assert_eq!(config.raffle.split, SplitRatio { numerator: 1, denominator: 2 });
        // blank values are ignored
        assert_eq!(config.pumpportal.token_mint, None);
    }

    #[test]
    fn devnet_endpoint_alone_does_not_switch_mode() {
        let mut config = Config::default();
        config
            .apply_env(env(&[("SOLANA_RPC_URL", "https://api.devnet.solana.com")]))
            .unwrap();
        assert_eq!(config.chain.settlement_mode, SettlementMode::ProductionSettlement);
        // but the mismatch is reported
        assert!(config.mode_mismatch().unwrap().contains("devnet"));
    }

    #[test]
    fn consistent_endpoint_and_mode_are_quiet() {
        let mut config = Config::default();
        assert_eq!(config.mode_mismatch(), None);

        config
            .apply_env(env(&[
                ("SOLANA_RPC_URL", "https://api.devnet.solana.com"),
                ("SETTLEMENT_MODE", "test"),
            ]))
            .unwrap();
        assert_eq!(config.mode_mismatch(), None);

        config.chain.endpoint = "https://api.mainnet-beta.solana.com".to_string();
        assert!(config.mode_mismatch().is_some());
    }

    #[test]
    fn bad_env_values_are_rejected() {
        let mut config = Config::default();
        assert!(config.apply_env(env(&[("RESERVE_LAMPORTS", "lots")])).is_err());
        assert!(config.apply_env(env(&[("SETTLEMENT_MODE", "staging")])).is_err());

        let mut config = Config::default();
        config.apply_env(env(&[("SPLIT_DENOMINATOR", "0")])).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config: Config = from_str(
            r#"{"chain": {"settlementMode": "test", "ownerWallet": "owner"}, "raffle": {"reserveLamports": 5}}"#,
        )
        .unwrap();
        assert_eq!(config.chain.settlement_mode, SettlementMode::TestSettlement);
        assert_eq!(config.chain.owner_wallet, "owner");
        assert_eq!(config.chain.endpoint, DEFAULT_RPC_URL);
        assert_eq!(config.raffle.reserve_lamports, 5);
        assert_eq!(config.raffle.interval, 300);
    }

    #[test]
    fn worker_keys_required() {
        let mut config = Config::default();
        assert!(config.require_worker_keys().is_err());
        config.chain.creator_secret = "secret".to_string();
        config.chain.owner_wallet = "owner".to_string();
        // present but not an address
        assert!(matches!(config.require_worker_keys(), Err(Error::Config(_))));
        config.chain.owner_wallet = " 11111111111111111111111111111111 ".to_string();
        assert!(config.require_worker_keys().is_ok());
    }
}
