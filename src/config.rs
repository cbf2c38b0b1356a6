//! Runtime configuration.
//!
//! Read once at startup from a JSON file, then adjusted by `LOTTERY_*`
//! environment variables. Every field has a default, so a partial file (or no
//! file at all) is valid.
//!
//! ```json
//! {
//!   "rpc_url": "http://localhost:8545",
//!   "gas": 4700000,
//!   "lottery_bytecode": "build/Lottery.bin",
//!   "players": [
//!     { "alias": "Alice", "address": "0xb2ed...", "password": "", "salt": 1 }
//!   ]
//! }
//! ```

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ethers::types::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::Participant;
use crate::engine::Timing;
use crate::ledger::RpcConfig;

/// Gas budget attached to every transaction.
pub const DEFAULT_GAS: u64 = 4_700_000;
/// Gas price in wei (500 gwei).
pub const DEFAULT_GAS_PRICE: u64 = 500_000_000_000;

/// Environment variable overriding [`Config::rpc_url`].
pub const ENV_RPC_URL: &str = "LOTTERY_RPC_URL";
/// Environment variable overriding [`Config::gas`].
pub const ENV_GAS: &str = "LOTTERY_GAS";
/// Environment variable overriding [`Config::gas_price`].
pub const ENV_GAS_PRICE: &str = "LOTTERY_GAS_PRICE";
/// Environment variable overriding [`Config::log_level`].
pub const ENV_LOG: &str = "LOTTERY_LOG";
/// Environment variable overriding [`Config::lottery_bytecode`].
pub const ENV_BYTECODE: &str = "LOTTERY_BYTECODE";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid configuration JSON.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv {
        /// Variable name.
        key: &'static str,
        /// Raw value.
        value: String,
    },

    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// No player at the requested index.
    #[error("no player {index} (configured: {count})")]
    UnknownPlayer {
        /// Requested index.
        index: usize,
        /// Configured players.
        count: usize,
    },
}

/// A node-managed account.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account address.
    pub address: Address,
    /// Unlock password.
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One configured participant.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    /// Display alias.
    pub alias: String,
    /// Account address.
    pub address: Address,
    /// Unlock password.
    #[serde(default)]
    pub password: String,
    /// Commitment salt.
    pub salt: u64,
}

impl PlayerConfig {
    /// Participant identity holding `secrets`, one per level.
    pub fn participant(&self, secrets: Vec<U256>) -> Participant {
        Participant::new(
            self.address,
            self.alias.clone(),
            self.password.clone(),
            U256::from(self.salt),
            secrets,
        )
    }
}

impl std::fmt::Debug for PlayerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlayerConfig")
            .field("alias", &self.alias)
            .field("address", &self.address)
            .field("password", &"<redacted>")
            .field("salt", &self.salt)
            .finish()
    }
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP endpoint of the node.
    pub rpc_url: String,
    /// Default log filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Gas budget per transaction.
    pub gas: u64,
    /// Gas price in wei.
    pub gas_price: u64,
    /// Event log polling period.
    pub log_poll_ms: u64,
    /// Account that deploys lotteries.
    pub advertiser: Account,
    /// Hex file holding the compiled lottery creation code.
    pub lottery_bytecode: Option<PathBuf>,
    /// Participant table, indexed by the `player --id` argument.
    pub players: Vec<PlayerConfig>,
    /// Engine cadences.
    pub timing: Timing,
}

fn known_address(hex: &str) -> Address {
    hex.parse().unwrap_or_default()
}

fn default_players() -> Vec<PlayerConfig> {
    [
        ("Alice", "0xb2eda2156386a938f4b008410a4dedbd1a51d5e9"),
        ("Bob", "0xe2fe120d5bbc9a5af31dd6db5a22f32a055c41ed"),
        ("Carl", "0x84df6106d39ef3c896bb37be19f9306186263f53"),
        ("Donald", "0xcc5bdc44926d40c57dda3cef4763c808d3c4470e"),
    ]
    .iter()
    .zip(1..)
    .map(|((alias, address), salt)| PlayerConfig {
        alias: alias.to_string(),
        address: known_address(address),
        password: String::new(),
        salt,
    })
    .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "http://localhost:8545".to_string(),
            log_level: "info".to_string(),
            gas: DEFAULT_GAS,
            gas_price: DEFAULT_GAS_PRICE,
            log_poll_ms: 2_000,
            advertiser: Account {
                address: known_address("0x93471f8bc99114ccf0f9c1e84349c9be390b73e8"),
                password: String::new(),
            },
            lottery_bytecode: None,
            players: default_players(),
            timing: Timing::default(),
        }
    }
}

impl Config {
    /// Load from `path`, apply environment overrides, and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_json(&raw)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Apply `LOTTERY_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&'static str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_RPC_URL) {
            self.rpc_url = url;
        }
        if let Some(gas) = parse_env(&lookup, ENV_GAS)? {
            self.gas = gas;
        }
        if let Some(price) = parse_env(&lookup, ENV_GAS_PRICE)? {
            self.gas_price = price;
        }
        if let Some(level) = lookup(ENV_LOG) {
            self.log_level = level;
        }
        if let Some(path) = lookup(ENV_BYTECODE) {
            self.lottery_bytecode = Some(PathBuf::from(path));
        }
        Ok(())
    }

    /// Reject values the engines cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gas == 0 {
            return Err(ConfigError::Invalid("gas must be positive".to_string()));
        }
        if self.log_poll_ms == 0 {
            return Err(ConfigError::Invalid("log_poll_ms must be positive".to_string()));
        }
        let mut seen = BTreeSet::new();
        for player in &self.players {
            if !seen.insert(player.address) {
                return Err(ConfigError::Invalid(format!(
                    "player {} reuses address {:?}",
                    player.alias, player.address
                )));
            }
        }
        Ok(())
    }

    /// Player at `index`.
    pub fn player(&self, index: usize) -> Result<&PlayerConfig, ConfigError> {
        self.players.get(index).ok_or(ConfigError::UnknownPlayer {
            index,
            count: self.players.len(),
        })
    }

    /// Lottery creation code read from [`Config::lottery_bytecode`].
    pub fn bytecode(&self) -> Result<Vec<u8>, ConfigError> {
        let path = self
            .lottery_bytecode
            .as_deref()
            .ok_or_else(|| ConfigError::Invalid("lottery_bytecode is not set".to_string()))?;
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let text = raw.trim();
        let text = text.strip_prefix("0x").unwrap_or(text);
        let code = hex::decode(text)
            .map_err(|e| ConfigError::Invalid(format!("{} is not hex bytecode: {}", path.display(), e)))?;
        if code.is_empty() {
            return Err(ConfigError::Invalid(format!("{} is empty", path.display())));
        }
        Ok(code)
    }

    /// Connection settings for [`crate::ledger::RpcLedger`].
    pub fn rpc_config(&self) -> RpcConfig {
        RpcConfig {
            url: self.rpc_url.clone(),
            gas_price: U256::from(self.gas_price),
            log_poll: Duration::from_millis(self.log_poll_ms),
        }
    }
}

fn parse_env<F>(lookup: &F, key: &'static str) -> Result<Option<u64>, ConfigError>
where
    F: Fn(&'static str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}
