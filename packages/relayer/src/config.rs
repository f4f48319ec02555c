use alloy::primitives::Address;
use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::consensus::RelayConfig;
use crate::retry::RetryConfig;
use crate::source::SourceNetwork;
use crate::transport::TransportConfig;

/// Main configuration for the relayer
#[derive(Debug, Clone)]
pub struct Config {
    pub hub: HubConfig,
    pub source: SourceConfig,
    /// Header cache and cursors go to memory when unset
    pub database: Option<DatabaseConfig>,
    pub relayer: RelayerConfig,
    pub api: ApiConfig,
    pub roles: Roles,
}

/// Hub chain configuration
#[derive(Clone)]
pub struct HubConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub private_key: String,
    pub relay_address: String,
    pub transport_address: Option<String>,
    /// Multichain manager the transport contract must be registered with
    pub manager_address: Option<String>,
}

/// Custom Debug that redacts private_key to prevent accidental log leakage.
impl fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubConfig")
            .field("rpc_url", &self.rpc_url)
            .field("chain_id", &self.chain_id)
            .field("private_key", &"<redacted>")
            .field("relay_address", &self.relay_address)
            .field("transport_address", &self.transport_address)
            .field("manager_address", &self.manager_address)
            .finish()
    }
}

/// Source chain node configuration
#[derive(Clone)]
pub struct SourceConfig {
    pub rpc_url: String,
    pub rpc_user: Option<String>,
    pub rpc_password: Option<String>,
    pub network: SourceNetwork,
    /// Wait between confirmation polls
    pub poll_interval_ms: u64,
}

impl fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceConfig")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_password", &self.rpc_password.as_ref().map(|_| "<redacted>"))
            .field("network", &self.network)
            .field("poll_interval_ms", &self.poll_interval_ms)
            .finish()
    }
}

/// Database configuration
#[derive(Clone)]
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

/// Engine timing and limits
#[derive(Debug, Clone)]
pub struct RelayerConfig {
    pub poll_interval_ms: u64,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub no_new_block_delay_ms: u64,
    pub task_poll_interval_ms: u64,
    pub task_timeout_secs: u64,
    pub confirmation_depth: u64,
    pub max_task_workers: usize,
    pub max_proof_attempts: u32,
    pub history_path: PathBuf,
}

/// Status server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub bind_address: String,
    pub port: u16,
}

/// Engines this process runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Roles {
    pub relay: bool,
    pub transport: bool,
}

impl Roles {
    /// Parse a comma separated role list such as `relay,transport`
    pub fn parse(value: &str) -> Result<Self> {
        let mut roles = Roles {
            relay: false,
            transport: false,
        };
        for role in value.split(',').map(str::trim).filter(|r| !r.is_empty()) {
            match role.to_lowercase().as_str() {
                "relay" => roles.relay = true,
                "transport" => roles.transport = true,
                other => return Err(eyre!("Unknown relayer role: {}", other)),
            }
        }
        if !roles.relay && !roles.transport {
            return Err(eyre!("RELAYER_ROLES must name at least one role"));
        }
        Ok(roles)
    }
}

/// Default functions
fn default_hub_chain_id() -> u64 {
    31337
}

fn default_poll_interval() -> u64 {
    1000
}

fn default_retry_delay() -> u64 {
    5000
}

fn default_max_retry_delay() -> u64 {
    60_000
}

fn default_no_new_block_delay() -> u64 {
    30_000
}

fn default_task_poll_interval() -> u64 {
    60_000
}

fn default_source_poll_interval() -> u64 {
    300_000
}

fn default_task_timeout() -> u64 {
    7200
}

fn default_confirmation_depth() -> u64 {
    6
}

fn default_max_task_workers() -> usize {
    16
}

fn default_max_proof_attempts() -> u32 {
    3
}

fn default_history_path() -> String {
    "./transport_history.json".to_string()
}

fn default_roles() -> String {
    "relay,transport".to_string()
}

fn default_api_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    9090
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| eyre!("{} environment variable is required", name))
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
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

    fn load_from_env() -> Result<Self> {
        let hub = HubConfig {
            rpc_url: required("HUB_RPC_URL")?,
            chain_id: match env::var("HUB_CHAIN_ID") {
                Ok(v) => v.parse().wrap_err("HUB_CHAIN_ID must be a valid u64")?,
                Err(_) => default_hub_chain_id(),
            },
            private_key: required("HUB_PRIVATE_KEY")?,
            relay_address: required("RELAY_CONTRACT_ADDRESS")?,
            transport_address: env::var("TRANSPORT_CONTRACT_ADDRESS").ok(),
            manager_address: env::var("MANAGER_CONTRACT_ADDRESS").ok(),
        };

        let network = match env::var("SOURCE_NETWORK") {
            Ok(v) => v.parse().map_err(|e: String| eyre!(e))?,
            Err(_) => SourceNetwork::Mainnet,
        };
        let source = SourceConfig {
            rpc_url: required("SOURCE_RPC_URL")?,
            rpc_user: env::var("SOURCE_RPC_USER").ok(),
            rpc_password: env::var("SOURCE_RPC_PASSWORD").ok(),
            network,
            poll_interval_ms: parsed_or("SOURCE_POLL_INTERVAL_MS", default_source_poll_interval()),
        };

        let database = env::var("DATABASE_URL")
            .ok()
            .filter(|url| !url.is_empty())
            .map(|url| DatabaseConfig { url });

        let relayer = RelayerConfig {
            poll_interval_ms: parsed_or("POLL_INTERVAL_MS", default_poll_interval()),
            retry_delay_ms: parsed_or("RETRY_DELAY_MS", default_retry_delay()),
            max_retry_delay_ms: parsed_or("MAX_RETRY_DELAY_MS", default_max_retry_delay()),
            no_new_block_delay_ms: parsed_or("NO_NEW_BLOCK_DELAY_MS", default_no_new_block_delay()),
            task_poll_interval_ms: parsed_or("TASK_POLL_INTERVAL_MS", default_task_poll_interval()),
            task_timeout_secs: parsed_or("TASK_TIMEOUT_SECS", default_task_timeout()),
            confirmation_depth: parsed_or("CONFIRMATION_DEPTH", default_confirmation_depth()),
            max_task_workers: parsed_or("MAX_TASK_WORKERS", default_max_task_workers()),
            max_proof_attempts: parsed_or("MAX_PROOF_ATTEMPTS", default_max_proof_attempts()),
            history_path: PathBuf::from(
                env::var("TASK_HISTORY_PATH").unwrap_or_else(|_| default_history_path()),
            ),
        };

        let api = ApiConfig {
            bind_address: env::var("API_BIND_ADDRESS").unwrap_or_else(|_| default_api_bind_address()),
            port: parsed_or("API_PORT", default_api_port()),
        };

        let roles = Roles::parse(&env::var("RELAYER_ROLES").unwrap_or_else(|_| default_roles()))?;

        let config = Config {
            hub,
            source,
            database,
            relayer,
            api,
            roles,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.hub.rpc_url.is_empty() {
            return Err(eyre!("hub.rpc_url cannot be empty"));
        }

        if !is_address(&self.hub.relay_address) {
            return Err(eyre!(
                "hub.relay_address must be a valid hex address (42 chars with 0x prefix)"
            ));
        }

        if self.hub.private_key.len() != 66 || !self.hub.private_key.starts_with("0x") {
            return Err(eyre!("hub.private_key must be 66 chars (0x + 64 hex chars)"));
        }

        match &self.hub.transport_address {
            Some(addr) if !is_address(addr) => {
                return Err(eyre!(
                    "hub.transport_address must be a valid hex address (42 chars with 0x prefix)"
                ));
            }
            None if self.roles.transport => {
                return Err(eyre!(
                    "TRANSPORT_CONTRACT_ADDRESS is required when the transport role is enabled"
                ));
            }
            _ => {}
        }

        if let Some(addr) = &self.hub.manager_address {
            if !is_address(addr) {
                return Err(eyre!(
                    "hub.manager_address must be a valid hex address (42 chars with 0x prefix)"
                ));
            }
        }

        if self.source.rpc_url.is_empty() {
            return Err(eyre!("source.rpc_url cannot be empty"));
        }

        if self.relayer.max_task_workers == 0 {
            return Err(eyre!("relayer.max_task_workers must be at least 1"));
        }

        if self.relayer.max_proof_attempts == 0 {
            return Err(eyre!("relayer.max_proof_attempts must be at least 1"));
        }

        self.api_addr()?;
        Ok(())
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api.bind_address, self.api.port)
            .parse()
            .wrap_err("API_BIND_ADDRESS and API_PORT must form a socket address")
    }

    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(self.relayer.poll_interval_ms),
            retry_delay: Duration::from_millis(self.relayer.retry_delay_ms),
            max_retry_delay: Duration::from_millis(self.relayer.max_retry_delay_ms),
            no_new_block_delay: Duration::from_millis(self.relayer.no_new_block_delay_ms),
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            task_timeout: Duration::from_secs(self.relayer.task_timeout_secs),
            confirmation_depth: self.relayer.confirmation_depth,
            task_poll_interval: Duration::from_millis(self.relayer.task_poll_interval_ms),
            retry: RetryConfig::exponential(
                Duration::from_millis(self.relayer.retry_delay_ms),
                Duration::from_millis(self.relayer.max_retry_delay_ms),
                5,
            ),
            max_workers: self.relayer.max_task_workers,
            max_proof_attempts: self.relayer.max_proof_attempts,
            manager_contract: self
                .hub
                .manager_address
                .as_deref()
                .and_then(|a| Address::from_str(a).ok()),
        }
    }
}

fn is_address(value: &str) -> bool {
    value.len() == 42
        && value.starts_with("0x")
        && value[2..].chars().all(|c| c.is_ascii_hexdigit())
}
