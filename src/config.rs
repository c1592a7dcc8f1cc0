//! Configuration for the multicall watcher
//!
//! Values come from environment variables (with `.env` support) or a TOML
//! file. Batch size and cadence are policy tied to the aggregator contract in
//! use, so they live here instead of being hard-coded.

use alloy_primitives::Address;
use eyre::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::multicall::{is_valid_address, Call, MulticallConfig, MULTICALL3};

// ============================================
// WATCHED CALLS
// ============================================

/// An arbitrary read to keep fresh, declared in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchCall {
    /// Contract address
    pub address: String,

    /// Canonical signature, e.g. `totalSupply()`
    pub method: String,

    /// ABI words as decimal or `0x` hex strings
    #[serde(default)]
    pub args: Vec<String>,

    /// Refresh cadence in blocks (defaults to the global cadence)
    #[serde(default)]
    pub blocks_per_fetch: Option<u64>,
}

impl WatchCall {
    pub fn to_call(&self) -> Result<Call> {
        let args = self
            .args
            .iter()
            .map(|arg| {
                alloy_primitives::U256::from_str(arg)
                    .map_err(|e| eyre::eyre!("Invalid argument {:?} for {}: {}", arg, self.method, e))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Call::new(&self.address, self.method.clone(), args)?)
    }
}

// ============================================
// MAIN CONFIGURATION
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // ========== Network Settings ==========
    /// JSON-RPC endpoint
    pub rpc_url: String,

    /// Chain ID (1 = Ethereum Mainnet)
    pub chain_id: u64,

    /// Multicall3 deployment used as the aggregator
    pub multicall_address: String,

    /// How often to poll for a new block height
    pub poll_interval_ms: u64,

    // ========== Scheduler Settings ==========
    /// Maximum calls per aggregated request
    pub max_batch_size: usize,

    /// Default refresh cadence in blocks
    pub default_blocks_per_fetch: u64,

    /// Refresh cadence for token `decimals()` reads
    #[serde(default = "default_decimals_blocks_per_fetch")]
    pub decimals_blocks_per_fetch: u64,

    /// Evict unused cache entries every N blocks (0 disables)
    pub sweep_interval_blocks: u64,

    // ========== Watch List ==========
    /// Account whose balances are tracked
    pub watch_account: Option<String>,

    /// ERC-20 tokens to track for `watch_account`
    pub watch_tokens: Vec<String>,

    /// Extra reads to keep fresh
    #[serde(default)]
    pub watch_calls: Vec<WatchCall>,

    // ========== Output ==========
    /// Append a JSON snapshot per block
    pub snapshot_log: bool,

    /// Where snapshots go
    pub snapshot_log_path: String,
}

impl Config {
    /// Load configuration from environment variables and .env file
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            // Network
            rpc_url: env::var("RPC_URL").unwrap_or(defaults.rpc_url),
            chain_id: env::var("CHAIN_ID")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            multicall_address: env::var("MULTICALL_ADDRESS").unwrap_or(defaults.multicall_address),
            poll_interval_ms: env::var("POLL_INTERVAL_MS")
                .unwrap_or_else(|_| "4000".to_string())
                .parse()
                .unwrap_or(4000),

            // Scheduler
            max_batch_size: env::var("MAX_BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .unwrap_or(100),
            default_blocks_per_fetch: env::var("BLOCKS_PER_FETCH")
                .unwrap_or_else(|_| "1".to_string())
                .parse()
                .unwrap_or(1),
            decimals_blocks_per_fetch: env::var("DECIMALS_BLOCKS_PER_FETCH")
                .unwrap_or_else(|_| "1000".to_string())
                .parse()
                .unwrap_or(1000),
            sweep_interval_blocks: env::var("SWEEP_INTERVAL_BLOCKS")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .unwrap_or(25),

            // Watch list
            watch_account: env::var("WATCH_ACCOUNT").ok(),
            watch_tokens: env::var("WATCH_TOKENS")
                .map(|s| {
                    s.split(',')
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or(defaults.watch_tokens),
            watch_calls: Vec::new(),

            // Output
            snapshot_log: env::var("SNAPSHOT_LOG")
                .unwrap_or_else(|_| "false".to_string())
                .parse()
                .unwrap_or(false),
            snapshot_log_path: env::var("SNAPSHOT_LOG_PATH").unwrap_or(defaults.snapshot_log_path),
        })
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Default watched tokens (high liquidity)
    fn default_watch_tokens() -> Vec<String> {
        vec![
            "0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2".to_string(), // WETH
            "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48".to_string(), // USDC
            "0xdAC17F958D2ee523a2206206994597C13D831ec7".to_string(), // USDT
            "0x6B175474E89094C44Da98b954EedeAC495271d0F".to_string(), // DAI
        ]
    }

    /// Validate configuration before starting
    pub fn validate(&self) -> Result<()> {
        if self.rpc_url.is_empty() || self.rpc_url.contains("YOUR_API_KEY") {
            return Err(eyre::eyre!("Invalid RPC_URL - please set a valid JSON-RPC endpoint"));
        }

        if !is_valid_address(&self.multicall_address) {
            return Err(eyre::eyre!(
                "Invalid MULTICALL_ADDRESS: {}",
                self.multicall_address
            ));
        }

        if self.max_batch_size == 0 {
            return Err(eyre::eyre!("MAX_BATCH_SIZE must be at least 1"));
        }
        if self.default_blocks_per_fetch == 0 {
            return Err(eyre::eyre!("BLOCKS_PER_FETCH must be at least 1"));
        }
        if self.decimals_blocks_per_fetch == 0 {
            return Err(eyre::eyre!("DECIMALS_BLOCKS_PER_FETCH must be at least 1"));
        }
        if self.poll_interval_ms < 100 {
            return Err(eyre::eyre!(
                "POLL_INTERVAL_MS below 100ms will hammer the RPC (currently {})",
                self.poll_interval_ms
            ));
        }

        if let Some(account) = &self.watch_account {
            if !is_valid_address(account) {
                return Err(eyre::eyre!("Invalid WATCH_ACCOUNT: {}", account));
            }
        }
        for token in &self.watch_tokens {
            if !is_valid_address(token) {
                return Err(eyre::eyre!("Invalid token address in WATCH_TOKENS: {}", token));
            }
        }
        for watch in &self.watch_calls {
            watch.to_call()?;
        }

        Ok(())
    }

    /// Scheduler settings for the multicall service
    pub fn multicall_config(&self) -> MulticallConfig {
        MulticallConfig {
            max_batch_size: self.max_batch_size,
            default_blocks_per_fetch: self.default_blocks_per_fetch,
            sweep_interval_blocks: self.sweep_interval_blocks,
        }
    }

    pub fn multicall_address(&self) -> Result<Address> {
        Ok(Address::from_str(&self.multicall_address)?)
    }

    pub fn watch_account_address(&self) -> Result<Option<Address>> {
        self.watch_account
            .as_deref()
            .map(Address::from_str)
            .transpose()
            .map_err(Into::into)
    }

    pub fn watch_token_addresses(&self) -> Vec<Address> {
        self.watch_tokens
            .iter()
            .filter_map(|s| Address::from_str(s).ok())
            .collect()
    }

    /// Print configuration summary
    pub fn print_summary(&self) {
        let rpc_display = truncate_display(&self.rpc_url, 40);

        println!("╔════════════════════════════════════════════════════════════╗");
        println!("║              MULTICALL CACHE - CONFIGURATION               ║");
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ RPC:               {:^40} ║", rpc_display);
        println!("║ Chain ID:          {:^40} ║", self.chain_id);
        println!("║ Poll Interval:     {:>37} ms ║", self.poll_interval_ms);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ SCHEDULER                                                  ║");
        println!("║ • Max Batch Size:  {:^40} ║", self.max_batch_size);
        println!("║ • Blocks/Fetch:    {:^40} ║", self.default_blocks_per_fetch);
        println!("║ • Decimals Every:  {:>33} blocks ║", self.decimals_blocks_per_fetch);
        println!("║ • Sweep Every:     {:>33} blocks ║", self.sweep_interval_blocks);
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║ WATCH LIST                                                 ║");
        println!("║ • Account:         {:^40} ║",
            if self.watch_account.is_some() { "✓ Configured" } else { "✗ Not Set" }
        );
        println!("║ • Tokens:          {:^40} ║", self.watch_tokens.len());
        println!("║ • Extra Calls:     {:^40} ║", self.watch_calls.len());
        println!("║ • Snapshot Log:    {:^40} ║",
            if self.snapshot_log { "✓ Enabled" } else { "✗ Disabled" }
        );
        println!("╚════════════════════════════════════════════════════════════╝");
    }
}

fn default_decimals_blocks_per_fetch() -> u64 {
    1000
}

/// Shorten `s` to at most `max` characters for the summary box
fn truncate_display(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            rpc_url: "https://eth.llamarpc.com".to_string(),
            chain_id: 1,
            multicall_address: MULTICALL3.to_checksum(None),
            poll_interval_ms: 4000,
            max_batch_size: 100,
            default_blocks_per_fetch: 1,
            decimals_blocks_per_fetch: default_decimals_blocks_per_fetch(),
            sweep_interval_blocks: 25,
            watch_account: None,
            watch_tokens: Self::default_watch_tokens(),
            watch_calls: Vec::new(),
            snapshot_log: false,
            snapshot_log_path: "./logs/snapshots.jsonl".to_string(),
        }
    }
}

// ============================================
// SNAPSHOT LOGGER
// ============================================

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::io::Write;

use crate::multicall::CallState;

/// Cache contents for the watched calls at one block
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotLog {
    pub timestamp: DateTime<Utc>,
    pub chain_id: u64,
    pub block_number: u64,
    /// Call key -> state
    pub calls: BTreeMap<String, CallState>,
}

impl SnapshotLog {
    /// Append this snapshot to a file
    pub fn append_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        // Create parent directories if needed
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;

        let json = serde_json::to_string(self)?;
        writeln!(file, "{}", json)?;

        Ok(())
    }
}

// ============================================
// TESTS
// ============================================
