//! Multicall Cache - block-driven contract read watcher
//!
//! Run with: cargo run -- [--config watcher.toml] [--blocks 20]
//!
//! Subscribes a watch list (token balances, decimals, native balance and any
//! extra calls) to the multicall service and prints what the cache holds after
//! every new block.

use alloy_primitives::Address;
use clap::Parser;
use color_eyre::eyre::Result;
use console::style;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use multicall_cache::balances;
use multicall_cache::config::{Config, SnapshotLog};
use multicall_cache::multicall::{
    encode, BlockWatcher, Call, CallState, ListenerOptions, Multicall3Aggregator, MulticallService,
    Subscription,
};

#[derive(Parser, Debug)]
#[command(name = "multicall-cache")]
#[command(about = "Batch and cache contract reads once per block")]
struct Args {
    /// TOML config file (defaults to environment / .env)
    #[arg(short, long)]
    config: Option<String>,

    /// Stop after this many new blocks
    #[arg(short, long)]
    blocks: Option<u64>,

    /// Print the resolved configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn print_banner() {
    println!();
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!(
        "{}",
        style(" 📦 MULTICALL CACHE - Batched Contract Reads").cyan().bold()
    );
    println!(
        "{}",
        style("    One aggregate3 per block | Stale-while-revalidate").cyan()
    );
    println!(
        "{}",
        style("═══════════════════════════════════════════════════════════════").cyan()
    );
    println!();
}

fn build_token_symbols() -> HashMap<Address, &'static str> {
    let mut map = HashMap::new();

    let tokens = [
        ("0xC02aaA39b223FE8D0A0e5C4F27eAD9083C756Cc2", "WETH"),
        ("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", "USDC"),
        ("0xdAC17F958D2ee523a2206206994597C13D831ec7", "USDT"),
        ("0x6B175474E89094C44Da98b954EedeAC495271d0F", "DAI"),
        ("0x2260FAC5E5542a773Aa44fBCfeDf7C193bc2C599", "WBTC"),
        ("0x514910771AF9Ca656af840dff83E8264EcF986CA", "LINK"),
        ("0x1f9840a85d5aF5bf1D1762F925BDADdC4201F984", "UNI"),
    ];

    for (addr, symbol) in tokens {
        if let Ok(address) = addr.parse() {
            map.insert(address, symbol);
        }
    }

    map
}

fn format_token(addr: &Address, symbols: &HashMap<Address, &str>) -> String {
    if let Some(symbol) = symbols.get(addr) {
        symbol.to_string()
    } else {
        format!("0x{}...", &format!("{:?}", addr)[2..8])
    }
}

fn status_marker(state: &CallState) -> console::StyledObject<&'static str> {
    if state.error {
        style("✗ error").red()
    } else if state.is_loading {
        style("… loading").yellow()
    } else if state.is_syncing {
        style("↻ syncing").cyan()
    } else if state.result.is_some() {
        style("✓").green()
    } else {
        style("○ idle").dim()
    }
}

/// Everything the watcher keeps subscribed
struct WatchList {
    account: Option<Address>,
    tokens: Vec<Address>,
    balance_calls: Vec<Call>,
    decimals_calls: Vec<Call>,
    native_call: Option<Call>,
    extra_calls: Vec<Call>,
    _subscriptions: Vec<Subscription>,
}

impl WatchList {
    fn subscribe(config: &Config, service: &MulticallService) -> Result<Self> {
        let chain_id = config.chain_id;
        let account = config.watch_account_address()?;
        let tokens = config.watch_token_addresses();
        let mut subscriptions = Vec::new();

        let (balance_calls, decimals_calls, native_call) = match account {
            Some(account) => {
                let balance_calls = balances::token_balance_calls(account, &tokens);
                let decimals_calls = balances::token_decimals_calls(&tokens);
                let native_call = balances::native_balance_call(config.multicall_address()?, account)?;

                subscriptions.push(service.subscribe_default(chain_id, balance_calls.clone()));
                subscriptions.push(service.subscribe(
                    chain_id,
                    decimals_calls.clone(),
                    ListenerOptions::every(config.decimals_blocks_per_fetch),
                ));
                subscriptions.push(service.subscribe_default(chain_id, vec![native_call.clone()]));

                (balance_calls, decimals_calls, Some(native_call))
            }
            None => (Vec::new(), Vec::new(), None),
        };

        let mut extra_calls = Vec::new();
        for watch in &config.watch_calls {
            let call = watch.to_call()?;
            let options = ListenerOptions::every(
                watch.blocks_per_fetch.unwrap_or(config.default_blocks_per_fetch),
            );
            subscriptions.push(service.subscribe(chain_id, vec![call.clone()], options));
            extra_calls.push(call);
        }

        Ok(Self {
            account,
            tokens,
            balance_calls,
            decimals_calls,
            native_call,
            extra_calls,
            _subscriptions: subscriptions,
        })
    }

    fn all_calls(&self) -> impl Iterator<Item = &Call> {
        self.balance_calls
            .iter()
            .chain(self.decimals_calls.iter())
            .chain(self.native_call.iter())
            .chain(self.extra_calls.iter())
    }

    fn call_count(&self) -> usize {
        self.all_calls().count()
    }
}

fn print_snapshot(
    block: u64,
    chain_id: u64,
    watch: &WatchList,
    service: &MulticallService,
    symbols: &HashMap<Address, &str>,
) {
    println!(
        "{} Block {} | {} cached entries",
        style("🧱").cyan(),
        style(block).bold(),
        service.cached_entries(chain_id)
    );

    if let Some(account) = watch.account {
        let summary = balances::token_balances(service, chain_id, account, &watch.tokens);
        println!(
            "  Account {} | {}/{} token balances read{}",
            style(format!("{:?}", account)).cyan(),
            summary.balances.len(),
            watch.balance_calls.len(),
            if summary.any_loading { " (loading)" } else { "" }
        );

        if let Some(native_call) = &watch.native_call {
            let state = service.get_call_result(chain_id, native_call);
            let amount = balances::decode_amount(&state)
                .map(|wei| balances::format_amount(wei, 18))
                .unwrap_or_else(|| "-".to_string());
            println!("    {:<8} {:>28} {}", "ETH", amount, status_marker(&state));
        }

        let balance_states = service.get_call_results(chain_id, &watch.balance_calls);
        let decimals_states = service.get_call_results(chain_id, &watch.decimals_calls);

        for ((call, balance), decimals) in watch
            .balance_calls
            .iter()
            .zip(balance_states.iter())
            .zip(decimals_states.iter())
        {
            let token = call.address();
            let amount = match (balances::decode_amount(balance), balances::decode_decimals(decimals)) {
                (Some(raw), Some(decimals)) => balances::format_amount(raw, decimals),
                (Some(raw), None) => raw.to_string(),
                _ => "-".to_string(),
            };
            println!(
                "    {:<8} {:>28} {}",
                format_token(&token, symbols),
                amount,
                status_marker(balance)
            );
        }
    }

    for call in &watch.extra_calls {
        let state = service.get_call_result(chain_id, call);
        let value = state
            .result
            .as_ref()
            .map(|data| data.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {} {} {}",
            style(call).dim(),
            value,
            status_marker(&state)
        );
    }
}

fn log_snapshot(config: &Config, block: u64, watch: &WatchList, service: &MulticallService) {
    let calls: BTreeMap<String, CallState> = watch
        .all_calls()
        .filter_map(|call| {
            let key = encode(call).ok()?;
            Some((key, service.get_call_result(config.chain_id, call)))
        })
        .collect();

    let snapshot = SnapshotLog {
        timestamp: chrono::Utc::now(),
        chain_id: config.chain_id,
        block_number: block,
        calls,
    };

    if let Err(e) = snapshot.append_to_file(&config.snapshot_log_path) {
        warn!("Failed to write snapshot log: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("multicall_cache=info".parse()?),
        )
        .init();

    let args = Args::parse();

    print_banner();

    // Load configuration
    let config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        error!("Please check your .env file or --config");
        return Err(e);
    }

    config.print_summary();
    println!();

    if args.print_config {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let symbols = build_token_symbols();

    // =============================================
    // SERVICE
    // =============================================
    let aggregator = Multicall3Aggregator::new(
        config.rpc_url.clone(),
        config.chain_id,
        config.multicall_address()?,
    );
    let service = MulticallService::new(config.multicall_config(), Arc::new(aggregator));

    let watch = WatchList::subscribe(&config, &service)?;
    if watch.call_count() == 0 {
        warn!("Watch list is empty - set WATCH_ACCOUNT or add [[watch_calls]]");
    }
    info!(
        "📋 Watching {} calls across {} tokens",
        watch.call_count(),
        watch.tokens.len()
    );

    // =============================================
    // BLOCK LOOP
    // =============================================
    let watcher = BlockWatcher::new(
        config.rpc_url.clone(),
        Duration::from_millis(config.poll_interval_ms),
    );
    let (blocks, watcher_handle) = watcher.spawn()?;

    let scheduler = {
        let service = service.clone();
        let blocks = blocks.clone();
        let chain_id = config.chain_id;
        tokio::spawn(async move { service.run(chain_id, blocks).await })
    };

    let mut display = blocks;
    let mut seen = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                info!("Ctrl-C received, shutting down");
                break;
            }
            changed = display.changed() => {
                if changed.is_err() {
                    warn!("Block watcher stopped");
                    break;
                }
                let block = *display.borrow_and_update();

                // Give this block's batches a moment to land
                tokio::time::sleep(Duration::from_millis(config.poll_interval_ms / 2)).await;

                print_snapshot(block, config.chain_id, &watch, &service, &symbols);
                if config.snapshot_log {
                    log_snapshot(&config, block, &watch, &service);
                }

                seen += 1;
                if args.blocks.is_some_and(|limit| seen >= limit) {
                    info!("Reached {} blocks, stopping", seen);
                    break;
                }
            }
        }
    }

    drop(watch);
    service.teardown();
    scheduler.abort();
    watcher_handle.abort();

    println!();
    println!("{} Done", style("✓").green());
    Ok(())
}
