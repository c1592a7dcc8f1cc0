//! Diagnostic tool - Check watcher configuration
//!
//! Run with: cargo run --bin diagnose

use multicall_cache::config::Config;
use std::env;

fn main() {
    println!("🔍 MULTICALL CACHE DIAGNOSTIC CHECK\n");

    // Load .env
    dotenvy::dotenv().ok();

    println!("═══════════════════════════════════════════════════");
    println!("                  CONFIGURATION                     ");
    println!("═══════════════════════════════════════════════════\n");

    // Key settings
    let checks = [
        ("CHAIN_ID", "1", "Chain the watcher reads from"),
        (
            "MULTICALL_ADDRESS",
            "0xcA11bde05977b3631167028862bE2a173976CA11",
            "Multicall3 deployment",
        ),
        ("POLL_INTERVAL_MS", "4000", "Milliseconds between block polls"),
        ("MAX_BATCH_SIZE", "100", "Calls per aggregate3 request"),
        ("BLOCKS_PER_FETCH", "1", "Default refresh cadence in blocks"),
        ("DECIMALS_BLOCKS_PER_FETCH", "1000", "Cadence for token decimals() reads"),
        ("SWEEP_INTERVAL_BLOCKS", "25", "Blocks between cache sweeps"),
        ("SNAPSHOT_LOG", "false", "Append JSON snapshots?"),
    ];

    for (key, default, desc) in checks {
        let value = env::var(key).unwrap_or_else(|_| default.to_string());
        let is_default = env::var(key).is_err();
        let marker = if is_default { "(default)" } else { "(from .env)" };
        println!("  {}: {} {}", key, value, marker);
        println!("    └─ {}\n", desc);
    }

    // RPC check
    let rpc = env::var("RPC_URL").unwrap_or_else(|_| "NOT SET".to_string());
    let chars: Vec<char> = rpc.chars().collect();
    let rpc_display = if chars.len() > 50 {
        let head: String = chars[..30].iter().collect();
        let tail: String = chars[chars.len() - 15..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        rpc.clone()
    };
    println!("  RPC_URL: {}", rpc_display);

    println!("\n═══════════════════════════════════════════════════");
    println!("                    WATCH LIST                      ");
    println!("═══════════════════════════════════════════════════\n");

    let account = env::var("WATCH_ACCOUNT").ok();
    println!(
        "  WATCH_ACCOUNT: {}",
        match &account {
            Some(a) => format!("✅ {}", a),
            None => "❌ Not set (no balances will be tracked)".to_string(),
        }
    );

    let tokens: Vec<String> = env::var("WATCH_TOKENS")
        .map(|s| {
            s.split(',')
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if tokens.is_empty() {
        println!("  WATCH_TOKENS:  (default: WETH, USDC, USDT, DAI)");
    } else {
        println!("  WATCH_TOKENS:  {} tokens", tokens.len());
        for token in &tokens {
            let looks_ok = token.len() == 42 && token.starts_with("0x");
            println!("    {} {}", if looks_ok { "•" } else { "⚠️" }, token);
        }
    }

    println!("\n═══════════════════════════════════════════════════");
    println!("                  WHAT TO EXPECT                    ");
    println!("═══════════════════════════════════════════════════\n");

    let per_fetch: u64 = env::var("BLOCKS_PER_FETCH")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1);
    let batch: usize = env::var("MAX_BATCH_SIZE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()
        .unwrap_or(100);

    // balanceOf + decimals per token, plus the native balance
    let token_count = if tokens.is_empty() { 4 } else { tokens.len() };
    let calls = if account.is_some() { token_count * 2 + 1 } else { 0 };
    let requests = if batch == 0 { 0 } else { calls.div_ceil(batch) };

    println!("  {} watched calls", calls);
    println!("  • First block: {} aggregate3 request(s)", requests);
    println!("  • Balances refresh every {} block(s)", per_fetch.max(1));
    let decimals_every: u64 = env::var("DECIMALS_BLOCKS_PER_FETCH")
        .unwrap_or_else(|_| "1000".to_string())
        .parse()
        .unwrap_or(1000);
    println!("  • Decimals refresh every {} block(s)", decimals_every);

    println!("\n═══════════════════════════════════════════════════");
    println!("                    VALIDATION                      ");
    println!("═══════════════════════════════════════════════════\n");

    match Config::from_env().and_then(|config| config.validate()) {
        Ok(()) => println!("  ✅ Configuration is valid"),
        Err(e) => println!("  ❌ {}", e),
    }

    println!("\n✅ Diagnostic complete!\n");
}
