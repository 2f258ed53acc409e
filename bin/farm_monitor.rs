//! # Farm Monitor
//!
//! Command-line monitor for a farm contract. Loads every farm, values it and
//! prints the visible list as a table.
//!
//! ## Overview
//!
//! This binary:
//! - Loads settings from `Config.toml` (or `--config`) plus `FARM_*` env overrides
//! - Wires the HTTP adapters and loads farms from the farm contract
//! - With `--once`, runs one full refresh and prints the table
//! - Otherwise starts the refresh loops and reprints after every valuation cycle
//! - Handles graceful shutdown on Ctrl+C
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin farm_monitor -- --once --filter running --filter garden
//! cargo run --bin farm_monitor -- --wallet tz1... --search kusd
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use farm_valuation_sdk::{
    adapters::http_collaborators, metrics, Estimate, Farm, FarmEngine, FilterTag, Settings,
};
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "farm_monitor", about = "Yield farm TVL / APR monitor")]
struct Args {
    /// Configuration file (defaults to ./Config.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Wallet whose stakes and pending rewards are tracked
    #[arg(long)]
    wallet: Option<String>,

    /// Refresh once, print, and exit
    #[arg(long)]
    once: bool,

    /// Filter tag (repeatable): farm, garden, flash, staked, pending, running, ended, verified, core, partner, lplocked
    #[arg(long = "filter")]
    filters: Vec<FilterTag>,

    /// Keyword matched against pool and reward token names and symbols
    #[arg(long)]
    search: Option<String>,
}

fn init_logging(settings: &Settings) {
    #[cfg(feature = "observability")]
    {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(settings.log.level.clone()));
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    }
    #[cfg(not(feature = "observability"))]
    {
        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(settings.log.level.clone()),
        )
        .init();
    }
}

fn estimate_cell(estimate: &Estimate, suffix: &str) -> String {
    match estimate {
        Estimate::Known(v) => format!("{:.2}{}", v, suffix),
        Estimate::Unknown => "?".to_string(),
    }
}

fn print_table(engine: &FarmEngine) {
    let farms: Vec<Farm> = engine.visible_farms();
    println!();
    println!(
        "{:>4}  {:<28} {:<10} {:>16} {:>10} {:>4}  {}",
        "ID".bold(),
        "POOL".bold(),
        "REWARD".bold(),
        "TVL (tez)".bold(),
        "APR".bold(),
        "x".bold(),
        "FLAGS".bold()
    );
    for farm in &farms {
        let mut flags = Vec::new();
        if farm.flags.ended {
            flags.push("ended".red().to_string());
        } else if !farm.flags.started {
            flags.push("soon".yellow().to_string());
        }
        if farm.flags.flash_farm {
            flags.push("flash".magenta().to_string());
        }
        if farm.badges.core {
            flags.push("core".cyan().to_string());
        }
        if farm.badges.verified {
            flags.push("verified".green().to_string());
        }
        if farm.status.loading {
            flags.push("loading".dimmed().to_string());
        }
        let apr = estimate_cell(&farm.apr, "%");
        let apr = match farm.apr {
            Estimate::Known(v) if v > rust_decimal::Decimal::ZERO => apr.green(),
            _ => apr.normal(),
        };
        println!(
            "{:>4}  {:<28} {:<10} {:>16} {:>10} {:>4}  {}",
            farm.id,
            farm.pool_symbol().unwrap_or("…"),
            farm.reward_symbol().unwrap_or("…"),
            estimate_cell(&farm.tvl_tez, ""),
            apr,
            farm.multiplier,
            flags.join(" ")
        );
        if farm.deposit_amount > rust_decimal::Decimal::ZERO {
            println!(
                "      ↳ staked {} · pending {}",
                farm.deposit_amount,
                format!("{:.6}", farm.rewards_earned).yellow()
            );
        }
    }
    println!(
        "{} visible / {} farms · total TVL {} tez",
        farms.len(),
        engine.farms().len(),
        format!("{:.2}", engine.total_tvl()).bold()
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    // 1. Load settings
    let mut settings = match &args.config {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Settings::new()?,
    };
    init_logging(&settings);
    if let Some(wallet) = &args.wallet {
        settings.wallet = Some(wallet.clone());
    }
    println!("🚀 Starting Farm Monitor");
    println!("═══════════════════════════════════════════════════════════════════\n");
    println!("✅ Settings loaded (farm contract {})", settings.contracts.farm);

    #[cfg(feature = "observability")]
    {
        metrics::install_prometheus(&settings.metrics.listen)?;
        println!("✅ Prometheus exporter on {}", settings.metrics.listen);
    }
    metrics::describe_metrics();

    // 2. Wire adapters and engine
    let collaborators = http_collaborators(&settings)?;
    let valuation_period = Duration::from_secs(if settings.wallet.is_some() {
        settings.refresh.valuation_connected_secs
    } else {
        settings.refresh.valuation_disconnected_secs
    });
    let engine = FarmEngine::new(settings, collaborators)?;
    engine.set_filters(args.filters.iter().copied(), args.search.as_deref());
    println!("✅ Engine created");

    // 3. Load farms
    let count = engine.load_farms().await?;
    println!("✅ {} farms loaded", count);

    if args.once {
        if let Err(e) = engine.refresh_all().await {
            eprintln!("⚠️ Refresh finished with errors: {}", e);
        }
        print_table(&engine);
        return Ok(());
    }

    // 4. Run the loops until Ctrl+C
    engine.start().await;
    println!("✅ Refresh loops started. Press Ctrl+C to stop.\n");

    let mut ticker = tokio::time::interval(valuation_period);
    loop {
        tokio::select! {
            _ = ticker.tick() => print_table(&engine),
            _ = signal::ctrl_c() => {
                println!("\n🛑 Shutdown signal received, stopping loops...");
                break;
            }
        }
    }
    engine.stop().await;
    println!("✅ Farm Monitor stopped");
    Ok(())
}
