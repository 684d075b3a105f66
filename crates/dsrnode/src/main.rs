use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use dsrnode::{logging, scenario, Config};

/// DSR routing simulator
#[derive(Parser, Debug)]
#[command(name = "dsrnode", version, about)]
struct Args {
    /// Path to the scenario configuration file
    #[arg(short, long, env = "DSRNODE_CONFIG")]
    config: Option<PathBuf>,

    /// Write a default configuration and exit
    #[arg(long)]
    init: bool,

    /// Log level, overriding the configuration file
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.init {
        let config = Config::create_default(args.config)?;
        println!(
            "Created default configuration at {}",
            config.config_path().display()
        );
        return Ok(());
    }

    let config = Config::load(args.config)?;
    let level = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    logging::init(&level);

    info!("Loaded configuration from {}", config.config_path().display());

    let shutdown = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };
    let report = scenario::run_until(&config, shutdown).await?;

    println!("sent:      {}", report.sent);
    println!("delivered: {}", report.delivered.len());
    println!("failed:    {}", report.failed.len());
    println!("ratio:     {:.3}", report.delivery_ratio());
    println!("elapsed:   {:.1}s", report.elapsed.as_secs_f64());
    println!();
    println!(
        "{:<15} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
        "node", "sent", "deliv", "fwd", "drop", "rreq", "rrep", "rerr", "salv"
    );
    for (address, stats) in &report.stats {
        println!(
            "{:<15} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6} {:>6}",
            address.to_string(),
            stats.data_sent,
            stats.data_delivered,
            stats.data_forwarded,
            stats.data_dropped,
            stats.rreq_sent,
            stats.rrep_sent,
            stats.rerr_sent,
            stats.salvaged
        );
    }

    Ok(())
}
