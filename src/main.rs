use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use dotenv::dotenv;
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bitcoin_pg_explorer::bridge::{ws, BlockFeed, NotificationBridge, PgNotifications};
use bitcoin_pg_explorer::explorer::Explorer;
use bitcoin_pg_explorer::ingest;
use bitcoin_pg_explorer::storage::memory::MemoryStorage;
use bitcoin_pg_explorer::storage::postgres::PgStorage;
use bitcoin_pg_explorer::storage::Storage;
use bitcoin_pg_explorer::{Config, Context};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create tables, indexes and notification triggers.
    Schema,
    /// Load blk*.dat files into the database.
    Ingest {
        /// Directory with blk*.dat files; defaults to BLOCKS_PATH.
        #[arg(long)]
        blocks_path: Option<PathBuf>,
        /// Decode and resolve everything but keep it in memory.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Stream chain and database events to WebSocket subscribers.
    Bridge,
    /// Print a block with its transactions.
    Block { hash: String },
    /// Print an address with its transactions.
    Address { hash: String },
    /// Print the most recent blocks.
    Latest {
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let ctx = Context::new(Config::from_env()?);

    match cli.command {
        Command::Schema => {
            let storage = PgStorage::connect(&ctx.config).await?;
            storage.setup_database().await?;
        }
        Command::Ingest { blocks_path, dry_run } => {
            let dir = blocks_path
                .or_else(|| ctx.config.blocks_path.clone())
                .ok_or("BLOCKS_PATH must be set in .env file or passed with --blocks-path")?;
            let storage: Arc<dyn Storage> = if dry_run {
                Arc::new(MemoryStorage::new())
            } else {
                let storage = PgStorage::connect(&ctx.config).await?;
                storage.setup_database().await?;
                Arc::new(storage)
            };
            let summary = ingest::run(storage, ctx.clone(), &dir).await?;
            println!(
                "All blocks processed: {} stored, {} duplicates, {} failed, {} orphaned.",
                summary.stored, summary.duplicates, summary.failed, summary.orphaned
            );
        }
        Command::Bridge => run_bridge(ctx).await?,
        Command::Block { hash } => {
            let explorer = Explorer::new(Arc::new(PgStorage::connect(&ctx.config).await?), ctx.clone());
            print_json(&explorer.block_by_hash(&hash).await?)?;
        }
        Command::Address { hash } => {
            let explorer = Explorer::new(Arc::new(PgStorage::connect(&ctx.config).await?), ctx.clone());
            print_json(&explorer.address_by_hash(&hash).await?)?;
        }
        Command::Latest { limit } => {
            let explorer = Explorer::new(Arc::new(PgStorage::connect(&ctx.config).await?), ctx.clone());
            print_json(&explorer.latest_blocks(limit).await?)?;
        }
    }
    Ok(())
}

async fn run_bridge(ctx: Arc<Context>) -> Result<(), Box<dyn std::error::Error>> {
    let bridge = NotificationBridge::new(ctx.clone());

    let notifications = PgNotifications::listen(&ctx.config.database_url, &ctx.config.notify_channels).await?;
    bridge.spawn_source(notifications);
    match &ctx.config.chain_feed_addr {
        Some(addr) => bridge.spawn_source(BlockFeed::connect(addr).await?),
        None => info!("CHAIN_FEED_ADDR not set, serving database notifications only"),
    }

    let on_ctrl_c = bridge.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            return;
        }
        info!("ctrl-c received");
        on_ctrl_c.shutdown().await;
    });

    ws::serve(bridge.clone(), ctx.config.bridge_addr).await?;
    bridge.shutdown().await;
    bridge.join().await;
    Ok(())
}
