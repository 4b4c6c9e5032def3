//! Aleph CCN daemon
//!
//! Starts every pipeline component against the shared context and runs until
//! interrupted:
//!
//! ```bash
//! # Start with defaults
//! aleph-ccn
//!
//! # Start with a config file and a custom data directory
//! aleph-ccn --config /etc/aleph/ccn.toml --data-dir /var/lib/aleph
//!
//! # Without a P2P daemon (chain sync only)
//! aleph-ccn --no-p2p
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use aleph_ccn::chains::spawn_indexers;
use aleph_ccn::jobs::balance::BalanceReconciler;
use aleph_ccn::jobs::pending_messages::PendingMessageProcessor;
use aleph_ccn::jobs::pending_txs::PendingTxProcessor;
use aleph_ccn::p2p::{P2pClient, P2pInbound, Publisher};
use aleph_ccn::storage::gc::GarbageCollector;
use aleph_ccn::{Config, Db, IpfsClient, NodeContext, ObjectStore, StorageService};

#[derive(Parser, Debug)]
#[command(name = "aleph-ccn")]
#[command(about = "Core Channel Node for the Aleph message network")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory (database + object store)
    #[arg(long, env = "ALEPH_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// P2P daemon WebSocket URL
    #[arg(long, env = "ALEPH_P2P_DAEMON_URL")]
    p2p_daemon_url: Option<String>,

    /// Disable the P2P connection (chain + HTTP ingestion only)
    #[arg(long)]
    no_p2p: bool,

    /// IPFS daemon API URL
    #[arg(long, env = "ALEPH_IPFS_API_URL")]
    ipfs_api_url: Option<String>,

    /// Disable IPFS
    #[arg(long)]
    no_ipfs: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("aleph_ccn=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config, then apply CLI overrides
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)?
    } else {
        Config::default()
    };
    if let Some(dir) = args.data_dir {
        config.data_dir = dir;
    }
    if let Some(url) = args.p2p_daemon_url {
        config.p2p.daemon_url = url;
    }
    if args.no_p2p {
        config.p2p.enabled = false;
    }
    if let Some(url) = args.ipfs_api_url {
        config.ipfs.api_url = url;
    }
    if args.no_ipfs {
        config.ipfs.enabled = false;
    }

    info!(
        data_dir = %config.data_dir.display(),
        chains = config.chains.len(),
        "Starting aleph-ccn"
    );

    tokio::fs::create_dir_all(&config.data_dir).await?;

    // Save a default config on first start
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    // Durable state and content-addressed storage
    let db = Arc::new(Db::open(&config.data_dir)?);
    let ipfs = if config.ipfs.enabled {
        Some(IpfsClient::new(&config.ipfs.api_url, config.ipfs.timeout_secs)?)
    } else {
        info!("IPFS disabled");
        None
    };
    let storage = Arc::new(StorageService::new(
        ObjectStore::new(&config.data_dir).await?,
        ipfs,
    ));

    // P2P daemon connection
    let p2p_client = if config.p2p.enabled {
        match P2pClient::connect(&config.p2p.daemon_url).await {
            Ok(client) => Some(Arc::new(client)),
            Err(e) => {
                warn!(error = %e, "P2P daemon unreachable, continuing without it");
                None
            }
        }
    } else {
        info!("P2P disabled");
        None
    };

    let publisher = p2p_client.as_ref().map(|client| {
        Arc::new(Publisher::new(
            Arc::clone(client),
            &config.p2p.topic,
            config.p2p.publish_rate,
        ))
    });

    let ctx = Arc::new(NodeContext::new(config, db, storage, publisher));

    // Spawn the pipeline
    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut handles = spawn_indexers(&ctx, &shutdown_tx);

    {
        let processor = PendingTxProcessor::new(Arc::clone(&ctx));
        let receiver = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            processor.run(receiver).await;
        }));
    }
    {
        let processor = PendingMessageProcessor::new(Arc::clone(&ctx));
        let receiver = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            processor.run(receiver).await;
        }));
    }
    {
        let gc = GarbageCollector::new(
            Arc::clone(&ctx.db),
            Arc::clone(&ctx.storage),
            ctx.config.storage.gc_interval_secs,
        );
        let receiver = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            gc.run(receiver).await;
        }));
    }
    {
        let reconciler = BalanceReconciler::new(Arc::clone(&ctx));
        let receiver = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            reconciler.run(receiver).await;
        }));
    }
    if let Some(client) = p2p_client {
        let inbound = P2pInbound::new(Arc::clone(&ctx), client);
        let receiver = shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = inbound.run(receiver).await {
                error!(error = %e, "P2P inbound failed");
            }
        }));
    }

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await.ok();
    info!("Shutting down...");

    // Workers finish their in-flight rows; abandoned claims expire on their
    // own after the claim timeout
    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }

    if let Ok(metrics) = ctx.db.metrics() {
        info!(
            messages = metrics.messages_total,
            pending_messages = metrics.pending_messages_total,
            pending_txs = metrics.pending_txs_total,
            "Final pipeline stats"
        );
    }

    Ok(())
}
