//! # The seqmint agent
//!
//! A UDP service minting globally unique 64-bit ids. Each agent owns a
//! machine label (leased from a master pool, or pinned with `--label` for
//! single-node setups) and a durable, crash-safe sequence counter; an id
//! packs the caller's prefix, the label, the local civil hour and the next
//! sequence value into one `u64`.
//!
//! ## Running
//!
//! ```bash
//! # Single node, fixed label, no masters:
//! ./seqmint-agent --label 7
//!
//! # Fleet member leasing its label:
//! ./seqmint-agent --master_nodes 192.168.31.66:2016,192.168.31.88:2016
//! ```
//!
//! The agent listens on `0.0.0.0:6200` by default and persists its sequence
//! reservation in `.uniq.seq` next to the binary. Every flag can also come
//! from an environment variable (see `--help`); `RUST_LOG` controls the log
//! level and `SEQMINT_LOG_SCREEN=0` silences console output.
//!
//! The agent refuses to serve rather than risk a duplicate id: an expired
//! lease, a latched store after a write failure, or per-hour sequence
//! exhaustion all surface as `RESPONSE_ERROR` frames, and an unreadable
//! sequence block at startup is fatal.

use anyhow::Context;
use clap::Parser;
use seqmint::{SystemClock, WallClock};
use seqmint_agent::agent::config::{AgentConfig, CliArgs};
use seqmint_agent::agent::dispatch::Dispatcher;
use seqmint_agent::agent::lease::LeaseClient;
use seqmint_agent::agent::logging::init_logging;
use seqmint_agent::agent::store::OpenStore;
use seqmint_agent::agent::sync::{SyncShared, SyncTask};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = AgentConfig::try_from(args)?;
    init_logging();

    let socket = UdpSocket::bind(config.bind_addr.clone())
        .await
        .with_context(|| format!("binding {}:{}", config.bind_addr.0, config.bind_addr.1))?;
    tracing::info!("listening on {}", socket.local_addr()?);

    let clock = SystemClock;
    let now = clock.now_seconds();

    let open = OpenStore::open(&config.sequence_path)?;
    let mut lease = LeaseClient::new(config.masters.clone(), config.interval, config.expire);
    let (label, renewed_at) = resolve_label(&mut lease, &socket, &open, &config, now).await?;

    let shared = SyncShared::new();
    let store = open.activate(label, renewed_at, config.steps, Arc::clone(&shared))?;
    let sync = SyncTask::spawn(store.file(), shared);

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let mut dispatcher = Dispatcher::new(socket, store, lease, clock);
    dispatcher.run(shutdown).await;

    // Teardown order matters: flusher first, then (via drop) file and socket.
    sync.stop();
    tracing::info!("agent shut down");
    Ok(())
}

/// Decides which label this incarnation runs under and when it was last
/// renewed.
///
/// Local mode (no masters) pins the configured label and never expires. With
/// masters, a fresh store or an expired stored lease forces a synchronous
/// acquisition; failure there is fatal, because serving without a live label
/// could collide with whichever agent holds it now.
async fn resolve_label(
    lease: &mut LeaseClient,
    socket: &UdpSocket,
    open: &OpenStore,
    config: &AgentConfig,
    now: u64,
) -> anyhow::Result<(u8, u64)> {
    if !lease.has_masters() {
        let renewed_at = open.existing().map(|block| block.timestamp).unwrap_or(0);
        return Ok((config.label, renewed_at));
    }
    match open.existing() {
        None => {
            let label = lease
                .acquire(socket, 0, now)
                .await
                .context("initial label acquisition failed")?;
            Ok((label, now))
        }
        Some(block) if lease.label_expired(block.timestamp, now) => {
            let label = lease
                .acquire(socket, block.label as u8, now)
                .await
                .context("re-leasing the expired stored label failed")?;
            Ok((label, now))
        }
        Some(block) => Ok((block.label as u8, block.timestamp)),
    }
}

async fn shutdown_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received Ctrl+C");
        },
        () = terminate => {
            tracing::info!("received SIGTERM");
        },
    }
    shutdown.cancel();
}
