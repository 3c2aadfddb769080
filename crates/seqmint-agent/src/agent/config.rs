use anyhow::{Context, bail};
use clap::Parser;
use seqmint::LABEL_MAX;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

/// Name of the sequence file, created next to the agent binary.
pub const SEQUENCE_FILE_NAME: &str = ".uniq.seq";

/// Runtime configuration for the `seqmint-agent` binary.
///
/// All values are parsed from CLI arguments or environment variables. The
/// flag names are kept stable for operational compatibility with existing
/// deployments.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "seqmint-agent",
    version,
    about = "A UDP service minting unique 64-bit ids from a leased machine label"
)]
pub struct CliArgs {
    /// Comma-separated master endpoints, e.g.
    /// "192.168.31.66:2016,192.168.31.88:2016". Required unless --label is
    /// set; with masters configured the agent leases and renews its label.
    ///
    /// Environment variable: `SEQMINT_MASTER_NODES`
    #[arg(long = "master_nodes", env = "SEQMINT_MASTER_NODES", default_value = "")]
    pub master_nodes: String,

    /// Listen IP.
    ///
    /// Environment variable: `SEQMINT_IP`
    #[arg(long, env = "SEQMINT_IP", default_value = "0.0.0.0")]
    pub ip: String,

    /// Listen port, 1000..=65535.
    ///
    /// Environment variable: `SEQMINT_PORT`
    #[arg(long, env = "SEQMINT_PORT", default_value_t = 6200)]
    pub port: u16,

    /// Fixed machine label, 1..=254. Mutually exclusive with leasing: when
    /// set and no masters are given, the agent runs in local mode and the
    /// lease never expires.
    ///
    /// Environment variable: `SEQMINT_LABEL`
    #[arg(long, env = "SEQMINT_LABEL", default_value_t = 0)]
    pub label: u8,

    /// Reservation-ahead size: how far the persisted sequence ceiling runs
    /// ahead of issuance. Must be at least as large as any batch a client
    /// may request.
    ///
    /// Environment variable: `SEQMINT_STEPS`
    #[arg(long, env = "SEQMINT_STEPS", default_value_t = 100_000)]
    pub steps: u32,

    /// Label expiry in seconds. Every node in the fleet, masters included,
    /// must agree on this value. Must be at least twice the renewal
    /// interval and exceed it by at least 10 seconds.
    ///
    /// Environment variable: `SEQMINT_EXPIRE`
    #[arg(long, env = "SEQMINT_EXPIRE", default_value_t = 3600)]
    pub expire: u64,

    /// Seconds between label renewal requests to a master.
    ///
    /// Environment variable: `SEQMINT_INTERVAL`
    #[arg(long, env = "SEQMINT_INTERVAL", default_value_t = 600)]
    pub interval: u64,
}

/// Validated agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub bind_addr: (String, u16),
    pub masters: Vec<SocketAddr>,
    pub label: u8,
    pub steps: u32,
    pub expire: u64,
    pub interval: u64,
    pub sequence_path: PathBuf,
}

impl TryFrom<CliArgs> for AgentConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if !(1000..=65535).contains(&args.port) {
            bail!("--port must be in 1000..=65535, got {}", args.port);
        }
        if args.label > LABEL_MAX {
            bail!("--label must be in 0..={LABEL_MAX}, got {}", args.label);
        }
        if !(1..=100_000_000).contains(&args.steps) {
            bail!("--steps must be in 1..=100000000, got {}", args.steps);
        }
        if !(1..=7200).contains(&args.interval) {
            bail!("--interval must be in 1..=7200, got {}", args.interval);
        }
        if args.expire < 10 {
            bail!("--expire must be at least 10 seconds, got {}", args.expire);
        }
        if args.expire < args.interval * 2 || args.expire < args.interval + 10 {
            // The agent needs room for at least one missed renewal to be
            // retried before the master considers the lease dead.
            bail!(
                "--expire ({}) must be at least double --interval ({}) and exceed it by 10",
                args.expire,
                args.interval
            );
        }

        let masters = parse_master_nodes(&args.master_nodes)?;
        if masters.is_empty() && args.label == 0 {
            bail!("either --master_nodes or a nonzero --label must be given");
        }

        Ok(Self {
            bind_addr: (args.ip, args.port),
            masters,
            label: args.label,
            steps: args.steps,
            expire: args.expire,
            interval: args.interval,
            sequence_path: sequence_path()?,
        })
    }
}

fn parse_master_nodes(nodes: &str) -> anyhow::Result<Vec<SocketAddr>> {
    let mut masters = Vec::new();
    for node in nodes.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let addr = node
            .to_socket_addrs()
            .with_context(|| format!("--master_nodes entry {node:?} does not resolve"))?
            .next()
            .with_context(|| format!("--master_nodes entry {node:?} has no address"))?;
        if addr.port() < 1000 {
            bail!("--master_nodes entry {node:?} uses a reserved port");
        }
        masters.push(addr);
    }
    Ok(masters)
}

/// The sequence file lives next to the binary, not in the working directory,
/// so restarts from different cwds find the same state.
fn sequence_path() -> anyhow::Result<PathBuf> {
    let exe = std::env::current_exe().context("cannot resolve the agent binary path")?;
    let dir = exe
        .parent()
        .context("agent binary path has no parent directory")?;
    Ok(dir.join(SEQUENCE_FILE_NAME))
}
