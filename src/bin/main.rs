use chord::admin::{self, AdminRequest};
use chord::{Peer, PeerConfig};
use clap::{Parser, Subcommand};
use std::{error::Error, net::SocketAddr, path::PathBuf, time::Duration};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "chord_backup",
    version,
    about = "Chord ring backup peer & tools"
)]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a single peer
    Run {
        /// Address to bind. If omitted, see --port, then default.
        #[arg(long)]
        addr: Option<String>,
        /// Provide only the port, and host defaults to 127.0.0.1
        #[arg(short, long, env = "PORT")]
        port: Option<u16>,
        /// Address announced to other peers, if not the bound one
        #[arg(long)]
        advertise: Option<SocketAddr>,
        /// Existing ring member to join through; omit to start a new ring
        #[arg(short, long)]
        bootstrap: Option<SocketAddr>,
        /// Serve operator requests on this address
        #[arg(long, env = "CHORD_ADMIN")]
        admin: Option<SocketAddr>,
        /// Ring size exponent m (2^m positions)
        #[arg(short = 'm', long, default_value_t = chord::id::DEFAULT_RING_BITS)]
        ring_bits: u32,
        #[arg(long, default_value = "nodes")]
        storage_root: PathBuf,
        /// Storage quota in bytes, used until a saved ledger says otherwise
        #[arg(long, default_value_t = chord::config::DEFAULT_QUOTA_BYTES)]
        quota: u64,
        #[arg(long, default_value_t = 5000u64)]
        stabilize_ms: u64,
        #[arg(long, default_value_t = 3000u64)]
        timeout_ms: u64,
        #[arg(long, default_value_t = chord::config::DEFAULT_MAX_CONNECTIONS)]
        max_connections: usize,
    },

    /// Back up a local file into the ring
    Backup {
        #[command(flatten)]
        target: AdminTarget,
        name: String,
        #[arg(short = 'r', long, default_value_t = 1)]
        degree: u32,
    },

    /// Fetch a backed-up file into the peer's restore directory
    Restore {
        #[command(flatten)]
        target: AdminTarget,
        name: String,
    },

    /// Remove a file from every peer holding it
    Delete {
        #[command(flatten)]
        target: AdminTarget,
        name: String,
    },

    /// Lower the peer's quota, evicting files to fit
    Reclaim {
        #[command(flatten)]
        target: AdminTarget,
        bytes: u64,
    },

    /// Print the peer's state as JSON
    State {
        #[command(flatten)]
        target: AdminTarget,
    },
}

#[derive(clap::Args)]
struct AdminTarget {
    /// Admin address of the peer to talk to
    #[arg(long, env = "CHORD_ADMIN", default_value = "127.0.0.1:9100")]
    admin: SocketAddr,
    #[arg(long, default_value_t = 10_000u64)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    let cli = Cli::parse();
    match cli.command {
        Cmd::Run {
            addr,
            port,
            advertise,
            bootstrap,
            admin,
            ring_bits,
            storage_root,
            quota,
            stabilize_ms,
            timeout_ms,
            max_connections,
        } => {
            init_tracing();
            let config = PeerConfig {
                listen: resolve_listen_addr(addr, port).parse()?,
                advertise,
                bootstrap,
                ring_bits,
                storage_root,
                quota_bytes: quota,
                stabilize_interval: Duration::from_millis(stabilize_ms),
                rpc_timeout: Duration::from_millis(timeout_ms),
                max_connections,
                ..PeerConfig::default()
            };
            run(config, admin).await
        }
        Cmd::Backup { target, name, degree } => client(target, AdminRequest::Backup { name, degree }).await,
        Cmd::Restore { target, name } => client(target, AdminRequest::Restore(name)).await,
        Cmd::Delete { target, name } => client(target, AdminRequest::Delete(name)).await,
        Cmd::Reclaim { target, bytes } => client(target, AdminRequest::Reclaim(bytes)).await,
        Cmd::State { target } => client(target, AdminRequest::State).await,
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/* ------------------------- run -------------------------- */

async fn run(config: PeerConfig, admin: Option<SocketAddr>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let peer = Peer::start(config).await?;
    if let Some(admin) = admin {
        let listener = TcpListener::bind(admin).await?;
        tokio::spawn(admin::serve(peer.clone(), listener));
    }

    tokio::signal::ctrl_c().await?;
    info!(peer = %peer.id(), "shutting down");
    peer.shutdown().await?;
    Ok(())
}

fn resolve_listen_addr(addr: Option<String>, port: Option<u16>) -> String {
    // Priority:
    // 1. --addr
    // 2. --port / PORT env
    // 3. default
    if let Some(a) = addr {
        return normalize_addr(a);
    }
    if let Some(p) = port {
        return format!("127.0.0.1:{p}");
    }
    format!("127.0.0.1:{}", chord::config::DEFAULT_PORT)
}

/// Accept "7001" or "127.0.0.1:7001"
fn normalize_addr(raw: String) -> String {
    if raw.contains(':') {
        raw
    } else {
        format!("127.0.0.1:{raw}")
    }
}

/* ------------------------- clients -------------------------- */

async fn client(target: AdminTarget, request: AdminRequest) -> Result<(), Box<dyn Error + Send + Sync>> {
    let reply = admin::send_admin(target.admin, &request, Duration::from_millis(target.timeout_ms)).await?;
    if let Some(reason) = reply.strip_prefix("ERROR ") {
        return Err(reason.to_string().into());
    }
    if !reply.is_empty() {
        println!("{reply}");
    }
    Ok(())
}
