/// hostd - run one hostmesh replica over TCP.
///
/// Usage:
///   hostd --bind 0.0.0.0:7979 --peer <uuid>@<addr> [--peer ...] [--ingest 127.0.0.1:7980]
///
/// With `--ingest`, discovery reports are accepted as JSON lines on that
/// address, one command per line:
///
///   {"op":"upsert","provider":"arp","descriptor":{...}}
///   {"op":"remove","host":{...}}
///
/// Each line is answered with `{"ok":true,"event":...}` or
/// `{"ok":false,"error":"..."}`. Every host event is logged as a JSON line.
/// Ctrl+C stops the replica.
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use hostmesh::network::{DEFAULT_PORT, Listener, spawn_listener};
use hostmesh::transport::DEFAULT_INBOX_CAPACITY;
use hostmesh::{
    HostDescriptor, HostEvent, HostId, HostStore, HostStoreConfig, HybridClock, NodeId, ProviderId,
    TcpTransport,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::signal;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hostd")]
#[command(version, about = "Run a gossip-replicated host store node", long_about = None)]
struct Cli {
    /// Node id (UUID). A random one is generated if omitted
    #[arg(long)]
    node_id: Option<Uuid>,

    /// Address to listen on for gossip
    #[arg(short, long, default_value_t = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)))]
    bind: SocketAddr,

    /// Peer as <uuid>@<host:port>; repeat for every peer
    #[arg(short, long = "peer", value_parser = parse_peer)]
    peers: Vec<(NodeId, SocketAddr)>,

    /// Delay before the first anti-entropy round, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    anti_entropy_delay_ms: u64,

    /// Interval between anti-entropy rounds, in milliseconds
    #[arg(long, default_value_t = 5_000)]
    anti_entropy_period_ms: u64,

    /// Interval between location index self-checks, in seconds (0 disables)
    #[arg(long, default_value_t = 60)]
    index_check_secs: u64,

    /// Address accepting JSON-line host reports (disabled if omitted)
    #[arg(long)]
    ingest: Option<SocketAddr>,

    /// Log filter (overrides RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

fn parse_peer(s: &str) -> Result<(NodeId, SocketAddr)> {
    let (id, addr) = s
        .split_once('@')
        .ok_or_else(|| anyhow!("expected <uuid>@<addr>, got '{}'", s))?;
    let id = Uuid::parse_str(id).with_context(|| format!("Invalid peer id: {}", id))?;
    let addr = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{}:{}", addr, DEFAULT_PORT)
    };
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid peer address: {}", addr))?;
    Ok((NodeId::from_uuid(id), addr))
}

fn init_tracing(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn log_event(event: &HostEvent) -> Result<()> {
    let line = serde_json::to_string(event).context("Failed to encode host event")?;
    tracing::info!(target: "hostd::events", "{}", line);
    Ok(())
}

/// One line on the ingest socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum IngestCommand {
    Upsert {
        provider: ProviderId,
        descriptor: HostDescriptor,
    },
    Remove {
        host: HostId,
    },
}

async fn apply_command(store: &HostStore, line: &str) -> Result<Option<HostEvent>> {
    let command: IngestCommand = serde_json::from_str(line).context("Malformed command")?;
    let event = match command {
        IngestCommand::Upsert {
            provider,
            descriptor,
        } => {
            let host_id = descriptor.host_id();
            store
                .create_or_update_host(&provider, &host_id, descriptor)
                .await?
        }
        IngestCommand::Remove { host } => store.remove_host(&host).await?,
    };
    Ok(event)
}

async fn handle_ingest(socket: TcpStream, store: HostStore) -> Result<()> {
    let (reader, mut writer) = socket.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let reply = match apply_command(&store, &line).await {
            Ok(event) => serde_json::json!({ "ok": true, "event": event }),
            Err(e) => serde_json::json!({ "ok": false, "error": format!("{:#}", e) }),
        };
        writer.write_all(format!("{}\n", reply).as_bytes()).await?;
    }
    Ok(())
}

async fn serve_ingest(listener: TcpListener, store: HostStore) {
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                let store = store.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_ingest(socket, store).await {
                        tracing::debug!(peer = %peer, "Ingest connection closed: {:#}", e);
                    }
                });
            }
            Err(e) => {
                tracing::warn!("Failed to accept ingest connection: {}", e);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log.as_deref());

    let node_id = cli.node_id.map(NodeId::from_uuid).unwrap_or_default();

    let transport = Arc::new(TcpTransport::new(node_id));
    for (peer, addr) in &cli.peers {
        transport.add_peer(*peer, *addr);
    }

    let index_check = (cli.index_check_secs > 0).then(|| Duration::from_secs(cli.index_check_secs));
    let config = HostStoreConfig::new()
        .anti_entropy(
            Duration::from_millis(cli.anti_entropy_delay_ms),
            Duration::from_millis(cli.anti_entropy_period_ms),
        )
        .index_check_period(index_check);

    let clock = Arc::new(HybridClock::new(node_id.origin()));
    let store = HostStore::with_transport(config, clock, Arc::clone(&transport))
        .context("Invalid store configuration")?;
    store.add_listener(log_event);

    let listener = Listener::bind(cli.bind)
        .await
        .context("Failed to bind gossip listener")?;
    let local_addr = listener.local_addr();
    let (inbox_tx, inbox) = mpsc::channel(DEFAULT_INBOX_CAPACITY);
    let accept_task = spawn_listener(listener, inbox_tx);

    store.start(inbox).await.context("Failed to start host store")?;

    let ingest_task = match cli.ingest {
        Some(addr) => {
            let listener = TcpListener::bind(addr)
                .await
                .context("Failed to bind ingest listener")?;
            tracing::info!(addr = %addr, "Accepting host reports");
            Some(tokio::spawn(serve_ingest(listener, store.clone())))
        }
        None => None,
    };

    tracing::info!(
        node = %node_id,
        uuid = %node_id.0,
        addr = %local_addr,
        peers = cli.peers.len(),
        "hostd running, press Ctrl+C to stop"
    );

    signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;

    tracing::info!("Shutting down");
    let stats = store.stats().await;
    if let Some(task) = ingest_task {
        task.abort();
    }
    store.stop().await.context("Failed to stop host store")?;
    accept_task.abort();

    tracing::info!(
        hosts = stats.host_count,
        tombstones = stats.tombstone_count,
        "hostd stopped"
    );
    Ok(())
}
