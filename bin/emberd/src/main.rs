//! Ember Daemon - Background service for an Ember overlay peer.
//!
//! Provides:
//! - Rendezvous overlay participation over UDP
//! - Document storage with attribute search
//! - Shared distributed index publication and replication

mod transport;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use tokio::select;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ember_core::{NetworkKey, PeerId};
use ember_overlay::{OverlayConfig, RendezvousOverlay, Role};
use ember_srdi::{
    CoordinatorConfig, CredentialProvider, IndexCoordinator, NetworkCredential, StorePublisher,
};
use ember_store::{DocumentStore, SrdiLocalIndex, StoreConfig};

use crate::transport::{UdpEndpoint, UDP_SCHEME};

/// Store area holding local documents.
const DOCUMENT_AREA: &str = "cm";

/// Ember daemon service.
#[derive(Parser)]
#[command(name = "emberd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file path
    #[arg(short, long, default_value = "~/.ember/config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Run {
        /// Listen address
        #[arg(short, long)]
        listen: Option<SocketAddr>,

        /// Initial role (edge, rendezvous, adhoc)
        #[arg(short, long)]
        role: Option<String>,
    },

    /// Show local status
    Status,
}

/// A rendezvous peer to lease from at startup, written `<peer>@<host:port>`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Seed {
    peer: PeerId,
    address: String,
}

impl Seed {
    fn parse(s: &str) -> Result<Self> {
        let (peer, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow!("Seed {s:?} is not <peer>@<host:port>"))?;
        let peer: PeerId = peer.parse().context("Invalid seed peer id")?;
        let addr: SocketAddr = addr.parse().context("Invalid seed address")?;
        Ok(Self {
            peer,
            address: format!("{UDP_SCHEME}{addr}"),
        })
    }
}

/// Daemon configuration.
#[derive(Debug, Clone)]
struct DaemonConfig {
    /// Peer identity file path
    identity_file: PathBuf,
    /// Role at startup
    role: Role,
    /// Let the watchdog switch roles
    auto_rendezvous: bool,
    /// Shared network key for index credentials
    network_key: Option<NetworkKey>,
    /// Listen address
    listen_addr: SocketAddr,
    /// Subnet broadcast address
    broadcast_addr: Option<SocketAddr>,
    /// Rendezvous peers to lease from
    seeds: Vec<Seed>,
    /// Data directory
    data_dir: PathBuf,
    /// Ceiling between document GC sweeps
    gc_interval_secs: u64,
    /// Expired hits that trigger an early sweep
    inconvenience_threshold: u64,
    /// Lease length
    lease_secs: u64,
    /// Role watchdog interval
    watchdog_secs: u64,
    /// Index push interval
    push_interval_secs: u64,
    /// Minimum view size for replication
    replication_threshold: usize,
    /// Maintenance interval
    maintenance_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let store = StoreConfig::default();
        let overlay = OverlayConfig::default();
        let coordinator = CoordinatorConfig::default();
        Self {
            identity_file: PathBuf::from("~/.ember/identity"),
            role: Role::Edge,
            auto_rendezvous: true,
            network_key: None,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9701)),
            broadcast_addr: None,
            seeds: Vec::new(),
            data_dir: PathBuf::from("~/.ember/data"),
            gc_interval_secs: store.gc_interval.as_secs(),
            inconvenience_threshold: store.inconvenience_threshold,
            lease_secs: overlay.lease_duration.as_secs(),
            watchdog_secs: overlay.watchdog_interval.as_secs(),
            push_interval_secs: coordinator.push_interval.as_secs(),
            replication_threshold: coordinator.replication_threshold,
            maintenance_secs: 60,
        }
    }
}

impl DaemonConfig {
    fn overlay_config(&self) -> OverlayConfig {
        OverlayConfig {
            auto_rendezvous: self.auto_rendezvous,
            lease_duration: Duration::from_secs(self.lease_secs),
            watchdog_interval: Duration::from_secs(self.watchdog_secs),
            ..OverlayConfig::with_role(self.role)
        }
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig {
            gc_interval: Duration::from_secs(self.gc_interval_secs),
            inconvenience_threshold: self.inconvenience_threshold,
            ..StoreConfig::new(expand_tilde(&self.data_dir))
        }
    }

    fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            push_interval: Duration::from_secs(self.push_interval_secs),
            replication_threshold: self.replication_threshold,
            ..CoordinatorConfig::default()
        }
    }
}

/// Load configuration from TOML file.
fn load_config(path: &Path) -> Result<DaemonConfig> {
    let path = expand_tilde(path);

    if !path.exists() {
        info!(path = %path.display(), "No config file found, using defaults");
        return Ok(DaemonConfig::default());
    }

    let content = std::fs::read_to_string(&path).context("Failed to read config file")?;
    parse_config(&content)
}

fn parse_config(content: &str) -> Result<DaemonConfig> {
    let toml: toml::Table = content.parse().context("Failed to parse config file")?;
    let mut config = DaemonConfig::default();

    // Parse [node] section
    if let Some(node) = toml.get("node") {
        if let Some(identity) = node.get("identity_file").and_then(|v| v.as_str()) {
            config.identity_file = PathBuf::from(identity);
        }
        if let Some(role) = node.get("role").and_then(|v| v.as_str()) {
            config.role = Role::from_name(role).ok_or_else(|| anyhow!("Unknown role {role:?}"))?;
        }
        if let Some(auto) = node.get("auto_rendezvous").and_then(|v| v.as_bool()) {
            config.auto_rendezvous = auto;
        }
    }

    // Parse [network] section
    if let Some(network) = toml.get("network") {
        if let Some(listen) = network.get("listen").and_then(|v| v.as_str()) {
            config.listen_addr = listen.parse().context("Invalid listen address")?;
        }
        if let Some(broadcast) = network.get("broadcast").and_then(|v| v.as_str()) {
            config.broadcast_addr = Some(broadcast.parse().context("Invalid broadcast address")?);
        }
        if let Some(key) = network.get("key").and_then(|v| v.as_str()) {
            config.network_key = Some(NetworkKey::from_hex(key).context("Invalid network key")?);
        }
        if let Some(seeds) = network.get("seeds").and_then(|v| v.as_array()) {
            config.seeds = seeds
                .iter()
                .filter_map(|v| v.as_str())
                .map(Seed::parse)
                .collect::<Result<_>>()?;
        }
    }

    // Parse [storage] section
    if let Some(storage) = toml.get("storage") {
        if let Some(data_dir) = storage.get("data_dir").and_then(|v| v.as_str()) {
            config.data_dir = PathBuf::from(data_dir);
        }
        if let Some(secs) = integer(storage, "gc_interval_secs")? {
            config.gc_interval_secs = secs;
        }
        if let Some(threshold) = integer(storage, "inconvenience_threshold")? {
            config.inconvenience_threshold = threshold;
        }
    }

    // Parse [rendezvous] section
    if let Some(rendezvous) = toml.get("rendezvous") {
        if let Some(secs) = integer(rendezvous, "lease_secs")? {
            config.lease_secs = secs;
        }
        if let Some(secs) = integer(rendezvous, "watchdog_secs")? {
            config.watchdog_secs = secs;
        }
        if let Some(secs) = integer(rendezvous, "push_interval_secs")? {
            config.push_interval_secs = secs;
        }
        if let Some(threshold) = integer(rendezvous, "replication_threshold")? {
            config.replication_threshold =
                usize::try_from(threshold).context("replication_threshold out of range")?;
        }
    }

    Ok(config)
}

/// Reads a non-negative integer field.
fn integer(section: &toml::Value, key: &str) -> Result<Option<u64>> {
    match section.get(key).and_then(|v| v.as_integer()) {
        Some(n) => Ok(Some(
            u64::try_from(n).with_context(|| format!("{key} must not be negative"))?,
        )),
        None => Ok(None),
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}

/// Load or generate the peer identity.
fn load_identity(path: &Path) -> Result<PeerId> {
    let path = expand_tilde(path);

    if path.exists() {
        let content = std::fs::read_to_string(&path).context("Failed to read identity file")?;
        let line = content
            .lines()
            .find_map(|line| line.strip_prefix("peer: "))
            .ok_or_else(|| anyhow!("No peer id found in identity file"))?;
        return line.trim().parse().context("Invalid peer id in identity file");
    }

    info!("Generating new peer identity");
    let peer_id = PeerId::random();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create identity directory")?;
    }
    let data = format!("# Ember Identity\npeer: {}\n", peer_id.to_hex());
    std::fs::write(&path, data).context("Failed to write identity file")?;

    info!(path = %path.display(), "Saved new identity");
    Ok(peer_id)
}

/// The main daemon service.
struct Daemon {
    config: DaemonConfig,
    peer_id: PeerId,
    endpoint: Arc<UdpEndpoint>,
    overlay: Arc<RendezvousOverlay>,
    store: Arc<DocumentStore>,
    coordinator: Arc<IndexCoordinator>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Creates a new daemon with the given configuration.
    async fn new(config: DaemonConfig) -> Result<Self> {
        let peer_id = load_identity(&config.identity_file)?;
        info!(peer = %peer_id, "Loaded identity");

        let store_config = config.store_config();
        store_config
            .create_dirs()
            .context("Failed to create storage directories")?;
        let store = Arc::new(
            DocumentStore::open(&store_config, DOCUMENT_AREA)
                .context("Failed to open document store")?,
        );

        let coordinator_config = config.coordinator_config();
        let index = Arc::new(
            SrdiLocalIndex::open(&store_config, &coordinator_config.handler_name)
                .context("Failed to open index store")?,
        );

        let endpoint = UdpEndpoint::bind(peer_id, config.listen_addr, config.broadcast_addr)
            .await
            .context("Failed to bind UDP socket")?;
        let overlay = RendezvousOverlay::new(config.overlay_config(), endpoint.clone());

        let credentials = config.network_key.clone().map(|key| {
            let provider: Arc<dyn CredentialProvider> = Arc::new(NetworkCredential::new(key));
            provider
        });
        if credentials.is_none() {
            warn!("No network key configured, index messages are unauthenticated");
        }
        let coordinator =
            IndexCoordinator::new(coordinator_config, Arc::clone(&overlay), index, credentials);
        let publisher = Arc::new(StorePublisher::new(Arc::clone(&store), &coordinator));
        coordinator.set_publisher(publisher);

        Ok(Self {
            config,
            peer_id,
            endpoint,
            overlay,
            store,
            coordinator,
            cancel: CancellationToken::new(),
            handles: Vec::new(),
        })
    }

    /// Starts the receiver and every background worker.
    fn start(&mut self) {
        let cancel = &self.cancel;
        self.handles.push(
            self.endpoint
                .spawn_receiver(Arc::clone(&self.overlay), cancel.child_token()),
        );
        self.handles
            .extend(self.overlay.start(cancel.child_token()));
        self.handles
            .extend(self.coordinator.start(cancel.child_token()));
        self.handles.push(self.store.spawn_gc(cancel.child_token()));
        self.handles
            .push(self.coordinator.index().spawn_gc(cancel.child_token()));
    }

    /// Leases from every configured seed.
    fn connect_seeds(&self) {
        if self.config.seeds.is_empty() {
            info!("No seed rendezvous configured");
            return;
        }

        for seed in &self.config.seeds {
            let addresses = [seed.address.clone()];
            self.overlay.add_seed(seed.peer, &addresses);
            match self.overlay.connect(seed.peer, &addresses) {
                Ok(()) => info!(peer = %seed.peer, addr = %seed.address, "Requested lease"),
                Err(e) => warn!(peer = %seed.peer, error = %e, "Lease request failed"),
            }
        }
    }

    /// Runs periodic maintenance.
    fn maintenance(&self) {
        debug!("Running maintenance");

        if self.overlay.role() == Role::Edge && self.overlay.connected_rendezvous().is_empty() {
            self.connect_seeds();
        }

        let overlay = self.overlay.stats();
        let index = self.coordinator.stats();
        info!(
            role = self.overlay.role().name(),
            rendezvous = self.overlay.connected_rendezvous().len(),
            clients = self.overlay.connected_clients().len(),
            view = self.overlay.view().len(),
            routes = self.endpoint.route_count(),
            delivered = overlay.delivered,
            sent = overlay.sent,
            pushes = index.pushes,
            received = index.received,
            "Maintenance"
        );
    }

    /// Stops workers and releases connected peers.
    async fn shutdown(self) {
        self.cancel.cancel();
        self.overlay.shutdown();
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Prints status from the local stores.
fn print_status(config: &DaemonConfig) -> Result<()> {
    let peer_id = load_identity(&config.identity_file)?;
    let store_config = config.store_config();
    let store = DocumentStore::open(&store_config, DOCUMENT_AREA)
        .context("Failed to open document store (is the daemon running?)")?;
    let stats = store.stats();

    println!("Ember Daemon Status");
    println!("===================");
    println!();
    println!("Peer ID: {}", peer_id);
    println!("Role: {}", config.role.name());
    println!("Listen: {}", config.listen_addr);
    println!("Seeds: {}", config.seeds.len());
    println!(
        "Network key: {}",
        if config.network_key.is_some() { "configured" } else { "none" }
    );
    println!();
    println!("Storage:");
    println!("  Records: {}", stats.records);
    println!("  Directories: {}", stats.directories);
    for dir in store.directories() {
        println!("    {}", dir);
    }
    println!("  Attribute indices: {}", stats.indices);
    println!("  Data directory: {}", store_config.base_path.display());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set up logging")?;

    let mut config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Commands::Run {
        listen: None,
        role: None,
    }) {
        Commands::Run { listen, role } => {
            if let Some(addr) = listen {
                config.listen_addr = addr;
            }
            if let Some(role) = role {
                config.role =
                    Role::from_name(&role).ok_or_else(|| anyhow!("Unknown role {role:?}"))?;
            }

            info!(
                listen = %config.listen_addr,
                role = config.role.name(),
                data_dir = %expand_tilde(&config.data_dir).display(),
                "Starting Ember daemon"
            );

            let mut daemon = Daemon::new(config.clone()).await?;
            daemon.start();
            daemon.connect_seeds();

            let mut maintenance_interval = interval(Duration::from_secs(config.maintenance_secs));
            maintenance_interval.tick().await;

            println!("Ember daemon running");
            println!("  Peer ID: {}", daemon.peer_id);
            println!("  Listen: {}", daemon.endpoint.local_addr());
            println!("  Role: {}", daemon.overlay.role().name());
            println!();
            println!("Press Ctrl+C to stop");

            loop {
                select! {
                    _ = maintenance_interval.tick() => {
                        daemon.maintenance();
                    }

                    result = signal::ctrl_c() => {
                        match result {
                            Ok(()) => info!("Received shutdown signal"),
                            Err(e) => warn!(error = %e, "Failed to listen for shutdown signal"),
                        }
                        break;
                    }
                }
            }

            info!("Shutting down");
            daemon.shutdown().await;
            info!("Daemon stopped");
        }

        Commands::Status => {
            print_status(&config)?;
        }
    }

    Ok(())
}
