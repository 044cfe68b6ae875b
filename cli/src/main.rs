// meshwire - developer CLI for the BLE mesh protocol engine
//
// Identity inspection, packet decoding, in-process multi-node simulation
// over the loopback radio, and config management.

mod config;
mod inspect;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use meshwire_core::transport::ble::{BleCoordinator, LoopbackAir};
use meshwire_core::{
    BleConfig, ChannelDelegate, EngineConfig, EphemeralIdentity, IdentityKeys, IdentityManager,
    IdentityProvider, MeshEvent, PeerDirectory, PeerKey, ProtocolEngine, StaticIdentity,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

#[derive(Parser)]
#[command(name = "meshwire")]
#[command(about = "Meshwire: BLE mesh protocol toolkit", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show or create the device identity
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Decode a hex-encoded packet
    Inspect { hex: String },
    /// Run several nodes on an in-process radio and exchange a message
    Simulate {
        #[arg(short, long, default_value = "2")]
        nodes: usize,
        #[arg(short, long, default_value = "hello mesh")]
        message: String,
        /// Send a generated payload of this many bytes instead of the message
        #[arg(short, long)]
        size: Option<usize>,
    },
    /// Join the mesh on the local Bluetooth adapter and print events
    #[cfg(feature = "btleplug")]
    Listen,
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    Show,
    /// Generate a new keypair; `--save` stores it in the config file
    Generate {
        #[arg(long)]
        save: bool,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::Config::default_path()?,
    };

    match cli.command {
        Commands::Identity { action } => cmd_identity(&config_path, action),
        Commands::Inspect { hex } => cmd_inspect(&hex),
        Commands::Simulate {
            nodes,
            message,
            size,
        } => cmd_simulate(&config_path, nodes, message, size).await,
        #[cfg(feature = "btleplug")]
        Commands::Listen => cmd_listen(&config_path).await,
        Commands::Config { action } => cmd_config(&config_path, action),
    }
}

fn load_identity(config: &config::Config) -> Result<IdentityManager> {
    let provider: Box<dyn IdentityProvider> = match config.keys()? {
        Some(keys) => Box::new(StaticIdentity::new(keys)),
        None => Box::new(EphemeralIdentity),
    };
    IdentityManager::from_provider(provider.as_ref(), config.engine.nickname.clone())
}

fn print_identity(keys: &IdentityKeys, nickname: &str) {
    println!("  Public Key:  {}", keys.public_key_hex().bright_yellow());
    println!("  Fingerprint: {}", keys.fingerprint().bright_cyan());
    println!("  BLE Service: {}", keys.ble_service_uuid());
    if !nickname.is_empty() {
        println!("  Nickname:    {}", nickname);
    }
}

fn cmd_identity(config_path: &Path, action: Option<IdentityAction>) -> Result<()> {
    let mut config = config::Config::load(config_path)?;

    match action {
        None | Some(IdentityAction::Show) => {
            let identity = load_identity(&config)?;
            println!("{}", "Identity Information".bold());
            print_identity(identity.keys(), &identity.nickname());
            if config.private_key.is_none() {
                println!();
                println!(
                    "{}",
                    "No stored key: this identity changes on every run.".yellow()
                );
                println!(
                    "  Persist one with: {}",
                    "meshwire identity generate --save".bright_green()
                );
            }
        }
        Some(IdentityAction::Generate { save }) => {
            let keys = IdentityKeys::generate();
            println!("{}", "Generated Identity".bold());
            print_identity(&keys, &config.engine.nickname);
            if save {
                config.private_key = Some(hex::encode(*keys.private_key_bytes()));
                config.save(config_path)?;
                println!();
                println!("  {} Saved to {}", "✓".green(), config_path.display());
            }
        }
    }

    Ok(())
}

fn cmd_inspect(input: &str) -> Result<()> {
    let bytes = inspect::parse_hex(input)?;
    let fields = inspect::describe(&bytes)?;

    println!("{}", "Packet".bold());
    for (name, value) in fields {
        let value = match value.as_str() {
            "valid" => value.green().to_string(),
            "INVALID" | "unsigned" => value.red().to_string(),
            _ => value,
        };
        println!("  {:<20} {}", format!("{name}:"), value);
    }
    Ok(())
}

fn cmd_config(config_path: &Path, action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load(config_path)?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save(config_path)?;
            println!("  {} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {:<24} {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::Path => println!("{}", config_path.display()),
    }

    Ok(())
}

// ============================================================================
// SIMULATION
// ============================================================================

const SIM_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Short radio cycles so the simulated mesh forms in well under a second
fn sim_ble() -> BleConfig {
    BleConfig {
        connect_timeout_ms: 1_000,
        scan_timeout_ms: 500,
        rescan_interval_ms: 100,
        ..BleConfig::default()
    }
}

struct SimNode {
    name: String,
    engine: ProtocolEngine,
    events: UnboundedReceiver<MeshEvent>,
}

impl SimNode {
    fn join(air: &LoopbackAir, name: &str, base: &EngineConfig) -> Result<Self> {
        let (central, peripheral, radio) = air.join(name);
        let coordinator = BleCoordinator::new(sim_ble(), Arc::new(central), Arc::new(peripheral), radio);
        let identity = Arc::new(IdentityManager::from_provider(&EphemeralIdentity, name)?);
        let engine = ProtocolEngine::new(
            EngineConfig {
                nickname: name.to_string(),
                ble: sim_ble(),
                ..base.clone()
            },
            identity,
            Arc::new(PeerDirectory::new()),
            Arc::new(coordinator),
        );
        let (delegate, events) = ChannelDelegate::new();
        engine.set_delegate(Some(Arc::new(delegate)));
        Ok(Self {
            name: name.to_string(),
            engine,
            events,
        })
    }

    fn key(&self) -> PeerKey {
        self.engine.identity().public_key()
    }

    /// Print and drop everything queued so far
    fn drain(&mut self, names: &[(PeerKey, String)]) -> Vec<MeshEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            print_event(&self.name, &event, names);
            seen.push(event);
        }
        seen
    }
}

fn name_of(key: &PeerKey, names: &[(PeerKey, String)]) -> String {
    names
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, name)| name.clone())
        .unwrap_or_else(|| key.short())
}

fn print_event(node: &str, event: &MeshEvent, names: &[(PeerKey, String)]) {
    let node = format!("[{node}]").bright_black();
    match event {
        MeshEvent::MessageReceived { sender, payload } => println!(
            "{} {} {} bytes from {}",
            node,
            "✉".bright_green(),
            payload.len(),
            name_of(sender, names).bright_cyan()
        ),
        MeshEvent::PeerConnected(peer) => {
            println!("{} {} {}", node, "🤝 connected".green(), peer.display_name())
        }
        MeshEvent::PeerUpdated(peer) => {
            println!("{} {} {}", node, "updated".yellow(), peer.display_name())
        }
        MeshEvent::PeerDisconnected(peer) => {
            println!("{} {} {}", node, "disconnected".red(), peer.display_name())
        }
        MeshEvent::StatusChanged(status) => println!("{} status {}", node, status),
        MeshEvent::DeliveryAck { peer, message_id } => println!(
            "{} {} {} by {}",
            node,
            "✓ delivered".green(),
            message_id,
            name_of(peer, names)
        ),
        MeshEvent::DeliveryFailed {
            peer,
            message_id,
            reason,
        } => println!(
            "{} {} {} to {}: {}",
            node,
            "✗ failed".red(),
            message_id,
            name_of(peer, names),
            reason
        ),
    }
}

async fn cmd_simulate(
    config_path: &Path,
    nodes: usize,
    message: String,
    size: Option<usize>,
) -> Result<()> {
    anyhow::ensure!(nodes >= 2, "A simulation needs at least two nodes");
    let config = config::Config::load(config_path)?;

    println!("{}", format!("Simulating {nodes} nodes on a loopback radio").bold());
    let air = LoopbackAir::new();
    let mut sim = Vec::with_capacity(nodes);
    for i in 0..nodes {
        sim.push(SimNode::join(&air, &format!("node-{i}"), &config.engine)?);
    }
    let names: Vec<(PeerKey, String)> = sim.iter().map(|n| (n.key(), n.name.clone())).collect();

    for node in &sim {
        anyhow::ensure!(
            node.engine.initialize(),
            "{} failed to initialize",
            node.name
        );
        node.engine
            .start()
            .await
            .with_context(|| format!("{} failed to start", node.name))?;
    }

    let formed = tokio::time::timeout(SIM_CONNECT_TIMEOUT, async {
        loop {
            for node in sim.iter_mut() {
                node.drain(&names);
            }
            if sim
                .iter()
                .all(|n| n.engine.connected_peers().len() >= nodes - 1)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if formed.is_err() {
        for node in &sim {
            node.engine.stop().await;
        }
        anyhow::bail!("Mesh did not form within {:?}", SIM_CONNECT_TIMEOUT);
    }
    println!("  {} Mesh formed", "✓".green());

    let payload = match size {
        Some(len) => (0..len).map(|i| (i % 251) as u8).collect(),
        None => message.into_bytes(),
    };
    println!(
        "{}",
        format!("{} sends {} bytes to every peer", sim[0].name, payload.len()).bold()
    );

    let mut sent = 0;
    for (key, name) in names.iter().skip(1) {
        match sim[0].engine.try_send(key, &payload).await {
            Ok(id) => {
                sent += 1;
                tracing::debug!("Sent {} to {}", id, name);
            }
            Err(e) => println!("  {} {}: {}", "✗".red(), name, e),
        }
    }

    let mut delivered = 0;
    let deadline = tokio::time::Instant::now() + SIM_CONNECT_TIMEOUT;
    while delivered < sent && tokio::time::Instant::now() < deadline {
        for node in sim.iter_mut().skip(1) {
            delivered += node
                .drain(&names)
                .iter()
                .filter(|e| matches!(e, MeshEvent::MessageReceived { payload: p, .. } if *p == payload))
                .count();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    println!();
    println!("{}", "Statistics".bold());
    for node in &sim {
        let stats = node.engine.stats();
        println!(
            "  {:<8} peers {}/{}  dedup ids {}  reassembling {}",
            node.name.bright_cyan(),
            stats.connected_peers,
            stats.known_peers,
            stats.seen_packet_ids,
            stats.fragment_sessions
        );
    }

    for node in &sim {
        node.engine.stop().await;
    }

    anyhow::ensure!(
        delivered == nodes - 1,
        "Only {delivered} of {} peers received the message",
        nodes - 1
    );
    println!();
    println!("  {} Delivered to {} peers", "✓".green(), delivered);
    Ok(())
}

// ============================================================================
// LIVE RADIO
// ============================================================================

#[cfg(feature = "btleplug")]
async fn cmd_listen(config_path: &Path) -> Result<()> {
    use meshwire_core::transport::ble::desktop::{BtleplugCentral, CentralOnlyPeripheral};

    let config = config::Config::load(config_path)?;
    let identity = Arc::new(load_identity(&config)?);
    println!("{}", "Listening on the local Bluetooth adapter".bold());
    print_identity(identity.keys(), &identity.nickname());

    let (central, radio) = BtleplugCentral::first_adapter().await?;
    let coordinator = BleCoordinator::new(
        config.engine.ble.clone(),
        Arc::new(central),
        Arc::new(CentralOnlyPeripheral),
        radio,
    );
    let engine = ProtocolEngine::new(
        config.engine.clone(),
        identity,
        Arc::new(PeerDirectory::new()),
        Arc::new(coordinator),
    );
    let (delegate, mut events) = ChannelDelegate::new();
    engine.set_delegate(Some(Arc::new(delegate)));

    engine.try_initialize()?;
    engine.start().await?;
    println!("  Press {} to stop", "Ctrl-C".bright_green());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(event) = events.recv() => {
                let names: Vec<(PeerKey, String)> = engine
                    .peers()
                    .into_iter()
                    .map(|p| (p.public_key, p.display_name()))
                    .collect();
                print_event("local", &event, &names);
            }
        }
    }

    engine.stop().await;
    Ok(())
}
