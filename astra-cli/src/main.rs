use anyhow::{anyhow, bail, Context, Result};
use astra_core::config::Config;
use astra_core::core_pairing::PairingEvent;
use astra_core::core_replica::{CapabilityRegistry, TagsFeature};
use astra_core::logging::{init_logging_with_config, LogConfig};
use astra_core::shutdown::wait_for_signal;
use astra_core::{EntityId, Mutation, ReplicaContext, ReplicaCoordinator, ReplicaId, Value};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

#[derive(Parser, Debug)]
#[command(name = "astra")]
#[command(author, version, about = "Local-first replica with peer-to-peer sync", long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Enable JSON formatted logging
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the data directory and replica identity
    Init {
        /// Name shown to peers during discovery and pairing
        #[arg(long)]
        name: Option<String>,
    },

    /// Run the replica until interrupted.
    ///
    /// Reads commands from stdin: `y <replica>`, `n <replica>`,
    /// `pair <address> [rekey]`, `sync [replica]`, `peers`, `quit`.
    Run,

    /// Set a register field. The value is parsed as JSON, falling back to text.
    Set { entity: String, field: String, value: String },

    /// Insert into a sequence field
    Insert { entity: String, field: String, index: usize, value: String },

    /// Delete from a sequence field
    Delete { entity: String, field: String, index: usize },

    /// Add or remove tags
    Tag {
        #[command(subcommand)]
        action: TagAction,
    },

    /// Print one document, or all of them
    Show { entity: Option<String> },

    /// Print this replica's identity and version vector
    Status,

    /// List trusted peers
    Peers,

    /// Remove a peer from the trust list
    Forget { replica: String },
}

#[derive(Subcommand, Debug)]
enum TagAction {
    Add { entity: String, tag: String },
    Remove { entity: String, tag: String },
}

fn expand(path: &Path) -> PathBuf {
    PathBuf::from(shellexpand::tilde(&path.to_string_lossy()).into_owned())
}

/// File (if any), then `ASTRA_*` variables, then flags
fn load_config(args: &Args) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let path = expand(path);
            if path.exists() {
                Config::from_file(&path)?
            } else if matches!(args.command, Command::Init { .. }) {
                Config::default()
            } else {
                bail!("config file {} not found; run `astra init` first", path.display());
            }
        }
        None => Config::default(),
    };
    config.apply_env()?;

    if let Some(data_dir) = &args.data_dir {
        config.replica.data_dir = data_dir.clone();
    }
    config.replica.data_dir = expand(&config.replica.data_dir);
    if let Some(level) = &args.log_level {
        config.logging.level = level.clone();
    }
    if args.json_logs {
        config.logging.json_format = true;
    }
    if let Command::Init { name: Some(name) } = &args.command {
        config.replica.display_name = name.clone();
    }

    config.validate()?;
    Ok(config)
}

fn open(config: Config) -> Result<ReplicaCoordinator> {
    let context = ReplicaContext::load(config)?;
    Ok(ReplicaCoordinator::open(context)?)
}

/// JSON if it parses into a replicated value, text otherwise
fn parse_value(raw: &str) -> Value {
    serde_json::from_str::<serde_json::Value>(raw)
        .ok()
        .and_then(|json| Value::from_json(&json))
        .unwrap_or_else(|| Value::text(raw))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init(args: &Args, config: Config) -> Result<()> {
    if let Some(path) = &args.config {
        let path = expand(path);
        if !path.exists() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            config.save_to_file(&path)?;
            info!(path = %path.display(), "wrote default config");
        }
    }

    let context = ReplicaContext::load(config)?;
    println!("replica   {}", context.identity.replica_id());
    println!("name      {}", context.identity.display_name());
    println!("key       {}", context.identity.trust_key().fingerprint());
    println!("data dir  {}", context.data_dir.display());
    Ok(())
}

fn show(replica: &ReplicaCoordinator, entity: Option<String>) -> Result<()> {
    match entity {
        Some(entity) => {
            let entity_id = EntityId::new(entity);
            let doc = replica
                .read(&entity_id)?
                .ok_or_else(|| anyhow!("no such entity: {}", entity_id))?;
            print_json(&doc.to_json())
        }
        None => {
            let mut all = serde_json::Map::new();
            for entity_id in replica.entities()? {
                if let Some(doc) = replica.read(&entity_id)? {
                    all.insert(entity_id.to_string(), doc.to_json());
                }
            }
            print_json(&serde_json::Value::Object(all))
        }
    }
}

fn status(replica: &ReplicaCoordinator) -> Result<()> {
    let vector = replica
        .version_vector()?
        .iter()
        .map(|(id, counter)| (id.to_string(), json!(counter)))
        .collect::<serde_json::Map<_, _>>();
    print_json(&json!({
        "replica": replica.replica_id().to_string(),
        "name": replica.display_name(),
        "key": replica.identity().trust_key().fingerprint(),
        "vector": vector,
        "pending": replica.pending_len()?,
        "peers": replica.peers()?.len(),
        "needs_reseed": replica.needs_reseed(),
    }))
}

fn peers(replica: &ReplicaCoordinator) -> Result<()> {
    let peers = replica.peers()?;
    if peers.is_empty() {
        println!("no trusted peers");
        return Ok(());
    }
    for peer in peers {
        let address = peer
            .last_known_address
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "-".to_string());
        let synced = peer
            .last_synced
            .map(|ts| ts.to_string())
            .unwrap_or_else(|| "never".to_string());
        let mut flags = Vec::new();
        if peer.reachable {
            flags.push("reachable");
        }
        if peer.trust_violation {
            flags.push("TRUST VIOLATION");
        }
        println!(
            "{}  {:<16} {:<22} synced {}  {}",
            peer.replica_id,
            peer.display_name,
            address,
            synced,
            flags.join(",")
        );
    }
    Ok(())
}

fn spawn_event_printers(replica: &ReplicaCoordinator) {
    let mut events = replica.pairing_events();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                PairingEvent::CandidateDiscovered { replica_id, display_name, address } => {
                    println!("found {} ({}) at {}", display_name, replica_id, address);
                }
                PairingEvent::ConfirmationRequired { replica_id, display_name, code, rekey } => {
                    if rekey {
                        println!("WARNING: {} is already paired under a different key", display_name);
                    }
                    println!("pair with {} ({})? code {}", display_name, replica_id, code);
                    println!("  answer with: y {}  or  n {}", replica_id, replica_id);
                }
                PairingEvent::Trusted { replica_id } => println!("paired with {}", replica_id),
                PairingEvent::Rejected { replica_id, reason } => {
                    println!("pairing with {} failed: {}", replica_id, reason)
                }
            }
        }
    });

    let mut changes = replica.subscribe();
    tokio::spawn(async move {
        while let Ok(change) = changes.recv().await {
            match change.value {
                Some(doc) => println!("changed {}: {}", change.entity_id, doc.to_json()),
                None => println!("changed {}", change.entity_id),
            }
        }
    });
}

/// Handle one stdin line; false means quit
fn handle_line(replica: &ReplicaCoordinator, line: &str) -> bool {
    let words: Vec<&str> = line.split_whitespace().collect();
    match words.as_slice() {
        [] => {}
        ["quit"] | ["exit"] => return false,
        [answer @ ("y" | "n"), replica_id] => {
            let accepted = *answer == "y";
            if let Err(e) = replica.confirm_pairing(&ReplicaId::from(*replica_id), accepted) {
                println!("error: {}", e);
            }
        }
        ["pair", address, rest @ ..] => {
            let address: SocketAddr = match address.parse() {
                Ok(address) => address,
                Err(e) => {
                    println!("error: bad address {}: {}", address, e);
                    return true;
                }
            };
            let rekey = rest.contains(&"rekey");
            let replica = replica.clone();
            // Confirmation arrives on this same input loop
            tokio::spawn(async move {
                if let Err(e) = replica.pair_with(address, rekey).await {
                    println!("pairing with {} failed: {}", address, e);
                }
            });
        }
        ["sync"] => {
            let replica = replica.clone();
            tokio::spawn(async move {
                for (peer, result) in replica.sync_all().await {
                    match result {
                        Ok(report) => println!(
                            "synced {}: sent {} received {} applied {}",
                            peer, report.sent, report.received, report.applied
                        ),
                        Err(e) => println!("sync with {} failed: {}", peer, e),
                    }
                }
            });
        }
        ["sync", replica_id] => {
            let replica = replica.clone();
            let replica_id = ReplicaId::from(*replica_id);
            tokio::spawn(async move {
                match replica.sync_with(&replica_id).await {
                    Ok(report) => println!(
                        "synced {}: sent {} received {} applied {}",
                        replica_id, report.sent, report.received, report.applied
                    ),
                    Err(e) => println!("sync with {} failed: {}", replica_id, e),
                }
            });
        }
        ["peers"] => {
            if let Err(e) = peers(replica) {
                println!("error: {}", e);
            }
        }
        _ => println!("unknown command: {}", line.trim()),
    }
    true
}

async fn run(config: Config) -> Result<()> {
    astra_core::metrics::init_metrics();
    let replica = open(config)?;
    if replica.needs_reseed() {
        warn!("local log was damaged; waiting for a peer to re-seed this replica");
    }
    spawn_event_printers(&replica);
    let address = replica.start().await?;
    println!("replica {} ({}) listening on {}", replica.replica_id(), replica.display_name(), address);

    let signal = wait_for_signal();
    tokio::pin!(signal);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = &mut signal => break,
            line = lines.next_line() => match line.context("reading stdin")? {
                Some(line) => {
                    if !handle_line(&replica, &line) {
                        break;
                    }
                }
                None => {
                    debug!("stdin closed; running until signalled");
                    (&mut signal).await;
                    break;
                }
            },
        }
    }

    replica.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging_with_config(LogConfig::from_config(&config.logging)?)?;

    match &args.command {
        Command::Init { .. } => init(&args, config)?,
        Command::Run => run(config).await?,
        Command::Set { entity, field, value } => {
            let replica = open(config)?;
            let op = replica.mutate(&EntityId::from(entity.as_str()), field, Mutation::Set(parse_value(value)))?;
            println!("{}", op);
        }
        Command::Insert { entity, field, index, value } => {
            let replica = open(config)?;
            let mutation = Mutation::Insert { index: *index, value: parse_value(value) };
            let op = replica.mutate(&EntityId::from(entity.as_str()), field, mutation)?;
            println!("{}", op);
        }
        Command::Delete { entity, field, index } => {
            let replica = open(config)?;
            let op = replica.mutate(&EntityId::from(entity.as_str()), field, Mutation::Delete { index: *index })?;
            println!("{}", op);
        }
        Command::Tag { action } => {
            let features = config.features.clone();
            let replica = open(config)?;
            let registry = CapabilityRegistry::new(replica.store_handle(), features);
            registry.register(Arc::new(TagsFeature))?;
            let request = match action {
                TagAction::Add { entity, tag } => json!({"entity": entity, "action": "add", "tag": tag}),
                TagAction::Remove { entity, tag } => {
                    json!({"entity": entity, "action": "remove", "tag": tag})
                }
            };
            let reply = registry.invoke(TagsFeature::NAME, &request)?;
            print_json(&reply["tags"])?;
        }
        Command::Show { entity } => show(&open(config)?, entity.clone())?,
        Command::Status => status(&open(config)?)?,
        Command::Peers => peers(&open(config)?)?,
        Command::Forget { replica } => {
            let coordinator = open(config)?;
            let forgotten = coordinator.forget_peer(&ReplicaId::from(replica.as_str()))?;
            println!("forgot {} ({})", forgotten.replica_id, forgotten.display_name);
        }
    }

    Ok(())
}
