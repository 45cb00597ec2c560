//! CLI entry point for a P2P overlay node.
//!
//! This binary runs a node with an interactive console, queries discovery
//! servers, and manages configuration files.

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use log::{info, warn};
use p2p_fileshare::{
    defaults::{DISCOVERY_TIMEOUT, SHUTDOWN_GRACE},
    network::{canonicalize, fetch_peers},
    utils::{NodeConfig, DEFAULT_CONFIG_FILE},
    NodeEvent, PeerNode,
};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};

/// P2P Fileshare - a minimal peer-to-peer overlay node
#[derive(Parser)]
#[command(name = "peer")]
#[command(about = "A minimal peer-to-peer overlay with heartbeats and broadcast")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node and read commands from stdin
    Run(RunArgs),
    /// Print the peer list served by a discovery server
    Discover {
        /// Discovery server address (host:port)
        server: String,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Peer addresses to dial (host:port)
    peers: Vec<String>,
    /// Display name announced to peers
    #[arg(short, long)]
    name: Option<String>,
    /// Host to bind
    #[arg(long)]
    host: Option<String>,
    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,
    /// Also serve discovery queries on this port
    #[arg(short, long)]
    discovery_port: Option<u16>,
    /// Discovery server to fetch initial peers from
    #[arg(short, long, value_name = "ADDR")]
    bootstrap: Option<String>,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Show only specific section
        #[arg(short, long)]
        section: Option<String>,
    },
}

/// One line typed into the running node's console
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Broadcast(String),
    Peers,
    History(String),
    Diagnostics,
    File(PathBuf),
    Diag(String),
    Exit,
    Invalid(String),
}

impl ConsoleCommand {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        if line == "exit" {
            return Self::Exit;
        }
        let Some(command) = line.strip_prefix('/') else {
            return Self::Broadcast(line.to_string());
        };

        let (name, argument) = match command.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (command, ""),
        };
        match (name, argument) {
            ("peers", _) => Self::Peers,
            ("log", _) => Self::Diagnostics,
            ("history", address) if !address.is_empty() => Self::History(address.to_string()),
            ("file", path) if !path.is_empty() => Self::File(PathBuf::from(path)),
            ("diag", text) if !text.is_empty() => Self::Diag(text.to_string()),
            _ => Self::Invalid(line.to_string()),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = NodeConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level)?;

    match cli.command {
        Commands::Run(args) => handle_run_command(args, config).await,
        Commands::Discover { server } => handle_discover_command(&server).await,
        Commands::Config { action } => handle_config_commands(action, &config),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) -> Result<()> {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();

    Ok(())
}

async fn handle_run_command(args: RunArgs, mut config: NodeConfig) -> Result<()> {
    // Override config with command line options
    if let Some(name) = args.name {
        config.node.name = name;
    }
    if let Some(host) = args.host {
        config.node.host = host;
    }
    if let Some(port) = args.port {
        config.node.port = port;
    }
    if let Some(port) = args.discovery_port {
        config.discovery.enabled = true;
        config.discovery.port = port;
    }
    config.node.peers.extend(args.peers);
    config.validate()?;

    let node = PeerNode::from_config(&config);
    node.listen().await?;
    println!("Node '{}' listening on {}", node.identity().name, node.address());

    if config.discovery.enabled {
        let address = format!("{}:{}", config.node.host, config.discovery.port);
        let bound = node.start_discovery(&address).await?;
        println!("Serving discovery on {bound}");
    }

    let mut peers = config.node.peers.clone();
    if let Some(server) = args.bootstrap {
        match fetch_peers(&server, DISCOVERY_TIMEOUT).await {
            Ok(found) => {
                info!("Discovery server {} returned {} peers", server, found.len());
                peers.extend(found);
            }
            Err(e) => warn!("Could not fetch peers from {}: {}", server, e),
        }
    }

    let own_address = canonicalize(&node.address());
    peers.retain(|peer| canonicalize(peer) != own_address);
    peers.sort();
    peers.dedup();
    info!("Dialing peers: {:?}", peers);
    node.connect_to_peers(peers);

    tokio::spawn(print_events(node.subscribe()));
    println!("Type a message to broadcast, /peers, /history <addr>, /log, /file <path>, /diag <text> or exit.");

    tokio::select! {
        result = run_console(&node) => result?,
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for the shutdown signal: {}", e);
            }
            info!("Shutdown signal received");
        }
    }

    info!("Shutting down gracefully...");
    node.shutdown().await;
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

async fn run_console(node: &PeerNode) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        match ConsoleCommand::parse(&line) {
            ConsoleCommand::Exit => break,
            ConsoleCommand::Broadcast(text) => {
                let summary = node.broadcast(&text).await;
                if summary.attempted() == 0 {
                    println!("No connected peers");
                } else if !summary.is_complete() {
                    println!("Not delivered to: {}", summary.failed.join(", "));
                }
            }
            ConsoleCommand::Peers => print_peers(node),
            ConsoleCommand::History(address) => match node.history(&address) {
                Some(history) if history.is_empty() => println!("No messages with {address}"),
                Some(history) => {
                    for envelope in history {
                        println!("  {}: {}", envelope.sender(), envelope.content());
                    }
                }
                None => println!("Not connected to {address}"),
            },
            ConsoleCommand::Diagnostics => {
                for envelope in node.diagnostics() {
                    println!("  [{}] {}", envelope.sender(), envelope.content());
                }
            }
            ConsoleCommand::File(path) => {
                if let Err(e) = share_file(node, &path).await {
                    println!("Could not share {}: {}", path.display(), e);
                }
            }
            ConsoleCommand::Diag(text) => {
                node.send_log(&text).await;
            }
            ConsoleCommand::Invalid(line) => println!("Unknown command: {line}"),
        }
    }

    Ok(())
}

async fn share_file(node: &PeerNode, path: &Path) -> Result<()> {
    let content = tokio::fs::read_to_string(path).await?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("not a file path"))?;

    let summary = node.broadcast_file(&filename, &content).await?;
    println!("✓ Announced {} to {} peers", filename, summary.delivered.len());
    Ok(())
}

fn print_peers(node: &PeerNode) {
    let connections = node.connections();
    if connections.is_empty() {
        println!("No connected peers");
        return;
    }

    println!("{:<24} {:<16} {:<20} {:>8}", "ADDRESS", "NAME", "LAST ACTIVE", "MESSAGES");
    for connection in connections {
        println!(
            "{:<24} {:<16} {:<20} {:>8}",
            connection.address,
            connection.display_name,
            connection.last_active.format("%Y-%m-%d %H:%M:%S"),
            connection.messages
        );
    }
}

async fn print_events(mut events: broadcast::Receiver<NodeEvent>) {
    loop {
        match events.recv().await {
            Ok(NodeEvent::PeerConnected { address }) => println!("* connected to {address}"),
            Ok(NodeEvent::PeerDisconnected { address }) => println!("* disconnected from {address}"),
            Ok(NodeEvent::MessageReceived { envelope, .. }) => {
                println!("[{}]: {}", envelope.sender(), envelope.content());
            }
            Ok(NodeEvent::FileAnnounced { envelope, .. }) => println!(
                "* {} shared '{}' ({} bytes)",
                envelope.sender(),
                envelope.filename().unwrap_or_default(),
                envelope.content().len()
            ),
            Ok(NodeEvent::Diagnostic { .. }) => {}
            Err(RecvError::Lagged(skipped)) => warn!("Console skipped {} node events", skipped),
            Err(RecvError::Closed) => return,
        }
    }
}

async fn handle_discover_command(server: &str) -> Result<()> {
    let peers = fetch_peers(server, DISCOVERY_TIMEOUT).await?;
    if peers.is_empty() {
        println!("{server} knows no peers");
    }
    for peer in peers {
        println!("{peer}");
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &NodeConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = NodeConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                NodeConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { section } => {
            if let Some(section_name) = section {
                let table = toml::Value::try_from(config)?;
                let section = table
                    .get(&section_name)
                    .ok_or_else(|| anyhow::anyhow!("Unknown section: {}", section_name))?;
                println!("[{section_name}]");
                println!("{}", toml::to_string_pretty(section)?);
            } else {
                println!("{}", config.to_toml_string()?);
            }
        }
    }
    Ok(())
}
