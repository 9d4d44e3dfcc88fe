//! WolfElect - Leader Election over a Coordination Service
//!
//! Command line front end: configuration management, joining an election
//! on a ZooKeeper ensemble and an in-memory election simulation.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolfelect::config::WolfElectConfig;
use wolfelect::coordination::{MemoryClient, MemoryCoordinator, ZkConnector};
use wolfelect::election::Notification;
use wolfelect::error::Result;
use wolfelect::Participant;

/// WolfElect - Leader Election over a Coordination Service
#[derive(Parser)]
#[command(name = "wolfelect")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolfelect.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolfelect.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,

    /// Join the configured election and report leadership changes
    Run {
        /// Print notifications as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Run an election among local participants on an in-memory service
    Simulate {
        /// Number of participants
        #[arg(short, long, default_value_t = 3)]
        participants: usize,

        /// Number of leader failovers to run
        #[arg(short, long, default_value_t = 2)]
        rounds: usize,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // A readable config decides logging unless overridden on the command line
    let logging = WolfElectConfig::from_file(&cli.config)
        .map(|c| c.logging)
        .unwrap_or_default();
    init_logging(
        cli.log_level.as_deref().unwrap_or(&logging.level),
        cli.log_format.as_deref().unwrap_or(&logging.format),
    );

    match cli.command {
        Commands::Init { output, node_id } => run_init(output, node_id),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Run { json } => run_join(cli.config, json).await,
        Commands::Simulate {
            participants,
            rounds,
            json,
        } => run_simulate(cli.config, participants, rounds, json).await,
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Create a configuration file
fn run_init(output: PathBuf, node_id: String) -> Result<()> {
    let config_content = format!(
        r#"# WolfElect Configuration
# Generated configuration file

[node]
id = "{node_id}"

[coordination]
addresses = ["localhost:2181"]
# addresses = ["zk-1.example.com:2181", "zk-2.example.com:2181", "zk-3.example.com:2181"]
session_timeout_ms = 1000

[election]
path = "/ElectMaster"
ticket_prefix = "node-"
poll_interval_ms = 333

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to point at your coordination service.");
    println!("Then try it with: wolfelect --config {} simulate", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfElectConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Servers: {}", config.coordination.addresses.join(","));
            println!("  Election Path: {}", config.election.path);
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfElectConfig::from_file(&config_path)?;

    println!("WolfElect Node Information");
    println!("==========================");
    println!();
    println!("Node ID:          {}", config.node.id);
    println!();
    println!("Coordination Service:");
    for address in &config.coordination.addresses {
        println!("  Server:         {}", address);
    }
    println!("  Session Timeout: {:?}", config.session_timeout());
    println!();
    println!("Election:");
    println!("  Path:           {}", config.election.path);
    println!("  Ticket Prefix:  {}", config.election.ticket_prefix);
    println!("  Poll Interval:  {:?}", config.poll_interval());

    Ok(())
}

/// Join the election and report notifications until Ctrl+C
async fn run_join(config_path: PathBuf, json: bool) -> Result<()> {
    tracing::info!("Starting WolfElect participant...");

    let config = match WolfElectConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    let mut participant = match Participant::connect(&config, &ZkConnector::new()).await {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("Failed to join election at {}: {}", config.election.path, e);
            return Err(e);
        }
    };
    let Some(mut notifications) = participant.notifications() else {
        participant.close().await?;
        return Err(wolfelect::Error::ShuttingDown);
    };

    let started = Instant::now();
    tracing::info!(
        "Node {} joined election {} on {}",
        config.node.id,
        config.election.path,
        config.coordination.addresses.join(",")
    );

    loop {
        tokio::select! {
            event = notifications.recv() => {
                let Some(event) = event else {
                    tracing::warn!("Election ended: notification stream closed");
                    break;
                };
                report(
                    &SimEvent {
                        elapsed_ms: started.elapsed().as_millis(),
                        node: config.node.id.clone(),
                        event,
                    },
                    json,
                );
                if event == Notification::Leader {
                    if let Ok(Some(leader)) = participant.current_leader().await {
                        tracing::info!("Leading with ticket {}", leader.ticket);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    // Close drains the remaining notifications itself
    drop(notifications);
    participant.close().await?;
    tracing::info!("Left election {}", config.election.path);
    Ok(())
}

fn report(event: &SimEvent, json: bool) {
    if json {
        match serde_json::to_string(event) {
            Ok(line) => println!("{}", line),
            Err(e) => tracing::error!("Failed to encode event: {}", e),
        }
    } else {
        println!("[{:>6} ms] {:<12} {}", event.elapsed_ms, event.node, event.event);
    }
}

/// One observed notification
#[derive(Debug, Serialize)]
struct SimEvent {
    elapsed_ms: u128,
    node: String,
    event: Notification,
}

/// Run an election among local participants and fail over the leader
async fn run_simulate(
    config_path: PathBuf,
    participants: usize,
    rounds: usize,
    json: bool,
) -> Result<()> {
    let base = if config_path.exists() {
        WolfElectConfig::from_file(&config_path)?
    } else {
        tracing::info!("{:?} not found, simulating with defaults", config_path);
        WolfElectConfig::new(
            vec!["memory".to_string()],
            Duration::from_secs(1),
            "/ElectMaster",
        )
        .with_node_id("node")
    };

    let participants = participants.max(1);
    let rounds = rounds.min(participants - 1);
    tracing::info!(
        "Simulating {} participants on {} with {} failovers",
        participants,
        base.election.path,
        rounds
    );

    let coordinator = MemoryCoordinator::new();
    let started = Instant::now();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<SimEvent>();

    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            report(&event, json);
        }
    });

    let mut members: Vec<Participant<MemoryClient>> = Vec::with_capacity(participants);
    for i in 0..participants {
        let config = base.clone().with_node_id(format!("{}-{}", base.node.id, i));
        let mut participant = Participant::connect(&config, &coordinator).await?;

        if let Some(mut notifications) = participant.notifications() {
            let tx = event_tx.clone();
            let node = participant.id().to_string();
            tokio::spawn(async move {
                while let Some(event) = notifications.recv().await {
                    let _ = tx.send(SimEvent {
                        elapsed_ms: started.elapsed().as_millis(),
                        node: node.clone(),
                        event,
                    });
                }
            });
        }
        members.push(participant);
    }
    drop(event_tx);

    // A leader's close runs on its own task so Ctrl+C cannot cut it short
    let mut leaving: Option<JoinHandle<Result<()>>> = None;

    let failovers = async {
        for round in 0..=rounds {
            let Some(index) = wait_for_leader(&members, base.poll_interval()).await else {
                tracing::warn!("No leader emerged in round {}", round);
                break;
            };
            match members[index].current_leader().await {
                Ok(Some(leader)) => tracing::info!(
                    "Round {}: {} leads with ticket {}",
                    round,
                    leader.node_id,
                    leader.ticket
                ),
                Ok(None) => tracing::warn!("Round {}: election path is empty", round),
                Err(e) => tracing::error!("Round {}: leader lookup failed: {}", round, e),
            }
            if round < rounds {
                let leader = members.remove(index);
                let closing = leaving.insert(tokio::spawn(leader.close()));
                let closed = closing.await;
                leaving = None;
                log_close(closed);
            }
        }
        Ok::<(), wolfelect::Error>(())
    };

    tokio::select! {
        result = failovers => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    if let Some(closing) = leaving.take() {
        log_close(closing.await);
    }
    let closed = futures::future::join_all(members.into_iter().map(Participant::close)).await;
    for result in closed {
        if let Err(e) = result {
            tracing::error!("Failed to leave election: {}", e);
        }
    }
    if let Err(e) = printer.await {
        tracing::error!("Event printer failed: {}", e);
    }

    tracing::info!("Simulation finished");
    Ok(())
}

fn log_close(closed: std::result::Result<Result<()>, JoinError>) {
    match closed {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("Failed to leave election: {}", e),
        Err(e) => tracing::error!("Leader close task failed: {}", e),
    }
}

/// Poll until one participant reports leadership
async fn wait_for_leader(
    members: &[Participant<MemoryClient>],
    poll: Duration,
) -> Option<usize> {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if let Some(index) = members.iter().position(|p| p.is_leader()) {
            return Some(index);
        }
        tokio::time::sleep(poll.min(Duration::from_millis(50))).await;
    }
    None
}
