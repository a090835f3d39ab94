use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tiered_netcore::config::NetworkConfig;
use tiered_netcore::protocol::consumer::WorkConsumer;
use tiered_netcore::protocol::dispatcher::OpcodeTable;
use tiered_netcore::protocol::handshake::{install_lobby, ServerTable};
use tiered_netcore::protocol::message::{work_queue, ControlMessage, ControlOpcode};
use tiered_netcore::transport::jobs::spawn_heartbeat_jobs;
use tiered_netcore::utils::logging::init_logging;
use tiered_netcore::{ConnectionRegistry, Listener, ProtocolTier, Result, Tier, TierBuilder};

#[derive(Debug, Parser)]
#[command(name = "tiered-netcore", version, about = "Lobby, login and world listeners")]
struct Args {
    /// TOML configuration file; defaults plus TIERED_NETCORE_* overrides when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn log_control(message: &ControlMessage) -> Result<()> {
    info!(
        opcode = %message.opcode,
        connection_id = ?message.connection_id(),
        name = ?message.name(),
        "control message"
    );
    Ok(())
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if args.print_config {
        println!("{}", NetworkConfig::example_config());
        return;
    }

    if let Err(e) = run(args).await {
        error!(error = %e, "server failed");
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let config = match &args.config {
        Some(path) => NetworkConfig::from_file(path)?,
        None => NetworkConfig::from_env()?,
    };
    config.validate_strict()?;
    init_logging(&config.logging)?;

    let stop = CancellationToken::new();
    let (queue, rx) = work_queue();
    let registry = ConnectionRegistry::with_work_queue(queue.clone());

    let world = TierBuilder::from_config(ProtocolTier::World, &config)?
        .work_queue(queue)
        .build();
    let login = TierBuilder::from_config(ProtocolTier::Login, &config)?.build();
    let lobby = install_lobby(
        TierBuilder::from_config(ProtocolTier::Lobby, &config)?,
        Arc::clone(&login),
        Arc::new(ServerTable::default()),
    )
    .build();

    let mut listeners: Vec<JoinHandle<Result<()>>> = Vec::new();
    for (tier, settings) in [
        (world, &config.tiers.world),
        (login, &config.tiers.login),
        (lobby, &config.tiers.lobby),
    ] {
        if !settings.enabled {
            warn!(tier = %tier.kind(), "tier disabled");
            continue;
        }
        let listener = Listener::bind(&settings.address, tier, Arc::clone(&registry), stop.clone())
            .await?
            .with_shutdown_timeout(config.transport.shutdown_timeout);
        listeners.push(listener.spawn());
    }

    let jobs = spawn_heartbeat_jobs(Arc::clone(&registry), &config.heartbeat, stop.clone());

    let consumer = WorkConsumer::new(Arc::clone(&registry), OpcodeTable::new())
        .on_control(ControlOpcode::NewConnection, log_control)
        .on_control(ControlOpcode::CleanupUser, log_control)
        .on_control(ControlOpcode::HeartbeatReaped, log_control);
    let consumer = tokio::spawn(consumer.run(rx, stop.clone()));

    let metrics_registry = Arc::clone(&registry);
    let metrics_stop = stop.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = metrics_stop.cancelled() => break,
                _ = ticker.tick() => metrics_registry.metrics().log_metrics(),
            }
        }
    });

    info!("server running, press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
    }
    info!("shutting down");
    stop.cancel();

    for handle in listeners {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "listener failed"),
            Err(e) => error!(error = %e, "listener task panicked"),
        }
    }
    for job in jobs {
        let _ = job.await;
    }
    let _ = consumer.await;
    registry.metrics().log_metrics();
    Ok(())
}
