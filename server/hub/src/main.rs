mod calltracker;
mod config;
mod envelope;
mod hbrp;
mod openbridge;
mod parrot;
mod session;
mod subscription;
mod udp;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tokio::net::UdpSocket;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

use rx_bus::{topics, MemoryBus, MemorySessionStore, MessageBus, SessionStore};
use rx_control::{HubRepo, PgHubRepo};
use rx_metrics::{HubMetrics, MetricsExporter};

use crate::calltracker::CallTracker;
use crate::config::Config;
use crate::hbrp::HbrpServer;
use crate::openbridge::OpenBridgeServer;
use crate::parrot::Parrot;
use crate::session::Sessions;
use crate::subscription::SubscriptionManager;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    let cfg = Config::parse();

    // Metrics
    let exporter = MetricsExporter::install(&cfg.metrics_listen)?;
    tokio::spawn(async move {
        if let Err(e) = exporter.run().await {
            warn!("metrics endpoint failed: {e}");
        }
    });
    let hub_metrics = HubMetrics::new("rx");

    // Postgres
    let pool = PgPoolOptions::new()
        .max_connections(32)
        .connect(&cfg.database_url)
        .await
        .context("connect postgres")?;

    sqlx::migrate!("../control/migrations").run(&pool).await?;

    let repo: Arc<dyn HubRepo> = Arc::new(PgHubRepo::new(pool));

    // Single-instance session state and fan-out
    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let bus: Arc<dyn MessageBus> = Arc::new(MemoryBus::new());
    let sessions = Sessions::new(store.clone());

    let tracker = CallTracker::new(repo.clone(), bus.clone(), hub_metrics);
    let subs = Arc::new(SubscriptionManager::new(bus.clone(), sessions.clone(), hub_metrics));
    let parrot = Arc::new(Parrot::new(store.clone(), bus.clone(), tracker.clone()));

    // HBRP socket + pipeline
    let hbrp_socket = Arc::new(
        UdpSocket::bind(&cfg.hbrp_listen)
            .await
            .with_context(|| format!("bind hbrp listener {}", cfg.hbrp_listen))?,
    );
    info!("hbrp listening on {}", hbrp_socket.local_addr()?);

    tokio::spawn(udp::run_reader(
        hbrp_socket.clone(),
        bus.clone(),
        topics::HBRP_INCOMING,
        udp::Proto::Hbrp,
        hub_metrics,
    ));
    tokio::spawn(udp::run_sender(
        hbrp_socket.clone(),
        bus.clone(),
        topics::HBRP_OUTGOING,
        udp::Proto::Hbrp,
        hub_metrics,
    ));
    tokio::spawn(udp::run_noaddr_resolver(bus.clone(), sessions.clone()));

    let hbrp = Arc::new(HbrpServer::new(
        repo.clone(),
        sessions.clone(),
        bus.clone(),
        tracker.clone(),
        parrot.clone(),
        subs.clone(),
        hub_metrics,
    ));
    for _ in 0..cfg.workers {
        tokio::spawn(hbrp.clone().run_dispatcher());
    }

    // OpenBridge socket + pipeline
    let ob_socket = Arc::new(
        UdpSocket::bind(&cfg.openbridge_listen)
            .await
            .with_context(|| format!("bind openbridge listener {}", cfg.openbridge_listen))?,
    );
    info!("openbridge listening on {}", ob_socket.local_addr()?);

    tokio::spawn(udp::run_reader(
        ob_socket.clone(),
        bus.clone(),
        topics::OPENBRIDGE_INCOMING,
        udp::Proto::OpenBridge,
        hub_metrics,
    ));
    tokio::spawn(udp::run_sender(
        ob_socket.clone(),
        bus.clone(),
        topics::OPENBRIDGE_OUTGOING,
        udp::Proto::OpenBridge,
        hub_metrics,
    ));

    let openbridge = Arc::new(OpenBridgeServer::new(repo.clone(), bus.clone(), hub_metrics));
    tokio::spawn(openbridge.clone().run_ingress());
    tokio::spawn(openbridge.clone().run_local_egress());

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, closing repeater sessions");
    hbrp.shutdown().await;

    Ok(())
}
