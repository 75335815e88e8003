//! Entry point: load configuration, wire every component, serve HTTP.

use bridge_core::BridgeConfig;
use bridge_gateway::probe::GrpcHealthCheck;
use bridge_gateway::{router, GatewayState};
use bridge_registry::HealthProber;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = BridgeConfig::load()?;
    let listen_addr: SocketAddr = config.listen_addr.parse()?;
    let registry_shards = config.registry_shards;
    let probe_interval = Duration::from_millis(config.health_probe_interval_ms);
    let probe_timeout = Duration::from_millis(config.health_probe_timeout_ms);
    let probe_backoff_cap = Duration::from_millis(config.health_backoff_max_ms);

    let (state, mut telemetry_rx) = GatewayState::new(config);

    let checker = Arc::new(GrpcHealthCheck::new(state.invoker.clone(), probe_timeout));
    let prober = Arc::new(HealthProber::new(state.registry.clone(), checker, probe_interval, probe_backoff_cap));
    prober.spawn(registry_shards);

    tokio::spawn(async move {
        while let Some(event) = telemetry_rx.recv().await {
            tracing::debug!(
                request_id = %event.request_id,
                service = %event.service,
                method = %event.method,
                status = %event.status,
                latency_ms = event.latency_ms,
                cache_state = %event.cache_state,
                "observation"
            );
        }
    });

    let app = router::build(state);
    info!("bridge gateway listening on {}", listen_addr);
    let listener = TcpListener::bind(listen_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
