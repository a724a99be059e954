//! Driver Points Ledger Service
//! Mission: Own every mutation of driver point balances, with a full
//! append-only audit trail behind a small REST facade.

use anyhow::{Context, Result};
use clap::Parser;
use dotenv::dotenv;
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use driverpoints_backend::api::create_router;
use driverpoints_backend::models::SponsorLimits;
use driverpoints_backend::LedgerService;

#[derive(Parser, Debug)]
#[command(name = "driverpoints", about = "Driver points ledger service")]
struct Args {
    /// Path to the ledger SQLite database
    #[arg(long, env = "DRIVERPOINTS_DB", default_value = "driverpoints.db")]
    db_path: String,

    /// Address to serve the API on
    #[arg(long, env = "DRIVERPOINTS_BIND", default_value = "0.0.0.0:8080")]
    bind: SocketAddr,

    /// Address for the Prometheus metrics endpoint
    #[arg(long, env = "DRIVERPOINTS_METRICS_BIND", default_value = "0.0.0.0:9090")]
    metrics_bind: SocketAddr,

    /// Optional TOML file with per-sponsor limit defaults, applied only to
    /// sponsors that have no configuration yet
    #[arg(long, env = "DRIVERPOINTS_LIMITS_FILE")]
    limits_file: Option<PathBuf>,
}

/// Per-sponsor limit defaults loaded at startup.
#[derive(Debug, Deserialize)]
struct LimitsFile {
    #[serde(default)]
    sponsor: Vec<LimitsEntry>,
}

#[derive(Debug, Deserialize)]
struct LimitsEntry {
    sponsor_id: String,
    min_points_per_txn: i64,
    max_points_per_txn: i64,
    point_value_cents: i64,
    refund_window_days: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    PrometheusBuilder::new()
        .with_http_listener(args.metrics_bind)
        .install()
        .context("install prometheus exporter")?;

    let ledger = Arc::new(LedgerService::open(&args.db_path).context("open ledger")?);
    info!(db_path = %args.db_path, "ledger opened");

    if let Some(path) = &args.limits_file {
        seed_limits(&ledger, path).await?;
    }

    let app = create_router(ledger)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(addr = %args.bind, metrics = %args.metrics_bind, "ledger service listening");

    axum::serve(listener, app).await.context("serve api")?;
    Ok(())
}

/// Apply limit defaults from file to sponsors with no configuration yet.
/// Never overwrites values a sponsor admin has already set.
async fn seed_limits(ledger: &LedgerService, path: &PathBuf) -> Result<()> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read limits file {}", path.display()))?;
    let file: LimitsFile = toml::from_str(&raw).context("parse limits file")?;

    for entry in file.sponsor {
        match ledger.limits_configured(&entry.sponsor_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                warn!(sponsor_id = %entry.sponsor_id, error = %e, "failed to check limits");
                continue;
            }
        }

        let limits = SponsorLimits {
            sponsor_id: entry.sponsor_id.clone(),
            min_points_per_txn: entry.min_points_per_txn,
            max_points_per_txn: entry.max_points_per_txn,
            point_value_cents: entry.point_value_cents,
            refund_window_days: entry.refund_window_days,
            updated_at: chrono::Utc::now(),
        };
        if let Err(e) = ledger.set_limits(&limits).await {
            warn!(sponsor_id = %entry.sponsor_id, error = %e, "failed to seed limits");
        } else {
            info!(sponsor_id = %entry.sponsor_id, "seeded sponsor limits");
        }
    }
    Ok(())
}
