use anyhow::Context;

use tally_infra::SqliteConnector;
use tally_sync::{CountEngine, EngineConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tally_observability::init();

    let database_url = std::env::var("TALLY_DATABASE_URL").unwrap_or_else(|_| {
        tracing::warn!("TALLY_DATABASE_URL not set; using ./tally.db");
        "sqlite://tally.db".to_string()
    });

    let config = match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read config file {path}"))?;
            EngineConfig::from_json_str(&raw).with_context(|| format!("invalid config in {path}"))?
        }
        None => EngineConfig::default(),
    };

    let connector = SqliteConnector::from_url(&database_url)
        .with_context(|| format!("invalid database url {database_url}"))?;
    let engine = CountEngine::new(connector, config)?;

    match engine.open_latest_session().await? {
        Some(session) => tracing::info!(
            session_id = %session.id,
            name = %session.name,
            items = engine.snapshot().len(),
            "attached to active session"
        ),
        None => tracing::warn!("no active session; waiting for one to be started"),
    }

    engine.on_snapshot_ready(|ready| {
        let k = &ready.kpis;
        tracing::info!(
            origin = ?ready.origin,
            total = k.total,
            counted = k.counted,
            pending = k.pending,
            progress_pct = k.progress_pct,
            accuracy_pct = k.accuracy_pct,
            shortages = k.shortages,
            overages = k.overages,
            "snapshot ready"
        );
    });

    engine.start();
    tracing::info!("tally running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    engine.shutdown().await?;
    Ok(())
}
