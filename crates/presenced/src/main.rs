use anyhow::Result;
use tracing_subscriber::EnvFilter;

use presenced::config::Config;
use presenced::ledger::AttendanceLedger;
use presenced::store::GalleryStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("presenced starting");

    let config = Config::from_env();
    let store = GalleryStore::open(&config.db_path).await?;
    let ledger = AttendanceLedger::open(&config.db_path).await?;

    tracing::info!(
        db = %config.db_path.display(),
        gallery_entries = store.count().await?,
        attendance_events = ledger.count().await?,
        similarity_threshold = config.similarity_threshold,
        liveness_threshold = config.liveness_threshold,
        "presenced ready"
    );

    // The detector and embedding model backends are wired in by the
    // deployment-specific capture frontend, which calls engine::spawn_engine
    // with this store and ledger and drives EngineHandle::decide per frame.

    tokio::signal::ctrl_c().await?;
    tracing::info!("presenced shutting down");

    Ok(())
}
