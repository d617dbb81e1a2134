//! `presence` — operator CLI for the attendance gallery and ledger.
//!
//! Enrollment takes a precomputed embedding descriptor (a JSON array of
//! 512 floats, as produced by the recognition model export); the CLI never
//! runs inference itself.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use presence_core::Embedding;
use presenced::config::Config;
use presenced::ledger::AttendanceLedger;
use presenced::store::GalleryStore;

#[derive(Parser)]
#[command(name = "presence", about = "Presence attendance administration")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Enroll an embedding descriptor for an identity.
    Enroll {
        /// Identity key the embedding belongs to.
        #[arg(long)]
        identity: String,
        /// Path to a JSON array of 512 floats.
        #[arg(long)]
        descriptor: std::path::PathBuf,
        /// Capture quality score, if known.
        #[arg(long)]
        quality: Option<f32>,
        /// Free-form source tag (e.g. the enrolling kiosk).
        #[arg(long)]
        source: Option<String>,
    },
    /// List enrolled gallery entries as JSON.
    List {
        /// Restrict to one identity.
        #[arg(long)]
        identity: Option<String>,
    },
    /// Remove a gallery entry by ID.
    Remove {
        #[arg(long)]
        id: String,
    },
    /// Show attendance records for a date (default: today).
    Attendance {
        /// Date as YYYY-MM-DD.
        #[arg(long)]
        date: Option<NaiveDate>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Command::Enroll {
            identity,
            descriptor,
            quality,
            source,
        } => {
            let raw = read_descriptor(&descriptor)?;
            let embedding = Embedding::from_raw(raw, None)
                .with_context(|| format!("invalid descriptor in {}", descriptor.display()))?;

            let store = GalleryStore::open(&config.db_path).await?;
            let id = store
                .append(&identity, &embedding, quality, source.as_deref())
                .await?;
            tracing::info!(identity, id, "descriptor enrolled");
            println!("{id}");
        }
        Command::List { identity } => {
            let store = GalleryStore::open(&config.db_path).await?;
            let entries = store.list(identity.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::Remove { id } => {
            let store = GalleryStore::open(&config.db_path).await?;
            if !store.remove(&id).await? {
                bail!("no gallery entry with id {id}");
            }
            tracing::info!(id, "gallery entry removed");
            println!("removed {id}");
        }
        Command::Attendance { date } => {
            let date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let ledger = AttendanceLedger::open(&config.db_path).await?;
            let records = ledger.records_on(date).await?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}

fn read_descriptor(path: &std::path::Path) -> Result<Vec<f32>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let values: Vec<f32> = serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of numbers", path.display()))?;
    Ok(values)
}
