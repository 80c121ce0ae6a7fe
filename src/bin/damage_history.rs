//! damage_history - print recent damage records
//!
//! Reads the roadwatch database and prints the most recently observed
//! records, newest first.

use anyhow::Result;
use clap::Parser;

use roadwatch::{DamageRecordStore, SqliteDamageStore};

#[derive(Parser, Debug)]
#[command(name = "damage_history", about = "List recent road damage records")]
struct Args {
    /// Path to the roadwatch database.
    #[arg(long, env = "ROADWATCH_DB_PATH", default_value = "road_damage.db")]
    db: String,

    /// Maximum number of records to print.
    #[arg(long, default_value_t = 10)]
    limit: usize,

    /// Print records as JSON lines instead of text.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args = Args::parse();
    let store = SqliteDamageStore::open(&args.db)?;
    let records = store.list_recent(args.limit)?;

    if records.is_empty() {
        println!("no damage records in {}", args.db);
        return Ok(());
    }

    for rec in records {
        if args.json {
            println!("{}", serde_json::to_string(&rec)?);
            continue;
        }
        let (severity, recommendation) = match &rec.verdict {
            Some(v) => (v.severity.as_str(), v.recommendation.as_str()),
            None => ("n/a", "pending analysis"),
        };
        println!(
            "{} - {} #{} (confidence: {:.2}, severity: {})",
            rec.observed_at, rec.damage_type, rec.track_id, rec.confidence, severity
        );
        println!("  location: ({}, {}) - ({}, {})", rec.location.x1, rec.location.y1, rec.location.x2, rec.location.y2);
        println!("  recommendation: {}", recommendation);
    }
    Ok(())
}
