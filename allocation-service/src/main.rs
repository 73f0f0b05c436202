use std::process::ExitCode;

use allocation_service::{
    cli::{self, Command},
    config::{AppConfig, SourceKind},
    metrics_export, observability,
    sources::{CsvSnapshotSource, PgSnapshotSource, SnapshotSource},
};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    observability::init_tracing();

    let command = Command::parse(std::env::args().skip(1))?;

    // Load configuration
    let cfg = AppConfig::load()?;

    if cfg.metrics.is_some() {
        metrics_export::init()?;
    }

    let source: Box<dyn SnapshotSource> = match cfg.snapshot.kind {
        SourceKind::Csv => Box::new(CsvSnapshotSource::new(&cfg.snapshot.csv_dir)),
        SourceKind::Postgres => {
            let db = cfg
                .database
                .as_ref()
                .context("snapshot.kind = \"postgres\" requires a [database] section")?;
            // Schema is expected to be applied out-of-band via `sql/schema/*.sql`.
            let pool = PgPoolOptions::new()
                .max_connections(db.max_connections)
                .connect(&db.uri)
                .await?;
            Box::new(PgSnapshotSource::new(pool))
        }
    };

    let outcome = cli::run(source.as_ref(), &command, cfg.allocation.remainder_policy).await;
    let written = cli::write_outcome(outcome, &mut std::io::stdout().lock(), &mut std::io::stderr().lock());

    // metrics are flushed for failed runs too
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_export::write_textfile(&metrics_cfg.textfile_path)?;
    }

    if written? {
        info!(property_id = %command.property_id(), "report written");
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::FAILURE)
    }
}
