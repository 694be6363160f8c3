//! Run the sales ETL in the mode selected by `MODE`.
use anyhow::{bail, Context};
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use etl_common::cancel::CancelToken;
use etl_pipeline::config::{Config, Mode};
use etl_staging::StagingWriter;
use etl_warehouse::{reset_warehouse, WarehouseLoader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().context("invalid configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .connect_lazy(&config.database_url)
        .context("failed to create postgres pool")?;

    if config.run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        info!("migrations applied");
    }

    // First Ctrl-C asks steps to stop at the next boundary, a second one
    // escalates so a stuck step can be abandoned.
    let cancel = CancelToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        loop {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            let state = signal_token.request_stop();
            warn!(?state, "shutdown requested");
        }
    });

    match config.mode {
        Mode::Load => {
            let loader = WarehouseLoader::with_pool(pool);
            match loader.run_cycle(config.force_load, &cancel).await? {
                Some(report) => info!(facts = report.facts_inserted, "load cycle finished"),
                None => info!("load cycle skipped by gate"),
            }
        }
        Mode::ResetStaging => {
            if config.reset_confirm != "YES" {
                bail!("MODE=reset-staging requires RESET_CONFIRM=YES");
            }
            let staging = StagingWriter::with_pool(pool, config.batch_size);
            staging.reset_staging_all().await?;
        }
        Mode::ResetWarehouse => {
            reset_warehouse(&pool, &config.reset_confirm).await?;
        }
        Mode::Pipeline => {
            // Extraction adapters are wired by the embedding deployment
            // through the library API; the bare binary cannot reach the
            // source systems.
            bail!(
                "MODE=pipeline needs source adapters wired via etl_pipeline::Pipeline; \
                 use MODE=load to process already-staged rows"
            );
        }
    }

    Ok(())
}
