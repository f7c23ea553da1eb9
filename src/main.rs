use anyhow::Context;
use noebs_store::config::AppConfig;
use noebs_store::logging::init_tracing;
use noebs_store::Store;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to load configuration")?;
    init_tracing(&config.logging);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e).context("invalid configuration");
    }

    info!(
        dialect = config.database.dialect().map(|d| d.as_str()).unwrap_or("unknown"),
        encryption_enabled = config.encryption.encryption_enabled(),
        default_tenant = %config.encryption.default_tenant,
        "Starting noebs store"
    );

    let store = Store::connect(&config)
        .await
        .context("failed to connect to database")?;

    let report = match store.migrate(&config.encryption.default_tenant).await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Schema migration failed; aborting startup");
            return Err(e).context("schema migration failed");
        }
    };

    if report.is_noop() {
        info!("Schema already up to date");
    } else {
        info!(
            columns_added = ?report.columns_added,
            tenant_rows_backfilled = report.tenant_rows_backfilled,
            "Schema migrated"
        );
    }

    let stats = store.migration_stats();
    info!(
        migrated = stats.migrated,
        backfill_failed = stats.backfill_failed,
        "Store ready"
    );

    store.pool().close().await;
    Ok(())
}
