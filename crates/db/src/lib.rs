//! Postgres bootstrap for the participant stores.
//!
//! Each saga participant exclusively owns one database (products with the
//! reservation log, orders, or payments). This crate builds the bounded
//! connection pool for that store and brings its schema up to date before
//! any command handler runs.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use app_config::AppConfig;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use tokio::fs;
use tokio_postgres::{Client, Config as PgConfig, NoTls};
use tracing::{info, warn};

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_BACKOFF: Duration = Duration::from_secs(1);
const MIGRATIONS_DIR: &str = "./migrations";

/// Builds the participant's connection pool, waits for the store to come
/// up, and applies pending schema migrations.
///
/// # Errors
/// Fails when the store stays unreachable or a migration cannot be
/// applied.
pub async fn init_db_pool(cfg: &AppConfig) -> Result<Pool> {
    let pg_config: PgConfig = cfg.db_dsn().parse().context("Failed to parse Postgres DSN")?;

    let mgr = Manager::from_config(
        pg_config,
        NoTls,
        ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        },
    );
    let pool = Pool::builder(mgr)
        .max_size(cfg.db_max_open)
        .runtime(Runtime::Tokio1)
        .build()
        .context("Failed to create database pool")?;

    let client = wait_for_store(&pool).await?;
    if fs::metadata(MIGRATIONS_DIR).await.is_ok() {
        apply_migrations(&client, MIGRATIONS_DIR).await?;
    } else {
        warn!(
            "migrations directory {MIGRATIONS_DIR} missing, store schema left as-is"
        );
    }
    Ok(pool)
}

/// The store may come up after the service (container start ordering), so
/// a handler must not consume commands before the schema exists. Polls
/// until a connection succeeds or the attempts run out.
async fn wait_for_store(pool: &Pool) -> Result<Object> {
    for attempt in 1..=CONNECT_ATTEMPTS {
        match pool.get().await {
            Ok(client) => {
                info!(attempt, "participant store reachable");
                return Ok(client);
            }
            Err(e) if attempt < CONNECT_ATTEMPTS => {
                warn!(
                    attempt,
                    "store not ready ({e}), next try in {}s",
                    CONNECT_BACKOFF.as_secs()
                );
                tokio::time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => {
                return Err(e).context("participant store unreachable, giving up");
            }
        }
    }
    bail!("participant store unreachable after {CONNECT_ATTEMPTS} attempts")
}

/// Applies every `.sql` script under `dir` in name order. Scripts are
/// written to be re-runnable (`CREATE TABLE IF NOT EXISTS`), so applying
/// on every boot is safe.
pub async fn apply_migrations(client: &Client, dir: &str) -> Result<()> {
    let mut entries = fs::read_dir(dir)
        .await
        .context("Failed to read migrations directory")?;

    let mut scripts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "sql") {
            scripts.push(path);
        }
    }
    scripts.sort();

    for script in scripts {
        let name = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let sql = fs::read_to_string(&script)
            .await
            .with_context(|| format!("read migration {name}"))?;
        client
            .batch_execute(&sql)
            .await
            .with_context(|| format!("apply migration {name}"))?;
        info!(migration = %name, "store schema migration applied");
    }
    Ok(())
}
