//! Shared setup for store integration tests.
//!
//! Each test gets its own SQLite file in a temporary directory; the directory
//! is removed when the returned `TempDir` is dropped.

#![allow(dead_code)]

use noebs_store::database::store::now_timestamp;
use noebs_store::database::{init_pool, PoolConfig};
use noebs_store::{DataCodec, Dialect, Store};
use sqlx::AnyPool;
use tempfile::TempDir;

pub const TENANT: &str = "default";
pub const OTHER_TENANT: &str = "acme";
pub const DATA_KEY: &str = "integration-test-data-key";

pub fn sqlite_url(dir: &TempDir) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join("store.db").display())
}

/// Open a pool on a fresh SQLite file without running migrations.
pub async fn raw_pool() -> (TempDir, AnyPool) {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = PoolConfig {
        max_connections: 1,
        ..PoolConfig::default()
    };
    let (pool, dialect) = init_pool(&sqlite_url(&dir), Some(config))
        .await
        .expect("sqlite pool");
    assert_eq!(dialect, Dialect::Sqlite);
    (dir, pool)
}

pub async fn store_with(codec: DataCodec) -> (TempDir, Store) {
    let (dir, pool) = raw_pool().await;
    let store = Store::new(pool, Dialect::Sqlite, codec);
    store.migrate(TENANT).await.expect("migrate");
    (dir, store)
}

pub async fn encrypted_store() -> (TempDir, Store) {
    store_with(DataCodec::new(DATA_KEY)).await
}

/// Insert a card the way rows looked before field encryption existed.
pub async fn insert_legacy_card(store: &Store, tenant_id: &str, user_id: i64, pan: &str) -> i64 {
    let now = now_timestamp();
    sqlx::query_scalar(
        "INSERT INTO cards (tenant_id, user_id, pan, expiry, name, is_main, created_at, updated_at)
         VALUES ($1, $2, $3, '2612', 'legacy', 0, $4, $5)
         RETURNING id",
    )
    .bind(tenant_id)
    .bind(user_id)
    .bind(pan)
    .bind(&now)
    .bind(&now)
    .fetch_one(store.pool())
    .await
    .expect("insert legacy card")
}

/// The stored `(pan, pan_enc)` pair of a card row.
pub async fn stored_card_pan(store: &Store, id: i64) -> (String, Option<String>) {
    sqlx::query_as("SELECT pan, pan_enc FROM cards WHERE id = $1")
        .bind(id)
        .fetch_one(store.pool())
        .await
        .expect("card row")
}

pub async fn main_card_ids(store: &Store, tenant_id: &str, user_id: i64) -> Vec<i64> {
    sqlx::query_scalar(
        "SELECT id FROM cards WHERE tenant_id = $1 AND user_id = $2 AND is_main = 1 ORDER BY id",
    )
    .bind(tenant_id)
    .bind(user_id)
    .fetch_all(store.pool())
    .await
    .expect("main cards")
}
