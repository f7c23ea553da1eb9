//! Schema migrations.
//!
//! Runs once at startup, before the store takes traffic. Each step runs in its
//! own transaction and every change is guarded by an existence check, so a
//! second run against a migrated database changes nothing.

use sqlx::{AnyConnection, AnyPool};
use tracing::info;

use super::error::{StoreError, StoreErrorKind, StoreResult};
use super::hydrator::SENSITIVE_COLUMNS;
use super::Dialect;
use crate::config::is_valid_tenant_id;

/// Tables that carry a `tenant_id` column.
pub const TENANT_TABLES: [&str; 7] = [
    "users",
    "cards",
    "cache_cards",
    "tokens",
    "transactions",
    "kyc",
    "notifications",
];

/// What a migration run changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// `table.column` for every column added
    pub columns_added: Vec<String>,
    pub tenant_rows_backfilled: u64,
}

impl MigrationReport {
    pub fn is_noop(&self) -> bool {
        self.columns_added.is_empty() && self.tenant_rows_backfilled == 0
    }
}

pub struct MigrationRunner {
    pool: AnyPool,
    dialect: Dialect,
    default_tenant: String,
}

impl MigrationRunner {
    pub fn new(pool: AnyPool, dialect: Dialect, default_tenant: &str) -> StoreResult<Self> {
        // The tenant id is spliced into DDL defaults
        if !is_valid_tenant_id(default_tenant) {
            return Err(StoreError::invalid_input(format!(
                "invalid default tenant id '{}'",
                default_tenant
            )));
        }

        Ok(Self {
            pool,
            dialect,
            default_tenant: default_tenant.to_string(),
        })
    }

    pub async fn run(&self) -> StoreResult<MigrationReport> {
        info!(
            dialect = self.dialect.as_str(),
            default_tenant = %self.default_tenant,
            "Running schema migrations"
        );

        let mut report = MigrationReport::default();

        self.create_tables().await?;
        report
            .columns_added
            .extend(self.add_tenant_columns().await?);
        report.tenant_rows_backfilled = self.backfill_tenant().await?;
        report
            .columns_added
            .extend(self.add_shadow_columns().await?);
        self.create_indexes().await?;

        info!(
            columns_added = report.columns_added.len(),
            tenant_rows_backfilled = report.tenant_rows_backfilled,
            "Schema migrations complete"
        );
        Ok(report)
    }

    async fn create_tables(&self) -> StoreResult<()> {
        const STEP: &str = "create_tables";
        let mut tx = self.pool.begin().await.map_err(|e| step_error(STEP, e))?;

        for ddl in self.table_ddl() {
            sqlx::query(&ddl)
                .execute(&mut *tx)
                .await
                .map_err(|e| step_error(STEP, e))?;
        }

        tx.commit().await.map_err(|e| step_error(STEP, e))
    }

    async fn add_tenant_columns(&self) -> StoreResult<Vec<String>> {
        const STEP: &str = "add_tenant_columns";
        let mut tx = self.pool.begin().await.map_err(|e| step_error(STEP, e))?;
        let mut added = Vec::new();

        for table in TENANT_TABLES {
            if self
                .column_exists(&mut *tx, table, "tenant_id")
                .await
                .map_err(|e| step_error(STEP, e))?
            {
                continue;
            }
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN tenant_id TEXT NOT NULL DEFAULT '{}'",
                table, self.default_tenant
            );
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| step_error(STEP, e))?;
            added.push(format!("{}.tenant_id", table));
        }

        tx.commit().await.map_err(|e| step_error(STEP, e))?;
        Ok(added)
    }

    async fn backfill_tenant(&self) -> StoreResult<u64> {
        const STEP: &str = "backfill_tenant";
        let mut tx = self.pool.begin().await.map_err(|e| step_error(STEP, e))?;
        let mut backfilled = 0;

        for table in TENANT_TABLES {
            let sql = format!(
                "UPDATE {} SET tenant_id = $1 WHERE tenant_id IS NULL OR tenant_id = ''",
                table
            );
            let result = sqlx::query(&sql)
                .bind(&self.default_tenant)
                .execute(&mut *tx)
                .await
                .map_err(|e| step_error(STEP, e))?;
            backfilled += result.rows_affected();
        }

        tx.commit().await.map_err(|e| step_error(STEP, e))?;
        Ok(backfilled)
    }

    async fn add_shadow_columns(&self) -> StoreResult<Vec<String>> {
        const STEP: &str = "add_shadow_columns";
        let mut tx = self.pool.begin().await.map_err(|e| step_error(STEP, e))?;
        let mut added = Vec::new();

        for column in SENSITIVE_COLUMNS {
            if self
                .column_exists(&mut *tx, column.table, column.enc_column)
                .await
                .map_err(|e| step_error(STEP, e))?
            {
                continue;
            }
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN {} TEXT NULL",
                column.table, column.enc_column
            );
            sqlx::query(&sql)
                .execute(&mut *tx)
                .await
                .map_err(|e| step_error(STEP, e))?;
            added.push(format!("{}.{}", column.table, column.enc_column));
        }

        tx.commit().await.map_err(|e| step_error(STEP, e))?;
        Ok(added)
    }

    async fn create_indexes(&self) -> StoreResult<()> {
        const STEP: &str = "create_indexes";
        const INDEXES: [&str; 8] = [
            "CREATE UNIQUE INDEX IF NOT EXISTS users_tenant_mobile_idx ON users (tenant_id, mobile)",
            "CREATE INDEX IF NOT EXISTS cards_tenant_user_idx ON cards (tenant_id, user_id)",
            "CREATE INDEX IF NOT EXISTS cards_tenant_pan_idx ON cards (tenant_id, pan)",
            "CREATE UNIQUE INDEX IF NOT EXISTS cache_cards_tenant_pan_idx ON cache_cards (tenant_id, pan)",
            "CREATE UNIQUE INDEX IF NOT EXISTS tokens_tenant_uuid_idx ON tokens (tenant_id, uuid)",
            "CREATE UNIQUE INDEX IF NOT EXISTS transactions_tenant_uuid_idx ON transactions (tenant_id, uuid)",
            "CREATE INDEX IF NOT EXISTS kyc_tenant_mobile_idx ON kyc (tenant_id, mobile)",
            "CREATE INDEX IF NOT EXISTS notifications_tenant_mobile_idx ON notifications (tenant_id, mobile)",
        ];

        let mut tx = self.pool.begin().await.map_err(|e| step_error(STEP, e))?;
        for ddl in INDEXES {
            sqlx::query(ddl)
                .execute(&mut *tx)
                .await
                .map_err(|e| step_error(STEP, e))?;
        }
        tx.commit().await.map_err(|e| step_error(STEP, e))
    }

    async fn column_exists(
        &self,
        conn: &mut AnyConnection,
        table: &str,
        column: &str,
    ) -> Result<bool, sqlx::Error> {
        let count: i64 = match self.dialect {
            Dialect::Postgres => {
                sqlx::query_scalar(
                    "SELECT COUNT(*) FROM information_schema.columns
                     WHERE table_schema = current_schema() AND table_name = $1 AND column_name = $2",
                )
                .bind(table)
                .bind(column)
                .fetch_one(&mut *conn)
                .await?
            }
            Dialect::Sqlite => {
                // table names come from the fixed lists in this crate
                sqlx::query_scalar(&format!(
                    "SELECT COUNT(*) FROM pragma_table_info('{}') WHERE name = $1",
                    table
                ))
                .bind(column)
                .fetch_one(&mut *conn)
                .await?
            }
        };
        Ok(count > 0)
    }

    fn table_ddl(&self) -> Vec<String> {
        let (pk, int, real) = match self.dialect {
            Dialect::Postgres => ("BIGSERIAL PRIMARY KEY", "BIGINT", "DOUBLE PRECISION"),
            Dialect::Sqlite => ("INTEGER PRIMARY KEY AUTOINCREMENT", "INTEGER", "REAL"),
        };
        let tenant = format!("tenant_id TEXT NOT NULL DEFAULT '{}'", self.default_tenant);

        vec![
            format!(
                "CREATE TABLE IF NOT EXISTS users (
                    id {pk},
                    {tenant},
                    mobile TEXT NOT NULL,
                    fullname TEXT NOT NULL DEFAULT '',
                    email TEXT NULL,
                    password TEXT NOT NULL DEFAULT '',
                    main_card TEXT NULL,
                    main_card_enc TEXT NULL,
                    is_verified {int} NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS cards (
                    id {pk},
                    {tenant},
                    user_id {int} NOT NULL,
                    pan TEXT NOT NULL,
                    pan_enc TEXT NULL,
                    ipin TEXT NULL,
                    ipin_enc TEXT NULL,
                    expiry TEXT NULL,
                    name TEXT NULL,
                    is_main {int} NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL,
                    deleted_at TEXT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS cache_cards (
                    id {pk},
                    {tenant},
                    pan TEXT NOT NULL,
                    pan_enc TEXT NULL,
                    expiry TEXT NULL,
                    name TEXT NULL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS tokens (
                    id {pk},
                    {tenant},
                    user_id {int} NOT NULL,
                    uuid TEXT NOT NULL,
                    amount {int} NOT NULL DEFAULT 0,
                    cart_id TEXT NULL,
                    to_card TEXT NULL,
                    to_card_enc TEXT NULL,
                    note TEXT NULL,
                    is_paid {int} NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS transactions (
                    id {pk},
                    {tenant},
                    uuid TEXT NOT NULL,
                    ebs_uuid TEXT NULL,
                    terminal_id TEXT NOT NULL,
                    system_trace_audit_number {int} NOT NULL DEFAULT 0,
                    tran_date_time TEXT NULL,
                    tran_amount {real} NOT NULL DEFAULT 0,
                    response_code {int} NOT NULL DEFAULT 0,
                    response_message TEXT NULL,
                    masked_pan TEXT NULL,
                    payload TEXT NULL,
                    created_at TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS kyc (
                    id {pk},
                    {tenant},
                    user_id {int} NOT NULL,
                    mobile TEXT NOT NULL,
                    passport_img TEXT NOT NULL,
                    selfie TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                )"
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS notifications (
                    id {pk},
                    {tenant},
                    mobile TEXT NOT NULL,
                    category TEXT NOT NULL,
                    title TEXT NOT NULL,
                    body TEXT NOT NULL,
                    is_read {int} NOT NULL DEFAULT 0,
                    created_at TEXT NOT NULL
                )"
            ),
        ]
    }
}

fn step_error(step: &'static str, err: sqlx::Error) -> StoreError {
    StoreError::new(StoreErrorKind::Migration {
        step,
        message: err.to_string(),
    })
}
