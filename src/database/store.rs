//! The tenant-scoped store handle.
//!
//! Entity operations live in sibling modules (`users`, `cards`, ...) as
//! `impl Store` blocks. Every statement they issue carries a `tenant_id`
//! predicate, and protected columns pass through the [`Hydrator`].

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::any::AnyArguments;
use sqlx::query::Query;
use sqlx::{Any, AnyPool};
use tracing::{info, warn};

use super::error::{StoreError, StoreErrorKind, StoreResult};
use super::hydrator::{Hydrator, MigrationStatsSnapshot};
use super::migrations::{MigrationReport, MigrationRunner};
use super::{init_pool_from_config, Dialect};
use crate::config::AppConfig;
use crate::crypto::{is_encrypted, is_hash, DataCodec};

/// Handle shared by every consumer of the store. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Store {
    pool: AnyPool,
    dialect: Dialect,
    pub(crate) hydrator: Hydrator,
}

impl Store {
    pub fn new(pool: AnyPool, dialect: Dialect, codec: DataCodec) -> Self {
        Self {
            pool,
            dialect,
            hydrator: Hydrator::new(codec),
        }
    }

    /// Build the pool and codec from configuration.
    pub async fn connect(config: &AppConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|e| StoreError::invalid_input(e.to_string()))?;

        let (pool, dialect) = init_pool_from_config(&config.database).await?;
        let codec = DataCodec::new(&config.encryption.data_key);

        if codec.is_enabled() {
            info!("Field encryption enabled");
        } else {
            warn!("NOEBS_DATA_KEY is empty; card data is stored without encryption");
        }

        Ok(Self::new(pool, dialect, codec))
    }

    /// Run schema migrations. Must complete before the store takes traffic.
    pub async fn migrate(&self, default_tenant: &str) -> StoreResult<MigrationReport> {
        MigrationRunner::new(self.pool.clone(), self.dialect, default_tenant)?
            .run()
            .await
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn codec(&self) -> &DataCodec {
        self.hydrator.codec()
    }

    /// Progress of migrate-on-read since this store was created.
    pub fn migration_stats(&self) -> MigrationStatsSnapshot {
        self.hydrator.stats()
    }

    /// Seal a caller-supplied sensitive value into its `(plain, enc)` pair.
    ///
    /// Values already in hash or envelope form are refused before any SQL
    /// runs: a hash written without its ciphertext cannot be recovered.
    pub(crate) fn seal_input(
        &self,
        field: &'static str,
        value: &str,
    ) -> StoreResult<(String, Option<String>)> {
        if is_hash(value) || is_encrypted(value) {
            return Err(StoreError::invalid_input(format!(
                "{} must be plaintext, not an encoded value",
                field
            )));
        }

        let mut plain = value.to_string();
        let mut enc = None;
        self.hydrator.seal(&mut plain, &mut enc)?;
        Ok((plain, enc))
    }
}

/// Paging window for list queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: i64,
    pub offset: i64,
}

impl Page {
    pub const MAX_LIMIT: i64 = 500;

    pub fn new(limit: i64, offset: i64) -> Self {
        Self {
            limit: limit.clamp(1, Self::MAX_LIMIT),
            offset: offset.max(0),
        }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(50, 0)
    }
}

/// Value bound into a dynamic UPDATE.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ColumnValue {
    Text(Option<String>),
    Int(i64),
}

/// Allow-listed assignments for a partial update. Column names only ever come
/// from the typed update builders.
#[derive(Debug, Default)]
pub(crate) struct ColumnSet {
    assignments: Vec<(&'static str, ColumnValue)>,
}

impl ColumnSet {
    pub(crate) fn text(&mut self, column: &'static str, value: Option<String>) {
        self.assignments.push((column, ColumnValue::Text(value)));
    }

    pub(crate) fn int(&mut self, column: &'static str, value: i64) {
        self.assignments.push((column, ColumnValue::Int(value)));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub(crate) fn columns(&self) -> Vec<&'static str> {
        self.assignments.iter().map(|(c, _)| *c).collect()
    }

    /// `UPDATE <table> SET ..., updated_at = $n WHERE id = $n+1 AND tenant_id = $n+2 [extra]`
    pub(crate) fn update_sql(&self, table: &str, extra_predicate: &str) -> String {
        let mut sets: Vec<String> = self
            .assignments
            .iter()
            .enumerate()
            .map(|(i, (column, _))| format!("{} = ${}", column, i + 1))
            .collect();
        let n = self.assignments.len();
        sets.push(format!("updated_at = ${}", n + 1));

        format!(
            "UPDATE {} SET {} WHERE id = ${} AND tenant_id = ${}{}",
            table,
            sets.join(", "),
            n + 2,
            n + 3,
            extra_predicate
        )
    }

    /// Bind assignment values, then `updated_at`, id and tenant.
    pub(crate) fn bind<'q>(
        self,
        mut query: Query<'q, Any, AnyArguments<'q>>,
        id: i64,
        tenant_id: &'q str,
    ) -> Query<'q, Any, AnyArguments<'q>> {
        for (_, value) in self.assignments {
            query = match value {
                ColumnValue::Text(v) => query.bind(v),
                ColumnValue::Int(v) => query.bind(v),
            };
        }
        query.bind(now_timestamp()).bind(id).bind(tenant_id)
    }
}

pub(crate) fn require_tenant(tenant_id: &str) -> StoreResult<()> {
    if tenant_id.trim().is_empty() {
        return Err(StoreError::invalid_input("tenant id is required"));
    }
    Ok(())
}

/// Current time in the stored text form (RFC 3339, UTC, microseconds).
pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

pub(crate) fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(value: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            StoreError::new(StoreErrorKind::Unknown {
                message: format!("invalid stored timestamp '{}': {}", value, e),
            })
        })
}

pub(crate) fn parse_optional_timestamp(value: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    i64::from(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_column_set_renders_numbered_placeholders() {
        let mut set = ColumnSet::default();
        set.text("name", Some("Visa".to_string()));
        set.text("pan", Some("h:abc".to_string()));
        set.text("pan_enc", Some("enc:a:b".to_string()));

        assert_eq!(
            set.update_sql("cards", " AND deleted_at IS NULL"),
            "UPDATE cards SET name = $1, pan = $2, pan_enc = $3, updated_at = $4 \
             WHERE id = $5 AND tenant_id = $6 AND deleted_at IS NULL"
        );
        assert_eq!(set.columns(), vec!["name", "pan", "pan_enc"]);
    }

    #[test]
    fn test_page_clamps_bounds() {
        assert_eq!(Page::new(0, -5), Page { limit: 1, offset: 0 });
        assert_eq!(Page::new(10_000, 20).limit, Page::MAX_LIMIT);
        assert_eq!(Page::default(), Page { limit: 50, offset: 0 });
    }

    #[test]
    fn test_timestamp_round_trip() {
        let now = Utc::now();
        let text = format_timestamp(now);
        assert!(text.ends_with('Z'));
        let parsed = parse_timestamp(&text).unwrap();
        assert_eq!(format_timestamp(parsed), text);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_require_tenant() {
        assert!(require_tenant("default").is_ok());
        assert!(require_tenant("").is_err());
        assert!(require_tenant("   ").is_err());
    }
}
