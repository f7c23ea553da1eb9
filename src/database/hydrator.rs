//! Sensitive-field hydration.
//!
//! A protected column has a "plain" column and an `_enc` shadow column. Once a
//! row is migrated the plain column holds only the `h:` lookup hash and the
//! shadow column holds the `enc:` envelope. Rows written before encryption was
//! turned on still carry raw values; they are migrated the first time they are
//! read.

use regex::Regex;
use sqlx::AnyPool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use tracing::{debug, warn};

use crate::crypto::{is_encrypted, is_hash, CryptoError, CryptoResult, DataCodec};
use crate::database::store::now_timestamp;

/// Decides whether a bare value in the plain column is legacy data that
/// should be migrated on read.
pub type LegacyPredicate = fn(&str) -> bool;

static PAN_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{12,19}$").expect("PAN pattern is valid"));

/// 12 to 19 ASCII digits.
pub fn looks_like_pan(value: &str) -> bool {
    PAN_PATTERN.is_match(value)
}

/// Any non-empty value that is not already encoded.
pub fn any_unhashed(value: &str) -> bool {
    !value.is_empty() && !is_hash(value) && !is_encrypted(value)
}

/// Never migrate; used for columns that are only ever written sealed.
pub fn never(_value: &str) -> bool {
    false
}

/// A plain column paired with its encrypted shadow.
#[derive(Debug, Clone, Copy)]
pub struct SensitiveColumn {
    pub table: &'static str,
    pub column: &'static str,
    pub enc_column: &'static str,
    pub is_legacy: LegacyPredicate,
}

pub const USER_MAIN_CARD: SensitiveColumn = SensitiveColumn {
    table: "users",
    column: "main_card",
    enc_column: "main_card_enc",
    is_legacy: looks_like_pan,
};

pub const CARD_PAN: SensitiveColumn = SensitiveColumn {
    table: "cards",
    column: "pan",
    enc_column: "pan_enc",
    is_legacy: looks_like_pan,
};

// IPINs are not always numeric (some issuers hand out pre-encrypted blocks)
pub const CARD_IPIN: SensitiveColumn = SensitiveColumn {
    table: "cards",
    column: "ipin",
    enc_column: "ipin_enc",
    is_legacy: any_unhashed,
};

pub const CACHE_CARD_PAN: SensitiveColumn = SensitiveColumn {
    table: "cache_cards",
    column: "pan",
    enc_column: "pan_enc",
    is_legacy: looks_like_pan,
};

pub const TOKEN_TO_CARD: SensitiveColumn = SensitiveColumn {
    table: "tokens",
    column: "to_card",
    enc_column: "to_card_enc",
    is_legacy: never,
};

/// Every protected column the store knows about.
pub const SENSITIVE_COLUMNS: [SensitiveColumn; 5] =
    [USER_MAIN_CARD, CARD_PAN, CARD_IPIN, CACHE_CARD_PAN, TOKEN_TO_CARD];

/// Outcome of opening a value read from the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hydration {
    /// Nothing to do: empty, passthrough mode, or a bare value the column's
    /// predicate does not consider legacy.
    Untouched,
    /// The shadow column was decrypted into the plain field.
    Decrypted,
    /// A legacy value was sealed in memory; `hash` and `sealed` should be
    /// persisted.
    Migrated { hash: String, sealed: String },
}

/// Counters for migrate-on-read progress.
#[derive(Debug, Default)]
pub struct MigrationStats {
    migrated: AtomicU64,
    backfill_failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MigrationStatsSnapshot {
    pub migrated: u64,
    pub backfill_failed: u64,
}

impl MigrationStats {
    pub fn snapshot(&self) -> MigrationStatsSnapshot {
        MigrationStatsSnapshot {
            migrated: self.migrated.load(Ordering::Relaxed),
            backfill_failed: self.backfill_failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Hydrator {
    codec: DataCodec,
    stats: Arc<MigrationStats>,
}

impl Hydrator {
    pub fn new(codec: DataCodec) -> Self {
        Self {
            codec,
            stats: Arc::new(MigrationStats::default()),
        }
    }

    pub fn codec(&self) -> &DataCodec {
        &self.codec
    }

    pub fn stats(&self) -> MigrationStatsSnapshot {
        self.stats.snapshot()
    }

    /// Write path: replace a fresh plaintext with its hash and put the
    /// ciphertext in the shadow field. Already-hashed values are left alone.
    pub fn seal(&self, plain: &mut String, enc: &mut Option<String>) -> CryptoResult<()> {
        if !self.codec.is_enabled() || plain.is_empty() || is_hash(plain) {
            return Ok(());
        }

        let sealed = self.codec.encrypt(plain)?;
        *plain = self.codec.hash(plain);
        *enc = Some(sealed);
        Ok(())
    }

    /// The two values a lookup must match: the raw value for unmigrated rows
    /// and its hash for migrated ones.
    pub fn lookup_pair(&self, value: &str) -> (String, String) {
        (value.to_string(), self.codec.hash(value))
    }

    /// Read path without persistence. On return `plain` holds the value the
    /// caller should see.
    pub fn open(
        &self,
        column: &SensitiveColumn,
        plain: &mut String,
        enc: &mut Option<String>,
    ) -> CryptoResult<Hydration> {
        if !self.codec.is_enabled() {
            return Ok(Hydration::Untouched);
        }

        if let Some(sealed) = enc.as_deref().filter(|s| !s.is_empty()) {
            *plain = self.codec.decrypt(sealed)?;
            return Ok(Hydration::Decrypted);
        }

        if plain.is_empty() {
            return Ok(Hydration::Untouched);
        }

        if is_hash(plain) {
            return Err(CryptoError::MissingCiphertext);
        }

        if !(column.is_legacy)(plain) {
            return Ok(Hydration::Untouched);
        }

        let sealed = self.codec.encrypt(plain)?;
        let hash = self.codec.hash(plain);
        *enc = Some(sealed.clone());
        Ok(Hydration::Migrated { hash, sealed })
    }

    /// Read path with migrate-on-read. A legacy row is backfilled by primary
    /// key; a failed backfill is logged and counted, never returned.
    pub async fn hydrate(
        &self,
        pool: &AnyPool,
        column: &SensitiveColumn,
        tenant_id: &str,
        id: i64,
        plain: &mut String,
        enc: &mut Option<String>,
    ) -> CryptoResult<()> {
        if let Hydration::Migrated { hash, sealed } = self.open(column, plain, enc)? {
            self.backfill(pool, column, tenant_id, id, &hash, &sealed)
                .await;
        }
        Ok(())
    }

    async fn backfill(
        &self,
        pool: &AnyPool,
        column: &SensitiveColumn,
        tenant_id: &str,
        id: i64,
        hash: &str,
        sealed: &str,
    ) {
        // Column and table names come from the SensitiveColumn constants
        let sql = format!(
            "UPDATE {table} SET {col} = $1, {enc} = $2, updated_at = $3 \
             WHERE id = $4 AND tenant_id = $5 AND ({enc} IS NULL OR {enc} = '')",
            table = column.table,
            col = column.column,
            enc = column.enc_column,
        );

        let result = sqlx::query(&sql)
            .bind(hash)
            .bind(sealed)
            .bind(now_timestamp())
            .bind(id)
            .bind(tenant_id)
            .execute(pool)
            .await;

        match result {
            Ok(done) => {
                if done.rows_affected() > 0 {
                    self.stats.migrated.fetch_add(1, Ordering::Relaxed);
                }
                debug!(
                    table = column.table,
                    column = column.column,
                    tenant_id,
                    id,
                    "Migrated legacy sensitive value"
                );
            }
            Err(e) => {
                self.stats.backfill_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    table = column.table,
                    column = column.column,
                    tenant_id,
                    id,
                    error = %e,
                    "Failed to persist migrated sensitive value"
                );
            }
        }
    }
}
