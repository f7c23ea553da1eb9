use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use std::fmt;

use super::error::{StoreError, StoreResult};
use super::hydrator::CACHE_CARD_PAN;
use super::store::{now_timestamp, parse_timestamp, require_tenant, Store};
use crate::logging::mask_pan;

const CACHE_CARD_COLUMNS: &str = "id, tenant_id, pan, pan_enc, expiry, name, created_at, updated_at";

/// Card details remembered from a previous payment, keyed by PAN.
///
/// Entries are scoped to one tenant; the same PAN cached under two tenants
/// gives two independent rows.
#[derive(Clone, PartialEq)]
pub struct CacheCard {
    pub id: i64,
    pub tenant_id: String,
    pub pan: String,
    pub pan_enc: Option<String>,
    pub expiry: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CacheCard {
    pub fn new(pan: impl Into<String>, expiry: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: String::new(),
            pan: pan.into(),
            pan_enc: None,
            expiry: expiry.into(),
            name: name.into(),
            created_at: now,
            updated_at: now,
        }
    }

    fn from_row(row: &AnyRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.try_get("id").map_err(StoreError::from_sqlx)?,
            tenant_id: row.try_get("tenant_id").map_err(StoreError::from_sqlx)?,
            pan: row.try_get("pan").map_err(StoreError::from_sqlx)?,
            pan_enc: row.try_get("pan_enc").map_err(StoreError::from_sqlx)?,
            expiry: row
                .try_get::<Option<String>, _>("expiry")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            name: row
                .try_get::<Option<String>, _>("name")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            created_at: parse_timestamp(
                &row.try_get::<String, _>("created_at").map_err(StoreError::from_sqlx)?,
            )?,
            updated_at: parse_timestamp(
                &row.try_get::<String, _>("updated_at").map_err(StoreError::from_sqlx)?,
            )?,
        })
    }
}

impl fmt::Debug for CacheCard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheCard")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("pan", &mask_pan(&self.pan))
            .field("expiry", &self.expiry)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Insert or refresh the cache entry for `card.pan`.
    ///
    /// An existing entry is matched by raw PAN or hash, so a legacy row is
    /// updated in place (and migrated) instead of duplicated.
    pub async fn upsert_cache_card(&self, tenant_id: &str, card: &mut CacheCard) -> StoreResult<()> {
        require_tenant(tenant_id)?;
        let (pan, pan_enc) = self.seal_input("pan", &card.pan)?;
        let (raw, hash) = self.hydrator.lookup_pair(&card.pan);
        let now = now_timestamp();

        let existing: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM cache_cards
             WHERE tenant_id = $1 AND (pan = $2 OR pan = $3)
             ORDER BY id LIMIT 1",
        )
        .bind(tenant_id)
        .bind(&raw)
        .bind(&hash)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        let (id, created_at): (i64, String) = match existing {
            Some(id) => sqlx::query_as(
                "UPDATE cache_cards
                 SET pan = $1, pan_enc = $2, expiry = $3, name = $4, updated_at = $5
                 WHERE id = $6 AND tenant_id = $7
                 RETURNING id, created_at",
            )
            .bind(&pan)
            .bind(&pan_enc)
            .bind(&card.expiry)
            .bind(&card.name)
            .bind(&now)
            .bind(id)
            .bind(tenant_id)
            .fetch_one(self.pool())
            .await
            // the entry can vanish between the lookup and the update
            .map_err(|e| StoreError::from_sqlx(e).for_entity("cache card"))?,
            None => sqlx::query_as(
                "INSERT INTO cache_cards
                 (tenant_id, pan, pan_enc, expiry, name, created_at, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (tenant_id, pan) DO UPDATE
                 SET pan_enc = excluded.pan_enc, expiry = excluded.expiry,
                     name = excluded.name, updated_at = excluded.updated_at
                 RETURNING id, created_at",
            )
            .bind(tenant_id)
            .bind(&pan)
            .bind(&pan_enc)
            .bind(&card.expiry)
            .bind(&card.name)
            .bind(&now)
            .bind(&now)
            .fetch_one(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?,
        };

        card.id = id;
        card.tenant_id = tenant_id.to_string();
        card.pan_enc = pan_enc;
        card.created_at = parse_timestamp(&created_at)?;
        card.updated_at = parse_timestamp(&now)?;
        Ok(())
    }

    pub async fn get_cache_card_by_pan(&self, tenant_id: &str, pan: &str) -> StoreResult<CacheCard> {
        require_tenant(tenant_id)?;
        let (raw, hash) = self.hydrator.lookup_pair(pan);

        let row = sqlx::query(&format!(
            "SELECT {} FROM cache_cards
             WHERE tenant_id = $1 AND (pan = $2 OR pan = $3)
             ORDER BY id LIMIT 1",
            CACHE_CARD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(raw)
        .bind(hash)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("cache card"))?;

        let mut card = CacheCard::from_row(&row)?;
        self.hydrator
            .hydrate(
                self.pool(),
                &CACHE_CARD_PAN,
                tenant_id,
                card.id,
                &mut card.pan,
                &mut card.pan_enc,
            )
            .await?;
        Ok(card)
    }
}
