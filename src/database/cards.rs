use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use std::fmt;
use tracing::{debug, info};

use super::error::{StoreError, StoreResult};
use super::hydrator::{CARD_IPIN, CARD_PAN};
use super::store::{
    bool_to_int, now_timestamp, parse_optional_timestamp, parse_timestamp, require_tenant,
    ColumnSet, Store,
};
use crate::logging::mask_pan;

const CARD_COLUMNS: &str = "id, tenant_id, user_id, pan, pan_enc, ipin, ipin_enc, expiry, name, \
                            is_main, created_at, updated_at, deleted_at";

/// A payment card saved by a user. `pan` and `ipin` are plaintext in memory.
#[derive(Clone, PartialEq)]
pub struct Card {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: i64,
    pub pan: String,
    pub pan_enc: Option<String>,
    pub ipin: String,
    pub ipin_enc: Option<String>,
    pub expiry: String,
    pub name: String,
    pub is_main: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Card {
    pub fn new(user_id: i64, pan: impl Into<String>, expiry: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: String::new(),
            user_id,
            pan: pan.into(),
            pan_enc: None,
            ipin: String::new(),
            ipin_enc: None,
            expiry: expiry.into(),
            name: String::new(),
            is_main: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn with_ipin(mut self, ipin: impl Into<String>) -> Self {
        self.ipin = ipin.into();
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn from_row(row: &AnyRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.try_get("id").map_err(StoreError::from_sqlx)?,
            tenant_id: row.try_get("tenant_id").map_err(StoreError::from_sqlx)?,
            user_id: row.try_get("user_id").map_err(StoreError::from_sqlx)?,
            pan: row.try_get("pan").map_err(StoreError::from_sqlx)?,
            pan_enc: row.try_get("pan_enc").map_err(StoreError::from_sqlx)?,
            ipin: row
                .try_get::<Option<String>, _>("ipin")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            ipin_enc: row.try_get("ipin_enc").map_err(StoreError::from_sqlx)?,
            expiry: row
                .try_get::<Option<String>, _>("expiry")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            name: row
                .try_get::<Option<String>, _>("name")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            is_main: row.try_get::<i64, _>("is_main").map_err(StoreError::from_sqlx)? != 0,
            created_at: parse_timestamp(
                &row.try_get::<String, _>("created_at").map_err(StoreError::from_sqlx)?,
            )?,
            updated_at: parse_timestamp(
                &row.try_get::<String, _>("updated_at").map_err(StoreError::from_sqlx)?,
            )?,
            deleted_at: parse_optional_timestamp(
                row.try_get("deleted_at").map_err(StoreError::from_sqlx)?,
            )?,
        })
    }
}

impl fmt::Debug for Card {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Card")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("pan", &mask_pan(&self.pan))
            .field("expiry", &self.expiry)
            .field("name", &self.name)
            .field("is_main", &self.is_main)
            .field("deleted_at", &self.deleted_at)
            .finish_non_exhaustive()
    }
}

/// Partial update for a card.
#[derive(Debug, Clone, Default)]
pub struct CardUpdate {
    pub pan: Option<String>,
    pub ipin: Option<String>,
    pub expiry: Option<String>,
    pub name: Option<String>,
}

impl Store {
    pub async fn create_card(&self, tenant_id: &str, card: &mut Card) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        let (pan, pan_enc) = self.seal_input("pan", &card.pan)?;
        let (ipin, ipin_enc) = self.seal_input("ipin", &card.ipin)?;

        let now = now_timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO cards
             (tenant_id, user_id, pan, pan_enc, ipin, ipin_enc, expiry, name, is_main,
              created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(card.user_id)
        .bind(&pan)
        .bind(&pan_enc)
        .bind(&ipin)
        .bind(&ipin_enc)
        .bind(&card.expiry)
        .bind(&card.name)
        .bind(bool_to_int(card.is_main))
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        card.id = id;
        card.tenant_id = tenant_id.to_string();
        card.pan_enc = pan_enc;
        card.ipin_enc = ipin_enc;
        card.created_at = parse_timestamp(&now)?;
        card.updated_at = card.created_at;
        card.deleted_at = None;

        debug!(tenant_id, card_id = id, user_id = card.user_id, "Created card");
        Ok(())
    }

    pub async fn get_card_by_id(&self, tenant_id: &str, id: i64) -> StoreResult<Card> {
        require_tenant(tenant_id)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM cards WHERE id = $1 AND tenant_id = $2 AND deleted_at IS NULL",
            CARD_COLUMNS
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("card"))?;

        self.hydrate_card(tenant_id, &row).await
    }

    /// Find a user's card by PAN. Matches rows whether or not they have been
    /// migrated yet.
    pub async fn get_card_by_pan(
        &self,
        tenant_id: &str,
        user_id: i64,
        pan: &str,
    ) -> StoreResult<Card> {
        require_tenant(tenant_id)?;
        let (raw, hash) = self.hydrator.lookup_pair(pan);

        let row = sqlx::query(&format!(
            "SELECT {} FROM cards
             WHERE tenant_id = $1 AND user_id = $2 AND (pan = $3 OR pan = $4)
               AND deleted_at IS NULL
             ORDER BY id LIMIT 1",
            CARD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(user_id)
        .bind(raw)
        .bind(hash)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("card"))?;

        self.hydrate_card(tenant_id, &row).await
    }

    pub async fn get_cards_by_user(&self, tenant_id: &str, user_id: i64) -> StoreResult<Vec<Card>> {
        require_tenant(tenant_id)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM cards
             WHERE tenant_id = $1 AND user_id = $2 AND deleted_at IS NULL
             ORDER BY id",
            CARD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(user_id)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        let mut cards = Vec::with_capacity(rows.len());
        for row in &rows {
            cards.push(self.hydrate_card(tenant_id, row).await?);
        }
        Ok(cards)
    }

    pub async fn get_main_card(&self, tenant_id: &str, user_id: i64) -> StoreResult<Card> {
        require_tenant(tenant_id)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM cards
             WHERE tenant_id = $1 AND user_id = $2 AND is_main = 1 AND deleted_at IS NULL
             ORDER BY id LIMIT 1",
            CARD_COLUMNS
        ))
        .bind(tenant_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("card"))?;

        self.hydrate_card(tenant_id, &row).await
    }

    pub async fn update_card_columns(
        &self,
        tenant_id: &str,
        id: i64,
        update: CardUpdate,
    ) -> StoreResult<Card> {
        require_tenant(tenant_id)?;

        let mut set = ColumnSet::default();
        if let Some(pan) = update.pan {
            let (pan, pan_enc) = self.seal_input("pan", &pan)?;
            set.text("pan", Some(pan));
            set.text("pan_enc", pan_enc);
        }
        if let Some(ipin) = update.ipin {
            let (ipin, ipin_enc) = self.seal_input("ipin", &ipin)?;
            set.text("ipin", Some(ipin));
            set.text("ipin_enc", ipin_enc);
        }
        if let Some(expiry) = update.expiry {
            set.text("expiry", Some(expiry));
        }
        if let Some(name) = update.name {
            set.text("name", Some(name));
        }
        if set.is_empty() {
            return Err(StoreError::invalid_input("card update has no fields"));
        }

        debug!(tenant_id, card_id = id, columns = ?set.columns(), "Updating card");
        let sql = set.update_sql("cards", " AND deleted_at IS NULL");
        let result = set
            .bind(sqlx::query(&sql), id, tenant_id)
            .execute(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("card"));
        }

        self.get_card_by_id(tenant_id, id).await
    }

    /// Soft delete. Deleting an already deleted card is NotFound.
    pub async fn delete_card(&self, tenant_id: &str, id: i64) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        let now = now_timestamp();
        let result = sqlx::query(
            "UPDATE cards SET deleted_at = $1, updated_at = $2, is_main = 0
             WHERE id = $3 AND tenant_id = $4 AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(&now)
        .bind(id)
        .bind(tenant_id)
        .execute(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("card"));
        }
        Ok(())
    }

    /// Make the card identified by `pan` the user's only main card.
    ///
    /// Clearing and setting run in one transaction; if no card matches, the
    /// transaction is rolled back and the previous flags are kept.
    pub async fn set_main_card(&self, tenant_id: &str, user_id: i64, pan: &str) -> StoreResult<()> {
        require_tenant(tenant_id)?;
        let (raw, hash) = self.hydrator.lookup_pair(pan);
        let now = now_timestamp();

        let mut tx = self.pool().begin().await.map_err(StoreError::from_sqlx)?;

        sqlx::query(
            "UPDATE cards SET is_main = 0, updated_at = $1
             WHERE tenant_id = $2 AND user_id = $3 AND is_main <> 0",
        )
        .bind(&now)
        .bind(tenant_id)
        .bind(user_id)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        let result = sqlx::query(
            "UPDATE cards SET is_main = 1, updated_at = $1
             WHERE tenant_id = $2 AND id = (
                 SELECT id FROM cards
                 WHERE tenant_id = $3 AND user_id = $4 AND (pan = $5 OR pan = $6)
                   AND deleted_at IS NULL
                 ORDER BY id LIMIT 1
             )",
        )
        .bind(&now)
        .bind(tenant_id)
        .bind(tenant_id)
        .bind(user_id)
        .bind(raw)
        .bind(hash)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            tx.rollback().await.map_err(StoreError::from_sqlx)?;
            return Err(StoreError::not_found("card"));
        }

        tx.commit().await.map_err(StoreError::from_sqlx)?;
        info!(tenant_id, user_id, "Main card updated");
        Ok(())
    }

    async fn hydrate_card(&self, tenant_id: &str, row: &AnyRow) -> StoreResult<Card> {
        let mut card = Card::from_row(row)?;
        self.hydrator
            .hydrate(
                self.pool(),
                &CARD_PAN,
                tenant_id,
                card.id,
                &mut card.pan,
                &mut card.pan_enc,
            )
            .await?;
        self.hydrator
            .hydrate(
                self.pool(),
                &CARD_IPIN,
                tenant_id,
                card.id,
                &mut card.ipin,
                &mut card.ipin_enc,
            )
            .await?;
        Ok(card)
    }
}
