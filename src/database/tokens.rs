use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use super::error::{StoreError, StoreResult};
use super::hydrator::TOKEN_TO_CARD;
use super::store::{bool_to_int, now_timestamp, parse_timestamp, require_tenant, Store};
use crate::logging::mask_pan;

const TOKEN_COLUMNS: &str = "id, tenant_id, user_id, uuid, amount, cart_id, to_card, to_card_enc, \
                             note, is_paid, created_at, updated_at";

/// Payment token (payment request) optionally bound to a recipient card.
#[derive(Clone, PartialEq)]
pub struct Token {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: i64,
    pub uuid: String,
    /// Amount in minor units
    pub amount: i64,
    pub cart_id: String,
    pub to_card: Option<String>,
    pub to_card_enc: Option<String>,
    pub note: Option<String>,
    pub is_paid: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    pub fn new(user_id: i64, amount: i64) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: String::new(),
            user_id,
            uuid: String::new(),
            amount,
            cart_id: String::new(),
            to_card: None,
            to_card_enc: None,
            note: None,
            is_paid: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_to_card(mut self, to_card: impl Into<String>) -> Self {
        self.to_card = Some(to_card.into());
        self
    }

    fn from_row(row: &AnyRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.try_get("id").map_err(StoreError::from_sqlx)?,
            tenant_id: row.try_get("tenant_id").map_err(StoreError::from_sqlx)?,
            user_id: row.try_get("user_id").map_err(StoreError::from_sqlx)?,
            uuid: row.try_get("uuid").map_err(StoreError::from_sqlx)?,
            amount: row.try_get("amount").map_err(StoreError::from_sqlx)?,
            cart_id: row
                .try_get::<Option<String>, _>("cart_id")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            to_card: row.try_get("to_card").map_err(StoreError::from_sqlx)?,
            to_card_enc: row.try_get("to_card_enc").map_err(StoreError::from_sqlx)?,
            note: row.try_get("note").map_err(StoreError::from_sqlx)?,
            is_paid: row.try_get::<i64, _>("is_paid").map_err(StoreError::from_sqlx)? != 0,
            created_at: parse_timestamp(
                &row.try_get::<String, _>("created_at").map_err(StoreError::from_sqlx)?,
            )?,
            updated_at: parse_timestamp(
                &row.try_get::<String, _>("updated_at").map_err(StoreError::from_sqlx)?,
            )?,
        })
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("user_id", &self.user_id)
            .field("uuid", &self.uuid)
            .field("amount", &self.amount)
            .field("to_card", &self.to_card.as_deref().map(mask_pan))
            .field("is_paid", &self.is_paid)
            .finish_non_exhaustive()
    }
}

impl Store {
    /// Insert a token, generating its UUID when empty. `to_card` is sealed
    /// up front; tokens have no legacy rows to migrate.
    pub async fn create_token(&self, tenant_id: &str, token: &mut Token) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        if token.uuid.is_empty() {
            token.uuid = Uuid::new_v4().to_string();
        }

        let (to_card, to_card_enc) = match token.to_card.as_deref() {
            Some(to_card) => {
                let (plain, enc) = self.seal_input("to_card", to_card)?;
                (Some(plain), enc)
            }
            None => (None, None),
        };

        let now = now_timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO tokens
             (tenant_id, user_id, uuid, amount, cart_id, to_card, to_card_enc, note, is_paid,
              created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(token.user_id)
        .bind(&token.uuid)
        .bind(token.amount)
        .bind(&token.cart_id)
        .bind(&to_card)
        .bind(&to_card_enc)
        .bind(&token.note)
        .bind(bool_to_int(token.is_paid))
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        token.id = id;
        token.tenant_id = tenant_id.to_string();
        token.to_card_enc = to_card_enc;
        token.created_at = parse_timestamp(&now)?;
        token.updated_at = token.created_at;

        debug!(tenant_id, token_id = id, uuid = %token.uuid, "Created token");
        Ok(())
    }

    pub async fn get_token_by_uuid(&self, tenant_id: &str, uuid: &str) -> StoreResult<Token> {
        require_tenant(tenant_id)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM tokens WHERE uuid = $1 AND tenant_id = $2",
            TOKEN_COLUMNS
        ))
        .bind(uuid)
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("token"))?;

        self.hydrate_token(tenant_id, &row).await
    }

    pub async fn get_tokens_by_user(&self, tenant_id: &str, user_id: i64) -> StoreResult<Vec<Token>> {
        require_tenant(tenant_id)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM tokens WHERE user_id = $1 AND tenant_id = $2 ORDER BY id DESC",
            TOKEN_COLUMNS
        ))
        .bind(user_id)
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        let mut tokens = Vec::with_capacity(rows.len());
        for row in &rows {
            tokens.push(self.hydrate_token(tenant_id, row).await?);
        }
        Ok(tokens)
    }

    pub async fn mark_token_paid(&self, tenant_id: &str, uuid: &str) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        let result = sqlx::query(
            "UPDATE tokens SET is_paid = 1, updated_at = $1 WHERE uuid = $2 AND tenant_id = $3",
        )
        .bind(now_timestamp())
        .bind(uuid)
        .bind(tenant_id)
        .execute(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("token"));
        }
        Ok(())
    }

    async fn hydrate_token(&self, tenant_id: &str, row: &AnyRow) -> StoreResult<Token> {
        let mut token = Token::from_row(row)?;
        if let Some(to_card) = token.to_card.as_mut() {
            self.hydrator
                .hydrate(
                    self.pool(),
                    &TOKEN_TO_CARD,
                    tenant_id,
                    token.id,
                    to_card,
                    &mut token.to_card_enc,
                )
                .await?;
        }
        Ok(token)
    }
}
