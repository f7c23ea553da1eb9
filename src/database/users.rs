use chrono::{DateTime, Utc};
use sqlx::any::AnyRow;
use sqlx::Row;
use std::fmt;
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::hydrator::USER_MAIN_CARD;
use super::store::{
    bool_to_int, now_timestamp, parse_timestamp, require_tenant, ColumnSet, Store,
};
use crate::logging::mask_pan;

const USER_COLUMNS: &str = "id, tenant_id, mobile, fullname, email, password, main_card, \
                            main_card_enc, is_verified, created_at, updated_at";

/// Registered wallet user. `main_card` is always plaintext in memory.
#[derive(Clone, PartialEq)]
pub struct User {
    pub id: i64,
    pub tenant_id: String,
    pub mobile: String,
    pub fullname: String,
    pub email: Option<String>,
    /// Password hash produced by the auth layer; opaque to the store
    pub password: String,
    pub main_card: String,
    pub main_card_enc: Option<String>,
    pub is_verified: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(mobile: impl Into<String>, fullname: impl Into<String>, password: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: String::new(),
            mobile: mobile.into(),
            fullname: fullname.into(),
            email: None,
            password: password.into(),
            main_card: String::new(),
            main_card_enc: None,
            is_verified: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn from_row(row: &AnyRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.try_get("id").map_err(StoreError::from_sqlx)?,
            tenant_id: row.try_get("tenant_id").map_err(StoreError::from_sqlx)?,
            mobile: row.try_get("mobile").map_err(StoreError::from_sqlx)?,
            fullname: row.try_get("fullname").map_err(StoreError::from_sqlx)?,
            email: row.try_get("email").map_err(StoreError::from_sqlx)?,
            password: row.try_get("password").map_err(StoreError::from_sqlx)?,
            main_card: row
                .try_get::<Option<String>, _>("main_card")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            main_card_enc: row.try_get("main_card_enc").map_err(StoreError::from_sqlx)?,
            is_verified: row
                .try_get::<i64, _>("is_verified")
                .map_err(StoreError::from_sqlx)?
                != 0,
            created_at: parse_timestamp(
                &row.try_get::<String, _>("created_at").map_err(StoreError::from_sqlx)?,
            )?,
            updated_at: parse_timestamp(
                &row.try_get::<String, _>("updated_at").map_err(StoreError::from_sqlx)?,
            )?,
        })
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("tenant_id", &self.tenant_id)
            .field("mobile", &self.mobile)
            .field("fullname", &self.fullname)
            .field("main_card", &mask_pan(&self.main_card))
            .field("is_verified", &self.is_verified)
            .finish_non_exhaustive()
    }
}

/// Partial update for a user. Only the fields set are written.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub fullname: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
    pub main_card: Option<String>,
    pub is_verified: Option<bool>,
}

impl Store {
    /// Insert a user. Assigns id, tenant and timestamps back onto `user`.
    pub async fn create_user(&self, tenant_id: &str, user: &mut User) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        let (main_card, main_card_enc) = self.seal_input("main_card", &user.main_card)?;

        let now = now_timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO users
             (tenant_id, mobile, fullname, email, password, main_card, main_card_enc,
              is_verified, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(&user.mobile)
        .bind(&user.fullname)
        .bind(&user.email)
        .bind(&user.password)
        .bind(&main_card)
        .bind(&main_card_enc)
        .bind(bool_to_int(user.is_verified))
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        user.id = id;
        user.tenant_id = tenant_id.to_string();
        user.main_card_enc = main_card_enc;
        user.created_at = parse_timestamp(&now)?;
        user.updated_at = user.created_at;

        debug!(tenant_id, user_id = id, "Created user");
        Ok(())
    }

    pub async fn get_user_by_id(&self, tenant_id: &str, id: i64) -> StoreResult<User> {
        require_tenant(tenant_id)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE id = $1 AND tenant_id = $2",
            USER_COLUMNS
        ))
        .bind(id)
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("user"))?;

        self.hydrate_user(tenant_id, &row).await
    }

    pub async fn get_user_by_mobile(&self, tenant_id: &str, mobile: &str) -> StoreResult<User> {
        require_tenant(tenant_id)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM users WHERE mobile = $1 AND tenant_id = $2",
            USER_COLUMNS
        ))
        .bind(mobile)
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("user"))?;

        self.hydrate_user(tenant_id, &row).await
    }

    /// Find the user whose main card is `pan`, migrated or not.
    pub async fn get_user_by_main_card(&self, tenant_id: &str, pan: &str) -> StoreResult<User> {
        require_tenant(tenant_id)?;
        let (raw, hash) = self.hydrator.lookup_pair(pan);

        let row = sqlx::query(&format!(
            "SELECT {} FROM users
             WHERE tenant_id = $1 AND (main_card = $2 OR main_card = $3)
             ORDER BY id LIMIT 1",
            USER_COLUMNS
        ))
        .bind(tenant_id)
        .bind(raw)
        .bind(hash)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("user"))?;

        self.hydrate_user(tenant_id, &row).await
    }

    /// Apply a partial update and return the fresh row.
    pub async fn update_user_columns(
        &self,
        tenant_id: &str,
        id: i64,
        update: UserUpdate,
    ) -> StoreResult<User> {
        require_tenant(tenant_id)?;

        let mut set = ColumnSet::default();
        if let Some(fullname) = update.fullname {
            set.text("fullname", Some(fullname));
        }
        if let Some(email) = update.email {
            set.text("email", Some(email));
        }
        if let Some(password) = update.password {
            set.text("password", Some(password));
        }
        if let Some(main_card) = update.main_card {
            let (main_card, main_card_enc) = self.seal_input("main_card", &main_card)?;
            set.text("main_card", Some(main_card));
            set.text("main_card_enc", main_card_enc);
        }
        if let Some(is_verified) = update.is_verified {
            set.int("is_verified", bool_to_int(is_verified));
        }
        if set.is_empty() {
            return Err(StoreError::invalid_input("user update has no fields"));
        }

        debug!(tenant_id, user_id = id, columns = ?set.columns(), "Updating user");
        let sql = set.update_sql("users", "");
        let result = set
            .bind(sqlx::query(&sql), id, tenant_id)
            .execute(self.pool())
            .await
            .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("user"));
        }

        self.get_user_by_id(tenant_id, id).await
    }

    /// Replace the user's main card PAN.
    pub async fn set_user_main_card(&self, tenant_id: &str, id: i64, pan: &str) -> StoreResult<User> {
        self.update_user_columns(
            tenant_id,
            id,
            UserUpdate {
                main_card: Some(pan.to_string()),
                ..UserUpdate::default()
            },
        )
        .await
    }

    async fn hydrate_user(&self, tenant_id: &str, row: &AnyRow) -> StoreResult<User> {
        let mut user = User::from_row(row)?;
        self.hydrator
            .hydrate(
                self.pool(),
                &USER_MAIN_CARD,
                tenant_id,
                user.id,
                &mut user.main_card,
                &mut user.main_card_enc,
            )
            .await?;
        Ok(user)
    }
}
