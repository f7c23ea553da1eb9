use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::Row;

use super::error::{StoreError, StoreResult};
use super::store::{now_timestamp, parse_timestamp, require_tenant, Store};

const NOTIFICATION_COLUMNS: &str = "id, tenant_id, mobile, category, title, body, is_read, created_at";

/// A push/SMS notification kept for the user's inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub tenant_id: String,
    pub mobile: String,
    pub category: String,
    pub title: String,
    pub body: String,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(
        mobile: impl Into<String>,
        category: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            tenant_id: String::new(),
            mobile: mobile.into(),
            category: category.into(),
            title: title.into(),
            body: body.into(),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    fn from_row(row: &AnyRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.try_get("id").map_err(StoreError::from_sqlx)?,
            tenant_id: row.try_get("tenant_id").map_err(StoreError::from_sqlx)?,
            mobile: row.try_get("mobile").map_err(StoreError::from_sqlx)?,
            category: row.try_get("category").map_err(StoreError::from_sqlx)?,
            title: row.try_get("title").map_err(StoreError::from_sqlx)?,
            body: row.try_get("body").map_err(StoreError::from_sqlx)?,
            is_read: row.try_get::<i64, _>("is_read").map_err(StoreError::from_sqlx)? != 0,
            created_at: parse_timestamp(
                &row.try_get::<String, _>("created_at").map_err(StoreError::from_sqlx)?,
            )?,
        })
    }
}

impl Store {
    pub async fn create_notification(
        &self,
        tenant_id: &str,
        notification: &mut Notification,
    ) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        let now = now_timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO notifications
             (tenant_id, mobile, category, title, body, is_read, created_at)
             VALUES ($1, $2, $3, $4, $5, 0, $6)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(&notification.mobile)
        .bind(&notification.category)
        .bind(&notification.title)
        .bind(&notification.body)
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        notification.id = id;
        notification.tenant_id = tenant_id.to_string();
        notification.is_read = false;
        notification.created_at = parse_timestamp(&now)?;
        Ok(())
    }

    /// Newest first.
    pub async fn get_notifications(
        &self,
        tenant_id: &str,
        mobile: &str,
        unread_only: bool,
    ) -> StoreResult<Vec<Notification>> {
        require_tenant(tenant_id)?;

        let filter = if unread_only { " AND is_read = 0" } else { "" };
        let rows = sqlx::query(&format!(
            "SELECT {} FROM notifications WHERE mobile = $1 AND tenant_id = $2{} ORDER BY id DESC",
            NOTIFICATION_COLUMNS, filter
        ))
        .bind(mobile)
        .bind(tenant_id)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        rows.iter().map(Notification::from_row).collect()
    }

    /// Returns how many notifications were flipped to read.
    pub async fn mark_notifications_read(&self, tenant_id: &str, mobile: &str) -> StoreResult<u64> {
        require_tenant(tenant_id)?;

        let result = sqlx::query(
            "UPDATE notifications SET is_read = 1
             WHERE mobile = $1 AND tenant_id = $2 AND is_read = 0",
        )
        .bind(mobile)
        .bind(tenant_id)
        .execute(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        Ok(result.rows_affected())
    }
}
