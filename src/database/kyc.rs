use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::Row;
use std::fmt;
use std::str::FromStr;

use super::error::{StoreError, StoreErrorKind, StoreResult};
use super::store::{now_timestamp, parse_timestamp, require_tenant, Store};

const KYC_COLUMNS: &str =
    "id, tenant_id, user_id, mobile, passport_img, selfie, status, created_at, updated_at";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KycStatus {
    Pending,
    Approved,
    Rejected,
}

impl KycStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KycStatus::Pending => "pending",
            KycStatus::Approved => "approved",
            KycStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for KycStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KycStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(KycStatus::Pending),
            "approved" => Ok(KycStatus::Approved),
            "rejected" => Ok(KycStatus::Rejected),
            other => Err(StoreError::new(StoreErrorKind::Unknown {
                message: format!("unknown KYC status '{}'", other),
            })),
        }
    }
}

/// Identity documents submitted by a user.
#[derive(Debug, Clone, PartialEq)]
pub struct Kyc {
    pub id: i64,
    pub tenant_id: String,
    pub user_id: i64,
    pub mobile: String,
    /// Object-storage reference, not the image itself
    pub passport_img: String,
    pub selfie: String,
    pub status: KycStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Kyc {
    pub fn new(
        user_id: i64,
        mobile: impl Into<String>,
        passport_img: impl Into<String>,
        selfie: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            tenant_id: String::new(),
            user_id,
            mobile: mobile.into(),
            passport_img: passport_img.into(),
            selfie: selfie.into(),
            status: KycStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn from_row(row: &AnyRow) -> StoreResult<Self> {
        Ok(Self {
            id: row.try_get("id").map_err(StoreError::from_sqlx)?,
            tenant_id: row.try_get("tenant_id").map_err(StoreError::from_sqlx)?,
            user_id: row.try_get("user_id").map_err(StoreError::from_sqlx)?,
            mobile: row.try_get("mobile").map_err(StoreError::from_sqlx)?,
            passport_img: row.try_get("passport_img").map_err(StoreError::from_sqlx)?,
            selfie: row.try_get("selfie").map_err(StoreError::from_sqlx)?,
            status: row
                .try_get::<String, _>("status")
                .map_err(StoreError::from_sqlx)?
                .parse()?,
            created_at: parse_timestamp(
                &row.try_get::<String, _>("created_at").map_err(StoreError::from_sqlx)?,
            )?,
            updated_at: parse_timestamp(
                &row.try_get::<String, _>("updated_at").map_err(StoreError::from_sqlx)?,
            )?,
        })
    }
}

impl Store {
    pub async fn create_kyc(&self, tenant_id: &str, kyc: &mut Kyc) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        let now = now_timestamp();
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO kyc
             (tenant_id, user_id, mobile, passport_img, selfie, status, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(kyc.user_id)
        .bind(&kyc.mobile)
        .bind(&kyc.passport_img)
        .bind(&kyc.selfie)
        .bind(kyc.status.as_str())
        .bind(&now)
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        kyc.id = id;
        kyc.tenant_id = tenant_id.to_string();
        kyc.created_at = parse_timestamp(&now)?;
        kyc.updated_at = kyc.created_at;
        Ok(())
    }

    /// Latest submission for `mobile`.
    pub async fn get_kyc_by_mobile(&self, tenant_id: &str, mobile: &str) -> StoreResult<Kyc> {
        require_tenant(tenant_id)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM kyc WHERE mobile = $1 AND tenant_id = $2 ORDER BY id DESC LIMIT 1",
            KYC_COLUMNS
        ))
        .bind(mobile)
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("kyc"))?;

        Kyc::from_row(&row)
    }

    pub async fn update_kyc_status(
        &self,
        tenant_id: &str,
        id: i64,
        status: KycStatus,
    ) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        let result = sqlx::query(
            "UPDATE kyc SET status = $1, updated_at = $2 WHERE id = $3 AND tenant_id = $4",
        )
        .bind(status.as_str())
        .bind(now_timestamp())
        .bind(id)
        .bind(tenant_id)
        .execute(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::not_found("kyc"));
        }
        Ok(())
    }
}
