use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::any::AnyRow;
use sqlx::Row;
use tracing::debug;
use uuid::Uuid;

use super::error::{StoreError, StoreErrorKind, StoreResult};
use super::store::{now_timestamp, parse_timestamp, require_tenant, Page, Store};
use crate::logging::mask_pan;

const TRANSACTION_COLUMNS: &str = "id, tenant_id, uuid, ebs_uuid, terminal_id, \
                                   system_trace_audit_number, tran_date_time, tran_amount, \
                                   response_code, response_message, masked_pan, payload, created_at";

/// A switch response recorded for auditing. Only a masked PAN is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EbsTransaction {
    pub id: i64,
    pub tenant_id: String,
    pub uuid: String,
    pub ebs_uuid: Option<String>,
    pub terminal_id: String,
    pub system_trace_audit_number: i64,
    pub tran_date_time: String,
    pub tran_amount: f64,
    pub response_code: i64,
    pub response_message: String,
    pub masked_pan: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl EbsTransaction {
    pub fn new(terminal_id: impl Into<String>, response_code: i64, response_message: impl Into<String>) -> Self {
        Self {
            id: 0,
            tenant_id: String::new(),
            uuid: String::new(),
            ebs_uuid: None,
            terminal_id: terminal_id.into(),
            system_trace_audit_number: 0,
            tran_date_time: String::new(),
            tran_amount: 0.0,
            response_code,
            response_message: response_message.into(),
            masked_pan: None,
            payload: serde_json::Value::Null,
            created_at: Utc::now(),
        }
    }

    pub fn is_successful(&self) -> bool {
        self.response_code == 0
    }

    fn from_row(row: &AnyRow) -> StoreResult<Self> {
        let payload: Option<String> = row.try_get("payload").map_err(StoreError::from_sqlx)?;
        let payload = match payload {
            Some(text) if !text.is_empty() => serde_json::from_str(&text).map_err(|e| {
                StoreError::new(StoreErrorKind::Unknown {
                    message: format!("invalid stored transaction payload: {}", e),
                })
            })?,
            _ => serde_json::Value::Null,
        };

        Ok(Self {
            id: row.try_get("id").map_err(StoreError::from_sqlx)?,
            tenant_id: row.try_get("tenant_id").map_err(StoreError::from_sqlx)?,
            uuid: row.try_get("uuid").map_err(StoreError::from_sqlx)?,
            ebs_uuid: row.try_get("ebs_uuid").map_err(StoreError::from_sqlx)?,
            terminal_id: row.try_get("terminal_id").map_err(StoreError::from_sqlx)?,
            system_trace_audit_number: row
                .try_get("system_trace_audit_number")
                .map_err(StoreError::from_sqlx)?,
            tran_date_time: row
                .try_get::<Option<String>, _>("tran_date_time")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            tran_amount: row.try_get("tran_amount").map_err(StoreError::from_sqlx)?,
            response_code: row.try_get("response_code").map_err(StoreError::from_sqlx)?,
            response_message: row
                .try_get::<Option<String>, _>("response_message")
                .map_err(StoreError::from_sqlx)?
                .unwrap_or_default(),
            masked_pan: row.try_get("masked_pan").map_err(StoreError::from_sqlx)?,
            payload,
            created_at: parse_timestamp(
                &row.try_get::<String, _>("created_at").map_err(StoreError::from_sqlx)?,
            )?,
        })
    }
}

impl Store {
    /// Record a switch response. A raw PAN in `masked_pan` is masked before
    /// it is written.
    pub async fn create_transaction(
        &self,
        tenant_id: &str,
        transaction: &mut EbsTransaction,
    ) -> StoreResult<()> {
        require_tenant(tenant_id)?;

        if transaction.uuid.is_empty() {
            transaction.uuid = Uuid::new_v4().to_string();
        }
        transaction.masked_pan = transaction.masked_pan.as_deref().map(mask_pan);

        let payload = serde_json::to_string(&transaction.payload)
            .map_err(|e| StoreError::invalid_input(format!("unserializable payload: {}", e)))?;
        let now = now_timestamp();

        let id: i64 = sqlx::query_scalar(
            "INSERT INTO transactions
             (tenant_id, uuid, ebs_uuid, terminal_id, system_trace_audit_number, tran_date_time,
              tran_amount, response_code, response_message, masked_pan, payload, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             RETURNING id",
        )
        .bind(tenant_id)
        .bind(&transaction.uuid)
        .bind(&transaction.ebs_uuid)
        .bind(&transaction.terminal_id)
        .bind(transaction.system_trace_audit_number)
        .bind(&transaction.tran_date_time)
        .bind(transaction.tran_amount)
        .bind(transaction.response_code)
        .bind(&transaction.response_message)
        .bind(&transaction.masked_pan)
        .bind(&payload)
        .bind(&now)
        .fetch_one(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        transaction.id = id;
        transaction.tenant_id = tenant_id.to_string();
        transaction.created_at = parse_timestamp(&now)?;

        debug!(
            tenant_id,
            transaction_id = id,
            terminal_id = %transaction.terminal_id,
            response_code = transaction.response_code,
            "Recorded transaction"
        );
        Ok(())
    }

    pub async fn get_transaction_by_uuid(
        &self,
        tenant_id: &str,
        uuid: &str,
    ) -> StoreResult<EbsTransaction> {
        require_tenant(tenant_id)?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM transactions WHERE uuid = $1 AND tenant_id = $2",
            TRANSACTION_COLUMNS
        ))
        .bind(uuid)
        .bind(tenant_id)
        .fetch_optional(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?
        .ok_or_else(|| StoreError::not_found("transaction"))?;

        EbsTransaction::from_row(&row)
    }

    /// Newest first.
    pub async fn get_transactions_by_terminal(
        &self,
        tenant_id: &str,
        terminal_id: &str,
        page: Page,
    ) -> StoreResult<Vec<EbsTransaction>> {
        require_tenant(tenant_id)?;

        let rows = sqlx::query(&format!(
            "SELECT {} FROM transactions
             WHERE terminal_id = $1 AND tenant_id = $2
             ORDER BY id DESC
             LIMIT $3 OFFSET $4",
            TRANSACTION_COLUMNS
        ))
        .bind(terminal_id)
        .bind(tenant_id)
        .bind(page.limit)
        .bind(page.offset)
        .fetch_all(self.pool())
        .await
        .map_err(StoreError::from_sqlx)?;

        rows.iter().map(EbsTransaction::from_row).collect()
    }
}
