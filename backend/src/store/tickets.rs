use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use super::TicketStore;
use crate::error::{CoreError, CoreResult};
use crate::upstream::{parse_sn_datetime, raw_string};
use snowbridge_shared::{TicketDocument, TicketTable};

pub struct PgTicketStore {
    pool: PgPool,
}

impl PgTicketStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_document(row: sqlx::postgres::PgRow) -> CoreResult<TicketDocument> {
        let table: String = row.try_get("table_name")?;
        let table = table
            .parse::<TicketTable>()
            .map_err(|e| CoreError::validation("table_name", e))?;

        let slm_data: Value = row.try_get("slm_data")?;
        let notes_data: Value = row.try_get("notes_data")?;
        let metadata: Value = row.try_get("metadata")?;

        Ok(TicketDocument {
            sys_id: row.try_get("sys_id")?,
            number: row.try_get("number")?,
            table,
            raw_data: row.try_get("raw_data")?,
            slm_data: serde_json::from_value(slm_data)?,
            notes_data: serde_json::from_value(notes_data)?,
            metadata: serde_json::from_value(metadata)?,
        })
    }

    /// Derived timestamp projections for the indexed columns. The raw glide
    /// timestamps win; the sync bookkeeping time is the fallback.
    fn projected_times(doc: &TicketDocument) -> (DateTime<Utc>, DateTime<Utc>) {
        let created = doc
            .raw_data
            .get("sys_created_on")
            .and_then(raw_string)
            .and_then(|s| parse_sn_datetime(&s))
            .unwrap_or(doc.metadata.last_update);
        let updated = doc
            .raw_data
            .get("sys_updated_on")
            .and_then(raw_string)
            .and_then(|s| parse_sn_datetime(&s))
            .unwrap_or(doc.metadata.last_update);
        (created, updated)
    }
}

#[async_trait]
impl TicketStore for PgTicketStore {
    async fn upsert(&self, doc: &TicketDocument) -> CoreResult<()> {
        let (created_at, updated_at) = Self::projected_times(doc);
        let sql = format!(
            r#"
            INSERT INTO {} (sys_id, number, table_name, raw_data, slm_data, notes_data, metadata, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (sys_id) DO UPDATE
            SET number = EXCLUDED.number,
                raw_data = EXCLUDED.raw_data,
                slm_data = EXCLUDED.slm_data,
                notes_data = EXCLUDED.notes_data,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
            doc.table.collection()
        );

        sqlx::query(&sql)
            .bind(&doc.sys_id)
            .bind(&doc.number)
            .bind(doc.table.api_name())
            .bind(&doc.raw_data)
            .bind(serde_json::to_value(&doc.slm_data)?)
            .bind(serde_json::to_value(&doc.notes_data)?)
            .bind(serde_json::to_value(&doc.metadata)?)
            .bind(created_at)
            .bind(updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get(&self, table: TicketTable, sys_id: &str) -> CoreResult<Option<TicketDocument>> {
        let sql = format!(
            "SELECT sys_id, number, table_name, raw_data, slm_data, notes_data, metadata FROM {} WHERE sys_id = $1",
            table.collection()
        );

        let row = sqlx::query(&sql)
            .bind(sys_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_document).transpose()
    }

    async fn get_by_number(
        &self,
        table: TicketTable,
        number: &str,
    ) -> CoreResult<Option<TicketDocument>> {
        let sql = format!(
            "SELECT sys_id, number, table_name, raw_data, slm_data, notes_data, metadata FROM {} WHERE number = $1",
            table.collection()
        );

        let row = sqlx::query(&sql)
            .bind(number)
            .fetch_optional(&self.pool)
            .await?;

        row.map(Self::row_to_document).transpose()
    }

    async fn delete(&self, table: TicketTable, sys_id: &str) -> CoreResult<bool> {
        let sql = format!("DELETE FROM {} WHERE sys_id = $1", table.collection());
        let result = sqlx::query(&sql).bind(sys_id).execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn count(&self, table: TicketTable) -> CoreResult<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", table.collection());
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }
}
