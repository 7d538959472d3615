use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::SlaStore;
use crate::error::CoreResult;
use snowbridge_shared::{ContractualSla, SlaInstance};

pub struct PgSlaStore {
    pool: PgPool,
}

impl PgSlaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const INSTANCE_COLUMNS: &str = "id, ticket_sys_id, ticket_table, metric, priority, target_hours, \
     status, breached, breach_time, business_hours_elapsed, calendar_hours_elapsed, \
     resolution_time_hours, created_at, updated_at";

#[async_trait]
impl SlaStore for PgSlaStore {
    async fn upsert_instance(&self, instance: &SlaInstance) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sla_instances
            (id, ticket_sys_id, ticket_table, metric, priority, target_hours, status,
             breached, breach_time, business_hours_elapsed, calendar_hours_elapsed,
             resolution_time_hours, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (id) DO UPDATE
            SET status = EXCLUDED.status,
                breached = sla_instances.breached OR EXCLUDED.breached,
                breach_time = COALESCE(sla_instances.breach_time, EXCLUDED.breach_time),
                business_hours_elapsed = EXCLUDED.business_hours_elapsed,
                calendar_hours_elapsed = EXCLUDED.calendar_hours_elapsed,
                resolution_time_hours = EXCLUDED.resolution_time_hours,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(instance.id)
        .bind(&instance.ticket_sys_id)
        .bind(instance.ticket_table.api_name())
        .bind(instance.metric.as_str())
        .bind(instance.priority)
        .bind(instance.target_hours)
        .bind(instance.status.as_str())
        .bind(instance.breached)
        .bind(instance.breach_time)
        .bind(instance.business_hours_elapsed)
        .bind(instance.calendar_hours_elapsed)
        .bind(instance.resolution_time_hours)
        .bind(instance.created_at)
        .bind(instance.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_instance(&self, id: Uuid) -> CoreResult<Option<SlaInstance>> {
        let sql = format!("SELECT {} FROM sla_instances WHERE id = $1", INSTANCE_COLUMNS);
        let instance = sqlx::query_as::<_, SlaInstance>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(instance)
    }

    async fn instances_for_ticket(&self, ticket_sys_id: &str) -> CoreResult<Vec<SlaInstance>> {
        let sql = format!(
            "SELECT {} FROM sla_instances WHERE ticket_sys_id = $1 ORDER BY created_at",
            INSTANCE_COLUMNS
        );
        let instances = sqlx::query_as::<_, SlaInstance>(&sql)
            .bind(ticket_sys_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(instances)
    }

    async fn active_instances(&self) -> CoreResult<Vec<SlaInstance>> {
        let sql = format!(
            "SELECT {} FROM sla_instances WHERE status = 'active' ORDER BY created_at",
            INSTANCE_COLUMNS
        );
        let instances = sqlx::query_as::<_, SlaInstance>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(instances)
    }

    async fn all_instances(&self) -> CoreResult<Vec<SlaInstance>> {
        let sql = format!("SELECT {} FROM sla_instances", INSTANCE_COLUMNS);
        let instances = sqlx::query_as::<_, SlaInstance>(&sql)
            .fetch_all(&self.pool)
            .await?;
        Ok(instances)
    }

    async fn load_contracts(&self) -> CoreResult<Vec<ContractualSla>> {
        let contracts = sqlx::query_as::<_, ContractualSla>(
            "SELECT id, ticket_type, priority, metric_type, sla_hours, business_hours_only, \
             penalty_percentage FROM contractual_slas",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(contracts)
    }
}
