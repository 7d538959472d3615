use async_trait::async_trait;
use sqlx::PgPool;

use super::GroupStore;
use crate::error::CoreResult;
use snowbridge_shared::AssignmentGroup;

pub struct PgGroupStore {
    pool: PgPool,
}

impl PgGroupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl GroupStore for PgGroupStore {
    async fn upsert(&self, group: &AssignmentGroup) -> CoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO assignment_groups (sys_id, name, manager, tags, temperature)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (sys_id) DO UPDATE
            SET name = EXCLUDED.name,
                manager = COALESCE(EXCLUDED.manager, assignment_groups.manager),
                tags = CASE WHEN cardinality(EXCLUDED.tags) = 0
                            THEN assignment_groups.tags ELSE EXCLUDED.tags END,
                temperature = COALESCE(EXCLUDED.temperature, assignment_groups.temperature)
            "#,
        )
        .bind(&group.sys_id)
        .bind(&group.name)
        .bind(&group.manager)
        .bind(&group.tags)
        .bind(group.temperature)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get(&self, sys_id: &str) -> CoreResult<Option<AssignmentGroup>> {
        let group = sqlx::query_as::<_, AssignmentGroup>(
            "SELECT sys_id, name, manager, tags, temperature FROM assignment_groups WHERE sys_id = $1",
        )
        .bind(sys_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(group)
    }

    async fn get_by_name(&self, name: &str) -> CoreResult<Option<AssignmentGroup>> {
        let group = sqlx::query_as::<_, AssignmentGroup>(
            "SELECT sys_id, name, manager, tags, temperature FROM assignment_groups WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(group)
    }
}
