// Postgres automation store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use cadence_shared::{Automation, Enrollment, LogEntry, Step, StepKind, StepType, TriggerType};

use super::{AutomationStore, LogQuery, StoreResult, Transition};

const AUTOMATION_COLUMNS: &str = r#"
    id, name, description, event_id, edition_id, trigger_type, trigger_config, status,
    start_step_id, enrollment_count, completed_count, revision, created_at, updated_at
"#;

const ENROLLMENT_COLUMNS: &str = r#"
    id, automation_id, contact_id, current_step_id, status, started_at, completed_at,
    exited_at, exit_reason, wait_until, sequence, lease_owner, lease_expires_at, updated_at
"#;

const LOG_COLUMNS: &str = r#"
    id, automation_id, enrollment_id, contact_id, step_id, step_type, sequence, attempt,
    status, input, output, error, executed_at
"#;

#[derive(Clone)]
pub struct PgAutomationStore {
    pool: PgPool,
}

impl PgAutomationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn insert_steps(tx: &mut sqlx::Transaction<'_, Postgres>, steps: &[Step]) -> StoreResult<()> {
        for step in steps {
            let (step_type, config) = step.kind.to_parts()?;
            sqlx::query(
                r#"
                INSERT INTO automation_steps (id, automation_id, step_type, config, position, next_step_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(step.id)
            .bind(step.automation_id)
            .bind(step_type)
            .bind(config)
            .bind(step.position)
            .bind(step.next_step_id)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_automation(
        tx: &mut sqlx::Transaction<'_, Postgres>,
        automation: &Automation,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE automations
            SET name = $2, description = $3, event_id = $4, edition_id = $5, trigger_type = $6,
                trigger_config = $7, status = $8, start_step_id = $9, revision = $10, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(automation.id)
        .bind(&automation.name)
        .bind(&automation.description)
        .bind(automation.event_id)
        .bind(automation.edition_id)
        .bind(automation.trigger_type)
        .bind(&automation.trigger_config)
        .bind(automation.status)
        .bind(automation.start_step_id)
        .bind(automation.revision)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl AutomationStore for PgAutomationStore {
    async fn insert_automation(&self, automation: &Automation, steps: &[Step]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO automations
            (id, name, description, event_id, edition_id, trigger_type, trigger_config, status,
             start_step_id, enrollment_count, completed_count, revision, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, $10, $11)
            "#,
        )
        .bind(automation.id)
        .bind(&automation.name)
        .bind(&automation.description)
        .bind(automation.event_id)
        .bind(automation.edition_id)
        .bind(automation.trigger_type)
        .bind(&automation.trigger_config)
        .bind(automation.status)
        .bind(automation.start_step_id)
        .bind(automation.revision)
        .bind(automation.created_at)
        .execute(&mut *tx)
        .await?;

        Self::insert_steps(&mut tx, steps).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_automation(&self, id: Uuid) -> StoreResult<Option<Automation>> {
        let automation = sqlx::query_as::<_, Automation>(&format!(
            "SELECT {AUTOMATION_COLUMNS} FROM automations WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(automation)
    }

    async fn list_automations(&self) -> StoreResult<Vec<Automation>> {
        let automations = sqlx::query_as::<_, Automation>(&format!(
            "SELECT {AUTOMATION_COLUMNS} FROM automations ORDER BY created_at ASC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(automations)
    }

    async fn update_automation(&self, automation: &Automation) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_automation(&mut tx, automation).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn replace_steps(&self, automation: &Automation, steps: &[Step]) -> StoreResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::write_automation(&mut tx, automation).await?;

        sqlx::query("DELETE FROM automation_steps WHERE automation_id = $1")
            .bind(automation.id)
            .execute(&mut *tx)
            .await?;
        Self::insert_steps(&mut tx, steps).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn get_steps(&self, automation_id: Uuid) -> StoreResult<Vec<Step>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, StepType, serde_json::Value, i32, Option<Uuid>)>(
            r#"
            SELECT id, automation_id, step_type, config, position, next_step_id
            FROM automation_steps
            WHERE automation_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(automation_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, automation_id, step_type, config, position, next_step_id)| {
                Ok(Step {
                    id,
                    automation_id,
                    position,
                    next_step_id,
                    kind: StepKind::from_parts(step_type, config)?,
                })
            })
            .collect()
    }

    async fn active_automations_for_trigger(&self, trigger_type: TriggerType) -> StoreResult<Vec<Automation>> {
        let automations = sqlx::query_as::<_, Automation>(&format!(
            "SELECT {AUTOMATION_COLUMNS} FROM automations WHERE trigger_type = $1 AND status = 'active'"
        ))
        .bind(trigger_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(automations)
    }

    async fn create_enrollment_if_absent(&self, enrollment: &Enrollment) -> StoreResult<bool> {
        let mut tx = self.pool.begin().await?;

        let inserted: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO automation_enrollments
            (id, automation_id, contact_id, current_step_id, status, started_at, sequence)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (automation_id, contact_id) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(enrollment.id)
        .bind(enrollment.automation_id)
        .bind(enrollment.contact_id)
        .bind(enrollment.current_step_id)
        .bind(enrollment.status)
        .bind(enrollment.started_at)
        .bind(enrollment.sequence)
        .fetch_optional(&mut *tx)
        .await?;

        if inserted.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query("UPDATE automations SET enrollment_count = enrollment_count + 1 WHERE id = $1")
            .bind(enrollment.automation_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(true)
    }

    async fn get_enrollment(&self, id: Uuid) -> StoreResult<Option<Enrollment>> {
        let enrollment = sqlx::query_as::<_, Enrollment>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM automation_enrollments WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enrollment)
    }

    async fn list_enrollments(&self, automation_id: Uuid, limit: i64) -> StoreResult<Vec<Enrollment>> {
        let enrollments = sqlx::query_as::<_, Enrollment>(&format!(
            "SELECT {ENROLLMENT_COLUMNS} FROM automation_enrollments
             WHERE automation_id = $1 ORDER BY started_at DESC LIMIT $2"
        ))
        .bind(automation_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(enrollments)
    }

    async fn runnable_enrollments(&self, now: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Uuid>> {
        let ids: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT e.id
            FROM automation_enrollments e
            JOIN automations a ON a.id = e.automation_id
            WHERE e.status = 'active'
              AND a.status = 'active'
              AND (e.wait_until IS NULL OR e.wait_until <= $1)
              AND (e.lease_expires_at IS NULL OR e.lease_expires_at <= $1)
            ORDER BY COALESCE(e.wait_until, e.started_at) ASC
            LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn claim_enrollment(
        &self,
        id: Uuid,
        owner: Uuid,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
    ) -> StoreResult<Option<Enrollment>> {
        let enrollment = sqlx::query_as::<_, Enrollment>(&format!(
            r#"
            UPDATE automation_enrollments
            SET lease_owner = $2, lease_expires_at = $3
            WHERE id = $1
              AND status = 'active'
              AND (lease_expires_at IS NULL OR lease_expires_at <= $4)
            RETURNING {ENROLLMENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(owner)
        .bind(lease_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(enrollment)
    }

    async fn release_enrollment(&self, id: Uuid, owner: Uuid) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE automation_enrollments
            SET lease_owner = NULL, lease_expires_at = NULL
            WHERE id = $1 AND lease_owner = $2
            "#,
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn commit_transition(&self, transition: &Transition) -> StoreResult<bool> {
        let next = &transition.enrollment;
        let mut tx = self.pool.begin().await?;

        let previous: Option<(cadence_shared::EnrollmentStatus,)> = sqlx::query_as(
            r#"
            SELECT status FROM automation_enrollments
            WHERE id = $1 AND lease_owner = $2
            FOR UPDATE
            "#,
        )
        .bind(next.id)
        .bind(transition.lease_owner)
        .fetch_optional(&mut *tx)
        .await?;

        let Some((previous_status,)) = previous else {
            tx.rollback().await?;
            return Ok(false);
        };

        sqlx::query(
            r#"
            UPDATE automation_enrollments
            SET current_step_id = $2, status = $3, completed_at = $4, exited_at = $5,
                exit_reason = $6, wait_until = $7, sequence = $8,
                lease_owner = NULL, lease_expires_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(next.id)
        .bind(next.current_step_id)
        .bind(next.status)
        .bind(next.completed_at)
        .bind(next.exited_at)
        .bind(&next.exit_reason)
        .bind(next.wait_until)
        .bind(next.sequence)
        .execute(&mut *tx)
        .await?;

        if let Some(log) = &transition.log {
            insert_log(&mut *tx, log).await?;
        }

        if previous_status != cadence_shared::EnrollmentStatus::Completed
            && next.status == cadence_shared::EnrollmentStatus::Completed
        {
            sqlx::query("UPDATE automations SET completed_count = completed_count + 1 WHERE id = $1")
                .bind(next.automation_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn append_log(&self, entry: &LogEntry) -> StoreResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_log(&mut *conn, entry).await
    }

    async fn completed_attempt(
        &self,
        enrollment_id: Uuid,
        step_id: Uuid,
        sequence: i32,
    ) -> StoreResult<Option<LogEntry>> {
        let entry = sqlx::query_as::<_, LogEntry>(&format!(
            r#"
            SELECT {LOG_COLUMNS} FROM automation_logs
            WHERE enrollment_id = $1 AND step_id = $2 AND sequence = $3 AND status = 'completed'
            LIMIT 1
            "#
        ))
        .bind(enrollment_id)
        .bind(step_id)
        .bind(sequence)
        .fetch_optional(&self.pool)
        .await?;
        Ok(entry)
    }

    async fn query_logs(&self, query: &LogQuery) -> StoreResult<Vec<LogEntry>> {
        let mut builder: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {LOG_COLUMNS} FROM automation_logs WHERE TRUE"));

        if let Some(automation_id) = query.automation_id {
            builder.push(" AND automation_id = ").push_bind(automation_id);
        }
        if let Some(enrollment_id) = query.enrollment_id {
            builder.push(" AND enrollment_id = ").push_bind(enrollment_id);
        }
        if let Some(contact_id) = query.contact_id {
            builder.push(" AND contact_id = ").push_bind(contact_id);
        }
        builder
            .push(" ORDER BY executed_at DESC LIMIT ")
            .push_bind(query.effective_limit());

        let entries = builder.build_query_as::<LogEntry>().fetch_all(&self.pool).await?;
        Ok(entries)
    }

    async fn purge_logs_before(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM automation_logs l
            USING automation_enrollments e
            WHERE l.enrollment_id = e.id
              AND e.status <> 'active'
              AND l.executed_at < $1
            "#,
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

async fn insert_log<'e, E>(executor: E, entry: &LogEntry) -> StoreResult<()>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO automation_logs
        (id, automation_id, enrollment_id, contact_id, step_id, step_type, sequence, attempt,
         status, input, output, error, executed_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
        "#,
    )
    .bind(entry.id)
    .bind(entry.automation_id)
    .bind(entry.enrollment_id)
    .bind(entry.contact_id)
    .bind(entry.step_id)
    .bind(entry.step_type)
    .bind(entry.sequence)
    .bind(entry.attempt)
    .bind(entry.status)
    .bind(&entry.input)
    .bind(&entry.output)
    .bind(&entry.error)
    .bind(entry.executed_at)
    .execute(executor)
    .await?;
    Ok(())
}
