use crate::error::CoreError;
use crate::models::{Lesson, RecurrenceData, RecurrenceRule};
use crate::recurrence::validate_rule;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

#[async_trait]
impl super::SeriesRepository for SqliteRepository {
    async fn create_rule_for_lesson(
        &self,
        lesson_id: i64,
        data: RecurrenceData,
    ) -> Result<RecurrenceRule, CoreError> {
        let mut tx = self.pool().begin().await?;

        let lesson: Lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(lesson_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Lesson with id {} not found", lesson_id)))?;
        if lesson.series_id.is_some() {
            return Err(CoreError::InvalidInput(format!(
                "Lesson {} already belongs to a series",
                lesson_id
            )));
        }

        let rule = Self::create_rule_in_transaction(&mut tx, &lesson, data).await?;
        Self::materialize_rule_in_transaction(
            &mut tx,
            rule.id,
            self.materialization_config(),
            Utc::now(),
        )
        .await?;

        // The new instances may already be covered by a standing deposit.
        Self::sync_prepayment_in_transaction(&mut tx, lesson.student_id).await?;

        tx.commit().await?;
        Ok(rule)
    }

    async fn find_rule_by_id(&self, id: i64) -> Result<Option<RecurrenceRule>, CoreError> {
        let rule = sqlx::query_as("SELECT * FROM recurrence_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(rule)
    }

    async fn find_rule_by_base_lesson(
        &self,
        lesson_id: i64,
    ) -> Result<Option<RecurrenceRule>, CoreError> {
        let rule = sqlx::query_as("SELECT * FROM recurrence_rules WHERE base_lesson_id = $1")
            .bind(lesson_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(rule)
    }

    async fn find_rules_intersecting(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RecurrenceRule>, CoreError> {
        // A rule intersects the window unless it starts after the window
        // ends or ran out before it begins.
        let rules = sqlx::query_as(
            r#"SELECT * FROM recurrence_rules
            WHERE start_at < $1
            AND (until_at IS NULL OR until_at >= $2)
            ORDER BY start_at"#,
        )
        .bind(to)
        .bind(from)
        .fetch_all(self.pool())
        .await?;
        Ok(rules)
    }

    async fn delete_rule(&self, id: i64) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;

        let rule: RecurrenceRule = sqlx::query_as("SELECT * FROM recurrence_rules WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Rule with id {} not found", id)))?;

        Self::delete_rule_in_transaction(&mut tx, &rule).await?;

        tx.commit().await?;
        Ok(())
    }
}

impl SqliteRepository {
    /// Validates and inserts a rule anchored at the base lesson's start,
    /// and marks the lesson as the series base, within an existing
    /// transaction. The caller is responsible for materialization.
    pub(crate) async fn create_rule_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        base: &Lesson,
        data: RecurrenceData,
    ) -> Result<RecurrenceRule, CoreError> {
        let mut rule = RecurrenceRule {
            id: 0,
            base_lesson_id: base.id,
            frequency: data.frequency,
            interval: data.interval,
            weekdays: data.weekdays,
            start_at: base.start_at,
            until_at: data.until_at,
            timezone: data.timezone,
            created_at: Utc::now(),
        };
        // Reject a malformed descriptor before anything is written.
        validate_rule(&rule)?;

        let result = sqlx::query(
            r#"INSERT INTO recurrence_rules (base_lesson_id, frequency, interval, weekdays, start_at, until_at, timezone, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"#,
        )
        .bind(rule.base_lesson_id)
        .bind(rule.frequency)
        .bind(rule.interval)
        .bind(rule.weekdays.to_string())
        .bind(rule.start_at)
        .bind(rule.until_at)
        .bind(&rule.timezone)
        .bind(rule.created_at)
        .execute(&mut **tx)
        .await?;
        rule.id = result.last_insert_rowid();

        sqlx::query("UPDATE lessons SET series_id = $1, updated_at = $2 WHERE id = $3")
            .bind(rule.id)
            .bind(Utc::now())
            .bind(base.id)
            .execute(&mut **tx)
            .await?;

        Ok(rule)
    }

    /// Removes a rule and its exceptions, and detaches every lesson that
    /// referenced the series. Detached instances become ordinary lessons.
    pub(crate) async fn delete_rule_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        rule: &RecurrenceRule,
    ) -> Result<(), CoreError> {
        sqlx::query("DELETE FROM recurrence_exceptions WHERE series_id = $1")
            .bind(rule.id)
            .execute(&mut **tx)
            .await?;

        sqlx::query(
            "UPDATE lessons SET series_id = NULL, is_instance = 0, updated_at = $1 WHERE series_id = $2",
        )
        .bind(Utc::now())
        .bind(rule.id)
        .execute(&mut **tx)
        .await?;

        sqlx::query("DELETE FROM recurrence_rules WHERE id = $1")
            .bind(rule.id)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }
}
