use crate::error::CoreError;
use crate::models::{Lesson, MaterializationConfig, RecurrenceException, RecurrenceRule};
use crate::recurrence::expand_rule;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, Transaction};
use std::collections::HashSet;

#[async_trait]
impl super::MaterializationRepository for SqliteRepository {
    async fn materialize_rule(&self, rule_id: i64) -> Result<usize, CoreError> {
        let mut tx = self.pool().begin().await?;
        let created = Self::materialize_rule_in_transaction(
            &mut tx,
            rule_id,
            self.materialization_config(),
            Utc::now(),
        )
        .await?;

        if created > 0 {
            let student_id: i64 = sqlx::query_scalar(
                r#"SELECT l.student_id FROM lessons l
                JOIN recurrence_rules r ON r.base_lesson_id = l.id
                WHERE r.id = $1"#,
            )
            .bind(rule_id)
            .fetch_one(&mut *tx)
            .await?;
            Self::sync_prepayment_in_transaction(&mut tx, student_id).await?;
        }

        tx.commit().await?;
        Ok(created)
    }
}

impl SqliteRepository {
    /// Persists the rule's occurrences up to `now + lookahead_days` as
    /// instance lessons, within an existing transaction.
    ///
    /// A candidate is skipped when an instance row already exists at the
    /// same `(series_id, start_at)` (the base lesson included) or when any
    /// exception targets it — excepted occurrences stay virtual. This makes
    /// re-runs idempotent.
    pub(crate) async fn materialize_rule_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        rule_id: i64,
        config: &MaterializationConfig,
        now: DateTime<Utc>,
    ) -> Result<usize, CoreError> {
        let rule: RecurrenceRule = sqlx::query_as("SELECT * FROM recurrence_rules WHERE id = $1")
            .bind(rule_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Rule with id {} not found", rule_id)))?;

        let base: Lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(rule.base_lesson_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!(
                    "Base lesson with id {} not found for rule {}",
                    rule.base_lesson_id, rule.id
                ))
            })?;

        let existing: Vec<Lesson> = sqlx::query_as("SELECT * FROM lessons WHERE series_id = $1")
            .bind(rule.id)
            .fetch_all(&mut **tx)
            .await?;
        let existing_starts: HashSet<DateTime<Utc>> =
            existing.iter().map(|l| l.start_at).collect();

        let exceptions: Vec<RecurrenceException> =
            sqlx::query_as("SELECT * FROM recurrence_exceptions WHERE series_id = $1")
                .bind(rule.id)
                .fetch_all(&mut **tx)
                .await?;
        let excepted: HashSet<DateTime<Utc>> =
            exceptions.iter().map(|ex| ex.original_at).collect();

        let window_end = now + Duration::days(config.lookahead_days);
        let candidates = expand_rule(&rule, rule.start_at, window_end)?;

        let mut created = 0;
        for candidate in candidates {
            if existing_starts.contains(&candidate) || excepted.contains(&candidate) {
                continue;
            }

            Self::insert_lesson_in_transaction(
                tx,
                Lesson {
                    student_id: base.student_id,
                    subject: base.subject.clone(),
                    start_at: candidate,
                    end_at: candidate + base.duration(),
                    price_cents: base.price_cents,
                    note: base.note.clone(),
                    series_id: Some(rule.id),
                    is_instance: true,
                    ..Default::default()
                },
            )
            .await?;

            created += 1;
            if created >= config.max_instances {
                break;
            }
        }

        Ok(created)
    }
}
