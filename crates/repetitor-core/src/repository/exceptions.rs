use crate::error::CoreError;
use crate::models::{
    ExceptionType, Lesson, OverrideFields, PaymentStatus, RecurrenceException, RecurrenceRule,
};
use crate::recurrence::expand_rule;
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, Transaction};

#[async_trait]
impl super::ExceptionRepository for SqliteRepository {
    async fn cancel_occurrence(
        &self,
        series_id: i64,
        original_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;
        let rule = Self::load_rule_for_occurrence(&mut tx, series_id, original_at).await?;

        // A persisted row is authoritative; cancel it directly instead of
        // recording an exception it would shadow anyway.
        if let Some(instance) =
            Self::find_instance_at(&mut tx, rule.id, original_at).await?
        {
            sqlx::query(
                "UPDATE lessons SET payment_status = $1, updated_at = $2 WHERE id = $3",
            )
            .bind(PaymentStatus::Cancelled)
            .bind(Utc::now())
            .bind(instance.id)
            .execute(&mut *tx)
            .await?;

            // Cancellation frees any allocated deposit funds.
            Self::sync_prepayment_in_transaction(&mut tx, instance.student_id).await?;
        } else {
            Self::upsert_exception_in_transaction(
                &mut tx,
                rule.id,
                original_at,
                ExceptionType::Cancelled,
                OverrideFields::default(),
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn override_occurrence(
        &self,
        series_id: i64,
        original_at: DateTime<Utc>,
        fields: OverrideFields,
    ) -> Result<(), CoreError> {
        if fields.new_duration_min.map_or(false, |m| m <= 0) {
            return Err(CoreError::InvalidInput(
                "Override duration must be positive".to_string(),
            ));
        }
        if fields.new_price_cents.map_or(false, |p| p < 0) {
            return Err(CoreError::InvalidInput(
                "Override price cannot be negative".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;
        let rule = Self::load_rule_for_occurrence(&mut tx, series_id, original_at).await?;

        if let Some(instance) =
            Self::find_instance_at(&mut tx, rule.id, original_at).await?
        {
            let start_at = fields.new_start_at.unwrap_or(instance.start_at);
            let end_at = match fields.new_duration_min {
                Some(minutes) => start_at + Duration::minutes(minutes),
                None => start_at + instance.duration(),
            };
            sqlx::query(
                r#"UPDATE lessons SET start_at = $1, end_at = $2,
                price_cents = COALESCE($3, price_cents),
                note = COALESCE($4, note),
                updated_at = $5 WHERE id = $6"#,
            )
            .bind(start_at)
            .bind(end_at)
            .bind(fields.new_price_cents)
            .bind(&fields.new_note)
            .bind(Utc::now())
            .bind(instance.id)
            .execute(&mut *tx)
            .await?;

            // A price change can shift what the deposit still covers.
            Self::sync_prepayment_in_transaction(&mut tx, instance.student_id).await?;
        } else {
            Self::upsert_exception_in_transaction(
                &mut tx,
                rule.id,
                original_at,
                ExceptionType::Overridden,
                fields,
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn remove_exception(
        &self,
        series_id: i64,
        original_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            "DELETE FROM recurrence_exceptions WHERE series_id = $1 AND original_at = $2",
        )
        .bind(series_id)
        .bind(original_at)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::NotFound(format!(
                "Exception not found for series {} at {}",
                series_id, original_at
            )));
        }
        Ok(())
    }

    async fn find_exceptions_for_series(
        &self,
        series_id: i64,
    ) -> Result<Vec<RecurrenceException>, CoreError> {
        let exceptions = sqlx::query_as(
            "SELECT * FROM recurrence_exceptions WHERE series_id = $1 ORDER BY original_at",
        )
        .bind(series_id)
        .fetch_all(self.pool())
        .await?;
        Ok(exceptions)
    }
}

impl SqliteRepository {
    /// Loads the rule and checks the targeted time really is one of its
    /// unperturbed candidates.
    async fn load_rule_for_occurrence(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: i64,
        original_at: DateTime<Utc>,
    ) -> Result<RecurrenceRule, CoreError> {
        let rule: RecurrenceRule = sqlx::query_as("SELECT * FROM recurrence_rules WHERE id = $1")
            .bind(series_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| {
                CoreError::NotFound(format!("Series with id {} not found", series_id))
            })?;

        let candidates = expand_rule(&rule, original_at, original_at + Duration::seconds(1))?;
        if !candidates.contains(&original_at) {
            return Err(CoreError::InvalidInput(format!(
                "{} is not an occurrence of series {}",
                original_at, series_id
            )));
        }
        Ok(rule)
    }

    async fn find_instance_at(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: i64,
        start_at: DateTime<Utc>,
    ) -> Result<Option<Lesson>, CoreError> {
        let lesson = sqlx::query_as(
            "SELECT * FROM lessons WHERE series_id = $1 AND start_at = $2",
        )
        .bind(series_id)
        .bind(start_at)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(lesson)
    }

    /// At most one exception may exist per `(series_id, original_at)`; a
    /// second write replaces the first.
    pub(crate) async fn upsert_exception_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        series_id: i64,
        original_at: DateTime<Utc>,
        exception_type: ExceptionType,
        fields: OverrideFields,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"INSERT INTO recurrence_exceptions
            (series_id, original_at, exception_type, new_start_at, new_duration_min, new_note, new_price_cents, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (series_id, original_at) DO UPDATE SET
                exception_type = excluded.exception_type,
                new_start_at = excluded.new_start_at,
                new_duration_min = excluded.new_duration_min,
                new_note = excluded.new_note,
                new_price_cents = excluded.new_price_cents"#,
        )
        .bind(series_id)
        .bind(original_at)
        .bind(exception_type)
        .bind(fields.new_start_at)
        .bind(fields.new_duration_min)
        .bind(&fields.new_note)
        .bind(fields.new_price_cents)
        .bind(Utc::now())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}
