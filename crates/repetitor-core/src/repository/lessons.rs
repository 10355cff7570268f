use crate::error::CoreError;
use crate::models::{
    ExceptionType, Lesson, NewLessonData, OverrideFields, PaymentStatus, RecurrenceRule, Student,
};
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, Transaction};

#[async_trait]
impl super::LessonRepository for SqliteRepository {
    async fn add_lesson(&self, data: NewLessonData) -> Result<Lesson, CoreError> {
        if data.end_at <= data.start_at {
            return Err(CoreError::InvalidInput(
                "Lesson end must be after its start".to_string(),
            ));
        }
        if data.price_cents < 0 {
            return Err(CoreError::InvalidInput(
                "Lesson price cannot be negative".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;

        let student: Option<Student> = sqlx::query_as("SELECT * FROM students WHERE id = $1")
            .bind(data.student_id)
            .fetch_optional(&mut *tx)
            .await?;
        if student.is_none() {
            return Err(CoreError::NotFound(format!(
                "Student with id {} not found",
                data.student_id
            )));
        }

        let lesson = Self::insert_lesson_in_transaction(
            &mut tx,
            Lesson {
                student_id: data.student_id,
                subject: data.subject,
                start_at: data.start_at,
                end_at: data.end_at,
                price_cents: data.price_cents,
                note: data.note,
                ..Default::default()
            },
        )
        .await?;

        if let Some(recurrence) = data.recurrence {
            let rule = Self::create_rule_in_transaction(&mut tx, &lesson, recurrence).await?;

            Self::materialize_rule_in_transaction(
                &mut tx,
                rule.id,
                self.materialization_config(),
                Utc::now(),
            )
            .await?;
        }

        // An existing deposit may already cover the new lesson(s).
        Self::sync_prepayment_in_transaction(&mut tx, data.student_id).await?;

        let lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(lesson.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(lesson)
    }

    async fn find_lesson_by_id(&self, id: i64) -> Result<Option<Lesson>, CoreError> {
        let lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(lesson)
    }

    async fn find_lessons_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, CoreError> {
        let lessons = sqlx::query_as(
            "SELECT * FROM lessons WHERE start_at >= $1 AND start_at < $2 ORDER BY start_at",
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.pool())
        .await?;
        Ok(lessons)
    }

    async fn find_lessons_by_student(&self, student_id: i64) -> Result<Vec<Lesson>, CoreError> {
        let lessons = sqlx::query_as(
            "SELECT * FROM lessons WHERE student_id = $1 ORDER BY start_at, id",
        )
        .bind(student_id)
        .fetch_all(self.pool())
        .await?;
        Ok(lessons)
    }

    async fn update_lesson_time(
        &self,
        id: i64,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Lesson, CoreError> {
        if end_at <= start_at {
            return Err(CoreError::InvalidInput(
                "Lesson end must be after its start".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;

        let lesson: Lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Lesson with id {} not found", id)))?;

        sqlx::query(
            "UPDATE lessons SET start_at = $1, end_at = $2, updated_at = $3 WHERE id = $4",
        )
        .bind(start_at)
        .bind(end_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        // Moving a materialized instance vacates its slot; without a
        // tombstone the expander would put a virtual occurrence back there
        // and the next materialization pass would re-insert a row.
        if lesson.is_instance && start_at != lesson.start_at {
            if let Some(series_id) = lesson.series_id {
                Self::upsert_exception_in_transaction(
                    &mut tx,
                    series_id,
                    lesson.start_at,
                    ExceptionType::Cancelled,
                    OverrideFields::default(),
                )
                .await?;
            }
        }

        // A time change can flip which lessons the deposit covers.
        Self::sync_prepayment_in_transaction(&mut tx, lesson.student_id).await?;

        let lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(lesson)
    }

    async fn cancel_lesson(&self, id: i64) -> Result<Lesson, CoreError> {
        let mut tx = self.pool().begin().await?;

        let lesson: Lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Lesson with id {} not found", id)))?;

        sqlx::query("UPDATE lessons SET payment_status = $1, updated_at = $2 WHERE id = $3")
            .bind(PaymentStatus::Cancelled)
            .bind(Utc::now())
            .bind(id)
            .execute(&mut *tx)
            .await?;

        // Cancellation frees any allocated deposit funds.
        Self::sync_prepayment_in_transaction(&mut tx, lesson.student_id).await?;

        let lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(lesson)
    }

    async fn delete_lesson(&self, id: i64) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;

        let lesson: Lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Lesson with id {} not found", id)))?;

        // Deleting the base lesson of a series takes the rule (and its
        // exceptions) with it.
        let rule: Option<RecurrenceRule> =
            sqlx::query_as("SELECT * FROM recurrence_rules WHERE base_lesson_id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(rule) = rule {
            Self::delete_rule_in_transaction(&mut tx, &rule).await?;
        }

        sqlx::query("DELETE FROM payments WHERE lesson_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM lessons WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        Self::sync_prepayment_in_transaction(&mut tx, lesson.student_id).await?;

        tx.commit().await?;
        Ok(())
    }
}

impl SqliteRepository {
    /// Insert a lesson row within an existing transaction.
    pub(crate) async fn insert_lesson_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        lesson: Lesson,
    ) -> Result<Lesson, CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"INSERT INTO lessons (student_id, subject, start_at, end_at, price_cents, paid_cents, payment_status, note, series_id, is_instance, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"#,
        )
        .bind(lesson.student_id)
        .bind(&lesson.subject)
        .bind(lesson.start_at)
        .bind(lesson.end_at)
        .bind(lesson.price_cents)
        .bind(lesson.paid_cents)
        .bind(lesson.payment_status)
        .bind(&lesson.note)
        .bind(lesson.series_id)
        .bind(lesson.is_instance)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(Lesson {
            id: result.last_insert_rowid(),
            created_at: now,
            updated_at: now,
            ..lesson
        })
    }
}
