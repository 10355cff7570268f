use crate::allocation::{plan_allocation, AllocationAction};
use crate::error::CoreError;
use crate::models::{Lesson, NewPaymentData, Payment, PaymentStatus, Student, PREPAYMENT_METHOD};
use crate::repository::SqliteRepository;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{Sqlite, Transaction};

#[async_trait]
impl super::PaymentRepository for SqliteRepository {
    async fn record_payment(&self, data: NewPaymentData) -> Result<Payment, CoreError> {
        if data.amount_cents <= 0 {
            return Err(CoreError::InvalidInput(
                "Payment amount must be positive".to_string(),
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

        if let Some(lesson_id) = data.lesson_id {
            let lesson: Lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
                .bind(lesson_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| {
                    CoreError::NotFound(format!("Lesson with id {} not found", lesson_id))
                })?;
            if lesson.student_id != data.student_id {
                return Err(CoreError::InvalidInput(format!(
                    "Lesson {} does not belong to student {}",
                    lesson_id, data.student_id
                )));
            }
        }

        let created_at = Utc::now();
        let result = sqlx::query(
            r#"INSERT INTO payments (lesson_id, student_id, amount_cents, method, status, paid_at, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
        )
        .bind(data.lesson_id)
        .bind(data.student_id)
        .bind(data.amount_cents)
        .bind(&data.method)
        .bind(data.status)
        .bind(data.paid_at)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        let payment = Payment {
            id: result.last_insert_rowid(),
            lesson_id: data.lesson_id,
            student_id: data.student_id,
            amount_cents: data.amount_cents,
            method: data.method,
            status: data.status,
            paid_at: data.paid_at,
            created_at,
        };

        // Any payment mutation re-runs the student's allocation pass.
        Self::sync_prepayment_in_transaction(&mut tx, payment.student_id).await?;

        tx.commit().await?;
        Ok(payment)
    }

    async fn delete_payment(&self, id: i64) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;

        let payment: Payment = sqlx::query_as("SELECT * FROM payments WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("Payment with id {} not found", id)))?;

        sqlx::query("DELETE FROM payments WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        Self::sync_prepayment_in_transaction(&mut tx, payment.student_id).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn find_payments_by_student(&self, student_id: i64) -> Result<Vec<Payment>, CoreError> {
        let payments = sqlx::query_as(
            "SELECT * FROM payments WHERE student_id = $1 ORDER BY paid_at, id",
        )
        .bind(student_id)
        .fetch_all(self.pool())
        .await?;
        Ok(payments)
    }

    async fn sync_prepayment(&self, student_id: i64) -> Result<(), CoreError> {
        let mut tx = self.pool().begin().await?;
        Self::sync_prepayment_in_transaction(&mut tx, student_id).await?;
        tx.commit().await?;
        Ok(())
    }
}

impl SqliteRepository {
    /// Runs one allocation pass for the student and applies the resulting
    /// plan, all within the caller's transaction. The pass holds the
    /// transaction for the student's whole lesson+payment set, so no other
    /// writer can interleave with it.
    pub(crate) async fn sync_prepayment_in_transaction(
        tx: &mut Transaction<'_, Sqlite>,
        student_id: i64,
    ) -> Result<(), CoreError> {
        let lessons: Vec<Lesson> = sqlx::query_as(
            "SELECT * FROM lessons WHERE student_id = $1 ORDER BY start_at, id",
        )
        .bind(student_id)
        .fetch_all(&mut **tx)
        .await?;
        let payments: Vec<Payment> =
            sqlx::query_as("SELECT * FROM payments WHERE student_id = $1")
                .bind(student_id)
                .fetch_all(&mut **tx)
                .await?;

        let plan = plan_allocation(&lessons, &payments, Utc::now());

        for action in plan.actions {
            match action {
                AllocationAction::Assign {
                    lesson_id,
                    amount_cents,
                } => {
                    sqlx::query(
                        r#"UPDATE lessons SET payment_status = $1, paid_cents = $2, updated_at = $3
                        WHERE id = $4"#,
                    )
                    .bind(PaymentStatus::Paid)
                    .bind(amount_cents)
                    .bind(Utc::now())
                    .bind(lesson_id)
                    .execute(&mut **tx)
                    .await?;

                    let updated = sqlx::query(
                        r#"UPDATE payments SET amount_cents = $1, status = $2
                        WHERE lesson_id = $3 AND method = $4"#,
                    )
                    .bind(amount_cents)
                    .bind(PaymentStatus::Paid)
                    .bind(lesson_id)
                    .bind(PREPAYMENT_METHOD)
                    .execute(&mut **tx)
                    .await?;

                    if updated.rows_affected() == 0 {
                        sqlx::query(
                            r#"INSERT INTO payments (lesson_id, student_id, amount_cents, method, status, paid_at, created_at)
                            VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
                        )
                        .bind(lesson_id)
                        .bind(student_id)
                        .bind(amount_cents)
                        .bind(PREPAYMENT_METHOD)
                        .bind(PaymentStatus::Paid)
                        .bind(Utc::now())
                        .bind(Utc::now())
                        .execute(&mut **tx)
                        .await?;
                    }
                }
                AllocationAction::Revert { lesson_id, status } => {
                    sqlx::query(
                        "DELETE FROM payments WHERE lesson_id = $1 AND method = $2",
                    )
                    .bind(lesson_id)
                    .bind(PREPAYMENT_METHOD)
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query(
                        r#"UPDATE lessons SET payment_status = $1, paid_cents = 0, updated_at = $2
                        WHERE id = $3"#,
                    )
                    .bind(status)
                    .bind(Utc::now())
                    .bind(lesson_id)
                    .execute(&mut **tx)
                    .await?;
                }
            }
        }

        Ok(())
    }
}
