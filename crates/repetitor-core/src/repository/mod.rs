use crate::db::DbPool;
use crate::error::CoreError;
use crate::models::{
    Lesson, MaterializationConfig, NewLessonData, NewPaymentData, Occurrence, OverrideFields,
    Payment, RecurrenceData, RecurrenceException, RecurrenceRule, Student,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

// Re-export domain modules
pub mod exceptions;
pub mod lessons;
pub mod materialization;
pub mod payments;
pub mod schedule;
pub mod series;
pub mod students;

/// Domain-specific trait for student operations
#[async_trait]
pub trait StudentRepository {
    async fn add_student(&self, name: String, note: Option<String>) -> Result<Student, CoreError>;
    async fn find_student_by_id(&self, id: i64) -> Result<Option<Student>, CoreError>;
    async fn find_students(&self) -> Result<Vec<Student>, CoreError>;
}

/// Domain-specific trait for lesson operations
#[async_trait]
pub trait LessonRepository {
    /// Creates a lesson; when the request carries a recurrence descriptor
    /// the base lesson, its rule, and the initial instances are persisted
    /// in one transaction.
    async fn add_lesson(&self, data: NewLessonData) -> Result<Lesson, CoreError>;
    async fn find_lesson_by_id(&self, id: i64) -> Result<Option<Lesson>, CoreError>;
    async fn find_lessons_in_range(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Lesson>, CoreError>;
    async fn find_lessons_by_student(&self, student_id: i64) -> Result<Vec<Lesson>, CoreError>;
    async fn update_lesson_time(
        &self,
        id: i64,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<Lesson, CoreError>;
    async fn cancel_lesson(&self, id: i64) -> Result<Lesson, CoreError>;
    async fn delete_lesson(&self, id: i64) -> Result<(), CoreError>;
}

/// Domain-specific trait for recurrence rule operations
#[async_trait]
pub trait SeriesRepository {
    /// Attaches a recurrence rule to an existing standalone lesson, making
    /// it the series base, and materializes the initial instances. Fails if
    /// the lesson already belongs to a series.
    async fn create_rule_for_lesson(
        &self,
        lesson_id: i64,
        data: RecurrenceData,
    ) -> Result<RecurrenceRule, CoreError>;
    async fn find_rule_by_id(&self, id: i64) -> Result<Option<RecurrenceRule>, CoreError>;
    async fn find_rule_by_base_lesson(
        &self,
        lesson_id: i64,
    ) -> Result<Option<RecurrenceRule>, CoreError>;
    async fn find_rules_intersecting(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<RecurrenceRule>, CoreError>;
    /// Deletes a rule, its exceptions, and detaches every lesson that
    /// referenced it. Explicit cleanup, no reliance on FK cascades.
    async fn delete_rule(&self, id: i64) -> Result<(), CoreError>;
}

/// Domain-specific trait for per-occurrence exception operations
#[async_trait]
pub trait ExceptionRepository {
    async fn cancel_occurrence(
        &self,
        series_id: i64,
        original_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;
    async fn override_occurrence(
        &self,
        series_id: i64,
        original_at: DateTime<Utc>,
        fields: OverrideFields,
    ) -> Result<(), CoreError>;
    async fn remove_exception(
        &self,
        series_id: i64,
        original_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;
    async fn find_exceptions_for_series(
        &self,
        series_id: i64,
    ) -> Result<Vec<RecurrenceException>, CoreError>;
}

/// Domain-specific trait for materialization operations
#[async_trait]
pub trait MaterializationRepository {
    /// Persists the rule's near-future occurrences as instance rows.
    /// Idempotent: re-running for the same rule creates no duplicates.
    /// Returns the number of instances created.
    async fn materialize_rule(&self, rule_id: i64) -> Result<usize, CoreError>;
}

/// Domain-specific trait for resolved calendar reads
#[async_trait]
pub trait ScheduleRepository {
    /// Resolved occurrence list for a window: materialized rows plus
    /// virtual instances, exceptions applied, ordered by start time.
    async fn query_occurrences(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, CoreError>;
    /// Occurrences overlapping the proposed range. Data for the caller to
    /// decide on, never a hard failure.
    async fn find_conflicts(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        exclude_lesson_id: Option<i64>,
    ) -> Result<Vec<Occurrence>, CoreError>;
}

/// Domain-specific trait for payment and deposit operations
#[async_trait]
pub trait PaymentRepository {
    async fn record_payment(&self, data: NewPaymentData) -> Result<Payment, CoreError>;
    async fn delete_payment(&self, id: i64) -> Result<(), CoreError>;
    async fn find_payments_by_student(&self, student_id: i64) -> Result<Vec<Payment>, CoreError>;
    /// Re-runs the deposit allocation pass for one student.
    async fn sync_prepayment(&self, student_id: i64) -> Result<(), CoreError>;
}

/// Main repository trait that composes all domain traits
#[async_trait]
pub trait Repository:
    StudentRepository
    + LessonRepository
    + SeriesRepository
    + ExceptionRepository
    + MaterializationRepository
    + ScheduleRepository
    + PaymentRepository
{
}

/// SQLite implementation of the repository pattern
pub struct SqliteRepository {
    pool: DbPool,
    materialization_config: MaterializationConfig,
}

impl SqliteRepository {
    pub fn new(pool: DbPool, materialization_config: MaterializationConfig) -> Self {
        Self {
            pool,
            materialization_config,
        }
    }

    pub(crate) fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub(crate) fn materialization_config(&self) -> &MaterializationConfig {
        &self.materialization_config
    }
}

impl Repository for SqliteRepository {}
