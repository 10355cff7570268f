//! # Repetitor Core Library
//!
//! Scheduling and prepayment ledger core for a private-tutoring planner.
//! Two engines carry the interesting invariants; everything around them is
//! plain keyed CRUD:
//!
//! - **Recurring lesson series**: compact rules (weekly, biweekly, monthly
//!   by day-of-week) expanded on demand into concrete occurrences, with
//!   per-occurrence exceptions (cancel, override), timezone-aware DST
//!   handling, and idempotent materialization of near-future instances.
//! - **Prepayment allocation**: a student's deposit balance is consumed
//!   across their lessons in chronological order, flipping payment status
//!   deterministically as funds arrive or are withdrawn.
//!
//! ## Core Modules
//!
//! - [`db`]: Database connection and migration management
//! - [`models`]: Core data structures and transfer objects
//! - [`repository`]: Data access layer with Repository pattern
//! - [`recurrence`]: Rule expansion and occurrence resolution
//! - [`allocation`]: Deposit allocation planning
//! - [`timezone`]: Timezone utilities and validation
//! - [`error`]: Error types
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use repetitor_core::{
//!     db,
//!     models::{Frequency, MaterializationConfig, NewLessonData, RecurrenceData, WeekdaySet},
//!     repository::{LessonRepository, SqliteRepository, StudentRepository},
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), repetitor_core::error::CoreError> {
//!     let pool = db::establish_connection("lessons.db").await?;
//!     let repo = SqliteRepository::new(pool, MaterializationConfig::default());
//!
//!     let student = repo.add_student("Alice".to_string(), None).await?;
//!     let lesson = repo
//!         .add_lesson(NewLessonData {
//!             student_id: student.id,
//!             price_cents: 1500,
//!             recurrence: Some(RecurrenceData {
//!                 frequency: Frequency::Weekly,
//!                 interval: 1,
//!                 weekdays: WeekdaySet::default(),
//!                 until_at: None,
//!                 timezone: "Europe/Moscow".to_string(),
//!             }),
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("Created series base lesson {}", lesson.id);
//!
//!     Ok(())
//! }
//! ```

pub mod allocation;
pub mod db;
pub mod error;
pub mod models;
pub mod recurrence;
pub mod repository;
pub mod timezone;
