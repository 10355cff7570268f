use crate::error::CoreError;
use crate::models::{Lesson, Occurrence, RecurrenceException};
use crate::recurrence::OccurrenceResolver;
use crate::repository::{SeriesRepository, SqliteRepository};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// How far before a probed range the conflict window opens, in hours, so
/// lessons that start earlier but run into the range are still seen.
const CONFLICT_LOOKBEHIND_HOURS: i64 = 24;

/// Half-open range overlap test.
pub fn overlaps(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && a_end > b_start
}

#[async_trait]
impl super::ScheduleRepository for SqliteRepository {
    async fn query_occurrences(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, CoreError> {
        let resolver = self.build_resolver(from, to).await?;
        resolver.resolve(from, to)
    }

    async fn find_conflicts(
        &self,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
        exclude_lesson_id: Option<i64>,
    ) -> Result<Vec<Occurrence>, CoreError> {
        if end_at <= start_at {
            return Err(CoreError::InvalidInput(
                "Conflict range end must be after its start".to_string(),
            ));
        }

        let window_start = start_at - Duration::hours(CONFLICT_LOOKBEHIND_HOURS);
        let resolver = self.build_resolver(window_start, end_at).await?;
        let occurrences = resolver.resolve(window_start, end_at)?;

        Ok(occurrences
            .into_iter()
            .filter(|occ| exclude_lesson_id.map_or(true, |id| occ.id() != id))
            .filter(|occ| overlaps(occ.start_at(), occ.end_at(), start_at, end_at))
            .collect())
    }
}

impl SqliteRepository {
    /// Gathers the window's rules (with base lessons), their exceptions,
    /// and the materialized rows, ready for pure resolution.
    async fn build_resolver(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<OccurrenceResolver, CoreError> {
        let rules = self.find_rules_intersecting(from, to).await?;

        let mut series = Vec::with_capacity(rules.len());
        let mut exceptions: Vec<RecurrenceException> = Vec::new();
        for rule in rules {
            // A rule without its base lesson is a corruption state, not a
            // row to skip quietly.
            let base: Lesson = sqlx::query_as("SELECT * FROM lessons WHERE id = $1")
                .bind(rule.base_lesson_id)
                .fetch_optional(self.pool())
                .await?
                .ok_or_else(|| {
                    CoreError::NotFound(format!(
                        "Base lesson with id {} not found for rule {}",
                        rule.base_lesson_id, rule.id
                    ))
                })?;

            let mut rule_exceptions: Vec<RecurrenceException> = sqlx::query_as(
                "SELECT * FROM recurrence_exceptions WHERE series_id = $1",
            )
            .bind(rule.id)
            .fetch_all(self.pool())
            .await?;
            exceptions.append(&mut rule_exceptions);

            series.push((rule, base));
        }

        let materialized: Vec<Lesson> = sqlx::query_as(
            "SELECT * FROM lessons WHERE start_at >= $1 AND start_at < $2 ORDER BY start_at",
        )
        .bind(from)
        .bind(to)
        .fetch_all(self.pool())
        .await?;

        Ok(OccurrenceResolver::new(series, exceptions, materialized))
    }
}
