use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use std::collections::{HashMap, HashSet};

use crate::error::CoreError;
use crate::models::{
    ExceptionType, Frequency, Lesson, Occurrence, PaymentStatus, RecurrenceException,
    RecurrenceRule, VirtualOccurrence,
};
use crate::timezone::{parse_timezone, resolve_local};

/// Safety cap on period iterations for a single expansion, so a degenerate
/// rule can never spin an unbounded loop.
const MAX_PERIODS: i64 = 5200;

/// Validates a recurrence rule before it is persisted or expanded.
///
/// Monthly-by-day-of-week rules must resolve to exactly one ordinal weekday
/// of the month: the weekday set may be empty (derived from the start) or
/// name the start's own weekday, nothing else.
pub fn validate_rule(rule: &RecurrenceRule) -> Result<(), CoreError> {
    if rule.interval < 1 {
        return Err(CoreError::InvalidRecurrence(format!(
            "interval must be >= 1, got {}",
            rule.interval
        )));
    }
    let tz = parse_timezone(&rule.timezone)?;
    if let Some(until) = rule.until_at {
        if until < rule.start_at {
            return Err(CoreError::InvalidRecurrence(
                "until_at precedes the series start".to_string(),
            ));
        }
    }
    if rule.frequency == Frequency::MonthlyByDow && !rule.weekdays.is_empty() {
        let start_weekday = rule.start_at.with_timezone(&tz).weekday();
        if rule.weekdays.len() > 1 || rule.weekdays.days() != [start_weekday] {
            return Err(CoreError::InvalidRecurrence(
                "monthly rules must target exactly the start's weekday".to_string(),
            ));
        }
    }
    Ok(())
}

/// Expands a rule into its candidate occurrence starts within `[from, to)`.
///
/// Pure and deterministic: exceptions and materialized rows are not
/// consulted here. Candidates carry the start's local time-of-day in the
/// rule's timezone, so the emitted UTC instants shift across DST
/// transitions while the wall-clock time stays put. Output is sorted and
/// deduplicated; nothing before the rule start or after the inclusive
/// `until_at` is emitted.
pub fn expand_rule(
    rule: &RecurrenceRule,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<DateTime<Utc>>, CoreError> {
    validate_rule(rule)?;
    let tz = parse_timezone(&rule.timezone)?;

    if to <= from || rule.until_at.map_or(false, |u| u < from) {
        return Ok(Vec::new());
    }

    let start_local = rule.start_at.with_timezone(&tz);
    let time_of_day = start_local.time();
    // Last local calendar date any candidate could fall on.
    let horizon = match rule.until_at {
        Some(until) => to.min(until + Duration::seconds(1)),
        None => to,
    };
    let horizon_date = horizon.with_timezone(&tz).date_naive() + Duration::days(1);

    let mut candidates = match rule.frequency {
        Frequency::Weekly | Frequency::Biweekly => expand_weeks(
            rule,
            tz,
            start_local.date_naive(),
            start_local.weekday(),
            time_of_day,
            horizon_date,
        ),
        Frequency::MonthlyByDow => expand_months(
            rule,
            tz,
            start_local.date_naive(),
            start_local.weekday(),
            time_of_day,
            horizon_date,
        ),
    };

    candidates.retain(|c| {
        *c >= rule.start_at
            && *c >= from
            && *c < to
            && rule.until_at.map_or(true, |until| *c <= until)
    });
    candidates.sort();
    candidates.dedup();
    Ok(candidates)
}

fn expand_weeks(
    rule: &RecurrenceRule,
    tz: Tz,
    start_date: NaiveDate,
    start_weekday: Weekday,
    time_of_day: NaiveTime,
    horizon_date: NaiveDate,
) -> Vec<DateTime<Utc>> {
    let step_weeks = match rule.frequency {
        Frequency::Biweekly => rule.interval * 2,
        _ => rule.interval,
    };
    let weekdays: Vec<Weekday> = if rule.weekdays.is_empty() {
        vec![start_weekday]
    } else {
        rule.weekdays.days().to_vec()
    };
    let anchor_monday =
        start_date - Duration::days(i64::from(start_weekday.num_days_from_monday()));

    let mut out = Vec::new();
    for period in 0..MAX_PERIODS {
        let week_start = anchor_monday + Duration::days(7 * step_weeks * period);
        if week_start > horizon_date {
            break;
        }
        for weekday in &weekdays {
            let date = week_start + Duration::days(i64::from(weekday.num_days_from_monday()));
            if let Some(utc) = resolve_local(tz, date.and_time(time_of_day)) {
                out.push(utc);
            }
        }
    }
    out
}

fn expand_months(
    rule: &RecurrenceRule,
    tz: Tz,
    start_date: NaiveDate,
    start_weekday: Weekday,
    time_of_day: NaiveTime,
    horizon_date: NaiveDate,
) -> Vec<DateTime<Utc>> {
    // Ordinal position of the start among same-weekday days of its month.
    let ordinal = (start_date.day() - 1) / 7 + 1;

    let mut out = Vec::new();
    for period in 0..MAX_PERIODS {
        let (year, month) = add_months(start_date.year(), start_date.month(), period * rule.interval);
        let Some(month_first) = NaiveDate::from_ymd_opt(year, month, 1) else {
            break;
        };
        if month_first > horizon_date {
            break;
        }
        // Months without an Nth such weekday contribute nothing.
        if let Some(date) = nth_weekday_of_month(year, month, start_weekday, ordinal) {
            if let Some(utc) = resolve_local(tz, date.and_time(time_of_day)) {
                out.push(utc);
            }
        }
    }
    out
}

fn add_months(year: i32, month: u32, delta: i64) -> (i32, u32) {
    let total = i64::from(year) * 12 + i64::from(month) - 1 + delta;
    ((total.div_euclid(12)) as i32, (total.rem_euclid(12)) as u32 + 1)
}

fn nth_weekday_of_month(year: i32, month: u32, weekday: Weekday, n: u32) -> Option<NaiveDate> {
    let first = NaiveDate::from_ymd_opt(year, month, 1)?;
    let offset =
        (7 + weekday.num_days_from_monday() - first.weekday().num_days_from_monday()) % 7;
    // from_ymd_opt rejects days past the month's end, which drops absent
    // fifth occurrences.
    NaiveDate::from_ymd_opt(year, month, 1 + offset + (n - 1) * 7)
}

// ============================================================================
// Occurrence resolution
// ============================================================================

/// Merges expanded rule candidates with exceptions and materialized lesson
/// rows into the final occurrence list for a window.
///
/// Precedence per candidate: a persisted row at the same
/// `(series_id, start_at)` wins outright (its current state is
/// authoritative, manual edits included); otherwise a Cancelled exception
/// drops the candidate and an Overridden exception substitutes its fields
/// onto the virtual occurrence.
pub struct OccurrenceResolver {
    /// Each intersecting rule paired with its base lesson, which seeds
    /// duration, price, and student for virtual occurrences.
    series: Vec<(RecurrenceRule, Lesson)>,
    exceptions: HashMap<(i64, DateTime<Utc>), RecurrenceException>,
    materialized: Vec<Lesson>,
}

impl OccurrenceResolver {
    pub fn new(
        series: Vec<(RecurrenceRule, Lesson)>,
        exceptions: Vec<RecurrenceException>,
        materialized: Vec<Lesson>,
    ) -> Self {
        let exceptions = exceptions
            .into_iter()
            .map(|ex| ((ex.series_id, ex.original_at), ex))
            .collect();
        Self {
            series,
            exceptions,
            materialized,
        }
    }

    pub fn resolve(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Occurrence>, CoreError> {
        let existing: HashSet<(i64, DateTime<Utc>)> = self
            .materialized
            .iter()
            .filter_map(|lesson| lesson.series_id.map(|sid| (sid, lesson.start_at)))
            .collect();

        // Cancelled rows still suppress their candidate (they stay in
        // `existing`) but are not part of the visible list.
        let mut out: Vec<Occurrence> = self
            .materialized
            .iter()
            .filter(|lesson| lesson.payment_status != PaymentStatus::Cancelled)
            .cloned()
            .map(Occurrence::Materialized)
            .collect();

        for (rule, base) in &self.series {
            for candidate in expand_rule(rule, from, to)? {
                if existing.contains(&(rule.id, candidate)) {
                    continue;
                }
                match self.exceptions.get(&(rule.id, candidate)) {
                    Some(ex) if ex.exception_type == ExceptionType::Cancelled => continue,
                    exception => {
                        out.push(Occurrence::Virtual(build_virtual(
                            rule, base, candidate, exception,
                        )));
                    }
                }
            }
        }

        out.sort_by(|a, b| {
            a.start_at()
                .cmp(&b.start_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        Ok(out)
    }
}

fn build_virtual(
    rule: &RecurrenceRule,
    base: &Lesson,
    original_at: DateTime<Utc>,
    exception: Option<&RecurrenceException>,
) -> VirtualOccurrence {
    let start_at = exception
        .and_then(|ex| ex.new_start_at)
        .unwrap_or(original_at);
    let duration = exception
        .and_then(|ex| ex.new_duration_min)
        .map(Duration::minutes)
        .unwrap_or_else(|| base.duration());
    let price_cents = exception
        .and_then(|ex| ex.new_price_cents)
        .unwrap_or(base.price_cents);
    let note = exception
        .and_then(|ex| ex.new_note.clone())
        .or_else(|| base.note.clone());

    VirtualOccurrence {
        id: VirtualOccurrence::synthetic_id(rule.id, original_at),
        series_id: rule.id,
        student_id: base.student_id,
        original_at,
        start_at,
        end_at: start_at + duration,
        subject: base.subject.clone(),
        price_cents,
        note,
        exception_applied: exception.is_some(),
    }
}
