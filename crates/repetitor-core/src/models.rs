use chrono::{DateTime, Duration, Utc, Weekday};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Method tag marking deposits and allocator-created payments, as opposed
/// to manually recorded ones.
pub const PREPAYMENT_METHOD: &str = "prepayment";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Student {
    pub id: i64,
    pub name: String,
    pub note: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Due,
    Paid,
    Cancelled,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid payment status: {0}")]
pub struct ParsePaymentStatusError(String);

impl FromStr for PaymentStatus {
    type Err = ParsePaymentStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "due" => Ok(PaymentStatus::Due),
            "paid" => Ok(PaymentStatus::Paid),
            "cancelled" => Ok(PaymentStatus::Cancelled),
            _ => Err(ParsePaymentStatusError(s.to_string())),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PaymentStatus::Unpaid => write!(f, "unpaid"),
            PaymentStatus::Due => write!(f, "due"),
            PaymentStatus::Paid => write!(f, "paid"),
            PaymentStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A lesson row: either a standalone lesson, the base lesson of a recurring
/// series, or a materialized instance of one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Lesson {
    pub id: i64,
    pub student_id: i64,
    pub subject: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub price_cents: i64,
    pub paid_cents: i64,
    pub payment_status: PaymentStatus,
    pub note: Option<String>,
    /// Back-reference to the owning recurrence rule. Set on the recurring
    /// base lesson and on every materialized instance.
    pub series_id: Option<i64>,
    pub is_instance: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for Lesson {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            student_id: 0,
            subject: None,
            start_at: now,
            end_at: now + Duration::hours(1),
            price_cents: 0,
            paid_cents: 0,
            payment_status: PaymentStatus::Unpaid,
            note: None,
            series_id: None,
            is_instance: false,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Lesson {
    pub fn duration(&self) -> Duration {
        self.end_at - self.start_at
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Biweekly,
    MonthlyByDow,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid frequency: {0}")]
pub struct ParseFrequencyError(String);

impl FromStr for Frequency {
    type Err = ParseFrequencyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "weekly" => Ok(Frequency::Weekly),
            "biweekly" => Ok(Frequency::Biweekly),
            "monthly_by_dow" | "monthly" => Ok(Frequency::MonthlyByDow),
            _ => Err(ParseFrequencyError(s.to_string())),
        }
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Weekly => write!(f, "weekly"),
            Frequency::Biweekly => write!(f, "biweekly"),
            Frequency::MonthlyByDow => write!(f, "monthly_by_dow"),
        }
    }
}

/// Target weekdays of a rule, stored as comma-separated numbers with
/// Monday = 0. Kept sorted and deduplicated. An empty set means "derive
/// from the rule's start".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WeekdaySet(Vec<Weekday>);

#[derive(Error, Debug, PartialEq)]
#[error("Invalid weekday set: {0}")]
pub struct ParseWeekdaySetError(String);

impl WeekdaySet {
    pub fn new(mut days: Vec<Weekday>) -> Self {
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        Self(days)
    }

    pub fn single(day: Weekday) -> Self {
        Self(vec![day])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn days(&self) -> &[Weekday] {
        &self.0
    }
}

impl fmt::Display for WeekdaySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|d| d.num_days_from_monday().to_string())
            .collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for WeekdaySet {
    type Err = ParseWeekdaySetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Ok(Self::default());
        }
        let mut days = Vec::new();
        for part in trimmed.split(',') {
            let n: u32 = part
                .trim()
                .parse()
                .map_err(|_| ParseWeekdaySetError(s.to_string()))?;
            if n > 6 {
                return Err(ParseWeekdaySetError(s.to_string()));
            }
            days.push(weekday_from_monday_offset(n));
        }
        Ok(Self::new(days))
    }
}

impl TryFrom<String> for WeekdaySet {
    type Error = ParseWeekdaySetError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl Serialize for WeekdaySet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WeekdaySet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn weekday_from_monday_offset(n: u32) -> Weekday {
    match n {
        0 => Weekday::Mon,
        1 => Weekday::Tue,
        2 => Weekday::Wed,
        3 => Weekday::Thu,
        4 => Weekday::Fri,
        5 => Weekday::Sat,
        _ => Weekday::Sun,
    }
}

/// Recurrence definition owned by its base lesson. Created once alongside
/// the lesson; a pattern change is modeled as delete + recreate.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurrenceRule {
    pub id: i64,
    pub base_lesson_id: i64,
    pub frequency: Frequency,
    pub interval: i64,
    #[sqlx(try_from = "String")]
    pub weekdays: WeekdaySet,
    pub start_at: DateTime<Utc>,
    /// Inclusive upper bound for the series.
    pub until_at: Option<DateTime<Utc>>,
    /// IANA timezone name the expansion is anchored in.
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

impl Default for RecurrenceRule {
    fn default() -> Self {
        Self {
            id: 0,
            base_lesson_id: 0,
            frequency: Frequency::Weekly,
            interval: 1,
            weekdays: WeekdaySet::default(),
            start_at: Utc::now(),
            until_at: None,
            timezone: "UTC".to_string(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ExceptionType {
    /// Drop this occurrence from the series.
    Cancelled,
    /// Substitute the override fields onto this occurrence.
    Overridden,
}

#[derive(Error, Debug, PartialEq)]
#[error("Invalid exception type: {0}")]
pub struct ParseExceptionTypeError(String);

impl FromStr for ExceptionType {
    type Err = ParseExceptionTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cancelled" => Ok(ExceptionType::Cancelled),
            "overridden" => Ok(ExceptionType::Overridden),
            _ => Err(ParseExceptionTypeError(s.to_string())),
        }
    }
}

impl fmt::Display for ExceptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExceptionType::Cancelled => write!(f, "cancelled"),
            ExceptionType::Overridden => write!(f, "overridden"),
        }
    }
}

/// A per-occurrence deviation from the series pattern, keyed by the
/// unperturbed candidate time it targets. At most one per
/// `(series_id, original_at)`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RecurrenceException {
    pub id: i64,
    pub series_id: i64,
    pub original_at: DateTime<Utc>,
    pub exception_type: ExceptionType,
    pub new_start_at: Option<DateTime<Utc>>,
    pub new_duration_min: Option<i64>,
    pub new_note: Option<String>,
    pub new_price_cents: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Field substitutions for overriding a single occurrence.
#[derive(Debug, Clone, Default)]
pub struct OverrideFields {
    pub new_start_at: Option<DateTime<Utc>>,
    pub new_duration_min: Option<i64>,
    pub new_note: Option<String>,
    pub new_price_cents: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Payment {
    pub id: i64,
    /// None marks a standalone deposit not yet tied to a lesson.
    pub lesson_id: Option<i64>,
    pub student_id: i64,
    pub amount_cents: i64,
    pub method: String,
    pub status: PaymentStatus,
    pub paid_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl Payment {
    /// A standalone, not-yet-consumed deposit contributing to the
    /// student's available balance.
    pub fn is_deposit(&self) -> bool {
        self.lesson_id.is_none() && self.status == PaymentStatus::Paid
    }

    /// An allocator-created payment tying deposit funds to one lesson.
    pub fn is_auto_allocation(&self) -> bool {
        self.lesson_id.is_some() && self.method == PREPAYMENT_METHOD
    }
}

// ============================================================================
// Occurrence projection
// ============================================================================

/// A computed, not-yet-persisted instance of a recurring lesson. Its id is
/// negative and synthetic; it must never be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualOccurrence {
    pub id: i64,
    pub series_id: i64,
    pub student_id: i64,
    /// The unperturbed candidate time this occurrence derives from, used as
    /// the exception and materialization key.
    pub original_at: DateTime<Utc>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub subject: Option<String>,
    pub price_cents: i64,
    pub note: Option<String>,
    pub exception_applied: bool,
}

impl VirtualOccurrence {
    /// Deterministic negative identity derived from the series and the
    /// original occurrence time. Stable across queries, always < 0, so it
    /// can never collide with a real row id.
    pub fn synthetic_id(series_id: i64, original_at: DateTime<Utc>) -> i64 {
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        let bytes = series_id
            .to_le_bytes()
            .into_iter()
            .chain(original_at.timestamp().to_le_bytes());
        for b in bytes {
            hash ^= u64::from(b);
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
        -(((hash >> 1) as i64).max(1))
    }
}

/// One visible calendar entry: either a persisted lesson row or a virtual
/// instance computed from a rule. Modeled as a sum type so a virtual id can
/// never be mistaken for a durable key.
#[derive(Debug, Clone, PartialEq)]
pub enum Occurrence {
    Materialized(Lesson),
    Virtual(VirtualOccurrence),
}

impl Occurrence {
    pub fn id(&self) -> i64 {
        match self {
            Occurrence::Materialized(l) => l.id,
            Occurrence::Virtual(v) => v.id,
        }
    }

    pub fn student_id(&self) -> i64 {
        match self {
            Occurrence::Materialized(l) => l.student_id,
            Occurrence::Virtual(v) => v.student_id,
        }
    }

    pub fn series_id(&self) -> Option<i64> {
        match self {
            Occurrence::Materialized(l) => l.series_id,
            Occurrence::Virtual(v) => Some(v.series_id),
        }
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        match self {
            Occurrence::Materialized(l) => l.start_at,
            Occurrence::Virtual(v) => v.start_at,
        }
    }

    pub fn end_at(&self) -> DateTime<Utc> {
        match self {
            Occurrence::Materialized(l) => l.end_at,
            Occurrence::Virtual(v) => v.end_at,
        }
    }

    pub fn price_cents(&self) -> i64 {
        match self {
            Occurrence::Materialized(l) => l.price_cents,
            Occurrence::Virtual(v) => v.price_cents,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, Occurrence::Virtual(_))
    }
}

// ============================================================================
// Data Transfer Objects
// ============================================================================

/// Recurrence descriptor attached to a lesson-creation request.
#[derive(Debug, Clone)]
pub struct RecurrenceData {
    pub frequency: Frequency,
    pub interval: i64,
    pub weekdays: WeekdaySet,
    pub until_at: Option<DateTime<Utc>>,
    pub timezone: String,
}

#[derive(Debug, Clone)]
pub struct NewLessonData {
    pub student_id: i64,
    pub subject: Option<String>,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub price_cents: i64,
    pub note: Option<String>,
    /// When present, the created lesson becomes the base of a new series.
    pub recurrence: Option<RecurrenceData>,
}

impl Default for NewLessonData {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            student_id: 0,
            subject: None,
            start_at: now,
            end_at: now + Duration::hours(1),
            price_cents: 0,
            note: None,
            recurrence: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewPaymentData {
    pub lesson_id: Option<i64>,
    pub student_id: i64,
    pub amount_cents: i64,
    pub method: String,
    pub status: PaymentStatus,
    pub paid_at: DateTime<Utc>,
}

impl Default for NewPaymentData {
    fn default() -> Self {
        Self {
            lesson_id: None,
            student_id: 0,
            amount_cents: 0,
            method: PREPAYMENT_METHOD.to_string(),
            status: PaymentStatus::Paid,
            paid_at: Utc::now(),
        }
    }
}

/// Policy for eager instance creation when a series is written.
#[derive(Debug, Clone)]
pub struct MaterializationConfig {
    /// How far past "now" instances are persisted eagerly, in days.
    pub lookahead_days: i64,
    /// Hard cap on instances written in a single pass.
    pub max_instances: usize,
}

impl Default for MaterializationConfig {
    fn default() -> Self {
        Self {
            lookahead_days: 90,
            max_instances: 52,
        }
    }
}
