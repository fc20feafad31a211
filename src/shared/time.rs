use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};

/// Clock trait for abstracting time operations
/// Token expiry, history windows and reading freshness all read time through it
pub trait Clock: Send + Sync {
    /// Current instant
    fn now(&self) -> DateTime<Utc>;

    /// Current time as epoch seconds (compared against JWT `exp`)
    fn now_epoch_seconds(&self) -> i64 {
        self.now().timestamp()
    }
}

/// Production implementation of Clock using system time
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock pinned to one instant
#[derive(Debug, Clone)]
pub struct FixedClock {
    timestamp: DateTime<Utc>,
}

impl FixedClock {
    pub fn new(timestamp: DateTime<Utc>) -> Self {
        Self { timestamp }
    }

    /// Create a FixedClock from RFC3339 string
    pub fn from_rfc3339(timestamp_str: &str) -> Result<Self, chrono::ParseError> {
        let timestamp = DateTime::parse_from_rfc3339(timestamp_str)?.with_timezone(&Utc);
        Ok(Self { timestamp })
    }

    /// Create a FixedClock from epoch seconds
    /// Out-of-range values fall back to the Unix epoch
    pub fn from_epoch_seconds(seconds: i64) -> Self {
        let timestamp = DateTime::from_timestamp(seconds, 0).unwrap_or_default();
        Self { timestamp }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Format an instant the way query strings and timestamps are sent to the backend
pub fn format_rfc3339(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Parse a reading timestamp
/// Accepts RFC3339 and the naive ISO-8601 form some services emit (treated as UTC)
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

/// `HH:MM` label (UTC) `minutes` after the clock's current time
/// Default turn-on time offered for a new schedule
pub fn time_of_day_after(clock: &dyn Clock, minutes: i64) -> String {
    (clock.now() + chrono::Duration::minutes(minutes))
        .format("%H:%M")
        .to_string()
}
