use chrono::{DateTime, NaiveDate, NaiveTime};
use regex::Regex;
use std::sync::OnceLock;

/// Validation error type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Validation error for field '{}': {}",
            self.field, self.message
        )
    }
}

impl std::error::Error for ValidationError {}

/// Maximum intensity accepted by the control endpoint
pub const MAX_INTENSITY: u8 = 100;

/// Validate email address format (local@domain.tld, no whitespace)
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    static EMAIL_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = EMAIL_REGEX.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$")
            .expect("email regex is valid")
    });

    if email.len() > 254 {
        return Err(ValidationError::new(
            "email",
            format!("Email length {} exceeds maximum of 254 characters", email.len()),
        ));
    }

    if regex.is_match(email) {
        Ok(())
    } else {
        Err(ValidationError::new(
            "email",
            "Email must be in format name@domain.tld",
        ))
    }
}

/// Validate password length (6 to 128 characters)
pub fn validate_password(password: &str) -> Result<(), ValidationError> {
    let len = password.chars().count();
    if len < 6 {
        return Err(ValidationError::new(
            "password",
            "Password must be at least 6 characters",
        ));
    }
    if len > 128 {
        return Err(ValidationError::new(
            "password",
            format!("Password length {} exceeds maximum of 128 characters", len),
        ));
    }
    Ok(())
}

/// Validate greenhouse identifier
/// Identifiers are interpolated into URL paths, so only `[A-Za-z0-9_-]` is accepted
pub fn validate_greenhouse_id(greenhouse_id: &str) -> Result<(), ValidationError> {
    if greenhouse_id.is_empty() {
        return Err(ValidationError::new(
            "greenhouse_id",
            "Greenhouse ID cannot be empty",
        ));
    }

    if greenhouse_id.len() > 128 {
        return Err(ValidationError::new(
            "greenhouse_id",
            format!(
                "Greenhouse ID length {} exceeds maximum of 128 characters",
                greenhouse_id.len()
            ),
        ));
    }

    if !greenhouse_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ValidationError::new(
            "greenhouse_id",
            "Greenhouse ID must contain only letters, digits, '_' or '-'",
        ));
    }

    Ok(())
}

/// Validate a field index against the number of fields in a greenhouse
pub fn validate_field_index(index: usize, field_count: usize) -> Result<(), ValidationError> {
    if index >= field_count {
        return Err(ValidationError::new(
            "field_index",
            format!(
                "Field index {} is out of range for {} field(s)",
                index, field_count
            ),
        ));
    }
    Ok(())
}

/// Validate device intensity (0..=100)
pub fn validate_intensity(value: u8) -> Result<(), ValidationError> {
    if value > MAX_INTENSITY {
        return Err(ValidationError::new(
            "value",
            format!("Intensity {} exceeds maximum of {}", value, MAX_INTENSITY),
        ));
    }
    Ok(())
}

/// Validate scheduled turn-on time in 24h `HH:MM` format
pub fn validate_turn_on_at(turn_on_at: &str) -> Result<(), ValidationError> {
    static TIME_REGEX: OnceLock<Regex> = OnceLock::new();
    let regex = TIME_REGEX
        .get_or_init(|| Regex::new(r"^[0-9]{2}:[0-9]{2}$").expect("time regex is valid"));

    if regex.is_match(turn_on_at) && NaiveTime::parse_from_str(turn_on_at, "%H:%M").is_ok() {
        Ok(())
    } else {
        Err(ValidationError::new(
            "turn_on_at",
            "Turn-on time must be in HH:MM format (00:00 to 23:59)",
        ))
    }
}

/// Validate a schedule date in `YYYY-MM-DD` format
pub fn validate_schedule_date(date: &str) -> Result<(), ValidationError> {
    match NaiveDate::parse_from_str(date, "%Y-%m-%d") {
        Ok(_) if date.len() == 10 => Ok(()),
        _ => Err(ValidationError::new(
            "dates",
            format!("Date '{}' must be in YYYY-MM-DD format", date),
        )),
    }
}

/// Validate a history time range given as RFC3339 strings
/// Start must be strictly before end
pub fn validate_time_range(start_time: &str, end_time: &str) -> Result<(), ValidationError> {
    let start = DateTime::parse_from_rfc3339(start_time).map_err(|_| {
        ValidationError::new(
            "start_time",
            "Start time must be in RFC3339 format (e.g., 2024-01-15T10:30:00Z)",
        )
    })?;
    let end = DateTime::parse_from_rfc3339(end_time).map_err(|_| {
        ValidationError::new(
            "end_time",
            "End time must be in RFC3339 format (e.g., 2024-01-15T10:30:00Z)",
        )
    })?;

    if start >= end {
        return Err(ValidationError::new(
            "start_time",
            "Start time must be before end time",
        ));
    }

    Ok(())
}
