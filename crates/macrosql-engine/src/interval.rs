//! Interval context
//!
//! The `{start, end, latest}` window a template is rendered for. It is
//! supplied by the caller for every render and never read from process-wide
//! state, so the same template and interval always render the same SQL.

use crate::value::MacroValue;
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

const PREFIXES: [&str; 3] = ["start", "end", "latest"];

/// Error building an interval context
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntervalError {
    #[error("Invalid datetime '{0}': expected YYYY-MM-DD, YYYY-MM-DD HH:MM:SS or RFC 3339")]
    InvalidDatetime(String),

    #[error("Interval end {end} is before start {start}")]
    EndBeforeStart { start: String, end: String },
}

/// Immutable render interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntervalContext {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub latest: DateTime<Utc>,
}

impl IntervalContext {
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        latest: DateTime<Utc>,
    ) -> Result<Self, IntervalError> {
        if end < start {
            return Err(IntervalError::EndBeforeStart {
                start: start.to_rfc3339(),
                end: end.to_rfc3339(),
            });
        }
        Ok(Self { start, end, latest })
    }

    /// Parse an interval from text; `end` defaults to `start` and `latest` to `end`
    pub fn parse(start: &str, end: Option<&str>, latest: Option<&str>) -> Result<Self, IntervalError> {
        let start = parse_datetime(start)?;
        let end = end.map(parse_datetime).transpose()?.unwrap_or(start);
        let latest = latest.map(parse_datetime).transpose()?.unwrap_or(end);
        Self::new(start, end, latest)
    }

    fn point(&self, prefix: &str) -> DateTime<Utc> {
        match prefix {
            "start" => self.start,
            "end" => self.end,
            _ => self.latest,
        }
    }

    /// The 15 predefined variables, in `{start,end,latest}` × `{date,ds,ts,epoch,millis}` order
    pub fn variables(&self) -> Vec<(String, MacroValue)> {
        let mut variables = Vec::with_capacity(15);
        for prefix in PREFIXES {
            let point = self.point(prefix);
            variables.push((format!("{}_date", prefix), MacroValue::date(point.date_naive())));
            variables.push((
                format!("{}_ds", prefix),
                MacroValue::string(point.format("%Y-%m-%d").to_string()),
            ));
            variables.push((
                format!("{}_ts", prefix),
                MacroValue::string(point.format("%Y-%m-%d %H:%M:%S").to_string()),
            ));
            variables.push((format!("{}_epoch", prefix), MacroValue::int(point.timestamp())));
            variables.push((
                format!("{}_millis", prefix),
                MacroValue::int(point.timestamp_millis()),
            ));
        }
        variables
    }
}

/// Parse `YYYY-MM-DD`, `YYYY-MM-DD HH:MM:SS` or RFC 3339 text as UTC
pub fn parse_datetime(text: &str) -> Result<DateTime<Utc>, IntervalError> {
    let text = text.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| IntervalError::InvalidDatetime(text.to_string()))
}
