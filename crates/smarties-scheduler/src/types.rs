use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SchedulerError;

/// Fixed offsets accepted in place of an absolute trigger time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Relative {
    AMinute,
    FiveMinutes,
    TenMinutes,
    ThirtyMinutes,
    AnHour,
    TwelveHours,
    ADay,
}

impl Relative {
    pub fn offset(self) -> Duration {
        match self {
            Relative::AMinute => Duration::minutes(1),
            Relative::FiveMinutes => Duration::minutes(5),
            Relative::TenMinutes => Duration::minutes(10),
            Relative::ThirtyMinutes => Duration::minutes(30),
            Relative::AnHour => Duration::hours(1),
            Relative::TwelveHours => Duration::hours(12),
            Relative::ADay => Duration::days(1),
        }
    }
}

/// When a scheduled job should fire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum When {
    /// As soon as the next sweep allows.
    Now,
    /// An absolute UTC instant.
    At { at: DateTime<Utc> },
    /// An absolute instant as Unix seconds.
    AtTimestamp { secs: i64 },
    /// A fixed offset from the moment of scheduling.
    In { offset: Relative },
}

impl When {
    pub fn at(at: DateTime<Utc>) -> Self {
        When::At { at }
    }

    pub fn timestamp(secs: i64) -> Self {
        When::AtTimestamp { secs }
    }

    pub fn relative(offset: Relative) -> Self {
        When::In { offset }
    }
}

impl std::str::FromStr for When {
    type Err = SchedulerError;

    /// `now`, a relative keyword (`minute`, `5min`, `10min`, `30min`, `hour`,
    /// `12h`, `day`), Unix seconds, or an RFC 3339 instant.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let relative = match s {
            "now" => return Ok(When::Now),
            "minute" | "1min" => Some(Relative::AMinute),
            "5min" => Some(Relative::FiveMinutes),
            "10min" => Some(Relative::TenMinutes),
            "30min" => Some(Relative::ThirtyMinutes),
            "hour" | "1h" => Some(Relative::AnHour),
            "12h" => Some(Relative::TwelveHours),
            "day" | "24h" => Some(Relative::ADay),
            _ => None,
        };
        if let Some(offset) = relative {
            return Ok(When::relative(offset));
        }
        if let Ok(secs) = s.parse::<i64>() {
            return Ok(When::timestamp(secs));
        }
        DateTime::parse_from_rfc3339(s)
            .map(|dt| When::at(dt.with_timezone(&Utc)))
            .map_err(|e| SchedulerError::InvalidSchedule(format!("{s}: {e}")))
    }
}

/// Lifecycle state of a job row. Every state but `Pending` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for its trigger date.
    Pending,
    /// Picked by a sweep; the callback (if any) ran successfully.
    Fired,
    /// Cancelled before any sweep picked it.
    Cancelled,
    /// Picked by a sweep; the callback returned an error or panicked.
    Failed,
}

impl JobState {
    /// Value stored in the `triggered` column.
    pub fn code(self) -> i64 {
        match self {
            JobState::Pending => -1,
            JobState::Fired => 1,
            JobState::Cancelled => 2,
            JobState::Failed => 3,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            -1 => Some(JobState::Pending),
            1 => Some(JobState::Fired),
            2 => Some(JobState::Cancelled),
            3 => Some(JobState::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Fired => "fired",
            JobState::Cancelled => "cancelled",
            JobState::Failed => "failed",
        };
        f.pad(s)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "fired" => Ok(JobState::Fired),
            "cancelled" => Ok(JobState::Cancelled),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

/// A job row as reported to administrators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Store-assigned row id.
    pub id: i64,
    /// Hex SHA-256 of the caller's key.
    pub identifier: String,
    /// Deserialized payload forwarded to the callback.
    pub payload: serde_json::Value,
    /// When the job becomes due.
    pub trigger_date: DateTime<Utc>,
    pub state: JobState,
    /// Last write time of the row (Unix seconds).
    pub updated_at: i64,
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Callbacks that ran successfully.
    pub fired: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
    /// Due rows with no registered callback.
    pub dropped: usize,
}

impl SweepReport {
    pub fn total(&self) -> usize {
        self.fired + self.failed + self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_codes_round_trip() {
        for state in [
            JobState::Pending,
            JobState::Fired,
            JobState::Cancelled,
            JobState::Failed,
        ] {
            assert_eq!(JobState::from_code(state.code()), Some(state));
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
        assert_eq!(JobState::Pending.code(), -1);
        assert_eq!(JobState::from_code(0), None);
    }

    #[test]
    fn when_parses_keywords_and_instants() {
        assert_eq!("now".parse::<When>().unwrap(), When::Now);
        assert_eq!(
            "5min".parse::<When>().unwrap(),
            When::relative(Relative::FiveMinutes)
        );
        assert_eq!(
            "1700000000".parse::<When>().unwrap(),
            When::timestamp(1_700_000_000)
        );
        let at = "2026-01-02T03:04:05Z".parse::<When>().unwrap();
        match at {
            When::At { at } => assert_eq!(at.timestamp(), 1_767_323_045),
            other => panic!("unexpected: {other:?}"),
        }
        assert!("soonish".parse::<When>().is_err());
    }

    #[test]
    fn relative_offsets() {
        assert_eq!(Relative::AMinute.offset().num_seconds(), 60);
        assert_eq!(Relative::TwelveHours.offset().num_seconds(), 12 * 3600);
        assert_eq!(Relative::ADay.offset().num_seconds(), 86_400);
    }
}
