use chrono::{DateTime, Utc};
use smarties_db::{
    DbHelper, DbObject, FieldMeta, FieldType, Stored, Value, ValueCursor, Version,
};

use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobState};

pub const FIELD_IDENTIFIER: &str = "identifier";
pub const FIELD_DATA: &str = "data";
pub const FIELD_TRIGGER_DATE: &str = "triggerDate";
pub const FIELD_TRIGGERED: &str = "triggered";

/// One durable job row. Rows are never deleted; they end in a terminal
/// state and stay as an audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledJob {
    pub identifier: String,
    /// JSON-serialized payload.
    pub data: String,
    /// Unix seconds.
    pub trigger_date: i64,
    pub triggered: JobState,
}

impl DbObject for ScheduledJob {
    const TABLE: &'static str = "scheduledjob";
    const FIELDS: &'static [FieldMeta] = &[
        FieldMeta::new(FIELD_IDENTIFIER, FieldType::String, Version::new(0, 0, 0)),
        FieldMeta::new(FIELD_DATA, FieldType::String, Version::new(0, 0, 0)),
        FieldMeta::new(FIELD_TRIGGER_DATE, FieldType::Timestamp, Version::new(0, 0, 0)),
        FieldMeta::new(FIELD_TRIGGERED, FieldType::Int, Version::new(0, 0, 0)),
    ];

    fn from_values(values: &mut ValueCursor<'_>) -> smarties_db::Result<Self> {
        let identifier = values.next()?;
        let data = values.next()?;
        let trigger_date = values.next()?;
        let code: i64 = values.next()?;
        let triggered = JobState::from_code(code).ok_or_else(|| smarties_db::DbError::Conversion {
            field: FIELD_TRIGGERED.to_string(),
            reason: format!("unknown job state code {code}"),
        })?;
        Ok(Self {
            identifier,
            data,
            trigger_date,
            triggered,
        })
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.identifier.clone().into(),
            self.data.clone().into(),
            self.trigger_date.into(),
            self.triggered.code().into(),
        ]
    }
}

/// Initialise the scheduler table in the store.
///
/// Idempotent: safe to call on every startup. `version` is the declared
/// schema version; the schema ledger decides which columns must be added.
pub fn init_db(jobs: &DbHelper<ScheduledJob>, version: &str) -> Result<()> {
    jobs.migrate(version)?;
    Ok(())
}

/// Administrative view of a stored job row.
pub fn to_job(stored: &Stored<ScheduledJob>) -> Result<Job> {
    let job = &stored.object;
    let trigger_date = DateTime::<Utc>::from_timestamp(job.trigger_date, 0).ok_or_else(|| {
        SchedulerError::InvalidSchedule(format!("trigger date out of range: {}", job.trigger_date))
    })?;
    Ok(Job {
        id: stored.id.unwrap_or_default(),
        identifier: job.identifier.clone(),
        payload: serde_json::from_str(&job.data)?,
        trigger_date,
        state: job.triggered,
        updated_at: stored.timestamp.unwrap_or_default(),
    })
}
