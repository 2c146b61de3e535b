use chrono::{DateTime, Utc};

use crate::types::When;

/// Resolve `when` to the trigger date stored with the job, as Unix seconds.
///
/// Relative offsets are counted from `now`; absolute instants are kept even
/// when already past, so the next sweep fires them late rather than never.
pub fn resolve_trigger(when: &When, now: DateTime<Utc>) -> i64 {
    match when {
        When::Now => now.timestamp(),
        When::At { at } => at.timestamp(),
        When::AtTimestamp { secs } => *secs,
        When::In { offset } => (now + offset.offset()).timestamp(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Relative;
    use chrono::TimeZone;

    fn base() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 17, 8, 0, 0).single().unwrap()
    }

    #[test]
    fn relative_is_counted_from_now() {
        let now = base();
        assert_eq!(
            resolve_trigger(&When::relative(Relative::AMinute), now),
            now.timestamp() + 60
        );
        assert_eq!(
            resolve_trigger(&When::relative(Relative::ADay), now),
            now.timestamp() + 86_400
        );
    }

    #[test]
    fn absolute_past_instant_is_kept() {
        let now = base();
        let past = now - chrono::Duration::hours(2);
        assert_eq!(resolve_trigger(&When::at(past), now), past.timestamp());
        assert_eq!(resolve_trigger(&When::timestamp(5), now), 5);
        assert_eq!(resolve_trigger(&When::Now, now), now.timestamp());
    }
}
