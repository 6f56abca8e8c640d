use std::time::Duration;

use serde::Serialize;

/// Counters and flags reported by one pipeline, or by a whole pass once the
/// per-pipeline outcomes have been folded together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncOutcome {
    pub inserted: u64,
    pub deleted: u64,
    pub io_errors: u64,
    pub parse_errors: u64,
    pub auth_errors: u64,
    pub database_error: bool,
    pub too_many_deletions: bool,
    pub more_records_to_get: bool,
    #[serde(rename = "retry_delay_secs", serialize_with = "serialize_secs")]
    pub retry_delay: Duration,
}

impl SyncOutcome {
    pub fn has_error(&self) -> bool {
        self.io_errors > 0
            || self.parse_errors > 0
            || self.auth_errors > 0
            || self.database_error
            || self.too_many_deletions
            || self.more_records_to_get
    }

    /// Keeps the longest suggested delay seen so far.
    pub fn suggest_retry(&mut self, delay: Duration) {
        self.retry_delay = self.retry_delay.max(delay);
    }

    pub fn merge(&mut self, other: &SyncOutcome) {
        self.inserted += other.inserted;
        self.deleted += other.deleted;
        self.io_errors += other.io_errors;
        self.parse_errors += other.parse_errors;
        self.auth_errors += other.auth_errors;
        self.database_error |= other.database_error;
        self.too_many_deletions |= other.too_many_deletions;
        self.more_records_to_get |= other.more_records_to_get;
        self.suggest_retry(other.retry_delay);
    }
}

fn serialize_secs<S: serde::Serializer>(delay: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(delay.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_sums_counters_and_keeps_longest_delay() {
        let mut total = SyncOutcome {
            inserted: 2,
            io_errors: 1,
            retry_delay: Duration::from_secs(1800),
            ..SyncOutcome::default()
        };
        let other = SyncOutcome {
            inserted: 1,
            deleted: 4,
            parse_errors: 1,
            more_records_to_get: true,
            retry_delay: Duration::from_secs(3600),
            ..SyncOutcome::default()
        };

        total.merge(&other);

        assert_eq!(total.inserted, 3);
        assert_eq!(total.deleted, 4);
        assert_eq!(total.io_errors, 1);
        assert_eq!(total.parse_errors, 1);
        assert!(total.more_records_to_get);
        assert_eq!(total.retry_delay, Duration::from_secs(3600));
    }

    #[test]
    fn counts_alone_are_not_errors() {
        let outcome = SyncOutcome {
            inserted: 5,
            deleted: 5,
            ..SyncOutcome::default()
        };
        assert!(!outcome.has_error());

        let flagged = SyncOutcome {
            too_many_deletions: true,
            ..SyncOutcome::default()
        };
        assert!(flagged.has_error());
    }

    #[test]
    fn serializes_delay_in_seconds() {
        let outcome = SyncOutcome {
            retry_delay: Duration::from_secs(1800),
            ..SyncOutcome::default()
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["retry_delay_secs"], 1800);
        assert_eq!(value["inserted"], 0);
    }
}
