//! Append-only transition history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of entity a transition belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Milestone,
    Authorization,
    TimeLock,
    Execution,
}

/// One persisted status change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransitionRecord {
    pub entity: EntityKind,
    pub entity_id: Uuid,
    /// `None` on creation.
    pub from: Option<String>,
    pub to: String,
    pub actor: String,
    pub at: DateTime<Utc>,
    /// Store version at which the change was written.
    pub version: u64,
}

/// History of a single entity, oldest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntityHistory {
    pub records: Vec<TransitionRecord>,
}

impl EntityHistory {
    /// Status the entity had at `at`, if it existed then.
    pub fn status_at(&self, at: DateTime<Utc>) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .find(|r| r.at <= at)
            .map(|r| r.to.as_str())
    }

    /// Latest recorded status.
    pub fn current(&self) -> Option<&str> {
        self.records.last().map(|r| r.to.as_str())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(to: &str, at: DateTime<Utc>, version: u64) -> TransitionRecord {
        TransitionRecord {
            entity: EntityKind::Execution,
            entity_id: Uuid::nil(),
            from: None,
            to: to.to_string(),
            actor: "test".to_string(),
            at,
            version,
        }
    }

    #[test]
    fn test_status_at() {
        let t0 = Utc::now();
        let history = EntityHistory {
            records: vec![
                record("pending", t0, 1),
                record("submitted", t0 + Duration::seconds(10), 2),
                record("confirmed", t0 + Duration::seconds(20), 3),
            ],
        };

        assert_eq!(history.status_at(t0 - Duration::seconds(1)), None);
        assert_eq!(history.status_at(t0 + Duration::seconds(15)), Some("submitted"));
        assert_eq!(history.current(), Some("confirmed"));
        assert_eq!(history.len(), 3);
    }
}
