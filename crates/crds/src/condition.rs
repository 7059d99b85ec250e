//! Status conditions shared by all NSX CRDs
//!
//! Every managed kind exposes `status.conditions`, with `type = "Ready"` as the
//! canonical readiness signal. Conditions are keyed by type: writing a condition
//! whose type already exists replaces the previous entry instead of appending.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Canonical readiness condition type
pub const CONDITION_READY: &str = "Ready";

/// Condition status values
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

/// A single observed condition of a resource
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. "Ready"
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    pub status: ConditionStatus,

    /// Machine-readable CamelCase reason
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Human-readable message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Last time the status field changed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    /// Ready=True condition
    pub fn ready(reason: impl Into<String>, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: CONDITION_READY.to_string(),
            status: ConditionStatus::True,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: Some(now),
        }
    }

    /// Ready=False condition
    pub fn not_ready(reason: impl Into<String>, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            type_: CONDITION_READY.to_string(),
            status: ConditionStatus::False,
            reason: Some(reason.into()),
            message: Some(message.into()),
            last_transition_time: Some(now),
        }
    }

    /// Same type, status, reason and message (transition time ignored)
    pub fn same_state(&self, other: &Condition) -> bool {
        self.type_ == other.type_
            && self.status == other.status
            && self.reason == other.reason
            && self.message == other.message
    }
}

/// Merge `updates` into `conditions`, replacing entries of the same type.
///
/// The previous `lastTransitionTime` is kept when the status of a condition
/// did not change. Returns true if anything observable changed.
pub fn merge_conditions(conditions: &mut Vec<Condition>, updates: Vec<Condition>) -> bool {
    let mut changed = false;
    for mut update in updates {
        match conditions.iter_mut().find(|c| c.type_ == update.type_) {
            Some(existing) => {
                if existing.same_state(&update) {
                    continue;
                }
                if existing.status == update.status {
                    update.last_transition_time = existing.last_transition_time;
                }
                *existing = update;
                changed = true;
            }
            None => {
                conditions.push(update);
                changed = true;
            }
        }
    }
    changed
}

/// Look up a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Uniform access to the conditions of a CR, implemented by every managed kind
pub trait ConditionedResource {
    /// Current conditions (empty when there is no status yet)
    fn conditions(&self) -> &[Condition];

    /// Mutable conditions, creating an empty status if needed
    fn conditions_mut(&mut self) -> &mut Vec<Condition>;

    /// True if a Ready=True condition is present
    fn is_ready(&self) -> bool {
        find_condition(self.conditions(), CONDITION_READY)
            .is_some_and(|c| c.status == ConditionStatus::True)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    #[test]
    fn test_merge_replaces_same_type() {
        let mut conditions = vec![Condition::not_ready("BackendError", "boom", at(1))];
        let changed = merge_conditions(&mut conditions, vec![Condition::ready("Realized", "ok", at(2))]);
        assert!(changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].status, ConditionStatus::True);
        assert_eq!(conditions[0].last_transition_time, Some(at(2)));
    }

    #[test]
    fn test_merge_identical_is_noop() {
        let mut conditions = vec![Condition::ready("Realized", "ok", at(1))];
        let changed = merge_conditions(&mut conditions, vec![Condition::ready("Realized", "ok", at(5))]);
        assert!(!changed);
        assert_eq!(conditions.len(), 1);
        assert_eq!(conditions[0].last_transition_time, Some(at(1)));
    }

    #[test]
    fn test_merge_keeps_transition_time_when_status_unchanged() {
        let mut conditions = vec![Condition::not_ready("PoolExhausted", "a", at(1))];
        merge_conditions(&mut conditions, vec![Condition::not_ready("BackendError", "b", at(9))]);
        assert_eq!(conditions[0].reason.as_deref(), Some("BackendError"));
        assert_eq!(conditions[0].last_transition_time, Some(at(1)));
    }

    #[test]
    fn test_merge_appends_new_type() {
        let mut conditions = vec![Condition::ready("Realized", "ok", at(1))];
        let other = Condition {
            type_: "Degraded".to_string(),
            status: ConditionStatus::False,
            reason: None,
            message: None,
            last_transition_time: Some(at(2)),
        };
        assert!(merge_conditions(&mut conditions, vec![other]));
        assert_eq!(conditions.len(), 2);
    }
}
