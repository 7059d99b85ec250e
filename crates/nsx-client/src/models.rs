//! NSX Policy API models
//!
//! Only the fields the operator relies on are typed; everything else in a
//! policy object is carried through `properties` untouched.

use serde::{Deserialize, Serialize};

/// Paginated list wrapper used by search and list endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResult<T> {
    #[serde(default = "Vec::new")]
    pub results: Vec<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_count: Option<u64>,
}

/// Tag attached to a policy object
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag {
    pub scope: String,
    pub tag: String,
}

impl Tag {
    pub fn new(scope: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            tag: tag.into(),
        }
    }
}

/// Generic NSX policy object (VPC, subnet, IP allocation, ...)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyObject {
    pub id: String,
    #[serde(default)]
    pub path: String,
    pub resource_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub marked_for_delete: bool,
    /// Type-specific payload
    #[serde(flatten)]
    pub properties: serde_json::Map<String, serde_json::Value>,
}

impl PolicyObject {
    pub fn new(id: impl Into<String>, path: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            resource_type: resource_type.into(),
            display_name: None,
            tags: Vec::new(),
            marked_for_delete: false,
            properties: serde_json::Map::new(),
        }
    }

    /// Value of the first tag with the given scope
    pub fn tag_value(&self, scope: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.scope == scope)
            .map(|t| t.tag.as_str())
    }

    /// String property by name
    pub fn property_str(&self, name: &str) -> Option<&str> {
        self.properties.get(name).and_then(|v| v.as_str())
    }

    /// Compares the fields the operator owns: display name, tags (order
    /// independent) and properties. Server-populated fields are ignored.
    pub fn same_intent(&self, other: &PolicyObject) -> bool {
        let mut a = self.tags.clone();
        let mut b = other.tags.clone();
        a.sort();
        b.sort();
        self.display_name == other.display_name
            && a == b
            && self
                .properties
                .iter()
                .all(|(k, v)| other.properties.get(k) == Some(v))
    }
}

/// Realization state reported by NSX for an intent path
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RealizationState {
    Realized,
    InProgress,
    Unrealized,
    Error,
    #[serde(other)]
    Unknown,
}

/// Alarm raised against a realized entity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealizationAlarm {
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

/// One realized entity behind an intent path
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RealizedEntity {
    #[serde(default)]
    pub entity_type: String,
    pub state: RealizationState,
    #[serde(default)]
    pub alarms: Vec<RealizationAlarm>,
}

impl RealizedEntity {
    pub fn new(entity_type: impl Into<String>, state: RealizationState) -> Self {
        Self {
            entity_type: entity_type.into(),
            state,
            alarms: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_result_without_results_field() {
        let list: ListResult<RealizedEntity> = serde_json::from_str(r#"{"result_count": 0}"#).unwrap();
        assert!(list.results.is_empty());
        assert_eq!(list.result_count, Some(0));
    }

    #[test]
    fn test_list_result_of_realized_entities() {
        let raw = r#"{"results": [{"entity_type": "RealizedLogicalSwitch", "state": "IN_PROGRESS"}], "cursor": "00012"}"#;
        let list: ListResult<RealizedEntity> = serde_json::from_str(raw).unwrap();
        assert_eq!(
            list.results,
            vec![RealizedEntity::new("RealizedLogicalSwitch", RealizationState::InProgress)]
        );
        assert_eq!(list.cursor.as_deref(), Some("00012"));
    }
}
