use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "mainnet" => Ok(Self::Mainnet),
            "testnet" => Ok(Self::Testnet),
            other => Err(format!("unknown network: {other}")),
        }
    }
}

/// An immutable fact about a wallet operation. Confirmed activities never
/// change; a pending activity is replaced wholesale under the same
/// `message_hash` when a newer version or the confirmed counterpart arrives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activity {
    /// Stable once confirmed; derived deterministically, so repeated fetches
    /// of the same underlying event produce the same id.
    pub id: String,
    /// The wallet address the activity belongs to.
    pub address: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    /// Correlation key shared between a pending activity and its eventual
    /// confirmed counterpart, and between duplicate deliveries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_hash: Option<String>,
    pub is_pending: bool,
    /// Opaque content; never interpreted by the feed machinery.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Activity {
    /// The activity's timestamp as a UTC instant, when it is representable.
    pub fn occurred_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp)
    }
}

/// Timestamp descending; ties broken by id descending so the order is
/// deterministic and stable across re-sorts.
pub fn compare_activities(a: &Activity, b: &Activity) -> Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id))
}

pub fn sort_activities(activities: &mut [Activity]) {
    activities.sort_by(compare_activities);
}

/// One socket delivery for one watched address. Multiple updates with the
/// same `message_hash` can arrive; each replaces the previous data for that
/// hash. An empty pending `activities` list means the hash was invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivitiesUpdate {
    pub address: String,
    pub message_hash: String,
    pub are_pending: bool,
    pub activities: Vec<Activity>,
}

impl ActivitiesUpdate {
    /// True when no further updates are expected for this message hash:
    /// either the activities are confirmed, or the pending hash was
    /// invalidated (empty payload).
    pub fn is_final(&self) -> bool {
        !self.are_pending || self.activities.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ClientSocketMessage {
    Configure {
        include_payload: bool,
    },
    Subscribe {
        id: u64,
        addresses: Vec<String>,
        types: Vec<String>,
    },
    Unsubscribe {
        addresses: Vec<String>,
    },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerSocketMessage {
    Subscribed {
        id: u64,
    },
    Actions {
        message_hash: String,
        are_pending: bool,
        activities: Vec<Activity>,
    },
    /// Carries only the correlation key: the pending actions under this hash
    /// are no longer part of the activity history.
    Invalidated {
        message_hash: String,
    },
    Pong,
}

/// Shared foreground/background flag. The pollers consult it when choosing
/// between the focused and unfocused cadence of a split interval.
#[derive(Debug, Clone)]
pub struct FocusState {
    focused: Arc<AtomicBool>,
}

impl FocusState {
    pub fn new(focused: bool) -> Self {
        Self {
            focused: Arc::new(AtomicBool::new(focused)),
        }
    }

    pub fn is_focused(&self) -> bool {
        self.focused.load(AtomicOrdering::Relaxed)
    }

    pub fn set_focused(&self, focused: bool) {
        self.focused.store(focused, AtomicOrdering::Relaxed);
    }
}

impl Default for FocusState {
    fn default() -> Self {
        Self::new(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn activity(id: &str, timestamp: i64) -> Activity {
        Activity {
            id: id.to_string(),
            address: "wallet-a".to_string(),
            timestamp,
            message_hash: None,
            is_pending: false,
            payload: serde_json::Value::Null,
        }
    }

    #[test]
    fn ordering_is_timestamp_descending_with_id_tiebreak() {
        let mut activities = vec![
            activity("b", 100),
            activity("a", 100),
            activity("c", 300),
            activity("d", 200),
        ];
        sort_activities(&mut activities);

        let ids: Vec<&str> = activities.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "d", "b", "a"]);

        // Re-sorting must not change anything.
        let before = activities.clone();
        sort_activities(&mut activities);
        assert_eq!(activities, before);
    }

    #[test]
    fn final_updates_are_confirmed_or_invalidated() {
        let confirmed = ActivitiesUpdate {
            address: "wallet-a".to_string(),
            message_hash: "hash-1".to_string(),
            are_pending: false,
            activities: vec![activity("a", 1)],
        };
        assert!(confirmed.is_final());

        let invalidated = ActivitiesUpdate {
            address: "wallet-a".to_string(),
            message_hash: "hash-1".to_string(),
            are_pending: true,
            activities: Vec::new(),
        };
        assert!(invalidated.is_final());

        let pending = ActivitiesUpdate {
            address: "wallet-a".to_string(),
            message_hash: "hash-1".to_string(),
            are_pending: true,
            activities: vec![activity("a", 1)],
        };
        assert!(!pending.is_final());
    }

    #[test]
    fn client_messages_serialize_with_operation_tag() {
        let message = ClientSocketMessage::Subscribe {
            id: 7,
            addresses: vec!["wallet-a".to_string()],
            types: vec!["actions".to_string(), "pending_actions".to_string()],
        };
        let value = serde_json::to_value(&message).expect("serializable");
        assert_eq!(value["operation"], json!("subscribe"));
        assert_eq!(value["id"], json!(7));
    }

    #[test]
    fn server_messages_parse_by_type_tag() {
        let parsed: ServerSocketMessage =
            serde_json::from_value(json!({ "type": "subscribed", "id": 3 })).expect("parseable");
        assert_eq!(parsed, ServerSocketMessage::Subscribed { id: 3 });
    }
}
