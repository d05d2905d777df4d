use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One entry of the choice audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChoiceRecord {
    /// Node that was current when the choice was made.
    pub node_id: Option<String>,
    pub choice_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Snapshot produced by `save_state` and consumed by `load_state`.
/// Missing fields default to empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SavedState {
    pub current_node_id: Option<String>,
    pub variables: BTreeMap<String, Value>,
    pub flags: Vec<String>,
    pub history: Vec<String>,
    pub choice_history: Vec<ChoiceRecord>,
}
