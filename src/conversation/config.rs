use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::conversation::error::ConversationError;

/// Engine options. Every field has a default so partial JSON works.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConversationConfig {
    /// Node used by `start` when no id is given.
    pub root_node: String,

    pub enable_history: bool,

    /// Oldest visits are evicted once history grows past this.
    pub max_history_length: usize,

    pub allow_backtrack: bool,

    /// Cap on the choice audit log (None = unbounded).
    pub max_choice_history: Option<usize>,

    /// Redirect and fallback hops allowed within one navigation.
    pub max_redirect_depth: usize,

    /// Label of the synthesized continue button.
    pub continue_text: String,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            root_node: "root".into(),
            enable_history: true,
            max_history_length: 50,
            allow_backtrack: true,
            max_choice_history: None,
            max_redirect_depth: 32,
            continue_text: "CONTINUE".into(),
        }
    }
}

impl ConversationConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConversationError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}
