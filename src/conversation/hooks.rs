use serde_json::Value;

use crate::conversation::node::Choice;
use crate::conversation::ConversationTree;

/// Observer callbacks for analytics or UI sync. Override only what you need.
#[allow(unused_variables)]
pub trait ConversationHooks {
    fn on_node_enter(&self, node_id: &str, previous: Option<&str>) {}

    fn on_node_exit(&self, previous: &str, next: &str) {}

    fn on_choice_made(&self, choice: &Choice, node_id: Option<&str>) {}

    /// Fires on every `set_variable`, changed or not.
    fn on_variable_changed(&self, name: &str, new_value: &Value, old_value: Option<&Value>) {}

    fn on_tree_complete(&self, engine: &ConversationTree) {}

    fn on_tree_cancelled(&self, engine: &ConversationTree) {}
}
