use serde::Serialize;

/// What a rendered button does when pressed. Hand it back to
/// `ConversationTree::press`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ButtonAction {
    /// Pick `choices[index]` of choice node `node_id`.
    Choose { node_id: String, index: usize },
    /// Follow the `next` link of line node `node_id`.
    Continue { node_id: String, target: String },
}

impl ButtonAction {
    /// The node that produced this button.
    pub fn node_id(&self) -> &str {
        match self {
            ButtonAction::Choose { node_id, .. } | ButtonAction::Continue { node_id, .. } => {
                node_id
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueButton {
    pub text: String,
    pub secondary: bool,
    pub rotating: bool,
    pub fast_rotate: bool,
    pub action: ButtonAction,
}

/// One displayable line, already interpolated.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub text: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub buttons: Vec<DialogueButton>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rotating_text: Vec<String>,
}

pub type DialogueSequence = Vec<DialogueEntry>;

/// The surface that actually shows dialogue.
pub trait DialogueRenderer {
    /// Show a new sequence, replacing whatever is on screen.
    fn start(&mut self, sequence: &DialogueSequence);

    /// Dismiss the current display. Must tolerate repeated calls.
    fn end(&mut self);
}
