use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use log::debug;
use serde::Deserialize;
use serde_json::Value;

use crate::conversation::condition::Condition;
use crate::conversation::error::ConversationError;
use crate::conversation::node::{
    Choice, ConditionalTarget, DialogueLine, DialogueSource, Node, NodeKind, TreeDefinition,
};

// ---------------------------------------------------------------------------
// JSON shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeDef {
    #[serde(default)]
    root_node: Option<String>,
    #[serde(default)]
    nodes: BTreeMap<String, NodeDef>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeDef {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    fallback: Option<String>,
    #[serde(default)]
    dialogue: Option<Value>,
    #[serde(default)]
    choices: Vec<ChoiceDef>,
    #[serde(default)]
    rotating_text: Vec<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    continue_text: Option<String>,
    #[serde(default)]
    context_providers: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChoiceDef {
    #[serde(default)]
    id: Option<String>,
    text: String,
    #[serde(default)]
    condition: Option<Condition>,
    #[serde(default)]
    secondary: bool,
    #[serde(default)]
    rotating: bool,
    #[serde(default)]
    fast_rotate: bool,
    #[serde(default)]
    set_variables: serde_json::Map<String, Value>,
    #[serde(default)]
    set_flags: Vec<String>,
    #[serde(default)]
    target: Option<String>,
    #[serde(default)]
    targets: Option<Vec<ConditionalTarget>>,
    #[serde(default)]
    fallback: Option<String>,
}

// ---------------------------------------------------------------------------
// Conversion
// ---------------------------------------------------------------------------

impl TreeDefinition {
    /// Parse a `{rootNode?, nodes: {id: node}}` document.
    pub fn from_json_str(json: &str) -> Result<Self, ConversationError> {
        let def: TreeDef = serde_json::from_str(json)?;
        tree_from_def(def)
    }

    pub fn from_json_value(json: Value) -> Result<Self, ConversationError> {
        let def: TreeDef = serde_json::from_value(json)?;
        tree_from_def(def)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConversationError> {
        let path = path.as_ref();
        debug!("Reading tree definition from {}", path.display());
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }
}

fn tree_from_def(def: TreeDef) -> Result<TreeDefinition, ConversationError> {
    let mut nodes = BTreeMap::new();
    for (id, node) in def.nodes {
        let node = node_from_def(&id, node)?;
        nodes.insert(id, Arc::new(node));
    }
    Ok(TreeDefinition {
        root_node: def.root_node,
        nodes,
    })
}

fn node_from_def(id: &str, def: NodeDef) -> Result<Node, ConversationError> {
    let kind = match def.kind.as_deref() {
        Some("sequence") => {
            let entries = match def.dialogue {
                Some(Value::Array(items)) => items,
                Some(single @ Value::Object(_)) => vec![single],
                _ => {
                    return Err(ConversationError::Definition(format!(
                        "sequence node '{id}' needs a dialogue list"
                    )))
                }
            };
            let dialogue = entries
                .into_iter()
                .map(|raw| line_from_value(id, raw))
                .collect::<Result<Vec<_>, _>>()?;
            NodeKind::Sequence { dialogue }
        }
        Some("choice") => NodeKind::Choice {
            dialogue: single_line(id, def.dialogue)?,
            choices: def.choices.into_iter().map(choice_from_def).collect(),
            rotating_text: def.rotating_text,
        },
        Some("redirect") => NodeKind::Redirect {
            target: def.target.ok_or_else(|| {
                ConversationError::Definition(format!("redirect node '{id}' has no target"))
            })?,
        },
        _ => NodeKind::Line {
            dialogue: single_line(id, def.dialogue)?,
            next: def.next,
            continue_text: def.continue_text,
        },
    };

    Ok(Node {
        kind,
        condition: def.condition,
        fallback: def.fallback,
        on_enter: None,
        context_providers: def.context_providers,
    })
}

fn single_line(id: &str, raw: Option<Value>) -> Result<DialogueSource, ConversationError> {
    match raw {
        Some(raw) => line_from_value(id, raw),
        None => Err(ConversationError::Definition(format!(
            "node '{id}' has no dialogue"
        ))),
    }
}

fn line_from_value(id: &str, raw: Value) -> Result<DialogueSource, ConversationError> {
    let line: DialogueLine = serde_json::from_value(raw).map_err(|e| {
        ConversationError::Definition(format!("node '{id}' has malformed dialogue: {e}"))
    })?;
    Ok(DialogueSource::Static(line))
}

fn choice_from_def(def: ChoiceDef) -> Choice {
    Choice {
        id: def.id,
        text: def.text,
        condition: def.condition,
        secondary: def.secondary,
        rotating: def.rotating,
        fast_rotate: def.fast_rotate,
        on_select: None,
        set_variables: def.set_variables.into_iter().collect(),
        set_flags: def.set_flags,
        target: def.target,
        targets: def.targets,
        fallback: def.fallback,
    }
}
