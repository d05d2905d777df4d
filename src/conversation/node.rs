use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

use crate::conversation::condition::Condition;
use crate::conversation::{Context, ConversationTree};

/// Side effect run when a node becomes current or a choice is picked.
pub type ActionFn = Arc<dyn Fn(&mut ConversationTree) -> anyhow::Result<()> + Send + Sync>;

/// Computes a dialogue line at display time.
pub type DialogueFn =
    Arc<dyn Fn(&ConversationTree, &Context) -> anyhow::Result<DialogueLine> + Send + Sync>;

// ---------------------------------------------------------------------------
// Dialogue lines
// ---------------------------------------------------------------------------

/// A literal line of dialogue before interpolation.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DialogueLine {
    #[serde(default)]
    pub speaker: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub text: String,
    /// Alternate texts; the first whose condition holds replaces `text`.
    #[serde(default)]
    pub variants: Vec<Variant>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Variant {
    pub condition: Condition,
    pub text: String,
}

impl DialogueLine {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    pub fn with_speaker(mut self, speaker: impl Into<String>) -> Self {
        self.speaker = Some(speaker.into());
        self
    }

    pub fn with_avatar(mut self, avatar: impl Into<String>) -> Self {
        self.avatar = Some(avatar.into());
        self
    }

    pub fn with_variant(mut self, condition: Condition, text: impl Into<String>) -> Self {
        self.variants.push(Variant {
            condition,
            text: text.into(),
        });
        self
    }
}

/// Where a node's dialogue comes from.
#[derive(Clone)]
pub enum DialogueSource {
    Static(DialogueLine),
    Dynamic(DialogueFn),
}

impl DialogueSource {
    pub fn dynamic(
        f: impl Fn(&ConversationTree, &Context) -> anyhow::Result<DialogueLine>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Self::Dynamic(Arc::new(f))
    }
}

impl From<DialogueLine> for DialogueSource {
    fn from(line: DialogueLine) -> Self {
        Self::Static(line)
    }
}

impl From<&str> for DialogueSource {
    fn from(text: &str) -> Self {
        Self::Static(DialogueLine::new(text))
    }
}

impl fmt::Debug for DialogueSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialogueSource::Static(line) => f.debug_tuple("Static").field(line).finish(),
            DialogueSource::Dynamic(_) => f.write_str("Dynamic(<fn>)"),
        }
    }
}

// ---------------------------------------------------------------------------
// Choices
// ---------------------------------------------------------------------------

/// A guarded destination inside `Choice::targets`.
#[derive(Debug, Clone, Deserialize)]
pub struct ConditionalTarget {
    pub condition: Condition,
    pub target: String,
}

/// A selectable option on a choice node.
#[derive(Clone, Default)]
pub struct Choice {
    pub id: Option<String>,
    pub text: String,
    /// Hidden (never built, never selectable) unless this holds.
    pub condition: Option<Condition>,
    pub secondary: bool,
    pub rotating: bool,
    pub fast_rotate: bool,
    pub on_select: Option<ActionFn>,
    pub set_variables: Vec<(String, Value)>,
    pub set_flags: Vec<String>,
    pub target: Option<String>,
    /// Checked in order after `target`; first match wins.
    pub targets: Option<Vec<ConditionalTarget>>,
    pub fallback: Option<String>,
}

impl Choice {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// The id recorded in choice history: the explicit id, else the text.
    pub fn record_id(&self) -> &str {
        self.id.as_deref().unwrap_or(&self.text)
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_conditional_target(
        mut self,
        condition: Condition,
        target: impl Into<String>,
    ) -> Self {
        self.targets.get_or_insert_with(Vec::new).push(ConditionalTarget {
            condition,
            target: target.into(),
        });
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn set_variable(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_variables.push((name.into(), value.into()));
        self
    }

    pub fn set_flag(mut self, name: impl Into<String>) -> Self {
        self.set_flags.push(name.into());
        self
    }

    pub fn on_select(
        mut self,
        f: impl Fn(&mut ConversationTree) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_select = Some(Arc::new(f));
        self
    }

    pub fn secondary(mut self) -> Self {
        self.secondary = true;
        self
    }

    pub fn rotating(mut self, fast: bool) -> Self {
        self.rotating = true;
        self.fast_rotate = fast;
        self
    }
}

impl fmt::Debug for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Choice")
            .field("id", &self.id)
            .field("text", &self.text)
            .field("condition", &self.condition)
            .field("on_select", &self.on_select.as_ref().map(|_| "<fn>"))
            .field("set_variables", &self.set_variables)
            .field("set_flags", &self.set_flags)
            .field("target", &self.target)
            .field("targets", &self.targets)
            .field("fallback", &self.fallback)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Several lines shown back to back.
    Sequence { dialogue: Vec<DialogueSource> },
    /// One line plus buttons.
    Choice {
        dialogue: DialogueSource,
        choices: Vec<Choice>,
        rotating_text: Vec<String>,
    },
    /// Jumps straight to `target` without showing anything.
    Redirect { target: String },
    /// One line, optionally chained to `next` through a continue button.
    Line {
        dialogue: DialogueSource,
        next: Option<String>,
        continue_text: Option<String>,
    },
}

/// A unit of the dialogue graph.
#[derive(Clone)]
pub struct Node {
    pub kind: NodeKind,
    pub condition: Option<Condition>,
    /// Entered instead when `condition` fails.
    pub fallback: Option<String>,
    pub on_enter: Option<ActionFn>,
    /// Provider names merged into the display context, in order.
    pub context_providers: Vec<String>,
}

impl Node {
    fn with_kind(kind: NodeKind) -> Self {
        Self {
            kind,
            condition: None,
            fallback: None,
            on_enter: None,
            context_providers: Vec::new(),
        }
    }

    pub fn line(dialogue: impl Into<DialogueSource>) -> Self {
        Self::with_kind(NodeKind::Line {
            dialogue: dialogue.into(),
            next: None,
            continue_text: None,
        })
    }

    pub fn sequence<D: Into<DialogueSource>>(dialogue: impl IntoIterator<Item = D>) -> Self {
        Self::with_kind(NodeKind::Sequence {
            dialogue: dialogue.into_iter().map(Into::into).collect(),
        })
    }

    pub fn choice(
        dialogue: impl Into<DialogueSource>,
        choices: impl IntoIterator<Item = Choice>,
    ) -> Self {
        Self::with_kind(NodeKind::Choice {
            dialogue: dialogue.into(),
            choices: choices.into_iter().collect(),
            rotating_text: Vec::new(),
        })
    }

    pub fn redirect(target: impl Into<String>) -> Self {
        Self::with_kind(NodeKind::Redirect {
            target: target.into(),
        })
    }

    pub fn with_condition(mut self, condition: Condition) -> Self {
        self.condition = Some(condition);
        self
    }

    pub fn with_fallback(mut self, fallback: impl Into<String>) -> Self {
        self.fallback = Some(fallback.into());
        self
    }

    pub fn on_enter(
        mut self,
        f: impl Fn(&mut ConversationTree) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.on_enter = Some(Arc::new(f));
        self
    }

    pub fn with_context_provider(mut self, name: impl Into<String>) -> Self {
        self.context_providers.push(name.into());
        self
    }

    /// Chain a line node to `next`. No effect on other kinds.
    pub fn with_next(mut self, target: impl Into<String>) -> Self {
        if let NodeKind::Line { next, .. } = &mut self.kind {
            *next = Some(target.into());
        }
        self
    }

    /// Label for the continue button of a line node.
    pub fn with_continue_text(mut self, text: impl Into<String>) -> Self {
        if let NodeKind::Line { continue_text, .. } = &mut self.kind {
            *continue_text = Some(text.into());
        }
        self
    }

    /// Decorative rotating captions for a choice node.
    pub fn with_rotating_text<S: Into<String>>(
        mut self,
        texts: impl IntoIterator<Item = S>,
    ) -> Self {
        if let NodeKind::Choice { rotating_text, .. } = &mut self.kind {
            rotating_text.extend(texts.into_iter().map(Into::into));
        }
        self
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("kind", &self.kind)
            .field("condition", &self.condition)
            .field("fallback", &self.fallback)
            .field("on_enter", &self.on_enter.as_ref().map(|_| "<fn>"))
            .field("context_providers", &self.context_providers)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

/// A named graph handed to `ConversationTree::register_tree`.
#[derive(Debug, Clone, Default)]
pub struct TreeDefinition {
    pub root_node: Option<String>,
    pub nodes: BTreeMap<String, Arc<Node>>,
}

impl TreeDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(mut self, node_id: impl Into<String>) -> Self {
        self.root_node = Some(node_id.into());
        self
    }

    pub fn with_node(mut self, id: impl Into<String>, node: Node) -> Self {
        self.nodes.insert(id.into(), Arc::new(node));
        self
    }

    /// `(from, to)` pairs for every link that names a node outside this
    /// tree. Registration never checks this; it is a lint for authors.
    pub fn missing_targets(&self) -> Vec<(String, String)> {
        let mut missing = Vec::new();
        for (id, node) in &self.nodes {
            let mut links: Vec<&str> = node.fallback.iter().map(String::as_str).collect();
            match &node.kind {
                NodeKind::Redirect { target } => links.push(target),
                NodeKind::Line { next: Some(next), .. } => links.push(next),
                NodeKind::Choice { choices, .. } => {
                    for choice in choices {
                        links.extend(choice.target.as_deref());
                        links.extend(choice.fallback.as_deref());
                        for t in choice.targets.iter().flatten() {
                            links.push(&t.target);
                        }
                    }
                }
                NodeKind::Line { next: None, .. } | NodeKind::Sequence { .. } => {}
            }
            for link in links {
                if !self.nodes.contains_key(link) {
                    missing.push((id.clone(), link.to_string()));
                }
            }
        }
        missing
    }
}
