pub mod condition;
pub mod config;
pub mod definition;
pub mod dialogue;
pub mod error;
pub mod hooks;
pub mod node;
pub mod state;
pub mod storage;
pub mod value;

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, OnceLock};

use chrono::Utc;
use log::{debug, error, info, warn};
use regex::{Captures, Regex};
use serde_json::Value;

use crate::conversation::config::ConversationConfig;
use crate::conversation::dialogue::{
    ButtonAction, DialogueButton, DialogueEntry, DialogueRenderer, DialogueSequence,
};
use crate::conversation::error::ConversationError;
use crate::conversation::hooks::ConversationHooks;
use crate::conversation::node::{Choice, DialogueSource, Node, NodeKind, TreeDefinition};
use crate::conversation::state::{ChoiceRecord, SavedState};
use crate::conversation::storage::{MemoryStore, StateStore};

/// Data available to interpolation and dynamic dialogue while a node is built.
pub type Context = serde_json::Map<String, Value>;

/// Supplies extra context keys for nodes that name it.
pub type ContextProviderFn =
    Arc<dyn Fn(&ConversationTree) -> anyhow::Result<Context> + Send + Sync>;

/// Outcome of a navigation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Node entered and its dialogue handed to the renderer.
    Displayed(String),
    /// Node entered but no renderer is attached.
    Headless(String),
    /// Entry condition failed with no fallback. The node is current and in
    /// history, but nothing was shown and no enter callbacks ran.
    Blocked(String),
    /// A choice resolved no destination; the engine stays where it was.
    Parked,
    /// Request dropped: stale button, backtracking disabled, or nothing to
    /// go back to.
    Ignored,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{([A-Za-z0-9_]+)\}\}").expect("placeholder pattern is valid")
    })
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Branching dialogue engine: node registry, navigation state, variables,
/// flags, history and persistence.
pub struct ConversationTree {
    config: ConversationConfig,
    nodes: HashMap<String, Arc<Node>>,
    trees: HashMap<String, TreeDefinition>,
    current_node_id: Option<String>,
    variables: BTreeMap<String, Value>,
    flags: BTreeSet<String>,
    history: VecDeque<String>,
    choice_history: VecDeque<ChoiceRecord>,
    context_providers: HashMap<String, ContextProviderFn>,
    hooks: Option<Arc<dyn ConversationHooks>>,
    renderer: Option<Box<dyn DialogueRenderer>>,
    store: Box<dyn StateStore>,
    last_sequence: Option<DialogueSequence>,
}

impl Default for ConversationTree {
    fn default() -> Self {
        Self::new(ConversationConfig::default())
    }
}

impl ConversationTree {
    pub fn new(config: ConversationConfig) -> Self {
        Self {
            config,
            nodes: HashMap::new(),
            trees: HashMap::new(),
            current_node_id: None,
            variables: BTreeMap::new(),
            flags: BTreeSet::new(),
            history: VecDeque::new(),
            choice_history: VecDeque::new(),
            context_providers: HashMap::new(),
            hooks: None,
            renderer: None,
            store: Box::new(MemoryStore::new()),
            last_sequence: None,
        }
    }

    pub fn with_renderer(mut self, renderer: impl DialogueRenderer + 'static) -> Self {
        self.renderer = Some(Box::new(renderer));
        self
    }

    pub fn with_hooks(mut self, hooks: impl ConversationHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    pub fn with_store(mut self, store: impl StateStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    pub fn config(&self) -> &ConversationConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    /// Store a tree and register all of its nodes. A tree that names a root
    /// becomes the default start node.
    pub fn register_tree(&mut self, name: impl Into<String>, tree: TreeDefinition) {
        let name = name.into();
        for (id, node) in &tree.nodes {
            self.nodes.insert(id.clone(), Arc::clone(node));
        }
        if let Some(root) = &tree.root_node {
            self.config.root_node = root.clone();
        }
        info!(
            "Registered tree '{name}' ({} nodes, root={:?})",
            tree.nodes.len(),
            tree.root_node
        );
        self.trees.insert(name, tree);
    }

    /// Insert or replace a single node.
    pub fn register_node(&mut self, id: impl Into<String>, node: Node) {
        self.nodes.insert(id.into(), Arc::new(node));
    }

    pub fn register_context_provider(
        &mut self,
        name: impl Into<String>,
        provider: impl Fn(&ConversationTree) -> anyhow::Result<Context> + Send + Sync + 'static,
    ) {
        self.context_providers.insert(name.into(), Arc::new(provider));
    }

    pub fn get_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id).map(Arc::as_ref)
    }

    pub fn tree(&self, name: &str) -> Option<&TreeDefinition> {
        self.trees.get(name)
    }

    pub fn tree_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.trees.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    /// Restart at `node_id` (or the root). Clears the current node, history
    /// and choice history; variables and flags carry over.
    pub fn start<I, K>(
        &mut self,
        node_id: Option<&str>,
        initial_variables: I,
    ) -> Result<Transition, ConversationError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let target = match node_id {
            Some(id) => id.to_string(),
            None if !self.config.root_node.is_empty() => self.config.root_node.clone(),
            None => return Err(ConversationError::NoStartNode),
        };
        info!("Conversation started at {target}");

        self.transaction(move |engine| {
            engine.current_node_id = None;
            engine.history.clear();
            engine.choice_history.clear();
            for (name, value) in initial_variables {
                engine.set_variable(name, value);
            }
            engine.navigate(&target, 0)
        })
    }

    pub fn goto_node(&mut self, node_id: &str) -> Result<Transition, ConversationError> {
        self.transaction(|engine| engine.navigate(node_id, 0))
    }

    /// Run `step`, restoring the saved state if it fails.
    fn transaction<F>(&mut self, step: F) -> Result<Transition, ConversationError>
    where
        F: FnOnce(&mut Self) -> Result<Transition, ConversationError>,
    {
        let checkpoint = self.save_state();
        let result = step(self);
        if let Err(e) = &result {
            warn!("Transition failed, restoring previous state: {e}");
            self.load_state(checkpoint);
        }
        result
    }

    fn navigate(&mut self, node_id: &str, depth: usize) -> Result<Transition, ConversationError> {
        if depth > self.config.max_redirect_depth {
            error!("Redirect limit exceeded at {node_id}");
            return Err(ConversationError::RedirectLimit {
                node_id: node_id.to_string(),
                limit: self.config.max_redirect_depth,
            });
        }

        let Some(node) = self.nodes.get(node_id).cloned() else {
            error!("Node not found: {node_id}");
            return Err(ConversationError::NodeNotFound(node_id.to_string()));
        };

        let previous = self.current_node_id.clone();
        if let (Some(prev), Some(hooks)) = (previous.as_deref(), self.hooks.clone()) {
            hooks.on_node_exit(prev, node_id);
        }

        // Recorded before the guard runs: a blocked node still counts as
        // current and visited.
        self.current_node_id = Some(node_id.to_string());
        self.record_visit(node_id);
        debug!("Transition: {} -> {node_id}", previous.as_deref().unwrap_or("<none>"));

        if let Some(condition) = &node.condition {
            if !condition.evaluate(self) {
                if let Some(fallback) = &node.fallback {
                    debug!("Condition failed at {node_id}, falling back to {fallback}");
                    return self.navigate(fallback, depth + 1);
                }
                warn!("Condition failed at {node_id} and no fallback is set; nothing displayed");
                return Ok(Transition::Blocked(node_id.to_string()));
            }
        }

        if let Some(on_enter) = &node.on_enter {
            on_enter(self).map_err(|source| ConversationError::Callback {
                node_id: node_id.to_string(),
                source,
            })?;
        }

        if let Some(hooks) = self.hooks.clone() {
            hooks.on_node_enter(node_id, previous.as_deref());
        }

        self.display_node(node_id, &node, depth)
    }

    fn display_node(
        &mut self,
        node_id: &str,
        node: &Node,
        depth: usize,
    ) -> Result<Transition, ConversationError> {
        // Providers run for redirect nodes too; a failing one stops the hop.
        let context = self.gather_context(node_id, node)?;
        if let NodeKind::Redirect { target } = &node.kind {
            debug!("Redirect: {node_id} -> {target}");
            return self.navigate(target, depth + 1);
        }

        let sequence = self.build_dialogue_sequence(node_id, node, &context)?;

        let Some(renderer) = self.renderer.as_mut() else {
            error!("No dialogue renderer attached, cannot display {node_id}");
            return Ok(Transition::Headless(node_id.to_string()));
        };
        renderer.start(&sequence);
        self.last_sequence = Some(sequence);
        Ok(Transition::Displayed(node_id.to_string()))
    }

    fn record_visit(&mut self, node_id: &str) {
        if !self.config.enable_history {
            return;
        }
        self.history.push_back(node_id.to_string());
        while self.history.len() > self.config.max_history_length {
            self.history.pop_front();
        }
    }

    // -----------------------------------------------------------------------
    // Context and dialogue compilation
    // -----------------------------------------------------------------------

    /// Snapshot variables and flags, then merge each provider the node names
    /// in order. Later providers overwrite earlier keys.
    pub fn gather_context(&self, node_id: &str, node: &Node) -> Result<Context, ConversationError> {
        let mut context = Context::new();
        context.insert(
            "variables".into(),
            Value::Object(self.variables.clone().into_iter().collect()),
        );
        context.insert(
            "flags".into(),
            Value::Array(self.flags.iter().cloned().map(Value::String).collect()),
        );

        for name in &node.context_providers {
            let Some(provider) = self.context_providers.get(name) else {
                warn!("Context provider '{name}' is not registered (node {node_id})");
                continue;
            };
            let partial = provider(self).map_err(|source| ConversationError::Callback {
                node_id: node_id.to_string(),
                source,
            })?;
            debug!("Context provider '{name}' supplied {} keys", partial.len());
            context.extend(partial);
        }

        Ok(context)
    }

    /// Compile a node into displayable entries. Redirect nodes compile to
    /// nothing.
    pub fn build_dialogue_sequence(
        &self,
        node_id: &str,
        node: &Node,
        context: &Context,
    ) -> Result<DialogueSequence, ConversationError> {
        match &node.kind {
            NodeKind::Sequence { dialogue } => dialogue
                .iter()
                .map(|source| self.build_dialogue_entry(node_id, source, context))
                .collect(),
            NodeKind::Choice {
                dialogue,
                choices,
                rotating_text,
            } => {
                let mut entry = self.build_dialogue_entry(node_id, dialogue, context)?;
                entry.buttons = self.build_choices(node_id, choices, context);
                entry.rotating_text = rotating_text
                    .iter()
                    .map(|text| self.interpolate(text, context))
                    .collect();
                Ok(vec![entry])
            }
            NodeKind::Redirect { .. } => Ok(Vec::new()),
            NodeKind::Line {
                dialogue,
                next,
                continue_text,
            } => {
                let mut entry = self.build_dialogue_entry(node_id, dialogue, context)?;
                if let Some(next) = next {
                    entry.buttons.push(DialogueButton {
                        text: continue_text
                            .clone()
                            .unwrap_or_else(|| self.config.continue_text.clone()),
                        secondary: false,
                        rotating: false,
                        fast_rotate: false,
                        action: ButtonAction::Continue {
                            node_id: node_id.to_string(),
                            target: next.clone(),
                        },
                    });
                }
                Ok(vec![entry])
            }
        }
    }

    pub fn build_dialogue_entry(
        &self,
        node_id: &str,
        source: &DialogueSource,
        context: &Context,
    ) -> Result<DialogueEntry, ConversationError> {
        let computed;
        let line = match source {
            DialogueSource::Static(line) => line,
            DialogueSource::Dynamic(f) => {
                computed = f(self, context).map_err(|source| ConversationError::Callback {
                    node_id: node_id.to_string(),
                    source,
                })?;
                &computed
            }
        };

        let text = match line.variants.iter().find(|v| v.condition.evaluate(self)) {
            Some(variant) => self.interpolate(&variant.text, context),
            None => self.interpolate(&line.text, context),
        };

        Ok(DialogueEntry {
            speaker: line.speaker.clone(),
            avatar: line.avatar.clone(),
            text,
            ..DialogueEntry::default()
        })
    }

    /// Buttons for the choices whose conditions hold, in definition order.
    pub fn build_choices(
        &self,
        node_id: &str,
        choices: &[Choice],
        context: &Context,
    ) -> Vec<DialogueButton> {
        choices
            .iter()
            .enumerate()
            .filter(|(_, choice)| {
                choice
                    .condition
                    .as_ref()
                    .map_or(true, |condition| condition.evaluate(self))
            })
            .map(|(index, choice)| DialogueButton {
                text: self.interpolate(&choice.text, context),
                secondary: choice.secondary,
                rotating: choice.rotating,
                fast_rotate: choice.fast_rotate,
                action: ButtonAction::Choose {
                    node_id: node_id.to_string(),
                    index,
                },
            })
            .collect()
    }

    /// Replace `{{name}}` with the context value, else the stored variable,
    /// else leave the token as written.
    pub fn interpolate(&self, text: &str, context: &Context) -> String {
        placeholder_pattern()
            .replace_all(text, |caps: &Captures| {
                let key = &caps[1];
                context
                    .get(key)
                    .or_else(|| self.variables.get(key))
                    .map(value::display)
                    .unwrap_or_else(|| caps[0].to_string())
            })
            .into_owned()
    }

    // -----------------------------------------------------------------------
    // Choices
    // -----------------------------------------------------------------------

    /// Record the choice, apply its effects and follow its destination.
    pub fn make_choice(&mut self, choice: &Choice) -> Result<Transition, ConversationError> {
        self.transaction(|engine| engine.apply_choice(choice))
    }

    /// Act on a button from the last rendered sequence. Buttons from a node
    /// that is no longer current are ignored.
    pub fn press(&mut self, action: &ButtonAction) -> Result<Transition, ConversationError> {
        if self.current_node_id.as_deref() != Some(action.node_id()) {
            debug!("Ignoring stale button from {}", action.node_id());
            return Ok(Transition::Ignored);
        }

        match action {
            ButtonAction::Choose { node_id, index } => {
                let node = self
                    .nodes
                    .get(node_id)
                    .cloned()
                    .ok_or_else(|| ConversationError::NodeNotFound(node_id.clone()))?;
                let NodeKind::Choice { choices, .. } = &node.kind else {
                    warn!("Node {node_id} no longer offers choices");
                    return Ok(Transition::Ignored);
                };
                let Some(choice) = choices.get(*index) else {
                    warn!("Node {node_id} has no choice #{index}");
                    return Ok(Transition::Ignored);
                };
                self.make_choice(choice)
            }
            ButtonAction::Continue { target, .. } => self.goto_node(target),
        }
    }

    fn apply_choice(&mut self, choice: &Choice) -> Result<Transition, ConversationError> {
        let node_id = self.current_node_id.clone();
        self.record_choice(ChoiceRecord {
            node_id: node_id.clone(),
            choice_id: choice.record_id().to_string(),
            timestamp: Utc::now(),
        });

        if let Some(on_select) = &choice.on_select {
            on_select(self).map_err(|source| ConversationError::Callback {
                node_id: node_id.clone().unwrap_or_default(),
                source,
            })?;
        }
        for (name, value) in &choice.set_variables {
            self.set_variable(name.clone(), value.clone());
        }
        for flag in &choice.set_flags {
            self.set_flag(flag.clone());
        }
        if let Some(hooks) = self.hooks.clone() {
            hooks.on_choice_made(choice, node_id.as_deref());
        }

        if let Some(target) = &choice.target {
            return self.navigate(target, 0);
        }
        if let Some(targets) = &choice.targets {
            if let Some(hit) = targets.iter().find(|t| t.condition.evaluate(self)) {
                return self.navigate(&hit.target, 0);
            }
            if let Some(fallback) = &choice.fallback {
                return self.navigate(fallback, 0);
            }
            warn!(
                "No target matched for choice '{}' and no fallback is set",
                choice.record_id()
            );
            return Ok(Transition::Parked);
        }

        warn!("Choice '{}' has no target", choice.record_id());
        Ok(Transition::Parked)
    }

    fn record_choice(&mut self, record: ChoiceRecord) {
        self.choice_history.push_back(record);
        if let Some(max) = self.config.max_choice_history {
            while self.choice_history.len() > max {
                self.choice_history.pop_front();
            }
        }
    }

    /// Drain the choice audit log.
    pub fn take_choice_history(&mut self) -> Vec<ChoiceRecord> {
        self.choice_history.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Variables and flags
    // -----------------------------------------------------------------------

    /// Overwrite a variable. The change hook fires even if the value is the
    /// same.
    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        let old = self.variables.insert(name.clone(), value.clone());
        if let Some(hooks) = self.hooks.clone() {
            hooks.on_variable_changed(&name, &value, old.as_ref());
        }
    }

    /// The stored value, or `default` when the stored value is missing or
    /// falsy (`0`, `""`, `false` and `null` all yield the default).
    pub fn get_variable(&self, name: &str, default: impl Into<Value>) -> Value {
        match self.variables.get(name) {
            Some(v) if value::is_truthy(v) => v.clone(),
            _ => default.into(),
        }
    }

    /// Same as `get_variable`.
    pub fn variable_or(&self, name: &str, default: impl Into<Value>) -> Value {
        self.get_variable(name, default)
    }

    /// Whether the key exists, whatever its value.
    pub fn has_variable(&self, name: &str) -> bool {
        self.variables.contains_key(name)
    }

    /// Same as `has_variable`.
    pub fn is_defined(&self, name: &str) -> bool {
        self.has_variable(name)
    }

    pub fn variables(&self) -> &BTreeMap<String, Value> {
        &self.variables
    }

    pub fn set_flag(&mut self, name: impl Into<String>) {
        self.flags.insert(name.into());
    }

    pub fn unset_flag(&mut self, name: &str) {
        self.flags.remove(name);
    }

    pub fn has_flag(&self, name: &str) -> bool {
        self.flags.contains(name)
    }

    pub fn flags(&self) -> &BTreeSet<String> {
        &self.flags
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    pub fn current_node_id(&self) -> Option<&str> {
        self.current_node_id.as_deref()
    }

    pub fn history(&self) -> &VecDeque<String> {
        &self.history
    }

    pub fn choice_history(&self) -> &VecDeque<ChoiceRecord> {
        &self.choice_history
    }

    pub fn has_visited(&self, node_id: &str) -> bool {
        self.history.iter().any(|id| id == node_id)
    }

    /// The entry before the current one in history.
    pub fn previous_node(&self) -> Option<&str> {
        let len = self.history.len();
        if len < 2 {
            return None;
        }
        self.history.get(len - 2).map(String::as_str)
    }

    /// Drop the current history entry and navigate to the one before it.
    /// The target is appended to history again like any other visit.
    pub fn go_back(&mut self) -> Result<Transition, ConversationError> {
        if !self.config.allow_backtrack {
            warn!("Backtracking is disabled");
            return Ok(Transition::Ignored);
        }
        if self.history.len() < 2 {
            warn!("No previous node to go back to");
            return Ok(Transition::Ignored);
        }

        self.transaction(|engine| {
            engine.history.pop_back();
            let Some(previous) = engine.history.back().cloned() else {
                return Ok(Transition::Ignored);
            };
            debug!("Going back to {previous}");
            engine.navigate(&previous, 0)
        })
    }

    /// The sequence most recently handed to the renderer.
    pub fn last_sequence(&self) -> Option<&DialogueSequence> {
        self.last_sequence.as_ref()
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Finish the conversation. State is kept until the next `start`.
    pub fn end(&mut self) {
        info!("Conversation complete at {:?}", self.current_node_id);
        if let Some(hooks) = self.hooks.clone() {
            hooks.on_tree_complete(self);
        }
        self.dismiss();
    }

    /// Abandon the conversation. State is kept until the next `start`.
    pub fn cancel(&mut self) {
        info!("Conversation cancelled at {:?}", self.current_node_id);
        if let Some(hooks) = self.hooks.clone() {
            hooks.on_tree_cancelled(self);
        }
        self.dismiss();
    }

    fn dismiss(&mut self) {
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.end();
        }
        self.last_sequence = None;
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn save_state(&self) -> SavedState {
        SavedState {
            current_node_id: self.current_node_id.clone(),
            variables: self.variables.clone(),
            flags: self.flags.iter().cloned().collect(),
            history: self.history.iter().cloned().collect(),
            choice_history: self.choice_history.iter().cloned().collect(),
        }
    }

    /// Replace navigation state, variables and flags. Nothing is displayed;
    /// call `goto_node` to refresh the view.
    pub fn load_state(&mut self, state: SavedState) {
        self.current_node_id = state.current_node_id;
        self.variables = state.variables;
        self.flags = state.flags.into_iter().collect();
        self.history = state.history.into();
        self.choice_history = state.choice_history.into();
    }

    pub fn save_to_storage(&mut self, key: &str) -> Result<(), ConversationError> {
        let json = serde_json::to_string(&self.save_state())?;
        self.store.set(key, json)?;
        info!("Saved conversation state under '{key}'");
        Ok(())
    }

    /// Restore from the store. Returns `false` (state untouched) if the key
    /// is missing or the blob cannot be read.
    pub fn load_from_storage(&mut self, key: &str) -> bool {
        let json = match self.store.get(key) {
            Ok(Some(json)) => json,
            Ok(None) => {
                warn!("No saved conversation state under '{key}'");
                return false;
            }
            Err(e) => {
                error!("Failed to read saved state '{key}': {e}");
                return false;
            }
        };
        match serde_json::from_str::<SavedState>(&json) {
            Ok(state) => {
                self.load_state(state);
                info!("Loaded conversation state from '{key}'");
                true
            }
            Err(e) => {
                error!("Failed to parse saved state '{key}': {e}");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;
    use crate::conversation::condition::Condition;
    use crate::conversation::node::DialogueLine;

    // -----------------------------------------------------------------------
    // Fixtures
    // -----------------------------------------------------------------------

    #[derive(Clone, Default)]
    struct Recorder {
        shown: Arc<Mutex<Vec<DialogueSequence>>>,
        ended: Arc<Mutex<usize>>,
    }

    impl Recorder {
        fn shown(&self) -> Vec<DialogueSequence> {
            self.shown.lock().unwrap().clone()
        }

        fn last(&self) -> DialogueSequence {
            self.shown.lock().unwrap().last().cloned().expect("something was shown")
        }
    }

    impl DialogueRenderer for Recorder {
        fn start(&mut self, sequence: &DialogueSequence) {
            self.shown.lock().unwrap().push(sequence.clone());
        }

        fn end(&mut self) {
            *self.ended.lock().unwrap() += 1;
        }
    }

    #[derive(Clone, Default)]
    struct Events(Arc<Mutex<Vec<String>>>);

    impl Events {
        fn take(&self) -> Vec<String> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        fn push(&self, event: String) {
            self.0.lock().unwrap().push(event);
        }
    }

    impl ConversationHooks for Events {
        fn on_node_enter(&self, node_id: &str, previous: Option<&str>) {
            self.push(format!("enter {node_id} from {}", previous.unwrap_or("-")));
        }

        fn on_node_exit(&self, previous: &str, next: &str) {
            self.push(format!("exit {previous} to {next}"));
        }

        fn on_choice_made(&self, choice: &Choice, node_id: Option<&str>) {
            self.push(format!("choice {} at {}", choice.record_id(), node_id.unwrap_or("-")));
        }

        fn on_variable_changed(&self, name: &str, new_value: &Value, old_value: Option<&Value>) {
            self.push(format!("var {name}={new_value} was {old_value:?}"));
        }

        fn on_tree_complete(&self, _engine: &ConversationTree) {
            self.push("complete".into());
        }

        fn on_tree_cancelled(&self, _engine: &ConversationTree) {
            self.push("cancelled".into());
        }
    }

    fn engine_with(config: ConversationConfig) -> (ConversationTree, Recorder, Events) {
        let recorder = Recorder::default();
        let events = Events::default();
        let engine = ConversationTree::new(config)
            .with_renderer(recorder.clone())
            .with_hooks(events.clone());
        (engine, recorder, events)
    }

    fn engine() -> (ConversationTree, Recorder, Events) {
        engine_with(ConversationConfig::default())
    }

    fn no_vars() -> Vec<(String, Value)> {
        Vec::new()
    }

    fn press_first(engine: &mut ConversationTree, recorder: &Recorder) -> Transition {
        let action = recorder.last()[0].buttons[0].action.clone();
        engine.press(&action).expect("press succeeds")
    }

    // -----------------------------------------------------------------------
    // Registry
    // -----------------------------------------------------------------------

    #[test]
    fn test_register_node_overwrites() {
        let (mut engine, recorder, _) = engine();
        engine.register_node("a", Node::line("first"));
        engine.register_node("a", Node::line("second"));
        engine.goto_node("a").unwrap();
        assert_eq!(recorder.last()[0].text, "second");
    }

    #[test]
    fn test_register_tree_sets_root_and_nodes() {
        let (mut engine, recorder, _) = engine();
        engine.register_tree(
            "welcome",
            TreeDefinition::new()
                .with_root("hello")
                .with_node("hello", Node::line("Hello, dreamer.")),
        );
        assert_eq!(engine.config().root_node, "hello");
        assert!(engine.get_node("hello").is_some());
        assert!(engine.tree("welcome").is_some());
        assert_eq!(engine.tree_names(), vec!["welcome"]);

        let t = engine.start(None, no_vars()).unwrap();
        assert_eq!(t, Transition::Displayed("hello".into()));
        assert_eq!(recorder.last()[0].text, "Hello, dreamer.");
    }

    #[test]
    fn test_tree_without_root_keeps_default() {
        let (mut engine, _, _) = engine();
        engine.register_tree("extra", TreeDefinition::new().with_node("x", Node::line("x")));
        assert_eq!(engine.config().root_node, "root");
    }

    // -----------------------------------------------------------------------
    // Navigation
    // -----------------------------------------------------------------------

    #[test]
    fn test_end_to_end_choice_scenario() {
        let (mut engine, recorder, events) = engine();
        engine.register_tree(
            "demo",
            TreeDefinition::new()
                .with_node(
                    "root",
                    Node::choice(
                        "Pick one",
                        [Choice::new("Go").with_target("done").set_flag("chose")],
                    ),
                )
                .with_node("done", Node::line("You chose: {{lastChoice}}")),
        );

        engine.start(None, no_vars()).unwrap();
        let shown = recorder.last();
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].text, "Pick one");
        assert_eq!(shown[0].buttons.len(), 1);
        assert_eq!(shown[0].buttons[0].text, "Go");
        events.take();

        let t = press_first(&mut engine, &recorder);
        assert_eq!(t, Transition::Displayed("done".into()));
        assert!(engine.has_flag("chose"));
        assert_eq!(engine.choice_history().len(), 1);
        assert_eq!(engine.choice_history()[0].choice_id, "Go");
        assert_eq!(engine.choice_history()[0].node_id.as_deref(), Some("root"));
        assert_eq!(recorder.last()[0].text, "You chose: {{lastChoice}}");
        assert!(recorder.last()[0].buttons.is_empty());
        assert_eq!(
            events.take(),
            vec!["choice Go at root", "exit root to done", "enter done from root"]
        );
    }

    #[test]
    fn test_condition_failure_uses_fallback() {
        let (mut engine, recorder, events) = engine();
        engine.register_node(
            "vault",
            Node::line("Inside.")
                .with_condition(Condition::flag("has_key"))
                .with_fallback("door"),
        );
        engine.register_node("door", Node::line("Locked."));

        let t = engine.goto_node("vault").unwrap();
        assert_eq!(t, Transition::Displayed("door".into()));
        assert_eq!(engine.current_node_id(), Some("door"));
        assert_eq!(recorder.shown().len(), 1);
        assert_eq!(recorder.last()[0].text, "Locked.");
        let entered: Vec<String> = events
            .take()
            .into_iter()
            .filter(|e| e.starts_with("enter"))
            .collect();
        assert_eq!(entered, vec!["enter door from vault"]);
    }

    #[test]
    fn test_condition_failure_without_fallback_blocks() {
        let (mut engine, recorder, events) = engine();
        engine.register_node(
            "secret",
            Node::line("Shh.").with_condition(Condition::flag("invited")),
        );

        let t = engine.goto_node("secret").unwrap();
        assert_eq!(t, Transition::Blocked("secret".into()));
        // Blocked nodes are still current and visited.
        assert_eq!(engine.current_node_id(), Some("secret"));
        assert!(engine.has_visited("secret"));
        assert!(recorder.shown().is_empty());
        assert!(events.take().iter().all(|e| !e.starts_with("enter")));
    }

    #[test]
    fn test_on_enter_runs_before_display() {
        let (mut engine, recorder, _) = engine();
        engine.register_node(
            "count",
            Node::line("Visit {{visits}}").on_enter(|engine| {
                let visits = engine.get_variable("visits", 0).as_i64().unwrap_or(0);
                engine.set_variable("visits", visits + 1);
                Ok(())
            }),
        );
        engine.goto_node("count").unwrap();
        engine.goto_node("count").unwrap();
        assert_eq!(recorder.last()[0].text, "Visit 2");
    }

    #[test]
    fn test_missing_node_is_an_error_and_keeps_state() {
        let (mut engine, _, _) = engine();
        engine.register_node("here", Node::line("here"));
        engine.goto_node("here").unwrap();

        let err = engine.goto_node("nowhere").unwrap_err();
        assert!(matches!(err, ConversationError::NodeNotFound(ref id) if id == "nowhere"));
        assert_eq!(engine.current_node_id(), Some("here"));
        assert_eq!(*engine.history(), ["here"]);
    }

    #[test]
    fn test_failing_callback_rolls_back() {
        let (mut engine, _, _) = engine();
        engine.register_node("safe", Node::line("safe"));
        engine.register_node(
            "boom",
            Node::line("never").on_enter(|engine| {
                engine.set_variable("touched", true);
                anyhow::bail!("enter failed")
            }),
        );
        engine.goto_node("safe").unwrap();

        let err = engine.goto_node("boom").unwrap_err();
        assert!(matches!(
            err,
            ConversationError::Callback { ref node_id, .. } if node_id == "boom"
        ));
        assert_eq!(engine.current_node_id(), Some("safe"));
        assert_eq!(*engine.history(), ["safe"]);
        assert!(!engine.has_variable("touched"));
    }

    #[test]
    fn test_failing_choice_rolls_back() {
        let (mut engine, recorder, _) = engine();
        engine.register_node(
            "a",
            Node::choice(
                "pick",
                [Choice::new("go")
                    .set_flag("chosen")
                    .on_select(|engine| {
                        engine.set_flag("half_done");
                        engine.set_variable("spent", 1);
                        anyhow::bail!("select failed")
                    })
                    .with_target("b")],
            ),
        );
        engine.register_node("b", Node::line("b"));
        engine.start(Some("a"), no_vars()).unwrap();

        let action = recorder.last()[0].buttons[0].action.clone();
        let err = engine.press(&action).unwrap_err();
        assert!(matches!(err, ConversationError::Callback { ref node_id, .. } if node_id == "a"));
        assert!(engine.choice_history().is_empty());
        assert!(!engine.has_flag("chosen"));
        assert!(!engine.has_flag("half_done"));
        assert!(!engine.has_variable("spent"));
        assert_eq!(engine.current_node_id(), Some("a"));
        assert_eq!(*engine.history(), ["a"]);
    }

    #[test]
    fn test_start_at_missing_node_restores_previous_state() {
        let (mut engine, _, _) = engine();
        engine.register_node("a", Node::line("a"));
        engine.register_node("b", Node::line("b"));
        engine.start(Some("a"), no_vars()).unwrap();
        engine.goto_node("b").unwrap();

        let err = engine
            .start(Some("missing"), [("fresh", json!(true))])
            .unwrap_err();
        assert!(matches!(err, ConversationError::NodeNotFound(ref id) if id == "missing"));
        assert_eq!(engine.current_node_id(), Some("b"));
        assert_eq!(*engine.history(), ["a", "b"]);
        assert!(!engine.has_variable("fresh"));
    }

    #[test]
    fn test_failing_go_back_keeps_history() {
        let (mut engine, _, _) = engine();
        engine.register_node(
            "a",
            Node::line("a").on_enter(|engine| {
                if engine.has_flag("locked") {
                    anyhow::bail!("a is locked");
                }
                Ok(())
            }),
        );
        engine.register_node("b", Node::line("b"));
        engine.start(Some("a"), no_vars()).unwrap();
        engine.goto_node("b").unwrap();
        engine.set_flag("locked");

        assert!(engine.go_back().is_err());
        assert_eq!(engine.current_node_id(), Some("b"));
        assert_eq!(*engine.history(), ["a", "b"]);
    }

    #[test]
    fn test_history_is_bounded() {
        let config = ConversationConfig {
            max_history_length: 3,
            ..ConversationConfig::default()
        };
        let (mut engine, _, _) = engine_with(config);
        for i in 0..5 {
            engine.register_node(format!("n{i}"), Node::line("..."));
        }
        for i in 0..5 {
            engine.goto_node(&format!("n{i}")).unwrap();
        }
        assert_eq!(*engine.history(), ["n2", "n3", "n4"]);
        assert!(!engine.has_visited("n0"));
        assert!(!engine.has_visited("n1"));
    }

    #[test]
    fn test_history_disabled() {
        let config = ConversationConfig {
            enable_history: false,
            ..ConversationConfig::default()
        };
        let (mut engine, _, _) = engine_with(config);
        engine.register_node("a", Node::line("a"));
        engine.goto_node("a").unwrap();
        assert!(engine.history().is_empty());
        assert_eq!(engine.current_node_id(), Some("a"));
    }

    #[test]
    fn test_redirect_never_renders() {
        let (mut engine, recorder, _) = engine();
        engine.register_node("hop", Node::redirect("land"));
        engine.register_node("land", Node::line("Landed."));

        let t = engine.goto_node("hop").unwrap();
        assert_eq!(t, Transition::Displayed("land".into()));
        assert_eq!(recorder.shown().len(), 1);
        assert_eq!(recorder.last()[0].text, "Landed.");
        assert_eq!(*engine.history(), ["hop", "land"]);
    }

    #[test]
    fn test_redirect_gathers_context_first() {
        let (mut engine, recorder, _) = engine();
        let calls = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&calls);
        engine.register_context_provider("count", move |_| {
            *seen.lock().unwrap() += 1;
            Ok(Context::new())
        });
        engine.register_context_provider("broken", |_| anyhow::bail!("provider down"));
        engine.register_node("hop", Node::redirect("land").with_context_provider("count"));
        engine.register_node("bad_hop", Node::redirect("land").with_context_provider("broken"));
        engine.register_node("land", Node::line("Landed."));

        engine.goto_node("hop").unwrap();
        assert_eq!(*calls.lock().unwrap(), 1);

        let err = engine.goto_node("bad_hop").unwrap_err();
        assert!(matches!(
            err,
            ConversationError::Callback { ref node_id, .. } if node_id == "bad_hop"
        ));
        assert_eq!(engine.current_node_id(), Some("land"));
        assert_eq!(recorder.shown().len(), 1);
    }

    #[test]
    fn test_redirect_cycle_hits_limit() {
        let config = ConversationConfig {
            max_redirect_depth: 4,
            ..ConversationConfig::default()
        };
        let (mut engine, _, _) = engine_with(config);
        engine.register_node("ping", Node::redirect("pong"));
        engine.register_node("pong", Node::redirect("ping"));

        let err = engine.goto_node("ping").unwrap_err();
        assert!(matches!(err, ConversationError::RedirectLimit { limit: 4, .. }));
        assert_eq!(engine.current_node_id(), None);
        assert!(engine.history().is_empty());
    }

    #[test]
    fn test_start_resets_navigation_but_keeps_variables() {
        let (mut engine, _, _) = engine();
        engine.register_node("root", Node::choice("?", [Choice::new("stay").with_target("root")]));
        engine.set_flag("old_flag");
        engine.start(None, [("mood", json!("calm"))]).unwrap();
        engine.make_choice(&Choice::new("stay").with_target("root")).unwrap();
        assert_eq!(engine.history().len(), 2);
        assert_eq!(engine.choice_history().len(), 1);

        engine.start(Some("root"), no_vars()).unwrap();
        assert_eq!(*engine.history(), ["root"]);
        assert!(engine.choice_history().is_empty());
        assert!(engine.has_flag("old_flag"));
        assert_eq!(engine.get_variable("mood", Value::Null), json!("calm"));
    }

    #[test]
    fn test_start_without_renderer_is_headless() {
        let mut engine = ConversationTree::default();
        engine.register_node("root", Node::line("nobody sees this"));
        let t = engine.start(None, no_vars()).unwrap();
        assert_eq!(t, Transition::Headless("root".into()));
        assert_eq!(engine.current_node_id(), Some("root"));
        assert!(engine.last_sequence().is_none());
    }

    #[test]
    fn test_empty_root_has_no_start_node() {
        let config = ConversationConfig {
            root_node: String::new(),
            ..ConversationConfig::default()
        };
        let mut engine = ConversationTree::new(config);
        assert!(matches!(
            engine.start(None, no_vars()),
            Err(ConversationError::NoStartNode)
        ));
    }

    // -----------------------------------------------------------------------
    // Compilation
    // -----------------------------------------------------------------------

    #[test]
    fn test_interpolation_priority() {
        let mut engine = ConversationTree::default();
        let mut context = Context::new();
        context.insert("x".into(), json!("A"));
        assert_eq!(engine.interpolate("{{x}}", &Context::new()), "{{x}}");

        engine.set_variable("x", "B");
        assert_eq!(engine.interpolate("{{x}}", &context), "A");
        assert_eq!(engine.interpolate("{{x}}", &Context::new()), "B");
        assert_eq!(
            engine.interpolate("{{x}}-{{ x }}-{{y-z}}", &Context::new()),
            "B-{{ x }}-{{y-z}}"
        );
    }

    #[test]
    fn test_interpolation_uses_stored_falsy_values() {
        let mut engine = ConversationTree::default();
        engine.set_variable("count", 0);
        assert_eq!(engine.interpolate("{{count}} keys", &Context::new()), "0 keys");
    }

    #[test]
    fn test_build_choices_filters_and_keeps_order() {
        let mut engine = ConversationTree::default();
        engine.set_flag("keeper");
        let choices = vec![
            Choice::new("A"),
            Choice::new("B").with_condition(Condition::flag("outsider")),
            Choice::new("C").with_condition(Condition::flag("keeper")).secondary(),
            Choice::new("D").rotating(true),
        ];
        let buttons = engine.build_choices("n", &choices, &Context::new());
        let texts: Vec<&str> = buttons.iter().map(|b| b.text.as_str()).collect();
        assert_eq!(texts, vec!["A", "C", "D"]);
        assert!(buttons[1].secondary);
        assert!(buttons[2].rotating && buttons[2].fast_rotate);
        assert_eq!(
            buttons[1].action,
            ButtonAction::Choose {
                node_id: "n".into(),
                index: 2
            }
        );
    }

    #[test]
    fn test_variants_first_match_wins() {
        let mut engine = ConversationTree::default();
        engine.set_flag("c1");
        engine.set_flag("c2");
        let line = DialogueLine::new("base")
            .with_speaker("keeper")
            .with_variant(Condition::flag("c1"), "T1")
            .with_variant(Condition::flag("c2"), "T2");
        let entry = engine
            .build_dialogue_entry("n", &DialogueSource::from(line.clone()), &Context::new())
            .unwrap();
        assert_eq!(entry.text, "T1");
        assert_eq!(entry.speaker.as_deref(), Some("keeper"));

        engine.unset_flag("c1");
        engine.unset_flag("c2");
        let entry = engine
            .build_dialogue_entry("n", &DialogueSource::from(line), &Context::new())
            .unwrap();
        assert_eq!(entry.text, "base");
    }

    #[test]
    fn test_sequence_builds_every_entry() {
        let (mut engine, recorder, _) = engine();
        engine.register_node(
            "intro",
            Node::sequence([
                DialogueSource::from(DialogueLine::new("One").with_avatar("/one.png")),
                DialogueSource::from("Two"),
                DialogueSource::dynamic(|engine, context| {
                    Ok(DialogueLine::new(format!(
                        "Three ({} flags, {:?})",
                        engine.flags().len(),
                        context.get("guest").and_then(Value::as_str)
                    )))
                }),
            ])
            .with_context_provider("guest"),
        );
        engine.register_context_provider("guest", |_| {
            let mut extra = Context::new();
            extra.insert("guest".into(), json!("sleeper"));
            Ok(extra)
        });

        engine.goto_node("intro").unwrap();
        let shown = recorder.last();
        let texts: Vec<&str> = shown.iter().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, vec!["One", "Two", "Three (0 flags, Some(\"sleeper\"))"]);
        assert_eq!(shown[0].avatar.as_deref(), Some("/one.png"));
    }

    #[test]
    fn test_continue_button() {
        let (mut engine, recorder, _) = engine();
        engine.register_node("a", Node::line("first").with_next("b"));
        engine.register_node("b", Node::line("second").with_next("c").with_continue_text("ONWARD"));
        engine.register_node("c", Node::line("end"));

        engine.goto_node("a").unwrap();
        assert_eq!(recorder.last()[0].buttons[0].text, "CONTINUE");
        press_first(&mut engine, &recorder);
        assert_eq!(recorder.last()[0].text, "second");
        assert_eq!(recorder.last()[0].buttons[0].text, "ONWARD");
        press_first(&mut engine, &recorder);
        assert_eq!(engine.current_node_id(), Some("c"));
    }

    #[test]
    fn test_context_providers_merge_in_order() {
        let (mut engine, recorder, _) = engine();
        engine.register_context_provider("first", |_| {
            let mut c = Context::new();
            c.insert("who".into(), json!("first"));
            c.insert("only_first".into(), json!(1));
            Ok(c)
        });
        engine.register_context_provider("second", |engine| {
            let mut c = Context::new();
            c.insert("who".into(), json!("second"));
            c.insert("keys".into(), json!(engine.variables().len()));
            Ok(c)
        });
        engine.register_node(
            "n",
            Node::choice("{{who}} {{only_first}} {{keys}}", [Choice::new("hi {{who}}")])
                .with_rotating_text(["{{who}} dreams"])
                .with_context_provider("first")
                .with_context_provider("missing")
                .with_context_provider("second"),
        );

        engine.goto_node("n").unwrap();
        let entry = &recorder.last()[0];
        assert_eq!(entry.text, "second 1 0");
        assert_eq!(entry.buttons[0].text, "hi second");
        assert_eq!(entry.rotating_text, vec!["second dreams"]);
    }

    #[test]
    fn test_gather_context_snapshots_state() {
        let mut engine = ConversationTree::default();
        engine.set_variable("name", "dreamer");
        engine.set_flag("awake");
        let node = Node::line("x");
        let context = engine.gather_context("x", &node).unwrap();
        assert_eq!(context["variables"], json!({"name": "dreamer"}));
        assert_eq!(context["flags"], json!(["awake"]));
    }

    #[test]
    fn test_failing_provider_rolls_back() {
        let (mut engine, recorder, _) = engine();
        engine.register_context_provider("broken", |_| anyhow::bail!("provider offline"));
        engine.register_node("n", Node::line("x").with_context_provider("broken"));
        let err = engine.goto_node("n").unwrap_err();
        assert!(err.to_string().contains("provider offline"));
        assert_eq!(engine.current_node_id(), None);
        assert!(recorder.shown().is_empty());
    }

    // -----------------------------------------------------------------------
    // Choices
    // -----------------------------------------------------------------------

    fn door_engine() -> (ConversationTree, Recorder, Events) {
        let (mut engine, recorder, events) = engine();
        for id in ["door", "vault", "hall", "lobby"] {
            engine.register_node(id, Node::line(id));
        }
        engine.goto_node("door").unwrap();
        (engine, recorder, events)
    }

    #[test]
    fn test_conditional_targets_first_match() {
        let (mut engine, _, _) = door_engine();
        engine.set_flag("key");
        engine.set_flag("map");
        let choice = Choice::new("Open")
            .with_conditional_target(Condition::flag("key"), "vault")
            .with_conditional_target(Condition::flag("map"), "hall")
            .with_fallback("lobby");
        engine.make_choice(&choice).unwrap();
        assert_eq!(engine.current_node_id(), Some("vault"));
    }

    #[test]
    fn test_conditional_targets_fall_back() {
        let (mut engine, _, _) = door_engine();
        let choice = Choice::new("Open")
            .with_conditional_target(Condition::flag("key"), "vault")
            .with_fallback("lobby");
        engine.make_choice(&choice).unwrap();
        assert_eq!(engine.current_node_id(), Some("lobby"));
    }

    #[test]
    fn test_unresolved_choice_parks() {
        let (mut engine, _, _) = door_engine();
        let choice = Choice::new("Open").with_conditional_target(Condition::flag("key"), "vault");
        assert_eq!(engine.make_choice(&choice).unwrap(), Transition::Parked);
        assert_eq!(engine.current_node_id(), Some("door"));

        // A fallback alone is not a destination.
        let choice = Choice::new("Wander").with_fallback("lobby");
        assert_eq!(engine.make_choice(&choice).unwrap(), Transition::Parked);
        assert_eq!(engine.current_node_id(), Some("door"));
        assert_eq!(engine.choice_history().len(), 2);
    }

    #[test]
    fn test_choice_effects_apply_in_order() {
        let (mut engine, _, events) = door_engine();
        events.take();
        let choice = Choice::new("Take key")
            .with_id("take_key")
            .on_select(|engine| {
                engine.set_variable("keys", 1);
                Ok(())
            })
            .set_variable("keys", 2)
            .set_flag("has_key")
            .with_target("vault");
        engine.make_choice(&choice).unwrap();

        assert_eq!(engine.get_variable("keys", 0), json!(2));
        assert!(engine.has_flag("has_key"));
        assert_eq!(engine.choice_history()[0].choice_id, "take_key");
        assert_eq!(
            events.take(),
            vec![
                "var keys=1 was None",
                "var keys=2 was Some(Number(1))",
                "choice take_key at door",
                "exit door to vault",
                "enter vault from door",
            ]
        );
    }

    #[test]
    fn test_stale_button_is_ignored() {
        let (mut engine, recorder, _) = engine();
        engine.register_node(
            "ask",
            Node::choice("?", [Choice::new("Go").with_target("gone").set_variable("n", 1)]),
        );
        engine.register_node("gone", Node::line("gone"));
        engine.goto_node("ask").unwrap();
        let action = recorder.last()[0].buttons[0].action.clone();

        assert_eq!(engine.press(&action).unwrap(), Transition::Displayed("gone".into()));
        assert_eq!(engine.press(&action).unwrap(), Transition::Ignored);
        assert_eq!(engine.choice_history().len(), 1);
    }

    #[test]
    fn test_choice_history_cap_and_drain() {
        let config = ConversationConfig {
            max_choice_history: Some(2),
            ..ConversationConfig::default()
        };
        let (mut engine, _, _) = engine_with(config);
        engine.register_node("loop", Node::line("loop"));
        engine.goto_node("loop").unwrap();
        for id in ["a", "b", "c"] {
            engine
                .make_choice(&Choice::new(id).with_target("loop"))
                .unwrap();
        }
        let ids: Vec<&str> = engine
            .choice_history()
            .iter()
            .map(|r| r.choice_id.as_str())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);

        let drained = engine.take_choice_history();
        assert_eq!(drained.len(), 2);
        assert!(engine.choice_history().is_empty());
    }

    // -----------------------------------------------------------------------
    // Variables and flags
    // -----------------------------------------------------------------------

    #[test]
    fn test_get_variable_falsy_fallback() {
        let mut engine = ConversationTree::default();
        engine.set_variable("n", 0);
        assert_eq!(engine.get_variable("n", "default"), json!("default"));
        assert_eq!(engine.variable_or("n", "default"), json!("default"));
        assert!(engine.has_variable("n"));
        assert!(engine.is_defined("n"));
        assert!(!engine.has_variable("m"));
        assert_eq!(engine.get_variable("m", Value::Null), Value::Null);
    }

    #[test]
    fn test_variable_hook_fires_on_unchanged_value() {
        let (mut engine, _, events) = engine();
        engine.set_variable("x", 1);
        engine.set_variable("x", 1);
        assert_eq!(
            events.take(),
            vec!["var x=1 was None", "var x=1 was Some(Number(1))"]
        );
    }

    #[test]
    fn test_flags() {
        let mut engine = ConversationTree::default();
        engine.set_flag("a");
        engine.set_flag("a");
        assert!(engine.has_flag("a"));
        assert_eq!(engine.flags().len(), 1);
        engine.unset_flag("a");
        assert!(!engine.has_flag("a"));
    }

    // -----------------------------------------------------------------------
    // History and backtracking
    // -----------------------------------------------------------------------

    #[test]
    fn test_go_back_moves_forward_to_previous() {
        let (mut engine, recorder, _) = engine();
        engine.register_node("a", Node::line("A"));
        engine.register_node("b", Node::line("B"));
        engine.goto_node("a").unwrap();
        engine.goto_node("b").unwrap();
        assert_eq!(engine.previous_node(), Some("a"));

        let t = engine.go_back().unwrap();
        assert_eq!(t, Transition::Displayed("a".into()));
        assert_eq!(*engine.history(), ["a", "a"]);
        assert_eq!(recorder.last()[0].text, "A");
    }

    #[test]
    fn test_go_back_needs_history_and_permission() {
        let config = ConversationConfig {
            allow_backtrack: false,
            ..ConversationConfig::default()
        };
        let (mut engine, _, _) = engine_with(config);
        engine.register_node("a", Node::line("A"));
        engine.register_node("b", Node::line("B"));
        engine.goto_node("a").unwrap();
        engine.goto_node("b").unwrap();
        assert_eq!(engine.go_back().unwrap(), Transition::Ignored);
        assert_eq!(engine.current_node_id(), Some("b"));

        let (mut fresh, _, _) = engine_with(ConversationConfig::default());
        fresh.register_node("a", Node::line("A"));
        fresh.goto_node("a").unwrap();
        assert_eq!(fresh.previous_node(), None);
        assert_eq!(fresh.go_back().unwrap(), Transition::Ignored);
    }

    #[test]
    fn test_visited_condition_sees_history() {
        let (mut engine, recorder, _) = engine();
        engine.register_node(
            "greet",
            Node::line(
                DialogueLine::new("Hello.")
                    .with_variant(Condition::visited("gift"), "Thanks again."),
            ),
        );
        engine.register_node("gift", Node::line("A gift."));
        engine.goto_node("greet").unwrap();
        assert_eq!(recorder.last()[0].text, "Hello.");
        engine.goto_node("gift").unwrap();
        engine.goto_node("greet").unwrap();
        assert_eq!(recorder.last()[0].text, "Thanks again.");
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    #[test]
    fn test_end_and_cancel_keep_state() {
        let (mut engine, recorder, events) = engine();
        engine.register_node("root", Node::line("bye"));
        engine.start(None, [("mood", json!("sleepy"))]).unwrap();
        events.take();

        engine.end();
        assert_eq!(events.take(), vec!["complete"]);
        assert_eq!(*recorder.ended.lock().unwrap(), 1);
        assert!(engine.last_sequence().is_none());
        assert_eq!(engine.current_node_id(), Some("root"));
        assert!(engine.has_variable("mood"));

        engine.cancel();
        assert_eq!(events.take(), vec!["cancelled"]);
        assert_eq!(*recorder.ended.lock().unwrap(), 2);
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    fn played_engine() -> (ConversationTree, Recorder) {
        let (mut engine, recorder, _) = engine();
        engine.register_tree(
            "t",
            TreeDefinition::new()
                .with_node(
                    "root",
                    Node::choice(
                        "?",
                        [Choice::new("on")
                            .set_variable("depth", 1)
                            .set_flag("started")
                            .with_target("middle")],
                    ),
                )
                .with_node(
                    "middle",
                    Node::choice(
                        "??",
                        [Choice::new("deeper")
                            .set_variable("depth", 2)
                            .with_target("end")],
                    ),
                )
                .with_node("end", Node::line("fin")),
        );
        engine.start(None, [("name", json!("sleeper"))]).unwrap();
        press_first(&mut engine, &recorder);
        press_first(&mut engine, &recorder);
        (engine, recorder)
    }

    #[test]
    fn test_save_load_roundtrip() {
        let (mut engine, _) = played_engine();
        let saved = engine.save_state();
        assert_eq!(saved.current_node_id.as_deref(), Some("end"));
        assert_eq!(saved.history, vec!["root", "middle", "end"]);
        assert_eq!(saved.choice_history.len(), 2);

        engine.start(Some("root"), no_vars()).unwrap();
        engine.set_flag("noise");
        engine.load_state(saved.clone());
        assert_eq!(engine.save_state(), saved);
        assert!(!engine.has_flag("noise"));
    }

    #[test]
    fn test_load_state_does_not_display() {
        let (mut engine, recorder) = played_engine();
        let shown = recorder.shown().len();
        engine.load_state(SavedState {
            current_node_id: Some("root".into()),
            ..SavedState::default()
        });
        assert_eq!(recorder.shown().len(), shown);
        assert_eq!(engine.current_node_id(), Some("root"));
        assert!(engine.variables().is_empty());
        assert!(engine.history().is_empty());
    }

    #[test]
    fn test_storage_roundtrip_through_json() {
        let (mut engine, _) = played_engine();
        let saved = engine.save_state();
        engine.save_to_storage("session").unwrap();

        engine.load_state(SavedState::default());
        assert!(engine.load_from_storage("session"));
        assert_eq!(engine.save_state(), saved);
    }

    #[test]
    fn test_load_from_storage_fails_soft() {
        let mut store = MemoryStore::new();
        store.set("corrupt", "{not json".into()).unwrap();
        let mut engine = ConversationTree::default().with_store(store);
        engine.set_variable("keep", "me");

        assert!(!engine.load_from_storage("missing"));
        assert!(!engine.load_from_storage("corrupt"));
        assert_eq!(engine.get_variable("keep", Value::Null), json!("me"));
    }

    #[test]
    fn test_file_store_persists_across_engines() {
        let dir = tempfile::tempdir().unwrap();
        let (mut engine, _) = played_engine();
        let saved = engine.save_state();
        engine.store = Box::new(storage::FileStore::new(dir.path()));
        engine.save_to_storage("slot1").unwrap();

        let mut fresh = ConversationTree::default().with_store(storage::FileStore::new(dir.path()));
        assert!(fresh.load_from_storage("slot1"));
        assert_eq!(fresh.save_state(), saved);
    }
}
