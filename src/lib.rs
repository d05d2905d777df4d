//! Branching dialogue engine for Reverie House: guarded nodes, choices,
//! variables and flags, interpolated text, bounded history and save/load.

pub mod conversation;
pub mod play;
pub mod scenario;

pub use conversation::condition::{Comparison, Condition};
pub use conversation::config::ConversationConfig;
pub use conversation::dialogue::{
    ButtonAction, DialogueButton, DialogueEntry, DialogueRenderer, DialogueSequence,
};
pub use conversation::error::ConversationError;
pub use conversation::hooks::ConversationHooks;
pub use conversation::node::{
    Choice, ConditionalTarget, DialogueLine, DialogueSource, Node, NodeKind, TreeDefinition,
    Variant,
};
pub use conversation::state::{ChoiceRecord, SavedState};
pub use conversation::storage::{FileStore, MemoryStore, StateStore};
pub use conversation::{Context, ConversationTree, Transition};
