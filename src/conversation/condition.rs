use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use log::debug;
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::conversation::value;
use crate::conversation::ConversationTree;

/// Host predicate over the engine state.
pub type ConditionFn = Arc<dyn Fn(&ConversationTree) -> bool + Send + Sync>;

/// A guard over variables, flags and history.
#[derive(Clone)]
pub enum Condition {
    /// Arbitrary host predicate.
    Custom(ConditionFn),
    /// True if the flag is set or the variable of the same name is truthy.
    Named(String),
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
    /// Compare `get_variable(variable)` against an operand.
    Compare {
        variable: String,
        comparison: Comparison,
    },
    Flag(String),
    Visited(String),
    /// A definition shape nobody recognizes. Always false.
    Unrecognized(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Comparison {
    Equals(Value),
    NotEquals(Value),
    GreaterThan(Value),
    LessThan(Value),
    Contains(Value),
}

impl Condition {
    pub fn custom(f: impl Fn(&ConversationTree) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }

    pub fn flag(name: impl Into<String>) -> Self {
        Self::Flag(name.into())
    }

    pub fn visited(node_id: impl Into<String>) -> Self {
        Self::Visited(node_id.into())
    }

    pub fn all(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::All(conditions.into_iter().collect())
    }

    pub fn any(conditions: impl IntoIterator<Item = Condition>) -> Self {
        Self::Any(conditions.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(condition: Condition) -> Self {
        Self::Not(Box::new(condition))
    }

    pub fn equals(variable: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::compare(variable, Comparison::Equals(operand.into()))
    }

    pub fn not_equals(variable: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::compare(variable, Comparison::NotEquals(operand.into()))
    }

    pub fn greater_than(variable: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::compare(variable, Comparison::GreaterThan(operand.into()))
    }

    pub fn less_than(variable: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::compare(variable, Comparison::LessThan(operand.into()))
    }

    pub fn contains(variable: impl Into<String>, operand: impl Into<Value>) -> Self {
        Self::compare(variable, Comparison::Contains(operand.into()))
    }

    fn compare(variable: impl Into<String>, comparison: Comparison) -> Self {
        Self::Compare {
            variable: variable.into(),
            comparison,
        }
    }

    /// Evaluate against the current engine state.
    pub fn evaluate(&self, engine: &ConversationTree) -> bool {
        match self {
            Condition::Custom(f) => f(engine),
            Condition::Named(name) => {
                engine.has_flag(name) || value::is_truthy(&engine.get_variable(name, Value::Null))
            }
            Condition::All(items) => items.iter().all(|c| c.evaluate(engine)),
            Condition::Any(items) => items.iter().any(|c| c.evaluate(engine)),
            Condition::Not(inner) => !inner.evaluate(engine),
            Condition::Compare {
                variable,
                comparison,
            } => {
                let current = engine.get_variable(variable, Value::Null);
                comparison.holds(&current)
            }
            Condition::Flag(name) => engine.has_flag(name),
            Condition::Visited(node_id) => engine.has_visited(node_id),
            Condition::Unrecognized(raw) => {
                debug!("Unrecognized condition {raw}, treating as false");
                false
            }
        }
    }

    /// Build a condition from its JSON shape. Object keys are checked in the
    /// order `and`, `or`, `not`, `variable`, `flag`, `visited`; the first one
    /// present decides the shape.
    pub fn from_json(raw: &Value) -> Self {
        let unrecognized = || Condition::Unrecognized(raw.clone());
        match raw {
            Value::String(name) => Condition::Named(name.clone()),
            Value::Object(map) => {
                if let Some(items) = map.get("and") {
                    return match items {
                        Value::Array(items) => {
                            Condition::All(items.iter().map(Self::from_json).collect())
                        }
                        _ => unrecognized(),
                    };
                }
                if let Some(items) = map.get("or") {
                    return match items {
                        Value::Array(items) => {
                            Condition::Any(items.iter().map(Self::from_json).collect())
                        }
                        _ => unrecognized(),
                    };
                }
                if let Some(inner) = map.get("not") {
                    return Condition::not(Self::from_json(inner));
                }
                if let Some(variable) = map.get("variable") {
                    let Some(variable) = variable.as_str() else {
                        return unrecognized();
                    };
                    let comparison = if let Some(v) = map.get("equals") {
                        Comparison::Equals(v.clone())
                    } else if let Some(v) = map.get("notEquals") {
                        Comparison::NotEquals(v.clone())
                    } else if let Some(v) = map.get("greaterThan") {
                        Comparison::GreaterThan(v.clone())
                    } else if let Some(v) = map.get("lessThan") {
                        Comparison::LessThan(v.clone())
                    } else if let Some(v) = map.get("contains") {
                        Comparison::Contains(v.clone())
                    } else {
                        return unrecognized();
                    };
                    return Condition::compare(variable, comparison);
                }
                if let Some(name) = map.get("flag") {
                    return match name {
                        Value::String(name) => Condition::Flag(name.clone()),
                        _ => unrecognized(),
                    };
                }
                if let Some(node_id) = map.get("visited") {
                    return match node_id {
                        Value::String(node_id) => Condition::Visited(node_id.clone()),
                        _ => unrecognized(),
                    };
                }
                unrecognized()
            }
            _ => unrecognized(),
        }
    }
}

impl Comparison {
    fn holds(&self, current: &Value) -> bool {
        match self {
            Comparison::Equals(operand) => value::equals(current, operand),
            Comparison::NotEquals(operand) => !value::equals(current, operand),
            Comparison::GreaterThan(operand) => {
                value::compare(current, operand) == Some(Ordering::Greater)
            }
            Comparison::LessThan(operand) => {
                value::compare(current, operand) == Some(Ordering::Less)
            }
            Comparison::Contains(operand) => value::contains(current, operand),
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Custom(_) => f.write_str("Custom(<fn>)"),
            Condition::Named(name) => f.debug_tuple("Named").field(name).finish(),
            Condition::All(items) => f.debug_tuple("All").field(items).finish(),
            Condition::Any(items) => f.debug_tuple("Any").field(items).finish(),
            Condition::Not(inner) => f.debug_tuple("Not").field(inner).finish(),
            Condition::Compare {
                variable,
                comparison,
            } => f
                .debug_struct("Compare")
                .field("variable", variable)
                .field("comparison", comparison)
                .finish(),
            Condition::Flag(name) => f.debug_tuple("Flag").field(name).finish(),
            Condition::Visited(node_id) => f.debug_tuple("Visited").field(node_id).finish(),
            Condition::Unrecognized(raw) => f.debug_tuple("Unrecognized").field(raw).finish(),
        }
    }
}

impl<'de> Deserialize<'de> for Condition {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(Condition::from_json(&raw))
    }
}

impl From<&str> for Condition {
    fn from(name: &str) -> Self {
        Condition::Named(name.to_string())
    }
}
