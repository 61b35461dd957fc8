//! Composable boolean tests over a connection's session attributes.
//!
//! Predicates gate RPC access and filter publish/broadcast delivery. A
//! predicate is a pure function of the session bag at evaluation time; a
//! missing attribute evaluates to false, never to an error.

use crate::connection::Connection;
use serde_json::Value;
use std::collections::HashMap;

/// A first-class boolean test over session attributes.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Attribute exists and is truthy.
    Is(String),
    /// Attribute exists, whatever its value.
    Has(String),
    /// Attribute equals the given value.
    IsEqual(String, Value),
    /// At least one inner predicate holds (short-circuit).
    Any(Vec<Predicate>),
    /// Every inner predicate holds (short-circuit).
    All(Vec<Predicate>),
    /// Inner predicate does not hold.
    Not(Box<Predicate>),
}

impl Predicate {
    pub fn is(attr: impl Into<String>) -> Self {
        Predicate::Is(attr.into())
    }

    pub fn has(attr: impl Into<String>) -> Self {
        Predicate::Has(attr.into())
    }

    pub fn equals(attr: impl Into<String>, value: impl Into<Value>) -> Self {
        Predicate::IsEqual(attr.into(), value.into())
    }

    pub fn any(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::Any(predicates.into_iter().collect())
    }

    pub fn all(predicates: impl IntoIterator<Item = Predicate>) -> Self {
        Predicate::All(predicates.into_iter().collect())
    }

    /// Negates this predicate.
    #[allow(clippy::should_implement_trait)]
    pub fn not(self) -> Self {
        Predicate::Not(Box::new(self))
    }

    /// Evaluates this predicate against a connection's session bag.
    pub fn evaluate(&self, conn: &Connection) -> bool {
        conn.with_session(|bag| self.matches(bag))
    }

    pub(crate) fn matches(&self, bag: &HashMap<String, Value>) -> bool {
        match self {
            Predicate::Is(attr) => bag.get(attr).is_some_and(is_truthy),
            Predicate::Has(attr) => bag.contains_key(attr),
            Predicate::IsEqual(attr, value) => bag.get(attr) == Some(value),
            Predicate::Any(inner) => inner.iter().any(|p| p.matches(bag)),
            Predicate::All(inner) => inner.iter().all(|p| p.matches(bag)),
            Predicate::Not(inner) => !inner.matches(bag),
        }
    }
}

/// JSON truthiness: null, false, zero, and empty containers are falsy.
fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
