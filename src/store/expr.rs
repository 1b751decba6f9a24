//! Key conditions, filter/condition predicates and update actions
//!
//! These are the backend-neutral expression types understood by every
//! [`PartitionedStore`](super::PartitionedStore). `MemoryStore` evaluates them
//! directly; `PgStore` renders them into SQL.

use super::Item;
use crate::error::{Error, Result};
use serde_json::Value;
use std::cmp::Ordering;

/// `partition = :v [AND <sort condition>]`
#[derive(Debug, Clone, PartialEq)]
pub struct KeyCondition {
    pub partition: Value,
    pub sort: Option<SortCondition>,
}

impl KeyCondition {
    pub fn partition(value: impl Into<Value>) -> Self {
        Self {
            partition: value.into(),
            sort: None,
        }
    }

    pub fn with_sort(mut self, sort: SortCondition) -> Self {
        self.sort = Some(sort);
        self
    }
}

/// Range condition on a sort attribute
#[derive(Debug, Clone, PartialEq)]
pub enum SortCondition {
    Eq(Value),
    Lt(Value),
    Le(Value),
    Gt(Value),
    Ge(Value),
    Between(Value, Value),
    BeginsWith(String),
}

impl SortCondition {
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            SortCondition::Eq(v) => compare_values(value, v) == Some(Ordering::Equal),
            SortCondition::Lt(v) => compare_values(value, v) == Some(Ordering::Less),
            SortCondition::Le(v) => matches!(
                compare_values(value, v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            SortCondition::Gt(v) => compare_values(value, v) == Some(Ordering::Greater),
            SortCondition::Ge(v) => matches!(
                compare_values(value, v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            SortCondition::Between(lo, hi) => {
                SortCondition::Ge(lo.clone()).matches(value)
                    && SortCondition::Le(hi.clone()).matches(value)
            }
            SortCondition::BeginsWith(prefix) => value
                .as_str()
                .map(|s| s.starts_with(prefix.as_str()))
                .unwrap_or(false),
        }
    }
}

/// Predicate over a single item, used both as a query/scan filter and as a write condition.
/// Lists of conditions are conjunctions.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    AttributeExists(String),
    AttributeNotExists(String),
    Equals(String, Value),
    NotEquals(String, Value),
    LessThan(String, Value),
    LessOrEqual(String, Value),
    GreaterThan(String, Value),
    GreaterOrEqual(String, Value),
    In(String, Vec<Value>),
}

impl Condition {
    pub fn equals(attr: &str, value: impl Into<Value>) -> Self {
        Condition::Equals(attr.to_string(), value.into())
    }

    pub fn attribute(&self) -> &str {
        match self {
            Condition::AttributeExists(a)
            | Condition::AttributeNotExists(a)
            | Condition::Equals(a, _)
            | Condition::NotEquals(a, _)
            | Condition::LessThan(a, _)
            | Condition::LessOrEqual(a, _)
            | Condition::GreaterThan(a, _)
            | Condition::GreaterOrEqual(a, _)
            | Condition::In(a, _) => a,
        }
    }

    /// Evaluate against an item that may not exist yet (write conditions)
    pub fn matches(&self, item: Option<&Item>) -> bool {
        let actual = item.and_then(|i| i.get(self.attribute()));
        match (self, actual) {
            (Condition::AttributeExists(_), found) => found.is_some(),
            (Condition::AttributeNotExists(_), found) => found.is_none(),
            (_, None) => matches!(self, Condition::NotEquals(..)),
            (Condition::Equals(_, v), Some(a)) => compare_values(a, v) == Some(Ordering::Equal),
            (Condition::NotEquals(_, v), Some(a)) => compare_values(a, v) != Some(Ordering::Equal),
            (Condition::LessThan(_, v), Some(a)) => compare_values(a, v) == Some(Ordering::Less),
            (Condition::LessOrEqual(_, v), Some(a)) => matches!(
                compare_values(a, v),
                Some(Ordering::Less | Ordering::Equal)
            ),
            (Condition::GreaterThan(_, v), Some(a)) => {
                compare_values(a, v) == Some(Ordering::Greater)
            }
            (Condition::GreaterOrEqual(_, v), Some(a)) => matches!(
                compare_values(a, v),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            (Condition::In(_, values), Some(a)) => values
                .iter()
                .any(|v| compare_values(a, v) == Some(Ordering::Equal)),
        }
    }
}

pub fn all_match(conditions: &[Condition], item: Option<&Item>) -> bool {
    conditions.iter().all(|c| c.matches(item))
}

/// Numbers compare numerically, strings lexicographically, booleans by value;
/// anything else is incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// One clause of an update expression
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateAction {
    /// Atomic integer add; a missing attribute counts as zero
    Add(String, i64),
    Set(String, Value),
    Remove(String),
    /// Append a string to a list attribute unless already present
    AddToSet(String, String),
    /// Remove every occurrence of a string from a list attribute
    RemoveFromSet(String, String),
}

impl UpdateAction {
    pub fn apply(&self, item: &mut Item) -> Result<()> {
        match self {
            UpdateAction::Add(attr, delta) => {
                let current = match item.get(attr) {
                    None | Some(Value::Null) => 0,
                    Some(Value::Number(n)) => n
                        .as_i64()
                        .or_else(|| n.as_f64().map(|f| f.round() as i64))
                        .unwrap_or(0),
                    Some(other) => {
                        return Err(Error::invalid_input(format!(
                            "cannot add to non-numeric attribute {} ({})",
                            attr, other
                        )))
                    }
                };
                item.insert(attr.clone(), Value::from(current + delta));
            }
            UpdateAction::Set(attr, value) => {
                item.insert(attr.clone(), value.clone());
            }
            UpdateAction::Remove(attr) => {
                item.remove(attr);
            }
            UpdateAction::AddToSet(attr, member) => {
                let list = list_attr(item, attr)?;
                if !list.iter().any(|v| v.as_str() == Some(member.as_str())) {
                    list.push(Value::String(member.clone()));
                }
            }
            UpdateAction::RemoveFromSet(attr, member) => {
                let list = list_attr(item, attr)?;
                list.retain(|v| v.as_str() != Some(member.as_str()));
            }
        }
        Ok(())
    }

    pub fn attribute(&self) -> &str {
        match self {
            UpdateAction::Add(a, _)
            | UpdateAction::Set(a, _)
            | UpdateAction::Remove(a)
            | UpdateAction::AddToSet(a, _)
            | UpdateAction::RemoveFromSet(a, _) => a,
        }
    }
}

fn list_attr<'a>(item: &'a mut Item, attr: &str) -> Result<&'a mut Vec<Value>> {
    let slot = item
        .entry(attr.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if slot.is_null() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| Error::invalid_input(format!("attribute {} is not a list", attr)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn item(v: Value) -> Item {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_condition_on_missing_item() {
        assert!(Condition::AttributeNotExists("id".into()).matches(None));
        assert!(!Condition::AttributeExists("id".into()).matches(None));
        assert!(!Condition::equals("likes", 1).matches(None));
    }

    #[test]
    fn test_numeric_and_string_comparisons() {
        let fact = item(json!({"popularity": 42.5, "difficulty": "beginner"}));
        assert!(Condition::GreaterThan("popularity".into(), json!(40)).matches(Some(&fact)));
        assert!(Condition::equals("difficulty", "beginner").matches(Some(&fact)));
        assert!(!Condition::equals("difficulty", 1).matches(Some(&fact)));
        assert!(SortCondition::Between(json!("a"), json!("c")).matches(&json!("b")));
        assert!(SortCondition::BeginsWith("2024-05".into()).matches(&json!("2024-05-01")));
    }

    #[test]
    fn test_add_keeps_integers() {
        let mut fact = item(json!({"likes": 2}));
        UpdateAction::Add("likes".into(), 1).apply(&mut fact).unwrap();
        UpdateAction::Add("shares".into(), 1).apply(&mut fact).unwrap();
        assert_eq!(fact["likes"], json!(3));
        assert!(fact["likes"].is_i64());
        assert_eq!(fact["shares"], json!(1));
    }

    #[test]
    fn test_set_membership_actions() {
        let mut user = item(json!({"likedFacts": ["a"]}));
        UpdateAction::AddToSet("likedFacts".into(), "a".into())
            .apply(&mut user)
            .unwrap();
        UpdateAction::AddToSet("likedFacts".into(), "b".into())
            .apply(&mut user)
            .unwrap();
        UpdateAction::RemoveFromSet("likedFacts".into(), "a".into())
            .apply(&mut user)
            .unwrap();
        assert_eq!(user["likedFacts"], json!(["b"]));
    }
}
