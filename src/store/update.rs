use std::collections::HashMap;

use aws_sdk_dynamodb::types::AttributeValue;

/// An atomic partial mutation: disjoint clause lists rendered into the
/// store's native update-expression string. An attribute must appear in at
/// most one of the four lists.
#[derive(Debug, Default, Clone)]
pub struct UpdateExpression {
    /// `name = :value` assignments.
    pub set: Vec<String>,
    /// Attribute names to drop from the item.
    pub remove: Vec<String>,
    /// `name :delta` numeric additions (or set unions).
    pub add: Vec<String>,
    /// `name :subset` set-element removals.
    pub delete: Vec<String>,
}

impl UpdateExpression {
    pub fn set(clause: impl Into<String>) -> Self {
        Self {
            set: vec![clause.into()],
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty() && self.add.is_empty() && self.delete.is_empty()
    }

    /// Renders the native expression, e.g.
    /// `SET a = :a, b = :b REMOVE c ADD d :n DELETE e :s`.
    pub fn render(&self) -> String {
        [
            join_with_prefix(&self.set, "SET"),
            join_with_prefix(&self.remove, "REMOVE"),
            join_with_prefix(&self.add, "ADD"),
            join_with_prefix(&self.delete, "DELETE"),
        ]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>()
        .join(" ")
    }
}

fn join_with_prefix(clauses: &[String], prefix: &str) -> Option<String> {
    if clauses.is_empty() {
        None
    } else {
        Some(format!("{prefix} {}", clauses.join(", ")))
    }
}

/// A write precondition, evaluated atomically by the store against the
/// current state of the item.
#[derive(Debug, Default, Clone)]
pub struct Condition {
    pub expression: String,
    pub names: HashMap<String, String>,
    pub values: HashMap<String, AttributeValue>,
}

impl Condition {
    pub fn new(expression: impl Into<String>) -> Self {
        Self {
            expression: expression.into(),
            ..Self::default()
        }
    }

    pub fn name(mut self, placeholder: impl Into<String>, attr: impl Into<String>) -> Self {
        self.names.insert(placeholder.into(), attr.into());
        self
    }

    pub fn value(mut self, placeholder: impl Into<String>, value: AttributeValue) -> Self {
        self.values.insert(placeholder.into(), value);
        self
    }
}

/// Builds an update from a plain assignment list: `Some(value)` becomes a SET
/// clause, `None` a REMOVE. Placeholders are generated so attribute names
/// never collide with reserved words.
pub fn assignments(
    props: Vec<(String, Option<AttributeValue>)>,
) -> (
    UpdateExpression,
    HashMap<String, String>,
    HashMap<String, AttributeValue>,
) {
    let mut update = UpdateExpression::default();
    let mut names = HashMap::new();
    let mut values = HashMap::new();

    for (i, (name, value)) in props.into_iter().enumerate() {
        let name_placeholder = format!("#name{i}");
        match value {
            Some(value) => {
                let value_placeholder = format!(":value{i}");
                update
                    .set
                    .push(format!("{name_placeholder} = {value_placeholder}"));
                values.insert(value_placeholder, value);
            }
            None => update.remove.push(name_placeholder.clone()),
        }
        names.insert(name_placeholder, name);
    }

    (update, names, values)
}
