//! JSON field selector: compile a selector expression to JSON pointers
//! and project documents to the selected subset.
//!
//! A selector is a comma-separated list of terms; a term is a `/`-joined
//! path that may end in a parenthesized sub-selector. `a/b(c,d/e)`
//! compiles to the pointers `/a/b/c` and `/a/b/d/e`. Only the most inner
//! pointers survive: selecting `a` and `a/b/c` keeps `/a/b/c` alone.

use std::collections::BTreeSet;

use serde_json::Value;
use thiserror::Error;

use crate::model::pointer;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SelectorError {
    #[error(
        "the field selector `{selector}` is with different amount of opening '(' and closing ')' parentheses"
    )]
    UnbalancedParentheses { selector: String },
}

/// Compile a selector to its set of most-inner JSON pointers.
pub fn pointers(selector: &str) -> Result<Vec<String>, SelectorError> {
    validate(selector)?;

    let mut set = BTreeSet::new();
    flatten(inner_selectors(selector), &mut set);
    ensure_most_inner(&mut set);

    Ok(set
        .into_iter()
        .filter(|p| !p.is_empty())
        .map(|p| format!("/{p}"))
        .collect())
}

/// Project `value` to the subset selected by `selector`.
///
/// Arrays are projected element-wise; anything else is treated as an
/// object whose selected leaves are copied with their ancestors rebuilt.
/// Projection is idempotent.
pub fn project(value: &Value, selector: &str) -> Result<Value, SelectorError> {
    let pointers = pointers(selector)?;
    Ok(match value {
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| subset(item, &pointers)).collect())
        }
        other => subset(other, &pointers),
    })
}

fn subset(value: &Value, pointers: &[String]) -> Value {
    let mut out = Value::Object(Default::default());
    for p in pointers {
        if let Some(selected) = value.pointer(p) {
            pointer::set(&mut out, p, selected.clone());
        }
    }
    out
}

fn validate(selector: &str) -> Result<(), SelectorError> {
    let opening = selector.matches('(').count();
    let closing = selector.matches(')').count();
    if opening != closing {
        return Err(SelectorError::UnbalancedParentheses {
            selector: selector.to_string(),
        });
    }
    Ok(())
}

/// Split a selector into its first-level terms, honoring parentheses.
fn inner_selectors(parent: &str) -> Vec<String> {
    let mut children: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for c in parent.chars() {
        match c {
            '(' => {
                depth += 1;
                current.push(c);
            }
            ')' if depth > 0 => {
                depth -= 1;
                current.push(c);
            }
            ',' if depth == 0 => {
                add_unique(&mut children, std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    add_unique(&mut children, current);
    children
}

fn add_unique(children: &mut Vec<String>, term: String) {
    if !children.contains(&term) {
        children.push(term);
    }
}

fn flatten(terms: Vec<String>, out: &mut BTreeSet<String>) {
    for term in terms {
        if !term.contains('(') {
            out.insert(term);
        } else {
            flatten_parenthesized(&term, out);
        }
    }
}

/// `a/b(c,d/e)` contributes `a/b/c` and `a/b/d/e`; an empty group
/// contributes the root alone.
fn flatten_parenthesized(term: &str, out: &mut BTreeSet<String>) {
    let Some((root, group)) = term.split_once('(') else {
        return;
    };
    let Some(group) = group.strip_suffix(')') else {
        return;
    };

    let mut inner = BTreeSet::new();
    flatten(inner_selectors(group), &mut inner);
    inner.retain(|p| !p.is_empty());

    if inner.is_empty() {
        if !root.is_empty() {
            out.insert(root.to_string());
        }
        return;
    }
    for path in inner {
        if root.is_empty() {
            out.insert(path);
        } else {
            out.insert(format!("{root}/{path}"));
        }
    }
}

/// Drop `a` and `a/b` when `a/b/c` is present.
fn ensure_most_inner(fields: &mut BTreeSet<String>) {
    let snapshot: Vec<String> = fields.iter().cloned().collect();
    for field in snapshot {
        let nodes: Vec<&str> = field.split('/').collect();
        let mut parent = String::new();
        for node in &nodes[..nodes.len().saturating_sub(1)] {
            if node.is_empty() {
                continue;
            }
            if parent.is_empty() {
                parent = node.to_string();
            } else {
                parent = format!("{parent}/{node}");
            }
            fields.remove(&parent);
        }
    }
}
