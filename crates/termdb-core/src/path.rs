//! Path derivation: flattening a predicate into indexable features.
//!
//! Every predicate node contributes `_verb` and (unless its verb is a
//! variable) `_neg`; every leaf object contributes one `_num`, `_term` or
//! `_verb` path. Labels are visited in sorted order, so object insertion
//! order never changes the result.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::model::{Predicate, Value, VarKind, Verb};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Feature {
    /// Verb (type) of the predicate at that depth.
    Verb,
    /// Truth flag of the predicate at that depth.
    Neg,
    /// Integer leaf.
    Num,
    /// Entity leaf.
    Term,
}

impl Feature {
    pub fn as_str(self) -> &'static str {
        match self {
            Feature::Verb => "_verb",
            Feature::Neg => "_neg",
            Feature::Num => "_num",
            Feature::Term => "_term",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Path {
    labels: Vec<String>,
    feature: Feature,
}

impl Path {
    pub fn new<I, S>(labels: I, feature: Feature) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            feature,
        }
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn feature(&self) -> Feature {
        self.feature
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for label in &self.labels {
            write!(f, "{label}.")?;
        }
        f.write_str(self.feature.as_str())
    }
}

/// Ordered path list for `predicate`; identical for stored facts and patterns.
pub fn derive_paths(predicate: &Predicate) -> Vec<Path> {
    let mut out = Vec::new();
    let mut prefix = Vec::new();
    recurse(predicate, &mut prefix, &mut out);
    out
}

fn recurse(node: &Predicate, prefix: &mut Vec<String>, out: &mut Vec<Path>) {
    out.push(Path::new(prefix.iter().cloned(), Feature::Verb));
    if !node.verb().is_var() {
        out.push(Path::new(prefix.iter().cloned(), Feature::Neg));
    }
    for object in node.sorted_objects() {
        prefix.push(object.label.clone());
        match &object.value {
            Value::Pred(inner) => recurse(inner, prefix, out),
            value => out.push(Path::new(prefix.iter().cloned(), leaf_feature(value))),
        }
        prefix.pop();
    }
}

fn leaf_feature(value: &Value) -> Feature {
    match value {
        Value::Number(_) => Feature::Num,
        Value::Var(v) => var_feature(v.kind),
        Value::Term(_) | Value::Pred(_) => Feature::Term,
    }
}

fn var_feature(kind: VarKind) -> Feature {
    match kind {
        VarKind::Number => Feature::Num,
        VarKind::Predicate => Feature::Verb,
        VarKind::Entity => Feature::Term,
    }
}

/// What a path points at inside a predicate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Leaf<'a> {
    /// A `_verb` path ending at a predicate node.
    Node(&'a Predicate),
    /// A `_neg` path: the node's truth flag.
    Truth(bool),
    /// A leaf object value (ground or variable).
    Value(&'a Value),
}

impl<'a> Leaf<'a> {
    /// The verb at a node, if ground.
    pub fn verb(&self) -> Option<&'a Verb> {
        match *self {
            Leaf::Node(p) => Some(p.verb()),
            _ => None,
        }
    }
}

/// Walk `path` through `predicate`. `None` when the path does not exist or
/// its feature disagrees with the value found there.
pub fn resolve<'a>(predicate: &'a Predicate, path: &Path) -> Option<Leaf<'a>> {
    let mut node = predicate;
    let labels = path.labels();
    for (i, label) in labels.iter().enumerate() {
        let value = node.get(label)?;
        if let Value::Pred(inner) = value {
            node = &**inner;
            continue;
        }
        if i + 1 != labels.len() {
            return None;
        }
        let consistent = match (path.feature(), value) {
            (Feature::Num, Value::Number(_)) => true,
            (Feature::Term, Value::Term(_)) => true,
            (feature, Value::Var(v)) => var_feature(v.kind) == feature,
            _ => false,
        };
        return consistent.then_some(Leaf::Value(value));
    }
    match path.feature() {
        Feature::Verb => Some(Leaf::Node(node)),
        Feature::Neg => Some(Leaf::Truth(node.truth())),
        Feature::Num | Feature::Term => None,
    }
}
