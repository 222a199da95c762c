//! Data model: predicates, objects, variables and facts.
//!
//! A [`Predicate`] asserts (or negates) a verb over a set of labeled objects.
//! Object values are terms, integers, nested predicates, or (in patterns)
//! variables. Predicates are values: substitution and copying build new trees.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use termdb_dsl::Expr;

use crate::error::{Error, Result};
use crate::taxonomy::{ObjectType, Taxonomy, TermId};

/// Variable bindings by name.
pub type Bindings = AHashMap<String, Value>;

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct FactId(u32);

impl FactId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for FactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fact#{}", self.0)
    }
}

// ============================================================================
// Variables
// ============================================================================

/// What a variable ranges over. Decides its path feature and binding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    /// Individuals of the declared type (`_term` leaves).
    Entity,
    /// Integers (`_num` leaves). May carry a condition.
    Number,
    /// Verbs in a verb slot, whole sub-predicates in an object slot.
    Predicate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Var {
    pub name: String,
    pub var_type: TermId,
    pub kind: VarKind,
    pub condition: Option<Expr>,
}

impl Var {
    /// Prefer [`Taxonomy::make_var`], which derives `kind` from the type.
    pub fn new(name: impl Into<String>, var_type: TermId, kind: VarKind) -> Self {
        Self {
            name: name.into(),
            var_type,
            kind,
            condition: None,
        }
    }

    pub fn with_condition(mut self, condition: Expr) -> Self {
        self.condition = Some(condition);
        self
    }
}

// ============================================================================
// Values
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Term(TermId),
    Number(i64),
    Var(Var),
    Pred(Box<Predicate>),
}

impl Value {
    pub fn is_ground(&self) -> bool {
        match self {
            Value::Term(_) | Value::Number(_) => true,
            Value::Var(_) => false,
            Value::Pred(p) => p.is_ground(),
        }
    }

    pub fn as_term(&self) -> Option<TermId> {
        match self {
            Value::Term(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<i64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_predicate(&self) -> Option<&Predicate> {
        match self {
            Value::Pred(p) => Some(&**p),
            _ => None,
        }
    }

    /// Replace bound variables; unbound ones stay in place.
    pub fn substitute(&self, bindings: &Bindings) -> Value {
        match self {
            Value::Var(v) => bindings.get(&v.name).cloned().unwrap_or_else(|| self.clone()),
            Value::Pred(p) => Value::Pred(Box::new(p.substitute(bindings))),
            Value::Term(_) | Value::Number(_) => self.clone(),
        }
    }

    /// Sentence-syntax rendering using taxonomy names.
    pub fn render(&self, tax: &Taxonomy) -> String {
        match self {
            Value::Term(t) => tax.name(*t),
            Value::Number(n) => n.to_string(),
            Value::Var(v) => match &v.condition {
                Some(c) => format!("{{{}: {}}}", v.name, c),
                None => v.name.clone(),
            },
            Value::Pred(p) => p.render(tax),
        }
    }
}

impl From<TermId> for Value {
    fn from(t: TermId) -> Self {
        Value::Term(t)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n)
    }
}

impl From<Var> for Value {
    fn from(v: Var) -> Self {
        Value::Var(v)
    }
}

impl From<Predicate> for Value {
    fn from(p: Predicate) -> Self {
        Value::Pred(Box::new(p))
    }
}

// ============================================================================
// Predicates
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verb {
    Term(TermId),
    Var(Var),
}

impl Verb {
    pub fn as_term(&self) -> Option<TermId> {
        match self {
            Verb::Term(t) => Some(*t),
            Verb::Var(_) => None,
        }
    }

    pub fn is_var(&self) -> bool {
        matches!(self, Verb::Var(_))
    }
}

impl From<TermId> for Verb {
    fn from(t: TermId) -> Self {
        Verb::Term(t)
    }
}

impl From<Var> for Verb {
    fn from(v: Var) -> Self {
        Verb::Var(v)
    }
}

/// A labeled edge owned by its predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Object {
    pub label: String,
    pub value: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    verb: Verb,
    truth: bool,
    objects: Vec<Object>,
    /// `X:(...)`: binds the whole predicate to `X` when used as a pattern.
    redundant_var: Option<Var>,
}

/// Structural equality: object order is irrelevant.
impl PartialEq for Predicate {
    fn eq(&self, other: &Self) -> bool {
        self.verb == other.verb
            && self.truth == other.truth
            && self.redundant_var == other.redundant_var
            && self.objects.len() == other.objects.len()
            && self
                .objects
                .iter()
                .all(|o| other.get(&o.label) == Some(&o.value))
    }
}

impl Eq for Predicate {}

impl Predicate {
    pub fn builder(tax: &Taxonomy, verb: impl Into<Verb>) -> PredicateBuilder<'_> {
        PredicateBuilder {
            tax,
            verb: verb.into(),
            truth: true,
            objects: Vec::new(),
            redundant_var: None,
        }
    }

    pub fn verb(&self) -> &Verb {
        &self.verb
    }

    pub fn truth(&self) -> bool {
        self.truth
    }

    /// Objects in insertion order.
    pub fn objects(&self) -> &[Object] {
        &self.objects
    }

    /// Objects in label-name order.
    pub fn sorted_objects(&self) -> Vec<&Object> {
        let mut out: Vec<&Object> = self.objects.iter().collect();
        out.sort_by(|a, b| a.label.cmp(&b.label));
        out
    }

    pub fn get(&self, label: &str) -> Option<&Value> {
        self.objects
            .iter()
            .find(|o| o.label == label)
            .map(|o| &o.value)
    }

    pub fn redundant_var(&self) -> Option<&Var> {
        self.redundant_var.as_ref()
    }

    pub fn is_ground(&self) -> bool {
        !self.verb.is_var()
            && self.redundant_var.is_none()
            && self.objects.iter().all(|o| o.value.is_ground())
    }

    /// Distinct variables in path order: the predicate's own marker and verb,
    /// then objects by label, recursing into nested predicates.
    pub fn variables(&self) -> Vec<&Var> {
        let mut out: Vec<&Var> = Vec::new();
        self.collect_variables(&mut out);
        out
    }

    fn collect_variables<'a>(&'a self, out: &mut Vec<&'a Var>) {
        fn push<'a>(v: &'a Var, out: &mut Vec<&'a Var>) {
            if !out.iter().any(|seen| seen.name == v.name) {
                out.push(v);
            }
        }
        if let Some(v) = &self.redundant_var {
            push(v, out);
        }
        if let Verb::Var(v) = &self.verb {
            push(v, out);
        }
        for object in self.sorted_objects() {
            match &object.value {
                Value::Var(v) => push(v, out),
                Value::Pred(p) => p.collect_variables(out),
                Value::Term(_) | Value::Number(_) => {}
            }
        }
    }

    /// Replace every bound variable, including the verb and the redundant
    /// marker, through nested predicates. Never mutates `self`.
    pub fn substitute(&self, bindings: &Bindings) -> Predicate {
        let verb = match &self.verb {
            Verb::Var(v) => match bindings.get(&v.name) {
                Some(Value::Term(t)) => Verb::Term(*t),
                Some(Value::Pred(p)) => p.verb.clone(),
                _ => self.verb.clone(),
            },
            Verb::Term(_) => self.verb.clone(),
        };
        let redundant_var = match &self.redundant_var {
            Some(v) if bindings.contains_key(&v.name) => None,
            other => other.clone(),
        };
        Predicate {
            verb,
            truth: self.truth,
            objects: self
                .objects
                .iter()
                .map(|o| Object {
                    label: o.label.clone(),
                    value: o.value.substitute(bindings),
                })
                .collect(),
            redundant_var,
        }
    }

    /// Deep copy of the predicate/object tree. Terms are shared handles.
    pub fn copy(&self) -> Predicate {
        self.clone()
    }

    /// Nested predicate reached by following `labels` (empty: `self`).
    pub fn at(&self, labels: &[String]) -> Option<&Predicate> {
        let mut node = self;
        for label in labels {
            node = node.get(label)?.as_predicate()?;
        }
        Some(node)
    }

    pub(crate) fn at_mut(&mut self, labels: &[String]) -> Option<&mut Predicate> {
        let mut node = self;
        for label in labels {
            let object = node.objects.iter_mut().find(|o| &o.label == label)?;
            match &mut object.value {
                Value::Pred(p) => node = &mut **p,
                _ => return None,
            }
        }
        Some(node)
    }

    /// Validate and append one object in place.
    pub(crate) fn push_object(&mut self, tax: &Taxonomy, label: &str, value: Value) -> Result<()> {
        if self.get(label).is_some() {
            return Err(Error::DuplicateLabel {
                label: label.to_string(),
            });
        }
        let declared = declared_object_types(tax, &self.verb)?;
        check_object(tax, &self.verb, &declared, label, &value)?;
        self.objects.push(Object {
            label: label.to_string(),
            value,
        });
        Ok(())
    }

    /// Sentence-syntax rendering: `(verb subj, label value, ...)`.
    pub fn render(&self, tax: &Taxonomy) -> String {
        let mut out = String::new();
        if let Some(v) = &self.redundant_var {
            out.push_str(&v.name);
            out.push(':');
        }
        out.push('(');
        if !self.truth {
            out.push('!');
        }
        match &self.verb {
            Verb::Term(t) => out.push_str(&tax.name(*t)),
            Verb::Var(v) => out.push_str(&v.name),
        }
        let subject = self.objects.iter().find(|o| o.label == "subj");
        if let Some(s) = subject {
            out.push(' ');
            out.push_str(&s.value.render(tax));
        }
        let mut first = subject.is_none();
        for o in self.objects.iter().filter(|o| o.label != "subj") {
            out.push_str(if first { " " } else { ", " });
            first = false;
            out.push_str(&o.label);
            out.push(' ');
            out.push_str(&o.value.render(tax));
        }
        out.push(')');
        out
    }
}

// ============================================================================
// Validation
// ============================================================================

pub struct PredicateBuilder<'t> {
    tax: &'t Taxonomy,
    verb: Verb,
    truth: bool,
    objects: Vec<Object>,
    redundant_var: Option<Var>,
}

impl<'t> PredicateBuilder<'t> {
    pub fn negated(mut self) -> Self {
        self.truth = false;
        self
    }

    pub fn truth(mut self, truth: bool) -> Self {
        self.truth = truth;
        self
    }

    /// A repeated label replaces the earlier value.
    pub fn object(mut self, label: impl Into<String>, value: impl Into<Value>) -> Self {
        let label = label.into();
        let value = value.into();
        match self.objects.iter_mut().find(|o| o.label == label) {
            Some(existing) => existing.value = value,
            None => self.objects.push(Object { label, value }),
        }
        self
    }

    pub fn redundant_var(mut self, var: Var) -> Self {
        self.redundant_var = Some(var);
        self
    }

    /// Validate every label and value against the verb's object types.
    pub fn build(self) -> Result<Predicate> {
        let declared = declared_object_types(self.tax, &self.verb)?;
        for object in &self.objects {
            check_object(self.tax, &self.verb, &declared, &object.label, &object.value)?;
        }
        if let Some(v) = &self.redundant_var {
            if v.kind != VarKind::Predicate {
                return Err(Error::NotA {
                    name: v.name.clone(),
                    expected: "predicate variable".to_string(),
                });
            }
        }
        Ok(Predicate {
            verb: self.verb,
            truth: self.truth,
            objects: self.objects,
            redundant_var: self.redundant_var,
        })
    }
}

fn declared_object_types(tax: &Taxonomy, verb: &Verb) -> Result<Vec<ObjectType>> {
    let vocab = tax.vocabulary();
    match verb {
        Verb::Term(t) => {
            if !tax.is_verb(*t) {
                return Err(Error::NotA {
                    name: tax.name(*t),
                    expected: "verb".to_string(),
                });
            }
            Ok(tax.object_types(*t))
        }
        Verb::Var(v) => {
            if v.kind != VarKind::Predicate {
                return Err(Error::NotA {
                    name: v.name.clone(),
                    expected: "verb".to_string(),
                });
            }
            // `verb` itself declares nothing; its instances all derive from `exist`.
            let ty = if v.var_type == vocab.verb {
                vocab.exist
            } else {
                v.var_type
            };
            Ok(tax.object_types(ty))
        }
    }
}

fn check_object(
    tax: &Taxonomy,
    verb: &Verb,
    declared: &[ObjectType],
    label: &str,
    value: &Value,
) -> Result<()> {
    let Some(ot) = declared.iter().find(|ot| ot.label == label) else {
        return Err(Error::UndeclaredLabel {
            verb: match verb {
                Verb::Term(t) => tax.name(*t),
                Verb::Var(v) => v.name.clone(),
            },
            label: label.to_string(),
        });
    };
    let expected = ot.obj_type;
    let (ok, actual) = match value {
        Value::Term(t) => (
            tax.isa(*t, expected) || tax.are(*t, expected),
            tax.term(*t)
                .and_then(|term| term.term_type)
                .map(|tt| tax.name(tt))
                .unwrap_or_else(|| tax.name(*t)),
        ),
        Value::Number(_) => (tax.is_numeric(expected), "number".to_string()),
        Value::Var(v) => (compatible(tax, v.var_type, expected), tax.name(v.var_type)),
        Value::Pred(p) => match &p.verb {
            Verb::Term(t) => (
                expected == tax.vocabulary().verb || tax.are(*t, expected),
                tax.name(*t),
            ),
            Verb::Var(v) => (compatible(tax, v.var_type, expected), tax.name(v.var_type)),
        },
    };
    if ok {
        Ok(())
    } else {
        Err(Error::WrongObjectType {
            label: label.to_string(),
            value: value.render(tax),
            actual,
            expected: tax.name(expected),
        })
    }
}

/// A variable of type `a` may stand in a slot of type `b` when either type
/// specializes the other.
fn compatible(tax: &Taxonomy, a: TermId, b: TermId) -> bool {
    let verb = tax.vocabulary().verb;
    tax.are(a, b)
        || tax.are(b, a)
        || (b == verb && tax.is_verb_type(a))
        || (a == verb && tax.is_verb_type(b))
}

// ============================================================================
// Facts
// ============================================================================

/// A stored ground predicate. Immutable once inserted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fact {
    pub id: FactId,
    pub fact_set: String,
    pub predicate: Predicate,
}
