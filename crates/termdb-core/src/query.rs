//! Query compiler.
//!
//! A pattern is flattened with the same path deriver used for storage, then
//! each path's leaf is classified:
//!
//! - ground value            -> `Eq`
//! - first variable use      -> `In` (admissible set) / `Exists` (numbers)
//! - later variable use      -> `Same` / `SameSubtree` against the first use
//! - attached condition      -> `Condition`, compiled over the binding slots
//!
//! Filters run in that order, once, against one fact set. Each returned fact
//! is turned into a [`Match`] by reading every variable back at its path.

use serde::{Deserialize, Serialize};
use termdb_dsl::Expr;
use tracing::debug;

use crate::condition::{self, CompiledExpr};
use crate::error::{Error, Result};
use crate::model::{Bindings, Fact, Predicate, Value, Var, VarKind, Verb};
use crate::path::{derive_paths, resolve, Leaf, Path};
use crate::store::{FactBackend, FactStore, SegmentValue};
use crate::taxonomy::Taxonomy;

// ============================================================================
// Filter program
// ============================================================================

/// One step of a compiled program. `path`, `first` and `later` index into
/// [`FilterProgram::paths`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Filter {
    /// Segment at `path` equals `value`.
    Eq { path: usize, value: SegmentValue },
    /// Segment at `path` is one of `values`.
    In { path: usize, values: Vec<SegmentValue> },
    /// The fact has a segment at `path`.
    Exists { path: usize },
    /// Segments at `first` and `later` are equal.
    Same { first: usize, later: usize },
    /// Sub-predicates rooted at the two `_verb` paths are structurally equal.
    SameSubtree { first: usize, later: usize },
    /// Numeric condition over segment values.
    Condition { expr: CompiledExpr },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterProgram {
    pub paths: Vec<Path>,
    pub filters: Vec<Filter>,
}

impl FilterProgram {
    /// Equality on every given row.
    pub fn ground(segments: &[(Path, SegmentValue)]) -> Self {
        let mut program = FilterProgram::default();
        for (path, value) in segments {
            let slot = program.slot(path);
            program.filters.push(Filter::Eq { path: slot, value: *value });
        }
        program
    }

    fn slot(&mut self, path: &Path) -> usize {
        if let Some(i) = self.paths.iter().position(|p| p == path) {
            return i;
        }
        self.paths.push(path.clone());
        self.paths.len() - 1
    }
}

// ============================================================================
// Compilation
// ============================================================================

/// How a variable's value is read back from a matched fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindMode {
    /// The entity at a `_term` path.
    Term,
    /// The integer at a `_num` path.
    Number,
    /// The verb term at a `_verb` path (verb-slot variables).
    Verb,
    /// The whole sub-predicate rooted at a `_verb` path.
    Subtree,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub var: Var,
    /// First occurrence, as an index into the program's paths.
    pub slot: usize,
    pub mode: BindMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledQuery {
    pub program: FilterProgram,
    pub bindings: Vec<Binding>,
}

struct Compiler<'t> {
    tax: &'t Taxonomy,
    program: FilterProgram,
    ground: Vec<Filter>,
    membership: Vec<Filter>,
    same: Vec<Filter>,
    conditions: Vec<Expr>,
    bindings: Vec<Binding>,
}

impl<'t> Compiler<'t> {
    fn new(tax: &'t Taxonomy) -> Self {
        Self {
            tax,
            program: FilterProgram::default(),
            ground: Vec::new(),
            membership: Vec::new(),
            same: Vec::new(),
            conditions: Vec::new(),
            bindings: Vec::new(),
        }
    }

    fn occurrence(&mut self, var: &Var, slot: usize, mode: BindMode) -> Result<()> {
        if let Some(first) = self.bindings.iter().find(|b| b.var.name == var.name) {
            if first.var.kind != var.kind || first.var.var_type != var.var_type {
                return Err(Error::ConflictingVar {
                    name: var.name.clone(),
                });
            }
            let filter = if first.mode == BindMode::Subtree && mode == BindMode::Subtree {
                Filter::SameSubtree {
                    first: first.slot,
                    later: slot,
                }
            } else {
                Filter::Same {
                    first: first.slot,
                    later: slot,
                }
            };
            self.same.push(filter);
        } else {
            let narrow = match var.kind {
                VarKind::Number => Filter::Exists { path: slot },
                VarKind::Entity | VarKind::Predicate => Filter::In {
                    path: slot,
                    values: self
                        .tax
                        .admissible(var.var_type)
                        .into_iter()
                        .map(SegmentValue::Term)
                        .collect(),
                },
            };
            self.membership.push(narrow);
            self.bindings.push(Binding {
                var: var.clone(),
                slot,
                mode,
            });
        }
        if let Some(condition) = &var.condition {
            self.conditions.push(condition.clone());
        }
        Ok(())
    }

    fn leaf(&mut self, path: &Path, leaf: Leaf<'_>) -> Result<()> {
        let slot = self.program.slot(path);
        match leaf {
            Leaf::Node(node) => {
                if let Some(rv) = node.redundant_var() {
                    self.occurrence(rv, slot, BindMode::Subtree)?;
                }
                match node.verb() {
                    Verb::Term(t) => self.ground.push(Filter::Eq {
                        path: slot,
                        value: SegmentValue::Term(*t),
                    }),
                    Verb::Var(v) => self.occurrence(v, slot, BindMode::Verb)?,
                }
            }
            Leaf::Truth(b) => self.ground.push(Filter::Eq {
                path: slot,
                value: SegmentValue::Bool(b),
            }),
            Leaf::Value(Value::Term(t)) => self.ground.push(Filter::Eq {
                path: slot,
                value: SegmentValue::Term(*t),
            }),
            Leaf::Value(Value::Number(n)) => self.ground.push(Filter::Eq {
                path: slot,
                value: SegmentValue::Int(*n),
            }),
            Leaf::Value(Value::Var(v)) => {
                let mode = match v.kind {
                    VarKind::Entity => BindMode::Term,
                    VarKind::Number => BindMode::Number,
                    VarKind::Predicate => BindMode::Subtree,
                };
                self.occurrence(v, slot, mode)?;
            }
            Leaf::Value(Value::Pred(_)) => {
                return Err(Error::UnresolvedPath {
                    path: path.to_string(),
                })
            }
        }
        Ok(())
    }

    fn finish(mut self) -> Result<CompiledQuery> {
        let mut conditions = Vec::with_capacity(self.conditions.len());
        for expr in &self.conditions {
            let compiled = condition::compile(expr, |name| {
                let binding = self
                    .bindings
                    .iter()
                    .find(|b| b.var.name == name)
                    .ok_or_else(|| Error::UnboundConditionVar(name.to_string()))?;
                if binding.var.kind != VarKind::Number {
                    return Err(Error::NonNumericConditionVar(name.to_string()));
                }
                Ok(binding.slot)
            })?;
            conditions.push(Filter::Condition { expr: compiled });
        }

        let filters = &mut self.program.filters;
        filters.append(&mut self.ground);
        filters.append(&mut self.membership);
        filters.append(&mut self.same);
        filters.append(&mut conditions);
        Ok(CompiledQuery {
            program: self.program,
            bindings: self.bindings,
        })
    }
}

/// Compile `pattern` into a filter program. Pure: nothing is read from a store,
/// and any validation failure aborts the whole compilation.
pub fn compile(tax: &Taxonomy, pattern: &Predicate) -> Result<CompiledQuery> {
    let mut compiler = Compiler::new(tax);
    for path in derive_paths(pattern) {
        let leaf = resolve(pattern, &path).ok_or_else(|| Error::UnresolvedPath {
            path: path.to_string(),
        })?;
        compiler.leaf(&path, leaf)?;
    }
    compiler.finish()
}

// ============================================================================
// Execution
// ============================================================================

/// A matched fact with the value of every pattern variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    fact: Fact,
    bindings: Vec<(String, Value)>,
}

impl Match {
    pub fn fact(&self) -> &Fact {
        &self.fact
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Bindings in first-occurrence order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bindings.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn bindings(&self) -> Bindings {
        self.bindings.iter().cloned().collect()
    }

    /// Substitute this match's bindings back into `pattern`.
    pub fn instantiate(&self, pattern: &Predicate) -> Predicate {
        pattern.substitute(&self.bindings())
    }
}

impl CompiledQuery {
    pub fn execute<B: FactBackend>(&self, store: &FactStore<B>, fact_set: &str) -> Result<Vec<Match>> {
        let ids = store.backend().execute(fact_set, &self.program)?;
        ids.into_iter()
            .filter_map(|id| store.fact(id))
            .map(|fact| self.reconstruct(fact))
            .collect()
    }

    fn reconstruct(&self, fact: &Fact) -> Result<Match> {
        let mut bindings = Vec::with_capacity(self.bindings.len());
        for binding in &self.bindings {
            let path = &self.program.paths[binding.slot];
            let unresolved = || Error::UnresolvedPath {
                path: path.to_string(),
            };
            let value = match binding.mode {
                BindMode::Term | BindMode::Number => match resolve(&fact.predicate, path) {
                    Some(Leaf::Value(v)) if v.is_ground() => v.clone(),
                    _ => return Err(unresolved()),
                },
                BindMode::Verb => match resolve(&fact.predicate, path).and_then(|l| l.verb()) {
                    Some(Verb::Term(t)) => Value::Term(*t),
                    _ => return Err(unresolved()),
                },
                BindMode::Subtree => match fact.predicate.at(path.labels()) {
                    Some(p) => Value::Pred(Box::new(p.copy())),
                    None => return Err(unresolved()),
                },
            };
            bindings.push((binding.var.name.clone(), value));
        }
        Ok(Match {
            fact: fact.clone(),
            bindings,
        })
    }
}

/// Compile `pattern` and run it against `fact_set`.
pub fn query<B: FactBackend>(
    tax: &Taxonomy,
    store: &FactStore<B>,
    fact_set: &str,
    pattern: &Predicate,
) -> Result<Vec<Match>> {
    let compiled = compile(tax, pattern)?;
    debug!(
        fact_set,
        paths = compiled.program.paths.len(),
        filters = compiled.program.filters.len(),
        variables = compiled.bindings.len(),
        "compiled pattern"
    );
    let matches = compiled.execute(store, fact_set)?;
    debug!(fact_set, matches = matches.len(), "query finished");
    Ok(matches)
}
