//! Taxonomy: the term graph and its memoized closures.
//!
//! Terms form a directed multigraph over two edge kinds:
//! - `bases`: ordered multiple inheritance (`Dog < Animal`, `Dog < Pet`)
//! - `equals`: equivalence partners, always recorded symmetrically
//!
//! `get_bases` / `get_subterms` are depth-first closures over both edge kinds
//! (bases before equals at each node, first-discovered order). They are
//! memoized per `TermId` in maps owned by the taxonomy and purged by explicit
//! edge walking whenever an edge changes.
//!
//! Cycles are not rejected. All members of a cycle are mutually equivalent:
//! each appears in every other member's bases and subterms. A term never
//! appears in its own closure.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Var, VarKind};

// ============================================================================
// Terms
// ============================================================================

/// Stable handle for a term. Closure caches and stored segments key on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct TermId(u32);

impl TermId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for TermId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A slot a predicate of some verb may carry: `label` holds a `obj_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectType {
    pub label: String,
    pub obj_type: TermId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Term {
    pub id: TermId,
    pub name: String,
    /// The type this term is an instance of (`rex -> Dog`, `likes -> verb`).
    pub term_type: Option<TermId>,
    /// Individuals are leaves: they cannot be used as a type.
    pub individual: bool,
    /// Numeric types (`number` and everything under it).
    pub number: bool,
    bases: Vec<TermId>,
    equals: Vec<TermId>,
    object_types: Vec<ObjectType>,
}

impl Term {
    pub fn bases(&self) -> &[TermId] {
        &self.bases
    }

    pub fn equals(&self) -> &[TermId] {
        &self.equals
    }

    /// Object types declared on this term itself (not inherited).
    pub fn declared_object_types(&self) -> &[ObjectType] {
        &self.object_types
    }
}

/// Ids of the terms every taxonomy starts with.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Vocabulary {
    pub word: TermId,
    pub verb: TermId,
    pub noun: TermId,
    pub number: TermId,
    pub thing: TermId,
    pub exist: TermId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Towards bases (and equivalence partners).
    Up,
    /// Towards subterms (and equivalence partners).
    Down,
}

// ============================================================================
// Taxonomy
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "TaxonomyRecord", into = "TaxonomyRecord")]
pub struct Taxonomy {
    terms: Vec<Term>,
    by_name: AHashMap<String, TermId>,
    /// Reverse edges: `x -> terms that list x as a base or equivalence partner`.
    derived: AHashMap<TermId, Vec<TermId>>,
    /// `term_type -> terms of that type`, in declaration order.
    by_type: AHashMap<TermId, Vec<TermId>>,
    vocabulary: Vocabulary,
    sup_cache: DashMap<TermId, Arc<[TermId]>>,
    sub_cache: DashMap<TermId, Arc<[TermId]>>,
}

/// Durable form of a taxonomy: the terms in declaration order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyRecord {
    pub terms: Vec<Term>,
    pub vocabulary: Vocabulary,
}

impl From<TaxonomyRecord> for Taxonomy {
    fn from(record: TaxonomyRecord) -> Self {
        let mut tax = Taxonomy {
            terms: Vec::with_capacity(record.terms.len()),
            by_name: AHashMap::new(),
            derived: AHashMap::new(),
            by_type: AHashMap::new(),
            vocabulary: record.vocabulary,
            sup_cache: DashMap::new(),
            sub_cache: DashMap::new(),
        };
        for term in record.terms {
            tax.index_term(&term);
            tax.terms.push(term);
        }
        tax
    }
}

impl From<Taxonomy> for TaxonomyRecord {
    fn from(tax: Taxonomy) -> Self {
        TaxonomyRecord {
            terms: tax.terms,
            vocabulary: tax.vocabulary,
        }
    }
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::new()
    }
}

impl Taxonomy {
    /// A taxonomy holding only the bootstrap vocabulary:
    /// `word`; `verb`, `noun`, `number` under `word`; `thing` under `noun`;
    /// and the root verb `exist` with `subj: thing`.
    pub fn new() -> Self {
        let placeholder = TermId(0);
        let mut tax = Taxonomy {
            terms: Vec::new(),
            by_name: AHashMap::new(),
            derived: AHashMap::new(),
            by_type: AHashMap::new(),
            vocabulary: Vocabulary {
                word: placeholder,
                verb: placeholder,
                noun: placeholder,
                number: placeholder,
                thing: placeholder,
                exist: placeholder,
            },
            sup_cache: DashMap::new(),
            sub_cache: DashMap::new(),
        };

        let word = tax.push_term("word", None, vec![], false, false, vec![]);
        let verb = tax.push_term("verb", Some(word), vec![word], false, false, vec![]);
        let noun = tax.push_term("noun", Some(word), vec![word], false, false, vec![]);
        let number = tax.push_term("number", Some(word), vec![word], false, true, vec![]);
        let thing = tax.push_term("thing", Some(noun), vec![noun], false, false, vec![]);
        let exist = tax.push_term(
            "exist",
            Some(verb),
            vec![],
            false,
            false,
            vec![ObjectType {
                label: "subj".to_string(),
                obj_type: thing,
            }],
        );

        tax.vocabulary = Vocabulary {
            word,
            verb,
            noun,
            number,
            thing,
            exist,
        };
        tax
    }

    fn push_term(
        &mut self,
        name: &str,
        term_type: Option<TermId>,
        bases: Vec<TermId>,
        individual: bool,
        number: bool,
        object_types: Vec<ObjectType>,
    ) -> TermId {
        let id = TermId(self.terms.len() as u32);
        let term = Term {
            id,
            name: name.to_string(),
            term_type,
            individual,
            number,
            bases,
            equals: Vec::new(),
            object_types,
        };
        self.index_term(&term);
        self.terms.push(term);
        id
    }

    fn index_term(&mut self, term: &Term) {
        self.by_name.insert(term.name.clone(), term.id);
        if let Some(tt) = term.term_type {
            self.by_type.entry(tt).or_default().push(term.id);
        }
        for &partner in term.bases.iter().chain(term.equals.iter()) {
            self.derived.entry(partner).or_default().push(term.id);
        }
    }

    pub fn vocabulary(&self) -> Vocabulary {
        self.vocabulary
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn term(&self, id: TermId) -> Option<&Term> {
        self.terms.get(id.0 as usize)
    }

    fn require(&self, id: TermId) -> Result<&Term> {
        self.term(id)
            .ok_or_else(|| Error::UnknownTerm(id.to_string()))
    }

    /// Display name for a term id (never fails; unknown ids render as `#n`).
    pub fn name(&self, id: TermId) -> String {
        match self.term(id) {
            Some(t) => t.name.clone(),
            None => id.to_string(),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<TermId> {
        self.by_name.get(name).copied()
    }

    pub fn get_term(&self, name: &str) -> Result<TermId> {
        self.lookup(name)
            .ok_or_else(|| Error::UnknownTerm(name.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Term> {
        self.terms.iter()
    }

    // ========================================================================
    // Definitions
    // ========================================================================

    /// Define an individual: `rex is a Dog`.
    pub fn add_term(&mut self, name: &str, term_type: TermId) -> Result<TermId> {
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateTerm(name.to_string()));
        }
        let ty = self.require(term_type)?;
        if ty.individual {
            return Err(Error::NotA {
                name: ty.name.clone(),
                expected: "type".to_string(),
            });
        }
        let number = ty.number;
        Ok(self.push_term(name, Some(term_type), vec![], true, number, vec![]))
    }

    /// Define a type or verb under one or more bases: `a Dog is a Animal`,
    /// `to like is to exist, obj a thing`.
    ///
    /// The new term takes its `term_type` from the first base and is numeric
    /// if any base is.
    pub fn add_subterm(
        &mut self,
        name: &str,
        bases: &[TermId],
        object_types: &[(&str, TermId)],
    ) -> Result<TermId> {
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateTerm(name.to_string()));
        }
        let Some(&first) = bases.first() else {
            return Err(Error::NotA {
                name: name.to_string(),
                expected: "subterm of at least one base".to_string(),
            });
        };
        let mut number = false;
        for &base in bases {
            let b = self.require(base)?;
            if b.individual {
                return Err(Error::NotA {
                    name: b.name.clone(),
                    expected: "type".to_string(),
                });
            }
            number |= b.number;
        }
        for &(_, obj_type) in object_types {
            self.require(obj_type)?;
        }
        let term_type = self.require(first)?.term_type;

        for &base in bases {
            self.purge_cache(base);
        }
        let object_types = object_types
            .iter()
            .map(|&(label, obj_type)| ObjectType {
                label: label.to_string(),
                obj_type,
            })
            .collect();
        Ok(self.push_term(name, term_type, bases.to_vec(), false, number, object_types))
    }

    /// Define a verb under `bases` (defaults to `exist`).
    pub fn add_verb(
        &mut self,
        name: &str,
        bases: &[TermId],
        object_types: &[(&str, TermId)],
    ) -> Result<TermId> {
        let exist = [self.vocabulary.exist];
        let bases = if bases.is_empty() { &exist[..] } else { bases };
        for &base in bases {
            if !self.is_verb(base) {
                return Err(Error::NotA {
                    name: self.name(base),
                    expected: "verb".to_string(),
                });
            }
        }
        self.add_subterm(name, bases, object_types)
    }

    /// Build a pattern variable with a declared type.
    pub fn make_var(&self, name: &str, var_type: TermId) -> Result<Var> {
        let ty = self.require(var_type)?;
        if ty.individual {
            return Err(Error::NotA {
                name: ty.name.clone(),
                expected: "type".to_string(),
            });
        }
        let kind = if self.is_verb_type(var_type) {
            VarKind::Predicate
        } else if ty.number {
            VarKind::Number
        } else {
            VarKind::Entity
        };
        Ok(Var::new(name, var_type, kind))
    }

    // ========================================================================
    // Edge mutation
    // ========================================================================

    pub fn add_base(&mut self, term: TermId, base: TermId) -> Result<()> {
        self.require(term)?;
        self.require(base)?;
        if self.terms[term.0 as usize].bases.contains(&base) {
            return Ok(());
        }
        self.purge_cache(term);
        self.purge_cache(base);
        self.terms[term.0 as usize].bases.push(base);
        self.derived.entry(base).or_default().push(term);
        Ok(())
    }

    /// Returns whether the edge existed.
    pub fn remove_base(&mut self, term: TermId, base: TermId) -> Result<bool> {
        self.require(term)?;
        self.require(base)?;
        if !self.terms[term.0 as usize].bases.contains(&base) {
            return Ok(false);
        }
        self.purge_cache(term);
        self.purge_cache(base);
        self.terms[term.0 as usize].bases.retain(|&b| b != base);
        self.unlink(base, term);
        Ok(true)
    }

    pub fn add_equivalence(&mut self, a: TermId, b: TermId) -> Result<()> {
        self.require(a)?;
        self.require(b)?;
        if a == b || self.terms[a.0 as usize].equals.contains(&b) {
            return Ok(());
        }
        self.purge_cache(a);
        self.purge_cache(b);
        self.terms[a.0 as usize].equals.push(b);
        self.terms[b.0 as usize].equals.push(a);
        self.derived.entry(b).or_default().push(a);
        self.derived.entry(a).or_default().push(b);
        Ok(())
    }

    /// Returns whether the equivalence existed.
    pub fn remove_equivalence(&mut self, a: TermId, b: TermId) -> Result<bool> {
        self.require(a)?;
        self.require(b)?;
        if !self.terms[a.0 as usize].equals.contains(&b) {
            return Ok(false);
        }
        self.purge_cache(a);
        self.purge_cache(b);
        self.terms[a.0 as usize].equals.retain(|&x| x != b);
        self.terms[b.0 as usize].equals.retain(|&x| x != a);
        self.unlink(b, a);
        self.unlink(a, b);
        Ok(true)
    }

    /// Undo the most recent definition. Only the last term can be retracted,
    /// and only while nothing refers to it.
    pub fn retract_last(&mut self, id: TermId) -> Result<()> {
        let last = TermId(self.terms.len().saturating_sub(1) as u32);
        if self.terms.is_empty() || id != last || id.0 as usize <= self.vocabulary.exist.0 as usize {
            return Err(Error::NotA {
                name: self.name(id),
                expected: "most recent definition".to_string(),
            });
        }
        let referenced = self.derived.get(&id).map(|d| !d.is_empty()).unwrap_or(false)
            || self.by_type.get(&id).map(|d| !d.is_empty()).unwrap_or(false);
        if referenced {
            return Err(Error::NotA {
                name: self.name(id),
                expected: "unreferenced term".to_string(),
            });
        }

        self.purge_cache(id);
        let Some(term) = self.terms.pop() else {
            return Ok(());
        };
        for &partner in term.bases.iter().chain(term.equals.iter()) {
            if let Some(list) = self.derived.get_mut(&partner) {
                if let Some(pos) = list.iter().rposition(|&t| t == id) {
                    list.remove(pos);
                }
            }
        }
        if let Some(tt) = term.term_type {
            if let Some(list) = self.by_type.get_mut(&tt) {
                if let Some(pos) = list.iter().rposition(|&t| t == id) {
                    list.remove(pos);
                }
            }
        }
        self.by_name.remove(&term.name);
        self.derived.remove(&id);
        self.by_type.remove(&id);
        self.sup_cache.remove(&id);
        self.sub_cache.remove(&id);
        debug!(term = %term.name, "retracted definition");
        Ok(())
    }

    /// Remove one `target <- source` reverse edge.
    fn unlink(&mut self, target: TermId, source: TermId) {
        if let Some(list) = self.derived.get_mut(&target) {
            if let Some(pos) = list.iter().position(|&t| t == source) {
                list.remove(pos);
            }
        }
    }

    /// Invalidate `sup_cache` of `term` and all its transitive subterms, and
    /// `sub_cache` of `term` and all its transitive bases.
    ///
    /// Walks raw edges, never the caches being purged.
    pub fn purge_cache(&self, term: TermId) {
        let subs = self.walk(term, Direction::Down);
        let sups = self.walk(term, Direction::Up);
        self.sup_cache.remove(&term);
        for sub in &subs {
            self.sup_cache.remove(sub);
        }
        self.sub_cache.remove(&term);
        for sup in &sups {
            self.sub_cache.remove(sup);
        }
        debug!(
            term = %self.name(term),
            subterms = subs.len(),
            bases = sups.len(),
            "purged closure caches"
        );
    }

    // ========================================================================
    // Closures
    // ========================================================================

    fn neighbours(&self, id: TermId, dir: Direction) -> Vec<TermId> {
        match dir {
            Direction::Up => match self.term(id) {
                Some(t) => t.bases.iter().chain(t.equals.iter()).copied().collect(),
                None => Vec::new(),
            },
            Direction::Down => self.derived.get(&id).cloned().unwrap_or_default(),
        }
    }

    fn walk(&self, start: TermId, dir: Direction) -> Vec<TermId> {
        let mut visited: AHashSet<TermId> = AHashSet::new();
        visited.insert(start);
        let mut out = Vec::new();
        self.walk_from(start, dir, &mut visited, &mut out);
        out
    }

    fn walk_from(
        &self,
        id: TermId,
        dir: Direction,
        visited: &mut AHashSet<TermId>,
        out: &mut Vec<TermId>,
    ) {
        for next in self.neighbours(id, dir) {
            if visited.insert(next) {
                out.push(next);
                self.walk_from(next, dir, visited, out);
            }
        }
    }

    /// Transitive bases of `term` (through bases and equivalences).
    pub fn get_bases(&self, term: TermId) -> Arc<[TermId]> {
        if let Some(hit) = self.sup_cache.get(&term) {
            return Arc::clone(hit.value());
        }
        let closure: Arc<[TermId]> = self.walk(term, Direction::Up).into();
        self.sup_cache.insert(term, Arc::clone(&closure));
        closure
    }

    /// Transitive subterms of `term`: everything whose bases reach `term`.
    pub fn get_subterms(&self, term: TermId) -> Arc<[TermId]> {
        if let Some(hit) = self.sub_cache.get(&term) {
            return Arc::clone(hit.value());
        }
        let closure: Arc<[TermId]> = self.walk(term, Direction::Down).into();
        self.sub_cache.insert(term, Arc::clone(&closure));
        closure
    }

    /// `t1 == t2`, or `t1` transitively bases into `t2`.
    pub fn are(&self, t1: TermId, t2: TermId) -> bool {
        t1 == t2 || self.get_bases(t1).contains(&t2)
    }

    /// The instance's own type equals or transitively specializes `ty`.
    pub fn isa(&self, instance: TermId, ty: TermId) -> bool {
        match self.term(instance).and_then(|t| t.term_type) {
            Some(tt) => self.are(tt, ty),
            None => false,
        }
    }

    pub fn is_verb(&self, term: TermId) -> bool {
        self.isa(term, self.vocabulary.verb)
    }

    /// A type whose instances are verbs: `verb` itself or any verb.
    pub fn is_verb_type(&self, term: TermId) -> bool {
        term == self.vocabulary.verb || self.is_verb(term)
    }

    pub fn is_numeric(&self, term: TermId) -> bool {
        self.term(term).map(|t| t.number).unwrap_or(false)
    }

    // ========================================================================
    // Object types and admissible sets
    // ========================================================================

    /// Object types of `verb`: its own declarations, then those inherited in
    /// `get_bases` order. The first declaration of a label wins.
    pub fn object_types(&self, verb: TermId) -> Vec<ObjectType> {
        let mut out: Vec<ObjectType> = Vec::new();
        let mut seen: AHashSet<&str> = AHashSet::new();
        let own = self.term(verb).into_iter();
        let bases = self.get_bases(verb);
        let inherited = bases.iter().filter_map(|&b| self.term(b));
        for term in own.chain(inherited) {
            for ot in &term.object_types {
                if seen.insert(ot.label.as_str()) {
                    out.push(ot.clone());
                }
            }
        }
        out
    }

    pub fn object_type(&self, verb: TermId, label: &str) -> Option<TermId> {
        self.object_types(verb)
            .into_iter()
            .find(|ot| ot.label == label)
            .map(|ot| ot.obj_type)
    }

    /// Terms whose own type is one of `types`.
    pub fn instances_of(&self, types: &[TermId]) -> Vec<TermId> {
        let mut out = Vec::new();
        for ty in types {
            if let Some(list) = self.by_type.get(ty) {
                out.extend(list.iter().copied());
            }
        }
        out
    }

    /// `ty` followed by all of its subterms.
    pub fn admissible_types(&self, ty: TermId) -> Vec<TermId> {
        let mut out = vec![ty];
        out.extend(self.get_subterms(ty).iter().copied());
        out
    }

    /// Concrete values a variable of type `ty` can take: every term an
    /// object slot of type `ty` accepts.
    ///
    /// For entity types these are the admissible types themselves plus every
    /// term whose own type is admissible. For verb types they are the verbs
    /// themselves (`verb` admits every verb).
    pub fn admissible(&self, ty: TermId) -> Vec<TermId> {
        if ty == self.vocabulary.verb {
            return self.instances_of(&[ty]);
        }
        let types = self.admissible_types(ty);
        if self.is_verb(ty) {
            return types;
        }
        let mut seen: AHashSet<TermId> = types.iter().copied().collect();
        let mut out = types.clone();
        for t in self.instances_of(&types) {
            if seen.insert(t) {
                out.push(t);
            }
        }
        out
    }
}
