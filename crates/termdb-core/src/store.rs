//! Fact store: facts, their segments, and path/value posting lists.
//!
//! Every fact is stored with one segment per derived path. Lookups by
//! `(path, value)` and by `path` go through roaring bitmaps of fact ids;
//! correlation and condition filters read the per-fact segment rows.

use ahash::AHashMap;
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::model::{Fact, FactId, Predicate, Value, Verb};
use crate::path::{derive_paths, resolve, Feature, Leaf, Path};
use crate::query::{self, Filter, FilterProgram, Match};
use crate::taxonomy::{Taxonomy, TermId};

// ============================================================================
// Segments
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentValue {
    Term(TermId),
    Bool(bool),
    Int(i64),
}

/// One `(fact, path, value)` row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub fact: FactId,
    pub path: Path,
    pub value: SegmentValue,
}

/// Segment value of a resolved leaf in a ground predicate.
pub fn segment_value(leaf: Leaf<'_>) -> Option<SegmentValue> {
    match leaf {
        Leaf::Node(p) => match p.verb() {
            Verb::Term(t) => Some(SegmentValue::Term(*t)),
            Verb::Var(_) => None,
        },
        Leaf::Truth(b) => Some(SegmentValue::Bool(b)),
        Leaf::Value(Value::Term(t)) => Some(SegmentValue::Term(*t)),
        Leaf::Value(Value::Number(n)) => Some(SegmentValue::Int(*n)),
        Leaf::Value(Value::Var(_)) | Leaf::Value(Value::Pred(_)) => None,
    }
}

/// All `(path, value)` rows for a ground predicate, in path order. Fails
/// without side effects if any path has no value.
pub fn derive_segments(predicate: &Predicate) -> Result<Vec<(Path, SegmentValue)>> {
    derive_paths(predicate)
        .into_iter()
        .map(|path| {
            let value = resolve(predicate, &path)
                .and_then(segment_value)
                .ok_or_else(|| Error::UnresolvedPath {
                    path: path.to_string(),
                })?;
            Ok((path, value))
        })
        .collect()
}

// ============================================================================
// Backend
// ============================================================================

/// Storage consumed by [`FactStore`].
///
/// Implementations must make `insert` and `remove` atomic: either the fact
/// and all of its segments are written (or deleted), or nothing is.
pub trait FactBackend {
    /// Reserve a fresh fact id.
    fn allocate_id(&mut self) -> FactId;

    /// Insert a fact with its segment rows. Fails if the id is in use.
    fn insert(&mut self, fact: Fact, segments: Vec<(Path, SegmentValue)>) -> Result<()>;

    /// Replace a fact's predicate and add one segment row.
    fn append(&mut self, id: FactId, predicate: Predicate, segment: (Path, SegmentValue)) -> Result<()>;

    /// Delete a fact and every one of its segments.
    fn remove(&mut self, id: FactId) -> Result<Option<Fact>>;

    fn fact(&self, id: FactId) -> Option<&Fact>;

    fn segments(&self, id: FactId) -> Vec<Segment>;

    /// Fact ids in `fact_set`, ascending.
    fn fact_ids(&self, fact_set: &str) -> Vec<FactId>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run a compiled program against one fact set, returning matching ids
    /// in ascending order.
    fn execute(&self, fact_set: &str, program: &FilterProgram) -> Result<Vec<FactId>>;
}

#[derive(Debug, Clone)]
struct StoredFact {
    fact: Fact,
    /// `(interned path, value)` rows.
    rows: Vec<(u32, SegmentValue)>,
}

impl StoredFact {
    fn value_at(&self, path: Option<u32>) -> Option<SegmentValue> {
        let path = path?;
        self.rows.iter().find(|(p, _)| *p == path).map(|(_, v)| *v)
    }
}

/// In-memory backend with roaring-bitmap posting lists.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "BackendRecord", into = "BackendRecord")]
pub struct MemoryBackend {
    next_id: u32,
    paths: Vec<Path>,
    path_ids: AHashMap<Path, u32>,
    facts: AHashMap<u32, StoredFact>,
    by_set: AHashMap<String, RoaringBitmap>,
    by_path: AHashMap<u32, RoaringBitmap>,
    by_path_value: AHashMap<(u32, SegmentValue), RoaringBitmap>,
}

/// Durable form: facts with their rows, in id order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendRecord {
    pub next_id: u32,
    pub facts: Vec<(Fact, Vec<(Path, SegmentValue)>)>,
}

impl From<BackendRecord> for MemoryBackend {
    fn from(record: BackendRecord) -> Self {
        let mut backend = MemoryBackend::default();
        for (fact, segments) in record.facts {
            backend.index(fact, segments);
        }
        backend.next_id = backend.next_id.max(record.next_id);
        backend
    }
}

impl From<MemoryBackend> for BackendRecord {
    fn from(backend: MemoryBackend) -> Self {
        let mut ids: Vec<u32> = backend.facts.keys().copied().collect();
        ids.sort_unstable();
        let facts = ids
            .into_iter()
            .filter_map(|id| backend.facts.get(&id))
            .map(|stored| {
                let rows = stored
                    .rows
                    .iter()
                    .map(|(p, v)| (backend.paths[*p as usize].clone(), *v))
                    .collect();
                (stored.fact.clone(), rows)
            })
            .collect();
        BackendRecord {
            next_id: backend.next_id,
            facts,
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, path: Path) -> u32 {
        if let Some(&id) = self.path_ids.get(&path) {
            return id;
        }
        let id = self.paths.len() as u32;
        self.paths.push(path.clone());
        self.path_ids.insert(path, id);
        id
    }

    fn index(&mut self, fact: Fact, segments: Vec<(Path, SegmentValue)>) {
        let id = fact.id.raw();
        let mut rows = Vec::with_capacity(segments.len());
        for (path, value) in segments {
            let pid = self.intern(path);
            self.index_row(id, pid, value);
            rows.push((pid, value));
        }
        self.by_set
            .entry(fact.fact_set.clone())
            .or_insert_with(RoaringBitmap::new)
            .insert(id);
        self.next_id = self.next_id.max(id + 1);
        self.facts.insert(id, StoredFact { fact, rows });
    }

    fn index_row(&mut self, id: u32, pid: u32, value: SegmentValue) {
        self.by_path
            .entry(pid)
            .or_insert_with(RoaringBitmap::new)
            .insert(id);
        self.by_path_value
            .entry((pid, value))
            .or_insert_with(RoaringBitmap::new)
            .insert(id);
    }

    fn posting(&self, path: Option<u32>, value: &SegmentValue) -> RoaringBitmap {
        path.and_then(|p| self.by_path_value.get(&(p, *value)))
            .cloned()
            .unwrap_or_default()
    }

    fn retain<F>(&self, candidates: &RoaringBitmap, keep: F) -> RoaringBitmap
    where
        F: Fn(&StoredFact) -> bool,
    {
        candidates
            .iter()
            .filter(|id| self.facts.get(id).map(&keep).unwrap_or(false))
            .collect()
    }
}

impl FactBackend for MemoryBackend {
    fn allocate_id(&mut self) -> FactId {
        let id = FactId::new(self.next_id);
        self.next_id += 1;
        id
    }

    fn insert(&mut self, fact: Fact, segments: Vec<(Path, SegmentValue)>) -> Result<()> {
        if self.facts.contains_key(&fact.id.raw()) {
            return Err(Error::FactExists(fact.id));
        }
        self.index(fact, segments);
        Ok(())
    }

    fn append(&mut self, id: FactId, predicate: Predicate, segment: (Path, SegmentValue)) -> Result<()> {
        if !self.facts.contains_key(&id.raw()) {
            return Err(Error::UnknownFact(id));
        }
        let (path, value) = segment;
        let pid = self.intern(path);
        self.index_row(id.raw(), pid, value);
        if let Some(stored) = self.facts.get_mut(&id.raw()) {
            stored.fact.predicate = predicate;
            stored.rows.push((pid, value));
        }
        Ok(())
    }

    fn remove(&mut self, id: FactId) -> Result<Option<Fact>> {
        let Some(stored) = self.facts.remove(&id.raw()) else {
            return Ok(None);
        };
        let raw = id.raw();
        for (pid, value) in &stored.rows {
            if let Some(bm) = self.by_path.get_mut(pid) {
                bm.remove(raw);
            }
            if let Some(bm) = self.by_path_value.get_mut(&(*pid, *value)) {
                bm.remove(raw);
                if bm.is_empty() {
                    self.by_path_value.remove(&(*pid, *value));
                }
            }
        }
        if let Some(bm) = self.by_set.get_mut(&stored.fact.fact_set) {
            bm.remove(raw);
        }
        Ok(Some(stored.fact))
    }

    fn fact(&self, id: FactId) -> Option<&Fact> {
        self.facts.get(&id.raw()).map(|s| &s.fact)
    }

    fn segments(&self, id: FactId) -> Vec<Segment> {
        let Some(stored) = self.facts.get(&id.raw()) else {
            return Vec::new();
        };
        stored
            .rows
            .iter()
            .map(|(p, v)| Segment {
                fact: id,
                path: self.paths[*p as usize].clone(),
                value: *v,
            })
            .collect()
    }

    fn fact_ids(&self, fact_set: &str) -> Vec<FactId> {
        self.by_set
            .get(fact_set)
            .map(|bm| bm.iter().map(FactId::new).collect())
            .unwrap_or_default()
    }

    fn len(&self) -> usize {
        self.facts.len()
    }

    fn execute(&self, fact_set: &str, program: &FilterProgram) -> Result<Vec<FactId>> {
        let Some(set) = self.by_set.get(fact_set) else {
            return Ok(Vec::new());
        };
        let pids: Vec<Option<u32>> = program
            .paths
            .iter()
            .map(|p| self.path_ids.get(p).copied())
            .collect();

        let mut candidates = set.clone();
        for filter in &program.filters {
            if candidates.is_empty() {
                break;
            }
            match filter {
                Filter::Eq { path, value } => {
                    candidates &= self.posting(pids[*path], value);
                }
                Filter::In { path, values } => {
                    let mut admissible = RoaringBitmap::new();
                    for value in values {
                        admissible |= self.posting(pids[*path], value);
                    }
                    candidates &= admissible;
                }
                Filter::Exists { path } => {
                    let present = pids[*path]
                        .and_then(|p| self.by_path.get(&p))
                        .cloned()
                        .unwrap_or_default();
                    candidates &= present;
                }
                Filter::Same { first, later } => {
                    candidates = self.retain(&candidates, |stored| {
                        let a = stored.value_at(pids[*first]);
                        a.is_some() && a == stored.value_at(pids[*later])
                    });
                }
                Filter::SameSubtree { first, later } => {
                    let (a, b) = (&program.paths[*first], &program.paths[*later]);
                    candidates = self.retain(&candidates, |stored| {
                        let p = &stored.fact.predicate;
                        match (p.at(a.labels()), p.at(b.labels())) {
                            (Some(x), Some(y)) => x == y,
                            _ => false,
                        }
                    });
                }
                Filter::Condition { expr } => {
                    candidates = self.retain(&candidates, |stored| {
                        expr.holds(&|slot| match stored.value_at(pids[slot]) {
                            Some(SegmentValue::Int(n)) => Some(n),
                            _ => None,
                        })
                    });
                }
            }
        }
        Ok(candidates.iter().map(FactId::new).collect())
    }
}

// ============================================================================
// Fact store
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FactStore<B = MemoryBackend> {
    backend: B,
}

impl FactStore<MemoryBackend> {
    pub fn new() -> Self {
        Self::with_backend(MemoryBackend::new())
    }
}

impl<B: FactBackend> FactStore<B> {
    pub fn with_backend(backend: B) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn fact(&self, id: FactId) -> Option<&Fact> {
        self.backend.fact(id)
    }

    pub fn facts(&self, fact_set: &str) -> Vec<&Fact> {
        self.backend
            .fact_ids(fact_set)
            .into_iter()
            .filter_map(|id| self.backend.fact(id))
            .collect()
    }

    pub fn segments(&self, id: FactId) -> Vec<Segment> {
        self.backend.segments(id)
    }

    pub fn len(&self) -> usize {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    /// Store a ground predicate. An identical fact already in `fact_set` is
    /// returned instead of inserting a duplicate.
    pub fn add_fact(&mut self, predicate: &Predicate, fact_set: &str) -> Result<Fact> {
        if let Some(v) = predicate.variables().first() {
            return Err(Error::NotGround(v.name.clone()));
        }
        let segments = derive_segments(predicate)?;
        if let Some(existing) = self.find_identical(predicate, fact_set, &segments)? {
            debug!(fact = %existing.id, fact_set, "fact already present");
            return Ok(existing);
        }
        let fact = Fact {
            id: self.backend.allocate_id(),
            fact_set: fact_set.to_string(),
            predicate: predicate.copy(),
        };
        debug!(fact = %fact.id, fact_set, segments = segments.len(), "inserting fact");
        self.backend.insert(fact.clone(), segments)?;
        Ok(fact)
    }

    /// Re-insert a fact under its existing id (log replay and rollback).
    pub fn restore_fact(&mut self, fact: Fact) -> Result<()> {
        if let Some(v) = fact.predicate.variables().first() {
            return Err(Error::NotGround(v.name.clone()));
        }
        let segments = derive_segments(&fact.predicate)?;
        self.backend.insert(fact, segments)
    }

    fn find_identical(
        &self,
        predicate: &Predicate,
        fact_set: &str,
        segments: &[(Path, SegmentValue)],
    ) -> Result<Option<Fact>> {
        let program = FilterProgram::ground(segments);
        for id in self.backend.execute(fact_set, &program)? {
            if let Some(fact) = self.backend.fact(id) {
                if fact.predicate == *predicate {
                    return Ok(Some(fact.clone()));
                }
            }
        }
        Ok(None)
    }

    /// Add one leaf object to a stored fact at `path` (the new object's full
    /// path, e.g. `obj.when._num`) without re-deriving its other segments.
    pub fn add_object_to_fact(
        &mut self,
        tax: &Taxonomy,
        fact: FactId,
        value: Value,
        path: &Path,
    ) -> Result<Fact> {
        let stored = self.backend.fact(fact).ok_or(Error::UnknownFact(fact))?;
        let segment = match (&value, path.feature()) {
            (Value::Term(t), Feature::Term) => SegmentValue::Term(*t),
            (Value::Number(n), Feature::Num) => SegmentValue::Int(*n),
            _ => {
                return Err(Error::UnresolvedPath {
                    path: path.to_string(),
                })
            }
        };
        let Some((label, parents)) = path.labels().split_last() else {
            return Err(Error::UnresolvedPath {
                path: path.to_string(),
            });
        };

        let mut predicate = stored.predicate.copy();
        let node = predicate
            .at_mut(parents)
            .ok_or_else(|| Error::UnresolvedPath {
                path: path.to_string(),
            })?;
        node.push_object(tax, label, value)?;

        self.backend
            .append(fact, predicate, (path.clone(), segment))?;
        debug!(%fact, %path, "appended object");
        self.backend.fact(fact).cloned().ok_or(Error::UnknownFact(fact))
    }

    /// Delete a fact and all of its segments.
    pub fn remove_fact(&mut self, fact: FactId) -> Result<Fact> {
        let removed = self.backend.remove(fact)?.ok_or(Error::UnknownFact(fact))?;
        debug!(%fact, "removed fact");
        Ok(removed)
    }

    /// Delete every fact in `fact_set` matching `pattern`.
    pub fn remove_matching(
        &mut self,
        tax: &Taxonomy,
        fact_set: &str,
        pattern: &Predicate,
    ) -> Result<Vec<Fact>> {
        let ids: Vec<FactId> = self
            .query(tax, fact_set, pattern)?
            .iter()
            .map(|m| m.fact().id)
            .collect();
        let mut removed = Vec::with_capacity(ids.len());
        for id in ids {
            removed.push(self.remove_fact(id)?);
        }
        Ok(removed)
    }

    pub fn query(&self, tax: &Taxonomy, fact_set: &str, pattern: &Predicate) -> Result<Vec<Match>> {
        query::query(tax, self, fact_set, pattern)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Taxonomy, TermId, TermId, TermId) {
        let mut tax = Taxonomy::new();
        let thing = tax.vocabulary().thing;
        let number = tax.vocabulary().number;
        let person = tax.add_subterm("person", &[thing], &[]).unwrap();
        let likes = tax
            .add_verb("likes", &[], &[("obj", thing), ("since", number)])
            .unwrap();
        let john = tax.add_term("john", person).unwrap();
        let mary = tax.add_term("mary", person).unwrap();
        (tax, likes, john, mary)
    }

    #[test]
    fn segments_match_derived_paths() {
        let (tax, likes, john, mary) = setup();
        let p = Predicate::builder(&tax, likes)
            .object("subj", john)
            .object("obj", mary)
            .build()
            .unwrap();
        let mut store = FactStore::new();
        let fact = store.add_fact(&p, "world").unwrap();
        let paths: Vec<Path> = store.segments(fact.id).into_iter().map(|s| s.path).collect();
        assert_eq!(paths, derive_paths(&p));
    }

    #[test]
    fn identical_facts_are_not_duplicated() {
        let (tax, likes, john, mary) = setup();
        let p = Predicate::builder(&tax, likes)
            .object("subj", john)
            .object("obj", mary)
            .build()
            .unwrap();
        let mut store = FactStore::new();
        let a = store.add_fact(&p, "world").unwrap();
        let b = store.add_fact(&p, "world").unwrap();
        let c = store.add_fact(&p, "other").unwrap();
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_cascades_to_segments() {
        let (tax, likes, john, mary) = setup();
        let p = Predicate::builder(&tax, likes)
            .object("subj", john)
            .object("obj", mary)
            .build()
            .unwrap();
        let mut store = FactStore::new();
        let fact = store.add_fact(&p, "world").unwrap();
        store.remove_fact(fact.id).unwrap();
        assert!(store.segments(fact.id).is_empty());
        assert!(store.facts("world").is_empty());
        assert!(store.backend().by_path_value.is_empty());
        assert!(matches!(
            store.remove_fact(fact.id),
            Err(Error::UnknownFact(_))
        ));
    }

    #[test]
    fn appended_object_is_indexed() {
        let (tax, likes, john, mary) = setup();
        let p = Predicate::builder(&tax, likes)
            .object("subj", john)
            .object("obj", mary)
            .build()
            .unwrap();
        let mut store = FactStore::new();
        let fact = store.add_fact(&p, "world").unwrap();
        let since = Path::new(["since"], Feature::Num);
        let updated = store
            .add_object_to_fact(&tax, fact.id, Value::Number(2020), &since)
            .unwrap();
        assert_eq!(updated.predicate.get("since"), Some(&Value::Number(2020)));
        assert_eq!(store.segments(fact.id).len(), derive_paths(&p).len() + 1);

        let err = store
            .add_object_to_fact(&tax, fact.id, Value::Number(2021), &since)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateLabel { .. }));
    }

    #[test]
    fn record_round_trip_rebuilds_indexes() {
        let (tax, likes, john, mary) = setup();
        let p = Predicate::builder(&tax, likes)
            .object("subj", john)
            .object("obj", mary)
            .build()
            .unwrap();
        let mut store = FactStore::new();
        store.add_fact(&p, "world").unwrap();
        let record = BackendRecord::from(store.backend().clone());
        let rebuilt = FactStore::with_backend(MemoryBackend::from(record));
        let again = rebuilt.query(&tax, "world", &p).unwrap();
        assert_eq!(again.len(), 1);
    }
}
