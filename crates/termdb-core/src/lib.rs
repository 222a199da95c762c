//! termdb: typed fact store with a variable-binding query compiler
//!
//! ```text
//!   pattern ──► derive_paths ──► compile ──► FilterProgram ──► FactBackend
//!                    ▲                                             │
//!   fact ──► derive_paths ──► segments ──────────────────────────► │
//!                                                                  ▼
//!                                           Match { fact, bindings } ◄─┘
//! ```
//!
//! ## Key pieces
//!
//! 1. **Taxonomy**: multiple-inheritance term graph with memoized closures
//! 2. **Predicates**: verb + truth + labeled objects, validated on construction
//! 3. **Paths**: deterministic flattening of a predicate into `(labels, feature)`
//! 4. **Fact store**: one segment per path, bitmap posting lists per value
//! 5. **Query compiler**: equality, membership, self-correlation and condition
//!    filters built from one pattern
//!
//! ## Example
//!
//! ```
//! use termdb_core::Engine;
//!
//! let mut engine = Engine::new();
//! let thing = engine.taxonomy().vocabulary().thing;
//! let person = engine.taxonomy_mut().add_subterm("person", &[thing], &[]).unwrap();
//! engine.taxonomy_mut().add_verb("likes", &[], &[("obj", thing)]).unwrap();
//! engine.taxonomy_mut().add_term("john", person).unwrap();
//! engine.taxonomy_mut().add_term("mary", person).unwrap();
//!
//! engine.tell("(likes john, obj mary)", "world").unwrap();
//! let matches = engine.ask("(likes Person1, obj mary)", "world").unwrap();
//! assert_eq!(matches.len(), 1);
//! ```

pub mod condition;
pub mod error;
pub mod model;
pub mod path;
pub mod query;
pub mod sentence;
pub mod store;
pub mod taxonomy;

use serde::{Deserialize, Serialize};

pub use error::{Error, Result};
pub use model::{Bindings, Fact, FactId, Object, Predicate, PredicateBuilder, Value, Var, VarKind, Verb};
pub use path::{derive_paths, resolve, Feature, Leaf, Path};
pub use query::{compile, query, CompiledQuery, Filter, FilterProgram, Match};
pub use sentence::{compile_sentence, parse_predicate};
pub use store::{FactBackend, FactStore, MemoryBackend, Segment, SegmentValue};
pub use taxonomy::{ObjectType, Taxonomy, Term, TermId, Vocabulary};

// ============================================================================
// Engine
// ============================================================================

/// A taxonomy and the fact store built over it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Engine {
    taxonomy: Taxonomy,
    store: FactStore<MemoryBackend>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parts(taxonomy: Taxonomy, store: FactStore<MemoryBackend>) -> Self {
        Self { taxonomy, store }
    }

    pub fn taxonomy(&self) -> &Taxonomy {
        &self.taxonomy
    }

    pub fn taxonomy_mut(&mut self) -> &mut Taxonomy {
        &mut self.taxonomy
    }

    pub fn store(&self) -> &FactStore<MemoryBackend> {
        &self.store
    }

    pub fn add_fact(&mut self, predicate: &Predicate, fact_set: &str) -> Result<Fact> {
        self.store.add_fact(predicate, fact_set)
    }

    /// Re-insert a fact under its recorded id.
    pub fn restore_fact(&mut self, fact: Fact) -> Result<()> {
        self.store.restore_fact(fact)
    }

    pub fn add_object_to_fact(&mut self, fact: FactId, value: Value, path: &Path) -> Result<Fact> {
        self.store
            .add_object_to_fact(&self.taxonomy, fact, value, path)
    }

    pub fn remove_fact(&mut self, fact: FactId) -> Result<Fact> {
        self.store.remove_fact(fact)
    }

    pub fn remove_matching(&mut self, fact_set: &str, pattern: &Predicate) -> Result<Vec<Fact>> {
        self.store
            .remove_matching(&self.taxonomy, fact_set, pattern)
    }

    pub fn query(&self, fact_set: &str, pattern: &Predicate) -> Result<Vec<Match>> {
        self.store.query(&self.taxonomy, fact_set, pattern)
    }

    /// Parse a sentence against this engine's taxonomy.
    pub fn parse(&self, text: &str) -> Result<Predicate> {
        parse_predicate(&self.taxonomy, text)
    }

    /// Parse and store a ground sentence.
    pub fn tell(&mut self, text: &str, fact_set: &str) -> Result<Fact> {
        let predicate = self.parse(text)?;
        self.add_fact(&predicate, fact_set)
    }

    /// Parse a pattern sentence and query it.
    pub fn ask(&self, text: &str, fact_set: &str) -> Result<Vec<Match>> {
        let pattern = self.parse(text)?;
        self.query(fact_set, &pattern)
    }
}
