//! Integration tests for the complete termdb pipeline
//!
//! These tests verify end-to-end functionality across crates:
//! - DSL parsing → sentence compilation → predicates
//! - Engine → fact store → query compiler → matches
//! - Durable engine → log + snapshot → reopen
//!
//! Run with: cargo test --test integration_tests

use anyhow::Result;
use tempfile::tempdir;
use termdb_core::{Engine, Error, Value};
use termdb_storage::{DurableEngine, StorageConfig};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// A small zoo: animals, people, food, and a few verbs over them.
fn zoo(engine: &mut Engine) -> Result<()> {
    let v = engine.taxonomy().vocabulary();
    let tax = engine.taxonomy_mut();
    let animal = tax.add_subterm("Animal", &[v.thing], &[])?;
    let dog = tax.add_subterm("Dog", &[animal], &[])?;
    let person = tax.add_subterm("person", &[v.thing], &[])?;
    let food = tax.add_subterm("food", &[v.thing], &[])?;
    let years = tax.add_subterm("years", &[v.number], &[])?;

    let feeds = tax.add_verb("feeds", &[], &[("animal", animal), ("what", food)])?;
    tax.add_verb("likes", &[], &[("obj", v.thing)])?;
    tax.add_verb("aged", &[], &[("age", years)])?;
    tax.add_verb("says", &[], &[("what", v.exist)])?;
    tax.add_verb("overfeeds", &[feeds], &[])?;

    tax.add_term("rex", dog)?;
    tax.add_term("john", person)?;
    tax.add_term("mary", person)?;
    tax.add_term("kibble", food)?;
    Ok(())
}

// ============================================================================
// DSL → Engine
// ============================================================================

#[test]
fn test_parse_tell_ask_round_trip() -> Result<()> {
    init_tracing();
    let mut engine = Engine::new();
    zoo(&mut engine)?;

    let sentence = termdb_dsl::parse_sentence("(feeds john, animal rex, what kibble).")?;
    assert_eq!(sentence.modifiers.len(), 2);

    let fact = engine.tell("(feeds john, animal rex, what kibble)", "zoo")?;
    let matches = engine.ask("(feeds Person1, animal Animal1, what Food1)?", "zoo")?;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].fact(), &fact);

    let rex = engine.taxonomy().get_term("rex")?;
    assert_eq!(matches[0].get("Animal1"), Some(&Value::Term(rex)));
    Ok(())
}

#[test]
fn test_subverbs_match_their_bases() -> Result<()> {
    let mut engine = Engine::new();
    zoo(&mut engine)?;
    engine.tell("(overfeeds mary, animal rex, what kibble)", "zoo")?;

    // A verb variable ranges over the verb and its subverbs.
    let matches = engine.ask("(Feeds1 Person1, animal rex)", "zoo")?;
    assert_eq!(matches.len(), 1);
    let overfeeds = engine.taxonomy().get_term("overfeeds")?;
    assert_eq!(matches[0].get("Feeds1"), Some(&Value::Term(overfeeds)));

    // A fixed verb only matches itself.
    assert!(engine.ask("(feeds Person1, animal rex)", "zoo")?.is_empty());
    Ok(())
}

#[test]
fn test_conditions_across_variables() -> Result<()> {
    let mut engine = Engine::new();
    zoo(&mut engine)?;
    engine.tell("(aged john, age 34)", "zoo")?;
    engine.tell("(aged mary, age 17)", "zoo")?;
    engine.tell("(aged rex, age 5)", "zoo")?;

    let adults = engine.ask("(aged Person1, age {Years1: Years1 >= 18})", "zoo")?;
    assert_eq!(adults.len(), 1);
    assert_eq!(adults[0].get("Years1"), Some(&Value::Number(34)));

    let odd = engine.ask("(aged Thing1, age {Years1: Years1 % 2 = 1})", "zoo")?;
    assert_eq!(odd.len(), 2);
    Ok(())
}

#[test]
fn test_nested_facts_and_whole_sentence_binding() -> Result<()> {
    let mut engine = Engine::new();
    zoo(&mut engine)?;
    let said = engine.tell("(says mary, what (likes john, obj rex))", "zoo")?;
    engine.tell("(says john, what (aged rex, age 5))", "zoo")?;

    let matches = engine.ask("Says1:(says Person1, what (likes Person2, obj Animal1))", "zoo")?;
    assert_eq!(matches.len(), 1);
    assert_eq!(
        matches[0].get("Says1"),
        Some(&Value::Pred(Box::new(said.predicate.clone())))
    );

    let pattern = engine.parse("(says Person1, what Exist1)")?;
    let all = engine.query("zoo", &pattern)?;
    assert_eq!(all.len(), 2);
    for m in &all {
        assert_eq!(m.instantiate(&pattern), m.fact().predicate);
    }
    Ok(())
}

#[test]
fn test_errors_surface_with_context() -> Result<()> {
    let mut engine = Engine::new();
    zoo(&mut engine)?;

    assert!(matches!(
        engine.tell("(feeds john, animal kibble)", "zoo"),
        Err(Error::WrongObjectType { .. })
    ));
    assert!(matches!(
        engine.tell("(feeds Person1, animal rex)", "zoo"),
        Err(Error::NotGround(_))
    ));
    assert!(matches!(
        engine.ask("(feeds john, colour rex)", "zoo"),
        Err(Error::UndeclaredLabel { .. })
    ));
    assert!(matches!(
        engine.ask("(feeds john, animal rex", "zoo"),
        Err(Error::Syntax(_))
    ));
    assert!(engine.store().is_empty());
    Ok(())
}

// ============================================================================
// Durable engine
// ============================================================================

#[test]
fn test_durable_engine_survives_restart() -> Result<()> {
    init_tracing();
    let dir = tempdir()?;
    let config = StorageConfig {
        checkpoint_every: 4,
        sync_writes: false,
        ..StorageConfig::in_dir(dir.path())
    };

    let (fact, removed) = {
        let db = DurableEngine::open(config.clone())?;
        let thing = db.read().taxonomy().vocabulary().thing;
        let person = db.add_subterm("person", &[thing], &[])?;
        db.add_verb("likes", &[], &[("obj", thing)])?;
        db.add_term("john", person)?;
        db.add_term("mary", person)?;
        // Checkpoint fires here; the rest lives only in the log.
        let fact = db.tell("(likes john, obj mary)", "world")?;
        let removed = db.tell("(likes mary, obj john)", "world")?;
        db.remove_fact(removed.id)?;
        (fact, removed)
    };
    assert!(config.snapshot_path().exists());

    let db = DurableEngine::open(config)?;
    let matches = db.ask("(likes Person1, obj Person2)", "world")?;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].fact(), &fact);
    assert!(db.read().store().fact(removed.id).is_none());
    Ok(())
}

#[test]
fn test_storage_config_from_json_file() -> Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("termdb.json");
    let data_dir = dir.path().join("data");
    let json = serde_json::json!({
        "data_dir": &data_dir,
        "checkpoint_every": 0,
        "sync_writes": false,
    });
    std::fs::write(&config_path, serde_json::to_string_pretty(&json)?)?;

    let config = StorageConfig::load(&config_path)?;
    assert_eq!(config.data_dir, data_dir);

    let db = DurableEngine::open(config)?;
    let thing = db.read().taxonomy().vocabulary().thing;
    db.add_subterm("place", &[thing], &[])?;
    assert!(data_dir.join("termdb.wal").exists());
    Ok(())
}
