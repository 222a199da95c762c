//! End-to-end tests for the durable engine

use super::*;
use std::io::Write;
use tempfile::tempdir;

fn config(dir: &FsPath) -> StorageConfig {
    StorageConfig {
        data_dir: dir.to_path_buf(),
        checkpoint_every: 0,
        sync_writes: false,
        ..StorageConfig::default()
    }
}

/// person / likes / john / mary, all logged.
fn seed(db: &DurableEngine) -> (TermId, TermId, TermId) {
    let thing = db.read().taxonomy().vocabulary().thing;
    let number = db.read().taxonomy().vocabulary().number;
    let person = db.add_subterm("person", &[thing], &[]).unwrap();
    let likes = db
        .add_verb("likes", &[], &[("obj", thing), ("since", number)])
        .unwrap();
    let john = db.add_term("john", person).unwrap();
    db.add_term("mary", person).unwrap();
    (person, likes, john)
}

#[test]
fn test_log_replay_restores_terms_and_facts() {
    let dir = tempdir().unwrap();

    let fact = {
        let db = DurableEngine::open(config(dir.path())).unwrap();
        seed(&db);
        db.tell("(likes john, obj mary)", "world").unwrap()
    };

    let db = DurableEngine::open(config(dir.path())).unwrap();
    assert!(!config(dir.path()).snapshot_path().exists());
    assert_eq!(db.read().store().fact(fact.id), Some(&fact));
    assert_eq!(db.ask("(likes Person1, obj mary)", "world").unwrap().len(), 1);

    // Ids keep counting from where the previous session stopped.
    let next = db.tell("(likes mary, obj john)", "world").unwrap();
    assert!(next.id > fact.id);
}

#[test]
fn test_duplicate_facts_are_not_logged() {
    let dir = tempdir().unwrap();
    let db = DurableEngine::open(config(dir.path())).unwrap();
    seed(&db);
    let first = db.tell("(likes john, obj mary)", "world").unwrap();
    let wal_len = std::fs::metadata(db.config().wal_path()).unwrap().len();

    let again = db.tell("(likes john, obj mary)", "world").unwrap();
    assert_eq!(again, first);
    assert_eq!(
        std::fs::metadata(db.config().wal_path()).unwrap().len(),
        wal_len
    );
}

#[test]
fn test_checkpoint_then_more_log() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());

    let (kept, removed) = {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        seed(&db);
        let kept = db.tell("(likes john, obj mary)", "world").unwrap();
        let removed = db.tell("(likes mary, obj john)", "world").unwrap();
        db.checkpoint().unwrap();
        assert_eq!(std::fs::metadata(cfg.wal_path()).unwrap().len(), 0);

        db.remove_fact(removed.id).unwrap();
        (kept, removed)
    };

    let db = DurableEngine::open(cfg.clone()).unwrap();
    assert!(cfg.snapshot_path().exists());
    let engine = db.read();
    assert_eq!(engine.store().fact(kept.id), Some(&kept));
    assert!(engine.store().fact(removed.id).is_none());
    assert_eq!(engine.store().len(), 1);
}

#[test]
fn test_automatic_checkpoint() {
    let dir = tempdir().unwrap();
    let cfg = StorageConfig {
        checkpoint_every: 3,
        ..config(dir.path())
    };
    let db = DurableEngine::open(cfg.clone()).unwrap();
    let thing = db.read().taxonomy().vocabulary().thing;
    db.add_subterm("person", &[thing], &[]).unwrap();
    db.add_subterm("place", &[thing], &[]).unwrap();
    assert!(!cfg.snapshot_path().exists());

    db.add_subterm("tool", &[thing], &[]).unwrap();
    assert!(cfg.snapshot_path().exists());
    assert_eq!(std::fs::metadata(cfg.wal_path()).unwrap().len(), 0);

    drop(db);
    let db = DurableEngine::open(cfg).unwrap();
    assert!(db.read().taxonomy().lookup("tool").is_some());
}

#[test]
fn test_failed_append_rolls_back_taxonomy() {
    let dir = tempdir().unwrap();
    let db = DurableEngine::open(config(dir.path())).unwrap();
    let (person, _, _) = seed(&db);
    let before = db.read().taxonomy().len();

    db.wal.fail_next_append();
    let err = db.add_term("bob", person).unwrap_err();
    assert!(err.is_retryable());
    assert!(db.read().taxonomy().lookup("bob").is_none());
    assert_eq!(db.read().taxonomy().len(), before);

    // The name is free again once the log recovers.
    db.add_term("bob", person).unwrap();
}

#[test]
fn test_failed_append_rolls_back_fact_mutations() {
    let dir = tempdir().unwrap();
    let db = DurableEngine::open(config(dir.path())).unwrap();
    seed(&db);
    let fact = db.tell("(likes john, obj mary)", "world").unwrap();

    db.wal.fail_next_append();
    assert!(db.tell("(likes mary, obj john)", "world").is_err());
    assert_eq!(db.read().store().len(), 1);

    let since = Path::new(vec!["since".to_string()], termdb_core::Feature::Num);
    db.wal.fail_next_append();
    assert!(db.add_object_to_fact(fact.id, Value::Number(2019), &since).is_err());
    assert_eq!(db.read().store().fact(fact.id), Some(&fact));
    assert!(db
        .ask("(likes john, obj mary, since Number1)", "world")
        .unwrap()
        .is_empty());

    db.wal.fail_next_append();
    assert!(db.remove_fact(fact.id).is_err());
    assert_eq!(db.read().store().fact(fact.id), Some(&fact));
    assert_eq!(db.ask("(likes Person1, obj mary)", "world").unwrap().len(), 1);
}

#[test]
fn test_added_object_survives_reopen() {
    let dir = tempdir().unwrap();
    let fact = {
        let db = DurableEngine::open(config(dir.path())).unwrap();
        seed(&db);
        let fact = db.tell("(likes john, obj mary)", "world").unwrap();
        let since = Path::new(vec!["since".to_string()], termdb_core::Feature::Num);
        db.add_object_to_fact(fact.id, Value::Number(2019), &since)
            .unwrap()
    };

    let db = DurableEngine::open(config(dir.path())).unwrap();
    assert_eq!(db.read().store().fact(fact.id), Some(&fact));
    let matches = db
        .ask("(likes john, obj mary, since {Number1: Number1 > 2000})", "world")
        .unwrap();
    assert_eq!(matches.len(), 1);
}

#[test]
fn test_remove_matching_is_logged_per_fact() {
    let dir = tempdir().unwrap();
    {
        let db = DurableEngine::open(config(dir.path())).unwrap();
        seed(&db);
        db.tell("(likes john, obj mary)", "world").unwrap();
        db.tell("(likes mary, obj john)", "world").unwrap();
        db.tell("(likes mary, obj john)", "dreams").unwrap();
        let pattern = db.read().parse("(likes Person1, obj Person2)").unwrap();
        assert_eq!(db.remove_matching("world", &pattern).unwrap().len(), 2);
    }

    let db = DurableEngine::open(config(dir.path())).unwrap();
    assert_eq!(db.read().store().len(), 1);
    assert_eq!(db.ask("(likes Person1, obj john)", "dreams").unwrap().len(), 1);
}

#[test]
fn test_torn_log_tail_is_dropped() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        seed(&db);
        db.tell("(likes john, obj mary)", "world").unwrap();
    }

    // Half of a frame: a length prefix promising more bytes than follow.
    let mut wal = std::fs::OpenOptions::new()
        .append(true)
        .open(cfg.wal_path())
        .unwrap();
    wal.write_all(&200u32.to_le_bytes()).unwrap();
    wal.write_all(&[1, 2, 3]).unwrap();
    drop(wal);

    {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        assert_eq!(db.read().store().len(), 1);
        db.tell("(likes mary, obj john)", "world").unwrap();
    }

    let db = DurableEngine::open(cfg).unwrap();
    assert_eq!(db.read().store().len(), 2);
}

#[test]
fn test_torn_append_does_not_hide_later_entries() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let kept = {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        seed(&db);
        db.tell("(likes john, obj mary)", "world").unwrap();
        let wal_len = std::fs::metadata(cfg.wal_path()).unwrap().len();

        db.wal.tear_next_append();
        assert!(db.tell("(likes mary, obj john)", "world").is_err());
        assert_eq!(db.read().store().len(), 1);
        assert_eq!(std::fs::metadata(cfg.wal_path()).unwrap().len(), wal_len);

        db.tell("(likes mary, obj john)", "world").unwrap()
    };

    let db = DurableEngine::open(cfg).unwrap();
    assert_eq!(db.read().store().len(), 2);
    assert_eq!(db.read().store().fact(kept.id), Some(&kept));
}

#[test]
fn test_stray_bytes_are_cut_before_the_next_append() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let kept = {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        seed(&db);
        db.tell("(likes john, obj mary)", "world").unwrap();

        let mut wal = std::fs::OpenOptions::new()
            .append(true)
            .open(cfg.wal_path())
            .unwrap();
        wal.write_all(&200u32.to_le_bytes()).unwrap();
        wal.write_all(&[1, 2, 3]).unwrap();
        drop(wal);

        db.tell("(likes mary, obj john)", "world").unwrap()
    };

    let db = DurableEngine::open(cfg).unwrap();
    assert_eq!(db.read().store().len(), 2);
    assert_eq!(db.read().store().fact(kept.id), Some(&kept));
}

#[test]
fn test_snapshot_before_log_truncation_replays_nothing_twice() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    let first = {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        seed(&db);
        // Snapshot written and renamed, then the process dies before the
        // log is cut: every seeded entry is in both files.
        let bytes = snapshot::encode(&db.read(), db.wal.last_seq()).unwrap();
        std::fs::write(cfg.snapshot_path(), bytes).unwrap();
        db.tell("(likes john, obj mary)", "world").unwrap()
    };
    assert!(std::fs::metadata(cfg.wal_path()).unwrap().len() > 0);

    let second = {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        assert_eq!(db.read().store().fact(first.id), Some(&first));
        assert!(db.read().taxonomy().lookup("mary").is_some());
        db.tell("(likes mary, obj john)", "world").unwrap()
    };

    let db = DurableEngine::open(cfg.clone()).unwrap();
    assert_eq!(db.read().store().len(), 2);
    assert_eq!(db.read().store().fact(second.id), Some(&second));

    // A real checkpoint followed by a restart keeps numbering past it.
    db.checkpoint().unwrap();
    drop(db);
    let third = {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        db.tell("(likes john, obj john)", "world").unwrap()
    };
    let db = DurableEngine::open(cfg).unwrap();
    assert_eq!(db.read().store().fact(third.id), Some(&third));
    assert_eq!(db.read().store().len(), 3);
}

#[test]
fn test_failed_definition_append_retracts_the_term() {
    let dir = tempdir().unwrap();
    let db = DurableEngine::open(config(dir.path())).unwrap();
    let (person, _, _) = seed(&db);
    let thing = db.read().taxonomy().vocabulary().thing;
    let subterms = db.read().taxonomy().get_subterms(person).len();

    db.wal.fail_next_append();
    assert!(db.add_subterm("child", &[person], &[]).is_err());
    assert!(db.read().taxonomy().lookup("child").is_none());
    assert_eq!(db.read().taxonomy().get_subterms(person).len(), subterms);

    db.wal.fail_next_append();
    assert!(db.add_verb("knows", &[], &[("obj", person)]).is_err());
    assert!(db.read().taxonomy().lookup("knows").is_none());

    let child = db.add_subterm("child", &[person], &[]).unwrap();
    assert!(db.read().taxonomy().are(child, thing));
}

#[test]
fn test_edge_mutations_are_logged_before_they_apply() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        let (person, _, _) = seed(&db);
        let thing = db.read().taxonomy().vocabulary().thing;
        let agent = db.add_subterm("agent", &[thing], &[]).unwrap();
        let wal_len = std::fs::metadata(cfg.wal_path()).unwrap().len();

        // Unknown terms fail without touching the log.
        let missing = TermId::new(9_999);
        assert!(db.add_base(person, missing).is_err());
        assert!(db.add_equivalence(missing, person).is_err());
        assert_eq!(std::fs::metadata(cfg.wal_path()).unwrap().len(), wal_len);

        // A failed append leaves the edge unapplied.
        db.wal.fail_next_append();
        assert!(db.add_base(person, agent).is_err());
        assert!(!db.read().taxonomy().are(person, agent));

        db.add_base(person, agent).unwrap();
        assert!(db.read().taxonomy().are(person, agent));
    }

    let db = DurableEngine::open(cfg).unwrap();
    let engine = db.read();
    let person = engine.taxonomy().get_term("person").unwrap();
    let agent = engine.taxonomy().get_term("agent").unwrap();
    assert!(engine.taxonomy().are(person, agent));
}

#[test]
fn test_many_definitions_stay_logged_in_order() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    {
        let db = DurableEngine::open(cfg.clone()).unwrap();
        let (person, _, _) = seed(&db);
        for i in 0..500 {
            db.add_term(&format!("citizen_{i}"), person).unwrap();
        }
    }

    let db = DurableEngine::open(cfg).unwrap();
    let engine = db.read();
    let person = engine.taxonomy().get_term("person").unwrap();
    assert_eq!(engine.taxonomy().instances_of(&[person]).len(), 502);
    assert!(engine.taxonomy().lookup("citizen_499").is_some());
}

#[test]
fn test_corrupt_snapshot_is_rejected() {
    let dir = tempdir().unwrap();
    let cfg = config(dir.path());
    std::fs::write(cfg.snapshot_path(), b"not a snapshot").unwrap();

    let err = DurableEngine::open(cfg).err().unwrap();
    assert!(matches!(err, StorageError::Codec(_)));
    assert!(!err.is_retryable());
}

#[test]
fn test_config_from_json_fills_defaults() {
    let cfg = StorageConfig::from_json(r#"{ "data_dir": "/var/lib/termdb", "checkpoint_every": 10 }"#)
        .unwrap();
    assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/termdb"));
    assert_eq!(cfg.checkpoint_every, 10);
    assert_eq!(cfg.wal_file, "termdb.wal");
    assert!(cfg.sync_writes);
    assert_eq!(cfg.wal_path(), PathBuf::from("/var/lib/termdb/termdb.wal"));

    assert!(matches!(
        StorageConfig::from_json("{ nope"),
        Err(StorageError::Codec(_))
    ));
}

#[test]
fn test_config_load_from_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("termdb.json");
    std::fs::write(&path, r#"{ "sync_writes": false }"#).unwrap();
    let cfg = StorageConfig::load(&path).unwrap();
    assert!(!cfg.sync_writes);
    assert_eq!(cfg.checkpoint_every, StorageConfig::default().checkpoint_every);
}
