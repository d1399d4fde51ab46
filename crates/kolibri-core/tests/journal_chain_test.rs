//! Integration test: journal chain invariants: adjacency, persistence
//! round-trips, and tamper rejection on load.

use kolibri_core::{ActionJournal, JournalError, GENESIS_HASH};

// ===========================================================================
// Chain adjacency: prev_hash links and hashes recompute
// ===========================================================================

#[test]
fn adjacent_entries_link_by_hash() {
    let journal = ActionJournal::new();
    for index in 0..4 {
        journal.append(
            "plan",
            serde_json::json!({"goal": format!("goal {index}"), "step_count": index}),
        );
    }
    let entries = journal.entries();
    assert_eq!(entries[0].prev_hash, GENESIS_HASH);
    for pair in entries.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
        assert_eq!(pair[0].compute_hash(), pair[0].hash);
    }
    assert!(journal.verify());
}

// ===========================================================================
// Round trip: save -> load preserves entries and validates hashes
// ===========================================================================

#[test]
fn save_load_round_trip_verifies() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested/dir/chain.jsonl");

    let journal = ActionJournal::new();
    journal.append("session_started", serde_json::json!({"session_id": "s"}));
    journal.append(
        "skill_executed",
        serde_json::json!({"skill": "writer", "result_keys": ["draft"]}),
    );
    journal.save(&path).unwrap();

    let restored = ActionJournal::load(&path).unwrap();
    assert!(restored.verify());
    assert_eq!(restored.len(), 2);
    let entries = restored.entries();
    assert_eq!(entries[0].event, "session_started");
    assert_eq!(entries[1].payload["skill"], "writer");
}

// ===========================================================================
// Tampering: a mutated payload rejects the whole file
// ===========================================================================

#[test]
fn tampered_payload_fails_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.jsonl");

    let journal = ActionJournal::new();
    journal.append("privacy", serde_json::json!({"user_id": "honest-user"}));
    journal.save(&path).unwrap();

    let raw = std::fs::read_to_string(&path).unwrap();
    let forged = raw.replace("honest-user", "forged-user");
    assert_ne!(raw, forged);
    std::fs::write(&path, forged).unwrap();

    match ActionJournal::load(&path) {
        Err(JournalError::Integrity { index }) => assert_eq!(index, 0),
        other => panic!("expected integrity failure, got {other:?}"),
    }
}

// ===========================================================================
// Tampering: a broken prev_hash chain is detected too
// ===========================================================================

#[test]
fn broken_chain_fails_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chain.jsonl");

    let journal = ActionJournal::new();
    journal.append("first", serde_json::json!({}));
    journal.append("second", serde_json::json!({}));
    journal.save(&path).unwrap();

    // Drop the first line so the file starts mid-chain.
    let raw = std::fs::read_to_string(&path).unwrap();
    let second_line = raw.lines().nth(1).unwrap().to_string();
    std::fs::write(&path, second_line + "\n").unwrap();

    assert!(matches!(
        ActionJournal::load(&path),
        Err(JournalError::ChainBroken { .. })
    ));
}
