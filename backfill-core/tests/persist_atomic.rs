use std::collections::BTreeMap;

use backfill_core::{AtomicJsonFile, BackfillError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct State {
    names: Vec<String>,
    counts: BTreeMap<String, u32>,
}

fn sample() -> State {
    let mut counts = BTreeMap::new();
    counts.insert("MSFT".to_string(), 3);
    State {
        names: vec!["EUR.USD".into(), "MSFT".into()],
        counts,
    }
}

#[test]
fn missing_file_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let file: AtomicJsonFile<State> = AtomicJsonFile::new(dir.path().join("state.json"));
    assert_eq!(file.load().unwrap(), None);
}

#[test]
fn blank_file_loads_as_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "  \n").unwrap();
    let file: AtomicJsonFile<State> = AtomicJsonFile::new(path);
    assert_eq!(file.load().unwrap(), None);
}

#[test]
fn save_creates_parent_and_leaves_no_temp_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("state.json");
    let file = AtomicJsonFile::new(&path);
    file.save(&sample()).unwrap();

    assert_eq!(file.load().unwrap(), Some(sample()));
    let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn save_replaces_previous_contents() {
    let dir = tempfile::tempdir().unwrap();
    let file = AtomicJsonFile::new(dir.path().join("state.json"));
    file.save(&sample()).unwrap();
    let next = State {
        names: vec!["ES".into()],
        counts: BTreeMap::new(),
    };
    file.save(&next).unwrap();
    assert_eq!(file.load().unwrap(), Some(next));
}

#[test]
fn corrupt_file_is_a_persistence_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{ not json").unwrap();
    let file: AtomicJsonFile<State> = AtomicJsonFile::new(path);
    assert!(matches!(file.load(), Err(BackfillError::Persistence(_))));
}
