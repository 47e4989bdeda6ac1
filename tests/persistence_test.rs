use gridwell_dlm::persistence::PersistenceManager;
use gridwell_dlm::types::{FailSafeStationState, PersistedDocument, Station, StationClass};

#[test]
fn default_document_is_empty() {
    let doc = PersistedDocument::default();
    assert!(doc.stations.is_empty());
    assert!(doc.meters.is_empty());
    assert_eq!(doc.shedding.level, 0);
}

#[test]
fn load_save_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let mut mgr = PersistenceManager::new(path.clone());
    let mut document = PersistedDocument::default();
    document.stations.insert(
        "s1".to_string(),
        Station::new("s1", "Station 1", StationClass::Ac3Phase),
    );
    document
        .failsafe
        .insert("s1".to_string(), FailSafeStationState::new("s1", 30_000));
    document.shedding.level = 3;
    mgr.set_document(document);
    mgr.save().unwrap();

    let mut reloaded = PersistenceManager::new(path);
    reloaded.load().unwrap();
    assert!(reloaded.document().stations.contains_key("s1"));
    assert_eq!(reloaded.document().shedding.level, 3);
    assert_eq!(
        reloaded.document().failsafe.get("s1").unwrap().comm_timeout_ms,
        30_000
    );
}

#[test]
fn missing_file_loads_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("does_not_exist.json");
    let mut mgr = PersistenceManager::new(path);
    mgr.load().unwrap();
    assert!(mgr.document().stations.is_empty());
}
