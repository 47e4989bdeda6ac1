use gridwell_dlm::session::{SessionManager, SessionStatus};

#[test]
fn start_update_end_session() {
    let mut mgr = SessionManager::default();
    assert!(mgr.start_session("s1", 100.0).is_ok());
    assert!(mgr.current_session("s1").is_some());

    mgr.update("s1", 3.5, 101.0);
    assert!((mgr.current_session("s1").unwrap().energy_delivered_kwh - 1.0).abs() < 1e-9);

    assert!(mgr.end_session("s1", 102.0).is_ok());
    assert!(mgr.current_session("s1").is_none());

    let last = mgr.last_session("s1").unwrap();
    assert_eq!(last.status, SessionStatus::Completed);
    assert!((last.energy_delivered_kwh - 2.0).abs() < 1e-6);
    assert_eq!(mgr.history("s1").len(), 1);
}
