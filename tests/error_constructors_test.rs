use gridwell_dlm::error::DlmError;

#[test]
fn error_constructors_group_1() {
    assert!(matches!(DlmError::config("x"), DlmError::Config { .. }));
    assert!(matches!(
        DlmError::transport("x"),
        DlmError::Transport { .. }
    ));
    assert!(matches!(
        DlmError::circuit_open("x"),
        DlmError::CircuitOpen { .. }
    ));
    assert!(matches!(DlmError::web("x"), DlmError::Web { .. }));
}

#[test]
fn error_constructors_group_2() {
    let ser = DlmError::Serialization {
        message: "s".into(),
    };
    assert!(matches!(ser, DlmError::Serialization { .. }));
    assert!(matches!(DlmError::io("x"), DlmError::Io { .. }));
    assert!(matches!(
        DlmError::not_discovered("x"),
        DlmError::NotDiscovered { .. }
    ));
    assert!(matches!(
        DlmError::state_conflict("x"),
        DlmError::StateConflict { .. }
    ));
}

#[test]
fn error_constructors_group_3() {
    assert!(matches!(
        DlmError::constraint_violation("x"),
        DlmError::ConstraintViolation { .. }
    ));
    assert!(matches!(
        DlmError::validation("f", "m"),
        DlmError::Validation { .. }
    ));
    assert!(matches!(DlmError::timeout("x"), DlmError::Timeout { .. }));
    assert!(matches!(DlmError::fatal("x"), DlmError::Fatal { .. }));
    assert!(matches!(DlmError::generic("x"), DlmError::Generic { .. }));
}

#[test]
fn display_messages() {
    let e = DlmError::validation("field", "bad");
    let s = format!("{}", e);
    assert!(s.contains("Validation error"));
}

#[test]
fn retryability_is_limited_to_transport() {
    assert!(DlmError::transport("x").is_retryable());
    assert!(!DlmError::circuit_open("x").is_retryable());
    assert!(!DlmError::validation("f", "m").is_retryable());
}
