use gridwell_dlm::config::Config;
use std::fs;

#[test]
fn save_and_load_yaml_roundtrip() {
    let tmp_dir = tempfile::tempdir().unwrap();
    let path = tmp_dir.path().join("config.yaml");

    let mut cfg = Config::default();
    cfg.grid.max_grid_capacity_kw = 777.0;
    cfg.logging.file = path.with_extension("log").to_string_lossy().to_string();

    cfg.save_to_file(&path).unwrap();
    let loaded = Config::from_file(&path).unwrap();

    assert!((loaded.grid.max_grid_capacity_kw - 777.0).abs() < 1e-9);
    assert_eq!(loaded.logging.file, cfg.logging.file);
}

#[test]
fn config_validation_errors() {
    let mut cfg = Config::default();
    cfg.grid.max_grid_capacity_kw = -1.0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.grid.min_charging_power_kw = cfg.grid.max_charging_power_per_station_kw + 1.0;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.site.service_phases = 2;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.shedding.upper_threshold = 0.5;
    cfg.shedding.lower_threshold = 0.6;
    assert!(cfg.validate().is_err());

    cfg = Config::default();
    cfg.allocator.tick_period_ms = 0;
    assert!(cfg.validate().is_err());
}

#[test]
fn from_file_with_invalid_yaml_fails() {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    fs::write(tmp.path(), b"bad: [unclosed").unwrap();
    assert!(Config::from_file(tmp.path()).is_err());
}
