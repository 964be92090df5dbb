use std::fs;
use std::time::Duration;

use atlas_graph::errors::AtlasGraphError;
use atlas_graph::utils::config::{resolve_config, CONFIG_FILE};
use tempfile::TempDir;

#[test]
fn missing_file_means_library_defaults() {
    let td = TempDir::new().unwrap();
    let cfg = resolve_config(None, Some(td.path())).unwrap();
    assert!(cfg.default_format().is_none());
    let s = cfg.service_settings().unwrap();
    assert!(s.traversal_budget.is_none());
}

#[test]
fn file_in_state_directory_is_picked_up() {
    let td = TempDir::new().unwrap();
    fs::write(
        td.path().join(CONFIG_FILE),
        "[traversal]\ntime_budget_ms = 250\n[query]\ndefault_format = \"json\"\n",
    )
    .unwrap();
    let cfg = resolve_config(None, Some(td.path())).unwrap();
    assert_eq!(cfg.default_format(), Some("json"));
    assert_eq!(cfg.service_settings().unwrap().traversal_budget, Some(Duration::from_millis(250)));
}

#[test]
fn explicit_path_wins_over_state_directory() {
    let td = TempDir::new().unwrap();
    fs::write(td.path().join(CONFIG_FILE), "[query]\ndefault_format = \"json\"\n").unwrap();
    let other = td.path().join("other.toml");
    fs::write(&other, "[query]\ndefault_format = \"text\"\n").unwrap();
    let cfg = resolve_config(Some(&other), Some(td.path())).unwrap();
    assert_eq!(cfg.default_format(), Some("text"));
}

#[test]
fn unknown_keys_are_rejected() {
    let td = TempDir::new().unwrap();
    fs::write(td.path().join(CONFIG_FILE), "[persistence]\nretries = 3\n").unwrap();
    let err = resolve_config(None, Some(td.path())).unwrap_err();
    assert!(matches!(err, AtlasGraphError::Toml(_)));
}
