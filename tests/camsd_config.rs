use std::sync::Mutex;

use tempfile::Builder;

use cams::config::CamsdConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "CAMS_CONFIG",
        "CAMS_DB_PATH",
        "CAMS_API_ADDR",
        "CAMS_RETENTION_SECS",
        "CAMS_STALE_AFTER_SECS",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn defaults_apply_without_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = CamsdConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "cams.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:5000");
    assert_eq!(cfg.retention.as_secs(), 60 * 60 * 24 * 7);
    assert!(cfg.stale_after.is_none());
}

#[test]
fn loads_json_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".json").tempfile().expect("temp config");
    let json = r#"{
        "db_path": "cams_prod.db",
        "api": { "addr": "0.0.0.0:9000" },
        "retention": { "seconds": 43200 },
        "staleness": { "after_seconds": 120 }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("CAMS_CONFIG", file.path());
    std::env::set_var("CAMS_API_ADDR", "127.0.0.1:5050");
    std::env::set_var("CAMS_RETENTION_SECS", "86400");

    let cfg = CamsdConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "cams_prod.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:5050");
    assert_eq!(cfg.retention.as_secs(), 86400);
    assert_eq!(cfg.stale_after.map(|d| d.as_secs()), Some(120));

    let monitor_cfg = cfg.monitor_config();
    assert_eq!(monitor_cfg.db_path, "cams_prod.db");
    assert_eq!(monitor_cfg.retention.as_secs(), 86400);

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = Builder::new().suffix(".toml").tempfile().expect("temp config");
    let toml = r#"
db_path = "campus.db"

[api]
addr = "127.0.0.1:7000"
"#;
    std::io::Write::write_all(&mut file, toml.as_bytes()).expect("write config");
    std::env::set_var("CAMS_CONFIG", file.path());
    std::env::set_var("CAMS_STALE_AFTER_SECS", "300");

    let cfg = CamsdConfig::load().expect("load config");
    assert_eq!(cfg.db_path, "campus.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:7000");
    assert_eq!(cfg.stale_after.map(|d| d.as_secs()), Some(300));

    clear_env();
}

#[test]
fn rejects_zero_retention_and_bad_numbers() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMS_RETENTION_SECS", "0");
    assert!(CamsdConfig::load().is_err());

    std::env::set_var("CAMS_RETENTION_SECS", "a week");
    assert!(CamsdConfig::load().is_err());

    clear_env();
    std::env::set_var("CAMS_STALE_AFTER_SECS", "0");
    assert!(CamsdConfig::load().is_err());

    clear_env();
}
