use std::sync::Mutex;

use tempfile::NamedTempFile;

use vigil::config::VigildConfig;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "VIGIL_CONFIG",
        "VIGIL_DB_PATH",
        "VIGIL_SNAPSHOT_DIR",
        "VIGIL_GAP_MS",
        "VIGIL_MAX_MEMBERS",
        "VIGIL_ALERT_COOLDOWN_MS",
        "VIGIL_ALERT_LABELS",
        "VIGIL_RANK_LIMIT",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "db_path": "vigil_prod.db",
        "snapshot_dir": "/var/lib/vigil/snapshots",
        "builder": {
            "gap_ms": 4000,
            "max_members": 500,
            "queue_depth": 64
        },
        "alerts": {
            "enabled": true,
            "cooldown_ms": 10000,
            "min_confidence": 0.8,
            "labels": ["person", "dog"]
        },
        "ranking": {
            "limit": 5,
            "max_frames": 6,
            "min_score": 2.5,
            "use_diversity": false
        }
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("VIGIL_CONFIG", file.path());
    std::env::set_var("VIGIL_GAP_MS", "2500");
    std::env::set_var("VIGIL_ALERT_LABELS", "person, car");

    let cfg = VigildConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "vigil_prod.db");
    assert_eq!(
        cfg.snapshot_dir.to_str().unwrap(),
        "/var/lib/vigil/snapshots"
    );
    assert_eq!(cfg.builder.gap_ms, 2500);
    assert_eq!(cfg.builder.max_members, 500);
    assert_eq!(cfg.builder.queue_depth, 64);
    assert!(cfg.alerts.enabled);
    assert_eq!(cfg.alerts.cooldown_ms, 10_000);
    assert_eq!(cfg.alerts.min_confidence, 0.8);
    assert_eq!(cfg.alerts.labels, vec!["person", "car"]);
    assert_eq!(cfg.ranking.limit, 5);
    assert_eq!(cfg.ranking.max_frames, 6);
    assert_eq!(cfg.ranking.min_score, 2.5);
    assert!(!cfg.ranking.use_diversity);

    clear_env();
}

#[test]
fn defaults_apply_without_file_or_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = VigildConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "vigil.db");
    assert_eq!(cfg.snapshot_dir.to_str().unwrap(), "snapshots");
    assert_eq!(cfg.builder.gap_ms, 2_000);
    assert_eq!(cfg.builder.max_members, 300);
    assert_eq!(cfg.builder.queue_depth, 256);
    assert!(cfg.alerts.enabled);
    assert_eq!(cfg.alerts.cooldown_ms, 30_000);
    assert_eq!(cfg.alerts.min_confidence, 0.7);
    assert_eq!(cfg.alerts.labels, vec!["person"]);
    assert_eq!(cfg.ranking.limit, 10);
    assert_eq!(cfg.ranking.max_frames, 8);
    assert!(cfg.ranking.use_diversity);
}

#[test]
fn rejects_unparseable_and_invalid_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_GAP_MS", "soon");
    assert!(VigildConfig::load().is_err());

    std::env::set_var("VIGIL_GAP_MS", "0");
    assert!(VigildConfig::load().is_err());

    clear_env();
}

#[test]
fn derived_module_configs_follow_settings() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("VIGIL_GAP_MS", "1500");
    std::env::set_var("VIGIL_MAX_MEMBERS", "50");
    std::env::set_var("VIGIL_ALERT_COOLDOWN_MS", "5000");

    let cfg = VigildConfig::load().expect("load config");

    let builder = cfg.builder_config("cam-a");
    assert_eq!(builder.source_id, "cam-a");
    assert_eq!(builder.gap_threshold_ms, 1_500);
    assert_eq!(builder.max_members, 50);
    assert!(builder.distance_threshold.is_none());

    let worker = cfg.worker_config("cam-a");
    assert_eq!(worker.queue_depth, 256);

    let alerts = cfg.alert_config();
    assert_eq!(alerts.cooldown_ms, 5_000);
    assert_eq!(alerts.labels, vec!["person"]);

    assert_eq!(cfg.frame_select_config().max_frames, 8);

    clear_env();
}
