// Integration tests for configuration file support

use keeper::config::{self, ProcessConfig};
use keeper::error::{ErrorClass, KeeperError};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

const ONE_GIB: u64 = 1024 * 1024 * 1024;

#[test]
fn test_pm2_ecosystem_json() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("ecosystem.json");

    let json_content = r#"{
        "apps": [
            {
                "name": "pichub-api",
                "script": "./dist/pichub-api",
                "cwd": "./dist",
                "exec_mode": "fork_mode",
                "instances": 1,
                "autorestart": true,
                "watch": false,
                "max_memory_restart": "1G",
                "env": { "NODE_ENV": "production", "PORT": "8080" }
            }
        ]
    }"#;
    fs::write(&config_path, json_content).unwrap();

    let configs = ProcessConfig::from_file(&config_path).unwrap();
    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].name, "pichub-api");
    assert_eq!(configs[0].max_memory_bytes().unwrap(), Some(ONE_GIB));
    assert_eq!(configs[0].env.get("PORT"), Some(&"8080".to_string()));

    let loaded = config::load(&config_path).unwrap();
    let (spec, policy) = &loaded[0];
    assert_eq!(spec.cwd, temp_dir.path().join("dist"));
    // script is relative to cwd, matching how the process itself sees it
    assert_eq!(spec.executable, temp_dir.path().join("dist/dist/pichub-api"));
    assert!(policy.autorestart);
    assert_eq!(policy.max_memory, Some(ONE_GIB));
    assert_eq!(policy.max_restarts, Some(16));
}

#[test]
fn test_toml_processes_with_explicit_backoff() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("keeper.toml");

    let toml_content = r#"
        [[processes]]
        name = "web"
        script = "/bin/sleep"
        args = ["30"]
        backoff_ms = [100, 200, 400]
        kill_timeout_ms = 2500
        stop_signal = "SIGINT"

        [[processes]]
        name = "worker"
        script = "/bin/sleep"
        args = ["60"]
        autorestart = false
        min_uptime_ms = 5000
    "#;
    fs::write(&config_path, toml_content).unwrap();

    let loaded = config::load(&config_path).unwrap();
    assert_eq!(loaded.len(), 2);

    let (web, web_policy) = &loaded[0];
    assert_eq!(web.executable, PathBuf::from("/bin/sleep"));
    assert_eq!(web.stop_signal, "SIGINT");
    assert_eq!(web.kill_timeout, Duration::from_millis(2500));
    assert_eq!(
        web_policy.backoff.steps(),
        &[
            Duration::from_millis(100),
            Duration::from_millis(200),
            Duration::from_millis(400)
        ]
    );

    let (_, worker_policy) = &loaded[1];
    assert!(!worker_policy.autorestart);
    assert_eq!(worker_policy.min_uptime, Duration::from_secs(5));
}

#[test]
fn test_unlimited_restarts_must_be_explicit() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("keeper.json");
    fs::write(
        &config_path,
        r#"{ "name": "api", "script": "/bin/true", "max_restarts": null }"#,
    )
    .unwrap();

    let loaded = config::load(&config_path).unwrap();
    assert_eq!(loaded[0].1.max_restarts, None);
}

#[test]
fn test_env_expansion_in_config() {
    std::env::set_var("KEEPER_IT_PORT", "9090");

    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("keeper.toml");
    fs::write(
        &config_path,
        r#"
        name = "api"
        script = "/bin/true"
        args = ["--port", "${KEEPER_IT_PORT}", "$NOT_SET_ANYWHERE_KEEPER"]
        "#,
    )
    .unwrap();

    let configs = ProcessConfig::from_file(&config_path).unwrap();
    assert_eq!(
        configs[0].args,
        vec!["--port", "9090", "$NOT_SET_ANYWHERE_KEEPER"]
    );
}

#[test]
fn test_config_errors_are_config_class() {
    let temp_dir = TempDir::new().unwrap();
    let cases = [
        ("cluster.json", r#"{ "name": "api", "script": "a", "exec_mode": "cluster" }"#),
        ("signal.toml", "name = \"api\"\nscript = \"a\"\nstop_signal = \"SIGFOO\""),
        ("memory.toml", "name = \"api\"\nscript = \"a\"\nmax_memory_restart = \"lots\""),
        ("budget.toml", "name = \"api\"\nscript = \"a\"\nmax_restarts = 0"),
        ("broken.json", "{ \"name\": "),
        ("empty.toml", "processes = []"),
        ("keeper.yaml", "name: api"),
    ];

    for (file, contents) in cases {
        let path = temp_dir.path().join(file);
        fs::write(&path, contents).unwrap();

        let err = config::load(&path).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Config, "{}: {}", file, err);
    }
}

#[test]
fn test_missing_file_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let err = config::load(&temp_dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, KeeperError::Config(_)));
}

#[test]
fn test_duplicate_names_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("keeper.json");
    fs::write(
        &config_path,
        r#"{ "apps": [
            { "name": "api", "script": "/bin/true" },
            { "name": "api", "script": "/bin/false" }
        ] }"#,
    )
    .unwrap();

    assert!(matches!(
        config::load(&config_path),
        Err(KeeperError::InvalidConfig(_))
    ));
}
