pub mod memory;
pub mod runtime;

pub use memory::{format_bytes, parse_memory_to_bytes, MemoryQuantity};
pub use runtime::{RuntimePaths, SupervisorSettings, HOME_ENV};

use crate::error::{KeeperError, Result};
use crate::process::restart::{BackoffSchedule, RestartPolicy, DEFAULT_MAX_RESTARTS};
use crate::process::types::ProcessSpec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Keys under which a config file may hold a list of process records
const LIST_KEYS: [&str; 2] = ["apps", "processes"];

/// How the managed binary is executed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    #[default]
    #[serde(alias = "fork_mode")]
    Fork,
    #[serde(alias = "cluster_mode")]
    Cluster,
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecMode::Fork => write!(f, "fork"),
            ExecMode::Cluster => write!(f, "cluster"),
        }
    }
}

/// One managed process as written in a config file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Process name (unique identifier)
    pub name: String,

    /// Executable to run, relative to `cwd` unless absolute
    pub script: PathBuf,

    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory, relative to the config file's directory unless absolute
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub exec_mode: ExecMode,

    /// Accepted for compatibility; a single instance is supervised
    #[serde(default = "default_instances")]
    pub instances: usize,

    #[serde(default = "default_autorestart")]
    pub autorestart: bool,

    /// Accepted for compatibility; no file watching is performed
    #[serde(default)]
    pub watch: bool,

    /// Resident memory ceiling such as "1G" or a raw byte count
    #[serde(default)]
    pub max_memory_restart: Option<MemoryQuantity>,

    /// Consecutive restart budget; an explicit `null` means unlimited
    #[serde(default = "default_max_restarts")]
    pub max_restarts: Option<u32>,

    #[serde(default = "default_restart_delay_ms", alias = "restart_delay")]
    pub restart_delay_ms: u64,

    #[serde(default = "default_max_restart_delay_ms")]
    pub max_restart_delay_ms: u64,

    /// Explicit backoff schedule; overrides the derived exponential one
    #[serde(default)]
    pub backoff_ms: Option<Vec<u64>>,

    #[serde(default = "default_min_uptime_ms", alias = "min_uptime")]
    pub min_uptime_ms: u64,

    #[serde(default = "default_kill_timeout_ms", alias = "kill_timeout")]
    pub kill_timeout_ms: u64,

    #[serde(default = "default_stop_signal")]
    pub stop_signal: String,
}

fn default_instances() -> usize {
    1
}

fn default_autorestart() -> bool {
    true
}

fn default_max_restarts() -> Option<u32> {
    Some(DEFAULT_MAX_RESTARTS)
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

fn default_max_restart_delay_ms() -> u64 {
    15_000
}

fn default_min_uptime_ms() -> u64 {
    30_000
}

fn default_kill_timeout_ms() -> u64 {
    5_000
}

fn default_stop_signal() -> String {
    "SIGTERM".to_string()
}

impl ProcessConfig {
    /// A record with every optional field at its default
    pub fn new<P: Into<PathBuf>>(name: &str, script: P) -> Self {
        Self {
            name: name.to_string(),
            script: script.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
            exec_mode: ExecMode::default(),
            instances: default_instances(),
            autorestart: default_autorestart(),
            watch: false,
            max_memory_restart: None,
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
            max_restart_delay_ms: default_max_restart_delay_ms(),
            backoff_ms: None,
            min_uptime_ms: default_min_uptime_ms(),
            kill_timeout_ms: default_kill_timeout_ms(),
            stop_signal: default_stop_signal(),
        }
    }

    /// Load process configurations from a file (supports TOML and JSON)
    pub fn from_file(path: &Path) -> Result<Vec<ProcessConfig>> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            KeeperError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let extension = path.extension().and_then(|s| s.to_str()).unwrap_or("");

        let configs = match extension {
            "toml" => Self::parse_toml(&contents)?,
            "json" => Self::parse_json(&contents)?,
            _ => {
                return Err(KeeperError::InvalidConfig(format!(
                    "Unsupported file format: '{}'. Use .toml or .json",
                    extension
                )))
            }
        };

        if configs.is_empty() {
            return Err(KeeperError::InvalidConfig(
                "No process configuration found in file".to_string(),
            ));
        }

        let configs: Vec<ProcessConfig> = configs
            .into_iter()
            .map(|mut config| {
                config.expand_env_vars();
                config
            })
            .collect();

        for (idx, config) in configs.iter().enumerate() {
            config.validate()?;
            if configs[..idx].iter().any(|other| other.name == config.name) {
                return Err(KeeperError::InvalidConfig(format!(
                    "Duplicate process name '{}'",
                    config.name
                )));
            }
        }

        Ok(configs)
    }

    fn parse_toml(contents: &str) -> Result<Vec<ProcessConfig>> {
        let mut table: toml::Table = toml::from_str(contents)
            .map_err(|e| KeeperError::InvalidConfig(format!("Failed to parse TOML: {}", e)))?;

        for key in LIST_KEYS {
            if let Some(list) = table.remove(key) {
                return list.try_into().map_err(|e| {
                    KeeperError::InvalidConfig(format!("Invalid '{}' list: {}", key, e))
                });
            }
        }

        let single: ProcessConfig = toml::Value::Table(table)
            .try_into()
            .map_err(|e| KeeperError::InvalidConfig(format!("Invalid process record: {}", e)))?;
        Ok(vec![single])
    }

    fn parse_json(contents: &str) -> Result<Vec<ProcessConfig>> {
        let mut value: serde_json::Value = serde_json::from_str(contents)
            .map_err(|e| KeeperError::InvalidConfig(format!("Failed to parse JSON: {}", e)))?;

        if let Some(object) = value.as_object_mut() {
            for key in LIST_KEYS {
                if let Some(list) = object.remove(key) {
                    return serde_json::from_value(list).map_err(|e| {
                        KeeperError::InvalidConfig(format!("Invalid '{}' list: {}", key, e))
                    });
                }
            }
        }

        let single: ProcessConfig = serde_json::from_value(value)
            .map_err(|e| KeeperError::InvalidConfig(format!("Invalid process record: {}", e)))?;
        Ok(vec![single])
    }

    /// Field-level checks that do not touch the filesystem
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(KeeperError::MissingConfigField("name".to_string()));
        }

        // Names become log file names
        if self.name.contains('/') || self.name == "." || self.name == ".." {
            return Err(KeeperError::Config(format!(
                "Invalid process name '{}'",
                self.name
            )));
        }

        if self.script.as_os_str().is_empty() {
            return Err(KeeperError::MissingConfigField("script".to_string()));
        }

        if self.exec_mode != ExecMode::Fork {
            return Err(KeeperError::Config(format!(
                "{}: exec_mode '{}' is not supported; only 'fork' is",
                self.name, self.exec_mode
            )));
        }

        if self.instances == 0 {
            return Err(KeeperError::Config(
                "instances must be at least 1".to_string(),
            ));
        }

        if self.instances > 100 {
            return Err(KeeperError::Config(
                "instances cannot exceed 100".to_string(),
            ));
        }

        if self.max_restarts == Some(0) {
            return Err(KeeperError::Config(
                "max_restarts must be at least 1; use autorestart = false to disable restarts"
                    .to_string(),
            ));
        }

        if self.kill_timeout_ms == 0 {
            return Err(KeeperError::Config(
                "kill_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.restart_delay_ms > self.max_restart_delay_ms {
            return Err(KeeperError::Config(format!(
                "restart_delay_ms ({}) exceeds max_restart_delay_ms ({})",
                self.restart_delay_ms, self.max_restart_delay_ms
            )));
        }

        crate::process::terminate::parse_signal(&self.stop_signal)
            .map_err(|e| KeeperError::Config(e.to_string()))?;

        self.backoff_schedule()?;
        self.max_memory_bytes()?;

        Ok(())
    }

    /// The explicit schedule if one is given, otherwise the derived exponential one
    pub fn backoff_schedule(&self) -> Result<BackoffSchedule> {
        match &self.backoff_ms {
            Some(steps) => BackoffSchedule::new(
                steps.iter().copied().map(Duration::from_millis).collect(),
            ),
            None => Ok(BackoffSchedule::exponential(
                Duration::from_millis(self.restart_delay_ms),
                Duration::from_millis(self.max_restart_delay_ms),
            )),
        }
    }

    pub fn max_memory_bytes(&self) -> Result<Option<u64>> {
        self.max_memory_restart
            .as_ref()
            .map(MemoryQuantity::to_bytes)
            .transpose()
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn min_uptime(&self) -> Duration {
        Duration::from_millis(self.min_uptime_ms)
    }

    pub fn restart_policy(&self) -> Result<RestartPolicy> {
        Ok(RestartPolicy {
            autorestart: self.autorestart,
            max_memory: self.max_memory_bytes()?,
            backoff: self.backoff_schedule()?,
            max_restarts: self.max_restarts,
            min_uptime: self.min_uptime(),
        })
    }

    /// Resolve paths against `base_dir` (the config file's directory) and
    /// build the launch descriptor and restart policy.
    pub fn resolve(&self, base_dir: &Path) -> Result<(ProcessSpec, RestartPolicy)> {
        let cwd = match &self.cwd {
            Some(cwd) => normalize_path(&base_dir.join(cwd)),
            None => normalize_path(base_dir),
        };
        let executable = normalize_path(&cwd.join(&self.script));

        let spec = ProcessSpec {
            name: self.name.clone(),
            executable,
            args: self.args.clone(),
            cwd,
            env: self.env.clone(),
            exec_mode: self.exec_mode,
            instances: self.instances,
            watch: self.watch,
            stop_signal: self.stop_signal.clone(),
            kill_timeout: self.kill_timeout(),
        };

        Ok((spec, self.restart_policy()?))
    }

    fn expand_env_vars(&mut self) {
        self.script = expand_env_in_path(&self.script);

        if let Some(ref cwd) = self.cwd {
            self.cwd = Some(expand_env_in_path(cwd));
        }

        self.args = self.args.iter().map(|arg| expand_env_in_string(arg)).collect();

        // Values only
        self.env = self
            .env
            .iter()
            .map(|(k, v)| (k.clone(), expand_env_in_string(v)))
            .collect();
    }
}

/// Read a config file and resolve every record against the file's directory
pub fn load(path: &Path) -> Result<Vec<(ProcessSpec, RestartPolicy)>> {
    let path = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let base_dir = path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    ProcessConfig::from_file(&path)?
        .iter()
        .map(|config| config.resolve(&base_dir))
        .collect()
}

/// Expand `$VAR` and `${VAR}` references. Unknown variables are left as written.
fn expand_env_in_string(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) if is_var_name(&braced[..end]) => {
                    match std::env::var(&braced[..end]) {
                        Ok(value) => out.push_str(&value),
                        Err(_) => out.push_str(&rest[pos..pos + end + 3]),
                    }
                    rest = &braced[end + 1..];
                }
                _ => {
                    out.push_str("${");
                    rest = braced;
                }
            }
            continue;
        }

        let len = after
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(after.len());
        let name = &after[..len];

        if is_var_name(name) {
            match std::env::var(name) {
                Ok(value) => out.push_str(&value),
                Err(_) => {
                    out.push('$');
                    out.push_str(name);
                }
            }
        } else {
            out.push('$');
            out.push_str(name);
        }
        rest = &after[len..];
    }

    out.push_str(rest);
    out
}

fn is_var_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    }
}

fn expand_env_in_path(path: &Path) -> PathBuf {
    PathBuf::from(expand_env_in_string(&path.to_string_lossy()))
}

/// Lexically drop `.` and fold `..` components
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = ProcessConfig::new("api", "./pichub-api");

        assert_eq!(config.exec_mode, ExecMode::Fork);
        assert_eq!(config.instances, 1);
        assert!(config.autorestart);
        assert!(!config.watch);
        assert_eq!(config.max_restarts, Some(16));
        assert_eq!(config.kill_timeout(), Duration::from_secs(5));
        assert_eq!(config.min_uptime(), Duration::from_secs(30));
        assert_eq!(
            config.backoff_schedule().unwrap(),
            BackoffSchedule::exponential(Duration::from_secs(1), Duration::from_secs(15))
        );
    }

    #[test]
    fn test_parse_single_toml_record() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "app.toml",
            r#"
name = "pichub-api"
script = "./pichub-api"
cwd = "./dist"
exec_mode = "fork"
instances = 1
autorestart = true
watch = false
max_memory_restart = "1G"
"#,
        );

        let configs = ProcessConfig::from_file(&path).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "pichub-api");
        assert_eq!(configs[0].max_memory_bytes().unwrap(), Some(1_073_741_824));
    }

    #[test]
    fn test_parse_toml_apps_list() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "ecosystem.toml",
            r#"
[[apps]]
name = "web"
script = "/bin/sleep"
args = ["60"]

[[apps]]
name = "worker"
script = "/bin/sleep"
kill_timeout = 2000
"#,
        );

        let configs = ProcessConfig::from_file(&path).unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[1].kill_timeout_ms, 2000);
    }

    #[test]
    fn test_parse_json_processes_list_and_null_budget() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "procs.json",
            r#"{
  "processes": [
    { "name": "a", "script": "/bin/true", "max_restarts": null },
    { "name": "b", "script": "/bin/true", "max_memory_restart": 4096, "backoff_ms": [10, 20, 40] }
  ]
}"#,
        );

        let configs = ProcessConfig::from_file(&path).unwrap();
        assert_eq!(configs[0].max_restarts, None);
        assert_eq!(configs[1].max_restarts, Some(16));
        assert_eq!(configs[1].max_memory_bytes().unwrap(), Some(4096));
        assert_eq!(configs[1].backoff_schedule().unwrap().len(), 3);
    }

    #[test]
    fn test_pm2_aliases() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "ecosystem.json",
            r#"{ "apps": [ { "name": "api", "script": "api", "exec_mode": "fork_mode",
                 "restart_delay": 250, "min_uptime": 1000 } ] }"#,
        );

        let configs = ProcessConfig::from_file(&path).unwrap();
        assert_eq!(configs[0].exec_mode, ExecMode::Fork);
        assert_eq!(configs[0].restart_delay_ms, 250);
        assert_eq!(configs[0].min_uptime_ms, 1000);
    }

    #[test]
    fn test_cluster_mode_rejected() {
        let mut config = ProcessConfig::new("api", "api");
        config.exec_mode = ExecMode::Cluster;
        assert!(matches!(config.validate(), Err(KeeperError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_bad_fields() {
        let mut config = ProcessConfig::new("api", "api");
        config.max_restarts = Some(0);
        assert!(config.validate().is_err());

        let mut config = ProcessConfig::new("api", "api");
        config.max_memory_restart = Some(MemoryQuantity::Text("lots".to_string()));
        assert!(config.validate().is_err());

        let mut config = ProcessConfig::new("api", "api");
        config.backoff_ms = Some(vec![100, 50]);
        assert!(config.validate().is_err());

        let mut config = ProcessConfig::new("api", "api");
        config.stop_signal = "SIGSTOP".to_string();
        assert!(config.validate().is_err());

        let mut config = ProcessConfig::new("a/b", "api");
        assert!(config.validate().is_err());
        config.name = String::new();
        assert!(matches!(
            config.validate(),
            Err(KeeperError::MissingConfigField(_))
        ));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "dup.json",
            r#"[ ]"#,
        );
        assert!(ProcessConfig::from_file(&path).is_err());

        let path = write(
            &dir,
            "dup2.json",
            r#"{ "apps": [ { "name": "x", "script": "a" }, { "name": "x", "script": "b" } ] }"#,
        );
        assert!(matches!(
            ProcessConfig::from_file(&path),
            Err(KeeperError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_unsupported_extension() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "app.yaml", "name: x");
        assert!(matches!(
            ProcessConfig::from_file(&path),
            Err(KeeperError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_resolve_relative_paths() {
        let mut config = ProcessConfig::new("pichub-api", "./pichub-api");
        config.cwd = Some(PathBuf::from("./dist"));

        let (spec, policy) = config.resolve(Path::new("/srv/app")).unwrap();
        assert_eq!(spec.cwd, PathBuf::from("/srv/app/dist"));
        assert_eq!(spec.executable, PathBuf::from("/srv/app/dist/pichub-api"));
        assert_eq!(spec.kill_timeout, Duration::from_secs(5));
        assert!(policy.autorestart);
    }

    #[test]
    fn test_resolve_absolute_paths_win() {
        let mut config = ProcessConfig::new("x", "/usr/bin/env");
        config.cwd = Some(PathBuf::from("/tmp/../var"));

        let (spec, _) = config.resolve(Path::new("/srv/app")).unwrap();
        assert_eq!(spec.cwd, PathBuf::from("/var"));
        assert_eq!(spec.executable, PathBuf::from("/usr/bin/env"));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("KEEPER_TEST_PORT", "8080");

        assert_eq!(expand_env_in_string("--port=$KEEPER_TEST_PORT"), "--port=8080");
        assert_eq!(expand_env_in_string("${KEEPER_TEST_PORT}0"), "80800");
        assert_eq!(
            expand_env_in_string("$KEEPER_TEST_UNSET_VAR/x"),
            "$KEEPER_TEST_UNSET_VAR/x"
        );
        assert_eq!(
            expand_env_in_string("${KEEPER_TEST_UNSET_VAR}"),
            "${KEEPER_TEST_UNSET_VAR}"
        );
        assert_eq!(expand_env_in_string("cost: $5 ${"), "cost: $5 ${");
    }

    #[test]
    fn test_load_resolves_against_config_dir() {
        let dir = TempDir::new().unwrap();
        let path = write(
            &dir,
            "app.toml",
            "name = \"api\"\nscript = \"./bin/api\"\ncwd = \"dist\"\n",
        );

        let loaded = load(&path).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0.executable, dir.path().join("dist/bin/api"));
    }
}
