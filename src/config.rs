use dirs::home_dir;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::DeskError;

pub(crate) const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
pub(crate) const CONFIG_VERSION: u32 = 1;

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    pub(crate) version: u32,
    pub(crate) paths: Paths,
    pub(crate) dependency: DependencyConfig,
    pub(crate) backend: BackendConfig,
    pub(crate) lifecycle: LifecycleConfig,
    pub(crate) ui: UiConfig,
    pub(crate) update: UpdateConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Paths {
    pub(crate) cache_root: String,
    pub(crate) state_dir: String,
    pub(crate) generations_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct DependencyConfig {
    pub(crate) package: String,
    pub(crate) version: String,
    pub(crate) executable: String,
    pub(crate) auth_marker: String,
    pub(crate) auth_wait_ms: u64,
    pub(crate) auth_poll_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct BackendConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) executable: String,
    pub(crate) args: Vec<String>,
    pub(crate) dependency_env: String,
    pub(crate) log_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct LifecycleConfig {
    pub(crate) poll_interval_ms: u64,
    pub(crate) ready_timeout_ms: u64,
    pub(crate) grace_period_ms: u64,
    pub(crate) fatal_error_delay_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct UiConfig {
    pub(crate) path: String,
    pub(crate) open_browser: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct UpdateConfig {
    pub(crate) enabled: bool,
    pub(crate) release_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            paths: Paths::default(),
            dependency: DependencyConfig::default(),
            backend: BackendConfig::default(),
            lifecycle: LifecycleConfig::default(),
            ui: UiConfig::default(),
            update: UpdateConfig::default(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            cache_root: "~/.geminidesk/gemini-cli".to_string(),
            state_dir: "~/.geminidesk/state".to_string(),
            generations_dir: "~/GeminiDesk".to_string(),
        }
    }
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            package: "@google/gemini-cli".to_string(),
            version: "latest".to_string(),
            executable: "gemini".to_string(),
            auth_marker: "~/.gemini/oauth_creds.json".to_string(),
            auth_wait_ms: 3000,
            auth_poll_ms: 250,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
            executable: String::new(),
            args: Vec::new(),
            dependency_env: "GEMINI_PATH".to_string(),
            log_file: String::new(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            ready_timeout_ms: 0,
            grace_period_ms: 2000,
            fatal_error_delay_ms: 3000,
        }
    }
}

impl Default for UiConfig {
    fn default() -> Self {
        Self {
            path: "/index.html".to_string(),
            open_browser: true,
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            release_url: String::new(),
        }
    }
}

impl DependencyConfig {
    /// `<package>@<version>` as passed to `npm install --global`.
    pub(crate) fn install_spec(&self) -> String {
        let version = self.version.trim();
        if version.is_empty() {
            self.package.clone()
        } else {
            format!("{}@{}", self.package, version)
        }
    }
}

impl BackendConfig {
    pub(crate) fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl LifecycleConfig {
    pub(crate) fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub(crate) fn ready_timeout(&self) -> Option<Duration> {
        if self.ready_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.ready_timeout_ms))
        }
    }

    pub(crate) fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub(crate) fn fatal_error_delay(&self) -> Duration {
        Duration::from_millis(self.fatal_error_delay_ms)
    }
}

impl Config {
    pub(crate) fn ui_url(&self) -> String {
        format!(
            "http://{}:{}{}",
            self.backend.host, self.backend.port, self.ui.path
        )
    }
}

/// How the launcher locates its bundled runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum LaunchMode {
    Auto,
    Packaged,
    Development,
}

impl LaunchMode {
    pub(crate) fn resolve(flag: Option<LaunchMode>) -> Result<LaunchMode, DeskError> {
        let requested = match flag {
            Some(mode) => mode,
            None => match env::var("GEMINIDESK_MODE") {
                Ok(value) if !value.trim().is_empty() => parse_mode(&value)?,
                _ => LaunchMode::Auto,
            },
        };
        Ok(match requested {
            LaunchMode::Auto => {
                if cfg!(debug_assertions) {
                    LaunchMode::Development
                } else {
                    LaunchMode::Packaged
                }
            }
            other => other,
        })
    }

    pub(crate) fn is_packaged(&self) -> bool {
        *self == LaunchMode::Packaged
    }

    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            LaunchMode::Auto => "auto",
            LaunchMode::Packaged => "packaged",
            LaunchMode::Development => "development",
        }
    }
}

fn parse_mode(value: &str) -> Result<LaunchMode, DeskError> {
    match value.trim().to_lowercase().as_str() {
        "auto" => Ok(LaunchMode::Auto),
        "packaged" => Ok(LaunchMode::Packaged),
        "development" | "dev" => Ok(LaunchMode::Development),
        other => Err(DeskError::Config(format!(
            "GEMINIDESK_MODE must be auto, packaged or development (got '{other}')"
        ))),
    }
}

/// Every filesystem location the launcher touches, with `~/` expanded.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedPaths {
    pub(crate) home: PathBuf,
    pub(crate) cache_root: PathBuf,
    pub(crate) state_dir: PathBuf,
    pub(crate) generations_dir: PathBuf,
    pub(crate) auth_marker: PathBuf,
    pub(crate) backend_log_file: Option<PathBuf>,
}

impl ResolvedPaths {
    pub(crate) fn instance_pid_path(&self) -> PathBuf {
        self.state_dir.join("geminidesk.pid")
    }

    pub(crate) fn backend_pid_path(&self) -> PathBuf {
        self.state_dir.join("backend.pid")
    }

    pub(crate) fn journal_path(&self) -> PathBuf {
        self.state_dir.join("logs").join("lifecycle.jsonl")
    }
}

pub(crate) fn resolve_paths(cfg: &Config) -> Result<ResolvedPaths, DeskError> {
    let home = required_home_dir()?;
    let backend_log_file = if cfg.backend.log_file.trim().is_empty() {
        None
    } else {
        Some(expand_home_path(
            &cfg.backend.log_file,
            &home,
            "backend.log_file",
        )?)
    };
    Ok(ResolvedPaths {
        cache_root: expand_home_path(&cfg.paths.cache_root, &home, "paths.cache_root")?,
        state_dir: expand_home_path(&cfg.paths.state_dir, &home, "paths.state_dir")?,
        generations_dir: expand_home_path(
            &cfg.paths.generations_dir,
            &home,
            "paths.generations_dir",
        )?,
        auth_marker: expand_home_path(
            &cfg.dependency.auth_marker,
            &home,
            "dependency.auth_marker",
        )?,
        backend_log_file,
        home,
    })
}

pub(crate) fn required_home_dir() -> Result<PathBuf, DeskError> {
    let home = home_dir().ok_or_else(|| {
        DeskError::Config("unable to resolve $HOME; set HOME to an existing directory".to_string())
    })?;
    if !home.is_absolute() {
        return Err(DeskError::Config(format!(
            "resolved HOME path is not absolute: {}",
            home.display()
        )));
    }
    Ok(home)
}

pub(crate) fn expand_home_path(input: &str, home: &Path, field: &str) -> Result<PathBuf, DeskError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DeskError::Config(format!("{field} must be a non-empty path")));
    }
    if trimmed == "~" {
        return Ok(home.to_path_buf());
    }
    if let Some(stripped) = trimmed.strip_prefix("~/") {
        return Ok(home.join(stripped));
    }
    if trimmed.starts_with('~') {
        return Err(DeskError::Config(format!(
            "{field} uses unsupported '~' syntax; use '~/' or an absolute path"
        )));
    }
    let path = PathBuf::from(trimmed);
    if !path.is_absolute() {
        return Err(DeskError::Config(format!(
            "{field} must be an absolute path: {}",
            path.display()
        )));
    }
    Ok(path)
}

pub(crate) fn read_config_from_str(content: &str) -> Result<Config, DeskError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    if cfg.version != CONFIG_VERSION {
        return Err(DeskError::Config(format!(
            "unsupported config version {}",
            cfg.version
        )));
    }
    validate_config(&cfg)?;
    Ok(cfg)
}

pub(crate) fn read_config(path: &Path) -> Result<Config, DeskError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

/// A missing config file means built-in defaults.
pub(crate) fn load_config(path: &Path) -> Result<Config, DeskError> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

pub(crate) fn validate_config(cfg: &Config) -> Result<(), DeskError> {
    let home = required_home_dir()?;
    expand_home_path(&cfg.paths.cache_root, &home, "paths.cache_root")?;
    expand_home_path(&cfg.paths.state_dir, &home, "paths.state_dir")?;
    expand_home_path(&cfg.paths.generations_dir, &home, "paths.generations_dir")?;
    expand_home_path(&cfg.dependency.auth_marker, &home, "dependency.auth_marker")?;
    if !cfg.backend.log_file.trim().is_empty() {
        expand_home_path(&cfg.backend.log_file, &home, "backend.log_file")?;
    }
    if cfg.dependency.package.trim().is_empty() {
        return Err(DeskError::Config(
            "dependency.package must be non-empty".to_string(),
        ));
    }
    if cfg.dependency.executable.trim().is_empty() {
        return Err(DeskError::Config(
            "dependency.executable must be non-empty".to_string(),
        ));
    }
    if cfg.dependency.auth_poll_ms == 0 {
        return Err(DeskError::Config(
            "dependency.auth_poll_ms must be greater than 0".to_string(),
        ));
    }
    if cfg.backend.host.trim().is_empty() {
        return Err(DeskError::Config("backend.host must be non-empty".to_string()));
    }
    if cfg.backend.port == 0 {
        return Err(DeskError::Config(
            "backend.port must be greater than 0".to_string(),
        ));
    }
    if cfg.backend.dependency_env.trim().is_empty() || cfg.backend.dependency_env.contains('=') {
        return Err(DeskError::Config(
            "backend.dependency_env must be a non-empty variable name".to_string(),
        ));
    }
    if cfg.lifecycle.poll_interval_ms == 0 {
        return Err(DeskError::Config(
            "lifecycle.poll_interval_ms must be greater than 0".to_string(),
        ));
    }
    if !cfg.ui.path.starts_with('/') {
        return Err(DeskError::Config(format!(
            "ui.path must start with '/' (got '{}')",
            cfg.ui.path
        )));
    }
    Ok(())
}

pub(crate) fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("GEMINIDESK_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("geminidesk");
    base
}

pub(crate) fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("GEMINIDESK_CONFIG") {
        return PathBuf::from(path);
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn looks_like_resources_dir(candidate: &Path) -> bool {
    candidate.join("bin").is_dir()
}

pub(crate) fn resources_dir_from_exe_path(exe: &Path) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    let mut push_candidate = |candidate: PathBuf| {
        if !candidates.iter().any(|existing| existing == &candidate) {
            candidates.push(candidate);
        }
    };

    let mut parents: Vec<PathBuf> = Vec::new();
    if let Some(parent) = exe.parent() {
        parents.push(parent.to_path_buf());
    }
    if let Ok(link_target) = fs::read_link(exe) {
        let resolved_target = if link_target.is_absolute() {
            link_target
        } else {
            exe.parent()
                .map_or_else(|| PathBuf::from("."), PathBuf::from)
                .join(link_target)
        };
        if let Some(parent) = resolved_target.parent() {
            parents.push(parent.to_path_buf());
        }
    }
    if let Ok(canonical_exe) = fs::canonicalize(exe) {
        if let Some(parent) = canonical_exe.parent() {
            parents.push(parent.to_path_buf());
        }
    }

    for parent in parents {
        push_candidate(parent.clone());
        push_candidate(parent.join("resources"));
        // macOS app bundles: Contents/MacOS/<exe> next to Contents/Resources.
        if let Some(contents) = parent.parent() {
            push_candidate(contents.join("Resources"));
        }
    }

    candidates
        .into_iter()
        .find(|candidate| looks_like_resources_dir(candidate))
}

pub(crate) fn resolve_resources_dir(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("GEMINIDESK_RESOURCES_DIR") {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    if let Ok(exe) = env::current_exe() {
        if let Some(candidate) = resources_dir_from_exe_path(&exe) {
            return candidate;
        }
    }
    env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}

pub(crate) fn ensure_parent(path: &Path) -> Result<(), DeskError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
unknown: true
"#;
        let err = read_config_from_str(yaml).unwrap_err();
        assert!(err.to_string().contains("unknown field"));
    }

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1\n").unwrap();
        assert_eq!(cfg.backend.port, 8001);
        assert_eq!(cfg.backend.host, "127.0.0.1");
        assert_eq!(cfg.lifecycle.poll_interval_ms, 250);
        assert_eq!(cfg.lifecycle.grace_period_ms, 2000);
        assert_eq!(cfg.dependency.install_spec(), "@google/gemini-cli@latest");
        assert_eq!(cfg.ui_url(), "http://127.0.0.1:8001/index.html");
        assert!(cfg.lifecycle.ready_timeout().is_none());
    }

    #[test]
    fn embedded_template_parses_and_matches_defaults() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).unwrap();
        let defaults = Config::default();
        assert_eq!(cfg.paths.cache_root, defaults.paths.cache_root);
        assert_eq!(cfg.dependency.auth_marker, defaults.dependency.auth_marker);
        assert_eq!(cfg.backend.port, defaults.backend.port);
        assert_eq!(cfg.update.release_url, defaults.update.release_url);
    }

    #[test]
    fn config_rejects_wrong_version() {
        let err = read_config_from_str("version: 7\n").unwrap_err();
        assert!(err.to_string().contains("unsupported config version 7"));
    }

    #[test]
    fn config_rejects_zero_port_and_bad_ui_path() {
        let err = read_config_from_str("version: 1\nbackend:\n  port: 0\n").unwrap_err();
        assert!(err.to_string().contains("backend.port"));
        let err = read_config_from_str("version: 1\nui:\n  path: index.html\n").unwrap_err();
        assert!(err.to_string().contains("ui.path"));
    }

    #[test]
    fn expand_tilde_works() {
        let home = PathBuf::from("/home/tester");
        assert_eq!(
            expand_home_path("~/cache", &home, "field").unwrap(),
            PathBuf::from("/home/tester/cache")
        );
        assert_eq!(expand_home_path("~", &home, "field").unwrap(), home);
        assert!(expand_home_path("~other/cache", &home, "field").is_err());
        assert!(expand_home_path("relative/dir", &home, "field").is_err());
        assert!(expand_home_path("  ", &home, "field").is_err());
    }

    #[test]
    fn ready_timeout_zero_means_unbounded() {
        let mut lifecycle = LifecycleConfig::default();
        assert_eq!(lifecycle.ready_timeout(), None);
        lifecycle.ready_timeout_ms = 1500;
        assert_eq!(lifecycle.ready_timeout(), Some(Duration::from_millis(1500)));
    }

    #[test]
    fn explicit_launch_mode_wins_over_auto() {
        assert_eq!(
            LaunchMode::resolve(Some(LaunchMode::Packaged)).unwrap(),
            LaunchMode::Packaged
        );
        assert_eq!(
            LaunchMode::resolve(Some(LaunchMode::Development)).unwrap(),
            LaunchMode::Development
        );
        assert!(parse_mode("bogus").is_err());
        assert_eq!(parse_mode("dev").unwrap(), LaunchMode::Development);
    }

    #[test]
    fn resources_dir_found_next_to_executable() {
        let dir = tempdir().unwrap();
        let app_dir = dir.path().join("app");
        fs::create_dir_all(app_dir.join("bin")).unwrap();
        let exe = app_dir.join("geminidesk");
        fs::write(&exe, "").unwrap();
        assert_eq!(resources_dir_from_exe_path(&exe), Some(app_dir));
    }

    #[test]
    fn resources_dir_found_in_macos_bundle() {
        let dir = tempdir().unwrap();
        let contents = dir.path().join("GeminiDesk.app").join("Contents");
        fs::create_dir_all(contents.join("MacOS")).unwrap();
        fs::create_dir_all(contents.join("Resources").join("bin")).unwrap();
        let exe = contents.join("MacOS").join("geminidesk");
        fs::write(&exe, "").unwrap();
        assert_eq!(
            resources_dir_from_exe_path(&exe),
            Some(contents.join("Resources"))
        );
    }
}
