use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;

use crate::error::FleetError;
use crate::paths;

pub const DEFAULT_CHANNELS: &[&str] = &["alpha", "beta", "stable"];
pub const DEFAULT_ARTIFACTS: &[&str] = &["vmlinuz", "initrd.cpio.gz"];

/// Images assembled before this instant (2016-04-20T00:00:00Z) use an older
/// on-disk layout and are rebuilt.
pub const LATEST_FORMAT_BREAK_UNIX: u64 = 1_461_110_400;

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct DaemonConfig {
    #[facet(default = "127.0.0.1:2511")]
    pub listen: String,
    #[facet(default)]
    pub store_root: Option<String>,
    #[facet(default)]
    pub run_root: Option<String>,
    #[facet(default = "flotilla-runner")]
    pub runner: String,
    #[facet(default)]
    pub channels: Option<Vec<String>>,
    #[facet(default)]
    pub images: ImagesConfig,
    #[facet(default)]
    pub timeouts: TimeoutsConfig,
    #[facet(default)]
    pub resources: ResourcesConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: flotilla_proto::DEFAULT_ADDR.into(),
            store_root: None,
            run_root: None,
            runner: "flotilla-runner".into(),
            channels: None,
            images: ImagesConfig::default(),
            timeouts: TimeoutsConfig::default(),
            resources: ResourcesConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ImagesConfig {
    /// Files every image version directory must contain.
    #[facet(default)]
    pub artifacts: Option<Vec<String>>,
    #[facet(default = 1461110400)]
    pub stale_before_unix: u64,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            artifacts: None,
            stale_before_unix: LATEST_FORMAT_BREAK_UNIX,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct TimeoutsConfig {
    #[facet(default = 30)]
    pub boot_s: u64,
    #[facet(default = 100)]
    pub probe_ms: u64,
    #[facet(default = 40)]
    pub call_s: u64,
    #[facet(default = 3)]
    pub reap_grace_s: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            boot_s: 30,
            probe_ms: 100,
            call_s: 40,
            reap_grace_s: 3,
        }
    }
}

#[derive(Debug, Clone, Facet)]
#[facet(default)]
pub struct ResourcesConfig {
    #[facet(default = 1024)]
    pub min_memory_mb: u64,
    #[facet(default = 8192)]
    pub max_memory_mb: u64,
    /// Share of host physical memory all VMs together may claim.
    #[facet(default = 66)]
    pub host_memory_share_pct: u64,
    /// Fixed ceiling; overrides the host share when set.
    #[facet(default)]
    pub max_total_memory_mb: Option<u64>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            min_memory_mb: 1024,
            max_memory_mb: 8192,
            host_memory_share_pct: 66,
            max_total_memory_mb: None,
        }
    }
}

impl DaemonConfig {
    pub fn listen_addr(&self) -> Result<SocketAddr, FleetError> {
        self.listen.parse().map_err(|_| FleetError::Validation {
            message: format!("listen must be an ip:port pair (got '{}')", self.listen),
        })
    }

    pub fn store_root(&self) -> PathBuf {
        self.store_root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::default_store_root)
    }

    pub fn run_root(&self) -> PathBuf {
        self.run_root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(paths::default_run_root)
    }

    pub fn channels(&self) -> Vec<String> {
        match &self.channels {
            Some(c) => c.clone(),
            None => DEFAULT_CHANNELS.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn artifacts(&self) -> Vec<String> {
        match &self.images.artifacts {
            Some(a) => a.clone(),
            None => DEFAULT_ARTIFACTS.iter().map(|a| a.to_string()).collect(),
        }
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.boot_s)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.probe_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.call_s)
    }

    pub fn reap_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.reap_grace_s)
    }
}

// ── validation ────────────────────────────────────────────

fn validate_config(config: &DaemonConfig) -> Result<(), FleetError> {
    let addr = config.listen_addr()?;
    if !addr.ip().is_loopback() {
        return Err(FleetError::Validation {
            message: format!("listen must be a loopback address (got '{addr}')"),
        });
    }

    let channels = config.channels();
    if channels.is_empty() {
        return Err(FleetError::Validation {
            message: "at least one channel is required".into(),
        });
    }
    for channel in &channels {
        validate_name(channel)?;
    }

    let artifacts = config.artifacts();
    if artifacts.is_empty() {
        return Err(FleetError::Validation {
            message: "images.artifacts must name at least one file".into(),
        });
    }
    for artifact in &artifacts {
        if artifact.is_empty() || artifact.contains('/') {
            return Err(FleetError::Validation {
                message: format!("images.artifacts entries must be plain file names (got '{artifact}')"),
            });
        }
    }

    if config.runner.is_empty() {
        return Err(FleetError::Validation {
            message: "runner must not be empty".into(),
        });
    }

    let res = &config.resources;
    if res.min_memory_mb == 0 || res.min_memory_mb > res.max_memory_mb {
        return Err(FleetError::Validation {
            message: format!(
                "resources.min_memory_mb ({}) must be positive and not above max_memory_mb ({})",
                res.min_memory_mb, res.max_memory_mb
            ),
        });
    }
    if res.host_memory_share_pct == 0 || res.host_memory_share_pct > 100 {
        return Err(FleetError::Validation {
            message: "resources.host_memory_share_pct must be within 1..=100".into(),
        });
    }

    if config.timeouts.boot_s == 0 {
        return Err(FleetError::Validation {
            message: "timeouts.boot_s must be at least 1".into(),
        });
    }
    if config.timeouts.call_s <= config.timeouts.boot_s {
        return Err(FleetError::Validation {
            message: "timeouts.call_s must exceed timeouts.boot_s".into(),
        });
    }

    Ok(())
}

fn validate_name(name: &str) -> Result<(), FleetError> {
    let valid = name
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-');
    if !valid {
        return Err(FleetError::Validation {
            message: format!("channel name must match [a-zA-Z0-9][a-zA-Z0-9._-]* (got '{name}')"),
        });
    }
    Ok(())
}

// ── public API ────────────────────────────────────────────

/// Load the daemon config. A missing file means "all defaults".
pub fn load_config(path: &Path) -> Result<DaemonConfig, FleetError> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        let config = DaemonConfig::default();
        validate_config(&config)?;
        return Ok(config);
    }

    let contents = std::fs::read_to_string(path).map_err(|source| FleetError::ConfigLoad {
        path: path.display().to_string(),
        source,
    })?;

    let config = parse_config(&contents).map_err(|message| FleetError::ConfigParse {
        path: path.display().to_string(),
        message,
    })?;

    validate_config(&config)?;
    Ok(config)
}

fn parse_config(contents: &str) -> Result<DaemonConfig, String> {
    facet_toml::from_str::<DaemonConfig>(contents).map_err(|e| e.to_string())
}

#[cfg(test)]
pub mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = DaemonConfig::default();
        validate_config(&config).unwrap();
        assert_eq!(config.listen, "127.0.0.1:2511");
        assert_eq!(config.channels(), vec!["alpha", "beta", "stable"]);
        assert_eq!(config.artifacts(), vec!["vmlinuz", "initrd.cpio.gz"]);
        assert_eq!(config.boot_timeout(), Duration::from_secs(30));
        assert_eq!(config.probe_timeout(), Duration::from_millis(100));
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
store_root = "/srv/images"
channels = ["edge", "lts"]

[timeouts]
boot_s = 10
call_s = 20

[resources]
max_total_memory_mb = 12000
"#;
        let config = parse_config(toml).unwrap();
        validate_config(&config).unwrap();
        assert_eq!(config.store_root(), PathBuf::from("/srv/images"));
        assert_eq!(config.channels(), vec!["edge", "lts"]);
        assert_eq!(config.timeouts.boot_s, 10);
        assert_eq!(config.timeouts.reap_grace_s, 3);
        assert_eq!(config.resources.min_memory_mb, 1024);
        assert_eq!(config.resources.max_total_memory_mb, Some(12000));
        assert_eq!(config.listen, "127.0.0.1:2511");
    }

    #[test]
    fn non_loopback_listen_rejected() {
        let config = DaemonConfig {
            listen: "0.0.0.0:2511".into(),
            ..DaemonConfig::default()
        };
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn inverted_memory_bounds_rejected() {
        let mut config = DaemonConfig::default();
        config.resources.min_memory_mb = 9000;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn call_timeout_must_cover_boot_deadline() {
        let mut config = DaemonConfig::default();
        config.timeouts.call_s = 30;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn invalid_channel_names() {
        for name in ["", "-bad", "../etc", "a/b", "hello world"] {
            assert!(
                validate_name(name).is_err(),
                "expected channel '{name}' to be rejected"
            );
        }
        validate_name("stable").unwrap();
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.runner, "flotilla-runner");
    }

    #[test]
    fn malformed_file_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.toml");
        std::fs::write(&path, "listen = [").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, FleetError::ConfigParse { .. }), "{err:?}");
    }
}
