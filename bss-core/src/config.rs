//! Bridge configuration.
//!
//! # Storage layout
//!
//! ```text
//! ~/.apsbss/
//!   config.yaml      (mode 0600, written by `apsbss init`)
//! ```
//!
//! Like the rest of the crate, every filesystem function comes in two forms:
//! `fn_at(home, …)` with an explicit home (tests use a `TempDir`) and `fn(…)`
//! which resolves `dirs::home_dir()` and delegates.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::{BeamlineName, SectorId};

pub const DEFAULT_SCHEDULING_URL: &str =
    "https://beam-api.aps.anl.gov/beamline-scheduling/sched-api";
pub const DEFAULT_ESAF_URL: &str = "https://xraydtn01.xray.aps.anl.gov:11236";

// ---------------------------------------------------------------------------
// 1. File format
// ---------------------------------------------------------------------------

/// On-disk configuration, as written to `config.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beamline: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    pub interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub backoff: BackoffConfig,
    pub selection: SelectionConfig,
    pub no_active_status: IdleStatus,
    pub clear_on_stop: bool,
    pub upstream: UpstreamConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            beamline: None,
            sector: None,
            prefix: None,
            interval_secs: 60,
            fetch_timeout_secs: 10,
            backoff: BackoffConfig::default(),
            selection: SelectionConfig::default(),
            no_active_status: IdleStatus::Ok,
            clear_on_stop: false,
            upstream: UpstreamConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub base_secs: u64,
    pub max_secs: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self { base_secs: 5, max_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionConfig {
    /// ESAF status string that wins over every other status.
    pub preferred_esaf_status: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self { preferred_esaf_status: "Approved".to_owned() }
    }
}

/// Status to publish when the fetch succeeded but nothing is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleStatus {
    #[default]
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub scheduling_url: String,
    pub esaf_url: String,
    /// Text file holding `username password`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            scheduling_url: DEFAULT_SCHEDULING_URL.to_owned(),
            esaf_url: DEFAULT_ESAF_URL.to_owned(),
            credentials_file: None,
        }
    }
}

/// Username and password for HTTP basic auth.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

impl UpstreamConfig {
    /// Reads the credentials file, if one is configured.
    pub fn credentials(&self) -> Result<Option<Credentials>, ConfigError> {
        let Some(path) = &self.credentials_file else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Credentials {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let mut words = text.split_whitespace();
        match (words.next(), words.next()) {
            (Some(username), Some(password)) => Ok(Some(Credentials {
                username: username.to_owned(),
                password: password.to_owned(),
            })),
            _ => Err(ConfigError::Credentials {
                path: path.clone(),
                reason: "expected `username password`".to_owned(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// 2. Validation
// ---------------------------------------------------------------------------

/// Validated settings the sync loop runs on.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub beamline: Option<BeamlineName>,
    pub sector: SectorId,
    pub prefix: String,
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub preferred_esaf_status: String,
    pub idle_status: IdleStatus,
    pub clear_on_stop: bool,
    pub upstream: UpstreamConfig,
}

impl Config {
    /// Checks the configuration and derives the missing pieces.
    ///
    /// Fails with [`ConfigError::MissingSector`] when no sector is given and
    /// the beamline has no numeric prefix, and with
    /// [`ConfigError::InvalidInterval`] for zero durations or a backoff base
    /// above its cap.
    pub fn validate(&self) -> Result<Settings, ConfigError> {
        let beamline = self
            .beamline
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .map(BeamlineName::from);

        let sector = match self.sector.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => SectorId::normalized(s),
            _ => beamline
                .as_ref()
                .and_then(|b| SectorId::from_beamline(&b.0))
                .ok_or_else(|| ConfigError::MissingSector {
                    beamline: self.beamline.clone(),
                })?,
        };

        for (name, value) in [
            ("interval_secs", self.interval_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("backoff.base_secs", self.backoff.base_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::InvalidInterval { name, value });
            }
        }
        if self.backoff.max_secs < self.backoff.base_secs {
            return Err(ConfigError::InvalidInterval {
                name: "backoff.max_secs",
                value: self.backoff.max_secs,
            });
        }

        let prefix = self
            .prefix
            .clone()
            .unwrap_or_else(|| format!("{}:bss:", sector.0));

        Ok(Settings {
            beamline,
            sector,
            prefix,
            interval: Duration::from_secs(self.interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            backoff_base: Duration::from_secs(self.backoff.base_secs),
            backoff_max: Duration::from_secs(self.backoff.max_secs),
            preferred_esaf_status: self.selection.preferred_esaf_status.clone(),
            idle_status: self.no_active_status,
            clear_on_stop: self.clear_on_stop,
            upstream: self.upstream.clone(),
        })
    }
}

// ---------------------------------------------------------------------------
// 3. Paths, load, save
// ---------------------------------------------------------------------------

/// `<home>/.apsbss/`
pub fn apsbss_root(home: &Path) -> PathBuf {
    home.join(".apsbss")
}

/// `<home>/.apsbss/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    apsbss_root(home).join("config.yaml")
}

/// Returns `ConfigError::NotFound` if absent, `ConfigError::Parse` with the
/// path if the YAML is malformed.
pub fn load_at(home: &Path) -> Result<Config, ConfigError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Err(ConfigError::NotFound { path });
    }
    let contents = std::fs::read_to_string(&path)?;
    serde_yaml::from_str(&contents).map_err(|e| ConfigError::Parse { path, source: e })
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<Config, ConfigError> {
    load_at(&home()?)
}

/// Atomically writes `config.yaml`: `.tmp` sibling, `chmod 0600`, `rename`.
pub fn save_at(home: &Path, config: &Config) -> Result<PathBuf, ConfigError> {
    let root = apsbss_root(home);
    if !root.exists() {
        std::fs::create_dir_all(&root)?;
        set_dir_permissions(&root)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name("config.yaml.tmp");

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// `save_at` convenience wrapper.
pub fn save(config: &Config) -> Result<PathBuf, ConfigError> {
    save_at(&home()?, config)
}

pub fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), ConfigError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), ConfigError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
