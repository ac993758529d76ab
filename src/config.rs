//! Engine Configuration
//!
//! Engine-wide options loaded from defaults, a TOML file and `FERRY_`
//! environment variables. Unknown keys are rejected at extraction time.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use figment::providers::Format;
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Effectively-unlimited concurrency cap.
pub const UNLIMITED: usize = 1 << 20;

/// Default connect/request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// Default resource (whole transfer) timeout in seconds (~4 h).
pub const DEFAULT_RESOURCE_TIMEOUT_SECS: u64 = 4 * 60 * 60;

/// Proxy endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub address: String,
    pub port: u16,
}

/// Foreground-mode preference, carried for the notification collaborator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForegroundMode {
    Always,
    Never,
    /// Foreground only for files larger than the configured threshold
    Auto,
}

impl Default for ForegroundMode {
    fn default() -> Self {
        Self::Auto
    }
}

/// Base locations tasks resolve their destination against
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BaseDirs {
    pub documents: PathBuf,
    pub temporary: PathBuf,
    pub support: PathBuf,
    pub library: PathBuf,
}

impl Default for BaseDirs {
    fn default() -> Self {
        let home = data_home();
        Self {
            documents: home.join("documents"),
            temporary: env::temp_dir(),
            support: home.join("support"),
            library: home.join("library"),
        }
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineConfig {
    /// Connect/request timeout in seconds
    pub request_timeout_secs: u64,

    /// Total transfer timeout in seconds; tasks with `allow_pause` extend
    /// past this via pause-and-resume
    pub resource_timeout_secs: u64,

    /// Minimum free space in MB required before starting a download;
    /// `None` disables the check
    pub check_available_space_mb: Option<u64>,

    /// Outbound proxy; `None` for direct connections
    pub proxy: Option<ProxyConfig>,

    /// Skip TLS certificate validation. Never honored in release builds.
    pub bypass_tls_certificate_validation: bool,

    /// Foreground-mode hint passed through to the notification collaborator
    pub run_in_foreground: ForegroundMode,

    /// File-size threshold in MB for [`ForegroundMode::Auto`]
    pub run_in_foreground_if_file_larger_than_mb: u64,

    /// Localized strings passed through to the notification collaborator
    pub localize: HashMap<String, String>,

    /// Global concurrent-transfer cap
    pub max_concurrent: usize,

    /// Per-host concurrent-transfer cap
    pub max_concurrent_by_host: usize,

    /// Per-group concurrent-transfer cap
    pub max_concurrent_by_group: usize,

    /// Root directory of the persistent store
    pub store_dir: PathBuf,

    /// Base locations for task destinations
    pub base_dirs: BaseDirs,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            resource_timeout_secs: DEFAULT_RESOURCE_TIMEOUT_SECS,
            check_available_space_mb: None,
            proxy: None,
            bypass_tls_certificate_validation: false,
            run_in_foreground: ForegroundMode::default(),
            run_in_foreground_if_file_larger_than_mb: 256,
            localize: HashMap::new(),
            max_concurrent: UNLIMITED,
            max_concurrent_by_host: UNLIMITED,
            max_concurrent_by_group: UNLIMITED,
            store_dir: data_home().join("store"),
            base_dirs: BaseDirs::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: defaults, then the TOML file, then `FERRY_` env.
    ///
    /// Unknown keys anywhere in the stack produce an error.
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self, figment::Error> {
        let mut figment =
            Figment::new().merge(figment::providers::Serialized::defaults(Self::default()));
        if let Some(path) = config_path {
            figment = figment.merge(figment::providers::Toml::file(path));
        }
        // FERRY_HOME selects the data root (see `data_home`), it is not a
        // config key
        figment
            .merge(
                figment::providers::Env::prefixed("FERRY_")
                    .ignore(&["home"])
                    .split("__"),
            )
            .extract()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn resource_timeout(&self) -> Duration {
        Duration::from_secs(self.resource_timeout_secs)
    }

    /// Free-space floor in bytes, when the check is enabled.
    pub fn check_available_space_bytes(&self) -> Option<u64> {
        self.check_available_space_mb.map(|mb| mb * 1024 * 1024)
    }
}

/// Data root: `FERRY_HOME`, else `$HOME/.local/share/ferry`, else cwd-relative.
fn data_home() -> PathBuf {
    if let Ok(home) = env::var("FERRY_HOME") {
        return PathBuf::from(home);
    }
    if let Ok(home) = env::var("HOME") {
        return PathBuf::from(home).join(".local/share/ferry");
    }
    PathBuf::from(".ferry")
}
