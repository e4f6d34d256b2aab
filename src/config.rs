use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::Deserialize;
use tracing::warn;

const CONFIG_FILE_NAME: &str = "config.toml";
const APP_NAME: &str = "carddav";

/// User agent sent when none is configured.
pub const DEFAULT_USER_AGENT: &str = concat!("carddav/", env!("CARGO_PKG_VERSION"));

/// Runtime options for one client.
///
/// Built once by the caller and handed to [`crate::CardDavClient`]; nothing
/// here is global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientOptions {
    /// Verify server certificates on `https`
    pub verify_tls: bool,
    /// Extra PEM root certificate to trust
    pub ca_cert: Option<PathBuf>,
    /// Try to LOCK resources around modify/delete
    pub use_locking: bool,
    pub user_agent: String,
    /// Per-request timeout enforced by the transport
    pub timeout: Option<Duration>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            verify_tls: true,
            ca_cert: None,
            use_locking: true,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub config_path: Option<PathBuf>,
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client: ClientOptions,
}

// =============================================================================
// Config file structure
// =============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    client: ClientFile,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct ClientFile {
    verify_tls: bool,
    ca_cert: Option<String>,
    use_locking: bool,
    user_agent: Option<String>,
    timeout_secs: Option<u64>,
}

impl Default for ClientFile {
    fn default() -> Self {
        let defaults = ClientOptions::default();
        Self {
            verify_tls: defaults.verify_tls,
            ca_cert: None,
            use_locking: defaults.use_locking,
            user_agent: None,
            timeout_secs: None,
        }
    }
}

impl ClientFile {
    fn into_options(self) -> Result<ClientOptions> {
        let ca_cert = self.ca_cert.map(|s| expand_tilde(Path::new(&s)));
        if let Some(path) = &ca_cert {
            if !path.exists() {
                bail!("client.ca_cert does not exist: {}", path.display());
            }
        }

        let user_agent = self
            .user_agent
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        let timeout = match self.timeout_secs {
            Some(0) => bail!("client.timeout_secs must be greater than zero"),
            Some(secs) => Some(Duration::from_secs(secs)),
            None => None,
        };

        Ok(ClientOptions {
            verify_tls: self.verify_tls,
            ca_cert,
            use_locking: self.use_locking,
            user_agent,
            timeout,
        })
    }
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn config_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine base directories")?;
    Ok(base.config_dir().join(APP_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_root()?.join(CONFIG_FILE_NAME))
}

/// Load configuration.
///
/// An explicit path must exist; the default location is optional and its
/// absence yields defaults.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => {
            if !path.exists() {
                bail!("configuration file not found at {}", path.display());
            }
            path.to_path_buf()
        }
        None => {
            let path = config_path()?;
            if !path.exists() {
                return Ok(Config::default());
            }
            path
        }
    };

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;

    let mut config = parse(&raw).with_context(|| format!("invalid configuration in {}", path.display()))?;
    config.config_path = Some(path);
    Ok(config)
}

/// Parse configuration text.
pub fn parse(raw: &str) -> Result<Config> {
    let value: toml::Value = toml::from_str(raw).context("failed to parse configuration as TOML")?;

    warn_unknown_keys(&value);

    let file: ConfigFile = value
        .try_into()
        .context("failed to deserialize configuration")?;

    let url = file
        .url
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty());

    let client = file
        .client
        .into_options()
        .context("failed to parse client configuration")?;

    Ok(Config {
        config_path: None,
        url,
        username: file.username,
        password: file.password,
        client,
    })
}

// =============================================================================
// Unknown key warnings
// =============================================================================

fn warn_unknown_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };

    let known = HashSet::from(["url", "username", "password", "client"]);
    for key in table.keys() {
        if !known.contains(key.as_str()) {
            warn!("unknown configuration key `{}`", key);
        }
    }

    if let Some(client) = table.get("client") {
        warn_unknown_client_keys(client);
    }
}

fn warn_unknown_client_keys(value: &toml::Value) {
    let Some(table) = value.as_table() else {
        return;
    };
    let known = HashSet::from([
        "verify_tls",
        "ca_cert",
        "use_locking",
        "user_agent",
        "timeout_secs",
    ]);
    for key in table.keys() {
        if !known.contains(key.as_str()) {
            warn!("unknown client entry `{}`", key);
        }
    }
}
