use crate::dispatch::ScriptRegistry;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the provisioning daemon
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Admin API server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Locations of every managed resource
    #[serde(default)]
    pub paths: PathsConfig,

    /// Site and alias policy
    #[serde(default)]
    pub sites: SitesConfig,

    /// Generated web-server configuration settings
    #[serde(default)]
    pub vhost: VhostSettings,

    /// Script execution settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Lock acquisition settings for shared files
    #[serde(default)]
    pub locks: LockConfig,

    /// Whitelisted maintenance scripts keyed by name
    #[serde(default)]
    pub scripts: HashMap<String, ScriptConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address for the admin API (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the admin API (default: 9090)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the admin API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// SQLite database holding sites and logs
    #[serde(default = "default_database_path")]
    pub database: PathBuf,

    /// Alias file mapping addresses to domain names
    #[serde(default = "default_hosts_file")]
    pub hosts_file: PathBuf,

    /// Directory for hosts-file backups
    #[serde(default = "default_hosts_backup_dir")]
    pub hosts_backup_dir: PathBuf,

    /// Web-server configuration file holding the generated section
    #[serde(default = "default_vhost_config")]
    pub vhost_config: PathBuf,

    /// Directory for web-server configuration backups
    #[serde(default = "default_vhost_backup_dir")]
    pub vhost_backup_dir: PathBuf,

    /// Parent directory of site document roots
    #[serde(default = "default_sites_root")]
    pub sites_root: PathBuf,

    /// Append-only audit log
    #[serde(default = "default_audit_log")]
    pub audit_log: PathBuf,

    /// Directory holding `<domain>.crt` / `<domain>.key` for SSL sites
    #[serde(default = "default_ssl_dir")]
    pub ssl_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            database: default_database_path(),
            hosts_file: default_hosts_file(),
            hosts_backup_dir: default_hosts_backup_dir(),
            vhost_config: default_vhost_config(),
            vhost_backup_dir: default_vhost_backup_dir(),
            sites_root: default_sites_root(),
            audit_log: default_audit_log(),
            ssl_dir: default_ssl_dir(),
        }
    }
}

/// How alias changes reach the hosts file
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AliasBackendKind {
    /// Edit the hosts file in-process
    #[default]
    File,
    /// Delegate edits to a whitelisted script (`add`/`remove`/`list <domain>`)
    Script,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SitesConfig {
    /// Address local domains are mapped to (default: 127.0.0.1)
    #[serde(default = "default_loopback_address")]
    pub loopback_address: String,

    /// Suffix that marks a local development domain (default: .local)
    #[serde(default = "default_local_suffix")]
    pub local_suffix: String,

    /// Domains that back the management interface and can never be removed
    #[serde(default = "default_protected_domains")]
    pub protected_domains: Vec<String>,

    #[serde(default)]
    pub alias_backend: AliasBackendKind,

    /// Script name used when `alias_backend = "script"`
    pub alias_script: Option<String>,
}

impl Default for SitesConfig {
    fn default() -> Self {
        Self {
            loopback_address: default_loopback_address(),
            local_suffix: default_local_suffix(),
            protected_domains: default_protected_domains(),
            alias_backend: AliasBackendKind::default(),
            alias_script: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct VhostSettings {
    #[serde(default = "default_begin_marker")]
    pub begin_marker: String,

    #[serde(default = "default_end_marker")]
    pub end_marker: String,

    /// FastCGI upstream for the PHP pass-through rule
    #[serde(default = "default_php_upstream")]
    pub php_upstream: String,

    /// Index resolution order
    #[serde(default = "default_index")]
    pub index: String,
}

impl Default for VhostSettings {
    fn default() -> Self {
        Self {
            begin_marker: default_begin_marker(),
            end_marker: default_end_marker(),
            php_upstream: default_php_upstream(),
            index: default_index(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatchConfig {
    /// Seconds before a running script is killed (default: 120)
    #[serde(default = "default_script_timeout")]
    pub timeout_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_script_timeout(),
        }
    }
}

impl DispatchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    /// Milliseconds to wait for an exclusive file lock (default: 5000)
    #[serde(default = "default_lock_timeout")]
    pub timeout_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lock_timeout(),
        }
    }
}

impl LockConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// A whitelisted script
#[derive(Debug, Deserialize, Clone)]
pub struct ScriptConfig {
    /// Absolute path to the executable
    pub path: PathBuf,

    /// Allowed actions (empty means any action)
    #[serde(default)]
    pub actions: Vec<String>,

    /// Actions that need at least one non-empty parameter
    #[serde(default)]
    pub requires_param: Vec<String>,

    /// Free-form description shown by the admin API
    pub description: Option<String>,
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_admin_port() -> u16 {
    9090
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./data/hostgate.db")
}

fn default_hosts_file() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_hosts_backup_dir() -> PathBuf {
    PathBuf::from("./data/backups/hosts")
}

fn default_vhost_config() -> PathBuf {
    PathBuf::from("/etc/nginx/conf.d/hostgate.conf")
}

fn default_vhost_backup_dir() -> PathBuf {
    PathBuf::from("./data/backups/vhost")
}

fn default_sites_root() -> PathBuf {
    PathBuf::from("/var/www")
}

fn default_audit_log() -> PathBuf {
    PathBuf::from("./data/audit.log")
}

fn default_ssl_dir() -> PathBuf {
    PathBuf::from("/etc/nginx/ssl")
}

fn default_loopback_address() -> String {
    "127.0.0.1".to_string()
}

fn default_local_suffix() -> String {
    ".local".to_string()
}

fn default_protected_domains() -> Vec<String> {
    vec!["dashboard.local".to_string()]
}

fn default_begin_marker() -> String {
    "# BEGIN hostgate vhosts".to_string()
}

fn default_end_marker() -> String {
    "# END hostgate vhosts".to_string()
}

fn default_php_upstream() -> String {
    "127.0.0.1:9000".to_string()
}

fn default_index() -> String {
    "index.php index.html index.htm".to_string()
}

fn default_script_timeout() -> u64 {
    120
}

fn default_lock_timeout() -> u64 {
    5000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.sites.loopback_address.parse::<IpAddr>().is_err() {
            errors.push(format!(
                "sites.loopback_address '{}' is not an IP address",
                self.sites.loopback_address
            ));
        }

        if !self.sites.local_suffix.starts_with('.') || self.sites.local_suffix.len() < 2 {
            errors.push(format!(
                "sites.local_suffix '{}' must start with '.' and name a label",
                self.sites.local_suffix
            ));
        }

        if self.vhost.begin_marker.trim().is_empty() || self.vhost.end_marker.trim().is_empty() {
            errors.push("vhost markers cannot be empty".to_string());
        } else if self.vhost.begin_marker.trim() == self.vhost.end_marker.trim() {
            errors.push("vhost.begin_marker and vhost.end_marker must differ".to_string());
        }

        if self.dispatch.timeout_secs == 0 {
            errors.push("dispatch.timeout_secs must be greater than 0".to_string());
        }

        if let Err(e) = ScriptRegistry::from_config(&self.scripts) {
            errors.push(e);
        }

        if self.sites.alias_backend == AliasBackendKind::Script {
            match self.sites.alias_script.as_deref() {
                None => errors.push(
                    "sites.alias_script is required when alias_backend = \"script\"".to_string(),
                ),
                Some(name) => match self.scripts.get(name) {
                    None => errors.push(format!(
                        "sites.alias_script '{}' is not a configured script",
                        name
                    )),
                    Some(script) => {
                        for action in ["add", "remove", "list"] {
                            let allowed = script.actions.is_empty()
                                || script.actions.iter().any(|a| a == action);
                            if !allowed {
                                errors.push(format!(
                                    "alias script '{}' must allow the '{}' action",
                                    name, action
                                ));
                            }
                        }
                    }
                },
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
