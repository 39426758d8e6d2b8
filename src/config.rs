// src/config.rs

use std::env;
use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::PoolError;
use crate::pool::PoolSettings;
use crate::provisioning::ProvisionSettings;
use crate::sys::secrets::Credential;
use crate::sys::traits::{HostAuth, ProviderKind};

#[derive(Clone, Debug)]
pub enum ProviderConfig {
    Vultr { api_key: Credential, region: String, plan: String },
    DigitalOcean { token: Credential, region: String, size: String },
    Static { address: Ipv4Addr },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl FromStr for ListenAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.strip_prefix("unix:") {
            Some(path) if !path.is_empty() => Ok(ListenAddr::Unix(PathBuf::from(path))),
            Some(_) => Err("unix listen address needs a socket path".to_string()),
            None => s.parse::<SocketAddr>().map(ListenAddr::Tcp).map_err(|e| e.to_string()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub provider: ProviderConfig,

    // Remote access
    pub ssh_username: String,
    /// Pool-wide identity; required for static servers.
    pub ssh_auth: Option<HostAuth>,
    pub ssh_timeout: Duration,
    pub known_hosts: PathBuf,
    pub http_timeout: Duration,

    // Pool policy
    pub listen_port: u16,
    pub max_peers_per_server: usize,
    pub idle_threshold: Duration,
    /// `None` disables the periodic sweep.
    pub sweep_interval: Option<Duration>,
    pub dns: String,

    // Provisioning deadlines
    pub boot_timeout: Duration,
    pub boot_poll: Duration,
    pub setup_timeout: Duration,
    pub setup_poll: Duration,

    // Process
    pub state_file: PathBuf,
    pub listen: ListenAddr,
    pub log_json: bool,
}

/// Reads `key`, treating blank values as unset.
fn lookup<F: Fn(&str) -> Option<String>>(get: &F, key: &str) -> Option<String> {
    get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parse_or<T, F>(get: &F, key: &str, default: T) -> Result<T, PoolError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(get, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse::<T>()
            .map_err(|e| PoolError::Config(format!("{} = '{}': {}", key, raw, e))),
    }
}

fn required<F: Fn(&str) -> Option<String>>(get: &F, key: &str, provider: ProviderKind) -> Result<String, PoolError> {
    lookup(get, key).ok_or_else(|| PoolError::Config(format!("{} is required for the {} provider", key, provider)))
}

fn secs<F: Fn(&str) -> Option<String>>(get: &F, key: &str, default: u64) -> Result<Duration, PoolError> {
    parse_or(get, key, default).map(Duration::from_secs)
}

impl PoolConfig {
    pub fn load() -> Result<Self, PoolError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Bad numbers and missing
    /// provider credentials refuse to start the process.
    pub fn from_lookup<F: Fn(&str) -> Option<String>>(get: F) -> Result<Self, PoolError> {
        let kind: ProviderKind = parse_or(&get, "WGPOOL_PROVIDER", ProviderKind::Vultr)?;

        let ssh_auth = if let Some(pw) = lookup(&get, "SSH_PASSWORD") {
            Some(HostAuth::Password(Credential::new(pw)))
        } else if let Some(path) = lookup(&get, "SSH_KEY_PATH") {
            Some(HostAuth::KeyFile(PathBuf::from(path)))
        } else {
            // OpenSSH refuses a PEM body without its final newline.
            lookup(&get, "SSH_PRIVATE_KEY").map(|key| HostAuth::KeyMaterial(Credential::new(format!("{}\n", key))))
        };

        let provider = match kind {
            ProviderKind::Vultr => ProviderConfig::Vultr {
                api_key: Credential::new(required(&get, "VULTR_API_KEY", kind)?),
                region: lookup(&get, "SERVER_REGION").unwrap_or_else(|| "ewr".to_string()),
                plan: lookup(&get, "SERVER_PLAN").unwrap_or_else(|| "vc2-1c-1gb".to_string()),
            },
            ProviderKind::DigitalOcean => ProviderConfig::DigitalOcean {
                token: Credential::new(required(&get, "DIGITALOCEAN_TOKEN", kind)?),
                region: lookup(&get, "SERVER_REGION").unwrap_or_else(|| "nyc1".to_string()),
                size: lookup(&get, "SERVER_PLAN").unwrap_or_else(|| "s-1vcpu-1gb".to_string()),
            },
            ProviderKind::Static => {
                let raw = required(&get, "EXISTING_SERVER_IP", kind)?;
                let address = raw
                    .parse::<Ipv4Addr>()
                    .map_err(|e| PoolError::Config(format!("EXISTING_SERVER_IP = '{}': {}", raw, e)))?;
                if ssh_auth.is_none() {
                    return Err(PoolError::Config(
                        "one of SSH_PASSWORD, SSH_KEY_PATH, SSH_PRIVATE_KEY is required for the static provider".into(),
                    ));
                }
                ProviderConfig::Static { address }
            }
        };

        // A single pre-built host is sized for many more peers.
        let default_max = if kind == ProviderKind::Static { 50 } else { 3 };
        let max_peers_per_server: usize = parse_or(&get, "WGPOOL_MAX_PEERS", default_max)?;
        if max_peers_per_server == 0 {
            return Err(PoolError::Config("WGPOOL_MAX_PEERS must be at least 1".into()));
        }

        let sweep_secs: u64 = parse_or(&get, "WGPOOL_SWEEP_SECONDS", 300)?;
        let idle_minutes: u64 = parse_or(&get, "WGPOOL_IDLE_MINUTES", 30)?;

        Ok(Self {
            provider,
            ssh_username: lookup(&get, "SSH_USERNAME").unwrap_or_else(|| "root".to_string()),
            ssh_auth,
            ssh_timeout: secs(&get, "WGPOOL_SSH_TIMEOUT_SECS", 30)?,
            known_hosts: PathBuf::from(lookup(&get, "WGPOOL_KNOWN_HOSTS").unwrap_or_else(|| "/dev/null".to_string())),
            http_timeout: secs(&get, "WGPOOL_HTTP_TIMEOUT_SECS", 30)?,
            listen_port: parse_or(&get, "WIREGUARD_PORT", 51820)?,
            max_peers_per_server,
            idle_threshold: Duration::from_secs(idle_minutes.saturating_mul(60)),
            sweep_interval: (sweep_secs > 0).then(|| Duration::from_secs(sweep_secs)),
            dns: lookup(&get, "WGPOOL_DNS").unwrap_or_else(|| "8.8.8.8, 1.1.1.1".to_string()),
            boot_timeout: secs(&get, "WGPOOL_BOOT_TIMEOUT_SECS", 300)?,
            boot_poll: secs(&get, "WGPOOL_BOOT_POLL_SECS", 10)?,
            setup_timeout: secs(&get, "WGPOOL_SETUP_TIMEOUT_SECS", 600)?,
            setup_poll: secs(&get, "WGPOOL_SETUP_POLL_SECS", 15)?,
            state_file: PathBuf::from(lookup(&get, "WGPOOL_STATE_FILE").unwrap_or_else(|| "wgpool_state.json".to_string())),
            listen: parse_or(&get, "WGPOOL_LISTEN", ListenAddr::Tcp(SocketAddr::from(([127, 0, 0, 1], 8000))))?,
            log_json: lookup(&get, "WGPOOL_LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
        })
    }

    pub fn provider_kind(&self) -> ProviderKind {
        match self.provider {
            ProviderConfig::Vultr { .. } => ProviderKind::Vultr,
            ProviderConfig::DigitalOcean { .. } => ProviderKind::DigitalOcean,
            ProviderConfig::Static { .. } => ProviderKind::Static,
        }
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            max_peers_per_server: self.max_peers_per_server,
            idle_threshold: self.idle_threshold,
            dns: self.dns.clone(),
            default_auth: self.ssh_auth.clone(),
            provisioning: ProvisionSettings {
                boot_timeout: self.boot_timeout,
                boot_poll: self.boot_poll,
                setup_timeout: self.setup_timeout,
                setup_poll: self.setup_poll,
                listen_port: self.listen_port,
                ssh_username: self.ssh_username.clone(),
            },
        }
    }
}
