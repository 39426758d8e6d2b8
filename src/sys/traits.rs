use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::sys::secrets::Credential;

// ==============================================================================
// 1. Remote Execution (SSH transport)
// ==============================================================================

/// How the executor authenticates against a host.
#[derive(Debug, Clone)]
pub enum HostAuth {
    /// Bootstrap-phase root password, or a configured static-server password.
    Password(Credential),
    /// An identity file already on the control-plane disk.
    KeyFile(PathBuf),
    /// Inline private key material, written to a transient file per command.
    KeyMaterial(Credential),
}

#[derive(Debug, Clone)]
pub struct RemoteHost {
    pub address: Ipv4Addr,
    pub username: String,
    pub auth: HostAuth,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn trimmed(&self) -> &str {
        self.stdout.trim()
    }
}

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Runs `command` through the remote shell and captures its output.
    /// A non-zero exit is NOT an error here; `Err` means the command could not
    /// be delivered at all (connect/auth failure, transport timeout).
    async fn run(&self, host: &RemoteHost, command: &str) -> Result<CommandOutput, String>;
}

// ==============================================================================
// 2. Compute Provider (VM lifecycle)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Vultr,
    DigitalOcean,
    Static,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::Vultr => write!(f, "vultr"),
            ProviderKind::DigitalOcean => write!(f, "digitalocean"),
            ProviderKind::Static => write!(f, "static"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "vultr" => Ok(ProviderKind::Vultr),
            "digitalocean" | "do" => Ok(ProviderKind::DigitalOcean),
            "static" | "existing" => Ok(ProviderKind::Static),
            other => Err(format!(
                "unknown provider '{other}', expected one of: vultr, digitalocean, static"
            )),
        }
    }
}

/// Instance creation parameters. `user_data` is the raw bootstrap script;
/// providers apply their own encoding.
pub struct InstanceRequest {
    pub label: String,
    pub user_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Pending,
    Active,
    Other(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    pub status: InstanceStatus,
    pub public_ip: Option<Ipv4Addr>,
}

impl InstanceState {
    /// Active with an address: the `Active(ip)` provisioning transition.
    pub fn active_ip(&self) -> Option<Ipv4Addr> {
        match self.status {
            InstanceStatus::Active => self.public_ip,
            _ => None,
        }
    }
}

#[async_trait]
pub trait ComputeProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Acknowledged creation; the returned identifier is usable immediately
    /// but resources are allocated asynchronously.
    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, String>;

    /// `Ok(None)` means the provider no longer knows the instance.
    async fn inspect(&self, instance_id: &str) -> Result<Option<InstanceState>, String>;

    async fn destroy(&self, instance_id: &str) -> Result<(), String>;

    /// Whether freshly created instances run the bootstrap payload and must be
    /// polled for the readiness marker.
    fn requires_bootstrap(&self) -> bool {
        true
    }
}
