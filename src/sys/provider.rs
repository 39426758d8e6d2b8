use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::net::Ipv4Addr;
use std::time::Duration;
use tracing::info;

use crate::sys::secrets::Credential;
use crate::sys::traits::{
    ComputeProvider, InstanceRequest, InstanceState, InstanceStatus, ProviderKind,
};

/// The token only leaves its wrapper for the header it is written into.
fn authed(req: RequestBuilder, token: &Credential) -> RequestBuilder {
    token.use_secret(|t| req.bearer_auth(t))
}

fn http_client(timeout: Duration) -> Result<Client, String> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| format!("failed to build HTTP client: {}", e))
}

/// Providers report "0.0.0.0" or omit the address until one is allocated.
fn parse_public_ip(raw: Option<&str>) -> Option<Ipv4Addr> {
    raw.and_then(|s| s.parse::<Ipv4Addr>().ok())
        .filter(|ip| !ip.is_unspecified())
}

// ==============================================================================
// 1. Vultr Implementation
// ==============================================================================

const VULTR_API: &str = "https://api.vultr.com/v2";
const VULTR_UBUNTU_2204: u32 = 1743;

#[derive(Deserialize)]
struct VultrEnvelope {
    instance: VultrInstance,
}

#[derive(Deserialize)]
struct VultrInstance {
    id: String,
    status: String,
    #[serde(default)]
    main_ip: Option<String>,
}

impl VultrInstance {
    fn state(&self) -> InstanceState {
        let status = match self.status.as_str() {
            "active" => InstanceStatus::Active,
            "pending" => InstanceStatus::Pending,
            other => InstanceStatus::Other(other.to_string()),
        };
        InstanceState {
            status,
            public_ip: parse_public_ip(self.main_ip.as_deref()),
        }
    }
}

pub struct VultrProvider {
    client: Client,
    api_key: Credential,
    region: String,
    plan: String,
    api_base: String,
}

impl VultrProvider {
    pub fn new(api_key: Credential, region: String, plan: String, timeout: Duration) -> Result<Self, String> {
        Ok(Self {
            client: http_client(timeout)?,
            api_key,
            region,
            plan,
            api_base: VULTR_API.to_string(),
        })
    }
}

#[async_trait]
impl ComputeProvider for VultrProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vultr
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, String> {
        let body = json!({
            "region": self.region,
            "plan": self.plan,
            "os_id": VULTR_UBUNTU_2204,
            "label": request.label,
            "user_data": general_purpose::STANDARD.encode(request.user_data.as_bytes()),
            "enable_ipv6": false,
            "backups": "disabled",
            "activation_email": false,
        });

        let resp = authed(self.client.post(format!("{}/instances", self.api_base)), &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("Vultr create request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("Vultr refused instance creation ({}): {}", status, text));
        }

        let envelope: VultrEnvelope = resp.json().await
            .map_err(|e| format!("Vultr create response unreadable: {}", e))?;
        Ok(envelope.instance.id)
    }

    async fn inspect(&self, instance_id: &str) -> Result<Option<InstanceState>, String> {
        let resp = authed(self.client.get(format!("{}/instances/{}", self.api_base, instance_id)), &self.api_key)
            .send()
            .await
            .map_err(|e| format!("Vultr inspect request failed: {}", e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(format!("Vultr inspect returned {}", resp.status()));
        }

        let envelope: VultrEnvelope = resp.json().await
            .map_err(|e| format!("Vultr inspect response unreadable: {}", e))?;
        Ok(Some(envelope.instance.state()))
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), String> {
        let resp = authed(self.client.delete(format!("{}/instances/{}", self.api_base, instance_id)), &self.api_key)
            .send()
            .await
            .map_err(|e| format!("Vultr destroy request failed: {}", e))?;

        // Already gone counts as destroyed.
        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(format!("Vultr destroy returned {}", resp.status()))
        }
    }
}

// ==============================================================================
// 2. DigitalOcean Implementation
// ==============================================================================

const DIGITALOCEAN_API: &str = "https://api.digitalocean.com/v2";

#[derive(Deserialize)]
struct DropletEnvelope {
    droplet: Droplet,
}

#[derive(Deserialize)]
struct Droplet {
    id: u64,
    status: String,
    #[serde(default)]
    networks: DropletNetworks,
}

#[derive(Deserialize, Default)]
struct DropletNetworks {
    #[serde(default)]
    v4: Vec<DropletV4>,
}

#[derive(Deserialize)]
struct DropletV4 {
    ip_address: String,
    #[serde(rename = "type")]
    kind: String,
}

impl Droplet {
    fn state(&self) -> InstanceState {
        let status = match self.status.as_str() {
            "active" => InstanceStatus::Active,
            "new" => InstanceStatus::Pending,
            other => InstanceStatus::Other(other.to_string()),
        };
        let public = self.networks.v4.iter()
            .find(|n| n.kind == "public")
            .map(|n| n.ip_address.as_str());
        InstanceState {
            status,
            public_ip: parse_public_ip(public),
        }
    }
}

pub struct DigitalOceanProvider {
    client: Client,
    token: Credential,
    region: String,
    size: String,
    api_base: String,
}

impl DigitalOceanProvider {
    pub fn new(token: Credential, region: String, size: String, timeout: Duration) -> Result<Self, String> {
        Ok(Self {
            client: http_client(timeout)?,
            token,
            region,
            size,
            api_base: DIGITALOCEAN_API.to_string(),
        })
    }
}

#[async_trait]
impl ComputeProvider for DigitalOceanProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::DigitalOcean
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<String, String> {
        let body = json!({
            "name": request.label,
            "region": self.region,
            "size": self.size,
            "image": "ubuntu-22-04-x64",
            "user_data": request.user_data,
            "ipv6": false,
            "backups": false,
            "monitoring": false,
            "tags": ["vpn-pool"],
        });

        let resp = authed(self.client.post(format!("{}/droplets", self.api_base)), &self.token)
            .json(&body)
            .send()
            .await
            .map_err(|e| format!("DigitalOcean create request failed: {}", e))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(format!("DigitalOcean refused droplet creation ({}): {}", status, text));
        }

        let envelope: DropletEnvelope = resp.json().await
            .map_err(|e| format!("DigitalOcean create response unreadable: {}", e))?;
        Ok(envelope.droplet.id.to_string())
    }

    async fn inspect(&self, instance_id: &str) -> Result<Option<InstanceState>, String> {
        let resp = authed(self.client.get(format!("{}/droplets/{}", self.api_base, instance_id)), &self.token)
            .send()
            .await
            .map_err(|e| format!("DigitalOcean inspect request failed: {}", e))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(format!("DigitalOcean inspect returned {}", resp.status()));
        }

        let envelope: DropletEnvelope = resp.json().await
            .map_err(|e| format!("DigitalOcean inspect response unreadable: {}", e))?;
        Ok(Some(envelope.droplet.state()))
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), String> {
        let resp = authed(self.client.delete(format!("{}/droplets/{}", self.api_base, instance_id)), &self.token)
            .send()
            .await
            .map_err(|e| format!("DigitalOcean destroy request failed: {}", e))?;

        if resp.status().is_success() || resp.status() == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(format!("DigitalOcean destroy returned {}", resp.status()))
        }
    }
}

// ==============================================================================
// 3. Static Server Implementation
// ==============================================================================

/// A single pre-provisioned WireGuard host. Nothing is created or destroyed;
/// "creating" it just hands back its fixed identifier.
pub struct StaticServerProvider {
    address: Ipv4Addr,
}

impl StaticServerProvider {
    pub fn new(address: Ipv4Addr) -> Self {
        Self { address }
    }

    pub fn instance_id(&self) -> String {
        format!("static-{}", self.address)
    }
}

#[async_trait]
impl ComputeProvider for StaticServerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Static
    }

    async fn create_instance(&self, _request: &InstanceRequest) -> Result<String, String> {
        Ok(self.instance_id())
    }

    async fn inspect(&self, instance_id: &str) -> Result<Option<InstanceState>, String> {
        if instance_id != self.instance_id() {
            return Ok(None);
        }
        Ok(Some(InstanceState {
            status: InstanceStatus::Active,
            public_ip: Some(self.address),
        }))
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), String> {
        info!(instance_id, "static server retained; destroy is a no-op");
        Ok(())
    }

    fn requires_bootstrap(&self) -> bool {
        false
    }
}
