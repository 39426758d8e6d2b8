// src/wireguard.rs

// WireGuard specifics: overlay address allocation, remote keypair
// generation, and the exact text of peer stanzas and client configs.

use base64::Engine as _;
use base64::engine::general_purpose;
use regex::Regex;
use std::net::Ipv4Addr;
use std::ops::RangeInclusive;
use std::sync::OnceLock;
use zeroize::Zeroizing;

use crate::error::{PoolError, RemoteStep};
use crate::sys::bootstrap::{WG_DIR, WG_INTERFACE};
use crate::sys::traits::{CommandOutput, RemoteExecutor, RemoteHost};

pub const OVERLAY_PREFIX: [u8; 3] = [10, 0, 0];
pub const HOST_RANGE: RangeInclusive<u8> = 2..=254;
pub const KEEPALIVE_SECS: u16 = 25;

/// Lowest free overlay address in `10.0.0.2..=10.0.0.254`, or `None` when
/// every address is taken.
pub fn allocate_address<'a, I>(used: I) -> Option<Ipv4Addr>
where
    I: IntoIterator<Item = &'a Ipv4Addr>,
{
    let taken: Vec<Ipv4Addr> = used.into_iter().copied().collect();
    HOST_RANGE
        .map(|host| Ipv4Addr::new(OVERLAY_PREFIX[0], OVERLAY_PREFIX[1], OVERLAY_PREFIX[2], host))
        .find(|candidate| !taken.contains(candidate))
}

/// Usernames end up inside remote shell commands and file names, so only a
/// conservative alphabet is accepted.
pub fn validate_username(username: &str) -> Result<(), PoolError> {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    let re = PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.-]{0,31}$").unwrap());
    if re.is_match(username) {
        Ok(())
    } else {
        Err(PoolError::InvalidUsername(username.to_string()))
    }
}

/// A WireGuard key is 32 bytes, base64-encoded.
pub fn is_valid_key(b64: &str) -> bool {
    matches!(general_purpose::STANDARD.decode(b64), Ok(bytes) if bytes.len() == 32)
}

// ==============================================================================
// Remote command lines
// ==============================================================================

pub mod commands {
    use super::*;

    pub fn generate_keys(username: &str) -> String {
        format!(
            "mkdir -p {dir}/clients && cd {dir} && umask 077 && wg genkey | tee clients/{u}_private.key | wg pubkey > clients/{u}_public.key",
            dir = WG_DIR,
            u = username
        )
    }

    pub fn read_private_key(username: &str) -> String {
        format!("cat {}/clients/{}_private.key", WG_DIR, username)
    }

    pub fn read_public_key(username: &str) -> String {
        format!("cat {}/clients/{}_public.key", WG_DIR, username)
    }

    pub fn read_server_key() -> String {
        format!(
            "cat {}/server_public.key 2>/dev/null || wg show {} public-key",
            WG_DIR, WG_INTERFACE
        )
    }

    pub fn append_stanza(username: &str, public_key: &str, address: Ipv4Addr) -> String {
        format!(
            "printf '\\n# Peer: %s\\n[Peer]\\nPublicKey = %s\\nAllowedIPs = %s/32\\n' '{}' '{}' '{}' >> {}/{}.conf",
            username, public_key, address, WG_DIR, WG_INTERFACE
        )
    }

    pub fn apply_live(public_key: &str, address: Ipv4Addr) -> String {
        format!("wg set {} peer {} allowed-ips {}/32", WG_INTERFACE, public_key, address)
    }

    pub fn remove_live(public_key: &str) -> String {
        format!("wg set {} peer {} remove", WG_INTERFACE, public_key)
    }

    /// Drops every blank-line separated block that carries the peer's marker
    /// or its public key. Pattern-based: a hand-edited stanza without either
    /// survives.
    pub fn remove_stanza(username: &str, public_key: &str) -> String {
        format!(
            "cd {dir} && umask 077 && awk -v RS= -v ORS='\\n\\n' -v key='{key}' -v marker='# Peer: {u}' \
             'index($0, key) == 0 && index($0, marker \"\\n\") == 0' {iface}.conf > {iface}.conf.tmp \
             && mv {iface}.conf.tmp {iface}.conf",
            dir = WG_DIR,
            key = public_key,
            u = username,
            iface = WG_INTERFACE
        )
    }

    pub fn restart_interface() -> String {
        format!("systemctl restart wg-quick@{}", WG_INTERFACE)
    }

    pub fn remove_key_files(username: &str) -> String {
        format!(
            "rm -f {dir}/clients/{u}_private.key {dir}/clients/{u}_public.key",
            dir = WG_DIR,
            u = username
        )
    }
}

/// Runs one remote step; transport failures and non-zero exits are both
/// attributed to `step`.
pub async fn run_step(
    executor: &dyn RemoteExecutor,
    host: &RemoteHost,
    step: RemoteStep,
    command: &str,
) -> Result<CommandOutput, PoolError> {
    let host_label = host.address.to_string();
    let output = executor
        .run(host, command)
        .await
        .map_err(|e| PoolError::remote(step, &host_label, e))?;
    if !output.success() {
        return Err(PoolError::remote(
            step,
            &host_label,
            format!("exit {}: {}", output.exit_code, output.stderr.trim()),
        ));
    }
    Ok(output)
}

// ==============================================================================
// Peer Key Generator
// ==============================================================================

pub struct PeerKeys {
    pub private_key: Zeroizing<String>,
    pub public_key: String,
    pub server_public_key: String,
}

/// Generates a peer keypair on the target server itself, so the private key
/// only ever crosses the SSH channel.
pub struct KeyGenerator<'a> {
    executor: &'a dyn RemoteExecutor,
}

impl<'a> KeyGenerator<'a> {
    pub fn new(executor: &'a dyn RemoteExecutor) -> Self {
        Self { executor }
    }

    pub async fn generate(&self, host: &RemoteHost, username: &str) -> Result<PeerKeys, PoolError> {
        run_step(self.executor, host, RemoteStep::GenerateKeys, &commands::generate_keys(username)).await?;

        let private_key = Zeroizing::new(
            self.read_key(host, RemoteStep::ReadPrivateKey, &commands::read_private_key(username)).await?,
        );
        let public_key = self.read_key(host, RemoteStep::ReadPublicKey, &commands::read_public_key(username)).await?;
        let server_public_key = self.read_key(host, RemoteStep::ReadServerKey, &commands::read_server_key()).await?;

        Ok(PeerKeys {
            private_key,
            public_key,
            server_public_key,
        })
    }

    async fn read_key(&self, host: &RemoteHost, step: RemoteStep, command: &str) -> Result<String, PoolError> {
        let output = run_step(self.executor, host, step, command).await?;
        let key = output.trimmed().to_string();
        if !is_valid_key(&key) {
            return Err(PoolError::remote(step, &host.address.to_string(), "output is not a WireGuard key"));
        }
        Ok(key)
    }
}

// ==============================================================================
// Client configuration text
// ==============================================================================

pub struct ClientConfigParams<'a> {
    pub private_key: &'a str,
    pub address: Ipv4Addr,
    pub dns: &'a str,
    pub server_public_key: &'a str,
    pub endpoint: Ipv4Addr,
    pub listen_port: u16,
}

/// Renders the wg-quick client file. Consumed verbatim by stock clients.
pub fn render_client_config(p: &ClientConfigParams<'_>) -> String {
    format!(
        "[Interface]\n\
         PrivateKey = {private_key}\n\
         Address = {address}/24\n\
         DNS = {dns}\n\
         \n\
         [Peer]\n\
         PublicKey = {server_key}\n\
         Endpoint = {endpoint}:{port}\n\
         AllowedIPs = 0.0.0.0/0\n\
         PersistentKeepalive = {keepalive}\n",
        private_key = p.private_key,
        address = p.address,
        dns = p.dns,
        server_key = p.server_public_key,
        endpoint = p.endpoint,
        port = p.listen_port,
        keepalive = KEEPALIVE_SECS,
    )
}
