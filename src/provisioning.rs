// src/provisioning.rs

// Provisioning Wait State Machine:
// `Requested -> Booting -> Active(ip) -> BootstrapPending -> Ready | TimedOut`.
//
// Both waits are suspend-with-deadline loops. Any failure after the provider
// acknowledged the instance destroys it again, and so does dropping the
// future mid-wait (the request was abandoned).

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{PoolError, ProvisioningFailure, RemoteStep};
use crate::sys::bootstrap::{self, READY_MARKER, READY_TOKEN};
use crate::sys::secrets::Credential;
use crate::sys::traits::{ComputeProvider, HostAuth, InstanceRequest, RemoteExecutor, RemoteHost};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionPhase {
    Requested { instance_id: String },
    Booting,
    Active(Ipv4Addr),
    BootstrapPending(Ipv4Addr),
    Ready(Ipv4Addr),
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct ProvisionSettings {
    pub boot_timeout: Duration,
    pub boot_poll: Duration,
    pub setup_timeout: Duration,
    pub setup_poll: Duration,
    pub listen_port: u16,
    pub ssh_username: String,
}

impl Default for ProvisionSettings {
    fn default() -> Self {
        Self {
            boot_timeout: Duration::from_secs(300),
            boot_poll: Duration::from_secs(10),
            setup_timeout: Duration::from_secs(600),
            setup_poll: Duration::from_secs(15),
            listen_port: 51820,
            ssh_username: "root".to_string(),
        }
    }
}

/// A server that reached `Ready`, not yet registered.
#[derive(Debug, Clone)]
pub struct ProvisionedServer {
    pub id: String,
    pub ip: Ipv4Addr,
    pub credential: Option<Credential>,
}

/// Destroys an acknowledged instance unless disarmed.
struct OrphanGuard {
    provider: Arc<dyn ComputeProvider>,
    instance_id: String,
    armed: bool,
}

impl OrphanGuard {
    fn new(provider: Arc<dyn ComputeProvider>, instance_id: String) -> Self {
        Self { provider, instance_id, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }

    async fn destroy_now(mut self) {
        self.armed = false;
        match self.provider.destroy(&self.instance_id).await {
            Ok(()) => info!(instance_id = %self.instance_id, "orphaned instance destroyed"),
            Err(e) => warn!(instance_id = %self.instance_id, "failed to destroy orphaned instance: {}", e),
        }
    }
}

impl Drop for OrphanGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let provider = self.provider.clone();
        let instance_id = std::mem::take(&mut self.instance_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = provider.destroy(&instance_id).await {
                        warn!(%instance_id, "failed to destroy abandoned instance: {}", e);
                    } else {
                        info!(%instance_id, "abandoned instance destroyed");
                    }
                });
            }
            Err(_) => warn!(%instance_id, "no runtime left to destroy abandoned instance"),
        }
    }
}

pub struct Provisioner {
    provider: Arc<dyn ComputeProvider>,
    executor: Arc<dyn RemoteExecutor>,
    settings: ProvisionSettings,
}

impl Provisioner {
    pub fn new(
        provider: Arc<dyn ComputeProvider>,
        executor: Arc<dyn RemoteExecutor>,
        settings: ProvisionSettings,
    ) -> Self {
        Self { provider, executor, settings }
    }

    pub async fn provision(
        &self,
        label: &str,
        on_phase: &(dyn Fn(&ProvisionPhase) + Send + Sync),
    ) -> Result<ProvisionedServer, PoolError> {
        let bootstrap = self.provider.requires_bootstrap();
        let credential = bootstrap.then(Credential::generate_setup_password);
        let user_data = credential
            .as_ref()
            .map(|c| bootstrap::render_user_data(c, self.settings.listen_port))
            .unwrap_or_default();

        let instance_id = self
            .provider
            .create_instance(&InstanceRequest { label: label.to_string(), user_data })
            .await
            .map_err(PoolError::rejected)?;
        info!(%instance_id, provider = %self.provider.kind(), "instance requested");
        on_phase(&ProvisionPhase::Requested { instance_id: instance_id.clone() });

        let guard = OrphanGuard::new(self.provider.clone(), instance_id.clone());

        let ip = match timeout(self.settings.boot_timeout, self.wait_active(&instance_id, on_phase)).await {
            Ok(ip) => ip,
            Err(_) => {
                on_phase(&ProvisionPhase::TimedOut);
                guard.destroy_now().await;
                return Err(PoolError::Provisioning {
                    kind: ProvisioningFailure::BootTimeout,
                    message: format!(
                        "instance {} not active after {}s",
                        instance_id,
                        self.settings.boot_timeout.as_secs()
                    ),
                });
            }
        };
        info!(%instance_id, %ip, "instance active");
        on_phase(&ProvisionPhase::Active(ip));

        if let Some(cred) = &credential {
            on_phase(&ProvisionPhase::BootstrapPending(ip));
            let host = RemoteHost {
                address: ip,
                username: self.settings.ssh_username.clone(),
                auth: HostAuth::Password(cred.clone()),
            };
            let last_error = StdMutex::new(None);
            if timeout(self.settings.setup_timeout, self.wait_ready(&host, &last_error)).await.is_err() {
                on_phase(&ProvisionPhase::TimedOut);
                guard.destroy_now().await;
                let mut message = format!(
                    "bootstrap on {} did not complete within {}s",
                    ip,
                    self.settings.setup_timeout.as_secs()
                );
                if let Some(e) = last_error.lock().ok().and_then(|mut slot| slot.take()) {
                    message.push_str(&format!(" (last poll: {})", e));
                }
                return Err(PoolError::Provisioning {
                    kind: ProvisioningFailure::SetupTimeout,
                    message,
                });
            }
        }

        guard.disarm();
        info!(%instance_id, %ip, "server ready");
        on_phase(&ProvisionPhase::Ready(ip));

        Ok(ProvisionedServer { id: instance_id, ip, credential })
    }

    async fn wait_active(&self, instance_id: &str, on_phase: &(dyn Fn(&ProvisionPhase) + Send + Sync)) -> Ipv4Addr {
        let mut announced = false;
        loop {
            match self.provider.inspect(instance_id).await {
                Ok(Some(state)) => {
                    if let Some(ip) = state.active_ip() {
                        return ip;
                    }
                    debug!(instance_id, status = ?state.status, "instance not active yet");
                }
                // Freshly created instances can lag behind the listing API.
                Ok(None) => debug!(instance_id, "instance not visible yet"),
                Err(e) => warn!(instance_id, "status check failed, retrying: {}", e),
            }
            if !announced {
                on_phase(&ProvisionPhase::Booting);
                announced = true;
            }
            sleep(self.settings.boot_poll).await;
        }
    }

    /// Polls the readiness marker. `last_error` keeps the most recent
    /// transport failure for the timeout message.
    async fn wait_ready(&self, host: &RemoteHost, last_error: &StdMutex<Option<PoolError>>) {
        let marker = format!("cat {} 2>/dev/null || true", READY_MARKER);
        let label = host.address.to_string();
        loop {
            let failure = match self.executor.run(host, &marker).await {
                Ok(out) if out.trimmed() == READY_TOKEN => return,
                Ok(_) => {
                    debug!(host = %host.address, "bootstrap still running");
                    None
                }
                // sshd comes up partway through the bootstrap.
                Err(e) => {
                    let e = PoolError::remote(RemoteStep::ReadinessProbe, &label, e);
                    debug!("host not reachable yet: {}", e);
                    Some(e)
                }
            };
            if let Ok(mut slot) = last_error.lock() {
                *slot = failure;
            }
            sleep(self.settings.setup_poll).await;
        }
    }
}
