// src/pool.rs

// Pool Allocator and the facade operations built on it.
//
// `join_or_create` runs three steps: reuse an existing assignment when its
// server is still live, otherwise take the first live server with a free
// slot, otherwise provision a new server. Capacity is claimed through
// registry reservations, so concurrent joins never overrun a server.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::{PoolError, RemoteStep};
use crate::lifecycle::PeerLifecycle;
use crate::provisioning::{ProvisionPhase, ProvisionSettings, Provisioner};
use crate::registry::{Liveness, ServerRecord, ServerRegistry};
use crate::sys::bootstrap::WG_INTERFACE;
use crate::sys::traits::{ComputeProvider, HostAuth, RemoteExecutor, RemoteHost};
use crate::wireguard::{self, run_step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentKind {
    AlreadyConnected,
    JoinedExisting,
    CreatedNew,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentResult {
    pub kind: AssignmentKind,
    pub server_ip: Ipv4Addr,
    pub client_config: String,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_peers_per_server: usize,
    pub idle_threshold: Duration,
    pub dns: String,
    /// Identity for servers that carry no setup credential (static hosts).
    pub default_auth: Option<HostAuth>,
    pub provisioning: ProvisionSettings,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_peers_per_server: 3,
            idle_threshold: Duration::from_secs(30 * 60),
            dns: "8.8.8.8, 1.1.1.1".to_string(),
            default_auth: None,
            provisioning: ProvisionSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ServerSummary {
    pub id: String,
    pub ip: Ipv4Addr,
    pub peers: usize,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub active_servers: usize,
    pub total_peers: usize,
    pub max_peers_per_server: usize,
    pub available_slots: usize,
    pub servers: Vec<ServerSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub server_id: String,
    pub ip: Ipv4Addr,
    pub login: String,
    pub wireguard_installed: bool,
    pub interface_active: bool,
}

/// Marks a username as having a join running; cleared on drop.
struct InFlight<'a> {
    set: &'a StdMutex<HashSet<String>>,
    username: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.username);
        }
    }
}

pub struct Pool {
    registry: Arc<ServerRegistry>,
    provider: Arc<dyn ComputeProvider>,
    executor: Arc<dyn RemoteExecutor>,
    lifecycle: PeerLifecycle,
    provisioner: Provisioner,
    settings: PoolSettings,
    in_flight: StdMutex<HashSet<String>>,
}

impl Pool {
    pub fn new(
        registry: Arc<ServerRegistry>,
        provider: Arc<dyn ComputeProvider>,
        executor: Arc<dyn RemoteExecutor>,
        settings: PoolSettings,
    ) -> Self {
        let lifecycle = PeerLifecycle::new(
            executor.clone(),
            registry.clone(),
            settings.dns.clone(),
            settings.provisioning.listen_port,
        );
        let provisioner = Provisioner::new(provider.clone(), executor.clone(), settings.provisioning.clone());
        Self {
            registry,
            provider,
            executor,
            lifecycle,
            provisioner,
            settings,
            in_flight: StdMutex::new(HashSet::new()),
        }
    }

    pub fn max_peers_per_server(&self) -> usize {
        self.settings.max_peers_per_server
    }

    fn enter(&self, username: &str) -> Result<InFlight<'_>, PoolError> {
        let mut set = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !set.insert(username.to_string()) {
            return Err(PoolError::JoinInProgress(username.to_string()));
        }
        Ok(InFlight { set: &self.in_flight, username: username.to_string() })
    }

    fn host_for(&self, server: &ServerRecord) -> Result<RemoteHost, PoolError> {
        let auth = match &server.credential {
            Some(cred) => HostAuth::Password(cred.clone()),
            None => self.settings.default_auth.clone().ok_or_else(|| {
                PoolError::Config(format!("no SSH credential available for server {}", server.id))
            })?,
        };
        Ok(RemoteHost {
            address: server.ip,
            username: self.settings.provisioning.ssh_username.clone(),
            auth,
        })
    }

    /// Drops a server the provider no longer runs, along with every
    /// assignment that pointed at it.
    async fn purge_server(&self, server_id: &str) -> Result<(), PoolError> {
        if let Some(server) = self.registry.remove(server_id).await? {
            for username in server.peers.keys() {
                warn!("{}", PoolError::StateDrift {
                    username: username.clone(),
                    detail: format!("server {} is gone at the provider; assignment purged", server_id),
                });
            }
        }
        self.lifecycle.forget_server(server_id);
        Ok(())
    }

    pub async fn join_or_create(&self, username: &str) -> Result<AssignmentResult, PoolError> {
        self.join_or_create_with(username, &|_: &ProvisionPhase| {}).await
    }

    /// `join_or_create`, reporting provisioning phases to `on_phase` when a
    /// new server has to be created.
    pub async fn join_or_create_with(
        &self,
        username: &str,
        on_phase: &(dyn Fn(&ProvisionPhase) + Send + Sync),
    ) -> Result<AssignmentResult, PoolError> {
        wireguard::validate_username(username)?;
        let _flight = self.enter(username)?;
        let max = self.settings.max_peers_per_server;

        // 1. Existing assignment
        if let Some(assignment) = self.registry.assignment(username).await {
            match self.registry.liveness(self.provider.as_ref(), &assignment.server_id).await {
                Liveness::Live => match self.registry.get(&assignment.server_id).await {
                    Ok(server) => {
                        info!(username, server_id = %server.id, "already connected");
                        return Ok(AssignmentResult {
                            kind: AssignmentKind::AlreadyConnected,
                            server_ip: server.ip,
                            client_config: assignment.client_config,
                        });
                    }
                    Err(_) => {
                        warn!("{}", PoolError::StateDrift {
                            username: username.to_string(),
                            detail: format!("server {} is not registered", assignment.server_id),
                        });
                        self.registry.purge_assignment(username).await?;
                    }
                },
                Liveness::Gone => self.purge_server(&assignment.server_id).await?,
                Liveness::Unknown(e) => {
                    return Err(PoolError::rejected(format!(
                        "cannot verify server {}: {}",
                        assignment.server_id, e
                    )));
                }
            }
        }

        // 2. First live server with a free slot
        for server in self.registry.list_with_capacity(max).await {
            match self.registry.liveness(self.provider.as_ref(), &server.id).await {
                Liveness::Live => {}
                Liveness::Gone => {
                    warn!(server_id = %server.id, "server gone at provider, purging");
                    self.purge_server(&server.id).await?;
                    continue;
                }
                Liveness::Unknown(e) => {
                    warn!(server_id = %server.id, "skipping server with unknown state: {}", e);
                    continue;
                }
            }
            let Some(reservation) = self.registry.try_reserve(&server.id, username, max).await? else {
                continue;
            };
            let host = self.host_for(&server)?;
            let assignment = self.lifecycle.add_peer(reservation, &server, &host).await?;
            return Ok(AssignmentResult {
                kind: AssignmentKind::JoinedExisting,
                server_ip: server.ip,
                client_config: assignment.client_config,
            });
        }

        // 3. New server
        info!(username, "no server with capacity, provisioning a new one");
        let label = format!("wgpool-{}", Utc::now().format("%Y%m%d-%H%M%S"));
        let provisioned = self.provisioner.provision(&label, on_phase).await?;
        let record = ServerRecord::new(
            provisioned.id.clone(),
            self.provider.kind(),
            provisioned.ip,
            provisioned.credential,
        );

        let reservation = match self.registry.register_and_reserve(record.clone(), username, max).await {
            Ok(r) => r,
            Err(e) => {
                if !matches!(e, PoolError::Provisioning { .. }) {
                    if let Err(de) = self.provider.destroy(&provisioned.id).await {
                        warn!(instance_id = %provisioned.id, "failed to destroy unregistered instance: {}", de);
                    }
                }
                return Err(e);
            }
        };

        let host = self.host_for(&record)?;
        // A failed first peer leaves an empty server for the idle sweep.
        let assignment = self.lifecycle.add_peer(reservation, &record, &host).await?;
        Ok(AssignmentResult {
            kind: AssignmentKind::CreatedNew,
            server_ip: record.ip,
            client_config: assignment.client_config,
        })
    }

    /// Revokes the user's peer. Remote failures are logged; the local
    /// assignment is always deleted.
    pub async fn disconnect(&self, username: &str) -> Result<(), PoolError> {
        let assignment = self
            .registry
            .assignment(username)
            .await
            .ok_or_else(|| PoolError::NotConnected(username.to_string()))?;

        match self.registry.get(&assignment.server_id).await {
            Ok(server) => match self.host_for(&server) {
                Ok(host) => {
                    self.lifecycle.remove_peer(username, &server, &host).await?;
                }
                Err(e) => {
                    warn!(username, "cannot reach server for revocation: {}", e);
                    self.registry.detach_peer(username).await?;
                }
            },
            Err(_) => {
                warn!("{}", PoolError::StateDrift {
                    username: username.to_string(),
                    detail: format!("server {} is not registered", assignment.server_id),
                });
                self.registry.purge_assignment(username).await?;
            }
        }

        info!(username, "disconnected");
        self.cleanup_idle_servers().await;
        Ok(())
    }

    pub async fn cleanup_idle_servers(&self) -> Vec<String> {
        self.cleanup_idle_servers_at(Utc::now()).await
    }

    /// Destroys every server with no peers whose last activity is older than
    /// the idle threshold. Destroy failures keep the server registered.
    pub async fn cleanup_idle_servers_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let Some(cutoff) = chrono::Duration::from_std(self.settings.idle_threshold)
            .ok()
            .and_then(|idle| now.checked_sub_signed(idle))
        else {
            return Vec::new();
        };
        let mut reclaimed = Vec::new();

        for server in self.registry.servers().await {
            if !self.registry.claim_for_reclamation(&server.id, cutoff).await {
                continue;
            }
            info!(server_id = %server.id, "reclaiming idle server");
            if let Err(e) = self.provider.destroy(&server.id).await {
                warn!(server_id = %server.id, "idle server destroy failed: {}", e);
                self.registry.release_claim(&server.id);
                continue;
            }
            match self.registry.remove(&server.id).await {
                Ok(_) => {
                    self.lifecycle.forget_server(&server.id);
                    reclaimed.push(server.id);
                }
                Err(e) => {
                    error!(server_id = %server.id, "destroyed server could not be unregistered: {}", e);
                    self.registry.release_claim(&server.id);
                }
            }
        }
        reclaimed
    }

    /// Pool-wide view over live servers. Servers the provider no longer runs
    /// are purged along the way.
    pub async fn status(&self) -> Result<PoolStatus, PoolError> {
        let max = self.settings.max_peers_per_server;
        let mut servers = Vec::new();

        for server in self.registry.servers().await {
            match self.registry.liveness(self.provider.as_ref(), &server.id).await {
                Liveness::Live => servers.push(ServerSummary {
                    id: server.id,
                    ip: server.ip,
                    peers: server.peers.len(),
                    last_activity_at: server.last_activity_at,
                }),
                Liveness::Gone => self.purge_server(&server.id).await?,
                Liveness::Unknown(e) => warn!(server_id = %server.id, "excluded from status: {}", e),
            }
        }

        let total_peers: usize = servers.iter().map(|s| s.peers).sum();
        Ok(PoolStatus {
            active_servers: servers.len(),
            total_peers,
            max_peers_per_server: max,
            available_slots: (servers.len() * max).saturating_sub(total_peers),
            servers,
        })
    }

    pub async fn config(&self, username: &str) -> Result<String, PoolError> {
        self.registry
            .assignment(username)
            .await
            .map(|a| a.client_config)
            .ok_or_else(|| PoolError::NotConnected(username.to_string()))
    }

    /// Connection test: login identity, WireGuard installed, interface up.
    pub async fn probe(&self, server_id: &str) -> Result<ProbeReport, PoolError> {
        let server = self.registry.get(server_id).await?;
        let host = self.host_for(&server)?;
        let executor = self.executor.as_ref();

        let login = run_step(executor, &host, RemoteStep::Probe, "whoami").await?;
        let label = host.address.to_string();
        let installed = executor
            .run(&host, "command -v wg")
            .await
            .map_err(|e| PoolError::remote(RemoteStep::Probe, &label, e))?;
        let active = executor
            .run(&host, &format!("systemctl is-active wg-quick@{}", WG_INTERFACE))
            .await
            .map_err(|e| PoolError::remote(RemoteStep::Probe, &label, e))?;

        Ok(ProbeReport {
            server_id: server.id,
            ip: server.ip,
            login: login.trimmed().to_string(),
            wireguard_installed: installed.success(),
            interface_active: active.success() && active.trimmed() == "active",
        })
    }

    /// Administrative teardown. Returns the users whose assignments went with
    /// the server.
    pub async fn shutdown_server(&self, server_id: &str) -> Result<Vec<String>, PoolError> {
        let server = self.registry.get(server_id).await?;
        self.provider
            .destroy(server_id)
            .await
            .map_err(|e| PoolError::rejected(format!("destroy {}: {}", server_id, e)))?;
        self.registry.remove(server_id).await?;
        self.lifecycle.forget_server(server_id);

        let users: Vec<String> = server.peers.into_keys().collect();
        info!(server_id, disconnected = users.len(), "server shut down");
        Ok(users)
    }
}

/// Periodic reclamation, so idle servers go away even when nobody
/// disconnects.
pub async fn run_reclamation_loop(pool: Arc<Pool>, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let reclaimed = pool.cleanup_idle_servers().await;
        if !reclaimed.is_empty() {
            info!(count = reclaimed.len(), "periodic sweep reclaimed servers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeExecutor, FakeProvider, fake_key};
    use chrono::Duration as ChronoDuration;

    struct Harness {
        _dir: tempfile::TempDir,
        provider: Arc<FakeProvider>,
        exec: Arc<FakeExecutor>,
        registry: Arc<ServerRegistry>,
        pool: Arc<Pool>,
    }

    async fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::open(dir.path().join("state.json")).await.unwrap());
        let provider = Arc::new(FakeProvider::default());
        let exec = Arc::new(FakeExecutor::default());
        let pool = Arc::new(Pool::new(registry.clone(), provider.clone(), exec.clone(), PoolSettings::default()));
        Harness { _dir: dir, provider, exec, registry, pool }
    }

    async fn assert_invariants(registry: &ServerRegistry, max: usize) {
        let snap = registry.snapshot().await;
        for server in snap.servers.values() {
            assert!(server.peers.len() <= max, "server {} over capacity", server.id);
            let addrs: HashSet<Ipv4Addr> = server.peers.values().map(|p| p.allocated_address).collect();
            assert_eq!(addrs.len(), server.peers.len(), "duplicate address on {}", server.id);
        }
        for (user, a) in &snap.assignments {
            let holders: Vec<&ServerRecord> = snap.servers.values().filter(|s| s.peers.contains_key(user)).collect();
            assert_eq!(holders.len(), 1);
            assert_eq!(holders[0].id, a.server_id);
            assert_eq!(holders[0].peers[user].allocated_address, a.allocated_address);
        }
        let peers: usize = snap.servers.values().map(|s| s.peers.len()).sum();
        assert_eq!(peers, snap.assignments.len());
    }

    #[tokio::test(start_paused = true)]
    async fn empty_pool_creates_a_server() {
        let h = harness().await;
        let r = h.pool.join_or_create("alice").await.unwrap();
        assert_eq!(r.kind, AssignmentKind::CreatedNew);
        assert_eq!(r.server_ip, Ipv4Addr::new(203, 0, 113, 1));

        let servers = h.registry.servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].peers["alice"].allocated_address, Ipv4Addr::new(10, 0, 0, 2));
        assert!(servers[0].credential.is_some());
        assert!(r.client_config.contains("Address = 10.0.0.2/24"));
    }

    #[tokio::test(start_paused = true)]
    async fn partially_full_server_is_joined() {
        let h = harness().await;
        h.pool.join_or_create("alice").await.unwrap();
        assert_eq!(h.pool.join_or_create("dave").await.unwrap().kind, AssignmentKind::JoinedExisting);

        let r = h.pool.join_or_create("bob").await.unwrap();
        assert_eq!(r.kind, AssignmentKind::JoinedExisting);
        let server = h.registry.get("inst-1").await.unwrap();
        assert_eq!(server.peers.len(), 3);
        assert_eq!(server.peers["bob"].allocated_address, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(h.provider.created().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_server_triggers_a_second_one() {
        let h = harness().await;
        for u in ["alice", "bob", "dave"] {
            h.pool.join_or_create(u).await.unwrap();
        }
        let r = h.pool.join_or_create("carol").await.unwrap();
        assert_eq!(r.kind, AssignmentKind::CreatedNew);
        assert_eq!(r.server_ip, Ipv4Addr::new(203, 0, 113, 2));
        assert_eq!(h.registry.get("inst-2").await.unwrap().peers["carol"].allocated_address, Ipv4Addr::new(10, 0, 0, 2));
        assert_invariants(&h.registry, 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_join_is_idempotent() {
        let h = harness().await;
        let first = h.pool.join_or_create("alice").await.unwrap();
        let commands = h.exec.commands().len();
        let second = h.pool.join_or_create("alice").await.unwrap();

        assert_eq!(second.kind, AssignmentKind::AlreadyConnected);
        assert_eq!(second.client_config, first.client_config);
        assert_eq!(second.server_ip, first.server_ip);
        assert_eq!(h.exec.commands().len(), commands);
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_after_disconnect_issues_a_fresh_config() {
        let h = harness().await;
        let first = h.pool.join_or_create("alice").await.unwrap();
        h.pool.join_or_create("bob").await.unwrap();
        h.pool.disconnect("alice").await.unwrap();

        let again = h.pool.join_or_create("alice").await.unwrap();
        assert_ne!(again.kind, AssignmentKind::AlreadyConnected);
        assert_ne!(again.client_config, first.client_config);
        assert!(again.client_config.contains(&fake_key("priv:alice:2")));
        assert_invariants(&h.registry, 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn vanished_server_is_purged_and_replaced() {
        let h = harness().await;
        h.pool.join_or_create("alice").await.unwrap();
        h.pool.join_or_create("bob").await.unwrap();
        h.provider.vanish("inst-1");

        let r = h.pool.join_or_create("alice").await.unwrap();
        assert_eq!(r.kind, AssignmentKind::CreatedNew);
        assert!(matches!(h.registry.get("inst-1").await, Err(PoolError::NotFound(_))));
        assert!(h.registry.assignment("bob").await.is_none());
        assert_invariants(&h.registry, 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn unverifiable_assignment_is_reported_not_purged() {
        let h = harness().await;
        h.pool.join_or_create("alice").await.unwrap();
        h.provider.fail_inspections(true);
        let err = h.pool.join_or_create("alice").await.unwrap_err();
        assert!(matches!(err, PoolError::Provisioning { .. }));
        assert!(h.registry.assignment("alice").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_joins_never_overrun_capacity() {
        let h = harness().await;
        h.pool.join_or_create("seed").await.unwrap();

        let users: Vec<String> = (0..7).map(|i| format!("user{}", i)).collect();
        let handles: Vec<_> = users
            .iter()
            .map(|u| {
                let pool = h.pool.clone();
                let u = u.clone();
                tokio::spawn(async move { pool.join_or_create(&u).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(h.registry.snapshot().await.assignments.len(), 8);
        assert_invariants(&h.registry, 3).await;
    }

    #[tokio::test(start_paused = true)]
    async fn second_join_for_same_user_is_refused_while_running() {
        let h = harness().await;
        h.provider.boot_after_polls(5);
        let pool = h.pool.clone();
        let running = tokio::spawn(async move { pool.join_or_create("alice").await });
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(matches!(h.pool.join_or_create("alice").await, Err(PoolError::JoinInProgress(_))));
        running.await.unwrap().unwrap();
        assert_eq!(h.pool.join_or_create("alice").await.unwrap().kind, AssignmentKind::AlreadyConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_username_never_reaches_a_host() {
        let h = harness().await;
        let err = h.pool.join_or_create("x; rm -rf /").await.unwrap_err();
        assert!(matches!(err, PoolError::InvalidUsername(_)));
        assert!(h.provider.created().is_empty());
        assert!(h.exec.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn provisioning_failure_leaves_no_record() {
        let h = harness().await;
        h.provider.never_active();
        let err = h.pool.join_or_create("alice").await.unwrap_err();
        assert!(matches!(err, PoolError::Provisioning { .. }));
        assert!(h.registry.servers().await.is_empty());
        assert_eq!(h.provider.destroyed(), vec!["inst-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_unknown_user_is_not_connected() {
        let h = harness().await;
        assert!(matches!(h.pool.disconnect("ghost").await, Err(PoolError::NotConnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_succeeds_when_remote_removal_fails() {
        let h = harness().await;
        h.pool.join_or_create("alice").await.unwrap();
        h.exec.fail_on("remove");
        h.exec.fail_on("awk");

        h.pool.disconnect("alice").await.unwrap();
        assert!(h.registry.assignment("alice").await.is_none());
        assert!(matches!(h.pool.config("alice").await, Err(PoolError::NotConnected(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn emptied_server_is_reclaimed_after_idle_threshold() {
        let h = harness().await;
        h.pool.join_or_create("alice").await.unwrap();
        h.pool.disconnect("alice").await.unwrap();
        // The post-disconnect sweep sees a freshly active server.
        assert_eq!(h.registry.servers().await.len(), 1);

        let later = Utc::now() + ChronoDuration::minutes(31);
        assert_eq!(h.pool.cleanup_idle_servers_at(later).await, vec!["inst-1".to_string()]);
        assert!(h.registry.servers().await.is_empty());
        assert_eq!(h.provider.destroyed(), vec!["inst-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_sweep_reclaims_without_a_disconnect() {
        use crate::sys::traits::ProviderKind;

        let h = harness().await;
        let mut stale = ServerRecord::new("inst-9".into(), ProviderKind::Vultr, Ipv4Addr::new(203, 0, 113, 9), None);
        stale.last_activity_at = Utc::now() - ChronoDuration::minutes(31);
        h.registry.put(stale).await.unwrap();
        h.provider.adopt("inst-9", Ipv4Addr::new(203, 0, 113, 9));

        let sweeper = tokio::spawn(run_reclamation_loop(h.pool.clone(), Duration::from_secs(60)));

        // The first tick is skipped, nothing happens before a full interval.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.registry.servers().await.len(), 1);

        for _ in 0..120 {
            if h.registry.servers().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        assert!(h.registry.servers().await.is_empty());
        assert_eq!(h.provider.destroyed(), vec!["inst-9".to_string()]);
        assert!(h.exec.commands().is_empty());
        sweeper.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_spares_busy_and_recent_servers() {
        let h = harness().await;
        for u in ["alice", "bob", "dave", "carol"] {
            h.pool.join_or_create(u).await.unwrap();
        }
        h.pool.disconnect("carol").await.unwrap();

        let soon = Utc::now() + ChronoDuration::minutes(29);
        assert!(h.pool.cleanup_idle_servers_at(soon).await.is_empty());
        let later = Utc::now() + ChronoDuration::minutes(31);
        assert_eq!(h.pool.cleanup_idle_servers_at(later).await, vec!["inst-2".to_string()]);
        assert_eq!(h.registry.get("inst-1").await.unwrap().peers.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn status_counts_live_servers_only() {
        let h = harness().await;
        for u in ["alice", "bob", "dave", "carol"] {
            h.pool.join_or_create(u).await.unwrap();
        }
        let status = h.pool.status().await.unwrap();
        assert_eq!(status.active_servers, 2);
        assert_eq!(status.total_peers, 4);
        assert_eq!(status.available_slots, 2);

        h.provider.vanish("inst-2");
        let status = h.pool.status().await.unwrap();
        assert_eq!(status.active_servers, 1);
        assert_eq!(status.available_slots, 0);
        assert!(h.registry.assignment("carol").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_removes_server_and_its_users() {
        let h = harness().await;
        h.pool.join_or_create("alice").await.unwrap();
        h.pool.join_or_create("bob").await.unwrap();

        let users = h.pool.shutdown_server("inst-1").await.unwrap();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
        assert!(h.registry.snapshot().await.assignments.is_empty());
        assert!(matches!(h.pool.shutdown_server("inst-1").await, Err(PoolError::NotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn probe_reports_interface_state() {
        let h = harness().await;
        h.pool.join_or_create("alice").await.unwrap();
        h.exec.respond("whoami", "root");
        h.exec.respond("systemctl is-active", "active");

        let report = h.pool.probe("inst-1").await.unwrap();
        assert_eq!(report.login, "root");
        assert!(report.wireguard_installed);
        assert!(report.interface_active);

        h.exec.exit_on("command -v wg", 1);
        assert!(!h.pool.probe("inst-1").await.unwrap().wireguard_installed);
    }

    #[tokio::test(start_paused = true)]
    async fn static_servers_use_the_configured_identity() {
        use crate::sys::provider::StaticServerProvider;
        use crate::sys::secrets::Credential;

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(ServerRegistry::open(dir.path().join("state.json")).await.unwrap());
        let exec = Arc::new(FakeExecutor::default());
        let provider = Arc::new(StaticServerProvider::new(Ipv4Addr::new(198, 51, 100, 4)));
        let settings = PoolSettings {
            max_peers_per_server: 2,
            default_auth: Some(HostAuth::Password(Credential::new("static-pw".into()))),
            ..PoolSettings::default()
        };
        let pool = Pool::new(registry.clone(), provider, exec.clone(), settings);

        assert_eq!(pool.join_or_create("alice").await.unwrap().kind, AssignmentKind::CreatedNew);
        assert_eq!(pool.join_or_create("bob").await.unwrap().kind, AssignmentKind::JoinedExisting);
        let err = pool.join_or_create("carol").await.unwrap_err();
        assert!(matches!(err, PoolError::Provisioning { .. }));
        assert!(exec.commands_matching("setup_complete").is_empty());
        assert_eq!(registry.get("static-198.51.100.4").await.unwrap().peers.len(), 2);
    }
}
