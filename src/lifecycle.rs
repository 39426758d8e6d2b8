// src/lifecycle.rs

// Peer Lifecycle Manager: adds and removes a peer on one server, keeping the
// remote WireGuard surfaces (config file + live interface) and the registry
// in step.
//
// Known consistency gap: the stanza is appended to `wg0.conf` before the live
// interface is updated. A process killed between the two leaves a peer that
// only becomes active on the next daemon restart. The reverse order would
// leave a live peer that vanishes on restart; neither is atomic.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{PoolError, RemoteStep};
use crate::registry::{PeerRecord, ServerRecord, ServerRegistry, SlotReservation, UserAssignment};
use crate::sys::traits::{RemoteExecutor, RemoteHost};
use crate::wireguard::{self, ClientConfigParams, KeyGenerator, commands, run_step};

pub struct PeerLifecycle {
    executor: Arc<dyn RemoteExecutor>,
    registry: Arc<ServerRegistry>,
    dns: String,
    listen_port: u16,
    // Serializes config-file edits per server.
    edit_locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl PeerLifecycle {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        registry: Arc<ServerRegistry>,
        dns: String,
        listen_port: u16,
    ) -> Self {
        Self {
            executor,
            registry,
            dns,
            listen_port,
            edit_locks: StdMutex::new(HashMap::new()),
        }
    }

    fn edit_lock(&self, server_id: &str) -> Arc<Mutex<()>> {
        let mut locks = match self.edit_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.entry(server_id.to_string()).or_default().clone()
    }

    pub fn forget_server(&self, server_id: &str) {
        if let Ok(mut locks) = self.edit_locks.lock() {
            locks.remove(server_id);
        }
    }

    /// Adds the reserved peer to `server`. Key generation, the stanza append,
    /// and the live apply are fatal; nothing is written locally until all of
    /// them succeed, and remote leftovers are rolled back best-effort.
    pub async fn add_peer(
        &self,
        reservation: SlotReservation,
        server: &ServerRecord,
        host: &RemoteHost,
    ) -> Result<UserAssignment, PoolError> {
        let username = reservation.username.clone();
        let address = reservation.address;
        let executor = self.executor.as_ref();

        let lock = self.edit_lock(&server.id);
        let _guard = lock.lock().await;

        let keys = match KeyGenerator::new(executor).generate(host, &username).await {
            Ok(keys) => keys,
            Err(e) => {
                self.best_effort(host, RemoteStep::RemoveKeyFiles, &commands::remove_key_files(&username)).await;
                return Err(e);
            }
        };

        let append = commands::append_stanza(&username, &keys.public_key, address);
        if let Err(e) = run_step(executor, host, RemoteStep::AppendConfig, &append).await {
            self.best_effort(host, RemoteStep::RemoveKeyFiles, &commands::remove_key_files(&username)).await;
            return Err(e);
        }

        if let Err(e) = self.apply_live(host, &keys.public_key, address).await {
            self.rollback_remote(host, &username, &keys.public_key).await;
            // The failed restart may have left wg0 down for every other peer.
            self.best_effort(host, RemoteStep::ApplyLive, &commands::restart_interface()).await;
            return Err(e);
        }

        let client_config = wireguard::render_client_config(&ClientConfigParams {
            private_key: &keys.private_key,
            address,
            dns: &self.dns,
            server_public_key: &keys.server_public_key,
            endpoint: server.ip,
            listen_port: self.listen_port,
        });

        let peer = PeerRecord {
            username: username.clone(),
            allocated_address: address,
            public_key: keys.public_key.clone(),
            added_at: Utc::now(),
        };

        match self.registry.commit_peer(reservation, peer, client_config).await {
            Ok(assignment) => {
                info!(server_id = %server.id, %username, %address, "peer added");
                Ok(assignment)
            }
            Err(e) => {
                warn!(server_id = %server.id, %username, "registry write failed, undoing remote peer: {}", e);
                self.best_effort(host, RemoteStep::RemoveLive, &commands::remove_live(&keys.public_key)).await;
                self.rollback_remote(host, &username, &keys.public_key).await;
                Err(e)
            }
        }
    }

    /// `wg set` first; a daemon restart re-reads the file when the live
    /// update is refused.
    async fn apply_live(&self, host: &RemoteHost, public_key: &str, address: std::net::Ipv4Addr) -> Result<(), PoolError> {
        let executor = self.executor.as_ref();
        let live = run_step(executor, host, RemoteStep::ApplyLive, &commands::apply_live(public_key, address)).await;
        let Err(live_err) = live else {
            return Ok(());
        };

        warn!(host = %host.address, "live peer apply failed, restarting interface: {}", live_err);
        run_step(executor, host, RemoteStep::ApplyLive, &commands::restart_interface())
            .await
            .map(|_| ())
            .map_err(|restart_err| match restart_err {
                PoolError::RemoteExecution { step, host, message } => PoolError::RemoteExecution {
                    step,
                    host,
                    message: format!("{}; restart also failed: {}", live_err, message),
                },
                other => other,
            })
    }

    async fn rollback_remote(&self, host: &RemoteHost, username: &str, public_key: &str) {
        self.best_effort(host, RemoteStep::EditConfig, &commands::remove_stanza(username, public_key)).await;
        self.best_effort(host, RemoteStep::RemoveKeyFiles, &commands::remove_key_files(username)).await;
    }

    /// Revokes `username` on `server`. Remote steps are best-effort; the
    /// assignment and peer record are deleted regardless.
    pub async fn remove_peer(
        &self,
        username: &str,
        server: &ServerRecord,
        host: &RemoteHost,
    ) -> Result<Option<PeerRecord>, PoolError> {
        if let Some(peer) = server.peers.get(username) {
            let lock = self.edit_lock(&server.id);
            let _guard = lock.lock().await;

            self.best_effort(host, RemoteStep::RemoveLive, &commands::remove_live(&peer.public_key)).await;
            self.best_effort(host, RemoteStep::EditConfig, &commands::remove_stanza(username, &peer.public_key)).await;
            self.best_effort(host, RemoteStep::RemoveKeyFiles, &commands::remove_key_files(username)).await;
        } else {
            warn!(server_id = %server.id, username, "no peer record on server; skipping remote revocation");
        }

        let removed = self.registry.detach_peer(username).await?;
        info!(server_id = %server.id, username, "peer removed");
        Ok(removed)
    }

    async fn best_effort(&self, host: &RemoteHost, step: RemoteStep, command: &str) {
        if let Err(e) = run_step(self.executor.as_ref(), host, step, command).await {
            warn!("cleanup step ignored: {}", e);
        }
    }
}
