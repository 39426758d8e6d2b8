// src/registry.rs

// Server Registry: the durable snapshot of servers, their peers, and the
// user assignments derived from them.
//
// Servers and assignments live in ONE persisted document so the secondary
// index can never be written independently of its source of truth. Every
// mutation is applied to a copy, written to disk (temp file + rename), and
// only then swapped in: a failed write leaves memory and disk untouched.
//
// Slot reservations are in-memory only. They hold a capacity slot and an
// overlay address for a join that is still running remote steps, so two
// concurrent joins can never both take a server's last slot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::PoolError;
use crate::sys::secrets::Credential;
use crate::sys::traits::{ComputeProvider, ProviderKind};
use crate::wireguard;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub username: String,
    pub allocated_address: Ipv4Addr,
    pub public_key: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: String,
    pub provider: ProviderKind,
    pub ip: Ipv4Addr,
    /// Bootstrap-phase root password. `None` for hosts reached through the
    /// pool-wide configured identity (static servers).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<Credential>,
    #[serde(default)]
    pub peers: BTreeMap<String, PeerRecord>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}

impl ServerRecord {
    pub fn new(id: String, provider: ProviderKind, ip: Ipv4Addr, credential: Option<Credential>) -> Self {
        let now = Utc::now();
        Self {
            id,
            provider,
            ip,
            credential,
            peers: BTreeMap::new(),
            created_at: now,
            last_activity_at: now,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAssignment {
    pub server_id: String,
    pub allocated_address: Ipv4Addr,
    pub client_config: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolSnapshot {
    #[serde(default)]
    pub servers: BTreeMap<String, ServerRecord>,
    #[serde(default)]
    pub assignments: BTreeMap<String, UserAssignment>,
}

impl PoolSnapshot {
    /// Drops assignments the server map does not corroborate, and peers with
    /// no assignment. Returns one `StateDrift` per repair.
    pub fn reconcile(&mut self) -> Vec<PoolError> {
        let mut drift = Vec::new();

        let stale: Vec<(String, String)> = self
            .assignments
            .iter()
            .filter_map(|(user, a)| {
                let detail = match self.servers.get(&a.server_id) {
                    None => format!("server {} is not registered", a.server_id),
                    Some(s) => match s.peers.get(user) {
                        None => format!("no peer record on server {}", a.server_id),
                        Some(p) if p.allocated_address != a.allocated_address => format!(
                            "assignment says {} but peer record says {}",
                            a.allocated_address, p.allocated_address
                        ),
                        Some(_) => return None,
                    },
                };
                Some((user.clone(), detail))
            })
            .collect();

        for (user, detail) in stale {
            self.assignments.remove(&user);
            drift.push(PoolError::StateDrift { username: user, detail });
        }

        for server in self.servers.values_mut() {
            let orphans: Vec<String> = server
                .peers
                .keys()
                .filter(|u| {
                    self.assignments
                        .get(*u)
                        .map(|a| a.server_id != server.id)
                        .unwrap_or(true)
                })
                .cloned()
                .collect();
            for user in orphans {
                if let Some(peer) = server.peers.remove(&user) {
                    drift.push(PoolError::StateDrift {
                        username: user,
                        detail: format!(
                            "peer {} on server {} had no assignment; remote stanza may remain",
                            peer.public_key, server.id
                        ),
                    });
                }
            }
        }

        drift
    }
}

/// Answer of the provider-side liveness check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Live,
    /// Unknown to the provider, or in a non-active state.
    Gone,
    /// The provider could not be asked.
    Unknown(String),
}

#[derive(Debug, Clone)]
struct Reservation {
    server_id: String,
    address: Ipv4Addr,
}

#[derive(Debug, Default)]
struct Reservations {
    by_user: HashMap<String, Reservation>,
    /// Servers claimed by the reclamation sweep.
    retiring: HashSet<String>,
}

impl Reservations {
    fn on_server(&self, server_id: &str) -> impl Iterator<Item = &Reservation> {
        self.by_user.values().filter(move |r| r.server_id == server_id)
    }
}

pub struct ServerRegistry {
    path: PathBuf,
    snapshot: Mutex<PoolSnapshot>,
    reservations: Arc<StdMutex<Reservations>>,
}

/// A held capacity slot and overlay address. Dropping it without
/// `ServerRegistry::commit_peer` releases the slot.
#[derive(Debug)]
pub struct SlotReservation {
    pub username: String,
    pub server_id: String,
    pub address: Ipv4Addr,
    reservations: Arc<StdMutex<Reservations>>,
}

impl Drop for SlotReservation {
    fn drop(&mut self) {
        if let Ok(mut table) = self.reservations.lock() {
            table.by_user.remove(&self.username);
        }
    }
}

impl ServerRegistry {
    /// Loads the snapshot at `path` (an absent file is an empty pool) and
    /// repairs any assignment/peer divergence before serving.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let path = path.as_ref().to_path_buf();
        let mut snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<PoolSnapshot>(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PoolSnapshot::default(),
            Err(e) => return Err(e.into()),
        };

        let drift = snapshot.reconcile();
        for d in &drift {
            warn!("repaired on load: {}", d);
        }
        if !drift.is_empty() {
            write_snapshot(&path, &snapshot).await?;
        }

        info!(
            servers = snapshot.servers.len(),
            assignments = snapshot.assignments.len(),
            "registry loaded from {}",
            path.display()
        );

        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
            reservations: Arc::new(StdMutex::new(Reservations::default())),
        })
    }

    pub async fn get(&self, server_id: &str) -> Result<ServerRecord, PoolError> {
        self.snapshot
            .lock()
            .await
            .servers
            .get(server_id)
            .cloned()
            .ok_or_else(|| PoolError::NotFound(server_id.to_string()))
    }

    /// Upsert, persisted before returning.
    pub async fn put(&self, record: ServerRecord) -> Result<(), PoolError> {
        self.mutate(|snap| {
            snap.servers.insert(record.id.clone(), record);
            Ok(())
        })
        .await
    }

    /// Removes the server and every assignment that pointed at it.
    pub async fn remove(&self, server_id: &str) -> Result<Option<ServerRecord>, PoolError> {
        let removed = self
            .mutate(|snap| {
                let removed = snap.servers.remove(server_id);
                snap.assignments.retain(|_, a| a.server_id != server_id);
                Ok(removed)
            })
            .await?;
        self.lock_reservations().retiring.remove(server_id);
        Ok(removed)
    }

    /// Servers with `peers + in-flight reservations < max`, oldest first.
    pub async fn list_with_capacity(&self, max: usize) -> Vec<ServerRecord> {
        let snap = self.snapshot.lock().await;
        let table = self.lock_reservations();
        let mut open: Vec<ServerRecord> = snap
            .servers
            .values()
            .filter(|s| !table.retiring.contains(&s.id))
            .filter(|s| s.peers.len() + table.on_server(&s.id).count() < max)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        open
    }

    pub async fn liveness(&self, provider: &dyn ComputeProvider, server_id: &str) -> Liveness {
        match provider.inspect(server_id).await {
            Ok(Some(state)) if state.active_ip().is_some() => Liveness::Live,
            Ok(_) => Liveness::Gone,
            Err(e) => Liveness::Unknown(e),
        }
    }

    pub async fn verify_live(&self, provider: &dyn ComputeProvider, server_id: &str) -> bool {
        self.liveness(provider, server_id).await == Liveness::Live
    }

    pub async fn servers(&self) -> Vec<ServerRecord> {
        self.snapshot.lock().await.servers.values().cloned().collect()
    }

    pub async fn assignment(&self, username: &str) -> Option<UserAssignment> {
        self.snapshot.lock().await.assignments.get(username).cloned()
    }

    pub async fn snapshot(&self) -> PoolSnapshot {
        self.snapshot.lock().await.clone()
    }

    /// Atomically takes a slot and the lowest free overlay address on
    /// `server_id`. `Ok(None)` when the server is full, retiring, or gone.
    pub async fn try_reserve(
        &self,
        server_id: &str,
        username: &str,
        max: usize,
    ) -> Result<Option<SlotReservation>, PoolError> {
        let snap = self.snapshot.lock().await;
        let mut table = self.lock_reservations();

        if table.by_user.contains_key(username) {
            return Err(PoolError::JoinInProgress(username.to_string()));
        }
        let Some(server) = snap.servers.get(server_id) else {
            return Ok(None);
        };
        if table.retiring.contains(server_id) {
            return Ok(None);
        }
        if server.peers.len() + table.on_server(server_id).count() >= max {
            return Ok(None);
        }

        let used: Vec<Ipv4Addr> = server
            .peers
            .values()
            .map(|p| p.allocated_address)
            .chain(table.on_server(server_id).map(|r| r.address))
            .collect();
        let address = wireguard::allocate_address(&used).ok_or_else(|| PoolError::AddressPoolExhausted {
            server_id: server_id.to_string(),
        })?;

        table.by_user.insert(
            username.to_string(),
            Reservation { server_id: server_id.to_string(), address },
        );

        Ok(Some(SlotReservation {
            username: username.to_string(),
            server_id: server_id.to_string(),
            address,
            reservations: self.reservations.clone(),
        }))
    }

    /// Registers a freshly provisioned server and reserves its first slot for
    /// the user that triggered the creation.
    pub async fn register_and_reserve(
        &self,
        record: ServerRecord,
        username: &str,
        max: usize,
    ) -> Result<SlotReservation, PoolError> {
        let server_id = record.id.clone();
        self.mutate(|snap| {
            if snap.servers.contains_key(&record.id) {
                return Err(PoolError::rejected(format!(
                    "provider returned {} which is already in the pool",
                    record.id
                )));
            }
            snap.servers.insert(record.id.clone(), record);
            Ok(())
        })
        .await?;

        self.try_reserve(&server_id, username, max)
            .await?
            .ok_or_else(|| PoolError::AddressPoolExhausted { server_id })
    }

    /// Persists the new peer and its assignment in one write and converts the
    /// reservation into them.
    pub async fn commit_peer(
        &self,
        reservation: SlotReservation,
        peer: PeerRecord,
        client_config: String,
    ) -> Result<UserAssignment, PoolError> {
        let assignment = UserAssignment {
            server_id: reservation.server_id.clone(),
            allocated_address: peer.allocated_address,
            client_config,
        };
        let stored = assignment.clone();
        self.mutate(|snap| {
            let server = snap
                .servers
                .get_mut(&reservation.server_id)
                .ok_or_else(|| PoolError::NotFound(reservation.server_id.clone()))?;
            server.last_activity_at = peer.added_at;
            server.peers.insert(peer.username.clone(), peer);
            snap.assignments.insert(reservation.username.clone(), stored);
            Ok(())
        })
        .await?;
        drop(reservation);
        Ok(assignment)
    }

    /// Deletes the user's assignment and peer record in one write. Returns the
    /// removed peer, if the server still had it.
    pub async fn detach_peer(&self, username: &str) -> Result<Option<PeerRecord>, PoolError> {
        self.mutate(|snap| {
            let Some(assignment) = snap.assignments.remove(username) else {
                return Err(PoolError::NotConnected(username.to_string()));
            };
            let peer = snap.servers.get_mut(&assignment.server_id).and_then(|s| {
                s.last_activity_at = Utc::now();
                s.peers.remove(username)
            });
            Ok(peer)
        })
        .await
    }

    /// Drops a single assignment (and its peer record) that failed
    /// corroboration.
    pub async fn purge_assignment(&self, username: &str) -> Result<(), PoolError> {
        self.mutate(|snap| {
            if let Some(a) = snap.assignments.remove(username) {
                if let Some(server) = snap.servers.get_mut(&a.server_id) {
                    server.peers.remove(username);
                }
            }
            Ok(())
        })
        .await
    }

    /// Marks an idle server as being reclaimed, so no join can reserve into
    /// it. Re-checks emptiness and idleness under the lock.
    pub async fn claim_for_reclamation(&self, server_id: &str, idle_before: DateTime<Utc>) -> bool {
        let snap = self.snapshot.lock().await;
        let mut table = self.lock_reservations();
        let Some(server) = snap.servers.get(server_id) else {
            return false;
        };
        let idle = server.peers.is_empty()
            && table.on_server(server_id).next().is_none()
            && server.last_activity_at < idle_before;
        if idle {
            table.retiring.insert(server_id.to_string());
        }
        idle
    }

    pub fn release_claim(&self, server_id: &str) {
        self.lock_reservations().retiring.remove(server_id);
    }

    fn lock_reservations(&self) -> std::sync::MutexGuard<'_, Reservations> {
        // The table holds no invariants that a panicking holder could break.
        match self.reservations.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn mutate<R>(
        &self,
        apply: impl FnOnce(&mut PoolSnapshot) -> Result<R, PoolError>,
    ) -> Result<R, PoolError> {
        let mut current = self.snapshot.lock().await;
        let mut next = current.clone();
        let out = apply(&mut next)?;
        write_snapshot(&self.path, &next).await?;
        *current = next;
        Ok(out)
    }
}

/// Write-then-rename with owner-only permissions: the snapshot holds setup
/// passwords and client configs.
async fn write_snapshot(path: &Path, snapshot: &PoolSnapshot) -> Result<(), PoolError> {
    let bytes = serde_json::to_vec_pretty(snapshot)?;
    let tmp_path = path.with_extension("json.tmp");

    let mut opts = std::fs::OpenOptions::new();
    opts.write(true).create(true).truncate(true).mode(0o600);
    let mut file = tokio::fs::OpenOptions::from(opts).open(&tmp_path).await?;
    file.write_all(&bytes).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}
