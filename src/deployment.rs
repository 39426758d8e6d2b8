// src/deployment.rs

// Per-user deployment status records behind the asynchronous `join` route.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Mutex, MutexGuard};

use crate::error::PoolError;
use crate::pool::{AssignmentKind, AssignmentResult};
use crate::provisioning::ProvisionPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    Idle,
    Starting,
    Completed,
    Error,
}

/// Outcome summary. The client config itself is served by `/config`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentOutcome {
    pub kind: AssignmentKind,
    pub server_ip: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeploymentRecord {
    pub status: DeploymentState,
    pub message: String,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<DeploymentOutcome>,
    pub updated_at: DateTime<Utc>,
}

impl DeploymentRecord {
    fn idle() -> Self {
        Self {
            status: DeploymentState::Idle,
            message: String::new(),
            progress: 0,
            result: None,
            updated_at: Utc::now(),
        }
    }
}

/// Progress shown for each provisioning phase of a fresh server.
pub fn phase_progress(phase: &ProvisionPhase) -> (u8, String) {
    match phase {
        ProvisionPhase::Requested { instance_id } => (20, format!("Server {} requested", instance_id)),
        ProvisionPhase::Booting => (30, "Waiting for server to boot".to_string()),
        ProvisionPhase::Active(ip) => (50, format!("Server active at {}", ip)),
        ProvisionPhase::BootstrapPending(ip) => (60, format!("Installing WireGuard on {}", ip)),
        ProvisionPhase::Ready(ip) => (85, format!("Server {} ready, adding peer", ip)),
        ProvisionPhase::TimedOut => (0, "Provisioning timed out".to_string()),
    }
}

/// How long a completed or failed record stays readable.
const FINISHED_RETENTION_MINUTES: i64 = 60;

pub struct DeploymentTracker {
    records: Mutex<HashMap<String, DeploymentRecord>>,
    retention: chrono::Duration,
}

impl Default for DeploymentTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl DeploymentTracker {
    pub fn new() -> Self {
        Self::with_retention(chrono::Duration::minutes(FINISHED_RETENTION_MINUTES))
    }

    pub fn with_retention(retention: chrono::Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            retention,
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, DeploymentRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Opens a `starting` record. A second join for the same user while one
    /// is running is refused.
    pub fn begin(&self, username: &str) -> Result<(), PoolError> {
        self.evict_finished(Utc::now());
        let mut records = self.records();
        if records.get(username).is_some_and(|r| r.status == DeploymentState::Starting) {
            return Err(PoolError::JoinInProgress(username.to_string()));
        }
        records.insert(
            username.to_string(),
            DeploymentRecord {
                status: DeploymentState::Starting,
                message: format!("Connecting {} to the VPN pool", username),
                progress: 5,
                result: None,
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    /// Progress never moves backwards while starting.
    pub fn progress(&self, username: &str, progress: u8, message: impl Into<String>) {
        let mut records = self.records();
        if let Some(r) = records.get_mut(username) {
            if r.status == DeploymentState::Starting && progress >= r.progress {
                r.progress = progress.min(99);
                r.message = message.into();
                r.updated_at = Utc::now();
            }
        }
    }

    pub fn complete(&self, username: &str, result: &AssignmentResult) {
        let message = match result.kind {
            AssignmentKind::AlreadyConnected => format!("{} is already connected", username),
            AssignmentKind::JoinedExisting => format!("Connected {} to an existing server", username),
            AssignmentKind::CreatedNew => format!("Connected {} to a new server", username),
        };
        self.records().insert(
            username.to_string(),
            DeploymentRecord {
                status: DeploymentState::Completed,
                message,
                progress: 100,
                result: Some(DeploymentOutcome { kind: result.kind, server_ip: result.server_ip }),
                updated_at: Utc::now(),
            },
        );
    }

    pub fn fail(&self, username: &str, error: &PoolError) {
        self.records().insert(
            username.to_string(),
            DeploymentRecord {
                status: DeploymentState::Error,
                message: error.to_string(),
                progress: 0,
                result: None,
                updated_at: Utc::now(),
            },
        );
    }

    /// Unknown users read as `idle`.
    pub fn get(&self, username: &str) -> DeploymentRecord {
        self.evict_finished(Utc::now());
        self.records().get(username).cloned().unwrap_or_else(DeploymentRecord::idle)
    }

    /// Drops completed and failed records last updated before
    /// `now - retention`. Running joins are never evicted.
    pub fn evict_finished(&self, now: DateTime<Utc>) -> usize {
        let Some(cutoff) = now.checked_sub_signed(self.retention) else {
            return 0;
        };
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, r| r.status == DeploymentState::Starting || r.updated_at >= cutoff);
        before - records.len()
    }

    pub fn reset(&self, username: &str) {
        self.records().remove(username);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result() -> AssignmentResult {
        AssignmentResult {
            kind: AssignmentKind::CreatedNew,
            server_ip: Ipv4Addr::new(203, 0, 113, 1),
            client_config: "[Interface]\n".into(),
        }
    }

    #[test]
    fn unknown_user_is_idle() {
        let t = DeploymentTracker::new();
        let r = t.get("alice");
        assert_eq!(r.status, DeploymentState::Idle);
        assert_eq!(r.progress, 0);
    }

    #[test]
    fn concurrent_begin_is_refused_per_user() {
        let t = DeploymentTracker::new();
        t.begin("alice").unwrap();
        assert!(matches!(t.begin("alice"), Err(PoolError::JoinInProgress(_))));
        t.begin("bob").unwrap();
    }

    #[test]
    fn progress_is_monotonic_and_stops_short_of_done() {
        let t = DeploymentTracker::new();
        t.begin("alice").unwrap();
        t.progress("alice", 50, "half");
        t.progress("alice", 30, "back");
        assert_eq!(t.get("alice").progress, 50);
        assert_eq!(t.get("alice").message, "half");
        t.progress("alice", 100, "done?");
        assert_eq!(t.get("alice").progress, 99);
    }

    #[test]
    fn completion_keeps_server_but_not_config() {
        let t = DeploymentTracker::new();
        t.begin("alice").unwrap();
        t.complete("alice", &result());
        let r = t.get("alice");
        assert_eq!(r.status, DeploymentState::Completed);
        assert_eq!(r.progress, 100);
        let json = serde_json::to_string(&r).unwrap();
        assert!(json.contains("\"created_new\""));
        assert!(!json.contains("Interface"));
        t.begin("alice").unwrap();
    }

    #[test]
    fn failure_records_message_and_allows_retry() {
        let t = DeploymentTracker::new();
        t.begin("alice").unwrap();
        t.fail("alice", &PoolError::rejected("quota exceeded"));
        let r = t.get("alice");
        assert_eq!(r.status, DeploymentState::Error);
        assert!(r.message.contains("quota exceeded"));
        t.begin("alice").unwrap();
    }

    #[test]
    fn finished_records_expire_but_running_ones_stay() {
        let t = DeploymentTracker::new();
        t.begin("alice").unwrap();
        t.complete("alice", &result());
        t.begin("bob").unwrap();
        t.fail("bob", &PoolError::rejected("quota exceeded"));
        t.begin("carol").unwrap();

        assert_eq!(t.evict_finished(Utc::now() + chrono::Duration::minutes(59)), 0);
        assert_eq!(t.evict_finished(Utc::now() + chrono::Duration::minutes(61)), 2);
        assert_eq!(t.get("alice").status, DeploymentState::Idle);
        assert_eq!(t.get("bob").status, DeploymentState::Idle);
        assert_eq!(t.get("carol").status, DeploymentState::Starting);
    }

    #[test]
    fn expired_records_are_dropped_on_access() {
        let t = DeploymentTracker::with_retention(chrono::Duration::zero());
        t.begin("alice").unwrap();
        t.fail("alice", &PoolError::rejected("quota exceeded"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(t.get("alice").status, DeploymentState::Idle);
        assert!(t.records().is_empty());
    }

    #[test]
    fn phases_map_to_increasing_progress() {
        let ip = Ipv4Addr::new(203, 0, 113, 1);
        let phases = [
            ProvisionPhase::Requested { instance_id: "i".into() },
            ProvisionPhase::Booting,
            ProvisionPhase::Active(ip),
            ProvisionPhase::BootstrapPending(ip),
            ProvisionPhase::Ready(ip),
        ];
        let values: Vec<u8> = phases.iter().map(|p| phase_progress(p).0).collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }
}
