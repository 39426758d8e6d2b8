// src/testing.rs

// In-process fakes for the remote executor and compute provider.

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::sys::bootstrap::READY_TOKEN;
use crate::sys::traits::{
    CommandOutput, ComputeProvider, InstanceRequest, InstanceState, InstanceStatus, ProviderKind,
    RemoteExecutor, RemoteHost,
};

/// Deterministic, valid-looking WireGuard key for `tag`.
pub fn fake_key(tag: &str) -> String {
    let mut bytes = [b'.'; 32];
    for (slot, b) in bytes.iter_mut().zip(tag.bytes()) {
        *slot = b;
    }
    general_purpose::STANDARD.encode(bytes)
}

fn client_name(command: &str, suffix: &str) -> Option<String> {
    let re = Regex::new(&format!(r"clients/([A-Za-z0-9_.-]+){}", regex::escape(suffix))).unwrap();
    re.captures(command).map(|c| c[1].to_string())
}

/// Emulates a WireGuard host: key generation, key reads, marker polls.
/// Every other command succeeds with empty output unless scripted.
#[derive(Default)]
pub struct FakeExecutor {
    log: Mutex<Vec<(Ipv4Addr, String)>>,
    failures: Mutex<Vec<String>>,
    exits: Mutex<Vec<(String, i32)>>,
    responses: Mutex<Vec<(String, String)>>,
    generations: Mutex<HashMap<String, u32>>,
    not_ready: Mutex<HashSet<Ipv4Addr>>,
}

impl FakeExecutor {
    /// Transport failure for any command containing `needle`.
    pub fn fail_on(&self, needle: &str) {
        self.failures.lock().unwrap().push(needle.to_string());
    }

    pub fn clear_failures(&self) {
        self.failures.lock().unwrap().clear();
    }

    /// Non-zero exit for any command containing `needle`.
    pub fn exit_on(&self, needle: &str, code: i32) {
        self.exits.lock().unwrap().push((needle.to_string(), code));
    }

    pub fn respond(&self, needle: &str, stdout: &str) {
        self.responses.lock().unwrap().push((needle.to_string(), stdout.to_string()));
    }

    /// The bootstrap marker is never present on `host`.
    pub fn never_ready(&self, host: Ipv4Addr) {
        self.not_ready.lock().unwrap().insert(host);
    }

    pub fn commands(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(_, c)| c.clone()).collect()
    }

    pub fn commands_matching(&self, needle: &str) -> Vec<String> {
        self.commands().into_iter().filter(|c| c.contains(needle)).collect()
    }

    fn generation(&self, username: &str) -> u32 {
        self.generations.lock().unwrap().get(username).copied().unwrap_or(0)
    }
}

#[async_trait]
impl RemoteExecutor for FakeExecutor {
    async fn run(&self, host: &RemoteHost, command: &str) -> Result<CommandOutput, String> {
        self.log.lock().unwrap().push((host.address, command.to_string()));

        if self.failures.lock().unwrap().iter().any(|n| command.contains(n.as_str())) {
            return Err("connection refused".into());
        }
        if let Some((_, code)) = self.exits.lock().unwrap().iter().find(|(n, _)| command.contains(n.as_str())) {
            return Ok(CommandOutput { exit_code: *code, stdout: String::new(), stderr: "scripted failure".into() });
        }
        if let Some((_, out)) = self.responses.lock().unwrap().iter().find(|(n, _)| command.contains(n.as_str())) {
            return Ok(CommandOutput { exit_code: 0, stdout: out.clone(), stderr: String::new() });
        }

        let stdout = if command.contains("wg genkey") {
            if let Some(user) = client_name(command, "_private.key") {
                *self.generations.lock().unwrap().entry(user).or_insert(0) += 1;
            }
            String::new()
        } else if let Some(user) = command.strip_prefix("cat ").and_then(|c| client_name(c, "_private.key")) {
            fake_key(&format!("priv:{}:{}", user, self.generation(&user)))
        } else if let Some(user) = command.strip_prefix("cat ").and_then(|c| client_name(c, "_public.key")) {
            fake_key(&format!("pub:{}:{}", user, self.generation(&user)))
        } else if command.contains("server_public.key") {
            fake_key(&format!("srv:{}", host.address))
        } else if command.contains("setup_complete") {
            if self.not_ready.lock().unwrap().contains(&host.address) {
                String::new()
            } else {
                READY_TOKEN.to_string()
            }
        } else {
            String::new()
        };

        Ok(CommandOutput { exit_code: 0, stdout: format!("{}\n", stdout), stderr: String::new() })
    }
}

#[derive(Clone)]
struct FakeInstance {
    ip: Ipv4Addr,
    polls_until_active: u32,
    gone: bool,
}

/// Cloud provider whose instances boot after a scripted number of polls.
#[derive(Default)]
pub struct FakeProvider {
    instances: Mutex<HashMap<String, FakeInstance>>,
    created: Mutex<Vec<String>>,
    destroyed: Mutex<Vec<String>>,
    boot_polls: Mutex<u32>,
    never_active: Mutex<bool>,
    reject_create: Mutex<bool>,
    inspect_error: Mutex<bool>,
}

impl FakeProvider {
    pub fn boot_after_polls(&self, polls: u32) {
        *self.boot_polls.lock().unwrap() = polls;
    }

    pub fn never_active(&self) {
        *self.never_active.lock().unwrap() = true;
    }

    pub fn reject_creates(&self) {
        *self.reject_create.lock().unwrap() = true;
    }

    pub fn fail_inspections(&self, fail: bool) {
        *self.inspect_error.lock().unwrap() = fail;
    }

    /// Simulates provider-side loss of the VM.
    pub fn vanish(&self, id: &str) {
        if let Some(inst) = self.instances.lock().unwrap().get_mut(id) {
            inst.gone = true;
        }
    }

    /// Registers an already-running instance.
    pub fn adopt(&self, id: &str, ip: Ipv4Addr) {
        self.instances.lock().unwrap().insert(
            id.to_string(),
            FakeInstance { ip, polls_until_active: 0, gone: false },
        );
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Vultr
    }

    async fn create_instance(&self, _request: &InstanceRequest) -> Result<String, String> {
        if *self.reject_create.lock().unwrap() {
            return Err("quota exceeded".into());
        }
        let mut created = self.created.lock().unwrap();
        let n = created.len() + 1;
        let id = format!("inst-{}", n);
        let polls = if *self.never_active.lock().unwrap() { u32::MAX } else { *self.boot_polls.lock().unwrap() };
        self.instances.lock().unwrap().insert(
            id.clone(),
            FakeInstance { ip: Ipv4Addr::new(203, 0, 113, n as u8), polls_until_active: polls, gone: false },
        );
        created.push(id.clone());
        Ok(id)
    }

    async fn inspect(&self, instance_id: &str) -> Result<Option<InstanceState>, String> {
        if *self.inspect_error.lock().unwrap() {
            return Err("provider API unavailable".into());
        }
        let mut instances = self.instances.lock().unwrap();
        let Some(inst) = instances.get_mut(instance_id) else {
            return Ok(None);
        };
        if inst.gone {
            return Ok(None);
        }
        if inst.polls_until_active > 0 {
            inst.polls_until_active -= 1;
            return Ok(Some(InstanceState { status: InstanceStatus::Pending, public_ip: None }));
        }
        Ok(Some(InstanceState { status: InstanceStatus::Active, public_ip: Some(inst.ip) }))
    }

    async fn destroy(&self, instance_id: &str) -> Result<(), String> {
        self.destroyed.lock().unwrap().push(instance_id.to_string());
        if let Some(inst) = self.instances.lock().unwrap().get_mut(instance_id) {
            inst.gone = true;
        }
        Ok(())
    }
}
