// src/sys/ssh.rs

use async_trait::async_trait;
use regex::Regex;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::process::Command;
use tracing::debug;

use crate::sys::traits::{CommandOutput, HostAuth, RemoteExecutor, RemoteHost};

/// ssh(1) reserves exit status 255 for its own failures (connect, auth).
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// SshExecutor drives the system OpenSSH client. Password logins go through
/// `sshpass -e` so the secret travels in the child environment, never argv.
pub struct SshExecutor {
    command_timeout: Duration,
    known_hosts: PathBuf,
}

impl SshExecutor {
    pub fn new(command_timeout: Duration, known_hosts: PathBuf) -> Self {
        Self {
            command_timeout,
            known_hosts,
        }
    }

    /// Drops ssh's own chatter so the interesting line survives into errors.
    fn scrub_stderr(input: &str) -> String {
        static NOISE: OnceLock<Regex> = OnceLock::new();
        let re = NOISE.get_or_init(|| {
            Regex::new(r"(?m)^(Warning: Permanently added .*|\*\*.*)\r?\n?").unwrap()
        });
        re.replace_all(input, "").trim().to_string()
    }

    fn base_options(&self) -> Vec<String> {
        let connect_secs = self.command_timeout.as_secs().max(1);
        vec![
            "-o".into(), "StrictHostKeyChecking=accept-new".into(),
            "-o".into(), format!("UserKnownHostsFile={}", self.known_hosts.display()),
            "-o".into(), format!("ConnectTimeout={}", connect_secs),
            "-o".into(), "LogLevel=ERROR".into(),
        ]
    }
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
    async fn run(&self, host: &RemoteHost, command: &str) -> Result<CommandOutput, String> {
        // 🛡️ Argument injection guard on the login name.
        if host.username.is_empty() || host.username.starts_with('-') {
            return Err(format!("invalid ssh username '{}'", host.username));
        }

        // Keeps an inline identity alive until the command finishes.
        let mut _key_file: Option<NamedTempFile> = None;

        let mut cmd = match &host.auth {
            HostAuth::Password(cred) => {
                let mut c = Command::new("sshpass");
                cred.use_secret(|s| {
                    c.env("SSHPASS", s);
                });
                c.arg("-e").arg("ssh");
                c.args(["-o", "PubkeyAuthentication=no"]);
                c
            }
            HostAuth::KeyFile(path) => {
                let mut c = Command::new("ssh");
                c.args(["-o", "BatchMode=yes", "-o", "IdentitiesOnly=yes", "-i"]);
                c.arg(path);
                c
            }
            HostAuth::KeyMaterial(cred) => {
                let mut temp = NamedTempFile::new().map_err(|e| e.to_string())?;
                cred.use_secret(|s| temp.write_all(s.as_bytes()))
                    .map_err(|e| e.to_string())?;
                let mut c = Command::new("ssh");
                c.args(["-o", "BatchMode=yes", "-o", "IdentitiesOnly=yes", "-i"]);
                c.arg(temp.path());
                _key_file = Some(temp);
                c
            }
        };

        cmd.args(self.base_options())
            .arg(format!("{}@{}", host.username, host.address))
            .arg("--")
            .arg(command)
            .kill_on_drop(true);

        debug!(host = %host.address, "ssh exec");

        let output = tokio::time::timeout(self.command_timeout, cmd.output())
            .await
            .map_err(|_| format!("timed out after {}s", self.command_timeout.as_secs()))?
            .map_err(|e| format!("ssh spawn error: {}", e))?;

        let exit_code = output.status.code().unwrap_or(-1);
        let stderr = Self::scrub_stderr(&String::from_utf8_lossy(&output.stderr));

        if exit_code == SSH_TRANSPORT_FAILURE {
            return Err(format!("ssh connection failed: {}", stderr));
        }

        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr,
        })
    }
}
