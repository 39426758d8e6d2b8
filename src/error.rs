// src/error.rs

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::fmt;
use thiserror::Error;

/// The remote round trip a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteStep {
    GenerateKeys,
    ReadPrivateKey,
    ReadPublicKey,
    ReadServerKey,
    AppendConfig,
    ApplyLive,
    RemoveLive,
    EditConfig,
    RemoveKeyFiles,
    ReadinessProbe,
    Probe,
}

impl fmt::Display for RemoteStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteStep::GenerateKeys => "generate peer keys",
            RemoteStep::ReadPrivateKey => "read peer private key",
            RemoteStep::ReadPublicKey => "read peer public key",
            RemoteStep::ReadServerKey => "read server public key",
            RemoteStep::AppendConfig => "append peer stanza",
            RemoteStep::ApplyLive => "apply peer to live interface",
            RemoteStep::RemoveLive => "remove peer from live interface",
            RemoteStep::EditConfig => "remove peer stanza",
            RemoteStep::RemoveKeyFiles => "remove peer key files",
            RemoteStep::ReadinessProbe => "poll bootstrap marker",
            RemoteStep::Probe => "probe server",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningFailure {
    /// The provider refused or failed the API call.
    Rejected,
    /// The instance never reported active with a public IP.
    BootTimeout,
    /// The bootstrap payload never signalled completion.
    SetupTimeout,
}

impl fmt::Display for ProvisioningFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvisioningFailure::Rejected => f.write_str("rejected"),
            ProvisioningFailure::BootTimeout => f.write_str("provisioning timed out"),
            ProvisioningFailure::SetupTimeout => f.write_str("setup timed out"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("provisioning {kind}: {message}")]
    Provisioning {
        kind: ProvisioningFailure,
        message: String,
    },

    #[error("remote execution failed on {host} ({step}): {message}")]
    RemoteExecution {
        step: RemoteStep,
        host: String,
        message: String,
    },

    #[error("no free overlay address on server {server_id}")]
    AddressPoolExhausted { server_id: String },

    #[error("user {0} is not connected")]
    NotConnected(String),

    #[error("server {0} not found")]
    NotFound(String),

    #[error("state drift for {username}: {detail}")]
    StateDrift { username: String, detail: String },

    #[error("invalid username '{0}'")]
    InvalidUsername(String),

    #[error("a join for {0} is already in progress")]
    JoinInProgress(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl PoolError {
    pub fn rejected(message: impl Into<String>) -> Self {
        PoolError::Provisioning {
            kind: ProvisioningFailure::Rejected,
            message: message.into(),
        }
    }

    pub fn remote(step: RemoteStep, host: &str, message: impl Into<String>) -> Self {
        PoolError::RemoteExecution {
            step,
            host: host.to_string(),
            message: message.into(),
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            PoolError::NotConnected(_) | PoolError::NotFound(_) => StatusCode::NOT_FOUND,
            PoolError::JoinInProgress(_) => StatusCode::CONFLICT,
            PoolError::InvalidUsername(_) => StatusCode::BAD_REQUEST,
            PoolError::Provisioning {
                kind: ProvisioningFailure::BootTimeout | ProvisioningFailure::SetupTimeout,
                ..
            } => StatusCode::GATEWAY_TIMEOUT,
            PoolError::Provisioning { .. } | PoolError::RemoteExecution { .. } => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for PoolError {
    fn from(e: std::io::Error) -> Self {
        PoolError::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for PoolError {
    fn from(e: serde_json::Error) -> Self {
        PoolError::Persistence(e.to_string())
    }
}

impl IntoResponse for PoolError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}
