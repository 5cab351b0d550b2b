//! Signal model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::SignalError;

/// The three signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    /// Parameter adjustment delivered to a running task
    Steer,
    /// Cancellation request, graceful or immediate
    Interrupt,
    /// Result collection message
    Collect,
}

impl std::str::FromStr for SignalKind {
    type Err = SignalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "steer" => Ok(SignalKind::Steer),
            "interrupt" => Ok(SignalKind::Interrupt),
            "collect" => Ok(SignalKind::Collect),
            other => Err(SignalError::InvalidSignalType(other.to_string())),
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Steer => write!(f, "steer"),
            SignalKind::Interrupt => write!(f, "interrupt"),
            SignalKind::Collect => write!(f, "collect"),
        }
    }
}

/// Ephemeral tagged message addressed to a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    /// Signal kind
    #[serde(rename = "type")]
    pub kind: SignalKind,
    /// Target task identifier
    pub task_id: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Origin timestamp
    pub sent_at: DateTime<Utc>,
}

impl Signal {
    /// Create a signal stamped with the current time
    pub fn new(kind: SignalKind, task_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            kind,
            task_id: task_id.into(),
            payload,
            sent_at: Utc::now(),
        }
    }

    /// Stable content hash used by the router's duplicate window
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(b"\x1f");
        hasher.update(self.task_id.as_bytes());
        hasher.update(b"\x1f");
        hasher.update(&self.payload);
        hasher.update(b"\x1f");
        hasher.update(self.sent_at.timestamp_micros().to_be_bytes());
        hex::encode(hasher.finalize())
    }
}
