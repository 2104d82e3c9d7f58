//! Message router
//!
//! Carries typed envelopes between the coordinator and worker endpoints,
//! point-to-point and broadcast. Inbound envelopes are validated against
//! the minimum required fields; malformed ones are logged and dropped —
//! the router never crashes and never turns a protocol error into a task
//! failure.
//!
//! Ordering: each recipient has one FIFO queue, so messages from a single
//! sender to a single recipient arrive in send order. No cross-sender
//! ordering is promised.

use chrono::{DateTime, Utc};
use drover_core::{DroverError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tracing::{debug, warn};

/// Reserved message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    TaskAssignment,
    TaskProgress,
    TaskOutcome,
    WorkerStatus,
    CancelRequest,
    CancelAck,
}

impl std::fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TaskAssignment => write!(f, "task_assignment"),
            Self::TaskProgress => write!(f, "task_progress"),
            Self::TaskOutcome => write!(f, "task_outcome"),
            Self::WorkerStatus => write!(f, "worker_status"),
            Self::CancelRequest => write!(f, "cancel_request"),
            Self::CancelAck => write!(f, "cancel_ack"),
        }
    }
}

impl std::str::FromStr for EnvelopeKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "task_assignment" => Ok(Self::TaskAssignment),
            "task_progress" => Ok(Self::TaskProgress),
            "task_outcome" => Ok(Self::TaskOutcome),
            "worker_status" => Ok(Self::WorkerStatus),
            "cancel_request" => Ok(Self::CancelRequest),
            "cancel_ack" => Ok(Self::CancelAck),
            _ => Err(format!("Invalid envelope kind: {}", s)),
        }
    }
}

/// Delivery target: a single endpoint or everyone registered
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Recipient {
    #[default]
    Broadcast,
    Peer(String),
}

impl Serialize for Recipient {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Broadcast => serializer.serialize_str("broadcast"),
            Self::Peer(id) => serializer.serialize_str(id),
        }
    }
}

impl<'de> Deserialize<'de> for Recipient {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(if s == "broadcast" {
            Self::Broadcast
        } else {
            Self::Peer(s)
        })
    }
}

/// Wire envelope
///
/// Minimum required fields: `type`, `from`, `timestamp`. A missing `to`
/// defaults to broadcast. Timestamps travel as epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: String,
    #[serde(default)]
    pub to: Recipient,
    #[serde(default)]
    pub payload: Value,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    pub fn new(kind: EnvelopeKind, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: Recipient::Peer(to.into()),
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn broadcast(kind: EnvelopeKind, from: impl Into<String>) -> Self {
        Self {
            kind,
            from: from.into(),
            to: Recipient::Broadcast,
            payload: Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validate a raw inbound value against the required-field schema
    ///
    /// Reports the first missing or malformed field so the sender can be
    /// debugged from the log line alone.
    pub fn validate(value: &Value) -> Result<Envelope> {
        let obj = value
            .as_object()
            .ok_or_else(|| DroverError::Protocol("envelope is not an object".to_string()))?;

        for field in ["type", "from", "timestamp"] {
            if !obj.contains_key(field) {
                return Err(DroverError::Protocol(format!(
                    "missing required field '{}'",
                    field
                )));
            }
        }
        if !obj["from"].is_string() || obj["from"].as_str() == Some("") {
            return Err(DroverError::Protocol(
                "field 'from' must be a non-empty string".to_string(),
            ));
        }
        if !obj["timestamp"].is_number() {
            return Err(DroverError::Protocol(
                "field 'timestamp' must be epoch milliseconds".to_string(),
            ));
        }

        serde_json::from_value(value.clone())
            .map_err(|e| DroverError::Protocol(format!("envelope rejected: {}", e)))
    }
}

type Handler = Box<dyn Fn(&Envelope) + Send + Sync>;

/// Routes envelopes between the coordinator and registered endpoints
#[derive(Default)]
pub struct MessageRouter {
    /// Per-recipient FIFO queues (the ordering guarantee lives here)
    pending: HashMap<String, VecDeque<Envelope>>,
    /// Registered endpoints; broadcast fans out to all of them
    recipients: BTreeSet<String>,
    history: Vec<Envelope>,
    handlers: Vec<Handler>,
    dropped: u64,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint so it can receive point-to-point and
    /// broadcast envelopes
    pub fn register(&mut self, recipient: impl Into<String>) {
        let recipient = recipient.into();
        debug!("Registering endpoint {}", recipient);
        self.recipients.insert(recipient.clone());
        self.pending.entry(recipient).or_default();
    }

    pub fn deregister(&mut self, recipient: &str) {
        self.recipients.remove(recipient);
        self.pending.remove(recipient);
    }

    /// Queue an envelope for a single recipient
    pub fn send(&mut self, target: &str, mut envelope: Envelope) -> Result<()> {
        let queue = self
            .pending
            .get_mut(target)
            .ok_or_else(|| DroverError::Protocol(format!("unknown recipient: {}", target)))?;
        envelope.to = Recipient::Peer(target.to_string());
        debug!(
            "Routing {} from {} to {}",
            envelope.kind, envelope.from, target
        );
        queue.push_back(envelope.clone());
        self.history.push(envelope);
        Ok(())
    }

    /// Queue an envelope for every registered recipient except the sender
    pub fn broadcast(&mut self, mut envelope: Envelope) {
        envelope.to = Recipient::Broadcast;
        debug!("Broadcasting {} from {}", envelope.kind, envelope.from);
        for recipient in &self.recipients {
            if *recipient == envelope.from {
                continue;
            }
            if let Some(queue) = self.pending.get_mut(recipient) {
                queue.push_back(envelope.clone());
            }
        }
        self.history.push(envelope);
    }

    /// Take all queued envelopes for a recipient, in delivery order
    pub fn drain(&mut self, recipient: &str) -> Vec<Envelope> {
        self.pending
            .get_mut(recipient)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn has_pending(&self, recipient: &str) -> bool {
        self.pending
            .get(recipient)
            .map(|q| !q.is_empty())
            .unwrap_or(false)
    }

    /// Register an inbound-message handler
    pub fn on_message(&mut self, handler: impl Fn(&Envelope) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Accept a raw inbound value
    ///
    /// Valid envelopes are recorded and handed to every handler; invalid
    /// ones are logged, counted, and dropped.
    pub fn receive(&mut self, value: Value) -> Result<Envelope> {
        match Envelope::validate(&value) {
            Ok(envelope) => {
                for handler in &self.handlers {
                    handler(&envelope);
                }
                self.history.push(envelope.clone());
                Ok(envelope)
            }
            Err(e) => {
                self.dropped += 1;
                warn!("Dropping malformed envelope: {}", e);
                Err(e)
            }
        }
    }

    pub fn history(&self) -> &[Envelope] {
        &self.history
    }

    pub fn history_of_kind(&self, kind: EnvelopeKind) -> Vec<&Envelope> {
        self.history.iter().filter(|e| e.kind == kind).collect()
    }

    /// Count of malformed envelopes dropped so far
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
