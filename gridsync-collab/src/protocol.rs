//! JSON envelopes exchanged between the hub and editing clients.
//!
//! Every WebSocket text frame carries one envelope:
//! ```text
//! { "type": "document" | "clients" | "data" | "offline",
//!   "revision": 3,
//!   "data": "<opaque payload>",
//!   "clientId": "user-…", "clientName": "Emma",
//!   "clients": [ { "clientId", "clientName", "selection" } ] }
//! ```
//!
//! `data` is never interpreted here; the session parses it when a `data`
//! envelope arrives from a client.

use gridsync_core::SheetActionData;
use serde::{Deserialize, Serialize};

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeKind {
    /// Initial document state sent to a joining client
    Document,
    /// Roster of connected clients
    Clients,
    /// An edit relayed to every client
    Data,
    /// A client left the document
    Offline,
    /// Anything newer clients send that this server does not know
    #[serde(other)]
    Unknown,
}

/// One row of the roster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RosterEntry {
    pub client_id: String,
    pub client_name: String,
    #[serde(default)]
    pub selection: Option<SheetActionData>,
}

/// Wire unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    #[serde(default)]
    pub revision: i64,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clients: Option<Vec<RosterEntry>>,
}

impl Envelope {
    fn empty(kind: EnvelopeKind) -> Self {
        Self {
            kind,
            revision: 0,
            data: String::new(),
            client_id: String::new(),
            client_name: String::new(),
            clients: None,
        }
    }

    /// Initial state for a joining client, addressed to its new id.
    pub fn document(revision: i64, data: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            revision,
            data: data.into(),
            client_id: client_id.into(),
            ..Self::empty(EnvelopeKind::Document)
        }
    }

    pub fn clients(roster: Vec<RosterEntry>) -> Self {
        Self {
            clients: Some(roster),
            ..Self::empty(EnvelopeKind::Clients)
        }
    }

    /// A relayed edit. Resync pushes leave the sender fields empty.
    pub fn data(
        revision: i64,
        data: impl Into<String>,
        client_id: impl Into<String>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            revision,
            data: data.into(),
            client_id: client_id.into(),
            client_name: client_name.into(),
            ..Self::empty(EnvelopeKind::Data)
        }
    }

    pub fn offline(client_id: impl Into<String>, client_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_name: client_name.into(),
            ..Self::empty(EnvelopeKind::Offline)
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}
