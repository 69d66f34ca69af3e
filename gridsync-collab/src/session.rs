//! Live state of one open document.
//!
//! ```text
//! read loops ──► apply_edit ──┐            ┌──► client A
//!                             ▼            │
//!                    ┌────────────────┐    ├──► client B
//!  join / disconnect │ SessionState   │    │
//!  ────────────────► │ (tokio Mutex)  │ ─► outbox ─► broadcaster ──► client C
//!                    └────────────────┘
//!                             │ last client leaves
//!                             ▼
//!                   PersistenceGateway::save_config
//! ```
//!
//! Every mutation happens under the state lock and queues its broadcast on
//! the outbox before the lock is released. One broadcaster task per session
//! drains the outbox in order, so every client sees envelopes in revision
//! order while edits never wait on a socket.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use gridsync_core::{ActionKind, ActionMessage, SheetActionData, WorkbookConfig};
use tokio::sync::{mpsc, Mutex};

use crate::config::HubConfig;
use crate::connection::{fan_out, ClientConnection, Transport};
use crate::error::HubError;
use crate::identity::generate_client_id;
use crate::protocol::{Envelope, RosterEntry};
use crate::storage::PersistenceGateway;

/// A client that has just been registered with a session.
pub struct Joined {
    pub connection: Arc<ClientConnection>,
    /// Wake-ups for the client's write loop
    pub mailbox: mpsc::Receiver<()>,
}

/// What an edit did to the authoritative state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditEffect {
    /// Cells merged into the workbook
    CellsWritten { sheet_id: String, cells: usize },
    /// Sender's selection recorded for the roster
    SelectionUpdated,
    /// Action the server does not interpret; relayed only
    Relayed(String),
    /// Payload was not an action; relayed only
    Malformed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditOutcome {
    pub revision: i64,
    pub effect: EditEffect,
    /// Ids the edit was broadcast to, sender included
    pub recipients: Vec<String>,
}

/// Result of removing a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Departure {
    /// False when the client had already been removed
    pub removed: bool,
    pub remaining: usize,
    /// This call wrote the config back to storage
    pub flushed: bool,
}

struct ClientSlot {
    connection: Arc<ClientConnection>,
    selection: Option<SheetActionData>,
}

struct SessionState {
    revision: i64,
    /// Most recent raw payload, replayed to joiners and on resync
    relay_snapshot: Option<String>,
    config: WorkbookConfig,
    clients: HashMap<String, ClientSlot>,
    /// Set once the current empty period has been written back; cleared by
    /// the next join.
    flushed: bool,
    /// Bumped for every snapshot taken for a write-back
    snapshots: u64,
}

impl SessionState {
    fn snapshot(&mut self) -> Result<(u64, String), HubError> {
        let json = self.config.to_json()?;
        self.snapshots += 1;
        Ok((self.snapshots, json))
    }

    fn document_data(&self) -> Result<String, HubError> {
        match &self.relay_snapshot {
            Some(snapshot) => Ok(snapshot.clone()),
            None => Ok(self.config.to_json()?),
        }
    }

    fn recipients(&self) -> Vec<Arc<ClientConnection>> {
        self.clients
            .values()
            .map(|slot| slot.connection.clone())
            .collect()
    }

    fn roster(&self) -> Vec<RosterEntry> {
        let mut roster: Vec<RosterEntry> = self
            .clients
            .values()
            .map(|slot| RosterEntry {
                client_id: slot.connection.id().to_string(),
                client_name: slot.connection.name().to_string(),
                selection: slot.selection.clone(),
            })
            .collect();
        roster.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        roster
    }

    fn apply_action(&mut self, doc_id: &str, sender_id: &str, payload: &str) -> EditEffect {
        let action = match ActionMessage::parse(payload) {
            Ok(action) => action,
            Err(e) => {
                log::warn!("Relaying unparsable edit from {sender_id} on {doc_id}: {e}");
                return EditEffect::Malformed;
            }
        };

        match action.kind() {
            ActionKind::SetRangeData => {
                let data = action.action_data;
                if data.sheet_id.is_empty() {
                    log::warn!("Cell write from {sender_id} on {doc_id} has no sheet id");
                    return EditEffect::Malformed;
                }
                let cells = self.config.merge_cells(&data.sheet_id, &data.cell_value);
                EditEffect::CellsWritten {
                    sheet_id: data.sheet_id,
                    cells,
                }
            }
            ActionKind::SetSelectionValue => {
                if let Some(slot) = self.clients.get_mut(sender_id) {
                    slot.selection = Some(action.action_data);
                }
                EditEffect::SelectionUpdated
            }
            ActionKind::Other(name) => {
                log::debug!("Relaying {name} from {sender_id} on {doc_id}");
                EditEffect::Relayed(name)
            }
        }
    }
}

struct Outgoing {
    envelope: Envelope,
    recipients: Vec<Arc<ClientConnection>>,
}

/// One open document and its connected clients.
pub struct DocumentSession {
    id: String,
    state: Mutex<SessionState>,
    outbox: mpsc::UnboundedSender<Outgoing>,
    /// Held across a whole write-back so flushes never overlap. Holds the
    /// generation of the last snapshot written.
    flush_lock: Mutex<u64>,
    gateway: Arc<dyn PersistenceGateway>,
    config: HubConfig,
}

impl DocumentSession {
    /// Open a session over an already loaded config.
    ///
    /// Spawns the session's broadcaster, so this must run inside a tokio
    /// runtime.
    pub fn new(
        id: impl Into<String>,
        workbook: WorkbookConfig,
        gateway: Arc<dyn PersistenceGateway>,
        config: HubConfig,
    ) -> Self {
        let id = id.into();
        let (outbox, queue) = mpsc::unbounded_channel();
        tokio::spawn(run_broadcaster(id.clone(), queue, config.send_timeout));

        Self {
            id,
            state: Mutex::new(SessionState {
                revision: 0,
                relay_snapshot: None,
                config: workbook,
                clients: HashMap::new(),
                flushed: true,
                snapshots: 0,
            }),
            outbox,
            flush_lock: Mutex::new(0),
            gateway,
            config,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hub_config(&self) -> &HubConfig {
        &self.config
    }

    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    pub async fn client_count(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    pub async fn client_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.state.lock().await.clients.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn roster(&self) -> Vec<RosterEntry> {
        self.state.lock().await.roster()
    }

    /// Copy of the authoritative workbook.
    pub async fn config_snapshot(&self) -> WorkbookConfig {
        self.state.lock().await.config.clone()
    }

    /// Authoritative workbook as JSON.
    pub async fn config_json(&self) -> Result<String, HubError> {
        Ok(self.state.lock().await.config.to_json()?)
    }

    pub async fn relay_snapshot(&self) -> Option<String> {
        self.state.lock().await.relay_snapshot.clone()
    }

    pub async fn selection_of(&self, client_id: &str) -> Option<SheetActionData> {
        self.state
            .lock()
            .await
            .clients
            .get(client_id)
            .and_then(|slot| slot.selection.clone())
    }

    fn enqueue(&self, envelope: Envelope, recipients: Vec<Arc<ClientConnection>>) {
        if recipients.is_empty() {
            return;
        }
        if self
            .outbox
            .send(Outgoing {
                envelope,
                recipients,
            })
            .is_err()
        {
            log::warn!("Broadcaster of {} is gone; dropping envelope", self.id);
        }
    }

    /// Register a client under a fresh id.
    ///
    /// The joiner is sent the document (current revision, relay snapshot or
    /// stored config) followed by the roster; peers already present get the
    /// updated roster. All three are queued before the lock is released, so
    /// no edit can reach the joiner ahead of its document.
    pub async fn join(
        &self,
        transport: Arc<dyn Transport>,
        name: impl Into<String>,
    ) -> Result<Joined, HubError> {
        let mut state = self.state.lock().await;

        let client_id = loop {
            let candidate = generate_client_id();
            if !state.clients.contains_key(&candidate) {
                break candidate;
            }
        };
        let document = Envelope::document(state.revision, state.document_data()?, &client_id);

        let (connection, mailbox) =
            ClientConnection::new(client_id, name, transport, self.config.mailbox_capacity);
        let peers = state.recipients();
        state.clients.insert(
            connection.id().to_string(),
            ClientSlot {
                connection: connection.clone(),
                selection: None,
            },
        );
        state.flushed = false;

        let roster = Envelope::clients(state.roster());
        self.enqueue(document, vec![connection.clone()]);
        self.enqueue(roster.clone(), vec![connection.clone()]);
        self.enqueue(roster, peers);

        log::info!(
            "Client {} ({}) joined {} ({} connected)",
            connection.id(),
            connection.name(),
            self.id,
            state.clients.len()
        );
        Ok(Joined {
            connection,
            mailbox,
        })
    }

    /// Apply one edit from `sender_id` and relay it to every client.
    ///
    /// The payload always becomes the relay snapshot and every edit advances
    /// the revision, whether or not it parses. Cell writes are merged into
    /// the workbook; selections are recorded for the sender only.
    pub async fn apply_edit(&self, sender_id: &str, payload: String) -> Result<EditOutcome, HubError> {
        let mut state = self.state.lock().await;

        let sender_name = match state.clients.get(sender_id) {
            Some(slot) => slot.connection.name().to_string(),
            None => return Err(HubError::ClientGone(sender_id.to_string())),
        };

        state.relay_snapshot = Some(payload.clone());
        let effect = state.apply_action(&self.id, sender_id, &payload);
        state.revision += 1;

        let recipients = state.recipients();
        let outcome = EditOutcome {
            revision: state.revision,
            effect,
            recipients: recipients.iter().map(|c| c.id().to_string()).collect(),
        };
        self.enqueue(
            Envelope::data(state.revision, payload, sender_id, sender_name),
            recipients,
        );
        Ok(outcome)
    }

    /// Current state as a `data` envelope with no sender, for clients that
    /// fell behind.
    pub async fn resync_envelope(&self) -> Result<Envelope, HubError> {
        let state = self.state.lock().await;
        Ok(Envelope::data(state.revision, state.document_data()?, "", ""))
    }

    /// Remove a client, tell the others, and write the workbook back if it
    /// was the last one.
    ///
    /// Both loops of a connection call this on exit; only the first call
    /// does anything. Of several clients leaving at once, exactly one
    /// observes the empty session and flushes.
    pub async fn disconnect(&self, client_id: &str) -> Result<Departure, HubError> {
        let (pending, remaining) = {
            let mut state = self.state.lock().await;
            let Some(slot) = state.clients.remove(client_id) else {
                return Ok(Departure::default());
            };
            slot.connection.close();

            let remaining = state.clients.len();
            let peers = state.recipients();
            self.enqueue(
                Envelope::offline(slot.connection.id(), slot.connection.name()),
                peers,
            );

            let pending = if remaining == 0 && !state.flushed {
                let snapshot = state.snapshot()?;
                state.flushed = true;
                Some(snapshot)
            } else {
                None
            };
            (pending, remaining)
        };

        let mut departure = Departure {
            removed: true,
            remaining,
            flushed: false,
        };
        if let Some((generation, json)) = pending {
            departure.flushed = self.persist(generation, json).await?;
        }
        Ok(departure)
    }

    /// Write the current workbook to storage.
    pub async fn flush(&self) -> Result<(), HubError> {
        let (generation, json) = self.state.lock().await.snapshot()?;
        self.persist(generation, json).await?;
        Ok(())
    }

    /// Write one snapshot unless a newer one already landed. The state lock
    /// must not be held here; joins and edits proceed during a write-back.
    async fn persist(&self, generation: u64, json: String) -> Result<bool, HubError> {
        let mut written = self.flush_lock.lock().await;
        if *written >= generation {
            log::debug!(
                "Skipping snapshot {generation} of {}, {} already written",
                self.id,
                *written
            );
            return Ok(false);
        }
        self.write_back(json).await?;
        *written = generation;
        Ok(true)
    }

    async fn write_back(&self, json: String) -> Result<(), HubError> {
        let attempts = self.config.flush_retries.max(1);
        let mut backoff = self.config.flush_backoff;
        let mut attempt = 1;

        loop {
            let gateway = self.gateway.clone();
            let doc_id = self.id.clone();
            let body = json.clone();
            let result =
                tokio::task::spawn_blocking(move || gateway.save_config(&doc_id, &body)).await?;

            match result {
                Ok(()) => {
                    log::info!("Flushed {} ({} bytes)", self.id, json.len());
                    return Ok(());
                }
                Err(source) if attempt >= attempts => {
                    return Err(HubError::Flush {
                        doc_id: self.id.clone(),
                        attempts,
                        source,
                    });
                }
                Err(e) => {
                    log::warn!(
                        "Flush of {} failed (attempt {attempt}/{attempts}): {e}",
                        self.id
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

async fn run_broadcaster(
    doc_id: String,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    send_timeout: Duration,
) {
    while let Some(outgoing) = queue.recv().await {
        match fan_out(&outgoing.recipients, &outgoing.envelope, send_timeout).await {
            Ok(report) if !report.is_clean() => log::debug!(
                "Broadcast on {doc_id}: {} delivered, {} nudged, {} overflowed, {} failed",
                report.delivered,
                report.nudged.len(),
                report.overflowed.len(),
                report.failed.len()
            ),
            Ok(_) => {}
            Err(e) => log::error!("Broadcast on {doc_id} failed: {e}"),
        }
    }
    log::debug!("Broadcaster of {doc_id} stopped");
}
