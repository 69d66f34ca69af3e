//! Per-client connection: outbound transport, mailbox, and the two loops
//! that drive a joined client.
//!
//! ```text
//!            inbound frames                      wake (mailbox)
//! socket ──► read_loop ──► session.apply_edit    ──► write_loop ──► socket
//!                │                                      │
//!                └──────── close signal (watch) ◄───────┘
//! ```
//!
//! The mailbox carries wake-ups only. When the write loop is woken it pushes
//! the session's current revision and snapshot; it never replays whatever
//! caused the wake. Either loop ending signals the other and removes the
//! client from its session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::{self, BoxFuture};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::error::HubError;
use crate::protocol::{Envelope, EnvelopeKind};
use crate::session::{DocumentSession, Joined};

/// Outbound half of a client connection.
pub trait Transport: Send + Sync + 'static {
    /// Deliver one text frame.
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), HubError>>;

    /// Close the underlying socket. Errors are ignored.
    fn close(&self) -> BoxFuture<'_, ()>;
}

/// Transport over the write half of a WebSocket.
pub struct WsTransport<S> {
    sink: Mutex<S>,
}

impl<S> WsTransport<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }
}

impl<S> Transport for WsTransport<S>
where
    S: Sink<Message, Error = WsError> + Unpin + Send + 'static,
{
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            sink.send(Message::text(text)).await?;
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            if let Err(e) = sink.close().await {
                log::debug!("Closing socket: {e}");
            }
        })
    }
}

/// In-process transport: every frame lands on an unbounded channel.
///
/// Used by tests and benchmarks in place of a socket. A stalled transport
/// never completes a send or a close, which is how a peer with a full
/// socket buffer looks from the hub.
#[derive(Debug)]
pub struct ChannelTransport {
    outbound: mpsc::UnboundedSender<String>,
    stalled: AtomicBool,
    closed: AtomicBool,
}

impl ChannelTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            outbound,
            stalled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Transport for ChannelTransport {
    fn send_text(&self, text: String) -> BoxFuture<'_, Result<(), HubError>> {
        Box::pin(async move {
            if self.closed.load(Ordering::SeqCst) {
                return Err(HubError::ClientGone("channel transport closed".into()));
            }
            if self.stalled.load(Ordering::SeqCst) {
                future::pending::<()>().await;
            }
            self.outbound
                .send(text)
                .map_err(|_| HubError::ClientGone("channel receiver dropped".into()))
        })
    }

    fn close(&self) -> BoxFuture<'_, ()> {
        self.closed.store(true, Ordering::SeqCst);
        Box::pin(async move {
            if self.stalled.load(Ordering::SeqCst) {
                future::pending::<()>().await;
            }
        })
    }
}

/// A client joined to one document session.
pub struct ClientConnection {
    id: String,
    name: String,
    transport: Arc<dyn Transport>,
    mailbox: mpsc::Sender<()>,
    closed: watch::Sender<bool>,
    /// Set when a missed broadcast queued a resync, cleared once one lands.
    resync_pending: AtomicBool,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ClientConnection {
    /// Build a connection and the receiving end of its mailbox.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        transport: Arc<dyn Transport>,
        mailbox_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<()>) {
        let (mailbox, wakes) = mpsc::channel(mailbox_capacity.max(1));
        let (closed, _) = watch::channel(false);
        let connection = Arc::new(Self {
            id: id.into(),
            name: name.into(),
            transport,
            mailbox,
            closed,
            resync_pending: AtomicBool::new(false),
        });
        (connection, wakes)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn send(&self, envelope: &Envelope) -> Result<(), HubError> {
        self.transport.send_text(envelope.encode()?).await
    }

    /// Send one encoded frame, giving up after `limit`.
    pub async fn send_within(&self, text: String, limit: Duration) -> Result<(), HubError> {
        match tokio::time::timeout(limit, self.transport.send_text(text)).await {
            Ok(result) => result,
            Err(_) => Err(HubError::SendTimeout(self.id.clone())),
        }
    }

    /// Ask the write loop to push current state.
    ///
    /// Fails with `MailboxFull` when the client already has a full backlog of
    /// wake-ups and `ClientGone` once the write loop has exited.
    pub fn nudge(&self) -> Result<(), HubError> {
        self.mailbox.try_send(()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => HubError::MailboxFull(self.id.clone()),
            mpsc::error::TrySendError::Closed(()) => HubError::ClientGone(self.id.clone()),
        })
    }

    /// Signal both loops to stop. Idempotent.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }
}

/// Result of delivering one envelope to a set of recipients.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FanoutReport {
    pub delivered: usize,
    /// Timed out; their write loop was asked to resync
    pub nudged: Vec<String>,
    /// Timed out with a full mailbox; the connection was closed
    pub overflowed: Vec<String>,
    /// Send failed or stalled twice; the connection was closed
    pub failed: Vec<String>,
}

impl FanoutReport {
    pub fn is_clean(&self) -> bool {
        self.nudged.is_empty() && self.overflowed.is_empty() && self.failed.is_empty()
    }
}

/// Send `envelope` to every recipient concurrently.
///
/// Each send gets its own deadline so one stalled peer delays nobody else.
/// A peer that misses the deadline is nudged to resync from current state.
/// A peer that misses it again before that resync lands, overflows its
/// mailbox, or fails a send is closed. Closed recipients are skipped.
pub async fn fan_out(
    recipients: &[Arc<ClientConnection>],
    envelope: &Envelope,
    send_timeout: Duration,
) -> Result<FanoutReport, HubError> {
    let text = envelope.encode()?;
    let sends = recipients.iter().filter(|conn| !conn.is_closed()).map(|conn| {
        let text = text.clone();
        async move { (conn, conn.send_within(text, send_timeout).await) }
    });

    let mut report = FanoutReport::default();
    for (conn, result) in future::join_all(sends).await {
        match result {
            Ok(()) => report.delivered += 1,
            Err(HubError::SendTimeout(_)) => {
                if conn.resync_pending.swap(true, Ordering::SeqCst) {
                    log::warn!("Client {} still stalled with a resync queued, closing", conn.id());
                    conn.close();
                    report.failed.push(conn.id().to_string());
                    continue;
                }
                match conn.nudge() {
                    Ok(()) => {
                        log::debug!("Send to {} timed out, resync queued", conn.id());
                        report.nudged.push(conn.id().to_string());
                    }
                    Err(e) => {
                        log::warn!("{e}");
                        conn.close();
                        report.overflowed.push(conn.id().to_string());
                    }
                }
            }
            Err(e) => {
                log::warn!("Send to {} failed: {e}", conn.id());
                conn.close();
                report.failed.push(conn.id().to_string());
            }
        }
    }
    Ok(report)
}

/// Handles of the loops serving one client.
pub struct ConnectionTasks {
    pub connection: Arc<ClientConnection>,
    pub read: JoinHandle<()>,
    pub write: JoinHandle<()>,
}

/// Spawn the read and write loops for a client that just joined `session`.
pub fn attach<St>(session: Arc<DocumentSession>, joined: Joined, inbound: St) -> ConnectionTasks
where
    St: Stream<Item = Result<Message, WsError>> + Unpin + Send + 'static,
{
    let Joined {
        connection,
        mailbox,
    } = joined;

    let read = tokio::spawn(read_loop(session.clone(), connection.clone(), inbound));
    let write = tokio::spawn(write_loop(session, connection.clone(), mailbox));

    ConnectionTasks {
        connection,
        read,
        write,
    }
}

enum Inbound {
    Frame(Message),
    Ended,
    Failed(WsError),
    Idle,
}

async fn next_inbound<St>(inbound: &mut St, idle: Option<Duration>) -> Inbound
where
    St: Stream<Item = Result<Message, WsError>> + Unpin,
{
    let next = match idle {
        Some(limit) => match tokio::time::timeout(limit, inbound.next()).await {
            Ok(next) => next,
            Err(_) => return Inbound::Idle,
        },
        None => inbound.next().await,
    };
    match next {
        Some(Ok(msg)) => Inbound::Frame(msg),
        Some(Err(e)) => Inbound::Failed(e),
        None => Inbound::Ended,
    }
}

async fn wait_closed(rx: &mut watch::Receiver<bool>) {
    loop {
        let closed = *rx.borrow_and_update();
        if closed || rx.changed().await.is_err() {
            return;
        }
    }
}

/// Read frames until the peer leaves, errs, idles out, or the connection is
/// closed from elsewhere. Text frames are decoded as envelopes; only `data`
/// envelopes reach the session.
pub async fn read_loop<St>(
    session: Arc<DocumentSession>,
    conn: Arc<ClientConnection>,
    mut inbound: St,
) where
    St: Stream<Item = Result<Message, WsError>> + Unpin + Send,
{
    let idle = session.hub_config().idle_timeout;
    let mut closed = conn.closed_signal();

    loop {
        let event = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            event = next_inbound(&mut inbound, idle) => event,
        };

        match event {
            Inbound::Frame(Message::Text(text)) => {
                handle_text(&session, &conn, text.as_str()).await;
            }
            Inbound::Frame(Message::Close(_)) | Inbound::Ended => {
                log::debug!("Client {} closed the connection", conn.id());
                break;
            }
            Inbound::Frame(Message::Binary(bytes)) => {
                log::debug!("Ignoring {} byte binary frame from {}", bytes.len(), conn.id());
            }
            // tungstenite answers pings on the next read.
            Inbound::Frame(_) => {}
            Inbound::Failed(e) => {
                log::warn!("Read from {} failed: {e}", conn.id());
                break;
            }
            Inbound::Idle => {
                log::info!("Client {} idle, closing", conn.id());
                break;
            }
        }
    }

    teardown(&session, &conn).await;
}

async fn handle_text(session: &DocumentSession, conn: &ClientConnection, text: &str) {
    let envelope = match Envelope::decode(text) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("Malformed envelope from {}: {e}", conn.id());
            return;
        }
    };

    match envelope.kind {
        EnvelopeKind::Data => match session.apply_edit(conn.id(), envelope.data).await {
            Ok(outcome) => log::trace!(
                "Edit from {} on {} -> revision {}",
                conn.id(),
                session.id(),
                outcome.revision
            ),
            Err(e) => log::warn!("Edit from {} rejected: {e}", conn.id()),
        },
        other => log::debug!("Ignoring {other:?} envelope from {}", conn.id()),
    }
}

/// Push current state whenever the mailbox wakes. Wake-ups that pile up
/// while a push is in flight collapse into one.
pub async fn write_loop(
    session: Arc<DocumentSession>,
    conn: Arc<ClientConnection>,
    mut mailbox: mpsc::Receiver<()>,
) {
    let send_timeout = session.hub_config().send_timeout;
    let mut closed = conn.closed_signal();

    loop {
        let woken = tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => break,
            wake = mailbox.recv() => wake.is_some(),
        };
        if !woken {
            break;
        }
        while mailbox.try_recv().is_ok() {}

        let envelope = match session.resync_envelope().await {
            Ok(envelope) => envelope,
            Err(e) => {
                log::error!("Cannot build resync for {}: {e}", conn.id());
                continue;
            }
        };
        let text = match envelope.encode() {
            Ok(text) => text,
            Err(e) => {
                log::error!("Cannot encode resync for {}: {e}", conn.id());
                continue;
            }
        };
        if let Err(e) = conn.send_within(text, send_timeout).await {
            log::warn!("Resync to {} failed: {e}", conn.id());
            break;
        }
        conn.resync_pending.store(false, Ordering::SeqCst);
    }

    teardown(&session, &conn).await;
    if tokio::time::timeout(send_timeout, conn.transport.close()).await.is_err() {
        log::debug!("Socket of {} did not close within {send_timeout:?}", conn.id());
    }
}

async fn teardown(session: &DocumentSession, conn: &ClientConnection) {
    conn.close();
    match session.disconnect(conn.id()).await {
        Ok(departure) if departure.removed => log::info!(
            "Client {} left {} ({} remaining{})",
            conn.id(),
            session.id(),
            departure.remaining,
            if departure.flushed { ", flushed" } else { "" }
        ),
        Ok(_) => {}
        Err(e) => log::error!("Teardown of {} on {}: {e}", conn.id(), session.id()),
    }
}
