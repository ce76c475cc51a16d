//! Session orchestrator: wires transport, parser, replication engine and
//! router together and exposes the public connect/listen surface.
//!
//! One fan-out task owns the table store and the router; everything the
//! rest of the world does (listen, detach, close) arrives at that task as
//! a message, so state mutation stays single-threaded by construction.

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::config::{Network, SessionConfig};
use crate::deadman;
use crate::error::{SessionError, StreamError};
use crate::message::Command;
use crate::parser::{self, ProtocolEvent};
use crate::router::{Delivery, ListenerId, Router, RouterCommand};
use crate::storage::Storage;
use crate::transport::{self, InboundReceiver, OutboundSender, TransportEvent};

/// Connect to the BitMEX realtime feed.
///
/// Fails fast on an unrecognized network, surfaces handshake rejection
/// synchronously, and returns only after the server's greeting has been
/// seen, so the returned client is ready to listen.
pub async fn connect(network: &str, config: SessionConfig) -> Result<BitmexClient, SessionError> {
    let network: Network = network.parse()?;

    let headers = match (&config.api_key, &config.api_secret) {
        (Some(key), Some(secret)) => {
            tracing::debug!("Generating authentication headers");
            auth::auth_headers(key, secret)
        }
        _ => Vec::new(),
    };

    tracing::debug!(url = network.url(), "Opening websocket connection");
    let (outbound, inbound) = transport::connect(network.url(), &headers)
        .await
        .map_err(|e| match e {
            transport::TransportError::Rejected(message) => SessionError::Rejected(message),
            other => SessionError::Rejected(other.to_string()),
        })?;

    let client = BitmexClient::open(outbound, inbound, &config);
    client.ready().await?;
    Ok(client)
}

/// Two-phase handshake state published by the fan-out task.
#[derive(Debug, Clone)]
enum ReadyState {
    Pending,
    Ready,
    Failed(StreamError),
}

/// Handle to a live session. Dropping it (or calling [`close`]) cancels
/// every owned task and closes the transport.
///
/// [`close`]: BitmexClient::close
pub struct BitmexClient {
    command_tx: mpsc::UnboundedSender<RouterCommand>,
    cancel: CancellationToken,
    ready: watch::Receiver<ReadyState>,
}

impl BitmexClient {
    /// Wire a session over an already-open duplex message channel and spawn
    /// its tasks. `connect` does this over a real websocket; tests hand in
    /// a channel pair.
    pub fn open(outbound: OutboundSender, inbound: InboundReceiver, config: &SessionConfig) -> Self {
        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(ReadyState::Pending);

        let fan_out = FanOut {
            inbound,
            outbound: outbound.clone(),
            command_rx,
            router: Router::new(),
            storage: Storage::new(config.table_keys.clone()),
            ready_tx,
            cancel: cancel.clone(),
        };
        tokio::spawn(fan_out.run());

        if config.dead_mans_switch {
            tokio::spawn(deadman::run(outbound, cancel.clone()));
        }

        BitmexClient {
            command_tx,
            cancel,
            ready: ready_rx,
        }
    }

    /// Wait for the server greeting. Fails with the session's terminal
    /// cause if the connection dies first.
    pub async fn ready(&self) -> Result<(), SessionError> {
        let mut ready = self.ready.clone();
        loop {
            match &*ready.borrow_and_update() {
                ReadyState::Ready => return Ok(()),
                ReadyState::Failed(cause) => return Err(cause.clone().into()),
                ReadyState::Pending => {}
            }
            if ready.changed().await.is_err() {
                return Err(SessionError::SessionClosed);
            }
        }
    }

    /// Subscribe to a table, optionally narrowed to specific symbols, and
    /// return the stream of matching change records.
    ///
    /// The upstream subscribe for any newly-needed topic is issued before
    /// this returns. Dropping the listener releases its subscriptions.
    pub async fn listen(
        &self,
        table: impl Into<String>,
        symbols: &[&str],
    ) -> Result<TableListener, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::SessionClosed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(RouterCommand::Register {
                table: table.into(),
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                reply: reply_tx,
            })
            .map_err(|_| SessionError::SessionClosed)?;

        let (id, rx) = reply_rx.await.map_err(|_| SessionError::SessionClosed)?;
        Ok(TableListener {
            id,
            rx,
            command_tx: self.command_tx.clone(),
        })
    }

    /// Cancel all owned tasks and close the transport.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for BitmexClient {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl From<StreamError> for SessionError {
    fn from(err: StreamError) -> Self {
        match err {
            StreamError::Api { status, message } => SessionError::Api { status, message },
            StreamError::ConnectionClosed { code, reason } => SessionError::Closed { code, reason },
            StreamError::Protocol(message) => SessionError::Protocol(message),
        }
    }
}

/// One logical listener's consumable sequence of change records.
///
/// Ends with `Some(Err(_))` when the session fails, or `None` after a
/// normal close. Dropping it detaches the listener and decrements its
/// subscription reference counts.
pub struct TableListener {
    id: ListenerId,
    rx: mpsc::Receiver<Delivery>,
    command_tx: mpsc::UnboundedSender<RouterCommand>,
}

impl TableListener {
    pub async fn next(&mut self) -> Option<Delivery> {
        self.rx.recv().await
    }
}

impl Drop for TableListener {
    fn drop(&mut self) {
        // The fan-out task may already be gone; then there is nothing to
        // unsubscribe from anyway.
        let _ = self.command_tx.send(RouterCommand::Deregister { id: self.id });
    }
}

/// The single task that reads the transport and owns all mutable state.
struct FanOut {
    inbound: InboundReceiver,
    outbound: OutboundSender,
    command_rx: mpsc::UnboundedReceiver<RouterCommand>,
    router: Router,
    storage: Storage,
    ready_tx: watch::Sender<ReadyState>,
    cancel: CancellationToken,
}

impl FanOut {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::debug!("Session cancelled; stopping fan-out");
                    self.router.close_all();
                    return;
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    // Client and every listener are gone; tear down.
                    None => {
                        self.cancel.cancel();
                        self.router.close_all();
                        return;
                    }
                },
                event = self.inbound.recv() => match event {
                    Some(TransportEvent::Message(message)) => {
                        if let Err(cause) = self.handle_message(message).await {
                            self.fail(cause).await;
                            return;
                        }
                    }
                    Some(TransportEvent::Closed { code, reason }) => {
                        tracing::debug!(?code, reason, "Connection closed by peer");
                        self.fail(StreamError::ConnectionClosed { code, reason }).await;
                        return;
                    }
                    None => {
                        self.fail(StreamError::ConnectionClosed {
                            code: None,
                            reason: "transport dropped".to_string(),
                        })
                        .await;
                        return;
                    }
                },
            }
        }
    }

    async fn handle_message(&mut self, message: serde_json::Value) -> Result<(), StreamError> {
        let event = parser::classify(message).map_err(|e| StreamError::from_session(&e))?;
        match event {
            ProtocolEvent::Ready => {
                self.ready_tx.send_replace(ReadyState::Ready);
            }
            ProtocolEvent::Diff(diff) => {
                let changes = self
                    .storage
                    .apply(&diff)
                    .map_err(|e| StreamError::from_session(&SessionError::from(e)))?;
                for change in changes {
                    let dead = self.router.dispatch(&change).await;
                    for id in dead {
                        if let Some(unsubscribe) = self.router.deregister(id) {
                            self.send_upstream(unsubscribe).await;
                        }
                    }
                }
            }
            ProtocolEvent::Ignored => {}
        }
        Ok(())
    }

    async fn handle_command(&mut self, command: RouterCommand) {
        match command {
            RouterCommand::Register {
                table,
                symbols,
                reply,
            } => {
                let (id, rx, subscribe) = self.router.register(table, symbols);
                if let Some(subscribe) = subscribe {
                    // Issued before the caller regains control: the reply
                    // is only sent once the subscribe is on the wire queue.
                    self.send_upstream(subscribe).await;
                }
                let _ = reply.send((id, rx));
            }
            RouterCommand::Deregister { id } => {
                if let Some(unsubscribe) = self.router.deregister(id) {
                    self.send_upstream(unsubscribe).await;
                }
            }
        }
    }

    /// Queue a control message for the transport. A closed transport makes
    /// this a no-op: there is nothing left to (un)subscribe on.
    async fn send_upstream(&self, command: Command) {
        match serde_json::to_value(&command) {
            Ok(value) => {
                if self.outbound.send(value).await.is_err() {
                    tracing::debug!(op = %command.op, "Transport closed; dropping command");
                }
            }
            Err(e) => tracing::error!(error = %e, "Failed to encode command"),
        }
    }

    /// Terminate every listener with the session's fatal cause.
    async fn fail(&mut self, cause: StreamError) {
        tracing::error!(%cause, "Session failed");
        self.router.fail_all(cause.clone()).await;
        self.ready_tx.send_if_modified(|state| match state {
            ReadyState::Pending => {
                *state = ReadyState::Failed(cause.clone());
                true
            }
            _ => false,
        });
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_network_fails_before_connecting() {
        let result = connect("localnet", SessionConfig::default()).await;
        assert!(matches!(
            result,
            Err(SessionError::InvalidNetwork(n)) if n == "localnet"
        ));
    }

    #[tokio::test]
    async fn test_listen_after_close_is_an_error() {
        let (out_tx, _out_rx) = mpsc::channel(8);
        let (_in_tx, in_rx) = mpsc::channel(8);
        let client = BitmexClient::open(out_tx, in_rx, &SessionConfig::default());

        client.close();
        let result = client.listen("trade", &[]).await;
        assert!(matches!(result, Err(SessionError::SessionClosed)));
    }
}
