//! Websocket transport: the abstract duplex message channel the core runs
//! on.
//!
//! `connect` opens the socket and pumps frames through a channel pair; the
//! rest of the crate only ever sees `mpsc` endpoints carrying decoded JSON,
//! so tests drive a session from a hand-built channel pair instead of a
//! network.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::{self, Message};

/// Depth of the channels between the socket pumps and the session.
const CHANNEL_DEPTH: usize = 1024;

#[derive(Error, Debug)]
pub enum TransportError {
    /// Handshake-level failure, e.g. bad credentials.
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("connection error: {0}")]
    Connection(#[from] tungstenite::Error),
    #[error("invalid header '{0}'")]
    InvalidHeader(String),
}

/// Inbound side of the duplex channel.
#[derive(Debug)]
pub enum TransportEvent {
    /// A decoded frame.
    Message(Value),
    /// The peer closed the connection (or it failed); terminal.
    Closed { code: Option<u16>, reason: String },
}

/// Sender half handed to the session for outbound messages.
pub type OutboundSender = mpsc::Sender<Value>;
/// Receiver half handed to the session for inbound events.
pub type InboundReceiver = mpsc::Receiver<TransportEvent>;

/// Open the websocket and return the duplex channel pair.
///
/// Dropping the outbound sender closes the socket.
pub async fn connect(
    url: &str,
    headers: &[(String, String)],
) -> Result<(OutboundSender, InboundReceiver), TransportError> {
    let request = client_request(url, headers)?;
    let (ws_stream, _) = connect_async(request).await.map_err(|e| match e {
        tungstenite::Error::Http(response) => {
            TransportError::Rejected(format!("handshake failed with status {}", response.status()))
        }
        other => TransportError::Connection(other),
    })?;
    let (mut write, mut read) = ws_stream.split();

    let (out_tx, mut out_rx) = mpsc::channel::<Value>(CHANNEL_DEPTH);
    let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(CHANNEL_DEPTH);

    // Outbound pump: serialize and send until the session drops its sender,
    // then close the socket.
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to serialize outbound message");
                    continue;
                }
            };
            if let Err(e) = write.send(Message::Text(json.into())).await {
                tracing::warn!(error = %e, "Outbound send failed; stopping writer");
                break;
            }
        }
        let _ = write.send(Message::Close(None)).await;
    });

    // Inbound pump: decode frames into transport events.
    tokio::spawn(async move {
        loop {
            let event = match read.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<Value>(&text) {
                    Ok(value) => TransportEvent::Message(value),
                    Err(e) => {
                        tracing::warn!(error = %e, "Discarding undecodable frame");
                        continue;
                    }
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(f) => (Some(u16::from(f.code)), f.reason.to_string()),
                        None => (None, String::new()),
                    };
                    TransportEvent::Closed { code, reason }
                }
                Some(Ok(Message::Ping(payload))) => {
                    tracing::trace!(?payload, "Received ping");
                    continue;
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => TransportEvent::Closed {
                    code: None,
                    reason: e.to_string(),
                },
                None => TransportEvent::Closed {
                    code: None,
                    reason: "connection closed".to_string(),
                },
            };

            let terminal = matches!(event, TransportEvent::Closed { .. });
            if in_tx.send(event).await.is_err() || terminal {
                break;
            }
        }
    });

    Ok((out_tx, in_rx))
}

fn client_request(url: &str, headers: &[(String, String)]) -> Result<Request, TransportError> {
    let mut request = url
        .into_client_request()
        .map_err(TransportError::Connection)?;
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| TransportError::InvalidHeader(name.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| TransportError::InvalidHeader(name.to_string()))?;
        request.headers_mut().insert(name, value);
    }
    Ok(request)
}
