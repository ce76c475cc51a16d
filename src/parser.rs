//! Protocol parser: classifies decoded frames from the realtime feed.
//!
//! Table diffs flow downstream to the replication engine; control events
//! are handled here. API-level errors are fatal to the session.

use serde_json::Value;

use crate::error::SessionError;
use crate::message::TableMessage;

/// Outcome of classifying one inbound frame.
#[derive(Debug)]
pub enum ProtocolEvent {
    /// Connection established (`info` greeting).
    Ready,
    /// A table diff for the replication engine.
    Diff(TableMessage),
    /// Control event handled locally; nothing flows downstream.
    Ignored,
}

/// Classify one decoded message.
pub fn classify(message: Value) -> Result<ProtocolEvent, SessionError> {
    if message.get("info").is_some() {
        tracing::debug!("Connected to BitMEX realtime api");
        return Ok(ProtocolEvent::Ready);
    }

    if let Some(subscribe) = message.get("subscribe") {
        if message.get("success").and_then(Value::as_bool).unwrap_or(false) {
            tracing::debug!(topic = %subscribe, "Subscribed");
        } else {
            let topic = message
                .pointer("/request/args/0")
                .cloned()
                .unwrap_or(subscribe.clone());
            let error = message.get("error").and_then(Value::as_str).unwrap_or("unknown");
            tracing::error!(topic = %topic, error, "Unable to subscribe; check and restart");
        }
        return Ok(ProtocolEvent::Ignored);
    }

    if message.get("action").is_some() {
        let diff: TableMessage = serde_json::from_value(message)
            .map_err(|e| SessionError::Protocol(format!("malformed table message: {e}")))?;
        return Ok(ProtocolEvent::Diff(diff));
    }

    if message.pointer("/request/op").and_then(Value::as_str) == Some("cancelAllAfter") {
        let cancel_time = message.get("cancelTime").cloned().unwrap_or(Value::Null);
        tracing::debug!(%cancel_time, "Dead man's switch reset; open orders cancel at cancelTime");
        return Ok(ProtocolEvent::Ignored);
    }

    if let Some(error) = message.get("error") {
        let status = message.get("status").and_then(Value::as_i64).unwrap_or(0);
        let text = error.as_str().map(str::to_string).unwrap_or_else(|| error.to_string());
        return Err(SessionError::Api {
            status,
            message: text,
        });
    }

    tracing::warn!(%message, "Received unknown message type");
    Ok(ProtocolEvent::Ignored)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Action;
    use serde_json::json;

    #[test]
    fn test_info_is_ready() {
        let event = classify(json!({"info": "Welcome to the BitMEX Realtime API."})).unwrap();
        assert!(matches!(event, ProtocolEvent::Ready));
    }

    #[test]
    fn test_subscribe_ack_ignored() {
        let ok = classify(json!({"success": true, "subscribe": "trade:XBTUSD"})).unwrap();
        assert!(matches!(ok, ProtocolEvent::Ignored));

        // Failed subscription is logged, never fatal.
        let failed = classify(json!({
            "success": false,
            "subscribe": "trade:XBTUSD",
            "error": "Unknown symbol",
            "request": {"op": "subscribe", "args": ["trade:XBTUSD"]}
        }))
        .unwrap();
        assert!(matches!(failed, ProtocolEvent::Ignored));
    }

    #[test]
    fn test_action_yields_diff() {
        let event = classify(json!({
            "table": "trade",
            "action": "insert",
            "data": [{"symbol": "XBTUSD", "price": 100}]
        }))
        .unwrap();

        match event {
            ProtocolEvent::Diff(diff) => {
                assert_eq!(diff.table, "trade");
                assert_eq!(diff.action, Action::Insert);
                assert_eq!(diff.data.len(), 1);
            }
            other => panic!("Expected Diff, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_action_is_protocol_error() {
        let result = classify(json!({"table": "trade", "action": "upsert", "data": []}));
        assert!(matches!(result, Err(SessionError::Protocol(_))));
    }

    #[test]
    fn test_keepalive_ack_ignored() {
        let event = classify(json!({
            "now": "2026-08-30T12:00:00.000Z",
            "cancelTime": "2026-08-30T12:01:00.000Z",
            "request": {"op": "cancelAllAfter", "args": 60000}
        }))
        .unwrap();
        assert!(matches!(event, ProtocolEvent::Ignored));
    }

    #[test]
    fn test_api_error_is_fatal() {
        let result = classify(json!({
            "status": 429,
            "error": "Rate limit exceeded",
            "request": {"op": "subscribe", "args": ["quote"]}
        }));
        match result {
            Err(SessionError::Api { status, message }) => {
                assert_eq!(status, 429);
                assert_eq!(message, "Rate limit exceeded");
            }
            other => panic!("Expected Api error, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_message_discarded() {
        let event = classify(json!({"spam": true})).unwrap();
        assert!(matches!(event, ProtocolEvent::Ignored));
    }
}
