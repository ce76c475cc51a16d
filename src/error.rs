use thiserror::Error;

/// Fatal, session-level errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("invalid network '{0}': must be 'mainnet' or 'testnet'")]
    InvalidNetwork(String),
    #[error("connection rejected: {0}")]
    Rejected(String),
    #[error("connection closed (code {code:?}): {reason}")]
    Closed { code: Option<u16>, reason: String },
    #[error("api error {status}: {message}")]
    Api { status: i64, message: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("session is closed")]
    SessionClosed,
}

/// Errors raised by the replication engine while applying a diff message.
///
/// All of these indicate a corrupted or unsupported upstream protocol; the
/// recoverable reconciliation anomalies (update/delete miss) are logged and
/// skipped inside the engine instead.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("order book batch for table '{table}' contained multiple symbols")]
    MixedSymbols { table: String },
    #[error("table '{table}' record is missing key field '{field}'")]
    MissingKeyField { table: String, field: String },
    #[error("no key schema known for table '{0}' (no partial received)")]
    NoKeySchema(String),
    #[error("orderBookL2 must be indexed by (symbol, side, id), not by key schema")]
    BookKeyDerivation,
}

/// Terminal cause delivered to listeners when their stream ends abnormally.
///
/// Cloneable so one upstream failure can be fanned out to every listener.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("api error {status}: {message}")]
    Api { status: i64, message: String },
    #[error("connection closed (code {code:?}): {reason}")]
    ConnectionClosed { code: Option<u16>, reason: String },
    #[error("protocol violation: {0}")]
    Protocol(String),
}

impl StreamError {
    /// Project a fatal session error onto the cause listeners see.
    pub(crate) fn from_session(err: &SessionError) -> Self {
        match err {
            SessionError::Api { status, message } => StreamError::Api {
                status: *status,
                message: message.clone(),
            },
            SessionError::Closed { code, reason } => StreamError::ConnectionClosed {
                code: *code,
                reason: reason.clone(),
            },
            other => StreamError::Protocol(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_projection() {
        let api = SessionError::Api {
            status: 400,
            message: "bad request".to_string(),
        };
        assert_eq!(
            StreamError::from_session(&api),
            StreamError::Api {
                status: 400,
                message: "bad request".to_string()
            }
        );

        let closed = SessionError::Closed {
            code: Some(1006),
            reason: "abnormal".to_string(),
        };
        assert_eq!(
            StreamError::from_session(&closed),
            StreamError::ConnectionClosed {
                code: Some(1006),
                reason: "abnormal".to_string()
            }
        );

        let storage = SessionError::from(StorageError::BookKeyDerivation);
        assert!(matches!(
            StreamError::from_session(&storage),
            StreamError::Protocol(_)
        ));
    }
}
