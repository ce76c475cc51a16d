//! Wire message shapes and the engine's normalized output unit.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A table record: field name to scalar value. Schemas are ad hoc per
/// table, so records stay dynamic rather than one typed struct per table.
pub type Record = serde_json::Map<String, Value>;

/// The four diff actions the realtime feed emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Full table image; also declares the table's key schema.
    Partial,
    Insert,
    Update,
    Delete,
}

/// Inbound table diff message.
#[derive(Debug, Clone, Deserialize)]
pub struct TableMessage {
    pub table: String,
    pub action: Action,
    #[serde(default)]
    pub data: Vec<Record>,
    /// Present only on partials; when non-empty, defines the key schema.
    #[serde(default)]
    pub keys: Option<Vec<String>>,
    /// Column name -> type map, sent on partials. Key-schema fallback for
    /// tables that declare no keys.
    #[serde(default)]
    pub attributes: Option<Record>,
}

/// Outbound control message: `{"op": ..., "args": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub op: String,
    pub args: Value,
}

impl Command {
    pub fn subscribe(topics: Vec<String>) -> Self {
        Command {
            op: "subscribe".to_string(),
            args: Value::from(topics),
        }
    }

    pub fn unsubscribe(topics: Vec<String>) -> Self {
        Command {
            op: "unsubscribe".to_string(),
            args: Value::from(topics),
        }
    }

    pub fn cancel_all_after(millis: u64) -> Self {
        Command {
            op: "cancelAllAfter".to_string(),
            args: Value::from(millis),
        }
    }
}

/// Subscription topic for a table, optionally narrowed to one symbol.
pub fn topic(table: &str, symbol: Option<&str>) -> String {
    match symbol {
        Some(sym) => format!("{table}:{sym}"),
        None => table.to_string(),
    }
}

/// The engine's normalized output unit: one change to one table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChangeRecord {
    pub table: String,
    pub action: Action,
    /// Symbol the record belongs to, when the record carries one.
    pub symbol: Option<String>,
    /// The affected record. For order-book partials this is the symbol's
    /// entire current book, not a single record.
    pub data: Value,
}

/// A hashable, orderable scalar derived from a record field, used to build
/// composite table keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ScalarKey {
    Null,
    Bool(bool),
    Int(i64),
    /// Non-integral numbers, keyed by bit pattern.
    Float(u64),
    Text(String),
}

impl From<&Value> for ScalarKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => ScalarKey::Null,
            Value::Bool(b) => ScalarKey::Bool(*b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => ScalarKey::Int(i),
                None => ScalarKey::Float(n.as_f64().unwrap_or(f64::NAN).to_bits()),
            },
            Value::String(s) => ScalarKey::Text(s.clone()),
            // Arrays and objects never appear as key fields on this feed.
            other => ScalarKey::Text(other.to_string()),
        }
    }
}

/// Composite key derived from a record according to a table's key schema.
pub type TableKey = Vec<ScalarKey>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_roundtrip() {
        assert_eq!(
            serde_json::from_str::<Action>("\"partial\"").unwrap(),
            Action::Partial
        );
        assert_eq!(serde_json::to_string(&Action::Delete).unwrap(), "\"delete\"");
        assert!(serde_json::from_str::<Action>("\"upsert\"").is_err());
    }

    #[test]
    fn test_table_message_deserialize() {
        let msg: TableMessage = serde_json::from_value(json!({
            "table": "trade",
            "action": "partial",
            "keys": ["symbol", "timestamp"],
            "data": [{"symbol": "XBTUSD", "timestamp": "T1", "price": 100}]
        }))
        .unwrap();

        assert_eq!(msg.table, "trade");
        assert_eq!(msg.action, Action::Partial);
        assert_eq!(msg.keys.as_deref(), Some(&["symbol".to_string(), "timestamp".to_string()][..]));
        assert_eq!(msg.data.len(), 1);
        assert!(msg.attributes.is_none());
    }

    #[test]
    fn test_command_wire_shape() {
        let sub = Command::subscribe(vec!["instrument:XBTUSD".to_string()]);
        assert_eq!(
            serde_json::to_value(&sub).unwrap(),
            json!({"op": "subscribe", "args": ["instrument:XBTUSD"]})
        );

        let keepalive = Command::cancel_all_after(60000);
        assert_eq!(
            serde_json::to_value(&keepalive).unwrap(),
            json!({"op": "cancelAllAfter", "args": 60000})
        );
    }

    #[test]
    fn test_topic_format() {
        assert_eq!(topic("instrument", None), "instrument");
        assert_eq!(topic("instrument", Some("XBTUSD")), "instrument:XBTUSD");
    }

    #[test]
    fn test_scalar_key_equality() {
        assert_eq!(ScalarKey::from(&json!("XBTUSD")), ScalarKey::Text("XBTUSD".to_string()));
        assert_eq!(ScalarKey::from(&json!(17)), ScalarKey::Int(17));
        assert_ne!(ScalarKey::from(&json!(1.5)), ScalarKey::from(&json!(2.5)));
        assert_eq!(ScalarKey::from(&json!(null)), ScalarKey::Null);
    }
}
