//! Replication engine: applies table diff messages to in-memory state.
//!
//! One ordered, keyed store per table, except the L2 order book which is
//! indexed by (symbol, side, id) and never size-evicted. Applying a diff
//! returns the normalized change records to fan out; the engine itself
//! never touches the network.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;

use crate::error::StorageError;
use crate::message::{Action, ChangeRecord, Record, ScalarKey, TableKey, TableMessage};

/// Don't grow a table larger than this amount. Caps memory usage.
pub const MAX_TABLE_LEN: usize = 200;

/// Closed orders younger than this may still be reopened by a leavesQty
/// amendment, so their eviction is deferred.
const ORDER_PRUNE_AGE_SECS: i64 = 60;

const ORDER_BOOK_TABLE: &str = "orderBookL2";
const ORDER_TABLE: &str = "order";

/// One side of one symbol's book, ordered by order id.
type BookSide = BTreeMap<ScalarKey, Record>;

pub struct Storage {
    /// Every table except the order book: derived key -> record, in
    /// insertion order.
    tables: HashMap<String, IndexMap<TableKey, Record>>,
    /// orderBookL2: symbol -> side -> id -> record.
    books: HashMap<String, BTreeMap<String, BookSide>>,
    /// Learned key schema per table. Immutable once set.
    keys: HashMap<String, Vec<String>>,
    /// Static overrides, taking priority over keys declared on partials.
    overrides: HashMap<String, Vec<String>>,
}

impl Storage {
    pub fn new(overrides: HashMap<String, Vec<String>>) -> Self {
        Storage {
            tables: HashMap::new(),
            books: HashMap::new(),
            keys: HashMap::new(),
            overrides,
        }
    }

    /// Apply one diff message, returning the change records it produced.
    pub fn apply(&mut self, message: &TableMessage) -> Result<Vec<ChangeRecord>, StorageError> {
        tracing::debug!(table = %message.table, action = ?message.action, rows = message.data.len(), "Applying diff");
        match message.action {
            Action::Partial => self.apply_partial(message),
            Action::Insert => self.apply_insert(message),
            Action::Update => self.apply_update(message),
            Action::Delete => self.apply_delete(message),
        }
    }

    fn apply_partial(&mut self, message: &TableMessage) -> Result<Vec<ChangeRecord>, StorageError> {
        self.learn_keys(message);
        self.insert_records(&message.table, &message.data)?;
        // An oversized snapshot must not leave the table over the cap.
        self.trim_bounded(&message.table);

        if message.table == ORDER_BOOK_TABLE {
            // One change per touched symbol, carrying the symbol's entire
            // current book. Per-row output makes no sense for a table this
            // large.
            let Some(symbol) = first_symbol(&message.data) else {
                return Ok(Vec::new());
            };
            Ok(vec![ChangeRecord {
                table: message.table.clone(),
                action: message.action,
                symbol: Some(symbol.to_string()),
                data: self.book_snapshot(symbol),
            }])
        } else {
            Ok(emit_each(message))
        }
    }

    fn apply_insert(&mut self, message: &TableMessage) -> Result<Vec<ChangeRecord>, StorageError> {
        self.enforce_limits(&message.table);
        self.insert_records(&message.table, &message.data)?;
        // The batch itself can blow past the cap; re-trim so the bound
        // holds between messages.
        self.trim_bounded(&message.table);
        Ok(emit_each(message))
    }

    fn apply_update(&mut self, message: &TableMessage) -> Result<Vec<ChangeRecord>, StorageError> {
        let mut changes = Vec::with_capacity(message.data.len());

        for update in &message.data {
            let merged = if message.table == ORDER_BOOK_TABLE {
                self.merge_book_record(update)
            } else {
                self.merge_table_record(&message.table, update)
            };

            match merged {
                Some(record) => changes.push(ChangeRecord {
                    table: message.table.clone(),
                    action: message.action,
                    symbol: record_symbol(&record),
                    data: Value::Object(record),
                }),
                // Update racing ahead of the partial/insert. Expected.
                None => {
                    tracing::debug!(table = %message.table, "No record found to update; skipping")
                }
            }
        }

        Ok(changes)
    }

    fn apply_delete(&mut self, message: &TableMessage) -> Result<Vec<ChangeRecord>, StorageError> {
        for record in &message.data {
            let removed = if message.table == ORDER_BOOK_TABLE {
                self.remove_book_record(record)
            } else {
                self.remove_table_record(&message.table, record)
            };
            if !removed {
                tracing::debug!(table = %message.table, "No record found to delete; skipping");
            }
        }

        // The deletion fragment goes downstream whether or not removal
        // found anything.
        Ok(emit_each(message))
    }

    /// Learn the table's key schema from a partial. Priority: static
    /// override > declared keys > attribute names > first record's fields.
    /// Once set, the schema never changes for the life of the session.
    fn learn_keys(&mut self, message: &TableMessage) {
        if self.keys.contains_key(&message.table) {
            return;
        }

        let schema = self
            .overrides
            .get(&message.table)
            .cloned()
            .or_else(|| message.keys.clone().filter(|k| !k.is_empty()))
            .or_else(|| {
                message
                    .attributes
                    .as_ref()
                    .map(|attrs| attrs.keys().cloned().collect())
            })
            .or_else(|| {
                message
                    .data
                    .first()
                    .map(|record| record.keys().cloned().collect())
            });

        if let Some(schema) = schema {
            tracing::debug!(table = %message.table, keys = ?schema, "Learned key schema");
            self.keys.insert(message.table.clone(), schema);
        }
    }

    fn insert_records(&mut self, table: &str, data: &[Record]) -> Result<(), StorageError> {
        if table == ORDER_BOOK_TABLE {
            let Some(first) = first_symbol(data) else {
                return Ok(());
            };
            if data.iter().any(|r| record_symbol_str(r) != Some(first)) {
                return Err(StorageError::MixedSymbols {
                    table: table.to_string(),
                });
            }
            let first = first.to_string();

            for record in data {
                let side = record
                    .get("side")
                    .and_then(Value::as_str)
                    .ok_or_else(|| StorageError::MissingKeyField {
                        table: table.to_string(),
                        field: "side".to_string(),
                    })?
                    .to_string();
                let id = record.get("id").map(ScalarKey::from).ok_or_else(|| {
                    StorageError::MissingKeyField {
                        table: table.to_string(),
                        field: "id".to_string(),
                    }
                })?;

                self.books
                    .entry(first.clone())
                    .or_default()
                    .entry(side)
                    .or_default()
                    .insert(id, record.clone());
            }
            Ok(())
        } else {
            let schema = self
                .keys
                .get(table)
                .cloned()
                .ok_or_else(|| StorageError::NoKeySchema(table.to_string()))?;
            let store = self.tables.entry(table.to_string()).or_default();

            for record in data {
                let key = make_key(&schema, table, record)?;
                store.insert(key, record.clone());
            }
            Ok(())
        }
    }

    /// Merge an update into an existing keyed record. None when absent.
    fn merge_table_record(&mut self, table: &str, update: &Record) -> Option<Record> {
        let schema = self.keys.get(table)?;
        let key = make_key(schema, table, update).ok()?;
        let record = self.tables.get_mut(table)?.get_mut(&key)?;
        for (field, value) in update {
            record.insert(field.clone(), value.clone());
        }
        Some(record.clone())
    }

    /// Merge an update into a book record located by (symbol, side, id).
    fn merge_book_record(&mut self, update: &Record) -> Option<Record> {
        let symbol = update.get("symbol")?.as_str()?;
        let side = update.get("side")?.as_str()?;
        let id = update.get("id").map(ScalarKey::from)?;

        let record = self
            .books
            .get_mut(symbol)?
            .get_mut(side)?
            .get_mut(&id)?;
        for (field, value) in update {
            record.insert(field.clone(), value.clone());
        }
        Some(record.clone())
    }

    fn remove_table_record(&mut self, table: &str, record: &Record) -> bool {
        let Some(schema) = self.keys.get(table) else {
            return false;
        };
        let Ok(key) = make_key(schema, table, record) else {
            return false;
        };
        self.tables
            .get_mut(table)
            .and_then(|store| store.shift_remove(&key))
            .is_some()
    }

    fn remove_book_record(&mut self, record: &Record) -> bool {
        let Some(symbol) = record.get("symbol").and_then(Value::as_str) else {
            return false;
        };
        let Some(side) = record.get("side").and_then(Value::as_str) else {
            return false;
        };
        let Some(id) = record.get("id").map(ScalarKey::from) else {
            return false;
        };
        self.books
            .get_mut(symbol)
            .and_then(|book| book.get_mut(side))
            .and_then(|levels| levels.remove(&id))
            .is_some()
    }

    /// Table-specific eviction, run before each insert batch.
    fn enforce_limits(&mut self, table: &str) {
        if table == ORDER_TABLE {
            self.prune_closed_orders();
        } else if table == ORDER_BOOK_TABLE {
            // Never trim the book; losing levels corrupts the replica.
        } else {
            self.trim_bounded(table);
        }
    }

    /// Trim a bounded table back to half the cap, oldest-inserted first.
    fn trim_bounded(&mut self, table: &str) {
        if table == ORDER_TABLE || table == ORDER_BOOK_TABLE {
            return;
        }
        if let Some(store) = self.tables.get_mut(table)
            && store.len() > MAX_TABLE_LEN
        {
            let excess = store.len() - MAX_TABLE_LEN / 2;
            store.drain(..excess);
            tracing::debug!(table, len = store.len(), "Trimmed table to size cap");
        }
    }

    /// Evict filled/closed orders older than a minute, whatever the table
    /// size. Within the window a filled order can still be reopened by a
    /// leavesQty amendment.
    fn prune_closed_orders(&mut self) {
        let Some(store) = self.tables.get_mut(ORDER_TABLE) else {
            return;
        };
        let now = Utc::now();
        let outdated: Vec<TableKey> = store
            .iter()
            .filter(|(_, order)| {
                let closed = order
                    .get("leavesQty")
                    .and_then(Value::as_f64)
                    .is_some_and(|qty| qty <= 0.0);
                closed
                    && parse_timestamp(order).is_some_and(|ts| {
                        (now - ts).num_seconds() > ORDER_PRUNE_AGE_SECS
                    })
            })
            .map(|(key, _)| key.clone())
            .collect();

        for key in outdated {
            store.shift_remove(&key);
        }
    }

    /// A symbol's full current book: side -> records in id order.
    pub fn book_snapshot(&self, symbol: &str) -> Value {
        let mut sides = serde_json::Map::new();
        if let Some(book) = self.books.get(symbol) {
            for (side, levels) in book {
                sides.insert(
                    side.clone(),
                    Value::Array(levels.values().cloned().map(Value::Object).collect()),
                );
            }
        }
        Value::Object(sides)
    }

    pub fn key_schema(&self, table: &str) -> Option<&[String]> {
        self.keys.get(table).map(Vec::as_slice)
    }

    pub fn table_len(&self, table: &str) -> usize {
        self.tables.get(table).map_or(0, IndexMap::len)
    }

    pub fn record(&self, table: &str, key: &TableKey) -> Option<&Record> {
        self.tables.get(table)?.get(key)
    }

    pub fn book_len(&self, symbol: &str) -> usize {
        self.books
            .get(symbol)
            .map_or(0, |book| book.values().map(BookSide::len).sum())
    }
}

impl Default for Storage {
    fn default() -> Self {
        Storage::new(HashMap::new())
    }
}

/// Derive the composite key for a record according to the table's schema.
/// The order book is never addressed this way.
pub fn make_key(schema: &[String], table: &str, record: &Record) -> Result<TableKey, StorageError> {
    if table == ORDER_BOOK_TABLE {
        return Err(StorageError::BookKeyDerivation);
    }
    schema
        .iter()
        .map(|field| {
            record
                .get(field)
                .map(ScalarKey::from)
                .ok_or_else(|| StorageError::MissingKeyField {
                    table: table.to_string(),
                    field: field.clone(),
                })
        })
        .collect()
}

fn record_symbol(record: &Record) -> Option<String> {
    record_symbol_str(record).map(str::to_string)
}

fn record_symbol_str(record: &Record) -> Option<&str> {
    record.get("symbol").and_then(Value::as_str)
}

fn first_symbol(data: &[Record]) -> Option<&str> {
    data.first().and_then(record_symbol_str)
}

fn parse_timestamp(record: &Record) -> Option<DateTime<Utc>> {
    let raw = record.get("timestamp")?.as_str()?;
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// One change record per input record, symbol taken from the record.
fn emit_each(message: &TableMessage) -> Vec<ChangeRecord> {
    message
        .data
        .iter()
        .map(|record| ChangeRecord {
            table: message.table.clone(),
            action: message.action,
            symbol: record_symbol(record),
            data: Value::Object(record.clone()),
        })
        .collect()
}
