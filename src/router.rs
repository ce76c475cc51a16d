//! Subscription router: owns the listener registry and the per-topic
//! reference counts that gate upstream subscribe/unsubscribe traffic.
//!
//! Mutated only from the session's fan-out task (registration requests
//! arrive as commands), so no locking is needed.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot};

use crate::error::StreamError;
use crate::message::{ChangeRecord, Command, topic};

/// Per-listener queue depth. A full queue backpressures the fan-out loop
/// rather than dropping records.
pub const LISTENER_QUEUE: usize = 64;

/// What a listener's queue carries: records, or the terminal failure cause.
pub type Delivery = Result<ChangeRecord, StreamError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Registration requests, serialized through the fan-out task.
pub(crate) enum RouterCommand {
    Register {
        table: String,
        symbols: Vec<String>,
        reply: oneshot::Sender<(ListenerId, mpsc::Receiver<Delivery>)>,
    },
    Deregister {
        id: ListenerId,
    },
}

struct ListenerEntry {
    table: String,
    symbols: Vec<String>,
    tx: mpsc::Sender<Delivery>,
}

impl ListenerEntry {
    /// A null record symbol always matches: table-wide records go to every
    /// listener of that table.
    fn matches(&self, record: &ChangeRecord) -> bool {
        record.table == self.table
            && (self.symbols.is_empty()
                || match &record.symbol {
                    Some(symbol) => self.symbols.contains(symbol),
                    None => true,
                })
    }
}

#[derive(Default)]
pub(crate) struct Router {
    listeners: HashMap<ListenerId, ListenerEntry>,
    /// Reference count per (table, symbol) pair; `None` symbol is the bare
    /// table subscription.
    refcounts: HashMap<(String, Option<String>), usize>,
    next_id: u64,
}

impl Router {
    pub fn new() -> Self {
        Router::default()
    }

    /// Register a listener. Returns its id and queue, plus the upstream
    /// subscribe naming exactly the topics whose count went 0 -> 1.
    pub fn register(
        &mut self,
        table: String,
        symbols: Vec<String>,
    ) -> (ListenerId, mpsc::Receiver<Delivery>, Option<Command>) {
        let id = ListenerId(self.next_id);
        self.next_id += 1;

        let mut new_topics = Vec::new();
        for pair in pairs(&table, &symbols) {
            let count = self.refcounts.entry(pair.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                new_topics.push(topic(&pair.0, pair.1.as_deref()));
            }
        }

        let (tx, rx) = mpsc::channel(LISTENER_QUEUE);
        self.listeners.insert(id, ListenerEntry { table, symbols, tx });

        let subscribe = (!new_topics.is_empty()).then(|| Command::subscribe(new_topics));
        (id, rx, subscribe)
    }

    /// Remove a listener. Returns the upstream unsubscribe for any topic
    /// whose count reached zero.
    pub fn deregister(&mut self, id: ListenerId) -> Option<Command> {
        let entry = self.listeners.remove(&id)?;
        tracing::debug!(table = %entry.table, symbols = ?entry.symbols, "Listener detached");

        let mut dead_topics = Vec::new();
        for pair in pairs(&entry.table, &entry.symbols) {
            let Some(count) = self.refcounts.get_mut(&pair) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&pair);
                dead_topics.push(topic(&pair.0, pair.1.as_deref()));
            }
        }

        if dead_topics.is_empty() {
            None
        } else {
            tracing::debug!(topics = ?dead_topics, "No more listeners; unsubscribing");
            Some(Command::unsubscribe(dead_topics))
        }
    }

    /// Deliver one record to every matching listener, awaiting full queues.
    /// Returns listeners whose queue has gone away, for deregistration.
    pub async fn dispatch(&mut self, record: &ChangeRecord) -> Vec<ListenerId> {
        let mut dead = Vec::new();
        for (id, entry) in &self.listeners {
            if !entry.matches(record) {
                continue;
            }
            if entry.tx.send(Ok(record.clone())).await.is_err() {
                dead.push(*id);
            }
        }
        dead
    }

    /// Terminate every listener's stream with the same cause.
    pub async fn fail_all(&mut self, error: StreamError) {
        for entry in self.listeners.values() {
            let _ = entry.tx.send(Err(error.clone())).await;
        }
        self.listeners.clear();
        self.refcounts.clear();
    }

    /// Close every listener's stream normally (no terminal error).
    pub fn close_all(&mut self) {
        self.listeners.clear();
        self.refcounts.clear();
    }

    #[cfg(test)]
    fn refcount(&self, table: &str, symbol: Option<&str>) -> usize {
        self.refcounts
            .get(&(table.to_string(), symbol.map(str::to_string)))
            .copied()
            .unwrap_or(0)
    }
}

fn pairs(table: &str, symbols: &[String]) -> Vec<(String, Option<String>)> {
    if symbols.is_empty() {
        vec![(table.to_string(), None)]
    } else {
        symbols
            .iter()
            .map(|s| (table.to_string(), Some(s.clone())))
            .collect()
    }
}
