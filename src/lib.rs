//! Streaming replication client for the BitMEX realtime websocket API.
//!
//! Maintains a locally replicated mirror of the exchange's table state
//! (instruments, orders, trades, order books) from the feed's
//! partial/insert/update/delete diff messages, and fans the resulting
//! change records out to any number of in-process listeners over one
//! physical connection.
//!
//! # Architecture
//!
//! ```text
//! outbound commands ──────────────────────────▶ websocket ──▶ BitMEX
//!   (subscribe / unsubscribe / cancelAllAfter)
//!
//! BitMEX ──▶ websocket ──▶ parser ──▶ storage ──▶ router ──▶ listeners
//!            (transport)   (classify) (replicate) (fan out)
//! ```
//!
//! One fan-out task owns all mutable state; listeners communicate with it
//! through queues, so there are no locks anywhere in the pipeline.
//!
//! # Example
//!
//! ```no_run
//! use bitmex_stream::{SessionConfig, connect};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let client = connect("testnet", SessionConfig::default()).await?;
//! let mut trades = client.listen("trade", &["XBTUSD"]).await?;
//! while let Some(result) = trades.next().await {
//!     let change = result?;
//!     println!("{}: {}", change.table, change.data);
//! }
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod config;
pub mod deadman;
pub mod error;
pub mod message;
pub mod parser;
pub mod router;
pub mod session;
pub mod storage;
pub mod transport;

pub use config::{Network, SessionConfig};
pub use error::{SessionError, StorageError, StreamError};
pub use message::{Action, ChangeRecord, Command, Record, ScalarKey, TableKey, TableMessage};
pub use router::{Delivery, LISTENER_QUEUE, ListenerId};
pub use session::{BitmexClient, TableListener, connect};
pub use storage::{MAX_TABLE_LEN, Storage};
pub use transport::{InboundReceiver, OutboundSender, TransportError, TransportEvent};
