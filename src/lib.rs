//! SpacetimeDB Rust Client SDK
//!
//! A client for SpacetimeDB's JSON subscription protocol: the SATS type and
//! value model, module schemas, the protocol messages, and a WebSocket
//! connection with optional request correlation.
//!
//! # Example
//!
//! ```no_run
//! use spacetimedb_client::{ConnectOptions, DbClient};
//!
//! #[tokio::main]
//! async fn main() -> spacetimedb_client::Result<()> {
//!     // Connect to a database
//!     let client = DbClient::connect(ConnectOptions::new("http://localhost:3000", "quickstart-chat")).await?;
//!     let mut events = client.events().expect("events are taken once");
//!
//!     // Subscribe to a table
//!     let applied = client.subscribe_single("SELECT * FROM message").await?;
//!     for row in applied.rows.table_rows.inserts() {
//!         println!("Row: {}", row);
//!     }
//!
//!     // Call a reducer and wait for its transaction
//!     client.call_reducer_and_wait("send_message", r#"["hello"]"#).await?;
//!
//!     // Watch everything else
//!     while let Some(msg) = events.recv().await {
//!         println!("Event: {:?}", msg.kind());
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod connection;
mod error;
mod json;
pub mod protocol;
pub mod schema;
pub mod types;
pub mod typespace;
pub mod value;

pub use client::{DbClient, IdGenerator, PendingRequests};
pub use connection::{ConnectOptions, Connection, ConnectionState};
pub use error::{Error, Result};
pub use protocol::{
  CallReducerFlags, ClientMessage, ConnectionId, DatabaseUpdate, Identity, Protocol, QueryId, ServerMessage,
  ServerMessageKind, TableUpdate, Timestamp, TransactionUpdate, UpdateStatus, BSATN_PROTOCOL, MAX_MESSAGE_SIZE,
  SATS_JSON_PROTOCOL,
};
pub use schema::{fetch_schema, RawModuleDef, ReducerDef, TableDef};
pub use types::{AlgebraicType, AlgebraicTypeRef, BuiltinType, ProductType, ProductTypeElement, SumType, SumTypeVariant};
pub use typespace::Typespace;
pub use value::{AlgebraicValue, BuiltinValue, ProductValue, SumValue, ValueError};
