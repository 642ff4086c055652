//! Wire protocol types and serialization for the SpacetimeDB subscription
//! protocol.
//!
//! Both directions use the same envelope: a JSON object with exactly one key
//! naming the variant, whose value is the variant payload.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::json::SingleKey;
use crate::value::{ProductValue, ValueError};

/// Sub-protocol identifier for the JSON encoding, version 1.
pub const SATS_JSON_PROTOCOL: &str = "v1.json.spacetimedb";

/// Reserved identifier for the binary encoding. Not implemented.
pub const BSATN_PROTOCOL: &str = "v1.bsatn.spacetimedb";

/// Maximum inbound frame size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Wire encodings negotiated as a WebSocket sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Protocol {
  #[default]
  Json,
  Bsatn,
}

impl Protocol {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Json => SATS_JSON_PROTOCOL,
      Self::Bsatn => BSATN_PROTOCOL,
    }
  }

  pub fn is_supported(&self) -> bool {
    matches!(self, Self::Json)
  }
}

impl TryFrom<&str> for Protocol {
  type Error = ();
  fn try_from(v: &str) -> std::result::Result<Self, Self::Error> {
    match v {
      SATS_JSON_PROTOCOL => Ok(Self::Json),
      BSATN_PROTOCOL => Ok(Self::Bsatn),
      _ => Err(()),
    }
  }
}

/// Reducer call flags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallReducerFlags {
  /// The caller receives a full `TransactionUpdate`.
  #[default]
  FullUpdate = 0x00,
  /// The caller is not notified when the call succeeds.
  NoSuccessNotify = 0x01,
}

impl TryFrom<u8> for CallReducerFlags {
  type Error = ();
  fn try_from(v: u8) -> std::result::Result<Self, Self::Error> {
    match v {
      0x00 => Ok(Self::FullUpdate),
      0x01 => Ok(Self::NoSuccessNotify),
      _ => Err(()),
    }
  }
}

/// Caller-chosen handle for a subscription's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueryId {
  pub id: u32,
}

impl QueryId {
  pub fn new(id: u32) -> Self {
    Self { id }
  }
}

// ── Client → server ──────────────────────────────────────────────────

/// Client-to-server messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientMessage {
  CallReducer(CallReducer),
  Subscribe(Subscribe),
  OneOffQuery(OneOffQuery),
  SubscribeSingle(SubscribeSingle),
  SubscribeMulti(SubscribeMulti),
  Unsubscribe(Unsubscribe),
  UnsubscribeMulti(UnsubscribeMulti),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReducer {
  pub reducer: String,
  /// JSON array literal of the arguments, in parameter order.
  pub args: String,
  pub request_id: u32,
  pub flags: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscribe {
  pub query_strings: Vec<String>,
  pub request_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneOffQuery {
  #[serde(with = "crate::json::hex_bytes")]
  pub message_id: Vec<u8>,
  pub query_string: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeSingle {
  pub query: String,
  pub request_id: u32,
  pub query_id: QueryId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeMulti {
  pub query_strings: Vec<String>,
  pub request_id: u32,
  pub query_id: QueryId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unsubscribe {
  pub request_id: u32,
  pub query_id: QueryId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeMulti {
  pub request_id: u32,
  pub query_id: QueryId,
}

impl ClientMessage {
  pub fn call_reducer(reducer: impl Into<String>, args: impl Into<String>, request_id: u32) -> Self {
    Self::call_reducer_with_flags(reducer, args, request_id, CallReducerFlags::FullUpdate)
  }

  pub fn call_reducer_with_flags(
    reducer: impl Into<String>,
    args: impl Into<String>,
    request_id: u32,
    flags: CallReducerFlags,
  ) -> Self {
    Self::CallReducer(CallReducer {
      reducer: reducer.into(),
      args: args.into(),
      request_id,
      flags: flags as u8,
    })
  }

  pub fn subscribe(query_strings: Vec<String>, request_id: u32) -> Self {
    Self::Subscribe(Subscribe {
      query_strings,
      request_id,
    })
  }

  /// Subscribe to every row of every public table.
  pub fn subscribe_all(request_id: u32) -> Self {
    Self::subscribe(vec!["SELECT * FROM *".to_string()], request_id)
  }

  pub fn one_off_query(message_id: Vec<u8>, query_string: impl Into<String>) -> Self {
    Self::OneOffQuery(OneOffQuery {
      message_id,
      query_string: query_string.into(),
    })
  }

  pub fn subscribe_single(query: impl Into<String>, request_id: u32, query_id: QueryId) -> Self {
    Self::SubscribeSingle(SubscribeSingle {
      query: query.into(),
      request_id,
      query_id,
    })
  }

  pub fn subscribe_multi(query_strings: Vec<String>, request_id: u32, query_id: QueryId) -> Self {
    Self::SubscribeMulti(SubscribeMulti {
      query_strings,
      request_id,
      query_id,
    })
  }

  pub fn unsubscribe(request_id: u32, query_id: QueryId) -> Self {
    Self::Unsubscribe(Unsubscribe {
      request_id,
      query_id,
    })
  }

  pub fn unsubscribe_multi(request_id: u32, query_id: QueryId) -> Self {
    Self::UnsubscribeMulti(UnsubscribeMulti {
      request_id,
      query_id,
    })
  }

  pub fn name(&self) -> &'static str {
    match self {
      Self::CallReducer(_) => "CallReducer",
      Self::Subscribe(_) => "Subscribe",
      Self::OneOffQuery(_) => "OneOffQuery",
      Self::SubscribeSingle(_) => "SubscribeSingle",
      Self::SubscribeMulti(_) => "SubscribeMulti",
      Self::Unsubscribe(_) => "Unsubscribe",
      Self::UnsubscribeMulti(_) => "UnsubscribeMulti",
    }
  }

  /// The correlation id the server will echo back, if any.
  pub fn request_id(&self) -> Option<u32> {
    match self {
      Self::CallReducer(m) => Some(m.request_id),
      Self::Subscribe(m) => Some(m.request_id),
      Self::OneOffQuery(_) => None,
      Self::SubscribeSingle(m) => Some(m.request_id),
      Self::SubscribeMulti(m) => Some(m.request_id),
      Self::Unsubscribe(m) => Some(m.request_id),
      Self::UnsubscribeMulti(m) => Some(m.request_id),
    }
  }

  pub fn to_json(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }
}

// ── Server → client ──────────────────────────────────────────────────

macro_rules! server_messages {
  ($( $variant:ident => $as_fn:ident, $into_fn:ident; )+) => {
    /// Server-to-client messages
    #[derive(Debug, Clone, PartialEq, Serialize)]
    pub enum ServerMessage {
      $( $variant($variant), )+
    }

    /// Discriminant of a [`ServerMessage`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ServerMessageKind {
      $( $variant, )+
    }

    impl ServerMessageKind {
      pub const ALL: &'static [ServerMessageKind] = &[$( Self::$variant, )+];

      pub fn name(&self) -> &'static str {
        match self {
          $( Self::$variant => stringify!($variant), )+
        }
      }

      pub fn from_name(name: &str) -> Option<Self> {
        match name {
          $( stringify!($variant) => Some(Self::$variant), )+
          _ => None,
        }
      }
    }

    impl ServerMessage {
      pub fn kind(&self) -> ServerMessageKind {
        match self {
          $( Self::$variant(_) => ServerMessageKind::$variant, )+
        }
      }

      $(
        pub fn $as_fn(&self) -> Option<&$variant> {
          match self {
            Self::$variant(m) => Some(m),
            _ => None,
          }
        }

        pub fn $into_fn(self) -> Option<$variant> {
          match self {
            Self::$variant(m) => Some(m),
            _ => None,
          }
        }
      )+

      fn decode_payload(kind: ServerMessageKind, payload: &RawValue) -> Result<Self> {
        match kind {
          $(
            ServerMessageKind::$variant => serde_json::from_str::<$variant>(payload.get())
              .map(Self::$variant)
              .map_err(|e| Error::decode(stringify!($variant), e)),
          )+
        }
      }
    }
  };
}

server_messages! {
  InitialSubscription => as_initial_subscription, into_initial_subscription;
  TransactionUpdate => as_transaction_update, into_transaction_update;
  TransactionUpdateLight => as_transaction_update_light, into_transaction_update_light;
  IdentityToken => as_identity_token, into_identity_token;
  OneOffQueryResponse => as_one_off_query_response, into_one_off_query_response;
  SubscribeApplied => as_subscribe_applied, into_subscribe_applied;
  UnsubscribeApplied => as_unsubscribe_applied, into_unsubscribe_applied;
  SubscriptionError => as_subscription_error, into_subscription_error;
  SubscribeMultiApplied => as_subscribe_multi_applied, into_subscribe_multi_applied;
  UnsubscribeMultiApplied => as_unsubscribe_multi_applied, into_unsubscribe_multi_applied;
}

impl ServerMessage {
  /// Classify and decode one inbound frame.
  ///
  /// The envelope must have exactly one key and that key must name a known
  /// variant; the protocol is closed, so unknown keys are errors.
  pub fn parse(text: &str) -> Result<Self> {
    let SingleKey { key, value } =
      serde_json::from_str::<SingleKey>(text).map_err(|e| Error::decode("server message envelope", e))?;
    let kind = ServerMessageKind::from_name(&key).ok_or(Error::UnknownMessageVariant(key))?;
    Self::decode_payload(kind, value)
  }

  pub fn to_json(&self) -> Result<String> {
    Ok(serde_json::to_string(self)?)
  }

  /// The request id echoed by the server, when this variant carries one.
  pub fn request_id(&self) -> Option<u32> {
    match self {
      Self::InitialSubscription(m) => Some(m.request_id),
      Self::TransactionUpdate(m) => Some(m.reducer_call.request_id),
      Self::TransactionUpdateLight(m) => Some(m.request_id),
      Self::IdentityToken(_) | Self::OneOffQueryResponse(_) => None,
      Self::SubscribeApplied(m) => Some(m.request_id),
      Self::UnsubscribeApplied(m) => Some(m.request_id),
      Self::SubscriptionError(m) => m.request_id,
      Self::SubscribeMultiApplied(m) => Some(m.request_id),
      Self::UnsubscribeMultiApplied(m) => Some(m.request_id),
    }
  }

  /// The subscription this message belongs to, when known.
  pub fn query_id(&self) -> Option<QueryId> {
    match self {
      Self::SubscribeApplied(m) => Some(m.query_id),
      Self::UnsubscribeApplied(m) => Some(m.query_id),
      Self::SubscribeMultiApplied(m) => Some(m.query_id),
      Self::UnsubscribeMultiApplied(m) => Some(m.query_id),
      Self::SubscriptionError(m) => m.query_id.map(QueryId::new),
      _ => None,
    }
  }
}

impl std::str::FromStr for ServerMessage {
  type Err = Error;
  fn from_str(s: &str) -> Result<Self> {
    Self::parse(s)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitialSubscription {
  pub database_update: DatabaseUpdate,
  pub request_id: u32,
  #[serde(default)]
  pub total_host_execution_duration: TimeDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
  pub status: UpdateStatus,
  pub timestamp: Timestamp,
  pub caller_identity: Identity,
  pub caller_connection_id: ConnectionId,
  pub reducer_call: ReducerCallInfo,
  #[serde(default)]
  pub energy_quanta_used: EnergyQuanta,
  #[serde(default)]
  pub total_host_execution_duration: TimeDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdateLight {
  pub request_id: u32,
  pub update: DatabaseUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityToken {
  pub identity: Identity,
  pub token: String,
  pub connection_id: ConnectionId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneOffQueryResponse {
  #[serde(with = "crate::json::hex_bytes")]
  pub message_id: Vec<u8>,
  #[serde(default, deserialize_with = "crate::json::lenient_option::deserialize")]
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
  #[serde(default)]
  pub tables: Vec<OneOffTable>,
  #[serde(default)]
  pub total_host_execution_duration: TimeDuration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeApplied {
  pub request_id: u32,
  #[serde(default)]
  pub total_host_execution_duration_micros: u64,
  pub query_id: QueryId,
  pub rows: SubscribeRows,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeApplied {
  pub request_id: u32,
  #[serde(default)]
  pub total_host_execution_duration_micros: u64,
  pub query_id: QueryId,
  pub rows: SubscribeRows,
}

/// Rejection of one subscribe/unsubscribe, or of a whole subscription set
/// when `request_id` and `query_id` are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionError {
  #[serde(default)]
  pub total_host_execution_duration_micros: u64,
  #[serde(default, deserialize_with = "crate::json::lenient_option::deserialize")]
  #[serde(skip_serializing_if = "Option::is_none")]
  pub request_id: Option<u32>,
  #[serde(default, deserialize_with = "crate::json::lenient_option::deserialize")]
  #[serde(skip_serializing_if = "Option::is_none")]
  pub query_id: Option<u32>,
  #[serde(default, deserialize_with = "crate::json::lenient_option::deserialize")]
  #[serde(skip_serializing_if = "Option::is_none")]
  pub table_id: Option<u32>,
  pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeMultiApplied {
  pub request_id: u32,
  #[serde(default)]
  pub total_host_execution_duration_micros: u64,
  pub query_id: QueryId,
  pub update: DatabaseUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeMultiApplied {
  pub request_id: u32,
  #[serde(default)]
  pub total_host_execution_duration_micros: u64,
  pub query_id: QueryId,
  pub update: DatabaseUpdate,
}

// ── Row deltas ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DatabaseUpdate {
  #[serde(default)]
  pub tables: Vec<TableUpdate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableUpdate {
  #[serde(default)]
  pub table_id: u32,
  pub table_name: String,
  #[serde(default)]
  pub num_rows: u64,
  #[serde(default)]
  pub updates: Vec<TableUpdateEntry>,
}

/// Row-encoded strings: each is a JSON array in the table's column order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableUpdateEntry {
  #[serde(default, deserialize_with = "row_list")]
  pub inserts: Vec<String>,
  #[serde(default, deserialize_with = "row_list")]
  pub deletes: Vec<String>,
}

/// Rows arrive as JSON-in-a-string; inline JSON rows are re-encoded so
/// callers always see the string form.
fn row_list<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<String>, D::Error> {
  let rows = Vec::<serde_json::Value>::deserialize(deserializer)?;
  Ok(
    rows
      .into_iter()
      .map(|row| match row {
        serde_json::Value::String(s) => s,
        other => other.to_string(),
      })
      .collect(),
  )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeRows {
  pub table_id: u32,
  pub table_name: String,
  pub table_rows: TableUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OneOffTable {
  pub table_name: String,
  #[serde(default, deserialize_with = "row_list")]
  pub rows: Vec<String>,
}

impl DatabaseUpdate {
  pub fn table(&self, name: &str) -> Option<&TableUpdate> {
    self.tables.iter().find(|t| t.table_name == name)
  }

  pub fn is_empty(&self) -> bool {
    self.tables.iter().all(TableUpdate::is_empty)
  }
}

impl TableUpdate {
  pub fn inserts(&self) -> impl Iterator<Item = &str> {
    self.updates.iter().flat_map(|u| u.inserts.iter().map(String::as_str))
  }

  pub fn deletes(&self) -> impl Iterator<Item = &str> {
    self.updates.iter().flat_map(|u| u.deletes.iter().map(String::as_str))
  }

  pub fn is_empty(&self) -> bool {
    self.updates.iter().all(|u| u.inserts.is_empty() && u.deletes.is_empty())
  }

  /// Untyped decode of every inserted row.
  pub fn decode_inserts(&self) -> std::result::Result<Vec<ProductValue>, ValueError> {
    self.inserts().map(ProductValue::from_row).collect()
  }

  pub fn decode_deletes(&self) -> std::result::Result<Vec<ProductValue>, ValueError> {
    self.deletes().map(ProductValue::from_row).collect()
  }
}

// ── Transactions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerCallInfo {
  pub reducer_name: String,
  #[serde(default)]
  pub reducer_id: u32,
  #[serde(default)]
  pub args: serde_json::Value,
  pub request_id: u32,
}

/// Outcome of a transaction. Only `Committed` carries row deltas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateStatus {
  Committed(DatabaseUpdate),
  Failed(String),
  OutOfEnergy(serde_json::Value),
}

impl TransactionUpdate {
  pub fn reducer_name(&self) -> &str {
    &self.reducer_call.reducer_name
  }

  pub fn request_id(&self) -> u32 {
    self.reducer_call.request_id
  }

  pub fn is_committed(&self) -> bool {
    matches!(self.status, UpdateStatus::Committed(_))
  }

  /// Row deltas to apply; `None` unless the transaction committed.
  pub fn committed_update(&self) -> Option<&DatabaseUpdate> {
    match &self.status {
      UpdateStatus::Committed(update) => Some(update),
      _ => None,
    }
  }

  pub fn failure(&self) -> Option<&str> {
    match &self.status {
      UpdateStatus::Failed(msg) => Some(msg),
      _ => None,
    }
  }
}

// ── Primitive wrappers ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Identity {
  #[serde(rename = "__identity__")]
  pub identity: String,
}

impl Identity {
  pub fn new(hex: impl Into<String>) -> Self {
    Self { identity: hex.into() }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConnectionId {
  #[serde(rename = "__connection_id__")]
  pub connection_id: u128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Timestamp {
  #[serde(rename = "__timestamp_micros_since_unix_epoch__")]
  pub micros_since_unix_epoch: i64,
}

impl Timestamp {
  pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(self.micros_since_unix_epoch)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct TimeDuration {
  #[serde(rename = "__time_duration_micros__")]
  pub micros: i64,
}

impl TimeDuration {
  /// Negative durations clamp to zero.
  pub fn to_duration(&self) -> Duration {
    Duration::from_micros(self.micros.max(0) as u64)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EnergyQuanta {
  pub quanta: u128,
}
