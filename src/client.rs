//! Request/response correlation on top of a [`Connection`].
//!
//! [`DbClient`] runs the receive loop on its own task. Every inbound message
//! is forwarded, in order, to the bounded event stream returned by
//! [`DbClient::events`]; messages that answer an outstanding request are
//! additionally delivered to that request's waiter. When the event buffer is
//! full, further events are dropped with a warning and requests keep being
//! answered. Materialised views of table state are left to the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::connection::{ConnectOptions, Connection};
use crate::error::{Error, Result};
use crate::protocol::{
  CallReducerFlags, ClientMessage, ConnectionId, IdentityToken, InitialSubscription, OneOffTable, QueryId,
  ServerMessage, ServerMessageKind, SubscribeApplied, SubscribeMultiApplied, SubscriptionError, TransactionUpdate,
  UnsubscribeApplied, UnsubscribeMultiApplied, UpdateStatus,
};

/// How long request helpers wait for their response by default.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Events buffered for [`DbClient::events`] before new ones are dropped.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

const SUBSCRIBE_REPLIES: &[ServerMessageKind] = &[ServerMessageKind::SubscribeApplied, ServerMessageKind::SubscriptionError];
const SUBSCRIBE_MULTI_REPLIES: &[ServerMessageKind] =
  &[ServerMessageKind::SubscribeMultiApplied, ServerMessageKind::SubscriptionError];
const INITIAL_SUBSCRIPTION_REPLIES: &[ServerMessageKind] =
  &[ServerMessageKind::InitialSubscription, ServerMessageKind::SubscriptionError];
const UNSUBSCRIBE_REPLIES: &[ServerMessageKind] =
  &[ServerMessageKind::UnsubscribeApplied, ServerMessageKind::SubscriptionError];
const UNSUBSCRIBE_MULTI_REPLIES: &[ServerMessageKind] =
  &[ServerMessageKind::UnsubscribeMultiApplied, ServerMessageKind::SubscriptionError];
const REDUCER_REPLIES: &[ServerMessageKind] = &[ServerMessageKind::TransactionUpdate];
const QUERY_REPLIES: &[ServerMessageKind] = &[ServerMessageKind::OneOffQueryResponse];

/// Monotonic `u32` ids, starting at 1 and wrapping.
#[derive(Debug)]
pub struct IdGenerator {
  next: AtomicU32,
}

impl IdGenerator {
  pub fn new() -> Self {
    Self::starting_at(1)
  }

  pub fn starting_at(first: u32) -> Self {
    Self {
      next: AtomicU32::new(first),
    }
  }

  pub fn next_id(&self) -> u32 {
    self.next.fetch_add(1, Ordering::Relaxed)
  }
}

impl Default for IdGenerator {
  fn default() -> Self {
    Self::new()
  }
}

/// Key of an outstanding request.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SlotKey {
  Request(u32),
  /// One-off queries are answered by `message_id`.
  Query(Vec<u8>),
}

#[derive(Debug)]
struct Waiter {
  accepts: &'static [ServerMessageKind],
  tx: oneshot::Sender<ServerMessage>,
}

/// Outstanding requests awaiting their single response.
#[derive(Debug, Default)]
pub struct PendingRequests {
  slots: Mutex<HashMap<SlotKey, Waiter>>,
  closed: AtomicBool,
}

impl PendingRequests {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Register a waiter answered only by a message of one of the `accepts`
  /// kinds. Registering on a closed table yields a slot that resolves
  /// immediately with `ConnectionClosed`.
  pub fn register(self: &Arc<Self>, key: SlotKey, accepts: &'static [ServerMessageKind]) -> PendingSlot {
    let (tx, rx) = oneshot::channel();
    if !self.closed.load(Ordering::Acquire) {
      if let Ok(mut slots) = self.slots.lock() {
        slots.insert(key.clone(), Waiter { accepts, tx });
      }
    }
    PendingSlot {
      pending: Arc::clone(self),
      key,
      rx,
    }
  }

  pub fn len(&self) -> usize {
    self.slots.lock().map(|s| s.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn remove(&self, key: &SlotKey) {
    if let Ok(mut slots) = self.slots.lock() {
      slots.remove(key);
    }
  }

  /// Deliver `msg` to the waiter it answers, if any. Each slot fires at
  /// most once, and only for a message kind it accepts. A
  /// `TransactionUpdate` only answers a call when it was caused by
  /// `own_connection`.
  pub fn fulfill(&self, msg: &ServerMessage, own_connection: Option<ConnectionId>) -> bool {
    let key = match msg {
      ServerMessage::OneOffQueryResponse(resp) => SlotKey::Query(resp.message_id.clone()),
      ServerMessage::TransactionUpdate(tx) if Some(tx.caller_connection_id) != own_connection => {
        return false
      }
      other => match other.request_id() {
        Some(id) => SlotKey::Request(id),
        None => return false,
      },
    };

    let kind = msg.kind();
    let waiter = match self.slots.lock() {
      Ok(mut slots) => match slots.get(&key) {
        Some(w) if w.accepts.contains(&kind) => slots.remove(&key),
        _ => None,
      },
      Err(_) => None,
    };
    match waiter {
      Some(w) => w.tx.send(msg.clone()).is_ok(),
      None => false,
    }
  }

  /// Drop every waiter and refuse new ones.
  pub fn fail_all(&self) {
    self.closed.store(true, Ordering::Release);
    if let Ok(mut slots) = self.slots.lock() {
      slots.clear();
    }
  }
}

/// A registered waiter. Dropping it unregisters the slot.
#[derive(Debug)]
pub struct PendingSlot {
  pending: Arc<PendingRequests>,
  key: SlotKey,
  rx: oneshot::Receiver<ServerMessage>,
}

impl PendingSlot {
  pub fn key(&self) -> &SlotKey {
    &self.key
  }

  pub async fn wait(mut self, timeout: Duration) -> Result<ServerMessage> {
    match tokio::time::timeout(timeout, &mut self.rx).await {
      Ok(Ok(msg)) => Ok(msg),
      Ok(Err(_)) => Err(Error::ConnectionClosed("connection lost before response".into())),
      Err(_) => Err(Error::Timeout),
    }
  }
}

impl Drop for PendingSlot {
  fn drop(&mut self) {
    self.pending.remove(&self.key);
  }
}

/// A connection plus its receive loop and request bookkeeping.
pub struct DbClient {
  conn: Arc<Connection>,
  pending: Arc<PendingRequests>,
  request_ids: IdGenerator,
  query_ids: IdGenerator,
  identity: watch::Receiver<Option<IdentityToken>>,
  events: Mutex<Option<mpsc::Receiver<ServerMessage>>>,
  request_timeout: Duration,
  task: JoinHandle<()>,
}

impl DbClient {
  pub async fn connect(options: ConnectOptions) -> Result<Self> {
    let conn = Connection::connect(options).await?;
    Ok(Self::from_connection(conn))
  }

  /// Take over `conn` and start its receive loop.
  pub fn from_connection(conn: Connection) -> Self {
    Self::with_event_buffer(conn, DEFAULT_EVENT_BUFFER)
  }

  /// Like [`DbClient::from_connection`], buffering at most `capacity`
  /// undelivered events.
  pub fn with_event_buffer(conn: Connection, capacity: usize) -> Self {
    let conn = Arc::new(conn);
    let pending = PendingRequests::new();
    let (identity_tx, identity) = watch::channel(None);
    let (events_tx, events_rx) = mpsc::channel(capacity.max(1));

    let task = tokio::spawn(receive_loop(
      Arc::clone(&conn),
      Arc::clone(&pending),
      identity_tx,
      events_tx,
    ));

    Self {
      conn,
      pending,
      request_ids: IdGenerator::new(),
      query_ids: IdGenerator::new(),
      identity,
      events: Mutex::new(Some(events_rx)),
      request_timeout: DEFAULT_REQUEST_TIMEOUT,
      task,
    }
  }

  pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
    self.request_timeout = timeout;
    self
  }

  pub fn connection(&self) -> &Arc<Connection> {
    &self.conn
  }

  /// Ordered stream of inbound messages. Available once. Messages buffer
  /// until it is taken; once the buffer is full newer ones are dropped.
  pub fn events(&self) -> Option<mpsc::Receiver<ServerMessage>> {
    self.events.lock().ok().and_then(|mut e| e.take())
  }

  /// The identity assigned by the server, once `IdentityToken` has arrived.
  pub fn identity(&self) -> Option<IdentityToken> {
    self.identity.borrow().clone()
  }

  pub async fn wait_for_identity(&self) -> Result<IdentityToken> {
    let mut rx = self.identity.clone();
    let token = tokio::time::timeout(self.request_timeout, rx.wait_for(Option::is_some))
      .await
      .map_err(|_| Error::Timeout)?
      .map_err(|_| Error::ConnectionClosed("connection lost before identity".into()))?
      .clone();
    token.ok_or(Error::ChannelClosed)
  }

  /// Call a reducer without waiting for its outcome. Returns the request id.
  pub async fn call_reducer(&self, reducer: &str, args: &str) -> Result<u32> {
    let request_id = self.request_ids.next_id();
    self
      .conn
      .send_call_reducer(reducer, args, request_id, CallReducerFlags::FullUpdate)
      .await?;
    Ok(request_id)
  }

  /// Call a reducer and wait for the transaction it caused.
  pub async fn call_reducer_and_wait(&self, reducer: &str, args: &str) -> Result<TransactionUpdate> {
    let request_id = self.request_ids.next_id();
    let msg = ClientMessage::call_reducer(reducer, args, request_id);
    let tx = match self.request(SlotKey::Request(request_id), REDUCER_REPLIES, &msg).await? {
      ServerMessage::TransactionUpdate(tx) => tx,
      other => return Err(unexpected("TransactionUpdate", &other)),
    };
    match &tx.status {
      UpdateStatus::Committed(_) => Ok(tx),
      UpdateStatus::Failed(message) => Err(Error::ReducerFailed {
        reducer: tx.reducer_call.reducer_name.clone(),
        message: message.clone(),
      }),
      UpdateStatus::OutOfEnergy(_) => Err(Error::OutOfEnergy(tx.reducer_call.reducer_name.clone())),
    }
  }

  /// Legacy whole-set subscription; replaces any previous set.
  pub async fn subscribe(&self, query_strings: Vec<String>) -> Result<InitialSubscription> {
    let request_id = self.request_ids.next_id();
    let msg = ClientMessage::subscribe(query_strings, request_id);
    match self.request(SlotKey::Request(request_id), INITIAL_SUBSCRIPTION_REPLIES, &msg).await? {
      ServerMessage::InitialSubscription(applied) => Ok(applied),
      ServerMessage::SubscriptionError(err) => Err(subscription_error(err)),
      other => Err(unexpected("InitialSubscription", &other)),
    }
  }

  pub async fn subscribe_single(&self, query: &str) -> Result<SubscribeApplied> {
    let request_id = self.request_ids.next_id();
    let query_id = QueryId::new(self.query_ids.next_id());
    let msg = ClientMessage::subscribe_single(query, request_id, query_id);
    match self.request(SlotKey::Request(request_id), SUBSCRIBE_REPLIES, &msg).await? {
      ServerMessage::SubscribeApplied(applied) => Ok(applied),
      ServerMessage::SubscriptionError(err) => Err(subscription_error(err)),
      other => Err(unexpected("SubscribeApplied", &other)),
    }
  }

  pub async fn subscribe_multi(&self, query_strings: Vec<String>) -> Result<SubscribeMultiApplied> {
    let request_id = self.request_ids.next_id();
    let query_id = QueryId::new(self.query_ids.next_id());
    let msg = ClientMessage::subscribe_multi(query_strings, request_id, query_id);
    match self.request(SlotKey::Request(request_id), SUBSCRIBE_MULTI_REPLIES, &msg).await? {
      ServerMessage::SubscribeMultiApplied(applied) => Ok(applied),
      ServerMessage::SubscriptionError(err) => Err(subscription_error(err)),
      other => Err(unexpected("SubscribeMultiApplied", &other)),
    }
  }

  pub async fn unsubscribe(&self, query_id: QueryId) -> Result<UnsubscribeApplied> {
    let request_id = self.request_ids.next_id();
    let msg = ClientMessage::unsubscribe(request_id, query_id);
    match self.request(SlotKey::Request(request_id), UNSUBSCRIBE_REPLIES, &msg).await? {
      ServerMessage::UnsubscribeApplied(applied) => Ok(applied),
      ServerMessage::SubscriptionError(err) => Err(subscription_error(err)),
      other => Err(unexpected("UnsubscribeApplied", &other)),
    }
  }

  pub async fn unsubscribe_multi(&self, query_id: QueryId) -> Result<UnsubscribeMultiApplied> {
    let request_id = self.request_ids.next_id();
    let msg = ClientMessage::unsubscribe_multi(request_id, query_id);
    match self.request(SlotKey::Request(request_id), UNSUBSCRIBE_MULTI_REPLIES, &msg).await? {
      ServerMessage::UnsubscribeMultiApplied(applied) => Ok(applied),
      ServerMessage::SubscriptionError(err) => Err(subscription_error(err)),
      other => Err(unexpected("UnsubscribeMultiApplied", &other)),
    }
  }

  /// Run a query once, outside any subscription.
  pub async fn one_off_query(&self, query: &str) -> Result<Vec<OneOffTable>> {
    let message_id = uuid::Uuid::new_v4().as_bytes().to_vec();
    let msg = ClientMessage::one_off_query(message_id.clone(), query);
    let resp = match self.request(SlotKey::Query(message_id), QUERY_REPLIES, &msg).await? {
      ServerMessage::OneOffQueryResponse(resp) => resp,
      other => return Err(unexpected("OneOffQueryResponse", &other)),
    };
    match resp.error {
      Some(message) => Err(Error::Query(message)),
      None => Ok(resp.tables),
    }
  }

  pub async fn close(&self) -> Result<()> {
    self.conn.close().await
  }

  pub async fn abort(&self) -> Result<()> {
    self.conn.abort().await
  }

  async fn request(
    &self,
    key: SlotKey,
    accepts: &'static [ServerMessageKind],
    msg: &ClientMessage,
  ) -> Result<ServerMessage> {
    let slot = self.pending.register(key, accepts);
    self.conn.send(msg).await?;
    slot.wait(self.request_timeout).await
  }
}

impl Drop for DbClient {
  fn drop(&mut self) {
    self.conn.cancellation_token().cancel();
    self.task.abort();
  }
}

async fn receive_loop(
  conn: Arc<Connection>,
  pending: Arc<PendingRequests>,
  identity: watch::Sender<Option<IdentityToken>>,
  events: mpsc::Sender<ServerMessage>,
) {
  let mut dropped: u64 = 0;
  loop {
    match conn.receive().await {
      Ok(msg) => {
        if let ServerMessage::IdentityToken(token) = &msg {
          tracing::info!(identity = %token.identity.identity, "identity received");
          identity.send_replace(Some(token.clone()));
        }
        let own = identity.borrow().as_ref().map(|t| t.connection_id);
        let delivered = pending.fulfill(&msg, own);
        tracing::debug!(
          kind = msg.kind().name(),
          request_id = ?msg.request_id(),
          delivered,
          "received"
        );
        match events.try_send(msg) {
          Ok(()) if dropped > 0 => {
            tracing::info!(dropped, "event buffer drained");
            dropped = 0;
          }
          Ok(()) => {}
          Err(mpsc::error::TrySendError::Full(msg)) => {
            if dropped == 0 {
              tracing::warn!(kind = msg.kind().name(), "event buffer full, dropping events");
            }
            dropped += 1;
          }
          // A dropped receiver only means nobody is listening for events.
          Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
      }
      Err(e) if e.is_terminal() => {
        tracing::info!(error = %e, "receive loop stopped");
        break;
      }
      Err(e) => {
        tracing::warn!(error = %e, "skipping inbound message");
      }
    }
  }
  pending.fail_all();
}

fn subscription_error(err: SubscriptionError) -> Error {
  Error::Subscription {
    request_id: err.request_id,
    query_id: err.query_id,
    table_id: err.table_id,
    message: err.error,
  }
}

fn unexpected(expected: &str, got: &ServerMessage) -> Error {
  Error::Server(format!("expected {expected}, got {}", got.kind().name()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::protocol::{
    DatabaseUpdate, Identity, OneOffQueryResponse, ReducerCallInfo, SubscribeRows, TableUpdate, TimeDuration,
    Timestamp, TransactionUpdateLight,
  };

  fn applied(request_id: u32) -> ServerMessage {
    ServerMessage::SubscribeApplied(SubscribeApplied {
      request_id,
      total_host_execution_duration_micros: 10,
      query_id: QueryId::new(1),
      rows: SubscribeRows {
        table_id: 4096,
        table_name: "user".into(),
        table_rows: TableUpdate::default(),
      },
    })
  }

  fn transaction(caller: u128, request_id: u32) -> ServerMessage {
    ServerMessage::TransactionUpdate(TransactionUpdate {
      status: UpdateStatus::Committed(DatabaseUpdate::default()),
      timestamp: Timestamp::default(),
      caller_identity: Identity::new("c200"),
      caller_connection_id: ConnectionId { connection_id: caller },
      reducer_call: ReducerCallInfo {
        reducer_name: "send_message".into(),
        reducer_id: 3,
        args: serde_json::Value::Null,
        request_id,
      },
      energy_quanta_used: Default::default(),
      total_host_execution_duration: TimeDuration::default(),
    })
  }

  #[test]
  fn ids_are_monotonic() {
    let ids = IdGenerator::new();
    assert_eq!(ids.next_id(), 1);
    assert_eq!(ids.next_id(), 2);
    let wrap = IdGenerator::starting_at(u32::MAX);
    assert_eq!(wrap.next_id(), u32::MAX);
    assert_eq!(wrap.next_id(), 0);
  }

  #[tokio::test]
  async fn slot_is_fulfilled_once() {
    let pending = PendingRequests::new();
    let slot = pending.register(SlotKey::Request(7), SUBSCRIBE_REPLIES);
    assert_eq!(pending.len(), 1);

    assert!(pending.fulfill(&applied(7), None));
    assert!(!pending.fulfill(&applied(7), None));
    assert!(pending.is_empty());

    let msg = slot.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(msg.request_id(), Some(7));
  }

  #[tokio::test]
  async fn unmatched_messages_are_not_delivered() {
    let pending = PendingRequests::new();
    let _slot = pending.register(SlotKey::Request(1), SUBSCRIBE_REPLIES);
    assert!(!pending.fulfill(&applied(2), None));
    assert_eq!(pending.len(), 1);
  }

  #[tokio::test]
  async fn transactions_match_only_own_connection() {
    let pending = PendingRequests::new();
    let slot = pending.register(SlotKey::Request(5), REDUCER_REPLIES);

    assert!(!pending.fulfill(&transaction(99, 5), Some(ConnectionId { connection_id: 1 })));
    assert!(pending.fulfill(&transaction(1, 5), Some(ConnectionId { connection_id: 1 })));
    assert!(slot.wait(Duration::from_secs(1)).await.is_ok());
  }

  #[tokio::test]
  async fn slot_ignores_kinds_it_does_not_accept() {
    let pending = PendingRequests::new();
    let own = Some(ConnectionId { connection_id: 1 });
    let slot = pending.register(SlotKey::Request(1), SUBSCRIBE_REPLIES);

    let light = ServerMessage::TransactionUpdateLight(TransactionUpdateLight {
      request_id: 1,
      update: DatabaseUpdate::default(),
    });
    assert!(!pending.fulfill(&light, own));
    assert!(!pending.fulfill(&transaction(1, 1), own));
    assert_eq!(pending.len(), 1);

    assert!(pending.fulfill(&applied(1), own));
    let msg = slot.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(msg.kind(), ServerMessageKind::SubscribeApplied);
  }

  #[tokio::test]
  async fn one_off_queries_match_by_message_id() {
    let pending = PendingRequests::new();
    let slot = pending.register(SlotKey::Query(vec![0xab, 0xcd]), QUERY_REPLIES);
    let resp = ServerMessage::OneOffQueryResponse(OneOffQueryResponse {
      message_id: vec![0xab, 0xcd],
      error: None,
      tables: Vec::new(),
      total_host_execution_duration: TimeDuration::default(),
    });
    assert!(pending.fulfill(&resp, None));
    assert!(slot.wait(Duration::from_secs(1)).await.is_ok());
  }

  #[tokio::test]
  async fn dropped_slot_is_removed() {
    let pending = PendingRequests::new();
    let slot = pending.register(SlotKey::Request(3), SUBSCRIBE_REPLIES);
    drop(slot);
    assert!(pending.is_empty());
  }

  #[tokio::test]
  async fn fail_all_wakes_waiters() {
    let pending = PendingRequests::new();
    let slot = pending.register(SlotKey::Request(1), SUBSCRIBE_REPLIES);
    pending.fail_all();
    assert!(matches!(
      slot.wait(Duration::from_secs(1)).await,
      Err(Error::ConnectionClosed(_))
    ));

    let late = pending.register(SlotKey::Request(2), SUBSCRIBE_REPLIES);
    assert!(matches!(
      late.wait(Duration::from_secs(1)).await,
      Err(Error::ConnectionClosed(_))
    ));
  }

  #[tokio::test]
  async fn wait_times_out() {
    let pending = PendingRequests::new();
    let slot = pending.register(SlotKey::Request(1), SUBSCRIBE_REPLIES);
    assert!(matches!(
      slot.wait(Duration::from_millis(10)).await,
      Err(Error::Timeout)
    ));
    assert!(pending.is_empty());
  }
}
