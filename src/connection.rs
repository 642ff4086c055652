//! One WebSocket session with a database.
//!
//! A [`Connection`] owns the transport and nothing else: it serializes
//! outbound writes, hands out inbound messages one at a time to a single
//! reader, and implements the connect and close handshakes. Correlating
//! responses with requests is layered on top in [`crate::client`].

use std::fmt;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::protocol::{CallReducerFlags, ClientMessage, Protocol, QueryId, ServerMessage, MAX_MESSAGE_SIZE};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Default wait for the peer's close acknowledgement.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Default bound on the opening handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// Base URL used by [`ConnectOptions::from_env`] when `SPACETIMEDB_URI` is unset.
pub const DEFAULT_URI: &str = "http://localhost:3000";

/// Connection options
#[derive(Debug, Clone)]
pub struct ConnectOptions {
  /// Server base URL; `http`, `https`, `ws` and `wss` are accepted.
  pub base_url: String,
  /// Database name or identity.
  pub database: String,
  pub protocol: Protocol,
  pub auth_token: Option<String>,
  /// Refuse to connect without `auth_token`.
  pub require_auth: bool,
  pub close_grace: Duration,
  pub handshake_timeout: Duration,
  /// Text frames above this size are rejected without being parsed.
  pub max_frame_size: usize,
  pub parent_token: Option<CancellationToken>,
}

impl ConnectOptions {
  pub fn new(base_url: impl Into<String>, database: impl Into<String>) -> Self {
    Self {
      base_url: base_url.into(),
      database: database.into(),
      protocol: Protocol::Json,
      auth_token: None,
      require_auth: false,
      close_grace: DEFAULT_CLOSE_GRACE,
      handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
      max_frame_size: MAX_MESSAGE_SIZE,
      parent_token: None,
    }
  }

  /// Read `SPACETIMEDB_URI` and `SPACETIMEDB_TOKEN` from the environment.
  pub fn from_env(database: impl Into<String>) -> Self {
    let base_url = std::env::var("SPACETIMEDB_URI")
      .ok()
      .filter(|s| !s.is_empty())
      .unwrap_or_else(|| DEFAULT_URI.to_string());
    let mut opts = Self::new(base_url, database);
    opts.auth_token = std::env::var("SPACETIMEDB_TOKEN").ok().filter(|s| !s.is_empty());
    opts
  }

  pub fn with_auth(mut self, token: impl Into<String>) -> Self {
    self.auth_token = Some(token.into());
    self
  }

  pub fn require_auth(mut self) -> Self {
    self.require_auth = true;
    self
  }

  pub fn with_protocol(mut self, protocol: Protocol) -> Self {
    self.protocol = protocol;
    self
  }

  pub fn with_close_grace(mut self, grace: Duration) -> Self {
    self.close_grace = grace;
    self
  }

  pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }

  pub fn with_max_frame_size(mut self, bytes: usize) -> Self {
    self.max_frame_size = bytes;
    self
  }

  /// Cancelling `token` also cancels connections opened with these options.
  pub fn with_parent_token(mut self, token: CancellationToken) -> Self {
    self.parent_token = Some(token);
    self
  }

  /// The subscribe endpoint, with `http(s)` mapped to `ws(s)`.
  pub fn subscribe_url(&self) -> Result<String> {
    if self.database.is_empty() {
      return Err(Error::Config("database name is empty".into()));
    }
    let base = self.base_url.trim_end_matches('/');
    let ws_base = if let Some(rest) = base.strip_prefix("https://") {
      format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
      format!("ws://{rest}")
    } else if base.starts_with("ws://") || base.starts_with("wss://") {
      base.to_string()
    } else {
      return Err(Error::Config(format!("unsupported URL scheme in `{}`", self.base_url)));
    };
    Ok(format!(
      "{}/v1/database/{}/subscribe",
      ws_base,
      urlencoding::encode(&self.database)
    ))
  }

  /// Reject misuse before any network I/O.
  fn validate(&self) -> Result<()> {
    if !self.protocol.is_supported() {
      return Err(Error::UnsupportedProtocol(self.protocol.as_str().to_string()));
    }
    if self.require_auth && self.auth_token.is_none() {
      return Err(Error::AuthRequired);
    }
    Ok(())
  }
}

/// Lifecycle of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Disconnected,
  Connecting,
  Open,
  Closing,
  Closed,
}

impl fmt::Display for ConnectionState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Self::Disconnected => "disconnected",
      Self::Connecting => "connecting",
      Self::Open => "open",
      Self::Closing => "closing",
      Self::Closed => "closed",
    };
    f.write_str(s)
  }
}

/// An open subscription session.
///
/// `send` may be called from many tasks at once; frames are written one at a
/// time. `receive` is meant for a single reader loop.
pub struct Connection {
  url: String,
  protocol: Protocol,
  sink: Arc<Mutex<SplitSink<WsStream, Message>>>,
  stream: Mutex<SplitStream<WsStream>>,
  state: StdMutex<ConnectionState>,
  cancel: CancellationToken,
  peer_closed: CancellationToken,
  close_grace: Duration,
  max_frame_size: usize,
}

impl Connection {
  /// Open the WebSocket and complete the protocol handshake.
  pub async fn connect(options: ConnectOptions) -> Result<Self> {
    options.validate()?;
    let url = options.subscribe_url()?;
    let protocol = options.protocol;

    let mut request = url.as_str().into_client_request()?;
    let headers = request.headers_mut();
    headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol.as_str()));
    if let Some(token) = &options.auth_token {
      let value = HeaderValue::from_str(&format!("Bearer {token}"))
        .map_err(|e| Error::Config(format!("invalid auth token: {e}")))?;
      headers.insert(AUTHORIZATION, value);
    }

    tracing::info!(
      url = %url,
      protocol = protocol.as_str(),
      state = %ConnectionState::Connecting,
      "connecting"
    );

    let handshake = tokio_tungstenite::connect_async(request);
    let (ws, response) = match tokio::time::timeout(options.handshake_timeout, handshake).await {
      Ok(result) => result.map_err(|e| {
        tracing::warn!(url = %url, error = %e, "handshake failed");
        Error::from(e)
      })?,
      Err(_) => {
        return Err(Error::Handshake(format!(
          "timed out after {:?}",
          options.handshake_timeout
        )))
      }
    };

    if let Some(accepted) = response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
      if accepted.as_bytes() != protocol.as_str().as_bytes() {
        return Err(Error::Handshake(format!(
          "server selected sub-protocol {accepted:?}, expected {}",
          protocol.as_str()
        )));
      }
    }

    let (sink, stream) = ws.split();
    let cancel = match &options.parent_token {
      Some(parent) => parent.child_token(),
      None => CancellationToken::new(),
    };

    // Cancellation from any side closes the write half, even when no
    // reader or writer is active to notice.
    let sink = Arc::new(Mutex::new(sink));
    tokio::spawn({
      let sink = Arc::clone(&sink);
      let cancel = cancel.clone();
      let url = url.clone();
      async move {
        cancel.cancelled().await;
        if let Err(e) = sink.lock().await.close().await {
          tracing::debug!(url = %url, error = %e, "sink already closed");
        }
      }
    });

    tracing::info!(url = %url, state = %ConnectionState::Open, "connected");

    Ok(Self {
      url,
      protocol,
      sink,
      stream: Mutex::new(stream),
      state: StdMutex::new(ConnectionState::Open),
      cancel,
      peer_closed: CancellationToken::new(),
      close_grace: options.close_grace,
      max_frame_size: options.max_frame_size,
    })
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn protocol(&self) -> Protocol {
    self.protocol
  }

  /// Current lifecycle state. A cancelled connection is `Closed` even
  /// before any reader observes the cancellation.
  pub fn state(&self) -> ConnectionState {
    if self.cancel.is_cancelled() {
      return ConnectionState::Closed;
    }
    match self.state.lock() {
      Ok(state) => *state,
      Err(poisoned) => *poisoned.into_inner(),
    }
  }

  pub fn is_open(&self) -> bool {
    self.state() == ConnectionState::Open
  }

  /// The token governing this connection's lifetime. Cancelling it
  /// unblocks `receive` and makes further sends fail.
  pub fn cancellation_token(&self) -> CancellationToken {
    self.cancel.clone()
  }

  fn set_state(&self, next: ConnectionState) -> ConnectionState {
    let mut state = match self.state.lock() {
      Ok(state) => state,
      Err(poisoned) => poisoned.into_inner(),
    };
    std::mem::replace(&mut *state, next)
  }

  fn mark_closed(&self) {
    let prev = self.set_state(ConnectionState::Closed);
    self.cancel.cancel();
    if prev != ConnectionState::Closed {
      tracing::info!(url = %self.url, state = %ConnectionState::Closed, "connection closed");
    }
  }

  fn ensure_open(&self) -> Result<()> {
    if self.is_open() {
      Ok(())
    } else {
      Err(Error::NotConnected)
    }
  }

  /// Serialize and write one message.
  pub async fn send(&self, msg: &ClientMessage) -> Result<()> {
    self.ensure_open()?;
    let json = msg.to_json()?;

    let mut sink = self.sink.lock().await;
    self.ensure_open()?;
    tracing::debug!(kind = msg.name(), request_id = ?msg.request_id(), "sending");

    let result = tokio::select! {
      _ = self.cancel.cancelled() => return Err(Error::NotConnected),
      r = sink.send(Message::Text(json)) => r,
    };
    if let Err(e) = result {
      tracing::warn!(url = %self.url, error = %e, "send failed");
      drop(sink);
      self.mark_closed();
      return Err(e.into());
    }
    Ok(())
  }

  pub async fn send_call_reducer(
    &self,
    reducer: &str,
    args: &str,
    request_id: u32,
    flags: CallReducerFlags,
  ) -> Result<()> {
    self
      .send(&ClientMessage::call_reducer_with_flags(reducer, args, request_id, flags))
      .await
  }

  pub async fn send_subscribe(&self, query_strings: Vec<String>, request_id: u32) -> Result<()> {
    self.send(&ClientMessage::subscribe(query_strings, request_id)).await
  }

  pub async fn send_subscribe_all(&self, request_id: u32) -> Result<()> {
    self.send(&ClientMessage::subscribe_all(request_id)).await
  }

  pub async fn send_one_off_query(&self, message_id: Vec<u8>, query: &str) -> Result<()> {
    self.send(&ClientMessage::one_off_query(message_id, query)).await
  }

  pub async fn send_subscribe_single(&self, query: &str, request_id: u32, query_id: QueryId) -> Result<()> {
    self
      .send(&ClientMessage::subscribe_single(query, request_id, query_id))
      .await
  }

  pub async fn send_subscribe_multi(
    &self,
    query_strings: Vec<String>,
    request_id: u32,
    query_id: QueryId,
  ) -> Result<()> {
    self
      .send(&ClientMessage::subscribe_multi(query_strings, request_id, query_id))
      .await
  }

  pub async fn send_unsubscribe(&self, request_id: u32, query_id: QueryId) -> Result<()> {
    self.send(&ClientMessage::unsubscribe(request_id, query_id)).await
  }

  pub async fn send_unsubscribe_multi(&self, request_id: u32, query_id: QueryId) -> Result<()> {
    self
      .send(&ClientMessage::unsubscribe_multi(request_id, query_id))
      .await
  }

  /// Wait for the next server message.
  ///
  /// Decode failures are returned but leave the connection open; check
  /// [`Error::is_terminal`] to tell them apart from transport loss.
  pub async fn receive(&self) -> Result<ServerMessage> {
    let text = self.next_text().await?;
    ServerMessage::parse(&text).map_err(|e| {
      tracing::warn!(url = %self.url, error = %e, "dropping undecodable frame");
      e
    })
  }

  async fn next_text(&self) -> Result<String> {
    if self.state() == ConnectionState::Closed {
      return Err(Error::ConnectionClosed("connection is closed".into()));
    }

    let mut stream = self.stream.lock().await;
    loop {
      let frame = tokio::select! {
        _ = self.cancel.cancelled() => {
          self.mark_closed();
          return Err(Error::ConnectionClosed("cancelled".into()));
        }
        frame = stream.next() => frame,
      };

      match frame {
        Some(Ok(Message::Text(text))) => {
          if text.len() > self.max_frame_size {
            tracing::warn!(bytes = text.len(), max = self.max_frame_size, "oversize frame");
            return Err(Error::decode(
              "frame",
              format!("{} bytes exceeds limit of {}", text.len(), self.max_frame_size),
            ));
          }
          return Ok(text);
        }
        Some(Ok(Message::Binary(bytes))) => {
          tracing::warn!(bytes = bytes.len(), "unexpected binary frame");
          return Err(Error::decode(
            "frame",
            format!("binary frame of {} bytes on a JSON connection", bytes.len()),
          ));
        }
        Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => continue,
        Some(Ok(Message::Close(frame))) => {
          let reason = match frame {
            Some(f) => format!("peer closed ({}) {}", f.code, f.reason),
            None => "peer closed".to_string(),
          };
          self.peer_closed.cancel();
          self.mark_closed();
          return Err(Error::ConnectionClosed(reason));
        }
        Some(Err(e)) => {
          tracing::warn!(url = %self.url, error = %e, "read failed");
          self.peer_closed.cancel();
          self.mark_closed();
          return Err(e.into());
        }
        None => {
          self.peer_closed.cancel();
          self.mark_closed();
          return Err(Error::ConnectionClosed("stream ended".into()));
        }
      }
    }
  }

  /// Graceful shutdown: send a normal close frame, wait up to the grace
  /// period for the peer's acknowledgement, then tear down. No-op when
  /// already closing or closed.
  pub async fn close(&self) -> Result<()> {
    if self.cancel.is_cancelled() {
      self.mark_closed();
      return Ok(());
    }
    let prev = self.set_state(ConnectionState::Closing);
    if matches!(prev, ConnectionState::Closing | ConnectionState::Closed) {
      self.set_state(prev);
      return Ok(());
    }
    tracing::info!(url = %self.url, state = %ConnectionState::Closing, "closing");

    {
      let mut sink = self.sink.lock().await;
      let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
      };
      if let Err(e) = sink.send(Message::Close(Some(frame))).await {
        tracing::debug!(error = %e, "close frame not delivered");
      }
    }

    let wait_for_peer = async {
      match self.stream.try_lock() {
        Ok(mut stream) => {
          while let Some(Ok(msg)) = stream.next().await {
            if matches!(msg, Message::Close(_)) {
              break;
            }
          }
        }
        // A reader is active and will observe the close frame.
        Err(_) => self.peer_closed.cancelled().await,
      }
    };
    if tokio::time::timeout(self.close_grace, wait_for_peer).await.is_err() {
      tracing::debug!(url = %self.url, "no close acknowledgement within grace period");
    }

    self.mark_closed();
    let _ = self.sink.lock().await.close().await;
    Ok(())
  }

  /// Abrupt shutdown without waiting for the peer. No-op when already closed.
  pub async fn abort(&self) -> Result<()> {
    if self.state() == ConnectionState::Closed {
      return Ok(());
    }
    self.mark_closed();
    let _ = self.sink.lock().await.close().await;
    Ok(())
  }
}

impl Drop for Connection {
  fn drop(&mut self) {
    self.cancel.cancel();
  }
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection")
      .field("url", &self.url)
      .field("protocol", &self.protocol)
      .field("state", &self.state())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn subscribe_url_maps_schemes() {
    let url = |base: &str| ConnectOptions::new(base, "quickstart-chat").subscribe_url().unwrap();
    assert_eq!(
      url("http://localhost:3000"),
      "ws://localhost:3000/v1/database/quickstart-chat/subscribe"
    );
    assert_eq!(
      url("https://maincloud.spacetimedb.com/"),
      "wss://maincloud.spacetimedb.com/v1/database/quickstart-chat/subscribe"
    );
    assert_eq!(
      url("ws://127.0.0.1:9000"),
      "ws://127.0.0.1:9000/v1/database/quickstart-chat/subscribe"
    );
  }

  #[test]
  fn subscribe_url_rejects_bad_input() {
    assert!(matches!(
      ConnectOptions::new("ftp://host", "db").subscribe_url(),
      Err(Error::Config(_))
    ));
    assert!(matches!(
      ConnectOptions::new("http://host", "").subscribe_url(),
      Err(Error::Config(_))
    ));
  }

  #[test]
  fn validate_rejects_misuse() {
    let opts = ConnectOptions::new("http://host", "db").with_protocol(Protocol::Bsatn);
    assert!(matches!(opts.validate(), Err(Error::UnsupportedProtocol(_))));

    let opts = ConnectOptions::new("http://host", "db").require_auth();
    assert!(matches!(opts.validate(), Err(Error::AuthRequired)));
    assert!(opts.with_auth("t").validate().is_ok());
  }

  #[test]
  fn state_display() {
    assert_eq!(ConnectionState::Closing.to_string(), "closing");
  }
}
