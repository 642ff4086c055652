//! Error types for the SpacetimeDB client SDK.

use thiserror::Error;

use crate::value::ValueError;

#[derive(Error, Debug)]
pub enum Error {
  #[error("Connection error: {0}")]
  Connection(String),

  #[error("Handshake failed: {0}")]
  Handshake(String),

  #[error("Unsupported protocol: {0}")]
  UnsupportedProtocol(String),

  #[error("Not connected")]
  NotConnected,

  #[error("Connection closed: {0}")]
  ConnectionClosed(String),

  #[error("Authentication token is required for this operation")]
  AuthRequired,

  #[error("Configuration error: {0}")]
  Config(String),

  #[error("IO error: {0}")]
  Io(#[from] std::io::Error),

  #[error("Decode error in {context}: {message}")]
  Decode { context: String, message: String },

  #[error("Unknown message variant: {0}")]
  UnknownMessageVariant(String),

  #[error("Value error: {0}")]
  Value(#[from] ValueError),

  #[error("Serialization error: {0}")]
  Serialization(String),

  #[error("Server error: {0}")]
  Server(String),

  #[error("Subscription error: {message}")]
  Subscription {
    request_id: Option<u32>,
    query_id: Option<u32>,
    table_id: Option<u32>,
    message: String,
  },

  #[error("Reducer {reducer} failed: {message}")]
  ReducerFailed { reducer: String, message: String },

  #[error("Reducer {0} ran out of energy")]
  OutOfEnergy(String),

  #[error("Query error: {0}")]
  Query(String),

  #[error("Timeout")]
  Timeout,

  #[error("Channel closed")]
  ChannelClosed,
}

impl Error {
  pub(crate) fn decode(context: impl Into<String>, message: impl ToString) -> Self {
    Self::Decode {
      context: context.into(),
      message: message.to_string(),
    }
  }

  /// Whether the connection that produced this error is unusable afterwards.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      Self::Connection(_)
        | Self::Handshake(_)
        | Self::ConnectionClosed(_)
        | Self::NotConnected
        | Self::Io(_)
    )
  }
}

impl From<serde_json::Error> for Error {
  fn from(e: serde_json::Error) -> Self {
    Self::Serialization(e.to_string())
  }
}

impl From<reqwest::Error> for Error {
  fn from(e: reqwest::Error) -> Self {
    Self::Connection(e.to_string())
  }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
  fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match e {
      WsError::ConnectionClosed | WsError::AlreadyClosed => {
        Self::ConnectionClosed(e.to_string())
      }
      WsError::Io(io) => Self::Io(io),
      WsError::Http(resp) => Self::Handshake(format!("status {}", resp.status())),
      WsError::Protocol(p) => Self::Connection(p.to_string()),
      other => Self::Connection(other.to_string()),
    }
  }
}

pub type Result<T> = std::result::Result<T, Error>;
