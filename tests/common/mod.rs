//! In-process WebSocket server for connection tests.

#![allow(dead_code)]

use std::future::Future;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use spacetimedb_client::ClientMessage;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

pub type ServerWs = WebSocketStream<TcpStream>;

/// One accepted session and what the client sent during the handshake.
pub struct Accepted {
  pub ws: ServerWs,
  pub path: String,
  pub protocol: Option<String>,
  pub auth: Option<String>,
}

/// Boots a server on an ephemeral port that accepts one connection, echoes
/// the requested sub-protocol and hands the session to `handler`. Returns
/// the `http://` base URL.
pub async fn start_server<F, Fut>(handler: F) -> String
where
  F: FnOnce(Accepted) -> Fut + Send + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    let (stream, _peer) = listener.accept().await.unwrap();
    let mut path = String::new();
    let mut protocol = None;
    let mut auth = None;

    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, mut resp: Response| {
      path = req.uri().path().to_string();
      auth = header(req, AUTHORIZATION.as_str());
      if let Some(p) = req.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        protocol = p.to_str().ok().map(String::from);
        resp.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, p.clone());
      }
      Ok(resp)
    })
    .await
    .unwrap();

    handler(Accepted {
      ws,
      path,
      protocol,
      auth,
    })
    .await;
  });

  format!("http://{}", addr)
}

/// A server that rejects the upgrade with `status`.
pub async fn start_rejecting_server(status: StatusCode) -> String {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();

  tokio::spawn(async move {
    let (stream, _peer) = listener.accept().await.unwrap();
    let _ = tokio_tungstenite::accept_hdr_async(stream, move |_req: &Request, _resp: Response| {
      let mut err = ErrorResponse::new(Some("rejected".to_string()));
      *err.status_mut() = status;
      Err(err)
    })
    .await;
  });

  format!("http://{}", addr)
}

fn header(req: &Request, name: &str) -> Option<String> {
  req
    .headers()
    .get(name)
    .and_then(|v| v.to_str().ok())
    .map(String::from)
}

/// Next client message, skipping control frames. `None` once the client
/// has gone away.
pub async fn next_client_message(ws: &mut ServerWs) -> Option<ClientMessage> {
  while let Some(Ok(msg)) = ws.next().await {
    match msg {
      Message::Text(text) => return Some(serde_json::from_str(&text).unwrap()),
      Message::Close(_) => return None,
      _ => continue,
    }
  }
  None
}

pub async fn send_json(ws: &mut ServerWs, value: Value) {
  ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Read until the client disconnects, answering its close frame.
pub async fn drain(mut ws: ServerWs) {
  while let Some(Ok(_)) = ws.next().await {}
}

pub fn identity_token(connection_id: u64) -> Value {
  json!({"IdentityToken": {
    "identity": {"__identity__": "c2000000000000000000000000000000000000000000000000000000000000ab"},
    "token": "test-token",
    "connection_id": {"__connection_id__": connection_id},
  }})
}

pub fn subscribe_applied(request_id: u32, query_id: u32, table: &str, rows: &[&str]) -> Value {
  json!({"SubscribeApplied": {
    "request_id": request_id,
    "total_host_execution_duration_micros": 15,
    "query_id": {"id": query_id},
    "rows": {
      "table_id": 4097,
      "table_name": table,
      "table_rows": {
        "table_id": 4097,
        "table_name": table,
        "num_rows": rows.len(),
        "updates": [{"inserts": rows, "deletes": []}],
      },
    },
  }})
}
