//! Module schema tests.

use serde_json::json;
use spacetimedb_client::schema::{fetch_schema, Lifecycle, TableAccess, DEFAULT_SCHEMA_VERSION};
use spacetimedb_client::{AlgebraicValue, Error, RawModuleDef};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

fn chat_module() -> serde_json::Value {
  json!({
    "typespace": {"types": [
      {"Product": {"elements": [
        {"name": {"some": "identity"}, "algebraic_type": {"Builtin": {"String": []}}},
        {"name": {"some": "name"}, "algebraic_type": {"Sum": {"variants": [
          {"name": {"some": "some"}, "algebraic_type": {"Builtin": {"String": []}}},
          {"name": {"some": "none"}, "algebraic_type": {"Product": {"elements": []}}}
        ]}}},
        {"name": {"some": "online"}, "algebraic_type": {"Bool": []}}
      ]}},
      {"Product": {"elements": [
        {"name": {"some": "sent"}, "algebraic_type": {"Builtin": {"U64": []}}},
        {"name": {"some": "text"}, "algebraic_type": {"Builtin": {"String": []}}}
      ]}}
    ]},
    "tables": [
      {
        "name": "user",
        "product_type_ref": 0,
        "primary_key": [0],
        "indexes": [],
        "constraints": [],
        "sequences": [],
        "schedule": {"none": []},
        "table_type": {"User": []},
        "table_access": {"Public": []}
      },
      {
        "name": "message",
        "product_type_ref": 1,
        "primary_key": [],
        "indexes": [],
        "constraints": [],
        "sequences": [],
        "schedule": {"none": []},
        "table_type": {"User": []},
        "table_access": {"Private": []}
      }
    ],
    "reducers": [
      {
        "name": "send_message",
        "params": {"elements": [
          {"name": {"some": "text"}, "algebraic_type": {"Builtin": {"String": []}}}
        ]},
        "lifecycle": {"none": []}
      },
      {
        "name": "identity_connected",
        "params": {"elements": []},
        "lifecycle": {"some": {"OnConnect": []}}
      }
    ],
    "types": [],
    "misc_exports": [],
    "row_level_security": []
  })
}

/// Serve one canned HTTP response and report the request line.
async fn serve_once(status: &'static str, body: String) -> (String, oneshot::Receiver<String>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (line_tx, line_rx) = oneshot::channel();

  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
      let n = stream.read(&mut chunk).await.unwrap();
      if n == 0 {
        break;
      }
      buf.extend_from_slice(&chunk[..n]);
    }
    let request = String::from_utf8_lossy(&buf);
    let _ = line_tx.send(request.lines().next().unwrap_or_default().to_string());

    let response = format!(
      "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
      status,
      body.len(),
      body
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    let _ = stream.shutdown().await;
  });

  (format!("http://{}", addr), line_rx)
}

#[test]
fn test_parse_module_def() {
  let module: RawModuleDef = serde_json::from_value(chat_module()).unwrap();
  assert_eq!(module.typespace.len(), 2);
  assert_eq!(module.tables.len(), 2);

  let user = module.table("user").unwrap();
  assert!(user.is_public());
  assert_eq!(user.primary_key, vec![0]);
  assert!(user.schedule.is_none());
  assert_eq!(module.table("message").unwrap().table_access, TableAccess::Private);

  let connected = module.lifecycle_reducer(Lifecycle::OnConnect).unwrap();
  assert_eq!(connected.name, "identity_connected");
  assert!(module.lifecycle_reducer(Lifecycle::Init).is_none());

  let row_type = module.table_row_type("user").unwrap();
  assert_eq!(row_type.len(), 3);
}

#[test]
fn test_decode_rows_against_schema() {
  let module: RawModuleDef = serde_json::from_value(chat_module()).unwrap();

  let row = module
    .decode_row("user", r#"["c200ab", {"some": "alice"}, true]"#)
    .unwrap();
  let ty = module.table_row_type("user").unwrap();
  assert_eq!(row.field(ty, "online").and_then(|v| v.as_bool()), Some(true));
  let name = row.field(ty, "name").and_then(|v| v.as_sum()).unwrap();
  assert_eq!(name.tag, "some");

  let err = module.decode_row("message", r#"[-1, "hi"]"#).unwrap_err();
  assert!(matches!(err, Error::Value(_)));
  assert!(matches!(module.decode_row("nope", "[]"), Err(Error::Config(_))));
}

#[test]
fn test_encode_reducer_args() {
  let module: RawModuleDef = serde_json::from_value(chat_module()).unwrap();
  let reducer = module.reducer("send_message").unwrap();

  let args = reducer
    .encode_args(&[AlgebraicValue::from("hello")], &module.typespace)
    .unwrap();
  assert_eq!(args, r#"["hello"]"#);

  let err = reducer.encode_args(&[AlgebraicValue::from(5u32)], &module.typespace);
  assert!(matches!(err, Err(Error::Value(_))));
}

#[test]
fn test_module_def_round_trip() {
  let module: RawModuleDef = serde_json::from_value(chat_module()).unwrap();
  let json = serde_json::to_string(&module).unwrap();
  let back: RawModuleDef = serde_json::from_str(&json).unwrap();
  assert_eq!(back, module);
}

#[tokio::test]
async fn test_fetch_schema() {
  let (base, request_line) = serve_once("200 OK", chat_module().to_string()).await;
  let http = reqwest::Client::new();

  let module = fetch_schema(&http, &base, "quickstart-chat", DEFAULT_SCHEMA_VERSION)
    .await
    .unwrap();
  assert_eq!(module.reducers.len(), 2);

  let line = request_line.await.unwrap();
  assert_eq!(line, "GET /v1/database/quickstart-chat/schema?version=9 HTTP/1.1");
}

#[tokio::test]
async fn test_fetch_schema_not_found() {
  let (base, _) = serve_once("404 Not Found", "no such database".to_string()).await;
  let http = reqwest::Client::new();

  match fetch_schema(&http, &base, "missing", DEFAULT_SCHEMA_VERSION).await {
    Err(Error::Server(msg)) => {
      assert!(msg.contains("404"));
      assert!(msg.contains("no such database"));
    }
    other => panic!("expected Server error, got {:?}", other),
  }
}

#[tokio::test]
async fn test_fetch_schema_bad_body() {
  let (base, _) = serve_once("200 OK", "{\"typespace\": 5}".to_string()).await;
  let http = reqwest::Client::new();

  match fetch_schema(&http, &base, "quickstart-chat", DEFAULT_SCHEMA_VERSION).await {
    Err(Error::Decode { context, .. }) => assert_eq!(context, "RawModuleDef"),
    other => panic!("expected Decode error, got {:?}", other),
  }
}
