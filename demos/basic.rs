//! Basic example: a chat client against the quickstart-chat module.
//!
//! Run with `SPACETIMEDB_URI` (default `http://localhost:3000`) and
//! optionally `SPACETIMEDB_TOKEN` set, then type lines to send messages.

use spacetimedb_client::schema::{fetch_schema, DEFAULT_SCHEMA_VERSION};
use spacetimedb_client::{AlgebraicValue, ConnectOptions, DbClient, ServerMessage};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DATABASE: &str = "quickstart-chat";

#[tokio::main]
async fn main() -> spacetimedb_client::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .init();

  let opts = ConnectOptions::from_env(DATABASE);

  // Fetch the module schema so rows can be decoded by column name
  let module = fetch_schema(&reqwest::Client::new(), &opts.base_url, DATABASE, DEFAULT_SCHEMA_VERSION).await?;
  let send_message = module
    .reducer("send_message")
    .cloned()
    .ok_or_else(|| spacetimedb_client::Error::Config("module has no send_message reducer".into()))?;
  println!("Schema: {} tables, {} reducers", module.tables.len(), module.reducers.len());

  // Connect and wait for our identity
  let client = DbClient::connect(opts).await?;
  let mut events = client.events().ok_or(spacetimedb_client::Error::ChannelClosed)?;
  let identity = client.wait_for_identity().await?;
  println!("Connected as {}", identity.identity.identity);

  // Subscribe to the chat tables
  let applied = client
    .subscribe_multi(vec!["SELECT * FROM user".into(), "SELECT * FROM message".into()])
    .await?;
  for table in &applied.update.tables {
    println!("{}: {} rows", table.table_name, table.inserts().count());
  }

  // Print every committed message as it arrives
  let printer_module = module.clone();
  tokio::spawn(async move {
    while let Some(msg) = events.recv().await {
      let ServerMessage::TransactionUpdate(tx) = msg else {
        continue;
      };
      let Some(update) = tx.committed_update() else {
        if let Some(reason) = tx.failure() {
          println!("{} failed: {}", tx.reducer_name(), reason);
        }
        continue;
      };
      if let Some(messages) = update.table("message") {
        for row in messages.inserts() {
          match printer_module.decode_row("message", row) {
            Ok(row) => println!("> {}", row.elements.last().map(|v| v.to_string()).unwrap_or_default()),
            Err(e) => println!("undecodable row {}: {}", row, e),
          }
        }
      }
    }
  });

  // Send each stdin line as a chat message
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  while let Some(line) = lines.next_line().await? {
    if line.is_empty() {
      continue;
    }
    let args = send_message.encode_args(&[AlgebraicValue::from(line.as_str())], &module.typespace)?;
    if let Err(e) = client.call_reducer_and_wait("send_message", &args).await {
      println!("Error: {}", e);
    }
  }

  client.close().await?;
  Ok(())
}
