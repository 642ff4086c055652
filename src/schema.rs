//! Module schema (`RawModuleDef`) as served by the schema endpoint.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::json::unit_sum;
use crate::types::{AlgebraicTypeRef, ProductType};
use crate::typespace::Typespace;
use crate::value::{AlgebraicValue, ProductValue, ValueError};

/// Schema version requested from the server when none is given.
pub const DEFAULT_SCHEMA_VERSION: u32 = 9;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawModuleDef {
  pub typespace: Typespace,
  #[serde(default)]
  pub tables: Vec<TableDef>,
  #[serde(default)]
  pub reducers: Vec<ReducerDef>,
  #[serde(default)]
  pub types: Vec<NamedTypeDef>,
  #[serde(default)]
  pub misc_exports: Vec<serde_json::Value>,
  #[serde(default)]
  pub row_level_security: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableDef {
  pub name: String,
  pub product_type_ref: AlgebraicTypeRef,
  #[serde(default)]
  pub primary_key: Vec<u16>,
  #[serde(default)]
  pub indexes: Vec<serde_json::Value>,
  #[serde(default)]
  pub constraints: Vec<serde_json::Value>,
  #[serde(default)]
  pub sequences: Vec<serde_json::Value>,
  #[serde(default, with = "crate::json::option")]
  pub schedule: Option<ScheduleDef>,
  pub table_type: TableType,
  pub table_access: TableAccess,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDef {
  #[serde(default, with = "crate::json::option")]
  pub name: Option<String>,
  pub reducer_name: String,
  pub scheduled_at_column: u16,
}

unit_sum! {
  /// Whether a table belongs to the user module or the system.
  pub enum TableType { User, System }
}

unit_sum! {
  pub enum TableAccess { Private, Public }
}

unit_sum! {
  /// Reducers the host invokes on its own.
  pub enum Lifecycle { Init, OnConnect, OnDisconnect }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReducerDef {
  pub name: String,
  pub params: ProductType,
  #[serde(default, with = "crate::json::option")]
  pub lifecycle: Option<Lifecycle>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTypeDef {
  pub name: TypeName,
  pub ty: AlgebraicTypeRef,
  #[serde(default)]
  pub custom_ordering: bool,
}

/// A scoped type name such as `game::Entity`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeName {
  #[serde(default)]
  pub scope: Vec<String>,
  pub name: String,
}

impl TypeName {
  pub fn qualified(&self) -> String {
    let mut parts = self.scope.clone();
    parts.push(self.name.clone());
    parts.join("::")
  }
}

impl TableDef {
  /// A public user table with no keys, indexes or schedule.
  pub fn user(name: impl Into<String>, product_type_ref: AlgebraicTypeRef) -> Self {
    Self {
      name: name.into(),
      product_type_ref,
      primary_key: Vec::new(),
      indexes: Vec::new(),
      constraints: Vec::new(),
      sequences: Vec::new(),
      schedule: None,
      table_type: TableType::User,
      table_access: TableAccess::Public,
    }
  }

  pub fn is_public(&self) -> bool {
    self.table_access == TableAccess::Public
  }
}

impl ReducerDef {
  pub fn new(name: impl Into<String>, params: ProductType) -> Self {
    Self {
      name: name.into(),
      params,
      lifecycle: None,
    }
  }

  pub fn init(name: impl Into<String>, params: ProductType) -> Self {
    Self {
      lifecycle: Some(Lifecycle::Init),
      ..Self::new(name, params)
    }
  }

  /// Type-check `args` against the parameter list and render the JSON
  /// array literal carried by `CallReducer.args`.
  pub fn encode_args(&self, args: &[AlgebraicValue], typespace: &Typespace) -> Result<String> {
    let product = ProductValue::new(args.to_vec());
    product
      .type_check(&self.params, typespace)
      .map_err(Error::Value)?;
    Ok(serde_json::to_string(&product)?)
  }
}

impl RawModuleDef {
  pub fn table(&self, name: &str) -> Option<&TableDef> {
    self.tables.iter().find(|t| t.name == name)
  }

  pub fn reducer(&self, name: &str) -> Option<&ReducerDef> {
    self.reducers.iter().find(|r| r.name == name)
  }

  pub fn lifecycle_reducer(&self, lifecycle: Lifecycle) -> Option<&ReducerDef> {
    self.reducers.iter().find(|r| r.lifecycle == Some(lifecycle))
  }

  pub fn named_type(&self, qualified: &str) -> Option<&NamedTypeDef> {
    self.types.iter().find(|t| t.name.qualified() == qualified)
  }

  /// The row type of `table`, resolved through the typespace.
  pub fn table_row_type(&self, table: &str) -> Result<&ProductType> {
    let def = self
      .table(table)
      .ok_or_else(|| Error::Config(format!("unknown table `{table}`")))?;
    let ty = self.typespace.resolve_ref(def.product_type_ref)?;
    ty.as_product().ok_or_else(|| {
      Error::Value(ValueError::TypeMismatch {
        expected: "product row type".into(),
        found: ty.describe(),
      })
    })
  }

  /// Decode a row-encoded string of `table` against its schema.
  pub fn decode_row(&self, table: &str, row: &str) -> Result<ProductValue> {
    let ty = self.table_row_type(table)?;
    Ok(ProductValue::from_row_typed(row, ty, &self.typespace)?)
  }
}

/// Build the schema URL for a database.
pub fn schema_url(base_url: &str, name_or_identity: &str, version: u32) -> String {
  format!(
    "{}/v1/database/{}/schema?version={}",
    base_url.trim_end_matches('/'),
    urlencoding::encode(name_or_identity),
    version
  )
}

/// Fetch the module schema of a database.
pub async fn fetch_schema(
  http: &reqwest::Client,
  base_url: &str,
  name_or_identity: &str,
  version: u32,
) -> Result<RawModuleDef> {
  let url = schema_url(base_url, name_or_identity, version);
  tracing::debug!(url = %url, "fetching schema");

  let resp = http.get(&url).send().await?;
  let status = resp.status();
  if !status.is_success() {
    let body = resp.text().await.unwrap_or_default();
    return Err(Error::Server(format!("schema fetch returned {status}: {body}")));
  }

  let body = resp.text().await?;
  serde_json::from_str(&body).map_err(|e| Error::decode("RawModuleDef", e))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{AlgebraicType, ProductTypeElement};

  #[test]
  fn schema_url_encodes_name() {
    assert_eq!(
      schema_url("http://localhost:3000/", "my db", 9),
      "http://localhost:3000/v1/database/my%20db/schema?version=9"
    );
  }

  #[test]
  fn qualified_type_name() {
    let name = TypeName {
      scope: vec!["game".into()],
      name: "Entity".into(),
    };
    assert_eq!(name.qualified(), "game::Entity");
  }

  #[test]
  fn init_reducer_has_lifecycle() {
    let r = ReducerDef::init("init", ProductType::default());
    assert_eq!(r.lifecycle, Some(Lifecycle::Init));
    let v = serde_json::to_value(&r).unwrap();
    assert_eq!(v["lifecycle"], serde_json::json!({"some": {"Init": []}}));
  }

  #[test]
  fn encode_args_checks_arity() {
    let reducer = ReducerDef::new(
      "send_message",
      ProductType::new(vec![ProductTypeElement::new("text", AlgebraicType::string())]),
    );
    let ts = Typespace::new();
    assert_eq!(reducer.encode_args(&["hi".into()], &ts).unwrap(), r#"["hi"]"#);
    assert!(matches!(
      reducer.encode_args(&[], &ts),
      Err(Error::Value(ValueError::ArityMismatch { expected: 1, found: 0 }))
    ));
  }
}
