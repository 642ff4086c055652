//! SATS values and their JSON wire form.
//!
//! | value   | wire                         |
//! |---------|------------------------------|
//! | sum     | `{"<tag>": <payload>}`       |
//! | product | `[<e0>, <e1>, ...]`          |
//! | builtin | the bare JSON scalar         |
//!
//! Decoding comes in two modes. [`AlgebraicValue::from_json`] is untyped: it
//! only looks at the JSON shape, so numbers stay [`BuiltinValue::Number`] and
//! arrays become products. [`AlgebraicValue::decode_typed`] walks the expected
//! [`AlgebraicType`] and produces exact integer widths, arrays and maps.

use std::fmt;
use std::str::FromStr;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Number, Value};
use thiserror::Error;

use crate::types::{AlgebraicType, BuiltinType, ProductType};
use crate::typespace::Typespace;

/// Value decode and type-check failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValueError {
  #[error("sum value must have exactly one tag, found {}: {}", .0.len(), .0.join(", "))]
  AmbiguousSumTag(Vec<String>),

  #[error("sum value has no tag")]
  EmptySum,

  #[error("null is not a SATS value")]
  Null,

  #[error("product arity mismatch: expected {expected} elements, found {found}")]
  ArityMismatch { expected: usize, found: usize },

  #[error("type mismatch: expected {expected}, found {found}")]
  TypeMismatch { expected: String, found: String },

  #[error("value {value} does not fit {ty}")]
  OutOfRange { ty: &'static str, value: String },

  #[error("unknown sum variant `{0}`")]
  UnknownVariant(String),

  #[error("type ref &{0} is not in the typespace")]
  UnresolvedRef(u32),

  #[error("type ref &{0} is part of a reference cycle")]
  CyclicRef(u32),

  #[error("unsupported type: {0}")]
  UnsupportedType(String),

  #[error("malformed JSON: {0}")]
  Json(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlgebraicValue {
  Sum(SumValue),
  Product(ProductValue),
  Builtin(BuiltinValue),
}

/// An instance of a sum type: the chosen variant and its payload.
#[derive(Debug, Clone, PartialEq)]
pub struct SumValue {
  pub tag: String,
  pub value: Box<AlgebraicValue>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProductValue {
  pub elements: Vec<AlgebraicValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinValue {
  Bool(bool),
  I8(i8),
  U8(u8),
  I16(i16),
  U16(u16),
  I32(i32),
  U32(u32),
  I64(i64),
  U64(u64),
  F32(f32),
  F64(f64),
  String(String),
  Array(Vec<AlgebraicValue>),
  /// Wire form is an array of `[key, value]` pairs.
  Map(Vec<(AlgebraicValue, AlgebraicValue)>),
  /// A number whose width is not known (untyped decoding).
  Number(Number),
}

fn json_kind(v: &Value) -> &'static str {
  match v {
    Value::Null => "null",
    Value::Bool(_) => "bool",
    Value::Number(_) => "number",
    Value::String(_) => "string",
    Value::Array(_) => "array",
    Value::Object(_) => "object",
  }
}

fn mismatch(expected: impl Into<String>, found: impl Into<String>) -> ValueError {
  ValueError::TypeMismatch {
    expected: expected.into(),
    found: found.into(),
  }
}

/// Parse JSON text, rejecting objects that repeat a key. A repeated key is
/// a sum with more than one tag on the wire.
fn parse_json(text: &str) -> Result<Value, ValueError> {
  let json_err = |e: serde_json::Error| ValueError::Json(e.to_string());
  if let Some(keys) = crate::json::find_duplicate_keys(text).map_err(json_err)? {
    return Err(ValueError::AmbiguousSumTag(keys));
  }
  serde_json::from_str(text).map_err(json_err)
}

fn is_unit(ty: &AlgebraicType, typespace: &Typespace) -> bool {
  matches!(typespace.resolve(ty), Ok(AlgebraicType::Product(p)) if p.is_empty())
}

/// Split a sum wire object into its only entry.
fn single_entry(obj: &serde_json::Map<String, Value>) -> Result<(&String, &Value), ValueError> {
  let mut it = obj.iter();
  match (it.next(), obj.len()) {
    (None, _) => Err(ValueError::EmptySum),
    (Some(entry), 1) => Ok(entry),
    _ => Err(ValueError::AmbiguousSumTag(obj.keys().cloned().collect())),
  }
}

macro_rules! int_from_number {
  ($n:expr, $ty:ty, $variant:ident) => {{
    $n.as_i64()
      .and_then(|i| <$ty>::try_from(i).ok())
      .or_else(|| $n.as_u64().and_then(|u| <$ty>::try_from(u).ok()))
      .map(BuiltinValue::$variant)
      .ok_or_else(|| ValueError::OutOfRange {
        ty: stringify!($variant),
        value: $n.to_string(),
      })
  }};
}

/// Narrow an untyped JSON number to the declared numeric builtin.
fn number_as(n: &Number, ty: &BuiltinType) -> Result<BuiltinValue, ValueError> {
  match ty {
    BuiltinType::I8 => int_from_number!(n, i8, I8),
    BuiltinType::U8 => int_from_number!(n, u8, U8),
    BuiltinType::I16 => int_from_number!(n, i16, I16),
    BuiltinType::U16 => int_from_number!(n, u16, U16),
    BuiltinType::I32 => int_from_number!(n, i32, I32),
    BuiltinType::U32 => int_from_number!(n, u32, U32),
    BuiltinType::I64 => int_from_number!(n, i64, I64),
    BuiltinType::U64 => int_from_number!(n, u64, U64),
    BuiltinType::F32 => {
      let f = n.as_f64().ok_or_else(|| mismatch("F32", n.to_string()))?;
      if f.is_finite() && f.abs() > f32::MAX as f64 {
        return Err(ValueError::OutOfRange {
          ty: "F32",
          value: n.to_string(),
        });
      }
      Ok(BuiltinValue::F32(f as f32))
    }
    BuiltinType::F64 => n
      .as_f64()
      .map(BuiltinValue::F64)
      .ok_or_else(|| mismatch("F64", n.to_string())),
    other => Err(mismatch(other.name(), "number")),
  }
}

impl AlgebraicValue {
  pub fn sum(tag: impl Into<String>, value: AlgebraicValue) -> Self {
    Self::Sum(SumValue::new(tag, value))
  }

  pub fn product(elements: Vec<AlgebraicValue>) -> Self {
    Self::Product(ProductValue::new(elements))
  }

  /// The empty product `()`, also the payload of unit variants.
  pub fn unit() -> Self {
    Self::product(Vec::new())
  }

  pub fn some(value: AlgebraicValue) -> Self {
    Self::sum("some", value)
  }

  pub fn none() -> Self {
    Self::sum("none", Self::unit())
  }

  pub fn as_sum(&self) -> Option<&SumValue> {
    match self {
      Self::Sum(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_product(&self) -> Option<&ProductValue> {
    match self {
      Self::Product(p) => Some(p),
      _ => None,
    }
  }

  pub fn as_builtin(&self) -> Option<&BuiltinValue> {
    match self {
      Self::Builtin(b) => Some(b),
      _ => None,
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Self::Builtin(BuiltinValue::String(s)) => Some(s),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match self {
      Self::Builtin(BuiltinValue::Bool(b)) => Some(*b),
      _ => None,
    }
  }

  fn kind(&self) -> String {
    match self {
      Self::Sum(s) => format!("sum `{}`", s.tag),
      Self::Product(p) => format!("product of {}", p.elements.len()),
      Self::Builtin(b) => b.kind().to_string(),
    }
  }

  /// Untyped decode from the JSON shape alone.
  ///
  /// `null` is rejected everywhere except as the payload of a single-key sum
  /// object, where it stands for the unit value.
  pub fn from_json(json: Value) -> Result<Self, ValueError> {
    match json {
      Value::Null => Err(ValueError::Null),
      Value::Bool(b) => Ok(Self::Builtin(BuiltinValue::Bool(b))),
      Value::Number(n) => Ok(Self::Builtin(BuiltinValue::Number(n))),
      Value::String(s) => Ok(Self::Builtin(BuiltinValue::String(s))),
      Value::Array(items) => items
        .into_iter()
        .map(Self::from_json)
        .collect::<Result<Vec<_>, _>>()
        .map(Self::product),
      Value::Object(obj) => {
        let (tag, _) = single_entry(&obj)?;
        let tag = tag.clone();
        let payload = match obj.into_iter().next() {
          Some((_, Value::Null)) | None => Self::unit(),
          Some((_, v)) => Self::from_json(v)?,
        };
        Ok(Self::sum(tag, payload))
      }
    }
  }

  pub fn from_json_str(s: &str) -> Result<Self, ValueError> {
    Self::from_json(parse_json(s)?)
  }

  /// Schema-directed decode against `ty`, resolving refs through `typespace`.
  pub fn decode_typed(json: &Value, ty: &AlgebraicType, typespace: &Typespace) -> Result<Self, ValueError> {
    match typespace.resolve(ty)? {
      AlgebraicType::Sum(sum) => {
        let obj = json
          .as_object()
          .ok_or_else(|| mismatch(ty.describe(), json_kind(json)))?;
        let (tag, payload) = single_entry(obj)?;
        let variant = sum
          .variant_for_tag(tag)
          .ok_or_else(|| ValueError::UnknownVariant(tag.clone()))?;
        let inner = match payload {
          Value::Null if is_unit(&variant.algebraic_type, typespace) => Self::unit(),
          _ => Self::decode_typed(payload, &variant.algebraic_type, typespace)?,
        };
        Ok(Self::sum(tag.clone(), inner))
      }
      AlgebraicType::Product(product) => {
        let items = json
          .as_array()
          .ok_or_else(|| mismatch(ty.describe(), json_kind(json)))?;
        ProductValue::decode_items(items, product, typespace).map(Self::Product)
      }
      AlgebraicType::Builtin(builtin) => {
        BuiltinValue::decode_typed(json, builtin, typespace).map(Self::Builtin)
      }
      AlgebraicType::Ref(r) => Err(ValueError::UnresolvedRef(r.0)),
    }
  }

  /// Check that this value inhabits `ty`. Integer widths must match exactly;
  /// untyped numbers must fit the declared width.
  pub fn type_check(&self, ty: &AlgebraicType, typespace: &Typespace) -> Result<(), ValueError> {
    match (self, typespace.resolve(ty)?) {
      (Self::Sum(sv), AlgebraicType::Sum(st)) => {
        let variant = st
          .variant_for_tag(&sv.tag)
          .ok_or_else(|| ValueError::UnknownVariant(sv.tag.clone()))?;
        sv.value.type_check(&variant.algebraic_type, typespace)
      }
      (Self::Product(pv), AlgebraicType::Product(pt)) => pv.type_check(pt, typespace),
      (Self::Builtin(bv), AlgebraicType::Builtin(bt)) => bv.type_check(bt, typespace),
      // Untyped decoding turns arrays into products.
      (Self::Product(pv), AlgebraicType::Builtin(BuiltinType::Array(elem))) => pv
        .elements
        .iter()
        .try_for_each(|e| e.type_check(elem, typespace)),
      (Self::Product(pv), AlgebraicType::Builtin(BuiltinType::Map(m))) => {
        pv.elements.iter().try_for_each(|pair| match pair {
          Self::Product(kv) if kv.elements.len() == 2 => {
            kv.elements[0].type_check(&m.key_ty, typespace)?;
            kv.elements[1].type_check(&m.ty, typespace)
          }
          other => Err(mismatch("[key, value] pair", other.kind())),
        })
      }
      (v, t) => Err(mismatch(t.describe(), v.kind())),
    }
  }

  pub fn to_json(&self) -> Value {
    // Serializing into a Value cannot fail for these shapes.
    serde_json::to_value(self).unwrap_or(Value::Null)
  }
}

impl SumValue {
  pub fn new(tag: impl Into<String>, value: AlgebraicValue) -> Self {
    Self {
      tag: tag.into(),
      value: Box::new(value),
    }
  }
}

impl ProductValue {
  pub fn new(elements: Vec<AlgebraicValue>) -> Self {
    Self { elements }
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }

  pub fn get(&self, idx: usize) -> Option<&AlgebraicValue> {
    self.elements.get(idx)
  }

  /// Value of the element named `name` in `ty`.
  pub fn field<'a>(&'a self, ty: &ProductType, name: &str) -> Option<&'a AlgebraicValue> {
    ty.element_by_name(name).and_then(|(i, _)| self.get(i))
  }

  /// Parse one row-encoded string (a JSON array in schema order).
  pub fn from_row(row: &str) -> Result<Self, ValueError> {
    match AlgebraicValue::from_json_str(row)? {
      AlgebraicValue::Product(p) => Ok(p),
      other => Err(mismatch("row array", other.kind())),
    }
  }

  /// Parse one row against its declared row type.
  pub fn from_row_typed(row: &str, ty: &ProductType, typespace: &Typespace) -> Result<Self, ValueError> {
    let json = parse_json(row)?;
    let items = json
      .as_array()
      .ok_or_else(|| mismatch("row array", json_kind(&json)))?;
    Self::decode_items(items, ty, typespace)
  }

  fn decode_items(items: &[Value], ty: &ProductType, typespace: &Typespace) -> Result<Self, ValueError> {
    if items.len() != ty.len() {
      return Err(ValueError::ArityMismatch {
        expected: ty.len(),
        found: items.len(),
      });
    }
    items
      .iter()
      .zip(&ty.elements)
      .map(|(item, elem)| AlgebraicValue::decode_typed(item, &elem.algebraic_type, typespace))
      .collect::<Result<Vec<_>, _>>()
      .map(Self::new)
  }

  pub fn type_check(&self, ty: &ProductType, typespace: &Typespace) -> Result<(), ValueError> {
    if self.elements.len() != ty.len() {
      return Err(ValueError::ArityMismatch {
        expected: ty.len(),
        found: self.elements.len(),
      });
    }
    self
      .elements
      .iter()
      .zip(&ty.elements)
      .try_for_each(|(v, e)| v.type_check(&e.algebraic_type, typespace))
  }
}

impl BuiltinValue {
  fn kind(&self) -> &'static str {
    match self {
      Self::Bool(_) => "Bool",
      Self::I8(_) => "I8",
      Self::U8(_) => "U8",
      Self::I16(_) => "I16",
      Self::U16(_) => "U16",
      Self::I32(_) => "I32",
      Self::U32(_) => "U32",
      Self::I64(_) => "I64",
      Self::U64(_) => "U64",
      Self::F32(_) => "F32",
      Self::F64(_) => "F64",
      Self::String(_) => "String",
      Self::Array(_) => "Array",
      Self::Map(_) => "Map",
      Self::Number(_) => "number",
    }
  }

  fn decode_typed(json: &Value, ty: &BuiltinType, typespace: &Typespace) -> Result<Self, ValueError> {
    match (ty, json) {
      (BuiltinType::Bool, Value::Bool(b)) => Ok(Self::Bool(*b)),
      (BuiltinType::String, Value::String(s)) => Ok(Self::String(s.clone())),
      (BuiltinType::Array(elem), Value::Array(items)) => items
        .iter()
        .map(|item| AlgebraicValue::decode_typed(item, elem, typespace))
        .collect::<Result<Vec<_>, _>>()
        .map(Self::Array),
      (BuiltinType::Map(m), Value::Array(pairs)) => pairs
        .iter()
        .map(|pair| match pair.as_array().map(Vec::as_slice) {
          Some([k, v]) => Ok((
            AlgebraicValue::decode_typed(k, &m.key_ty, typespace)?,
            AlgebraicValue::decode_typed(v, &m.ty, typespace)?,
          )),
          _ => Err(mismatch("[key, value] pair", json_kind(pair))),
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Self::Map),
      (_, Value::Number(n)) => number_as(n, ty),
      (_, Value::Null) => Err(ValueError::Null),
      (ty, other) => Err(mismatch(ty.name(), json_kind(other))),
    }
  }

  fn type_check(&self, ty: &BuiltinType, typespace: &Typespace) -> Result<(), ValueError> {
    match (self, ty) {
      (Self::Bool(_), BuiltinType::Bool)
      | (Self::I8(_), BuiltinType::I8)
      | (Self::U8(_), BuiltinType::U8)
      | (Self::I16(_), BuiltinType::I16)
      | (Self::U16(_), BuiltinType::U16)
      | (Self::I32(_), BuiltinType::I32)
      | (Self::U32(_), BuiltinType::U32)
      | (Self::I64(_), BuiltinType::I64)
      | (Self::U64(_), BuiltinType::U64)
      | (Self::F32(_), BuiltinType::F32)
      | (Self::F64(_), BuiltinType::F64)
      | (Self::String(_), BuiltinType::String) => Ok(()),
      (Self::Number(n), ty) => number_as(n, ty).map(|_| ()),
      (Self::Array(items), BuiltinType::Array(elem)) => {
        items.iter().try_for_each(|v| v.type_check(elem, typespace))
      }
      (Self::Map(pairs), BuiltinType::Map(m)) => pairs.iter().try_for_each(|(k, v)| {
        k.type_check(&m.key_ty, typespace)?;
        v.type_check(&m.ty, typespace)
      }),
      (v, t) => Err(mismatch(t.name(), v.kind())),
    }
  }
}

// ── Conversions ──────────────────────────────────────────────────────

macro_rules! builtin_from {
  ($($ty:ty => $variant:ident),+ $(,)?) => {
    $(
      impl From<$ty> for AlgebraicValue {
        fn from(v: $ty) -> Self {
          Self::Builtin(BuiltinValue::$variant(v))
        }
      }
    )+
  };
}

builtin_from! {
  bool => Bool,
  i8 => I8,
  u8 => U8,
  i16 => I16,
  u16 => U16,
  i32 => I32,
  u32 => U32,
  i64 => I64,
  u64 => U64,
  f32 => F32,
  f64 => F64,
  String => String,
}

impl From<&str> for AlgebraicValue {
  fn from(v: &str) -> Self {
    Self::Builtin(BuiltinValue::String(v.to_string()))
  }
}

impl From<ProductValue> for AlgebraicValue {
  fn from(p: ProductValue) -> Self {
    Self::Product(p)
  }
}

impl From<SumValue> for AlgebraicValue {
  fn from(s: SumValue) -> Self {
    Self::Sum(s)
  }
}

impl FromStr for AlgebraicValue {
  type Err = ValueError;
  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::from_json_str(s)
  }
}

impl fmt::Display for AlgebraicValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.to_json())
  }
}

// ── Wire form ────────────────────────────────────────────────────────

impl Serialize for AlgebraicValue {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Self::Sum(s) => s.serialize(serializer),
      Self::Product(p) => p.serialize(serializer),
      Self::Builtin(b) => b.serialize(serializer),
    }
  }
}

impl Serialize for SumValue {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(1))?;
    map.serialize_entry(&self.tag, &*self.value)?;
    map.end()
  }
}

impl Serialize for ProductValue {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    self.elements.serialize(serializer)
  }
}

impl Serialize for BuiltinValue {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Self::Bool(v) => serializer.serialize_bool(*v),
      Self::I8(v) => serializer.serialize_i8(*v),
      Self::U8(v) => serializer.serialize_u8(*v),
      Self::I16(v) => serializer.serialize_i16(*v),
      Self::U16(v) => serializer.serialize_u16(*v),
      Self::I32(v) => serializer.serialize_i32(*v),
      Self::U32(v) => serializer.serialize_u32(*v),
      Self::I64(v) => serializer.serialize_i64(*v),
      Self::U64(v) => serializer.serialize_u64(*v),
      Self::F32(v) => serializer.serialize_f32(*v),
      Self::F64(v) => serializer.serialize_f64(*v),
      Self::String(v) => serializer.serialize_str(v),
      Self::Array(items) => items.serialize(serializer),
      Self::Map(pairs) => {
        let mut seq = serializer.serialize_seq(Some(pairs.len()))?;
        for (k, v) in pairs {
          seq.serialize_element(&(k, v))?;
        }
        seq.end()
      }
      Self::Number(n) => n.serialize(serializer),
    }
  }
}

impl<'de> Deserialize<'de> for AlgebraicValue {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    let json = Value::deserialize(deserializer)?;
    Self::from_json(json).map_err(serde::de::Error::custom)
  }
}

impl<'de> Deserialize<'de> for ProductValue {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    match AlgebraicValue::deserialize(deserializer)? {
      AlgebraicValue::Product(p) => Ok(p),
      other => Err(serde::de::Error::custom(mismatch("product array", other.kind()))),
    }
  }
}

impl<'de> Deserialize<'de> for SumValue {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    match AlgebraicValue::deserialize(deserializer)? {
      AlgebraicValue::Sum(s) => Ok(s),
      other => Err(serde::de::Error::custom(mismatch("sum object", other.kind()))),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::{ProductTypeElement, SumTypeVariant};
  use serde_json::json;

  #[test]
  fn sum_wire_shape() {
    let v = AlgebraicValue::sum("Circle", AlgebraicValue::from(1.5f64));
    assert_eq!(v.to_json(), json!({"Circle": 1.5}));
  }

  #[test]
  fn null_is_rejected() {
    assert_eq!(AlgebraicValue::from_json(Value::Null), Err(ValueError::Null));
    assert!(AlgebraicValue::from_json(json!([1, null])).is_err());
  }

  #[test]
  fn null_sum_payload_is_unit() {
    let v = AlgebraicValue::from_json(json!({"none": null})).unwrap();
    assert_eq!(v, AlgebraicValue::sum("none", AlgebraicValue::unit()));

    let ty = AlgebraicType::option(AlgebraicType::u8());
    let ts = Typespace::new();
    let v = AlgebraicValue::decode_typed(&json!({"none": null}), &ty, &ts).unwrap();
    assert_eq!(v, AlgebraicValue::sum("none", AlgebraicValue::unit()));
    assert_eq!(
      AlgebraicValue::decode_typed(&json!({"some": null}), &ty, &ts),
      Err(ValueError::Null)
    );
  }

  #[test]
  fn number_narrowing() {
    let n = Number::from(300);
    assert!(matches!(number_as(&n, &BuiltinType::U8), Err(ValueError::OutOfRange { ty: "U8", .. })));
    assert_eq!(number_as(&n, &BuiltinType::U16), Ok(BuiltinValue::U16(300)));
    let neg = Number::from(-1);
    assert!(number_as(&neg, &BuiltinType::U64).is_err());
    assert_eq!(number_as(&neg, &BuiltinType::I8), Ok(BuiltinValue::I8(-1)));
  }

  #[test]
  fn typed_values_do_not_widen() {
    let ts = Typespace::new();
    let v = AlgebraicValue::from(5u8);
    assert!(v.type_check(&AlgebraicType::u8(), &ts).is_ok());
    assert!(v.type_check(&AlgebraicType::i32(), &ts).is_err());
  }

  #[test]
  fn map_wire_form_is_pairs() {
    let ts = Typespace::new();
    let ty = AlgebraicType::map(AlgebraicType::string(), AlgebraicType::u32());
    let v = AlgebraicValue::decode_typed(&json!([["a", 1], ["b", 2]]), &ty, &ts).unwrap();
    match &v {
      AlgebraicValue::Builtin(BuiltinValue::Map(pairs)) => assert_eq!(pairs.len(), 2),
      other => panic!("expected map, got {other:?}"),
    }
    assert_eq!(v.to_json(), json!([["a", 1], ["b", 2]]));
  }

  #[test]
  fn option_type_accepts_both_variants() {
    let ts = Typespace::new();
    let ty = AlgebraicType::option(AlgebraicType::string());
    assert!(AlgebraicValue::some("x".into()).type_check(&ty, &ts).is_ok());
    assert!(AlgebraicValue::none().type_check(&ty, &ts).is_ok());
    assert!(AlgebraicValue::sum("maybe", AlgebraicValue::unit()).type_check(&ty, &ts).is_err());
  }

  #[test]
  fn untyped_product_checks_against_array() {
    let ts = Typespace::new();
    let v = AlgebraicValue::from_json(json!([1, 2, 3])).unwrap();
    assert!(v.type_check(&AlgebraicType::array(AlgebraicType::u8()), &ts).is_ok());
    assert!(v.type_check(&AlgebraicType::array(AlgebraicType::string()), &ts).is_err());
  }

  #[test]
  fn positional_sum_tag() {
    let ts = Typespace::new();
    let ty = AlgebraicType::sum(vec![
      SumTypeVariant::unnamed(AlgebraicType::bool()),
      SumTypeVariant::unnamed(AlgebraicType::string()),
    ]);
    let v = AlgebraicValue::decode_typed(&json!({"1": "hi"}), &ty, &ts).unwrap();
    assert_eq!(v.as_sum().unwrap().value.as_str(), Some("hi"));
  }

  #[test]
  fn named_field_lookup() {
    let ty = ProductType::new(vec![
      ProductTypeElement::new("id", AlgebraicType::u64()),
      ProductTypeElement::new("name", AlgebraicType::string()),
    ]);
    let row = ProductValue::from_row_typed(r#"[7, "ada"]"#, &ty, &Typespace::new()).unwrap();
    assert_eq!(row.field(&ty, "name").and_then(AlgebraicValue::as_str), Some("ada"));
    assert_eq!(row.get(0), Some(&AlgebraicValue::from(7u64)));
  }
}
