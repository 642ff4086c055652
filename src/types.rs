//! The SATS algebraic type model.
//!
//! Every type is exactly one of a sum, a product, a builtin, or a reference
//! into a [`Typespace`](crate::Typespace). On the wire each is a single-key
//! object naming the variant.

use std::fmt;

use serde::de::{self, IgnoredAny, MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::json::expect_single_key;

/// Index of a type inside a typespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AlgebraicTypeRef(pub u32);

impl AlgebraicTypeRef {
  pub fn idx(self) -> usize {
    self.0 as usize
  }
}

impl TryFrom<i64> for AlgebraicTypeRef {
  type Error = ();
  fn try_from(v: i64) -> Result<Self, Self::Error> {
    u32::try_from(v).map(Self).map_err(|_| ())
  }
}

impl fmt::Display for AlgebraicTypeRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "&{}", self.0)
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AlgebraicType {
  Sum(SumType),
  Product(ProductType),
  Builtin(BuiltinType),
  Ref(AlgebraicTypeRef),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SumType {
  pub variants: Vec<SumTypeVariant>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SumTypeVariant {
  #[serde(default, with = "crate::json::option")]
  pub name: Option<String>,
  pub algebraic_type: AlgebraicType,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProductType {
  pub elements: Vec<ProductTypeElement>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductTypeElement {
  #[serde(default, with = "crate::json::option")]
  pub name: Option<String>,
  pub algebraic_type: AlgebraicType,
}

/// Primitive SATS types. `I128`/`U128` are reserved and not representable.
#[derive(Debug, Clone, PartialEq)]
pub enum BuiltinType {
  Bool,
  I8,
  U8,
  I16,
  U16,
  I32,
  U32,
  I64,
  U64,
  F32,
  F64,
  String,
  Array(Box<AlgebraicType>),
  Map(Box<MapType>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapType {
  pub key_ty: AlgebraicType,
  pub ty: AlgebraicType,
}

impl SumTypeVariant {
  pub fn new(name: impl Into<String>, algebraic_type: AlgebraicType) -> Self {
    Self {
      name: Some(name.into()),
      algebraic_type,
    }
  }

  pub fn unnamed(algebraic_type: AlgebraicType) -> Self {
    Self {
      name: None,
      algebraic_type,
    }
  }

  pub fn has_name(&self, name: &str) -> bool {
    self.name.as_deref() == Some(name)
  }
}

impl ProductTypeElement {
  pub fn new(name: impl Into<String>, algebraic_type: AlgebraicType) -> Self {
    Self {
      name: Some(name.into()),
      algebraic_type,
    }
  }

  pub fn unnamed(algebraic_type: AlgebraicType) -> Self {
    Self {
      name: None,
      algebraic_type,
    }
  }
}

impl SumType {
  pub fn new(variants: Vec<SumTypeVariant>) -> Self {
    Self { variants }
  }

  /// Position of the variant with this name.
  pub fn variant_index(&self, name: &str) -> Option<usize> {
    self.variants.iter().position(|v| v.has_name(name))
  }

  /// Look up a variant by name, falling back to a positional tag like `"1"`.
  pub fn variant_for_tag(&self, tag: &str) -> Option<&SumTypeVariant> {
    if let Some(i) = self.variant_index(tag) {
      return self.variants.get(i);
    }
    tag.parse::<usize>().ok().and_then(|i| self.variants.get(i))
  }
}

impl ProductType {
  pub fn new(elements: Vec<ProductTypeElement>) -> Self {
    Self { elements }
  }

  pub fn len(&self) -> usize {
    self.elements.len()
  }

  pub fn is_empty(&self) -> bool {
    self.elements.is_empty()
  }

  pub fn element_by_name(&self, name: &str) -> Option<(usize, &ProductTypeElement)> {
    self
      .elements
      .iter()
      .enumerate()
      .find(|(_, e)| e.name.as_deref() == Some(name))
  }
}

impl BuiltinType {
  /// Wire name of this builtin.
  pub fn name(&self) -> &'static str {
    match self {
      BuiltinType::Bool => "Bool",
      BuiltinType::I8 => "I8",
      BuiltinType::U8 => "U8",
      BuiltinType::I16 => "I16",
      BuiltinType::U16 => "U16",
      BuiltinType::I32 => "I32",
      BuiltinType::U32 => "U32",
      BuiltinType::I64 => "I64",
      BuiltinType::U64 => "U64",
      BuiltinType::F32 => "F32",
      BuiltinType::F64 => "F64",
      BuiltinType::String => "String",
      BuiltinType::Array(_) => "Array",
      BuiltinType::Map(_) => "Map",
    }
  }

  const NAMES: &'static [&'static str] = &[
    "Bool", "I8", "U8", "I16", "U16", "I32", "U32", "I64", "U64", "F32", "F64", "String", "Array",
    "Map",
  ];

  fn is_builtin_name(name: &str) -> bool {
    Self::NAMES.contains(&name) || name == "I128" || name == "U128"
  }
}

impl AlgebraicType {
  pub fn sum(variants: Vec<SumTypeVariant>) -> Self {
    Self::Sum(SumType::new(variants))
  }

  pub fn product(elements: Vec<ProductTypeElement>) -> Self {
    Self::Product(ProductType::new(elements))
  }

  /// The empty product `()`.
  pub fn unit() -> Self {
    Self::product(Vec::new())
  }

  /// The empty sum, which has no values.
  pub fn never() -> Self {
    Self::sum(Vec::new())
  }

  /// `(some: T | none: ())`
  pub fn option(some: AlgebraicType) -> Self {
    Self::sum(vec![
      SumTypeVariant::new("some", some),
      SumTypeVariant::new("none", Self::unit()),
    ])
  }

  pub fn bool() -> Self {
    Self::Builtin(BuiltinType::Bool)
  }
  pub fn i8() -> Self {
    Self::Builtin(BuiltinType::I8)
  }
  pub fn u8() -> Self {
    Self::Builtin(BuiltinType::U8)
  }
  pub fn i16() -> Self {
    Self::Builtin(BuiltinType::I16)
  }
  pub fn u16() -> Self {
    Self::Builtin(BuiltinType::U16)
  }
  pub fn i32() -> Self {
    Self::Builtin(BuiltinType::I32)
  }
  pub fn u32() -> Self {
    Self::Builtin(BuiltinType::U32)
  }
  pub fn i64() -> Self {
    Self::Builtin(BuiltinType::I64)
  }
  pub fn u64() -> Self {
    Self::Builtin(BuiltinType::U64)
  }
  pub fn f32() -> Self {
    Self::Builtin(BuiltinType::F32)
  }
  pub fn f64() -> Self {
    Self::Builtin(BuiltinType::F64)
  }
  pub fn string() -> Self {
    Self::Builtin(BuiltinType::String)
  }

  pub fn array(element: AlgebraicType) -> Self {
    Self::Builtin(BuiltinType::Array(Box::new(element)))
  }

  pub fn map(key: AlgebraicType, value: AlgebraicType) -> Self {
    Self::Builtin(BuiltinType::Map(Box::new(MapType { key_ty: key, ty: value })))
  }

  pub fn reference(r: AlgebraicTypeRef) -> Self {
    Self::Ref(r)
  }

  pub fn is_sum(&self) -> bool {
    matches!(self, Self::Sum(_))
  }

  pub fn is_product(&self) -> bool {
    matches!(self, Self::Product(_))
  }

  pub fn is_builtin(&self) -> bool {
    matches!(self, Self::Builtin(_))
  }

  pub fn is_ref(&self) -> bool {
    matches!(self, Self::Ref(_))
  }

  pub fn as_sum(&self) -> Option<&SumType> {
    match self {
      Self::Sum(s) => Some(s),
      _ => None,
    }
  }

  pub fn as_product(&self) -> Option<&ProductType> {
    match self {
      Self::Product(p) => Some(p),
      _ => None,
    }
  }

  pub fn as_builtin(&self) -> Option<&BuiltinType> {
    match self {
      Self::Builtin(b) => Some(b),
      _ => None,
    }
  }

  pub fn as_type_ref(&self) -> Option<AlgebraicTypeRef> {
    match self {
      Self::Ref(r) => Some(*r),
      _ => None,
    }
  }

  /// Short description used in error messages.
  pub fn describe(&self) -> String {
    match self {
      Self::Sum(s) => format!("sum with {} variants", s.variants.len()),
      Self::Product(p) => format!("product with {} elements", p.elements.len()),
      Self::Builtin(b) => b.name().to_string(),
      Self::Ref(r) => format!("ref {r}"),
    }
  }
}

impl From<BuiltinType> for AlgebraicType {
  fn from(b: BuiltinType) -> Self {
    Self::Builtin(b)
  }
}

impl From<ProductType> for AlgebraicType {
  fn from(p: ProductType) -> Self {
    Self::Product(p)
  }
}

impl From<SumType> for AlgebraicType {
  fn from(s: SumType) -> Self {
    Self::Sum(s)
  }
}

// ── Wire form ────────────────────────────────────────────────────────

impl Serialize for BuiltinType {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(1))?;
    match self {
      BuiltinType::Array(elem) => map.serialize_entry("Array", &**elem)?,
      BuiltinType::Map(m) => map.serialize_entry("Map", &**m)?,
      other => map.serialize_entry(other.name(), &[(); 0])?,
    }
    map.end()
  }
}

/// Decode the payload of a builtin once its key has been read.
fn builtin_from_entry<'de, A: MapAccess<'de>>(
  key: &str,
  map: &mut A,
) -> Result<BuiltinType, A::Error> {
  let builtin = match key {
    "Array" => BuiltinType::Array(Box::new(map.next_value()?)),
    "Map" => BuiltinType::Map(Box::new(map.next_value()?)),
    "I128" | "U128" => {
      return Err(de::Error::custom(crate::value::ValueError::UnsupportedType(key.to_string())));
    }
    _ => {
      map.next_value::<IgnoredAny>()?;
      match key {
        "Bool" => BuiltinType::Bool,
        "I8" => BuiltinType::I8,
        "U8" => BuiltinType::U8,
        "I16" => BuiltinType::I16,
        "U16" => BuiltinType::U16,
        "I32" => BuiltinType::I32,
        "U32" => BuiltinType::U32,
        "I64" => BuiltinType::I64,
        "U64" => BuiltinType::U64,
        "F32" => BuiltinType::F32,
        "F64" => BuiltinType::F64,
        "String" => BuiltinType::String,
        other => return Err(de::Error::unknown_variant(other, BuiltinType::NAMES)),
      }
    }
  };
  Ok(builtin)
}

impl<'de> Deserialize<'de> for BuiltinType {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct BuiltinVisitor;

    impl<'de> Visitor<'de> for BuiltinVisitor {
      type Value = BuiltinType;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a single-key builtin type object")
      }

      fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<BuiltinType, A::Error> {
        let key: String = map
          .next_key()?
          .ok_or_else(|| de::Error::custom("empty builtin type object"))?;
        let builtin = builtin_from_entry(&key, &mut map)?;
        expect_single_key(&mut map, "builtin type")?;
        Ok(builtin)
      }
    }

    deserializer.deserialize_map(BuiltinVisitor)
  }
}

impl Serialize for AlgebraicType {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(1))?;
    match self {
      AlgebraicType::Sum(s) => map.serialize_entry("Sum", s)?,
      AlgebraicType::Product(p) => map.serialize_entry("Product", p)?,
      AlgebraicType::Builtin(b) => map.serialize_entry("Builtin", b)?,
      AlgebraicType::Ref(r) => map.serialize_entry("Ref", r)?,
    }
    map.end()
  }
}

impl<'de> Deserialize<'de> for AlgebraicType {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct TypeVisitor;

    impl<'de> Visitor<'de> for TypeVisitor {
      type Value = AlgebraicType;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a single-key algebraic type object")
      }

      fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<AlgebraicType, A::Error> {
        let key: String = map
          .next_key()?
          .ok_or_else(|| de::Error::custom("empty algebraic type object"))?;
        let ty = match key.as_str() {
          "Sum" => AlgebraicType::Sum(map.next_value()?),
          "Product" => AlgebraicType::Product(map.next_value()?),
          "Builtin" => AlgebraicType::Builtin(map.next_value()?),
          "Ref" => AlgebraicType::Ref(map.next_value()?),
          // The server flattens builtins into the type itself.
          flat if BuiltinType::is_builtin_name(flat) => {
            AlgebraicType::Builtin(builtin_from_entry(flat, &mut map)?)
          }
          other => {
            return Err(de::Error::unknown_variant(
              other,
              &["Sum", "Product", "Builtin", "Ref"],
            ))
          }
        };
        expect_single_key(&mut map, "algebraic type")?;
        Ok(ty)
      }
    }

    deserializer.deserialize_map(TypeVisitor)
  }
}
