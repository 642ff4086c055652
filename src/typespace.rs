//! Append-only registry of types addressed by [`AlgebraicTypeRef`].

use serde::{Deserialize, Serialize};

use crate::types::{AlgebraicType, AlgebraicTypeRef};
use crate::value::ValueError;

/// Types addressed by insertion order. Refs stay valid for the lifetime of
/// the typespace; nothing is ever removed or reordered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Typespace {
  types: Vec<AlgebraicType>,
}

impl Typespace {
  pub fn new() -> Self {
    Self::default()
  }

  /// Append a type and return the ref it is now addressed by.
  pub fn add_type(&mut self, ty: AlgebraicType) -> AlgebraicTypeRef {
    let idx = self.types.len();
    self.types.push(ty);
    AlgebraicTypeRef(idx as u32)
  }

  /// Bounds-checked lookup.
  pub fn get(&self, r: AlgebraicTypeRef) -> Option<&AlgebraicType> {
    self.types.get(r.idx())
  }

  pub fn len(&self) -> usize {
    self.types.len()
  }

  pub fn is_empty(&self) -> bool {
    self.types.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = (AlgebraicTypeRef, &AlgebraicType)> {
    self
      .types
      .iter()
      .enumerate()
      .map(|(i, ty)| (AlgebraicTypeRef(i as u32), ty))
  }

  /// Follow `Ref`s until a structural type is reached.
  pub fn resolve<'a>(&'a self, ty: &'a AlgebraicType) -> Result<&'a AlgebraicType, ValueError> {
    match ty {
      AlgebraicType::Ref(r) => self.resolve_ref(*r),
      other => Ok(other),
    }
  }

  /// Resolve `r` to the structural type it names. The result borrows only
  /// from the typespace.
  ///
  /// A chain longer than the typespace itself can only be a cycle of refs.
  pub fn resolve_ref(&self, r: AlgebraicTypeRef) -> Result<&AlgebraicType, ValueError> {
    let mut ty = self.get(r).ok_or(ValueError::UnresolvedRef(r.0))?;
    let mut hops = 1;
    while let AlgebraicType::Ref(next) = ty {
      if hops > self.types.len() {
        return Err(ValueError::CyclicRef(next.0));
      }
      ty = self.get(*next).ok_or(ValueError::UnresolvedRef(next.0))?;
      hops += 1;
    }
    Ok(ty)
  }
}

impl From<Vec<AlgebraicType>> for Typespace {
  fn from(types: Vec<AlgebraicType>) -> Self {
    Self { types }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::ProductTypeElement;

  #[test]
  fn refs_address_insertion_order() {
    let mut ts = Typespace::new();
    let added: Vec<_> = [AlgebraicType::u8(), AlgebraicType::string(), AlgebraicType::bool()]
      .into_iter()
      .map(|ty| (ts.add_type(ty.clone()), ty))
      .collect();

    for (i, (r, ty)) in added.iter().enumerate() {
      assert_eq!(r.0 as usize, i);
      assert_eq!(ts.get(*r), Some(ty));
    }
    assert_eq!(ts.get(AlgebraicTypeRef(3)), None);
    assert_eq!(ts.get(AlgebraicTypeRef(u32::MAX)), None);
  }

  #[test]
  fn negative_indices_never_resolve() {
    let mut ts = Typespace::new();
    ts.add_type(AlgebraicType::u8());
    assert!(AlgebraicTypeRef::try_from(-1i64).is_err());
    let r = AlgebraicTypeRef::try_from(0i64).unwrap();
    assert!(ts.get(r).is_some());
  }

  #[test]
  fn resolve_follows_refs() {
    let mut ts = Typespace::new();
    let row = ts.add_type(AlgebraicType::product(vec![ProductTypeElement::new(
      "name",
      AlgebraicType::string(),
    )]));
    let alias = ts.add_type(AlgebraicType::Ref(row));

    let resolved = ts.resolve_ref(alias).unwrap();
    assert!(resolved.is_product());

    let via_ref = ts.resolve(&AlgebraicType::Ref(alias)).map(|ty| ty.is_product());
    assert_eq!(via_ref, Ok(true));
  }

  #[test]
  fn resolve_detects_cycles_and_dangling_refs() {
    let mut ts = Typespace::new();
    ts.add_type(AlgebraicType::Ref(AlgebraicTypeRef(1)));
    ts.add_type(AlgebraicType::Ref(AlgebraicTypeRef(0)));

    let err = ts.resolve(&AlgebraicType::Ref(AlgebraicTypeRef(0))).unwrap_err();
    assert!(matches!(err, ValueError::CyclicRef(_)));

    let err = ts.resolve(&AlgebraicType::Ref(AlgebraicTypeRef(9))).unwrap_err();
    assert!(matches!(err, ValueError::UnresolvedRef(9)));

    let err = ts.resolve_ref(AlgebraicTypeRef(1)).unwrap_err();
    assert!(matches!(err, ValueError::CyclicRef(_)));
  }

  #[test]
  fn wire_form_is_types_array() {
    let mut ts = Typespace::new();
    ts.add_type(AlgebraicType::bool());
    let v = serde_json::to_value(&ts).unwrap();
    assert_eq!(v, serde_json::json!({"types": [{"Builtin": {"Bool": []}}]}));
  }
}
