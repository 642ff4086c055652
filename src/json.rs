//! SATS JSON conventions shared by the type, schema and protocol models.
//!
//! SATS encodes every sum as a single-key object. That covers its `Option`
//! (`{"some": x}` / `{"none": []}`) and unit variants (`{"User": []}`), which
//! serde would otherwise render as `null` and bare strings.

use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{self, DeserializeSeed, IgnoredAny, MapAccess, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer};
use serde_json::value::RawValue;

/// Consume the rest of a single-key object, failing if another key follows.
pub(crate) fn expect_single_key<'de, A>(map: &mut A, what: &str) -> Result<(), A::Error>
where
  A: MapAccess<'de>,
{
  match map.next_key::<String>()? {
    None => Ok(()),
    Some(extra) => Err(de::Error::custom(format!(
      "{what} must have exactly one key, found extra key `{extra}`"
    ))),
  }
}

/// An object with exactly one key, its value left as raw JSON. Repeated
/// keys count as extra keys.
#[derive(Debug)]
pub(crate) struct SingleKey<'a> {
  pub key: String,
  pub value: &'a RawValue,
}

impl<'de: 'a, 'a> Deserialize<'de> for SingleKey<'a> {
  fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
    struct V<'a>(PhantomData<&'a ()>);

    impl<'de: 'a, 'a> Visitor<'de> for V<'a> {
      type Value = SingleKey<'a>;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an object with exactly one key")
      }

      fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<SingleKey<'a>, A::Error> {
        let key: String = map
          .next_key()?
          .ok_or_else(|| de::Error::custom("expected exactly one key, found none"))?;
        let value: &'a RawValue = map.next_value()?;
        expect_single_key(&mut map, "envelope")?;
        Ok(SingleKey { key, value })
      }
    }

    deserializer.deserialize_map(V(PhantomData))
  }
}

/// Scan `text` for an object that repeats a key and return that object's
/// keys in wire order. `serde_json::Value` keeps only the last of repeated
/// keys, so this has to run on the text.
pub(crate) fn find_duplicate_keys(text: &str) -> serde_json::Result<Option<Vec<String>>> {
  let found = RefCell::new(None);
  let mut de = serde_json::Deserializer::from_str(text);
  let scanned = DuplicateScan(&found)
    .deserialize(&mut de)
    .and_then(|()| de.end());
  match (scanned, found.into_inner()) {
    (_, Some(keys)) => Ok(Some(keys)),
    (Ok(()), None) => Ok(None),
    (Err(e), None) => Err(e),
  }
}

#[derive(Clone, Copy)]
struct DuplicateScan<'a>(&'a RefCell<Option<Vec<String>>>);

impl<'de> DeserializeSeed<'de> for DuplicateScan<'_> {
  type Value = ();

  fn deserialize<D: Deserializer<'de>>(self, deserializer: D) -> Result<(), D::Error> {
    deserializer.deserialize_any(self)
  }
}

impl<'de> Visitor<'de> for DuplicateScan<'_> {
  type Value = ();

  fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
    f.write_str("any JSON value")
  }

  fn visit_bool<E: de::Error>(self, _: bool) -> Result<(), E> {
    Ok(())
  }

  fn visit_i64<E: de::Error>(self, _: i64) -> Result<(), E> {
    Ok(())
  }

  fn visit_u64<E: de::Error>(self, _: u64) -> Result<(), E> {
    Ok(())
  }

  fn visit_f64<E: de::Error>(self, _: f64) -> Result<(), E> {
    Ok(())
  }

  fn visit_str<E: de::Error>(self, _: &str) -> Result<(), E> {
    Ok(())
  }

  fn visit_unit<E: de::Error>(self) -> Result<(), E> {
    Ok(())
  }

  fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<(), A::Error> {
    while seq.next_element_seed(self)?.is_some() {}
    Ok(())
  }

  fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<(), A::Error> {
    let mut keys: Vec<String> = Vec::new();
    while let Some(key) = map.next_key::<String>()? {
      map.next_value_seed(self)?;
      let repeated = keys.contains(&key);
      keys.push(key);
      if repeated {
        *self.0.borrow_mut() = Some(keys);
        return Err(de::Error::custom("repeated object key"));
      }
    }
    Ok(())
  }
}

/// `Option<T>` as a SATS option sum.
pub(crate) mod option {
  use super::*;
  use serde::ser::SerializeMap;
  use serde::{Serialize, Serializer};

  pub fn serialize<T, S>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
  where
    T: Serialize,
    S: Serializer,
  {
    let mut map = serializer.serialize_map(Some(1))?;
    match value {
      Some(v) => map.serialize_entry("some", v)?,
      None => map.serialize_entry("none", &[(); 0])?,
    }
    map.end()
  }

  pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
  where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
  {
    struct OptionVisitor<T>(PhantomData<T>);

    impl<'de, T: Deserialize<'de>> de::Visitor<'de> for OptionVisitor<T> {
      type Value = Option<T>;

      fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an object with a single `some` or `none` key")
      }

      fn visit_unit<E: de::Error>(self) -> Result<Self::Value, E> {
        Ok(None)
      }

      fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
        let key: String = map
          .next_key()?
          .ok_or_else(|| de::Error::custom("empty option object"))?;
        let out = match key.as_str() {
          "some" => Some(map.next_value::<T>()?),
          "none" => {
            map.next_value::<IgnoredAny>()?;
            None
          }
          other => return Err(de::Error::unknown_variant(other, &["some", "none"])),
        };
        expect_single_key(&mut map, "option")?;
        Ok(out)
      }
    }

    deserializer.deserialize_any(OptionVisitor(PhantomData))
  }
}

/// Optional fields that arrive either bare (`5`, `null`, absent) or as a
/// SATS option (`{"some": 5}`, `{"none": []}`). Serialized bare.
pub(crate) mod lenient_option {
  use serde::de::DeserializeOwned;
  use serde::{Deserialize, Deserializer};
  use serde_json::Value;

  pub fn deserialize<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
  where
    T: DeserializeOwned,
    D: Deserializer<'de>,
  {
    let inner = match Value::deserialize(deserializer)? {
      Value::Null => return Ok(None),
      Value::Object(obj) if obj.len() == 1 && obj.contains_key("none") => return Ok(None),
      Value::Object(mut obj) if obj.len() == 1 && obj.contains_key("some") => {
        obj.remove("some").unwrap_or(Value::Null)
      }
      other => other,
    };
    serde_json::from_value(inner)
      .map(Some)
      .map_err(serde::de::Error::custom)
  }
}

/// Byte strings as lowercase hex.
pub(crate) mod hex_bytes {
  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&hex::encode(bytes))
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let s = String::deserialize(deserializer)?;
    hex::decode(s.trim_start_matches("0x")).map_err(serde::de::Error::custom)
  }
}

/// Declare a fieldless enum whose variants travel as `{"Variant": []}`.
macro_rules! unit_sum {
  (
    $(#[$meta:meta])*
    pub enum $name:ident { $( $(#[$vmeta:meta])* $variant:ident ),+ $(,)? }
  ) => {
    $(#[$meta])*
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum $name { $( $(#[$vmeta])* $variant ),+ }

    impl $name {
      pub const VARIANTS: &'static [&'static str] = &[$(stringify!($variant)),+];

      pub fn as_str(&self) -> &'static str {
        match self { $( Self::$variant => stringify!($variant) ),+ }
      }
    }

    impl ::serde::Serialize for $name {
      fn serialize<S: ::serde::Serializer>(&self, serializer: S) -> ::std::result::Result<S::Ok, S::Error> {
        use ::serde::ser::SerializeMap;
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(self.as_str(), &[(); 0])?;
        map.end()
      }
    }

    impl<'de> ::serde::Deserialize<'de> for $name {
      fn deserialize<D: ::serde::Deserializer<'de>>(deserializer: D) -> ::std::result::Result<Self, D::Error> {
        struct V;

        impl<'de> ::serde::de::Visitor<'de> for V {
          type Value = $name;

          fn expecting(&self, f: &mut ::std::fmt::Formatter) -> ::std::fmt::Result {
            write!(f, "a single-key {} object", stringify!($name))
          }

          fn visit_map<A: ::serde::de::MapAccess<'de>>(self, mut map: A) -> ::std::result::Result<$name, A::Error> {
            let key: String = map
              .next_key()?
              .ok_or_else(|| ::serde::de::Error::custom(concat!("empty ", stringify!($name), " object")))?;
            map.next_value::<::serde::de::IgnoredAny>()?;
            let out = match key.as_str() {
              $( stringify!($variant) => $name::$variant, )+
              other => return Err(::serde::de::Error::unknown_variant(other, $name::VARIANTS)),
            };
            $crate::json::expect_single_key(&mut map, stringify!($name))?;
            Ok(out)
          }
        }

        deserializer.deserialize_map(V)
      }
    }
  };
}

pub(crate) use unit_sum;
