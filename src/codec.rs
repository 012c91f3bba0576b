// Copyright 2025 Cowboy AI, LLC.

//! JSON codec for integration event bodies
//!
//! Bodies are written as indented JSON. Reading is lenient about the casing of
//! object keys: a key that does not match a struct field exactly is matched
//! against the field names ignoring ASCII case, so `OrderId`, `orderid` and
//! `orderId` all populate a field serialized as `orderId`. Exact matches win
//! over case-folded ones.
//!
//! Case folding applies to structs reached through objects, sequences, options
//! and newtypes. Enum variant contents are read as-is.

use serde::de::{self, DeserializeOwned, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::{Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors raised while encoding or decoding event bodies
#[derive(Debug, Error)]
pub enum CodecError {
    /// The event could not be written as JSON
    #[error("Failed to encode {type_name}: {reason}")]
    Encode {
        /// Rust type being encoded
        type_name: &'static str,
        /// Underlying serializer message
        reason: String,
    },

    /// The body could not be read into the target type
    #[error("Failed to decode {type_name}: {reason}")]
    Decode {
        /// Rust type being decoded
        type_name: &'static str,
        /// Underlying deserializer message
        reason: String,
    },
}

/// Encode a value as an indented JSON body
pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec_pretty(value).map_err(|e| CodecError::Encode {
        type_name: std::any::type_name::<T>(),
        reason: e.to_string(),
    })
}

/// Decode a JSON body, matching struct fields case-insensitively
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    let decode_error = |e: serde_json::Error| CodecError::Decode {
        type_name: std::any::type_name::<T>(),
        reason: e.to_string(),
    };
    let value: Value = serde_json::from_slice(body).map_err(decode_error)?;
    T::deserialize(CaseInsensitive(value)).map_err(decode_error)
}

/// Deserializer over a parsed JSON value that folds key casing onto struct fields
struct CaseInsensitive(Value);

impl<'de> Deserializer<'de> for CaseInsensitive {
    type Error = serde_json::Error;

    fn deserialize_any<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Array(items) => visitor.visit_seq(Elements {
                iter: items.into_iter(),
            }),
            Value::Object(map) => visitor.visit_map(Entries::new(map)),
            other => other.deserialize_any(visitor),
        }
    }

    fn deserialize_option<V>(self, visitor: V) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Null => visitor.visit_none(),
            other => visitor.visit_some(CaseInsensitive(other)),
        }
    }

    fn deserialize_newtype_struct<V>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_struct<V>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        match self.0 {
            Value::Object(map) => visitor.visit_map(Entries::new(fold_keys(map, fields))),
            other => other.deserialize_struct(name, fields, visitor),
        }
    }

    fn deserialize_enum<V>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, Self::Error>
    where
        V: Visitor<'de>,
    {
        self.0.deserialize_enum(name, variants, visitor)
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct seq tuple tuple_struct map identifier
        ignored_any
    }
}

/// Rename keys onto the declared field names, ignoring ASCII case
fn fold_keys(map: Map<String, Value>, fields: &[&str]) -> Map<String, Value> {
    let mut folded = Map::with_capacity(map.len());
    let mut inexact = Vec::new();

    for (key, value) in map {
        if fields.contains(&key.as_str()) {
            folded.insert(key, value);
        } else {
            let target = fields
                .iter()
                .find(|field| field.eq_ignore_ascii_case(&key))
                .map(|field| (*field).to_string())
                .unwrap_or(key);
            inexact.push((target, value));
        }
    }

    for (key, value) in inexact {
        folded.entry(key).or_insert(value);
    }
    folded
}

struct Entries {
    iter: serde_json::map::IntoIter,
    pending: Option<Value>,
}

impl Entries {
    fn new(map: Map<String, Value>) -> Self {
        Self {
            iter: map.into_iter(),
            pending: None,
        }
    }
}

impl<'de> MapAccess<'de> for Entries {
    type Error = serde_json::Error;

    fn next_key_seed<K>(&mut self, seed: K) -> Result<Option<K::Value>, Self::Error>
    where
        K: DeserializeSeed<'de>,
    {
        match self.iter.next() {
            Some((key, value)) => {
                self.pending = Some(value);
                seed.deserialize(Value::String(key)).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V>(&mut self, seed: V) -> Result<V::Value, Self::Error>
    where
        V: DeserializeSeed<'de>,
    {
        match self.pending.take() {
            Some(value) => seed.deserialize(CaseInsensitive(value)),
            None => Err(de::Error::custom("map value requested before its key")),
        }
    }
}

struct Elements {
    iter: std::vec::IntoIter<Value>,
}

impl<'de> SeqAccess<'de> for Elements {
    type Error = serde_json::Error;

    fn next_element_seed<T>(&mut self, seed: T) -> Result<Option<T::Value>, Self::Error>
    where
        T: DeserializeSeed<'de>,
    {
        self.iter
            .next()
            .map(|value| seed.deserialize(CaseInsensitive(value)))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}
