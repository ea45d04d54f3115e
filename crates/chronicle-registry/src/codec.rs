//! The payload codec.
//!
//! Converts between user payload aggregates (plain serde structs) and the
//! [`PayloadValue`] tree that envelopes persist. The serde data model is the
//! field-tag schema: a struct's field names - after `#[serde(rename)]` - are
//! the serialization keys, and the supported field kinds are exactly the
//! kinds [`PayloadValue`] can represent.
//!
//! Coercion policy on decode: floats stored as 64-bit decode into both `f32`
//! and `f64` fields; integers stay inside their signedness domain and narrow
//! only when the value fits. Everything else is a mismatch, reported with the
//! offending field key.

use std::fmt;

use serde::de::{DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, Visitor};
use serde::ser::{Impossible, SerializeMap, SerializeStruct};
use serde::Serialize;

use chronicle_types::{PayloadKind, PayloadMap, PayloadValue};

/// Placeholder key used when a failure cannot be pinned to a field.
const NO_KEY: &str = "<payload>";

//─────────────────────────────
//  Error type
//─────────────────────────────

/// Errors produced while converting payload aggregates to and from the
/// payload value model.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CodecError {
    /// A field the aggregate requires was absent from the payload map.
    #[error("payload field '{0}' is missing")]
    MissingField(String),
    /// A payload value had the wrong kind (or range) for its target field.
    #[error("payload field '{key}' cannot decode as {expected}")]
    TypeMismatch {
        /// Serialization key of the offending field.
        key: String,
        /// Human-readable description of the expected target.
        expected: &'static str,
    },
    /// The aggregate contains a field kind the payload model cannot carry.
    #[error("payload field '{key}' has unsupported kind: {kind}")]
    UnsupportedField {
        /// Serialization key of the offending field.
        key: String,
        /// The unsupported kind, e.g. "sequence" or "optional field".
        kind: String,
    },
    /// The value at the top level was not a map of named fields.
    #[error("payload must be a structured aggregate, got {0}")]
    NotAnAggregate(PayloadKind),
    /// Any other serde-reported failure.
    #[error("payload codec: {0}")]
    Message(String),
}

impl CodecError {
    fn unsupported(kind: impl Into<String>) -> Self {
        CodecError::UnsupportedField {
            key: NO_KEY.to_string(),
            kind: kind.into(),
        }
    }

    /// Attribute the error to `key` unless an inner field already claimed it.
    fn for_key(self, key: &str) -> Self {
        match self {
            CodecError::UnsupportedField { key: old, kind } if old == NO_KEY => {
                CodecError::UnsupportedField {
                    key: key.to_string(),
                    kind,
                }
            }
            CodecError::TypeMismatch { key: old, expected } if old == NO_KEY => {
                CodecError::TypeMismatch {
                    key: key.to_string(),
                    expected,
                }
            }
            other => other,
        }
    }
}

impl serde::ser::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Message(msg.to_string())
    }
}

impl serde::de::Error for CodecError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        CodecError::Message(msg.to_string())
    }

    fn missing_field(field: &'static str) -> Self {
        CodecError::MissingField(field.to_string())
    }
}

//─────────────────────────────
//  Entry points
//─────────────────────────────

/// Serialize a value into a single payload value.
pub fn to_payload<T: Serialize + ?Sized>(value: &T) -> Result<PayloadValue, CodecError> {
    value.serialize(ValueSerializer)
}

/// Serialize an aggregate into a payload map.
///
/// Fails with [`CodecError::NotAnAggregate`] when the value serializes to a
/// bare scalar instead of a map of named fields.
pub fn to_payload_map<T: Serialize + ?Sized>(value: &T) -> Result<PayloadMap, CodecError> {
    match to_payload(value)? {
        PayloadValue::Map(map) => Ok(map),
        other => Err(CodecError::NotAnAggregate(other.kind())),
    }
}

/// Deserialize an aggregate from a payload map.
pub fn from_payload_map<T: DeserializeOwned>(map: &PayloadMap) -> Result<T, CodecError> {
    T::deserialize(MapRootDeserializer { map })
}

//─────────────────────────────
//  Serializer
//─────────────────────────────

struct ValueSerializer;

impl serde::Serializer for ValueSerializer {
    type Ok = PayloadValue;
    type Error = CodecError;

    type SerializeSeq = Impossible<PayloadValue, CodecError>;
    type SerializeTuple = Impossible<PayloadValue, CodecError>;
    type SerializeTupleStruct = Impossible<PayloadValue, CodecError>;
    type SerializeTupleVariant = Impossible<PayloadValue, CodecError>;
    type SerializeMap = MapSerializer;
    type SerializeStruct = StructSerializer;
    type SerializeStructVariant = Impossible<PayloadValue, CodecError>;

    fn serialize_bool(self, v: bool) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Int(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Int(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Int(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Int(v))
    }

    fn serialize_i128(self, _v: i128) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("i128"))
    }

    fn serialize_u8(self, v: u8) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::UInt(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::UInt(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::UInt(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::UInt(v))
    }

    fn serialize_u128(self, _v: u128) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("u128"))
    }

    fn serialize_f32(self, v: f32) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Float(v.into()))
    }

    fn serialize_f64(self, v: f64) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Float(v))
    }

    fn serialize_char(self, _v: char) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("char"))
    }

    fn serialize_str(self, v: &str) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::String(v.to_string()))
    }

    fn serialize_bytes(self, _v: &[u8]) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("bytes"))
    }

    fn serialize_none(self) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("optional field"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("optional field"))
    }

    fn serialize_unit(self) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("unit"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("unit struct"))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("enum"))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<PayloadValue, CodecError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<PayloadValue, CodecError> {
        Err(CodecError::unsupported("enum"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CodecError> {
        Err(CodecError::unsupported("sequence"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CodecError> {
        Err(CodecError::unsupported("tuple"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CodecError> {
        Err(CodecError::unsupported("tuple struct"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CodecError> {
        Err(CodecError::unsupported("enum"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CodecError> {
        Ok(MapSerializer {
            map: PayloadMap::new(),
            next_key: None,
        })
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CodecError> {
        Ok(StructSerializer {
            map: PayloadMap::new(),
        })
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CodecError> {
        Err(CodecError::unsupported("enum"))
    }
}

struct StructSerializer {
    map: PayloadMap,
}

impl SerializeStruct for StructSerializer {
    type Ok = PayloadValue;
    type Error = CodecError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), CodecError> {
        let encoded = value.serialize(ValueSerializer).map_err(|e| e.for_key(key))?;
        self.map.insert(key.to_string(), encoded);
        Ok(())
    }

    fn end(self) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Map(self.map))
    }
}

struct MapSerializer {
    map: PayloadMap,
    next_key: Option<String>,
}

impl SerializeMap for MapSerializer {
    type Ok = PayloadValue;
    type Error = CodecError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), CodecError> {
        self.next_key = Some(key.serialize(KeySerializer)?);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), CodecError> {
        let key = self
            .next_key
            .take()
            .ok_or_else(|| CodecError::Message("map value serialized before its key".into()))?;
        let encoded = value
            .serialize(ValueSerializer)
            .map_err(|e| e.for_key(&key))?;
        self.map.insert(key, encoded);
        Ok(())
    }

    fn end(self) -> Result<PayloadValue, CodecError> {
        Ok(PayloadValue::Map(self.map))
    }
}

/// Accepts exactly string keys; everything else cannot name a payload field.
struct KeySerializer;

macro_rules! non_string_key {
    ($($method:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method(self, _v: $ty) -> Result<String, CodecError> {
                Err(CodecError::unsupported("non-string map key"))
            }
        )*
    };
}

impl serde::Serializer for KeySerializer {
    type Ok = String;
    type Error = CodecError;

    type SerializeSeq = Impossible<String, CodecError>;
    type SerializeTuple = Impossible<String, CodecError>;
    type SerializeTupleStruct = Impossible<String, CodecError>;
    type SerializeTupleVariant = Impossible<String, CodecError>;
    type SerializeMap = Impossible<String, CodecError>;
    type SerializeStruct = Impossible<String, CodecError>;
    type SerializeStructVariant = Impossible<String, CodecError>;

    fn serialize_str(self, v: &str) -> Result<String, CodecError> {
        Ok(v.to_string())
    }

    non_string_key! {
        serialize_bool: bool,
        serialize_i8: i8,
        serialize_i16: i16,
        serialize_i32: i32,
        serialize_i64: i64,
        serialize_u8: u8,
        serialize_u16: u16,
        serialize_u32: u32,
        serialize_u64: u64,
        serialize_f32: f32,
        serialize_f64: f64,
        serialize_char: char,
        serialize_bytes: &[u8],
    }

    fn serialize_none(self) -> Result<String, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_some<T: Serialize + ?Sized>(self, _value: &T) -> Result<String, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_unit(self) -> Result<String, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<String, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
    ) -> Result<String, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        value: &T,
    ) -> Result<String, CodecError> {
        value.serialize(self)
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<String, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_tuple_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleStruct, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_struct(
        self,
        _name: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStruct, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant, CodecError> {
        Err(CodecError::unsupported("non-string map key"))
    }
}

//─────────────────────────────
//  Deserializer
//─────────────────────────────

/// Root deserializer over a borrowed payload map.
struct MapRootDeserializer<'de> {
    map: &'de PayloadMap,
}

impl<'de> serde::Deserializer<'de> for MapRootDeserializer<'de> {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        visitor.visit_map(MapWalker::new(self.map))
    }

    serde::forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf option unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier ignored_any
    }
}

/// Deserializer over one payload value, tagged with its field key for
/// diagnostics.
struct ValueDeserializer<'de> {
    value: &'de PayloadValue,
    key: &'de str,
}

impl<'de> ValueDeserializer<'de> {
    fn mismatch(&self, expected: &'static str) -> CodecError {
        CodecError::TypeMismatch {
            key: self.key.to_string(),
            expected,
        }
    }
}

macro_rules! deserialize_signed {
    ($($method:ident => $visit:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
                match self.value {
                    PayloadValue::Int(v) => {
                        let narrowed =
                            <$ty>::try_from(*v).map_err(|_| self.mismatch(stringify!($ty)))?;
                        visitor.$visit(narrowed)
                    }
                    _ => Err(self.mismatch(stringify!($ty))),
                }
            }
        )*
    };
}

macro_rules! deserialize_unsigned {
    ($($method:ident => $visit:ident: $ty:ty),* $(,)?) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
                match self.value {
                    PayloadValue::UInt(v) => {
                        let narrowed =
                            <$ty>::try_from(*v).map_err(|_| self.mismatch(stringify!($ty)))?;
                        visitor.$visit(narrowed)
                    }
                    _ => Err(self.mismatch(stringify!($ty))),
                }
            }
        )*
    };
}

impl<'de> serde::Deserializer<'de> for ValueDeserializer<'de> {
    type Error = CodecError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        match self.value {
            PayloadValue::String(s) => visitor.visit_str(s),
            PayloadValue::Bool(b) => visitor.visit_bool(*b),
            PayloadValue::Int(v) => visitor.visit_i64(*v),
            PayloadValue::UInt(v) => visitor.visit_u64(*v),
            PayloadValue::Float(v) => visitor.visit_f64(*v),
            PayloadValue::Map(m) => visitor.visit_map(MapWalker::new(m)),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        match self.value {
            PayloadValue::Bool(b) => visitor.visit_bool(*b),
            _ => Err(self.mismatch("bool")),
        }
    }

    deserialize_signed! {
        deserialize_i8 => visit_i8: i8,
        deserialize_i16 => visit_i16: i16,
        deserialize_i32 => visit_i32: i32,
        deserialize_i64 => visit_i64: i64,
    }

    deserialize_unsigned! {
        deserialize_u8 => visit_u8: u8,
        deserialize_u16 => visit_u16: u16,
        deserialize_u32 => visit_u32: u32,
        deserialize_u64 => visit_u64: u64,
    }

    fn deserialize_i128<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("i128").for_key(self.key))
    }

    fn deserialize_u128<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("u128").for_key(self.key))
    }

    // Floats are persisted at 64 bit; both target widths accept them.
    fn deserialize_f32<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        match self.value {
            PayloadValue::Float(v) => visitor.visit_f32(*v as f32),
            _ => Err(self.mismatch("f32")),
        }
    }

    fn deserialize_f64<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        match self.value {
            PayloadValue::Float(v) => visitor.visit_f64(*v),
            _ => Err(self.mismatch("f64")),
        }
    }

    fn deserialize_char<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("char").for_key(self.key))
    }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        match self.value {
            PayloadValue::String(s) => visitor.visit_str(s),
            _ => Err(self.mismatch("string")),
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_bytes<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("bytes").for_key(self.key))
    }

    fn deserialize_byte_buf<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("bytes").for_key(self.key))
    }

    fn deserialize_option<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("optional field").for_key(self.key))
    }

    fn deserialize_unit<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("unit").for_key(self.key))
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _visitor: V,
    ) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("unit struct").for_key(self.key))
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_seq<V: Visitor<'de>>(self, _visitor: V) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("sequence").for_key(self.key))
    }

    fn deserialize_tuple<V: Visitor<'de>>(
        self,
        _len: usize,
        _visitor: V,
    ) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("tuple").for_key(self.key))
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _len: usize,
        _visitor: V,
    ) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("tuple struct").for_key(self.key))
    }

    fn deserialize_map<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        match self.value {
            PayloadValue::Map(m) => visitor.visit_map(MapWalker::new(m)),
            _ => Err(self.mismatch("a nested map")),
        }
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _fields: &'static [&'static str],
        visitor: V,
    ) -> Result<V::Value, CodecError> {
        match self.value {
            PayloadValue::Map(m) => visitor.visit_map(MapWalker::new(m)),
            _ => Err(self.mismatch("a nested aggregate")),
        }
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        _name: &'static str,
        _variants: &'static [&'static str],
        _visitor: V,
    ) -> Result<V::Value, CodecError> {
        Err(CodecError::unsupported("enum").for_key(self.key))
    }

    fn deserialize_identifier<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.deserialize_str(visitor)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value, CodecError> {
        self.deserialize_any(visitor)
    }
}

/// `MapAccess` over the entries of a borrowed payload map.
struct MapWalker<'de> {
    iter: std::collections::btree_map::Iter<'de, String, PayloadValue>,
    pending: Option<(&'de String, &'de PayloadValue)>,
}

impl<'de> MapWalker<'de> {
    fn new(map: &'de PayloadMap) -> Self {
        Self {
            iter: map.iter(),
            pending: None,
        }
    }
}

impl<'de> MapAccess<'de> for MapWalker<'de> {
    type Error = CodecError;

    fn next_key_seed<K: DeserializeSeed<'de>>(
        &mut self,
        seed: K,
    ) -> Result<Option<K::Value>, CodecError> {
        match self.iter.next() {
            Some(entry) => {
                self.pending = Some(entry);
                seed.deserialize(entry.0.as_str().into_deserializer()).map(Some)
            }
            None => Ok(None),
        }
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value, CodecError> {
        let (key, value) = self
            .pending
            .take()
            .ok_or_else(|| CodecError::Message("map value requested before its key".into()))?;
        seed.deserialize(ValueDeserializer { value, key })
    }

    fn size_hint(&self) -> Option<usize> {
        let (lower, upper) = self.iter.size_hint();
        upper.filter(|&u| u == lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Money {
        currency: String,
        cents: u64,
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct OrderPlaced {
        #[serde(rename = "order_id")]
        id: String,
        items: u32,
        discount: f32,
        weight: f64,
        delta: i32,
        express: bool,
        total: Money,
    }

    fn sample() -> OrderPlaced {
        OrderPlaced {
            id: "o-77".to_string(),
            items: 3,
            discount: 0.25,
            weight: 1.75,
            delta: -4,
            express: true,
            total: Money {
                currency: "EUR".to_string(),
                cents: 1299,
            },
        }
    }

    #[test]
    fn aggregate_encodes_to_tagged_map() {
        let map = to_payload_map(&sample()).unwrap();
        assert_eq!(map["order_id"], PayloadValue::from("o-77"));
        assert_eq!(map["items"], PayloadValue::UInt(3));
        assert_eq!(map["delta"], PayloadValue::Int(-4));
        assert_eq!(map["express"], PayloadValue::Bool(true));
        // Both float widths widen to 64 bit.
        assert_eq!(map["discount"], PayloadValue::Float(0.25));
        assert_eq!(map["weight"], PayloadValue::Float(1.75));
        // Nested aggregates become nested maps.
        let total = map["total"].as_map().unwrap();
        assert_eq!(total["cents"], PayloadValue::UInt(1299));
    }

    #[test]
    fn aggregate_roundtrips() {
        let original = sample();
        let map = to_payload_map(&original).unwrap();
        let decoded: OrderPlaced = from_payload_map(&map).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn scalar_at_top_level_is_not_an_aggregate() {
        let err = to_payload_map(&42_u32).unwrap_err();
        assert_eq!(err, CodecError::NotAnAggregate(PayloadKind::UInt));
    }

    #[test]
    fn missing_field_names_the_key() {
        let mut map = to_payload_map(&sample()).unwrap();
        map.remove("items");
        let err = from_payload_map::<OrderPlaced>(&map).unwrap_err();
        assert_eq!(err, CodecError::MissingField("items".to_string()));
    }

    #[test]
    fn wrong_kind_names_key_and_expectation() {
        let mut map = to_payload_map(&sample()).unwrap();
        map.insert("express".to_string(), PayloadValue::from("yes"));
        let err = from_payload_map::<OrderPlaced>(&map).unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                key: "express".to_string(),
                expected: "bool",
            }
        );
    }

    #[test]
    fn integer_domains_do_not_cross() {
        let mut map = to_payload_map(&sample()).unwrap();
        // items is u32 but arrives as a signed value
        map.insert("items".to_string(), PayloadValue::Int(3));
        let err = from_payload_map::<OrderPlaced>(&map).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { ref key, .. } if key == "items"));

        let mut map = to_payload_map(&sample()).unwrap();
        // delta is i32 but arrives unsigned
        map.insert("delta".to_string(), PayloadValue::UInt(4));
        let err = from_payload_map::<OrderPlaced>(&map).unwrap_err();
        assert!(matches!(err, CodecError::TypeMismatch { ref key, .. } if key == "delta"));
    }

    #[test]
    fn narrowing_out_of_range_is_a_mismatch() {
        #[derive(Debug, Deserialize)]
        struct Tiny {
            n: u8,
        }
        let mut map = PayloadMap::new();
        map.insert("n".to_string(), PayloadValue::UInt(300));
        let err = from_payload_map::<Tiny>(&map).unwrap_err();
        assert_eq!(
            err,
            CodecError::TypeMismatch {
                key: "n".to_string(),
                expected: "u8",
            }
        );
    }

    #[test]
    fn float_decodes_into_both_widths() {
        #[derive(Debug, PartialEq, Deserialize)]
        struct Widths {
            narrow: f32,
            wide: f64,
        }
        let mut map = PayloadMap::new();
        map.insert("narrow".to_string(), PayloadValue::Float(2.5));
        map.insert("wide".to_string(), PayloadValue::Float(2.5));
        let decoded: Widths = from_payload_map(&map).unwrap();
        assert_eq!(decoded.narrow, 2.5_f32);
        assert_eq!(decoded.wide, 2.5_f64);
    }

    #[test]
    fn unsupported_kinds_are_rejected_on_encode() {
        #[derive(Serialize)]
        struct WithSeq {
            tags: Vec<String>,
        }
        let err = to_payload_map(&WithSeq { tags: vec![] }).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnsupportedField {
                key: "tags".to_string(),
                kind: "sequence".to_string(),
            }
        );

        #[derive(Serialize)]
        struct WithOpt {
            maybe: Option<u8>,
        }
        let err = to_payload_map(&WithOpt { maybe: Some(1) }).unwrap_err();
        assert_eq!(
            err,
            CodecError::UnsupportedField {
                key: "maybe".to_string(),
                kind: "optional field".to_string(),
            }
        );
    }

    #[test]
    fn nested_map_fields_pass_through() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct WithExtras {
            label: String,
            extras: std::collections::BTreeMap<String, String>,
        }
        let mut extras = std::collections::BTreeMap::new();
        extras.insert("region".to_string(), "eu-west".to_string());
        let original = WithExtras {
            label: "x".to_string(),
            extras,
        };
        let map = to_payload_map(&original).unwrap();
        let encoded = map["extras"].as_map().unwrap();
        assert_eq!(encoded["region"], PayloadValue::from("eu-west"));
        let decoded: WithExtras = from_payload_map(&map).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn unknown_payload_keys_are_ignored() {
        let mut map = to_payload_map(&sample()).unwrap();
        map.insert("stray".to_string(), PayloadValue::from("ignored"));
        let decoded: OrderPlaced = from_payload_map(&map).unwrap();
        assert_eq!(decoded, sample());
    }

    proptest! {
        #[test]
        fn roundtrip_holds_for_arbitrary_payloads(
            id in ".{0,24}",
            items in any::<u32>(),
            discount in any::<f32>().prop_filter("finite", |f| f.is_finite()),
            weight in any::<f64>().prop_filter("finite", |f| f.is_finite()),
            delta in any::<i32>(),
            express in any::<bool>(),
            currency in "[A-Z]{3}",
            cents in any::<u64>(),
        ) {
            let original = OrderPlaced {
                id,
                items,
                discount,
                weight,
                delta,
                express,
                total: Money { currency, cents },
            };
            let map = to_payload_map(&original).unwrap();
            let decoded: OrderPlaced = from_payload_map(&map).unwrap();
            prop_assert_eq!(decoded, original);
        }
    }
}
