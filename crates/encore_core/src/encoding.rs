//! Canonical encoding of call arguments.
//!
//! Any `Serialize` value is lowered into a [`CanonicalValue`] tree whose
//! shape depends only on content: maps are key-sorted, integers of every width
//! collapse into one variant and floats are normalized. The tree is then
//! encoded with postcard, which is byte-stable across platforms.

use serde::ser::{self, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Value-based, order-normalized form of an argument
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
pub enum CanonicalValue {
    /// `()`, `None` and unit structs without a name
    Unit,
    /// Boolean
    Bool(bool),
    /// Any integer width, signed or unsigned
    Int(i128),
    /// IEEE-754 bits of a normalized f64
    Float(u64),
    /// Strings and chars
    Str(String),
    /// Raw byte strings
    Bytes(Vec<u8>),
    /// Lists, tuples, arrays and sets in serialization order
    Seq(Vec<CanonicalValue>),
    /// Maps, sorted by canonical key
    Map(BTreeMap<CanonicalValue, CanonicalValue>),
    /// Named struct (field order is fixed by the type)
    Struct {
        /// Type name
        name: String,
        /// Field name / value pairs
        fields: Vec<(String, CanonicalValue)>,
    },
    /// Enum variant
    Variant {
        /// Enum name
        name: String,
        /// Variant name
        variant: String,
        /// Variant payload
        value: Box<CanonicalValue>,
    },
    /// Placeholder for a part that refused encoding; only built by
    /// [`to_canonical_lenient`]
    Unencodable(String),
}

impl CanonicalValue {
    fn float(v: f64) -> Self {
        let normalized = if v.is_nan() {
            f64::NAN
        } else if v == 0.0 {
            0.0
        } else {
            v
        };
        Self::Float(normalized.to_bits())
    }

    /// Whether any float in the tree is NaN or infinite
    #[must_use]
    pub fn has_non_finite(&self) -> bool {
        match self {
            Self::Float(bits) => !f64::from_bits(*bits).is_finite(),
            Self::Seq(items) => items.iter().any(Self::has_non_finite),
            Self::Map(entries) => entries
                .iter()
                .any(|(k, v)| k.has_non_finite() || v.has_non_finite()),
            Self::Struct { fields, .. } => fields.iter().any(|(_, v)| v.has_non_finite()),
            Self::Variant { value, .. } => value.has_non_finite(),
            _ => false,
        }
    }
}

impl fmt::Display for CanonicalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unit => write!(f, "None"),
            Self::Bool(b) => write!(f, "{}", b),
            Self::Int(i) => write!(f, "{}", i),
            Self::Float(bits) => write!(f, "{:?}", f64::from_bits(*bits)),
            Self::Str(s) => write!(f, "{:?}", s),
            Self::Bytes(b) => write!(f, "b\"{}\"", hex::encode(b)),
            Self::Seq(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", item)?;
                }
                write!(f, "]")
            }
            Self::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", k, v)?;
                }
                write!(f, "}}")
            }
            Self::Struct { name, fields } => {
                write!(f, "{}(", name)?;
                for (i, (field, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}={}", field, value)?;
                }
                write!(f, ")")
            }
            Self::Variant {
                name,
                variant,
                value,
            } => match value.as_ref() {
                Self::Unit => write!(f, "{}::{}", name, variant),
                inner => write!(f, "{}::{}({})", name, variant, inner),
            },
            Self::Unencodable(reason) => write!(f, "<unencodable: {}>", reason),
        }
    }
}

/// Encoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    /// The value refused canonical encoding
    #[error("{0}")]
    Custom(String),
    /// Integer outside the canonical range
    #[error("Integer {0} is outside the canonical range")]
    IntegerOverflow(u128),
    /// Map key could not be encoded
    #[error("Map key has no canonical encoding: {0}")]
    MapKey(String),
    /// Byte encoding of the canonical tree failed
    #[error("Canonical byte encoding failed: {0}")]
    Bytes(String),
}

impl ser::Error for EncodeError {
    fn custom<T: fmt::Display>(msg: T) -> Self {
        Self::Custom(msg.to_string())
    }
}

/// Lower any serializable value into its canonical tree
///
/// # Errors
///
/// Returns error if the value (or anything nested in it) refuses to serialize
pub fn to_canonical<T: Serialize + ?Sized>(value: &T) -> Result<CanonicalValue, EncodeError> {
    value.serialize(CanonicalSerializer { lenient: false })
}

/// Lower a value, replacing every part that refuses to serialize with
/// [`CanonicalValue::Unencodable`].
///
/// Maps are still key-sorted, so the [`Display`](fmt::Display) rendering of
/// the result is independent of iteration order.
pub fn to_canonical_lenient<T: Serialize + ?Sized>(value: &T) -> CanonicalValue {
    CanonicalSerializer { lenient: true }
        .lower(value)
        .unwrap_or_else(|e| CanonicalValue::Unencodable(e.to_string()))
}

/// Trait for canonical byte encoding
pub trait CanonicalEncode: Serialize {
    /// Encode to canonical bytes
    ///
    /// # Errors
    ///
    /// Returns error if postcard rejects the value
    fn canonical_bytes(&self) -> Result<Vec<u8>, EncodeError> {
        postcard::to_allocvec(self).map_err(|e| EncodeError::Bytes(e.to_string()))
    }
}

impl CanonicalEncode for CanonicalValue {}

/// Wrapper for values that must never be canonically encoded.
///
/// Closures, handles and other values without a stable content identity go
/// through here; hashing a call that carries one takes the string-rendering
/// fallback, which renders the refusal message carrying the label.
pub struct Opaque<T> {
    label: String,
    value: T,
}

impl<T> Opaque<T> {
    /// Wrap a value under a human-readable label
    pub fn new(label: impl Into<String>, value: T) -> Self {
        Self {
            label: label.into(),
            value,
        }
    }

    /// Label used in renderings
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Borrow the wrapped value
    pub fn get(&self) -> &T {
        &self.value
    }

    /// Unwrap the value
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> fmt::Debug for Opaque<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Opaque({})", self.label)
    }
}

impl<T> Serialize for Opaque<T> {
    fn serialize<S: ser::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
        Err(ser::Error::custom(format!(
            "opaque value `{}` has no canonical encoding",
            self.label
        )))
    }
}

#[derive(Clone, Copy)]
struct CanonicalSerializer {
    lenient: bool,
}

impl CanonicalSerializer {
    fn lower<T: Serialize + ?Sized>(self, value: &T) -> Result<CanonicalValue, EncodeError> {
        match value.serialize(self) {
            Err(e) if self.lenient => Ok(CanonicalValue::Unencodable(e.to_string())),
            other => other,
        }
    }
}

impl ser::Serializer for CanonicalSerializer {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    type SerializeSeq = SeqBuilder;
    type SerializeTuple = SeqBuilder;
    type SerializeTupleStruct = StructBuilder;
    type SerializeTupleVariant = VariantBuilder<SeqBuilder>;
    type SerializeMap = MapBuilder;
    type SerializeStruct = StructBuilder;
    type SerializeStructVariant = VariantBuilder<StructBuilder>;

    fn serialize_bool(self, v: bool) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Bool(v))
    }

    fn serialize_i8(self, v: i8) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_i16(self, v: i16) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_i32(self, v: i32) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_i64(self, v: i64) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_i128(self, v: i128) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v))
    }

    fn serialize_u8(self, v: u8) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_u16(self, v: u16) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_u32(self, v: u32) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_u64(self, v: u64) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Int(v.into()))
    }

    fn serialize_u128(self, v: u128) -> Result<CanonicalValue, EncodeError> {
        i128::try_from(v)
            .map(CanonicalValue::Int)
            .map_err(|_| EncodeError::IntegerOverflow(v))
    }

    fn serialize_f32(self, v: f32) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::float(f64::from(v)))
    }

    fn serialize_f64(self, v: f64) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::float(v))
    }

    fn serialize_char(self, v: char) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Str(v.to_string()))
    }

    fn serialize_str(self, v: &str) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Str(v.to_string()))
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Bytes(v.to_vec()))
    }

    fn serialize_none(self) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Unit)
    }

    fn serialize_some<T: Serialize + ?Sized>(self, value: &T) -> Result<CanonicalValue, EncodeError> {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Unit)
    }

    fn serialize_unit_struct(self, name: &'static str) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Struct {
            name: name.to_string(),
            fields: Vec::new(),
        })
    }

    fn serialize_unit_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Variant {
            name: name.to_string(),
            variant: variant.to_string(),
            value: Box::new(CanonicalValue::Unit),
        })
    }

    fn serialize_newtype_struct<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        value: &T,
    ) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Struct {
            name: name.to_string(),
            fields: vec![("0".to_string(), self.lower(value)?)],
        })
    }

    fn serialize_newtype_variant<T: Serialize + ?Sized>(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        value: &T,
    ) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Variant {
            name: name.to_string(),
            variant: variant.to_string(),
            value: Box::new(self.lower(value)?),
        })
    }

    fn serialize_seq(self, len: Option<usize>) -> Result<SeqBuilder, EncodeError> {
        Ok(SeqBuilder {
            ser: self,
            items: Vec::with_capacity(len.unwrap_or(0)),
        })
    }

    fn serialize_tuple(self, len: usize) -> Result<SeqBuilder, EncodeError> {
        self.serialize_seq(Some(len))
    }

    fn serialize_tuple_struct(self, name: &'static str, len: usize) -> Result<StructBuilder, EncodeError> {
        Ok(StructBuilder::new(self, name, len))
    }

    fn serialize_tuple_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantBuilder<SeqBuilder>, EncodeError> {
        Ok(VariantBuilder {
            name,
            variant,
            inner: SeqBuilder {
                ser: self,
                items: Vec::with_capacity(len),
            },
        })
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<MapBuilder, EncodeError> {
        Ok(MapBuilder {
            ser: self,
            entries: BTreeMap::new(),
            pending_key: None,
        })
    }

    fn serialize_struct(self, name: &'static str, len: usize) -> Result<StructBuilder, EncodeError> {
        Ok(StructBuilder::new(self, name, len))
    }

    fn serialize_struct_variant(
        self,
        name: &'static str,
        _variant_index: u32,
        variant: &'static str,
        len: usize,
    ) -> Result<VariantBuilder<StructBuilder>, EncodeError> {
        Ok(VariantBuilder {
            name,
            variant,
            inner: StructBuilder::new(self, variant, len),
        })
    }
}

struct SeqBuilder {
    ser: CanonicalSerializer,
    items: Vec<CanonicalValue>,
}

impl SeqBuilder {
    fn push<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.items.push(self.ser.lower(value)?);
        Ok(())
    }
}

impl ser::SerializeSeq for SeqBuilder {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value)
    }

    fn end(self) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Seq(self.items))
    }
}

impl ser::SerializeTuple for SeqBuilder {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    fn serialize_element<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.push(value)
    }

    fn end(self) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Seq(self.items))
    }
}

struct StructBuilder {
    ser: CanonicalSerializer,
    name: &'static str,
    fields: Vec<(String, CanonicalValue)>,
}

impl StructBuilder {
    fn new(ser: CanonicalSerializer, name: &'static str, len: usize) -> Self {
        Self {
            ser,
            name,
            fields: Vec::with_capacity(len),
        }
    }

    fn finish(self) -> CanonicalValue {
        CanonicalValue::Struct {
            name: self.name.to_string(),
            fields: self.fields,
        }
    }
}

impl ser::SerializeTupleStruct for StructBuilder {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        let position = self.fields.len().to_string();
        self.fields.push((position, self.ser.lower(value)?));
        Ok(())
    }

    fn end(self) -> Result<CanonicalValue, EncodeError> {
        Ok(self.finish())
    }
}

impl ser::SerializeStruct for StructBuilder {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        self.fields.push((key.to_string(), self.ser.lower(value)?));
        Ok(())
    }

    fn end(self) -> Result<CanonicalValue, EncodeError> {
        Ok(self.finish())
    }
}

struct VariantBuilder<B> {
    name: &'static str,
    variant: &'static str,
    inner: B,
}

impl<B> VariantBuilder<B> {
    fn wrap(name: &'static str, variant: &'static str, value: CanonicalValue) -> CanonicalValue {
        CanonicalValue::Variant {
            name: name.to_string(),
            variant: variant.to_string(),
            value: Box::new(value),
        }
    }
}

impl ser::SerializeTupleVariant for VariantBuilder<SeqBuilder> {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        self.inner.push(value)
    }

    fn end(self) -> Result<CanonicalValue, EncodeError> {
        Ok(Self::wrap(
            self.name,
            self.variant,
            CanonicalValue::Seq(self.inner.items),
        ))
    }
}

impl ser::SerializeStructVariant for VariantBuilder<StructBuilder> {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    fn serialize_field<T: Serialize + ?Sized>(
        &mut self,
        key: &'static str,
        value: &T,
    ) -> Result<(), EncodeError> {
        ser::SerializeStruct::serialize_field(&mut self.inner, key, value)
    }

    fn end(self) -> Result<CanonicalValue, EncodeError> {
        Ok(Self::wrap(self.name, self.variant, self.inner.finish()))
    }
}

struct MapBuilder {
    ser: CanonicalSerializer,
    entries: BTreeMap<CanonicalValue, CanonicalValue>,
    pending_key: Option<CanonicalValue>,
}

impl ser::SerializeMap for MapBuilder {
    type Ok = CanonicalValue;
    type Error = EncodeError;

    fn serialize_key<T: Serialize + ?Sized>(&mut self, key: &T) -> Result<(), EncodeError> {
        let key = self
            .ser
            .lower(key)
            .map_err(|e| EncodeError::MapKey(e.to_string()))?;
        self.pending_key = Some(key);
        Ok(())
    }

    fn serialize_value<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), EncodeError> {
        let key = self
            .pending_key
            .take()
            .ok_or_else(|| EncodeError::Custom("map value serialized before its key".to_string()))?;
        self.entries.insert(key, self.ser.lower(value)?);
        Ok(())
    }

    fn end(self) -> Result<CanonicalValue, EncodeError> {
        Ok(CanonicalValue::Map(self.entries))
    }
}
