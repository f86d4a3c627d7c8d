//! Schema definitions for Cablegram
//!
//! This module provides the Schema type, the constructors of the schema
//! algebra, validation, and the canonical byte-representation that
//! content-addresses a schema on the wire.

use crate::data_types::DataType;
use crate::error::ValidationError;
use crate::rolling_uint::push_rolling_uint;
use crate::value::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;

/// Transform applied by a [`Schema::Pipe`] before writing.
///
/// The transform runs on the write path only; readers decode the inner
/// schema directly.
#[derive(Clone)]
pub struct PipeFn(Arc<dyn Fn(&Value) -> Value + Send + Sync>);

impl PipeFn {
    pub fn new(transform: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        Self(Arc::new(transform))
    }

    pub fn apply(&self, value: &Value) -> Value {
        (self.0)(value)
    }
}

impl fmt::Debug for PipeFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PipeFn")
    }
}

/// Schema type that defines how data should be serialized/deserialized
#[derive(Debug, Clone)]
pub enum Schema {
    /// Boolean schema
    Boolean,
    /// Unsigned 8-bit integer schema
    Uint8,
    /// Unsigned integer schema
    Uint,
    /// Signed integer schema
    Int,
    /// Floating point schema
    Float,
    /// String schema
    String,
    /// Byte array schema (u8-array on the wire)
    Bytes,
    /// Byte array schema with the buffer wire tag
    Buffer,
    /// String schema that may carry a stringified float
    PotentiallyFloatString,
    /// Array schema with element type
    Array(Box<Schema>),
    /// Object schema with field definitions, kept sorted by field name
    Object(Vec<(String, Schema)>),
    /// Map schema with key and value types
    Map(Box<Schema>, Box<Schema>),
    /// Nullable schema; `None` admits only null
    Nullable(Option<Box<Schema>>),
    /// Optional schema
    Optional(Box<Schema>),
    /// Union of multiple schemas
    Union(Vec<Schema>),
    /// Date schema
    Date,
    /// BigInt schema
    Bigint,
    /// Record schema (object with dynamic keys)
    Record(Box<Schema>),
    /// Deferred single value carried over a sub-stream
    Promise(Box<Schema>),
    /// Stream of values carried over a sub-stream
    Iterator(Box<Schema>),
    /// Raw byte stream carried over a sub-stream
    ReadableStream,
    /// Cross-value deduplication table entry
    CompressionTable {
        inner: Box<Schema>,
        /// Also deduplicate by structural equality, not just identity
        deep: bool,
    },
    /// Schema inferred per value at write time
    Any,
    /// Transparent write-side transform around an inner schema
    Pipe {
        inner: Box<Schema>,
        transform: PipeFn,
    },
}

impl Schema {
    /// Create a boolean schema
    pub fn boolean() -> Self {
        Schema::Boolean
    }

    /// Create a uint8 schema
    pub fn uint8() -> Self {
        Schema::Uint8
    }

    /// Create a uint schema
    pub fn uint() -> Self {
        Schema::Uint
    }

    /// Create an int schema
    pub fn int() -> Self {
        Schema::Int
    }

    /// Create a float schema
    pub fn float() -> Self {
        Schema::Float
    }

    /// Create a string schema
    pub fn string() -> Self {
        Schema::String
    }

    /// Create a bytes schema
    pub fn bytes() -> Self {
        Schema::Bytes
    }

    /// Create a bytes schema carrying the buffer wire tag
    pub fn buffer() -> Self {
        Schema::Buffer
    }

    /// Create a potentially-float-string schema
    pub fn potentially_float_string() -> Self {
        Schema::PotentiallyFloatString
    }

    /// Create an array schema
    pub fn array(element_schema: Schema) -> Self {
        Schema::Array(Box::new(element_schema))
    }

    /// Create an object schema
    pub fn object(mut fields: Vec<(String, Schema)>) -> Self {
        // Wire order is the lexicographic sort of keys, so store them sorted.
        fields.sort_by(|a, b| a.0.cmp(&b.0));
        Schema::Object(fields)
    }

    /// Create a map schema
    pub fn map(key_schema: Schema, value_schema: Schema) -> Self {
        Schema::Map(Box::new(key_schema), Box::new(value_schema))
    }

    /// Create a nullable schema
    pub fn nullable(inner: Option<Schema>) -> Self {
        Schema::Nullable(inner.map(Box::new))
    }

    /// Create an optional schema
    pub fn optional(inner: Schema) -> Self {
        Schema::Optional(Box::new(inner))
    }

    /// Create a union schema
    pub fn union(schemas: Vec<Schema>) -> Self {
        Schema::Union(schemas)
    }

    /// Create a date schema
    pub fn date() -> Self {
        Schema::Date
    }

    /// Create a bigint schema
    pub fn bigint() -> Self {
        Schema::Bigint
    }

    /// Create a record schema
    pub fn record(value_schema: Schema) -> Self {
        Schema::Record(Box::new(value_schema))
    }

    /// Create a promise schema
    pub fn promise(inner: Schema) -> Self {
        Schema::Promise(Box::new(inner))
    }

    /// Create an iterator schema
    pub fn iterator(inner: Schema) -> Self {
        Schema::Iterator(Box::new(inner))
    }

    /// Create a readable-stream schema
    pub fn readable_stream() -> Self {
        Schema::ReadableStream
    }

    /// Create a compression-table schema
    pub fn compression_table(inner: Schema, deep: bool) -> Self {
        Schema::CompressionTable {
            inner: Box::new(inner),
            deep,
        }
    }

    /// Create an any schema
    pub fn any() -> Self {
        Schema::Any
    }

    /// Create a pipe schema applying `transform` before the inner writer
    pub fn pipe(inner: Schema, transform: PipeFn) -> Self {
        Schema::Pipe {
            inner: Box::new(inner),
            transform,
        }
    }

    /// Validate that a value matches this schema
    pub fn validate(&self, value: &Value) -> Result<(), ValidationError> {
        match (self, value) {
            (Schema::Boolean, Value::Boolean(_)) => Ok(()),
            (Schema::Boolean, _) => Err(ValidationError::new("Expected boolean")),

            (Schema::Uint8, Value::Uint8(_)) => Ok(()),
            (Schema::Uint8, _) => Err(ValidationError::new("Expected uint8")),

            (Schema::Uint, Value::Uint(_)) => Ok(()),
            (Schema::Uint, _) => Err(ValidationError::new("Expected uint")),

            (Schema::Int, Value::Int(_)) => Ok(()),
            (Schema::Int, _) => Err(ValidationError::new("Expected int")),

            (Schema::Float, Value::Float(_)) => Ok(()),
            (Schema::Float, _) => Err(ValidationError::new("Expected float")),

            (Schema::String, Value::String(_)) => Ok(()),
            (Schema::String, _) => Err(ValidationError::new("Expected string")),

            (Schema::PotentiallyFloatString, Value::String(_)) => Ok(()),
            (Schema::PotentiallyFloatString, _) => Err(ValidationError::new("Expected string")),

            (Schema::Bytes, Value::Bytes(_)) => Ok(()),
            (Schema::Bytes, _) => Err(ValidationError::new("Expected bytes")),

            (Schema::Buffer, Value::Bytes(_)) => Ok(()),
            (Schema::Buffer, _) => Err(ValidationError::new("Expected bytes")),

            (Schema::Array(elem_schema), Value::Array(items)) => {
                for item in items {
                    elem_schema.validate(item)?;
                }
                Ok(())
            }
            (Schema::Array(_), _) => Err(ValidationError::new("Expected array")),

            (Schema::Object(fields), Value::Object(obj)) => {
                for (field_name, field_schema) in fields {
                    match obj.get(field_name) {
                        Some(field_value) => field_schema.validate(field_value)?,
                        None => {
                            if !matches!(field_schema, Schema::Optional(_)) {
                                return Err(ValidationError::new(format!(
                                    "Missing field: {}",
                                    field_name
                                )));
                            }
                        }
                    }
                }
                Ok(())
            }
            (Schema::Object(_), _) => Err(ValidationError::new("Expected object")),

            (Schema::Map(key_schema, value_schema), Value::Map(entries)) => {
                for (k, v) in entries {
                    key_schema.validate(k)?;
                    value_schema.validate(v)?;
                }
                Ok(())
            }
            (Schema::Map(_, _), _) => Err(ValidationError::new("Expected map")),

            (Schema::Nullable(None), Value::Null) => Ok(()),
            (Schema::Nullable(Some(_)), Value::Null) => Ok(()),
            (Schema::Nullable(Some(inner)), value) => inner.validate(value),
            (Schema::Nullable(None), _) => Err(ValidationError::new("Expected null")),

            (Schema::Optional(_), Value::Null) => Ok(()),
            (Schema::Optional(inner), value) => inner.validate(value),

            (Schema::Union(schemas), value) => {
                let mut messages = Vec::with_capacity(schemas.len());
                for schema in schemas {
                    match schema.validate(value) {
                        Ok(()) => return Ok(()),
                        Err(e) => messages.push(e.message),
                    }
                }
                Err(ValidationError::new(format!(
                    "Value does not match any schema in union: {}",
                    messages.join("; ")
                )))
            }

            (Schema::Date, Value::Date(_)) => Ok(()),
            (Schema::Date, _) => Err(ValidationError::new("Expected date")),

            (Schema::Bigint, Value::Bigint(_)) => Ok(()),
            (Schema::Bigint, _) => Err(ValidationError::new("Expected bigint")),

            (Schema::Record(value_schema), Value::Object(obj)) => {
                for (_, v) in obj {
                    value_schema.validate(v)?;
                }
                Ok(())
            }
            (Schema::Record(_), _) => Err(ValidationError::new("Expected record")),

            (Schema::Promise(_), Value::Promise(_)) => Ok(()),
            (Schema::Promise(_), _) => Err(ValidationError::new("Expected promise")),

            (Schema::Iterator(_), Value::Stream(_)) => Ok(()),
            (Schema::Iterator(_), _) => Err(ValidationError::new("Expected value stream")),

            (Schema::ReadableStream, Value::ByteStream(_)) => Ok(()),
            (Schema::ReadableStream, _) => Err(ValidationError::new("Expected byte stream")),

            (Schema::CompressionTable { inner, .. }, value) => inner.validate(value),

            (Schema::Any, _) => Ok(()),

            (Schema::Pipe { inner, transform }, value) => {
                inner.validate(&transform.apply(value))
            }
        }
    }

    /// Get the binary representation of this schema
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Schema::Boolean => vec![DataType::Boolean.to_u8()],
            Schema::Uint8 => vec![DataType::Uint8.to_u8()],
            Schema::Uint => vec![DataType::Uint.to_u8()],
            Schema::Int => vec![DataType::Int.to_u8()],
            Schema::Float => vec![DataType::Float.to_u8()],
            Schema::String => vec![DataType::String.to_u8()],
            Schema::Bytes => vec![DataType::U8Array.to_u8()],
            Schema::Buffer => vec![DataType::Buffer.to_u8()],
            Schema::PotentiallyFloatString => vec![DataType::PotentiallyFloatString.to_u8()],
            Schema::Date => vec![DataType::Date.to_u8()],
            Schema::Bigint => vec![DataType::Bigint.to_u8()],
            Schema::ReadableStream => vec![DataType::ReadableStream.to_u8()],
            Schema::Any => vec![DataType::Any.to_u8()],

            Schema::Array(elem) => {
                let mut bytes = vec![DataType::Array.to_u8()];
                bytes.extend_from_slice(&elem.to_bytes());
                bytes
            }

            Schema::Object(fields) => {
                let mut bytes = vec![DataType::Object.to_u8()];
                push_rolling_uint(&mut bytes, fields.len() as u64);
                for (key, value_schema) in fields {
                    let key_bytes = key.as_bytes();
                    push_rolling_uint(&mut bytes, key_bytes.len() as u64);
                    bytes.extend_from_slice(key_bytes);
                    bytes.extend_from_slice(&value_schema.to_bytes());
                }
                bytes
            }

            Schema::Map(key_schema, value_schema) => {
                let mut bytes = vec![DataType::Map.to_u8()];
                bytes.extend_from_slice(&key_schema.to_bytes());
                bytes.extend_from_slice(&value_schema.to_bytes());
                bytes
            }

            Schema::Nullable(inner) => {
                let mut bytes = vec![DataType::Nullable.to_u8()];
                if let Some(inner_schema) = inner {
                    bytes.extend_from_slice(&inner_schema.to_bytes());
                } else {
                    bytes.push(0x00);
                }
                bytes
            }

            Schema::Optional(inner) => {
                let mut bytes = vec![DataType::Optional.to_u8()];
                bytes.extend_from_slice(&inner.to_bytes());
                bytes
            }

            Schema::Union(schemas) => {
                let mut bytes = vec![DataType::Union.to_u8()];
                push_rolling_uint(&mut bytes, schemas.len().saturating_sub(1) as u64);
                for schema in schemas {
                    bytes.extend_from_slice(&schema.to_bytes());
                }
                bytes
            }

            Schema::Record(value_schema) => {
                let mut bytes = vec![DataType::Record.to_u8()];
                bytes.extend_from_slice(&value_schema.to_bytes());
                bytes
            }

            Schema::Promise(inner) => {
                let mut bytes = vec![DataType::Promise.to_u8()];
                bytes.extend_from_slice(&inner.to_bytes());
                bytes
            }

            Schema::Iterator(inner) => {
                let mut bytes = vec![DataType::Iterator.to_u8()];
                bytes.extend_from_slice(&inner.to_bytes());
                bytes
            }

            // The deep flag affects only the writer, so it has no wire form.
            Schema::CompressionTable { inner, .. } => {
                let mut bytes = vec![DataType::CompressionTable.to_u8()];
                bytes.extend_from_slice(&inner.to_bytes());
                bytes
            }

            // A pipe is transparent on the wire.
            Schema::Pipe { inner, .. } => inner.to_bytes(),
        }
    }

    /// Stable content digest of the schema bytes.
    ///
    /// The digest is never transmitted; callers compare it against the
    /// receiver's last-seen digest to decide whether to inline the schema.
    pub fn digest(&self) -> SchemaDigest {
        let mut hasher = Sha256::new();
        hasher.update(self.to_bytes());
        SchemaDigest(hasher.finalize().into())
    }
}

/// SHA-256 digest of a schema's byte-representation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SchemaDigest([u8; 32]);

impl SchemaDigest {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for SchemaDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_validation() {
        let schema = Schema::uint();
        assert!(schema.validate(&Value::Uint(42)).is_ok());
        assert!(schema.validate(&Value::String("hello".to_string())).is_err());
    }

    #[test]
    fn test_schema_to_bytes() {
        assert_eq!(Schema::boolean().to_bytes(), vec![DataType::Boolean.to_u8()]);
        assert_eq!(Schema::uint().to_bytes(), vec![DataType::Uint.to_u8()]);
        assert_eq!(Schema::string().to_bytes(), vec![DataType::String.to_u8()]);
        assert_eq!(Schema::buffer().to_bytes(), vec![0x05]);
        assert_eq!(Schema::readable_stream().to_bytes(), vec![0x12]);
        assert_eq!(Schema::any().to_bytes(), vec![0x16]);
    }

    #[test]
    fn test_object_bytes_sorted_by_key() {
        let schema = Schema::object(vec![
            ("b".to_string(), Schema::uint8()),
            ("a".to_string(), Schema::uint8()),
        ]);
        assert_eq!(
            schema.to_bytes(),
            vec![0x02, 2, 1, b'a', 0x09, 1, b'b', 0x09]
        );
    }

    #[test]
    fn test_nullable_bytes() {
        assert_eq!(Schema::nullable(None).to_bytes(), vec![0x0f, 0x00]);
        assert_eq!(
            Schema::nullable(Some(Schema::string())).to_bytes(),
            vec![0x0f, 0x03]
        );
    }

    #[test]
    fn test_compression_table_bytes_drop_deep_flag() {
        let shallow = Schema::compression_table(Schema::string(), false);
        let deep = Schema::compression_table(Schema::string(), true);
        assert_eq!(shallow.to_bytes(), vec![0x17, 0x03]);
        assert_eq!(shallow.to_bytes(), deep.to_bytes());
    }

    #[test]
    fn test_pipe_bytes_are_inner_bytes() {
        let pipe = Schema::pipe(
            Schema::uint(),
            PipeFn::new(|v| v.clone()),
        );
        assert_eq!(pipe.to_bytes(), Schema::uint().to_bytes());
    }

    #[test]
    fn test_optional_object_field_may_be_absent() {
        let schema = Schema::object(vec![
            ("name".to_string(), Schema::string()),
            ("nick".to_string(), Schema::optional(Schema::string())),
        ]);
        let mut obj = std::collections::BTreeMap::new();
        obj.insert("name".to_string(), Value::String("Ada".to_string()));
        assert!(schema.validate(&Value::Object(obj.clone())).is_ok());
        obj.remove("name");
        assert!(schema.validate(&Value::Object(obj)).is_err());
    }

    #[test]
    fn test_union_error_aggregates_alternatives() {
        let schema = Schema::union(vec![Schema::uint(), Schema::boolean()]);
        let err = schema.validate(&Value::String("nope".to_string())).unwrap_err();
        assert!(err.message.contains("Expected uint"));
        assert!(err.message.contains("Expected boolean"));
    }

    #[test]
    fn test_digest_tracks_schema_bytes() {
        let a = Schema::object(vec![
            ("x".to_string(), Schema::uint()),
            ("y".to_string(), Schema::uint()),
        ]);
        let b = Schema::object(vec![
            ("y".to_string(), Schema::uint()),
            ("x".to_string(), Schema::uint()),
        ]);
        // Field order in the definition does not matter.
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), Schema::uint().digest());
    }
}
