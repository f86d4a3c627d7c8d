//! Schema reflection
//!
//! Two directions: parsing a schema out of its byte-representation (for
//! payloads that carry their schema inline, and for error frames), and
//! inferring a minimal schema from an arbitrary value (for the any type).

use crate::data_types::DataType;
use crate::error::CablegramError;
use crate::read_context::ReadContext;
use crate::rolling_uint::read_rolling_uint;
use crate::schema::Schema;
use crate::value::Value;
use futures::future::BoxFuture;
use std::collections::HashSet;
use tokio::io::AsyncRead;

/// Read a schema from its byte-representation
pub(crate) fn read_schema<'a, R: AsyncRead + Unpin + Send>(
    ctx: &'a mut ReadContext<R>,
) -> BoxFuture<'a, Result<Schema, CablegramError>> {
    Box::pin(async move {
        let tag_byte = ctx.read_byte().await?;
        let data_type = DataType::from_u8(tag_byte).ok_or_else(|| {
            CablegramError::protocol(format!("unknown data type tag: 0x{:02x}", tag_byte))
        })?;

        match data_type {
            DataType::Boolean => Ok(Schema::Boolean),
            DataType::Uint8 => Ok(Schema::Uint8),
            DataType::Uint => Ok(Schema::Uint),
            DataType::Int => Ok(Schema::Int),
            DataType::Float => Ok(Schema::Float),
            DataType::String => Ok(Schema::String),
            DataType::U8Array => Ok(Schema::Bytes),
            DataType::Buffer => Ok(Schema::Buffer),
            DataType::Date => Ok(Schema::Date),
            DataType::Bigint => Ok(Schema::Bigint),
            DataType::ReadableStream => Ok(Schema::ReadableStream),
            DataType::PotentiallyFloatString => Ok(Schema::PotentiallyFloatString),
            DataType::Any => Ok(Schema::Any),

            DataType::Array => Ok(Schema::Array(Box::new(read_schema(ctx).await?))),
            DataType::Promise => Ok(Schema::Promise(Box::new(read_schema(ctx).await?))),
            DataType::Iterator => Ok(Schema::Iterator(Box::new(read_schema(ctx).await?))),
            DataType::Optional => Ok(Schema::Optional(Box::new(read_schema(ctx).await?))),
            DataType::Record => Ok(Schema::Record(Box::new(read_schema(ctx).await?))),

            // The deep flag has no wire form, so reflected tables are shallow.
            DataType::CompressionTable => Ok(Schema::CompressionTable {
                inner: Box::new(read_schema(ctx).await?),
                deep: false,
            }),

            DataType::Object => {
                let field_count = read_rolling_uint(ctx).await? as usize;
                let mut fields = Vec::with_capacity(field_count);
                for _ in 0..field_count {
                    let key_len = read_rolling_uint(ctx).await? as usize;
                    let key_bytes = ctx.read_bytes(key_len).await?;
                    let key = String::from_utf8(key_bytes).map_err(|e| {
                        CablegramError::protocol(format!("invalid UTF-8 in object key: {}", e))
                    })?;
                    let value_schema = read_schema(ctx).await?;
                    fields.push((key, value_schema));
                }
                Ok(Schema::Object(fields))
            }

            DataType::Map => {
                let key_schema = read_schema(ctx).await?;
                let value_schema = read_schema(ctx).await?;
                Ok(Schema::Map(Box::new(key_schema), Box::new(value_schema)))
            }

            DataType::Nullable => {
                // A 0x00 where the child tag would be marks a naked nullable.
                if ctx.peek_byte().await? == 0x00 {
                    ctx.read_byte().await?;
                    Ok(Schema::Nullable(None))
                } else {
                    Ok(Schema::Nullable(Some(Box::new(read_schema(ctx).await?))))
                }
            }

            DataType::Union => {
                let count = read_rolling_uint(ctx).await? as usize + 1;
                let mut schemas = Vec::with_capacity(count);
                for _ in 0..count {
                    schemas.push(read_schema(ctx).await?);
                }
                Ok(Schema::Union(schemas))
            }
        }
    })
}

/// Parse a schema from a standalone byte slice
pub async fn schema_from_bytes(bytes: &[u8]) -> Result<Schema, CablegramError> {
    let mut ctx = ReadContext::new(bytes);
    read_schema(&mut ctx).await
}

/// Infer a minimal schema describing `value`.
///
/// Used by the any type: the writer prepends the inferred schema's bytes
/// and then writes the value under it. Inference is best-effort; a value
/// that later fails validation under its own inferred schema raises a
/// validation error.
pub fn infer_schema(value: &Value) -> Schema {
    match value {
        Value::Boolean(_) => Schema::Boolean,
        Value::Uint8(_) => Schema::Uint8,
        Value::Uint(_) => Schema::Uint,
        Value::Int(_) => Schema::Int,
        Value::Float(_) => Schema::Float,
        Value::Bigint(_) => Schema::Bigint,
        Value::String(_) => Schema::String,
        Value::Bytes(_) => Schema::Bytes,
        Value::Date(_) => Schema::Date,
        Value::Null => Schema::Nullable(None),

        Value::Array(items) => {
            if items.is_empty() {
                Schema::array(Schema::Any)
            } else {
                Schema::array(unify(items.iter().map(infer_schema)))
            }
        }

        Value::Object(fields) => Schema::object(
            fields
                .iter()
                .map(|(key, field)| (key.clone(), infer_schema(field)))
                .collect(),
        ),

        Value::Map(entries) => {
            if entries.is_empty() {
                Schema::map(Schema::Any, Schema::Any)
            } else {
                Schema::map(
                    unify(entries.iter().map(|(k, _)| infer_schema(k))),
                    unify(entries.iter().map(|(_, v)| infer_schema(v))),
                )
            }
        }

        Value::Promise(_) => Schema::promise(Schema::Any),
        Value::Stream(_) => Schema::iterator(Schema::Any),
        Value::ByteStream(_) => Schema::ReadableStream,
    }
}

/// Collapse a set of schemas to a single schema, or a union of the
/// distinct ones (distinct by byte-representation).
fn unify(schemas: impl Iterator<Item = Schema>) -> Schema {
    let mut distinct: Vec<Schema> = Vec::new();
    let mut seen: HashSet<Vec<u8>> = HashSet::new();
    for schema in schemas {
        if seen.insert(schema.to_bytes()) {
            distinct.push(schema);
        }
    }
    if distinct.len() == 1 {
        distinct.remove(0)
    } else {
        Schema::union(distinct)
    }
}
