//! Deserialization functions

use crate::error::CablegramError;
use crate::read_context::ReadContext;
use crate::reflect::read_schema;
use crate::rolling_uint::{read_rolling_uint, zigzag_decode};
use crate::schema::Schema;
use crate::stream_multiplexer::{run_dispatcher, ReadSession};
use crate::value::Value;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::io::AsyncRead;
use tracing::debug;

/// Read a value according to the schema.
///
/// Streaming nodes register a handler for their wire sub-stream ID on the
/// session and materialize as live consumer handles; their content arrives
/// later through the frame dispatcher.
pub(crate) fn read_value<'a, R: AsyncRead + Unpin + Send>(
    schema: &'a Schema,
    ctx: &'a mut ReadContext<R>,
    session: &'a Arc<ReadSession>,
) -> BoxFuture<'a, Result<Value, CablegramError>> {
    Box::pin(async move {
        match schema {
            Schema::Boolean => {
                let byte = ctx.read_byte().await?;
                match byte {
                    0 => Ok(Value::Boolean(false)),
                    1 => Ok(Value::Boolean(true)),
                    _ => Err(CablegramError::protocol(format!(
                        "invalid boolean value: {}",
                        byte
                    ))),
                }
            }

            Schema::Uint8 => {
                let byte = ctx.read_byte().await?;
                Ok(Value::Uint8(byte))
            }

            Schema::Uint => {
                let value = read_rolling_uint(ctx).await?;
                Ok(Value::Uint(value))
            }

            Schema::Int => {
                let zigzagged = read_rolling_uint(ctx).await?;
                Ok(Value::Int(zigzag_decode(zigzagged)))
            }

            Schema::Float => {
                let bytes = ctx.read_bytes(8).await?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                Ok(Value::Float(f64::from_le_bytes(arr)))
            }

            Schema::Bigint => {
                let bytes = ctx.read_bytes(8).await?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&bytes);
                Ok(Value::Bigint(u64::from_le_bytes(arr)))
            }

            Schema::String | Schema::PotentiallyFloatString => {
                let len = read_rolling_uint(ctx).await? as usize;
                let bytes = ctx.read_bytes(len).await?;
                let value = String::from_utf8(bytes).map_err(|e| {
                    CablegramError::protocol(format!("invalid UTF-8: {}", e))
                })?;
                Ok(Value::String(value))
            }

            Schema::Bytes | Schema::Buffer => {
                let len = read_rolling_uint(ctx).await? as usize;
                let bytes = ctx.read_bytes(len).await?;
                Ok(Value::Bytes(bytes))
            }

            Schema::Date => {
                let len = read_rolling_uint(ctx).await? as usize;
                let bytes = ctx.read_bytes(len).await?;
                let value = String::from_utf8(bytes).map_err(|e| {
                    CablegramError::protocol(format!("invalid UTF-8 in date: {}", e))
                })?;
                Ok(Value::Date(value))
            }

            Schema::Array(elem_schema) => {
                let len = read_rolling_uint(ctx).await? as usize;
                let mut items = Vec::with_capacity(len);
                for _ in 0..len {
                    items.push(read_value(elem_schema, ctx, session).await?);
                }
                Ok(Value::Array(items))
            }

            Schema::Object(fields) => {
                let mut obj = BTreeMap::new();
                for (field_name, field_schema) in fields {
                    let value = read_value(field_schema, ctx, session).await?;
                    obj.insert(field_name.clone(), value);
                }
                Ok(Value::Object(obj))
            }

            Schema::Record(value_schema) => {
                let len = read_rolling_uint(ctx).await? as usize;
                let mut obj = BTreeMap::new();
                for _ in 0..len {
                    let key_len = read_rolling_uint(ctx).await? as usize;
                    let key_bytes = ctx.read_bytes(key_len).await?;
                    let key = String::from_utf8(key_bytes).map_err(|e| {
                        CablegramError::protocol(format!("invalid UTF-8 in record key: {}", e))
                    })?;
                    let value = read_value(value_schema, ctx, session).await?;
                    obj.insert(key, value);
                }
                Ok(Value::Object(obj))
            }

            Schema::Map(key_schema, value_schema) => {
                let len = read_rolling_uint(ctx).await? as usize;
                let mut entries = Vec::with_capacity(len);
                for _ in 0..len {
                    let key = read_value(key_schema, ctx, session).await?;
                    let value = read_value(value_schema, ctx, session).await?;
                    entries.push((key, value));
                }
                Ok(Value::Map(entries))
            }

            Schema::Nullable(inner) => {
                let flag = ctx.read_byte().await?;
                match (flag, inner) {
                    (0, _) => Ok(Value::Null),
                    (1, Some(inner_schema)) => read_value(inner_schema, ctx, session).await,
                    (1, None) => Err(CablegramError::protocol(
                        "unexpected non-null value for naked nullable",
                    )),
                    _ => Err(CablegramError::protocol(format!(
                        "invalid nullable flag: {}",
                        flag
                    ))),
                }
            }

            Schema::Optional(inner) => {
                let flag = ctx.read_byte().await?;
                match flag {
                    0 => Ok(Value::Null),
                    1 => read_value(inner, ctx, session).await,
                    _ => Err(CablegramError::protocol(format!(
                        "invalid optional flag: {}",
                        flag
                    ))),
                }
            }

            Schema::Union(schemas) => {
                let index = read_rolling_uint(ctx).await? as usize;
                if index >= schemas.len() {
                    return Err(CablegramError::protocol(format!(
                        "invalid union index: {}",
                        index
                    )));
                }
                read_value(&schemas[index], ctx, session).await
            }

            Schema::Promise(inner) => {
                let id = read_sub_stream_id(ctx).await?;
                let promise = session.register_promise(id, (**inner).clone())?;
                Ok(Value::Promise(promise))
            }

            Schema::Iterator(inner) => {
                let id = read_sub_stream_id(ctx).await?;
                let stream = session.register_iterator(id, (**inner).clone())?;
                Ok(Value::Stream(stream))
            }

            Schema::ReadableStream => {
                let id = read_sub_stream_id(ctx).await?;
                let stream = session.register_byte_stream(id)?;
                Ok(Value::ByteStream(stream))
            }

            Schema::CompressionTable { inner, .. } => {
                let index = read_rolling_uint(ctx).await?;
                if index == 0 {
                    let value = read_value(inner, ctx, session).await?;
                    session.push_table(value.clone());
                    Ok(value)
                } else {
                    session.table_get((index - 1) as usize).ok_or_else(|| {
                        CablegramError::protocol(format!(
                            "compression table index out of range: {} of {}",
                            index,
                            session.table_len()
                        ))
                    })
                }
            }

            Schema::Any => {
                let inline_schema = read_schema(ctx).await?;
                read_value(&inline_schema, ctx, session).await
            }

            // The transform applies on the write side only.
            Schema::Pipe { inner, .. } => read_value(inner, ctx, session).await,
        }
    })
}

async fn read_sub_stream_id<R: AsyncRead + Unpin + Send>(
    ctx: &mut ReadContext<R>,
) -> Result<u16, CablegramError> {
    let hi = ctx.read_byte().await?;
    let lo = ctx.read_byte().await?;
    Ok(((hi as u16) << 8) | lo as u16)
}

/// Deserialize a value from an async reader
///
/// If the value tree contains streaming nodes, a dispatcher task is spawned
/// that keeps routing their frames after this call returns; the returned
/// handles stay live until their sub-streams terminate or the handles are
/// dropped.
///
/// # Arguments
///
/// * `reader` - The async reader to read from
/// * `expected_schema` - Optional expected schema, used when the payload
///   does not carry its schema inline
///
/// # Returns
///
/// A tuple of (schema, value)
///
/// # Example
///
/// ```rust,no_run
/// use cablegram::deserialize;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let data = vec![1, 0x0a, 42]; // schema inline, uint, value 42
///     let (schema, value) = deserialize(std::io::Cursor::new(data), None).await?;
///     println!("Deserialized value: {:?}", value);
///     Ok(())
/// }
/// ```
pub async fn deserialize<R>(
    reader: R,
    expected_schema: Option<Schema>,
) -> Result<(Schema, Value), CablegramError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut ctx = ReadContext::new(reader);
    let session = ReadSession::new();

    let header = ctx.read_byte().await?;
    let schema = match header {
        // An inline schema replaces whatever the caller supplied.
        1 => read_schema(&mut ctx).await?,
        0 => expected_schema.ok_or_else(|| {
            CablegramError::protocol("no schema in stream and no expected schema provided")
        })?,
        other => {
            return Err(CablegramError::protocol(format!(
                "invalid header byte: 0x{:02x}",
                other
            )))
        }
    };

    let value = read_value(&schema, &mut ctx, &session).await?;

    if session.usages() > 0 {
        debug!(handlers = session.usages(), "spawning frame dispatcher");
        tokio::spawn(run_dispatcher(ctx, session));
    }

    Ok((schema, value))
}

/// Deserialize a single-shot payload held entirely in memory
pub async fn deserialize_from_bytes(
    bytes: Vec<u8>,
    expected_schema: Option<Schema>,
) -> Result<(Schema, Value), CablegramError> {
    deserialize(std::io::Cursor::new(bytes), expected_schema).await
}
