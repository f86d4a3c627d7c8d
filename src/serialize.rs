//! Serialization functions
//!
//! Writing happens in two synchronous passes over the value tree. The plan
//! pass computes the exact byte size and makes every decision that must not
//! be recomputed: compression-table lookups, schemas inferred for any
//! values, and pipe transforms. Those decisions are recorded in a FIFO
//! plan. The emit pass replays the plan into a preallocated buffer and
//! spawns one producer task per streaming node it encounters.

use crate::compression::{TableLookup, WriteScratchpad};
use crate::error::{CablegramError, ValidationError};
use crate::reflect::infer_schema;
use crate::rolling_uint::{get_rolling_uint_size, zigzag_encode};
use crate::schema::{Schema, SchemaDigest};
use crate::stream_multiplexer::{
    spawn_byte_stream_producer, spawn_iterator_producer, spawn_promise_producer, FrameMessage,
    WriteSession,
};
use crate::value::Value;
use crate::write_context::WriteCursor;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

#[derive(Clone, Copy)]
enum TableStep {
    Reuse(u64),
    Fresh,
}

enum PlanItem {
    Table(TableStep),
    Inferred(Schema),
    Piped(Value),
}

/// Decisions recorded by the plan pass, consumed in order by the emit pass
#[derive(Default)]
pub(crate) struct WritePlan {
    items: VecDeque<PlanItem>,
}

impl WritePlan {
    fn pop_table(&mut self) -> Result<TableStep, CablegramError> {
        match self.items.pop_front() {
            Some(PlanItem::Table(step)) => Ok(step),
            _ => Err(CablegramError::internal(
                "write plan out of step at a compression-table entry",
            )),
        }
    }

    fn pop_inferred(&mut self) -> Result<Schema, CablegramError> {
        match self.items.pop_front() {
            Some(PlanItem::Inferred(schema)) => Ok(schema),
            _ => Err(CablegramError::internal(
                "write plan out of step at an inferred schema",
            )),
        }
    }

    fn pop_piped(&mut self) -> Result<Value, CablegramError> {
        match self.items.pop_front() {
            Some(PlanItem::Piped(value)) => Ok(value),
            _ => Err(CablegramError::internal(
                "write plan out of step at a piped value",
            )),
        }
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

fn mismatch() -> CablegramError {
    ValidationError::new("Schema and value type mismatch").into()
}

/// Calculate the size needed to serialize a value, recording plan decisions
fn plan_value_size(
    schema: &Schema,
    value: &Value,
    pad: &mut WriteScratchpad,
    plan: &mut WritePlan,
) -> Result<usize, CablegramError> {
    match (schema, value) {
        (Schema::Boolean, Value::Boolean(_)) => Ok(1),
        (Schema::Uint8, Value::Uint8(_)) => Ok(1),
        (Schema::Uint, Value::Uint(n)) => Ok(get_rolling_uint_size(*n)),
        (Schema::Int, Value::Int(n)) => Ok(get_rolling_uint_size(zigzag_encode(*n))),
        (Schema::Float, Value::Float(_)) => Ok(8),
        (Schema::Bigint, Value::Bigint(_)) => Ok(8),

        (Schema::String, Value::String(s))
        | (Schema::PotentiallyFloatString, Value::String(s))
        | (Schema::Date, Value::Date(s)) => {
            let len = s.len();
            Ok(get_rolling_uint_size(len as u64) + len)
        }

        (Schema::Bytes, Value::Bytes(bytes)) | (Schema::Buffer, Value::Bytes(bytes)) => {
            let len = bytes.len();
            Ok(get_rolling_uint_size(len as u64) + len)
        }

        (Schema::Array(elem_schema), Value::Array(items)) => {
            let mut size = get_rolling_uint_size(items.len() as u64);
            for item in items {
                size += plan_value_size(elem_schema, item, pad, plan)?;
            }
            Ok(size)
        }

        (Schema::Object(fields), Value::Object(obj)) => {
            let mut size = 0;
            for (field_name, field_schema) in fields {
                match obj.get(field_name) {
                    Some(field_value) => {
                        size += plan_value_size(field_schema, field_value, pad, plan)?;
                    }
                    None => {
                        if matches!(field_schema, Schema::Optional(_)) {
                            size += 1;
                        } else {
                            return Err(ValidationError::new(format!(
                                "Missing field: {}",
                                field_name
                            ))
                            .into());
                        }
                    }
                }
            }
            Ok(size)
        }

        (Schema::Record(value_schema), Value::Object(obj)) => {
            let mut size = get_rolling_uint_size(obj.len() as u64);
            for (key, field_value) in obj {
                let key_len = key.len();
                size += get_rolling_uint_size(key_len as u64) + key_len;
                size += plan_value_size(value_schema, field_value, pad, plan)?;
            }
            Ok(size)
        }

        (Schema::Map(key_schema, value_schema), Value::Map(entries)) => {
            let mut size = get_rolling_uint_size(entries.len() as u64);
            for (k, v) in entries {
                size += plan_value_size(key_schema, k, pad, plan)?;
                size += plan_value_size(value_schema, v, pad, plan)?;
            }
            Ok(size)
        }

        (Schema::Nullable(_), Value::Null) => Ok(1),
        (Schema::Nullable(Some(inner)), value) => {
            Ok(1 + plan_value_size(inner, value, pad, plan)?)
        }

        (Schema::Optional(_), Value::Null) => Ok(1),
        (Schema::Optional(inner), value) => Ok(1 + plan_value_size(inner, value, pad, plan)?),

        (Schema::Union(schemas), value) => {
            for (idx, alternative) in schemas.iter().enumerate() {
                if alternative.validate(value).is_ok() {
                    let value_size = plan_value_size(alternative, value, pad, plan)?;
                    return Ok(get_rolling_uint_size(idx as u64) + value_size);
                }
            }
            Err(ValidationError::new("Value does not match any schema in union").into())
        }

        // Streaming nodes reserve two bytes for the sub-stream ID.
        (Schema::Promise(_), Value::Promise(_)) => Ok(2),
        (Schema::Iterator(_), Value::Stream(_)) => Ok(2),
        (Schema::ReadableStream, Value::ByteStream(_)) => Ok(2),

        (Schema::CompressionTable { inner, deep }, value) => {
            match pad.lookup(value, *deep) {
                TableLookup::Existing(index) => {
                    plan.items.push_back(PlanItem::Table(TableStep::Reuse(index as u64)));
                    Ok(get_rolling_uint_size(index as u64 + 1))
                }
                TableLookup::Miss(pending) => {
                    plan.items.push_back(PlanItem::Table(TableStep::Fresh));
                    let inner_size = plan_value_size(inner, value, pad, plan)?;
                    pad.commit(pending);
                    Ok(1 + inner_size)
                }
            }
        }

        (Schema::Any, value) => {
            let inferred = infer_schema(value);
            let schema_len = inferred.to_bytes().len();
            plan.items.push_back(PlanItem::Inferred(inferred.clone()));
            Ok(schema_len + plan_value_size(&inferred, value, pad, plan)?)
        }

        (Schema::Pipe { inner, transform }, value) => {
            let transformed = transform.apply(value);
            let mut sub_plan = WritePlan::default();
            let size = plan_value_size(inner, &transformed, pad, &mut sub_plan)?;
            plan.items.push_back(PlanItem::Piped(transformed));
            plan.items.append(&mut sub_plan.items);
            Ok(size)
        }

        _ => Err(mismatch()),
    }
}

/// Write a value into the cursor, replaying the plan
fn write_value(
    schema: &Schema,
    value: &Value,
    cur: &mut WriteCursor<'_>,
    session: &Arc<WriteSession>,
    plan: &mut WritePlan,
) -> Result<(), CablegramError> {
    match (schema, value) {
        (Schema::Boolean, Value::Boolean(b)) => cur.write_byte(u8::from(*b)),

        (Schema::Uint8, Value::Uint8(n)) => cur.write_byte(*n),

        (Schema::Uint, Value::Uint(n)) => cur.write_rolling_uint(*n),

        (Schema::Int, Value::Int(n)) => cur.write_rolling_uint(zigzag_encode(*n)),

        (Schema::Float, Value::Float(f)) => cur.write_bytes(&f.to_le_bytes()),

        (Schema::Bigint, Value::Bigint(n)) => cur.write_bytes(&n.to_le_bytes()),

        (Schema::String, Value::String(s))
        | (Schema::PotentiallyFloatString, Value::String(s))
        | (Schema::Date, Value::Date(s)) => {
            let bytes = s.as_bytes();
            cur.write_rolling_uint(bytes.len() as u64)?;
            cur.write_bytes(bytes)
        }

        (Schema::Bytes, Value::Bytes(bytes)) | (Schema::Buffer, Value::Bytes(bytes)) => {
            cur.write_rolling_uint(bytes.len() as u64)?;
            cur.write_bytes(bytes)
        }

        (Schema::Array(elem_schema), Value::Array(items)) => {
            cur.write_rolling_uint(items.len() as u64)?;
            for item in items {
                write_value(elem_schema, item, cur, session, plan)?;
            }
            Ok(())
        }

        (Schema::Object(fields), Value::Object(obj)) => {
            for (field_name, field_schema) in fields {
                match obj.get(field_name) {
                    Some(field_value) => {
                        write_value(field_schema, field_value, cur, session, plan)?;
                    }
                    None => {
                        if matches!(field_schema, Schema::Optional(_)) {
                            cur.write_byte(0)?;
                        } else {
                            return Err(ValidationError::new(format!(
                                "Missing field: {}",
                                field_name
                            ))
                            .into());
                        }
                    }
                }
            }
            Ok(())
        }

        (Schema::Record(value_schema), Value::Object(obj)) => {
            cur.write_rolling_uint(obj.len() as u64)?;
            for (key, field_value) in obj {
                let key_bytes = key.as_bytes();
                cur.write_rolling_uint(key_bytes.len() as u64)?;
                cur.write_bytes(key_bytes)?;
                write_value(value_schema, field_value, cur, session, plan)?;
            }
            Ok(())
        }

        (Schema::Map(key_schema, value_schema), Value::Map(entries)) => {
            cur.write_rolling_uint(entries.len() as u64)?;
            for (k, v) in entries {
                write_value(key_schema, k, cur, session, plan)?;
                write_value(value_schema, v, cur, session, plan)?;
            }
            Ok(())
        }

        (Schema::Nullable(_), Value::Null) => cur.write_byte(0),
        (Schema::Nullable(Some(inner)), value) => {
            cur.write_byte(1)?;
            write_value(inner, value, cur, session, plan)
        }

        (Schema::Optional(_), Value::Null) => cur.write_byte(0),
        (Schema::Optional(inner), value) => {
            cur.write_byte(1)?;
            write_value(inner, value, cur, session, plan)
        }

        (Schema::Union(schemas), value) => {
            for (idx, alternative) in schemas.iter().enumerate() {
                if alternative.validate(value).is_ok() {
                    cur.write_rolling_uint(idx as u64)?;
                    return write_value(alternative, value, cur, session, plan);
                }
            }
            Err(ValidationError::new("Value does not match any schema in union").into())
        }

        (Schema::Promise(inner), Value::Promise(promise)) => {
            let (id, sub_writer) = session.open_sub_stream()?;
            cur.write_byte((id >> 8) as u8)?;
            cur.write_byte((id & 0xff) as u8)?;
            spawn_promise_producer(
                session.clone(),
                (**inner).clone(),
                promise.clone(),
                sub_writer,
            );
            Ok(())
        }

        (Schema::Iterator(inner), Value::Stream(stream)) => {
            let (id, sub_writer) = session.open_sub_stream()?;
            cur.write_byte((id >> 8) as u8)?;
            cur.write_byte((id & 0xff) as u8)?;
            spawn_iterator_producer(
                session.clone(),
                (**inner).clone(),
                stream.clone(),
                sub_writer,
            );
            Ok(())
        }

        (Schema::ReadableStream, Value::ByteStream(stream)) => {
            let (id, sub_writer) = session.open_sub_stream()?;
            cur.write_byte((id >> 8) as u8)?;
            cur.write_byte((id & 0xff) as u8)?;
            spawn_byte_stream_producer(session.clone(), stream.clone(), sub_writer);
            Ok(())
        }

        (Schema::CompressionTable { inner, .. }, value) => match plan.pop_table()? {
            TableStep::Reuse(index) => cur.write_rolling_uint(index + 1),
            TableStep::Fresh => {
                cur.write_rolling_uint(0)?;
                write_value(inner, value, cur, session, plan)
            }
        },

        (Schema::Any, value) => {
            let inferred = plan.pop_inferred()?;
            cur.write_bytes(&inferred.to_bytes())?;
            write_value(&inferred, value, cur, session, plan)
        }

        (Schema::Pipe { inner, .. }, _) => {
            let piped = plan.pop_piped()?;
            write_value(inner, &piped, cur, session, plan)
        }

        _ => Err(mismatch()),
    }
}

/// Serialize one value into a standalone frame payload, sharing the
/// session's compression state and sub-stream ID space.
pub(crate) fn frame_value_bytes(
    schema: &Schema,
    value: &Value,
    session: &Arc<WriteSession>,
    pad: &mut WriteScratchpad,
) -> Result<Vec<u8>, CablegramError> {
    schema.validate(value)?;

    let mut plan = WritePlan::default();
    let size = plan_value_size(schema, value, pad, &mut plan)?;

    let mut buf = vec![0u8; size];
    let mut cur = WriteCursor::new(&mut buf);
    write_value(schema, value, &mut cur, session, &mut plan)?;
    if cur.remaining() != 0 || !plan.is_empty() {
        return Err(CablegramError::internal(
            "plan and emit passes disagreed on frame size",
        ));
    }
    Ok(buf)
}

/// Serialize a value according to the schema and write it to the async writer
///
/// The root buffer is written and flushed first; if the value tree contains
/// streaming nodes, this call then keeps driving their routed frames until
/// every sub-stream has closed.
///
/// # Arguments
///
/// * `schema` - The schema defining the structure
/// * `value` - The value to serialize
/// * `writer` - The async writer to write to
/// * `send_schema` - Whether to send the schema along with the data
///
/// # Example
///
/// ```rust,no_run
/// use cablegram::{Schema, Value, serialize};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let schema = Schema::object(vec![
///         ("name".to_string(), Schema::string()),
///         ("age".to_string(), Schema::uint()),
///     ]);
///
///     let mut obj = std::collections::BTreeMap::new();
///     obj.insert("name".to_string(), Value::String("Alice".to_string()));
///     obj.insert("age".to_string(), Value::Uint(30));
///     let value = Value::Object(obj);
///
///     let mut buffer = Vec::new();
///     serialize(&schema, &value, &mut buffer, true).await?;
///     Ok(())
/// }
/// ```
pub async fn serialize<W: AsyncWrite + Unpin>(
    schema: &Schema,
    value: &Value,
    writer: &mut W,
    send_schema: bool,
) -> Result<(), CablegramError> {
    // The whole root value is validated before any byte goes out.
    schema.validate(value)?;

    let (session, mut frames) = WriteSession::new();

    let mut plan = WritePlan::default();
    let value_size = {
        let mut pad = session.scratchpad.lock().unwrap();
        plan_value_size(schema, value, &mut pad, &mut plan)?
    };

    let schema_bytes = if send_schema {
        schema.to_bytes()
    } else {
        Vec::new()
    };
    let total_size = 1 + schema_bytes.len() + value_size;

    let mut buf = vec![0u8; total_size];
    {
        let mut cur = WriteCursor::new(&mut buf);
        cur.write_byte(u8::from(send_schema))?;
        cur.write_bytes(&schema_bytes)?;
        write_value(schema, value, &mut cur, &session, &mut plan)?;
        if cur.remaining() != 0 || !plan.is_empty() {
            return Err(CablegramError::internal(
                "plan and emit passes disagreed on root size",
            ));
        }
    }

    writer.write_all(&buf).await?;
    writer.flush().await?;

    // Frames queued while the root buffer was in flight drain in order;
    // frames from still-running producers follow as they arrive.
    while session.active_count() > 0 {
        match frames.recv().await {
            Some(FrameMessage::Data { id, payload }) => {
                writer
                    .write_all(&[(id >> 8) as u8, (id & 0xff) as u8])
                    .await?;
                writer.write_all(&payload).await?;
                writer.flush().await?;
            }
            Some(FrameMessage::Closed { id }) => {
                session.note_closed();
                trace!(id, "sub-stream finished");
            }
            None => break,
        }
    }

    Ok(())
}

/// Serialize with the inline schema suppressed when the receiver is known
/// to hold the same schema already.
///
/// Returns the schema digest so the caller can remember it as the
/// receiver's last-seen digest for the next payload.
pub async fn serialize_with_digest<W: AsyncWrite + Unpin>(
    schema: &Schema,
    value: &Value,
    writer: &mut W,
    last_seen: Option<&SchemaDigest>,
) -> Result<SchemaDigest, CablegramError> {
    let digest = schema.digest();
    let send_schema = last_seen != Some(&digest);
    serialize(schema, value, writer, send_schema).await?;
    Ok(digest)
}

/// Serialize into a single buffer: the root payload followed by every
/// sub-stream frame in arrival order.
pub async fn serialize_to_bytes(
    schema: &Schema,
    value: &Value,
    send_schema: bool,
) -> Result<Vec<u8>, CablegramError> {
    let mut buffer = Vec::new();
    serialize(schema, value, &mut buffer, send_schema).await?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_serialize_uint() {
        let schema = Schema::uint();
        let value = Value::Uint(42);
        let mut buffer = Vec::new();

        serialize(&schema, &value, &mut buffer, true).await.unwrap();

        // Header (1 byte) + schema (1 byte) + value (1 byte)
        assert_eq!(buffer, vec![1, 0x0a, 42]);
    }

    #[tokio::test]
    async fn test_serialize_string() {
        let schema = Schema::string();
        let value = Value::String("hello".to_string());
        let mut buffer = Vec::new();

        serialize(&schema, &value, &mut buffer, false).await.unwrap();

        assert_eq!(buffer.len(), 7);
        assert_eq!(buffer[0], 0); // send_schema = false
        assert_eq!(buffer[1], 5); // string length
        assert_eq!(&buffer[2..7], b"hello");
    }

    #[tokio::test]
    async fn test_serialize_compression_reuses_entries() {
        let schema = Schema::array(Schema::compression_table(Schema::string(), false));
        let value = Value::Array(vec![
            Value::String("a".to_string()),
            Value::String("a".to_string()),
            Value::String("b".to_string()),
            Value::String("a".to_string()),
        ]);

        let buffer = serialize_to_bytes(&schema, &value, false).await.unwrap();

        // header, count, then: fresh "a", ref 1, fresh "b", ref 1
        assert_eq!(
            buffer,
            vec![0, 4, 0, 1, b'a', 1, 0, 1, b'b', 1]
        );
    }

    #[tokio::test]
    async fn test_serialize_pipe_applies_transform() {
        let schema = Schema::pipe(
            Schema::uint(),
            crate::schema::PipeFn::new(|value| match value {
                Value::Uint(n) => Value::Uint(n + 1),
                other => other.clone(),
            }),
        );
        let buffer = serialize_to_bytes(&schema, &Value::Uint(41), false)
            .await
            .unwrap();
        assert_eq!(buffer, vec![0, 42]);
    }

    #[tokio::test]
    async fn test_serialize_any_prepends_inferred_schema() {
        let buffer = serialize_to_bytes(&Schema::any(), &Value::Uint(9), false)
            .await
            .unwrap();
        // header, inferred uint tag, value
        assert_eq!(buffer, vec![0, 0x0a, 9]);
    }

    #[tokio::test]
    async fn test_validation_failure_writes_nothing() {
        let schema = Schema::uint();
        let value = Value::String("not a number".to_string());
        let mut buffer = Vec::new();
        let result = serialize(&schema, &value, &mut buffer, true).await;
        assert!(matches!(result, Err(CablegramError::Validation(_))));
        assert!(buffer.is_empty());
    }
}
