//! # Cablegram
//!
//! A schema-driven binary serialization format with first-class support for
//! asynchronous and streaming values.
//!
//! Values are validated against a composed schema and written as a framed
//! payload; deferred values, value streams, and raw byte streams inside the
//! value tree are carried over multiplexed sub-streams on the same ordered
//! transport. Receivers get live consumer handles for streaming nodes and
//! can reconstruct schemas transmitted inline.
//!
//! ## Example
//!
//! ```rust
//! use cablegram::{deserialize_from_bytes, serialize_to_bytes, Schema, Value};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let schema = Schema::object(vec![
//!         ("name".to_string(), Schema::string()),
//!         ("age".to_string(), Schema::uint()),
//!     ]);
//!
//!     let mut obj = std::collections::BTreeMap::new();
//!     obj.insert("name".to_string(), Value::String("Alice".to_string()));
//!     obj.insert("age".to_string(), Value::Uint(30));
//!
//!     let bytes = serialize_to_bytes(&schema, &Value::Object(obj), true).await?;
//!     let (_, value) = deserialize_from_bytes(bytes, None).await?;
//!     assert_eq!(
//!         value,
//!         Value::Object(
//!             [
//!                 ("name".to_string(), Value::String("Alice".to_string())),
//!                 ("age".to_string(), Value::Uint(30)),
//!             ]
//!             .into_iter()
//!             .collect()
//!         )
//!     );
//!     Ok(())
//! }
//! ```

mod compression;
mod data_types;
mod deserialize;
mod error;
mod read_context;
mod reflect;
mod rolling_uint;
mod schema;
mod serialize;
mod stream_multiplexer;
mod value;
mod write_context;

pub use data_types::DataType;
pub use deserialize::{deserialize, deserialize_from_bytes};
pub use error::{CablegramError, SerializableError, StreamFault, ValidationError};
pub use read_context::ReadContext;
pub use reflect::{infer_schema, schema_from_bytes};
pub use schema::{PipeFn, Schema, SchemaDigest};
pub use serialize::{serialize, serialize_to_bytes, serialize_with_digest};
pub use stream_multiplexer::StreamId;
pub use value::{
    ByteResult, ByteStreamReader, ByteStreamValue, FanOutReader, PromiseValue, StreamValue,
    Value, ValueResult, ValueStreamReader,
};
pub use write_context::WriteCursor;
