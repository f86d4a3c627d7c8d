//! Runtime values, including shareable handles for streaming data
//!
//! Streaming values (promises, value streams, byte streams) are cheap to
//! clone: every clone points at the same underlying producer, and stream
//! handles buffer what has been pulled so far so that later subscribers see
//! the items earlier ones already consumed. That replay behavior is what
//! makes table-deduplicated streaming values safe to hand out more than
//! once.

use crate::error::{SerializableError, StreamFault};
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

/// Item yielded by a value stream
pub type ValueResult = Result<Value, StreamFault>;
/// Item yielded by a byte stream
pub type ByteResult = Result<Bytes, StreamFault>;

/// Reader over a value stream
pub type ValueStreamReader = FanOutReader<ValueResult>;
/// Reader over a byte stream
pub type ByteStreamReader = FanOutReader<ByteResult>;

/// Value type that can be serialized
#[derive(Debug, Clone)]
pub enum Value {
    /// Boolean value
    Boolean(bool),
    /// Unsigned 8-bit integer
    Uint8(u8),
    /// Unsigned integer
    Uint(u64),
    /// Signed integer
    Int(i64),
    /// Floating point number
    Float(f64),
    /// String
    String(String),
    /// Byte array
    Bytes(Vec<u8>),
    /// Array of values
    Array(Vec<Value>),
    /// Object with string keys
    Object(BTreeMap<String, Value>),
    /// Map with arbitrary keys, in insertion order
    Map(Vec<(Value, Value)>),
    /// Null value
    Null,
    /// Date (represented as an ISO-8601 string)
    Date(String),
    /// BigInt (u64)
    Bigint(u64),
    /// Deferred value resolved by an async producer
    Promise(PromiseValue),
    /// Stream of values
    Stream(StreamValue),
    /// Stream of raw byte chunks
    ByteStream(ByteStreamValue),
}

impl Value {
    /// Whether this value is itself a live streaming handle
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            Value::Promise(_) | Value::Stream(_) | Value::ByteStream(_)
        )
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Uint8(a), Value::Uint8(b)) => a == b,
            (Value::Uint(a), Value::Uint(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            // Bit equality keeps NaN == NaN and distinguishes signed zeros.
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Null, Value::Null) => true,
            (Value::Date(a), Value::Date(b)) => a == b,
            (Value::Bigint(a), Value::Bigint(b)) => a == b,
            (Value::Promise(a), Value::Promise(b)) => a.same_handle(b),
            (Value::Stream(a), Value::Stream(b)) => a.same_handle(b),
            (Value::ByteStream(a), Value::ByteStream(b)) => a.same_handle(b),
            _ => false,
        }
    }
}

/// Runs its callback exactly once, when dropped. Used to tie decode-side
/// handler registrations to the lifetime of the consumer handle.
pub(crate) struct ReleaseGuard {
    on_release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ReleaseGuard {
    pub(crate) fn new(on_release: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            on_release: Some(Box::new(on_release)),
        }
    }
}

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        if let Some(on_release) = self.on_release.take() {
            on_release();
        }
    }
}

struct PromiseToken {
    _release: Option<ReleaseGuard>,
}

/// A deferred single value.
///
/// Cloning is cheap and every clone resolves to the same outcome; awaiting
/// more than once replays the stored result.
#[derive(Clone)]
pub struct PromiseValue {
    token: Arc<PromiseToken>,
    future: Shared<BoxFuture<'static, ValueResult>>,
}

impl PromiseValue {
    /// Wrap an async producer
    pub fn new<F>(future: F) -> Self
    where
        F: Future<Output = ValueResult> + Send + 'static,
    {
        Self::build(future.boxed(), None)
    }

    /// A promise that is already resolved
    pub fn resolved(value: Value) -> Self {
        Self::new(futures::future::ready(Ok(value)))
    }

    /// A promise that is already rejected with a typed error
    pub fn rejected(error: SerializableError) -> Self {
        Self::new(futures::future::ready(Err(StreamFault::Remote(error))))
    }

    pub(crate) fn with_guard(
        future: BoxFuture<'static, ValueResult>,
        guard: ReleaseGuard,
    ) -> Self {
        Self::build(future, Some(guard))
    }

    fn build(future: BoxFuture<'static, ValueResult>, guard: Option<ReleaseGuard>) -> Self {
        Self {
            token: Arc::new(PromiseToken { _release: guard }),
            future: future.shared(),
        }
    }

    /// Wait for the resolution of the promise
    pub async fn wait(&self) -> ValueResult {
        self.future.clone().await
    }

    pub(crate) fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.token) as usize
    }

    pub(crate) fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.token, &other.token)
    }
}

impl fmt::Debug for PromiseValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PromiseValue")
    }
}

struct FanBuffer<T> {
    items: Vec<T>,
    done: bool,
}

pub(crate) struct FanInner<T> {
    source: tokio::sync::Mutex<Option<BoxStream<'static, T>>>,
    buffer: Mutex<FanBuffer<T>>,
    _release: Option<ReleaseGuard>,
}

impl<T> FanInner<T> {
    fn new(source: BoxStream<'static, T>, release: Option<ReleaseGuard>) -> Arc<Self> {
        Arc::new(Self {
            source: tokio::sync::Mutex::new(Some(source)),
            buffer: Mutex::new(FanBuffer {
                items: Vec::new(),
                done: false,
            }),
            _release: release,
        })
    }
}

/// Independent cursor over a fanned-out stream.
///
/// Items already pulled by any reader are replayed from the shared buffer;
/// the reader at the frontier pulls fresh items from the source.
pub struct FanOutReader<T> {
    inner: Arc<FanInner<T>>,
    pos: usize,
}

impl<T: Clone> FanOutReader<T> {
    /// Next item, or `None` once the source is exhausted
    pub async fn next(&mut self) -> Option<T> {
        loop {
            {
                let buffer = self.inner.buffer.lock().unwrap();
                if self.pos < buffer.items.len() {
                    let item = buffer.items[self.pos].clone();
                    self.pos += 1;
                    return Some(item);
                }
                if buffer.done {
                    return None;
                }
            }
            let mut source = self.inner.source.lock().await;
            {
                // Another reader may have advanced the frontier while we
                // waited for the source lock.
                let buffer = self.inner.buffer.lock().unwrap();
                if self.pos < buffer.items.len() || buffer.done {
                    continue;
                }
            }
            let next = match source.as_mut() {
                Some(stream) => stream.next().await,
                None => None,
            };
            let mut buffer = self.inner.buffer.lock().unwrap();
            match next {
                Some(item) => buffer.items.push(item),
                None => {
                    buffer.done = true;
                    *source = None;
                }
            }
        }
    }

    /// Collect every remaining item
    pub async fn collect_remaining(&mut self) -> Vec<T> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item);
        }
        items
    }
}

/// A stream of values.
#[derive(Clone)]
pub struct StreamValue {
    inner: Arc<FanInner<ValueResult>>,
}

impl StreamValue {
    /// Wrap an async stream of values
    pub fn new(stream: impl Stream<Item = ValueResult> + Send + 'static) -> Self {
        Self {
            inner: FanInner::new(stream.boxed(), None),
        }
    }

    /// A finite stream over already-known values
    pub fn from_values(values: Vec<Value>) -> Self {
        Self::new(futures::stream::iter(values.into_iter().map(Ok)))
    }

    pub(crate) fn with_guard(
        stream: BoxStream<'static, ValueResult>,
        guard: ReleaseGuard,
    ) -> Self {
        Self {
            inner: FanInner::new(stream, Some(guard)),
        }
    }

    /// Open an independent reader over this stream
    pub fn subscribe(&self) -> ValueStreamReader {
        FanOutReader {
            inner: self.inner.clone(),
            pos: 0,
        }
    }

    pub(crate) fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for StreamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StreamValue")
    }
}

/// A stream of raw byte chunks.
#[derive(Clone)]
pub struct ByteStreamValue {
    inner: Arc<FanInner<ByteResult>>,
}

impl ByteStreamValue {
    /// Wrap an async stream of byte chunks
    pub fn new(stream: impl Stream<Item = ByteResult> + Send + 'static) -> Self {
        Self {
            inner: FanInner::new(stream.boxed(), None),
        }
    }

    /// A finite byte stream over already-known chunks
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        Self::new(futures::stream::iter(chunks.into_iter().map(Ok)))
    }

    pub(crate) fn with_guard(stream: BoxStream<'static, ByteResult>, guard: ReleaseGuard) -> Self {
        Self {
            inner: FanInner::new(stream, Some(guard)),
        }
    }

    /// Open an independent reader over this stream
    pub fn subscribe(&self) -> ByteStreamReader {
        FanOutReader {
            inner: self.inner.clone(),
            pos: 0,
        }
    }

    pub(crate) fn handle_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn same_handle(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ByteStreamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteStreamValue")
    }
}
