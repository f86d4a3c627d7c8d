//! Stream multiplexing for handling concurrent sub-streams over a single
//! connection
//!
//! Streaming values (promises, iterators, byte streams) reserve a 16-bit
//! sub-stream ID in the root buffer and move their actual content through
//! routed frames of the form `[id_high][id_low][payload]`. The write side
//! runs one producer task per sub-stream and funnels frames through a
//! session channel; the read side registers one handler per ID and routes
//! incoming frames until every registration is released.

use crate::compression::WriteScratchpad;
use crate::data_types::DataType;
use crate::error::{CablegramError, SerializableError, StreamFault};
use crate::read_context::ReadContext;
use crate::reflect::read_schema;
use crate::rolling_uint::{push_rolling_uint, read_rolling_uint};
use crate::schema::Schema;
use crate::serialize::frame_value_bytes;
use crate::value::{
    ByteStreamValue, PromiseValue, ReleaseGuard, StreamValue, Value,
};
use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, trace, warn};

/// Sub-stream ID space limit
const MAX_SUB_STREAMS: u32 = u16::MAX as u32;

/// Stream identifier type
pub type StreamId = u16;

/// Frame handed from a producer task to the session's transport writer
#[derive(Debug)]
pub(crate) enum FrameMessage {
    /// Routed payload for a sub-stream
    Data { id: StreamId, payload: Vec<u8> },
    /// The producer finished; no bytes, only lifecycle accounting
    Closed { id: StreamId },
}

/// Write-side session state shared with every producer task
pub(crate) struct WriteSession {
    next_id: Mutex<u32>,
    active: AtomicUsize,
    frames: mpsc::UnboundedSender<FrameMessage>,
    pub(crate) scratchpad: Mutex<WriteScratchpad>,
}

impl WriteSession {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FrameMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                next_id: Mutex::new(1),
                active: AtomicUsize::new(0),
                frames: tx,
                scratchpad: Mutex::new(WriteScratchpad::new()),
            }),
            rx,
        )
    }

    /// Allocate the next sub-stream ID and a writer feeding the session
    pub(crate) fn open_sub_stream(
        &self,
    ) -> Result<(StreamId, SubStreamWriter), CablegramError> {
        let id = {
            let mut next_id = self.next_id.lock().unwrap();
            if *next_id > MAX_SUB_STREAMS {
                return Err(CablegramError::internal("sub-stream id space exhausted"));
            }
            let id = *next_id as StreamId;
            *next_id += 1;
            id
        };
        self.active.fetch_add(1, Ordering::SeqCst);
        trace!(id, "opened sub-stream");
        Ok((
            id,
            SubStreamWriter {
                id,
                frames: self.frames.clone(),
                closed: false,
            },
        ))
    }

    /// Number of sub-streams whose producers have not yet closed
    pub(crate) fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub(crate) fn note_closed(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Writer handle owned by one producer task
pub(crate) struct SubStreamWriter {
    id: StreamId,
    frames: mpsc::UnboundedSender<FrameMessage>,
    closed: bool,
}

impl SubStreamWriter {
    /// Queue one routed frame. A send failure means the session is gone
    /// and the producer simply stops.
    pub(crate) fn send(&self, payload: Vec<u8>) {
        let _ = self.frames.send(FrameMessage::Data {
            id: self.id,
            payload,
        });
    }

    pub(crate) fn close(mut self) {
        self.closed = true;
        let _ = self.frames.send(FrameMessage::Closed { id: self.id });
    }
}

impl Drop for SubStreamWriter {
    fn drop(&mut self) {
        if !self.closed {
            let _ = self.frames.send(FrameMessage::Closed { id: self.id });
        }
    }
}

/// Build an error frame payload: flag, inline error schema, error value.
///
/// Falls back to a plain string payload when the error value itself fails
/// to serialize.
fn error_frame_payload(
    flag: u8,
    error: &SerializableError,
    session: &Arc<WriteSession>,
    pad: &mut WriteScratchpad,
) -> Vec<u8> {
    let mut payload = vec![flag];
    match frame_value_bytes(&error.schema, &error.data, session, pad) {
        Ok(body) => {
            payload.extend_from_slice(&error.schema.to_bytes());
            payload.extend_from_slice(&body);
            payload
        }
        Err(err) => {
            warn!(%err, "error payload does not serialize; sending message text");
            let text = err.to_string();
            let mut payload = vec![flag, DataType::String.to_u8()];
            push_rolling_uint(&mut payload, text.len() as u64);
            payload.extend_from_slice(text.as_bytes());
            payload
        }
    }
}

/// Spawn the producer task for a promise sub-stream.
///
/// Exactly one frame is emitted: flag 1 followed by the resolved value, or
/// flag 0 followed by an inline error schema and error value.
pub(crate) fn spawn_promise_producer(
    session: Arc<WriteSession>,
    inner: Schema,
    promise: PromiseValue,
    writer: SubStreamWriter,
) {
    tokio::spawn(async move {
        let outcome = promise.wait().await;
        {
            let mut pad = session.scratchpad.lock().unwrap();
            let payload = match outcome {
                Ok(value) => match frame_value_bytes(&inner, &value, &session, &mut pad) {
                    Ok(body) => {
                        let mut payload = Vec::with_capacity(1 + body.len());
                        payload.push(1);
                        payload.extend_from_slice(&body);
                        payload
                    }
                    Err(err) => error_frame_payload(
                        0,
                        &SerializableError::message(err.to_string()),
                        &session,
                        &mut pad,
                    ),
                },
                Err(StreamFault::Remote(remote)) => {
                    error_frame_payload(0, &remote, &session, &mut pad)
                }
                Err(StreamFault::Disconnected) => error_frame_payload(
                    0,
                    &SerializableError::message("upstream disconnected"),
                    &session,
                    &mut pad,
                ),
            };
            writer.send(payload);
        }
        writer.close();
    });
}

/// Spawn the producer task for an iterator sub-stream.
///
/// Continuation frames carry flag 1 and one value each; the stream ends
/// with a single flag 0 frame, or flag 2 plus an inline error.
pub(crate) fn spawn_iterator_producer(
    session: Arc<WriteSession>,
    inner: Schema,
    stream: StreamValue,
    writer: SubStreamWriter,
) {
    tokio::spawn(async move {
        let mut items = stream.subscribe();
        loop {
            match items.next().await {
                Some(Ok(value)) => {
                    let mut pad = session.scratchpad.lock().unwrap();
                    match frame_value_bytes(&inner, &value, &session, &mut pad) {
                        Ok(body) => {
                            let mut payload = Vec::with_capacity(1 + body.len());
                            payload.push(1);
                            payload.extend_from_slice(&body);
                            writer.send(payload);
                        }
                        Err(err) => {
                            let remote = SerializableError::message(err.to_string());
                            writer.send(error_frame_payload(2, &remote, &session, &mut pad));
                            break;
                        }
                    }
                }
                Some(Err(fault)) => {
                    let remote = match fault {
                        StreamFault::Remote(remote) => remote,
                        StreamFault::Disconnected => {
                            SerializableError::message("upstream disconnected")
                        }
                    };
                    let mut pad = session.scratchpad.lock().unwrap();
                    writer.send(error_frame_payload(2, &remote, &session, &mut pad));
                    break;
                }
                None => {
                    writer.send(vec![0]);
                    break;
                }
            }
        }
        writer.close();
    });
}

/// Spawn the producer task for a byte-stream sub-stream.
///
/// Each frame carries a length-prefixed chunk; a zero length marks EOF,
/// so empty source chunks are filtered out.
pub(crate) fn spawn_byte_stream_producer(
    session: Arc<WriteSession>,
    stream: ByteStreamValue,
    writer: SubStreamWriter,
) {
    tokio::spawn(async move {
        // When this sub-stream was introduced inside another frame, that
        // frame's producer holds the scratchpad lock until its payload is
        // queued; taking the lock once here keeps our first chunk from
        // overtaking the frame that announces our ID.
        drop(session.scratchpad.lock().unwrap());
        let mut chunks = stream.subscribe();
        loop {
            match chunks.next().await {
                Some(Ok(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    let mut payload = Vec::with_capacity(chunk.len() + 9);
                    push_rolling_uint(&mut payload, chunk.len() as u64);
                    payload.extend_from_slice(&chunk);
                    writer.send(payload);
                }
                Some(Err(fault)) => {
                    warn!(%fault, "byte stream source failed; ending sub-stream");
                    break;
                }
                None => break,
            }
        }
        writer.send(vec![0]);
        writer.close();
    });
}

#[derive(Clone)]
enum HandlerKind {
    Promise(Schema),
    Iterator(Schema),
    ByteStream,
}

enum HandlerSink {
    Promise(Option<oneshot::Sender<Result<Value, StreamFault>>>),
    Stream(mpsc::UnboundedSender<Result<Value, StreamFault>>),
    Bytes(mpsc::UnboundedSender<Result<Bytes, StreamFault>>),
}

struct ReadHandler {
    kind: HandlerKind,
    sink: HandlerSink,
    released_flag: Arc<AtomicBool>,
}

/// Read-side session state: handler registry and usage accounting.
///
/// `usages` counts registrations that are both unfinished and still wanted
/// by a consumer. A registration is released exactly once, either when its
/// terminator frame is parsed or when the consumer handle is dropped;
/// whichever comes first. When the count reaches zero the dispatcher stops
/// reading and the input is abandoned. A dropped consumer whose sub-stream
/// is still open keeps being routed with its frames discarded, so the
/// other sub-streams stay live.
pub(crate) struct ReadSession {
    handlers: Mutex<HashMap<StreamId, ReadHandler>>,
    usages: AtomicUsize,
    released: Notify,
    table: Mutex<crate::compression::ReadTable>,
}

impl ReadSession {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            usages: AtomicUsize::new(0),
            released: Notify::new(),
            table: Mutex::new(crate::compression::ReadTable::default()),
        })
    }

    pub(crate) fn usages(&self) -> usize {
        self.usages.load(Ordering::SeqCst)
    }

    fn release(&self, flag: &AtomicBool) {
        if !flag.swap(true, Ordering::SeqCst) {
            self.usages.fetch_sub(1, Ordering::SeqCst);
            self.released.notify_one();
        }
    }

    fn register(
        &self,
        id: StreamId,
        kind: HandlerKind,
        sink: HandlerSink,
    ) -> Result<Arc<AtomicBool>, CablegramError> {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&id) {
            return Err(CablegramError::protocol(format!(
                "duplicate sub-stream id: {}",
                id
            )));
        }
        let flag = Arc::new(AtomicBool::new(false));
        handlers.insert(
            id,
            ReadHandler {
                kind,
                sink,
                released_flag: flag.clone(),
            },
        );
        self.usages.fetch_add(1, Ordering::SeqCst);
        trace!(id, "registered sub-stream handler");
        Ok(flag)
    }

    fn take_handler(&self, id: StreamId) -> Option<ReadHandler> {
        self.handlers.lock().unwrap().remove(&id)
    }

    /// Register a promise handler and return the consumer handle
    pub(crate) fn register_promise(
        self: &Arc<Self>,
        id: StreamId,
        inner: Schema,
    ) -> Result<PromiseValue, CablegramError> {
        let (tx, rx) = oneshot::channel();
        let flag = self.register(id, HandlerKind::Promise(inner), HandlerSink::Promise(Some(tx)))?;
        let session = self.clone();
        let guard = ReleaseGuard::new(move || session.release(&flag));
        let future = async move {
            match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(StreamFault::Disconnected),
            }
        }
        .boxed();
        Ok(PromiseValue::with_guard(future, guard))
    }

    /// Register an iterator handler and return the consumer handle
    pub(crate) fn register_iterator(
        self: &Arc<Self>,
        id: StreamId,
        inner: Schema,
    ) -> Result<StreamValue, CablegramError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let flag = self.register(id, HandlerKind::Iterator(inner), HandlerSink::Stream(tx))?;
        let session = self.clone();
        let guard = ReleaseGuard::new(move || session.release(&flag));
        let source = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(StreamValue::with_guard(source, guard))
    }

    /// Register a byte-stream handler and return the consumer handle
    pub(crate) fn register_byte_stream(
        self: &Arc<Self>,
        id: StreamId,
    ) -> Result<ByteStreamValue, CablegramError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let flag = self.register(id, HandlerKind::ByteStream, HandlerSink::Bytes(tx))?;
        let session = self.clone();
        let guard = ReleaseGuard::new(move || session.release(&flag));
        let source = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        Ok(ByteStreamValue::with_guard(source, guard))
    }

    pub(crate) fn push_table(&self, value: Value) {
        self.table.lock().unwrap().push(value);
    }

    pub(crate) fn table_get(&self, index: usize) -> Option<Value> {
        self.table.lock().unwrap().get(index)
    }

    pub(crate) fn table_len(&self) -> usize {
        self.table.lock().unwrap().len()
    }

    /// Deliver a disconnect to every live handler and drop the registry
    fn fault_all(&self) {
        let handlers: Vec<ReadHandler> = {
            let mut map = self.handlers.lock().unwrap();
            map.drain().map(|(_, handler)| handler).collect()
        };
        for handler in handlers {
            match handler.sink {
                HandlerSink::Promise(Some(tx)) => {
                    let _ = tx.send(Err(StreamFault::Disconnected));
                }
                HandlerSink::Promise(None) => {}
                HandlerSink::Stream(tx) => {
                    let _ = tx.send(Err(StreamFault::Disconnected));
                }
                HandlerSink::Bytes(tx) => {
                    let _ = tx.send(Err(StreamFault::Disconnected));
                }
            }
            self.release(&handler.released_flag);
        }
    }
}

/// Route one frame to its registered handler.
///
/// Frame payloads are not length-delimited; the handler's kind decides how
/// many bytes belong to this frame, and the dispatcher hands the reader
/// back at the next frame boundary.
async fn route_frame<R: AsyncRead + Unpin + Send>(
    ctx: &mut ReadContext<R>,
    session: &Arc<ReadSession>,
    id: StreamId,
) -> Result<(), CablegramError> {
    let kind = {
        let handlers = session.handlers.lock().unwrap();
        handlers.get(&id).map(|handler| handler.kind.clone())
    };
    let kind = kind.ok_or_else(|| {
        CablegramError::protocol(format!("frame for unknown sub-stream id: {}", id))
    })?;

    match kind {
        HandlerKind::Promise(inner) => {
            let flag = ctx.read_byte().await?;
            let outcome = match flag {
                1 => Ok(crate::deserialize::read_value(&inner, ctx, session).await?),
                0 => {
                    let error_schema = read_schema(ctx).await?;
                    let data =
                        crate::deserialize::read_value(&error_schema, ctx, session).await?;
                    Err(StreamFault::Remote(SerializableError::new(
                        error_schema,
                        data,
                    )))
                }
                other => {
                    return Err(CablegramError::protocol(format!(
                        "invalid promise flag: {}",
                        other
                    )))
                }
            };
            if let Some(handler) = session.take_handler(id) {
                if let HandlerSink::Promise(Some(tx)) = handler.sink {
                    let _ = tx.send(outcome);
                }
                session.release(&handler.released_flag);
            }
            Ok(())
        }

        HandlerKind::Iterator(inner) => {
            let flag = ctx.read_byte().await?;
            match flag {
                1 => {
                    let value = crate::deserialize::read_value(&inner, ctx, session).await?;
                    let sender = {
                        let handlers = session.handlers.lock().unwrap();
                        handlers.get(&id).and_then(|handler| match &handler.sink {
                            HandlerSink::Stream(tx) => Some(tx.clone()),
                            _ => None,
                        })
                    };
                    if let Some(tx) = sender {
                        // A failed send means the consumer is gone; keep
                        // routing and discard (slurp).
                        let _ = tx.send(Ok(value));
                    }
                    Ok(())
                }
                0 => {
                    if let Some(handler) = session.take_handler(id) {
                        session.release(&handler.released_flag);
                    }
                    Ok(())
                }
                2 => {
                    let error_schema = read_schema(ctx).await?;
                    let data =
                        crate::deserialize::read_value(&error_schema, ctx, session).await?;
                    if let Some(handler) = session.take_handler(id) {
                        if let HandlerSink::Stream(tx) = handler.sink {
                            let _ = tx.send(Err(StreamFault::Remote(SerializableError::new(
                                error_schema,
                                data,
                            ))));
                        }
                        session.release(&handler.released_flag);
                    }
                    Ok(())
                }
                other => Err(CablegramError::protocol(format!(
                    "invalid iterator flag: {}",
                    other
                ))),
            }
        }

        HandlerKind::ByteStream => {
            let len = read_rolling_uint(ctx).await? as usize;
            if len == 0 {
                if let Some(handler) = session.take_handler(id) {
                    session.release(&handler.released_flag);
                }
                return Ok(());
            }
            let bytes = ctx.read_bytes(len).await?;
            let sender = {
                let handlers = session.handlers.lock().unwrap();
                handlers.get(&id).and_then(|handler| match &handler.sink {
                    HandlerSink::Bytes(tx) => Some(tx.clone()),
                    _ => None,
                })
            };
            if let Some(tx) = sender {
                let _ = tx.send(Ok(Bytes::from(bytes)));
            }
            Ok(())
        }
    }
}

/// Read routed frames until every registration is released or the
/// transport ends.
pub(crate) async fn run_dispatcher<R: AsyncRead + Unpin + Send>(
    mut ctx: ReadContext<R>,
    session: Arc<ReadSession>,
) {
    loop {
        if session.usages() == 0 {
            break;
        }
        let released = session.released.notified();
        tokio::pin!(released);
        // Selecting over a single-byte read is cancel-safe; the rest of the
        // frame ID and payload are read without interruption so the stream
        // never desynchronizes.
        let hi = tokio::select! {
            result = ctx.read_byte() => match result {
                Ok(byte) => byte,
                Err(err) => {
                    debug!(%err, "transport ended while sub-streams were live");
                    session.fault_all();
                    break;
                }
            },
            _ = &mut released => continue,
        };
        let routed = async {
            let lo = ctx.read_byte().await?;
            let id = ((hi as StreamId) << 8) | lo as StreamId;
            route_frame(&mut ctx, &session, id).await
        }
        .await;
        if let Err(err) = routed {
            debug!(%err, "frame routing failed; aborting session");
            session.fault_all();
            break;
        }
    }
    trace!("dispatcher finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sub_stream_ids_are_sequential() {
        let (session, _rx) = WriteSession::new();
        let (id1, _w1) = session.open_sub_stream().unwrap();
        let (id2, _w2) = session.open_sub_stream().unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);
        assert_eq!(session.active_count(), 2);
    }

    #[tokio::test]
    async fn test_writer_close_queues_lifecycle_message() {
        let (session, mut rx) = WriteSession::new();
        let (id, writer) = session.open_sub_stream().unwrap();

        writer.send(vec![1, 2, 3]);
        writer.close();

        match rx.recv().await.unwrap() {
            FrameMessage::Data { id: got, payload } => {
                assert_eq!(got, id);
                assert_eq!(payload, vec![1, 2, 3]);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(matches!(
            rx.recv().await.unwrap(),
            FrameMessage::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn test_writer_drop_still_closes() {
        let (session, mut rx) = WriteSession::new();
        let (_id, writer) = session.open_sub_stream().unwrap();
        drop(writer);
        assert!(matches!(
            rx.recv().await.unwrap(),
            FrameMessage::Closed { .. }
        ));
    }

    #[tokio::test]
    async fn test_usages_released_once_per_registration() {
        let session = ReadSession::new();
        let promise = session.register_promise(1, Schema::uint()).unwrap();
        let stream = session.register_iterator(2, Schema::uint()).unwrap();
        assert_eq!(session.usages(), 2);

        // Consumer drop releases its registration.
        drop(promise);
        assert_eq!(session.usages(), 1);

        // Terminator release and consumer drop do not double-count.
        if let Some(handler) = session.take_handler(2) {
            session.release(&handler.released_flag);
        }
        assert_eq!(session.usages(), 0);
        drop(stream);
        assert_eq!(session.usages(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_protocol_error() {
        let session = ReadSession::new();
        let _first = session.register_byte_stream(7).unwrap();
        assert!(matches!(
            session.register_byte_stream(7),
            Err(CablegramError::Protocol(_))
        ));
    }
}
