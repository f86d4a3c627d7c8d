//! Compression table state
//!
//! Serialization keeps a per-session scratchpad with two tables: an
//! identity table keyed by the value itself (content for leaf values,
//! shared-handle identity for streaming values) and, for deep
//! constructors, a table keyed by a canonical string rendering. Owned
//! composite values cannot alias, so they are deduplicated only through
//! the deep table. Keyed streaming handles are pinned by the scratchpad
//! for the rest of the session, so a handle address can never be reused
//! while its table entry is live. The read side keeps the mirror image: a
//! vector of previously materialized values addressed by entry index.
//!
//! Index allocation is children-first: an entry's index is assigned after
//! its inline body has been planned, which is also the order in which the
//! reader pushes materialized entries.

use crate::value::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ScratchKey {
    Null,
    Bool(bool),
    Uint8(u8),
    Uint(u64),
    Int(i64),
    FloatBits(u64),
    Bigint(u64),
    Str(String),
    Bytes(Vec<u8>),
    Date(String),
    Handle(usize),
}

impl ScratchKey {
    fn for_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(ScratchKey::Null),
            Value::Boolean(b) => Some(ScratchKey::Bool(*b)),
            Value::Uint8(n) => Some(ScratchKey::Uint8(*n)),
            Value::Uint(n) => Some(ScratchKey::Uint(*n)),
            Value::Int(n) => Some(ScratchKey::Int(*n)),
            Value::Float(f) => Some(ScratchKey::FloatBits(f.to_bits())),
            Value::Bigint(n) => Some(ScratchKey::Bigint(*n)),
            Value::String(s) => Some(ScratchKey::Str(s.clone())),
            Value::Bytes(b) => Some(ScratchKey::Bytes(b.clone())),
            Value::Date(s) => Some(ScratchKey::Date(s.clone())),
            // Owned composites cannot alias; the deep table covers them.
            Value::Array(_) | Value::Object(_) | Value::Map(_) => None,
            // Streaming handles share identity across clones.
            Value::Promise(p) => Some(ScratchKey::Handle(p.handle_id())),
            Value::Stream(s) => Some(ScratchKey::Handle(s.handle_id())),
            Value::ByteStream(s) => Some(ScratchKey::Handle(s.handle_id())),
        }
    }
}

/// Result of a table lookup during the plan pass
pub(crate) enum TableLookup {
    /// The value was seen before; reference entry `index`
    Existing(usize),
    /// New entry; call [`WriteScratchpad::commit`] once its body is planned
    Miss(PendingEntry),
}

pub(crate) struct PendingEntry {
    key: Option<ScratchKey>,
    canon: Option<String>,
    pin: Option<Value>,
}

/// Per-session mutable dedup state for the write side
pub(crate) struct WriteScratchpad {
    identity: HashMap<ScratchKey, usize>,
    deep: HashMap<String, usize>,
    fresh: usize,
    prefix: String,
    pinned: Vec<Value>,
}

impl WriteScratchpad {
    pub(crate) fn new() -> Self {
        Self {
            identity: HashMap::new(),
            deep: HashMap::new(),
            fresh: 0,
            // Random per-session prefix so canonical strings can never
            // collide with keys from another session.
            prefix: format!("{:016x}", rand::random::<u64>()),
            pinned: Vec::new(),
        }
    }

    pub(crate) fn lookup(&mut self, value: &Value, deep: bool) -> TableLookup {
        let key = ScratchKey::for_value(value);
        if let Some(key) = &key {
            if let Some(&index) = self.identity.get(key) {
                return TableLookup::Existing(index);
            }
        }
        let pin = value.is_streaming().then(|| value.clone());
        if deep && !value.is_streaming() {
            let canon = format!("{}:{}", self.prefix, canonical_string(value));
            if let Some(&index) = self.deep.get(&canon) {
                if let Some(key) = key {
                    self.identity.insert(key, index);
                }
                return TableLookup::Existing(index);
            }
            TableLookup::Miss(PendingEntry {
                key,
                canon: Some(canon),
                pin,
            })
        } else {
            TableLookup::Miss(PendingEntry {
                key,
                canon: None,
                pin,
            })
        }
    }

    pub(crate) fn commit(&mut self, pending: PendingEntry) -> usize {
        let index = self.fresh;
        self.fresh += 1;
        if let Some(key) = pending.key {
            self.identity.insert(key, index);
        }
        if let Some(canon) = pending.canon {
            self.deep.insert(canon, index);
        }
        if let Some(pin) = pending.pin {
            self.pinned.push(pin);
        }
        index
    }
}

/// Canonical string rendering used by the deep table.
///
/// Unorderable contents collapse to opaque sentinels, so two values that
/// differ only in live streams compare equal here; deep lookup is skipped
/// when the value itself is a streaming handle.
pub(crate) fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    render(value, &mut out);
    out
}

fn render(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Uint8(n) => out.push_str(&n.to_string()),
        Value::Uint(n) => out.push_str(&n.to_string()),
        Value::Int(n) => out.push_str(&n.to_string()),
        Value::Float(f) => out.push_str(&f.to_string()),
        Value::Bigint(n) => {
            out.push_str(&n.to_string());
            out.push('n');
        }
        Value::String(s) => out.push_str(&format!("{:?}", s)),
        Value::Bytes(bytes) => {
            out.push_str("0x");
            for byte in bytes {
                out.push_str(&format!("{:02x}", byte));
            }
        }
        Value::Date(s) => out.push_str(&format!("Date({})", s)),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(item, out);
            }
            out.push(']');
        }
        Value::Object(fields) => {
            out.push('{');
            for (i, (key, item)) in fields.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&format!("{:?}:", key));
                render(item, out);
            }
            out.push('}');
        }
        Value::Map(entries) => {
            out.push_str("Map{");
            for (i, (key, item)) in entries.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                render(key, out);
                out.push_str("=>");
                render(item, out);
            }
            out.push('}');
        }
        Value::Promise(_) => out.push_str("[Promise]"),
        Value::Stream(_) => out.push_str("[Iterable]"),
        Value::ByteStream(_) => out.push_str("[ReadableStream]"),
    }
}

/// Index-addressed table of previously materialized values on the read side.
///
/// Entries are returned by clone; streaming handles inside an entry replay
/// their items, so handing the same entry out twice is safe.
#[derive(Default)]
pub(crate) struct ReadTable {
    entries: Vec<Value>,
}

impl ReadTable {
    pub(crate) fn push(&mut self, value: Value) {
        self.entries.push(value);
    }

    pub(crate) fn get(&self, index: usize) -> Option<Value> {
        self.entries.get(index).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StreamValue;

    #[test]
    fn test_identity_dedup_by_content_for_leaves() {
        let mut pad = WriteScratchpad::new();
        let a1 = Value::String("a".to_string());
        let a2 = Value::String("a".to_string());

        let pending = match pad.lookup(&a1, false) {
            TableLookup::Miss(p) => p,
            TableLookup::Existing(_) => panic!("first lookup must miss"),
        };
        assert_eq!(pad.commit(pending), 0);

        // A second, separately allocated but equal string hits the entry.
        match pad.lookup(&a2, false) {
            TableLookup::Existing(index) => assert_eq!(index, 0),
            TableLookup::Miss(_) => panic!("expected identity hit"),
        }
    }

    #[test]
    fn test_deep_dedup_for_composites() {
        let mut pad = WriteScratchpad::new();
        let obj1 = Value::Array(vec![Value::Uint(1), Value::Uint(2)]);
        let obj2 = Value::Array(vec![Value::Uint(1), Value::Uint(2)]);

        let pending = match pad.lookup(&obj1, true) {
            TableLookup::Miss(p) => p,
            TableLookup::Existing(_) => panic!("first lookup must miss"),
        };
        pad.commit(pending);

        match pad.lookup(&obj2, true) {
            TableLookup::Existing(index) => assert_eq!(index, 0),
            TableLookup::Miss(_) => panic!("expected deep hit"),
        }

        // Without the deep flag, a distinct node misses.
        let obj3 = Value::Array(vec![Value::Uint(1), Value::Uint(2)]);
        assert!(matches!(pad.lookup(&obj3, false), TableLookup::Miss(_)));
    }

    #[test]
    fn test_stream_handles_dedup_by_handle() {
        let mut pad = WriteScratchpad::new();
        let stream = Value::Stream(StreamValue::from_values(vec![Value::Uint(1)]));
        let clone = stream.clone();

        let pending = match pad.lookup(&stream, true) {
            TableLookup::Miss(p) => p,
            TableLookup::Existing(_) => panic!("first lookup must miss"),
        };
        pad.commit(pending);

        match pad.lookup(&clone, true) {
            TableLookup::Existing(index) => assert_eq!(index, 0),
            TableLookup::Miss(_) => panic!("clones share handle identity"),
        }
    }

    #[test]
    fn test_canonical_string_shapes() {
        let value = Value::Object(
            [
                ("big".to_string(), Value::Bigint(7)),
                ("list".to_string(), Value::Array(vec![Value::Null])),
            ]
            .into_iter()
            .collect(),
        );
        assert_eq!(canonical_string(&value), "{\"big\":7n,\"list\":[null]}");

        let map = Value::Map(vec![(Value::Uint(1), Value::Boolean(true))]);
        assert_eq!(canonical_string(&map), "Map{1=>true}");
    }
}
