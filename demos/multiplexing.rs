//! Example demonstrating stream multiplexing for Promise, Iterator, and
//! ReadableStream values sharing one transport
//!
//! A single object carries three streaming fields; their frames interleave
//! on the wire and are routed back to independent consumer handles.

use async_stream::stream;
use bytes::Bytes;
use cablegram::{
    deserialize, serialize, ByteStreamValue, PromiseValue, Schema, StreamValue, Value,
};
use std::collections::BTreeMap;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Stream Multiplexing Example ===\n");

    let schema = Schema::object(vec![
        ("job".to_string(), Schema::string()),
        ("result".to_string(), Schema::promise(Schema::string())),
        ("progress".to_string(), Schema::iterator(Schema::uint8())),
        ("log".to_string(), Schema::readable_stream()),
    ]);

    let progress = stream! {
        for pct in [25u8, 50, 75, 100] {
            tokio::time::sleep(Duration::from_millis(30)).await;
            yield Ok(Value::Uint8(pct));
        }
    };
    let log = stream! {
        for line in ["starting\n", "crunching\n", "done\n"] {
            tokio::time::sleep(Duration::from_millis(40)).await;
            yield Ok(Bytes::from(line));
        }
    };

    let mut obj = BTreeMap::new();
    obj.insert("job".to_string(), Value::String("report-7".to_string()));
    obj.insert(
        "result".to_string(),
        Value::Promise(PromiseValue::new(async {
            tokio::time::sleep(Duration::from_millis(120)).await;
            Ok(Value::String("report ready".to_string()))
        })),
    );
    obj.insert("progress".to_string(), Value::Stream(StreamValue::new(progress)));
    obj.insert("log".to_string(), Value::ByteStream(ByteStreamValue::new(log)));
    let value = Value::Object(obj);

    let (client, server) = tokio::io::duplex(16384);
    let writer = tokio::spawn(async move {
        let mut client = client;
        serialize(&schema, &value, &mut client, true).await
    });

    let (_, deserialized) = deserialize(server, None).await?;
    let mut fields = match deserialized {
        Value::Object(fields) => fields,
        other => panic!("expected object, got {:?}", other),
    };

    println!("Root value arrived: job = {:?}", fields.get("job"));

    let progress = match fields.remove("progress") {
        Some(Value::Stream(stream)) => stream,
        _ => unreachable!(),
    };
    let log = match fields.remove("log") {
        Some(Value::ByteStream(stream)) => stream,
        _ => unreachable!(),
    };
    let result = match fields.remove("result") {
        Some(Value::Promise(promise)) => promise,
        _ => unreachable!(),
    };

    // Consume the three sub-streams concurrently.
    let progress_task = tokio::spawn(async move {
        let mut reader = progress.subscribe();
        while let Some(item) = reader.next().await {
            println!("  progress: {:?}", item.unwrap());
        }
    });
    let log_task = tokio::spawn(async move {
        let mut reader = log.subscribe();
        while let Some(chunk) = reader.next().await {
            print!("  log: {}", String::from_utf8_lossy(&chunk.unwrap()));
        }
    });

    let resolved = result.wait().await;
    println!("  result: {:?}", resolved);

    progress_task.await?;
    log_task.await?;
    writer.await??;

    println!("\nAll sub-streams closed; session finished.");
    Ok(())
}
