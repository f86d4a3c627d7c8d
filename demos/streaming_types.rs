//! Example demonstrating Promise, Iterator/Stream, and ReadableStream types
//!
//! Streaming values are carried over multiplexed sub-streams and come out
//! of deserialization as live consumer handles.

use async_stream::stream;
use bytes::Bytes;
use cablegram::{
    deserialize, serialize, ByteStreamValue, PromiseValue, Schema, StreamValue, Value,
};
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Cablegram Streaming Types Example ===\n");

    // Example 1: Promise type
    println!("Example 1: Promise");
    {
        let schema = Schema::promise(Schema::string());
        let value = Value::Promise(PromiseValue::new(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(Value::String("Resolved value!".to_string()))
        }));

        let (client, server) = tokio::io::duplex(4096);
        let writer = tokio::spawn(async move {
            let mut client = client;
            serialize(&schema, &value, &mut client, true).await
        });

        let (_, deserialized) = deserialize(server, None).await?;
        if let Value::Promise(promise) = deserialized {
            println!("  Promise resolved to: {:?}", promise.wait().await);
        }
        writer.await??;
        println!();
    }

    // Example 2: Iterator/Stream type
    println!("Example 2: Iterator/Stream");
    {
        let schema = Schema::iterator(Schema::uint());
        let number_stream = stream! {
            for i in 0..5 {
                tokio::time::sleep(Duration::from_millis(20)).await;
                yield Ok(Value::Uint(i));
            }
        };
        let value = Value::Stream(StreamValue::new(number_stream));

        let (client, server) = tokio::io::duplex(4096);
        let writer = tokio::spawn(async move {
            let mut client = client;
            serialize(&schema, &value, &mut client, true).await
        });

        let (_, deserialized) = deserialize(server, None).await?;
        if let Value::Stream(stream) = deserialized {
            let mut reader = stream.subscribe();
            while let Some(item) = reader.next().await {
                println!("  Stream item: {:?}", item?);
            }
        }
        writer.await??;
        println!();
    }

    // Example 3: ReadableStream (byte stream)
    println!("Example 3: ReadableStream");
    {
        let schema = Schema::readable_stream();
        let byte_stream = stream! {
            for chunk in [
                Bytes::from("Hello, "),
                Bytes::from("streaming "),
                Bytes::from("world!"),
            ] {
                tokio::time::sleep(Duration::from_millis(20)).await;
                yield Ok(chunk);
            }
        };
        let value = Value::ByteStream(ByteStreamValue::new(byte_stream));

        let (client, server) = tokio::io::duplex(4096);
        let writer = tokio::spawn(async move {
            let mut client = client;
            serialize(&schema, &value, &mut client, true).await
        });

        let (_, deserialized) = deserialize(server, None).await?;
        if let Value::ByteStream(stream) = deserialized {
            let mut reader = stream.subscribe();
            let mut text = Vec::new();
            while let Some(chunk) = reader.next().await {
                text.extend_from_slice(&chunk?);
            }
            println!("  Received bytes: {:?}", String::from_utf8_lossy(&text));
        }
        writer.await??;
        println!();
    }

    // Example 4: Schema serialization
    println!("Example 4: Schema serialization");
    {
        let promise_schema = Schema::promise(Schema::string());
        let iterator_schema = Schema::iterator(Schema::uint());
        let stream_schema = Schema::readable_stream();

        println!("  Promise schema bytes: {:?}", promise_schema.to_bytes());
        println!("  Iterator schema bytes: {:?}", iterator_schema.to_bytes());
        println!(
            "  ReadableStream schema bytes: {:?}\n",
            stream_schema.to_bytes()
        );
    }

    // Example 5: Complex nested with Promise
    println!("Example 5: Complex object with Promise field");
    {
        let schema = Schema::object(vec![
            ("id".to_string(), Schema::uint()),
            ("name".to_string(), Schema::string()),
            (
                "async_data".to_string(),
                Schema::promise(Schema::array(Schema::string())),
            ),
        ]);
        println!("  Schema bytes: {:?}", schema.to_bytes());
        println!("  Streaming fields nest anywhere inside the value tree");
    }

    Ok(())
}
