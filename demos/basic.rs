//! Basic example showing serialization and deserialization

use std::collections::BTreeMap;

use cablegram::{deserialize_from_bytes, serialize_to_bytes, Schema, Value};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Cablegram Example ===\n");

    // Example 1: Simple types
    println!("Example 1: Simple types");
    {
        let schema = Schema::uint();
        let value = Value::Uint(42);

        let buffer = serialize_to_bytes(&schema, &value, true).await?;
        println!("  Serialized uint(42) to {} bytes", buffer.len());

        let (_, deserialized) = deserialize_from_bytes(buffer, None).await?;
        println!("  Deserialized: {:?}\n", deserialized);
    }

    // Example 2: String
    println!("Example 2: String");
    {
        let schema = Schema::string();
        let value = Value::String("Hello, Cablegram!".to_string());

        let buffer = serialize_to_bytes(&schema, &value, true).await?;
        println!("  Serialized string to {} bytes", buffer.len());

        let (_, deserialized) = deserialize_from_bytes(buffer, None).await?;
        println!("  Deserialized: {:?}\n", deserialized);
    }

    // Example 3: Object (like a struct)
    println!("Example 3: Object");
    {
        let schema = Schema::object(vec![
            ("name".to_string(), Schema::string()),
            ("age".to_string(), Schema::uint()),
            ("active".to_string(), Schema::boolean()),
        ]);

        let mut obj = BTreeMap::new();
        obj.insert("name".to_string(), Value::String("Alice".to_string()));
        obj.insert("age".to_string(), Value::Uint(30));
        obj.insert("active".to_string(), Value::Boolean(true));
        let value = Value::Object(obj);

        let buffer = serialize_to_bytes(&schema, &value, true).await?;
        println!("  Serialized object to {} bytes", buffer.len());

        let (_, deserialized) = deserialize_from_bytes(buffer, None).await?;
        println!("  Deserialized: {:?}\n", deserialized);
    }

    // Example 4: Array
    println!("Example 4: Array");
    {
        let schema = Schema::array(Schema::uint());
        let value = Value::Array((1..=5).map(Value::Uint).collect());

        let buffer = serialize_to_bytes(&schema, &value, true).await?;
        println!("  Serialized array to {} bytes", buffer.len());

        let (_, deserialized) = deserialize_from_bytes(buffer, None).await?;
        println!("  Deserialized: {:?}\n", deserialized);
    }

    // Example 5: Schema digest drives the header optimization
    println!("Example 5: Schema digest");
    {
        let schema = Schema::object(vec![
            ("id".to_string(), Schema::uint()),
            ("note".to_string(), Schema::nullable(Some(Schema::string()))),
        ]);
        println!("  Schema bytes: {:?}", schema.to_bytes());
        println!("  Schema digest: {}", schema.digest());

        let mut obj = BTreeMap::new();
        obj.insert("id".to_string(), Value::Uint(7));
        obj.insert("note".to_string(), Value::Null);
        let value = Value::Object(obj);

        let with_schema = serialize_to_bytes(&schema, &value, true).await?;
        let without_schema = serialize_to_bytes(&schema, &value, false).await?;
        println!(
            "  With inline schema: {} bytes, without: {} bytes\n",
            with_schema.len(),
            without_schema.len()
        );
    }

    // Example 6: Compression table
    println!("Example 6: Compression table");
    {
        let schema = Schema::array(Schema::compression_table(Schema::string(), false));
        let value = Value::Array(vec![
            Value::String("repeated".to_string()),
            Value::String("repeated".to_string()),
            Value::String("repeated".to_string()),
        ]);

        let buffer = serialize_to_bytes(&schema, &value, false).await?;
        println!(
            "  Three repeated strings serialized to {} bytes (one inline entry)",
            buffer.len()
        );

        let (_, deserialized) = deserialize_from_bytes(buffer, Some(schema)).await?;
        println!("  Deserialized: {:?}", deserialized);
    }

    Ok(())
}
