//! Input-schema normalisation for the model.
//!
//! Manifest and endpoint schemas use loose type names (`bool`, `int`); the
//! endpoint's function-calling grammar wants JSON-schema types. Only the
//! property `type` fields are rewritten; everything else passes through.

use serde_json::Value;

/// Map a loose type name onto the JSON-schema type the endpoint expects.
pub fn normalize_type(loose: &str) -> &str {
    match loose {
        "bool" => "boolean",
        "int" | "integer" | "float" | "double" => "number",
        other => other,
    }
}

/// Rewrite the `type` field of every property in an object schema.
pub fn normalize_schema(schema: &Value) -> Value {
    let mut converted = schema.clone();

    if let Some(properties) = converted
        .get_mut("properties")
        .and_then(|p| p.as_object_mut())
    {
        for prop in properties.values_mut() {
            if let Some(type_str) = prop.get("type").and_then(|t| t.as_str()) {
                let normalized = normalize_type(type_str).to_string();
                prop["type"] = Value::String(normalized);
            }
        }
    }

    converted
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn loose_types_map_to_json_schema_types() {
        assert_eq!(normalize_type("bool"), "boolean");
        assert_eq!(normalize_type("int"), "number");
        assert_eq!(normalize_type("integer"), "number");
        assert_eq!(normalize_type("float"), "number");
        assert_eq!(normalize_type("string"), "string");
        assert_eq!(normalize_type("array"), "array");
        assert_eq!(normalize_type("object"), "object");
        // Unknown types pass through untouched.
        assert_eq!(normalize_type("mystery"), "mystery");
    }

    #[test]
    fn schema_properties_are_rewritten() {
        let schema = json!({
            "type": "object",
            "properties": {
                "verbose": {"type": "bool", "description": "chatty output"},
                "depth": {"type": "int"},
                "target": {"type": "string"}
            },
            "required": ["target"]
        });

        let normalized = normalize_schema(&schema);
        assert_eq!(normalized["properties"]["verbose"]["type"], "boolean");
        assert_eq!(normalized["properties"]["depth"]["type"], "number");
        assert_eq!(normalized["properties"]["target"]["type"], "string");
        // Untouched fields survive.
        assert_eq!(
            normalized["properties"]["verbose"]["description"],
            "chatty output"
        );
        assert_eq!(normalized["required"], json!(["target"]));
    }

    #[test]
    fn schema_without_properties_is_unchanged() {
        let schema = json!({"type": "object"});
        assert_eq!(normalize_schema(&schema), schema);
    }
}
