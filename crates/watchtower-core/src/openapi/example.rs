//! Example payload synthesis from JSON Schema.
//!
//! Values are deterministic so generated request scaffolding is stable
//! between runs. Precedence: `example`, `default`, first `enum` value, then a
//! placeholder for the declared type.

use std::collections::HashSet;

use serde_json::{json, Map, Value};

use super::resolve::resolve_schema;

/// Nesting limit; deeper levels yield `null`.
pub const MAX_EXAMPLE_DEPTH: usize = 5;

/// Builds an example value for `schema`, resolving references against `root`.
pub fn generate_example(root: &Value, schema: &Value) -> Value {
    example_at(root, Some(schema), &HashSet::new(), 0)
}

fn example_at(
    root: &Value,
    schema: Option<&Value>,
    visited: &HashSet<String>,
    depth: usize,
) -> Value {
    let Some(schema) = schema else {
        return Value::Null;
    };
    if depth > MAX_EXAMPLE_DEPTH {
        return Value::Null;
    }

    let mut seen = visited.clone();
    let resolved = resolve_schema(root, Some(schema), &mut seen);

    if let Some(example) = resolved.get("example") {
        return example.clone();
    }
    if let Some(default) = resolved.get("default") {
        return default.clone();
    }
    if let Some(first) = resolved
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|values| values.first())
    {
        return first.clone();
    }

    let format = resolved.get("format").and_then(Value::as_str);
    match resolved.get("type").and_then(Value::as_str) {
        Some("string") => Value::String(string_placeholder(format).to_string()),
        Some("integer") | Some("number") => json!(0),
        Some("boolean") => json!(false),
        Some("array") => match resolved.get("items") {
            Some(items) => json!([example_at(root, Some(items), &seen, depth + 1)]),
            None => json!([]),
        },
        _ => match resolved.get("properties").and_then(Value::as_object) {
            Some(props) => {
                let mut object = Map::new();
                for (name, prop) in props {
                    object.insert(name.clone(), example_at(root, Some(prop), &seen, depth + 1));
                }
                Value::Object(object)
            }
            None => json!({}),
        },
    }
}

fn string_placeholder(format: Option<&str>) -> &'static str {
    match format {
        Some("date-time") => "2025-01-01T00:00:00Z",
        Some("date") => "2025-01-01",
        Some("email") => "user@example.com",
        Some("uri") | Some("url") => "https://example.com",
        _ => "string",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_root() -> Value {
        json!({"openapi": "3.0.0", "paths": {}})
    }

    #[test]
    fn enum_and_default_beat_placeholders() {
        let root = empty_root();
        let schema = json!({
            "type": "object",
            "properties": {
                "status": {"type": "string", "enum": ["active", "disabled"]},
                "role": {"type": "string", "default": "viewer"},
                "name": {"type": "string"},
                "note": {"type": "string", "example": "hello", "default": "ignored"}
            }
        });

        let example = generate_example(&root, &schema);
        assert_eq!(example["status"], "active");
        assert_eq!(example["role"], "viewer");
        assert_eq!(example["name"], "string");
        assert_eq!(example["note"], "hello");
    }

    #[test]
    fn formats_and_scalars() {
        let root = empty_root();
        let schema = json!({
            "type": "object",
            "properties": {
                "created": {"type": "string", "format": "date-time"},
                "birthday": {"type": "string", "format": "date"},
                "email": {"type": "string", "format": "email"},
                "site": {"type": "string", "format": "uri"},
                "count": {"type": "integer"},
                "ratio": {"type": "number"},
                "active": {"type": "boolean"},
                "tags": {"type": "array", "items": {"type": "string"}},
                "empty": {"type": "array"}
            }
        });

        let example = generate_example(&root, &schema);
        assert_eq!(example["created"], "2025-01-01T00:00:00Z");
        assert_eq!(example["birthday"], "2025-01-01");
        assert_eq!(example["email"], "user@example.com");
        assert_eq!(example["site"], "https://example.com");
        assert_eq!(example["count"], 0);
        assert_eq!(example["ratio"], 0);
        assert_eq!(example["active"], false);
        assert_eq!(example["tags"], json!(["string"]));
        assert_eq!(example["empty"], json!([]));
    }

    #[test]
    fn recursive_schema_terminates() {
        let root = json!({
            "openapi": "3.0.0",
            "paths": {},
            "components": {"schemas": {"Node": {
                "type": "object",
                "properties": {
                    "name": {"type": "string"},
                    "child": {"$ref": "#/components/schemas/Node"}
                }
            }}}
        });

        let example = generate_example(&root, &json!({"$ref": "#/components/schemas/Node"}));
        assert_eq!(example["name"], "string");
        assert_eq!(example["child"], json!({}));
    }

    #[test]
    fn depth_limit_yields_null() {
        let root = empty_root();
        let mut schema = json!({"type": "string"});
        for _ in 0..8 {
            schema = json!({"type": "array", "items": schema});
        }

        let mut value = generate_example(&root, &schema);
        let mut levels = 0;
        while let Some(inner) = value.as_array().and_then(|a| a.first()).cloned() {
            value = inner;
            levels += 1;
        }
        assert_eq!(levels, MAX_EXAMPLE_DEPTH + 1);
        assert!(value.is_null());
    }
}
