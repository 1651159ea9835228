//! `$ref` and `allOf` resolution.
//!
//! Cycles are cut with an explicit visited set: a reference already on the
//! current resolution path becomes a placeholder object instead of being
//! followed again.

use std::collections::HashSet;

use serde_json::{json, Map, Value};

/// Placeholder substituted for a reference that points back into its own path.
pub fn circular_placeholder() -> Value {
    json!({"type": "object", "description": "(circular)"})
}

/// Looks up a local reference such as `#/components/schemas/User`.
///
/// Only same-document references are supported.
pub fn resolve_pointer<'a>(root: &'a Value, reference: &str) -> Option<&'a Value> {
    let pointer = reference.strip_prefix('#')?;
    if pointer.is_empty() {
        return Some(root);
    }
    root.pointer(pointer)
}

/// Inlines the top-level `$ref` chain and flattens `allOf` into one object.
///
/// Nested properties are left as written; callers that walk deeper pass the
/// returned `visited` set down so a cycle anywhere on the path is detected.
pub fn resolve_schema(root: &Value, schema: Option<&Value>, visited: &mut HashSet<String>) -> Value {
    let Some(schema) = schema else {
        return json!({"type": "object"});
    };

    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        if !visited.insert(reference.to_string()) {
            return circular_placeholder();
        }
        return match resolve_pointer(root, reference) {
            Some(target) => resolve_schema(root, Some(target), visited),
            None => json!({"type": "object"}),
        };
    }

    if let Some(parts) = schema
        .get("allOf")
        .and_then(Value::as_array)
        .filter(|parts| !parts.is_empty())
    {
        let mut properties = Map::new();
        let mut required: Vec<Value> = Vec::new();

        for part in parts {
            // Each branch gets its own copy so siblings don't see each other's refs.
            let mut branch = visited.clone();
            let resolved = resolve_schema(root, Some(part), &mut branch);

            if let Some(props) = resolved.get("properties").and_then(Value::as_object) {
                for (name, prop) in props {
                    properties.insert(name.clone(), prop.clone());
                }
            }
            if let Some(req) = resolved.get("required").and_then(Value::as_array) {
                required.extend(req.iter().cloned());
            }
        }

        return json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });
    }

    schema.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> Value {
        json!({
            "openapi": "3.0.0",
            "paths": {},
            "components": {
                "schemas": {
                    "User": {
                        "type": "object",
                        "required": ["id"],
                        "properties": {"id": {"type": "integer"}}
                    },
                    "Named": {
                        "type": "object",
                        "required": ["name"],
                        "properties": {"name": {"type": "string"}}
                    },
                    "Admin": {
                        "allOf": [
                            {"$ref": "#/components/schemas/User"},
                            {"$ref": "#/components/schemas/Named"},
                            {"properties": {"level": {"type": "integer"}}}
                        ]
                    },
                    "Loop": {"$ref": "#/components/schemas/Loop"},
                    "Alias": {"$ref": "#/components/schemas/User"}
                }
            }
        })
    }

    #[test]
    fn follows_reference_chain() {
        let root = doc();
        let mut visited = HashSet::new();
        let resolved = resolve_schema(
            &root,
            Some(&json!({"$ref": "#/components/schemas/Alias"})),
            &mut visited,
        );
        assert_eq!(resolved["properties"]["id"]["type"], "integer");
        assert_eq!(visited.len(), 2);
    }

    #[test]
    fn merges_all_of() {
        let root = doc();
        let resolved = resolve_schema(
            &root,
            Some(&json!({"$ref": "#/components/schemas/Admin"})),
            &mut HashSet::new(),
        );
        let props = resolved["properties"].as_object().unwrap();
        assert!(props.contains_key("id"));
        assert!(props.contains_key("name"));
        assert!(props.contains_key("level"));
        assert_eq!(resolved["required"], json!(["id", "name"]));
    }

    #[test]
    fn self_reference_becomes_placeholder() {
        let root = doc();
        let resolved = resolve_schema(
            &root,
            Some(&json!({"$ref": "#/components/schemas/Loop"})),
            &mut HashSet::new(),
        );
        assert_eq!(resolved, circular_placeholder());
    }

    #[test]
    fn unknown_reference_is_plain_object() {
        let root = doc();
        let resolved = resolve_schema(
            &root,
            Some(&json!({"$ref": "#/components/schemas/Missing"})),
            &mut HashSet::new(),
        );
        assert_eq!(resolved, json!({"type": "object"}));
    }

    #[test]
    fn pointer_rejects_remote_refs() {
        let root = doc();
        assert!(resolve_pointer(&root, "other.json#/User").is_none());
        assert!(resolve_pointer(&root, "#/components/schemas/User").is_some());
    }
}
