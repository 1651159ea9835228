//! OpenAPI / Swagger document handling.
//!
//! Documents are kept as raw text in storage and parsed on demand into a
//! flat endpoint list grouped by tag. Only JSON documents are accepted.

mod diff;
mod example;
mod resolve;

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use serde_json::Value;

use crate::error::{CoreError, Result};

pub use diff::{diff_endpoints, diff_schemas, ApiSchemaDiff, EndpointDiff};
pub use example::{generate_example, MAX_EXAMPLE_DEPTH};
pub use resolve::{circular_placeholder, resolve_pointer, resolve_schema};

/// Operation keys inside a path item, in presentation order.
pub const HTTP_METHODS: [&str; 7] = ["get", "post", "put", "delete", "patch", "options", "head"];

/// Tag assigned to operations that declare none.
pub const DEFAULT_TAG: &str = "Default";

/// A parameter of one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedParam {
    pub name: String,
    #[serde(rename = "in")]
    pub location: String,
    pub required: bool,
    #[serde(rename = "type")]
    pub type_name: String,
    pub format: Option<String>,
    pub description: Option<String>,
}

/// Request body with synthesized example.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedRequestBody {
    pub content_type: String,
    pub required: bool,
    pub schema: Value,
    pub example: Value,
    pub description: Option<String>,
}

/// A declared response code.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedResponse {
    pub status_code: String,
    pub description: Option<String>,
}

/// One operation of the document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedEndpoint {
    /// Upper-case HTTP method.
    pub method: String,
    pub path: String,
    pub operation_id: Option<String>,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub parameters: Vec<ParsedParam>,
    pub request_body: Option<ParsedRequestBody>,
    pub responses: Vec<ParsedResponse>,
}

impl ParsedEndpoint {
    /// Identity used for diffing: `METHOD path`.
    pub fn key(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Endpoints sharing a tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TagGroup {
    pub tag: String,
    pub endpoints: Vec<ParsedEndpoint>,
}

/// Parsed view of a whole document.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedSchema {
    pub title: Option<String>,
    pub version: Option<String>,
    pub endpoints: Vec<ParsedEndpoint>,
    pub tag_groups: Vec<TagGroup>,
}

/// Parses and validates raw document text.
///
/// A document must be a JSON object carrying `paths` and either `openapi`
/// or `swagger`.
pub fn load_document(spec: &str) -> Result<Value> {
    let doc: Value = serde_json::from_str(spec)
        .map_err(|e| CoreError::InvalidSchema(format!("not valid JSON: {}", e)))?;

    let obj = doc
        .as_object()
        .ok_or_else(|| CoreError::InvalidSchema("document is not a JSON object".into()))?;

    if !obj.contains_key("openapi") && !obj.contains_key("swagger") {
        return Err(CoreError::InvalidSchema(
            "missing `openapi` or `swagger` version field".into(),
        ));
    }
    if !obj.get("paths").is_some_and(Value::is_object) {
        return Err(CoreError::InvalidSchema("missing `paths` object".into()));
    }

    Ok(doc)
}

/// `info.version` of a loaded document, if declared.
pub fn document_version(doc: &Value) -> Option<String> {
    doc.pointer("/info/version")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First `max_chars` characters of a document, for display.
pub fn preview(spec: &str, max_chars: usize) -> String {
    spec.chars().take(max_chars).collect()
}

/// Parses a document into endpoints and tag groups.
pub fn parse_spec(spec: &str) -> Result<ParsedSchema> {
    let doc = load_document(spec)?;
    Ok(parse_document(&doc))
}

/// Parses an already validated document.
pub fn parse_document(doc: &Value) -> ParsedSchema {
    let mut endpoints = Vec::new();

    if let Some(paths) = doc.get("paths").and_then(Value::as_object) {
        for (path, item) in paths {
            for method in HTTP_METHODS {
                let Some(op) = item.get(method).filter(|op| op.is_object()) else {
                    continue;
                };
                endpoints.push(parse_operation(doc, path, method, op));
            }
        }
    }

    let mut groups: BTreeMap<String, Vec<ParsedEndpoint>> = BTreeMap::new();
    for endpoint in &endpoints {
        for tag in &endpoint.tags {
            groups.entry(tag.clone()).or_default().push(endpoint.clone());
        }
    }

    ParsedSchema {
        title: doc
            .pointer("/info/title")
            .and_then(Value::as_str)
            .map(str::to_string),
        version: document_version(doc),
        endpoints,
        tag_groups: groups
            .into_iter()
            .map(|(tag, endpoints)| TagGroup { tag, endpoints })
            .collect(),
    }
}

fn parse_operation(doc: &Value, path: &str, method: &str, op: &Value) -> ParsedEndpoint {
    let tags = op
        .get("tags")
        .and_then(Value::as_array)
        .map(|tags| {
            tags.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|tags| !tags.is_empty())
        .unwrap_or_else(|| vec![DEFAULT_TAG.to_string()]);

    let parameters = op
        .get("parameters")
        .and_then(Value::as_array)
        .map(|params| params.iter().map(|p| parse_param(doc, p)).collect())
        .unwrap_or_default();

    let responses = op
        .get("responses")
        .and_then(Value::as_object)
        .map(|responses| {
            responses
                .iter()
                .map(|(code, r)| ParsedResponse {
                    status_code: code.clone(),
                    description: str_field(r, "description"),
                })
                .collect()
        })
        .unwrap_or_default();

    ParsedEndpoint {
        method: method.to_ascii_uppercase(),
        path: path.to_string(),
        operation_id: str_field(op, "operationId"),
        summary: str_field(op, "summary"),
        description: str_field(op, "description"),
        tags,
        parameters,
        request_body: op
            .get("requestBody")
            .and_then(|rb| parse_request_body(doc, rb)),
        responses,
    }
}

fn parse_param(doc: &Value, param: &Value) -> ParsedParam {
    // Parameters may themselves be references into components.
    let resolved = param
        .get("$ref")
        .and_then(Value::as_str)
        .and_then(|r| resolve_pointer(doc, r))
        .unwrap_or(param);

    // OpenAPI 3 nests the type under `schema`; Swagger 2 puts it inline.
    let type_source = resolved.get("schema").unwrap_or(resolved);

    ParsedParam {
        name: str_field(resolved, "name").unwrap_or_default(),
        location: str_field(resolved, "in").unwrap_or_else(|| "query".to_string()),
        required: resolved
            .get("required")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        type_name: describe_type(Some(type_source)),
        format: str_field(type_source, "format"),
        description: str_field(resolved, "description"),
    }
}

fn parse_request_body(doc: &Value, body: &Value) -> Option<ParsedRequestBody> {
    let content = body.get("content").and_then(Value::as_object)?;
    let content_type = content
        .keys()
        .find(|ct| ct.contains("json"))
        .or_else(|| content.keys().next())?
        .clone();
    let schema = content.get(&content_type)?.get("schema")?;

    let resolved = resolve_schema(doc, Some(schema), &mut HashSet::new());
    let example = generate_example(doc, schema);

    Some(ParsedRequestBody {
        content_type,
        required: body.get("required").and_then(Value::as_bool).unwrap_or(false),
        schema: resolved,
        example,
        description: str_field(body, "description"),
    })
}

/// Short human-readable type label, e.g. `string(uuid)`, `User[]`.
pub fn describe_type(schema: Option<&Value>) -> String {
    let Some(schema) = schema else {
        return "any".to_string();
    };

    if let Some(reference) = schema.get("$ref").and_then(Value::as_str) {
        return reference
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("object")
            .to_string();
    }

    let type_name = schema.get("type").and_then(Value::as_str);
    if type_name == Some("array") {
        return format!("{}[]", describe_type(schema.get("items")));
    }

    match (type_name, schema.get("format").and_then(Value::as_str)) {
        (Some(t), Some(f)) => format!("{}({})", t, f),
        (Some(t), None) => t.to_string(),
        (None, _) => "any".to_string(),
    }
}

fn str_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}
