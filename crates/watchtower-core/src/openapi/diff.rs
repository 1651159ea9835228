//! Coarse structural diff between two document versions.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{ParsedEndpoint, ParsedSchema};

/// One endpoint in a diff listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointDiff {
    pub method: String,
    pub path: String,
    pub summary: Option<String>,
}

impl From<&ParsedEndpoint> for EndpointDiff {
    fn from(endpoint: &ParsedEndpoint) -> Self {
        Self {
            method: endpoint.method.clone(),
            path: endpoint.path.clone(),
            summary: endpoint.summary.clone(),
        }
    }
}

/// Difference between two stored schema versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSchemaDiff {
    pub id1: String,
    pub id2: String,
    pub added: Vec<EndpointDiff>,
    pub removed: Vec<EndpointDiff>,
    pub modified: Vec<EndpointDiff>,
}

/// Splits endpoints into added, removed and modified, keyed by `METHOD path`.
///
/// An endpoint present in both counts as modified when its summary,
/// parameter count or response-code count differs.
pub fn diff_endpoints(
    old: &[ParsedEndpoint],
    new: &[ParsedEndpoint],
) -> (Vec<EndpointDiff>, Vec<EndpointDiff>, Vec<EndpointDiff>) {
    let old_by_key: HashMap<String, &ParsedEndpoint> = old.iter().map(|e| (e.key(), e)).collect();
    let new_by_key: HashMap<String, &ParsedEndpoint> = new.iter().map(|e| (e.key(), e)).collect();

    let mut added = Vec::new();
    let mut modified = Vec::new();
    for endpoint in new {
        match old_by_key.get(&endpoint.key()) {
            None => added.push(EndpointDiff::from(endpoint)),
            Some(before) if changed(before, endpoint) => modified.push(EndpointDiff::from(endpoint)),
            Some(_) => {}
        }
    }

    let removed = old
        .iter()
        .filter(|e| !new_by_key.contains_key(&e.key()))
        .map(EndpointDiff::from)
        .collect();

    (added, removed, modified)
}

fn changed(before: &ParsedEndpoint, after: &ParsedEndpoint) -> bool {
    before.summary != after.summary
        || before.parameters.len() != after.parameters.len()
        || before.responses.len() != after.responses.len()
}

/// Diffs two parsed versions identified by their stored ids.
pub fn diff_schemas(
    id1: &str,
    old: &ParsedSchema,
    id2: &str,
    new: &ParsedSchema,
) -> ApiSchemaDiff {
    let (added, removed, modified) = diff_endpoints(&old.endpoints, &new.endpoints);
    ApiSchemaDiff {
        id1: id1.to_string(),
        id2: id2.to_string(),
        added,
        removed,
        modified,
    }
}
