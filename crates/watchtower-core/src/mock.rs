//! Mock rule matching and creation from captured traffic.

use crate::host::same_host;
use crate::ids::new_id;
use crate::models::{ApiLogEntry, ApiMock};

/// Strips the query string from a request target.
pub fn path_only(path: &str) -> &str {
    path.split_once('?').map(|(p, _)| p).unwrap_or(path)
}

/// Finds the first enabled mock matching host, exact path and method.
///
/// Earlier rules take priority over later ones.
pub fn find_mock<'a>(
    mocks: &'a [ApiMock],
    host: &str,
    path: &str,
    method: &str,
) -> Option<&'a ApiMock> {
    let path = path_only(path);
    mocks.iter().find(|m| {
        m.enabled
            && same_host(&m.host, host)
            && path_only(&m.path) == path
            && m.method.eq_ignore_ascii_case(method)
    })
}

/// Freezes a captured exchange as an enabled mock.
pub fn mock_from_log(entry: &ApiLogEntry) -> ApiMock {
    let content_type = entry
        .response_headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-type"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "application/json".to_string());

    ApiMock {
        id: new_id("mock"),
        host: entry.host.clone(),
        path: path_only(&entry.path).to_string(),
        method: entry.method.to_ascii_uppercase(),
        status_code: entry.status_code,
        response_body: entry.response_body.clone().unwrap_or_default(),
        content_type,
        enabled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LogSource;
    use std::collections::HashMap;

    fn mock(id: &str, path: &str, method: &str, enabled: bool) -> ApiMock {
        ApiMock {
            id: id.into(),
            host: "api.example.com".into(),
            path: path.into(),
            method: method.into(),
            status_code: 200,
            response_body: format!("{{\"id\":\"{}\"}}", id),
            content_type: "application/json".into(),
            enabled,
        }
    }

    #[test]
    fn matches_exact_path_and_method() {
        let mocks = vec![mock("a", "/users", "GET", true)];
        assert!(find_mock(&mocks, "api.example.com", "/users", "get").is_some());
        assert!(find_mock(&mocks, "api.example.com", "/users/1", "GET").is_none());
        assert!(find_mock(&mocks, "api.example.com", "/users", "POST").is_none());
        assert!(find_mock(&mocks, "other.example.com", "/users", "GET").is_none());
    }

    #[test]
    fn ignores_query_and_host_port() {
        let mocks = vec![mock("a", "/users", "GET", true)];
        let hit = find_mock(&mocks, "API.example.com:443", "/users?page=2", "GET");
        assert_eq!(hit.map(|m| m.id.as_str()), Some("a"));
    }

    #[test]
    fn skips_disabled_and_prefers_first() {
        let mocks = vec![
            mock("off", "/users", "GET", false),
            mock("first", "/users", "GET", true),
            mock("second", "/users", "GET", true),
        ];
        let hit = find_mock(&mocks, "api.example.com", "/users", "GET").unwrap();
        assert_eq!(hit.id, "first");
    }

    #[test]
    fn pins_log_entry() {
        let mut response_headers = HashMap::new();
        response_headers.insert("Content-Type".to_string(), "text/plain".to_string());

        let entry = ApiLogEntry {
            id: "log-1".into(),
            timestamp: 0,
            method: "post".into(),
            url: "https://api.example.com/orders?x=1".into(),
            host: "api.example.com".into(),
            path: "/orders?x=1".into(),
            status_code: 201,
            request_headers: HashMap::new(),
            request_body: None,
            response_headers,
            response_body: Some("created".into()),
            source: LogSource::Proxy,
            elapsed_ms: 10,
        };

        let pinned = mock_from_log(&entry);
        assert!(pinned.enabled);
        assert!(pinned.id.starts_with("mock-"));
        assert_eq!(pinned.method, "POST");
        assert_eq!(pinned.path, "/orders");
        assert_eq!(pinned.status_code, 201);
        assert_eq!(pinned.response_body, "created");
        assert_eq!(pinned.content_type, "text/plain");
    }
}
