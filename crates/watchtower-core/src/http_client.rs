//! Outbound HTTP client for schema downloads and manual requests.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::models::{body_text, ApiRequest, ApiRequestResult};

/// Request timeout for outbound calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for outbound calls.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A downloaded document.
#[derive(Debug, Clone)]
pub struct FetchedDocument {
    /// Final URL after redirects.
    pub url: String,
    /// Body text exactly as received.
    pub text: String,
}

/// Thin wrapper over a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: reqwest::Client,
}

impl ApiClient {
    /// Creates a client with the default timeouts.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(concat!("watchtower/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::FetchError(e.to_string()))?;

        Ok(Self { client })
    }

    /// Downloads a document, failing on transport errors and non-2xx status.
    pub async fn fetch_document(&self, url: &str) -> Result<FetchedDocument> {
        let url = parse_url(url)?;
        debug!(url = %url, "Fetching document");

        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::FetchError(format!("server returned {}", status)));
        }

        let final_url = response.url().to_string();
        let bytes = response.bytes().await?;
        let text = String::from_utf8(bytes.to_vec())
            .map_err(|_| CoreError::InvalidSchema("document is not UTF-8 text".into()))?;

        Ok(FetchedDocument {
            url: final_url,
            text,
        })
    }

    /// Executes a manual request and reports what came back.
    ///
    /// Any HTTP status is a successful result; only transport failures and
    /// malformed input are errors.
    pub async fn send(&self, request: &ApiRequest) -> Result<ApiRequestResult> {
        let method = Method::from_bytes(request.method.trim().to_ascii_uppercase().as_bytes())
            .map_err(|_| CoreError::InvalidRequest(format!("invalid method: {}", request.method)))?;
        let url = parse_url(&request.url)?;
        let headers = to_header_map(&request.headers)?;

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let response = builder.send().await?;
        let status_code = response.status().as_u16();
        let headers = from_header_map(response.headers());
        let body = response.bytes().await?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        Ok(ApiRequestResult {
            status_code,
            headers,
            body: body_text(&body),
            elapsed_ms,
        })
    }
}

fn parse_url(url: &str) -> Result<reqwest::Url> {
    let url = reqwest::Url::parse(url.trim())
        .map_err(|e| CoreError::InvalidRequest(format!("invalid URL {}: {}", url, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(CoreError::InvalidRequest(format!(
            "unsupported scheme: {}",
            other
        ))),
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| CoreError::InvalidRequest(format!("invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| CoreError::InvalidRequest(format!("invalid header value for {}", name)))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Flattens a header map, joining repeated headers with `, `.
pub fn from_header_map(headers: &HeaderMap) -> HashMap<String, String> {
    let mut out: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        out.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned HTTP response and returns the raw request it saw.
    async fn one_shot_server(response: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        });
        (format!("http://{}", addr), handle)
    }

    #[tokio::test]
    async fn fetch_returns_exact_text() {
        let (base, server) = one_shot_server(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 30\r\nConnection: close\r\n\r\n{\"openapi\":\"3.0.0\",\"paths\":{}}",
        )
        .await;

        let client = ApiClient::new().unwrap();
        let doc = client
            .fetch_document(&format!("{}/openapi.json", base))
            .await
            .unwrap();
        assert_eq!(doc.text, "{\"openapi\":\"3.0.0\",\"paths\":{}}");

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /openapi.json"));
    }

    #[tokio::test]
    async fn fetch_fails_on_error_status() {
        let (base, _server) = one_shot_server(
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await;

        let client = ApiClient::new().unwrap();
        let err = client.fetch_document(&base).await.unwrap_err();
        assert!(matches!(err, CoreError::FetchError(_)));
    }

    #[tokio::test]
    async fn send_reports_status_headers_and_body() {
        let (base, server) = one_shot_server(
            "HTTP/1.1 201 Created\r\nX-Request-Id: abc\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok",
        )
        .await;

        let mut headers = HashMap::new();
        headers.insert("X-Test".to_string(), "1".to_string());
        let request = ApiRequest {
            method: "post".into(),
            url: format!("{}/items", base),
            headers,
            body: Some("{\"a\":1}".into()),
        };

        let client = ApiClient::new().unwrap();
        let result = client.send(&request).await.unwrap();
        assert_eq!(result.status_code, 201);
        assert_eq!(result.body, "ok");
        assert_eq!(result.headers.get("x-request-id").map(String::as_str), Some("abc"));

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /items"));
        assert!(raw.to_ascii_lowercase().contains("x-test: 1"));
    }

    #[tokio::test]
    async fn send_rejects_bad_input() {
        let client = ApiClient::new().unwrap();

        let bad_scheme = ApiRequest {
            method: "GET".into(),
            url: "ftp://example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            client.send(&bad_scheme).await,
            Err(CoreError::InvalidRequest(_))
        ));

        let bad_method = ApiRequest {
            method: "GE T".into(),
            url: "http://example.com".into(),
            ..Default::default()
        };
        assert!(matches!(
            client.send(&bad_method).await,
            Err(CoreError::InvalidRequest(_))
        ));
    }

    #[test]
    fn joins_repeated_headers() {
        let mut map = HeaderMap::new();
        map.append("set-cookie", HeaderValue::from_static("a=1"));
        map.append("set-cookie", HeaderValue::from_static("b=2"));
        let flat = from_header_map(&map);
        assert_eq!(flat.get("set-cookie").map(String::as_str), Some("a=1, b=2"));
    }
}
