//! Embedded `/.watchtower/*` endpoints.
//!
//! Served by the proxy itself so a device can fetch the PAC script and the
//! root certificate before it trusts anything.

use hyper::header::{HeaderValue, CONTENT_DISPOSITION};
use hyper::{Response, StatusCode};
use tracing::warn;

use watchtower_core::host::normalize_host;

use crate::body::{response_with, text_response, ProxyBody};
use crate::handler::ProxyContext;

/// Path prefix owned by the proxy.
pub const ENDPOINT_PREFIX: &str = "/.watchtower/";

/// Certificate downloads, also answered inside decrypted tunnels.
pub const CERT_ENDPOINT_PREFIX: &str = "/.watchtower/cert";

const PAC_CONTENT_TYPE: &str = "application/x-ns-proxy-autoconfig";
const PEM_CONTENT_TYPE: &str = "application/x-pem-file";

/// Dispatches one endpoint request. `host` is the name the client used to
/// reach the proxy and becomes the proxy address in the PAC script.
pub(crate) async fn serve(ctx: &ProxyContext, path: &str, host: &str) -> Response<ProxyBody> {
    let route = path.strip_prefix(ENDPOINT_PREFIX).unwrap_or("");
    let route = route.split('?').next().unwrap_or("").trim_end_matches('/');

    match route {
        "proxy.pac" => pac_response(ctx, host),
        "setup" => setup_response(ctx, host),
        "cert" | "cert/root" => root_cert_response(ctx),
        _ => match route.strip_prefix("cert/") {
            Some(leaf_host) if !leaf_host.is_empty() => leaf_cert_response(ctx, leaf_host).await,
            _ => text_response(StatusCode::NOT_FOUND, "Not found"),
        },
    }
}

/// PAC script sending intercepted hosts through the proxy.
pub fn pac_script(hosts: &[String], proxy_host: &str, proxy_port: u16) -> String {
    let list = serde_json::to_string(hosts).unwrap_or_else(|_| "[]".to_string());
    format!(
        "function FindProxyForURL(url, host) {{\n\
         \x20 host = host.toLowerCase();\n\
         \x20 var hosts = {list};\n\
         \x20 for (var i = 0; i < hosts.length; i++) {{\n\
         \x20   if (host === hosts[i]) {{\n\
         \x20     return \"PROXY {proxy_host}:{proxy_port}\";\n\
         \x20   }}\n\
         \x20 }}\n\
         \x20 return \"DIRECT\";\n\
         }}\n"
    )
}

fn proxy_host(host: &str) -> String {
    let host = normalize_host(host);
    if host.is_empty() {
        "127.0.0.1".to_string()
    } else if host.contains(':') {
        format!("[{}]", host)
    } else {
        host
    }
}

fn pac_response(ctx: &ProxyContext, host: &str) -> Response<ProxyBody> {
    let hosts = ctx.config.snapshot().intercepted_hosts();
    let script = pac_script(&hosts, &proxy_host(host), ctx.forward_port);
    response_with(StatusCode::OK, PAC_CONTENT_TYPE, script)
}

fn root_cert_response(ctx: &ProxyContext) -> Response<ProxyBody> {
    let pem = ctx.certs.root().cert_pem().to_string();
    attachment(pem_response(pem), "watchtower-root-ca.crt")
}

async fn leaf_cert_response(ctx: &ProxyContext, host: &str) -> Response<ProxyBody> {
    match ctx.certs.leaf_for(host).await {
        Ok(leaf) => {
            let chain = format!("{}{}", leaf.cert_pem, ctx.certs.root().cert_pem());
            attachment(pem_response(chain), &format!("{}.crt", leaf.host))
        }
        Err(e) => {
            warn!(host = %host, "Leaf certificate download failed: {}", e);
            text_response(StatusCode::BAD_REQUEST, e.to_string())
        }
    }
}

fn pem_response(pem: String) -> Response<ProxyBody> {
    response_with(StatusCode::OK, PEM_CONTENT_TYPE, pem)
}

fn attachment(mut response: Response<ProxyBody>, filename: &str) -> Response<ProxyBody> {
    let value = format!("attachment; filename=\"{}\"", filename.replace('"', ""));
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(CONTENT_DISPOSITION, value);
    }
    response
}

fn setup_response(ctx: &ProxyContext, host: &str) -> Response<ProxyBody> {
    let proxy_host = proxy_host(host);
    let port = ctx.forward_port;
    let hosts = ctx.config.snapshot().intercepted_hosts();

    let host_items: String = if hosts.is_empty() {
        "<li><em>none yet</em></li>".to_string()
    } else {
        hosts
            .iter()
            .map(|h| format!("<li><code>{}</code></li>", escape_html(h)))
            .collect()
    };

    let page = format!(
        "<!DOCTYPE html>\n\
         <html><head><meta charset=\"utf-8\">\
         <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\
         <title>Watchtower proxy setup</title></head>\n\
         <body>\n\
         <h1>Watchtower proxy setup</h1>\n\
         <ol>\n\
         <li>Install and trust the <a href=\"/.watchtower/cert\">root certificate</a>.</li>\n\
         <li>Set the device proxy to <code>{host}:{port}</code>, or use the \
         <a href=\"/.watchtower/proxy.pac\">auto-config script</a> \
         (<code>http://{host}:{port}/.watchtower/proxy.pac</code>).</li>\n\
         </ol>\n\
         <h2>Intercepted hosts</h2>\n<ul>{items}</ul>\n\
         </body></html>\n",
        host = escape_html(&proxy_host),
        port = port,
        items = host_items,
    );

    response_with(StatusCode::OK, "text/html; charset=utf-8", page)
}

fn escape_html(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
