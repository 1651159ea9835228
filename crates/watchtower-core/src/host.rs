//! Host name normalization.
//!
//! Every comparison the engine makes between hosts goes through
//! [`normalize_host`]: ASCII lower-case, no port, no trailing dot.

/// Normalizes a host or `host:port` authority for comparison.
pub fn normalize_host(raw: &str) -> String {
    let (host, _) = split_authority(raw.trim());
    host.trim_end_matches('.').to_ascii_lowercase()
}

/// Splits an authority into host and optional port.
///
/// Handles bracketed IPv6 (`[::1]:443`). A bare IPv6 literal is returned
/// whole with no port.
pub fn split_authority(authority: &str) -> (&str, Option<u16>) {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host, port);
        }
        return (authority, None);
    }

    match authority.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => match port.parse() {
            Ok(port) => (host, Some(port)),
            Err(_) => (authority, None),
        },
        _ => (authority, None),
    }
}

/// Extracts the normalized host from a URL, accepting scheme-less input.
pub fn host_from_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }

    let parsed = reqwest::Url::parse(url)
        .ok()
        .filter(|u| u.host_str().is_some())
        .or_else(|| reqwest::Url::parse(&format!("http://{}", url)).ok())?;

    parsed
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']'))
        .map(normalize_host)
        .filter(|h| !h.is_empty())
}

/// Returns true when two hosts name the same machine for routing purposes.
pub fn same_host(a: &str, b: &str) -> bool {
    normalize_host(a) == normalize_host(b)
}
