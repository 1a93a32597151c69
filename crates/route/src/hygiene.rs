use axum::http::HeaderMap;

/// Headers that are connection-scoped and must never be forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authorization",
    "proxy-authenticate",
];

const CLIENT_CREDENTIAL_HEADERS: &[&str] = &["authorization", "x-api-key", "x-goog-api-key"];

/// Copy client headers onto an upstream request.
///
/// Drops hop-by-hop headers, `Host`, `Content-Length`, and `Accept-Encoding`
/// (so the upstream does not compress a body the proxy would have to decode
/// before streaming). When `strip_credentials` is set, client auth headers
/// are removed so they cannot leak past a channel-configured key.
pub fn copy_request_headers(inbound: &HeaderMap, strip_credentials: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str)
            || name_str == "host"
            || name_str == "content-length"
            || name_str == "accept-encoding"
        {
            continue;
        }
        if strip_credentials && CLIENT_CREDENTIAL_HEADERS.contains(&name_str) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

/// Copy upstream response headers onto the reply. `Content-Length` is dropped
/// because the relayed body may be re-chunked or rewritten.
pub fn copy_response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in upstream {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) || name_str == "content-length" {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
