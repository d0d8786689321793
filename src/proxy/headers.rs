use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashMap;
use std::net::IpAddr;

static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that belong to one transport leg. `host` and `content-length`
/// are listed too: the client derives both from the outbound URI and body.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
    )
}

/// Inbound headers minus hop-by-hop ones.
pub fn forward_request_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(inbound.len() + 1);
    for (name, value) in inbound {
        if !is_hop_by_hop(name) {
            out.append(name.clone(), value.clone());
        }
    }
    out
}

/// Append `client_ip` to the `X-Forwarded-For` chain, creating it if absent.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let ip = client_ip.to_string();
    let existing: Vec<&str> = headers
        .get_all(&XFF)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let combined = if existing.is_empty() {
        ip
    } else {
        format!("{}, {}", existing.join(", "), ip)
    };
    if let Ok(v) = HeaderValue::from_str(&combined) {
        headers.insert(XFF.clone(), v);
    }
}

/// Overlay a rule's extra headers. Hop-by-hop names and values that are not
/// valid header text are skipped.
pub fn apply_extra_headers(headers: &mut HeaderMap, extra: &HashMap<String, String>) {
    for (name, value) in extra {
        let (name, value) = match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(n), Ok(v)) => (n, v),
            _ => {
                tracing::warn!("proxy: invalid extra header skipped, name={}", name);
                continue;
            }
        };
        if is_hop_by_hop(&name) {
            continue;
        }
        headers.insert(name, value);
    }
}

/// Upstream response headers for the downstream response. Hop-by-hop
/// headers are dropped and repeated headers are joined with `;` into one
/// value, except `set-cookie`, which cannot be folded.
pub fn response_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(upstream.keys_len());
    for name in upstream.keys() {
        if is_hop_by_hop(name) {
            continue;
        }
        let mut values = upstream.get_all(name).iter();
        if *name == SET_COOKIE {
            for v in values {
                out.append(name.clone(), v.clone());
            }
            continue;
        }
        let first = match values.next() {
            Some(v) => v,
            None => continue,
        };
        let rest: Vec<&HeaderValue> = values.collect();
        if rest.is_empty() {
            out.insert(name.clone(), first.clone());
            continue;
        }
        let mut joined = first.as_bytes().to_vec();
        for v in rest {
            joined.push(b';');
            joined.extend_from_slice(v.as_bytes());
        }
        if let Ok(v) = HeaderValue::from_bytes(&joined) {
            out.insert(name.clone(), v);
        }
    }
    out
}
