//! Small helpers shared by the proxy pipeline: host parsing, hop-by-hop
//! header handling, and humanized formatting for log lines.

use std::time::Duration;

use http::HeaderMap;

/// Strip the port from a `host:port` pair. Returns the input unchanged when
/// there is no port, and unwraps bracketed IPv6 literals.
pub fn host_of(hostport: &str) -> &str {
    if let Some(stripped) = hostport.strip_prefix('[') {
        if let Some(end) = stripped.find(']') {
            return &stripped[..end];
        }
    }
    match hostport.rsplit_once(':') {
        // A second ':' means an unbracketed IPv6 literal, not a port.
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => hostport,
    }
}

/// Check if a header is a hop-by-hop header that should not be forwarded
pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Remove all hop-by-hop headers in place.
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let names: Vec<_> = headers
        .keys()
        .filter(|name| is_hop_by_hop_header(name.as_str()))
        .cloned()
        .collect();
    for name in names {
        headers.remove(name);
    }
}

/// Humanize a byte count for log lines: `123B`, `4KB`, `2MB`.
pub fn format_size(n: u64) -> String {
    match n {
        n if n < 1024 => format!("{}B", n),
        n if n < 1024 * 1024 => format!("{}KB", n / 1024),
        n => format!("{}MB", n / 1024 / 1024),
    }
}

/// Humanize a duration for log lines: sub-millisecond is `0`, then `ms`, then `s`.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::from_millis(1) {
        "0".to_string()
    } else if d < Duration::from_secs(1) {
        format!("{}ms", d.as_millis())
    } else {
        format!("{}s", d.as_secs())
    }
}
