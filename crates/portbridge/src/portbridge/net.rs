use std::{borrow::Cow, net::IpAddr};

/// Normalize a bind/listen address.
///
/// The config accepts the shorthand `":PORT"` to mean "bind on all interfaces";
/// tokio's bind APIs do not, so it becomes `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Whether `host` names the workspace's own loopback interface: `localhost`, any
/// `127.0.0.0/8` address, or `::1`. IPv6 literals may be bracketed. No DNS lookup
/// is performed.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.trim();
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => v4.is_loopback(),
        Ok(IpAddr::V6(v6)) => v6.is_loopback(),
        Err(_) => false,
    }
}
