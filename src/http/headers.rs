//! Header hygiene for forwarded requests.
//!
//! Inbound headers are copied, hop-by-hop headers are dropped and the
//! forwarding identity is stamped on top.

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};

pub const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
pub const X_FORWARDED_BY: HeaderName = HeaderName::from_static("x-forwarded-by");
pub const X_REAL_IP: HeaderName = HeaderName::from_static("x-real-ip");
pub const CF_CONNECTING_IP: HeaderName = HeaderName::from_static("cf-connecting-ip");

/// Headers that only make sense on the inbound leg.
const HOP_BY_HOP: [HeaderName; 2] = [header::HOST, header::CONNECTION];

/// Identity stamped on every forwarded request.
#[derive(Debug, Clone)]
pub struct ForwardingIdentity {
    pub gateway_id: HeaderValue,
    pub user_agent: HeaderValue,
}

impl ForwardingIdentity {
    /// Build from configured strings; values that are not valid header text fall back to defaults.
    pub fn new(gateway_id: &str, user_agent: &str) -> Self {
        Self {
            gateway_id: HeaderValue::from_str(gateway_id)
                .unwrap_or_else(|_| HeaderValue::from_static("resilient-proxy")),
            user_agent: HeaderValue::from_str(user_agent)
                .unwrap_or_else(|_| HeaderValue::from_static("resilient-proxy/0.1")),
        }
    }
}

impl Default for ForwardingIdentity {
    fn default() -> Self {
        Self::new("resilient-proxy", "resilient-proxy/0.1")
    }
}

/// Client address as seen by the first hop that recorded it.
fn client_ip(inbound: &HeaderMap) -> HeaderValue {
    [X_FORWARDED_FOR, X_REAL_IP, CF_CONNECTING_IP]
        .iter()
        .find_map(|name| inbound.get(name).filter(|v| !v.is_empty()).cloned())
        .unwrap_or_else(|| HeaderValue::from_static("unknown"))
}

/// Outbound headers for a request that arrived with `inbound` over `protocol`.
pub fn sanitize_headers(inbound: &HeaderMap, protocol: &str, identity: &ForwardingIdentity) -> HeaderMap {
    let mut headers = inbound.clone();
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }

    headers.insert(X_FORWARDED_FOR, client_ip(inbound));
    headers.insert(
        X_FORWARDED_PROTO,
        HeaderValue::from_str(protocol).unwrap_or_else(|_| HeaderValue::from_static("http")),
    );
    headers.insert(X_FORWARDED_BY, identity.gateway_id.clone());
    headers.insert(header::USER_AGENT, identity.user_agent.clone());
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(HeaderName::from_static(k), HeaderValue::from_static(v));
        }
        map
    }

    #[test]
    fn strips_hop_by_hop_and_stamps_identity() {
        let headers = sanitize_headers(
            &inbound(&[
                ("host", "gateway.local"),
                ("connection", "keep-alive"),
                ("user-agent", "curl/8"),
                ("accept", "application/json"),
            ]),
            "https",
            &ForwardingIdentity::new("edge-1", "gw/1.0"),
        );

        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(headers["accept"], "application/json");
        assert_eq!(headers["x-forwarded-proto"], "https");
        assert_eq!(headers["x-forwarded-by"], "edge-1");
        assert_eq!(headers["user-agent"], "gw/1.0");
        assert_eq!(headers["x-forwarded-for"], "unknown");
    }

    #[test]
    fn client_ip_precedence() {
        let id = ForwardingIdentity::default();
        let h = sanitize_headers(
            &inbound(&[("x-real-ip", "10.0.0.2"), ("cf-connecting-ip", "10.0.0.3")]),
            "http",
            &id,
        );
        assert_eq!(h["x-forwarded-for"], "10.0.0.2");

        let h = sanitize_headers(&inbound(&[("cf-connecting-ip", "10.0.0.3")]), "http", &id);
        assert_eq!(h["x-forwarded-for"], "10.0.0.3");

        let h = sanitize_headers(
            &inbound(&[("x-forwarded-for", "1.1.1.1"), ("x-real-ip", "10.0.0.2")]),
            "http",
            &id,
        );
        assert_eq!(h["x-forwarded-for"], "1.1.1.1");
    }
}
