use bytes::Bytes;
use http::{HeaderMap, Method, Uri};
use std::{
    collections::HashMap,
    net::IpAddr,
    time::Instant,
};

/// Everything the gateway knows about one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: Option<IpAddr>,
    /// Authenticated principal, as resolved by upstream auth.
    pub principal: Option<String>,
    pub started_at: Instant,
    pub metadata: HashMap<String, String>,
}

impl RequestContext {
    pub fn new(
        request_id: String,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        body: Bytes,
        client_ip: Option<IpAddr>,
    ) -> Self {
        Self {
            request_id,
            method,
            uri,
            headers,
            body,
            client_ip,
            principal: None,
            started_at: Instant::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_principal(mut self, principal: Option<String>) -> Self {
        self.principal = principal.filter(|p| !p.trim().is_empty());
        self
    }
}

/// Picks the request's source address. With `trust_forwarded_for` the
/// left-most parsable `X-Forwarded-For` entry wins over the socket peer.
pub fn source_address(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_forwarded_for: bool,
) -> Option<IpAddr> {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|chain| {
                chain
                    .split(',')
                    .find_map(|hop| hop.trim().parse::<IpAddr>().ok())
            });
        if forwarded.is_some() {
            return forwarded.map(|ip| ip.to_canonical());
        }
    }

    peer.map(|ip| ip.to_canonical())
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn forwarded_for_is_ignored_unless_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        let peer = Some("10.0.0.1".parse().unwrap());

        assert_eq!(source_address(&headers, peer, false), peer);
        assert_eq!(
            source_address(&headers, peer, true),
            Some("203.0.113.9".parse().unwrap())
        );
    }

    #[test]
    fn falls_back_to_peer_on_garbage_chain() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("unknown, nope"));
        let peer = Some("192.0.2.4".parse().unwrap());

        assert_eq!(source_address(&headers, peer, true), peer);
        assert_eq!(source_address(&HeaderMap::new(), None, true), None);
    }
}
