//! Client identifier resolution.

use std::net::SocketAddr;

use axum::http::HeaderMap;

/// Header carrying the proxy chain of client addresses.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header carrying the client address as seen by a single proxy.
pub const REAL_IP_HEADER: &str = "x-real-ip";
/// Header carrying the authenticated user's id.
pub const USER_ID_HEADER: &str = "x-user-id";

const UNKNOWN_CLIENT: &str = "unknown";

/// The parts of a request that identify who sent it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestMeta {
    /// Originating IP address, when the transport knows it
    pub remote_ip: Option<String>,
    /// Raw forwarded-for header value
    pub forwarded_for: Option<String>,
    /// Raw real-IP header value
    pub real_ip: Option<String>,
    /// Authenticated user id
    pub user_id: Option<String>,
}

impl RequestMeta {
    /// Collect request metadata from headers and an optional peer address.
    pub fn from_headers(headers: &HeaderMap, peer: Option<SocketAddr>) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };

        Self {
            remote_ip: peer.map(|addr| addr.ip().to_string()),
            forwarded_for: header(FORWARDED_FOR_HEADER),
            real_ip: header(REAL_IP_HEADER),
            user_id: header(USER_ID_HEADER),
        }
    }

    /// Derive the quota identifier for this request.
    ///
    /// The IP is the first non-empty of the originating address, the first
    /// forwarded-for hop, and the real-IP header, else `"unknown"`. A user id
    /// turns it into `"{ip}:{user_id}"`.
    pub fn identifier(&self) -> String {
        let ip = non_empty(self.remote_ip.as_deref())
            .or_else(|| {
                self.forwarded_for
                    .as_deref()
                    .and_then(|v| non_empty(v.split(',').next()))
            })
            .or_else(|| non_empty(self.real_ip.as_deref()))
            .unwrap_or(UNKNOWN_CLIENT);

        match non_empty(self.user_id.as_deref()) {
            Some(user_id) => format!("{}:{}", ip, user_id),
            None => ip.to_string(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
