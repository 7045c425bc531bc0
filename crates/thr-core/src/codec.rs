//! Bidirectional serialization of an HTTP request/response to/from the
//! compact object carried on the Redis bus (§4.1 of the spec).

use base64::Engine;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),
    #[error("malformed envelope: missing field `{0}`")]
    MissingField(&'static str),
}

/// The request envelope as it travels on the bus. Field order/shape mirrors
/// §3's request envelope table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireRequest {
    pub method: String,
    pub path: String,
    pub host: String,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub query_arguments: IndexMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_link: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

/// How to augment `X-Forwarded-For` when serializing a request.
pub enum ProxyIp {
    /// Use the caller-detected local address.
    Auto(String),
    /// Use an explicit address.
    Fixed(String),
}

/// Builds and serializes a request envelope. Mirrors
/// `thr.utils.serialize_http_request`.
#[allow(clippy::too_many_arguments)]
pub fn serialize_request(
    method: &str,
    path: &str,
    host: &str,
    remote_ip: &str,
    query_arguments: IndexMap<String, Vec<String>>,
    mut headers: Vec<(String, String)>,
    body: Option<&[u8]>,
    body_link: Option<String>,
    proxy_ip: Option<ProxyIp>,
    extra: Map<String, Value>,
) -> String {
    if let Some(proxy_ip) = proxy_ip {
        let proxy_ip = match proxy_ip {
            ProxyIp::Auto(ip) => ip,
            ProxyIp::Fixed(ip) => ip,
        };
        if let Some((_, existing)) = headers
            .iter_mut()
            .find(|(name, _)| name.eq_ignore_ascii_case("x-forwarded-for"))
        {
            existing.push_str(", ");
            existing.push_str(&proxy_ip);
        } else {
            headers.push((
                "X-Forwarded-For".to_string(),
                format!("{remote_ip}, {proxy_ip}"),
            ));
        }
    }

    let envelope = WireRequest {
        method: method.to_string(),
        path: path.to_string(),
        host: host.to_string(),
        query_arguments,
        headers,
        body: body.map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
        body_link,
        extra,
    };
    serde_json::to_string(&envelope).expect("WireRequest always serializes")
}

/// A request, unserialized and ready to be issued against the upstream host.
pub struct UnserializedRequest {
    pub method: String,
    pub path: String,
    pub query_arguments: IndexMap<String, Vec<String>>,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub body_link: Option<String>,
    pub extra: Map<String, Value>,
}

const BODY_INJECTED_METHODS: [&str; 3] = ["POST", "PUT", "PATCH"];

/// Unserializes a request envelope, replacing the `Host` header with
/// `force_host` and preserving the original host in `X-Forwarded-Host`
/// (§4.1).
pub fn unserialize_request(
    message: &str,
    force_host: &str,
) -> Result<UnserializedRequest, CodecError> {
    let decoded: WireRequest = serde_json::from_str(message)?;
    if decoded.method.is_empty() {
        return Err(CodecError::MissingField("method"));
    }

    let mut headers: Vec<(String, String)> = decoded
        .headers
        .into_iter()
        .filter(|(name, _)| !name.eq_ignore_ascii_case("host"))
        .collect();
    headers.push(("Host".to_string(), force_host.to_string()));
    headers.push(("X-Forwarded-Host".to_string(), decoded.host));

    let mut body = match decoded.body {
        Some(encoded) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .unwrap_or_default(),
        ),
        None => None,
    };
    let body_link = decoded.body_link;
    if body.is_none()
        && body_link.is_none()
        && BODY_INJECTED_METHODS.contains(&decoded.method.to_uppercase().as_str())
    {
        body = Some(Vec::new());
    }

    Ok(UnserializedRequest {
        method: decoded.method,
        path: decoded.path,
        query_arguments: decoded.query_arguments,
        headers,
        body,
        body_link,
        extra: decoded.extra,
    })
}

/// The response envelope as it travels on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireResponse {
    pub status_code: u16,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<(String, String)>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body_link: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

pub fn serialize_response(
    status_code: u16,
    headers: Vec<(String, String)>,
    body: Option<&[u8]>,
    body_link: Option<String>,
    extra: Map<String, Value>,
) -> String {
    let envelope = WireResponse {
        status_code,
        headers,
        body: body.map(|b| base64::engine::general_purpose::STANDARD.encode(b)),
        body_link,
        extra,
    };
    serde_json::to_string(&envelope).expect("WireResponse always serializes")
}

pub struct UnserializedResponse {
    pub status_code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
    pub body_link: Option<String>,
    pub extra: Map<String, Value>,
}

pub fn unserialize_response(message: &str) -> Result<UnserializedResponse, CodecError> {
    let decoded: WireResponse = serde_json::from_str(message)?;
    let body = match &decoded.body {
        Some(encoded) => Some(
            base64::engine::general_purpose::STANDARD
                .decode(encoded.as_bytes())
                .unwrap_or_default(),
        ),
        None => None,
    };
    Ok(UnserializedResponse {
        status_code: decoded.status_code,
        headers: decoded.headers,
        body,
        body_link: decoded.body_link,
        extra: decoded.extra,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_preserves_order_and_duplicates() {
        let mut query = IndexMap::new();
        query.insert(
            "foo1".to_string(),
            vec!["bar1".to_string(), "bar2".to_string()],
        );
        query.insert("foo2".to_string(), vec!["éééé".to_string()]);
        let headers = vec![
            ("Foo".to_string(), "bar".to_string()),
            ("Foo".to_string(), "bar2".to_string()),
            ("Foo2".to_string(), "bar3".to_string()),
        ];
        let wire = serialize_request(
            "PUT",
            "/foo/bar",
            "example.com",
            "1.2.3.4",
            query,
            headers,
            Some(b"foo"),
            None,
            None,
            Map::new(),
        );
        let unser = unserialize_request(&wire, "backend.local:8080").unwrap();
        assert_eq!(unser.method, "PUT");
        assert_eq!(unser.path, "/foo/bar");
        assert_eq!(
            unser.query_arguments.get("foo1").unwrap(),
            &vec!["bar1".to_string(), "bar2".to_string()]
        );
        assert_eq!(unser.query_arguments.get("foo2").unwrap(), &vec!["éééé".to_string()]);
        let foo_headers: Vec<_> = unser
            .headers
            .iter()
            .filter(|(k, _)| k == "Foo")
            .map(|(_, v)| v.clone())
            .collect();
        assert_eq!(foo_headers, vec!["bar".to_string(), "bar2".to_string()]);
        assert_eq!(unser.body.as_deref(), Some(b"foo".as_ref()));
        assert!(unser.body_link.is_none());
    }

    #[test]
    fn host_header_replaced_and_original_forwarded() {
        let wire = serialize_request(
            "GET",
            "/x",
            "caller.example",
            "9.9.9.9",
            IndexMap::new(),
            vec![],
            None,
            None,
            None,
            Map::new(),
        );
        let unser = unserialize_request(&wire, "upstream:9000").unwrap();
        assert!(unser
            .headers
            .iter()
            .any(|(k, v)| k == "Host" && v == "upstream:9000"));
        assert!(unser
            .headers
            .iter()
            .any(|(k, v)| k == "X-Forwarded-Host" && v == "caller.example"));
    }

    #[test]
    fn empty_body_injected_for_mutating_methods_without_body() {
        let wire = serialize_request(
            "POST",
            "/x",
            "h",
            "1.1.1.1",
            IndexMap::new(),
            vec![],
            None,
            None,
            None,
            Map::new(),
        );
        let unser = unserialize_request(&wire, "h2").unwrap();
        assert_eq!(unser.body, Some(Vec::new()));
    }

    #[test]
    fn malformed_json_is_an_error() {
        assert!(unserialize_request("not json", "h").is_err());
        assert!(unserialize_response("not json").is_err());
    }

    #[test]
    fn proxy_ip_auto_appends_to_existing_header() {
        let headers = vec![("X-Forwarded-For".to_string(), "1.1.1.1".to_string())];
        let wire = serialize_request(
            "GET",
            "/x",
            "h",
            "2.2.2.2",
            IndexMap::new(),
            headers,
            None,
            None,
            Some(ProxyIp::Fixed("3.3.3.3".to_string())),
            Map::new(),
        );
        let unser = unserialize_request(&wire, "h2").unwrap();
        let xff = unser
            .headers
            .iter()
            .find(|(k, _)| k == "X-Forwarded-For")
            .unwrap();
        assert_eq!(xff.1, "1.1.1.1, 3.3.3.3");
    }
}
