//! Tenant resolution from the `Host` header.

use axum::extract::FromRequestParts;
use axum::http::header::HOST;
use axum::http::request::Parts;

use crate::error::ServerError;

/// The tenant a request is addressed to: its host name, lower-cased and
/// without port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant(pub String);

impl Tenant {
    pub fn parse(host: &str) -> Result<Self, ServerError> {
        let name = match host.rsplit_once(':') {
            Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
            _ => host,
        };
        let name = name.trim().trim_end_matches('.').to_ascii_lowercase();
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && !name.contains("..")
            && name
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'.' || b == b'-');
        if valid {
            Ok(Tenant(name))
        } else {
            Err(ServerError::BadRequest(format!("invalid host {host:?}")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Tenant {
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let host = parts
            .headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .or_else(|| parts.uri.authority().map(|a| a.as_str()))
            .ok_or_else(|| ServerError::BadRequest("missing Host header".into()))?;
        Tenant::parse(host)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn strips_port_and_lowercases() {
        assert_eq!(Tenant::parse("Alice.Example:8080").unwrap().as_str(), "alice.example");
        assert_eq!(Tenant::parse("bob.example").unwrap().as_str(), "bob.example");
        assert_eq!(Tenant::parse("bob.example.").unwrap().as_str(), "bob.example");
    }

    #[test]
    fn rejects_unsafe_hosts() {
        for bad in ["", ":80", "../etc", "a/b", "a..b", ".hidden", "exa mple"] {
            assert!(Tenant::parse(bad).is_err(), "{bad:?}");
        }
    }

    #[tokio::test]
    async fn missing_host_is_bad_request() {
        let (mut parts, ()) = axum::http::Request::builder()
            .uri("/apps/")
            .body(())
            .unwrap()
            .into_parts();
        let err = Tenant::from_request_parts(&mut parts, &()).await.unwrap_err();
        assert!(matches!(err, ServerError::BadRequest(_)));
    }
}
