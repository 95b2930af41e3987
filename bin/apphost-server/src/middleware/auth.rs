//! Bearer-token authorization.
//!
//! Handlers extract [`Credentials`] from the request and ask the shared
//! [`Authorizer`] whether an [`Action`] on a [`Resource`] is allowed before
//! any lifecycle task is created.

use apphost_core::{AppKey, AppType};
use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use std::convert::Infallible;
use tracing::{debug, warn};

use crate::error::ServerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Get,
    Post,
    Put,
    Delete,
}

/// What an action applies to: every app of a type, or one app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resource {
    Type(AppType),
    Instance(AppKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// No token, or a token nobody issued.
    Unauthenticated,
    /// A known token without the needed permission.
    Forbidden,
}

impl From<Denied> for ServerError {
    fn from(d: Denied) -> Self {
        match d {
            Denied::Unauthenticated => ServerError::Unauthorized("unauthorised".into()),
            Denied::Forbidden => ServerError::Forbidden("forbidden".into()),
        }
    }
}

/// Bearer token presented by the caller, if any.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub token: Option<String>,
}

impl<S: Send + Sync> FromRequestParts<S> for Credentials {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(|t| t.trim().to_owned())
            .filter(|t| !t.is_empty());
        Ok(Credentials { token })
    }
}

pub trait Authorizer: Send + Sync + 'static {
    fn authorize(
        &self,
        credentials: &Credentials,
        action: Action,
        resource: &Resource,
    ) -> Result<(), Denied>;
}

/// Two-tier static tokens: admin may do everything, read may only `Get`.
///
/// Without an admin token every request is allowed.
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    admin_token: Option<String>,
    read_token: Option<String>,
}

impl TokenAuthorizer {
    pub fn new(admin_token: Option<String>, read_token: Option<String>) -> Self {
        if admin_token.is_none() {
            warn!("APPHOST_ADMIN_TOKEN is not set; every request is authorized");
        }
        Self {
            admin_token,
            read_token,
        }
    }
}

impl Authorizer for TokenAuthorizer {
    fn authorize(
        &self,
        credentials: &Credentials,
        action: Action,
        resource: &Resource,
    ) -> Result<(), Denied> {
        let Some(admin) = &self.admin_token else {
            return Ok(());
        };
        let Some(token) = credentials.token.as_deref() else {
            debug!(?action, ?resource, "request without credentials");
            return Err(Denied::Unauthenticated);
        };

        if token == admin {
            return Ok(());
        }
        if self.read_token.as_deref() == Some(token) {
            return if action == Action::Get {
                Ok(())
            } else {
                debug!(?action, ?resource, "read token used for a write");
                Err(Denied::Forbidden)
            };
        }
        Err(Denied::Unauthenticated)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
