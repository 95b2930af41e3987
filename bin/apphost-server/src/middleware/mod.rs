//! HTTP middleware and request extractors.

pub mod auth;
pub mod cors;
pub mod tenant;
pub mod trace;

pub use auth::{Action, Authorizer, Credentials, Resource, TokenAuthorizer};
pub use tenant::Tenant;
