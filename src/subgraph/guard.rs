//! Authorization checks for resolvers.
//!
//! Anonymous callers fail with `UNAUTHENTICATED`; authenticated callers
//! holding the wrong role or touching someone else's record fail with
//! `FORBIDDEN`.

use async_graphql::{Context, Error, ErrorExtensions};

use std::fmt::Display;

use crate::identity::{Principal, RequestIdentity, Role};

fn coded(message: impl Into<String>, code: &'static str) -> Error {
    Error::new(message).extend_with(|_, e| e.set("code", code))
}

pub fn unauthenticated() -> Error {
    coded("Not authenticated", "UNAUTHENTICATED")
}

pub fn forbidden(message: impl Into<String>) -> Error {
    coded(message, "FORBIDDEN")
}

pub fn not_found(message: impl Into<String>) -> Error {
    coded(message, "NOT_FOUND")
}

pub fn bad_input(message: impl Into<String>) -> Error {
    coded(message, "BAD_USER_INPUT")
}

pub fn provisioning_failed(message: &str) -> Error {
    coded(message, "PROVISIONING_FAILED")
}

pub fn internal(e: impl Display) -> Error {
    coded(e.to_string(), "INTERNAL_SERVER_ERROR")
}

pub fn identity<'a>(ctx: &'a Context<'_>) -> Option<&'a Principal> {
    ctx.data_opt::<RequestIdentity>()
        .and_then(|identity| identity.principal.as_ref())
}

/// The caller, or `UNAUTHENTICATED`.
pub fn authenticated<'a>(ctx: &'a Context<'_>) -> Result<&'a Principal, Error> {
    identity(ctx).ok_or_else(unauthenticated)
}

/// The caller if they hold one of `roles`, else `FORBIDDEN`.
pub fn authorized<'a>(
    ctx: &'a Context<'_>,
    roles: &[Role],
    message: &str,
) -> Result<&'a Principal, Error> {
    let principal = authenticated(ctx)?;
    if principal.has_role(roles) {
        Ok(principal)
    } else {
        Err(forbidden(message))
    }
}
