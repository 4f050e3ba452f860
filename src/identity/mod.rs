//! Identity assertion shared by the gateway and every subgraph.
//!
//! A request's identity is rebuilt from its `Authorization: Bearer <token>`
//! header on every call: the token is an HS256 JWT whose claims are the
//! [`Principal`]. Verification failures never reject the request, they only
//! downgrade it to anonymous; resolvers decide whether anonymous access is
//! allowed.
//!
//! Signing keys are looked up by the `kid` header so that several secrets can
//! be accepted at once while a new one is rolled out.

pub mod password;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use http::HeaderMap;
use http::header::AUTHORIZATION;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, decode_header, encode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub use password::{hash_password, verify_password};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdentityError {
    #[error("token expired")]
    Expired,

    #[error("invalid token signature")]
    InvalidSignature,

    #[error("unknown signing key id: {0}")]
    UnknownKey(String),

    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("failed to sign token: {0}")]
    Signing(String),

    #[error("invalid identity configuration: {0}")]
    Config(String),
}

/// Closed set of roles a principal can hold.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, async_graphql::Enum,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Patient,
    Nurse,
    Resident,
    BusinessOwner,
    CommunityOrganizer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Patient => "PATIENT",
            Role::Nurse => "NURSE",
            Role::Resident => "RESIDENT",
            Role::BusinessOwner => "BUSINESS_OWNER",
            Role::CommunityOrganizer => "COMMUNITY_ORGANIZER",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    // Both `PATIENT` and `patient` spellings are in use by the client apps.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PATIENT" => Ok(Role::Patient),
            "NURSE" => Ok(Role::Nurse),
            "RESIDENT" => Ok(Role::Resident),
            "BUSINESS_OWNER" => Ok(Role::BusinessOwner),
            "COMMUNITY_ORGANIZER" => Ok(Role::CommunityOrganizer),
            other => Err(format!("Invalid role: {other}")),
        }
    }
}

/// The authenticated identity carried by a token. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    pub user_name: String,
    pub role: Role,
    pub iat: u64,
    pub exp: u64,
}

impl Principal {
    pub fn has_role(&self, roles: &[Role]) -> bool {
        roles.contains(&self.role)
    }
}

struct KeyRing {
    active: String,
    secrets: HashMap<String, Vec<u8>>,
}

/// Mints and verifies tokens against the shared signing keys.
#[derive(Clone)]
pub struct TokenAuthority {
    keys: Arc<KeyRing>,
    token_ttl: Duration,
}

impl fmt::Debug for TokenAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kids: Vec<&String> = self.keys.secrets.keys().collect();
        kids.sort();
        f.debug_struct("TokenAuthority")
            .field("active", &self.keys.active)
            .field("kids", &kids)
            .field("token_ttl", &self.token_ttl)
            .finish()
    }
}

impl TokenAuthority {
    /// Builds an authority from `kid -> secret` pairs. `active` is the key id
    /// used for minting and must be one of them.
    pub fn new<I, K, S>(active: &str, keys: I, token_ttl: Duration) -> Result<Self, IdentityError>
    where
        I: IntoIterator<Item = (K, S)>,
        K: Into<String>,
        S: AsRef<str>,
    {
        let mut secrets = HashMap::new();
        for (kid, secret) in keys {
            let kid = kid.into();
            if secret.as_ref().is_empty() {
                return Err(IdentityError::Config(format!("secret for key {kid} is empty")));
            }
            secrets.insert(kid, secret.as_ref().as_bytes().to_vec());
        }
        if !secrets.contains_key(active) {
            return Err(IdentityError::Config(format!(
                "active key {active} is not among the configured keys"
            )));
        }
        if token_ttl.is_zero() {
            return Err(IdentityError::Config("token lifetime must be positive".into()));
        }

        Ok(TokenAuthority {
            keys: Arc::new(KeyRing {
                active: active.to_string(),
                secrets,
            }),
            token_ttl,
        })
    }

    /// Single-key authority, mostly for tools and tests.
    pub fn with_secret(secret: &str, token_ttl: Duration) -> Result<Self, IdentityError> {
        Self::new("default", [("default", secret)], token_ttl)
    }

    pub fn token_ttl(&self) -> Duration {
        self.token_ttl
    }

    pub fn active_key_id(&self) -> &str {
        &self.keys.active
    }

    pub fn mint(&self, id: &str, user_name: &str, role: Role) -> Result<String, IdentityError> {
        self.mint_with_ttl(id, user_name, role, self.token_ttl)
    }

    pub fn mint_with_ttl(
        &self,
        id: &str,
        user_name: &str,
        role: Role,
        ttl: Duration,
    ) -> Result<String, IdentityError> {
        let now = unix_now()?;
        self.issue(&Principal {
            id: id.to_string(),
            user_name: user_name.to_string(),
            role,
            iat: now,
            exp: now + ttl.as_secs(),
        })
    }

    /// Signs `principal` as-is with the active key.
    pub fn issue(&self, principal: &Principal) -> Result<String, IdentityError> {
        let secret = self
            .keys
            .secrets
            .get(&self.keys.active)
            .ok_or_else(|| IdentityError::UnknownKey(self.keys.active.clone()))?;

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(self.keys.active.clone());

        encode(&header, principal, &EncodingKey::from_secret(secret))
            .map_err(|e| IdentityError::Signing(e.to_string()))
    }

    pub fn verify(&self, token: &str) -> Result<Principal, IdentityError> {
        let header = decode_header(token).map_err(|e| IdentityError::Malformed(e.to_string()))?;
        let kid = header.kid.unwrap_or_else(|| self.keys.active.clone());
        let secret = self
            .keys
            .secrets
            .get(&kid)
            .ok_or(IdentityError::UnknownKey(kid))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        decode::<Principal>(token, &DecodingKey::from_secret(secret), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => IdentityError::Expired,
                ErrorKind::InvalidSignature => IdentityError::InvalidSignature,
                _ => IdentityError::Malformed(e.to_string()),
            })
    }
}

fn unix_now() -> Result<u64, IdentityError> {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .map_err(|e| IdentityError::Signing(format!("system clock error: {e}")))
}

/// Extracts `<token>` from `Authorization: Bearer <token>`. Any other shape
/// counts as no token at all.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    if token.is_empty() || token.contains(' ') {
        return None;
    }
    Some(token.to_string())
}

/// Per-request `{token, principal}` pair handed to every resolver.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RequestIdentity {
    /// The raw bearer token as received, forwarded unmodified downstream.
    pub token: Option<String>,
    /// `None` when the request is anonymous or the token did not verify.
    pub principal: Option<Principal>,
}

impl RequestIdentity {
    pub const ANONYMOUS: RequestIdentity = RequestIdentity {
        token: None,
        principal: None,
    };

    pub fn from_headers(headers: &HeaderMap, authority: &TokenAuthority) -> Self {
        Self::from_token(bearer_token(headers), authority)
    }

    pub fn from_token(token: Option<String>, authority: &TokenAuthority) -> Self {
        let Some(token) = token else {
            return RequestIdentity::ANONYMOUS;
        };

        let principal = match authority.verify(&token) {
            Ok(principal) => {
                debug!(principal = %principal.id, role = %principal.role, "token verified");
                Some(principal)
            }
            Err(e) => {
                warn!(error = %e, token = %token_prefix(&token), "token rejected; continuing as anonymous");
                None
            }
        };

        RequestIdentity {
            token: Some(token),
            principal,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.principal.is_some()
    }
}

fn token_prefix(token: &str) -> String {
    let prefix: String = token.chars().take(12).collect();
    format!("{prefix}...")
}
