//! Authentication core
//!
//! Token cache, account store and the acquisition state machine, plus the
//! OAuth2 provider that backs them in production.

pub mod account;
pub mod cache;
mod claims;
pub mod flow;
pub mod oauth;
pub mod provider;
pub mod tokens;

pub use account::AccountStore;
pub use cache::TokenCache;
pub use flow::{Acquired, AuthFlowController, BridgeState, Clock, SystemClock};
pub use oauth::OAuthProvider;
pub use provider::{IdentityProvider, ProviderFailure, ProviderToken};
pub use tokens::{AccessToken, Account, ScopeSet, TokenRecord};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BridgeError, BridgeResult};

/// Tokens this close to expiry are treated as expired. Off unless asked for.
pub const DEFAULT_EXPIRATION_BUFFER_SECS: u64 = 0;

/// Upper bound accepted for `tokenExpirationBufferSecs` (one day).
pub const MAX_EXPIRATION_BUFFER_SECS: u64 = 86_400;

/// Raw `configure` arguments as the host sends them.
///
/// Every field is optional at this level so a missing value is reported as a
/// configuration error rather than a decoding failure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigureRequest {
    pub client_id: Option<String>,
    pub authority: Option<String>,
    pub redirect_uri: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub known_authorities: Vec<String>,
    pub token_expiration_buffer_secs: Option<u64>,
    pub guard_for_rerenders: bool,
}

/// Validated client configuration. Replaced as a whole on re-configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthConfig {
    /// OAuth2 client ID (public client)
    pub client_id: String,
    /// Authority URL, e.g. `https://login.microsoftonline.com/<tenant>`
    pub authority: Url,
    pub redirect_uri: Option<Url>,
    /// Scopes requested by `login`
    pub scopes: ScopeSet,
    pub known_authorities: Vec<String>,
    pub token_expiration_buffer: Duration,
    /// Ignore `configure` once a configuration is installed
    pub guard_for_rerenders: bool,
}

impl AuthConfig {
    pub fn from_request(request: ConfigureRequest) -> BridgeResult<Self> {
        let client_id = request
            .client_id
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::Config("clientId is required".into()))?;

        let authority_raw = request
            .authority
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| BridgeError::Config("authority is required".into()))?;
        let authority = Url::parse(&authority_raw).map_err(|e| {
            BridgeError::Config(format!(
                "authority '{}' is not a valid URL: {}",
                authority_raw, e
            ))
        })?;
        if authority.scheme() != "https" {
            return Err(BridgeError::Config(format!(
                "authority '{}' must use https",
                authority_raw
            )));
        }
        let host = authority
            .host_str()
            .ok_or_else(|| {
                BridgeError::Config(format!("authority '{}' has no host", authority_raw))
            })?
            .to_lowercase();

        let known_authorities: Vec<String> = request
            .known_authorities
            .iter()
            .map(|h| h.trim().to_lowercase())
            .filter(|h| !h.is_empty())
            .collect();
        if !known_authorities.is_empty() && !known_authorities.contains(&host) {
            return Err(BridgeError::Config(format!(
                "authority host '{}' is not in knownAuthorities",
                host
            )));
        }

        let redirect_uri = match request.redirect_uri.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(Url::parse(raw).map_err(|e| {
                BridgeError::Config(format!("redirectUri '{}' is not a valid URL: {}", raw, e))
            })?),
            _ => None,
        };

        let scopes = ScopeSet::new(request.scopes.unwrap_or_default());
        if scopes.is_empty() {
            return Err(BridgeError::Config("at least one scope is required".into()));
        }

        let buffer_secs = request
            .token_expiration_buffer_secs
            .unwrap_or(DEFAULT_EXPIRATION_BUFFER_SECS);
        if buffer_secs > MAX_EXPIRATION_BUFFER_SECS {
            return Err(BridgeError::Config(format!(
                "tokenExpirationBufferSecs {} exceeds the maximum of {}",
                buffer_secs, MAX_EXPIRATION_BUFFER_SECS
            )));
        }

        Ok(Self {
            client_id,
            authority,
            redirect_uri,
            scopes,
            known_authorities,
            token_expiration_buffer: Duration::seconds(buffer_secs as i64),
            guard_for_rerenders: request.guard_for_rerenders,
        })
    }

    /// Authority as a string without a trailing slash, for building endpoints.
    pub fn authority_base(&self) -> &str {
        self.authority.as_str().trim_end_matches('/')
    }
}
