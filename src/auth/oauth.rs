//! OAuth2 provider for Microsoft identity platform authorities
//!
//! Interactive sign-in uses the device code flow; silent renewal uses the
//! refresh token grant. Refresh tokens are held in the secure store, keyed by
//! account id, and never leave this module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Utc;
use oauth2::basic::{
    BasicErrorResponse, BasicRevocationErrorResponse, BasicTokenIntrospectionResponse,
    BasicTokenType,
};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, Client, ClientId, DeviceAuthorizationUrl, ErrorResponse, ExtraTokenFields,
    RedirectUrl, RefreshToken, RequestTokenError, Scope, StandardDeviceAuthorizationResponse,
    StandardRevocableToken, StandardTokenResponse, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};

use super::claims::IdTokenClaims;
use super::provider::{IdentityProvider, ProviderFailure, ProviderToken};
use super::tokens::{AccessToken, Account, ScopeSet};
use super::AuthConfig;
use crate::storage::{load_json, store_json, SecureStore, StorageResult};

/// Scopes always requested so the response carries an ID token and a
/// refresh token.
const RESERVED_SCOPES: [&str; 3] = ["openid", "profile", "offline_access"];

/// Lifetime assumed when the token response omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 3600;

const VAULT_KEY: &str = "refresh_tokens";

/// `id_token` carried alongside the standard token response fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdTokenFields {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}

impl ExtraTokenFields for IdTokenFields {}

type MsalTokenResponse = StandardTokenResponse<IdTokenFields, BasicTokenType>;

type MsalClient = Client<
    BasicErrorResponse,
    MsalTokenResponse,
    BasicTokenType,
    BasicTokenIntrospectionResponse,
    StandardRevocableToken,
    BasicRevocationErrorResponse,
>;

/// What the user needs to complete device code sign-in.
#[derive(Debug, Clone)]
pub struct DeviceCode {
    pub verification_uri: String,
    pub user_code: String,
    pub expires_in: Duration,
}

/// Presents a device code to the user (terminal, host UI, ...).
pub type DevicePrompt = Arc<dyn Fn(&DeviceCode) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
struct Endpoints {
    authorization_endpoint: String,
    token_endpoint: String,
    device_authorization_endpoint: Option<String>,
}

impl Endpoints {
    /// Microsoft identity platform v2.0 paths under the authority.
    fn conventional(authority: &str) -> Self {
        Self {
            authorization_endpoint: format!("{}/oauth2/v2.0/authorize", authority),
            token_endpoint: format!("{}/oauth2/v2.0/token", authority),
            device_authorization_endpoint: Some(format!(
                "{}/oauth2/v2.0/devicecode",
                authority
            )),
        }
    }
}

/// Refresh tokens by account id, persisted through the secure store.
struct RefreshVault {
    tokens: Mutex<HashMap<String, String>>,
    store: Arc<dyn SecureStore>,
}

impl RefreshVault {
    fn open(store: Arc<dyn SecureStore>) -> StorageResult<Self> {
        let tokens: HashMap<String, String> =
            load_json(store.as_ref(), VAULT_KEY)?.unwrap_or_default();
        Ok(Self {
            tokens: Mutex::new(tokens),
            store,
        })
    }

    fn get(&self, account_id: &str) -> Option<String> {
        self.tokens
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(account_id)
            .cloned()
    }

    fn put(&self, account_id: &str, refresh_token: &str) -> StorageResult<()> {
        let mut guard = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        guard.insert(account_id.to_string(), refresh_token.to_string());
        store_json(self.store.as_ref(), VAULT_KEY, &*guard)
    }

    fn remove(&self, account_id: &str) -> StorageResult<()> {
        let mut guard = self.tokens.lock().unwrap_or_else(|e| e.into_inner());
        if guard.remove(account_id).is_some() {
            store_json(self.store.as_ref(), VAULT_KEY, &*guard)?;
        }
        Ok(())
    }
}

pub struct OAuthProvider {
    http: reqwest::Client,
    vault: RefreshVault,
    discovered: Mutex<HashMap<String, Endpoints>>,
    prompt: DevicePrompt,
}

impl OAuthProvider {
    pub fn new(store: Arc<dyn SecureStore>, prompt: DevicePrompt) -> StorageResult<Self> {
        Ok(Self {
            http: reqwest::Client::new(),
            vault: RefreshVault::open(store)?,
            discovered: Mutex::new(HashMap::new()),
            prompt,
        })
    }

    /// Endpoints for the configured authority, via OpenID discovery when
    /// reachable. Only discovered endpoints are remembered.
    async fn endpoints(&self, config: &AuthConfig) -> Endpoints {
        let authority = config.authority_base().to_string();
        let cached = {
            let guard = self.discovered.lock().unwrap_or_else(|e| e.into_inner());
            guard.get(&authority).cloned()
        };
        if let Some(endpoints) = cached {
            return endpoints;
        }

        match self.discover(&authority).await {
            Ok(endpoints) => {
                tracing::debug!("Discovered endpoints for {}", authority);
                self.discovered
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(authority, endpoints.clone());
                endpoints
            }
            Err(e) => {
                tracing::warn!(
                    "OpenID discovery failed for {}: {:#}; using conventional endpoints",
                    authority,
                    e
                );
                Endpoints::conventional(&authority)
            }
        }
    }

    async fn discover(&self, authority: &str) -> anyhow::Result<Endpoints> {
        let url = format!("{}/v2.0/.well-known/openid-configuration", authority);
        tracing::debug!("Fetching OpenID configuration from {}", url);

        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", url))?
            .error_for_status()
            .with_context(|| format!("GET {} returned an error status", url))?;

        resp.json()
            .await
            .context("Failed to parse OpenID configuration")
    }

    /// Turn a token response into a provider token, keeping any new refresh
    /// token. `previous` supplies the account when no ID token came back.
    fn into_provider_token(
        &self,
        response: MsalTokenResponse,
        previous: Option<&Account>,
    ) -> Result<ProviderToken, ProviderFailure> {
        let now = Utc::now();
        let lifetime = response
            .expires_in()
            .unwrap_or(Duration::from_secs(DEFAULT_TOKEN_LIFETIME_SECS));
        let expires_at = chrono::Duration::from_std(lifetime)
            .ok()
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                ProviderFailure::rejected(
                    "token_parsing_error",
                    format!("expires_in of {}s is out of range", lifetime.as_secs()),
                )
            })?;

        let from_id_token = match response.extra_fields().id_token.as_deref() {
            Some(id_token) => IdTokenClaims::decode(id_token)?.into_account(now),
            None => None,
        };
        let account = from_id_token
            .or_else(|| previous.cloned())
            .ok_or_else(|| {
                ProviderFailure::rejected(
                    "no_account_found",
                    "token response carried no usable ID token",
                )
            })?;

        let refreshable = match response.refresh_token() {
            Some(refresh_token) => {
                if let Err(e) = self.vault.put(&account.id, refresh_token.secret()) {
                    tracing::warn!("Failed to persist refresh token: {}", e);
                }
                true
            }
            None => self.vault.get(&account.id).is_some(),
        };

        Ok(ProviderToken {
            access_token: AccessToken::new(response.access_token().secret().as_str()),
            expires_at,
            refreshable,
            account,
        })
    }
}

#[async_trait]
impl IdentityProvider for OAuthProvider {
    async fn acquire_token_silent(
        &self,
        config: &AuthConfig,
        account: &Account,
        scopes: &ScopeSet,
    ) -> Result<ProviderToken, ProviderFailure> {
        let refresh_token = self
            .vault
            .get(&account.id)
            .map(RefreshToken::new)
            .ok_or_else(|| {
                ProviderFailure::rejected(
                    "no_tokens_found",
                    format!("no refresh token held for {}", account.id),
                )
            })?;

        let endpoints = self.endpoints(config).await;
        let client = build_client(config, &endpoints)?;

        tracing::info!("Refreshing token for {}", account.id);
        let result = request_scopes(scopes)
            .into_iter()
            .fold(client.exchange_refresh_token(&refresh_token), |req, scope| {
                req.add_scope(scope)
            })
            .request_async(async_http_client)
            .await
            .map_err(map_request_error);

        let response = match result {
            Ok(response) => response,
            Err(ProviderFailure::Rejected { code, description }) if code == "invalid_grant" => {
                // The grant is dead; holding on to it only repeats the failure.
                if let Err(e) = self.vault.remove(&account.id) {
                    tracing::warn!("Failed to drop revoked refresh token: {}", e);
                }
                return Err(ProviderFailure::Rejected { code, description });
            }
            Err(e) => return Err(e),
        };

        self.into_provider_token(response, Some(account))
    }

    async fn acquire_token_interactive(
        &self,
        config: &AuthConfig,
        scopes: &ScopeSet,
    ) -> Result<ProviderToken, ProviderFailure> {
        let endpoints = self.endpoints(config).await;
        let client = build_client(config, &endpoints)?;

        tracing::info!("Initiating device code flow...");
        let device_request = client
            .exchange_device_code()
            .map_err(|e| ProviderFailure::rejected("endpoints_resolution_error", e.to_string()))?;
        let details: StandardDeviceAuthorizationResponse = request_scopes(scopes)
            .into_iter()
            .fold(device_request, |req, scope| req.add_scope(scope))
            .request_async(async_http_client)
            .await
            .map_err(map_request_error)?;

        (self.prompt)(&DeviceCode {
            verification_uri: details.verification_uri().as_str().to_string(),
            user_code: details.user_code().secret().to_string(),
            expires_in: details.expires_in(),
        });

        tracing::info!("Waiting for authentication...");
        let response = client
            .exchange_device_access_token(&details)
            .request_async(async_http_client, tokio::time::sleep, None)
            .await
            .map_err(map_request_error)?;

        self.into_provider_token(response, None)
    }

    async fn sign_out(&self, account: &Account) -> Result<(), ProviderFailure> {
        self.vault
            .remove(&account.id)
            .map_err(|e| ProviderFailure::rejected("storage_error", e.to_string()))
    }
}

fn build_client(config: &AuthConfig, endpoints: &Endpoints) -> Result<MsalClient, ProviderFailure> {
    let url_error =
        |e: url::ParseError| ProviderFailure::rejected("url_parse_error", e.to_string());

    let device_url = endpoints
        .device_authorization_endpoint
        .clone()
        .or_else(|| {
            Endpoints::conventional(config.authority_base()).device_authorization_endpoint
        })
        .unwrap_or_default();

    let mut client = MsalClient::new(
        ClientId::new(config.client_id.clone()),
        None,
        AuthUrl::new(endpoints.authorization_endpoint.clone()).map_err(url_error)?,
        Some(TokenUrl::new(endpoints.token_endpoint.clone()).map_err(url_error)?),
    )
    .set_device_authorization_url(DeviceAuthorizationUrl::new(device_url).map_err(url_error)?);

    if let Some(redirect) = &config.redirect_uri {
        let redirect = RedirectUrl::new(redirect.to_string()).map_err(url_error)?;
        client = client.set_redirect_uri(redirect);
    }
    Ok(client)
}

/// Requested scopes plus the reserved OpenID Connect ones.
fn request_scopes(scopes: &ScopeSet) -> Vec<Scope> {
    ScopeSet::new(scopes.iter().chain(RESERVED_SCOPES))
        .iter()
        .map(|s| Scope::new(s.to_string()))
        .collect()
}

fn map_request_error<RE, TE>(err: RequestTokenError<RE, TE>) -> ProviderFailure
where
    RE: std::error::Error + 'static,
    TE: ErrorResponse + 'static,
{
    match err {
        RequestTokenError::ServerResponse(resp) => server_failure(&resp),
        RequestTokenError::Request(e) => ProviderFailure::network(e),
        RequestTokenError::Parse(e, _) => {
            ProviderFailure::rejected("failed_to_parse_response", e.to_string())
        }
        RequestTokenError::Other(msg) => ProviderFailure::rejected("unknown_error", msg),
    }
}

/// Map an OAuth error body to a failure, keeping the provider's code.
fn server_failure<TE: Serialize>(resp: &TE) -> ProviderFailure {
    let body = serde_json::to_value(resp).unwrap_or_default();
    let field = |name: &str| {
        body.get(name)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
    };
    let code = field("error").unwrap_or_else(|| "unknown_error".to_string());

    match code.as_str() {
        // User declined, or let the device code lapse without signing in.
        "access_denied" | "authorization_declined" | "expired_token" => ProviderFailure::Cancelled,
        _ => ProviderFailure::Rejected {
            code,
            description: field("error_description").unwrap_or_default(),
        },
    }
}
