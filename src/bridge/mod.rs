//! Host-facing bridge
//!
//! [`BridgeFacade`] is the only thing a host talks to. It validates raw
//! arguments, drives the [`AuthFlowController`] and turns every outcome into
//! a serializable payload: a token on success, an [`ErrorPayload`] carrying a
//! stable [`ErrorKind`] on failure.

pub mod rpc;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::{
    AccountStore, Acquired, Account, AuthConfig, AuthFlowController, BridgeState, Clock,
    ConfigureRequest, IdentityProvider, ScopeSet, SystemClock, TokenCache,
};
use crate::error::{BridgeError, BridgeResult, ErrorKind};
use crate::storage::SecureStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPayload {
    pub id: String,
    pub name: Option<String>,
    pub username: Option<String>,
    pub tenant_id: Option<String>,
}

impl From<&Account> for AccountPayload {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.display_name.clone(),
            username: account.username.clone(),
            tenant_id: account.tenant_id.clone(),
        }
    }
}

#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPayload {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
    pub account: AccountPayload,
    pub scopes: Vec<String>,
    pub from_cache: bool,
}

impl From<Acquired> for TokenPayload {
    fn from(acquired: Acquired) -> Self {
        Self {
            access_token: acquired.record.access_token.secret().to_string(),
            expires_at: acquired.record.expires_at,
            account: AccountPayload::from(&acquired.account),
            scopes: acquired.record.scopes.to_vec(),
            from_cache: acquired.from_cache,
        }
    }
}

impl fmt::Debug for TokenPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPayload")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("account", &self.account)
            .field("scopes", &self.scopes)
            .field("from_cache", &self.from_cache)
            .finish()
    }
}

/// Failure as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("{error_kind}: {message}")]
pub struct ErrorPayload {
    pub error_kind: ErrorKind,
    pub message: String,
    /// Verbatim provider code for `ProviderError`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl From<BridgeError> for ErrorPayload {
    fn from(err: BridgeError) -> Self {
        Self {
            error_kind: err.kind(),
            code: err.provider_code().map(str::to_string),
            message: err.to_string(),
        }
    }
}

impl ErrorPayload {
    pub(crate) fn new(error_kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind,
            message: message.into(),
            code: None,
        }
    }
}

pub type BridgeOutcome<T> = std::result::Result<T, ErrorPayload>;

fn report(operation: &str, err: BridgeError) -> ErrorPayload {
    match err.kind() {
        ErrorKind::InternalError => tracing::error!("{} failed: {}", operation, err),
        kind => tracing::warn!("{} failed ({}): {}", operation, kind, err),
    }
    ErrorPayload::from(err)
}

pub struct BridgeFacade {
    controller: AuthFlowController,
}

impl BridgeFacade {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SecureStore>,
    ) -> BridgeResult<Self> {
        Self::with_clock(provider, store, Arc::new(SystemClock))
    }

    /// Open the cache and account store from `store` and wire up the flow.
    pub fn with_clock(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn SecureStore>,
        clock: Arc<dyn Clock>,
    ) -> BridgeResult<Self> {
        let cache = Arc::new(TokenCache::open(store.clone())?);
        let accounts = Arc::new(AccountStore::open(store)?);
        Ok(Self {
            controller: AuthFlowController::new(cache, accounts, provider, clock),
        })
    }

    pub fn configure(&self, request: ConfigureRequest) -> BridgeOutcome<()> {
        let config = AuthConfig::from_request(request).map_err(|e| report("configure", e))?;
        self.controller.configure(config);
        Ok(())
    }

    pub async fn login(&self) -> BridgeOutcome<TokenPayload> {
        self.controller
            .login()
            .await
            .map(TokenPayload::from)
            .map_err(|e| report("login", e))
    }

    pub async fn acquire_token(&self, scopes: Vec<String>) -> BridgeOutcome<TokenPayload> {
        self.controller
            .acquire_token(ScopeSet::new(scopes))
            .await
            .map(TokenPayload::from)
            .map_err(|e| report("acquireToken", e))
    }

    pub async fn logout(&self) -> BridgeOutcome<()> {
        self.controller
            .logout()
            .await
            .map(|_| ())
            .map_err(|e| report("logout", e))
    }

    /// A signed-in account is known. Its tokens may still need renewal.
    pub fn is_authenticated(&self) -> bool {
        self.controller.current_account().is_some()
    }

    pub fn current_account(&self) -> Option<AccountPayload> {
        self.controller.current_account().as_ref().map(AccountPayload::from)
    }

    /// App roles granted to the current account, empty when signed out.
    pub fn user_roles(&self) -> Vec<String> {
        self.controller
            .current_account()
            .map(|a| a.roles)
            .unwrap_or_default()
    }

    pub fn state(&self) -> BridgeState {
        self.controller.state()
    }

    pub fn cancel(&self) -> bool {
        self.controller.cancel()
    }
}
