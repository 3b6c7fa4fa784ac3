//! Identity provider seam
//!
//! The bridge never speaks OAuth itself; it asks an [`IdentityProvider`] for
//! tokens. [`crate::auth::oauth::OAuthProvider`] is the production
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::tokens::{AccessToken, Account, ScopeSet};
use super::AuthConfig;

/// A token as handed back by the provider.
#[derive(Debug, Clone)]
pub struct ProviderToken {
    pub access_token: AccessToken,
    pub expires_at: DateTime<Utc>,
    /// Provider holds a refresh grant and can renew this token silently.
    pub refreshable: bool,
    pub account: Account,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderFailure {
    /// The user declined, closed the prompt or let it expire.
    #[error("user cancelled the interaction")]
    Cancelled,

    /// The provider (or the path to it) refused the request.
    #[error("{code}: {description}")]
    Rejected { code: String, description: String },
}

impl ProviderFailure {
    pub fn rejected(code: impl Into<String>, description: impl Into<String>) -> Self {
        ProviderFailure::Rejected {
            code: code.into(),
            description: description.into(),
        }
    }

    /// Transport-level failure reaching the provider.
    pub fn network(err: impl std::fmt::Display) -> Self {
        Self::rejected("network_error", err.to_string())
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Renew a token for `account` without user interaction.
    async fn acquire_token_silent(
        &self,
        config: &AuthConfig,
        account: &Account,
        scopes: &ScopeSet,
    ) -> Result<ProviderToken, ProviderFailure>;

    /// Sign the user in. May wait indefinitely on the user.
    async fn acquire_token_interactive(
        &self,
        config: &AuthConfig,
        scopes: &ScopeSet,
    ) -> Result<ProviderToken, ProviderFailure>;

    /// Forget any provider-side state held for `account`.
    async fn sign_out(&self, _account: &Account) -> Result<(), ProviderFailure> {
        Ok(())
    }
}
