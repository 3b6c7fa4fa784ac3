//! Token acquisition state machine
//!
//! ```text
//! Unconfigured --configure--> Configured --login--> Authenticating
//! Authenticating --ok--> Authenticated --login--> Authenticating
//! Authenticating --err--> Failed --login--> Authenticating
//! any --configure--> Configured
//! ```
//!
//! An acquisition first tries the cache, then a silent refresh of an expired
//! refresh-capable record, then interactive sign-in. Only one acquisition may
//! run at a time. Whatever happens to the flow (error, panic, the future
//! being dropped) the state leaves `Authenticating`.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::Instrument;
use uuid::Uuid;

use super::account::AccountStore;
use super::cache::TokenCache;
use super::provider::{IdentityProvider, ProviderToken};
use super::tokens::{Account, ScopeSet, TokenRecord};
use super::AuthConfig;
use crate::error::{BridgeError, BridgeResult};

/// Source of the current instant, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BridgeState {
    Unconfigured,
    Configured,
    Authenticating,
    Authenticated,
    Failed,
}

/// Result of a successful acquisition.
#[derive(Debug, Clone)]
pub struct Acquired {
    pub record: TokenRecord,
    pub account: Account,
    /// Served from the cache without contacting the provider.
    pub from_cache: bool,
}

struct Machine {
    state: BridgeState,
    config: Option<Arc<AuthConfig>>,
    /// Bumped by every applied `configure`; a flow started under an older
    /// generation does not get to write its final state.
    generation: u64,
    /// Bumped by every `cancel`; a flow that sees a different value than
    /// when it began has been cancelled.
    cancels: u64,
}

pub struct AuthFlowController {
    machine: Mutex<Machine>,
    cache: Arc<TokenCache>,
    accounts: Arc<AccountStore>,
    provider: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    cancel: Notify,
}

impl AuthFlowController {
    pub fn new(
        cache: Arc<TokenCache>,
        accounts: Arc<AccountStore>,
        provider: Arc<dyn IdentityProvider>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            machine: Mutex::new(Machine {
                state: BridgeState::Unconfigured,
                config: None,
                generation: 0,
                cancels: 0,
            }),
            cache,
            accounts,
            provider,
            clock,
            cancel: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Machine> {
        self.machine.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> BridgeState {
        self.lock().state
    }

    pub fn config(&self) -> Option<Arc<AuthConfig>> {
        self.lock().config.clone()
    }

    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    pub fn current_account(&self) -> Option<Account> {
        self.accounts.current()
    }

    /// Install `config` and reset to `Configured`.
    ///
    /// Returns `false` when an existing configuration was kept because it
    /// asked to be guarded against re-configuration.
    pub fn configure(&self, config: AuthConfig) -> bool {
        let mut m = self.lock();
        if let Some(existing) = &m.config {
            if existing.guard_for_rerenders {
                tracing::debug!("Configuration guarded against re-renders; keeping existing");
                return false;
            }
        }

        if m.state == BridgeState::Authenticating {
            tracing::warn!(
                "Reconfigured while a flow is in progress; its outcome will not change state"
            );
        }

        tracing::info!(
            "Configured client {} against {}",
            config.client_id,
            config.authority_base()
        );
        m.config = Some(Arc::new(config));
        m.generation += 1;
        transition(&mut m, BridgeState::Configured);
        true
    }

    /// Acquire a token for the configured scopes.
    pub async fn login(&self) -> BridgeResult<Acquired> {
        self.acquire(None).await
    }

    /// Acquire a token for `scopes` instead of the configured ones.
    pub async fn acquire_token(&self, scopes: ScopeSet) -> BridgeResult<Acquired> {
        if scopes.is_empty() {
            return Err(BridgeError::Config("at least one scope is required".into()));
        }
        self.acquire(Some(scopes)).await
    }

    /// Signal the in-flight interactive acquisition (if any) to give up.
    ///
    /// Returns whether the bridge was `Authenticating` when signalled.
    pub fn cancel(&self) -> bool {
        let running = {
            let mut m = self.lock();
            m.cancels += 1;
            m.state == BridgeState::Authenticating
        };
        if running {
            tracing::info!("Cancelling acquisition");
        }
        self.cancel.notify_waiters();
        running
    }

    /// Forget the current account and its tokens, returning to `Configured`.
    pub async fn logout(&self) -> BridgeResult<Option<Account>> {
        match self.state() {
            BridgeState::Unconfigured => return Err(BridgeError::NotConfigured),
            BridgeState::Authenticating => return Err(BridgeError::AlreadyInProgress),
            _ => {}
        }

        let result = self.forget_current().await;

        let mut m = self.lock();
        if m.state != BridgeState::Authenticating {
            let next = if result.is_ok() {
                BridgeState::Configured
            } else {
                BridgeState::Failed
            };
            transition(&mut m, next);
        }
        result
    }

    async fn forget_current(&self) -> BridgeResult<Option<Account>> {
        let account = self.accounts.current();
        if let Some(account) = &account {
            let cleared = self.cache.clear(&account.id)?;
            tracing::info!("Signed out {} ({} cached token(s) removed)", account.id, cleared);
            if let Err(e) = self.provider.sign_out(account).await {
                tracing::warn!("Provider sign-out failed: {}", e);
            }
        }
        self.accounts.clear()?;
        Ok(account)
    }

    async fn acquire(&self, scopes: Option<ScopeSet>) -> BridgeResult<Acquired> {
        let Flow {
            config,
            generation,
            ticket,
        } = self.begin()?;
        let scopes = scopes.unwrap_or_else(|| config.scopes.clone());

        let correlation_id = Uuid::new_v4();
        let span = tracing::info_span!("acquire", %correlation_id, scopes = %scopes);

        let mut guard = FlowGuard {
            machine: &self.machine,
            generation,
            resolved: false,
        };

        let outcome = AssertUnwindSafe(self.run_flow(&config, &scopes, ticket))
            .catch_unwind()
            .instrument(span)
            .await
            .unwrap_or_else(|panic| {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                Err(BridgeError::Internal(format!("acquisition panicked: {}", message)))
            });

        match &outcome {
            Ok(acquired) => {
                tracing::info!(
                    "Acquired token for {} (from_cache={})",
                    acquired.account.id,
                    acquired.from_cache
                );
                guard.resolve(BridgeState::Authenticated);
            }
            Err(BridgeError::Internal(msg)) => {
                tracing::error!("Acquisition failed internally: {}", msg);
                guard.resolve(BridgeState::Failed);
            }
            Err(e) => {
                tracing::warn!("Acquisition failed: {}", e);
                guard.resolve(BridgeState::Failed);
            }
        }
        outcome
    }

    /// Check the state and enter `Authenticating` in one critical section.
    fn begin(&self) -> BridgeResult<Flow> {
        let mut m = self.lock();
        match m.state {
            BridgeState::Unconfigured => Err(BridgeError::NotConfigured),
            BridgeState::Authenticating => Err(BridgeError::AlreadyInProgress),
            _ => {
                let config = m.config.clone().ok_or(BridgeError::NotConfigured)?;
                transition(&mut m, BridgeState::Authenticating);
                Ok(Flow {
                    config,
                    generation: m.generation,
                    ticket: m.cancels,
                })
            }
        }
    }

    /// Run `step` unless the flow holding `ticket` is cancelled first.
    ///
    /// The waiter is registered before the ticket is checked, so a `cancel`
    /// landing at any point after `begin` is observed.
    async fn cancellable<F: Future>(&self, ticket: u64, step: F) -> BridgeResult<F::Output> {
        let notified = self.cancel.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.lock().cancels != ticket {
            return Err(BridgeError::UserCancelled);
        }
        tokio::select! {
            out = step => Ok(out),
            _ = &mut notified => Err(BridgeError::UserCancelled),
        }
    }

    async fn run_flow(
        &self,
        config: &AuthConfig,
        scopes: &ScopeSet,
        ticket: u64,
    ) -> BridgeResult<Acquired> {
        let horizon = self
            .clock
            .now()
            .checked_add_signed(config.token_expiration_buffer)
            .ok_or_else(|| BridgeError::Internal("expiration horizon out of range".into()))?;

        self.cache.evict_expired(horizon)?;

        if let Some(account) = self.accounts.current() {
            if let Some(record) = self.cache.get(&account.id, scopes, horizon) {
                tracing::debug!("Cache hit for {}", account.id);
                return Ok(Acquired {
                    record,
                    account,
                    from_cache: true,
                });
            }

            if let Some(stale) = self.cache.peek_expired(&account.id, scopes, horizon) {
                if stale.refreshable {
                    tracing::info!(
                        "Cached token expired at {}, refreshing silently",
                        stale.expires_at
                    );
                    let refresh = self.provider.acquire_token_silent(config, &account, scopes);
                    match self.cancellable(ticket, refresh).await? {
                        Ok(token) => return self.commit(token, scopes),
                        Err(e) => tracing::warn!(
                            "Silent refresh failed, falling back to interactive: {}",
                            e
                        ),
                    }
                }
                self.cache.remove(&account.id, scopes)?;
            }
        }

        tracing::info!("No usable cached token; starting interactive acquisition");
        let interactive = self.provider.acquire_token_interactive(config, scopes);
        let token = self.cancellable(ticket, interactive).await??;
        self.commit(token, scopes)
    }

    /// Upsert the account and token record produced by the provider.
    fn commit(&self, token: ProviderToken, scopes: &ScopeSet) -> BridgeResult<Acquired> {
        let mut account = token.account;
        if account.id.is_empty() {
            return Err(BridgeError::Internal(
                "provider returned a token without an account id".into(),
            ));
        }
        account.last_authenticated = self.clock.now();

        let record = TokenRecord {
            account_id: account.id.clone(),
            access_token: token.access_token,
            expires_at: token.expires_at,
            scopes: scopes.clone(),
            refreshable: token.refreshable,
        };
        self.cache.put(record.clone())?;
        if let Err(e) = self.accounts.set_current(account.clone()) {
            if let Err(rollback) = self.cache.remove(&record.account_id, scopes) {
                tracing::warn!("Failed to roll back cached token: {}", rollback);
            }
            return Err(e.into());
        }

        Ok(Acquired {
            record,
            account,
            from_cache: false,
        })
    }
}

/// What `begin` hands to the flow it admits.
struct Flow {
    config: Arc<AuthConfig>,
    generation: u64,
    ticket: u64,
}

fn transition(m: &mut Machine, next: BridgeState) {
    if m.state != next {
        tracing::info!("Bridge state {:?} -> {:?}", m.state, next);
        m.state = next;
    }
}

/// Resolves the state out of `Authenticating` on every exit path.
struct FlowGuard<'a> {
    machine: &'a Mutex<Machine>,
    generation: u64,
    resolved: bool,
}

impl FlowGuard<'_> {
    fn resolve(&mut self, next: BridgeState) {
        self.resolved = true;
        let mut m = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        if m.generation != self.generation {
            tracing::debug!("Configuration changed during flow; leaving state {:?}", m.state);
            return;
        }
        if m.state == BridgeState::Authenticating {
            transition(&mut m, next);
        }
    }
}

impl Drop for FlowGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            tracing::warn!("Acquisition abandoned before completion");
            self.resolve(BridgeState::Failed);
        }
    }
}
