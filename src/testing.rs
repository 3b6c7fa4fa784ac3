//! Test doubles: a scripted provider, a manual clock and a store that can be
//! made to fail

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use crate::auth::provider::{IdentityProvider, ProviderFailure, ProviderToken};
use crate::auth::tokens::{AccessToken, Account, ScopeSet};
use crate::auth::{AuthConfig, Clock};
use crate::storage::{MemoryStore, SecureStore, StorageError, StorageResult};

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new() -> Arc<Self> {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        Arc::new(Self {
            now: Mutex::new(start),
        })
    }

    pub fn advance(&self, secs: i64) {
        let mut now = self.now.lock().unwrap();
        *now = *now + Duration::seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

/// In-memory store whose writes fail while `failing` is set.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    failing: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StorageResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "disk full",
            )));
        }
        Ok(())
    }
}

impl SecureStore for FlakyStore {
    fn load(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.load(key)
    }

    fn store(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.check()?;
        self.inner.store(key, value)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.check()?;
        self.inner.delete(key)
    }
}

/// What the fake provider does on its next call.
pub enum Step {
    Token {
        access_token: &'static str,
        ttl_secs: i64,
        refreshable: bool,
        account_id: &'static str,
    },
    Fail(ProviderFailure),
    /// Never completes; only cancellation or dropping ends the call.
    Hang,
    Panic,
}

pub fn token(access_token: &'static str, ttl_secs: i64) -> Step {
    Step::Token {
        access_token,
        ttl_secs,
        refreshable: true,
        account_id: "u1",
    }
}

pub struct FakeProvider {
    clock: Arc<ManualClock>,
    interactive: Mutex<VecDeque<Step>>,
    silent: Mutex<VecDeque<Step>>,
    pub interactive_calls: AtomicUsize,
    pub silent_calls: AtomicUsize,
    pub signed_out: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn new(clock: Arc<ManualClock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            interactive: Mutex::new(VecDeque::new()),
            silent: Mutex::new(VecDeque::new()),
            interactive_calls: AtomicUsize::new(0),
            silent_calls: AtomicUsize::new(0),
            signed_out: Mutex::new(Vec::new()),
        })
    }

    pub fn push_interactive(&self, step: Step) {
        self.interactive.lock().unwrap().push_back(step);
    }

    pub fn push_silent(&self, step: Step) {
        self.silent.lock().unwrap().push_back(step);
    }

    pub fn interactive_calls(&self) -> usize {
        self.interactive_calls.load(Ordering::SeqCst)
    }

    pub fn silent_calls(&self) -> usize {
        self.silent_calls.load(Ordering::SeqCst)
    }

    async fn play(&self, step: Option<Step>) -> Result<ProviderToken, ProviderFailure> {
        match step {
            Some(Step::Token {
                access_token,
                ttl_secs,
                refreshable,
                account_id,
            }) => {
                let now = self.clock.now();
                Ok(ProviderToken {
                    access_token: AccessToken::new(access_token),
                    expires_at: now + Duration::seconds(ttl_secs),
                    refreshable,
                    account: Account {
                        id: account_id.to_string(),
                        display_name: Some("Test User".into()),
                        username: Some("user@example.com".into()),
                        tenant_id: Some("tenant".into()),
                        roles: vec!["Reader".into()],
                        last_authenticated: now,
                    },
                })
            }
            Some(Step::Fail(failure)) => Err(failure),
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Panic) => panic!("provider blew up"),
            None => Err(ProviderFailure::rejected("unscripted", "no step queued")),
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn acquire_token_silent(
        &self,
        _config: &AuthConfig,
        _account: &Account,
        _scopes: &ScopeSet,
    ) -> Result<ProviderToken, ProviderFailure> {
        self.silent_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.silent.lock().unwrap().pop_front();
        self.play(step).await
    }

    async fn acquire_token_interactive(
        &self,
        _config: &AuthConfig,
        _scopes: &ScopeSet,
    ) -> Result<ProviderToken, ProviderFailure> {
        self.interactive_calls.fetch_add(1, Ordering::SeqCst);
        let step = self.interactive.lock().unwrap().pop_front();
        self.play(step).await
    }

    async fn sign_out(&self, account: &Account) -> Result<(), ProviderFailure> {
        self.signed_out.lock().unwrap().push(account.id.clone());
        Ok(())
    }
}
