//! Current-account tracking (single account per bridge)

use std::sync::{Arc, RwLock};

use super::tokens::Account;
use crate::storage::{load_json, store_json, SecureStore, StorageResult};

const ACCOUNT_KEY: &str = "current_account";

pub struct AccountStore {
    current: RwLock<Option<Account>>,
    store: Arc<dyn SecureStore>,
}

impl AccountStore {
    pub fn open(store: Arc<dyn SecureStore>) -> StorageResult<Self> {
        let current: Option<Account> = load_json(store.as_ref(), ACCOUNT_KEY)?;
        if let Some(account) = &current {
            tracing::debug!("Restored current account {}", account.id);
        }
        Ok(Self {
            current: RwLock::new(current),
            store,
        })
    }

    /// Replace the current account (any previous one is forgotten).
    pub fn set_current(&self, account: Account) -> StorageResult<()> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        store_json(self.store.as_ref(), ACCOUNT_KEY, &account)?;
        *guard = Some(account);
        Ok(())
    }

    pub fn current(&self) -> Option<Account> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Forget the current account. Returns the account that was removed.
    pub fn clear(&self) -> StorageResult<Option<Account>> {
        let mut guard = self.current.write().unwrap_or_else(|e| e.into_inner());
        self.store.delete(ACCOUNT_KEY)?;
        Ok(guard.take())
    }
}
