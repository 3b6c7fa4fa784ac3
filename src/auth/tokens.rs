//! Token and account records

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized, ordered set of scopes.
///
/// Scopes are trimmed and lowercased; blanks are dropped. Two requests that
/// differ only in order, case or whitespace share one cache key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeSet(BTreeSet<String>);

impl ScopeSet {
    pub fn new<I, S>(scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            scopes
                .into_iter()
                .map(|s| s.as_ref().trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    /// True when every scope in `other` is also in `self`.
    pub fn covers(&self, other: &ScopeSet) -> bool {
        self.0.is_superset(&other.0)
    }

    pub fn to_vec(&self) -> Vec<String> {
        self.0.iter().cloned().collect()
    }
}

impl<S: AsRef<str>> FromIterator<S> for ScopeSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::new(iter)
    }
}

impl fmt::Display for ScopeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<&str> = self.iter().collect();
        f.write_str(&joined.join(" "))
    }
}

/// Opaque bearer token. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken([redacted])")
    }
}

/// Cached access token for one (account, scope set) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub account_id: String,
    pub access_token: AccessToken,
    pub expires_at: DateTime<Utc>,
    pub scopes: ScopeSet,
    /// Whether the provider holds a refresh grant for this record's account.
    pub refreshable: bool,
}

impl TokenRecord {
    /// Expired at `now` (inclusive): a token is never valid at its expiry instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Signed-in identity as reported by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// Provider-issued `<object id>.<tenant id>` pair.
    pub id: String,
    pub display_name: Option<String>,
    pub username: Option<String>,
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    pub last_authenticated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_scope_set_normalizes() {
        let a = ScopeSet::new(["User.Read ", "", "openid"]);
        let b = ScopeSet::new(["openid", "user.read"]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a.to_string(), "openid user.read");
    }

    #[test]
    fn test_scope_set_covers() {
        let wide = ScopeSet::new(["read", "write"]);
        let narrow = ScopeSet::new(["read"]);
        assert!(wide.covers(&narrow));
        assert!(!narrow.covers(&wide));
        assert!(narrow.covers(&ScopeSet::default()));
    }

    #[test]
    fn test_access_token_debug_redacted() {
        let token = AccessToken::new("eyJ0eXAiOiJKV1Qi");
        let printed = format!("{:?}", token);
        assert!(!printed.contains("eyJ0"));
        assert_eq!(token.secret(), "eyJ0eXAiOiJKV1Qi");
    }

    #[test]
    fn test_record_expiry_is_inclusive() {
        let now = Utc::now();
        let record = TokenRecord {
            account_id: "u1".into(),
            access_token: AccessToken::new("T1"),
            expires_at: now + Duration::seconds(10),
            scopes: ScopeSet::new(["read"]),
            refreshable: false,
        };
        assert!(!record.is_expired_at(now));
        assert!(record.is_expired_at(now + Duration::seconds(10)));
        assert!(record.is_expired_at(now + Duration::seconds(11)));
    }
}
