//! ID token claims
//!
//! The ID token arrives straight from the token endpoint over TLS, so only
//! the payload is decoded here; the signature is not re-verified.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::provider::ProviderFailure;
use super::tokens::Account;

#[derive(Debug, Default, Deserialize)]
pub struct IdTokenClaims {
    pub oid: Option<String>,
    pub sub: Option<String>,
    pub tid: Option<String>,
    pub name: Option<String>,
    pub preferred_username: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl IdTokenClaims {
    pub fn decode(id_token: &str) -> Result<Self, ProviderFailure> {
        let payload = id_token
            .split('.')
            .nth(1)
            .ok_or_else(|| {
                ProviderFailure::rejected("token_parsing_error", "ID token is not a JWT")
            })?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| ProviderFailure::rejected("token_parsing_error", e.to_string()))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| ProviderFailure::rejected("token_parsing_error", e.to_string()))
    }

    /// `<object id>.<tenant id>`, falling back to `sub` for the object id.
    pub fn account_id(&self) -> Option<String> {
        let object = self.oid.as_deref().or(self.sub.as_deref())?;
        Some(match &self.tid {
            Some(tid) => format!("{}.{}", object, tid),
            None => object.to_string(),
        })
    }

    pub fn into_account(self, now: DateTime<Utc>) -> Option<Account> {
        let id = self.account_id()?;
        Some(Account {
            id,
            display_name: self.name,
            username: self.preferred_username,
            tenant_id: self.tid,
            roles: self.roles,
            last_authenticated: now,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt(claims: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
        let body = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{}.{}.sig", header, body)
    }

    #[test]
    fn test_decode_azure_claims() {
        let token = jwt(serde_json::json!({
            "oid": "00000000-0000-0000-0000-000000000001",
            "sub": "ignored-when-oid-present",
            "tid": "contoso",
            "name": "Ada Lovelace",
            "preferred_username": "ada@contoso.com",
            "roles": ["Task.Read", "Task.Write"]
        }));
        let claims = IdTokenClaims::decode(&token).unwrap();
        assert_eq!(
            claims.account_id().unwrap(),
            "00000000-0000-0000-0000-000000000001.contoso"
        );

        let account = claims.into_account(Utc::now()).unwrap();
        assert_eq!(account.display_name.as_deref(), Some("Ada Lovelace"));
        assert_eq!(account.username.as_deref(), Some("ada@contoso.com"));
        assert_eq!(account.roles, vec!["Task.Read", "Task.Write"]);
    }

    #[test]
    fn test_sub_without_tenant() {
        let claims = IdTokenClaims::decode(&jwt(serde_json::json!({ "sub": "abc" }))).unwrap();
        assert_eq!(claims.account_id().unwrap(), "abc");
        assert!(claims.roles.is_empty());
    }

    #[test]
    fn test_no_subject_means_no_account() {
        let claims = IdTokenClaims::decode(&jwt(serde_json::json!({ "name": "x" }))).unwrap();
        assert!(claims.into_account(Utc::now()).is_none());
    }

    #[test]
    fn test_garbage_rejected() {
        for bad in ["", "nodots", "a.!!!.c"] {
            match IdTokenClaims::decode(bad) {
                Err(ProviderFailure::Rejected { code, .. }) => {
                    assert_eq!(code, "token_parsing_error")
                }
                other => panic!("expected parse failure for {:?}, got {:?}", bad, other),
            }
        }
    }
}
