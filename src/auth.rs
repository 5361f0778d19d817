use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use axum::http::{HeaderMap, header};

use crate::service::ServiceError;

/// Identity behind an accepted bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user: String,
}

/// Lookup of opaque bearer tokens. Issuance and rotation live elsewhere.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// `Ok(None)` for an unknown token.
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>, ServiceError>;
}

/// Fixed token → user map, loaded once at startup.
#[derive(Debug, Default)]
pub struct StaticTokenStore {
    tokens: HashMap<String, String>,
}

impl StaticTokenStore {
    pub fn new(tokens: HashMap<String, String>) -> Self {
        Self { tokens }
    }

    /// Load a JSON object of `{"<token>": "<user>"}`.
    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let tokens: HashMap<String, String> = serde_json::from_str(&raw)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        Ok(Self::new(tokens))
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenStore for StaticTokenStore {
    async fn authenticate(&self, token: &str) -> Result<Option<Principal>, ServiceError> {
        Ok(self.tokens.get(token).map(|user| Principal { user: user.clone() }))
    }
}

/// Token from `Authorization: Bearer <token>`; the scheme is case-insensitive.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        h
    }

    #[test]
    fn bearer_extraction() {
        assert_eq!(bearer_token(&headers("Bearer abc123")), Some("abc123"));
        assert_eq!(bearer_token(&headers("bearer   abc123 ")), Some("abc123"));
        assert_eq!(bearer_token(&headers("Basic dXNlcjpwYXNz")), None);
        assert_eq!(bearer_token(&headers("Bearer ")), None);
        assert_eq!(bearer_token(&headers("Bearer")), None);
        assert_eq!(bearer_token(&HeaderMap::new()), None);
    }

    #[tokio::test]
    async fn static_store_lookup() {
        let store = StaticTokenStore::new(HashMap::from([("t-1".to_string(), "alice".to_string())]));
        assert_eq!(
            store.authenticate("t-1").await.unwrap(),
            Some(Principal { user: "alice".into() })
        );
        assert_eq!(store.authenticate("t-2").await.unwrap(), None);
        assert_eq!(store.authenticate("").await.unwrap(), None);
    }

    #[test]
    fn static_store_from_file() {
        let dir = std::env::temp_dir().join("envbook_test_auth");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("tokens.json");
        std::fs::write(&path, r#"{"secret-a": "alice", "secret-b": "bob"}"#).unwrap();
        let store = StaticTokenStore::from_file(&path).unwrap();
        assert_eq!(store.len(), 2);

        std::fs::write(&path, "[1, 2, 3]").unwrap();
        assert!(StaticTokenStore::from_file(&path).is_err());
        let _ = std::fs::remove_file(&path);
    }
}
