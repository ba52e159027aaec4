//! API-Key Permission Checks
//!
//! The thin authorization capability the API consumes: a table of API keys
//! from configuration, each carrying a permission set. Sessions, login
//! flows and CORS live outside the core.
//!
//! An empty key table disables authentication entirely, which is the
//! development default; production deployments configure `[[api.keys]]`.

use std::collections::{BTreeSet, HashMap};

use axum::http::HeaderMap;

use crate::api::error::ApiError;
use crate::config::ApiSection;

/// Permissions an API key can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    /// Parse a configuration name
    pub fn parse(name: &str) -> Option<Permission> {
        match name {
            "read" => Some(Permission::Read),
            "write" => Some(Permission::Write),
            "admin" => Some(Permission::Admin),
            _ => None,
        }
    }
}

/// Key → permission-set table
#[derive(Debug, Default)]
pub struct AuthProvider {
    keys: HashMap<String, BTreeSet<Permission>>,
}

impl AuthProvider {
    /// Build the table from the `[api]` section; unrecognized permission
    /// names are ignored.
    pub fn from_config(section: &ApiSection) -> Self {
        let mut keys = HashMap::new();
        for entry in &section.keys {
            let permissions: BTreeSet<Permission> = entry
                .permissions
                .iter()
                .filter_map(|name| Permission::parse(name))
                .collect();
            keys.insert(entry.key.clone(), permissions);
        }
        AuthProvider { keys }
    }

    /// Whether authentication is enforced
    pub fn enforced(&self) -> bool {
        !self.keys.is_empty()
    }

    /// Check the request's `X-API-Key` against the required permission
    pub fn authorize(&self, headers: &HeaderMap, required: Permission) -> Result<(), ApiError> {
        if !self.enforced() {
            return Ok(());
        }

        let presented = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing API key".to_string()))?;

        let permissions = self
            .keys
            .get(presented)
            .ok_or_else(|| ApiError::Unauthorized("unknown API key".to_string()))?;

        if permissions.contains(&required) {
            Ok(())
        } else {
            Err(ApiError::Forbidden(format!(
                "permission {:?} required",
                required
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ApiKeyConfig;

    fn provider() -> AuthProvider {
        AuthProvider::from_config(&ApiSection {
            bind: "127.0.0.1:0".to_string(),
            keys: vec![
                ApiKeyConfig {
                    key: "reader".to_string(),
                    permissions: vec!["read".to_string()],
                },
                ApiKeyConfig {
                    key: "operator".to_string(),
                    permissions: vec!["read".to_string(), "admin".to_string()],
                },
            ],
        })
    }

    fn headers(key: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(key) = key {
            headers.insert("x-api-key", key.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_missing_key_is_unauthorized() {
        let auth = provider();
        assert!(matches!(
            auth.authorize(&headers(None), Permission::Read),
            Err(ApiError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_permission_enforcement() {
        let auth = provider();
        assert!(auth
            .authorize(&headers(Some("reader")), Permission::Read)
            .is_ok());
        assert!(matches!(
            auth.authorize(&headers(Some("reader")), Permission::Admin),
            Err(ApiError::Forbidden(_))
        ));
        assert!(auth
            .authorize(&headers(Some("operator")), Permission::Admin)
            .is_ok());
    }

    #[test]
    fn test_empty_table_allows_all() {
        let auth = AuthProvider::default();
        assert!(auth.authorize(&headers(None), Permission::Admin).is_ok());
    }
}
