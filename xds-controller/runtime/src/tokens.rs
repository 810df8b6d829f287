use ahash::AHashMap as HashMap;
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Deserialize;
use std::sync::Arc;
use xds_controller_core::{AllowAll, Authorizer, AuthzError, ResolveAuthorizer};

/// Resolves stream tokens against a table loaded from a file.
///
/// Until a table is loaded, every credential (including none) is allowed.
#[derive(Clone, Debug, Default)]
pub struct TokenTable(Arc<RwLock<Option<HashMap<String, Arc<ServiceAcl>>>>>);

/// The services a token may write. `*` grants every service.
#[derive(Debug, PartialEq, Eq)]
pub struct ServiceAcl {
    services: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenFile {
    tokens: Vec<TokenEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TokenEntry {
    secret: String,
    #[serde(default)]
    service_write: Vec<String>,
}

// === impl TokenTable ===

impl TokenTable {
    /// Replaces the table with the parsed contents of a token file.
    pub(crate) fn update(&self, bytes: &[u8]) -> Result<()> {
        let TokenFile { tokens } = serde_json::from_slice(bytes).context("invalid token file")?;
        let mut table = HashMap::with_capacity(tokens.len());
        for TokenEntry {
            secret,
            service_write,
        } in tokens
        {
            anyhow::ensure!(!secret.is_empty(), "token secrets must not be empty");
            let acl = Arc::new(ServiceAcl {
                services: service_write,
            });
            anyhow::ensure!(
                table.insert(secret, acl).is_none(),
                "token secrets must be unique"
            );
        }
        *self.0.write() = Some(table);
        Ok(())
    }
}

impl ResolveAuthorizer for TokenTable {
    fn resolve_authorizer(
        &self,
        credential: Option<&str>,
    ) -> Result<Arc<dyn Authorizer>, AuthzError> {
        let table = self.0.read();
        let Some(table) = table.as_ref() else {
            return Ok(Arc::new(AllowAll));
        };
        let acl = credential
            .and_then(|c| table.get(c))
            .ok_or(AuthzError::NotFound)?;
        Ok(acl.clone())
    }
}

// === impl ServiceAcl ===

impl Authorizer for ServiceAcl {
    fn service_write(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == "*" || s == service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_all_without_a_table() {
        let tokens = TokenTable::default();
        let authz = tokens.resolve_authorizer(None).expect("must resolve");
        assert!(authz.service_write("anything"));
    }

    #[test]
    fn resolves_tokens() {
        let tokens = TokenTable::default();
        tokens
            .update(
                br#"{"tokens": [
                    {"secret": "web-token", "service_write": ["web"]},
                    {"secret": "operator", "service_write": ["*"]}
                ]}"#,
            )
            .expect("must load");

        let web = tokens
            .resolve_authorizer(Some("web-token"))
            .expect("must resolve");
        assert!(web.service_write("web"));
        assert!(!web.service_write("api"));

        let operator = tokens
            .resolve_authorizer(Some("operator"))
            .expect("must resolve");
        assert!(operator.service_write("api"));

        assert_eq!(
            tokens.resolve_authorizer(Some("bogus")).err(),
            Some(AuthzError::NotFound)
        );
        assert_eq!(
            tokens.resolve_authorizer(None).err(),
            Some(AuthzError::NotFound)
        );
    }

    #[test]
    fn keeps_table_on_invalid_update() {
        let tokens = TokenTable::default();
        tokens
            .update(br#"{"tokens": [{"secret": "web-token", "service_write": ["web"]}]}"#)
            .expect("must load");
        assert!(tokens
            .update(br#"{"tokens": [{"secret": "a"}, {"secret": "a"}]}"#)
            .is_err());
        assert!(tokens.resolve_authorizer(Some("web-token")).is_ok());

        tokens.update(br#"{"tokens": []}"#).expect("must load");
        assert!(tokens.resolve_authorizer(Some("web-token")).is_err());
    }
}
