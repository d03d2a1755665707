//! Checks applied to proposed configuration before it's stored.

use serde_json::Value;
use std::collections::HashSet;

/// Validates configuration payloads before they're persisted.  A rejected payload is never
/// stored and never triggers a restart.
pub trait ConfigValidator: Send + Sync {
    /// Returns a description of the problem if the authentication config can't be applied.
    fn validate_auth(&self, config: &Value) -> std::result::Result<(), String>;
}

/// Structural checks on the authentication config: it must be an object, and any `providers`
/// must be a list of objects with unique, non-empty string IDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AuthConfigValidator;

impl ConfigValidator for AuthConfigValidator {
    fn validate_auth(&self, config: &Value) -> std::result::Result<(), String> {
        let object = config
            .as_object()
            .ok_or_else(|| "auth config must be a JSON object".to_string())?;

        let providers = match object.get("providers") {
            None => return Ok(()),
            Some(Value::Array(providers)) => providers,
            Some(_) => return Err("'providers' must be a list".to_string()),
        };

        let mut seen = HashSet::new();
        for (i, provider) in providers.iter().enumerate() {
            let id = provider
                .get("id")
                .and_then(Value::as_str)
                .filter(|id| !id.is_empty())
                .ok_or_else(|| format!("provider {} has no 'id'", i))?;
            if !seen.insert(id) {
                return Err(format!("provider id '{}' is used more than once", id));
            }
        }
        Ok(())
    }
}
