//! Runtime configuration records the server knows how to apply.

use crate::server::error::{self, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;
use std::fmt;
use std::str::FromStr;

/// Name under which the authentication configuration is stored.
pub(crate) const AUTH_CONFIG: &str = "auth_config";

/// The fixed set of configuration records that can be read and updated through the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConfigName {
    Auth,
}

impl ConfigName {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            ConfigName::Auth => AUTH_CONFIG,
        }
    }
}

impl FromStr for ConfigName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            AUTH_CONFIG => Ok(ConfigName::Auth),
            _ => error::ConfigNameSnafu { name: s }.fail(),
        }
    }
}

impl fmt::Display for ConfigName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Authentication configuration as loaded when storage is opened.  Provider entries are kept as
/// raw JSON; only their IDs matter here.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct AuthConfig {
    #[serde(default)]
    pub(crate) providers: Vec<Value>,
}

impl AuthConfig {
    /// Parses a stored payload.  A missing record means no providers are configured.
    pub(crate) fn from_payload(payload: Option<&[u8]>) -> Result<Self> {
        match payload {
            Some(bytes) => serde_json::from_slice(bytes).context(error::AuthConfigParseSnafu),
            None => Ok(Self::default()),
        }
    }

    pub(crate) fn provider_ids(&self) -> Vec<String> {
        self.providers
            .iter()
            .filter_map(|p| p.get("id").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }
}
