//! The controller module maps between the config store and the API interface, similar to the
//! controller in the MVC model.

use log::info;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};

use crate::server::config::ConfigName;
use crate::server::error::{self, Result};
use crate::server::validation::ConfigValidator;
use datastore::{ConfigRecord, ConfigStore};

/// Returns the stored payload for the given config, unchanged.
pub(crate) fn get_config<D>(datastore: &D, name: ConfigName) -> Result<Vec<u8>>
where
    D: ConfigStore,
{
    let record = datastore
        .get_config(name.as_str())
        .context(error::DataStoreSnafu { op: "get_config" })?
        .context(error::ConfigNotFoundSnafu {
            name: name.as_str(),
        })?;
    Ok(record.payload)
}

/// Validates and stores a new payload for the given config, fully replacing the old one.
/// Nothing is written if validation fails.
pub(crate) fn update_config<D, V>(
    datastore: &mut D,
    validator: &V,
    name: ConfigName,
    payload: &Value,
) -> Result<()>
where
    D: ConfigStore,
    V: ConfigValidator + ?Sized,
{
    match name {
        ConfigName::Auth => update_auth_config(datastore, validator, payload),
    }
}

fn update_auth_config<D, V>(datastore: &mut D, validator: &V, payload: &Value) -> Result<()>
where
    D: ConfigStore,
    V: ConfigValidator + ?Sized,
{
    let name = ConfigName::Auth.as_str();
    // An absent auth config is treated as empty rather than an error; the new payload replaces
    // it either way, so nothing needs to be created up front.
    let existing = datastore
        .get_config(name)
        .context(error::DataStoreSnafu { op: "get_config" })?;

    if let Err(reason) = validator.validate_auth(payload) {
        return error::ConfigValidationSnafu { name, reason }.fail();
    }

    let bytes = serde_json::to_vec(payload).context(error::ConfigSerializeSnafu { name })?;
    datastore
        .upsert_config(&ConfigRecord::new(name, bytes))
        .context(error::DataStoreSnafu { op: "upsert_config" })?;
    info!(
        "{} {}",
        if existing.is_some() { "Replaced" } else { "Created" },
        name
    );
    Ok(())
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=
