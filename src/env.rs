//! Environment variable substitution for configuration values
//!
//! Mount parameters may reference secrets as `${VAR_NAME}` instead of
//! storing them in the config file.

use std::collections::BTreeSet;
use std::env;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::backend::ConnectionParams;
use crate::config::ConfigError;

/// Matches `${VAR_NAME}` references
static ENV_VAR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// Substitute environment variable references in a string.
///
/// Returns an error listing every referenced variable that is not set.
///
/// ```ignore
/// use remotefs::env::substitute_env_vars;
///
/// std::env::set_var("FTP_PASSWORD", "hunter2");
/// assert_eq!(substitute_env_vars("${FTP_PASSWORD}").unwrap(), "hunter2");
/// ```
pub fn substitute_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing = BTreeSet::new();

    let result = ENV_VAR_PATTERN.replace_all(input, |caps: &Captures| {
        let name = &caps[1];
        env::var(name).unwrap_or_else(|_| {
            missing.insert(name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        return Err(ConfigError::ValidationError(format!(
            "Missing environment variables: {}",
            missing.into_iter().collect::<Vec<_>>().join(", ")
        )));
    }

    Ok(result.into_owned())
}

/// Substitute references in every parameter value
pub fn substitute_params(params: ConnectionParams) -> Result<ConnectionParams, ConfigError> {
    params.try_map_values(substitute_env_vars)
}
