use std::path::{Path, PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use ethid_core::ClaimFormat;

/// One identity type namespace backed by its own contract.
#[derive(Debug, Clone, Deserialize)]
pub struct IdentityTypeSettings {
    /// Namespace name, e.g. "Coinbase" or "Twitter".
    pub name: String,

    /// Shape claim values must have for this namespace.
    pub claim_format: ClaimFormat,

    /// Path to the contract source compiled at attach time.
    pub contract_source: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Node endpoint the process trusts. Unused in dev mode.
    #[serde(default = "default_node_uri")]
    pub node_uri: String,

    #[serde(default = "default_gas_limit")]
    pub gas_limit: u64,

    #[serde(default)]
    pub identity_types: Vec<IdentityTypeSettings>,
}

fn default_node_uri() -> String {
    "http://localhost:8545".into()
}

fn default_gas_limit() -> u64 {
    1_000_000
}

impl Settings {
    /// Load from the given file (optional) with `ETHID_`-prefixed
    /// environment variables taking precedence.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(Environment::with_prefix("ETHID").separator("__"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let settings = Settings::load(Path::new("/nonexistent/ethid.toml")).unwrap();
        assert_eq!(settings.node_uri, "http://localhost:8545");
        assert_eq!(settings.gas_limit, 1_000_000);
        assert!(settings.identity_types.is_empty());
    }
}
