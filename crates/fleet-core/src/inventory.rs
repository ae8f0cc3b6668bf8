//! Provider inventory declared next to the clusters.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Available providers, keyed by the name clusters refer to.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Inventory {
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
}

/// One provider entry. `kind` selects the implementation; every other key
/// is passed through to it untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderConfig {
    pub kind: String,
    #[serde(flatten)]
    pub params: BTreeMap<String, toml::Value>,
}

impl Inventory {
    pub fn get_provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }
}

impl ProviderConfig {
    /// A string parameter, if set.
    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(toml::Value::as_str)
    }
}
