//! Declarative manifest documents.
//!
//! A manifest bundles service, secret, and volume specifications into one
//! document. Applying a manifest is an upsert: create if absent, update if a
//! record with the same name exists. Unknown fields are rejected at parse.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ServiceSpec;

/// A full manifest document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub services: Vec<ServiceSpec>,
    #[serde(default)]
    pub secrets: Vec<SecretManifest>,
    #[serde(default)]
    pub volumes: Vec<VolumeManifest>,
}

impl Manifest {
    pub fn is_empty(&self) -> bool {
        self.services.is_empty() && self.secrets.is_empty() && self.volumes.is_empty()
    }
}

/// Secret entry in a manifest. Carries the plaintext value; the manager
/// seals it before anything reaches the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretManifest {
    pub name: String,
    pub value: String,
}

/// Volume entry in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeManifest {
    pub name: String,
    #[serde(default = "default_driver")]
    pub driver: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

fn default_driver() -> String {
    "local".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_rejected() {
        let doc = r#"{"services": [], "replicas": 3}"#;
        let parsed: Result<Manifest, _> = serde_json::from_str(doc);
        assert!(parsed.is_err());
    }

    #[test]
    fn minimal_manifest_parses() {
        let doc = r#"
            [[secrets]]
            name = "token"
            value = "abc"

            [[volumes]]
            name = "db"
        "#;
        let manifest: Manifest = toml::from_str(doc).unwrap();
        assert_eq!(manifest.secrets.len(), 1);
        assert_eq!(manifest.volumes[0].driver, "local");
        assert!(manifest.services.is_empty());
    }

    #[test]
    fn empty_manifest_is_empty() {
        assert!(Manifest::default().is_empty());
    }
}
