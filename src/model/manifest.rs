use std::{collections::BTreeMap, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::model::ParseError;

pub const PACKAGE_JSON: &str = "package.json";

/// Lifecycle scripts that require dependencies to be installed before packing.
const PREPARE_SCRIPTS: [&str; 5] = ["preinstall", "install", "postinstall", "prepare", "build"];

/// A `package.json`, optionally decorated with resolution metadata.
///
/// Unknown fields are kept verbatim so the manifest round-trips.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Kept as raw json: only the presence of a script name matters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub scripts: Map<String, Value>,
    #[serde(rename = "_integrity", skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(rename = "_resolved", skip_serializing_if = "Option::is_none")]
    pub resolved: Option<String>,
    #[serde(rename = "_from", skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Manifest {
    pub fn parse(data: &str) -> Result<Manifest, ParseError> {
        Ok(serde_json::from_str(data)?)
    }

    pub fn from_file(path: &Path) -> Result<Manifest, ParseError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Reads `package.json` from a package directory.
    pub fn from_dir(dir: &Path) -> Result<Manifest, ParseError> {
        Self::from_file(&dir.join(PACKAGE_JSON))
    }

    pub fn has_install_scripts(&self) -> bool {
        PREPARE_SCRIPTS
            .iter()
            .any(|script| self.scripts.contains_key(*script))
    }

    /// Attaches resolution metadata. `None` leaves a field absent.
    pub fn decorate(
        mut self,
        integrity: Option<String>,
        resolved: Option<String>,
        from: Option<String>,
    ) -> Manifest {
        self.integrity = integrity;
        self.resolved = resolved;
        self.from = from;
        self
    }

    /// The `dist` object registries attach to published manifests.
    pub fn dist(&self) -> Option<Dist> {
        self.rest
            .get("dist")
            .and_then(|dist| serde_json::from_value(dist.clone()).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dist {
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
}

/// Full version listing of a package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Packument {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, Manifest>,
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

impl Packument {
    /// A single-version document for sources that only ever have one version.
    pub fn from_manifest(manifest: Manifest, default_tag: &str) -> Packument {
        let version = manifest.version.clone().unwrap_or_default();
        let mut manifest = manifest;
        if let Some(tarball) = &manifest.resolved {
            let mut dist = Map::new();
            dist.insert("tarball".to_owned(), Value::String(tarball.clone()));
            if let Some(integrity) = &manifest.integrity {
                dist.insert("integrity".to_owned(), Value::String(integrity.clone()));
            }
            manifest.rest.insert("dist".to_owned(), Value::Object(dist));
        }
        Packument {
            name: manifest.name.clone().unwrap_or_default(),
            dist_tags: BTreeMap::from([(default_tag.to_owned(), version.clone())]),
            versions: BTreeMap::from([(version, manifest)]),
            rest: Map::new(),
        }
    }
}
