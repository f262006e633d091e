use std::{collections::HashMap, path::PathBuf};

use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::model::hosted::Protocol;

#[derive(Default)]
pub struct PkgfetchConfig {
    pub cache_dir: Option<PathBuf>,
    pub git_protocol: Option<Protocol>,
    pub registry_url: Option<String>,
    pub npm_bin: Option<PathBuf>,
}

impl PkgfetchConfig {
    pub fn load() -> anyhow::Result<Self> {
        let raw_config = RawConfig::load(None)?;

        Ok(Self {
            cache_dir: raw_config.cache.dir,
            git_protocol: raw_config.git.protocol,
            registry_url: raw_config.registry.url,
            npm_bin: raw_config.npm.bin,
        })
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    cache: CacheConfig,
    #[serde(default)]
    git: GitConfig,
    #[serde(default)]
    registry: RegistryConfig,
    #[serde(default)]
    npm: NpmConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct CacheConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct GitConfig {
    protocol: Option<Protocol>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RegistryConfig {
    url: Option<String>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct NpmConfig {
    bin: Option<PathBuf>,
}

impl RawConfig {
    fn load(env: Option<HashMap<String, String>>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(
                Environment::with_prefix("PKGFETCH")
                    .separator("_")
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}
