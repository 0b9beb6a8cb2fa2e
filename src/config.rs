use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::Deserialize;

use crate::site::SiteSettings;

pub struct PibConfig {
    pub site: SiteSettings,
    pub state_dir: Option<PathBuf>,
    pub jobs: Option<usize>,
}

impl PibConfig {
    /// Reads the optional site file, then the `PIB_*` environment on top of it.
    pub fn load(site_file: Option<&Path>) -> anyhow::Result<Self> {
        let raw_config = RawConfig::load(site_file, None)?;

        Ok(Self {
            site: raw_config.site,
            state_dir: raw_config.state.dir,
            jobs: raw_config.build.jobs,
        })
    }
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct RawConfig {
    #[serde(default)]
    site: SiteSettings,
    #[serde(default)]
    state: StateConfig,
    #[serde(default)]
    build: BuildConfig,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct StateConfig {
    dir: Option<PathBuf>,
}

#[derive(Default, Debug, Deserialize, PartialEq, Eq)]
struct BuildConfig {
    jobs: Option<usize>,
}

impl RawConfig {
    fn load(
        site_file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = site_file {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }
        builder
            .add_source(
                Environment::with_prefix("PIB")
                    .separator("_")
                    .try_parsing(true)
                    .source(env),
            )
            .build()?
            .try_deserialize()
    }
}
