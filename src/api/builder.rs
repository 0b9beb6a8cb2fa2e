use std::{error::Error, path::PathBuf};

use home::home_dir;

use crate::{config::PibConfig, executor::RunOptions, model::ModuleName, site::SiteSettings, Pib};

#[derive(Default)]
pub struct PibBuilder {
    spec_files: Vec<PathBuf>,
    site_file: Option<PathBuf>,
    site: Option<SiteSettings>,
    state_directory_path: Option<PathBuf>,
    jobs: Option<usize>,
    stop_on_failure: bool,
    only: Vec<ModuleName>,
    exclude: Vec<ModuleName>,
}

impl PibBuilder {
    /// Module specification files, in override order.
    pub fn spec_files(mut self, paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        self.spec_files = paths.into_iter().map(Into::into).collect();
        self
    }

    /// TOML file with `[site]`, `[state]` and `[build]` settings.
    /// `PIB_*` environment variables take precedence over it.
    pub fn site_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.site_file = Some(path.into());
        self
    }

    /// Site conventions to use instead of the site file and environment.
    pub fn site(mut self, settings: SiteSettings) -> Self {
        self.site = Some(settings);
        self
    }

    /// Location of the completion state.
    ///
    /// Defaults to `$HOME/.pib/state`.
    pub fn state_directory(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_directory_path = Some(path.into());
        self
    }

    /// Number of steps run at the same time.
    ///
    /// Defaults to 1.
    pub fn jobs(mut self, jobs: usize) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    /// Restricts runs and plans to these modules.
    pub fn only(mut self, modules: impl IntoIterator<Item = impl Into<ModuleName>>) -> Self {
        self.only = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude(mut self, modules: impl IntoIterator<Item = impl Into<ModuleName>>) -> Self {
        self.exclude = modules.into_iter().map(Into::into).collect();
        self
    }

    pub fn try_build(self) -> Result<Pib, Box<dyn Error>> {
        let Self {
            spec_files,
            site_file,
            site,
            state_directory_path,
            jobs,
            stop_on_failure,
            only,
            exclude,
        } = self;

        let config = PibConfig::load(site_file.as_deref())?;

        let state_directory = match state_directory_path.or(config.state_dir) {
            Some(path) => path,
            None => default_state_directory()?,
        };

        Ok(Pib {
            spec_files,
            site: site.unwrap_or(config.site),
            state_directory,
            options: RunOptions {
                jobs: jobs.or(config.jobs).unwrap_or(1),
                stop_on_failure,
            },
            only,
            exclude,
        })
    }
}

fn default_state_directory() -> Result<PathBuf, Box<dyn Error>> {
    let mut state_directory =
        home_dir().ok_or("Could not find home dir. Please define $HOME env variable.")?;
    state_directory.push(".pib/state");
    Ok(state_directory)
}
