use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use log::debug;
use regex_lite::Regex;
use serde::Deserialize;

use crate::model::{
    spec::{GitSource, SourceSpec, EPICS_BASE},
    ModuleName, ParseError, Revision,
};

pub const DEFAULT_SITE_TOP: &str = "/cds/group/pcds/epics";
pub const DEFAULT_GIT_URL_TEMPLATE: &str = "https://github.com/slac-epics/{name}";

/// Site conventions as read from configuration, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SiteSettings {
    pub top: PathBuf,
    pub git_url_template: String,
    pub module_path_regexes: Vec<String>,
    pub base_path_regexes: Vec<String>,
    pub extra_variables: BTreeMap<String, String>,
}

impl Default for SiteSettings {
    fn default() -> Self {
        SiteSettings {
            top: PathBuf::from(DEFAULT_SITE_TOP),
            git_url_template: DEFAULT_GIT_URL_TEMPLATE.to_string(),
            module_path_regexes: Vec::new(),
            base_path_regexes: Vec::new(),
            extra_variables: BTreeMap::new(),
        }
    }
}

/// A module name and tag recovered from an install path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionInfo {
    pub name: ModuleName,
    pub tag: String,
}

/// Where modules live on disk and how their paths encode versions.
#[derive(Debug, Clone)]
pub struct Site {
    top: PathBuf,
    base_version: Option<String>,
    git_url_template: String,
    module_path_patterns: Vec<Regex>,
    base_path_patterns: Vec<Regex>,
    extra_variables: BTreeMap<String, String>,
}

impl Site {
    pub fn new(settings: SiteSettings) -> Result<Site, ParseError> {
        let top_pattern = regex_lite::escape(settings.top.to_string_lossy().trim_end_matches('/'));

        let module_path_regexes = if settings.module_path_regexes.is_empty() {
            vec![format!(
                r"^{top_pattern}/(?P<base>[^/]+)/modules/(?P<name>[^/]+)/(?P<tag>[^/]+)/?$"
            )]
        } else {
            settings.module_path_regexes
        };
        let base_path_regexes = if settings.base_path_regexes.is_empty() {
            vec![format!(r"^{top_pattern}/base/(?P<tag>[^/]+)/?$")]
        } else {
            settings.base_path_regexes
        };

        Ok(Site {
            top: settings.top,
            base_version: None,
            git_url_template: settings.git_url_template,
            module_path_patterns: compile(&module_path_regexes)?,
            base_path_patterns: compile(&base_path_regexes)?,
            extra_variables: settings.extra_variables,
        })
    }

    /// Fixes the epics-base version, which determines the support directory.
    pub fn with_base_version(mut self, version: Option<&Revision>) -> Self {
        self.base_version = version.and_then(|v| v.as_pinned()).map(str::to_string);
        self
    }

    pub fn top(&self) -> &Path {
        &self.top
    }

    pub fn epics_base(&self) -> PathBuf {
        match &self.base_version {
            Some(version) => self.top.join("base").join(version),
            None => self.top.join("base"),
        }
    }

    /// Directory holding every non-base module for the selected epics-base version.
    pub fn support(&self) -> PathBuf {
        match &self.base_version {
            Some(version) => self.top.join(version).join("modules"),
            None => self.top.join("modules"),
        }
    }

    pub fn install_path(
        &self,
        name: &ModuleName,
        version: &Revision,
        source: Option<&SourceSpec>,
        explicit: Option<&Path>,
    ) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        if let Some(SourceSpec::Local { path }) = source {
            return path.clone();
        }
        match (name.as_str(), version.as_pinned()) {
            (EPICS_BASE, Some(tag)) => self.top.join("base").join(tag),
            (EPICS_BASE, None) => self.epics_base(),
            (_, Some(tag)) => self.support().join(name.as_str()).join(directory_tag(tag)),
            (_, None) => self.support().join(name.as_str()),
        }
    }

    /// A git source for a module known only by name and version, from the URL template.
    pub fn derive_source(&self, name: &ModuleName, version: &Revision) -> Option<SourceSpec> {
        let tag = version.as_pinned()?;
        let url = self
            .git_url_template
            .replace("{name}", name.as_str())
            .replace("{tag}", tag);
        Some(SourceSpec::Git(GitSource::new(url, tag)))
    }

    /// Maps an install path back to the module and tag it holds, using the site conventions.
    pub fn version_from_path(&self, path: &str) -> Option<VersionInfo> {
        for pattern in &self.module_path_patterns {
            if let Some(captures) = pattern.captures(path) {
                let (Some(name), Some(tag)) = (captures.name("name"), captures.name("tag")) else {
                    continue;
                };
                debug!("Module version path match {} -> {}", path, name.as_str());
                return Some(VersionInfo {
                    name: ModuleName::new(name.as_str()),
                    tag: tag.as_str().to_string(),
                });
            }
        }
        for pattern in &self.base_path_patterns {
            if let Some(tag) = pattern.captures(path).and_then(|c| c.name("tag")) {
                debug!("Base version path match {} -> {}", path, tag.as_str());
                return Some(VersionInfo {
                    name: ModuleName::new(EPICS_BASE),
                    tag: tag.as_str().to_string(),
                });
            }
        }
        None
    }

    /// Variables written to `RELEASE_SITE` and seeded into RELEASE file expansion.
    pub fn release_variables(&self) -> BTreeMap<String, String> {
        let support = self.support().display().to_string();
        let mut variables = BTreeMap::from([
            ("EPICS_SITE_TOP".to_string(), self.top.display().to_string()),
            (
                "EPICS_BASE".to_string(),
                self.epics_base().display().to_string(),
            ),
            ("EPICS_MODULES".to_string(), support.clone()),
            ("SUPPORT".to_string(), support),
        ]);
        if let Some(version) = &self.base_version {
            variables.insert("BASE_MODULE_VERSION".to_string(), version.clone());
        }
        variables.extend(self.extra_variables.clone());
        variables
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, ParseError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|source| ParseError::InvalidPattern {
                pattern: pattern.clone(),
                source,
            })
        })
        .collect()
}

/// Branch checkouts are tagged `X-branch` but installed under `X`.
fn directory_tag(tag: &str) -> String {
    tag.replace("-branch", "")
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    fn site() -> Site {
        Site::new(SiteSettings::default())
            .unwrap()
            .with_base_version(Some(&Revision::pinned("R7.0.2-2.0")))
    }

    #[test]
    fn install_paths_follow_site_layout() {
        let site = site();
        assert_eq!(
            site.install_path(
                &ModuleName::from("epics-base"),
                &Revision::pinned("R7.0.2-2.0"),
                None,
                None
            ),
            PathBuf::from("/cds/group/pcds/epics/base/R7.0.2-2.0")
        );
        assert_eq!(
            site.install_path(
                &ModuleName::from("asyn"),
                &Revision::pinned("R4.39-branch"),
                None,
                None
            ),
            PathBuf::from("/cds/group/pcds/epics/R7.0.2-2.0/modules/asyn/R4.39")
        );
        assert_eq!(
            site.install_path(
                &ModuleName::from("asyn"),
                &Revision::pinned("R4.39"),
                Some(&SourceSpec::Local {
                    path: PathBuf::from("/src/asyn")
                }),
                None
            ),
            PathBuf::from("/src/asyn")
        );
        assert_eq!(
            site.install_path(
                &ModuleName::from("asyn"),
                &Revision::pinned("R4.39"),
                None,
                Some(Path::new("/opt/asyn"))
            ),
            PathBuf::from("/opt/asyn")
        );
    }

    #[test]
    fn versions_are_recovered_from_paths() {
        let site = site();
        assert_eq!(
            site.version_from_path("/cds/group/pcds/epics/R7.0.2-2.0/modules/asyn/R4.39-1.0.1/"),
            Some(VersionInfo {
                name: ModuleName::from("asyn"),
                tag: "R4.39-1.0.1".to_string()
            })
        );
        assert_eq!(
            site.version_from_path("/cds/group/pcds/epics/base/R7.0.2-2.0"),
            Some(VersionInfo {
                name: ModuleName::from("epics-base"),
                tag: "R7.0.2-2.0".to_string()
            })
        );
        assert_eq!(site.version_from_path("/usr/lib/somewhere"), None);
    }

    #[test]
    fn derived_sources_use_the_url_template() {
        let site = site();
        assert_eq!(
            site.derive_source(&ModuleName::from("motor"), &Revision::pinned("R6")),
            Some(SourceSpec::Git(GitSource::new(
                "https://github.com/slac-epics/motor",
                "R6"
            )))
        );
        assert_eq!(
            site.derive_source(&ModuleName::from("motor"), &Revision::Arbitrary),
            None
        );
    }

    #[test]
    fn invalid_pattern_is_rejected() {
        let settings = SiteSettings {
            module_path_regexes: vec!["(".to_string()],
            ..SiteSettings::default()
        };
        assert!(matches!(
            Site::new(settings),
            Err(ParseError::InvalidPattern { .. })
        ));
    }
}
