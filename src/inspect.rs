use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    path::{Path, PathBuf},
};

use anyhow::{bail, Context};
use log::{debug, info};
use serde::Serialize;

use crate::{
    git::GitFetcher,
    introspect::read_release_files,
    model::{
        spec::{SourceSpec, Specification, EPICS_BASE},
        ModuleName, Revision,
    },
    site::Site,
};

/// A module an IOC tree depends on, directly or through another module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundModule {
    pub name: ModuleName,
    /// The RELEASE variable that first pointed at the module.
    pub variable: String,
    pub tag: String,
    pub path: PathBuf,
}

/// Walks the RELEASE files of an IOC tree and of every module tree they point at.
pub struct TreeInspector {
    site: Site,
    fetcher: GitFetcher,
    download: bool,
}

impl TreeInspector {
    /// With `download`, module trees missing on disk are fetched from the site git URL and
    /// inspected in turn. Otherwise they are only listed.
    pub fn new(site: Site, download: bool) -> Self {
        TreeInspector {
            site,
            fetcher: GitFetcher::new(),
            download,
        }
    }

    pub fn inspect(&self, root: &Path) -> anyhow::Result<BTreeMap<ModuleName, FoundModule>> {
        if !root.is_dir() {
            bail!("{} is not a directory", root.display());
        }
        let site = self.site_for(root)?;
        let seed = site.release_variables();

        let mut found: BTreeMap<ModuleName, FoundModule> = BTreeMap::new();
        let mut visited: BTreeSet<PathBuf> = BTreeSet::new();
        let mut pending = VecDeque::from([root.to_path_buf()]);

        while let Some(tree) = pending.pop_front() {
            if !visited.insert(tree.clone()) {
                continue;
            }
            let variables = read_release_files(&tree, seed.clone())
                .with_context(|| format!("could not inspect {}", tree.display()))?;
            for (variable, value) in variables.assigned() {
                let Some(info) = site.version_from_path(value) else {
                    continue;
                };
                if found.contains_key(&info.name) {
                    continue;
                }
                let module = FoundModule {
                    name: info.name.clone(),
                    variable: variable.to_string(),
                    tag: info.tag,
                    path: PathBuf::from(value),
                };
                debug!("{} refers to {} {}", tree.display(), module.name, module.tag);
                if self.ensure_tree(&site, &module)? {
                    pending.push_back(module.path.clone());
                }
                found.insert(info.name, module);
            }
        }
        Ok(found)
    }

    /// The IOC's own epics-base takes precedence over the configured one, since it decides
    /// where the IOC expects its modules.
    fn site_for(&self, root: &Path) -> anyhow::Result<Site> {
        let variables = read_release_files(root, self.site.release_variables())?;
        let base = variables.assigned().find_map(|(_, value)| {
            self.site
                .version_from_path(value)
                .filter(|info| info.name.as_str() == EPICS_BASE)
        });
        Ok(match base {
            Some(base) => {
                debug!("{} is built against epics-base {}", root.display(), base.tag);
                self.site
                    .clone()
                    .with_base_version(Some(&Revision::pinned(base.tag)))
            }
            None => self.site.clone(),
        })
    }

    /// Whether the module's tree is on disk after fetching it if allowed.
    fn ensure_tree(&self, site: &Site, module: &FoundModule) -> anyhow::Result<bool> {
        if module.path.is_dir() {
            return Ok(true);
        }
        if !self.download {
            info!(
                "{} {} is not present at {}",
                module.name,
                module.tag,
                module.path.display()
            );
            return Ok(false);
        }
        match site.derive_source(&module.name, &Revision::pinned(module.tag.clone())) {
            Some(SourceSpec::Git(git)) => {
                self.fetcher
                    .checkout(&git, &module.path)
                    .with_context(|| format!("could not fetch {} {}", module.name, module.tag))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Serialize)]
struct InspectedDocument {
    application: InspectedApplication,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    modules: BTreeMap<ModuleName, InspectedModule>,
}

#[derive(Serialize)]
struct InspectedApplication {
    standard_modules: Vec<ModuleName>,
}

#[derive(Serialize)]
struct InspectedModule {
    #[serde(skip_serializing_if = "Option::is_none")]
    variable: Option<String>,
    git: InspectedGit,
}

#[derive(Serialize)]
struct InspectedGit {
    url: String,
    tag: String,
}

/// Renders what an inspection found as a specification document. Modules the loaded
/// specification already declares are listed as standard modules, the rest are declared
/// with a git source from the site conventions.
pub fn to_specification_yaml(
    found: &BTreeMap<ModuleName, FoundModule>,
    known: &Specification,
    site: &Site,
) -> Result<String, serde_yaml::Error> {
    let mut standard_modules = Vec::new();
    let mut modules = BTreeMap::new();
    for module in found.values() {
        if known.modules.contains_key(&module.name) {
            standard_modules.push(module.name.clone());
            continue;
        }
        let Some(SourceSpec::Git(git)) =
            site.derive_source(&module.name, &Revision::pinned(module.tag.clone()))
        else {
            continue;
        };
        let variable = (module.variable != module.name.default_variable())
            .then(|| module.variable.clone());
        modules.insert(
            module.name.clone(),
            InspectedModule {
                variable,
                git: InspectedGit {
                    url: git.url,
                    tag: git.tag,
                },
            },
        );
    }
    serde_yaml::to_string(&InspectedDocument {
        application: InspectedApplication { standard_modules },
        modules,
    })
}
