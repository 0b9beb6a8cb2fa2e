use std::{
    collections::{BTreeMap, BTreeSet},
    path::{Path, PathBuf},
    sync::OnceLock,
};

use anyhow::{bail, Context};
use log::{debug, info, warn};
use regex_lite::{Captures, Regex};

use crate::{
    git::GitFetcher,
    model::{spec::SourceSpec, Revision},
    resolver::{
        graph::{Introspection, Introspector},
        registry::ModuleEntry,
    },
    site::Site,
};

const RELEASE_FILES: [&str; 2] = ["configure/RELEASE", "configure/RELEASE.local"];
const MAX_INCLUDE_DEPTH: usize = 16;
const MAX_EXPANSION_PASSES: usize = 16;

struct Patterns {
    assignment: Regex,
    include: Regex,
    variable: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        assignment: Regex::new(r"^(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*(?P<op>[:?+]?=)\s*(?P<value>.*)$")
            .unwrap(),
        include: Regex::new(r"^(?P<optional>-|s)?include\s+(?P<path>.+)$").unwrap(),
        variable: Regex::new(r"\$[({](?P<name>[A-Za-z0-9_]+)[)}]").unwrap(),
    })
}

/// Variables assigned by a module's RELEASE files.
#[derive(Debug, Default)]
pub struct ReleaseVariables {
    values: BTreeMap<String, String>,
    assigned: BTreeSet<String>,
}

impl ReleaseVariables {
    fn new(seed: BTreeMap<String, String>) -> Self {
        ReleaseVariables {
            values: seed,
            assigned: BTreeSet::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Variables set by the files themselves, with their expanded values.
    pub fn assigned(&self) -> impl Iterator<Item = (&str, &str)> {
        self.assigned
            .iter()
            .filter_map(|name| Some((name.as_str(), self.values.get(name)?.as_str())))
    }

    /// Expands `$(VAR)` and `${VAR}`. Unknown variables expand to nothing, as in make.
    pub fn expand(&self, text: &str) -> String {
        let mut current = text.to_string();
        // Values may themselves contain references.
        for _ in 0..MAX_EXPANSION_PASSES {
            let expanded = patterns()
                .variable
                .replace_all(&current, |captures: &Captures<'_>| {
                    self.values
                        .get(&captures["name"])
                        .cloned()
                        .unwrap_or_default()
                })
                .into_owned();
            if expanded == current {
                break;
            }
            current = expanded;
        }
        current
    }

    fn assign(&mut self, name: &str, op: &str, value: &str) {
        let value = self.expand(value);
        match op {
            "?=" if self.assigned.contains(name) => return,
            "+=" => {
                let joined = match self.values.get(name) {
                    Some(existing) if !existing.is_empty() => format!("{existing} {value}"),
                    _ => value,
                };
                self.values.insert(name.to_string(), joined);
            }
            _ => {
                self.values.insert(name.to_string(), value);
            }
        }
        self.assigned.insert(name.to_string());
    }
}

/// Reads `configure/RELEASE` and `configure/RELEASE.local` under `root`, following includes.
/// `seed` provides the site variables; `TOP` is always the module root.
pub fn read_release_files(
    root: &Path,
    seed: BTreeMap<String, String>,
) -> anyhow::Result<ReleaseVariables> {
    let mut variables = ReleaseVariables::new(seed);
    variables
        .values
        .insert("TOP".to_string(), root.display().to_string());
    for file in RELEASE_FILES {
        let path = root.join(file);
        if path.exists() {
            read_file(root, &path, &mut variables, 0)?;
        }
    }
    Ok(variables)
}

fn read_file(
    root: &Path,
    path: &Path,
    variables: &mut ReleaseVariables,
    depth: usize,
) -> anyhow::Result<()> {
    if depth > MAX_INCLUDE_DEPTH {
        bail!("includes nested too deeply at {}", path.display());
    }
    debug!("Reading {}", path.display());
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not read {}", path.display()))?;

    for (number, line) in contents.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        if let Some(captures) = patterns().include.captures(line) {
            let optional = captures.name("optional").is_some();
            let included = PathBuf::from(variables.expand(captures["path"].trim()));
            let included = if included.is_relative() {
                root.join(included)
            } else {
                included
            };
            if included.exists() {
                read_file(root, &included, variables, depth + 1)?;
            } else if !optional {
                warn!(
                    "{}:{} includes missing file {}",
                    path.display(),
                    number + 1,
                    included.display()
                );
            }
        } else if let Some(captures) = patterns().assignment.captures(line) {
            variables.assign(&captures["name"], &captures["op"], captures["value"].trim());
        } else {
            warn!(
                "{}:{} cannot be interpreted: {}",
                path.display(),
                number + 1,
                line
            );
        }
    }
    Ok(())
}

/// Finds a module's dependencies from the paths its RELEASE files point at.
pub struct ReleaseFileIntrospector {
    site: Site,
    fetcher: GitFetcher,
}

impl ReleaseFileIntrospector {
    pub fn new(site: Site) -> Self {
        ReleaseFileIntrospector {
            site,
            fetcher: GitFetcher::new(),
        }
    }
}

impl Introspector for ReleaseFileIntrospector {
    fn introspect(&self, entry: &ModuleEntry) -> anyhow::Result<Introspection> {
        let root = &entry.install_path;
        if !root.exists() {
            match &entry.source {
                Some(SourceSpec::Git(git)) => {
                    info!("Fetching {} to read its dependencies", entry.name);
                    self.fetcher
                        .checkout(git, root)
                        .with_context(|| format!("could not fetch {}", entry.name))?;
                }
                _ => bail!("source tree {} does not exist", root.display()),
            }
        }

        let variables = read_release_files(root, self.site.release_variables())?;
        let mut introspection = Introspection::default();
        for (variable, value) in variables.assigned() {
            let Some(info) = self.site.version_from_path(value) else {
                continue;
            };
            if info.name == entry.name {
                continue;
            }
            debug!("{}: {} = {} is {} {}", entry.name, variable, value, info.name, info.tag);
            if let Some(source) = self
                .site
                .derive_source(&info.name, &Revision::pinned(info.tag.clone()))
            {
                introspection.discovered.insert(info.name.clone(), source);
            }
            introspection.dependencies.insert(info.name);
        }
        if introspection.dependencies.is_empty() {
            debug!("{} has no dependencies in its RELEASE files", entry.name);
        }
        Ok(introspection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        model::{constraint::VersionConstraint, spec::GitSource, ModuleName},
        site::SiteSettings,
    };

    fn site(top: &Path) -> Site {
        Site::new(SiteSettings {
            top: top.to_path_buf(),
            ..SiteSettings::default()
        })
        .unwrap()
        .with_base_version(Some(&Revision::pinned("R7.0.2-2.0")))
    }

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn variables_are_expanded_and_includes_followed() {
        let dir = tempfile::tempdir().unwrap();
        write(
            &dir.path().join("configure/RELEASE"),
            "# comment\nASYN_VER = R4.39\nASYN = ${SUPPORT}/asyn/$(ASYN_VER)\n-include $(TOP)/RELEASE_SITE\ninclude $(TOP)/configure/RELEASE.extra\nifdef T_A\n",
        );
        write(
            &dir.path().join("configure/RELEASE.extra"),
            "SEQ := /opt/seq\nSEQ ?= /elsewhere\nFLAGS = -a\nFLAGS += -b\n",
        );
        let seed = BTreeMap::from([("SUPPORT".to_string(), "/support".to_string())]);
        let variables = read_release_files(dir.path(), seed).unwrap();
        assert_eq!(variables.get("ASYN"), Some("/support/asyn/R4.39"));
        assert_eq!(variables.get("SEQ"), Some("/opt/seq"));
        assert_eq!(variables.get("FLAGS"), Some("-a -b"));
        assert!(!variables.assigned().any(|(name, _)| name == "SUPPORT"));
    }

    #[test]
    fn dependencies_are_mapped_through_site_paths() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("epics");
        let site = site(&top);
        let root = dir.path().join("ioc");
        write(
            &root.join("configure/RELEASE"),
            "EPICS_BASE = $(EPICS_SITE_TOP)/base/R7.0.2-2.0\nASYN = $(EPICS_MODULES)/asyn/R4.39-1.0.1\nMOTOR = $(SUPPORT)/motor/R6.9\nOTHER = /usr/local/other\n",
        );
        let mut entry = ModuleEntry::new(
            ModuleName::from("ioc"),
            VersionConstraint::declared(Revision::Arbitrary),
            Some(SourceSpec::Local { path: root.clone() }),
        );
        entry.install_path = root;

        let introspection = ReleaseFileIntrospector::new(site).introspect(&entry).unwrap();
        assert_eq!(
            introspection.dependencies,
            ["asyn", "epics-base", "motor"]
                .into_iter()
                .map(ModuleName::from)
                .collect::<BTreeSet<_>>()
        );
        assert_eq!(
            introspection.discovered[&ModuleName::from("asyn")],
            SourceSpec::Git(GitSource::new(
                "https://github.com/slac-epics/asyn",
                "R4.39-1.0.1"
            ))
        );
    }

    #[test]
    fn tree_without_release_files_has_no_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = ModuleEntry::new(
            ModuleName::from("plain"),
            VersionConstraint::declared(Revision::Arbitrary),
            None,
        );
        entry.install_path = dir.path().to_path_buf();
        let introspection = ReleaseFileIntrospector::new(site(dir.path()))
            .introspect(&entry)
            .unwrap();
        assert_eq!(introspection, Introspection::default());
    }

    #[test]
    fn missing_local_tree_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut entry = ModuleEntry::new(
            ModuleName::from("gone"),
            VersionConstraint::declared(Revision::Arbitrary),
            None,
        );
        entry.install_path = dir.path().join("gone");
        assert!(ReleaseFileIntrospector::new(site(dir.path()))
            .introspect(&entry)
            .is_err());
    }
}
