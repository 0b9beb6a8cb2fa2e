use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    path::{Path, PathBuf},
};

use log::{debug, warn};
use serde::Deserialize;

use super::{ModuleName, ParseError, Revision};

pub const EPICS_BASE: &str = "epics-base";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GitSource {
    pub url: String,
    pub tag: String,
    #[serde(default)]
    pub args: String,
    #[serde(default = "default_depth")]
    pub depth: u32,
    #[serde(default = "default_recursive")]
    pub recursive: bool,
}

fn default_depth() -> u32 {
    5
}

fn default_recursive() -> bool {
    true
}

impl GitSource {
    pub fn new(url: impl Into<String>, tag: impl Into<String>) -> Self {
        GitSource {
            url: url.into(),
            tag: tag.into(),
            args: String::new(),
            depth: default_depth(),
            recursive: default_recursive(),
        }
    }
}

/// How a module's source tree is acquired. Exactly one method is active per module.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SourceSpec {
    Git(GitSource),
    Local { path: PathBuf },
}

impl Display for SourceSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceSpec::Git(git) => write!(f, "git+{}@{}", git.url, git.tag),
            SourceSpec::Local { path } => write!(f, "path+{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MakeOptions {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_parallel")]
    pub parallel: u32,
}

fn default_parallel() -> u32 {
    1
}

impl Default for MakeOptions {
    fn default() -> Self {
        MakeOptions {
            args: Vec::new(),
            parallel: default_parallel(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchMethod {
    #[default]
    Replace,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Patch {
    #[serde(default)]
    pub description: String,
    pub dest_file: PathBuf,
    #[serde(default)]
    pub method: PatchMethod,
    pub contents: String,
    #[serde(default)]
    pub mode: Option<u32>,
}

/// Everything the build executor needs beyond the module's location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildDirectives {
    pub make: MakeOptions,
    pub patches: Vec<Patch>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencySpec {
    pub name: ModuleName,
    pub version: Revision,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSpec {
    pub name: ModuleName,
    pub variable: String,
    pub version: Revision,
    pub source: SourceSpec,
    pub install_path: Option<PathBuf>,
    /// `None` when the specification does not list dependencies and they must be introspected.
    pub dependencies: Option<Vec<DependencySpec>>,
    pub directives: BuildDirectives,
}

/// A later declaration of a module already in the locked set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redeclaration {
    pub name: ModuleName,
    pub version: Revision,
    pub source: Option<SourceSpec>,
    pub file: PathBuf,
}

/// The validated, merged content of an ordered list of specification documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Specification {
    pub modules: BTreeMap<ModuleName, ModuleSpec>,
    pub standard: BTreeSet<ModuleName>,
    pub redeclarations: Vec<Redeclaration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDocument {
    #[serde(default)]
    modules: BTreeMap<ModuleName, RawModule>,
    #[serde(default)]
    application: Option<RawApplication>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawApplication {
    #[serde(default)]
    standard_modules: Vec<ModuleName>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawModule {
    variable: Option<String>,
    version: Option<String>,
    standard: Option<bool>,
    git: Option<GitSource>,
    path: Option<PathBuf>,
    install_path: Option<PathBuf>,
    dependencies: Option<Vec<RawDependency>>,
    make: Option<MakeOptions>,
    patches: Option<Vec<Patch>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawDependency {
    Name(ModuleName),
    Pinned {
        name: ModuleName,
        version: Option<String>,
    },
}

impl From<RawDependency> for DependencySpec {
    fn from(value: RawDependency) -> Self {
        match value {
            RawDependency::Name(name) => DependencySpec {
                name,
                version: Revision::Arbitrary,
            },
            RawDependency::Pinned { name, version } => DependencySpec {
                name,
                version: version.into(),
            },
        }
    }
}

impl RawModule {
    /// Field-wise override by a later document. The source is replaced as a unit.
    fn override_with(&mut self, later: RawModule) {
        if later.git.is_some() || later.path.is_some() {
            self.git = later.git;
            self.path = later.path;
            if later.version.is_none() {
                self.version = None;
            }
        }
        if later.variable.is_some() {
            self.variable = later.variable;
        }
        if later.version.is_some() {
            self.version = later.version;
        }
        if later.standard.is_some() {
            self.standard = later.standard;
        }
        if later.install_path.is_some() {
            self.install_path = later.install_path;
        }
        if later.dependencies.is_some() {
            self.dependencies = later.dependencies;
        }
        if later.make.is_some() {
            self.make = later.make;
        }
        if later.patches.is_some() {
            self.patches = later.patches;
        }
    }

    fn source(&self, name: &ModuleName) -> Result<Option<SourceSpec>, ParseError> {
        match (&self.git, &self.path) {
            (Some(_), Some(_)) => Err(invalid(name, "only one of `git` or `path` may be given")),
            (Some(git), None) if git.tag.is_empty() => Err(invalid(name, "git tag is empty")),
            (Some(git), None) => Ok(Some(SourceSpec::Git(git.clone()))),
            (None, Some(path)) => Ok(Some(SourceSpec::Local { path: path.clone() })),
            (None, None) => Ok(None),
        }
    }

    fn version(&self) -> Revision {
        match (&self.version, &self.git) {
            (Some(version), _) => Revision::pinned(version.clone()),
            (None, Some(git)) => Revision::pinned(git.tag.clone()),
            (None, None) => Revision::Arbitrary,
        }
    }

    fn into_module_spec(self, name: ModuleName) -> Result<ModuleSpec, ParseError> {
        let source = self
            .source(&name)?
            .ok_or_else(|| invalid(&name, "one of `git` or `path` is required"))?;
        let make = self.make.clone().unwrap_or_default();
        if make.parallel == 0 {
            return Err(invalid(&name, "make.parallel must be at least 1"));
        }
        let version = self.version();
        let variable = self
            .variable
            .clone()
            .unwrap_or_else(|| name.default_variable());
        let dependencies = self
            .dependencies
            .map(|deps| deps.into_iter().map(DependencySpec::from).collect());

        Ok(ModuleSpec {
            name,
            variable,
            version,
            source,
            install_path: self.install_path,
            dependencies,
            directives: BuildDirectives {
                make,
                patches: self.patches.unwrap_or_default(),
            },
        })
    }
}

fn invalid(name: &ModuleName, message: &str) -> ParseError {
    ParseError::InvalidSpecification {
        module: name.clone(),
        message: message.to_string(),
    }
}

impl Specification {
    pub fn from_files<P: AsRef<Path>>(paths: &[P]) -> Result<Specification, ParseError> {
        let mut documents = Vec::with_capacity(paths.len());
        for path in paths {
            let path = path.as_ref();
            debug!("Reading specification file {}", path.display());
            let contents = std::fs::read_to_string(path).map_err(|source| ParseError::IO {
                path: path.to_path_buf(),
                source,
            })?;
            documents.push((path.to_path_buf(), contents));
        }
        Self::from_documents(
            documents
                .iter()
                .map(|(path, contents)| (path.as_path(), contents.as_str())),
        )
    }

    /// Merges YAML documents in the given order. See [`RawModule::override_with`] for how a
    /// later document changes a module that an earlier document declared.
    pub fn from_documents<'a>(
        documents: impl IntoIterator<Item = (&'a Path, &'a str)>,
    ) -> Result<Specification, ParseError> {
        let mut raw: BTreeMap<ModuleName, RawModule> = BTreeMap::new();
        let mut standard: BTreeSet<ModuleName> = BTreeSet::new();
        let mut redeclarations = Vec::new();

        for (path, contents) in documents {
            let document: RawDocument =
                serde_yaml::from_str(contents).map_err(|source| ParseError::Yaml {
                    path: path.to_path_buf(),
                    source,
                })?;

            let mut document_standard: BTreeSet<ModuleName> = document
                .application
                .map(|app| app.standard_modules.into_iter().collect())
                .unwrap_or_default();

            for (name, module) in document.modules {
                if module.standard == Some(true) {
                    document_standard.insert(name.clone());
                }
                match raw.get_mut(&name) {
                    Some(existing) if standard.contains(&name) => {
                        if module.standard == Some(false) {
                            warn!(
                                "{} cannot remove {} from the standard module set",
                                path.display(),
                                name
                            );
                        }
                        if module.version.is_some() || module.git.is_some() || module.path.is_some()
                        {
                            let redeclaration = Redeclaration {
                                version: module.version(),
                                source: module.source(&name)?,
                                file: path.to_path_buf(),
                                name: name.clone(),
                            };
                            debug!(
                                "{} redeclares locked module {} at {}",
                                path.display(),
                                redeclaration.name,
                                redeclaration.version
                            );
                            redeclarations.push(redeclaration);
                        }
                        // Version and source stay locked, everything else merges.
                        existing.override_with(RawModule {
                            version: None,
                            standard: None,
                            git: None,
                            path: None,
                            ..module
                        });
                    }
                    Some(existing) => {
                        if module.standard == Some(false) && existing.standard == Some(true) {
                            warn!(
                                "{} cannot remove {} from the standard module set",
                                path.display(),
                                name
                            );
                        }
                        existing.override_with(module);
                    }
                    None => {
                        raw.insert(name, module);
                    }
                }
            }

            standard.extend(document_standard);
        }

        let modules = raw
            .into_iter()
            .map(|(name, module)| {
                module
                    .into_module_spec(name.clone())
                    .map(|spec| (name, spec))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Specification {
            modules,
            standard,
            redeclarations,
        })
    }

    /// The standard set together with every module reachable from it through the listed
    /// dependencies, pinned or not.
    pub fn locked_closure(&self) -> BTreeSet<ModuleName> {
        let mut closure = BTreeSet::new();
        let mut pending: Vec<&ModuleName> = self.standard.iter().collect();
        while let Some(name) = pending.pop() {
            if !closure.insert(name.clone()) {
                continue;
            }
            let dependencies = self
                .modules
                .get(name)
                .and_then(|module| module.dependencies.as_ref());
            pending.extend(dependencies.into_iter().flatten().map(|dep| &dep.name));
        }
        closure
    }

    /// The epics-base version, which determines where every other module is installed.
    pub fn base_version(&self) -> Option<&Revision> {
        self.modules
            .get(&ModuleName::from(EPICS_BASE))
            .map(|base| &base.version)
    }
}
