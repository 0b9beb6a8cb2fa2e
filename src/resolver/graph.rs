use std::collections::{BTreeMap, BTreeSet};

use anyhow::anyhow;
use log::{debug, info, warn};

use crate::{
    model::{
        constraint::{Origin, VersionConstraint},
        spec::{SourceSpec, Specification},
        ModuleName, Revision,
    },
    site::Site,
};

use super::{
    registry::{ModuleEntry, ModuleRegistry, Override, VersionConflict},
    ResolveError,
};

/// What introspecting one module's source tree revealed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Introspection {
    pub dependencies: BTreeSet<ModuleName>,
    /// Sources for dependencies that may not be registered yet.
    pub discovered: BTreeMap<ModuleName, SourceSpec>,
}

/// Determines the dependencies of a module whose specification does not list them.
///
/// Independent modules are introspected concurrently, but a module is never introspected twice.
pub trait Introspector: Sync {
    fn introspect(&self, entry: &ModuleEntry) -> anyhow::Result<Introspection>;
}

impl<F> Introspector for F
where
    F: Fn(&ModuleEntry) -> anyhow::Result<Introspection> + Sync,
{
    fn introspect(&self, entry: &ModuleEntry) -> anyhow::Result<Introspection> {
        self(entry)
    }
}

/// A complete dependency graph: every module's dependency set is known and every edge
/// points at a registered module.
pub struct DependencyGraph {
    site: Site,
    nodes: BTreeMap<ModuleName, ModuleEntry>,
    conflicts: Vec<VersionConflict>,
    overrides: Vec<Override>,
}

impl DependencyGraph {
    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn get(&self, name: &ModuleName) -> Option<&ModuleEntry> {
        self.nodes.get(name)
    }

    /// Modules in name order.
    pub fn modules(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.nodes.values()
    }

    pub fn dependencies<'a>(&'a self, name: &ModuleName) -> impl Iterator<Item = &'a ModuleName> {
        self.nodes
            .get(name)
            .into_iter()
            .flat_map(|entry| entry.dependency_set())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn conflicts(&self) -> &[VersionConflict] {
        &self.conflicts
    }

    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    pub(super) fn into_parts(
        self,
    ) -> (
        Site,
        BTreeMap<ModuleName, ModuleEntry>,
        Vec<VersionConflict>,
        Vec<Override>,
    ) {
        (self.site, self.nodes, self.conflicts, self.overrides)
    }
}

pub struct DependencyGraphBuilder {
    registry: ModuleRegistry,
    attempted: BTreeSet<ModuleName>,
    errors: Vec<ResolveError>,
}

impl DependencyGraphBuilder {
    pub fn new(site: Site) -> Self {
        DependencyGraphBuilder {
            registry: ModuleRegistry::new(site),
            attempted: BTreeSet::new(),
            errors: Vec::new(),
        }
    }

    /// Seeds the registry from a loaded specification.
    ///
    /// Standard modules and everything they reach through the listed dependencies are
    /// registered as locked before any edge is added, so a pin is locked exactly when its
    /// consumer is, whatever the module names. Everything else is declared. Errors are kept
    /// and reported by [`DependencyGraphBuilder::build`].
    pub fn from_specification(specification: &Specification, site: Site) -> Self {
        let mut builder = Self::new(site);
        let locked = specification.locked_closure();
        debug!("Locked set: {} module(s)", locked.len());

        for module in specification.modules.values() {
            let origin = if locked.contains(&module.name) {
                Origin::Locked
            } else {
                Origin::Declared
            };
            // Conflicts stay in the registry until the resolver collects them.
            let _ = builder.add_module(ModuleEntry::from_spec(module, origin));
        }

        for redeclaration in &specification.redeclarations {
            debug!(
                "Registering {} {} from {}",
                redeclaration.name,
                redeclaration.version,
                redeclaration.file.display()
            );
            let _ = builder.add_module(ModuleEntry::new(
                redeclaration.name.clone(),
                VersionConstraint::declared(redeclaration.version.clone()),
                redeclaration.source.clone(),
            ));
        }

        for module in specification.modules.values() {
            for dependency in module.dependencies.iter().flatten() {
                let result = match dependency.version {
                    Revision::Arbitrary => builder.add_dependency(&module.name, &dependency.name),
                    _ => builder.pin(&module.name, &dependency.name, dependency.version.clone()),
                };
                if let Err(error) = result {
                    builder.errors.push(error);
                }
            }
        }

        builder.registry.mark_locked(&specification.standard);
        builder
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn add_module(&mut self, entry: ModuleEntry) -> Result<(), VersionConflict> {
        self.registry.insert(entry).map(|_| ())
    }

    /// Adds the edge `from -> to`. The target must already be registered, since an unpinned
    /// edge carries no version from which a source could be derived.
    pub fn add_dependency(&mut self, from: &ModuleName, to: &ModuleName) -> Result<(), ResolveError> {
        if from == to {
            warn!("Ignoring dependency of {} on itself", from);
            return Ok(());
        }
        if !self.registry.contains(to) {
            return Err(ResolveError::UnknownModule {
                module: to.clone(),
                required_by: Some(from.clone()),
            });
        }

        let locked = match self.registry.get_mut(from) {
            Some(entry) => {
                entry
                    .dependencies
                    .get_or_insert_with(BTreeSet::new)
                    .insert(to.clone());
                entry.is_locked()
            }
            None => {
                return Err(ResolveError::UnknownModule {
                    module: from.clone(),
                    required_by: None,
                })
            }
        };
        if locked {
            self.registry.lock_transitively(to);
        }
        Ok(())
    }

    /// Adds the edge `from -> to` together with the version `from` requires of `to`.
    ///
    /// The request is declared, or locked when `from` is locked. An unregistered target gets a
    /// source derived from the site conventions.
    pub fn pin(
        &mut self,
        from: &ModuleName,
        to: &ModuleName,
        version: Revision,
    ) -> Result<(), ResolveError> {
        if from == to {
            warn!("Ignoring dependency of {} on itself", from);
            return Ok(());
        }
        let origin = match self.registry.get(from) {
            Some(entry) if entry.is_locked() => Origin::Locked,
            _ => Origin::Declared,
        };
        let source = if self.registry.contains(to) {
            None
        } else {
            let derived = self.registry.site().derive_source(to, &version);
            if derived.is_none() {
                return Err(ResolveError::UnknownModule {
                    module: to.clone(),
                    required_by: Some(from.clone()),
                });
            }
            info!("{} requires {} {}, which is not declared", from, to, version);
            derived
        };
        let _ = self
            .registry
            .register(to.clone(), VersionConstraint::new(version, origin), source);
        self.add_dependency(from, to)
    }

    /// Introspects every module with an unknown dependency set until a pass discovers nothing
    /// new, then freezes the registry into a graph.
    pub fn build<I>(mut self, introspector: &I) -> Result<DependencyGraph, ResolveError>
    where
        I: Introspector + ?Sized,
    {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        loop {
            let pending: Vec<ModuleEntry> = self
                .registry
                .entries()
                .filter(|entry| {
                    entry.dependencies.is_none() && !self.attempted.contains(&entry.name)
                })
                .cloned()
                .collect();
            if pending.is_empty() {
                break;
            }
            info!("Introspecting {} module(s)", pending.len());
            self.attempted
                .extend(pending.iter().map(|entry| entry.name.clone()));

            for chunk in pending.chunks(parallelism) {
                let results: Vec<(ModuleName, anyhow::Result<Introspection>)> =
                    std::thread::scope(|scope| {
                        let handles: Vec<_> = chunk
                            .iter()
                            .map(|entry| {
                                (
                                    entry.name.clone(),
                                    scope.spawn(move || introspector.introspect(entry)),
                                )
                            })
                            .collect();
                        handles
                            .into_iter()
                            .map(|(name, handle)| {
                                let result = handle
                                    .join()
                                    .unwrap_or_else(|_| Err(anyhow!("introspection panicked")));
                                (name, result)
                            })
                            .collect()
                    });

                for (name, result) in results {
                    match result {
                        Ok(introspection) => self.apply(&name, introspection),
                        Err(reason) => self
                            .errors
                            .push(ResolveError::Introspection { module: name, reason }),
                    }
                }
            }
        }

        if !self.errors.is_empty() {
            let mut errors = self.errors;
            errors.extend(
                self.registry
                    .conflicts()
                    .iter()
                    .cloned()
                    .map(ResolveError::VersionConflict),
            );
            return Err(ResolveError::ResolutionFailed(errors));
        }

        let (site, nodes, conflicts, overrides) = self.registry.into_parts();
        Ok(DependencyGraph {
            site,
            nodes,
            conflicts,
            overrides,
        })
    }

    fn apply(&mut self, name: &ModuleName, introspection: Introspection) {
        debug!(
            "{} depends on {:?}",
            name,
            introspection
                .dependencies
                .iter()
                .map(ModuleName::as_str)
                .collect::<Vec<_>>()
        );
        let origin = match self.registry.get(name) {
            Some(entry) if entry.is_locked() => Origin::Locked,
            _ => Origin::Inherited,
        };

        for (discovered, source) in introspection.discovered {
            if &discovered == name {
                continue;
            }
            let version = match &source {
                SourceSpec::Git(git) => Revision::pinned(git.tag.clone()),
                SourceSpec::Local { .. } => Revision::Arbitrary,
            };
            let _ = self.registry.register(
                discovered,
                VersionConstraint::new(version, origin),
                Some(source),
            );
        }

        if let Some(entry) = self.registry.get_mut(name) {
            entry.dependencies.get_or_insert_with(BTreeSet::new);
        }
        for dependency in introspection.dependencies {
            if let Err(error) = self.add_dependency(name, &dependency) {
                self.errors.push(error);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::bail;
    use pretty_assertions::assert_eq;

    use crate::{
        model::spec::GitSource,
        resolver::registry::ModuleStatus,
        site::SiteSettings,
    };

    fn site() -> Site {
        Site::new(SiteSettings::default()).unwrap()
    }

    fn git(name: &str, tag: &str) -> SourceSpec {
        SourceSpec::Git(GitSource::new(format!("https://example.com/{name}"), tag))
    }

    fn entry(name: &str, tag: &str, origin: Origin) -> ModuleEntry {
        ModuleEntry::new(
            ModuleName::from(name),
            VersionConstraint::new(Revision::pinned(tag), origin),
            Some(git(name, tag)),
        )
    }

    fn names(names: &[&str]) -> BTreeSet<ModuleName> {
        names.iter().copied().map(ModuleName::from).collect()
    }

    fn no_introspection(entry: &ModuleEntry) -> anyhow::Result<Introspection> {
        bail!("unexpected introspection of {}", entry.name)
    }

    #[test]
    fn unknown_unpinned_dependency_is_an_error() {
        let mut builder = DependencyGraphBuilder::new(site());
        builder
            .add_module(entry("motor", "R1", Origin::Declared))
            .unwrap();
        let error = builder
            .add_dependency(&ModuleName::from("motor"), &ModuleName::from("asyn"))
            .unwrap_err();
        assert!(matches!(
            error,
            ResolveError::UnknownModule { module, required_by: Some(from) }
                if module.as_str() == "asyn" && from.as_str() == "motor"
        ));
    }

    #[test]
    fn pinned_dependency_is_auto_registered() {
        let mut builder = DependencyGraphBuilder::new(site());
        builder
            .add_module(entry("motor", "R1", Origin::Declared))
            .unwrap();
        builder
            .pin(
                &ModuleName::from("motor"),
                &ModuleName::from("asyn"),
                Revision::pinned("R4"),
            )
            .unwrap();
        let asyn = builder.registry().get(&ModuleName::from("asyn")).unwrap();
        assert_eq!(asyn.constraint, VersionConstraint::declared("R4"));
        assert_eq!(
            asyn.source,
            Some(SourceSpec::Git(GitSource::new(
                "https://github.com/slac-epics/asyn",
                "R4"
            )))
        );
    }

    #[test]
    fn self_dependency_is_dropped() {
        let mut builder = DependencyGraphBuilder::new(site());
        builder
            .add_module(entry("motor", "R1", Origin::Declared))
            .unwrap();
        builder
            .add_dependency(&ModuleName::from("motor"), &ModuleName::from("motor"))
            .unwrap();
        let motor = builder.registry().get(&ModuleName::from("motor")).unwrap();
        assert_eq!(motor.dependencies, None);
    }

    #[test]
    fn build_introspects_until_nothing_new_is_found() {
        let mut builder = DependencyGraphBuilder::new(site());
        builder
            .add_module(entry("ioc", "R1", Origin::Declared))
            .unwrap();
        let calls = AtomicUsize::new(0);
        let introspector = |entry: &ModuleEntry| -> anyhow::Result<Introspection> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(match entry.name.as_str() {
                "ioc" => Introspection {
                    dependencies: names(&["motor", "asyn"]),
                    discovered: BTreeMap::from([
                        (ModuleName::from("motor"), git("motor", "R6")),
                        (ModuleName::from("asyn"), git("asyn", "R4")),
                    ]),
                },
                "motor" => Introspection {
                    dependencies: names(&["asyn", "epics-base"]),
                    discovered: BTreeMap::from([(
                        ModuleName::from("epics-base"),
                        git("epics-base", "R7"),
                    )]),
                },
                _ => Introspection::default(),
            })
        };

        let graph = builder.build(&introspector).unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(graph.len(), 4);
        assert_eq!(
            graph
                .dependencies(&ModuleName::from("motor"))
                .cloned()
                .collect::<BTreeSet<_>>(),
            names(&["asyn", "epics-base"])
        );
        let asyn = graph.get(&ModuleName::from("asyn")).unwrap();
        assert_eq!(asyn.constraint, VersionConstraint::inherited("R4"));
        assert_eq!(asyn.dependencies, Some(BTreeSet::new()));
        assert_eq!(asyn.status, ModuleStatus::Declared);
    }

    #[test]
    fn modules_with_known_dependencies_are_not_introspected() {
        let mut builder = DependencyGraphBuilder::new(site());
        let mut base = entry("epics-base", "R7", Origin::Locked);
        base.dependencies = Some(BTreeSet::new());
        builder.add_module(base).unwrap();
        let graph = builder.build(&no_introspection).unwrap();
        assert_eq!(graph.len(), 1);
    }

    #[test]
    fn introspection_errors_are_aggregated() {
        let mut builder = DependencyGraphBuilder::new(site());
        builder
            .add_module(entry("motor", "R1", Origin::Declared))
            .unwrap();
        builder
            .add_module(entry("asyn", "R1", Origin::Declared))
            .unwrap();
        let error = match builder.build(&no_introspection) {
            Err(ResolveError::ResolutionFailed(errors)) => errors,
            other => panic!("unexpected result {:?}", other.map(|graph| graph.len())),
        };
        assert_eq!(error.len(), 2);
        assert!(error
            .iter()
            .all(|error| matches!(error, ResolveError::Introspection { .. })));
    }

    #[test]
    fn discovered_dependencies_of_locked_modules_are_locked() {
        let mut builder = DependencyGraphBuilder::new(site());
        builder
            .add_module(entry("asyn", "R4", Origin::Locked))
            .unwrap();
        let introspector = |entry: &ModuleEntry| -> anyhow::Result<Introspection> {
            Ok(match entry.name.as_str() {
                "asyn" => Introspection {
                    dependencies: names(&["seq"]),
                    discovered: BTreeMap::from([(ModuleName::from("seq"), git("seq", "R2"))]),
                },
                _ => Introspection::default(),
            })
        };
        let graph = builder.build(&introspector).unwrap();
        assert_eq!(
            graph.get(&ModuleName::from("seq")).unwrap().constraint,
            VersionConstraint::locked("R2")
        );
    }

    #[test]
    fn specification_standard_set_is_locked_transitively() {
        let specification = Specification::from_documents([(
            std::path::Path::new("base.yaml"),
            r#"
modules:
  epics-base:
    standard: true
    git: { url: https://example.com/epics-base, tag: R1 }
    dependencies: []
  asyn:
    standard: true
    git: { url: https://example.com/asyn, tag: R1 }
    dependencies: [epics-base, seq]
  seq:
    git: { url: https://example.com/seq, tag: R2 }
    dependencies: [epics-base]
  motor:
    git: { url: https://example.com/motor, tag: R3 }
    dependencies: [asyn]
"#,
        )])
        .unwrap();
        let builder = DependencyGraphBuilder::from_specification(&specification, site());
        let locked: BTreeSet<_> = builder
            .registry()
            .entries()
            .filter(|entry| entry.is_locked())
            .map(|entry| entry.name.clone())
            .collect();
        assert_eq!(locked, names(&["asyn", "epics-base", "seq"]));
    }
}
