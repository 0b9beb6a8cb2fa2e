use std::{
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
    path::PathBuf,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    model::{
        constraint::{merge, Origin, VersionConstraint},
        spec::{BuildDirectives, ModuleSpec, SourceSpec},
        ModuleName,
    },
    site::Site,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleStatus {
    Declared,
    Resolved,
    Conflicted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleEntry {
    pub name: ModuleName,
    pub variable: String,
    pub constraint: VersionConstraint,
    pub source: Option<SourceSpec>,
    pub explicit_install_path: Option<PathBuf>,
    /// Filled in by the registry from the site layout.
    pub install_path: PathBuf,
    /// `None` until the dependency set is known, either from the specification or introspection.
    pub dependencies: Option<BTreeSet<ModuleName>>,
    pub status: ModuleStatus,
    pub directives: BuildDirectives,
}

impl ModuleEntry {
    pub fn new(name: ModuleName, constraint: VersionConstraint, source: Option<SourceSpec>) -> Self {
        ModuleEntry {
            variable: name.default_variable(),
            name,
            constraint,
            source,
            explicit_install_path: None,
            install_path: PathBuf::new(),
            dependencies: None,
            status: ModuleStatus::Declared,
            directives: BuildDirectives::default(),
        }
    }

    /// An entry for a module declared in a specification file. Dependency edges are added
    /// separately so that pins go through the registry.
    pub fn from_spec(spec: &ModuleSpec, origin: Origin) -> Self {
        ModuleEntry {
            name: spec.name.clone(),
            variable: spec.variable.clone(),
            constraint: VersionConstraint::new(spec.version.clone(), origin),
            source: Some(spec.source.clone()),
            explicit_install_path: spec.install_path.clone(),
            install_path: PathBuf::new(),
            dependencies: spec.dependencies.as_ref().map(|_| BTreeSet::new()),
            status: ModuleStatus::Declared,
            directives: spec.directives.clone(),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.constraint.is_locked()
    }

    pub fn dependency_set(&self) -> impl Iterator<Item = &ModuleName> {
        self.dependencies.iter().flatten()
    }

    /// Identifies the checked-out version; completion records are only valid for an equal
    /// fingerprint.
    pub fn fingerprint(&self) -> String {
        match &self.source {
            Some(source) => format!("{} {}", self.constraint.version, source),
            None => self.constraint.version.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Version conflict on {module}: {existing} vs {incoming}")]
pub struct VersionConflict {
    pub module: ModuleName,
    pub existing: VersionConstraint,
    pub incoming: VersionConstraint,
}

/// A pinned request that lost a merge without being a conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Override {
    pub module: ModuleName,
    pub requested: VersionConstraint,
    pub kept: VersionConstraint,
}

/// The single authoritative name -> entry mapping for one resolution run.
pub struct ModuleRegistry {
    site: Site,
    entries: BTreeMap<ModuleName, ModuleEntry>,
    conflicts: Vec<VersionConflict>,
    overrides: Vec<Override>,
}

impl ModuleRegistry {
    pub fn new(site: Site) -> Self {
        ModuleRegistry {
            site,
            entries: BTreeMap::new(),
            conflicts: Vec::new(),
            overrides: Vec::new(),
        }
    }

    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn register(
        &mut self,
        name: ModuleName,
        constraint: VersionConstraint,
        source: Option<SourceSpec>,
    ) -> Result<&ModuleEntry, VersionConflict> {
        self.insert(ModuleEntry::new(name, constraint, source))
    }

    /// Inserts a new entry or merges it into the existing one under the constraint rules.
    /// Conflicts are also kept so that they can be reported together.
    pub fn insert(&mut self, incoming: ModuleEntry) -> Result<&ModuleEntry, VersionConflict> {
        match self.entries.entry(incoming.name.clone()) {
            Entry::Vacant(vacant) => {
                let mut entry = incoming;
                entry.install_path = self.site.install_path(
                    &entry.name,
                    &entry.constraint.version,
                    entry.source.as_ref(),
                    entry.explicit_install_path.as_deref(),
                );
                debug!(
                    "Registered {} {} at {}",
                    entry.name,
                    entry.constraint,
                    entry.install_path.display()
                );
                Ok(vacant.insert(entry))
            }
            Entry::Occupied(occupied) => {
                let existing = occupied.into_mut();
                let merged = match merge(&existing.constraint, &incoming.constraint) {
                    Ok(merged) => merged,
                    Err(conflict) => {
                        let conflict = VersionConflict {
                            module: existing.name.clone(),
                            existing: conflict.existing,
                            incoming: conflict.incoming,
                        };
                        warn!("{}", conflict);
                        existing.status = ModuleStatus::Conflicted;
                        self.conflicts.push(conflict.clone());
                        return Err(conflict);
                    }
                };

                for requested in [&existing.constraint, &incoming.constraint] {
                    if !requested.version.is_arbitrary() && requested.version != merged.version {
                        let overridden = Override {
                            module: existing.name.clone(),
                            requested: requested.clone(),
                            kept: merged.clone(),
                        };
                        warn!(
                            "{} requested {} but {} is kept",
                            overridden.module, overridden.requested, overridden.kept
                        );
                        self.overrides.push(overridden);
                    }
                }

                let incoming_prevails = merged.origin > existing.constraint.origin
                    || (merged.origin == existing.constraint.origin
                        && existing.constraint.version.is_arbitrary()
                        && !incoming.constraint.version.is_arbitrary());

                let ModuleEntry {
                    source,
                    explicit_install_path,
                    dependencies,
                    directives,
                    ..
                } = incoming;
                if source.is_some() && (incoming_prevails || existing.source.is_none()) {
                    existing.source = source;
                }
                if existing.explicit_install_path.is_none() {
                    existing.explicit_install_path = explicit_install_path;
                }
                if existing.directives == BuildDirectives::default() {
                    existing.directives = directives;
                }
                match (&mut existing.dependencies, dependencies) {
                    (Some(known), Some(more)) => known.extend(more),
                    (known @ None, more) => *known = more,
                    (Some(_), None) => {}
                }

                existing.constraint = merged;
                existing.install_path = self.site.install_path(
                    &existing.name,
                    &existing.constraint.version,
                    existing.source.as_ref(),
                    existing.explicit_install_path.as_deref(),
                );
                Ok(existing)
            }
        }
    }

    pub fn get(&self, name: &ModuleName) -> Option<&ModuleEntry> {
        self.entries.get(name)
    }

    pub(crate) fn get_mut(&mut self, name: &ModuleName) -> Option<&mut ModuleEntry> {
        self.entries.get_mut(name)
    }

    pub fn contains(&self, name: &ModuleName) -> bool {
        self.entries.contains_key(name)
    }

    pub fn entries(&self) -> impl Iterator<Item = &ModuleEntry> {
        self.entries.values()
    }

    pub fn conflicts(&self) -> &[VersionConflict] {
        &self.conflicts
    }

    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    /// Locks the standard release set and every dependency of it known so far. Dependencies
    /// discovered later are locked when they are registered.
    pub fn mark_locked(&mut self, names: &BTreeSet<ModuleName>) {
        for name in names {
            if self.contains(name) {
                self.lock_transitively(name);
            } else {
                warn!("Standard module {} is not declared in any specification", name);
            }
        }
    }

    pub fn lock_transitively(&mut self, name: &ModuleName) {
        let mut visited = BTreeSet::new();
        let mut stack = vec![name.clone()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(entry) = self.entries.get_mut(&current) else {
                continue;
            };
            if entry.constraint.origin != Origin::Locked {
                info!("Locking {} at {}", entry.name, entry.constraint.version);
                entry.constraint.origin = Origin::Locked;
            }
            stack.extend(entry.dependency_set().cloned());
        }
    }

    pub(crate) fn into_parts(
        self,
    ) -> (
        Site,
        BTreeMap<ModuleName, ModuleEntry>,
        Vec<VersionConflict>,
        Vec<Override>,
    ) {
        (self.site, self.entries, self.conflicts, self.overrides)
    }
}
