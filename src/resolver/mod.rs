pub mod graph;
pub mod registry;

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, info};
use thiserror::Error;

use crate::{
    model::{spec::Specification, ModuleName},
    site::Site,
};

use self::{
    graph::{DependencyGraph, DependencyGraphBuilder, Introspector},
    registry::{ModuleEntry, ModuleStatus, Override, VersionConflict},
};

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error(transparent)]
    VersionConflict(#[from] VersionConflict),
    #[error("Cyclic dependency: {}", display_path(.path))]
    CyclicDependency { path: Vec<ModuleName> },
    #[error("Unknown module {module}{}", display_required_by(.required_by))]
    UnknownModule {
        module: ModuleName,
        required_by: Option<ModuleName>,
    },
    #[error("Could not determine the dependencies of {module}: {reason:#}")]
    Introspection {
        module: ModuleName,
        reason: anyhow::Error,
    },
    #[error("Resolution failed with {} error(s):\n{}", .0.len(), display_errors(.0))]
    ResolutionFailed(Vec<ResolveError>),
}

fn display_path(path: &[ModuleName]) -> String {
    path.iter()
        .map(ModuleName::as_str)
        .collect::<Vec<_>>()
        .join(" -> ")
}

fn display_required_by(required_by: &Option<ModuleName>) -> String {
    match required_by {
        Some(name) => format!(" required by {}", name),
        None => String::new(),
    }
}

fn display_errors(errors: &[ResolveError]) -> String {
    errors
        .iter()
        .map(|error| format!("  {}", error))
        .collect::<Vec<_>>()
        .join("\n")
}

impl ResolveError {
    /// The individual errors, with `ResolutionFailed` flattened.
    pub fn errors(&self) -> Vec<&ResolveError> {
        match self {
            ResolveError::ResolutionFailed(errors) => {
                errors.iter().flat_map(ResolveError::errors).collect()
            }
            other => vec![other],
        }
    }
}

/// Modules in build order, dependencies before dependents.
#[derive(Clone)]
pub struct ResolvedOrder {
    site: Site,
    modules: Vec<ModuleEntry>,
    overrides: Vec<Override>,
}

impl ResolvedOrder {
    pub fn site(&self) -> &Site {
        &self.site
    }

    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }

    pub fn names(&self) -> impl Iterator<Item = &ModuleName> {
        self.modules.iter().map(|entry| &entry.name)
    }

    pub fn get(&self, name: &ModuleName) -> Option<&ModuleEntry> {
        self.modules.iter().find(|entry| &entry.name == name)
    }

    /// Pinned requests that lost to a stronger constraint.
    pub fn overrides(&self) -> &[Override] {
        &self.overrides
    }

    /// Every module `name` depends on, directly or not, in build order.
    pub fn transitive_dependencies(&self, name: &ModuleName) -> Vec<&ModuleEntry> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&ModuleName> = self
            .get(name)
            .map(|entry| entry.dependency_set().collect())
            .unwrap_or_default();
        while let Some(current) = stack.pop() {
            if seen.insert(current) {
                if let Some(entry) = self.get(current) {
                    stack.extend(entry.dependency_set());
                }
            }
        }
        self.modules
            .iter()
            .filter(|entry| seen.contains(&entry.name))
            .collect()
    }
}

pub struct Resolver;

impl Resolver {
    /// Loads, introspects and resolves a specification in one go.
    pub fn resolve_specification<I>(
        specification: &Specification,
        site: Site,
        introspector: &I,
    ) -> Result<ResolvedOrder, ResolveError>
    where
        I: Introspector + ?Sized,
    {
        let graph =
            DependencyGraphBuilder::from_specification(specification, site).build(introspector)?;
        Self::resolve(graph)
    }

    /// Checks the graph for conflicts and cycles, reporting all of them at once, then
    /// linearizes it. Modules that become ready together are ordered by name.
    pub fn resolve(graph: DependencyGraph) -> Result<ResolvedOrder, ResolveError> {
        info!("Resolving build order of {} module(s)", graph.len());
        let mut errors: Vec<ResolveError> = graph
            .conflicts()
            .iter()
            .cloned()
            .map(ResolveError::VersionConflict)
            .collect();
        errors.extend(
            find_cycles(&graph)
                .into_iter()
                .map(|path| ResolveError::CyclicDependency { path }),
        );
        if !errors.is_empty() {
            return Err(ResolveError::ResolutionFailed(errors));
        }

        let order = linearize(&graph);
        let (site, mut nodes, _, overrides) = graph.into_parts();
        let modules = order
            .into_iter()
            .filter_map(|name| nodes.remove(&name))
            .map(|mut entry| {
                entry.status = ModuleStatus::Resolved;
                entry
            })
            .collect::<Vec<_>>();
        debug!(
            "Build order: {}",
            modules
                .iter()
                .map(|entry| entry.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(ResolvedOrder {
            site,
            modules,
            overrides,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Every back edge found by a depth-first search in name order, as the path from the
/// repeated module back to itself.
fn find_cycles(graph: &DependencyGraph) -> Vec<Vec<ModuleName>> {
    let mut marks = BTreeMap::new();
    let mut path = Vec::new();
    let mut cycles = Vec::new();
    for entry in graph.modules() {
        visit(graph, &entry.name, &mut marks, &mut path, &mut cycles);
    }
    cycles
}

fn visit<'a>(
    graph: &'a DependencyGraph,
    name: &'a ModuleName,
    marks: &mut BTreeMap<&'a ModuleName, Mark>,
    path: &mut Vec<&'a ModuleName>,
    cycles: &mut Vec<Vec<ModuleName>>,
) {
    match marks.get(name) {
        Some(Mark::Done) => return,
        Some(Mark::InProgress) => {
            let start = path.iter().position(|n| *n == name).unwrap_or(0);
            let mut cycle: Vec<ModuleName> = path[start..].iter().map(|n| (*n).clone()).collect();
            cycle.push(name.clone());
            cycles.push(cycle);
            return;
        }
        None => {}
    }
    marks.insert(name, Mark::InProgress);
    path.push(name);
    for dependency in graph.dependencies(name) {
        visit(graph, dependency, marks, path, cycles);
    }
    path.pop();
    marks.insert(name, Mark::Done);
}

fn linearize(graph: &DependencyGraph) -> Vec<ModuleName> {
    let mut remaining: BTreeMap<&ModuleName, usize> = BTreeMap::new();
    let mut dependents: BTreeMap<&ModuleName, Vec<&ModuleName>> = BTreeMap::new();
    for entry in graph.modules() {
        remaining.insert(&entry.name, entry.dependency_set().count());
        for dependency in entry.dependency_set() {
            dependents.entry(dependency).or_default().push(&entry.name);
        }
    }

    let mut ready: BTreeSet<&ModuleName> = remaining
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut order = Vec::with_capacity(remaining.len());
    while let Some(next) = ready.pop_first() {
        order.push(next.clone());
        for dependent in dependents.get(next).into_iter().flatten() {
            if let Some(count) = remaining.get_mut(dependent) {
                *count -= 1;
                if *count == 0 {
                    ready.insert(*dependent);
                }
            }
        }
    }
    order
}
