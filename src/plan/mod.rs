pub mod state;
pub mod tracker;

use std::{
    collections::BTreeSet,
    fmt::{Display, Write},
    path::Path,
    str::FromStr,
};

use serde::{Deserialize, Serialize};

use crate::{
    model::{constraint::Origin, ModuleName},
    resolver::{registry::ModuleEntry, ResolvedOrder},
};

/// One of the fixed steps every module goes through, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Download,
    ReleaseSite,
    Patch,
    Sync,
    Build,
}

impl Step {
    pub const ALL: [Step; 5] = [
        Step::Download,
        Step::ReleaseSite,
        Step::Patch,
        Step::Sync,
        Step::Build,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Step::Download => "download",
            Step::ReleaseSite => "release_site",
            Step::Patch => "patch",
            Step::Sync => "sync",
            Step::Build => "build",
        }
    }

    pub fn previous(self) -> Option<Step> {
        let index = Step::ALL.iter().position(|step| *step == self)?;
        index.checked_sub(1).map(|index| Step::ALL[index])
    }
}

impl Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.replace('-', "_");
        Step::ALL
            .into_iter()
            .find(|step| step.as_str() == normalized)
            .ok_or_else(|| {
                format!(
                    "unknown step `{}`, expected one of: download, release-site, patch, sync, build",
                    s
                )
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkKey {
    pub module: ModuleName,
    pub step: Step,
}

impl WorkKey {
    pub fn new(module: ModuleName, step: Step) -> Self {
        WorkKey { module, step }
    }
}

impl Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module, self.step)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub module: ModuleName,
    pub step: Step,
    pub preconditions: BTreeSet<WorkKey>,
}

impl WorkItem {
    pub fn key(&self) -> WorkKey {
        WorkKey::new(self.module.clone(), self.step)
    }
}

impl Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.module, self.step)
    }
}

/// Selects part of a plan. Preconditions outside the selection count as satisfied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepFilter {
    steps: Option<BTreeSet<Step>>,
    only: BTreeSet<ModuleName>,
    exclude: BTreeSet<ModuleName>,
}

impl StepFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only_step(step: Step) -> Self {
        StepFilter {
            steps: Some(BTreeSet::from([step])),
            ..Self::default()
        }
    }

    /// Every step up to and including `step`.
    pub fn through(step: Step) -> Self {
        StepFilter {
            steps: Some(Step::ALL.into_iter().filter(|s| *s <= step).collect()),
            ..Self::default()
        }
    }

    pub fn with_modules(
        mut self,
        only: impl IntoIterator<Item = ModuleName>,
        exclude: impl IntoIterator<Item = ModuleName>,
    ) -> Self {
        self.only = only.into_iter().collect();
        self.exclude = exclude.into_iter().collect();
        self
    }

    pub fn includes(&self, key: &WorkKey) -> bool {
        self.steps
            .as_ref()
            .map_or(true, |steps| steps.contains(&key.step))
            && (self.only.is_empty() || self.only.contains(&key.module))
            && !self.exclude.contains(&key.module)
    }
}

/// The work items of a resolved order, dependencies first, each module's steps in order.
#[derive(Clone)]
pub struct BuildPlan {
    order: ResolvedOrder,
    items: Vec<WorkItem>,
}

impl BuildPlan {
    /// Emits all five steps of every module. The first step of a module requires the build
    /// of each direct dependency, and every later step requires the step before it.
    pub fn emit(order: ResolvedOrder) -> BuildPlan {
        let mut items = Vec::with_capacity(order.modules().len() * Step::ALL.len());
        for entry in order.modules() {
            for step in Step::ALL {
                let mut preconditions: BTreeSet<WorkKey> = entry
                    .dependency_set()
                    .map(|dependency| WorkKey::new(dependency.clone(), Step::Build))
                    .collect();
                if let Some(previous) = step.previous() {
                    preconditions.insert(WorkKey::new(entry.name.clone(), previous));
                }
                items.push(WorkItem {
                    module: entry.name.clone(),
                    step,
                    preconditions,
                });
            }
        }
        BuildPlan { order, items }
    }

    /// Keeps the selected items and drops the preconditions that point outside the selection.
    pub fn filtered(&self, filter: &StepFilter) -> BuildPlan {
        let selected: BTreeSet<WorkKey> = self
            .items
            .iter()
            .map(WorkItem::key)
            .filter(|key| filter.includes(key))
            .collect();
        let items = self
            .items
            .iter()
            .filter(|item| selected.contains(&item.key()))
            .map(|item| WorkItem {
                module: item.module.clone(),
                step: item.step,
                preconditions: item
                    .preconditions
                    .intersection(&selected)
                    .cloned()
                    .collect(),
            })
            .collect();
        BuildPlan {
            order: self.order.clone(),
            items,
        }
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn order(&self) -> &ResolvedOrder {
        &self.order
    }

    pub fn module(&self, name: &ModuleName) -> Option<&ModuleEntry> {
        self.order.get(name)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string(&self.document())
    }

    fn document(&self) -> PlanDocument<'_> {
        let modules = self
            .order
            .modules()
            .iter()
            .map(|entry| ModuleDocument {
                name: &entry.name,
                version: entry.constraint.version.to_string(),
                origin: entry.constraint.origin,
                variable: &entry.variable,
                install_path: &entry.install_path,
                source: entry.source.as_ref().map(ToString::to_string),
                dependencies: entry.dependency_set().collect(),
                steps: self
                    .items
                    .iter()
                    .filter(|item| item.module == entry.name)
                    .map(|item| item.step)
                    .collect(),
            })
            .collect();
        let overrides = self
            .order
            .overrides()
            .iter()
            .map(|o| OverrideDocument {
                module: &o.module,
                requested: o.requested.to_string(),
                kept: o.kept.to_string(),
            })
            .collect();
        PlanDocument { modules, overrides }
    }
}

impl Display for BuildPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let document = self.document();
        for (index, module) in document.modules.iter().enumerate() {
            if module.steps.is_empty() {
                continue;
            }
            let mut steps = String::new();
            for (i, step) in module.steps.iter().enumerate() {
                if i > 0 {
                    steps.push_str(", ");
                }
                write!(steps, "{}", step)?;
            }
            writeln!(
                f,
                "{:>3}. {} {} ({}) -> {}",
                index + 1,
                module.name,
                module.version,
                module.origin,
                module.install_path.display()
            )?;
            writeln!(f, "       {}", steps)?;
        }
        for o in &document.overrides {
            writeln!(f, "note: {} requested {}, kept {}", o.module, o.requested, o.kept)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct PlanDocument<'a> {
    modules: Vec<ModuleDocument<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    overrides: Vec<OverrideDocument<'a>>,
}

#[derive(Serialize)]
struct ModuleDocument<'a> {
    name: &'a ModuleName,
    version: String,
    origin: Origin,
    variable: &'a str,
    install_path: &'a Path,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    dependencies: Vec<&'a ModuleName>,
    steps: Vec<Step>,
}

#[derive(Serialize)]
struct OverrideDocument<'a> {
    module: &'a ModuleName,
    requested: String,
    kept: String,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    use std::path::Path;

    use pretty_assertions::assert_eq;

    use crate::{
        model::spec::Specification,
        resolver::{
            graph::{Introspection, Introspector},
            Resolver,
        },
        site::{Site, SiteSettings},
    };

    pub(crate) const SCENARIO: &str = r#"
modules:
  base:
    standard: true
    git: { url: https://example.com/base, tag: R1 }
    dependencies: []
  moduleA:
    git: { url: https://example.com/moduleA, tag: R1 }
    dependencies: [base]
  moduleB:
    git: { url: https://example.com/moduleB, tag: R1 }
    dependencies: [moduleA]
  other:
    git: { url: https://example.com/other, tag: R1 }
    dependencies: [base]
"#;

    fn no_introspection(entry: &ModuleEntry) -> anyhow::Result<Introspection> {
        anyhow::bail!("unexpected introspection of {}", entry.name)
    }

    pub(crate) fn plan_for(yaml: &str) -> BuildPlan {
        let specification =
            Specification::from_documents([(Path::new("test.yaml"), yaml)]).unwrap();
        let site = Site::new(SiteSettings::default()).unwrap();
        let introspector: &dyn Introspector = &no_introspection;
        BuildPlan::emit(
            Resolver::resolve_specification(&specification, site, introspector).unwrap(),
        )
    }

    fn keys(plan: &BuildPlan) -> Vec<String> {
        plan.items().iter().map(ToString::to_string).collect()
    }

    #[test]
    fn steps_parse_from_cli_names() {
        assert_eq!("release-site".parse::<Step>(), Ok(Step::ReleaseSite));
        assert_eq!("build".parse::<Step>(), Ok(Step::Build));
        assert!("compile".parse::<Step>().is_err());
        assert_eq!(Step::Download.previous(), None);
        assert_eq!(Step::Build.previous(), Some(Step::Sync));
    }

    #[test]
    fn every_module_gets_five_ordered_steps() {
        let plan = plan_for(SCENARIO);
        assert_eq!(
            keys(&plan),
            vec![
                "base:download",
                "base:release_site",
                "base:patch",
                "base:sync",
                "base:build",
                "moduleA:download",
                "moduleA:release_site",
                "moduleA:patch",
                "moduleA:sync",
                "moduleA:build",
                "moduleB:download",
                "moduleB:release_site",
                "moduleB:patch",
                "moduleB:sync",
                "moduleB:build",
                "other:download",
                "other:release_site",
                "other:patch",
                "other:sync",
                "other:build",
            ]
        );
    }

    #[test]
    fn dependency_builds_precede_dependents() {
        let plan = plan_for(SCENARIO);
        let position = |key: &WorkKey| {
            plan.items()
                .iter()
                .position(|item| &item.key() == key)
                .unwrap()
        };
        for (index, item) in plan.items().iter().enumerate() {
            for precondition in &item.preconditions {
                assert!(position(precondition) < index, "{} before {}", precondition, item);
            }
        }
        let download_b = &plan.items()[10];
        assert_eq!(
            download_b.preconditions,
            BTreeSet::from([WorkKey::new(ModuleName::from("moduleA"), Step::Build)])
        );
    }

    #[test]
    fn repeated_resolution_is_byte_identical() {
        let first = plan_for(SCENARIO);
        let second = plan_for(SCENARIO);
        assert_eq!(first.to_toml().unwrap(), second.to_toml().unwrap());
        assert_eq!(first.to_string(), second.to_string());
    }

    #[test]
    fn filtering_drops_preconditions_outside_the_selection() {
        let plan = plan_for(SCENARIO).filtered(&StepFilter::only_step(Step::Download));
        assert_eq!(
            keys(&plan),
            vec![
                "base:download",
                "moduleA:download",
                "moduleB:download",
                "other:download"
            ]
        );
        assert!(plan.items().iter().all(|item| item.preconditions.is_empty()));

        let plan = plan_for(SCENARIO).filtered(
            &StepFilter::through(Step::Patch)
                .with_modules([], [ModuleName::from("other")]),
        );
        assert_eq!(plan.items().len(), 9);
        assert!(plan.items().iter().all(|item| item.step <= Step::Patch));
    }

    #[test]
    fn toml_output_lists_modules_in_order() {
        let plan = plan_for(SCENARIO);
        let document: toml::Value = toml::from_str(&plan.to_toml().unwrap()).unwrap();
        let names: Vec<&str> = document["modules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|module| module["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["base", "moduleA", "moduleB", "other"]);
        assert_eq!(document["modules"][0]["origin"].as_str(), Some("locked"));
    }
}
