use std::{
    error::Error,
    fmt::Display,
    path::{Path, PathBuf},
    sync::Arc,
};

use log::{debug, error, info, warn};
use tokio::runtime::Runtime;

use crate::{
    executor::{self, local::LocalExecutor, RunOptions},
    inspect::{self, TreeInspector},
    introspect::ReleaseFileIntrospector,
    model::{spec::Specification, ModuleName},
    plan::{
        state::{CompletionStore, FileStore},
        tracker::{self, ExecutionReport, StateTracker},
        BuildPlan, Step, StepFilter,
    },
    resolver::{ResolvedOrder, Resolver},
    site::{Site, SiteSettings},
};

use super::args::PlanFormat;

/// Progress of one module for its current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleProgress {
    pub name: ModuleName,
    pub version: String,
    pub install_path: PathBuf,
    pub completed: Vec<Step>,
}

impl Display for ModuleProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: ", self.name, self.version)?;
        match self.completed.last() {
            None => write!(f, "not started")?,
            Some(Step::Build) if self.completed.len() == Step::ALL.len() => write!(f, "built")?,
            Some(_) => {
                let steps: Vec<&str> = self.completed.iter().map(|step| step.as_str()).collect();
                write!(f, "{}", steps.join(", "))?
            }
        }
        write!(f, " ({})", self.install_path.display())
    }
}

/// Handler shared by every command
/// Loads the specification files, introspects the module trees and resolves the build order
pub fn do_resolve<P: AsRef<Path>>(
    spec_files: &[P],
    settings: &SiteSettings,
) -> Result<ResolvedOrder, Box<dyn Error>> {
    if spec_files.is_empty() {
        return Err("No specification files given, use --spec or PIB_SPEC_FILES".into());
    }
    let specification = Specification::from_files(spec_files)?;
    let site = Site::new(settings.clone())?.with_base_version(specification.base_version());
    let introspector = ReleaseFileIntrospector::new(site.clone());

    match Resolver::resolve_specification(&specification, site, &introspector) {
        Ok(order) => Ok(order),
        Err(err) => {
            for cause in err.errors() {
                error!("{}", cause);
            }
            Err(err.into())
        }
    }
}

/// Handler to inspect command
/// Modules declared in the specification files, if any, are listed as standard modules
pub fn do_inspect<P: AsRef<Path>>(
    path: &Path,
    spec_files: &[P],
    settings: &SiteSettings,
    download: bool,
) -> Result<String, Box<dyn Error>> {
    let specification = if spec_files.is_empty() {
        Specification::default()
    } else {
        Specification::from_files(spec_files)?
    };
    let site = Site::new(settings.clone())?.with_base_version(specification.base_version());
    let found = TreeInspector::new(site.clone(), download).inspect(path)?;
    info!("{} depends on {} module(s)", path.display(), found.len());
    Ok(inspect::to_specification_yaml(&found, &specification, &site)?)
}

/// Handler to plan command
pub fn do_plan(
    order: ResolvedOrder,
    filter: &StepFilter,
    format: PlanFormat,
) -> Result<String, Box<dyn Error>> {
    let plan = BuildPlan::emit(order).filtered(filter);
    debug!("Plan has {} work item(s)", plan.items().len());
    Ok(match format {
        PlanFormat::Text => plan.to_string(),
        PlanFormat::Toml => plan.to_toml()?,
    })
}

/// Handler to the step commands
/// Runs the selected part of the plan, skipping steps already complete for the current
/// module versions
pub fn do_run(
    order: ResolvedOrder,
    filter: &StepFilter,
    state_dir: &Path,
    options: RunOptions,
) -> Result<ExecutionReport, Box<dyn Error>> {
    let plan = BuildPlan::emit(order).filtered(filter);
    let local = Arc::new(LocalExecutor::new(plan.order().clone()));
    let store = FileStore::open(state_dir)?;
    info!("Recording progress in {}", store.path().display());
    let tracker = Arc::new(StateTracker::new(plan, store)?);

    let runtime = Runtime::new()?;
    let report = runtime.block_on(executor::run(tracker, local, options));
    log_report(&report);
    Ok(report)
}

/// Handler to status command
pub fn do_status(
    order: &ResolvedOrder,
    state_dir: &Path,
    module: Option<&ModuleName>,
) -> Result<Vec<ModuleProgress>, Box<dyn Error>> {
    if let Some(module) = module {
        if order.get(module).is_none() {
            return Err(format!("Module {} is not part of the resolved order", module).into());
        }
    }
    let store = FileStore::open(state_dir)?;
    Ok(order
        .modules()
        .iter()
        .filter(|entry| module.map_or(true, |module| module == &entry.name))
        .map(|entry| {
            ModuleProgress {
                name: entry.name.clone(),
                version: entry.constraint.version.to_string(),
                install_path: entry.install_path.clone(),
                completed: tracker::completed_steps(&store, &entry.name, &entry.fingerprint()),
            }
        })
        .collect())
}

/// Handler to clean-state command
pub fn do_clean_state(state_dir: &Path) -> Result<(), Box<dyn Error>> {
    if !state_dir.exists() {
        info!("{} does not exist, nothing to do", state_dir.display());
        return Ok(());
    }
    FileStore::open(state_dir)?.clear()?;
    Ok(())
}

fn log_report(report: &ExecutionReport) {
    info!(
        "{} step(s) done, {} already complete",
        report.done.len(),
        report.skipped.len()
    );
    if !report.failed.is_empty() {
        error!("{} step(s) failed", report.failed.len());
    }
    for blocked in &report.blocked {
        warn!("{}", blocked);
    }
    if !report.pending.is_empty() {
        warn!("{} step(s) were not attempted", report.pending.len());
    }
}
