use std::{
    error::Error,
    path::{Path, PathBuf},
};

use crate::{
    cli::{
        args::PlanFormat,
        command_handlers::{
            do_clean_state, do_inspect, do_plan, do_resolve, do_run, do_status, ModuleProgress,
        },
    },
    executor::RunOptions,
    model::ModuleName,
    plan::{tracker::ExecutionReport, Step, StepFilter},
    resolver::ResolvedOrder,
    site::SiteSettings,
};

mod builder;

pub use builder::PibBuilder;

pub struct Pib {
    spec_files: Vec<PathBuf>,
    site: SiteSettings,
    state_directory: PathBuf,
    options: RunOptions,
    only: Vec<ModuleName>,
    exclude: Vec<ModuleName>,
}

/// Which steps a run or plan covers.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Steps {
    /// Every step of every module.
    All,
    /// One step of every module, for instance only downloads.
    Only(Step),
    /// Every step up to and including the given one.
    Through(Step),
}

impl Pib {
    pub fn builder() -> PibBuilder {
        PibBuilder::default()
    }

    pub fn state_directory(&self) -> &PathBuf {
        &self.state_directory
    }

    /// Loads the specification and resolves the build order
    pub fn resolve(&self) -> Result<ResolvedOrder, Box<dyn Error>> {
        do_resolve(&self.spec_files, &self.site)
    }

    /// Renders the plan for the selected steps without running anything
    pub fn plan(&self, steps: Steps, format: PlanFormat) -> Result<String, Box<dyn Error>> {
        do_plan(self.resolve()?, &self.filter(steps), format)
    }

    /// Runs the selected steps, skipping the ones already recorded as complete
    pub fn run(&self, steps: Steps) -> Result<ExecutionReport, Box<dyn Error>> {
        do_run(
            self.resolve()?,
            &self.filter(steps),
            &self.state_directory,
            self.options,
        )
    }

    /// Completed steps of each module, or of a single one
    pub fn status(&self, module: Option<&str>) -> Result<Vec<ModuleProgress>, Box<dyn Error>> {
        let module = module.map(ModuleName::from);
        do_status(&self.resolve()?, &self.state_directory, module.as_ref())
    }

    /// Specification document listing the modules the tree at `path` depends on
    pub fn inspect(&self, path: &Path, download: bool) -> Result<String, Box<dyn Error>> {
        do_inspect(path, &self.spec_files, &self.site, download)
    }

    /// Forget every recorded completion
    pub fn clean_state(&self) -> Result<(), Box<dyn Error>> {
        do_clean_state(&self.state_directory)
    }

    fn filter(&self, steps: Steps) -> StepFilter {
        let filter = match steps {
            Steps::All => StepFilter::all(),
            Steps::Only(step) => StepFilter::only_step(step),
            Steps::Through(step) => StepFilter::through(step),
        };
        filter.with_modules(self.only.iter().cloned(), self.exclude.iter().cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::model::{spec::Specification, Revision};

    struct Fixture {
        _dir: tempfile::TempDir,
        root: PathBuf,
        pib: Pib,
    }

    /// Two local module trees with explicit dependencies, so nothing is fetched or introspected.
    fn fixture(extra: impl FnOnce(PibBuilder) -> PibBuilder) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        for tree in ["base", "ioc"] {
            std::fs::create_dir_all(root.join(tree)).unwrap();
        }
        let spec = root.join("ioc.yaml");
        std::fs::write(
            &spec,
            format!(
                r#"
modules:
  epics-base:
    standard: true
    version: R7.0.2-2.0
    path: {base}
    dependencies: []
  ioc:
    path: {ioc}
    dependencies: [epics-base]
"#,
                base = root.join("base").display(),
                ioc = root.join("ioc").display(),
            ),
        )
        .unwrap();
        let pib = extra(
            Pib::builder()
                .spec_files([spec])
                .site(SiteSettings {
                    top: root.join("epics"),
                    ..SiteSettings::default()
                })
                .state_directory(root.join("state")),
        )
        .try_build()
        .unwrap();
        Fixture {
            _dir: dir,
            root,
            pib,
        }
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn plan_lists_modules_in_build_order() {
        let fixture = fixture(|builder| builder);
        let plan = fixture
            .pib
            .plan(Steps::Through(Step::Download), PlanFormat::Text)
            .unwrap();
        let base = plan.find("epics-base").unwrap();
        let ioc = plan.find("ioc ").unwrap();
        assert!(base < ioc);
        assert!(plan.contains("download"));
        assert!(!plan.contains("release_site"));
    }

    #[test]
    fn run_records_progress_and_skips_on_rerun() {
        let fixture = fixture(|builder| builder.jobs(2));
        let report = fixture.pib.run(Steps::Through(Step::Sync)).unwrap();
        assert!(report.is_success());
        assert_eq!(report.done.len(), 8);
        assert!(read(&fixture.root.join("ioc/configure/RELEASE.local"))
            .contains(&format!("EPICS_BASE={}", fixture.root.join("base").display())));

        let status = fixture.pib.status(Some("ioc")).unwrap();
        assert_eq!(status.len(), 1);
        assert_eq!(
            status[0].completed,
            vec![Step::Download, Step::ReleaseSite, Step::Patch, Step::Sync]
        );

        let report = fixture.pib.run(Steps::Through(Step::Sync)).unwrap();
        assert!(report.done.is_empty());
        assert_eq!(report.skipped.len(), 8);

        fixture.pib.clean_state().unwrap();
        let status = fixture.pib.status(None).unwrap();
        assert!(status.iter().all(|module| module.completed.is_empty()));
    }

    #[test]
    fn status_only_counts_steps_of_the_current_version() {
        let fixture = fixture(|builder| builder);
        let report = fixture.pib.run(Steps::Only(Step::Download)).unwrap();
        assert_eq!(report.done.len(), 2);

        let spec = fixture.root.join("ioc.yaml");
        let bumped = read(&spec).replace("R7.0.2-2.0", "R7.0.3-1.0");
        std::fs::write(&spec, bumped).unwrap();
        let status = fixture.pib.status(None).unwrap();
        let base = status
            .iter()
            .find(|module| module.name.as_str() == "epics-base")
            .unwrap();
        assert_eq!(base.version, "R7.0.3-1.0");
        assert!(base.completed.is_empty());
        let ioc = status
            .iter()
            .find(|module| module.name.as_str() == "ioc")
            .unwrap();
        assert_eq!(ioc.completed, vec![Step::Download]);
    }

    #[test]
    fn inspect_lists_what_the_ioc_refers_to() {
        let fixture = fixture(|builder| builder);
        let epics = fixture.root.join("epics");
        std::fs::create_dir_all(fixture.root.join("ioc/configure")).unwrap();
        std::fs::write(
            fixture.root.join("ioc/configure/RELEASE"),
            format!(
                "EPICS_BASE = {top}/base/R7.0.2-2.0\nASYN = {top}/R7.0.2-2.0/modules/asyn/R4.39-1.0.1\n",
                top = epics.display()
            ),
        )
        .unwrap();

        let document = fixture
            .pib
            .inspect(&fixture.root.join("ioc"), false)
            .unwrap();
        let inspected =
            Specification::from_documents([(Path::new("inspected.yaml"), document.as_str())])
                .unwrap();
        assert_eq!(
            inspected.standard.into_iter().collect::<Vec<_>>(),
            vec![ModuleName::from("epics-base")]
        );
        assert_eq!(
            inspected.modules[&ModuleName::from("asyn")].version,
            Revision::pinned("R4.39-1.0.1")
        );
    }

    #[test]
    fn excluded_modules_are_left_alone() {
        let fixture = fixture(|builder| builder.exclude(["ioc"]));
        let report = fixture.pib.run(Steps::Only(Step::ReleaseSite)).unwrap();
        assert_eq!(report.done.len(), 1);
        assert!(fixture.root.join("base/RELEASE_SITE").exists());
        assert!(!fixture.root.join("ioc/RELEASE_SITE").exists());
    }

    #[test]
    fn unknown_module_status_is_an_error() {
        let fixture = fixture(|builder| builder);
        assert!(fixture.pib.status(Some("motor")).is_err());
    }
}
