use std::{
    collections::BTreeMap,
    fmt::Write,
    path::Path,
    process::Command,
};

use anyhow::{anyhow, bail, Context};
use log::{debug, info, warn};

use crate::{
    git::GitFetcher,
    model::spec::{Patch, PatchMethod, SourceSpec},
    plan::{Step, WorkItem},
    resolver::{registry::ModuleEntry, ResolvedOrder},
};

use super::BuildExecutor;

pub const RELEASE_SITE: &str = "RELEASE_SITE";
pub const RELEASE_LOCAL: &str = "configure/RELEASE.local";
const FAILURE_TAIL_LINES: usize = 20;

/// Runs each step against the module trees on this machine.
pub struct LocalExecutor {
    order: ResolvedOrder,
    fetcher: GitFetcher,
}

impl LocalExecutor {
    pub fn new(order: ResolvedOrder) -> Self {
        LocalExecutor {
            order,
            fetcher: GitFetcher::new(),
        }
    }

    fn download(&self, entry: &ModuleEntry) -> anyhow::Result<()> {
        match &entry.source {
            Some(SourceSpec::Git(git)) => {
                if is_populated(&entry.install_path)? {
                    info!(
                        "{} already exists at {}, assuming it is up to date",
                        entry.name,
                        entry.install_path.display()
                    );
                    return Ok(());
                }
                if !git.args.is_empty() {
                    warn!("Ignoring extra git arguments `{}` of {}", git.args, entry.name);
                }
                self.fetcher.checkout(git, &entry.install_path)?;
                Ok(())
            }
            Some(SourceSpec::Local { path }) if path.is_dir() => {
                debug!("{} uses the local tree {}", entry.name, path.display());
                Ok(())
            }
            Some(SourceSpec::Local { path }) => {
                bail!("local source {} of {} does not exist", path.display(), entry.name)
            }
            None => bail!("{} has no source to download", entry.name),
        }
    }

    fn release_site(&self, entry: &ModuleEntry) -> anyhow::Result<()> {
        let mut contents = String::new();
        for (variable, value) in self.order.site().release_variables() {
            writeln!(contents, "{variable}={value}")?;
        }
        let path = entry.install_path.join(RELEASE_SITE);
        write_file(&path, &contents)
    }

    fn patch(&self, entry: &ModuleEntry) -> anyhow::Result<()> {
        for patch in &entry.directives.patches {
            apply_patch(&entry.install_path, patch)
                .with_context(|| format!("could not apply patch to {}", patch.dest_file.display()))?;
        }
        Ok(())
    }

    /// Points every dependency variable at the install path of the resolved version.
    fn sync(&self, entry: &ModuleEntry) -> anyhow::Result<()> {
        let mut variables = BTreeMap::from([(
            "EPICS_BASE".to_string(),
            self.order.site().epics_base().display().to_string(),
        )]);
        for dependency in self.order.transitive_dependencies(&entry.name) {
            variables.insert(
                dependency.variable.clone(),
                dependency.install_path.display().to_string(),
            );
        }

        let mut contents = String::from("# Generated by pib, changes will be overwritten\n");
        for (variable, value) in &variables {
            debug!("{}: {}={}", entry.name, variable, value);
            writeln!(contents, "{variable}={value}")?;
        }
        write_file(&entry.install_path.join(RELEASE_LOCAL), &contents)
    }

    fn build(&self, entry: &ModuleEntry) -> anyhow::Result<()> {
        let make = &entry.directives.make;
        let mut command = Command::new("make");
        command
            .arg(format!("-j{}", make.parallel))
            .args(&make.args)
            .current_dir(&entry.install_path);
        info!("Building {} in {}", entry.name, entry.install_path.display());
        let output = command
            .output()
            .with_context(|| format!("could not run make for {}", entry.name))?;
        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            bail!(
                "make exited with {}:\n{}",
                output.status,
                tail(&combined, FAILURE_TAIL_LINES)
            );
        }
        Ok(())
    }
}

impl BuildExecutor for LocalExecutor {
    fn execute(&self, item: &WorkItem) -> anyhow::Result<()> {
        let entry = self
            .order
            .get(&item.module)
            .ok_or_else(|| anyhow!("{} is not part of the resolved order", item.module))?;
        match item.step {
            Step::Download => self.download(entry),
            Step::ReleaseSite => self.release_site(entry),
            Step::Patch => self.patch(entry),
            Step::Sync => self.sync(entry),
            Step::Build => self.build(entry),
        }
    }
}

fn is_populated(path: &Path) -> anyhow::Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    Ok(std::fs::read_dir(path)?.next().is_some())
}

fn write_file(path: &Path, contents: &str) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    debug!("Writing {}", path.display());
    std::fs::write(path, contents).with_context(|| format!("could not write {}", path.display()))
}

fn apply_patch(root: &Path, patch: &Patch) -> anyhow::Result<()> {
    info!("Applying patch to {}: {}", root.display(), patch.description);
    match patch.method {
        PatchMethod::Replace => {
            let path = root.join(&patch.dest_file);
            let mut contents = dedent(&patch.contents);
            contents.push('\n');
            write_file(&path, &contents)?;
            if let Some(mode) = patch.mode {
                set_mode(&path, mode)?;
            }
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(path: &Path, mode: u32) -> anyhow::Result<()> {
    warn!("Cannot set mode {:o} on {}", mode, path.display());
    Ok(())
}

/// Removes the whitespace prefix common to all non-blank lines.
fn dedent(text: &str) -> String {
    let prefix = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| &line[..line.len() - line.trim_start().len()])
        .reduce(|common, prefix| {
            let shared = common
                .chars()
                .zip(prefix.chars())
                .take_while(|(a, b)| a == b)
                .map(|(a, _)| a.len_utf8())
                .sum::<usize>();
            &common[..shared]
        })
        .unwrap_or_default();
    text.lines()
        .map(|line| line.strip_prefix(prefix).unwrap_or_else(|| line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn tail(text: &str, lines: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    all[all.len().saturating_sub(lines)..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use pretty_assertions::assert_eq;

    use crate::{
        model::spec::Specification,
        resolver::{graph::Introspection, Resolver},
        site::{Site, SiteSettings},
    };

    fn no_introspection(entry: &ModuleEntry) -> anyhow::Result<Introspection> {
        anyhow::bail!("unexpected introspection of {}", entry.name)
    }

    fn resolve(top: &Path, yaml: &str) -> ResolvedOrder {
        let specification =
            Specification::from_documents([(Path::new("test.yaml"), yaml)]).unwrap();
        let site = Site::new(SiteSettings {
            top: top.to_path_buf(),
            ..SiteSettings::default()
        })
        .unwrap()
        .with_base_version(specification.base_version());
        Resolver::resolve_specification(&specification, site, &no_introspection).unwrap()
    }

    fn item(module: &str, step: Step) -> WorkItem {
        WorkItem {
            module: module.into(),
            step,
            preconditions: Default::default(),
        }
    }

    #[test]
    fn dedent_removes_common_indentation() {
        assert_eq!(dedent("    a\n      b\n\n    c"), "a\n  b\n\nc");
        assert_eq!(dedent("a\n  b"), "a\n  b");
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("1\n2\n3\n4", 2), "3\n4");
        assert_eq!(tail("1", 5), "1");
    }

    #[test]
    fn local_steps_write_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let top = dir.path().join("epics");
        let ioc = dir.path().join("ioc");
        std::fs::create_dir_all(&ioc).unwrap();
        let yaml = format!(
            r#"
modules:
  epics-base:
    standard: true
    git: {{ url: https://example.com/epics-base, tag: R7.0.2-2.0 }}
    dependencies: []
  asyn:
    git: {{ url: https://example.com/asyn, tag: R4.39 }}
    dependencies: [epics-base]
  ioc:
    path: {}
    dependencies: [asyn]
    patches:
      - description: site config
        dest_file: configure/CONFIG_SITE
        contents: |
          CHECK_RELEASE = NO
          CROSS_COMPILER_TARGET_ARCHS =
        mode: 0o644
"#,
            ioc.display()
        );
        let executor = LocalExecutor::new(resolve(&top, &yaml));

        executor.execute(&item("ioc", Step::Download)).unwrap();
        executor.execute(&item("ioc", Step::ReleaseSite)).unwrap();
        executor.execute(&item("ioc", Step::Patch)).unwrap();
        executor.execute(&item("ioc", Step::Sync)).unwrap();

        let release_site = std::fs::read_to_string(ioc.join(RELEASE_SITE)).unwrap();
        assert!(release_site.contains(&format!(
            "EPICS_BASE={}",
            top.join("base/R7.0.2-2.0").display()
        )));
        assert!(release_site.contains("BASE_MODULE_VERSION=R7.0.2-2.0"));

        assert_eq!(
            std::fs::read_to_string(ioc.join("configure/CONFIG_SITE")).unwrap(),
            "CHECK_RELEASE = NO\nCROSS_COMPILER_TARGET_ARCHS =\n"
        );

        let release_local = std::fs::read_to_string(ioc.join(RELEASE_LOCAL)).unwrap();
        let asyn: PathBuf = top.join("R7.0.2-2.0/modules/asyn/R4.39");
        assert_eq!(
            release_local,
            format!(
                "# Generated by pib, changes will be overwritten\nASYN={}\nEPICS_BASE={}\n",
                asyn.display(),
                top.join("base/R7.0.2-2.0").display()
            )
        );
    }

    #[test]
    fn missing_local_source_fails_download() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = format!(
            "modules:\n  ioc:\n    path: {}\n    dependencies: []\n",
            dir.path().join("missing").display()
        );
        let executor = LocalExecutor::new(resolve(dir.path(), &yaml));
        assert!(executor.execute(&item("ioc", Step::Download)).is_err());
        assert!(executor.execute(&item("unknown", Step::Download)).is_err());
    }
}
