use std::path::Path;

use git2::{
    build::CheckoutBuilder, AutotagOption, Config, Cred, CredentialType, FetchOptions, Oid,
    RemoteCallbacks, Repository, SubmoduleUpdateOptions,
};
use log::{debug, info, trace};
use thiserror::Error;

use crate::model::spec::GitSource;

#[derive(Error, Debug)]
pub enum GitError {
    #[error("Git error: {0}")]
    Git(#[from] git2::Error),
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Revision {tag} was not found in {url}")]
    RevisionNotFound { url: String, tag: String },
}

/// Acquires module source trees with libgit2.
#[derive(Debug, Clone, Copy, Default)]
pub struct GitFetcher;

impl GitFetcher {
    pub fn new() -> Self {
        GitFetcher
    }

    /// Fetches `source.tag` into `destination` and checks it out detached, then updates
    /// submodules when requested.
    pub fn checkout(&self, source: &GitSource, destination: &Path) -> Result<(), GitError> {
        info!("Fetching {} {} into {}", source.url, source.tag, destination.display());
        std::fs::create_dir_all(destination)?;
        let repo = match Repository::open(destination) {
            Ok(repo) => repo,
            Err(_) => {
                trace!("Creating a new repository at {}", destination.display());
                Repository::init(destination)?
            }
        };

        let mut fetch_error = None;
        {
            let mut remote = match repo.find_remote("origin") {
                Ok(remote) if remote.url() == Some(source.url.as_str()) => remote,
                Ok(_) => {
                    repo.remote_set_url("origin", &source.url)?;
                    repo.find_remote("origin")?
                }
                Err(_) => repo.remote("origin", &source.url)?,
            };
            let tag = &source.tag;
            let mut options = fetch_options()?;
            if source.depth > 0 {
                options.depth(i32::try_from(source.depth).unwrap_or(i32::MAX));
            }
            for refspec in [
                format!("+refs/tags/{tag}:refs/tags/{tag}"),
                format!("+refs/heads/{tag}:refs/remotes/origin/{tag}"),
            ] {
                if let Err(error) = remote.fetch(&[refspec.as_str()], Some(&mut options), None) {
                    debug!("Fetching {} failed: {}", refspec, error);
                    fetch_error = Some(error);
                }
            }
        }

        let oid = match (resolve(&repo, &source.tag), fetch_error) {
            (Some(oid), _) => oid,
            (None, Some(error)) => return Err(error.into()),
            (None, None) => {
                return Err(GitError::RevisionNotFound {
                    url: source.url.clone(),
                    tag: source.tag.clone(),
                })
            }
        };
        let commit = repo.find_commit(oid)?;
        debug!("Checking out {} at {}", source.tag, oid);
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))?;
        repo.set_head_detached(oid)?;

        if source.recursive {
            update_submodules(&repo)?;
        }
        Ok(())
    }
}

fn resolve(repo: &Repository, tag: &str) -> Option<Oid> {
    [
        format!("refs/tags/{tag}"),
        format!("refs/remotes/origin/{tag}"),
        tag.to_string(),
    ]
    .iter()
    .find_map(|spec| {
        repo.revparse_single(spec)
            .and_then(|object| object.peel_to_commit())
            .map(|commit| commit.id())
            .ok()
    })
}

fn update_submodules(repo: &Repository) -> Result<(), GitError> {
    for mut submodule in repo.submodules()? {
        debug!("Updating submodule {}", submodule.path().display());
        let mut options = SubmoduleUpdateOptions::new();
        options.fetch(fetch_options()?);
        submodule.update(true, Some(&mut options))?;
        let nested = submodule.open()?;
        update_submodules(&nested)?;
    }
    Ok(())
}

fn fetch_options() -> Result<FetchOptions<'static>, GitError> {
    let git_config = Config::open_default()?;
    let mut callbacks = RemoteCallbacks::new();
    callbacks.credentials(move |url, username, allowed_types| {
        trace!(
            "Requested credentials for {}, username {:?}, allowed types {:?}",
            url,
            username,
            allowed_types
        );
        if allowed_types.contains(CredentialType::USERNAME) {
            return Cred::username("git");
        }
        if allowed_types.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username.unwrap_or("git"));
        }
        if allowed_types.contains(CredentialType::USER_PASS_PLAINTEXT) {
            return Cred::credential_helper(&git_config, url, username);
        }
        Err(git2::Error::from_str("no valid authentication available"))
    });

    let mut fetch_options = FetchOptions::new();
    fetch_options
        .remote_callbacks(callbacks)
        .download_tags(AutotagOption::None);
    Ok(fetch_options)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    use git2::Signature;

    /// A local repository with one commit tagged `tag`, usable as a fetch source.
    fn upstream(dir: &Path, tag: &str) -> PathBuf {
        let path = dir.join("upstream");
        let repo = Repository::init(&path).unwrap();
        std::fs::create_dir_all(path.join("configure")).unwrap();
        std::fs::write(path.join("configure/RELEASE"), "EPICS_BASE=/opt/base\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_path(Path::new("configure/RELEASE"))
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let signature = Signature::now("test", "test@example.com").unwrap();
        let commit = repo
            .commit(Some("HEAD"), &signature, &signature, "initial", &tree, &[])
            .unwrap();
        let object = repo.find_object(commit, None).unwrap();
        repo.tag_lightweight(tag, &object, false).unwrap();
        path
    }

    #[test]
    fn checkout_fetches_a_tag() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = upstream(dir.path(), "R1");
        let mut source = GitSource::new(format!("file://{}", upstream.display()), "R1");
        source.depth = 0;
        let destination = dir.path().join("checkout");
        GitFetcher::new().checkout(&source, &destination).unwrap();
        assert_eq!(
            std::fs::read_to_string(destination.join("configure/RELEASE")).unwrap(),
            "EPICS_BASE=/opt/base\n"
        );
    }

    #[test]
    fn missing_tag_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let upstream = upstream(dir.path(), "R1");
        let mut source = GitSource::new(format!("file://{}", upstream.display()), "R9");
        source.depth = 0;
        let error = GitFetcher::new()
            .checkout(&source, &dir.path().join("checkout"))
            .unwrap_err();
        assert!(matches!(
            error,
            GitError::RevisionNotFound { .. } | GitError::Git(_)
        ));
    }
}
