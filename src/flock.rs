use std::{
    fs::File,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use fs4::fs_std::FileExt;
use log::{debug, info};
use thiserror::Error;

const LOCK_FILE: &str = ".lock";
const RETRY_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Exclusive advisory lock on a directory, released on drop.
pub struct FileLock {
    _file: File,
}

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("{path} is still locked by another process after {waited:?}")]
    Timeout { path: PathBuf, waited: Duration },
}

impl FileLock {
    /// Locks `directory` through a `.lock` file inside it, waiting up to `timeout` for
    /// another holder to let go.
    pub fn acquire(directory: &Path, timeout: Duration) -> Result<Self, Error> {
        let path = directory.join(LOCK_FILE);
        let file = File::create(&path)?;
        let start = Instant::now();
        let mut announced = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(true) => {
                    debug!("Locked {}", path.display());
                    return Ok(Self { _file: file });
                }
                Ok(false) => {}
                Err(error)
                    if error.raw_os_error() != fs4::lock_contended_error().raw_os_error() =>
                {
                    return Err(error.into());
                }
                Err(_) => {}
            }
            if start.elapsed() >= timeout {
                return Err(Error::Timeout {
                    path,
                    waited: start.elapsed(),
                });
            }
            if !announced {
                info!("Waiting for another pib process to release {}", path.display());
                announced = true;
            }
            std::thread::sleep(RETRY_INTERVAL.min(timeout));
        }
    }
}
