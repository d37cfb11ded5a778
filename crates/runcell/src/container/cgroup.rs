//! Per-run cgroup paths
//!
//! Resolves the leaf cgroup a run is confined to and removes it (and its
//! parent, when one was created) once the run is over.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

/// Mount point of the unified cgroup hierarchy
pub const CGROUP_MOUNT: &str = "/sys/fs/cgroup";

/// Controllers delegated to the per-run parent in rootless mode
const DELEGATED_CONTROLLERS: &str = "+cpu +memory +pids";

const REMOVE_RETRIES: u32 = 5;
const REMOVE_RETRY_DELAY: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum CgroupError {
    #[error("cgroup path is empty")]
    EmptyPath,

    #[error("failed to create cgroup {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The cgroup paths owned by one run.
///
/// Call [`release`](Self::release) once the container is destroyed. If the
/// value is dropped without being released, the paths are removed
/// synchronously as a fallback.
#[derive(Debug)]
pub struct CgroupPaths {
    parent: Option<PathBuf>,
    leaf: PathBuf,
    released: bool,
}

impl CgroupPaths {
    /// Resolve the cgroup paths for container `id` under `base`.
    ///
    /// Rootless containers get an intermediate `<id>.scope` cgroup created
    /// here with controllers delegated to it; the leaf below it is left for
    /// the backend to create.
    pub async fn resolve(base: &Path, rootless: bool, id: &str) -> Result<Self, CgroupError> {
        if base.as_os_str().is_empty() {
            return Err(CgroupError::EmptyPath);
        }

        let base = if base.is_absolute() {
            base.to_path_buf()
        } else {
            Path::new(CGROUP_MOUNT).join(base)
        };

        if !rootless {
            let leaf = base.join(id);
            debug!(leaf = %leaf.display(), "resolved cgroup path");
            return Ok(Self {
                parent: None,
                leaf,
                released: false,
            });
        }

        let parent = base.join(format!("{id}.scope"));
        match tokio::fs::create_dir(&parent).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(source) => {
                return Err(CgroupError::Create {
                    path: parent,
                    source,
                });
            }
        }

        let paths = Self {
            leaf: parent.join("container"),
            parent: Some(parent),
            released: false,
        };

        if let Some(parent) = &paths.parent {
            if let Err(e) = delegate_controllers(parent).await {
                warn!(path = %parent.display(), error = %e, "failed to enable cgroup controllers");
            }
            debug!(parent = %parent.display(), leaf = %paths.leaf.display(), "resolved cgroup path");
        }

        Ok(paths)
    }

    /// The leaf cgroup the container is placed in
    pub fn leaf(&self) -> &Path {
        &self.leaf
    }

    /// The intermediate cgroup, if one was created
    pub fn parent(&self) -> Option<&Path> {
        self.parent.as_deref()
    }

    /// The leaf path relative to the cgroup mount point
    pub fn relative_path(&self) -> PathBuf {
        match self.leaf.strip_prefix(CGROUP_MOUNT) {
            Ok(relative) => Path::new("/").join(relative),
            Err(_) => self.leaf.clone(),
        }
    }

    /// Remove the leaf, then the parent. Failures are logged, not returned.
    pub async fn release(mut self) {
        if let Err(e) = remove_path(&self.leaf).await {
            warn!(path = %self.leaf.display(), error = %e, "failed to remove cgroup");
        }

        if let Some(parent) = &self.parent
            && let Err(e) = remove_path(parent).await
        {
            warn!(path = %parent.display(), error = %e, "failed to remove parent cgroup");
        }

        self.released = true;
    }
}

impl Drop for CgroupPaths {
    fn drop(&mut self) {
        if self.released {
            return;
        }

        warn!(
            leaf = %self.leaf.display(),
            "CgroupPaths dropped without release, removing synchronously"
        );

        if let Err(e) = remove_path_sync(&self.leaf) {
            warn!(path = %self.leaf.display(), error = %e, "failed to remove cgroup");
        }
        if let Some(parent) = &self.parent
            && let Err(e) = remove_path_sync(parent)
        {
            warn!(path = %parent.display(), error = %e, "failed to remove parent cgroup");
        }
    }
}

async fn delegate_controllers(parent: &Path) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    // cgroupfs files always exist; never create one on a regular filesystem
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .open(parent.join("cgroup.subtree_control"))
        .await?;
    file.write_all(DELEGATED_CONTROLLERS.as_bytes()).await?;
    Ok(())
}

/// Remove a cgroup directory and any child cgroups below it.
///
/// A path that does not exist counts as removed, so calling this twice is
/// harmless. `EBUSY` is retried briefly since the kernel may still be
/// tearing down the last task.
pub async fn remove_path(path: &Path) -> std::io::Result<()> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || remove_path_sync(&path))
        .await
        .map_err(std::io::Error::other)?
}

fn remove_path_sync(path: &Path) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            remove_path_sync(&entry.path())?;
        }
    }

    let mut attempt = 0;
    loop {
        match std::fs::remove_dir(path) {
            Ok(()) => return Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) && attempt < REMOVE_RETRIES => {
                attempt += 1;
                std::thread::sleep(REMOVE_RETRY_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}
