//! Per-job scratch directories.
//!
//! Every job gets `<scratch_root>/apkjob_<job-id>`. The directory is removed
//! when the [`Workspace`] is released or dropped, so no exit path of a job can
//! leak it. Directories left behind by a crashed process are removed by
//! [`WorkspaceManager::sweep_stale`], which only runs under the scratch-root
//! [`ScratchLock`].

use crate::error::{PatchError, PatchResult};
use crate::job::JobId;
use serde::Serialize;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const WORKSPACE_PREFIX: &str = "apkjob_";

const LOCK_FILE: &str = ".apkpatch.lock";

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceEntry {
    pub name: String,
    pub path: PathBuf,
    pub modified: Option<String>,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn acquire(&self, job_id: JobId) -> PatchResult<Workspace> {
        std::fs::create_dir_all(&self.root).map_err(|e| alloc_error(&self.root, e))?;
        let path = self.root.join(format!("{WORKSPACE_PREFIX}{job_id}"));
        // create_dir (not create_dir_all) so an existing directory is an error
        std::fs::create_dir(&path).map_err(|e| alloc_error(&path, e))?;
        debug!(workspace = %path.display(), "workspace acquired");
        Ok(Workspace {
            job_id,
            path,
            released: false,
        })
    }

    pub fn release(&self, mut workspace: Workspace) -> PatchResult<()> {
        workspace.remove()
    }

    /// Takes the exclusive lock on the scratch root. `None` means another
    /// process holds it.
    pub fn lock(&self) -> PatchResult<Option<ScratchLock>> {
        std::fs::create_dir_all(&self.root).map_err(|e| alloc_error(&self.root, e))?;
        let path = self.root.join(LOCK_FILE);
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| PatchError::io(format!("open {}", path.display()), e))?;
        ScratchLock::try_new(file, path)
    }

    /// Removes workspaces left by a previous process. Entries not carrying
    /// the workspace prefix are never touched.
    pub fn sweep_stale(&self, lock: &ScratchLock) -> PatchResult<usize> {
        debug!(lock = %lock.path().display(), "sweeping scratch root");
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(PatchError::io(format!("read_dir {}", self.root.display()), e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| PatchError::io("read_dir entry", e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let path = entry.path();
            if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            match std::fs::remove_dir_all(&path) {
                Ok(()) => {
                    removed += 1;
                    info!(workspace = %path.display(), "removed stale workspace");
                }
                Err(e) => warn!(workspace = %path.display(), "stale workspace not removed: {e}"),
            }
        }
        Ok(removed)
    }

    pub fn list_active(&self) -> PatchResult<Vec<WorkspaceEntry>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(PatchError::io(format!("read_dir {}", self.root.display()), e)),
        };

        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with(WORKSPACE_PREFIX) {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|t| {
                    time::OffsetDateTime::from(t)
                        .format(&time::format_description::well_known::Rfc3339)
                        .ok()
                });
            out.push(WorkspaceEntry {
                name,
                path: entry.path(),
                modified,
            });
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }
}

fn alloc_error(path: &Path, e: io::Error) -> PatchError {
    match e.kind() {
        io::ErrorKind::StorageFull | io::ErrorKind::QuotaExceeded => {
            PatchError::ResourceExhausted(format!("{}: {e}", path.display()))
        }
        _ => PatchError::io(format!("create workspace {}", path.display()), e),
    }
}

/// Exclusive `flock` on `<scratch_root>/.apkpatch.lock`, held for as long as
/// the value lives.
pub struct ScratchLock {
    #[cfg(unix)]
    _lock: nix::fcntl::Flock<File>,
    #[cfg(not(unix))]
    _file: File,
    path: PathBuf,
}

impl ScratchLock {
    #[cfg(unix)]
    fn try_new(file: File, path: PathBuf) -> PatchResult<Option<Self>> {
        use nix::errno::Errno;
        use nix::fcntl::{Flock, FlockArg};

        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(Self { _lock: lock, path })),
            Err((_, Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(PatchError::io(
                format!("flock {}", path.display()),
                io::Error::from(errno),
            )),
        }
    }

    #[cfg(not(unix))]
    fn try_new(file: File, path: PathBuf) -> PatchResult<Option<Self>> {
        Ok(Some(Self { _file: file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for ScratchLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScratchLock").field("path", &self.path).finish()
    }
}

/// Exclusively owned job directory. Removed on release or drop.
#[derive(Debug)]
pub struct Workspace {
    job_id: JobId,
    path: PathBuf,
    released: bool,
}

impl Workspace {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn input_apk(&self) -> PathBuf {
        self.path.join("input.apk")
    }

    pub fn tree_dir(&self) -> PathBuf {
        self.path.join("tree")
    }

    pub fn unsigned_apk(&self) -> PathBuf {
        self.path.join("unsigned.apk")
    }

    pub fn aligned_apk(&self) -> PathBuf {
        self.path.join("aligned.apk")
    }

    pub fn signed_apk(&self) -> PathBuf {
        self.path.join("signed.apk")
    }

    pub fn smali_upload_dir(&self) -> PathBuf {
        self.path.join("smali_in")
    }

    pub fn dex_output(&self) -> PathBuf {
        self.path.join("classes.dex")
    }

    fn remove(&mut self) -> PatchResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => {
                debug!(workspace = %self.path.display(), "workspace released");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PatchError::io(
                format!("remove workspace {}", self.path.display()),
                e,
            )),
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        if let Err(err) = self.remove() {
            warn!("workspace cleanup on drop failed: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn full_disk_is_resource_exhausted() {
        let path = Path::new("/scratch/apkjob_x");
        for errno in [nix::errno::Errno::ENOSPC, nix::errno::Errno::EDQUOT] {
            let err = alloc_error(path, io::Error::from_raw_os_error(errno as i32));
            assert_eq!(err.kind(), "resource_exhausted", "{errno}");
        }
        let err = alloc_error(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), "io");
    }
}
