pub mod command;
pub mod types;

use crate::error::PatchResult;
use crate::workspace::Workspace;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

pub use command::CommandTransformer;
pub use types::ToolDiag;

/// Converts a container to an editable intermediate tree and back.
///
/// Implementations only see paths inside the job's workspace and report
/// success or failure; they never track job state.
pub trait Transformer: Send + Sync {
    fn doctor(&self) -> ToolDiag;
    fn decompile(
        &self,
        input: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf>;
    fn recompile(
        &self,
        tree: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf>;
    /// Assembles a directory of smali sources into one `classes.dex`.
    fn assemble(
        &self,
        smali_dir: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf>;
}
