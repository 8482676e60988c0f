use super::{ToolDiag, Transformer};
use crate::config::{Config, Transform};
use crate::error::{PatchError, PatchResult};
use crate::job::JobStage;
use crate::process::{run_tool, ToolCommand, ToolError, ToolOutput};
use crate::util::tail_lossy;
use crate::workspace::Workspace;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const DOCTOR_TIMEOUT: Duration = Duration::from_secs(15);

/// Runs a configured command line (apktool by default) for both directions.
pub struct CommandTransformer {
    cfg: Transform,
    env: Vec<(String, String)>,
    max_diagnostic_bytes: usize,
    log_tool_stderr: bool,
}

impl CommandTransformer {
    pub fn new(cfg: &Config) -> Self {
        Self {
            cfg: cfg.transform.clone(),
            env: cfg
                .transform
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            max_diagnostic_bytes: cfg.limits.max_diagnostic_bytes,
            log_tool_stderr: cfg.debug.log_tool_stderr,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.timeout_seconds)
    }

    fn run(
        &self,
        stage: JobStage,
        args: Vec<String>,
        cwd: &Path,
        cancel: &CancellationToken,
    ) -> PatchResult<ToolOutput> {
        let cmd = ToolCommand {
            program: &self.cfg.program,
            args: &args,
            cwd,
            env: &self.env,
            timeout: self.timeout(),
        };
        let output = run_tool(&cmd, cancel).map_err(|e| map_tool_error(stage, e))?;

        if self.log_tool_stderr && !output.stderr.is_empty() {
            debug!(%stage, "tool stderr: {}", String::from_utf8_lossy(&output.stderr).trim());
        }

        if !output.status.success() {
            return Err(PatchError::TransformFailed {
                stage,
                diagnostics: format!(
                    "{} ({})",
                    tail_lossy(output.diagnostics(), self.max_diagnostic_bytes),
                    output.status
                ),
            });
        }
        Ok(output)
    }
}

/// Substitutes `{input}`, `{tree}` and `{output}` in each argument.
pub fn expand_args(
    template: &[String],
    input: Option<&Path>,
    tree: &Path,
    output: Option<&Path>,
) -> Vec<String> {
    let input = input.map(|p| p.display().to_string()).unwrap_or_default();
    let tree = tree.display().to_string();
    let output = output.map(|p| p.display().to_string()).unwrap_or_default();
    template
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input)
                .replace("{tree}", &tree)
                .replace("{output}", &output)
        })
        .collect()
}

pub(crate) fn map_tool_error(stage: JobStage, err: ToolError) -> PatchError {
    match err {
        ToolError::TimedOut { timeout, .. } => PatchError::TransformTimeout {
            stage,
            seconds: timeout.as_secs(),
        },
        ToolError::Cancelled { .. } => PatchError::Cancelled,
        ToolError::Spawn { program, source } => PatchError::io(format!("spawn {program}"), source),
        ToolError::Wait { program, source } => PatchError::io(format!("wait {program}"), source),
    }
}

impl Transformer for CommandTransformer {
    fn doctor(&self) -> ToolDiag {
        let cwd = std::env::temp_dir();
        let cmd = ToolCommand {
            program: &self.cfg.program,
            args: &self.cfg.version_args,
            cwd: &cwd,
            env: &self.env,
            timeout: DOCTOR_TIMEOUT,
        };
        let mut diag = ToolDiag {
            name: "transform".into(),
            program: self.cfg.program.clone(),
            ok: false,
            version: None,
            error: None,
        };
        match run_tool(&cmd, &CancellationToken::new()) {
            Ok(out) if out.status.success() => {
                diag.ok = true;
                let text = if out.stdout.is_empty() { &out.stderr } else { &out.stdout };
                diag.version = Some(tail_lossy(text, 256));
            }
            Ok(out) => {
                diag.error = Some(tail_lossy(out.diagnostics(), self.max_diagnostic_bytes));
            }
            Err(e) => diag.error = Some(e.to_string()),
        }
        diag
    }

    fn decompile(
        &self,
        input: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        let tree = workspace.tree_dir();
        let args = expand_args(&self.cfg.decompile_args, Some(input), &tree, None);
        self.run(JobStage::Decompiling, args, workspace.path(), cancel)?;

        if !tree.is_dir() {
            return Err(PatchError::TransformFailed {
                stage: JobStage::Decompiling,
                diagnostics: format!("tool produced no tree at {}", tree.display()),
            });
        }
        info!(tree = %tree.display(), "decompiled");
        Ok(tree)
    }

    fn recompile(
        &self,
        tree: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        let output = workspace.unsigned_apk();
        let args = expand_args(&self.cfg.recompile_args, None, tree, Some(&output));
        self.run(JobStage::Recompiling, args, workspace.path(), cancel)?;

        if !output.is_file() {
            return Err(PatchError::TransformFailed {
                stage: JobStage::Recompiling,
                diagnostics: format!("tool produced no container at {}", output.display()),
            });
        }
        info!(output = %output.display(), "recompiled");
        Ok(output)
    }

    fn assemble(
        &self,
        smali_dir: &Path,
        workspace: &Workspace,
        cancel: &CancellationToken,
    ) -> PatchResult<PathBuf> {
        let output = workspace.dex_output();
        let args = expand_args(&self.cfg.assemble_args, None, smali_dir, Some(&output));
        self.run(JobStage::Recompiling, args, workspace.path(), cancel)?;

        if !output.is_file() {
            return Err(PatchError::TransformFailed {
                stage: JobStage::Recompiling,
                diagnostics: format!("assembler produced no dex at {}", output.display()),
            });
        }
        info!(output = %output.display(), "assembled");
        Ok(output)
    }
}
