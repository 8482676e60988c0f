//! Bounded subprocess execution shared by the transform and signing stages.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Captured result of a tool that ran to completion.
#[derive(Debug)]
pub struct ToolOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ToolOutput {
    /// stderr if the tool wrote any, stdout otherwise.
    pub fn diagnostics(&self) -> &[u8] {
        if self.stderr.iter().any(|b| !b.is_ascii_whitespace()) {
            &self.stderr
        } else {
            &self.stdout
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exceeded timeout ({timeout:?})")]
    TimedOut {
        program: String,
        timeout: Duration,
        stderr: Vec<u8>,
    },
    #[error("{program} cancelled")]
    Cancelled { program: String },
    #[error("waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// One invocation of an external tool.
pub struct ToolCommand<'a> {
    pub program: &'a str,
    pub args: &'a [String],
    pub cwd: &'a Path,
    pub env: &'a [(String, String)],
    pub timeout: Duration,
}

/// Runs the tool to completion, killing it (and anything it spawned) on
/// timeout or cancellation. A non-zero exit status is returned as a normal
/// [`ToolOutput`]; callers decide what it means.
pub fn run_tool(cmd: &ToolCommand<'_>, cancel: &CancellationToken) -> Result<ToolOutput, ToolError> {
    debug!(program = cmd.program, args = ?cmd.args, cwd = %cmd.cwd.display(), timeout = ?cmd.timeout, "spawning tool");

    let mut command = Command::new(cmd.program);
    command
        .args(cmd.args)
        .current_dir(cmd.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in cmd.env {
        command.env(k, v);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let mut child = command.spawn().map_err(|source| ToolError::Spawn {
        program: cmd.program.to_string(),
        source,
    })?;

    wait_with_timeout(&mut child, cmd.program, cmd.timeout, cancel)
}

fn wait_with_timeout(
    child: &mut Child,
    program: &str,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<ToolOutput, ToolError> {
    // Drain pipes while waiting so a chatty tool can't block on a full pipe.
    let stdout_thread = spawn_reader(child.stdout.take());
    let stderr_thread = spawn_reader(child.stderr.take());

    let wait_err = |source| ToolError::Wait {
        program: program.to_string(),
        source,
    };

    let start = Instant::now();
    loop {
        if let Some(status) = child.try_wait().map_err(wait_err)? {
            // Background helpers the tool left running would hold the pipes open.
            kill_stragglers(child);
            return Ok(ToolOutput {
                status,
                stdout: join_reader(stdout_thread),
                stderr: join_reader(stderr_thread),
            });
        }

        let timed_out = start.elapsed() > timeout;
        if timed_out || cancel.is_cancelled() {
            kill_tree(child);
            child.wait().map_err(wait_err)?;
            let _ = join_reader(stdout_thread);
            let stderr = join_reader(stderr_thread);
            if timed_out {
                warn!(program, "tool timed out after {:?}", timeout);
                return Err(ToolError::TimedOut {
                    program: program.to_string(),
                    timeout,
                    stderr,
                });
            }
            warn!(program, "tool cancelled");
            return Err(ToolError::Cancelled {
                program: program.to_string(),
            });
        }

        std::thread::sleep(POLL_INTERVAL);
    }
}

fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf) {
                debug!("tool pipe read ended: {e}");
            }
        }
        buf
    })
}

fn join_reader(handle: std::thread::JoinHandle<Vec<u8>>) -> Vec<u8> {
    handle.join().unwrap_or_else(|_| {
        warn!("tool output reader thread panicked");
        Vec::new()
    })
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // The child leads its own process group (see `process_group(0)`).
    let pgid = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg failed ({e}); killing child only");
        let _ = child.kill();
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

#[cfg(unix)]
fn kill_stragglers(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    // ESRCH here just means the group is already empty.
    let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL);
}

#[cfg(not(unix))]
fn kill_stragglers(_child: &Child) {}
