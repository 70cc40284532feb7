//! Running external tools with captured output and a wall-clock limit.

use std::ffi::OsString;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::CommandLine;
use crate::error::JobError;

/// Captured result of a finished external command.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Run `command` with `extra_args` appended, waiting at most `limit`.
///
/// When `scratch` is given it becomes the command's `TMPDIR`, so anything
/// the tool and its workers leave behind lives inside the caller's job
/// directory. On unix the command leads its own process group, and the
/// whole group is killed if the limit expires or the call is cancelled.
///
/// Start-up failures map to [`JobError::EngineUnavailable`] and an expired
/// limit to [`JobError::Timeout`]. A non-zero exit is *not* an error here;
/// callers decide what the exit code means.
pub async fn run_with_timeout(
    command: &CommandLine,
    extra_args: Vec<OsString>,
    scratch: Option<&Path>,
    limit: Duration,
) -> Result<CommandOutput, JobError> {
    let mut cmd = Command::new(&command.program);
    cmd.args(&command.args)
        .args(&extra_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = scratch {
        cmd.env("TMPDIR", dir);
    }
    #[cfg(unix)]
    cmd.process_group(0);

    debug!(program = %command, args = ?extra_args, "Spawning external command");

    let mut child = cmd.spawn().map_err(|source| JobError::EngineUnavailable {
        program: command.program.clone(),
        source,
    })?;
    let group = ProcessGroup::new(child.id());

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let outcome = {
        let wait = async {
            tokio::try_join!(child.wait(), read_pipe(stdout), read_pipe(stderr))
        };
        tokio::time::timeout(limit, wait).await
    };

    match outcome {
        Ok(Ok((status, stdout, stderr))) => {
            group.release();
            debug!(program = %command, %status, stdout = %stdout, "External command finished");
            Ok(CommandOutput {
                status,
                stdout,
                stderr,
            })
        }
        Ok(Err(e)) => Err(JobError::Io(e)),
        Err(_) => {
            warn!(
                program = %command,
                seconds = limit.as_secs(),
                "External command timed out, killing its process group"
            );
            group.kill();
            // Reap the leader; the rest of the group was re-parented.
            if let Err(e) = child.kill().await {
                warn!(program = %command, "Failed to kill timed out command: {}", e);
            }
            Err(JobError::Timeout {
                program: command.program.clone(),
                seconds: limit.as_secs(),
            })
        }
    }
}

/// The process group led by a spawned command.
///
/// Dropping it kills every process still in the group, which covers
/// workers the command forked as well as cancellation of the caller.
struct ProcessGroup {
    #[cfg(unix)]
    leader: Option<nix::unistd::Pid>,
}

impl ProcessGroup {
    fn new(leader: Option<u32>) -> Self {
        #[cfg(unix)]
        {
            Self {
                leader: leader
                    .and_then(|pid| i32::try_from(pid).ok())
                    .map(nix::unistd::Pid::from_raw),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = leader;
            Self {}
        }
    }

    /// The command finished on its own; leave the group alone.
    fn release(mut self) {
        #[cfg(unix)]
        {
            self.leader = None;
        }
    }

    fn kill(mut self) {
        self.kill_group();
    }

    fn kill_group(&mut self) {
        #[cfg(unix)]
        if let Some(leader) = self.leader.take() {
            use nix::sys::signal::{killpg, Signal};
            // ESRCH means every member already exited.
            if let Err(e) = killpg(leader, Signal::SIGKILL) {
                if e != nix::errno::Errno::ESRCH {
                    warn!("Failed to kill process group {}: {}", leader, e);
                }
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill_group();
    }
}

async fn read_pipe<R>(pipe: Option<R>) -> std::io::Result<String>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buf).await?;
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
