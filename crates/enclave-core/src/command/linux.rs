//! Command runner backed by real host processes.

use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::path::{Component, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use enclave_common::error::{EnclaveError, Result};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;

use super::{
    CommandOutput, CommandRunner, HelperCommand, OutputSource, Pipe, ProcessHandle, RunningCommand,
};

/// Runs helper commands as child processes of the daemon.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinuxCommandRunner {
    debug: bool,
}

impl LinuxCommandRunner {
    /// Creates a runner. With `debug` set, captured helper output is
    /// logged at debug level.
    #[must_use]
    pub const fn new(debug: bool) -> Self {
        Self { debug }
    }

    fn build(command: &HelperCommand) -> Command {
        let mut cmd = Command::new(resolve_program(command));
        let _ = cmd.args(command.get_args());
        if !command.get_env().is_empty() {
            let _ = cmd.env_clear();
            let _ = cmd.envs(command.get_env().iter().map(|(k, v)| (k, v)));
        }
        let _ = cmd.stdin(if command.get_stdin().is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });
        let _ = cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        cmd
    }

    fn spawn(command: &HelperCommand) -> Result<Child> {
        let mut child = Self::build(command)
            .spawn()
            .map_err(|source| EnclaveError::CommandLaunch {
                program: command.program_name(),
                source,
            })?;

        if let (Some(input), Some(mut pipe)) = (command.get_stdin(), child.stdin.take()) {
            let input = input.to_vec();
            let program = command.program_name();
            let _ = std::thread::spawn(move || {
                if let Err(e) = pipe.write_all(&input) {
                    tracing::debug!(program = %program, error = %e, "stdin closed early");
                }
            });
        }
        Ok(child)
    }
}

/// Bare program names are looked up on `PATH`; anything with a directory
/// component is used as given.
fn resolve_program(command: &HelperCommand) -> PathBuf {
    let program = command.program();
    let bare = program.components().count() == 1
        && matches!(program.components().next(), Some(Component::Normal(_)));
    if bare {
        if let Ok(found) = which::which(program) {
            return found;
        }
    }
    program.to_path_buf()
}

impl CommandRunner for LinuxCommandRunner {
    fn run(&self, command: &HelperCommand) -> Result<CommandOutput> {
        tracing::debug!(cmd = %command, "running helper");
        let child = Self::spawn(command)?;
        let output = child
            .wait_with_output()
            .map_err(|e| EnclaveError::io(command.program(), e))?;

        if self.debug {
            tracing::debug!(
                cmd = %command,
                status = ?output.status.code(),
                stdout = %String::from_utf8_lossy(&output.stdout),
                stderr = %String::from_utf8_lossy(&output.stderr),
                "helper finished"
            );
        }

        if !output.status.success() {
            return Err(EnclaveError::CommandFailed {
                program: command.program_name(),
                status: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(CommandOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn start(&self, command: &HelperCommand) -> Result<RunningCommand> {
        tracing::debug!(cmd = %command, "starting helper");
        let mut child = Self::spawn(command)?;
        let program = command.program_name();

        let stdout = child.stdout.take().ok_or_else(|| EnclaveError::CommandLaunch {
            program: program.clone(),
            source: std::io::Error::other("stdout not piped"),
        })?;
        let stderr = child.stderr.take().ok_or_else(|| EnclaveError::CommandLaunch {
            program: program.clone(),
            source: std::io::Error::other("stderr not piped"),
        })?;

        let handle = LinuxProcess {
            pid: child.id(),
            program,
            child: Mutex::new(child),
            exited: AtomicBool::new(false),
        };
        let output = PolledOutput {
            stdout: Some(stdout),
            stderr: Some(stderr),
        };
        Ok(RunningCommand::new(Box::new(output), Arc::new(handle)))
    }
}

/// Both output pipes of a child, read in one loop so chunks come back in
/// the order the child wrote them.
struct PolledOutput {
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

impl PolledOutput {
    /// Waits until a pipe is readable or hung up. Stdout wins ties.
    fn ready(&self) -> io::Result<Option<Pipe>> {
        let mut fds = Vec::with_capacity(2);
        let mut pipes = Vec::with_capacity(2);
        if let Some(out) = &self.stdout {
            fds.push(PollFd::new(out.as_fd(), PollFlags::POLLIN));
            pipes.push(Pipe::Stdout);
        }
        if let Some(err) = &self.stderr {
            fds.push(PollFd::new(err.as_fd(), PollFlags::POLLIN));
            pipes.push(Pipe::Stderr);
        }

        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(None),
            Err(errno) => return Err(errno.into()),
        }

        let wake = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
        Ok(fds
            .iter()
            .zip(pipes)
            .find(|(fd, _)| fd.revents().is_some_and(|r| r.intersects(wake)))
            .map(|(_, pipe)| pipe))
    }
}

impl OutputSource for PolledOutput {
    fn next_chunk(&mut self) -> io::Result<Option<(Pipe, Vec<u8>)>> {
        let mut buf = [0u8; 8192];
        while self.stdout.is_some() || self.stderr.is_some() {
            let Some(pipe) = self.ready()? else {
                continue;
            };
            let read = match pipe {
                Pipe::Stdout => self.stdout.as_mut().map(|p| p.read(&mut buf)),
                Pipe::Stderr => self.stderr.as_mut().map(|p| p.read(&mut buf)),
            };
            match read {
                Some(Ok(0)) | None => match pipe {
                    Pipe::Stdout => self.stdout = None,
                    Pipe::Stderr => self.stderr = None,
                },
                Some(Ok(n)) => return Ok(Some((pipe, buf[..n].to_vec()))),
                Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => {}
                Some(Err(e)) => return Err(e),
            }
        }
        Ok(None)
    }
}

struct LinuxProcess {
    pid: u32,
    program: String,
    child: Mutex<Child>,
    exited: AtomicBool,
}

impl ProcessHandle for LinuxProcess {
    fn wait(&self) -> Result<Option<i32>> {
        let mut child = self.child.lock().unwrap_or_else(PoisonError::into_inner);
        let status = child
            .wait()
            .map_err(|e| EnclaveError::io(&self.program, e))?;
        self.exited.store(true, Ordering::SeqCst);
        Ok(status.code())
    }

    fn signal(&self, sig: Signal) -> Result<()> {
        if self.exited.load(Ordering::SeqCst) {
            return Ok(());
        }
        let pid = i32::try_from(self.pid).map_err(|_| EnclaveError::InvalidArgument {
            message: format!("pid out of range: {}", self.pid),
        })?;
        match signal::kill(Pid::from_raw(pid), sig) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(errno) => Err(EnclaveError::io(&self.program, errno.into())),
        }
    }
}
