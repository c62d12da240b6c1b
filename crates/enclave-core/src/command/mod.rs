//! Launching external scripts and helpers.
//!
//! Everything the runtime does to the host goes through a fixed-contract
//! shell-out: lifecycle scripts, quota tools, and the `iomux-*`, `wsh`,
//! and `oom` helpers. [`CommandRunner`] is the seam for all of them so
//! the supervision logic can be exercised against [`fake::FakeCommandRunner`].

pub mod fake;
pub mod linux;

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use enclave_common::error::Result;
pub use nix::sys::signal::Signal;

/// Description of an external command.
///
/// A non-empty environment replaces the daemon's own; an empty one
/// inherits it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HelperCommand {
    program: PathBuf,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: Option<Vec<u8>>,
}

impl HelperCommand {
    /// Creates a command for the given program with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Adds one environment entry.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Adds several environment entries.
    #[must_use]
    pub fn envs<I>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.env.extend(entries);
        self
    }

    /// Sets the bytes fed to the command's stdin.
    #[must_use]
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Program path or bare name.
    #[must_use]
    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments, excluding the program itself.
    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Environment entries in insertion order.
    #[must_use]
    pub fn get_env(&self) -> &[(String, String)] {
        &self.env
    }

    /// Bytes fed to stdin, if any.
    #[must_use]
    pub fn get_stdin(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }

    /// Looks up an environment entry by key.
    #[must_use]
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Program path rendered for logs and errors.
    #[must_use]
    pub fn program_name(&self) -> String {
        self.program.display().to_string()
    }
}

impl fmt::Display for HelperCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Captured output of a command run to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Captured stdout.
    pub stdout: Vec<u8>,
    /// Captured stderr.
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Stdout decoded lossily as UTF-8.
    #[must_use]
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Control over a process started in the background.
///
/// Shared between the task that waits for the process and the tasks that
/// may need to interrupt or kill it.
pub trait ProcessHandle: Send + Sync {
    /// Blocks until the process exits.
    ///
    /// Returns the exit code, or `None` if the process was terminated by
    /// a signal.
    ///
    /// # Errors
    ///
    /// Returns an error if waiting on the process fails.
    fn wait(&self) -> Result<Option<i32>>;

    /// Delivers a signal to the process. Signalling a process that has
    /// already been reaped is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal cannot be delivered.
    fn signal(&self, signal: Signal) -> Result<()>;
}

/// Which pipe a chunk of output was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pipe {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// Stdout and stderr of a running command merged into one sequence, in
/// the order the chunks were written.
pub trait OutputSource: Send {
    /// Blocks for the next chunk. Returns `None` once both pipes are
    /// closed.
    ///
    /// # Errors
    ///
    /// Returns an error if reading either pipe fails.
    fn next_chunk(&mut self) -> io::Result<Option<(Pipe, Vec<u8>)>>;
}

/// [`Read`] over the stdout side of an [`OutputSource`]. Stderr chunks are
/// consumed and dropped.
pub struct StdoutReader {
    source: Box<dyn OutputSource>,
    pending: Vec<u8>,
    pos: usize,
}

impl StdoutReader {
    /// Wraps `source`.
    #[must_use]
    pub fn new(source: Box<dyn OutputSource>) -> Self {
        Self {
            source,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for StdoutReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.pending.len() {
            match self.source.next_chunk()? {
                Some((Pipe::Stdout, chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Some((Pipe::Stderr, _)) => {}
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// A process started in the background, with its output.
pub struct RunningCommand {
    output: Option<Box<dyn OutputSource>>,
    handle: Arc<dyn ProcessHandle>,
}

impl RunningCommand {
    /// Assembles a running command from its parts.
    pub fn new(output: Box<dyn OutputSource>, handle: Arc<dyn ProcessHandle>) -> Self {
        Self {
            output: Some(output),
            handle,
        }
    }

    /// Takes ownership of the merged output. Returns `None` on later calls.
    pub fn take_output(&mut self) -> Option<Box<dyn OutputSource>> {
        self.output.take()
    }

    /// Takes the output as a reader over stdout only.
    pub fn take_stdout(&mut self) -> Option<StdoutReader> {
        self.take_output().map(StdoutReader::new)
    }

    /// Shared handle for waiting on and signalling the process.
    #[must_use]
    pub fn handle(&self) -> Arc<dyn ProcessHandle> {
        Arc::clone(&self.handle)
    }
}

impl fmt::Debug for RunningCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningCommand")
            .field("output", &self.output.is_some())
            .finish_non_exhaustive()
    }
}

/// Launches external commands.
pub trait CommandRunner: Send + Sync {
    /// Runs a command to completion, capturing its output.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::CommandLaunch`](enclave_common::error::EnclaveError::CommandLaunch)
    /// if the program cannot be started and
    /// [`EnclaveError::CommandFailed`](enclave_common::error::EnclaveError::CommandFailed)
    /// if it exits unsuccessfully.
    fn run(&self, command: &HelperCommand) -> Result<CommandOutput>;

    /// Starts a command in the background with piped stdout and stderr,
    /// read back through one [`OutputSource`].
    ///
    /// # Errors
    ///
    /// Returns an error if the program cannot be started.
    fn start(&self, command: &HelperCommand) -> Result<RunningCommand>;
}
