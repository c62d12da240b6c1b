//! In-memory command runner for tests.
//!
//! Records every command it is asked to run or start. Programs can be
//! scripted with [`FakeCommandRunner::when_running`]; a scripted program
//! runs its handler (on its own thread for `start`) and exits with the
//! code the handler returns. Unscripted programs exit 0 with no output.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use enclave_common::error::{EnclaveError, Result};
use nix::sys::signal::Signal;

use super::{
    CommandOutput, CommandRunner, HelperCommand, OutputSource, Pipe, ProcessHandle, RunningCommand,
};

type Handler = Arc<dyn Fn(&FakeProcess) -> Option<i32> + Send + Sync>;

/// One write to either pipe, or a read failure.
type Chunk = std::result::Result<(Pipe, Vec<u8>), io::ErrorKind>;

/// How a recorded command was launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// Through [`CommandRunner::run`].
    Run,
    /// Through [`CommandRunner::start`].
    Start,
}

#[derive(Default)]
struct State {
    history: Mutex<Vec<(Launch, HelperCommand)>>,
    handlers: Mutex<Vec<(PathBuf, Handler)>>,
    failing_starts: Mutex<HashSet<PathBuf>>,
    signals: Mutex<Vec<(PathBuf, Signal)>>,
}

/// Scriptable [`CommandRunner`] that never touches the host.
#[derive(Clone, Default)]
pub struct FakeCommandRunner {
    state: Arc<State>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn matches_program(program: &Path, pattern: &Path) -> bool {
    program == pattern || program.ends_with(pattern)
}

impl FakeCommandRunner {
    /// Creates a runner with no scripted programs.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts every program whose path is, or ends with, `program`.
    ///
    /// The handler's return value is the exit code; `None` simulates
    /// termination by a signal. Later registrations win.
    pub fn when_running<F>(&self, program: impl Into<PathBuf>, handler: F)
    where
        F: Fn(&FakeProcess) -> Option<i32> + Send + Sync + 'static,
    {
        lock(&self.state.handlers).push((program.into(), Arc::new(handler)));
    }

    /// Makes `start` fail to launch matching programs.
    pub fn fail_start(&self, program: impl Into<PathBuf>) {
        let _ = lock(&self.state.failing_starts).insert(program.into());
    }

    /// Every command seen so far, in launch order.
    #[must_use]
    pub fn history(&self) -> Vec<(Launch, HelperCommand)> {
        lock(&self.state.history).clone()
    }

    /// Commands passed to `run`, in order.
    #[must_use]
    pub fn executed(&self) -> Vec<HelperCommand> {
        self.filtered(Launch::Run)
    }

    /// Commands passed to `start`, in order.
    #[must_use]
    pub fn started(&self) -> Vec<HelperCommand> {
        self.filtered(Launch::Start)
    }

    /// Commands launched either way whose program matches `program`.
    #[must_use]
    pub fn launched(&self, program: impl AsRef<Path>) -> Vec<HelperCommand> {
        lock(&self.state.history)
            .iter()
            .filter(|(_, c)| matches_program(c.program(), program.as_ref()))
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Signals delivered to running processes, in order.
    #[must_use]
    pub fn signals(&self) -> Vec<(PathBuf, Signal)> {
        lock(&self.state.signals).clone()
    }

    /// Polls until `count` matching programs have been started or the
    /// timeout elapses. Returns whether the count was reached.
    pub fn wait_for_starts(&self, program: impl AsRef<Path>, count: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let seen = self
                .started()
                .iter()
                .filter(|c| matches_program(c.program(), program.as_ref()))
                .count();
            if seen >= count {
                return true;
            }
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    /// Polls until `count` signals have been delivered or the timeout
    /// elapses. Returns whether the count was reached.
    pub fn wait_for_signals(&self, count: usize, timeout: Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        while lock(&self.state.signals).len() < count {
            if std::time::Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        true
    }

    fn filtered(&self, kind: Launch) -> Vec<HelperCommand> {
        lock(&self.state.history)
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, c)| c.clone())
            .collect()
    }

    fn handler_for(&self, program: &Path) -> Option<Handler> {
        lock(&self.state.handlers)
            .iter()
            .rev()
            .find(|(pattern, _)| matches_program(program, pattern))
            .map(|(_, h)| Arc::clone(h))
    }
}

impl CommandRunner for FakeCommandRunner {
    fn run(&self, command: &HelperCommand) -> Result<CommandOutput> {
        lock(&self.state.history).push((Launch::Run, command.clone()));
        let Some(handler) = self.handler_for(command.program()) else {
            return Ok(CommandOutput::default());
        };

        let (process, output_rx, _signal_tx) = FakeProcess::new(command.clone());
        let code = handler(&process);
        drop(process);

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        for (pipe, data) in output_rx.try_iter().flatten() {
            match pipe {
                Pipe::Stdout => stdout.extend(data),
                Pipe::Stderr => stderr.extend(data),
            }
        }
        if code == Some(0) {
            Ok(CommandOutput { stdout, stderr })
        } else {
            Err(EnclaveError::CommandFailed {
                program: command.program_name(),
                status: code,
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            })
        }
    }

    fn start(&self, command: &HelperCommand) -> Result<RunningCommand> {
        let failing = lock(&self.state.failing_starts)
            .iter()
            .any(|p| matches_program(command.program(), p));
        if failing {
            return Err(EnclaveError::CommandLaunch {
                program: command.program_name(),
                source: io::Error::new(io::ErrorKind::NotFound, "scripted launch failure"),
            });
        }
        lock(&self.state.history).push((Launch::Start, command.clone()));

        let (process, output_rx, signal_tx) = FakeProcess::new(command.clone());
        let handle = Arc::new(FakeHandle {
            program: command.program().to_path_buf(),
            exit: Mutex::new(None),
            exited: Condvar::new(),
            signal_tx: Mutex::new(signal_tx),
            state: Arc::clone(&self.state),
        });

        let handler = self.handler_for(command.program());
        let waiter = Arc::clone(&handle);
        let _ = std::thread::spawn(move || {
            let code = handler.map_or(Some(0), |h| h(&process));
            drop(process);
            *lock(&waiter.exit) = Some(code);
            waiter.exited.notify_all();
        });

        Ok(RunningCommand::new(Box::new(ChannelOutput(output_rx)), handle))
    }
}

/// A scripted process, as seen by its handler.
pub struct FakeProcess {
    command: HelperCommand,
    output: Sender<Chunk>,
    signals: Receiver<Signal>,
}

impl FakeProcess {
    fn new(command: HelperCommand) -> (Self, Receiver<Chunk>, Sender<Signal>) {
        let (output, output_rx) = mpsc::channel();
        let (signal_tx, signals) = mpsc::channel();
        (
            Self {
                command,
                output,
                signals,
            },
            output_rx,
            signal_tx,
        )
    }

    /// The command that launched this process.
    #[must_use]
    pub const fn command(&self) -> &HelperCommand {
        &self.command
    }

    /// Writes bytes to the process's stdout.
    pub fn write_stdout(&self, data: impl AsRef<[u8]>) {
        let _ = self.output.send(Ok((Pipe::Stdout, data.as_ref().to_vec())));
    }

    /// Writes bytes to the process's stderr.
    pub fn write_stderr(&self, data: impl AsRef<[u8]>) {
        let _ = self.output.send(Ok((Pipe::Stderr, data.as_ref().to_vec())));
    }

    /// Makes the reader of this process's output see an I/O error.
    pub fn fail_output(&self, kind: io::ErrorKind) {
        let _ = self.output.send(Err(kind));
    }

    /// Blocks until a signal is delivered. Returns `None` once nobody
    /// holds a handle to the process any more.
    pub fn wait_for_signal(&self) -> Option<Signal> {
        self.signals.recv().ok()
    }

    /// Like [`wait_for_signal`](Self::wait_for_signal) with a timeout.
    pub fn wait_for_signal_timeout(&self, timeout: Duration) -> Option<Signal> {
        match self.signals.recv_timeout(timeout) {
            Ok(sig) => Some(sig),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }
}

struct FakeHandle {
    program: PathBuf,
    exit: Mutex<Option<Option<i32>>>,
    exited: Condvar,
    signal_tx: Mutex<Sender<Signal>>,
    state: Arc<State>,
}

impl ProcessHandle for FakeHandle {
    fn wait(&self) -> Result<Option<i32>> {
        let mut exit = lock(&self.exit);
        loop {
            if let Some(code) = *exit {
                return Ok(code);
            }
            exit = self
                .exited
                .wait(exit)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        if lock(&self.exit).is_some() {
            return Ok(());
        }
        lock(&self.state.signals).push((self.program.clone(), signal));
        let _ = lock(&self.signal_tx).send(signal);
        Ok(())
    }
}

/// Output written by a handler, in write order. Ends when the handler
/// returns.
struct ChannelOutput(Receiver<Chunk>);

impl OutputSource for ChannelOutput {
    fn next_chunk(&mut self) -> io::Result<Option<(Pipe, Vec<u8>)>> {
        match self.0.recv() {
            Ok(Ok(chunk)) => Ok(Some(chunk)),
            Ok(Err(kind)) => Err(io::Error::new(kind, "scripted read failure")),
            Err(_) => Ok(None),
        }
    }
}
