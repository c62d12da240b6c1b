//! Supervision of commands running inside a container.
//!
//! A job is started through the `iomux-spawn` helper, which keeps the
//! process running independently of the daemon. Output and exit status
//! are collected later by attaching `iomux-link` to the job directory.
//! Linking runs at most once per job; every `link` and `stream` caller
//! shares its result.

mod stream;
mod tracker;

use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::{JobChunk, JobResult, UNKNOWN_EXIT_STATUS};
use enclave_core::command::{
    CommandRunner, HelperCommand, OutputSource, Pipe, ProcessHandle, Signal,
};

use self::stream::StreamDispatcher;
pub use self::tracker::JobTracker;

#[derive(Debug)]
enum LinkState {
    NotStarted,
    Starting,
    Done(JobResult),
}

/// One command spawned inside a container.
pub struct Job {
    id: u32,
    discard_output: bool,
    container_path: PathBuf,
    runner: Arc<dyn CommandRunner>,

    link: Mutex<LinkState>,
    linked: Condvar,
    link_process: Mutex<Option<Arc<dyn ProcessHandle>>>,
    unlinked: AtomicBool,

    streams: StreamDispatcher,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Job {
    pub(crate) fn new(
        id: u32,
        discard_output: bool,
        container_path: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            discard_output,
            container_path: container_path.into(),
            runner,
            link: Mutex::new(LinkState::NotStarted),
            linked: Condvar::new(),
            link_process: Mutex::new(None),
            unlinked: AtomicBool::new(false),
            streams: StreamDispatcher::new(discard_output),
        })
    }

    /// Job ID, unique within its container.
    #[must_use]
    pub const fn id(&self) -> u32 {
        self.id
    }

    /// Whether output is discarded instead of buffered.
    #[must_use]
    pub const fn discard_output(&self) -> bool {
        self.discard_output
    }

    /// Whether linking has finished and the exit status is known.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(*lock(&self.link), LinkState::Done(_))
    }

    fn job_dir(&self) -> PathBuf {
        self.container_path.join("jobs").join(self.id.to_string())
    }

    fn helper(&self, name: &str) -> PathBuf {
        self.container_path.join("bin").join(name)
    }

    /// Starts `command` under `iomux-spawn` and blocks until the helper
    /// reports `ready`.
    pub(crate) fn spawn(&self, command: &HelperCommand) -> Result<()> {
        let job_dir = self.job_dir();
        let _ = self.runner.run(
            &HelperCommand::new("mkdir")
                .arg("-p")
                .arg(job_dir.display().to_string()),
        )?;

        let mut spawn = HelperCommand::new(self.helper("iomux-spawn"))
            .arg(job_dir.display().to_string())
            .arg(command.program_name())
            .args(command.get_args().iter().cloned())
            .envs(command.get_env().iter().cloned());
        if let Some(stdin) = command.get_stdin() {
            spawn = spawn.stdin(stdin);
        }

        let mut running = self.runner.start(&spawn)?;
        let handle = running.handle();
        let program = spawn.program_name();

        let Some(stdout) = running.take_stdout() else {
            return Err(EnclaveError::CommandLaunch {
                program,
                source: std::io::Error::other("stdout not piped"),
            });
        };
        let mut stdout = BufReader::new(stdout);

        match read_marker(&mut stdout) {
            Ok(true) => {}
            Ok(false) => {
                return Err(EnclaveError::CommandFailed {
                    program,
                    status: handle.wait().ok().flatten(),
                    stderr: "exited before the job was ready".to_string(),
                });
            }
            Err(e) => {
                let _ = handle.signal(Signal::SIGKILL);
                let _ = handle.wait();
                return Err(EnclaveError::io(&program, e));
            }
        }

        let id = self.id;
        let _ = std::thread::spawn(move || {
            match read_marker(&mut stdout) {
                Ok(true) => tracing::debug!(job = id, "job active"),
                Ok(false) => tracing::warn!(job = id, "spawn helper exited before the job became active"),
                Err(e) => tracing::warn!(job = id, error = %e, "failed reading spawn helper output"),
            }
            drain(stdout);
            if let Err(e) = handle.wait() {
                tracing::warn!(job = id, error = %e, "failed waiting for spawn helper");
            }
        });

        tracing::debug!(job = self.id, "job spawned");
        Ok(())
    }

    /// Blocks until the job has exited and returns its result.
    ///
    /// The first caller runs the link helper; later and concurrent callers
    /// wait for and share its result.
    pub fn link(&self) -> JobResult {
        let mut state = lock(&self.link);
        loop {
            match &*state {
                LinkState::Done(result) => return result.clone(),
                LinkState::Starting => {
                    state = self
                        .linked
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                LinkState::NotStarted => {
                    *state = LinkState::Starting;
                    drop(state);
                    self.run_linker();
                    state = lock(&self.link);
                }
            }
        }
    }

    /// Starts linking in the background unless it already started.
    pub(crate) fn ensure_linking(self: &Arc<Self>) {
        let mut state = lock(&self.link);
        if matches!(*state, LinkState::NotStarted) {
            *state = LinkState::Starting;
            drop(state);
            let job = Arc::clone(self);
            let _ = std::thread::spawn(move || job.run_linker());
        }
    }

    /// Returns a queue of the job's output followed by its exit status.
    ///
    /// Output already produced is replayed first. Starts linking if
    /// nothing has yet.
    pub fn stream(self: &Arc<Self>) -> Receiver<JobChunk> {
        let rx = self.streams.subscribe();
        self.ensure_linking();
        rx
    }

    /// Interrupts an in-flight link helper.
    ///
    /// The job is left unresolved: the process it tracks keeps running and
    /// a later daemon can link to it again after a restore. Callers of
    /// [`link`](Self::link) on this instance keep waiting. A link helper
    /// that is still being launched is interrupted as soon as it starts.
    ///
    /// # Errors
    ///
    /// Returns an error if the interrupt cannot be delivered.
    pub fn unlink(&self) -> Result<()> {
        if !matches!(*lock(&self.link), LinkState::Starting) {
            return Ok(());
        }
        let process = {
            let process = lock(&self.link_process);
            self.unlinked.store(true, Ordering::SeqCst);
            process.clone()
        };
        tracing::debug!(job = self.id, "unlinking job");
        if let Some(process) = process {
            process.signal(Signal::SIGINT)?;
        }
        Ok(())
    }

    fn run_linker(&self) {
        let job_dir = self.job_dir();
        let link = HelperCommand::new(self.helper("iomux-link")).args([
            "-w".to_string(),
            job_dir.join("cursors").display().to_string(),
            job_dir.display().to_string(),
        ]);

        let exit_status = match self.runner.start(&link) {
            Ok(mut running) => {
                let handle = running.handle();
                let unlinked = {
                    let mut process = lock(&self.link_process);
                    *process = Some(Arc::clone(&handle));
                    self.unlinked.load(Ordering::SeqCst)
                };
                if unlinked {
                    tracing::debug!(job = self.id, "interrupting link helper unlinked while starting");
                    if let Err(e) = handle.signal(Signal::SIGINT) {
                        tracing::warn!(job = self.id, error = %e, "failed to interrupt link helper");
                    }
                }

                if let Some(output) = running.take_output() {
                    self.relay(output);
                }

                match handle.wait() {
                    Ok(Some(code)) => u32::try_from(code).unwrap_or(UNKNOWN_EXIT_STATUS),
                    Ok(None) => UNKNOWN_EXIT_STATUS,
                    Err(e) => {
                        tracing::warn!(job = self.id, error = %e, "link helper wait failed");
                        UNKNOWN_EXIT_STATUS
                    }
                }
            }
            Err(e) => {
                tracing::warn!(job = self.id, error = %e, "link helper failed to start");
                UNKNOWN_EXIT_STATUS
            }
        };

        if self.unlinked.load(Ordering::SeqCst) {
            tracing::info!(job = self.id, "job unlinked before exit; leaving it unresolved");
            return;
        }

        let result = self.streams.finish(exit_status);
        *lock(&self.link) = LinkState::Done(result);
        self.linked.notify_all();
        tracing::debug!(job = self.id, exit_status, "job linked");
    }

    fn relay(&self, mut output: Box<dyn OutputSource>) {
        loop {
            match output.next_chunk() {
                Ok(Some((Pipe::Stdout, data))) => self.streams.write_stdout(&data),
                Ok(Some((Pipe::Stderr, data))) => self.streams.write_stderr(&data),
                Ok(None) => return,
                Err(e) => {
                    tracing::debug!(job = self.id, error = %e, "job output relay stopped");
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("discard_output", &self.discard_output)
            .finish_non_exhaustive()
    }
}

/// Reads one line; `Ok(false)` on EOF.
fn read_marker(reader: &mut impl BufRead) -> std::io::Result<bool> {
    let mut line = String::new();
    Ok(reader.read_line(&mut line)? > 0)
}

fn drain(mut reader: impl Read) {
    let _ = std::io::copy(&mut reader, &mut std::io::sink());
}

#[cfg(test)]
mod tests {
    use std::io::ErrorKind;

    use enclave_core::command::fake::FakeCommandRunner;

    use super::*;

    fn job(runner: &FakeCommandRunner) -> Arc<Job> {
        Job::new(3, false, "/depot/c1", Arc::new(runner.clone()))
    }

    #[test]
    fn unlink_before_link_helper_starts_interrupts_it_on_start() {
        let runner = FakeCommandRunner::new();
        runner.when_running("iomux-link", |p| p.wait_for_signal().map(|_| 0));
        let job = job(&runner);

        *lock(&job.link) = LinkState::Starting;
        job.unlink().unwrap();
        assert!(runner.signals().is_empty());

        job.run_linker();

        assert_eq!(
            runner.signals(),
            vec![(PathBuf::from("/depot/c1/bin/iomux-link"), Signal::SIGINT)]
        );
        assert!(!job.is_completed());
    }

    #[test]
    fn unlink_without_link_in_flight_does_nothing() {
        let runner = FakeCommandRunner::new();
        runner.when_running("iomux-link", |_| Some(5));
        let job = job(&runner);

        job.unlink().unwrap();

        assert_eq!(job.link().exit_status, 5);
        assert!(runner.signals().is_empty());
    }

    #[test]
    fn link_relays_output_in_write_order() {
        let runner = FakeCommandRunner::new();
        runner.when_running("iomux-link", |p| {
            p.write_stdout("one\n");
            p.write_stderr("two\n");
            p.write_stdout("three\n");
            Some(0)
        });
        let job = job(&runner);

        let chunks: Vec<JobChunk> = job.stream().iter().collect();
        assert_eq!(
            chunks,
            vec![
                JobChunk::Stdout(b"one\n".to_vec()),
                JobChunk::Stderr(b"two\n".to_vec()),
                JobChunk::Stdout(b"three\n".to_vec()),
                JobChunk::ExitStatus(0),
            ]
        );
    }

    #[test]
    fn spawn_read_failure_kills_and_reaps_helper() {
        let runner = FakeCommandRunner::new();
        runner.when_running("iomux-spawn", |p| {
            p.fail_output(ErrorKind::BrokenPipe);
            p.wait_for_signal().map(|_| 137)
        });
        let job = job(&runner);

        let err = job.spawn(&HelperCommand::new("/bin/bash")).unwrap_err();

        assert!(matches!(err, EnclaveError::Io { .. }));
        assert_eq!(
            runner.signals(),
            vec![(PathBuf::from("/depot/c1/bin/iomux-spawn"), Signal::SIGKILL)]
        );
    }
}
