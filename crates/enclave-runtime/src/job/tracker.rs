//! Per-container registry of jobs.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use enclave_common::error::{EnclaveError, Result};
use enclave_common::types::{JobChunk, JobResult};
use enclave_core::command::{CommandRunner, HelperCommand};

use super::Job;

/// Hands out job IDs and tracks every job of one container.
///
/// IDs strictly increase and are never reused, including across a
/// restore.
pub struct JobTracker {
    container_path: PathBuf,
    runner: Arc<dyn CommandRunner>,
    jobs: RwLock<BTreeMap<u32, Arc<Job>>>,
    next_id: Mutex<u32>,
}

impl JobTracker {
    /// Creates an empty tracker for the container at `container_path`.
    pub fn new(container_path: impl Into<PathBuf>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            container_path: container_path.into(),
            runner,
            jobs: RwLock::new(BTreeMap::new()),
            next_id: Mutex::new(0),
        }
    }

    fn allocate_id(&self) -> u32 {
        let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
        let id = *next;
        *next += 1;
        id
    }

    fn insert(&self, job: Arc<Job>) {
        let _ = self
            .jobs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(job.id(), job);
    }

    /// Spawns `command` and returns the new job's ID once the spawn
    /// helper reports it ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the job directory cannot be created or the
    /// spawn helper fails before `ready`. No job is recorded then.
    pub fn spawn(&self, command: &HelperCommand, discard_output: bool, auto_link: bool) -> Result<u32> {
        let id = self.allocate_id();
        let job = Job::new(id, discard_output, &self.container_path, Arc::clone(&self.runner));
        job.spawn(command)?;
        self.insert(Arc::clone(&job));
        if auto_link {
            job.ensure_linking();
        }
        tracing::info!(job = id, discard_output, auto_link, "job spawned");
        Ok(id)
    }

    /// Re-registers a job whose process survived a daemon restart and
    /// starts linking to it.
    pub fn restore(&self, id: u32, discard_output: bool) {
        {
            let mut next = self.next_id.lock().unwrap_or_else(PoisonError::into_inner);
            *next = (*next).max(id.saturating_add(1));
        }
        let job = Job::new(id, discard_output, &self.container_path, Arc::clone(&self.runner));
        self.insert(Arc::clone(&job));
        job.ensure_linking();
        tracing::info!(job = id, discard_output, "job restored");
    }

    /// Looks up a job.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotFound`] for an unknown ID.
    pub fn job(&self, id: u32) -> Result<Arc<Job>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .ok_or_else(|| EnclaveError::NotFound {
                kind: "job",
                id: id.to_string(),
            })
    }

    /// Blocks until the job exits and returns its result.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotFound`] for an unknown ID.
    pub fn link(&self, id: u32) -> Result<JobResult> {
        Ok(self.job(id)?.link())
    }

    /// Subscribes to the job's output.
    ///
    /// # Errors
    ///
    /// Returns [`EnclaveError::NotFound`] for an unknown ID.
    pub fn stream(&self, id: u32) -> Result<Receiver<JobChunk>> {
        Ok(self.job(id)?.stream())
    }

    /// Jobs that have not finished linking, in ID order.
    #[must_use]
    pub fn active_jobs(&self) -> Vec<Arc<Job>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|job| !job.is_completed())
            .cloned()
            .collect()
    }
}

impl std::fmt::Debug for JobTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobTracker")
            .field("container_path", &self.container_path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use enclave_core::command::Signal;
    use enclave_core::command::fake::FakeCommandRunner;

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    fn tracker(runner: &FakeCommandRunner) -> JobTracker {
        JobTracker::new("/depot/some-id", Arc::new(runner.clone()))
    }

    fn spawn_succeeds(runner: &FakeCommandRunner) {
        runner.when_running("/depot/some-id/bin/iomux-spawn", |p| {
            p.write_stdout("ready\n");
            p.write_stdout("active\n");
            Some(0)
        });
    }

    fn link_produces(runner: &FakeCommandRunner, exit: i32) {
        runner.when_running("/depot/some-id/bin/iomux-link", move |p| {
            p.write_stdout("hi out\n");
            p.write_stderr("hi err\n");
            Some(exit)
        });
    }

    fn bash(script: &str) -> HelperCommand {
        HelperCommand::new("/bin/bash").stdin(script)
    }

    #[test]
    fn spawn_runs_iomux_spawn_in_job_dir() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        let jobs = tracker(&runner);

        let id = jobs.spawn(&bash("echo hi"), false, false).unwrap();

        let mkdir = &runner.executed()[0];
        assert_eq!(mkdir.program(), Path::new("mkdir"));
        assert_eq!(
            mkdir.get_args(),
            ["-p".to_string(), format!("/depot/some-id/jobs/{id}")]
        );

        let spawn = &runner.launched("iomux-spawn")[0];
        assert_eq!(
            spawn.get_args(),
            [format!("/depot/some-id/jobs/{id}"), "/bin/bash".to_string()]
        );
        assert_eq!(spawn.get_stdin(), Some(&b"echo hi"[..]));
    }

    #[test]
    fn spawn_returns_unique_increasing_ids() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        let jobs = tracker(&runner);
        let a = jobs.spawn(&bash("a"), false, false).unwrap();
        let b = jobs.spawn(&bash("b"), false, false).unwrap();
        assert!(b > a);
    }

    #[test]
    fn spawn_failure_records_no_job() {
        let runner = FakeCommandRunner::new();
        runner.fail_start("iomux-spawn");
        let jobs = tracker(&runner);
        assert!(jobs.spawn(&bash("x"), false, true).is_err());
        assert!(jobs.active_jobs().is_empty());
    }

    #[test]
    fn spawn_helper_exiting_before_ready_is_an_error() {
        let runner = FakeCommandRunner::new();
        runner.when_running("iomux-spawn", |_| Some(1));
        let jobs = tracker(&runner);
        assert!(matches!(
            jobs.spawn(&bash("x"), false, true),
            Err(EnclaveError::CommandFailed { status: Some(1), .. })
        ));
    }

    #[test]
    fn without_auto_link_nothing_links_until_asked() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        link_produces(&runner, 0);
        let jobs = tracker(&runner);

        let id = jobs.spawn(&bash("x"), false, false).unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(runner.launched("iomux-link").is_empty());

        let _ = jobs.link(id).unwrap();
        assert_eq!(runner.launched("iomux-link").len(), 1);
    }

    #[test]
    fn auto_link_starts_linking_in_background() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), false, true).unwrap();

        assert!(runner.wait_for_starts("iomux-link", 1, TIMEOUT));
        let link = &runner.launched("iomux-link")[0];
        assert_eq!(
            link.get_args(),
            [
                "-w".to_string(),
                format!("/depot/some-id/jobs/{id}/cursors"),
                format!("/depot/some-id/jobs/{id}"),
            ]
        );
    }

    #[test]
    fn link_returns_output_and_status() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        link_produces(&runner, 42);
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), false, false).unwrap();

        let result = jobs.link(id).unwrap();
        assert_eq!(result.exit_status, 42);
        assert_eq!(result.stdout, b"hi out\n");
        assert_eq!(result.stderr, b"hi err\n");
    }

    #[test]
    fn discarded_output_is_not_returned() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        link_produces(&runner, 7);
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), true, false).unwrap();

        let result = jobs.link(id).unwrap();
        assert_eq!(result.exit_status, 7);
        assert!(result.stdout.is_empty());
        assert!(result.stderr.is_empty());
    }

    #[test]
    fn concurrent_links_share_one_link_helper() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        runner.when_running("iomux-link", move |p| {
            p.write_stdout("out");
            let _ = release_rx.lock().unwrap().recv();
            Some(3)
        });
        let jobs = Arc::new(tracker(&runner));
        let id = jobs.spawn(&bash("x"), false, false).unwrap();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let jobs = Arc::clone(&jobs);
                thread::spawn(move || jobs.link(id).unwrap())
            })
            .collect();
        assert!(runner.wait_for_starts("iomux-link", 1, TIMEOUT));
        release_tx.send(()).unwrap();

        let results: Vec<JobResult> = waiters.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.iter().all(|r| *r == results[0]));
        assert_eq!(results[0].exit_status, 3);

        let again = jobs.link(id).unwrap();
        assert_eq!(again, results[0]);
        assert_eq!(runner.launched("iomux-link").len(), 1);
    }

    #[test]
    fn link_helper_start_failure_yields_unknown_status() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        runner.fail_start("iomux-link");
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), false, false).unwrap();
        assert_eq!(jobs.link(id).unwrap().exit_status, 255);
    }

    #[test]
    fn link_helper_killed_by_signal_yields_unknown_status() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        runner.when_running("iomux-link", |_| None);
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), false, false).unwrap();
        assert_eq!(jobs.link(id).unwrap().exit_status, 255);
    }

    #[test]
    fn stream_yields_output_then_status_then_closes() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        link_produces(&runner, 42);
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), false, false).unwrap();

        let chunks: Vec<JobChunk> = jobs.stream(id).unwrap().iter().collect();
        assert_eq!(
            chunks,
            vec![
                JobChunk::Stdout(b"hi out\n".to_vec()),
                JobChunk::Stderr(b"hi err\n".to_vec()),
                JobChunk::ExitStatus(42),
            ]
        );

        let late: Vec<JobChunk> = jobs.stream(id).unwrap().iter().collect();
        assert_eq!(late, chunks);
    }

    #[test]
    fn late_stream_receives_missed_output_first() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        let (go_tx, go_rx) = mpsc::channel::<()>();
        let go_rx = Mutex::new(go_rx);
        runner.when_running("iomux-link", move |p| {
            p.write_stdout("early\n");
            let _ = go_rx.lock().unwrap().recv();
            p.write_stdout("late\n");
            Some(0)
        });
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), false, false).unwrap();

        let first = jobs.stream(id).unwrap();
        assert_eq!(
            first.recv_timeout(TIMEOUT).unwrap(),
            JobChunk::Stdout(b"early\n".to_vec())
        );

        let second = jobs.stream(id).unwrap();
        go_tx.send(()).unwrap();

        let rest: Vec<JobChunk> = second.iter().collect();
        assert_eq!(
            rest,
            vec![
                JobChunk::Stdout(b"early\n".to_vec()),
                JobChunk::Stdout(b"late\n".to_vec()),
                JobChunk::ExitStatus(0),
            ]
        );
        assert_eq!(runner.launched("iomux-link").len(), 1);
    }

    #[test]
    fn restore_bumps_next_id_and_links() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        let jobs = tracker(&runner);

        jobs.restore(0, true);
        assert_eq!(jobs.spawn(&bash("x"), false, false).unwrap(), 1);

        jobs.restore(5, true);
        assert_eq!(jobs.spawn(&bash("x"), false, false).unwrap(), 6);

        assert!(runner.wait_for_starts("iomux-link", 2, TIMEOUT));
        let restored = runner.launched("iomux-link");
        assert!(restored.iter().any(|c| c.get_args()[2] == "/depot/some-id/jobs/5"));
    }

    #[test]
    fn restored_job_is_active_until_linked() {
        let runner = FakeCommandRunner::new();
        runner.when_running("iomux-link", |p| p.wait_for_signal().map(|_| 0));
        let jobs = tracker(&runner);
        jobs.restore(2, true);

        let active = jobs.active_jobs();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), 2);
        assert!(active[0].discard_output());
    }

    #[test]
    fn active_jobs_excludes_completed_jobs() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        let jobs = tracker(&runner);
        let done = jobs.spawn(&bash("x"), false, false).unwrap();
        let open = jobs.spawn(&bash("y"), false, false).unwrap();
        let _ = jobs.link(done).unwrap();

        let ids: Vec<u32> = jobs.active_jobs().iter().map(|j| j.id()).collect();
        assert_eq!(ids, vec![open]);
    }

    #[test]
    fn unlink_interrupts_link_helper_and_leaves_job_open() {
        let runner = FakeCommandRunner::new();
        spawn_succeeds(&runner);
        runner.when_running("iomux-link", |p| p.wait_for_signal().map(|_| 0));
        let jobs = tracker(&runner);
        let id = jobs.spawn(&bash("x"), false, true).unwrap();
        assert!(runner.wait_for_starts("iomux-link", 1, TIMEOUT));

        let job = jobs.job(id).unwrap();
        job.unlink().unwrap();

        assert!(runner.wait_for_signals(1, TIMEOUT));
        assert_eq!(runner.signals()[0].1, Signal::SIGINT);
        thread::sleep(Duration::from_millis(50));
        assert!(!job.is_completed());
        assert_eq!(jobs.active_jobs().len(), 1);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let runner = FakeCommandRunner::new();
        let jobs = tracker(&runner);
        assert!(matches!(
            jobs.link(9),
            Err(EnclaveError::NotFound { kind: "job", .. })
        ));
        assert!(jobs.stream(9).is_err());
    }
}
