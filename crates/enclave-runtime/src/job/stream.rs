//! Fan-out of a job's output to any number of observers.

use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Mutex, MutexGuard, PoisonError};

use enclave_common::types::{JobChunk, JobResult};

/// Owns a job's buffered output and its observer list.
///
/// Every write goes through one lock, so each observer sees the same
/// chunk order and a new observer is primed with the history before it
/// can receive anything live.
#[derive(Debug)]
pub(crate) struct StreamDispatcher {
    discard_output: bool,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    history: Vec<JobChunk>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    observers: Vec<Sender<JobChunk>>,
    exit_status: Option<u32>,
}

impl StreamDispatcher {
    pub(crate) fn new(discard_output: bool) -> Self {
        Self {
            discard_output,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a new observer. Buffered chunks are queued first; if the
    /// job already finished, the exit status follows and the queue is
    /// closed straight away.
    pub(crate) fn subscribe(&self) -> Receiver<JobChunk> {
        let (tx, rx) = mpsc::channel();
        let mut inner = self.lock();
        for chunk in &inner.history {
            let _ = tx.send(chunk.clone());
        }
        match inner.exit_status {
            Some(status) => {
                let _ = tx.send(JobChunk::ExitStatus(status));
            }
            None => inner.observers.push(tx),
        }
        rx
    }

    pub(crate) fn write_stdout(&self, data: &[u8]) {
        self.publish(JobChunk::Stdout(data.to_vec()));
    }

    pub(crate) fn write_stderr(&self, data: &[u8]) {
        self.publish(JobChunk::Stderr(data.to_vec()));
    }

    fn publish(&self, chunk: JobChunk) {
        let mut inner = self.lock();
        if inner.exit_status.is_some() {
            return;
        }
        inner
            .observers
            .retain(|observer| observer.send(chunk.clone()).is_ok());
        if self.discard_output {
            return;
        }
        match &chunk {
            JobChunk::Stdout(data) => inner.stdout.extend_from_slice(data),
            JobChunk::Stderr(data) => inner.stderr.extend_from_slice(data),
            JobChunk::ExitStatus(_) => {}
        }
        inner.history.push(chunk);
    }

    /// Sends the exit status to every observer, closes their queues, and
    /// returns the final result.
    pub(crate) fn finish(&self, exit_status: u32) -> JobResult {
        let mut inner = self.lock();
        inner.exit_status = Some(exit_status);
        for observer in inner.observers.drain(..) {
            let _ = observer.send(JobChunk::ExitStatus(exit_status));
        }
        JobResult {
            exit_status,
            stdout: inner.stdout.clone(),
            stderr: inner.stderr.clone(),
        }
    }
}
