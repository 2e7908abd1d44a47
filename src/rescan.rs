//! Worklist rebuilds off the state-owning thread.
//!
//! The worker only reads the catalogue and the extraction tree. Its result
//! comes back over a channel and is applied by whoever owns the
//! `ObjectState`, so state and store are never touched concurrently.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::catalogue;
use crate::catalogue::extractions::CancelToken;
use crate::catalogue::worklist::{self, BuildReport, BuildRequest, Worklist};

pub type BuildOutcome = catalogue::Result<(Worklist, BuildReport)>;

struct Job {
    generation: u64,
    cancel: CancelToken,
    rx: Receiver<BuildOutcome>,
    _handle: JoinHandle<()>,
}

/// At most one rebuild in flight; starting another supersedes it.
#[derive(Default)]
pub struct Rescanner {
    job: Option<Job>,
    generation: u64,
}

impl Rescanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a rebuild, cancelling any rebuild still running. Returns the
    /// generation number of the new job.
    pub fn start(&mut self, request: BuildRequest) -> u64 {
        self.cancel();
        self.generation += 1;
        let generation = self.generation;

        let cancel = CancelToken::new();
        let worker_cancel = cancel.clone();
        let (tx, rx) = mpsc::channel();
        let handle = std::thread::spawn(move || {
            let outcome = worklist::build(&request, &worker_cancel);
            if worker_cancel.is_cancelled() {
                log::debug!("Rescan {} finished after being superseded", generation);
            }
            // The receiver is gone when the job was superseded.
            let _ = tx.send(outcome);
        });

        log::info!("Rescan {} started", generation);
        self.job = Some(Job {
            generation,
            cancel,
            rx,
            _handle: handle,
        });
        generation
    }

    /// Cancel the rebuild in flight, if any. Its result is discarded.
    pub fn cancel(&mut self) {
        if let Some(job) = self.job.take() {
            log::info!("Cancelling rescan {}", job.generation);
            job.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.job.is_some()
    }

    /// Generation of the job in flight.
    pub fn current_generation(&self) -> Option<u64> {
        self.job.as_ref().map(|j| j.generation)
    }

    /// Non-blocking poll for the finished rebuild.
    pub fn try_recv(&mut self) -> Option<BuildOutcome> {
        let job = self.job.as_ref()?;
        match job.rx.try_recv() {
            Ok(outcome) => {
                self.job = None;
                Some(outcome)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::warn!("Rescan {} worker exited without a result", job.generation);
                self.job = None;
                None
            }
        }
    }

    /// Block up to `timeout` for the finished rebuild.
    pub fn wait(&mut self, timeout: Duration) -> Option<BuildOutcome> {
        let job = self.job.as_ref()?;
        match job.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                self.job = None;
                Some(outcome)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                log::warn!("Rescan {} worker exited without a result", job.generation);
                self.job = None;
                None
            }
        }
    }
}

impl Drop for Rescanner {
    fn drop(&mut self) {
        self.cancel();
    }
}
