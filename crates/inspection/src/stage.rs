//! Dedicated worker threads for the blocking stages of a cycle.
//!
//! Capture and inference run off the control thread so the orchestrator can
//! stop waiting on them. A stage that overruns its deadline keeps working in
//! the background; its late result is thrown away and the stage refuses new
//! work until it has finished.

use std::{io, thread, time::Duration};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use thiserror::Error;
use tracing::debug;

use crate::telemetry;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum StageError {
    #[error("{stage} stage exceeded its {timeout:?} deadline")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
    #[error("{stage} stage is still busy with an abandoned request")]
    Busy { stage: &'static str },
    #[error("{stage} stage worker stopped")]
    Stopped { stage: &'static str },
}

pub(crate) struct StageWorker<I, O> {
    stage: &'static str,
    timeout: Option<Duration>,
    requests: Option<Sender<I>>,
    replies: Receiver<O>,
    busy: bool,
    handle: Option<thread::JoinHandle<()>>,
}

impl<I, O> StageWorker<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Spawn a worker running `work` for every request. `timeout` bounds how
    /// long [`call`](Self::call) waits; `None` waits indefinitely.
    pub(crate) fn spawn<F>(
        stage: &'static str,
        timeout: Option<Duration>,
        mut work: F,
    ) -> io::Result<Self>
    where
        F: FnMut(I) -> O + Send + 'static,
    {
        let (request_tx, request_rx) = bounded::<I>(1);
        let (reply_tx, reply_rx) = bounded::<O>(1);
        let handle = telemetry::spawn_thread(format!("inspection-{stage}"), move || {
            for input in request_rx.iter() {
                if reply_tx.send(work(input)).is_err() {
                    break;
                }
            }
        })?;

        Ok(Self {
            stage,
            timeout,
            requests: Some(request_tx),
            replies: reply_rx,
            busy: false,
            handle: Some(handle),
        })
    }

    /// Hand `input` to the worker and wait for its result.
    pub(crate) fn call(&mut self, input: I) -> Result<O, StageError> {
        while self.replies.try_recv().is_ok() {
            debug!("{} stage: discarded late result", self.stage);
            self.busy = false;
        }
        if self.busy {
            return Err(StageError::Busy { stage: self.stage });
        }

        let requests = self
            .requests
            .as_ref()
            .ok_or(StageError::Stopped { stage: self.stage })?;
        match requests.try_send(input) {
            Ok(()) => self.busy = true,
            Err(TrySendError::Full(_)) => return Err(StageError::Busy { stage: self.stage }),
            Err(TrySendError::Disconnected(_)) => {
                return Err(StageError::Stopped { stage: self.stage });
            }
        }

        let received = match self.timeout {
            Some(timeout) => self.replies.recv_timeout(timeout),
            None => self
                .replies
                .recv()
                .map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok(output) => {
                self.busy = false;
                Ok(output)
            }
            Err(RecvTimeoutError::Timeout) => Err(StageError::Timeout {
                stage: self.stage,
                timeout: self.timeout.unwrap_or_default(),
            }),
            Err(RecvTimeoutError::Disconnected) => {
                self.busy = false;
                Err(StageError::Stopped { stage: self.stage })
            }
        }
    }
}

impl<I, O> Drop for StageWorker<I, O> {
    fn drop(&mut self) {
        self.requests.take();
        // A worker stuck on an abandoned request is left to finish on its own.
        if !self.busy {
            if let Some(handle) = self.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use super::*;

    #[test]
    fn returns_worker_results_in_order() {
        let mut worker = StageWorker::spawn("double", None, |n: u32| n * 2).unwrap();
        assert_eq!(worker.call(2), Ok(4));
        assert_eq!(worker.call(21), Ok(42));
    }

    #[test]
    fn overrun_times_out_then_reports_busy_then_recovers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let mut worker = StageWorker::spawn("slow", Some(Duration::from_millis(50)), move |delay: u64| {
            seen.fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(delay));
            delay
        })
        .unwrap();

        assert_eq!(
            worker.call(400),
            Err(StageError::Timeout {
                stage: "slow",
                timeout: Duration::from_millis(50)
            })
        );
        assert_eq!(worker.call(0), Err(StageError::Busy { stage: "slow" }));

        thread::sleep(Duration::from_millis(600));
        assert_eq!(worker.call(1), Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
