//! Cooperative run-loop consuming a tracee's stop events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use super::Tracer;
use crate::error::{Error, Result};
use crate::process::Process;

/// How a stop-consuming loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// The tracee exited or was terminated by a signal.
    Terminated,
    /// The stop flag was raised or the handler returned `false`.
    Stopped,
}

/// Poll interval of the wait loop; keeps the stop flag honored even
/// while the tracee sits in a ptrace-stop and produces no events.
const WAIT_POLL: Duration = Duration::from_millis(2);

impl Tracer {
    /// Consumes stop events until the tracee terminates, `handler`
    /// returns `false`, or `stop_flag` is raised.
    ///
    /// Each signal stop is handed to `handler` together with the
    /// stopping signal; returning `true` keeps the loop running. What
    /// the handler does with the stop (resume, inspect, inject) is its
    /// own business; see [`default_stop_handler`].
    pub fn consume_stops<F>(&self, stop_flag: &AtomicBool, mut handler: F) -> Result<LoopExit>
    where
        F: FnMut(&Tracer, Signal) -> bool,
    {
        loop {
            if stop_flag.load(Ordering::Acquire) {
                return Ok(LoopExit::Stopped);
            }

            let status = waitpid(self.pid(), Some(WaitPidFlag::WNOHANG))
                .map_err(|e| Error::os("waitpid", e))?;

            match status {
                WaitStatus::StillAlive => {
                    thread::sleep(WAIT_POLL);
                }
                WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                    tracing::info!(pid = self.pid().as_raw(), "tracee terminated");
                    return Ok(LoopExit::Terminated);
                }
                WaitStatus::Stopped(_, signal) => {
                    if !handler(self, signal) {
                        return Ok(LoopExit::Stopped);
                    }
                }
                // not signal stops: ptrace events and syscall stops
                _ => (),
            }
        }
    }
}

/// Default stop handler: resumes the tracee delivering the stopping
/// signal, except SIGTRAP, which leaves the tracee stopped so its
/// owner can inspect it.
pub fn default_stop_handler(tracer: &Tracer, signal: Signal) -> bool {
    if signal == Signal::SIGTRAP {
        return true;
    }

    if let Err(e) = tracer.resume(Some(signal)) {
        tracing::error!(pid = tracer.pid().as_raw(), error = %e, "resume from stop handler");
        return false;
    }

    true
}

/// A trace session driven by a dedicated worker thread.
///
/// The worker attaches to the tracee and consumes its stop events
/// until the tracee terminates or a stop is requested. ptrace commands
/// are honored only from the attaching thread, so the worker owns the
/// whole session and the handler runs on it.
pub struct TraceLoop {
    pid: Pid,
    stop_flag: Arc<AtomicBool>,
    terminated: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<LoopExit>>>,
}

impl TraceLoop {
    /// Attaches to `process` on a new worker thread, restarts it and
    /// consumes its stop events with `handler`.
    ///
    /// Blocks until the attach has completed; attach failures surface
    /// here. The tracee is restarted before the loop begins, since a
    /// tracee held in its attach stop would never produce an event.
    pub fn spawn<F>(process: Process, handler: F) -> Result<Self>
    where
        F: FnMut(&Tracer, Signal) -> bool + Send + 'static,
    {
        let pid = process.pid();
        let stop_flag = Arc::new(AtomicBool::new(false));
        let terminated = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = mpsc::channel();

        let flag = Arc::clone(&stop_flag);
        let term = Arc::clone(&terminated);
        let worker = thread::Builder::new()
            .name(format!("trace-loop-{pid}"))
            .spawn(move || {
                let attached = Tracer::attach(process)
                    .and_then(|tracer| tracer.resume(None).map(|()| tracer));

                let tracer = match attached {
                    Ok(tracer) => {
                        let _ = ready_tx.send(Ok(()));
                        tracer
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(LoopExit::Stopped);
                    }
                };

                let exit = tracer.consume_stops(&flag, handler);
                if matches!(exit, Ok(LoopExit::Terminated)) {
                    term.store(true, Ordering::Release);
                }
                exit
            })?;

        ready_rx
            .recv()
            .map_err(|_| Error::Unexpected("trace loop worker died during attach".into()))??;

        Ok(Self {
            pid,
            stop_flag,
            terminated,
            worker: Some(worker),
        })
    }

    /// Attaches with the [`default_stop_handler`].
    pub fn spawn_default(process: Process) -> Result<Self> {
        Self::spawn(process, default_stop_handler)
    }

    /// Pid of the tracee the loop drives.
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Raises the stop flag; the loop exits at its next iteration.
    pub fn request_stop(&self) {
        self.stop_flag.store(true, Ordering::Release);
    }

    /// Whether the worker observed the tracee terminating.
    pub fn has_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    /// Waits for the loop to end and reports how it ended.
    pub fn join(mut self) -> Result<LoopExit> {
        self.join_worker()
    }

    fn join_worker(&mut self) -> Result<LoopExit> {
        let Some(worker) = self.worker.take() else {
            return Err(Error::Unexpected("trace loop already joined".into()));
        };

        worker
            .join()
            .map_err(|_| Error::Unexpected("trace loop worker panicked".into()))?
    }
}

impl Drop for TraceLoop {
    fn drop(&mut self) {
        if self.worker.is_none() {
            return;
        }

        self.request_stop();
        if let Err(e) = self.join_worker() {
            tracing::error!(pid = self.pid.as_raw(), error = %e, "trace loop teardown");
        }
    }
}
