//! Scoped "tracee is stopped" acquisition.

use std::marker::PhantomData;

use crate::error::Result;
use crate::tracer::Tracer;

/// Holds the tracee stopped for the guard's lifetime.
///
/// Construction reads the tracee's state; if it is not already
/// stopped, the guard sends it a stop signal, consumes the resulting
/// stop so the tracee is held in a ptrace-stop, and remembers that it
/// did. Drop restarts the tracee iff this guard issued the stop, so
/// under nesting the tracee resumes exactly once, when the outermost
/// guard unwinds.
///
/// Every bulk memory operation and the syscall injector take this
/// guard at entry. Callers driving raw trace requests without a guard
/// maintain the stopped invariant themselves.
pub struct StopGuard<'t> {
    tracer: &'t Tracer,
    stopped_by_us: bool,
    // borrow-scoped and thread-bound
    _marker: PhantomData<*mut ()>,
}

impl<'t> StopGuard<'t> {
    /// Stops the tracee if it is running and blocks until the stopped
    /// state is observable.
    pub fn new(tracer: &'t Tracer) -> Result<Self> {
        let status = tracer.process().status()?;

        let stopped_by_us = if status.is_stopped() {
            false
        } else {
            tracer.stop()?;
            // A stopped but unwaited tracee is stuck mid-delivery,
            // where only the tracer can restart it; consuming the stop
            // here makes the release in drop well-defined.
            tracer.wait_for_stop()?;
            true
        };

        Ok(Self {
            tracer,
            stopped_by_us,
            _marker: PhantomData,
        })
    }

    /// Whether this guard issued the stop.
    pub fn stopped_tracee(&self) -> bool {
        self.stopped_by_us
    }
}

impl Drop for StopGuard<'_> {
    fn drop(&mut self) {
        if !self.stopped_by_us {
            return;
        }

        // restart without delivering the stop signal we injected
        if let Err(e) = self.tracer.resume(None) {
            tracing::error!(
                pid = self.tracer.pid().as_raw(),
                error = %e,
                "resume at stop-guard release"
            );
        }
    }
}
