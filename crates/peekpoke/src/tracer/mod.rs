//! Execution control over one tracee through the kernel's ptrace
//! interface.

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
mod inject;
mod run_loop;

pub use self::run_loop::{default_stop_handler, LoopExit, TraceLoop};

use std::ffi::c_void;
use std::mem::MaybeUninit;

use nix::errno::Errno;
use nix::libc;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::{Error, Result};
use crate::process::Process;

/// Native machine word, the unit of single ptrace transfers.
pub type Word = usize;

/// Size of one [`Word`] in bytes.
pub const WORD_SIZE: usize = std::mem::size_of::<Word>();

/// General-purpose register file of a tracee.
pub type Registers = libc::user_regs_struct;

/// Floating-point register file of a tracee.
pub type FpuRegisters = libc::user_fpregs_struct;

/// Metadata of the last signal delivered to a tracee.
pub type SignalInfo = libc::siginfo_t;

/// Trace session over one tracee.
///
/// At most one tracer may be attached to a tracee; the session owns
/// the kernel trace relationship and detaches when dropped. All
/// register and memory transfers require the tracee to be stopped.
pub struct Tracer {
    process: Process,
    detached: bool,
}

impl Tracer {
    /// Attaches to `process`.
    ///
    /// The kernel delivers the attach stop asynchronously, so this
    /// blocks until the tracee reports a stopped state.
    pub fn attach(process: Process) -> Result<Self> {
        ptrace::attach(process.pid()).map_err(|e| Error::os("ptrace(PTRACE_ATTACH)", e))?;

        let tracer = Self {
            process,
            detached: false,
        };
        tracer.wait_for_stop()?;

        tracing::debug!(pid = tracer.pid().as_raw(), "attached");

        Ok(tracer)
    }

    /// The traced process.
    pub fn process(&self) -> &Process {
        &self.process
    }

    pub fn pid(&self) -> Pid {
        self.process.pid()
    }

    /// Detaches from the tracee, ending the session.
    ///
    /// Dropping the session also detaches, but swallows failures;
    /// this form surfaces them.
    pub fn detach(mut self) -> Result<()> {
        self.detached = true;
        ptrace::detach(self.pid(), None).map_err(|e| Error::os("ptrace(PTRACE_DETACH)", e))
    }

    /// Restarts the stopped tracee, delivering `signal` into it if
    /// given.
    pub fn resume(&self, signal: Option<Signal>) -> Result<()> {
        ptrace::cont(self.pid(), signal).map_err(|e| Error::os("ptrace(PTRACE_CONT)", e))
    }

    /// Restarts the stopped tracee for a single instruction.
    pub fn single_step(&self, signal: Option<Signal>) -> Result<()> {
        ptrace::step(self.pid(), signal).map_err(|e| Error::os("ptrace(PTRACE_SINGLESTEP)", e))
    }

    /// Restarts the stopped tracee until the next syscall entry or
    /// exit.
    pub fn step_syscall(&self, signal: Option<Signal>) -> Result<()> {
        ptrace::syscall(self.pid(), signal).map_err(|e| Error::os("ptrace(PTRACE_SYSCALL)", e))
    }

    /// Terminates the tracee through the trace protocol.
    pub fn kill(&self) -> Result<()> {
        ptrace::kill(self.pid()).map_err(|e| Error::os("ptrace(PTRACE_KILL)", e))
    }

    /// Sends SIGSTOP to the tracee, outside the trace protocol.
    pub fn stop(&self) -> Result<()> {
        self.send_signal(Signal::SIGSTOP)
    }

    /// Sends SIGCONT to the tracee, outside the trace protocol.
    pub fn cont(&self) -> Result<()> {
        self.send_signal(Signal::SIGCONT)
    }

    /// Delivers an arbitrary signal to the tracee.
    pub fn send_signal(&self, signal: Signal) -> Result<()> {
        signal::kill(self.pid(), signal).map_err(|e| Error::os("kill", e))
    }

    /// Blocks until the tracee reports a stop.
    pub fn wait_for_stop(&self) -> Result<WaitStatus> {
        let status = waitpid(self.pid(), None).map_err(|e| Error::os("waitpid", e))?;

        match status {
            WaitStatus::Stopped(..) | WaitStatus::PtraceSyscall(_) | WaitStatus::PtraceEvent(..) => {
                Ok(status)
            }
            other => Err(Error::BadWait(other)),
        }
    }

    /// Reads one word from the tracee's data space.
    ///
    /// A word of all ones is a legitimate value; the underlying peek
    /// distinguishes it from a failure by errno discipline.
    pub fn read_word(&self, addr: usize) -> Result<Word> {
        ptrace::read(self.pid(), addr as *mut c_void)
            .map(|word| word as Word)
            .map_err(|e| Error::os("ptrace(PTRACE_PEEKDATA)", e))
    }

    /// Writes one word into the tracee's data space.
    pub fn write_word(&self, addr: usize, word: Word) -> Result<()> {
        ptrace::write(self.pid(), addr as *mut c_void, word as libc::c_long)
            .map_err(|e| Error::os("ptrace(PTRACE_POKEDATA)", e))
    }

    /// Reads one word from the tracee's user area at a byte offset.
    pub fn read_user_word(&self, offset: usize) -> Result<Word> {
        ptrace::read_user(self.pid(), offset as *mut c_void)
            .map(|word| word as Word)
            .map_err(|e| Error::os("ptrace(PTRACE_PEEKUSER)", e))
    }

    /// Writes one word into the tracee's user area at a byte offset.
    pub fn write_user_word(&self, offset: usize, word: Word) -> Result<()> {
        ptrace::write_user(self.pid(), offset as *mut c_void, word as libc::c_long)
            .map_err(|e| Error::os("ptrace(PTRACE_POKEUSER)", e))
    }

    /// Copies the tracee's general-purpose registers.
    pub fn registers(&self) -> Result<Registers> {
        ptrace::getregs(self.pid()).map_err(|e| Error::os("ptrace(PTRACE_GETREGS)", e))
    }

    /// Overwrites the tracee's general-purpose registers.
    pub fn set_registers(&self, regs: &Registers) -> Result<()> {
        ptrace::setregs(self.pid(), *regs).map_err(|e| Error::os("ptrace(PTRACE_SETREGS)", e))
    }

    /// Copies the tracee's floating-point registers.
    pub fn fpu_registers(&self) -> Result<FpuRegisters> {
        let mut regs = MaybeUninit::<FpuRegisters>::uninit();

        unsafe {
            Errno::result(libc::ptrace(
                libc::PTRACE_GETFPREGS,
                libc::pid_t::from(self.pid()),
                std::ptr::null_mut::<c_void>(),
                regs.as_mut_ptr(),
            ))
            .map_err(|e| Error::os("ptrace(PTRACE_GETFPREGS)", e))?;
        }

        Ok(unsafe { regs.assume_init() })
    }

    /// Overwrites the tracee's floating-point registers.
    pub fn set_fpu_registers(&self, regs: &FpuRegisters) -> Result<()> {
        unsafe {
            Errno::result(libc::ptrace(
                libc::PTRACE_SETFPREGS,
                libc::pid_t::from(self.pid()),
                std::ptr::null_mut::<c_void>(),
                regs as *const FpuRegisters,
            ))
            .map_err(|e| Error::os("ptrace(PTRACE_SETFPREGS)", e))?;
        }

        Ok(())
    }

    /// Retrieves metadata of the signal that caused the current stop.
    pub fn signal_info(&self) -> Result<SignalInfo> {
        ptrace::getsiginfo(self.pid()).map_err(|e| Error::os("ptrace(PTRACE_GETSIGINFO)", e))
    }

    /// Overwrites the pending signal metadata.
    pub fn set_signal_info(&self, info: &SignalInfo) -> Result<()> {
        ptrace::setsiginfo(self.pid(), info)
            .map_err(|e| Error::os("ptrace(PTRACE_SETSIGINFO)", e))
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        if self.detached {
            return;
        }

        match ptrace::detach(self.process.pid(), None) {
            Ok(()) => tracing::debug!(pid = self.process.pid().as_raw(), "detached"),
            // the tracee is already gone
            Err(Errno::ESRCH) => (),
            Err(e) => {
                tracing::error!(pid = self.process.pid().as_raw(), error = %e, "ptrace(PTRACE_DETACH)");
            }
        }
    }
}
