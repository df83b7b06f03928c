//! Inspect and manipulate the state of live Linux processes.
//!
//! This crate is a library rendition of a debugger's toolbox: it
//! enumerates processes through the `/proc` filesystem, parses their
//! status and memory map, controls their execution through the
//! kernel's ptrace interface, reads and writes their address space,
//! and searches it for byte sequences or wildcard patterns. Root
//! privileges (or an otherwise ptrace-capable caller) are assumed.
//!
//! The pieces layer bottom-up: a [`Process`] names a tracee and its
//! procfs records, [`regions`] streams its memory map, a [`Tracer`]
//! owns the trace relationship and moves words and registers, a
//! [`MemoryEditor`] layers bulk typed I/O on top, and a [`Scanner`]
//! composes the editor with the region stream.
//!
//! ```no_run
//! use nix::unistd::Pid;
//! use peekpoke::{AccessMode, MemoryEditor, Process, Scanner, Tracer};
//!
//! # fn main() -> peekpoke::Result<()> {
//! let process = Process::open(Pid::from_raw(4242))?;
//! println!("tracing {}", process.status()?.comm);
//!
//! let tracer = Tracer::attach(process)?;
//! let editor = MemoryEditor::new(&tracer, AccessMode::ReadWrite)?;
//!
//! let mut scanner = Scanner::new(editor);
//! if let Some(addr) = scanner.find_with_permissions(&[0xDE, 0xAD, 0xBE, 0xEF], "rw-*")? {
//!     println!("needle at {addr:#x}");
//! }
//!
//! drop(scanner);
//! tracer.detach()?;
//! # Ok(())
//! # }
//! ```
//!
//! One tracer drives at most one tracee, and every bulk memory
//! operation holds the tracee stopped through a scoped [`StopGuard`].
//! The signal-driven side of the trace protocol is available either as
//! low-level resume/wait calls on [`Tracer`] or as a per-session
//! worker loop, [`TraceLoop`].

pub mod editor;
pub mod error;
pub mod guard;
pub mod process;
pub mod region;
pub mod scanner;
pub mod tracer;

pub use self::editor::{AccessMode, MemoryEditor};
pub use self::error::{Error, Result};
pub use self::guard::StopGuard;
pub use self::process::{
    process_by_name, processes, processes_by_name, Process, ProcessState, ProcessStatus, COMM_LEN,
};
pub use self::region::{matching_region, regions, Region, Regions};
pub use self::scanner::{value_bytes, Needle, Pattern, Scanner};
pub use self::tracer::{
    default_stop_handler, FpuRegisters, LoopExit, Registers, SignalInfo, TraceLoop, Tracer, Word,
    WORD_SIZE,
};

// signatures across the crate speak these types
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
