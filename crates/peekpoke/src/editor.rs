//! Bulk byte and typed access to a tracee's address space.

use std::ffi::{CStr, CString};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::mem;

use bytemuck::{AnyBitPattern, NoUninit};
use nix::errno::Errno;

use crate::error::{Error, Result};
use crate::guard::StopGuard;
use crate::process::Process;
use crate::region::matching_region;
use crate::tracer::Tracer;
#[cfg(not(feature = "proc-mem-write"))]
use crate::tracer::WORD_SIZE;

/// Access mode of a memory editor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    Read,
    Write,
    ReadWrite,
}

/// Byte-level reader/writer over a tracee's address space.
///
/// Reads go through the `mem` pseudo-file. Writes are synthesized from
/// word-sized trace pokes, because the pseudo-file is read-only on
/// unmodified kernels; the `proc-mem-write` feature routes them
/// through the pseudo-file instead.
///
/// Every transfer holds the tracee stopped via [`StopGuard`].
pub struct MemoryEditor<'t> {
    tracer: &'t Tracer,
    file: File,
    mode: AccessMode,
}

impl<'t> MemoryEditor<'t> {
    /// Opens the tracee's `mem` pseudo-file in the given mode.
    pub fn new(tracer: &'t Tracer, mode: AccessMode) -> Result<Self> {
        let path = tracer.process().procfs_dir().join("mem");
        let file = OpenOptions::new()
            .read(true)
            .write(!matches!(mode, AccessMode::Read))
            .open(&path)
            .map_err(|e| Error::File(path, e))?;

        Ok(Self { tracer, file, mode })
    }

    /// Duplicates the editor; the duplicate owns its own descriptor on
    /// the same pseudo-file.
    pub fn duplicate(&self) -> Result<Self> {
        let file = self.file.try_clone()?;

        Ok(Self {
            tracer: self.tracer,
            file,
            mode: self.mode,
        })
    }

    pub fn tracer(&self) -> &'t Tracer {
        self.tracer
    }

    pub fn process(&self) -> &'t Process {
        self.tracer.process()
    }

    pub const fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Whether `addr` falls in a readable region of the tracee.
    pub fn is_readable(&self, addr: usize) -> bool {
        matching_region(self.process(), addr)
            .ok()
            .flatten()
            .is_some_and(|region| region.is_readable())
    }

    /// Whether `addr` falls in a writable region of the tracee.
    pub fn is_writable(&self, addr: usize) -> bool {
        matching_region(self.process(), addr)
            .ok()
            .flatten()
            .is_some_and(|region| region.is_writable())
    }

    /// Reads up to `dst.len()` bytes at `addr` and returns the count
    /// read.
    pub fn read(&mut self, addr: usize, dst: &mut [u8]) -> Result<usize> {
        let _guard = StopGuard::new(self.tracer)?;
        self.read_unguarded(addr, dst)
    }

    pub(crate) fn read_unguarded(&mut self, addr: usize, dst: &mut [u8]) -> Result<usize> {
        self.seek(addr)?;
        self.file.read(dst).map_err(|e| os_error("read", e))
    }

    /// Writes `src` at `addr` and returns the count written.
    pub fn write(&mut self, addr: usize, src: &[u8]) -> Result<usize> {
        if matches!(self.mode, AccessMode::Read) {
            return Err(Error::Argument("memory editor is read-only".into()));
        }

        let _guard = StopGuard::new(self.tracer)?;
        self.write_unguarded(addr, src)
    }

    #[cfg(not(feature = "proc-mem-write"))]
    fn write_unguarded(&mut self, addr: usize, src: &[u8]) -> Result<usize> {
        let mut chunks = src.chunks_exact(WORD_SIZE);
        let mut cursor = addr;

        for chunk in &mut chunks {
            let Ok(bytes) = <[u8; WORD_SIZE]>::try_from(chunk) else {
                unreachable!("chunk is exactly one word long");
            };

            self.tracer
                .write_word(cursor, usize::from_ne_bytes(bytes))
                .inspect_err(|e| {
                    tracing::error!(error = %e, addr = format_args!("{cursor:#x}"), "bulk write");
                })?;

            cursor += WORD_SIZE;
        }

        let tail = chunks.remainder();
        if !tail.is_empty() {
            // merge the partial tail into the word already there so the
            // adjacent bytes survive
            let mut bytes = self.tracer.read_word(cursor)?.to_ne_bytes();
            bytes[..tail.len()].copy_from_slice(tail);
            self.tracer.write_word(cursor, usize::from_ne_bytes(bytes))?;
        }

        Ok(src.len())
    }

    #[cfg(feature = "proc-mem-write")]
    fn write_unguarded(&mut self, addr: usize, src: &[u8]) -> Result<usize> {
        use std::io::Write;

        self.seek(addr)?;
        self.file.write(src).map_err(|e| os_error("write", e))
    }

    fn seek(&mut self, addr: usize) -> Result<()> {
        // a rejected seek is the pseudo-file's way of refusing the
        // address itself
        self.file
            .seek(SeekFrom::Start(addr as u64))
            .map(drop)
            .map_err(|e| Error::File(self.process().procfs_dir().join("mem"), e))
    }

    /// Reads one POD value, failing on a short read.
    pub fn read_value<T: AnyBitPattern>(&mut self, addr: usize) -> Result<T> {
        let mut buf = vec![0u8; mem::size_of::<T>()];

        let n = self.read(addr, &mut buf)?;
        if n != buf.len() {
            return Err(Error::PartialMemOp(n, buf.len()));
        }

        Ok(bytemuck::pod_read_unaligned(&buf))
    }

    /// Writes one POD value, failing on a short write.
    pub fn write_value<T: NoUninit>(&mut self, addr: usize, value: &T) -> Result<()> {
        let src = bytemuck::bytes_of(value);

        let n = self.write(addr, src)?;
        if n != src.len() {
            return Err(Error::PartialMemOp(n, src.len()));
        }

        Ok(())
    }

    /// Reads bytes one at a time until the terminating NUL.
    pub fn read_cstring(&mut self, addr: usize) -> Result<CString> {
        let _guard = StopGuard::new(self.tracer)?;

        let mut bytes = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            let n = self.read_unguarded(addr + bytes.len(), &mut byte)?;
            if n != 1 {
                return Err(Error::PartialMemOp(bytes.len(), bytes.len() + 1));
            }

            if byte[0] == 0 {
                // no interior NUL by construction
                return Ok(unsafe { CString::from_vec_unchecked(bytes) });
            }

            bytes.push(byte[0]);
        }
    }

    /// Writes the string including its terminating NUL.
    pub fn write_cstring(&mut self, addr: usize, value: &CStr) -> Result<()> {
        let bytes = value.to_bytes_with_nul();

        let n = self.write(addr, bytes)?;
        if n != bytes.len() {
            return Err(Error::PartialMemOp(n, bytes.len()));
        }

        Ok(())
    }

    /// Reads `count` consecutive POD values in one transfer.
    pub fn read_values<T: AnyBitPattern>(&mut self, addr: usize, count: usize) -> Result<Vec<T>> {
        let size = mem::size_of::<T>();
        if size == 0 {
            return Err(Error::Argument("zero-sized element type".into()));
        }

        let mut buf = vec![0u8; count * size];
        let n = self.read(addr, &mut buf)?;
        if n != buf.len() {
            return Err(Error::PartialMemOp(n, buf.len()));
        }

        Ok(buf
            .chunks_exact(size)
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    /// Writes a flat sequence of POD values in one transfer.
    pub fn write_values<T: NoUninit>(&mut self, addr: usize, values: &[T]) -> Result<()> {
        if mem::size_of::<T>() == 0 {
            return Err(Error::Argument("zero-sized element type".into()));
        }

        let src: &[u8] = bytemuck::cast_slice(values);

        let n = self.write(addr, src)?;
        if n != src.len() {
            return Err(Error::PartialMemOp(n, src.len()));
        }

        Ok(())
    }
}

fn os_error(call: &'static str, e: std::io::Error) -> Error {
    match e.raw_os_error() {
        Some(code) => Error::os(call, Errno::from_raw(code)),
        None => Error::Io(e),
    }
}
