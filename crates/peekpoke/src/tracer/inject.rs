//! Syscall injection into a stopped tracee, x86 and x86_64 only.

use super::{Registers, Tracer, Word, WORD_SIZE};
use crate::error::{Error, Result};
use crate::guard::StopGuard;

/// Syscalls take at most six register arguments.
const MAX_REG_ARGS: usize = 6;

impl Tracer {
    /// Executes a syscall inside the tracee and returns the raw result
    /// word (negative errno values included, as the kernel reports
    /// them).
    ///
    /// The tracee is held stopped throughout. Its general-purpose
    /// registers, floating-point registers and the instruction word at
    /// the instruction pointer are restored afterwards, on success and
    /// failure paths alike; only the stopped position of the tracee
    /// differs from an untouched one.
    pub fn inject_syscall(&self, number: Word, args: &[Word]) -> Result<Word> {
        #[cfg(target_arch = "x86_64")]
        if args.len() > MAX_REG_ARGS {
            return Err(Error::Argument(format!(
                "syscalls take at most {MAX_REG_ARGS} arguments, got {}",
                args.len()
            )));
        }

        let _guard = StopGuard::new(self)?;

        let saved_regs = self.registers()?;
        let saved_fpu = self.fpu_registers()?;
        let ip = instruction_pointer(&saved_regs);
        let saved_word = self.read_word(ip)?;

        let outcome = self.perform_syscall(&saved_regs, ip, number, args);

        // Text first, then registers: a failed step must not leave the
        // trap word live under the original instruction pointer.
        let restore = self
            .write_word(ip, saved_word)
            .and_then(|_| self.set_registers(&saved_regs))
            .and_then(|_| self.set_fpu_registers(&saved_fpu));

        match (outcome, restore) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), restore) => {
                if let Err(restore) = restore {
                    tracing::error!(
                        pid = self.pid().as_raw(),
                        error = %restore,
                        "state restore after failed injection"
                    );
                }
                Err(e)
            }
        }
    }

    fn perform_syscall(
        &self,
        saved: &Registers,
        ip: usize,
        number: Word,
        args: &[Word],
    ) -> Result<Word> {
        let mut frame = *saved;
        self.load_syscall_frame(&mut frame, number, args)?;
        self.set_registers(&frame)?;
        self.write_word(ip, trap_word())?;

        // one syscall stop at entry, one at exit
        self.step_syscall(None)?;
        self.wait_for_stop()?;
        self.step_syscall(None)?;
        self.wait_for_stop()?;

        Ok(result_register(&self.registers()?))
    }

    #[cfg(target_arch = "x86_64")]
    fn load_syscall_frame(
        &self,
        regs: &mut Registers,
        number: Word,
        args: &[Word],
    ) -> Result<()> {
        regs.rax = number as u64;

        for (i, &arg) in args.iter().enumerate() {
            let arg = arg as u64;
            match i {
                0 => regs.rdi = arg,
                1 => regs.rsi = arg,
                2 => regs.rdx = arg,
                3 => regs.r10 = arg,
                4 => regs.r8 = arg,
                5 => regs.r9 = arg,
                _ => unreachable!("argument count checked on entry"),
            }
        }

        Ok(())
    }

    #[cfg(target_arch = "x86")]
    fn load_syscall_frame(
        &self,
        regs: &mut Registers,
        number: Word,
        args: &[Word],
    ) -> Result<()> {
        use nix::libc::c_long;

        regs.eax = number as c_long;

        if args.len() <= MAX_REG_ARGS {
            for (i, &arg) in args.iter().enumerate() {
                let arg = arg as c_long;
                match i {
                    0 => regs.ebx = arg,
                    1 => regs.ecx = arg,
                    2 => regs.edx = arg,
                    3 => regs.esi = arg,
                    4 => regs.edi = arg,
                    5 => regs.ebp = arg,
                    _ => unreachable!("bounded by MAX_REG_ARGS"),
                }
            }
        } else {
            // Extra arguments spill to the tracee stack; ebx points at
            // the block.
            let esp = (regs.esp as usize) - args.len() * WORD_SIZE;
            for (i, &arg) in args.iter().enumerate() {
                self.write_word(esp + i * WORD_SIZE, arg)?;
            }

            regs.esp = esp as c_long;
            regs.ebx = esp as c_long;
        }

        Ok(())
    }
}

fn instruction_pointer(regs: &Registers) -> usize {
    #[cfg(target_arch = "x86_64")]
    {
        regs.rip as usize
    }
    #[cfg(target_arch = "x86")]
    {
        regs.eip as usize
    }
}

fn result_register(regs: &Registers) -> Word {
    #[cfg(target_arch = "x86_64")]
    {
        regs.rax as Word
    }
    #[cfg(target_arch = "x86")]
    {
        regs.eax as Word
    }
}

/// The trap-to-kernel instruction, NOP-padded to one word.
fn trap_word() -> Word {
    let mut bytes = [0x90u8; WORD_SIZE];

    #[cfg(target_arch = "x86_64")]
    {
        // syscall
        bytes[0] = 0x0f;
        bytes[1] = 0x05;
    }
    #[cfg(target_arch = "x86")]
    {
        // int 0x80
        bytes[0] = 0xcd;
        bytes[1] = 0x80;
    }

    Word::from_ne_bytes(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_word_encodes_the_kernel_trap() {
        let bytes = trap_word().to_ne_bytes();

        #[cfg(target_arch = "x86_64")]
        assert_eq!(&bytes[..2], &[0x0f, 0x05]);
        #[cfg(target_arch = "x86")]
        assert_eq!(&bytes[..2], &[0xcd, 0x80]);

        // the padding must be NOPs
        assert!(bytes[2..].iter().all(|&b| b == 0x90));
    }
}
