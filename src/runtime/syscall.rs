use std::io::Write;

use log::{info, warn};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::err::{Result, SimError};
use crate::mem::MemorySystem;
use crate::runtime::core::CoreState;

/// Linux-style syscall numbers the guest may raise. Only exit, write and
/// read are serviced; the rest are recognized but unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum Syscall {
    Read = 0,
    Write = 1,
    Open = 2,
    Close = 3,
    Mmap = 9,
    Munmap = 11,
    Brk = 12,
    Ioctl = 16,
    Exit = 60,
}

/// Effect a dispatched syscall has on the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallEffect {
    Continue,
    /// exit: this core and every other one stops.
    HaltAll { exit_code: u64 },
}

/// Dispatch the syscall selected by `gpr[0]`; arguments follow in
/// `gpr[1..]`. Unsupported numbers surface as `SystemCall` so the caller
/// can post -1 and keep the core running.
pub fn dispatch(core_id: usize, state: &mut CoreState, mem: &MemorySystem) -> Result<SyscallEffect> {
    let number = state.regs.gpr[0];
    match Syscall::from_u64(number) {
        Some(Syscall::Exit) => {
            let exit_code = state.regs.gpr[0];
            info!("core {core_id}: exit with code {exit_code}");
            Ok(SyscallEffect::HaltAll { exit_code })
        }
        Some(Syscall::Write) => {
            sys_write(state, mem)?;
            Ok(SyscallEffect::Continue)
        }
        Some(Syscall::Read) => {
            sys_read(state);
            Ok(SyscallEffect::Continue)
        }
        _ => {
            warn!("core {core_id}: unimplemented system call {number}");
            Err(SimError::SystemCall(number))
        }
    }
}

fn sys_write(state: &mut CoreState, mem: &MemorySystem) -> Result<()> {
    let fd = state.regs.gpr[1];
    let buf = state.regs.gpr[2];
    let count = state.regs.gpr[3];

    if fd != 1 {
        state.regs.gpr[0] = -1i64 as u64;
        return Ok(());
    }

    let data = mem.read(buf, count)?;
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(&data);
    let _ = stdout.flush();
    state.regs.gpr[0] = count;
    Ok(())
}

fn sys_read(state: &mut CoreState) {
    let fd = state.regs.gpr[1];
    // stdin reports end-of-file; everything else is an error
    state.regs.gpr[0] = if fd == 0 { 0 } else { -1i64 as u64 };
}
