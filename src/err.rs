use thiserror::Error;

/// Simulation-wide error kinds.
///
/// Per-core faults halt only the offending core; the global halt flag is set
/// only by the exit syscall.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("memory access out of range: address {addr:#x}, size {size}")]
    MemoryAccess { addr: u64, size: u64 },

    #[error("invalid instruction at {pc:#x}")]
    InvalidInstruction { pc: u64 },

    #[error("divide by zero")]
    DivideByZero,

    #[error("arithmetic overflow")]
    Overflow,

    #[error("arithmetic underflow")]
    Underflow,

    #[error("unsupported system call {0}")]
    SystemCall(u64),

    #[error("ring buffer full")]
    BufferFull,
}

pub type Result<T> = std::result::Result<T, SimError>;
