pub mod config;
pub mod elf;
pub mod perf;
pub mod top;
