pub mod bus;
pub mod dtd;

pub use bus::{NodeSnapshot, RingBus, RingConfig, RingMessage, RingStats};
pub use dtd::{CacheLine, CoherencyAction, DirectoryStats, LineState, TagDirectory};
