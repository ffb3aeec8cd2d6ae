use clap::ValueEnum;
use serde::Deserialize;

pub const CACHE_LINE_SIZE: u64 = 64;
pub const NUM_VECTOR_REGISTERS: usize = 32;
pub const VECTOR_BYTES: usize = 64;
pub const NUM_MASK_REGISTERS: usize = 8;
pub const NUM_GPRS: usize = 16;

/// Target architecture generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// Knights Corner (Xeon Phi 5110P/7120P)
    Knc,
    /// Knights Landing (Xeon Phi 7210/7250)
    Knl,
}

impl Arch {
    pub fn profile(self) -> ArchProfile {
        match self {
            Arch::Knc => ArchProfile::knc(),
            Arch::Knl => ArchProfile::knl(),
        }
    }
}

/// Immutable description of the modeled machine. Constructed once and handed
/// to every subsystem by `Arc`; nothing consults a process-wide architecture.
#[derive(Debug, Clone, Copy)]
pub struct ArchProfile {
    pub arch: Arch,
    pub name: &'static str,
    pub num_cores: usize,
    pub cores_per_tile: usize,
    pub num_tiles: usize,
    pub num_banks: usize,
    pub memory_size: u64,
    pub clock_hz: u64,
    pub num_rings: usize,
    pub ring_bandwidth_mbps: u32,
    pub ring_latency_cycles: u64,
    pub l1_size: usize,
    pub l2_size: usize,
}

impl ArchProfile {
    pub fn knc() -> Self {
        Self {
            arch: Arch::Knc,
            name: "Knights Corner (KNC)",
            num_cores: 60,
            cores_per_tile: 4,
            num_tiles: 15,
            num_banks: 8,
            memory_size: 8 << 30,
            clock_hz: 1_053_000_000,
            num_rings: 1,
            ring_bandwidth_mbps: 134_784,
            ring_latency_cycles: 2,
            l1_size: 32 << 10,
            l2_size: 512 << 10,
        }
    }

    pub fn knl() -> Self {
        Self {
            arch: Arch::Knl,
            name: "Knights Landing (KNL)",
            num_cores: 68,
            cores_per_tile: 2,
            num_tiles: 34,
            num_banks: 38,
            memory_size: 16 << 30,
            clock_hz: 1_400_000_000,
            num_rings: 2,
            ring_bandwidth_mbps: 213_312,
            ring_latency_cycles: 2,
            l1_size: 32 << 10,
            l2_size: 1 << 20,
        }
    }

    /// Duration of one core clock cycle in nanoseconds (KNC ~0.95, KNL ~0.71).
    pub fn cycle_time_ns(&self) -> f64 {
        1e9 / self.clock_hz as f64
    }

    pub fn tile_of_core(&self, core_id: usize) -> usize {
        core_id / self.cores_per_tile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn knc_profile_geometry() {
        let p = ArchProfile::knc();
        assert_eq!(p.num_cores, 60);
        assert_eq!(p.num_cores, p.cores_per_tile * p.num_tiles);
        assert_eq!(p.num_banks, 8);
        assert_eq!(p.memory_size, 8 * 1024 * 1024 * 1024);
        assert_eq!(p.num_rings, 1);
    }

    #[test]
    fn knl_profile_geometry() {
        let p = ArchProfile::knl();
        assert_eq!(p.num_cores, 68);
        assert_eq!(p.num_cores, p.cores_per_tile * p.num_tiles);
        assert_eq!(p.num_banks, 38);
        assert_eq!(p.memory_size, 16 * 1024 * 1024 * 1024);
        assert_eq!(p.num_rings, 2);
    }

    #[test]
    fn cycle_times() {
        assert!((ArchProfile::knc().cycle_time_ns() - 0.9497).abs() < 1e-3);
        assert!((ArchProfile::knl().cycle_time_ns() - 0.7143).abs() < 1e-3);
    }

    #[test]
    fn tile_mapping() {
        let knc = ArchProfile::knc();
        assert_eq!(knc.tile_of_core(0), 0);
        assert_eq!(knc.tile_of_core(3), 0);
        assert_eq!(knc.tile_of_core(4), 1);
        assert_eq!(knc.tile_of_core(59), 14);
        let knl = ArchProfile::knl();
        assert_eq!(knl.tile_of_core(67), 33);
    }
}
