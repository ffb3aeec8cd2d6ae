use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use crate::arch::{ArchProfile, NUM_GPRS, NUM_MASK_REGISTERS, NUM_VECTOR_REGISTERS};

/// Per-core architectural register file: 32 512-bit vector registers, 8
/// 16-bit mask registers, 16 general-purpose registers, rip and rflags.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    pub zmm: [[u64; 8]; NUM_VECTOR_REGISTERS],
    pub k: [u16; NUM_MASK_REGISTERS],
    pub gpr: [u64; NUM_GPRS],
    pub rip: u64,
    pub rflags: u64,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self {
            zmm: [[0; 8]; NUM_VECTOR_REGISTERS],
            k: [0; NUM_MASK_REGISTERS],
            gpr: [0; NUM_GPRS],
            rip: 0,
            rflags: 0,
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CoreState {
    pub regs: RegisterFile,
    pub cycles_executed: u64,
}

/// One simulated core. The register state is owned by the core's worker
/// thread through the mutex; the halt flag is shared with the coordinator.
pub struct Core {
    pub core_id: usize,
    pub tile_id: usize,
    pub state: Mutex<CoreState>,
    halted: AtomicBool,
    cycles: AtomicU64,
}

impl Core {
    pub fn new(core_id: usize, profile: &ArchProfile) -> Self {
        Self {
            core_id,
            tile_id: profile.tile_of_core(core_id),
            state: Mutex::new(CoreState::default()),
            // cores come up halted; program load releases them
            halted: AtomicBool::new(true),
            cycles: AtomicU64::new(0),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Relaxed)
    }

    pub fn halt(&self) {
        self.halted.store(true, Ordering::Relaxed);
    }

    pub fn unhalt(&self) {
        self.halted.store(false, Ordering::Relaxed);
    }

    /// Mirror of `CoreState::cycles_executed` readable without the state lock.
    pub fn cycles_executed(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub(crate) fn publish_cycles(&self, cycles: u64) {
        self.cycles.store(cycles, Ordering::Relaxed);
    }

    /// Reset registers and release the core at `entry`.
    pub fn start_at(&self, entry: u64) {
        let mut state = self.state.lock().expect("core state poisoned");
        state.regs = RegisterFile::default();
        state.regs.rip = entry;
        drop(state);
        self.unhalt();
    }

    pub fn dump_state(&self) -> String {
        let state = self.state.lock().expect("core state poisoned");
        let mut out = format!(
            "core {} (tile {}): rip={:#x} rflags={:#x} halted={} cycles={}\n",
            self.core_id,
            self.tile_id,
            state.regs.rip,
            state.regs.rflags,
            self.is_halted(),
            state.cycles_executed,
        );
        for (i, gpr) in state.regs.gpr.iter().enumerate() {
            out.push_str(&format!("  r{i}: {gpr:#018x}\n"));
        }
        out
    }
}
