use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use log::info;
use serde::Serialize;

use crate::runtime::ExecutionHooks;
use crate::xlate::Translation;

/// Per-core performance counters.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CoreCounters {
    pub instructions_retired: u64,
    pub vector_instructions: u64,
    pub memory_accesses: u64,
    pub l1_hits: u64,
    pub l1_misses: u64,
    pub l2_hits: u64,
    pub l2_misses: u64,
    pub ring_bus_transactions: u64,
    pub cycles: u64,
}

impl CoreCounters {
    pub fn ipc(&self) -> f64 {
        if self.cycles > 0 {
            self.instructions_retired as f64 / self.cycles as f64
        } else {
            0.0
        }
    }

    fn accumulate(&mut self, other: &CoreCounters) {
        self.instructions_retired += other.instructions_retired;
        self.vector_instructions += other.vector_instructions;
        self.memory_accesses += other.memory_accesses;
        self.l1_hits += other.l1_hits;
        self.l1_misses += other.l1_misses;
        self.l2_hits += other.l2_hits;
        self.l2_misses += other.l2_misses;
        self.ring_bus_transactions += other.ring_bus_transactions;
        self.cycles += other.cycles;
    }
}

#[derive(Debug, Serialize)]
pub struct PerfSummary {
    pub num_cores: usize,
    pub wall_seconds: f64,
    pub total: CoreCounters,
    pub ipc: f64,
    pub per_core: Vec<CoreCounters>,
}

/// Execution observer keeping per-core counters; exports CSV and a JSON
/// aggregate at the end of a run.
pub struct PerfMonitor {
    enabled: AtomicBool,
    data: Mutex<Vec<CoreCounters>>,
    started: Instant,
}

impl PerfMonitor {
    pub fn new(num_cores: usize) -> Self {
        info!("performance monitor initialized for {num_cores} cores");
        Self {
            enabled: AtomicBool::new(true),
            data: Mutex::new(vec![CoreCounters::default(); num_cores]),
            started: Instant::now(),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn record_ring_transaction(&self, core_id: usize) {
        if !self.is_enabled() {
            return;
        }
        let mut data = self.data.lock().expect("perf data poisoned");
        if let Some(core) = data.get_mut(core_id) {
            core.ring_bus_transactions += 1;
        }
    }

    pub fn core_counters(&self, core_id: usize) -> Option<CoreCounters> {
        self.data.lock().expect("perf data poisoned").get(core_id).cloned()
    }

    pub fn summary(&self) -> PerfSummary {
        let per_core = self.data.lock().expect("perf data poisoned").clone();
        let mut total = CoreCounters::default();
        for core in &per_core {
            total.accumulate(core);
        }
        let ipc = total.ipc();
        PerfSummary {
            num_cores: per_core.len(),
            wall_seconds: self.started.elapsed().as_secs_f64(),
            total,
            ipc,
            per_core,
        }
    }

    /// Write per-core counters as CSV.
    pub fn export_csv(&self, path: &Path) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut out = BufWriter::new(file);
        writeln!(
            out,
            "core_id,instructions_retired,vector_instructions,memory_accesses,\
             l1_hits,l1_misses,l2_hits,l2_misses,ring_bus_transactions,cycles,ipc"
        )?;
        let data = self.data.lock().expect("perf data poisoned");
        for (core_id, c) in data.iter().enumerate() {
            writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{:.4}",
                core_id,
                c.instructions_retired,
                c.vector_instructions,
                c.memory_accesses,
                c.l1_hits,
                c.l1_misses,
                c.l2_hits,
                c.l2_misses,
                c.ring_bus_transactions,
                c.cycles,
                c.ipc(),
            )?;
        }
        out.flush()?;
        info!("performance counters exported to {}", path.display());
        Ok(())
    }

    /// Write the aggregate summary as pretty JSON next to the CSV.
    pub fn export_summary_json(&self, path: &Path) -> std::io::Result<()> {
        let payload = serde_json::to_string_pretty(&self.summary())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        std::fs::write(path, payload)
    }

    pub fn report(&self) {
        let summary = self.summary();
        println!("\n=== Performance Statistics ===");
        println!("Instructions retired: {}", summary.total.instructions_retired);
        println!("Vector instructions:  {}", summary.total.vector_instructions);
        println!("Memory accesses:      {}", summary.total.memory_accesses);
        println!("L1 hits:              {}", summary.total.l1_hits);
        println!("L1 misses:            {}", summary.total.l1_misses);
        println!("L2 hits:              {}", summary.total.l2_hits);
        println!("L2 misses:            {}", summary.total.l2_misses);
        println!("Ring bus transactions: {}", summary.total.ring_bus_transactions);
        println!("Total cycles:         {}", summary.total.cycles);
        if summary.total.cycles > 0 {
            println!("IPC:                  {:.4}", summary.ipc);
        }
    }
}

// Deterministic cache placement model: a cache line misses L1 every tenth
// line, and half of those also miss L2.
fn l1_hit(addr: u64) -> bool {
    (addr >> 6) % 10 != 0
}

fn l2_hit(addr: u64) -> bool {
    (addr >> 6) % 20 != 0
}

impl ExecutionHooks for PerfMonitor {
    fn record_instruction(&self, core_id: usize, translation: &Translation) {
        if !self.is_enabled() {
            return;
        }
        let mut data = self.data.lock().expect("perf data poisoned");
        if let Some(core) = data.get_mut(core_id) {
            core.instructions_retired += 1;
            if translation.vector {
                core.vector_instructions += 1;
            }
        }
    }

    fn record_memory_access(&self, core_id: usize, addr: u64, _size: u64, _is_write: bool) {
        if !self.is_enabled() {
            return;
        }
        let mut data = self.data.lock().expect("perf data poisoned");
        if let Some(core) = data.get_mut(core_id) {
            core.memory_accesses += 1;
            if l1_hit(addr) {
                core.l1_hits += 1;
            } else {
                core.l1_misses += 1;
                if l2_hit(addr) {
                    core.l2_hits += 1;
                } else {
                    core.l2_misses += 1;
                }
            }
        }
    }

    fn record_cycles(&self, core_id: usize, cycles: u64) {
        if !self.is_enabled() {
            return;
        }
        let mut data = self.data.lock().expect("perf data poisoned");
        if let Some(core) = data.get_mut(core_id) {
            core.cycles += cycles;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn native_nop() -> Translation {
        Translation {
            bytes: vec![0x90],
            length: 1,
            description: "native x86".into(),
            emulated: false,
            vector: false,
            overhead_cycles: 0,
        }
    }

    #[test]
    fn counters_accumulate() {
        let perf = PerfMonitor::new(2);
        perf.record_instruction(0, &native_nop());
        perf.record_instruction(0, &native_nop());
        perf.record_instruction(1, &native_nop());
        perf.record_cycles(0, 2);
        perf.record_cycles(1, 1);

        let summary = perf.summary();
        assert_eq!(summary.total.instructions_retired, 3);
        assert_eq!(summary.total.cycles, 3);
        assert_eq!(summary.per_core[0].instructions_retired, 2);
        assert!((summary.ipc - 1.0).abs() < 1e-9);
    }

    #[test]
    fn vector_instructions_counted_separately() {
        let perf = PerfMonitor::new(1);
        let mut vec_inst = native_nop();
        vec_inst.vector = true;
        perf.record_instruction(0, &vec_inst);
        perf.record_instruction(0, &native_nop());
        let c = perf.core_counters(0).unwrap();
        assert_eq!(c.instructions_retired, 2);
        assert_eq!(c.vector_instructions, 1);
    }

    #[test]
    fn cache_model_is_deterministic_and_consistent() {
        let perf = PerfMonitor::new(1);
        for line in 0..100u64 {
            perf.record_memory_access(0, line << 6, 8, false);
        }
        let c = perf.core_counters(0).unwrap();
        assert_eq!(c.memory_accesses, 100);
        assert_eq!(c.l1_hits, 90);
        assert_eq!(c.l1_misses, 10);
        assert_eq!(c.l2_hits + c.l2_misses, c.l1_misses);
        assert_eq!(c.l2_misses, 5);
    }

    #[test]
    fn disabled_monitor_records_nothing() {
        let perf = PerfMonitor::new(1);
        perf.set_enabled(false);
        perf.record_instruction(0, &native_nop());
        perf.record_cycles(0, 1);
        assert_eq!(perf.core_counters(0).unwrap().instructions_retired, 0);
    }

    #[test]
    fn csv_has_expected_columns() {
        let perf = PerfMonitor::new(2);
        perf.record_instruction(0, &native_nop());
        perf.record_cycles(0, 1);

        let dir = std::env::temp_dir().join(format!("micsim-perf-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("counters.csv");
        perf.export_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        assert!(header.starts_with("core_id,instructions_retired,vector_instructions"));
        assert!(header.ends_with("ring_bus_transactions,cycles,ipc"));
        assert_eq!(lines.count(), 2);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
