use std::path::Path;
use std::sync::Arc;

use log::info;

use crate::arch::ArchProfile;
use crate::debug::{self, Debugger};
use crate::err::{Result, SimError};
use crate::mem::MemorySystem;
use crate::pcie::PcieBridge;
use crate::ring::RingBus;
use crate::runtime::{ExecutionHooks, Runtime};
use crate::sim::config::SimConfig;
use crate::sim::elf::LoadedBinary;
use crate::sim::perf::PerfMonitor;

const DEFAULT_PERF_CSV: &str = "performance_counters.csv";

/// The assembled machine: runtime plus the capability objects handed to it.
pub struct System {
    pub profile: Arc<ArchProfile>,
    pub pcie: Arc<PcieBridge>,
    pub ring: Option<Arc<RingBus>>,
    pub debugger: Option<Arc<Debugger>>,
    pub perf: Option<Arc<PerfMonitor>>,
    pub runtime: Arc<Runtime>,
    perf_csv: String,
}

impl System {
    pub fn new(config: &SimConfig) -> Result<Self> {
        let profile = Arc::new(config.arch.profile());

        let memory_size = config.effective_memory_size();
        if memory_size == 0 || memory_size > profile.memory_size {
            return Err(SimError::InvalidArgument(format!(
                "memory size {} MiB outside 1..={} MiB for {}",
                memory_size >> 20,
                profile.memory_size >> 20,
                profile.name
            )));
        }

        let pcie = Arc::new(PcieBridge::with_pacing(&profile, config.pace_pcie));
        let memory = Arc::new(MemorySystem::new(
            Arc::clone(&profile),
            memory_size,
            Some(Arc::clone(&pcie)),
        ));

        let ring = config
            .ring_bus
            .then(|| Arc::new(RingBus::new(&profile, Some(Arc::clone(&pcie)))));
        let debugger = config.debug.then(|| Arc::new(Debugger::new()));
        let perf = config
            .performance
            .then(|| Arc::new(PerfMonitor::new(config.effective_cores())));

        let mut hooks: Vec<Arc<dyn ExecutionHooks>> = Vec::new();
        if let Some(debugger) = &debugger {
            hooks.push(Arc::clone(debugger) as Arc<dyn ExecutionHooks>);
        }
        if let Some(perf) = &perf {
            hooks.push(Arc::clone(perf) as Arc<dyn ExecutionHooks>);
        }

        let runtime = Arc::new(Runtime::new(
            Arc::clone(&profile),
            config.effective_cores(),
            memory,
            hooks,
        )?);

        info!(
            "system assembled: {}, {} cores, ring_bus={}, debug={}, perf={}",
            profile.name,
            config.effective_cores(),
            config.ring_bus,
            config.debug,
            config.performance
        );

        Ok(Self {
            profile,
            pcie,
            ring,
            debugger,
            perf,
            runtime,
            perf_csv: config
                .perf_csv
                .clone()
                .unwrap_or_else(|| DEFAULT_PERF_CSV.to_string()),
        })
    }

    /// Load and run a MIC binary to quiescence; returns the process exit
    /// code.
    pub fn run_binary(&self, path: &Path) -> Result<i32> {
        let binary = LoadedBinary::load_path(path)?;
        binary.log_info();
        self.runtime.load_binary(&binary)?;
        self.run_loaded()
    }

    /// Run whatever was loaded into the runtime.
    pub fn run_loaded(&self) -> Result<i32> {
        if let Some(ring) = &self.ring {
            Arc::clone(ring).start();
        }
        if let Some(debugger) = &self.debugger {
            let debugger = Arc::clone(debugger);
            let runtime = Arc::clone(&self.runtime);
            std::thread::Builder::new()
                .name("debugger".to_string())
                .spawn(move || debug::run_console(debugger, runtime))
                .expect("failed to spawn debugger console");
        }

        let result = Arc::clone(&self.runtime).run();

        if let Some(ring) = &self.ring {
            ring.stop();
            let stats = ring.stats();
            info!(
                "ring: {} messages, {} bytes, avg latency {} cycles, max delay {}",
                stats.total_messages,
                stats.total_bytes,
                stats.avg_latency(),
                stats.max_delay
            );
        }

        self.write_reports();
        result.map(|_| 0)
    }

    fn write_reports(&self) {
        if let Some(perf) = &self.perf {
            perf.report();
            let csv_path = Path::new(&self.perf_csv);
            if let Err(err) = perf.export_csv(csv_path) {
                log::warn!("perf CSV export failed: {err}");
            }
            if let Err(err) = perf.export_summary_json(&csv_path.with_extension("json")) {
                log::warn!("perf summary export failed: {err}");
            }
        }

        let xlate = self.runtime.xlate_stats();
        info!(
            "translator: {} instructions, {:.2}% cache hit rate, {} vector",
            xlate.instructions_translated,
            xlate.hit_rate(),
            xlate.vector_instructions
        );
        self.pcie.log_stats();
        if let Some(debugger) = &self.debugger {
            debugger.log_stats();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::Arch;

    fn tiny_config() -> SimConfig {
        SimConfig {
            arch: Arch::Knc,
            cores: 2,
            memory_mb: 1,
            ..SimConfig::default()
        }
    }

    #[test]
    fn system_assembles_with_options() {
        let system = System::new(&SimConfig {
            ring_bus: true,
            performance: true,
            ..tiny_config()
        })
        .unwrap();
        assert!(system.ring.is_some());
        assert!(system.perf.is_some());
        assert!(system.debugger.is_none());
        assert_eq!(system.runtime.num_cores(), 2);
    }

    #[test]
    fn memory_bounds_enforced() {
        let config = SimConfig {
            memory_mb: (8 << 10) + 1, // one MiB past the KNC maximum
            ..tiny_config()
        };
        assert!(matches!(
            System::new(&config),
            Err(SimError::InvalidArgument(_))
        ));
    }

    #[test]
    fn run_to_exit_code_zero() {
        let system = System::new(&SimConfig {
            performance: true,
            perf_csv: Some(
                std::env::temp_dir()
                    .join(format!("micsim-top-{}.csv", std::process::id()))
                    .to_string_lossy()
                    .into_owned(),
            ),
            ..tiny_config()
        })
        .unwrap();
        system.runtime.load_program(&[0x90, 0xC3]).unwrap();
        let code = system.run_loaded().unwrap();
        assert_eq!(code, 0);
        let perf = system.perf.as_ref().unwrap();
        let total = perf.summary().total;
        assert_eq!(total.instructions_retired, 4);
    }

    #[test]
    fn ring_integration_send_receive() {
        let system = System::new(&SimConfig {
            ring_bus: true,
            ..tiny_config()
        })
        .unwrap();
        let ring = system.ring.as_ref().unwrap();
        assert!(ring.send(0, 2, b"ABCDEFGH", 0));
        ring.step_many(32);
        assert!(ring.receive(2).is_some());
    }
}
