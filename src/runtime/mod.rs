pub mod core;
pub mod syscall;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{error, info};

use crate::arch::ArchProfile;
use crate::err::{Result, SimError};
use crate::mem::MemorySystem;
use crate::runtime::core::Core;
use crate::runtime::syscall::SyscallEffect;
use crate::sim::elf::LoadedBinary;
use crate::xlate::{Translation, Translator, XlateStats};

const PAUSE_POLL: Duration = Duration::from_millis(10);
const COORDINATOR_TICK: Duration = Duration::from_micros(100);

/// Observation points the runtime offers to the debugger and the
/// performance monitor. Handed in at construction; the runtime never owns
/// its observers.
pub trait ExecutionHooks: Send + Sync {
    /// Pre-step: checked at the top of each instruction.
    fn should_break(&self, _core_id: usize, _pc: u64) -> bool {
        false
    }
    fn on_breakpoint(&self, _core_id: usize, _pc: u64) {}
    /// While true, workers that hit a breakpoint stay parked.
    fn is_paused(&self) -> bool {
        false
    }
    /// Post-step accounting.
    fn record_instruction(&self, _core_id: usize, _translation: &Translation) {}
    fn record_memory_access(&self, _core_id: usize, _addr: u64, _size: u64, _is_write: bool) {}
    fn record_cycles(&self, _core_id: usize, _cycles: u64) {}
    fn on_core_halt(&self, _core_id: usize) {}
}

/// The emulation runtime: one worker thread per simulated core over a
/// shared memory system, with a coordinator that ticks the global clock.
pub struct Runtime {
    profile: Arc<ArchProfile>,
    memory: Arc<MemorySystem>,
    cores: Vec<Arc<Core>>,
    hooks: Vec<Arc<dyn ExecutionHooks>>,

    halt: AtomicBool,
    running: AtomicBool,
    paused: AtomicBool,
    global_cycles: AtomicU64,
    exit_code: Mutex<Option<u64>>,

    // workers fold their per-thread translator stats in here on exit
    xlate_stats: Mutex<XlateStats>,
    // dedicated translator for debugger-driven single stepping
    step_translator: Mutex<Translator>,
}

impl Runtime {
    pub fn new(
        profile: Arc<ArchProfile>,
        num_cores: usize,
        memory: Arc<MemorySystem>,
        hooks: Vec<Arc<dyn ExecutionHooks>>,
    ) -> Result<Self> {
        if num_cores == 0 || num_cores > profile.num_cores {
            return Err(SimError::InvalidArgument(format!(
                "core count {} outside 1..={} for {}",
                num_cores, profile.num_cores, profile.name
            )));
        }

        let cores = (0..num_cores)
            .map(|id| Arc::new(Core::new(id, &profile)))
            .collect();

        info!(
            "runtime: {} cores, {} MiB memory, {}",
            num_cores,
            memory.size() >> 20,
            profile.name
        );

        Ok(Self {
            step_translator: Mutex::new(Translator::new(profile.arch)),
            profile,
            memory,
            cores,
            hooks,
            halt: AtomicBool::new(false),
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            global_cycles: AtomicU64::new(0),
            exit_code: Mutex::new(None),
            xlate_stats: Mutex::new(XlateStats::default()),
        })
    }

    pub fn profile(&self) -> &ArchProfile {
        &self.profile
    }

    pub fn memory(&self) -> &Arc<MemorySystem> {
        &self.memory
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn core(&self, core_id: usize) -> Option<&Arc<Core>> {
        self.cores.get(core_id)
    }

    pub fn global_cycles(&self) -> u64 {
        self.global_cycles.load(Ordering::Relaxed)
    }

    pub fn exit_code(&self) -> Option<u64> {
        *self.exit_code.lock().expect("exit code poisoned")
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn is_halted(&self) -> bool {
        self.halt.load(Ordering::Relaxed)
    }

    /// Best-effort global cancellation; observed by each worker at its loop
    /// head.
    pub fn request_halt(&self) {
        self.halt.store(true, Ordering::Relaxed);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    /// Copy a raw image to address zero and release every core there.
    pub fn load_program(&self, program: &[u8]) -> Result<()> {
        if program.len() as u64 > self.memory.size() {
            return Err(SimError::InvalidArgument(format!(
                "program of {} bytes exceeds {} bytes of memory",
                program.len(),
                self.memory.size()
            )));
        }
        self.memory.load_image(0, program)?;
        for core in &self.cores {
            core.start_at(0);
        }
        self.halt.store(false, Ordering::Relaxed);
        info!("program loaded: {} bytes", program.len());
        Ok(())
    }

    /// Materialize a parsed ELF: each loadable segment at its virtual
    /// address, every core released at the entry point.
    pub fn load_binary(&self, binary: &LoadedBinary) -> Result<()> {
        for segment in &binary.segments {
            self.memory.load_image(segment.vaddr, &segment.data)?;
        }
        for core in &self.cores {
            core.start_at(binary.entry);
        }
        self.halt.store(false, Ordering::Relaxed);
        info!(
            "binary loaded: {} segments, entry {:#x}",
            binary.segments.len(),
            binary.entry
        );
        Ok(())
    }

    /// Run every core to quiescence. Returns once the global halt is set or
    /// all cores have halted on their own. Takes a clone of the owning
    /// `Arc` so worker threads can share the runtime.
    pub fn run(self: Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SimError::InvalidArgument("already running".to_string()));
        }

        info!("starting emulation on {} cores", self.cores.len());

        let workers: Vec<_> = (0..self.cores.len())
            .map(|core_id| {
                let rt = Arc::clone(&self);
                std::thread::Builder::new()
                    .name(format!("core-{core_id}"))
                    .spawn(move || rt.worker_loop(core_id))
                    .expect("failed to spawn core worker")
            })
            .collect();

        while !self.halt.load(Ordering::Relaxed)
            && self.cores.iter().any(|core| !core.is_halted())
        {
            self.global_cycles.fetch_add(1, Ordering::Relaxed);
            if self.paused.load(Ordering::Relaxed) {
                std::thread::sleep(PAUSE_POLL);
            } else {
                std::thread::sleep(COORDINATOR_TICK);
            }
        }

        for worker in workers {
            let _ = worker.join();
        }

        self.running.store(false, Ordering::SeqCst);
        info!("emulation complete after {} cycles", self.global_cycles());
        Ok(())
    }

    fn worker_loop(self: Arc<Self>, core_id: usize) {
        let core = Arc::clone(&self.cores[core_id]);
        let mut translator = Translator::new(self.profile.arch);

        while !self.halt.load(Ordering::Relaxed) && !core.is_halted() {
            if self.paused.load(Ordering::Relaxed) {
                std::thread::sleep(PAUSE_POLL);
                continue;
            }

            let pc = core.state.lock().expect("core state poisoned").regs.rip;

            for hook in &self.hooks {
                if hook.should_break(core_id, pc) {
                    hook.on_breakpoint(core_id, pc);
                    while hook.is_paused() && !self.halt.load(Ordering::Relaxed) {
                        std::thread::sleep(PAUSE_POLL);
                    }
                }
            }

            if let Err(err) = self.execute_one(&core, &mut translator) {
                error!("core {core_id}: {err} at rip {pc:#x}");
                core.halt();
            }
        }

        core.halt();
        for hook in &self.hooks {
            hook.on_core_halt(core_id);
        }
        self.xlate_stats
            .lock()
            .expect("xlate stats poisoned")
            .merge(&translator.stats);
    }

    /// Fetch, translate and apply one instruction on `core`.
    fn execute_one(&self, core: &Core, translator: &mut Translator) -> Result<()> {
        let mut state = core.state.lock().expect("core state poisoned");
        let pc = state.regs.rip;
        if pc >= self.memory.size() {
            return Err(SimError::MemoryAccess { addr: pc, size: 1 });
        }

        let bytes = self.memory.peek(pc, 16)?;
        let translation = translator.translate(pc, &bytes)?;

        let mut memory_access = None;
        match bytes[0] {
            0x90 => {}
            0xC3 => core.halt(),
            // mov r64, imm32 (REX.W C7 /0): enough semantics to stage a
            // syscall number
            0x48 if bytes.len() >= 7 && bytes[1] == 0xC7 && bytes[2] & 0xC0 == 0xC0 => {
                let imm = i32::from_le_bytes(bytes[3..7].try_into().expect("len checked"));
                state.regs.gpr[(bytes[2] & 0x07) as usize] = imm as i64 as u64;
            }
            0x0F if bytes.len() >= 2 && bytes[1] == 0x05 => {
                let number = state.regs.gpr[0];
                match syscall::dispatch(core.core_id, &mut state, &self.memory) {
                    Ok(SyscallEffect::Continue) => {
                        if number == syscall::Syscall::Write as u64 {
                            memory_access =
                                Some((state.regs.gpr[2], state.regs.gpr[3], false));
                        }
                    }
                    Ok(SyscallEffect::HaltAll { exit_code }) => {
                        core.halt();
                        self.halt.store(true, Ordering::Relaxed);
                        *self.exit_code.lock().expect("exit code poisoned") = Some(exit_code);
                    }
                    Err(SimError::SystemCall(_)) => {
                        // unsupported: report failure to the guest, keep going
                        state.regs.gpr[0] = -1i64 as u64;
                    }
                    Err(err) => return Err(err),
                }
            }
            _ => {}
        }

        state.regs.rip = pc + translation.length.max(1) as u64;
        state.cycles_executed += 1;
        core.publish_cycles(state.cycles_executed);
        self.global_cycles.fetch_add(1, Ordering::Relaxed);
        drop(state);

        for hook in &self.hooks {
            hook.record_instruction(core.core_id, &translation);
            hook.record_cycles(core.core_id, 1 + translation.overhead_cycles as u64);
            if let Some((addr, size, is_write)) = memory_access {
                hook.record_memory_access(core.core_id, addr, size, is_write);
            }
        }
        Ok(())
    }

    /// Execute exactly one instruction on `core_id`; used by the debugger
    /// while the workers are parked.
    pub fn step_core(&self, core_id: usize) -> Result<()> {
        let core = self
            .cores
            .get(core_id)
            .ok_or_else(|| SimError::InvalidArgument(format!("no core {core_id}")))?;
        if core.is_halted() {
            return Err(SimError::InvalidArgument(format!("core {core_id} is halted")));
        }
        let mut translator = self.step_translator.lock().expect("step translator poisoned");
        self.execute_one(core, &mut translator)
    }

    /// Translator statistics folded in from finished workers.
    pub fn xlate_stats(&self) -> XlateStats {
        self.xlate_stats.lock().expect("xlate stats poisoned").clone()
    }

    pub fn all_halted(&self) -> bool {
        self.cores.iter().all(|core| core.is_halted())
    }
}
