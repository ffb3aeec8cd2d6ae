use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::info;

use crate::runtime::{ExecutionHooks, Runtime};
use crate::xlate::Translation;

const PROMPT: &str = "(mic-dbg) ";

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub address: u64,
    pub enabled: bool,
    pub hit_count: u64,
}

#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub address: u64,
    pub size: u64,
    pub on_write: bool,
    pub hit_count: u64,
}

/// Interactive debugger. The hook half (breakpoint/watchpoint checks) is
/// consulted by every core worker; the console half drives the runtime it
/// borrows and never the other way around.
pub struct Debugger {
    enabled: AtomicBool,
    paused: AtomicBool,
    break_requested: AtomicBool,

    breakpoints: Mutex<Vec<Breakpoint>>,
    watchpoints: Mutex<Vec<Watchpoint>>,
    history: Mutex<Vec<String>>,

    current_core: AtomicU64,
    current_address: AtomicU64,

    breakpoints_hit: AtomicU64,
    watchpoints_hit: AtomicU64,
    instructions_stepped: AtomicU64,
}

impl Debugger {
    pub fn new() -> Self {
        info!("debugger initialized");
        Self {
            enabled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            break_requested: AtomicBool::new(false),
            breakpoints: Mutex::new(Vec::new()),
            watchpoints: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            current_core: AtomicU64::new(0),
            current_address: AtomicU64::new(0),
            breakpoints_hit: AtomicU64::new(0),
            watchpoints_hit: AtomicU64::new(0),
            instructions_stepped: AtomicU64::new(0),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn request_break(&self) {
        self.break_requested.store(true, Ordering::Relaxed);
    }

    pub fn clear_break_request(&self) {
        self.break_requested.store(false, Ordering::Relaxed);
    }

    pub fn add_breakpoint(&self, address: u64) -> bool {
        let mut breakpoints = self.breakpoints.lock().expect("breakpoints poisoned");
        if breakpoints.iter().any(|bp| bp.address == address) {
            return false;
        }
        breakpoints.push(Breakpoint {
            address,
            enabled: true,
            hit_count: 0,
        });
        true
    }

    pub fn add_watchpoint(&self, address: u64, size: u64, on_write: bool) {
        self.watchpoints
            .lock()
            .expect("watchpoints poisoned")
            .push(Watchpoint {
                address,
                size,
                on_write,
                hit_count: 0,
            });
    }

    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.breakpoints.lock().expect("breakpoints poisoned").clone()
    }

    pub fn history(&self) -> Vec<String> {
        self.history.lock().expect("history poisoned").clone()
    }

    pub fn current_core(&self) -> usize {
        self.current_core.load(Ordering::Relaxed) as usize
    }

    fn check_breakpoints(&self, address: u64) -> bool {
        let mut breakpoints = self.breakpoints.lock().expect("breakpoints poisoned");
        for bp in breakpoints.iter_mut() {
            if bp.enabled && bp.address == address {
                bp.hit_count += 1;
                return true;
            }
        }
        false
    }

    pub fn log_stats(&self) {
        info!(
            "debugger: {} breakpoints hit, {} watchpoints hit, {} instructions stepped",
            self.breakpoints_hit.load(Ordering::Relaxed),
            self.watchpoints_hit.load(Ordering::Relaxed),
            self.instructions_stepped.load(Ordering::Relaxed),
        );
    }
}

impl Default for Debugger {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionHooks for Debugger {
    fn should_break(&self, _core_id: usize, pc: u64) -> bool {
        if !self.enabled.load(Ordering::Relaxed) {
            return false;
        }
        self.check_breakpoints(pc) || self.break_requested.load(Ordering::Relaxed)
    }

    fn on_breakpoint(&self, core_id: usize, pc: u64) {
        self.breakpoints_hit.fetch_add(1, Ordering::Relaxed);
        self.current_core.store(core_id as u64, Ordering::Relaxed);
        self.current_address.store(pc, Ordering::Relaxed);
        self.paused.store(true, Ordering::Relaxed);
        self.clear_break_request();
        println!("\nBreakpoint hit at {pc:#x} on core {core_id}");
        print_prompt();
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    fn record_instruction(&self, _core_id: usize, _translation: &Translation) {}

    fn record_memory_access(&self, core_id: usize, addr: u64, size: u64, is_write: bool) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut watchpoints = self.watchpoints.lock().expect("watchpoints poisoned");
        for wp in watchpoints.iter_mut() {
            let overlaps = addr < wp.address + wp.size && wp.address < addr + size;
            if overlaps && (is_write == wp.on_write || !wp.on_write) {
                wp.hit_count += 1;
                self.watchpoints_hit.fetch_add(1, Ordering::Relaxed);
                self.current_core.store(core_id as u64, Ordering::Relaxed);
                self.current_address.store(addr, Ordering::Relaxed);
                self.paused.store(true, Ordering::Relaxed);
                println!(
                    "\nWatchpoint hit at {addr:#x} on core {core_id} ({})",
                    if is_write { "write" } else { "read" }
                );
                print_prompt();
            }
        }
    }

    fn on_core_halt(&self, core_id: usize) {
        if self.enabled.load(Ordering::Relaxed) {
            info!("core {core_id} halted");
        }
    }
}

fn print_prompt() {
    print!("{PROMPT}");
    let _ = std::io::stdout().flush();
}

pub fn parse_address(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}

fn print_help() {
    println!("\n=== Debugger Commands ===");
    println!("continue (c)         - continue execution");
    println!("step (s)             - single step one instruction");
    println!("registers (r)        - show registers of the current core");
    println!("memory (m) <addr> <size> - display memory");
    println!("break (b) [addr]     - set a breakpoint, or list them");
    println!("quit (q)             - leave the debugger");
    println!("help (h)             - show this help");
}

fn dump_memory(runtime: &Runtime, address: u64, size: u64) {
    match runtime.memory().peek(address, size) {
        Ok(bytes) => {
            println!("\n=== Memory at {address:#x} (+{size} bytes) ===");
            for (row, chunk) in bytes.chunks(16).enumerate() {
                let offset = address + row as u64 * 16;
                let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
                println!("{offset:#010x}: {}", hex.join(" "));
            }
        }
        Err(err) => println!("cannot read memory: {err}"),
    }
}

/// Blocking console loop; runs on its own thread until quit or EOF.
pub fn run_console(debugger: Arc<Debugger>, runtime: Arc<Runtime>) {
    let stdin = std::io::stdin();
    print_prompt();

    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let line = line.trim().to_string();
        if line.is_empty() {
            print_prompt();
            continue;
        }
        debugger
            .history
            .lock()
            .expect("history poisoned")
            .push(line.clone());

        let mut tokens = line.split_whitespace();
        let command = tokens.next().unwrap_or_default();
        let args: Vec<&str> = tokens.collect();

        match command {
            "continue" | "c" => {
                debugger.paused.store(false, Ordering::Relaxed);
                debugger.clear_break_request();
                println!("Continuing execution...");
            }
            "step" | "s" => {
                debugger.instructions_stepped.fetch_add(1, Ordering::Relaxed);
                let core_id = debugger.current_core();
                match runtime.step_core(core_id) {
                    Ok(()) => {
                        if let Some(core) = runtime.core(core_id) {
                            let rip = core.state.lock().expect("core state poisoned").regs.rip;
                            println!("core {core_id} now at {rip:#x}");
                        }
                    }
                    Err(err) => println!("cannot step: {err}"),
                }
            }
            "registers" | "r" => {
                let core_id = debugger.current_core();
                match runtime.core(core_id) {
                    Some(core) => print!("{}", core.dump_state()),
                    None => println!("no core {core_id}"),
                }
            }
            "memory" | "m" => {
                match (args.first().and_then(|a| parse_address(a)), args.get(1)) {
                    (Some(address), Some(size_text)) => match size_text.parse::<u64>() {
                        Ok(size) => dump_memory(&runtime, address, size),
                        Err(_) => println!("Usage: memory <addr> <size>"),
                    },
                    _ => println!("Usage: memory <addr> <size>"),
                }
            }
            "break" | "b" => match args.first() {
                Some(text) => match parse_address(text) {
                    Some(address) => {
                        if debugger.add_breakpoint(address) {
                            println!("Breakpoint set at {address:#x}");
                        } else {
                            println!("Breakpoint already set at {address:#x}");
                        }
                    }
                    None => println!("bad address: {text}"),
                },
                None => {
                    println!("\n=== Breakpoints ===");
                    for (i, bp) in debugger.breakpoints().iter().enumerate() {
                        println!(
                            "{i}: {:#x} ({}) hits: {}",
                            bp.address,
                            if bp.enabled { "enabled" } else { "disabled" },
                            bp.hit_count
                        );
                    }
                }
            },
            "quit" | "q" => {
                debugger.paused.store(false, Ordering::Relaxed);
                debugger.set_enabled(false);
                println!("Exiting debugger...");
                break;
            }
            "help" | "h" => print_help(),
            other => {
                println!("Unknown command: {other}");
                print_help();
            }
        }
        print_prompt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_parsing() {
        assert_eq!(parse_address("0x1000"), Some(0x1000));
        assert_eq!(parse_address("0XFF"), Some(255));
        assert_eq!(parse_address("42"), Some(42));
        assert_eq!(parse_address("zzz"), None);
    }

    #[test]
    fn breakpoints_fire_and_count() {
        let dbg = Debugger::new();
        assert!(dbg.add_breakpoint(0x100));
        assert!(!dbg.add_breakpoint(0x100));

        assert!(!dbg.should_break(0, 0x99));
        assert!(dbg.should_break(0, 0x100));
        assert!(dbg.should_break(1, 0x100));
        assert_eq!(dbg.breakpoints()[0].hit_count, 2);
    }

    #[test]
    fn break_request_pauses_any_pc() {
        let dbg = Debugger::new();
        assert!(!dbg.should_break(0, 0x10));
        dbg.request_break();
        assert!(dbg.should_break(0, 0x10));
        dbg.clear_break_request();
        assert!(!dbg.should_break(0, 0x10));
    }

    #[test]
    fn disabled_debugger_never_breaks() {
        let dbg = Debugger::new();
        dbg.add_breakpoint(0x100);
        dbg.set_enabled(false);
        assert!(!dbg.should_break(0, 0x100));
    }

    #[test]
    fn watchpoint_overlap() {
        let dbg = Debugger::new();
        dbg.add_watchpoint(0x200, 8, true);
        dbg.record_memory_access(0, 0x204, 4, true);
        assert!(dbg.is_paused());
        assert_eq!(dbg.watchpoints_hit.load(Ordering::Relaxed), 1);

        // non-overlapping access does not fire
        let dbg = Debugger::new();
        dbg.add_watchpoint(0x200, 8, true);
        dbg.record_memory_access(0, 0x300, 4, true);
        assert!(!dbg.is_paused());
    }
}
