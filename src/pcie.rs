use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use log::{debug, trace};

use crate::arch::ArchProfile;

// PCIe 2.0 x16: 5 GT/s per lane over 16 lanes with 8b/10b encoding comes out
// to 8 GB/s per direction, 16 GB/s aggregate.
const PCIE_BANDWIDTH_BYTES_PER_SEC: f64 = 8.0 * BYTES_PER_GB as f64;
const PCIE_TOTAL_BANDWIDTH_BYTES_PER_SEC: f64 = 16.0 * BYTES_PER_GB as f64;
const PCIE_LATENCY_NS: f64 = 100.0;
const BYTES_PER_GB: u64 = 1024 * 1024 * 1024;

// When pacing to real time, sleep this much shorter than the modeled
// transfer so large copies do not stall the host for seconds.
const PACING_SCALE: f64 = 1e6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    HostToDevice,
    DeviceToHost,
}

#[derive(Debug, Default, Clone)]
pub struct PcieStats {
    pub bytes_host_to_device: u64,
    pub bytes_device_to_host: u64,
    pub total_transfers: u64,
    pub total_latency_ns: u64,
    pub coherency_overhead_cycles: u64,
    pub dtd_invalidations: u64,
}

/// Latency/bandwidth model of the host link. Sits underneath the memory
/// controller layer; every device-visible read or write charges one pass.
///
/// Simulated time advances on an atomic counter; the wall-clock sleep that
/// paces emulation to real transfer speed is opt-in.
pub struct PcieBridge {
    cycle_time_ns: f64,
    pace_to_real_time: bool,

    bytes_h2d: AtomicU64,
    bytes_d2h: AtomicU64,
    transfers: AtomicU64,
    latency_ns: AtomicU64,
    coherency_cycles: AtomicU64,
    invalidations: AtomicU64,
    sim_time_ns: AtomicU64,
}

impl PcieBridge {
    pub fn new(profile: &ArchProfile) -> Self {
        Self::with_pacing(profile, false)
    }

    pub fn with_pacing(profile: &ArchProfile, pace_to_real_time: bool) -> Self {
        Self {
            cycle_time_ns: profile.cycle_time_ns(),
            pace_to_real_time,
            bytes_h2d: AtomicU64::new(0),
            bytes_d2h: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            latency_ns: AtomicU64::new(0),
            coherency_cycles: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            sim_time_ns: AtomicU64::new(0),
        }
    }

    /// Modeled wire time for `bytes`, including the base link latency.
    pub fn transfer_time_ns(&self, bytes: u64) -> f64 {
        bytes as f64 / PCIE_BANDWIDTH_BYTES_PER_SEC * 1e9 + PCIE_LATENCY_NS
    }

    /// Transfer time expressed in core cycles, rounded up. Deterministic for
    /// a given architecture and size.
    pub fn cycle_delay(&self, bytes: u64) -> u64 {
        (self.transfer_time_ns(bytes) / self.cycle_time_ns).ceil() as u64
    }

    pub fn transfer_h2d(&self, bytes: u64, device_address: u64) -> u64 {
        trace!("pcie h2d {} bytes -> {:#x}", bytes, device_address);
        self.transfer(bytes, Direction::HostToDevice)
    }

    pub fn transfer_d2h(&self, device_address: u64, bytes: u64) -> u64 {
        trace!("pcie d2h {} bytes <- {:#x}", bytes, device_address);
        self.transfer(bytes, Direction::DeviceToHost)
    }

    /// Account one transfer and return its modeled latency in nanoseconds.
    /// Zero-byte transfers are not charged.
    pub fn transfer(&self, bytes: u64, direction: Direction) -> u64 {
        if bytes == 0 {
            return 0;
        }

        let time_ns = self.transfer_time_ns(bytes);

        match direction {
            Direction::HostToDevice => self.bytes_h2d.fetch_add(bytes, Ordering::Relaxed),
            Direction::DeviceToHost => self.bytes_d2h.fetch_add(bytes, Ordering::Relaxed),
        };
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.latency_ns.fetch_add(time_ns as u64, Ordering::Relaxed);
        self.sim_time_ns.fetch_add(time_ns as u64, Ordering::Relaxed);

        if self.pace_to_real_time {
            std::thread::sleep(Duration::from_nanos((time_ns / PACING_SCALE) as u64));
        }

        time_ns as u64
    }

    pub fn record_coherency_cycles(&self, cycles: u64) {
        self.coherency_cycles.fetch_add(cycles, Ordering::Relaxed);
    }

    pub fn record_invalidation(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Simulated nanoseconds spent on the link so far.
    pub fn sim_time_ns(&self) -> u64 {
        self.sim_time_ns.load(Ordering::Relaxed)
    }

    pub fn expected_transfer_time_ms(&self, bytes: u64) -> f64 {
        self.transfer_time_ns(bytes) / 1e6
    }

    /// Fraction of the aggregate 16 GB/s moved during `wall_secs`, percent.
    pub fn bandwidth_utilization(&self, wall_secs: f64) -> f64 {
        if wall_secs <= 0.0 {
            return 0.0;
        }
        let total = self.bytes_h2d.load(Ordering::Relaxed) + self.bytes_d2h.load(Ordering::Relaxed);
        total as f64 / (PCIE_TOTAL_BANDWIDTH_BYTES_PER_SEC * wall_secs) * 100.0
    }

    pub fn stats(&self) -> PcieStats {
        PcieStats {
            bytes_host_to_device: self.bytes_h2d.load(Ordering::Relaxed),
            bytes_device_to_host: self.bytes_d2h.load(Ordering::Relaxed),
            total_transfers: self.transfers.load(Ordering::Relaxed),
            total_latency_ns: self.latency_ns.load(Ordering::Relaxed),
            coherency_overhead_cycles: self.coherency_cycles.load(Ordering::Relaxed),
            dtd_invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.bytes_h2d.store(0, Ordering::Relaxed);
        self.bytes_d2h.store(0, Ordering::Relaxed);
        self.transfers.store(0, Ordering::Relaxed);
        self.latency_ns.store(0, Ordering::Relaxed);
        self.coherency_cycles.store(0, Ordering::Relaxed);
        self.invalidations.store(0, Ordering::Relaxed);
        self.sim_time_ns.store(0, Ordering::Relaxed);
    }

    pub fn log_stats(&self) {
        let s = self.stats();
        debug!(
            "pcie: h2d={} d2h={} transfers={} avg_latency={}ns",
            s.bytes_host_to_device,
            s.bytes_device_to_host,
            s.total_transfers,
            if s.total_transfers > 0 {
                s.total_latency_ns / s.total_transfers
            } else {
                0
            }
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bridge() -> PcieBridge {
        PcieBridge::new(&ArchProfile::knc())
    }

    #[test]
    fn gigabyte_transfer_time() {
        let b = bridge();
        let t = b.transfer_time_ns(1 << 30);
        // 1 GiB at 8 GiB/s = 0.125 s = 1.25e8 ns, plus 100 ns base latency
        assert!((t - 1.25e8).abs() < 200.0, "got {t}");
    }

    #[test]
    fn cycle_delay_deterministic() {
        let b = bridge();
        let expected =
            (b.transfer_time_ns(4096) / ArchProfile::knc().cycle_time_ns()).ceil() as u64;
        assert_eq!(b.cycle_delay(4096), expected);
        assert_eq!(b.cycle_delay(4096), b.cycle_delay(4096));
    }

    #[test]
    fn counters_accumulate_by_direction() {
        let b = bridge();
        b.transfer(100, Direction::HostToDevice);
        b.transfer(200, Direction::DeviceToHost);
        b.transfer_h2d(50, 0x1000);
        let s = b.stats();
        assert_eq!(s.bytes_host_to_device, 150);
        assert_eq!(s.bytes_device_to_host, 200);
        assert_eq!(s.total_transfers, 3);
        assert!(s.total_latency_ns >= 300);
    }

    #[test]
    fn zero_byte_transfer_not_charged() {
        let b = bridge();
        assert_eq!(b.transfer(0, Direction::HostToDevice), 0);
        assert_eq!(b.stats().total_transfers, 0);
    }

    #[test]
    fn half_utilization_for_one_direction() {
        let b = bridge();
        let bytes = 1u64 << 30;
        b.transfer(bytes, Direction::HostToDevice);
        let wall = b.transfer_time_ns(bytes) / 1e9;
        let util = b.bandwidth_utilization(wall);
        // one direction saturated out of the 16 GB/s aggregate
        assert!((util - 50.0).abs() < 1.0, "got {util}");
    }
}
