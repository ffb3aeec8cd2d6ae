use std::sync::{Arc, Mutex};

use log::info;
use rand::Rng;

use crate::arch::ArchProfile;
use crate::err::{Result, SimError};
use crate::pcie::PcieBridge;

// Probability that a guest access hits in the controller-side cache model.
const CACHE_HIT_RATE: f64 = 0.9;

/// Flat backing store shared by every core. Relies on lazy allocation in the
/// OS so the full device memory can be reserved without immediate pressure.
struct Backing {
    bytes: Vec<u8>,
}

impl Backing {
    fn check(&self, addr: u64, size: u64) -> Result<()> {
        let end = addr.checked_add(size).ok_or(SimError::MemoryAccess { addr, size })?;
        if end > self.bytes.len() as u64 {
            return Err(SimError::MemoryAccess { addr, size });
        }
        Ok(())
    }
}

/// Per-controller counters.
#[derive(Debug, Clone)]
pub struct BankStats {
    pub bank_id: usize,
    pub base_address: u64,
    pub size: u64,
    pub tile_id: usize,
    pub accesses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Banked memory-controller layer over the flat store.
///
/// Addresses hash to a controller by `address % num_banks`; accesses that
/// straddle banks are charged to the bank of their first byte. Every guest
/// access also takes a pass through the PCIe bridge latency model.
pub struct MemorySystem {
    profile: Arc<ArchProfile>,
    memory_size: u64,
    backing: Mutex<Backing>,
    banks: Mutex<Vec<BankStats>>,
    pcie: Option<Arc<PcieBridge>>,
}

impl MemorySystem {
    pub fn new(
        profile: Arc<ArchProfile>,
        memory_size: u64,
        pcie: Option<Arc<PcieBridge>>,
    ) -> Self {
        let num_banks = profile.num_banks;
        let bank_size = memory_size / num_banks as u64;
        let banks = (0..num_banks)
            .map(|i| BankStats {
                bank_id: i,
                base_address: i as u64 * bank_size,
                size: bank_size,
                // spread controllers symmetrically around the ring
                tile_id: (i * profile.num_tiles / num_banks) % profile.num_tiles,
                accesses: 0,
                cache_hits: 0,
                cache_misses: 0,
            })
            .collect();

        info!(
            "memory system: {} MiB across {} banks",
            memory_size >> 20,
            num_banks
        );

        Self {
            profile,
            memory_size,
            backing: Mutex::new(Backing {
                bytes: vec![0u8; memory_size as usize],
            }),
            banks: Mutex::new(banks),
            pcie,
        }
    }

    pub fn size(&self) -> u64 {
        self.memory_size
    }

    pub fn bank_of(&self, addr: u64) -> usize {
        (addr % self.profile.num_banks as u64) as usize
    }

    /// Guest-visible read through the controller layer.
    pub fn read(&self, addr: u64, size: u64) -> Result<Vec<u8>> {
        let data = {
            let backing = self.backing.lock().expect("memory lock poisoned");
            backing.check(addr, size)?;
            backing.bytes[addr as usize..(addr + size) as usize].to_vec()
        };

        self.touch_bank(addr)?;
        if let Some(pcie) = &self.pcie {
            pcie.transfer_d2h(addr, size);
        }
        Ok(data)
    }

    /// Guest-visible write through the controller layer.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        {
            let mut backing = self.backing.lock().expect("memory lock poisoned");
            backing.check(addr, data.len() as u64)?;
            backing.bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        }

        self.touch_bank(addr)?;
        if let Some(pcie) = &self.pcie {
            pcie.transfer_h2d(data.len() as u64, addr);
        }
        Ok(())
    }

    /// Raw read that bypasses bank accounting and the bridge. Used for
    /// instruction fetch and debugger dumps. Reads short at the end of
    /// memory rather than failing.
    pub fn peek(&self, addr: u64, size: u64) -> Result<Vec<u8>> {
        let backing = self.backing.lock().expect("memory lock poisoned");
        if addr >= self.memory_size {
            return Err(SimError::MemoryAccess { addr, size });
        }
        let end = (addr + size).min(self.memory_size);
        Ok(backing.bytes[addr as usize..end as usize].to_vec())
    }

    /// Host-side image copy (program load). Not a guest access: no counters.
    pub fn load_image(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut backing = self.backing.lock().expect("memory lock poisoned");
        backing.check(addr, data.len() as u64)?;
        backing.bytes[addr as usize..addr as usize + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn touch_bank(&self, addr: u64) -> Result<()> {
        let bank_id = self.bank_of(addr);
        let mut banks = self.banks.lock().expect("bank lock poisoned");
        let bank = banks
            .get_mut(bank_id)
            .ok_or(SimError::MemoryAccess { addr, size: 0 })?;
        bank.accesses += 1;
        if rand::thread_rng().gen::<f64>() < CACHE_HIT_RATE {
            bank.cache_hits += 1;
        } else {
            bank.cache_misses += 1;
        }
        Ok(())
    }

    pub fn bank_stats(&self, bank_id: usize) -> Option<BankStats> {
        self.banks.lock().expect("bank lock poisoned").get(bank_id).cloned()
    }

    pub fn all_bank_stats(&self) -> Vec<BankStats> {
        self.banks.lock().expect("bank lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_system() -> MemorySystem {
        // KNC bank layout over a test-sized store
        MemorySystem::new(Arc::new(ArchProfile::knc()), 1 << 20, None)
    }

    #[test]
    fn bank_hashing() {
        let m = small_system();
        assert_eq!(m.bank_of(0), 0);
        assert_eq!(m.bank_of(7), 7);
        assert_eq!(m.bank_of(8), 0);
        assert_eq!(m.bank_of(0xFFFF_FFFF), 7);
    }

    #[test]
    fn write_then_read_round_trip() {
        let m = small_system();
        let data = b"ABCDEFGH".to_vec();
        m.write(0x100, &data).unwrap();
        assert_eq!(m.read(0x100, 8).unwrap(), data);
    }

    #[test]
    fn bounds_are_inclusive_of_last_byte() {
        let m = small_system();
        let size = m.size();
        assert!(m.write(size - 1, &[0xAA]).is_ok());
        assert_eq!(
            m.write(size, &[0xAA]),
            Err(SimError::MemoryAccess { addr: size, size: 1 })
        );
        assert!(m.read(size - 1, 1).is_ok());
        assert!(m.read(size - 1, 2).is_err());
    }

    #[test]
    fn counters_monotonic_and_consistent() {
        let m = small_system();
        for i in 0..50 {
            m.write(i * 64, &[1, 2, 3, 4]).unwrap();
        }
        let mut last = 0;
        for bank in m.all_bank_stats() {
            assert_eq!(bank.accesses, bank.cache_hits + bank.cache_misses);
            last += bank.accesses;
        }
        assert_eq!(last, 50);
    }

    #[test]
    fn cross_bank_access_counted_on_first_byte() {
        let m = small_system();
        let before = m.bank_stats(3).unwrap().accesses;
        // first byte hashes to bank 3, last byte (addr 18) to bank 2
        m.write(3, &[0u8; 16]).unwrap();
        assert_eq!(m.bank_stats(3).unwrap().accesses, before + 1);
        assert_eq!(m.bank_stats(2).unwrap().accesses, 0);
    }

    #[test]
    fn peek_reads_short_at_end() {
        let m = small_system();
        let size = m.size();
        assert_eq!(m.peek(size - 4, 16).unwrap().len(), 4);
        assert!(m.peek(size, 1).is_err());
    }

    #[test]
    fn pcie_pass_on_guest_access() {
        let profile = Arc::new(ArchProfile::knc());
        let pcie = Arc::new(PcieBridge::new(&profile));
        let m = MemorySystem::new(profile, 1 << 20, Some(pcie.clone()));
        m.write(0, &[1, 2, 3, 4]).unwrap();
        m.read(0, 4).unwrap();
        let s = pcie.stats();
        assert_eq!(s.bytes_host_to_device, 4);
        assert_eq!(s.bytes_device_to_host, 4);
        assert_eq!(s.total_transfers, 2);
    }
}
