use std::fs;
use std::path::Path;

use goblin::elf::program_header::{PF_W, PF_X, PT_LOAD};
use goblin::elf::Elf;
use log::{info, warn};

use crate::err::{Result, SimError};

/// Machine id stamped on MIC (K1OM) binaries.
pub const EM_K1OM: u16 = 181;

#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: u64,
    pub data: Vec<u8>,
    pub executable: bool,
    pub writable: bool,
}

#[derive(Debug, Clone)]
pub struct SymbolInfo {
    pub name: String,
    pub value: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct RelocInfo {
    pub offset: u64,
    pub symbol_index: usize,
    pub kind: u32,
    pub addend: i64,
}

/// A MIC binary parsed into loadable form: PT_LOAD segments materialized
/// with their zero-fill, symbols and relocations kept for later resolution.
#[derive(Debug, Default)]
pub struct LoadedBinary {
    pub entry: u64,
    pub segments: Vec<Segment>,
    pub symbols: Vec<SymbolInfo>,
    pub relocations: Vec<RelocInfo>,
    pub is_mic: bool,
}

impl LoadedBinary {
    pub fn load_path(path: &Path) -> Result<Self> {
        let data = fs::read(path).map_err(|e| {
            SimError::InvalidArgument(format!("cannot read {}: {e}", path.display()))
        })?;
        let binary = Self::parse(&data)?;
        info!(
            "loaded {}: entry {:#x}, {} segments, {} symbols",
            path.display(),
            binary.entry,
            binary.segments.len(),
            binary.symbols.len()
        );
        Ok(binary)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let elf = Elf::parse(data)
            .map_err(|e| SimError::InvalidArgument(format!("not a valid ELF: {e}")))?;

        if !elf.is_64 {
            return Err(SimError::InvalidArgument("not a 64-bit ELF".to_string()));
        }
        if !elf.little_endian {
            return Err(SimError::InvalidArgument("not little-endian".to_string()));
        }

        let is_mic = elf.header.e_machine == EM_K1OM;
        if !is_mic {
            warn!(
                "binary may not target the MIC architecture (machine {})",
                elf.header.e_machine
            );
        }

        let mut segments = Vec::new();
        for ph in &elf.program_headers {
            if ph.p_type != PT_LOAD || ph.p_memsz == 0 {
                continue;
            }
            let offset = ph.p_offset as usize;
            let filesz = ph.p_filesz as usize;
            if offset + filesz > data.len() {
                return Err(SimError::InvalidArgument(format!(
                    "segment at {:#x} extends past end of file",
                    ph.p_vaddr
                )));
            }
            // p_memsz > p_filesz zero-fills (.bss)
            let mut bytes = vec![0u8; ph.p_memsz as usize];
            bytes[..filesz].copy_from_slice(&data[offset..offset + filesz]);
            segments.push(Segment {
                vaddr: ph.p_vaddr,
                data: bytes,
                executable: ph.p_flags & PF_X != 0,
                writable: ph.p_flags & PF_W != 0,
            });
        }

        let symbols = elf
            .syms
            .iter()
            .map(|sym| SymbolInfo {
                name: elf
                    .strtab
                    .get_at(sym.st_name)
                    .unwrap_or_default()
                    .to_string(),
                value: sym.st_value,
                size: sym.st_size,
            })
            .collect();

        let mut relocations = Vec::new();
        for (_, section) in &elf.shdr_relocs {
            for reloc in section.iter() {
                relocations.push(RelocInfo {
                    offset: reloc.r_offset,
                    symbol_index: reloc.r_sym,
                    kind: reloc.r_type,
                    addend: reloc.r_addend.unwrap_or(0),
                });
            }
        }

        Ok(Self {
            entry: elf.header.e_entry,
            segments,
            symbols,
            relocations,
            is_mic,
        })
    }

    /// Total bytes of executable segments.
    pub fn text_size(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.executable)
            .map(|s| s.data.len())
            .sum()
    }

    /// Total bytes of writable segments.
    pub fn data_size(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| s.writable)
            .map(|s| s.data.len())
            .sum()
    }

    pub fn resolve_symbol(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find(|sym| sym.name == name)
            .map(|sym| sym.value)
    }

    pub fn log_info(&self) {
        info!(
            "binary: entry {:#x}, mic={}, text {} bytes, data {} bytes, {} relocations",
            self.entry,
            self.is_mic,
            self.text_size(),
            self.data_size(),
            self.relocations.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimal 64-bit LE executable: one PT_LOAD (R+X) segment of two code
    // bytes at 0x1000, memsz padded for zero-fill.
    fn build_elf(machine: u16) -> Vec<u8> {
        let mut elf = Vec::new();
        // e_ident
        elf.extend_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
        elf.extend_from_slice(&[0u8; 8]);
        elf.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        elf.extend_from_slice(&machine.to_le_bytes()); // e_machine
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&0x1000u64.to_le_bytes()); // e_entry
        elf.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
        elf.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
        elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(elf.len(), 64);

        // program header
        elf.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
        elf.extend_from_slice(&(PF_X | 4u32).to_le_bytes()); // p_flags = R+X
        elf.extend_from_slice(&120u64.to_le_bytes()); // p_offset
        elf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_vaddr
        elf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_paddr
        elf.extend_from_slice(&2u64.to_le_bytes()); // p_filesz
        elf.extend_from_slice(&16u64.to_le_bytes()); // p_memsz
        elf.extend_from_slice(&0x1000u64.to_le_bytes()); // p_align
        assert_eq!(elf.len(), 120);

        // segment contents: nop; ret
        elf.extend_from_slice(&[0x90, 0xC3]);
        elf
    }

    #[test]
    fn parses_mic_binary() {
        let binary = LoadedBinary::parse(&build_elf(EM_K1OM)).unwrap();
        assert!(binary.is_mic);
        assert_eq!(binary.entry, 0x1000);
        assert_eq!(binary.segments.len(), 1);

        let seg = &binary.segments[0];
        assert_eq!(seg.vaddr, 0x1000);
        assert!(seg.executable);
        assert!(!seg.writable);
        // file bytes then zero-fill out to memsz
        assert_eq!(seg.data.len(), 16);
        assert_eq!(&seg.data[..2], &[0x90, 0xC3]);
        assert!(seg.data[2..].iter().all(|&b| b == 0));
        assert_eq!(binary.text_size(), 16);
        assert_eq!(binary.data_size(), 0);
    }

    #[test]
    fn foreign_machine_loads_with_warning() {
        // x86-64 binary: loadable, but flagged as non-MIC
        let binary = LoadedBinary::parse(&build_elf(62)).unwrap();
        assert!(!binary.is_mic);
        assert_eq!(binary.segments.len(), 1);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(LoadedBinary::parse(b"not an elf at all").is_err());
        assert!(LoadedBinary::parse(&[]).is_err());
    }

    #[test]
    fn truncated_segment_is_rejected() {
        let mut elf = build_elf(EM_K1OM);
        elf.truncate(121); // cut into the segment bytes
        assert!(LoadedBinary::parse(&elf).is_err());
    }
}
