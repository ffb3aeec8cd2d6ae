pub mod cache;
pub mod decode;

use log::debug;

pub use cache::{TranslationCache, CACHE_SIZE};
pub use decode::{DecodedInst, Decoder, InstKind, VectorOp, EVEX_PREFIX};

use crate::arch::Arch;
use crate::err::Result;

// interpreter fallback costs, in cycles
const UNKNOWN_VECTOR_OVERHEAD: u32 = 10;
const KNC_SCALAR_OVERHEAD: u32 = 5;

/// One finished translation. `length` is the size of the original
/// instruction (how far the instruction pointer advances); `bytes` is the
/// host-executable form, empty when the interpreter must take over.
#[derive(Debug, Default, Clone)]
pub struct Translation {
    pub bytes: Vec<u8>,
    pub length: usize,
    pub description: String,
    pub emulated: bool,
    pub vector: bool,
    pub overhead_cycles: u32,
}

#[derive(Debug, Default, Clone)]
pub struct XlateStats {
    pub instructions_translated: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub vector_instructions: u64,
    pub knc_specific_instructions: u64,
}

impl XlateStats {
    pub fn merge(&mut self, other: &XlateStats) {
        self.instructions_translated += other.instructions_translated;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.vector_instructions += other.vector_instructions;
        self.knc_specific_instructions += other.knc_specific_instructions;
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total > 0 {
            self.cache_hits as f64 / total as f64 * 100.0
        } else {
            0.0
        }
    }
}

/// KNC-to-AVX-512 instruction translator. Each core worker owns one;
/// translation is a pure function of the instruction bytes, so per-core
/// caches never need to agree with each other.
pub struct Translator {
    decoder: Decoder,
    cache: TranslationCache,
    pub stats: XlateStats,
}

impl Translator {
    pub fn new(arch: Arch) -> Self {
        Self {
            decoder: Decoder::new(arch),
            cache: TranslationCache::new(),
            stats: XlateStats::default(),
        }
    }

    pub fn translate(&mut self, pc: u64, bytes: &[u8]) -> Result<Translation> {
        self.stats.instructions_translated += 1;

        if let Some(cached) = self.cache.lookup(pc) {
            self.stats.cache_hits += 1;
            return Ok(cached.clone());
        }
        self.stats.cache_misses += 1;

        let translation = self.translate_uncached(pc, bytes)?;
        self.cache.insert(pc, bytes, translation.clone());
        Ok(translation)
    }

    fn translate_uncached(&mut self, pc: u64, bytes: &[u8]) -> Result<Translation> {
        let inst = self.decoder.decode(pc, bytes)?;

        Ok(match inst.kind {
            InstKind::Vector(op) => {
                self.stats.vector_instructions += 1;
                let encoded = encode_evex_op(op);
                Translation {
                    length: inst.length,
                    description: format!("KNC {} -> AVX-512 {}", op.mnemonic(), op.mnemonic()),
                    emulated: false,
                    vector: true,
                    overhead_cycles: op.overhead_cycles(),
                    bytes: encoded,
                }
            }
            InstKind::UnknownVector(opcode) => {
                self.stats.vector_instructions += 1;
                debug!("no AVX-512 form for vector opcode {opcode:#04x} at {pc:#x}");
                Translation {
                    bytes: Vec::new(),
                    length: inst.length,
                    description: format!("vector opcode {opcode:#04x}, interpreter fallback"),
                    emulated: true,
                    vector: true,
                    overhead_cycles: UNKNOWN_VECTOR_OVERHEAD,
                }
            }
            InstKind::KncScalar => {
                self.stats.knc_specific_instructions += 1;
                Translation {
                    bytes: bytes[..inst.length].to_vec(),
                    length: inst.length,
                    description: "KNC-specific scalar, interpreter fallback".to_string(),
                    emulated: true,
                    vector: false,
                    overhead_cycles: KNC_SCALAR_OVERHEAD,
                }
            }
            InstKind::X86 => Translation {
                bytes: bytes[..inst.length.min(bytes.len())].to_vec(),
                length: inst.length,
                description: "native x86".to_string(),
                emulated: false,
                vector: false,
                overhead_cycles: 0,
            },
        })
    }

    pub fn flush_cache(&mut self) {
        self.cache.flush();
    }

    pub fn invalidate_range(&mut self, start: u64, size: u64) -> usize {
        self.cache.invalidate_range(start, size)
    }

    pub fn log_stats(&self) {
        debug!(
            "translator: {} translated, {} hits / {} misses ({:.2}% hit rate), {} vector, {} knc-specific",
            self.stats.instructions_translated,
            self.stats.cache_hits,
            self.stats.cache_misses,
            self.stats.hit_rate(),
            self.stats.vector_instructions,
            self.stats.knc_specific_instructions,
        );
    }
}

/// Simplified EVEX re-encoding: prefix, compressed payload bytes, opcode,
/// and zeroed ModRM/SIB. Operand re-mapping is left to the host assembler
/// stage this feeds.
fn encode_evex_op(op: VectorOp) -> Vec<u8> {
    vec![EVEX_PREFIX, 0x01, 0x00, op as u8, 0x00, 0x00]
}
