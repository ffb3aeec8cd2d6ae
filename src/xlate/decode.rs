use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

use crate::arch::Arch;
use crate::err::{Result, SimError};

/// EVEX prefix byte identifying AVX-512 (and KNC 512-bit) encodings.
pub const EVEX_PREFIX: u8 = 0x62;

// encoded instruction sizes used by the simplified decoder
const EVEX_MIN_BYTES: usize = 5;
const EVEX_INST_LEN: usize = 6;

/// KNC vector opcodes with an AVX-512 counterpart, plus the KNL additions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive)]
pub enum VectorOp {
    Vpmulud      = 0x71,
    Vpbroadcastd = 0x7C,
    Vgatherdps   = 0x7D,
    Vpermd       = 0x7E,
    Vscatterdps  = 0x7F,
    // KNL-only forms
    Vexpandpd    = 0x82,
    Vcompresspd  = 0x8A,
    Vpermilpd    = 0x8C,
    Vpermd2      = 0x8D,
    Vpermt2d     = 0x8E,
    Vpmovd       = 0x8F,
    Vfmadd231ps    = 0x98,
    Vfmaddsub231ps = 0x9A,
    Vfmaddsub132ps = 0x9B,
    Vfmsubadd231ps = 0x9C,
    Vfmsubadd132ps = 0x9D,
    Vcmpps       = 0xC2,
    Vpsubd       = 0xFA,
    Vpaddd       = 0xFE,
    Vmaxps       = 0x5F,
    Vminps       = 0x5D,
}

impl VectorOp {
    pub fn mnemonic(&self) -> &'static str {
        match self {
            VectorOp::Vpmulud => "VPMULUD",
            VectorOp::Vpbroadcastd => "VPBROADCASTD",
            VectorOp::Vgatherdps => "VGATHERDPS",
            VectorOp::Vpermd => "VPERMD",
            VectorOp::Vscatterdps => "VSCATTERDPS",
            VectorOp::Vexpandpd => "VEXPANDPD",
            VectorOp::Vcompresspd => "VCOMPRESSPD",
            VectorOp::Vpermilpd => "VPERMILPD",
            VectorOp::Vpermd2 => "VPERMD2",
            VectorOp::Vpermt2d => "VPERMT2D",
            VectorOp::Vpmovd => "VPMOVD",
            VectorOp::Vfmadd231ps => "VFMADD231PS",
            VectorOp::Vfmaddsub231ps => "VFMADDSUB231PS",
            VectorOp::Vfmaddsub132ps => "VFMADDSUB132PS",
            VectorOp::Vfmsubadd231ps => "VFMSUBADD231PS",
            VectorOp::Vfmsubadd132ps => "VFMSUBADD132PS",
            VectorOp::Vcmpps => "VCMPPS",
            VectorOp::Vpsubd => "VPSUBD",
            VectorOp::Vpaddd => "VPADDD",
            VectorOp::Vmaxps => "VMAXPS",
            VectorOp::Vminps => "VMINPS",
        }
    }

    pub fn is_knl_extension(&self) -> bool {
        matches!(
            self,
            VectorOp::Vexpandpd
                | VectorOp::Vcompresspd
                | VectorOp::Vpermilpd
                | VectorOp::Vpermd2
                | VectorOp::Vpermt2d
                | VectorOp::Vpmovd
                | VectorOp::Vfmadd231ps
                | VectorOp::Vfmaddsub231ps
                | VectorOp::Vfmaddsub132ps
                | VectorOp::Vfmsubadd231ps
                | VectorOp::Vfmsubadd132ps
        )
    }

    /// Re-encoding cost in cycles. Straight register-to-register forms are
    /// free; addressing fix-ups (gather/scatter, immediate predicates) and
    /// the rest cost one cycle.
    pub fn overhead_cycles(&self) -> u32 {
        match self {
            VectorOp::Vpaddd | VectorOp::Vpbroadcastd => 0,
            _ => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstKind {
    /// KNC vector op with a known AVX-512 counterpart.
    Vector(VectorOp),
    /// EVEX-prefixed but unclassified; falls back to the interpreter.
    UnknownVector(u8),
    /// KNC-specific scalar (cache-control group).
    KncScalar,
    /// Plain x86, passed through untouched.
    X86,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInst {
    pub kind: InstKind,
    pub length: usize,
    pub opcode: u8,
}

/// Simplified opcode classifier standing in for a full x86 decoder. Looks at
/// the prefix and opcode bytes only; operand decoding is out of scope.
pub struct Decoder {
    arch: Arch,
}

impl Decoder {
    pub fn new(arch: Arch) -> Self {
        Self { arch }
    }

    pub fn decode(&self, pc: u64, bytes: &[u8]) -> Result<DecodedInst> {
        let first = *bytes.first().ok_or(SimError::InvalidInstruction { pc })?;

        if first == EVEX_PREFIX {
            if bytes.len() < EVEX_MIN_BYTES {
                return Err(SimError::InvalidInstruction { pc });
            }
            let opcode = bytes[4];
            let kind = match VectorOp::from_u8(opcode) {
                // KNL-only encodings are undefined on KNC
                Some(op) if op.is_knl_extension() && self.arch == Arch::Knc => {
                    InstKind::UnknownVector(opcode)
                }
                Some(op) => InstKind::Vector(op),
                None => InstKind::UnknownVector(opcode),
            };
            return Ok(DecodedInst {
                kind,
                length: EVEX_INST_LEN,
                opcode,
            });
        }

        if first == 0x0F && bytes.len() >= 2 {
            match bytes[1] {
                // syscall
                0x05 => {
                    return Ok(DecodedInst {
                        kind: InstKind::X86,
                        length: 2,
                        opcode: first,
                    })
                }
                // CLEVICT/VPREFETCH group, no x86 counterpart
                0xAE => {
                    return Ok(DecodedInst {
                        kind: InstKind::KncScalar,
                        length: 3.min(bytes.len()),
                        opcode: first,
                    })
                }
                _ => {
                    return Ok(DecodedInst {
                        kind: InstKind::X86,
                        length: 2,
                        opcode: first,
                    })
                }
            }
        }

        // mov r64, imm32 (REX.W C7 /0) carries its immediate
        if first == 0x48 && bytes.len() >= 7 && bytes[1] == 0xC7 && bytes[2] & 0xC0 == 0xC0 {
            return Ok(DecodedInst {
                kind: InstKind::X86,
                length: 7,
                opcode: first,
            });
        }

        // everything else passes through; length falls back to one byte
        Ok(DecodedInst {
            kind: InstKind::X86,
            length: 1,
            opcode: first,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn evex(opcode: u8) -> [u8; 6] {
        [EVEX_PREFIX, 0x01, 0x00, 0x00, opcode, 0x00]
    }

    #[test]
    fn classifies_knc_vector_ops() {
        let d = Decoder::new(Arch::Knc);
        let inst = d.decode(0, &evex(0xFE)).unwrap();
        assert_eq!(inst.kind, InstKind::Vector(VectorOp::Vpaddd));
        assert_eq!(inst.length, 6);

        let inst = d.decode(0, &evex(0x7D)).unwrap();
        assert_eq!(inst.kind, InstKind::Vector(VectorOp::Vgatherdps));
    }

    #[test]
    fn unknown_evex_opcode() {
        let d = Decoder::new(Arch::Knc);
        let inst = d.decode(0, &evex(0x11)).unwrap();
        assert_eq!(inst.kind, InstKind::UnknownVector(0x11));
    }

    #[test]
    fn knl_extension_gated_by_arch() {
        let knc = Decoder::new(Arch::Knc);
        let knl = Decoder::new(Arch::Knl);
        assert_eq!(
            knc.decode(0, &evex(0x82)).unwrap().kind,
            InstKind::UnknownVector(0x82)
        );
        assert_eq!(
            knl.decode(0, &evex(0x82)).unwrap().kind,
            InstKind::Vector(VectorOp::Vexpandpd)
        );
    }

    #[test]
    fn truncated_evex_is_invalid() {
        let d = Decoder::new(Arch::Knc);
        assert_eq!(
            d.decode(0x40, &[EVEX_PREFIX, 0x01]),
            Err(SimError::InvalidInstruction { pc: 0x40 })
        );
        assert_eq!(
            d.decode(0, &[]),
            Err(SimError::InvalidInstruction { pc: 0 })
        );
    }

    #[test]
    fn scalar_and_passthrough() {
        let d = Decoder::new(Arch::Knc);
        assert_eq!(d.decode(0, &[0x90]).unwrap().kind, InstKind::X86);
        assert_eq!(d.decode(0, &[0x90]).unwrap().length, 1);
        assert_eq!(d.decode(0, &[0x0F, 0x05]).unwrap().length, 2);
        assert_eq!(
            d.decode(0, &[0x0F, 0xAE, 0x38]).unwrap().kind,
            InstKind::KncScalar
        );
    }
}
