//! The x86-64 emission backend.
//!
//! Conventions used in this module:
//!   * Register operands are dynasmrt register codes; `Rq`/`Rd`/`Rw`/`Rb`
//!     select the operand width of a general purpose register, `Rx` a
//!     floating point register.
//!   * 32-bit integer operations use 32-bit instructions, which zero the
//!     upper half of the destination; nothing here relies on the upper bits
//!     of a register holding a 32-bit value.
//!
//! R11 and XMM15 are reserved as scratch registers: they are never in the
//! allocatable sets, so emission helpers may clobber them freely (e.g. to
//! legalise an addressing mode whose displacement does not fit in 32 bits).

use super::{
    frame::FrameLayout,
    masm::{
        ArgSrc, CallTarget, Conv, FloatBinOp, FloatCond, FloatUnOp, FramePatch, IntBinOp, IntCond,
        MacroAsm, MemWidth,
    },
    reg_alloc::RegSet,
};
use crate::{
    bytecode::{RegClass, ValueKind},
    compile::{CompileError, Reloc, TrapKind, TrapSite},
};
use dynasmrt::{
    dynasm,
    x64::{Rq, Rx},
    DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer, Register as dynasmrtRegister,
};

/// General purpose argument registers as defined by the x64 SysV ABI. The
/// instance pointer travels in the first of these; bytecode parameters take
/// the rest.
static ARG_GP_REGS: [Rq; 6] = [Rq::RDI, Rq::RSI, Rq::RDX, Rq::RCX, Rq::R8, Rq::R9];

/// Floating point argument registers as defined by the x64 SysV ABI.
static ARG_FP_REGS: [Rx; 8] = [
    Rx::XMM0,
    Rx::XMM1,
    Rx::XMM2,
    Rx::XMM3,
    Rx::XMM4,
    Rx::XMM5,
    Rx::XMM6,
    Rx::XMM7,
];

/// The general purpose scratch register. Caller-saved, not an argument
/// register, so it can carry a call target across argument marshalling.
static SCRATCH_GP: Rq = Rq::R11;

/// The floating point scratch register.
static SCRATCH_FP: Rx = Rx::XMM15;

/// The allocatable general purpose registers. RSP/RBP frame the stack, R11
/// is scratch, and RBX/R12-R15 are callee-saved (keeping them out means
/// calls never need a save/restore dance).
static GP_ALLOC: [Rq; 8] = [
    Rq::RAX,
    Rq::RCX,
    Rq::RDX,
    Rq::RSI,
    Rq::RDI,
    Rq::R8,
    Rq::R9,
    Rq::R10,
];

/// The x86-64 code emitter.
pub(crate) struct X64Masm {
    asm: dynasmrt::x64::Assembler,
    relocs: Vec<Reloc>,
    traps: Vec<TrapSite>,
    /// Out-of-line target for the stack-overflow guard, once one is needed.
    stack_ovf: Option<DynamicLabel>,
}

impl X64Masm {
    /// Reduce `base + index + off` to a register plus a 32-bit displacement,
    /// materialising through the scratch register when the displacement does
    /// not fit the addressing-mode encoding.
    fn legalise_addr(&mut self, base: u8, index: Option<u8>, off: u64) -> (u8, i32) {
        match (index, i32::try_from(off)) {
            (None, Ok(disp)) => (base, disp),
            (Some(idx), Ok(disp)) => {
                dynasm!(self.asm ; lea Rq(SCRATCH_GP.code()), [Rq(base) + Rq(idx)]);
                (SCRATCH_GP.code(), disp)
            }
            (None, Err(_)) => {
                dynasm!(self.asm
                    ; mov Rq(SCRATCH_GP.code()), QWORD off as i64
                    ; add Rq(SCRATCH_GP.code()), Rq(base)
                );
                (SCRATCH_GP.code(), 0)
            }
            (Some(idx), Err(_)) => {
                dynasm!(self.asm
                    ; mov Rq(SCRATCH_GP.code()), QWORD off as i64
                    ; add Rq(SCRATCH_GP.code()), Rq(base)
                    ; add Rq(SCRATCH_GP.code()), Rq(idx)
                );
                (SCRATCH_GP.code(), 0)
            }
        }
    }

    fn trap_here(&mut self, kind: TrapKind) {
        self.traps.push(TrapSite {
            off: u32::try_from(self.asm.offset().0).unwrap(),
            kind,
        });
    }
}

impl MacroAsm for X64Masm {
    fn new() -> Result<Self, CompileError> {
        let asm = dynasmrt::x64::Assembler::new()
            .map_err(|e| CompileError::Internal(format!("cannot create assembler: {e}")))?;
        Ok(Self {
            asm,
            relocs: Vec::new(),
            traps: Vec::new(),
            stack_ovf: None,
        })
    }

    fn gp_allocatable() -> RegSet {
        RegSet::from_codes(&GP_ALLOC.map(|r| r.code()))
    }

    fn fp_allocatable() -> RegSet {
        // XMM0-XMM14; XMM15 is scratch.
        RegSet::from_codes(&(0u8..15).collect::<Vec<_>>())
    }

    fn shift_count_reg() -> Option<u8> {
        Some(Rq::RCX.code())
    }

    fn retval_gp() -> u8 {
        Rq::RAX.code()
    }

    fn retval_fp() -> u8 {
        Rx::XMM0.code()
    }

    fn frame_alloc_imm_limit() -> u64 {
        // `sub rsp, imm32`: the immediate is sign-extended, so the largest
        // usable value is i32::MAX.
        u64::try_from(i32::MAX).unwrap()
    }

    fn code_off(&self) -> u32 {
        u32::try_from(self.asm.offset().0).unwrap()
    }

    fn emit_frame_setup(&mut self) -> FramePatch {
        dynasm!(self.asm
            ; push rbp
            ; mov rbp, rsp
        );
        // A dummy allocation of 0 bytes, patched once the frame size is
        // known. The patch instruction must be exactly this size.
        let off = self.asm.offset();
        dynasm!(self.asm ; sub rsp, DWORD 0);
        FramePatch(off)
    }

    fn patch_frame_setup(&mut self, patch: FramePatch, bytes: u32) {
        // The frame builder has already validated `bytes` against
        // `frame_alloc_imm_limit`, so the conversion cannot fail.
        let bytes = i32::try_from(bytes).unwrap();
        let mut patchup = self.asm.alter_uncommitted();
        patchup.goto(patch.0);
        dynasm!(patchup
            // The same size as the placeholder emitted by `emit_frame_setup`.
            ; sub rsp, DWORD bytes
        );
    }

    fn emit_stack_check(&mut self, limit_addr: usize) {
        let lbl = *self
            .stack_ovf
            .get_or_insert_with(|| self.asm.new_dynamic_label());
        dynasm!(self.asm
            ; mov Rq(SCRATCH_GP.code()), QWORD limit_addr as i64
            ; cmp rsp, [Rq(SCRATCH_GP.code())]
            ; jb =>lbl
        );
    }

    fn emit_store_instance(&mut self, frame: &FrameLayout) {
        let off = i32::try_from(frame.instance_off).unwrap();
        dynasm!(self.asm ; mov [rbp - off], Rq(ARG_GP_REGS[0].code()));
    }

    fn emit_bind_params(&mut self, params: &[ValueKind], frame: &FrameLayout) -> bool {
        // The instance pointer occupies the first GP argument register.
        let mut gp_args = ARG_GP_REGS.iter().skip(1);
        let mut fp_args = ARG_FP_REGS.iter();
        for (i, kind) in params.iter().enumerate() {
            let off = frame.local_off(u32::try_from(i).unwrap());
            match kind {
                ValueKind::I32 => match gp_args.next() {
                    Some(r) => dynasm!(self.asm ; mov [rbp - off], Rd(r.code())),
                    None => return false,
                },
                ValueKind::I64 => match gp_args.next() {
                    Some(r) => dynasm!(self.asm ; mov [rbp - off], Rq(r.code())),
                    None => return false,
                },
                ValueKind::F32 => match fp_args.next() {
                    Some(r) => dynasm!(self.asm ; movss [rbp - off], Rx(r.code())),
                    None => return false,
                },
                ValueKind::F64 => match fp_args.next() {
                    Some(r) => dynasm!(self.asm ; movsd [rbp - off], Rx(r.code())),
                    None => return false,
                },
            }
        }
        true
    }

    fn emit_zero_local(&mut self, frame: &FrameLayout, idx: u32) {
        let off = frame.local_off(idx);
        dynasm!(self.asm ; mov QWORD [rbp - off], 0);
    }

    fn emit_ret(&mut self) {
        dynasm!(self.asm
            ; mov rsp, rbp
            ; pop rbp
            ; ret
        );
    }

    fn emit_mov_rr(&mut self, kind: ValueKind, dst: u8, src: u8) {
        match kind {
            ValueKind::I32 | ValueKind::I64 => dynasm!(self.asm ; mov Rq(dst), Rq(src)),
            ValueKind::F32 => dynasm!(self.asm ; movss Rx(dst), Rx(src)),
            ValueKind::F64 => dynasm!(self.asm ; movsd Rx(dst), Rx(src)),
        }
    }

    fn emit_const_to_reg(&mut self, kind: ValueKind, dst: u8, bits: u64) {
        match kind {
            ValueKind::I32 => dynasm!(self.asm ; mov Rd(dst), bits as i32),
            ValueKind::I64 => match i32::try_from(bits as i64) {
                Ok(v) => dynasm!(self.asm ; mov Rq(dst), DWORD v),
                Err(_) => dynasm!(self.asm ; mov Rq(dst), QWORD bits as i64),
            },
            ValueKind::F32 => {
                dynasm!(self.asm
                    ; mov Rd(SCRATCH_GP.code()), bits as i32
                    ; movd Rx(dst), Rd(SCRATCH_GP.code())
                );
            }
            ValueKind::F64 => {
                dynasm!(self.asm
                    ; mov Rq(SCRATCH_GP.code()), QWORD bits as i64
                    ; movq Rx(dst), Rq(SCRATCH_GP.code())
                );
            }
        }
    }

    fn emit_spill(&mut self, kind: ValueKind, off: i32, src: u8) {
        match kind {
            ValueKind::I32 => dynasm!(self.asm ; mov [rbp - off], Rd(src)),
            ValueKind::I64 => dynasm!(self.asm ; mov [rbp - off], Rq(src)),
            ValueKind::F32 => dynasm!(self.asm ; movss [rbp - off], Rx(src)),
            ValueKind::F64 => dynasm!(self.asm ; movsd [rbp - off], Rx(src)),
        }
    }

    fn emit_fill(&mut self, kind: ValueKind, dst: u8, off: i32) {
        match kind {
            ValueKind::I32 => dynasm!(self.asm ; mov Rd(dst), [rbp - off]),
            ValueKind::I64 => dynasm!(self.asm ; mov Rq(dst), [rbp - off]),
            ValueKind::F32 => dynasm!(self.asm ; movss Rx(dst), [rbp - off]),
            ValueKind::F64 => dynasm!(self.asm ; movsd Rx(dst), [rbp - off]),
        }
    }

    fn emit_store_imm_slot(&mut self, kind: ValueKind, off: i32, bits: u64) {
        match kind {
            ValueKind::I32 | ValueKind::F32 => {
                dynasm!(self.asm ; mov DWORD [rbp - off], bits as i32)
            }
            ValueKind::I64 | ValueKind::F64 => match i32::try_from(bits as i64) {
                Ok(v) => dynasm!(self.asm ; mov QWORD [rbp - off], v),
                Err(_) => {
                    // No 64-bit immediate store exists; write the two halves.
                    let lo = bits as u32 as i32;
                    let hi = (bits >> 32) as u32 as i32;
                    dynasm!(self.asm
                        ; mov DWORD [rbp - off], lo
                        ; mov DWORD [rbp - (off - 4)], hi
                    );
                }
            },
        }
    }

    fn emit_int_binop(&mut self, kind: ValueKind, op: IntBinOp, dst: u8, rhs: u8) {
        debug_assert!(matches!(kind, ValueKind::I32 | ValueKind::I64));
        debug_assert!(!op.is_shift() || rhs == Rq::RCX.code());
        let w64 = kind == ValueKind::I64;
        match op {
            IntBinOp::Add => match w64 {
                false => dynasm!(self.asm ; add Rd(dst), Rd(rhs)),
                true => dynasm!(self.asm ; add Rq(dst), Rq(rhs)),
            },
            IntBinOp::Sub => match w64 {
                false => dynasm!(self.asm ; sub Rd(dst), Rd(rhs)),
                true => dynasm!(self.asm ; sub Rq(dst), Rq(rhs)),
            },
            IntBinOp::Mul => match w64 {
                false => dynasm!(self.asm ; imul Rd(dst), Rd(rhs)),
                true => dynasm!(self.asm ; imul Rq(dst), Rq(rhs)),
            },
            IntBinOp::And => match w64 {
                false => dynasm!(self.asm ; and Rd(dst), Rd(rhs)),
                true => dynasm!(self.asm ; and Rq(dst), Rq(rhs)),
            },
            IntBinOp::Or => match w64 {
                false => dynasm!(self.asm ; or Rd(dst), Rd(rhs)),
                true => dynasm!(self.asm ; or Rq(dst), Rq(rhs)),
            },
            IntBinOp::Xor => match w64 {
                false => dynasm!(self.asm ; xor Rd(dst), Rd(rhs)),
                true => dynasm!(self.asm ; xor Rq(dst), Rq(rhs)),
            },
            IntBinOp::Shl => match w64 {
                false => dynasm!(self.asm ; shl Rd(dst), cl),
                true => dynasm!(self.asm ; shl Rq(dst), cl),
            },
            IntBinOp::ShrS => match w64 {
                false => dynasm!(self.asm ; sar Rd(dst), cl),
                true => dynasm!(self.asm ; sar Rq(dst), cl),
            },
            IntBinOp::ShrU => match w64 {
                false => dynasm!(self.asm ; shr Rd(dst), cl),
                true => dynasm!(self.asm ; shr Rq(dst), cl),
            },
        }
    }

    fn emit_float_binop(&mut self, kind: ValueKind, op: FloatBinOp, dst: u8, rhs: u8) {
        match (kind, op) {
            (ValueKind::F32, FloatBinOp::Add) => dynasm!(self.asm ; addss Rx(dst), Rx(rhs)),
            (ValueKind::F32, FloatBinOp::Sub) => dynasm!(self.asm ; subss Rx(dst), Rx(rhs)),
            (ValueKind::F32, FloatBinOp::Mul) => dynasm!(self.asm ; mulss Rx(dst), Rx(rhs)),
            (ValueKind::F32, FloatBinOp::Div) => dynasm!(self.asm ; divss Rx(dst), Rx(rhs)),
            (ValueKind::F32, FloatBinOp::Min) => dynasm!(self.asm ; minss Rx(dst), Rx(rhs)),
            (ValueKind::F32, FloatBinOp::Max) => dynasm!(self.asm ; maxss Rx(dst), Rx(rhs)),
            (ValueKind::F64, FloatBinOp::Add) => dynasm!(self.asm ; addsd Rx(dst), Rx(rhs)),
            (ValueKind::F64, FloatBinOp::Sub) => dynasm!(self.asm ; subsd Rx(dst), Rx(rhs)),
            (ValueKind::F64, FloatBinOp::Mul) => dynasm!(self.asm ; mulsd Rx(dst), Rx(rhs)),
            (ValueKind::F64, FloatBinOp::Div) => dynasm!(self.asm ; divsd Rx(dst), Rx(rhs)),
            (ValueKind::F64, FloatBinOp::Min) => dynasm!(self.asm ; minsd Rx(dst), Rx(rhs)),
            (ValueKind::F64, FloatBinOp::Max) => dynasm!(self.asm ; maxsd Rx(dst), Rx(rhs)),
            _ => unreachable!(),
        }
    }

    fn emit_float_unop(&mut self, kind: ValueKind, op: FloatUnOp, dst: u8) {
        let w64 = kind == ValueKind::F64;
        match op {
            FloatUnOp::Abs => {
                if w64 {
                    dynasm!(self.asm
                        ; mov Rq(SCRATCH_GP.code()), QWORD 0x7fff_ffff_ffff_ffff
                        ; movq Rx(SCRATCH_FP.code()), Rq(SCRATCH_GP.code())
                        ; andpd Rx(dst), Rx(SCRATCH_FP.code())
                    );
                } else {
                    dynasm!(self.asm
                        ; mov Rd(SCRATCH_GP.code()), 0x7fff_ffff
                        ; movd Rx(SCRATCH_FP.code()), Rd(SCRATCH_GP.code())
                        ; andps Rx(dst), Rx(SCRATCH_FP.code())
                    );
                }
            }
            FloatUnOp::Neg => {
                if w64 {
                    dynasm!(self.asm
                        ; mov Rq(SCRATCH_GP.code()), QWORD 0x8000_0000_0000_0000u64 as i64
                        ; movq Rx(SCRATCH_FP.code()), Rq(SCRATCH_GP.code())
                        ; xorpd Rx(dst), Rx(SCRATCH_FP.code())
                    );
                } else {
                    dynasm!(self.asm
                        ; mov Rd(SCRATCH_GP.code()), 0x8000_0000u32 as i32
                        ; movd Rx(SCRATCH_FP.code()), Rd(SCRATCH_GP.code())
                        ; xorps Rx(dst), Rx(SCRATCH_FP.code())
                    );
                }
            }
            FloatUnOp::Sqrt => match w64 {
                false => dynasm!(self.asm ; sqrtss Rx(dst), Rx(dst)),
                true => dynasm!(self.asm ; sqrtsd Rx(dst), Rx(dst)),
            },
            // roundss/roundsd immediates: 0 = nearest-even, 1 = down, 2 = up,
            // 3 = toward zero.
            FloatUnOp::Nearest => match w64 {
                false => dynasm!(self.asm ; roundss Rx(dst), Rx(dst), 0),
                true => dynasm!(self.asm ; roundsd Rx(dst), Rx(dst), 0),
            },
            FloatUnOp::Floor => match w64 {
                false => dynasm!(self.asm ; roundss Rx(dst), Rx(dst), 1),
                true => dynasm!(self.asm ; roundsd Rx(dst), Rx(dst), 1),
            },
            FloatUnOp::Ceil => match w64 {
                false => dynasm!(self.asm ; roundss Rx(dst), Rx(dst), 2),
                true => dynasm!(self.asm ; roundsd Rx(dst), Rx(dst), 2),
            },
            FloatUnOp::Trunc => match w64 {
                false => dynasm!(self.asm ; roundss Rx(dst), Rx(dst), 3),
                true => dynasm!(self.asm ; roundsd Rx(dst), Rx(dst), 3),
            },
        }
    }

    fn emit_int_cmp(&mut self, kind: ValueKind, cond: IntCond, dst: u8, lhs: u8, rhs: u8) {
        match kind {
            ValueKind::I32 => dynasm!(self.asm ; cmp Rd(lhs), Rd(rhs)),
            ValueKind::I64 => dynasm!(self.asm ; cmp Rq(lhs), Rq(rhs)),
            _ => unreachable!(),
        }
        match cond {
            IntCond::Eq => dynasm!(self.asm ; setz Rb(dst)),
            IntCond::Ne => dynasm!(self.asm ; setnz Rb(dst)),
            IntCond::LtS => dynasm!(self.asm ; setl Rb(dst)),
            IntCond::LtU => dynasm!(self.asm ; setb Rb(dst)),
            IntCond::GtS => dynasm!(self.asm ; setg Rb(dst)),
            IntCond::GtU => dynasm!(self.asm ; seta Rb(dst)),
            IntCond::LeS => dynasm!(self.asm ; setle Rb(dst)),
            IntCond::LeU => dynasm!(self.asm ; setbe Rb(dst)),
            IntCond::GeS => dynasm!(self.asm ; setge Rb(dst)),
            IntCond::GeU => dynasm!(self.asm ; setae Rb(dst)),
        }
        dynasm!(self.asm ; movzx Rd(dst), Rb(dst));
    }

    fn emit_int_eqz(&mut self, kind: ValueKind, dst: u8, src: u8) {
        match kind {
            ValueKind::I32 => dynasm!(self.asm ; test Rd(src), Rd(src)),
            ValueKind::I64 => dynasm!(self.asm ; test Rq(src), Rq(src)),
            _ => unreachable!(),
        }
        dynasm!(self.asm
            ; setz Rb(dst)
            ; movzx Rd(dst), Rb(dst)
        );
    }

    fn emit_float_cmp(&mut self, kind: ValueKind, cond: FloatCond, dst: u8, lhs: u8, rhs: u8) {
        // `ucomis*` sets ZF/PF/CF. For Lt/Le the operands are swapped so the
        // condition reads off CF, which NaN forces to 1 (making all ordered
        // comparisons false on NaN). Eq must additionally reject the
        // unordered case via PF; Ne is its complement.
        let (a, b) = match cond {
            FloatCond::Lt | FloatCond::Le => (rhs, lhs),
            _ => (lhs, rhs),
        };
        match kind {
            ValueKind::F32 => dynasm!(self.asm ; ucomiss Rx(a), Rx(b)),
            ValueKind::F64 => dynasm!(self.asm ; ucomisd Rx(a), Rx(b)),
            _ => unreachable!(),
        }
        match cond {
            FloatCond::Eq => dynasm!(self.asm
                ; setz Rb(dst)
                ; setnp Rb(SCRATCH_GP.code())
                ; and Rb(dst), Rb(SCRATCH_GP.code())
            ),
            FloatCond::Ne => dynasm!(self.asm
                ; setnz Rb(dst)
                ; setp Rb(SCRATCH_GP.code())
                ; or Rb(dst), Rb(SCRATCH_GP.code())
            ),
            FloatCond::Gt | FloatCond::Lt => dynasm!(self.asm ; seta Rb(dst)),
            FloatCond::Ge | FloatCond::Le => dynasm!(self.asm ; setae Rb(dst)),
        }
        dynasm!(self.asm ; movzx Rd(dst), Rb(dst));
    }

    fn emit_conv(&mut self, conv: Conv, dst: u8, src: u8) -> bool {
        match conv {
            Conv::I32WrapI64 => dynasm!(self.asm ; mov Rd(dst), Rd(src)),
            Conv::I64ExtendI32S => dynasm!(self.asm ; movsx Rq(dst), Rd(src)),
            Conv::I64ExtendI32U => dynasm!(self.asm ; mov Rd(dst), Rd(src)),
            Conv::F32DemoteF64 => dynasm!(self.asm ; cvtsd2ss Rx(dst), Rx(src)),
            Conv::F64PromoteF32 => dynasm!(self.asm ; cvtss2sd Rx(dst), Rx(src)),
            Conv::F32ConvertI32S => dynasm!(self.asm ; cvtsi2ss Rx(dst), Rd(src)),
            Conv::F32ConvertI64S => dynasm!(self.asm ; cvtsi2ss Rx(dst), Rq(src)),
            Conv::F64ConvertI32S => dynasm!(self.asm ; cvtsi2sd Rx(dst), Rd(src)),
            Conv::F64ConvertI64S => dynasm!(self.asm ; cvtsi2sd Rx(dst), Rq(src)),
            // A u32 zero-extended to 64 bits is exactly representable, so
            // the unsigned 32-bit cases reduce to the signed 64-bit ones.
            Conv::F32ConvertI32U => dynasm!(self.asm
                ; mov Rd(SCRATCH_GP.code()), Rd(src)
                ; cvtsi2ss Rx(dst), Rq(SCRATCH_GP.code())
            ),
            Conv::F64ConvertI32U => dynasm!(self.asm
                ; mov Rd(SCRATCH_GP.code()), Rd(src)
                ; cvtsi2sd Rx(dst), Rq(SCRATCH_GP.code())
            ),
            // Unsigned 64-bit conversions need a branchy sequence and the
            // float-to-int truncations need range/NaN trap semantics; the
            // baseline tier does not implement either.
            Conv::F32ConvertI64U
            | Conv::F64ConvertI64U
            | Conv::I32TruncF32S
            | Conv::I32TruncF64S
            | Conv::I64TruncF32S
            | Conv::I64TruncF64S => return false,
        }
        true
    }

    fn emit_load(
        &mut self,
        kind: ValueKind,
        width: MemWidth,
        signed: bool,
        dst: u8,
        base: u8,
        index: Option<u8>,
        off: u64,
    ) {
        let (b, d) = self.legalise_addr(base, index, off);
        self.trap_here(TrapKind::MemAccess);
        match (kind, width, signed) {
            (ValueKind::I32, MemWidth::B4, _) => dynasm!(self.asm ; mov Rd(dst), [Rq(b) + d]),
            (ValueKind::I32, MemWidth::B1, true) => {
                dynasm!(self.asm ; movsx Rd(dst), BYTE [Rq(b) + d])
            }
            (ValueKind::I32, MemWidth::B1, false) => {
                dynasm!(self.asm ; movzx Rd(dst), BYTE [Rq(b) + d])
            }
            (ValueKind::I32, MemWidth::B2, true) => {
                dynasm!(self.asm ; movsx Rd(dst), WORD [Rq(b) + d])
            }
            (ValueKind::I32, MemWidth::B2, false) => {
                dynasm!(self.asm ; movzx Rd(dst), WORD [Rq(b) + d])
            }
            (ValueKind::I64, MemWidth::B8, _) => dynasm!(self.asm ; mov Rq(dst), [Rq(b) + d]),
            (ValueKind::I64, MemWidth::B4, true) => {
                dynasm!(self.asm ; movsx Rq(dst), DWORD [Rq(b) + d])
            }
            (ValueKind::I64, MemWidth::B4, false) => {
                // A 32-bit load zeroes the upper half.
                dynasm!(self.asm ; mov Rd(dst), [Rq(b) + d])
            }
            (ValueKind::I64, MemWidth::B1, true) => {
                dynasm!(self.asm ; movsx Rq(dst), BYTE [Rq(b) + d])
            }
            (ValueKind::I64, MemWidth::B1, false) => {
                dynasm!(self.asm ; movzx Rq(dst), BYTE [Rq(b) + d])
            }
            (ValueKind::I64, MemWidth::B2, true) => {
                dynasm!(self.asm ; movsx Rq(dst), WORD [Rq(b) + d])
            }
            (ValueKind::I64, MemWidth::B2, false) => {
                dynasm!(self.asm ; movzx Rq(dst), WORD [Rq(b) + d])
            }
            (ValueKind::F32, MemWidth::B4, _) => dynasm!(self.asm ; movss Rx(dst), [Rq(b) + d]),
            (ValueKind::F64, MemWidth::B8, _) => dynasm!(self.asm ; movsd Rx(dst), [Rq(b) + d]),
            _ => unreachable!("invalid load shape"),
        }
    }

    fn emit_store(
        &mut self,
        kind: ValueKind,
        width: MemWidth,
        src: u8,
        base: u8,
        index: Option<u8>,
        off: u64,
    ) {
        let (b, d) = self.legalise_addr(base, index, off);
        self.trap_here(TrapKind::MemAccess);
        match (kind, width) {
            (ValueKind::I32, MemWidth::B4) => dynasm!(self.asm ; mov [Rq(b) + d], Rd(src)),
            (ValueKind::I32 | ValueKind::I64, MemWidth::B1) => {
                dynasm!(self.asm ; mov [Rq(b) + d], Rb(src))
            }
            (ValueKind::I32 | ValueKind::I64, MemWidth::B2) => {
                dynasm!(self.asm ; mov [Rq(b) + d], Rw(src))
            }
            (ValueKind::I64, MemWidth::B4) => dynasm!(self.asm ; mov [Rq(b) + d], Rd(src)),
            (ValueKind::I64, MemWidth::B8) => dynasm!(self.asm ; mov [Rq(b) + d], Rq(src)),
            (ValueKind::F32, MemWidth::B4) => dynasm!(self.asm ; movss [Rq(b) + d], Rx(src)),
            (ValueKind::F64, MemWidth::B8) => dynasm!(self.asm ; movsd [Rq(b) + d], Rx(src)),
            _ => unreachable!("invalid store shape"),
        }
    }

    fn emit_call(
        &mut self,
        target: &CallTarget,
        args: &[ArgSrc],
        pass_instance: bool,
        frame: &FrameLayout,
    ) -> bool {
        let ngp = usize::from(pass_instance)
            + args
                .iter()
                .filter(|a| matches!(a.kind(), ValueKind::I32 | ValueKind::I64))
                .count();
        let nfp = args.len() + usize::from(pass_instance) - ngp;
        if ngp > ARG_GP_REGS.len() || nfp > ARG_FP_REGS.len() {
            return false;
        }

        // Materialise the callee into the scratch register first: argument
        // marshalling below must leave it alone. RAX is the only other
        // register clobbered here, and it is neither an argument register
        // nor live (the driver has synced the operand stack).
        match target {
            CallTarget::Native(fidx) => {
                dynasm!(self.asm ; mov Rq(SCRATCH_GP.code()), QWORD 0);
                // The imm64 is the final 8 bytes of the mov.
                self.relocs.push(Reloc {
                    off: u32::try_from(self.asm.offset().0 - 8).unwrap(),
                    func: *fidx,
                });
            }
            CallTarget::Import(addr) => {
                let addr = *addr as i64;
                dynasm!(self.asm ; mov Rq(SCRATCH_GP.code()), QWORD addr);
            }
            CallTarget::Indirect { table, index } => match index {
                ArgSrc::Const { bits, .. } => {
                    let entry = (table.base as u64).wrapping_add(bits.wrapping_mul(8)) as i64;
                    dynasm!(self.asm ; mov Rq(SCRATCH_GP.code()), QWORD entry);
                    self.trap_here(TrapKind::IndirectCall);
                    dynasm!(self.asm ; mov Rq(SCRATCH_GP.code()), [Rq(SCRATCH_GP.code())]);
                }
                ArgSrc::Slot { off, .. } => {
                    let base = table.base as i64;
                    let off = *off;
                    dynasm!(self.asm
                        // Table indices are 32 bits; the load zero-extends.
                        ; mov Rd(SCRATCH_GP.code()), [rbp - off]
                        ; mov Rq(Rq::RAX.code()), QWORD base
                    );
                    self.trap_here(TrapKind::IndirectCall);
                    dynasm!(self.asm
                        ; mov Rq(SCRATCH_GP.code()), [Rq(Rq::RAX.code()) + Rq(SCRATCH_GP.code()) * 8]
                    );
                }
            },
        }

        let mut gp_args = ARG_GP_REGS.iter();
        let mut fp_args = ARG_FP_REGS.iter();
        if pass_instance {
            let r = gp_args.next().unwrap();
            let off = i32::try_from(frame.instance_off).unwrap();
            dynasm!(self.asm ; mov Rq(r.code()), [rbp - off]);
        }
        for a in args {
            match a {
                ArgSrc::Slot { kind, off } => {
                    let r = match kind.reg_class() {
                        RegClass::Gp => gp_args.next().unwrap().code(),
                        RegClass::Fp => fp_args.next().unwrap().code(),
                    };
                    self.emit_fill(*kind, r, *off);
                }
                ArgSrc::Const { kind, bits } => match kind {
                    ValueKind::I32 => {
                        let r = gp_args.next().unwrap();
                        let v = *bits as i32;
                        dynasm!(self.asm ; mov Rd(r.code()), v);
                    }
                    ValueKind::I64 => {
                        let r = gp_args.next().unwrap();
                        let v = *bits as i64;
                        dynasm!(self.asm ; mov Rq(r.code()), QWORD v);
                    }
                    ValueKind::F32 => {
                        let r = fp_args.next().unwrap();
                        let v = *bits as i32;
                        dynasm!(self.asm
                            ; mov Rd(Rq::RAX.code()), v
                            ; movd Rx(r.code()), Rd(Rq::RAX.code())
                        );
                    }
                    ValueKind::F64 => {
                        let r = fp_args.next().unwrap();
                        let v = *bits as i64;
                        dynasm!(self.asm
                            ; mov Rq(Rq::RAX.code()), QWORD v
                            ; movq Rx(r.code()), Rq(Rq::RAX.code())
                        );
                    }
                },
            }
        }

        dynasm!(self.asm ; call Rq(SCRATCH_GP.code()));
        true
    }

    fn emit_unreachable(&mut self) {
        self.trap_here(TrapKind::Unreachable);
        dynasm!(self.asm ; ud2);
    }

    fn finalize(mut self) -> Result<(ExecutableBuffer, Vec<Reloc>, Vec<TrapSite>), CompileError> {
        // The out-of-line section: the stack-overflow guard's trap target.
        if let Some(lbl) = self.stack_ovf {
            self.trap_here(TrapKind::StackOverflow);
            dynasm!(self.asm
                ; =>lbl
                ; ud2
            );
        }

        // If an error happens here, we've made a mistake in the assembly we
        // generate.
        self.asm
            .commit()
            .map_err(|e| CompileError::Internal(format!("when committing: {e}")))?;
        // This unwrap cannot fail if `commit` (above) succeeded.
        let buf = self.asm.finalize().unwrap();
        Ok((buf, self.relocs, self.traps))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::baseline::frame::FrameBuilder;
    use dynasmrt::AssemblyOffset;
    use fm::FMatcher;
    use regex::Regex;

    /// Finish a hand-driven emission sequence with a `frame_bytes`-byte
    /// frame and hand back the executable buffer.
    fn finish(mut masm: X64Masm, patch: FramePatch, frame_bytes: u32) -> ExecutableBuffer {
        masm.patch_frame_setup(patch, frame_bytes);
        let (buf, _, _) = masm.finalize().unwrap();
        buf
    }

    unsafe fn run_u64(buf: &ExecutableBuffer) -> u64 {
        let f: unsafe extern "C" fn() -> u64 = std::mem::transmute(buf.ptr(AssemblyOffset(0)));
        f()
    }

    fn disasm(code: &[u8]) -> String {
        let fmt = zydis::Formatter::intel();
        let dec = zydis::Decoder::new64();
        let mut out = Vec::new();
        for insn_info in dec.decode_all::<zydis::VisibleOperands>(code, 0) {
            let (ip, _, insn) = insn_info.unwrap();
            out.push(fmt.format(Some(ip), &insn).unwrap());
        }
        out.join("\n")
    }

    /// Match a disassembled listing against an `fm` pattern.
    fn match_asm(code: &[u8], ptn: &str) {
        let dis = disasm(code);
        match FMatcher::new(ptn).unwrap().matches(&dis) {
            Ok(()) => (),
            Err(e) => panic!("\n!!! Emitted code didn't match !!!\n\n{e}\nFull asm:\n{dis}\n"),
        }
    }

    #[test]
    fn spill_fill_roundtrip_i64() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_const_to_reg(ValueKind::I64, Rq::RCX.code(), 0x1234_5678_9abc_def0);
        masm.emit_spill(ValueKind::I64, 16, Rq::RCX.code());
        masm.emit_fill(ValueKind::I64, Rq::RAX.code(), 16);
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        assert_eq!(unsafe { run_u64(&buf) }, 0x1234_5678_9abc_def0);
    }

    #[test]
    fn spill_fill_roundtrip_f32() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_const_to_reg(ValueKind::F32, Rx::XMM1.code(), u64::from(1.5f32.to_bits()));
        masm.emit_spill(ValueKind::F32, 16, Rx::XMM1.code());
        masm.emit_fill(ValueKind::F32, Rx::XMM0.code(), 16);
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        let f: unsafe extern "C" fn() -> f32 =
            unsafe { std::mem::transmute(buf.ptr(AssemblyOffset(0))) };
        assert_eq!(unsafe { f() }, 1.5f32);
    }

    #[test]
    fn int_binop_add32_wraps() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_const_to_reg(ValueKind::I32, Rq::RAX.code(), i32::MAX as u32 as u64);
        masm.emit_const_to_reg(ValueKind::I32, Rq::RDX.code(), 1);
        masm.emit_int_binop(ValueKind::I32, IntBinOp::Add, Rq::RAX.code(), Rq::RDX.code());
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        assert_eq!(unsafe { run_u64(&buf) } as u32, i32::MIN as u32);
    }

    #[test]
    fn float_cmp_handles_nan() {
        // NaN == NaN must be 0, NaN != NaN must be 1.
        for (cond, expect) in [(FloatCond::Eq, 0u64), (FloatCond::Ne, 1u64)] {
            let mut masm = X64Masm::new().unwrap();
            let patch = masm.emit_frame_setup();
            masm.emit_const_to_reg(ValueKind::F64, Rx::XMM1.code(), f64::NAN.to_bits());
            masm.emit_float_cmp(
                ValueKind::F64,
                cond,
                Rq::RAX.code(),
                Rx::XMM1.code(),
                Rx::XMM1.code(),
            );
            masm.emit_ret();
            let buf = finish(masm, patch, 16);
            assert_eq!(unsafe { run_u64(&buf) }, expect);
        }
    }

    #[test]
    fn load_small_offset_uses_plain_addressing() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_load(
            ValueKind::I32,
            MemWidth::B4,
            false,
            Rq::RAX.code(),
            Rq::RCX.code(),
            None,
            64,
        );
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        match_asm(
            &buf,
            "
            ...
            mov eax, [rcx+0x40]
            ...
            ",
        );
        // No scratch arithmetic was needed.
        assert!(!disasm(&buf).contains("r11"));
    }

    #[test]
    fn load_huge_offset_falls_back_to_scratch() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_load(
            ValueKind::I32,
            MemWidth::B4,
            false,
            Rq::RAX.code(),
            Rq::RCX.code(),
            None,
            u64::from(u32::MAX) + 64,
        );
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        match_asm(
            &buf,
            "
            ...
            add r11, rcx
            mov eax, [r11]
            ...
            ",
        );
        // The over-range offset was materialised into the scratch register.
        let imm_into_scratch = Regex::new(r"mov r11, 0x1[0-9a-fA-F]{8}").unwrap();
        assert!(imm_into_scratch.is_match(&disasm(&buf)));
    }

    #[test]
    fn indexed_load() {
        let data: [u64; 4] = [10, 20, 30, 40];
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_const_to_reg(ValueKind::I64, Rq::RCX.code(), data.as_ptr() as u64);
        masm.emit_const_to_reg(ValueKind::I64, Rq::RDX.code(), 16);
        masm.emit_load(
            ValueKind::I64,
            MemWidth::B8,
            false,
            Rq::RAX.code(),
            Rq::RCX.code(),
            Some(Rq::RDX.code()),
            8,
        );
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        // data[(16 + 8) / 8] == data[3]
        assert_eq!(unsafe { run_u64(&buf) }, 40);
    }

    extern "C" fn sub_i64(a: i64, b: i64) -> i64 {
        a.wrapping_sub(b)
    }

    #[test]
    fn call_import_marshals_args() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        // One slot argument, one constant argument.
        masm.emit_store_imm_slot(ValueKind::I64, 16, 100);
        let frame = FrameBuilder::new(0).layout;
        let ok = masm.emit_call(
            &CallTarget::Import(sub_i64 as usize),
            &[
                ArgSrc::Slot {
                    kind: ValueKind::I64,
                    off: 16,
                },
                ArgSrc::Const {
                    kind: ValueKind::I64,
                    bits: 58,
                },
            ],
            false,
            &frame,
        );
        assert!(ok);
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        assert_eq!(unsafe { run_u64(&buf) }, 42);
    }

    #[test]
    fn call_with_too_many_args_is_unsupported() {
        let mut masm = X64Masm::new().unwrap();
        let _patch = masm.emit_frame_setup();
        let frame = FrameBuilder::new(0).layout;
        let args = vec![
            ArgSrc::Const {
                kind: ValueKind::I64,
                bits: 0
            };
            7
        ];
        assert!(!masm.emit_call(&CallTarget::Import(0), &args, false, &frame));
    }

    #[test]
    fn store_imm_slot_wide_imm() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_store_imm_slot(ValueKind::I64, 16, 0xdead_beef_cafe_f00d);
        masm.emit_fill(ValueKind::I64, Rq::RAX.code(), 16);
        masm.emit_ret();
        let buf = finish(masm, patch, 16);
        assert_eq!(unsafe { run_u64(&buf) }, 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn frame_patch_reserves_requested_bytes() {
        let mut masm = X64Masm::new().unwrap();
        let patch = masm.emit_frame_setup();
        masm.emit_ret();
        let buf = finish(masm, patch, 0x120);
        match_asm(
            &buf,
            "
            push rbp
            mov rbp, rsp
            sub rsp, 0x120
            ...
            ",
        );
    }

    #[test]
    fn unreachable_records_trap() {
        let mut masm = X64Masm::new().unwrap();
        let _patch = masm.emit_frame_setup();
        let before = masm.code_off();
        masm.emit_unreachable();
        let (buf, _, traps) = masm.finalize().unwrap();
        assert_eq!(traps.len(), 1);
        assert_eq!(traps[0].kind, TrapKind::Unreachable);
        assert_eq!(traps[0].off, before);
        // ud2 is 0x0f 0x0b.
        assert_eq!(&buf[usize::try_from(before).unwrap()..][..2], &[0x0f, 0x0b]);
    }
}
