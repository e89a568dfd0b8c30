//! The instruction-emission contract every architecture backend implements.
//!
//! The semantics of each operation are architecture-independent; only the
//! encodings differ. A backend that has not implemented an operation must
//! signal so (the fallible operations here return `bool`) rather than emit
//! nothing or emit a placeholder that would execute incorrectly; the driver
//! turns that into a bailout.
//!
//! Backends stage bytes into a private buffer; nothing is executable until
//! [MacroAsm::finalize]. The only mutation of already-emitted bytes is the
//! prologue patch ([MacroAsm::patch_frame_setup]), which happens before
//! finalisation, so no other thread can have observed the patched region.

use super::{frame::FrameLayout, reg_alloc::RegSet};
use crate::{
    bytecode::{FuncIdx, Table, ValueKind},
    compile::{CompileError, Reloc, TrapSite},
};
use dynasmrt::{AssemblyOffset, ExecutableBuffer};

/// Integer binary operations, for both 32 and 64 bit widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IntBinOp {
    Add,
    Sub,
    Mul,
    And,
    Or,
    Xor,
    Shl,
    ShrS,
    ShrU,
}

impl IntBinOp {
    /// Shifts may need their count in a specific register (see
    /// [MacroAsm::shift_count_reg]).
    pub(crate) fn is_shift(&self) -> bool {
        matches!(self, Self::Shl | Self::ShrS | Self::ShrU)
    }
}

/// Float binary operations, for both widths.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FloatBinOp {
    Add,
    Sub,
    Mul,
    Div,
    Min,
    Max,
}

/// Float unary operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FloatUnOp {
    Abs,
    Neg,
    Sqrt,
    Ceil,
    Floor,
    Trunc,
    Nearest,
}

/// Integer comparison conditions.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum IntCond {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

/// Float comparison conditions. All are ordered comparisons (false when
/// either operand is NaN) except `Ne`, which is true on NaN.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FloatCond {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

/// Conversions between value kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Conv {
    I32WrapI64,
    I64ExtendI32S,
    I64ExtendI32U,
    F32DemoteF64,
    F64PromoteF32,
    F32ConvertI32S,
    F32ConvertI64S,
    F64ConvertI32S,
    F64ConvertI64S,
    F32ConvertI32U,
    F32ConvertI64U,
    F64ConvertI32U,
    F64ConvertI64U,
    I32TruncF32S,
    I32TruncF64S,
    I64TruncF32S,
    I64TruncF64S,
}

/// The access width of a memory load or store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum MemWidth {
    B1,
    B2,
    B4,
    B8,
}

/// An opaque token for the prologue's placeholder stack adjustment, to be
/// resolved by [MacroAsm::patch_frame_setup] once the frame size is final.
#[derive(Debug)]
pub(crate) struct FramePatch(pub(crate) AssemblyOffset);

/// A call argument source. By the time a call is emitted the driver has
/// synced every register-resident operand to a slot, so only slots and
/// constants remain.
#[derive(Clone, Copy, Debug)]
pub(crate) enum ArgSrc {
    /// In the frame, at the given offset below the frame base.
    Slot { kind: ValueKind, off: i32 },
    /// An immediate, as raw bits.
    Const { kind: ValueKind, bits: u64 },
}

impl ArgSrc {
    pub(crate) fn kind(&self) -> ValueKind {
        match self {
            Self::Slot { kind, .. } | Self::Const { kind, .. } => *kind,
        }
    }
}

/// Who is being called?
#[derive(Clone, Copy, Debug)]
pub(crate) enum CallTarget {
    /// A module-native function whose address is not yet known; emits a
    /// relocation record.
    Native(FuncIdx),
    /// An external C-convention function at a resolved address.
    Import(usize),
    /// An indirect call through the table, at the index given by `index`.
    Indirect { table: Table, index: ArgSrc },
}

/// The contract between the architecture-independent driver and one
/// architecture's encoder.
///
/// Register operands are physical register codes within the backend's
/// numbering; general-purpose and floating-point codes live in separate
/// namespaces and the [ValueKind] of each operation disambiguates. The
/// backend may freely use its reserved scratch registers (which are never in
/// the allocatable sets) to legalise operands, e.g. for addressing-mode
/// fallback.
pub(crate) trait MacroAsm: Sized {
    fn new() -> Result<Self, CompileError>;

    /// The general-purpose registers the allocator may hand out. Must not
    /// include the backend's scratch or frame registers, and every register
    /// here must be caller-saved (calls do not preserve operand registers;
    /// the driver syncs instead).
    fn gp_allocatable() -> RegSet;
    /// The floating-point registers the allocator may hand out.
    fn fp_allocatable() -> RegSet;
    /// The register a shift count must occupy, if the architecture has such
    /// a constraint.
    fn shift_count_reg() -> Option<u8>;
    /// The register call results of the given class arrive in.
    fn retval_gp() -> u8;
    fn retval_fp() -> u8;
    /// The largest stack adjustment the prologue instruction can encode.
    fn frame_alloc_imm_limit() -> u64;

    /// The current byte offset into the staging buffer.
    fn code_off(&self) -> u32;

    // Frame.
    /// Open the frame and emit the placeholder stack adjustment.
    fn emit_frame_setup(&mut self) -> FramePatch;
    /// Patch the placeholder with the final adjustment. `bytes` has already
    /// been validated against [Self::frame_alloc_imm_limit].
    fn patch_frame_setup(&mut self, patch: FramePatch, bytes: u32);
    /// Compare the stack pointer against the limit word at `limit_addr` and
    /// branch to an out-of-line trap on overflow. Must be emitted before
    /// anything is written to the frame.
    fn emit_stack_check(&mut self, limit_addr: usize);
    /// Store the incoming instance/context pointer to its frame slot.
    fn emit_store_instance(&mut self, frame: &FrameLayout);
    /// Store the incoming parameter registers to the parameters' local
    /// slots. Returns `false` if the signature needs stack-passed
    /// parameters, which this backend does not support.
    fn emit_bind_params(&mut self, params: &[ValueKind], frame: &FrameLayout) -> bool;
    /// Zero-initialise local `idx`.
    fn emit_zero_local(&mut self, frame: &FrameLayout, idx: u32);
    /// Tear down the frame and return. The result, if any, is already in the
    /// return-value register.
    fn emit_ret(&mut self);

    // Moves, spill, fill.
    fn emit_mov_rr(&mut self, kind: ValueKind, dst: u8, src: u8);
    fn emit_const_to_reg(&mut self, kind: ValueKind, dst: u8, bits: u64);
    /// Register to frame slot, at `off` bytes below the frame base.
    fn emit_spill(&mut self, kind: ValueKind, off: i32, src: u8);
    /// Frame slot to register.
    fn emit_fill(&mut self, kind: ValueKind, dst: u8, off: i32);
    /// Immediate to frame slot.
    fn emit_store_imm_slot(&mut self, kind: ValueKind, off: i32, bits: u64);

    // Arithmetic and logic. Two-address: `dst` holds the left operand on
    // entry and the result on exit.
    fn emit_int_binop(&mut self, kind: ValueKind, op: IntBinOp, dst: u8, rhs: u8);
    fn emit_float_binop(&mut self, kind: ValueKind, op: FloatBinOp, dst: u8, rhs: u8);
    fn emit_float_unop(&mut self, kind: ValueKind, op: FloatUnOp, dst: u8);

    // Comparisons: `dst` is a general-purpose register receiving 0 or 1.
    // `dst` may alias `lhs`.
    fn emit_int_cmp(&mut self, kind: ValueKind, cond: IntCond, dst: u8, lhs: u8, rhs: u8);
    fn emit_int_eqz(&mut self, kind: ValueKind, dst: u8, src: u8);
    fn emit_float_cmp(&mut self, kind: ValueKind, cond: FloatCond, dst: u8, lhs: u8, rhs: u8);

    /// Returns `false` if the backend has not implemented this conversion.
    fn emit_conv(&mut self, conv: Conv, dst: u8, src: u8) -> bool;

    // Memory. The effective address is `base + index + off`; when `off` does
    // not fit the architecture's addressing mode the backend computes the
    // address into a scratch register first. Every access records a trap
    // site.
    fn emit_load(
        &mut self,
        kind: ValueKind,
        width: MemWidth,
        signed: bool,
        dst: u8,
        base: u8,
        index: Option<u8>,
        off: u64,
    );
    fn emit_store(
        &mut self,
        kind: ValueKind,
        width: MemWidth,
        src: u8,
        base: u8,
        index: Option<u8>,
        off: u64,
    );

    /// Emit a call. `pass_instance` prepends the saved instance pointer as a
    /// hidden first argument (module-native and indirect callees expect it;
    /// imports do not). May clobber any caller-saved register: the driver
    /// has synced the operand stack beforehand. Returns `false` if the call
    /// shape is unsupported (e.g. arguments beyond the register convention).
    fn emit_call(
        &mut self,
        target: &CallTarget,
        args: &[ArgSrc],
        pass_instance: bool,
        frame: &FrameLayout,
    ) -> bool;

    /// An unconditional trap.
    fn emit_unreachable(&mut self);

    /// Emit any out-of-line code, commit, and hand over the finished buffer
    /// and side tables.
    fn finalize(self) -> Result<(ExecutableBuffer, Vec<Reloc>, Vec<TrapSite>), CompileError>;
}
