//! The baseline translation driver.
//!
//! One [BaselineCompiler] compiles one function: it walks the bytecode in a
//! single linear pass, maintaining an abstract operand stack whose entries
//! record where each value currently lives (register, spill slot, or
//! still-immediate constant), and hands each operation to the emission
//! backend once its operands are materialised. There is no second pass and
//! no liveness analysis; compile time stays linear in bytecode size at the
//! cost of suboptimal code.
//!
//! Any construct the backend cannot express latches the [BailoutState].
//! From that point on every operation is a no-op, the pass runs to the end
//! without emitting another byte, and the partial code is discarded.

use crate::{
    bytecode::{FuncType, Function, ModuleEnv, Op, RegClass, ValueKind},
    compile::{CompileError, CompiledCode, LiveMap, LiveSlot},
};

pub mod frame;
pub mod reg_alloc;

pub(crate) mod masm;
#[cfg(target_arch = "x86_64")]
pub(crate) mod x64;

use frame::{FrameBuilder, SlotIdx};
use masm::{
    ArgSrc, CallTarget, Conv, FloatBinOp, FloatCond, FloatUnOp, IntBinOp, IntCond, MacroAsm,
    MemWidth,
};
use reg_alloc::{Location, OperandState, RegAlloc, RegSet};

/// Why did a compilation abandon the baseline tier?
#[derive(Debug)]
enum BailReason {
    Unsupported(String),
    LimitExceeded(String),
}

impl From<BailReason> for CompileError {
    fn from(r: BailReason) -> Self {
        match r {
            BailReason::Unsupported(s) => CompileError::Unsupported(s),
            BailReason::LimitExceeded(s) => CompileError::LimitExceeded(s),
        }
    }
}

/// Latched at most once per compilation. The first reason wins; later calls
/// to [Self::bail] are ignored.
#[derive(Debug, Default)]
struct BailoutState(Option<BailReason>);

impl BailoutState {
    fn bail(&mut self, r: BailReason) {
        if self.0.is_none() {
            self.0 = Some(r);
        }
    }

    fn bailed(&self) -> bool {
        self.0.is_some()
    }
}

/// Compiles one function against the emission backend `M`.
pub(crate) struct BaselineCompiler<'a, M> {
    env: &'a ModuleEnv,
    func: &'a Function,
    masm: M,
    ra: RegAlloc,
    frame: FrameBuilder,
    /// The abstract operand stack.
    stack: Vec<OperandState>,
    bailout: BailoutState,
    /// Control has definitely left the function (a `return` or a trap);
    /// nothing may fall through.
    returned: bool,
    live_maps: Vec<LiveMap>,
}

impl<'a, M: MacroAsm> BaselineCompiler<'a, M> {
    pub(crate) fn new(env: &'a ModuleEnv, func: &'a Function) -> Result<Self, CompileError> {
        let num_locals = u32::try_from(func.num_locals())
            .map_err(|_| CompileError::Internal("local count overflow".into()))?;
        Ok(Self {
            env,
            func,
            masm: M::new()?,
            ra: RegAlloc::new(M::gp_allocatable(), M::fp_allocatable()),
            frame: FrameBuilder::new(num_locals),
            stack: Vec::new(),
            bailout: BailoutState::default(),
            returned: false,
            live_maps: Vec::new(),
        })
    }

    pub(crate) fn compile(mut self) -> Result<CompiledCode, CompileError> {
        let patch = self.masm.emit_frame_setup();
        // The guard must run before anything is written to the frame, so
        // that the guard page is never silently skipped.
        if let Some(limit) = self.env.stack_limit {
            self.masm.emit_stack_check(limit);
        }
        self.masm.emit_store_instance(&self.frame.layout);
        if !self.masm.emit_bind_params(&self.func.ty.params, &self.frame.layout) {
            self.bailout
                .bail(BailReason::Unsupported("stack-passed parameters".into()));
        }
        if !self.bailout.bailed() {
            let nparams = u32::try_from(self.func.ty.params.len()).unwrap();
            for idx in nparams..self.frame.layout.num_locals {
                self.masm.emit_zero_local(&self.frame.layout, idx);
            }
        }

        let func = self.func;
        for op in &func.body {
            self.codegen_op(op)?;
        }
        // Falling off the end of the body returns the value on top of the
        // operand stack, if the signature has one.
        if !self.bailout.bailed() && !self.returned {
            self.emit_return();
        }

        if let Some(r) = self.bailout.0.take() {
            return Err(r.into());
        }

        // Now that the whole function has been scanned the spill area's size
        // is final: resolve the prologue placeholder.
        let bytes = self
            .frame
            .frame_bytes(M::frame_alloc_imm_limit())
            .map_err(CompileError::LimitExceeded)?;
        self.masm.patch_frame_setup(patch, bytes);
        self.frame.layout.total_bytes = bytes;

        let (buf, relocs, traps) = self.masm.finalize()?;
        Ok(CompiledCode::new(
            buf,
            self.frame.layout,
            relocs,
            traps,
            self.live_maps,
        ))
    }

    fn codegen_op(&mut self, op: &Op) -> Result<(), CompileError> {
        if self.bailout.bailed() {
            return Ok(());
        }
        if self.returned {
            // The decoder normally strips dead code; if some reaches us,
            // fall back rather than guess at stack-polymorphic typing.
            self.bailout
                .bail(BailReason::Unsupported("code after a terminator".into()));
            return Ok(());
        }
        match *op {
            Op::I32Const(v) => self.push(
                ValueKind::I32,
                Location::Const {
                    bits: u64::from(v as u32),
                },
            ),
            Op::I64Const(v) => self.push(ValueKind::I64, Location::Const { bits: v as u64 }),
            Op::F32Const(v) => self.push(
                ValueKind::F32,
                Location::Const {
                    bits: u64::from(v.to_bits()),
                },
            ),
            Op::F64Const(v) => self.push(ValueKind::F64, Location::Const { bits: v.to_bits() }),

            Op::LocalGet(i) => self.local_get(i),
            Op::LocalSet(i) => self.local_set(i),
            Op::Drop => self.drop_one(),

            Op::I32Add => self.int_binop(ValueKind::I32, IntBinOp::Add),
            Op::I32Sub => self.int_binop(ValueKind::I32, IntBinOp::Sub),
            Op::I32Mul => self.int_binop(ValueKind::I32, IntBinOp::Mul),
            Op::I32And => self.int_binop(ValueKind::I32, IntBinOp::And),
            Op::I32Or => self.int_binop(ValueKind::I32, IntBinOp::Or),
            Op::I32Xor => self.int_binop(ValueKind::I32, IntBinOp::Xor),
            Op::I32Shl => self.int_binop(ValueKind::I32, IntBinOp::Shl),
            Op::I32ShrS => self.int_binop(ValueKind::I32, IntBinOp::ShrS),
            Op::I32ShrU => self.int_binop(ValueKind::I32, IntBinOp::ShrU),
            Op::I64Add => self.int_binop(ValueKind::I64, IntBinOp::Add),
            Op::I64Sub => self.int_binop(ValueKind::I64, IntBinOp::Sub),
            Op::I64Mul => self.int_binop(ValueKind::I64, IntBinOp::Mul),
            Op::I64And => self.int_binop(ValueKind::I64, IntBinOp::And),
            Op::I64Or => self.int_binop(ValueKind::I64, IntBinOp::Or),
            Op::I64Xor => self.int_binop(ValueKind::I64, IntBinOp::Xor),
            Op::I64Shl => self.int_binop(ValueKind::I64, IntBinOp::Shl),
            Op::I64ShrS => self.int_binop(ValueKind::I64, IntBinOp::ShrS),
            Op::I64ShrU => self.int_binop(ValueKind::I64, IntBinOp::ShrU),

            Op::F32Add => self.float_binop(ValueKind::F32, FloatBinOp::Add),
            Op::F32Sub => self.float_binop(ValueKind::F32, FloatBinOp::Sub),
            Op::F32Mul => self.float_binop(ValueKind::F32, FloatBinOp::Mul),
            Op::F32Div => self.float_binop(ValueKind::F32, FloatBinOp::Div),
            Op::F32Min => self.float_binop(ValueKind::F32, FloatBinOp::Min),
            Op::F32Max => self.float_binop(ValueKind::F32, FloatBinOp::Max),
            Op::F64Add => self.float_binop(ValueKind::F64, FloatBinOp::Add),
            Op::F64Sub => self.float_binop(ValueKind::F64, FloatBinOp::Sub),
            Op::F64Mul => self.float_binop(ValueKind::F64, FloatBinOp::Mul),
            Op::F64Div => self.float_binop(ValueKind::F64, FloatBinOp::Div),
            Op::F64Min => self.float_binop(ValueKind::F64, FloatBinOp::Min),
            Op::F64Max => self.float_binop(ValueKind::F64, FloatBinOp::Max),

            Op::F32Abs => self.float_unop(ValueKind::F32, FloatUnOp::Abs),
            Op::F32Neg => self.float_unop(ValueKind::F32, FloatUnOp::Neg),
            Op::F32Sqrt => self.float_unop(ValueKind::F32, FloatUnOp::Sqrt),
            Op::F32Ceil => self.float_unop(ValueKind::F32, FloatUnOp::Ceil),
            Op::F32Floor => self.float_unop(ValueKind::F32, FloatUnOp::Floor),
            Op::F32Trunc => self.float_unop(ValueKind::F32, FloatUnOp::Trunc),
            Op::F32Nearest => self.float_unop(ValueKind::F32, FloatUnOp::Nearest),
            Op::F64Abs => self.float_unop(ValueKind::F64, FloatUnOp::Abs),
            Op::F64Neg => self.float_unop(ValueKind::F64, FloatUnOp::Neg),
            Op::F64Sqrt => self.float_unop(ValueKind::F64, FloatUnOp::Sqrt),
            Op::F64Ceil => self.float_unop(ValueKind::F64, FloatUnOp::Ceil),
            Op::F64Floor => self.float_unop(ValueKind::F64, FloatUnOp::Floor),
            Op::F64Trunc => self.float_unop(ValueKind::F64, FloatUnOp::Trunc),
            Op::F64Nearest => self.float_unop(ValueKind::F64, FloatUnOp::Nearest),

            Op::I32Eqz => self.int_eqz(ValueKind::I32),
            Op::I64Eqz => self.int_eqz(ValueKind::I64),
            Op::I32Eq => self.int_cmp(ValueKind::I32, IntCond::Eq),
            Op::I32Ne => self.int_cmp(ValueKind::I32, IntCond::Ne),
            Op::I32LtS => self.int_cmp(ValueKind::I32, IntCond::LtS),
            Op::I32LtU => self.int_cmp(ValueKind::I32, IntCond::LtU),
            Op::I32GtS => self.int_cmp(ValueKind::I32, IntCond::GtS),
            Op::I32GtU => self.int_cmp(ValueKind::I32, IntCond::GtU),
            Op::I32LeS => self.int_cmp(ValueKind::I32, IntCond::LeS),
            Op::I32LeU => self.int_cmp(ValueKind::I32, IntCond::LeU),
            Op::I32GeS => self.int_cmp(ValueKind::I32, IntCond::GeS),
            Op::I32GeU => self.int_cmp(ValueKind::I32, IntCond::GeU),
            Op::I64Eq => self.int_cmp(ValueKind::I64, IntCond::Eq),
            Op::I64Ne => self.int_cmp(ValueKind::I64, IntCond::Ne),
            Op::I64LtS => self.int_cmp(ValueKind::I64, IntCond::LtS),
            Op::I64LtU => self.int_cmp(ValueKind::I64, IntCond::LtU),
            Op::I64GtS => self.int_cmp(ValueKind::I64, IntCond::GtS),
            Op::I64GtU => self.int_cmp(ValueKind::I64, IntCond::GtU),
            Op::I64LeS => self.int_cmp(ValueKind::I64, IntCond::LeS),
            Op::I64LeU => self.int_cmp(ValueKind::I64, IntCond::LeU),
            Op::I64GeS => self.int_cmp(ValueKind::I64, IntCond::GeS),
            Op::I64GeU => self.int_cmp(ValueKind::I64, IntCond::GeU),

            Op::F32Eq => self.float_cmp(ValueKind::F32, FloatCond::Eq),
            Op::F32Ne => self.float_cmp(ValueKind::F32, FloatCond::Ne),
            Op::F32Lt => self.float_cmp(ValueKind::F32, FloatCond::Lt),
            Op::F32Gt => self.float_cmp(ValueKind::F32, FloatCond::Gt),
            Op::F32Le => self.float_cmp(ValueKind::F32, FloatCond::Le),
            Op::F32Ge => self.float_cmp(ValueKind::F32, FloatCond::Ge),
            Op::F64Eq => self.float_cmp(ValueKind::F64, FloatCond::Eq),
            Op::F64Ne => self.float_cmp(ValueKind::F64, FloatCond::Ne),
            Op::F64Lt => self.float_cmp(ValueKind::F64, FloatCond::Lt),
            Op::F64Gt => self.float_cmp(ValueKind::F64, FloatCond::Gt),
            Op::F64Le => self.float_cmp(ValueKind::F64, FloatCond::Le),
            Op::F64Ge => self.float_cmp(ValueKind::F64, FloatCond::Ge),

            Op::I32WrapI64 => self.conv(ValueKind::I64, ValueKind::I32, Conv::I32WrapI64),
            Op::I64ExtendI32S => self.conv(ValueKind::I32, ValueKind::I64, Conv::I64ExtendI32S),
            Op::I64ExtendI32U => self.conv(ValueKind::I32, ValueKind::I64, Conv::I64ExtendI32U),
            Op::F32DemoteF64 => self.conv(ValueKind::F64, ValueKind::F32, Conv::F32DemoteF64),
            Op::F64PromoteF32 => self.conv(ValueKind::F32, ValueKind::F64, Conv::F64PromoteF32),
            Op::F32ConvertI32S => self.conv(ValueKind::I32, ValueKind::F32, Conv::F32ConvertI32S),
            Op::F32ConvertI64S => self.conv(ValueKind::I64, ValueKind::F32, Conv::F32ConvertI64S),
            Op::F64ConvertI32S => self.conv(ValueKind::I32, ValueKind::F64, Conv::F64ConvertI32S),
            Op::F64ConvertI64S => self.conv(ValueKind::I64, ValueKind::F64, Conv::F64ConvertI64S),
            Op::F32ConvertI32U => self.conv(ValueKind::I32, ValueKind::F32, Conv::F32ConvertI32U),
            Op::F32ConvertI64U => self.conv(ValueKind::I64, ValueKind::F32, Conv::F32ConvertI64U),
            Op::F64ConvertI32U => self.conv(ValueKind::I32, ValueKind::F64, Conv::F64ConvertI32U),
            Op::F64ConvertI64U => self.conv(ValueKind::I64, ValueKind::F64, Conv::F64ConvertI64U),
            Op::I32TruncF32S => self.conv(ValueKind::F32, ValueKind::I32, Conv::I32TruncF32S),
            Op::I32TruncF64S => self.conv(ValueKind::F64, ValueKind::I32, Conv::I32TruncF64S),
            Op::I64TruncF32S => self.conv(ValueKind::F32, ValueKind::I64, Conv::I64TruncF32S),
            Op::I64TruncF64S => self.conv(ValueKind::F64, ValueKind::I64, Conv::I64TruncF64S),

            Op::I32Load { off } => self.load(ValueKind::I32, MemWidth::B4, false, off),
            Op::I64Load { off } => self.load(ValueKind::I64, MemWidth::B8, false, off),
            Op::F32Load { off } => self.load(ValueKind::F32, MemWidth::B4, false, off),
            Op::F64Load { off } => self.load(ValueKind::F64, MemWidth::B8, false, off),
            Op::I32Load8S { off } => self.load(ValueKind::I32, MemWidth::B1, true, off),
            Op::I32Load8U { off } => self.load(ValueKind::I32, MemWidth::B1, false, off),
            Op::I32Load16S { off } => self.load(ValueKind::I32, MemWidth::B2, true, off),
            Op::I32Load16U { off } => self.load(ValueKind::I32, MemWidth::B2, false, off),
            Op::I64Load8S { off } => self.load(ValueKind::I64, MemWidth::B1, true, off),
            Op::I64Load8U { off } => self.load(ValueKind::I64, MemWidth::B1, false, off),
            Op::I64Load16S { off } => self.load(ValueKind::I64, MemWidth::B2, true, off),
            Op::I64Load16U { off } => self.load(ValueKind::I64, MemWidth::B2, false, off),
            Op::I64Load32S { off } => self.load(ValueKind::I64, MemWidth::B4, true, off),
            Op::I64Load32U { off } => self.load(ValueKind::I64, MemWidth::B4, false, off),

            Op::I32Store { off } => self.store(ValueKind::I32, MemWidth::B4, off),
            Op::I64Store { off } => self.store(ValueKind::I64, MemWidth::B8, off),
            Op::F32Store { off } => self.store(ValueKind::F32, MemWidth::B4, off),
            Op::F64Store { off } => self.store(ValueKind::F64, MemWidth::B8, off),
            Op::I32Store8 { off } => self.store(ValueKind::I32, MemWidth::B1, off),
            Op::I32Store16 { off } => self.store(ValueKind::I32, MemWidth::B2, off),
            Op::I64Store8 { off } => self.store(ValueKind::I64, MemWidth::B1, off),
            Op::I64Store16 { off } => self.store(ValueKind::I64, MemWidth::B2, off),
            Op::I64Store32 { off } => self.store(ValueKind::I64, MemWidth::B4, off),

            Op::Call(_) | Op::CallImport(_) | Op::CallIndirect(_) => self.call(op)?,

            Op::Return => self.emit_return(),
            Op::Unreachable => {
                self.masm.emit_unreachable();
                self.returned = true;
            }
        }
        if !self.bailout.bailed() {
            self.record_live_map();
        }
        Ok(())
    }

    /// Record which operand-stack slots are live, and where, at the current
    /// code offset. External stack walkers consume these.
    fn record_live_map(&mut self) {
        self.live_maps.push(LiveMap {
            off: self.masm.code_off(),
            slots: self
                .stack
                .iter()
                .map(|os| LiveSlot {
                    kind: os.kind,
                    loc: os.loc,
                })
                .collect(),
        });
    }

    fn push(&mut self, kind: ValueKind, loc: Location) {
        self.stack.push(OperandState::new(kind, loc));
    }

    fn pop(&mut self) -> OperandState {
        self.stack.pop().expect("operand stack underflow")
    }

    fn acquire(&mut self, class: RegClass, exclude: RegSet) -> u8 {
        self.ra
            .acquire(&mut self.masm, &mut self.stack, &mut self.frame, class, exclude)
    }

    /// Bring a popped operand into some register of its class.
    fn materialize(&mut self, os: OperandState, exclude: RegSet) -> u8 {
        let class = os.kind.reg_class();
        match os.loc {
            Location::Reg { code, .. } => {
                self.ra.touch(class, code);
                code
            }
            Location::Slot(idx) => {
                let code = self.acquire(class, exclude);
                self.masm
                    .emit_fill(os.kind, code, self.frame.layout.slot_off(idx));
                self.frame.free_slot(idx);
                code
            }
            Location::Const { bits } => {
                let code = self.acquire(class, exclude);
                self.masm.emit_const_to_reg(os.kind, code, bits);
                code
            }
        }
    }

    /// Bring a popped operand into one specific register, evicting whatever
    /// holds it.
    fn materialize_fixed(&mut self, os: OperandState, code: u8) {
        let class = os.kind.reg_class();
        if matches!(os.loc, Location::Reg { code: cur, .. } if cur == code) {
            self.ra.touch(class, code);
            return;
        }
        self.ra
            .acquire_fixed(&mut self.masm, &mut self.stack, &mut self.frame, class, code);
        match os.loc {
            Location::Reg { code: cur, .. } => {
                self.masm.emit_mov_rr(os.kind, code, cur);
                self.ra.release(class, cur);
            }
            Location::Slot(idx) => {
                self.masm
                    .emit_fill(os.kind, code, self.frame.layout.slot_off(idx));
                self.frame.free_slot(idx);
            }
            Location::Const { bits } => self.masm.emit_const_to_reg(os.kind, code, bits),
        }
    }

    fn release_loc(&mut self, loc: Location) {
        match loc {
            Location::Reg { code, class } => self.ra.release(class, code),
            Location::Slot(idx) => self.frame.free_slot(idx),
            Location::Const { .. } => (),
        }
    }

    fn local_get(&mut self, idx: u32) {
        let kind = self.func.local_kind(idx);
        let class = kind.reg_class();
        let code = self.acquire(class, RegSet::empty());
        self.masm
            .emit_fill(kind, code, self.frame.layout.local_off(idx));
        self.push(kind, Location::Reg { code, class });
    }

    fn local_set(&mut self, idx: u32) {
        let kind = self.func.local_kind(idx);
        let os = self.pop();
        debug_assert_eq!(os.kind, kind);
        let off = self.frame.layout.local_off(idx);
        match os.loc {
            Location::Const { bits } => self.masm.emit_store_imm_slot(kind, off, bits),
            Location::Reg { code, class } => {
                self.masm.emit_spill(kind, off, code);
                self.ra.release(class, code);
            }
            Location::Slot(_) => {
                let code = self.materialize(os, RegSet::empty());
                self.masm.emit_spill(kind, off, code);
                self.ra.release(kind.reg_class(), code);
            }
        }
    }

    fn drop_one(&mut self) {
        let os = self.pop();
        self.release_loc(os.loc);
    }

    fn int_binop(&mut self, kind: ValueKind, op: IntBinOp) {
        let rhs = self.pop();
        let mut lhs = self.pop();
        let class = kind.reg_class();
        let rhs_reg = match (op.is_shift(), M::shift_count_reg()) {
            (true, Some(cl)) => {
                // The left operand must vacate the count register first: it
                // has been popped, so the allocator cannot spill it out of
                // the way itself.
                if matches!(lhs.loc, Location::Reg { code, .. } if code == cl) {
                    let new = self.acquire(class, RegSet::from_codes(&[cl]));
                    self.masm.emit_mov_rr(kind, new, cl);
                    self.ra.release(class, cl);
                    lhs = OperandState::new(kind, Location::Reg { code: new, class });
                }
                self.materialize_fixed(rhs, cl);
                cl
            }
            _ => self.materialize(rhs, RegSet::empty()),
        };
        self.ra.pin(class, rhs_reg);
        let lhs_reg = self.materialize(lhs, RegSet::empty());
        self.masm.emit_int_binop(kind, op, lhs_reg, rhs_reg);
        self.ra.unpin(class, rhs_reg);
        self.ra.release(class, rhs_reg);
        self.push(kind, Location::Reg { code: lhs_reg, class });
    }

    fn float_binop(&mut self, kind: ValueKind, op: FloatBinOp) {
        let rhs = self.pop();
        let lhs = self.pop();
        let class = kind.reg_class();
        let rhs_reg = self.materialize(rhs, RegSet::empty());
        self.ra.pin(class, rhs_reg);
        let lhs_reg = self.materialize(lhs, RegSet::empty());
        self.masm.emit_float_binop(kind, op, lhs_reg, rhs_reg);
        self.ra.unpin(class, rhs_reg);
        self.ra.release(class, rhs_reg);
        self.push(kind, Location::Reg { code: lhs_reg, class });
    }

    fn float_unop(&mut self, kind: ValueKind, op: FloatUnOp) {
        let os = self.pop();
        let code = self.materialize(os, RegSet::empty());
        self.masm.emit_float_unop(kind, op, code);
        self.push(
            kind,
            Location::Reg {
                code,
                class: kind.reg_class(),
            },
        );
    }

    fn int_cmp(&mut self, kind: ValueKind, cond: IntCond) {
        let rhs = self.pop();
        let lhs = self.pop();
        let class = kind.reg_class();
        let rhs_reg = self.materialize(rhs, RegSet::empty());
        self.ra.pin(class, rhs_reg);
        let lhs_reg = self.materialize(lhs, RegSet::empty());
        self.masm.emit_int_cmp(kind, cond, lhs_reg, lhs_reg, rhs_reg);
        self.ra.unpin(class, rhs_reg);
        self.ra.release(class, rhs_reg);
        self.push(
            ValueKind::I32,
            Location::Reg {
                code: lhs_reg,
                class,
            },
        );
    }

    fn int_eqz(&mut self, kind: ValueKind) {
        let os = self.pop();
        let code = self.materialize(os, RegSet::empty());
        self.masm.emit_int_eqz(kind, code, code);
        self.push(
            ValueKind::I32,
            Location::Reg {
                code,
                class: RegClass::Gp,
            },
        );
    }

    fn float_cmp(&mut self, kind: ValueKind, cond: FloatCond) {
        let rhs = self.pop();
        let lhs = self.pop();
        let fclass = kind.reg_class();
        let rhs_reg = self.materialize(rhs, RegSet::empty());
        self.ra.pin(fclass, rhs_reg);
        let lhs_reg = self.materialize(lhs, RegSet::empty());
        self.ra.pin(fclass, lhs_reg);
        let dst = self.acquire(RegClass::Gp, RegSet::empty());
        self.masm.emit_float_cmp(kind, cond, dst, lhs_reg, rhs_reg);
        self.ra.unpin(fclass, lhs_reg);
        self.ra.unpin(fclass, rhs_reg);
        self.ra.release(fclass, lhs_reg);
        self.ra.release(fclass, rhs_reg);
        self.push(
            ValueKind::I32,
            Location::Reg {
                code: dst,
                class: RegClass::Gp,
            },
        );
    }

    fn conv(&mut self, from: ValueKind, to: ValueKind, conv: Conv) {
        let os = self.pop();
        debug_assert_eq!(os.kind, from);
        let src = self.materialize(os, RegSet::empty());
        let (fclass, tclass) = (from.reg_class(), to.reg_class());
        let dst = if fclass == tclass {
            src
        } else {
            self.ra.pin(fclass, src);
            let d = self.acquire(tclass, RegSet::empty());
            self.ra.unpin(fclass, src);
            d
        };
        if !self.masm.emit_conv(conv, dst, src) {
            self.bailout.bail(BailReason::Unsupported(format!(
                "{conv:?} not implemented by this backend"
            )));
            return;
        }
        if fclass != tclass {
            self.ra.release(fclass, src);
        }
        self.push(
            to,
            Location::Reg {
                code: dst,
                class: tclass,
            },
        );
    }

    fn load(&mut self, kind: ValueKind, width: MemWidth, signed: bool, off: u64) {
        let addr = self.pop();
        debug_assert_eq!(addr.kind, ValueKind::I64);
        let base = self.materialize(addr, RegSet::empty());
        let dst = match kind.reg_class() {
            // The loaded value can overwrite the address register.
            RegClass::Gp => base,
            RegClass::Fp => {
                self.ra.pin(RegClass::Gp, base);
                let d = self.acquire(RegClass::Fp, RegSet::empty());
                self.ra.unpin(RegClass::Gp, base);
                d
            }
        };
        self.masm.emit_load(kind, width, signed, dst, base, None, off);
        if kind.reg_class() == RegClass::Fp {
            self.ra.release(RegClass::Gp, base);
        }
        self.push(
            kind,
            Location::Reg {
                code: dst,
                class: kind.reg_class(),
            },
        );
    }

    fn store(&mut self, kind: ValueKind, width: MemWidth, off: u64) {
        let val = self.pop();
        let addr = self.pop();
        debug_assert_eq!(val.kind, kind);
        debug_assert_eq!(addr.kind, ValueKind::I64);
        let vclass = kind.reg_class();
        let val_reg = self.materialize(val, RegSet::empty());
        self.ra.pin(vclass, val_reg);
        let base = self.materialize(addr, RegSet::empty());
        self.masm.emit_store(kind, width, val_reg, base, None, off);
        self.ra.unpin(vclass, val_reg);
        self.ra.release(vclass, val_reg);
        self.ra.release(RegClass::Gp, base);
    }

    fn call(&mut self, op: &Op) -> Result<(), CompileError> {
        let (fty, pass_instance): (FuncType, bool) = match *op {
            Op::Call(fidx) => (
                self.env
                    .funcs
                    .get(usize::try_from(fidx.0).unwrap())
                    .ok_or_else(|| {
                        CompileError::Internal(format!("call to unknown function {}", fidx.0))
                    })?
                    .clone(),
                true,
            ),
            Op::CallImport(i) => (
                self.env
                    .imports
                    .get(usize::try_from(i).unwrap())
                    .ok_or_else(|| {
                        CompileError::Internal(format!("call to unknown import {i}"))
                    })?
                    .ty
                    .clone(),
                false,
            ),
            Op::CallIndirect(ti) => (
                self.env
                    .types
                    .get(usize::try_from(ti).unwrap())
                    .ok_or_else(|| {
                        CompileError::Internal(format!("indirect call with unknown type {ti}"))
                    })?
                    .clone(),
                true,
            ),
            _ => unreachable!(),
        };

        // Every allocatable register is caller-saved, so anything
        // register-resident must survive the call in a slot.
        self.ra
            .sync_all(&mut self.masm, &mut self.stack, &mut self.frame);

        // Slots that die with the call (arguments and the table index).
        let mut dead_slots: Vec<SlotIdx> = Vec::new();

        let target = match *op {
            Op::Call(fidx) => CallTarget::Native(fidx),
            Op::CallImport(i) => {
                CallTarget::Import(self.env.imports[usize::try_from(i).unwrap()].addr)
            }
            Op::CallIndirect(_) => {
                let Some(table) = self.env.table else {
                    self.bailout
                        .bail(BailReason::Unsupported("indirect call without a table".into()));
                    return Ok(());
                };
                let os = self.pop();
                debug_assert_eq!(os.kind, ValueKind::I32);
                let (index, slot) = self.arg_src(os);
                dead_slots.extend(slot);
                CallTarget::Indirect { table, index }
            }
            _ => unreachable!(),
        };

        let mut args = Vec::with_capacity(fty.params.len());
        for kind in fty.params.iter().rev() {
            let os = self.pop();
            debug_assert_eq!(os.kind, *kind);
            let (src, slot) = self.arg_src(os);
            args.push(src);
            dead_slots.extend(slot);
        }
        args.reverse();

        if !self
            .masm
            .emit_call(&target, &args, pass_instance, &self.frame.layout)
        {
            self.bailout.bail(BailReason::Unsupported(
                "call needs stack-passed arguments".into(),
            ));
            return Ok(());
        }

        for s in dead_slots {
            self.frame.free_slot(s);
        }

        if let Some(kind) = fty.result {
            let class = kind.reg_class();
            let code = match class {
                RegClass::Gp => M::retval_gp(),
                RegClass::Fp => M::retval_fp(),
            };
            // All operands were just synced, so the result register is free.
            debug_assert!(self.ra.is_free(class, code));
            self.ra
                .acquire_fixed(&mut self.masm, &mut self.stack, &mut self.frame, class, code);
            self.push(kind, Location::Reg { code, class });
        }
        Ok(())
    }

    /// Convert a (synced) operand into a call-argument source.
    fn arg_src(&mut self, os: OperandState) -> (ArgSrc, Option<SlotIdx>) {
        match os.loc {
            Location::Slot(idx) => (
                ArgSrc::Slot {
                    kind: os.kind,
                    off: self.frame.layout.slot_off(idx),
                },
                Some(idx),
            ),
            Location::Const { bits } => (
                ArgSrc::Const {
                    kind: os.kind,
                    bits,
                },
                None,
            ),
            Location::Reg { .. } => unreachable!("operand not synced before call"),
        }
    }

    fn emit_return(&mut self) {
        if let Some(kind) = self.func.ty.result {
            let os = self.pop();
            debug_assert_eq!(os.kind, kind);
            let class = kind.reg_class();
            let code = match class {
                RegClass::Gp => M::retval_gp(),
                RegClass::Fp => M::retval_fp(),
            };
            match os.loc {
                Location::Reg { code: cur, .. } => {
                    if cur != code {
                        self.masm.emit_mov_rr(kind, code, cur);
                    }
                    self.ra.release(class, cur);
                }
                Location::Slot(idx) => {
                    self.masm
                        .emit_fill(kind, code, self.frame.layout.slot_off(idx));
                    self.frame.free_slot(idx);
                }
                Location::Const { bits } => self.masm.emit_const_to_reg(kind, code, bits),
            }
        }
        debug_assert!(self.stack.is_empty(), "values left on the operand stack");
        self.masm.emit_ret();
        self.returned = true;
    }
}

#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::{
        bytecode::{FuncIdx, Import, Table},
        compile::{compile, CompiledCode, TrapKind},
    };
    use std::sync::atomic::AtomicUsize;

    fn func(
        params: Vec<ValueKind>,
        result: Option<ValueKind>,
        locals: Vec<ValueKind>,
        body: Vec<Op>,
    ) -> Function {
        Function {
            ty: FuncType { params, result },
            locals,
            body,
        }
    }

    fn compile_ok(env: &ModuleEnv, f: &Function) -> CompiledCode {
        compile(env, f).unwrap()
    }

    unsafe fn run0(cc: &CompiledCode) -> u64 {
        let f: unsafe extern "C" fn(*mut u8) -> u64 = std::mem::transmute(cc.entry());
        f(std::ptr::null_mut())
    }

    unsafe fn run_ii(cc: &CompiledCode, a: i32, b: i32) -> u64 {
        let f: unsafe extern "C" fn(*mut u8, i32, i32) -> u64 = std::mem::transmute(cc.entry());
        f(std::ptr::null_mut(), a, b)
    }

    unsafe fn run_ll(cc: &CompiledCode, a: i64, b: i64) -> u64 {
        let f: unsafe extern "C" fn(*mut u8, i64, i64) -> u64 = std::mem::transmute(cc.entry());
        f(std::ptr::null_mut(), a, b)
    }

    unsafe fn run_l(cc: &CompiledCode, a: i64) -> u64 {
        let f: unsafe extern "C" fn(*mut u8, i64) -> u64 = std::mem::transmute(cc.entry());
        f(std::ptr::null_mut(), a)
    }

    unsafe fn run_d(cc: &CompiledCode, a: f64) -> f64 {
        let f: unsafe extern "C" fn(*mut u8, f64) -> f64 = std::mem::transmute(cc.entry());
        f(std::ptr::null_mut(), a)
    }

    unsafe fn run_dd_to_u64(cc: &CompiledCode, a: f64, b: f64) -> u64 {
        let f: unsafe extern "C" fn(*mut u8, f64, f64) -> u64 = std::mem::transmute(cc.entry());
        f(std::ptr::null_mut(), a, b)
    }

    #[test]
    fn i32_add_overflow_wraps() {
        let env = ModuleEnv::default();
        let f = func(
            vec![],
            Some(ValueKind::I32),
            vec![],
            vec![Op::I32Const(i32::MAX), Op::I32Const(1), Op::I32Add],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run0(&cc) } as u32, i32::MIN as u32);
    }

    #[test]
    fn i32_arith_matches_host_on_boundary_values() {
        let env = ModuleEnv::default();
        let cases: Vec<(Op, fn(i32, i32) -> i32)> = vec![
            (Op::I32Add, |a, b| a.wrapping_add(b)),
            (Op::I32Sub, |a, b| a.wrapping_sub(b)),
            (Op::I32Mul, |a, b| a.wrapping_mul(b)),
            (Op::I32And, |a, b| a & b),
            (Op::I32Or, |a, b| a | b),
            (Op::I32Xor, |a, b| a ^ b),
            (Op::I32Shl, |a, b| a.wrapping_shl(b as u32)),
            (Op::I32ShrS, |a, b| a.wrapping_shr(b as u32)),
            (Op::I32ShrU, |a, b| ((a as u32).wrapping_shr(b as u32)) as i32),
        ];
        let vals = [0i32, 1, -1, 7, -13, i32::MAX, i32::MIN];
        for (op, expect) in cases {
            let f = func(
                vec![ValueKind::I32, ValueKind::I32],
                Some(ValueKind::I32),
                vec![],
                vec![Op::LocalGet(0), Op::LocalGet(1), op],
            );
            let cc = compile_ok(&env, &f);
            for a in vals {
                for b in vals {
                    let got = unsafe { run_ii(&cc, a, b) } as u32 as i32;
                    assert_eq!(got, expect(a, b), "{op:?} {a} {b}");
                }
            }
        }
    }

    #[test]
    fn i64_arith_matches_host_on_boundary_values() {
        let env = ModuleEnv::default();
        let cases: Vec<(Op, fn(i64, i64) -> i64)> = vec![
            (Op::I64Add, |a, b| a.wrapping_add(b)),
            (Op::I64Mul, |a, b| a.wrapping_mul(b)),
            (Op::I64Shl, |a, b| a.wrapping_shl(b as u32)),
            (Op::I64ShrU, |a, b| ((a as u64).wrapping_shr(b as u32)) as i64),
        ];
        let vals = [0i64, 1, -1, 42, i64::MAX, i64::MIN];
        for (op, expect) in cases {
            let f = func(
                vec![ValueKind::I64, ValueKind::I64],
                Some(ValueKind::I64),
                vec![],
                vec![Op::LocalGet(0), Op::LocalGet(1), op],
            );
            let cc = compile_ok(&env, &f);
            for a in vals {
                for b in vals {
                    let got = unsafe { run_ll(&cc, a, b) } as i64;
                    assert_eq!(got, expect(a, b), "{op:?} {a} {b}");
                }
            }
        }
    }

    #[test]
    fn i32_comparisons_match_host() {
        let env = ModuleEnv::default();
        let cases: Vec<(Op, fn(i32, i32) -> bool)> = vec![
            (Op::I32Eq, |a, b| a == b),
            (Op::I32Ne, |a, b| a != b),
            (Op::I32LtS, |a, b| a < b),
            (Op::I32LtU, |a, b| (a as u32) < (b as u32)),
            (Op::I32GtU, |a, b| (a as u32) > (b as u32)),
            (Op::I32LeS, |a, b| a <= b),
            (Op::I32GeU, |a, b| (a as u32) >= (b as u32)),
        ];
        let vals = [0i32, 1, -1, i32::MAX, i32::MIN];
        for (op, expect) in cases {
            let f = func(
                vec![ValueKind::I32, ValueKind::I32],
                Some(ValueKind::I32),
                vec![],
                vec![Op::LocalGet(0), Op::LocalGet(1), op],
            );
            let cc = compile_ok(&env, &f);
            for a in vals {
                for b in vals {
                    let got = unsafe { run_ii(&cc, a, b) };
                    assert_eq!(got, u64::from(expect(a, b)), "{op:?} {a} {b}");
                }
            }
        }
    }

    #[test]
    fn deep_operand_stack_spills_and_refills() {
        let env = ModuleEnv::default();
        let mut body = vec![Op::LocalGet(0); 12];
        body.extend(vec![Op::I64Add; 11]);
        let f = func(vec![ValueKind::I64], Some(ValueKind::I64), vec![], body);
        let cc = compile_ok(&env, &f);
        // With only eight allocatable GP registers, twelve live values must
        // have hit the spill area.
        assert!(cc.frame().slot_count > 0);
        assert_eq!(unsafe { run_l(&cc, 5) } as i64, 60);
        assert_eq!(unsafe { run_l(&cc, -3) } as i64, -36);
    }

    #[test]
    fn deep_float_stack_spills_and_refills() {
        let env = ModuleEnv::default();
        let mut body = vec![Op::LocalGet(0); 17];
        body.extend(vec![Op::F64Add; 16]);
        let f = func(vec![ValueKind::F64], Some(ValueKind::F64), vec![], body);
        let cc = compile_ok(&env, &f);
        assert!(cc.frame().slot_count > 0);
        assert_eq!(unsafe { run_d(&cc, 1.5) }, 25.5);
    }

    #[test]
    fn float_ops_and_conversions() {
        let env = ModuleEnv::default();
        let f = func(
            vec![ValueKind::F64],
            Some(ValueKind::F64),
            vec![],
            vec![Op::LocalGet(0), Op::F64Sqrt],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run_d(&cc, 2.25) }, 1.5);

        let f = func(
            vec![ValueKind::F64],
            Some(ValueKind::F64),
            vec![],
            vec![Op::LocalGet(0), Op::F64Neg, Op::F64Abs],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run_d(&cc, -3.5) }, 3.5);

        let f = func(
            vec![ValueKind::F64],
            Some(ValueKind::F64),
            vec![],
            vec![Op::LocalGet(0), Op::F64Floor],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run_d(&cc, 2.75) }, 2.0);
        assert_eq!(unsafe { run_d(&cc, -2.25) }, -3.0);

        // i32 -> f64, signed and unsigned.
        let f = func(
            vec![ValueKind::I32, ValueKind::I32],
            Some(ValueKind::F64),
            vec![],
            vec![Op::LocalGet(0), Op::F64ConvertI32S],
        );
        let cc = compile_ok(&env, &f);
        let g: unsafe extern "C" fn(*mut u8, i32, i32) -> f64 =
            unsafe { std::mem::transmute(cc.entry()) };
        assert_eq!(unsafe { g(std::ptr::null_mut(), -7, 0) }, -7.0);

        let f = func(
            vec![ValueKind::I32, ValueKind::I32],
            Some(ValueKind::F64),
            vec![],
            vec![Op::LocalGet(0), Op::F64ConvertI32U],
        );
        let cc = compile_ok(&env, &f);
        let g: unsafe extern "C" fn(*mut u8, i32, i32) -> f64 =
            unsafe { std::mem::transmute(cc.entry()) };
        assert_eq!(unsafe { g(std::ptr::null_mut(), -1, 0) }, 4294967295.0);
    }

    #[test]
    fn float_compare_is_false_on_nan() {
        let env = ModuleEnv::default();
        for (op, a, b, expect) in [
            (Op::F64Eq, f64::NAN, f64::NAN, 0u64),
            (Op::F64Ne, f64::NAN, f64::NAN, 1),
            (Op::F64Lt, f64::NAN, 1.0, 0),
            (Op::F64Gt, f64::NAN, 1.0, 0),
            (Op::F64Le, 1.0, 1.0, 1),
            (Op::F64Lt, 1.0, 2.0, 1),
            (Op::F64Ge, 2.0, 1.0, 1),
            (Op::F64Eq, 1.0, 1.0, 1),
        ] {
            let f = func(
                vec![ValueKind::F64, ValueKind::F64],
                Some(ValueKind::I32),
                vec![],
                vec![Op::LocalGet(0), Op::LocalGet(1), op],
            );
            let cc = compile_ok(&env, &f);
            assert_eq!(unsafe { run_dd_to_u64(&cc, a, b) }, expect, "{op:?} {a} {b}");
        }
    }

    #[test]
    fn int_conversions() {
        let env = ModuleEnv::default();
        let f = func(
            vec![ValueKind::I32, ValueKind::I32],
            Some(ValueKind::I64),
            vec![],
            vec![Op::LocalGet(0), Op::I64ExtendI32S],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run_ii(&cc, -5, 0) } as i64, -5);

        let f = func(
            vec![ValueKind::I32, ValueKind::I32],
            Some(ValueKind::I64),
            vec![],
            vec![Op::LocalGet(0), Op::I64ExtendI32U],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run_ii(&cc, -1, 0) }, 0xffff_ffff);

        let f = func(
            vec![ValueKind::I64, ValueKind::I64],
            Some(ValueKind::I32),
            vec![],
            vec![Op::LocalGet(0), Op::I32WrapI64],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(
            unsafe { run_ll(&cc, 0x1_2345_6789, 0) } as u32,
            0x2345_6789
        );
    }

    #[test]
    fn extra_locals_are_zero_initialised() {
        let env = ModuleEnv::default();
        let f = func(
            vec![],
            Some(ValueKind::I64),
            vec![ValueKind::I64],
            vec![Op::LocalGet(0)],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run0(&cc) }, 0);
    }

    #[test]
    fn local_set_then_get() {
        let env = ModuleEnv::default();
        let f = func(
            vec![],
            Some(ValueKind::I32),
            vec![ValueKind::I32],
            vec![
                Op::I32Const(7),
                Op::LocalSet(0),
                Op::LocalGet(0),
                Op::LocalGet(0),
                Op::I32Mul,
            ],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run0(&cc) } as u32, 49);
    }

    #[test]
    fn explicit_return() {
        let env = ModuleEnv::default();
        let f = func(
            vec![],
            Some(ValueKind::I32),
            vec![],
            vec![Op::I32Const(3), Op::Return],
        );
        let cc = compile_ok(&env, &f);
        assert_eq!(unsafe { run0(&cc) } as u32, 3);
    }

    #[test]
    fn unsupported_conversion_bails_out() {
        let env = ModuleEnv::default();
        let f = func(
            vec![],
            Some(ValueKind::F64),
            vec![],
            vec![Op::I64Const(1), Op::F64ConvertI64U],
        );
        assert!(matches!(
            compile(&env, &f),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn bailout_suppresses_all_further_emission() {
        let env = ModuleEnv::default();
        let f = func(vec![], None, vec![], vec![]);
        let mut bc = BaselineCompiler::<x64::X64Masm>::new(&env, &f).unwrap();
        bc.bailout
            .bail(BailReason::Unsupported("forced by test".into()));
        let before = bc.masm.code_off();
        bc.codegen_op(&Op::I32Const(1)).unwrap();
        bc.codegen_op(&Op::I32Const(2)).unwrap();
        bc.codegen_op(&Op::I32Add).unwrap();
        bc.codegen_op(&Op::Unreachable).unwrap();
        assert_eq!(bc.masm.code_off(), before);
        // The first reason is the one reported.
        bc.bailout
            .bail(BailReason::LimitExceeded("second reason".into()));
        assert!(matches!(
            bc.bailout.0,
            Some(BailReason::Unsupported(ref s)) if s == "forced by test"
        ));
    }

    #[test]
    fn zero_spill_function_reserves_base_frame_only() {
        let env = ModuleEnv::default();
        let f = func(vec![], Some(ValueKind::I32), vec![], vec![Op::I32Const(3)]);
        let cc = compile_ok(&env, &f);
        assert_eq!(cc.frame().slot_count, 0);
        // The instance slot (8 bytes) aligned up to the 16-byte quantum.
        assert_eq!(cc.frame().total_bytes, 16);
        assert_eq!(unsafe { run0(&cc) } as u32, 3);
    }

    #[test]
    fn memory_load_and_store() {
        let env = ModuleEnv::default();
        let f = func(
            vec![ValueKind::I64],
            Some(ValueKind::I32),
            vec![],
            vec![Op::LocalGet(0), Op::I32Load { off: 4 }],
        );
        let cc = compile_ok(&env, &f);
        assert!(cc.traps().iter().any(|t| t.kind == TrapKind::MemAccess));
        let buf: [i32; 2] = [11, 22];
        assert_eq!(unsafe { run_l(&cc, buf.as_ptr() as i64) } as u32, 22);

        let f = func(
            vec![ValueKind::I64],
            None,
            vec![],
            vec![
                Op::LocalGet(0),
                Op::I32Const(0x3344),
                Op::I32Store16 { off: 2 },
            ],
        );
        let cc = compile_ok(&env, &f);
        let mut out: [u8; 4] = [0; 4];
        let g: unsafe extern "C" fn(*mut u8, i64) = unsafe { std::mem::transmute(cc.entry()) };
        unsafe { g(std::ptr::null_mut(), out.as_mut_ptr() as i64) };
        assert_eq!(out, [0, 0, 0x44, 0x33]);
    }

    #[test]
    fn sized_loads_extend_correctly() {
        let env = ModuleEnv::default();
        let bytes: [u8; 8] = [0x80, 0xff, 0x7f, 0x01, 0x80, 0x00, 0x00, 0x00];
        for (op, expect) in [
            (Op::I32Load8S { off: 0 }, -128i64 as u64 & 0xffff_ffff),
            (Op::I32Load8U { off: 0 }, 0x80),
            (Op::I32Load16S { off: 0 }, 0xffff_ff80),
            (Op::I32Load16U { off: 0 }, 0xff80),
        ] {
            let f = func(
                vec![ValueKind::I64],
                Some(ValueKind::I32),
                vec![],
                vec![Op::LocalGet(0), op],
            );
            let cc = compile_ok(&env, &f);
            let got = unsafe { run_l(&cc, bytes.as_ptr() as i64) } as u32;
            assert_eq!(u64::from(got), expect, "{op:?}");
        }

        let f = func(
            vec![ValueKind::I64],
            Some(ValueKind::I64),
            vec![],
            vec![Op::LocalGet(0), Op::I64Load32S { off: 4 }],
        );
        let cc = compile_ok(&env, &f);
        // Bytes 4..8 are 0x00000080 little-endian: positive.
        assert_eq!(unsafe { run_l(&cc, bytes.as_ptr() as i64) }, 0x80);
    }

    extern "C" fn import_mul_add(a: i64, b: i64, c: i64) -> i64 {
        a.wrapping_mul(b).wrapping_add(c)
    }

    #[test]
    fn call_import_end_to_end() {
        let env = ModuleEnv {
            imports: vec![Import {
                ty: FuncType {
                    params: vec![ValueKind::I64, ValueKind::I64, ValueKind::I64],
                    result: Some(ValueKind::I64),
                },
                addr: import_mul_add as usize,
            }],
            ..ModuleEnv::default()
        };
        // One register-resident argument, one constant, one more from a
        // local, so marshalling sees slots and immediates.
        let f = func(
            vec![ValueKind::I64],
            Some(ValueKind::I64),
            vec![],
            vec![
                Op::LocalGet(0),
                Op::I64Const(7),
                Op::LocalGet(0),
                Op::CallImport(0),
            ],
        );
        let cc = compile_ok(&env, &f);
        assert!(cc.relocs().is_empty());
        assert_eq!(unsafe { run_l(&cc, 6) } as i64, 48);
    }

    #[test]
    fn call_native_records_relocation() {
        let env = ModuleEnv {
            funcs: vec![FuncType {
                params: vec![],
                result: None,
            }],
            ..ModuleEnv::default()
        };
        let f = func(vec![], None, vec![], vec![Op::Call(FuncIdx(0))]);
        let cc = compile_ok(&env, &f);
        assert_eq!(cc.relocs().len(), 1);
        assert_eq!(cc.relocs()[0].func, FuncIdx(0));
        // The placeholder immediate is all zeroes, awaiting the patch.
        let off = usize::try_from(cc.relocs()[0].off).unwrap();
        assert_eq!(&cc.code()[off..off + 8], &[0; 8]);
    }

    extern "C" fn table_callee(_instance: *mut u8, v: i64) -> i64 {
        v.wrapping_add(1)
    }

    #[test]
    fn call_indirect_end_to_end() {
        let entries: [usize; 2] = [0, table_callee as usize];
        let env = ModuleEnv {
            types: vec![FuncType {
                params: vec![ValueKind::I64],
                result: Some(ValueKind::I64),
            }],
            table: Some(Table {
                base: entries.as_ptr() as usize,
                len: 2,
            }),
            ..ModuleEnv::default()
        };
        let f = func(
            vec![],
            Some(ValueKind::I64),
            vec![],
            vec![Op::I64Const(41), Op::I32Const(1), Op::CallIndirect(0)],
        );
        let cc = compile_ok(&env, &f);
        assert!(cc.traps().iter().any(|t| t.kind == TrapKind::IndirectCall));
        assert_eq!(unsafe { run0(&cc) } as i64, 42);
    }

    #[test]
    fn indirect_call_without_table_bails() {
        let env = ModuleEnv {
            types: vec![FuncType {
                params: vec![],
                result: None,
            }],
            ..ModuleEnv::default()
        };
        let f = func(
            vec![],
            None,
            vec![],
            vec![Op::I32Const(0), Op::CallIndirect(0)],
        );
        assert!(matches!(
            compile(&env, &f),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn stack_check_guards_entry() {
        // A limit of zero can never fire; the guard still has to be emitted
        // and must come with an out-of-line trap site.
        static LIMIT: AtomicUsize = AtomicUsize::new(0);
        let env = ModuleEnv {
            stack_limit: Some(&LIMIT as *const AtomicUsize as usize),
            ..ModuleEnv::default()
        };
        let f = func(vec![], Some(ValueKind::I32), vec![], vec![Op::I32Const(5)]);
        let cc = compile_ok(&env, &f);
        assert!(cc.traps().iter().any(|t| t.kind == TrapKind::StackOverflow));
        assert!(cc.disassemble().unwrap().contains("cmp rsp"));
        assert_eq!(unsafe { run0(&cc) } as u32, 5);
    }

    #[test]
    fn too_many_parameters_bails() {
        let env = ModuleEnv::default();
        // Six integer parameters: the instance pointer occupies the first
        // argument register, so only five fit.
        let f = func(
            vec![ValueKind::I64; 6],
            None,
            vec![],
            vec![],
        );
        assert!(matches!(
            compile(&env, &f),
            Err(CompileError::Unsupported(_))
        ));
    }

    #[test]
    fn shift_count_register_conflicts_are_resolved() {
        let env = ModuleEnv::default();
        // Two LocalGets land the left operand in the allocator's first free
        // registers; shifting forces the count into its fixed register.
        let f = func(
            vec![ValueKind::I32, ValueKind::I32],
            Some(ValueKind::I32),
            vec![],
            vec![
                Op::LocalGet(1),
                Op::LocalGet(0),
                Op::LocalGet(1),
                Op::I32Shl,
                Op::I32Add,
            ],
        );
        let cc = compile_ok(&env, &f);
        // b + (a << b)
        assert_eq!(unsafe { run_ii(&cc, 3, 4) } as u32, 52);
    }

    #[test]
    fn live_maps_track_operand_stack() {
        let env = ModuleEnv::default();
        let f = func(
            vec![],
            None,
            vec![],
            vec![Op::I64Const(7), Op::Drop],
        );
        let cc = compile_ok(&env, &f);
        let maps = cc.live_maps();
        assert_eq!(maps.len(), 2);
        assert_eq!(maps[0].slots.len(), 1);
        assert_eq!(maps[0].slots[0].kind, ValueKind::I64);
        assert!(matches!(maps[0].slots[0].loc, Location::Const { bits: 7 }));
        assert!(maps[1].slots.is_empty());
        assert!(maps[0].off <= maps[1].off);
    }
}
