//! Register allocation.
//!
//! The baseline tier makes a single linear pass with no liveness analysis, so
//! it cannot know which registers it will need later. Registers are therefore
//! handed out on demand and, when none is free, the least-recently-used one
//! is spilled to a stack slot. Spilling can always succeed (the spill area is
//! unbounded), so [RegAlloc::acquire] never fails.
//!
//! During the multi-step emission of one operation, registers holding
//! in-flight values must not be handed out or chosen as spill victims; the
//! driver marks them with [RegAlloc::pin]. Pins nest.

use super::{
    frame::{FrameBuilder, SlotIdx},
    masm::MacroAsm,
};
use crate::bytecode::{RegClass, ValueKind};

/// The number of registers a class can hold. Both supported classes fit in
/// 16; register codes index into per-class arrays of this length.
pub(crate) const REGS_PER_CLASS: usize = 16;

/// A bitset of physical registers of one class.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct RegSet(u16);

impl RegSet {
    pub(crate) fn empty() -> Self {
        Self(0)
    }

    pub(crate) fn from_codes(codes: &[u8]) -> Self {
        let mut s = Self::empty();
        for c in codes {
            s.set(*c);
        }
        s
    }

    pub(crate) fn is_set(&self, code: u8) -> bool {
        self.0 & (1 << code) != 0
    }

    pub(crate) fn set(&mut self, code: u8) {
        self.0 |= 1 << code;
    }

    pub(crate) fn unset(&mut self, code: u8) {
        self.0 &= !(1 << code);
    }

    /// Iterate over the codes of the set registers, lowest first.
    pub(crate) fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        let bits = self.0;
        (0..u8::try_from(REGS_PER_CLASS).unwrap()).filter(move |c| bits & (1 << c) != 0)
    }
}

/// Where is a value currently stored?
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Location {
    /// In the physical register with the backend's code `code`.
    Reg { code: u8, class: RegClass },
    /// In a spill slot.
    Slot(SlotIdx),
    /// Not yet materialised: an immediate constant, as raw bits.
    Const { bits: u64 },
}

/// One entry of the abstract operand stack: a value kind paired with the
/// location currently holding it.
#[derive(Clone, Copy, Debug)]
pub(crate) struct OperandState {
    pub(crate) kind: ValueKind,
    pub(crate) loc: Location,
}

impl OperandState {
    pub(crate) fn new(kind: ValueKind, loc: Location) -> Self {
        debug_assert!(
            !matches!(loc, Location::Reg { class, .. } if class != kind.reg_class()),
            "register class does not match value kind"
        );
        Self { kind, loc }
    }
}

/// Per-class allocation state.
struct ClassState {
    /// The registers this allocator may hand out at all.
    allocatable: RegSet,
    /// The registers currently holding a value (or pinned).
    in_use: RegSet,
    /// Nesting pin counts, indexed by register code.
    pins: [u8; REGS_PER_CLASS],
    /// When was each register last handed out or touched?
    last_use: [u64; REGS_PER_CLASS],
}

impl ClassState {
    fn new(allocatable: RegSet) -> Self {
        Self {
            allocatable,
            in_use: RegSet::empty(),
            pins: [0; REGS_PER_CLASS],
            last_use: [0; REGS_PER_CLASS],
        }
    }
}

fn class_idx(class: RegClass) -> usize {
    match class {
        RegClass::Gp => 0,
        RegClass::Fp => 1,
    }
}

/// Assigns and reclaims physical registers for the duration of one function
/// compilation.
pub(crate) struct RegAlloc {
    classes: [ClassState; 2],
    tick: u64,
}

impl RegAlloc {
    pub(crate) fn new(gp_allocatable: RegSet, fp_allocatable: RegSet) -> Self {
        Self {
            classes: [
                ClassState::new(gp_allocatable),
                ClassState::new(fp_allocatable),
            ],
            tick: 0,
        }
    }

    fn cls(&mut self, class: RegClass) -> &mut ClassState {
        &mut self.classes[class_idx(class)]
    }

    /// Record that `code` was just used, for LRU victim selection.
    pub(crate) fn touch(&mut self, class: RegClass, code: u8) {
        self.tick += 1;
        let t = self.tick;
        self.cls(class).last_use[usize::from(code)] = t;
    }

    /// Is `code` currently free?
    pub(crate) fn is_free(&self, class: RegClass, code: u8) -> bool {
        let c = &self.classes[class_idx(class)];
        c.allocatable.is_set(code) && !c.in_use.is_set(code)
    }

    /// Mark `code` as temporarily unavailable for reuse. Pins nest.
    pub(crate) fn pin(&mut self, class: RegClass, code: u8) {
        self.cls(class).pins[usize::from(code)] += 1;
    }

    pub(crate) fn unpin(&mut self, class: RegClass, code: u8) {
        let p = &mut self.cls(class).pins[usize::from(code)];
        debug_assert!(*p > 0, "unpin of an unpinned register");
        *p -= 1;
    }

    /// Release a register whose value is dead.
    pub(crate) fn release(&mut self, class: RegClass, code: u8) {
        let c = self.cls(class);
        debug_assert!(c.in_use.is_set(code), "release of a free register");
        c.in_use.unset(code);
    }

    /// Return an unused register of `class`, not in `exclude`, spilling the
    /// least-recently-used operand-stack resident register if none is free.
    /// This cannot fail: the spill area grows as needed.
    pub(crate) fn acquire<M: MacroAsm>(
        &mut self,
        masm: &mut M,
        stack: &mut [OperandState],
        frame: &mut FrameBuilder,
        class: RegClass,
        exclude: RegSet,
    ) -> u8 {
        let c = self.cls(class);
        let free = c
            .allocatable
            .iter()
            .find(|code| !c.in_use.is_set(*code) && !exclude.is_set(*code));
        let code = match free {
            Some(code) => code,
            None => {
                let victim = self
                    .spill_victim(stack, class, exclude)
                    .expect("no spillable register: all candidates pinned or in flight");
                self.spill(masm, stack, frame, class, victim);
                victim
            }
        };
        self.cls(class).in_use.set(code);
        self.touch(class, code);
        code
    }

    /// Acquire one specific register (e.g. the architecture's shift-count
    /// register), evicting whatever operand currently holds it.
    pub(crate) fn acquire_fixed<M: MacroAsm>(
        &mut self,
        masm: &mut M,
        stack: &mut [OperandState],
        frame: &mut FrameBuilder,
        class: RegClass,
        code: u8,
    ) {
        let c = self.cls(class);
        debug_assert!(c.allocatable.is_set(code));
        debug_assert_eq!(c.pins[usize::from(code)], 0, "cannot evict a pinned register");
        if c.in_use.is_set(code) {
            self.spill(masm, stack, frame, class, code);
        }
        self.cls(class).in_use.set(code);
        self.touch(class, code);
    }

    /// Choose the least-recently-used spillable register of `class`: it must
    /// be in use, unpinned, not excluded, and actually resident on the
    /// operand stack (registers held for in-flight computations have no
    /// stack entry and must stay untouched).
    fn spill_victim(
        &self,
        stack: &[OperandState],
        class: RegClass,
        exclude: RegSet,
    ) -> Option<u8> {
        let c = &self.classes[class_idx(class)];
        let mut victim: Option<u8> = None;
        for os in stack {
            if let Location::Reg { code, class: rc } = os.loc {
                if rc != class || exclude.is_set(code) || c.pins[usize::from(code)] > 0 {
                    continue;
                }
                debug_assert!(c.in_use.is_set(code));
                match victim {
                    Some(v) if c.last_use[usize::from(v)] <= c.last_use[usize::from(code)] => (),
                    _ => victim = Some(code),
                }
            }
        }
        victim
    }

    /// Spill the operand-stack value held in `code` to a stack slot and free
    /// the register.
    fn spill<M: MacroAsm>(
        &mut self,
        masm: &mut M,
        stack: &mut [OperandState],
        frame: &mut FrameBuilder,
        class: RegClass,
        code: u8,
    ) {
        let os = stack
            .iter_mut()
            .find(|os| matches!(os.loc, Location::Reg { code: c, class: rc } if c == code && rc == class))
            .expect("spill victim is not on the operand stack");
        let slot = frame.alloc_slot();
        masm.emit_spill(os.kind, frame.layout.slot_off(slot), code);
        os.loc = Location::Slot(slot);
        self.cls(class).in_use.unset(code);
    }

    /// Spill every register-resident operand to a stack slot, e.g. ahead of a
    /// call that clobbers the (caller-saved) allocatable registers. Constants
    /// stay as they are.
    pub(crate) fn sync_all<M: MacroAsm>(
        &mut self,
        masm: &mut M,
        stack: &mut [OperandState],
        frame: &mut FrameBuilder,
    ) {
        for os in stack.iter_mut() {
            if let Location::Reg { code, class } = os.loc {
                let slot = frame.alloc_slot();
                masm.emit_spill(os.kind, frame.layout.slot_off(slot), code);
                os.loc = Location::Slot(slot);
                self.cls(class).in_use.unset(code);
            }
        }
    }
}
