//! The frame builder.
//!
//! Computes the layout of a compiled function's stack frame: the
//! instance/context pointer slot, the locals area, and the spill area. The
//! spill area's final size is not known until the whole function has been
//! scanned, so the prologue's stack-pointer adjustment is emitted as a
//! placeholder and patched once [FrameLayout::slot_count] is final.
//!
//! All offsets are positive byte distances below the frame base pointer: the
//! higher the offset, the deeper into the frame. That keeps this module
//! agnostic of the direction the machine stack actually grows.

use typed_index_collections::TiVec;

/// Spill slots are pointer-width regardless of the value kind stored in
/// them: a 4-byte value wastes half a slot, in exchange for never having to
/// track per-slot sizes.
const SLOT_SIZE: u32 = 8;

/// Frames must leave the stack pointer aligned to this many bytes so that
/// calls out of compiled code see an ABI-conformant stack.
const STACK_ALIGN: u32 = 16;

/// A hard safety ceiling on the frame size. A function whose frame would
/// exceed this bails out of the baseline tier rather than emitting a
/// pathological prologue.
const MAX_FRAME_BYTES: u64 = 1024 * 1024;

// Patched frame sizes travel through i32 displacements.
static_assertions::const_assert!(MAX_FRAME_BYTES <= i32::MAX as u64);

/// Typed index of a spill slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct SlotIdx(u32);

impl From<usize> for SlotIdx {
    fn from(v: usize) -> Self {
        Self(u32::try_from(v).unwrap())
    }
}

impl From<SlotIdx> for usize {
    fn from(v: SlotIdx) -> usize {
        usize::try_from(v.0).unwrap()
    }
}

/// The fixed offsets of one function's frame, computed once per compilation.
#[derive(Clone, Copy, Debug)]
pub struct FrameLayout {
    /// Byte offset below the frame base of the instance/context pointer.
    pub instance_off: u32,
    /// Byte offset below the frame base of spill slot 0.
    pub first_slot_off: u32,
    /// The size of one local or spill slot in bytes.
    pub slot_size: u32,
    /// The number of spill slots reserved. A high-water mark: it only ever
    /// grows.
    pub slot_count: u32,
    /// The number of locals, parameters included.
    pub num_locals: u32,
    /// The prologue's final stack-pointer adjustment in bytes. Zero until
    /// the placeholder has been patched.
    pub total_bytes: u32,
}

impl FrameLayout {
    fn new(num_locals: u32) -> Self {
        let instance_off = SLOT_SIZE;
        Self {
            instance_off,
            first_slot_off: instance_off + (num_locals + 1) * SLOT_SIZE,
            slot_size: SLOT_SIZE,
            slot_count: 0,
            num_locals,
            total_bytes: 0,
        }
    }

    /// The offset below the frame base of local `idx`.
    pub fn local_off(&self, idx: u32) -> i32 {
        debug_assert!(idx < self.num_locals);
        i32::try_from(self.instance_off + (idx + 1) * self.slot_size).unwrap()
    }

    /// The offset below the frame base of spill slot `idx`.
    pub fn slot_off(&self, idx: SlotIdx) -> i32 {
        i32::try_from(self.first_slot_off + idx.0 * self.slot_size).unwrap()
    }

    /// The bytes occupied by everything except the spill area: the instance
    /// slot and the locals.
    pub fn base_bytes(&self) -> u32 {
        self.instance_off + self.num_locals * self.slot_size
    }
}

/// Is a spill slot currently holding a value?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Live,
}

/// Allocates and recycles spill slots for the duration of one function's
/// compilation.
pub(crate) struct FrameBuilder {
    pub(crate) layout: FrameLayout,
    slots: TiVec<SlotIdx, SlotState>,
    free: Vec<SlotIdx>,
}

impl FrameBuilder {
    pub(crate) fn new(num_locals: u32) -> Self {
        Self {
            layout: FrameLayout::new(num_locals),
            slots: TiVec::new(),
            free: Vec::new(),
        }
    }

    /// Allocate a spill slot, recycling a freed one if possible.
    pub(crate) fn alloc_slot(&mut self) -> SlotIdx {
        let idx = match self.free.pop() {
            Some(idx) => {
                debug_assert_eq!(self.slots[idx], SlotState::Free);
                self.slots[idx] = SlotState::Live;
                idx
            }
            None => self.slots.push_and_get_key(SlotState::Live),
        };
        self.record_used_slot(idx);
        idx
    }

    /// Return a slot to the free pool.
    pub(crate) fn free_slot(&mut self, idx: SlotIdx) {
        debug_assert_eq!(self.slots[idx], SlotState::Live);
        self.slots[idx] = SlotState::Free;
        self.free.push(idx);
    }

    /// Extend the reserved spill area to cover `idx`. Monotonic: the
    /// reservation never shrinks, even if the slot is later freed.
    pub(crate) fn record_used_slot(&mut self, idx: SlotIdx) {
        self.layout.slot_count = self.layout.slot_count.max(idx.0 + 1);
    }

    /// The final frame size in bytes: the base area plus the spill area,
    /// rounded up to the stack alignment quantum.
    ///
    /// If the result cannot be encoded as the architecture's frame
    /// allocation immediate (`imm_limit`), it is rounded up to the next page
    /// boundary and re-checked; if it is still inexpressible, or exceeds the
    /// hard safety ceiling, this is a bailout.
    pub(crate) fn frame_bytes(&self, imm_limit: u64) -> Result<u32, String> {
        let raw = u64::from(self.layout.base_bytes())
            + u64::from(self.layout.slot_count) * u64::from(SLOT_SIZE);
        let mut bytes = raw.next_multiple_of(u64::from(STACK_ALIGN));
        if bytes > imm_limit {
            bytes = bytes.next_multiple_of(u64::try_from(page_size::get()).unwrap());
        }
        if bytes > imm_limit || bytes > MAX_FRAME_BYTES {
            return Err(format!("stack frame too large ({bytes} bytes)"));
        }
        // The unwrap cannot fail: MAX_FRAME_BYTES fits easily in a u32.
        Ok(u32::try_from(bytes).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets() {
        let fb = FrameBuilder::new(2);
        assert_eq!(fb.layout.instance_off, 8);
        assert_eq!(fb.layout.local_off(0), 16);
        assert_eq!(fb.layout.local_off(1), 24);
        assert_eq!(fb.layout.first_slot_off, 32);
        assert_eq!(fb.layout.slot_off(SlotIdx(0)), 32);
        assert_eq!(fb.layout.slot_off(SlotIdx(3)), 56);
        assert_eq!(fb.layout.base_bytes(), 24);
    }

    #[test]
    fn slot_recycling() {
        let mut fb = FrameBuilder::new(0);
        let a = fb.alloc_slot();
        let b = fb.alloc_slot();
        assert_ne!(a, b);
        fb.free_slot(a);
        // The freed slot is reused in preference to growing the area.
        assert_eq!(fb.alloc_slot(), a);
        assert_eq!(fb.layout.slot_count, 2);
    }

    #[test]
    fn slot_count_monotonic() {
        let mut fb = FrameBuilder::new(0);
        fb.record_used_slot(SlotIdx(9));
        assert_eq!(fb.layout.slot_count, 10);
        fb.record_used_slot(SlotIdx(3));
        assert_eq!(fb.layout.slot_count, 10);
        let hi = fb.frame_bytes(u64::from(u32::MAX)).unwrap();
        fb.record_used_slot(SlotIdx(1));
        assert_eq!(fb.frame_bytes(u64::from(u32::MAX)).unwrap(), hi);
    }

    #[test]
    fn frame_bytes_aligned() {
        for nlocals in 0..4 {
            let mut fb = FrameBuilder::new(nlocals);
            for count in 0..200 {
                if count > 0 {
                    fb.record_used_slot(SlotIdx(count - 1));
                }
                let bytes = fb.frame_bytes(u64::from(u32::MAX)).unwrap();
                assert_eq!(bytes % STACK_ALIGN, 0);
                assert!(
                    u64::from(bytes)
                        >= u64::from(fb.layout.base_bytes()) + u64::from(count) * 8
                );
            }
        }
    }

    #[test]
    fn zero_slots_reserves_base_only() {
        let fb = FrameBuilder::new(1);
        // Instance slot + one local = 16 bytes, already aligned.
        assert_eq!(fb.frame_bytes(u64::from(u32::MAX)).unwrap(), 16);
    }

    #[test]
    fn frame_too_large_bails() {
        let mut fb = FrameBuilder::new(0);
        fb.record_used_slot(SlotIdx(u32::try_from(MAX_FRAME_BYTES / 8).unwrap()));
        assert!(fb.frame_bytes(u64::from(u32::MAX)).is_err());
    }

    #[test]
    fn small_imm_limit_rounds_to_page_then_bails() {
        let mut fb = FrameBuilder::new(0);
        fb.record_used_slot(SlotIdx(100));
        // An absurdly small immediate limit cannot be satisfied even after
        // page rounding.
        assert!(fb.frame_bytes(64).is_err());
    }
}
