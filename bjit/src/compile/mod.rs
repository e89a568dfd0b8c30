//! The compilation entry point and the compiler's output surface.

use crate::{
    bytecode::{Function, FuncIdx, ModuleEnv, ValueKind},
    log::{self, DumpPhase, Verbosity},
};
use dynasmrt::{AssemblyOffset, ExecutableBuffer};
use smallvec::SmallVec;
use std::error::Error;
use thiserror::Error;

pub mod baseline;

pub use baseline::frame::{FrameLayout, SlotIdx};
pub use baseline::reg_alloc::Location;

/// A failure to compile a function at the baseline tier.
#[derive(Error, Debug)]
pub enum CompileError {
    /// The function uses a construct the active backend does not implement.
    /// The caller is expected to fall back to another tier; this is not a
    /// user-visible error.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// A resource limit was exceeded (e.g. a stack frame too large to
    /// encode). Treated exactly like [Self::Unsupported] by callers.
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),
    /// Something went wrong that suggests a bug in the compiler or its
    /// caller: validated input should never produce this.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Why might an already-emitted instruction trap at run time?
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapKind {
    /// A memory load or store.
    MemAccess,
    /// An indirect call through the table.
    IndirectCall,
    /// An explicit `unreachable`.
    Unreachable,
    /// The stack-overflow guard fired.
    StackOverflow,
}

/// A position in the code that may trap and needs an out-of-line recovery
/// target wired up by the embedder.
#[derive(Clone, Copy, Debug)]
pub struct TrapSite {
    /// Byte offset of the trapping instruction within the code buffer.
    pub off: u32,
    pub kind: TrapKind,
}

/// A position requiring later patching against an absolute address: the
/// 64-bit immediate at `off` must be overwritten with the final address of
/// `func` once the module's functions have all been placed.
#[derive(Clone, Copy, Debug)]
pub struct Reloc {
    /// Byte offset of the 8-byte immediate within the code buffer.
    pub off: u32,
    pub func: FuncIdx,
}

/// The kind and current [Location] of one live operand-stack slot.
#[derive(Clone, Copy, Debug)]
pub struct LiveSlot {
    pub kind: ValueKind,
    pub loc: Location,
}

/// A snapshot of the abstract operand stack at one bytecode-operation
/// boundary, bottom slot first.
///
/// An external stack walker uses these to find (and, during a collection,
/// update) live values. Locals are not included: they live at fixed frame
/// offsets recoverable from [FrameLayout] alone.
#[derive(Clone, Debug)]
pub struct LiveMap {
    /// Byte offset of the first instruction after the operation.
    pub off: u32,
    pub slots: SmallVec<[LiveSlot; 8]>,
}

/// The output of one successful compilation: finalised native code plus the
/// side tables external collaborators need.
#[derive(Debug)]
pub struct CompiledCode {
    buf: ExecutableBuffer,
    frame: FrameLayout,
    relocs: Vec<Reloc>,
    traps: Vec<TrapSite>,
    live_maps: Vec<LiveMap>,
}

impl CompiledCode {
    pub(crate) fn new(
        buf: ExecutableBuffer,
        frame: FrameLayout,
        relocs: Vec<Reloc>,
        traps: Vec<TrapSite>,
        live_maps: Vec<LiveMap>,
    ) -> Self {
        Self {
            buf,
            frame,
            relocs,
            traps,
            live_maps,
        }
    }

    /// The entry point of the compiled function.
    pub fn entry(&self) -> *const u8 {
        self.buf.ptr(AssemblyOffset(0))
    }

    /// The native code bytes.
    pub fn code(&self) -> &[u8] {
        &self.buf
    }

    /// The final frame layout, for stack walking and GC root scanning.
    pub fn frame(&self) -> &FrameLayout {
        &self.frame
    }

    /// Positions requiring later patching against absolute addresses.
    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// Positions that may trap at run time.
    pub fn traps(&self) -> &[TrapSite] {
        &self.traps
    }

    /// Per-operation-boundary live operand-stack locations.
    pub fn live_maps(&self) -> &[LiveMap] {
        &self.live_maps
    }

    /// Disassemble the native code into a string, for debugging and testing.
    pub fn disassemble(&self) -> Result<String, Box<dyn Error>> {
        let fmt = zydis::Formatter::intel();
        let dec = zydis::Decoder::new64();
        let mut out = Vec::new();
        for insn_info in dec.decode_all::<zydis::VisibleOperands>(&self.buf, 0) {
            let (ip, _raw_bytes, insn) = insn_info?;
            out.push(fmt.format(Some(ip), &insn)?);
        }
        Ok(out.join("\n"))
    }
}

/// Compile one function at the baseline tier.
///
/// On success, the returned [CompiledCode] is complete and executable (once
/// relocations, if any, have been patched). On [CompileError::Unsupported] or
/// [CompileError::LimitExceeded] the function bailed out: no partial code is
/// returned and the caller should hand the function to another tier.
pub fn compile(env: &ModuleEnv, func: &Function) -> Result<CompiledCode, CompileError> {
    log::log(
        Verbosity::JITEvent,
        &format!("baseline: compiling function ({} ops)", func.body.len()),
    );

    #[cfg(target_arch = "x86_64")]
    let ret: Result<CompiledCode, CompileError> =
        baseline::BaselineCompiler::<baseline::x64::X64Masm>::new(env, func)?.compile();
    #[cfg(not(target_arch = "x86_64"))]
    let ret: Result<CompiledCode, CompileError> = Err(CompileError::Unsupported(
        "no baseline backend for this architecture".into(),
    ));

    match &ret {
        Ok(cc) => {
            log::log(
                Verbosity::JITEvent,
                &format!("baseline: compiled {} bytes", cc.code().len()),
            );
            if log::should_dump(DumpPhase::Asm) {
                eprintln!("--- Begin asm ---");
                match cc.disassemble() {
                    Ok(s) => eprintln!("{s}"),
                    Err(e) => eprintln!("<cannot disassemble: {e}>"),
                }
                eprintln!("--- End asm ---");
            }
        }
        Err(e @ (CompileError::Unsupported(_) | CompileError::LimitExceeded(_))) => {
            log::log(Verbosity::Warning, &format!("baseline: bailout: {e}"));
        }
        Err(e) => {
            log::log(Verbosity::Error, &format!("baseline: {e}"));
        }
    }
    ret
}
