//! A baseline (tier-1) JIT compiler for a stack-based, statically-typed
//! portable bytecode.
//!
//! The baseline tier translates one function's bytecode into native machine
//! code in a single linear pass, trading code quality for compilation speed.
//! Anything the active backend cannot express triggers a *bailout*: the
//! partial output is discarded and the caller is told to fall back to a
//! slower tier (an interpreter or an optimising compiler). A bailout is never
//! an error the end user sees.
//!
//! The crate splits into an architecture-independent core (the value model,
//! the operand stack, the register/spill-slot allocator, the frame builder)
//! and per-architecture emission backends, which are the only code that
//! knows real opcodes and encodings.

#![allow(clippy::upper_case_acronyms)]

pub mod bytecode;
pub mod compile;
mod log;

pub use compile::{compile, CompileError, CompiledCode};
