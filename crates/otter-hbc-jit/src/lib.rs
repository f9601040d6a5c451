//! # Otter HBC JIT
//!
//! Baseline aarch64 JIT for HBC bytecode functions.
//!
//! - [`discover_bb`] splits a function into basic blocks
//! - [`frame_regs`] tracks where every frame register's value lives, on top
//!   of the [`regalloc`] temporary pools and their [`lru`] ordering
//! - the emitter lowers each instruction to a number fast path plus an
//!   out-of-line call into [`runtime_helpers`]
//! - [`compiler`] drives the pipeline and owns the executable result
//!
//! Emitted code follows the ABI in [`context`] and the value layout in
//! [`value`].

#![warn(clippy::all)]
#![warn(missing_docs)]

mod asm;
pub mod compiler;
pub mod config;
pub mod context;
pub mod discover_bb;
mod emitter;
pub mod frame_regs;
pub mod lru;
pub mod regalloc;
pub mod runtime_helpers;
pub mod value;

pub use compiler::{CompiledFunction, FunctionSource, JitCompiler, JitError};
pub use config::JitConfig;
pub use context::{CallHook, CompiledEntry, JitContext};
pub use discover_bb::{BasicBlockMap, discover_bb};
pub use frame_regs::{FR, FRType, FrameRegTracker, HWReg};
pub use lru::{LruHandle, LruPool};
pub use regalloc::TempRegAlloc;
pub use runtime_helpers::HelperKind;
