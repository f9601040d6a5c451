//! # Otter HBC Exec
//!
//! Bookkeeping between the interpreter and the baseline JIT:
//! - per-function call counters against the hot threshold
//! - compiled code cache keyed by `(module_id, function_index)`
//! - do-not-JIT marking for functions that failed to compile
//! - compile statistics

#![warn(clippy::all)]
#![warn(missing_docs)]

mod jit_cache;

pub use jit_cache::{FunctionKey, JitCache, JitStats};
