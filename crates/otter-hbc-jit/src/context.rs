//! Runtime ABI between compiled code and its embedder.
//!
//! A compiled function has the signature [`CompiledEntry`]:
//!
//! ```text
//! x0 = *mut JitContext   (kept in x19 for the whole call)
//! x1 = *mut u64          frame registers, r at frame + r * 8 (kept in x20)
//! ret x0                 NaN-boxed result, or EMPTY when an exception escaped
//! ```
//!
//! On an uncaught exception the thrown value stays in
//! [`JitContext::thrown_value`]. The caller owns the frame and initializes
//! every register before the call.

use std::ffi::c_void;
use std::mem::offset_of;

use crate::value;

/// Embedder callback that performs a `Call`.
///
/// `args` points at `argc` values, `this` first. Returning with
/// `thrown_value` set signals an exception.
pub type CallHook = extern "C" fn(ctx: *mut JitContext, callee: u64, args: *const u64, argc: u32) -> u64;

/// Native entry point of a compiled function.
pub type CompiledEntry = unsafe extern "C" fn(ctx: *mut JitContext, frame: *mut u64) -> u64;

/// Per-call runtime state shared with emitted code.
#[repr(C)]
#[derive(Debug)]
pub struct JitContext {
    /// Pending exception, [`value::EMPTY`] when none.
    pub thrown_value: u64,
    /// Incoming arguments; `args[0]` is `this`.
    pub args: *const u64,
    /// Number of entries in `args`.
    pub argc: u32,
    /// Bytecode offset of the instruction that last called into the runtime.
    pub current_ip: u32,
    /// Handler for `Call`; without one every call throws.
    pub call_hook: Option<CallHook>,
    /// Opaque embedder data.
    pub user_data: *mut c_void,
}

impl JitContext {
    /// Context for a call with `args`, which must outlive the call.
    pub fn new(args: &[u64]) -> Self {
        Self {
            thrown_value: value::EMPTY,
            args: args.as_ptr(),
            argc: args.len() as u32,
            current_ip: 0,
            call_hook: None,
            user_data: std::ptr::null_mut(),
        }
    }

    /// Installs the call handler.
    pub fn with_call_hook(mut self, hook: CallHook) -> Self {
        self.call_hook = Some(hook);
        self
    }

    /// Whether an exception is pending.
    pub fn has_exception(&self) -> bool {
        self.thrown_value != value::EMPTY
    }

    /// Takes the pending exception.
    pub fn take_exception(&mut self) -> Option<u64> {
        let thrown = std::mem::replace(&mut self.thrown_value, value::EMPTY);
        (thrown != value::EMPTY).then_some(thrown)
    }
}

/// Field offsets used by emitted loads and stores.
pub mod offsets {
    use super::*;

    /// `thrown_value`
    pub const THROWN_VALUE: u32 = offset_of!(JitContext, thrown_value) as u32;
    /// `args`
    pub const ARGS: u32 = offset_of!(JitContext, args) as u32;
    /// `argc`
    pub const ARGC: u32 = offset_of!(JitContext, argc) as u32;
    /// `current_ip`
    pub const CURRENT_IP: u32 = offset_of!(JitContext, current_ip) as u32;
    /// `call_hook`
    pub const CALL_HOOK: u32 = offset_of!(JitContext, call_hook) as u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_stable() {
        assert_eq!(offsets::THROWN_VALUE, 0);
        assert_eq!(offsets::ARGS, 8);
        assert_eq!(offsets::ARGC, 16);
        assert_eq!(offsets::CURRENT_IP, 20);
        assert_eq!(offsets::CALL_HOOK, 24);
        // Scaled 32-bit loads need 4-byte alignment, 64-bit ones 8.
        assert_eq!(offsets::ARGC % 4, 0);
        assert_eq!(offsets::ARGS % 8, 0);
    }

    #[test]
    fn exception_slot() {
        let args = [value::UNDEFINED];
        let mut ctx = JitContext::new(&args);
        assert_eq!(ctx.argc, 1);
        assert!(!ctx.has_exception());
        ctx.thrown_value = value::TRUE;
        assert_eq!(ctx.take_exception(), Some(value::TRUE));
        assert_eq!(ctx.take_exception(), None);
    }
}
