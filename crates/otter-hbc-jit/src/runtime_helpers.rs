//! Runtime helpers called from emitted code.
//!
//! Fast paths only handle numbers in registers. Everything else goes through
//! an `extern "C"` helper that implements the full primitive semantics on
//! NaN-boxed values (see [`crate::value`]).
//!
//! # ABI
//!
//! ```text
//! binary:   (ctx, lhs, rhs) -> value
//! unary:    (ctx, input)    -> value
//! compare:  (ctx, lhs, rhs) -> 0 | 1
//! ```
//!
//! Helpers are reached through per-function thunks that load the address
//! from the read-only pool, so the emitted code stays position independent.

use crate::context::JitContext;
use crate::value::{self, encode_bool, encode_number, to_int32, to_number, to_uint32};

// ---------------------------------------------------------------------------
// Helper kind enumeration
// ---------------------------------------------------------------------------

/// Identifies a runtime helper function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum HelperKind {
    /// `(ctx, lhs, rhs) -> value` generic `+`
    Add = 0,
    /// `(ctx, lhs, rhs) -> value` generic `-`
    Sub = 1,
    /// `(ctx, lhs, rhs) -> value` generic `*`
    Mul = 2,
    /// `(ctx, lhs, rhs) -> value` generic `/`
    Div = 3,
    /// `(ctx, lhs, rhs) -> value` generic `%`
    Mod = 4,
    /// `(ctx, lhs, rhs) -> value` `&`
    BitAnd = 5,
    /// `(ctx, lhs, rhs) -> value` `|`
    BitOr = 6,
    /// `(ctx, lhs, rhs) -> value` `^`
    BitXor = 7,
    /// `(ctx, lhs, rhs) -> value` `<<`
    LShift = 8,
    /// `(ctx, lhs, rhs) -> value` `>>`
    RShift = 9,
    /// `(ctx, lhs, rhs) -> value` `>>>`
    URshift = 10,
    /// `(ctx, val) -> value` unary `-`
    Negate = 11,
    /// `(ctx, val) -> bool value` `!`
    Not = 12,
    /// `(ctx, val) -> value` `~`
    BitNot = 13,
    /// `(ctx, val) -> value` `+ 1`
    Inc = 14,
    /// `(ctx, val) -> value` `- 1`
    Dec = 15,
    /// `(ctx, val) -> value` ToNumber
    ToNumber = 16,
    /// `(ctx, val) -> 0 | 1` ToBoolean
    ToBoolean = 17,
    /// `(ctx, lhs, rhs) -> 0 | 1` `<`
    Less = 18,
    /// `(ctx, lhs, rhs) -> 0 | 1` `<=`
    LessEq = 19,
    /// `(ctx, lhs, rhs) -> 0 | 1` `>`
    Greater = 20,
    /// `(ctx, lhs, rhs) -> 0 | 1` `>=`
    GreaterEq = 21,
    /// `(ctx, lhs, rhs) -> 0 | 1` `==`
    Eq = 22,
    /// `(ctx, lhs, rhs) -> 0 | 1` `===`
    StrictEq = 23,
    /// `(ctx, callee, args, argc) -> value`
    Call = 24,
    /// `(table, count, offset) -> index | -1`
    FindCatchTarget = 25,
    /// `(ctx) -> !`
    Unreachable = 26,
}

/// Total number of helper kinds.
pub const HELPER_COUNT: usize = 27;

impl HelperKind {
    /// Exported symbol name.
    pub fn symbol_name(self) -> &'static str {
        match self {
            Self::Add => "hbc_jit_add",
            Self::Sub => "hbc_jit_sub",
            Self::Mul => "hbc_jit_mul",
            Self::Div => "hbc_jit_div",
            Self::Mod => "hbc_jit_mod",
            Self::BitAnd => "hbc_jit_bit_and",
            Self::BitOr => "hbc_jit_bit_or",
            Self::BitXor => "hbc_jit_bit_xor",
            Self::LShift => "hbc_jit_lshift",
            Self::RShift => "hbc_jit_rshift",
            Self::URshift => "hbc_jit_urshift",
            Self::Negate => "hbc_jit_negate",
            Self::Not => "hbc_jit_not",
            Self::BitNot => "hbc_jit_bit_not",
            Self::Inc => "hbc_jit_inc",
            Self::Dec => "hbc_jit_dec",
            Self::ToNumber => "hbc_jit_to_number",
            Self::ToBoolean => "hbc_jit_to_boolean",
            Self::Less => "hbc_jit_less",
            Self::LessEq => "hbc_jit_less_eq",
            Self::Greater => "hbc_jit_greater",
            Self::GreaterEq => "hbc_jit_greater_eq",
            Self::Eq => "hbc_jit_eq",
            Self::StrictEq => "hbc_jit_strict_eq",
            Self::Call => "hbc_jit_call",
            Self::FindCatchTarget => "hbc_jit_find_catch_target",
            Self::Unreachable => "hbc_jit_unreachable",
        }
    }

    /// Address of the implementation.
    pub fn address(self) -> u64 {
        let ptr: *const () = match self {
            Self::Add => hbc_jit_add as *const (),
            Self::Sub => hbc_jit_sub as *const (),
            Self::Mul => hbc_jit_mul as *const (),
            Self::Div => hbc_jit_div as *const (),
            Self::Mod => hbc_jit_mod as *const (),
            Self::BitAnd => hbc_jit_bit_and as *const (),
            Self::BitOr => hbc_jit_bit_or as *const (),
            Self::BitXor => hbc_jit_bit_xor as *const (),
            Self::LShift => hbc_jit_lshift as *const (),
            Self::RShift => hbc_jit_rshift as *const (),
            Self::URshift => hbc_jit_urshift as *const (),
            Self::Negate => hbc_jit_negate as *const (),
            Self::Not => hbc_jit_not as *const (),
            Self::BitNot => hbc_jit_bit_not as *const (),
            Self::Inc => hbc_jit_inc as *const (),
            Self::Dec => hbc_jit_dec as *const (),
            Self::ToNumber => hbc_jit_to_number as *const (),
            Self::ToBoolean => hbc_jit_to_boolean as *const (),
            Self::Less => hbc_jit_less as *const (),
            Self::LessEq => hbc_jit_less_eq as *const (),
            Self::Greater => hbc_jit_greater as *const (),
            Self::GreaterEq => hbc_jit_greater_eq as *const (),
            Self::Eq => hbc_jit_eq as *const (),
            Self::StrictEq => hbc_jit_strict_eq as *const (),
            Self::Call => hbc_jit_call as *const (),
            Self::FindCatchTarget => hbc_jit_find_catch_target as *const (),
            Self::Unreachable => hbc_jit_unreachable as *const (),
        };
        ptr as u64
    }

    /// Whether the helper returns a raw 0/1 flag instead of a value.
    pub fn returns_flag(self) -> bool {
        matches!(
            self,
            Self::ToBoolean
                | Self::Less
                | Self::LessEq
                | Self::Greater
                | Self::GreaterEq
                | Self::Eq
                | Self::StrictEq
        )
    }
}

// ---------------------------------------------------------------------------
// Arithmetic
// ---------------------------------------------------------------------------

fn binary_number(lhs: u64, rhs: u64, op: impl FnOnce(f64, f64) -> f64) -> u64 {
    encode_number(op(to_number(lhs), to_number(rhs)))
}

fn binary_int32(lhs: u64, rhs: u64, op: impl FnOnce(i32, i32) -> i32) -> u64 {
    let result = op(to_int32(to_number(lhs)), to_int32(to_number(rhs)));
    encode_number(f64::from(result))
}

/// Generic `+`. Heap operands are not inspected and produce NaN.
pub extern "C" fn hbc_jit_add(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_number(lhs, rhs, |a, b| a + b)
}

/// Generic `-`.
pub extern "C" fn hbc_jit_sub(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_number(lhs, rhs, |a, b| a - b)
}

/// Generic `*`.
pub extern "C" fn hbc_jit_mul(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_number(lhs, rhs, |a, b| a * b)
}

/// Generic `/`.
pub extern "C" fn hbc_jit_div(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_number(lhs, rhs, |a, b| a / b)
}

/// Generic `%`, truncating like C `fmod`.
pub extern "C" fn hbc_jit_mod(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_number(lhs, rhs, |a, b| a % b)
}

/// `&`
pub extern "C" fn hbc_jit_bit_and(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_int32(lhs, rhs, |a, b| a & b)
}

/// `|`
pub extern "C" fn hbc_jit_bit_or(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_int32(lhs, rhs, |a, b| a | b)
}

/// `^`
pub extern "C" fn hbc_jit_bit_xor(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_int32(lhs, rhs, |a, b| a ^ b)
}

/// `<<`, shift count masked to 5 bits.
pub extern "C" fn hbc_jit_lshift(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_int32(lhs, rhs, |a, b| a.wrapping_shl(b as u32 & 31))
}

/// `>>`
pub extern "C" fn hbc_jit_rshift(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    binary_int32(lhs, rhs, |a, b| a.wrapping_shr(b as u32 & 31))
}

/// `>>>`, the only shift with an unsigned result.
pub extern "C" fn hbc_jit_urshift(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    let a = to_uint32(to_number(lhs));
    let b = to_uint32(to_number(rhs)) & 31;
    encode_number(f64::from(a >> b))
}

// ---------------------------------------------------------------------------
// Unary
// ---------------------------------------------------------------------------

/// Unary `-`.
pub extern "C" fn hbc_jit_negate(_ctx: *mut JitContext, input: u64) -> u64 {
    encode_number(-to_number(input))
}

/// `!`, returning a boxed bool.
pub extern "C" fn hbc_jit_not(_ctx: *mut JitContext, input: u64) -> u64 {
    encode_bool(!value::to_boolean(input))
}

/// `~`
pub extern "C" fn hbc_jit_bit_not(_ctx: *mut JitContext, input: u64) -> u64 {
    encode_number(f64::from(!to_int32(to_number(input))))
}

/// `x + 1` after ToNumber.
pub extern "C" fn hbc_jit_inc(_ctx: *mut JitContext, input: u64) -> u64 {
    encode_number(to_number(input) + 1.0)
}

/// `x - 1` after ToNumber.
pub extern "C" fn hbc_jit_dec(_ctx: *mut JitContext, input: u64) -> u64 {
    encode_number(to_number(input) - 1.0)
}

/// ToNumber.
pub extern "C" fn hbc_jit_to_number(_ctx: *mut JitContext, input: u64) -> u64 {
    encode_number(to_number(input))
}

/// ToBoolean as a 0/1 flag.
pub extern "C" fn hbc_jit_to_boolean(_ctx: *mut JitContext, input: u64) -> u64 {
    u64::from(value::to_boolean(input))
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

/// `lhs < rhs`; false when either side is NaN.
pub extern "C" fn hbc_jit_less(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    u64::from(value::less_than(lhs, rhs) == Some(true))
}

/// `lhs <= rhs`, evaluated as `!(rhs < lhs)` with NaN giving false.
pub extern "C" fn hbc_jit_less_eq(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    u64::from(value::less_than(rhs, lhs) == Some(false))
}

/// `lhs > rhs`
pub extern "C" fn hbc_jit_greater(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    u64::from(value::less_than(rhs, lhs) == Some(true))
}

/// `lhs >= rhs`
pub extern "C" fn hbc_jit_greater_eq(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    u64::from(value::less_than(lhs, rhs) == Some(false))
}

/// `==`
pub extern "C" fn hbc_jit_eq(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    u64::from(value::loose_equals(lhs, rhs))
}

/// `===`
pub extern "C" fn hbc_jit_strict_eq(_ctx: *mut JitContext, lhs: u64, rhs: u64) -> u64 {
    u64::from(value::strict_equals(lhs, rhs))
}

// ---------------------------------------------------------------------------
// Calls and exceptions
// ---------------------------------------------------------------------------

/// Performs `Call` through the context's hook. Without a hook the callee
/// itself is thrown, since nothing can run it.
///
/// # Safety
///
/// `ctx` must point to a live [`JitContext`] and `args` to `argc` values.
pub unsafe extern "C" fn hbc_jit_call(ctx: *mut JitContext, callee: u64, args: *const u64, argc: u32) -> u64 {
    // SAFETY: emitted code always passes the context it was entered with.
    let hook = unsafe { (*ctx).call_hook };
    match hook {
        Some(hook) => hook(ctx, callee, args, argc),
        None => {
            tracing::debug!(target: "otter::jit", callee = format_args!("{callee:#x}"), "call without a call hook");
            // SAFETY: as above.
            unsafe { (*ctx).thrown_value = callee };
            value::EMPTY
        }
    }
}

/// Index of the first `(start, end, target)` triple in `table` whose range
/// covers `offset`, or `-1`.
///
/// # Safety
///
/// `table` must point to `count * 3` readable `u32`s.
pub unsafe extern "C" fn hbc_jit_find_catch_target(table: *const u32, count: u32, offset: u32) -> i32 {
    if count == 0 {
        return -1;
    }
    // SAFETY: the table is the read-only copy emitted next to the code.
    let entries = unsafe { std::slice::from_raw_parts(table, count as usize * 3) };
    find_catch_index(entries, offset)
}

/// Safe core of [`hbc_jit_find_catch_target`].
pub fn find_catch_index(entries: &[u32], offset: u32) -> i32 {
    entries
        .chunks_exact(3)
        .position(|e| e[0] <= offset && offset < e[1])
        .map_or(-1, |i| i as i32)
}

/// Reached only when control falls off the end of a function or hits an
/// `Unreachable` instruction.
pub extern "C" fn hbc_jit_unreachable(_ctx: *mut JitContext) -> u64 {
    tracing::error!(target: "otter::jit", "unreachable code executed");
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{FALSE, NULL, TRUE, UNDEFINED, encode_tagged};

    const CTX: *mut JitContext = std::ptr::null_mut();

    fn num(n: f64) -> u64 {
        encode_number(n)
    }

    #[test]
    fn symbols_are_unique() {
        let kinds = [
            HelperKind::Add,
            HelperKind::Mod,
            HelperKind::URshift,
            HelperKind::ToBoolean,
            HelperKind::StrictEq,
            HelperKind::Call,
            HelperKind::FindCatchTarget,
            HelperKind::Unreachable,
        ];
        let names: std::collections::HashSet<_> = kinds.iter().map(|k| k.symbol_name()).collect();
        assert_eq!(names.len(), kinds.len());
        assert_eq!(HelperKind::Unreachable as usize + 1, HELPER_COUNT);
        assert_ne!(HelperKind::Add.address(), HelperKind::Sub.address());
        assert!(HelperKind::Less.returns_flag());
        assert!(!HelperKind::Not.returns_flag());
    }

    #[test]
    fn arithmetic_coerces_primitives() {
        assert_eq!(hbc_jit_add(CTX, num(1.5), TRUE), num(2.5));
        assert_eq!(hbc_jit_sub(CTX, NULL, num(2.0)), num(-2.0));
        assert_eq!(hbc_jit_mul(CTX, UNDEFINED, num(2.0)), value::CANONICAL_NAN);
        assert_eq!(hbc_jit_div(CTX, num(1.0), num(0.0)), num(f64::INFINITY));
        assert_eq!(hbc_jit_mod(CTX, num(-7.0), num(3.0)), num(-1.0));
        assert_eq!(hbc_jit_add(CTX, encode_tagged(value::TAG_OBJECT, 8), num(1.0)), value::CANONICAL_NAN);
    }

    #[test]
    fn bit_operations_use_int32() {
        assert_eq!(hbc_jit_bit_and(CTX, num(6.0), num(3.0)), num(2.0));
        assert_eq!(hbc_jit_bit_or(CTX, num(4_294_967_296.0 + 1.0), num(2.0)), num(3.0));
        assert_eq!(hbc_jit_lshift(CTX, num(1.0), num(33.0)), num(2.0));
        assert_eq!(hbc_jit_rshift(CTX, num(-8.0), num(1.0)), num(-4.0));
        assert_eq!(hbc_jit_urshift(CTX, num(-1.0), num(0.0)), num(4_294_967_295.0));
        assert_eq!(hbc_jit_bit_not(CTX, num(0.0)), num(-1.0));
    }

    #[test]
    fn unary() {
        assert_eq!(hbc_jit_not(CTX, num(0.0)), TRUE);
        assert_eq!(hbc_jit_not(CTX, encode_tagged(value::TAG_OBJECT, 1)), FALSE);
        assert_eq!(hbc_jit_inc(CTX, FALSE), num(1.0));
        assert_eq!(hbc_jit_dec(CTX, num(1.0)), num(0.0));
        assert_eq!(hbc_jit_negate(CTX, num(0.0)), num(-0.0));
        assert_eq!(hbc_jit_to_number(CTX, TRUE), num(1.0));
        assert_eq!(hbc_jit_to_boolean(CTX, UNDEFINED), 0);
    }

    #[test]
    fn comparisons_with_nan_are_false() {
        let nan = value::CANONICAL_NAN;
        for f in [hbc_jit_less, hbc_jit_less_eq, hbc_jit_greater, hbc_jit_greater_eq] {
            assert_eq!(f(CTX, nan, num(1.0)), 0);
            assert_eq!(f(CTX, num(1.0), UNDEFINED), 0);
        }
        assert_eq!(hbc_jit_less_eq(CTX, num(1.0), num(1.0)), 1);
        assert_eq!(hbc_jit_greater(CTX, num(2.0), NULL), 1);
        assert_eq!(hbc_jit_greater_eq(CTX, num(-1.0), NULL), 0);
        assert_eq!(hbc_jit_eq(CTX, NULL, UNDEFINED), 1);
        assert_eq!(hbc_jit_strict_eq(CTX, NULL, UNDEFINED), 0);
    }

    #[test]
    fn catch_lookup_takes_first_match() {
        let table = [0, 10, 100, 0, 20, 200, 50, 60, 300];
        assert_eq!(find_catch_index(&table, 5), 0);
        assert_eq!(find_catch_index(&table, 15), 1);
        assert_eq!(find_catch_index(&table, 25), -1);
        assert_eq!(find_catch_index(&table, 55), 2);
        let got = unsafe { hbc_jit_find_catch_target(table.as_ptr(), 3, 55) };
        assert_eq!(got, 2);
        assert_eq!(unsafe { hbc_jit_find_catch_target(std::ptr::null(), 0, 0) }, -1);
    }

    extern "C" fn double_first_arg(_ctx: *mut JitContext, _callee: u64, args: *const u64, argc: u32) -> u64 {
        let args = unsafe { std::slice::from_raw_parts(args, argc as usize) };
        num(to_number(args[1]) * 2.0)
    }

    #[test]
    fn call_uses_hook_or_throws() {
        let args = [UNDEFINED, num(21.0)];
        let mut ctx = JitContext::new(&[]).with_call_hook(double_first_arg);
        let r = unsafe { hbc_jit_call(&mut ctx, TRUE, args.as_ptr(), 2) };
        assert_eq!(r, num(42.0));
        assert!(!ctx.has_exception());

        let mut ctx = JitContext::new(&[]);
        let r = unsafe { hbc_jit_call(&mut ctx, TRUE, args.as_ptr(), 2) };
        assert_eq!(r, value::EMPTY);
        assert_eq!(ctx.take_exception(), Some(TRUE));
    }
}
