//! NaN-boxed value layout shared by emitted code and runtime helpers.
//!
//! Numbers are stored as raw `f64` bits. Every other value lives in the
//! quiet-NaN space above `0xFFF9_0000_0000_0000`, tagged by its top 16 bits:
//!
//! | Tag | Kind |
//! |-----|------|
//! | `0xFFF9` | empty (no value, "nothing thrown") |
//! | `0xFFFA` | undefined (payload 0) and null (payload 1) |
//! | `0xFFFB` | bool, value in bit 0 |
//! | `0xFFFC` | symbol |
//! | `0xFFFD` | bigint |
//! | `0xFFFE` | string |
//! | `0xFFFF` | object |
//!
//! Because every non-number is a NaN, a single `fcmp` of two operands sets
//! the unordered flag whenever either operand is not a number. Real NaN
//! results are canonicalized to [`CANONICAL_NAN`] so they never collide with
//! a tag.

/// Number of payload bits under a tag.
pub const TAG_SHIFT: u32 = 48;

/// Tag of the empty value.
pub const TAG_EMPTY: u16 = 0xFFF9;
/// Tag of undefined and null.
pub const TAG_UNDEFINED_NULL: u16 = 0xFFFA;
/// Tag of booleans.
pub const TAG_BOOL: u16 = 0xFFFB;
/// Tag of symbols.
pub const TAG_SYMBOL: u16 = 0xFFFC;
/// Tag of bigints.
pub const TAG_BIGINT: u16 = 0xFFFD;
/// Tag of strings.
pub const TAG_STRING: u16 = 0xFFFE;
/// Tag of objects.
pub const TAG_OBJECT: u16 = 0xFFFF;

/// `empty`
pub const EMPTY: u64 = (TAG_EMPTY as u64) << TAG_SHIFT;
/// `undefined`
pub const UNDEFINED: u64 = (TAG_UNDEFINED_NULL as u64) << TAG_SHIFT;
/// `null`
pub const NULL: u64 = UNDEFINED | 1;
/// `false`
pub const FALSE: u64 = (TAG_BOOL as u64) << TAG_SHIFT;
/// `true`
pub const TRUE: u64 = FALSE | 1;
/// The one NaN bit pattern numbers may carry.
pub const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Lowest bit pattern that is a tagged non-number.
const FIRST_TAGGED: u64 = EMPTY;

/// Boxes a number, canonicalizing NaN.
#[inline]
pub fn encode_number(n: f64) -> u64 {
    if n.is_nan() { CANONICAL_NAN } else { n.to_bits() }
}

/// Boxes a bool.
#[inline]
pub const fn encode_bool(b: bool) -> u64 {
    FALSE | b as u64
}

/// Boxes a pointer-sized payload under `tag`.
#[inline]
pub const fn encode_tagged(tag: u16, payload: u64) -> u64 {
    ((tag as u64) << TAG_SHIFT) | (payload & ((1 << TAG_SHIFT) - 1))
}

/// Top 16 bits.
#[inline]
pub const fn tag_of(bits: u64) -> u16 {
    (bits >> TAG_SHIFT) as u16
}

/// Decoded view of a boxed value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Raw double.
    Number(f64),
    /// Nothing.
    Empty,
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// `true` / `false`
    Bool(bool),
    /// Heap or symbol value, kept as its tag and payload.
    Tagged {
        /// Top 16 bits.
        tag: u16,
        /// Low 48 bits.
        payload: u64,
    },
}

impl Value {
    /// Decodes raw bits.
    pub fn from_bits(bits: u64) -> Self {
        if bits < FIRST_TAGGED {
            return Value::Number(f64::from_bits(bits));
        }
        match tag_of(bits) {
            TAG_EMPTY => Value::Empty,
            TAG_UNDEFINED_NULL if bits & 1 == 0 => Value::Undefined,
            TAG_UNDEFINED_NULL => Value::Null,
            TAG_BOOL => Value::Bool(bits & 1 != 0),
            tag => Value::Tagged {
                tag,
                payload: bits & ((1 << TAG_SHIFT) - 1),
            },
        }
    }

    /// Encodes back to raw bits.
    pub fn to_bits(self) -> u64 {
        match self {
            Value::Number(n) => encode_number(n),
            Value::Empty => EMPTY,
            Value::Undefined => UNDEFINED,
            Value::Null => NULL,
            Value::Bool(b) => encode_bool(b),
            Value::Tagged { tag, payload } => encode_tagged(tag, payload),
        }
    }
}

/// Whether the bits are a number.
#[inline]
pub const fn is_number(bits: u64) -> bool {
    bits < FIRST_TAGGED
}

/// ECMAScript ToNumber over the primitive kinds. Heap values, which this
/// layer cannot inspect, convert to NaN.
pub fn to_number(bits: u64) -> f64 {
    match Value::from_bits(bits) {
        Value::Number(n) => n,
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(b)),
        _ => f64::NAN,
    }
}

/// ECMAScript ToBoolean. Heap values are truthy.
pub fn to_boolean(bits: u64) -> bool {
    match Value::from_bits(bits) {
        Value::Number(n) => n != 0.0 && !n.is_nan(),
        Value::Empty | Value::Undefined | Value::Null => false,
        Value::Bool(b) => b,
        Value::Tagged { .. } => true,
    }
}

/// ECMAScript ToInt32.
pub fn to_int32(n: f64) -> i32 {
    to_uint32(n) as i32
}

/// ECMAScript ToUint32.
pub fn to_uint32(n: f64) -> u32 {
    if !n.is_finite() {
        return 0;
    }
    let t = n.trunc();
    if t.abs() < 4_294_967_296.0 {
        return (t as i64) as u32;
    }
    t.rem_euclid(4_294_967_296.0) as u32
}

/// `===`
pub fn strict_equals(a: u64, b: u64) -> bool {
    match (Value::from_bits(a), Value::from_bits(b)) {
        (Value::Number(x), Value::Number(y)) => x == y,
        _ => a == b,
    }
}

/// `==` over the primitive kinds.
pub fn loose_equals(a: u64, b: u64) -> bool {
    use Value::*;
    match (Value::from_bits(a), Value::from_bits(b)) {
        (Undefined | Null, Undefined | Null) => true,
        (Undefined | Null, _) | (_, Undefined | Null) => false,
        (Number(_) | Bool(_), Number(_) | Bool(_)) => to_number(a) == to_number(b),
        _ => a == b,
    }
}

/// Abstract relational comparison `a < b`. `None` is the "undefined" result
/// produced when an operand is NaN.
pub fn less_than(a: u64, b: u64) -> Option<bool> {
    let (x, y) = (to_number(a), to_number(b));
    if x.is_nan() || y.is_nan() {
        None
    } else {
        Some(x < y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_are_nans() {
        for bits in [EMPTY, UNDEFINED, NULL, FALSE, TRUE, encode_tagged(TAG_OBJECT, 0x1234)] {
            assert!(f64::from_bits(bits).is_nan(), "{bits:#x}");
            assert!(!is_number(bits));
        }
        assert!(is_number(CANONICAL_NAN));
        assert!(is_number((-1.5f64).to_bits()));
        assert!(is_number(f64::NEG_INFINITY.to_bits()));
    }

    #[test]
    fn decode() {
        assert_eq!(Value::from_bits(UNDEFINED), Value::Undefined);
        assert_eq!(Value::from_bits(NULL), Value::Null);
        assert_eq!(Value::from_bits(TRUE), Value::Bool(true));
        assert_eq!(Value::from_bits(EMPTY), Value::Empty);
        assert_eq!(Value::from_bits(2.5f64.to_bits()), Value::Number(2.5));
        assert_eq!(
            Value::from_bits(encode_tagged(TAG_STRING, 7)),
            Value::Tagged {
                tag: TAG_STRING,
                payload: 7
            }
        );
        assert_eq!(encode_number(f64::NAN), CANONICAL_NAN);
        assert_eq!(Value::Bool(false).to_bits(), FALSE);
    }

    #[test]
    fn conversions() {
        assert_eq!(to_number(TRUE), 1.0);
        assert_eq!(to_number(NULL), 0.0);
        assert!(to_number(UNDEFINED).is_nan());
        assert!(!to_boolean(encode_number(0.0)));
        assert!(!to_boolean(CANONICAL_NAN));
        assert!(to_boolean(encode_tagged(TAG_OBJECT, 1)));
        assert_eq!(to_int32(4_294_967_297.0), 1);
        assert_eq!(to_int32(-1.9), -1);
        assert_eq!(to_uint32(-1.0), u32::MAX);
        assert_eq!(to_int32(f64::INFINITY), 0);
        assert_eq!(to_int32(2_147_483_648.0), i32::MIN);
    }

    #[test]
    fn equality() {
        assert!(loose_equals(UNDEFINED, NULL));
        assert!(!strict_equals(UNDEFINED, NULL));
        assert!(loose_equals(TRUE, encode_number(1.0)));
        assert!(!strict_equals(CANONICAL_NAN, CANONICAL_NAN));
        assert!(strict_equals(encode_number(0.0), encode_number(-0.0)));
        assert_eq!(less_than(encode_number(1.0), UNDEFINED), None);
        assert_eq!(less_than(FALSE, TRUE), Some(true));
    }
}
