//! Instruction set and the canonical instruction decoder.
//!
//! Every consumer that walks an instruction stream (block discovery, the JIT
//! emitter, the form converter) goes through [`decode_instruction`], so they
//! always agree on instruction boundaries.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::error::{BytecodeError, Result};

/// Operand encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperandType {
    /// 8-bit frame register
    Reg8,
    /// 32-bit frame register
    Reg32,
    /// Unsigned 8-bit immediate
    UInt8,
    /// Unsigned 16-bit immediate
    UInt16,
    /// Unsigned 32-bit immediate
    UInt32,
    /// Signed 8-bit branch displacement
    Addr8,
    /// Signed 32-bit branch displacement
    Addr32,
    /// Signed 32-bit immediate
    Imm32,
    /// IEEE-754 double
    Double,
}

impl OperandType {
    /// Encoded width in bytes.
    pub const fn size(self) -> u32 {
        match self {
            Self::Reg8 | Self::UInt8 | Self::Addr8 => 1,
            Self::UInt16 => 2,
            Self::Reg32 | Self::UInt32 | Self::Addr32 | Self::Imm32 => 4,
            Self::Double => 8,
        }
    }

    /// Whether this operand is a branch displacement.
    pub const fn is_branch(self) -> bool {
        matches!(self, Self::Addr8 | Self::Addr32)
    }
}

macro_rules! define_opcodes {
    ($(
        $(#[$doc:meta])*
        $name:ident => [$($operand:ident),*] $(strings [$($s:literal),*])?;
    )*) => {
        /// Bytecode opcodes.
        ///
        /// Discriminants are assigned in declaration order and are part of
        /// the binary format.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[repr(u8)]
        pub enum Opcode {
            $($(#[$doc])* $name,)*
        }

        impl Opcode {
            /// Every opcode, indexed by its encoding.
            pub const ALL: &'static [Opcode] = &[$(Opcode::$name,)*];

            /// Operand types in encoding order.
            pub const fn operand_types(self) -> &'static [OperandType] {
                match self {
                    $(Opcode::$name => &[$(OperandType::$operand),*],)*
                }
            }

            /// Positions of operands that hold string-table IDs.
            pub const fn string_operands(self) -> &'static [usize] {
                match self {
                    $(Opcode::$name => &[$($($s),*)?],)*
                }
            }

            /// Mnemonic.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Opcode::$name => stringify!($name),)*
                }
            }
        }
    };
}

define_opcodes! {
    // ==================== Misc ====================
    /// Trap: control must never reach here
    Unreachable => [];
    /// dst = src
    Mov => [Reg8, Reg8];
    /// dst = src (wide registers)
    MovLong => [Reg32, Reg32];
    /// dst = param[idx], undefined when idx >= argc (0 is `this`)
    LoadParam => [Reg8, UInt8];
    /// Wide parameter index
    LoadParamLong => [Reg8, UInt32];

    // ==================== Constants ====================
    /// dst = undefined
    LoadConstUndefined => [Reg8];
    /// dst = null
    LoadConstNull => [Reg8];
    /// dst = true
    LoadConstTrue => [Reg8];
    /// dst = false
    LoadConstFalse => [Reg8];
    /// dst = +0
    LoadConstZero => [Reg8];
    /// dst = imm8
    LoadConstUInt8 => [Reg8, UInt8];
    /// dst = imm32
    LoadConstInt => [Reg8, Imm32];
    /// dst = f64
    LoadConstDouble => [Reg8, Double];
    /// dst = strings[id]
    LoadConstString => [Reg8, UInt16] strings [1];
    /// dst = strings[id] (wide id)
    LoadConstStringLongIndex => [Reg8, UInt32] strings [1];
    /// dst = bigints[id]
    LoadConstBigInt => [Reg8, UInt16];
    /// dst = bigints[id] (wide id)
    LoadConstBigIntLongIndex => [Reg8, UInt32];
    /// dst = new RegExp(pattern, flags) using compiled regexp `idx`
    CreateRegExp => [Reg8, UInt32, UInt32, UInt32] strings [1, 2];

    // ==================== Arithmetic ====================
    /// dst = lhs + rhs
    Add => [Reg8, Reg8, Reg8];
    /// dst = lhs + rhs, operands known to be numbers
    AddN => [Reg8, Reg8, Reg8];
    /// dst = lhs - rhs
    Sub => [Reg8, Reg8, Reg8];
    /// Number-only subtraction
    SubN => [Reg8, Reg8, Reg8];
    /// dst = lhs * rhs
    Mul => [Reg8, Reg8, Reg8];
    /// Number-only multiplication
    MulN => [Reg8, Reg8, Reg8];
    /// dst = lhs / rhs
    Div => [Reg8, Reg8, Reg8];
    /// Number-only division
    DivN => [Reg8, Reg8, Reg8];
    /// dst = lhs % rhs
    Mod => [Reg8, Reg8, Reg8];

    // ==================== Bitwise ====================
    /// dst = lhs & rhs
    BitAnd => [Reg8, Reg8, Reg8];
    /// dst = lhs | rhs
    BitOr => [Reg8, Reg8, Reg8];
    /// dst = lhs ^ rhs
    BitXor => [Reg8, Reg8, Reg8];
    /// dst = lhs << rhs
    LShift => [Reg8, Reg8, Reg8];
    /// dst = lhs >> rhs
    RShift => [Reg8, Reg8, Reg8];
    /// dst = lhs >>> rhs
    URshift => [Reg8, Reg8, Reg8];

    // ==================== Unary ====================
    /// dst = -src
    Negate => [Reg8, Reg8];
    /// dst = !src
    Not => [Reg8, Reg8];
    /// dst = ~src
    BitNot => [Reg8, Reg8];
    /// dst = src + 1
    Inc => [Reg8, Reg8];
    /// dst = src - 1
    Dec => [Reg8, Reg8];
    /// dst = ToNumber(src)
    ToNumber => [Reg8, Reg8];

    // ==================== Comparison ====================
    /// dst = lhs < rhs
    Less => [Reg8, Reg8, Reg8];
    /// dst = lhs <= rhs
    LessEq => [Reg8, Reg8, Reg8];
    /// dst = lhs > rhs
    Greater => [Reg8, Reg8, Reg8];
    /// dst = lhs >= rhs
    GreaterEq => [Reg8, Reg8, Reg8];
    /// dst = lhs == rhs
    Eq => [Reg8, Reg8, Reg8];
    /// dst = lhs != rhs
    Neq => [Reg8, Reg8, Reg8];
    /// dst = lhs === rhs
    StrictEq => [Reg8, Reg8, Reg8];
    /// dst = lhs !== rhs
    StrictNeq => [Reg8, Reg8, Reg8];

    // ==================== Control flow ====================
    /// Unconditional jump
    Jmp => [Addr8];
    /// Unconditional jump, wide displacement
    JmpLong => [Addr32];
    /// Jump if ToBoolean(src)
    JmpTrue => [Addr8, Reg8];
    /// Wide JmpTrue
    JmpTrueLong => [Addr32, Reg8];
    /// Jump if !ToBoolean(src)
    JmpFalse => [Addr8, Reg8];
    /// Wide JmpFalse
    JmpFalseLong => [Addr32, Reg8];
    /// Jump if src === undefined
    JmpUndefined => [Addr8, Reg8];
    /// Wide JmpUndefined
    JmpUndefinedLong => [Addr32, Reg8];
    /// Jump if lhs < rhs
    JLess => [Addr8, Reg8, Reg8];
    /// Wide JLess
    JLessLong => [Addr32, Reg8, Reg8];
    /// Jump if !(lhs < rhs)
    JNotLess => [Addr8, Reg8, Reg8];
    /// Wide JNotLess
    JNotLessLong => [Addr32, Reg8, Reg8];
    /// Jump if lhs <= rhs
    JLessEqual => [Addr8, Reg8, Reg8];
    /// Wide JLessEqual
    JLessEqualLong => [Addr32, Reg8, Reg8];
    /// Jump if !(lhs <= rhs)
    JNotLessEqual => [Addr8, Reg8, Reg8];
    /// Wide JNotLessEqual
    JNotLessEqualLong => [Addr32, Reg8, Reg8];
    /// Jump if lhs > rhs
    JGreater => [Addr8, Reg8, Reg8];
    /// Wide JGreater
    JGreaterLong => [Addr32, Reg8, Reg8];
    /// Jump if !(lhs > rhs)
    JNotGreater => [Addr8, Reg8, Reg8];
    /// Wide JNotGreater
    JNotGreaterLong => [Addr32, Reg8, Reg8];
    /// Jump if lhs >= rhs
    JGreaterEqual => [Addr8, Reg8, Reg8];
    /// Wide JGreaterEqual
    JGreaterEqualLong => [Addr32, Reg8, Reg8];
    /// Jump if !(lhs >= rhs)
    JNotGreaterEqual => [Addr8, Reg8, Reg8];
    /// Wide JNotGreaterEqual
    JNotGreaterEqualLong => [Addr32, Reg8, Reg8];
    /// Jump if lhs == rhs
    JEqual => [Addr8, Reg8, Reg8];
    /// Wide JEqual
    JEqualLong => [Addr32, Reg8, Reg8];
    /// Jump if lhs != rhs
    JNotEqual => [Addr8, Reg8, Reg8];
    /// Wide JNotEqual
    JNotEqualLong => [Addr32, Reg8, Reg8];
    /// Jump if lhs === rhs
    JStrictEqual => [Addr8, Reg8, Reg8];
    /// Wide JStrictEqual
    JStrictEqualLong => [Addr32, Reg8, Reg8];
    /// Jump if lhs !== rhs
    JStrictNotEqual => [Addr8, Reg8, Reg8];
    /// Wide JStrictNotEqual
    JStrictNotEqualLong => [Addr32, Reg8, Reg8];
    /// Multi-way branch on an integer in [min, max] through an inline jump table
    SwitchImm => [Reg8, UInt32, Addr32, UInt32, UInt32];

    // ==================== Calls ====================
    /// dst = callee(args in the last argc frame registers)
    Call => [Reg8, Reg8, UInt8];
    /// Wide argument count
    CallLong => [Reg8, Reg8, UInt32];
    /// Return src
    Ret => [Reg8];

    // ==================== Exceptions ====================
    /// dst = thrown value; clears it. Always starts a block.
    Catch => [Reg8];
    /// Throw src
    Throw => [Reg8];

    // ==================== Objects ====================
    /// dst = {}
    NewObject => [Reg8];
    /// dst = obj[strings[id]]
    GetById => [Reg8, Reg8, UInt8, UInt16] strings [3];
    /// obj[strings[id]] = src
    PutById => [Reg8, Reg8, UInt8, UInt16] strings [3];
    /// dst = obj[key]
    GetByVal => [Reg8, Reg8, Reg8];
    /// obj[key] = src
    PutByVal => [Reg8, Reg8, Reg8];

    // ==================== Runtime hooks ====================
    /// Debugger statement
    Debugger => [];
    /// Interrupt/async break check
    AsyncBreakCheck => [];
    /// Basic-block profiling point
    ProfilePoint => [UInt16];
}

impl Opcode {
    /// Decode an opcode byte.
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        Self::ALL.get(byte as usize).copied()
    }

    /// Encoded size of the instruction, excluding any inline jump table.
    pub const fn size(self) -> u32 {
        let types = self.operand_types();
        let mut size = 1;
        let mut i = 0;
        while i < types.len() {
            size += types[i].size();
            i += 1;
        }
        size
    }

    /// Byte position of operand `index`, relative to the opcode byte.
    pub fn operand_offset(self, index: usize) -> u32 {
        1 + self.operand_types()[..index]
            .iter()
            .map(|ty| ty.size())
            .sum::<u32>()
    }

    /// Whether the instruction carries a branch displacement.
    pub fn has_branch_operand(self) -> bool {
        self.operand_types().iter().any(|ty| ty.is_branch())
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded operand value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// Frame register index
    Reg(u32),
    /// Unsigned immediate of any width
    UInt(u32),
    /// Branch displacement relative to the instruction start
    Addr(i32),
    /// Signed immediate
    Imm(i32),
    /// Double immediate
    Double(f64),
}

impl Operand {
    fn fits(self, ty: OperandType) -> bool {
        match (self, ty) {
            (Operand::Reg(v), OperandType::Reg8) | (Operand::UInt(v), OperandType::UInt8) => {
                v <= u8::MAX as u32
            }
            (Operand::UInt(v), OperandType::UInt16) => v <= u16::MAX as u32,
            (Operand::Reg(_), OperandType::Reg32) | (Operand::UInt(_), OperandType::UInt32) => true,
            (Operand::Addr(v), OperandType::Addr8) => i8::try_from(v).is_ok(),
            (Operand::Addr(_), OperandType::Addr32)
            | (Operand::Imm(_), OperandType::Imm32)
            | (Operand::Double(_), OperandType::Double) => true,
            _ => false,
        }
    }
}

/// Rounds `offset` up to the next multiple of four.
#[inline]
pub const fn align4(offset: u32) -> u32 {
    (offset + 3) & !3
}

/// [`align4`] that reports overflow instead of wrapping.
pub const fn checked_align4(offset: u32) -> Option<u32> {
    match offset.checked_add(3) {
        Some(v) => Some(v & !3),
        None => None,
    }
}

/// Inline jump table of a `SwitchImm`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchTable {
    /// Smallest handled value
    pub min: u32,
    /// Largest handled value (inclusive)
    pub max: u32,
    /// Absolute offset of the default target
    pub default_target: u32,
    /// Absolute offsets for values `min..=max`
    pub targets: Vec<u32>,
    /// Absolute offset of the first table entry
    pub table_start: u32,
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Opcode
    pub opcode: Opcode,
    /// Offset of the opcode byte within the function
    pub offset: u32,
    /// Operands in encoding order
    pub operands: SmallVec<[Operand; 5]>,
    /// Offset of the following instruction (past any inline jump table)
    pub next_offset: u32,
}

impl Instruction {
    /// Encoded size, excluding any inline jump table.
    #[inline]
    pub fn size(&self) -> u32 {
        self.opcode.size()
    }

    /// Register operand at `index`.
    pub fn reg(&self, index: usize) -> u32 {
        match self.operands.get(index) {
            Some(Operand::Reg(r)) => *r,
            other => {
                debug_assert!(false, "{} operand {index} is {other:?}", self.opcode);
                0
            }
        }
    }

    /// Unsigned operand at `index`.
    pub fn uint(&self, index: usize) -> u32 {
        match self.operands.get(index) {
            Some(Operand::UInt(v)) => *v,
            other => {
                debug_assert!(false, "{} operand {index} is {other:?}", self.opcode);
                0
            }
        }
    }

    /// Signed immediate at `index`.
    pub fn imm(&self, index: usize) -> i32 {
        match self.operands.get(index) {
            Some(Operand::Imm(v)) => *v,
            other => {
                debug_assert!(false, "{} operand {index} is {other:?}", self.opcode);
                0
            }
        }
    }

    /// Double immediate at `index`.
    pub fn double(&self, index: usize) -> f64 {
        match self.operands.get(index) {
            Some(Operand::Double(v)) => *v,
            other => {
                debug_assert!(false, "{} operand {index} is {other:?}", self.opcode);
                0.0
            }
        }
    }

    /// Absolute target of the branch operand at `index`.
    pub fn branch_target(&self, index: usize) -> u32 {
        match self.operands.get(index) {
            Some(Operand::Addr(d)) => (self.offset as i64 + *d as i64) as u32,
            other => {
                debug_assert!(false, "{} operand {index} is {other:?}", self.opcode);
                self.offset
            }
        }
    }

    /// Absolute targets of every branch operand.
    pub fn branch_targets(&self) -> impl Iterator<Item = u32> + '_ {
        self.operands
            .iter()
            .filter_map(move |op| match op {
                Operand::Addr(d) => Some((self.offset as i64 + *d as i64) as u32),
                _ => None,
            })
    }

    /// Reads the inline jump table of a `SwitchImm`.
    pub fn switch_table(&self, code: &[u8]) -> Result<Option<SwitchTable>> {
        if self.opcode != Opcode::SwitchImm {
            return Ok(None);
        }
        let (table_start, count) = switch_table_bounds(self.offset, self.uint(1), self.uint(3), self.uint(4))?;
        let mut targets = Vec::with_capacity(count as usize);
        for i in 0..count {
            let at = table_start + i * 4;
            let rel = read_u32(code, at)? as i32;
            targets.push((self.offset as i64 + rel as i64) as u32);
        }
        Ok(Some(SwitchTable {
            min: self.uint(3),
            max: self.uint(4),
            default_target: self.branch_target(2),
            targets,
            table_start,
        }))
    }
}

fn switch_table_bounds(offset: u32, table_offset: u32, min: u32, max: u32) -> Result<(u32, u32)> {
    if max < min {
        return Err(BytecodeError::OperandMismatch {
            opcode: Opcode::SwitchImm.name(),
            index: 4,
        });
    }
    let mismatch = |index| BytecodeError::OperandMismatch {
        opcode: Opcode::SwitchImm.name(),
        index,
    };
    let start = offset
        .checked_add(table_offset)
        .and_then(checked_align4)
        .ok_or(mismatch(1))?;
    let count = (max - min).checked_add(1).ok_or(mismatch(4))?;
    Ok((start, count))
}

fn read_u32(code: &[u8], at: u32) -> Result<u32> {
    let at_usize = at as usize;
    code.get(at_usize..at_usize + 4)
        .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or(BytecodeError::UnexpectedEnd { offset: at })
}

/// Reads one operand of type `ty` at byte position `at`.
pub fn read_operand(code: &[u8], at: u32, ty: OperandType) -> Result<Operand> {
    let start = at as usize;
    let bytes = code
        .get(start..start + ty.size() as usize)
        .ok_or(BytecodeError::UnexpectedEnd { offset: at })?;
    Ok(match ty {
        OperandType::Reg8 => Operand::Reg(bytes[0] as u32),
        OperandType::UInt8 => Operand::UInt(bytes[0] as u32),
        OperandType::Addr8 => Operand::Addr(bytes[0] as i8 as i32),
        OperandType::UInt16 => Operand::UInt(u16::from_le_bytes([bytes[0], bytes[1]]) as u32),
        OperandType::Reg32 => Operand::Reg(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        OperandType::UInt32 => Operand::UInt(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        OperandType::Addr32 => Operand::Addr(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        OperandType::Imm32 => Operand::Imm(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        OperandType::Double => {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            Operand::Double(f64::from_le_bytes(raw))
        }
    })
}

/// Writes `value` into an operand slot of type `ty` at byte position `at`.
///
/// Unsigned values are truncated to the slot width.
pub fn write_uint_operand(code: &mut [u8], at: u32, ty: OperandType, value: u32) -> Result<()> {
    let start = at as usize;
    let width = ty.size() as usize;
    let slot = code
        .get_mut(start..start + width)
        .ok_or(BytecodeError::UnexpectedEnd { offset: at })?;
    match ty {
        OperandType::Reg8 | OperandType::UInt8 => slot[0] = value as u8,
        OperandType::UInt16 => slot.copy_from_slice(&(value as u16).to_le_bytes()),
        OperandType::Reg32 | OperandType::UInt32 => slot.copy_from_slice(&value.to_le_bytes()),
        _ => {
            return Err(BytecodeError::OperandMismatch {
                opcode: "write_uint_operand",
                index: 0,
            });
        }
    }
    Ok(())
}

/// Decodes the instruction starting at `offset`.
pub fn decode_instruction(code: &[u8], offset: u32) -> Result<Instruction> {
    let byte = *code
        .get(offset as usize)
        .ok_or(BytecodeError::UnexpectedEnd { offset })?;
    let opcode = Opcode::from_u8(byte).ok_or(BytecodeError::InvalidOpcode { offset, byte })?;

    let mut operands = SmallVec::new();
    let mut pos = offset + 1;
    for &ty in opcode.operand_types() {
        operands.push(read_operand(code, pos, ty)?);
        pos += ty.size();
    }

    let mut inst = Instruction {
        opcode,
        offset,
        operands,
        next_offset: pos,
    };

    if opcode == Opcode::SwitchImm {
        let (start, count) = switch_table_bounds(offset, inst.uint(1), inst.uint(3), inst.uint(4))?;
        let end = count
            .checked_mul(4)
            .and_then(|bytes| start.checked_add(bytes))
            .ok_or(BytecodeError::UnexpectedEnd { offset })?;
        if start < pos || end as usize > code.len() {
            return Err(BytecodeError::UnexpectedEnd { offset: end });
        }
        inst.next_offset = end;
    }

    Ok(inst)
}

/// Appends one instruction to `out`.
pub fn encode_instruction(out: &mut Vec<u8>, opcode: Opcode, operands: &[Operand]) -> Result<()> {
    let types = opcode.operand_types();
    if types.len() != operands.len() {
        return Err(BytecodeError::OperandMismatch {
            opcode: opcode.name(),
            index: operands.len().min(types.len()),
        });
    }
    out.push(opcode as u8);
    for (index, (&op, &ty)) in operands.iter().zip(types).enumerate() {
        if !op.fits(ty) {
            return Err(BytecodeError::OperandMismatch {
                opcode: opcode.name(),
                index,
            });
        }
        match op {
            Operand::Reg(v) | Operand::UInt(v) => match ty.size() {
                1 => out.push(v as u8),
                2 => out.extend_from_slice(&(v as u16).to_le_bytes()),
                _ => out.extend_from_slice(&v.to_le_bytes()),
            },
            Operand::Addr(v) | Operand::Imm(v) => match ty.size() {
                1 => out.push(v as i8 as u8),
                _ => out.extend_from_slice(&v.to_le_bytes()),
            },
            Operand::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
        }
    }
    Ok(())
}

/// Iterator over an instruction stream.
///
/// Yields an error once and then stops if the stream is malformed.
pub struct InstructionIter<'a> {
    code: &'a [u8],
    offset: u32,
    failed: bool,
}

impl<'a> InstructionIter<'a> {
    /// Iterate over `code` from offset 0.
    pub fn new(code: &'a [u8]) -> Self {
        Self {
            code,
            offset: 0,
            failed: false,
        }
    }
}

impl Iterator for InstructionIter<'_> {
    type Item = Result<Instruction>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset as usize >= self.code.len() {
            return None;
        }
        match decode_instruction(self.code, self.offset) {
            Ok(inst) => {
                self.offset = inst.next_offset;
                Some(Ok(inst))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_bytes_round_trip() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(*op as u8 as usize, i);
            assert_eq!(Opcode::from_u8(i as u8), Some(*op));
        }
        assert_eq!(Opcode::from_u8(Opcode::ALL.len() as u8), None);
    }

    #[test]
    fn sizes_follow_operand_table() {
        assert_eq!(Opcode::Unreachable.size(), 1);
        assert_eq!(Opcode::Mov.size(), 3);
        assert_eq!(Opcode::MovLong.size(), 9);
        assert_eq!(Opcode::LoadConstDouble.size(), 10);
        assert_eq!(Opcode::JLessLong.size(), 7);
        assert_eq!(Opcode::SwitchImm.size(), 18);
        assert_eq!(Opcode::GetById.operand_offset(3), 4);
    }

    #[test]
    fn string_operand_positions() {
        assert_eq!(Opcode::LoadConstString.string_operands(), &[1]);
        assert_eq!(Opcode::CreateRegExp.string_operands(), &[1, 2]);
        assert!(Opcode::Add.string_operands().is_empty());
    }

    #[test]
    fn decode_branch_targets_are_relative_to_instruction_start() {
        let mut code = Vec::new();
        encode_instruction(&mut code, Opcode::Mov, &[Operand::Reg(1), Operand::Reg(2)]).unwrap();
        encode_instruction(
            &mut code,
            Opcode::JLess,
            &[Operand::Addr(-3), Operand::Reg(1), Operand::Reg(2)],
        )
        .unwrap();

        let insts: Vec<_> = InstructionIter::new(&code).collect::<Result<_>>().unwrap();
        assert_eq!(insts.len(), 2);
        assert_eq!(insts[1].offset, 3);
        assert_eq!(insts[1].branch_target(0), 0);
        assert_eq!(insts[1].next_offset, 7);
    }

    #[test]
    fn decode_rejects_unknown_opcode_and_truncation() {
        let err = decode_instruction(&[0xFF], 0).unwrap_err();
        assert!(matches!(err, BytecodeError::InvalidOpcode { byte: 0xFF, .. }));

        let err = decode_instruction(&[Opcode::Mov as u8, 1], 0).unwrap_err();
        assert!(matches!(err, BytecodeError::UnexpectedEnd { .. }));
    }

    #[test]
    fn full_range_switch_is_rejected() {
        let mut code = Vec::new();
        encode_instruction(
            &mut code,
            Opcode::SwitchImm,
            &[Operand::Reg(0), Operand::UInt(20), Operand::Addr(0), Operand::UInt(0), Operand::UInt(u32::MAX)],
        )
        .unwrap();
        let err = decode_instruction(&code, 0).unwrap_err();
        assert!(matches!(err, BytecodeError::OperandMismatch { index: 4, .. }));
    }

    #[test]
    fn switch_table_offset_near_u32_max_is_rejected() {
        assert_eq!(checked_align4(u32::MAX - 1), None);
        assert_eq!(checked_align4(5), Some(8));

        let mut code = Vec::new();
        encode_instruction(
            &mut code,
            Opcode::SwitchImm,
            &[Operand::Reg(0), Operand::UInt(u32::MAX - 1), Operand::Addr(0), Operand::UInt(0), Operand::UInt(1)],
        )
        .unwrap();
        let mut padded = vec![Opcode::Unreachable as u8];
        padded.extend_from_slice(&code);
        let err = decode_instruction(&padded, 1).unwrap_err();
        assert!(matches!(err, BytecodeError::OperandMismatch { index: 1, .. }));
    }

    #[test]
    fn encode_rejects_out_of_range_operands() {
        let mut out = Vec::new();
        let err = encode_instruction(&mut out, Opcode::Jmp, &[Operand::Addr(200)]).unwrap_err();
        assert!(matches!(err, BytecodeError::OperandMismatch { index: 0, .. }));
        let err = encode_instruction(&mut out, Opcode::Mov, &[Operand::Reg(1)]).unwrap_err();
        assert!(matches!(err, BytecodeError::OperandMismatch { .. }));
    }

    #[test]
    fn switch_table_follows_instruction() {
        let mut code = Vec::new();
        encode_instruction(
            &mut code,
            Opcode::SwitchImm,
            &[
                Operand::Reg(0),
                Operand::UInt(18),
                Operand::Addr(40),
                Operand::UInt(5),
                Operand::UInt(6),
            ],
        )
        .unwrap();
        // Pad to the aligned table start.
        code.resize(20, 0);
        code.extend_from_slice(&28i32.to_le_bytes());
        code.extend_from_slice(&32i32.to_le_bytes());

        let inst = decode_instruction(&code, 0).unwrap();
        assert_eq!(inst.next_offset, 28);
        let table = inst.switch_table(&code).unwrap().unwrap();
        assert_eq!(table.table_start, 20);
        assert_eq!(table.targets, vec![28, 32]);
        assert_eq!(table.default_target, 40);
    }
}
