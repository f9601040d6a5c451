//! Conversion between execution form and delta form
//!
//! Delta form stores selected offsets as differences from the previous
//! value of the same kind, which compresses and diffs better. The rewrite is
//! in place and exactly reversible:
//!
//! | Step | Field | Width |
//! |------|-------|-------|
//! | 1 | string-ID instruction operands, per function | operand width |
//! | 2 | `offset` and `info_offset` of small function headers | 25 / 32 bits |
//! | 3 | small string entry offsets, overflow entry offsets | 23 / 32 bits |
//! | 4 | magic and footer hash | |
//!
//! Converting to delta runs 1, 2, 3. Converting back runs 3, 2, 1, because
//! step 1 needs absolute function offsets.

use crate::error::{BytecodeError, Result};
use crate::format::{
    BytecodeForm, FileHeader, FileLayout, FunctionHeader, HASH_SIZE, SMALL_HEADER_SIZE,
    SMALL_STRING_MAX_OFFSET, SmallFuncHeader, SmallStringTableEntry, le_u32, put_u32,
};
use crate::hash::update_hash;
use crate::opcode::{InstructionIter, OperandType, read_operand, write_uint_operand};
use crate::opcode::Operand;
use crate::provider::sanity_check;

const FUNCTION_OFFSET_MASK: u32 = 0x01FF_FFFF;

/// Position and width of one string-ID operand.
type StringSite = (u32, OperandType);

/// Rewrites `buffer` into `target` form. Converting to the current form is a
/// no-op.
///
/// All validation happens before the first write, so a failed conversion
/// leaves the buffer untouched.
pub fn convert_bytecode_form(buffer: &mut [u8], target: BytecodeForm) -> Result<()> {
    let header = FileHeader::read(buffer)?;
    let current =
        BytecodeForm::from_magic(header.magic).ok_or(BytecodeError::InvalidMagic(header.magic))?;
    if current == target {
        return Ok(());
    }
    let (header, layout) = sanity_check(buffer, current)?;
    let bodies = function_bodies(buffer, &header, &layout, current)?;
    let sites = string_operand_sites(buffer, &bodies)?;

    let to_delta = target == BytecodeForm::Delta;
    if to_delta {
        convert_string_operands(buffer, &sites, true)?;
        convert_function_headers(buffer, &header, &layout, true)?;
        convert_string_table(buffer, &header, &layout, true)?;
    } else {
        convert_string_table(buffer, &header, &layout, false)?;
        convert_function_headers(buffer, &header, &layout, false)?;
        convert_string_operands(buffer, &sites, false)?;
    }

    FileHeader::write_magic(buffer, target.magic())?;
    update_hash(buffer)?;

    tracing::debug!(
        target: "otter::hbc",
        from = ?current,
        to = ?target,
        string_operands = sites.iter().map(Vec::len).sum::<usize>(),
        "bytecode form converted"
    );
    Ok(())
}

/// Absolute `(offset, size)` of every function body in `form`.
fn function_bodies(
    buffer: &[u8],
    header: &FileHeader,
    layout: &FileLayout,
    form: BytecodeForm,
) -> Result<Vec<(usize, usize)>> {
    let end = header.file_length as usize - HASH_SIZE;
    let mut prev = 0u32;
    let mut bodies = Vec::with_capacity(header.function_count as usize);
    for id in 0..header.function_count as usize {
        let small = SmallFuncHeader::read(buffer, layout.function_headers.start + id * SMALL_HEADER_SIZE)?;
        let (offset, size) = if small.is_overflowed() {
            let large = FunctionHeader::read_large(buffer, small.large_header_offset() as usize)?;
            (large.offset, large.bytecode_size)
        } else {
            let offset = match form {
                BytecodeForm::Execution => small.offset(),
                BytecodeForm::Delta => prev.wrapping_add(small.offset()) & FUNCTION_OFFSET_MASK,
            };
            prev = offset;
            (offset, small.bytecode_size())
        };
        let (offset, size) = (offset as usize, size as usize);
        if offset + size > end {
            return Err(BytecodeError::Truncated("function body"));
        }
        bodies.push((offset, size));
    }
    Ok(bodies)
}

fn string_operand_sites(buffer: &[u8], bodies: &[(usize, usize)]) -> Result<Vec<Vec<StringSite>>> {
    bodies
        .iter()
        .map(|&(offset, size)| {
            let code = &buffer[offset..offset + size];
            let mut sites = Vec::new();
            for inst in InstructionIter::new(code) {
                let inst = inst?;
                for &index in inst.opcode.string_operands() {
                    let ty = inst.opcode.operand_types()[index];
                    let pos = offset as u32 + inst.offset + inst.opcode.operand_offset(index);
                    sites.push((pos, ty));
                }
            }
            Ok(sites)
        })
        .collect()
}

fn width_mask(ty: OperandType) -> u32 {
    match ty.size() {
        1 => 0xFF,
        2 => 0xFFFF,
        _ => u32::MAX,
    }
}

fn convert_string_operands(buffer: &mut [u8], sites: &[Vec<StringSite>], to_delta: bool) -> Result<()> {
    for function_sites in sites {
        let mut prev = 0u32;
        for &(pos, ty) in function_sites {
            let Operand::UInt(stored) = read_operand(buffer, pos, ty)? else {
                return Err(BytecodeError::OperandMismatch {
                    opcode: "string operand",
                    index: 0,
                });
            };
            let mask = width_mask(ty);
            let (written, absolute) = if to_delta {
                (stored.wrapping_sub(prev) & mask, stored)
            } else {
                let absolute = prev.wrapping_add(stored) & mask;
                (absolute, absolute)
            };
            write_uint_operand(buffer, pos, ty, written)?;
            prev = absolute;
        }
    }
    Ok(())
}

fn convert_function_headers(
    buffer: &mut [u8],
    header: &FileHeader,
    layout: &FileLayout,
    to_delta: bool,
) -> Result<()> {
    let (mut prev_offset, mut prev_info) = (0u32, 0u32);
    for id in 0..header.function_count as usize {
        let at = layout.function_headers.start + id * SMALL_HEADER_SIZE;
        let mut small = SmallFuncHeader::read(buffer, at)?;
        if small.is_overflowed() {
            continue;
        }
        let (offset, info) = (small.offset(), small.info_offset());
        let (abs_offset, abs_info) = if to_delta {
            small.set_offset(offset.wrapping_sub(prev_offset) & FUNCTION_OFFSET_MASK);
            small.set_info_offset(info.wrapping_sub(prev_info));
            (offset, info)
        } else {
            let abs = (
                prev_offset.wrapping_add(offset) & FUNCTION_OFFSET_MASK,
                prev_info.wrapping_add(info),
            );
            small.set_offset(abs.0);
            small.set_info_offset(abs.1);
            abs
        };
        prev_offset = abs_offset;
        prev_info = abs_info;
        buffer[at..at + SMALL_HEADER_SIZE].copy_from_slice(&small.to_bytes());
    }
    Ok(())
}

fn convert_string_table(
    buffer: &mut [u8],
    header: &FileHeader,
    layout: &FileLayout,
    to_delta: bool,
) -> Result<()> {
    let mut prev = 0u32;
    for id in 0..header.string_count as usize {
        let at = layout.small_string_table.start + id * 4;
        let entry = SmallStringTableEntry(le_u32(buffer, at).ok_or(BytecodeError::Truncated("string table"))?);
        if entry.is_overflowed() {
            continue;
        }
        let stored = entry.offset();
        let (written, absolute) = if to_delta {
            (stored.wrapping_sub(prev) & SMALL_STRING_MAX_OFFSET, stored)
        } else {
            let absolute = prev.wrapping_add(stored) & SMALL_STRING_MAX_OFFSET;
            (absolute, absolute)
        };
        put_u32(buffer, at, entry.with_offset(written).0)?;
        prev = absolute;
    }

    let mut prev = 0u32;
    for id in 0..header.overflow_string_count as usize {
        let at = layout.overflow_string_table.start + id * 8;
        let stored = le_u32(buffer, at).ok_or(BytecodeError::Truncated("overflow string table"))?;
        let (written, absolute) = if to_delta {
            (stored.wrapping_sub(prev), stored)
        } else {
            let absolute = prev.wrapping_add(stored);
            (absolute, absolute)
        };
        put_u32(buffer, at, written)?;
        prev = absolute;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{DELTA_MAGIC, MAGIC};

    #[test]
    fn rejects_unknown_magic() {
        let mut buf = vec![0u8; 256];
        assert!(matches!(
            convert_bytecode_form(&mut buf, BytecodeForm::Delta),
            Err(BytecodeError::InvalidMagic(0))
        ));
    }

    #[test]
    fn same_form_is_a_no_op() {
        let mut buf = vec![0u8; 256];
        buf[..8].copy_from_slice(&MAGIC.to_le_bytes());
        let before = buf.clone();
        convert_bytecode_form(&mut buf, BytecodeForm::Execution).unwrap();
        assert_eq!(buf, before);

        buf[..8].copy_from_slice(&DELTA_MAGIC.to_le_bytes());
        convert_bytecode_form(&mut buf, BytecodeForm::Delta).unwrap();
    }

    #[test]
    fn failed_validation_leaves_buffer_untouched() {
        let mut buf = vec![0u8; 256];
        buf[..8].copy_from_slice(&MAGIC.to_le_bytes());
        let before = buf.clone();
        assert!(convert_bytecode_form(&mut buf, BytecodeForm::Delta).is_err());
        assert_eq!(buf, before);
    }

    #[test]
    fn operand_widths() {
        assert_eq!(width_mask(OperandType::UInt16), 0xFFFF);
        assert_eq!(width_mask(OperandType::UInt32), u32::MAX);
        assert_eq!(width_mask(OperandType::UInt8), 0xFF);
    }
}
