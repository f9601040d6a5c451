//! Binary container layout
//!
//! ```text
//! +----------------------+ 0
//! | FileHeader (128)     |
//! +----------------------+
//! | small func headers   |  16 bytes each
//! | string kinds         |
//! | identifier hashes    |
//! | small string table   |
//! | overflow strings     |
//! | string storage       |
//! | literal buffers      |
//! | bigint table+storage |
//! | regexp table+storage |
//! | cjs module table     |
//! | function sources     |
//! +----------------------+ FileLayout::end
//! | bytecode bodies      |
//! | info blocks          |
//! | debug info           |
//! +----------------------+
//! | SHA-1 footer (20)    |
//! +----------------------+ file_length
//! | epilogue             |
//! +----------------------+
//! ```
//!
//! All integers are little-endian and every section starts on a 4-byte
//! boundary.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{BytecodeError, Result};

/// Magic number of execution-form bytecode.
pub const MAGIC: u64 = 0x1F19_03C1_03BC_1FC6;

/// Magic number of delta-form bytecode.
pub const DELTA_MAGIC: u64 = !MAGIC;

/// Supported bytecode version.
pub const BYTECODE_VERSION: u32 = 96;

/// Size of the file header.
pub const FILE_HEADER_SIZE: usize = 128;

/// Size of a small function header.
pub const SMALL_HEADER_SIZE: usize = 16;

/// Size of a large function header.
pub const LARGE_HEADER_SIZE: usize = 44;

/// Size of the SHA-1 footer.
pub const HASH_SIZE: usize = 20;

/// Sentinel for an absent debug offset.
pub const NO_OFFSET: u32 = u32::MAX;

/// Byte position of the options field in the file header.
const OPTIONS_POS: usize = 108;

/// Encoding of a bytecode buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BytecodeForm {
    /// Absolute offsets, directly executable
    Execution,
    /// Delta-encoded offsets, for storage and diffing
    Delta,
}

impl BytecodeForm {
    /// Magic number identifying this form.
    pub const fn magic(self) -> u64 {
        match self {
            Self::Execution => MAGIC,
            Self::Delta => DELTA_MAGIC,
        }
    }

    /// Form identified by `magic`, if any.
    pub const fn from_magic(magic: u64) -> Option<Self> {
        match magic {
            MAGIC => Some(Self::Execution),
            DELTA_MAGIC => Some(Self::Delta),
            _ => None,
        }
    }
}

bitflags! {
    /// Module-wide options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct BytecodeOptions: u8 {
        /// Builtins may be resolved statically
        const STATIC_BUILTINS = 1 << 0;
        /// CJS modules are keyed by module ID rather than filename
        const CJS_MODULES_STATICALLY_RESOLVED = 1 << 1;
        /// Module contains async functions
        const HAS_ASYNC = 1 << 2;
    }
}

// ============================================================================
// Little-endian helpers
// ============================================================================

#[inline]
pub(crate) fn le_u32(buf: &[u8], at: usize) -> Option<u32> {
    let b = buf.get(at..at.checked_add(4)?)?;
    Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

#[inline]
pub(crate) fn put_u32(buf: &mut [u8], at: usize, value: u32) -> Result<()> {
    let slot = buf
        .get_mut(at..at + 4)
        .ok_or(BytecodeError::Truncated("u32 field"))?;
    slot.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

/// Rounds `offset` up to a multiple of four.
#[inline]
pub const fn align_up(offset: usize) -> usize {
    (offset + 3) & !3
}

// ============================================================================
// File header
// ============================================================================

/// The 128-byte file header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileHeader {
    /// Form magic
    pub magic: u64,
    /// Format version
    pub version: u32,
    /// SHA-1 of the source text
    pub source_hash: [u8; 20],
    /// Length of the structured region including the footer
    pub file_length: u32,
    /// Index of the global function
    pub global_code_index: u32,
    /// Number of functions
    pub function_count: u32,
    /// Number of string-kind runs
    pub string_kind_count: u32,
    /// Number of identifier hashes
    pub identifier_count: u32,
    /// Number of strings
    pub string_count: u32,
    /// Number of overflow string entries
    pub overflow_string_count: u32,
    /// Bytes of string storage
    pub string_storage_size: u32,
    /// Number of BigInt entries
    pub big_int_count: u32,
    /// Bytes of BigInt storage
    pub big_int_storage_size: u32,
    /// Number of RegExp entries
    pub reg_exp_count: u32,
    /// Bytes of RegExp storage
    pub reg_exp_storage_size: u32,
    /// Bytes of array literal buffer
    pub array_buffer_size: u32,
    /// Bytes of object key buffer
    pub obj_key_buffer_size: u32,
    /// Bytes of object value buffer
    pub obj_value_buffer_size: u32,
    /// Segment ID for split bundles
    pub segment_id: u32,
    /// Number of CJS module entries
    pub cjs_module_count: u32,
    /// Number of function source entries
    pub function_source_count: u32,
    /// Offset of the debug-info section, 0 when absent
    pub debug_info_offset: u32,
    /// Module options
    pub options: BytecodeOptions,
}

impl FileHeader {
    /// Decodes the header at the start of `buf`.
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < FILE_HEADER_SIZE {
            return Err(BytecodeError::BufferTooSmall {
                len: buf.len(),
                needed: FILE_HEADER_SIZE,
            });
        }
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[0..8]);
        let mut source_hash = [0u8; 20];
        source_hash.copy_from_slice(&buf[12..32]);

        let mut words = [0u32; 19];
        for (i, word) in words.iter_mut().enumerate() {
            *word = le_u32(buf, 32 + i * 4).unwrap_or_default();
        }

        Ok(Self {
            magic: u64::from_le_bytes(magic),
            version: le_u32(buf, 8).unwrap_or_default(),
            source_hash,
            file_length: words[0],
            global_code_index: words[1],
            function_count: words[2],
            string_kind_count: words[3],
            identifier_count: words[4],
            string_count: words[5],
            overflow_string_count: words[6],
            string_storage_size: words[7],
            big_int_count: words[8],
            big_int_storage_size: words[9],
            reg_exp_count: words[10],
            reg_exp_storage_size: words[11],
            array_buffer_size: words[12],
            obj_key_buffer_size: words[13],
            obj_value_buffer_size: words[14],
            segment_id: words[15],
            cjs_module_count: words[16],
            function_source_count: words[17],
            debug_info_offset: words[18],
            options: BytecodeOptions::from_bits_truncate(buf[OPTIONS_POS]),
        })
    }

    /// Encodes the header.
    pub fn to_bytes(&self) -> [u8; FILE_HEADER_SIZE] {
        let mut out = [0u8; FILE_HEADER_SIZE];
        out[0..8].copy_from_slice(&self.magic.to_le_bytes());
        out[8..12].copy_from_slice(&self.version.to_le_bytes());
        out[12..32].copy_from_slice(&self.source_hash);
        let words = [
            self.file_length,
            self.global_code_index,
            self.function_count,
            self.string_kind_count,
            self.identifier_count,
            self.string_count,
            self.overflow_string_count,
            self.string_storage_size,
            self.big_int_count,
            self.big_int_storage_size,
            self.reg_exp_count,
            self.reg_exp_storage_size,
            self.array_buffer_size,
            self.obj_key_buffer_size,
            self.obj_value_buffer_size,
            self.segment_id,
            self.cjs_module_count,
            self.function_source_count,
            self.debug_info_offset,
        ];
        for (i, word) in words.iter().enumerate() {
            let at = 32 + i * 4;
            out[at..at + 4].copy_from_slice(&word.to_le_bytes());
        }
        out[OPTIONS_POS] = self.options.bits();
        out
    }

    /// Overwrites only the magic number of an encoded header.
    pub(crate) fn write_magic(buf: &mut [u8], magic: u64) -> Result<()> {
        let slot = buf
            .get_mut(0..8)
            .ok_or(BytecodeError::BufferTooSmall { len: 0, needed: 8 })?;
        slot.copy_from_slice(&magic.to_le_bytes());
        Ok(())
    }

    /// Overwrites the debug-info offset of an encoded header.
    pub(crate) fn write_debug_info_offset(buf: &mut [u8], offset: u32) -> Result<()> {
        put_u32(buf, 32 + 18 * 4, offset)
    }

    /// Compact summary for diagnostics.
    pub fn summary(&self) -> FileHeaderSummary {
        FileHeaderSummary {
            version: self.version,
            form: BytecodeForm::from_magic(self.magic),
            file_length: self.file_length,
            function_count: self.function_count,
            string_count: self.string_count,
            global_code_index: self.global_code_index,
            has_debug_info: self.debug_info_offset != 0,
            options: self.options,
            source_hash: self.source_hash.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }
}

/// Serializable digest of a [`FileHeader`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeaderSummary {
    /// Format version
    pub version: u32,
    /// Form, if the magic is recognized
    pub form: Option<BytecodeForm>,
    /// Structured length
    pub file_length: u32,
    /// Number of functions
    pub function_count: u32,
    /// Number of strings
    pub string_count: u32,
    /// Global function index
    pub global_code_index: u32,
    /// Whether a debug-info section is present
    pub has_debug_info: bool,
    /// Module options
    pub options: BytecodeOptions,
    /// Hex-encoded source hash
    pub source_hash: String,
}

// ============================================================================
// Section layout
// ============================================================================

/// Byte range of one section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Section {
    /// Start offset
    pub start: usize,
    /// Length in bytes
    pub len: usize,
}

impl Section {
    /// One past the last byte.
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// Section offsets derived from a file header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileLayout {
    /// Small function headers
    pub function_headers: Section,
    /// String kind runs
    pub string_kinds: Section,
    /// Identifier hashes
    pub identifier_hashes: Section,
    /// Small string entries
    pub small_string_table: Section,
    /// Overflow string entries
    pub overflow_string_table: Section,
    /// String bytes
    pub string_storage: Section,
    /// Array literal buffer
    pub array_buffer: Section,
    /// Object key buffer
    pub obj_key_buffer: Section,
    /// Object value buffer
    pub obj_value_buffer: Section,
    /// BigInt entries
    pub big_int_table: Section,
    /// BigInt bytes
    pub big_int_storage: Section,
    /// RegExp entries
    pub reg_exp_table: Section,
    /// RegExp bytes
    pub reg_exp_storage: Section,
    /// CJS module pairs
    pub cjs_module_table: Section,
    /// Function source pairs
    pub function_source_table: Section,
    /// End of the fixed sections
    pub end: usize,
}

impl FileLayout {
    /// Lays out the sections described by `header`.
    ///
    /// Fails if the sizes overflow the address space; bounds against the
    /// actual buffer are checked by the caller.
    pub fn compute(header: &FileHeader) -> Result<Self> {
        let mut pos = FILE_HEADER_SIZE;
        let mut next = |count: u32, elem: usize, name: &'static str| -> Result<Section> {
            let start = align_up(pos);
            let len = (count as usize)
                .checked_mul(elem)
                .ok_or(BytecodeError::Truncated(name))?;
            pos = start.checked_add(len).ok_or(BytecodeError::Truncated(name))?;
            Ok(Section { start, len })
        };

        let function_headers = next(header.function_count, SMALL_HEADER_SIZE, "function headers")?;
        let string_kinds = next(header.string_kind_count, 4, "string kinds")?;
        let identifier_hashes = next(header.identifier_count, 4, "identifier hashes")?;
        let small_string_table = next(header.string_count, 4, "string table")?;
        let overflow_string_table = next(header.overflow_string_count, 8, "overflow string table")?;
        let string_storage = next(header.string_storage_size, 1, "string storage")?;
        let array_buffer = next(header.array_buffer_size, 1, "array buffer")?;
        let obj_key_buffer = next(header.obj_key_buffer_size, 1, "object key buffer")?;
        let obj_value_buffer = next(header.obj_value_buffer_size, 1, "object value buffer")?;
        let big_int_table = next(header.big_int_count, 8, "bigint table")?;
        let big_int_storage = next(header.big_int_storage_size, 1, "bigint storage")?;
        let reg_exp_table = next(header.reg_exp_count, 8, "regexp table")?;
        let reg_exp_storage = next(header.reg_exp_storage_size, 1, "regexp storage")?;
        let cjs_module_table = next(header.cjs_module_count, 8, "cjs module table")?;
        let function_source_table = next(header.function_source_count, 8, "function source table")?;
        let end = align_up(pos);

        Ok(Self {
            function_headers,
            string_kinds,
            identifier_hashes,
            small_string_table,
            overflow_string_table,
            string_storage,
            array_buffer,
            obj_key_buffer,
            obj_value_buffer,
            big_int_table,
            big_int_storage,
            reg_exp_table,
            reg_exp_storage,
            cjs_module_table,
            function_source_table,
            end,
        })
    }
}

// ============================================================================
// Function headers
// ============================================================================

/// Which invocation forms a function prohibits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProhibitInvoke {
    /// Cannot be called, only constructed
    Call = 0,
    /// Cannot be constructed
    Construct = 1,
    /// No restriction
    #[default]
    None = 2,
}

impl ProhibitInvoke {
    fn from_bits(bits: u8) -> Self {
        match bits & 3 {
            0 => Self::Call,
            1 => Self::Construct,
            _ => Self::None,
        }
    }
}

/// Per-function flag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct FunctionHeaderFlags {
    /// Prohibited invocation
    pub prohibit_invoke: ProhibitInvoke,
    /// Strict-mode function
    pub strict_mode: bool,
    /// Info block holds an exception table
    pub has_exception_handler: bool,
    /// Info block holds debug offsets
    pub has_debug_info: bool,
    /// Small header redirects to a large header
    pub overflowed: bool,
    /// Function kind (normal, generator, async, async generator)
    pub kind: u8,
}

impl FunctionHeaderFlags {
    /// Decodes the packed byte.
    pub fn from_byte(byte: u8) -> Self {
        Self {
            prohibit_invoke: ProhibitInvoke::from_bits(byte),
            strict_mode: byte & (1 << 2) != 0,
            has_exception_handler: byte & (1 << 3) != 0,
            has_debug_info: byte & (1 << 4) != 0,
            overflowed: byte & (1 << 5) != 0,
            kind: byte >> 6,
        }
    }

    /// Encodes the packed byte.
    pub fn to_byte(self) -> u8 {
        (self.prohibit_invoke as u8 & 3)
            | (self.strict_mode as u8) << 2
            | (self.has_exception_handler as u8) << 3
            | (self.has_debug_info as u8) << 4
            | (self.overflowed as u8) << 5
            | (self.kind & 3) << 6
    }
}

/// Full-width function header. This is also the large-header encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FunctionHeader {
    /// Offset of the bytecode body
    pub offset: u32,
    /// Declared parameters including `this`
    pub param_count: u32,
    /// Loop nesting depth
    pub loop_depth: u32,
    /// Bytecode body size
    pub bytecode_size: u32,
    /// Name string ID
    pub function_name: u32,
    /// Leading registers known to hold numbers
    pub number_reg_count: u32,
    /// Leading registers known to hold non-pointers
    pub non_ptr_reg_count: u32,
    /// Offset of the info block
    pub info_offset: u32,
    /// Frame registers
    pub frame_size: u32,
    /// Read property cache slots
    pub read_cache_size: u8,
    /// Write property cache slots
    pub write_cache_size: u8,
    /// New-object cache slots
    pub num_cache_new_object: u8,
    /// Private-name cache slots
    pub private_name_cache_size: u8,
    /// Flags
    pub flags: FunctionHeaderFlags,
}

const fn fits(value: u32, bits: u32) -> bool {
    value >> bits == 0
}

impl FunctionHeader {
    /// Whether every field fits the small encoding.
    pub fn can_fit_in_small_header(&self) -> bool {
        fits(self.offset, 25)
            && fits(self.param_count, 5)
            && fits(self.loop_depth, 2)
            && fits(self.bytecode_size, 14)
            && fits(self.function_name, 8)
            && fits(self.number_reg_count, 5)
            && fits(self.non_ptr_reg_count, 5)
            && fits(self.frame_size, 8)
            && fits(self.write_cache_size as u32, 6)
            && fits(self.num_cache_new_object as u32, 1)
            && fits(self.private_name_cache_size as u32, 1)
    }

    /// Decodes a 44-byte large header.
    pub fn read_large(buf: &[u8], at: usize) -> Result<Self> {
        let bytes = buf
            .get(at..at + LARGE_HEADER_SIZE)
            .ok_or(BytecodeError::Truncated("large function header"))?;
        let word = |i: usize| le_u32(bytes, i * 4).unwrap_or_default();
        Ok(Self {
            offset: word(0),
            param_count: word(1),
            loop_depth: word(2),
            bytecode_size: word(3),
            function_name: word(4),
            number_reg_count: word(5),
            non_ptr_reg_count: word(6),
            info_offset: word(7),
            frame_size: word(8),
            read_cache_size: bytes[36],
            write_cache_size: bytes[37],
            num_cache_new_object: bytes[38],
            private_name_cache_size: bytes[39],
            flags: FunctionHeaderFlags::from_byte(bytes[40]),
        })
    }

    /// Encodes the 44-byte large header.
    pub fn to_large_bytes(&self) -> [u8; LARGE_HEADER_SIZE] {
        let mut out = [0u8; LARGE_HEADER_SIZE];
        let words = [
            self.offset,
            self.param_count,
            self.loop_depth,
            self.bytecode_size,
            self.function_name,
            self.number_reg_count,
            self.non_ptr_reg_count,
            self.info_offset,
            self.frame_size,
        ];
        for (i, w) in words.iter().enumerate() {
            out[i * 4..i * 4 + 4].copy_from_slice(&w.to_le_bytes());
        }
        out[36] = self.read_cache_size;
        out[37] = self.write_cache_size;
        out[38] = self.num_cache_new_object;
        out[39] = self.private_name_cache_size;
        out[40] = self.flags.to_byte();
        out
    }
}

/// Packed 16-byte function header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmallFuncHeader {
    w1: u32,
    w2: u32,
    w3: u32,
    b1: u8,
    b2: u8,
    b3: u8,
    flags: u8,
}

impl SmallFuncHeader {
    /// Decodes the header at `at`.
    pub fn read(buf: &[u8], at: usize) -> Result<Self> {
        let b = buf
            .get(at..at + SMALL_HEADER_SIZE)
            .ok_or(BytecodeError::Truncated("small function header"))?;
        Ok(Self {
            w1: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            w2: u32::from_le_bytes([b[4], b[5], b[6], b[7]]),
            w3: u32::from_le_bytes([b[8], b[9], b[10], b[11]]),
            b1: b[12],
            b2: b[13],
            b3: b[14],
            flags: b[15],
        })
    }

    /// Encodes the header.
    pub fn to_bytes(&self) -> [u8; SMALL_HEADER_SIZE] {
        let mut out = [0u8; SMALL_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.w1.to_le_bytes());
        out[4..8].copy_from_slice(&self.w2.to_le_bytes());
        out[8..12].copy_from_slice(&self.w3.to_le_bytes());
        out[12] = self.b1;
        out[13] = self.b2;
        out[14] = self.b3;
        out[15] = self.flags;
        out
    }

    /// Packs `header`, which must fit.
    pub fn new(header: &FunctionHeader) -> Result<Self> {
        if !header.can_fit_in_small_header() {
            return Err(BytecodeError::FieldOverflow {
                field: "small function header",
                value: header.offset as u64,
            });
        }
        let mut flags = header.flags;
        flags.overflowed = false;
        Ok(Self {
            w1: header.offset | header.param_count << 25 | header.loop_depth << 30,
            w2: header.bytecode_size
                | header.function_name << 14
                | header.number_reg_count << 22
                | header.non_ptr_reg_count << 27,
            w3: header.info_offset,
            b1: header.frame_size as u8,
            b2: header.read_cache_size,
            b3: header.write_cache_size
                | header.num_cache_new_object << 6
                | header.private_name_cache_size << 7,
            flags: flags.to_byte(),
        })
    }

    /// Redirect to a large header at `large_offset`.
    pub fn overflowed(header: &FunctionHeader, large_offset: u32) -> Self {
        let mut flags = header.flags;
        flags.overflowed = true;
        Self {
            w1: large_offset & 0x00FF_FFFF,
            w2: (large_offset >> 24) << 14,
            w3: 0,
            b1: 0,
            b2: 0,
            b3: 0,
            flags: flags.to_byte(),
        }
    }

    /// Offset of the bytecode body.
    #[inline]
    pub fn offset(&self) -> u32 {
        self.w1 & 0x01FF_FFFF
    }
    /// Parameter count.
    #[inline]
    pub fn param_count(&self) -> u32 {
        (self.w1 >> 25) & 0x1F
    }
    /// Loop depth.
    #[inline]
    pub fn loop_depth(&self) -> u32 {
        self.w1 >> 30
    }
    /// Bytecode size.
    #[inline]
    pub fn bytecode_size(&self) -> u32 {
        self.w2 & 0x3FFF
    }
    /// Name string ID.
    #[inline]
    pub fn function_name(&self) -> u32 {
        (self.w2 >> 14) & 0xFF
    }
    /// Number register count.
    #[inline]
    pub fn number_reg_count(&self) -> u32 {
        (self.w2 >> 22) & 0x1F
    }
    /// Non-pointer register count.
    #[inline]
    pub fn non_ptr_reg_count(&self) -> u32 {
        self.w2 >> 27
    }
    /// Info block offset.
    #[inline]
    pub fn info_offset(&self) -> u32 {
        self.w3
    }
    /// Frame size.
    #[inline]
    pub fn frame_size(&self) -> u32 {
        self.b1 as u32
    }
    /// Flags.
    #[inline]
    pub fn flags(&self) -> FunctionHeaderFlags {
        FunctionHeaderFlags::from_byte(self.flags)
    }
    /// Whether this header redirects to a large header.
    #[inline]
    pub fn is_overflowed(&self) -> bool {
        self.flags().overflowed
    }

    /// Offset of the large header, meaningful only when overflowed.
    #[inline]
    pub fn large_header_offset(&self) -> u32 {
        self.function_name() << 24 | (self.w1 & 0x00FF_FFFF)
    }

    pub(crate) fn set_offset(&mut self, offset: u32) {
        self.w1 = (self.w1 & !0x01FF_FFFF) | (offset & 0x01FF_FFFF);
    }

    pub(crate) fn set_info_offset(&mut self, info_offset: u32) {
        self.w3 = info_offset;
    }

    /// Widens to the full-width representation.
    pub fn to_function_header(&self) -> FunctionHeader {
        FunctionHeader {
            offset: self.offset(),
            param_count: self.param_count(),
            loop_depth: self.loop_depth(),
            bytecode_size: self.bytecode_size(),
            function_name: self.function_name(),
            number_reg_count: self.number_reg_count(),
            non_ptr_reg_count: self.non_ptr_reg_count(),
            info_offset: self.info_offset(),
            frame_size: self.frame_size(),
            read_cache_size: self.b2,
            write_cache_size: self.b3 & 0x3F,
            num_cache_new_object: (self.b3 >> 6) & 1,
            private_name_cache_size: self.b3 >> 7,
            flags: self.flags(),
        }
    }
}

/// Uniform view over the small or large representation of a header.
///
/// The variant is chosen by the small header's `overflowed` bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeFunctionHeader {
    /// Header fits inline
    Small(SmallFuncHeader),
    /// Header was redirected to the large representation
    Large(FunctionHeader),
}

impl RuntimeFunctionHeader {
    /// Bytecode offset.
    pub fn offset(&self) -> u32 {
        match self {
            Self::Small(h) => h.offset(),
            Self::Large(h) => h.offset,
        }
    }

    /// Parameter count.
    pub fn param_count(&self) -> u32 {
        match self {
            Self::Small(h) => h.param_count(),
            Self::Large(h) => h.param_count,
        }
    }

    /// Bytecode size.
    pub fn bytecode_size(&self) -> u32 {
        match self {
            Self::Small(h) => h.bytecode_size(),
            Self::Large(h) => h.bytecode_size,
        }
    }

    /// Name string ID.
    pub fn function_name(&self) -> u32 {
        match self {
            Self::Small(h) => h.function_name(),
            Self::Large(h) => h.function_name,
        }
    }

    /// Frame size.
    pub fn frame_size(&self) -> u32 {
        match self {
            Self::Small(h) => h.frame_size(),
            Self::Large(h) => h.frame_size,
        }
    }

    /// Number register count.
    pub fn number_reg_count(&self) -> u32 {
        match self {
            Self::Small(h) => h.number_reg_count(),
            Self::Large(h) => h.number_reg_count,
        }
    }

    /// Non-pointer register count.
    pub fn non_ptr_reg_count(&self) -> u32 {
        match self {
            Self::Small(h) => h.non_ptr_reg_count(),
            Self::Large(h) => h.non_ptr_reg_count,
        }
    }

    /// Info block offset. For a large header this is the position right
    /// after it, as recorded by the serializer.
    pub fn info_offset(&self) -> u32 {
        match self {
            Self::Small(h) => h.info_offset(),
            Self::Large(h) => h.info_offset,
        }
    }

    /// Flags of the authoritative representation.
    pub fn flags(&self) -> FunctionHeaderFlags {
        match self {
            Self::Small(h) => h.flags(),
            Self::Large(h) => h.flags,
        }
    }

    /// Full-width copy.
    pub fn to_function_header(&self) -> FunctionHeader {
        match self {
            Self::Small(h) => h.to_function_header(),
            Self::Large(h) => *h,
        }
    }
}

// ============================================================================
// String table
// ============================================================================

/// Longest string a small entry can describe directly.
pub const SMALL_STRING_MAX_LENGTH: u32 = 254;

/// Largest offset a small entry can hold.
pub const SMALL_STRING_MAX_OFFSET: u32 = (1 << 23) - 1;

/// Length marker of an overflowed small entry.
pub const SMALL_STRING_OVERFLOW_LENGTH: u32 = 255;

/// Resolved string table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StringTableEntry {
    /// Offset into string storage
    pub offset: u32,
    /// Length in code units
    pub length: u32,
    /// Storage holds UTF-16LE code units
    pub is_utf16: bool,
}

impl StringTableEntry {
    /// Whether the entry needs the overflow table.
    pub fn needs_overflow(&self) -> bool {
        self.offset > SMALL_STRING_MAX_OFFSET || self.length > SMALL_STRING_MAX_LENGTH
    }
}

/// Packed 32-bit string entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SmallStringTableEntry(pub u32);

impl SmallStringTableEntry {
    /// Direct entry.
    pub fn new(offset: u32, length: u32, is_utf16: bool) -> Self {
        debug_assert!(offset <= SMALL_STRING_MAX_OFFSET && length <= SMALL_STRING_MAX_LENGTH);
        Self(is_utf16 as u32 | (offset & SMALL_STRING_MAX_OFFSET) << 1 | (length & 0xFF) << 24)
    }

    /// Entry redirected to overflow slot `index`.
    pub fn overflowed(index: u32, is_utf16: bool) -> Self {
        Self(is_utf16 as u32 | (index & SMALL_STRING_MAX_OFFSET) << 1 | SMALL_STRING_OVERFLOW_LENGTH << 24)
    }

    /// UTF-16 flag.
    #[inline]
    pub fn is_utf16(self) -> bool {
        self.0 & 1 != 0
    }

    /// Offset, or overflow index when overflowed.
    #[inline]
    pub fn offset(self) -> u32 {
        (self.0 >> 1) & SMALL_STRING_MAX_OFFSET
    }

    /// Length field.
    #[inline]
    pub fn length(self) -> u32 {
        self.0 >> 24
    }

    /// Whether `offset` indexes the overflow table.
    #[inline]
    pub fn is_overflowed(self) -> bool {
        self.length() == SMALL_STRING_OVERFLOW_LENGTH
    }

    pub(crate) fn with_offset(self, offset: u32) -> Self {
        Self((self.0 & !(SMALL_STRING_MAX_OFFSET << 1)) | (offset & SMALL_STRING_MAX_OFFSET) << 1)
    }
}

/// Wide string entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OverflowStringTableEntry {
    /// Offset into string storage
    pub offset: u32,
    /// Length in code units
    pub length: u32,
}

/// `{offset, length}` pair used by the BigInt and RegExp tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct StorageEntry {
    /// Offset into the storage blob
    pub offset: u32,
    /// Length in bytes
    pub length: u32,
}

/// Bit marking an identifier run in the string-kind table.
pub const STRING_KIND_IDENTIFIER_BIT: u32 = 1 << 31;

/// Kind of a string-table run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StringKind {
    /// Plain string
    String,
    /// Property identifier
    Identifier,
}

/// Run of consecutive strings of one kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StringKindEntry {
    /// Kind of every string in the run
    pub kind: StringKind,
    /// Number of strings
    pub count: u32,
}

impl StringKindEntry {
    /// Decodes a packed run.
    pub fn from_raw(raw: u32) -> Self {
        Self {
            kind: if raw & STRING_KIND_IDENTIFIER_BIT != 0 {
                StringKind::Identifier
            } else {
                StringKind::String
            },
            count: raw & !STRING_KIND_IDENTIFIER_BIT,
        }
    }

    /// Encodes the run.
    pub fn to_raw(self) -> u32 {
        let bit = match self.kind {
            StringKind::Identifier => STRING_KIND_IDENTIFIER_BIT,
            StringKind::String => 0,
        };
        bit | (self.count & !STRING_KIND_IDENTIFIER_BIT)
    }
}

// ============================================================================
// Info block
// ============================================================================

/// One exception handler range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExceptionHandlerInfo {
    /// First covered offset
    pub start: u32,
    /// One past the last covered offset
    pub end: u32,
    /// Handler offset
    pub target: u32,
}

impl ExceptionHandlerInfo {
    /// Whether `offset` falls in `[start, end)`.
    #[inline]
    pub fn covers(&self, offset: u32) -> bool {
        self.start <= offset && offset < self.end
    }
}

/// Index of the first handler covering `offset`.
///
/// Handlers are emitted innermost first, so the first match is the
/// innermost enclosing range.
pub fn find_catch_handler(table: &[ExceptionHandlerInfo], offset: u32) -> Option<usize> {
    table.iter().position(|h| h.covers(offset))
}

/// Offsets of one function's debug records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DebugOffsets {
    /// Start of the source-location stream
    pub source_locations: u32,
    /// Scope descriptor data
    pub scope_desc_data: u32,
    /// Textified callee table
    pub textified_callees: u32,
}

impl Default for DebugOffsets {
    fn default() -> Self {
        Self {
            source_locations: NO_OFFSET,
            scope_desc_data: NO_OFFSET,
            textified_callees: NO_OFFSET,
        }
    }
}

/// Size of a serialized [`DebugOffsets`].
pub const DEBUG_OFFSETS_SIZE: usize = 12;

/// Size of one serialized [`ExceptionHandlerInfo`].
pub const EXCEPTION_HANDLER_SIZE: usize = 12;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> FunctionHeader {
        FunctionHeader {
            offset: 0x1234,
            param_count: 3,
            loop_depth: 1,
            bytecode_size: 200,
            function_name: 7,
            number_reg_count: 2,
            non_ptr_reg_count: 4,
            info_offset: 0x8000,
            frame_size: 12,
            read_cache_size: 5,
            write_cache_size: 9,
            num_cache_new_object: 1,
            private_name_cache_size: 0,
            flags: FunctionHeaderFlags {
                prohibit_invoke: ProhibitInvoke::Construct,
                strict_mode: true,
                has_exception_handler: true,
                has_debug_info: false,
                overflowed: false,
                kind: 2,
            },
        }
    }

    #[test]
    fn file_header_round_trip() {
        let header = FileHeader {
            magic: MAGIC,
            version: BYTECODE_VERSION,
            source_hash: [7; 20],
            file_length: 4096,
            function_count: 3,
            debug_info_offset: 1000,
            options: BytecodeOptions::HAS_ASYNC | BytecodeOptions::STATIC_BUILTINS,
            ..Default::default()
        };
        let bytes = header.to_bytes();
        assert_eq!(bytes[OPTIONS_POS], 0b101);
        assert_eq!(FileHeader::read(&bytes).unwrap(), header);
    }

    #[test]
    fn file_header_rejects_short_buffer() {
        let err = FileHeader::read(&[0; 64]).unwrap_err();
        assert!(matches!(err, BytecodeError::BufferTooSmall { len: 64, needed: 128 }));
    }

    #[test]
    fn delta_magic_is_complement() {
        assert_eq!(BytecodeForm::from_magic(MAGIC), Some(BytecodeForm::Execution));
        assert_eq!(BytecodeForm::from_magic(DELTA_MAGIC), Some(BytecodeForm::Delta));
        assert_eq!(BytecodeForm::from_magic(0), None);
    }

    #[test]
    fn small_header_packs_all_fields() {
        let header = sample_header();
        assert!(header.can_fit_in_small_header());
        let small = SmallFuncHeader::new(&header).unwrap();
        let decoded = SmallFuncHeader::read(&small.to_bytes(), 0).unwrap();
        assert_eq!(decoded.to_function_header(), header);
        assert!(!decoded.is_overflowed());
    }

    #[test]
    fn small_header_rejects_wide_fields() {
        let mut header = sample_header();
        header.bytecode_size = 1 << 14;
        assert!(!header.can_fit_in_small_header());
        assert!(SmallFuncHeader::new(&header).is_err());

        let mut header = sample_header();
        header.frame_size = 256;
        assert!(!header.can_fit_in_small_header());
    }

    #[test]
    fn overflowed_header_encodes_large_offset() {
        let mut header = sample_header();
        header.function_name = 1000;
        let small = SmallFuncHeader::overflowed(&header, 0x0312_3456);
        assert!(small.is_overflowed());
        assert_eq!(small.large_header_offset(), 0x0312_3456);
        assert!(small.flags().has_exception_handler);
        assert!(small.flags().strict_mode);
    }

    #[test]
    fn large_header_round_trip() {
        let mut header = sample_header();
        header.bytecode_size = 100_000;
        let bytes = header.to_large_bytes();
        assert_eq!(FunctionHeader::read_large(&bytes, 0).unwrap(), header);
    }

    #[test]
    fn string_entry_fields() {
        let e = SmallStringTableEntry::new(100, 12, true);
        assert!(e.is_utf16());
        assert_eq!(e.offset(), 100);
        assert_eq!(e.length(), 12);
        assert!(!e.is_overflowed());

        let o = SmallStringTableEntry::overflowed(3, false);
        assert!(o.is_overflowed());
        assert_eq!(o.offset(), 3);
        assert_eq!(o.with_offset(9).offset(), 9);
        assert!(o.with_offset(9).is_overflowed());
    }

    #[test]
    fn string_kind_runs() {
        let run = StringKindEntry {
            kind: StringKind::Identifier,
            count: 17,
        };
        assert_eq!(StringKindEntry::from_raw(run.to_raw()), run);
        assert_eq!(run.to_raw(), STRING_KIND_IDENTIFIER_BIT | 17);
    }

    #[test]
    fn first_matching_handler_wins() {
        let table = [
            ExceptionHandlerInfo { start: 0, end: 10, target: 100 },
            ExceptionHandlerInfo { start: 0, end: 20, target: 200 },
        ];
        assert_eq!(find_catch_handler(&table, 5), Some(0));
        assert_eq!(find_catch_handler(&table, 15), Some(1));
        assert_eq!(find_catch_handler(&table, 20), None);
    }

    #[test]
    fn layout_aligns_sections() {
        let header = FileHeader {
            function_count: 2,
            string_count: 1,
            string_storage_size: 5,
            array_buffer_size: 3,
            ..Default::default()
        };
        let layout = FileLayout::compute(&header).unwrap();
        assert_eq!(layout.function_headers.start, FILE_HEADER_SIZE);
        assert_eq!(layout.small_string_table.start, FILE_HEADER_SIZE + 32);
        assert_eq!(layout.array_buffer.start, align_up(layout.string_storage.end()));
        assert_eq!(layout.end % 4, 0);
    }
}
