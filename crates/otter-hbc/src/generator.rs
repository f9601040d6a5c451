//! Bytecode module generation and serialization
//!
//! [`BytecodeFunctionGenerator`] assembles one function body with labels and
//! branch fix-ups. [`BytecodeModuleGenerator`] collects functions and tables,
//! and [`BytecodeSerializer`] lays everything out in execution form.

use rustc_hash::FxHashMap;

use crate::debug_info::{DebugFileRegion, DebugInfo, DebugSourceLocation, write_location_stream};
use crate::error::{BytecodeError, Result};
use crate::format::{
    BYTECODE_VERSION, BytecodeOptions, DebugOffsets, ExceptionHandlerInfo, FileHeader, FileLayout,
    FunctionHeader, FunctionHeaderFlags, HASH_SIZE, MAGIC, NO_OFFSET, OverflowStringTableEntry,
    ProhibitInvoke, Section, SmallFuncHeader, SmallStringTableEntry, StringKind, StringKindEntry,
    StringTableEntry, align_up,
};
use crate::hash::{identifier_hash, sha1};
use crate::opcode::{Opcode, Operand, OperandType, align4, encode_instruction};

/// Source-mapping URL ID meaning "none".
pub const NO_SOURCE_MAPPING_URL: u32 = u32::MAX;

/// A position in a function body, bound once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug, Clone, Copy)]
struct Fixup {
    /// Byte position of the displacement
    at: u32,
    /// Offset the displacement is relative to
    base: u32,
    ty: OperandType,
    label: Label,
}

/// A finished function body with its metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BytecodeFunction {
    /// Header fields; `offset`, `bytecode_size` and `info_offset` are filled
    /// in by the serializer.
    pub header: FunctionHeader,
    /// Instruction bytes
    pub code: Vec<u8>,
    /// Exception handlers, innermost first
    pub exception_handlers: Vec<ExceptionHandlerInfo>,
    /// Source locations sorted by address
    pub debug_locations: Vec<DebugSourceLocation>,
    /// Filename table index for the locations
    pub filename_id: Option<u32>,
}

/// Assembles one function.
#[derive(Debug, Default)]
pub struct BytecodeFunctionGenerator {
    header: FunctionHeader,
    code: Vec<u8>,
    labels: Vec<Option<u32>>,
    fixups: Vec<Fixup>,
    handlers: Vec<(Label, Label, Label)>,
    locations: Vec<DebugSourceLocation>,
    filename_id: Option<u32>,
}

impl BytecodeFunctionGenerator {
    /// New function with `frame_size` registers.
    pub fn new(frame_size: u32) -> Self {
        Self {
            header: FunctionHeader {
                frame_size,
                param_count: 1,
                flags: FunctionHeaderFlags {
                    prohibit_invoke: ProhibitInvoke::None,
                    ..Default::default()
                },
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Set the parameter count (including `this`).
    pub fn param_count(mut self, count: u32) -> Self {
        self.header.param_count = count;
        self
    }

    /// Set the name string ID.
    pub fn name(mut self, string_id: u32) -> Self {
        self.header.function_name = string_id;
        self
    }

    /// Set strict mode.
    pub fn strict(mut self, strict: bool) -> Self {
        self.header.flags.strict_mode = strict;
        self
    }

    /// Set how many leading registers always hold numbers and non-pointers.
    pub fn reg_counts(mut self, number: u32, non_ptr: u32) -> Self {
        self.header.number_reg_count = number;
        self.header.non_ptr_reg_count = non_ptr;
        self
    }

    /// Set the loop depth.
    pub fn loop_depth(mut self, depth: u32) -> Self {
        self.header.loop_depth = depth;
        self
    }

    /// Set property cache sizes.
    pub fn cache_sizes(mut self, read: u8, write: u8) -> Self {
        self.header.read_cache_size = read;
        self.header.write_cache_size = write;
        self
    }

    /// Set the filename used for debug locations.
    pub fn filename(mut self, filename_id: u32) -> Self {
        self.filename_id = Some(filename_id);
        self
    }

    /// Current end of the body.
    pub fn current_offset(&self) -> u32 {
        self.code.len() as u32
    }

    /// Appends an instruction, returning its offset.
    pub fn emit(&mut self, opcode: Opcode, operands: &[Operand]) -> Result<u32> {
        let offset = self.current_offset();
        encode_instruction(&mut self.code, opcode, operands)?;
        Ok(offset)
    }

    /// Fresh unbound label.
    pub fn new_label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() as u32 - 1)
    }

    /// Binds `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0 as usize].is_none(), "label bound twice");
        self.labels[label.0 as usize] = Some(self.current_offset());
    }

    /// Appends a branch to `target`. `rest` are the operands after the
    /// displacement.
    pub fn emit_branch(&mut self, opcode: Opcode, target: Label, rest: &[Operand]) -> Result<u32> {
        let ty = opcode.operand_types().first().copied();
        let Some(ty @ (OperandType::Addr8 | OperandType::Addr32)) = ty else {
            return Err(BytecodeError::OperandMismatch {
                opcode: opcode.name(),
                index: 0,
            });
        };
        let mut operands = Vec::with_capacity(rest.len() + 1);
        operands.push(Operand::Addr(0));
        operands.extend_from_slice(rest);
        let offset = self.emit(opcode, &operands)?;
        self.fixups.push(Fixup {
            at: offset + 1,
            base: offset,
            ty,
            label: target,
        });
        Ok(offset)
    }

    /// Appends a `SwitchImm` on `value` for `min..min + targets.len()` with
    /// its inline jump table.
    pub fn emit_switch_imm(
        &mut self,
        value: u32,
        min: u32,
        default: Label,
        targets: &[Label],
    ) -> Result<u32> {
        if targets.is_empty() {
            return Err(BytecodeError::OperandMismatch {
                opcode: Opcode::SwitchImm.name(),
                index: 4,
            });
        }
        let offset = self.current_offset();
        let table_start = align4(offset + Opcode::SwitchImm.size());
        let max = min + targets.len() as u32 - 1;
        self.emit(
            Opcode::SwitchImm,
            &[
                Operand::Reg(value),
                Operand::UInt(table_start - offset),
                Operand::Addr(0),
                Operand::UInt(min),
                Operand::UInt(max),
            ],
        )?;
        self.fixups.push(Fixup {
            at: offset + Opcode::SwitchImm.operand_offset(2),
            base: offset,
            ty: OperandType::Addr32,
            label: default,
        });
        self.code.resize(table_start as usize, 0);
        for &target in targets {
            self.fixups.push(Fixup {
                at: self.current_offset(),
                base: offset,
                ty: OperandType::Addr32,
                label: target,
            });
            self.code.extend_from_slice(&[0; 4]);
        }
        Ok(offset)
    }

    /// Registers a handler for `[start, end)` jumping to `target`.
    pub fn add_exception_handler(&mut self, start: Label, end: Label, target: Label) {
        self.handlers.push((start, end, target));
    }

    /// Records a source location at the current offset.
    pub fn add_debug_location(&mut self, line: u32, column: u32) {
        let address = self.current_offset();
        self.add_debug_location_at(address, line, column);
    }

    /// Records a source location at `address`.
    pub fn add_debug_location_at(&mut self, address: u32, line: u32, column: u32) {
        let statement = self.locations.last().map_or(1, |l| l.statement + 1);
        self.locations.push(DebugSourceLocation {
            address,
            line,
            column,
            statement,
            ..Default::default()
        });
    }

    fn resolve(&self, label: Label) -> Result<u32> {
        self.labels
            .get(label.0 as usize)
            .copied()
            .flatten()
            .ok_or(BytecodeError::UnboundLabel(label.0))
    }

    /// Resolves every branch and returns the finished function.
    pub fn finish(mut self) -> Result<BytecodeFunction> {
        for fixup in std::mem::take(&mut self.fixups) {
            let target = self.resolve(fixup.label)?;
            let delta = target as i64 - fixup.base as i64;
            let at = fixup.at as usize;
            match fixup.ty {
                OperandType::Addr8 => {
                    let d = i8::try_from(delta).map_err(|_| BytecodeError::FieldOverflow {
                        field: "8-bit branch displacement",
                        value: delta as u64,
                    })?;
                    self.code[at] = d as u8;
                }
                _ => {
                    let d = i32::try_from(delta).map_err(|_| BytecodeError::FieldOverflow {
                        field: "32-bit branch displacement",
                        value: delta as u64,
                    })?;
                    self.code[at..at + 4].copy_from_slice(&d.to_le_bytes());
                }
            }
        }

        let mut exception_handlers = Vec::with_capacity(self.handlers.len());
        for &(start, end, target) in &self.handlers {
            exception_handlers.push(ExceptionHandlerInfo {
                start: self.resolve(start)?,
                end: self.resolve(end)?,
                target: self.resolve(target)?,
            });
        }
        self.locations.sort_by_key(|l| l.address);

        let mut header = self.header;
        header.bytecode_size = self.code.len() as u32;
        header.flags.has_exception_handler = !exception_handlers.is_empty();
        header.flags.has_debug_info = !self.locations.is_empty();

        Ok(BytecodeFunction {
            header,
            code: self.code,
            exception_handlers,
            debug_locations: self.locations,
            filename_id: self.filename_id,
        })
    }
}

/// A module ready to serialize.
#[derive(Debug, Clone, Default)]
pub struct BytecodeModule {
    /// Functions in ID order
    pub functions: Vec<BytecodeFunction>,
    /// Global function index
    pub global_code_index: u32,
    /// Module options
    pub options: BytecodeOptions,
    /// Segment ID
    pub segment_id: u32,
    /// SHA-1 of the source text
    pub source_hash: [u8; 20],
    /// Strings in ID order
    pub strings: Vec<String>,
    /// Kind of each string
    pub string_kinds: Vec<StringKind>,
    /// BigInt payloads
    pub big_ints: Vec<Vec<u8>>,
    /// Compiled RegExp payloads
    pub reg_exps: Vec<Vec<u8>>,
    /// Array literal buffer
    pub array_buffer: Vec<u8>,
    /// Object key literal buffer
    pub obj_key_buffer: Vec<u8>,
    /// Object value literal buffer
    pub obj_value_buffer: Vec<u8>,
    /// CJS `(key, function_index)` pairs
    pub cjs_modules: Vec<(u32, u32)>,
    /// `(function_id, string_id)` pairs
    pub function_sources: Vec<(u32, u32)>,
    /// Filenames for debug info
    pub filenames: Vec<String>,
}

/// Collects the pieces of a module.
#[derive(Debug, Default)]
pub struct BytecodeModuleGenerator {
    module: BytecodeModule,
    string_ids: FxHashMap<String, u32>,
    filename_ids: FxHashMap<String, u32>,
}

impl BytecodeModuleGenerator {
    /// Empty module.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set module options.
    pub fn options(mut self, options: BytecodeOptions) -> Self {
        self.module.options = options;
        self
    }

    /// Set the source hash.
    pub fn source_hash(mut self, hash: [u8; 20]) -> Self {
        self.module.source_hash = hash;
        self
    }

    /// Set the segment ID.
    pub fn segment_id(mut self, id: u32) -> Self {
        self.module.segment_id = id;
        self
    }

    /// Set the global function index.
    pub fn set_global_function(&mut self, index: u32) {
        self.module.global_code_index = index;
    }

    /// Adds a function, returning its ID.
    pub fn add_function(&mut self, function: BytecodeFunction) -> u32 {
        self.module.functions.push(function);
        self.module.functions.len() as u32 - 1
    }

    fn intern(&mut self, s: &str, kind: StringKind) -> u32 {
        if let Some(&id) = self.string_ids.get(s) {
            if kind == StringKind::Identifier {
                self.module.string_kinds[id as usize] = StringKind::Identifier;
            }
            return id;
        }
        let id = self.module.strings.len() as u32;
        self.module.strings.push(s.to_owned());
        self.module.string_kinds.push(kind);
        self.string_ids.insert(s.to_owned(), id);
        id
    }

    /// Uniqued string ID.
    pub fn add_string(&mut self, s: &str) -> u32 {
        self.intern(s, StringKind::String)
    }

    /// Uniqued identifier ID.
    pub fn add_identifier(&mut self, s: &str) -> u32 {
        self.intern(s, StringKind::Identifier)
    }

    /// Uniqued filename ID.
    pub fn add_filename(&mut self, name: &str) -> u32 {
        if let Some(&id) = self.filename_ids.get(name) {
            return id;
        }
        let id = self.module.filenames.len() as u32;
        self.module.filenames.push(name.to_owned());
        self.filename_ids.insert(name.to_owned(), id);
        id
    }

    /// Adds a BigInt payload.
    pub fn add_big_int(&mut self, bytes: &[u8]) -> u32 {
        self.module.big_ints.push(bytes.to_vec());
        self.module.big_ints.len() as u32 - 1
    }

    /// Adds a compiled RegExp payload.
    pub fn add_reg_exp(&mut self, bytes: &[u8]) -> u32 {
        self.module.reg_exps.push(bytes.to_vec());
        self.module.reg_exps.len() as u32 - 1
    }

    /// Appends to the array literal buffer, returning the start offset.
    pub fn append_array_buffer(&mut self, bytes: &[u8]) -> u32 {
        let at = self.module.array_buffer.len() as u32;
        self.module.array_buffer.extend_from_slice(bytes);
        at
    }

    /// Appends object keys and values, returning both start offsets.
    pub fn append_object_buffers(&mut self, keys: &[u8], values: &[u8]) -> (u32, u32) {
        let k = self.module.obj_key_buffer.len() as u32;
        let v = self.module.obj_value_buffer.len() as u32;
        self.module.obj_key_buffer.extend_from_slice(keys);
        self.module.obj_value_buffer.extend_from_slice(values);
        (k, v)
    }

    /// Registers a CJS module.
    pub fn add_cjs_module(&mut self, key: u32, function_index: u32) {
        self.module.cjs_modules.push((key, function_index));
    }

    /// Records the source text string of a function.
    pub fn add_function_source(&mut self, function_id: u32, string_id: u32) {
        self.module.function_sources.push((function_id, string_id));
    }

    /// Finishes the module.
    pub fn generate(self) -> BytecodeModule {
        self.module
    }
}

/// Writes execution-form bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct BytecodeSerializer {
    /// Drop the debug section and every `has_debug_info` flag
    pub strip_debug_info: bool,
}

struct StringTables {
    kinds: Vec<u32>,
    hashes: Vec<u32>,
    small: Vec<u32>,
    overflow: Vec<OverflowStringTableEntry>,
    storage: Vec<u8>,
}

fn build_string_tables(module: &BytecodeModule) -> Result<StringTables> {
    let mut kinds: Vec<StringKindEntry> = Vec::new();
    for &kind in &module.string_kinds {
        match kinds.last_mut() {
            Some(run) if run.kind == kind => run.count += 1,
            _ => kinds.push(StringKindEntry { kind, count: 1 }),
        }
    }

    let mut tables = StringTables {
        kinds: kinds.iter().map(|k| k.to_raw()).collect(),
        hashes: Vec::new(),
        small: Vec::with_capacity(module.strings.len()),
        overflow: Vec::new(),
        storage: Vec::new(),
    };

    for (s, &kind) in module.strings.iter().zip(&module.string_kinds) {
        if kind == StringKind::Identifier {
            tables.hashes.push(identifier_hash(s));
        }
        let offset = u32::try_from(tables.storage.len()).map_err(|_| BytecodeError::FieldOverflow {
            field: "string storage",
            value: tables.storage.len() as u64,
        })?;
        let entry = if s.is_ascii() {
            tables.storage.extend_from_slice(s.as_bytes());
            StringTableEntry {
                offset,
                length: s.len() as u32,
                is_utf16: false,
            }
        } else {
            let mut length = 0;
            for unit in s.encode_utf16() {
                tables.storage.extend_from_slice(&unit.to_le_bytes());
                length += 1;
            }
            StringTableEntry {
                offset,
                length,
                is_utf16: true,
            }
        };
        let small = if entry.needs_overflow() {
            tables.overflow.push(OverflowStringTableEntry {
                offset: entry.offset,
                length: entry.length,
            });
            SmallStringTableEntry::overflowed(tables.overflow.len() as u32 - 1, entry.is_utf16)
        } else {
            SmallStringTableEntry::new(entry.offset, entry.length, entry.is_utf16)
        };
        tables.small.push(small.0);
    }
    Ok(tables)
}

fn put_words(out: &mut [u8], section: Section, words: impl IntoIterator<Item = u32>) {
    for (i, word) in words.into_iter().enumerate() {
        let at = section.start + i * 4;
        out[at..at + 4].copy_from_slice(&word.to_le_bytes());
    }
}

fn put_bytes(out: &mut [u8], section: Section, bytes: &[u8]) {
    out[section.start..section.start + bytes.len()].copy_from_slice(bytes);
}

fn pad_to_alignment(out: &mut Vec<u8>) -> usize {
    out.resize(align_up(out.len()), 0);
    out.len()
}

fn checked_u32(value: usize, field: &'static str) -> Result<u32> {
    u32::try_from(value).map_err(|_| BytecodeError::FieldOverflow {
        field,
        value: value as u64,
    })
}

impl BytecodeSerializer {
    /// Serializer that keeps or strips debug info.
    pub fn new(strip_debug_info: bool) -> Self {
        Self { strip_debug_info }
    }

    /// Serializes `module` into execution form with its footer hash.
    pub fn serialize(&self, module: &BytecodeModule) -> Result<Vec<u8>> {
        if module.functions.is_empty() {
            return Err(BytecodeError::NoFunctions);
        }
        let strings = build_string_tables(module)?;

        let mut big_int_storage = Vec::new();
        let big_int_table: Vec<u32> = module
            .big_ints
            .iter()
            .flat_map(|b| {
                let entry = [big_int_storage.len() as u32, b.len() as u32];
                big_int_storage.extend_from_slice(b);
                entry
            })
            .collect();
        let mut reg_exp_storage = Vec::new();
        let reg_exp_table: Vec<u32> = module
            .reg_exps
            .iter()
            .flat_map(|b| {
                let entry = [reg_exp_storage.len() as u32, b.len() as u32];
                reg_exp_storage.extend_from_slice(b);
                entry
            })
            .collect();
        let mut function_sources = module.function_sources.clone();
        function_sources.sort_unstable();

        let mut header = FileHeader {
            magic: MAGIC,
            version: BYTECODE_VERSION,
            source_hash: module.source_hash,
            global_code_index: module.global_code_index,
            function_count: module.functions.len() as u32,
            string_kind_count: strings.kinds.len() as u32,
            identifier_count: strings.hashes.len() as u32,
            string_count: strings.small.len() as u32,
            overflow_string_count: strings.overflow.len() as u32,
            string_storage_size: checked_u32(strings.storage.len(), "string storage")?,
            big_int_count: module.big_ints.len() as u32,
            big_int_storage_size: checked_u32(big_int_storage.len(), "bigint storage")?,
            reg_exp_count: module.reg_exps.len() as u32,
            reg_exp_storage_size: checked_u32(reg_exp_storage.len(), "regexp storage")?,
            array_buffer_size: checked_u32(module.array_buffer.len(), "array buffer")?,
            obj_key_buffer_size: checked_u32(module.obj_key_buffer.len(), "object key buffer")?,
            obj_value_buffer_size: checked_u32(module.obj_value_buffer.len(), "object value buffer")?,
            segment_id: module.segment_id,
            cjs_module_count: module.cjs_modules.len() as u32,
            function_source_count: function_sources.len() as u32,
            debug_info_offset: 0,
            options: module.options,
            file_length: 0,
        };
        let layout = FileLayout::compute(&header)?;
        let mut out = vec![0u8; layout.end];

        put_words(&mut out, layout.string_kinds, strings.kinds.iter().copied());
        put_words(&mut out, layout.identifier_hashes, strings.hashes.iter().copied());
        put_words(&mut out, layout.small_string_table, strings.small.iter().copied());
        put_words(
            &mut out,
            layout.overflow_string_table,
            strings.overflow.iter().flat_map(|e| [e.offset, e.length]),
        );
        put_bytes(&mut out, layout.string_storage, &strings.storage);
        put_bytes(&mut out, layout.array_buffer, &module.array_buffer);
        put_bytes(&mut out, layout.obj_key_buffer, &module.obj_key_buffer);
        put_bytes(&mut out, layout.obj_value_buffer, &module.obj_value_buffer);
        put_words(&mut out, layout.big_int_table, big_int_table);
        put_bytes(&mut out, layout.big_int_storage, &big_int_storage);
        put_words(&mut out, layout.reg_exp_table, reg_exp_table);
        put_bytes(&mut out, layout.reg_exp_storage, &reg_exp_storage);
        put_words(
            &mut out,
            layout.cjs_module_table,
            module.cjs_modules.iter().flat_map(|&(k, f)| [k, f]),
        );
        put_words(
            &mut out,
            layout.function_source_table,
            function_sources.iter().flat_map(|&(f, s)| [f, s]),
        );

        // Bodies.
        let mut headers: Vec<FunctionHeader> = Vec::with_capacity(module.functions.len());
        for function in &module.functions {
            let offset = checked_u32(pad_to_alignment(&mut out), "function offset")?;
            out.extend_from_slice(&function.code);
            let mut h = function.header;
            h.offset = offset;
            h.bytecode_size = function.code.len() as u32;
            h.flags.has_exception_handler = !function.exception_handlers.is_empty();
            h.flags.has_debug_info = !self.strip_debug_info && !function.debug_locations.is_empty();
            h.flags.overflowed = false;
            headers.push(h);
        }

        // Location streams, grouped into file regions.
        let mut debug_data = Vec::new();
        let mut regions: Vec<DebugFileRegion> = Vec::new();
        let mut debug_offsets = vec![None; module.functions.len()];
        if !self.strip_debug_info {
            for (id, function) in module.functions.iter().enumerate() {
                if function.debug_locations.is_empty() {
                    continue;
                }
                let filename_id = function.filename_id.unwrap_or(0);
                if regions.last().is_none_or(|r| r.filename_id != filename_id) {
                    regions.push(DebugFileRegion {
                        from_address: debug_data.len() as u32,
                        filename_id,
                        source_mapping_url_id: NO_SOURCE_MAPPING_URL,
                    });
                }
                let source_locations =
                    write_location_stream(&mut debug_data, id as u32, &function.debug_locations);
                debug_offsets[id] = Some(DebugOffsets {
                    source_locations,
                    scope_desc_data: NO_OFFSET,
                    textified_callees: NO_OFFSET,
                });
            }
        }

        // Info blocks, preceded by a large header when the small one overflows.
        for (id, function) in module.functions.iter().enumerate() {
            let h = &mut headers[id];
            pad_to_alignment(&mut out);
            let mut overflow_at = None;
            h.info_offset = checked_u32(out.len(), "info offset")?;
            if !h.can_fit_in_small_header() {
                overflow_at = Some(out.len());
                out.extend_from_slice(&[0; crate::format::LARGE_HEADER_SIZE]);
                h.info_offset = checked_u32(pad_to_alignment(&mut out), "info offset")?;
            }
            if h.flags.has_exception_handler {
                pad_to_alignment(&mut out);
                out.extend_from_slice(&(function.exception_handlers.len() as u32).to_le_bytes());
                for handler in &function.exception_handlers {
                    out.extend_from_slice(&handler.start.to_le_bytes());
                    out.extend_from_slice(&handler.end.to_le_bytes());
                    out.extend_from_slice(&handler.target.to_le_bytes());
                }
            }
            if let Some(offsets) = debug_offsets[id].filter(|_| h.flags.has_debug_info) {
                pad_to_alignment(&mut out);
                out.extend_from_slice(&offsets.source_locations.to_le_bytes());
                out.extend_from_slice(&offsets.scope_desc_data.to_le_bytes());
                out.extend_from_slice(&offsets.textified_callees.to_le_bytes());
            }

            let at = layout.function_headers.start + id * crate::format::SMALL_HEADER_SIZE;
            let small = match overflow_at {
                Some(large_at) => {
                    let mut large = *h;
                    large.flags.overflowed = true;
                    out[large_at..large_at + crate::format::LARGE_HEADER_SIZE]
                        .copy_from_slice(&large.to_large_bytes());
                    SmallFuncHeader::overflowed(h, checked_u32(large_at, "large header offset")?)
                }
                None => SmallFuncHeader::new(h)?,
            };
            out[at..at + crate::format::SMALL_HEADER_SIZE].copy_from_slice(&small.to_bytes());
        }

        if !self.strip_debug_info && !regions.is_empty() {
            let info = DebugInfo::new(&module.filenames, regions, debug_data)?;
            header.debug_info_offset = checked_u32(pad_to_alignment(&mut out), "debug info offset")?;
            info.write(&mut out);
        }

        pad_to_alignment(&mut out);
        header.file_length = checked_u32(out.len() + HASH_SIZE, "file length")?;
        out[..crate::format::FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let digest = sha1(&out);
        out.extend_from_slice(&digest);

        tracing::debug!(
            target: "otter::hbc",
            functions = header.function_count,
            bytes = out.len(),
            stripped = self.strip_debug_info,
            "bytecode serialized"
        );
        Ok(out)
    }
}
