//! Bytecode data provider
//!
//! [`BcProvider`] validates a serialized module once and then exposes typed,
//! zero-copy views into it. Every read is a byte-wise little-endian decode, so
//! the backing buffer needs no particular alignment.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::debug_info::{DebugInfo, DebugSourceLocation};
use crate::error::{BytecodeError, Result};
use crate::format::{
    BYTECODE_VERSION, BytecodeForm, BytecodeOptions, DEBUG_OFFSETS_SIZE, DebugOffsets,
    EXCEPTION_HANDLER_SIZE, ExceptionHandlerInfo, FILE_HEADER_SIZE, FileHeader, FileLayout,
    FunctionHeader, HASH_SIZE, LARGE_HEADER_SIZE, OverflowStringTableEntry, RuntimeFunctionHeader,
    SMALL_HEADER_SIZE, Section, SmallFuncHeader, SmallStringTableEntry, StorageEntry,
    StringKindEntry, StringTableEntry, align_up, le_u32,
};
use crate::hash;
use crate::os::{self, Advice};

/// Pages touched between checks of the warmup abort flag.
const WARMUP_ABORT_CHECK_PAGES: usize = 64;

/// Read-only byte storage backing a provider.
pub trait Buffer: Send + Sync {
    /// The bytes.
    fn data(&self) -> &[u8];
}

impl Buffer for Vec<u8> {
    fn data(&self) -> &[u8] {
        self
    }
}

impl Buffer for Box<[u8]> {
    fn data(&self) -> &[u8] {
        self
    }
}

impl Buffer for &'static [u8] {
    fn data(&self) -> &[u8] {
        self
    }
}

/// Validation switches for [`BcProvider::create_from_buffer_with_options`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckOptions {
    /// Compare the SHA-1 footer against the contents
    pub verify_hash: bool,
}

/// Cheap check that `bytes` starts with an execution-form magic number.
pub fn is_bytecode_stream(bytes: &[u8]) -> bool {
    bytes
        .get(..8)
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .map(u64::from_le_bytes)
        == Some(BytecodeForm::Execution.magic())
}

/// Validates the header and fixed sections of `buffer` for `form`.
///
/// Checks run in order: minimum size, magic, version, function count, file
/// length, section bounds.
pub fn sanity_check(buffer: &[u8], form: BytecodeForm) -> Result<(FileHeader, FileLayout)> {
    if buffer.len() < FILE_HEADER_SIZE + HASH_SIZE {
        return Err(BytecodeError::BufferTooSmall {
            len: buffer.len(),
            needed: FILE_HEADER_SIZE + HASH_SIZE,
        });
    }
    let header = FileHeader::read(buffer)?;
    match BytecodeForm::from_magic(header.magic) {
        Some(found) if found == form => {}
        Some(_) => return Err(BytecodeError::WrongForm { expected: form }),
        None => return Err(BytecodeError::InvalidMagic(header.magic)),
    }
    if header.version != BYTECODE_VERSION {
        return Err(BytecodeError::UnsupportedVersion(header.version));
    }
    if header.function_count == 0 {
        return Err(BytecodeError::NoFunctions);
    }
    let file_length = header.file_length as usize;
    if file_length > buffer.len() || file_length < FILE_HEADER_SIZE + HASH_SIZE {
        return Err(BytecodeError::FileLengthMismatch {
            file_length,
            buffer_len: buffer.len(),
        });
    }
    let layout = FileLayout::compute(&header)?;
    let structured_end = file_length - HASH_SIZE;
    if layout.end > structured_end {
        return Err(BytecodeError::Truncated("fixed sections"));
    }
    if header.global_code_index >= header.function_count {
        return Err(BytecodeError::Truncated("global function index"));
    }
    let debug_offset = header.debug_info_offset as usize;
    if debug_offset != 0 && (debug_offset < layout.end || debug_offset >= structured_end) {
        return Err(BytecodeError::Truncated("debug info offset"));
    }
    Ok((header, layout))
}

/// Bytes after the structured region.
pub fn get_epilogue(buffer: &[u8]) -> &[u8] {
    match FileHeader::read(buffer) {
        Ok(header) => buffer.get(header.file_length as usize..).unwrap_or(&[]),
        Err(_) => &[],
    }
}

/// Contents of a string, borrowed when stored as ASCII.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringRef<'a> {
    /// One byte per character
    Ascii(&'a [u8]),
    /// UTF-16 code units
    Utf16(Vec<u16>),
}

impl StringRef<'_> {
    /// Lossy conversion to a Rust string.
    pub fn to_string_lossy(&self) -> String {
        match self {
            Self::Ascii(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            Self::Utf16(units) => String::from_utf16_lossy(units),
        }
    }
}

/// Zero-copy view of one function's exception table.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionTable<'a> {
    bytes: &'a [u8],
}

impl<'a> ExceptionTable<'a> {
    const EMPTY: ExceptionTable<'static> = ExceptionTable { bytes: &[] };

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.bytes.len() / EXCEPTION_HANDLER_SIZE
    }

    /// Whether there are no handlers.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Handler `index`.
    pub fn get(&self, index: usize) -> Option<ExceptionHandlerInfo> {
        let at = index * EXCEPTION_HANDLER_SIZE;
        Some(ExceptionHandlerInfo {
            start: le_u32(self.bytes, at)?,
            end: le_u32(self.bytes, at + 4)?,
            target: le_u32(self.bytes, at + 8)?,
        })
    }

    /// Handlers in table order.
    pub fn iter(&self) -> impl Iterator<Item = ExceptionHandlerInfo> + 'a {
        let this = *self;
        (0..this.len()).filter_map(move |i| this.get(i))
    }

    /// Owned copy.
    pub fn to_vec(&self) -> Vec<ExceptionHandlerInfo> {
        self.iter().collect()
    }
}

/// Read-only provider over a serialized execution-form module.
pub struct BcProvider {
    buffer: Arc<dyn Buffer>,
    header: FileHeader,
    layout: FileLayout,
    debug_info: OnceLock<Option<DebugInfo>>,
    warmup_thread: Mutex<Option<JoinHandle<()>>>,
    warmup_abort: Arc<AtomicBool>,
}

impl fmt::Debug for BcProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BcProvider")
            .field("function_count", &self.header.function_count)
            .field("string_count", &self.header.string_count)
            .field("file_length", &self.header.file_length)
            .finish_non_exhaustive()
    }
}

impl BcProvider {
    /// Validates `buffer` and builds a provider over it.
    pub fn create_from_buffer(buffer: impl Buffer + 'static) -> Result<Self> {
        Self::create_from_buffer_with_options(buffer, CheckOptions::default())
    }

    /// Like [`BcProvider::create_from_buffer`] with extra checks.
    pub fn create_from_buffer_with_options(
        buffer: impl Buffer + 'static,
        options: CheckOptions,
    ) -> Result<Self> {
        Self::create_from_shared(Arc::new(buffer), options)
    }

    /// Builds a provider over an already shared buffer.
    pub fn create_from_shared(buffer: Arc<dyn Buffer>, options: CheckOptions) -> Result<Self> {
        let data = buffer.data();
        let (header, layout) = sanity_check(data, BytecodeForm::Execution)?;
        if options.verify_hash && !hash::hash_is_valid(data) {
            return Err(BytecodeError::HashMismatch);
        }
        let provider = Self {
            buffer,
            header,
            layout,
            debug_info: OnceLock::new(),
            warmup_thread: Mutex::new(None),
            warmup_abort: Arc::new(AtomicBool::new(false)),
        };
        provider.validate_functions()?;

        tracing::debug!(
            target: "otter::hbc",
            functions = provider.header.function_count,
            strings = provider.header.string_count,
            file_length = provider.header.file_length,
            "bytecode provider created"
        );
        Ok(provider)
    }

    fn validate_functions(&self) -> Result<()> {
        let end = self.header.file_length as usize - HASH_SIZE;
        for id in 0..self.header.function_count {
            let at = self.layout.function_headers.start + id as usize * SMALL_HEADER_SIZE;
            let small = SmallFuncHeader::read(self.data(), at)?;
            let header = if small.is_overflowed() {
                let large_at = small.large_header_offset() as usize;
                if large_at < self.layout.end || large_at + LARGE_HEADER_SIZE > end {
                    return Err(BytecodeError::Truncated("large function header"));
                }
                RuntimeFunctionHeader::Large(FunctionHeader::read_large(self.data(), large_at)?)
            } else {
                RuntimeFunctionHeader::Small(small)
            };
            let body_end = header.offset() as usize + header.bytecode_size() as usize;
            if body_end > end {
                return Err(BytecodeError::Truncated("function body"));
            }
            let flags = header.flags();
            if flags.has_exception_handler || flags.has_debug_info {
                let (table, debug_at) = self.info_block(&header);
                if flags.has_exception_handler && table.is_none() {
                    return Err(BytecodeError::Truncated("exception table"));
                }
                if flags.has_debug_info && debug_at.is_none_or(|at| at + DEBUG_OFFSETS_SIZE > end) {
                    return Err(BytecodeError::Truncated("debug offsets"));
                }
            }
        }
        Ok(())
    }

    // ========================================================================
    // Header-level accessors
    // ========================================================================

    /// The raw buffer.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    /// The shared buffer handle.
    pub fn buffer(&self) -> &Arc<dyn Buffer> {
        &self.buffer
    }

    /// File header.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Section layout.
    pub fn layout(&self) -> &FileLayout {
        &self.layout
    }

    /// Module options.
    pub fn options(&self) -> BytecodeOptions {
        self.header.options
    }

    /// Number of functions.
    pub fn function_count(&self) -> u32 {
        self.header.function_count
    }

    /// Index of the global function.
    pub fn global_function_index(&self) -> u32 {
        self.header.global_code_index
    }

    /// Number of strings.
    pub fn string_count(&self) -> u32 {
        self.header.string_count
    }

    /// Segment ID.
    pub fn segment_id(&self) -> u32 {
        self.header.segment_id
    }

    /// SHA-1 of the source text.
    pub fn get_source_hash(&self) -> [u8; 20] {
        self.header.source_hash
    }

    /// Bytes after the structured region.
    pub fn epilogue(&self) -> &[u8] {
        get_epilogue(self.data())
    }

    fn section(&self, section: Section) -> &[u8] {
        self.data().get(section.start..section.end()).unwrap_or(&[])
    }

    // ========================================================================
    // Functions
    // ========================================================================

    /// Header of function `id`.
    pub fn get_function_header(&self, id: u32) -> RuntimeFunctionHeader {
        debug_assert!(id < self.header.function_count, "function {id} out of range");
        let at = self.layout.function_headers.start + id as usize * SMALL_HEADER_SIZE;
        let small = SmallFuncHeader::read(self.data(), at).unwrap_or_default();
        if small.is_overflowed() {
            let large = FunctionHeader::read_large(self.data(), small.large_header_offset() as usize)
                .unwrap_or_default();
            RuntimeFunctionHeader::Large(large)
        } else {
            RuntimeFunctionHeader::Small(small)
        }
    }

    /// Bytecode of function `id`.
    pub fn get_bytecode(&self, id: u32) -> &[u8] {
        let header = self.get_function_header(id);
        let start = header.offset() as usize;
        self.data()
            .get(start..start + header.bytecode_size() as usize)
            .unwrap_or(&[])
    }

    /// Locates the exception table and debug offsets in an info block.
    fn info_block(&self, header: &RuntimeFunctionHeader) -> (Option<ExceptionTable<'_>>, Option<usize>) {
        let flags = header.flags();
        let mut pos = header.info_offset() as usize;
        let mut table = None;
        if flags.has_exception_handler {
            pos = align_up(pos);
            let count = le_u32(self.data(), pos).unwrap_or(u32::MAX) as usize;
            let start = pos + 4;
            let end = count
                .checked_mul(EXCEPTION_HANDLER_SIZE)
                .and_then(|len| start.checked_add(len));
            table = end
                .and_then(|end| self.data().get(start..end))
                .map(|bytes| ExceptionTable { bytes });
            pos = end.unwrap_or(usize::MAX);
        }
        let debug = (flags.has_debug_info && pos != usize::MAX).then(|| align_up(pos));
        (table, debug)
    }

    /// Exception table of function `id`.
    pub fn get_exception_table(&self, id: u32) -> ExceptionTable<'_> {
        let header = self.get_function_header(id);
        if !header.flags().has_exception_handler {
            return ExceptionTable::EMPTY;
        }
        self.info_block(&header).0.unwrap_or(ExceptionTable::EMPTY)
    }

    /// Debug offsets of function `id`, if it has debug info.
    pub fn get_debug_offsets(&self, id: u32) -> Option<DebugOffsets> {
        let header = self.get_function_header(id);
        let at = self.info_block(&header).1?;
        Some(DebugOffsets {
            source_locations: le_u32(self.data(), at)?,
            scope_desc_data: le_u32(self.data(), at + 4)?,
            textified_callees: le_u32(self.data(), at + 8)?,
        })
    }

    /// Handler offset for an exception raised at `offset` in function `id`,
    /// or -1 when no range covers it.
    pub fn find_catch_target_offset(&self, id: u32, offset: u32) -> i32 {
        self.get_exception_table(id)
            .iter()
            .find(|h| h.covers(offset))
            .map_or(-1, |h| h.target as i32)
    }

    /// Offset of function `id` in the concatenation of all bytecode bodies.
    pub fn get_virtual_offset_for_function(&self, id: u32) -> u32 {
        debug_assert!(id < self.header.function_count, "function {id} out of range");
        (0..id)
            .map(|i| self.get_function_header(i).bytecode_size())
            .sum()
    }

    // ========================================================================
    // Strings
    // ========================================================================

    /// String-kind runs.
    pub fn string_kinds(&self) -> Vec<StringKindEntry> {
        self.section(self.layout.string_kinds)
            .chunks_exact(4)
            .map(|c| StringKindEntry::from_raw(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect()
    }

    /// Identifier hashes, in identifier order.
    pub fn identifier_hashes(&self) -> impl Iterator<Item = u32> + '_ {
        self.section(self.layout.identifier_hashes)
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
    }

    /// Resolved entry for string `id`.
    pub fn get_string_table_entry(&self, id: u32) -> StringTableEntry {
        debug_assert!(id < self.header.string_count, "string {id} out of range");
        let at = self.layout.small_string_table.start + id as usize * 4;
        let small = SmallStringTableEntry(le_u32(self.data(), at).unwrap_or_default());
        if small.is_overflowed() {
            let overflow = self.overflow_entry(small.offset());
            StringTableEntry {
                offset: overflow.offset,
                length: overflow.length,
                is_utf16: small.is_utf16(),
            }
        } else {
            StringTableEntry {
                offset: small.offset(),
                length: small.length(),
                is_utf16: small.is_utf16(),
            }
        }
    }

    fn overflow_entry(&self, index: u32) -> OverflowStringTableEntry {
        let at = self.layout.overflow_string_table.start + index as usize * 8;
        OverflowStringTableEntry {
            offset: le_u32(self.data(), at).unwrap_or_default(),
            length: le_u32(self.data(), at + 4).unwrap_or_default(),
        }
    }

    /// Contents of string `id`.
    pub fn get_string_ascii_or_utf16(&self, id: u32) -> StringRef<'_> {
        let entry = self.get_string_table_entry(id);
        let storage = self.section(self.layout.string_storage);
        let start = entry.offset as usize;
        if entry.is_utf16 {
            let bytes = storage
                .get(start..start + entry.length as usize * 2)
                .unwrap_or(&[]);
            StringRef::Utf16(
                bytes
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect(),
            )
        } else {
            StringRef::Ascii(storage.get(start..start + entry.length as usize).unwrap_or(&[]))
        }
    }

    /// String `id` as a Rust string.
    pub fn get_string(&self, id: u32) -> String {
        self.get_string_ascii_or_utf16(id).to_string_lossy()
    }

    // ========================================================================
    // Other tables
    // ========================================================================

    fn storage_entry(&self, table: Section, storage: Section, id: u32) -> &[u8] {
        let at = table.start + id as usize * 8;
        let entry = StorageEntry {
            offset: le_u32(self.data(), at).unwrap_or_default(),
            length: le_u32(self.data(), at + 4).unwrap_or_default(),
        };
        let start = entry.offset as usize;
        self.section(storage)
            .get(start..start + entry.length as usize)
            .unwrap_or(&[])
    }

    /// Bytes of BigInt `id`.
    pub fn get_big_int(&self, id: u32) -> &[u8] {
        debug_assert!(id < self.header.big_int_count, "bigint {id} out of range");
        self.storage_entry(self.layout.big_int_table, self.layout.big_int_storage, id)
    }

    /// Compiled bytes of RegExp `id`.
    pub fn get_reg_exp(&self, id: u32) -> &[u8] {
        debug_assert!(id < self.header.reg_exp_count, "regexp {id} out of range");
        self.storage_entry(self.layout.reg_exp_table, self.layout.reg_exp_storage, id)
    }

    /// Array literal buffer.
    pub fn array_buffer(&self) -> &[u8] {
        self.section(self.layout.array_buffer)
    }

    /// Object key literal buffer.
    pub fn obj_key_buffer(&self) -> &[u8] {
        self.section(self.layout.obj_key_buffer)
    }

    /// Object value literal buffer.
    pub fn obj_value_buffer(&self) -> &[u8] {
        self.section(self.layout.obj_value_buffer)
    }

    /// Whether CJS keys are module IDs rather than filename string IDs.
    pub fn cjs_modules_statically_resolved(&self) -> bool {
        self.header
            .options
            .contains(BytecodeOptions::CJS_MODULES_STATICALLY_RESOLVED)
    }

    /// `(key, function_index)` pairs of the CJS module table.
    pub fn cjs_modules(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.section(self.layout.cjs_module_table)
            .chunks_exact(8)
            .map(|c| {
                (
                    u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                    u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                )
            })
    }

    /// Function index registered for CJS `key`.
    pub fn find_cjs_module(&self, key: u32) -> Option<u32> {
        self.cjs_modules().find(|&(k, _)| k == key).map(|(_, f)| f)
    }

    /// Source string of `function_id`, if one was recorded.
    pub fn get_function_source_id(&self, function_id: u32) -> Option<u32> {
        let table = self.section(self.layout.function_source_table);
        let count = table.len() / 8;
        let key_at = |i: usize| le_u32(table, i * 8).unwrap_or_default();
        let (mut lo, mut hi) = (0usize, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match key_at(mid).cmp(&function_id) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return le_u32(table, mid * 8 + 4),
            }
        }
        None
    }

    // ========================================================================
    // Debug info
    // ========================================================================

    /// Debug info, parsed on first access.
    pub fn get_debug_info(&self) -> Option<&DebugInfo> {
        self.debug_info
            .get_or_init(|| {
                let offset = self.header.debug_info_offset as usize;
                if offset == 0 {
                    return None;
                }
                match DebugInfo::parse(self.data(), offset) {
                    Ok(info) => Some(info),
                    Err(err) => {
                        tracing::warn!(target: "otter::hbc", %err, "failed to parse debug info");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Source location of `offset` in function `id`.
    pub fn get_location_for_address(&self, id: u32, offset: u32) -> Option<DebugSourceLocation> {
        let offsets = self.get_debug_offsets(id)?;
        if offsets.source_locations == crate::format::NO_OFFSET {
            return None;
        }
        self.get_debug_info()?
            .get_location_for_address(offsets.source_locations, offset)
    }

    // ========================================================================
    // Advisory OS hooks
    // ========================================================================

    /// Advise the OS about access to the whole buffer.
    pub fn madvise(&self, advice: Advice) {
        let _ = os::advise(self.data(), advice);
    }

    fn string_table_range(&self) -> &[u8] {
        let start = self.layout.string_kinds.start;
        let end = self.layout.overflow_string_table.end();
        self.data().get(start..end).unwrap_or(&[])
    }

    /// Prefetch the string table.
    pub fn will_need_string_table(&self) {
        let _ = os::advise(self.string_table_range(), Advice::WillNeed);
    }

    /// Advise sequential access to the string table.
    pub fn advise_string_table_sequential(&self) {
        let _ = os::advise(self.string_table_range(), Advice::Sequential);
    }

    /// Advise random access to string entries and storage.
    pub fn advise_string_table_random(&self) {
        let _ = os::advise(self.string_table_range(), Advice::Random);
        let _ = os::advise(self.section(self.layout.string_storage), Advice::Random);
    }

    /// Prefetch the function headers and string table of an unparsed buffer.
    pub fn prefetch(buffer: &[u8]) {
        let Ok(header) = FileHeader::read(buffer) else {
            return;
        };
        let Ok(layout) = FileLayout::compute(&header) else {
            return;
        };
        let end = layout.overflow_string_table.end().min(buffer.len());
        if let Some(range) = buffer.get(layout.function_headers.start..end) {
            let _ = os::advise(range, Advice::WillNeed);
        }
    }

    /// Touch the first `percent`% of the buffer on a background thread.
    ///
    /// No-op if a warmup is already running. A finished one is reaped first.
    pub fn start_warmup(&self, percent: u8) {
        debug_assert!(percent <= 100);
        let mut slot = self.warmup_thread.lock();
        match slot.take() {
            Some(handle) if handle.is_finished() => {
                let _ = handle.join();
            }
            Some(handle) => {
                *slot = Some(handle);
                return;
            }
            None => {}
        }
        let len = self.data().len() * percent.min(100) as usize / 100;
        if len == 0 {
            return;
        }
        self.warmup_abort.store(false, Ordering::Release);
        let buffer = Arc::clone(&self.buffer);
        let abort = Arc::clone(&self.warmup_abort);
        let spawned = std::thread::Builder::new()
            .name("hbc-warmup".into())
            .spawn(move || warmup(buffer.data(), len, &abort));
        match spawned {
            Ok(handle) => {
                tracing::trace!(target: "otter::hbc", bytes = len, "warmup started");
                *slot = Some(handle);
            }
            Err(err) => tracing::warn!(target: "otter::hbc", %err, "failed to spawn warmup thread"),
        }
    }

    /// Abort and join the warmup thread, if any.
    pub fn stop_warmup(&self) {
        let handle = self.warmup_thread.lock().take();
        if let Some(handle) = handle {
            self.warmup_abort.store(true, Ordering::Release);
            let _ = handle.join();
            tracing::trace!(target: "otter::hbc", "warmup stopped");
        }
    }

    /// Whether a warmup thread is still running.
    pub fn is_warming_up(&self) -> bool {
        self.warmup_thread.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for BcProvider {
    fn drop(&mut self) {
        self.stop_warmup();
    }
}

fn warmup(data: &[u8], len: usize, abort: &AtomicBool) {
    let page = os::page_size();
    let check_interval = WARMUP_ABORT_CHECK_PAGES * page;
    let mut next_check = check_interval;
    let mut i = 0;
    while i < len.min(data.len()) {
        std::hint::black_box(data[i]);
        if i >= next_check {
            if abort.load(Ordering::Acquire) {
                return;
            }
            next_check += check_interval;
        }
        i += page;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::MAGIC;

    #[test]
    fn stream_detection() {
        assert!(!is_bytecode_stream(&[]));
        assert!(!is_bytecode_stream(&[1, 2, 3, 4, 5, 6, 7, 8]));
        assert!(is_bytecode_stream(&MAGIC.to_le_bytes()));
        assert!(!is_bytecode_stream(&(!MAGIC).to_le_bytes()));
    }

    #[test]
    fn sanity_check_order() {
        let err = sanity_check(&[0; 10], BytecodeForm::Execution).unwrap_err();
        assert!(matches!(err, BytecodeError::BufferTooSmall { .. }));

        let mut buf = vec![0u8; 256];
        let err = sanity_check(&buf, BytecodeForm::Execution).unwrap_err();
        assert!(matches!(err, BytecodeError::InvalidMagic(0)));

        let mut header = FileHeader {
            magic: !MAGIC,
            version: 1,
            ..Default::default()
        };
        buf[..FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let err = sanity_check(&buf, BytecodeForm::Execution).unwrap_err();
        assert!(matches!(err, BytecodeError::WrongForm { expected: BytecodeForm::Execution }));

        header.magic = MAGIC;
        buf[..FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let err = sanity_check(&buf, BytecodeForm::Execution).unwrap_err();
        assert!(matches!(err, BytecodeError::UnsupportedVersion(1)));

        header.version = BYTECODE_VERSION;
        buf[..FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let err = sanity_check(&buf, BytecodeForm::Execution).unwrap_err();
        assert!(matches!(err, BytecodeError::NoFunctions));

        header.function_count = 1;
        header.file_length = 4096;
        buf[..FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let err = sanity_check(&buf, BytecodeForm::Execution).unwrap_err();
        assert!(matches!(err, BytecodeError::FileLengthMismatch { file_length: 4096, buffer_len: 256 }));

        header.file_length = 256;
        header.string_storage_size = 10_000;
        buf[..FILE_HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let err = sanity_check(&buf, BytecodeForm::Execution).unwrap_err();
        assert!(matches!(err, BytecodeError::Truncated(_)));
    }

    #[test]
    fn epilogue_of_garbage_is_empty() {
        assert!(get_epilogue(&[1, 2, 3]).is_empty());
    }

    #[test]
    fn warmup_stops_on_abort() {
        let data = vec![1u8; 1 << 20];
        let abort = AtomicBool::new(true);
        warmup(&data, data.len(), &abort);
        let abort = AtomicBool::new(false);
        warmup(&data, data.len(), &abort);
    }
}
