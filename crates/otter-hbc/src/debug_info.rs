//! Debug-info section: filenames, file regions and source-location streams.

use serde::{Deserialize, Serialize};

use crate::error::{BytecodeError, Result};
use crate::format::{SmallStringTableEntry, align_up, le_u32};

/// Size of the debug-info section header.
pub const DEBUG_HEADER_SIZE: usize = 7 * 4;

/// A decoded source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugSourceLocation {
    /// Bytecode offset within the function
    pub address: u32,
    /// Filename table index
    pub filename_id: u32,
    /// Source-mapping URL string ID
    pub source_mapping_url_id: u32,
    /// 1-based line
    pub line: u32,
    /// 1-based column
    pub column: u32,
    /// 1-based statement index within the function, 0 when unknown
    pub statement: u32,
}

/// Maps a range of the location stream to a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DebugFileRegion {
    /// First data offset belonging to this file
    pub from_address: u32,
    /// Filename table index
    pub filename_id: u32,
    /// Source-mapping URL string ID
    pub source_mapping_url_id: u32,
}

/// Result of a line/column search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSearchResult {
    /// Function containing the match
    pub function_index: u32,
    /// Offset within that function
    pub bytecode_offset: u32,
    /// Line found
    pub line: u32,
    /// Column found
    pub column: u32,
}

// ============================================================================
// SLEB128
// ============================================================================

/// Appends `value` as signed LEB128.
pub fn encode_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads signed LEB128 at `*pos`, advancing it.
pub fn decode_sleb128(data: &[u8], pos: &mut usize) -> Option<i64> {
    let mut result: i64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *data.get(*pos)?;
        *pos += 1;
        if shift < 64 {
            result |= ((byte & 0x7F) as i64) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Some(result);
        }
        if shift > 70 {
            return None;
        }
    }
}

/// One function's location stream, decoded lazily.
struct LocationStream<'a> {
    data: &'a [u8],
    pos: usize,
    current: DebugSourceLocation,
}

impl<'a> LocationStream<'a> {
    /// Opens the stream at `offset`, returning it with its function index.
    fn open(data: &'a [u8], offset: u32) -> Option<(u32, Self)> {
        let mut pos = offset as usize;
        let function_index = decode_sleb128(data, &mut pos)?;
        let line = decode_sleb128(data, &mut pos)?;
        let column = decode_sleb128(data, &mut pos)?;
        let current = DebugSourceLocation {
            line: line as u32,
            column: column as u32,
            ..Default::default()
        };
        Some((function_index as u32, Self { data, pos, current }))
    }

    /// Offset just past the terminator, once the stream is exhausted.
    fn position(&self) -> usize {
        self.pos
    }
}

impl Iterator for LocationStream<'_> {
    type Item = DebugSourceLocation;

    fn next(&mut self) -> Option<Self::Item> {
        let address_delta = decode_sleb128(self.data, &mut self.pos)?;
        if address_delta == -1 {
            return None;
        }
        let line_delta = decode_sleb128(self.data, &mut self.pos)?;
        let column_delta = decode_sleb128(self.data, &mut self.pos)?;
        let statement_delta = decode_sleb128(self.data, &mut self.pos)?;
        let loc = &mut self.current;
        loc.address = (loc.address as i64 + address_delta) as u32;
        loc.line = (loc.line as i64 + line_delta) as u32;
        loc.column = (loc.column as i64 + column_delta) as u32;
        loc.statement = (loc.statement as i64 + statement_delta) as u32;
        Some(*loc)
    }
}

/// Appends one function's location stream to `out`, returning its offset.
///
/// `locations` must be sorted by address.
pub fn write_location_stream(
    out: &mut Vec<u8>,
    function_index: u32,
    locations: &[DebugSourceLocation],
) -> u32 {
    let offset = out.len() as u32;
    let (line, column) = locations.first().map_or((0, 0), |l| (l.line, l.column));
    encode_sleb128(out, function_index as i64);
    encode_sleb128(out, line as i64);
    encode_sleb128(out, column as i64);
    let mut prev = DebugSourceLocation {
        line,
        column,
        ..Default::default()
    };
    for loc in locations {
        encode_sleb128(out, loc.address as i64 - prev.address as i64);
        encode_sleb128(out, loc.line as i64 - prev.line as i64);
        encode_sleb128(out, loc.column as i64 - prev.column as i64);
        encode_sleb128(out, loc.statement as i64 - prev.statement as i64);
        prev = *loc;
    }
    encode_sleb128(out, -1);
    offset
}

// ============================================================================
// DebugInfo
// ============================================================================

/// Decoded debug-info section.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebugInfo {
    filename_table: Vec<SmallStringTableEntry>,
    filename_storage: Vec<u8>,
    files: Vec<DebugFileRegion>,
    scope_desc_data_offset: u32,
    textified_callee_offset: u32,
    string_table_offset: u32,
    data: Vec<u8>,
}

impl DebugInfo {
    /// Builds a section from its parts. Every filename must be shorter than
    /// 255 bytes.
    pub fn new(filenames: &[String], files: Vec<DebugFileRegion>, data: Vec<u8>) -> Result<Self> {
        let mut filename_table = Vec::with_capacity(filenames.len());
        let mut filename_storage = Vec::new();
        for name in filenames {
            let len = name.len() as u32;
            if len > crate::format::SMALL_STRING_MAX_LENGTH {
                return Err(BytecodeError::FieldOverflow {
                    field: "filename length",
                    value: len as u64,
                });
            }
            filename_table.push(SmallStringTableEntry::new(
                filename_storage.len() as u32,
                len,
                false,
            ));
            filename_storage.extend_from_slice(name.as_bytes());
        }
        let end = data.len() as u32;
        Ok(Self {
            filename_table,
            filename_storage,
            files,
            scope_desc_data_offset: end,
            textified_callee_offset: end,
            string_table_offset: end,
            data,
        })
    }

    /// Decodes the section at `offset` in `buf`.
    pub fn parse(buf: &[u8], offset: usize) -> Result<Self> {
        let word = |i: usize| le_u32(buf, offset + i * 4).ok_or(BytecodeError::Truncated("debug info header"));
        let filename_count = word(0)? as usize;
        let filename_storage_size = word(1)? as usize;
        let file_region_count = word(2)? as usize;
        let scope_desc_data_offset = word(3)?;
        let textified_callee_offset = word(4)?;
        let string_table_offset = word(5)?;
        let debug_data_size = word(6)? as usize;

        let mut pos = offset + DEBUG_HEADER_SIZE;
        let take = |pos: &mut usize, len: usize, name: &'static str| -> Result<std::ops::Range<usize>> {
            let start = *pos;
            let end = start
                .checked_add(len)
                .filter(|&end| end <= buf.len())
                .ok_or(BytecodeError::Truncated(name))?;
            *pos = end;
            Ok(start..end)
        };

        let table = take(&mut pos, filename_count.saturating_mul(4), "debug filename table")?;
        let filename_table = buf[table]
            .chunks_exact(4)
            .map(|c| SmallStringTableEntry(u32::from_le_bytes([c[0], c[1], c[2], c[3]])))
            .collect();
        let storage = take(&mut pos, filename_storage_size, "debug filename storage")?;
        let filename_storage = buf[storage].to_vec();
        pos = align_up(pos);

        let regions = take(&mut pos, file_region_count.saturating_mul(12), "debug file regions")?;
        let files = buf[regions]
            .chunks_exact(12)
            .map(|c| DebugFileRegion {
                from_address: u32::from_le_bytes([c[0], c[1], c[2], c[3]]),
                filename_id: u32::from_le_bytes([c[4], c[5], c[6], c[7]]),
                source_mapping_url_id: u32::from_le_bytes([c[8], c[9], c[10], c[11]]),
            })
            .collect();
        let data = take(&mut pos, debug_data_size, "debug data")?;

        Ok(Self {
            filename_table,
            filename_storage,
            files,
            scope_desc_data_offset,
            textified_callee_offset,
            string_table_offset,
            data: buf[data].to_vec(),
        })
    }

    /// Appends the encoded section to `out`.
    pub fn write(&self, out: &mut Vec<u8>) {
        let header = [
            self.filename_table.len() as u32,
            self.filename_storage.len() as u32,
            self.files.len() as u32,
            self.scope_desc_data_offset,
            self.textified_callee_offset,
            self.string_table_offset,
            self.data.len() as u32,
        ];
        for word in header {
            out.extend_from_slice(&word.to_le_bytes());
        }
        for entry in &self.filename_table {
            out.extend_from_slice(&entry.0.to_le_bytes());
        }
        out.extend_from_slice(&self.filename_storage);
        out.resize(align_up(out.len()), 0);
        for region in &self.files {
            out.extend_from_slice(&region.from_address.to_le_bytes());
            out.extend_from_slice(&region.filename_id.to_le_bytes());
            out.extend_from_slice(&region.source_mapping_url_id.to_le_bytes());
        }
        out.extend_from_slice(&self.data);
    }

    /// File regions.
    pub fn files(&self) -> &[DebugFileRegion] {
        &self.files
    }

    /// Raw debug data.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of filenames.
    pub fn filename_count(&self) -> usize {
        self.filename_table.len()
    }

    /// Offset of the scope descriptor data, also the end of the location streams.
    pub fn scope_desc_data_offset(&self) -> u32 {
        self.scope_desc_data_offset
    }

    /// Offset of the textified callee data.
    pub fn textified_callee_offset(&self) -> u32 {
        self.textified_callee_offset
    }

    /// Offset of the string table inside the debug data.
    pub fn string_table_offset(&self) -> u32 {
        self.string_table_offset
    }

    /// Filename with table index `id`.
    pub fn get_filename_by_id(&self, id: u32) -> Option<String> {
        let entry = self.filename_table.get(id as usize)?;
        let start = entry.offset() as usize;
        let bytes = self.filename_storage.get(start..start + entry.length() as usize)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Region covering data offset `debug_offset`.
    fn region_for(&self, debug_offset: u32) -> Option<&DebugFileRegion> {
        self.files
            .iter()
            .filter(|r| r.from_address <= debug_offset)
            .max_by_key(|r| r.from_address)
    }

    /// Location of `offset_in_function` for the stream at `debug_offset`.
    ///
    /// Returns the last record whose address is at or before the offset.
    pub fn get_location_for_address(
        &self,
        debug_offset: u32,
        offset_in_function: u32,
    ) -> Option<DebugSourceLocation> {
        let region = self.region_for(debug_offset)?;
        let (_, stream) = LocationStream::open(&self.data, debug_offset)?;
        let mut found = stream
            .take_while(|loc| loc.address <= offset_in_function)
            .last()?;
        found.filename_id = region.filename_id;
        found.source_mapping_url_id = region.source_mapping_url_id;
        Some(found)
    }

    /// First bytecode location listed at `line` (and `column`, if given) in
    /// file `filename_id`.
    pub fn get_address_for_location(
        &self,
        filename_id: u32,
        line: u32,
        column: Option<u32>,
    ) -> Option<DebugSearchResult> {
        let stream_end = (self.scope_desc_data_offset as usize).min(self.data.len());
        for (i, region) in self.files.iter().enumerate() {
            if region.filename_id != filename_id {
                continue;
            }
            let region_end = self
                .files
                .get(i + 1)
                .map_or(stream_end, |next| next.from_address as usize)
                .min(stream_end);
            let mut pos = region.from_address as usize;
            while pos < region_end {
                let (function_index, mut stream) = LocationStream::open(&self.data, pos as u32)?;
                for loc in stream.by_ref() {
                    if loc.line == line && column.is_none_or(|c| c == loc.column) {
                        return Some(DebugSearchResult {
                            function_index,
                            bytecode_offset: loc.address,
                            line: loc.line,
                            column: loc.column,
                        });
                    }
                }
                if stream.position() <= pos {
                    break;
                }
                pos = stream.position();
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loc(address: u32, line: u32, column: u32) -> DebugSourceLocation {
        DebugSourceLocation {
            address,
            line,
            column,
            ..Default::default()
        }
    }

    #[test]
    fn sleb128_edges() {
        for value in [0i64, 1, -1, 63, 64, -64, -65, 300, -300, i32::MAX as i64, i32::MIN as i64] {
            let mut out = Vec::new();
            encode_sleb128(&mut out, value);
            let mut pos = 0;
            assert_eq!(decode_sleb128(&out, &mut pos), Some(value));
            assert_eq!(pos, out.len());
        }
        assert_eq!(decode_sleb128(&[0x80], &mut 0), None);
    }

    fn sample() -> DebugInfo {
        let mut data = Vec::new();
        let first = write_location_stream(&mut data, 0, &[loc(0, 1, 1), loc(4, 2, 5), loc(9, 2, 12)]);
        let second = write_location_stream(&mut data, 1, &[loc(0, 20, 300), loc(6, 21, 3)]);
        assert_eq!(first, 0);
        let regions = vec![
            DebugFileRegion {
                from_address: first,
                filename_id: 0,
                source_mapping_url_id: 0,
            },
            DebugFileRegion {
                from_address: second,
                filename_id: 1,
                source_mapping_url_id: 0,
            },
        ];
        DebugInfo::new(&["main.js".into(), "lib.js".into()], regions, data).unwrap()
    }

    #[test]
    fn location_is_last_record_at_or_before_offset() {
        let info = sample();
        assert_eq!(info.get_location_for_address(0, 0).unwrap().line, 1);
        let at7 = info.get_location_for_address(0, 7).unwrap();
        assert_eq!((at7.address, at7.line, at7.column), (4, 2, 5));
        let at100 = info.get_location_for_address(0, 100).unwrap();
        assert_eq!(at100.column, 12);
    }

    #[test]
    fn filename_comes_from_covering_region() {
        let info = sample();
        let second = info.files()[1].from_address;
        let found = info.get_location_for_address(second, 0).unwrap();
        assert_eq!(found.filename_id, 1);
        assert_eq!((found.line, found.column), (20, 300));
        assert_eq!(info.get_filename_by_id(1).as_deref(), Some("lib.js"));
        assert_eq!(info.get_filename_by_id(5), None);
    }

    #[test]
    fn address_search_by_line_and_column() {
        let info = sample();
        let hit = info.get_address_for_location(0, 2, Some(12)).unwrap();
        assert_eq!((hit.function_index, hit.bytecode_offset), (0, 9));
        let hit = info.get_address_for_location(0, 2, None).unwrap();
        assert_eq!(hit.bytecode_offset, 4);
        let hit = info.get_address_for_location(1, 21, None).unwrap();
        assert_eq!((hit.function_index, hit.bytecode_offset), (1, 6));
        assert!(info.get_address_for_location(1, 2, None).is_none());
    }

    #[test]
    fn section_round_trip() {
        let info = sample();
        let mut out = vec![0xAA; 8];
        info.write(&mut out);
        assert_eq!(DebugInfo::parse(&out, 8).unwrap(), info);
    }

    #[test]
    fn truncated_section_is_an_error() {
        let info = sample();
        let mut out = Vec::new();
        info.write(&mut out);
        out.truncate(out.len() - 3);
        assert!(matches!(DebugInfo::parse(&out, 0), Err(BytecodeError::Truncated(_))));
    }
}
