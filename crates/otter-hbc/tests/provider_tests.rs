//! Provider tests over modules built with the generator and serializer.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use otter_hbc::format::{FileLayout, SmallFuncHeader, StringKind, align_up};
use otter_hbc::{
    BcProvider, Buffer, BytecodeError, BytecodeFunction, BytecodeFunctionGenerator, BytecodeModuleGenerator,
    BytecodeOptions, BytecodeSerializer, CheckOptions, ExceptionHandlerInfo, Opcode, Operand,
    RuntimeFunctionHeader, StringRef, decode_instruction, hash_is_valid, is_bytecode_stream,
};
use proptest::prelude::*;

fn ret_function(frame_size: u32) -> BytecodeFunction {
    let mut f = BytecodeFunctionGenerator::new(frame_size);
    f.emit(Opcode::LoadConstUndefined, &[Operand::Reg(0)]).unwrap();
    f.emit(Opcode::Ret, &[Operand::Reg(0)]).unwrap();
    f.finish().unwrap()
}

/// Global function with one `Mov`, and `f1` with one `Call` located at 20:300.
fn two_function_module() -> Vec<u8> {
    let mut m = BytecodeModuleGenerator::new();
    let file = m.add_filename("main.js");
    let global_name = m.add_string("global");
    let f1_name = m.add_string("f1");

    let mut global = BytecodeFunctionGenerator::new(3).name(global_name);
    global.emit(Opcode::Mov, &[Operand::Reg(1), Operand::Reg(2)]).unwrap();
    m.add_function(global.finish().unwrap());

    let mut f1 = BytecodeFunctionGenerator::new(10).name(f1_name).filename(file);
    f1.add_debug_location(20, 300);
    f1.emit(Opcode::Call, &[Operand::Reg(9), Operand::Reg(8), Operand::UInt(7)])
        .unwrap();
    m.add_function(f1.finish().unwrap());

    BytecodeSerializer::default().serialize(&m.generate()).unwrap()
}

#[test]
fn test_two_function_module() {
    let bytes = two_function_module();
    assert!(is_bytecode_stream(&bytes));
    assert!(hash_is_valid(&bytes));

    let provider = BcProvider::create_from_buffer(bytes).unwrap();
    assert_eq!(provider.function_count(), 2);
    assert_eq!(provider.global_function_index(), 0);

    let global = provider.get_function_header(0);
    let expected_offset = align_up(FileLayout::compute(provider.header()).unwrap().end) as u32;
    assert_eq!(global.offset(), expected_offset);
    assert_eq!(provider.get_bytecode(0), &[Opcode::Mov as u8, 1, 2]);
    assert_eq!(provider.get_string(global.function_name()), "global");

    let call = decode_instruction(provider.get_bytecode(1), 0).unwrap();
    assert_eq!(call.opcode, Opcode::Call);
    assert_eq!(call.operands.as_slice(), &[Operand::Reg(9), Operand::Reg(8), Operand::UInt(7)]);

    let loc = provider.get_location_for_address(1, 0).unwrap();
    assert_eq!((loc.line, loc.column), (20, 300));
    let info = provider.get_debug_info().unwrap();
    assert_eq!(info.get_filename_by_id(loc.filename_id).as_deref(), Some("main.js"));
    assert!(provider.get_location_for_address(0, 0).is_none());
}

#[test]
fn test_exception_table_lookup() {
    let mut m = BytecodeModuleGenerator::new();
    let mut f = ret_function(1);
    f.exception_handlers = vec![
        ExceptionHandlerInfo { start: 0, end: 10, target: 100 },
        ExceptionHandlerInfo { start: 0, end: 20, target: 200 },
        ExceptionHandlerInfo { start: 50, end: 60, target: 300 },
    ];
    m.add_function(f);
    let provider =
        BcProvider::create_from_buffer(BytecodeSerializer::default().serialize(&m.generate()).unwrap())
            .unwrap();

    assert_eq!(provider.get_exception_table(0).len(), 3);
    assert_eq!(provider.find_catch_target_offset(0, 5), 100);
    assert_eq!(provider.find_catch_target_offset(0, 15), 200);
    assert_eq!(provider.find_catch_target_offset(0, 25), -1);
    assert_eq!(provider.find_catch_target_offset(0, 55), 300);
}

#[test]
fn test_strip_debug_info() {
    let mut m = BytecodeModuleGenerator::new();
    let file = m.add_filename("a.js");
    let mut f = BytecodeFunctionGenerator::new(2).filename(file);
    f.add_debug_location(1, 1);
    f.emit(Opcode::LoadConstZero, &[Operand::Reg(0)]).unwrap();
    f.add_debug_location(2, 4);
    f.emit(Opcode::Ret, &[Operand::Reg(0)]).unwrap();
    m.add_function(f.finish().unwrap());
    let module = m.generate();

    let full = BytecodeSerializer::new(false).serialize(&module).unwrap();
    let stripped = BytecodeSerializer::new(true).serialize(&module).unwrap();
    assert!(stripped.len() < full.len());

    let full = BcProvider::create_from_buffer(full).unwrap();
    assert!(full.get_function_header(0).flags().has_debug_info);
    assert_eq!(full.get_location_for_address(0, 2).unwrap().line, 2);

    let stripped = BcProvider::create_from_buffer(stripped).unwrap();
    assert!(!stripped.get_function_header(0).flags().has_debug_info);
    assert!(stripped.get_debug_offsets(0).is_none());
    assert!(stripped.get_debug_info().is_none());
}

#[test]
fn test_string_table_entries() {
    let mut m = BytecodeModuleGenerator::new();
    let ascii = m.add_string("hello");
    let utf16 = m.add_string("héllo");
    let ident = m.add_identifier("length");
    let long = "x".repeat(300);
    let long_id = m.add_string(&long);
    m.add_function(ret_function(1));
    let provider =
        BcProvider::create_from_buffer(BytecodeSerializer::default().serialize(&m.generate()).unwrap())
            .unwrap();

    let e = provider.get_string_table_entry(ascii);
    assert_eq!((e.offset, e.length, e.is_utf16), (0, 5, false));
    let e = provider.get_string_table_entry(utf16);
    assert_eq!((e.offset, e.length, e.is_utf16), (5, 5, true));
    let e = provider.get_string_table_entry(ident);
    assert_eq!((e.offset, e.length, e.is_utf16), (15, 6, false));
    let e = provider.get_string_table_entry(long_id);
    assert_eq!((e.offset, e.length, e.is_utf16), (21, 300, false));
    assert_eq!(provider.header().overflow_string_count, 1);

    assert_eq!(provider.get_string_ascii_or_utf16(ascii), StringRef::Ascii(b"hello"));
    assert_eq!(provider.get_string(utf16), "héllo");
    assert_eq!(provider.get_string(long_id), long);

    let kinds = provider.string_kinds();
    assert_eq!(kinds.len(), 3);
    assert_eq!(kinds[1].kind, StringKind::Identifier);
    let hashes: Vec<u32> = provider.identifier_hashes().collect();
    assert_eq!(hashes, vec![otter_hbc::hash::identifier_hash("length")]);
}

#[test]
fn test_overflowed_function_header() {
    let mut m = BytecodeModuleGenerator::new();
    let mut big = BytecodeFunctionGenerator::new(300).param_count(40);
    for _ in 0..6000 {
        big.emit(Opcode::Mov, &[Operand::Reg(1), Operand::Reg(2)]).unwrap();
    }
    big.emit(Opcode::Ret, &[Operand::Reg(1)]).unwrap();
    let mut big = big.finish().unwrap();
    big.exception_handlers = vec![ExceptionHandlerInfo { start: 3, end: 9, target: 18_000 }];
    m.add_function(ret_function(1));
    m.add_function(big);
    m.add_function(ret_function(2));
    let provider =
        BcProvider::create_from_buffer(BytecodeSerializer::default().serialize(&m.generate()).unwrap())
            .unwrap();

    let header = provider.get_function_header(1);
    assert!(matches!(header, RuntimeFunctionHeader::Large(_)));
    assert_eq!(header.bytecode_size(), 6000 * 3 + 2);
    assert_eq!(header.frame_size(), 300);
    assert_eq!(header.param_count(), 40);
    assert_eq!(provider.get_bytecode(1).len(), 18_002);
    assert_eq!(provider.find_catch_target_offset(1, 4), 18_000);

    assert!(matches!(provider.get_function_header(2), RuntimeFunctionHeader::Small(_)));
    assert_eq!(provider.get_virtual_offset_for_function(2), 4 + 18_002);
}

#[test]
fn test_small_header_reencodes_identically() {
    let bytes = two_function_module();
    let provider = BcProvider::create_from_buffer(bytes.clone()).unwrap();
    let start = provider.layout().function_headers.start;
    for id in 0..provider.function_count() as usize {
        let at = start + id * 16;
        let small = SmallFuncHeader::read(&bytes, at).unwrap();
        let reencoded = SmallFuncHeader::new(&small.to_function_header()).unwrap();
        assert_eq!(&reencoded.to_bytes()[..], &bytes[at..at + 16]);
    }
    assert_eq!(two_function_module(), bytes);
}

#[test]
fn test_hash_verification() {
    let mut bytes = two_function_module();
    let body = BcProvider::create_from_buffer(bytes.clone())
        .unwrap()
        .get_function_header(0)
        .offset() as usize;
    bytes[body + 1] ^= 0x01;

    let verify = CheckOptions { verify_hash: true };
    let err = BcProvider::create_from_buffer_with_options(bytes.clone(), verify).unwrap_err();
    assert!(matches!(err, BytecodeError::HashMismatch));
    assert!(!err.to_string().is_empty());
    assert!(BcProvider::create_from_buffer(bytes.clone()).is_ok());

    otter_hbc::update_hash(&mut bytes).unwrap();
    assert!(BcProvider::create_from_buffer_with_options(bytes, verify).is_ok());
}

#[test]
fn test_malformed_buffers_are_errors() {
    let bytes = two_function_module();
    let truncated = bytes[..bytes.len() - 8].to_vec();
    assert!(matches!(
        BcProvider::create_from_buffer(truncated),
        Err(BytecodeError::FileLengthMismatch { .. })
    ));
    assert!(matches!(
        BcProvider::create_from_buffer(vec![0u8; 4]),
        Err(BytecodeError::BufferTooSmall { .. })
    ));

    let mut bad_body = bytes.clone();
    let start = BcProvider::create_from_buffer(bytes).unwrap().layout().function_headers.start;
    // Claim a body far past the end of the file.
    bad_body[start..start + 4].copy_from_slice(&0x01FF_FFF0u32.to_le_bytes());
    assert!(matches!(
        BcProvider::create_from_buffer(bad_body),
        Err(BytecodeError::Truncated("function body"))
    ));
}

#[test]
fn test_epilogue_and_side_tables() {
    let mut m = BytecodeModuleGenerator::new().options(BytecodeOptions::CJS_MODULES_STATICALLY_RESOLVED);
    m.add_function(ret_function(1));
    let second = m.add_function(ret_function(1));
    let src = m.add_string("function f() {}");
    m.add_function_source(second, src);
    m.add_cjs_module(42, second);
    let big = m.add_big_int(&[1, 2, 3]);
    let re = m.add_reg_exp(&[9, 8]);
    let arr = m.append_array_buffer(&[5, 5]);
    let (keys, values) = m.append_object_buffers(&[1], &[2, 2]);

    let mut bytes = BytecodeSerializer::default().serialize(&m.generate()).unwrap();
    bytes.extend_from_slice(b"EPILOGUE");
    let provider = BcProvider::create_from_buffer(bytes).unwrap();

    assert_eq!(provider.epilogue(), b"EPILOGUE");
    assert!(provider.cjs_modules_statically_resolved());
    assert_eq!(provider.find_cjs_module(42), Some(second));
    assert_eq!(provider.find_cjs_module(7), None);
    assert_eq!(provider.get_function_source_id(second), Some(src));
    assert_eq!(provider.get_function_source_id(0), None);
    assert_eq!(provider.get_big_int(big), &[1, 2, 3]);
    assert_eq!(provider.get_reg_exp(re), &[9, 8]);
    assert_eq!(&provider.array_buffer()[arr as usize..], &[5, 5]);
    assert_eq!(provider.obj_key_buffer()[keys as usize], 1);
    assert_eq!(&provider.obj_value_buffer()[values as usize..], &[2, 2]);
}

#[test]
fn test_debug_info_is_built_once_across_threads() {
    let provider = Arc::new(BcProvider::create_from_buffer(two_function_module()).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let provider = Arc::clone(&provider);
            std::thread::spawn(move || provider.get_debug_info().map(|d| d as *const _ as usize))
        })
        .collect();
    let addrs: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(addrs.iter().all(|a| a.is_some() && *a == addrs[0]));
}

#[test]
fn test_warmup_and_advice_are_transparent() {
    let bytes = two_function_module();
    let provider = BcProvider::create_from_buffer(bytes.clone()).unwrap();
    provider.start_warmup(100);
    provider.start_warmup(50);
    provider.madvise(otter_hbc::os::Advice::Random);
    provider.will_need_string_table();
    provider.advise_string_table_sequential();
    provider.advise_string_table_random();
    BcProvider::prefetch(&bytes);
    provider.stop_warmup();
    assert!(!provider.is_warming_up());
    assert_eq!(provider.data(), &bytes[..]);

    provider.start_warmup(0);
    assert!(!provider.is_warming_up());
    provider.start_warmup(10);
    drop(provider);
}

/// Counts reads made by the warmup thread.
struct CountingBuffer {
    bytes: Vec<u8>,
    warmup_reads: AtomicUsize,
}

impl Buffer for CountingBuffer {
    fn data(&self) -> &[u8] {
        if std::thread::current().name() == Some("hbc-warmup") {
            self.warmup_reads.fetch_add(1, Ordering::Relaxed);
        }
        &self.bytes
    }
}

#[test]
fn test_finished_warmup_can_run_again() {
    let buffer = Arc::new(CountingBuffer {
        bytes: two_function_module(),
        warmup_reads: AtomicUsize::new(0),
    });
    let provider = BcProvider::create_from_shared(buffer.clone(), CheckOptions::default()).unwrap();

    provider.start_warmup(100);
    while provider.is_warming_up() {
        std::thread::yield_now();
    }
    assert_eq!(buffer.warmup_reads.load(Ordering::Relaxed), 1);

    provider.start_warmup(100);
    provider.stop_warmup();
    assert_eq!(buffer.warmup_reads.load(Ordering::Relaxed), 2);
    assert!(!provider.is_warming_up());
}

proptest! {
    #[test]
    fn prop_string_entries_resolve_through_overflow(
        strings in proptest::collection::vec("[a-z\u{e9}\u{4e2d}]{0,400}", 1..20),
    ) {
        let mut m = BytecodeModuleGenerator::new();
        let ids: Vec<u32> = strings.iter().map(|s| m.add_string(s)).collect();
        m.add_function(ret_function(1));
        let bytes = BytecodeSerializer::default().serialize(&m.generate()).unwrap();
        let provider = BcProvider::create_from_buffer(bytes).unwrap();
        for (s, id) in strings.iter().zip(ids) {
            prop_assert_eq!(&provider.get_string(id), s);
            let entry = provider.get_string_table_entry(id);
            prop_assert_eq!(entry.is_utf16, !s.is_ascii());
            prop_assert_eq!(entry.length as usize, s.encode_utf16().count());
        }
    }
}
