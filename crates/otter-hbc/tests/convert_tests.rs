//! Execution/delta form conversion tests.

use otter_hbc::{
    BcProvider, BytecodeError, BytecodeForm, BytecodeFunctionGenerator, BytecodeModuleGenerator,
    BytecodeSerializer, DELTA_MAGIC, Opcode, Operand, convert_bytecode_form, hash_is_valid,
    sanity_check,
};
use proptest::prelude::*;

/// Module whose functions reference strings through every string-operand
/// opcode, plus an overflowed function and a switch table.
fn build_module(string_refs: &[Vec<usize>], strings: &[String], with_big_function: bool) -> Vec<u8> {
    let mut m = BytecodeModuleGenerator::new();
    let ids: Vec<u32> = strings.iter().map(|s| m.add_string(s)).collect();

    for refs in string_refs {
        let mut f = BytecodeFunctionGenerator::new(4);
        for (i, &r) in refs.iter().enumerate() {
            let id = ids[r % ids.len()];
            match i % 3 {
                0 => f.emit(Opcode::LoadConstString, &[Operand::Reg(0), Operand::UInt(id)]),
                1 => f.emit(
                    Opcode::GetById,
                    &[Operand::Reg(1), Operand::Reg(0), Operand::UInt(0), Operand::UInt(id)],
                ),
                _ => f.emit(
                    Opcode::CreateRegExp,
                    &[Operand::Reg(2), Operand::UInt(id), Operand::UInt(ids[0]), Operand::UInt(0)],
                ),
            }
            .unwrap();
        }
        let a = f.new_label();
        let b = f.new_label();
        f.emit_switch_imm(0, 3, b, &[a, b]).unwrap();
        f.bind(a);
        f.emit(Opcode::LoadConstStringLongIndex, &[Operand::Reg(0), Operand::UInt(ids[ids.len() - 1])])
            .unwrap();
        f.bind(b);
        f.emit(Opcode::Ret, &[Operand::Reg(0)]).unwrap();
        m.add_function(f.finish().unwrap());
    }

    if with_big_function {
        let mut big = BytecodeFunctionGenerator::new(2);
        for _ in 0..4500 {
            big.emit(Opcode::LoadConstString, &[Operand::Reg(0), Operand::UInt(ids[0])])
                .unwrap();
        }
        big.emit(Opcode::Ret, &[Operand::Reg(0)]).unwrap();
        m.add_function(big.finish().unwrap());
    }

    BytecodeSerializer::default().serialize(&m.generate()).unwrap()
}

fn sample_strings() -> Vec<String> {
    vec!["alpha".into(), "beta".into(), "y".repeat(280), "gamma".into()]
}

#[test]
fn test_round_trip_restores_every_byte() {
    let original = build_module(&[vec![0, 1, 2, 3], vec![3, 3, 0], vec![]], &sample_strings(), true);
    let mut bytes = original.clone();

    convert_bytecode_form(&mut bytes, BytecodeForm::Delta).unwrap();
    assert_ne!(bytes, original);
    assert_eq!(&bytes[..8], &DELTA_MAGIC.to_le_bytes());
    assert!(hash_is_valid(&bytes));
    assert!(sanity_check(&bytes, BytecodeForm::Delta).is_ok());

    convert_bytecode_form(&mut bytes, BytecodeForm::Execution).unwrap();
    assert_eq!(bytes, original);
}

#[test]
fn test_provider_rejects_delta_form() {
    let mut bytes = build_module(&[vec![1]], &sample_strings(), false);
    convert_bytecode_form(&mut bytes, BytecodeForm::Delta).unwrap();
    assert!(matches!(
        BcProvider::create_from_buffer(bytes),
        Err(BytecodeError::WrongForm {
            expected: BytecodeForm::Execution
        })
    ));
}

#[test]
fn test_delta_form_stores_differences() {
    let strings: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
    let original = build_module(&[vec![2, 2]], &strings, false);
    let provider = BcProvider::create_from_buffer(original.clone()).unwrap();
    let body = provider.get_function_header(0).offset() as usize;
    drop(provider);

    let mut bytes = original;
    convert_bytecode_form(&mut bytes, BytecodeForm::Delta).unwrap();
    // LoadConstString r0, 2 then GetById r1, r0, 0, 2: the second ID becomes 0.
    assert_eq!(u16::from_le_bytes([bytes[body + 2], bytes[body + 3]]), 2);
    assert_eq!(u16::from_le_bytes([bytes[body + 8], bytes[body + 9]]), 0);
}

#[test]
fn test_converted_module_stays_usable() {
    let strings = sample_strings();
    let mut bytes = build_module(&[vec![0, 2], vec![1]], &strings, true);
    convert_bytecode_form(&mut bytes, BytecodeForm::Delta).unwrap();
    convert_bytecode_form(&mut bytes, BytecodeForm::Delta).unwrap();
    convert_bytecode_form(&mut bytes, BytecodeForm::Execution).unwrap();

    let provider = BcProvider::create_from_buffer(bytes).unwrap();
    assert_eq!(provider.get_string(2), strings[2]);
    assert_eq!(provider.function_count(), 3);
}

proptest! {
    #[test]
    fn prop_delta_round_trip(
        strings in proptest::collection::vec("[a-z\u{e9}]{0,300}", 1..40),
        refs in proptest::collection::vec(proptest::collection::vec(0usize..64, 0..24), 1..6),
        big in any::<bool>(),
    ) {
        let original = build_module(&refs, &strings, big);
        let mut bytes = original.clone();
        convert_bytecode_form(&mut bytes, BytecodeForm::Delta).unwrap();
        prop_assert!(hash_is_valid(&bytes));
        convert_bytecode_form(&mut bytes, BytecodeForm::Execution).unwrap();
        prop_assert_eq!(bytes, original);
    }
}
