//! # Otter HBC
//!
//! Compact bytecode container format for the Otter execution substrate.
//!
//! ## Design Principles
//!
//! - **Zero-copy**: [`BcProvider`] decodes headers and tables straight out of
//!   the backing buffer on demand
//! - **Compact**: small/overflow dual encodings for function headers and
//!   string entries keep the common case to a few bytes
//! - **One decoder**: every instruction walk goes through
//!   [`opcode::decode_instruction`]
//! - **Two forms**: execution form (absolute offsets) and delta form, with an
//!   exact in-place conversion between them

#![warn(clippy::all)]
#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod convert;
pub mod debug_info;
pub mod error;
pub mod format;
pub mod generator;
pub mod hash;
pub mod opcode;
pub mod os;
pub mod provider;

pub use convert::convert_bytecode_form;
pub use debug_info::{DebugInfo, DebugSearchResult, DebugSourceLocation};
pub use error::{BytecodeError, Result};
pub use format::{
    BYTECODE_VERSION, BytecodeForm, BytecodeOptions, DELTA_MAGIC, DebugOffsets,
    ExceptionHandlerInfo, FileHeader, FunctionHeader, MAGIC, RuntimeFunctionHeader,
    StringTableEntry,
};
pub use generator::{
    BytecodeFunction, BytecodeFunctionGenerator, BytecodeModule, BytecodeModuleGenerator,
    BytecodeSerializer, Label,
};
pub use hash::{bytecode_hash, hash_is_valid, update_hash};
pub use opcode::{Instruction, InstructionIter, Opcode, Operand, OperandType, decode_instruction};
pub use provider::{
    BcProvider, Buffer, CheckOptions, ExceptionTable, StringRef, get_epilogue, is_bytecode_stream,
    sanity_check,
};
