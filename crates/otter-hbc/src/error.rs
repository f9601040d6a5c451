//! Bytecode errors

use thiserror::Error;

use crate::format::BytecodeForm;

/// Errors that can occur while validating, decoding or rewriting bytecode.
#[derive(Debug, Error)]
pub enum BytecodeError {
    /// Buffer cannot hold even the fixed-size structure being read
    #[error("buffer too small: {len} bytes, need at least {needed}")]
    BufferTooSmall {
        /// Available bytes
        len: usize,
        /// Required bytes
        needed: usize,
    },

    /// Magic number matches neither bytecode form
    #[error("invalid magic number {0:#018x}")]
    InvalidMagic(u64),

    /// Magic number belongs to the other bytecode form
    #[error("bytecode is not in {expected:?} form")]
    WrongForm {
        /// Form the caller asked for
        expected: BytecodeForm,
    },

    /// Unsupported bytecode version
    #[error("unsupported bytecode version {0}")]
    UnsupportedVersion(u32),

    /// Module declares zero functions
    #[error("bytecode declares no functions")]
    NoFunctions,

    /// Header file length exceeds the buffer
    #[error("file length {file_length} exceeds buffer length {buffer_len}")]
    FileLengthMismatch {
        /// Length recorded in the file header
        file_length: usize,
        /// Actual buffer length
        buffer_len: usize,
    },

    /// Footer hash does not match the file contents
    #[error("bytecode hash mismatch")]
    HashMismatch,

    /// A section runs past the end of the file
    #[error("truncated section: {0}")]
    Truncated(&'static str),

    /// Byte at `offset` is not a known opcode
    #[error("invalid opcode {byte:#04x} at offset {offset}")]
    InvalidOpcode {
        /// Offset of the opcode byte
        offset: u32,
        /// The offending byte
        byte: u8,
    },

    /// Instruction stream ends mid-instruction
    #[error("unexpected end of bytecode at offset {offset}")]
    UnexpectedEnd {
        /// Offset where decoding stopped
        offset: u32,
    },

    /// Operand value does not match the opcode's operand table
    #[error("operand {index} does not match {opcode}")]
    OperandMismatch {
        /// Opcode name
        opcode: &'static str,
        /// Operand position
        index: usize,
    },

    /// A value does not fit in the field that has to hold it
    #[error("{field} value {value} does not fit")]
    FieldOverflow {
        /// Field name
        field: &'static str,
        /// Value that overflowed
        value: u64,
    },

    /// A branch refers to a label that was never bound
    #[error("label {0} was never bound")]
    UnboundLabel(u32),

    /// IO error during serialization
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bytecode operations
pub type Result<T> = std::result::Result<T, BytecodeError>;
