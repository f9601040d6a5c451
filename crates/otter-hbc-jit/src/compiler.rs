//! Baseline JIT compiler for HBC functions.
//!
//! Compilation is a single pass per function: validate the instruction
//! stream, discover basic blocks, then lower every block in offset order.
//! Any instruction the emitter cannot lower aborts the whole function with a
//! [`JitError`], and the caller keeps interpreting it.

use std::collections::BTreeSet;
use std::fmt;

use dynasmrt::{AssemblyOffset, ExecutableBuffer};
use otter_hbc::opcode::{Instruction, InstructionIter, Opcode, Operand};
use otter_hbc::{BcProvider, BytecodeError, BytecodeFunction, ExceptionHandlerInfo};

use crate::asm::MAX_FRAME_SIZE;
use crate::config::JitConfig;
use crate::context::CompiledEntry;
use crate::discover_bb::discover_bb;
use crate::emitter::Emitter;

/// Errors produced by the baseline JIT compiler.
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    /// Bytecode instruction is not supported by the baseline emitter.
    #[error("unsupported instruction at offset {offset}: {opcode}")]
    UnsupportedInstruction {
        /// Offset of the instruction.
        offset: u32,
        /// Its opcode.
        opcode: Opcode,
    },

    /// Branch, switch or handler target that is not an instruction start.
    #[error("invalid jump target {target} from offset {offset} (len={code_len})")]
    InvalidJumpTarget {
        /// Offset of the instruction holding the target.
        offset: u32,
        /// The target offset.
        target: u32,
        /// Bytecode length of the function.
        code_len: u32,
    },

    /// Frame slots beyond what a scaled 12-bit offset can address.
    #[error("frame of {frame_size} registers is too large")]
    FrameTooLarge {
        /// Registers in the frame.
        frame_size: u32,
    },

    /// Register operand, or `Call` argument window, outside the frame.
    #[error("register {register} at offset {offset} is outside a frame of {frame_size}")]
    RegisterOutOfRange {
        /// Offset of the instruction.
        offset: u32,
        /// Offending register, or argument count for `Call`.
        register: u32,
        /// Registers in the frame.
        frame_size: u32,
    },

    /// Malformed instruction stream.
    #[error(transparent)]
    Bytecode(#[from] BytecodeError),

    /// Label resolution or relocation failed.
    #[error("assembler error: {0}")]
    Assembler(String),

    /// Executable memory could not be mapped.
    #[error("executable memory: {0}")]
    ExecutableMemory(std::io::Error),
}

/// Native code for one bytecode function.
pub struct CompiledFunction {
    buffer: ExecutableBuffer,
    entry: AssemblyOffset,
    block_offsets: Vec<u32>,
    slow_path_count: usize,
    frame_size: u32,
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("entry", &self.entry_ptr())
            .field("code_size", &self.code_size())
            .field("blocks", &self.block_offsets.len())
            .field("slow_path_count", &self.slow_path_count)
            .finish()
    }
}

impl CompiledFunction {
    /// Emitted bytes: code, thunks and read-only data.
    pub fn code(&self) -> &[u8] {
        &self.buffer
    }

    /// Size of [`CompiledFunction::code`].
    pub fn code_size(&self) -> usize {
        self.buffer.len()
    }

    /// Native offset of each basic block, in block order.
    pub fn block_offsets(&self) -> &[u32] {
        &self.block_offsets
    }

    /// Number of out-of-line slow paths.
    pub fn slow_path_count(&self) -> usize {
        self.slow_path_count
    }

    /// Registers the caller must provide.
    pub fn frame_size(&self) -> u32 {
        self.frame_size
    }

    /// Address of the entry point.
    pub fn entry_ptr(&self) -> *const u8 {
        self.buffer.ptr(self.entry)
    }

    /// Entry point as a callable function pointer.
    ///
    /// # Safety
    ///
    /// The returned pointer is only valid while `self` is alive, and only
    /// executable on aarch64.
    pub unsafe fn entry(&self) -> CompiledEntry {
        // SAFETY: the buffer starts with a function of this signature.
        unsafe { std::mem::transmute::<*const u8, CompiledEntry>(self.entry_ptr()) }
    }

    /// Runs the function on `frame`.
    ///
    /// # Safety
    ///
    /// `frame` must hold at least [`CompiledFunction::frame_size`] values and
    /// `ctx.args` must point to `ctx.argc` values.
    #[cfg(target_arch = "aarch64")]
    pub unsafe fn call(&self, ctx: &mut crate::context::JitContext, frame: &mut [u64]) -> u64 {
        debug_assert!(frame.len() >= self.frame_size as usize);
        // SAFETY: upheld by the caller.
        unsafe { (self.entry())(ctx, frame.as_mut_ptr()) }
    }
}

/// Everything the compiler needs from one function.
#[derive(Debug, Clone, Copy)]
pub struct FunctionSource<'a> {
    /// Instruction bytes.
    pub code: &'a [u8],
    /// Handlers, innermost first.
    pub exception_table: &'a [ExceptionHandlerInfo],
    /// Frame registers.
    pub frame_size: u32,
    /// Leading registers known to hold numbers.
    pub number_reg_count: u32,
    /// Following registers known to hold non-pointers.
    pub non_ptr_reg_count: u32,
}

impl<'a> FunctionSource<'a> {
    /// View of a generated function.
    pub fn from_function(function: &'a BytecodeFunction) -> Self {
        Self {
            code: &function.code,
            exception_table: &function.exception_handlers,
            frame_size: function.header.frame_size,
            number_reg_count: function.header.number_reg_count,
            non_ptr_reg_count: function.header.non_ptr_reg_count,
        }
    }
}

/// Baseline aarch64 JIT compiler.
#[derive(Debug, Clone, Default)]
pub struct JitCompiler {
    config: JitConfig,
}

impl JitCompiler {
    /// Compiler configured from the environment.
    pub fn new() -> Self {
        Self::with_config(JitConfig::from_env())
    }

    /// Compiler with an explicit configuration.
    pub fn with_config(config: JitConfig) -> Self {
        Self { config }
    }

    /// Active configuration.
    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    /// Compiles function `function_id` of `provider`.
    pub fn compile_function(&self, provider: &BcProvider, function_id: u32) -> Result<CompiledFunction, JitError> {
        let header = provider.get_function_header(function_id);
        let exception_table = provider.get_exception_table(function_id).to_vec();
        let source = FunctionSource {
            code: provider.get_bytecode(function_id),
            exception_table: &exception_table,
            frame_size: header.frame_size(),
            number_reg_count: header.number_reg_count(),
            non_ptr_reg_count: header.non_ptr_reg_count(),
        };
        tracing::debug!(target: "otter::jit", function = function_id, "compile start");
        self.compile_source(&source)
    }

    /// Compiles a function given by its parts.
    pub fn compile_source(&self, source: &FunctionSource<'_>) -> Result<CompiledFunction, JitError> {
        let FunctionSource {
            code,
            exception_table,
            frame_size,
            ..
        } = *source;
        if frame_size > MAX_FRAME_SIZE {
            return Err(JitError::FrameTooLarge { frame_size });
        }

        let instructions = InstructionIter::new(code).collect::<Result<Vec<_>, _>>()?;
        validate(&instructions, code, exception_table, frame_size)?;
        let bbs = discover_bb(code, exception_table)?;

        let mut emitter = Emitter::new(&bbs, exception_table, frame_size)?;
        emitter.enter(source.number_reg_count, source.non_ptr_reg_count);

        let mut remaining = instructions.iter().peekable();
        for block in 0..bbs.block_count() {
            let Some((_, end)) = bbs.range(block) else {
                break;
            };
            emitter.new_basic_block(block);
            while let Some(inst) = remaining.next_if(|inst| inst.offset < end) {
                if let Err(err) = emitter.emit(inst, code) {
                    if let JitError::UnsupportedInstruction { offset, opcode } = &err {
                        tracing::debug!(target: "otter::jit", offset, %opcode, "unsupported instruction");
                    }
                    return Err(err);
                }
            }
        }

        let emitted = emitter.finish()?;
        let compiled = CompiledFunction {
            buffer: emitted.buffer,
            entry: AssemblyOffset(0),
            block_offsets: emitted.block_offsets,
            slow_path_count: emitted.slow_path_count,
            frame_size,
        };
        tracing::debug!(
            target: "otter::jit",
            code_size = compiled.code_size(),
            slow_paths = compiled.slow_path_count,
            blocks = compiled.block_offsets.len(),
            "compile finish"
        );
        if self.config.dump {
            tracing::debug!(target: "otter::jit", code = %hex_words(compiled.code()), "machine code");
        }
        Ok(compiled)
    }
}

/// Rejects operands the emitter would otherwise turn into wild accesses.
fn validate(
    instructions: &[Instruction],
    code: &[u8],
    exception_table: &[ExceptionHandlerInfo],
    frame_size: u32,
) -> Result<(), JitError> {
    let starts: BTreeSet<u32> = instructions.iter().map(|inst| inst.offset).collect();
    let code_len = code.len() as u32;
    let check_target = |offset: u32, target: u32| {
        if starts.contains(&target) {
            Ok(())
        } else {
            Err(JitError::InvalidJumpTarget {
                offset,
                target,
                code_len,
            })
        }
    };

    for inst in instructions {
        for operand in &inst.operands {
            if let Operand::Reg(register) = *operand
                && register >= frame_size
            {
                return Err(JitError::RegisterOutOfRange {
                    offset: inst.offset,
                    register,
                    frame_size,
                });
            }
        }

        if matches!(inst.opcode, Opcode::Call | Opcode::CallLong) && inst.uint(2) > frame_size {
            return Err(JitError::RegisterOutOfRange {
                offset: inst.offset,
                register: inst.uint(2),
                frame_size,
            });
        }

        if let Some(table) = inst.switch_table(code)? {
            check_target(inst.offset, table.default_target)?;
            for &target in &table.targets {
                check_target(inst.offset, target)?;
            }
        } else if inst.opcode.has_branch_operand() {
            for target in inst.branch_targets() {
                check_target(inst.offset, target)?;
            }
        }
    }

    for eh in exception_table {
        check_target(eh.start, eh.target)?;
    }
    Ok(())
}

fn hex_words(code: &[u8]) -> String {
    code.chunks_exact(4)
        .map(|w| format!("{:08x}", u32::from_le_bytes([w[0], w[1], w[2], w[3]])))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use otter_hbc::generator::BytecodeFunctionGenerator;
    use otter_hbc::opcode::Operand::{Reg, UInt};

    fn compiler() -> JitCompiler {
        JitCompiler::with_config(JitConfig::default())
    }

    #[test]
    fn return_constant() {
        let mut g = BytecodeFunctionGenerator::new(1);
        g.emit(Opcode::LoadConstUInt8, &[Reg(0), UInt(7)]).unwrap();
        g.emit(Opcode::Ret, &[Reg(0)]).unwrap();
        let f = g.finish().unwrap();

        let compiled = compiler().compile_source(&FunctionSource::from_function(&f)).unwrap();
        assert_eq!(compiled.block_offsets().len(), 1);
        assert_eq!(compiled.slow_path_count(), 0);
        assert!(!compiled.entry_ptr().is_null());
        assert_eq!(compiled.code_size() % 4, 0);
    }

    #[test]
    fn handler_target_must_be_an_instruction() {
        let mut g = BytecodeFunctionGenerator::new(1);
        g.emit(Opcode::LoadConstInt, &[Reg(0), Operand::Imm(-5)]).unwrap(); // 0..6
        g.emit(Opcode::Ret, &[Reg(0)]).unwrap();
        let mut f = g.finish().unwrap();
        f.exception_handlers.push(ExceptionHandlerInfo {
            start: 0,
            end: 6,
            target: 3,
        });

        let err = compiler().compile_source(&FunctionSource::from_function(&f)).unwrap_err();
        assert!(matches!(
            err,
            JitError::InvalidJumpTarget {
                offset: 0,
                target: 3,
                ..
            }
        ));
    }

    #[test]
    fn hex_dump_is_little_endian_words() {
        assert_eq!(hex_words(&[0xc0, 0x03, 0x5f, 0xd6, 0x1f, 0x20, 0x03, 0xd5]), "d65f03c0 d503201f");
    }
}
