//! aarch64 encoding layer over `dynasmrt`.
//!
//! Owns the assembler, fixes the register roles shared by every compiled
//! function and implements [`RegMover`] so the frame register tracker can
//! emit its own moves.
//!
//! ```text
//! x19  *mut JitContext        x16, x17  scratch (never allocated)
//! x20  frame base             x21       return value at exit
//! ```

use dynasmrt::aarch64::Assembler;
use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer, dynasm};

use crate::compiler::JitError;
use crate::context::offsets;
use crate::frame_regs::{FR, HWReg, RegMover};

/// `dynasm!` pinned to aarch64.
macro_rules! a64 {
    ($ops:expr ; $($t:tt)*) => {
        dynasm!($ops ; .arch aarch64 ; $($t)*)
    };
}
pub(crate) use a64;

/// Holds the return value on the way to the epilogue.
pub const X_RET: u8 = 21;
/// First scratch register.
pub const X_SCRATCH0: u8 = 16;
/// Second scratch register.
pub const X_SCRATCH1: u8 = 17;

/// Largest frame addressable with a scaled 12-bit offset from `x20`.
pub const MAX_FRAME_SIZE: u32 = 4095;

/// Condition codes used by the emitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    /// Equal.
    Eq,
    /// Not equal.
    Ne,
    /// Unsigned higher or same.
    Hs,
    /// Unsigned lower.
    Lo,
    /// Negative; ordered less-than after `fcmp`.
    Mi,
    /// Positive or zero.
    Pl,
    /// Overflow; unordered after `fcmp`.
    Vs,
    /// No overflow.
    Vc,
    /// Unsigned higher.
    Hi,
    /// Unsigned lower or same; ordered less-or-equal after `fcmp`.
    Ls,
    /// Signed greater or equal.
    Ge,
    /// Signed less than.
    Lt,
    /// Signed greater than.
    Gt,
    /// Signed less or equal.
    Le,
}

impl Cond {
    /// The condition that holds exactly when `self` does not.
    pub fn invert(self) -> Self {
        match self {
            Self::Eq => Self::Ne,
            Self::Ne => Self::Eq,
            Self::Hs => Self::Lo,
            Self::Lo => Self::Hs,
            Self::Mi => Self::Pl,
            Self::Pl => Self::Mi,
            Self::Vs => Self::Vc,
            Self::Vc => Self::Vs,
            Self::Hi => Self::Ls,
            Self::Ls => Self::Hi,
            Self::Ge => Self::Lt,
            Self::Lt => Self::Ge,
            Self::Gt => Self::Le,
            Self::Le => Self::Gt,
        }
    }
}

/// The assembler plus the encodings the emitter needs.
pub struct Asm {
    pub(crate) ops: Assembler,
}

impl Asm {
    /// Fresh assembler backed by executable memory.
    pub fn new() -> Result<Self, JitError> {
        let ops = Assembler::new().map_err(JitError::ExecutableMemory)?;
        Ok(Self { ops })
    }

    /// Current native offset.
    pub fn offset(&self) -> usize {
        self.ops.offset().0
    }

    /// Unbound label.
    pub fn new_label(&mut self) -> DynamicLabel {
        self.ops.new_dynamic_label()
    }

    /// Binds `label` here.
    pub fn bind(&mut self, label: DynamicLabel) {
        a64!(self.ops ; =>label);
    }

    /// `b label`
    pub fn b(&mut self, label: DynamicLabel) {
        a64!(self.ops ; b =>label);
    }

    /// `bl label`
    pub fn bl(&mut self, label: DynamicLabel) {
        a64!(self.ops ; bl =>label);
    }

    /// `b.<cond> label`
    pub fn b_cond(&mut self, cond: Cond, label: DynamicLabel) {
        match cond {
            Cond::Eq => a64!(self.ops ; b.eq =>label),
            Cond::Ne => a64!(self.ops ; b.ne =>label),
            Cond::Hs => a64!(self.ops ; b.hs =>label),
            Cond::Lo => a64!(self.ops ; b.lo =>label),
            Cond::Mi => a64!(self.ops ; b.mi =>label),
            Cond::Pl => a64!(self.ops ; b.pl =>label),
            Cond::Vs => a64!(self.ops ; b.vs =>label),
            Cond::Vc => a64!(self.ops ; b.vc =>label),
            Cond::Hi => a64!(self.ops ; b.hi =>label),
            Cond::Ls => a64!(self.ops ; b.ls =>label),
            Cond::Ge => a64!(self.ops ; b.ge =>label),
            Cond::Lt => a64!(self.ops ; b.lt =>label),
            Cond::Gt => a64!(self.ops ; b.gt =>label),
            Cond::Le => a64!(self.ops ; b.le =>label),
        }
    }

    /// `cset w<reg>, <cond>`
    pub fn cset(&mut self, reg: u8, cond: Cond) {
        match cond {
            Cond::Eq => a64!(self.ops ; cset W(reg), eq),
            Cond::Ne => a64!(self.ops ; cset W(reg), ne),
            Cond::Hs => a64!(self.ops ; cset W(reg), hs),
            Cond::Lo => a64!(self.ops ; cset W(reg), lo),
            Cond::Mi => a64!(self.ops ; cset W(reg), mi),
            Cond::Pl => a64!(self.ops ; cset W(reg), pl),
            Cond::Vs => a64!(self.ops ; cset W(reg), vs),
            Cond::Vc => a64!(self.ops ; cset W(reg), vc),
            Cond::Hi => a64!(self.ops ; cset W(reg), hi),
            Cond::Ls => a64!(self.ops ; cset W(reg), ls),
            Cond::Ge => a64!(self.ops ; cset W(reg), ge),
            Cond::Lt => a64!(self.ops ; cset W(reg), lt),
            Cond::Gt => a64!(self.ops ; cset W(reg), gt),
            Cond::Le => a64!(self.ops ; cset W(reg), le),
        }
    }

    /// `cbz w<reg>, label`
    pub fn cbz_w(&mut self, reg: u8, label: DynamicLabel) {
        a64!(self.ops ; cbz W(reg), =>label);
    }

    /// `cbnz w<reg>, label`
    pub fn cbnz_w(&mut self, reg: u8, label: DynamicLabel) {
        a64!(self.ops ; cbnz W(reg), =>label);
    }

    /// Materializes a 64-bit constant with `movz` and as few `movk` as the
    /// non-zero halfwords need.
    pub fn load_imm64(&mut self, reg: u8, bits: u64) {
        let h0 = (bits & 0xFFFF) as u32;
        let h1 = ((bits >> 16) & 0xFFFF) as u32;
        let h2 = ((bits >> 32) & 0xFFFF) as u32;
        let h3 = ((bits >> 48) & 0xFFFF) as u32;
        a64!(self.ops ; movz X(reg), #(h0));
        if h1 != 0 {
            a64!(self.ops ; movk X(reg), #(h1), lsl #16);
        }
        if h2 != 0 {
            a64!(self.ops ; movk X(reg), #(h2), lsl #32);
        }
        if h3 != 0 {
            a64!(self.ops ; movk X(reg), #(h3), lsl #48);
        }
    }

    /// 32-bit variant of [`Asm::load_imm64`]; clears the upper half.
    pub fn load_imm32(&mut self, reg: u8, value: u32) {
        let lo = value & 0xFFFF;
        let hi = value >> 16;
        a64!(self.ops ; movz W(reg), #(lo));
        if hi != 0 {
            a64!(self.ops ; movk W(reg), #(hi), lsl #16);
        }
    }

    /// Records the bytecode offset of the instruction calling out.
    pub fn store_ip(&mut self, ip: u32) {
        self.load_imm32(X_SCRATCH0, ip);
        a64!(self.ops ; str w16, [x19, #(offsets::CURRENT_IP)]);
    }

    /// `x0 = ctx`
    pub fn mov_ctx_to_x0(&mut self) {
        a64!(self.ops ; mov x0, x19);
    }

    /// `x<dst> = frame[fr]`, for call arguments.
    pub fn load_frame_gpx(&mut self, dst: u8, fr: FR) {
        a64!(self.ops ; ldr X(dst), [x20, #(fr.0 * 8)]);
    }

    /// Turns 0/1 in `x<reg>` into a boxed bool.
    pub fn box_bool(&mut self, reg: u8) {
        a64!(self.ops
            ; movz x16, #0xFFFB, lsl #48
            ; orr X(reg), X(reg), x16
        );
    }

    /// Saves the frame record and every callee-saved register the pools may
    /// hand out, then pins the context and frame pointers.
    pub fn prologue(&mut self) {
        a64!(self.ops
            ; stp x29, x30, [sp, #-160]!
            ; mov x29, sp
            ; stp x19, x20, [sp, #16]
            ; stp x21, x22, [sp, #32]
            ; stp x23, x24, [sp, #48]
            ; stp x25, x26, [sp, #64]
            ; stp x27, x28, [sp, #80]
            ; stp d8, d9, [sp, #96]
            ; stp d10, d11, [sp, #112]
            ; stp d12, d13, [sp, #128]
            ; stp d14, d15, [sp, #144]
            ; mov x19, x0
            ; mov x20, x1
        );
    }

    /// Binds `return_label` and returns `x21`.
    pub fn epilogue(&mut self, return_label: DynamicLabel) {
        a64!(self.ops
            ; =>return_label
            ; mov x0, x21
            ; ldp d14, d15, [sp, #144]
            ; ldp d12, d13, [sp, #128]
            ; ldp d10, d11, [sp, #112]
            ; ldp d8, d9, [sp, #96]
            ; ldp x27, x28, [sp, #80]
            ; ldp x25, x26, [sp, #64]
            ; ldp x23, x24, [sp, #48]
            ; ldp x21, x22, [sp, #32]
            ; ldp x19, x20, [sp, #16]
            ; ldp x29, x30, [sp], #160
            ; ret
        );
    }

    /// Helper thunk: `ldr x16, literal; br x16`.
    pub fn thunk(&mut self, label: DynamicLabel, literal: DynamicLabel) {
        a64!(self.ops
            ; =>label
            ; ldr x16, =>literal
            ; br x16
        );
    }

    /// Computed jump into a table of `b` instructions indexed by `w<index>`.
    pub fn table_jump(&mut self, index: u8, table: DynamicLabel) {
        a64!(self.ops
            ; adr x16, =>table
            ; add x16, x16, W(index), uxtw #2
            ; br x16
        );
    }

    /// Aligns the stream for data.
    pub fn align(&mut self, alignment: usize) {
        self.ops.align(alignment, 0);
    }

    /// Binds `label` to a 64-bit literal.
    pub fn literal_u64(&mut self, label: DynamicLabel, value: u64) {
        self.bind(label);
        self.ops.push_u64(value);
    }

    /// Appends a 32-bit word.
    pub fn push_u32(&mut self, value: u32) {
        self.ops.push_u32(value);
    }

    /// Resolves every label and maps the code executable.
    pub fn finalize(mut self) -> Result<ExecutableBuffer, JitError> {
        self.ops
            .commit()
            .map_err(|e| JitError::Assembler(e.to_string()))?;
        self.ops
            .finalize()
            .map_err(|_| JitError::Assembler("failed to finalize executable buffer".to_string()))
    }
}

impl RegMover for Asm {
    fn mov_hw(&mut self, dst: HWReg, src: HWReg) {
        let (d, s) = (dst.index_in_class(), src.index_in_class());
        match (dst.is_gpx(), src.is_gpx()) {
            (true, true) => a64!(self.ops ; mov X(d), X(s)),
            (false, false) => a64!(self.ops ; fmov D(d), D(s)),
            (true, false) => a64!(self.ops ; fmov X(d), D(s)),
            (false, true) => a64!(self.ops ; fmov D(d), X(s)),
        }
    }

    fn load_frame(&mut self, dst: HWReg, fr: FR) {
        let r = dst.index_in_class();
        let off = fr.0 * 8;
        if dst.is_gpx() {
            a64!(self.ops ; ldr X(r), [x20, #(off)]);
        } else {
            a64!(self.ops ; ldr D(r), [x20, #(off)]);
        }
    }

    fn store_frame(&mut self, src: HWReg, fr: FR) {
        let r = src.index_in_class();
        let off = fr.0 * 8;
        if src.is_gpx() {
            a64!(self.ops ; str X(r), [x20, #(off)]);
        } else {
            a64!(self.ops ; str D(r), [x20, #(off)]);
        }
    }
}
