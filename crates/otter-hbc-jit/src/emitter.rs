//! Bytecode to aarch64 lowering for one function.
//!
//! Every operation follows the same shape: a fast path that works on
//! registers when the operands are numbers, and a guarded branch to a slow
//! path that calls the matching runtime helper. Slow paths are queued while
//! the body is emitted and materialized after it, so the straight-line code
//! stays dense.
//!
//! Operand values are checked with a single `fcmp`: every non-number is a NaN
//! (see [`crate::value`]) so `b.vs` catches both operands at once.

use std::collections::VecDeque;

use dynasmrt::{DynamicLabel, DynasmApi, DynasmLabelApi, ExecutableBuffer, dynasm};
use otter_hbc::ExceptionHandlerInfo;
use otter_hbc::opcode::{Instruction, Opcode, SwitchTable};
use rustc_hash::FxHashMap;

use crate::asm::{Asm, Cond, X_RET, X_SCRATCH0, X_SCRATCH1, a64};
use crate::compiler::JitError;
use crate::context::offsets;
use crate::discover_bb::BasicBlockMap;
use crate::frame_regs::{FR, FRType, FrameRegTracker, HWReg, RegMover};
use crate::runtime_helpers::HelperKind;
use crate::value;

type Result<T> = std::result::Result<T, JitError>;

// ---------------------------------------------------------------------------
// Slow paths
// ---------------------------------------------------------------------------

/// Out-of-line continuation of a fast path.
#[derive(Debug)]
struct SlowPath {
    label: DynamicLabel,
    cont: DynamicLabel,
    ip: u32,
    kind: SlowPathKind,
}

#[derive(Debug)]
enum SlowPathKind {
    /// `res = helper(ctx, frame[lhs] [, frame[rhs]])`
    Value {
        helper: HelperKind,
        lhs: FR,
        rhs: Option<FR>,
        res: HWReg,
    },
    /// `res = bool(helper(ctx, frame[lhs], frame[rhs]) ^ invert)`
    Compare {
        helper: HelperKind,
        lhs: FR,
        rhs: FR,
        res: HWReg,
        invert: bool,
    },
    /// Branches to `target` when the helper result (xor `invert`) is set.
    Branch {
        helper: HelperKind,
        lhs: FR,
        rhs: FR,
        target: DynamicLabel,
        invert: bool,
    },
    /// Missing parameter.
    Undefined { res: HWReg },
}

#[derive(Debug, Clone, Copy)]
enum FloatOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy)]
enum IntOp {
    And,
    Or,
    Xor,
    Shl,
    Sar,
    Shr,
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Negate,
    Inc,
    Dec,
    ToNumber,
}

/// Helper, fast-path condition and inversion for a relational opcode.
fn compare_info(opcode: Opcode) -> Option<(HelperKind, Cond, bool)> {
    use Opcode::*;
    Some(match opcode {
        Less | JLess | JLessLong => (HelperKind::Less, Cond::Mi, false),
        JNotLess | JNotLessLong => (HelperKind::Less, Cond::Mi, true),
        LessEq | JLessEqual | JLessEqualLong => (HelperKind::LessEq, Cond::Ls, false),
        JNotLessEqual | JNotLessEqualLong => (HelperKind::LessEq, Cond::Ls, true),
        Greater | JGreater | JGreaterLong => (HelperKind::Greater, Cond::Gt, false),
        JNotGreater | JNotGreaterLong => (HelperKind::Greater, Cond::Gt, true),
        GreaterEq | JGreaterEqual | JGreaterEqualLong => (HelperKind::GreaterEq, Cond::Ge, false),
        JNotGreaterEqual | JNotGreaterEqualLong => (HelperKind::GreaterEq, Cond::Ge, true),
        Opcode::Eq | JEqual | JEqualLong => (HelperKind::Eq, Cond::Eq, false),
        Neq | JNotEqual | JNotEqualLong => (HelperKind::Eq, Cond::Eq, true),
        StrictEq | JStrictEqual | JStrictEqualLong => (HelperKind::StrictEq, Cond::Eq, false),
        StrictNeq | JStrictNotEqual | JStrictNotEqualLong => (HelperKind::StrictEq, Cond::Eq, true),
        _ => return None,
    })
}

/// At most two non-zero halfwords: cheaper as `movz`/`movk` than a load.
fn is_cheap_const(bits: u64) -> bool {
    (0..4).filter(|i| (bits >> (i * 16)) & 0xFFFF != 0).count() <= 2
}

/// Machine code plus the bookkeeping the compiler reports.
pub(crate) struct EmittedCode {
    pub buffer: ExecutableBuffer,
    pub block_offsets: Vec<u32>,
    pub slow_path_count: usize,
}

/// Lowering state for one function.
pub(crate) struct Emitter<'a> {
    asm: Asm,
    regs: FrameRegTracker,
    bbs: &'a BasicBlockMap,
    exception_table: &'a [ExceptionHandlerInfo],
    block_labels: Vec<DynamicLabel>,
    block_offsets: Vec<u32>,
    slow_paths: VecDeque<SlowPath>,
    slow_path_count: usize,
    thunks: Vec<(HelperKind, DynamicLabel)>,
    thunk_index: FxHashMap<HelperKind, DynamicLabel>,
    literals: Vec<(u64, DynamicLabel)>,
    literal_index: FxHashMap<u64, DynamicLabel>,
    return_label: DynamicLabel,
    catch_dispatch: Option<DynamicLabel>,
    frame_size: u32,
    emitting_ip: u32,
    /// The last instruction cannot fall through.
    block_terminated: bool,
}

impl<'a> Emitter<'a> {
    pub fn new(bbs: &'a BasicBlockMap, exception_table: &'a [ExceptionHandlerInfo], frame_size: u32) -> Result<Self> {
        let mut asm = Asm::new()?;
        let block_labels = (0..bbs.block_count()).map(|_| asm.new_label()).collect();
        let return_label = asm.new_label();
        Ok(Self {
            asm,
            regs: FrameRegTracker::new(frame_size),
            bbs,
            exception_table,
            block_labels,
            block_offsets: Vec::with_capacity(bbs.block_count()),
            slow_paths: VecDeque::new(),
            slow_path_count: 0,
            thunks: Vec::new(),
            thunk_index: FxHashMap::default(),
            literals: Vec::new(),
            literal_index: FxHashMap::default(),
            return_label,
            catch_dispatch: None,
            frame_size,
            emitting_ip: 0,
            block_terminated: false,
        })
    }

    /// Saves registers and loads the global registers.
    pub fn enter(&mut self, number_reg_count: u32, non_ptr_reg_count: u32) {
        self.asm.prologue();
        self.regs.enter(&mut self.asm, number_reg_count, non_ptr_reg_count);
    }

    /// Closes the previous block and binds the label of block `index`.
    pub fn new_basic_block(&mut self, index: usize) {
        if self.block_terminated {
            self.regs.new_basic_block_after_terminator();
        } else {
            self.regs.new_basic_block(&mut self.asm);
        }
        self.block_terminated = false;
        if let Some(&label) = self.block_labels.get(index) {
            self.asm.bind(label);
        }
        self.block_offsets.push(self.asm.offset() as u32);
    }

    // -----------------------------------------------------------------------
    // Small utilities
    // -----------------------------------------------------------------------

    fn label_for(&self, target: u32) -> Result<DynamicLabel> {
        self.bbs
            .block_at(target)
            .and_then(|i| self.block_labels.get(i).copied())
            .ok_or(JitError::InvalidJumpTarget {
                offset: self.emitting_ip,
                target,
                code_len: self.bbs.offsets.last().copied().unwrap_or(0),
            })
    }

    fn thunk(&mut self, helper: HelperKind) -> DynamicLabel {
        if let Some(&label) = self.thunk_index.get(&helper) {
            return label;
        }
        let label = self.asm.new_label();
        self.thunk_index.insert(helper, label);
        self.thunks.push((helper, label));
        label
    }

    fn literal(&mut self, bits: u64) -> DynamicLabel {
        if let Some(&label) = self.literal_index.get(&bits) {
            return label;
        }
        let label = self.asm.new_label();
        self.literal_index.insert(bits, label);
        self.literals.push((bits, label));
        label
    }

    fn catch_dispatch(&mut self) -> DynamicLabel {
        match self.catch_dispatch {
            Some(label) => label,
            None => {
                let label = self.asm.new_label();
                self.catch_dispatch = Some(label);
                label
            }
        }
    }

    /// `bl helper` with the current IP recorded.
    fn call_helper(&mut self, helper: HelperKind, ip: u32) {
        let thunk = self.thunk(helper);
        self.asm.store_ip(ip);
        self.asm.bl(thunk);
    }

    /// `x0 = helper(ctx, frame[lhs] [, frame[rhs]])`. Both operands must be
    /// synced to the frame.
    fn call_helper_frame_args(&mut self, helper: HelperKind, ip: u32, lhs: FR, rhs: Option<FR>) {
        self.asm.mov_ctx_to_x0();
        self.asm.load_frame_gpx(1, lhs);
        if let Some(rhs) = rhs {
            self.asm.load_frame_gpx(2, rhs);
        }
        self.call_helper(helper, ip);
    }

    fn push_slow_path(&mut self, kind: SlowPathKind) -> (DynamicLabel, DynamicLabel) {
        let label = self.asm.new_label();
        let cont = self.asm.new_label();
        self.slow_paths.push_back(SlowPath {
            label,
            cont,
            ip: self.emitting_ip,
            kind,
        });
        self.slow_path_count += 1;
        (label, cont)
    }

    fn vecd(&mut self, fr: FR, load: bool) -> HWReg {
        self.regs.get_or_alloc_vecd(&mut self.asm, fr, load, None)
    }

    fn gpx(&mut self, fr: FR, load: bool, preferred: Option<HWReg>) -> HWReg {
        self.regs.get_or_alloc_gpx(&mut self.asm, fr, load, preferred)
    }

    fn sync_all_except(&mut self, except: Option<FR>) {
        self.regs.sync_all_temp_except(&mut self.asm, except);
    }

    fn sync_to_frame(&mut self, fr: FR) {
        self.regs.sync_to_frame(&mut self.asm, fr);
    }

    fn free_all(&mut self) {
        self.regs.free_all_temp_except(None);
    }

    /// `res` may skip syncing when it is about to be overwritten and is not
    /// also an input.
    fn exempt(res: FR, inputs: &[FR]) -> Option<FR> {
        (!inputs.contains(&res)).then_some(res)
    }

    /// Prepares for a runtime call reading `inputs` from the frame.
    fn spill_for_call(&mut self, res: Option<FR>, inputs: &[FR]) {
        self.sync_all_except(res.and_then(|r| Self::exempt(r, inputs)));
        for &fr in inputs {
            self.sync_to_frame(fr);
        }
        self.free_all();
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Lowers one instruction.
    pub fn emit(&mut self, inst: &Instruction, code: &[u8]) -> Result<()> {
        use Opcode::*;

        self.emitting_ip = inst.offset;
        tracing::trace!(target: "otter::jit", offset = inst.offset, op = %inst.opcode, "emit");
        let r = |i: usize| FR(inst.reg(i));

        match inst.opcode {
            Unreachable => {
                self.asm.mov_ctx_to_x0();
                self.call_helper(HelperKind::Unreachable, inst.offset);
            }
            Mov | MovLong => self.mov(r(0), r(1)),
            LoadParam | LoadParamLong => self.load_param(r(0), inst.uint(1)),

            LoadConstUndefined => self.load_const_bits(r(0), value::UNDEFINED, FRType::OTHER_NON_PTR),
            LoadConstNull => self.load_const_bits(r(0), value::NULL, FRType::OTHER_NON_PTR),
            LoadConstTrue => self.load_const_bits(r(0), value::TRUE, FRType::BOOL),
            LoadConstFalse => self.load_const_bits(r(0), value::FALSE, FRType::BOOL),
            LoadConstZero => self.load_const_number(r(0), 0.0),
            LoadConstUInt8 => self.load_const_number(r(0), f64::from(inst.uint(1))),
            LoadConstInt => self.load_const_number(r(0), f64::from(inst.imm(1))),
            LoadConstDouble => self.load_const_number(r(0), inst.double(1)),

            Add => self.arith_bin_op(FloatOp::Add, HelperKind::Add, r(0), r(1), r(2), false),
            AddN => self.arith_bin_op(FloatOp::Add, HelperKind::Add, r(0), r(1), r(2), true),
            Sub => self.arith_bin_op(FloatOp::Sub, HelperKind::Sub, r(0), r(1), r(2), false),
            SubN => self.arith_bin_op(FloatOp::Sub, HelperKind::Sub, r(0), r(1), r(2), true),
            Mul => self.arith_bin_op(FloatOp::Mul, HelperKind::Mul, r(0), r(1), r(2), false),
            MulN => self.arith_bin_op(FloatOp::Mul, HelperKind::Mul, r(0), r(1), r(2), true),
            Div => self.arith_bin_op(FloatOp::Div, HelperKind::Div, r(0), r(1), r(2), false),
            DivN => self.arith_bin_op(FloatOp::Div, HelperKind::Div, r(0), r(1), r(2), true),
            Mod => self.modulo(r(0), r(1), r(2)),

            BitAnd => self.bit_bin_op(IntOp::And, HelperKind::BitAnd, r(0), r(1), r(2)),
            BitOr => self.bit_bin_op(IntOp::Or, HelperKind::BitOr, r(0), r(1), r(2)),
            BitXor => self.bit_bin_op(IntOp::Xor, HelperKind::BitXor, r(0), r(1), r(2)),
            LShift => self.bit_bin_op(IntOp::Shl, HelperKind::LShift, r(0), r(1), r(2)),
            RShift => self.bit_bin_op(IntOp::Sar, HelperKind::RShift, r(0), r(1), r(2)),
            URshift => self.bit_bin_op(IntOp::Shr, HelperKind::URshift, r(0), r(1), r(2)),

            Negate => self.arith_unary(UnaryOp::Negate, HelperKind::Negate, r(0), r(1)),
            Inc => self.arith_unary(UnaryOp::Inc, HelperKind::Inc, r(0), r(1)),
            Dec => self.arith_unary(UnaryOp::Dec, HelperKind::Dec, r(0), r(1)),
            ToNumber => self.arith_unary(UnaryOp::ToNumber, HelperKind::ToNumber, r(0), r(1)),
            BitNot => self.bit_not(r(0), r(1)),
            Not => self.not(r(0), r(1)),

            Less | LessEq | Greater | GreaterEq | Opcode::Eq | Neq | StrictEq | StrictNeq => {
                if let Some((helper, cond, invert)) = compare_info(inst.opcode) {
                    self.compare(helper, cond, invert, r(0), r(1), r(2));
                }
            }

            Jmp | JmpLong => {
                let target = self.label_for(inst.branch_target(0))?;
                self.jmp(target);
            }
            JmpTrue | JmpTrueLong => {
                let target = self.label_for(inst.branch_target(0))?;
                self.jmp_true_false(target, r(1), true);
            }
            JmpFalse | JmpFalseLong => {
                let target = self.label_for(inst.branch_target(0))?;
                self.jmp_true_false(target, r(1), false);
            }
            JmpUndefined | JmpUndefinedLong => {
                let target = self.label_for(inst.branch_target(0))?;
                self.jmp_undefined(target, r(1));
            }
            op if op.has_branch_operand() && compare_info(op).is_some() => {
                let target = self.label_for(inst.branch_target(0))?;
                if let Some((helper, cond, invert)) = compare_info(op) {
                    self.j_cond(helper, cond, invert, target, r(1), r(2));
                }
            }
            SwitchImm => {
                let Some(table) = inst.switch_table(code)? else {
                    return Err(JitError::UnsupportedInstruction {
                        offset: inst.offset,
                        opcode: inst.opcode,
                    });
                };
                self.switch_imm(r(0), &table)?;
            }

            Call | CallLong => self.call(r(0), r(1), inst.uint(2)),
            Ret => self.ret(r(0)),
            Catch => self.catch(r(0)),
            Throw => self.throw(r(0)),

            Debugger | AsyncBreakCheck | ProfilePoint => {}

            LoadConstString | LoadConstStringLongIndex | LoadConstBigInt | LoadConstBigIntLongIndex
            | CreateRegExp | NewObject | GetById | PutById | GetByVal | PutByVal => {
                return Err(JitError::UnsupportedInstruction {
                    offset: inst.offset,
                    opcode: inst.opcode,
                });
            }

            _ => {
                return Err(JitError::UnsupportedInstruction {
                    offset: inst.offset,
                    opcode: inst.opcode,
                });
            }
        }
        self.block_terminated = matches!(inst.opcode, Jmp | JmpLong | SwitchImm | Ret | Throw);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Moves and constants
    // -----------------------------------------------------------------------

    fn mov(&mut self, res: FR, input: FR) {
        if res == input {
            return;
        }
        let hw_in = self.regs.get_or_alloc_any(&mut self.asm, input, true, None);
        let hw_dst = self.regs.get_or_alloc_any(&mut self.asm, res, false, None);
        if hw_dst != hw_in {
            self.asm.mov_hw(hw_dst, hw_in);
        }
        let ty = self.regs.state(input).local_type;
        self.regs.updated_with_hw(res, hw_dst, ty);
    }

    fn load_const_bits(&mut self, res: FR, bits: u64, ty: FRType) {
        let hw = self.gpx(res, false, None);
        self.asm.load_imm64(hw.index_in_class(), bits);
        self.regs.updated_with_hw(res, hw, ty);
    }

    fn load_const_number(&mut self, res: FR, val: f64) {
        let bits = value::encode_number(val);
        let hw = if bits == 0 {
            let hw = self.vecd(res, false);
            let d = hw.index_in_class();
            a64!(self.asm.ops ; fmov D(d), xzr);
            hw
        } else if is_cheap_const(bits) {
            let hw = self.gpx(res, false, None);
            self.asm.load_imm64(hw.index_in_class(), bits);
            hw
        } else {
            let hw = self.vecd(res, false);
            let d = hw.index_in_class();
            let lit = self.literal(bits);
            a64!(self.asm.ops ; ldr D(d), =>lit);
            hw
        };
        self.regs.updated_with_hw(res, hw, FRType::NUMBER);
    }

    fn load_param(&mut self, res: FR, index: u32) {
        let hw = self.gpx(res, false, None);
        let x = hw.index_in_class();
        let (slow, cont) = self.push_slow_path(SlowPathKind::Undefined { res: hw });

        a64!(self.asm.ops ; ldr w16, [x19, #(offsets::ARGC)]);
        if index <= 4095 {
            a64!(self.asm.ops ; cmp w16, #(index));
        } else {
            self.asm.load_imm32(X_SCRATCH1, index);
            a64!(self.asm.ops ; cmp w16, w17);
        }
        // argc <= index: not passed.
        self.asm.b_cond(Cond::Ls, slow);
        a64!(self.asm.ops ; ldr x16, [x19, #(offsets::ARGS)]);
        if index <= 4095 {
            a64!(self.asm.ops ; ldr X(x), [x16, #(index * 8)]);
        } else {
            self.asm.load_imm64(X_SCRATCH1, u64::from(index));
            a64!(self.asm.ops ; ldr X(x), [x16, x17, lsl #3]);
        }
        self.asm.bind(cont);
        self.regs.updated_with_hw(res, hw, FRType::UNKNOWN_PTR);
    }

    // -----------------------------------------------------------------------
    // Arithmetic
    // -----------------------------------------------------------------------

    fn arith_bin_op(&mut self, op: FloatOp, helper: HelperKind, res: FR, lhs: FR, rhs: FR, force_number: bool) {
        if force_number {
            self.regs.update_type(lhs, FRType::NUMBER);
            self.regs.update_type(rhs, FRType::NUMBER);
        }
        let slow = !(self.regs.is_known_number(lhs) && self.regs.is_known_number(rhs));

        let hw_l = self.vecd(lhs, true);
        let hw_r = self.vecd(rhs, true);
        if slow {
            self.spill_for_call(Some(res), &[lhs, rhs]);
        }
        let hw_res = self.vecd(res, false);
        let ty = if slow { FRType::UNKNOWN_PTR } else { FRType::NUMBER };
        self.regs.updated_with_hw(res, hw_res, ty);

        let (d, l, r) = (hw_res.index_in_class(), hw_l.index_in_class(), hw_r.index_in_class());
        let cont = if slow {
            let (slow_label, cont) = self.push_slow_path(SlowPathKind::Value {
                helper,
                lhs,
                rhs: Some(rhs),
                res: hw_res,
            });
            a64!(self.asm.ops ; fcmp D(l), D(r));
            self.asm.b_cond(Cond::Vs, slow_label);
            Some(cont)
        } else {
            None
        };

        match op {
            FloatOp::Add => a64!(self.asm.ops ; fadd D(d), D(l), D(r)),
            FloatOp::Sub => a64!(self.asm.ops ; fsub D(d), D(l), D(r)),
            FloatOp::Mul => a64!(self.asm.ops ; fmul D(d), D(l), D(r)),
            FloatOp::Div => a64!(self.asm.ops ; fdiv D(d), D(l), D(r)),
        }
        if let Some(cont) = cont {
            self.asm.bind(cont);
        }
    }

    fn modulo(&mut self, res: FR, lhs: FR, rhs: FR) {
        let numbers = self.regs.is_known_number(lhs) && self.regs.is_known_number(rhs);
        self.spill_for_call(Some(res), &[lhs, rhs]);
        self.call_helper_frame_args(HelperKind::Mod, self.emitting_ip, lhs, Some(rhs));
        let ty = if numbers { FRType::NUMBER } else { FRType::UNKNOWN_PTR };
        self.regs.mov_fr_from_hw(&mut self.asm, res, HWReg::gpx(0), ty);
    }

    fn bit_bin_op(&mut self, op: IntOp, helper: HelperKind, res: FR, lhs: FR, rhs: FR) {
        let numbers = self.regs.is_known_number(lhs) && self.regs.is_known_number(rhs);

        let w_l = self.regs.alloc_temp_gpx(&mut self.asm, None);
        let w_r = self.regs.alloc_temp_gpx(&mut self.asm, None);
        let d_tmp = self.regs.alloc_temp_vecd(&mut self.asm, None);

        self.sync_all_except(Self::exempt(res, &[lhs, rhs]));
        self.sync_to_frame(lhs);
        self.sync_to_frame(rhs);

        let hw_l = self.vecd(lhs, true);
        let hw_r = self.vecd(rhs, true);
        self.free_all();

        let hw_res = self.vecd(res, false);
        let ty = if numbers { FRType::NUMBER } else { FRType::UNKNOWN_PTR };
        self.regs.updated_with_hw(res, hw_res, ty);

        let (slow, cont) = self.push_slow_path(SlowPathKind::Value {
            helper,
            lhs,
            rhs: Some(rhs),
            res: hw_res,
        });

        let (wl, wr, dt) = (w_l.index_in_class(), w_r.index_in_class(), d_tmp.index_in_class());
        let (dl, dr, d) = (hw_l.index_in_class(), hw_r.index_in_class(), hw_res.index_in_class());
        a64!(self.asm.ops
            ; fcvtzs W(wl), D(dl)
            ; scvtf D(dt), W(wl)
            ; fcmp D(dt), D(dl)
        );
        self.asm.b_cond(Cond::Ne, slow);
        a64!(self.asm.ops
            ; fcvtzs W(wr), D(dr)
            ; scvtf D(dt), W(wr)
            ; fcmp D(dt), D(dr)
        );
        self.asm.b_cond(Cond::Ne, slow);

        match op {
            IntOp::And => a64!(self.asm.ops ; and W(wl), W(wl), W(wr)),
            IntOp::Or => a64!(self.asm.ops ; orr W(wl), W(wl), W(wr)),
            IntOp::Xor => a64!(self.asm.ops ; eor W(wl), W(wl), W(wr)),
            IntOp::Shl => a64!(self.asm.ops ; lsl W(wl), W(wl), W(wr)),
            IntOp::Sar => a64!(self.asm.ops ; asr W(wl), W(wl), W(wr)),
            IntOp::Shr => a64!(self.asm.ops ; lsr W(wl), W(wl), W(wr)),
        }
        match op {
            IntOp::Shr => a64!(self.asm.ops ; ucvtf D(d), W(wl)),
            _ => a64!(self.asm.ops ; scvtf D(d), W(wl)),
        }
        self.asm.bind(cont);

        self.regs.free_reg(w_l);
        self.regs.free_reg(w_r);
        self.regs.free_reg(d_tmp);
    }

    fn arith_unary(&mut self, op: UnaryOp, helper: HelperKind, res: FR, input: FR) {
        let slow = !self.regs.is_known_number(input);

        let hw_in = self.vecd(input, true);
        if slow {
            self.spill_for_call(Some(res), &[input]);
        }
        let hw_res = self.vecd(res, false);
        let d_one = match op {
            UnaryOp::Inc | UnaryOp::Dec => Some(self.regs.alloc_temp_vecd(&mut self.asm, None)),
            UnaryOp::Negate | UnaryOp::ToNumber => None,
        };
        let ty = match op {
            UnaryOp::ToNumber => FRType::NUMBER,
            _ if slow => FRType::UNKNOWN_PTR,
            _ => FRType::NUMBER,
        };
        self.regs.updated_with_hw(res, hw_res, ty);

        let (d, s) = (hw_res.index_in_class(), hw_in.index_in_class());
        let cont = if slow {
            let (slow_label, cont) = self.push_slow_path(SlowPathKind::Value {
                helper,
                lhs: input,
                rhs: None,
                res: hw_res,
            });
            a64!(self.asm.ops ; fcmp D(s), D(s));
            self.asm.b_cond(Cond::Vs, slow_label);
            Some(cont)
        } else {
            None
        };

        match (op, d_one) {
            (UnaryOp::Negate, _) => a64!(self.asm.ops ; fneg D(d), D(s)),
            (UnaryOp::ToNumber, _) => {
                if d != s {
                    a64!(self.asm.ops ; fmov D(d), D(s));
                }
            }
            (UnaryOp::Inc, Some(one)) => {
                let o = one.index_in_class();
                a64!(self.asm.ops
                    ; movz x16, #0x3FF0, lsl #48
                    ; fmov D(o), x16
                    ; fadd D(d), D(s), D(o)
                );
            }
            (UnaryOp::Dec, Some(one)) => {
                let o = one.index_in_class();
                a64!(self.asm.ops
                    ; movz x16, #0x3FF0, lsl #48
                    ; fmov D(o), x16
                    ; fsub D(d), D(s), D(o)
                );
            }
            (UnaryOp::Inc | UnaryOp::Dec, None) => {}
        }
        if let Some(cont) = cont {
            self.asm.bind(cont);
        }
        if let Some(one) = d_one {
            self.regs.free_reg(one);
        }
    }

    fn bit_not(&mut self, res: FR, input: FR) {
        let w_in = self.regs.alloc_temp_gpx(&mut self.asm, None);
        let d_tmp = self.regs.alloc_temp_vecd(&mut self.asm, None);

        self.sync_all_except(Self::exempt(res, &[input]));
        self.sync_to_frame(input);
        let hw_in = self.vecd(input, true);
        self.free_all();

        let hw_res = self.vecd(res, false);
        self.regs.updated_with_hw(res, hw_res, FRType::NUMBER);
        let (slow, cont) = self.push_slow_path(SlowPathKind::Value {
            helper: HelperKind::BitNot,
            lhs: input,
            rhs: None,
            res: hw_res,
        });

        let (w, dt, s, d) = (
            w_in.index_in_class(),
            d_tmp.index_in_class(),
            hw_in.index_in_class(),
            hw_res.index_in_class(),
        );
        a64!(self.asm.ops
            ; fcvtzs W(w), D(s)
            ; scvtf D(dt), W(w)
            ; fcmp D(dt), D(s)
        );
        self.asm.b_cond(Cond::Ne, slow);
        a64!(self.asm.ops
            ; mvn W(w), W(w)
            ; scvtf D(d), W(w)
        );
        self.asm.bind(cont);

        self.regs.free_reg(w_in);
        self.regs.free_reg(d_tmp);
    }

    fn not(&mut self, res: FR, input: FR) {
        if self.regs.is_known_type(input, FRType::BOOL) {
            let hw_in = self.gpx(input, true, None);
            let hw_res = self.gpx(res, false, None);
            let (d, s) = (hw_res.index_in_class(), hw_in.index_in_class());
            a64!(self.asm.ops
                ; movz x16, #1
                ; eor X(d), X(s), x16
            );
            self.regs.updated_with_hw(res, hw_res, FRType::BOOL);
            return;
        }
        self.spill_for_call(Some(res), &[input]);
        self.call_helper_frame_args(HelperKind::Not, self.emitting_ip, input, None);
        self.regs.mov_fr_from_hw(&mut self.asm, res, HWReg::gpx(0), FRType::BOOL);
    }

    fn compare(&mut self, helper: HelperKind, cond: Cond, invert: bool, res: FR, lhs: FR, rhs: FR) {
        let slow = !(self.regs.is_known_number(lhs) && self.regs.is_known_number(rhs));

        let hw_l = self.vecd(lhs, true);
        let hw_r = self.vecd(rhs, true);
        if slow {
            self.spill_for_call(Some(res), &[lhs, rhs]);
        }
        let hw_res = self.gpx(res, false, Some(HWReg::gpx(0)));
        self.regs.updated_with_hw(res, hw_res, FRType::BOOL);

        let (x, l, r) = (hw_res.index_in_class(), hw_l.index_in_class(), hw_r.index_in_class());
        a64!(self.asm.ops ; fcmp D(l), D(r));
        let cont = if slow {
            let (slow_label, cont) = self.push_slow_path(SlowPathKind::Compare {
                helper,
                lhs,
                rhs,
                res: hw_res,
                invert,
            });
            self.asm.b_cond(Cond::Vs, slow_label);
            Some(cont)
        } else {
            None
        };
        self.asm.cset(x, if invert { cond.invert() } else { cond });
        self.asm.box_bool(x);
        if let Some(cont) = cont {
            self.asm.bind(cont);
        }
    }

    // -----------------------------------------------------------------------
    // Control flow
    // -----------------------------------------------------------------------

    fn jmp(&mut self, target: DynamicLabel) {
        self.sync_all_except(None);
        self.free_all();
        self.asm.b(target);
    }

    fn jmp_true_false(&mut self, target: DynamicLabel, fr: FR, on_true: bool) {
        self.sync_all_except(None);

        if self.regs.is_known_number(fr) {
            let hw = self.vecd(fr, true);
            let zero = self.regs.alloc_temp_vecd(&mut self.asm, None);
            let (d, z) = (hw.index_in_class(), zero.index_in_class());
            a64!(self.asm.ops
                ; fmov D(z), xzr
                ; fcmp D(d), D(z)
            );
            self.regs.free_reg(zero);
            if on_true {
                // Truthy: neither zero nor NaN.
                self.asm.b_cond(Cond::Mi, target);
                self.asm.b_cond(Cond::Gt, target);
            } else {
                self.asm.b_cond(Cond::Eq, target);
                self.asm.b_cond(Cond::Vs, target);
            }
        } else if self.regs.is_known_type(fr, FRType::BOOL) {
            let hw = self.gpx(fr, true, None);
            if on_true {
                self.asm.cbnz_w(hw.index_in_class(), target);
            } else {
                self.asm.cbz_w(hw.index_in_class(), target);
            }
        } else {
            self.regs.mov_hw_from_fr(&mut self.asm, HWReg::gpx(1), fr);
            self.asm.mov_ctx_to_x0();
            self.call_helper(HelperKind::ToBoolean, self.emitting_ip);
            self.free_all();
            if on_true {
                self.asm.cbnz_w(0, target);
            } else {
                self.asm.cbz_w(0, target);
            }
        }
        self.free_all();
    }

    fn jmp_undefined(&mut self, target: DynamicLabel, fr: FR) {
        self.sync_all_except(None);
        self.free_all();
        if self.regs.is_known_number(fr) || self.regs.is_known_type(fr, FRType::BOOL) {
            return;
        }
        self.regs.mov_hw_from_fr(&mut self.asm, HWReg::gpx(X_SCRATCH0), fr);
        self.asm.load_imm64(X_SCRATCH1, value::UNDEFINED);
        a64!(self.asm.ops ; cmp x16, x17);
        self.asm.b_cond(Cond::Eq, target);
    }

    fn j_cond(&mut self, helper: HelperKind, cond: Cond, invert: bool, target: DynamicLabel, lhs: FR, rhs: FR) {
        let slow = !(self.regs.is_known_number(lhs) && self.regs.is_known_number(rhs));
        if slow {
            self.sync_to_frame(lhs);
            self.sync_to_frame(rhs);
        }
        self.sync_all_except(None);

        let hw_l = self.vecd(lhs, true);
        let hw_r = self.vecd(rhs, true);
        let (l, r) = (hw_l.index_in_class(), hw_r.index_in_class());
        a64!(self.asm.ops ; fcmp D(l), D(r));

        let cont = if slow {
            let (slow_label, cont) = self.push_slow_path(SlowPathKind::Branch {
                helper,
                lhs,
                rhs,
                target,
                invert,
            });
            self.asm.b_cond(Cond::Vs, slow_label);
            Some(cont)
        } else {
            None
        };
        // Unordered only reaches here for NaN numbers: plain conditions are
        // false on it, inverted ones true.
        self.asm.b_cond(if invert { cond.invert() } else { cond }, target);
        if let Some(cont) = cont {
            self.asm.bind(cont);
        }
        self.free_all();
    }

    fn switch_imm(&mut self, input: FR, table: &SwitchTable) -> Result<()> {
        let default = self.label_for(table.default_target)?;
        let targets = table
            .targets
            .iter()
            .map(|&t| self.label_for(t))
            .collect::<Result<Vec<_>>>()?;

        self.sync_all_except(None);
        let hw = self.vecd(input, true);
        let w_idx = self.regs.alloc_temp_gpx(&mut self.asm, None);
        let d_tmp = self.regs.alloc_temp_vecd(&mut self.asm, None);
        let (s, w, dt) = (hw.index_in_class(), w_idx.index_in_class(), d_tmp.index_in_class());

        // Exact uint32 or the default.
        a64!(self.asm.ops
            ; fcvtzu W(w), D(s)
            ; ucvtf D(dt), W(w)
            ; fcmp D(dt), D(s)
        );
        self.asm.b_cond(Cond::Ne, default);
        if table.min != 0 {
            self.asm.load_imm32(X_SCRATCH1, table.min);
            a64!(self.asm.ops ; sub W(w), W(w), w17);
        }
        self.asm.load_imm32(X_SCRATCH1, table.max - table.min);
        a64!(self.asm.ops ; cmp W(w), w17);
        self.asm.b_cond(Cond::Hi, default);

        let jump_table = self.asm.new_label();
        self.asm.table_jump(w, jump_table);
        self.asm.bind(jump_table);
        for target in targets {
            self.asm.b(target);
        }

        self.regs.free_reg(w_idx);
        self.regs.free_reg(d_tmp);
        self.free_all();
        Ok(())
    }

    /// Arguments are the last `argc` frame registers, `this` first.
    fn call(&mut self, res: FR, callee: FR, argc: u32) {
        let first_arg = self.frame_size - argc;
        let mut inputs: Vec<FR> = (first_arg..self.frame_size).map(FR).collect();
        inputs.push(callee);
        self.spill_for_call(Some(res), &inputs);

        self.asm.mov_ctx_to_x0();
        self.asm.load_frame_gpx(1, callee);
        self.asm.load_imm64(2, u64::from(first_arg) * 8);
        a64!(self.asm.ops ; add x2, x20, x2);
        self.asm.load_imm32(3, argc);
        self.call_helper(HelperKind::Call, self.emitting_ip);

        let dispatch = self.catch_dispatch();
        a64!(self.asm.ops ; ldr x16, [x19, #(offsets::THROWN_VALUE)]);
        self.asm.load_imm64(X_SCRATCH1, value::EMPTY);
        a64!(self.asm.ops ; cmp x16, x17);
        self.asm.b_cond(Cond::Ne, dispatch);

        self.regs.mov_fr_from_hw(&mut self.asm, res, HWReg::gpx(0), FRType::UNKNOWN_PTR);
    }

    fn ret(&mut self, value: FR) {
        self.regs.mov_hw_from_fr(&mut self.asm, HWReg::gpx(X_RET), value);
        self.asm.b(self.return_label);
    }

    fn catch(&mut self, res: FR) {
        let hw = self.gpx(res, false, None);
        let x = hw.index_in_class();
        a64!(self.asm.ops ; ldr X(x), [x19, #(offsets::THROWN_VALUE)]);
        self.asm.load_imm64(X_SCRATCH0, value::EMPTY);
        a64!(self.asm.ops ; str x16, [x19, #(offsets::THROWN_VALUE)]);
        self.regs.updated_with_hw(res, hw, FRType::UNKNOWN_PTR);
    }

    fn throw(&mut self, value: FR) {
        self.sync_all_except(None);
        self.regs.mov_hw_from_fr(&mut self.asm, HWReg::gpx(X_SCRATCH0), value);
        a64!(self.asm.ops ; str x16, [x19, #(offsets::THROWN_VALUE)]);
        self.asm.store_ip(self.emitting_ip);
        self.free_all();
        let dispatch = self.catch_dispatch();
        self.asm.b(dispatch);
    }

    // -----------------------------------------------------------------------
    // Function tail
    // -----------------------------------------------------------------------

    fn emit_slow_path(&mut self, sp: SlowPath) {
        self.asm.bind(sp.label);
        match sp.kind {
            SlowPathKind::Value { helper, lhs, rhs, res } => {
                self.call_helper_frame_args(helper, sp.ip, lhs, rhs);
                self.asm.mov_hw(res, HWReg::gpx(0));
            }
            SlowPathKind::Compare {
                helper,
                lhs,
                rhs,
                res,
                invert,
            } => {
                self.call_helper_frame_args(helper, sp.ip, lhs, Some(rhs));
                if invert {
                    a64!(self.asm.ops ; eor w0, w0, #1);
                }
                self.asm.box_bool(0);
                self.asm.mov_hw(res, HWReg::gpx(0));
            }
            SlowPathKind::Branch {
                helper,
                lhs,
                rhs,
                target,
                invert,
            } => {
                self.call_helper_frame_args(helper, sp.ip, lhs, Some(rhs));
                if invert {
                    self.asm.cbz_w(0, target);
                } else {
                    self.asm.cbnz_w(0, target);
                }
            }
            SlowPathKind::Undefined { res } => {
                self.asm.load_imm64(res.index_in_class(), value::UNDEFINED);
            }
        }
        self.asm.b(sp.cont);
    }

    /// Maps the IP of a throwing instruction to its handler block, or leaves
    /// through the exception exit.
    fn emit_catch_dispatch(&mut self, dispatch: DynamicLabel) -> Result<Option<DynamicLabel>> {
        self.asm.bind(dispatch);
        let exit = self.asm.new_label();
        let mut eh_table = None;

        if !self.exception_table.is_empty() {
            let table = self.asm.new_label();
            eh_table = Some(table);
            a64!(self.asm.ops ; adr x0, =>table);
            self.asm.load_imm32(1, self.exception_table.len() as u32);
            a64!(self.asm.ops ; ldr w2, [x19, #(offsets::CURRENT_IP)]);
            let thunk = self.thunk(HelperKind::FindCatchTarget);
            self.asm.bl(thunk);
            a64!(self.asm.ops ; tbnz w0, #31, =>exit);

            let handlers = self.asm.new_label();
            self.asm.table_jump(0, handlers);
            self.asm.bind(handlers);
            for eh in self.exception_table {
                let label = self.label_for(eh.target)?;
                self.asm.b(label);
            }
        }

        self.asm.bind(exit);
        self.asm.load_imm64(X_RET, value::EMPTY);
        self.asm.b(self.return_label);
        Ok(eh_table)
    }

    /// Emits the tail and maps the code executable.
    pub fn finish(mut self) -> Result<EmittedCode> {
        // Running off the end is a bytecode bug.
        self.asm.mov_ctx_to_x0();
        self.call_helper(HelperKind::Unreachable, self.bbs.offsets.last().copied().unwrap_or(0));

        self.asm.epilogue(self.return_label);

        while let Some(sp) = self.slow_paths.pop_front() {
            self.emit_slow_path(sp);
        }

        let eh_table = match self.catch_dispatch {
            Some(dispatch) => self.emit_catch_dispatch(dispatch)?,
            None => None,
        };

        for (helper, label) in std::mem::take(&mut self.thunks) {
            let literal = self.literal(helper.address());
            self.asm.thunk(label, literal);
        }

        self.asm.align(8);
        for (bits, label) in std::mem::take(&mut self.literals) {
            self.asm.literal_u64(label, bits);
        }
        if let Some(table) = eh_table {
            self.asm.bind(table);
            for eh in self.exception_table {
                self.asm.push_u32(eh.start);
                self.asm.push_u32(eh.end);
                self.asm.push_u32(eh.target);
            }
        }

        let block_offsets = std::mem::take(&mut self.block_offsets);
        let slow_path_count = self.slow_path_count;
        let buffer = self.asm.finalize()?;
        Ok(EmittedCode {
            buffer,
            block_offsets,
            slow_path_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cheap_constants() {
        assert!(is_cheap_const(0));
        assert!(is_cheap_const(1.0f64.to_bits()));
        assert!(is_cheap_const(value::UNDEFINED));
        assert!(!is_cheap_const(0.1f64.to_bits()));
    }

    #[test]
    fn relational_opcodes_share_helpers() {
        assert_eq!(compare_info(Opcode::JNotLess), Some((HelperKind::Less, Cond::Mi, true)));
        assert_eq!(compare_info(Opcode::Neq), Some((HelperKind::Eq, Cond::Eq, true)));
        assert_eq!(
            compare_info(Opcode::JStrictNotEqualLong),
            Some((HelperKind::StrictEq, Cond::Eq, true))
        );
        assert_eq!(compare_info(Opcode::Add), None);
    }
}
