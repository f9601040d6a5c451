//! Frame register state tracking.
//!
//! Every bytecode frame register (FR) has an authoritative value that may
//! live in its frame slot, in a callee-saved global register assigned at
//! entry, or in block-local temporaries (at most one GpX and one VecD). The
//! tracker records where the latest value is, which copies are stale and the
//! narrowest known type, and asks a [`RegMover`] to emit the moves needed to
//! keep that bookkeeping true.
//!
//! ```text
//!   load/alloc          updated_with_hw          spill / sync
//! frame ──────▶ temp ───────────────▶ temp* ──────────────▶ global / frame
//! ```
//!
//! Invariants:
//! - a global register never holds an older value than the frame slot
//! - two locals of one FR always hold the same value
//! - every allocated temp that is bound to an FR is recorded in `hw_regs`

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::regalloc::{RegRange, TempRegAlloc};

/// Caller-saved GP temporaries `x0..=x15`.
pub const GP_TEMP: RegRange = (0, 15);
/// Callee-saved GP registers available for globals, `x21..=x28`.
pub const GP_SAVED: RegRange = (21, 28);
/// First block of caller-saved vector temporaries.
pub const VEC_TEMP1: RegRange = (0, 7);
/// Second block of caller-saved vector temporaries.
pub const VEC_TEMP2: RegRange = (16, 31);
/// Callee-saved vector registers (low halves) available for globals.
pub const VEC_SAVED: RegRange = (8, 15);

/// A bytecode frame register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FR(pub u32);

impl FR {
    /// Slot index.
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

bitflags! {
    /// Set of types a frame register may hold.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct FRType: u8 {
        /// A double.
        const NUMBER = 1;
        /// A boolean.
        const BOOL = 2;
        /// undefined, null or empty.
        const OTHER_NON_PTR = 4;
        /// A heap value.
        const POINTER = 8;
        /// Anything that is not a heap value.
        const UNKNOWN_NON_PTR = Self::NUMBER.bits() | Self::BOOL.bits() | Self::OTHER_NON_PTR.bits();
        /// Anything at all.
        const UNKNOWN_PTR = Self::UNKNOWN_NON_PTR.bits() | Self::POINTER.bits();
    }
}

/// A hardware register: `0..32` are GpX, `32..64` are VecD.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct HWReg(u8);

impl HWReg {
    /// General-purpose register `xN`.
    #[inline]
    pub const fn gpx(index: u8) -> Self {
        debug_assert!(index < 32);
        Self(index)
    }

    /// Vector register `dN`.
    #[inline]
    pub const fn vecd(index: u8) -> Self {
        debug_assert!(index < 32);
        Self(index + 32)
    }

    /// Whether this is a GpX register.
    #[inline]
    pub const fn is_gpx(self) -> bool {
        self.0 < 32
    }

    /// Whether this is a VecD register.
    #[inline]
    pub const fn is_vecd(self) -> bool {
        self.0 >= 32
    }

    /// Register number within its class.
    #[inline]
    pub const fn index_in_class(self) -> u8 {
        self.0 & 31
    }

    /// Index over both classes.
    #[inline]
    pub const fn combined_index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is one of the caller-saved GpX temporaries.
    pub const fn is_temp_gpx(self) -> bool {
        self.is_gpx() && self.0 <= GP_TEMP.1
    }

    /// Whether this is one of the caller-saved VecD temporaries.
    pub const fn is_temp_vecd(self) -> bool {
        let i = self.index_in_class();
        self.is_vecd() && (i <= VEC_TEMP1.1 || i >= VEC_TEMP2.0)
    }

    /// Whether this is a temporary of either class.
    pub const fn is_temp(self) -> bool {
        self.is_temp_gpx() || self.is_temp_vecd()
    }
}

impl std::fmt::Debug for HWReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_gpx() {
            write!(f, "x{}", self.index_in_class())
        } else {
            write!(f, "d{}", self.index_in_class())
        }
    }
}

/// Where one frame register's value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FRState {
    /// Type for the whole function.
    pub global_type: FRType,
    /// Type in the current block; may be narrower.
    pub local_type: FRType,
    /// Callee-saved register assigned at entry.
    pub global_reg: Option<HWReg>,
    /// Block-local GpX temporary.
    pub local_gpx: Option<HWReg>,
    /// Block-local VecD temporary.
    pub local_vecd: Option<HWReg>,
    /// The frame slot holds the latest value.
    pub frame_up_to_date: bool,
    /// The global register exists and holds the latest value.
    pub global_reg_up_to_date: bool,
    /// The register was handed out for writing and has not been marked
    /// updated yet; reading it is a bug.
    pub reg_is_dirty: bool,
}

impl Default for FRState {
    fn default() -> Self {
        Self {
            global_type: FRType::UNKNOWN_PTR,
            local_type: FRType::UNKNOWN_PTR,
            global_reg: None,
            local_gpx: None,
            local_vecd: None,
            frame_up_to_date: true,
            global_reg_up_to_date: false,
            reg_is_dirty: false,
        }
    }
}

/// Emits the data movement the tracker decides on.
pub trait RegMover {
    /// `dst = src` across any register classes.
    fn mov_hw(&mut self, dst: HWReg, src: HWReg);
    /// `dst = frame[fr]`
    fn load_frame(&mut self, dst: HWReg, fr: FR);
    /// `frame[fr] = src`
    fn store_frame(&mut self, src: HWReg, fr: FR);
}

/// Register bookkeeping for one function being compiled.
#[derive(Debug)]
pub struct FrameRegTracker {
    frame_regs: Vec<FRState>,
    /// FR bound to each hardware register.
    hw_regs: [Option<FR>; 64],
    gp_temp: TempRegAlloc,
    vec_temp: TempRegAlloc,
}

fn temp_gpx_regs() -> impl Iterator<Item = HWReg> {
    (GP_TEMP.0..=GP_TEMP.1).map(HWReg::gpx)
}

fn temp_vecd_regs() -> impl Iterator<Item = HWReg> {
    (VEC_TEMP1.0..=VEC_TEMP1.1)
        .chain(VEC_TEMP2.0..=VEC_TEMP2.1)
        .map(HWReg::vecd)
}

impl FrameRegTracker {
    /// Tracker for a frame of `frame_size` registers, all in the frame.
    pub fn new(frame_size: u32) -> Self {
        Self {
            frame_regs: vec![FRState::default(); frame_size as usize],
            hw_regs: [None; 64],
            gp_temp: TempRegAlloc::new(GP_TEMP),
            vec_temp: TempRegAlloc::with_two_ranges(VEC_TEMP1, VEC_TEMP2),
        }
    }

    /// Number of frame registers.
    pub fn frame_size(&self) -> u32 {
        self.frame_regs.len() as u32
    }

    /// Current state of `fr`.
    pub fn state(&self, fr: FR) -> &FRState {
        &self.frame_regs[fr.index()]
    }

    /// FR currently bound to `hw`.
    pub fn contents(&self, hw: HWReg) -> Option<FR> {
        self.hw_regs[hw.combined_index()]
    }

    /// Assigns callee-saved registers to the leading frame registers and
    /// loads them from the frame.
    ///
    /// The first `num_count` registers are numbers and prefer VecD; the next
    /// `np_count` are non-pointers and prefer GpX. Registers that do not fit
    /// stay in the frame.
    pub fn enter(&mut self, mv: &mut impl RegMover, num_count: u32, np_count: u32) {
        let size = self.frame_size();
        let num_end = num_count.min(size);
        let np_end = num_count.saturating_add(np_count).min(size);
        let mut next_vec = VEC_SAVED.0;
        let mut next_gp = GP_SAVED.0;

        for index in 0..num_end {
            let hw = if next_vec <= VEC_SAVED.1 {
                next_vec += 1;
                HWReg::vecd(next_vec - 1)
            } else if next_gp <= GP_SAVED.1 {
                next_gp += 1;
                HWReg::gpx(next_gp - 1)
            } else {
                break;
            };
            self.assign_global(mv, FR(index), hw, FRType::NUMBER);
        }
        for index in num_end..np_end {
            let hw = if next_gp <= GP_SAVED.1 {
                next_gp += 1;
                HWReg::gpx(next_gp - 1)
            } else if next_vec <= VEC_SAVED.1 {
                next_vec += 1;
                HWReg::vecd(next_vec - 1)
            } else {
                break;
            };
            self.assign_global(mv, FR(index), hw, FRType::UNKNOWN_NON_PTR);
        }
    }

    fn assign_global(&mut self, mv: &mut impl RegMover, fr: FR, hw: HWReg, ty: FRType) {
        tracing::trace!(target: "otter::jit", reg = ?hw, fr = fr.0, "global");
        mv.load_frame(hw, fr);
        let state = &mut self.frame_regs[fr.index()];
        state.global_reg = Some(hw);
        state.global_type = ty;
        state.local_type = ty;
        state.global_reg_up_to_date = true;
        state.frame_up_to_date = true;
    }

    /// Global registers in frame order.
    pub fn globals(&self) -> impl Iterator<Item = (FR, HWReg)> + '_ {
        self.frame_regs
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.global_reg.map(|hw| (FR(i as u32), hw)))
    }

    // ---------------------------------------------------------------------
    // Temporaries
    // ---------------------------------------------------------------------

    /// Allocates a GpX temporary, spilling one when all are taken.
    pub fn alloc_temp_gpx(&mut self, mv: &mut impl RegMover, preferred: Option<HWReg>) -> HWReg {
        let preferred = preferred.filter(|p| p.is_temp_gpx()).map(HWReg::index_in_class);
        if let Some(index) = self.gp_temp.alloc(preferred) {
            return HWReg::gpx(index);
        }
        let victim = match preferred {
            Some(p) if self.gp_temp.is_allocated(p) => p,
            _ => self.gp_temp.least_recently_used(),
        };
        let victim = HWReg::gpx(victim);
        if self.hw_regs[victim.combined_index()].is_some() {
            self.spill_temp(mv, victim);
        }
        self.gp_temp.free(victim.index_in_class());
        HWReg::gpx(self.gp_temp.alloc(None).unwrap_or(victim.index_in_class()))
    }

    /// Allocates a VecD temporary, spilling one when all are taken.
    pub fn alloc_temp_vecd(&mut self, mv: &mut impl RegMover, preferred: Option<HWReg>) -> HWReg {
        let preferred = preferred.filter(|p| p.is_temp_vecd()).map(HWReg::index_in_class);
        if let Some(index) = self.vec_temp.alloc(preferred) {
            return HWReg::vecd(index);
        }
        let victim = match preferred {
            Some(p) if self.vec_temp.is_allocated(p) => p,
            _ => self.vec_temp.least_recently_used(),
        };
        let victim = HWReg::vecd(victim);
        if self.hw_regs[victim.combined_index()].is_some() {
            self.spill_temp(mv, victim);
        }
        self.vec_temp.free(victim.index_in_class());
        HWReg::vecd(self.vec_temp.alloc(None).unwrap_or(victim.index_in_class()))
    }

    /// Unbinds `hw` from its FR and, for temporaries, returns it to the pool.
    pub fn free_reg(&mut self, hw: HWReg) {
        let fr = self.hw_regs[hw.combined_index()].take();
        if let Some(fr) = fr {
            let state = &mut self.frame_regs[fr.index()];
            if hw.is_gpx() {
                debug_assert_eq!(state.local_gpx, Some(hw));
                state.local_gpx = None;
            } else {
                debug_assert_eq!(state.local_vecd, Some(hw));
                state.local_vecd = None;
            }
        }
        if hw.is_temp_gpx() && self.gp_temp.is_allocated(hw.index_in_class()) {
            self.gp_temp.free(hw.index_in_class());
        } else if hw.is_temp_vecd() && self.vec_temp.is_allocated(hw.index_in_class()) {
            self.vec_temp.free(hw.index_in_class());
        }
    }

    /// Writes a bound temporary back to its FR's home and frees it.
    pub fn sync_and_free_temp_reg(&mut self, mv: &mut impl RegMover, hw: HWReg) {
        if !hw.is_temp() || self.hw_regs[hw.combined_index()].is_none() {
            return;
        }
        self.spill_temp(mv, hw);
        self.free_reg(hw);
    }

    /// Marks a temporary as most recently used.
    pub fn use_reg(&mut self, hw: HWReg) -> HWReg {
        if hw.is_temp_gpx() {
            self.gp_temp.use_reg(hw.index_in_class());
        } else if hw.is_temp_vecd() {
            self.vec_temp.use_reg(hw.index_in_class());
        }
        hw
    }

    fn mov_hw(&mut self, mv: &mut impl RegMover, dst: HWReg, src: HWReg, mark_used: bool) {
        if dst != src {
            mv.mov_hw(dst, src);
        }
        if mark_used {
            self.use_reg(src);
            self.use_reg(dst);
        }
    }

    /// Moves the value of the FR bound to `to_spill` into its global register
    /// or frame slot and unbinds it. The register itself stays allocated.
    fn spill_temp(&mut self, mv: &mut impl RegMover, to_spill: HWReg) {
        debug_assert!(to_spill.is_temp());
        let Some(fr) = self.hw_regs[to_spill.combined_index()].take() else {
            debug_assert!(false, "allocated temp {to_spill:?} is unused");
            return;
        };
        let state = self.frame_regs[fr.index()];
        debug_assert_ne!(state.global_reg, Some(to_spill), "global regs can't be temporary");

        match state.global_reg {
            Some(global) if !state.global_reg_up_to_date => {
                self.mov_hw(mv, global, to_spill, false);
                self.frame_regs[fr.index()].global_reg_up_to_date = true;
            }
            Some(_) => {}
            None if !state.frame_up_to_date => {
                mv.store_frame(to_spill, fr);
                self.frame_regs[fr.index()].frame_up_to_date = true;
            }
            None => {}
        }

        let state = &mut self.frame_regs[fr.index()];
        if state.local_gpx == Some(to_spill) {
            state.local_gpx = None;
        } else if state.local_vecd == Some(to_spill) {
            state.local_vecd = None;
        } else {
            debug_assert!(false, "{to_spill:?} not used by r{}", fr.0);
        }
    }

    /// Binds an allocated temporary as `fr`'s local of its class.
    fn assign_local(&mut self, fr: FR, hw: HWReg) {
        tracing::trace!(target: "otter::jit", reg = ?hw, fr = fr.0, "alloc");
        self.hw_regs[hw.combined_index()] = Some(fr);
        let state = &mut self.frame_regs[fr.index()];
        if hw.is_gpx() {
            state.local_gpx = Some(hw);
        } else {
            state.local_vecd = Some(hw);
        }
    }

    // ---------------------------------------------------------------------
    // Syncing
    // ---------------------------------------------------------------------

    /// Makes the frame slot of `fr` hold the latest value. The global
    /// register, when present, is brought up to date too.
    pub fn sync_to_frame(&mut self, mv: &mut impl RegMover, fr: FR) {
        if self.frame_regs[fr.index()].frame_up_to_date {
            return;
        }
        let Some(hw) = self.is_in_register(fr) else {
            debug_assert!(false, "r{} is neither in the frame nor in a register", fr.0);
            return;
        };
        let state = self.frame_regs[fr.index()];
        if let Some(global) = state.global_reg
            && !state.global_reg_up_to_date
        {
            debug_assert_ne!(hw, global);
            self.mov_hw(mv, global, hw, false);
            self.frame_regs[fr.index()].global_reg_up_to_date = true;
        }
        mv.store_frame(hw, fr);
        self.frame_regs[fr.index()].frame_up_to_date = true;
    }

    /// Writes every FR held only in a temporary back to its global register
    /// or frame slot, except `except`.
    pub fn sync_all_temp_except(&mut self, mv: &mut impl RegMover, except: Option<FR>) {
        for hw in temp_gpx_regs() {
            self.sync_temp(mv, hw, except);
        }
        for hw in temp_vecd_regs() {
            let Some(fr) = self.hw_regs[hw.combined_index()] else {
                continue;
            };
            // A local GpX already synced the same value.
            if self.frame_regs[fr.index()].local_gpx.is_some() {
                continue;
            }
            self.sync_temp(mv, hw, except);
        }
    }

    fn sync_temp(&mut self, mv: &mut impl RegMover, hw: HWReg, except: Option<FR>) {
        let Some(fr) = self.hw_regs[hw.combined_index()] else {
            return;
        };
        if Some(fr) == except {
            return;
        }
        let state = self.frame_regs[fr.index()];
        debug_assert!(
            state.local_gpx == Some(hw) || state.local_vecd == Some(hw),
            "tmpreg not bound to FR localreg"
        );
        match state.global_reg {
            Some(global) => {
                if !state.global_reg_up_to_date {
                    tracing::trace!(target: "otter::jit", reg = ?hw, fr = fr.0, "sync");
                    self.mov_hw(mv, global, hw, false);
                    self.frame_regs[fr.index()].global_reg_up_to_date = true;
                }
            }
            None => {
                if !state.frame_up_to_date {
                    tracing::trace!(target: "otter::jit", reg = ?hw, fr = fr.0, "sync");
                    mv.store_frame(hw, fr);
                    self.frame_regs[fr.index()].frame_up_to_date = true;
                }
            }
        }
    }

    /// Releases every bound temporary except those of `except`. Values are
    /// not written back.
    pub fn free_all_temp_except(&mut self, except: Option<FR>) {
        for hw in temp_gpx_regs().chain(temp_vecd_regs()) {
            match self.hw_regs[hw.combined_index()] {
                Some(fr) if Some(fr) != except => self.free_fr_temp(fr),
                _ => {}
            }
        }
    }

    /// Releases both locals of `fr`.
    pub fn free_fr_temp(&mut self, fr: FR) {
        let state = &mut self.frame_regs[fr.index()];
        let (gpx, vecd) = (state.local_gpx.take(), state.local_vecd.take());
        if let Some(hw) = gpx {
            debug_assert!(hw.is_temp_gpx());
            self.hw_regs[hw.combined_index()] = None;
            self.gp_temp.free(hw.index_in_class());
        }
        if let Some(hw) = vecd {
            debug_assert!(hw.is_temp_vecd());
            self.hw_regs[hw.combined_index()] = None;
            self.vec_temp.free(hw.index_in_class());
        }
    }

    /// Register that holds the latest value of `fr`, if any.
    pub fn is_in_register(&mut self, fr: FR) -> Option<HWReg> {
        let state = self.frame_regs[fr.index()];
        if let Some(hw) = state.local_gpx {
            return Some(self.use_reg(hw));
        }
        if let Some(hw) = state.local_vecd {
            return Some(self.use_reg(hw));
        }
        state.global_reg
    }

    // ---------------------------------------------------------------------
    // Operand access
    // ---------------------------------------------------------------------

    fn mark_dirty(&mut self, fr: FR, load: bool) {
        let state = &mut self.frame_regs[fr.index()];
        debug_assert!(!(load && state.reg_is_dirty), "r{} is dirty", fr.0);
        if !load {
            state.reg_is_dirty = true;
        }
    }

    /// A VecD register for `fr`. With `load`, it holds the latest value.
    pub fn get_or_alloc_vecd(
        &mut self,
        mv: &mut impl RegMover,
        fr: FR,
        load: bool,
        preferred: Option<HWReg>,
    ) -> HWReg {
        self.mark_dirty(fr, load);
        let state = self.frame_regs[fr.index()];

        if let Some(hw) = state.local_vecd {
            return self.use_reg(hw);
        }

        if let Some(global) = state.global_reg.filter(|g| g.is_vecd()) {
            if load && !state.global_reg_up_to_date {
                debug_assert!(state.local_gpx.is_some(), "stale global without a local");
                if let Some(local) = state.local_gpx {
                    self.mov_hw(mv, global, local, true);
                }
                self.frame_regs[fr.index()].global_reg_up_to_date = true;
            }
            return global;
        }

        let hw = self.alloc_temp_vecd(mv, preferred);
        self.assign_local(fr, hw);

        if load {
            let state = self.frame_regs[fr.index()];
            if let Some(local) = state.local_gpx {
                self.mov_hw(mv, hw, local, false);
            } else if let Some(global) = state.global_reg.filter(|g| g.is_gpx()) {
                debug_assert!(state.global_reg_up_to_date);
                self.mov_hw(mv, hw, global, false);
            } else {
                debug_assert!(state.frame_up_to_date, "frame not up-to-date");
                mv.load_frame(hw, fr);
            }
        }
        hw
    }

    /// A GpX register for `fr`. With `load`, it holds the latest value.
    pub fn get_or_alloc_gpx(
        &mut self,
        mv: &mut impl RegMover,
        fr: FR,
        load: bool,
        preferred: Option<HWReg>,
    ) -> HWReg {
        self.mark_dirty(fr, load);
        let state = self.frame_regs[fr.index()];

        if let Some(hw) = state.local_gpx {
            return self.use_reg(hw);
        }

        if let Some(global) = state.global_reg.filter(|g| g.is_gpx()) {
            if load && !state.global_reg_up_to_date {
                debug_assert!(state.local_vecd.is_some(), "stale global without a local");
                if let Some(local) = state.local_vecd {
                    self.mov_hw(mv, global, local, true);
                }
                self.frame_regs[fr.index()].global_reg_up_to_date = true;
            }
            return global;
        }

        let hw = self.alloc_temp_gpx(mv, preferred);
        self.assign_local(fr, hw);

        if load {
            let state = self.frame_regs[fr.index()];
            if let Some(local) = state.local_vecd {
                self.mov_hw(mv, hw, local, false);
            } else if let Some(global) = state.global_reg.filter(|g| g.is_vecd()) {
                debug_assert!(state.global_reg_up_to_date);
                self.mov_hw(mv, hw, global, false);
            } else {
                debug_assert!(state.frame_up_to_date, "frame not up-to-date");
                mv.load_frame(hw, fr);
            }
        }
        hw
    }

    /// Any register for `fr`, preferring one that already holds it.
    pub fn get_or_alloc_any(
        &mut self,
        mv: &mut impl RegMover,
        fr: FR,
        load: bool,
        preferred: Option<HWReg>,
    ) -> HWReg {
        if let Some(hw) = self.is_in_register(fr) {
            return hw;
        }
        let hw = match preferred {
            Some(p) if p.is_vecd() => self.alloc_temp_vecd(mv, preferred),
            _ => self.alloc_temp_gpx(mv, preferred),
        };
        self.assign_local(fr, hw);
        if load {
            debug_assert!(self.frame_regs[fr.index()].frame_up_to_date);
            mv.load_frame(hw, fr);
        }
        hw
    }

    /// Records that `hw`, one of `fr`'s registers, now holds its latest value
    /// of type `ty`. Every other copy becomes stale; the other local is
    /// released.
    pub fn updated_with_hw(&mut self, fr: FR, hw: HWReg, ty: FRType) {
        let state = &mut self.frame_regs[fr.index()];
        state.frame_up_to_date = false;
        state.reg_is_dirty = false;
        let (gpx, vecd) = (state.local_gpx, state.local_vecd);

        if state.global_reg == Some(hw) {
            state.global_reg_up_to_date = true;
            if let Some(local) = gpx {
                self.free_reg(local);
            }
            if let Some(local) = vecd {
                self.free_reg(local);
            }
        } else {
            state.global_reg_up_to_date = false;
            if gpx == Some(hw) {
                if let Some(local) = vecd {
                    self.free_reg(local);
                }
            } else {
                debug_assert_eq!(vecd, Some(hw), "updated reg doesn't belong to r{}", fr.0);
                if let Some(local) = gpx {
                    self.free_reg(local);
                }
            }
        }
        self.update_type(fr, ty);
    }

    /// Narrows the block-local type of `fr`.
    pub fn update_type(&mut self, fr: FR, ty: FRType) {
        self.frame_regs[fr.index()].local_type = ty;
    }

    /// `dst = fr`, from whichever copy is current.
    pub fn mov_hw_from_fr(&mut self, mv: &mut impl RegMover, dst: HWReg, fr: FR) {
        let state = self.frame_regs[fr.index()];
        debug_assert!(!state.reg_is_dirty, "r{} is dirty", fr.0);
        if let Some(local) = state.local_gpx {
            self.mov_hw(mv, dst, local, true);
        } else if let Some(local) = state.local_vecd {
            self.mov_hw(mv, dst, local, true);
        } else if let Some(global) = state.global_reg.filter(|_| state.global_reg_up_to_date) {
            self.mov_hw(mv, dst, global, true);
        } else {
            let dst = self.use_reg(dst);
            mv.load_frame(dst, fr);
        }
    }

    /// `fr = src`: writes into an existing register of `fr` or straight to
    /// the frame.
    pub fn mov_fr_from_hw(&mut self, mv: &mut impl RegMover, fr: FR, src: HWReg, ty: FRType) {
        let state = self.frame_regs[fr.index()];
        let target = state.local_gpx.or(state.local_vecd).or(state.global_reg);
        match target {
            Some(hw) => {
                self.mov_hw(mv, hw, src, false);
                self.updated_with_hw(fr, hw, ty);
            }
            None => {
                mv.store_frame(src, fr);
                let state = &mut self.frame_regs[fr.index()];
                state.frame_up_to_date = true;
                state.reg_is_dirty = false;
                state.local_type = ty;
            }
        }
    }

    /// After a runtime call wrote `fr` through its frame address: the frame
    /// is authoritative and the global register is reloaded.
    pub fn sync_frame_out_param(&mut self, mv: &mut impl RegMover, fr: FR, ty: FRType) {
        let state = &mut self.frame_regs[fr.index()];
        debug_assert!(state.local_gpx.is_none() && state.local_vecd.is_none());
        state.frame_up_to_date = true;
        if let Some(global) = state.global_reg {
            state.global_reg_up_to_date = true;
            mv.load_frame(global, fr);
        }
        self.update_type(fr, ty);
    }

    /// Block boundary: everything goes home, temporaries are released and
    /// local types widen to the function-wide types.
    pub fn new_basic_block(&mut self, mv: &mut impl RegMover) {
        self.sync_all_temp_except(mv, None);
        self.free_all_temp_except(None);
        for state in &mut self.frame_regs {
            state.local_type = state.global_type;
            debug_assert!(state.local_gpx.is_none() && state.local_vecd.is_none());
            if state.global_reg.is_some() {
                state.frame_up_to_date = false;
            }
        }
    }

    /// Like [`Self::new_basic_block`] when the previous block cannot fall
    /// through: temporaries are dropped without being written back. Every
    /// edge into the next block synced before branching.
    pub fn new_basic_block_after_terminator(&mut self) {
        self.free_all_temp_except(None);
        for state in &mut self.frame_regs {
            state.local_type = state.global_type;
            state.reg_is_dirty = false;
            if state.global_reg.is_some() {
                state.global_reg_up_to_date = true;
                state.frame_up_to_date = false;
            } else {
                state.frame_up_to_date = true;
            }
        }
    }

    /// Whether `fr` is known to hold exactly `ty`.
    pub fn is_known_type(&self, fr: FR, ty: FRType) -> bool {
        let state = &self.frame_regs[fr.index()];
        state.global_type == ty || state.local_type == ty
    }

    /// Whether `fr` is known to hold a number.
    pub fn is_known_number(&self, fr: FR) -> bool {
        self.is_known_type(fr, FRType::NUMBER)
    }

    /// Number of allocated temporaries of both classes.
    pub fn temps_in_use(&self) -> usize {
        self.gp_temp.allocated_count() + self.vec_temp.allocated_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Move {
        Hw(HWReg, HWReg),
        Load(HWReg, u32),
        Store(HWReg, u32),
    }

    #[derive(Default)]
    struct Recorder(Vec<Move>);

    impl RegMover for Recorder {
        fn mov_hw(&mut self, dst: HWReg, src: HWReg) {
            self.0.push(Move::Hw(dst, src));
        }
        fn load_frame(&mut self, dst: HWReg, fr: FR) {
            self.0.push(Move::Load(dst, fr.0));
        }
        fn store_frame(&mut self, src: HWReg, fr: FR) {
            self.0.push(Move::Store(src, fr.0));
        }
    }

    impl Recorder {
        fn take(&mut self) -> Vec<Move> {
            std::mem::take(&mut self.0)
        }
    }

    #[test]
    fn hwreg_classes() {
        assert!(HWReg::gpx(3).is_temp_gpx());
        assert!(!HWReg::gpx(21).is_temp());
        assert!(HWReg::vecd(7).is_temp_vecd());
        assert!(!HWReg::vecd(8).is_temp());
        assert!(HWReg::vecd(16).is_temp_vecd());
        assert_eq!(HWReg::vecd(5).combined_index(), 37);
        assert_eq!(format!("{:?}", HWReg::vecd(5)), "d5");
    }

    #[test]
    fn enter_assigns_globals_by_kind() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(30);
        // 10 numbers: d8..d15 then x21, x22. 8 non-pointers: x23..x28 then
        // nothing left for the last two.
        t.enter(&mut mv, 10, 8);
        let globals: Vec<_> = t.globals().collect();
        assert_eq!(globals[0], (FR(0), HWReg::vecd(8)));
        assert_eq!(globals[7], (FR(7), HWReg::vecd(15)));
        assert_eq!(globals[8], (FR(8), HWReg::gpx(21)));
        assert_eq!(globals[9], (FR(9), HWReg::gpx(22)));
        assert_eq!(globals[10], (FR(10), HWReg::gpx(23)));
        assert_eq!(globals.len(), 16);
        assert!(t.state(FR(16)).global_reg.is_none());
        assert!(t.is_known_number(FR(3)));
        assert_eq!(t.state(FR(12)).global_type, FRType::UNKNOWN_NON_PTR);
        assert_eq!(mv.take().len(), 16);
    }

    #[test]
    fn non_pointers_spill_into_vector_globals() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(20);
        t.enter(&mut mv, 0, 12);
        assert_eq!(t.state(FR(7)).global_reg, Some(HWReg::gpx(28)));
        assert_eq!(t.state(FR(8)).global_reg, Some(HWReg::vecd(8)));
    }

    #[test]
    fn load_then_update_then_sync() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(4);

        let d = t.get_or_alloc_vecd(&mut mv, FR(1), true, None);
        assert_eq!(d, HWReg::vecd(0));
        assert_eq!(mv.take(), vec![Move::Load(d, 1)]);

        // Already resident: no second load.
        assert_eq!(t.get_or_alloc_vecd(&mut mv, FR(1), true, None), d);
        assert!(mv.take().is_empty());

        t.updated_with_hw(FR(1), d, FRType::NUMBER);
        assert!(!t.state(FR(1)).frame_up_to_date);
        assert!(t.is_known_number(FR(1)));

        t.sync_to_frame(&mut mv, FR(1));
        assert_eq!(mv.take(), vec![Move::Store(d, 1)]);
        assert!(t.state(FR(1)).frame_up_to_date);
        // Still resident after syncing.
        assert_eq!(t.contents(d), Some(FR(1)));
    }

    #[test]
    fn gpx_load_reuses_vecd_local() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(2);
        let d = t.get_or_alloc_vecd(&mut mv, FR(0), false, None);
        t.updated_with_hw(FR(0), d, FRType::NUMBER);
        mv.take();

        let x = t.get_or_alloc_gpx(&mut mv, FR(0), true, None);
        assert_eq!(mv.take(), vec![Move::Hw(x, d)]);
        assert_eq!(t.state(FR(0)).local_gpx, Some(x));
        assert_eq!(t.state(FR(0)).local_vecd, Some(d));

        // Writing the GpX drops the VecD copy.
        t.updated_with_hw(FR(0), x, FRType::UNKNOWN_PTR);
        assert_eq!(t.state(FR(0)).local_vecd, None);
        assert_eq!(t.contents(d), None);
        assert_eq!(t.temps_in_use(), 1);
    }

    #[test]
    fn writing_global_frees_locals() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(2);
        t.enter(&mut mv, 1, 0);
        mv.take();
        let g = HWReg::vecd(8);

        let x = t.get_or_alloc_gpx(&mut mv, FR(0), true, None);
        assert_eq!(mv.take(), vec![Move::Hw(x, g)]);
        let d = t.get_or_alloc_vecd(&mut mv, FR(0), false, None);
        assert_eq!(d, g);
        t.updated_with_hw(FR(0), g, FRType::NUMBER);
        assert!(t.state(FR(0)).global_reg_up_to_date);
        assert_eq!(t.state(FR(0)).local_gpx, None);
        assert_eq!(t.temps_in_use(), 0);
    }

    #[test]
    fn spill_on_exhaustion_uses_lru() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(20);
        for i in 0..16 {
            let x = t.get_or_alloc_gpx(&mut mv, FR(i), false, None);
            t.updated_with_hw(FR(i), x, FRType::UNKNOWN_PTR);
        }
        // Touch r0 so r1 becomes the eviction victim.
        t.get_or_alloc_gpx(&mut mv, FR(0), true, None);
        mv.take();

        let x = t.get_or_alloc_gpx(&mut mv, FR(16), true, None);
        assert_eq!(x, HWReg::gpx(1));
        assert_eq!(mv.take(), vec![Move::Store(x, 1), Move::Load(x, 16)]);
        assert_eq!(t.state(FR(1)).local_gpx, None);
        assert!(t.state(FR(1)).frame_up_to_date);
        assert_eq!(t.contents(x), Some(FR(16)));
    }

    #[test]
    fn spill_prefers_requested_register() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(20);
        for i in 0..16 {
            let x = t.get_or_alloc_gpx(&mut mv, FR(i), false, None);
            t.updated_with_hw(FR(i), x, FRType::UNKNOWN_PTR);
        }
        mv.take();
        let x = t.alloc_temp_gpx(&mut mv, Some(HWReg::gpx(5)));
        assert_eq!(x, HWReg::gpx(5));
        assert_eq!(mv.take(), vec![Move::Store(x, 5)]);
    }

    #[test]
    fn spilling_into_stale_global() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(1);
        t.enter(&mut mv, 0, 1);
        mv.take();
        let g = HWReg::gpx(21);
        let d = t.get_or_alloc_vecd(&mut mv, FR(0), true, None);
        assert_eq!(mv.take(), vec![Move::Hw(d, g)]);
        t.updated_with_hw(FR(0), d, FRType::NUMBER);
        assert!(!t.state(FR(0)).global_reg_up_to_date);

        t.sync_and_free_temp_reg(&mut mv, d);
        assert_eq!(mv.take(), vec![Move::Hw(g, d)]);
        assert!(t.state(FR(0)).global_reg_up_to_date);
        assert!(!t.state(FR(0)).frame_up_to_date);

        t.sync_to_frame(&mut mv, FR(0));
        assert_eq!(mv.take(), vec![Move::Store(g, 0)]);
    }

    #[test]
    fn sync_all_skips_exempt_and_vecd_shadowed_by_gpx() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(3);
        let x0 = t.get_or_alloc_gpx(&mut mv, FR(0), false, None);
        t.updated_with_hw(FR(0), x0, FRType::UNKNOWN_PTR);
        let x1 = t.get_or_alloc_gpx(&mut mv, FR(1), false, None);
        t.updated_with_hw(FR(1), x1, FRType::NUMBER);
        let d1 = t.get_or_alloc_vecd(&mut mv, FR(1), true, None);
        mv.take();

        t.sync_all_temp_except(&mut mv, Some(FR(0)));
        assert_eq!(mv.take(), vec![Move::Store(x1, 1)]);
        assert!(!t.state(FR(0)).frame_up_to_date);

        t.free_all_temp_except(Some(FR(0)));
        assert_eq!(t.contents(d1), None);
        assert_eq!(t.contents(x0), Some(FR(0)));
        assert_eq!(t.temps_in_use(), 1);
    }

    #[test]
    fn mov_fr_from_hw_without_register_stores() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(2);
        t.mov_fr_from_hw(&mut mv, FR(1), HWReg::gpx(0), FRType::BOOL);
        assert_eq!(mv.take(), vec![Move::Store(HWReg::gpx(0), 1)]);
        assert!(t.is_known_type(FR(1), FRType::BOOL));
        assert!(t.state(FR(1)).frame_up_to_date);
    }

    #[test]
    fn mov_hw_from_fr_picks_current_copy() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(2);
        t.enter(&mut mv, 1, 0);
        mv.take();
        t.mov_hw_from_fr(&mut mv, HWReg::gpx(1), FR(0));
        assert_eq!(mv.take(), vec![Move::Hw(HWReg::gpx(1), HWReg::vecd(8))]);
        t.mov_hw_from_fr(&mut mv, HWReg::gpx(1), FR(1));
        assert_eq!(mv.take(), vec![Move::Load(HWReg::gpx(1), 1)]);
    }

    #[test]
    fn new_block_resets_locals_and_types() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(3);
        t.enter(&mut mv, 1, 0);
        let d = t.get_or_alloc_vecd(&mut mv, FR(2), false, None);
        t.updated_with_hw(FR(2), d, FRType::NUMBER);
        mv.take();

        t.new_basic_block(&mut mv);
        assert_eq!(mv.take(), vec![Move::Store(d, 2)]);
        assert_eq!(t.temps_in_use(), 0);
        assert!(!t.is_known_number(FR(2)));
        assert!(t.is_known_number(FR(0)));
        assert!(!t.state(FR(0)).frame_up_to_date);
        assert!(t.state(FR(2)).frame_up_to_date);
    }

    #[test]
    fn block_after_terminator_drops_temps_without_stores() {
        let mut mv = Recorder::default();
        let mut t = FrameRegTracker::new(3);
        t.enter(&mut mv, 1, 0);
        let d = t.get_or_alloc_vecd(&mut mv, FR(2), false, None);
        t.updated_with_hw(FR(2), d, FRType::NUMBER);
        let g = t.get_or_alloc_vecd(&mut mv, FR(0), false, None);
        t.updated_with_hw(FR(0), g, FRType::NUMBER);
        mv.take();

        t.new_basic_block_after_terminator();
        assert!(mv.take().is_empty());
        assert_eq!(t.temps_in_use(), 0);
        assert!(!t.is_known_number(FR(2)));
        assert!(t.state(FR(2)).frame_up_to_date);
        assert!(t.state(FR(0)).global_reg_up_to_date);
        assert!(!t.state(FR(0)).frame_up_to_date);
    }
}
