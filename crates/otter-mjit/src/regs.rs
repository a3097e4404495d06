//! Physical registers of the abstract machine and their allocation state.

use serde::{Deserialize, Serialize};

use crate::assembler::FrameSlot;

/// Number of general-purpose registers
pub const GPR_COUNT: usize = 8;
/// Number of floating-point registers, the conversion temp included
pub const FPR_COUNT: usize = 4;
/// Floating-point registers the allocator hands out
pub const ALLOCATABLE_FPRS: usize = FPR_COUNT - 1;

/// Register holding a stub's return word
pub const RETURN_REG: Reg = Reg(0);
/// Scratch FPR for out-of-line conversions; never allocated
pub const FP_CONVERSION_TEMP: FReg = FReg(3);

/// General-purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reg(pub u8);

/// Floating-point register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FReg(pub u8);

impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "r{}", self.0)
    }
}

impl std::fmt::Display for FReg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Set of registers; bits 0..8 are GPRs, 8..12 FPRs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash, Serialize, Deserialize)]
pub struct RegMask(u16);

impl RegMask {
    /// No registers
    pub const EMPTY: RegMask = RegMask(0);

    /// Mask with one GPR
    pub const fn gpr(reg: Reg) -> Self {
        RegMask(1 << reg.0)
    }

    /// Mask with one FPR
    pub const fn fpr(reg: FReg) -> Self {
        RegMask(1 << (GPR_COUNT as u8 + reg.0))
    }

    /// Union
    pub const fn union(self, other: RegMask) -> Self {
        RegMask(self.0 | other.0)
    }

    /// Contains the GPR
    pub const fn has_gpr(self, reg: Reg) -> bool {
        self.0 & (1 << reg.0) != 0
    }

    /// Contains the FPR
    pub const fn has_fpr(self, reg: FReg) -> bool {
        self.0 & (1 << (GPR_COUNT as u8 + reg.0)) != 0
    }

    /// Raw bits
    pub const fn bits(self) -> u16 {
        self.0
    }
}

/// What a register currently holds, as far as the allocator knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Nothing
    Free,
    /// The payload of a frame slot
    Data(FrameSlot),
    /// The tag of a frame slot
    Type(FrameSlot),
    /// A scratch value owned by the emitter; never evicted
    Temp,
}

#[derive(Debug, Clone, Copy)]
struct RegState {
    binding: Binding,
    pinned: bool,
    last_use: u64,
}

impl RegState {
    const FREE: RegState = RegState {
        binding: Binding::Free,
        pinned: false,
        last_use: 0,
    };
}

/// Allocation state of every register for one compilation
#[derive(Debug, Clone)]
pub struct RegisterFile {
    gprs: [RegState; GPR_COUNT],
    fprs: [RegState; ALLOCATABLE_FPRS],
    clock: u64,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    /// All registers free
    pub fn new() -> Self {
        Self {
            gprs: [RegState::FREE; GPR_COUNT],
            fprs: [RegState::FREE; ALLOCATABLE_FPRS],
            clock: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Binding of a GPR
    pub fn binding(&self, reg: Reg) -> Binding {
        self.gprs[reg.0 as usize].binding
    }

    /// Binding of an FPR
    pub fn fp_binding(&self, reg: FReg) -> Binding {
        self.fprs
            .get(reg.0 as usize)
            .map_or(Binding::Free, |s| s.binding)
    }

    /// Claim a free GPR as a temp
    pub fn take_free(&mut self) -> Option<Reg> {
        let idx = self
            .gprs
            .iter()
            .position(|s| s.binding == Binding::Free && !s.pinned)?;
        let now = self.tick();
        self.gprs[idx] = RegState {
            binding: Binding::Temp,
            pinned: false,
            last_use: now,
        };
        Some(Reg(idx as u8))
    }

    /// Claim a free FPR as a temp
    pub fn take_free_fp(&mut self) -> Option<FReg> {
        let idx = self
            .fprs
            .iter()
            .position(|s| s.binding == Binding::Free && !s.pinned)?;
        let now = self.tick();
        self.fprs[idx] = RegState {
            binding: Binding::Temp,
            pinned: false,
            last_use: now,
        };
        Some(FReg(idx as u8))
    }

    /// Least recently used GPR that is bound to a slot and not pinned
    pub fn eviction_candidate(&self) -> Option<Reg> {
        self.gprs
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.binding, Binding::Data(_) | Binding::Type(_)) && !s.pinned)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| Reg(i as u8))
    }

    /// Least recently used FPR that is bound to a slot and not pinned
    pub fn fp_eviction_candidate(&self) -> Option<FReg> {
        self.fprs
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.binding, Binding::Data(_)) && !s.pinned)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(i, _)| FReg(i as u8))
    }

    /// Set the binding of a GPR
    pub fn bind(&mut self, reg: Reg, binding: Binding) {
        let now = self.tick();
        let state = &mut self.gprs[reg.0 as usize];
        state.binding = binding;
        state.last_use = now;
    }

    /// Set the binding of an FPR
    pub fn bind_fp(&mut self, reg: FReg, binding: Binding) {
        let now = self.tick();
        let state = &mut self.fprs[reg.0 as usize];
        state.binding = binding;
        state.last_use = now;
    }

    /// Mark a GPR as just used
    pub fn touch(&mut self, reg: Reg) {
        let now = self.tick();
        self.gprs[reg.0 as usize].last_use = now;
    }

    /// Mark an FPR as just used
    pub fn touch_fp(&mut self, reg: FReg) {
        let now = self.tick();
        self.fprs[reg.0 as usize].last_use = now;
    }

    /// Pin a GPR; returns false if it already was
    pub fn pin(&mut self, reg: Reg) -> bool {
        !std::mem::replace(&mut self.gprs[reg.0 as usize].pinned, true)
    }

    /// Unpin a GPR; returns false if it was not pinned
    pub fn unpin(&mut self, reg: Reg) -> bool {
        std::mem::replace(&mut self.gprs[reg.0 as usize].pinned, false)
    }

    /// Pin an FPR; returns false if it already was
    pub fn pin_fp(&mut self, reg: FReg) -> bool {
        !std::mem::replace(&mut self.fprs[reg.0 as usize].pinned, true)
    }

    /// Unpin an FPR; returns false if it was not pinned
    pub fn unpin_fp(&mut self, reg: FReg) -> bool {
        std::mem::replace(&mut self.fprs[reg.0 as usize].pinned, false)
    }

    /// Is the GPR pinned
    pub fn is_pinned(&self, reg: Reg) -> bool {
        self.gprs[reg.0 as usize].pinned
    }

    /// Registers held as temps
    pub fn temp_count(&self) -> usize {
        self.gprs
            .iter()
            .chain(self.fprs.iter())
            .filter(|s| s.binding == Binding::Temp)
            .count()
    }

    /// Registers currently pinned
    pub fn pinned_count(&self) -> usize {
        self.gprs
            .iter()
            .chain(self.fprs.iter())
            .filter(|s| s.pinned)
            .count()
    }

    /// Every register that is not free
    pub fn in_use(&self) -> RegMask {
        let gprs = self
            .gprs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.binding != Binding::Free)
            .fold(RegMask::EMPTY, |m, (i, _)| m.union(RegMask::gpr(Reg(i as u8))));
        self.fprs
            .iter()
            .enumerate()
            .filter(|(_, s)| s.binding != Binding::Free)
            .fold(gprs, |m, (i, _)| m.union(RegMask::fpr(FReg(i as u8))))
    }

    /// Every GPR bound to `slot`
    pub fn bound_to(&self, slot: FrameSlot) -> impl Iterator<Item = Reg> + '_ {
        self.gprs.iter().enumerate().filter_map(move |(i, s)| match s.binding {
            Binding::Data(b) | Binding::Type(b) if b == slot => Some(Reg(i as u8)),
            _ => None,
        })
    }

    /// Forget every binding and pin
    pub fn reset(&mut self) {
        self.gprs = [RegState::FREE; GPR_COUNT];
        self.fprs = [RegState::FREE; ALLOCATABLE_FPRS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eviction_prefers_least_recent_unpinned() {
        let mut file = RegisterFile::new();
        let regs: Vec<Reg> = (0..GPR_COUNT).map(|_| file.take_free().expect("free reg")).collect();
        for (i, &r) in regs.iter().enumerate() {
            file.bind(r, Binding::Data(FrameSlot(i as u32)));
        }
        assert_eq!(file.take_free(), None);
        assert_eq!(file.eviction_candidate(), Some(regs[0]));
        file.pin(regs[0]);
        assert_eq!(file.eviction_candidate(), Some(regs[1]));
        file.touch(regs[1]);
        assert_eq!(file.eviction_candidate(), Some(regs[2]));
    }

    #[test]
    fn test_temps_are_never_candidates() {
        let mut file = RegisterFile::new();
        let r = file.take_free().expect("free reg");
        assert_eq!(file.binding(r), Binding::Temp);
        assert_eq!(file.eviction_candidate(), None);
        assert_eq!(file.temp_count(), 1);
        assert!(file.in_use().has_gpr(r));
    }

    #[test]
    fn test_conversion_temp_is_not_allocatable() {
        let mut file = RegisterFile::new();
        let taken: Vec<FReg> = std::iter::from_fn(|| file.take_free_fp()).collect();
        assert_eq!(taken.len(), ALLOCATABLE_FPRS);
        assert!(!taken.contains(&FP_CONVERSION_TEMP));
    }

    #[test]
    fn test_pin_reports_double_pin() {
        let mut file = RegisterFile::new();
        assert!(file.pin(Reg(3)));
        assert!(!file.pin(Reg(3)));
        assert!(file.unpin(Reg(3)));
        assert!(!file.unpin(Reg(3)));
    }
}
