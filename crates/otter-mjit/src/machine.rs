//! Executor for compiled code.
//!
//! Runs the finalized instruction vector of a [`PublishedCode`] against the
//! runtime heap. It is the reference semantics of the abstract machine and
//! the harness every behavioral test goes through.
//!
//! Two things make it stricter than real hardware:
//!
//! - a stub call poisons every register it is not asked to preserve, and
//!   reading a poisoned register is an [`ExecError`]; a missing reload after
//!   a call shows up as an error instead of a silently wrong value
//! - IC patch points are honored here: a megamorphic IC's fast-path start
//!   jumps to its slow path, and a failing class guard probes the attached
//!   specializations before taking its exit

use otter_mjit_bytecode::Function;
use otter_mjit_runtime::{Heap, ObjId, RawValue, RuntimeError, Tag, Value};
use serde::Serialize;

use crate::assembler::{CheckedOp, CodeOffset, Cond, DoubleOp, FrameSlot, Inst, Int32Key, Operand, TestCond, ValueSource};
use crate::bailout::{BailoutReason, BailoutState};
use crate::code::{CompiledCode, PublishedCode, RejoinSite};
use crate::config::JitConfig;
use crate::ic::{self, IcId, IcKey, IcKind, IcLayout};
use crate::oracle::{TypeFlags, TypeSet};
use crate::regs::{FPR_COUNT, FReg, GPR_COUNT, RETURN_REG, Reg, RegMask};
use crate::stubs::{self, StubFrame, StubKind};

/// Value a clobbered register reads as, for debugging dumps
pub const POISON: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Instructions a single run may execute before it is stopped
pub const DEFAULT_STEP_LIMIT: u64 = 1 << 24;

/// Faults of compiled code
///
/// Each of these means the compiler produced wrong code; a failing generic
/// operation is a bailout, not an error.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    /// A heap access the guards should have ruled out
    #[error("runtime fault in compiled code: {0}")]
    Runtime(#[from] RuntimeError),

    /// The code has no entry for pc 0
    #[error("compiled code has no entry point")]
    NoEntry,

    /// Control reached an offset outside the code
    #[error("control reached offset {at} outside the code")]
    OffsetOutOfRange { at: CodeOffset },

    /// A register number outside the register file
    #[error("invalid register {reg} at offset {at}")]
    InvalidRegister { reg: String, at: CodeOffset },

    /// A GPR read after a call clobbered it
    #[error("read of clobbered register {reg} at offset {at}")]
    PoisonedGpr { reg: Reg, at: CodeOffset },

    /// An FPR read after a call clobbered it
    #[error("read of clobbered register {reg} at offset {at}")]
    PoisonedFpr { reg: FReg, at: CodeOffset },

    /// A frame slot past the frame
    #[error("frame slot {slot} out of range at offset {at}")]
    SlotOutOfRange { slot: u32, at: CodeOffset },

    /// An element or named slot past the object's storage
    #[error("object storage index {index} out of range at offset {at}")]
    ElementOutOfRange { index: u32, at: CodeOffset },

    /// An IC id with no layout
    #[error("unknown IC {ic}")]
    UnknownIc { ic: u32 },

    /// A stub call with no rejoin site
    #[error("stub call at offset {at} has no rejoin site")]
    MissingRejoinSite { at: CodeOffset },

    /// An instruction the machine cannot execute as encoded
    #[error("invalid instruction at offset {at}: {detail}")]
    InvalidInstruction { at: CodeOffset, detail: String },

    /// The run did not finish within the step limit
    #[error("step limit of {limit} instructions exceeded")]
    StepLimit { limit: u64 },
}

/// Result type for execution
pub type ExecResult<T> = std::result::Result<T, ExecError>;

/// How a run ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecOutcome {
    /// The function returned
    Return(Value),
    /// Control went back to the interpreter
    Bailout(BailoutState),
}

impl ExecOutcome {
    /// The returned value, if the run finished in compiled code
    pub fn value(&self) -> Option<Value> {
        match self {
            ExecOutcome::Return(v) => Some(*v),
            ExecOutcome::Bailout(_) => None,
        }
    }
}

/// Executor counters, collected when [`JitConfig::stats`] is set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecStats {
    /// Instructions executed
    pub steps: u64,
    /// Instructions executed in the fast stream
    pub fast_steps: u64,
    /// Instructions executed in the slow stream
    pub slow_steps: u64,
    /// Generic stub calls
    pub stub_calls: u64,
    /// IC stub calls
    pub ic_calls: u64,
    /// Accesses served by an attached specialization
    pub ic_hits: u64,
    /// Fast-path starts redirected because the IC is megamorphic
    pub megamorphic_redirects: u64,
    /// Runs that ended in a bailout
    pub bailouts: u64,
    /// Holes met by loads that assumed a packed array
    pub hole_faults: u64,
}

// ---------------------------------------------------------------------------
// Machine state
// ---------------------------------------------------------------------------

struct Cpu {
    gprs: [u64; GPR_COUNT],
    fprs: [f64; FPR_COUNT],
    poisoned_gprs: [bool; GPR_COUNT],
    poisoned_fprs: [bool; FPR_COUNT],
    slots: Vec<RawValue>,
    at: CodeOffset,
}

impl Cpu {
    fn new(code: &CompiledCode, args: &[Value]) -> Self {
        let mut slots = vec![RawValue::UNDEFINED; code.frame_size as usize];
        for (slot, arg) in slots.iter_mut().zip(args.iter().take(code.nargs as usize)) {
            *slot = arg.to_raw();
        }
        Self {
            gprs: [0; GPR_COUNT],
            fprs: [0.0; FPR_COUNT],
            poisoned_gprs: [false; GPR_COUNT],
            poisoned_fprs: [false; FPR_COUNT],
            slots,
            at: 0,
        }
    }

    fn invalid_reg(&self, reg: impl std::fmt::Display) -> ExecError {
        ExecError::InvalidRegister {
            reg: reg.to_string(),
            at: self.at,
        }
    }

    fn gpr(&self, reg: Reg) -> ExecResult<u64> {
        let i = reg.0 as usize;
        match (self.gprs.get(i), self.poisoned_gprs.get(i)) {
            (Some(_), Some(true)) => Err(ExecError::PoisonedGpr { reg, at: self.at }),
            (Some(&value), _) => Ok(value),
            _ => Err(self.invalid_reg(reg)),
        }
    }

    fn set_gpr(&mut self, reg: Reg, value: u64) -> ExecResult<()> {
        let i = reg.0 as usize;
        if i >= GPR_COUNT {
            return Err(self.invalid_reg(reg));
        }
        self.gprs[i] = value;
        self.poisoned_gprs[i] = false;
        Ok(())
    }

    fn fpr(&self, reg: FReg) -> ExecResult<f64> {
        let i = reg.0 as usize;
        match (self.fprs.get(i), self.poisoned_fprs.get(i)) {
            (Some(_), Some(true)) => Err(ExecError::PoisonedFpr { reg, at: self.at }),
            (Some(&value), _) => Ok(value),
            _ => Err(self.invalid_reg(reg)),
        }
    }

    fn set_fpr(&mut self, reg: FReg, value: f64) -> ExecResult<()> {
        let i = reg.0 as usize;
        if i >= FPR_COUNT {
            return Err(self.invalid_reg(reg));
        }
        self.fprs[i] = value;
        self.poisoned_fprs[i] = false;
        Ok(())
    }

    /// Clobber everything a call does not preserve; `r0` gets the result
    fn clobber(&mut self, preserve: RegMask, word: u64) {
        for i in 0..GPR_COUNT {
            if !preserve.has_gpr(Reg(i as u8)) {
                self.gprs[i] = POISON;
                self.poisoned_gprs[i] = true;
            }
        }
        for i in 0..FPR_COUNT {
            if !preserve.has_fpr(FReg(i as u8)) {
                self.fprs[i] = f64::from_bits(POISON);
                self.poisoned_fprs[i] = true;
            }
        }
        if !preserve.has_gpr(RETURN_REG) {
            self.gprs[RETURN_REG.0 as usize] = word;
            self.poisoned_gprs[RETURN_REG.0 as usize] = false;
        }
    }

    fn slot(&self, slot: FrameSlot) -> ExecResult<RawValue> {
        self.slots.get(slot.index()).copied().ok_or(ExecError::SlotOutOfRange {
            slot: slot.0,
            at: self.at,
        })
    }

    fn slot_mut(&mut self, slot: FrameSlot) -> ExecResult<&mut RawValue> {
        let at = self.at;
        self.slots
            .get_mut(slot.index())
            .ok_or(ExecError::SlotOutOfRange { slot: slot.0, at })
    }

    fn operand(&self, op: Operand) -> ExecResult<u64> {
        Ok(match op {
            Operand::Reg(reg) => self.gpr(reg)?,
            Operand::Imm(imm) => imm as u64,
            Operand::Tag(slot) => self.slot(slot)?.tag,
            Operand::Payload(slot) => self.slot(slot)?.payload,
        })
    }

    fn value_source(&self, src: ValueSource) -> ExecResult<RawValue> {
        Ok(match src {
            ValueSource::Constant(raw) => raw,
            ValueSource::Typed { tag, payload } => RawValue::new(tag, self.gpr(payload)?),
            ValueSource::Regs { tag, payload } => RawValue {
                tag: self.gpr(tag)?,
                payload: self.gpr(payload)?,
            },
            ValueSource::Double(reg) => Value::number(self.fpr(reg)?).to_raw(),
        })
    }

    fn int32_key(&self, key: Int32Key) -> ExecResult<u32> {
        Ok(match key {
            Int32Key::Constant(i) => i as u32,
            Int32Key::Reg(reg) => self.gpr(reg)? as u32,
        })
    }

    fn ic_key(&self, key: IcKey) -> ExecResult<Value> {
        Ok(match key {
            IcKey::Constant(i) => Value::Int32(i),
            IcKey::Reg {
                tag,
                payload,
                known_tag,
            } => {
                let tag = match (tag, known_tag) {
                    (Some(reg), _) => self.gpr(reg)?,
                    (None, Some(bits)) => bits,
                    (None, None) => {
                        return Err(ExecError::InvalidInstruction {
                            at: self.at,
                            detail: "IC key with neither a tag register nor a known tag".into(),
                        });
                    }
                };
                RawValue {
                    tag,
                    payload: self.gpr(payload)?,
                }
                .decode()?
            }
        })
    }

    fn decode_frame(&self, sp: u32) -> ExecResult<Vec<Value>> {
        let slots = self.slots.get(..sp as usize).ok_or(ExecError::SlotOutOfRange { slot: sp, at: self.at })?;
        Ok(slots.iter().map(|raw| raw.decode()).collect::<Result<Vec<_>, RuntimeError>>()?)
    }
}

fn ic_layout(code: &CompiledCode, ic: IcId) -> ExecResult<IcLayout> {
    code.ics.get(ic.0 as usize).copied().ok_or(ExecError::UnknownIc { ic: ic.0 })
}

fn rejoin_site(code: &CompiledCode, at: CodeOffset) -> ExecResult<&RejoinSite> {
    code.call_sites
        .get(&at)
        .and_then(|&i| code.rejoin_sites.get(i))
        .ok_or(ExecError::MissingRejoinSite { at })
}

fn ic_stub_kind(kind: IcKind) -> StubKind {
    match kind {
        IcKind::GetElem => StubKind::GetElem,
        IcKind::SetElem => StubKind::SetElem,
    }
}

// ---------------------------------------------------------------------------
// Machine
// ---------------------------------------------------------------------------

/// Runs compiled code against a heap
pub struct Machine<'h> {
    heap: &'h mut Heap,
    config: JitConfig,
    step_limit: u64,
    stats: ExecStats,
}

impl<'h> Machine<'h> {
    /// Machine configured from `OTTER_MJIT_*`
    pub fn new(heap: &'h mut Heap) -> Self {
        Self::with_config(heap, JitConfig::from_env())
    }

    /// Machine with explicit settings
    pub fn with_config(heap: &'h mut Heap, config: JitConfig) -> Self {
        Self {
            heap,
            config,
            step_limit: DEFAULT_STEP_LIMIT,
            stats: ExecStats::default(),
        }
    }

    /// Stop runs after `limit` instructions
    pub fn with_step_limit(mut self, limit: u64) -> Self {
        self.step_limit = limit;
        self
    }

    /// Counters so far; all zero unless stats are enabled
    pub fn stats(&self) -> ExecStats {
        self.stats
    }

    /// The heap
    pub fn heap(&self) -> &Heap {
        &*self.heap
    }

    /// The heap, mutably
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut *self.heap
    }

    #[inline]
    fn count(&mut self, f: impl FnOnce(&mut ExecStats)) {
        if self.config.stats {
            f(&mut self.stats);
        }
    }

    /// Run `published` as `function` with `args`
    pub fn run(&mut self, published: &PublishedCode, function: &Function, args: &[Value]) -> ExecResult<ExecOutcome> {
        let code = published.code().as_ref();
        let mut cpu = Cpu::new(code, args);
        let mut at = code.offset_of_pc(0).ok_or(ExecError::NoEntry)?;
        let mut steps = 0u64;

        loop {
            steps += 1;
            if steps > self.step_limit {
                return Err(ExecError::StepLimit { limit: self.step_limit });
            }

            if let Some(&ic) = code.fast_path_starts.get(&at)
                && published.ic_state(ic).is_some_and(|state| state.megamorphic)
            {
                self.count(|s| s.megamorphic_redirects += 1);
                at = ic_layout(code, ic)?.slow_path_start;
                continue;
            }

            let inst = *code.insts.get(at as usize).ok_or(ExecError::OffsetOutOfRange { at })?;
            cpu.at = at;
            let fast = at < code.fast_len;
            self.count(|s| {
                s.steps += 1;
                if fast {
                    s.fast_steps += 1;
                } else {
                    s.slow_steps += 1;
                }
            });

            let mut next = at + 1;
            match inst {
                Inst::Move { dst, src } => {
                    let value = cpu.operand(src)?;
                    cpu.set_gpr(dst, value)?;
                }
                Inst::StoreTag { slot, src } => {
                    let value = cpu.operand(src)?;
                    cpu.slot_mut(slot)?.tag = value;
                }
                Inst::StorePayload { slot, src } => {
                    let value = cpu.operand(src)?;
                    cpu.slot_mut(slot)?.payload = value;
                }
                Inst::StoreValue { slot, src } => {
                    let value = cpu.value_source(src)?;
                    *cpu.slot_mut(slot)? = value;
                }
                Inst::CopySlot { dst, src } => {
                    let value = cpu.slot(src)?;
                    *cpu.slot_mut(dst)? = value;
                }
                Inst::LoadDouble { dst, slot } => {
                    let raw = cpu.slot(slot)?;
                    let value = if raw.tag == Tag::Int32.bits() {
                        raw.payload as u32 as i32 as f64
                    } else {
                        f64::from_bits(raw.payload)
                    };
                    cpu.set_fpr(dst, value)?;
                }
                Inst::MoveDoubleImm { dst, value } => cpu.set_fpr(dst, value)?,
                Inst::MoveDouble { dst, src } => {
                    let value = cpu.fpr(src)?;
                    cpu.set_fpr(dst, value)?;
                }
                Inst::MoveBitsToDouble { dst, src } => {
                    let bits = cpu.gpr(src)?;
                    cpu.set_fpr(dst, f64::from_bits(bits))?;
                }
                Inst::ConvertInt32ToDouble { dst, src } => {
                    let value = cpu.gpr(src)? as u32 as i32;
                    cpu.set_fpr(dst, value as f64)?;
                }
                Inst::ConvertUint32ToDouble { dst, src } => {
                    let value = cpu.gpr(src)? as u32;
                    cpu.set_fpr(dst, value as f64)?;
                }
                Inst::AluDouble { op, dst, src } => {
                    let (lhs, rhs) = (cpu.fpr(dst)?, cpu.fpr(src)?);
                    let value = match op {
                        DoubleOp::Add => lhs + rhs,
                        DoubleOp::Sub => lhs - rhs,
                    };
                    cpu.set_fpr(dst, value)?;
                }
                Inst::ZeroDouble { dst } => cpu.set_fpr(dst, 0.0)?,
                Inst::Alu32 { op, dst, src } => {
                    let (lhs, rhs) = (cpu.gpr(dst)? as u32, cpu.operand(src)? as u32);
                    cpu.set_gpr(dst, op.apply(lhs, rhs) as u64)?;
                }
                Inst::BranchAlu32 { op, dst, src, target } => {
                    let (lhs, rhs) = (cpu.gpr(dst)? as u32 as i32, cpu.operand(src)? as u32 as i32);
                    let result = match op {
                        CheckedOp::Add => lhs.checked_add(rhs),
                        CheckedOp::Sub => lhs.checked_sub(rhs),
                    };
                    match result {
                        Some(value) => cpu.set_gpr(dst, value as u32 as u64)?,
                        None => next = target,
                    }
                }
                Inst::Not32 { dst } => {
                    let value = !(cpu.gpr(dst)? as u32);
                    cpu.set_gpr(dst, value as u64)?;
                }
                Inst::Set32 { cond, lhs, rhs, dst } => {
                    let holds = cond.eval(cpu.gpr(lhs)?, cpu.operand(rhs)?);
                    cpu.set_gpr(dst, holds as u64)?;
                }
                Inst::SetDouble { cond, lhs, rhs, dst } => {
                    let holds = cond.eval(cpu.fpr(lhs)?, cpu.fpr(rhs)?);
                    cpu.set_gpr(dst, holds as u64)?;
                }
                Inst::Branch32 { cond, lhs, rhs, target } => {
                    if cond.eval(cpu.operand(lhs)?, cpu.operand(rhs)?) {
                        next = target;
                    }
                }
                Inst::BranchTest32 { cond, lhs, mask, target } => {
                    let zero = (cpu.gpr(lhs)? & cpu.operand(mask)?) as u32 == 0;
                    if zero == (cond == TestCond::Zero) {
                        next = target;
                    }
                }
                Inst::BranchDouble { cond, lhs, rhs, target } => {
                    if cond.eval(cpu.fpr(lhs)?, cpu.fpr(rhs)?) {
                        next = target;
                    }
                }
                Inst::BranchTruncateDoubleToInt32 { src, dst, target } => {
                    let truncated = cpu.fpr(src)?.trunc();
                    if (i32::MIN as f64..=i32::MAX as f64).contains(&truncated) {
                        cpu.set_gpr(dst, truncated as i32 as u32 as u64)?;
                    } else {
                        next = target;
                    }
                }
                Inst::BranchConvertDoubleToInt32 { src, dst, target } => {
                    let value = cpu.fpr(src)?;
                    let int = value as i32;
                    if int as f64 == value && !(value == 0.0 && value.is_sign_negative()) {
                        cpu.set_gpr(dst, int as u32 as u64)?;
                    } else {
                        next = target;
                    }
                }
                Inst::LoadObjField { dst, obj, field } => {
                    let value = self.heap.object_at(cpu.gpr(obj)?)?.field(field);
                    cpu.set_gpr(dst, value as u64)?;
                }
                Inst::StoreObjField { obj, field, src } => {
                    let value = cpu.operand(src)? as u32;
                    self.heap.object_at_mut(cpu.gpr(obj)?)?.set_field(field, value)?;
                }
                Inst::BranchObjClass { cond, obj, class, target } => {
                    let actual = self.heap.object_at(cpu.gpr(obj)?)?.class;
                    let taken = match cond {
                        Cond::Equal => actual == class,
                        Cond::NotEqual => actual != class,
                        other => {
                            return Err(ExecError::InvalidInstruction {
                                at,
                                detail: format!("class guard with ordering condition {other:?}"),
                            });
                        }
                    };
                    if taken {
                        next = match code.clasp_guards.get(&at) {
                            Some(&ic) => self.probe_ic(published, ic, &mut cpu)?.unwrap_or(target),
                            None => target,
                        };
                    }
                }
                Inst::BranchArrayExtent {
                    field,
                    obj,
                    key,
                    cond,
                    target,
                } => {
                    let key = cpu.int32_key(key)?;
                    let extent = self.heap.object_at(cpu.gpr(obj)?)?.field(field);
                    if cond.eval(extent as u64, key as u64) {
                        next = target;
                    }
                }
                Inst::BranchElementHole { obj, key, target } => {
                    let index = cpu.int32_key(key)?;
                    let object = self.heap.object_at(cpu.gpr(obj)?)?;
                    if object.elements.get(index as usize).is_none_or(|e| e.is_hole()) {
                        next = target;
                    }
                }
                Inst::LoadElement { obj, key, tag, payload } => {
                    let index = cpu.int32_key(key)?;
                    let raw = self
                        .heap
                        .object_at(cpu.gpr(obj)?)?
                        .elements
                        .get(index as usize)
                        .copied()
                        .ok_or(ExecError::ElementOutOfRange { index, at })?;
                    if let Some(tag) = tag {
                        cpu.set_gpr(tag, raw.tag)?;
                    }
                    cpu.set_gpr(payload, raw.payload)?;
                }
                Inst::LoadPackedElement {
                    obj,
                    key,
                    tag,
                    payload,
                    target,
                } => {
                    let index = cpu.int32_key(key)?;
                    let raw = self
                        .heap
                        .object_at(cpu.gpr(obj)?)?
                        .elements
                        .get(index as usize)
                        .copied()
                        .ok_or(ExecError::ElementOutOfRange { index, at })?;
                    if raw.is_hole() {
                        self.count(|s| s.hole_faults += 1);
                        next = target;
                    } else {
                        if let Some(tag) = tag {
                            cpu.set_gpr(tag, raw.tag)?;
                        }
                        cpu.set_gpr(payload, raw.payload)?;
                    }
                }
                Inst::StoreElement { obj, key, value } => {
                    let index = cpu.int32_key(key)?;
                    let raw = cpu.value_source(value)?;
                    let element = self
                        .heap
                        .object_at_mut(cpu.gpr(obj)?)?
                        .elements
                        .get_mut(index as usize)
                        .ok_or(ExecError::ElementOutOfRange { index, at })?;
                    *element = raw;
                }
                Inst::LoadNamedSlot { obj, slot, tag, payload } => {
                    let raw = self
                        .heap
                        .object_at(cpu.gpr(obj)?)?
                        .slots
                        .get(slot as usize)
                        .copied()
                        .ok_or(ExecError::ElementOutOfRange { index: slot, at })?;
                    if let Some(tag) = tag {
                        cpu.set_gpr(tag, raw.tag)?;
                    }
                    cpu.set_gpr(payload, raw.payload)?;
                }
                Inst::StoreNamedSlot { obj, slot, value } => {
                    let raw = cpu.value_source(value)?;
                    let target = self
                        .heap
                        .object_at_mut(cpu.gpr(obj)?)?
                        .slots
                        .get_mut(slot as usize)
                        .ok_or(ExecError::ElementOutOfRange { index: slot, at })?;
                    *target = raw;
                }
                Inst::BranchPrototypeEpoch { expected, target } => {
                    if self.heap.prototype_epoch() != expected {
                        next = target;
                    }
                }
                Inst::CallStub { stub, sp, arg } => {
                    self.count(|s| s.stub_calls += 1);
                    let result = stubs::invoke(
                        stub,
                        &mut StubFrame {
                            heap: &mut *self.heap,
                            function,
                            slots: &mut cpu.slots,
                            sp,
                        },
                        arg,
                    );
                    match result {
                        Ok(word) => cpu.clobber(RegMask::EMPTY, word),
                        Err(error) => return self.stub_failure(code, &cpu, error).map(ExecOutcome::Bailout),
                    }
                    if let Some(state) = self.type_barrier(code, &cpu, stub)? {
                        return Ok(ExecOutcome::Bailout(state));
                    }
                }
                Inst::CallIcStub { ic, sp, preserve } => {
                    let layout = ic_layout(code, ic)?;
                    let stub = ic_stub_kind(layout.kind);
                    let base = sp.checked_sub(stub.uses()).ok_or(ExecError::SlotOutOfRange { slot: sp, at })?;
                    let obj = cpu.slot(FrameSlot(base))?.decode()?;
                    let key = cpu.slot(FrameSlot(base + 1))?.decode()?;
                    self.count(|s| s.ic_calls += 1);
                    let result = stubs::invoke(
                        stub,
                        &mut StubFrame {
                            heap: &mut *self.heap,
                            function,
                            slots: &mut cpu.slots,
                            sp,
                        },
                        0,
                    );
                    let word = match result {
                        Ok(word) => word,
                        Err(error) => return self.stub_failure(code, &cpu, error).map(ExecOutcome::Bailout),
                    };
                    if let Some(specialization) = ic::choose_stub(self.heap, obj, key)? {
                        published.attach(ic, specialization);
                    }
                    cpu.clobber(preserve, word);
                    if let Some(state) = self.type_barrier(code, &cpu, stub)? {
                        return Ok(ExecOutcome::Bailout(state));
                    }
                }
                Inst::Jump { target } => next = target,
                Inst::Return { value } => {
                    let value = cpu.value_source(value)?.decode()?;
                    return Ok(ExecOutcome::Return(value));
                }
            }
            at = next;
        }
    }

    /// Try the IC's attached specializations after its class guard failed;
    /// returns where to continue on a hit
    fn probe_ic(&mut self, published: &PublishedCode, ic: IcId, cpu: &mut Cpu) -> ExecResult<Option<CodeOffset>> {
        let state = published.ic_state(ic).ok_or(ExecError::UnknownIc { ic: ic.0 })?;
        if state.stubs.is_empty() {
            return Ok(None);
        }
        let layout = ic_layout(published.code(), ic)?;
        let obj = ObjId(cpu.gpr(layout.obj)? as u32);
        let key = cpu.ic_key(layout.key)?;
        let hit = match layout.kind {
            IcKind::GetElem => match ic::probe_get(self.heap, &state.stubs, obj, key)? {
                Some(raw) => {
                    let (tag, payload) = layout.result.ok_or_else(|| ExecError::InvalidInstruction {
                        at: cpu.at,
                        detail: format!("getelem IC {} has no result registers", ic.0),
                    })?;
                    cpu.set_gpr(tag, raw.tag)?;
                    cpu.set_gpr(payload, raw.payload)?;
                    true
                }
                None => false,
            },
            IcKind::SetElem => {
                let source = layout.value.ok_or_else(|| ExecError::InvalidInstruction {
                    at: cpu.at,
                    detail: format!("setelem IC {} has no value source", ic.0),
                })?;
                let value = cpu.value_source(source)?.decode()?;
                ic::probe_set(self.heap, &state.stubs, obj, key, value)?
            }
        };
        if !hit {
            return Ok(None);
        }
        self.count(|s| s.ic_hits += 1);
        Ok(Some(layout.fast_path_rejoin))
    }

    fn stub_failure(&mut self, code: &CompiledCode, cpu: &Cpu, error: RuntimeError) -> ExecResult<BailoutState> {
        let site = rejoin_site(code, cpu.at)?;
        self.count(|s| s.bailouts += 1);
        tracing::debug!(
            function = %code.name,
            pc = site.pc,
            sp = site.sp,
            %error,
            "stub failed, bailing out"
        );
        Ok(BailoutState {
            reason: BailoutReason::StubFailure,
            pc: site.pc,
            sp: site.sp,
            frame: cpu.decode_frame(site.sp)?,
            error: Some(error),
        })
    }

    /// Check a monitored site's result against its promised types
    ///
    /// Only calls that complete their operation are checked; the result is
    /// then the value the call wrote at the bottom of its operands.
    fn type_barrier(&mut self, code: &CompiledCode, cpu: &Cpu, stub: StubKind) -> ExecResult<Option<BailoutState>> {
        let site = rejoin_site(code, cpu.at)?;
        let Some(mask) = site.monitored_types else {
            return Ok(None);
        };
        if stub.defs() == 0 || site.sp + stub.defs() != site.sp_after + stub.uses() {
            return Ok(None);
        }
        let result_slot = site.sp_after - stub.defs();
        let result = cpu.slot(FrameSlot(result_slot))?.decode()?;
        if TypeSet::of(TypeFlags::from_bits_truncate(mask)).contains_value(result) {
            return Ok(None);
        }
        self.count(|s| s.bailouts += 1);
        tracing::debug!(
            function = %code.name,
            pc = site.pc,
            ?result,
            "monitored result outside its type set, bailing out"
        );
        Ok(Some(BailoutState {
            reason: BailoutReason::TypeBarrier,
            pc: site.resume_pc,
            sp: site.sp_after,
            frame: cpu.decode_frame(site.sp_after)?,
            error: None,
        }))
    }
}
