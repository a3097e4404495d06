//! Compile-time model of the frame: what each slot holds and where.
//!
//! Every live slot (arguments, locals, operand stack) has an entry recording
//! its statically known type or constant, whether its payload and tag live in
//! memory or in registers, whether memory is up to date, and whether the slot
//! is a copy of a lower slot.
//!
//! Invariants kept here:
//! - a copy always points at a lower slot that is not itself a copy
//! - copies of constants are constants
//! - a register bound to a slot is recorded on both sides
//! - an entry whose data lives in memory has valid memory
//!
//! Emitting sync code for an exit (`sync_to`) never changes the model, so
//! code emitted later for the same exit would see the same state. Anything
//! that can change what a bound register holds (spills, moves between
//! entries, pushes and pops) bumps the generation, which is how stale exits
//! are caught. Loading a slot into a free register does not.

use otter_mjit_bytecode::{ArgIndex, LocalIndex, TemplateIndex};
use otter_mjit_runtime::{Tag, Value};

use crate::assembler::{FrameSlot, Inst, Masm, Operand, ValueSource};
use crate::compiler::{JitError, JitResult};
use crate::oracle::TypeSet;
use crate::regs::{Binding, FReg, Reg, RegisterFile};

/// Statically known type of a slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KnownType {
    /// Any type; the tag must be read
    Unknown,
    /// int32
    Int32,
    /// Some number; the value is handled as a double
    Double,
    /// boolean
    Boolean,
    /// string
    String,
    /// `null`
    Null,
    /// `undefined`
    Undefined,
    /// object
    Object,
}

impl KnownType {
    /// The tag every value of this type carries
    ///
    /// `Double` has none: a slot known to be a number may hold either
    /// numeric tag in memory.
    pub const fn tag(self) -> Option<Tag> {
        match self {
            KnownType::Int32 => Some(Tag::Int32),
            KnownType::Boolean => Some(Tag::Boolean),
            KnownType::String => Some(Tag::String),
            KnownType::Null => Some(Tag::Null),
            KnownType::Undefined => Some(Tag::Undefined),
            KnownType::Object => Some(Tag::Object),
            KnownType::Unknown | KnownType::Double => None,
        }
    }

    /// Type of a constant
    pub const fn of_value(value: &Value) -> Self {
        match value {
            Value::Undefined => KnownType::Undefined,
            Value::Null => KnownType::Null,
            Value::Boolean(_) => KnownType::Boolean,
            Value::Int32(_) => KnownType::Int32,
            Value::Double(_) => KnownType::Double,
            Value::String(_) => KnownType::String,
            Value::Object(_) => KnownType::Object,
        }
    }

    /// Int32 or double
    pub const fn is_number(self) -> bool {
        matches!(self, KnownType::Int32 | KnownType::Double)
    }

    /// Known and not a number
    pub const fn is_non_number(self) -> bool {
        !matches!(self, KnownType::Unknown | KnownType::Int32 | KnownType::Double)
    }
}

/// Literal a slot is known to be under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitTarget {
    /// Object literal created from a template
    Object(TemplateIndex),
    /// Array literal of the given length
    Array {
        /// Elements the literal declares
        length: u32,
    },
    /// Object literal without a template
    Empty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataLoc {
    Memory,
    Gpr(Reg),
    Fpr(FReg),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TagLoc {
    Memory,
    Gpr(Reg),
}

/// Tracker entry for one slot
#[derive(Debug, Clone)]
pub struct FrameEntry {
    ty: KnownType,
    constant: Option<Value>,
    data: DataLoc,
    tag: TagLoc,
    data_synced: bool,
    tag_synced: bool,
    copy_of: Option<FrameSlot>,
    types: TypeSet,
    init: Option<InitTarget>,
}

impl FrameEntry {
    fn in_memory(types: TypeSet) -> Self {
        Self {
            ty: types.known_type(),
            constant: None,
            data: DataLoc::Memory,
            tag: TagLoc::Memory,
            data_synced: true,
            tag_synced: true,
            copy_of: None,
            types,
            init: None,
        }
    }

    fn unsynced(ty: KnownType, types: TypeSet) -> Self {
        Self {
            ty,
            constant: None,
            data: DataLoc::Memory,
            tag: TagLoc::Memory,
            data_synced: false,
            tag_synced: false,
            copy_of: None,
            types,
            init: None,
        }
    }

    fn constant(value: Value) -> Self {
        let ty = KnownType::of_value(&value);
        Self {
            constant: Some(value),
            ..Self::unsynced(ty, TypeSet::for_known(ty))
        }
    }

    fn copy(of: FrameSlot) -> Self {
        Self {
            copy_of: Some(of),
            ..Self::unsynced(KnownType::Unknown, TypeSet::unknown())
        }
    }

    fn is_synced(&self) -> bool {
        self.data_synced && self.tag_synced
    }
}

/// The frame tracker
#[derive(Debug, Clone)]
pub struct FrameState {
    nargs: u32,
    nlocals: u32,
    entries: Vec<FrameEntry>,
    sp: u32,
    regs: RegisterFile,
    base_types: Vec<TypeSet>,
    generation: u64,
    pc: u32,
    max_sp: u32,
}

impl FrameState {
    /// Canonical state at function entry; `base_types` covers args then locals
    pub fn new(nargs: u32, nlocals: u32, base_types: Vec<TypeSet>, max_depth: u32) -> Self {
        let mut entries: Vec<FrameEntry> = base_types.iter().copied().map(FrameEntry::in_memory).collect();
        entries.resize(
            (nargs + nlocals + max_depth + 1) as usize,
            FrameEntry::in_memory(TypeSet::unknown()),
        );
        Self {
            nargs,
            nlocals,
            entries,
            sp: nargs + nlocals,
            regs: RegisterFile::new(),
            base_types,
            generation: 0,
            pc: 0,
            max_sp: nargs + nlocals,
        }
    }

    // ------------------------------------------------------------------
    // Layout
    // ------------------------------------------------------------------

    /// First operand-stack slot
    pub fn stack_base(&self) -> u32 {
        self.nargs + self.nlocals
    }

    /// Next free stack slot
    pub fn sp(&self) -> u32 {
        self.sp
    }

    /// Highest stack pointer reached so far
    pub fn max_sp(&self) -> u32 {
        self.max_sp
    }

    /// Operand stack depth
    pub fn depth(&self) -> u32 {
        self.sp - self.stack_base()
    }

    /// Slot of an argument
    pub fn arg_slot(&self, arg: ArgIndex) -> FrameSlot {
        FrameSlot(arg.index() as u32)
    }

    /// Slot of a local
    pub fn local_slot(&self, local: LocalIndex) -> FrameSlot {
        FrameSlot(self.nargs + local.index() as u32)
    }

    /// The `n`th slot from the top, `peek(1)` being the top
    pub fn peek(&self, n: u32) -> FrameSlot {
        FrameSlot(self.sp - n)
    }

    /// Register allocation state
    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    /// Counter bumped whenever a bound register may change meaning
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Bytecode pc reported in errors
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
    }

    fn invariant(&self, detail: impl Into<String>) -> JitError {
        JitError::InvariantViolation {
            pc: self.pc as usize,
            detail: detail.into(),
        }
    }

    fn entry(&self, slot: FrameSlot) -> &FrameEntry {
        &self.entries[slot.index()]
    }

    fn entry_mut(&mut self, slot: FrameSlot) -> &mut FrameEntry {
        &mut self.entries[slot.index()]
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// The slot holding the value `slot` denotes
    pub fn backing(&self, slot: FrameSlot) -> FrameSlot {
        self.entry(slot).copy_of.unwrap_or(slot)
    }

    /// Is `slot` a copy of a lower slot
    pub fn is_copy(&self, slot: FrameSlot) -> bool {
        self.entry(slot).copy_of.is_some()
    }

    /// Slots above `slot` that copy it
    pub fn copies_of(&self, slot: FrameSlot) -> Vec<FrameSlot> {
        (slot.0 + 1..self.sp)
            .map(FrameSlot)
            .filter(|&s| self.entry(s).copy_of == Some(slot))
            .collect()
    }

    /// Both slots denote the same storage
    pub fn have_same_backing(&self, a: FrameSlot, b: FrameSlot) -> bool {
        self.backing(a) == self.backing(b)
    }

    /// Statically known type
    pub fn known_type(&self, slot: FrameSlot) -> KnownType {
        self.entry(self.backing(slot)).ty
    }

    /// Is the type known
    pub fn is_type_known(&self, slot: FrameSlot) -> bool {
        self.known_type(slot) != KnownType::Unknown
    }

    /// Constant value, if known
    pub fn constant(&self, slot: FrameSlot) -> Option<Value> {
        self.entry(self.backing(slot)).constant
    }

    /// Constant int32, if known
    pub fn int32_constant(&self, slot: FrameSlot) -> Option<i32> {
        match self.constant(slot) {
            Some(Value::Int32(i)) => Some(i),
            _ => None,
        }
    }

    /// Oracle facts for the value
    pub fn types(&self, slot: FrameSlot) -> TypeSet {
        let entry = self.entry(self.backing(slot));
        match entry.ty {
            KnownType::Unknown => entry.types,
            ty if entry.types.is_unknown() => TypeSet::for_known(ty),
            _ => entry.types,
        }
    }

    /// Literal the slot is being initialized as
    pub fn init_target(&self, slot: FrameSlot) -> Option<InitTarget> {
        self.entry(self.backing(slot)).init
    }

    /// Register holding the payload, if any
    pub fn data_reg(&self, slot: FrameSlot) -> Option<Reg> {
        match self.entry(self.backing(slot)).data {
            DataLoc::Gpr(r) => Some(r),
            _ => None,
        }
    }

    /// Register holding the tag, if any
    pub fn tag_reg(&self, slot: FrameSlot) -> Option<Reg> {
        match self.entry(self.backing(slot)).tag {
            TagLoc::Gpr(r) => Some(r),
            TagLoc::Memory => None,
        }
    }

    /// Is the slot's own memory up to date
    pub fn is_synced(&self, slot: FrameSlot) -> bool {
        self.entry(slot).is_synced()
    }

    /// Record that the slot holds a literal under construction
    pub fn set_init_target(&mut self, slot: FrameSlot, init: Option<InitTarget>) {
        let backing = self.backing(slot);
        self.entry_mut(backing).init = init;
    }

    /// Narrow what the oracle knows about an own entry
    pub fn set_types(&mut self, slot: FrameSlot, types: TypeSet) {
        let backing = self.backing(slot);
        self.entry_mut(backing).types = types;
    }

    /// Where the tag of a slot of unknown type can be read without a load
    pub fn tag_operand(&self, slot: FrameSlot) -> JitResult<Operand> {
        let backing = self.backing(slot);
        let entry = self.entry(backing);
        if entry.ty != KnownType::Unknown {
            return Err(self.invariant(format!("tag operand requested for a {:?} entry", entry.ty)));
        }
        Ok(match entry.tag {
            TagLoc::Gpr(reg) => Operand::Reg(reg),
            TagLoc::Memory => Operand::Tag(backing),
        })
    }

    /// Record a type that holds on every path reaching this point
    ///
    /// The tag register, if any, is released; the tag is implied from now on.
    pub fn learn_type(&mut self, slot: FrameSlot, ty: KnownType) -> JitResult<()> {
        if ty.tag().is_none() {
            return Err(self.invariant(format!("cannot learn {ty:?}")));
        }
        let backing = self.backing(slot);
        let entry = self.entry(backing).clone();
        if entry.constant.is_some() || entry.ty == ty {
            return Ok(());
        }
        if let DataLoc::Fpr(reg) = entry.data {
            return Err(self.invariant(format!("learning {ty:?} for a double held in {reg}")));
        }
        if let TagLoc::Gpr(reg) = entry.tag {
            self.regs.bind(reg, Binding::Free);
        }
        let entry = self.entry_mut(backing);
        entry.tag = TagLoc::Memory;
        entry.ty = ty;
        entry.types = TypeSet::for_known(ty);
        self.generation += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pushing and popping
    // ------------------------------------------------------------------

    fn push_entry(&mut self, entry: FrameEntry) -> FrameSlot {
        let slot = FrameSlot(self.sp);
        if self.entries.len() <= slot.index() {
            self.entries.push(entry);
        } else {
            self.entries[slot.index()] = entry;
        }
        self.sp += 1;
        self.max_sp = self.max_sp.max(self.sp);
        self.generation += 1;
        slot
    }

    /// Push a compile-time constant
    pub fn push_constant(&mut self, value: Value) -> FrameSlot {
        self.push_entry(FrameEntry::constant(value))
    }

    /// Push a value of known type whose payload is in the temp `reg`
    pub fn push_typed_payload(&mut self, ty: KnownType, reg: Reg) -> JitResult<FrameSlot> {
        if ty.tag().is_none() {
            return Err(self.invariant(format!("typed payload push of {ty:?}")));
        }
        if self.regs.binding(reg) != Binding::Temp {
            return Err(self.invariant(format!("{reg} pushed without being a temp")));
        }
        let mut entry = FrameEntry::unsynced(ty, TypeSet::for_known(ty));
        entry.data = DataLoc::Gpr(reg);
        let slot = self.push_entry(entry);
        self.regs.bind(reg, Binding::Data(slot));
        Ok(slot)
    }

    /// Push a number held in the temp FPR `reg`
    pub fn push_double(&mut self, reg: FReg) -> JitResult<FrameSlot> {
        if self.regs.fp_binding(reg) != Binding::Temp {
            return Err(self.invariant(format!("{reg} pushed without being a temp")));
        }
        let mut entry = FrameEntry::unsynced(KnownType::Double, TypeSet::for_known(KnownType::Double));
        entry.data = DataLoc::Fpr(reg);
        let slot = self.push_entry(entry);
        self.regs.bind_fp(reg, Binding::Data(slot));
        Ok(slot)
    }

    /// Push a value whose tag and payload are in temps
    ///
    /// A known non-double type releases the tag register.
    pub fn push_regs(&mut self, tag: Reg, payload: Reg, types: TypeSet) -> JitResult<FrameSlot> {
        let ty = types.known_type();
        if ty.tag().is_some() {
            self.free_reg(tag)?;
            let slot = self.push_typed_payload(ty, payload)?;
            self.entry_mut(slot).types = types;
            return Ok(slot);
        }
        for reg in [tag, payload] {
            if self.regs.binding(reg) != Binding::Temp {
                return Err(self.invariant(format!("{reg} pushed without being a temp")));
            }
        }
        let mut entry = FrameEntry::unsynced(KnownType::Unknown, types);
        entry.data = DataLoc::Gpr(payload);
        entry.tag = TagLoc::Gpr(tag);
        let slot = self.push_entry(entry);
        self.regs.bind(payload, Binding::Data(slot));
        self.regs.bind(tag, Binding::Type(slot));
        Ok(slot)
    }

    /// Push a value that is already in its slot's memory
    pub fn push_synced(&mut self, types: TypeSet) -> FrameSlot {
        self.push_entry(FrameEntry::in_memory(types))
    }

    /// Push a copy of `of`
    pub fn push_copy(&mut self, of: FrameSlot) -> FrameSlot {
        let backing = self.backing(of);
        match self.entry(backing).constant {
            Some(value) => self.push_constant(value),
            None => self.push_entry(FrameEntry::copy(backing)),
        }
    }

    /// Push a copy of a local
    pub fn push_local(&mut self, local: LocalIndex) -> FrameSlot {
        self.push_copy(self.local_slot(local))
    }

    /// Push a copy of an argument
    pub fn push_arg(&mut self, arg: ArgIndex) -> FrameSlot {
        self.push_copy(self.arg_slot(arg))
    }

    /// Duplicate the top
    pub fn dup(&mut self) -> FrameSlot {
        self.push_copy(self.peek(1))
    }

    fn release_entry_regs(&mut self, slot: FrameSlot) {
        let entry = &mut self.entries[slot.index()];
        match entry.data {
            DataLoc::Gpr(r) => self.regs.bind(r, Binding::Free),
            DataLoc::Fpr(f) => self.regs.bind_fp(f, Binding::Free),
            DataLoc::Memory => {}
        }
        if let TagLoc::Gpr(r) = entry.tag {
            self.regs.bind(r, Binding::Free);
        }
        entry.data = DataLoc::Memory;
        entry.tag = TagLoc::Memory;
    }

    /// Pop the top
    pub fn pop(&mut self) {
        let slot = self.peek(1);
        self.release_entry_regs(slot);
        self.sp -= 1;
        self.generation += 1;
    }

    /// Pop `n` entries
    pub fn popn(&mut self, n: u32) {
        for _ in 0..n {
            self.pop();
        }
    }

    // ------------------------------------------------------------------
    // Register allocation
    // ------------------------------------------------------------------

    fn evict(&mut self, reg: Reg, masm: &mut Masm) {
        match self.regs.binding(reg) {
            Binding::Data(slot) => {
                let entry = self.entry(slot).clone();
                if !entry.data_synced {
                    masm.emit(Inst::StorePayload {
                        slot,
                        src: Operand::Reg(reg),
                    });
                }
                if let (Some(tag), false) = (entry.ty.tag(), entry.tag_synced) {
                    masm.emit(Inst::StoreTag {
                        slot,
                        src: Operand::tag(tag),
                    });
                    self.entry_mut(slot).tag_synced = true;
                }
                let entry = self.entry_mut(slot);
                entry.data = DataLoc::Memory;
                entry.data_synced = true;
            }
            Binding::Type(slot) => {
                if !self.entry(slot).tag_synced {
                    masm.emit(Inst::StoreTag {
                        slot,
                        src: Operand::Reg(reg),
                    });
                }
                let entry = self.entry_mut(slot);
                entry.tag = TagLoc::Memory;
                entry.tag_synced = true;
            }
            Binding::Free | Binding::Temp => return,
        }
        self.regs.bind(reg, Binding::Free);
        self.generation += 1;
    }

    fn evict_fp(&mut self, reg: FReg, masm: &mut Masm) {
        if let Binding::Data(slot) = self.regs.fp_binding(reg) {
            if !self.entry(slot).data_synced {
                masm.emit(Inst::StoreValue {
                    slot,
                    src: ValueSource::Double(reg),
                });
            }
            let entry = self.entry_mut(slot);
            entry.data = DataLoc::Memory;
            entry.data_synced = true;
            entry.tag_synced = true;
            self.regs.bind_fp(reg, Binding::Free);
            self.generation += 1;
        }
    }

    /// Allocate a temp GPR, spilling the least recently used one if needed
    pub fn alloc_reg(&mut self, masm: &mut Masm) -> JitResult<Reg> {
        if let Some(reg) = self.regs.take_free() {
            return Ok(reg);
        }
        let victim = self
            .regs
            .eviction_candidate()
            .ok_or(JitError::RegisterExhausted { pc: self.pc as usize })?;
        self.evict(victim, masm);
        self.regs.bind(victim, Binding::Temp);
        Ok(victim)
    }

    /// Allocate a temp FPR, spilling if needed
    pub fn alloc_fp_reg(&mut self, masm: &mut Masm) -> JitResult<FReg> {
        if let Some(reg) = self.regs.take_free_fp() {
            return Ok(reg);
        }
        let victim = self
            .regs
            .fp_eviction_candidate()
            .ok_or(JitError::RegisterExhausted { pc: self.pc as usize })?;
        self.evict_fp(victim, masm);
        self.regs.bind_fp(victim, Binding::Temp);
        Ok(victim)
    }

    /// Claim a specific GPR as a temp, spilling what it holds
    pub fn take_reg(&mut self, reg: Reg, masm: &mut Masm) -> JitResult<Reg> {
        match self.regs.binding(reg) {
            Binding::Temp => return Err(self.invariant(format!("{reg} is already a temp"))),
            _ if self.regs.is_pinned(reg) => {
                return Err(self.invariant(format!("{reg} is pinned")));
            }
            Binding::Data(_) | Binding::Type(_) => self.evict(reg, masm),
            Binding::Free => {}
        }
        self.regs.bind(reg, Binding::Temp);
        Ok(reg)
    }

    /// Release a temp GPR
    pub fn free_reg(&mut self, reg: Reg) -> JitResult<()> {
        if self.regs.binding(reg) != Binding::Temp {
            return Err(self.invariant(format!("freeing {reg}, which is not a temp")));
        }
        self.regs.bind(reg, Binding::Free);
        Ok(())
    }

    /// Release a temp FPR
    pub fn free_fp_reg(&mut self, reg: FReg) -> JitResult<()> {
        if self.regs.fp_binding(reg) != Binding::Temp {
            return Err(self.invariant(format!("freeing {reg}, which is not a temp")));
        }
        self.regs.bind_fp(reg, Binding::Free);
        Ok(())
    }

    /// Keep `reg` from being spilled; returns false if it already was pinned
    pub fn pin_reg(&mut self, reg: Reg) -> bool {
        self.regs.pin(reg)
    }

    /// Undo [`FrameState::pin_reg`]
    pub fn unpin_reg(&mut self, reg: Reg) {
        self.regs.unpin(reg);
    }

    // ------------------------------------------------------------------
    // Loading values into registers
    // ------------------------------------------------------------------

    /// Register bound to the payload of `slot`, loading it if needed
    ///
    /// The register stays owned by the tracker.
    pub fn temp_reg_for_data(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<Reg> {
        let backing = self.backing(slot);
        let entry = self.entry(backing);
        if entry.constant.is_some() {
            return Err(self.invariant("payload register requested for a constant"));
        }
        match entry.data {
            DataLoc::Gpr(r) => {
                self.regs.touch(r);
                Ok(r)
            }
            DataLoc::Fpr(_) => Err(self.invariant("payload register requested for a double in an FPR")),
            DataLoc::Memory => {
                let reg = self.alloc_reg(masm)?;
                masm.mov(reg, Operand::Payload(backing));
                self.regs.bind(reg, Binding::Data(backing));
                self.entry_mut(backing).data = DataLoc::Gpr(reg);
                Ok(reg)
            }
        }
    }

    /// Register bound to the tag of `slot`, loading it if needed
    pub fn temp_reg_for_type(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<Reg> {
        let backing = self.backing(slot);
        let entry = self.entry(backing);
        if entry.ty != KnownType::Unknown {
            return Err(self.invariant("tag register requested for a known type"));
        }
        match entry.tag {
            TagLoc::Gpr(r) => {
                self.regs.touch(r);
                Ok(r)
            }
            TagLoc::Memory => {
                let reg = self.alloc_reg(masm)?;
                masm.mov(reg, Operand::Tag(backing));
                self.regs.bind(reg, Binding::Type(backing));
                self.entry_mut(backing).tag = TagLoc::Gpr(reg);
                Ok(reg)
            }
        }
    }

    /// FPR bound to a slot known to be a number, loading it if needed
    pub fn temp_fp_reg_for_data(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<FReg> {
        let backing = self.backing(slot);
        let entry = self.entry(backing);
        if entry.constant.is_some() || entry.ty != KnownType::Double {
            return Err(self.invariant(format!("FPR requested for a {:?} entry", entry.ty)));
        }
        match entry.data {
            DataLoc::Fpr(f) => {
                self.regs.touch_fp(f);
                Ok(f)
            }
            DataLoc::Gpr(r) => Err(self.invariant(format!("double held in {r}"))),
            DataLoc::Memory => {
                let reg = self.alloc_fp_reg(masm)?;
                masm.emit(Inst::LoadDouble { dst: reg, slot: backing });
                self.regs.bind_fp(reg, Binding::Data(backing));
                self.entry_mut(backing).data = DataLoc::Fpr(reg);
                Ok(reg)
            }
        }
    }

    fn with_pinned<T>(
        &mut self,
        reg: Reg,
        f: impl FnOnce(&mut Self) -> JitResult<T>,
    ) -> JitResult<T> {
        let newly = self.regs.pin(reg);
        let result = f(self);
        if newly {
            self.regs.unpin(reg);
        }
        result
    }

    /// Temp holding a copy of the payload
    pub fn copy_data_into_reg(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<Reg> {
        let backing = self.backing(slot);
        let entry = self.entry(backing).clone();
        if let Some(value) = entry.constant {
            let reg = self.alloc_reg(masm)?;
            masm.mov(reg, Operand::Imm(value.to_raw().payload as i64));
            return Ok(reg);
        }
        match entry.data {
            DataLoc::Gpr(src) => {
                let reg = self.with_pinned(src, |frame| frame.alloc_reg(masm))?;
                masm.mov(reg, Operand::Reg(src));
                Ok(reg)
            }
            DataLoc::Memory => {
                let reg = self.alloc_reg(masm)?;
                masm.mov(reg, Operand::Payload(backing));
                Ok(reg)
            }
            DataLoc::Fpr(_) => Err(self.invariant("payload copy requested for a double in an FPR")),
        }
    }

    /// Temp holding a copy of the tag
    pub fn copy_type_into_reg(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<Reg> {
        let backing = self.backing(slot);
        let entry = self.entry(backing).clone();
        if let Some(value) = entry.constant {
            let reg = self.alloc_reg(masm)?;
            masm.mov(reg, Operand::tag(value.tag()));
            return Ok(reg);
        }
        if let Some(tag) = entry.ty.tag() {
            let reg = self.alloc_reg(masm)?;
            masm.mov(reg, Operand::tag(tag));
            return Ok(reg);
        }
        match entry.tag {
            TagLoc::Gpr(src) => {
                let reg = self.with_pinned(src, |frame| frame.alloc_reg(masm))?;
                masm.mov(reg, Operand::Reg(src));
                Ok(reg)
            }
            TagLoc::Memory if entry.ty == KnownType::Unknown || entry.data == DataLoc::Memory => {
                let reg = self.alloc_reg(masm)?;
                masm.mov(reg, Operand::Tag(backing));
                Ok(reg)
            }
            TagLoc::Memory => Err(self.invariant("tag copy requested for a double in an FPR")),
        }
    }

    /// Temp FPR holding a slot known to be a number at run time
    ///
    /// Entries of unknown type must already have passed a number guard; they
    /// are synced and reloaded so the int32 case converts.
    pub fn copy_number_into_fp_reg(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<FReg> {
        let backing = self.backing(slot);
        let entry = self.entry(backing).clone();
        if let Some(value) = entry.constant {
            let Some(n) = value.as_f64() else {
                return Err(self.invariant("non-number constant loaded as a double"));
            };
            let reg = self.alloc_fp_reg(masm)?;
            masm.emit(Inst::MoveDoubleImm { dst: reg, value: n });
            return Ok(reg);
        }
        match (entry.ty, entry.data) {
            (KnownType::Int32, _) => {
                let src = self.temp_reg_for_data(backing, masm)?;
                let reg = self.with_pinned(src, |frame| frame.alloc_fp_reg(masm))?;
                masm.emit(Inst::ConvertInt32ToDouble { dst: reg, src });
                Ok(reg)
            }
            (_, DataLoc::Fpr(src)) => {
                let pinned = self.regs.pin_fp(src);
                let reg = self.alloc_fp_reg(masm);
                if pinned {
                    self.regs.unpin_fp(src);
                }
                let reg = reg?;
                masm.emit(Inst::MoveDouble { dst: reg, src });
                Ok(reg)
            }
            _ => {
                self.sync_entry(backing, masm);
                let reg = self.alloc_fp_reg(masm)?;
                masm.emit(Inst::LoadDouble { dst: reg, slot: backing });
                Ok(reg)
            }
        }
    }

    /// Registers describing the value of `slot`, pinned until
    /// [`FrameState::unpin_source`]
    pub fn value_source(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<ValueSource> {
        let backing = self.backing(slot);
        if let Some(value) = self.entry(backing).constant {
            return Ok(ValueSource::Constant(value.to_raw()));
        }
        match self.entry(backing).ty {
            KnownType::Double => {
                let reg = self.temp_fp_reg_for_data(backing, masm)?;
                self.regs.pin_fp(reg);
                Ok(ValueSource::Double(reg))
            }
            KnownType::Unknown => {
                let tag = self.temp_reg_for_type(backing, masm)?;
                self.regs.pin(tag);
                let payload = self.temp_reg_for_data(backing, masm)?;
                self.regs.pin(payload);
                Ok(ValueSource::Regs { tag, payload })
            }
            ty => {
                let payload = self.temp_reg_for_data(backing, masm)?;
                self.regs.pin(payload);
                let tag = ty.tag().unwrap_or(Tag::Undefined);
                Ok(ValueSource::Typed { tag, payload })
            }
        }
    }

    /// Unpin the registers of a [`ValueSource`]
    pub fn unpin_source(&mut self, source: ValueSource) {
        match source {
            ValueSource::Constant(_) => {}
            ValueSource::Typed { payload, .. } => {
                self.regs.unpin(payload);
            }
            ValueSource::Regs { tag, payload } => {
                self.regs.unpin(tag);
                self.regs.unpin(payload);
            }
            ValueSource::Double(reg) => {
                self.regs.unpin_fp(reg);
            }
        }
    }

    // ------------------------------------------------------------------
    // Copies and stores
    // ------------------------------------------------------------------

    /// Turn the copy `slot` into an entry owning its value
    fn materialize_copy(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<()> {
        let Some(backing) = self.entry(slot).copy_of else {
            return Ok(());
        };
        let source = self.entry(backing).clone();
        let synced = self.entry(slot).is_synced();
        let mut owned = FrameEntry {
            init: source.init,
            ..FrameEntry::unsynced(source.ty, source.types)
        };
        if synced {
            owned.data_synced = true;
            owned.tag_synced = true;
        } else {
            match source.ty {
                KnownType::Double => {
                    let reg = self.copy_number_into_fp_reg(backing, masm)?;
                    self.regs.bind_fp(reg, Binding::Data(slot));
                    owned.data = DataLoc::Fpr(reg);
                }
                KnownType::Unknown => {
                    let tag = self.copy_type_into_reg(backing, masm)?;
                    let payload = self.with_pinned(tag, |frame| frame.copy_data_into_reg(backing, masm))?;
                    self.regs.bind(tag, Binding::Type(slot));
                    self.regs.bind(payload, Binding::Data(slot));
                    owned.tag = TagLoc::Gpr(tag);
                    owned.data = DataLoc::Gpr(payload);
                }
                _ => {
                    let payload = self.copy_data_into_reg(backing, masm)?;
                    self.regs.bind(payload, Binding::Data(slot));
                    owned.data = DataLoc::Gpr(payload);
                }
            }
        }
        *self.entry_mut(slot) = owned;
        self.generation += 1;
        Ok(())
    }

    /// Move the value of `slot` into its lowest copy so `slot` can be
    /// overwritten; the other copies follow
    pub fn uncopy(&mut self, slot: FrameSlot, masm: &mut Masm) -> JitResult<()> {
        let copies = self.copies_of(slot);
        let Some((&first, rest)) = copies.split_first() else {
            return Ok(());
        };
        self.materialize_copy(first, masm)?;
        for &copy in rest {
            self.entry_mut(copy).copy_of = Some(first);
        }
        Ok(())
    }

    /// Make two operands own distinct storage when they alias
    pub fn separate_binary_entries(&mut self, lhs: FrameSlot, rhs: FrameSlot, masm: &mut Masm) -> JitResult<()> {
        if self.have_same_backing(lhs, rhs) && self.constant(rhs).is_none() && self.is_copy(rhs) {
            self.materialize_copy(rhs, masm)?;
        }
        Ok(())
    }

    /// Give `to` the value and registers of the own entry `from`, leaving
    /// `from` a copy of `to`
    fn transfer(&mut self, from: FrameSlot, to: FrameSlot, masm: &mut Masm) -> JitResult<()> {
        if to >= from {
            return Err(self.invariant(format!("transfer from {from:?} up to {to:?}")));
        }
        let source = self.entry(from).clone();
        let mut owned = FrameEntry {
            init: source.init,
            ..FrameEntry::unsynced(source.ty, source.types)
        };
        match source.ty {
            KnownType::Double => {
                let reg = self.temp_fp_reg_for_data(from, masm)?;
                self.regs.bind_fp(reg, Binding::Data(to));
                owned.data = DataLoc::Fpr(reg);
            }
            KnownType::Unknown => {
                let tag = self.temp_reg_for_type(from, masm)?;
                let payload = self.with_pinned(tag, |frame| frame.temp_reg_for_data(from, masm))?;
                self.regs.bind(tag, Binding::Type(to));
                self.regs.bind(payload, Binding::Data(to));
                owned.tag = TagLoc::Gpr(tag);
                owned.data = DataLoc::Gpr(payload);
            }
            _ => {
                let payload = self.temp_reg_for_data(from, masm)?;
                self.regs.bind(payload, Binding::Data(to));
                owned.data = DataLoc::Gpr(payload);
            }
        }
        let from_synced = self.entry(from).is_synced();
        *self.entry_mut(to) = owned;
        let mut copy = FrameEntry::copy(to);
        copy.data_synced = from_synced;
        copy.tag_synced = from_synced;
        *self.entry_mut(from) = copy;
        for slot in from.0 + 1..self.sp {
            let entry = &mut self.entries[slot as usize];
            if entry.copy_of == Some(from) {
                entry.copy_of = Some(to);
            }
        }
        self.generation += 1;
        Ok(())
    }

    /// `dest = src` for a `dest` below `src`
    pub fn store_to(&mut self, dest: FrameSlot, src: FrameSlot, masm: &mut Masm) -> JitResult<()> {
        if self.backing(src) == dest {
            return Ok(());
        }
        if dest >= src {
            return Err(self.invariant(format!("store from {src:?} down to {dest:?}")));
        }
        self.uncopy(dest, masm)?;
        self.release_entry_regs(dest);
        self.generation += 1;

        if let Some(value) = self.constant(src) {
            *self.entry_mut(dest) = FrameEntry::constant(value);
            return Ok(());
        }
        let backing = self.backing(src);
        if backing < dest {
            *self.entry_mut(dest) = FrameEntry::copy(backing);
            return Ok(());
        }
        self.transfer(backing, dest, masm)
    }

    /// Store the top into a local, optionally popping it
    pub fn store_local(&mut self, local: LocalIndex, popped: bool, masm: &mut Masm) -> JitResult<()> {
        self.store_to(self.local_slot(local), self.peek(1), masm)?;
        if popped {
            self.pop();
        }
        Ok(())
    }

    /// Store the top into an argument, optionally popping it
    pub fn store_arg(&mut self, arg: ArgIndex, popped: bool, masm: &mut Masm) -> JitResult<()> {
        self.store_to(self.arg_slot(arg), self.peek(1), masm)?;
        if popped {
            self.pop();
        }
        Ok(())
    }

    /// Replace the `n` entries below the top with the top
    pub fn shimmy(&mut self, n: u32, masm: &mut Masm) -> JitResult<()> {
        self.store_to(self.peek(n + 1), self.peek(1), masm)?;
        self.popn(n);
        Ok(())
    }

    /// Exchange the top two entries
    pub fn swap(&mut self, masm: &mut Masm) -> JitResult<()> {
        self.push_copy(self.peek(2));
        self.store_to(self.peek(3), self.peek(2), masm)?;
        self.store_to(self.peek(2), self.peek(1), masm)?;
        self.pop();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Syncing
    // ------------------------------------------------------------------

    /// Emit the stores that bring `slot`'s memory up to date
    fn emit_entry_sync(&self, slot: FrameSlot, masm: &mut Masm) {
        let entry = self.entry(slot);
        if entry.is_synced() {
            return;
        }
        if let Some(backing) = entry.copy_of {
            self.emit_copy_sync(slot, backing, masm);
            return;
        }
        if let Some(value) = entry.constant {
            masm.emit(Inst::StoreValue {
                slot,
                src: ValueSource::Constant(value.to_raw()),
            });
            return;
        }
        if let DataLoc::Fpr(reg) = entry.data {
            masm.emit(Inst::StoreValue {
                slot,
                src: ValueSource::Double(reg),
            });
            return;
        }
        if !entry.data_synced
            && let DataLoc::Gpr(reg) = entry.data
        {
            masm.emit(Inst::StorePayload {
                slot,
                src: Operand::Reg(reg),
            });
        }
        if !entry.tag_synced {
            match (entry.ty.tag(), entry.tag) {
                (Some(tag), _) => masm.emit(Inst::StoreTag {
                    slot,
                    src: Operand::tag(tag),
                }),
                (None, TagLoc::Gpr(reg)) => masm.emit(Inst::StoreTag {
                    slot,
                    src: Operand::Reg(reg),
                }),
                (None, TagLoc::Memory) => {}
            }
        }
    }

    fn emit_copy_sync(&self, slot: FrameSlot, backing: FrameSlot, masm: &mut Masm) {
        let source = self.entry(backing);
        let payload = match source.data {
            DataLoc::Fpr(reg) => {
                masm.emit(Inst::StoreValue {
                    slot,
                    src: ValueSource::Double(reg),
                });
                return;
            }
            DataLoc::Gpr(reg) => Operand::Reg(reg),
            DataLoc::Memory => Operand::Payload(backing),
        };
        let tag = match (source.ty.tag(), source.tag) {
            (Some(tag), _) => Operand::tag(tag),
            (None, TagLoc::Gpr(reg)) => Operand::Reg(reg),
            (None, TagLoc::Memory) => Operand::Tag(backing),
        };
        if payload == Operand::Payload(backing) && tag == Operand::Tag(backing) {
            masm.emit(Inst::CopySlot { dst: slot, src: backing });
        } else {
            masm.emit(Inst::StorePayload { slot, src: payload });
            masm.emit(Inst::StoreTag { slot, src: tag });
        }
    }

    /// Sync one slot and record it as synced
    pub fn sync_entry(&mut self, slot: FrameSlot, masm: &mut Masm) {
        self.emit_entry_sync(slot, masm);
        let entry = self.entry_mut(slot);
        entry.data_synced = true;
        entry.tag_synced = true;
    }

    /// Emit stores for every unsynced slot without changing the model
    ///
    /// Used for exits: the fast path continues with the same state.
    pub fn sync_to(&self, masm: &mut Masm) {
        for slot in 0..self.sp {
            self.emit_entry_sync(FrameSlot(slot), masm);
        }
    }

    /// Sync every slot and record it
    pub fn sync_all(&mut self, masm: &mut Masm) {
        for slot in 0..self.sp {
            self.sync_entry(FrameSlot(slot), masm);
        }
    }

    fn ensure_no_temps(&self) -> JitResult<()> {
        let temps = self.regs.temp_count();
        let pinned = self.regs.pinned_count();
        if temps > 0 || pinned > 0 {
            return Err(self.invariant(format!("{temps} temps and {pinned} pinned registers live")));
        }
        Ok(())
    }

    /// Sync everything and drop every register binding, ahead of a call
    /// that clobbers all registers
    pub fn sync_and_kill(&mut self, masm: &mut Masm) -> JitResult<()> {
        self.ensure_no_temps()?;
        self.sync_all(masm);
        for slot in 0..self.sp {
            let entry = self.entry_mut(FrameSlot(slot));
            entry.data = DataLoc::Memory;
            entry.tag = TagLoc::Memory;
        }
        self.regs.reset();
        self.generation += 1;
        Ok(())
    }

    /// Sync everything ahead of a branch; registers stay bound
    pub fn sync_for_branch(&mut self, masm: &mut Masm) {
        self.sync_all(masm);
    }

    /// Sync everything and return to the canonical state
    pub fn sync_and_forget_everything(&mut self, masm: &mut Masm) -> JitResult<()> {
        self.ensure_no_temps()?;
        self.sync_all(masm);
        let depth = self.depth();
        self.reset_canonical(depth);
        Ok(())
    }

    /// Canonical state with `depth` stack entries: everything in memory,
    /// args and locals typed by the oracle, stack entries unknown
    pub fn reset_canonical(&mut self, depth: u32) {
        self.regs.reset();
        let base = self.stack_base();
        for slot in 0..base {
            let types = self.base_types[slot as usize];
            self.entries[slot as usize] = FrameEntry::in_memory(types);
        }
        self.sp = base + depth;
        for slot in base..self.sp {
            if self.entries.len() <= slot as usize {
                self.entries.push(FrameEntry::in_memory(TypeSet::unknown()));
            } else {
                self.entries[slot as usize] = FrameEntry::in_memory(TypeSet::unknown());
            }
        }
        self.generation += 1;
    }

    /// Reload every register binding from memory
    ///
    /// Emitted at the end of slow paths, where a stub may have clobbered
    /// registers but left memory up to date.
    pub fn merge_to(&self, masm: &mut Masm) {
        for slot in (0..self.sp).map(FrameSlot) {
            let entry = self.entry(slot);
            if entry.copy_of.is_some() || entry.constant.is_some() {
                continue;
            }
            match entry.data {
                DataLoc::Gpr(reg) => masm.mov(reg, Operand::Payload(slot)),
                DataLoc::Fpr(reg) => masm.emit(Inst::LoadDouble { dst: reg, slot }),
                DataLoc::Memory => {}
            }
            if let TagLoc::Gpr(reg) = entry.tag {
                masm.mov(reg, Operand::Tag(slot));
            }
        }
    }

    /// Verify that no temps or pins leaked and every binding is mirrored
    pub fn check_clean(&self) -> JitResult<()> {
        self.ensure_no_temps()?;
        for slot in (0..self.sp).map(FrameSlot) {
            let entry = self.entry(slot);
            if let Some(backing) = entry.copy_of
                && (backing >= slot || self.entry(backing).copy_of.is_some())
            {
                return Err(self.invariant(format!("{slot:?} copies {backing:?}")));
            }
            if let DataLoc::Gpr(reg) = entry.data
                && self.regs.binding(reg) != Binding::Data(slot)
            {
                return Err(self.invariant(format!("{reg} does not hold the payload of {slot:?}")));
            }
            if let DataLoc::Fpr(reg) = entry.data
                && self.regs.fp_binding(reg) != Binding::Data(slot)
            {
                return Err(self.invariant(format!("{reg} does not hold {slot:?}")));
            }
            if let TagLoc::Gpr(reg) = entry.tag
                && self.regs.binding(reg) != Binding::Type(slot)
            {
                return Err(self.invariant(format!("{reg} does not hold the tag of {slot:?}")));
            }
        }
        Ok(())
    }
}
