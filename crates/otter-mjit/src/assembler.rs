//! Instruction set of the abstract target machine and the two-stream
//! code buffer the compiler emits into.
//!
//! Compiled code is laid out as a fast stream (inline guarded paths) followed
//! by a slow stream (out-of-line syncs and stub calls). Jumps are emitted
//! unlinked and resolved when the buffer is finalized.
//!
//! # Machine model
//!
//! ```text
//!   GPR r0..r7    64-bit words; r0 carries stub results
//!   FPR f0..f3    doubles; f3 is the conversion temp
//!   frame memory  one {tag, payload} word pair per slot:
//!                 [args][locals][operand stack]
//! ```
//!
//! 32-bit operations read the low half of a word and zero-extend their
//! result.

use otter_mjit_runtime::{ObjectClass, ObjectField, RawValue, Tag};
use serde::{Deserialize, Serialize};

use crate::ic::IcId;
use crate::regs::{FReg, Reg, RegMask};
use crate::stubs::StubKind;

/// Index of a frame slot: arguments, then locals, then the operand stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameSlot(pub u32);

impl FrameSlot {
    /// Slot index as a usize
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Absolute instruction offset in finalized code
pub type CodeOffset = u32;

/// Placeholder target of a jump that has not been linked yet
pub const UNLINKED: CodeOffset = CodeOffset::MAX;

// ---------------------------------------------------------------------------
// Operands
// ---------------------------------------------------------------------------

/// Source operand of integer instructions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operand {
    /// Register contents
    Reg(Reg),
    /// Immediate word
    Imm(i64),
    /// Tag word of a frame slot
    Tag(FrameSlot),
    /// Payload word of a frame slot
    Payload(FrameSlot),
}

impl Operand {
    /// Immediate holding a tag
    pub const fn tag(tag: Tag) -> Self {
        Operand::Imm(tag as i64)
    }
}

/// Where a value to be stored comes from
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ValueSource {
    /// Known at compile time
    Constant(RawValue),
    /// Known tag, payload in a register
    Typed {
        /// Statically known tag
        tag: Tag,
        /// Register holding the payload
        payload: Reg,
    },
    /// Tag and payload both in registers
    Regs {
        /// Register holding the tag
        tag: Reg,
        /// Register holding the payload
        payload: Reg,
    },
    /// A double in an FPR
    Double(FReg),
}

/// Key of an element access that has already been proven int32
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Int32Key {
    /// Constant index
    Constant(i32),
    /// Register holding the index
    Reg(Reg),
}

/// 32-bit integer comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Cond {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// signed `<`
    LessThan,
    /// signed `<=`
    LessThanOrEqual,
    /// signed `>`
    GreaterThan,
    /// signed `>=`
    GreaterThanOrEqual,
    /// unsigned `<`
    Below,
    /// unsigned `<=`
    BelowOrEqual,
    /// unsigned `>`
    Above,
    /// unsigned `>=`
    AboveOrEqual,
}

impl Cond {
    /// Evaluate on the low 32 bits of both words
    pub fn eval(self, lhs: u64, rhs: u64) -> bool {
        let (ul, ur) = (lhs as u32, rhs as u32);
        let (sl, sr) = (ul as i32, ur as i32);
        match self {
            Cond::Equal => ul == ur,
            Cond::NotEqual => ul != ur,
            Cond::LessThan => sl < sr,
            Cond::LessThanOrEqual => sl <= sr,
            Cond::GreaterThan => sl > sr,
            Cond::GreaterThanOrEqual => sl >= sr,
            Cond::Below => ul < ur,
            Cond::BelowOrEqual => ul <= ur,
            Cond::Above => ul > ur,
            Cond::AboveOrEqual => ul >= ur,
        }
    }

    /// Condition that holds exactly when `self` does not
    pub const fn invert(self) -> Self {
        match self {
            Cond::Equal => Cond::NotEqual,
            Cond::NotEqual => Cond::Equal,
            Cond::LessThan => Cond::GreaterThanOrEqual,
            Cond::LessThanOrEqual => Cond::GreaterThan,
            Cond::GreaterThan => Cond::LessThanOrEqual,
            Cond::GreaterThanOrEqual => Cond::LessThan,
            Cond::Below => Cond::AboveOrEqual,
            Cond::BelowOrEqual => Cond::Above,
            Cond::Above => Cond::BelowOrEqual,
            Cond::AboveOrEqual => Cond::Below,
        }
    }

    /// Condition with the operands exchanged
    pub const fn commute(self) -> Self {
        match self {
            Cond::Equal | Cond::NotEqual => self,
            Cond::LessThan => Cond::GreaterThan,
            Cond::LessThanOrEqual => Cond::GreaterThanOrEqual,
            Cond::GreaterThan => Cond::LessThan,
            Cond::GreaterThanOrEqual => Cond::LessThanOrEqual,
            Cond::Below => Cond::Above,
            Cond::BelowOrEqual => Cond::AboveOrEqual,
            Cond::Above => Cond::Below,
            Cond::AboveOrEqual => Cond::BelowOrEqual,
        }
    }
}

/// Bit test outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TestCond {
    /// `(lhs & mask) == 0`
    Zero,
    /// `(lhs & mask) != 0`
    NonZero,
}

/// Double comparison; the unordered forms are also true when either side is NaN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoubleCond {
    /// ordered `==`
    Equal,
    /// ordered `!=`
    NotEqual,
    /// ordered `<`
    LessThan,
    /// ordered `<=`
    LessThanOrEqual,
    /// ordered `>`
    GreaterThan,
    /// ordered `>=`
    GreaterThanOrEqual,
    /// `==` or NaN
    EqualOrUnordered,
    /// `!=` or NaN
    NotEqualOrUnordered,
    /// `<` or NaN
    LessThanOrUnordered,
    /// `<=` or NaN
    LessThanOrEqualOrUnordered,
    /// `>` or NaN
    GreaterThanOrUnordered,
    /// `>=` or NaN
    GreaterThanOrEqualOrUnordered,
}

impl DoubleCond {
    /// Evaluate
    pub fn eval(self, lhs: f64, rhs: f64) -> bool {
        let unordered = lhs.is_nan() || rhs.is_nan();
        match self {
            DoubleCond::Equal => lhs == rhs,
            DoubleCond::NotEqual => !unordered && lhs != rhs,
            DoubleCond::LessThan => lhs < rhs,
            DoubleCond::LessThanOrEqual => lhs <= rhs,
            DoubleCond::GreaterThan => lhs > rhs,
            DoubleCond::GreaterThanOrEqual => lhs >= rhs,
            DoubleCond::EqualOrUnordered => unordered || lhs == rhs,
            DoubleCond::NotEqualOrUnordered => lhs != rhs,
            DoubleCond::LessThanOrUnordered => unordered || lhs < rhs,
            DoubleCond::LessThanOrEqualOrUnordered => unordered || lhs <= rhs,
            DoubleCond::GreaterThanOrUnordered => unordered || lhs > rhs,
            DoubleCond::GreaterThanOrEqualOrUnordered => unordered || lhs >= rhs,
        }
    }

    /// Condition that holds exactly when `self` does not, NaN included
    pub const fn invert(self) -> Self {
        match self {
            DoubleCond::Equal => DoubleCond::NotEqualOrUnordered,
            DoubleCond::NotEqual => DoubleCond::EqualOrUnordered,
            DoubleCond::LessThan => DoubleCond::GreaterThanOrEqualOrUnordered,
            DoubleCond::LessThanOrEqual => DoubleCond::GreaterThanOrUnordered,
            DoubleCond::GreaterThan => DoubleCond::LessThanOrEqualOrUnordered,
            DoubleCond::GreaterThanOrEqual => DoubleCond::LessThanOrUnordered,
            DoubleCond::EqualOrUnordered => DoubleCond::NotEqual,
            DoubleCond::NotEqualOrUnordered => DoubleCond::Equal,
            DoubleCond::LessThanOrUnordered => DoubleCond::GreaterThanOrEqual,
            DoubleCond::LessThanOrEqualOrUnordered => DoubleCond::GreaterThan,
            DoubleCond::GreaterThanOrUnordered => DoubleCond::LessThanOrEqual,
            DoubleCond::GreaterThanOrEqualOrUnordered => DoubleCond::LessThan,
        }
    }
}

/// 32-bit ALU operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AluOp {
    /// wrapping add
    Add,
    /// wrapping subtract
    Sub,
    /// and
    And,
    /// or
    Or,
    /// xor
    Xor,
    /// shift left by `src & 31`
    Shl,
    /// arithmetic shift right by `src & 31`
    Sar,
    /// logical shift right by `src & 31`
    Shr,
}

impl AluOp {
    /// Apply to 32-bit operands
    pub fn apply(self, lhs: u32, rhs: u32) -> u32 {
        match self {
            AluOp::Add => lhs.wrapping_add(rhs),
            AluOp::Sub => lhs.wrapping_sub(rhs),
            AluOp::And => lhs & rhs,
            AluOp::Or => lhs | rhs,
            AluOp::Xor => lhs ^ rhs,
            AluOp::Shl => lhs << (rhs & 31),
            AluOp::Sar => ((lhs as i32) >> (rhs & 31)) as u32,
            AluOp::Shr => lhs >> (rhs & 31),
        }
    }
}

/// Arithmetic operations that can overflow-check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckedOp {
    /// signed add
    Add,
    /// signed subtract
    Sub,
}

/// Double ALU operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DoubleOp {
    /// `+`
    Add,
    /// `-`
    Sub,
}

// ---------------------------------------------------------------------------
// Instructions
// ---------------------------------------------------------------------------

/// One machine instruction
///
/// Branch forms jump to `target` when their condition holds and fall through
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Inst {
    /// `dst = src`
    Move { dst: Reg, src: Operand },
    /// Write a slot's tag word
    StoreTag { slot: FrameSlot, src: Operand },
    /// Write a slot's payload word
    StorePayload { slot: FrameSlot, src: Operand },
    /// Write a whole value into a slot
    StoreValue { slot: FrameSlot, src: ValueSource },
    /// Copy a whole slot
    CopySlot { dst: FrameSlot, src: FrameSlot },
    /// Load a numeric slot as a double, converting int32 payloads
    LoadDouble { dst: FReg, slot: FrameSlot },
    /// `dst = value`
    MoveDoubleImm { dst: FReg, value: f64 },
    /// `dst = src`
    MoveDouble { dst: FReg, src: FReg },
    /// Reinterpret a payload word as a double
    MoveBitsToDouble { dst: FReg, src: Reg },
    /// Signed int32 to double
    ConvertInt32ToDouble { dst: FReg, src: Reg },
    /// Unsigned int32 to double
    ConvertUint32ToDouble { dst: FReg, src: Reg },
    /// `dst = dst op src`
    AluDouble { op: DoubleOp, dst: FReg, src: FReg },
    /// `dst = 0.0`
    ZeroDouble { dst: FReg },
    /// `dst = dst op src` on 32 bits
    Alu32 { op: AluOp, dst: Reg, src: Operand },
    /// `dst = dst op src`, jumping on signed overflow with `dst` unchanged
    BranchAlu32 { op: CheckedOp, dst: Reg, src: Operand, target: CodeOffset },
    /// `dst = !dst` on 32 bits
    Not32 { dst: Reg },
    /// `dst = cond(lhs, rhs) as u32`
    Set32 { cond: Cond, lhs: Reg, rhs: Operand, dst: Reg },
    /// `dst = cond(lhs, rhs) as u32`
    SetDouble { cond: DoubleCond, lhs: FReg, rhs: FReg, dst: Reg },
    /// Jump if `cond(lhs, rhs)`
    Branch32 { cond: Cond, lhs: Operand, rhs: Operand, target: CodeOffset },
    /// Jump on a bit test
    BranchTest32 { cond: TestCond, lhs: Reg, mask: Operand, target: CodeOffset },
    /// Jump if `cond(lhs, rhs)`
    BranchDouble { cond: DoubleCond, lhs: FReg, rhs: FReg, target: CodeOffset },
    /// Truncate toward zero; jump if the double is NaN or outside int32 range
    BranchTruncateDoubleToInt32 { src: FReg, dst: Reg, target: CodeOffset },
    /// Jump unless the double is exactly an int32 other than `-0`
    BranchConvertDoubleToInt32 { src: FReg, dst: Reg, target: CodeOffset },
    /// Read a per-object word
    LoadObjField { dst: Reg, obj: Reg, field: ObjectField },
    /// Write a per-object word
    StoreObjField { obj: Reg, field: ObjectField, src: Operand },
    /// Jump if the object's class compares `cond` to `class`
    BranchObjClass { cond: Cond, obj: Reg, class: ObjectClass, target: CodeOffset },
    /// Jump if `cond(obj.field, key)` on unsigned 32 bits
    BranchArrayExtent {
        field: ObjectField,
        obj: Reg,
        key: Int32Key,
        cond: Cond,
        target: CodeOffset,
    },
    /// Jump if the element at `key` is the hole
    BranchElementHole { obj: Reg, key: Int32Key, target: CodeOffset },
    /// Read an element; `tag` is `None` when the caller knows it
    LoadElement { obj: Reg, key: Int32Key, tag: Option<Reg>, payload: Reg },
    /// Read an element of an array believed packed; a hole jumps to `target`
    /// without touching the result registers
    LoadPackedElement {
        obj: Reg,
        key: Int32Key,
        tag: Option<Reg>,
        payload: Reg,
        target: CodeOffset,
    },
    /// Write an element
    StoreElement { obj: Reg, key: Int32Key, value: ValueSource },
    /// Read a named slot
    LoadNamedSlot { obj: Reg, slot: u32, tag: Option<Reg>, payload: Reg },
    /// Write a named slot
    StoreNamedSlot { obj: Reg, slot: u32, value: ValueSource },
    /// Jump if the array-prototype epoch moved past `expected`
    BranchPrototypeEpoch { expected: u64, target: CodeOffset },
    /// Call a runtime stub on the values at `sp - uses .. sp`
    CallStub { stub: StubKind, sp: u32, arg: i64 },
    /// Call the slow path of an inline cache
    CallIcStub { ic: IcId, sp: u32, preserve: RegMask },
    /// Unconditional jump
    Jump { target: CodeOffset },
    /// Leave compiled code with a value
    Return { value: ValueSource },
}

impl Inst {
    /// Jump target field, for branch instructions
    pub fn target_mut(&mut self) -> Option<&mut CodeOffset> {
        match self {
            Inst::BranchAlu32 { target, .. }
            | Inst::Branch32 { target, .. }
            | Inst::BranchTest32 { target, .. }
            | Inst::BranchDouble { target, .. }
            | Inst::BranchTruncateDoubleToInt32 { target, .. }
            | Inst::BranchConvertDoubleToInt32 { target, .. }
            | Inst::BranchObjClass { target, .. }
            | Inst::BranchArrayExtent { target, .. }
            | Inst::BranchElementHole { target, .. }
            | Inst::LoadPackedElement { target, .. }
            | Inst::BranchPrototypeEpoch { target, .. }
            | Inst::Jump { target } => Some(target),
            _ => None,
        }
    }

    /// Jump target, for branch instructions
    pub fn target(&self) -> Option<CodeOffset> {
        let mut copy = *self;
        copy.target_mut().map(|t| *t)
    }

    /// Does this instruction call into the runtime
    pub fn is_call(&self) -> bool {
        matches!(self, Inst::CallStub { .. } | Inst::CallIcStub { .. })
    }
}

// ---------------------------------------------------------------------------
// Streams, labels and jumps
// ---------------------------------------------------------------------------

/// Which stream an instruction lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stream {
    /// Inline code
    Fast,
    /// Out-of-line code
    Slow,
}

/// A position in one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Stream
    pub stream: Stream,
    /// Instruction index within the stream
    pub offset: u32,
}

/// A branch instruction awaiting its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[must_use = "an unlinked jump fails finalization"]
pub struct JumpRef {
    /// Stream
    pub stream: Stream,
    /// Instruction index within the stream
    pub index: u32,
}

/// What a jump is linked to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    /// A label in either stream
    Label(Label),
    /// The fast-path code of a bytecode pc
    Pc(u32),
}

/// One instruction stream
#[derive(Debug, Clone)]
pub struct Masm {
    stream: Stream,
    insts: Vec<Inst>,
}

impl Masm {
    /// Empty stream
    pub fn new(stream: Stream) -> Self {
        Self {
            stream,
            insts: Vec::new(),
        }
    }

    /// Which stream this is
    pub fn stream(&self) -> Stream {
        self.stream
    }

    /// Instructions emitted so far
    pub fn insts(&self) -> &[Inst] {
        &self.insts
    }

    /// Number of instructions emitted so far
    pub fn len(&self) -> u32 {
        self.insts.len() as u32
    }

    /// Nothing emitted yet
    pub fn is_empty(&self) -> bool {
        self.insts.is_empty()
    }

    /// The current position
    pub fn label(&self) -> Label {
        Label {
            stream: self.stream,
            offset: self.len(),
        }
    }

    /// Append an instruction
    pub fn emit(&mut self, inst: Inst) {
        self.insts.push(inst);
    }

    /// Append a branch instruction and hand back its jump
    pub fn emit_jump(&mut self, inst: Inst) -> JumpRef {
        debug_assert!(inst.target().is_some(), "{inst:?} is not a branch");
        let index = self.len();
        self.insts.push(inst);
        JumpRef {
            stream: self.stream,
            index,
        }
    }

    /// `jmp`
    pub fn jump(&mut self) -> JumpRef {
        self.emit_jump(Inst::Jump { target: UNLINKED })
    }

    /// `if cond(lhs, rhs) jmp`
    pub fn branch32(&mut self, cond: Cond, lhs: Operand, rhs: Operand) -> JumpRef {
        self.emit_jump(Inst::Branch32 {
            cond,
            lhs,
            rhs,
            target: UNLINKED,
        })
    }

    /// `if (lhs & mask) cond 0 jmp`
    pub fn branch_test32(&mut self, cond: TestCond, lhs: Reg, mask: Operand) -> JumpRef {
        self.emit_jump(Inst::BranchTest32 {
            cond,
            lhs,
            mask,
            target: UNLINKED,
        })
    }

    /// `if cond(lhs, rhs) jmp` on doubles
    pub fn branch_double(&mut self, cond: DoubleCond, lhs: FReg, rhs: FReg) -> JumpRef {
        self.emit_jump(Inst::BranchDouble {
            cond,
            lhs,
            rhs,
            target: UNLINKED,
        })
    }

    /// Overflow-checked `dst op= src`
    pub fn branch_alu32(&mut self, op: CheckedOp, dst: Reg, src: Operand) -> JumpRef {
        self.emit_jump(Inst::BranchAlu32 {
            op,
            dst,
            src,
            target: UNLINKED,
        })
    }

    /// `dst = src`
    pub fn mov(&mut self, dst: Reg, src: Operand) {
        self.emit(Inst::Move { dst, src });
    }

    /// `dst op= src` on 32 bits
    pub fn alu32(&mut self, op: AluOp, dst: Reg, src: Operand) {
        self.emit(Inst::Alu32 { op, dst, src });
    }
}

/// Both streams plus the pending jump links
#[derive(Debug, Clone)]
pub struct CodeBuffer {
    /// Inline stream
    pub fast: Masm,
    /// Out-of-line stream
    pub slow: Masm,
    links: Vec<(JumpRef, LinkTarget)>,
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeBuffer {
    /// Empty buffer
    pub fn new() -> Self {
        Self {
            fast: Masm::new(Stream::Fast),
            slow: Masm::new(Stream::Slow),
            links: Vec::new(),
        }
    }

    /// Stream by id
    pub fn stream_mut(&mut self, stream: Stream) -> &mut Masm {
        match stream {
            Stream::Fast => &mut self.fast,
            Stream::Slow => &mut self.slow,
        }
    }

    /// Link `jump` to `label`
    pub fn link(&mut self, jump: JumpRef, label: Label) {
        self.links.push((jump, LinkTarget::Label(label)));
    }

    /// Link `jump` to the fast-path code of bytecode `pc`
    pub fn link_pc(&mut self, jump: JumpRef, pc: u32) {
        self.links.push((jump, LinkTarget::Pc(pc)));
    }

    /// Link every jump in `jumps` to `label`
    pub fn link_all(&mut self, jumps: impl IntoIterator<Item = JumpRef>, label: Label) {
        for jump in jumps {
            self.link(jump, label);
        }
    }

    /// Recorded links
    pub fn links(&self) -> &[(JumpRef, LinkTarget)] {
        &self.links
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cond_signedness() {
        let minus_one = (-1i32) as u32 as u64;
        assert!(Cond::LessThan.eval(minus_one, 0));
        assert!(!Cond::Below.eval(minus_one, 0));
        assert!(Cond::Above.eval(minus_one, 0));
        assert_eq!(Cond::BelowOrEqual.invert(), Cond::Above);
        assert_eq!(Cond::LessThan.commute(), Cond::GreaterThan);
    }

    #[test]
    fn test_double_cond_inversion_covers_nan() {
        let conds = [
            DoubleCond::Equal,
            DoubleCond::NotEqual,
            DoubleCond::LessThan,
            DoubleCond::LessThanOrEqual,
            DoubleCond::GreaterThan,
            DoubleCond::GreaterThanOrEqual,
        ];
        let samples = [(1.0, 2.0), (2.0, 2.0), (3.0, 2.0), (f64::NAN, 1.0), (1.0, f64::NAN)];
        for cond in conds {
            for (a, b) in samples {
                assert_ne!(cond.eval(a, b), cond.invert().eval(a, b), "{cond:?} {a} {b}");
                assert_eq!(cond.invert().invert(), cond);
            }
        }
    }

    #[test]
    fn test_shift_counts_are_masked() {
        assert_eq!(AluOp::Shl.apply(3, 33), 6);
        assert_eq!(AluOp::Sar.apply((-8i32) as u32, 1), (-4i32) as u32);
        assert_eq!(AluOp::Shr.apply((-8i32) as u32, 32), (-8i32) as u32);
    }

    #[test]
    fn test_jumps_are_recorded_per_stream() {
        let mut buf = CodeBuffer::new();
        buf.fast.mov(Reg(1), Operand::Imm(3));
        let j = buf.fast.jump();
        assert_eq!(j, JumpRef { stream: Stream::Fast, index: 1 });
        let target = buf.slow.label();
        buf.link(j, target);
        assert_eq!(buf.links().len(), 1);
        assert_eq!(buf.fast.insts()[1].target(), Some(UNLINKED));
    }
}
